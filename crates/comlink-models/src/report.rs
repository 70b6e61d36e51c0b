//! Execution reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::command::{Command, CommandKind, Origin};

/// What kind of outcome a report describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportType {
    RoomMessageSent,
    ShellExecuted,
    RoomSwitched,
    PrivateSent,
    Error,
}

impl ReportType {
    /// The report type for a successful command of `kind`.
    pub fn for_kind(kind: CommandKind) -> Self {
        match kind {
            CommandKind::SendRoomMessage => ReportType::RoomMessageSent,
            CommandKind::RunShellCommand => ReportType::ShellExecuted,
            CommandKind::SwitchRoom => ReportType::RoomSwitched,
            CommandKind::SendPrivateMessage => ReportType::PrivateSent,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ReportType::RoomMessageSent => "Room message sent",
            ReportType::ShellExecuted => "Shell command executed",
            ReportType::RoomSwitched => "Room switched",
            ReportType::PrivateSent => "Private message sent",
            ReportType::Error => "Command failed",
        }
    }
}

/// Feedback sent to the origin of a command once it has run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub report_type: ReportType,
    pub source_channel: String,
    pub source_user: String,
    pub command: String,
    pub success: bool,
    pub message: String,

    /// When the remote side echoed the command back, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_timestamp: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl ExecutionReport {
    /// Report for a command that ran.
    ///
    /// A failed command is typed [`ReportType::Error`] regardless of kind.
    pub fn for_command(
        origin: &Origin,
        command: &Command,
        success: bool,
        message: impl Into<String>,
    ) -> Self {
        let report_type = if success {
            ReportType::for_kind(command.kind())
        } else {
            ReportType::Error
        };
        Self {
            report_type,
            source_channel: origin.channel.clone(),
            source_user: origin.user.clone(),
            command: command.describe(),
            success,
            message: message.into(),
            delivery_timestamp: None,
            created_at: Utc::now(),
        }
    }

    /// Report for something that failed before a command could run.
    pub fn error(origin: &Origin, command: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            report_type: ReportType::Error,
            source_channel: origin.channel.clone(),
            source_user: origin.user.clone(),
            command: command.into(),
            success: false,
            message: message.into(),
            delivery_timestamp: None,
            created_at: Utc::now(),
        }
    }

    /// Attaches the remote delivery time.
    pub fn with_delivery_timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.delivery_timestamp = Some(at);
        self
    }

    /// Renders the report as plain chat text.
    pub fn to_message(&self) -> String {
        let mark = if self.success { "[ok]" } else { "[failed]" };
        let mut out = format!("{} {}: {}", mark, self.report_type.label(), self.command);
        if !self.message.is_empty() {
            out.push_str(&format!("\n{}", self.message));
        }
        if let Some(at) = self.delivery_timestamp {
            out.push_str(&format!("\n(delivered {})", at.format("%H:%M:%S")));
        }
        out
    }
}
