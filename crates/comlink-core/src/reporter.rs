//! Execution reporting.
//!
//! Every dispatched command ends in exactly one [`ExecutionReport`] sent back
//! to whoever asked for it. Reports enter the queue as review-stage messages
//! so they are phrased by the model like any other outbound text.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use comlink_models::{meta, ExecutionReport, MessageBuilder, QueueMessage, Stage};
use comlink_persistence::Journal;
use comlink_queue::MessageQueue;

use crate::error::Result;

/// Reports kept in the execution-report journal.
pub const JOURNAL_CAPACITY: usize = 100;

/// Turns command outcomes into queued reports.
pub struct Reporter {
    queue: Arc<MessageQueue>,
    journal: Option<Journal<ExecutionReport>>,
}

impl Reporter {
    pub fn new(queue: Arc<MessageQueue>) -> Self {
        Self {
            queue,
            journal: None,
        }
    }

    /// Also keeps the last [`JOURNAL_CAPACITY`] reports in `path`.
    pub fn with_journal(mut self, path: impl Into<PathBuf>) -> Self {
        self.journal = Some(Journal::new(path, JOURNAL_CAPACITY));
        self
    }

    /// Enqueues `report` as a reply to `cause`, the message that carried the
    /// command (or the inbound message that failed before one existed).
    ///
    /// The report is addressed to `report.source_channel` and comes from the
    /// channel `cause` was headed to.
    pub fn report(&self, cause: &QueueMessage, report: ExecutionReport) -> Result<QueueMessage> {
        let mut builder = MessageBuilder::derive(cause, report.to_message())
            .source(cause.target.clone())
            .target(report.source_channel.clone())
            .stage(Stage::Review)
            .user(report.source_user.clone())
            .without_metadata(meta::COMMAND)
            .without_metadata(meta::PRESERVE)
            .with_metadata(meta::REPORT, serde_json::to_value(&report)?);
        if let Some(at) = report.delivery_timestamp {
            builder = builder.with_metadata(meta::DELIVERY_TIMESTAMP, at.to_rfc3339());
        }

        let message = self.queue.enqueue(builder)?;
        info!(
            id = %message.message_id,
            report_type = ?report.report_type,
            success = report.success,
            target = %report.source_channel,
            "execution report queued"
        );
        self.record(report);
        Ok(message)
    }

    /// Journals a report without sending it anywhere.
    pub fn record(&self, report: ExecutionReport) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.append(report) {
                warn!(error = %e, "failed to journal execution report");
            }
        }
    }

    /// Journaled reports, oldest first.
    pub fn recent(&self) -> Result<Vec<ExecutionReport>> {
        match &self.journal {
            Some(journal) => Ok(journal.entries()?),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use comlink_models::{Command, Origin, ReportType};
    use comlink_persistence::QueueStore;
    use tempfile::tempdir;

    #[test]
    fn test_report_is_addressed_to_origin() {
        let dir = tempdir().unwrap();
        let queue = Arc::new(MessageQueue::new(QueueStore::new(dir.path())));
        let reporter = Reporter::new(queue.clone()).with_journal(dir.path().join("reports.json"));

        let command = Command::SendRoomMessage { text: "hi".into() };
        let cause = queue
            .enqueue(
                MessageBuilder::new("feishu", "sdf_com", "com: hi")
                    .stage(Stage::Command)
                    .user("alice")
                    .with_metadata(meta::COMMAND, serde_json::to_value(&command).unwrap()),
            )
            .unwrap();
        queue.try_dequeue().unwrap();

        let at = Utc::now();
        let report = ExecutionReport::for_command(&Origin::new("feishu", "alice"), &command, true, "")
            .with_delivery_timestamp(at);
        let message = reporter.report(&cause, report).unwrap();

        assert_eq!(message.stage, Stage::Review);
        assert_eq!(message.source, "sdf_com");
        assert_eq!(message.target, "feishu");
        assert_eq!(message.user(), Some("alice"));
        assert_eq!(message.derived_from(), Some(cause.message_id.clone()));
        assert!(message.metadata.get(meta::COMMAND).is_none());
        assert_eq!(
            message.meta_str(meta::DELIVERY_TIMESTAMP),
            Some(at.to_rfc3339().as_str())
        );

        let recent = reporter.recent().unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].report_type, ReportType::RoomMessageSent);
        assert_eq!(queue.len(), 1);
    }
}
