//! Shell command risk assessment.
//!
//! Prohibited commands are compared exactly, after whitespace is collapsed.
//! Dangerous commands are found by pattern and always need an explicit
//! confirmation, however the command was obtained.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

/// How risky a shell command is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Safe,
    Dangerous,
    Prohibited,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::Safe => "safe",
            RiskLevel::Dangerous => "dangerous",
            RiskLevel::Prohibited => "prohibited",
        };
        f.write_str(s)
    }
}

/// Commands that are rejected outright.
pub const PROHIBITED_COMMANDS: &[&str] = &[
    "rm -rf /",
    "rm -rf /*",
    "rm -rf ~",
    "rm -rf ~/",
    "rm -rf ~/*",
    ":(){ :|:& };:",
    "mkfs",
    "dd if=/dev/zero of=/dev/sda",
    "dd if=/dev/random of=/dev/sda",
    "chmod -R 777 /",
    "shutdown",
    "shutdown -h now",
    "reboot",
    "halt",
    "poweroff",
    "init 0",
];

/// A named pattern that marks a command as dangerous.
#[derive(Debug)]
pub struct DangerRule {
    pub name: &'static str,
    pub description: &'static str,
    regex: Regex,
    /// Spans removed before matching, so harmless uses do not trip the rule.
    exception: Option<Regex>,
}

impl DangerRule {
    fn new(name: &'static str, description: &'static str, pattern: &str) -> Self {
        Self {
            name,
            description,
            regex: Regex::new(pattern).expect("Invalid danger regex"),
            exception: None,
        }
    }

    fn except(mut self, pattern: &str) -> Self {
        self.exception = Some(Regex::new(pattern).expect("Invalid exception regex"));
        self
    }

    pub fn matches(&self, command: &str) -> bool {
        match &self.exception {
            Some(exception) => self.regex.is_match(&exception.replace_all(command, "")),
            None => self.regex.is_match(command),
        }
    }
}

static DANGER_RULES: LazyLock<Vec<DangerRule>> = LazyLock::new(|| {
    vec![
        DangerRule::new("rm_rf_root", "recursive delete from the root", r"(?i)rm\s+-rf\s+/"),
        DangerRule::new("rm_rf_home", "recursive delete of the home directory", r"(?i)rm\s+-rf\s+~"),
        DangerRule::new("rm_rf_glob", "recursive delete of a wildcard", r"(?i)rm\s+-rf\s+\*"),
        DangerRule::new("write_device", "redirect into a device", r">\s*/dev/")
            .except(r">\s*/dev/(?:null|stdout|stderr)\b"),
        DangerRule::new("mkfs", "format a filesystem", r"(?i)\bmkfs"),
        DangerRule::new("dd_disk", "raw disk copy", r"(?i)\bdd\s+if="),
        DangerRule::new("fork_bomb", "fork bomb", r":\(\)\s*\{\s*:\|:&\s*\}\s*;\s*:"),
        DangerRule::new("chmod_777", "world-writable permissions", r"(?i)chmod\s+(?:-R\s+)?777"),
        DangerRule::new("curl_bash", "piping a download into a shell", r"(?i)(?:curl|wget)\s+.*\|\s*(?:sudo\s+)?(?:ba|z)?sh\b"),
    ]
});

/// Dangerous command rules.
pub fn danger_rules() -> &'static [DangerRule] {
    &DANGER_RULES
}

/// Outcome of assessing one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    /// Name of the first rule that fired, for dangerous commands.
    pub rule: Option<String>,
    pub reason: Option<String>,
}

fn normalize(command: &str) -> String {
    command.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Classifies a shell command.
pub fn assess(command: &str) -> RiskAssessment {
    let normalized = normalize(command);

    if PROHIBITED_COMMANDS.contains(&normalized.as_str()) {
        return RiskAssessment {
            level: RiskLevel::Prohibited,
            rule: None,
            reason: Some("on the prohibited command list".to_string()),
        };
    }

    match danger_rules().iter().find(|r| r.matches(&normalized)) {
        Some(rule) => RiskAssessment {
            level: RiskLevel::Dangerous,
            rule: Some(rule.name.to_string()),
            reason: Some(rule.description.to_string()),
        },
        None => RiskAssessment {
            level: RiskLevel::Safe,
            rule: None,
            reason: None,
        },
    }
}
