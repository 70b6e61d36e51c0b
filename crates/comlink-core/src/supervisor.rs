//! Out-of-band hallucination supervision.
//!
//! The routing core hands a copy of each processed exchange to
//! [`Supervisor::observe`], which never waits. A background worker checks
//! the exchange and journals a [`SupervisionRecord`]; findings are logged,
//! never fed back into a response that has already gone out.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use comlink_persistence::Journal;

use crate::model::{LanguageModel, ModelContext, Purpose};

/// Records kept in the supervision journal.
pub const JOURNAL_CAPACITY: usize = 100;
/// Exchanges waiting for review before new ones are dropped.
const BACKLOG: usize = 64;
/// Characters of each field kept in a record.
const EXCERPT: usize = 200;

/// One model exchange worth a second look.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    /// What the model was doing, e.g. `relay` or `report`.
    pub operation: String,
    pub input: String,
    pub output: String,
    /// What actually happened, when known.
    pub actual: Option<String>,
}

impl Exchange {
    pub fn new(
        operation: impl Into<String>,
        input: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            operation: operation.into(),
            input: input.into(),
            output: output.into(),
            actual: None,
        }
    }

    pub fn with_actual(mut self, actual: impl Into<String>) -> Self {
        self.actual = Some(actual.into());
        self
    }
}

/// Journaled result of checking one exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisionRecord {
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub input_data: String,
    pub ai_output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_result: Option<String>,
    pub is_valid: bool,
    #[serde(default)]
    pub issues: Vec<String>,
    pub confidence: f32,
    /// Name of the checking model, or `heuristic`.
    pub checked_by: String,
}

#[derive(Debug, Deserialize)]
struct Verdict {
    #[serde(default = "default_valid")]
    is_valid: bool,
    #[serde(default)]
    issues: Vec<String>,
    #[serde(default)]
    confidence: f32,
}

fn default_valid() -> bool {
    true
}

fn json_object() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\{.*\}").expect("Invalid verdict regex"))
}

fn excerpt(text: &str) -> String {
    text.chars().take(EXCERPT).collect()
}

/// Checks that need no model: empty answers, and answers that read as
/// success when the actual result says the command failed.
pub fn heuristic_issues(exchange: &Exchange) -> Vec<String> {
    let mut issues = Vec::new();
    if exchange.output.trim().is_empty() {
        issues.push("empty output".to_string());
    }
    if let Some(actual) = &exchange.actual {
        let failed = actual.contains("[failed]");
        let output = exchange.output.to_lowercase();
        let admits = ["fail", "error", "could not", "couldn't", "unable"]
            .iter()
            .any(|w| output.contains(w));
        if failed && !admits {
            issues.push("output does not mention the failure".to_string());
        }
    }
    issues
}

/// Sender side of the supervision channel.
#[derive(Debug, Clone)]
pub struct Supervisor {
    tx: mpsc::Sender<Exchange>,
}

impl Supervisor {
    /// Spawns the review worker.
    ///
    /// With a model, each exchange is sent to it; otherwise (or when the
    /// model fails) only [`heuristic_issues`] are applied.
    pub fn spawn(
        model: Option<Arc<dyn LanguageModel>>,
        journal: Journal<SupervisionRecord>,
        mut shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Exchange>(BACKLOG);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    exchange = rx.recv() => {
                        let Some(exchange) = exchange else { break };
                        let record = review(model.as_deref(), &exchange).await;
                        if !record.is_valid {
                            warn!(
                                operation = %record.operation,
                                issues = ?record.issues,
                                "possible hallucination"
                            );
                        }
                        if let Err(e) = journal.append(record) {
                            warn!(error = %e, "failed to journal supervision record");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("supervisor shutting down");
                            break;
                        }
                    }
                }
            }
        });
        (Self { tx }, handle)
    }

    /// Queues an exchange for review without waiting. Dropped when the
    /// backlog is full or the worker is gone.
    pub fn observe(&self, exchange: Exchange) {
        if let Err(e) = self.tx.try_send(exchange) {
            debug!(error = %e, "supervision exchange dropped");
        }
    }
}

async fn review(model: Option<&dyn LanguageModel>, exchange: &Exchange) -> SupervisionRecord {
    let mut record = SupervisionRecord {
        timestamp: Utc::now(),
        operation: exchange.operation.clone(),
        input_data: excerpt(&exchange.input),
        ai_output: excerpt(&exchange.output),
        actual_result: exchange.actual.as_deref().map(excerpt),
        is_valid: true,
        issues: Vec::new(),
        confidence: 0.5,
        checked_by: "heuristic".to_string(),
    };

    if let Some(model) = model {
        let prompt = format!(
            "Operation: {}\nUser input: {}\nAI output: {}\nActual result: {}",
            exchange.operation,
            exchange.input,
            exchange.output,
            exchange.actual.as_deref().unwrap_or("not provided")
        );
        let context = ModelContext::new(Purpose::Supervision, "supervisor");
        match model.process(&prompt, &context).await {
            Ok(answer) => {
                let verdict = json_object()
                    .find(&answer)
                    .and_then(|m| serde_json::from_str::<Verdict>(m.as_str()).ok());
                if let Some(v) = verdict {
                    record.is_valid = v.is_valid;
                    record.issues = v.issues;
                    record.confidence = v.confidence.clamp(0.0, 1.0);
                    record.checked_by = model.name().to_string();
                    return record;
                }
                debug!("unreadable supervision verdict, using heuristics");
            }
            Err(e) => debug!(error = %e, "supervisor model failed, using heuristics"),
        }
    }

    record.issues = heuristic_issues(exchange);
    record.is_valid = record.issues.is_empty();
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModelError;
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::tempdir;

    struct Verdicts(&'static str);

    #[async_trait]
    impl LanguageModel for Verdicts {
        fn name(&self) -> &str {
            "checker"
        }

        async fn process(&self, _text: &str, _context: &ModelContext) -> Result<String, ModelError> {
            Ok(self.0.to_string())
        }

        async fn decide_route(
            &self,
            _text: &str,
            _candidates: &[String],
        ) -> Result<Option<String>, ModelError> {
            Ok(None)
        }
    }

    #[test]
    fn test_heuristics() {
        let ok = Exchange::new("report", "[ok] Room switched", "Switched to hackers.");
        assert!(heuristic_issues(&ok).is_empty());

        let hidden = Exchange::new("report", "x", "All done!")
            .with_actual("[failed] Command failed: run `ls`");
        assert_eq!(heuristic_issues(&hidden).len(), 1);

        let empty = Exchange::new("relay", "hi", "  ");
        assert_eq!(heuristic_issues(&empty), vec!["empty output"]);
    }

    #[tokio::test]
    async fn test_model_verdict_is_parsed() {
        let model = Verdicts(
            "Sure. {\"is_valid\": false, \"issues\": [\"claims a send\"], \"confidence\": 0.9}",
        );
        let record = review(Some(&model), &Exchange::new("relay", "hi", "sent!")).await;
        assert!(!record.is_valid);
        assert_eq!(record.issues, vec!["claims a send"]);
        assert_eq!(record.checked_by, "checker");
    }

    #[tokio::test]
    async fn test_worker_journals_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("supervision.json");
        let (_tx, shutdown) = watch::channel(false);
        let (supervisor, handle) =
            Supervisor::spawn(None, Journal::new(&path, JOURNAL_CAPACITY), shutdown);

        supervisor.observe(Exchange::new("relay", "hi", ""));
        drop(supervisor);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        let records: Vec<SupervisionRecord> =
            Journal::new(&path, JOURNAL_CAPACITY).entries().unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].is_valid);
        assert_eq!(records[0].checked_by, "heuristic");
    }
}
