//! Language model capability.
//!
//! The routing core only sees [`LanguageModel`]: `process` turns text into
//! the text to deliver, `decide_route` picks a target channel among the
//! allowed candidates. [`FailoverModel`] puts a fallback behind a primary
//! and is what the gateway actually calls.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::ModelEndpoint;
use crate::error::ModelError;

/// Consecutive failures before the primary is swapped for the fallback.
pub const MAX_FAILURES: u32 = 3;
/// How long the fallback serves before the primary is tried again.
pub const RECOVERY_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Why the model is being called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    /// Ordinary conversation to relay.
    #[default]
    Conversation,
    /// System text (reports, prompts) to phrase for a user.
    Review,
    /// Cross-checking another model's output.
    Supervision,
}

/// What the model knows about a piece of text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelContext {
    pub purpose: Purpose,
    pub source: String,
    pub user: Option<String>,
    pub room: Option<String>,
    /// Literal text the answer must contain unchanged.
    pub preserve: Option<String>,
}

impl ModelContext {
    pub fn new(purpose: Purpose, source: impl Into<String>) -> Self {
        Self {
            purpose,
            source: source.into(),
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user: Option<&str>) -> Self {
        self.user = user.map(str::to_string);
        self
    }

    pub fn with_room(mut self, room: Option<&str>) -> Self {
        self.room = room.map(str::to_string);
        self
    }

    pub fn with_preserve(mut self, preserve: Option<&str>) -> Self {
        self.preserve = preserve.map(str::to_string);
        self
    }
}

/// An opaque text-in, text-out model with a health signal.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;

    /// Turns `text` into the text to deliver.
    async fn process(&self, text: &str, context: &ModelContext) -> Result<String, ModelError>;

    /// Picks one of `candidates` for `text`. `None` leaves the choice to the
    /// caller's default route.
    async fn decide_route(
        &self,
        text: &str,
        candidates: &[String],
    ) -> Result<Option<String>, ModelError>;

    /// Whether the model currently looks usable.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// Returns text unchanged and never picks a route.
#[derive(Debug, Clone, Default)]
pub struct PassthroughModel;

#[async_trait]
impl LanguageModel for PassthroughModel {
    fn name(&self) -> &str {
        "passthrough"
    }

    async fn process(&self, text: &str, _context: &ModelContext) -> Result<String, ModelError> {
        Ok(text.to_string())
    }

    async fn decide_route(
        &self,
        _text: &str,
        _candidates: &[String],
    ) -> Result<Option<String>, ModelError> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
}

impl ChatMessage {
    fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: Some(content.into()),
        }
    }

    fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: Some(content.into()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

fn system_prompt(context: &ModelContext) -> String {
    let mut prompt = match context.purpose {
        Purpose::Conversation => String::from(
            "You relay messages between instant-messaging users and the SDF COM chat \
             service. Answer with the text to deliver and nothing else.",
        ),
        Purpose::Review => String::from(
            "Rephrase this gateway notice for a chat user. Keep it short and keep every \
             id, command and room name exactly as written.",
        ),
        Purpose::Supervision => String::from(
            "You check another assistant's output for hallucinations: claimed actions \
             that did not happen, contradictions with the actual result, invented facts. \
             Answer with JSON only: \
             {\"is_valid\": bool, \"issues\": [string], \"confidence\": number}",
        ),
    };
    if let Some(user) = &context.user {
        prompt.push_str(&format!("\nSender: {} on {}.", user, context.source));
    }
    if let Some(room) = &context.room {
        prompt.push_str(&format!("\nCurrent COM room: {}.", room));
    }
    if let Some(keep) = &context.preserve {
        prompt.push_str(&format!("\nThe answer must contain \"{}\" verbatim.", keep));
    }
    prompt
}

/// OpenAI-compatible chat completions endpoint.
#[derive(Clone)]
pub struct ChatCompletionsModel {
    client: reqwest::Client,
    endpoint: ModelEndpoint,
    api_key: Option<String>,
    healthy: Arc<AtomicBool>,
}

impl std::fmt::Debug for ChatCompletionsModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCompletionsModel")
            .field("endpoint", &self.endpoint)
            .field("healthy", &self.healthy.load(Ordering::Relaxed))
            .finish()
    }
}

impl ChatCompletionsModel {
    /// Builds a client, reading the API key from the endpoint's variable.
    pub fn from_endpoint(endpoint: ModelEndpoint) -> Result<Self, ModelError> {
        let api_key = match &endpoint.api_key_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                ModelError::Configuration(format!("Missing {} environment variable", var))
            })?),
            None => None,
        };
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key,
            healthy: Arc::new(AtomicBool::new(true)),
        })
    }

    fn url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.endpoint.base_url.trim_end_matches('/')
        )
    }

    async fn chat(&self, messages: Vec<ChatMessage>) -> Result<String, ModelError> {
        let result = self.send(messages).await;
        self.healthy.store(result.is_ok(), Ordering::Relaxed);
        result
    }

    async fn send(&self, messages: Vec<ChatMessage>) -> Result<String, ModelError> {
        let request = ChatRequest {
            model: self.endpoint.model.clone(),
            messages,
            temperature: Some(0.3),
        };
        trace!(model = %self.endpoint.model, "sending chat request");

        let mut builder = self
            .client
            .post(self.url())
            .header("Content-Type", "application/json")
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ModelError::Request(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ModelError::Request(format!(
                "{} API error {}: {}",
                self.endpoint.name, status, text
            )));
        }

        let response: ChatResponse = response
            .json()
            .await
            .map_err(|e| ModelError::Response(format!("Failed to parse response: {}", e)))?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ModelError::Response("empty completion".into()))
    }
}

#[async_trait]
impl LanguageModel for ChatCompletionsModel {
    fn name(&self) -> &str {
        &self.endpoint.name
    }

    async fn process(&self, text: &str, context: &ModelContext) -> Result<String, ModelError> {
        self.chat(vec![
            ChatMessage::system(system_prompt(context)),
            ChatMessage::user(text),
        ])
        .await
    }

    async fn decide_route(
        &self,
        text: &str,
        candidates: &[String],
    ) -> Result<Option<String>, ModelError> {
        if candidates.len() < 2 {
            return Ok(candidates.first().cloned());
        }
        let answer = self
            .chat(vec![
                ChatMessage::system(format!(
                    "Choose the channel this message should be delivered to. \
                     Answer with exactly one of: {}.",
                    candidates.join(", ")
                )),
                ChatMessage::user(text),
            ])
            .await?;
        let answer = answer.trim_matches(|c: char| c.is_whitespace() || c == '"' || c == '.');
        Ok(candidates.iter().find(|c| c.as_str() == answer).cloned())
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }
}

/// Health of one model behind a [`FailoverModel`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelStatus {
    pub name: String,
    pub healthy: bool,
    pub failures: u32,
}

/// Snapshot of a [`FailoverModel`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailoverStatus {
    pub current: String,
    pub using_fallback: bool,
    pub primary: ModelStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<ModelStatus>,
}

#[derive(Debug, Default)]
struct Health {
    healthy: bool,
    failures: u32,
}

#[derive(Debug)]
struct FailoverState {
    primary: Health,
    fallback: Health,
    using_fallback: bool,
    switched_at: Option<Instant>,
}

enum Call<'a> {
    Process(&'a str, &'a ModelContext),
    Route(&'a str, &'a [String]),
}

enum Answer {
    Text(String),
    Route(Option<String>),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Slot {
    Primary,
    Fallback,
}

/// A primary model with an optional fallback.
///
/// Every call is bounded by a timeout. A failed primary call is retried on
/// the fallback at once; after [`MAX_FAILURES`] consecutive primary
/// failures the fallback becomes the first choice until
/// [`RECOVERY_INTERVAL`] has passed, when the primary is tried again.
/// Fails with [`ModelError::Unavailable`] only when no model answered.
pub struct FailoverModel {
    primary: Arc<dyn LanguageModel>,
    fallback: Option<Arc<dyn LanguageModel>>,
    timeout: Duration,
    max_failures: u32,
    recovery_interval: Duration,
    state: Mutex<FailoverState>,
}

impl FailoverModel {
    pub fn new(primary: Arc<dyn LanguageModel>) -> Self {
        Self {
            primary,
            fallback: None,
            timeout: Duration::from_secs(30),
            max_failures: MAX_FAILURES,
            recovery_interval: RECOVERY_INTERVAL,
            state: Mutex::new(FailoverState {
                primary: Health {
                    healthy: true,
                    failures: 0,
                },
                fallback: Health {
                    healthy: true,
                    failures: 0,
                },
                using_fallback: false,
                switched_at: None,
            }),
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn LanguageModel>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_failures(mut self, max: u32) -> Self {
        self.max_failures = max.max(1);
        self
    }

    pub fn with_recovery_interval(mut self, interval: Duration) -> Self {
        self.recovery_interval = interval;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FailoverState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current failover state.
    pub fn status(&self) -> FailoverStatus {
        let state = self.lock();
        let current = if state.using_fallback {
            self.fallback.as_ref().map(|f| f.name()).unwrap_or("none")
        } else {
            self.primary.name()
        };
        FailoverStatus {
            current: current.to_string(),
            using_fallback: state.using_fallback,
            primary: ModelStatus {
                name: self.primary.name().to_string(),
                healthy: state.primary.healthy,
                failures: state.primary.failures,
            },
            fallback: self.fallback.as_ref().map(|f| ModelStatus {
                name: f.name().to_string(),
                healthy: state.fallback.healthy,
                failures: state.fallback.failures,
            }),
        }
    }

    fn order(&self) -> Vec<Slot> {
        let mut state = self.lock();
        if self.fallback.is_none() {
            return vec![Slot::Primary];
        }
        if state.using_fallback {
            let due = state
                .switched_at
                .map(|at| at.elapsed() >= self.recovery_interval)
                .unwrap_or(true);
            if due {
                info!(model = %self.primary.name(), "retrying primary model");
                state.switched_at = Some(Instant::now());
                return vec![Slot::Primary, Slot::Fallback];
            }
            return vec![Slot::Fallback, Slot::Primary];
        }
        vec![Slot::Primary, Slot::Fallback]
    }

    fn model(&self, slot: Slot) -> Option<&Arc<dyn LanguageModel>> {
        match slot {
            Slot::Primary => Some(&self.primary),
            Slot::Fallback => self.fallback.as_ref(),
        }
    }

    fn record(&self, slot: Slot, ok: bool) {
        let mut state = self.lock();
        let health = match slot {
            Slot::Primary => &mut state.primary,
            Slot::Fallback => &mut state.fallback,
        };
        health.healthy = ok;
        health.failures = if ok { 0 } else { health.failures + 1 };
        let primary_failures = state.primary.failures;

        match (slot, ok) {
            (Slot::Primary, true) if state.using_fallback => {
                info!(model = %self.primary.name(), "primary model recovered");
                state.using_fallback = false;
                state.switched_at = None;
            }
            (Slot::Primary, false)
                if !state.using_fallback
                    && self.fallback.is_some()
                    && primary_failures >= self.max_failures =>
            {
                warn!(
                    model = %self.primary.name(),
                    failures = primary_failures,
                    "switching to fallback model"
                );
                state.using_fallback = true;
                state.switched_at = Some(Instant::now());
            }
            _ => {}
        }
    }

    async fn invoke(&self, model: &dyn LanguageModel, call: &Call<'_>) -> Result<Answer, ModelError> {
        let fut = async {
            match call {
                Call::Process(text, context) => model.process(text, context).await.map(Answer::Text),
                Call::Route(text, candidates) => model
                    .decide_route(text, candidates)
                    .await
                    .map(Answer::Route),
            }
        };
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ModelError::Timeout(self.timeout)),
        }
    }

    async fn call(&self, call: Call<'_>) -> Result<Answer, ModelError> {
        let mut errors = Vec::new();
        for slot in self.order() {
            let Some(model) = self.model(slot) else {
                continue;
            };
            match self.invoke(model.as_ref(), &call).await {
                Ok(answer) => {
                    self.record(slot, true);
                    return Ok(answer);
                }
                Err(e) => {
                    warn!(model = %model.name(), error = %e, "model call failed");
                    self.record(slot, false);
                    errors.push(format!("{}: {}", model.name(), e));
                }
            }
        }
        Err(ModelError::Unavailable(errors.join("; ")))
    }
}

#[async_trait]
impl LanguageModel for FailoverModel {
    fn name(&self) -> &str {
        "failover"
    }

    async fn process(&self, text: &str, context: &ModelContext) -> Result<String, ModelError> {
        match self.call(Call::Process(text, context)).await? {
            Answer::Text(text) => Ok(text),
            Answer::Route(_) => Err(ModelError::Response("unexpected routing answer".into())),
        }
    }

    async fn decide_route(
        &self,
        text: &str,
        candidates: &[String],
    ) -> Result<Option<String>, ModelError> {
        debug!(candidates = ?candidates, "deciding route");
        match self.call(Call::Route(text, candidates)).await? {
            Answer::Route(target) => Ok(target),
            Answer::Text(_) => Err(ModelError::Response("unexpected text answer".into())),
        }
    }

    fn is_healthy(&self) -> bool {
        let state = self.lock();
        state.primary.healthy || (self.fallback.is_some() && state.fallback.healthy)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Scripted model: fails while `failing` is set, otherwise prefixes its
    /// name to the input.
    pub struct ScriptedModel {
        name: String,
        pub failing: AtomicBool,
        pub calls: AtomicUsize,
        delay: Option<Duration>,
    }

    impl ScriptedModel {
        pub fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                failing: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
                delay: None,
            }
        }

        pub fn failing(name: &str) -> Self {
            let m = Self::new(name);
            m.failing.store(true, Ordering::SeqCst);
            m
        }

        pub fn slow(name: &str, delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::new(name)
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        fn name(&self) -> &str {
            &self.name
        }

        async fn process(&self, text: &str, _context: &ModelContext) -> Result<String, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(ModelError::Request(format!("{} is down", self.name)));
            }
            Ok(format!("{}: {}", self.name, text))
        }

        async fn decide_route(
            &self,
            _text: &str,
            candidates: &[String],
        ) -> Result<Option<String>, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(ModelError::Request(format!("{} is down", self.name)));
            }
            Ok(candidates.last().cloned())
        }
    }

    fn ctx() -> ModelContext {
        ModelContext::new(Purpose::Conversation, "feishu")
    }

    #[tokio::test]
    async fn test_passthrough() {
        let model = PassthroughModel;
        assert_eq!(model.process("hi", &ctx()).await.unwrap(), "hi");
        assert_eq!(
            model.decide_route("hi", &["a".to_string()]).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_primary_failure_falls_back_for_that_call() {
        let primary = Arc::new(ScriptedModel::failing("kimi"));
        let fallback = Arc::new(ScriptedModel::new("qwen"));
        let model = FailoverModel::new(primary.clone()).with_fallback(fallback.clone());

        assert_eq!(model.process("hi", &ctx()).await.unwrap(), "qwen: hi");
        let status = model.status();
        assert!(!status.using_fallback);
        assert_eq!(status.primary.failures, 1);
        assert!(!status.primary.healthy);
    }

    #[tokio::test]
    async fn test_switches_after_max_failures_and_recovers() {
        let primary = Arc::new(ScriptedModel::failing("kimi"));
        let fallback = Arc::new(ScriptedModel::new("qwen"));
        let model = FailoverModel::new(primary.clone())
            .with_fallback(fallback.clone())
            .with_recovery_interval(Duration::from_millis(50));

        for _ in 0..MAX_FAILURES {
            model.process("hi", &ctx()).await.unwrap();
        }
        let status = model.status();
        assert!(status.using_fallback);
        assert_eq!(status.current, "qwen");

        // While on the fallback the primary is not consulted.
        let before = primary.calls();
        model.process("hi", &ctx()).await.unwrap();
        assert_eq!(primary.calls(), before);

        primary.failing.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(model.process("hi", &ctx()).await.unwrap(), "kimi: hi");
        assert!(!model.status().using_fallback);
    }

    #[tokio::test]
    async fn test_all_down_is_unavailable() {
        let model = FailoverModel::new(Arc::new(ScriptedModel::failing("kimi")))
            .with_fallback(Arc::new(ScriptedModel::failing("qwen")));
        let err = model.process("hi", &ctx()).await.unwrap_err();
        assert!(matches!(err, ModelError::Unavailable(_)));
        assert!(!model.is_healthy());
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let model = FailoverModel::new(Arc::new(ScriptedModel::slow(
            "kimi",
            Duration::from_millis(200),
        )))
        .with_timeout(Duration::from_millis(20));
        let err = model.process("hi", &ctx()).await.unwrap_err();
        assert!(matches!(err, ModelError::Unavailable(ref m) if m.contains("timed out")));
        assert_eq!(model.status().primary.failures, 1);
    }

    #[tokio::test]
    async fn test_route_goes_through_failover() {
        let model = FailoverModel::new(Arc::new(ScriptedModel::failing("kimi")))
            .with_fallback(Arc::new(ScriptedModel::new("qwen")));
        let candidates = vec!["sdf_com".to_string(), "feishu".to_string()];
        assert_eq!(
            model.decide_route("hi", &candidates).await.unwrap(),
            Some("feishu".to_string())
        );
    }

    #[test]
    fn test_system_prompt_mentions_preserved_text() {
        let context = ModelContext::new(Purpose::Review, "feishu").with_preserve(Some("cf-1"));
        assert!(system_prompt(&context).contains("\"cf-1\" verbatim"));
    }

    #[test]
    fn test_missing_api_key_is_configuration_error() {
        let err = ChatCompletionsModel::from_endpoint(ModelEndpoint {
            name: "kimi".into(),
            base_url: "http://localhost:1".into(),
            model: "k2".into(),
            api_key_env: Some("COMLINK_TEST_KEY_THAT_IS_NOT_SET".into()),
        })
        .unwrap_err();
        assert!(matches!(err, ModelError::Configuration(_)));
    }
}
