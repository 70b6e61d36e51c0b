//! Pending confirmations.
//!
//! One lock covers the whole book, so the capacity check and the insert are
//! a single step, as are the confirm, reject and expire transitions.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use comlink_models::{Command, ConfirmationId, MessageId, Origin};
use comlink_persistence::Journal;

use crate::error::{DispatchError, Result};
use crate::patterns::Intent;
use crate::routes;

/// Seconds a confirmation stays open unless the book says otherwise.
pub const CONFIRMATION_TIMEOUT_SECS: i64 = 60;
/// Maximum number of Pending confirmations, system-wide.
pub const MAX_PENDING: usize = 10;
/// Resolved confirmations kept in history.
pub const HISTORY_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationState {
    Pending,
    Confirmed,
    Rejected,
    Expired,
}

impl fmt::Display for ConfirmationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConfirmationState::Pending => "pending",
            ConfirmationState::Confirmed => "confirmed",
            ConfirmationState::Rejected => "rejected",
            ConfirmationState::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Why a command needs confirming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConfirmationReason {
    /// Natural-language input matched a fuzzy pattern.
    AmbiguousIntent { pattern: String },
    /// The shell command matched a danger rule.
    DangerousCommand { rule: String, description: String },
}

impl fmt::Display for ConfirmationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfirmationReason::AmbiguousIntent { .. } => {
                write!(f, "the request was not given as an explicit command")
            }
            ConfirmationReason::DangerousCommand { description, .. } => {
                write!(f, "the command looks dangerous ({})", description)
            }
        }
    }
}

/// What the dispatcher asks the book to open.
#[derive(Debug, Clone)]
pub struct ConfirmationRequest {
    pub origin: Origin,
    pub message_id: Option<MessageId>,
    pub original_input: String,
    pub intent: Intent,
    pub command: Command,
    pub reason: ConfirmationReason,
}

/// A command waiting for an explicit yes or no.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingConfirmation {
    pub confirmation_id: ConfirmationId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    pub origin: Origin,
    pub original_input: String,
    pub intent: Intent,
    /// The command in prefix form, e.g. `g: hackers`.
    pub suggested_command: String,
    pub command: Command,
    pub reason: ConfirmationReason,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: ConfirmationState,
}

impl PendingConfirmation {
    fn open(request: ConfirmationRequest, now: DateTime<Utc>, timeout: Duration) -> Self {
        Self {
            confirmation_id: ConfirmationId::new(),
            message_id: request.message_id,
            origin: request.origin,
            original_input: request.original_input,
            intent: request.intent,
            suggested_command: routes::render(&request.command),
            command: request.command,
            reason: request.reason,
            created_at: now,
            expires_at: now + timeout,
            state: ConfirmationState::Pending,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// The message shown to the user, with reply instructions.
    pub fn prompt(&self) -> String {
        format!(
            "Confirmation needed ({}).\n\
             You said: \"{}\"\n\
             Understood as: {}\n\
             Suggested command: `{}`\n\
             Reply \"confirm {id}\" to run it, \"reject {id}\" to drop it, \
             or \"cancel\" to drop everything you have pending. \
             Expires in {}s.",
            self.reason,
            self.original_input,
            self.intent,
            self.suggested_command,
            (self.expires_at - self.created_at).num_seconds(),
            id = self.confirmation_id,
        )
    }
}

/// A resolved confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub confirmation_id: ConfirmationId,
    pub origin: Origin,
    pub original_input: String,
    pub suggested_command: String,
    pub intent: Intent,
    pub state: ConfirmationState,
    pub resolved_at: DateTime<Utc>,
}

impl HistoryEntry {
    fn from_resolved(c: &PendingConfirmation, at: DateTime<Utc>) -> Self {
        Self {
            confirmation_id: c.confirmation_id.clone(),
            origin: c.origin.clone(),
            original_input: c.original_input.clone(),
            suggested_command: c.suggested_command.clone(),
            intent: c.intent,
            state: c.state,
            resolved_at: at,
        }
    }
}

#[derive(Debug, Default)]
struct BookState {
    pending: HashMap<ConfirmationId, PendingConfirmation>,
    history: VecDeque<HistoryEntry>,
    /// Expired entries whose owners have not been told yet.
    lapsed: Vec<PendingConfirmation>,
}

impl BookState {
    /// Removes `id`, stamping it with `state`.
    fn resolve(
        &mut self,
        id: &ConfirmationId,
        state: ConfirmationState,
        at: DateTime<Utc>,
    ) -> Option<PendingConfirmation> {
        let mut c = self.pending.remove(id)?;
        c.state = state;
        self.history.push_back(HistoryEntry::from_resolved(&c, at));
        while self.history.len() > HISTORY_CAPACITY {
            self.history.pop_front();
        }
        Some(c)
    }

    fn expire(&mut self, now: DateTime<Utc>) -> Vec<PendingConfirmation> {
        let mut expired_ids: Vec<_> = self
            .pending
            .values()
            .filter(|c| c.is_expired_at(now))
            .map(|c| (c.created_at, c.confirmation_id.clone()))
            .collect();
        expired_ids.sort();
        let expired: Vec<_> = expired_ids
            .into_iter()
            .filter_map(|(_, id)| self.resolve(&id, ConfirmationState::Expired, now))
            .collect();
        self.lapsed.extend(expired.iter().cloned());
        expired
    }
}

/// All open confirmations plus recent history.
pub struct ConfirmationBook {
    state: Mutex<BookState>,
    journal: Option<Journal<HistoryEntry>>,
    timeout: Duration,
}

impl fmt::Debug for ConfirmationBook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfirmationBook")
            .field("journal", &self.journal.as_ref().map(|j| j.path().to_path_buf()))
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Default for ConfirmationBook {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfirmationBook {
    /// In-memory book.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BookState::default()),
            journal: None,
            timeout: Duration::seconds(CONFIRMATION_TIMEOUT_SECS),
        }
    }

    /// Book that also records resolutions to a JSON journal at `path`.
    pub fn with_journal(path: impl Into<PathBuf>) -> Self {
        Self {
            journal: Some(Journal::new(path, HISTORY_CAPACITY)),
            ..Self::new()
        }
    }

    /// How long new confirmations stay open.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BookState>> {
        self.state
            .lock()
            .map_err(|e| DispatchError::LockPoisoned(e.to_string()))
    }

    fn record(&self, resolved: &[PendingConfirmation], at: DateTime<Utc>) {
        let Some(journal) = &self.journal else {
            return;
        };
        for c in resolved {
            if let Err(e) = journal.append(HistoryEntry::from_resolved(c, at)) {
                warn!(id = %c.confirmation_id, error = %e, "failed to record confirmation history");
            }
        }
    }

    /// Opens a confirmation now.
    pub fn open(&self, request: ConfirmationRequest) -> Result<PendingConfirmation> {
        self.open_at(request, Utc::now())
    }

    /// Opens a confirmation as of `now`. Expired entries are cleared first;
    /// at the cap the request fails and nothing already pending changes.
    pub fn open_at(
        &self,
        request: ConfirmationRequest,
        now: DateTime<Utc>,
    ) -> Result<PendingConfirmation> {
        let (expired, opened) = {
            let mut state = self.lock()?;
            let expired = state.expire(now);
            if state.pending.len() >= MAX_PENDING {
                drop(state);
                self.record(&expired, now);
                warn!(limit = MAX_PENDING, "confirmation cap reached");
                return Err(DispatchError::TooManyPending { limit: MAX_PENDING });
            }
            let c = PendingConfirmation::open(request, now, self.timeout);
            state.pending.insert(c.confirmation_id.clone(), c.clone());
            (expired, c)
        };
        self.record(&expired, now);
        info!(
            id = %opened.confirmation_id,
            intent = %opened.intent,
            suggested = %opened.suggested_command,
            "confirmation opened"
        );
        Ok(opened)
    }

    fn transition(
        &self,
        id: &ConfirmationId,
        to: ConfirmationState,
        now: DateTime<Utc>,
    ) -> Result<PendingConfirmation> {
        let (expired, resolved) = {
            let mut state = self.lock()?;
            let expired = state.expire(now);
            let resolved = state.resolve(id, to, now);
            (expired, resolved)
        };
        self.record(&expired, now);
        match resolved {
            Some(c) => {
                self.record(std::slice::from_ref(&c), now);
                info!(id = %id, state = %to, "confirmation resolved");
                Ok(c)
            }
            None => Err(DispatchError::ConfirmationNotPending(id.to_string())),
        }
    }

    pub fn confirm(&self, id: &ConfirmationId) -> Result<PendingConfirmation> {
        self.confirm_at(id, Utc::now())
    }

    /// Marks a Pending entry Confirmed and hands it back for execution.
    pub fn confirm_at(&self, id: &ConfirmationId, now: DateTime<Utc>) -> Result<PendingConfirmation> {
        self.transition(id, ConfirmationState::Confirmed, now)
    }

    pub fn reject(&self, id: &ConfirmationId) -> Result<PendingConfirmation> {
        self.reject_at(id, Utc::now())
    }

    pub fn reject_at(&self, id: &ConfirmationId, now: DateTime<Utc>) -> Result<PendingConfirmation> {
        self.transition(id, ConfirmationState::Rejected, now)
    }

    pub fn cancel_all(&self, origin: &Origin) -> Result<Vec<PendingConfirmation>> {
        self.cancel_all_at(origin, Utc::now())
    }

    /// Rejects every Pending entry opened by `origin`.
    pub fn cancel_all_at(
        &self,
        origin: &Origin,
        now: DateTime<Utc>,
    ) -> Result<Vec<PendingConfirmation>> {
        let (expired, cancelled) = {
            let mut state = self.lock()?;
            let expired = state.expire(now);
            let mut ids: Vec<_> = state
                .pending
                .values()
                .filter(|c| &c.origin == origin)
                .map(|c| (c.created_at, c.confirmation_id.clone()))
                .collect();
            ids.sort();
            let cancelled: Vec<_> = ids
                .into_iter()
                .filter_map(|(_, id)| state.resolve(&id, ConfirmationState::Rejected, now))
                .collect();
            (expired, cancelled)
        };
        self.record(&expired, now);
        self.record(&cancelled, now);
        debug!(
            channel = %origin.channel,
            user = %origin.user,
            count = cancelled.len(),
            "pending confirmations cancelled"
        );
        Ok(cancelled)
    }

    pub fn sweep(&self) -> Result<Vec<PendingConfirmation>> {
        self.sweep_at(Utc::now())
    }

    /// Expires every entry past its deadline, freeing its slot.
    ///
    /// Returns everything that expired since the last sweep, including
    /// entries cleared while opening or resolving others, so each owner can
    /// be told once.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> Result<Vec<PendingConfirmation>> {
        let (expired, lapsed) = {
            let mut state = self.lock()?;
            let expired = state.expire(now);
            (expired, std::mem::take(&mut state.lapsed))
        };
        self.record(&expired, now);
        if !lapsed.is_empty() {
            info!(count = lapsed.len(), "confirmations expired");
        }
        Ok(lapsed)
    }

    pub fn get(&self, id: &ConfirmationId) -> Result<Option<PendingConfirmation>> {
        Ok(self.lock()?.pending.get(id).cloned())
    }

    /// Pending entries, oldest first.
    pub fn pending(&self) -> Result<Vec<PendingConfirmation>> {
        let mut all: Vec<_> = self.lock()?.pending.values().cloned().collect();
        all.sort_by_key(|c| c.created_at);
        Ok(all)
    }

    pub fn pending_count(&self) -> Result<usize> {
        Ok(self.lock()?.pending.len())
    }

    /// Resolutions recorded since this book was created, oldest first.
    pub fn history(&self) -> Result<Vec<HistoryEntry>> {
        Ok(self.lock()?.history.iter().cloned().collect())
    }

    /// Resolutions recorded in the journal, including earlier runs.
    pub fn journal_entries(&self) -> Result<Vec<HistoryEntry>> {
        match &self.journal {
            Some(journal) => Ok(journal.entries()?),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn request(user: &str, room: &str) -> ConfirmationRequest {
        ConfirmationRequest {
            origin: Origin::new("feishu", user),
            message_id: None,
            original_input: format!("switch to the {} room", room),
            intent: Intent::RoomSwitch,
            command: Command::SwitchRoom { room: room.into() },
            reason: ConfirmationReason::AmbiguousIntent {
                pattern: "switch_room".into(),
            },
        }
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_open_sets_deadline_and_prefix_form() {
        let book = ConfirmationBook::new();
        let c = book.open_at(request("alice", "hackers"), t0()).unwrap();
        assert_eq!(c.suggested_command, "g: hackers");
        assert_eq!(c.state, ConfirmationState::Pending);
        assert_eq!(c.expires_at - c.created_at, Duration::seconds(60));
        assert!(c.confirmation_id.as_str().starts_with("conf-"));
        assert!(c.prompt().contains(&format!("confirm {}", c.confirmation_id)));
    }

    #[test]
    fn test_confirm_then_confirm_again() {
        let book = ConfirmationBook::new();
        let c = book.open_at(request("alice", "hackers"), t0()).unwrap();

        let done = book.confirm_at(&c.confirmation_id, t0()).unwrap();
        assert_eq!(done.state, ConfirmationState::Confirmed);
        assert!(matches!(
            book.confirm_at(&c.confirmation_id, t0()),
            Err(DispatchError::ConfirmationNotPending(_))
        ));
    }

    #[test]
    fn test_confirm_after_expiry_is_not_pending() {
        let book = ConfirmationBook::new();
        let c = book.open_at(request("alice", "hackers"), t0()).unwrap();

        let later = t0() + Duration::seconds(61);
        assert!(matches!(
            book.confirm_at(&c.confirmation_id, later),
            Err(DispatchError::ConfirmationNotPending(_))
        ));
        let history = book.history().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].state, ConfirmationState::Expired);
    }

    #[test]
    fn test_cap_rejects_eleventh() {
        let book = ConfirmationBook::new();
        let opened: Vec<_> = (0..MAX_PENDING)
            .map(|i| book.open_at(request("alice", &format!("r{}", i)), t0()).unwrap())
            .collect();

        assert!(matches!(
            book.open_at(request("bob", "extra"), t0()),
            Err(DispatchError::TooManyPending { limit: 10 })
        ));

        let pending = book.pending().unwrap();
        assert_eq!(pending.len(), MAX_PENDING);
        for c in &opened {
            assert!(book.get(&c.confirmation_id).unwrap().is_some());
        }
    }

    #[test]
    fn test_sweep_returns_entries_expired_by_other_calls() {
        let book = ConfirmationBook::new();
        let alice = book.open_at(request("alice", "hackers"), t0()).unwrap();

        // Bob's request clears Alice's stale entry on the way in
        let later = t0() + Duration::seconds(61);
        let bob = book.open_at(request("bob", "lounge"), later).unwrap();
        assert_eq!(book.pending_count().unwrap(), 1);

        let lapsed = book.sweep_at(later).unwrap();
        assert_eq!(lapsed.len(), 1);
        assert_eq!(lapsed[0].confirmation_id, alice.confirmation_id);
        assert!(book.sweep_at(later).unwrap().is_empty());
        assert!(book.get(&bob.confirmation_id).unwrap().is_some());
    }

    #[test]
    fn test_custom_timeout() {
        let book = ConfirmationBook::new().with_timeout(Duration::seconds(5));
        let c = book.open_at(request("alice", "hackers"), t0()).unwrap();
        assert_eq!(c.expires_at - c.created_at, Duration::seconds(5));
        assert!(c.prompt().contains("Expires in 5s"));
        assert_eq!(book.sweep_at(t0() + Duration::seconds(5)).unwrap().len(), 1);
    }

    #[test]
    fn test_sweep_frees_slots() {
        let book = ConfirmationBook::new();
        for i in 0..MAX_PENDING {
            book.open_at(request("alice", &format!("r{}", i)), t0()).unwrap();
        }
        let later = t0() + Duration::seconds(60);
        assert_eq!(book.sweep_at(later).unwrap().len(), MAX_PENDING);
        assert_eq!(book.pending_count().unwrap(), 0);
        assert!(book.open_at(request("bob", "lounge"), later).is_ok());
    }

    #[test]
    fn test_cancel_only_touches_own_entries() {
        let book = ConfirmationBook::new();
        book.open_at(request("alice", "a"), t0()).unwrap();
        book.open_at(request("alice", "b"), t0()).unwrap();
        let bobs = book.open_at(request("bob", "c"), t0()).unwrap();

        let cancelled = book
            .cancel_all_at(&Origin::new("feishu", "alice"), t0())
            .unwrap();
        assert_eq!(cancelled.len(), 2);
        assert!(cancelled
            .iter()
            .all(|c| c.state == ConfirmationState::Rejected));
        assert_eq!(book.pending().unwrap(), vec![bobs]);
    }

    #[test]
    fn test_reject() {
        let book = ConfirmationBook::new();
        let c = book.open_at(request("alice", "a"), t0()).unwrap();
        assert_eq!(
            book.reject_at(&c.confirmation_id, t0()).unwrap().state,
            ConfirmationState::Rejected
        );
        assert!(book.reject_at(&c.confirmation_id, t0()).is_err());
    }

    #[test]
    fn test_journal_survives_new_book() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("confirmation_history.json");

        let book = ConfirmationBook::with_journal(&path);
        let c = book.open_at(request("alice", "a"), t0()).unwrap();
        book.confirm_at(&c.confirmation_id, t0()).unwrap();

        let reopened = ConfirmationBook::with_journal(&path);
        let entries = reopened.journal_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].suggested_command, "g: a");
        assert_eq!(entries[0].state, ConfirmationState::Confirmed);
    }
}
