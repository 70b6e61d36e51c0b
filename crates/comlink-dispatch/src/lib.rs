//! Command dispatch for comlink.
//!
//! Inbound text is checked in a fixed order:
//!
//! 1. a confirmation reply (`confirm <id>`, `reject <id>`, `cancel`);
//! 2. one of the four hardcoded prefixes (`com:`, `sh:`, `g:`, `s:`), which
//!    executes immediately because the prefix is itself the confirmation;
//! 3. a fuzzy natural-language intent, which only opens a
//!    [`PendingConfirmation`];
//! 4. otherwise the text is conversation.
//!
//! Shell payloads are additionally checked against the [`safety`] rules: a
//! prohibited command is refused, a dangerous one always needs confirming.
//!
//! # Example
//!
//! ```
//! use comlink_dispatch::{Dispatcher, Outcome};
//! use comlink_models::{Command, Origin};
//!
//! let dispatcher = Dispatcher::default();
//! let alice = Origin::new("feishu", "alice");
//!
//! let outcome = dispatcher.dispatch("g: hackers", &alice, None).unwrap();
//! assert!(matches!(outcome, Outcome::Execute { command: Command::SwitchRoom { .. }, .. }));
//!
//! let outcome = dispatcher.dispatch("switch to the hackers room", &alice, None).unwrap();
//! if let Outcome::AwaitConfirmation(pending) = outcome {
//!     assert_eq!(pending.suggested_command, "g: hackers");
//! }
//! ```

pub mod confirmation;
pub mod dispatcher;
pub mod error;
pub mod patterns;
pub mod routes;
pub mod safety;

pub use confirmation::{
    ConfirmationBook, ConfirmationReason, ConfirmationRequest, ConfirmationState, HistoryEntry,
    PendingConfirmation, CONFIRMATION_TIMEOUT_SECS, MAX_PENDING,
};
pub use dispatcher::{parse_reply, Dispatcher, Outcome, Reply};
pub use error::{DispatchError, Result};
pub use patterns::{match_intent, Intent, IntentMatch};
pub use routes::{help_text, HardcodedRoute, ROUTES};
pub use safety::{assess, RiskAssessment, RiskLevel};
