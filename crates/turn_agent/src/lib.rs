//! turn_agent - executes conversation turns against pluggable chat backends.
//!
//! [`TurnAgent`] runs one turn with retries, a per-attempt timeout and
//! cancellation. [`ChatSession`] wires it to a [`dialog_core::DialogTree`]:
//! new user turns, regenerations (one or several backends at once), retries and
//! acceptance all flow through it.

pub mod agent;
pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod session;

pub use agent::{TurnAgent, TurnCompletion};
pub use backend::{ChatBackend, TurnOutcome};
pub use config::AgentConfig;
pub use error::{BackendError, Result, TurnError};
pub use events::TurnEvent;
pub use session::{ChatSession, ItemTurnEvent, TurnReport};
