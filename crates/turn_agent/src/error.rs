use dialog_core::{TreeError, Usage};
use thiserror::Error;
use uuid::Uuid;

/// Failure reported by a [`crate::ChatBackend`] for a single call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("Request error: {0}")]
    Request(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Cancelled")]
    Cancelled,
}

#[derive(Error, Debug)]
pub enum TurnError {
    /// Every attempt came back failed, interrupted or empty.
    #[error(
        "turn failed after {attempts} attempt(s): {}",
        .last_error.as_deref().unwrap_or("no error message")
    )]
    Exhausted {
        attempts: u32,
        last_error: Option<String>,
        usage: Usage,
    },

    /// Stopped by the caller. Carries the usage of attempts that finished.
    #[error("Cancelled")]
    Cancelled { usage: Usage },

    #[error("Tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("no backend registered as '{0}'")]
    UnknownBackend(String),

    #[error("node {0} has no parent turn to answer")]
    NothingToAnswer(Uuid),
}

impl TurnError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TurnError::Cancelled { .. })
    }

    /// Usage spent before the turn ended, for the variants that track it.
    pub fn usage(&self) -> Option<Usage> {
        match self {
            TurnError::Exhausted { usage, .. } | TurnError::Cancelled { usage } => Some(*usage),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, TurnError>;
