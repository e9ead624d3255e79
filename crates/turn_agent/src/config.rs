use std::time::Duration;

use dialog_core::{SessionConfig, DEFAULT_RETRY_COUNT};

/// Configuration for one [`crate::TurnAgent`].
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    /// Total attempts per turn. Zero behaves like one.
    pub retry_count: u32,
    /// Per-attempt limit; a timeout only loses that attempt.
    pub timeout: Option<Duration>,
    pub retry_delay: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            retry_count: DEFAULT_RETRY_COUNT,
            timeout: None,
            retry_delay: Duration::ZERO,
        }
    }
}

impl AgentConfig {
    pub fn max_attempts(&self) -> u32 {
        self.retry_count.max(1)
    }
}

impl From<&SessionConfig> for AgentConfig {
    fn from(config: &SessionConfig) -> Self {
        Self {
            retry_count: config.retry_count,
            timeout: config.timeout(),
            retry_delay: config.retry_delay(),
        }
    }
}
