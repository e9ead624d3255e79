use std::time::Duration;

use async_trait::async_trait;
use dialog_core::{ContextMessage, Usage};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::BackendError;

/// Result of one backend call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnOutcome {
    pub content: String,
    pub usage: Usage,
    /// Filled in by the agent when the backend leaves it at zero.
    pub latency: Duration,
    pub is_interrupted: bool,
    pub error_message: Option<String>,
    pub finish_reason: Option<String>,
}

impl TurnOutcome {
    pub fn completed(content: impl Into<String>, usage: Usage) -> Self {
        Self {
            content: content.into(),
            usage,
            finish_reason: Some("stop".to_string()),
            ..Default::default()
        }
    }

    pub fn interrupted(partial: impl Into<String>, usage: Usage, reason: impl Into<String>) -> Self {
        Self {
            content: partial.into(),
            usage,
            is_interrupted: true,
            error_message: Some(reason.into()),
            ..Default::default()
        }
    }

    /// Why this outcome cannot be accepted, if it cannot.
    pub fn rejection(&self) -> Option<String> {
        if self.is_interrupted {
            return Some(
                self.error_message
                    .clone()
                    .unwrap_or_else(|| "response was interrupted".to_string()),
            );
        }
        if self.content.trim().is_empty() {
            return Some(
                self.error_message
                    .clone()
                    .unwrap_or_else(|| "response was empty".to_string()),
            );
        }
        None
    }
}

/// A provider-specific completion client.
///
/// Implementations should observe `cancel` and return promptly once it fires;
/// the agent also drops the call future when cancelled or timed out.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Label stored on every response item this backend produces.
    fn name(&self) -> &str;

    async fn invoke(
        &self,
        history: &[ContextMessage],
        system_prompt: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, BackendError>;

    /// Streaming variant. Backends without incremental output emit the whole
    /// content as one delta.
    async fn invoke_streaming(
        &self,
        history: &[ContextMessage],
        system_prompt: Option<&str>,
        cancel: &CancellationToken,
        deltas: mpsc::UnboundedSender<String>,
    ) -> Result<TurnOutcome, BackendError> {
        let outcome = self.invoke(history, system_prompt, cancel).await?;
        if !outcome.content.is_empty() {
            let _ = deltas.send(outcome.content.clone());
        }
        Ok(outcome)
    }
}
