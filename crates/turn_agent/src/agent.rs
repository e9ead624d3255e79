//! Retry loop around a single backend call.
//!
//! One invocation runs up to `max_attempts` calls. Every finished attempt adds
//! its usage to the running total, successful or not. An attempt that times out
//! is abandoned and the loop moves on; cancellation ends the whole turn and is
//! reported separately from exhaustion.

use std::sync::Arc;
use std::time::Duration;

use dialog_core::{DialogContext, Usage};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::{ChatBackend, TurnOutcome};
use crate::config::AgentConfig;
use crate::error::{BackendError, Result, TurnError};
use crate::events::TurnEvent;

/// A successfully finished turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnCompletion {
    pub content: String,
    /// Sum over every attempt, including the failed ones.
    pub usage: Usage,
    /// Usage of the successful attempt alone.
    pub attempt_usage: Usage,
    pub attempts: u32,
    pub latency: Duration,
    pub finish_reason: Option<String>,
}

enum AttemptResult {
    Finished(TurnOutcome),
    Failed(BackendError),
    TimedOut(Duration),
    Cancelled,
}

pub struct TurnAgent {
    backend: Arc<dyn ChatBackend>,
    config: AgentConfig,
    session_id: String,
}

impl TurnAgent {
    pub fn new(backend: Arc<dyn ChatBackend>, config: AgentConfig) -> Self {
        Self {
            backend,
            config,
            session_id: "turn".to_string(),
        }
    }

    /// Prefix for log lines.
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn backend(&self) -> &Arc<dyn ChatBackend> {
        &self.backend
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub async fn run(
        &self,
        context: &DialogContext,
        cancel: &CancellationToken,
    ) -> Result<TurnCompletion> {
        self.execute(context, cancel, None).await
    }

    /// Like [`TurnAgent::run`], reporting progress on `event_tx`. The sender is
    /// dropped when the turn ends, which closes the channel.
    pub async fn run_with_events(
        &self,
        context: &DialogContext,
        cancel: &CancellationToken,
        event_tx: mpsc::Sender<TurnEvent>,
    ) -> Result<TurnCompletion> {
        self.execute(context, cancel, Some(&event_tx)).await
    }

    async fn execute(
        &self,
        context: &DialogContext,
        cancel: &CancellationToken,
        events: Option<&mpsc::Sender<TurnEvent>>,
    ) -> Result<TurnCompletion> {
        let total = self.config.max_attempts();
        let mut usage = Usage::default();
        let mut last_error: Option<String> = None;

        log::debug!(
            "[{}] Starting turn on '{}' with {} message(s), {} attempt(s) max",
            self.session_id,
            self.backend.name(),
            context.history.len(),
            total
        );

        for attempt in 1..=total {
            if cancel.is_cancelled() {
                return self.cancelled(attempt, usage, events).await;
            }

            if attempt > 1 && !self.config.retry_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return self.cancelled(attempt, usage, events).await;
                    }
                    _ = tokio::time::sleep(self.config.retry_delay) => {}
                }
            }

            emit(events, TurnEvent::AttemptStarted { attempt, total }).await;
            let started = Instant::now();

            let reason = match self.attempt(context, cancel, attempt, events).await {
                AttemptResult::Cancelled => {
                    return self.cancelled(attempt, usage, events).await;
                }
                AttemptResult::TimedOut(limit) => {
                    format!("attempt timed out after {}s", limit.as_secs_f64())
                }
                AttemptResult::Failed(_) if cancel.is_cancelled() => {
                    return self.cancelled(attempt, usage, events).await;
                }
                AttemptResult::Failed(error) => error.to_string(),
                AttemptResult::Finished(mut outcome) => {
                    if outcome.latency.is_zero() {
                        outcome.latency = started.elapsed();
                    }
                    usage += outcome.usage;
                    match outcome.rejection() {
                        Some(reason) => reason,
                        None => {
                            log::info!(
                                "[{}] Turn succeeded on attempt {}/{} in {:?}",
                                self.session_id,
                                attempt,
                                total,
                                outcome.latency
                            );
                            emit(
                                events,
                                TurnEvent::Succeeded {
                                    attempts: attempt,
                                    usage,
                                    latency_ms: outcome.latency.as_millis() as u64,
                                },
                            )
                            .await;
                            return Ok(TurnCompletion {
                                content: outcome.content,
                                usage,
                                attempt_usage: outcome.usage,
                                attempts: attempt,
                                latency: outcome.latency,
                                finish_reason: outcome.finish_reason,
                            });
                        }
                    }
                }
            };

            log::warn!(
                "[{}] Attempt {}/{} failed: {}",
                self.session_id,
                attempt,
                total,
                reason
            );
            emit(
                events,
                TurnEvent::AttemptWarning {
                    attempt,
                    total,
                    reason: reason.clone(),
                },
            )
            .await;
            last_error = Some(reason);
        }

        log::info!(
            "[{}] Turn exhausted after {} attempt(s): {}",
            self.session_id,
            total,
            last_error.as_deref().unwrap_or("no error message")
        );
        emit(
            events,
            TurnEvent::Exhausted {
                attempts: total,
                last_error: last_error.clone(),
                usage,
            },
        )
        .await;
        Err(TurnError::Exhausted {
            attempts: total,
            last_error,
            usage,
        })
    }

    /// Runs one backend call raced against cancellation and the attempt timeout,
    /// forwarding streamed deltas as they arrive.
    async fn attempt(
        &self,
        context: &DialogContext,
        cancel: &CancellationToken,
        attempt: u32,
        events: Option<&mpsc::Sender<TurnEvent>>,
    ) -> AttemptResult {
        let attempt_cancel = cancel.child_token();
        let (delta_tx, mut delta_rx) = mpsc::unbounded_channel();

        let call = self.backend.invoke_streaming(
            &context.history,
            context.system_prompt.as_deref(),
            &attempt_cancel,
            delta_tx,
        );
        tokio::pin!(call);

        let timeout = self.config.timeout;
        let deadline = async move {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    attempt_cancel.cancel();
                    return AttemptResult::Cancelled;
                }
                _ = &mut deadline => {
                    attempt_cancel.cancel();
                    return AttemptResult::TimedOut(timeout.unwrap_or_default());
                }
                Some(content) = delta_rx.recv() => {
                    emit(events, TurnEvent::Delta { attempt, content }).await;
                }
                result = &mut call => break result,
            }
        };

        while let Ok(content) = delta_rx.try_recv() {
            emit(events, TurnEvent::Delta { attempt, content }).await;
        }

        match result {
            Ok(outcome) => AttemptResult::Finished(outcome),
            Err(error) => AttemptResult::Failed(error),
        }
    }

    async fn cancelled(
        &self,
        attempt: u32,
        usage: Usage,
        events: Option<&mpsc::Sender<TurnEvent>>,
    ) -> Result<TurnCompletion> {
        log::info!(
            "[{}] Turn cancelled during attempt {}",
            self.session_id,
            attempt
        );
        emit(events, TurnEvent::Cancelled { attempt, usage }).await;
        Err(TurnError::Cancelled { usage })
    }
}

async fn emit(events: Option<&mpsc::Sender<TurnEvent>>, event: TurnEvent) {
    if let Some(event_tx) = events {
        let _ = event_tx.send(event).await;
    }
}
