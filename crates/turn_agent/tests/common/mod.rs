#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use dialog_core::{ContextMessage, Usage};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use turn_agent::{BackendError, ChatBackend, TurnOutcome};

pub enum Step {
    Reply(TurnOutcome),
    Fail(BackendError),
    /// Sleeps before replying.
    Delay(Duration, TurnOutcome),
    /// Emits each chunk as a delta, then replies.
    Stream(Vec<&'static str>, TurnOutcome),
    /// Blocks until the attempt is cancelled.
    Hang,
}

/// In-memory backend that plays back a fixed script, one step per call.
pub struct ScriptedBackend {
    name: String,
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicU32,
    watcher: Mutex<Option<mpsc::UnboundedSender<u32>>>,
    seen_prompts: Mutex<Vec<Option<String>>>,
}

impl ScriptedBackend {
    pub fn new(name: &str, steps: Vec<Step>) -> Self {
        Self {
            name: name.to_string(),
            steps: Mutex::new(steps.into()),
            calls: AtomicU32::new(0),
            watcher: Mutex::new(None),
            seen_prompts: Mutex::new(Vec::new()),
        }
    }

    /// Receives the call number each time a call starts.
    pub fn watch(&self) -> mpsc::UnboundedReceiver<u32> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.watcher.lock().unwrap() = Some(tx);
        rx
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen_prompts(&self) -> Vec<Option<String>> {
        self.seen_prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        history: &[ContextMessage],
        system_prompt: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, BackendError> {
        let (tx, _rx) = mpsc::unbounded_channel();
        self.invoke_streaming(history, system_prompt, cancel, tx).await
    }

    async fn invoke_streaming(
        &self,
        _history: &[ContextMessage],
        system_prompt: Option<&str>,
        cancel: &CancellationToken,
        deltas: mpsc::UnboundedSender<String>,
    ) -> Result<TurnOutcome, BackendError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.seen_prompts
            .lock()
            .unwrap()
            .push(system_prompt.map(str::to_string));
        if let Some(watcher) = self.watcher.lock().unwrap().as_ref() {
            let _ = watcher.send(call);
        }

        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(Step::Reply(outcome)) => Ok(outcome),
            Some(Step::Fail(error)) => Err(error),
            Some(Step::Delay(delay, outcome)) => {
                tokio::time::sleep(delay).await;
                Ok(outcome)
            }
            Some(Step::Stream(chunks, outcome)) => {
                for chunk in chunks {
                    let _ = deltas.send(chunk.to_string());
                    tokio::task::yield_now().await;
                }
                Ok(outcome)
            }
            Some(Step::Hang) => {
                cancel.cancelled().await;
                Err(BackendError::Cancelled)
            }
            None => Err(BackendError::Api("script exhausted".to_string())),
        }
    }
}

pub fn ok(content: &str, prompt: u32, completion: u32) -> Step {
    Step::Reply(TurnOutcome::completed(content, Usage::new(prompt, completion, 0.0)))
}

pub fn empty(prompt: u32, completion: u32) -> Step {
    Step::Reply(TurnOutcome::completed("", Usage::new(prompt, completion, 0.0)))
}

pub fn interrupted(partial: &str, prompt: u32, completion: u32) -> Step {
    Step::Reply(TurnOutcome::interrupted(
        partial,
        Usage::new(prompt, completion, 0.0),
        "stream interrupted",
    ))
}

/// Backend that only implements `invoke`, so streaming goes through the
/// trait's default and the whole reply arrives as one delta.
pub struct WholeReplyBackend {
    name: String,
    outcome: TurnOutcome,
    calls: AtomicU32,
}

impl WholeReplyBackend {
    pub fn new(name: &str, outcome: TurnOutcome) -> Self {
        Self {
            name: name.to_string(),
            outcome,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatBackend for WholeReplyBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        _history: &[ContextMessage],
        _system_prompt: Option<&str>,
        _cancel: &CancellationToken,
    ) -> Result<TurnOutcome, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.outcome.clone())
    }
}
