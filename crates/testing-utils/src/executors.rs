//! Scripted executors for driving the worker pipeline in tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use marketpilot_core::EngineResult;
use marketpilot_domain::entities::{AccountSession, JobKind};
use marketpilot_domain::executor::{ActionExecutor, ExecutionOutcome};

/// Executor that replays a scripted sequence of outcomes.
///
/// Each call pops the next outcome; once the script is exhausted, the
/// last outcome repeats. Tracks the number of invocations so tests can
/// assert on retry behavior.
pub struct ScriptedExecutor {
    kind: JobKind,
    outcomes: Mutex<VecDeque<ExecutionOutcome>>,
    last: Mutex<ExecutionOutcome>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedExecutor {
    pub fn new(kind: JobKind, outcomes: Vec<ExecutionOutcome>) -> Self {
        let last = outcomes
            .last()
            .cloned()
            .unwrap_or_else(|| ExecutionOutcome::Success(serde_json::json!({})));
        Self {
            kind,
            outcomes: Mutex::new(outcomes.into()),
            last: Mutex::new(last),
            calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    /// Executor that always succeeds.
    pub fn always_success(kind: JobKind) -> Self {
        Self::new(kind, vec![ExecutionOutcome::Success(serde_json::json!({}))])
    }

    /// Sleep for `delay` on every call before returning, to simulate a
    /// slow browser action (useful for timeout and concurrency tests).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActionExecutor for ScriptedExecutor {
    fn kind(&self) -> JobKind {
        self.kind
    }

    async fn execute(
        &self,
        _session: &AccountSession,
        _payload: &serde_json::Value,
    ) -> EngineResult<ExecutionOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.outcomes.lock().unwrap().pop_front();
        match next {
            Some(outcome) => {
                *self.last.lock().unwrap() = outcome.clone();
                Ok(outcome)
            }
            None => Ok(self.last.lock().unwrap().clone()),
        }
    }
}
