//! Process-wide execution control: pause, resume, cancel.
//!
//! The controller keeps a table of active runs. Pause is a releasable gate
//! the coordinator awaits between loop iterations (never mid-stream), so a
//! paused session is always left in a legal state. Cancel is terminal: it
//! trips the run's [`CancellationToken`] (chained to the parent run's token
//! for nested runs) and releases any held gate.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

/// Control state of a registered run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    /// Executing normally.
    Running,
    /// Gated; the coordinator blocks at its next pause checkpoint.
    Paused,
    /// Terminal; the run unwinds at its next suspension point.
    Cancelled,
}

struct ControlEntry {
    state: ControlState,
    pause_tx: watch::Sender<bool>,
    token: CancellationToken,
}

/// Cancellation signals handed to a run at registration.
#[derive(Debug, Clone)]
pub struct RunSignals {
    /// Trips when the run (or an ancestor) is cancelled.
    pub token: CancellationToken,
}

impl RunSignals {
    /// Non-blocking cancellation check.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Process-wide registry of active runs.
#[derive(Default)]
pub struct ExecutionController {
    runs: Mutex<HashMap<String, ControlEntry>>,
}

impl ExecutionController {
    /// Create an empty controller.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run, optionally chaining cancellation from a parent
    /// run's token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the run id is already registered.
    pub fn register(
        &self,
        run_id: &str,
        parent: Option<&CancellationToken>,
    ) -> Result<RunSignals> {
        let mut runs = self.lock()?;
        if runs.contains_key(run_id) {
            return Err(Error::config(format!("run '{run_id}' is already registered")));
        }

        let (pause_tx, _pause_rx) = watch::channel(false);
        let token = parent.map_or_else(CancellationToken::new, CancellationToken::child_token);
        runs.insert(
            run_id.to_owned(),
            ControlEntry {
                state: ControlState::Running,
                pause_tx,
                token: token.clone(),
            },
        );
        debug!(run_id, "run registered");
        Ok(RunSignals { token })
    }

    /// Remove a terminal run from the table.
    pub fn deregister(&self, run_id: &str) {
        if let Ok(mut runs) = self.runs.lock() {
            runs.remove(run_id);
        }
    }

    /// Gate the run at its next pause checkpoint.
    ///
    /// A pause arriving during an LLM stream takes effect at the next loop
    /// iteration, not mid-stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown run and [`Error::Config`]
    /// when the run is already cancelled.
    pub fn pause(&self, run_id: &str) -> Result<()> {
        self.transition(run_id, |entry| match entry.state {
            ControlState::Cancelled => Err(Error::config("cannot pause a cancelled run")),
            ControlState::Running | ControlState::Paused => {
                entry.state = ControlState::Paused;
                let _ = entry.pause_tx.send(true);
                Ok(())
            }
        })
    }

    /// Release a paused run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown run and [`Error::Config`]
    /// when the run is already cancelled.
    pub fn resume(&self, run_id: &str) -> Result<()> {
        self.transition(run_id, |entry| match entry.state {
            ControlState::Cancelled => Err(Error::config("cannot resume a cancelled run")),
            ControlState::Running | ControlState::Paused => {
                entry.state = ControlState::Running;
                let _ = entry.pause_tx.send(false);
                Ok(())
            }
        })
    }

    /// Cancel a run. Terminal: trips the token and releases any held gate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown run.
    pub fn cancel(&self, run_id: &str) -> Result<()> {
        self.transition(run_id, |entry| {
            entry.state = ControlState::Cancelled;
            entry.token.cancel();
            let _ = entry.pause_tx.send(false);
            Ok(())
        })
    }

    /// Non-blocking cancellation check.
    #[must_use]
    pub fn is_cancelled(&self, run_id: &str) -> bool {
        self.lock()
            .ok()
            .and_then(|runs| runs.get(run_id).map(|e| e.token.is_cancelled()))
            .unwrap_or(false)
    }

    /// The control state of a run, if registered.
    #[must_use]
    pub fn state(&self, run_id: &str) -> Option<ControlState> {
        self.lock().ok().and_then(|runs| runs.get(run_id).map(|e| e.state))
    }

    /// The coordinator's pause checkpoint: blocks while the run is paused.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] when cancellation lands while gated,
    /// and [`Error::NotFound`] for an unknown run.
    pub async fn await_gate(&self, run_id: &str) -> Result<()> {
        let (mut pause_rx, token) = {
            let runs = self.lock()?;
            let entry = runs
                .get(run_id)
                .ok_or_else(|| Error::not_found("run", run_id))?;
            (entry.pause_tx.subscribe(), entry.token.clone())
        };

        loop {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if !*pause_rx.borrow_and_update() {
                return Ok(());
            }
            debug!(run_id, "run gated at pause checkpoint");
            tokio::select! {
                _ = token.cancelled() => return Err(Error::Cancelled),
                changed = pause_rx.changed() => {
                    if changed.is_err() {
                        // Controller entry dropped; treat as released.
                        return Ok(());
                    }
                }
            }
        }
    }

    fn transition(
        &self,
        run_id: &str,
        apply: impl FnOnce(&mut ControlEntry) -> Result<()>,
    ) -> Result<()> {
        let mut runs = self.lock()?;
        let entry = runs
            .get_mut(run_id)
            .ok_or_else(|| Error::not_found("run", run_id))?;
        apply(entry)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, ControlEntry>>> {
        self.runs
            .lock()
            .map_err(|e| Error::store(format!("controller mutex poisoned: {e}")))
    }
}

impl std::fmt::Debug for ExecutionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.lock().map(|runs| runs.len()).unwrap_or(0);
        f.debug_struct("ExecutionController")
            .field("active_runs", &count)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn register_is_exclusive_per_run_id() {
        let controller = ExecutionController::new();
        controller.register("r-1", None).unwrap();
        let err = controller.register("r-1", None).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));

        controller.deregister("r-1");
        assert!(controller.register("r-1", None).is_ok());
    }

    #[tokio::test]
    async fn gate_is_open_while_running() {
        let controller = ExecutionController::new();
        controller.register("r-1", None).unwrap();
        controller.await_gate("r-1").await.unwrap();
    }

    #[tokio::test]
    async fn pause_blocks_until_resume() {
        let controller = Arc::new(ExecutionController::new());
        controller.register("r-1", None).unwrap();
        controller.pause("r-1").unwrap();
        assert_eq!(controller.state("r-1"), Some(ControlState::Paused));

        let gated = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.await_gate("r-1").await })
        };

        // The gate must still be held after a short wait.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!gated.is_finished());

        controller.resume("r-1").unwrap();
        gated.await.unwrap().unwrap();
        assert_eq!(controller.state("r-1"), Some(ControlState::Running));
    }

    #[tokio::test]
    async fn cancel_releases_a_held_gate_with_cancelled() {
        let controller = Arc::new(ExecutionController::new());
        controller.register("r-1", None).unwrap();
        controller.pause("r-1").unwrap();

        let gated = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.await_gate("r-1").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        controller.cancel("r-1").unwrap();
        let err = gated.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert!(controller.is_cancelled("r-1"));
    }

    #[tokio::test]
    async fn cancelled_runs_reject_pause_and_resume() {
        let controller = ExecutionController::new();
        controller.register("r-1", None).unwrap();
        controller.cancel("r-1").unwrap();

        assert!(controller.pause("r-1").is_err());
        assert!(controller.resume("r-1").is_err());
        assert_eq!(controller.state("r-1"), Some(ControlState::Cancelled));
    }

    #[tokio::test]
    async fn child_tokens_chain_from_the_parent() {
        let controller = ExecutionController::new();
        let parent = controller.register("parent", None).unwrap();
        let child = controller
            .register("child", Some(&parent.token))
            .unwrap();

        assert!(!child.is_cancelled());
        controller.cancel("parent").unwrap();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn unknown_run_operations_are_not_found() {
        let controller = ExecutionController::new();
        assert!(controller.pause("ghost").unwrap_err().is_not_found());
        assert!(controller.await_gate("ghost").await.unwrap_err().is_not_found());
        assert!(!controller.is_cancelled("ghost"));
    }
}
