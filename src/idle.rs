//! Idle teardown timer
//!
//! Holds at most one pending deadline. Every `reset` replaces the previous
//! one, so the expiry action runs only after a full quiet period.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

struct Pending {
    seq: u64,
    deadline: Instant,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct TimerState {
    pending: Option<Pending>,
    next_seq: u64,
}

#[derive(Default)]
pub struct IdleTimer {
    state: Arc<Mutex<TimerState>>,
}

impl IdleTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `on_expire` to run after `duration`, cancelling any pending run.
    ///
    /// A run that was already due but has not started yet is skipped as well:
    /// only the schedule installed by the latest `reset` may fire.
    pub fn reset<F>(&self, duration: Duration, on_expire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let deadline = Instant::now() + duration;
        let mut state = self.state.lock();
        state.next_seq += 1;
        let seq = state.next_seq;

        let shared = Arc::clone(&self.state);
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            {
                let mut state = shared.lock();
                if state.pending.as_ref().map(|p| p.seq) != Some(seq) {
                    debug!(seq, "Idle deadline superseded");
                    return;
                }
                // Unregistered before running, so the action may reset or
                // cancel this timer without aborting itself.
                state.pending = None;
            }
            debug!(seq, "Idle deadline reached");
            on_expire.await;
        });

        let previous = state.pending.replace(Pending { seq, deadline, task });
        drop(state);
        if let Some(previous) = previous {
            previous.task.abort();
        }
    }

    /// Drop the pending deadline, if any
    pub fn cancel(&self) {
        let pending = self.state.lock().pending.take();
        if let Some(pending) = pending {
            pending.task.abort();
        }
    }

    /// When the pending run fires, unless it already has
    pub fn deadline(&self) -> Option<Instant> {
        self.state.lock().pending.as_ref().map(|p| p.deadline)
    }

    pub fn is_scheduled(&self) -> bool {
        self.deadline().is_some()
    }
}

impl Drop for IdleTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
