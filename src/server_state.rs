//! Process-wide gateway state.
//!
//! All flags live behind one mutex and are only touched in short critical
//! sections that never await. The busy slot is claimed by
//! [`crate::scheduler::try_admit`] and released by [`BusySlot`], which also
//! releases on drop so no path can leave `busy` stuck at `true`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;

/// Terminal state of a finished job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed,
    TimedOut,
    Aborted,
}

#[derive(Debug)]
pub(crate) struct StateFlags {
    pub(crate) running: bool,
    pub(crate) paused: bool,
    pub(crate) busy: bool,
    pub(crate) cpu_allocation_limit: f64,
    pub(crate) active_job: Option<CancellationToken>,
    pub(crate) jobs_started: u64,
    pub(crate) last_outcome: Option<JobOutcome>,
}

/// Copy of the flags taken under the lock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateSnapshot {
    pub running: bool,
    pub paused: bool,
    pub busy: bool,
    pub cpu_allocation_limit: f64,
    pub jobs_started: u64,
    pub last_outcome: Option<JobOutcome>,
}

#[derive(Debug)]
pub struct ServerState {
    flags: Mutex<StateFlags>,
    auth_secret: String,
}

impl ServerState {
    pub fn new(auth_secret: impl Into<String>, cpu_allocation_limit: f64) -> Self {
        ServerState {
            flags: Mutex::new(StateFlags {
                running: false,
                paused: false,
                busy: false,
                cpu_allocation_limit,
                active_job: None,
                jobs_started: 0,
                last_outcome: None,
            }),
            auth_secret: auth_secret.into(),
        }
    }

    pub(crate) fn flags(&self) -> MutexGuard<'_, StateFlags> {
        self.flags.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let flags = self.flags();
        StateSnapshot {
            running: flags.running,
            paused: flags.paused,
            busy: flags.busy,
            cpu_allocation_limit: flags.cpu_allocation_limit,
            jobs_started: flags.jobs_started,
            last_outcome: flags.last_outcome,
        }
    }

    /// Constant-time comparison against the configured secret.
    pub fn verify_secret(&self, candidate: &str) -> bool {
        let expected = self.auth_secret.as_bytes();
        let candidate = candidate.as_bytes();
        expected.len() == candidate.len() && bool::from(expected.ct_eq(candidate))
    }

    pub fn set_running(&self, running: bool) {
        self.flags().running = running;
    }

    pub fn set_cpu_allocation_limit(&self, limit: f64) {
        self.flags().cpu_allocation_limit = limit;
    }

    /// Suspends admission and aborts the running job, if any. Returns whether
    /// a job was signalled.
    pub fn pause(&self) -> bool {
        let mut flags = self.flags();
        flags.paused = true;
        cancel_active(&flags)
    }

    pub fn resume(&self) {
        self.flags().paused = false;
    }

    /// Signals the running job to terminate without changing `paused`.
    pub fn cancel_active_job(&self) -> bool {
        cancel_active(&self.flags())
    }
}

fn cancel_active(flags: &StateFlags) -> bool {
    match &flags.active_job {
        Some(token) if !token.is_cancelled() => {
            token.cancel();
            true
        }
        _ => false,
    }
}

/// Exclusive claim on the single worker slot, held from admission until the
/// job reaches a terminal state.
#[derive(Debug)]
pub struct BusySlot {
    state: Arc<ServerState>,
    job_id: u64,
    cancel: CancellationToken,
    released: bool,
}

impl BusySlot {
    /// Must be called with the flags locked and `busy` just set.
    pub(crate) fn claim(state: Arc<ServerState>, flags: &mut StateFlags) -> Self {
        let cancel = CancellationToken::new();
        flags.busy = true;
        flags.jobs_started += 1;
        flags.active_job = Some(cancel.clone());
        let job_id = flags.jobs_started;
        BusySlot {
            state,
            job_id,
            cancel,
            released: false,
        }
    }

    pub fn job_id(&self) -> u64 {
        self.job_id
    }

    /// Fires when the operator pauses or stops the gateway.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Records the terminal outcome and frees the slot in one critical section.
    pub fn release(mut self, outcome: JobOutcome) {
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: JobOutcome) {
        if self.released {
            return;
        }
        self.released = true;
        let mut flags = self.state.flags();
        flags.busy = false;
        flags.active_job = None;
        flags.last_outcome = Some(outcome);
    }
}

impl Drop for BusySlot {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(job_id = self.job_id, "busy slot dropped before completion");
            self.finish(JobOutcome::Aborted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim(state: &Arc<ServerState>) -> BusySlot {
        let mut flags = state.flags();
        BusySlot::claim(state.clone(), &mut flags)
    }

    #[test]
    fn secret_comparison() {
        let state = ServerState::new("s3cret", 80.0);
        assert!(state.verify_secret("s3cret"));
        assert!(!state.verify_secret("s3cre"));
        assert!(!state.verify_secret("s3cret!"));
        assert!(!state.verify_secret(""));
    }

    #[test]
    fn release_clears_busy_and_records_outcome() {
        let state = Arc::new(ServerState::new("k", 80.0));
        let slot = claim(&state);
        assert!(state.snapshot().busy);
        assert_eq!(slot.job_id(), 1);

        slot.release(JobOutcome::Succeeded);
        let snapshot = state.snapshot();
        assert!(!snapshot.busy);
        assert_eq!(snapshot.last_outcome, Some(JobOutcome::Succeeded));
    }

    #[test]
    fn dropped_slot_is_released_as_aborted() {
        let state = Arc::new(ServerState::new("k", 80.0));
        drop(claim(&state));
        let snapshot = state.snapshot();
        assert!(!snapshot.busy);
        assert_eq!(snapshot.last_outcome, Some(JobOutcome::Aborted));
    }

    #[test]
    fn pause_cancels_the_active_job() {
        let state = Arc::new(ServerState::new("k", 80.0));
        let slot = claim(&state);
        assert!(state.pause());
        assert!(slot.cancellation().is_cancelled());
        assert!(state.snapshot().paused);
        // Already cancelled, nothing more to signal.
        assert!(!state.pause());

        state.resume();
        assert!(!state.snapshot().paused);
    }

    #[test]
    fn pause_without_a_job_only_sets_the_flag() {
        let state = ServerState::new("k", 80.0);
        assert!(!state.pause());
        assert!(state.snapshot().paused);
    }
}
