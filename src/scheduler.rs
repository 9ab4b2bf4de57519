//! Admission control and job execution.
//!
//! [`try_admit`] decides, under the state lock, whether a new job may claim
//! the busy slot. [`JobExecutor`] then drives that job from spawn to a single
//! terminal outcome and hands the slot back.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::api::api_objects::{JobInput, TranslationRecord};
use crate::errors::GatewayError;
use crate::server_state::{BusySlot, JobOutcome, ServerState};
use crate::telemetry::TelemetryProbe;
use crate::worker::{WaitOutcome, WorkerProcessManager};

/// Wall-clock budget of a single job.
pub const JOB_TIMEOUT: Duration = Duration::from_secs(120);

/// Admission decision. Checks run in a fixed order and the first match wins:
/// paused, busy, CPU overload. On acceptance `busy` is set in the same
/// critical section as the checks.
pub fn try_admit(
    state: &Arc<ServerState>,
    probe: &dyn TelemetryProbe,
) -> Result<BusySlot, GatewayError> {
    let mut flags = state.flags();

    if flags.paused {
        if let Some(token) = &flags.active_job {
            token.cancel();
        }
        tracing::info!("admission rejected: paused");
        return Err(GatewayError::Paused);
    }
    if flags.busy {
        tracing::info!("admission rejected: busy");
        return Err(GatewayError::Busy);
    }

    let cpu = probe.sample().cpu_percent;
    let limit = flags.cpu_allocation_limit;
    if cpu >= limit {
        tracing::warn!(cpu, limit, "admission rejected: cpu overload");
        return Err(GatewayError::CpuOverload {
            current: cpu,
            limit,
        });
    }

    let slot = BusySlot::claim(state.clone(), &mut flags);
    tracing::info!(job_id = slot.job_id(), cpu, limit, "job admitted");
    Ok(slot)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Admitted,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Aborted,
}

impl JobState {
    fn is_terminal(self) -> bool {
        !matches!(self, JobState::Admitted | JobState::Running)
    }

    fn outcome(self) -> Option<JobOutcome> {
        match self {
            JobState::Succeeded => Some(JobOutcome::Succeeded),
            JobState::Failed => Some(JobOutcome::Failed),
            JobState::TimedOut => Some(JobOutcome::TimedOut),
            JobState::Aborted => Some(JobOutcome::Aborted),
            JobState::Admitted | JobState::Running => None,
        }
    }
}

/// One admitted job. Owns the busy slot until it is finished.
struct Job {
    slot: BusySlot,
    state: JobState,
    timeout: Duration,
    started: Instant,
    deadline: Instant,
}

impl Job {
    fn admitted(slot: BusySlot, timeout: Duration) -> Self {
        let now = Instant::now();
        Job {
            slot,
            state: JobState::Admitted,
            timeout,
            started: now,
            deadline: now + timeout,
        }
    }

    /// The deadline counts from the moment the worker is running.
    fn start(&mut self) {
        debug_assert_eq!(self.state, JobState::Admitted);
        self.state = JobState::Running;
        self.started = Instant::now();
        self.deadline = self.started + self.timeout;
    }

    /// Records the terminal state and releases the slot.
    fn finish(mut self, state: JobState) {
        debug_assert!(!self.state.is_terminal() && state.is_terminal());
        self.state = state;
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        tracing::info!(job_id = self.slot.job_id(), outcome = ?state, elapsed_ms, "job finished");
        if let Some(outcome) = state.outcome() {
            self.slot.release(outcome);
        }
    }
}

pub struct JobExecutor {
    workers: WorkerProcessManager,
    timeout: Duration,
}

impl JobExecutor {
    pub fn new(workers: WorkerProcessManager) -> Self {
        JobExecutor {
            workers,
            timeout: JOB_TIMEOUT,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_timeout(workers: WorkerProcessManager, timeout: Duration) -> Self {
        JobExecutor { workers, timeout }
    }

    pub fn workers(&self) -> &WorkerProcessManager {
        &self.workers
    }

    /// Runs an admitted job to completion. The busy slot is always released
    /// before this returns.
    pub async fn execute(
        &self,
        slot: BusySlot,
        input: JobInput,
    ) -> Result<TranslationRecord, GatewayError> {
        let mut job = Job::admitted(slot, self.timeout);
        let job_id = job.slot.job_id();

        let mut handle = match self.workers.spawn(&input).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(job_id, error = %e, "worker spawn failed");
                job.finish(JobState::Failed);
                return Err(e);
            }
        };
        job.start();
        tracing::debug!(job_id, input = input.kind(), "job running");

        let cancel = job.slot.cancellation().clone();
        let outcome = handle.await_result(job.deadline, &cancel).await;
        let result = match outcome {
            WaitOutcome::Completed(Ok(record)) => Ok(record),
            WaitOutcome::Completed(Err(e)) => {
                tracing::warn!(job_id, error = %e, "worker failed");
                Err(e)
            }
            WaitOutcome::DeadlineElapsed => {
                tracing::warn!(job_id, timeout_s = self.timeout.as_secs(), "job deadline elapsed");
                handle.terminate().await;
                Err(GatewayError::Timeout)
            }
            WaitOutcome::Cancelled => {
                tracing::warn!(job_id, "job aborted by pause");
                handle.terminate().await;
                Err(GatewayError::Aborted)
            }
        };
        drop(handle);

        let terminal = match &result {
            Ok(_) => JobState::Succeeded,
            Err(GatewayError::Timeout) => JobState::TimedOut,
            Err(GatewayError::Aborted) => JobState::Aborted,
            Err(_) => JobState::Failed,
        };
        job.finish(terminal);
        result
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::Notify;

    use super::*;
    use crate::telemetry::testing::FixedProbe;
    use crate::worker::testing::{Behavior, SpyLauncher, record};

    fn state(limit: f64) -> Arc<ServerState> {
        Arc::new(ServerState::new("secret", limit))
    }

    fn text() -> JobInput {
        JobInput::Text("hello".to_string())
    }

    #[test]
    fn paused_wins_over_busy_and_overload() {
        let state = state(50.0);
        let probe = FixedProbe::new(99.0);
        let slot = try_admit(&state, &FixedProbe::new(0.0)).unwrap();
        state.pause();

        assert!(matches!(try_admit(&state, &probe), Err(GatewayError::Paused)));
        assert!(slot.cancellation().is_cancelled());
    }

    #[test]
    fn busy_wins_over_overload() {
        let state = state(50.0);
        let _slot = try_admit(&state, &FixedProbe::new(0.0)).unwrap();
        assert!(matches!(
            try_admit(&state, &FixedProbe::new(99.0)),
            Err(GatewayError::Busy)
        ));
    }

    #[test]
    fn overload_rejects_at_the_limit() {
        let state = state(50.0);
        match try_admit(&state, &FixedProbe::new(50.0)) {
            Err(GatewayError::CpuOverload { current, limit }) => {
                assert_eq!(current, 50.0);
                assert_eq!(limit, 50.0);
            }
            other => panic!("expected overload, got {other:?}"),
        }
        assert!(!state.snapshot().busy);
        let _slot = try_admit(&state, &FixedProbe::new(49.9)).unwrap();
        assert!(state.snapshot().busy);
    }

    #[test]
    fn concurrent_admissions_claim_the_slot_once() {
        let state = state(80.0);
        let probe = Arc::new(FixedProbe::new(10.0));
        let barrier = Arc::new(std::sync::Barrier::new(8));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let state = state.clone();
                let probe = probe.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    // Keep accepted slots alive until every thread has tried.
                    try_admit(&state, probe.as_ref())
                })
            })
            .collect();
        let results: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();

        let accepted = results.iter().filter(|r| r.is_ok()).count();
        let busy = results
            .iter()
            .filter(|r| matches!(r, Err(GatewayError::Busy)))
            .count();
        assert_eq!(accepted, 1);
        assert_eq!(busy, 7);
    }

    #[tokio::test]
    async fn successful_job_releases_the_slot() {
        let state = state(80.0);
        let spy = SpyLauncher::new(Behavior::Succeed(record(
            r#"{"status":"ok","title":"Hola","text":"hello"}"#,
        )));
        let executor = JobExecutor::new(WorkerProcessManager::new(spy.clone()));

        let slot = try_admit(&state, &FixedProbe::new(10.0)).unwrap();
        let record = executor.execute(slot, text()).await.unwrap();
        assert_eq!(record["title"], "Hola");

        let snapshot = state.snapshot();
        assert!(!snapshot.busy);
        assert_eq!(snapshot.last_outcome, Some(JobOutcome::Succeeded));
        assert_eq!(spy.inputs(), vec![text()]);
    }

    #[tokio::test]
    async fn worker_failure_is_reported_and_released() {
        let state = state(80.0);
        let spy = SpyLauncher::new(Behavior::Fail("Model loading failed".to_string()));
        let executor = JobExecutor::new(WorkerProcessManager::new(spy.clone()));

        let slot = try_admit(&state, &FixedProbe::new(10.0)).unwrap();
        let err = executor.execute(slot, text()).await.unwrap_err();
        assert!(matches!(err, GatewayError::WorkerFailure { .. }));
        assert_eq!(state.snapshot().last_outcome, Some(JobOutcome::Failed));
        assert!(!state.snapshot().busy);
    }

    #[tokio::test]
    async fn spawn_error_is_a_failed_job() {
        let state = state(80.0);
        let spy = SpyLauncher::new(Behavior::FailToSpawn);
        let executor = JobExecutor::new(WorkerProcessManager::new(spy.clone()));

        let slot = try_admit(&state, &FixedProbe::new(10.0)).unwrap();
        let err = executor.execute(slot, text()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Spawn { .. }));
        assert_eq!(state.snapshot().last_outcome, Some(JobOutcome::Failed));
        assert!(!state.snapshot().busy);
        assert!(!executor.workers().has_live_worker());
    }

    #[tokio::test]
    async fn deadline_terminates_the_worker_once() {
        let state = state(80.0);
        let spy = SpyLauncher::new(Behavior::Hang);
        let executor =
            JobExecutor::with_timeout(WorkerProcessManager::new(spy.clone()), Duration::from_millis(50));

        let slot = try_admit(&state, &FixedProbe::new(10.0)).unwrap();
        let err = executor.execute(slot, text()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Timeout));
        assert_eq!(spy.kills(), 1);
        assert_eq!(state.snapshot().last_outcome, Some(JobOutcome::TimedOut));
        assert!(!state.snapshot().busy);
        assert!(!executor.workers().has_live_worker());
    }

    #[tokio::test]
    async fn pause_aborts_a_running_job() {
        let state = state(80.0);
        let spy = SpyLauncher::new(Behavior::Hang);
        let executor = Arc::new(JobExecutor::new(WorkerProcessManager::new(spy.clone())));

        let slot = try_admit(&state, &FixedProbe::new(10.0)).unwrap();
        let running = {
            let executor = executor.clone();
            tokio::spawn(async move { executor.execute(slot, text()).await })
        };
        while spy.spawns() == 0 {
            tokio::task::yield_now().await;
        }

        assert!(state.pause());
        let result = tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .expect("abort should resolve promptly")
            .unwrap();
        assert!(matches!(result, Err(GatewayError::Aborted)));
        assert_eq!(spy.kills(), 1);
        assert_eq!(state.snapshot().last_outcome, Some(JobOutcome::Aborted));
        assert!(!state.snapshot().busy);

        state.resume();
        assert!(try_admit(&state, &FixedProbe::new(10.0)).is_ok());
    }

    #[tokio::test]
    async fn completion_before_pause_is_not_aborted() {
        let state = state(80.0);
        let notify = Arc::new(Notify::new());
        let spy = SpyLauncher::new(Behavior::WaitFor(notify.clone(), record(r#"{"status":"ok"}"#)));
        let executor = JobExecutor::new(WorkerProcessManager::new(spy.clone()));

        let slot = try_admit(&state, &FixedProbe::new(10.0)).unwrap();
        notify.notify_one();
        let result = executor.execute(slot, text()).await;
        assert!(result.is_ok());

        // Pausing afterwards has nothing left to abort.
        assert!(!state.pause());
        assert_eq!(spy.kills(), 0);
        assert_eq!(state.snapshot().last_outcome, Some(JobOutcome::Succeeded));
    }
}
