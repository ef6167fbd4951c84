use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, broadcast, watch};
use tokio::task::{self, JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior, interval, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ErrorKind, PipelineError};
use crate::job::{Job, JobStore};
use crate::processor::{JobProcessor, JobRun, panic_message};

/// Scheduling knobs for one worker process.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub worker_id: String,
    pub max_concurrent_jobs: usize,
    pub poll_interval: Duration,
    /// Stop after this long with nothing in flight. Zero disables.
    pub idle_timeout: Duration,
    pub stats_interval: Duration,
    /// Processing locks older than this are released at start-up.
    pub lock_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
            max_concurrent_jobs: 2,
            poll_interval: Duration::from_secs(5),
            idle_timeout: Duration::ZERO,
            stats_interval: Duration::from_secs(60),
            lock_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Counters kept by the run loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub avg_processing_ms: f64,
    pub in_flight: usize,
}

impl WorkerStats {
    /// Fold one finished job into the running mean.
    pub fn record(&mut self, succeeded: bool, elapsed: Duration) {
        self.processed += 1;
        if succeeded {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        let n = self.processed as f64;
        let latest = elapsed.as_secs_f64() * 1000.0;
        self.avg_processing_ms = (self.avg_processing_ms * (n - 1.0) + latest) / n;
    }
}

/// Lifecycle notifications, drained by whoever subscribed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    Started { worker_id: String },
    JobStarted { job_id: String },
    JobCompleted { job_id: String, processing_ms: u64 },
    JobFailed { job_id: String, kind: ErrorKind, message: String },
    Idle { idle_ms: u64 },
    StatsTick { stats: WorkerStats },
    Stopped { stats: WorkerStats },
}

/// Point-in-time view of the worker, published for the status endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
    pub running: bool,
    pub store_reachable: bool,
    pub last_error: Option<String>,
    pub stats: WorkerStats,
}

impl WorkerSnapshot {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            started_at: Utc::now(),
            running: false,
            store_reachable: true,
            last_error: None,
            stats: WorkerStats::default(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.running && self.store_reachable && self.last_error.is_none()
    }

    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds().max(0)
    }
}

type JobTokens = Arc<StdMutex<HashMap<String, CancellationToken>>>;

fn tokens(map: &JobTokens) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Cloneable access to a running orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    events: broadcast::Sender<OrchestratorEvent>,
    snapshot: watch::Receiver<WorkerSnapshot>,
    jobs: JobTokens,
}

impl OrchestratorHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<WorkerSnapshot> {
        self.snapshot.clone()
    }

    /// Ask an in-flight job to stop at its next stage boundary.
    pub fn cancel_job(&self, job_id: &str) -> bool {
        match tokens(&self.jobs).get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_jobs(&self) -> usize {
        tokens(&self.jobs).len()
    }
}

/// Claims jobs from the store and runs them under a concurrency bound.
pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    processor: Arc<JobProcessor>,
    config: OrchestratorConfig,
    events: broadcast::Sender<OrchestratorEvent>,
    snapshot: watch::Sender<WorkerSnapshot>,
    jobs: JobTokens,
}

#[derive(Debug)]
struct Finished {
    job_id: String,
    run: JobRun,
}

/// Mutable state owned by the run loop.
struct LoopState {
    snapshot: WorkerSnapshot,
    last_activity: Instant,
    /// Job id per spawned task, so a task that ends without a result can
    /// still be reported.
    task_jobs: HashMap<task::Id, String>,
}

impl LoopState {
    fn store_ok(&mut self) {
        self.snapshot.store_reachable = true;
        self.snapshot.last_error = None;
    }

    fn store_failed(&mut self, message: String) {
        self.snapshot.store_reachable = false;
        self.snapshot.last_error = Some(message);
    }
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        processor: Arc<JobProcessor>,
        config: OrchestratorConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let (snapshot, _) = watch::channel(WorkerSnapshot::new(config.worker_id.clone()));
        Self {
            store,
            processor,
            config,
            events,
            snapshot,
            jobs: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    pub fn handle(&self) -> OrchestratorHandle {
        OrchestratorHandle {
            events: self.events.clone(),
            snapshot: self.snapshot.subscribe(),
            jobs: self.jobs.clone(),
        }
    }

    fn emit(&self, event: OrchestratorEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn publish(&self, state: &LoopState, in_flight: usize) {
        let mut snapshot = state.snapshot.clone();
        snapshot.stats.in_flight = in_flight;
        self.snapshot.send_replace(snapshot);
    }

    /// Run until `shutdown` fires or the idle timeout elapses, then drain.
    ///
    /// In-flight jobs are never aborted; shutdown waits for each to reach a
    /// terminal state.
    pub async fn run(self, shutdown: CancellationToken) -> WorkerStats {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_jobs.max(1)));
        let mut tasks: JoinSet<Finished> = JoinSet::new();
        let mut state = LoopState {
            snapshot: WorkerSnapshot::new(self.config.worker_id.clone()),
            last_activity: Instant::now(),
            task_jobs: HashMap::new(),
        };
        state.snapshot.running = true;

        info!(
            worker_id = %self.config.worker_id,
            max_concurrent = self.config.max_concurrent_jobs,
            "worker started"
        );
        self.emit(OrchestratorEvent::Started {
            worker_id: self.config.worker_id.clone(),
        });

        match self.store.cleanup_stale(self.config.lock_timeout).await {
            Ok(0) => state.store_ok(),
            Ok(released) => {
                info!(released, "released stale job locks");
                state.store_ok();
            }
            Err(e) => {
                warn!(error = %e, "stale job cleanup failed");
                state.store_failed(e.to_string());
            }
        }
        self.publish(&state, 0);

        let mut poll = interval(self.config.poll_interval.max(Duration::from_millis(1)));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let stats_every = self.config.stats_interval.max(Duration::from_millis(1));
        let mut stats_tick = interval_at(Instant::now() + stats_every, stats_every);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(in_flight = tasks.len(), "shutdown requested, draining");
                    break;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    self.finish(joined, &mut state).await;
                    self.publish(&state, tasks.len());
                }
                _ = poll.tick() => {
                    self.claim_burst(&permits, &mut tasks, &mut state).await;
                    self.publish(&state, tasks.len());

                    let idle = state.last_activity.elapsed();
                    if tasks.is_empty()
                        && !self.config.idle_timeout.is_zero()
                        && idle >= self.config.idle_timeout
                    {
                        info!(idle_ms = idle.as_millis() as u64, "worker idle, stopping");
                        self.emit(OrchestratorEvent::Idle {
                            idle_ms: idle.as_millis() as u64,
                        });
                        break;
                    }
                }
                _ = stats_tick.tick() => {
                    let mut stats = state.snapshot.stats.clone();
                    stats.in_flight = tasks.len();
                    debug!(?stats, "stats");
                    self.emit(OrchestratorEvent::StatsTick { stats });
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            self.finish(joined, &mut state).await;
            self.publish(&state, tasks.len());
        }

        state.snapshot.running = false;
        self.publish(&state, 0);
        let stats = state.snapshot.stats.clone();
        info!(
            processed = stats.processed,
            succeeded = stats.succeeded,
            failed = stats.failed,
            "worker stopped"
        );
        self.emit(OrchestratorEvent::Stopped {
            stats: stats.clone(),
        });
        stats
    }

    /// Claim while permits remain and the store keeps returning jobs.
    async fn claim_burst(
        &self,
        permits: &Arc<Semaphore>,
        tasks: &mut JoinSet<Finished>,
        state: &mut LoopState,
    ) {
        loop {
            let Ok(permit) = permits.clone().try_acquire_owned() else {
                return;
            };
            match self.store.claim_next(&self.config.worker_id).await {
                Ok(Some(job)) => {
                    state.store_ok();
                    state.last_activity = Instant::now();
                    let job_id = job.id.clone();
                    let task_id = self.spawn_job(job, permit, tasks);
                    state.task_jobs.insert(task_id, job_id);
                }
                Ok(None) => {
                    state.store_ok();
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "claim failed");
                    state.store_failed(e.to_string());
                    return;
                }
            }
        }
    }

    fn spawn_job(
        &self,
        job: Job,
        permit: OwnedSemaphorePermit,
        tasks: &mut JoinSet<Finished>,
    ) -> task::Id {
        let token = CancellationToken::new();
        tokens(&self.jobs).insert(job.id.clone(), token.clone());
        info!(job_id = %job.id, priority = job.priority, "job started");
        self.emit(OrchestratorEvent::JobStarted {
            job_id: job.id.clone(),
        });

        let store = self.store.clone();
        let processor = self.processor.clone();
        let handle = tasks.spawn(async move {
            // Held for the whole execution; released when the task ends.
            let _permit = permit;
            let started = std::time::Instant::now();
            let run = match AssertUnwindSafe(processor.run(&job, store.as_ref(), token))
                .catch_unwind()
                .await
            {
                Ok(run) => run,
                Err(panic) => {
                    let err = PipelineError::Internal(format!(
                        "job panicked: {}",
                        panic_message(panic.as_ref())
                    ));
                    let store_error = store
                        .fail(&job.id, &err.to_string(), &err.detail(None))
                        .await
                        .err();
                    JobRun {
                        outcome: Err(err),
                        store_error,
                        elapsed: started.elapsed(),
                    }
                }
            };
            Finished {
                job_id: job.id,
                run,
            }
        });
        handle.id()
    }

    async fn finish(&self, joined: Result<Finished, JoinError>, state: &mut LoopState) {
        state.last_activity = Instant::now();
        let Finished { job_id, run } = match joined {
            Ok(finished) => {
                state.task_jobs.retain(|_, id| *id != finished.job_id);
                finished
            }
            Err(e) => {
                let Some(job_id) = state.task_jobs.remove(&e.id()) else {
                    error!(error = %e, "unknown job task ended abnormally");
                    state.snapshot.last_error = Some(e.to_string());
                    return;
                };
                error!(job_id = %job_id, error = %e, "job task ended abnormally");
                self.abandoned(job_id, e).await
            }
        };
        tokens(&self.jobs).remove(&job_id);

        let succeeded = run.outcome.is_ok();
        state.snapshot.stats.record(succeeded, run.elapsed);
        match &run.outcome {
            Ok(_) => self.emit(OrchestratorEvent::JobCompleted {
                job_id: job_id.clone(),
                processing_ms: run.elapsed.as_millis() as u64,
            }),
            Err(e) => self.emit(OrchestratorEvent::JobFailed {
                job_id: job_id.clone(),
                kind: e.kind(),
                message: e.to_string(),
            }),
        }

        match run.store_error {
            Some(e) => {
                error!(job_id = %job_id, error = %e, "could not report job outcome");
                state.store_failed(e.to_string());
            }
            None => state.store_ok(),
        }
    }

    /// Report a job whose task was aborted or panicked outside the processor.
    async fn abandoned(&self, job_id: String, cause: JoinError) -> Finished {
        let err = PipelineError::Internal(format!("job task ended abnormally: {cause}"));
        let store_error = self
            .store
            .fail(&job_id, &err.to_string(), &err.detail(None))
            .await
            .err();
        Finished {
            job_id,
            run: JobRun {
                outcome: Err(err),
                store_error,
                elapsed: Duration::ZERO,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::job::{JobStatus, MemoryJobStore, fixtures};
    use crate::processor::ProcessorConfig;
    use crate::processor::testing::{FakeEngine, FakeSynth, Harness};

    fn config(max: usize) -> OrchestratorConfig {
        OrchestratorConfig {
            worker_id: "worker-test".into(),
            max_concurrent_jobs: max,
            poll_interval: Duration::from_millis(10),
            idle_timeout: Duration::from_millis(150),
            stats_interval: Duration::from_secs(60),
            lock_timeout: Duration::from_secs(3600),
        }
    }

    fn orchestrator(
        harness: &Harness,
        store: Arc<MemoryJobStore>,
        config: OrchestratorConfig,
    ) -> Orchestrator {
        Orchestrator::new(
            store,
            Arc::new(harness.processor(ProcessorConfig::default())),
            config,
        )
    }

    fn slow_harness(delay_ms: u64) -> Harness {
        Harness::with(
            FakeEngine::default(),
            FakeSynth {
                delay: Duration::from_millis(delay_ms),
                ..Default::default()
            },
        )
    }

    fn drain(rx: &mut broadcast::Receiver<OrchestratorEvent>) -> Vec<OrchestratorEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn never_exceeds_concurrency_cap() {
        let harness = slow_harness(30);
        let store = Arc::new(MemoryJobStore::new());
        for _ in 0..10 {
            store.submit(fixtures::spec("owner-1")).await.unwrap();
        }
        let orch = orchestrator(&harness, store.clone(), config(3));
        let mut rx = orch.handle().subscribe();

        let stats = orch.run(CancellationToken::new()).await;
        assert_eq!(stats.processed, 10);
        assert_eq!(stats.succeeded, 10);
        assert!(harness.synth.peak.load(Ordering::SeqCst) <= 3);

        // Started minus finished, as seen by subscribers, never passes the cap.
        let mut in_flight = 0i32;
        let mut peak = 0;
        for event in drain(&mut rx) {
            match event {
                OrchestratorEvent::JobStarted { .. } => in_flight += 1,
                OrchestratorEvent::JobCompleted { .. } | OrchestratorEvent::JobFailed { .. } => {
                    in_flight -= 1
                }
                _ => {}
            }
            peak = peak.max(in_flight);
        }
        assert!(peak <= 3, "peak in flight {peak}");
        assert_eq!(in_flight, 0);
    }

    #[tokio::test]
    async fn idle_worker_stops_itself() {
        let harness = Harness::new();
        let store = Arc::new(MemoryJobStore::new());
        let orch = orchestrator(&harness, store, config(2));
        let handle = orch.handle();
        let mut rx = handle.subscribe();

        let stats = orch.run(CancellationToken::new()).await;
        assert_eq!(stats, WorkerStats::default());

        let events = drain(&mut rx);
        assert!(matches!(events.first(), Some(OrchestratorEvent::Started { .. })));
        assert!(events.iter().any(|e| matches!(e, OrchestratorEvent::Idle { .. })));
        assert!(matches!(events.last(), Some(OrchestratorEvent::Stopped { .. })));
        assert!(!handle.snapshot().running);
    }

    #[tokio::test]
    async fn shutdown_drains_in_flight_jobs() {
        let harness = slow_harness(200);
        let store = Arc::new(MemoryJobStore::new());
        let a = store.submit(fixtures::spec("owner-1")).await.unwrap();
        let b = store.submit(fixtures::spec("owner-1")).await.unwrap();
        let mut cfg = config(2);
        cfg.idle_timeout = Duration::ZERO;
        let orch = orchestrator(&harness, store.clone(), cfg);
        let mut rx = orch.handle().subscribe();

        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(orch.run(shutdown.clone()));

        let mut started = 0;
        while started < 2 {
            if let OrchestratorEvent::JobStarted { .. } = rx.recv().await.unwrap() {
                started += 1;
            }
        }
        shutdown.cancel();

        let stats = worker.await.unwrap();
        assert_eq!(stats.processed, 2);
        for id in [a.id, b.id] {
            let job = store.get(&id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Completed);
        }
    }

    #[tokio::test]
    async fn cancel_job_stops_at_next_boundary() {
        let harness = slow_harness(100);
        let store = Arc::new(MemoryJobStore::new());
        let mut spec = fixtures::spec("owner-1");
        spec.payload.script_text =
            "First sentence goes here. Second sentence goes here. Third sentence goes here.".into();
        let job = store.submit(spec).await.unwrap();

        let mut cfg = config(1);
        cfg.idle_timeout = Duration::ZERO;
        let orch = orchestrator(&harness, store.clone(), cfg);
        let handle = orch.handle();
        let mut rx = handle.subscribe();
        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(orch.run(shutdown.clone()));

        loop {
            if let OrchestratorEvent::JobStarted { job_id } = rx.recv().await.unwrap() {
                assert!(handle.cancel_job(&job_id));
                break;
            }
        }
        loop {
            if let OrchestratorEvent::JobFailed { kind, .. } = rx.recv().await.unwrap() {
                assert_eq!(kind, ErrorKind::Cancelled);
                break;
            }
        }
        shutdown.cancel();
        worker.await.unwrap();

        let stored = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert!(harness.synth.calls.load(Ordering::SeqCst) < 3);
        assert!(!handle.cancel_job(&job.id));
    }

    #[tokio::test]
    async fn failed_jobs_are_counted() {
        let harness = Harness::with(
            FakeEngine {
                fail_mix: true,
                ..Default::default()
            },
            FakeSynth::default(),
        );
        let store = Arc::new(MemoryJobStore::new());
        store.submit(fixtures::spec("owner-1")).await.unwrap();
        let orch = orchestrator(&harness, store, config(1));
        let mut rx = orch.handle().subscribe();

        let stats = orch.run(CancellationToken::new()).await;
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.failed, 1);
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            OrchestratorEvent::JobFailed {
                kind: ErrorKind::Stage,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn stale_locks_are_released_at_startup() {
        let harness = Harness::new();
        let store = Arc::new(MemoryJobStore::new());
        let mut stale = Job::new(fixtures::spec("owner-1"));
        stale.status = JobStatus::Processing;
        stale.locked_by = Some("dead-worker".into());
        stale.locked_at = Some(Utc::now() - chrono::Duration::hours(2));
        let id = stale.id.clone();
        store.insert(stale);

        let orch = orchestrator(&harness, store.clone(), config(1));
        orch.run(CancellationToken::new()).await;

        let job = store.get(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("worker lock expired"));
    }

    #[tokio::test]
    async fn aborted_task_is_reported_and_released() {
        let harness = Harness::new();
        let store = Arc::new(MemoryJobStore::new());
        let job = store.submit(fixtures::spec("owner-1")).await.unwrap();
        store.claim_next("worker-test").await.unwrap().unwrap();

        let orch = orchestrator(&harness, store.clone(), config(1));
        let handle = orch.handle();
        let mut rx = handle.subscribe();
        tokens(&orch.jobs).insert(job.id.clone(), CancellationToken::new());

        let task = tokio::spawn(std::future::pending::<Finished>());
        task.abort();
        let join_error = task.await.unwrap_err();

        let mut state = LoopState {
            snapshot: WorkerSnapshot::new("worker-test"),
            last_activity: Instant::now(),
            task_jobs: HashMap::from([(join_error.id(), job.id.clone())]),
        };
        orch.finish(Err(join_error), &mut state).await;

        assert!(state.task_jobs.is_empty());
        assert_eq!(handle.active_jobs(), 0);
        assert_eq!(state.snapshot.stats.failed, 1);
        let stored = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(
            stored
                .error_message
                .unwrap()
                .contains("job task ended abnormally")
        );
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            OrchestratorEvent::JobFailed {
                kind: ErrorKind::Internal,
                ..
            }
        )));
    }

    #[test]
    fn running_mean_of_processing_time() {
        let mut stats = WorkerStats::default();
        stats.record(true, Duration::from_millis(100));
        stats.record(false, Duration::from_millis(300));
        stats.record(true, Duration::from_millis(200));
        assert_eq!(stats.processed, 3);
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.failed, 1);
        assert!((stats.avg_processing_ms - 200.0).abs() < 1e-6);
    }

    #[test]
    fn snapshot_health() {
        let mut snapshot = WorkerSnapshot::new("w");
        assert!(!snapshot.is_healthy());
        snapshot.running = true;
        assert!(snapshot.is_healthy());
        snapshot.last_error = Some("claim failed".into());
        assert!(!snapshot.is_healthy());
    }

    #[test]
    fn events_serialize_tagged() {
        let event = OrchestratorEvent::JobStarted {
            job_id: "j1".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "job_started");
        assert_eq!(json["job_id"], "j1");
    }
}
