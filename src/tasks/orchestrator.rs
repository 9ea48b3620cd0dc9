//! Task orchestrator
//!
//! Accepts job submissions, queues them on a bounded channel and runs them on
//! a fixed pool of workers. Each job executes on the blocking pool so scans
//! never stall the async runtime.
//!
//! ```text
//! submit ──► JobStore (Pending) ──► mpsc queue ──► worker N ──► spawn_blocking
//!                                                       │          │
//!                                                       │    JobRunner::run
//!                                                       │          │ report(%)
//!                                                       ▼          ▼
//!                                                 ProgressChannel ◄┘
//! ```
//!
//! Retryable failures (I/O, unavailable sources) restart the job with a
//! linear backoff plus jitter, up to the kind's retry limit. Cancellation
//! marks the job `Cancelled` immediately; the worker notices at its next
//! chunk boundary, any later transition it attempts is rejected, and the
//! partial artifact is removed.

use crate::config::TasksConfig;
use crate::error::{Error, Result};
use crate::metrics;
use crate::query::budget::{CancellationFlag, ScanBudget};
use crate::tasks::job::{CancelAck, ExportJob, JobId, JobResult, JobSpec, JobState, JobStatus};
use crate::tasks::progress::{JobEvent, ProgressChannel};
use crate::tasks::store::JobStore;
use dashmap::DashMap;
use rand::Rng;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Executes the body of a job
///
/// Implementations run on the blocking pool and should poll
/// [`JobContext::budget`] or [`JobContext::is_cancelled`] between chunks.
pub trait JobRunner: Send + Sync + 'static {
    /// Run one attempt of `job`
    fn run(&self, job: &ExportJob, ctx: &JobContext) -> Result<JobResult>;
}

/// Handle a runner uses to talk back to the orchestrator
pub struct JobContext {
    id: JobId,
    cancel: CancellationFlag,
    store: Arc<JobStore>,
    channel: Arc<ProgressChannel>,
}

impl JobContext {
    /// Job id
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Unlimited budget tied to the job's cancellation flag
    pub fn budget(&self, operation: &'static str) -> ScanBudget {
        ScanBudget::unlimited(operation).with_cancel(self.cancel.clone())
    }

    /// Publish a progress estimate
    ///
    /// Percentages below the last published value are raised to it, and 100
    /// is reserved for success.
    pub fn report(&self, percent: u8) -> Result<()> {
        let snapshot = self.store.update(self.id, |job| {
            if job.state.is_terminal() {
                return Err(Error::Cancelled);
            }
            let percent = percent.min(99).max(job.progress);
            if job.state == (JobState::Progress { percent }) {
                return Ok(());
            }
            job.apply(JobState::Progress { percent })
        })?;
        self.channel.publish(&snapshot.status());
        Ok(())
    }

    /// Where the runner writes the in-progress artifact
    pub fn partial_path(&self) -> PathBuf {
        self.store.partial_path(self.id)
    }

    /// Promote the partial artifact to its final name
    pub fn commit_artifact(&self, rows: u64, bytes: u64) -> Result<JobResult> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let path = self.store.artifact_path(self.id);
        fs::rename(self.partial_path(), &path)?;
        Ok(JobResult::Artifact { path, rows, bytes })
    }
}

/// Live subscription to a job's events
///
/// Yields the acknowledgement first, then updates until the job reaches a
/// terminal state or the topic closes.
pub struct JobSubscription {
    ack: Option<JobEvent>,
    receiver: broadcast::Receiver<JobEvent>,
    done: bool,
}

impl JobSubscription {
    /// Next event, or `None` once the stream has ended
    pub async fn next(&mut self) -> Option<JobEvent> {
        if let Some(ack) = self.ack.take() {
            self.done = ack.is_final();
            return Some(ack);
        }
        if self.done {
            return None;
        }
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    self.done = event.is_final();
                    return Some(event);
                },
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Progress subscriber lagged");
                    continue;
                },
                Err(broadcast::error::RecvError::Closed) => {
                    self.done = true;
                    return None;
                },
            }
        }
    }
}

struct Shared {
    store: Arc<JobStore>,
    channel: Arc<ProgressChannel>,
    cancels: DashMap<JobId, CancellationFlag>,
    runner: Arc<dyn JobRunner>,
    config: TasksConfig,
    active: AtomicUsize,
    queue: Mutex<mpsc::Receiver<JobId>>,
}

/// Job submission, execution and cancellation
pub struct TaskOrchestrator {
    shared: Arc<Shared>,
    sender: mpsc::Sender<JobId>,
}

impl std::fmt::Debug for TaskOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskOrchestrator")
            .field("jobs", &self.shared.store.len())
            .field("active", &self.active_jobs())
            .finish()
    }
}

impl TaskOrchestrator {
    /// Build an orchestrator; workers start with [`run_workers`](Self::run_workers)
    pub fn new(config: TasksConfig, store: Arc<JobStore>, runner: Arc<dyn JobRunner>) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let channel = Arc::new(ProgressChannel::new(config.progress_buffer));
        Self {
            shared: Arc::new(Shared {
                store,
                channel,
                cancels: DashMap::new(),
                runner,
                config,
                active: AtomicUsize::new(0),
                queue: Mutex::new(receiver),
            }),
            sender,
        }
    }

    /// Job store
    pub fn store(&self) -> &Arc<JobStore> {
        &self.shared.store
    }

    /// Progress channel
    pub fn channel(&self) -> &Arc<ProgressChannel> {
        &self.shared.channel
    }

    /// Jobs currently executing
    pub fn active_jobs(&self) -> usize {
        self.shared.active.load(Ordering::Relaxed)
    }

    /// Queue a job
    ///
    /// Fails with [`Error::ResourceExceeded`] when the queue is full.
    pub fn submit(&self, spec: JobSpec) -> Result<JobStatus> {
        let job = ExportJob::new(spec);
        let id = job.id;
        let status = job.status();
        self.shared.store.insert(job);
        match self.sender.try_send(id) {
            Ok(()) => {
                info!(job = %id, kind = status.kind.label(), "Job submitted");
                Ok(status)
            },
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.shared.store.remove(id);
                Err(Error::resource_exceeded(
                    "submit",
                    format!("job queue is full ({} pending)", self.shared.config.queue_capacity),
                    None,
                ))
            },
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.shared.store.remove(id);
                Err(Error::JobExecution("job workers have stopped".to_string()))
            },
        }
    }

    /// Current status of a job
    pub fn status(&self, id: JobId) -> Result<JobStatus> {
        self.shared
            .store
            .get(id)
            .map(|job| job.status())
            .ok_or_else(|| Error::JobNotFound(id.to_string()))
    }

    /// Request cancellation
    ///
    /// Cancelling a finished job is a no-op reported with `cancelled: false`.
    pub fn cancel(&self, id: JobId) -> Result<CancelAck> {
        let shared = &self.shared;
        if !shared.store.contains(id) {
            return Err(Error::JobNotFound(id.to_string()));
        }
        shared.cancels.entry(id).or_default().cancel();

        let mut cancelled = false;
        let snapshot = shared.store.update(id, |job| {
            if job.state.is_terminal() {
                return Ok(());
            }
            job.apply(JobState::Cancelled)?;
            cancelled = true;
            Ok(())
        })?;

        if cancelled {
            info!(job = %id, "Job cancelled");
            metrics::record_job(
                snapshot.kind.label(),
                JobState::Cancelled.label(),
                elapsed_secs(&snapshot),
            );
            shared.channel.publish(&snapshot.status());
            shared.channel.close(id);
        } else {
            shared.cancels.remove(&id);
        }
        Ok(CancelAck {
            job_id: id,
            cancelled,
            state: snapshot.state,
        })
    }

    /// Subscribe to a job's progress events
    pub fn subscribe(&self, id: JobId) -> Result<JobSubscription> {
        if !self.shared.store.contains(id) {
            return Err(Error::JobNotFound(id.to_string()));
        }
        let receiver = self.shared.channel.subscribe(id);
        let status = self.status(id)?;
        if status.state.is_terminal() {
            self.shared.channel.close(id);
        }
        Ok(JobSubscription {
            ack: Some(JobEvent::SubscribeAck { status }),
            receiver,
            done: false,
        })
    }

    /// Run the worker pool until shutdown is signalled
    pub async fn run_workers(&self, shutdown: broadcast::Receiver<()>) {
        let workers = self.shared.config.workers.max(1);
        info!(workers, "Starting job workers");
        let mut set = JoinSet::new();
        for worker in 0..workers {
            let shared = Arc::clone(&self.shared);
            let shutdown = shutdown.resubscribe();
            set.spawn(worker_loop(worker, shared, shutdown));
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Job worker panicked");
            }
        }
        info!("Job workers stopped");
    }
}

async fn worker_loop(worker: usize, shared: Arc<Shared>, mut shutdown: broadcast::Receiver<()>) {
    debug!(worker, "Job worker started");
    loop {
        let next = tokio::select! {
            _ = shutdown.recv() => break,
            id = async { shared.queue.lock().await.recv().await } => id,
        };
        let Some(id) = next else {
            break;
        };
        let job_shared = Arc::clone(&shared);
        if let Err(e) = tokio::task::spawn_blocking(move || job_shared.execute(id)).await {
            error!(job = %id, error = %e, "Job execution panicked");
            shared.finish(id, JobState::Failed, Some("worker panicked".to_string()), None);
        }
    }
    debug!(worker, "Job worker stopped");
}

fn elapsed_secs(job: &ExportJob) -> f64 {
    (job.updated_at - job.created_at)
        .to_std()
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl Shared {
    fn execute(&self, id: JobId) {
        let Some(job) = self.store.get(id) else {
            return;
        };
        if job.state.is_terminal() {
            self.cancels.remove(&id);
            debug!(job = %id, state = %job.state, "Skipping finished job");
            return;
        }
        let cancel = self.cancels.entry(id).or_default().clone();
        let ctx = JobContext {
            id,
            cancel: cancel.clone(),
            store: Arc::clone(&self.store),
            channel: Arc::clone(&self.channel),
        };

        if self.advance(id, JobState::Started { retries: 0 }).is_err() {
            self.cleanup(id);
            return;
        }
        self.active.fetch_add(1, Ordering::Relaxed);
        metrics::ACTIVE_JOBS.inc();
        let started = Instant::now();
        let kind = job.kind.label();
        info!(job = %id, kind, "Job started");

        let mut retries = 0u32;
        loop {
            match self.attempt(&job, &ctx) {
                Ok(result) => {
                    if let JobResult::Artifact { bytes, .. } = &result {
                        metrics::record_export_bytes("job", *bytes);
                    }
                    self.finish(id, JobState::Succeeded, None, Some(result));
                    break;
                },
                Err(_) if cancel.is_cancelled() => {
                    self.finish(id, JobState::Cancelled, None, None);
                    break;
                },
                Err(Error::Cancelled) => {
                    self.finish(id, JobState::Cancelled, None, None);
                    break;
                },
                Err(e) if e.is_retryable() && retries < job.kind.max_retries() => {
                    retries += 1;
                    let delay = self.backoff(retries);
                    warn!(
                        job = %id,
                        retries,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying job"
                    );
                    metrics::record_job_retry(kind);
                    std::thread::sleep(delay);
                    if cancel.is_cancelled()
                        || self.advance(id, JobState::Started { retries }).is_err()
                    {
                        self.finish(id, JobState::Cancelled, None, None);
                        break;
                    }
                },
                Err(e) => {
                    error!(job = %id, kind, error = %e, "Job failed");
                    metrics::record_error(e.code(), kind);
                    self.finish(id, JobState::Failed, Some(e.to_string()), None);
                    break;
                },
            }
        }

        self.active.fetch_sub(1, Ordering::Relaxed);
        metrics::ACTIVE_JOBS.dec();
        info!(job = %id, kind, elapsed_ms = started.elapsed().as_millis() as u64, "Job finished");
    }

    fn attempt(&self, job: &ExportJob, ctx: &JobContext) -> Result<JobResult> {
        let result = self.runner.run(job, ctx);
        if result.is_err() {
            self.remove_partial(ctx.id);
        }
        result
    }

    fn advance(&self, id: JobId, next: JobState) -> Result<()> {
        let snapshot = self.store.transition(id, next)?;
        self.channel.publish(&snapshot.status());
        Ok(())
    }

    fn backoff(&self, retries: u32) -> Duration {
        let base = self.config.retry_backoff_ms.saturating_mul(retries as u64);
        let jitter = if base > 0 {
            rand::thread_rng().gen_range(0..=base / 2)
        } else {
            0
        };
        Duration::from_millis(base + jitter)
    }

    /// Move a job to a terminal state, unless it already is in one
    fn finish(&self, id: JobId, state: JobState, error: Option<String>, result: Option<JobResult>) {
        let mut changed = false;
        let outcome = self.store.update(id, |job| {
            if job.state.is_terminal() {
                return Ok(());
            }
            job.apply(state)?;
            job.error = error;
            job.result = result;
            changed = true;
            Ok(())
        });
        match outcome {
            Ok(snapshot) if changed => {
                metrics::record_job(snapshot.kind.label(), state.label(), elapsed_secs(&snapshot));
                self.channel.publish(&snapshot.status());
                self.channel.close(id);
            },
            Ok(snapshot) => {
                debug!(job = %id, state = %snapshot.state, "Job already finished");
                if state == JobState::Succeeded {
                    let artifact = self.store.artifact_path(id);
                    if artifact.exists() {
                        if let Err(e) = fs::remove_file(&artifact) {
                            warn!(job = %id, error = %e, "Failed to delete orphaned artifact");
                        }
                    }
                }
            },
            Err(e) => {
                warn!(job = %id, error = %e, "Failed to record job outcome");
                self.channel.close(id);
            },
        }
        self.cleanup(id);
    }

    fn cleanup(&self, id: JobId) {
        self.cancels.remove(&id);
        self.remove_partial(id);
    }

    fn remove_partial(&self, id: JobId) {
        let partial = self.store.partial_path(id);
        if partial.exists() {
            if let Err(e) = fs::remove_file(&partial) {
                warn!(job = %id, error = %e, "Failed to delete partial artifact");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::FilterSpec;
    use crate::tasks::job::JobKind;
    use std::io::Write;
    use std::sync::atomic::AtomicU32;
    use std::sync::Barrier;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> TasksConfig {
        TasksConfig {
            artifact_dir: dir.path().to_path_buf(),
            workers: 2,
            queue_capacity: 4,
            retry_backoff_ms: 1,
            ..TasksConfig::default()
        }
    }

    fn spec() -> JobSpec {
        JobSpec {
            kind: JobKind::RowLevelExport,
            filter: FilterSpec::default(),
        }
    }

    /// Writes a small artifact in three chunks
    struct ChunkedRunner;

    impl JobRunner for ChunkedRunner {
        fn run(&self, _job: &ExportJob, ctx: &JobContext) -> Result<JobResult> {
            let mut file = fs::File::create(ctx.partial_path())?;
            for (i, percent) in [10u8, 50, 90].into_iter().enumerate() {
                ctx.budget("export").check()?;
                writeln!(file, "chunk{}", i)?;
                ctx.report(percent)?;
            }
            file.flush()?;
            ctx.commit_artifact(3, 21)
        }
    }

    /// Fails with a retryable error until `failures` attempts have passed
    struct FlakyRunner {
        failures: u32,
        attempts: AtomicU32,
    }

    impl JobRunner for FlakyRunner {
        fn run(&self, _job: &ExportJob, _ctx: &JobContext) -> Result<JobResult> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                return Err(Error::source_unavailable("fact", "transient"));
            }
            Ok(JobResult::Inline {
                payload: serde_json::json!({"attempt": attempt}),
            })
        }
    }

    /// Spins until cancelled
    struct BlockingRunner;

    impl JobRunner for BlockingRunner {
        fn run(&self, _job: &ExportJob, ctx: &JobContext) -> Result<JobResult> {
            fs::write(ctx.partial_path(), b"partial")?;
            ctx.report(10)?;
            loop {
                ctx.budget("export").check()?;
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    }

    fn orchestrator(dir: &TempDir, runner: Arc<dyn JobRunner>) -> Arc<TaskOrchestrator> {
        let store = Arc::new(JobStore::open(dir.path()).unwrap());
        Arc::new(TaskOrchestrator::new(config(dir), store, runner))
    }

    fn spawn_workers(orch: &Arc<TaskOrchestrator>) -> broadcast::Sender<()> {
        let (tx, rx) = broadcast::channel(1);
        let orch = Arc::clone(orch);
        tokio::spawn(async move { orch.run_workers(rx).await });
        tx
    }

    async fn wait_terminal(orch: &TaskOrchestrator, id: JobId) -> JobStatus {
        for _ in 0..500 {
            let status = orch.status(id).unwrap();
            if status.state.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} did not finish", id);
    }

    #[tokio::test]
    async fn test_job_lifecycle_with_progress() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir, Arc::new(ChunkedRunner));
        let submitted = orch.submit(spec()).unwrap();
        assert_eq!(submitted.state, JobState::Pending);
        let mut sub = orch.subscribe(submitted.job_id).unwrap();
        let _shutdown = spawn_workers(&orch);

        let mut percents = Vec::new();
        while let Some(event) = sub.next().await {
            if let Some(status) = event.status() {
                percents.push(status.progress);
            }
        }
        assert_eq!(percents.first(), Some(&0));
        assert_eq!(percents.last(), Some(&100));
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));

        let status = wait_terminal(&orch, submitted.job_id).await;
        assert_eq!(status.state, JobState::Succeeded);
        match status.result {
            Some(JobResult::Artifact { path, rows, .. }) => {
                assert_eq!(rows, 3);
                assert!(path.exists());
            },
            other => panic!("unexpected result {:?}", other),
        }
        assert!(!orch.store().partial_path(submitted.job_id).exists());
    }

    #[tokio::test]
    async fn test_retryable_failure_is_retried() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(
            &dir,
            Arc::new(FlakyRunner {
                failures: 2,
                attempts: AtomicU32::new(0),
            }),
        );
        let _shutdown = spawn_workers(&orch);
        let id = orch.submit(spec()).unwrap().job_id;
        let status = wait_terminal(&orch, id).await;
        assert_eq!(status.state, JobState::Succeeded);
        assert_eq!(
            status.result,
            Some(JobResult::Inline {
                payload: serde_json::json!({"attempt": 2})
            })
        );
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(
            &dir,
            Arc::new(FlakyRunner {
                failures: 100,
                attempts: AtomicU32::new(0),
            }),
        );
        let _shutdown = spawn_workers(&orch);
        let id = orch.submit(spec()).unwrap().job_id;
        let status = wait_terminal(&orch, id).await;
        assert_eq!(status.state, JobState::Failed);
        assert!(status.error.unwrap().contains("transient"));
    }

    #[tokio::test]
    async fn test_cancel_running_job() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir, Arc::new(BlockingRunner));
        let _shutdown = spawn_workers(&orch);
        let id = orch.submit(spec()).unwrap().job_id;

        for _ in 0..500 {
            if matches!(orch.status(id).unwrap().state, JobState::Progress { .. }) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let ack = orch.cancel(id).unwrap();
        assert!(ack.cancelled);
        assert_eq!(ack.state, JobState::Cancelled);

        let again = orch.cancel(id).unwrap();
        assert!(!again.cancelled);

        for _ in 0..500 {
            if orch.active_jobs() == 0 && !orch.store().partial_path(id).exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(orch.status(id).unwrap().state, JobState::Cancelled);
        assert!(!orch.store().partial_path(id).exists());
        assert!(!orch.store().artifact_path(id).exists());
    }

    #[tokio::test]
    async fn test_cancel_pending_job_never_runs() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir, Arc::new(ChunkedRunner));
        let id = orch.submit(spec()).unwrap().job_id;
        assert!(orch.cancel(id).unwrap().cancelled);
        let _shutdown = spawn_workers(&orch);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(orch.status(id).unwrap().state, JobState::Cancelled);
        assert!(!orch.store().artifact_path(id).exists());
    }

    /// Reports once, then returns an inline payload
    struct InlineRunner;

    impl JobRunner for InlineRunner {
        fn run(&self, _job: &ExportJob, ctx: &JobContext) -> Result<JobResult> {
            ctx.report(40)?;
            Ok(JobResult::Inline {
                payload: serde_json::json!({"ok": true}),
            })
        }
    }

    fn break_manifest_dir(orch: &TaskOrchestrator) {
        let manifests = orch.store().artifact_dir().join("jobs");
        fs::remove_dir_all(&manifests).unwrap();
        fs::write(&manifests, b"").unwrap();
    }

    async fn collect_states(sub: &mut JobSubscription) -> Vec<JobState> {
        let mut states = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = sub.next().await {
                if let Some(status) = event.status() {
                    states.push(status.state);
                }
            }
        })
        .await
        .expect("subscription did not end");
        states
    }

    #[tokio::test]
    async fn test_terminal_event_published_when_manifest_write_fails() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir, Arc::new(InlineRunner));
        break_manifest_dir(&orch);

        let id = orch.submit(spec()).unwrap().job_id;
        let mut sub = orch.subscribe(id).unwrap();
        let _shutdown = spawn_workers(&orch);

        let states = collect_states(&mut sub).await;
        assert_eq!(states.first(), Some(&JobState::Pending));
        assert_eq!(states.last(), Some(&JobState::Succeeded));
        assert_eq!(states.iter().filter(|s| s.is_terminal()).count(), 1);
        assert_eq!(orch.status(id).unwrap().state, JobState::Succeeded);
    }

    #[tokio::test]
    async fn test_cancel_publishes_when_manifest_write_fails() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir, Arc::new(ChunkedRunner));
        break_manifest_dir(&orch);

        let id = orch.submit(spec()).unwrap().job_id;
        let mut sub = orch.subscribe(id).unwrap();
        let ack = orch.cancel(id).unwrap();
        assert!(ack.cancelled);

        let states = collect_states(&mut sub).await;
        assert_eq!(states, vec![JobState::Pending, JobState::Cancelled]);
    }

    /// Parks after its first report until the test has cancelled the job
    struct GatedRunner {
        gate: Arc<Barrier>,
        late_report_rejected: parking_lot::Mutex<Option<bool>>,
    }

    impl JobRunner for GatedRunner {
        fn run(&self, _job: &ExportJob, ctx: &JobContext) -> Result<JobResult> {
            fs::write(ctx.partial_path(), b"chunk0\n")?;
            ctx.report(30)?;
            self.gate.wait();
            self.gate.wait();
            let late = ctx.report(60);
            *self.late_report_rejected.lock() = Some(matches!(late, Err(Error::Cancelled)));
            late?;
            ctx.commit_artifact(1, 7)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_no_events_after_mid_progress_cancel() {
        let dir = TempDir::new().unwrap();
        let gate = Arc::new(Barrier::new(2));
        let runner = Arc::new(GatedRunner {
            gate: Arc::clone(&gate),
            late_report_rejected: parking_lot::Mutex::new(None),
        });
        let orch = orchestrator(&dir, runner.clone());
        let id = orch.submit(spec()).unwrap().job_id;
        let mut sub = orch.subscribe(id).unwrap();
        let mut raw = orch.channel().subscribe(id);
        let _shutdown = spawn_workers(&orch);

        let pass = |gate: Arc<Barrier>| tokio::task::spawn_blocking(move || gate.wait());
        pass(Arc::clone(&gate)).await.unwrap();
        assert!(orch.store().partial_path(id).exists());
        assert!(orch.cancel(id).unwrap().cancelled);
        pass(Arc::clone(&gate)).await.unwrap();

        let states = collect_states(&mut sub).await;
        assert_eq!(
            states,
            vec![
                JobState::Pending,
                JobState::Started { retries: 0 },
                JobState::Progress { percent: 30 },
                JobState::Cancelled,
            ]
        );

        for _ in 0..500 {
            if orch.active_jobs() == 0 && !orch.store().partial_path(id).exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*runner.late_report_rejected.lock(), Some(true));
        assert!(!orch.store().partial_path(id).exists());
        assert!(!orch.store().artifact_path(id).exists());
        assert_eq!(orch.status(id).unwrap().state, JobState::Cancelled);

        // the raw topic saw the cancel last, then closed
        let mut published = Vec::new();
        while let Ok(event) = raw.try_recv() {
            published.extend(event.status().map(|s| s.state));
        }
        assert_eq!(published.last(), Some(&JobState::Cancelled));
        assert_eq!(orch.channel().stats().events_dropped.load(Ordering::Relaxed), 0);
    }

    /// Commits its artifact, then parks until the test has cancelled the job
    struct LateCommitRunner {
        gate: Arc<Barrier>,
    }

    impl JobRunner for LateCommitRunner {
        fn run(&self, _job: &ExportJob, ctx: &JobContext) -> Result<JobResult> {
            fs::write(ctx.partial_path(), b"chunk0\n")?;
            let result = ctx.commit_artifact(1, 7)?;
            self.gate.wait();
            self.gate.wait();
            Ok(result)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_success_after_cancel_removes_artifact() {
        let dir = TempDir::new().unwrap();
        let gate = Arc::new(Barrier::new(2));
        let orch = orchestrator(
            &dir,
            Arc::new(LateCommitRunner {
                gate: Arc::clone(&gate),
            }),
        );
        let id = orch.submit(spec()).unwrap().job_id;
        let _shutdown = spawn_workers(&orch);

        let pass = |gate: Arc<Barrier>| tokio::task::spawn_blocking(move || gate.wait());
        pass(Arc::clone(&gate)).await.unwrap();
        assert!(orch.store().artifact_path(id).exists());
        assert!(orch.cancel(id).unwrap().cancelled);
        pass(Arc::clone(&gate)).await.unwrap();

        for _ in 0..500 {
            if orch.active_jobs() == 0 && !orch.store().artifact_path(id).exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!orch.store().artifact_path(id).exists());
        let job = orch.status(id).unwrap();
        assert_eq!(job.state, JobState::Cancelled);
        assert!(job.result.is_none());
    }

    #[tokio::test]
    async fn test_queue_full_is_resource_exceeded() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir, Arc::new(ChunkedRunner));
        for _ in 0..4 {
            orch.submit(spec()).unwrap();
        }
        let err = orch.submit(spec()).unwrap_err();
        assert!(matches!(err, Error::ResourceExceeded(_)));
        assert_eq!(orch.store().len(), 4);
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir, Arc::new(ChunkedRunner));
        let id = JobId::new();
        assert!(matches!(orch.status(id), Err(Error::JobNotFound(_))));
        assert!(matches!(orch.cancel(id), Err(Error::JobNotFound(_))));
        assert!(orch.subscribe(id).is_err());
    }

    #[tokio::test]
    async fn test_subscribe_to_finished_job_ends_after_ack() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir, Arc::new(ChunkedRunner));
        let id = orch.submit(spec()).unwrap().job_id;
        orch.cancel(id).unwrap();
        let mut sub = orch.subscribe(id).unwrap();
        let ack = sub.next().await.unwrap();
        assert!(matches!(ack, JobEvent::SubscribeAck { .. }));
        assert!(sub.next().await.is_none());
    }
}
