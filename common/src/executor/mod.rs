// Executor module for job execution
// Resolves the registered handler and runs jobs as cancellable tokio tasks

pub mod script;

use crate::errors::ExecutionError;
use crate::models::{Job, JobState};
use crate::registry::JobRegistry;
use crate::telemetry;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn, Instrument};

pub use script::ScriptHandler;

/// Job implementation plugged into the executor
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run the job and return its final output
    ///
    /// Implementations should watch `ctx` for cancellation and return
    /// [`ExecutionError::Canceled`] when they stop early. Ignoring the signal
    /// is allowed; the natural outcome is then reported.
    async fn run(&self, job: &Job, ctx: JobContext) -> Result<String, ExecutionError>;
}

/// Per-job handle given to a running handler
#[derive(Clone)]
pub struct JobContext {
    job_id: String,
    registry: Arc<JobRegistry>,
    cancel: CancellationToken,
    workdir: PathBuf,
}

impl JobContext {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once cancellation has been requested
    pub async fn canceled(&self) {
        self.cancel.cancelled().await
    }

    /// Stream progress output into the registry ahead of the final result
    pub fn emit(&self, chunk: &str) {
        if let Err(e) = self.registry.append_output(&self.job_id, chunk) {
            warn!(job_id = %self.job_id, error = %e, "Dropped progress output");
        }
    }
}

/// Runs jobs for the single registered work type
pub struct JobExecutor {
    handler_name: String,
    registry: Arc<JobRegistry>,
    handler: Arc<dyn JobHandler>,
    workdir: PathBuf,
    in_flight: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl JobExecutor {
    pub fn new(
        handler_name: impl Into<String>,
        registry: Arc<JobRegistry>,
        handler: Arc<dyn JobHandler>,
        workdir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            handler_name: handler_name.into(),
            registry,
            handler,
            workdir: workdir.into(),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn handler_name(&self) -> &str {
        &self.handler_name
    }

    /// Validate and schedule a job, returning without waiting for it
    ///
    /// The job is `running` in the registry by the time this returns. A job
    /// for another work type is marked `failed` and never reaches the handler.
    #[instrument(skip(self, job), fields(job_id = %job.id, work_type = %job.work_type))]
    pub fn submit(&self, job: &Job) -> Result<(), ExecutionError> {
        if job.work_type != self.handler_name {
            let err = ExecutionError::UnsupportedWorkType {
                work_type: job.work_type.clone(),
            };
            warn!(expected = %self.handler_name, "Rejecting job with unsupported work type");
            self.settle(&job.id, JobState::Failed, &err.to_string());
            return Err(err);
        }

        if let Err(e) = self.registry.transition(&job.id, JobState::Running, None) {
            error!(error = %e, "Registry refused executor pickup");
            self.fail_unless_terminal(&job.id, &e.to_string());
            return Err(ExecutionError::Aborted(e.to_string()));
        }

        let cancel = CancellationToken::new();
        self.in_flight.lock().insert(job.id.clone(), cancel.clone());

        let ctx = JobContext {
            job_id: job.id.clone(),
            registry: Arc::clone(&self.registry),
            cancel,
            workdir: self.workdir.clone(),
        };
        let runner = JobRun {
            registry: Arc::clone(&self.registry),
            handler: Arc::clone(&self.handler),
            in_flight: Arc::clone(&self.in_flight),
        };
        let job = job.clone();

        tokio::spawn(runner.run(job, ctx).in_current_span());
        Ok(())
    }

    /// Ask a running job to stop. Returns false if it is not in flight.
    #[instrument(skip(self))]
    pub fn cancel(&self, id: &str) -> bool {
        match self.in_flight.lock().get(id) {
            Some(token) => {
                info!("Cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    fn settle(&self, id: &str, state: JobState, output: &str) {
        settle(&self.registry, id, state, output);
    }

    fn fail_unless_terminal(&self, id: &str, detail: &str) {
        fail_unless_terminal(&self.registry, id, detail);
    }
}

/// Everything a spawned job needs once it leaves `submit`
struct JobRun {
    registry: Arc<JobRegistry>,
    handler: Arc<dyn JobHandler>,
    in_flight: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl JobRun {
    async fn run(self, job: Job, ctx: JobContext) {
        let started = Instant::now();
        let id = job.id.clone();
        info!("Job started");

        // Run the handler in its own task so a panic is contained to this job
        let handler = Arc::clone(&self.handler);
        let task = tokio::spawn(async move { handler.run(&job, ctx).await }.in_current_span());
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) => Err(ExecutionError::Aborted(e.to_string())),
        };

        self.in_flight.lock().remove(&id);

        let (state, output) = match outcome {
            Ok(output) => (JobState::Succeeded, output),
            Err(ExecutionError::Canceled) => {
                (JobState::Canceled, ExecutionError::Canceled.to_string())
            }
            Err(e) => {
                warn!(error = %e, "Job failed");
                (JobState::Failed, e.to_string())
            }
        };

        telemetry::record_job_duration(started.elapsed().as_secs_f64());
        info!(status = %state, elapsed_ms = started.elapsed().as_millis() as u64, "Job finished");
        settle(&self.registry, &id, state, &output);
    }
}

/// Record a terminal outcome; a refused transition marks the job failed
fn settle(registry: &JobRegistry, id: &str, state: JobState, output: &str) {
    match registry.transition(id, state, Some(output)) {
        Ok(()) => telemetry::record_job_completed(state),
        Err(e) => {
            error!(job_id = %id, error = %e, "Invalid job transition");
            fail_unless_terminal(registry, id, &e.to_string());
        }
    }
}

fn fail_unless_terminal(registry: &JobRegistry, id: &str, detail: &str) {
    match registry.get(id) {
        Ok(job) if !job.state.is_terminal() => {
            match registry.transition(id, JobState::Failed, Some(detail)) {
                Ok(()) => telemetry::record_job_completed(JobState::Failed),
                Err(e) => error!(job_id = %id, error = %e, "Could not mark job failed"),
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobPayload, HANDLER_NAME};
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl JobHandler for Echo {
        async fn run(&self, job: &Job, _ctx: JobContext) -> Result<String, ExecutionError> {
            Ok(job.payload.content_lossy())
        }
    }

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl JobHandler for Counting {
        async fn run(&self, _job: &Job, _ctx: JobContext) -> Result<String, ExecutionError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(String::new())
        }
    }

    struct Cooperative;

    #[async_trait]
    impl JobHandler for Cooperative {
        async fn run(&self, _job: &Job, ctx: JobContext) -> Result<String, ExecutionError> {
            ctx.emit("started;");
            ctx.canceled().await;
            Err(ExecutionError::Canceled)
        }
    }

    struct Stubborn;

    #[async_trait]
    impl JobHandler for Stubborn {
        async fn run(&self, _job: &Job, ctx: JobContext) -> Result<String, ExecutionError> {
            ctx.canceled().await;
            Ok("finished anyway".to_string())
        }
    }

    struct Panicking;

    #[async_trait]
    impl JobHandler for Panicking {
        async fn run(&self, _job: &Job, _ctx: JobContext) -> Result<String, ExecutionError> {
            panic!("handler blew up");
        }
    }

    fn setup(handler: Arc<dyn JobHandler>) -> (Arc<JobRegistry>, JobExecutor) {
        let registry = Arc::new(JobRegistry::new());
        let executor = JobExecutor::new(HANDLER_NAME, Arc::clone(&registry), handler, "/tmp");
        (registry, executor)
    }

    fn create(registry: &JobRegistry, id: &str, work_type: &str) -> Job {
        registry
            .create(id, work_type, JobPayload::new("hello"), true)
            .unwrap()
    }

    #[tokio::test]
    async fn test_submit_marks_running_before_returning() {
        let (registry, executor) = setup(Arc::new(Stubborn));
        let job = create(&registry, "j1", HANDLER_NAME);

        executor.submit(&job).unwrap();
        assert_eq!(registry.get("j1").unwrap().state, JobState::Running);
        assert_eq!(executor.in_flight(), 1);

        executor.cancel("j1");
        registry.wait_terminal("j1").await.unwrap();
    }

    #[tokio::test]
    async fn test_successful_job_records_output() {
        let (registry, executor) = setup(Arc::new(Echo));
        let job = create(&registry, "j1", HANDLER_NAME);

        executor.submit(&job).unwrap();
        let done = registry.wait_terminal("j1").await.unwrap();

        assert_eq!(done.state, JobState::Succeeded);
        assert_eq!(done.output, "hello");
    }

    #[tokio::test]
    async fn test_unsupported_work_type_never_runs_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (registry, executor) = setup(Arc::new(Counting(Arc::clone(&calls))));
        let job = create(&registry, "j2", "other");

        let err = executor.submit(&job).unwrap_err();
        assert!(matches!(err, ExecutionError::UnsupportedWorkType { .. }));

        let job = registry.get("j2").unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.output, "unsupported work type");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cooperative_cancellation() {
        let (registry, executor) = setup(Arc::new(Cooperative));
        let job = create(&registry, "j1", HANDLER_NAME);

        executor.submit(&job).unwrap();
        assert!(executor.cancel("j1"));

        let done = registry.wait_terminal("j1").await.unwrap();
        assert_eq!(done.state, JobState::Canceled);
        assert!(done.output.starts_with("started;"));
        assert_eq!(executor.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_ignored_cancellation_reports_natural_outcome() {
        let (registry, executor) = setup(Arc::new(Stubborn));
        let job = create(&registry, "j1", HANDLER_NAME);

        executor.submit(&job).unwrap();
        executor.cancel("j1");

        let done = registry.wait_terminal("j1").await.unwrap();
        assert_eq!(done.state, JobState::Succeeded);
        assert_eq!(done.output, "finished anyway");
    }

    #[tokio::test]
    async fn test_panicking_handler_fails_job() {
        let (registry, executor) = setup(Arc::new(Panicking));
        let job = create(&registry, "j1", HANDLER_NAME);

        executor.submit(&job).unwrap();
        let done = registry.wait_terminal("j1").await.unwrap();
        assert_eq!(done.state, JobState::Failed);
        assert!(done.output.contains("terminated abnormally"));
    }

    #[tokio::test]
    async fn test_cancel_unknown_job() {
        let (_registry, executor) = setup(Arc::new(Echo));
        assert!(!executor.cancel("missing"));
    }

    #[tokio::test]
    async fn test_resubmitting_running_job_is_refused() {
        let (registry, executor) = setup(Arc::new(Stubborn));
        let job = create(&registry, "j1", HANDLER_NAME);

        executor.submit(&job).unwrap();
        let err = executor.submit(&job).unwrap_err();
        assert!(matches!(err, ExecutionError::Aborted(_)));

        executor.cancel("j1");
        let done = registry.wait_terminal("j1").await.unwrap();
        assert!(done.state.is_terminal());
    }

    #[test]
    fn test_completion_metric_only_counts_accepted_transitions() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let registry = JobRegistry::new();
        create(&registry, "j1", HANDLER_NAME);
        registry.transition("j1", JobState::Canceled, None).unwrap();

        metrics::with_local_recorder(&recorder, || {
            settle(&registry, "j1", JobState::Succeeded, "late");
        });

        let rendered = recorder.handle().render();
        assert!(!rendered.contains("status=\"succeeded\""));
        assert!(!rendered.contains("status=\"failed\""));
        assert_eq!(registry.get("j1").unwrap().state, JobState::Canceled);

        create(&registry, "j2", HANDLER_NAME);
        registry.transition("j2", JobState::Running, None).unwrap();
        metrics::with_local_recorder(&recorder, || {
            settle(&registry, "j2", JobState::Succeeded, "done");
        });

        let rendered = recorder.handle().render();
        assert!(rendered.contains("foreman_jobs_completed_total{status=\"succeeded\"} 1"));
    }
}
