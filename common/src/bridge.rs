// Dispatch bridge - the server context both transport bindings call into
// Owns the registry and executor; knows the active transport only through its communicator

use crate::errors::{DispatchError, ErrorCode};
use crate::executor::{JobExecutor, JobHandler};
use crate::models::{DispatchRequest, DispatchResponse, Job, JobState, JobUpdate, HANDLER_NAME};
use crate::registry::{CompletionCallback, JobList, JobRegistry};
use crate::telemetry;
use crate::transport::ExternalCommunicator;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, error, info, instrument, warn, Span};
use uuid::Uuid;

pub struct DispatchBridge {
    registry: Arc<JobRegistry>,
    executor: JobExecutor,
    workdir: PathBuf,
}

impl DispatchBridge {
    /// Wire a bridge to its registry, job handler and outbound communicator
    ///
    /// Installs the registry completion callback that forwards terminal
    /// detached jobs to `communicator`.
    pub fn new(
        registry: Arc<JobRegistry>,
        handler: Arc<dyn JobHandler>,
        workdir: impl Into<PathBuf>,
        communicator: Arc<dyn ExternalCommunicator>,
    ) -> Self {
        let workdir = workdir.into();
        registry.set_completion_callback(completion_callback(communicator));
        let executor = JobExecutor::new(
            HANDLER_NAME,
            Arc::clone(&registry),
            handler,
            workdir.clone(),
        );

        Self {
            registry,
            executor,
            workdir,
        }
    }

    /// Register and start a dispatched job
    ///
    /// Synchronous jobs are awaited and their final state returned. Detached
    /// jobs are acknowledged immediately; their result leaves later through
    /// the communicator.
    #[instrument(
        skip(self, request),
        fields(job_id, work_type = %request.work_type, detached = request.detached)
    )]
    pub async fn handle_dispatch(
        &self,
        request: DispatchRequest,
    ) -> Result<DispatchResponse, DispatchError> {
        let id = match request.id {
            Some(id) if !id.trim().is_empty() => id,
            _ => Uuid::new_v4().to_string(),
        };
        Span::current().record("job_id", id.as_str());

        let job = self
            .registry
            .create(&id, &request.work_type, request.payload, request.detached)?;
        telemetry::record_job_dispatched(job.detached);
        info!("Job dispatched");

        if job.detached {
            let accepted = match self.executor.submit(&job) {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "Detached job rejected at submission");
                    false
                }
            };
            return Ok(DispatchResponse::Accepted { id, accepted });
        }

        // Subscribe first so a fast job evicted from history still reports back
        let waiter = self.registry.watch(&id)?;
        if let Err(e) = self.executor.submit(&job) {
            debug!(error = %e, "Job settled at submission");
        }

        let finished = waiter.wait().await.map_err(|e| {
            DispatchError::new(ErrorCode::Internal, format!("Lost track of job: {}", e))
        })?;

        Ok(DispatchResponse::Completed {
            id: finished.id,
            status: finished.state,
            output: finished.output,
        })
    }

    /// Request cooperative cancellation of a detached job
    ///
    /// Returns false when the job has already finished.
    #[instrument(skip(self))]
    pub fn handle_cancel(&self, id: &str) -> Result<bool, DispatchError> {
        let job = self.registry.get(id)?;
        if !job.detached {
            return Err(DispatchError::invalid_request(format!(
                "Job {} is not detached and cannot be canceled",
                id
            )));
        }

        if job.state.is_terminal() {
            debug!(state = %job.state, "Cancel ignored for finished job");
            return Ok(false);
        }

        if self.executor.cancel(id) {
            return Ok(true);
        }

        // No token: only a job that has not started may be canceled here
        match self
            .registry
            .transition_from(id, JobState::Received, JobState::Canceled)
        {
            Ok(()) => Ok(true),
            Err(e) => {
                debug!(error = %e, "Job is running or finished, cancellation skipped");
                Ok(false)
            }
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn job(&self, id: &str) -> Result<Job, DispatchError> {
        Ok(self.registry.get(id)?)
    }

    pub fn jobs(&self, filter: Option<JobState>) -> JobList {
        self.registry.list(filter)
    }
}

fn completion_callback(communicator: Arc<dyn ExternalCommunicator>) -> CompletionCallback {
    Arc::new(move |job: &Job| {
        if !job.detached {
            return;
        }

        let update = JobUpdate::from(job);
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(deliver_update(Arc::clone(&communicator), update));
            }
            Err(_) => error!(job_id = %job.id, "No runtime available to deliver job update"),
        }
    })
}

async fn deliver_update(communicator: Arc<dyn ExternalCommunicator>, update: JobUpdate) {
    let job_id = update.id.clone();
    let status = update.status;

    match communicator.send_update(update).await {
        Ok(()) => {
            telemetry::record_update_delivery(true);
            info!(%job_id, %status, "Delivered job update");
        }
        Err(e) => {
            telemetry::record_update_delivery(false);
            error!(%job_id, %status, error = %e, "Failed to deliver job update");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ExecutionError, TransportError};
    use crate::executor::JobContext;
    use crate::models::JobPayload;
    use crate::transport::MockExternalCommunicator;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Echo;

    #[async_trait]
    impl JobHandler for Echo {
        async fn run(&self, job: &Job, _ctx: JobContext) -> Result<String, ExecutionError> {
            Ok(job.payload.content_lossy())
        }
    }

    struct WaitForCancel;

    #[async_trait]
    impl JobHandler for WaitForCancel {
        async fn run(&self, _job: &Job, ctx: JobContext) -> Result<String, ExecutionError> {
            ctx.canceled().await;
            Err(ExecutionError::Canceled)
        }
    }

    fn request(id: &str, work_type: &str, detached: bool) -> DispatchRequest {
        DispatchRequest {
            id: Some(id.to_string()),
            work_type: work_type.to_string(),
            payload: JobPayload::new("hi"),
            detached,
        }
    }

    fn silent_communicator() -> Arc<dyn ExternalCommunicator> {
        let mut communicator = MockExternalCommunicator::new();
        communicator.expect_send_update().never();
        Arc::new(communicator)
    }

    /// Communicator that forwards every update into a channel
    fn recording_communicator() -> (
        Arc<dyn ExternalCommunicator>,
        mpsc::UnboundedReceiver<JobUpdate>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut communicator = MockExternalCommunicator::new();
        communicator.expect_send_update().returning(move |update| {
            let _ = tx.send(update);
            Ok(())
        });
        (Arc::new(communicator), rx)
    }

    fn bridge(
        handler: Arc<dyn JobHandler>,
        communicator: Arc<dyn ExternalCommunicator>,
    ) -> DispatchBridge {
        DispatchBridge::new(Arc::new(JobRegistry::new()), handler, "/tmp", communicator)
    }

    #[tokio::test]
    async fn test_synchronous_job_returns_final_output() {
        let bridge = bridge(Arc::new(Echo), silent_communicator());

        let response = bridge
            .handle_dispatch(request("j1", HANDLER_NAME, false))
            .await
            .unwrap();

        assert_eq!(
            response,
            DispatchResponse::Completed {
                id: "j1".to_string(),
                status: JobState::Succeeded,
                output: "hi".to_string(),
            }
        );
        let recorded = bridge.job("j1").unwrap();
        assert_eq!(recorded.state, JobState::Succeeded);
        assert_eq!(recorded.output, "hi");
    }

    #[tokio::test]
    async fn test_unsupported_work_type_fails_synchronously() {
        let bridge = bridge(Arc::new(Echo), silent_communicator());

        let response = bridge
            .handle_dispatch(request("j2", "other", false))
            .await
            .unwrap();

        assert_eq!(
            response,
            DispatchResponse::Completed {
                id: "j2".to_string(),
                status: JobState::Failed,
                output: "unsupported work type".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_duplicate_id_maps_to_error_code() {
        let bridge = bridge(Arc::new(Echo), silent_communicator());
        bridge
            .handle_dispatch(request("j1", HANDLER_NAME, false))
            .await
            .unwrap();

        let err = bridge
            .handle_dispatch(request("j1", HANDLER_NAME, false))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::DuplicateId);
    }

    #[tokio::test]
    async fn test_missing_id_is_generated() {
        let bridge = bridge(Arc::new(Echo), silent_communicator());
        let mut req = request("", HANDLER_NAME, false);
        req.id = None;

        let response = bridge.handle_dispatch(req).await.unwrap();
        assert!(Uuid::parse_str(response.id()).is_ok());
    }

    #[tokio::test]
    async fn test_detached_job_is_acknowledged_and_reported_once() {
        let (communicator, mut updates) = recording_communicator();
        let bridge = bridge(Arc::new(Echo), communicator);

        let response = bridge
            .handle_dispatch(request("j3", HANDLER_NAME, true))
            .await
            .unwrap();
        assert_eq!(
            response,
            DispatchResponse::Accepted {
                id: "j3".to_string(),
                accepted: true,
            }
        );

        let update = tokio::time::timeout(Duration::from_secs(5), updates.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.id, "j3");
        assert_eq!(update.status, JobState::Succeeded);
        assert_eq!(update.output, "hi");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_detached_unsupported_job_is_not_accepted() {
        let (communicator, mut updates) = recording_communicator();
        let bridge = bridge(Arc::new(Echo), communicator);

        let response = bridge
            .handle_dispatch(request("j4", "other", true))
            .await
            .unwrap();
        assert_eq!(
            response,
            DispatchResponse::Accepted {
                id: "j4".to_string(),
                accepted: false,
            }
        );

        let update = tokio::time::timeout(Duration::from_secs(5), updates.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.status, JobState::Failed);
        assert_eq!(update.output, "unsupported work type");
    }

    #[tokio::test]
    async fn test_update_delivery_failure_does_not_affect_job() {
        let mut communicator = MockExternalCommunicator::new();
        communicator
            .expect_send_update()
            .times(1)
            .returning(|_| Err(TransportError::DeliveryFailed("dispatcher gone".to_string())));
        let bridge = bridge(Arc::new(Echo), Arc::new(communicator));

        bridge
            .handle_dispatch(request("j5", HANDLER_NAME, true))
            .await
            .unwrap();
        let job = bridge.registry().wait_terminal("j5").await.unwrap();
        assert_eq!(job.state, JobState::Succeeded);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_cancel_detached_job() {
        let (communicator, mut updates) = recording_communicator();
        let bridge = bridge(Arc::new(WaitForCancel), communicator);

        bridge
            .handle_dispatch(request("j6", HANDLER_NAME, true))
            .await
            .unwrap();
        assert!(bridge.handle_cancel("j6").unwrap());

        let update = tokio::time::timeout(Duration::from_secs(5), updates.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.status, JobState::Canceled);

        // Already finished
        assert!(!bridge.handle_cancel("j6").unwrap());
    }

    #[tokio::test]
    async fn test_cancel_leaves_running_job_without_token_alone() {
        let (communicator, mut updates) = recording_communicator();
        let registry = Arc::new(JobRegistry::new());
        let bridge = DispatchBridge::new(
            Arc::clone(&registry),
            Arc::new(Echo),
            "/tmp",
            communicator,
        );

        // Running but not yet tracked by the executor
        registry
            .create("j8", HANDLER_NAME, JobPayload::new("hi"), true)
            .unwrap();
        registry.transition("j8", JobState::Running, None).unwrap();

        assert!(!bridge.handle_cancel("j8").unwrap());
        assert_eq!(registry.get("j8").unwrap().state, JobState::Running);

        registry
            .transition("j8", JobState::Succeeded, Some("done"))
            .unwrap();
        let update = tokio::time::timeout(Duration::from_secs(5), updates.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.status, JobState::Succeeded);
        assert_eq!(update.output, "done");
    }

    #[tokio::test]
    async fn test_cancel_job_not_yet_started() {
        let (communicator, mut updates) = recording_communicator();
        let registry = Arc::new(JobRegistry::new());
        let bridge = DispatchBridge::new(
            Arc::clone(&registry),
            Arc::new(Echo),
            "/tmp",
            communicator,
        );

        registry
            .create("j9", HANDLER_NAME, JobPayload::new("hi"), true)
            .unwrap();
        assert!(bridge.handle_cancel("j9").unwrap());
        assert_eq!(registry.get("j9").unwrap().state, JobState::Canceled);

        let update = tokio::time::timeout(Duration::from_secs(5), updates.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.status, JobState::Canceled);
    }

    #[tokio::test]
    async fn test_cancel_rejects_synchronous_and_unknown_jobs() {
        let bridge = bridge(Arc::new(Echo), silent_communicator());
        bridge
            .handle_dispatch(request("j7", HANDLER_NAME, false))
            .await
            .unwrap();

        let err = bridge.handle_cancel("j7").unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);

        let err = bridge.handle_cancel("missing").unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_jobs_lists_in_creation_order() {
        let bridge = bridge(Arc::new(Echo), silent_communicator());
        for id in ["a", "b", "c"] {
            bridge
                .handle_dispatch(request(id, HANDLER_NAME, false))
                .await
                .unwrap();
        }

        let ids: Vec<String> = bridge
            .jobs(Some(JobState::Succeeded))
            .iter()
            .map(|job| job.id.clone())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(bridge.workdir(), Path::new("/tmp"));
    }
}
