// gRPC transport binding
// Serves the Worker service for the dispatcher and calls back into its Dispatcher service

use super::{
    ExternalCommunicator, Registrar, Registration, RegistrationReply, SocketAddress,
    TransportBinding,
};
use crate::bridge::DispatchBridge;
use crate::errors::{HandshakeError, TransportError};
use crate::models::{DispatchRequest, DispatchResponse, JobPayload, JobUpdate, HANDLER_NAME};
use crate::proto as pb;
use async_trait::async_trait;
use pb::dispatcher_client::DispatcherClient;
use pb::worker_server::{Worker, WorkerServer};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::{TcpListenerStream, UnixListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::transport::server::Router;
use tonic::transport::{Channel, Server};
use tonic::{Code, Request, Response, Status};
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Metadata key carrying the job status on out-of-band updates
pub const STATUS_METADATA_KEY: &str = "status";

/// gRPC binding connected to the dispatcher socket
pub struct GrpcBinding {
    dispatcher: SocketAddress,
    channel: Channel,
}

impl GrpcBinding {
    /// Prepare a channel to the dispatcher; the connection is made on first use
    pub fn connect(dispatcher_addr: &str) -> Result<Self, TransportError> {
        let dispatcher: SocketAddress = dispatcher_addr.parse()?;
        let channel = dispatcher.channel()?;
        Ok(Self {
            dispatcher,
            channel,
        })
    }

    fn router(bridge: Arc<DispatchBridge>) -> Router {
        Server::builder().add_service(WorkerService::new(bridge).into_server())
    }
}

#[async_trait]
impl Registrar for GrpcBinding {
    #[instrument(skip_all, fields(dispatcher = %self.dispatcher))]
    async fn register(
        &self,
        registration: Registration,
    ) -> Result<RegistrationReply, HandshakeError> {
        let mut client = DispatcherClient::new(self.channel.clone());
        let request = pb::RegistrationRequest {
            handler: registration.handler,
            pid: registration.pid,
            detached_content: registration.detached_content,
            features: HashMap::new(),
        };

        let reply = client
            .register(request)
            .await
            .map_err(|status| match status.code() {
                Code::Unavailable | Code::Unknown | Code::DeadlineExceeded => {
                    HandshakeError::Unreachable(status.message().to_string())
                }
                code => HandshakeError::Failed(format!("{}: {}", code, status.message())),
            })?
            .into_inner();

        Ok(RegistrationReply {
            registered: reply.registered,
            address: reply.address,
        })
    }
}

#[async_trait]
impl TransportBinding for GrpcBinding {
    fn name(&self) -> &'static str {
        "grpc"
    }

    fn communicator(&self) -> Arc<dyn ExternalCommunicator> {
        Arc::new(GrpcCommunicator::new(self.channel.clone()))
    }

    #[instrument(skip(self, bridge, shutdown))]
    async fn serve(
        &self,
        listen_address: &str,
        bridge: Arc<DispatchBridge>,
        shutdown: CancellationToken,
    ) -> Result<(), TransportError> {
        let address: SocketAddress = listen_address.parse()?;
        let router = Self::router(bridge);

        let served = match address.tcp_authority() {
            Some(authority) => {
                let listener =
                    TcpListener::bind(authority)
                        .await
                        .map_err(|e| TransportError::Bind {
                            address: address.to_string(),
                            reason: e.to_string(),
                        })?;
                info!(%address, "Serving gRPC worker");
                router
                    .serve_with_incoming_shutdown(
                        TcpListenerStream::new(listener),
                        shutdown.cancelled(),
                    )
                    .await
            }
            None => {
                let listener = address.bind_unix()?;
                info!(%address, "Serving gRPC worker");
                router
                    .serve_with_incoming_shutdown(
                        UnixListenerStream::new(listener),
                        shutdown.cancelled(),
                    )
                    .await
            }
        };

        served.map_err(|e| TransportError::Serve(e.to_string()))?;
        info!("gRPC worker stopped");
        Ok(())
    }
}

/// Delivers detached-job updates through `Dispatcher.Send`
#[derive(Clone)]
pub struct GrpcCommunicator {
    client: DispatcherClient<Channel>,
}

impl GrpcCommunicator {
    pub fn new(channel: Channel) -> Self {
        Self {
            client: DispatcherClient::new(channel),
        }
    }
}

#[async_trait]
impl ExternalCommunicator for GrpcCommunicator {
    #[instrument(skip_all, fields(job_id = %update.id, status = %update.status))]
    async fn send_update(&self, update: JobUpdate) -> Result<(), TransportError> {
        let mut client = self.client.clone();
        client.send(data_from_update(update)).await?;
        Ok(())
    }
}

/// `Worker` service implementation handed to tonic
pub struct WorkerService {
    bridge: Arc<DispatchBridge>,
}

impl WorkerService {
    pub fn new(bridge: Arc<DispatchBridge>) -> Self {
        Self { bridge }
    }

    pub fn into_server(self) -> WorkerServer<Self> {
        WorkerServer::new(self)
    }
}

#[tonic::async_trait]
impl Worker for WorkerService {
    async fn send(&self, request: Request<pb::Data>) -> Result<Response<pb::Response>, Status> {
        let dispatch = dispatch_from_data(request.into_inner());
        let reply = self.bridge.handle_dispatch(dispatch).await.map_err(|e| {
            warn!(error = %e, "Dispatch call failed");
            Status::from(e)
        })?;

        Ok(Response::new(response_from_dispatch(reply)))
    }

    async fn cancel(
        &self,
        request: Request<pb::CancelRequest>,
    ) -> Result<Response<pb::CancelResponse>, Status> {
        let job_id = request.into_inner().job_id;
        if job_id.is_empty() {
            return Err(Status::invalid_argument("job_id is required"));
        }

        let canceled = self.bridge.handle_cancel(&job_id).map_err(Status::from)?;
        Ok(Response::new(pb::CancelResponse { canceled }))
    }
}

/// Translate an inbound `Data` message into a transport-neutral request
pub fn dispatch_from_data(data: pb::Data) -> DispatchRequest {
    DispatchRequest {
        id: Some(data.message_id).filter(|id| !id.is_empty()),
        work_type: data.directive,
        payload: JobPayload {
            content: data.content,
            metadata: data.metadata,
        },
        detached: data.detached,
    }
}

pub fn response_from_dispatch(reply: DispatchResponse) -> pb::Response {
    match reply {
        DispatchResponse::Completed { id, status, output } => pb::Response {
            job_id: id,
            accepted: true,
            status: status.to_string(),
            output: output.into_bytes(),
        },
        DispatchResponse::Accepted { id, accepted } => pb::Response {
            job_id: id,
            accepted,
            status: String::new(),
            output: Vec::new(),
        },
    }
}

pub fn data_from_update(update: JobUpdate) -> pb::Data {
    let mut metadata = HashMap::new();
    metadata.insert(STATUS_METADATA_KEY.to_string(), update.status.to_string());

    pb::Data {
        message_id: Uuid::new_v4().to_string(),
        response_to: update.id,
        metadata,
        content: update.output.into_bytes(),
        directive: HANDLER_NAME.to_string(),
        detached: true,
    }
}
