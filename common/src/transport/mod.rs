// Transport bindings - adapters between a wire protocol and the dispatch bridge
// Exactly one binding is active per process; the bridge never knows which

pub mod address;
pub mod bus;
pub mod grpc;

use crate::bridge::DispatchBridge;
use crate::errors::{HandshakeError, TransportError};
use crate::models::{JobUpdate, HANDLER_NAME};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use address::SocketAddress;
pub use bus::{BusBinding, BusCommunicator};
pub use grpc::{GrpcBinding, GrpcCommunicator, WorkerService};

/// Outbound half of a binding: pushes detached-job updates to the dispatcher
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExternalCommunicator: Send + Sync {
    async fn send_update(&self, update: JobUpdate) -> Result<(), TransportError>;
}

/// Announcement sent to the dispatcher during the registration handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub handler: String,
    pub pid: i64,
    pub detached_content: bool,
}

impl Registration {
    pub fn for_current_process() -> Self {
        Self {
            handler: HANDLER_NAME.to_string(),
            pid: i64::from(std::process::id()),
            detached_content: true,
        }
    }
}

/// Dispatcher's answer to a registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationReply {
    pub registered: bool,
    #[serde(default)]
    pub address: String,
}

/// Performs the one-time registration handshake
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Registrar: Send + Sync {
    async fn register(&self, registration: Registration)
        -> Result<RegistrationReply, HandshakeError>;
}

/// A complete transport binding
///
/// Inbound messages are translated into bridge calls inside `serve`; results
/// for detached jobs leave through the binding's [`ExternalCommunicator`].
#[async_trait]
pub trait TransportBinding: Registrar {
    fn name(&self) -> &'static str;

    fn communicator(&self) -> Arc<dyn ExternalCommunicator>;

    /// Run the accept loop on `listen_address` until `shutdown` fires
    async fn serve(
        &self,
        listen_address: &str,
        bridge: Arc<DispatchBridge>,
        shutdown: CancellationToken,
    ) -> Result<(), TransportError>;
}
