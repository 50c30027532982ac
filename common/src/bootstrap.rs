// Worker bootstrap
// configuration -> transport selection -> registration handshake -> accept loop, no backtracking

use crate::bridge::DispatchBridge;
use crate::config::{Settings, TransportSettings};
use crate::errors::{ConfigurationError, HandshakeError};
use crate::executor::JobHandler;
use crate::registry::JobRegistry;
use crate::transport::{BusBinding, GrpcBinding, Registrar, Registration, TransportBinding};
use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

/// Select the transport from `settings`, register and serve until `shutdown`
///
/// # Errors
/// Returns a [`ConfigurationError`] or [`HandshakeError`] (inside `anyhow`)
/// when the worker cannot start; both are fatal.
#[instrument(skip_all, fields(transport = settings.transport_name()))]
pub async fn run(
    settings: &Settings,
    handler: Arc<dyn JobHandler>,
    shutdown: CancellationToken,
) -> Result<()> {
    prepare_workdir(&settings.workdir).await?;

    match &settings.transport {
        TransportSettings::Grpc { dispatcher_addr } => {
            info!(%dispatcher_addr, "YGG_SOCKET_ADDR found; using gRPC transport");
            let binding = GrpcBinding::connect(dispatcher_addr)
                .map_err(|e| HandshakeError::Unreachable(e.to_string()))?;
            start(&binding, settings, handler, shutdown).await
        }
        TransportSettings::Bus(config) => {
            info!(url = %config.url, "YGG_SOCKET_ADDR not set; using bus transport");
            let connect = BusBinding::connect(config.clone());
            let binding = tokio::time::timeout(handshake_timeout(settings), connect)
                .await
                .map_err(|_| HandshakeError::Timeout(settings.handshake_timeout_ms))?
                .map_err(|e| HandshakeError::Unreachable(e.to_string()))?;
            start(&binding, settings, handler, shutdown).await
        }
    }
}

/// Register over an already connected binding, then run its accept loop
pub async fn start<B>(
    binding: &B,
    settings: &Settings,
    handler: Arc<dyn JobHandler>,
    shutdown: CancellationToken,
) -> Result<()>
where
    B: TransportBinding + ?Sized,
{
    let address = handshake(binding, handshake_timeout(settings)).await?;
    info!(transport = binding.name(), %address, "Registered with dispatcher");

    let registry = Arc::new(JobRegistry::with_retention(settings.max_retained_jobs));
    let bridge = Arc::new(DispatchBridge::new(
        registry,
        handler,
        settings.workdir.clone(),
        binding.communicator(),
    ));

    binding.serve(&address, bridge, shutdown).await?;
    info!("Worker stopped");
    Ok(())
}

/// One-time registration; returns the address the binding must listen on
pub async fn handshake<R>(registrar: &R, timeout: Duration) -> Result<String, HandshakeError>
where
    R: Registrar + ?Sized,
{
    let registration = Registration::for_current_process();
    info!(
        handler = %registration.handler,
        pid = registration.pid,
        "Registering with dispatcher"
    );

    let reply = tokio::time::timeout(timeout, registrar.register(registration))
        .await
        .map_err(|_| HandshakeError::Timeout(timeout.as_millis() as u64))??;

    if !reply.registered {
        return Err(HandshakeError::Rejected);
    }

    let address = reply.address.trim();
    if address.is_empty() {
        return Err(HandshakeError::MissingAddress);
    }

    Ok(address.to_string())
}

async fn prepare_workdir(path: &Path) -> Result<(), ConfigurationError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| ConfigurationError::WorkingDirectory {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
    info!(workdir = %path.display(), "Working directory ready");
    Ok(())
}

fn handshake_timeout(settings: &Settings) -> Duration {
    Duration::from_millis(settings.handshake_timeout_ms)
}
