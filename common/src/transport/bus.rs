// NATS bus transport binding
// Dispatch fields travel as message headers, the job content as the body

use super::{ExternalCommunicator, Registrar, Registration, RegistrationReply, TransportBinding};
use crate::bridge::DispatchBridge;
use crate::config::BusConfig;
use crate::errors::{DispatchError, HandshakeError, TransportError};
use crate::models::{DispatchRequest, DispatchResponse, JobPayload, JobUpdate};
use async_nats::{Client, HeaderMap, Message, Subject};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

pub const HEADER_JOB_ID: &str = "Ygg-Job-Id";
pub const HEADER_WORK_TYPE: &str = "Ygg-Work-Type";
pub const HEADER_DETACHED: &str = "Ygg-Detached";
pub const HEADER_METADATA: &str = "Ygg-Metadata";
pub const HEADER_STATUS: &str = "Ygg-Status";
pub const HEADER_ACCEPTED: &str = "Ygg-Accepted";
pub const HEADER_CANCELED: &str = "Ygg-Canceled";
pub const HEADER_ERROR_CODE: &str = "Ygg-Error-Code";

/// Bus binding over a NATS connection
pub struct BusBinding {
    client: Client,
    config: BusConfig,
}

impl BusBinding {
    #[instrument(skip(config), fields(url = %config.url))]
    pub async fn connect(config: BusConfig) -> Result<Self, TransportError> {
        info!("Connecting to NATS bus");
        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| TransportError::Connection(format!("Failed to connect to NATS: {}", e)))?;
        info!("Connected to NATS bus");

        Ok(Self { client, config })
    }

    pub fn from_client(client: Client, config: BusConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl Registrar for BusBinding {
    #[instrument(skip_all, fields(subject = %self.config.register_subject))]
    async fn register(
        &self,
        registration: Registration,
    ) -> Result<RegistrationReply, HandshakeError> {
        let body = serde_json::to_vec(&registration)
            .map_err(|e| HandshakeError::Malformed(e.to_string()))?;

        let reply = self
            .client
            .request(self.config.register_subject.clone(), body.into())
            .await
            .map_err(|e| HandshakeError::Unreachable(e.to_string()))?;

        serde_json::from_slice(&reply.payload).map_err(|e| HandshakeError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl TransportBinding for BusBinding {
    fn name(&self) -> &'static str {
        "bus"
    }

    fn communicator(&self) -> Arc<dyn ExternalCommunicator> {
        Arc::new(BusCommunicator::new(
            self.client.clone(),
            self.config.transmit_subject.clone(),
        ))
    }

    #[instrument(skip(self, bridge, shutdown))]
    async fn serve(
        &self,
        listen_address: &str,
        bridge: Arc<DispatchBridge>,
        shutdown: CancellationToken,
    ) -> Result<(), TransportError> {
        let subscribe = |subject: String| {
            let client = self.client.clone();
            async move {
                client
                    .subscribe(subject.clone())
                    .await
                    .map_err(|e| TransportError::Bind {
                        address: subject,
                        reason: e.to_string(),
                    })
            }
        };

        let mut dispatches = subscribe(format!("{}.dispatch", listen_address)).await?;
        let mut cancels = subscribe(format!("{}.cancel", listen_address)).await?;
        info!(address = %listen_address, "Serving bus worker");

        let publisher: Arc<dyn ReplyPublisher> = Arc::new(self.client.clone());
        accept_loop(&mut dispatches, &mut cancels, publisher, bridge, shutdown).await?;

        if let Err(e) = dispatches.unsubscribe().await {
            debug!(error = %e, "Unsubscribe failed");
        }
        if let Err(e) = cancels.unsubscribe().await {
            debug!(error = %e, "Unsubscribe failed");
        }
        Ok(())
    }
}

/// Sends replies to request messages
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReplyPublisher: Send + Sync {
    async fn publish_reply(
        &self,
        subject: Subject,
        headers: HeaderMap,
        body: Vec<u8>,
    ) -> Result<(), TransportError>;
}

#[async_trait]
impl ReplyPublisher for Client {
    async fn publish_reply(
        &self,
        subject: Subject,
        headers: HeaderMap,
        body: Vec<u8>,
    ) -> Result<(), TransportError> {
        self.publish_with_headers(subject, headers, body.into())
            .await
            .map_err(|e| TransportError::DeliveryFailed(e.to_string()))
    }
}

/// Route dispatch and cancel messages to the bridge until shutdown
///
/// Dispatches run in their own tasks; cancels are answered in arrival order.
/// A closed subscription ends the loop with a connection error.
pub async fn accept_loop<D, C>(
    dispatches: &mut D,
    cancels: &mut C,
    publisher: Arc<dyn ReplyPublisher>,
    bridge: Arc<DispatchBridge>,
    shutdown: CancellationToken,
) -> Result<(), TransportError>
where
    D: Stream<Item = Message> + Unpin + Send,
    C: Stream<Item = Message> + Unpin + Send,
{
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Bus worker stopping");
                return Ok(());
            }
            message = dispatches.next() => {
                let Some(message) = message else {
                    return Err(TransportError::Connection("Dispatch subscription closed".to_string()));
                };
                tokio::spawn(handle_dispatch_message(
                    Arc::clone(&publisher),
                    Arc::clone(&bridge),
                    message,
                ));
            }
            message = cancels.next() => {
                let Some(message) = message else {
                    return Err(TransportError::Connection("Cancel subscription closed".to_string()));
                };
                handle_cancel_message(publisher.as_ref(), &bridge, message).await;
            }
        }
    }
}

/// Publishes detached-job updates to the dispatcher's transmit subject
#[derive(Clone)]
pub struct BusCommunicator {
    client: Client,
    subject: String,
}

impl BusCommunicator {
    pub fn new(client: Client, subject: String) -> Self {
        Self { client, subject }
    }
}

#[async_trait]
impl ExternalCommunicator for BusCommunicator {
    #[instrument(skip_all, fields(job_id = %update.id, status = %update.status))]
    async fn send_update(&self, update: JobUpdate) -> Result<(), TransportError> {
        let (headers, body) = update_message(&update);
        self.client
            .publish_with_headers(self.subject.clone(), headers, body.into())
            .await
            .map_err(|e| TransportError::DeliveryFailed(e.to_string()))?;
        self.client
            .flush()
            .await
            .map_err(|e| TransportError::DeliveryFailed(e.to_string()))
    }
}

async fn handle_dispatch_message(
    publisher: Arc<dyn ReplyPublisher>,
    bridge: Arc<DispatchBridge>,
    message: Message,
) {
    let request = match dispatch_from_message(message.headers.as_ref(), &message.payload) {
        Ok(request) => request,
        Err(e) => {
            warn!(subject = %message.subject, error = %e, "Dropping malformed dispatch");
            return;
        }
    };

    let result = bridge.handle_dispatch(request).await;
    if let Err(e) = &result {
        warn!(error = %e, "Dispatch failed");
    }

    let Some(reply) = message.reply else {
        debug!("Dispatch without reply subject; result not returned");
        return;
    };
    let (headers, body) = dispatch_reply(&result);
    if let Err(e) = publisher.publish_reply(reply, headers, body).await {
        error!(error = %e, "Failed to publish dispatch reply");
    }
}

async fn handle_cancel_message(
    publisher: &dyn ReplyPublisher,
    bridge: &DispatchBridge,
    message: Message,
) {
    let Some(job_id) = header(message.headers.as_ref(), HEADER_JOB_ID) else {
        warn!(subject = %message.subject, "Dropping cancel without job id");
        return;
    };

    let headers = cancel_reply(bridge, &job_id);
    if let Some(reply) = message.reply {
        if let Err(e) = publisher.publish_reply(reply, headers, Vec::new()).await {
            error!(error = %e, "Failed to publish cancel reply");
        }
    }
}

/// Cancel a job and encode the outcome as reply headers
pub fn cancel_reply(bridge: &DispatchBridge, job_id: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(HEADER_JOB_ID, job_id);
    match bridge.handle_cancel(job_id) {
        Ok(canceled) => headers.insert(HEADER_CANCELED, canceled.to_string().as_str()),
        Err(e) => {
            warn!(%job_id, error = %e, "Cancel failed");
            headers.insert(HEADER_ERROR_CODE, e.code.as_str());
        }
    }
    headers
}

fn header(headers: Option<&HeaderMap>, name: &str) -> Option<String> {
    headers
        .and_then(|headers| headers.get(name))
        .map(|value| value.as_str().to_string())
}

/// Decode a dispatch message; the work type header is mandatory
pub fn dispatch_from_message(
    headers: Option<&HeaderMap>,
    payload: &[u8],
) -> Result<DispatchRequest, TransportError> {
    let work_type = header(headers, HEADER_WORK_TYPE).ok_or_else(|| {
        TransportError::MalformedMessage(format!("missing {} header", HEADER_WORK_TYPE))
    })?;

    let detached = match header(headers, HEADER_DETACHED) {
        None => false,
        Some(value) => value.trim().parse::<bool>().map_err(|_| {
            TransportError::MalformedMessage(format!("invalid {} header: {}", HEADER_DETACHED, value))
        })?,
    };

    let metadata: HashMap<String, String> = match header(headers, HEADER_METADATA) {
        None => HashMap::new(),
        Some(value) => serde_json::from_str(&value).map_err(|e| {
            TransportError::MalformedMessage(format!("invalid {} header: {}", HEADER_METADATA, e))
        })?,
    };

    Ok(DispatchRequest {
        id: header(headers, HEADER_JOB_ID).filter(|id| !id.is_empty()),
        work_type,
        payload: JobPayload {
            content: payload.to_vec(),
            metadata,
        },
        detached,
    })
}

/// Encode the bridge's answer to a dispatch as reply headers and body
pub fn dispatch_reply(result: &Result<DispatchResponse, DispatchError>) -> (HeaderMap, Vec<u8>) {
    let mut headers = HeaderMap::new();
    match result {
        Ok(DispatchResponse::Completed { id, status, output }) => {
            headers.insert(HEADER_JOB_ID, id.as_str());
            headers.insert(HEADER_STATUS, status.to_string().as_str());
            (headers, output.clone().into_bytes())
        }
        Ok(DispatchResponse::Accepted { id, accepted }) => {
            headers.insert(HEADER_JOB_ID, id.as_str());
            headers.insert(HEADER_ACCEPTED, accepted.to_string().as_str());
            (headers, Vec::new())
        }
        Err(e) => {
            headers.insert(HEADER_ERROR_CODE, e.code.as_str());
            (headers, e.message.clone().into_bytes())
        }
    }
}

pub fn update_message(update: &JobUpdate) -> (HeaderMap, Vec<u8>) {
    let mut headers = HeaderMap::new();
    headers.insert(HEADER_JOB_ID, update.id.as_str());
    headers.insert(HEADER_STATUS, update.status.to_string().as_str());
    (headers, update.output.clone().into_bytes())
}
