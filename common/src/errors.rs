// Error handling framework
// One enum per failure class; only configuration and handshake errors are fatal

use crate::models::JobState;
use thiserror::Error;

/// Bad or missing environment values
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Could not parse log level '{0}'")]
    InvalidLogLevel(String),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("Working directory {path} is unusable: {reason}")]
    WorkingDirectory { path: String, reason: String },
}

impl From<config::ConfigError> for ConfigurationError {
    fn from(err: config::ConfigError) -> Self {
        ConfigurationError::LoadFailed(err.to_string())
    }
}

/// Registration with the dispatcher failed. Always fatal.
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("Dispatcher endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("Handler registration rejected by dispatcher")]
    Rejected,

    #[error("Registration call failed: {0}")]
    Failed(String),

    #[error("Registration timed out after {0} ms")]
    Timeout(u64),

    #[error("Registration response missing listen address")]
    MissingAddress,

    #[error("Malformed registration response: {0}")]
    Malformed(String),
}

/// Job registry misuse
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Job id already registered: {0}")]
    DuplicateId(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: JobState,
        to: JobState,
    },
}

/// Job execution errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("unsupported work type")]
    UnsupportedWorkType { work_type: String },

    #[error("{0}")]
    Failed(String),

    #[error("job canceled")]
    Canceled,

    #[error("job terminated abnormally: {0}")]
    Aborted(String),
}

/// Transport-level failures; contained to a single call or message
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to connect: {0}")]
    Connection(String),

    #[error("Failed to bind listener on {address}: {reason}")]
    Bind { address: String, reason: String },

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Failed to deliver update: {0}")]
    DeliveryFailed(String),

    #[error("Accept loop failed: {0}")]
    Serve(String),
}

impl From<tonic::transport::Error> for TransportError {
    fn from(err: tonic::transport::Error) -> Self {
        TransportError::Connection(err.to_string())
    }
}

impl From<tonic::Status> for TransportError {
    fn from(status: tonic::Status) -> Self {
        TransportError::DeliveryFailed(format!("{}: {}", status.code(), status.message()))
    }
}

/// Transport-neutral error codes handed back to bindings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidRequest,
    DuplicateId,
    NotFound,
    InvalidTransition,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::DuplicateId => "DUPLICATE_ID",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InvalidTransition => "INVALID_TRANSITION",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by the dispatch bridge to a transport binding
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct DispatchError {
    pub code: ErrorCode,
    pub message: String,
}

impl DispatchError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }
}

impl From<RegistryError> for DispatchError {
    fn from(err: RegistryError) -> Self {
        let code = match err {
            RegistryError::DuplicateId(_) => ErrorCode::DuplicateId,
            RegistryError::NotFound(_) => ErrorCode::NotFound,
            RegistryError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
        };
        DispatchError::new(code, err.to_string())
    }
}

impl From<DispatchError> for tonic::Status {
    fn from(err: DispatchError) -> Self {
        match err.code {
            ErrorCode::InvalidRequest => tonic::Status::invalid_argument(err.message),
            ErrorCode::DuplicateId => tonic::Status::already_exists(err.message),
            ErrorCode::NotFound => tonic::Status::not_found(err.message),
            ErrorCode::InvalidTransition => tonic::Status::failed_precondition(err.message),
            ErrorCode::Internal => tonic::Status::internal(err.message),
        }
    }
}
