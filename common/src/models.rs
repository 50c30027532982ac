// Core data models for the foreman worker

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// Work type this worker registers to serve
pub const HANDLER_NAME: &str = "foreman";

/// Lifecycle state of a job
///
/// `received -> running -> {succeeded | failed | canceled}`. A job that is
/// rejected or withdrawn before pickup may also go straight from `received`
/// to `failed` or `canceled`. Terminal states never transition further.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Received,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Canceled
        )
    }

    /// Whether `next` is reachable from `self` in a single step
    pub fn can_transition_to(&self, next: JobState) -> bool {
        match (self, next) {
            (JobState::Received, JobState::Running)
            | (JobState::Received, JobState::Failed)
            | (JobState::Received, JobState::Canceled) => true,
            (JobState::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Received => write!(f, "received"),
            JobState::Running => write!(f, "running"),
            JobState::Succeeded => write!(f, "succeeded"),
            JobState::Failed => write!(f, "failed"),
            JobState::Canceled => write!(f, "canceled"),
        }
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(JobState::Received),
            "running" => Ok(JobState::Running),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            "canceled" => Ok(JobState::Canceled),
            _ => Err(format!("Invalid job state: {}", s)),
        }
    }
}

/// Opaque job content plus its metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    pub content: Vec<u8>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl JobPayload {
    pub fn new(content: impl Into<Vec<u8>>) -> Self {
        Self {
            content: content.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn content_lossy(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }
}

/// A job known to the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub work_type: String,
    pub payload: JobPayload,
    pub detached: bool,
    pub state: JobState,
    pub output: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        id: impl Into<String>,
        work_type: impl Into<String>,
        payload: JobPayload,
        detached: bool,
    ) -> Self {
        Self {
            id: id.into(),
            work_type: work_type.into(),
            payload,
            detached,
            state: JobState::Received,
            output: String::new(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Transport-neutral dispatch request produced by a binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRequest {
    /// Dispatcher-assigned id; generated locally when absent or empty
    pub id: Option<String>,
    pub work_type: String,
    pub payload: JobPayload,
    pub detached: bool,
}

/// Transport-neutral reply handed back to a binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchResponse {
    /// Final result of a synchronous job
    Completed {
        id: String,
        status: JobState,
        output: String,
    },
    /// Acknowledgment of a detached job
    Accepted { id: String, accepted: bool },
}

impl DispatchResponse {
    pub fn id(&self) -> &str {
        match self {
            DispatchResponse::Completed { id, .. } | DispatchResponse::Accepted { id, .. } => id,
        }
    }
}

/// Out-of-band status/result update for a detached job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobUpdate {
    pub id: String,
    pub status: JobState,
    pub output: String,
}

impl From<&Job> for JobUpdate {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            status: job.state,
            output: job.output.clone(),
        }
    }
}
