// Job registry - single source of truth for job state
// Every job known to the worker lives here regardless of which transport created it

mod snapshot;

use crate::errors::RegistryError;
use crate::models::{Job, JobPayload, JobState};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, instrument};

pub use snapshot::{JobList, JobListIter};

/// Default number of terminal jobs kept before the oldest are evicted
pub const DEFAULT_MAX_RETAINED_JOBS: usize = 1024;

/// Callback invoked once per job when it reaches a terminal state
pub type CompletionCallback = Arc<dyn Fn(&Job) + Send + Sync>;

struct JobEntry {
    job: Job,
    /// Holds the final job once it is terminal
    done: watch::Sender<Option<Job>>,
}

#[derive(Default)]
struct RegistryInner {
    jobs: HashMap<String, JobEntry>,
    /// Job ids in creation order; may still hold evicted ids, counted in `stale`
    order: VecDeque<String>,
    stale: usize,
    /// Terminal job ids in completion order, oldest first
    finished: VecDeque<String>,
    /// Ids of evicted jobs, so an id is never reused within the process.
    /// Grows by one entry per eviction for the process lifetime; it is not
    /// bounded by `max_retained`.
    retired: HashSet<String>,
}

/// In-memory job registry
///
/// All reads and writes are serialized through one lock, so no two
/// transitions on the same job can race. Terminal jobs are retained up to
/// `max_retained` and then evicted oldest first.
pub struct JobRegistry {
    inner: Mutex<RegistryInner>,
    on_complete: RwLock<Option<CompletionCallback>>,
    max_retained: usize,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_MAX_RETAINED_JOBS)
    }

    pub fn with_retention(max_retained: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            on_complete: RwLock::new(None),
            max_retained,
        }
    }

    /// Register the callback fired on every terminal transition
    pub fn set_completion_callback(&self, callback: CompletionCallback) {
        *self.on_complete.write() = Some(callback);
    }

    /// Add a new job in the `received` state
    #[instrument(skip(self, work_type, payload))]
    pub fn create(
        &self,
        id: &str,
        work_type: &str,
        payload: JobPayload,
        detached: bool,
    ) -> Result<Job, RegistryError> {
        let mut inner = self.inner.lock();
        if inner.jobs.contains_key(id) || inner.retired.contains(id) {
            return Err(RegistryError::DuplicateId(id.to_string()));
        }

        let job = Job::new(id, work_type, payload, detached);
        let (done, _) = watch::channel(None);
        inner.jobs.insert(
            id.to_string(),
            JobEntry {
                job: job.clone(),
                done,
            },
        );
        inner.order.push_back(id.to_string());
        debug!(detached, "Job registered");

        Ok(job)
    }

    pub fn get(&self, id: &str) -> Result<Job, RegistryError> {
        self.inner
            .lock()
            .jobs
            .get(id)
            .map(|entry| entry.job.clone())
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Move a job to `next`, appending `output` to what it has accumulated
    #[instrument(skip(self, output))]
    pub fn transition(
        &self,
        id: &str,
        next: JobState,
        output: Option<&str>,
    ) -> Result<(), RegistryError> {
        self.apply_transition(id, None, next, output)
    }

    /// Move a job to `next` only if it is currently in `expected`
    ///
    /// Any other current state is refused with `InvalidTransition`, even when
    /// the edge to `next` would be legal from it.
    #[instrument(skip(self))]
    pub fn transition_from(
        &self,
        id: &str,
        expected: JobState,
        next: JobState,
    ) -> Result<(), RegistryError> {
        self.apply_transition(id, Some(expected), next, None)
    }

    fn apply_transition(
        &self,
        id: &str,
        expected: Option<JobState>,
        next: JobState,
        output: Option<&str>,
    ) -> Result<(), RegistryError> {
        let finished = {
            let mut inner = self.inner.lock();
            let entry = inner
                .jobs
                .get_mut(id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

            let current = entry.job.state;
            if expected.is_some_and(|state| state != current) || !current.can_transition_to(next)
            {
                return Err(RegistryError::InvalidTransition {
                    id: id.to_string(),
                    from: current,
                    to: next,
                });
            }

            entry.job.state = next;
            if let Some(chunk) = output {
                entry.job.output.push_str(chunk);
            }
            debug!(from = %current, to = %next, "Job transitioned");

            if next.is_terminal() {
                entry.job.completed_at = Some(Utc::now());
                let job = entry.job.clone();
                entry.done.send_replace(Some(job.clone()));
                inner.finished.push_back(id.to_string());
                self.evict_locked(&mut inner);
                Some(job)
            } else {
                None
            }
        };

        // Fired outside the lock so the callback may query the registry
        if let Some(job) = finished {
            let callback = self.on_complete.read().clone();
            if let Some(callback) = callback {
                callback(&job);
            }
        }

        Ok(())
    }

    /// Append progress output to a job that has not finished yet
    pub fn append_output(&self, id: &str, chunk: &str) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();
        let entry = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        if entry.job.state.is_terminal() {
            return Err(RegistryError::InvalidTransition {
                id: id.to_string(),
                from: entry.job.state,
                to: entry.job.state,
            });
        }

        entry.job.output.push_str(chunk);
        Ok(())
    }

    /// Snapshot of known jobs in creation order, optionally filtered by state
    pub fn list(&self, filter: Option<JobState>) -> JobList {
        let inner = self.inner.lock();
        let jobs: Vec<Job> = inner
            .order
            .iter()
            .filter_map(|id| inner.jobs.get(id))
            .map(|entry| entry.job.clone())
            .collect();
        JobList::new(jobs, filter)
    }

    /// Subscribe to a job's completion
    ///
    /// The returned waiter resolves even if the job is evicted after it
    /// finishes, so callers that need the final result subscribe before
    /// starting the job.
    pub fn watch(&self, id: &str) -> Result<JobWaiter, RegistryError> {
        let inner = self.inner.lock();
        let entry = inner
            .jobs
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        Ok(JobWaiter {
            id: id.to_string(),
            done: entry.done.subscribe(),
        })
    }

    /// Wait until the job reaches a terminal state and return it
    pub async fn wait_terminal(&self, id: &str) -> Result<Job, RegistryError> {
        self.watch(id)?.wait().await
    }

    pub fn len(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_locked(&self, inner: &mut RegistryInner) {
        while inner.finished.len() > self.max_retained {
            let Some(id) = inner.finished.pop_front() else {
                break;
            };
            inner.jobs.remove(&id);
            debug!(job_id = %id, "Evicted terminal job");
            inner.retired.insert(id);
            inner.stale += 1;
        }

        // Evicted ids are dropped from `order` once they outnumber live jobs
        if inner.stale > inner.jobs.len() {
            let RegistryInner { jobs, order, .. } = &mut *inner;
            order.retain(|id| jobs.contains_key(id));
            inner.stale = 0;
        }
    }
}

/// Pending completion of one job, see [`JobRegistry::watch`]
pub struct JobWaiter {
    id: String,
    done: watch::Receiver<Option<Job>>,
}

impl JobWaiter {
    pub async fn wait(mut self) -> Result<Job, RegistryError> {
        let finished = self
            .done
            .wait_for(Option::is_some)
            .await
            .map_err(|_| RegistryError::NotFound(self.id.clone()))?;

        finished
            .clone()
            .ok_or_else(|| RegistryError::NotFound(self.id.clone()))
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}
