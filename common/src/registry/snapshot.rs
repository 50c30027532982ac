// Restartable snapshot over registry contents

use crate::models::{Job, JobState};
use std::sync::Arc;

/// Point-in-time view of the registry in creation order
///
/// Filtering is applied lazily while iterating; `iter()` can be called any
/// number of times and always starts from the first job.
#[derive(Debug, Clone)]
pub struct JobList {
    jobs: Arc<[Job]>,
    filter: Option<JobState>,
}

impl JobList {
    pub(crate) fn new(jobs: Vec<Job>, filter: Option<JobState>) -> Self {
        Self {
            jobs: jobs.into(),
            filter,
        }
    }

    pub fn iter(&self) -> JobListIter<'_> {
        JobListIter {
            inner: self.jobs.iter(),
            filter: self.filter,
        }
    }
}

impl<'a> IntoIterator for &'a JobList {
    type Item = &'a Job;
    type IntoIter = JobListIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct JobListIter<'a> {
    inner: std::slice::Iter<'a, Job>,
    filter: Option<JobState>,
}

impl<'a> Iterator for JobListIter<'a> {
    type Item = &'a Job;

    fn next(&mut self) -> Option<Self::Item> {
        let filter = self.filter;
        self.inner
            .by_ref()
            .find(|job| filter.map_or(true, |state| job.state == state))
    }
}
