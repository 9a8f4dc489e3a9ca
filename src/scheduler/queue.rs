use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{BrokerError, Result};
use crate::scheduler::job::{Job, JobId, WorkerId};
use crate::scheduler::matcher::{MatchEngine, WorkerView};

const DEFAULT_MAX_JOBS: usize = 10_000;

/// Pending jobs in submission order, plus a bounded record of claims.
#[derive(Debug)]
pub struct JobQueue {
    pending: VecDeque<Job>,
    pending_ids: HashSet<JobId>,
    claimed: HashMap<JobId, WorkerId>,
    claim_order: VecDeque<JobId>,
    max_jobs: usize,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            pending_ids: HashSet::new(),
            claimed: HashMap::new(),
            claim_order: VecDeque::new(),
            max_jobs,
        }
    }

    /// Append a job. Fails when the pending set is at capacity.
    pub fn push(&mut self, job: Job) -> Result<JobId> {
        if self.is_full() {
            return Err(BrokerError::QueueFull(self.max_jobs));
        }
        if self.pending_ids.contains(&job.id) || self.claimed.contains_key(&job.id) {
            return Err(BrokerError::InvariantViolation(format!(
                "job {} enqueued twice",
                job.id
            )));
        }
        let id = job.id;
        self.pending_ids.insert(id);
        self.pending.push_back(job);
        Ok(id)
    }

    /// Remove and return the oldest pending job `view` matches.
    ///
    /// Callers hold exclusive access, so two claims can never observe the
    /// same job.
    pub fn try_claim(&mut self, engine: &MatchEngine, view: &WorkerView) -> Result<Option<Job>> {
        let Some(pos) = self.pending.iter().position(|job| engine.matches(job, view)) else {
            return Ok(None);
        };
        let Some(job) = self.pending.remove(pos) else {
            return Err(BrokerError::InvariantViolation(format!(
                "pending job at position {pos} disappeared"
            )));
        };

        if !self.pending_ids.remove(&job.id) {
            return Err(BrokerError::InvariantViolation(format!(
                "job {} was pending without being indexed",
                job.id
            )));
        }
        if let Some(owner) = self.claimed.get(&job.id) {
            return Err(BrokerError::InvariantViolation(format!(
                "job {} already claimed by {}",
                job.id, owner
            )));
        }

        self.record_claim(job.id, view.worker.clone());
        tracing::info!(job_id = %job.id, worker = %view.worker, scope = %job.scope, "Job claimed");
        Ok(Some(job))
    }

    fn record_claim(&mut self, id: JobId, worker: WorkerId) {
        self.claimed.insert(id, worker);
        self.claim_order.push_back(id);
        while self.claim_order.len() > self.max_jobs {
            if let Some(old) = self.claim_order.pop_front() {
                self.claimed.remove(&old);
            }
        }
    }

    /// Worker that claimed `id`, if the claim is still remembered.
    pub fn claimed_by(&self, id: &JobId) -> Option<&WorkerId> {
        self.claimed.get(id)
    }

    /// Pending jobs in submission order.
    pub fn pending_jobs(&self) -> impl Iterator<Item = &Job> {
        self.pending.iter()
    }

    /// Returns the current number of pending jobs
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.max_jobs
    }
}
