use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::scheduler::{
    lock_waiters, AffinityFilter, Job, JobId, JobQueue, MatchEngine, NotificationDispatcher,
    NotificationSink, ScopeRegistry, UdpNotifier, WaitHandle, WaiterTable, WorkerId, WorkerView,
};

/// A job submission.
#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    pub payload: String,
    /// Scope tag; empty for the global scope.
    pub scope: String,
    pub affinities: BTreeSet<String>,
}

impl SubmitRequest {
    pub fn new(payload: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            scope: scope.into(),
            affinities: BTreeSet::new(),
        }
    }
}

/// A worker's request for a job.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub worker: WorkerId,
    pub affinity: AffinityFilter,
    pub accept_unscoped: bool,
    /// Seconds to wait for a match; zero returns immediately.
    pub timeout_secs: u64,
    /// Where to send wake-up datagrams. When set, a fetch that finds
    /// nothing returns at once and leaves a listening wait behind.
    pub notify_addr: Option<SocketAddr>,
}

impl FetchRequest {
    pub fn immediate(worker: WorkerId, affinity: AffinityFilter) -> Self {
        Self {
            worker,
            affinity,
            accept_unscoped: false,
            timeout_secs: 0,
            notify_addr: None,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_notify_addr(mut self, addr: SocketAddr) -> Self {
        self.notify_addr = Some(addr);
        self
    }

    pub fn accepting_unscoped(mut self, accept: bool) -> Self {
        self.accept_unscoped = accept;
        self
    }
}

/// Result of a fetch. Only `Claimed` carries a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Claimed(Job),
    /// Nothing matched, either immediately or before the deadline.
    Empty,
    /// Nothing matched; the worker will be notified until the deadline.
    Listening(WaitHandle),
}

impl FetchOutcome {
    pub fn job(&self) -> Option<&Job> {
        match self {
            FetchOutcome::Claimed(job) => Some(job),
            _ => None,
        }
    }

    pub fn into_job(self) -> Option<Job> {
        match self {
            FetchOutcome::Claimed(job) => Some(job),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct BrokerCounters {
    submitted: AtomicU64,
    claimed: AtomicU64,
    expired: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WaiterStatus {
    pub handle: WaitHandle,
    pub worker: String,
    pub scope: String,
    pub remaining_ms: u64,
    pub notify_addr: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BrokerStatus {
    pub queue: String,
    pub pending: usize,
    pub pending_by_scope: BTreeMap<String, usize>,
    pub waiters: Vec<WaiterStatus>,
    pub scope_bindings: usize,
    pub submitted: u64,
    pub claimed: u64,
    pub expired: u64,
    pub woken: u64,
    pub notifications_sent: u64,
    pub notifications_failed: u64,
}

/// Removes a long-poll's wait entry if the fetch future is dropped while
/// suspended, e.g. when the connection driving it goes away.
struct WaitGuard<'a> {
    waiters: &'a std::sync::Mutex<WaiterTable>,
    handle: Option<WaitHandle>,
}

impl<'a> WaitGuard<'a> {
    fn new(waiters: &'a std::sync::Mutex<WaiterTable>, handle: WaitHandle) -> Self {
        Self {
            waiters,
            handle: Some(handle),
        }
    }

    /// Leave the entry in place, owned by the caller from now on.
    fn release(mut self) -> Option<WaitHandle> {
        self.handle.take()
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            lock_waiters(self.waiters).cancel(handle);
        }
    }
}

/// Shared broker state. One instance per server, handed out as `Arc<Broker>`.
///
/// The waiter table sits behind a blocking mutex: its critical sections are
/// short and never span an await, which keeps claim bookkeeping atomic with
/// respect to cancellation of the calling future.
pub struct Broker {
    config: BrokerConfig,
    engine: MatchEngine,
    scopes: RwLock<ScopeRegistry>,
    queue: Mutex<JobQueue>,
    waiters: std::sync::Mutex<WaiterTable>,
    dispatcher: NotificationDispatcher,
    counters: BrokerCounters,
    closed: AtomicBool,
}

impl Broker {
    pub fn new(config: BrokerConfig, sink: Arc<dyn NotificationSink>) -> Self {
        let engine = MatchEngine::new(config.worker_node_scopes);
        Self {
            dispatcher: NotificationDispatcher::new(engine, sink, config.queue_name.clone()),
            engine,
            scopes: RwLock::new(ScopeRegistry::new()),
            queue: Mutex::new(JobQueue::with_capacity(config.max_jobs)),
            waiters: std::sync::Mutex::new(WaiterTable::new()),
            counters: BrokerCounters::default(),
            closed: AtomicBool::new(false),
            config,
        }
    }

    /// Build a broker that notifies over a UDP socket bound to
    /// `config.notify_bind_addr`.
    pub async fn bind(config: BrokerConfig) -> Result<Self> {
        let notifier = UdpNotifier::bind(config.notify_bind_addr).await?;
        Ok(Self::new(config, Arc::new(notifier)))
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn queue_name(&self) -> &str {
        &self.config.queue_name
    }

    pub async fn set_scope(&self, worker: &WorkerId, scope: &str) {
        self.scopes.write().await.set_scope(worker, scope);
    }

    pub async fn get_scope(&self, worker: &WorkerId) -> String {
        self.scopes.read().await.get_scope(worker).to_string()
    }

    /// Enqueue a job and wake the waiters it could satisfy.
    pub async fn submit(&self, request: SubmitRequest) -> Result<JobId> {
        self.ensure_open()?;

        let job = Job::new(request.payload, request.scope).with_affinities(request.affinities);
        let id = self.queue.lock().await.push(job.clone())?;
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        tracing::info!(job_id = %id, scope = %job.scope, "Job submitted");

        let woken = self.dispatcher.on_enqueue(&job, &self.waiters);
        if !woken.is_empty() {
            tracing::debug!(job_id = %id, woken = woken.len(), "Waiters woken");
        }
        Ok(id)
    }

    /// Submit into whatever scope `submitter` is currently bound to.
    pub async fn submit_from(
        &self,
        submitter: &WorkerId,
        payload: impl Into<String>,
        affinities: BTreeSet<String>,
    ) -> Result<JobId> {
        let scope = self.get_scope(submitter).await;
        self.submit(SubmitRequest {
            payload: payload.into(),
            scope,
            affinities,
        })
        .await
    }

    /// Claim a matching job, optionally waiting for one.
    ///
    /// No lock is held while the caller is suspended. Dropping the returned
    /// future never loses a claimed job and, for a long poll, removes its
    /// wait entry.
    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchOutcome> {
        self.ensure_open()?;

        let scope = self.get_scope(&request.worker).await;
        let view = WorkerView::new(request.worker.clone(), scope, request.affinity)
            .accepting_unscoped(request.accept_unscoped);

        if let Some(job) = self.try_claim(&view).await? {
            return Ok(FetchOutcome::Claimed(job));
        }

        let Some(wait) = self.config.wait_for(request.timeout_secs) else {
            return Ok(FetchOutcome::Empty);
        };
        let deadline = Instant::now().checked_add(wait).ok_or_else(|| {
            BrokerError::InvalidParameter(format!("timeout of {}s is out of range", wait.as_secs()))
        })?;

        let entry =
            lock_waiters(&self.waiters).register_wait(view.clone(), deadline, request.notify_addr);
        let guard = WaitGuard::new(&self.waiters, entry.handle);

        // A submit may have landed between the first claim and registration.
        if let Some(job) = self.try_claim(&view).await? {
            return Ok(FetchOutcome::Claimed(job));
        }

        if request.notify_addr.is_some() {
            return Ok(guard
                .release()
                .map_or(FetchOutcome::Empty, FetchOutcome::Listening));
        }

        let waker = entry.waker();
        loop {
            if tokio::time::timeout_at(deadline, waker.notified())
                .await
                .is_err()
            {
                let timed_out = lock_waiters(&self.waiters).cancel(entry.handle).is_some();
                if timed_out {
                    self.counters.expired.fetch_add(1, Ordering::Relaxed);
                }
                tracing::debug!(worker = %view.worker, "Fetch wait timed out");
                return Ok(FetchOutcome::Empty);
            }

            let live = lock_waiters(&self.waiters).is_live(entry.handle, Instant::now());
            if !live {
                // Cancelled by shutdown, teardown or a newer fetch.
                return Ok(FetchOutcome::Empty);
            }

            if let Some(job) = self.try_claim(&view).await? {
                return Ok(FetchOutcome::Claimed(job));
            }
        }
    }

    /// The only await is taking the queue lock; once a job leaves the queue
    /// it is returned without yielding again.
    async fn try_claim(&self, view: &WorkerView) -> Result<Option<Job>> {
        let claimed = self.queue.lock().await.try_claim(&self.engine, view);
        let job = match claimed {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(worker = %view.worker, error = %e, "Claim aborted");
                return Err(e);
            }
        };

        if job.is_some() {
            self.counters.claimed.fetch_add(1, Ordering::Relaxed);
            lock_waiters(&self.waiters).fulfill_worker(&view.worker);
        }
        Ok(job)
    }

    /// Drop a wait registered by an earlier fetch, e.g. when the connection
    /// that owns it closes. Returns false if it already ended.
    pub fn cancel_wait(&self, handle: WaitHandle) -> bool {
        let cancelled = lock_waiters(&self.waiters).cancel(handle);
        match cancelled {
            Some(entry) => {
                entry.wake();
                true
            }
            None => false,
        }
    }

    /// Remove waits whose deadline has passed. Returns how many were removed.
    pub fn expire_due(&self) -> usize {
        let expired = lock_waiters(&self.waiters).expire_due(Instant::now());
        for entry in &expired {
            entry.wake();
        }
        if !expired.is_empty() {
            self.counters
                .expired
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
            tracing::debug!(count = expired.len(), "Expired waits removed");
        }
        expired.len()
    }

    /// Periodically expire due waits until `token` is cancelled.
    pub async fn run_sweeper(self: Arc<Self>, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.sweep_interval());
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!("Expiry sweeper stopping");
                    break;
                }
                _ = interval.tick() => {
                    self.expire_due();
                }
            }
        }
    }

    /// Refuse new work, release every waiter and clear scope bindings.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let cancelled = lock_waiters(&self.waiters).cancel_all();
        self.scopes.write().await.clear();
        tracing::info!(cancelled, "Broker shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(BrokerError::ShutDown)
        } else {
            Ok(())
        }
    }

    pub async fn pending_jobs(&self) -> Vec<Job> {
        self.queue.lock().await.pending_jobs().cloned().collect()
    }

    pub async fn claimed_by(&self, id: &JobId) -> Option<WorkerId> {
        self.queue.lock().await.claimed_by(id).cloned()
    }

    pub fn live_waiters(&self) -> usize {
        lock_waiters(&self.waiters).snapshot_live(Instant::now()).len()
    }

    pub async fn status(&self) -> BrokerStatus {
        let (pending, pending_by_scope) = {
            let queue = self.queue.lock().await;
            let mut by_scope = BTreeMap::new();
            for job in queue.pending_jobs() {
                *by_scope.entry(job.scope.clone()).or_insert(0) += 1;
            }
            (queue.len(), by_scope)
        };

        let now = Instant::now();
        let snapshot = lock_waiters(&self.waiters).snapshot_live(now);
        let mut waiters: Vec<WaiterStatus> = snapshot
            .into_iter()
            .map(|entry| WaiterStatus {
                handle: entry.handle,
                worker: entry.worker().to_string(),
                scope: entry.view.scope.clone(),
                remaining_ms: entry.deadline.saturating_duration_since(now).as_millis() as u64,
                notify_addr: entry.notify_addr.map(|a| a.to_string()),
            })
            .collect();
        waiters.sort_by_key(|w| w.handle);

        let dispatch = self.dispatcher.counters();
        BrokerStatus {
            queue: self.config.queue_name.clone(),
            pending,
            pending_by_scope,
            waiters,
            scope_bindings: self.scopes.read().await.len(),
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            claimed: self.counters.claimed.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            woken: dispatch.woken.load(Ordering::Relaxed),
            notifications_sent: dispatch.sent.load(Ordering::Relaxed),
            notifications_failed: dispatch.failed.load(Ordering::Relaxed),
        }
    }
}
