use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::scheduler::job::WorkerId;
use crate::scheduler::matcher::WorkerView;

/// Opaque handle of a registered wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct WaitHandle(u64);

impl std::fmt::Display for WaitHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "wait-{}", self.0)
    }
}

/// How a wait entry left the table. All three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WaitState {
    Fulfilled,
    Expired,
    Cancelled,
}

impl std::fmt::Display for WaitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitState::Fulfilled => write!(f, "fulfilled"),
            WaitState::Expired => write!(f, "expired"),
            WaitState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A worker waiting for a matching job, with its filters frozen at
/// registration time.
#[derive(Debug, Clone)]
pub struct WaitEntry {
    pub handle: WaitHandle,
    pub view: WorkerView,
    pub deadline: Instant,
    pub notify_addr: Option<SocketAddr>,
    wake: Arc<Notify>,
}

impl WaitEntry {
    pub fn worker(&self) -> &WorkerId {
        &self.view.worker
    }

    pub fn is_live_at(&self, now: Instant) -> bool {
        now < self.deadline
    }

    /// Wake whoever is suspended on this entry. A wake with no one waiting
    /// is kept until the next wait.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }
}

/// Lock a shared waiter table. Critical sections never await, and every
/// operation leaves the table consistent, so a poisoned lock is recovered.
pub fn lock_waiters(waiters: &Mutex<WaiterTable>) -> MutexGuard<'_, WaiterTable> {
    waiters.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Workers blocked in, or listening after, a fetch call.
///
/// A worker owns at most one entry; registering again replaces it and wakes
/// the displaced holder.
#[derive(Debug, Default)]
pub struct WaiterTable {
    entries: HashMap<WaitHandle, WaitEntry>,
    by_worker: HashMap<WorkerId, WaitHandle>,
    next_handle: u64,
}

impl WaiterTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_wait(
        &mut self,
        view: WorkerView,
        deadline: Instant,
        notify_addr: Option<SocketAddr>,
    ) -> WaitEntry {
        if let Some(previous) = self.by_worker.get(&view.worker).copied() {
            if let Some(displaced) = self.remove(previous, WaitState::Cancelled) {
                displaced.wake();
            }
        }

        self.next_handle += 1;
        let handle = WaitHandle(self.next_handle);
        let entry = WaitEntry {
            handle,
            view,
            deadline,
            notify_addr,
            wake: Arc::new(Notify::new()),
        };

        tracing::debug!(
            handle = %handle,
            worker = %entry.view.worker,
            scope = %entry.view.scope,
            notify_addr = ?notify_addr,
            "Wait registered"
        );
        self.by_worker.insert(entry.view.worker.clone(), handle);
        self.entries.insert(handle, entry.clone());
        entry
    }

    /// Remove and return every entry whose deadline is at or before `now`.
    pub fn expire_due(&mut self, now: Instant) -> Vec<WaitEntry> {
        let due: Vec<WaitHandle> = self
            .entries
            .values()
            .filter(|e| !e.is_live_at(now))
            .map(|e| e.handle)
            .collect();

        due.into_iter()
            .filter_map(|handle| self.remove(handle, WaitState::Expired))
            .collect()
    }

    pub fn cancel(&mut self, handle: WaitHandle) -> Option<WaitEntry> {
        self.remove(handle, WaitState::Cancelled)
    }

    /// Drop the worker's entry after it claimed a job synchronously.
    pub fn fulfill_worker(&mut self, worker: &WorkerId) -> Option<WaitEntry> {
        let handle = self.by_worker.get(worker).copied()?;
        self.remove(handle, WaitState::Fulfilled)
    }

    /// Cancel everything, waking long-pollers so they return.
    pub fn cancel_all(&mut self) -> usize {
        let handles: Vec<WaitHandle> = self.entries.keys().copied().collect();
        let count = handles.len();
        for handle in handles {
            if let Some(entry) = self.remove(handle, WaitState::Cancelled) {
                entry.wake();
            }
        }
        count
    }

    /// Copies of the entries still before their deadline.
    pub fn snapshot_live(&self, now: Instant) -> Vec<WaitEntry> {
        self.entries
            .values()
            .filter(|e| e.is_live_at(now))
            .cloned()
            .collect()
    }

    pub fn is_live(&self, handle: WaitHandle, now: Instant) -> bool {
        self.entries
            .get(&handle)
            .is_some_and(|entry| entry.is_live_at(now))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove(&mut self, handle: WaitHandle, state: WaitState) -> Option<WaitEntry> {
        let entry = self.entries.remove(&handle)?;
        if self.by_worker.get(&entry.view.worker) == Some(&handle) {
            self.by_worker.remove(&entry.view.worker);
        }
        tracing::debug!(handle = %handle, worker = %entry.view.worker, state = %state, "Wait closed");
        Some(entry)
    }
}
