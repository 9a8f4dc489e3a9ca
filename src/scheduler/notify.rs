use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::time::Instant;

use crate::scheduler::job::Job;
use crate::scheduler::matcher::MatchEngine;
use crate::scheduler::waiters::{lock_waiters, WaitHandle, WaiterTable};

/// Outbound channel for wake-up datagrams. Best effort; must not block.
pub trait NotificationSink: Send + Sync {
    fn send(&self, target: SocketAddr, payload: &[u8]) -> io::Result<()>;
}

/// Sends notifications from a single UDP socket.
#[derive(Debug)]
pub struct UdpNotifier {
    socket: UdpSocket,
}

impl UdpNotifier {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        tracing::info!(addr = %socket.local_addr()?, "Notification socket bound");
        Ok(Self { socket })
    }
}

impl NotificationSink for UdpNotifier {
    fn send(&self, target: SocketAddr, payload: &[u8]) -> io::Result<()> {
        // try_send_to never parks the submitter; a full buffer is a dropped datagram.
        self.socket.try_send_to(payload, target).map(|_| ())
    }
}

/// Discards every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl NotificationSink for NullNotifier {
    fn send(&self, _target: SocketAddr, _payload: &[u8]) -> io::Result<()> {
        Ok(())
    }
}

/// Text of a wake-up datagram for `job` submitted to queue `queue`.
pub fn notification_payload(queue: &str, job: &Job) -> String {
    format!("queue={}&scope={}&job_key={}", queue, job.scope, job.id)
}

#[derive(Debug, Default)]
pub struct DispatchCounters {
    pub sent: AtomicU64,
    pub failed: AtomicU64,
    pub woken: AtomicU64,
}

/// Wakes the waiters a freshly enqueued job could satisfy.
///
/// A wake-up only says "poll again"; it never reserves the job.
pub struct NotificationDispatcher {
    engine: MatchEngine,
    sink: Arc<dyn NotificationSink>,
    queue_name: String,
    counters: DispatchCounters,
}

impl NotificationDispatcher {
    pub fn new(engine: MatchEngine, sink: Arc<dyn NotificationSink>, queue_name: String) -> Self {
        Self {
            engine,
            sink,
            queue_name,
            counters: DispatchCounters::default(),
        }
    }

    pub fn counters(&self) -> &DispatchCounters {
        &self.counters
    }

    /// Notify every live waiter matching `job`. Returns the handles woken.
    ///
    /// Works from a copy of the table; the lock is only retaken briefly to
    /// confirm each entry is still live right before it is signalled.
    pub fn on_enqueue(&self, job: &Job, waiters: &Mutex<WaiterTable>) -> Vec<WaitHandle> {
        let snapshot = lock_waiters(waiters).snapshot_live(Instant::now());
        let matched: Vec<_> = snapshot
            .into_iter()
            .filter(|entry| self.engine.matches(job, &entry.view))
            .collect();

        if matched.is_empty() {
            return Vec::new();
        }

        let payload = notification_payload(&self.queue_name, job);
        let mut woken = Vec::with_capacity(matched.len());

        for entry in matched {
            // Entries expired or cancelled since the snapshot get nothing.
            let live = lock_waiters(waiters).is_live(entry.handle, Instant::now());
            if !live {
                continue;
            }

            entry.wake();
            self.counters.woken.fetch_add(1, Ordering::Relaxed);
            woken.push(entry.handle);

            let Some(target) = entry.notify_addr else {
                continue;
            };
            match self.sink.send(target, payload.as_bytes()) {
                Ok(()) => {
                    self.counters.sent.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        job_id = %job.id,
                        worker = %entry.worker(),
                        target = %target,
                        "Notification sent"
                    );
                }
                Err(e) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        job_id = %job.id,
                        worker = %entry.worker(),
                        target = %target,
                        error = %e,
                        "Failed to send notification"
                    );
                }
            }
        }

        woken
    }
}
