//! Scope-aware job matching and wake-up notification.
//!
//! Leaves first:
//!
//! - [`scope`]: worker identity to virtual scope bindings
//! - [`matcher`]: the shared scope/affinity predicate
//! - [`queue`]: FIFO pending jobs with exactly-once claims
//! - [`waiters`]: workers waiting for a match, with deadlines
//! - [`notify`]: fan-out of wake-ups to matching waiters

pub mod job;
pub mod matcher;
pub mod notify;
pub mod queue;
pub mod scope;
pub mod waiters;

pub use job::{Job, JobId, WorkerId, DEFAULT_SCOPE, WORKER_NODE_SCOPE_PREFIX};
pub use matcher::{AffinityFilter, MatchEngine, WorkerView};
pub use notify::{NotificationDispatcher, NotificationSink, NullNotifier, UdpNotifier};
pub use queue::JobQueue;
pub use scope::ScopeRegistry;
pub use waiters::{lock_waiters, WaitEntry, WaitHandle, WaitState, WaiterTable};
