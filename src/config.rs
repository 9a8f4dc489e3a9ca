use std::net::SocketAddr;
use std::time::Duration;

/// Broker configuration.
///
/// The broker serves a single named queue; the name is echoed in every
/// notification datagram so listeners can tell where a wake-up came from.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Address of the line-protocol listener.
    pub listen_addr: SocketAddr,
    /// Local address the notification socket binds to.
    pub notify_bind_addr: SocketAddr,
    /// Optional address of the JSON status API.
    pub dashboard_addr: Option<SocketAddr>,
    pub queue_name: String,
    /// Maximum number of pending jobs.
    pub max_jobs: usize,
    /// Upper bound on a fetch timeout, in seconds. Larger values are clamped.
    pub max_wait_timeout_secs: u64,
    /// Interval between expiry sweeps of the waiter table.
    pub sweep_interval_ms: u64,
    /// Route `WN_SCOPE:::<node>` jobs to unbound worker `<node>`.
    pub worker_node_scopes: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 9100)),
            notify_bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            dashboard_addr: None,
            queue_name: "TEST".to_string(),
            max_jobs: 10_000,
            max_wait_timeout_secs: 3600,
            sweep_interval_ms: 250,
            worker_node_scopes: true,
        }
    }
}

impl BrokerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs;
        self
    }

    pub fn with_dashboard(mut self, addr: SocketAddr) -> Self {
        self.dashboard_addr = Some(addr);
        self
    }

    pub fn with_sweep_interval_ms(mut self, ms: u64) -> Self {
        self.sweep_interval_ms = ms;
        self
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    /// Wait duration for a caller-supplied timeout in seconds.
    /// Zero means no wait.
    pub fn wait_for(&self, timeout_secs: u64) -> Option<Duration> {
        match timeout_secs.min(self.max_wait_timeout_secs) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}
