use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::broker::Broker;
use crate::config::BrokerConfig;
use crate::dashboard::{run_dashboard, DashboardState};
use crate::error::Result;
use crate::server::BrokerServer;

/// A running broker process: listener, expiry sweeper and optional dashboard
/// around one shared [`Broker`].
pub struct BrokerNode {
    pub broker: Arc<Broker>,
    server: BrokerServer,
}

impl BrokerNode {
    /// Bind the notification socket and the listener.
    pub async fn bind(config: BrokerConfig) -> Result<Self> {
        let listen_addr = config.listen_addr;
        let broker = Arc::new(Broker::bind(config).await?);
        let server = BrokerServer::bind(listen_addr, broker.clone()).await?;
        Ok(Self { broker, server })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.server.local_addr()
    }

    /// Run until `token` is cancelled, then shut the broker down.
    ///
    /// 1. Spawns the expiry sweeper
    /// 2. Optionally spawns the dashboard
    /// 3. Runs the line-protocol listener (blocks)
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        let sweeper = tokio::spawn(self.broker.clone().run_sweeper(token.child_token()));

        if let Some(addr) = self.broker.config().dashboard_addr {
            let state = DashboardState {
                broker: self.broker.clone(),
            };
            tokio::spawn(run_dashboard(addr, state, token.child_token()));
        }

        let result = self.server.run(token.clone()).await;

        self.broker.shutdown().await;
        if let Err(e) = sweeper.await {
            tracing::warn!(error = %e, "Expiry sweeper task failed");
        }
        result
    }
}
