pub mod bridge;
pub mod handler;
mod http;
pub mod metrics;
pub mod queue;
pub mod server;
pub mod splice;
pub mod target;

pub use bridge::{Bridge, BridgeError, BridgeOptions, ConnectionSource, NominalAddr};
pub use handler::{BoxedConn, Connection, HijackError, RequestHandler, ResponseWriter};
pub use http::{HttpError, protocol_name};
pub use metrics::BridgeMetrics;
pub use server::ServerConfig;
pub use target::matches_target;

use connbridge_config::Config;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::Duration;
use tracing::info;

/// Binds every configured listen address and serves `bridge` on them until
/// `shutdown` fires.
pub async fn run_bridge(
    config: &Config,
    bridge: Arc<Bridge>,
    shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut listeners: Vec<TcpListener> = Vec::new();
    for addr_str in &config.listen_addrs {
        let addr: SocketAddr = addr_str.parse()?;
        info!("Starting listener on {}", addr);
        listeners.push(TcpListener::bind(addr).await?);
    }

    let server_config = ServerConfig {
        header_timeout: Duration::from_secs(config.timeouts.request_header),
        ..Default::default()
    };

    info!(targets = ?bridge.targets(), "Bridge started, waiting for connections...");
    server::serve(listeners, bridge, server_config, shutdown).await;

    info!("Shutting down bridge listeners");
    Ok(())
}
