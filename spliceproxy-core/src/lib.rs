pub mod connection;
pub mod detect;
pub mod dial;
pub mod health;
pub mod peek;
pub mod splice;

use health::HealthManager;
use prometheus::Registry;
use spliceproxy_config::Config;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

pub use connection::{ConnectionHandler, ListenerKind};
pub use detect::{DetectError, parse_client_hello};
pub use dial::{DialError, Dialer, is_loopback};
pub use peek::PeekReader;

/// Binds every configured listener and serves connections until ctrl-c.
///
/// Bind failures are fatal; accept failures are logged and the loop
/// continues. Each accepted connection runs as its own task.
pub async fn run_proxy(
    config: Arc<Config>,
    registry: Option<&Registry>,
    health: Option<Arc<HealthManager>>,
) -> Result<(), Box<dyn std::error::Error>> {
    let handler = ConnectionHandler::new(config.clone(), registry, health)?;

    let mut listeners: Vec<(TcpListener, ListenerKind)> = Vec::new();
    for addr in &config.listen.http {
        info!(addr, listener = "http", "starting listener");
        listeners.push((TcpListener::bind(addr).await?, ListenerKind::Http));
    }
    for addr in &config.listen.https {
        info!(addr, listener = "https", "starting listener");
        listeners.push((TcpListener::bind(addr).await?, ListenerKind::Https));
    }

    let mut accept_loops = Vec::new();
    for (listener, kind) in listeners {
        let handler = handler.clone();
        accept_loops.push(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            handler.handle_connection(socket, peer, kind).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, listener = kind.as_str(), "accept error");
                    }
                }
            }
        }));
    }

    info!("proxy started, waiting for connections");
    signal::ctrl_c().await?;
    info!("received shutdown signal");

    for task in &accept_loops {
        task.abort();
    }
    let _ = futures::future::join_all(accept_loops).await;
    info!("shutting down proxy");
    Ok(())
}
