pub mod web;

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Registry, TextEncoder};
use spliceproxy_config::Config;
use spliceproxy_core::health::HealthManager;
use spliceproxy_core::run_proxy;
use std::error::Error;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

/// Wires everything together and runs until shutdown: logging, config,
/// catch-all responder, health manager, metrics endpoint, proxy.
pub async fn run(config_path: &Path) -> Result<(), Box<dyn Error>> {
    fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into())
                .add_directive("spliceproxy=debug".parse()?),
        )
        .with_target(false)
        .json()
        .init();

    info!(path = %config_path.display(), "reading config file");
    let config = Arc::new(Config::from_file(config_path)?);

    info!(authority = %config.catchall.http, "HTTP catch-all");
    info!(authority = %config.catchall.https, "HTTPS catch-all");
    if !config.proxy.is_empty() {
        info!(proxy = %config.proxy, "forward proxy configured");
    }
    for domain in &config.alloweddomains {
        info!(domain = %domain.name, "allowed domain");
    }
    if config.forceipv4 {
        info!("forcing IPv4 for upstream dialing");
    }

    // Serve deny messages on the catch-all authorities
    if config.catchall.serve {
        web::serve(config.clone()).await?;
    }

    // Check endpoints
    let health = if config.check > 0 {
        let manager = Arc::new(HealthManager::new(&config)?);
        info!(interval_secs = config.check, "starting health manager");
        tokio::spawn(manager.clone().run());
        Some(manager)
    } else {
        None
    };

    let (registry, metrics_task) = if config.metrics.enabled {
        let registry = Registry::new();
        let addr: SocketAddr = config.metrics.address.parse()?;
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "metrics server listening");
        let task = tokio::spawn(serve_metrics(listener, registry.clone()));
        (Some(registry), Some(task))
    } else {
        (None, None)
    };

    let result = run_proxy(config, registry.as_ref(), health).await;

    if let Some(task) = metrics_task {
        task.abort();
    }
    result
}

async fn serve_metrics(listener: TcpListener, registry: Registry) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "metrics accept error");
                continue;
            }
        };
        let registry = registry.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = hyper::service::service_fn(move |req: Request<hyper::body::Incoming>| {
                let registry = registry.clone();
                async move { handle_metrics(&req, &registry) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                warn!(error = %e, "metrics connection error");
            }
        });
    }
}

fn handle_metrics(
    req: &Request<hyper::body::Incoming>,
    registry: &Registry,
) -> Result<Response<Full<Bytes>>, String> {
    match req.uri().path() {
        "/metrics" => {
            let encoder = TextEncoder::new();
            let mut buffer = Vec::new();
            encoder
                .encode(&registry.gather(), &mut buffer)
                .map_err(|e| format!("metrics encoding error: {e}"))?;
            Ok(Response::new(Full::new(Bytes::from(buffer))))
        }
        "/health" => Ok(Response::new(Full::new(Bytes::from_static(
            br#"{"status":"healthy","service":"spliceproxy"}"#,
        )))),
        _ => Ok(Response::new(Full::new(Bytes::from_static(
            br#"{"error":"not_found"}"#,
        )))),
    }
}
