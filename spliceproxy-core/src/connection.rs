use crate::detect::{self, DetectError};
use crate::dial::{DialError, Dialer};
use crate::health::{HealthManager, Scheme};
use crate::peek::PeekReader;
use crate::splice::splice;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use spliceproxy_config::Config;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Which detector a listener runs against accepted connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Http,
    Https,
}

impl ListenerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ListenerKind::Http => "http",
            ListenerKind::Https => "https",
        }
    }
}

enum PipelineError {
    Detect(DetectError),
    Dial(DialError),
}

impl PipelineError {
    fn kind(&self) -> &'static str {
        match self {
            PipelineError::Detect(DetectError::NoContent) => "no_content",
            PipelineError::Detect(DetectError::NotTls) => "not_tls",
            PipelineError::Detect(DetectError::TlsParse(_)) => "tls_parse",
            PipelineError::Detect(DetectError::NoHttpHost) => "no_http_host",
            PipelineError::Detect(DetectError::ExceedBuffer) => "exceed_buffer",
            PipelineError::Detect(DetectError::Io(_)) => "detect_io",
            PipelineError::Dial(DialError::NoLoopback) => "no_loopback",
            PipelineError::Dial(_) => "dial_failed",
        }
    }
}

/// Per-connection pipeline: peek, detect, route, dial, splice.
#[derive(Clone)]
pub struct ConnectionHandler {
    config: Arc<Config>,
    dialer: Dialer,
    health: Option<Arc<HealthManager>>,
    metrics: Option<Arc<ConnectionMetrics>>,
}

struct ConnectionMetrics {
    connections_total: IntCounterVec,
    connections_active: IntGauge,
    bytes_transferred: IntCounterVec,
    errors_total: IntCounterVec,
}

impl ConnectionMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let connections_total = IntCounterVec::new(
            Opts::new(
                "spliceproxy_connections_total",
                "Connections handled, by listener kind and outcome",
            ),
            &["listener", "outcome"],
        )?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = IntGauge::new(
            "spliceproxy_connections_active",
            "Connections currently being spliced or detected",
        )?;
        registry.register(Box::new(connections_active.clone()))?;

        let bytes_transferred = IntCounterVec::new(
            Opts::new(
                "spliceproxy_bytes_transferred_total",
                "Bytes spliced, by upstream authority and direction",
            ),
            &["authority", "direction"],
        )?;
        registry.register(Box::new(bytes_transferred.clone()))?;

        let errors_total = IntCounterVec::new(
            Opts::new(
                "spliceproxy_errors_total",
                "Pipeline errors, by error kind and listener kind",
            ),
            &["error", "listener"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        Ok(Self {
            connections_total,
            connections_active,
            bytes_transferred,
            errors_total,
        })
    }

    fn splice_counters(&self, authority: &str) -> (IntCounter, IntCounter) {
        const TX: &str = "tx";
        const RX: &str = "rx";
        (
            self.bytes_transferred.with_label_values(&[authority, TX]),
            self.bytes_transferred.with_label_values(&[authority, RX]),
        )
    }
}

impl ConnectionHandler {
    pub fn new(
        config: Arc<Config>,
        registry: Option<&Registry>,
        health: Option<Arc<HealthManager>>,
    ) -> Result<Self, prometheus::Error> {
        let metrics = match registry {
            Some(r) => Some(Arc::new(ConnectionMetrics::new(r)?)),
            None => None,
        };
        let dialer = Dialer::from_config(&config);
        Ok(Self {
            config,
            dialer,
            health,
            metrics,
        })
    }

    /// Drives one accepted connection to completion and records the outcome.
    pub async fn handle_connection(
        &self,
        socket: TcpStream,
        peer: SocketAddr,
        kind: ListenerKind,
    ) {
        let id = Uuid::new_v4().to_string();
        let local_port = match socket.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                warn!(id, error = %e, "could not read local address");
                return;
            }
        };

        info!(id, peer = %peer, port = local_port, listener = kind.as_str(), "accepted connection");
        if let Some(metrics) = &self.metrics {
            metrics.connections_active.inc();
        }

        let deadline = Instant::now() + Duration::from_secs(self.config.timeout);
        let result = self
            .process_connection(&id, socket, local_port, kind, deadline)
            .await;

        if let Some(metrics) = &self.metrics {
            metrics.connections_active.dec();
            let outcome = match &result {
                Ok(_) => "success",
                Err(e) => e.kind(),
            };
            metrics
                .connections_total
                .with_label_values(&[kind.as_str(), outcome])
                .inc();
            if let Err(e) = &result {
                metrics
                    .errors_total
                    .with_label_values(&[e.kind(), kind.as_str()])
                    .inc();
            }
        }

        match result {
            Ok(()) => info!(id, "connection closed"),
            Err(PipelineError::Detect(e)) => warn!(id, error = %e, "destination detection failed"),
            Err(PipelineError::Dial(e @ DialError::NoLoopback)) => {
                warn!(id, error = %e, "refused upstream")
            }
            Err(PipelineError::Dial(e)) => error!(id, error = %e, "upstream dial failed"),
        }
    }

    async fn process_connection(
        &self,
        id: &str,
        socket: TcpStream,
        local_port: u16,
        kind: ListenerKind,
        deadline: Instant,
    ) -> Result<(), PipelineError> {
        let mut peek = PeekReader::with_capacity(socket, self.config.buffer);
        let port = format!(":{local_port}");

        // Detection must finish before the upstream is dialed; the whole
        // phase shares the connection deadline.
        let detected = match kind {
            ListenerKind::Https => {
                timeout_at(
                    deadline,
                    detect::https_destination(id, &mut peek, &port, &self.config),
                )
                .await
            }
            ListenerKind::Http => {
                timeout_at(
                    deadline,
                    detect::http_destination(id, &mut peek, &port, &self.config),
                )
                .await
            }
        };
        let (authority, is_catchall) = match detected {
            Ok(Ok(routed)) => routed,
            Ok(Err(e)) => return Err(PipelineError::Detect(e)),
            // peer sent nothing useful before the deadline
            Err(_) => return Err(PipelineError::Detect(DetectError::NoContent)),
        };

        info!(id, authority, is_catchall, "forwarding");
        let dial_authority = self.ranked_authority(id, &authority, is_catchall, kind).await;
        let upstream = self
            .dialer
            .connect(id, &dial_authority, is_catchall, deadline)
            .await
            .map_err(PipelineError::Dial)?;

        let counters = self
            .metrics
            .as_ref()
            .map(|m| m.splice_counters(&authority));
        splice(id, peek, upstream, deadline, counters).await;
        Ok(())
    }

    /// Swaps the authority's host for a health-ranked IP when the health
    /// manager tracks the destination. Ranked dialing only applies to
    /// direct, allow-listed routes; the proxy path and the catch-all keep
    /// the hostname.
    async fn ranked_authority(
        &self,
        id: &str,
        authority: &str,
        is_catchall: bool,
        kind: ListenerKind,
    ) -> String {
        if is_catchall || !self.config.proxy.is_empty() {
            return authority.to_string();
        }
        let Some(health) = &self.health else {
            return authority.to_string();
        };
        let Some((host, port)) = authority.rsplit_once(':') else {
            return authority.to_string();
        };
        let scheme = match kind {
            ListenerKind::Http => Scheme::Http,
            ListenerKind::Https => Scheme::Https,
        };
        match health.ranked_ip(host, scheme).await {
            Some(ip) => {
                debug!(id, authority, %ip, "using health-ranked endpoint");
                match ip {
                    IpAddr::V4(v4) => format!("{v4}:{port}"),
                    IpAddr::V6(v6) => format!("[{v6}]:{port}"),
                }
            }
            None => authority.to_string(),
        }
    }
}
