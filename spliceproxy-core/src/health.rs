use spliceproxy_config::{Config, Protocol};
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::lookup_host;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Probe scheme; an allow-list entry's `protocol` selects which of these
/// run against its endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// One resolved address of an allow-listed site, with its last probe state.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub http_up: bool,
    pub https_up: bool,
    /// True when the last probe transitioned either availability flag
    pub changed: bool,
}

impl Endpoint {
    fn new(ip: IpAddr) -> Self {
        Self {
            ip,
            http_up: false,
            https_up: false,
            changed: false,
        }
    }

    pub fn up(&self, scheme: Scheme) -> bool {
        match scheme {
            Scheme::Http => self.http_up,
            Scheme::Https => self.https_up,
        }
    }
}

#[derive(Default)]
struct Ring {
    endpoints: Vec<Endpoint>,
    cursor: usize,
}

/// An allow-listed site tracked by the health manager.
///
/// The endpoint ring mirrors DNS: ticks evict addresses that stopped
/// resolving and append new ones with both flags down until their first
/// probe. Ring mutation and lookups are serialized behind the mutex.
pub struct Site {
    name: String,
    protocol: Protocol,
    ring: Mutex<Ring>,
}

impl Site {
    fn new(name: String, protocol: Protocol) -> Self {
        Self {
            name,
            protocol,
            ring: Mutex::new(Ring::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Brings the ring in line with the resolved address set.
    pub async fn sync_endpoints(&self, resolved: &[IpAddr]) {
        let mut ring = self.ring.lock().await;
        ring.endpoints.retain(|ep| {
            let keep = resolved.contains(&ep.ip);
            if !keep {
                info!(site = %self.name, ip = %ep.ip, "removing endpoint no longer in DNS");
            }
            keep
        });
        for &ip in resolved {
            if ring.endpoints.iter().all(|ep| ep.ip != ip) {
                info!(site = %self.name, %ip, "adding endpoint");
                ring.endpoints.push(Endpoint::new(ip));
            }
        }
        let len = ring.endpoints.len();
        if ring.cursor >= len {
            ring.cursor = 0;
        }
    }

    /// Records a probe result, flipping `changed` iff the flag transitioned.
    pub async fn apply_probe(&self, ip: IpAddr, scheme: Scheme, up: bool) {
        let mut ring = self.ring.lock().await;
        let Some(ep) = ring.endpoints.iter_mut().find(|ep| ep.ip == ip) else {
            // evicted between probe start and completion
            return;
        };
        let was = ep.up(scheme);
        ep.changed = was != up;
        match scheme {
            Scheme::Http => ep.http_up = up,
            Scheme::Https => ep.https_up = up,
        }
        if ep.changed {
            info!(
                site = %self.name,
                %ip,
                scheme = scheme.as_str(),
                up,
                "endpoint availability changed"
            );
        }
    }

    /// Returns the next endpoint that is up for `scheme`, advancing the
    /// round-robin cursor. The scan is bounded to one full ring revolution;
    /// `None` means no endpoint currently serves the scheme.
    pub async fn endpoint_for(&self, scheme: Scheme) -> Option<Endpoint> {
        let mut ring = self.ring.lock().await;
        let len = ring.endpoints.len();
        if len == 0 {
            return None;
        }
        for _ in 0..len {
            let i = ring.cursor % len;
            ring.cursor = (i + 1) % len;
            if ring.endpoints[i].up(scheme) {
                return Some(ring.endpoints[i].clone());
            }
        }
        None
    }

    /// Snapshot of the ring, for probing and inspection.
    pub async fn endpoints(&self) -> Vec<Endpoint> {
        self.ring.lock().await.endpoints.clone()
    }
}

/// Periodic DNS/reachability monitor over the allow-listed sites.
///
/// Runs only when `check > 0`. Every tick resolves each site through the
/// system resolver, syncs its ring, and probes every endpoint with `HEAD /`
/// per configured scheme, the site name as the Host header and certificate
/// verification disabled.
pub struct HealthManager {
    sites: Vec<Arc<Site>>,
    client: reqwest::Client,
    interval: Duration,
}

impl HealthManager {
    pub fn new(config: &Config) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(config.timeout))
            .build()?;
        let sites = config
            .alloweddomains
            .iter()
            .map(|d| Arc::new(Site::new(d.name.clone(), d.protocol)))
            .collect();
        Ok(Self {
            sites,
            client,
            interval: Duration::from_secs(config.check.max(1)),
        })
    }

    /// Tick loop; the first tick fires immediately.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    /// One monitoring pass: resolve and sync each site, then launch the
    /// probes. Probes for distinct endpoints run independently.
    pub async fn tick(&self) {
        for site in &self.sites {
            match resolve(site.name()).await {
                Ok(ips) => site.sync_endpoints(&ips).await,
                Err(e) => {
                    warn!(site = %site.name, error = %e, "could not resolve site");
                    continue;
                }
            }
            for ep in site.endpoints().await {
                let site = site.clone();
                let client = self.client.clone();
                tokio::spawn(async move {
                    probe_endpoint(&client, &site, ep.ip).await;
                });
            }
        }
    }

    /// Round-robin pick for an exact site name, if the manager tracks it.
    pub async fn ranked_ip(&self, host: &str, scheme: Scheme) -> Option<IpAddr> {
        let site = self
            .sites
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(host))?;
        site.endpoint_for(scheme).await.map(|ep| ep.ip)
    }

    pub fn sites(&self) -> &[Arc<Site>] {
        &self.sites
    }
}

async fn resolve(name: &str) -> io::Result<Vec<IpAddr>> {
    let addrs = lookup_host((name, 0u16)).await?;
    Ok(addrs.map(|a| a.ip()).collect())
}

async fn probe_endpoint(client: &reqwest::Client, site: &Site, ip: IpAddr) {
    if site.protocol.probes_http() {
        let up = head_probe(client, Scheme::Http, ip, site.name()).await;
        site.apply_probe(ip, Scheme::Http, up).await;
    }
    if site.protocol.probes_https() {
        let up = head_probe(client, Scheme::Https, ip, site.name()).await;
        site.apply_probe(ip, Scheme::Https, up).await;
    }
}

/// `HEAD scheme://ip/` with the site as Host. Any response counts as up;
/// only transport errors count as down.
async fn head_probe(client: &reqwest::Client, scheme: Scheme, ip: IpAddr, host: &str) -> bool {
    let url = match ip {
        IpAddr::V4(v4) => format!("{}://{}/", scheme.as_str(), v4),
        IpAddr::V6(v6) => format!("{}://[{}]/", scheme.as_str(), v6),
    };
    match client
        .head(&url)
        .header(reqwest::header::HOST, host)
        .send()
        .await
    {
        Ok(_) => true,
        Err(e) => {
            debug!(site = host, %ip, scheme = scheme.as_str(), error = %e, "probe failed");
            false
        }
    }
}
