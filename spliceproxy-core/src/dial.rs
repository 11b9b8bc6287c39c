use spliceproxy_config::Config;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, lookup_host};
use tokio::time::{Instant, timeout_at};
use tracing::debug;
use url::Url;

const MAX_PROXY_RESPONSE: usize = 4096;

#[derive(Debug)]
pub enum DialError {
    /// Non-catch-all destination resolves to loopback; self-routing guard
    NoLoopback,
    /// Resolution produced no usable address (after the IPv4 filter)
    NoAddress,
    ProxyUrl(url::ParseError),
    /// Forward proxy refused or mangled the CONNECT exchange
    Proxy(String),
    /// Connection deadline elapsed while dialing
    Timeout,
    Io(io::Error),
}

impl std::fmt::Display for DialError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DialError::NoLoopback => write!(f, "refusing to dial loopback upstream"),
            DialError::NoAddress => write!(f, "destination resolved to no usable address"),
            DialError::ProxyUrl(e) => write!(f, "invalid proxy URL: {}", e),
            DialError::Proxy(what) => write!(f, "CONNECT tunnel failed: {}", what),
            DialError::Timeout => write!(f, "dial deadline elapsed"),
            DialError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for DialError {}

impl From<io::Error> for DialError {
    fn from(err: io::Error) -> Self {
        DialError::Io(err)
    }
}

impl From<tokio::time::error::Elapsed> for DialError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        DialError::Timeout
    }
}

/// Returns the host portion of a `host:port` authority.
fn authority_host(authority: &str) -> &str {
    if let Some(rest) = authority.strip_prefix('[')
        && let Some((host, _)) = rest.split_once(']')
    {
        return host;
    }
    match authority.rsplit_once(':') {
        // a colon left in the host means the whole thing was a bare IPv6 literal
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => host,
        _ => authority,
    }
}

/// True when the authority names only loopback.
pub fn is_loopback(authority: &str) -> bool {
    matches!(authority_host(authority), "localhost" | "127.0.0.1" | "::1")
}

/// Opens upstream connections, directly or through the forward proxy.
#[derive(Clone)]
pub struct Dialer {
    proxy: String,
    force_ipv4: bool,
}

impl Dialer {
    pub fn from_config(config: &Config) -> Self {
        Self {
            proxy: config.proxy.clone(),
            force_ipv4: config.forceipv4,
        }
    }

    /// Dials `authority`, honouring the loopback guard, the IPv4
    /// restriction and the forward proxy. Catch-all destinations are always
    /// dialed directly and may target loopback.
    pub async fn connect(
        &self,
        id: &str,
        authority: &str,
        is_catchall: bool,
        deadline: Instant,
    ) -> Result<TcpStream, DialError> {
        if is_loopback(authority) && !is_catchall {
            return Err(DialError::NoLoopback);
        }
        if self.proxy.is_empty() || is_catchall {
            if is_catchall {
                debug!(id, authority, "direct connection forced");
            }
            return self.connect_direct(authority, deadline).await;
        }
        debug!(id, authority, proxy = %self.proxy, "dialing via forward proxy");
        self.connect_via_proxy(authority, deadline).await
    }

    async fn connect_direct(
        &self,
        authority: &str,
        deadline: Instant,
    ) -> Result<TcpStream, DialError> {
        let addrs = timeout_at(deadline, lookup_host(authority)).await??;
        let addr = self
            .pick_addr(addrs)
            .ok_or(DialError::NoAddress)?;
        let stream = timeout_at(deadline, TcpStream::connect(addr)).await??;
        Ok(stream)
    }

    fn pick_addr(&self, mut addrs: impl Iterator<Item = SocketAddr>) -> Option<SocketAddr> {
        if self.force_ipv4 {
            addrs.find(|a| a.is_ipv4())
        } else {
            addrs.next()
        }
    }

    async fn connect_via_proxy(
        &self,
        authority: &str,
        deadline: Instant,
    ) -> Result<TcpStream, DialError> {
        let url = Url::parse(&self.proxy).map_err(DialError::ProxyUrl)?;
        let host = url
            .host_str()
            .ok_or_else(|| DialError::Proxy("proxy URL has no host".to_string()))?;
        let port = url.port_or_known_default().unwrap_or(3128);

        let addrs = timeout_at(deadline, lookup_host((host, port))).await??;
        let addr = self.pick_addr(addrs).ok_or(DialError::NoAddress)?;
        let mut stream = timeout_at(deadline, TcpStream::connect(addr)).await??;

        let request = format!(
            "CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\nProxy-Connection: Keep-Alive\r\n\r\n"
        );
        timeout_at(deadline, stream.write_all(request.as_bytes())).await??;

        // Read the proxy response one byte at a time up to the blank line so
        // no tunneled byte is consumed by accident.
        let mut response = Vec::with_capacity(128);
        let mut byte = [0u8; 1];
        loop {
            let n = timeout_at(deadline, stream.read(&mut byte)).await??;
            if n == 0 {
                return Err(DialError::Proxy(
                    "proxy closed connection during CONNECT".to_string(),
                ));
            }
            response.push(byte[0]);
            if response.ends_with(b"\r\n\r\n") {
                break;
            }
            if response.len() > MAX_PROXY_RESPONSE {
                return Err(DialError::Proxy("oversized CONNECT response".to_string()));
            }
        }

        let status = proxy_status(&response)
            .ok_or_else(|| DialError::Proxy("malformed CONNECT response".to_string()))?;
        if !(200..300).contains(&status) {
            return Err(DialError::Proxy(format!(
                "proxy answered status {status}"
            )));
        }
        Ok(stream)
    }
}

/// Parses the status code out of an HTTP/1.x response head.
fn proxy_status(response: &[u8]) -> Option<u16> {
    let head = std::str::from_utf8(response).ok()?;
    let line = head.lines().next()?;
    let mut parts = line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn dialer(proxy: &str, force_ipv4: bool) -> Dialer {
        Dialer {
            proxy: proxy.to_string(),
            force_ipv4,
        }
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[test]
    fn test_is_loopback() {
        assert!(is_loopback("localhost:443"));
        assert!(is_loopback("127.0.0.1:80"));
        assert!(is_loopback("[::1]:443"));
        assert!(is_loopback("::1"));
        assert!(is_loopback("localhost"));
        assert!(!is_loopback("example.com:443"));
        assert!(!is_loopback("10.0.0.1:443"));
    }

    #[test]
    fn test_proxy_status() {
        assert_eq!(
            proxy_status(b"HTTP/1.1 200 Connection established\r\n\r\n"),
            Some(200)
        );
        assert_eq!(proxy_status(b"HTTP/1.0 407 Auth Required\r\n\r\n"), Some(407));
        assert_eq!(proxy_status(b"garbage\r\n\r\n"), None);
    }

    #[tokio::test]
    async fn test_loopback_guard_blocks_allowed_routes() {
        let err = dialer("", false)
            .connect("t", "localhost:9", false, deadline())
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::NoLoopback));
    }

    #[tokio::test]
    async fn test_loopback_allowed_for_catchall() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let authority = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());

        let stream = dialer("", false)
            .connect("t", &authority, true, deadline())
            .await
            .unwrap();
        drop(stream);
        listener.accept().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_tunnel_through_proxy() {
        // Mock forward proxy: expect a CONNECT for the authority, answer
        // 200, then echo one payload frame through the "tunnel".
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_url = format!("http://127.0.0.1:{}", listener.local_addr().unwrap().port());

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut byte = [0u8; 1];
            loop {
                socket.read_exact(&mut byte).await.unwrap();
                request.push(byte[0]);
                if request.ends_with(b"\r\n\r\n") {
                    break;
                }
            }
            let head = String::from_utf8(request).unwrap();
            assert!(head.starts_with("CONNECT x.example.com:8443 HTTP/1.1\r\n"));
            socket
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();

            let mut payload = [0u8; 4];
            socket.read_exact(&mut payload).await.unwrap();
            socket.write_all(&payload).await.unwrap();
        });

        let mut stream = dialer(&proxy_url, false)
            .connect("t", "x.example.com:8443", false, deadline())
            .await
            .unwrap();

        stream.write_all(b"ping").await.unwrap();
        let mut echo = [0u8; 4];
        stream.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"ping");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_tunnel_rejected_by_proxy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_url = format!("http://127.0.0.1:{}", listener.local_addr().unwrap().port());

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut sink = vec![0u8; 1024];
            let _ = socket.read(&mut sink).await;
            let _ = socket
                .write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n")
                .await;
        });

        let err = dialer(&proxy_url, false)
            .connect("t", "x.example.com:8443", false, deadline())
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::Proxy(_)));
    }

    #[tokio::test]
    async fn test_catchall_bypasses_proxy() {
        // With a proxy configured but an unreachable one, a catch-all dial
        // must still go direct.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let authority = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());

        let stream = dialer("http://proxy.invalid:3128", false)
            .connect("t", &authority, true, deadline())
            .await
            .unwrap();
        drop(stream);
        listener.accept().await.unwrap();
    }
}
