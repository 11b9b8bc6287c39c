use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use spliceproxy_config::Config;
use std::convert::Infallible;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

const DENY_BODY: &[u8] = b"Access denied.\n";

/// Starts the static catch-all responder on both catch-all authorities.
///
/// Binds and loads TLS material up front so failures are fatal at startup;
/// the accept loops then run for the life of the process.
pub async fn serve(config: Arc<Config>) -> Result<(), Box<dyn std::error::Error>> {
    let http_listener = TcpListener::bind(config.catchall.http.as_str()).await?;
    info!(authority = %config.catchall.http, "catch-all HTTP responder listening");

    let https_listener = TcpListener::bind(config.catchall.https.as_str()).await?;
    let acceptor = tls_acceptor(&config.catchall.cert, &config.catchall.key)?;
    info!(authority = %config.catchall.https, "catch-all HTTPS responder listening");

    tokio::spawn(serve_http(http_listener));
    tokio::spawn(serve_https(https_listener, acceptor));
    Ok(())
}

async fn deny(_req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let mut response = Response::new(Full::new(Bytes::from_static(DENY_BODY)));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    Ok(response)
}

async fn serve_http(listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(io, service_fn(deny))
                        .await
                    {
                        warn!(error = %e, "catch-all connection error");
                    }
                });
            }
            Err(e) => warn!(error = %e, "catch-all accept error"),
        }
    }
}

async fn serve_https(listener: TcpListener, acceptor: TlsAcceptor) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let tls = match acceptor.accept(stream).await {
                        Ok(tls) => tls,
                        Err(e) => {
                            warn!(error = %e, "catch-all TLS handshake failed");
                            return;
                        }
                    };
                    let io = TokioIo::new(tls);
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(io, service_fn(deny))
                        .await
                    {
                        warn!(error = %e, "catch-all connection error");
                    }
                });
            }
            Err(e) => warn!(error = %e, "catch-all accept error"),
        }
    }
}

fn tls_acceptor(
    cert_path: &str,
    key_path: &str,
) -> Result<TlsAcceptor, Box<dyn std::error::Error>> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
            .collect::<Result<_, _>>()?;
    let key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
            .ok_or("no private key found in key file")?;

    let mut server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
