//! HTTP frontend of the InfluxDB router
//!
//! [`serve`] accepts connections on a single listener, plaintext or TLS with optional client
//! certificate verification, and routes every request through the access log middleware into
//! the [`HttpApi`].

mod access_log;
pub mod http;
mod remote_addr_layer;

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ::http::HeaderName;
use hyper::Request;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnectionBuilder;
use hyper_util::server::graceful::GracefulShutdown;
use hyper_util::service::TowerToHyperService;
use observability_deps::tracing::{debug, info, trace, warn};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

pub use crate::access_log::CorrelationId;
pub use crate::http::HttpApi;
pub use crate::remote_addr_layer::RemoteAddr;

use crate::access_log::AccessLogLayer;
use crate::http::route_request;
use crate::remote_addr_layer::RemoteAddrLayer;

/// Pause after a failed `accept`, e.g. while the process is out of file descriptors
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot read {what} from {path}: {source}")]
    ReadPem {
        what: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("tls config error: {0}")]
    TlsConfig(String),

    #[error("rustls error: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("client certificate verifier error: {0}")]
    ClientVerifier(#[from] rustls::server::VerifierBuilderError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// TLS material for the listener
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    /// CA bundle used to verify client certificates
    pub ca_file: Option<PathBuf>,
    /// Require clients to present a certificate signed by `ca_file`
    pub client_cert_auth: bool,
}

pub struct Server {
    http: Arc<HttpApi>,
    listener: TcpListener,
    tls_acceptor: Option<TlsAcceptor>,
    access_log: AccessLogLayer,
    drain_timeout: Duration,
}

pub struct CreateServerArgs {
    pub http: Arc<HttpApi>,
    pub listener: TcpListener,
    pub tls_acceptor: Option<TlsAcceptor>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("http", &self.http)
            .field("listener", &self.listener)
            .field("tls", &self.tls_acceptor.is_some())
            .field("drain_timeout", &self.drain_timeout)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for CreateServerArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreateServerArgs")
            .field("http", &self.http)
            .field("listener", &self.listener)
            .field("tls", &self.tls_acceptor.is_some())
            .finish()
    }
}

impl Server {
    pub fn new(
        CreateServerArgs {
            http,
            listener,
            tls_acceptor,
        }: CreateServerArgs,
    ) -> Self {
        let access_log = AccessLogLayer::new(HeaderName::clone(http.api_key_header()));
        Self {
            http,
            listener,
            tls_acceptor,
            access_log,
            drain_timeout: Duration::ZERO,
        }
    }

    /// Let open connections finish their in-flight request for up to `drain_timeout` once
    /// the listener stops. Connections still open afterwards are dropped.
    ///
    /// Defaults to zero: connections are dropped as soon as shutdown is requested.
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

/// Accept connections until `shutdown` is cancelled, then drop the open connections
///
/// A failed `accept` is logged and retried, only cancellation ends the loop.
pub async fn serve(
    server: Server,
    shutdown: CancellationToken,
    startup_timer: Instant,
    tcp_listener_file_path: Option<PathBuf>,
) -> Result<()> {
    let Server {
        http,
        listener,
        tls_acceptor,
        access_log,
        drain_timeout,
    } = server;
    let addr = listener.local_addr()?;

    let startup_time = Instant::now().duration_since(startup_timer);
    info!(
        address = %addr,
        tls = tls_acceptor.is_some(),
        "startup time: {}ms",
        startup_time.as_millis()
    );

    write_address_to_file(tcp_listener_file_path, &addr).await?;

    let graceful = GracefulShutdown::new();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            res = listener.accept() => {
                let (stream, remote_addr) = match res {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => continue,
                        }
                    }
                };
                if let Err(e) = stream.set_nodelay(true) {
                    warn!(err = %e, "cannot set TCP_NODELAY on the incoming socket");
                }
                let http = Arc::clone(&http);
                let service = tower::ServiceBuilder::new()
                    .layer(RemoteAddrLayer::new(remote_addr))
                    .layer(access_log.clone())
                    .service(tower::service_fn(move |req: Request<Incoming>| {
                        route_request(Arc::clone(&http), req)
                    }));
                let service = TowerToHyperService::new(service);
                let tls_acceptor = tls_acceptor.clone();
                let graceful_watcher = graceful.watcher();

                connections.spawn(async move {
                    match tls_acceptor {
                        Some(tls_acceptor) => {
                            let tls_stream = match tls_acceptor.accept(stream).await {
                                Ok(stream) => stream,
                                Err(e) => {
                                    debug!(%remote_addr, "TLS handshake failed: {}", e);
                                    return;
                                }
                            };
                            serve_connection(tls_stream, service, graceful_watcher).await
                        }
                        None => serve_connection(stream, service, graceful_watcher).await,
                    }
                });
            }
        }
    }
    drop(listener);

    if !drain_timeout.is_zero() && !connections.is_empty() {
        trace!("Starting graceful shutdown, waiting for connections to close");
        tokio::select! {
            _ = graceful.shutdown() => {
                info!("All connections closed gracefully");
            }
            _ = tokio::time::sleep(drain_timeout) => {
                info!("Graceful shutdown timed out after {:?}", drain_timeout);
            }
        }
    }

    let open = connections.len();
    connections.shutdown().await;
    if open > 0 {
        debug!(open, "dropped open connections");
    }

    Ok(())
}

async fn serve_connection<I, S>(
    io: I,
    service: TowerToHyperService<S>,
    graceful_watcher: hyper_util::server::graceful::Watcher,
) where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: tower::Service<Request<Incoming>, Response = http::Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let conn = ConnectionBuilder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(io), service)
        .into_owned();
    let conn = graceful_watcher.watch(conn);

    // a failed body read ends up here too, the client gets no response
    if let Err(e) = conn.await {
        debug!("Error serving connection: {:?}", e);
    }
}

/// Load certificates and key and build the acceptor for the listener
///
/// Every failure is fatal: a listener configured for TLS never falls back to plaintext.
pub fn build_tls_acceptor(config: &TlsConfig) -> Result<TlsAcceptor> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let certs = load_certs(&config.cert_file, "certificates")?;
    let key = load_private_key(&config.key_file)?;
    let client_roots = config
        .ca_file
        .as_deref()
        .map(load_client_roots)
        .transpose()?;

    let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?;
    let builder = match (config.client_cert_auth, client_roots) {
        (true, Some(roots)) => {
            let verifier = client_verifier(roots, provider)?;
            builder.with_client_cert_verifier(verifier)
        }
        (true, None) => {
            return Err(Error::TlsConfig(
                "client certificate auth requires a CA bundle".to_string(),
            ));
        }
        (false, _) => builder.with_no_client_auth(),
    };

    let mut tls_config = builder.with_single_cert(certs, key)?;
    tls_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

fn client_verifier(
    roots: RootCertStore,
    provider: Arc<CryptoProvider>,
) -> Result<Arc<dyn rustls::server::danger::ClientCertVerifier>> {
    Ok(WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider).build()?)
}

fn load_client_roots(ca_file: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_file, "CA certificates")? {
        roots.add(cert)?;
    }
    Ok(roots)
}

fn load_certs(path: &Path, what: &'static str) -> Result<Vec<CertificateDer<'static>>> {
    let read_err = |source| Error::ReadPem {
        what,
        path: path.to_path_buf(),
        source,
    };
    let mut buf_reader = BufReader::new(File::open(path).map_err(read_err)?);
    let certs = rustls_pemfile::certs(&mut buf_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(read_err)?;
    if certs.is_empty() {
        return Err(Error::TlsConfig(format!(
            "no {what} found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let read_err = |source| Error::ReadPem {
        what: "private key",
        path: path.to_path_buf(),
        source,
    };
    let mut buf_reader = BufReader::new(File::open(path).map_err(read_err)?);
    rustls_pemfile::private_key(&mut buf_reader)
        .map_err(read_err)?
        .ok_or_else(|| Error::TlsConfig(format!("no private key found in {}", path.display())))
}

// Lets tests that bind port 0 discover the address the listener ended up on.
async fn write_address_to_file(
    tcp_listener_file_path: Option<PathBuf>,
    addr: &std::net::SocketAddr,
) -> Result<(), Error> {
    if let Some(path) = tcp_listener_file_path {
        let mut f = tokio::fs::File::create_new(path).await?;
        let _ = f.write(addr.to_string().as_bytes()).await?;
        f.flush().await?;
    };
    Ok(())
}
