//! Entrypoint for the router server

use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use http::HeaderName;
use influxdb_router_server::{
    CreateServerArgs, HttpApi, Server, TlsConfig, build_tls_acceptor, serve,
};
use influxdb_router_shutdown::{HealthLatch, ShutdownOrchestrator, wait_for_signal};
use influxdb_router_stats::{StatsSink, StatsdClient, export_queue_metrics_in_background};
use influxdb_router_types::{
    MAX_QUEUE_CAPACITY, ReadinessError, TenantError, TenantRegistry, incoming_queue,
    readiness_handshake,
};
use influxdb_router_writer::{BackendAuth, Forwarder, ForwarderConfig};
use observability_deps::tracing::{error, info, warn};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use trogging::cli::LoggingConfig;
use url::Url;

#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error("Invalid tenant configuration: {0}")]
    Tenants(#[from] TenantError),

    #[error("Failed to load TLS material: {0}")]
    Tls(#[source] influxdb_router_server::Error),

    #[error("Failed to set up the forwarding stage: {0}")]
    Forwarder(#[from] influxdb_router_writer::Error),

    #[error("Forwarding stage did not become ready: {0}")]
    Readiness(#[from] ReadinessError),

    #[error("Failed to bind address {addr}: {source}")]
    BindAddress {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Server(#[from] influxdb_router_server::Error),

    #[error("Cannot install signal handlers: {0}")]
    Signal(#[source] std::io::Error),
}

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

/// How long shutdown waits for the forwarding stage after the listener closed
const FORWARDER_STOP_TIMEOUT: Duration = Duration::from_secs(1);

fn parse_queue_capacity(s: &str) -> Result<NonZeroUsize, String> {
    let capacity = s.parse::<NonZeroUsize>().map_err(|e| e.to_string())?;
    if capacity.get() > MAX_QUEUE_CAPACITY {
        return Err(format!("must be at most {MAX_QUEUE_CAPACITY}"));
    }
    Ok(capacity)
}

/// A `NAME=KEY` pair from `--tenant`
#[derive(Debug, Clone)]
pub(crate) struct TenantEntry {
    name: String,
    key: String,
}

impl FromStr for TenantEntry {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((name, key)) => Ok(Self {
                name: name.trim().to_string(),
                key: key.trim().to_string(),
            }),
            None => Err(format!("Invalid tenant - expected 'NAME=KEY' got '{s}'")),
        }
    }
}

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    /// logging options
    #[clap(flatten)]
    pub(crate) logging_config: LoggingConfig,

    /// The address on which the router listens
    #[clap(
        long = "listen-addr",
        env = "INFLUX_LISTEN_ADDR",
        default_value = "0.0.0.0",
        action
    )]
    pub(crate) listen_addr: IpAddr,

    /// Port of the plaintext listener, used unless `--secure` is set
    #[clap(
        long = "listen-http-port",
        env = "INFLUX_LISTEN_HTTP_PORT",
        default_value = "8090",
        action
    )]
    pub(crate) listen_http_port: u16,

    /// Port of the TLS listener, used when `--secure` is set
    #[clap(
        long = "listen-https-port",
        env = "INFLUX_LISTEN_HTTPS_PORT",
        default_value = "8443",
        action
    )]
    pub(crate) listen_https_port: u16,

    /// Number of batches the incoming queue holds before new batches are dropped
    #[clap(
        long = "incoming-queue-cap",
        env = "INFLUX_INCOMING_QUEUE_CAP",
        default_value = "500000",
        value_parser = parse_queue_capacity,
        action
    )]
    pub(crate) incoming_queue_cap: NonZeroUsize,

    /// Serve over TLS
    #[clap(long = "secure", env = "INFLUX_SECURE", default_value_t = false, action)]
    pub(crate) secure: bool,

    /// CA bundle used to verify client certificates
    #[clap(long = "ssl-ca-server-cert", env = "INFLUX_SSL_CA_SERVER_CERT", action)]
    pub(crate) ssl_ca_server_cert: Option<PathBuf>,

    /// Server certificate in PEM format
    #[clap(
        long = "ssl-server-cert",
        env = "INFLUX_SSL_SERVER_CERT",
        default_value = "./server.crt",
        action
    )]
    pub(crate) ssl_server_cert: PathBuf,

    /// Server private key in PEM format
    #[clap(
        long = "ssl-server-key",
        env = "INFLUX_SSL_SERVER_KEY",
        default_value = "./server.key",
        action
    )]
    pub(crate) ssl_server_key: PathBuf,

    /// Require clients to present a certificate signed by `--ssl-ca-server-cert`
    #[clap(
        long = "ssl-client-cert-auth",
        env = "INFLUX_SSL_CLIENT_CERT_AUTH",
        default_value_t = false,
        action
    )]
    pub(crate) ssl_client_cert_auth: bool,

    /// Name of the header carrying the tenant api key
    #[clap(
        long = "api-key-header-name",
        env = "INFLUX_API_KEY_HEADER_NAME",
        default_value = influxdb_router_server::http::DEFAULT_API_KEY_HEADER,
        action
    )]
    pub(crate) api_key_header_name: HeaderName,

    /// Seconds `/health` fails before the process exits after SIGTERM or SIGINT
    #[clap(
        long = "wait-before-shutdown",
        env = "INFLUX_WAIT_BEFORE_SHUTDOWN",
        default_value = "1",
        action
    )]
    pub(crate) wait_before_shutdown: u64,

    /// How long open connections may finish in-flight requests once the listener closed,
    /// e.g. "5s". By default they are dropped right away.
    #[clap(
        long = "shutdown-drain-timeout",
        env = "INFLUX_SHUTDOWN_DRAIN_TIMEOUT",
        default_value = "0s",
        action
    )]
    pub(crate) shutdown_drain_timeout: humantime::Duration,

    /// statsd daemon receiving the router metrics, `host:port`
    #[clap(
        long = "statsd-server",
        env = "INFLUX_STATSD_SERVER",
        default_value = "localhost:8125",
        action
    )]
    pub(crate) statsd_server: String,

    /// Seconds between two reports of the incoming queue depth
    #[clap(
        long = "stats-interval",
        env = "INFLUX_STATS_INTERVAL",
        default_value = "30",
        action
    )]
    pub(crate) stats_interval: u64,

    /// Tenants as `NAME=KEY` pairs, the name is also the backend database
    #[clap(
        long = "tenant",
        env = "INFLUX_TENANTS",
        value_delimiter = ',',
        action = clap::ArgAction::Append
    )]
    pub(crate) tenants: Vec<TenantEntry>,

    /// Base url of the InfluxDB backend, batches are discarded when not set
    #[clap(long = "backend-url", env = "INFLUX_BACKEND_URL", action)]
    pub(crate) backend_url: Option<Url>,

    /// API token sent to the backend as `Authorization: Token <token>`
    #[clap(
        long = "backend-token",
        env = "INFLUX_BACKEND_TOKEN",
        conflicts_with = "backend_username",
        hide_env_values = true,
        action
    )]
    pub(crate) backend_token: Option<String>,

    /// User name for HTTP basic auth against the backend
    #[clap(long = "backend-username", env = "INFLUX_BACKEND_USERNAME", action)]
    pub(crate) backend_username: Option<String>,

    /// Password for HTTP basic auth against the backend
    #[clap(
        long = "backend-password",
        env = "INFLUX_BACKEND_PASSWORD",
        requires = "backend_username",
        hide_env_values = true,
        action
    )]
    pub(crate) backend_password: Option<String>,

    /// Timeout of a single write to the backend, e.g. "10s"
    #[clap(
        long = "backend-timeout",
        env = "INFLUX_BACKEND_TIMEOUT",
        default_value = "10s",
        action
    )]
    pub(crate) backend_timeout: humantime::Duration,

    /// How long to wait for the backend at startup before giving up, e.g. "60s"
    #[clap(
        long = "forwarder-ready-timeout",
        env = "INFLUX_FORWARDER_READY_TIMEOUT",
        default_value = "60s",
        action
    )]
    pub(crate) forwarder_ready_timeout: humantime::Duration,

    /// Maximum size of a compressed write body in bytes
    #[clap(
        long = "max-http-request-size",
        env = "INFLUX_MAX_HTTP_REQUEST_SIZE",
        default_value = "10485760", // 10 MiB
        action
    )]
    pub(crate) max_http_request_size: usize,

    /// Write the bound address to this file once the listener is up
    #[clap(
        long = "tcp-listener-file-path",
        env = "INFLUX_TCP_LISTENER_FILE_PATH",
        hide = true,
        action
    )]
    pub(crate) tcp_listener_file_path: Option<PathBuf>,
}

impl Config {
    fn bind_addr(&self) -> SocketAddr {
        let port = if self.secure {
            self.listen_https_port
        } else {
            self.listen_http_port
        };
        SocketAddr::new(self.listen_addr, port)
    }

    fn tls_config(&self) -> Option<TlsConfig> {
        self.secure.then(|| TlsConfig {
            cert_file: self.ssl_server_cert.clone(),
            key_file: self.ssl_server_key.clone(),
            ca_file: self.ssl_ca_server_cert.clone(),
            client_cert_auth: self.ssl_client_cert_auth,
        })
    }

    fn backend_auth(&self) -> Option<BackendAuth> {
        if let Some(token) = &self.backend_token {
            return Some(BackendAuth::Token(token.clone()));
        }
        self.backend_username
            .as_ref()
            .map(|username| BackendAuth::Basic {
                username: username.clone(),
                password: self.backend_password.clone().unwrap_or_default(),
            })
    }
}

pub(crate) async fn command(config: Config) -> Result<()> {
    let startup_timer = Instant::now();
    let bind_addr = config.bind_addr();
    info!(
        %bind_addr,
        secure = config.secure,
        client_cert_auth = config.ssl_client_cert_auth,
        incoming_queue_cap = config.incoming_queue_cap.get(),
        api_key_header = %config.api_key_header_name,
        backend = config.backend_url.as_ref().map(Url::as_str).unwrap_or("none"),
        backend_auth = ?config.backend_auth(),
        "InfluxDB router starting"
    );

    let tenants = Arc::new(TenantRegistry::new(
        config.tenants.iter().map(|t| (t.name.as_str(), t.key.as_str())),
    )?);
    if tenants.is_empty() {
        warn!("no tenants configured, every write will be rejected");
    } else {
        info!(tenants = ?tenants.tenant_names(), "loaded tenants");
    }

    // fail on bad TLS material before anything else starts
    let tls_acceptor = config
        .tls_config()
        .map(|tls| build_tls_acceptor(&tls))
        .transpose()
        .map_err(Error::Tls)?;

    let stats: Arc<dyn StatsSink> = match StatsdClient::connect(&config.statsd_server).await {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!(error = %e, "cannot set up statsd client, metrics are disabled");
            Arc::new(StatsdClient::disconnected())
        }
    };

    let (queue, consumer) = incoming_queue(config.incoming_queue_cap);
    let health = HealthLatch::new();
    let frontend_shutdown = CancellationToken::new();

    let forwarder = Forwarder::new(
        ForwarderConfig {
            backend_url: config.backend_url.clone(),
            request_timeout: config.backend_timeout.into(),
            auth: config.backend_auth(),
            ..Default::default()
        },
        Arc::clone(&tenants),
    )?;
    let (ready, ready_waiter) = readiness_handshake();
    let forwarder_handle = tokio::spawn(forwarder.run(consumer, ready, frontend_shutdown.clone()));

    export_queue_metrics_in_background(
        Arc::clone(&stats),
        queue.clone(),
        Duration::from_secs(config.stats_interval),
        frontend_shutdown.clone(),
    );

    let http = Arc::new(HttpApi::new(
        tenants,
        queue,
        stats,
        health.clone(),
        config.api_key_header_name.clone(),
        config.max_http_request_size,
    ));

    let frontend = async {
        ready_waiter
            .wait(config.forwarder_ready_timeout.into())
            .await?;

        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| Error::BindAddress {
                addr: bind_addr,
                source,
            })?;
        let server = Server::new(CreateServerArgs {
            http,
            listener,
            tls_acceptor,
        })
        .with_drain_timeout(config.shutdown_drain_timeout.into());
        serve(
            server,
            frontend_shutdown.clone(),
            startup_timer,
            config.tcp_listener_file_path.clone(),
        )
        .await?;
        Ok::<_, Error>(())
    };

    let mut signal_error = None;
    let signal = async {
        if let Err(e) = wait_for_signal().await {
            signal_error = Some(e);
        }
    };
    let orchestrator = ShutdownOrchestrator::new(
        health,
        Duration::from_secs(config.wait_before_shutdown),
        frontend_shutdown.clone(),
    );

    tokio::pin!(frontend);
    let result = tokio::select! {
        res = &mut frontend => res,
        _ = orchestrator.run(signal) => match frontend.await {
            // shutdown requested before the backend came up
            Err(Error::Readiness(ReadinessError::Abandoned)) => Ok(()),
            res => res,
        },
    };

    frontend_shutdown.cancel();
    match tokio::time::timeout(FORWARDER_STOP_TIMEOUT, forwarder_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "forwarding stage did not stop cleanly"),
        Err(_) => warn!(
            timeout = ?FORWARDER_STOP_TIMEOUT,
            "forwarding stage did not stop in time, exiting anyway"
        ),
    }

    match signal_error {
        Some(e) => Err(Error::Signal(e)),
        None => result,
    }
}
