//! The forwarding stage of the router
//!
//! A single [`Forwarder`] task consumes batches from the incoming queue in the order they were
//! accepted and posts each one, still gzip-compressed, to the write endpoint of the backend
//! InfluxDB. Before it starts consuming it makes sure the backend answers on `/ping` and then
//! reports readiness through the startup handshake, so the HTTP frontend never opens before
//! there is somebody to drain the queue.
//!
//! Delivery is best effort: a batch the backend refuses is logged and dropped, and so are the
//! in-flight batch and whatever is still queued when shutdown is requested.
use std::{sync::Arc, time::Duration};

use influxdb_router_types::{
    Batch, QueueConsumer, ReadySignal, TenantRegistry, mask, tenant::DEFAULT_MASK_LEN,
};
use observability_deps::tracing::{debug, info, warn};
use reqwest::{
    RequestBuilder, StatusCode, Url,
    header::{AUTHORIZATION, CONTENT_ENCODING},
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Header carrying the correlation id of the originating request to the backend
pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot build http client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("invalid backend url {url}: {source}")]
    InvalidUrl {
        url: Url,
        source: url::ParseError,
    },

    #[error("no tenant for api key {0}")]
    UnknownTenant(String),

    #[error("error sending batch to backend: {0}")]
    Send(#[source] reqwest::Error),

    #[error("backend rejected batch with status {status}: {body}")]
    Rejected { status: StatusCode, body: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Credentials presented to the backend on `/ping` and `/write`
#[derive(Clone, PartialEq, Eq)]
pub enum BackendAuth {
    /// Sent as `Authorization: Token <token>`
    Token(String),
    /// Sent as HTTP basic auth
    Basic { username: String, password: String },
}

impl std::fmt::Debug for BackendAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Token(_) => f.debug_tuple("Token").field(&"<redacted>").finish(),
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

impl BackendAuth {
    fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            Self::Token(token) => request.header(AUTHORIZATION, format!("Token {token}")),
            Self::Basic { username, password } => request.basic_auth(username, Some(password)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Base url of the backend, batches are discarded when not set
    pub backend_url: Option<Url>,
    /// Timeout of a single request to the backend
    pub request_timeout: Duration,
    /// Delay between `/ping` attempts while waiting for the backend at startup
    pub ping_interval: Duration,
    /// Credentials for the backend, requests are anonymous when not set
    pub auth: Option<BackendAuth>,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            backend_url: None,
            request_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(1),
            auth: None,
        }
    }
}

#[derive(Debug)]
struct Backend {
    write_url: Url,
    ping_url: Url,
}

#[derive(Debug)]
pub struct Forwarder {
    client: reqwest::Client,
    backend: Option<Backend>,
    tenants: Arc<TenantRegistry>,
    ping_interval: Duration,
    auth: Option<BackendAuth>,
}

impl Forwarder {
    pub fn new(config: ForwarderConfig, tenants: Arc<TenantRegistry>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(Error::Client)?;

        let backend = config
            .backend_url
            .map(|url| {
                let join = |path: &str| {
                    url.join(path).map_err(|source| Error::InvalidUrl {
                        url: url.clone(),
                        source,
                    })
                };
                Ok::<_, Error>(Backend {
                    write_url: join("./write")?,
                    ping_url: join("./ping")?,
                })
            })
            .transpose()?;

        Ok(Self {
            client,
            backend,
            tenants,
            ping_interval: config.ping_interval,
            auth: config.auth,
        })
    }

    /// Wait for the backend, signal readiness, then forward batches until `shutdown` is
    /// cancelled or every producer is gone
    ///
    /// If `shutdown` is cancelled before the backend became reachable, `ready` is dropped
    /// without notification. Cancellation also abandons a batch that is being sent. Batches
    /// still queued once the stage stops are discarded.
    pub async fn run(
        self,
        mut consumer: QueueConsumer,
        ready: ReadySignal,
        shutdown: CancellationToken,
    ) {
        if self.wait_for_backend(&shutdown).await {
            self.consume(&mut consumer, ready, &shutdown).await;
        } else {
            drop(ready);
            info!("shutdown before the backend became reachable");
        }

        consumer.close();
        let mut discarded = 0_usize;
        while consumer.try_recv().is_some() {
            discarded += 1;
        }
        if discarded > 0 {
            warn!(discarded, "forwarding stage stopped, discarding queued batches");
        }
        info!("forwarding stage stopped");
    }

    async fn consume(
        &self,
        consumer: &mut QueueConsumer,
        ready: ReadySignal,
        shutdown: &CancellationToken,
    ) {
        match &self.backend {
            Some(backend) => info!(backend = %backend.write_url, "forwarding stage ready"),
            None => info!("forwarding stage ready, no backend configured, batches are discarded"),
        }
        ready.notify();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                batch = consumer.recv() => {
                    let Some(batch) = batch else {
                        break;
                    };
                    let correlation_id = batch.correlation_id().to_string();
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            warn!(%correlation_id, "shutdown while forwarding, abandoning batch");
                            break;
                        }
                        _ = self.handle(batch) => {}
                    }
                }
            }
        }
    }

    async fn handle(&self, batch: Batch) {
        let correlation_id = batch.correlation_id().to_string();
        let bytes = batch.len();
        match self.forward(batch).await {
            Ok(()) => debug!(%correlation_id, bytes, "forwarded batch"),
            Err(error) => warn!(%error, %correlation_id, bytes, "dropping batch"),
        }
    }

    /// Post one batch to the backend write endpoint of its tenant
    pub async fn forward(&self, batch: Batch) -> Result<()> {
        let Some(backend) = &self.backend else {
            debug!(
                correlation_id = %batch.correlation_id(),
                "no backend configured, discarding batch"
            );
            return Ok(());
        };
        let tenant = self
            .tenants
            .lookup(batch.api_key())
            .ok_or_else(|| Error::UnknownTenant(mask(batch.api_key(), DEFAULT_MASK_LEN)))?;

        let mut url = backend.write_url.clone();
        url.query_pairs_mut().append_pair("db", tenant.name());

        let response = self
            .authorize(self.client.post(url))
            .header(CONTENT_ENCODING, "gzip")
            .header(REQUEST_ID_HEADER, batch.correlation_id())
            .body(batch.body().clone())
            .send()
            .await
            .map_err(Error::Send)?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Error::Rejected { status, body })
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            Some(auth) => auth.apply(request),
            None => request,
        }
    }

    /// Poll the backend until it answers `/ping`, `false` if shutdown happened first
    async fn wait_for_backend(&self, shutdown: &CancellationToken) -> bool {
        let Some(backend) = &self.backend else {
            return true;
        };
        loop {
            let ping = self.authorize(self.client.get(backend.ping_url.clone()));
            match ping.send().await {
                Ok(response) if response.status().is_success() => return true,
                Ok(response) => warn!(
                    status = %response.status(),
                    backend = %backend.ping_url,
                    "backend not ready"
                ),
                Err(error) => warn!(%error, backend = %backend.ping_url, "backend not reachable"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = tokio::time::sleep(self.ping_interval) => {}
            }
        }
    }
}
