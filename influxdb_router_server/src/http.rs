//! HTTP API of the router: batch admission on `/write` and the load balancer probe on `/health`

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::header::{CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderName, HeaderValue, Method, Request, StatusCode};
use http_body::Body;
use http_body_util::{BodyExt, Full};
use influxdb_router_shutdown::HealthLatch;
use influxdb_router_stats::{BATCH_SIZE_BYTES, HITS, StatsSink, tenant_metric};
use influxdb_router_types::{
    Batch, EnqueueError, IncomingQueue, TenantRegistry, mask, tenant::DEFAULT_MASK_LEN,
};
use observability_deps::tracing::{debug, error, warn};
use thiserror::Error;

use crate::access_log::{CorrelationId, remote_host};

pub type Response = http::Response<Full<Bytes>>;

pub const WRITE_PATH: &str = "/write";
pub const HEALTH_PATH: &str = "/health";

/// Response header echoing the correlation id of an admitted request
pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Default name of the header carrying the tenant api key
pub const DEFAULT_API_KEY_HEADER: &str = "Service-API-Key";

/// Default limit on the size of a compressed write body
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 10 * 1024 * 1024;

const MAX_CLIENT_IP_FOR_LOGGING: usize = 128;

#[derive(Debug, Error)]
pub enum Error {
    /// The requested path has no registered handler.
    #[error("not found")]
    NoHandler,

    /// The path exists but does not accept this method.
    #[error("method {0} not allowed")]
    MethodNotAllowed(Method),

    /// The api key header is missing or names no tenant.
    #[error("invalid api key")]
    InvalidApiKey,

    /// The body is not declared as gzip.
    #[error("unacceptable content-encoding: {0:?}")]
    InvalidContentEncoding(String),

    /// The client disconnected or the body could not be read.
    #[error("client disconnected: {0}")]
    ClientHangup(Box<dyn std::error::Error + Send + Sync>),

    /// The client sent a request body that exceeds the configured maximum.
    #[error("max request size ({0} bytes) exceeded")]
    RequestSizeExceeded(usize),

    /// The forwarding stage is gone, nothing will ever drain the queue.
    #[error("incoming queue is closed")]
    QueueClosed,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Convert this error into an HTTP [`Response`]
    fn into_response(self) -> Response {
        match self {
            Self::NoHandler => text_response(StatusCode::NOT_FOUND, "Not found"),
            Self::MethodNotAllowed(_) => {
                text_response(StatusCode::METHOD_NOT_ALLOWED, self.to_string())
            }
            Self::InvalidApiKey => close_connection(text_response(
                StatusCode::UNAUTHORIZED,
                "Unauthorized",
            )),
            Self::InvalidContentEncoding(_) => close_connection(text_response(
                StatusCode::BAD_REQUEST,
                "Bad Request: Content-Encoding must be gzip",
            )),
            Self::RequestSizeExceeded(_) => {
                text_response(StatusCode::PAYLOAD_TOO_LARGE, self.to_string())
            }
            Self::QueueClosed => {
                text_response(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable")
            }
            Self::ClientHangup(_) => {
                text_response(StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
        }
    }
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn empty_response(status: StatusCode) -> Response {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

fn close_connection(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    response
}

#[derive(Debug)]
pub struct HttpApi {
    tenants: Arc<TenantRegistry>,
    queue: IncomingQueue,
    stats: Arc<dyn StatsSink>,
    health: HealthLatch,
    api_key_header: HeaderName,
    max_request_bytes: usize,
}

impl HttpApi {
    pub fn new(
        tenants: Arc<TenantRegistry>,
        queue: IncomingQueue,
        stats: Arc<dyn StatsSink>,
        health: HealthLatch,
        api_key_header: HeaderName,
        max_request_bytes: usize,
    ) -> Self {
        Self {
            tenants,
            queue,
            stats,
            health,
            api_key_header,
            max_request_bytes,
        }
    }

    pub fn api_key_header(&self) -> &HeaderName {
        &self.api_key_header
    }

    /// Admit one batch onto the incoming queue
    ///
    /// A full queue answers `200 OK` so that agents do not resend the dropped batch.
    async fn ingest<B>(&self, req: Request<B>) -> Result<Response>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let api_key = self.api_key(&req).to_string();
        let tenant = self
            .tenants
            .lookup(&api_key)
            .ok_or(Error::InvalidApiKey)?
            .clone();

        match req.headers().get(CONTENT_ENCODING) {
            Some(v) if v.as_bytes() == b"gzip" => {}
            other => {
                let encoding = other
                    .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                    .unwrap_or_default();
                return Err(Error::InvalidContentEncoding(encoding));
            }
        }

        let correlation_id = correlation_id(&req);
        let client = extract_client_ip(&req);

        let body = self.read_body(req).await?;

        self.stats.incr_counter(&tenant_metric(&tenant, HITS), 1);
        self.stats
            .incr_counter(&tenant_metric(&tenant, BATCH_SIZE_BYTES), body.len() as u64);

        let batch = Batch::new(correlation_id.clone(), body, api_key);
        let mut response = match self.queue.try_enqueue(batch) {
            Ok(()) => {
                debug!(%correlation_id, tenant = %tenant.name(), "batch queued");
                empty_response(StatusCode::NO_CONTENT)
            }
            Err(EnqueueError::Full(batch)) => {
                warn!(
                    %correlation_id,
                    %client,
                    api_key = %mask(batch.api_key(), DEFAULT_MASK_LEN),
                    "IncomingQueue Queue full. Discarding batch."
                );
                empty_response(StatusCode::OK)
            }
            Err(EnqueueError::Closed(_)) => return Err(Error::QueueClosed),
        };

        if let Ok(value) = HeaderValue::from_str(&correlation_id) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
        Ok(response)
    }

    fn health(&self) -> Response {
        if self.health.is_draining() {
            text_response(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable")
        } else {
            text_response(StatusCode::OK, "Ok")
        }
    }

    fn api_key<'a, B>(&self, req: &'a Request<B>) -> &'a str {
        req.headers()
            .get(&self.api_key_header)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
    }

    /// Read the still compressed body into memory, applying the configured size limit
    async fn read_body<B>(&self, req: Request<B>) -> Result<Bytes>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let content_length = req
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|len| len.to_str().ok())
            .and_then(|len| len.parse::<usize>().ok());
        if content_length.is_some_and(|len| len > self.max_request_bytes) {
            return Err(Error::RequestSizeExceeded(self.max_request_bytes));
        }

        let mut body = match content_length {
            Some(len) => BytesMut::with_capacity(len),
            None => BytesMut::new(),
        };
        let mut payload = std::pin::pin!(req.into_body());
        while let Some(frame) = payload.frame().await {
            let frame = frame.map_err(|e| Error::ClientHangup(e.into()))?;
            if let Some(chunk) = frame.data_ref() {
                if body.len() + chunk.len() > self.max_request_bytes {
                    return Err(Error::RequestSizeExceeded(self.max_request_bytes));
                }
                body.extend_from_slice(chunk);
            }
        }
        Ok(body.freeze())
    }
}

/// Correlation id minted by the access log layer, empty when the request carries none
fn correlation_id<B>(req: &Request<B>) -> String {
    req.extensions()
        .get::<CorrelationId>()
        .map(|id| id.as_str().to_string())
        .unwrap_or_default()
}

/// Client identity for log records: the first `x-forwarded-for` entry, else the peer host
fn extract_client_ip<B>(req: &Request<B>) -> String {
    req.headers()
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| truncate_for_logging(s, MAX_CLIENT_IP_FOR_LOGGING).to_string())
        .unwrap_or_else(|| remote_host(req))
}

fn truncate_for_logging(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        s
    } else {
        &s[..s.floor_char_boundary(max_len)]
    }
}

/// Dispatch one request
///
/// Client errors are turned into responses here. A body that cannot be read is returned as
/// an error so that the connection is aborted without a response.
pub(crate) async fn route_request<B>(http_api: Arc<HttpApi>, req: Request<B>) -> Result<Response>
where
    B: Body<Data = Bytes> + Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let client = extract_client_ip(&req);
    let api_key = mask(http_api.api_key(&req), DEFAULT_MASK_LEN);
    let correlation_id = correlation_id(&req);

    match perform_routing(&http_api, req).await {
        Ok(response) => Ok(response),
        Err(error @ Error::ClientHangup(_)) => {
            warn!(
                %error,
                %correlation_id,
                %method,
                %path,
                %client,
                %api_key,
                "error reading request body"
            );
            Err(error)
        }
        Err(error @ Error::QueueClosed) => {
            error!(
                %error,
                %correlation_id,
                %method,
                %path,
                %client,
                %api_key,
                "cannot admit batch"
            );
            Ok(error.into_response())
        }
        Err(error) => {
            warn!(
                %error,
                %correlation_id,
                %method,
                %path,
                %client,
                %api_key,
                "rejected request"
            );
            Ok(error.into_response())
        }
    }
}

async fn perform_routing<B>(http_api: &HttpApi, req: Request<B>) -> Result<Response>
where
    B: Body<Data = Bytes> + Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let method = req.method().clone();
    match (method, req.uri().path()) {
        (Method::POST, WRITE_PATH) => http_api.ingest(req).await,
        (Method::GET | Method::HEAD, HEALTH_PATH) => Ok(http_api.health()),
        (method, WRITE_PATH | HEALTH_PATH) => Err(Error::MethodNotAllowed(method)),
        _ => Err(Error::NoHandler),
    }
}
