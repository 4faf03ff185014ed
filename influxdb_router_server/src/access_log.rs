//! Per-request correlation id and access logging

use std::task::{Context, Poll};

use http::{HeaderName, Method, Request, header::USER_AGENT};
use influxdb_router_types::{mask, tenant::DEFAULT_MASK_LEN};
use observability_deps::tracing::info;
use tower::{Layer, Service};
use uuid::Uuid;

use crate::remote_addr_layer::RemoteAddr;

pub(crate) const UNKNOWN_VAL: &str = "unknown";

/// Identifier minted for every inbound request
///
/// It is attached to the access log record, to the queued batch and, through the forwarding
/// stage, to the request sent to the backend. Ids are UUIDv7 so they sort by arrival time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().as_hyphenated().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

/// Layer that stamps each request with a [`CorrelationId`] and writes one access record
/// before handing it to the inner service
#[derive(Debug, Clone)]
pub(crate) struct AccessLogLayer {
    api_key_header: HeaderName,
}

impl AccessLogLayer {
    pub(crate) fn new(api_key_header: HeaderName) -> Self {
        Self { api_key_header }
    }
}

impl<S> Layer<S> for AccessLogLayer {
    type Service = AccessLogService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AccessLogService {
            inner,
            api_key_header: self.api_key_header.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct AccessLogService<S> {
    inner: S,
    api_key_header: HeaderName,
}

impl<S, B> Service<Request<B>> for AccessLogService<S>
where
    S: Service<Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        let correlation_id = CorrelationId::new();
        log_request(&req, &self.api_key_header, &correlation_id);
        req.extensions_mut().insert(correlation_id);
        self.inner.call(req)
    }
}

fn log_request<B>(req: &Request<B>, api_key_header: &HeaderName, correlation_id: &CorrelationId) {
    // write uris may carry credentials in the query string
    let uri = if req.method() == Method::POST {
        String::new()
    } else {
        req.uri().to_string()
    };
    let api_key = req
        .headers()
        .get(api_key_header)
        .and_then(|v| v.to_str().ok())
        .map(|key| mask(key, DEFAULT_MASK_LEN))
        .unwrap_or_default();
    let user_agent = req
        .headers()
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    info!(
        correlation_id = %correlation_id.as_str(),
        client = %remote_host(req),
        method = %req.method(),
        %uri,
        %api_key,
        proto = ?req.version(),
        %user_agent,
        "request"
    );
}

/// Host part of the peer address, `unknown` when the connection did not record one
pub(crate) fn remote_host<B>(req: &Request<B>) -> String {
    req.extensions()
        .get::<RemoteAddr>()
        .map(|RemoteAddr(addr)| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_VAL.to_string())
}
