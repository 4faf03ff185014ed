use std::net::SocketAddr;
use std::task::{Context, Poll};

use http::Request;
use tower::{Layer, Service};

/// Peer address of the connection a request arrived on, stored in the request extensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteAddr(pub SocketAddr);

/// A middleware layer that inserts the [`RemoteAddr`] of the connection into request extensions
#[derive(Debug, Clone, Copy)]
pub(crate) struct RemoteAddrLayer {
    remote_addr: SocketAddr,
}

impl RemoteAddrLayer {
    pub(crate) fn new(remote_addr: SocketAddr) -> Self {
        Self { remote_addr }
    }
}

impl<S> Layer<S> for RemoteAddrLayer {
    type Service = RemoteAddrService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RemoteAddrService {
            inner,
            remote_addr: self.remote_addr,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RemoteAddrService<S> {
    inner: S,
    remote_addr: SocketAddr,
}

impl<S, B> Service<Request<B>> for RemoteAddrService<S>
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
        req.extensions_mut().insert(RemoteAddr(self.remote_addr));
        self.inner.call(req)
    }
}
