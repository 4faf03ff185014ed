use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use cadence::prelude::*;
use cadence::{MetricError, NopMetricSink, UdpMetricSink};
use observability_deps::tracing::{debug, info};
use thiserror::Error;

use crate::StatsSink;

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("cannot resolve statsd server address {addr}: {source}")]
    Resolve { addr: String, source: io::Error },

    #[error("found no addresses for statsd server {0}")]
    NoAddress(String),

    #[error("cannot open a socket for statsd server {addr}: {source}")]
    Socket { addr: SocketAddr, source: io::Error },

    #[error("cannot set up statsd sink for {addr}: {source}")]
    Sink { addr: SocketAddr, source: MetricError },
}

/// Sends statsd lines over UDP
///
/// The socket is non-blocking and send errors are only logged at debug level, so a missing or
/// overloaded statsd daemon never slows down the caller.
#[derive(Debug)]
pub struct StatsdClient {
    client: cadence::StatsdClient,
    connected: bool,
}

impl StatsdClient {
    /// Resolve `addr` (`host:port`) and point a UDP sink at it
    pub async fn connect(addr: &str) -> Result<Self, StatsError> {
        let target = tokio::net::lookup_host(addr)
            .await
            .map_err(|source| StatsError::Resolve {
                addr: addr.to_string(),
                source,
            })?
            .next()
            .ok_or_else(|| StatsError::NoAddress(addr.to_string()))?;

        let socket = bind_udp(target).map_err(|source| StatsError::Socket {
            addr: target,
            source,
        })?;
        let sink = UdpMetricSink::from(target, socket).map_err(|source| StatsError::Sink {
            addr: target,
            source,
        })?;
        info!(statsd_server = %target, "sending metrics to statsd");
        Ok(Self {
            // metric names arrive fully qualified
            client: cadence::StatsdClient::from_sink("", sink),
            connected: true,
        })
    }

    /// A client that silently drops every metric
    pub fn disconnected() -> Self {
        Self {
            client: cadence::StatsdClient::from_sink("", NopMetricSink),
            connected: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }
}

fn bind_udp(target: SocketAddr) -> io::Result<UdpSocket> {
    let local: SocketAddr = match target {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(local)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

impl StatsSink for StatsdClient {
    fn incr_counter(&self, metric: &str, value: u64) {
        let value = i64::try_from(value).unwrap_or(i64::MAX);
        if let Err(e) = self.client.count(metric, value) {
            debug!(error = %e, %metric, "cannot send metric to statsd");
        }
    }

    fn gauge(&self, metric: &str, value: u64) {
        if let Err(e) = self.client.gauge(metric, value) {
            debug!(error = %e, %metric, "cannot send metric to statsd");
        }
    }
}
