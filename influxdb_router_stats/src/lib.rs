//! Metrics emitted by the router
//!
//! Request handlers report per-tenant counters through a [`StatsSink`]. Implementations must
//! never block the caller and must swallow delivery failures: metrics are best effort and the
//! availability of the metrics backend must not affect request handling.
use std::fmt::Debug;

use influxdb_router_types::Tenant;

pub mod mock;
mod sender;
mod statsd;

pub use sender::export_queue_metrics_in_background;
pub use statsd::{StatsError, StatsdClient};

/// Prefix of every metric name sent by the router
pub const METRIC_PREFIX: &str = "influx_router";

/// Counter of accepted write requests per tenant
pub const HITS: &str = "hits";

/// Counter of compressed write payload bytes per tenant
pub const BATCH_SIZE_BYTES: &str = "batch-size-bytes";

/// Destination for fire-and-forget metric observations
pub trait StatsSink: Debug + Send + Sync + 'static {
    /// Add `value` to the counter `metric`
    fn incr_counter(&self, metric: &str, value: u64);

    /// Set the gauge `metric` to `value`
    fn gauge(&self, metric: &str, value: u64);
}

/// Full metric name for a per-tenant observation, e.g. `influx_router.acme_corp.hits`
pub fn tenant_metric(tenant: &Tenant, name: &str) -> String {
    format!("{METRIC_PREFIX}.{}.{name}", tenant.metric_tag())
}

/// A [`StatsSink`] that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStats;

impl StatsSink for NoopStats {
    fn incr_counter(&self, _metric: &str, _value: u64) {}

    fn gauge(&self, _metric: &str, _value: u64) {}
}
