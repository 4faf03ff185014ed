use std::{sync::Arc, time::Duration};

use influxdb_router_types::IncomingQueue;
use observability_deps::tracing::debug;
use tokio_util::sync::CancellationToken;

use crate::{METRIC_PREFIX, StatsSink};

/// Report the depth of the incoming queue every `interval` until `shutdown` is cancelled
///
/// Missed ticks are skipped, it is ok to lose a few samples.
pub fn export_queue_metrics_in_background(
    sink: Arc<dyn StatsSink>,
    queue: IncomingQueue,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => export_queue_metrics(sink.as_ref(), &queue),
            }
        }
        debug!("queue metrics exporter stopped");
    })
}

fn export_queue_metrics(sink: &dyn StatsSink, queue: &IncomingQueue) {
    sink.gauge(
        &format!("{METRIC_PREFIX}.incoming_queue.length"),
        queue.len() as u64,
    );
    sink.gauge(
        &format!("{METRIC_PREFIX}.incoming_queue.capacity"),
        queue.capacity() as u64,
    );
}
