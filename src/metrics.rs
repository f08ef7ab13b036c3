use std::net::{Ipv4Addr, SocketAddr};

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Counters emitted by the consume loop and the repository
pub const CONSUMER_COUNTERS: [&str; 8] = [
    "message_log.consumer.persisted",
    "message_log.consumer.requeued",
    "message_log.consumer.terminated",
    "message_log.consumer.decode_error",
    "message_log.consumer.persist_error",
    "message_log.consumer.ack_error",
    "message_log.consumer.receive_error",
    "message_log.records.inserted",
];

/// Persist latency buckets in milliseconds
const PERSIST_MS_BUCKETS: [f64; 10] = [1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 1000.0, 5000.0];

/// Install the Prometheus recorder and serve `/metrics` on the given port.
/// Must be called from within the tokio runtime.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full(
                "message_log.consumer.persist_ms".to_string(),
            ),
            &PERSIST_MS_BUCKETS,
        )
        .context("Failed to set buckets for message_log.consumer.persist_ms")?
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Register every consumer counter at zero so dashboards show them before
/// the first message arrives
pub fn initialize_consumer_metrics() {
    for name in CONSUMER_COUNTERS {
        metrics::counter!(name).absolute(0);
    }
}
