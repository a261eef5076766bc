// src/metrics.rs
use anyhow::{Context, Result};
use metrics::{describe_counter, describe_histogram, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::OnceCell;
use std::net::SocketAddr;

/// Describe every metric once per process.
pub fn ensure_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("feedgate_fetch_total", "Feed fetch attempts by outcome.");
        describe_counter!("feedgate_fetch_items_total", "Valid items parsed from feeds.");
        describe_counter!("feedgate_fetch_body_bytes_total", "Feed response bytes received.");
        describe_histogram!("feedgate_fetch_ms", "Feed fetch time in milliseconds.");
        describe_counter!("feedgate_items_new_total", "Items stored for the first time.");
        describe_counter!(
            "feedgate_items_duplicate_total",
            "Items dropped by the exact content-hash tier."
        );
        describe_counter!("feedgate_items_save_failed_total", "Item saves that failed.");
        describe_counter!("feedgate_ai_attempts_total", "AI calls by kind.");
        describe_counter!("feedgate_ai_success_total", "Items analyzed successfully.");
        describe_counter!("feedgate_ai_failed_total", "Items whose AI answers stayed unusable.");
        describe_counter!("feedgate_dedup_total", "Dedup decisions by result.");
        describe_counter!("feedgate_published_total", "Items published, by sink.");
        describe_counter!("feedgate_publish_skipped_total", "Publish candidates skipped.");
        describe_counter!("feedgate_publish_failed_total", "Sink failures, by sink.");
        describe_counter!("feedgate_runs_total", "Completed pipeline runs.");
    });
}

/// Install the Prometheus recorder with its own HTTP listener on `addr`.
pub fn install_prometheus(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("prometheus: install recorder")?;
    ensure_described();
    gauge!("feedgate_build_info", "version" => env!("CARGO_PKG_VERSION")).set(1.0);
    Ok(())
}
