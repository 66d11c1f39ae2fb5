//! Metric names and the optional Prometheus exporter.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use log::info;
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::models::MetricsConfig;

pub const PACKETS_ANALYZED_TOTAL: &str = "flood_packets_analyzed_total";
pub const PACKETS_SKIPPED_TOTAL: &str = "flood_packets_skipped_total";
pub const ATTACKS_DETECTED_TOTAL: &str = "flood_attacks_detected_total";
pub const SOURCES_BLOCKED_TOTAL: &str = "flood_sources_blocked_total";
pub const ATTACK_LOG_FAILURES_TOTAL: &str = "flood_attack_log_failures_total";
pub const CAPTURE_PACKETS_TOTAL: &str = "flood_capture_packets_total";
pub const ETL_RUNS_TOTAL: &str = "flood_etl_runs_total";
pub const ETL_FALLBACK_BATCHES_TOTAL: &str = "flood_etl_fallback_batches_total";
pub const BLOCKED_SOURCES: &str = "flood_blocked_sources";

/// Register metric descriptions and, if enabled, start the Prometheus listener
pub fn install(config: &MetricsConfig) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }

    let addr: SocketAddr = config
        .listen
        .parse()
        .with_context(|| format!("invalid metrics listen address {}", config.listen))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus exporter")?;

    describe_counter!(PACKETS_ANALYZED_TOTAL, "Packets processed by the traffic analyzer");
    describe_counter!(PACKETS_SKIPPED_TOTAL, "Packets skipped as undecodable or address-less");
    describe_counter!(ATTACKS_DETECTED_TOTAL, "Attack events emitted");
    describe_counter!(SOURCES_BLOCKED_TOTAL, "Block operations triggered by detections");
    describe_counter!(ATTACK_LOG_FAILURES_TOTAL, "Attack events the log rejected");
    describe_counter!(CAPTURE_PACKETS_TOTAL, "Frames read by live capture sessions");
    describe_counter!(ETL_RUNS_TOTAL, "Batch aggregator runs");
    describe_counter!(ETL_FALLBACK_BATCHES_TOTAL, "Batches written to the local fallback");
    describe_gauge!(BLOCKED_SOURCES, "Currently blocked sources");

    info!("Prometheus metrics listening on {}", addr);
    Ok(())
}
