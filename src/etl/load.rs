//! Load phase: write transform output through the sink in batches.
//!
//! A batch the sink rejects is written to a local snapshot instead and the
//! load carries on. Attack events go through the attack log one at a time;
//! a failure is counted and the remaining events are still loaded.

use std::net::IpAddr;

use log::{info, warn};
use metrics::counter;
use serde::Serialize;
use serde_json::Value;

use crate::core::AttackEvent;
use crate::etl::transform::{IpStatistics, TransformOutput};
use crate::metrics as m;
use crate::storage::{AttackLog, LocalSnapshot, RecordSink};

pub const PACKETS_COLLECTION: &str = "packets";
pub const CONNECTIONS_COLLECTION: &str = "connections";
pub const IP_STATISTICS_COLLECTION: &str = "ip_statistics";

/// Outcome of the load phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadStats {
    pub packets_loaded: u64,
    pub connections_loaded: u64,
    pub statistics_loaded: u64,
    pub attacks_loaded: u64,
    /// Batches written to the local fallback instead of the sink
    pub fallback_batches: u64,
    pub errors: u64,
}

#[derive(Serialize)]
struct IpStatisticsRow<'a> {
    ip: IpAddr,
    #[serde(flatten)]
    stats: &'a IpStatistics,
}

/// Where loaded data goes
pub struct LoadTargets<'a> {
    pub sink: &'a dyn RecordSink,
    pub attack_log: &'a dyn AttackLog,
    pub fallback: &'a LocalSnapshot,
}

/// Load `output` in batches of `batch_size` records
pub async fn load(targets: &LoadTargets<'_>, output: &TransformOutput, batch_size: usize) -> LoadStats {
    let batch_size = batch_size.max(1);
    let mut stats = LoadStats::default();

    let packets = to_rows(&output.packets, &mut stats);
    stats.packets_loaded = load_collection(targets, PACKETS_COLLECTION, &packets, batch_size, &mut stats).await;

    let connections = to_rows(&output.connections, &mut stats);
    stats.connections_loaded =
        load_collection(targets, CONNECTIONS_COLLECTION, &connections, batch_size, &mut stats).await;

    let rows: Vec<IpStatisticsRow<'_>> = output
        .ip_statistics
        .iter()
        .map(|(ip, stats)| IpStatisticsRow { ip: *ip, stats })
        .collect();
    let statistics = to_rows(&rows, &mut stats);
    stats.statistics_loaded =
        load_collection(targets, IP_STATISTICS_COLLECTION, &statistics, batch_size, &mut stats).await;

    stats.attacks_loaded = load_attacks(targets.attack_log, &output.attacks, &mut stats).await;

    info!(
        "[LOAD] {} packets, {} connections, {} statistics, {} attacks loaded; {} fallback batches, {} errors",
        stats.packets_loaded,
        stats.connections_loaded,
        stats.statistics_loaded,
        stats.attacks_loaded,
        stats.fallback_batches,
        stats.errors
    );
    stats
}

fn to_rows<T: Serialize>(items: &[T], stats: &mut LoadStats) -> Vec<Value> {
    let mut rows = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::to_value(item) {
            Ok(row) => rows.push(row),
            Err(e) => {
                warn!("[LOAD] Dropping unserializable record: {}", e);
                stats.errors += 1;
            }
        }
    }
    rows
}

/// Returns the number of records that reached the sink or the fallback
async fn load_collection(
    targets: &LoadTargets<'_>,
    collection: &str,
    rows: &[Value],
    batch_size: usize,
    stats: &mut LoadStats,
) -> u64 {
    let mut loaded = 0;
    for (number, batch) in rows.chunks(batch_size).enumerate() {
        match targets.sink.insert_batch(collection, batch).await {
            Ok(()) => {
                loaded += batch.len() as u64;
            }
            Err(e) => {
                warn!(
                    "[LOAD] Batch {} of {} failed ({}); writing local snapshot",
                    number + 1,
                    collection,
                    e
                );
                match targets.fallback.write_snapshot(collection, batch).await {
                    Ok(_) => {
                        stats.fallback_batches += 1;
                        counter!(m::ETL_FALLBACK_BATCHES_TOTAL, 1);
                        loaded += batch.len() as u64;
                    }
                    Err(e) => {
                        warn!("[LOAD] Fallback for {} batch {} failed: {}", collection, number + 1, e);
                        stats.errors += 1;
                    }
                }
            }
        }
    }
    loaded
}

async fn load_attacks(log: &dyn AttackLog, attacks: &[AttackEvent], stats: &mut LoadStats) -> u64 {
    let mut loaded = 0;
    for event in attacks {
        match log.log_attack(event).await {
            Ok(()) => loaded += 1,
            Err(e) => {
                warn!(
                    "[LOAD] Failed to log {} from {}: {}",
                    event.attack_type, event.source, e
                );
                stats.errors += 1;
            }
        }
    }
    loaded
}
