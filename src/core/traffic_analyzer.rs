//! Streaming traffic analyzer.
//!
//! The analyzer is the only component that reads the flood detector and
//! writes the blocklist. Packets are processed one at a time, in arrival
//! order, inside an [`AnalysisRun`] that holds the per-run state: counters,
//! lifetime UDP counts and the set of (attack type, source) pairs already
//! reported, so a source is reported at most once per type per run. Each run
//! also owns a detector timeline, so windows filled by an earlier run never
//! count toward a later one.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use log::{debug, info, warn};
use metrics::counter;
use serde::Serialize;

use crate::capture::{decode_frame, read_capture_file, CaptureError, RawFrame};
use crate::core::attack::{AttackEvent, AttackType, PacketDetails, Severity};
use crate::core::blocking::BlockingManager;
use crate::core::classifier::{classify_or_fallback, AttackContext, Classifier};
use crate::core::connections::{ConnectionRecord, ConnectionTable};
use crate::core::flood_detector::{FloodDetector, FloodKind};
use crate::core::packet::{PacketRecord, Protocol};
use crate::core::{DetectionConfig, UdpFloodMode};
use crate::metrics as m;
use crate::models::AnalyzerConfig;
use crate::storage::AttackLog;

/// Source of detector timelines; 0 is left to direct `FloodDetector::observe` callers
static NEXT_TIMELINE: AtomicU64 = AtomicU64::new(1);

/// State of one analysis run
#[derive(Debug)]
pub struct AnalysisRun {
    timeline: u64,
    total: u64,
    analyzed: u64,
    skipped: u64,
    log_failures: u64,
    /// (type, source) pairs already reported during this run
    flagged: HashSet<(AttackType, IpAddr)>,
    /// UDP packets seen per source during this run (lifetime mode)
    udp_counts: HashMap<IpAddr, u64>,
    blocked_sources: Vec<IpAddr>,
    attack_type_counts: BTreeMap<String, u64>,
    events: Vec<AttackEvent>,
}

impl AnalysisRun {
    pub fn new() -> Self {
        Self {
            timeline: NEXT_TIMELINE.fetch_add(1, Ordering::Relaxed),
            total: 0,
            analyzed: 0,
            skipped: 0,
            log_failures: 0,
            flagged: HashSet::new(),
            udp_counts: HashMap::new(),
            blocked_sources: Vec::new(),
            attack_type_counts: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    /// Count an input that could not be turned into a packet record
    pub fn record_skipped(&mut self) {
        self.total += 1;
        self.skipped += 1;
        counter!(m::PACKETS_SKIPPED_TOTAL, 1);
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn events(&self) -> &[AttackEvent] {
        &self.events
    }
}

impl Default for AnalysisRun {
    fn default() -> Self {
        Self::new()
    }
}

/// Summary of one analysis run
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    /// Every input seen, including skipped ones
    pub total: u64,
    /// Inputs that produced a packet record with addresses
    pub analyzed: u64,
    /// Undecodable or address-less inputs
    pub skipped: u64,
    pub attacks_detected: u64,
    /// Sources blocked during the run, in blocking order
    pub blocked_sources: Vec<IpAddr>,
    pub connections: Vec<ConnectionRecord>,
    pub attack_type_counts: BTreeMap<String, u64>,
    /// Events the attack log failed to store
    pub log_failures: u64,
    pub events: Vec<AttackEvent>,
}

/// Streaming packet analyzer
pub struct TrafficAnalyzer {
    detector: Arc<FloodDetector>,
    blocker: Arc<BlockingManager>,
    classifier: Arc<dyn Classifier>,
    attack_log: Arc<dyn AttackLog>,
    detection: DetectionConfig,
    config: AnalyzerConfig,
    connections: Mutex<ConnectionTable>,
}

impl TrafficAnalyzer {
    /// Create a new analyzer
    pub fn new(
        detector: Arc<FloodDetector>,
        blocker: Arc<BlockingManager>,
        classifier: Arc<dyn Classifier>,
        attack_log: Arc<dyn AttackLog>,
        detection: DetectionConfig,
        config: AnalyzerConfig,
    ) -> Self {
        let connections =
            ConnectionTable::bounded(config.per_source_connection_cap, config.tracked_sources_cap);
        Self {
            detector,
            blocker,
            classifier,
            attack_log,
            detection,
            config,
            connections: Mutex::new(connections),
        }
    }

    pub fn detector(&self) -> &Arc<FloodDetector> {
        &self.detector
    }

    pub fn blocker(&self) -> &Arc<BlockingManager> {
        &self.blocker
    }

    /// Analyze a sequence of decoded packets as one run
    pub async fn analyze<I>(&self, packets: I) -> AnalysisReport
    where
        I: IntoIterator<Item = PacketRecord>,
    {
        let mut run = AnalysisRun::new();
        for packet in packets {
            self.process_packet(&mut run, &packet).await;
        }
        self.finish_run(run)
    }

    /// Decode and analyze raw frames as one run; undecodable frames are skipped
    pub async fn analyze_frames(&self, frames: Vec<RawFrame>) -> AnalysisReport {
        let mut run = AnalysisRun::new();
        for frame in &frames {
            match decode_frame(frame) {
                Ok(packet) => {
                    self.process_packet(&mut run, &packet).await;
                }
                Err(e) => {
                    debug!("Skipping frame at {}: {}", frame.timestamp, e);
                    run.record_skipped();
                }
            }
        }
        self.finish_run(run)
    }

    /// Read a capture file and analyze it as one run
    pub async fn analyze_file(&self, path: &Path) -> Result<AnalysisReport, CaptureError> {
        let owned = path.to_path_buf();
        let frames = tokio::task::spawn_blocking(move || read_capture_file(&owned))
            .await
            .map_err(|e| CaptureError::Worker(e.to_string()))??;

        info!("Analyzing {} frames from {}", frames.len(), path.display());
        Ok(self.analyze_frames(frames).await)
    }

    /// Process one packet inside `run`.
    ///
    /// Returns the attack event if this packet triggered one.
    pub async fn process_packet(
        &self,
        run: &mut AnalysisRun,
        packet: &PacketRecord,
    ) -> Option<AttackEvent> {
        run.total += 1;

        let (source, destination) = match (packet.source(), packet.destination()) {
            (Some(source), Some(destination)) => (source, destination),
            _ => {
                run.skipped += 1;
                counter!(m::PACKETS_SKIPPED_TOTAL, 1);
                return None;
            }
        };
        run.analyzed += 1;
        counter!(m::PACKETS_ANALYZED_TOTAL, 1);

        self.lock_connections().record(packet);

        if packet.is_syn_request() {
            let observation =
                self.detector
                    .observe_on(run.timeline, source, FloodKind::Syn, packet.timestamp);
            if observation.is_attack {
                return self
                    .raise(run, AttackType::SynFlood, source, destination, observation.count, packet)
                    .await;
            }
        } else if packet.protocol() == Protocol::Udp {
            let (is_attack, count) = self.check_udp(run, source, packet);
            if is_attack {
                return self
                    .raise(run, AttackType::UdpFlood, source, destination, count, packet)
                    .await;
            }
        }
        None
    }

    fn check_udp(&self, run: &mut AnalysisRun, source: IpAddr, packet: &PacketRecord) -> (bool, u64) {
        match self.detection.udp_mode {
            UdpFloodMode::Lifetime => {
                let count = run.udp_counts.entry(source).or_insert(0);
                *count += 1;
                (*count > self.detection.udp_threshold as u64, *count)
            }
            UdpFloodMode::SlidingWindow => {
                let observation =
                    self.detector
                        .observe_on(run.timeline, source, FloodKind::Udp, packet.timestamp);
                (observation.is_attack, observation.count)
            }
        }
    }

    async fn raise(
        &self,
        run: &mut AnalysisRun,
        attack_type: AttackType,
        source: IpAddr,
        destination: IpAddr,
        packet_count: u64,
        packet: &PacketRecord,
    ) -> Option<AttackEvent> {
        if run.flagged.contains(&(attack_type.clone(), source)) {
            return None;
        }
        if self.blocker.is_blocked(source, Utc::now()) {
            debug!("{} from {} ignored: source already blocked", attack_type, source);
            return None;
        }
        run.flagged.insert((attack_type.clone(), source));

        let severity = match attack_type {
            AttackType::SynFlood => Severity::High,
            _ => Severity::Medium,
        };
        let context = AttackContext {
            destination,
            protocol: packet.protocol(),
            packet_count,
            port: packet.dst_port(),
            flags: packet.tcp_flags(),
        };
        let classification =
            classify_or_fallback(self.classifier.as_ref(), &attack_type, source, &context).await;

        let event = AttackEvent::new(
            attack_type.clone(),
            source,
            destination,
            severity,
            packet_count,
            packet.timestamp,
            classification,
        )
        .with_details(PacketDetails::from(packet));

        warn!(
            "{} detected from {} to {} ({} packets)",
            attack_type, source, destination, packet_count
        );
        counter!(m::ATTACKS_DETECTED_TOTAL, 1, "attack_type" => attack_type.as_str().to_string());

        if let Err(e) = self.attack_log.log_attack(&event).await {
            warn!("Failed to log {} from {}: {}", attack_type, source, e);
            run.log_failures += 1;
            counter!(m::ATTACK_LOG_FAILURES_TOTAL, 1);
        }

        let should_block = match attack_type {
            AttackType::UdpFlood => self.config.block_udp_floods,
            _ => true,
        };
        if should_block {
            self.blocker.block(source, Utc::now());
            counter!(m::SOURCES_BLOCKED_TOTAL, 1);
            if !run.blocked_sources.contains(&source) {
                run.blocked_sources.push(source);
            }
        }

        *run
            .attack_type_counts
            .entry(attack_type.to_string())
            .or_insert(0) += 1;
        run.events.push(event.clone());
        Some(event)
    }

    /// Close a run and build its report
    pub fn finish_run(&self, run: AnalysisRun) -> AnalysisReport {
        let report = AnalysisReport {
            total: run.total,
            analyzed: run.analyzed,
            skipped: run.skipped,
            attacks_detected: run.events.len() as u64,
            blocked_sources: run.blocked_sources,
            connections: self.get_connections(),
            attack_type_counts: run.attack_type_counts,
            log_failures: run.log_failures,
            events: run.events,
        };
        info!(
            "Analysis finished: {} packets, {} analyzed, {} skipped, {} attacks",
            report.total, report.analyzed, report.skipped, report.attacks_detected
        );
        report
    }

    /// Connection records for visualization, limited to the tracked-sources cap
    pub fn get_connections(&self) -> Vec<ConnectionRecord> {
        self.lock_connections()
            .snapshot(self.config.tracked_sources_cap)
    }

    /// Drop every connection record
    pub fn clear_connections(&self) {
        self.lock_connections().clear();
        info!("Connection table cleared");
    }

    fn lock_connections(&self) -> MutexGuard<'_, ConnectionTable> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
