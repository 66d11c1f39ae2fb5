//! Core functionality for the flood detection service.
//!
//! This module contains the detection pipeline: the sliding-window flood
//! detector, the TTL blocking manager, the streaming traffic analyzer that
//! drives both, and the data model they share.

pub mod attack;
pub mod blocking;
pub mod classifier;
pub mod connections;
pub mod flood_detector;
pub mod packet;
pub mod traffic_analyzer;

use serde::{Deserialize, Serialize};

/// How the streaming analyzer counts UDP packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UdpFloodMode {
    /// Count every UDP packet from a source during one analysis run and
    /// report once the count exceeds `udp_threshold`
    Lifetime,
    /// Use the same sliding window as SYN detection, reporting once the
    /// window holds `udp_threshold` packets
    SlidingWindow,
}

/// Flood detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// SYN packets inside the window that trigger a SYN flood
    pub syn_threshold: u32,
    /// SYN window length in seconds
    pub syn_window_secs: u64,
    /// UDP threshold; its meaning depends on `udp_mode`
    pub udp_threshold: u32,
    /// UDP window length in seconds (sliding window mode only)
    pub udp_window_secs: u64,
    /// UDP counting mode
    pub udp_mode: UdpFloodMode,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            syn_threshold: 5,
            syn_window_secs: 2,
            udp_threshold: 10,
            udp_window_secs: 2,
            udp_mode: UdpFloodMode::Lifetime,
        }
    }
}

pub use attack::{AttackEvent, AttackType, Classification, Severity};
pub use blocking::{ActiveBlock, BlockEntry, BlockingManager, UnblockOutcome};
pub use classifier::{Classifier, HttpClassifier, StaticClassifier};
pub use connections::{ConnectionRecord, ConnectionTable};
pub use flood_detector::{FloodDetector, FloodKind, Observation};
pub use packet::{NetworkLayer, PacketRecord, Protocol, TcpFlags};
pub use traffic_analyzer::{AnalysisReport, AnalysisRun, TrafficAnalyzer};
