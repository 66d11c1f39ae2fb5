//! Sliding-window flood detection.
//!
//! The detector keeps, per source address and per event kind, the timestamps
//! of the events seen during the last `window` seconds and reports whether
//! the count reached the configured threshold. It never blocks anything;
//! acting on a detection is the caller's job.
//!
//! Windows are tagged with the timeline they were filled on. Packet
//! timestamps from two different captures are not comparable, so a window
//! observed on a new timeline starts empty.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::core::DetectionConfig;
use crate::utils::seconds_duration;

/// Timeline used by [`FloodDetector::observe`]
pub const DEFAULT_TIMELINE: u64 = 0;

/// Event kinds that are counted in separate windows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FloodKind {
    Syn,
    Udp,
}

/// Count/window pair for one flood kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowThreshold {
    /// Number of events inside the window that triggers detection
    pub threshold: u32,
    /// Window length
    pub window: Duration,
}

/// Result of a single observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Observation {
    pub is_attack: bool,
    /// Events inside the window, including this one
    pub count: u64,
}

#[derive(Debug, Default)]
struct Window {
    timeline: u64,
    /// Event timestamps, oldest first
    events: VecDeque<DateTime<Utc>>,
}

/// Sliding-window flood detector
pub struct FloodDetector {
    syn: WindowThreshold,
    udp: WindowThreshold,
    windows: Mutex<HashMap<(FloodKind, IpAddr), Window>>,
}

impl FloodDetector {
    /// Create a new detector from the detection configuration
    pub fn new(config: &DetectionConfig) -> Self {
        Self {
            syn: WindowThreshold {
                threshold: config.syn_threshold,
                window: seconds_duration(config.syn_window_secs),
            },
            udp: WindowThreshold {
                threshold: config.udp_threshold,
                window: seconds_duration(config.udp_window_secs),
            },
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn threshold(&self, kind: FloodKind) -> WindowThreshold {
        match kind {
            FloodKind::Syn => self.syn,
            FloodKind::Udp => self.udp,
        }
    }

    /// Record one event for `address` on the default timeline
    pub fn observe(&self, address: IpAddr, kind: FloodKind, now: DateTime<Utc>) -> Observation {
        self.observe_on(DEFAULT_TIMELINE, address, kind, now)
    }

    /// Record one event for `address` and check it against the threshold
    ///
    /// # Arguments
    ///
    /// * `timeline` - Clock the timestamp belongs to; a window filled on another timeline is discarded
    /// * `address` - Source address of the event
    /// * `kind` - Which window the event is counted in
    /// * `now` - Event time; entries older than `now - window` are discarded first
    ///
    /// # Returns
    ///
    /// The number of events in the window and whether it reached the threshold
    pub fn observe_on(
        &self,
        timeline: u64,
        address: IpAddr,
        kind: FloodKind,
        now: DateTime<Utc>,
    ) -> Observation {
        let limits = self.threshold(kind);
        let window_start = now - limits.window;

        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let window = windows.entry((kind, address)).or_default();

        // A newest entry more than a window ahead of `now` means the clock restarted.
        let restarted = window
            .events
            .back()
            .map_or(false, |newest| *newest - now > limits.window);
        if window.timeline != timeline || restarted {
            window.timeline = timeline;
            window.events.clear();
        }

        let events = &mut window.events;
        while events.front().map_or(false, |ts| *ts < window_start) {
            events.pop_front();
        }

        // Captures can deliver slightly out-of-order timestamps; keep the deque sorted.
        let position = events.partition_point(|ts| *ts <= now);
        events.insert(position, now);

        let count = events.len() as u64;
        Observation {
            is_attack: count >= limits.threshold as u64,
            count,
        }
    }

    /// Events currently counted for `address`, pruned against `now`
    pub fn current_count(&self, address: IpAddr, kind: FloodKind, now: DateTime<Utc>) -> u64 {
        let window_start = now - self.threshold(kind).window;
        let windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        windows
            .get(&(kind, address))
            .map(|window| {
                window
                    .events
                    .iter()
                    .filter(|ts| **ts >= window_start)
                    .count() as u64
            })
            .unwrap_or(0)
    }

    /// Forget all windows for an address
    pub fn reset(&self, address: IpAddr) {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        windows.retain(|(_, tracked), _| *tracked != address);
    }

    /// Drop windows whose newest event is already outside the window.
    /// Returns the number of windows removed.
    pub fn purge_idle(&self, now: DateTime<Utc>) -> usize {
        let syn_start = now - self.syn.window;
        let udp_start = now - self.udp.window;
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let before = windows.len();
        windows.retain(|(kind, _), window| {
            let start = match kind {
                FloodKind::Syn => syn_start,
                FloodKind::Udp => udp_start,
            };
            window.events.back().map_or(false, |newest| *newest >= start)
        });
        before - windows.len()
    }

    /// Number of (kind, address) windows currently held
    pub fn tracked_windows(&self) -> usize {
        self.windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn detector(threshold: u32, window_secs: u64) -> FloodDetector {
        FloodDetector::new(&DetectionConfig {
            syn_threshold: threshold,
            syn_window_secs: window_secs,
            udp_threshold: threshold,
            udp_window_secs: window_secs,
            ..DetectionConfig::default()
        })
    }

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_fires_on_threshold_within_window() {
        let detector = detector(5, 2);
        let ip = addr("10.0.0.5");
        let start = Utc::now();

        for i in 0..4 {
            let obs = detector.observe(ip, FloodKind::Syn, start + Duration::milliseconds(i * 100));
            assert!(!obs.is_attack, "observation {} fired early", i + 1);
        }
        let obs = detector.observe(ip, FloodKind::Syn, start + Duration::milliseconds(400));
        assert!(obs.is_attack);
        assert_eq!(obs.count, 5);
    }

    #[test]
    fn test_spaced_events_never_fire() {
        let detector = detector(2, 2);
        let ip = addr("10.0.0.6");
        let start = Utc::now();

        for i in 0..10 {
            let obs = detector.observe(ip, FloodKind::Syn, start + Duration::seconds(i * 3));
            assert!(!obs.is_attack);
            assert_eq!(obs.count, 1);
        }
    }

    #[test]
    fn test_kinds_use_separate_windows() {
        let detector = detector(3, 2);
        let ip = addr("10.0.0.7");
        let now = Utc::now();

        detector.observe(ip, FloodKind::Syn, now);
        detector.observe(ip, FloodKind::Syn, now);
        let udp = detector.observe(ip, FloodKind::Udp, now);
        assert_eq!(udp.count, 1);
        assert!(!udp.is_attack);
        assert_eq!(detector.current_count(ip, FloodKind::Syn, now), 2);
    }

    #[test]
    fn test_reset_and_purge() {
        let detector = detector(5, 2);
        let now = Utc::now();
        detector.observe(addr("10.0.0.1"), FloodKind::Syn, now);
        detector.observe(addr("10.0.0.2"), FloodKind::Syn, now);
        detector.observe(addr("10.0.0.2"), FloodKind::Udp, now);

        detector.reset(addr("10.0.0.2"));
        assert_eq!(detector.tracked_windows(), 1);

        assert_eq!(detector.purge_idle(now + Duration::seconds(1)), 0);
        assert_eq!(detector.purge_idle(now + Duration::seconds(3)), 1);
        assert_eq!(detector.tracked_windows(), 0);
    }

    #[test]
    fn test_out_of_order_timestamps() {
        let detector = detector(3, 2);
        let ip = addr("10.0.0.8");
        let now = Utc::now();
        detector.observe(ip, FloodKind::Syn, now + Duration::milliseconds(500));
        detector.observe(ip, FloodKind::Syn, now);
        let obs = detector.observe(ip, FloodKind::Syn, now + Duration::milliseconds(600));
        assert!(obs.is_attack);
    }

    #[test]
    fn test_concurrent_observers() {
        let detector = Arc::new(detector(1000, 60));
        let ip = addr("10.0.0.9");
        let now = Utc::now();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let detector = Arc::clone(&detector);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        detector.observe(ip, FloodKind::Syn, now);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(detector.current_count(ip, FloodKind::Syn, now), 200);
    }

    #[test]
    fn test_new_timeline_starts_empty() {
        let detector = detector(3, 2);
        let ip = addr("10.0.0.10");
        let start = Utc::now();

        for timeline in [1, 2] {
            for i in 0..2 {
                let obs = detector.observe_on(
                    timeline,
                    ip,
                    FloodKind::Syn,
                    start + Duration::milliseconds(i * 100),
                );
                assert!(!obs.is_attack, "timeline {} fired", timeline);
                assert_eq!(obs.count, i as u64 + 1);
            }
        }
    }

    #[test]
    fn test_clock_restart_clears_window() {
        let detector = detector(3, 2);
        let ip = addr("10.0.0.11");
        let start = Utc::now();
        detector.observe(ip, FloodKind::Syn, start + Duration::seconds(60));
        detector.observe(ip, FloodKind::Syn, start + Duration::seconds(60));

        let obs = detector.observe(ip, FloodKind::Syn, start);
        assert_eq!(obs.count, 1);
        assert!(!obs.is_attack);
    }

    #[test]
    fn test_huge_window_does_not_overflow() {
        let detector = detector(2, u64::MAX);
        let ip = addr("10.0.0.12");
        let now = Utc::now();
        detector.observe(ip, FloodKind::Syn, now);
        let obs = detector.observe(ip, FloodKind::Syn, now + Duration::days(365));
        assert!(obs.is_attack);
        assert_eq!(detector.purge_idle(now), 0);
    }
}
