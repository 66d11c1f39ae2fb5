//! Live capture sessions.
//!
//! A session runs a blocking producer that pulls frames from a
//! [`PacketSource`] and an async consumer that decodes them and feeds the
//! traffic analyzer. The two are joined by a bounded channel. Stopping is
//! cooperative: the producer checks a cancellation token between reads and
//! `stop` waits a bounded time for it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capture::decode::{decode_frame, RawFrame};
use crate::capture::reader::write_capture_file;
use crate::capture::CaptureError;
use crate::core::traffic_analyzer::{AnalysisReport, AnalysisRun, TrafficAnalyzer};
use crate::metrics as m;
use crate::models::CaptureConfig;
use crate::utils::format_file_stamp;

/// Parameters of one capture session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureOptions {
    /// Interface to capture on; the backend default when absent
    pub interface: Option<String>,
    /// BPF filter expression, passed through to the backend untouched
    pub filter: Option<String>,
    /// Stop after this many frames
    pub max_packets: Option<u64>,
    /// Stop after this many seconds
    pub timeout_secs: Option<u64>,
}

/// One read from a packet source
#[derive(Debug)]
pub enum SourceEvent {
    Frame(RawFrame),
    /// Nothing arrived within the source's read timeout
    Idle,
    /// The source has no more frames
    Exhausted,
}

/// A blocking frame producer
pub trait PacketSource: Send {
    fn next_frame(&mut self) -> Result<SourceEvent, CaptureError>;
}

/// Opens packet sources and names the interfaces they can capture on
pub trait CaptureBackend: Send + Sync {
    fn open(&self, options: &CaptureOptions) -> Result<Box<dyn PacketSource>, CaptureError>;

    fn list_interfaces(&self) -> Result<Vec<String>, CaptureError>;
}

/// Session state shared by the producer and the control surface
#[derive(Default)]
struct SharedState {
    running: AtomicBool,
    packets: AtomicU64,
    bytes: AtomicU64,
    error: Mutex<Option<String>>,
    frames: Mutex<Vec<RawFrame>>,
}

impl SharedState {
    fn set_error(&self, message: String) {
        *self.error.lock().unwrap_or_else(PoisonError::into_inner) = Some(message);
    }

    fn error(&self) -> Option<String> {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn frames(&self) -> MutexGuard<'_, Vec<RawFrame>> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Snapshot of the current or most recent session
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CaptureStatus {
    pub running: bool,
    pub interface: Option<String>,
    pub filter: Option<String>,
    pub packets: u64,
    pub bytes: u64,
    pub elapsed_secs: f64,
    pub started_at: Option<DateTime<Utc>>,
    /// Worker failure, if the session ended on an error
    pub error: Option<String>,
}

/// Result of stopping a session
#[derive(Debug, Clone, Serialize)]
pub struct CaptureSummary {
    /// False when the worker did not exit within the stop timeout; it then
    /// finishes on its own and no analysis report is available
    pub stopped_cleanly: bool,
    pub packets: u64,
    pub bytes: u64,
    pub duration_secs: f64,
    pub saved_path: Option<PathBuf>,
    pub error: Option<String>,
    pub report: Option<AnalysisReport>,
}

struct ActiveCapture {
    options: CaptureOptions,
    started_at: DateTime<Utc>,
    started: Instant,
    cancel: CancellationToken,
    shared: Arc<SharedState>,
    worker: JoinHandle<()>,
    consumer: JoinHandle<AnalysisReport>,
}

impl ActiveCapture {
    fn status(&self) -> CaptureStatus {
        CaptureStatus {
            running: self.shared.running.load(Ordering::SeqCst),
            interface: self.options.interface.clone(),
            filter: self.options.filter.clone(),
            packets: self.shared.packets.load(Ordering::Relaxed),
            bytes: self.shared.bytes.load(Ordering::Relaxed),
            elapsed_secs: self.started.elapsed().as_secs_f64(),
            started_at: Some(self.started_at),
            error: self.shared.error(),
        }
    }
}

/// Runs at most one capture session at a time
pub struct CaptureManager {
    backend: Arc<dyn CaptureBackend>,
    analyzer: Arc<TrafficAnalyzer>,
    config: CaptureConfig,
    active: tokio::sync::Mutex<Option<ActiveCapture>>,
    last_status: Mutex<Option<CaptureStatus>>,
}

impl CaptureManager {
    pub fn new(
        backend: Arc<dyn CaptureBackend>,
        analyzer: Arc<TrafficAnalyzer>,
        config: CaptureConfig,
    ) -> Self {
        Self {
            backend,
            analyzer,
            config,
            active: tokio::sync::Mutex::new(None),
            last_status: Mutex::new(None),
        }
    }

    /// Start a session. Fails with `AlreadyRunning` while a worker is alive.
    pub async fn start(&self, options: CaptureOptions) -> Result<CaptureStatus, CaptureError> {
        let mut active = self.active.lock().await;
        if let Some(current) = active.as_ref() {
            if current.shared.running.load(Ordering::SeqCst) {
                return Err(CaptureError::AlreadyRunning);
            }
        }

        let options = CaptureOptions {
            interface: options.interface.or_else(|| self.config.interface.clone()),
            filter: options.filter.or_else(|| self.config.filter.clone()),
            ..options
        };
        let source = self.backend.open(&options)?;

        let shared = Arc::new(SharedState::default());
        shared.running.store(true, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));

        let worker = {
            let shared = Arc::clone(&shared);
            let cancel = cancel.clone();
            let limits = WorkerLimits {
                max_packets: options.max_packets,
                deadline: options
                    .timeout_secs
                    .and_then(|secs| Instant::now().checked_add(Duration::from_secs(secs))),
                max_saved_frames: self.config.max_saved_frames,
            };
            tokio::task::spawn_blocking(move || run_worker(source, shared, cancel, tx, limits))
        };
        let consumer = tokio::spawn(consume(Arc::clone(&self.analyzer), rx));

        let capture = ActiveCapture {
            options,
            started_at: Utc::now(),
            started: Instant::now(),
            cancel,
            shared,
            worker,
            consumer,
        };
        let status = capture.status();
        info!(
            "Capture started on {}",
            capture.options.interface.as_deref().unwrap_or("default interface")
        );

        if let Some(previous) = active.replace(capture) {
            // The previous worker has already exited; its consumer drains on its own.
            *self.lock_last_status() = Some(previous.status());
        }
        Ok(status)
    }

    /// Stop the session, optionally saving the captured frames.
    ///
    /// Fails with `NotRunning` when there is no session to stop.
    pub async fn stop(&self, save: bool) -> Result<CaptureSummary, CaptureError> {
        let mut guard = self.active.lock().await;
        let mut active = guard.take().ok_or(CaptureError::NotRunning)?;
        drop(guard);

        active.cancel.cancel();
        let wait = Duration::from_secs(self.config.stop_timeout_secs);

        let stopped_cleanly = match tokio::time::timeout(wait, &mut active.worker).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                active.shared.set_error(format!("capture worker panicked: {}", e));
                true
            }
            Err(_) => {
                warn!(
                    "Capture worker did not stop within {}s; it will finish in the background",
                    self.config.stop_timeout_secs
                );
                false
            }
        };

        let report = if stopped_cleanly {
            match tokio::time::timeout(wait, &mut active.consumer).await {
                Ok(Ok(report)) => Some(report),
                Ok(Err(e)) => {
                    error!("Capture analysis task failed: {}", e);
                    None
                }
                Err(_) => {
                    warn!("Capture analysis did not drain within {}s", self.config.stop_timeout_secs);
                    None
                }
            }
        } else {
            None
        };

        let mut status = active.status();
        if stopped_cleanly {
            status.running = false;
        }

        let mut error = status.error.clone();
        let saved_path = if save {
            match self.save_frames(&active.shared, active.started_at).await {
                Ok(path) => path,
                Err(e) => {
                    warn!("Failed to save capture: {}", e);
                    error.get_or_insert_with(|| format!("failed to save capture: {}", e));
                    None
                }
            }
        } else {
            None
        };

        info!(
            "Capture stopped: {} packets, {} bytes",
            status.packets, status.bytes
        );
        *self.lock_last_status() = Some(status.clone());

        Ok(CaptureSummary {
            stopped_cleanly,
            packets: status.packets,
            bytes: status.bytes,
            duration_secs: status.elapsed_secs,
            saved_path,
            error,
            report,
        })
    }

    /// Status of the running session, or of the last one if none is running
    pub async fn status(&self) -> CaptureStatus {
        if let Some(active) = self.active.lock().await.as_ref() {
            return active.status();
        }
        self.lock_last_status().clone().unwrap_or_default()
    }

    pub fn list_interfaces(&self) -> Result<Vec<String>, CaptureError> {
        self.backend.list_interfaces()
    }

    async fn save_frames(
        &self,
        shared: &SharedState,
        started_at: DateTime<Utc>,
    ) -> Result<Option<PathBuf>, CaptureError> {
        let frames = std::mem::take(&mut *shared.frames());
        if frames.is_empty() {
            return Ok(None);
        }

        let path = self
            .config
            .output_dir
            .join(format!("capture_{}.pcap", format_file_stamp(started_at)));
        let target = path.clone();
        let written = tokio::task::spawn_blocking(move || write_capture_file(&target, &frames))
            .await
            .map_err(|e| CaptureError::Worker(e.to_string()))??;

        info!("Saved {} frames to {}", written, path.display());
        Ok(Some(path))
    }

    fn lock_last_status(&self) -> MutexGuard<'_, Option<CaptureStatus>> {
        self.last_status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct WorkerLimits {
    max_packets: Option<u64>,
    deadline: Option<Instant>,
    max_saved_frames: usize,
}

fn run_worker(
    mut source: Box<dyn PacketSource>,
    shared: Arc<SharedState>,
    cancel: CancellationToken,
    tx: mpsc::Sender<RawFrame>,
    limits: WorkerLimits,
) {
    let mut buffer_full = false;
    loop {
        if cancel.is_cancelled() {
            debug!("Capture cancelled");
            break;
        }
        if limits.deadline.map_or(false, |deadline| Instant::now() >= deadline) {
            info!("Capture timeout reached");
            break;
        }

        match source.next_frame() {
            Ok(SourceEvent::Frame(frame)) => {
                let packets = shared.packets.fetch_add(1, Ordering::Relaxed) + 1;
                shared
                    .bytes
                    .fetch_add(frame.original_len as u64, Ordering::Relaxed);
                counter!(m::CAPTURE_PACKETS_TOTAL, 1);
                if !buffer_full {
                    let mut frames = shared.frames();
                    if frames.len() < limits.max_saved_frames {
                        frames.push(frame.clone());
                    } else {
                        buffer_full = true;
                        if limits.max_saved_frames > 0 {
                            warn!(
                                "Capture buffer full at {} frames; later frames will not be saved",
                                limits.max_saved_frames
                            );
                        }
                    }
                }

                if tx.blocking_send(frame).is_err() {
                    warn!("Capture analysis stopped accepting frames");
                    break;
                }
                if limits.max_packets.map_or(false, |max| packets >= max) {
                    info!("Capture reached {} packets", packets);
                    break;
                }
            }
            Ok(SourceEvent::Idle) => {}
            Ok(SourceEvent::Exhausted) => {
                debug!("Capture source exhausted");
                break;
            }
            Err(e) => {
                error!("Capture worker failed: {}", e);
                shared.set_error(e.to_string());
                break;
            }
        }
    }
    shared.running.store(false, Ordering::SeqCst);
}

async fn consume(analyzer: Arc<TrafficAnalyzer>, mut rx: mpsc::Receiver<RawFrame>) -> AnalysisReport {
    let mut run = AnalysisRun::new();
    while let Some(frame) = rx.recv().await {
        match decode_frame(&frame) {
            Ok(packet) => {
                analyzer.process_packet(&mut run, &packet).await;
            }
            Err(e) => {
                debug!("Skipping captured frame: {}", e);
                run.record_skipped();
            }
        }
    }
    analyzer.finish_run(run)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::backend::ReplayBackend;
    use crate::capture::decode::fixtures::{syn_frame, udp_frame};
    use crate::capture::reader::{read_capture_file, write_capture_file};
    use crate::core::{BlockingManager, DetectionConfig, FloodDetector, StaticClassifier};
    use crate::models::{AnalyzerConfig, BlockingConfig};
    use crate::storage::MemoryStore;
    use chrono::Duration as ChronoDuration;
    use std::collections::VecDeque;
    use tempfile::tempdir;

    fn analyzer() -> Arc<TrafficAnalyzer> {
        let detection = DetectionConfig::default();
        Arc::new(TrafficAnalyzer::new(
            Arc::new(FloodDetector::new(&detection)),
            Arc::new(BlockingManager::new(&BlockingConfig::default())),
            Arc::new(StaticClassifier),
            Arc::new(MemoryStore::new()),
            detection,
            AnalyzerConfig::default(),
        ))
    }

    fn config(output_dir: PathBuf) -> CaptureConfig {
        CaptureConfig {
            output_dir,
            channel_capacity: 8,
            stop_timeout_secs: 1,
            ..CaptureConfig::default()
        }
    }

    /// Source that replays frames and then idles until cancelled
    struct ScriptedSource {
        frames: VecDeque<RawFrame>,
    }

    impl PacketSource for ScriptedSource {
        fn next_frame(&mut self) -> Result<SourceEvent, CaptureError> {
            match self.frames.pop_front() {
                Some(frame) => Ok(SourceEvent::Frame(frame)),
                None => {
                    std::thread::sleep(Duration::from_millis(5));
                    Ok(SourceEvent::Idle)
                }
            }
        }
    }

    struct ScriptedBackend {
        frames: Vec<RawFrame>,
    }

    impl CaptureBackend for ScriptedBackend {
        fn open(&self, _options: &CaptureOptions) -> Result<Box<dyn PacketSource>, CaptureError> {
            Ok(Box::new(ScriptedSource {
                frames: self.frames.iter().cloned().collect(),
            }))
        }

        fn list_interfaces(&self) -> Result<Vec<String>, CaptureError> {
            Ok(vec!["test0".to_string()])
        }
    }

    struct FailingSource;

    impl PacketSource for FailingSource {
        fn next_frame(&mut self) -> Result<SourceEvent, CaptureError> {
            Err(CaptureError::Device("interface went down".into()))
        }
    }

    struct FailingBackend;

    impl CaptureBackend for FailingBackend {
        fn open(&self, _options: &CaptureOptions) -> Result<Box<dyn PacketSource>, CaptureError> {
            Ok(Box::new(FailingSource))
        }

        fn list_interfaces(&self) -> Result<Vec<String>, CaptureError> {
            Ok(Vec::new())
        }
    }

    /// Source whose first read blocks for seconds, ignoring cancellation
    struct StuckSource {
        entered: Arc<AtomicBool>,
    }

    impl PacketSource for StuckSource {
        fn next_frame(&mut self) -> Result<SourceEvent, CaptureError> {
            self.entered.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_secs(3));
            Ok(SourceEvent::Exhausted)
        }
    }

    #[derive(Default)]
    struct StuckBackend {
        entered: Arc<AtomicBool>,
    }

    impl CaptureBackend for StuckBackend {
        fn open(&self, _options: &CaptureOptions) -> Result<Box<dyn PacketSource>, CaptureError> {
            Ok(Box::new(StuckSource {
                entered: Arc::clone(&self.entered),
            }))
        }

        fn list_interfaces(&self) -> Result<Vec<String>, CaptureError> {
            Ok(Vec::new())
        }
    }

    async fn wait_until_stopped(manager: &CaptureManager) -> CaptureStatus {
        for _ in 0..200 {
            let status = manager.status().await;
            if !status.running {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("capture did not stop");
    }

    #[tokio::test]
    async fn test_start_stop_and_save() {
        let dir = tempdir().unwrap();
        let start = Utc::now();
        let frames: Vec<RawFrame> = (0..6)
            .map(|i| syn_frame([10, 0, 0, 5], [10, 0, 0, 1], start + ChronoDuration::milliseconds(i * 100)))
            .collect();
        let manager = CaptureManager::new(
            Arc::new(ScriptedBackend { frames }),
            analyzer(),
            config(dir.path().to_path_buf()),
        );

        let status = manager.start(CaptureOptions::default()).await.unwrap();
        assert!(status.running);
        assert!(matches!(
            manager.start(CaptureOptions::default()).await,
            Err(CaptureError::AlreadyRunning)
        ));

        for _ in 0..200 {
            if manager.status().await.packets == 6 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let summary = manager.stop(true).await.unwrap();
        assert!(summary.stopped_cleanly);
        assert_eq!(summary.packets, 6);
        let report = summary.report.unwrap();
        assert_eq!(report.attacks_detected, 1);

        let saved = summary.saved_path.unwrap();
        assert!(saved.starts_with(dir.path()));
        assert_eq!(read_capture_file(&saved).unwrap().len(), 6);

        assert!(!manager.status().await.running);
        assert!(matches!(manager.stop(false).await, Err(CaptureError::NotRunning)));
    }

    #[tokio::test]
    async fn test_saved_frames_are_capped() {
        let dir = tempdir().unwrap();
        let frames: Vec<RawFrame> = (0..6)
            .map(|_| udp_frame([10, 0, 0, 6], [10, 0, 0, 1], Utc::now()))
            .collect();
        let capped = CaptureConfig {
            max_saved_frames: 2,
            ..config(dir.path().join("capped"))
        };
        let manager = CaptureManager::new(
            Arc::new(ScriptedBackend { frames: frames.clone() }),
            analyzer(),
            capped,
        );

        manager.start(CaptureOptions::default()).await.unwrap();
        for _ in 0..200 {
            if manager.status().await.packets == 6 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let summary = manager.stop(true).await.unwrap();
        assert_eq!(summary.packets, 6);
        assert_eq!(read_capture_file(&summary.saved_path.unwrap()).unwrap().len(), 2);

        let disabled = CaptureConfig {
            max_saved_frames: 0,
            ..config(dir.path().join("disabled"))
        };
        let manager = CaptureManager::new(Arc::new(ScriptedBackend { frames }), analyzer(), disabled);
        manager.start(CaptureOptions::default()).await.unwrap();
        for _ in 0..200 {
            if manager.status().await.packets == 6 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let summary = manager.stop(true).await.unwrap();
        assert_eq!(summary.packets, 6);
        assert!(summary.saved_path.is_none());
    }

    #[tokio::test]
    async fn test_max_packets_ends_session() {
        let dir = tempdir().unwrap();
        let frames: Vec<RawFrame> = (0..10)
            .map(|_| udp_frame([10, 0, 0, 6], [10, 0, 0, 1], Utc::now()))
            .collect();
        let manager = CaptureManager::new(
            Arc::new(ScriptedBackend { frames }),
            analyzer(),
            config(dir.path().to_path_buf()),
        );

        manager
            .start(CaptureOptions {
                max_packets: Some(3),
                ..CaptureOptions::default()
            })
            .await
            .unwrap();
        let status = wait_until_stopped(&manager).await;
        assert_eq!(status.packets, 3);

        // A finished session can be replaced without stopping it first.
        manager.start(CaptureOptions::default()).await.unwrap();
        let summary = manager.stop(false).await.unwrap();
        assert!(summary.saved_path.is_none());
    }

    #[tokio::test]
    async fn test_worker_error_surfaces_in_status() {
        let dir = tempdir().unwrap();
        let manager = CaptureManager::new(
            Arc::new(FailingBackend),
            analyzer(),
            config(dir.path().to_path_buf()),
        );

        manager.start(CaptureOptions::default()).await.unwrap();
        let status = wait_until_stopped(&manager).await;
        assert!(status.error.unwrap().contains("interface went down"));
    }

    #[tokio::test]
    async fn test_stop_does_not_wait_forever() {
        let dir = tempdir().unwrap();
        let backend = Arc::new(StuckBackend::default());
        let entered = Arc::clone(&backend.entered);
        let manager = CaptureManager::new(backend, analyzer(), config(dir.path().to_path_buf()));

        manager.start(CaptureOptions::default()).await.unwrap();
        for _ in 0..200 {
            if entered.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(entered.load(Ordering::SeqCst), "worker never reached the source");

        let started = Instant::now();
        let summary = manager.stop(false).await.unwrap();

        assert!(!summary.stopped_cleanly);
        assert!(summary.report.is_none());
        assert!(started.elapsed() < Duration::from_millis(2500));
    }

    #[tokio::test]
    async fn test_replay_backend_session() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("replay.pcap");
        let start = Utc::now();
        let frames: Vec<RawFrame> = (0..5)
            .map(|i| syn_frame([10, 0, 0, 9], [10, 0, 0, 1], start + ChronoDuration::milliseconds(i * 50)))
            .collect();
        write_capture_file(&path, &frames).unwrap();

        let manager = CaptureManager::new(
            Arc::new(ReplayBackend::new(path)),
            analyzer(),
            config(dir.path().join("out")),
        );
        assert_eq!(manager.list_interfaces().unwrap(), vec!["replay:replay.pcap".to_string()]);

        manager.start(CaptureOptions::default()).await.unwrap();
        wait_until_stopped(&manager).await;
        let summary = manager.stop(false).await.unwrap();
        assert_eq!(summary.packets, 5);
        assert_eq!(summary.report.unwrap().blocked_sources.len(), 1);
    }
}
