//! Batch aggregator: extract frames from capture files, transform them into
//! packets, connections, per-IP statistics and attack events, then load the
//! results through a [`RecordSink`].
//!
//! Only extraction failures fail a run. Undecodable frames, rejected batches
//! and attack log errors are counted in the report instead.

pub mod extract;
pub mod load;
pub mod transform;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use log::{error, info};
use metrics::counter;
use serde::Serialize;
use thiserror::Error;

use crate::capture::CaptureError;
use crate::metrics as m;
use crate::models::EtlConfig;
use crate::storage::{AttackLog, LocalSnapshot, RecordSink, StoreHandles};

pub use self::extract::{capture_files, extract, Extracted};
pub use self::load::{load, LoadStats, LoadTargets};
pub use self::transform::{transform, EtlStats, IpStatistics, StoredPacket, TransformOutput};

/// Errors that abort an ETL run
#[derive(Error, Debug)]
pub enum EtlError {
    #[error("Source not found: {0}")]
    SourceNotFound(PathBuf),
    #[error("Unsupported capture format: {0}")]
    UnsupportedFormat(PathBuf),
    #[error("No capture files in {0}")]
    NoCaptureFiles(PathBuf),
    #[error("Capture error: {0}")]
    CaptureError(#[from] CaptureError),
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Extraction task failed: {0}")]
    Task(String),
}

/// Result of one ETL run
#[derive(Debug, Clone, Serialize)]
pub struct EtlReport {
    pub success: bool,
    pub error: Option<String>,
    pub stats: EtlStats,
    pub load: LoadStats,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: f64,
}

/// Runs extract, transform and load in sequence
pub struct EtlPipeline {
    sink: Arc<dyn RecordSink>,
    attack_log: Arc<dyn AttackLog>,
    fallback: LocalSnapshot,
    config: EtlConfig,
    last_report: Mutex<Option<EtlReport>>,
}

impl EtlPipeline {
    pub fn new(
        sink: Arc<dyn RecordSink>,
        attack_log: Arc<dyn AttackLog>,
        fallback_dir: impl Into<PathBuf>,
        config: EtlConfig,
    ) -> Self {
        Self {
            sink,
            attack_log,
            fallback: LocalSnapshot::new(fallback_dir),
            config,
            last_report: Mutex::new(None),
        }
    }

    pub fn from_handles(handles: &StoreHandles, fallback_dir: impl Into<PathBuf>, config: EtlConfig) -> Self {
        Self::new(
            handles.sink.clone(),
            handles.attack_log.clone(),
            fallback_dir,
            config,
        )
    }

    /// Process every capture file of `source`. `batch_size` overrides the
    /// configured batch size for this run.
    pub async fn run(&self, source: &Path, batch_size: Option<usize>) -> EtlReport {
        let started_at = Utc::now();
        let clock = Instant::now();
        let batch_size = batch_size.unwrap_or(self.config.batch_size);
        info!("[ETL] Starting run over {} (batch size {})", source.display(), batch_size);
        counter!(m::ETL_RUNS_TOTAL, 1);

        let mut stats = EtlStats::default();
        let mut load_stats = LoadStats::default();

        let outcome = match self.extract_blocking(source).await {
            Ok(extracted) => {
                stats.files_read = extracted.files.len();
                let output = transform(extracted.frames, &self.config, &mut stats);
                let targets = LoadTargets {
                    sink: self.sink.as_ref(),
                    attack_log: self.attack_log.as_ref(),
                    fallback: &self.fallback,
                };
                load_stats = load(&targets, &output, batch_size).await;
                Ok(())
            }
            Err(e) => {
                error!("[ETL] Extraction from {} failed: {}", source.display(), e);
                Err(e.to_string())
            }
        };

        let report = EtlReport {
            success: outcome.is_ok(),
            error: outcome.err(),
            stats,
            load: load_stats,
            started_at,
            finished_at: Utc::now(),
            duration_secs: clock.elapsed().as_secs_f64(),
        };
        info!(
            "[ETL] Run finished in {:.2}s: success={}, {} packets ({} failed), {} attacks",
            report.duration_secs,
            report.success,
            report.stats.total_packets,
            report.stats.failed_packets,
            report.stats.attacks_detected
        );

        *self.last_report.lock().unwrap_or_else(PoisonError::into_inner) = Some(report.clone());
        report
    }

    /// Report of the most recent run, if any
    pub fn status(&self) -> Option<EtlReport> {
        self.last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn extract_blocking(&self, source: &Path) -> Result<Extracted, EtlError> {
        let source = source.to_path_buf();
        tokio::task::spawn_blocking(move || extract(&source))
            .await
            .map_err(|e| EtlError::Task(e.to_string()))?
    }
}
