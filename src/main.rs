//! Flood Sentinel
//!
//! Entry point: `serve` runs the HTTP control surface, `etl` loads capture
//! files through the batch aggregator and `analyze` runs the streaming
//! analyzer over one capture file.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use log::{info, warn};

use flood_sentinel::api::{self, ApiState};
use flood_sentinel::capture::{default_backend, CaptureManager};
use flood_sentinel::config::load_config;
use flood_sentinel::core::{
    BlockingManager, Classifier, FloodDetector, HttpClassifier, StaticClassifier, TrafficAnalyzer,
};
use flood_sentinel::etl::EtlPipeline;
use flood_sentinel::models::Config;
use flood_sentinel::storage::{open_store, StoreHandles};

/// How often expired blocks and idle detector windows are purged
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "flood-sentinel", version, about = "SYN/UDP flood detection and blocking")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API
    Serve,
    /// Load a capture file or directory through the batch aggregator
    Etl {
        source: PathBuf,
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Analyze one capture file and print the report as JSON
    Analyze { file: PathBuf },
}

fn build_classifier(config: &Config) -> Arc<dyn Classifier> {
    if !config.classifier.enabled {
        return Arc::new(StaticClassifier);
    }
    match HttpClassifier::new(&config.classifier) {
        Ok(classifier) => Arc::new(classifier),
        Err(e) => {
            warn!("Classifier unavailable ({}); using the static table", e);
            Arc::new(StaticClassifier)
        }
    }
}

fn build_analyzer(config: &Config, store: &StoreHandles) -> Arc<TrafficAnalyzer> {
    Arc::new(TrafficAnalyzer::new(
        Arc::new(FloodDetector::new(&config.detection)),
        Arc::new(BlockingManager::new(&config.blocking)),
        build_classifier(config),
        store.attack_log.clone(),
        config.detection.clone(),
        config.analyzer.clone(),
    ))
}

fn spawn_housekeeping(analyzer: Arc<TrafficAnalyzer>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        loop {
            interval.tick().await;
            let now = Utc::now();
            let expired = analyzer.blocker().sweep_expired(now);
            let idle = analyzer.detector().purge_idle(now);
            if expired > 0 || idle > 0 {
                info!("Housekeeping: {} blocks expired, {} idle windows dropped", expired, idle);
            }
        }
    });
}

async fn serve(config: Config, store: StoreHandles) -> anyhow::Result<()> {
    let analyzer = build_analyzer(&config, &store);
    let etl = Arc::new(EtlPipeline::from_handles(
        &store,
        config.storage.data_dir.clone(),
        config.etl.clone(),
    ));
    let capture = Arc::new(CaptureManager::new(
        default_backend(),
        analyzer.clone(),
        config.capture.clone(),
    ));
    spawn_housekeeping(analyzer.clone());

    let state = web::Data::new(ApiState {
        analyzer,
        store,
        etl,
        capture,
    });

    info!("Listening on {}:{}", config.server.host, config.server.port);
    HttpServer::new(move || App::new().app_data(state.clone()).configure(api::config))
        .bind((config.server.host.as_str(), config.server.port))?
        .run()
        .await?;
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = load_config().context("failed to load configuration")?;
    flood_sentinel::metrics::install(&config.metrics)?;
    let store = open_store(&config).context("failed to open store")?;

    match cli.command {
        Command::Serve => {
            serve(config, store).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Etl { source, batch_size } => {
            let pipeline = EtlPipeline::from_handles(&store, config.storage.data_dir.clone(), config.etl.clone());
            let report = pipeline.run(&source, batch_size).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(if report.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Analyze { file } => {
            let analyzer = build_analyzer(&config, &store);
            let report = analyzer
                .analyze_file(&file)
                .await
                .with_context(|| format!("failed to analyze {}", file.display()))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[actix_web::main]
async fn main() -> ExitCode {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    env_logger::init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            log::error!("{:#}", e);
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
