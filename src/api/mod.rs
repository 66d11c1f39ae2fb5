//! HTTP control surface for the flood detection service.
//!
//! Every endpoint lives under `/api` and answers JSON with a `status` field
//! of `"success"` or `"error"`.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use actix_web::{web, HttpResponse, Responder};
use chrono::Utc;
use log::{info, warn};
use metrics::gauge;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::capture::{CaptureError, CaptureManager, CaptureOptions};
use crate::core::TrafficAnalyzer;
use crate::etl::{capture_files, EtlPipeline};
use crate::metrics as m;
use crate::storage::StoreHandles;

/// Default number of attack log entries returned
const DEFAULT_LOG_LIMIT: usize = 50;

/// Shared state behind every handler
pub struct ApiState {
    pub analyzer: Arc<TrafficAnalyzer>,
    pub store: StoreHandles,
    pub etl: Arc<EtlPipeline>,
    pub capture: Arc<CaptureManager>,
}

/// API configuration function for Actix-web
pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .service(web::resource("/health").route(web::get().to(health_check)))
            .service(web::resource("/blocked-ips").route(web::get().to(blocked_ips)))
            .service(web::resource("/unblock-ip").route(web::post().to(unblock_ip)))
            .service(web::resource("/attack-logs").route(web::get().to(attack_logs)))
            .service(web::resource("/attack-stats").route(web::get().to(attack_stats)))
            .service(web::resource("/connection-data").route(web::get().to(connection_data)))
            .service(web::resource("/clear-data").route(web::post().to(clear_data)))
            .service(web::resource("/analyze").route(web::post().to(analyze_capture)))
            .service(web::resource("/etl/process").route(web::post().to(etl_process)))
            .service(web::resource("/etl/status").route(web::get().to(etl_status)))
            .service(web::resource("/etl/validate").route(web::post().to(etl_validate)))
            .service(web::resource("/capture/start").route(web::post().to(capture_start)))
            .service(web::resource("/capture/stop").route(web::post().to(capture_stop)))
            .service(web::resource("/capture/status").route(web::get().to(capture_status)))
            .service(web::resource("/capture/interfaces").route(web::get().to(capture_interfaces))),
    );
}

/// Health check endpoint response
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnblockRequest {
    pub ip_address: String,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnalyzeRequest {
    pub path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EtlProcessRequest {
    pub source: PathBuf,
    pub batch_size: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EtlValidateRequest {
    pub source: PathBuf,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CaptureStopRequest {
    #[serde(default = "default_save")]
    pub save: bool,
}

fn default_save() -> bool {
    true
}

fn error_response(mut builder: actix_web::HttpResponseBuilder, message: impl ToString) -> HttpResponse {
    builder.json(json!({
        "status": "error",
        "message": message.to_string(),
    }))
}

async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn blocked_ips(state: web::Data<ApiState>) -> impl Responder {
    let active = state.analyzer.blocker().active_entries(Utc::now());
    gauge!(m::BLOCKED_SOURCES, active.len() as f64);
    HttpResponse::Ok().json(json!({
        "status": "success",
        "blocked_ips": active,
    }))
}

async fn unblock_ip(state: web::Data<ApiState>, req: web::Json<UnblockRequest>) -> impl Responder {
    let address: IpAddr = match req.ip_address.trim().parse() {
        Ok(address) => address,
        Err(_) => {
            return error_response(
                HttpResponse::BadRequest(),
                format!("invalid IP address: {}", req.ip_address),
            )
        }
    };

    let outcome = state.analyzer.blocker().unblock(address);
    state.analyzer.detector().reset(address);
    HttpResponse::Ok().json(json!({
        "status": "success",
        "message": format!("IP {} unblocked", address),
        "result": outcome,
    }))
}

async fn attack_logs(state: web::Data<ApiState>, query: web::Query<LogsQuery>) -> impl Responder {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    match state.store.attack_log.recent(limit).await {
        Ok(logs) => HttpResponse::Ok().json(json!({
            "status": "success",
            "logs": logs,
        })),
        Err(e) => {
            warn!("Failed to read attack logs: {}", e);
            error_response(HttpResponse::InternalServerError(), e)
        }
    }
}

async fn attack_stats(state: web::Data<ApiState>) -> impl Responder {
    match state.store.attack_log.statistics().await {
        Ok(statistics) => HttpResponse::Ok().json(json!({
            "status": "success",
            "statistics": statistics,
        })),
        Err(e) => {
            warn!("Failed to compute attack statistics: {}", e);
            error_response(HttpResponse::InternalServerError(), e)
        }
    }
}

async fn connection_data(state: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(json!({
        "status": "success",
        "connections": state.analyzer.get_connections(),
    }))
}

async fn clear_data(state: web::Data<ApiState>) -> impl Responder {
    let mut cleared = Vec::new();
    match state.store.attack_log.clear().await {
        Ok(()) => cleared.push("attack logs"),
        Err(e) => warn!("Failed to clear attack logs: {}", e),
    }
    state.analyzer.clear_connections();
    cleared.push("connections");
    state.analyzer.blocker().clear();
    cleared.push("blocked sources");

    info!("Cleared {}", cleared.join(", "));
    HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Data cleared",
        "cleared_items": cleared,
    }))
}

async fn analyze_capture(state: web::Data<ApiState>, req: web::Json<AnalyzeRequest>) -> impl Responder {
    if !req.path.is_file() {
        return error_response(
            HttpResponse::NotFound(),
            format!("file not found: {}", req.path.display()),
        );
    }

    match state.analyzer.analyze_file(&req.path).await {
        Ok(report) => HttpResponse::Ok().json(json!({
            "status": "success",
            "path": req.path,
            "results": report,
        })),
        Err(e @ CaptureError::UnsupportedFormat(_)) => error_response(HttpResponse::BadRequest(), e),
        Err(e) => {
            warn!("Analysis of {} failed: {}", req.path.display(), e);
            error_response(HttpResponse::InternalServerError(), e)
        }
    }
}

async fn etl_process(state: web::Data<ApiState>, req: web::Json<EtlProcessRequest>) -> impl Responder {
    if !req.source.exists() {
        return error_response(
            HttpResponse::NotFound(),
            format!("source path does not exist: {}", req.source.display()),
        );
    }

    let report = state.etl.run(&req.source, req.batch_size).await;
    if report.success {
        HttpResponse::Ok().json(json!({
            "status": "success",
            "message": "ETL pipeline completed",
            "result": report,
        }))
    } else {
        HttpResponse::InternalServerError().json(json!({
            "status": "error",
            "message": "ETL pipeline failed",
            "error": report.error,
            "result": report,
        }))
    }
}

async fn etl_status(state: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(json!({
        "status": "success",
        "last_run": state.etl.status(),
    }))
}

async fn etl_validate(req: web::Json<EtlValidateRequest>) -> impl Responder {
    let source = req.source.clone();
    let resolved = web::block(move || capture_files(&source)).await;
    match resolved {
        Ok(Ok(files)) => HttpResponse::Ok().json(json!({
            "status": "success",
            "valid": true,
            "files": files,
        })),
        Ok(Err(e)) => HttpResponse::Ok().json(json!({
            "status": "success",
            "valid": false,
            "message": e.to_string(),
        })),
        Err(e) => error_response(HttpResponse::InternalServerError(), e),
    }
}

async fn capture_start(
    state: web::Data<ApiState>,
    req: Option<web::Json<CaptureOptions>>,
) -> impl Responder {
    let options = req.map(web::Json::into_inner).unwrap_or_default();
    match state.capture.start(options).await {
        Ok(status) => HttpResponse::Ok().json(json!({
            "status": "success",
            "capture": status,
        })),
        Err(e @ CaptureError::AlreadyRunning) => error_response(HttpResponse::Conflict(), e),
        Err(e) => {
            warn!("Failed to start capture: {}", e);
            error_response(HttpResponse::BadRequest(), e)
        }
    }
}

async fn capture_stop(
    state: web::Data<ApiState>,
    req: Option<web::Json<CaptureStopRequest>>,
) -> impl Responder {
    let save = req.map(|req| req.save).unwrap_or_else(default_save);
    match state.capture.stop(save).await {
        Ok(summary) => HttpResponse::Ok().json(json!({
            "status": "success",
            "summary": summary,
        })),
        Err(e @ CaptureError::NotRunning) => error_response(HttpResponse::BadRequest(), e),
        Err(e) => {
            warn!("Failed to stop capture: {}", e);
            error_response(HttpResponse::InternalServerError(), e)
        }
    }
}

async fn capture_status(state: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(json!({
        "status": "success",
        "capture": state.capture.status().await,
    }))
}

async fn capture_interfaces(state: web::Data<ApiState>) -> impl Responder {
    match state.capture.list_interfaces() {
        Ok(interfaces) => HttpResponse::Ok().json(json!({
            "status": "success",
            "interfaces": interfaces,
        })),
        Err(e) => error_response(HttpResponse::InternalServerError(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::decode::fixtures::syn_frame;
    use crate::capture::{write_capture_file, ReplayBackend};
    use crate::core::{BlockingManager, FloodDetector, StaticClassifier};
    use crate::models::Config;
    use crate::storage::MemoryStore;
    use actix_web::{test, App};
    use serde_json::Value;
    use tempfile::{tempdir, TempDir};

    fn state(dir: &TempDir) -> web::Data<ApiState> {
        let config = Config::default();
        let store = StoreHandles::from_store(Arc::new(MemoryStore::new()));
        let analyzer = Arc::new(TrafficAnalyzer::new(
            Arc::new(FloodDetector::new(&config.detection)),
            Arc::new(BlockingManager::new(&config.blocking)),
            Arc::new(StaticClassifier),
            store.attack_log.clone(),
            config.detection.clone(),
            config.analyzer.clone(),
        ));
        let etl = Arc::new(EtlPipeline::from_handles(
            &store,
            dir.path().join("data"),
            config.etl.clone(),
        ));
        let capture = Arc::new(CaptureManager::new(
            Arc::new(ReplayBackend::new(dir.path().join("replay.pcap"))),
            analyzer.clone(),
            config.capture.clone(),
        ));
        web::Data::new(ApiState {
            analyzer,
            store,
            etl,
            capture,
        })
    }

    fn syn_burst(dir: &TempDir, name: &str) -> PathBuf {
        let now = Utc::now();
        let frames: Vec<_> = (0..6)
            .map(|_| syn_frame([10, 0, 0, 5], [10, 0, 0, 1], now))
            .collect();
        let path = dir.path().join(name);
        write_capture_file(&path, &frames).unwrap();
        path
    }

    #[actix_web::test]
    async fn test_health_check() {
        let dir = tempdir().unwrap();
        let app = test::init_service(App::new().app_data(state(&dir)).configure(config)).await;

        let req = test::TestRequest::get().uri("/api/health").to_request();
        let resp = test::call_service(&app, req).await;

        assert!(resp.status().is_success());
    }

    #[actix_web::test]
    async fn test_analyze_blocks_then_unblock() {
        let dir = tempdir().unwrap();
        let path = syn_burst(&dir, "burst.pcap");
        let app = test::init_service(App::new().app_data(state(&dir)).configure(config)).await;

        let req = test::TestRequest::post()
            .uri("/api/analyze")
            .set_json(AnalyzeRequest { path })
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["results"]["attacks_detected"], 1);

        let req = test::TestRequest::get().uri("/api/blocked-ips").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["blocked_ips"][0]["ip_address"], "10.0.0.5");

        let req = test::TestRequest::get().uri("/api/attack-logs?limit=5").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["logs"].as_array().unwrap().len(), 1);

        let req = test::TestRequest::post()
            .uri("/api/unblock-ip")
            .set_json(UnblockRequest {
                ip_address: "10.0.0.5".to_string(),
            })
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["result"]["was_blocked"], true);

        let req = test::TestRequest::get().uri("/api/blocked-ips").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert!(body["blocked_ips"].as_array().unwrap().is_empty());
    }

    #[actix_web::test]
    async fn test_unblock_rejects_bad_address() {
        let dir = tempdir().unwrap();
        let app = test::init_service(App::new().app_data(state(&dir)).configure(config)).await;

        let req = test::TestRequest::post()
            .uri("/api/unblock-ip")
            .set_json(UnblockRequest {
                ip_address: "not-an-ip".to_string(),
            })
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_etl_process_and_status() {
        let dir = tempdir().unwrap();
        let path = syn_burst(&dir, "etl.pcap");
        let app = test::init_service(App::new().app_data(state(&dir)).configure(config)).await;

        let req = test::TestRequest::post()
            .uri("/api/etl/process")
            .set_json(EtlProcessRequest {
                source: path,
                batch_size: Some(2),
            })
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["result"]["success"], true);
        assert_eq!(body["result"]["stats"]["total_packets"], 6);
        assert_eq!(body["result"]["stats"]["attacks_detected"], 1);

        let req = test::TestRequest::get().uri("/api/etl/status").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["last_run"]["stats"]["processed_packets"], 6);
    }

    #[actix_web::test]
    async fn test_etl_missing_source_is_not_found() {
        let dir = tempdir().unwrap();
        let app = test::init_service(App::new().app_data(state(&dir)).configure(config)).await;

        let req = test::TestRequest::post()
            .uri("/api/etl/process")
            .set_json(EtlProcessRequest {
                source: dir.path().join("missing.pcap"),
                batch_size: None,
            })
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::NOT_FOUND);

        let req = test::TestRequest::post()
            .uri("/api/etl/validate")
            .set_json(EtlValidateRequest {
                source: dir.path().to_path_buf(),
            })
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["valid"], false);
    }

    #[actix_web::test]
    async fn test_capture_stop_without_session() {
        let dir = tempdir().unwrap();
        let app = test::init_service(App::new().app_data(state(&dir)).configure(config)).await;

        let req = test::TestRequest::post()
            .uri("/api/capture/stop")
            .set_json(CaptureStopRequest { save: false })
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);

        let req = test::TestRequest::get().uri("/api/capture/status").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["capture"]["running"], false);

        let req = test::TestRequest::get().uri("/api/capture/interfaces").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["interfaces"][0], "replay:replay.pcap");
    }

    #[actix_web::test]
    async fn test_clear_data_resets_connections() {
        let dir = tempdir().unwrap();
        let path = syn_burst(&dir, "clear.pcap");
        let state = state(&dir);
        state.analyzer.analyze_file(&path).await.unwrap();
        assert!(!state.analyzer.get_connections().is_empty());

        let app = test::init_service(App::new().app_data(state.clone()).configure(config)).await;
        let req = test::TestRequest::post().uri("/api/clear-data").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "success");

        assert!(state.analyzer.get_connections().is_empty());
        assert!(state.store.attack_log.recent(10).await.unwrap().is_empty());
        assert!(state.analyzer.blocker().active_entries(Utc::now()).is_empty());
    }
}
