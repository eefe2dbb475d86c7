use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, Response};
use axum::routing::get;
use axum::{Json, Router};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::collectors::Collector;
use crate::error::AppError;
use crate::metrics::Snapshot;
use crate::snapshot::build_snapshot;

#[derive(Clone)]
pub struct AppState {
    pub collector: Arc<dyn Collector>,
}

impl AppState {
    pub fn new(collector: Arc<dyn Collector>) -> Self {
        Self { collector }
    }
}

pub fn router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|req: &Request<Body>| {
            tracing::info_span!(
                "request",
                method = %req.method(),
                uri = %req.uri(),
            )
        })
        .on_response(|res: &Response<Body>, latency: Duration, _span: &tracing::Span| {
            info!(
                latency = %format!("{} ms", latency.as_millis()),
                status = %res.status().as_u16(),
                "finished processing request"
            );
        });

    Router::new()
        .route("/status", get(status))
        .layer(trace_layer)
        .with_state(state)
}

/// One fresh snapshot per request; nothing is cached.
async fn status(State(state): State<AppState>) -> Result<Json<Snapshot>, AppError> {
    let collector = Arc::clone(&state.collector);
    let collection = tokio::task::spawn_blocking(move || collector.collect()).await??;
    let snapshot = build_snapshot(collection)?;
    Ok(Json(snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use serde_json::Value;
    use std::io::Write;
    use tower::ServiceExt;

    use crate::collectors::FixtureCollector;

    const ONE_GPU: &str = r#"{
        "gpus": {
            "0": {
                "index": 0, "name": "NVIDIA GeForce RTX 3090", "fan_speed": null,
                "temperature_gpu": 45, "power_draw": 110.5, "power_limit": 350.0,
                "memory_used": 8000, "memory_total": 24576, "utilization_gpu": 64,
                "pcie_width_current": 16, "pcie_gen_current": 4,
                "driver_version": "550.2", "cuda_version": "12.4",
                "processes": {
                    "900": {
                        "gpu_index": 0, "container_name": null,
                        "proc_start_time": "Mon Jan 08 13:00:00 2024",
                        "proc_running_time": 60, "pid": 900, "pid_in_container": null,
                        "process_name": "python", "gpu_memory_used": 7900,
                        "main_memory_used": 1500, "command": "python train.py"
                    }
                }
            }
        },
        "errors": [{"gpu_index": 1, "source": "gpu", "message": "GPU is lost"}]
    }"#;

    fn fixture_app(contents: &str) -> (Router, tempfile::NamedTempFile) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        let collector = Arc::new(FixtureCollector::new(file.path()));
        (router(AppState::new(collector)), file)
    }

    async fn get_status(app: Router) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn status_returns_snapshot() {
        let (app, _file) = fixture_app(ONE_GPU);
        let (status, body) = get_status(app).await;

        assert_eq!(status, StatusCode::OK);
        assert!(body["datetime_str"].is_string());
        assert_eq!(body["driver_version"], "550.2");
        assert_eq!(body["cuda_version"], "12.4");
        assert!(body["gpu_info_list"][0]["fan_speed"].is_null());
        assert_eq!(body["gpu_info_list"][0]["temperature_gpu"], 45);
        assert_eq!(body["proc_info_list"][0]["global_index"], 0);
        assert_eq!(body["proc_info_list"][0]["command"], "python train.py");
        assert_eq!(body["err_infos"][0]["message"], "GPU is lost");
    }

    #[tokio::test]
    async fn empty_fleet_is_a_server_error() {
        let (app, _file) = fixture_app(
            r#"{"gpus": {}, "errors": [{"gpu_index": 0, "source": "gpu", "message": "Unknown Error"}]}"#,
        );
        let (status, body) = get_status(app).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "failed to get GPU status");
        assert_eq!(body["message"], "no GPU devices found");
        assert!(body["datetime_str"].is_string());
    }

    #[tokio::test]
    async fn collector_failure_is_a_server_error() {
        let dir = tempfile::tempdir().unwrap();
        let collector = Arc::new(FixtureCollector::new(dir.path().join("gone.json")));
        let (status, body) = get_status(router(AppState::new(collector))).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["message"].as_str().unwrap().contains("gone.json"));
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let (app, _file) = fixture_app(ONE_GPU);
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
