use std::path::PathBuf;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use nvml_wrapper::error::NvmlError;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use crate::metrics::{GPUIndex, Pid};
use crate::snapshot;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("no GPU devices found")]
    NoDevicesFound,

    #[error("failed to aggregate GPU readings: {0}")]
    AggregationFailure(#[from] IngestError),
}

/// Collector output that breaks the snapshot invariants.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum IngestError {
    #[error("device index {index} reported under both `{first}` and `{second}`")]
    DuplicateDeviceIndex {
        index: GPUIndex,
        first: String,
        second: String,
    },

    #[error("process {pid} listed under device {device} but claims device {claimed}")]
    ProcessDeviceMismatch {
        pid: Pid,
        device: GPUIndex,
        claimed: GPUIndex,
    },
}

#[derive(Error, Debug)]
pub enum CollectError {
    #[error("failed to initialize NVML: {0}")]
    Init(#[source] NvmlError),

    #[error("NVML query failed: {0}")]
    Query(#[source] NvmlError),

    #[error("failed to read fixture {}: {source}", path.display())]
    Fixture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed fixture {}: {source}", path.display())]
    FixtureFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Collect(#[from] CollectError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("collector task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

const STATUS_FAILURE: &str = "failed to get GPU status";

#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    datetime_str: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!(error = %self, "status request failed");
        let body = ErrorResponse {
            error: STATUS_FAILURE,
            message: self.to_string(),
            datetime_str: snapshot::format_timestamp(&chrono::Local::now()),
        };
        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    }
}
