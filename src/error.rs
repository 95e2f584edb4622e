use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("No usable encoder for {0}")]
    NoEncoder(String),

    #[error("{what} did not reach ready state within {deadline_secs}s")]
    StartTimeout { what: String, deadline_secs: u64 },

    #[error("Capture device busy: {0}")]
    DeviceBusy(String),

    #[error("No signal on {0}")]
    NoSignal(String),

    #[error("Insufficient disk space: {free_gb:.1} GiB free, {required_gb:.1} GiB required")]
    InsufficientDisk { free_gb: f64, required_gb: f64 },

    #[error("Busy: {0}")]
    Busy(String),

    #[error("No publishing cameras among: {0}")]
    NoPublishers(String),

    #[error("Stream registry unavailable: {0}")]
    RegistryUnavailable(String),

    #[error("Pipeline failed [{pipeline}]: {reason}")]
    PipelineFatal { pipeline: String, reason: String },

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Mode arbiter degraded, only mode switch is valid")]
    Degraded,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    /// Stable machine-readable kind, used in event payloads and responses
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoEncoder(_) => "no_encoder",
            Self::StartTimeout { .. } => "start_timeout",
            Self::DeviceBusy(_) => "device_busy",
            Self::NoSignal(_) => "no_signal",
            Self::InsufficientDisk { .. } => "insufficient_disk",
            Self::Busy(_) => "busy",
            Self::NoPublishers(_) => "no_publishers",
            Self::RegistryUnavailable(_) => "registry_unavailable",
            Self::PipelineFatal { .. } => "pipeline_fatal",
            Self::ConfigInvalid(_) => "config_invalid",
            Self::NotFound(_) => "not_found",
            Self::Degraded => "degraded",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::Busy(_) | Self::DeviceBusy(_) | Self::NoPublishers(_) | Self::NoSignal(_) => {
                StatusCode::CONFLICT
            }
            Self::InsufficientDisk { .. } => StatusCode::INSUFFICIENT_STORAGE,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Degraded | Self::RegistryUnavailable(_) | Self::NoEncoder(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::ConfigInvalid(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error response body
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: &'static str,
    pub message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            success: false,
            error: self.kind(),
            message: self.to_string(),
        };

        tracing::error!(
            error_kind = body.error,
            error_message = %body.message,
            "Request failed"
        );

        (status, Json(body)).into_response()
    }
}

/// Result type alias for the whole crate
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_match_control_surface() {
        assert_eq!(
            AppError::Busy("switch in flight".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::InsufficientDisk {
                free_gb: 4.0,
                required_gb: 10.0
            }
            .status_code(),
            StatusCode::INSUFFICIENT_STORAGE
        );
        assert_eq!(
            AppError::Degraded.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::NotFound("cam9".into()).status_code(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_kind_is_stable() {
        assert_eq!(AppError::NoEncoder("h265".into()).kind(), "no_encoder");
        assert_eq!(
            AppError::PipelineFatal {
                pipeline: "ingest_cam0".into(),
                reason: "device gone".into()
            }
            .kind(),
            "pipeline_fatal"
        );
    }
}
