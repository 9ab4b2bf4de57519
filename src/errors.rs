//! Error taxonomy for the gateway.
//!
//! [`GatewayError`] covers every way a request can end without a translation.
//! Admission-time variants (`Unauthorized`, `Paused`, `Busy`, `CpuOverload`,
//! `BadRequest`, `NotFound`) are produced by the request handler before a job
//! exists.
//! Execution-time variants (`Spawn`, `WorkerFailure`, `Timeout`, `Aborted`)
//! are produced by the job executor after the busy slot was claimed and always
//! come back with the slot released.
//!
//! [`ConfigError`] and [`ProvisioningError`] are startup failures and never
//! reach an HTTP client.

use std::path::PathBuf;

use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use thiserror::Error;

use crate::api::api_objects::{ErrorBody, json_response};

/// Why a bearer credential was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    Missing,
    Invalid,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("bearer credential rejected ({0:?})")]
    Unauthorized(AuthFailure),

    #[error("the gateway is paused")]
    Paused,

    #[error("another job is already running")]
    Busy,

    #[error("CPU usage {current:.2}% is at or above the allocation limit {limit:.2}%")]
    CpuOverload { current: f64, limit: f64 },

    #[error("bad request: {details}")]
    BadRequest { details: String },

    #[error("no route for {method} {path}")]
    NotFound { method: String, path: String },

    #[error("failed to start the worker: {details}")]
    Spawn { details: String },

    #[error("worker failed: {details}")]
    WorkerFailure { details: String },

    #[error("the job exceeded its deadline")]
    Timeout,

    #[error("the job was aborted because the gateway was paused or stopped")]
    Aborted,
}

impl GatewayError {
    pub fn bad_request(details: impl Into<String>) -> Self {
        GatewayError::BadRequest {
            details: details.into(),
        }
    }

    pub fn worker_failure(details: impl Into<String>) -> Self {
        GatewayError::WorkerFailure {
            details: details.into(),
        }
    }

    /// Maps the error to the closed set of response bodies.
    pub fn to_body(&self) -> ErrorBody {
        match self {
            GatewayError::Unauthorized(AuthFailure::Missing) => ErrorBody::Unauthorized {
                message: "Missing bearer token".to_string(),
            },
            GatewayError::Unauthorized(AuthFailure::Invalid) => ErrorBody::Unauthorized {
                message: "Invalid bearer token".to_string(),
            },
            GatewayError::Paused => ErrorBody::Paused {
                message: "The server is paused. Resume it to accept new jobs.".to_string(),
            },
            GatewayError::Busy => ErrorBody::Busy {
                message: "A translation is already in progress. Try again later.".to_string(),
            },
            GatewayError::CpuOverload { current, limit } => ErrorBody::CpuOverload {
                message: "CPU usage exceeds the configured allocation limit.".to_string(),
                cpu_usage_percent: format!("{current:.2}"),
                cpu_allocation_limit: format!("{limit:.2}"),
            },
            GatewayError::BadRequest { details } => ErrorBody::Error {
                message: "Invalid request".to_string(),
                details: Some(details.clone()),
            },
            GatewayError::NotFound { method, path } => ErrorBody::Error {
                message: "Not found".to_string(),
                details: Some(format!("no route for {method} {path}")),
            },
            GatewayError::Spawn { details } => ErrorBody::Error {
                message: "Unable to start the translation worker".to_string(),
                details: Some(details.clone()),
            },
            GatewayError::WorkerFailure { details } => ErrorBody::Error {
                message: "Translation failed".to_string(),
                details: Some(details.clone()),
            },
            GatewayError::Timeout => ErrorBody::Timeout {
                message: "The translation exceeded the time limit and was stopped.".to_string(),
            },
            GatewayError::Aborted => ErrorBody::Aborted {
                message: "The translation was stopped because the server was paused or shut down.".to_string(),
            },
        }
    }
}

impl ResponseError for GatewayError {
    fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Paused | GatewayError::CpuOverload { .. } | GatewayError::Aborted => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::Busy => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            GatewayError::NotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::Spawn { .. } | GatewayError::WorkerFailure { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            GatewayError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut response = json_response(self.status_code(), &self.to_body());
        if matches!(self, GatewayError::Unauthorized(_)) {
            response.headers_mut().insert(
                actix_web::http::header::WWW_AUTHENTICATE,
                actix_web::http::header::HeaderValue::from_static("Bearer"),
            );
        }
        response
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("cpu_allocation_limit must be in (0, 100], got {0}")]
    CpuLimitOutOfRange(f64),

    #[error("port must not be 0")]
    InvalidPort,

    #[error("worker program must not be empty")]
    EmptyWorkerProgram,

    #[error("auth_secret must not be empty when set")]
    EmptySecret,
}

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("worker script {0} does not exist")]
    MissingWorkerScript(PathBuf),

    #[error("model files missing under {model_dir}: {}", missing.join(", "))]
    MissingModelFiles {
        model_dir: PathBuf,
        missing: Vec<String>,
    },
}
