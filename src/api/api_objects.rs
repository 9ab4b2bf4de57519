use actix_web::{HttpResponse, http::StatusCode, http::header::ContentType};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Minimal body used when a response cannot be serialized.
pub const FALLBACK_BODY: &str = r#"{"status":"error","message":"Internal server error"}"#;

/// Body of `POST /translate`. Exactly one of the two fields must be set.
#[derive(Debug, Clone, Deserialize)]
pub struct TranslateRequest {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// Validated job input handed to the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobInput {
    Text(String),
    Url(String),
}

impl JobInput {
    pub fn kind(&self) -> &'static str {
        match self {
            JobInput::Text(_) => "text",
            JobInput::Url(_) => "url",
        }
    }
}

/// Structured record emitted by a successful worker run.
pub type TranslationRecord = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayStatus {
    Ready,
    Busy,
    Paused,
}

/// Body of `POST /status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub status: GatewayStatus,
    pub memory_used_gb: String,
    pub memory_total_gb: String,
    pub cpu_usage_percent: String,
    pub os: String,
}

/// Every non-success body the gateway can produce, tagged by `status`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ErrorBody {
    Unauthorized {
        message: String,
    },
    Paused {
        message: String,
    },
    Busy {
        message: String,
    },
    CpuOverload {
        message: String,
        cpu_usage_percent: String,
        cpu_allocation_limit: String,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
    Timeout {
        message: String,
    },
    Aborted {
        message: String,
    },
}

/// Success body: the worker's fields with `status` forced to `"ok"`.
pub fn translation_body(record: TranslationRecord) -> Value {
    let mut body = record;
    body.insert("status".to_string(), Value::String("ok".to_string()));
    Value::Object(body)
}

/// Serializes `body` with the given status code. Never fails: a body that
/// cannot be serialized degrades to [`FALLBACK_BODY`] with a 500.
pub fn json_response<T: Serialize + ?Sized>(status: StatusCode, body: &T) -> HttpResponse {
    match serde_json::to_string(body) {
        Ok(json) => HttpResponse::build(status)
            .insert_header(ContentType::json())
            .body(json),
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize response body");
            HttpResponse::InternalServerError()
                .insert_header(ContentType::json())
                .body(FALLBACK_BODY)
        }
    }
}
