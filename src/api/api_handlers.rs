use actix_web::{HttpRequest, HttpResponse, http::StatusCode, web};

use crate::api::api_objects::{GatewayStatus, StatusReport, json_response, translation_body};
use crate::errors::GatewayError;
use crate::scheduler::try_admit;
use crate::server::GatewayContext;

/// Largest `/translate` body accepted. Article text can be long.
pub const MAX_REQUEST_BYTES: usize = 2 * 1024 * 1024;

pub async fn handle_status(ctx: web::Data<GatewayContext>) -> HttpResponse {
    let snapshot = ctx.state.snapshot();
    let sample = ctx.probe.sample();
    let status = if snapshot.paused {
        GatewayStatus::Paused
    } else if snapshot.busy {
        GatewayStatus::Busy
    } else {
        GatewayStatus::Ready
    };
    let report = StatusReport {
        status,
        memory_used_gb: format!("{:.2}", sample.memory_used_gb),
        memory_total_gb: format!("{:.2}", sample.memory_total_gb),
        cpu_usage_percent: format!("{:.2}", sample.cpu_percent),
        os: ctx.os.clone(),
    };
    json_response(StatusCode::OK, &report)
}

pub async fn handle_translate(
    payload: web::Payload,
    ctx: web::Data<GatewayContext>,
) -> Result<HttpResponse, GatewayError> {
    let body = match payload.to_bytes_limited(MAX_REQUEST_BYTES).await {
        Ok(Ok(body)) => body,
        Ok(Err(e)) => {
            return Err(GatewayError::bad_request(format!(
                "failed to read request body: {e}"
            )));
        }
        Err(_) => {
            return Err(GatewayError::bad_request(format!(
                "request body exceeds {MAX_REQUEST_BYTES} bytes"
            )));
        }
    };
    let input = ctx.validator.validate(&body).await?;
    let slot = try_admit(&ctx.state, ctx.probe.as_ref())?;
    let job_id = slot.job_id();
    let record = ctx.executor.execute(slot, input).await?;
    tracing::debug!(job_id, fields = record.len(), "translation returned");
    Ok(json_response(StatusCode::OK, &translation_body(record)))
}

/// Fallback for unknown paths and wrong methods.
pub async fn handle_unknown_route(req: HttpRequest) -> Result<HttpResponse, GatewayError> {
    Err(GatewayError::NotFound {
        method: req.method().to_string(),
        path: req.path().to_string(),
    })
}
