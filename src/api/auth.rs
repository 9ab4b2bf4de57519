//! Bearer-token gate applied to every route.

use actix_web::body::MessageBody;
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::http::header::{AUTHORIZATION, HeaderMap};
use actix_web::middleware::Next;
use actix_web::web;

use crate::errors::{AuthFailure, GatewayError};
use crate::server::GatewayContext;

/// Extracts the token from `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer ").or_else(|| raw.strip_prefix("bearer ")))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

pub fn check(headers: &HeaderMap, ctx: &GatewayContext) -> Result<(), GatewayError> {
    let token = bearer_token(headers).ok_or(GatewayError::Unauthorized(AuthFailure::Missing))?;
    if ctx.state.verify_secret(token) {
        Ok(())
    } else {
        Err(GatewayError::Unauthorized(AuthFailure::Invalid))
    }
}

/// Middleware rejecting requests without the configured bearer token before
/// any handler runs.
pub async fn require_bearer(
    req: ServiceRequest,
    next: Next<impl MessageBody + 'static>,
) -> Result<ServiceResponse<impl MessageBody>, actix_web::Error> {
    let verdict = match req.app_data::<web::Data<GatewayContext>>() {
        Some(ctx) => check(req.headers(), ctx),
        // No context means no secret to compare against: fail closed.
        None => Err(GatewayError::Unauthorized(AuthFailure::Invalid)),
    };

    match verdict {
        Ok(()) => next.call(req).await.map(ServiceResponse::map_into_left_body),
        Err(err) => {
            tracing::info!(path = req.path(), error = %err, "request rejected by auth gate");
            Ok(req.error_response(err).map_into_right_body())
        }
    }
}

#[cfg(test)]
mod tests {
    use actix_web::http::header::HeaderValue;

    use super::*;

    fn headers(value: Option<&'static str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(value) = value {
            headers.insert(AUTHORIZATION, HeaderValue::from_static(value));
        }
        headers
    }

    #[test]
    fn extracts_bearer_token() {
        assert_eq!(bearer_token(&headers(Some("Bearer abc123"))), Some("abc123"));
        assert_eq!(bearer_token(&headers(Some("bearer abc123 "))), Some("abc123"));
        assert_eq!(bearer_token(&headers(Some("Basic abc123"))), None);
        assert_eq!(bearer_token(&headers(Some("Bearer "))), None);
        assert_eq!(bearer_token(&headers(None)), None);
    }
}
