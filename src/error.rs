//! Gateway error taxonomy and its HTTP mapping.

use actix_web::{HttpResponse, ResponseError};
use http::StatusCode;
use thiserror::Error;

use crate::credentials::StoreError;
use crate::util::error_response;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed body or unsupported model; raised before any network call.
    #[error("{0}")]
    Validation(String),

    #[error("no valid credentials available")]
    CredentialExhausted,

    /// Connection, DNS or timeout failure talking to the backend.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("upstream rejected the request with status {status}")]
    UpstreamRejected { status: u16, body: String },

    #[error("unauthorized")]
    Unauthorized,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => GatewayError::NotFound(what),
            other => GatewayError::Store(other),
        }
    }
}

impl GatewayError {
    /// Messages-protocol error type string for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "invalid_request_error",
            GatewayError::CredentialExhausted => "overloaded_error",
            GatewayError::UpstreamUnavailable(_) | GatewayError::UpstreamRejected { .. } => {
                "api_error"
            }
            GatewayError::Unauthorized => "authentication_error",
            GatewayError::NotFound(_) => "not_found_error",
            GatewayError::Store(_) => "api_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::CredentialExhausted => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamUnavailable(_) | GatewayError::UpstreamRejected { .. } => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl ResponseError for GatewayError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        actix_web::http::StatusCode::from_u16(self.status().as_u16())
            .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        match self {
            GatewayError::UpstreamRejected { status, .. } => error_response(
                self.status(),
                self.kind(),
                &format!("Upstream API returned status {}", status),
            ),
            other => error_response(other.status(), other.kind(), &other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_each_kind_to_its_status() {
        assert_eq!(
            GatewayError::Validation("bad".into()).status_code().as_u16(),
            400
        );
        assert_eq!(GatewayError::CredentialExhausted.status_code().as_u16(), 503);
        assert_eq!(
            GatewayError::UpstreamUnavailable("dns".into())
                .status_code()
                .as_u16(),
            502
        );
        assert_eq!(
            GatewayError::UpstreamRejected {
                status: 429,
                body: String::new()
            }
            .status_code()
            .as_u16(),
            502
        );
    }

    #[test]
    fn store_not_found_becomes_404() {
        let err: GatewayError = StoreError::NotFound("credential 9".into()).into();
        assert_eq!(err.status_code().as_u16(), 404);
    }
}
