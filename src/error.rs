// SPDX-License-Identifier: MIT
//! Control-plane error taxonomy.
//!
//! Every failure that can cross the handler boundary is one of these kinds.
//! The internal kind drives logs and metrics; the external body is always
//! the OpenAI error shape `{"error": {"message", "type"}}` and never leaks
//! node identities, endpoint URLs, or upstream latency.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Which admission layer refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitLayer {
    ApiKey,
    Environment,
    Tenant,
    Global,
}

impl LimitLayer {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitLayer::ApiKey => "api_key",
            LimitLayer::Environment => "environment",
            LimitLayer::Tenant => "tenant",
            LimitLayer::Global => "global",
        }
    }
}

impl std::fmt::Display for LimitLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Internal reason an authentication attempt failed.
///
/// All variants collapse to the same external 401 body so the API is not an
/// oracle for key existence; the variant only drives metrics and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthErrorKind {
    MissingCredential,
    MalformedCredential,
    UnknownKey,
    KeyExpired,
    KeyRevoked,
    TenantSuspended,
}

impl AuthErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthErrorKind::MissingCredential => "missing_credential",
            AuthErrorKind::MalformedCredential => "malformed_credential",
            AuthErrorKind::UnknownKey => "unknown_key",
            AuthErrorKind::KeyExpired => "key_expired",
            AuthErrorKind::KeyRevoked => "key_revoked",
            AuthErrorKind::TenantSuspended => "tenant_suspended",
        }
    }
}

/// Why the scheduler could not produce a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoCapacityReason {
    /// The requested model is unknown, inactive, or served by no node.
    Model,
    /// A region was requested and no node (anywhere) survived filtering.
    Region,
    /// Candidates existed but all failed the health floor.
    Health,
}

impl NoCapacityReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoCapacityReason::Model => "model",
            NoCapacityReason::Region => "region",
            NoCapacityReason::Health => "health",
        }
    }
}

/// The control-plane error taxonomy.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("authentication failed: {0:?}")]
    Auth(AuthErrorKind),

    #[error("rate limited at {layer} layer")]
    RateLimited {
        layer: LimitLayer,
        /// Seconds until the refusing window resets.
        retry_after_secs: u64,
        /// The limit of the refusing counter, for response headers.
        limit: u64,
    },

    #[error("quota exceeded at {layer} layer")]
    QuotaExceeded {
        layer: LimitLayer,
        retry_after_secs: u64,
        limit: u64,
    },

    #[error("no capacity: {reason:?}")]
    NoCapacity { reason: NoCapacityReason },

    #[error("upstream unavailable")]
    UpstreamUnavailable,

    #[error("upstream timeout")]
    UpstreamTimeout,

    #[error("upstream protocol error: {0}")]
    UpstreamProtocolError(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),
}

impl ApiError {
    /// Stable internal kind string — used by logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Auth(_) => "auth",
            ApiError::RateLimited { .. } => "rate_limited",
            ApiError::QuotaExceeded { .. } => "quota_exceeded",
            ApiError::NoCapacity { .. } => "no_capacity",
            ApiError::UpstreamUnavailable => "upstream_unavailable",
            ApiError::UpstreamTimeout => "upstream_timeout",
            ApiError::UpstreamProtocolError(_) => "upstream_protocol_error",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::NotFound(_) => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::Internal(_) => "internal",
            ApiError::DependencyUnavailable(_) => "dependency_unavailable",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Auth(_) => StatusCode::UNAUTHORIZED,
            ApiError::RateLimited { .. } | ApiError::QuotaExceeded { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            ApiError::NoCapacity { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            ApiError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ApiError::UpstreamProtocolError(_) => StatusCode::BAD_GATEWAY,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::DependencyUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// External `"type"` field in the OpenAI error body.
    fn external_type(&self) -> &'static str {
        match self {
            ApiError::Auth(_) => "invalid_api_key",
            ApiError::RateLimited { .. } => "rate_limit_exceeded",
            ApiError::QuotaExceeded { .. } => "quota_exceeded",
            ApiError::NoCapacity { .. } | ApiError::DependencyUnavailable(_) => "overloaded",
            ApiError::UpstreamUnavailable
            | ApiError::UpstreamTimeout
            | ApiError::UpstreamProtocolError(_) => "upstream_error",
            ApiError::InvalidRequest(_) => "invalid_request_error",
            ApiError::NotFound(_) => "not_found_error",
            ApiError::Conflict(_) => "conflict_error",
            ApiError::Internal(_) => "internal_error",
        }
    }

    /// External message. Deliberately generic for everything the caller
    /// cannot act on; specific only where the caller caused the problem.
    fn external_message(&self) -> String {
        match self {
            // One shape for every auth failure — no key-existence oracle.
            ApiError::Auth(_) => {
                "Invalid API key provided. Check the Authorization header.".to_string()
            }
            ApiError::RateLimited {
                layer,
                retry_after_secs,
                ..
            } => format!(
                "Rate limit reached for the {layer} layer. Retry after {retry_after_secs}s."
            ),
            ApiError::QuotaExceeded { layer, .. } => {
                format!("Token quota exhausted for the {layer} layer.")
            }
            ApiError::NoCapacity { .. } => {
                "No capacity is currently available for this model. Retry with backoff."
                    .to_string()
            }
            ApiError::UpstreamUnavailable | ApiError::UpstreamTimeout => {
                "The inference backend did not respond. Retry with backoff.".to_string()
            }
            ApiError::UpstreamProtocolError(_) => {
                "The inference backend returned an invalid response.".to_string()
            }
            ApiError::InvalidRequest(msg) => msg.clone(),
            ApiError::NotFound(what) => format!("{what} not found"),
            ApiError::Conflict(msg) => msg.clone(),
            ApiError::Internal(_) => "Internal server error.".to_string(),
            ApiError::DependencyUnavailable(_) => {
                "The service is temporarily unavailable. Retry with backoff.".to_string()
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": {
                "message": self.external_message(),
                "type": self.external_type(),
            }
        }));

        let mut response = (status, body).into_response();

        // 429s carry Retry-After so well-behaved clients back off correctly.
        if let ApiError::RateLimited {
            retry_after_secs, ..
        }
        | ApiError::QuotaExceeded {
            retry_after_secs, ..
        } = &self
        {
            if let Ok(v) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert("Retry-After", v);
            }
        }

        response
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => ApiError::NotFound("record".to_string()),
            other => ApiError::Internal(anyhow::Error::new(other)),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_variants_share_one_external_shape() {
        let a = ApiError::Auth(AuthErrorKind::UnknownKey);
        let b = ApiError::Auth(AuthErrorKind::KeyRevoked);
        assert_eq!(a.status(), b.status());
        assert_eq!(a.external_type(), b.external_type());
        assert_eq!(a.external_message(), b.external_message());
        // Internal kinds still differ for metrics.
        assert_ne!(
            AuthErrorKind::UnknownKey.as_str(),
            AuthErrorKind::KeyRevoked.as_str()
        );
    }

    #[test]
    fn rate_limited_maps_to_429() {
        let e = ApiError::RateLimited {
            layer: LimitLayer::ApiKey,
            retry_after_secs: 12,
            limit: 100,
        };
        assert_eq!(e.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(e.kind(), "rate_limited");
    }

    #[test]
    fn upstream_kinds_map_to_gateway_codes() {
        assert_eq!(
            ApiError::UpstreamUnavailable.status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::UpstreamTimeout.status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ApiError::UpstreamProtocolError("bad usage".into()).status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
