//! OAuth error taxonomy (§7).
//!
//! Every fallible path in the token authority resolves to an [`Error`], which
//! carries the OAuth 2.1 error code, an optional structured `details`
//! document, and a `request_id` for correlation. A single conversion point
//! (`http::errors::to_response`) maps this taxonomy onto an HTTP status and
//! JSON body; nothing downstream of the core matches on HTTP concepts.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error as ThisError;

/// Result type alias used throughout the core.
pub type Result<T> = std::result::Result<T, Error>;

/// The canonical OAuth 2.1 error codes this service can return, plus the
/// internal `server_error` catch-all (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Malformed or missing fields, wrong content type.
    InvalidRequest,
    /// Unknown client, inactive client, or bad client secret.
    InvalidClient,
    /// Bad/expired authorization code or refresh token, PKCE mismatch, replay.
    InvalidGrant,
    /// This grant type is not permitted for this client.
    UnauthorizedClient,
    /// `grant_type` is not one of the supported values.
    UnsupportedGrantType,
    /// `response_type` is not one of the supported values.
    UnsupportedResponseType,
    /// Requested scope exceeds what the parent/grant allows.
    InvalidScope,
    /// Policy engine or decision gateway denied the request.
    AccessDenied,
    /// Unexpected internal condition; never leaks internals.
    ServerError,
}

impl ErrorCode {
    /// The `error` field value exactly as it appears on the wire.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::InvalidClient => "invalid_client",
            Self::InvalidGrant => "invalid_grant",
            Self::UnauthorizedClient => "unauthorized_client",
            Self::UnsupportedGrantType => "unsupported_grant_type",
            Self::UnsupportedResponseType => "unsupported_response_type",
            Self::InvalidScope => "invalid_scope",
            Self::AccessDenied => "access_denied",
            Self::ServerError => "server_error",
        }
    }
}

/// An OAuth-taxonomy error carrying enough structure for §7/§8 tests to
/// assert on exact detail keys.
#[derive(Debug, ThisError)]
#[error("{code_str}: {message}")]
pub struct Error {
    code: ErrorCode,
    code_str: &'static str,
    message: String,
    details: Option<Value>,
    request_id: String,
}

impl Error {
    /// Build a new error of `code` with a human-readable `message`.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            code_str: code.as_str(),
            message: message.into(),
            details: None,
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Attach a structured details document (e.g. `invalid_scope`'s
    /// `{requested_scopes, available_parent_scopes, exceeded_scopes}`).
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Override the auto-generated request id, e.g. to propagate one from an
    /// inbound `X-Request-Id` header.
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// The OAuth error code.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// The structured details document, if any.
    #[must_use]
    pub fn details(&self) -> Option<&Value> {
        self.details.as_ref()
    }

    /// The correlation id for this error.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// The human-readable description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.message
    }

    // ── Constructors for the common cases ──────────────────────────────

    /// `invalid_request`
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    /// `invalid_client`
    #[must_use]
    pub fn invalid_client(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidClient, message)
    }

    /// `invalid_grant`
    #[must_use]
    pub fn invalid_grant(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidGrant, message)
    }

    /// `unauthorized_client`
    #[must_use]
    pub fn unauthorized_client(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UnauthorizedClient, message)
    }

    /// `unsupported_grant_type`
    #[must_use]
    pub fn unsupported_grant_type(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UnsupportedGrantType, message)
    }

    /// `unsupported_response_type`
    #[must_use]
    pub fn unsupported_response_type(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UnsupportedResponseType, message)
    }

    /// `invalid_scope` with the structured `{requested_scopes,
    /// available_parent_scopes, exceeded_scopes}` detail object (§8 scenario 2).
    #[must_use]
    pub fn invalid_scope(
        requested_scopes: &[String],
        available_parent_scopes: &[String],
        exceeded_scopes: &[String],
    ) -> Self {
        Self::new(ErrorCode::InvalidScope, "requested scope exceeds parent scope").with_details(
            serde_json::json!({
                "requested_scopes": requested_scopes,
                "available_parent_scopes": available_parent_scopes,
                "exceeded_scopes": exceeded_scopes,
            }),
        )
    }

    /// `access_denied: denied_by_policy`
    #[must_use]
    pub fn denied_by_policy(policy_id: impl Into<String>) -> Self {
        let policy_id = policy_id.into();
        Self::new(ErrorCode::AccessDenied, "denied by policy").with_details(serde_json::json!({
            "reason": "denied_by_policy",
            "policy_id": policy_id,
        }))
    }

    /// `server_error`; never carries internal detail in `message`.
    #[must_use]
    pub fn server_error() -> Self {
        Self::new(ErrorCode::ServerError, "internal server error")
    }

    /// `server_error` wrapping a config-loading failure, with the underlying
    /// message attached as structured detail for `config.rs` callers.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::server_error().with_details(serde_json::json!({ "config_error": message.into() }))
    }
}

impl From<jsonwebtoken::errors::Error> for Error {
    fn from(_err: jsonwebtoken::errors::Error) -> Self {
        Self::invalid_grant("token signature or claims verification failed")
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::server_error().with_details(serde_json::json!({ "io_error": err.to_string() }))
    }
}
