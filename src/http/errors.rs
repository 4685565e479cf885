//! Single conversion point from the core [`Error`] taxonomy to an HTTP
//! response. Nothing else in this module tree matches on `ErrorCode`
//! directly.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::error::{Error, ErrorCode};

/// Map an [`ErrorCode`] onto the HTTP status RFC 6749/OAuth 2.1 conventionally
/// use for it.
fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::InvalidRequest
        | ErrorCode::InvalidGrant
        | ErrorCode::UnsupportedGrantType
        | ErrorCode::UnsupportedResponseType
        | ErrorCode::InvalidScope => StatusCode::BAD_REQUEST,
        ErrorCode::InvalidClient => StatusCode::UNAUTHORIZED,
        ErrorCode::UnauthorizedClient | ErrorCode::AccessDenied => StatusCode::FORBIDDEN,
        ErrorCode::ServerError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Render `err` as the JSON error envelope at the status its code maps to.
pub fn to_response(err: &Error) -> Response {
    let status = status_for(err.code());
    let mut body = json!({
        "error": err.code().as_str(),
        "error_description": err.description(),
        "request_id": err.request_id(),
    });
    if let (Some(details), Some(map)) = (err.details(), body.as_object_mut()) {
        map.insert("details".to_string(), details.clone());
    }
    (status, Json(body)).into_response()
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        to_response(&self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_client_maps_to_401() {
        let response = to_response(&Error::invalid_client("unknown client"));
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn invalid_scope_maps_to_400_and_carries_details() {
        let err = Error::invalid_scope(&["admin:x".to_string()], &["read:x".to_string()], &["admin:x".to_string()]);
        let response = to_response(&err);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn denied_by_policy_maps_to_403() {
        let response = to_response(&Error::denied_by_policy("allow_auth_code"));
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn server_error_maps_to_500() {
        let response = to_response(&Error::server_error());
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
