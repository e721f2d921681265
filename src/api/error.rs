//! Structured error type for all HTTP handlers.
//!
//! Each variant maps to an HTTP status, a machine-readable code string, and
//! a human-readable message, and implements [`IntoResponse`] so handlers
//! return `Result<T, ApiError>` directly.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::sessions::SessionError;

#[derive(Debug)]
pub enum ApiError {
    /// 401: no credentials provided.
    AuthRequired,
    /// 403: credentials provided but wrong.
    AuthInvalid,
    /// 403: browser origin not allowed for a WebSocket upgrade.
    OriginNotAllowed,
    /// 404: unknown session id.
    SessionNotFound(String),
    /// 400: malformed request.
    InvalidRequest(String),
    /// 503: session could not be created or reached.
    SessionUnavailable(String),
    /// 500: everything else.
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::AuthRequired => StatusCode::UNAUTHORIZED,
            Self::AuthInvalid | Self::OriginNotAllowed => StatusCode::FORBIDDEN,
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::SessionUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthRequired => "auth_required",
            Self::AuthInvalid => "auth_invalid",
            Self::OriginNotAllowed => "origin_not_allowed",
            Self::SessionNotFound(_) => "session_not_found",
            Self::InvalidRequest(_) => "invalid_request",
            Self::SessionUnavailable(_) => "session_unavailable",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::AuthRequired => {
                "Authentication required. Provide a bearer token or a WebSocket ticket."
                    .to_string()
            }
            Self::AuthInvalid => "Invalid authentication token.".to_string(),
            Self::OriginNotAllowed => "Origin not allowed.".to_string(),
            Self::SessionNotFound(id) => format!("Session not found: {id}."),
            Self::InvalidRequest(detail) => format!("Invalid request: {detail}."),
            Self::SessionUnavailable(detail) => format!("Session unavailable: {detail}."),
            Self::Internal(detail) => format!("Internal error: {detail}."),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(id) => Self::SessionNotFound(id),
            SessionError::InvalidDimensions(cols, rows) => {
                Self::InvalidRequest(format!("dimensions {cols}x{rows} out of range"))
            }
            SessionError::Unavailable(detail) => Self::SessionUnavailable(detail),
            SessionError::Ipc(e) => Self::SessionUnavailable(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;

    async fn response_parts(err: ApiError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let body = Body::new(response.into_body())
            .collect()
            .await
            .unwrap()
            .to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        (status, json)
    }

    #[tokio::test]
    async fn auth_required_maps_to_401() {
        let (status, json) = response_parts(ApiError::AuthRequired).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["error"]["code"], "auth_required");
    }

    #[tokio::test]
    async fn auth_invalid_maps_to_403() {
        let (status, json) = response_parts(ApiError::AuthInvalid).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(json["error"]["code"], "auth_invalid");
    }

    #[tokio::test]
    async fn origin_not_allowed_maps_to_403() {
        let (status, json) = response_parts(ApiError::OriginNotAllowed).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(json["error"]["code"], "origin_not_allowed");
    }

    #[tokio::test]
    async fn session_not_found_includes_id() {
        let (status, json) =
            response_parts(ApiError::SessionNotFound("abcd1234".into())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"]["code"], "session_not_found");
        assert_eq!(json["error"]["message"], "Session not found: abcd1234.");
    }

    #[tokio::test]
    async fn unavailable_maps_to_503() {
        let (status, json) =
            response_parts(ApiError::SessionUnavailable("spawn failed".into())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["error"]["code"], "session_unavailable");
    }

    #[tokio::test]
    async fn invalid_request_maps_to_400() {
        let (status, json) =
            response_parts(ApiError::InvalidRequest("bad dims".into())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["message"], "Invalid request: bad dims.");
    }

    #[tokio::test]
    async fn session_error_conversion() {
        let err: ApiError = SessionError::NotFound("xyzw9876".into()).into();
        assert!(matches!(err, ApiError::SessionNotFound(ref id) if id == "xyzw9876"));

        let err: ApiError = SessionError::InvalidDimensions(0, 24).into();
        assert!(matches!(err, ApiError::InvalidRequest(_)));

        let err: ApiError = SessionError::Unavailable("limit".into()).into();
        assert!(matches!(err, ApiError::SessionUnavailable(_)));
    }

    #[tokio::test]
    async fn response_shape_and_content_type() {
        let response = ApiError::AuthRequired.into_response();
        let ct = response.headers().get("content-type").unwrap();
        assert!(ct.to_str().unwrap().contains("application/json"));

        let (_, json) = response_parts(ApiError::Internal("x".into())).await;
        assert!(json["error"].get("code").is_some());
        assert!(json["error"].get("message").is_some());
    }
}
