//! HTTP error mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use kudos::KudosError;
use serde_json::json;

/// Engine error as returned from a handler.
#[derive(Debug)]
pub struct ApiError(pub KudosError);

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match &self.0 {
            KudosError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            KudosError::NotFound(_) => StatusCode::NOT_FOUND,
            KudosError::Configuration(_) => StatusCode::UNPROCESSABLE_ENTITY,
            KudosError::Conflict(_) => StatusCode::CONFLICT,
            KudosError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
            KudosError::Notification(_) | KudosError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<KudosError> for ApiError {
    fn from(err: KudosError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (KudosError::InvalidRequest("x".into()), StatusCode::BAD_REQUEST),
            (KudosError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (KudosError::Configuration("x".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (KudosError::Conflict("x".into()), StatusCode::CONFLICT),
            (KudosError::Storage("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (KudosError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).status_code(), status);
        }
    }
}
