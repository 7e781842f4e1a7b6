use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use mc_infra::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,

    #[error(transparent)]
    Infra(#[from] mc_infra::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Infra(e) => match e.kind() {
                ErrorKind::ConfigDecode | ErrorKind::InvalidSpec => StatusCode::BAD_REQUEST,
                ErrorKind::InstanceNotFound => StatusCode::NOT_FOUND,
                ErrorKind::CreateRejected => StatusCode::UNPROCESSABLE_ENTITY,
                ErrorKind::ConfirmationTimeout => StatusCode::GATEWAY_TIMEOUT,
                ErrorKind::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
                ErrorKind::BackendTransport => StatusCode::BAD_GATEWAY,
                ErrorKind::KeypairCorrupt | ErrorKind::Internal => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    fn kind(&self) -> serde_json::Value {
        match self {
            ApiError::Unauthorized => "unauthorized".into(),
            ApiError::Infra(e) => serde_json::to_value(e.kind()).unwrap_or_default(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %self, "request failed");
        }

        let body = serde_json::json!({ "error": self.to_string(), "kind": self.kind() });
        (status, axum::Json(body)).into_response()
    }
}
