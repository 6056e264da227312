use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use captioning::CaptionError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Caption(#[from] CaptionError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Caption(CaptionError::ImageDecode { .. }) => StatusCode::BAD_REQUEST,
            ApiError::Caption(CaptionError::InvalidRequest(_)) => StatusCode::BAD_REQUEST,
            ApiError::Caption(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("request failed: {}", self);
        } else {
            tracing::warn!("bad request: {}", self);
        }
        (status, self.to_string()).into_response()
    }
}
