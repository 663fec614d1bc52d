//! JSON error payloads.
//!
//! Domain errors keep HTTP 200 and carry the message in the body; clients
//! branch on the presence of `error`. Only a failed auth gate changes the status.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use mosaic_core::MosaicError;
use serde_json::json;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    /// `{"error": msg}`
    Plain,
    /// `{"success": false, "error": msg}`
    Outcome,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    shape: Shape,
    message: String,
}

impl ApiError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::from(MosaicError::Validation(message.into()))
    }

    pub fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            shape: Shape::Plain,
            message: "Invalid authentication token".to_string(),
        }
    }

    /// Switch to the `{success: false, error}` shape used by the task action routes.
    pub fn as_outcome(mut self) -> Self {
        self.shape = Shape::Outcome;
        self
    }
}

impl From<MosaicError> for ApiError {
    fn from(err: MosaicError) -> Self {
        if matches!(
            err,
            MosaicError::Io(_) | MosaicError::Serialization(_) | MosaicError::Archive(_)
        ) {
            warn!(error = %err, "request failed");
        }
        Self {
            status: StatusCode::OK,
            shape: Shape::Plain,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match self.shape {
            Shape::Plain => json!({ "error": self.message }),
            Shape::Outcome => json!({ "success": false, "error": self.message }),
        };
        (self.status, Json(body)).into_response()
    }
}
