use crate::engine::{EngineError, ErrorKind};
use crate::tracker::TrackerError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// Body of every JSON answer: `status` is `0` on success and `-1` on error.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub(crate) struct Envelope<T: Serialize> {
    pub(crate) status: i32,
    pub(crate) msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) result: Option<T>,
}

pub(crate) fn ok<T: Serialize>(result: T) -> Json<Envelope<T>> {
    Json(Envelope {
        status: 0,
        msg: "ok".to_string(),
        result: Some(result),
    })
}

pub(crate) fn status_for_kind(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Duplicate | ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Capacity => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Io | ErrorKind::Parse => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Debug)]
pub(crate) struct ApiError {
    pub(crate) status: StatusCode,
    pub(crate) msg: String,
}

impl ApiError {
    pub(crate) fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            msg: msg.into(),
        }
    }

    pub(crate) fn unavailable(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            msg: msg.into(),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = status_for_kind(err.kind());
        if status.is_server_error() {
            tracing::warn!(error = %err, "request failed");
        }
        Self {
            status,
            msg: err.to_string(),
        }
    }
}

impl From<TrackerError> for ApiError {
    fn from(err: TrackerError) -> Self {
        let status = match err {
            TrackerError::Rejected(_) | TrackerError::Status(404) => StatusCode::NOT_FOUND,
            _ => StatusCode::BAD_GATEWAY,
        };
        Self {
            status,
            msg: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Envelope::<()> {
            status: -1,
            msg: self.msg,
            result: None,
        };
        (self.status, Json(body)).into_response()
    }
}
