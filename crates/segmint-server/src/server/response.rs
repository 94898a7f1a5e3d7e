//! Response types and the error-to-status mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use segmint::routing::RoutingHint;
use segmint::{Error, Issued};
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub ids: Vec<i64>,
    pub business_type: String,
    pub time_key: String,
    /// Interval class the batch was issued from: 0 = even, 1 = odd.
    pub shard_type: i16,
    pub node_id: String,
    pub timestamp_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing: Option<RoutingHint>,
}

impl GenerateResponse {
    pub fn from_issued(issued: Issued, routing: Option<RoutingHint>) -> Self {
        Self {
            shard_type: issued.role.code(),
            ids: issued.ids,
            business_type: issued.business_type,
            time_key: issued.time_key,
            node_id: issued.node_id,
            timestamp_ms: issued.timestamp_ms,
            routing,
        }
    }
}

/// Flattened single-ID response of `GET /api/id/single/{business_type}`.
#[derive(Debug, Serialize)]
pub struct SingleIdResponse {
    pub id: i64,
    pub business_type: String,
    pub time_key: String,
    pub shard_type: i16,
    pub node_id: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub timestamp_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct DeletedResponse {
    pub deleted: u64,
}

#[derive(Debug, Serialize)]
pub struct RecoveredResponse {
    pub recovered: Vec<String>,
    pub count: usize,
}

/// An error shaped for the wire: `{ "error": ..., "message": ... }`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "validation",
            message: message.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let (status, kind) = match &err {
            Error::Validation { .. } => (StatusCode::BAD_REQUEST, "validation"),
            Error::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "store"),
            Error::SegmentRace { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "segment_race"),
            Error::RefillFailed { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "refill_failed"),
            Error::CorruptSegment { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "corrupt_segment"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        Self {
            status,
            kind,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(kind = self.kind, message = %self.message, "request failed");
        }
        (
            self.status,
            Json(json!({ "error": self.kind, "message": self.message })),
        )
            .into_response()
    }
}
