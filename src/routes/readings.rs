//! Telemetry intake and reading lookups.
//!
//! Request and response bodies go through `codec` explicitly so the wire shape
//! is decided in one place.

use axum::{
    body::Bytes,
    extract::{rejection::PathRejection, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use tracing::debug;

use super::{rejected, AppState};
use crate::codec;
use crate::error::Result;
use crate::models::{InsertOutcome, SensorReading};

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/v1/data", post(ingest_reading))
        .route("/v1/uplink", post(ingest_uplink))
        .route("/v1/data/{id}", get(get_reading))
        .route("/v1/diagnostics/first-reading", get(get_first_reading))
}

/// Canonical JSON response for one reading.
pub(super) fn reading_response(status: StatusCode, reading: &SensorReading) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        codec::encode(reading),
    )
        .into_response()
}

/// 201 for a new row, 200 with the pre-existing row for a repeat.
fn insert_response(outcome: InsertOutcome) -> Response {
    // ---
    let status = if outcome.is_duplicate() {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    reading_response(status, outcome.reading())
}

async fn ingest_reading(State(state): State<AppState>, body: Bytes) -> Result<Response> {
    // ---
    let reading = codec::decode(&body)?;
    debug!("POST /v1/data - reading for sensor {}", reading.sensor_id);

    let outcome = state.telemetry.insert(reading, &state.cancel()).await?;
    Ok(insert_response(outcome))
}

async fn ingest_uplink(State(state): State<AppState>, body: Bytes) -> Result<Response> {
    // ---
    let reading = codec::decode_uplink(&body)?;
    debug!(
        "POST /v1/uplink - device {} (eui={}, f_cnt={}, confirmed={}, best_rssi={:?})",
        reading.sensor_id,
        reading.raw.dev_eui().unwrap_or("-"),
        reading.raw.frame_counter(),
        reading.raw.confirmed(),
        reading.raw.best_rssi()
    );

    let outcome = state.telemetry.insert(reading, &state.cancel()).await?;
    Ok(insert_response(outcome))
}

async fn get_reading(
    State(state): State<AppState>,
    path: std::result::Result<Path<i64>, PathRejection>,
) -> Result<Response> {
    // ---
    let Path(id) = path.map_err(rejected)?;
    let reading = state.telemetry.by_id(id, &state.cancel()).await?;
    Ok(reading_response(StatusCode::OK, &reading))
}

async fn get_first_reading(State(state): State<AppState>) -> Result<Response> {
    // ---
    let reading = state.telemetry.first(&state.cancel()).await?;
    Ok(reading_response(StatusCode::OK, &reading))
}
