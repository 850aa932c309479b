//! `/v1/sensor` resource: registry CRUD plus per-sensor reading queries.

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{readings::reading_response, rejected, AppState};
use crate::error::Result;
use crate::models::{Page, SensorReading, SensorStatus, TimeRange};
use crate::registry::{CreateSensor, SensorMutation};

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/v1/sensor", get(list_sensors).post(create_sensor))
        .route(
            "/v1/sensor/{id}",
            get(get_sensor).put(update_sensor).delete(delete_sensor),
        )
        .route("/v1/sensor/{id}/status", get(get_status))
        .route("/v1/sensor/{id}/latest", get(get_latest))
        .route("/v1/sensor/{id}/data", get(get_sensor_data))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<SensorStatus>,
    page: Option<u32>,
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CreateSensorBody {
    id: Option<String>,
    status: Option<SensorStatus>,
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    readings: Vec<SensorReading>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UpdateSensorBody {
    status: Option<SensorStatus>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    readings: Option<Vec<SensorReading>>,
}

impl UpdateSensorBody {
    fn into_mutations(self) -> Vec<SensorMutation> {
        // ---
        let mut mutations = Vec::new();
        if let Some(status) = self.status {
            mutations.push(SensorMutation::SetStatus(status));
        }
        if self.latitude.is_some() || self.longitude.is_some() {
            mutations.push(SensorMutation::SetLocation {
                latitude: self.latitude,
                longitude: self.longitude,
            });
        }
        if let Some(readings) = self.readings {
            mutations.push(SensorMutation::AppendReadings(readings));
        }
        mutations
    }
}

#[derive(Debug, Deserialize)]
struct DataQuery {
    page: Option<u32>,
    limit: Option<u32>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct StatusResponse {
    id: String,
    status: SensorStatus,
}

async fn list_sensors(
    State(state): State<AppState>,
    query: std::result::Result<Query<ListQuery>, QueryRejection>,
) -> Result<impl IntoResponse> {
    // ---
    let Query(q) = query.map_err(rejected)?;
    let page = Page::new(q.page, q.limit);
    let sensors = state.registry.get_all(q.status, page, &state.cancel()).await?;
    Ok(Json(sensors))
}

async fn get_sensor(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    // ---
    let sensor = state.registry.get_by_id(&id, &state.cancel()).await?;
    Ok(Json(sensor))
}

async fn create_sensor(
    State(state): State<AppState>,
    body: std::result::Result<Json<CreateSensorBody>, JsonRejection>,
) -> Result<impl IntoResponse> {
    // ---
    let Json(body) = body.map_err(rejected)?;
    let req = CreateSensor {
        id: body.id,
        status: body.status,
        latitude: body.latitude,
        longitude: body.longitude,
        readings: body.readings,
    };
    let sensor = state.registry.create(req, &state.cancel()).await?;
    Ok((StatusCode::CREATED, Json(sensor)))
}

async fn update_sensor(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: std::result::Result<Json<UpdateSensorBody>, JsonRejection>,
) -> Result<impl IntoResponse> {
    // ---
    let Json(body) = body.map_err(rejected)?;
    let sensor = state
        .registry
        .update(&id, body.into_mutations(), &state.cancel())
        .await?;
    Ok(Json(sensor))
}

async fn delete_sensor(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    // ---
    state.registry.delete(&id, &state.cancel()).await?;
    info!("DELETE /v1/sensor/{} - done", id);
    Ok(StatusCode::NO_CONTENT)
}

async fn get_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    // ---
    let status = state.registry.get_status(&id, &state.cancel()).await?;
    Ok(Json(StatusResponse { id, status }))
}

async fn get_latest(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    // ---
    let reading = state.telemetry.latest(&id, &state.cancel()).await?;
    Ok(reading_response(StatusCode::OK, &reading))
}

async fn get_sensor_data(
    State(state): State<AppState>,
    Path(id): Path<String>,
    query: std::result::Result<Query<DataQuery>, QueryRejection>,
) -> Result<impl IntoResponse> {
    // ---
    let Query(q) = query.map_err(rejected)?;
    let page = Page::new(q.page, q.limit);
    let range = TimeRange {
        start: q.start_time,
        end: q.end_time,
    };
    let readings = state
        .telemetry
        .by_sensor(&id, page, range, &state.cancel())
        .await?;
    Ok(Json(readings))
}
