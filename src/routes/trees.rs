//! `/tree` resource: tree records, sensor assignment and the joined
//! sensor/prediction views.

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, put},
    Json, Router,
};
use serde::Deserialize;

use super::{rejected, AppState};
use crate::error::Result;
use crate::models::NewTree;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/tree", get(list_trees).post(create_tree))
        .route("/tree/{id}", get(get_tree))
        .route("/tree/{id}/prediction", get(get_prediction))
        .route("/tree/{id}/data", get(get_tree_readings))
        .route(
            "/tree/{id}/sensor/{sensor_id}",
            put(assign_sensor).delete(unassign_sensor),
        )
}

#[derive(Debug, Default, Deserialize)]
struct SensorDataQuery {
    #[serde(default)]
    sensor_data: bool,
}

type TreePath = std::result::Result<Path<i64>, PathRejection>;
type AssignmentPath = std::result::Result<Path<(i64, String)>, PathRejection>;
type SensorDataParams = std::result::Result<Query<SensorDataQuery>, QueryRejection>;

async fn list_trees(
    State(state): State<AppState>,
    query: SensorDataParams,
) -> Result<impl IntoResponse> {
    // ---
    let Query(q) = query.map_err(rejected)?;
    let trees = state
        .trees
        .get_all_trees(q.sensor_data, &state.cancel())
        .await?;
    Ok(Json(trees))
}

async fn create_tree(
    State(state): State<AppState>,
    body: std::result::Result<Json<NewTree>, JsonRejection>,
) -> Result<impl IntoResponse> {
    // ---
    let Json(tree) = body.map_err(rejected)?;
    let tree = state.trees.create_tree(tree, &state.cancel()).await?;
    Ok((StatusCode::CREATED, Json(tree)))
}

async fn get_tree(
    State(state): State<AppState>,
    path: TreePath,
    query: SensorDataParams,
) -> Result<impl IntoResponse> {
    // ---
    let Path(id) = path.map_err(rejected)?;
    let Query(q) = query.map_err(rejected)?;
    let tree = state
        .trees
        .get_tree(id, q.sensor_data, &state.cancel())
        .await?;
    Ok(Json(tree))
}

async fn get_prediction(
    State(state): State<AppState>,
    path: TreePath,
    query: SensorDataParams,
) -> Result<impl IntoResponse> {
    // ---
    let Path(id) = path.map_err(rejected)?;
    let Query(q) = query.map_err(rejected)?;
    let prediction = state
        .trees
        .get_tree_prediction(id, q.sensor_data, &state.cancel())
        .await?;
    Ok(Json(prediction))
}

async fn get_tree_readings(
    State(state): State<AppState>,
    path: TreePath,
) -> Result<impl IntoResponse> {
    // ---
    let Path(id) = path.map_err(rejected)?;
    let readings = state.telemetry.by_tree(id, &state.cancel()).await?;
    Ok(Json(readings))
}

async fn assign_sensor(
    State(state): State<AppState>,
    path: AssignmentPath,
) -> Result<impl IntoResponse> {
    // ---
    let Path((id, sensor_id)) = path.map_err(rejected)?;
    state
        .trees
        .assign_sensor(id, &sensor_id, &state.cancel())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn unassign_sensor(
    State(state): State<AppState>,
    path: AssignmentPath,
) -> Result<impl IntoResponse> {
    // ---
    let Path((id, sensor_id)) = path.map_err(rejected)?;
    state
        .trees
        .unassign_sensor(id, &sensor_id, &state.cancel())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
