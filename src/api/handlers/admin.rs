use crate::api::{
    ApiState,
    error::{ApiError, Envelope, ok},
};
use crate::engine::{RegistryStats, TaskStatus};
use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub(crate) struct RemoveQuery {
    #[serde(default)]
    pub(crate) delete_files: bool,
}

pub(crate) async fn stats(State(state): State<ApiState>) -> Json<Envelope<RegistryStats>> {
    ok(state.registry.get_stats().await)
}

pub(crate) async fn tasks(State(state): State<ApiState>) -> Json<Envelope<Vec<TaskStatus>>> {
    ok(state.registry.list().await)
}

pub(crate) async fn task_action(
    State(state): State<ApiState>,
    Path((hash, action)): Path<(String, String)>,
) -> Result<Json<Envelope<TaskStatus>>, ApiError> {
    let registry = &state.registry;
    match action.as_str() {
        "start" => registry.start(&hash).await?,
        "pause" => registry.pause(&hash).await?,
        "resume" => registry.resume(&hash).await?,
        "stop" => registry.stop(&hash).await?,
        other => return Err(ApiError::bad_request(format!("unknown action '{other}'"))),
    }
    Ok(ok(registry.task(&hash).await?.status()))
}

pub(crate) async fn remove_task(
    State(state): State<ApiState>,
    Path(hash): Path<String>,
    Query(q): Query<RemoveQuery>,
) -> Result<Json<Envelope<bool>>, ApiError> {
    state.registry.remove_task(&hash, q.delete_files).await?;
    Ok(ok(true))
}
