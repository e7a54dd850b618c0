use axum::{
    Router,
    routing::{delete, get, post},
};

use crate::api::{
    ApiState,
    handlers::{block, download, hello, remove_task, share_resource, stats, task_action, tasks},
};

/// Peer-facing listener: block serving plus the share/download triggers.
pub(crate) fn build_bt_app(state: ApiState) -> Router<()> {
    Router::new()
        .route("/hello", get(hello))
        .route("/api/share/resource", get(share_resource))
        .route("/api/download", get(download))
        .route("/api/block", get(block))
        .with_state(state)
}

pub(crate) fn build_admin_app(state: ApiState) -> Router<()> {
    Router::new()
        .route("/hello", get(hello))
        .route("/api/stats", get(stats))
        .route("/api/tasks", get(tasks))
        .route("/api/tasks/:hash/:action", post(task_action))
        .route("/api/tasks/:hash", delete(remove_task))
        .with_state(state)
}
