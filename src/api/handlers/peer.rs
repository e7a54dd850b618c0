//! Endpoints other nodes and local tooling call on the bt listener.

use crate::api::{
    ApiState,
    error::{ApiError, Envelope, ok},
};
use crate::engine::manifest::is_hex_digest;
use axum::{
    Json,
    extract::{Query, State},
    http::header,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub(crate) struct ShareQuery {
    pub(crate) infohash_name: String,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub(crate) struct ShareResponse {
    pub(crate) file_name: String,
    pub(crate) content_hash: String,
    pub(crate) uploaded: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DownloadQuery {
    pub(crate) infohash: String,
    #[serde(default)]
    pub(crate) downloadpath: String,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub(crate) struct DownloadResponse {
    pub(crate) content_hash: String,
    pub(crate) download_path: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BlockQuery {
    pub(crate) infohash: String,
    pub(crate) index: usize,
}

pub(crate) async fn hello() -> &'static str {
    "hello"
}

/// Shares `<root>/share/<file>` described by `<root>/share/.torrents/<name>`
/// and publishes the manifest to the tracker.
pub(crate) async fn share_resource(
    State(state): State<ApiState>,
    Query(q): Query<ShareQuery>,
) -> Result<Json<Envelope<ShareResponse>>, ApiError> {
    let name = q.infohash_name.trim();
    if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(ApiError::bad_request(format!("invalid manifest name '{name}'")));
    }
    let path = state.registry.layout().share_manifests_dir().join(name);
    let bytes = tokio::fs::read(&path).await.map_err(|e| ApiError {
        status: if e.kind() == std::io::ErrorKind::NotFound {
            axum::http::StatusCode::NOT_FOUND
        } else {
            axum::http::StatusCode::INTERNAL_SERVER_ERROR
        },
        msg: format!("failed to read '{}': {e}", path.display()),
    })?;

    let (file_name, content_hash) = state.registry.create_share_task(&bytes).await?;
    let uploaded = match &state.tracker {
        Some(tracker) => match tracker.upload_manifest(&content_hash, &bytes).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(
                    content_hash = %crate::logging::redact_hex(&content_hash),
                    error = %err,
                    "manifest upload to tracker failed"
                );
                false
            }
        },
        None => false,
    };
    Ok(ok(ShareResponse {
        file_name,
        content_hash,
        uploaded,
    }))
}

/// Fetches the manifest for `infohash` from the tracker and starts downloading it.
pub(crate) async fn download(
    State(state): State<ApiState>,
    Query(q): Query<DownloadQuery>,
) -> Result<Json<Envelope<DownloadResponse>>, ApiError> {
    let content_hash = q.infohash.trim().to_ascii_lowercase();
    if !is_hex_digest(&content_hash, 32) {
        return Err(ApiError::bad_request("infohash must be 32 hex chars"));
    }
    let Some(tracker) = &state.tracker else {
        return Err(ApiError::unavailable("tracker is disabled"));
    };
    let manifest = tracker.fetch_manifest(&content_hash).await?;
    state
        .registry
        .create_download_task(&content_hash, &q.downloadpath, &manifest)
        .await?;
    Ok(ok(DownloadResponse {
        content_hash,
        download_path: q.downloadpath,
    }))
}

pub(crate) async fn block(
    State(state): State<ApiState>,
    Query(q): Query<BlockQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let data = state.registry.read_block(&q.infohash, q.index).await?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], data))
}
