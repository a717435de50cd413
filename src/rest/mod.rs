//! Out-of-scope thin query endpoints plus `/health` and the transcript
//! upload endpoint (§6). Kept deliberately thin, delegating to `storage` and
//! `objectstore` rather than growing business logic here.

use crate::ingest::tokens_equal;
use crate::objectstore::transcript_key;
use crate::storage::rows::ORD_ENDED;
use crate::AppContext;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;

pub fn router() -> Router<AppContext> {
    Router::new()
        .route("/health", get(health))
        .route("/workspaces", get(list_workspaces))
        .route("/workspaces/{id}/sessions", get(list_sessions))
        .route("/sessions/{id}", get(get_session))
        .route("/sessions/{id}/transcript/upload", post(upload_transcript))
}

async fn health(State(ctx): State<AppContext>) -> (StatusCode, Json<serde_json::Value>) {
    let db_ok = ctx.storage.health_check().await;
    let queue_ok = ctx.queue.ping().await;
    let healthy = db_ok && queue_ok;
    let status_code = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    let status = if healthy { "ok" } else { "degraded" };
    (status_code, Json(json!({ "status": status, "database": db_ok, "queue": queue_ok })))
}

async fn list_workspaces(State(ctx): State<AppContext>) -> Result<Json<serde_json::Value>, StatusCode> {
    let workspaces = ctx
        .storage
        .list_workspaces()
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    Ok(Json(json!({ "workspaces": workspaces })))
}

async fn list_sessions(
    State(ctx): State<AppContext>,
    Path(workspace_id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let sessions = ctx
        .storage
        .list_sessions_for_workspace(&workspace_id)
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    Ok(Json(json!({ "sessions": sessions })))
}

async fn get_session(
    State(ctx): State<AppContext>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let session = ctx
        .storage
        .get_session(&session_id)
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(json!({ "session": session })))
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    status: &'static str,
    s3_key: String,
    pipeline_triggered: bool,
}

async fn upload_transcript(
    State(ctx): State<AppContext>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<UploadResponse>), StatusCode> {
    if !tokens_equal(
        headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .unwrap_or(""),
        &ctx.config.api_key,
    ) {
        return Err(StatusCode::UNAUTHORIZED);
    }

    let content_length: usize = headers
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if content_length == 0 {
        return Err(StatusCode::BAD_REQUEST);
    }

    let session = ctx
        .storage
        .get_session(&session_id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;

    if let Some(existing_key) = session.transcript_s3_key.clone() {
        return Ok((
            StatusCode::OK,
            Json(UploadResponse {
                status: "already_uploaded",
                s3_key: existing_key,
                pipeline_triggered: false,
            }),
        ));
    }

    let workspace_canonical = ctx
        .storage
        .get_workspace(&session.workspace_id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .map(|w| w.canonical_id)
        .unwrap_or_else(|| "_unassociated".to_string());

    let key = transcript_key(&workspace_canonical, &session_id);
    ctx.objects
        .put(&key, &body)
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;

    ctx.storage
        .set_session_transcript_key_direct(&session_id, &key)
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;

    let pipeline_triggered = session.lifecycle_ordinal >= ORD_ENDED;
    if pipeline_triggered {
        ctx.pipeline.enqueue(session_id).await;
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(UploadResponse {
            status: "uploaded",
            s3_key: key,
            pipeline_triggered,
        }),
    ))
}
