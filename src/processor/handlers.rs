//! Per-type handler contracts (§4.F). Each handler is a pure function of
//! `(tx, event)` returning a [`HandlerResult`] describing side-effects the
//! caller must issue only after the enclosing transaction commits.

use crate::event::{Event, EventPayload};
use crate::storage::Storage;
use anyhow::Result;
use sqlx::{Sqlite, Transaction};

#[derive(Debug, Default)]
pub struct HandlerResult {
    /// Session to enqueue into the Transcript Pipeline, if any.
    pub enqueue_transcript: Option<String>,
    /// Session affected by this event, for the post-commit WebSocket broadcast.
    pub session_id: Option<String>,
}

/// Dispatch `event` (already workspace/device normalized) to its handler.
/// Returns `Ok(None)` for `no_handler` (recorded, not a failure).
pub async fn dispatch(
    tx: &mut Transaction<'_, Sqlite>,
    event: &Event,
) -> Result<Option<HandlerResult>> {
    match &event.payload {
        EventPayload::SessionStart(data) => {
            let session = Storage::upsert_session_start(
                tx,
                &event.workspace_id,
                &event.device_id,
                &data.cc_session_id,
                event.timestamp,
                &data.cwd,
                &data.git_branch,
                data.git_remote.as_deref(),
                data.model.as_deref(),
                data.cc_version.as_deref(),
                data.initial_prompt.as_deref(),
            )
            .await?;
            Ok(Some(HandlerResult {
                session_id: Some(session.id),
                ..Default::default()
            }))
        }
        EventPayload::SessionEnd(data) => session_end(tx, event, data).await,
        EventPayload::GitCommit(data) => {
            Storage::insert_git_activity(
                tx,
                &event.id,
                &event.workspace_id,
                &event.device_id,
                event.session_id.as_deref(),
                "commit",
                Some(&data.branch),
                Some(&data.commit_sha),
                Some(&data.message),
                Some(data.files_changed),
                Some(data.additions),
                Some(data.deletions),
                event.timestamp,
                &event.raw,
            )
            .await?;
            bump_commit_count(tx, event).await?;
            Ok(Some(HandlerResult::default()))
        }
        EventPayload::GitPush(data) => {
            Storage::insert_git_activity(
                tx,
                &event.id,
                &event.workspace_id,
                &event.device_id,
                event.session_id.as_deref(),
                "push",
                Some(&data.branch),
                None,
                None,
                None,
                None,
                None,
                event.timestamp,
                &event.raw,
            )
            .await?;
            Ok(Some(HandlerResult::default()))
        }
        EventPayload::GitCheckout(data) => {
            Storage::insert_git_activity(
                tx,
                &event.id,
                &event.workspace_id,
                &event.device_id,
                event.session_id.as_deref(),
                "checkout",
                Some(&data.to),
                None,
                None,
                None,
                None,
                None,
                event.timestamp,
                &event.raw,
            )
            .await?;
            Ok(Some(HandlerResult::default()))
        }
        EventPayload::GitMerge(data) => {
            Storage::insert_git_activity(
                tx,
                &event.id,
                &event.workspace_id,
                &event.device_id,
                event.session_id.as_deref(),
                "merge",
                Some(&data.branch),
                None,
                None,
                None,
                None,
                None,
                event.timestamp,
                &event.raw,
            )
            .await?;
            Ok(Some(HandlerResult::default()))
        }
        // cc.session_start and other informational types: recorded already
        // by the dedup-gate insert; no derived state.
        EventPayload::Informational => Ok(None),
    }
}

async fn session_end(
    tx: &mut Transaction<'_, Sqlite>,
    event: &Event,
    data: &crate::event::SessionEndData,
) -> Result<Option<HandlerResult>> {
    let session = Storage::ensure_session(
        tx,
        &event.workspace_id,
        &event.device_id,
        &data.cc_session_id,
    )
    .await?;

    let duration_ms = if data.duration_ms > 0 {
        data.duration_ms
    } else {
        session
            .started_at
            .as_deref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|started| (event.timestamp - started.with_timezone(&chrono::Utc)).num_milliseconds())
            .unwrap_or(0)
    };

    let end_reason = match data.end_reason {
        crate::event::EndReason::Exit => "exit",
        crate::event::EndReason::Clear => "clear",
        crate::event::EndReason::Logout => "logout",
        crate::event::EndReason::Error => "error",
    };

    Storage::update_session_end(tx, &session.id, event.timestamp, duration_ms, end_reason)
        .await?;

    let mut result = HandlerResult {
        session_id: Some(session.id.clone()),
        ..Default::default()
    };
    let transcript_key: Option<String> = sqlx::query_scalar(
        "SELECT transcript_s3_key FROM sessions WHERE id = ?",
    )
    .bind(&session.id)
    .fetch_one(&mut **tx)
    .await?;
    if transcript_key.is_some() {
        result.enqueue_transcript = Some(session.id);
    }
    Ok(Some(result))
}

async fn bump_commit_count(tx: &mut Transaction<'_, Sqlite>, event: &Event) -> Result<()> {
    if let Some(session_id) = &event.session_id {
        Storage::increment_commit_count(tx, session_id).await?;
    }
    Ok(())
}
