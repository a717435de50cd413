//! The event envelope and per-type payload contracts (§3, §6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Wire envelope as received over `POST /events/ingest`, before the type-indexed
/// schema check. `data` stays a raw [`Value`] until validated into [`EventPayload`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub workspace_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub blob_refs: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("missing required envelope field: {0}")]
    MissingField(&'static str),
    #[error("malformed data payload for event type {kind}: {source}")]
    MalformedData {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStartData {
    pub cc_session_id: String,
    pub cwd: String,
    pub git_branch: String,
    #[serde(default)]
    pub git_remote: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub cc_version: Option<String>,
    pub source: String,
    #[serde(default)]
    pub transcript_path: Option<String>,
    #[serde(default)]
    pub initial_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Exit,
    Clear,
    Logout,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEndData {
    pub cc_session_id: String,
    pub duration_ms: i64,
    pub end_reason: EndReason,
    #[serde(default)]
    pub transcript_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitCommitData {
    pub commit_sha: String,
    pub message: String,
    pub branch: String,
    pub files_changed: i64,
    pub additions: i64,
    pub deletions: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitPushData {
    pub branch: String,
    pub remote: String,
    pub commit_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitCheckoutData {
    pub from: String,
    pub to: String,
    pub branch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitMergeData {
    pub branch: String,
    pub commits_merged: i64,
}

/// The typed payload a [`RawEvent`] carries, indexed by `kind`. Types outside
/// the canonical six are accepted as [`EventPayload::Informational`] — the
/// processor records them but derives no state (§4.F).
#[derive(Debug, Clone)]
pub enum EventPayload {
    SessionStart(SessionStartData),
    SessionEnd(SessionEndData),
    GitCommit(GitCommitData),
    GitPush(GitPushData),
    GitCheckout(GitCheckoutData),
    GitMerge(GitMergeData),
    Informational,
}

/// A validated event ready for the Stream Queue / processor.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: String,
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub workspace_id: String,
    pub session_id: Option<String>,
    pub payload: EventPayload,
    pub blob_refs: Vec<String>,
    pub raw: Value,
}

/// Validate a [`RawEvent`] against the type-indexed schema (§4.D step 1).
pub fn validate(raw: RawEvent) -> Result<Event, ValidationError> {
    if raw.id.trim().is_empty() {
        return Err(ValidationError::MissingField("id"));
    }
    if raw.kind.trim().is_empty() {
        return Err(ValidationError::MissingField("type"));
    }
    if raw.device_id.trim().is_empty() {
        return Err(ValidationError::MissingField("device_id"));
    }
    if raw.workspace_id.trim().is_empty() {
        return Err(ValidationError::MissingField("workspace_id"));
    }

    let payload = decode_payload(&raw.kind, &raw.data)?;

    Ok(Event {
        id: raw.id,
        kind: raw.kind,
        timestamp: raw.timestamp,
        device_id: raw.device_id,
        workspace_id: raw.workspace_id,
        session_id: raw.session_id,
        payload,
        blob_refs: raw.blob_refs,
        raw: raw.data,
    })
}

fn decode_payload(kind: &str, data: &Value) -> Result<EventPayload, ValidationError> {
    let map_err = |source: serde_json::Error| ValidationError::MalformedData {
        kind: kind.to_string(),
        source,
    };
    match kind {
        "session.start" => Ok(EventPayload::SessionStart(
            serde_json::from_value(data.clone()).map_err(map_err)?,
        )),
        "session.end" => Ok(EventPayload::SessionEnd(
            serde_json::from_value(data.clone()).map_err(map_err)?,
        )),
        "git.commit" => Ok(EventPayload::GitCommit(
            serde_json::from_value(data.clone()).map_err(map_err)?,
        )),
        "git.push" => Ok(EventPayload::GitPush(
            serde_json::from_value(data.clone()).map_err(map_err)?,
        )),
        "git.checkout" => Ok(EventPayload::GitCheckout(
            serde_json::from_value(data.clone()).map_err(map_err)?,
        )),
        "git.merge" => Ok(EventPayload::GitMerge(
            serde_json::from_value(data.clone()).map_err(map_err)?,
        )),
        // cc.session_start and any other type: recorded verbatim, no schema.
        _ => Ok(EventPayload::Informational),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(kind: &str, data: Value) -> RawEvent {
        RawEvent {
            id: "01J00000000000000000000000".into(),
            kind: kind.into(),
            timestamp: Utc::now(),
            device_id: "D1".into(),
            workspace_id: "github.com/u/r".into(),
            session_id: None,
            data,
            blob_refs: vec![],
        }
    }

    #[test]
    fn valid_session_start_passes() {
        let e = raw(
            "session.start",
            json!({"cc_session_id": "CC1", "cwd": "/w", "git_branch": "main", "source": "hook"}),
        );
        assert!(validate(e).is_ok());
    }

    #[test]
    fn missing_required_fields_rejected() {
        let e = raw("session.start", json!({}));
        assert!(validate(e).is_err());
    }

    #[test]
    fn unknown_type_is_informational() {
        let e = raw("cc.session_start", json!({"anything": true}));
        let ev = validate(e).unwrap();
        assert!(matches!(ev.payload, EventPayload::Informational));
    }

    #[test]
    fn empty_id_rejected() {
        let mut e = raw("git.push", json!({"branch":"main","remote":"origin","commit_count":1}));
        e.id = "".into();
        assert!(validate(e).is_err());
    }
}
