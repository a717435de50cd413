//! `sqlx::FromRow` row types (teacher precedent: `storage::SessionRow` et al.).

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct WorkspaceRow {
    pub id: String,
    pub canonical_id: String,
    pub display_name: String,
    pub default_branch: Option<String>,
    pub metadata: String,
    pub first_seen_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct DeviceRow {
    pub id: String,
    #[sqlx(rename = "type")]
    pub kind: String,
    pub name: Option<String>,
    pub status: String,
    pub platform: Option<String>,
    pub metadata: String,
    pub first_seen_at: String,
    pub last_seen_at: String,
}

/// Lifecycle ordinal constants (§3). `failed` is absorbing except from the
/// two terminal-success states.
pub const ORD_DETECTED: i64 = 0;
pub const ORD_CAPTURING: i64 = 1;
pub const ORD_ENDED: i64 = 2;
pub const ORD_PARSED: i64 = 3;
pub const ORD_SUMMARIZED: i64 = 4;
pub const ORD_ARCHIVED: i64 = 5;
pub const ORD_FAILED: i64 = 99;

pub fn lifecycle_ordinal(lifecycle: &str) -> i64 {
    match lifecycle {
        "detected" => ORD_DETECTED,
        "capturing" => ORD_CAPTURING,
        "ended" => ORD_ENDED,
        "parsed" => ORD_PARSED,
        "summarized" => ORD_SUMMARIZED,
        "archived" => ORD_ARCHIVED,
        "failed" => ORD_FAILED,
        other => panic!("unknown lifecycle state: {other}"),
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct SessionRow {
    pub id: String,
    pub workspace_id: String,
    pub device_id: String,
    pub cc_session_id: String,
    pub lifecycle: String,
    pub lifecycle_ordinal: i64,
    pub parse_status: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub duration_ms: Option<i64>,
    pub end_reason: Option<String>,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cache_read_tokens: i64,
    pub cache_write_tokens: i64,
    pub cost_usd: f64,
    pub message_count: i64,
    pub tool_use_count: i64,
    pub commit_count: i64,
    pub model: Option<String>,
    pub git_branch: Option<String>,
    pub git_remote: Option<String>,
    pub cc_version: Option<String>,
    pub cwd: Option<String>,
    pub summary: Option<String>,
    pub transcript_s3_key: Option<String>,
    pub initial_prompt: Option<String>,
    pub parse_error: Option<String>,
    pub tags: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventRow {
    pub id: String,
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub workspace_id: String,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct GitActivityRow {
    pub id: String,
    pub workspace_id: String,
    pub device_id: String,
    pub session_id: Option<String>,
    #[sqlx(rename = "type")]
    pub kind: String,
    pub branch: Option<String>,
    pub commit_sha: Option<String>,
    pub message: Option<String>,
    pub files_changed: Option<i64>,
    pub insertions: Option<i64>,
    pub deletions: Option<i64>,
    pub timestamp: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TranscriptMessageRow {
    pub id: String,
    pub session_id: String,
    pub ordinal: i64,
}
