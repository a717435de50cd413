//! The Event Store (§4.A): a relational store with atomic transactions, unique
//! constraints, and upsert semantics. Backed by SQLite in WAL mode, following
//! the teacher's `storage/mod.rs` connection and migration pattern.

pub mod rows;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rows::*;
use serde_json::Value;
use sqlx::{sqlite::SqliteConnectOptions, Sqlite, SqlitePool, Transaction};
use std::str::FromStr;

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        for stmt in include_str!("migrations/001_init.sql").split(';') {
            let stmt = stmt.trim();
            if !stmt.is_empty() {
                sqlx::query(stmt).execute(pool).await?;
            }
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'_, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    // ─── Events (dedup gate, §4.F step 1) ───────────────────────────────────

    /// Insert the event row if its id has never been seen. Returns `true` if
    /// this call inserted a new row (i.e. the event is novel), `false` if it
    /// is a duplicate delivery.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_event_if_new(
        tx: &mut Transaction<'_, Sqlite>,
        id: &str,
        kind: &str,
        timestamp: DateTime<Utc>,
        device_id: &str,
        workspace_id: &str,
        session_id: Option<&str>,
        data: &Value,
        blob_refs: &[String],
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO events (id, kind, timestamp, device_id, workspace_id, session_id, data, blob_refs, ingested_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(id)
        .bind(kind)
        .bind(timestamp)
        .bind(device_id)
        .bind(workspace_id)
        .bind(session_id)
        .bind(data.to_string())
        .bind(serde_json::to_string(blob_refs)?)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Rewrite the stored event's `workspace_id` to the system-assigned id
    /// once the workspace has been resolved (§4.F step 2).
    pub async fn rewrite_event_workspace(
        tx: &mut Transaction<'_, Sqlite>,
        event_id: &str,
        workspace_id: &str,
    ) -> Result<()> {
        sqlx::query("UPDATE events SET workspace_id = ? WHERE id = ?")
            .bind(workspace_id)
            .bind(event_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    // ─── Workspaces ──────────────────────────────────────────────────────────

    pub async fn find_workspace_by_canonical(
        tx: &mut Transaction<'_, Sqlite>,
        canonical_id: &str,
    ) -> Result<Option<WorkspaceRow>> {
        Ok(
            sqlx::query_as("SELECT * FROM workspaces WHERE canonical_id = ?")
                .bind(canonical_id)
                .fetch_optional(&mut **tx)
                .await?,
        )
    }

    /// Upsert the workspace for `canonical_id`. `display_name` is only used on
    /// first insert (§3 invariant: display_name may drift but canonical_id
    /// must not — and here the reverse: canonical_id is the key, display_name
    /// is set once and never overwritten by this call).
    pub async fn upsert_workspace(
        tx: &mut Transaction<'_, Sqlite>,
        canonical_id: &str,
        display_name: &str,
    ) -> Result<WorkspaceRow> {
        if let Some(existing) = Self::find_workspace_by_canonical(tx, canonical_id).await? {
            return Ok(existing);
        }
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO workspaces (id, canonical_id, display_name, first_seen_at, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (canonical_id) DO NOTHING",
        )
        .bind(&id)
        .bind(canonical_id)
        .bind(display_name)
        .bind(now)
        .bind(now)
        .execute(&mut **tx)
        .await?;
        Self::find_workspace_by_canonical(tx, canonical_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("workspace vanished after upsert"))
    }

    // ─── Devices ─────────────────────────────────────────────────────────────

    pub async fn upsert_device(
        tx: &mut Transaction<'_, Sqlite>,
        device_id: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<DeviceRow> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO devices (id, status, first_seen_at, last_seen_at)
             VALUES (?, 'online', ?, ?)
             ON CONFLICT (id) DO UPDATE SET
                last_seen_at = CASE WHEN excluded.last_seen_at > devices.last_seen_at
                                     THEN excluded.last_seen_at ELSE devices.last_seen_at END",
        )
        .bind(device_id)
        .bind(now)
        .bind(seen_at)
        .execute(&mut **tx)
        .await?;
        Ok(
            sqlx::query_as("SELECT * FROM devices WHERE id = ?")
                .bind(device_id)
                .fetch_one(&mut **tx)
                .await?,
        )
    }

    pub async fn upsert_workspace_device_link(
        tx: &mut Transaction<'_, Sqlite>,
        workspace_id: &str,
        device_id: &str,
        last_active_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO workspace_devices (workspace_id, device_id, last_active_at)
             VALUES (?, ?, ?)
             ON CONFLICT (workspace_id, device_id) DO UPDATE SET
                last_active_at = CASE WHEN excluded.last_active_at > workspace_devices.last_active_at
                                       THEN excluded.last_active_at ELSE workspace_devices.last_active_at END",
        )
        .bind(workspace_id)
        .bind(device_id)
        .bind(last_active_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    // ─── Sessions ────────────────────────────────────────────────────────────

    pub async fn find_session_by_correlation(
        tx: &mut Transaction<'_, Sqlite>,
        device_id: &str,
        cc_session_id: &str,
    ) -> Result<Option<SessionRow>> {
        Ok(sqlx::query_as(
            "SELECT * FROM sessions WHERE device_id = ? AND cc_session_id = ?",
        )
        .bind(device_id)
        .bind(cc_session_id)
        .fetch_optional(&mut **tx)
        .await?)
    }

    pub async fn get_workspace(&self, id: &str) -> Result<Option<WorkspaceRow>> {
        Ok(sqlx::query_as("SELECT * FROM workspaces WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Set the transcript key outside of a processor transaction (upload
    /// endpoint path, §6 Transcript upload HTTP).
    pub async fn set_session_transcript_key_direct(&self, session_id: &str, key: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET transcript_s3_key = COALESCE(transcript_s3_key, ?) WHERE id = ?")
            .bind(key)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<SessionRow>> {
        Ok(sqlx::query_as("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// `session.start` handler core: insert-if-absent, never regress fields on
    /// a replay (§4.F `session.start` contract).
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_session_start(
        tx: &mut Transaction<'_, Sqlite>,
        workspace_id: &str,
        device_id: &str,
        cc_session_id: &str,
        started_at: DateTime<Utc>,
        cwd: &str,
        git_branch: &str,
        git_remote: Option<&str>,
        model: Option<&str>,
        cc_version: Option<&str>,
        initial_prompt: Option<&str>,
    ) -> Result<SessionRow> {
        if let Some(existing) =
            Self::find_session_by_correlation(tx, device_id, cc_session_id).await?
        {
            // Replay of session.start: fill only currently-null fields, never
            // regress lifecycle (it is already >= detected).
            sqlx::query(
                "UPDATE sessions SET
                    started_at = COALESCE(started_at, ?),
                    cwd = COALESCE(cwd, ?),
                    git_branch = COALESCE(git_branch, ?),
                    git_remote = COALESCE(git_remote, ?),
                    model = COALESCE(model, ?),
                    cc_version = COALESCE(cc_version, ?),
                    initial_prompt = COALESCE(initial_prompt, ?)
                 WHERE id = ?",
            )
            .bind(started_at)
            .bind(cwd)
            .bind(git_branch)
            .bind(git_remote)
            .bind(model)
            .bind(cc_version)
            .bind(initial_prompt)
            .bind(&existing.id)
            .execute(&mut **tx)
            .await?;
            return Self::get_session_tx(tx, &existing.id).await;
        }

        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO sessions
                (id, workspace_id, device_id, cc_session_id, lifecycle, lifecycle_ordinal,
                 started_at, cwd, git_branch, git_remote, model, cc_version,
                 initial_prompt)
             VALUES (?, ?, ?, ?, 'detected', ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(workspace_id)
        .bind(device_id)
        .bind(cc_session_id)
        .bind(ORD_DETECTED)
        .bind(started_at)
        .bind(cwd)
        .bind(git_branch)
        .bind(git_remote)
        .bind(model)
        .bind(cc_version)
        .bind(initial_prompt)
        .execute(&mut **tx)
        .await?;
        Self::get_session_tx(tx, &id).await
    }

    /// Find the session by correlation key, or create a bare `detected` row
    /// if absent. Used by `session.end` so an out-of-order delivery (end
    /// before start) still produces a correct terminal state once the start
    /// event eventually arrives and fills in the non-null fields (§5
    /// ordering guarantees).
    pub async fn ensure_session(
        tx: &mut Transaction<'_, Sqlite>,
        workspace_id: &str,
        device_id: &str,
        cc_session_id: &str,
    ) -> Result<SessionRow> {
        if let Some(existing) = Self::find_session_by_correlation(tx, device_id, cc_session_id).await? {
            return Ok(existing);
        }
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO sessions (id, workspace_id, device_id, cc_session_id, lifecycle, lifecycle_ordinal)
             VALUES (?, ?, ?, ?, 'detected', ?)",
        )
        .bind(&id)
        .bind(workspace_id)
        .bind(device_id)
        .bind(cc_session_id)
        .bind(ORD_DETECTED)
        .execute(&mut **tx)
        .await?;
        Self::get_session_tx(tx, &id).await
    }

    async fn get_session_tx(tx: &mut Transaction<'_, Sqlite>, id: &str) -> Result<SessionRow> {
        Ok(sqlx::query_as("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_one(&mut **tx)
            .await?)
    }

    /// Enforce the lifecycle monotone rule (§3, §4.F). Returns whether the
    /// transition was applied.
    pub async fn transition_lifecycle(
        tx: &mut Transaction<'_, Sqlite>,
        session_id: &str,
        new_lifecycle: &str,
    ) -> Result<bool> {
        let new_ordinal = lifecycle_ordinal(new_lifecycle);
        let result = sqlx::query(
            "UPDATE sessions SET lifecycle = ?, lifecycle_ordinal = ?
             WHERE id = ?
               AND ? > lifecycle_ordinal
               AND NOT (? = 'failed' AND lifecycle IN ('summarized', 'archived'))",
        )
        .bind(new_lifecycle)
        .bind(new_ordinal)
        .bind(session_id)
        .bind(new_ordinal)
        .bind(new_lifecycle)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_session_end(
        tx: &mut Transaction<'_, Sqlite>,
        session_id: &str,
        ended_at: DateTime<Utc>,
        duration_ms: i64,
        end_reason: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET
                ended_at = COALESCE(ended_at, ?),
                duration_ms = COALESCE(duration_ms, ?),
                end_reason = COALESCE(end_reason, ?)
             WHERE id = ?",
        )
        .bind(ended_at)
        .bind(duration_ms)
        .bind(end_reason)
        .bind(session_id)
        .execute(&mut **tx)
        .await?;
        Self::transition_lifecycle(tx, session_id, "ended").await?;
        Ok(())
    }

    pub async fn set_session_transcript_key(
        tx: &mut Transaction<'_, Sqlite>,
        session_id: &str,
        key: &str,
    ) -> Result<()> {
        sqlx::query("UPDATE sessions SET transcript_s3_key = COALESCE(transcript_s3_key, ?) WHERE id = ?")
            .bind(key)
            .bind(session_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    pub async fn increment_commit_count(
        tx: &mut Transaction<'_, Sqlite>,
        session_id: &str,
    ) -> Result<()> {
        sqlx::query("UPDATE sessions SET commit_count = commit_count + 1 WHERE id = ?")
            .bind(session_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    pub async fn set_parse_status(&self, session_id: &str, status: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET parse_status = ? WHERE id = ?")
            .bind(status)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_session_failed(&self, session_id: &str, parse_error: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE sessions SET lifecycle = 'failed', lifecycle_ordinal = ?, parse_status = 'failed', parse_error = ?
             WHERE id = ? AND lifecycle NOT IN ('summarized', 'archived')",
        )
        .bind(ORD_FAILED)
        .bind(parse_error)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_session_summary(&self, session_id: &str, summary: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE sessions SET summary = ? WHERE id = ?")
            .bind(summary)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        Self::transition_lifecycle(&mut tx, session_id, "summarized").await?;
        tx.commit().await?;
        Ok(())
    }

    // ─── Git activity ────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_git_activity(
        tx: &mut Transaction<'_, Sqlite>,
        id: &str,
        workspace_id: &str,
        device_id: &str,
        session_id: Option<&str>,
        kind: &str,
        branch: Option<&str>,
        commit_sha: Option<&str>,
        message: Option<&str>,
        files_changed: Option<i64>,
        insertions: Option<i64>,
        deletions: Option<i64>,
        timestamp: DateTime<Utc>,
        data: &Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO git_activity
                (id, workspace_id, device_id, session_id, type, branch, commit_sha, message,
                 files_changed, insertions, deletions, timestamp, data)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(id)
        .bind(workspace_id)
        .bind(device_id)
        .bind(session_id)
        .bind(kind)
        .bind(branch)
        .bind(commit_sha)
        .bind(message)
        .bind(files_changed)
        .bind(insertions)
        .bind(deletions)
        .bind(timestamp)
        .bind(data.to_string())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    // ─── Transcript persistence (§4.G step 4) ───────────────────────────────

    /// Delete any previously-parsed rows for `session_id` so a reparse is
    /// idempotent (§4.G step 4, §8 property 5).
    pub async fn clear_transcript(
        tx: &mut Transaction<'_, Sqlite>,
        session_id: &str,
    ) -> Result<()> {
        sqlx::query("DELETE FROM content_blocks WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut **tx)
            .await?;
        sqlx::query("DELETE FROM transcript_messages WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut **tx)
            .await?;
        sqlx::query("DELETE FROM parse_errors WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_transcript_message(
        tx: &mut Transaction<'_, Sqlite>,
        session_id: &str,
        line_number: i64,
        ordinal: i64,
        message_type: &str,
        role: Option<&str>,
        model: Option<&str>,
        tokens_in: i64,
        tokens_out: i64,
        cache_read_tokens: i64,
        cache_write_tokens: i64,
        cost_usd: f64,
        presence: (bool, bool, bool, bool),
    ) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO transcript_messages
                (id, session_id, line_number, ordinal, message_type, role, model,
                 tokens_in, tokens_out, cache_read_tokens, cache_write_tokens, cost_usd,
                 has_text, has_thinking, has_tool_use, has_tool_result)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(session_id)
        .bind(line_number)
        .bind(ordinal)
        .bind(message_type)
        .bind(role)
        .bind(model)
        .bind(tokens_in)
        .bind(tokens_out)
        .bind(cache_read_tokens)
        .bind(cache_write_tokens)
        .bind(cost_usd)
        .bind(presence.0)
        .bind(presence.1)
        .bind(presence.2)
        .bind(presence.3)
        .execute(&mut **tx)
        .await?;
        Ok(id)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_content_block(
        tx: &mut Transaction<'_, Sqlite>,
        message_id: &str,
        session_id: &str,
        block_order: i64,
        block_type: &str,
        content_text: Option<&str>,
        thinking_text: Option<&str>,
        tool_name: Option<&str>,
        tool_use_id: Option<&str>,
        tool_input: Option<&str>,
        result_text: Option<&str>,
        result_s3_key: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO content_blocks
                (id, message_id, session_id, block_order, block_type, content_text,
                 thinking_text, tool_name, tool_use_id, tool_input, result_text, result_s3_key)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(message_id)
        .bind(session_id)
        .bind(block_order)
        .bind(block_type)
        .bind(content_text)
        .bind(thinking_text)
        .bind(tool_name)
        .bind(tool_use_id)
        .bind(tool_input)
        .bind(result_text)
        .bind(result_s3_key)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn insert_parse_error(
        tx: &mut Transaction<'_, Sqlite>,
        session_id: &str,
        line_number: i64,
        error: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO parse_errors (session_id, line_number, error) VALUES (?, ?, ?)",
        )
        .bind(session_id)
        .bind(line_number)
        .bind(error)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn write_transcript_stats(
        tx: &mut Transaction<'_, Sqlite>,
        session_id: &str,
        tokens_in: i64,
        tokens_out: i64,
        cache_read_tokens: i64,
        cache_write_tokens: i64,
        cost_usd: f64,
        message_count: i64,
        tool_use_count: i64,
        initial_prompt: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET
                tokens_in = ?, tokens_out = ?, cache_read_tokens = ?, cache_write_tokens = ?,
                cost_usd = ?, message_count = ?, tool_use_count = ?,
                initial_prompt = COALESCE(initial_prompt, ?),
                parse_status = 'completed'
             WHERE id = ?",
        )
        .bind(tokens_in)
        .bind(tokens_out)
        .bind(cache_read_tokens)
        .bind(cache_write_tokens)
        .bind(cost_usd)
        .bind(message_count)
        .bind(tool_use_count)
        .bind(initial_prompt)
        .bind(session_id)
        .execute(&mut **tx)
        .await?;
        Self::transition_lifecycle(tx, session_id, "parsed").await?;
        Ok(())
    }

    // ─── Recovery queries (§4.I) ─────────────────────────────────────────────

    /// Sessions stuck in `ended`/`parsed` with `parse_status` not `completed`/
    /// `failed` for longer than `cooldown`.
    pub async fn find_stuck_sessions(&self, cooldown: chrono::Duration) -> Result<Vec<SessionRow>> {
        let cutoff = Utc::now() - cooldown;
        Ok(sqlx::query_as(
            "SELECT * FROM sessions
             WHERE lifecycle IN ('ended', 'parsed')
               AND parse_status IN ('pending', 'in_progress')
               AND (ended_at IS NULL OR ended_at < ?)",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Sessions parsed but never summarized.
    pub async fn find_unsummarized_sessions(&self) -> Result<Vec<SessionRow>> {
        Ok(sqlx::query_as(
            "SELECT * FROM sessions WHERE lifecycle = 'parsed' AND summary IS NULL",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    // ─── Read-only query surface (out-of-scope thin endpoints, §2) ──────────

    pub async fn list_workspaces(&self) -> Result<Vec<WorkspaceRow>> {
        Ok(
            sqlx::query_as("SELECT * FROM workspaces ORDER BY updated_at DESC")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn list_sessions_for_workspace(&self, workspace_id: &str) -> Result<Vec<SessionRow>> {
        Ok(sqlx::query_as(
            "SELECT * FROM sessions WHERE workspace_id = ? ORDER BY started_at DESC",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}
