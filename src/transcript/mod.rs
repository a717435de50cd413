//! The Transcript Pipeline (§4.G): a bounded concurrent worker pool that
//! turns a session with a transcript blob into parsed rows, statistics, and
//! an optional LLM summary. Grounded on the teacher's `ProcessPool` shape
//! (bounded pool + acquire/release bookkeeping), generalized from a PID pool
//! to a session-id work queue with pending-set dedup.

pub mod parser;

use crate::objectstore::{transcript_key, LineStream, ObjectStore};
use crate::storage::rows::SessionRow;
use crate::storage::{rows::ORD_ENDED, Storage};
use crate::summarizer::{SummaryRequest, Summarizer};
use crate::ws::Hub;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

const DOWNLOAD_MAX_RETRIES: u32 = 3;
const DOWNLOAD_BASE_BACKOFF: Duration = Duration::from_secs(1);
const DOWNLOAD_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Placeholder per-model USD rate table; not part of the system's contract
/// (§4.G step 3 — "the rate table is a config artifact").
fn rate_for_model(_model: Option<&str>) -> (f64, f64, f64, f64) {
    (0.000_003, 0.000_015, 0.000_000_3, 0.000_003_75)
}

pub struct TranscriptPipeline {
    pending: Mutex<HashSet<String>>,
    tx: mpsc::Sender<String>,
    rx: Mutex<Option<mpsc::Receiver<String>>>,
    storage: Arc<Storage>,
    objects: Arc<dyn ObjectStore>,
    hub: Arc<Hub>,
    summarizer: Arc<dyn Summarizer>,
    pool_size: usize,
    pending_max: usize,
    summary_enabled: bool,
}

impl TranscriptPipeline {
    pub fn new(
        storage: Arc<Storage>,
        objects: Arc<dyn ObjectStore>,
        hub: Arc<Hub>,
        summarizer: Arc<dyn Summarizer>,
        pool_size: usize,
        pending_max: usize,
        summary_enabled: bool,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(pending_max.max(1));
        Arc::new(Self {
            pending: Mutex::new(HashSet::new()),
            tx,
            rx: Mutex::new(Some(rx)),
            storage,
            objects,
            hub,
            summarizer,
            pool_size,
            pending_max,
            summary_enabled,
        })
    }

    /// Enqueue a session for parsing/summarizing. A session already pending
    /// is a no-op (dedup); a full pending set drops the request and logs it.
    pub async fn enqueue(&self, session_id: String) {
        let mut pending = self.pending.lock().await;
        if pending.contains(&session_id) {
            return;
        }
        if pending.len() >= self.pending_max {
            warn!(session_id, "transcript pipeline pending set full, dropping enqueue");
            return;
        }
        pending.insert(session_id.clone());
        drop(pending);
        if self.tx.send(session_id.clone()).await.is_err() {
            self.pending.lock().await.remove(&session_id);
        }
    }

    /// Spawn the fixed-size worker pool. Call once; workers run for the
    /// lifetime of the process and drain the channel on shutdown.
    pub fn spawn_workers(self: &Arc<Self>) {
        let rx = self
            .rx
            .try_lock()
            .expect("spawn_workers called once at startup")
            .take()
            .expect("workers already spawned");
        let rx = Arc::new(Mutex::new(rx));
        for worker_id in 0..self.pool_size {
            let pipeline = Arc::clone(self);
            let rx = Arc::clone(&rx);
            tokio::spawn(async move {
                loop {
                    let session_id = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(session_id) = session_id else {
                        break;
                    };
                    if let Err(e) = pipeline.process_session(&session_id).await {
                        error!(worker_id, session_id, error = %e, "transcript pipeline stage failed");
                        let _ = pipeline.storage.set_session_failed(&session_id, &e.to_string()).await;
                    }
                    pipeline.pending.lock().await.remove(&session_id);
                }
            });
        }
    }

    async fn process_session(&self, session_id: &str) -> anyhow::Result<()> {
        // 1. Load
        let Some(session) = self.storage.get_session(session_id).await? else {
            return Ok(());
        };
        if session.lifecycle_ordinal < ORD_ENDED {
            return Ok(());
        }

        if session.parse_status != "completed" {
            // Session has no usable transcript yet — nothing to parse, but
            // it may still be eligible for summarize-only recovery below.
            if let Some(key) = &session.transcript_s3_key {
                self.parse_and_persist(&session, key).await?;
            } else {
                return Ok(());
            }
        }

        if self.summary_enabled && session.summary.is_none() {
            self.summarize(&session).await;
        }

        if let Some(updated) = self.storage.get_session(session_id).await? {
            self.hub.broadcast_session_update(&updated).await;
        }
        Ok(())
    }

    async fn parse_and_persist(&self, session: &SessionRow, key: &str) -> anyhow::Result<()> {
        self.storage.set_parse_status(&session.id, "in_progress").await?;

        let lines = match self.open_lines_with_retry(key).await {
            Ok(lines) => lines,
            Err(e) => {
                self.storage
                    .set_session_failed(&session.id, &format!("download failed: {e}"))
                    .await?;
                return Ok(());
            }
        };
        let outcome = parser::parse(lines, &session.id, &self.objects).await?;

        let mut tx = self.storage.begin().await?;
        Storage::clear_transcript(&mut tx, &session.id).await?;

        let mut tokens_in = 0i64;
        let mut tokens_out = 0i64;
        let mut cache_read = 0i64;
        let mut cache_write = 0i64;
        let mut cost_usd = 0.0f64;
        let mut tool_use_count = 0i64;
        let mut initial_prompt: Option<String> = None;

        for (ordinal, message) in (1..).zip(outcome.messages.iter()) {
            let presence = (
                message.blocks.iter().any(|b| b.block_type == "text"),
                message.blocks.iter().any(|b| b.block_type == "thinking"),
                message.blocks.iter().any(|b| b.block_type == "tool_use"),
                message.blocks.iter().any(|b| b.block_type == "tool_result"),
            );
            let message_id = Storage::insert_transcript_message(
                &mut tx,
                &session.id,
                message.line_number,
                ordinal as i64,
                &message.message_type,
                message.role.as_deref(),
                message.model.as_deref(),
                message.tokens_in,
                message.tokens_out,
                message.cache_read_tokens,
                message.cache_write_tokens,
                0.0,
                presence,
            )
            .await?;

            let (rin, rout, rcr, rcw) = rate_for_model(message.model.as_deref());
            cost_usd += message.tokens_in as f64 * rin
                + message.tokens_out as f64 * rout
                + message.cache_read_tokens as f64 * rcr
                + message.cache_write_tokens as f64 * rcw;
            tokens_in += message.tokens_in;
            tokens_out += message.tokens_out;
            cache_read += message.cache_read_tokens;
            cache_write += message.cache_write_tokens;

            for (order, block) in message.blocks.iter().enumerate() {
                if block.block_type == "tool_use" {
                    tool_use_count += 1;
                }
                if initial_prompt.is_none()
                    && message.message_type == "user"
                    && block.block_type == "text"
                {
                    initial_prompt = block.content_text.clone();
                }
                Storage::insert_content_block(
                    &mut tx,
                    &message_id,
                    &session.id,
                    order as i64,
                    block.block_type,
                    block.content_text.as_deref(),
                    block.thinking_text.as_deref(),
                    block.tool_name.as_deref(),
                    block.tool_use_id.as_deref(),
                    block.tool_input.as_deref(),
                    block.result_text.as_deref(),
                    block.result_s3_key.as_deref(),
                )
                .await?;
            }
        }

        for err in &outcome.errors {
            Storage::insert_parse_error(&mut tx, &session.id, err.line_number, &err.error).await?;
        }

        Storage::write_transcript_stats(
            &mut tx,
            &session.id,
            tokens_in,
            tokens_out,
            cache_read,
            cache_write,
            cost_usd,
            outcome.messages.len() as i64,
            tool_use_count,
            initial_prompt.as_deref(),
        )
        .await?;
        tx.commit().await?;

        if !outcome.errors.is_empty() {
            warn!(session_id = %session.id, count = outcome.errors.len(), "transcript parse had line errors");
        }
        info!(session_id = %session.id, messages = outcome.messages.len(), "transcript parsed");
        Ok(())
    }

    /// Opens the streaming reader with retry/backoff around the attempt
    /// itself, so a transient Object Store failure is retried without ever
    /// buffering the blob into memory (§4.G, §8 — parser memory stays
    /// bounded regardless of transcript size).
    async fn open_lines_with_retry(&self, key: &str) -> anyhow::Result<Box<dyn LineStream>> {
        let mut backoff = DOWNLOAD_BASE_BACKOFF;
        let mut last_err = None;
        for attempt in 0..DOWNLOAD_MAX_RETRIES {
            match self.objects.open_lines(key).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    warn!(key, attempt, error = %e, "transcript download attempt failed");
                    last_err = Some(e);
                    if attempt + 1 < DOWNLOAD_MAX_RETRIES {
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(DOWNLOAD_MAX_BACKOFF);
                    }
                }
            }
        }
        Err(last_err.unwrap())
    }

    async fn summarize(&self, session: &SessionRow) {
        let transcript_text = match &session.transcript_s3_key {
            Some(key) => self
                .objects
                .get(key)
                .await
                .map(|b| String::from_utf8_lossy(&b).into_owned())
                .unwrap_or_default(),
            None => String::new(),
        };
        let request = SummaryRequest::new(
            session.id.clone(),
            session.initial_prompt.clone(),
            &transcript_text,
        );
        match self.summarizer.summarize(request).await {
            Ok(summary) => {
                if let Err(e) = self.storage.set_session_summary(&session.id, &summary).await {
                    error!(session_id = %session.id, error = %e, "failed to persist summary");
                }
            }
            Err(e) => {
                // Keep lifecycle at `parsed`; Recovery will retry on next boot.
                warn!(session_id = %session.id, error = %e, "summarization failed, will retry via recovery");
            }
        }
    }
}

pub fn derive_transcript_key(workspace_canonical: &str, session_id: &str) -> String {
    transcript_key(workspace_canonical, session_id)
}
