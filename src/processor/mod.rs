//! The Handler Registry + Event Processor (§4.F): the heart of the system.
//! Dedup, collaborator normalization, dispatch, and commit all happen inside
//! one transaction so side-effects are only issued once the write durably
//! lands (teacher precedent: the daemon's single-transaction RPC handlers).

pub mod handlers;
pub mod workspace;

use crate::event::{self, RawEvent};
use crate::storage::Storage;
use crate::transcript::TranscriptPipeline;
use crate::ws::Hub;
use anyhow::Result;
use std::sync::Arc;

#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Processed,
    Duplicate,
    NoHandler,
}

pub struct Processor {
    storage: Arc<Storage>,
    hub: Arc<Hub>,
    pipeline: Arc<TranscriptPipeline>,
}

impl Processor {
    pub fn new(storage: Arc<Storage>, hub: Arc<Hub>, pipeline: Arc<TranscriptPipeline>) -> Self {
        Self {
            storage,
            hub,
            pipeline,
        }
    }

    /// Process one raw queue payload end-to-end. Returns the outcome used by
    /// the Consumer Loop to decide ack/retry.
    pub async fn process(&self, raw_payload: &str) -> Result<Outcome> {
        let raw: RawEvent = serde_json::from_str(raw_payload)?;
        let event = event::validate(raw)?;

        let mut tx = self.storage.begin().await?;

        let is_new = Storage::insert_event_if_new(
            &mut tx,
            &event.id,
            &event.kind,
            event.timestamp,
            &event.device_id,
            &event.workspace_id,
            event.session_id.as_deref(),
            &event.raw,
            &event.blob_refs,
        )
        .await?;
        if !is_new {
            tx.commit().await?;
            return Ok(Outcome::Duplicate);
        }

        let canonical_id = workspace::derive_canonical_id(&event.workspace_id);
        let display_name = workspace::display_name_from_canonical(&canonical_id);
        let ws = Storage::upsert_workspace(&mut tx, &canonical_id, &display_name).await?;
        Storage::rewrite_event_workspace(&mut tx, &event.id, &ws.id).await?;
        Storage::upsert_device(&mut tx, &event.device_id, event.timestamp).await?;
        Storage::upsert_workspace_device_link(&mut tx, &ws.id, &event.device_id, event.timestamp)
            .await?;

        let mut normalized = event;
        normalized.workspace_id = ws.id.clone();

        let result = handlers::dispatch(&mut tx, &normalized).await?;

        tx.commit().await?;

        let Some(result) = result else {
            return Ok(Outcome::NoHandler);
        };

        if let Some(session_id) = result.enqueue_transcript {
            self.pipeline.enqueue(session_id).await;
        }
        if let Some(session_id) = &result.session_id {
            if let Some(session) = self.storage.get_session(session_id).await.ok().flatten() {
                self.hub.broadcast_session_update(&session).await;
            }
        }

        Ok(Outcome::Processed)
    }
}
