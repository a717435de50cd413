//! The Recovery Subsystem (§4.I): a delayed one-shot startup scan that
//! requeues sessions stuck mid-pipeline or parsed-but-unsummarized.

use crate::storage::Storage;
use crate::transcript::TranscriptPipeline;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const STARTUP_DELAY: Duration = Duration::from_secs(5);
const STUCK_COOLDOWN_MINUTES: i64 = 5;

pub async fn run_once(storage: Arc<Storage>, pipeline: Arc<TranscriptPipeline>) {
    tokio::time::sleep(STARTUP_DELAY).await;

    let stuck = match storage
        .find_stuck_sessions(chrono::Duration::minutes(STUCK_COOLDOWN_MINUTES))
        .await
    {
        Ok(sessions) => sessions,
        Err(e) => {
            warn!(error = %e, "recovery: failed to scan for stuck sessions");
            vec![]
        }
    };
    for session in &stuck {
        pipeline.enqueue(session.id.clone()).await;
    }

    let unsummarized = match storage.find_unsummarized_sessions().await {
        Ok(sessions) => sessions,
        Err(e) => {
            warn!(error = %e, "recovery: failed to scan for unsummarized sessions");
            vec![]
        }
    };
    for session in &unsummarized {
        pipeline.enqueue(session.id.clone()).await;
    }

    info!(
        stuck = stuck.len(),
        unsummarized = unsummarized.len(),
        "recovery scan complete"
    );
}
