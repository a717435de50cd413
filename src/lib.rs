pub mod config;
pub mod consumer;
pub mod event;
pub mod ingest;
pub mod objectstore;
pub mod processor;
pub mod queue;
pub mod recovery;
pub mod rest;
pub mod storage;
pub mod summarizer;
pub mod telemetry;
pub mod transcript;
pub mod ws;

use std::sync::Arc;

use config::ServerConfig;
use objectstore::ObjectStore;
use queue::Queue;
use storage::Storage;
use summarizer::Summarizer;
use transcript::TranscriptPipeline;
use ws::Hub;

/// Shared application state passed to every HTTP handler and background task.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ServerConfig>,
    pub storage: Arc<Storage>,
    pub queue: Arc<dyn Queue>,
    pub objects: Arc<dyn ObjectStore>,
    pub hub: Arc<Hub>,
    pub pipeline: Arc<TranscriptPipeline>,
    pub summarizer: Arc<dyn Summarizer>,
}
