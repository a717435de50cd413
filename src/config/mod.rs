//! Environment-driven server configuration (§6 "Environment / configuration").

use anyhow::{Context as _, Result};
use std::env;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_PIPELINE_POOL_SIZE: usize = 6;
const DEFAULT_PIPELINE_PENDING_MAX: usize = 50;
const DEFAULT_PIPELINE_CONSUMER_MAX_RETRIES: u32 = 3;
const DEFAULT_CONSUMER_CLAIM_IDLE_MS: u64 = 60_000;
const DEFAULT_CONSUMER_BLOCK_MS: u64 = 5_000;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub database_url: String,
    pub queue_url: String,
    pub api_key: String,
    pub port: u16,
    pub object_store_root: String,
    pub summary_enabled: bool,
    pub summary_model: String,
    pub summary_endpoint: String,
    pub pipeline_pool_size: usize,
    pub pipeline_pending_max: usize,
    pub pipeline_consumer_max_retries: u32,
    pub consumer_claim_idle_ms: u64,
    pub consumer_block_ms: u64,
}

impl ServerConfig {
    /// Load from the process environment. Missing required variables are a
    /// fatal configuration error (§7 — Configuration errors are fatal at boot).
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: require_env("DATABASE_URL")?,
            queue_url: require_env("QUEUE_URL")?,
            api_key: require_env("API_KEY")?,
            port: parse_env("PORT", DEFAULT_PORT)?,
            object_store_root: env::var("OBJECT_STORE_BUCKET")
                .unwrap_or_else(|_| "./data/objects".to_string()),
            summary_enabled: env::var("SUMMARY_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes"))
                .unwrap_or(false),
            summary_model: env::var("SUMMARY_MODEL").unwrap_or_else(|_| "default".to_string()),
            summary_endpoint: env::var("SUMMARY_ENDPOINT")
                .unwrap_or_else(|_| "http://localhost:8787/summarize".to_string()),
            pipeline_pool_size: parse_env("PIPELINE_POOL_SIZE", DEFAULT_PIPELINE_POOL_SIZE)?,
            pipeline_pending_max: parse_env(
                "PIPELINE_PENDING_MAX",
                DEFAULT_PIPELINE_PENDING_MAX,
            )?,
            pipeline_consumer_max_retries: parse_env(
                "PIPELINE_CONSUMER_MAX_RETRIES",
                DEFAULT_PIPELINE_CONSUMER_MAX_RETRIES,
            )?,
            consumer_claim_idle_ms: parse_env(
                "CONSUMER_CLAIM_IDLE_MS",
                DEFAULT_CONSUMER_CLAIM_IDLE_MS,
            )?,
            consumer_block_ms: parse_env("CONSUMER_BLOCK_MS", DEFAULT_CONSUMER_BLOCK_MS)?,
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    env::var(key).with_context(|| format!("missing required environment variable {key}"))
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid value for {key}: {e}")),
        Err(_) => Ok(default),
    }
}
