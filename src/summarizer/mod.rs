//! The external LLM summarizer: an opaque collaborator (§4.G step 5).
//! `Summarizer` is a trait object on [`crate::AppContext`], matching the
//! teacher's pattern of holding out-of-process collaborators (`Updater`,
//! `AccountRegistry`) behind trait boundaries on the shared context.

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde::Serialize;

const MAX_TRANSCRIPT_CHARS: usize = 16_000;

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, request: SummaryRequest) -> Result<String>;
}

#[derive(Debug, Serialize)]
pub struct SummaryRequest {
    pub session_id: String,
    pub initial_prompt: Option<String>,
    pub transcript_excerpt: String,
}

impl SummaryRequest {
    /// Truncate to a bounded, redacted excerpt before it leaves the process.
    pub fn new(session_id: String, initial_prompt: Option<String>, full_text: &str) -> Self {
        let excerpt: String = full_text.chars().take(MAX_TRANSCRIPT_CHARS).collect();
        Self {
            session_id,
            initial_prompt,
            transcript_excerpt: redact(&excerpt),
        }
    }
}

/// Strips values that look like bearer tokens or API keys out of the text
/// sent to the external summarizer.
fn redact(text: &str) -> String {
    let re = regex::Regex::new(r"(?i)(api[_-]?key|bearer|token)\s*[:= ]\s*\S+").unwrap();
    re.replace_all(text, "$1: [redacted]").into_owned()
}

/// HTTP-backed summarizer calling a configured endpoint. The provider's
/// request/response shape is not part of this system's contract; only that
/// it accepts [`SummaryRequest`] as JSON and returns a plain-text summary.
pub struct HttpSummarizer {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl HttpSummarizer {
    pub fn new(endpoint: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            model,
        }
    }
}

#[derive(Debug, Serialize)]
struct SummarizeBody<'a> {
    model: &'a str,
    session_id: &'a str,
    initial_prompt: &'a Option<String>,
    transcript_excerpt: &'a str,
}

#[async_trait]
impl Summarizer for HttpSummarizer {
    async fn summarize(&self, request: SummaryRequest) -> Result<String> {
        let body = SummarizeBody {
            model: &self.model,
            session_id: &request.session_id,
            initial_prompt: &request.initial_prompt,
            transcript_excerpt: &request.transcript_excerpt,
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .context("summarizer request failed")?
            .error_for_status()
            .context("summarizer returned an error status")?;
        resp.text().await.context("reading summarizer response body")
    }
}

/// No-op summarizer used when `SUMMARY_ENABLED` is unset — every session
/// stays in `parsed` until an operator enables summarization.
pub struct DisabledSummarizer;

#[async_trait]
impl Summarizer for DisabledSummarizer {
    async fn summarize(&self, _request: SummaryRequest) -> Result<String> {
        anyhow::bail!("summarization disabled")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_masks_bearer_tokens() {
        let text = "Authorization: Bearer sk-abc123 rest of text";
        let redacted = redact(text);
        assert!(!redacted.contains("sk-abc123"));
    }

    #[test]
    fn truncates_to_max_chars() {
        let long = "a".repeat(MAX_TRANSCRIPT_CHARS * 2);
        let req = SummaryRequest::new("s1".into(), None, &long);
        assert_eq!(req.transcript_excerpt.chars().count(), MAX_TRANSCRIPT_CHARS);
    }
}
