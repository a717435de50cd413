//! Streaming JSONL transcript parser (§4.G step 3). Bounded memory regardless
//! of blob size: lines are read and discarded one at a time via the
//! [`crate::objectstore::LineStream`] abstraction.

use crate::objectstore::{tool_result_key, LineStream};
use crate::objectstore::ObjectStore;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

const INLINE_RESULT_MAX_BYTES: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
struct RawLine {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: Option<RawMessage>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    content: Vec<RawBlock>,
    #[serde(default)]
    usage: Option<RawUsage>,
}

#[derive(Debug, Deserialize)]
struct RawUsage {
    #[serde(default)]
    input_tokens: i64,
    #[serde(default)]
    output_tokens: i64,
    #[serde(default, rename = "cache_read_input_tokens")]
    cache_read_tokens: i64,
    #[serde(default, rename = "cache_creation_input_tokens")]
    cache_write_tokens: i64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawBlock {
    Text { text: String },
    Thinking { thinking: String },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        #[serde(default)]
        tool_use_id: Option<String>,
        #[serde(default)]
        content: Option<Value>,
    },
    #[serde(other)]
    Unknown,
}

/// Only `user`/`assistant` lines become a [`ParsedMessage`]; everything else
/// is either session-level metadata (handled by the caller) or skipped.
pub const MESSAGE_TYPES_WITH_ROWS: &[&str] = &["user", "assistant"];

pub struct ParsedMessage {
    pub line_number: i64,
    pub message_type: String,
    pub role: Option<String>,
    pub model: Option<String>,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cache_read_tokens: i64,
    pub cache_write_tokens: i64,
    pub blocks: Vec<ParsedBlock>,
}

pub struct ParsedBlock {
    pub block_type: &'static str,
    pub content_text: Option<String>,
    pub thinking_text: Option<String>,
    pub tool_name: Option<String>,
    pub tool_use_id: Option<String>,
    pub tool_input: Option<String>,
    pub result_text: Option<String>,
    pub result_s3_key: Option<String>,
}

pub struct ParseError {
    pub line_number: i64,
    pub error: String,
}

pub struct ParseOutcome {
    pub messages: Vec<ParsedMessage>,
    pub errors: Vec<ParseError>,
}

/// Parse a transcript line-by-line. Tool results over 64 KiB are offloaded to
/// the object store under `tool-results/<session>/<block_id>.txt`.
pub async fn parse(
    mut lines: Box<dyn LineStream>,
    session_id: &str,
    objects: &Arc<dyn ObjectStore>,
) -> anyhow::Result<ParseOutcome> {
    let mut messages = vec![];
    let mut errors = vec![];
    let mut line_number: i64 = 0;

    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }
        let raw: RawLine = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                errors.push(ParseError {
                    line_number,
                    error: e.to_string(),
                });
                continue;
            }
        };

        if !MESSAGE_TYPES_WITH_ROWS.contains(&raw.kind.as_str()) {
            continue;
        }

        let Some(message) = raw.message else {
            errors.push(ParseError {
                line_number,
                error: format!("{} line missing message body", raw.kind),
            });
            continue;
        };

        let usage = message.usage.unwrap_or(RawUsage {
            input_tokens: 0,
            output_tokens: 0,
            cache_read_tokens: 0,
            cache_write_tokens: 0,
        });

        let mut blocks = vec![];
        for (order, block) in message.content.into_iter().enumerate() {
            let parsed = match block {
                RawBlock::Text { text } => ParsedBlock {
                    block_type: "text",
                    content_text: Some(text),
                    thinking_text: None,
                    tool_name: None,
                    tool_use_id: None,
                    tool_input: None,
                    result_text: None,
                    result_s3_key: None,
                },
                RawBlock::Thinking { thinking } => ParsedBlock {
                    block_type: "thinking",
                    content_text: None,
                    thinking_text: Some(thinking),
                    tool_name: None,
                    tool_use_id: None,
                    tool_input: None,
                    result_text: None,
                    result_s3_key: None,
                },
                RawBlock::ToolUse { id, name, input } => ParsedBlock {
                    block_type: "tool_use",
                    content_text: None,
                    thinking_text: None,
                    tool_name: Some(name),
                    tool_use_id: Some(id),
                    tool_input: Some(input.to_string()),
                    result_text: None,
                    result_s3_key: None,
                },
                RawBlock::ToolResult {
                    tool_use_id,
                    content,
                } => {
                    let text = content
                        .map(|v| match v {
                            Value::String(s) => s,
                            other => other.to_string(),
                        })
                        .unwrap_or_default();
                    let (result_text, result_s3_key) = if text.len() <= INLINE_RESULT_MAX_BYTES {
                        (Some(text), None)
                    } else {
                        let key = tool_result_key(session_id, &format!("{line_number}-{order}"));
                        objects.put(&key, text.as_bytes()).await?;
                        (None, Some(key))
                    };
                    ParsedBlock {
                        block_type: "tool_result",
                        content_text: None,
                        thinking_text: None,
                        tool_name: None,
                        tool_use_id,
                        tool_input: None,
                        result_text,
                        result_s3_key,
                    }
                }
                RawBlock::Unknown => continue,
            };
            blocks.push(parsed);
        }

        messages.push(ParsedMessage {
            line_number,
            message_type: raw.kind,
            role: message.role,
            model: message.model,
            tokens_in: usage.input_tokens,
            tokens_out: usage.output_tokens,
            cache_read_tokens: usage.cache_read_tokens,
            cache_write_tokens: usage.cache_write_tokens,
            blocks,
        });
    }

    Ok(ParseOutcome { messages, errors })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objectstore::LocalObjectStore;

    struct VecLineStream {
        lines: std::vec::IntoIter<String>,
    }

    #[async_trait::async_trait]
    impl LineStream for VecLineStream {
        async fn next_line(&mut self) -> anyhow::Result<Option<String>> {
            Ok(self.lines.next())
        }
    }

    fn stream(lines: Vec<&str>) -> Box<dyn LineStream> {
        Box::new(VecLineStream {
            lines: lines.into_iter().map(String::from).collect::<Vec<_>>().into_iter(),
        })
    }

    #[tokio::test]
    async fn parses_user_and_assistant_only() {
        let dir = tempfile::tempdir().unwrap();
        let objects: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(dir.path()));
        let lines = stream(vec![
            r#"{"type":"user","message":{"role":"user","content":[{"type":"text","text":"hi"}]}}"#,
            r#"{"type":"progress","foo":"bar"}"#,
            r#"{"type":"assistant","message":{"role":"assistant","model":"claude","content":[{"type":"text","text":"hello"}],"usage":{"input_tokens":10,"output_tokens":5}}}"#,
        ]);
        let outcome = parse(lines, "s1", &objects).await.unwrap();
        assert_eq!(outcome.messages.len(), 2);
        assert_eq!(outcome.messages[1].tokens_in, 10);
        assert!(outcome.errors.is_empty());
    }

    #[tokio::test]
    async fn malformed_line_is_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let objects: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(dir.path()));
        let lines = stream(vec![
            "not json",
            r#"{"type":"user","message":{"role":"user","content":[]}}"#,
        ]);
        let outcome = parse(lines, "s1", &objects).await.unwrap();
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.messages.len(), 1);
    }

    #[tokio::test]
    async fn large_tool_result_offloads_to_object_store() {
        let dir = tempfile::tempdir().unwrap();
        let objects: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(dir.path()));
        let big = "x".repeat(INLINE_RESULT_MAX_BYTES + 1);
        let line = format!(
            r#"{{"type":"user","message":{{"role":"user","content":[{{"type":"tool_result","tool_use_id":"t1","content":"{big}"}}]}}}}"#
        );
        let lines = stream(vec![&line]);
        let outcome = parse(lines, "s1", &objects).await.unwrap();
        let block = &outcome.messages[0].blocks[0];
        assert!(block.result_text.is_none());
        assert!(block.result_s3_key.is_some());
    }
}
