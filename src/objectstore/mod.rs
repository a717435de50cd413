//! The Object Store (§4.B): an opaque blob collaborator with get/put/head/
//! stream operations. Out of scope per spec.md — this is a minimal concrete
//! implementation (local filesystem) so the pipeline can run end-to-end,
//! following the same `tokio::fs` append/write style as the teacher's
//! `session::events::EventLog`.

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
    async fn head(&self, key: &str) -> Result<bool>;
    /// Open a streaming line reader over the object (used by the transcript
    /// parser so memory stays bounded regardless of blob size, §4.G, §9).
    async fn open_lines(&self, key: &str) -> Result<Box<dyn LineStream>>;
}

#[async_trait]
pub trait LineStream: Send {
    /// Returns the next line (without trailing newline), or `None` at EOF.
    async fn next_line(&mut self) -> Result<Option<String>>;
}

pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.resolve(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing object {key}"))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        tokio::fs::read(self.resolve(key))
            .await
            .with_context(|| format!("reading object {key}"))
    }

    async fn head(&self, key: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.resolve(key)).await?)
    }

    async fn open_lines(&self, key: &str) -> Result<Box<dyn LineStream>> {
        let file = tokio::fs::File::open(self.resolve(key))
            .await
            .with_context(|| format!("opening object {key} for streaming"))?;
        Ok(Box::new(LocalLineStream {
            reader: BufReader::new(file),
        }))
    }
}

struct LocalLineStream {
    reader: BufReader<tokio::fs::File>,
}

#[async_trait]
impl LineStream for LocalLineStream {
    async fn next_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        if line.ends_with('\n') {
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
        }
        Ok(Some(line))
    }
}

/// Derive the transcript upload key (§6 Transcript upload HTTP).
pub fn transcript_key(workspace_canonical: &str, session_id: &str) -> String {
    format!("transcripts/{workspace_canonical}/{session_id}/raw.jsonl")
}

/// Derive the offloaded tool-result key for a content block too large to inline.
pub fn tool_result_key(session_id: &str, block_id: &str) -> String {
    format!("tool-results/{session_id}/{block_id}.txt")
}

pub fn sanitize_component(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        store.put("a/b.txt", b"hello").await.unwrap();
        assert!(store.head("a/b.txt").await.unwrap());
        assert_eq!(store.get("a/b.txt").await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn open_lines_streams_line_by_line() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        store.put("x.jsonl", b"one\ntwo\nthree").await.unwrap();
        let mut stream = store.open_lines("x.jsonl").await.unwrap();
        let mut lines = vec![];
        while let Some(line) = stream.next_line().await.unwrap() {
            lines.push(line);
        }
        assert_eq!(lines, vec!["one", "two", "three"]);
    }
}
