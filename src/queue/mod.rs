//! The Stream Queue (§4.C): an at-least-once, consumer-group-backed log of
//! pending events, backed by Redis Streams. Grounded on the pack's only
//! Redis precedent (`redis` crate with the `tokio-comp` + `connection-manager`
//! features — see `examples/other_examples/manifests/dkod-io-dkod-engine`).

use anyhow::Result;
use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::AsyncCommands;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// Queue-assigned monotonically increasing entry id (opaque to callers).
    pub entry_id: String,
    pub payload: String,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("consumer group missing (NOGROUP)")]
    NoGroup,
    #[error("queue backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// The queue contract used by the ingest endpoint and the consumer loop.
/// Abstracted behind a trait so unit tests can exercise consumer/ingest logic
/// against an in-memory fake instead of a live Redis server (§8).
#[async_trait]
pub trait Queue: Send + Sync {
    async fn append(&self, event_id: &str, payload: &str) -> Result<String, QueueError>;
    async fn read(
        &self,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<QueueEntry>, QueueError>;
    async fn ack(&self, entry_id: &str) -> Result<(), QueueError>;
    async fn claim(
        &self,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<QueueEntry>, QueueError>;
    async fn ensure_group(&self) -> Result<(), QueueError>;
    async fn ping(&self) -> bool;
}

/// Redis Streams-backed implementation. Holds two connections per §5: a
/// dedicated connection for the consumer's blocking `XREADGROUP`, and a
/// separate multiplexed/auto-reconnecting connection for short commands
/// (`XADD`, `XACK`, `XAUTOCLAIM`, `PING`) so the blocking read never head-of-
/// line blocks ingest appends or health checks.
pub struct StreamQueue {
    stream_key: String,
    group: String,
    read_conn: Mutex<MultiplexedConnection>,
    cmd_conn: ConnectionManager,
}

impl StreamQueue {
    pub async fn connect(url: &str, stream_key: &str, group: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let read_conn = client.get_multiplexed_async_connection().await?;
        let cmd_conn = ConnectionManager::new(client).await?;
        let queue = Self {
            stream_key: stream_key.to_string(),
            group: group.to_string(),
            read_conn: Mutex::new(read_conn),
            cmd_conn,
        };
        queue.ensure_group().await.ok();
        Ok(queue)
    }
}

#[async_trait]
impl Queue for StreamQueue {
    async fn append(&self, event_id: &str, payload: &str) -> Result<String, QueueError> {
        let mut conn = self.cmd_conn.clone();
        let entry_id: String = conn
            .xadd(&self.stream_key, "*", &[("event_id", event_id), ("payload", payload)])
            .await
            .map_err(|e| QueueError::Backend(e.into()))?;
        Ok(entry_id)
    }

    async fn read(
        &self,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        let mut conn = self.read_conn.lock().await;
        let opts = redis::streams::StreamReadOptions::default()
            .group(&self.group, consumer)
            .count(count)
            .block(block_ms as usize);
        let reply: redis::RedisResult<redis::streams::StreamReadReply> = conn
            .xread_options(&[&self.stream_key], &[">"], &opts)
            .await;
        match reply {
            Ok(reply) => Ok(flatten_stream_reply(reply)),
            Err(e) if e.to_string().contains("NOGROUP") => Err(QueueError::NoGroup),
            Err(e) => Err(QueueError::Backend(e.into())),
        }
    }

    async fn ack(&self, entry_id: &str) -> Result<(), QueueError> {
        let mut conn = self.cmd_conn.clone();
        conn.xack::<_, _, _, ()>(&self.stream_key, &self.group, &[entry_id])
            .await
            .map_err(|e| QueueError::Backend(e.into()))
    }

    async fn claim(
        &self,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        let mut conn = self.cmd_conn.clone();
        let reply: redis::streams::StreamAutoClaimReply = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(consumer)
            .arg(min_idle_ms)
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Backend(e.into()))?;
        Ok(reply
            .claimed
            .into_iter()
            .map(|id| QueueEntry {
                entry_id: id.id,
                payload: id
                    .map
                    .get("payload")
                    .and_then(|v| match v {
                        redis::Value::BulkString(b) => String::from_utf8(b.clone()).ok(),
                        _ => None,
                    })
                    .unwrap_or_default(),
            })
            .collect())
    }

    async fn ensure_group(&self) -> Result<(), QueueError> {
        let mut conn = self.cmd_conn.clone();
        let result: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(QueueError::Backend(e.into())),
        }
    }

    async fn ping(&self) -> bool {
        let mut conn = self.cmd_conn.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .is_ok()
    }
}

fn flatten_stream_reply(reply: redis::streams::StreamReadReply) -> Vec<QueueEntry> {
    let mut out = vec![];
    for key in reply.keys {
        for id in key.ids {
            let payload = id
                .map
                .get("payload")
                .and_then(|v| match v {
                    redis::Value::BulkString(b) => String::from_utf8(b.clone()).ok(),
                    _ => None,
                })
                .unwrap_or_default();
            out.push(QueueEntry {
                entry_id: id.id,
                payload,
            });
        }
    }
    out
}

#[cfg(test)]
pub mod fake {
    //! In-memory fake satisfying [`Queue`] for unit tests that don't need a
    //! live Redis server (§8 — redis-backed tests are `#[ignore]`d instead).
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicU64, Ordering};

    pub struct FakeQueue {
        next_id: AtomicU64,
        pending: Mutex<VecDeque<QueueEntry>>,
        in_flight: Mutex<HashMap<String, QueueEntry>>,
    }

    impl Default for FakeQueue {
        fn default() -> Self {
            Self {
                next_id: AtomicU64::new(1),
                pending: Mutex::new(VecDeque::new()),
                in_flight: Mutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl Queue for FakeQueue {
        async fn append(&self, _event_id: &str, payload: &str) -> Result<String, QueueError> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let entry_id = format!("{id}-0");
            self.pending.lock().await.push_back(QueueEntry {
                entry_id: entry_id.clone(),
                payload: payload.to_string(),
            });
            Ok(entry_id)
        }

        async fn read(
            &self,
            _consumer: &str,
            count: usize,
            _block_ms: u64,
        ) -> Result<Vec<QueueEntry>, QueueError> {
            let mut pending = self.pending.lock().await;
            let mut in_flight = self.in_flight.lock().await;
            let mut out = vec![];
            while out.len() < count {
                match pending.pop_front() {
                    Some(e) => {
                        in_flight.insert(e.entry_id.clone(), e.clone());
                        out.push(e);
                    }
                    None => break,
                }
            }
            Ok(out)
        }

        async fn ack(&self, entry_id: &str) -> Result<(), QueueError> {
            self.in_flight.lock().await.remove(entry_id);
            Ok(())
        }

        async fn claim(
            &self,
            _consumer: &str,
            _min_idle_ms: u64,
            count: usize,
        ) -> Result<Vec<QueueEntry>, QueueError> {
            let in_flight = self.in_flight.lock().await;
            Ok(in_flight.values().take(count).cloned().collect())
        }

        async fn ensure_group(&self) -> Result<(), QueueError> {
            Ok(())
        }

        async fn ping(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn append_then_read_then_ack() {
        let q = FakeQueue::default();
        q.append("e1", "{}").await.unwrap();
        let entries = q.read("c1", 10, 0).await.unwrap();
        assert_eq!(entries.len(), 1);
        q.ack(&entries[0].entry_id).await.unwrap();
        assert!(q.claim("c1", 0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unacked_entry_is_claimable() {
        let q = FakeQueue::default();
        q.append("e1", "{}").await.unwrap();
        q.read("c1", 10, 0).await.unwrap();
        let claimed = q.claim("c2", 0, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
    }
}
