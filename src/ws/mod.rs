//! The WebSocket Hub (§4.H): authenticated pub/sub fan-out for processed
//! events and session updates. Grounded on the teacher's
//! `ipc::event::EventBroadcaster`, generalized from a single broadcast
//! channel to a per-client subscription-set table so fan-out can target
//! `all` / `workspace:<id>` / `session:<id>` scopes and terminate slow
//! clients instead of back-pressuring the producer.

use crate::storage::rows::SessionRow;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

const CLOSE_BAD_AUTH: u16 = 4001;
const OUTBOUND_BUFFER: usize = 256;
const PING_INTERVAL: Duration = Duration::from_secs(30);
const STALE_GRACE: Duration = Duration::from_secs(10);

struct ClientHandle {
    id: u64,
    tx: mpsc::Sender<Message>,
    subscriptions: Mutex<HashSet<String>>,
    alive: AtomicBool,
}

pub struct Hub {
    clients: Mutex<HashMap<u64, Arc<ClientHandle>>>,
    next_id: AtomicU64,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn broadcast_session_update(&self, session: &SessionRow) {
        let msg = json!({
            "type": "session.update",
            "session_id": session.id,
            "workspace_id": session.workspace_id,
            "lifecycle": session.lifecycle,
            "summary": session.summary,
        });
        self.deliver(&scopes_for(&session.workspace_id, Some(&session.id)), msg)
            .await;
    }

    pub async fn broadcast_event(&self, workspace_id: &str, session_id: Option<&str>, data: Value) {
        let msg = json!({ "type": "event", "data": data });
        self.deliver(&scopes_for(workspace_id, session_id), msg).await;
    }

    async fn deliver(&self, scopes: &HashSet<String>, msg: Value) {
        let Ok(text) = serde_json::to_string(&msg) else {
            return;
        };
        let clients = self.clients.lock().await;
        for client in clients.values() {
            let matches = {
                let subs = client.subscriptions.lock().await;
                subs.contains("all") || scopes.iter().any(|s| subs.contains(s))
            };
            if matches {
                // Non-blocking relative to the producer: a full buffer means
                // the client is slow and gets terminated, not back-pressured.
                if client.tx.try_send(Message::Text(text.clone().into())).is_err() {
                    client.alive.store(false, Ordering::SeqCst);
                }
            }
        }
    }

    /// Spawn the 30 s ping scheduler (§4.H keepalive). Runs for the lifetime
    /// of the process; call once from `main`.
    pub fn spawn_keepalive(self: &Arc<Self>) {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(PING_INTERVAL).await;
                hub.ping_round().await;
            }
        });
    }

    async fn ping_round(&self) {
        let snapshot: Vec<Arc<ClientHandle>> = {
            let clients = self.clients.lock().await;
            clients.values().cloned().collect()
        };
        for client in &snapshot {
            client.alive.store(false, Ordering::SeqCst);
            let _ = client
                .tx
                .try_send(Message::Text(json!({"type": "ping"}).to_string().into()));
        }
        tokio::time::sleep(STALE_GRACE).await;
        let mut clients = self.clients.lock().await;
        clients.retain(|_, c| {
            let alive = c.alive.load(Ordering::SeqCst);
            if !alive {
                tracing::info!(client_id = c.id, "terminating stale websocket client");
            }
            alive
        });
    }

    async fn deregister(&self, id: u64) {
        self.clients.lock().await.remove(&id);
    }
}

fn scopes_for(workspace_id: &str, session_id: Option<&str>) -> HashSet<String> {
    let mut scopes = HashSet::new();
    scopes.insert(format!("workspace:{workspace_id}"));
    if let Some(sid) = session_id {
        scopes.insert(format!("session:{sid}"));
    }
    scopes
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Subscribe {
        scope: Option<String>,
        workspace_id: Option<String>,
        session_id: Option<String>,
    },
    Unsubscribe {
        scope: Option<String>,
        workspace_id: Option<String>,
        session_id: Option<String>,
    },
    Pong,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame<'a> {
    Subscribed { scope: &'a str },
    Unsubscribed { scope: &'a str },
    Error { message: &'a str },
}

fn frame_scope(
    scope: &Option<String>,
    workspace_id: &Option<String>,
    session_id: &Option<String>,
) -> Option<String> {
    if let Some(s) = scope {
        if s == "all" {
            return Some("all".to_string());
        }
    }
    if let Some(w) = workspace_id {
        return Some(format!("workspace:{w}"));
    }
    if let Some(s) = session_id {
        return Some(format!("session:{s}"));
    }
    None
}

pub fn router() -> Router<crate::AppContext> {
    Router::new().route("/ws", get(upgrade))
}

async fn upgrade(
    State(ctx): State<crate::AppContext>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let authorized = match &query.token {
        Some(t) => crate::ingest::tokens_equal(t, &ctx.config.api_key),
        None => ctx.config.api_key.is_empty(),
    };
    ws.on_upgrade(move |socket| handle_socket(socket, ctx, authorized))
}

async fn handle_socket(mut socket: WebSocket, ctx: crate::AppContext, authorized: bool) {
    if !authorized {
        let _ = socket
            .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                code: CLOSE_BAD_AUTH,
                reason: "invalid token".into(),
            })))
            .await;
        return;
    }

    let hub = &ctx.hub;
    let id = hub.next_id.fetch_add(1, Ordering::SeqCst);
    let (tx, mut rx) = mpsc::channel(OUTBOUND_BUFFER);
    let handle = Arc::new(ClientHandle {
        id,
        tx,
        subscriptions: Mutex::new(HashSet::new()),
        alive: AtomicBool::new(true),
    });
    hub.clients.lock().await.insert(id, Arc::clone(&handle));

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(msg) => {
                        if socket.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_frame(&handle, &text).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        handle.alive.store(true, Ordering::SeqCst);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    hub.deregister(id).await;
}

async fn handle_client_frame(handle: &Arc<ClientHandle>, text: &str) {
    let Ok(frame) = serde_json::from_str::<ClientFrame>(text) else {
        let _ = handle.tx.try_send(Message::Text(
            serde_json::to_string(&ServerFrame::Error {
                message: "malformed frame",
            })
            .unwrap()
            .into(),
        ));
        return;
    };
    match frame {
        ClientFrame::Subscribe {
            scope,
            workspace_id,
            session_id,
        } => {
            if let Some(s) = frame_scope(&scope, &workspace_id, &session_id) {
                handle.subscriptions.lock().await.insert(s.clone());
                let _ = handle.tx.try_send(Message::Text(
                    serde_json::to_string(&ServerFrame::Subscribed { scope: &s })
                        .unwrap()
                        .into(),
                ));
            }
        }
        ClientFrame::Unsubscribe {
            scope,
            workspace_id,
            session_id,
        } => {
            if let Some(s) = frame_scope(&scope, &workspace_id, &session_id) {
                handle.subscriptions.lock().await.remove(&s);
                let _ = handle.tx.try_send(Message::Text(
                    serde_json::to_string(&ServerFrame::Unsubscribed { scope: &s })
                        .unwrap()
                        .into(),
                ));
            }
        }
        ClientFrame::Pong => {
            handle.alive.store(true, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_scope_prefers_all() {
        assert_eq!(
            frame_scope(&Some("all".into()), &None, &None),
            Some("all".to_string())
        );
    }

    #[test]
    fn frame_scope_workspace() {
        assert_eq!(
            frame_scope(&None, &Some("w1".into()), &None),
            Some("workspace:w1".to_string())
        );
    }

    #[tokio::test]
    async fn broadcast_reaches_only_matching_subscriber() {
        let hub = Hub::new();

        let (tx_a, mut rx_a) = mpsc::channel(8);
        let a = Arc::new(ClientHandle {
            id: 1,
            tx: tx_a,
            subscriptions: Mutex::new(HashSet::from(["workspace:w1".to_string()])),
            alive: AtomicBool::new(true),
        });
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let b = Arc::new(ClientHandle {
            id: 2,
            tx: tx_b,
            subscriptions: Mutex::new(HashSet::from(["workspace:w2".to_string()])),
            alive: AtomicBool::new(true),
        });
        hub.clients.lock().await.insert(1, a);
        hub.clients.lock().await.insert(2, b);

        hub.broadcast_event("w1", None, json!({"k": "v"})).await;

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }
}
