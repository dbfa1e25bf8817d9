//! Coordination Server: the Worker Protocol transport (spec §4.2, §6.2).
//!
//! Axum websocket endpoint with a tokio::spawn-per-connection split into a
//! reader (inbound protocol messages) and a writer draining a bounded,
//! drop-oldest-non-critical outbound queue, mirroring the teacher's
//! `server.rs::websocket_handler` + `communication::handle_websocket` split.

use crate::agent::AgentId;
use crate::coordinator::Coordinator;
use crate::orchestrator::AgentSpec;
use crate::task::{TaskError, TaskResult};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Inbound message kinds a worker may send (spec §4.2).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Register {
        agent_id: AgentId,
        swarm_id: String,
        #[serde(default)]
        kind: String,
        #[serde(default)]
        capabilities: HashSet<String>,
        #[serde(default)]
        resources: HashMap<crate::agent::ResourceKind, f64>,
    },
    Heartbeat {
        agent_id: AgentId,
        #[serde(default)]
        current_load: Option<f64>,
    },
    TaskResult {
        agent_id: AgentId,
        task_id: crate::task::TaskId,
        output: String,
        execution_time_ns: u64,
    },
    TaskError {
        agent_id: AgentId,
        task_id: crate::task::TaskId,
        reason: String,
        #[serde(default = "default_true")]
        retryable: bool,
    },
    StatusUpdate {
        agent_id: AgentId,
        #[serde(default)]
        health: Option<crate::agent::HealthStatus>,
        #[serde(default)]
        issues: Vec<String>,
    },
    PeerMessage {
        agent_id: AgentId,
        to: AgentId,
        payload: serde_json::Value,
    },
}

fn default_true() -> bool {
    true
}

/// Outbound message kinds the coordinator may send to a worker (spec §4.2).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Welcome {
        agent_id: AgentId,
        swarm_id: String,
        topology_pattern: crate::topology::TopologyPattern,
    },
    TaskAssignment {
        task_id: crate::task::TaskId,
        kind: String,
        description: String,
        timeout_secs: u64,
        /// Peer agent ids per the topology graph at assignment time (spec §6.2).
        peer_agents: Vec<AgentId>,
        coordination_endpoint: String,
    },
    TopologyUpdate {
        neighbors: Vec<AgentId>,
    },
    PeerMessage {
        from: AgentId,
        payload: serde_json::Value,
    },
    Pause,
    Resume,
    Shutdown {
        grace_secs: u64,
    },
}

impl OutboundMessage {
    /// Messages that must never be silently dropped on overflow
    /// (spec §4.2 "queue overflow policy").
    fn is_critical(&self) -> bool {
        matches!(self, Self::TaskAssignment { .. } | Self::Shutdown { .. })
    }
}

/// Bounded, drop-oldest-non-critical FIFO queue for one agent's outbound
/// stream (spec §4.2). A plain `mpsc::Sender` cannot evict a queued item, so
/// this is a `Mutex<VecDeque>` paired with a `Notify` the writer task awaits.
struct OutboundQueue {
    capacity: usize,
    items: AsyncMutex<VecDeque<OutboundMessage>>,
    notify: Notify,
}

impl OutboundQueue {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: AsyncMutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    async fn push(&self, message: OutboundMessage) {
        let mut items = self.items.lock().await;
        if items.len() >= self.capacity {
            if let Some(pos) = items.iter().position(|m| !m.is_critical()) {
                items.remove(pos);
            } else {
                items.pop_front();
            }
        }
        items.push_back(message);
        drop(items);
        self.notify.notify_one();
    }

    async fn pop(&self) -> OutboundMessage {
        loop {
            {
                let mut items = self.items.lock().await;
                if let Some(message) = items.pop_front() {
                    return message;
                }
            }
            self.notify.notified().await;
        }
    }
}

/// Live connections, keyed by agent id.
///
/// The outbound queue for an agent outlives any single connection: spec
/// §4.2 requires it to hold messages while the channel is closed or
/// not-yet-open, and to drain in FIFO order once the agent reconnects under
/// the same `AgentId`. Only `remove` (called when an agent is permanently
/// terminated) drops the queue; `detach` just clears the "currently
/// reachable" marker.
#[derive(Default)]
pub struct ConnectionRegistry {
    queues: DashMap<AgentId, Arc<OutboundQueue>>,
    connected: DashMap<AgentId, ()>,
    capacity: usize,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: DashMap::new(),
            connected: DashMap::new(),
            capacity,
        }
    }

    /// Returns this agent's outbound queue, reusing whatever already exists
    /// from a prior connection so messages queued while disconnected are
    /// still there for the new writer to drain.
    fn attach(&self, id: AgentId) -> Arc<OutboundQueue> {
        let queue = self
            .queues
            .entry(id.clone())
            .or_insert_with(|| Arc::new(OutboundQueue::new(self.capacity)))
            .clone();
        self.connected.insert(id, ());
        queue
    }

    fn detach(&self, id: &AgentId) {
        self.connected.remove(id);
    }

    /// Drops the queue entirely; call once an agent is permanently
    /// terminated so its queue does not outlive it.
    pub fn remove(&self, id: &AgentId) {
        self.queues.remove(id);
        self.connected.remove(id);
    }

    #[must_use]
    pub fn is_connected(&self, id: &AgentId) -> bool {
        self.connected.contains_key(id)
    }

    /// Enqueues a message for delivery; returns false if the agent has no
    /// outbound queue at all, i.e. it has never registered (spec §4.2's
    /// `ErrUnreachable` condition). A registered-but-disconnected agent's
    /// message is still queued, to drain on reconnection.
    pub async fn send(&self, id: &AgentId, message: OutboundMessage) -> bool {
        let Some(queue) = self.queues.get(id).map(|q| q.clone()) else {
            return false;
        };
        queue.push(message).await;
        true
    }
}

/// Shared axum handler state.
#[derive(Clone)]
pub struct ServerState {
    pub coordinator: Arc<Coordinator>,
}

#[must_use]
pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .route("/healthz", get(healthz))
        .layer(CorsLayer::permissive())
        .with_state(ServerState { coordinator })
}

async fn healthz() -> &'static str {
    "ok"
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.coordinator))
}

/// One worker connection's lifetime: wait for `register` within the
/// configured deadline, then run reader/writer loops until disconnect
/// (spec §4.2 "Connection lifecycle").
async fn handle_socket(mut socket: WebSocket, coordinator: Arc<Coordinator>) {
    let deadline = coordinator.register_deadline();
    let first = tokio::time::timeout(deadline, socket.recv()).await;

    let Ok(Some(Ok(Message::Text(text)))) = first else {
        debug!("connection dropped before a register message arrived");
        let _ = socket.close().await;
        return;
    };

    let Ok(InboundMessage::Register {
        agent_id,
        swarm_id,
        kind,
        capabilities,
        resources,
    }) = serde_json::from_str::<InboundMessage>(&text)
    else {
        warn!("first message was not a valid register, dropping connection");
        let _ = socket.close().await;
        return;
    };

    coordinator.orchestrator().register(
        agent_id.clone(),
        AgentSpec {
            kind,
            capabilities,
            resources,
        },
    );
    let queue = coordinator.connections().attach(agent_id.clone());
    info!(agent_id = %agent_id, swarm_id, "worker connected");

    let welcome = OutboundMessage::Welcome {
        agent_id: agent_id.clone(),
        swarm_id,
        topology_pattern: coordinator.topology().pattern(),
    };
    if socket
        .send(Message::Text(serde_json::to_string(&welcome).unwrap_or_default()))
        .await
        .is_err()
    {
        coordinator.connections().detach(&agent_id);
        return;
    }

    let (mut sink, mut stream) = socket.split();
    let writer_queue = queue;
    let writer = tokio::spawn(async move {
        loop {
            let message = writer_queue.pop().await;
            let encoded = serde_json::to_string(&message).unwrap_or_default();
            if sink.send(Message::Text(encoded)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(frame)) = stream.next().await {
        let Message::Text(text) = frame else {
            continue;
        };
        match serde_json::from_str::<InboundMessage>(&text) {
            Ok(InboundMessage::Register { .. }) => {
                // A worker that re-registers mid-connection is treated as a
                // heartbeat; the handshake already happened once.
            }
            Ok(message) => coordinator.handle_inbound(message).await,
            Err(e) => warn!(agent_id = %agent_id, error = %e, "malformed worker message"),
        }
    }

    writer.abort();
    coordinator.connections().detach(&agent_id);
    coordinator.mark_disconnected(&agent_id);
    info!(agent_id = %agent_id, "worker disconnected");
}

impl Coordinator {
    /// Processes one decoded inbound message against the orchestrator and
    /// recovery manager (spec §4.2's per-message-type handling).
    pub async fn handle_inbound(&self, message: InboundMessage) {
        match message {
            InboundMessage::Register { .. } => {}
            InboundMessage::Heartbeat {
                agent_id,
                current_load,
            } => {
                self.record_heartbeat(&agent_id, current_load);
            }
            InboundMessage::TaskResult {
                agent_id,
                task_id,
                output,
                execution_time_ns,
            } => {
                self.on_task_result(
                    &agent_id,
                    &task_id,
                    TaskResult {
                        output,
                        execution_time_ns,
                        completed_at: chrono::Utc::now(),
                    },
                );
            }
            InboundMessage::TaskError {
                agent_id,
                task_id,
                reason,
                retryable,
            } => {
                self.on_task_error(
                    &agent_id,
                    &task_id,
                    TaskError {
                        reason,
                        retryable,
                        failed_at: chrono::Utc::now(),
                    },
                )
                .await;
            }
            InboundMessage::StatusUpdate {
                agent_id,
                health,
                issues,
            } => {
                self.record_status(&agent_id, health, issues);
            }
            InboundMessage::PeerMessage { agent_id, to, payload } => {
                let delivered = self
                    .connections()
                    .send(
                        &to,
                        OutboundMessage::PeerMessage {
                            from: agent_id.clone(),
                            payload,
                        },
                    )
                    .await;
                if !delivered {
                    debug!(from = %agent_id, to = %to, "peer message undeliverable, recipient unreachable");
                }
            }
        }
    }
}
