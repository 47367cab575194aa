//! Terminal bridge
//!
//! Bridges a browser WebSocket to an interactive exec inside the instance's
//! container. Binary frames carry raw terminal bytes in both directions;
//! text frames carry JSON control messages (currently only resize). Frames
//! are applied strictly in arrival order, so a resize always takes effect
//! before any input sent after it. Sessions are torn down when the socket
//! closes, the instance leaves the running state, or the idle timeout fires.

use crate::config::InstancerConfig;
use crate::error::{InstancerError, Result};
use crate::instance::{Instance, InstanceState};
use crate::registry::Registry;
use crate::runtime::{ContainerRuntime, ExecSession};
use axum::extract::ws::{Message, WebSocket};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Shell spawned inside the container for each session.
const SESSION_SHELL: &[&str] = &["/bin/sh"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// One live terminal channel. Owned by the bridge; instance state is only
/// ever read, never mutated, from here.
#[derive(Debug)]
pub struct TerminalSession {
    pub session_id: String,
    pub instance_id: String,
    /// Runtime-assigned once the exec is attached.
    pub exec_id: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub state: SessionState,
}

impl TerminalSession {
    pub fn new(instance_id: &str) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4().to_string(),
            instance_id: instance_id.to_string(),
            exec_id: None,
            opened_at: now,
            last_activity_at: now,
            state: SessionState::Connecting,
        }
    }

    fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }
}

/// Gate applied before the WebSocket upgrade.
pub trait SessionAuth: Send + Sync {
    fn authorize(&self, token: Option<&str>) -> bool;
}

/// Static shared-secret auth; a `None` secret leaves the endpoint open
/// (private deployments behind the platform's own auth).
pub struct SharedSecretAuth {
    token: Option<String>,
}

impl SharedSecretAuth {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

impl SessionAuth for SharedSecretAuth {
    fn authorize(&self, token: Option<&str>) -> bool {
        match &self.token {
            None => true,
            Some(secret) => token == Some(secret.as_str()),
        }
    }
}

/// JSON control messages sent as text frames.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ControlFrame {
    Resize { cols: u16, rows: u16 },
}

/// One decoded client frame, in arrival order.
#[derive(Debug, PartialEq, Eq)]
pub enum ClientFrame {
    Data(Vec<u8>),
    Resize { cols: u16, rows: u16 },
    Close,
}

/// Decode a WebSocket message. Unparseable text frames are dropped (None)
/// rather than killing the session.
pub fn parse_client_message(msg: &Message) -> Option<ClientFrame> {
    match msg {
        Message::Binary(data) => Some(ClientFrame::Data(data.clone())),
        Message::Text(text) => match serde_json::from_str::<ControlFrame>(text) {
            Ok(ControlFrame::Resize { cols, rows }) => Some(ClientFrame::Resize { cols, rows }),
            Err(e) => {
                debug!("Dropping malformed control frame: {}", e);
                None
            }
        },
        Message::Close(_) => Some(ClientFrame::Close),
        Message::Ping(_) | Message::Pong(_) => None,
    }
}

fn error_frame(message: &str) -> Message {
    Message::Text(
        serde_json::json!({ "type": "error", "message": message }).to_string(),
    )
}

/// Apply one client frame to the exec session. Returns false when the
/// session should end.
pub(crate) async fn apply_client_frame(
    runtime: &Arc<dyn ContainerRuntime>,
    session: &mut ExecSession,
    frame: ClientFrame,
) -> Result<bool> {
    match frame {
        ClientFrame::Data(data) => {
            session.input.write_all(&data).await?;
            session.input.flush().await?;
            Ok(true)
        }
        ClientFrame::Resize { cols, rows } => {
            runtime.resize_exec(&session.exec_id, cols, rows).await?;
            Ok(true)
        }
        ClientFrame::Close => Ok(false),
    }
}

pub struct TerminalBridge {
    registry: Arc<Registry>,
    runtime: Arc<dyn ContainerRuntime>,
    auth: Arc<dyn SessionAuth>,
    config: InstancerConfig,
}

impl TerminalBridge {
    pub fn new(
        registry: Arc<Registry>,
        runtime: Arc<dyn ContainerRuntime>,
        auth: Arc<dyn SessionAuth>,
        config: InstancerConfig,
    ) -> Self {
        Self {
            registry,
            runtime,
            auth,
            config,
        }
    }

    /// Pre-upgrade token check.
    pub fn authorize(&self, token: Option<&str>) -> Result<()> {
        if self.auth.authorize(token) {
            Ok(())
        } else {
            Err(InstancerError::SessionRejected(
                "invalid session token".to_string(),
            ))
        }
    }

    /// Look up the session target by container id (or instance id) and
    /// reject anything not currently running.
    pub fn resolve(&self, id: &str) -> Result<Instance> {
        let inst = match self.registry.get_by_container(id)? {
            Some(inst) => inst,
            None => self
                .registry
                .get(id)?
                .ok_or_else(|| InstancerError::UnknownInstance(id.to_string()))?,
        };
        if inst.state != InstanceState::Running {
            return Err(InstancerError::SessionRejected(format!(
                "instance {} is {}, not running",
                inst.instance_id, inst.state
            )));
        }
        Ok(inst)
    }

    /// Drive one terminal session over an upgraded socket until it ends.
    pub async fn handle_socket(&self, mut socket: WebSocket, instance: Instance) {
        let mut sess = TerminalSession::new(&instance.instance_id);
        let cmd: Vec<String> = SESSION_SHELL.iter().map(|s| s.to_string()).collect();
        let mut session = match self.runtime.attach_exec(&instance.container_id, &cmd).await {
            Ok(session) => session,
            Err(e) => {
                warn!("Exec attach failed for {}: {}", instance.instance_id, e);
                let _ = socket.send(error_frame("could not attach to container")).await;
                let _ = socket.close().await;
                return;
            }
        };
        sess.exec_id = Some(session.exec_id.clone());
        sess.state = SessionState::Open;

        let mut state_events = self.registry.subscribe();
        let idle_timeout = self.config.terminal_idle_timeout();
        let mut idle_deadline = Instant::now() + idle_timeout;
        info!(
            "Terminal session {} opened for instance {}",
            sess.session_id, instance.instance_id
        );

        // Single sequential loop: client frames are applied in arrival
        // order, never concurrently.
        loop {
            tokio::select! {
                msg = socket.recv() => {
                    let Some(Ok(msg)) = msg else { break };
                    sess.touch();
                    idle_deadline = Instant::now() + idle_timeout;
                    if let Some(frame) = parse_client_message(&msg) {
                        match apply_client_frame(&self.runtime, &mut session, frame).await {
                            Ok(true) => {}
                            Ok(false) => break,
                            Err(e) => {
                                warn!("Session write failed: {}", e);
                                break;
                            }
                        }
                    }
                }
                chunk = session.output.next() => {
                    match chunk {
                        Some(Ok(bytes)) => {
                            if socket.send(Message::Binary(bytes)).await.is_err() {
                                break;
                            }
                            // Traffic in either direction counts as activity:
                            // a client quietly watching a long-running job is
                            // not idle.
                            sess.touch();
                            idle_deadline = Instant::now() + idle_timeout;
                        }
                        Some(Err(e)) => {
                            debug!("Exec output ended: {}", e);
                            break;
                        }
                        None => break,
                    }
                }
                event = state_events.recv() => {
                    match event {
                        Ok(event) if event.instance_id == instance.instance_id
                            && event.state != InstanceState::Running =>
                        {
                            let _ = socket.send(error_frame("instance stopped")).await;
                            break;
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => break,
                    }
                }
                _ = tokio::time::sleep_until(idle_deadline) => {
                    let _ = socket.send(error_frame("session idle timeout")).await;
                    break;
                }
            }
        }

        sess.state = SessionState::Closing;
        let _ = session.input.shutdown().await;
        let _ = socket.close().await;
        sess.state = SessionState::Closed;
        info!(
            "Terminal session {} closed for instance {}",
            sess.session_id, instance.instance_id
        );
    }
}
