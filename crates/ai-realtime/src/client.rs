// parley - SIP <-> Realtime AI Bridge
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The long-lived provider connection.
//!
//! One task owns the WebSocket, the session gate, and the reconnect loop.
//! Everything else in the daemon talks to it through [`RealtimeHandle`]
//! commands, so sends serialize through a single writer and the socket can
//! die and come back without anyone else noticing beyond a gap in audio.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::events::{ClientEvent, ConversationItem, ServerEvent, SessionConfig};
use crate::gate::SessionGate;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_DEADLINE: Duration = Duration::from_secs(5);
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Connection settings for the provider socket.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub url: String,
    pub api_key: String,
    pub session: SessionConfig,
}

/// Commands accepted by the client task.
#[derive(Debug)]
pub enum ClientCommand {
    /// One base64 G.711 frame of caller audio.
    SendAudio(String),
    /// Create a conversation item (welcome prompt).
    CreateItem(ConversationItem),
    /// Ask the AI to produce a response.
    CreateResponse,
    /// Bind the active call: server events are forwarded to `tx`.
    Attach { tx: mpsc::Sender<ServerEvent> },
    /// Re-issue `session.update` for a new call. Audio regates until the
    /// provider acknowledges with `session.updated`.
    Configure,
    /// Sever the call binding and drop any queued call audio. The socket
    /// stays open for the next call.
    Detach,
    /// Close the socket and end the task.
    Shutdown,
}

/// Cloneable handle to the client task.
#[derive(Clone)]
pub struct RealtimeHandle {
    tx: mpsc::Sender<ClientCommand>,
    connected: watch::Receiver<bool>,
}

impl RealtimeHandle {
    pub async fn send_audio(&self, audio: String) {
        let _ = self.tx.send(ClientCommand::SendAudio(audio)).await;
    }

    pub async fn create_item(&self, item: ConversationItem) {
        let _ = self.tx.send(ClientCommand::CreateItem(item)).await;
    }

    pub async fn create_response(&self) {
        let _ = self.tx.send(ClientCommand::CreateResponse).await;
    }

    pub async fn attach(&self, tx: mpsc::Sender<ServerEvent>) {
        let _ = self.tx.send(ClientCommand::Attach { tx }).await;
    }

    pub async fn configure(&self) {
        let _ = self.tx.send(ClientCommand::Configure).await;
    }

    pub async fn detach(&self) {
        let _ = self.tx.send(ClientCommand::Detach).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(ClientCommand::Shutdown).await;
    }

    /// Observes connection state transitions.
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }
}

/// Spawns the client task and returns its handle.
pub fn spawn_client(config: RealtimeConfig) -> RealtimeHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (connected_tx, connected_rx) = watch::channel(false);
    tokio::spawn(run_client(config, cmd_rx, connected_tx));
    RealtimeHandle {
        tx: cmd_tx,
        connected: connected_rx,
    }
}

async fn run_client(
    config: RealtimeConfig,
    mut cmd_rx: mpsc::Receiver<ClientCommand>,
    connected: watch::Sender<bool>,
) {
    // The gate and call binding outlive individual connections.
    let (evt_tx, mut evt_rx) = mpsc::channel::<ClientEvent>(64);
    let mut gate = SessionGate::new(evt_tx.clone());
    let mut call_tx: Option<mpsc::Sender<ServerEvent>> = None;
    let mut session_id: Option<String> = None;

    let mut attempts: u32 = 0;
    let mut backoff = BACKOFF_INITIAL;

    loop {
        let socket = match connect(&config).await {
            Ok(socket) => socket,
            Err(e) => {
                attempts += 1;
                if attempts >= MAX_RECONNECT_ATTEMPTS {
                    warn!(error = %e, attempts, "giving up on realtime provider");
                    drain_commands_forever(cmd_rx).await;
                    return;
                }
                warn!(error = %e, attempts, backoff_secs = backoff.as_secs(), "realtime connect failed");
                if wait_backoff(backoff, &mut cmd_rx, &mut gate, &mut call_tx).await {
                    return;
                }
                backoff = (backoff * 2).min(BACKOFF_CAP);
                continue;
            }
        };

        info!("realtime provider connected");
        attempts = 0;
        backoff = BACKOFF_INITIAL;
        let _ = connected.send(true);

        // Stale events queued for the dead socket are meaningless now.
        while evt_rx.try_recv().is_ok() {}
        gate.mark_unconfigured();

        let outcome = serve_connection(
            socket,
            &config.session,
            &mut cmd_rx,
            &mut evt_rx,
            &mut gate,
            &mut call_tx,
            &mut session_id,
        )
        .await;
        let _ = connected.send(false);

        match outcome {
            ServeOutcome::Shutdown => {
                info!("realtime client shut down");
                return;
            }
            ServeOutcome::ConnectionLost(reason) => {
                // Per-session server state is gone with the connection.
                warn!(%reason, last_session = ?session_id, "realtime connection lost; reconnecting");
            }
        }
    }
}

enum ServeOutcome {
    Shutdown,
    ConnectionLost(String),
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(config: &RealtimeConfig) -> Result<WsStream, String> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| format!("bad realtime URL: {}", e))?;
    let auth = format!("Bearer {}", config.api_key)
        .parse()
        .map_err(|_| "API key is not a valid header value".to_string())?;
    request.headers_mut().insert("Authorization", auth);

    let (socket, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| e.to_string())?;
    Ok(socket)
}

async fn serve_connection(
    socket: WsStream,
    session: &SessionConfig,
    cmd_rx: &mut mpsc::Receiver<ClientCommand>,
    evt_rx: &mut mpsc::Receiver<ClientEvent>,
    gate: &mut SessionGate,
    call_tx: &mut Option<mpsc::Sender<ServerEvent>>,
    session_id: &mut Option<String>,
) -> ServeOutcome {
    let (mut sink, mut stream) = socket.split();

    // Configure the fresh session before anything else flows.
    let update = ClientEvent::SessionUpdate {
        session: session.clone(),
    };
    if let Err(e) = send_event(&mut sink, &update).await {
        return ServeOutcome::ConnectionLost(e);
    }

    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_interval.reset();
    let mut pong_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            command = cmd_rx.recv() => match command {
                Some(ClientCommand::SendAudio(audio)) => gate.send_audio(audio).await,
                Some(ClientCommand::CreateItem(item)) => {
                    if let Err(e) = send_event(&mut sink, &ClientEvent::ConversationItemCreate { item }).await {
                        return ServeOutcome::ConnectionLost(e);
                    }
                }
                Some(ClientCommand::CreateResponse) => {
                    if let Err(e) = send_event(&mut sink, &ClientEvent::ResponseCreate).await {
                        return ServeOutcome::ConnectionLost(e);
                    }
                }
                Some(ClientCommand::Attach { tx }) => *call_tx = Some(tx),
                Some(ClientCommand::Configure) => {
                    gate.mark_unconfigured();
                    let update = ClientEvent::SessionUpdate { session: session.clone() };
                    if let Err(e) = send_event(&mut sink, &update).await {
                        return ServeOutcome::ConnectionLost(e);
                    }
                }
                Some(ClientCommand::Detach) => {
                    *call_tx = None;
                    gate.clear();
                }
                Some(ClientCommand::Shutdown) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return ServeOutcome::Shutdown;
                }
            },
            event = evt_rx.recv() => {
                // Sender half lives in this task, so recv never yields None.
                if let Some(event) = event {
                    if let Err(e) = send_event(&mut sink, &event).await {
                        return ServeOutcome::ConnectionLost(e);
                    }
                }
            }
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    handle_server_text(&text, gate, call_tx, session_id).await;
                }
                Some(Ok(Message::Pong(_))) => pong_deadline = None,
                Some(Ok(Message::Close(_))) => {
                    return ServeOutcome::ConnectionLost("server closed".to_string());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return ServeOutcome::ConnectionLost(e.to_string()),
                None => return ServeOutcome::ConnectionLost("stream ended".to_string()),
            },
            _ = ping_interval.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    return ServeOutcome::ConnectionLost("ping failed".to_string());
                }
                pong_deadline = Some(Instant::now() + PONG_DEADLINE);
            }
            _ = sleep_until_opt(pong_deadline), if pong_deadline.is_some() => {
                return ServeOutcome::ConnectionLost("pong timeout".to_string());
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn send_event<S>(sink: &mut S, event: &ClientEvent) -> Result<(), String>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let json = serde_json::to_string(event).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json)).await.map_err(|e| e.to_string())
}

async fn handle_server_text(
    text: &str,
    gate: &mut SessionGate,
    call_tx: &Option<mpsc::Sender<ServerEvent>>,
    session_id: &mut Option<String>,
) {
    let event: ServerEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            debug!(error = %e, "unparseable server message dropped");
            return;
        }
    };

    match &event {
        ServerEvent::SessionCreated { session } => {
            *session_id = session.id.clone();
            debug!(id = ?session.id, "realtime session created");
        }
        ServerEvent::SessionUpdated { session } => {
            if session.id.is_some() {
                *session_id = session.id.clone();
            }
            gate.mark_configured().await;
        }
        ServerEvent::Error { error } => {
            if !error.is_fatal() {
                warn!(code = ?error.code, message = ?error.message, "realtime error (continuing)");
            }
        }
        ServerEvent::Unknown => {
            debug!("unrecognized server event type dropped");
            return;
        }
        _ => {}
    }

    if let Some(tx) = call_tx {
        if tx.send(event).await.is_err() {
            debug!("call mailbox gone; server event dropped");
        }
    }
}

/// During backoff, commands must still be serviced so caller audio keeps
/// queueing and teardown works. Returns true when shutdown was requested.
async fn wait_backoff(
    backoff: Duration,
    cmd_rx: &mut mpsc::Receiver<ClientCommand>,
    gate: &mut SessionGate,
    call_tx: &mut Option<mpsc::Sender<ServerEvent>>,
) -> bool {
    let deadline = Instant::now() + backoff;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return false,
            command = cmd_rx.recv() => match command {
                Some(ClientCommand::SendAudio(audio)) => gate.send_audio(audio).await,
                Some(ClientCommand::Attach { tx }) => *call_tx = Some(tx),
                Some(ClientCommand::Detach) => {
                    *call_tx = None;
                    gate.clear();
                }
                Some(ClientCommand::Configure) => gate.mark_unconfigured(),
                Some(ClientCommand::CreateItem(_)) | Some(ClientCommand::CreateResponse) => {
                    debug!("dropping AI request while disconnected");
                }
                Some(ClientCommand::Shutdown) | None => return true,
            },
        }
    }
}

async fn drain_commands_forever(mut cmd_rx: mpsc::Receiver<ClientCommand>) {
    while let Some(command) = cmd_rx.recv().await {
        if matches!(command, ClientCommand::Shutdown) {
            return;
        }
    }
}
