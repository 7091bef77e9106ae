use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;

use super::domain::admission::{admit, Admission, AdmissionRequest};
use super::domain::protocol::{
    decode_image, encode_response, parse_message, ClientMessage, CloseCode, ServerMessage,
};
use super::infrastructure::user_registry::UserRegistry;
use crate::client::session::{ClientStatus, Outbound, Session};
use crate::client::session_table::SessionTable;
use crate::decision::domain::action::{Action, Reason};
use crate::decision::domain::decision_engine::Decision;
use crate::shared::clock::unix_now;
use crate::state::domain::shared_state::SharedState;
use crate::state::domain::shared_state_store::StateError;

/// How long a closing connection may take to flush queued messages.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;

#[derive(Clone, Debug, PartialEq)]
pub struct GatewayConfig {
    pub bind: SocketAddr,
    pub idle_timeout: Duration,
    pub monitor_interval: Duration,
    /// Most sessions admitted at once; normally the pool ceiling.
    pub ceiling: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8765)),
            idle_timeout: Duration::from_secs(60),
            monitor_interval: Duration::from_millis(500),
            ceiling: 150,
        }
    }
}

enum Registration {
    Registered(Arc<Session>),
    Paused,
    Refused {
        code: CloseCode,
        notice: Option<Reason>,
    },
}

/// Accepts WebSocket clients, admits them and feeds their frames to the pool.
///
/// Sockets are only ever touched by their own connection task; the monitor
/// closes sessions through their outbound queue.
pub struct Gateway {
    config: GatewayConfig,
    shared: SharedState,
    sessions: SessionTable,
    registry: Arc<UserRegistry>,
    admission: Mutex<()>,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        shared: SharedState,
        sessions: SessionTable,
        registry: Arc<UserRegistry>,
    ) -> Self {
        Self {
            config,
            shared,
            sessions,
            registry,
            admission: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        TcpListener::bind(self.config.bind).await
    }

    /// Accepts connections on `listener` and runs the state monitor until
    /// `shutdown` flips to `true`.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        if let Ok(addr) = listener.local_addr() {
            log::info!("Gateway listening on ws://{addr}");
        }

        let monitor = {
            let gateway = self.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(gateway.config.monitor_interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = gateway.refresh().await {
                                log::warn!("State monitor pass failed: {e}");
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            })
        };

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let gateway = self.clone();
                        tokio::spawn(async move { gateway.handle_connection(stream, peer).await });
                    }
                    Err(e) => log::warn!("Failed to accept connection: {e}"),
                },
                _ = shutdown.changed() => break,
            }
        }

        let _ = monitor.await;
        log::info!("Gateway stopped ({} sessions open)", self.sessions.len());
    }

    /// One monitor pass: applies pending closes and status changes from the
    /// shared state to local sessions.
    pub async fn refresh(&self) -> Result<(), StateError> {
        let snapshot = self.shared.snapshot().await?;

        for session in self.sessions.sessions() {
            let username = session.username().to_string();

            if snapshot.pending_close.contains(&username) {
                log::info!("Closing {username}: pool is over capacity");
                session.close(CloseCode::ServerFull);
                self.shared.clear_pending_close(&username).await?;
                self.evict(&session).await?;
            } else if snapshot.deactivated.contains(&username) {
                log::info!("Closing {username}: deactivated");
                session.set_status(ClientStatus::Deactivated);
                session.respond(notice(&username, Reason::Unavailable));
                session.close(CloseCode::NotAvailable);
                self.evict(&session).await?;
            } else if snapshot.blocked.contains(&username) || self.registry.is_denied(&username)
            {
                log::info!("Closing {username}: blocked");
                session.set_status(ClientStatus::Blocked);
                session.respond(notice(&username, Reason::Blocked));
                session.close(CloseCode::Blocked);
                self.evict(&session).await?;
            } else if snapshot.paused.contains(&username) {
                if session.status() != ClientStatus::Paused {
                    log::info!("{username} paused");
                    session.set_status(ClientStatus::Paused);
                }
            } else if session.status() == ClientStatus::Paused {
                log::info!("{username} resumed");
                session.set_status(ClientStatus::Active);
            }
        }

        for username in &snapshot.pending_close {
            if !self.sessions.contains(username) {
                log::debug!("Dropping close request for departed {username}");
                self.shared.clear_pending_close(username).await?;
            }
        }
        Ok(())
    }

    async fn evict(&self, session: &Arc<Session>) -> Result<(), StateError> {
        if self.sessions.remove(session) {
            self.shared.mark_inactive(session.username()).await?;
        }
        Ok(())
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                log::debug!("WebSocket handshake with {peer} failed: {e}");
                return;
            }
        };
        log::debug!("Connection opened: {peer}");

        let (sink, mut source) = ws.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let mut writer = tokio::spawn(write_loop(sink, rx, stop_rx));
        let mut writer_done = false;
        let mut session: Option<Arc<Session>> = None;

        loop {
            let incoming = tokio::select! {
                next = tokio::time::timeout(self.config.idle_timeout, source.next()) => next,
                _ = &mut writer => {
                    writer_done = true;
                    break;
                }
            };

            let message = match incoming {
                Err(_) => {
                    log::info!("Closing idle connection {peer}");
                    match &session {
                        Some(s) => s.close(CloseCode::IdleTimeout),
                        None => {
                            let _ = tx.send(Outbound::Close(CloseCode::IdleTimeout));
                        }
                    }
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    log::debug!("Connection error from {peer}: {e}");
                    if let Some(s) = &session {
                        s.set_status(ClientStatus::ConnectionError);
                    }
                    break;
                }
                Ok(Some(Ok(message))) => message,
            };

            let text = match message {
                WsMessage::Text(text) => text,
                WsMessage::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        let _ = tx.send(Outbound::Response(error_notice(&session)));
                        continue;
                    }
                },
                WsMessage::Close(_) => break,
                _ => continue,
            };

            if session.as_ref().is_some_and(|s| s.is_closed()) {
                break;
            }
            if !self.handle_text(text, &tx, &mut session).await {
                break;
            }
        }

        if let Some(session) = &session {
            if let Err(e) = self.evict(session).await {
                log::warn!("Failed to mark {} inactive: {e}", session.username());
            }
            log::info!(
                "{} disconnected after {:.0}s ({} frames dropped)",
                session.username(),
                (unix_now() - session.joined_at()).max(0.0),
                session.frames_dropped()
            );
        }

        if !writer_done {
            let _ = stop_tx.send(());
            if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut writer)
                .await
                .is_err()
            {
                writer.abort();
            }
        }
        log::debug!("Connection closed: {peer}");
    }

    /// Handles one text message. Returns `false` when the connection
    /// should be closed.
    async fn handle_text(
        &self,
        text: String,
        tx: &mpsc::UnboundedSender<Outbound>,
        session: &mut Option<Arc<Session>>,
    ) -> bool {
        let message = match parse_message(&text) {
            Ok(m) => m,
            Err(e) => {
                log::debug!("Rejected message: {e}");
                let _ = tx.send(Outbound::Response(error_notice(session)));
                return true;
            }
        };

        let current = match session.clone() {
            Some(s) => s,
            None => match self.register(&message.username, tx).await {
                Ok(Registration::Registered(s)) => {
                    *session = Some(Arc::clone(&s));
                    s
                }
                Ok(Registration::Paused) => {
                    let _ = tx.send(Outbound::Response(paused_notice(&message)));
                    return true;
                }
                Ok(Registration::Refused { code, notice: reason }) => {
                    log::info!(
                        "Refused {}: {} ({})",
                        message.username,
                        code.description(),
                        code.code()
                    );
                    if let Some(reason) = reason {
                        let _ = tx.send(Outbound::Response(notice(&message.username, reason)));
                    }
                    let _ = tx.send(Outbound::Close(code));
                    return false;
                }
                Err(e) => {
                    log::warn!("Admission of {} failed: {e}", message.username);
                    let _ = tx.send(Outbound::Response(error_notice(session)));
                    return true;
                }
            },
        };

        if message.username != current.username() {
            log::debug!(
                "{} sent a frame labelled {}; ignoring the label",
                current.username(),
                message.username
            );
        }

        if current.status() == ClientStatus::Paused {
            current.respond(paused_notice(&message));
            return true;
        }

        let sent_at = message.timestamp.unwrap_or_else(unix_now);
        let index = current.next_frame_index();
        let decoded = tokio::task::spawn_blocking(move || decode_image(&message, index)).await;
        match decoded {
            Ok(Ok(frame)) => {
                current.submit_frame(frame, sent_at);
            }
            Ok(Err(e)) => {
                log::debug!("Bad frame from {}: {e}", current.username());
                current.respond(error_notice(session));
            }
            Err(e) => {
                log::warn!("Frame decode task failed: {e}");
                current.respond(error_notice(session));
            }
        }
        true
    }

    async fn register(
        &self,
        username: &str,
        tx: &mpsc::UnboundedSender<Outbound>,
    ) -> Result<Registration, StateError> {
        let _guard = self.admission.lock().await;

        let system_full = self.shared.system_full().await?;
        let request = AdmissionRequest {
            system_full,
            live_sessions: self.sessions.len(),
            ceiling: self.config.ceiling,
            known: self.registry.is_known(username),
            allowed: self.registry.is_allowed(username),
            deactivated: self.shared.is_deactivated(username).await?,
            blocked: self.shared.is_blocked(username).await?,
            denied: self.registry.is_denied(username),
            duplicate: self.sessions.contains(username),
            paused: self.shared.is_paused(username).await?,
        };

        match admit(&request) {
            Admission::Refuse { code, notice } => {
                if code == CloseCode::ServerFull && !system_full {
                    log::warn!("Gateway at capacity ({} sessions)", self.config.ceiling);
                    self.shared.set_system_full(true).await?;
                }
                Ok(Registration::Refused { code, notice })
            }
            Admission::Paused => Ok(Registration::Paused),
            Admission::Accept => {
                let registry = Arc::clone(&self.registry);
                let name = username.to_string();
                let reference =
                    match tokio::task::spawn_blocking(move || registry.reference(&name)).await {
                        Ok(Ok(reference)) => reference,
                        Ok(Err(e)) => {
                            log::warn!("No usable reference image for {username}: {e}");
                            return Ok(unavailable());
                        }
                        Err(e) => {
                            log::warn!("Reference load task failed: {e}");
                            return Ok(unavailable());
                        }
                    };

                let session = Arc::new(Session::new(reference, tx.clone()));
                if !self.sessions.try_insert(Arc::clone(&session)) {
                    return Ok(Registration::Refused {
                        code: CloseCode::DuplicateSession,
                        notice: None,
                    });
                }
                self.shared.clear_pending_close(username).await?;
                self.shared.mark_active(username).await?;
                log::info!(
                    "{username} connected ({}/{})",
                    self.sessions.len(),
                    self.config.ceiling
                );
                Ok(Registration::Registered(session))
            }
        }
    }
}

fn unavailable() -> Registration {
    Registration::Refused {
        code: CloseCode::NotAvailable,
        notice: Some(Reason::Unavailable),
    }
}

fn notice(username: &str, reason: Reason) -> Decision {
    let now = unix_now();
    Decision {
        action: Action::Error,
        reason,
        username: username.to_string(),
        sent_at: now,
        finished_at: now,
    }
}

fn error_notice(session: &Option<Arc<Session>>) -> Decision {
    let username = session.as_ref().map(|s| s.username()).unwrap_or_default();
    notice(username, Reason::Empty)
}

fn paused_notice(message: &ClientMessage) -> Decision {
    let now = unix_now();
    Decision {
        action: Action::None,
        reason: Reason::Paused,
        username: message.username.clone(),
        sent_at: message.timestamp.unwrap_or(now),
        finished_at: now,
    }
}

/// Drains the connection's outbound queue to the socket.
///
/// A sign-out decision is followed by a 4004 close; any close ends the loop.
async fn write_loop(
    mut sink: WsSink,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        let outbound = tokio::select! {
            biased;
            next = rx.recv() => match next {
                Some(outbound) => outbound,
                None => break,
            },
            _ = &mut stop => break,
        };

        match outbound {
            Outbound::Response(decision) => {
                let signed_out = decision.action == Action::SignOut;
                let text = encode_response(&ServerMessage::from(decision));
                if sink.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
                if signed_out {
                    send_close(&mut sink, CloseCode::SignedOut).await;
                    break;
                }
            }
            Outbound::Close(code) => {
                send_close(&mut sink, code).await;
                break;
            }
        }
    }
}

async fn send_close(sink: &mut WsSink, code: CloseCode) {
    let frame = CloseFrame {
        code: WsCloseCode::Library(code.code()),
        reason: code.description().into(),
    };
    if let Err(e) = sink.send(WsMessage::Close(Some(frame))).await {
        log::debug!("Failed to send close frame: {e}");
    }
}
