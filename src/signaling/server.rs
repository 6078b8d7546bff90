use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Bytes, Message, Utf8Bytes};
use tracing::{debug, error, info, warn};

use super::hub::{ClientHandle, SessionHub};
use super::messages::{JoinPayload, MessageType, SignalingMessage};
use super::types::{OutboundMessage, SignalingError};
use crate::registry::{Membership, SessionRegistry};

pub const DEFAULT_SIGNALING_PORT: u16 = 8080;
pub const SIGNALING_PATH: &str = "/ws";
const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOUND_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Per-connection outbound queue depth; broadcasts to a full queue are dropped
    pub outbound_queue_depth: usize,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            outbound_queue_depth: OUTBOUND_QUEUE_DEPTH,
            ping_interval: PING_INTERVAL,
            pong_timeout: PONG_TIMEOUT,
        }
    }
}

#[derive(Clone)]
struct ServerContext {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    hub: Arc<SessionHub>,
}

pub struct SignalingServer {
    ctx: ServerContext,
}

impl SignalingServer {
    pub fn new(config: ServerConfig, registry: Arc<SessionRegistry>) -> Self {
        Self {
            ctx: ServerContext {
                config,
                registry,
                hub: Arc::new(SessionHub::new()),
            },
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.ctx.registry
    }

    pub fn hub(&self) -> &Arc<SessionHub> {
        &self.ctx.hub
    }

    pub async fn run(&self, addr: &str) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until accept fails.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        info!(
            "Signaling server listening on {}{}",
            listener.local_addr()?,
            SIGNALING_PATH
        );

        loop {
            let (stream, addr) = listener.accept().await?;
            let ctx = self.ctx.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, ctx).await {
                    error!("Connection error from {}: {}", addr, e);
                }
            });
        }
    }
}

/// Per-connection state owned by the reader loop
struct ServerClient {
    addr: SocketAddr,
    tx: async_channel::Sender<OutboundMessage>,
    membership: Option<Membership>,
}

impl ServerClient {
    fn reply(&self, message: &SignalingMessage) {
        match message.to_json() {
            Ok(json) => {
                if self.tx.try_send(OutboundMessage::from(json)).is_err() {
                    warn!("Could not queue reply to {}", self.addr);
                }
            }
            Err(e) => error!("Failed to encode reply: {}", e),
        }
    }

    fn reply_error(&self, request: &SignalingMessage, message: impl Into<String>) {
        let (session_id, peer_id) = match &self.membership {
            Some(m) => (&m.session_id, &m.peer_id),
            None => (&request.session_id, &request.peer_id),
        };
        self.reply(&SignalingMessage::error(session_id, peer_id, message));
    }
}

fn check_path(request: &Request, response: Response) -> Result<Response, ErrorResponse> {
    if request.uri().path() == SIGNALING_PATH {
        return Ok(response);
    }
    let mut rejection = ErrorResponse::new(Some(format!(
        "signaling endpoint is {}",
        SIGNALING_PATH
    )));
    *rejection.status_mut() = StatusCode::NOT_FOUND;
    Err(rejection)
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: ServerContext,
) -> Result<(), SignalingError> {
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, check_path).await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    info!("WebSocket connection from {}", addr);

    let (tx, rx) = async_channel::bounded::<OutboundMessage>(ctx.config.outbound_queue_depth.max(1));
    let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<Message>();

    let send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                Ok(msg) = rx.recv() => {
                    if ws_tx.send(Message::Text(msg.into_inner())).await.is_err() {
                        break;
                    }
                }
                Some(ctrl_msg) = ctrl_rx.recv() => {
                    if ws_tx.send(ctrl_msg).await.is_err() {
                        break;
                    }
                }
                else => break,
            }
        }
    });

    let mut client = ServerClient {
        addr,
        tx,
        membership: None,
    };
    let mut ping_interval = tokio::time::interval(ctx.config.ping_interval);
    ping_interval.reset();
    let mut waiting_for_pong = false;
    let mut pong_deadline: Option<tokio::time::Instant> = None;

    loop {
        let pong_timeout = async {
            match pong_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = ping_interval.tick() => {
                if waiting_for_pong {
                    warn!("No Pong received, disconnecting {}", addr);
                    break;
                }
                if ctrl_tx.send(Message::Ping(Bytes::new())).is_err() {
                    break;
                }
                waiting_for_pong = true;
                pong_deadline = Some(tokio::time::Instant::now() + ctx.config.pong_timeout);
                debug!("Ping sent to {}", addr);
            }

            _ = pong_timeout => {
                warn!("Pong timeout, disconnecting {}", addr);
                break;
            }

            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        warn!("WebSocket error from {}: {}", addr, e);
                        break;
                    }
                    None => break,
                };

                match msg {
                    Message::Text(text) => {
                        handle_text_message(text, &mut client, &ctx).await;
                    }
                    Message::Pong(_) => {
                        waiting_for_pong = false;
                        pong_deadline = None;
                        debug!("Pong received from {}", addr);
                    }
                    Message::Close(_) => {
                        info!("Close received from {}", addr);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    if let Some(membership) = client.membership.take() {
        leave_session(&membership, &ctx).await;
    }

    send_task.abort();
    info!("WebSocket disconnected: {}", addr);

    Ok(())
}

async fn handle_text_message(text: Utf8Bytes, client: &mut ServerClient, ctx: &ServerContext) {
    let msg = match SignalingMessage::parse(text.as_str()) {
        Ok(m) => m,
        Err(e) => {
            warn!("Malformed frame from {}: {}", client.addr, e);
            let err = SignalingMessage::error(
                &Default::default(),
                &Default::default(),
                format!("Invalid message: {}", e),
            );
            client.reply(&err);
            return;
        }
    };

    match msg.kind {
        MessageType::Join => join_session(&msg, client, ctx).await,

        MessageType::Leave => match client.membership.take() {
            Some(membership) => leave_session(&membership, ctx).await,
            None => client.reply_error(&msg, SignalingError::NotJoined.to_string()),
        },

        kind if kind.is_negotiation() => {
            let Some(membership) = &client.membership else {
                client.reply_error(&msg, SignalingError::NotJoined.to_string());
                return;
            };
            let report = ctx
                .hub
                .broadcast(
                    &membership.session_id,
                    Some(&membership.peer_id),
                    &OutboundMessage::new(text),
                )
                .await;
            debug!(
                session = %membership.session_id,
                peer = %membership.peer_id,
                kind = %msg.kind,
                delivered = report.delivered,
                dropped = report.dropped,
                "Relayed negotiation message"
            );
        }

        other => {
            warn!("Unexpected message type {} from {}", other, client.addr);
        }
    }
}

async fn join_session(msg: &SignalingMessage, client: &mut ServerClient, ctx: &ServerContext) {
    if let Some(current) = &client.membership {
        let err = SignalingError::AlreadyJoined(current.session_id.clone());
        client.reply_error(msg, err.to_string());
        return;
    }

    let username = msg
        .username
        .clone()
        .or_else(|| msg.payload_as::<JoinPayload>().ok().map(|p| p.username))
        .unwrap_or_else(|| msg.peer_id.default_username());

    if let Err(e) = ctx
        .registry
        .register_peer(&msg.session_id, &msg.peer_id, &username)
        .await
    {
        warn!("Join from {} rejected: {}", client.addr, e);
        client.reply_error(msg, e.to_string());
        return;
    }

    ctx.hub
        .register(
            &msg.session_id,
            &msg.peer_id,
            ClientHandle {
                username: username.clone(),
                tx: client.tx.clone(),
            },
        )
        .await;

    let membership = Membership {
        session_id: msg.session_id.clone(),
        peer_id: msg.peer_id.clone(),
        username,
    };

    notify(
        ctx,
        &membership,
        SignalingMessage::peer_joined(
            &membership.session_id,
            &membership.peer_id,
            &membership.username,
        ),
    )
    .await;

    info!(
        "Client {} ({}) joined session {}",
        membership.peer_id, membership.username, membership.session_id
    );
    client.membership = Some(membership);
}

async fn leave_session(membership: &Membership, ctx: &ServerContext) {
    ctx.hub
        .unregister(&membership.session_id, &membership.peer_id)
        .await;
    ctx.registry
        .remove_peer(&membership.session_id, &membership.peer_id)
        .await;

    notify(
        ctx,
        membership,
        SignalingMessage::peer_left(&membership.session_id, &membership.peer_id),
    )
    .await;

    info!(
        "Client {} left session {}",
        membership.peer_id, membership.session_id
    );
}

/// Broadcast a membership event to everyone in the session but its subject.
async fn notify(ctx: &ServerContext, membership: &Membership, event: SignalingMessage) {
    let json = match event.to_json() {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to encode {} message: {}", event.kind, e);
            return;
        }
    };
    ctx.hub
        .broadcast(
            &membership.session_id,
            Some(&membership.peer_id),
            &OutboundMessage::from(json),
        )
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_check_accepts_ws_endpoint() {
        let request = Request::builder().uri("/ws").body(()).unwrap();
        assert!(check_path(&request, Response::new(())).is_ok());
    }

    #[test]
    fn path_check_rejects_other_paths() {
        let request = Request::builder().uri("/signal").body(()).unwrap();
        let rejection = check_path(&request, Response::new(())).unwrap_err();
        assert_eq!(rejection.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn default_config_matches_constants() {
        let config = ServerConfig::default();
        assert_eq!(config.outbound_queue_depth, 256);
        assert_eq!(config.ping_interval, Duration::from_secs(30));
        assert_eq!(config.pong_timeout, Duration::from_secs(10));
    }
}
