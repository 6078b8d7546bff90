use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{RwLock, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use super::messages::{IceCandidateInit, MessageType, SessionDescription, SignalingMessage};
use super::types::{PeerId, SessionId, SignalingError};
use crate::registry::Membership;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Full endpoint URL, e.g. `ws://127.0.0.1:8080/ws`
    pub url: String,
    pub connect_timeout: Duration,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Async subscriber for one message type
pub type MessageHandler = Arc<dyn Fn(Arc<SignalingMessage>) -> BoxFuture<'static, ()> + Send + Sync>;

type HandlerMap = Arc<RwLock<HashMap<MessageType, Vec<MessageHandler>>>>;

/// Outbound side of a signaling session, as seen by the mesh manager.
pub trait Signaler: Send + Sync {
    fn session_id(&self) -> &SessionId;
    fn peer_id(&self) -> &PeerId;
    fn send(&self, message: SignalingMessage) -> Result<(), SignalingError>;
}

enum Outbound {
    Frame(Message),
    Shutdown,
}

/// Connection to the signaling server for one session membership.
///
/// A reader task dispatches inbound frames in arrival order; every matching
/// handler runs as its own task. A writer task owns the socket's sending half.
pub struct SignalingClient {
    membership: Membership,
    outbound: mpsc::UnboundedSender<Outbound>,
    connected: Arc<AtomicBool>,
    handlers: HandlerMap,
}

impl SignalingClient {
    /// Dial the server and send `join`. Fails without retrying.
    ///
    /// Frames that arrive before a handler is registered are dropped; use
    /// [`SignalingClient::dial`] and [`SignalingClient::join`] to subscribe
    /// first.
    pub async fn connect(
        config: &ClientConfig,
        membership: Membership,
    ) -> Result<Arc<Self>, SignalingError> {
        let client = Self::dial(config, membership).await?;
        client.join()?;
        Ok(client)
    }

    /// Open the socket without joining the session.
    pub async fn dial(
        config: &ClientConfig,
        membership: Membership,
    ) -> Result<Arc<Self>, SignalingError> {
        let (ws_stream, _) =
            tokio::time::timeout(config.connect_timeout, connect_async(config.url.as_str()))
                .await
                .map_err(|_| SignalingError::ConnectTimeout(config.connect_timeout))??;
        let (mut ws_tx, ws_rx) = ws_stream.split();

        info!("Connected to signaling server: {}", config.url);

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
        let connected = Arc::new(AtomicBool::new(true));
        let handlers = HandlerMap::default();

        tokio::spawn(async move {
            while let Some(item) = outbound_rx.recv().await {
                match item {
                    Outbound::Frame(msg) => {
                        if let Err(e) = ws_tx.send(msg).await {
                            debug!("Signaling write failed: {}", e);
                            break;
                        }
                    }
                    Outbound::Shutdown => {
                        let _ = ws_tx.close().await;
                        break;
                    }
                }
            }
        });

        tokio::spawn(read_loop(ws_rx, handlers.clone(), connected.clone()));

        Ok(Arc::new(Self {
            membership,
            outbound,
            connected,
            handlers,
        }))
    }

    /// Announce this membership to the session.
    pub fn join(&self) -> Result<(), SignalingError> {
        self.send(SignalingMessage::join(
            self.session_id(),
            self.peer_id(),
            self.username(),
        ))
    }

    /// Subscribe `handler` to every inbound frame of type `kind`.
    pub async fn on<F, Fut>(&self, kind: MessageType, handler: F)
    where
        F: Fn(Arc<SignalingMessage>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: MessageHandler =
            Arc::new(move |msg| -> BoxFuture<'static, ()> { Box::pin(handler(msg)) });
        self.handlers
            .write()
            .await
            .entry(kind)
            .or_default()
            .push(handler);
    }

    pub fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }
        let json = message.to_json()?;
        self.outbound
            .send(Outbound::Frame(Message::Text(json.into())))
            .map_err(|_| SignalingError::NotConnected)
    }

    pub fn send_offer(&self, sdp: SessionDescription) -> Result<(), SignalingError> {
        self.send(SignalingMessage::offer(self.session_id(), self.peer_id(), sdp))
    }

    pub fn send_answer(&self, sdp: SessionDescription) -> Result<(), SignalingError> {
        self.send(SignalingMessage::answer(self.session_id(), self.peer_id(), sdp))
    }

    pub fn send_candidate(&self, candidate: IceCandidateInit) -> Result<(), SignalingError> {
        self.send(SignalingMessage::candidate(
            self.session_id(),
            self.peer_id(),
            candidate,
        ))
    }

    /// Send `leave` and close the socket. Safe to call more than once.
    pub fn disconnect(&self) {
        if self
            .connected
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let leave = SignalingMessage::leave(self.session_id(), self.peer_id());
            match leave.to_json() {
                Ok(json) => {
                    let _ = self
                        .outbound
                        .send(Outbound::Frame(Message::Text(json.into())));
                }
                Err(e) => warn!("Failed to encode leave message: {}", e),
            }
            info!("Disconnected from signaling server");
        }
        let _ = self.outbound.send(Outbound::Shutdown);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn session_id(&self) -> &SessionId {
        &self.membership.session_id
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.membership.peer_id
    }

    pub fn username(&self) -> &str {
        &self.membership.username
    }
}

impl Signaler for SignalingClient {
    fn session_id(&self) -> &SessionId {
        SignalingClient::session_id(self)
    }

    fn peer_id(&self) -> &PeerId {
        SignalingClient::peer_id(self)
    }

    fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        SignalingClient::send(self, message)
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        let _ = self.outbound.send(Outbound::Shutdown);
    }
}

async fn read_loop(
    mut ws_rx: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    handlers: HandlerMap,
    connected: Arc<AtomicBool>,
) {
    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => match SignalingMessage::parse(text.as_str()) {
                Ok(msg) => dispatch(&handlers, msg).await,
                Err(e) => warn!("Failed to parse signaling message: {}", e),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("Signaling connection error: {}", e);
                break;
            }
        }
    }

    if connected.swap(false, Ordering::AcqRel) {
        warn!("Signaling connection closed by server");
    }
}

async fn dispatch(handlers: &HandlerMap, msg: SignalingMessage) {
    let matched = handlers
        .read()
        .await
        .get(&msg.kind)
        .cloned()
        .unwrap_or_default();

    if matched.is_empty() {
        debug!("No handler for {} message", msg.kind);
        return;
    }

    let msg = Arc::new(msg);
    for handler in matched {
        tokio::spawn(handler(msg.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connect_refused_is_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = ClientConfig::new(format!("ws://{}/ws", addr));
        let err = SignalingClient::connect(&config, Membership::generate(SessionId::from("s")))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SignalingError::Connection(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn connect_times_out_when_handshake_stalls() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept the TCP connection but never answer the upgrade.
        let _hold = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut config = ClientConfig::new(format!("ws://{}/ws", addr));
        config.connect_timeout = Duration::from_millis(200);
        let err = SignalingClient::connect(&config, Membership::generate(SessionId::from("s")))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SignalingError::ConnectTimeout(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn dispatch_runs_every_handler_for_type() {
        let handlers = HandlerMap::default();
        let (tx, mut rx) = mpsc::unbounded_channel::<&'static str>();

        for name in ["first", "second"] {
            let tx = tx.clone();
            let handler: MessageHandler = Arc::new(move |_msg| -> BoxFuture<'static, ()> {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send(name);
                })
            });
            handlers
                .write()
                .await
                .entry(MessageType::Offer)
                .or_default()
                .push(handler);
        }

        let offer = SignalingMessage::offer(
            &SessionId::from("s"),
            &PeerId::from("P1"),
            SessionDescription::offer("v=0"),
        );
        dispatch(&handlers, offer).await;
        dispatch(
            &handlers,
            SignalingMessage::leave(&SessionId::from("s"), &PeerId::from("P1")),
        )
        .await;

        let mut seen = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        seen.sort();
        assert_eq!(seen, vec!["first", "second"]);
        assert!(rx.try_recv().is_err());
    }
}
