use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::engine::{Engine, RtcError};
use super::peer::{
    ConnectionState, DisconnectHandler, IceCandidateHandler, PeerCallbacks, PeerConnection,
    TrackHandler,
};
use super::track::{LocalTrack, RemoteTrack};
use crate::registry::Membership;
use crate::signaling::{
    ClientConfig, IceCandidateInit, MessageType, Payload, PeerId, PeerJoinedPayload,
    SessionDescription, Signaler, SignalingClient, SignalingMessage,
};

pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Offer round-trip limit; None waits forever.
    pub negotiation_timeout: Option<Duration>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout: Some(DEFAULT_NEGOTIATION_TIMEOUT),
        }
    }
}

/// Per-remote-peer state as seen from the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    NoConnection,
    Connecting,
    Connected,
    Closed,
}

pub type RemoteTrackHandler = Arc<dyn Fn(PeerId, RemoteTrack) + Send + Sync>;
pub type PeerDisconnectHandler = Arc<dyn Fn(PeerId) + Send + Sync>;

#[derive(Clone, Default)]
pub struct ManagerHandlers {
    pub on_remote_track: Option<RemoteTrackHandler>,
    /// Fires once per peer whose connection had reached Connected.
    pub on_peer_disconnect: Option<PeerDisconnectHandler>,
}

/// Full-mesh connection table for the local peer.
///
/// Whoever sees `peer_joined` offers; the newcomer only answers. Lock order
/// is local tracks before the peer table; neither is held across engine calls
/// except for the connected-state snapshot.
pub struct PeerConnectionManager {
    config: ManagerConfig,
    engine: Arc<dyn Engine>,
    signaler: Arc<dyn Signaler>,
    handlers: ManagerHandlers,
    peers: RwLock<HashMap<PeerId, Arc<PeerConnection>>>,
    local_tracks: RwLock<Vec<LocalTrack>>,
    this: Weak<Self>,
}

impl PeerConnectionManager {
    pub fn new(
        config: ManagerConfig,
        engine: Arc<dyn Engine>,
        signaler: Arc<dyn Signaler>,
        handlers: ManagerHandlers,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            config,
            engine,
            signaler,
            handlers,
            peers: RwLock::new(HashMap::new()),
            local_tracks: RwLock::new(Vec::new()),
            this: this.clone(),
        })
    }

    /// Build a manager driven by `client`'s inbound negotiation frames.
    ///
    /// For a client that has already joined; frames it received before this
    /// call are not replayed.
    pub async fn attach(
        client: &Arc<SignalingClient>,
        engine: Arc<dyn Engine>,
        config: ManagerConfig,
        handlers: ManagerHandlers,
    ) -> Arc<Self> {
        let manager = Self::new(config, engine, client.clone(), handlers);
        manager.subscribe(client).await;
        manager
    }

    /// Dial the signaling server, subscribe, then join, so that the first
    /// `peer_joined` or `offer` already has a handler.
    pub async fn connect(
        client_config: &ClientConfig,
        membership: Membership,
        engine: Arc<dyn Engine>,
        config: ManagerConfig,
        handlers: ManagerHandlers,
    ) -> Result<(Arc<SignalingClient>, Arc<Self>), RtcError> {
        let client = SignalingClient::dial(client_config, membership).await?;
        let manager = Self::new(config, engine, client.clone(), handlers);
        manager.subscribe(&client).await;
        client.join()?;
        Ok((client, manager))
    }

    async fn subscribe(self: &Arc<Self>, client: &SignalingClient) {
        for kind in [
            MessageType::PeerJoined,
            MessageType::PeerLeft,
            MessageType::Offer,
            MessageType::Answer,
            MessageType::Candidate,
        ] {
            let weak = Arc::downgrade(self);
            client
                .on(kind, move |msg: Arc<SignalingMessage>| {
                    let weak = weak.clone();
                    async move {
                        let Some(manager) = weak.upgrade() else { return };
                        if let Err(e) = manager.handle_message(&msg).await {
                            warn!("Failed to handle {} from {}: {}", msg.kind, msg.peer_id, e);
                        }
                    }
                })
                .await;
        }
    }

    pub async fn handle_message(&self, msg: &SignalingMessage) -> Result<(), RtcError> {
        if &msg.peer_id == self.signaler.peer_id() {
            return Ok(());
        }

        match msg.decode_payload()? {
            Payload::PeerJoined(joined) => self.handle_peer_joined(joined).await,
            Payload::PeerLeft(left) => {
                self.remove_peer(&left.peer_id).await;
                Ok(())
            }
            Payload::Offer(offer) => self.handle_offer(&msg.peer_id, offer.sdp).await,
            Payload::Answer(answer) => self.handle_answer(&msg.peer_id, answer.sdp).await,
            Payload::Candidate(c) => self.handle_candidate(&msg.peer_id, c.candidate).await,
            _ => {
                debug!("Ignoring {} message", msg.kind);
                Ok(())
            }
        }
    }

    async fn handle_peer_joined(&self, joined: PeerJoinedPayload) -> Result<(), RtcError> {
        if &joined.peer_id == self.signaler.peer_id() {
            return Ok(());
        }
        info!("Peer joined: {} ({})", joined.username, joined.peer_id);

        let pc = self.ensure_peer(&joined.peer_id).await?;
        let offer = pc.create_offer().await?;
        self.signaler.send(SignalingMessage::offer(
            self.signaler.session_id(),
            self.signaler.peer_id(),
            offer,
        ))?;
        debug!("Sent offer to {}", joined.peer_id);

        if let Some(timeout) = self.config.negotiation_timeout {
            self.spawn_negotiation_watchdog(pc, timeout);
        }
        Ok(())
    }

    async fn handle_offer(&self, from: &PeerId, sdp: SessionDescription) -> Result<(), RtcError> {
        info!("Received offer from {}", from);
        let pc = self.ensure_peer(from).await?;
        pc.set_remote_description(sdp).await?;
        let answer = pc.create_answer().await?;
        self.signaler.send(SignalingMessage::answer(
            self.signaler.session_id(),
            self.signaler.peer_id(),
            answer,
        ))?;
        debug!("Sent answer to {}", from);
        Ok(())
    }

    async fn handle_answer(&self, from: &PeerId, sdp: SessionDescription) -> Result<(), RtcError> {
        let pc = self
            .peer(from)
            .await
            .ok_or_else(|| RtcError::UnknownPeer(from.clone()))?;
        info!("Received answer from {}", from);
        pc.set_remote_description(sdp).await
    }

    async fn handle_candidate(&self, from: &PeerId, candidate: IceCandidateInit) -> Result<(), RtcError> {
        match self.peer(from).await {
            Some(pc) => pc.add_ice_candidate(candidate).await,
            None => {
                debug!("Dropping candidate from unknown peer {}", from);
                Ok(())
            }
        }
    }

    /// Existing connection for `peer_id`, or a new one carrying every local track.
    async fn ensure_peer(&self, peer_id: &PeerId) -> Result<Arc<PeerConnection>, RtcError> {
        if let Some(pc) = self.peer(peer_id).await {
            return Ok(pc);
        }

        let pc = PeerConnection::open(
            peer_id.clone(),
            self.signaler.session_id().clone(),
            self.engine.as_ref(),
            self.peer_callbacks(peer_id),
        )
        .await?;

        let replayed = self.local_tracks.read().await.clone();
        for track in &replayed {
            if let Err(e) = pc.add_track(track.clone()).await {
                warn!("Failed to add track {} for {}: {}", track.id(), peer_id, e);
            }
        }

        let (existing, missed) = {
            let tracks = self.local_tracks.read().await;
            let mut peers = self.peers.write().await;
            if let Some(existing) = peers.get(peer_id).cloned() {
                (Some(existing), Vec::new())
            } else {
                peers.insert(peer_id.clone(), pc.clone());
                (None, tracks[replayed.len()..].to_vec())
            }
        };

        if let Some(existing) = existing {
            if let Err(e) = pc.close().await {
                warn!("Failed to close duplicate connection to {}: {}", peer_id, e);
            }
            return Ok(existing);
        }

        for track in missed {
            if let Err(e) = pc.add_track(track.clone()).await {
                warn!("Failed to add track {} for {}: {}", track.id(), peer_id, e);
            }
        }

        info!("Created peer connection for {}", peer_id);
        Ok(pc)
    }

    fn peer_callbacks(&self, peer_id: &PeerId) -> PeerCallbacks {
        let weak = self.this.clone();
        let on_ice_candidate: IceCandidateHandler = Arc::new(move |candidate: IceCandidateInit| {
            let Some(manager) = weak.upgrade() else { return };
            let msg = SignalingMessage::candidate(
                manager.signaler.session_id(),
                manager.signaler.peer_id(),
                candidate,
            );
            if let Err(e) = manager.signaler.send(msg) {
                warn!("Failed to send local candidate: {}", e);
            }
        });

        let on_track = self.handlers.on_remote_track.clone().map(|handler| {
            let peer_id = peer_id.clone();
            Arc::new(move |track: RemoteTrack| handler(peer_id.clone(), track)) as TrackHandler
        });

        // Lost and failed connections both leave the table.
        let weak = self.this.clone();
        let on_disconnect: DisconnectHandler = Arc::new(move |peer_id: PeerId| {
            let weak = weak.clone();
            tokio::spawn(async move {
                if let Some(manager) = weak.upgrade() {
                    manager.remove_peer(&peer_id).await;
                }
            });
        });

        PeerCallbacks {
            on_ice_candidate: Some(on_ice_candidate),
            on_track,
            on_disconnect: Some(on_disconnect.clone()),
            on_failure: Some(on_disconnect),
        }
    }

    fn spawn_negotiation_watchdog(&self, pc: Arc<PeerConnection>, timeout: Duration) {
        let weak = self.this.clone();
        let pc = Arc::downgrade(&pc);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let (Some(manager), Some(pc)) = (weak.upgrade(), pc.upgrade()) else {
                return;
            };
            if pc.has_remote_description().await {
                return;
            }
            warn!("Negotiation with {} timed out after {:?}", pc.peer_id(), timeout);
            manager.detach(pc.peer_id(), Some(&pc)).await;
        });
    }

    /// Close and forget the connection to `peer_id`. Returns false if there
    /// was none.
    pub async fn remove_peer(&self, peer_id: &PeerId) -> bool {
        self.detach(peer_id, None).await
    }

    async fn detach(&self, peer_id: &PeerId, expected: Option<&Arc<PeerConnection>>) -> bool {
        let removed = {
            let mut peers = self.peers.write().await;
            let replaced = match (peers.get(peer_id), expected) {
                (Some(current), Some(expected)) => !Arc::ptr_eq(current, expected),
                _ => false,
            };
            if replaced {
                None
            } else {
                peers.remove(peer_id)
            }
        };
        let Some(pc) = removed else {
            return false;
        };

        if let Err(e) = pc.close().await {
            warn!("Failed to close connection to {}: {}", peer_id, e);
        }
        info!("Removed peer connection for {}", peer_id);

        if pc.take_disconnect().await {
            if let Some(handler) = &self.handlers.on_peer_disconnect {
                handler(peer_id.clone());
            }
        }
        true
    }

    /// Publish `track` to every connected peer and to every future connection.
    pub async fn add_local_track(&self, track: LocalTrack) {
        let connected = {
            let mut tracks = self.local_tracks.write().await;
            tracks.push(track.clone());
            let peers = self.peers.read().await;
            let mut connected = Vec::with_capacity(peers.len());
            for pc in peers.values() {
                if pc.is_connected().await {
                    connected.push(pc.clone());
                }
            }
            connected
        };

        for pc in connected {
            if let Err(e) = pc.add_track(track.clone()).await {
                warn!("Failed to add track {} for {}: {}", track.id(), pc.peer_id(), e);
            }
        }
        info!("Added local {} track {}", track.kind(), track.id());
    }

    /// Close every connection. Disconnect callbacks do not fire.
    pub async fn close(&self) {
        let drained: Vec<_> = self.peers.write().await.drain().collect();
        let count = drained.len();
        for (peer_id, pc) in drained {
            if let Err(e) = pc.close().await {
                warn!("Failed to close connection to {}: {}", peer_id, e);
            }
        }
        info!("Closed {} peer connections", count);
    }

    pub async fn peer(&self, peer_id: &PeerId) -> Option<Arc<PeerConnection>> {
        self.peers.read().await.get(peer_id).cloned()
    }

    pub async fn peers(&self) -> Vec<PeerId> {
        self.peers.read().await.keys().cloned().collect()
    }

    pub async fn peer_state(&self, peer_id: &PeerId) -> PeerState {
        let Some(pc) = self.peer(peer_id).await else {
            return PeerState::NoConnection;
        };
        match pc.state().await {
            ConnectionState::Connecting => PeerState::Connecting,
            ConnectionState::Connected => PeerState::Connected,
            ConnectionState::Closed => PeerState::Closed,
        }
    }

    pub async fn local_tracks(&self) -> Vec<LocalTrack> {
        self.local_tracks.read().await.clone()
    }
}
