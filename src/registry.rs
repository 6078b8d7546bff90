//! In-memory table of sessions and the peers inside them

use std::collections::HashMap;
use std::time::SystemTime;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::signaling::{PeerId, SessionId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("peer {peer} not found in session {session}")]
    PeerNotFound { session: SessionId, peer: PeerId },

    #[error("peer {peer} already in session {session}")]
    PeerAlreadyExists { session: SessionId, peer: PeerId },
}

/// Identity of one participant in one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub session_id: SessionId,
    pub peer_id: PeerId,
    pub username: String,
}

impl Membership {
    /// Fresh peer id and default username inside `session_id`.
    pub fn generate(session_id: SessionId) -> Self {
        let peer_id = PeerId::generate();
        let username = peer_id.default_username();
        Self {
            session_id,
            peer_id,
            username,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub peer_id: PeerId,
    pub username: String,
    pub connected: bool,
    pub joined_at: SystemTime,
}

impl Peer {
    fn new(peer_id: PeerId, username: String) -> Self {
        Self {
            peer_id,
            username,
            connected: true,
            joined_at: SystemTime::now(),
        }
    }
}

/// Snapshot-able session record. `active()` always equals `peers().len()`.
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    peers: HashMap<PeerId, Peer>,
    created_at: SystemTime,
    active: usize,
}

impl Session {
    fn new(id: SessionId) -> Self {
        Self {
            id,
            peers: HashMap::new(),
            created_at: SystemTime::now(),
            active: 0,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn peers(&self) -> &HashMap<PeerId, Peer> {
        &self.peers
    }

    pub fn peer(&self, peer_id: &PeerId) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn active(&self) -> usize {
        self.active
    }

    fn insert(&mut self, peer: Peer) -> Result<(), RegistryError> {
        if self.peers.contains_key(&peer.peer_id) {
            return Err(RegistryError::PeerAlreadyExists {
                session: self.id.clone(),
                peer: peer.peer_id,
            });
        }
        self.peers.insert(peer.peer_id.clone(), peer);
        self.active = self.peers.len();
        Ok(())
    }

    fn remove(&mut self, peer_id: &PeerId) -> bool {
        let removed = self.peers.remove(peer_id).is_some();
        self.active = self.peers.len();
        removed
    }
}

/// Session membership table.
///
/// One instance is owned by the server process and handed to whoever needs
/// it; all mutation goes through the single write lock, reads share it.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session with a freshly minted creator peer.
    pub async fn create_session(&self) -> Membership {
        let mut sessions = self.sessions.write().await;

        let mut session_id = SessionId::generate();
        while sessions.contains_key(&session_id) {
            session_id = SessionId::generate();
        }

        let membership = Membership::generate(session_id.clone());
        let mut session = Session::new(session_id.clone());
        // A fresh session cannot already hold the creator.
        let _ = session.insert(Peer::new(
            membership.peer_id.clone(),
            membership.username.clone(),
        ));
        sessions.insert(session_id, session);

        info!(
            session = %membership.session_id,
            peer = %membership.peer_id,
            username = %membership.username,
            "Session created"
        );
        membership
    }

    /// Mint a new peer inside an existing session.
    pub async fn join_session(&self, session_id: &SessionId) -> Result<Membership, RegistryError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.clone()))?;

        let mut membership = Membership::generate(session_id.clone());
        while session.peers.contains_key(&membership.peer_id) {
            membership = Membership::generate(session_id.clone());
        }
        session.insert(Peer::new(
            membership.peer_id.clone(),
            membership.username.clone(),
        ))?;

        info!(
            session = %session_id,
            peer = %membership.peer_id,
            username = %membership.username,
            "Peer joined session"
        );
        Ok(membership)
    }

    /// Add a known peer to an existing session.
    pub async fn add_peer(
        &self,
        session_id: &SessionId,
        peer_id: &PeerId,
        username: &str,
    ) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.clone()))?;
        session.insert(Peer::new(peer_id.clone(), username.to_owned()))?;

        info!(session = %session_id, peer = %peer_id, username, "Peer added");
        Ok(())
    }

    /// Add a peer, opening the session first when nobody is in it yet.
    pub async fn register_peer(
        &self,
        session_id: &SessionId,
        peer_id: &PeerId,
        username: &str,
    ) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.entry(session_id.clone()).or_insert_with(|| {
            info!(session = %session_id, "Session opened");
            Session::new(session_id.clone())
        });
        session.insert(Peer::new(peer_id.clone(), username.to_owned()))?;

        debug!(session = %session_id, peer = %peer_id, username, "Peer registered");
        Ok(())
    }

    /// Remove a peer. Unknown sessions and peers are ignored; the session is
    /// deleted as soon as its last peer leaves.
    pub async fn remove_peer(&self, session_id: &SessionId, peer_id: &PeerId) {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(session_id) else {
            return;
        };

        if session.remove(peer_id) {
            info!(session = %session_id, peer = %peer_id, "Peer removed");
        }

        if session.peers.is_empty() {
            sessions.remove(session_id);
            info!(session = %session_id, "Session removed (empty)");
        }
    }

    pub async fn get_session(&self, session_id: &SessionId) -> Result<Session, RegistryError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.clone()))
    }

    pub async fn get_peers(&self, session_id: &SessionId) -> Result<Vec<Peer>, RegistryError> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.clone()))?;
        Ok(session.peers.values().cloned().collect())
    }

    pub async fn update_peer_connection(
        &self,
        session_id: &SessionId,
        peer_id: &PeerId,
        connected: bool,
    ) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.clone()))?;
        let peer = session
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| RegistryError::PeerNotFound {
                session: session_id.clone(),
                peer: peer_id.clone(),
            })?;
        peer.connected = connected;
        Ok(())
    }

    pub async fn contains(&self, session_id: &SessionId) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    /// Drop a session and everyone in it. Returns false if it did not exist.
    pub async fn delete_session(&self, session_id: &SessionId) -> bool {
        let removed = self.sessions.write().await.remove(session_id).is_some();
        if removed {
            info!(session = %session_id, "Session deleted");
        }
        removed
    }

    pub async fn sessions(&self) -> Vec<Session> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
