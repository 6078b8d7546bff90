use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_channel::TrySendError;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::types::{OutboundMessage, PeerId, SessionId};

/// Sending half of one connection's outbound queue
#[derive(Debug, Clone)]
pub(crate) struct ClientHandle {
    pub username: String,
    pub tx: async_channel::Sender<OutboundMessage>,
}

#[derive(Debug, Default)]
struct SessionClients {
    clients: RwLock<HashMap<PeerId, ClientHandle>>,
}

/// Outcome of one broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Recipients whose queue was full
    pub dropped: usize,
}

/// Live connections per session.
///
/// Lock order is always the sessions map first, then a session's client map.
#[derive(Debug, Default)]
pub struct SessionHub {
    sessions: RwLock<HashMap<SessionId, Arc<SessionClients>>>,
    dropped: AtomicU64,
}

impl SessionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection; opens the session if needed. An existing entry
    /// for the same peer id is replaced.
    pub(crate) async fn register(&self, session_id: &SessionId, peer_id: &PeerId, handle: ClientHandle) {
        let mut sessions = self.sessions.write().await;
        let session = sessions.entry(session_id.clone()).or_insert_with(|| {
            info!(session = %session_id, "Created new session");
            Arc::new(SessionClients::default())
        });
        session.clients.write().await.insert(peer_id.clone(), handle);
        debug!(session = %session_id, peer = %peer_id, "Added client to session");
    }

    /// Deregister a connection. Returns true if the peer was present; the
    /// session is dropped once its last client is gone.
    pub(crate) async fn unregister(&self, session_id: &SessionId, peer_id: &PeerId) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get(session_id) else {
            return false;
        };

        let (removed, remaining) = {
            let mut clients = session.clients.write().await;
            let removed = clients.remove(peer_id).is_some();
            (removed, clients.len())
        };

        if remaining == 0 {
            sessions.remove(session_id);
            info!(session = %session_id, "Deleted empty session");
        }
        removed
    }

    /// Queue `message` for every member of `session_id` except `sender`.
    ///
    /// Never waits: a recipient with a full queue loses this message.
    pub async fn broadcast(
        &self,
        session_id: &SessionId,
        sender: Option<&PeerId>,
        message: &OutboundMessage,
    ) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        let sessions = self.sessions.read().await;
        let Some(session) = sessions.get(session_id) else {
            return report;
        };
        let clients = session.clients.read().await;

        for (peer_id, client) in clients.iter() {
            if Some(peer_id) == sender {
                continue;
            }
            match client.tx.try_send(message.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    report.dropped += 1;
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        session = %session_id,
                        peer = %peer_id,
                        username = %client.username,
                        "Outbound queue full, dropping message"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(session = %session_id, peer = %peer_id, "Outbound queue closed");
                }
            }
        }
        report
    }

    /// Peer ids currently connected to `session_id`
    pub async fn members(&self, session_id: &SessionId) -> Vec<PeerId> {
        let sessions = self.sessions.read().await;
        match sessions.get(session_id) {
            Some(session) => session.clients.read().await.keys().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Total messages dropped on full queues since startup
    pub fn dropped_messages(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(depth: usize) -> (ClientHandle, async_channel::Receiver<OutboundMessage>) {
        let (tx, rx) = async_channel::bounded(depth);
        (
            ClientHandle {
                username: "user".into(),
                tx,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn broadcast_skips_sender() {
        let hub = SessionHub::new();
        let sid = SessionId::from("abc123");
        let (h1, rx1) = client(8);
        let (h2, rx2) = client(8);
        let (h3, rx3) = client(8);
        hub.register(&sid, &PeerId::from("P1"), h1).await;
        hub.register(&sid, &PeerId::from("P2"), h2).await;
        hub.register(&sid, &PeerId::from("P3"), h3).await;

        let msg = OutboundMessage::from(String::from("hello"));
        let report = hub.broadcast(&sid, Some(&PeerId::from("P1")), &msg).await;

        assert_eq!(report, BroadcastReport { delivered: 2, dropped: 0 });
        assert!(rx1.is_empty());
        assert_eq!(rx2.try_recv().unwrap().as_str(), "hello");
        assert_eq!(rx3.try_recv().unwrap().as_str(), "hello");
    }

    #[tokio::test]
    async fn broadcast_drops_on_full_queue() {
        let hub = SessionHub::new();
        let sid = SessionId::from("abc123");
        let (slow, slow_rx) = client(1);
        let (fast, fast_rx) = client(8);
        hub.register(&sid, &PeerId::from("slow"), slow).await;
        hub.register(&sid, &PeerId::from("fast"), fast).await;

        for i in 0..3 {
            let msg = OutboundMessage::from(format!("m{}", i));
            hub.broadcast(&sid, None, &msg).await;
        }

        assert_eq!(hub.dropped_messages(), 2);
        assert_eq!(slow_rx.len(), 1);
        assert_eq!(slow_rx.try_recv().unwrap().as_str(), "m0");
        let order: Vec<String> = std::iter::from_fn(|| fast_rx.try_recv().ok())
            .map(|m| m.as_str().to_owned())
            .collect();
        assert_eq!(order, vec!["m0", "m1", "m2"]);
    }

    #[tokio::test]
    async fn unregister_last_client_removes_session() {
        let hub = SessionHub::new();
        let sid = SessionId::from("abc123");
        let (h1, _rx1) = client(1);
        let (h2, _rx2) = client(1);
        hub.register(&sid, &PeerId::from("P1"), h1).await;
        hub.register(&sid, &PeerId::from("P2"), h2).await;

        assert!(hub.unregister(&sid, &PeerId::from("P1")).await);
        assert_eq!(hub.members(&sid).await, vec![PeerId::from("P2")]);
        assert!(!hub.unregister(&sid, &PeerId::from("P1")).await);

        assert!(hub.unregister(&sid, &PeerId::from("P2")).await);
        assert_eq!(hub.session_count().await, 0);
        assert!(hub.members(&sid).await.is_empty());
    }

    #[tokio::test]
    async fn broadcast_to_unknown_session_is_noop() {
        let hub = SessionHub::new();
        let msg = OutboundMessage::from(String::from("x"));
        let report = hub.broadcast(&SessionId::from("none"), None, &msg).await;
        assert_eq!(report, BroadcastReport::default());
    }
}
