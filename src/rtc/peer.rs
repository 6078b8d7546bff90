use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::engine::{Engine, EngineConnection, EngineEvent, EngineState, FeedbackSource, RtcError};
use super::track::{LocalTrack, RemoteTrack};
use crate::signaling::{IceCandidateInit, PeerId, SessionDescription, SessionId};

const FEEDBACK_BUFFER_SIZE: usize = 1500;

/// Lifecycle of one peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Closed,
}

pub type IceCandidateHandler = Arc<dyn Fn(IceCandidateInit) + Send + Sync>;
pub type TrackHandler = Arc<dyn Fn(RemoteTrack) + Send + Sync>;
pub type DisconnectHandler = Arc<dyn Fn(PeerId) + Send + Sync>;

/// Callbacks run from the connection's event task, in engine order
#[derive(Clone, Default)]
pub struct PeerCallbacks {
    pub on_ice_candidate: Option<IceCandidateHandler>,
    pub on_track: Option<TrackHandler>,
    pub on_disconnect: Option<DisconnectHandler>,
    /// Runs when the engine gives up before the connection was ever up.
    pub on_failure: Option<DisconnectHandler>,
}

/// How an engine state change ended a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    /// An established connection dropped.
    Lost,
    /// The engine reached a terminal state before Connected.
    Failed,
}

#[derive(Debug)]
struct Status {
    state: ConnectionState,
    was_connected: bool,
    disconnect_reported: bool,
    remote_described: bool,
    pending_candidates: Vec<IceCandidateInit>,
    closed: bool,
}

impl Status {
    /// Apply an engine state. Any terminal state closes the connection; the
    /// returned ending is reported once.
    fn apply(&mut self, state: EngineState) -> Option<Ending> {
        if self.state == ConnectionState::Closed {
            return None;
        }
        match state {
            EngineState::Connected => {
                self.state = ConnectionState::Connected;
                self.was_connected = true;
                None
            }
            s if s.is_terminal() => {
                let ending = if self.state == ConnectionState::Connected {
                    Ending::Lost
                } else {
                    Ending::Failed
                };
                self.state = ConnectionState::Closed;
                Some(ending)
            }
            _ => None,
        }
    }
}

/// One connection of the mesh, wrapping an engine connection.
///
/// Remote candidates that arrive before the remote description are held back
/// and applied as soon as it is set.
pub struct PeerConnection {
    peer_id: PeerId,
    session_id: SessionId,
    conn: Arc<dyn EngineConnection>,
    status: Arc<Mutex<Status>>,
    local_tracks: Mutex<Vec<LocalTrack>>,
    remote_tracks: Arc<Mutex<Vec<RemoteTrack>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerConnection {
    pub async fn open(
        peer_id: PeerId,
        session_id: SessionId,
        engine: &dyn Engine,
        callbacks: PeerCallbacks,
    ) -> Result<Arc<Self>, RtcError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let conn = engine.connect(events_tx).await?;

        let status = Arc::new(Mutex::new(Status {
            state: ConnectionState::Connecting,
            was_connected: false,
            disconnect_reported: false,
            remote_described: false,
            pending_candidates: Vec::new(),
            closed: false,
        }));
        let remote_tracks = Arc::new(Mutex::new(Vec::new()));

        let events = tokio::spawn(run_events(
            peer_id.clone(),
            events_rx,
            status.clone(),
            remote_tracks.clone(),
            callbacks,
        ));

        debug!("Opened peer connection to {}", peer_id);

        Ok(Arc::new(Self {
            peer_id,
            session_id,
            conn,
            status,
            local_tracks: Mutex::new(Vec::new()),
            remote_tracks,
            tasks: Mutex::new(vec![events]),
        }))
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub async fn state(&self) -> ConnectionState {
        self.status.lock().await.state
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    pub async fn has_remote_description(&self) -> bool {
        self.status.lock().await.remote_described
    }

    pub async fn local_tracks(&self) -> Vec<LocalTrack> {
        self.local_tracks.lock().await.clone()
    }

    pub async fn remote_tracks(&self) -> Vec<RemoteTrack> {
        self.remote_tracks.lock().await.clone()
    }

    /// Create an offer and commit it as the local description.
    pub async fn create_offer(&self) -> Result<SessionDescription, RtcError> {
        self.ensure_open().await?;
        let offer = self.conn.create_offer().await?;
        self.conn.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    /// Create an answer to the current remote offer and commit it.
    pub async fn create_answer(&self) -> Result<SessionDescription, RtcError> {
        self.ensure_open().await?;
        let answer = self.conn.create_answer().await?;
        self.conn.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    pub async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), RtcError> {
        self.ensure_open().await?;
        self.conn.set_remote_description(desc).await?;

        let pending = {
            let mut status = self.status.lock().await;
            status.remote_described = true;
            std::mem::take(&mut status.pending_candidates)
        };

        if !pending.is_empty() {
            debug!("Applying {} buffered candidates from {}", pending.len(), self.peer_id);
        }
        for candidate in pending {
            if let Err(e) = self.conn.add_ice_candidate(candidate).await {
                warn!("Failed to add buffered candidate from {}: {}", self.peer_id, e);
            }
        }
        Ok(())
    }

    pub async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), RtcError> {
        {
            let mut status = self.status.lock().await;
            if status.state == ConnectionState::Closed {
                return Err(RtcError::Closed);
            }
            if !status.remote_described {
                status.pending_candidates.push(candidate);
                return Ok(());
            }
        }
        self.conn.add_ice_candidate(candidate).await
    }

    /// Attach a local track and keep its feedback channel drained.
    pub async fn add_track(&self, track: LocalTrack) -> Result<(), RtcError> {
        self.ensure_open().await?;
        let feedback = self.conn.add_track(&track).await?;
        let drain = tokio::spawn(drain_feedback(feedback));

        debug!("Added {} track {} for {}", track.kind(), track.id(), self.peer_id);
        self.local_tracks.lock().await.push(track);
        self.tasks.lock().await.push(drain);
        Ok(())
    }

    /// Close the connection. Safe to call more than once.
    pub async fn close(&self) -> Result<(), RtcError> {
        {
            let mut status = self.status.lock().await;
            if status.closed {
                return Ok(());
            }
            status.closed = true;
            status.state = ConnectionState::Closed;
        }

        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }

        info!("Closing peer connection to {}", self.peer_id);
        self.conn.close().await
    }

    /// True exactly once for a connection that reached Connected and has
    /// since closed or been lost.
    pub async fn take_disconnect(&self) -> bool {
        let mut status = self.status.lock().await;
        if status.was_connected
            && status.state == ConnectionState::Closed
            && !status.disconnect_reported
        {
            status.disconnect_reported = true;
            return true;
        }
        false
    }

    async fn ensure_open(&self) -> Result<(), RtcError> {
        if self.state().await == ConnectionState::Closed {
            return Err(RtcError::Closed);
        }
        Ok(())
    }
}

async fn run_events(
    peer_id: PeerId,
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
    status: Arc<Mutex<Status>>,
    remote_tracks: Arc<Mutex<Vec<RemoteTrack>>>,
    callbacks: PeerCallbacks,
) {
    while let Some(event) = events.recv().await {
        match event {
            EngineEvent::IceCandidate(candidate) => {
                if let Some(handler) = &callbacks.on_ice_candidate {
                    handler(candidate);
                }
            }
            EngineEvent::Track(track) => {
                info!("Received remote track {} from {}", track.id, peer_id);
                remote_tracks.lock().await.push(track.clone());
                if let Some(handler) = &callbacks.on_track {
                    handler(track);
                }
            }
            EngineEvent::StateChanged(state) => {
                debug!("Peer {} connection state: {:?}", peer_id, state);
                let ending = status.lock().await.apply(state);
                if state == EngineState::Connected {
                    info!("Connected to peer {}", peer_id);
                }
                match ending {
                    Some(Ending::Lost) => {
                        warn!("Connection to peer {} lost ({:?})", peer_id, state);
                        if let Some(handler) = &callbacks.on_disconnect {
                            handler(peer_id.clone());
                        }
                    }
                    Some(Ending::Failed) => {
                        warn!("Connection to peer {} failed before connecting ({:?})", peer_id, state);
                        if let Some(handler) = &callbacks.on_failure {
                            handler(peer_id.clone());
                        }
                    }
                    None => {}
                }
            }
        }
    }
}

async fn drain_feedback(source: Arc<dyn FeedbackSource>) {
    let mut buf = vec![0u8; FEEDBACK_BUFFER_SIZE];
    while source.read_feedback(&mut buf).await.is_ok() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtc::engine::mock::MockEngine;
    use crate::rtc::track::TrackKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn candidate(n: u32) -> IceCandidateInit {
        IceCandidateInit {
            candidate: format!("candidate:{} 1 udp 2122260223 10.0.0.{} 5000 typ host", n, n),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    async fn open(engine: &MockEngine, callbacks: PeerCallbacks) -> Arc<PeerConnection> {
        PeerConnection::open(PeerId::from("P2"), SessionId::from("abc123"), engine, callbacks)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn offers_are_committed_as_local_description() {
        let engine = MockEngine::new();
        let pc = open(&engine, PeerCallbacks::default()).await;

        let first = pc.create_offer().await.unwrap();
        let second = pc.create_offer().await.unwrap();
        assert_ne!(first.sdp, second.sdp);

        let conn = &engine.connections()[0];
        assert_eq!(conn.local.lock().unwrap().as_ref(), Some(&second));
        assert_eq!(pc.state().await, ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn candidates_wait_for_remote_description() {
        let engine = MockEngine::new();
        let pc = open(&engine, PeerCallbacks::default()).await;
        let conn = engine.connections()[0].clone();

        pc.add_ice_candidate(candidate(1)).await.unwrap();
        pc.add_ice_candidate(candidate(2)).await.unwrap();
        assert!(conn.candidates.lock().unwrap().is_empty());

        pc.set_remote_description(SessionDescription::offer("v=0 remote"))
            .await
            .unwrap();
        assert_eq!(*conn.candidates.lock().unwrap(), vec![candidate(1), candidate(2)]);

        pc.add_ice_candidate(candidate(3)).await.unwrap();
        assert_eq!(conn.candidates.lock().unwrap().len(), 3);

        let answer = pc.create_answer().await.unwrap();
        assert_eq!(answer.sdp_type, crate::signaling::SdpType::Answer);
    }

    #[tokio::test]
    async fn rejected_remote_description_keeps_candidates_pending() {
        let engine = MockEngine::new();
        let pc = open(&engine, PeerCallbacks::default()).await;

        pc.add_ice_candidate(candidate(1)).await.unwrap();
        assert!(pc.set_remote_description(SessionDescription::offer("")).await.is_err());
        assert!(!pc.has_remote_description().await);

        pc.set_remote_description(SessionDescription::offer("v=0")).await.unwrap();
        assert_eq!(engine.connections()[0].candidates.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn disconnect_fires_once_after_connected() {
        let engine = MockEngine::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let pc = open(
            &engine,
            PeerCallbacks {
                on_disconnect: Some(Arc::new(move |_: PeerId| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
                ..Default::default()
            },
        )
        .await;
        let conn = engine.connections()[0].clone();

        conn.emit(EngineEvent::StateChanged(EngineState::Connecting));
        conn.emit(EngineEvent::StateChanged(EngineState::Connected));
        eventually(|| pc.is_connected()).await;

        conn.emit(EngineEvent::StateChanged(EngineState::Disconnected));
        conn.emit(EngineEvent::StateChanged(EngineState::Failed));
        conn.emit(EngineEvent::StateChanged(EngineState::Closed));
        eventually(|| async { pc.state().await == ConnectionState::Closed }).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(pc.take_disconnect().await);
        assert!(!pc.take_disconnect().await);
    }

    #[tokio::test]
    async fn failure_before_connected_closes_without_disconnect() {
        let engine = MockEngine::new();
        let lost = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let lost_counter = lost.clone();
        let failed_counter = failed.clone();
        let pc = open(
            &engine,
            PeerCallbacks {
                on_disconnect: Some(Arc::new(move |_: PeerId| {
                    lost_counter.fetch_add(1, Ordering::SeqCst);
                })),
                on_failure: Some(Arc::new(move |_: PeerId| {
                    failed_counter.fetch_add(1, Ordering::SeqCst);
                })),
                ..Default::default()
            },
        )
        .await;

        let conn = engine.connections()[0].clone();
        conn.emit(EngineEvent::StateChanged(EngineState::Failed));
        conn.emit(EngineEvent::StateChanged(EngineState::Closed));
        eventually(|| async { pc.state().await == ConnectionState::Closed }).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(lost.load(Ordering::SeqCst), 0);
        assert_eq!(failed.load(Ordering::SeqCst), 1);
        assert!(!pc.take_disconnect().await);
        assert!(matches!(pc.create_offer().await, Err(RtcError::Closed)));

        pc.close().await.unwrap();
        assert_eq!(conn.close_calls(), 1);
        assert!(!pc.take_disconnect().await);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let engine = MockEngine::new();
        let pc = open(&engine, PeerCallbacks::default()).await;

        pc.close().await.unwrap();
        pc.close().await.unwrap();

        assert_eq!(engine.connections()[0].close_calls(), 1);
        assert!(!pc.is_connected().await);
        assert!(matches!(pc.create_offer().await, Err(RtcError::Closed)));
        assert!(matches!(pc.add_ice_candidate(candidate(1)).await, Err(RtcError::Closed)));
    }

    #[tokio::test]
    async fn events_reach_callbacks() {
        let engine = MockEngine::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let ice_tx = tx.clone();
        let track_tx = tx.clone();
        let pc = open(
            &engine,
            PeerCallbacks {
                on_ice_candidate: Some(Arc::new(move |c: IceCandidateInit| {
                    let _ = ice_tx.send(c.candidate);
                })),
                on_track: Some(Arc::new(move |t: RemoteTrack| {
                    let _ = track_tx.send(t.id);
                })),
                on_disconnect: None,
                on_failure: None,
            },
        )
        .await;
        let conn = engine.connections()[0].clone();

        conn.emit(EngineEvent::IceCandidate(candidate(7)));
        conn.emit(EngineEvent::Track(RemoteTrack::new("cam", "s", Some(TrackKind::Video))));

        assert_eq!(rx.recv().await.unwrap(), candidate(7).candidate);
        assert_eq!(rx.recv().await.unwrap(), "cam");
        assert_eq!(pc.remote_tracks().await.len(), 1);
    }

    #[tokio::test]
    async fn added_track_feedback_is_drained() {
        let engine = MockEngine::new();
        let pc = open(&engine, PeerCallbacks::default()).await;

        pc.add_track(LocalTrack::new(TrackKind::Audio, "audio", "zero"))
            .await
            .unwrap();

        let conn = engine.connections()[0].clone();
        assert_eq!(conn.track_ids(), vec!["audio".to_owned()]);
        eventually(|| {
            let reads = conn.feedback_reads.load(Ordering::SeqCst);
            async move { reads >= 2 }
        })
        .await;
        assert_eq!(pc.local_tracks().await.len(), 1);
    }
}
