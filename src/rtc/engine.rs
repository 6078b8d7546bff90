use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use super::track::{LocalTrack, RemoteTrack};
use crate::signaling::{IceCandidateInit, PeerId, SessionDescription, SignalingError};

#[derive(Debug, Error)]
pub enum RtcError {
    #[error("engine error: {0}")]
    Engine(String),

    #[error("no peer connection for {0}")]
    UnknownPeer(PeerId),

    #[error("peer connection closed")]
    Closed,

    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

/// Connection state as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl EngineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

/// Everything an engine connection reports asynchronously, in one stream.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    IceCandidate(IceCandidateInit),
    Track(RemoteTrack),
    StateChanged(EngineState),
}

pub type EventSender = mpsc::UnboundedSender<EngineEvent>;

/// Factory for engine connections
#[async_trait]
pub trait Engine: Send + Sync {
    /// Open a connection whose events are pushed into `events`.
    async fn connect(&self, events: EventSender) -> Result<Arc<dyn EngineConnection>, RtcError>;
}

/// One underlying RTC connection to a single remote peer
#[async_trait]
pub trait EngineConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, RtcError>;
    async fn create_answer(&self) -> Result<SessionDescription, RtcError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), RtcError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), RtcError>;
    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), RtcError>;
    /// Attach a local track; returns its RTCP feedback channel.
    async fn add_track(&self, track: &LocalTrack) -> Result<Arc<dyn FeedbackSource>, RtcError>;
    async fn close(&self) -> Result<(), RtcError>;
}

/// Receiver-report channel of a sent track. It must be read continuously or
/// the engine stalls.
#[async_trait]
pub trait FeedbackSource: Send + Sync {
    async fn read_feedback(&self, buf: &mut [u8]) -> Result<usize, RtcError>;
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scriptable in-memory engine

    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    pub struct MockEngine {
        connections: Mutex<Vec<Arc<MockConnection>>>,
    }

    impl MockEngine {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn connections(&self) -> Vec<Arc<MockConnection>> {
            self.connections.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Engine for MockEngine {
        async fn connect(&self, events: EventSender) -> Result<Arc<dyn EngineConnection>, RtcError> {
            let conn = Arc::new(MockConnection {
                events,
                version: AtomicU64::new(0),
                local: Mutex::new(None),
                remote: Mutex::new(None),
                candidates: Mutex::new(Vec::new()),
                tracks: Mutex::new(Vec::new()),
                feedback_reads: Arc::new(AtomicUsize::new(0)),
                close_calls: AtomicUsize::new(0),
            });
            self.connections.lock().unwrap().push(conn.clone());
            Ok(conn)
        }
    }

    pub struct MockConnection {
        events: EventSender,
        version: AtomicU64,
        pub local: Mutex<Option<SessionDescription>>,
        pub remote: Mutex<Option<SessionDescription>>,
        pub candidates: Mutex<Vec<IceCandidateInit>>,
        pub tracks: Mutex<Vec<String>>,
        pub feedback_reads: Arc<AtomicUsize>,
        pub close_calls: AtomicUsize,
    }

    impl MockConnection {
        pub fn emit(&self, event: EngineEvent) {
            let _ = self.events.send(event);
        }

        pub fn close_calls(&self) -> usize {
            self.close_calls.load(Ordering::SeqCst)
        }

        pub fn track_ids(&self) -> Vec<String> {
            self.tracks.lock().unwrap().clone()
        }

        fn describe(&self, kind: &str) -> String {
            let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
            format!("v=0\r\no=- 4242 {} IN IP4 127.0.0.1\r\ns={}\r\n", version, kind)
        }
    }

    struct MockFeedback {
        reads: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl FeedbackSource for MockFeedback {
        async fn read_feedback(&self, _buf: &mut [u8]) -> Result<usize, RtcError> {
            // One report, then the sender goes away.
            if self.reads.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(1)
            } else {
                Err(RtcError::Closed)
            }
        }
    }

    #[async_trait]
    impl EngineConnection for MockConnection {
        async fn create_offer(&self) -> Result<SessionDescription, RtcError> {
            Ok(SessionDescription::offer(self.describe("offer")))
        }

        async fn create_answer(&self) -> Result<SessionDescription, RtcError> {
            if self.remote.lock().unwrap().is_none() {
                return Err(RtcError::Engine("no remote description".into()));
            }
            Ok(SessionDescription::answer(self.describe("answer")))
        }

        async fn set_local_description(&self, desc: SessionDescription) -> Result<(), RtcError> {
            *self.local.lock().unwrap() = Some(desc);
            Ok(())
        }

        async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), RtcError> {
            if desc.sdp.is_empty() {
                return Err(RtcError::Engine("empty sdp".into()));
            }
            *self.remote.lock().unwrap() = Some(desc);
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), RtcError> {
            if self.remote.lock().unwrap().is_none() {
                return Err(RtcError::Engine("remote description not set".into()));
            }
            self.candidates.lock().unwrap().push(candidate);
            Ok(())
        }

        async fn add_track(&self, track: &LocalTrack) -> Result<Arc<dyn FeedbackSource>, RtcError> {
            self.tracks.lock().unwrap().push(track.id().to_owned());
            Ok(Arc::new(MockFeedback {
                reads: self.feedback_reads.clone(),
            }))
        }

        async fn close(&self) -> Result<(), RtcError> {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
