//! Full-mesh peer connections driven by signaling messages

mod engine;
mod manager;
mod peer;
mod track;
mod webrtc_engine;

pub use engine::{
    Engine, EngineConnection, EngineEvent, EngineState, EventSender, FeedbackSource, RtcError,
};
pub use manager::{
    DEFAULT_NEGOTIATION_TIMEOUT, ManagerConfig, ManagerHandlers, PeerConnectionManager,
    PeerDisconnectHandler, PeerState, RemoteTrackHandler,
};
pub use peer::{
    ConnectionState, DisconnectHandler, IceCandidateHandler, PeerCallbacks, PeerConnection,
    TrackHandler,
};
pub use track::{LocalTrack, RemoteTrack, TrackKind};
pub use webrtc_engine::{DEFAULT_STUN_SERVERS, IceServer, RtcConfig, WebRtcEngine};
