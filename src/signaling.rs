//! WebSocket signaling relay: server, client and the wire format they share

mod client;
mod hub;
mod messages;
mod server;
mod types;

pub use client::{
    ClientConfig, DEFAULT_CONNECT_TIMEOUT, MessageHandler, Signaler, SignalingClient,
};
pub use hub::{BroadcastReport, SessionHub};
pub use messages::{
    AnswerPayload, CandidatePayload, ErrorPayload, IceCandidateInit, JoinPayload, MessageType,
    OfferPayload, Payload, PeerJoinedPayload, PeerLeftPayload, SdpType, SessionDescription,
    SignalingMessage,
};
pub use server::{DEFAULT_SIGNALING_PORT, SIGNALING_PATH, ServerConfig, SignalingServer};
pub use types::{OutboundMessage, PeerId, SessionId, SignalingError};
