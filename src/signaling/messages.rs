use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{PeerId, SessionId, SignalingError};

/// Frame type carried in the `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Join,
    Leave,
    Offer,
    Answer,
    Candidate,
    PeerJoined,
    PeerLeft,
    Error,
    /// Any type string this build does not know about
    #[serde(other)]
    Unknown,
}

impl MessageType {
    /// Types the server relays verbatim to the rest of the session.
    pub fn is_negotiation(self) -> bool {
        matches!(self, Self::Offer | Self::Answer | Self::Candidate)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Leave => "leave",
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Candidate => "candidate",
            Self::PeerJoined => "peer_joined",
            Self::PeerLeft => "peer_left",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SDP kind, serialized the way browsers and pion do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// `{"type": "offer", "sdp": "v=0..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Trickled ICE candidate in its JSON init form
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinPayload {
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerJoinedPayload {
    pub peer_id: PeerId,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerLeftPayload {
    pub peer_id: PeerId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferPayload {
    pub sdp: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerPayload {
    pub sdp: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: IceCandidateInit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Decoded payload, selected by the frame's `type`
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Join(JoinPayload),
    Leave,
    Offer(OfferPayload),
    Answer(AnswerPayload),
    Candidate(CandidatePayload),
    PeerJoined(PeerJoinedPayload),
    PeerLeft(PeerLeftPayload),
    Error(ErrorPayload),
    Unknown,
}

/// One JSON frame on the `/ws` endpoint.
///
/// The payload stays as raw JSON until a consumer asks for it, so the server
/// can route frames without understanding negotiation bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub session_id: SessionId,
    pub peer_id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl SignalingMessage {
    fn with_payload<T: Serialize>(
        kind: MessageType,
        session_id: &SessionId,
        peer_id: &PeerId,
        payload: &T,
    ) -> Self {
        Self {
            kind,
            session_id: session_id.clone(),
            peer_id: peer_id.clone(),
            username: None,
            // Payload structs only hold strings, ids and small integers.
            payload: serde_json::to_value(payload).ok(),
        }
    }

    pub fn join(session_id: &SessionId, peer_id: &PeerId, username: &str) -> Self {
        let mut msg = Self::with_payload(
            MessageType::Join,
            session_id,
            peer_id,
            &JoinPayload {
                username: username.to_owned(),
            },
        );
        msg.username = Some(username.to_owned());
        msg
    }

    pub fn leave(session_id: &SessionId, peer_id: &PeerId) -> Self {
        Self {
            kind: MessageType::Leave,
            session_id: session_id.clone(),
            peer_id: peer_id.clone(),
            username: None,
            payload: None,
        }
    }

    pub fn offer(session_id: &SessionId, peer_id: &PeerId, sdp: SessionDescription) -> Self {
        Self::with_payload(MessageType::Offer, session_id, peer_id, &OfferPayload { sdp })
    }

    pub fn answer(session_id: &SessionId, peer_id: &PeerId, sdp: SessionDescription) -> Self {
        Self::with_payload(MessageType::Answer, session_id, peer_id, &AnswerPayload { sdp })
    }

    pub fn candidate(session_id: &SessionId, peer_id: &PeerId, candidate: IceCandidateInit) -> Self {
        Self::with_payload(
            MessageType::Candidate,
            session_id,
            peer_id,
            &CandidatePayload { candidate },
        )
    }

    pub fn peer_joined(session_id: &SessionId, peer_id: &PeerId, username: &str) -> Self {
        let mut msg = Self::with_payload(
            MessageType::PeerJoined,
            session_id,
            peer_id,
            &PeerJoinedPayload {
                peer_id: peer_id.clone(),
                username: username.to_owned(),
            },
        );
        msg.username = Some(username.to_owned());
        msg
    }

    pub fn peer_left(session_id: &SessionId, peer_id: &PeerId) -> Self {
        Self::with_payload(
            MessageType::PeerLeft,
            session_id,
            peer_id,
            &PeerLeftPayload {
                peer_id: peer_id.clone(),
            },
        )
    }

    pub fn error(session_id: &SessionId, peer_id: &PeerId, message: impl Into<String>) -> Self {
        Self::with_payload(
            MessageType::Error,
            session_id,
            peer_id,
            &ErrorPayload {
                message: message.into(),
            },
        )
    }

    pub fn parse(text: &str) -> Result<Self, SignalingError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String, SignalingError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize the payload into a concrete shape.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, SignalingError> {
        let value = self.payload.clone().unwrap_or(Value::Null);
        Ok(serde_json::from_value(value)?)
    }

    /// Decode the payload according to the frame type.
    pub fn decode_payload(&self) -> Result<Payload, SignalingError> {
        let payload = match self.kind {
            MessageType::Join => Payload::Join(self.payload_as()?),
            MessageType::Leave => Payload::Leave,
            MessageType::Offer => Payload::Offer(self.payload_as()?),
            MessageType::Answer => Payload::Answer(self.payload_as()?),
            MessageType::Candidate => Payload::Candidate(self.payload_as()?),
            MessageType::PeerJoined => Payload::PeerJoined(self.payload_as()?),
            MessageType::PeerLeft => Payload::PeerLeft(self.payload_as()?),
            MessageType::Error => Payload::Error(self.payload_as()?),
            MessageType::Unknown => Payload::Unknown,
        };
        Ok(payload)
    }
}
