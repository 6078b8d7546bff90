use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use webrtc::api::{API, APIBuilder};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;

use super::engine::{
    Engine, EngineConnection, EngineEvent, EngineState, EventSender, FeedbackSource, RtcError,
};
use super::track::{LocalTrack, RemoteTrack};
use crate::signaling::{IceCandidateInit, SdpType, SessionDescription};

pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

impl From<webrtc::Error> for RtcError {
    fn from(e: webrtc::Error) -> Self {
        RtcError::Engine(e.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcConfig {
    pub ice_servers: Vec<IceServer>,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_STUN_SERVERS.iter().map(|url| IceServer::stun(*url)).collect(),
        }
    }
}

impl RtcConfig {
    fn to_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone(),
                    credential: server.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }
}

/// [`Engine`] backed by webrtc-rs with the default codecs and interceptors.
pub struct WebRtcEngine {
    api: API,
    configuration: RTCConfiguration,
}

impl WebRtcEngine {
    pub fn new(config: &RtcConfig) -> Result<Self, RtcError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            configuration: config.to_configuration(),
        })
    }
}

#[async_trait]
impl Engine for WebRtcEngine {
    async fn connect(&self, events: EventSender) -> Result<Arc<dyn EngineConnection>, RtcError> {
        let pc = Arc::new(self.api.new_peer_connection(self.configuration.clone()).await?);

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(EngineEvent::IceCandidate(candidate_from_webrtc(init)));
                    }
                    Err(e) => debug!("Failed to serialize local candidate: {}", e),
                }
            })
        }));

        let tx = events.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let _ = tx.send(EngineEvent::Track(RemoteTrack::from_webrtc(track)));
            Box::pin(async {})
        }));

        pc.on_peer_connection_state_change(Box::new(move |state| {
            let _ = events.send(EngineEvent::StateChanged(engine_state(state)));
            Box::pin(async {})
        }));

        Ok(Arc::new(WebRtcConnection { pc }))
    }
}

struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl EngineConnection for WebRtcConnection {
    async fn create_offer(&self) -> Result<SessionDescription, RtcError> {
        let offer = self.pc.create_offer(None).await?;
        description_from_webrtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, RtcError> {
        let answer = self.pc.create_answer(None).await?;
        description_from_webrtc(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), RtcError> {
        self.pc.set_local_description(description_to_webrtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), RtcError> {
        self.pc.set_remote_description(description_to_webrtc(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), RtcError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<Arc<dyn FeedbackSource>, RtcError> {
        let sender = self.pc.add_track(track.as_track_local()).await?;
        Ok(Arc::new(RtcpFeedback(sender)))
    }

    async fn close(&self) -> Result<(), RtcError> {
        self.pc.close().await?;
        Ok(())
    }
}

struct RtcpFeedback(Arc<RTCRtpSender>);

#[async_trait]
impl FeedbackSource for RtcpFeedback {
    async fn read_feedback(&self, buf: &mut [u8]) -> Result<usize, RtcError> {
        let (packets, _) = self.0.read(buf).await?;
        Ok(packets.len())
    }
}

fn engine_state(state: RTCPeerConnectionState) -> EngineState {
    match state {
        RTCPeerConnectionState::Connecting => EngineState::Connecting,
        RTCPeerConnectionState::Connected => EngineState::Connected,
        RTCPeerConnectionState::Disconnected => EngineState::Disconnected,
        RTCPeerConnectionState::Failed => EngineState::Failed,
        RTCPeerConnectionState::Closed => EngineState::Closed,
        _ => EngineState::New,
    }
}

fn candidate_from_webrtc(init: RTCIceCandidateInit) -> IceCandidateInit {
    IceCandidateInit {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn description_to_webrtc(desc: SessionDescription) -> Result<RTCSessionDescription, RtcError> {
    let converted = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp)?,
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp)?,
        SdpType::Rollback => {
            return Err(RtcError::Engine("rollback descriptions are not supported".into()));
        }
    };
    Ok(converted)
}

fn description_from_webrtc(desc: RTCSessionDescription) -> Result<SessionDescription, RtcError> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        other => return Err(RtcError::Engine(format!("unexpected sdp type {}", other))),
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: desc.sdp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtc::track::TrackKind;
    use tokio::sync::mpsc;

    #[test]
    fn default_config_lists_public_stun() {
        let config = RtcConfig::default();
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[0].urls, vec!["stun:stun.l.google.com:19302"]);

        let rtc = config.to_configuration();
        assert_eq!(rtc.ice_servers[1].urls, vec!["stun:stun1.l.google.com:19302"]);
    }

    #[test]
    fn rollback_is_rejected() {
        let desc = SessionDescription {
            sdp_type: SdpType::Rollback,
            sdp: String::new(),
        };
        assert!(matches!(description_to_webrtc(desc), Err(RtcError::Engine(_))));
    }

    #[test]
    fn state_mapping_keeps_terminal_states() {
        assert_eq!(engine_state(RTCPeerConnectionState::Connected), EngineState::Connected);
        assert!(engine_state(RTCPeerConnectionState::Failed).is_terminal());
        assert!(engine_state(RTCPeerConnectionState::Disconnected).is_terminal());
        assert_eq!(engine_state(RTCPeerConnectionState::New), EngineState::New);
    }

    #[tokio::test]
    async fn offer_from_local_engine_describes_tracks() {
        let engine = WebRtcEngine::new(&RtcConfig { ice_servers: Vec::new() }).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = engine.connect(tx).await.unwrap();

        let track = LocalTrack::new(TrackKind::Video, "video", "zero");
        conn.add_track(&track).await.unwrap();

        let offer = conn.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("m=video"));
        conn.set_local_description(offer).await.unwrap();
        conn.close().await.unwrap();
    }
}
