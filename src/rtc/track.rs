use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use super::engine::RtcError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn from_codec_type(kind: RTPCodecType) -> Option<Self> {
        match kind {
            RTPCodecType::Audio => Some(Self::Audio),
            RTPCodecType::Video => Some(Self::Video),
            _ => None,
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

/// Outgoing media track handed over by the capture side.
///
/// The manager never looks at media; capture code pushes encoded samples
/// with [`LocalTrack::write_sample`].
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<TrackLocalStaticSample>,
    kind: TrackKind,
}

impl LocalTrack {
    /// Sample track with the default codec for `kind` (VP8 video, Opus audio).
    pub fn new(kind: TrackKind, id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        let codec = match kind {
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
        };
        Self {
            inner: Arc::new(TrackLocalStaticSample::new(codec, id.into(), stream_id.into())),
            kind,
        }
    }

    /// Wrap a track built elsewhere. Returns None for tracks of unspecified kind.
    pub fn from_sample_track(track: Arc<TrackLocalStaticSample>) -> Option<Self> {
        let kind = TrackKind::from_codec_type(track.kind())?;
        Some(Self { inner: track, kind })
    }

    pub fn id(&self) -> &str {
        self.inner.id()
    }

    pub fn stream_id(&self) -> &str {
        self.inner.stream_id()
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<(), RtcError> {
        self.inner
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    pub(crate) fn as_track_local(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.inner.clone()
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id())
            .field("stream_id", &self.stream_id())
            .field("kind", &self.kind)
            .finish()
    }
}

/// Incoming track announced by the engine
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: Option<TrackKind>,
    handle: Option<Arc<TrackRemote>>,
}

impl RemoteTrack {
    pub fn new(id: impl Into<String>, stream_id: impl Into<String>, kind: Option<TrackKind>) -> Self {
        Self {
            id: id.into(),
            stream_id: stream_id.into(),
            kind,
            handle: None,
        }
    }

    pub(crate) fn from_webrtc(track: Arc<TrackRemote>) -> Self {
        Self {
            id: track.id(),
            stream_id: track.stream_id(),
            kind: TrackKind::from_codec_type(track.kind()),
            handle: Some(track),
        }
    }

    /// Underlying webrtc track, for reading RTP. None for other engines.
    pub fn webrtc_track(&self) -> Option<&Arc<TrackRemote>> {
        self.handle.as_ref()
    }
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_track_uses_codec_for_kind() {
        let video = LocalTrack::new(TrackKind::Video, "video", "zero");
        assert_eq!(video.id(), "video");
        assert_eq!(video.stream_id(), "zero");
        assert_eq!(video.kind(), TrackKind::Video);
        assert_eq!(video.as_track_local().kind(), RTPCodecType::Video);

        let audio = LocalTrack::new(TrackKind::Audio, "audio", "zero");
        assert_eq!(audio.as_track_local().kind(), RTPCodecType::Audio);
    }

    #[test]
    fn from_sample_track_reads_kind() {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "mic".to_owned(),
            "s".to_owned(),
        ));
        let local = LocalTrack::from_sample_track(track).unwrap();
        assert_eq!(local.kind(), TrackKind::Audio);
        assert_eq!(format!("{:?}", local), r#"LocalTrack { id: "mic", stream_id: "s", kind: Audio }"#);
    }

    #[tokio::test]
    async fn write_sample_without_binding_is_ok() {
        let track = LocalTrack::new(TrackKind::Video, "video", "zero");
        track
            .write_sample(Bytes::from_static(&[0u8; 16]), Duration::from_millis(33))
            .await
            .unwrap();
    }
}
