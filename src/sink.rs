use async_trait::async_trait;
use webrtc::{
    api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS},
    track::track_local::{
        track_local_static_rtp::TrackLocalStaticRTP, TrackLocal, TrackLocalWriter,
    },
};

use crate::error::{Error, RtpErrorKind};

/// Media carried by a stream. The ingest encoder marks each RTP packet with a fixed payload type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    pub const VIDEO_PAYLOAD_TYPE: u8 = 96;
    pub const AUDIO_PAYLOAD_TYPE: u8 = 97;

    pub fn from_payload_type(payload_type: u8) -> Option<Self> {
        match payload_type {
            Self::VIDEO_PAYLOAD_TYPE => Some(Self::Video),
            Self::AUDIO_PAYLOAD_TYPE => Some(Self::Audio),
            _ => None,
        }
    }

    pub fn payload_type(&self) -> u8 {
        match self {
            Self::Video => Self::VIDEO_PAYLOAD_TYPE,
            Self::Audio => Self::AUDIO_PAYLOAD_TYPE,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Video => MIME_TYPE_H264,
            Self::Audio => MIME_TYPE_OPUS,
        }
    }
}

/// Accepts raw RTP packets for one track.
///
/// A write error means the track cannot take packets any more, and the stream that owns it is torn
/// down.
#[async_trait]
pub trait MediaSink: Send + Sync {
    async fn write(&self, packet: &[u8]) -> Result<(), Error>;
}

#[async_trait]
impl MediaSink for TrackLocalStaticRTP {
    async fn write(&self, packet: &[u8]) -> Result<(), Error> {
        TrackLocalWriter::write(self, packet)
            .await
            .map(|_| ())
            .map_err(|err| {
                Error::new_rtp(
                    format!("track {}: {}", self.id(), err),
                    RtpErrorKind::SinkWriteError,
                )
            })
    }
}
