use serde::{Deserialize, Serialize};
use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::sdp::session_description::RTCSessionDescription,
};

use crate::error::{Error, SignalingErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Event {
    Offer,
    Answer,
    Candidate,
    /// Any event this relay does not handle. Decoded only, never written to the wire.
    #[serde(other, skip_serializing)]
    Unknown,
}

/// Signaling envelope exchanged with browsers. `data` holds a JSON document encoded as a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub event: Event,
    pub data: String,
}

impl Message {
    pub fn offer(sdp: &RTCSessionDescription) -> Result<Self, Error> {
        Ok(Self {
            event: Event::Offer,
            data: encode(sdp)?,
        })
    }

    pub fn candidate(candidate: &RTCIceCandidateInit) -> Result<Self, Error> {
        Ok(Self {
            event: Event::Candidate,
            data: encode(candidate)?,
        })
    }

    pub fn decode(text: &str) -> Result<Self, Error> {
        serde_json::from_str(text)
            .map_err(|e| Error::new_signaling(e.to_string(), SignalingErrorKind::DecodeError))
    }

    pub fn encode(&self) -> Result<String, Error> {
        encode(self)
    }

    pub fn session_description(&self) -> Result<RTCSessionDescription, Error> {
        serde_json::from_str(&self.data)
            .map_err(|e| Error::new_signaling(e.to_string(), SignalingErrorKind::DecodeError))
    }

    pub fn ice_candidate(&self) -> Result<RTCIceCandidateInit, Error> {
        serde_json::from_str(&self.data)
            .map_err(|e| Error::new_signaling(e.to_string(), SignalingErrorKind::DecodeError))
    }
}

fn encode<T: Serialize>(value: &T) -> Result<String, Error> {
    serde_json::to_string(value)
        .map_err(|e| Error::new_signaling(e.to_string(), SignalingErrorKind::EncodeError))
}
