use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use thiserror::Error;

#[derive(Error, Debug)]
#[error("{kind}: {message}")]
pub struct Error {
    pub kind: Kind,
    pub message: String,
}

#[derive(Error, Debug)]
pub enum Kind {
    #[error("network error: {0}")]
    NetworkError(NetworkErrorKind),
    #[error("stream error: {0}")]
    StreamError(StreamErrorKind),
    #[error("rtp error: {0}")]
    RtpError(RtpErrorKind),
    #[error("negotiation error: {0}")]
    NegotiationError(NegotiationErrorKind),
    #[error("signaling error: {0}")]
    SignalingError(SignalingErrorKind),
    #[error("config error: {0}")]
    ConfigError(ConfigErrorKind),
    #[error(transparent)]
    WebRTCError(#[from] webrtc::Error),
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkErrorKind {
    #[error("failed to bind socket")]
    BindError,
    #[error("no free port in range")]
    NoAvailablePortError,
    #[error("socket failure")]
    SocketError,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamErrorKind {
    #[error("stream not found")]
    NotFoundError,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RtpErrorKind {
    #[error("malformed packet")]
    MalformedPacketError,
    #[error("sink write failed")]
    SinkWriteError,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationErrorKind {
    #[error("failed to create offer")]
    CreateOfferError,
    #[error("failed to set local description")]
    LocalDescriptionError,
    #[error("failed to set remote description")]
    RemoteDescriptionError,
    #[error("failed to add ice candidate")]
    CandidateError,
    #[error("peer connection failure")]
    PeerConnectionError,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingErrorKind {
    #[error("failed to encode message")]
    EncodeError,
    #[error("failed to decode message")]
    DecodeError,
    #[error("hub is closed")]
    HubClosedError,
    #[error("connection is closed")]
    ConnectionClosedError,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigErrorKind {
    #[error("invalid port range")]
    InvalidPortRangeError,
    #[error("invalid port")]
    InvalidPortError,
    #[error("invalid address")]
    InvalidAddressError,
}

impl Error {
    pub fn new_network(message: String, kind: NetworkErrorKind) -> Self {
        Self {
            kind: Kind::NetworkError(kind),
            message,
        }
    }

    pub fn new_stream(message: String, kind: StreamErrorKind) -> Self {
        Self {
            kind: Kind::StreamError(kind),
            message,
        }
    }

    pub fn new_rtp(message: String, kind: RtpErrorKind) -> Self {
        Self {
            kind: Kind::RtpError(kind),
            message,
        }
    }

    pub fn new_negotiation(message: String, kind: NegotiationErrorKind) -> Self {
        Self {
            kind: Kind::NegotiationError(kind),
            message,
        }
    }

    pub fn new_signaling(message: String, kind: SignalingErrorKind) -> Self {
        Self {
            kind: Kind::SignalingError(kind),
            message,
        }
    }

    pub fn new_config(message: String, kind: ConfigErrorKind) -> Self {
        Self {
            kind: Kind::ConfigError(kind),
            message,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.kind, Kind::StreamError(StreamErrorKind::NotFoundError))
    }

    pub fn is_network(&self) -> bool {
        matches!(self.kind, Kind::NetworkError(_))
    }
}

impl From<webrtc::Error> for Error {
    fn from(err: webrtc::Error) -> Self {
        Self {
            message: err.to_string(),
            kind: Kind::WebRTCError(err),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self {
            message: err.to_string(),
            kind: Kind::IOError(err),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self {
            message: err.to_string(),
            kind: Kind::JsonError(err),
        }
    }
}

impl ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        match self.kind {
            Kind::StreamError(StreamErrorKind::NotFoundError) => StatusCode::NOT_FOUND,
            Kind::ConfigError(_) => StatusCode::BAD_REQUEST,
            Kind::NetworkError(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).body(self.message.clone())
    }
}
