use std::sync::Arc;

use async_trait::async_trait;
use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::{
        peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription,
    },
    rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection,
};

use crate::{
    error::Error,
    sink::{MediaKind, MediaSink},
};

pub type OnLocalCandidateFn = Box<dyn Fn(RTCIceCandidateInit) + Send + Sync>;
pub type OnConnectionStateFn = Box<dyn Fn(RTCPeerConnectionState) + Send + Sync>;

/// One negotiated connection to a viewer.
///
/// Handlers registered with `on_*` replace the previous handler and are invoked in the order the
/// events happen on the connection.
#[async_trait]
pub trait PeerConnection: Send + Sync + 'static {
    type Sink: MediaSink + 'static;

    async fn add_track(
        &self,
        sink: Arc<Self::Sink>,
        direction: RTCRtpTransceiverDirection,
    ) -> Result<(), Error>;
    async fn create_offer(&self) -> Result<RTCSessionDescription, Error>;
    async fn set_local_description(&self, sdp: RTCSessionDescription) -> Result<(), Error>;
    async fn set_remote_description(&self, sdp: RTCSessionDescription) -> Result<(), Error>;
    async fn add_remote_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error>;
    async fn on_local_candidate(&self, f: OnLocalCandidateFn);
    async fn on_connection_state_change(&self, f: OnConnectionStateFn);
    async fn close(&self) -> Result<(), Error>;
}

/// Factory for the sinks a stream writes into and the peer connections that read from them.
#[async_trait]
pub trait MediaApi: Send + Sync + 'static {
    type Sink: MediaSink + 'static;
    type Peer: PeerConnection<Sink = Self::Sink>;

    fn new_sink(&self, kind: MediaKind, stream_id: u16) -> Result<Arc<Self::Sink>, Error>;
    async fn new_peer_connection(&self) -> Result<Arc<Self::Peer>, Error>;
}

pub(crate) fn is_terminal(state: RTCPeerConnectionState) -> bool {
    matches!(
        state,
        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
    )
}
