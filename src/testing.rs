//! In-memory stand-ins for the media capabilities.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

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
    error::{Error, NegotiationErrorKind, RtpErrorKind},
    peer::{MediaApi, OnConnectionStateFn, OnLocalCandidateFn, PeerConnection},
    sink::{MediaKind, MediaSink},
};

const WAIT: Duration = Duration::from_secs(5);

pub(crate) async fn eventually<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition was not met in time");
}

pub(crate) fn session_description(sdp_type: &str, sdp: &str) -> RTCSessionDescription {
    serde_json::from_value(serde_json::json!({ "type": sdp_type, "sdp": sdp })).unwrap()
}

#[derive(Debug, Default)]
pub(crate) struct FakeSink {
    kind: Option<MediaKind>,
    fail: AtomicBool,
    panic: AtomicBool,
    packets: Mutex<Vec<Vec<u8>>>,
}

impl FakeSink {
    pub(crate) fn failing() -> Self {
        Self {
            fail: AtomicBool::new(true),
            ..Default::default()
        }
    }

    pub(crate) fn break_down(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub(crate) fn panic_on_write(&self) {
        self.panic.store(true, Ordering::SeqCst);
    }

    pub(crate) fn kind(&self) -> Option<MediaKind> {
        self.kind
    }

    pub(crate) fn packets(&self) -> Vec<Vec<u8>> {
        self.packets.lock().unwrap().clone()
    }

    pub(crate) async fn wait_for(&self, count: usize) {
        eventually(|| self.packets.lock().unwrap().len() >= count).await;
    }
}

#[async_trait]
impl MediaSink for FakeSink {
    async fn write(&self, packet: &[u8]) -> Result<(), Error> {
        if self.panic.load(Ordering::SeqCst) {
            panic!("sink panicked on a {} byte packet", packet.len());
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::new_rtp(
                "sink is broken".to_string(),
                RtpErrorKind::SinkWriteError,
            ));
        }
        self.packets.lock().unwrap().push(packet.to_vec());
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakePeer {
    offer_sdp: String,
    fail_offer: bool,
    fail_remote_description: bool,
    tracks: Mutex<Vec<(Option<MediaKind>, RTCRtpTransceiverDirection)>>,
    local_description: Mutex<Option<RTCSessionDescription>>,
    remote_description: Mutex<Option<RTCSessionDescription>>,
    remote_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    on_local_candidate: Mutex<Option<OnLocalCandidateFn>>,
    on_connection_state: Mutex<Option<OnConnectionStateFn>>,
    closed: AtomicBool,
    close_count: AtomicUsize,
}

impl FakePeer {
    pub(crate) fn with_offer(sdp: &str) -> Self {
        Self {
            offer_sdp: sdp.to_string(),
            ..Default::default()
        }
    }

    pub(crate) fn failing_offer() -> Self {
        Self {
            fail_offer: true,
            ..Default::default()
        }
    }

    pub(crate) fn rejecting_answer(sdp: &str) -> Self {
        Self {
            offer_sdp: sdp.to_string(),
            fail_remote_description: true,
            ..Default::default()
        }
    }

    pub(crate) fn tracks(&self) -> Vec<(Option<MediaKind>, RTCRtpTransceiverDirection)> {
        self.tracks.lock().unwrap().clone()
    }

    pub(crate) fn local_sdp(&self) -> Option<String> {
        self.local_description
            .lock()
            .unwrap()
            .as_ref()
            .map(|d| d.sdp.clone())
    }

    pub(crate) fn remote_sdp(&self) -> Option<String> {
        self.remote_description
            .lock()
            .unwrap()
            .as_ref()
            .map(|d| d.sdp.clone())
    }

    pub(crate) fn remote_candidates(&self) -> Vec<String> {
        self.remote_candidates
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.candidate.clone())
            .collect()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    pub(crate) fn has_handlers(&self) -> bool {
        self.on_local_candidate.lock().unwrap().is_some()
            && self.on_connection_state.lock().unwrap().is_some()
    }

    pub(crate) fn emit_local_candidate(&self, candidate: &str) {
        if let Some(f) = self.on_local_candidate.lock().unwrap().as_ref() {
            f(RTCIceCandidateInit {
                candidate: candidate.to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            });
        }
    }

    pub(crate) fn emit_state(&self, state: RTCPeerConnectionState) {
        if let Some(f) = self.on_connection_state.lock().unwrap().as_ref() {
            f(state);
        }
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    type Sink = FakeSink;

    async fn add_track(
        &self,
        sink: Arc<Self::Sink>,
        direction: RTCRtpTransceiverDirection,
    ) -> Result<(), Error> {
        self.tracks.lock().unwrap().push((sink.kind(), direction));
        Ok(())
    }

    async fn create_offer(&self) -> Result<RTCSessionDescription, Error> {
        if self.fail_offer {
            return Err(Error::new_negotiation(
                "offer refused".to_string(),
                NegotiationErrorKind::CreateOfferError,
            ));
        }
        Ok(session_description("offer", &self.offer_sdp))
    }

    async fn set_local_description(&self, sdp: RTCSessionDescription) -> Result<(), Error> {
        *self.local_description.lock().unwrap() = Some(sdp);
        Ok(())
    }

    async fn set_remote_description(&self, sdp: RTCSessionDescription) -> Result<(), Error> {
        if self.fail_remote_description {
            return Err(Error::new_negotiation(
                "answer refused".to_string(),
                NegotiationErrorKind::RemoteDescriptionError,
            ));
        }
        *self.remote_description.lock().unwrap() = Some(sdp);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error> {
        self.remote_candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn on_local_candidate(&self, f: OnLocalCandidateFn) {
        *self.on_local_candidate.lock().unwrap() = Some(f);
    }

    async fn on_connection_state_change(&self, f: OnConnectionStateFn) {
        *self.on_connection_state.lock().unwrap() = Some(f);
    }

    async fn close(&self) -> Result<(), Error> {
        self.closed.store(true, Ordering::SeqCst);
        self.close_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeApi {
    fail_sinks: bool,
    sinks: Mutex<Vec<(u16, Arc<FakeSink>)>>,
    peers: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakeApi {
    pub(crate) fn failing_sinks() -> Self {
        Self {
            fail_sinks: true,
            ..Default::default()
        }
    }

    pub(crate) fn sink(&self, stream_id: u16, kind: MediaKind) -> Option<Arc<FakeSink>> {
        self.sinks
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(id, sink)| *id == stream_id && sink.kind() == Some(kind))
            .map(|(_, sink)| sink.clone())
    }

    pub(crate) fn break_sinks(&self, stream_id: u16) {
        for (id, sink) in self.sinks.lock().unwrap().iter() {
            if *id == stream_id {
                sink.break_down();
            }
        }
    }

    pub(crate) fn panic_sinks(&self, stream_id: u16) {
        for (id, sink) in self.sinks.lock().unwrap().iter() {
            if *id == stream_id {
                sink.panic_on_write();
            }
        }
    }

    pub(crate) fn peers(&self) -> Vec<Arc<FakePeer>> {
        self.peers.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaApi for FakeApi {
    type Sink = FakeSink;
    type Peer = FakePeer;

    fn new_sink(&self, kind: MediaKind, stream_id: u16) -> Result<Arc<Self::Sink>, Error> {
        if self.fail_sinks {
            return Err(Error::new_rtp(
                "no sinks".to_string(),
                RtpErrorKind::SinkWriteError,
            ));
        }
        let sink = Arc::new(FakeSink {
            kind: Some(kind),
            ..Default::default()
        });
        self.sinks.lock().unwrap().push((stream_id, sink.clone()));
        Ok(sink)
    }

    async fn new_peer_connection(&self) -> Result<Arc<Self::Peer>, Error> {
        let index = self.peers.lock().unwrap().len();
        let peer = Arc::new(FakePeer::with_offer(&format!(
            "v=0\r\no=- {} 0 IN IP4 0.0.0.0\r\n",
            index
        )));
        self.peers.lock().unwrap().push(peer.clone());
        Ok(peer)
    }
}
