use std::sync::Arc;

use async_trait::async_trait;
use derivative::Derivative;
use tokio::sync::Mutex;
use uuid::Uuid;
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors, media_engine::MediaEngine,
        setting_engine::SettingEngine, APIBuilder, API,
    },
    ice::udp_network::{EphemeralUDP, UDPNetwork},
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_candidate_type::RTCIceCandidateType,
        ice_server::RTCIceServer,
    },
    interceptor::registry::Registry,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
    rtp_transceiver::{
        rtp_codec::RTCRtpCodecCapability, rtp_transceiver_direction::RTCRtpTransceiverDirection,
        RTCRtpTransceiverInit,
    },
    track::track_local::{track_local_static_rtp::TrackLocalStaticRTP, TrackLocal},
};

use crate::{
    config::WebRTCTransportConfig,
    error::{ConfigErrorKind, Error, NegotiationErrorKind},
    peer::{MediaApi, OnConnectionStateFn, OnLocalCandidateFn, PeerConnection},
    sink::MediaKind,
};

/// [`MediaApi`] backed by the `webrtc` crate. Sinks are [`TrackLocalStaticRTP`] tracks shared by
/// every peer connection of a stream.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct WebRTCApi {
    #[derivative(Debug = "ignore")]
    api: API,
    #[derivative(Debug = "ignore")]
    configuration: RTCConfiguration,
}

impl WebRTCApi {
    pub fn new(config: &WebRTCTransportConfig) -> Result<Self, Error> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let mut setting_engine = SettingEngine::default();
        let ephemeral = EphemeralUDP::new(config.port_range.min, config.port_range.max)
            .map_err(|e| {
                Error::new_config(e.to_string(), ConfigErrorKind::InvalidPortRangeError)
            })?;
        setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
        // With ICE servers the public address is discovered instead.
        if let Some(ip) = config.public_ip {
            if config.ice_servers.is_empty() {
                setting_engine.set_nat_1to1_ips(vec![ip.to_string()], RTCIceCandidateType::Host);
            }
        }

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let configuration = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        Ok(Self { api, configuration })
    }
}

#[async_trait]
impl MediaApi for WebRTCApi {
    type Sink = TrackLocalStaticRTP;
    type Peer = WebRTCPeer;

    fn new_sink(&self, kind: MediaKind, stream_id: u16) -> Result<Arc<Self::Sink>, Error> {
        let track = TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: kind.mime_type().to_owned(),
                ..Default::default()
            },
            kind.to_string(),
            format!("castmesh-{}", stream_id),
        );
        Ok(Arc::new(track))
    }

    async fn new_peer_connection(&self) -> Result<Arc<Self::Peer>, Error> {
        let peer_connection = self
            .api
            .new_peer_connection(self.configuration.clone())
            .await?;
        Ok(Arc::new(WebRTCPeer::new(peer_connection)))
    }
}

/// [`PeerConnection`] over [`RTCPeerConnection`].
#[derive(Derivative)]
#[derivative(Debug)]
pub struct WebRTCPeer {
    pub id: String,
    #[derivative(Debug = "ignore")]
    peer_connection: Arc<RTCPeerConnection>,
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
}

impl WebRTCPeer {
    fn new(peer_connection: RTCPeerConnection) -> Self {
        let id = Uuid::new_v4().to_string();
        tracing::debug!("WebRTCPeer {} is created", id);
        Self {
            id,
            peer_connection: Arc::new(peer_connection),
            pending_candidates: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl PeerConnection for WebRTCPeer {
    type Sink = TrackLocalStaticRTP;

    async fn add_track(
        &self,
        sink: Arc<Self::Sink>,
        direction: RTCRtpTransceiverDirection,
    ) -> Result<(), Error> {
        let transceiver = self
            .peer_connection
            .add_transceiver_from_track(
                sink as Arc<dyn TrackLocal + Send + Sync>,
                Some(RTCRtpTransceiverInit {
                    direction,
                    send_encodings: vec![],
                }),
            )
            .await?;

        // Interceptors only run while RTCP is read.
        let sender = transceiver.sender().await;
        let id = self.id.clone();
        tokio::spawn(async move {
            while sender.read_rtcp().await.is_ok() {}
            tracing::debug!("WebRTCPeer {} RTCP reader finished", id);
        });

        Ok(())
    }

    async fn create_offer(&self) -> Result<RTCSessionDescription, Error> {
        self.peer_connection.create_offer(None).await.map_err(|e| {
            Error::new_negotiation(e.to_string(), NegotiationErrorKind::CreateOfferError)
        })
    }

    async fn set_local_description(&self, sdp: RTCSessionDescription) -> Result<(), Error> {
        self.peer_connection
            .set_local_description(sdp)
            .await
            .map_err(|e| {
                Error::new_negotiation(e.to_string(), NegotiationErrorKind::LocalDescriptionError)
            })
    }

    async fn set_remote_description(&self, sdp: RTCSessionDescription) -> Result<(), Error> {
        self.peer_connection
            .set_remote_description(sdp)
            .await
            .map_err(|e| {
                Error::new_negotiation(e.to_string(), NegotiationErrorKind::RemoteDescriptionError)
            })?;

        let mut pendings = self.pending_candidates.lock().await;
        for candidate in pendings.drain(..) {
            tracing::debug!("Adding pending ICE candidate: {:#?}", candidate);
            if let Err(err) = self.peer_connection.add_ice_candidate(candidate).await {
                tracing::error!("failed to add_ice_candidate: {}", err);
            }
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error> {
        if self.peer_connection.remote_description().await.is_some() {
            tracing::debug!("Adding ICE candidate for {:#?}", candidate);
            self.peer_connection
                .add_ice_candidate(candidate)
                .await
                .map_err(|e| {
                    Error::new_negotiation(e.to_string(), NegotiationErrorKind::CandidateError)
                })
        } else {
            tracing::debug!("Pending ICE candidate for {:#?}", candidate);
            self.pending_candidates.lock().await.push(candidate);
            Ok(())
        }
    }

    async fn on_local_candidate(&self, f: OnLocalCandidateFn) {
        let f = Arc::new(f);
        let id = self.id.clone();
        self.peer_connection
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let f = f.clone();
                let id = id.clone();
                Box::pin(async move {
                    // None marks the end of gathering.
                    if let Some(candidate) = candidate {
                        match candidate.to_json() {
                            Ok(init) => (f)(init),
                            Err(err) => {
                                tracing::error!("WebRTCPeer {} failed to encode candidate: {}", id, err)
                            }
                        }
                    }
                })
            }));
    }

    async fn on_connection_state_change(&self, f: OnConnectionStateFn) {
        let f = Arc::new(f);
        let id = self.id.clone();
        self.peer_connection
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                tracing::debug!("WebRTCPeer {} connection state changed: {}", id, state);
                let f = f.clone();
                Box::pin(async move {
                    (f)(state);
                })
            }));
    }

    async fn close(&self) -> Result<(), Error> {
        self.peer_connection.close().await.map_err(|e| {
            Error::new_negotiation(e.to_string(), NegotiationErrorKind::PeerConnectionError)
        })
    }
}

impl Drop for WebRTCPeer {
    fn drop(&mut self) {
        tracing::debug!("WebRTCPeer {} is dropped", self.id);
    }
}
