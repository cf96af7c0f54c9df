use std::sync::Arc;

use derivative::Derivative;
use tokio::{
    net::UdpSocket,
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;

use crate::{
    error::Error,
    peer::{MediaApi, PeerConnection},
    registry::RegistryEvent,
    rtp::demuxer::{DemuxExit, DemuxSnapshot, DemuxStats, Demuxer},
    signaling::{client::SignalingClient, hub::Hub},
    sink::MediaKind,
};

/// Stream is one ingest port together with its sinks, its hub and its demuxer loop.
///
/// A stream only exists while all four are alive. It is closed by the registry, never on its own.
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct Stream<A: MediaApi> {
    pub id: u16,
    pub(crate) instance: String,
    #[derivative(Debug = "ignore")]
    api: Arc<A>,
    #[derivative(Debug = "ignore")]
    video_sink: Arc<A::Sink>,
    #[derivative(Debug = "ignore")]
    audio_sink: Arc<A::Sink>,
    hub: Hub,
    stats: Arc<DemuxStats>,
    closed_sender: broadcast::Sender<bool>,
    demuxer: Mutex<Option<JoinHandle<()>>>,
    client_queue_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StreamInfo {
    pub port: u16,
    pub clients: usize,
    pub stats: DemuxSnapshot,
}

impl<A: MediaApi> Stream<A> {
    /// Creates the sinks and the hub for an already bound socket and starts reading from it.
    ///
    /// The socket is dropped when a sink cannot be created, so a failed start leaves nothing
    /// behind.
    pub(crate) fn start(
        socket: UdpSocket,
        api: Arc<A>,
        hub_capacity: usize,
        client_queue_capacity: usize,
        registry_event_sender: mpsc::UnboundedSender<RegistryEvent>,
    ) -> Result<Arc<Self>, Error> {
        let id = socket.local_addr()?.port();
        let video_sink = api.new_sink(MediaKind::Video, id)?;
        let audio_sink = api.new_sink(MediaKind::Audio, id)?;

        let instance = uuid::Uuid::new_v4().to_string();
        let hub = Hub::new(id, hub_capacity);
        let stats = Arc::new(DemuxStats::default());
        let (closed_sender, _rx) = broadcast::channel(1);

        let demuxer = Demuxer::new(
            id,
            socket,
            video_sink.clone(),
            audio_sink.clone(),
            stats.clone(),
        );
        let handle = {
            let closed_sender = closed_sender.clone();
            let instance = instance.clone();
            let run = tokio::spawn(demuxer.run(closed_sender));
            tokio::spawn(async move {
                let failed = match run.await {
                    Ok(DemuxExit::Closed) => false,
                    Ok(DemuxExit::Failed(_)) => true,
                    Err(err) => {
                        tracing::error!("Stream {} demuxer task aborted: {}", id, err);
                        true
                    }
                };
                if failed {
                    let _ = registry_event_sender.send(RegistryEvent::DemuxFailed(id, instance));
                }
            })
        };

        tracing::debug!("Stream {} is started", id);

        Ok(Arc::new(Self {
            id,
            instance,
            api,
            video_sink,
            audio_sink,
            hub,
            stats,
            closed_sender,
            demuxer: Mutex::new(Some(handle)),
            client_queue_capacity,
        }))
    }

    /// Prepares a signaling session for a new viewer: a peer connection that sends both tracks of
    /// this stream.
    pub async fn open_session(&self) -> Result<Arc<SignalingClient<A::Peer>>, Error> {
        let peer = self.api.new_peer_connection().await?;
        for sink in [&self.video_sink, &self.audio_sink] {
            if let Err(err) = peer
                .add_track(sink.clone(), RTCRtpTransceiverDirection::Sendonly)
                .await
            {
                let _ = peer.close().await;
                return Err(err);
            }
        }
        Ok(Arc::new(SignalingClient::new(
            self.hub.clone(),
            peer,
            self.client_queue_capacity,
        )))
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn stats(&self) -> DemuxSnapshot {
        self.stats.snapshot()
    }

    pub async fn info(&self) -> StreamInfo {
        StreamInfo {
            port: self.id,
            clients: self.hub.len().await.unwrap_or(0),
            stats: self.stats(),
        }
    }

    /// Stops the demuxer, waits until the socket is released, then disconnects every client.
    pub(crate) async fn close(&self) {
        let _ = self.closed_sender.send(true);
        if let Some(handle) = self.demuxer.lock().await.take() {
            if let Err(err) = handle.await {
                tracing::error!("Stream {} demuxer task failed: {}", self.id, err);
            }
        }
        self.hub.close();
        tracing::debug!("Stream {} is closed", self.id);
    }
}

impl<A: MediaApi> Drop for Stream<A> {
    fn drop(&mut self) {
        let _ = self.closed_sender.send(true);
        tracing::debug!("Stream {} is dropped", self.id);
    }
}
