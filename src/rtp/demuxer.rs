use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use tokio::{net::UdpSocket, sync::broadcast};

use crate::{
    error::Error,
    rtp::packet,
    sink::{MediaKind, MediaSink},
};

/// Receive buffer, larger than any datagram the ingest encoder sends.
pub const RECEIVE_BUFFER_SIZE: usize = 4096;

/// Packet counters of one stream.
#[derive(Debug, Default)]
pub struct DemuxStats {
    video_packets: AtomicU64,
    audio_packets: AtomicU64,
    malformed_packets: AtomicU64,
    unknown_packets: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct DemuxSnapshot {
    pub video_packets: u64,
    pub audio_packets: u64,
    pub malformed_packets: u64,
    pub unknown_packets: u64,
}

impl DemuxStats {
    pub fn snapshot(&self) -> DemuxSnapshot {
        DemuxSnapshot {
            video_packets: self.video_packets.load(Ordering::Relaxed),
            audio_packets: self.audio_packets.load(Ordering::Relaxed),
            malformed_packets: self.malformed_packets.load(Ordering::Relaxed),
            unknown_packets: self.unknown_packets.load(Ordering::Relaxed),
        }
    }
}

/// Why a demuxer loop returned.
#[derive(Debug)]
pub enum DemuxExit {
    /// The stream was closed.
    Closed,
    /// A read or a sink write failed. The stream cannot recover.
    Failed(Error),
}

/// Reads RTP datagrams from the stream socket and writes each one to the sink its payload type
/// selects.
#[derive(Debug)]
pub struct Demuxer<S: MediaSink> {
    port: u16,
    socket: UdpSocket,
    video_sink: Arc<S>,
    audio_sink: Arc<S>,
    stats: Arc<DemuxStats>,
}

impl<S: MediaSink> Demuxer<S> {
    pub fn new(
        port: u16,
        socket: UdpSocket,
        video_sink: Arc<S>,
        audio_sink: Arc<S>,
        stats: Arc<DemuxStats>,
    ) -> Self {
        Self {
            port,
            socket,
            video_sink,
            audio_sink,
            stats,
        }
    }

    /// Runs until `closed_sender` fires or an I/O error happens. The socket is released when this
    /// returns.
    pub async fn run(self, closed_sender: broadcast::Sender<bool>) -> DemuxExit {
        let mut closed_receiver = closed_sender.subscribe();
        drop(closed_sender);
        let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];

        tracing::info!("RTP demuxer started on :{}", self.port);

        let exit = loop {
            tokio::select! {
                _ = closed_receiver.recv() => {
                    break DemuxExit::Closed;
                }
                res = self.socket.recv_from(&mut buf) => {
                    let len = match res {
                        Ok((len, _addr)) => len,
                        Err(err) => break DemuxExit::Failed(err.into()),
                    };
                    if let Err(err) = self.forward(&buf[..len]).await {
                        break DemuxExit::Failed(err);
                    }
                }
            }
        };

        match &exit {
            DemuxExit::Closed => tracing::info!("RTP demuxer on :{} is closed", self.port),
            DemuxExit::Failed(err) => {
                tracing::error!("RTP demuxer on :{} failed: {}", self.port, err)
            }
        }
        exit
    }

    async fn forward(&self, buf: &[u8]) -> Result<(), Error> {
        let payload_type = match packet::payload_type(buf) {
            Ok(payload_type) => payload_type,
            Err(err) => {
                tracing::trace!("dropping packet on :{}: {}", self.port, err);
                self.stats.malformed_packets.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        };

        match MediaKind::from_payload_type(payload_type) {
            Some(MediaKind::Video) => {
                self.video_sink.write(buf).await?;
                self.stats.video_packets.fetch_add(1, Ordering::Relaxed);
            }
            Some(MediaKind::Audio) => {
                self.audio_sink.write(buf).await?;
                self.stats.audio_packets.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.stats.unknown_packets.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}
