use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::{Arc, Weak},
};

use derivative::Derivative;
use tokio::{
    net::UdpSocket,
    sync::{mpsc, Mutex},
};

use crate::{
    config::{PortRange, RelayConfig},
    error::{Error, NetworkErrorKind, StreamErrorKind},
    peer::MediaApi,
    stream::{Stream, StreamInfo},
};

/// Entry of the registry. A port stays taken from the moment it is reserved until its previous
/// stream has been completely closed.
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
enum Slot<A: MediaApi> {
    Reserved,
    Active(Arc<Stream<A>>),
    Releasing,
}

/// StreamRegistry owns every stream of the process, keyed by ingest port.
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct StreamRegistry<A: MediaApi> {
    address: IpAddr,
    port_range: PortRange,
    hub_capacity: usize,
    client_queue_capacity: usize,
    #[derivative(Debug = "ignore")]
    api: Arc<A>,
    slots: Mutex<HashMap<u16, Slot<A>>>,
    registry_event_sender: mpsc::UnboundedSender<RegistryEvent>,
}

#[derive(Debug)]
pub(crate) enum RegistryEvent {
    /// The demuxer of a stream stopped on an error. Carries the port and the stream instance.
    DemuxFailed(u16, String),
}

impl<A: MediaApi> StreamRegistry<A> {
    /// Creates an empty registry and starts its event loop.
    pub fn new(config: &RelayConfig, api: Arc<A>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<RegistryEvent>();

        let registry = Arc::new(Self {
            address: config.address,
            port_range: config.rtp_port_range,
            hub_capacity: config.hub_capacity,
            client_queue_capacity: config.client_queue_capacity,
            api,
            slots: Mutex::new(HashMap::new()),
            registry_event_sender: tx,
        });

        let weak = Arc::downgrade(&registry);
        tokio::spawn(async move {
            Self::registry_event_loop(weak, rx).await;
        });

        registry
    }

    /// Creates a stream on `port`, or on a free port of the configured range when `port` is
    /// `None` or `Some(0)`. Returns the port the stream listens on.
    pub async fn create(&self, port: Option<u16>) -> Result<u16, Error> {
        let (port, socket) = match port.filter(|port| *port != 0) {
            Some(port) => {
                self.reserve(port).await?;
                match UdpSocket::bind(SocketAddr::new(self.address, port)).await {
                    Ok(socket) => (port, socket),
                    Err(err) => {
                        self.slots.lock().await.remove(&port);
                        return Err(Error::new_network(
                            format!("failed to bind {}:{}: {}", self.address, port, err),
                            NetworkErrorKind::BindError,
                        ));
                    }
                }
            }
            None => self.bind_ephemeral().await?,
        };

        let stream = match Stream::start(
            socket,
            self.api.clone(),
            self.hub_capacity,
            self.client_queue_capacity,
            self.registry_event_sender.clone(),
        ) {
            Ok(stream) => stream,
            Err(err) => {
                self.slots.lock().await.remove(&port);
                tracing::error!("Failed to start stream on {}: {}", port, err);
                return Err(err);
            }
        };

        self.slots.lock().await.insert(port, Slot::Active(stream));
        tracing::info!("Stream {} is created", port);
        Ok(port)
    }

    /// Closes the stream on `port`: the socket is released and every signaling client of the
    /// stream is disconnected.
    pub async fn delete(&self, port: u16) -> Result<(), Error> {
        let stream = {
            let mut slots = self.slots.lock().await;
            match slots.get(&port) {
                Some(Slot::Active(_)) => match slots.insert(port, Slot::Releasing) {
                    Some(Slot::Active(stream)) => stream,
                    _ => return Err(not_found(port)),
                },
                _ => return Err(not_found(port)),
            }
        };

        stream.close().await;
        self.slots.lock().await.remove(&port);
        tracing::info!("Stream {} is deleted", port);
        Ok(())
    }

    pub async fn lookup(&self, port: u16) -> Result<Arc<Stream<A>>, Error> {
        match self.slots.lock().await.get(&port) {
            Some(Slot::Active(stream)) => Ok(stream.clone()),
            _ => Err(not_found(port)),
        }
    }

    /// Active streams ordered by port.
    pub async fn list(&self) -> Vec<Arc<Stream<A>>> {
        let mut streams: Vec<Arc<Stream<A>>> = self
            .slots
            .lock()
            .await
            .values()
            .filter_map(|slot| match slot {
                Slot::Active(stream) => Some(stream.clone()),
                _ => None,
            })
            .collect();
        streams.sort_by_key(|stream| stream.id);
        streams
    }

    pub async fn list_info(&self) -> Vec<StreamInfo> {
        let mut infos = vec![];
        for stream in self.list().await {
            infos.push(stream.info().await);
        }
        infos
    }

    /// Deletes every stream.
    pub async fn close(&self) {
        let ports: Vec<u16> = self.list().await.iter().map(|stream| stream.id).collect();
        for port in ports {
            if let Err(err) = self.delete(port).await {
                tracing::debug!("Stream {} was already gone on close: {}", port, err);
            }
        }
    }

    async fn reserve(&self, port: u16) -> Result<(), Error> {
        let mut slots = self.slots.lock().await;
        if slots.contains_key(&port) {
            return Err(Error::new_network(
                format!("port {} is already in use", port),
                NetworkErrorKind::BindError,
            ));
        }
        slots.insert(port, Slot::Reserved);
        Ok(())
    }

    async fn bind_ephemeral(&self) -> Result<(u16, UdpSocket), Error> {
        for port in self.port_range.iter() {
            if self.reserve(port).await.is_err() {
                continue;
            }
            match UdpSocket::bind(SocketAddr::new(self.address, port)).await {
                Ok(socket) => return Ok((port, socket)),
                Err(err) => {
                    tracing::trace!("port {} is not available: {}", port, err);
                    self.slots.lock().await.remove(&port);
                }
            }
        }
        Err(Error::new_network(
            format!("no free port in {}", self.port_range),
            NetworkErrorKind::NoAvailablePortError,
        ))
    }

    async fn registry_event_loop(
        registry: Weak<Self>,
        mut event_receiver: mpsc::UnboundedReceiver<RegistryEvent>,
    ) {
        while let Some(event) = event_receiver.recv().await {
            let Some(registry) = registry.upgrade() else {
                break;
            };
            match event {
                RegistryEvent::DemuxFailed(port, instance) => {
                    let current = match registry.lookup(port).await {
                        Ok(stream) => stream.instance == instance,
                        Err(_) => false,
                    };
                    if current {
                        tracing::warn!("Stream {} stopped receiving, deleting it", port);
                        if let Err(err) = registry.delete(port).await {
                            tracing::debug!("Failed stream {} was already deleted: {}", port, err);
                        }
                    }
                }
            }
        }
        tracing::debug!("Registry event loop finished");
    }
}

fn not_found(port: u16) -> Error {
    Error::new_stream(
        format!("stream {} does not exist", port),
        StreamErrorKind::NotFoundError,
    )
}
