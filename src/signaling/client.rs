use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use derivative::Derivative;
use enclose::enclose;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::peer_connection_state::RTCPeerConnectionState,
};

use crate::{
    error::Error,
    peer::{self, PeerConnection},
    signaling::{
        hub::{ClientId, Hub},
        message::{Event, Message},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ClientState {
    Connected,
    Negotiating,
    Established,
    Closed,
}

#[derive(Debug)]
enum PeerEvent {
    Candidate(RTCIceCandidateInit),
    State(RTCPeerConnectionState),
}

/// One signaling session: a WebSocket connection on one side, a peer connection on the other.
///
/// Everything the client sends goes through its hub, including its own offer and candidates, so a
/// client that has been evicted or whose stream is gone stops sending. Any failure closes this
/// client only.
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct SignalingClient<P: PeerConnection> {
    pub id: ClientId,
    hub: Hub,
    #[derivative(Debug = "ignore")]
    peer: Arc<P>,
    state: watch::Sender<ClientState>,
    closed: AtomicBool,
    cancel: CancellationToken,
    queue_capacity: usize,
}

impl<P: PeerConnection> SignalingClient<P> {
    pub fn new(hub: Hub, peer: Arc<P>, queue_capacity: usize) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let (state, _) = watch::channel(ClientState::Connected);
        tracing::debug!("SignalingClient {} is created on hub {}", id, hub.id);
        Self {
            id,
            hub,
            peer,
            state,
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            queue_capacity: queue_capacity.max(1),
        }
    }

    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    /// Resolves once the client has been torn down.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    /// Drives the session until the connection, the peer or the hub goes away.
    ///
    /// `inbound` yields text frames read from the WebSocket, `outbound` writes text frames to it.
    pub async fn run<I, O>(self: Arc<Self>, inbound: I, mut outbound: O)
    where
        I: Stream<Item = Result<String, Error>> + Unpin + Send + 'static,
        O: Sink<String, Error = Error> + Unpin + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let membership = match self.hub.register(self.id.clone(), sender).await {
            Ok(membership) => membership,
            Err(err) => {
                tracing::error!("SignalingClient {} could not join hub: {}", self.id, err);
                self.teardown().await;
                let _ = outbound.close().await;
                return;
            }
        };
        let outbound_loop =
            tokio::spawn(self.clone().outbound_loop(receiver, membership, outbound));

        self.subscribe_peer_events().await;

        match self.negotiate().await {
            Ok(()) => self.inbound_loop(inbound).await,
            Err(err) => {
                tracing::error!("SignalingClient {} failed to negotiate: {}", self.id, err);
                self.teardown().await;
            }
        }

        let _ = outbound_loop.await;
    }

    async fn negotiate(&self) -> Result<(), Error> {
        self.set_state(ClientState::Negotiating);
        let offer = self.peer.create_offer().await?;
        self.peer.set_local_description(offer.clone()).await?;
        match Message::offer(&offer) {
            Ok(message) => self.hub.send_to(&self.id, message).await?,
            Err(err) => tracing::warn!("SignalingClient {} dropped offer: {}", self.id, err),
        }
        Ok(())
    }

    async fn subscribe_peer_events(self: &Arc<Self>) {
        let (event_sender, mut event_receiver) = mpsc::unbounded_channel();

        self.peer
            .on_local_candidate(Box::new(enclose!((event_sender) move |candidate| {
                let _ = event_sender.send(PeerEvent::Candidate(candidate));
            })))
            .await;
        self.peer
            .on_connection_state_change(Box::new(move |state| {
                let _ = event_sender.send(PeerEvent::State(state));
            }))
            .await;

        let client = self.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = client.cancel.cancelled() => break,
                    event = event_receiver.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                match event {
                    PeerEvent::Candidate(candidate) => match Message::candidate(&candidate) {
                        Ok(message) => {
                            if let Err(err) = client.hub.send_to(&client.id, message).await {
                                tracing::debug!(
                                    "SignalingClient {} could not send candidate: {}",
                                    client.id,
                                    err
                                );
                            }
                        }
                        Err(err) => {
                            tracing::warn!("SignalingClient {} dropped candidate: {}", client.id, err)
                        }
                    },
                    PeerEvent::State(state) => {
                        tracing::debug!(
                            "SignalingClient {} peer connection state: {}",
                            client.id,
                            state
                        );
                        if state == RTCPeerConnectionState::Connected {
                            client.set_state(ClientState::Established);
                        } else if peer::is_terminal(state) {
                            client.teardown().await;
                            break;
                        }
                    }
                }
            }
        });
    }

    async fn inbound_loop<I>(&self, mut inbound: I)
    where
        I: Stream<Item = Result<String, Error>> + Unpin,
    {
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => break,
                frame = inbound.next() => frame,
            };
            match frame {
                Some(Ok(text)) => {
                    if let Err(err) = self.handle_message(&text).await {
                        tracing::error!("SignalingClient {}: {}", self.id, err);
                        break;
                    }
                }
                Some(Err(err)) => {
                    tracing::warn!("SignalingClient {} read failed: {}", self.id, err);
                    break;
                }
                None => {
                    tracing::debug!("SignalingClient {} connection is closed", self.id);
                    break;
                }
            }
        }
        self.teardown().await;
    }

    async fn handle_message(&self, text: &str) -> Result<(), Error> {
        let message = Message::decode(text)?;
        match message.event {
            Event::Answer => {
                let answer = message.session_description()?;
                self.peer.set_remote_description(answer).await
            }
            Event::Candidate => {
                let candidate = message.ice_candidate()?;
                self.peer.add_remote_candidate(candidate).await
            }
            Event::Offer | Event::Unknown => {
                tracing::debug!(
                    "SignalingClient {} ignores {} message",
                    self.id,
                    message.event
                );
                Ok(())
            }
        }
    }

    /// Writes what the hub delivers. A write that is still pending when the client leaves the hub
    /// is abandoned, so a connection that stops reading cannot hold the client open.
    async fn outbound_loop<O>(
        self: Arc<Self>,
        mut receiver: mpsc::Receiver<Message>,
        membership: CancellationToken,
        mut outbound: O,
    ) where
        O: Sink<String, Error = Error> + Unpin,
    {
        loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => break,
                message = receiver.recv() => match message {
                    Some(message) => message,
                    None => {
                        tracing::debug!("SignalingClient {} left hub {}", self.id, self.hub.id);
                        break;
                    }
                },
            };
            let text = match message.encode() {
                Ok(text) => text,
                Err(err) => {
                    tracing::warn!("SignalingClient {} dropped message: {}", self.id, err);
                    continue;
                }
            };
            let sent = tokio::select! {
                biased;
                sent = outbound.send(text) => sent,
                _ = membership.cancelled() => {
                    tracing::warn!(
                        "SignalingClient {} left hub {} with a write pending",
                        self.id,
                        self.hub.id
                    );
                    break;
                }
                _ = self.cancel.cancelled() => break,
            };
            if let Err(err) = sent {
                tracing::warn!("SignalingClient {} write failed: {}", self.id, err);
                break;
            }
        }
        let _ = outbound.close().await;
        self.teardown().await;
    }

    /// Leaves the hub and closes the peer connection. Only the first call has an effect.
    pub async fn teardown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.hub.unregister(&self.id).await {
            tracing::debug!("SignalingClient {}: {}", self.id, err);
        }
        if let Err(err) = self.peer.close().await {
            tracing::error!("SignalingClient {} failed to close peer: {}", self.id, err);
        }
        self.state.send_replace(ClientState::Closed);
        self.cancel.cancel();
        tracing::info!("SignalingClient {} is closed", self.id);
    }

    fn set_state(&self, state: ClientState) {
        self.state.send_if_modified(|current| {
            if *current == ClientState::Closed || *current == state {
                return false;
            }
            *current = state;
            true
        });
    }
}

impl<P: PeerConnection> Drop for SignalingClient<P> {
    fn drop(&mut self) {
        tracing::debug!("SignalingClient {} is dropped", self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::channel::mpsc as ws;
    use tokio::task::JoinHandle;

    use super::*;
    use crate::{
        error::SignalingErrorKind,
        testing::{eventually, session_description, FakePeer},
    };

    struct Session {
        client: Arc<SignalingClient<FakePeer>>,
        peer: Arc<FakePeer>,
        to_client: ws::UnboundedSender<Result<String, Error>>,
        from_client: ws::UnboundedReceiver<String>,
        task: JoinHandle<()>,
    }

    impl Session {
        async fn next(&mut self) -> Option<Message> {
            tokio::time::timeout(Duration::from_secs(5), self.from_client.next())
                .await
                .expect("timed out waiting for frame")
                .map(|text| Message::decode(&text).unwrap())
        }

        fn send(&self, text: &str) {
            self.to_client.unbounded_send(Ok(text.to_string())).unwrap();
        }

        async fn wait_closed(&self) {
            tokio::time::timeout(Duration::from_secs(5), self.client.closed())
                .await
                .expect("client was not closed");
        }
    }

    fn start(hub: &Hub, peer: FakePeer) -> Session {
        let peer = Arc::new(peer);
        let (to_client, inbound) = ws::unbounded();
        let (outbound, from_client) = ws::unbounded::<String>();
        let outbound = outbound.sink_map_err(|e| {
            Error::new_signaling(e.to_string(), SignalingErrorKind::ConnectionClosedError)
        });
        let client = Arc::new(SignalingClient::new(hub.clone(), peer.clone(), 8));
        let task = tokio::spawn(client.clone().run(inbound, outbound));
        Session {
            client,
            peer,
            to_client,
            from_client,
            task,
        }
    }

    fn answer() -> String {
        let answer = session_description("answer", "v=0\r\na=answer\r\n");
        Message {
            event: Event::Answer,
            data: serde_json::to_string(&answer).unwrap(),
        }
        .encode()
        .unwrap()
    }

    #[tokio::test]
    async fn test_offer_is_sent_first() {
        let hub = Hub::new(5004, 16);
        let mut session = start(&hub, FakePeer::with_offer("v=0\r\na=offer\r\n"));

        let message = session.next().await.unwrap();
        assert_eq!(message.event, Event::Offer);
        assert_eq!(
            message.session_description().unwrap().sdp,
            "v=0\r\na=offer\r\n"
        );
        assert_eq!(
            session.peer.local_sdp().as_deref(),
            Some("v=0\r\na=offer\r\n")
        );
        assert_eq!(session.client.state(), ClientState::Negotiating);
        assert!(hub.is_registered(&session.client.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_answer_and_candidate_are_applied() {
        let hub = Hub::new(5004, 16);
        let mut session = start(&hub, FakePeer::with_offer("v=0\r\n"));
        session.next().await.unwrap();

        session.send(&answer());
        session.send(r#"{"event":"bye","data":""}"#);
        session.send(r#"{"event":"candidate","data":"{\"candidate\":\"candidate:1 1 UDP 1 192.0.2.1 5010 typ host\",\"sdpMid\":\"0\"}"}"#);

        let peer = session.peer.clone();
        eventually(|| peer.remote_candidates().len() == 1).await;
        assert_eq!(peer.remote_sdp().as_deref(), Some("v=0\r\na=answer\r\n"));
        assert_eq!(
            peer.remote_candidates(),
            vec!["candidate:1 1 UDP 1 192.0.2.1 5010 typ host".to_string()]
        );
        assert!(!peer.is_closed());
    }

    #[tokio::test]
    async fn test_local_candidate_goes_through_hub() {
        let hub = Hub::new(5004, 16);
        let mut session = start(&hub, FakePeer::with_offer("v=0\r\n"));
        session.next().await.unwrap();
        assert!(session.peer.has_handlers());

        session
            .peer
            .emit_local_candidate("candidate:2 1 UDP 1 198.51.100.7 20000 typ host");

        let message = session.next().await.unwrap();
        assert_eq!(message.event, Event::Candidate);
        assert_eq!(
            message.ice_candidate().unwrap().candidate,
            "candidate:2 1 UDP 1 198.51.100.7 20000 typ host"
        );
    }

    #[tokio::test]
    async fn test_connected_then_failed() {
        let hub = Hub::new(5004, 16);
        let mut session = start(&hub, FakePeer::with_offer("v=0\r\n"));
        session.next().await.unwrap();

        session.peer.emit_state(RTCPeerConnectionState::Connected);
        let client = session.client.clone();
        eventually(|| client.state() == ClientState::Established).await;

        session.peer.emit_state(RTCPeerConnectionState::Failed);
        session.wait_closed().await;
        assert_eq!(session.client.state(), ClientState::Closed);
        assert!(session.peer.is_closed());
        assert!(!hub.is_registered(&session.client.id).await.unwrap());
        assert!(session.next().await.is_none());
    }

    #[tokio::test]
    async fn test_decode_failure_closes_client() {
        let hub = Hub::new(5004, 16);
        let mut session = start(&hub, FakePeer::with_offer("v=0\r\n"));
        session.next().await.unwrap();

        session.send("{not json");

        session.wait_closed().await;
        assert!(session.peer.is_closed());
        assert_eq!(hub.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_read_failure_closes_client() {
        let hub = Hub::new(5004, 16);
        let mut session = start(&hub, FakePeer::with_offer("v=0\r\n"));
        session.next().await.unwrap();

        session
            .to_client
            .unbounded_send(Err(Error::new_signaling(
                "reset".to_string(),
                SignalingErrorKind::ConnectionClosedError,
            )))
            .unwrap();

        session.wait_closed().await;
        assert!(session.peer.is_closed());
    }

    #[tokio::test]
    async fn test_rejected_answer_closes_only_that_client() {
        let hub = Hub::new(5004, 16);
        let mut broken = start(&hub, FakePeer::rejecting_answer("v=0\r\n"));
        let mut healthy = start(&hub, FakePeer::with_offer("v=0\r\n"));
        broken.next().await.unwrap();
        healthy.next().await.unwrap();

        broken.send(&answer());

        broken.wait_closed().await;
        assert!(broken.peer.is_closed());
        assert!(!healthy.peer.is_closed());
        assert_eq!(healthy.client.state(), ClientState::Negotiating);
        assert!(hub.is_registered(&healthy.client.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_offer_failure_closes_client() {
        let hub = Hub::new(5004, 16);
        let session = start(&hub, FakePeer::failing_offer());

        session.wait_closed().await;
        assert!(session.peer.is_closed());
        assert!(!hub.is_registered(&session.client.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_write_failure_closes_client() {
        let hub = Hub::new(5004, 16);
        let session = start(&hub, FakePeer::with_offer("v=0\r\n"));
        let Session {
            client,
            peer,
            from_client,
            task,
            ..
        } = session;
        drop(from_client);

        tokio::time::timeout(Duration::from_secs(5), client.closed())
            .await
            .unwrap();
        assert!(peer.is_closed());
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_stalled_connection_is_evicted() {
        let hub = Hub::new(5004, 16);
        let peer = Arc::new(FakePeer::with_offer("v=0\r\n"));
        let (_to_client, inbound) = ws::unbounded::<Result<String, Error>>();
        let (outbound, _never_read) = ws::channel::<String>(0);
        let outbound = outbound.sink_map_err(|e| {
            Error::new_signaling(e.to_string(), SignalingErrorKind::ConnectionClosedError)
        });
        let client = Arc::new(SignalingClient::new(hub.clone(), peer.clone(), 2));
        let task = tokio::spawn(client.clone().run(inbound, outbound));

        tokio::time::timeout(Duration::from_secs(5), async {
            while !hub.is_registered(&client.id).await.unwrap() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("client did not join the hub");

        for n in 0..8 {
            hub.broadcast(Message {
                event: Event::Candidate,
                data: format!("candidate-{}", n),
            })
            .await
            .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), client.closed())
            .await
            .expect("stalled client was not closed");
        assert!(peer.is_closed());
        assert!(!hub.is_registered(&client.id).await.unwrap());
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_hub_close_cascades() {
        let hub = Hub::new(5004, 16);
        let mut session = start(&hub, FakePeer::with_offer("v=0\r\n"));
        session.next().await.unwrap();

        hub.close();

        session.wait_closed().await;
        assert!(session.peer.is_closed());
        assert!(session.next().await.is_none());
    }

    #[tokio::test]
    async fn test_teardown_runs_once() {
        let hub = Hub::new(5004, 16);
        let mut session = start(&hub, FakePeer::with_offer("v=0\r\n"));
        session.next().await.unwrap();

        session.peer.emit_state(RTCPeerConnectionState::Closed);
        session.wait_closed().await;
        session.client.teardown().await;
        drop(session.to_client);
        tokio::time::timeout(Duration::from_secs(5), session.task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(session.peer.close_count(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_clients_identically() {
        let hub = Hub::new(5004, 16);
        let mut first = start(&hub, FakePeer::with_offer("v=0\r\no=first\r\n"));
        let mut second = start(&hub, FakePeer::with_offer("v=0\r\no=second\r\n"));
        first.next().await.unwrap();
        second.next().await.unwrap();

        let offer = session_description("offer", "v=0\r\no=shared\r\n");
        hub.broadcast(Message::offer(&offer).unwrap()).await.unwrap();

        let a = tokio::time::timeout(Duration::from_secs(5), first.from_client.next())
            .await
            .unwrap()
            .unwrap();
        let b = tokio::time::timeout(Duration::from_secs(5), second.from_client.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(Message::decode(&a).unwrap().event, Event::Offer);
    }
}
