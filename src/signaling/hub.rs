use std::collections::HashMap;

use tokio::sync::{
    broadcast,
    mpsc::{self, error::TrySendError},
    oneshot,
};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::{
    error::{Error, SignalingErrorKind},
    signaling::message::Message,
};

pub type ClientId = String;

/// Hub keeps the signaling clients of one stream. Membership lives inside the hub event loop and
/// every operation is a command to that loop, so commands take effect in the order they are
/// submitted.
///
/// A client is registered with the sending half of its outbound queue. Delivery never waits: when
/// the queue of a client is full the client is evicted and its queue is closed, which ends its
/// outbound loop. The token returned by [`Hub::register`] is cancelled as soon as the client leaves
/// the hub, for whatever reason.
#[derive(Debug, Clone)]
pub struct Hub {
    pub id: u16,
    command_sender: mpsc::Sender<HubCommand>,
    closed_sender: broadcast::Sender<bool>,
}

#[derive(Debug)]
enum HubCommand {
    Register(ClientId, mpsc::Sender<Message>, DropGuard),
    Unregister(ClientId),
    Broadcast(Message),
    SendTo(ClientId, Message),
    IsRegistered(ClientId, oneshot::Sender<bool>),
    Len(oneshot::Sender<usize>),
}

impl Hub {
    pub fn new(id: u16, capacity: usize) -> Self {
        let (command_sender, command_receiver) = mpsc::channel(capacity.max(1));
        let (closed_sender, closed_receiver) = broadcast::channel(1);

        tokio::spawn(async move {
            Self::hub_event_loop(id, command_receiver, closed_receiver).await;
        });

        tracing::debug!("Hub {} is created", id);

        Self {
            id,
            command_sender,
            closed_sender,
        }
    }

    /// Adds a client. Only messages submitted after this call reach it.
    ///
    /// The returned token is cancelled when the client is unregistered, evicted, or the hub closes.
    pub async fn register(
        &self,
        client_id: ClientId,
        sender: mpsc::Sender<Message>,
    ) -> Result<CancellationToken, Error> {
        let membership = CancellationToken::new();
        self.submit(HubCommand::Register(
            client_id,
            sender,
            membership.clone().drop_guard(),
        ))
        .await?;
        Ok(membership)
    }

    /// Removes a client and closes its queue. Unknown clients are ignored.
    pub async fn unregister(&self, client_id: &ClientId) -> Result<(), Error> {
        self.submit(HubCommand::Unregister(client_id.clone())).await
    }

    pub async fn broadcast(&self, message: Message) -> Result<(), Error> {
        self.submit(HubCommand::Broadcast(message)).await
    }

    /// Delivers to one client if it is still registered when the command is processed.
    pub async fn send_to(&self, client_id: &ClientId, message: Message) -> Result<(), Error> {
        self.submit(HubCommand::SendTo(client_id.clone(), message))
            .await
    }

    pub async fn is_registered(&self, client_id: &ClientId) -> Result<bool, Error> {
        let (tx, rx) = oneshot::channel();
        self.submit(HubCommand::IsRegistered(client_id.clone(), tx))
            .await?;
        rx.await.map_err(|_| closed_error(self.id))
    }

    pub async fn len(&self) -> Result<usize, Error> {
        let (tx, rx) = oneshot::channel();
        self.submit(HubCommand::Len(tx)).await?;
        rx.await.map_err(|_| closed_error(self.id))
    }

    /// Stops the event loop. Every member queue is closed and later commands fail.
    pub fn close(&self) {
        let _ = self.closed_sender.send(true);
    }

    async fn submit(&self, command: HubCommand) -> Result<(), Error> {
        self.command_sender
            .send(command)
            .await
            .map_err(|_| closed_error(self.id))
    }

    async fn hub_event_loop(
        id: u16,
        mut command_receiver: mpsc::Receiver<HubCommand>,
        mut closed_receiver: broadcast::Receiver<bool>,
    ) {
        tracing::debug!("Hub {} event loop started", id);
        let mut clients: HashMap<ClientId, (mpsc::Sender<Message>, DropGuard)> = HashMap::new();

        loop {
            tokio::select! {
                biased;
                _ = closed_receiver.recv() => {
                    break;
                }
                command = command_receiver.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    match command {
                        HubCommand::Register(client_id, sender, membership) => {
                            tracing::debug!("Hub {} registered client {}", id, client_id);
                            clients.insert(client_id, (sender, membership));
                        }
                        HubCommand::Unregister(client_id) => {
                            if clients.remove(&client_id).is_some() {
                                tracing::debug!("Hub {} unregistered client {}", id, client_id);
                            }
                        }
                        HubCommand::Broadcast(message) => {
                            clients.retain(|client_id, (sender, _)| {
                                deliver(id, client_id, sender, message.clone())
                            });
                        }
                        HubCommand::SendTo(client_id, message) => {
                            if let Some((sender, _)) = clients.get(&client_id) {
                                if !deliver(id, &client_id, sender, message) {
                                    clients.remove(&client_id);
                                }
                            }
                        }
                        HubCommand::IsRegistered(client_id, reply) => {
                            let _ = reply.send(clients.contains_key(&client_id));
                        }
                        HubCommand::Len(reply) => {
                            let _ = reply.send(clients.len());
                        }
                    }
                }
            }
        }

        command_receiver.close();
        tracing::debug!(
            "Hub {} event loop finished, {} clients disconnected",
            id,
            clients.len()
        );
    }
}

/// Returns false when the client has to leave the hub.
fn deliver(hub_id: u16, client_id: &str, sender: &mpsc::Sender<Message>, message: Message) -> bool {
    match sender.try_send(message) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            tracing::warn!(
                "Hub {} evicts client {}: outbound queue is full",
                hub_id,
                client_id
            );
            false
        }
        Err(TrySendError::Closed(_)) => {
            tracing::debug!("Hub {} drops client {}: queue is closed", hub_id, client_id);
            false
        }
    }
}

fn closed_error(id: u16) -> Error {
    Error::new_signaling(
        format!("hub {} is closed", id),
        SignalingErrorKind::HubClosedError,
    )
}
