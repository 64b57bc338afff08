pub mod handlers;
pub mod messages;
pub mod router;

pub use messages::{Connection, ConnectionId, DeliveryMessage};
pub use router::DeliveryRouter;

use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};

use crate::{events::DeliveryEvent, models::UserId};

/// Cloneable handle to the delivery router task.
///
/// Every call is a non-blocking send to the router; `publish` in particular
/// never waits on a peer, so a mutating request is not held up by delivery.
#[derive(Clone, Debug)]
pub struct DeliveryBus {
    sender: mpsc::UnboundedSender<DeliveryMessage>,
}

impl DeliveryBus {
    /// Starts the router on the current runtime.
    pub fn spawn() -> Self {
        let (router, sender) = DeliveryRouter::new();
        tokio::spawn(router.run());
        Self { sender }
    }

    /// Registers the outbound channel of a freshly accepted connection,
    /// replacing any earlier connection of the same user.
    pub fn register(&self, user_id: UserId, sender: mpsc::Sender<String>) -> ConnectionId {
        let id = ConnectionId::new();
        let connection = Connection { id, sender };
        if self
            .sender
            .send(DeliveryMessage::Register {
                user_id,
                connection,
            })
            .is_err()
        {
            error!("Failed to communicate with delivery router");
        }
        id
    }

    pub fn unregister(&self, user_id: UserId) {
        self.send(DeliveryMessage::Unregister {
            user_id,
            connection_id: None,
        });
    }

    /// Removes the user's connection only if it is still `connection_id`.
    pub fn unregister_connection(&self, user_id: UserId, connection_id: ConnectionId) {
        self.send(DeliveryMessage::Unregister {
            user_id,
            connection_id: Some(connection_id),
        });
    }

    /// Fire-and-forget fanout of `event` to whichever recipients are online.
    pub fn publish(&self, event: &DeliveryEvent, recipients: &[UserId]) {
        if recipients.is_empty() {
            return;
        }

        let payload = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize {} event: {}", event.kind(), e);
                return;
            }
        };

        self.send(DeliveryMessage::Publish {
            kind: event.kind(),
            payload,
            recipients: recipients.to_vec(),
        });
    }

    /// Users with a live connection, sorted by id.
    pub async fn online_users(&self) -> Vec<UserId> {
        let (respond_to, response) = oneshot::channel();
        self.send(DeliveryMessage::GetOnlineUsers { respond_to });
        response.await.unwrap_or_default()
    }

    fn send(&self, message: DeliveryMessage) {
        if self.sender.send(message).is_err() {
            warn!("Delivery router is gone, dropping request");
        }
    }
}
