use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::info;

use super::messages::{Connection, DeliveryMessage};
use crate::models::UserId;

/// Owns the user -> connection map. Only this task touches it; everyone else
/// talks to it through `DeliveryBus`.
pub struct DeliveryRouter {
    pub receiver: mpsc::UnboundedReceiver<DeliveryMessage>,
    pub users: HashMap<UserId, Connection>,
}

impl DeliveryRouter {
    pub fn new() -> (Self, mpsc::UnboundedSender<DeliveryMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();

        let router = Self {
            receiver,
            users: HashMap::new(),
        };

        (router, sender)
    }

    pub async fn run(mut self) {
        info!("Delivery router started");

        while let Some(message) = self.receiver.recv().await {
            match message {
                DeliveryMessage::Register {
                    user_id,
                    connection,
                } => {
                    self.handle_register(user_id, connection);
                }
                DeliveryMessage::Unregister {
                    user_id,
                    connection_id,
                } => {
                    self.handle_unregister(user_id, connection_id);
                }
                DeliveryMessage::Publish {
                    kind,
                    payload,
                    recipients,
                } => {
                    self.handle_publish(kind, &payload, &recipients);
                }
                DeliveryMessage::GetOnlineUsers { respond_to } => {
                    let mut online: Vec<UserId> = self.users.keys().copied().collect();
                    online.sort_unstable();
                    let _ = respond_to.send(online);
                }
            }
        }

        info!("Delivery router stopped");
    }
}
