use tokio::sync::mpsc;
use tracing::debug;

use super::messages::{Connection, ConnectionId};
use super::router::DeliveryRouter;
use crate::{
    metrics::{DeliveryOutcome, Metrics},
    models::UserId,
};

impl DeliveryRouter {
    pub fn handle_register(&mut self, user_id: UserId, connection: Connection) {
        // Newest connection wins. Dropping the old sender closes its channel,
        // which ends the superseded session.
        if let Some(previous) = self.users.insert(user_id, connection) {
            debug!(
                "User {} reconnected, evicting connection {:?}",
                user_id, previous.id
            );
        } else {
            debug!("User {} registered successfully", user_id);
        }
    }

    pub fn handle_unregister(&mut self, user_id: UserId, connection_id: Option<ConnectionId>) {
        let matches = match (self.users.get(&user_id), connection_id) {
            (Some(current), Some(id)) => current.id == id,
            (Some(_), None) => true,
            (None, _) => false,
        };

        if matches {
            self.users.remove(&user_id);
            debug!("User {} unregistered", user_id);
        }
    }

    pub fn handle_publish(&mut self, kind: &str, payload: &str, recipients: &[UserId]) {
        for user_id in recipients {
            let outcome = match self.users.get(user_id) {
                None => DeliveryOutcome::Offline,
                // Never wait on a peer: a full queue means a slow reader and
                // a closed one means the socket is gone. Either way the
                // connection is dropped and the client resyncs on reconnect.
                Some(connection) => match connection.sender.try_send(payload.to_string()) {
                    Ok(()) => DeliveryOutcome::Delivered,
                    Err(mpsc::error::TrySendError::Full(_)) => DeliveryOutcome::EvictedFull,
                    Err(mpsc::error::TrySendError::Closed(_)) => DeliveryOutcome::EvictedClosed,
                },
            };

            match outcome {
                DeliveryOutcome::Delivered => {
                    debug!("Event {} sent successfully to {}", kind, user_id);
                }
                DeliveryOutcome::Offline => {
                    debug!("User {} not found or offline", user_id);
                }
                DeliveryOutcome::EvictedFull | DeliveryOutcome::EvictedClosed => {
                    debug!(
                        "Dropping event {} for {} and evicting connection ({:?})",
                        kind, user_id, outcome
                    );
                    self.users.remove(user_id);
                }
            }

            Metrics::delivery(kind, outcome);
        }
    }
}
