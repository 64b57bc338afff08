use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::models::UserId;

/// Identifies one live connection so a superseded session cannot evict the
/// connection that replaced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Outbound half of a connection: serialized events go here and the
/// session's writer task pushes them onto the socket.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub sender: mpsc::Sender<String>,
}

#[derive(Debug)]
pub enum DeliveryMessage {
    Register {
        user_id: UserId,
        connection: Connection,
    },
    Unregister {
        user_id: UserId,
        connection_id: Option<ConnectionId>,
    },
    Publish {
        kind: &'static str,
        payload: String,
        recipients: Vec<UserId>,
    },
    GetOnlineUsers {
        respond_to: oneshot::Sender<Vec<UserId>>,
    },
}
