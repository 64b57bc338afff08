use crate::actors::delivery_bus::{ConnectionId, DeliveryBus};
use crate::metrics::Metrics;
use crate::models::UserId;
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// One live websocket of one user. Outbound events arrive from the delivery
/// bus as ready-to-send JSON; inbound frames carry no commands and are only
/// logged.
pub struct UserSession {
    user_id: UserId,
    connection_id: ConnectionId,
    socket: WebSocket,
    bus: DeliveryBus,
    session_receiver: mpsc::Receiver<String>,
    send_timeout: Duration,
}

impl UserSession {
    pub fn new(
        user_id: UserId,
        socket: WebSocket,
        bus: DeliveryBus,
        buffer_size: usize,
        send_timeout: Duration,
    ) -> Self {
        let (session_sender, session_receiver) = mpsc::channel(buffer_size);
        let connection_id = bus.register(user_id, session_sender);
        debug!("User {} registered as {:?}", user_id, connection_id);

        Self {
            user_id,
            connection_id,
            socket,
            bus,
            session_receiver,
            send_timeout,
        }
    }

    pub async fn run(self) {
        let (mut ws_sender, mut ws_receiver) = self.socket.split();
        let user_id = self.user_id;
        let send_timeout = self.send_timeout;
        let mut session_receiver = self.session_receiver;

        Metrics::websocket_connected();

        // Bus -> websocket. Ends when the bus drops our sender (eviction or
        // replacement) or when a write fails or stalls.
        let mut send_task = tokio::spawn(async move {
            while let Some(payload) = session_receiver.recv().await {
                match tokio::time::timeout(send_timeout, ws_sender.send(Message::Text(payload.into())))
                    .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!("WebSocket send failed for user {}: {}", user_id, e);
                        break;
                    }
                    Err(_) => {
                        warn!(
                            "WebSocket send to user {} exceeded {:?}, closing",
                            user_id, send_timeout
                        );
                        break;
                    }
                }
            }
        });

        let mut recv_task = tokio::spawn(async move {
            while let Some(frame) = ws_receiver.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        debug!("WS received from {}: {}", user_id, text.as_str());
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("WebSocket receive failed for user {}: {}", user_id, e);
                        break;
                    }
                }
            }
        });

        tokio::select! {
            _ = &mut send_task => {
                debug!("Send task completed for user {}", user_id);
                recv_task.abort();
            }
            _ = &mut recv_task => {
                debug!("Receive task completed for user {}", user_id);
                send_task.abort();
            }
        }

        self.bus.unregister_connection(user_id, self.connection_id);
        Metrics::websocket_disconnected();

        debug!("User session ended for {}", user_id);
    }
}
