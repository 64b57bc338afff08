use crate::actors::{delivery_bus::DeliveryBus, user_session::UserSession};
use crate::models::UserId;
use axum::extract::ws::WebSocket;
use std::time::Duration;
use tracing::info;

pub struct ConnectionManager {
    bus: DeliveryBus,
    buffer_size: usize,
    send_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(bus: DeliveryBus, buffer_size: usize, send_timeout: Duration) -> Self {
        Self {
            bus,
            buffer_size,
            send_timeout,
        }
    }

    pub async fn handle_connection(&self, socket: WebSocket, user_id: UserId) {
        info!("New connection for user: {}", user_id);

        let session = UserSession::new(
            user_id,
            socket,
            self.bus.clone(),
            self.buffer_size,
            self.send_timeout,
        );
        session.run().await;

        info!("Connection closed for user: {}", user_id);
    }
}
