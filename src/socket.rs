use crate::{models::UserId, state::AppState};
use axum::extract::ws::WebSocket;
use std::sync::Arc;

pub async fn dialog_socket(socket: WebSocket, user_id: UserId, state: Arc<AppState>) {
    state
        .connection_manager
        .handle_connection(socket, user_id)
        .await;
}
