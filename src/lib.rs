use axum::{
    Router,
    http::{self, Method},
    middleware,
    routing::{any, get, patch, post},
};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::{
    metrics::{metrics_handler, metrics_middleware},
    routes::USER_ID_HEADER,
    state::AppState,
};

pub mod actors;
pub mod blob;
pub mod config;
pub mod error;
pub mod events;
pub mod ledger;
pub mod messages;
pub mod metrics;
pub mod models;
pub mod paginator;
pub mod registry;
pub mod routes;
pub mod socket;
pub mod state;
pub mod store;
pub mod unread;

pub fn duet_route(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers([
            http::header::ACCEPT,
            http::header::CONTENT_TYPE,
            http::header::AUTHORIZATION,
            http::HeaderName::from_static(USER_ID_HEADER),
        ])
        .allow_origin(AllowOrigin::any());

    Router::new()
        .route("/ws", any(routes::ws_handler))
        .route("/metrics", get(metrics_handler))
        .route("/online", get(routes::online_users))
        .route("/conversations", get(routes::list_conversations))
        .route("/conversations/start", post(routes::start_dialog))
        .route("/conversations/{id}/read", post(routes::mark_read))
        .route("/conversations/{id}/hide", post(routes::hide_conversation))
        .route("/conversations/{id}/clear", post(routes::clear_conversation))
        .route("/messages/page", get(routes::message_page))
        .route("/messages/send", post(routes::send_message))
        .route(
            "/messages/{id}",
            patch(routes::edit_message).delete(routes::delete_message),
        )
        .route(
            "/messages/attachments/{id}",
            get(routes::download_attachment).delete(routes::delete_attachment),
        )
        .layer(middleware::from_fn(metrics_middleware))
        .layer(cors)
        .with_state(state)
}
