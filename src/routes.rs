//! HTTP adapter over the services. The caller's identity is trusted from
//! the `x-user-id` header.

use axum::{
    Json,
    body::Bytes,
    extract::{FromRequestParts, Path, Query, State, WebSocketUpgrade},
    http::{HeaderValue, header, request::Parts},
    response::IntoResponse,
};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;
use serde_json::json;
use std::{collections::HashMap, sync::Arc};

use crate::{
    error::{ChatError, ChatResult},
    models::{
        AttachmentId, ConversationId, ConversationSummary, MessageId, MessagePage, MessageView,
        PageRequest, UserId,
    },
    socket::dialog_socket,
    state::AppState,
};

pub const USER_ID_HEADER: &str = "x-user-id";

/// RFC 5987 `attr-char`: everything else in `filename*` is percent-encoded.
const ATTR_CHAR_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

/// Authenticated caller.
pub struct CurrentUser(pub UserId);

impl<S: Send + Sync> FromRequestParts<S> for CurrentUser {
    type Rejection = ChatError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
            .map(CurrentUser)
            .ok_or_else(|| ChatError::BadRequest(format!("missing or invalid {} header", USER_ID_HEADER)))
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, UserId>>,
) -> impl IntoResponse {
    let user_id = match params.get("user_id") {
        Some(user_id) => *user_id,
        None => return "Missing user_id".into_response(),
    };

    ws.on_upgrade(move |socket| dialog_socket(socket, user_id, state))
}

pub async fn online_users(State(state): State<Arc<AppState>>) -> Json<Vec<UserId>> {
    Json(state.bus.online_users().await)
}

// ------------------------------------------------------------
// CONVERSATIONS
// ------------------------------------------------------------

#[derive(Deserialize)]
pub struct StartDialog {
    pub peer_id: UserId,
}

pub async fn start_dialog(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Json(body): Json<StartDialog>,
) -> ChatResult<impl IntoResponse> {
    let conversation_id = state
        .registry
        .get_or_create_dialog(user_id, body.peer_id)
        .await?;
    Ok(Json(json!({ "conversation_id": conversation_id })))
}

pub async fn list_conversations(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
) -> ChatResult<Json<Vec<ConversationSummary>>> {
    Ok(Json(state.registry.list_conversations(user_id).await?))
}

#[derive(Deserialize, Default)]
pub struct MarkRead {
    pub up_to_message_id: Option<MessageId>,
}

/// The body is optional; an empty one marks everything read.
pub async fn mark_read(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Path(conversation_id): Path<ConversationId>,
    body: Bytes,
) -> ChatResult<impl IntoResponse> {
    let request: MarkRead = if body.is_empty() {
        MarkRead::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ChatError::BadRequest(e.to_string()))?
    };

    let moved = state
        .unread
        .mark_read(conversation_id, user_id, request.up_to_message_id)
        .await?;
    let unread_count = state.unread.unread_count(conversation_id, user_id).await?;
    Ok(Json(json!({
        "status": "ok",
        "moved": moved,
        "unread_count": unread_count,
    })))
}

#[derive(Deserialize)]
pub struct HideParams {
    #[serde(default = "default_hide")]
    pub hide: bool,
}

fn default_hide() -> bool {
    true
}

pub async fn hide_conversation(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Path(conversation_id): Path<ConversationId>,
    Query(params): Query<HideParams>,
) -> ChatResult<impl IntoResponse> {
    let hidden = state
        .registry
        .hide(conversation_id, user_id, params.hide)
        .await?;
    Ok(Json(json!({ "hidden": hidden })))
}

#[derive(Deserialize)]
pub struct ScopeParams {
    pub scope: String,
}

pub async fn clear_conversation(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Path(conversation_id): Path<ConversationId>,
    Query(params): Query<ScopeParams>,
) -> ChatResult<impl IntoResponse> {
    state
        .registry
        .clear(conversation_id, user_id, &params.scope)
        .await?;
    Ok(Json(json!({ "status": "ok" })))
}

// ------------------------------------------------------------
// MESSAGES
// ------------------------------------------------------------

#[derive(Deserialize)]
pub struct PageParams {
    pub conversation_id: ConversationId,
    pub before_id: Option<MessageId>,
    pub limit: Option<i64>,
    pub search: Option<String>,
}

pub async fn message_page(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Query(params): Query<PageParams>,
) -> ChatResult<Json<MessagePage>> {
    let request = PageRequest {
        before_id: params.before_id,
        limit: params.limit,
        search: params.search,
    };
    Ok(Json(
        state
            .paginator
            .fetch_page(params.conversation_id, user_id, request)
            .await?,
    ))
}

#[derive(Deserialize)]
pub struct SendMessage {
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub content: String,
}

pub async fn send_message(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Json(body): Json<SendMessage>,
) -> ChatResult<Json<MessageView>> {
    let view = state
        .messages
        .send_message(body.conversation_id, user_id, &body.content, Vec::new())
        .await?;
    Ok(Json(view))
}

#[derive(Deserialize)]
pub struct EditMessage {
    pub content: String,
}

pub async fn edit_message(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Path(message_id): Path<MessageId>,
    Json(body): Json<EditMessage>,
) -> ChatResult<Json<MessageView>> {
    let view = state
        .messages
        .edit_message(message_id, user_id, &body.content)
        .await?;
    Ok(Json(view))
}

pub async fn delete_message(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Path(message_id): Path<MessageId>,
    Query(params): Query<ScopeParams>,
) -> ChatResult<impl IntoResponse> {
    state
        .ledger
        .delete_message(message_id, user_id, &params.scope)
        .await?;
    Ok(Json(json!({ "status": "ok" })))
}

pub async fn download_attachment(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Path(attachment_id): Path<AttachmentId>,
) -> ChatResult<impl IntoResponse> {
    let (attachment, bytes) = state.messages.download(attachment_id, user_id).await?;

    let content_type = attachment
        .mimetype
        .as_deref()
        .and_then(|m| HeaderValue::from_str(m).ok())
        .unwrap_or(HeaderValue::from_static("application/octet-stream"));
    let disposition = content_disposition(&attachment.filename);

    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    ))
}

/// `attachment` disposition carrying the name twice: a plain ASCII
/// `filename` for old clients and the exact UTF-8 name in `filename*`.
fn content_disposition(filename: &str) -> HeaderValue {
    let fallback: String = filename
        .chars()
        .map(|c| match c {
            ' '..='~' if c != '"' && c != '\\' => c,
            _ => '_',
        })
        .collect();
    let value = format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        utf8_percent_encode(filename, ATTR_CHAR_SET)
    );
    HeaderValue::from_str(&value).unwrap_or(HeaderValue::from_static("attachment"))
}

pub async fn delete_attachment(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Path(attachment_id): Path<AttachmentId>,
    Query(params): Query<ScopeParams>,
) -> ChatResult<impl IntoResponse> {
    state
        .ledger
        .delete_attachment(attachment_id, user_id, &params.scope)
        .await?;
    Ok(Json(json!({ "status": "ok" })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_names_pass_through() {
        assert_eq!(
            content_disposition("report-1.pdf"),
            "attachment; filename=\"report-1.pdf\"; filename*=UTF-8''report-1.pdf"
        );
    }

    #[test]
    fn non_ascii_names_keep_an_encoded_copy() {
        let value = content_disposition("звіт \"Q1\".pdf");
        assert_eq!(
            value,
            "attachment; filename=\"____ _Q1_.pdf\"; \
             filename*=UTF-8''%D0%B7%D0%B2%D1%96%D1%82%20%22Q1%22.pdf"
        );
    }
}
