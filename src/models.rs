use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::ChatError;

pub type ConversationId = i64;
pub type UserId = i64;
pub type MessageId = i64;
pub type AttachmentId = i64;

/// Longest preview shown in the conversation list.
pub const PREVIEW_CHARS: usize = 200;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Participant {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub is_hidden: bool,
    pub is_cleared: bool,
    pub last_read_message_id: Option<MessageId>,
    pub last_read_at: Option<DateTime<Utc>>,
}

impl Participant {
    pub fn new(conversation_id: ConversationId, user_id: UserId) -> Self {
        Self {
            conversation_id,
            user_id,
            is_hidden: false,
            is_cleared: false,
            last_read_message_id: None,
            last_read_at: None,
        }
    }

    /// Read cursor with the "nothing read yet" case folded to zero.
    pub fn read_cursor(&self) -> MessageId {
        self.last_read_message_id.unwrap_or(0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_deleted_for_all: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageStatus {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub is_deleted: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, sqlx::FromRow)]
pub struct Attachment {
    pub id: AttachmentId,
    pub message_id: MessageId,
    pub uploader_id: UserId,
    pub filename: String,
    pub stored_path: String,
    pub mimetype: Option<String>,
    pub size_bytes: Option<i64>,
    pub is_deleted_for_all: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttachmentStatus {
    pub attachment_id: AttachmentId,
    pub user_id: UserId,
    pub is_deleted: bool,
}

/// Visible to a viewer: not latched for everyone and not hidden by the
/// viewer's own status row. A missing status row means visible.
pub fn is_visible(deleted_for_all: bool, hidden_for_viewer: Option<bool>) -> bool {
    !deleted_for_all && !hidden_for_viewer.unwrap_or(false)
}

/// Scope token of a delete or clear operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Me,
    All,
}

impl FromStr for Scope {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "me" => Ok(Scope::Me),
            "all" => Ok(Scope::All),
            other => Err(ChatError::InvalidScope(other.to_string())),
        }
    }
}

/// Attachment ready to be persisted; the blob is already stored.
#[derive(Clone, Debug)]
pub struct NewAttachment {
    pub filename: String,
    pub stored_path: String,
    pub mimetype: Option<String>,
    pub size_bytes: Option<i64>,
}

#[derive(Clone, Debug)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub attachments: Vec<NewAttachment>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentView {
    pub id: AttachmentId,
    pub filename: String,
    pub mimetype: Option<String>,
    pub size_bytes: Option<i64>,
    pub is_deleted_for_all: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&Attachment> for AttachmentView {
    fn from(a: &Attachment) -> Self {
        Self {
            id: a.id,
            filename: a.filename.clone(),
            mimetype: a.mimetype.clone(),
            size_bytes: a.size_bytes,
            is_deleted_for_all: a.is_deleted_for_all,
            created_at: a.created_at,
        }
    }
}

/// A message as one particular viewer sees it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageView {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub attachments: Vec<AttachmentView>,
}

impl MessageView {
    pub fn new(message: &Message, attachments: Vec<AttachmentView>) -> Self {
        Self {
            id: message.id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            content: message.content.clone(),
            created_at: message.created_at,
            edited_at: message.edited_at,
            attachments,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct PageRequest {
    pub before_id: Option<MessageId>,
    pub limit: Option<i64>,
    pub search: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MessagePage {
    pub items: Vec<MessageView>,
    pub has_more: bool,
    pub next_before_id: Option<MessageId>,
}

impl MessagePage {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            has_more: false,
            next_before_id: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub peer_id: UserId,
    pub last_message_id: Option<MessageId>,
    pub last_message_preview: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread_count: i64,
}

pub fn preview(content: &str) -> Option<String> {
    if content.is_empty() {
        None
    } else {
        Some(content.chars().take(PREVIEW_CHARS).collect())
    }
}
