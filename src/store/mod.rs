//! Storage collaborator.
//!
//! Every method is one atomic unit of work: a backend either applies all of
//! its writes or none of them, and the write is durable when the future
//! resolves. Services publish live events only after that point.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    error::ChatResult,
    models::{
        Attachment, AttachmentId, ConversationId, Message, MessageId, MessageView, NewMessage,
        Participant, UserId,
    },
};

pub mod memory;
pub mod migrations;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Unordered user pair, normalised so `(a, b)` and `(b, a)` share a key.
pub fn dialog_key(a: UserId, b: UserId) -> (UserId, UserId) {
    if a <= b { (a, b) } else { (b, a) }
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    // Conversations and participants

    /// Conversation shared by both users, if any.
    async fn find_dialog(&self, a: UserId, b: UserId) -> ChatResult<Option<ConversationId>>;

    /// Creates the conversation and both participant rows. Fails with
    /// `ChatError::Conflict` when the pair already has a conversation.
    async fn create_dialog(
        &self,
        a: UserId,
        b: UserId,
        at: DateTime<Utc>,
    ) -> ChatResult<ConversationId>;

    /// Clears `is_hidden` for the given participants.
    async fn unhide(&self, conversation_id: ConversationId, user_ids: &[UserId]) -> ChatResult<()>;

    async fn participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> ChatResult<Option<Participant>>;

    async fn participants(&self, conversation_id: ConversationId) -> ChatResult<Vec<Participant>>;

    /// Every participant row belonging to the user.
    async fn memberships(&self, user_id: UserId) -> ChatResult<Vec<Participant>>;

    /// Returns false when the user is not a participant.
    async fn set_hidden(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        hidden: bool,
    ) -> ChatResult<bool>;

    // Messages and attachments

    async fn insert_message(&self, new: NewMessage) -> ChatResult<(Message, Vec<Attachment>)>;

    async fn message(&self, message_id: MessageId) -> ChatResult<Option<Message>>;

    async fn attachment(&self, attachment_id: AttachmentId) -> ChatResult<Option<Attachment>>;

    /// Whether the user hid the attachment for themselves.
    async fn attachment_hidden_for(
        &self,
        attachment_id: AttachmentId,
        user_id: UserId,
    ) -> ChatResult<bool>;

    /// Attachments of the message not deleted for everyone, regardless of
    /// any per-user hiding.
    async fn live_attachment_count(&self, message_id: MessageId) -> ChatResult<i64>;

    /// Replaces content and stamps `edited_at`. `None` when the message is
    /// absent or deleted for everyone.
    async fn edit_message(
        &self,
        message_id: MessageId,
        content: &str,
        at: DateTime<Utc>,
    ) -> ChatResult<Option<Message>>;

    // Visibility

    /// Upserts the viewer's status row and cascades to the message's
    /// attachments.
    async fn hide_message(&self, message_id: MessageId, user_id: UserId) -> ChatResult<()>;

    /// Latches the message and its attachments. Returns true only for the
    /// call that performed the transition.
    async fn delete_message_for_all(&self, message_id: MessageId) -> ChatResult<bool>;

    async fn hide_attachment(&self, attachment_id: AttachmentId, user_id: UserId)
    -> ChatResult<()>;

    async fn delete_attachment_for_all(&self, attachment_id: AttachmentId) -> ChatResult<bool>;

    /// Hides every message and attachment of the conversation for the user
    /// and marks their participant row as cleared.
    async fn clear_for_user(&self, conversation_id: ConversationId, user_id: UserId)
    -> ChatResult<()>;

    /// Latches every message and attachment of the conversation; returns the
    /// ids of messages that were not already deleted.
    async fn clear_for_all(&self, conversation_id: ConversationId) -> ChatResult<Vec<MessageId>>;

    // Reads through the visibility predicate

    async fn visible_message(
        &self,
        message_id: MessageId,
        viewer: UserId,
    ) -> ChatResult<Option<MessageView>>;

    /// Up to `fetch` visible messages with id below `before_id`, newest first.
    async fn visible_messages_before(
        &self,
        conversation_id: ConversationId,
        viewer: UserId,
        before_id: Option<MessageId>,
        search: Option<&str>,
        fetch: i64,
    ) -> ChatResult<Vec<MessageView>>;

    async fn latest_visible_message(
        &self,
        conversation_id: ConversationId,
        viewer: UserId,
    ) -> ChatResult<Option<Message>>;

    /// Id of the newest message not deleted for everyone.
    async fn latest_message_id(&self, conversation_id: ConversationId)
    -> ChatResult<Option<MessageId>>;

    /// Visible messages from the other participant with id above `after`.
    async fn count_unread(
        &self,
        conversation_id: ConversationId,
        viewer: UserId,
        after: MessageId,
    ) -> ChatResult<i64>;

    /// Moves the read cursor to `upto` only if it is strictly greater than
    /// the current one. Returns whether the cursor moved.
    async fn advance_read_cursor(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        upto: MessageId,
        at: DateTime<Utc>,
    ) -> ChatResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialog_key_is_unordered() {
        assert_eq!(dialog_key(7, 3), (3, 7));
        assert_eq!(dialog_key(3, 7), (3, 7));
    }
}
