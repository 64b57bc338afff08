use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Mutex, MutexGuard},
};
use tracing::debug;

use super::{ChatStore, dialog_key};
use crate::{
    error::{ChatError, ChatResult},
    models::{
        Attachment, AttachmentId, AttachmentStatus, AttachmentView, Conversation,
        ConversationId, Message, MessageId, MessageStatus, MessageView, NewMessage, Participant,
        UserId, is_visible,
    },
};

#[derive(Default)]
struct Tables {
    next_conversation_id: ConversationId,
    next_message_id: MessageId,
    next_attachment_id: AttachmentId,
    conversations: BTreeMap<ConversationId, Conversation>,
    dialogs: HashMap<(UserId, UserId), ConversationId>,
    participants: BTreeMap<(ConversationId, UserId), Participant>,
    messages: BTreeMap<MessageId, Message>,
    message_status: HashMap<(MessageId, UserId), MessageStatus>,
    attachments: BTreeMap<AttachmentId, Attachment>,
    attachment_status: HashMap<(AttachmentId, UserId), AttachmentStatus>,
}

impl Tables {
    fn message_visible(&self, message: &Message, viewer: UserId) -> bool {
        is_visible(
            message.is_deleted_for_all,
            self.message_status
                .get(&(message.id, viewer))
                .map(|s| s.is_deleted),
        )
    }

    fn attachment_visible(&self, attachment: &Attachment, viewer: UserId) -> bool {
        is_visible(
            attachment.is_deleted_for_all,
            self.attachment_status
                .get(&(attachment.id, viewer))
                .map(|s| s.is_deleted),
        )
    }

    fn attachment_ids_of(&self, message_id: MessageId) -> Vec<AttachmentId> {
        self.attachments
            .values()
            .filter(|a| a.message_id == message_id)
            .map(|a| a.id)
            .collect()
    }

    fn view(&self, message: &Message, viewer: UserId) -> MessageView {
        let attachments = self
            .attachments
            .values()
            .filter(|a| a.message_id == message.id && self.attachment_visible(a, viewer))
            .map(AttachmentView::from)
            .collect();
        MessageView::new(message, attachments)
    }

    fn conversations_of(&self, user_id: UserId) -> BTreeSet<ConversationId> {
        self.participants
            .keys()
            .filter(|(_, uid)| *uid == user_id)
            .map(|(cid, _)| *cid)
            .collect()
    }

    fn latch_message(&mut self, message_id: MessageId) -> bool {
        let transitioned = match self.messages.get_mut(&message_id) {
            Some(m) if !m.is_deleted_for_all => {
                m.is_deleted_for_all = true;
                true
            }
            _ => false,
        };
        for a in self.attachments.values_mut() {
            if a.message_id == message_id {
                a.is_deleted_for_all = true;
            }
        }
        transitioned
    }

    fn hide_message_for(&mut self, message_id: MessageId, user_id: UserId) {
        self.message_status
            .entry((message_id, user_id))
            .or_insert(MessageStatus {
                message_id,
                user_id,
                is_deleted: false,
            })
            .is_deleted = true;
        for attachment_id in self.attachment_ids_of(message_id) {
            self.hide_attachment_for(attachment_id, user_id);
        }
    }

    fn hide_attachment_for(&mut self, attachment_id: AttachmentId, user_id: UserId) {
        self.attachment_status
            .entry((attachment_id, user_id))
            .or_insert(AttachmentStatus {
                attachment_id,
                user_id,
                is_deleted: false,
            })
            .is_deleted = true;
    }
}

/// Store kept entirely in process memory. One mutex guards every table, so
/// each trait method is trivially atomic.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> ChatResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| ChatError::Storage("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn find_dialog(&self, a: UserId, b: UserId) -> ChatResult<Option<ConversationId>> {
        let t = self.tables()?;
        let mine = t.conversations_of(a);
        let theirs = t.conversations_of(b);
        Ok(mine.intersection(&theirs).next().copied())
    }

    async fn create_dialog(
        &self,
        a: UserId,
        b: UserId,
        at: DateTime<Utc>,
    ) -> ChatResult<ConversationId> {
        let mut t = self.tables()?;
        let key = dialog_key(a, b);
        if let Some(existing) = t.dialogs.get(&key) {
            return Err(ChatError::Conflict(format!(
                "dialog {:?} already exists as conversation {}",
                key, existing
            )));
        }

        t.next_conversation_id += 1;
        let id = t.next_conversation_id;
        t.conversations.insert(id, Conversation { id, created_at: at });
        t.dialogs.insert(key, id);
        t.participants.insert((id, a), Participant::new(id, a));
        t.participants.insert((id, b), Participant::new(id, b));

        debug!("Created conversation {} for users {} and {}", id, a, b);
        Ok(id)
    }

    async fn unhide(&self, conversation_id: ConversationId, user_ids: &[UserId]) -> ChatResult<()> {
        let mut t = self.tables()?;
        for uid in user_ids {
            if let Some(p) = t.participants.get_mut(&(conversation_id, *uid)) {
                p.is_hidden = false;
            }
        }
        Ok(())
    }

    async fn participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> ChatResult<Option<Participant>> {
        Ok(self
            .tables()?
            .participants
            .get(&(conversation_id, user_id))
            .cloned())
    }

    async fn participants(&self, conversation_id: ConversationId) -> ChatResult<Vec<Participant>> {
        Ok(self
            .tables()?
            .participants
            .range((conversation_id, UserId::MIN)..=(conversation_id, UserId::MAX))
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn memberships(&self, user_id: UserId) -> ChatResult<Vec<Participant>> {
        Ok(self
            .tables()?
            .participants
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn set_hidden(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        hidden: bool,
    ) -> ChatResult<bool> {
        let mut t = self.tables()?;
        match t.participants.get_mut(&(conversation_id, user_id)) {
            Some(p) => {
                p.is_hidden = hidden;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_message(&self, new: NewMessage) -> ChatResult<(Message, Vec<Attachment>)> {
        let mut t = self.tables()?;
        if !t.conversations.contains_key(&new.conversation_id) {
            return Err(ChatError::NotFound(format!(
                "conversation {}",
                new.conversation_id
            )));
        }

        t.next_message_id += 1;
        let message = Message {
            id: t.next_message_id,
            conversation_id: new.conversation_id,
            sender_id: new.sender_id,
            content: new.content,
            created_at: new.created_at,
            edited_at: None,
            is_deleted_for_all: false,
        };
        t.messages.insert(message.id, message.clone());

        let mut attachments = Vec::with_capacity(new.attachments.len());
        for na in new.attachments {
            t.next_attachment_id += 1;
            let attachment = Attachment {
                id: t.next_attachment_id,
                message_id: message.id,
                uploader_id: new.sender_id,
                filename: na.filename,
                stored_path: na.stored_path,
                mimetype: na.mimetype,
                size_bytes: na.size_bytes,
                is_deleted_for_all: false,
                created_at: new.created_at,
            };
            t.attachments.insert(attachment.id, attachment.clone());
            attachments.push(attachment);
        }

        Ok((message, attachments))
    }

    async fn message(&self, message_id: MessageId) -> ChatResult<Option<Message>> {
        Ok(self.tables()?.messages.get(&message_id).cloned())
    }

    async fn attachment(&self, attachment_id: AttachmentId) -> ChatResult<Option<Attachment>> {
        Ok(self.tables()?.attachments.get(&attachment_id).cloned())
    }

    async fn attachment_hidden_for(
        &self,
        attachment_id: AttachmentId,
        user_id: UserId,
    ) -> ChatResult<bool> {
        Ok(self
            .tables()?
            .attachment_status
            .get(&(attachment_id, user_id))
            .is_some_and(|s| s.is_deleted))
    }

    async fn live_attachment_count(&self, message_id: MessageId) -> ChatResult<i64> {
        Ok(self
            .tables()?
            .attachments
            .values()
            .filter(|a| a.message_id == message_id && !a.is_deleted_for_all)
            .count() as i64)
    }

    async fn edit_message(
        &self,
        message_id: MessageId,
        content: &str,
        at: DateTime<Utc>,
    ) -> ChatResult<Option<Message>> {
        let mut t = self.tables()?;
        match t.messages.get_mut(&message_id) {
            Some(m) if !m.is_deleted_for_all => {
                m.content = content.to_string();
                m.edited_at = Some(at);
                Ok(Some(m.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn hide_message(&self, message_id: MessageId, user_id: UserId) -> ChatResult<()> {
        self.tables()?.hide_message_for(message_id, user_id);
        Ok(())
    }

    async fn delete_message_for_all(&self, message_id: MessageId) -> ChatResult<bool> {
        Ok(self.tables()?.latch_message(message_id))
    }

    async fn hide_attachment(
        &self,
        attachment_id: AttachmentId,
        user_id: UserId,
    ) -> ChatResult<()> {
        self.tables()?.hide_attachment_for(attachment_id, user_id);
        Ok(())
    }

    async fn delete_attachment_for_all(&self, attachment_id: AttachmentId) -> ChatResult<bool> {
        let mut t = self.tables()?;
        match t.attachments.get_mut(&attachment_id) {
            Some(a) if !a.is_deleted_for_all => {
                a.is_deleted_for_all = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn clear_for_user(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> ChatResult<()> {
        let mut t = self.tables()?;
        let ids: Vec<MessageId> = t
            .messages
            .values()
            .filter(|m| m.conversation_id == conversation_id)
            .map(|m| m.id)
            .collect();
        for id in ids {
            t.hide_message_for(id, user_id);
        }
        if let Some(p) = t.participants.get_mut(&(conversation_id, user_id)) {
            p.is_cleared = true;
        }
        Ok(())
    }

    async fn clear_for_all(&self, conversation_id: ConversationId) -> ChatResult<Vec<MessageId>> {
        let mut t = self.tables()?;
        let ids: Vec<MessageId> = t
            .messages
            .values()
            .filter(|m| m.conversation_id == conversation_id)
            .map(|m| m.id)
            .collect();
        Ok(ids.into_iter().filter(|id| t.latch_message(*id)).collect())
    }

    async fn visible_message(
        &self,
        message_id: MessageId,
        viewer: UserId,
    ) -> ChatResult<Option<MessageView>> {
        let t = self.tables()?;
        Ok(t
            .messages
            .get(&message_id)
            .filter(|m| t.message_visible(m, viewer))
            .map(|m| t.view(m, viewer)))
    }

    async fn visible_messages_before(
        &self,
        conversation_id: ConversationId,
        viewer: UserId,
        before_id: Option<MessageId>,
        search: Option<&str>,
        fetch: i64,
    ) -> ChatResult<Vec<MessageView>> {
        let t = self.tables()?;
        let upper = before_id.unwrap_or(MessageId::MAX);
        let needle = search.map(str::to_lowercase);
        let fetch = usize::try_from(fetch).unwrap_or(0);

        Ok(t.messages
            .range(..upper)
            .rev()
            .map(|(_, m)| m)
            .filter(|m| m.conversation_id == conversation_id && t.message_visible(m, viewer))
            .filter(|m| match &needle {
                Some(n) => m.content.to_lowercase().contains(n.as_str()),
                None => true,
            })
            .take(fetch)
            .map(|m| t.view(m, viewer))
            .collect())
    }

    async fn latest_visible_message(
        &self,
        conversation_id: ConversationId,
        viewer: UserId,
    ) -> ChatResult<Option<Message>> {
        let t = self.tables()?;
        Ok(t.messages
            .values()
            .rev()
            .find(|m| m.conversation_id == conversation_id && t.message_visible(m, viewer))
            .cloned())
    }

    async fn latest_message_id(
        &self,
        conversation_id: ConversationId,
    ) -> ChatResult<Option<MessageId>> {
        let t = self.tables()?;
        Ok(t.messages
            .values()
            .rev()
            .find(|m| m.conversation_id == conversation_id && !m.is_deleted_for_all)
            .map(|m| m.id))
    }

    async fn count_unread(
        &self,
        conversation_id: ConversationId,
        viewer: UserId,
        after: MessageId,
    ) -> ChatResult<i64> {
        let t = self.tables()?;
        let count = t
            .messages
            .range(after.saturating_add(1)..)
            .map(|(_, m)| m)
            .filter(|m| {
                m.conversation_id == conversation_id
                    && m.sender_id != viewer
                    && t.message_visible(m, viewer)
            })
            .count();
        Ok(count as i64)
    }

    async fn advance_read_cursor(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        upto: MessageId,
        at: DateTime<Utc>,
    ) -> ChatResult<bool> {
        let mut t = self.tables()?;
        match t.participants.get_mut(&(conversation_id, user_id)) {
            Some(p) if p.last_read_message_id.is_none_or(|current| upto > current) => {
                p.last_read_message_id = Some(upto);
                p.last_read_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
