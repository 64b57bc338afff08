use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::{
    actors::delivery_bus::DeliveryBus,
    blob::BlobStore,
    error::{ChatError, ChatResult},
    events::DeliveryEvent,
    models::{Attachment, AttachmentId, Message, MessageId, Scope, UserId},
    store::ChatStore,
};

/// Per-user and global deletion of messages and attachments.
///
/// A for-self delete only writes the actor's status row. A for-all delete
/// sets the irreversible latch on the row itself, after which the entity is
/// reported as not found to everyone.
#[derive(Clone)]
pub struct VisibilityLedger {
    store: Arc<dyn ChatStore>,
    blobs: Arc<dyn BlobStore>,
    bus: DeliveryBus,
}

impl VisibilityLedger {
    pub fn new(store: Arc<dyn ChatStore>, blobs: Arc<dyn BlobStore>, bus: DeliveryBus) -> Self {
        Self { store, blobs, bus }
    }

    #[instrument(skip(self))]
    pub async fn delete_message(
        &self,
        message_id: MessageId,
        actor: UserId,
        scope: &str,
    ) -> ChatResult<()> {
        let message = self.live_message(message_id, actor).await?;
        match scope.parse::<Scope>()? {
            Scope::Me => self.hide_message(&message, actor).await,
            Scope::All => self.retract_message(&message, actor).await,
        }
    }

    /// Idempotent; cascades to the message's attachments.
    #[instrument(skip(self))]
    pub async fn delete_message_for_self(
        &self,
        message_id: MessageId,
        user_id: UserId,
    ) -> ChatResult<()> {
        let message = self.live_message(message_id, user_id).await?;
        self.hide_message(&message, user_id).await
    }

    #[instrument(skip(self))]
    pub async fn delete_message_for_all(
        &self,
        message_id: MessageId,
        actor: UserId,
    ) -> ChatResult<()> {
        let message = self.live_message(message_id, actor).await?;
        self.retract_message(&message, actor).await
    }

    #[instrument(skip(self))]
    pub async fn delete_attachment(
        &self,
        attachment_id: AttachmentId,
        actor: UserId,
        scope: &str,
    ) -> ChatResult<()> {
        let attachment = self.live_attachment(attachment_id, actor).await?;
        match scope.parse::<Scope>()? {
            Scope::Me => self.store.hide_attachment(attachment.id, actor).await,
            Scope::All => self.retract_attachment(&attachment, actor).await,
        }
    }

    #[instrument(skip(self))]
    pub async fn delete_attachment_for_self(
        &self,
        attachment_id: AttachmentId,
        user_id: UserId,
    ) -> ChatResult<()> {
        let attachment = self.live_attachment(attachment_id, user_id).await?;
        self.store.hide_attachment(attachment.id, user_id).await
    }

    #[instrument(skip(self))]
    pub async fn delete_attachment_for_all(
        &self,
        attachment_id: AttachmentId,
        actor: UserId,
    ) -> ChatResult<()> {
        let attachment = self.live_attachment(attachment_id, actor).await?;
        self.retract_attachment(&attachment, actor).await
    }

    async fn hide_message(&self, message: &Message, user_id: UserId) -> ChatResult<()> {
        self.store.hide_message(message.id, user_id).await
    }

    async fn retract_message(&self, message: &Message, actor: UserId) -> ChatResult<()> {
        if message.sender_id != actor {
            return Err(ChatError::Forbidden(
                "only the sender can delete a message for everyone".to_string(),
            ));
        }

        // Two concurrent retractions: only the one that flipped the latch
        // reports success and notifies.
        if !self.store.delete_message_for_all(message.id).await? {
            return Err(message_not_found(message.id));
        }

        let recipients: Vec<UserId> = self
            .store
            .participants(message.conversation_id)
            .await?
            .into_iter()
            .map(|p| p.user_id)
            .collect();
        self.bus.publish(
            &DeliveryEvent::MessageDeleted {
                conversation_id: message.conversation_id,
                message_id: message.id,
            },
            &recipients,
        );

        debug!("Message {} deleted for everyone", message.id);
        Ok(())
    }

    async fn retract_attachment(&self, attachment: &Attachment, actor: UserId) -> ChatResult<()> {
        if attachment.uploader_id != actor {
            return Err(ChatError::Forbidden(
                "only the uploader can delete a file for everyone".to_string(),
            ));
        }

        if !self.store.delete_attachment_for_all(attachment.id).await? {
            return Err(attachment_not_found(attachment.id));
        }

        // The row is already latched, so a leftover blob is unreachable.
        if let Err(e) = self.blobs.delete(&attachment.stored_path).await {
            warn!("Failed to remove blob of attachment {}: {}", attachment.id, e);
        }

        debug!("Attachment {} deleted for everyone", attachment.id);
        Ok(())
    }

    /// The message, provided it still exists for everyone and `actor` is a
    /// participant of its conversation.
    async fn live_message(&self, message_id: MessageId, actor: UserId) -> ChatResult<Message> {
        let message = match self.store.message(message_id).await? {
            Some(m) if !m.is_deleted_for_all => m,
            _ => return Err(message_not_found(message_id)),
        };
        if self
            .store
            .participant(message.conversation_id, actor)
            .await?
            .is_none()
        {
            return Err(ChatError::not_participant());
        }
        Ok(message)
    }

    async fn live_attachment(
        &self,
        attachment_id: AttachmentId,
        actor: UserId,
    ) -> ChatResult<Attachment> {
        let attachment = match self.store.attachment(attachment_id).await? {
            Some(a) if !a.is_deleted_for_all => a,
            _ => return Err(attachment_not_found(attachment_id)),
        };
        let Some(message) = self.store.message(attachment.message_id).await? else {
            return Err(attachment_not_found(attachment_id));
        };
        if self
            .store
            .participant(message.conversation_id, actor)
            .await?
            .is_none()
        {
            return Err(ChatError::not_participant());
        }
        Ok(attachment)
    }
}

fn message_not_found(message_id: MessageId) -> ChatError {
    ChatError::NotFound(format!("message {}", message_id))
}

fn attachment_not_found(attachment_id: AttachmentId) -> ChatError {
    ChatError::NotFound(format!("attachment {}", attachment_id))
}
