use chrono::Utc;
use std::{path::Path, sync::Arc};
use tracing::{debug, instrument, warn};

use crate::{
    actors::delivery_bus::DeliveryBus,
    blob::BlobStore,
    error::{ChatError, ChatResult},
    events::DeliveryEvent,
    models::{
        Attachment, AttachmentId, ConversationId, MessageId, MessageView, NewAttachment,
        NewMessage, UserId,
    },
    store::ChatStore,
};

/// A file as received from the client, before it reaches the blob store.
#[derive(Clone, Debug)]
pub struct Upload {
    pub filename: String,
    pub mimetype: Option<String>,
    pub bytes: Vec<u8>,
}

/// Sending, editing and file access for existing conversations.
#[derive(Clone)]
pub struct MessageService {
    store: Arc<dyn ChatStore>,
    blobs: Arc<dyn BlobStore>,
    bus: DeliveryBus,
    max_files_per_message: usize,
}

impl MessageService {
    pub fn new(
        store: Arc<dyn ChatStore>,
        blobs: Arc<dyn BlobStore>,
        bus: DeliveryBus,
        max_files_per_message: usize,
    ) -> Self {
        Self {
            store,
            blobs,
            bus,
            max_files_per_message,
        }
    }

    #[instrument(skip(self, content, uploads), fields(files = uploads.len()))]
    pub async fn send_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
        uploads: Vec<Upload>,
    ) -> ChatResult<MessageView> {
        let recipients = self.participant_ids(conversation_id).await?;
        if !recipients.contains(&sender_id) {
            return Err(ChatError::not_participant());
        }

        if uploads.len() > self.max_files_per_message {
            return Err(ChatError::BadRequest(format!(
                "at most {} files per message",
                self.max_files_per_message
            )));
        }
        let content = content.trim();
        if content.is_empty() && uploads.is_empty() {
            return Err(ChatError::BadRequest("message cannot be empty".to_string()));
        }

        let attachments = self.store_uploads(uploads).await?;
        let stored: Vec<String> = attachments.iter().map(|a| a.stored_path.clone()).collect();

        let inserted = self
            .store
            .insert_message(NewMessage {
                conversation_id,
                sender_id,
                content: content.to_string(),
                created_at: Utc::now(),
                attachments,
            })
            .await;
        let (message, attachments) = match inserted {
            Ok(row) => row,
            Err(e) => {
                self.discard_blobs(&stored).await;
                return Err(e);
            }
        };

        let view = MessageView::new(&message, attachments.iter().map(Into::into).collect());
        self.bus.publish(
            &DeliveryEvent::NewMessage {
                conversation_id,
                message: view.clone(),
            },
            &recipients,
        );

        debug!("Message {} sent", message.id);
        Ok(view)
    }

    /// Replaces the text of the editor's own message. Each connected
    /// participant receives the message as they currently see it.
    #[instrument(skip(self, content))]
    pub async fn edit_message(
        &self,
        message_id: MessageId,
        editor_id: UserId,
        content: &str,
    ) -> ChatResult<MessageView> {
        let message = match self.store.message(message_id).await? {
            Some(m) if !m.is_deleted_for_all => m,
            _ => return Err(ChatError::NotFound(format!("message {}", message_id))),
        };
        if message.sender_id != editor_id {
            return Err(ChatError::Forbidden(
                "only the sender can edit a message".to_string(),
            ));
        }

        let content = content.trim();
        if content.is_empty() && self.store.live_attachment_count(message_id).await? == 0 {
            return Err(ChatError::BadRequest("message cannot be empty".to_string()));
        }

        if self
            .store
            .edit_message(message_id, content, Utc::now())
            .await?
            .is_none()
        {
            return Err(ChatError::NotFound(format!("message {}", message_id)));
        }

        let mut editor_view = None;
        for recipient in self.participant_ids(message.conversation_id).await? {
            let Some(view) = self.store.visible_message(message_id, recipient).await? else {
                continue;
            };
            self.bus.publish(
                &DeliveryEvent::MessageEdited {
                    conversation_id: message.conversation_id,
                    message: view.clone(),
                },
                &[recipient],
            );
            if recipient == editor_id {
                editor_view = Some(view);
            }
        }

        // The editor may have hidden their own message; they still get it back.
        match editor_view {
            Some(view) => Ok(view),
            None => self
                .store
                .message(message_id)
                .await?
                .map(|m| MessageView::new(&m, Vec::new()))
                .ok_or_else(|| ChatError::NotFound(format!("message {}", message_id))),
        }
    }

    /// The attachment row, if the viewer is allowed to download it.
    #[instrument(skip(self))]
    pub async fn attachment_for_download(
        &self,
        attachment_id: AttachmentId,
        viewer_id: UserId,
    ) -> ChatResult<Attachment> {
        let not_found = || ChatError::NotFound(format!("attachment {}", attachment_id));

        let attachment = match self.store.attachment(attachment_id).await? {
            Some(a) if !a.is_deleted_for_all => a,
            _ => return Err(not_found()),
        };
        let message = self
            .store
            .message(attachment.message_id)
            .await?
            .ok_or_else(not_found)?;
        if self
            .store
            .participant(message.conversation_id, viewer_id)
            .await?
            .is_none()
        {
            return Err(ChatError::not_participant());
        }
        if self
            .store
            .attachment_hidden_for(attachment_id, viewer_id)
            .await?
        {
            return Err(not_found());
        }

        Ok(attachment)
    }

    /// Attachment row plus its bytes, under the same checks as
    /// `attachment_for_download`.
    pub async fn download(
        &self,
        attachment_id: AttachmentId,
        viewer_id: UserId,
    ) -> ChatResult<(Attachment, Vec<u8>)> {
        let attachment = self.attachment_for_download(attachment_id, viewer_id).await?;
        let bytes = self.blobs.read(&attachment.stored_path).await?;
        Ok((attachment, bytes))
    }

    async fn store_uploads(&self, uploads: Vec<Upload>) -> ChatResult<Vec<NewAttachment>> {
        let mut attachments = Vec::with_capacity(uploads.len());
        for upload in uploads {
            let stored_path = match self.blobs.store(&upload.filename, &upload.bytes).await {
                Ok(path) => path,
                Err(e) => {
                    let stored: Vec<String> =
                        attachments.iter().map(|a: &NewAttachment| a.stored_path.clone()).collect();
                    self.discard_blobs(&stored).await;
                    return Err(e);
                }
            };
            let filename = if upload.filename.is_empty() {
                Path::new(&stored_path)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            } else {
                upload.filename
            };
            attachments.push(NewAttachment {
                filename,
                stored_path,
                mimetype: upload.mimetype,
                size_bytes: Some(upload.bytes.len() as i64),
            });
        }
        Ok(attachments)
    }

    async fn discard_blobs(&self, references: &[String]) {
        for reference in references {
            if let Err(e) = self.blobs.delete(reference).await {
                warn!("Failed to discard orphaned blob {}: {}", reference, e);
            }
        }
    }

    async fn participant_ids(&self, conversation_id: ConversationId) -> ChatResult<Vec<UserId>> {
        Ok(self
            .store
            .participants(conversation_id)
            .await?
            .into_iter()
            .map(|p| p.user_id)
            .collect())
    }
}
