use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use tracing::{info, instrument};

use super::{ChatStore, dialog_key, migrations::run_database_migrations};
use crate::{
    error::ChatResult,
    models::{
        Attachment, AttachmentId, AttachmentView, ConversationId, Message, MessageId, MessageView,
        NewMessage, Participant, UserId,
    },
};

const MESSAGE_COLUMNS: &str =
    "m.id, m.conversation_id, m.sender_id, m.content, m.created_at, m.edited_at, m.is_deleted_for_all";

const ATTACHMENT_COLUMNS: &str = "a.id, a.message_id, a.uploader_id, a.filename, a.stored_path, \
     a.mimetype, a.size_bytes, a.is_deleted_for_all, a.created_at";

const PARTICIPANT_COLUMNS: &str =
    "conversation_id, user_id, is_hidden, is_cleared, last_read_message_id, last_read_at";

// The viewer is always bound as $2 wherever these predicates appear.
const MESSAGE_VISIBLE: &str = "m.is_deleted_for_all = FALSE AND NOT EXISTS (\
     SELECT 1 FROM message_status s \
     WHERE s.message_id = m.id AND s.user_id = $2 AND s.is_deleted)";

const ATTACHMENT_VISIBLE: &str = "a.is_deleted_for_all = FALSE AND NOT EXISTS (\
     SELECT 1 FROM attachment_status st \
     WHERE st.attachment_id = a.id AND st.user_id = $2 AND st.is_deleted)";

/// ILIKE pattern matching `term` anywhere, with wildcards in the term escaped.
fn contains_pattern(term: &str) -> String {
    let escaped = term
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> ChatResult<Self> {
        let pool = PgPool::connect(database_url).await?;
        run_database_migrations(&pool).await?;
        info!("Connected to Postgres store");
        Ok(Self::new(pool))
    }

    async fn views(&self, messages: Vec<Message>, viewer: UserId) -> ChatResult<Vec<MessageView>> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<MessageId> = messages.iter().map(|m| m.id).collect();
        let sql = format!(
            "SELECT {} FROM attachments a WHERE a.message_id = ANY($1) AND {} ORDER BY a.id",
            ATTACHMENT_COLUMNS, ATTACHMENT_VISIBLE
        );
        let attachments = sqlx::query_as::<_, Attachment>(&sql)
            .bind(ids)
            .bind(viewer)
            .fetch_all(&self.pool)
            .await?;

        let mut by_message: HashMap<MessageId, Vec<AttachmentView>> = HashMap::new();
        for a in &attachments {
            by_message
                .entry(a.message_id)
                .or_default()
                .push(AttachmentView::from(a));
        }

        Ok(messages
            .iter()
            .map(|m| MessageView::new(m, by_message.remove(&m.id).unwrap_or_default()))
            .collect())
    }
}

#[async_trait]
impl ChatStore for PgStore {
    async fn find_dialog(&self, a: UserId, b: UserId) -> ChatResult<Option<ConversationId>> {
        let (low, high) = dialog_key(a, b);
        let id = sqlx::query_scalar::<_, i64>(
            "SELECT conversation_id FROM dialog_pairs WHERE low_user_id = $1 AND high_user_id = $2",
        )
        .bind(low)
        .bind(high)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn create_dialog(
        &self,
        a: UserId,
        b: UserId,
        at: DateTime<Utc>,
    ) -> ChatResult<ConversationId> {
        let (low, high) = dialog_key(a, b);
        let mut tx = self.pool.begin().await?;

        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO conversations (created_at) VALUES ($1) RETURNING id",
        )
        .bind(at)
        .fetch_one(&mut *tx)
        .await?;

        // A concurrent creator of the same pair fails here with 23505.
        sqlx::query(
            "INSERT INTO dialog_pairs (low_user_id, high_user_id, conversation_id) VALUES ($1, $2, $3)",
        )
        .bind(low)
        .bind(high)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO conversation_participants (conversation_id, user_id) VALUES ($1, $2), ($1, $3)",
        )
        .bind(id)
        .bind(a)
        .bind(b)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!("created conversation {}", id);
        Ok(id)
    }

    async fn unhide(&self, conversation_id: ConversationId, user_ids: &[UserId]) -> ChatResult<()> {
        sqlx::query(
            "UPDATE conversation_participants SET is_hidden = FALSE \
             WHERE conversation_id = $1 AND user_id = ANY($2) AND is_hidden",
        )
        .bind(conversation_id)
        .bind(user_ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> ChatResult<Option<Participant>> {
        let sql = format!(
            "SELECT {} FROM conversation_participants WHERE conversation_id = $1 AND user_id = $2",
            PARTICIPANT_COLUMNS
        );
        let row = sqlx::query_as::<_, Participant>(&sql)
            .bind(conversation_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn participants(&self, conversation_id: ConversationId) -> ChatResult<Vec<Participant>> {
        let sql = format!(
            "SELECT {} FROM conversation_participants WHERE conversation_id = $1 ORDER BY user_id",
            PARTICIPANT_COLUMNS
        );
        let rows = sqlx::query_as::<_, Participant>(&sql)
            .bind(conversation_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn memberships(&self, user_id: UserId) -> ChatResult<Vec<Participant>> {
        let sql = format!(
            "SELECT {} FROM conversation_participants WHERE user_id = $1 ORDER BY conversation_id",
            PARTICIPANT_COLUMNS
        );
        let rows = sqlx::query_as::<_, Participant>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn set_hidden(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        hidden: bool,
    ) -> ChatResult<bool> {
        let result = sqlx::query(
            "UPDATE conversation_participants SET is_hidden = $3 \
             WHERE conversation_id = $1 AND user_id = $2",
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(hidden)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, new), fields(conversation_id = new.conversation_id, sender_id = new.sender_id))]
    async fn insert_message(&self, new: NewMessage) -> ChatResult<(Message, Vec<Attachment>)> {
        let mut tx = self.pool.begin().await?;

        let message = sqlx::query_as::<_, Message>(
            "INSERT INTO messages (conversation_id, sender_id, content, created_at) \
             VALUES ($1, $2, $3, $4) \
             RETURNING id, conversation_id, sender_id, content, created_at, edited_at, is_deleted_for_all",
        )
        .bind(new.conversation_id)
        .bind(new.sender_id)
        .bind(&new.content)
        .bind(new.created_at)
        .fetch_one(&mut *tx)
        .await?;

        let mut attachments = Vec::with_capacity(new.attachments.len());
        for na in &new.attachments {
            let attachment = sqlx::query_as::<_, Attachment>(
                "INSERT INTO attachments \
                 (message_id, uploader_id, filename, stored_path, mimetype, size_bytes, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7) \
                 RETURNING id, message_id, uploader_id, filename, stored_path, mimetype, \
                 size_bytes, is_deleted_for_all, created_at",
            )
            .bind(message.id)
            .bind(new.sender_id)
            .bind(&na.filename)
            .bind(&na.stored_path)
            .bind(&na.mimetype)
            .bind(na.size_bytes)
            .bind(new.created_at)
            .fetch_one(&mut *tx)
            .await?;
            attachments.push(attachment);
        }

        tx.commit().await?;
        Ok((message, attachments))
    }

    async fn message(&self, message_id: MessageId) -> ChatResult<Option<Message>> {
        let sql = format!("SELECT {} FROM messages m WHERE m.id = $1", MESSAGE_COLUMNS);
        let row = sqlx::query_as::<_, Message>(&sql)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn attachment(&self, attachment_id: AttachmentId) -> ChatResult<Option<Attachment>> {
        let sql = format!(
            "SELECT {} FROM attachments a WHERE a.id = $1",
            ATTACHMENT_COLUMNS
        );
        let row = sqlx::query_as::<_, Attachment>(&sql)
            .bind(attachment_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn attachment_hidden_for(
        &self,
        attachment_id: AttachmentId,
        user_id: UserId,
    ) -> ChatResult<bool> {
        let hidden = sqlx::query_scalar::<_, bool>(
            "SELECT is_deleted FROM attachment_status WHERE attachment_id = $1 AND user_id = $2",
        )
        .bind(attachment_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(hidden.unwrap_or(false))
    }

    async fn live_attachment_count(&self, message_id: MessageId) -> ChatResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM attachments WHERE message_id = $1 AND is_deleted_for_all = FALSE",
        )
        .bind(message_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn edit_message(
        &self,
        message_id: MessageId,
        content: &str,
        at: DateTime<Utc>,
    ) -> ChatResult<Option<Message>> {
        let row = sqlx::query_as::<_, Message>(
            "UPDATE messages SET content = $2, edited_at = $3 \
             WHERE id = $1 AND is_deleted_for_all = FALSE \
             RETURNING id, conversation_id, sender_id, content, created_at, edited_at, is_deleted_for_all",
        )
        .bind(message_id)
        .bind(content)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    #[instrument(skip(self))]
    async fn hide_message(&self, message_id: MessageId, user_id: UserId) -> ChatResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO message_status (message_id, user_id, is_deleted) VALUES ($1, $2, TRUE) \
             ON CONFLICT (message_id, user_id) DO UPDATE SET is_deleted = TRUE",
        )
        .bind(message_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO attachment_status (attachment_id, user_id, is_deleted) \
             SELECT id, $2, TRUE FROM attachments WHERE message_id = $1 \
             ON CONFLICT (attachment_id, user_id) DO UPDATE SET is_deleted = TRUE",
        )
        .bind(message_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_message_for_all(&self, message_id: MessageId) -> ChatResult<bool> {
        let mut tx = self.pool.begin().await?;

        let latched = sqlx::query(
            "UPDATE messages SET is_deleted_for_all = TRUE \
             WHERE id = $1 AND is_deleted_for_all = FALSE",
        )
        .bind(message_id)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        sqlx::query(
            "UPDATE attachments SET is_deleted_for_all = TRUE \
             WHERE message_id = $1 AND is_deleted_for_all = FALSE",
        )
        .bind(message_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(latched)
    }

    async fn hide_attachment(
        &self,
        attachment_id: AttachmentId,
        user_id: UserId,
    ) -> ChatResult<()> {
        sqlx::query(
            "INSERT INTO attachment_status (attachment_id, user_id, is_deleted) VALUES ($1, $2, TRUE) \
             ON CONFLICT (attachment_id, user_id) DO UPDATE SET is_deleted = TRUE",
        )
        .bind(attachment_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_attachment_for_all(&self, attachment_id: AttachmentId) -> ChatResult<bool> {
        let result = sqlx::query(
            "UPDATE attachments SET is_deleted_for_all = TRUE \
             WHERE id = $1 AND is_deleted_for_all = FALSE",
        )
        .bind(attachment_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn clear_for_user(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> ChatResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO message_status (message_id, user_id, is_deleted) \
             SELECT id, $2, TRUE FROM messages WHERE conversation_id = $1 \
             ON CONFLICT (message_id, user_id) DO UPDATE SET is_deleted = TRUE",
        )
        .bind(conversation_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO attachment_status (attachment_id, user_id, is_deleted) \
             SELECT a.id, $2, TRUE FROM attachments a \
             JOIN messages m ON m.id = a.message_id WHERE m.conversation_id = $1 \
             ON CONFLICT (attachment_id, user_id) DO UPDATE SET is_deleted = TRUE",
        )
        .bind(conversation_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE conversation_participants SET is_cleared = TRUE \
             WHERE conversation_id = $1 AND user_id = $2",
        )
        .bind(conversation_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn clear_for_all(&self, conversation_id: ConversationId) -> ChatResult<Vec<MessageId>> {
        let mut tx = self.pool.begin().await?;

        let latched = sqlx::query_scalar::<_, i64>(
            "UPDATE messages SET is_deleted_for_all = TRUE \
             WHERE conversation_id = $1 AND is_deleted_for_all = FALSE \
             RETURNING id",
        )
        .bind(conversation_id)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE attachments SET is_deleted_for_all = TRUE \
             WHERE is_deleted_for_all = FALSE \
             AND message_id IN (SELECT id FROM messages WHERE conversation_id = $1)",
        )
        .bind(conversation_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(latched)
    }

    async fn visible_message(
        &self,
        message_id: MessageId,
        viewer: UserId,
    ) -> ChatResult<Option<MessageView>> {
        let sql = format!(
            "SELECT {} FROM messages m WHERE m.id = $1 AND {}",
            MESSAGE_COLUMNS, MESSAGE_VISIBLE
        );
        let row = sqlx::query_as::<_, Message>(&sql)
            .bind(message_id)
            .bind(viewer)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(m) => Ok(self.views(vec![m], viewer).await?.pop()),
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn visible_messages_before(
        &self,
        conversation_id: ConversationId,
        viewer: UserId,
        before_id: Option<MessageId>,
        search: Option<&str>,
        fetch: i64,
    ) -> ChatResult<Vec<MessageView>> {
        let sql = format!(
            "SELECT {} FROM messages m \
             WHERE m.conversation_id = $1 AND {} \
             AND ($3::BIGINT IS NULL OR m.id < $3) \
             AND ($4::TEXT IS NULL OR m.content ILIKE $4) \
             ORDER BY m.id DESC LIMIT $5",
            MESSAGE_COLUMNS, MESSAGE_VISIBLE
        );
        let rows = sqlx::query_as::<_, Message>(&sql)
            .bind(conversation_id)
            .bind(viewer)
            .bind(before_id)
            .bind(search.map(contains_pattern))
            .bind(fetch)
            .fetch_all(&self.pool)
            .await?;

        self.views(rows, viewer).await
    }

    async fn latest_visible_message(
        &self,
        conversation_id: ConversationId,
        viewer: UserId,
    ) -> ChatResult<Option<Message>> {
        let sql = format!(
            "SELECT {} FROM messages m WHERE m.conversation_id = $1 AND {} ORDER BY m.id DESC LIMIT 1",
            MESSAGE_COLUMNS, MESSAGE_VISIBLE
        );
        let row = sqlx::query_as::<_, Message>(&sql)
            .bind(conversation_id)
            .bind(viewer)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn latest_message_id(
        &self,
        conversation_id: ConversationId,
    ) -> ChatResult<Option<MessageId>> {
        let id = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT MAX(id) FROM messages WHERE conversation_id = $1 AND is_deleted_for_all = FALSE",
        )
        .bind(conversation_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn count_unread(
        &self,
        conversation_id: ConversationId,
        viewer: UserId,
        after: MessageId,
    ) -> ChatResult<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM messages m \
             WHERE m.conversation_id = $1 AND m.sender_id <> $2 AND m.id > $3 AND {}",
            MESSAGE_VISIBLE
        );
        let count = sqlx::query_scalar::<_, i64>(&sql)
            .bind(conversation_id)
            .bind(viewer)
            .bind(after)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    #[instrument(skip(self))]
    async fn advance_read_cursor(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        upto: MessageId,
        at: DateTime<Utc>,
    ) -> ChatResult<bool> {
        let result = sqlx::query(
            "UPDATE conversation_participants SET last_read_message_id = $3, last_read_at = $4 \
             WHERE conversation_id = $1 AND user_id = $2 \
             AND (last_read_message_id IS NULL OR last_read_message_id < $3)",
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(upto)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
