use sqlx::PgPool;
use tracing::info;

use crate::error::ChatResult;

pub struct DatabaseMigrations {
    pool: PgPool,
}

impl DatabaseMigrations {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> ChatResult<()> {
        info!("Starting database migrations...");

        self.create_conversation_tables().await?;
        self.create_message_tables().await?;
        self.create_attachment_tables().await?;

        info!("Database migrations completed successfully!");
        Ok(())
    }

    async fn execute(&self, table: &str, statements: &[&str]) -> ChatResult<()> {
        info!("Creating table '{}'...", table);
        for statement in statements {
            sqlx::query(*statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn create_conversation_tables(&self) -> ChatResult<()> {
        self.execute(
            "conversations",
            &[r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id BIGSERIAL PRIMARY KEY,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#],
        )
        .await?;

        // One row per unordered pair; low_user_id < high_user_id.
        self.execute(
            "dialog_pairs",
            &[r#"
            CREATE TABLE IF NOT EXISTS dialog_pairs (
                low_user_id BIGINT NOT NULL,
                high_user_id BIGINT NOT NULL,
                conversation_id BIGINT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                PRIMARY KEY (low_user_id, high_user_id)
            )
            "#],
        )
        .await?;

        self.execute(
            "conversation_participants",
            &[
                r#"
                CREATE TABLE IF NOT EXISTS conversation_participants (
                    conversation_id BIGINT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                    user_id BIGINT NOT NULL,
                    is_hidden BOOLEAN NOT NULL DEFAULT FALSE,
                    is_cleared BOOLEAN NOT NULL DEFAULT FALSE,
                    last_read_message_id BIGINT,
                    last_read_at TIMESTAMPTZ,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                    PRIMARY KEY (conversation_id, user_id)
                )
                "#,
                "CREATE INDEX IF NOT EXISTS ix_participants_user_id ON conversation_participants (user_id)",
            ],
        )
        .await
    }

    async fn create_message_tables(&self) -> ChatResult<()> {
        self.execute(
            "messages",
            &[
                r#"
                CREATE TABLE IF NOT EXISTS messages (
                    id BIGSERIAL PRIMARY KEY,
                    conversation_id BIGINT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                    sender_id BIGINT NOT NULL,
                    content TEXT NOT NULL DEFAULT '',
                    is_deleted_for_all BOOLEAN NOT NULL DEFAULT FALSE,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                    edited_at TIMESTAMPTZ
                )
                "#,
                "CREATE INDEX IF NOT EXISTS ix_messages_conversation_id ON messages (conversation_id, id)",
            ],
        )
        .await?;

        self.execute(
            "message_status",
            &[r#"
            CREATE TABLE IF NOT EXISTS message_status (
                message_id BIGINT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                user_id BIGINT NOT NULL,
                is_deleted BOOLEAN NOT NULL DEFAULT FALSE,
                PRIMARY KEY (message_id, user_id)
            )
            "#],
        )
        .await
    }

    async fn create_attachment_tables(&self) -> ChatResult<()> {
        self.execute(
            "attachments",
            &[
                r#"
                CREATE TABLE IF NOT EXISTS attachments (
                    id BIGSERIAL PRIMARY KEY,
                    message_id BIGINT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                    uploader_id BIGINT NOT NULL,
                    filename TEXT NOT NULL,
                    stored_path TEXT NOT NULL,
                    mimetype TEXT,
                    size_bytes BIGINT,
                    is_deleted_for_all BOOLEAN NOT NULL DEFAULT FALSE,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
                )
                "#,
                "CREATE INDEX IF NOT EXISTS ix_attachments_message_id ON attachments (message_id)",
            ],
        )
        .await?;

        self.execute(
            "attachment_status",
            &[r#"
            CREATE TABLE IF NOT EXISTS attachment_status (
                attachment_id BIGINT NOT NULL REFERENCES attachments(id) ON DELETE CASCADE,
                user_id BIGINT NOT NULL,
                is_deleted BOOLEAN NOT NULL DEFAULT FALSE,
                PRIMARY KEY (attachment_id, user_id)
            )
            "#],
        )
        .await
    }
}

pub async fn run_database_migrations(pool: &PgPool) -> ChatResult<()> {
    DatabaseMigrations::new(pool.clone()).run_migrations().await
}
