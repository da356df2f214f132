//! Chat database operations
//!
//! SQLite backing of [`ConversationStore`]. Messages are only ever inserted;
//! conversations are only touched to bump `updated_at`.

use super::feed::FeedHub;
use super::models::{now_millis, Conversation, ConversationMode, Message};
use super::traits::ConversationStore;
use crate::error::ChatError;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

const CONVERSATION_COLUMNS: &str =
    "id, participant_a, participant_b, subject_ref, mode, created_at, updated_at";
const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, body, created_at";

/// Attach `context` to a database error, keeping its transient/permanent class
fn store_err(context: &'static str) -> impl FnOnce(sqlx::Error) -> ChatError {
    move |e| match ChatError::from(e) {
        ChatError::StoreUnavailable(msg) => {
            ChatError::StoreUnavailable(format!("{}: {}", context, msg))
        }
        ChatError::Internal(err) => ChatError::Internal(err.context(context)),
        other => other,
    }
}

/// Database connection pool for chat operations
pub struct ChatDb {
    pool: SqlitePool,
    feed: Option<FeedHub>,
}

impl ChatDb {
    /// Initialize database connection pool
    ///
    /// # Arguments
    /// * `db_path` - Path to the SQLite database file
    ///
    /// # Returns
    /// * `Ok(ChatDb)` if successful
    /// * `Err(ChatError)` if connection failed
    pub async fn new(db_path: &str) -> Result<Self, ChatError> {
        // Ensure parent directory exists
        if let Some(parent) = PathBuf::from(db_path).parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ChatError::Internal(anyhow::anyhow!("Failed to create db directory: {}", e))
            })?;
        }

        let connection_string = if db_path.starts_with("sqlite:") {
            db_path.to_string()
        } else {
            format!("sqlite:{}", db_path)
        };

        let options = SqliteConnectOptions::from_str(&connection_string)
            .map_err(|e| ChatError::InvalidInput(format!("Invalid database path: {}", e)))?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(store_err("Failed to connect to database"))?;

        info!("Connected to SQLite database at: {}", db_path);

        let db = Self { pool, feed: None };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Publish every newly stored message to `feed`
    pub fn with_feed(mut self, feed: FeedHub) -> Self {
        self.feed = Some(feed);
        self
    }

    /// Run database migrations
    async fn run_migrations(&self) -> Result<(), ChatError> {
        info!("Running database migrations...");

        let migration_sql = include_str!("../../migrations/001_create_conversations.sql");

        // Strip comments and normalize whitespace
        let mut cleaned_sql = String::new();
        for line in migration_sql.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with("--") {
                continue;
            }
            let without_comments = match trimmed.find("--") {
                Some(pos) => &trimmed[..pos],
                None => trimmed,
            };
            cleaned_sql.push_str(without_comments.trim());
            cleaned_sql.push(' ');
        }

        let statements = cleaned_sql
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty());

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    ChatError::Internal(anyhow::anyhow!(
                        "Migration failed: {} - Statement: {}",
                        e,
                        statement.chars().take(100).collect::<String>()
                    ))
                })?;
        }

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get a conversation by ID
    pub async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, ChatError> {
        let query = format!("SELECT {} FROM conversations WHERE id = ?", CONVERSATION_COLUMNS);
        sqlx::query_as::<_, Conversation>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err("Failed to fetch conversation"))
    }

    /// Conversations `participant` takes part in, most recently updated first
    pub async fn list_conversations_for(
        &self,
        participant: &str,
    ) -> Result<Vec<Conversation>, ChatError> {
        let query = format!(
            "SELECT {} FROM conversations WHERE participant_a = ? OR participant_b = ? \
             ORDER BY updated_at DESC",
            CONVERSATION_COLUMNS
        );
        sqlx::query_as::<_, Conversation>(&query)
            .bind(participant)
            .bind(participant)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err("Failed to fetch conversations"))
    }

    /// Create a bridged conversation; visitors are never deduplicated
    pub async fn create_bridged_conversation(
        &self,
        operator: &str,
        visitor_label: &str,
    ) -> Result<Conversation, ChatError> {
        let conversation = Conversation::bridged(
            Uuid::new_v4().to_string(),
            operator.to_string(),
            visitor_label.to_string(),
        );
        self.insert_conversation(&conversation, false).await?;

        debug!(conversation_id = %conversation.id, "Created bridged conversation");
        Ok(conversation)
    }

    async fn insert_conversation(
        &self,
        conversation: &Conversation,
        ignore_duplicate: bool,
    ) -> Result<bool, ChatError> {
        let verb = if ignore_duplicate {
            "INSERT OR IGNORE"
        } else {
            "INSERT"
        };
        let query = format!(
            "{} INTO conversations ({}) VALUES (?, ?, ?, ?, ?, ?, ?)",
            verb, CONVERSATION_COLUMNS
        );
        let result = sqlx::query(&query)
            .bind(&conversation.id)
            .bind(&conversation.participant_a)
            .bind(&conversation.participant_b)
            .bind(&conversation.subject_ref)
            .bind(conversation.mode.as_str())
            .bind(conversation.created_at)
            .bind(conversation.updated_at)
            .execute(&self.pool)
            .await
            .map_err(store_err("Failed to create conversation"))?;

        Ok(result.rows_affected() == 1)
    }

    /// Get a single message by ID
    pub async fn get_message(&self, id: &str) -> Result<Option<Message>, ChatError> {
        let query = format!("SELECT {} FROM messages WHERE id = ?", MESSAGE_COLUMNS);
        sqlx::query_as::<_, Message>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err("Failed to fetch message"))
    }

    /// Insert a message whose id was assigned elsewhere (e.g. by the gateway)
    ///
    /// Re-inserting the same id is a no-op and returns `false`.
    pub async fn insert_external(&self, message: &Message) -> Result<bool, ChatError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(store_err("Failed to begin transaction"))?;

        let query = format!(
            "INSERT OR IGNORE INTO messages ({}) VALUES (?, ?, ?, ?, ?)",
            MESSAGE_COLUMNS
        );
        let inserted = sqlx::query(&query)
            .bind(&message.id)
            .bind(&message.conversation_id)
            .bind(&message.sender_id)
            .bind(&message.body)
            .bind(message.created_at)
            .execute(&mut *tx)
            .await
            .map_err(store_err("Failed to add message"))?
            .rows_affected()
            == 1;

        if inserted {
            touch_conversation(&mut tx, &message.conversation_id).await?;
        }
        tx.commit()
            .await
            .map_err(store_err("Failed to commit message"))?;

        if inserted {
            debug!(
                conversation_id = %message.conversation_id,
                message_id = %message.id,
                "Stored external message"
            );
            self.publish(message);
        }
        Ok(inserted)
    }

    fn publish(&self, message: &Message) {
        if let Some(feed) = &self.feed {
            feed.publish(message);
        }
    }

    /// Get the database pool (for advanced operations if needed)
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Bump `updated_at`; fails with `ConversationNotFound` for unknown ids
async fn touch_conversation(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    conversation_id: &str,
) -> Result<(), ChatError> {
    let result = sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
        .bind(now_millis())
        .bind(conversation_id)
        .execute(&mut **tx)
        .await
        .map_err(store_err("Failed to touch conversation"))?;

    if result.rows_affected() == 0 {
        return Err(ChatError::ConversationNotFound(conversation_id.to_string()));
    }
    Ok(())
}

#[async_trait]
impl ConversationStore for ChatDb {
    async fn append(
        &self,
        conversation_id: &str,
        sender_id: Option<&str>,
        body: &str,
    ) -> Result<Message, ChatError> {
        let message = Message::new(
            Uuid::new_v4().to_string(),
            conversation_id.to_string(),
            sender_id.map(String::from),
            body.to_string(),
            now_millis(),
        );

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(store_err("Failed to begin transaction"))?;

        touch_conversation(&mut tx, conversation_id).await?;

        let query = format!("INSERT INTO messages ({}) VALUES (?, ?, ?, ?, ?)", MESSAGE_COLUMNS);
        sqlx::query(&query)
            .bind(&message.id)
            .bind(&message.conversation_id)
            .bind(&message.sender_id)
            .bind(&message.body)
            .bind(message.created_at)
            .execute(&mut *tx)
            .await
            .map_err(store_err("Failed to add message"))?;

        tx.commit()
            .await
            .map_err(store_err("Failed to commit message"))?;

        debug!(
            "Added message {} to conversation {}",
            message.id, message.conversation_id
        );
        self.publish(&message);
        Ok(message)
    }

    async fn list(&self, conversation_id: &str) -> Result<Vec<Message>, ChatError> {
        let query = format!(
            "SELECT {} FROM messages WHERE conversation_id = ? ORDER BY created_at ASC, id ASC",
            MESSAGE_COLUMNS
        );
        sqlx::query_as::<_, Message>(&query)
            .bind(conversation_id)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err("Failed to fetch messages"))
    }

    async fn lookup_or_create(
        &self,
        participant_a: &str,
        participant_b: &str,
        subject_ref: Option<&str>,
    ) -> Result<Conversation, ChatError> {
        // The unique key folds "" into NULL, so the row must too
        let subject_ref = subject_ref.filter(|s| !s.is_empty());
        let candidate = Conversation::new(
            Uuid::new_v4().to_string(),
            participant_a.to_string(),
            participant_b.to_string(),
            subject_ref.map(String::from),
        );

        // The partial unique index decides the winner between concurrent callers
        let created = self.insert_conversation(&candidate, true).await?;

        let query = format!(
            "SELECT {} FROM conversations WHERE participant_a = ? AND participant_b = ? \
             AND COALESCE(subject_ref, '') = ? AND mode = ?",
            CONVERSATION_COLUMNS
        );
        let conversation = sqlx::query_as::<_, Conversation>(&query)
            .bind(participant_a)
            .bind(participant_b)
            .bind(subject_ref.unwrap_or(""))
            .bind(ConversationMode::Push.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(store_err("Failed to look up conversation"))?;

        if created {
            info!(conversation_id = %conversation.id, "Created conversation");
        }
        Ok(conversation)
    }
}
