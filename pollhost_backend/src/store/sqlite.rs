use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tokio::time::Instant;

use super::{
    InboundMessage, MessageStore, MessageSubscription, OutboundReply, PollStore, ReplySink,
    SubscriptionEvent,
};
use crate::config::HostConfig;
use crate::poll::{PollOption, PollSnapshot};

/// Table names and change-feed settings for one deployment.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    pub user_table: String,
    pub reply_table: String,
    pub poll_table: String,
    pub poll_document_id: String,
    pub subscription_poll_interval: Duration,
    pub subscription_deadline: Option<Duration>,
}

impl StoreLayout {
    pub fn from_config(config: &HostConfig) -> Self {
        Self {
            user_table: config.user_collection.clone(),
            reply_table: config.reply_collection.clone(),
            poll_table: config.poll_collection.clone(),
            poll_document_id: config.poll_document_id.clone(),
            subscription_poll_interval: config.subscription_poll_interval(),
            subscription_deadline: config.subscription_deadline(),
        }
    }
}

impl Default for StoreLayout {
    fn default() -> Self {
        Self::from_config(&HostConfig::default())
    }
}

/// SQLite-backed message store, reply sink and poll store.
#[derive(Clone)]
pub struct HostDatabase {
    conn: Arc<Mutex<Connection>>,
    layout: Arc<StoreLayout>,
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name)
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: String, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

impl HostDatabase {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P, layout: StoreLayout) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to open database {:?}", path.as_ref()))?;
        Self::from_connection(conn, layout)
    }

    pub fn open(config: &HostConfig) -> Result<Self> {
        Self::new(&config.database_path, StoreLayout::from_config(config))
    }

    fn from_connection(conn: Connection, layout: StoreLayout) -> Result<Self> {
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            layout: Arc::new(layout),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    fn user_table(&self) -> String {
        quote_ident(&self.layout.user_table)
    }

    fn reply_table(&self) -> String {
        quote_ident(&self.layout.reply_table)
    }

    fn poll_table(&self) -> String {
        quote_ident(&self.layout.poll_table)
    }

    /// Create the database schema
    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY,
                    message TEXT NOT NULL,
                    timestamp TEXT NOT NULL,
                    processed INTEGER NOT NULL DEFAULT 0
                )",
                self.user_table()
            ),
            [],
        )?;

        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} (processed, timestamp)",
                quote_ident(&format!("{}_processed_idx", self.layout.user_table)),
                self.user_table()
            ),
            [],
        )?;

        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY,
                    message TEXT NOT NULL,
                    timestamp TEXT NOT NULL,
                    processed INTEGER NOT NULL DEFAULT 0
                )",
                self.reply_table()
            ),
            [],
        )?;

        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY,
                    question TEXT NOT NULL,
                    options TEXT NOT NULL DEFAULT '{{}}',
                    updated_at TEXT NOT NULL
                )",
                self.poll_table()
            ),
            [],
        )?;

        Ok(())
    }

    /// Insert a new unprocessed message with a fresh id.
    pub fn insert_inbound_message(&self, message: &str) -> Result<InboundMessage> {
        let inbound = InboundMessage {
            id: uuid::Uuid::new_v4().to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
            processed: false,
        };
        self.insert_inbound(&inbound)?;
        Ok(inbound)
    }

    pub fn insert_inbound(&self, inbound: &InboundMessage) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            &format!(
                "INSERT INTO {} (id, message, timestamp, processed) VALUES (?1, ?2, ?3, ?4)",
                self.user_table()
            ),
            params![
                inbound.id,
                inbound.message,
                format_ts(&inbound.timestamp),
                inbound.processed as i64
            ],
        )
        .with_context(|| format!("Failed to insert message {}", inbound.id))?;
        Ok(())
    }

    pub fn get_inbound_message(&self, id: &str) -> Result<Option<InboundMessage>> {
        let conn = self.lock_conn()?;
        let message = conn
            .query_row(
                &format!(
                    "SELECT id, message, timestamp, processed FROM {} WHERE id = ?1",
                    self.user_table()
                ),
                [id],
                |row| {
                    Ok(InboundMessage {
                        id: row.get(0)?,
                        message: row.get(1)?,
                        timestamp: parse_ts(row.get(2)?, 2)?,
                        processed: row.get::<_, i64>(3)? != 0,
                    })
                },
            )
            .optional()?;
        Ok(message)
    }

    pub fn get_unprocessed_messages(&self) -> Result<Vec<InboundMessage>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, message, timestamp, processed FROM {}
             WHERE processed = 0
             ORDER BY timestamp ASC, rowid ASC",
            self.user_table()
        ))?;

        let messages = stmt
            .query_map([], |row| {
                Ok(InboundMessage {
                    id: row.get(0)?,
                    message: row.get(1)?,
                    timestamp: parse_ts(row.get(2)?, 2)?,
                    processed: row.get::<_, i64>(3)? != 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(messages)
    }

    /// Mark a message as processed. Returns false when the message was
    /// missing or already processed.
    pub fn mark_message_processed(&self, id: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            &format!(
                "UPDATE {} SET processed = 1 WHERE id = ?1 AND processed = 0",
                self.user_table()
            ),
            [id],
        )?;
        Ok(changed > 0)
    }

    pub fn save_reply(&self, reply: &OutboundReply) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            &format!(
                "INSERT INTO {} (id, message, timestamp, processed) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    message = excluded.message,
                    timestamp = excluded.timestamp,
                    processed = excluded.processed",
                self.reply_table()
            ),
            params![
                reply.id,
                reply.message,
                format_ts(&reply.timestamp),
                reply.processed as i64
            ],
        )
        .with_context(|| format!("Failed to write reply {}", reply.id))?;
        Ok(())
    }

    pub fn get_reply(&self, id: &str) -> Result<Option<OutboundReply>> {
        let conn = self.lock_conn()?;
        let reply = conn
            .query_row(
                &format!(
                    "SELECT id, message, timestamp, processed FROM {} WHERE id = ?1",
                    self.reply_table()
                ),
                [id],
                |row| {
                    Ok(OutboundReply {
                        id: row.get(0)?,
                        message: row.get(1)?,
                        timestamp: parse_ts(row.get(2)?, 2)?,
                        processed: row.get::<_, i64>(3)? != 0,
                    })
                },
            )
            .optional()?;
        Ok(reply)
    }

    /// Most recent replies first.
    pub fn list_replies(&self, limit: usize) -> Result<Vec<OutboundReply>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, message, timestamp, processed FROM {}
             ORDER BY timestamp DESC
             LIMIT ?1",
            self.reply_table()
        ))?;

        let replies = stmt
            .query_map([limit as i64], |row| {
                Ok(OutboundReply {
                    id: row.get(0)?,
                    message: row.get(1)?,
                    timestamp: parse_ts(row.get(2)?, 2)?,
                    processed: row.get::<_, i64>(3)? != 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(replies)
    }

    pub fn upsert_poll(&self, poll_id: &str, poll: &PollSnapshot) -> Result<()> {
        let conn = self.lock_conn()?;
        self.write_poll(&conn, poll_id, poll)
    }

    pub fn get_poll(&self, poll_id: &str) -> Result<Option<PollSnapshot>> {
        let conn = self.lock_conn()?;
        self.read_poll(&conn, poll_id)
    }

    fn read_poll(&self, conn: &Connection, poll_id: &str) -> Result<Option<PollSnapshot>> {
        let row = conn
            .query_row(
                &format!(
                    "SELECT question, options FROM {} WHERE id = ?1",
                    self.poll_table()
                ),
                [poll_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        let Some((question, options_json)) = row else {
            return Ok(None);
        };
        let options = serde_json::from_str(&options_json)
            .with_context(|| format!("Invalid options JSON in poll '{}'", poll_id))?;
        Ok(Some(PollSnapshot { question, options }))
    }

    fn write_poll(&self, conn: &Connection, poll_id: &str, poll: &PollSnapshot) -> Result<()> {
        let options =
            serde_json::to_string(&poll.options).context("Failed to serialize poll options")?;
        conn.execute(
            &format!(
                "INSERT INTO {} (id, question, options, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    question = excluded.question,
                    options = excluded.options,
                    updated_at = excluded.updated_at",
                self.poll_table()
            ),
            params![poll_id, poll.question, options, format_ts(&Utc::now())],
        )?;
        Ok(())
    }

    /// Append `voter` to an option's voters list. Repeat votes are kept.
    ///
    /// The read and the write share one IMMEDIATE transaction so concurrent
    /// votes (from this process or another) never overwrite each other.
    pub fn cast_vote(&self, poll_id: &str, option_key: &str, voter: &str) -> Result<PollSnapshot> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut poll = self
            .read_poll(&tx, poll_id)?
            .ok_or_else(|| anyhow::anyhow!("poll '{}' not found", poll_id))?;
        let option: &mut PollOption = poll
            .options
            .get_mut(option_key)
            .ok_or_else(|| anyhow::anyhow!("poll '{}' has no option '{}'", poll_id, option_key))?;
        option.voters.push(voter.to_string());
        self.write_poll(&tx, poll_id, &poll)?;

        tx.commit().context("Failed to commit vote")?;
        Ok(poll)
    }
}

#[async_trait]
impl MessageStore for HostDatabase {
    async fn unprocessed_messages(&self) -> Result<Vec<InboundMessage>> {
        self.get_unprocessed_messages()
    }

    async fn mark_processed(&self, id: &str) -> Result<()> {
        if !self.mark_message_processed(id)? {
            tracing::debug!("Message {} was already processed", id);
        }
        Ok(())
    }

    async fn subscribe_unprocessed(&self) -> Result<Box<dyn MessageSubscription>> {
        let deadline = self
            .layout
            .subscription_deadline
            .and_then(|limit| Instant::now().checked_add(limit));
        Ok(Box::new(PollingSubscription {
            db: self.clone(),
            interval: self.layout.subscription_poll_interval,
            deadline,
        }))
    }
}

#[async_trait]
impl ReplySink for HostDatabase {
    async fn upsert_reply(&self, reply: &OutboundReply) -> Result<()> {
        self.save_reply(reply)
    }
}

#[async_trait]
impl PollStore for HostDatabase {
    async fn fetch_poll(&self) -> Result<PollSnapshot> {
        let poll_id = &self.layout.poll_document_id;
        self.get_poll(poll_id)?
            .ok_or_else(|| anyhow::anyhow!("error fetching poll document '{}': not found", poll_id))
    }
}

/// Change feed over SQLite: re-runs the unprocessed query on an interval and
/// yields whatever it finds.
struct PollingSubscription {
    db: HostDatabase,
    interval: Duration,
    deadline: Option<Instant>,
}

#[async_trait]
impl MessageSubscription for PollingSubscription {
    async fn next_event(&mut self) -> Result<SubscriptionEvent> {
        loop {
            let now = Instant::now();
            if matches!(self.deadline, Some(deadline) if now >= deadline) {
                return Ok(SubscriptionEvent::DeadlineExceeded);
            }

            let batch = self.db.get_unprocessed_messages()?;
            if !batch.is_empty() {
                return Ok(SubscriptionEvent::Batch(batch));
            }

            let wait = match self.deadline {
                Some(deadline) => self.interval.min(deadline.saturating_duration_since(now)),
                None => self.interval,
            };
            tokio::time::sleep(wait).await;
        }
    }
}
