//! `PostgreSQL` implementation of [`MessageStore`] and [`CheckpointStore`].
//!
//! One `cross_server_sync` row per addressed server. A row is leased with
//! `claimed_until` before its handler runs, so two overlapping reconcile
//! passes never both apply it; `processed` flips false to true once.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use concord_types::{MessageId, ServerId, SyncMessage};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};

use crate::codec::{count_from_db, limit_to_db};
use crate::error::DbError;
use crate::pool::{PoolManager, SqlValue};
use crate::store::{CheckpointStore, MessageStore, NewMessage, SyncEntity};

const MESSAGE_COLUMNS: &str = "id, from_server, to_server, message_type, logical_key, payload, \
     created_at, processed, attempts, next_attempt_at, last_error, dead_lettered";

/// A row from `cross_server_sync`.
#[derive(Debug, Clone, FromRow)]
pub struct SyncRow {
    /// Row id.
    pub id: i64,
    /// Sender.
    pub from_server: String,
    /// Addressee.
    pub to_server: String,
    /// Payload discriminant.
    pub message_type: String,
    /// Entity key used to collapse duplicates.
    pub logical_key: String,
    /// Encoded payload.
    pub payload: String,
    /// Insert time.
    pub created_at: DateTime<Utc>,
    /// Applied flag.
    pub processed: bool,
    /// Failed attempts so far.
    pub attempts: i64,
    /// Earliest time of the next attempt.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Last handler error.
    pub last_error: Option<String>,
    /// Retries exhausted.
    pub dead_lettered: bool,
}

impl From<SyncRow> for SyncMessage {
    fn from(row: SyncRow) -> Self {
        Self {
            id: MessageId(row.id),
            from_server: ServerId::from_stored(row.from_server),
            to_server: ServerId::from_stored(row.to_server),
            message_type: row.message_type,
            logical_key: row.logical_key,
            payload: row.payload,
            created_at: row.created_at,
            processed: row.processed,
            attempts: count_from_db(row.attempts),
            next_attempt_at: row.next_attempt_at.unwrap_or(row.created_at),
            last_error: row.last_error,
            dead_lettered: row.dead_lettered,
        }
    }
}

fn sync_row(row: &PgRow) -> Result<SyncMessage, sqlx::Error> {
    SyncRow::from_row(row).map(SyncMessage::from)
}

fn id_row(row: &PgRow) -> Result<MessageId, sqlx::Error> {
    row.try_get::<i64, _>("id").map(MessageId)
}

fn id_params(ids: &[MessageId]) -> SqlValue {
    SqlValue::IntArray(ids.iter().map(|id| id.0).collect())
}

/// [`MessageStore`] and [`CheckpointStore`] over the shared pool.
#[derive(Debug, Clone)]
pub struct PgSyncStore {
    pool: PoolManager,
}

impl PgSyncStore {
    /// Create a store bound to the pool.
    pub const fn new(pool: PoolManager) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageStore for PgSyncStore {
    async fn enqueue(&self, messages: &[NewMessage]) -> Result<Vec<MessageId>, DbError> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }

        let len = messages.len();
        let mut from = Vec::with_capacity(len);
        let mut to = Vec::with_capacity(len);
        let mut kinds = Vec::with_capacity(len);
        let mut keys = Vec::with_capacity(len);
        let mut payloads = Vec::with_capacity(len);
        for message in messages {
            from.push(message.from_server.as_str().to_owned());
            to.push(message.to_server.as_str().to_owned());
            kinds.push(message.kind.as_str().to_owned());
            keys.push(message.logical_key.clone());
            payloads.push(message.payload.clone());
        }

        // WITH ORDINALITY keeps RETURNING aligned with input order.
        let ids = self
            .pool
            .query(
                r"INSERT INTO cross_server_sync (from_server, to_server, message_type, logical_key, payload)
                  SELECT f, t, k, l, p
                  FROM UNNEST($1::TEXT[], $2::TEXT[], $3::TEXT[], $4::TEXT[], $5::TEXT[])
                      WITH ORDINALITY AS m(f, t, k, l, p, ord)
                  ORDER BY ord
                  RETURNING id",
                &[
                    SqlValue::TextArray(from),
                    SqlValue::TextArray(to),
                    SqlValue::TextArray(kinds),
                    SqlValue::TextArray(keys),
                    SqlValue::TextArray(payloads),
                ],
                id_row,
            )
            .await?;
        tracing::debug!(count = ids.len(), "Enqueued sync messages (batch UNNEST)");
        Ok(ids)
    }

    async fn pending_for(
        &self,
        server: &ServerId,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SyncMessage>, DbError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM cross_server_sync
             WHERE to_server = $1
               AND processed = FALSE
               AND dead_lettered = FALSE
               AND (next_attempt_at IS NULL OR next_attempt_at <= $2)
               AND (claimed_until IS NULL OR claimed_until < $2)
             ORDER BY created_at, id
             LIMIT $3"
        );
        self.pool
            .query(
                &sql,
                &[
                    SqlValue::from(server.as_str()),
                    SqlValue::Timestamp(now),
                    SqlValue::Int(limit_to_db(limit)),
                ],
                sync_row,
            )
            .await
    }

    async fn claim(
        &self,
        ids: &[MessageId],
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<MessageId>, DbError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.pool
            .query(
                "UPDATE cross_server_sync SET claimed_until = $2
                 WHERE id = ANY($1)
                   AND processed = FALSE
                   AND dead_lettered = FALSE
                   AND (claimed_until IS NULL OR claimed_until < $3)
                 RETURNING id",
                &[
                    id_params(ids),
                    SqlValue::Timestamp(until),
                    SqlValue::Timestamp(now),
                ],
                id_row,
            )
            .await
    }

    async fn mark_processed(&self, ids: &[MessageId]) -> Result<u64, DbError> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.pool
            .execute(
                "UPDATE cross_server_sync
                 SET processed = TRUE, processed_at = now(), claimed_until = NULL
                 WHERE id = ANY($1) AND processed = FALSE",
                &[id_params(ids)],
            )
            .await
    }

    async fn record_failure(
        &self,
        id: MessageId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
        dead_letter: bool,
    ) -> Result<(), DbError> {
        self.pool
            .execute(
                "UPDATE cross_server_sync
                 SET attempts = attempts + 1,
                     last_error = $2,
                     next_attempt_at = $3,
                     dead_lettered = $4,
                     claimed_until = NULL
                 WHERE id = $1 AND processed = FALSE",
                &[
                    SqlValue::Int(id.0),
                    SqlValue::from(error),
                    SqlValue::Timestamp(next_attempt_at),
                    SqlValue::Bool(dead_letter),
                ],
            )
            .await?;
        Ok(())
    }

    async fn dead_letters(
        &self,
        server: &ServerId,
        limit: usize,
    ) -> Result<Vec<SyncMessage>, DbError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM cross_server_sync
             WHERE to_server = $1 AND dead_lettered = TRUE
             ORDER BY created_at DESC, id DESC
             LIMIT $2"
        );
        self.pool
            .query(
                &sql,
                &[
                    SqlValue::from(server.as_str()),
                    SqlValue::Int(limit_to_db(limit)),
                ],
                sync_row,
            )
            .await
    }
}

#[async_trait]
impl CheckpointStore for PgSyncStore {
    async fn load_checkpoint(
        &self,
        server: &ServerId,
        entity: SyncEntity,
    ) -> Result<Option<DateTime<Utc>>, DbError> {
        self.pool
            .query_optional(
                "SELECT checkpoint FROM sync_checkpoints WHERE server_id = $1 AND entity = $2",
                &[
                    SqlValue::from(server.as_str()),
                    SqlValue::from(entity.as_str()),
                ],
                |row| row.try_get::<DateTime<Utc>, _>("checkpoint"),
            )
            .await
    }

    async fn save_checkpoint(
        &self,
        server: &ServerId,
        entity: SyncEntity,
        checkpoint: DateTime<Utc>,
    ) -> Result<(), DbError> {
        self.pool
            .execute(
                r"INSERT INTO sync_checkpoints (server_id, entity, checkpoint)
                  VALUES ($1, $2, $3)
                  ON CONFLICT (server_id, entity) DO UPDATE SET
                      checkpoint = GREATEST(sync_checkpoints.checkpoint, EXCLUDED.checkpoint)",
                &[
                    SqlValue::from(server.as_str()),
                    SqlValue::from(entity.as_str()),
                    SqlValue::Timestamp(checkpoint),
                ],
            )
            .await?;
        Ok(())
    }
}
