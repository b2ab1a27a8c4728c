//! Store traits: the narrow, parameterized access path to each table.
//!
//! Every table is reached only through one of these traits. The
//! `PostgreSQL` implementations live in [`crate::state_store`],
//! [`crate::registry_store`] and [`crate::sync_store`]; the in-memory
//! implementation in [`crate::memory`] backs tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use concord_types::{
    ActivityCompletion, ActorId, ActorState, GuildId, GuildRecord, MessageId, MessageKind,
    ServerId, ServerRecord, ServerStatus, SyncMessage,
};

use crate::error::DbError;
use crate::memory::MemoryStore;
use crate::pool::PoolManager;
use crate::registry_store::PgRegistryStore;
use crate::state_store::PgStateStore;
use crate::sync_store::PgSyncStore;

/// A record paired with the store-assigned stamp of its last write.
///
/// The stamp is taken by the store when the write lands, so stamps follow
/// commit order even when record timestamps (`last_updated`, `ended_at`)
/// do not. Delta push checkpoints on it.
#[derive(Debug, Clone, PartialEq)]
pub struct Changed<T> {
    /// The record as stored.
    pub record: T,
    /// When the store applied the write.
    pub changed_at: DateTime<Utc>,
}

/// Typed reads and writes of actor, guild, and activity records.
#[async_trait]
pub trait StateRepository: Send + Sync {
    /// Insert or fully replace an actor record.
    async fn save_actor(&self, actor: &ActorState) -> Result<(), DbError>;

    /// Load an actor record; `None` if it was never written.
    async fn load_actor(&self, actor_id: ActorId) -> Result<Option<ActorState>, DbError>;

    /// Write `actor` only if it is absent or strictly newer than the stored
    /// row. Returns whether a write happened.
    async fn apply_actor_if_newer(&self, actor: &ActorState) -> Result<bool, DbError>;

    /// Every actor record.
    async fn list_actors(&self) -> Result<Vec<ActorState>, DbError>;

    /// Actors written by `origin` whose change stamp is after `since` and
    /// at least `settle` old, oldest stamp first.
    async fn actors_changed_since(
        &self,
        since: DateTime<Utc>,
        settle: Duration,
        origin: &ServerId,
        limit: usize,
    ) -> Result<Vec<Changed<ActorState>>, DbError>;

    /// Number of actor records.
    async fn count_actors(&self) -> Result<u64, DbError>;

    /// Insert or fully replace a guild record.
    ///
    /// Returns [`DbError::Conflict`] if another guild already owns the name.
    async fn upsert_guild(&self, guild: &GuildRecord) -> Result<(), DbError>;

    /// Load a guild by id.
    async fn load_guild(&self, guild_id: GuildId) -> Result<Option<GuildRecord>, DbError>;

    /// Load a guild by its unique name.
    async fn find_guild_by_name(&self, name: &str) -> Result<Option<GuildRecord>, DbError>;

    /// Every guild record.
    async fn list_guilds(&self) -> Result<Vec<GuildRecord>, DbError>;

    /// Guilds written by `origin` whose change stamp is after `since` and
    /// at least `settle` old, oldest stamp first.
    async fn guilds_changed_since(
        &self,
        since: DateTime<Utc>,
        settle: Duration,
        origin: &ServerId,
        limit: usize,
    ) -> Result<Vec<Changed<GuildRecord>>, DbError>;

    /// Number of guild records.
    async fn count_guilds(&self) -> Result<u64, DbError>;

    /// Append a completion. Returns `false` if the id was already recorded.
    async fn record_activity(&self, activity: &ActivityCompletion) -> Result<bool, DbError>;

    /// Most recent completions that `actor_id` took part in.
    async fn activities_for(
        &self,
        actor_id: ActorId,
        limit: usize,
    ) -> Result<Vec<ActivityCompletion>, DbError>;

    /// Every completion record.
    async fn list_activities(&self) -> Result<Vec<ActivityCompletion>, DbError>;

    /// Completions recorded by `origin` whose recording stamp is after
    /// `since` and at least `settle` old, oldest stamp first.
    async fn activities_changed_since(
        &self,
        since: DateTime<Utc>,
        settle: Duration,
        origin: &ServerId,
        limit: usize,
    ) -> Result<Vec<Changed<ActivityCompletion>>, DbError>;

    /// Number of completion records.
    async fn count_activities(&self) -> Result<u64, DbError>;
}

/// Access to the shared `server_registry` table.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Insert or update a server row. `last_heartbeat` never moves backwards.
    async fn upsert_server(&self, record: &ServerRecord) -> Result<(), DbError>;

    /// ONLINE servers other than `exclude` whose heartbeat is at or after
    /// `fresh_since`.
    async fn fresh_peers(
        &self,
        exclude: &ServerId,
        fresh_since: DateTime<Utc>,
    ) -> Result<Vec<ServerRecord>, DbError>;

    /// Flip ONLINE servers with a heartbeat before `cutoff` to OFFLINE.
    /// Returns the number of rows changed.
    async fn mark_stale_offline(&self, cutoff: DateTime<Utc>) -> Result<u64, DbError>;

    /// Set the status of one server.
    async fn set_status(&self, server_id: &ServerId, status: ServerStatus) -> Result<(), DbError>;

    /// Every server row.
    async fn list_servers(&self) -> Result<Vec<ServerRecord>, DbError>;
}

/// A message ready to be written to the outbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    /// Sending server.
    pub from_server: ServerId,
    /// Addressed server.
    pub to_server: ServerId,
    /// Payload discriminant.
    pub kind: MessageKind,
    /// Entity the payload concerns; used to collapse duplicates.
    pub logical_key: String,
    /// Encoded payload body.
    pub payload: String,
}

/// Access to the `cross_server_sync` outbox/inbox table.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append messages; returns their ids in input order.
    async fn enqueue(&self, messages: &[NewMessage]) -> Result<Vec<MessageId>, DbError>;

    /// Unprocessed, live, unclaimed rows addressed to `server` that are due
    /// at `now`, oldest first.
    async fn pending_for(
        &self,
        server: &ServerId,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SyncMessage>, DbError>;

    /// Lease rows until `until`. Only rows that are still unprocessed and
    /// not leased at `now` are claimed; their ids are returned.
    async fn claim(
        &self,
        ids: &[MessageId],
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<MessageId>, DbError>;

    /// Flip `processed` to true on rows not yet processed; returns how many
    /// flipped.
    async fn mark_processed(&self, ids: &[MessageId]) -> Result<u64, DbError>;

    /// Record a failed attempt: bump `attempts`, store the error, release
    /// the lease, and either schedule the next attempt or dead-letter it.
    async fn record_failure(
        &self,
        id: MessageId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
        dead_letter: bool,
    ) -> Result<(), DbError>;

    /// Dead-lettered rows addressed to `server`, newest first.
    async fn dead_letters(
        &self,
        server: &ServerId,
        limit: usize,
    ) -> Result<Vec<SyncMessage>, DbError>;
}

/// Entity categories that have a delta-push checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncEntity {
    /// `actor_state`
    Actor,
    /// `guilds`
    Guild,
    /// `activity_completions`
    Activity,
}

impl SyncEntity {
    /// Every entity, in push order.
    pub const ALL: [Self; 3] = [Self::Actor, Self::Guild, Self::Activity];

    /// Column value in `sync_checkpoints.entity`.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Actor => "actor",
            Self::Guild => "guild",
            Self::Activity => "activity",
        }
    }
}

/// Access to `sync_checkpoints`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Change stamp of the last pushed row for `entity`, if any.
    async fn load_checkpoint(
        &self,
        server: &ServerId,
        entity: SyncEntity,
    ) -> Result<Option<DateTime<Utc>>, DbError>;

    /// Advance the checkpoint for `entity`. Never moves it backwards.
    async fn save_checkpoint(
        &self,
        server: &ServerId,
        entity: SyncEntity,
        checkpoint: DateTime<Utc>,
    ) -> Result<(), DbError>;
}

/// Every store a running node needs, behind trait objects.
#[derive(Clone)]
pub struct Stores {
    /// Actor, guild, and activity records.
    pub state: Arc<dyn StateRepository>,
    /// Server registry.
    pub registry: Arc<dyn RegistryStore>,
    /// Cross-server message table.
    pub messages: Arc<dyn MessageStore>,
    /// Delta-push checkpoints.
    pub checkpoints: Arc<dyn CheckpointStore>,
}

impl Stores {
    /// `PostgreSQL`-backed stores sharing one pool.
    pub fn postgres(pool: &PoolManager) -> Self {
        let sync = Arc::new(PgSyncStore::new(pool.clone()));
        Self {
            state: Arc::new(PgStateStore::new(pool.clone())),
            registry: Arc::new(PgRegistryStore::new(pool.clone())),
            messages: Arc::clone(&sync) as Arc<dyn MessageStore>,
            checkpoints: sync,
        }
    }

    /// Stores backed by one shared [`MemoryStore`].
    pub fn memory(store: &Arc<MemoryStore>) -> Self {
        Self {
            state: Arc::clone(store) as Arc<dyn StateRepository>,
            registry: Arc::clone(store) as Arc<dyn RegistryStore>,
            messages: Arc::clone(store) as Arc<dyn MessageStore>,
            checkpoints: Arc::clone(store) as Arc<dyn CheckpointStore>,
        }
    }
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}
