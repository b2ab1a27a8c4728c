//! In-memory implementation of every store trait.
//!
//! Mirrors the `PostgreSQL` stores' semantics (upsert rules, guild name
//! uniqueness, claim leases, retry bookkeeping) closely enough to test the
//! registry, bus, reconciler, state service, and legacy tool without a
//! database. [`MemoryStore::set_unavailable`] makes every call fail with
//! [`DbError::Connectivity`].
//!
//! Change stamps come from a strictly increasing clock read under the table
//! lock, so they follow the order in which writes land.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use concord_types::{
    ActivityCompletion, ActorId, ActorState, CompletionId, GuildId, GuildRecord, MessageId,
    ServerId, ServerRecord, ServerStatus, SyncMessage,
};

use crate::error::DbError;
use crate::store::{
    Changed, CheckpointStore, MessageStore, NewMessage, RegistryStore, StateRepository, SyncEntity,
};

#[derive(Debug, Clone)]
struct StoredMessage {
    message: SyncMessage,
    claimed_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Tables {
    actors: BTreeMap<ActorId, ActorState>,
    guilds: BTreeMap<GuildId, GuildRecord>,
    activities: BTreeMap<CompletionId, ActivityCompletion>,
    servers: BTreeMap<ServerId, ServerRecord>,
    messages: BTreeMap<i64, StoredMessage>,
    checkpoints: HashMap<(ServerId, SyncEntity), DateTime<Utc>>,
    next_message_id: i64,
    stamps: Stamps,
}

#[derive(Debug, Default)]
struct Stamps {
    last: Option<DateTime<Utc>>,
    actors: BTreeMap<ActorId, DateTime<Utc>>,
    guilds: BTreeMap<GuildId, DateTime<Utc>>,
    activities: BTreeMap<CompletionId, DateTime<Utc>>,
}

impl Stamps {
    fn next(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamp = match self.last {
            Some(last) if now <= last => last
                .checked_add_signed(TimeDelta::nanoseconds(1))
                .unwrap_or(last),
            _ => now,
        };
        self.last = Some(stamp);
        stamp
    }
}

/// Every store trait over process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
}

fn settle_horizon(settle: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    TimeDelta::from_std(settle)
        .ok()
        .and_then(|lag| now.checked_sub_signed(lag))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn changed_since<K: Ord, T: Clone>(
    rows: &BTreeMap<K, T>,
    stamps: &BTreeMap<K, DateTime<Utc>>,
    since: DateTime<Utc>,
    settle: Duration,
    origin: &ServerId,
    limit: usize,
    origin_of: impl Fn(&T) -> Option<&ServerId>,
) -> Vec<Changed<T>> {
    let horizon = settle_horizon(settle);
    let mut matched: Vec<Changed<T>> = rows
        .iter()
        .filter_map(|(key, row)| {
            let changed_at = *stamps.get(key)?;
            let due = origin_of(row) == Some(origin) && changed_at > since && changed_at <= horizon;
            due.then(|| Changed {
                record: row.clone(),
                changed_at,
            })
        })
        .collect();
    matched.sort_by_key(|change| change.changed_at);
    matched.truncate(limit);
    matched
}

fn to_count(len: usize) -> u64 {
    u64::try_from(len).unwrap_or(u64::MAX)
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, DbError> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(DbError::Connectivity("memory store unavailable".to_owned()));
        }
        Ok(self.tables.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Every message row, including processed and dead-lettered ones.
    pub fn all_messages(&self) -> Vec<SyncMessage> {
        self.tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .messages
            .values()
            .map(|stored| stored.message.clone())
            .collect()
    }
}

#[async_trait]
impl StateRepository for MemoryStore {
    async fn save_actor(&self, actor: &ActorState) -> Result<(), DbError> {
        let mut tables = self.tables()?;
        let stamp = tables.stamps.next();
        tables.stamps.actors.insert(actor.actor_id, stamp);
        tables.actors.insert(actor.actor_id, actor.clone());
        Ok(())
    }

    async fn load_actor(&self, actor_id: ActorId) -> Result<Option<ActorState>, DbError> {
        Ok(self.tables()?.actors.get(&actor_id).cloned())
    }

    async fn apply_actor_if_newer(&self, actor: &ActorState) -> Result<bool, DbError> {
        let mut tables = self.tables()?;
        let newer = tables
            .actors
            .get(&actor.actor_id)
            .is_none_or(|stored| stored.last_updated < actor.last_updated);
        if newer {
            let stamp = tables.stamps.next();
            tables.stamps.actors.insert(actor.actor_id, stamp);
            tables.actors.insert(actor.actor_id, actor.clone());
        }
        Ok(newer)
    }

    async fn list_actors(&self) -> Result<Vec<ActorState>, DbError> {
        Ok(self.tables()?.actors.values().cloned().collect())
    }

    async fn actors_changed_since(
        &self,
        since: DateTime<Utc>,
        settle: Duration,
        origin: &ServerId,
        limit: usize,
    ) -> Result<Vec<Changed<ActorState>>, DbError> {
        let tables = self.tables()?;
        Ok(changed_since(
            &tables.actors,
            &tables.stamps.actors,
            since,
            settle,
            origin,
            limit,
            |a: &ActorState| a.origin_server.as_ref(),
        ))
    }

    async fn count_actors(&self) -> Result<u64, DbError> {
        Ok(to_count(self.tables()?.actors.len()))
    }

    async fn upsert_guild(&self, guild: &GuildRecord) -> Result<(), DbError> {
        let mut tables = self.tables()?;
        let name_taken = tables
            .guilds
            .values()
            .any(|g| g.name == guild.name && g.guild_id != guild.guild_id);
        if name_taken {
            return Err(DbError::Conflict(format!(
                "guild name already taken: {}",
                guild.name
            )));
        }
        let mut record = guild.clone();
        if let Some(existing) = tables.guilds.get(&guild.guild_id) {
            record.created_at = existing.created_at;
        }
        let stamp = tables.stamps.next();
        tables.stamps.guilds.insert(guild.guild_id, stamp);
        tables.guilds.insert(guild.guild_id, record);
        Ok(())
    }

    async fn load_guild(&self, guild_id: GuildId) -> Result<Option<GuildRecord>, DbError> {
        Ok(self.tables()?.guilds.get(&guild_id).cloned())
    }

    async fn find_guild_by_name(&self, name: &str) -> Result<Option<GuildRecord>, DbError> {
        Ok(self
            .tables()?
            .guilds
            .values()
            .find(|g| g.name == name)
            .cloned())
    }

    async fn list_guilds(&self) -> Result<Vec<GuildRecord>, DbError> {
        let mut guilds: Vec<GuildRecord> = self.tables()?.guilds.values().cloned().collect();
        guilds.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(guilds)
    }

    async fn guilds_changed_since(
        &self,
        since: DateTime<Utc>,
        settle: Duration,
        origin: &ServerId,
        limit: usize,
    ) -> Result<Vec<Changed<GuildRecord>>, DbError> {
        let tables = self.tables()?;
        Ok(changed_since(
            &tables.guilds,
            &tables.stamps.guilds,
            since,
            settle,
            origin,
            limit,
            |g: &GuildRecord| g.origin_server.as_ref(),
        ))
    }

    async fn count_guilds(&self) -> Result<u64, DbError> {
        Ok(to_count(self.tables()?.guilds.len()))
    }

    async fn record_activity(&self, activity: &ActivityCompletion) -> Result<bool, DbError> {
        let mut tables = self.tables()?;
        if tables.activities.contains_key(&activity.id) {
            return Ok(false);
        }
        let stamp = tables.stamps.next();
        tables.stamps.activities.insert(activity.id, stamp);
        tables.activities.insert(activity.id, activity.clone());
        Ok(true)
    }

    async fn activities_for(
        &self,
        actor_id: ActorId,
        limit: usize,
    ) -> Result<Vec<ActivityCompletion>, DbError> {
        let tables = self.tables()?;
        let mut matched: Vec<ActivityCompletion> = tables
            .activities
            .values()
            .filter(|a| a.participants.contains(&actor_id))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.ended_at.cmp(&a.ended_at));
        matched.truncate(limit);
        Ok(matched)
    }

    async fn list_activities(&self) -> Result<Vec<ActivityCompletion>, DbError> {
        let mut all: Vec<ActivityCompletion> =
            self.tables()?.activities.values().cloned().collect();
        all.sort_by_key(|a| (a.ended_at, a.id));
        Ok(all)
    }

    async fn activities_changed_since(
        &self,
        since: DateTime<Utc>,
        settle: Duration,
        origin: &ServerId,
        limit: usize,
    ) -> Result<Vec<Changed<ActivityCompletion>>, DbError> {
        let tables = self.tables()?;
        Ok(changed_since(
            &tables.activities,
            &tables.stamps.activities,
            since,
            settle,
            origin,
            limit,
            |a: &ActivityCompletion| a.origin_server.as_ref(),
        ))
    }

    async fn count_activities(&self) -> Result<u64, DbError> {
        Ok(to_count(self.tables()?.activities.len()))
    }
}

#[async_trait]
impl RegistryStore for MemoryStore {
    async fn upsert_server(&self, record: &ServerRecord) -> Result<(), DbError> {
        let mut tables = self.tables()?;
        let mut updated = record.clone();
        if let Some(existing) = tables.servers.get(&record.server_id) {
            updated.last_heartbeat = existing.last_heartbeat.max(record.last_heartbeat);
        }
        tables.servers.insert(record.server_id.clone(), updated);
        Ok(())
    }

    async fn fresh_peers(
        &self,
        exclude: &ServerId,
        fresh_since: DateTime<Utc>,
    ) -> Result<Vec<ServerRecord>, DbError> {
        Ok(self
            .tables()?
            .servers
            .values()
            .filter(|s| {
                &s.server_id != exclude
                    && s.status == ServerStatus::Online
                    && s.last_heartbeat >= fresh_since
            })
            .cloned()
            .collect())
    }

    async fn mark_stale_offline(&self, cutoff: DateTime<Utc>) -> Result<u64, DbError> {
        let mut tables = self.tables()?;
        let mut changed: u64 = 0;
        for server in tables.servers.values_mut() {
            if server.status == ServerStatus::Online && server.last_heartbeat < cutoff {
                server.status = ServerStatus::Offline;
                changed = changed.saturating_add(1);
            }
        }
        Ok(changed)
    }

    async fn set_status(&self, server_id: &ServerId, status: ServerStatus) -> Result<(), DbError> {
        if let Some(server) = self.tables()?.servers.get_mut(server_id) {
            server.status = status;
        }
        Ok(())
    }

    async fn list_servers(&self) -> Result<Vec<ServerRecord>, DbError> {
        Ok(self.tables()?.servers.values().cloned().collect())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn enqueue(&self, messages: &[NewMessage]) -> Result<Vec<MessageId>, DbError> {
        let mut tables = self.tables()?;
        let now = Utc::now();
        let mut ids = Vec::with_capacity(messages.len());
        for message in messages {
            tables.next_message_id = tables.next_message_id.saturating_add(1);
            let id = MessageId(tables.next_message_id);
            let row = SyncMessage {
                id,
                from_server: message.from_server.clone(),
                to_server: message.to_server.clone(),
                message_type: message.kind.as_str().to_owned(),
                logical_key: message.logical_key.clone(),
                payload: message.payload.clone(),
                created_at: now,
                processed: false,
                attempts: 0,
                next_attempt_at: now,
                last_error: None,
                dead_lettered: false,
            };
            tables.messages.insert(
                id.0,
                StoredMessage {
                    message: row,
                    claimed_until: None,
                },
            );
            ids.push(id);
        }
        Ok(ids)
    }

    async fn pending_for(
        &self,
        server: &ServerId,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SyncMessage>, DbError> {
        // Ids are assigned in insert order, so key order is creation order.
        Ok(self
            .tables()?
            .messages
            .values()
            .filter(|stored| {
                let m = &stored.message;
                &m.to_server == server
                    && !m.processed
                    && !m.dead_lettered
                    && m.next_attempt_at <= now
                    && stored.claimed_until.is_none_or(|until| until < now)
            })
            .take(limit)
            .map(|stored| stored.message.clone())
            .collect())
    }

    async fn claim(
        &self,
        ids: &[MessageId],
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<MessageId>, DbError> {
        let mut tables = self.tables()?;
        let mut claimed = Vec::new();
        for id in ids {
            if let Some(stored) = tables.messages.get_mut(&id.0) {
                let free = stored.claimed_until.is_none_or(|c| c < now);
                if free && !stored.message.processed && !stored.message.dead_lettered {
                    stored.claimed_until = Some(until);
                    claimed.push(*id);
                }
            }
        }
        Ok(claimed)
    }

    async fn mark_processed(&self, ids: &[MessageId]) -> Result<u64, DbError> {
        let mut tables = self.tables()?;
        let mut flipped: u64 = 0;
        for id in ids {
            if let Some(stored) = tables.messages.get_mut(&id.0) {
                if !stored.message.processed {
                    stored.message.processed = true;
                    stored.claimed_until = None;
                    flipped = flipped.saturating_add(1);
                }
            }
        }
        Ok(flipped)
    }

    async fn record_failure(
        &self,
        id: MessageId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
        dead_letter: bool,
    ) -> Result<(), DbError> {
        if let Some(stored) = self.tables()?.messages.get_mut(&id.0) {
            if !stored.message.processed {
                stored.message.attempts = stored.message.attempts.saturating_add(1);
                stored.message.last_error = Some(error.to_owned());
                stored.message.next_attempt_at = next_attempt_at;
                stored.message.dead_lettered = dead_letter;
                stored.claimed_until = None;
            }
        }
        Ok(())
    }

    async fn dead_letters(
        &self,
        server: &ServerId,
        limit: usize,
    ) -> Result<Vec<SyncMessage>, DbError> {
        Ok(self
            .tables()?
            .messages
            .values()
            .rev()
            .filter(|stored| &stored.message.to_server == server && stored.message.dead_lettered)
            .take(limit)
            .map(|stored| stored.message.clone())
            .collect())
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn load_checkpoint(
        &self,
        server: &ServerId,
        entity: SyncEntity,
    ) -> Result<Option<DateTime<Utc>>, DbError> {
        Ok(self
            .tables()?
            .checkpoints
            .get(&(server.clone(), entity))
            .copied())
    }

    async fn save_checkpoint(
        &self,
        server: &ServerId,
        entity: SyncEntity,
        checkpoint: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let mut tables = self.tables()?;
        let slot = tables
            .checkpoints
            .entry((server.clone(), entity))
            .or_insert(checkpoint);
        *slot = (*slot).max(checkpoint);
        Ok(())
    }
}
