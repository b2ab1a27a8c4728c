//! Gameplay-facing state service.
//!
//! Writes are handed to the background executor and return a [`Pending`]
//! handle the caller may await or drop; the game tick never waits on the
//! store. Every local write is stamped from the per-process
//! [`MonotonicClock`] and tagged with the local server id so delta push can
//! find it.
//!
//! Reads never fail: an absent actor or a degraded store yields a default
//! record, an absent guild yields `None`.
//!
//! Actors and guilds are served from the process's [`StateCache`]: local
//! writes update it before they are queued, store reads fill it, and
//! deltas from peers refresh it.

use std::sync::Arc;

use concord_db::{BackgroundExecutor, DbError, Pending, StateRepository};
use concord_types::{
    ActivityCompletion, ActorId, ActorState, GuildId, GuildRecord, GuildStats, ServerId,
};

use crate::cache::StateCache;
use crate::clock::MonotonicClock;

/// Handle for a background write.
pub type Completion = Pending<()>;

/// Async facade over the state repository.
pub struct StateService {
    server_id: ServerId,
    state: Arc<dyn StateRepository>,
    executor: BackgroundExecutor,
    clock: MonotonicClock,
    cache: Arc<StateCache>,
}

impl StateService {
    /// Create a service writing as `server_id`.
    pub fn new(
        server_id: ServerId,
        state: Arc<dyn StateRepository>,
        executor: BackgroundExecutor,
    ) -> Self {
        Self {
            server_id,
            state,
            executor,
            clock: MonotonicClock::new(),
            cache: Arc::new(StateCache::new()),
        }
    }

    /// The cache this service reads through. Hand it to the
    /// [`StateApplier`](crate::bus::StateApplier) so deltas refresh it.
    pub fn cache(&self) -> Arc<StateCache> {
        Arc::clone(&self.cache)
    }

    /// Save an actor, replacing the stored record.
    pub fn save_actor(&self, mut actor: ActorState) -> Completion {
        actor.last_updated = self.clock.now();
        actor.origin_server = Some(self.server_id.clone());
        self.cache.put_actor(actor.clone());
        let state = Arc::clone(&self.state);
        self.executor.spawn("save_actor", async move {
            state.save_actor(&actor).await.inspect_err(|e| {
                tracing::warn!(actor_id = %actor.actor_id, error = %e, "Failed to save actor");
            })
        })
    }

    /// Load an actor. Absent ids and store failures yield a default record.
    pub async fn load_actor(&self, actor_id: ActorId) -> ActorState {
        if let Some(cached) = self.cache.actor(actor_id) {
            return cached;
        }
        match self.state.load_actor(actor_id).await {
            Ok(Some(actor)) => self.cache.fill_actor(actor),
            Ok(None) => ActorState::new_default(actor_id),
            Err(e) => {
                tracing::warn!(actor_id = %actor_id, error = %e, "Actor load failed, using defaults");
                ActorState::new_default(actor_id)
            }
        }
    }

    /// Save a guild. Fails with [`DbError::Conflict`] if another guild owns
    /// the name.
    pub fn upsert_guild(&self, mut guild: GuildRecord) -> Completion {
        guild.updated_at = self.clock.now();
        guild.origin_server = Some(self.server_id.clone());
        self.cache.put_guild(guild.clone());
        let state = Arc::clone(&self.state);
        self.executor.spawn("upsert_guild", async move {
            state.upsert_guild(&guild).await.inspect_err(|e| {
                tracing::warn!(guild_id = %guild.guild_id, name = %guild.name, error = %e, "Failed to save guild");
            })
        })
    }

    /// Create a guild named `name` led by `leader`.
    ///
    /// Resolves to the new record, or [`DbError::Conflict`] if the name is
    /// taken.
    pub fn register_guild(&self, name: &str, leader: ActorId) -> Pending<GuildRecord> {
        let now = self.clock.now();
        let guild = GuildRecord {
            guild_id: GuildId::new(),
            name: name.to_owned(),
            leader_id: leader,
            members: std::iter::once(leader).collect(),
            stats: GuildStats::default(),
            origin_server: Some(self.server_id.clone()),
            created_at: now,
            updated_at: now,
        };
        let state = Arc::clone(&self.state);
        let cache = Arc::clone(&self.cache);
        self.executor.spawn("register_guild", async move {
            if let Some(existing) = state.find_guild_by_name(&guild.name).await? {
                return Err(DbError::Conflict(format!(
                    "guild name {} is owned by {}",
                    guild.name, existing.guild_id
                )));
            }
            state.upsert_guild(&guild).await?;
            cache.put_guild(guild.clone());
            tracing::info!(guild_id = %guild.guild_id, name = %guild.name, "Guild registered");
            Ok(guild)
        })
    }

    /// Look up a guild. Store failures read as absent.
    pub async fn query_guild(&self, guild_id: GuildId) -> Option<GuildRecord> {
        if let Some(cached) = self.cache.guild(guild_id) {
            return Some(cached);
        }
        self.state
            .load_guild(guild_id)
            .await
            .inspect_err(|e| tracing::warn!(guild_id = %guild_id, error = %e, "Guild load failed"))
            .ok()
            .flatten()
            .map(|guild| self.cache.fill_guild(guild))
    }

    /// Stop serving `actor_id` from the cache, e.g. when the player leaves.
    pub fn evict_actor(&self, actor_id: ActorId) {
        self.cache.evict_actor(actor_id);
    }

    /// Record a finished activity. Resolves to `false` if the id was
    /// already recorded.
    pub fn record_activity(&self, mut activity: ActivityCompletion) -> Pending<bool> {
        activity.origin_server = Some(self.server_id.clone());
        let state = Arc::clone(&self.state);
        self.executor.spawn("record_activity", async move {
            state.record_activity(&activity).await.inspect_err(|e| {
                tracing::warn!(completion_id = %activity.id, error = %e, "Failed to record activity");
            })
        })
    }
}

impl std::fmt::Debug for StateService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateService")
            .field("server_id", &self.server_id)
            .finish_non_exhaustive()
    }
}
