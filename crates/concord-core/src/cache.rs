//! Per-process view of the actors and guilds this server is serving.
//!
//! [`StateService`](crate::state::StateService) reads through it and writes
//! through it; the [`StateApplier`](crate::bus::StateApplier) refreshes it
//! when a peer's delta arrives. Every server reads the same tables, so the
//! delta's visible effect is here: without it a server would keep serving
//! the copy it loaded before the peer wrote.
//!
//! The cache also remembers which remote activity completions were already
//! handed to the notification sink, so a completion delivered twice is
//! announced once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{PoisonError, RwLock};

use concord_types::{ActorId, ActorState, CompletionId, GuildId, GuildRecord};

use crate::merge::{actor_supersedes, merge_guild};

/// Remote completions remembered for duplicate suppression.
const ANNOUNCED_CAPACITY: usize = 4_096;

#[derive(Debug, Default)]
struct Announced {
    order: VecDeque<CompletionId>,
    ids: HashSet<CompletionId>,
}

/// Cached actor and guild records for one process.
#[derive(Debug, Default)]
pub struct StateCache {
    actors: RwLock<HashMap<ActorId, ActorState>>,
    guilds: RwLock<HashMap<GuildId, GuildRecord>>,
    announced: RwLock<Announced>,
}

impl StateCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached actor, if this server holds one.
    pub fn actor(&self, actor_id: ActorId) -> Option<ActorState> {
        self.actors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&actor_id)
            .cloned()
    }

    /// Cache a local write unconditionally.
    pub fn put_actor(&self, actor: ActorState) {
        self.actors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(actor.actor_id, actor);
    }

    /// Cache a record read from the store unless a newer copy is already
    /// cached. Returns the copy now cached.
    pub fn fill_actor(&self, loaded: ActorState) -> ActorState {
        let mut actors = self.actors.write().unwrap_or_else(PoisonError::into_inner);
        match actors.get(&loaded.actor_id) {
            Some(cached) if !actor_supersedes(Some(cached), &loaded) => cached.clone(),
            _ => {
                actors.insert(loaded.actor_id, loaded.clone());
                loaded
            }
        }
    }

    /// Replace a cached actor with a newer remote copy. Actors this server
    /// does not hold are left uncached. Returns whether the cache changed.
    pub fn refresh_actor(&self, incoming: &ActorState) -> bool {
        let mut actors = self.actors.write().unwrap_or_else(PoisonError::into_inner);
        match actors.get_mut(&incoming.actor_id) {
            Some(cached) if actor_supersedes(Some(cached), incoming) => {
                *cached = incoming.clone();
                true
            }
            _ => false,
        }
    }

    /// Drop an actor, e.g. when the player leaves this server.
    pub fn evict_actor(&self, actor_id: ActorId) -> Option<ActorState> {
        self.actors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&actor_id)
    }

    /// The cached guild, if any.
    pub fn guild(&self, guild_id: GuildId) -> Option<GuildRecord> {
        self.guilds
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&guild_id)
            .cloned()
    }

    /// Cache a local guild write unconditionally.
    pub fn put_guild(&self, guild: GuildRecord) {
        self.guilds
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(guild.guild_id, guild);
    }

    /// Cache a guild read from the store, merged with any cached copy.
    /// Returns the copy now cached.
    pub fn fill_guild(&self, loaded: GuildRecord) -> GuildRecord {
        let mut guilds = self.guilds.write().unwrap_or_else(PoisonError::into_inner);
        let cached = guilds.get(&loaded.guild_id);
        let Some(next) = merge_guild(cached, &loaded) else {
            return cached.cloned().unwrap_or(loaded);
        };
        guilds.insert(next.guild_id, next.clone());
        next
    }

    /// Merge a remote guild snapshot into the cached copy. Guilds this
    /// server does not hold are left uncached. Returns whether the cache
    /// changed.
    pub fn refresh_guild(&self, incoming: &GuildRecord) -> bool {
        let mut guilds = self.guilds.write().unwrap_or_else(PoisonError::into_inner);
        let Some(cached) = guilds.get_mut(&incoming.guild_id) else {
            return false;
        };
        match merge_guild(Some(cached), incoming) {
            Some(merged) => {
                *cached = merged;
                true
            }
            None => false,
        }
    }

    /// Drop a guild.
    pub fn evict_guild(&self, guild_id: GuildId) -> Option<GuildRecord> {
        self.guilds
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&guild_id)
    }

    /// Whether a remote completion was already announced to the sink.
    pub fn was_announced(&self, id: CompletionId) -> bool {
        self.announced
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ids
            .contains(&id)
    }

    /// Remember that a remote completion was announced. The oldest entry
    /// is forgotten once the set is full.
    pub fn mark_announced(&self, id: CompletionId) {
        let mut announced = self.announced.write().unwrap_or_else(PoisonError::into_inner);
        if !announced.ids.insert(id) {
            return;
        }
        announced.order.push_back(id);
        if announced.order.len() > ANNOUNCED_CAPACITY {
            if let Some(oldest) = announced.order.pop_front() {
                announced.ids.remove(&oldest);
            }
        }
    }

    /// Number of cached actors.
    pub fn actor_count(&self) -> usize {
        self.actors.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::arithmetic_side_effects)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::{Duration, Utc};
    use concord_types::{GuildStats, ServerId};

    use super::*;

    fn actor_at(id: ActorId, offset_secs: i64, deaths: u32) -> ActorState {
        let mut actor = ActorState::new_default(id);
        actor.last_updated = Utc::now() + Duration::seconds(offset_secs);
        actor.death_count = deaths;
        actor
    }

    #[test]
    fn refresh_only_touches_held_actors() {
        let cache = StateCache::new();
        let id = ActorId::new();
        assert!(!cache.refresh_actor(&actor_at(id, 0, 1)));
        assert!(cache.actor(id).is_none());

        cache.put_actor(actor_at(id, 0, 1));
        assert!(cache.refresh_actor(&actor_at(id, 10, 4)));
        assert!(!cache.refresh_actor(&actor_at(id, -10, 9)));
        assert_eq!(cache.actor(id).map(|a| a.death_count), Some(4));
    }

    #[test]
    fn stale_load_does_not_overwrite_a_refresh() {
        let cache = StateCache::new();
        let id = ActorId::new();
        cache.put_actor(actor_at(id, 10, 4));
        let kept = cache.fill_actor(actor_at(id, 0, 1));
        assert_eq!(kept.death_count, 4);
        assert_eq!(cache.evict_actor(id).map(|a| a.death_count), Some(4));
        assert_eq!(cache.actor_count(), 0);
    }

    #[test]
    fn guild_refresh_merges_members() {
        let cache = StateCache::new();
        let now = Utc::now();
        let a = ActorId::new();
        let b = ActorId::new();
        let held = GuildRecord {
            guild_id: GuildId::new(),
            name: "Ashen Vow".to_owned(),
            leader_id: a,
            members: BTreeSet::from([a]),
            stats: GuildStats::default(),
            origin_server: Some(ServerId::from_stored("alpha")),
            created_at: now,
            updated_at: now,
        };
        cache.put_guild(held.clone());

        let mut incoming = held.clone();
        incoming.members = BTreeSet::from([b]);
        incoming.origin_server = Some(ServerId::from_stored("beta"));
        assert!(cache.refresh_guild(&incoming));
        assert!(!cache.refresh_guild(&incoming));
        assert_eq!(
            cache.guild(held.guild_id).map(|g| g.members),
            Some(BTreeSet::from([a, b]))
        );
    }

    #[test]
    fn announced_set_is_bounded() {
        let cache = StateCache::new();
        let first = CompletionId::new();
        cache.mark_announced(first);
        assert!(cache.was_announced(first));
        for _ in 0..ANNOUNCED_CAPACITY {
            cache.mark_announced(CompletionId::new());
        }
        assert!(!cache.was_announced(first));
    }
}
