//! Idempotent apply rules for records received from peer servers.
//!
//! - Actors: last write wins on `last_updated`; equal or older is ignored.
//! - Guilds: a newer snapshot replaces scalars and the member set, since
//!   the owning server is authoritative for removals. Snapshots with the
//!   same `updated_at` are concurrent: members are unioned, each stat takes
//!   the larger value, and name and leader come from the snapshot whose
//!   origin sorts last. Older snapshots are ignored.
//! - Activity completions are append-only by id; the store's
//!   insert-if-absent is the whole rule.
//!
//! Applying the same input twice always yields the same state.

use concord_types::{ActorState, GuildRecord, GuildStats};

/// Whether `incoming` should replace `current`.
pub fn actor_supersedes(current: Option<&ActorState>, incoming: &ActorState) -> bool {
    current.is_none_or(|stored| incoming.last_updated > stored.last_updated)
}

/// Merge a received guild snapshot into the stored one.
///
/// Returns the record to write, or `None` when the stored record already
/// reflects `incoming`.
pub fn merge_guild(current: Option<&GuildRecord>, incoming: &GuildRecord) -> Option<GuildRecord> {
    let Some(stored) = current else {
        return Some(incoming.clone());
    };

    match incoming.updated_at.cmp(&stored.updated_at) {
        std::cmp::Ordering::Less => None,
        std::cmp::Ordering::Greater => {
            let mut next = incoming.clone();
            next.created_at = stored.created_at.min(incoming.created_at);
            Some(next)
        }
        std::cmp::Ordering::Equal => {
            let merged = merge_concurrent(stored, incoming);
            (merged != *stored).then_some(merged)
        }
    }
}

fn merge_concurrent(stored: &GuildRecord, incoming: &GuildRecord) -> GuildRecord {
    let winner = if incoming.origin_server > stored.origin_server {
        incoming
    } else {
        stored
    };

    let mut members = stored.members.clone();
    members.extend(incoming.members.iter().copied());

    GuildRecord {
        guild_id: stored.guild_id,
        name: winner.name.clone(),
        leader_id: winner.leader_id,
        members,
        stats: GuildStats {
            raids_completed: stored.stats.raids_completed.max(incoming.stats.raids_completed),
            total_score: stored.stats.total_score.max(incoming.stats.total_score),
            level: stored.stats.level.max(incoming.stats.level),
        },
        origin_server: winner.origin_server.clone(),
        created_at: stored.created_at.min(incoming.created_at),
        updated_at: stored.updated_at,
    }
}

#[cfg(test)]
#[allow(clippy::arithmetic_side_effects)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::{Duration, Utc};
    use concord_types::{ActorId, GuildId, ServerId};

    use super::*;

    fn guild(origin: &str, members: &[ActorId]) -> GuildRecord {
        let now = Utc::now();
        GuildRecord {
            guild_id: GuildId::new(),
            name: format!("{origin}-name"),
            leader_id: ActorId::new(),
            members: members.iter().copied().collect(),
            stats: GuildStats::default(),
            origin_server: Some(ServerId::from_stored(origin)),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn newer_actor_wins_and_equal_is_ignored() {
        let mut stored = ActorState::new_default(ActorId::new());
        stored.last_updated = Utc::now();
        let mut incoming = stored.clone();
        assert!(!actor_supersedes(Some(&stored), &incoming));

        incoming.last_updated = stored.last_updated + Duration::microseconds(1);
        assert!(actor_supersedes(Some(&stored), &incoming));
        assert!(actor_supersedes(None, &incoming));

        stored.last_updated = incoming.last_updated + Duration::seconds(1);
        assert!(!actor_supersedes(Some(&stored), &incoming));
    }

    #[test]
    fn newer_guild_snapshot_replaces_members() {
        let a = ActorId::new();
        let b = ActorId::new();
        let stored = guild("alpha", &[a, b]);
        let mut incoming = stored.clone();
        incoming.members = BTreeSet::from([a]);
        incoming.updated_at = stored.updated_at + Duration::seconds(1);

        let merged = merge_guild(Some(&stored), &incoming);
        assert_eq!(merged.map(|g| g.members), Some(BTreeSet::from([a])));
    }

    #[test]
    fn older_guild_snapshot_is_ignored() {
        let stored = guild("alpha", &[]);
        let mut incoming = stored.clone();
        incoming.updated_at = stored.updated_at - Duration::seconds(1);
        incoming.name = "Renamed".to_owned();
        assert!(merge_guild(Some(&stored), &incoming).is_none());
    }

    #[test]
    fn concurrent_guild_snapshots_converge() {
        let a = ActorId::new();
        let b = ActorId::new();
        let mut left = guild("alpha", &[a]);
        left.stats.total_score = 90;
        let mut right = left.clone();
        right.members = BTreeSet::from([b]);
        right.origin_server = Some(ServerId::from_stored("beta"));
        right.name = "beta-name".to_owned();
        right.stats.level = 4;

        let on_alpha = merge_guild(Some(&left), &right).unwrap_or_else(|| left.clone());
        let on_beta = merge_guild(Some(&right), &left).unwrap_or_else(|| right.clone());
        assert_eq!(on_alpha, on_beta);
        assert_eq!(on_alpha.members, BTreeSet::from([a, b]));
        assert_eq!(on_alpha.name, "beta-name");
        assert_eq!(on_alpha.stats.total_score, 90);
        assert_eq!(on_alpha.stats.level, 4);
    }

    #[test]
    fn reapplying_a_merge_is_a_no_op() {
        let stored = guild("alpha", &[ActorId::new()]);
        let mut incoming = stored.clone();
        incoming.members.insert(ActorId::new());
        let merged = merge_guild(Some(&stored), &incoming);
        assert!(merged.is_some());
        let Some(merged) = merged else { return };
        assert!(merge_guild(Some(&merged), &incoming).is_none());
    }
}
