//! Durable records persisted in the shared relational store.
//!
//! Nested collections (activity sets, cooldown maps, guild members) are
//! plain Rust collections here; the data layer encodes them as JSON text
//! columns so every server, whatever its version, can read them back.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ActorId, CompletionId, GuildId, ServerId};

/// Truncate a timestamp to the precision the store keeps (microseconds).
///
/// Applied to every timestamp the core writes so a value read back compares
/// equal to the value that was saved.
pub fn storage_precision(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(6)
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

/// Persistent per-player state tracked across all servers.
///
/// Created on first write, updated in place, never deleted. Writes follow
/// last-write-wins on [`ActorState::last_updated`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorState {
    /// Stable external identity of the player.
    pub actor_id: ActorId,
    /// Last known display name.
    pub display_name: String,
    /// Number of deaths.
    pub death_count: u32,
    /// Number of kills.
    pub kill_count: u32,
    /// Number of raids completed.
    pub raids_completed: u32,
    /// Favor balance with the pledged god (may go negative).
    pub favor: i64,
    /// God the player is pledged to, if any.
    pub pledged_god: Option<String>,
    /// Whether the player has been banished.
    pub banished: bool,
    /// Whether the player has ascended.
    pub ascended: bool,
    /// Ids of activities this player has completed at least once.
    pub completed_activities: BTreeSet<String>,
    /// Cooldown name to expiry time.
    pub cooldowns: BTreeMap<String, DateTime<Utc>>,
    /// Server that produced this version of the record.
    pub origin_server: Option<ServerId>,
    /// Time of the write that produced this version.
    pub last_updated: DateTime<Utc>,
}

impl ActorState {
    /// A zeroed record for an actor that has never been written.
    pub fn new_default(actor_id: ActorId) -> Self {
        Self {
            actor_id,
            display_name: String::new(),
            death_count: 0,
            kill_count: 0,
            raids_completed: 0,
            favor: 0,
            pledged_god: None,
            banished: false,
            ascended: false,
            completed_activities: BTreeSet::new(),
            cooldowns: BTreeMap::new(),
            origin_server: None,
            last_updated: DateTime::UNIX_EPOCH,
        }
    }
}

// ---------------------------------------------------------------------------
// Guild
// ---------------------------------------------------------------------------

/// Aggregate guild statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildStats {
    /// Raids completed by the guild as a whole.
    pub raids_completed: u32,
    /// Sum of raid scores.
    pub total_score: i64,
    /// Guild level.
    pub level: u32,
}

/// A guild and its member set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildRecord {
    /// Primary key.
    pub guild_id: GuildId,
    /// Unique display name.
    pub name: String,
    /// Current leader.
    pub leader_id: ActorId,
    /// Member set, leader included.
    pub members: BTreeSet<ActorId>,
    /// Aggregate statistics.
    pub stats: GuildStats,
    /// Server that produced this version of the record.
    pub origin_server: Option<ServerId>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the write that produced this version.
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Activity completion
// ---------------------------------------------------------------------------

/// Difficulty tier of a completed activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityTier {
    /// Base difficulty.
    Normal,
    /// Raised difficulty.
    Heroic,
    /// Highest difficulty.
    Mythic,
}

impl ActivityTier {
    /// Stored column value.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Heroic => "HEROIC",
            Self::Mythic => "MYTHIC",
        }
    }
}

impl core::str::FromStr for ActivityTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NORMAL" => Ok(Self::Normal),
            "HEROIC" => Ok(Self::Heroic),
            "MYTHIC" => Ok(Self::Mythic),
            other => Err(format!("unknown activity tier: {other}")),
        }
    }
}

/// One completed activity (raid). Append-only: one row per completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityCompletion {
    /// Primary key of the completion event.
    pub id: CompletionId,
    /// Which activity was completed.
    pub activity_id: String,
    /// Actors that took part.
    pub participants: Vec<ActorId>,
    /// Start of the run.
    pub started_at: DateTime<Utc>,
    /// End of the run.
    pub ended_at: DateTime<Utc>,
    /// Final score.
    pub score: i64,
    /// Difficulty tier.
    pub tier: ActivityTier,
    /// Whether the objective was met.
    pub success: bool,
    /// Whether the run finished without a participant death.
    pub flawless: bool,
    /// Server that recorded the completion.
    pub origin_server: Option<ServerId>,
}

impl ActivityCompletion {
    /// Run duration in whole seconds, never negative.
    pub fn duration_secs(&self) -> i64 {
        self.ended_at
            .signed_duration_since(self.started_at)
            .num_seconds()
            .max(0)
    }
}

// ---------------------------------------------------------------------------
// Server registry
// ---------------------------------------------------------------------------

/// Liveness state of a registered server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerStatus {
    /// Heartbeating within the freshness window.
    Online,
    /// Shut down or swept as stale.
    Offline,
}

impl ServerStatus {
    /// Stored column value.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Online => "ONLINE",
            Self::Offline => "OFFLINE",
        }
    }

    /// Parse a stored column value. Anything unrecognized reads as offline.
    pub fn from_db(value: &str) -> Self {
        if value.eq_ignore_ascii_case("ONLINE") {
            Self::Online
        } else {
            Self::Offline
        }
    }
}

/// A server's self-announcement in the shared registry table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    /// Process-lifetime unique id.
    pub server_id: ServerId,
    /// Advertised name.
    pub name: String,
    /// Advertised address.
    pub address: String,
    /// Advertised port.
    pub port: u16,
    /// Maximum player capacity.
    pub capacity: u32,
    /// Players currently connected.
    pub current_load: u32,
    /// Time of the last heartbeat.
    pub last_heartbeat: DateTime<Utc>,
    /// Liveness state.
    pub status: ServerStatus,
}

// ---------------------------------------------------------------------------
// Migration ledger
// ---------------------------------------------------------------------------

/// One applied schema migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Unique migration name.
    pub name: String,
    /// When it was applied.
    pub applied_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn default_actor_is_zeroed() {
        let id = ActorId::new();
        let actor = ActorState::new_default(id);
        assert_eq!(actor.actor_id, id);
        assert_eq!(actor.death_count, 0);
        assert!(actor.pledged_god.is_none());
        assert!(actor.completed_activities.is_empty());
        assert_eq!(actor.last_updated, DateTime::UNIX_EPOCH);
    }

    #[test]
    fn duration_is_clamped_at_zero() {
        let now = Utc::now();
        let completion = ActivityCompletion {
            id: CompletionId::new(),
            activity_id: "sunken_temple".to_owned(),
            participants: vec![ActorId::new()],
            started_at: now,
            ended_at: now - Duration::seconds(30),
            score: 10,
            tier: ActivityTier::Normal,
            success: true,
            flawless: false,
            origin_server: None,
        };
        assert_eq!(completion.duration_secs(), 0);

        let forward = ActivityCompletion {
            ended_at: now + Duration::seconds(95),
            ..completion
        };
        assert_eq!(forward.duration_secs(), 95);
    }

    #[test]
    fn tier_round_trips_through_column_value() {
        for tier in [ActivityTier::Normal, ActivityTier::Heroic, ActivityTier::Mythic] {
            assert_eq!(tier.as_str().parse::<ActivityTier>(), Ok(tier));
        }
        assert!("legendary".parse::<ActivityTier>().is_err());
    }

    #[test]
    fn unknown_status_reads_as_offline() {
        assert_eq!(ServerStatus::from_db("ONLINE"), ServerStatus::Online);
        assert_eq!(ServerStatus::from_db("maintenance"), ServerStatus::Offline);
    }

    #[test]
    fn storage_precision_drops_nanoseconds() {
        let ts = Utc::now();
        let truncated = storage_precision(ts);
        assert_eq!(truncated.timestamp_subsec_nanos() % 1_000, 0);
        assert!(ts.signed_duration_since(truncated) < Duration::microseconds(1));
    }
}
