//! Legacy per-record YAML documents.
//!
//! Keys are kebab-case and timestamps are epoch milliseconds. Each type
//! converts into its relational record and back; conversion into the
//! relational shape validates what serde alone cannot (timestamps in range,
//! known tiers, ordered start and end).

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use concord_types::{
    ActivityCompletion, ActorId, ActorState, CompletionId, GuildId, GuildRecord, GuildStats,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LegacyError;

fn from_millis(field: &'static str, millis: i64) -> Result<DateTime<Utc>, LegacyError> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| LegacyError::InvalidField {
        field,
        message: format!("timestamp {millis} out of range"),
    })
}

/// `players/<uuid>.yml`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LegacyPlayer {
    /// Player UUID.
    pub uuid: Uuid,
    /// Last known display name.
    #[serde(default)]
    pub name: String,
    /// Deaths.
    #[serde(default)]
    pub deaths: u32,
    /// Kills.
    #[serde(default)]
    pub kills: u32,
    /// Raids completed.
    #[serde(default)]
    pub raids_completed: u32,
    /// Favor with the pledged god.
    #[serde(default)]
    pub favor: i64,
    /// Pledged god, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pledged_god: Option<String>,
    /// Banished flag.
    #[serde(default)]
    pub banished: bool,
    /// Ascended flag.
    #[serde(default)]
    pub ascended: bool,
    /// Raid ids completed at least once.
    #[serde(default)]
    pub completed_raids: Vec<String>,
    /// Cooldown expiry per key, epoch milliseconds.
    #[serde(default)]
    pub cooldowns: BTreeMap<String, i64>,
    /// Last save, epoch milliseconds. Older files lack it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<i64>,
}

impl LegacyPlayer {
    /// Convert to an actor record. Files without a save time are stamped
    /// with the epoch, so any live save supersedes them.
    pub fn into_actor(self) -> Result<ActorState, LegacyError> {
        let cooldowns = self
            .cooldowns
            .into_iter()
            .map(|(key, millis)| Ok((key, from_millis("cooldowns", millis)?)))
            .collect::<Result<BTreeMap<_, _>, LegacyError>>()?;
        let last_updated = match self.last_updated {
            Some(millis) => from_millis("last-updated", millis)?,
            None => DateTime::UNIX_EPOCH,
        };

        Ok(ActorState {
            actor_id: ActorId::from(self.uuid),
            display_name: self.name,
            death_count: self.deaths,
            kill_count: self.kills,
            raids_completed: self.raids_completed,
            favor: self.favor,
            pledged_god: self.pledged_god,
            banished: self.banished,
            ascended: self.ascended,
            completed_activities: self.completed_raids.into_iter().collect(),
            cooldowns,
            origin_server: None,
            last_updated,
        })
    }

    /// Legacy form of an actor record.
    pub fn from_actor(actor: &ActorState) -> Self {
        Self {
            uuid: actor.actor_id.into_inner(),
            name: actor.display_name.clone(),
            deaths: actor.death_count,
            kills: actor.kill_count,
            raids_completed: actor.raids_completed,
            favor: actor.favor,
            pledged_god: actor.pledged_god.clone(),
            banished: actor.banished,
            ascended: actor.ascended,
            completed_raids: actor.completed_activities.iter().cloned().collect(),
            cooldowns: actor
                .cooldowns
                .iter()
                .map(|(key, until)| (key.clone(), until.timestamp_millis()))
                .collect(),
            last_updated: Some(actor.last_updated.timestamp_millis()),
        }
    }
}

/// `guilds/<uuid>.yml`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LegacyGuild {
    /// Guild UUID.
    pub uuid: Uuid,
    /// Unique guild name.
    pub name: String,
    /// Leader's player UUID.
    pub leader: Uuid,
    /// Member player UUIDs; the leader may be omitted.
    #[serde(default)]
    pub members: Vec<Uuid>,
    /// Raids completed as a guild.
    #[serde(default)]
    pub raids_completed: u32,
    /// Accumulated score.
    #[serde(default)]
    pub total_score: i64,
    /// Guild level.
    #[serde(default = "default_guild_level")]
    pub level: u32,
    /// Founding time, epoch milliseconds.
    pub created: i64,
    /// Last change, epoch milliseconds. Defaults to `created`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<i64>,
}

const fn default_guild_level() -> u32 {
    1
}

impl LegacyGuild {
    /// Convert to a guild record. The leader is always a member.
    pub fn into_guild(self) -> Result<GuildRecord, LegacyError> {
        if self.name.trim().is_empty() {
            return Err(LegacyError::InvalidField {
                field: "name",
                message: "guild name is empty".to_owned(),
            });
        }
        let created_at = from_millis("created", self.created)?;
        let updated_at = match self.updated {
            Some(millis) => from_millis("updated", millis)?,
            None => created_at,
        };
        let leader_id = ActorId::from(self.leader);
        let mut members: BTreeSet<ActorId> = self.members.into_iter().map(ActorId::from).collect();
        members.insert(leader_id);

        Ok(GuildRecord {
            guild_id: GuildId::from(self.uuid),
            name: self.name,
            leader_id,
            members,
            stats: GuildStats {
                raids_completed: self.raids_completed,
                total_score: self.total_score,
                level: self.level,
            },
            origin_server: None,
            created_at,
            updated_at,
        })
    }

    /// Legacy form of a guild record.
    pub fn from_guild(guild: &GuildRecord) -> Self {
        Self {
            uuid: guild.guild_id.into_inner(),
            name: guild.name.clone(),
            leader: guild.leader_id.into_inner(),
            members: guild.members.iter().copied().map(ActorId::into_inner).collect(),
            raids_completed: guild.stats.raids_completed,
            total_score: guild.stats.total_score,
            level: guild.stats.level,
            created: guild.created_at.timestamp_millis(),
            updated: Some(guild.updated_at.timestamp_millis()),
        }
    }
}

/// `raids/<uuid>.yml`, one finished raid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LegacyRaid {
    /// Completion UUID.
    pub uuid: Uuid,
    /// Raid definition id.
    pub raid_id: String,
    /// Participating player UUIDs.
    #[serde(default)]
    pub participants: Vec<Uuid>,
    /// Start, epoch milliseconds.
    pub started: i64,
    /// End, epoch milliseconds.
    pub ended: i64,
    /// Final score.
    #[serde(default)]
    pub score: i64,
    /// Difficulty tier name, any case.
    #[serde(default = "default_tier")]
    pub tier: String,
    /// Objective met.
    #[serde(default)]
    pub success: bool,
    /// No participant died.
    #[serde(default)]
    pub flawless: bool,
}

fn default_tier() -> String {
    "normal".to_owned()
}

impl LegacyRaid {
    /// Convert to an activity completion.
    pub fn into_activity(self) -> Result<ActivityCompletion, LegacyError> {
        let started_at = from_millis("started", self.started)?;
        let ended_at = from_millis("ended", self.ended)?;
        if ended_at < started_at {
            return Err(LegacyError::InvalidField {
                field: "ended",
                message: "raid ends before it starts".to_owned(),
            });
        }
        let tier = self
            .tier
            .parse()
            .map_err(|message| LegacyError::InvalidField {
                field: "tier",
                message,
            })?;

        Ok(ActivityCompletion {
            id: CompletionId::from(self.uuid),
            activity_id: self.raid_id,
            participants: self.participants.into_iter().map(ActorId::from).collect(),
            started_at,
            ended_at,
            score: self.score,
            tier,
            success: self.success,
            flawless: self.flawless,
            origin_server: None,
        })
    }

    /// Legacy form of an activity completion.
    pub fn from_activity(activity: &ActivityCompletion) -> Self {
        Self {
            uuid: activity.id.into_inner(),
            raid_id: activity.activity_id.clone(),
            participants: activity.participants.iter().copied().map(ActorId::into_inner).collect(),
            started: activity.started_at.timestamp_millis(),
            ended: activity.ended_at.timestamp_millis(),
            score: activity.score,
            tier: activity.tier.as_str().to_ascii_lowercase(),
            success: activity.success,
            flawless: activity.flawless,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const PLAYER: &str = r"
uuid: 7f3c2a34-0d7e-4a7c-9d57-2b8f3e1c0a11
name: Mirelle
deaths: 3
kills: 41
raids-completed: 2
favor: 150
pledged-god: Vael
completed-raids: [molten-core, ashen-crypt]
cooldowns:
  daily-raid: 1700000000000
";

    #[test]
    fn player_document_converts() {
        let player: LegacyPlayer = serde_yml::from_str(PLAYER).unwrap();
        let actor = player.into_actor().unwrap();

        assert_eq!(actor.display_name, "Mirelle");
        assert_eq!(actor.kill_count, 41);
        assert_eq!(actor.pledged_god.as_deref(), Some("Vael"));
        assert!(actor.completed_activities.contains("ashen-crypt"));
        assert_eq!(
            actor.cooldowns.get("daily-raid").map(DateTime::timestamp_millis),
            Some(1_700_000_000_000)
        );
        assert_eq!(actor.last_updated, DateTime::UNIX_EPOCH);
    }

    #[test]
    fn player_export_keeps_fields() {
        let player: LegacyPlayer = serde_yml::from_str(PLAYER).unwrap();
        let actor = player.clone().into_actor().unwrap();
        let exported = LegacyPlayer::from_actor(&actor);
        assert_eq!(exported.name, player.name);
        assert_eq!(exported.cooldowns, player.cooldowns);
        assert!(exported.last_updated.is_some());
    }

    #[test]
    fn guild_leader_is_always_a_member() {
        let yaml = r"
uuid: 0b9d6b0e-52f4-4d0e-8a4b-7d0f0ad4b1c2
name: Ashen Vow
leader: 7f3c2a34-0d7e-4a7c-9d57-2b8f3e1c0a11
total-score: 900
created: 1690000000000
";
        let guild = serde_yml::from_str::<LegacyGuild>(yaml)
            .unwrap()
            .into_guild()
            .unwrap();
        assert!(guild.members.contains(&guild.leader_id));
        assert_eq!(guild.stats.level, 1);
        assert_eq!(guild.updated_at, guild.created_at);
    }

    #[test]
    fn raid_rejects_unknown_tier_and_reversed_times() {
        let mut raid = LegacyRaid {
            uuid: Uuid::now_v7(),
            raid_id: "molten-core".to_owned(),
            participants: vec![Uuid::now_v7()],
            started: 1_700_000_000_000,
            ended: 1_700_000_600_000,
            score: 10,
            tier: "Heroic".to_owned(),
            success: true,
            flawless: false,
        };
        let activity = raid.clone().into_activity().unwrap();
        assert_eq!(activity.duration_secs(), 600);

        raid.tier = "legendary".to_owned();
        assert!(matches!(
            raid.clone().into_activity(),
            Err(LegacyError::InvalidField { field: "tier", .. })
        ));

        raid.tier = "normal".to_owned();
        raid.ended = raid.started.saturating_sub(1);
        assert!(matches!(
            raid.into_activity(),
            Err(LegacyError::InvalidField { field: "ended", .. })
        ));
    }
}
