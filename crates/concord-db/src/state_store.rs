//! `PostgreSQL` implementation of [`StateRepository`].
//!
//! Upserts are single `INSERT ... ON CONFLICT DO UPDATE` statements keyed by
//! primary id. Nested collections are JSON text columns. List queries skip
//! rows whose JSON cannot be decoded and log them; single-row loads return
//! the decode error so the caller can fall back to a default.
//!
//! Every write sets `changed_at` (`recorded_at` for completions) from
//! `clock_timestamp()`. Delta scans read only rows whose stamp is older
//! than the settle lag, so a statement still committing when the scan runs
//! is picked up by a later scan instead of being skipped past.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use concord_types::{
    ActivityCompletion, ActivityTier, ActorId, ActorState, CompletionId, GuildId, GuildRecord,
    GuildStats, ServerId,
};
use sqlx::FromRow;
use sqlx::postgres::PgRow;
use uuid::Uuid;

use crate::codec::{count_from_db, count_to_db, decode_json, encode_json, limit_to_db};
use crate::error::DbError;
use crate::pool::{PoolManager, SqlValue};
use crate::store::{Changed, StateRepository};

const ACTOR_COLUMNS: &str = "actor_id, display_name, death_count, kill_count, raids_completed, favor, \
     pledged_god, banished, ascended, completed_activities, cooldowns, origin_server, last_updated, \
     changed_at";

const ACTOR_UPSERT: &str = r"INSERT INTO actor_state (actor_id, display_name, death_count, kill_count, raids_completed, favor, pledged_god, banished, ascended, completed_activities, cooldowns, origin_server, last_updated)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
    ON CONFLICT (actor_id) DO UPDATE SET
        display_name = EXCLUDED.display_name,
        death_count = EXCLUDED.death_count,
        kill_count = EXCLUDED.kill_count,
        raids_completed = EXCLUDED.raids_completed,
        favor = EXCLUDED.favor,
        pledged_god = EXCLUDED.pledged_god,
        banished = EXCLUDED.banished,
        ascended = EXCLUDED.ascended,
        completed_activities = EXCLUDED.completed_activities,
        cooldowns = EXCLUDED.cooldowns,
        origin_server = EXCLUDED.origin_server,
        last_updated = EXCLUDED.last_updated,
        changed_at = clock_timestamp()";

const GUILD_COLUMNS: &str = "guild_id, name, leader_id, members, raids_completed, total_score, level, \
     origin_server, created_at, updated_at, changed_at";

const ACTIVITY_COLUMNS: &str = "id, activity_id, participants, started_at, ended_at, score, tier, \
     success, flawless, origin_server, recorded_at";

/// A row from `actor_state`.
#[derive(Debug, Clone, FromRow)]
pub struct ActorRow {
    /// Actor id.
    pub actor_id: Uuid,
    /// Display name.
    pub display_name: String,
    /// Deaths.
    pub death_count: i64,
    /// Kills.
    pub kill_count: i64,
    /// Raids completed.
    pub raids_completed: i64,
    /// Favor balance.
    pub favor: i64,
    /// Pledged deity.
    pub pledged_god: Option<String>,
    /// Banished flag.
    pub banished: bool,
    /// Ascended flag.
    pub ascended: bool,
    /// JSON array of activity ids.
    pub completed_activities: String,
    /// JSON object of cooldown expiries.
    pub cooldowns: String,
    /// Writing server.
    pub origin_server: Option<String>,
    /// Last write time.
    pub last_updated: DateTime<Utc>,
    /// Store-assigned stamp of the last write.
    pub changed_at: DateTime<Utc>,
}

impl ActorRow {
    /// Decode into a record.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Serialization`] if a nested column is malformed.
    pub fn into_record(self) -> Result<ActorState, DbError> {
        let completed_activities: BTreeSet<String> = decode_json(&self.completed_activities)?;
        let cooldowns: BTreeMap<String, DateTime<Utc>> = decode_json(&self.cooldowns)?;
        Ok(ActorState {
            actor_id: ActorId::from(self.actor_id),
            display_name: self.display_name,
            death_count: count_from_db(self.death_count),
            kill_count: count_from_db(self.kill_count),
            raids_completed: count_from_db(self.raids_completed),
            favor: self.favor,
            pledged_god: self.pledged_god,
            banished: self.banished,
            ascended: self.ascended,
            completed_activities,
            cooldowns,
            origin_server: self.origin_server.map(ServerId::from_stored),
            last_updated: self.last_updated,
        })
    }

    /// Decode into a record paired with its change stamp.
    ///
    /// # Errors
    ///
    /// As [`ActorRow::into_record`].
    pub fn into_change(self) -> Result<Changed<ActorState>, DbError> {
        let changed_at = self.changed_at;
        Ok(Changed {
            record: self.into_record()?,
            changed_at,
        })
    }
}

/// A row from `guilds`.
#[derive(Debug, Clone, FromRow)]
pub struct GuildRow {
    /// Guild id.
    pub guild_id: Uuid,
    /// Unique name.
    pub name: String,
    /// Leader actor id.
    pub leader_id: Uuid,
    /// JSON array of member ids.
    pub members: String,
    /// Raids completed.
    pub raids_completed: i64,
    /// Total score.
    pub total_score: i64,
    /// Level.
    pub level: i64,
    /// Writing server.
    pub origin_server: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
    /// Store-assigned stamp of the last write.
    pub changed_at: DateTime<Utc>,
}

impl GuildRow {
    /// Decode into a record.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Serialization`] if the member list is malformed.
    pub fn into_record(self) -> Result<GuildRecord, DbError> {
        let members: BTreeSet<ActorId> = decode_json(&self.members)?;
        Ok(GuildRecord {
            guild_id: GuildId::from(self.guild_id),
            name: self.name,
            leader_id: ActorId::from(self.leader_id),
            members,
            stats: GuildStats {
                raids_completed: count_from_db(self.raids_completed),
                total_score: self.total_score,
                level: count_from_db(self.level),
            },
            origin_server: self.origin_server.map(ServerId::from_stored),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }

    /// Decode into a record paired with its change stamp.
    ///
    /// # Errors
    ///
    /// As [`GuildRow::into_record`].
    pub fn into_change(self) -> Result<Changed<GuildRecord>, DbError> {
        let changed_at = self.changed_at;
        Ok(Changed {
            record: self.into_record()?,
            changed_at,
        })
    }
}

/// A row from `activity_completions`.
#[derive(Debug, Clone, FromRow)]
pub struct ActivityRow {
    /// Completion id.
    pub id: Uuid,
    /// Activity (raid) identifier.
    pub activity_id: String,
    /// JSON array of participant ids.
    pub participants: String,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time.
    pub ended_at: DateTime<Utc>,
    /// Score.
    pub score: i64,
    /// Tier name.
    pub tier: String,
    /// Success flag.
    pub success: bool,
    /// Flawless flag.
    pub flawless: bool,
    /// Recording server.
    pub origin_server: Option<String>,
    /// Store-assigned insert stamp.
    pub recorded_at: DateTime<Utc>,
}

impl ActivityRow {
    /// Decode into a record.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Serialization`] for a malformed participant list
    /// and [`DbError::InvalidValue`] for an unknown tier.
    pub fn into_record(self) -> Result<ActivityCompletion, DbError> {
        let participants: Vec<ActorId> = decode_json(&self.participants)?;
        let tier: ActivityTier = self.tier.parse().map_err(DbError::InvalidValue)?;
        Ok(ActivityCompletion {
            id: CompletionId::from(self.id),
            activity_id: self.activity_id,
            participants,
            started_at: self.started_at,
            ended_at: self.ended_at,
            score: self.score,
            tier,
            success: self.success,
            flawless: self.flawless,
            origin_server: self.origin_server.map(ServerId::from_stored),
        })
    }

    /// Decode into a record paired with its recording stamp.
    ///
    /// # Errors
    ///
    /// As [`ActivityRow::into_record`].
    pub fn into_change(self) -> Result<Changed<ActivityCompletion>, DbError> {
        let changed_at = self.recorded_at;
        Ok(Changed {
            record: self.into_record()?,
            changed_at,
        })
    }
}

fn actor_params(actor: &ActorState) -> Result<Vec<SqlValue>, DbError> {
    Ok(vec![
        SqlValue::Uuid(actor.actor_id.into_inner()),
        SqlValue::from(actor.display_name.as_str()),
        SqlValue::Int(count_to_db(actor.death_count)),
        SqlValue::Int(count_to_db(actor.kill_count)),
        SqlValue::Int(count_to_db(actor.raids_completed)),
        SqlValue::Int(actor.favor),
        SqlValue::OptText(actor.pledged_god.clone()),
        SqlValue::Bool(actor.banished),
        SqlValue::Bool(actor.ascended),
        SqlValue::Text(encode_json(&actor.completed_activities)?),
        SqlValue::Text(encode_json(&actor.cooldowns)?),
        SqlValue::OptText(actor.origin_server.as_ref().map(|s| s.as_str().to_owned())),
        SqlValue::Timestamp(actor.last_updated),
    ])
}

/// Keep the rows that decode; log the rest.
fn decode_rows<R, T>(rows: Vec<R>, decode: fn(R) -> Result<T, DbError>, table: &str) -> Vec<T> {
    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        match decode(row) {
            Ok(record) => records.push(record),
            Err(e) => tracing::warn!(table, error = %e, "Skipping undecodable row"),
        }
    }
    records
}

fn actor_row(row: &PgRow) -> Result<ActorRow, sqlx::Error> {
    ActorRow::from_row(row)
}

fn guild_row(row: &PgRow) -> Result<GuildRow, sqlx::Error> {
    GuildRow::from_row(row)
}

fn activity_row(row: &PgRow) -> Result<ActivityRow, sqlx::Error> {
    ActivityRow::from_row(row)
}

fn count_row(row: &PgRow) -> Result<i64, sqlx::Error> {
    sqlx::Row::try_get(row, 0)
}

fn origin_param(origin: &ServerId) -> SqlValue {
    SqlValue::from(origin.as_str())
}

fn settle_param(settle: Duration) -> SqlValue {
    SqlValue::Int(i64::try_from(settle.as_millis()).unwrap_or(i64::MAX))
}

/// Delta-scan filter shared by the three `*_changed_since` queries:
/// `$1` origin, `$2` checkpoint, `$3` settle lag in milliseconds.
fn changed_filter(stamp: &str) -> String {
    format!(
        "origin_server = $1 AND {stamp} > $2 \
         AND {stamp} <= clock_timestamp() - ($3::BIGINT * INTERVAL '1 millisecond')"
    )
}

/// [`StateRepository`] over the shared pool.
#[derive(Debug, Clone)]
pub struct PgStateStore {
    pool: PoolManager,
}

impl PgStateStore {
    /// Create a store bound to the pool.
    pub const fn new(pool: PoolManager) -> Self {
        Self { pool }
    }

    async fn count(&self, table: &str) -> Result<u64, DbError> {
        let sql = format!("SELECT COUNT(*) FROM {table}");
        let counts = self.pool.query(&sql, &[], count_row).await?;
        let total = counts.into_iter().next().unwrap_or(0);
        Ok(u64::try_from(total).unwrap_or(0))
    }
}

#[async_trait]
impl StateRepository for PgStateStore {
    async fn save_actor(&self, actor: &ActorState) -> Result<(), DbError> {
        self.pool.execute(ACTOR_UPSERT, &actor_params(actor)?).await?;
        tracing::debug!(actor_id = %actor.actor_id, "Saved actor state");
        Ok(())
    }

    async fn load_actor(&self, actor_id: ActorId) -> Result<Option<ActorState>, DbError> {
        let sql = format!("SELECT {ACTOR_COLUMNS} FROM actor_state WHERE actor_id = $1");
        let row = self
            .pool
            .query_optional(&sql, &[SqlValue::Uuid(actor_id.into_inner())], actor_row)
            .await?;
        row.map(ActorRow::into_record).transpose()
    }

    async fn apply_actor_if_newer(&self, actor: &ActorState) -> Result<bool, DbError> {
        let sql = format!("{ACTOR_UPSERT} WHERE actor_state.last_updated < EXCLUDED.last_updated");
        let affected = self.pool.execute(&sql, &actor_params(actor)?).await?;
        Ok(affected > 0)
    }

    async fn list_actors(&self) -> Result<Vec<ActorState>, DbError> {
        let sql = format!("SELECT {ACTOR_COLUMNS} FROM actor_state ORDER BY actor_id");
        let rows = self.pool.query(&sql, &[], actor_row).await?;
        Ok(decode_rows(rows, ActorRow::into_record, "actor_state"))
    }

    async fn actors_changed_since(
        &self,
        since: DateTime<Utc>,
        settle: Duration,
        origin: &ServerId,
        limit: usize,
    ) -> Result<Vec<Changed<ActorState>>, DbError> {
        let sql = format!(
            "SELECT {ACTOR_COLUMNS} FROM actor_state
             WHERE {}
             ORDER BY changed_at, actor_id
             LIMIT $4",
            changed_filter("changed_at")
        );
        let params = [
            origin_param(origin),
            SqlValue::Timestamp(since),
            settle_param(settle),
            SqlValue::Int(limit_to_db(limit)),
        ];
        let rows = self.pool.query(&sql, &params, actor_row).await?;
        Ok(decode_rows(rows, ActorRow::into_change, "actor_state"))
    }

    async fn count_actors(&self) -> Result<u64, DbError> {
        self.count("actor_state").await
    }

    async fn upsert_guild(&self, guild: &GuildRecord) -> Result<(), DbError> {
        let params = [
            SqlValue::Uuid(guild.guild_id.into_inner()),
            SqlValue::from(guild.name.as_str()),
            SqlValue::Uuid(guild.leader_id.into_inner()),
            SqlValue::Text(encode_json(&guild.members)?),
            SqlValue::Int(count_to_db(guild.stats.raids_completed)),
            SqlValue::Int(guild.stats.total_score),
            SqlValue::Int(count_to_db(guild.stats.level)),
            SqlValue::OptText(guild.origin_server.as_ref().map(|s| s.as_str().to_owned())),
            SqlValue::Timestamp(guild.created_at),
            SqlValue::Timestamp(guild.updated_at),
        ];
        self.pool
            .execute(
                r"INSERT INTO guilds (guild_id, name, leader_id, members, raids_completed, total_score, level, origin_server, created_at, updated_at)
                  VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                  ON CONFLICT (guild_id) DO UPDATE SET
                      name = EXCLUDED.name,
                      leader_id = EXCLUDED.leader_id,
                      members = EXCLUDED.members,
                      raids_completed = EXCLUDED.raids_completed,
                      total_score = EXCLUDED.total_score,
                      level = EXCLUDED.level,
                      origin_server = EXCLUDED.origin_server,
                      updated_at = EXCLUDED.updated_at,
                      changed_at = clock_timestamp()",
                &params,
            )
            .await
            .map_err(|e| match e {
                DbError::Conflict(_) => {
                    DbError::Conflict(format!("guild name already taken: {}", guild.name))
                }
                other => other,
            })?;
        tracing::debug!(guild_id = %guild.guild_id, "Upserted guild");
        Ok(())
    }

    async fn load_guild(&self, guild_id: GuildId) -> Result<Option<GuildRecord>, DbError> {
        let sql = format!("SELECT {GUILD_COLUMNS} FROM guilds WHERE guild_id = $1");
        let row = self
            .pool
            .query_optional(&sql, &[SqlValue::Uuid(guild_id.into_inner())], guild_row)
            .await?;
        row.map(GuildRow::into_record).transpose()
    }

    async fn find_guild_by_name(&self, name: &str) -> Result<Option<GuildRecord>, DbError> {
        let sql = format!("SELECT {GUILD_COLUMNS} FROM guilds WHERE name = $1");
        let row = self
            .pool
            .query_optional(&sql, &[SqlValue::from(name)], guild_row)
            .await?;
        row.map(GuildRow::into_record).transpose()
    }

    async fn list_guilds(&self) -> Result<Vec<GuildRecord>, DbError> {
        let sql = format!("SELECT {GUILD_COLUMNS} FROM guilds ORDER BY name");
        let rows = self.pool.query(&sql, &[], guild_row).await?;
        Ok(decode_rows(rows, GuildRow::into_record, "guilds"))
    }

    async fn guilds_changed_since(
        &self,
        since: DateTime<Utc>,
        settle: Duration,
        origin: &ServerId,
        limit: usize,
    ) -> Result<Vec<Changed<GuildRecord>>, DbError> {
        let sql = format!(
            "SELECT {GUILD_COLUMNS} FROM guilds
             WHERE {}
             ORDER BY changed_at, guild_id
             LIMIT $4",
            changed_filter("changed_at")
        );
        let params = [
            origin_param(origin),
            SqlValue::Timestamp(since),
            settle_param(settle),
            SqlValue::Int(limit_to_db(limit)),
        ];
        let rows = self.pool.query(&sql, &params, guild_row).await?;
        Ok(decode_rows(rows, GuildRow::into_change, "guilds"))
    }

    async fn count_guilds(&self) -> Result<u64, DbError> {
        self.count("guilds").await
    }

    async fn record_activity(&self, activity: &ActivityCompletion) -> Result<bool, DbError> {
        let params = [
            SqlValue::Uuid(activity.id.into_inner()),
            SqlValue::from(activity.activity_id.as_str()),
            SqlValue::Text(encode_json(&activity.participants)?),
            SqlValue::Timestamp(activity.started_at),
            SqlValue::Timestamp(activity.ended_at),
            SqlValue::Int(activity.duration_secs()),
            SqlValue::Int(activity.score),
            SqlValue::from(activity.tier.as_str()),
            SqlValue::Bool(activity.success),
            SqlValue::Bool(activity.flawless),
            SqlValue::OptText(activity.origin_server.as_ref().map(|s| s.as_str().to_owned())),
        ];
        let inserted = self
            .pool
            .execute(
                r"INSERT INTO activity_completions (id, activity_id, participants, started_at, ended_at, duration_secs, score, tier, success, flawless, origin_server)
                  VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                  ON CONFLICT (id) DO NOTHING",
                &params,
            )
            .await?;
        Ok(inserted > 0)
    }

    async fn activities_for(
        &self,
        actor_id: ActorId,
        limit: usize,
    ) -> Result<Vec<ActivityCompletion>, DbError> {
        let sql = format!(
            "SELECT {ACTIVITY_COLUMNS} FROM activity_completions
             WHERE participants::jsonb @> jsonb_build_array($1::TEXT)
             ORDER BY ended_at DESC
             LIMIT $2"
        );
        let params = [
            SqlValue::Text(actor_id.to_string()),
            SqlValue::Int(limit_to_db(limit)),
        ];
        let rows = self.pool.query(&sql, &params, activity_row).await?;
        Ok(decode_rows(rows, ActivityRow::into_record, "activity_completions"))
    }

    async fn list_activities(&self) -> Result<Vec<ActivityCompletion>, DbError> {
        let sql = format!("SELECT {ACTIVITY_COLUMNS} FROM activity_completions ORDER BY ended_at, id");
        let rows = self.pool.query(&sql, &[], activity_row).await?;
        Ok(decode_rows(rows, ActivityRow::into_record, "activity_completions"))
    }

    async fn activities_changed_since(
        &self,
        since: DateTime<Utc>,
        settle: Duration,
        origin: &ServerId,
        limit: usize,
    ) -> Result<Vec<Changed<ActivityCompletion>>, DbError> {
        let sql = format!(
            "SELECT {ACTIVITY_COLUMNS} FROM activity_completions
             WHERE {}
             ORDER BY recorded_at, id
             LIMIT $4",
            changed_filter("recorded_at")
        );
        let params = [
            origin_param(origin),
            SqlValue::Timestamp(since),
            settle_param(settle),
            SqlValue::Int(limit_to_db(limit)),
        ];
        let rows = self.pool.query(&sql, &params, activity_row).await?;
        Ok(decode_rows(rows, ActivityRow::into_change, "activity_completions"))
    }

    async fn count_activities(&self) -> Result<u64, DbError> {
        self.count("activity_completions").await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::arithmetic_side_effects)]
mod tests {
    use super::*;

    fn actor_row_fixture() -> ActorRow {
        ActorRow {
            actor_id: Uuid::now_v7(),
            display_name: "Sable".to_owned(),
            death_count: 3,
            kill_count: 12,
            raids_completed: 1,
            favor: -40,
            pledged_god: Some("FALLEN".to_owned()),
            banished: false,
            ascended: true,
            completed_activities: r#"["crypt-of-ash"]"#.to_owned(),
            cooldowns: r#"{"smite":"2026-01-02T03:04:05Z"}"#.to_owned(),
            origin_server: Some("alpha-1".to_owned()),
            last_updated: DateTime::UNIX_EPOCH,
            changed_at: DateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn actor_row_decodes_nested_columns() {
        let record = actor_row_fixture().into_record().unwrap();
        assert_eq!(record.death_count, 3);
        assert_eq!(record.pledged_god.as_deref(), Some("FALLEN"));
        assert!(record.completed_activities.contains("crypt-of-ash"));
        assert!(record.cooldowns.contains_key("smite"));
        assert_eq!(record.origin_server.map(|s| s.to_string()).as_deref(), Some("alpha-1"));
    }

    #[test]
    fn malformed_row_is_skipped_in_lists() {
        let mut broken = actor_row_fixture();
        broken.cooldowns = "not json".to_owned();
        let decoded = decode_rows(
            vec![actor_row_fixture(), broken],
            ActorRow::into_record,
            "actor_state",
        );
        assert_eq!(decoded.len(), 1);
    }

    #[test]
    fn unknown_tier_is_rejected() {
        let row = ActivityRow {
            id: Uuid::now_v7(),
            activity_id: "crypt-of-ash".to_owned(),
            participants: "[]".to_owned(),
            started_at: DateTime::UNIX_EPOCH,
            ended_at: DateTime::UNIX_EPOCH,
            score: 0,
            tier: "LEGENDARY".to_owned(),
            success: true,
            flawless: false,
            origin_server: None,
            recorded_at: DateTime::UNIX_EPOCH,
        };
        assert!(matches!(row.into_record(), Err(DbError::InvalidValue(_))));
    }

    #[test]
    fn change_carries_the_store_stamp() {
        let mut row = actor_row_fixture();
        row.last_updated = DateTime::UNIX_EPOCH + chrono::TimeDelta::hours(2);
        row.changed_at = DateTime::UNIX_EPOCH + chrono::TimeDelta::hours(1);
        let change = row.into_change().unwrap();
        assert_eq!(change.changed_at, DateTime::UNIX_EPOCH + chrono::TimeDelta::hours(1));
        assert_eq!(change.record.death_count, 3);
    }

    #[test]
    fn delta_filter_bounds_both_ends() {
        let filter = changed_filter("recorded_at");
        assert!(filter.contains("recorded_at > $2"));
        assert!(filter.contains("recorded_at <= clock_timestamp()"));
        assert_eq!(settle_param(Duration::from_secs(2)), SqlValue::Int(2_000));
    }

    #[test]
    fn actor_params_bind_in_column_order() {
        let actor = ActorState::new_default(ActorId::new());
        let params = actor_params(&actor).unwrap_or_default();
        assert_eq!(params.len(), 13);
        assert_eq!(params.get(9), Some(&SqlValue::Text("[]".to_owned())));
        assert_eq!(params.get(10), Some(&SqlValue::Text("{}".to_owned())));
    }
}
