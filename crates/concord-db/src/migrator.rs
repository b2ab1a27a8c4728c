//! Versioned schema migrator.
//!
//! The schema is an ordered list of named statements compiled into the
//! binary ([`MIGRATIONS`]). Applied names are recorded in the `migrations`
//! ledger table. On startup [`Migrator::run`] applies every unrecorded
//! migration in list order, each inside its own transaction together with
//! its ledger row, so a migration is never recorded without its effect.
//!
//! A failed migration aborts the sequence and disables the pool: the host
//! keeps running with store-backed features degraded.
//!
//! Concurrent startups on several servers serialize on a transaction-scoped
//! advisory lock; every statement is `IF NOT EXISTS` and the ledger insert
//! ignores duplicates, so the loser of the race re-applies nothing.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use concord_types::MigrationRecord;
use sqlx::Row;

use crate::error::DbError;
use crate::pool::{PoolManager, SqlValue, Statement};

const LEDGER_INSERT: &str =
    "INSERT INTO migrations (name, applied_at) VALUES ($1, now()) ON CONFLICT (name) DO NOTHING";

/// Advisory lock key held by the transaction applying a migration.
const MIGRATION_LOCK_KEY: i64 = 0x0063_6f6e_636f_7264;

/// One named schema change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Migration {
    /// Unique name; list order is lexical order of names.
    pub name: &'static str,
    /// DDL applied once.
    pub statement: &'static str,
}

const LEDGER_DDL: &str = r"CREATE TABLE IF NOT EXISTS migrations (
    name TEXT PRIMARY KEY,
    applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
)";

/// The full schema, in application order.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "0001_create_actor_state",
        statement: r"CREATE TABLE IF NOT EXISTS actor_state (
            actor_id UUID PRIMARY KEY,
            display_name TEXT NOT NULL DEFAULT '',
            death_count BIGINT NOT NULL DEFAULT 0,
            kill_count BIGINT NOT NULL DEFAULT 0,
            raids_completed BIGINT NOT NULL DEFAULT 0,
            favor BIGINT NOT NULL DEFAULT 0,
            pledged_god TEXT,
            banished BOOLEAN NOT NULL DEFAULT FALSE,
            ascended BOOLEAN NOT NULL DEFAULT FALSE,
            completed_activities TEXT NOT NULL DEFAULT '[]',
            cooldowns TEXT NOT NULL DEFAULT '{}',
            origin_server TEXT,
            last_updated TIMESTAMPTZ NOT NULL,
            changed_at TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp()
        )",
    },
    Migration {
        name: "0002_index_actor_state_origin_changed",
        statement: r"CREATE INDEX IF NOT EXISTS idx_actor_state_origin_changed
            ON actor_state (origin_server, changed_at)",
    },
    Migration {
        name: "0003_create_guilds",
        statement: r"CREATE TABLE IF NOT EXISTS guilds (
            guild_id UUID PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            leader_id UUID NOT NULL,
            members TEXT NOT NULL DEFAULT '[]',
            raids_completed BIGINT NOT NULL DEFAULT 0,
            total_score BIGINT NOT NULL DEFAULT 0,
            level BIGINT NOT NULL DEFAULT 0,
            origin_server TEXT,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            changed_at TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp()
        )",
    },
    Migration {
        name: "0004_index_guilds_origin_changed",
        statement: r"CREATE INDEX IF NOT EXISTS idx_guilds_origin_changed
            ON guilds (origin_server, changed_at)",
    },
    Migration {
        name: "0005_create_activity_completions",
        statement: r"CREATE TABLE IF NOT EXISTS activity_completions (
            id UUID PRIMARY KEY,
            activity_id TEXT NOT NULL,
            participants TEXT NOT NULL DEFAULT '[]',
            started_at TIMESTAMPTZ NOT NULL,
            ended_at TIMESTAMPTZ NOT NULL,
            duration_secs BIGINT NOT NULL DEFAULT 0,
            score BIGINT NOT NULL DEFAULT 0,
            tier TEXT NOT NULL,
            success BOOLEAN NOT NULL DEFAULT FALSE,
            flawless BOOLEAN NOT NULL DEFAULT FALSE,
            origin_server TEXT,
            recorded_at TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp()
        )",
    },
    Migration {
        name: "0006_index_activity_completions_activity",
        statement: r"CREATE INDEX IF NOT EXISTS idx_activity_completions_activity
            ON activity_completions (activity_id, ended_at)",
    },
    Migration {
        name: "0007_index_activity_completions_origin_recorded",
        statement: r"CREATE INDEX IF NOT EXISTS idx_activity_completions_origin_recorded
            ON activity_completions (origin_server, recorded_at)",
    },
    Migration {
        name: "0008_create_server_registry",
        statement: r"CREATE TABLE IF NOT EXISTS server_registry (
            server_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            address TEXT NOT NULL,
            port BIGINT NOT NULL,
            capacity BIGINT NOT NULL DEFAULT 0,
            current_load BIGINT NOT NULL DEFAULT 0,
            last_heartbeat TIMESTAMPTZ NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('ONLINE', 'OFFLINE'))
        )",
    },
    Migration {
        name: "0009_index_server_registry_status_heartbeat",
        statement: r"CREATE INDEX IF NOT EXISTS idx_server_registry_status_heartbeat
            ON server_registry (status, last_heartbeat)",
    },
    Migration {
        name: "0010_create_cross_server_sync",
        statement: r"CREATE TABLE IF NOT EXISTS cross_server_sync (
            id BIGSERIAL PRIMARY KEY,
            from_server TEXT NOT NULL,
            to_server TEXT NOT NULL,
            message_type TEXT NOT NULL,
            logical_key TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp(),
            processed BOOLEAN NOT NULL DEFAULT FALSE,
            processed_at TIMESTAMPTZ,
            attempts BIGINT NOT NULL DEFAULT 0,
            next_attempt_at TIMESTAMPTZ,
            last_error TEXT,
            dead_lettered BOOLEAN NOT NULL DEFAULT FALSE,
            claimed_until TIMESTAMPTZ
        )",
    },
    Migration {
        name: "0011_index_cross_server_sync_inbox",
        statement: r"CREATE INDEX IF NOT EXISTS idx_cross_server_sync_inbox
            ON cross_server_sync (to_server, processed, dead_lettered, created_at)",
    },
    Migration {
        name: "0012_index_cross_server_sync_logical_key",
        statement: r"CREATE INDEX IF NOT EXISTS idx_cross_server_sync_logical_key
            ON cross_server_sync (to_server, logical_key)",
    },
    Migration {
        name: "0013_create_sync_checkpoints",
        statement: r"CREATE TABLE IF NOT EXISTS sync_checkpoints (
            server_id TEXT NOT NULL,
            entity TEXT NOT NULL,
            checkpoint TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (server_id, entity)
        )",
    },
];

/// Lifecycle of a single migration during one [`Migrator::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    /// Not yet applied.
    Pending,
    /// Transaction in progress.
    Applying,
    /// Statement and ledger row committed (now or in an earlier run).
    Applied,
    /// Transaction failed; the sequence stopped here.
    Aborted,
}

/// Summary of a completed [`Migrator::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Names applied by this run, in order.
    pub applied: Vec<&'static str>,
    /// Number of migrations that were already recorded.
    pub already_applied: usize,
    /// `true` when the store is disabled and nothing was attempted.
    pub skipped: bool,
}

/// Select the migrations from `list` whose names are not in `applied`,
/// preserving list order.
pub fn pending_migrations<'m>(
    list: &'m [Migration],
    applied: &HashSet<String>,
) -> Vec<&'m Migration> {
    list.iter()
        .filter(|migration| !applied.contains(migration.name))
        .collect()
}

/// Where migrations are applied: the pool in production.
#[async_trait]
pub trait SchemaTarget: Send + Sync {
    /// Whether statements reach a store.
    fn is_enabled(&self) -> bool;

    /// Stop store-backed features after a failed migration.
    fn disable(&self, reason: &str);

    /// Run `statements` in one transaction.
    async fn execute_batch(&self, statements: &[Statement]) -> Result<u64, DbError>;

    /// The `migrations` ledger ordered by name.
    async fn ledger(&self) -> Result<Vec<MigrationRecord>, DbError>;
}

#[async_trait]
impl SchemaTarget for PoolManager {
    fn is_enabled(&self) -> bool {
        Self::is_enabled(self)
    }

    fn disable(&self, reason: &str) {
        Self::disable(self, reason);
    }

    async fn execute_batch(&self, statements: &[Statement]) -> Result<u64, DbError> {
        Self::execute_batch(self, statements).await
    }

    async fn ledger(&self) -> Result<Vec<MigrationRecord>, DbError> {
        self.query(
            "SELECT name, applied_at FROM migrations ORDER BY name",
            &[],
            |row| {
                Ok(MigrationRecord {
                    name: row.try_get("name")?,
                    applied_at: row.try_get("applied_at")?,
                })
            },
        )
        .await
    }
}

/// Applies [`Migration`]s to a [`SchemaTarget`].
pub struct Migrator<'a> {
    pool: &'a dyn SchemaTarget,
    migrations: &'a [Migration],
    progress: Mutex<Vec<(&'static str, MigrationState)>>,
}

impl<'a> Migrator<'a> {
    /// Create a migrator for the compiled schema.
    pub fn new(pool: &'a dyn SchemaTarget) -> Self {
        Self::with_migrations(pool, MIGRATIONS)
    }

    /// Create a migrator for an explicit migration list.
    pub fn with_migrations(pool: &'a dyn SchemaTarget, migrations: &'a [Migration]) -> Self {
        Self {
            pool,
            migrations,
            progress: Mutex::new(
                migrations
                    .iter()
                    .map(|m| (m.name, MigrationState::Pending))
                    .collect(),
            ),
        }
    }

    /// Current state of every migration in the list.
    pub fn progress(&self) -> Vec<(&'static str, MigrationState)> {
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_state(&self, name: &str, state: MigrationState) {
        let mut progress = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = progress.iter_mut().find(|(n, _)| *n == name) {
            entry.1 = state;
        }
    }

    /// Apply every unrecorded migration in order.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Migration`] naming the first migration that failed.
    /// The pool is disabled before returning.
    pub async fn run(&self) -> Result<MigrationReport, DbError> {
        if !self.pool.is_enabled() {
            tracing::warn!("store disabled, schema migrations skipped");
            return Ok(MigrationReport {
                skipped: true,
                ..MigrationReport::default()
            });
        }

        let ledger = [
            Self::lock_statement(),
            Statement::new(LEDGER_DDL, Vec::new()),
        ];
        if let Err(e) = self.pool.execute_batch(&ledger).await {
            return Err(self.abort("migrations", &e));
        }

        let applied: HashSet<String> = match self.applied().await {
            Ok(records) => records.into_iter().map(|r| r.name).collect(),
            Err(e) => return Err(self.abort("migrations", &e)),
        };

        let plan = pending_migrations(self.migrations, &applied);
        let mut report = MigrationReport {
            already_applied: self.migrations.len().saturating_sub(plan.len()),
            ..MigrationReport::default()
        };
        for migration in self.migrations {
            if applied.contains(migration.name) {
                self.set_state(migration.name, MigrationState::Applied);
            }
        }

        for migration in plan {
            self.set_state(migration.name, MigrationState::Applying);
            tracing::info!(migration = migration.name, "Applying schema migration");

            let batch = [
                Self::lock_statement(),
                Statement::new(migration.statement, Vec::new()),
                Statement::new(LEDGER_INSERT, vec![SqlValue::from(migration.name)]),
            ];

            if let Err(e) = self.pool.execute_batch(&batch).await {
                self.set_state(migration.name, MigrationState::Aborted);
                return Err(self.abort(migration.name, &e));
            }

            self.set_state(migration.name, MigrationState::Applied);
            report.applied.push(migration.name);
        }

        tracing::info!(
            applied = report.applied.len(),
            already_applied = report.already_applied,
            "Schema up to date"
        );
        Ok(report)
    }

    fn lock_statement() -> Statement {
        Statement::new(
            "SELECT pg_advisory_xact_lock($1)",
            vec![SqlValue::Int(MIGRATION_LOCK_KEY)],
        )
    }

    fn abort(&self, name: &str, cause: &DbError) -> DbError {
        tracing::error!(migration = name, error = %cause, "Schema migration failed");
        self.pool
            .disable(&format!("schema migration {name} failed: {cause}"));
        DbError::Migration {
            name: name.to_owned(),
            message: cause.to_string(),
        }
    }

    /// The ledger, in application order.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the ledger cannot be read.
    pub async fn applied(&self) -> Result<Vec<MigrationRecord>, DbError> {
        self.pool.ledger().await
    }
}

impl std::fmt::Debug for Migrator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migrator")
            .field("migrations", &self.migrations.len())
            .field("progress", &self.progress())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use chrono::Utc;

    use super::*;
    use crate::executor::ExecutorConfig;

    /// Ledger kept in memory; a batch containing `FAIL` rolls back.
    #[derive(Default)]
    struct LedgerTarget {
        ledger: Mutex<Vec<MigrationRecord>>,
        disabled: AtomicBool,
    }

    impl LedgerTarget {
        fn names(&self) -> Vec<String> {
            self.ledger
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .map(|r| r.name.clone())
                .collect()
        }
    }

    #[async_trait]
    impl SchemaTarget for LedgerTarget {
        fn is_enabled(&self) -> bool {
            !self.disabled.load(Ordering::Acquire)
        }

        fn disable(&self, _reason: &str) {
            self.disabled.store(true, Ordering::Release);
        }

        async fn execute_batch(&self, statements: &[Statement]) -> Result<u64, DbError> {
            if statements.iter().any(|s| s.sql.contains("FAIL")) {
                return Err(DbError::InvalidValue("syntax error at or near FAIL".to_owned()));
            }
            let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
            for statement in statements {
                if statement.sql != LEDGER_INSERT {
                    continue;
                }
                if let Some(SqlValue::Text(name)) = statement.params.first() {
                    if !ledger.iter().any(|r| &r.name == name) {
                        ledger.push(MigrationRecord {
                            name: name.clone(),
                            applied_at: Utc::now(),
                        });
                    }
                }
            }
            ledger.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(0)
        }

        async fn ledger(&self) -> Result<Vec<MigrationRecord>, DbError> {
            Ok(self.ledger.lock().unwrap_or_else(PoisonError::into_inner).clone())
        }
    }

    const BROKEN: &[Migration] = &[
        Migration {
            name: "0001_create_a",
            statement: "CREATE TABLE IF NOT EXISTS a (id BIGINT)",
        },
        Migration {
            name: "0002_broken",
            statement: "CREATE TABLE IF NOT EXISTS FAIL",
        },
        Migration {
            name: "0003_create_c",
            statement: "CREATE TABLE IF NOT EXISTS c (id BIGINT)",
        },
    ];

    #[test]
    fn names_are_unique_and_sorted() {
        let names: Vec<&str> = MIGRATIONS.iter().map(|m| m.name).collect();
        let mut sorted = names.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(names, sorted);
    }

    #[test]
    fn every_statement_is_rerunnable() {
        for migration in MIGRATIONS {
            assert!(
                migration.statement.contains("IF NOT EXISTS"),
                "{} is not idempotent",
                migration.name
            );
        }
    }

    #[test]
    fn plan_skips_recorded_names_in_order() {
        let applied: HashSet<String> = ["0001_create_actor_state", "0003_create_guilds"]
            .into_iter()
            .map(str::to_owned)
            .collect();
        let plan = pending_migrations(MIGRATIONS, &applied);
        assert_eq!(plan.len(), MIGRATIONS.len().saturating_sub(2));
        assert_eq!(
            plan.first().map(|m| m.name),
            Some("0002_index_actor_state_origin_changed")
        );
        assert!(plan.iter().all(|m| !applied.contains(m.name)));
    }

    #[test]
    fn plan_is_empty_once_everything_is_recorded() {
        let applied: HashSet<String> = MIGRATIONS.iter().map(|m| m.name.to_owned()).collect();
        assert!(pending_migrations(MIGRATIONS, &applied).is_empty());
    }

    #[tokio::test]
    async fn disabled_pool_skips_migrations() {
        let pool = PoolManager::disabled("test", &ExecutorConfig::default());
        let migrator = Migrator::new(&pool);
        let report = migrator.run().await;
        assert!(report.is_ok_and(|r| r.skipped && r.applied.is_empty()));
        assert!(
            migrator
                .progress()
                .iter()
                .all(|(_, state)| *state == MigrationState::Pending)
        );
    }

    #[tokio::test]
    async fn second_run_applies_nothing_and_records_each_name_once() {
        let target = LedgerTarget::default();

        let first = Migrator::new(&target).run().await;
        assert!(first.is_ok_and(|r| r.applied.len() == MIGRATIONS.len()));

        let migrator = Migrator::new(&target);
        let second = migrator.run().await;
        assert!(second.is_ok_and(|r| r.applied.is_empty() && r.already_applied == MIGRATIONS.len()));
        assert!(
            migrator
                .progress()
                .iter()
                .all(|(_, state)| *state == MigrationState::Applied)
        );

        let expected: Vec<String> = MIGRATIONS.iter().map(|m| m.name.to_owned()).collect();
        assert_eq!(target.names(), expected);
        assert!(target.is_enabled());
    }

    #[tokio::test]
    async fn failed_migration_aborts_and_disables_the_target() {
        let target = LedgerTarget::default();
        let migrator = Migrator::with_migrations(&target, BROKEN);

        let result = migrator.run().await;
        assert!(matches!(result, Err(DbError::Migration { ref name, .. }) if name == "0002_broken"));
        assert_eq!(
            migrator.progress(),
            vec![
                ("0001_create_a", MigrationState::Applied),
                ("0002_broken", MigrationState::Aborted),
                ("0003_create_c", MigrationState::Pending),
            ]
        );
        assert_eq!(target.names(), vec!["0001_create_a".to_owned()]);
        assert!(!target.is_enabled());

        let after = Migrator::with_migrations(&target, BROKEN).run().await;
        assert!(after.is_ok_and(|r| r.skipped));
    }
}
