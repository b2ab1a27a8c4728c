//! The legacy migration tool.
//!
//! `migrate_all` runs four steps and never raises on partial failure:
//!
//! 1. **Snapshot**: back up the legacy files (and the store, if enabled).
//!    A failed snapshot aborts the whole run.
//! 2. **Transform**: parse each file into its relational record. Files
//!    that fail are logged and counted, the batch continues.
//! 3. **Load**: write every record through the state repository with the
//!    same rules a peer's delta gets, counting successes and failures per
//!    category. A stored actor that is newer than its file is kept, and a
//!    guild file is merged into the stored guild, so rerunning the import
//!    after the server went live never rolls live data back.
//! 4. **Validate**: compare legacy file counts with relational row counts.
//!
//! File reads and writes run on tokio's blocking pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use concord_core::merge::merge_guild;
use concord_db::StateRepository;
use concord_types::{ActorState, GuildRecord};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::backup::{BackupManifest, StoreDump, write_backup};
use crate::error::LegacyError;
use crate::files::{Category, LegacyStore, Loaded};
use crate::format::{LegacyGuild, LegacyPlayer, LegacyRaid};

/// Per-category migration counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CategoryCounts {
    /// Legacy files found.
    pub found: usize,
    /// Records written to the store.
    pub migrated: usize,
    /// Files that failed to parse, convert, or load.
    pub failed: usize,
}

impl CategoryCounts {
    fn migrated_one(&mut self) {
        self.migrated = self.migrated.saturating_add(1);
    }

    fn failed_one(&mut self) {
        self.failed = self.failed.saturating_add(1);
    }
}

/// Legacy and relational counts for one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CategoryValidation {
    /// Category compared.
    pub category: Category,
    /// Record files in the legacy store.
    pub legacy: usize,
    /// Rows in the relational store.
    pub relational: u64,
}

impl CategoryValidation {
    /// Whether both sides hold the same number of records.
    pub fn matches(&self) -> bool {
        u64::try_from(self.legacy).is_ok_and(|legacy| legacy == self.relational)
    }
}

/// Result of comparing the two representations. Mismatches are warnings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    /// One entry per category.
    pub categories: Vec<CategoryValidation>,
}

impl ValidationReport {
    /// Categories whose counts differ.
    pub fn discrepancies(&self) -> impl Iterator<Item = &CategoryValidation> {
        self.categories.iter().filter(|c| !c.matches())
    }

    /// Whether every category matches.
    pub fn is_consistent(&self) -> bool {
        self.discrepancies().next().is_none()
    }
}

/// Counts of a completed migration run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationSummary {
    /// Snapshot taken before loading.
    pub backup: BackupManifest,
    /// Player files.
    pub actors: CategoryCounts,
    /// Guild files.
    pub guilds: CategoryCounts,
    /// Raid files.
    pub activities: CategoryCounts,
    /// Post-load count comparison.
    pub validation: ValidationReport,
}

/// Outcome of [`MigrationTool::migrate_all`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// The run finished; individual records may still have failed.
    Completed(Box<MigrationSummary>),
    /// Nothing was migrated.
    Failed {
        /// Why the run could not proceed.
        reason: String,
    },
}

impl MigrationOutcome {
    /// The summary of a completed run.
    pub fn summary(&self) -> Option<&MigrationSummary> {
        match self {
            Self::Completed(summary) => Some(summary.as_ref()),
            Self::Failed { .. } => None,
        }
    }
}

/// Records written by [`MigrationTool::export_to_legacy`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExportSummary {
    /// Player files written.
    pub actors: usize,
    /// Guild files written.
    pub guilds: usize,
    /// Raid files written.
    pub activities: usize,
}

/// Run a file step on the blocking pool.
async fn blocking<T, F>(step: F) -> Result<T, LegacyError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, LegacyError> + Send + 'static,
{
    tokio::task::spawn_blocking(step).await?
}

async fn open_legacy(root: &Path) -> Result<LegacyStore, LegacyError> {
    let root = root.to_path_buf();
    blocking(move || LegacyStore::open(root)).await
}

async fn read_category<T>(legacy: &LegacyStore, category: Category) -> Result<Loaded<T>, LegacyError>
where
    T: DeserializeOwned + Send + 'static,
{
    let legacy = legacy.clone();
    blocking(move || legacy.load::<T>(category)).await
}

/// Moves records between the legacy file store and the relational store.
pub struct MigrationTool {
    legacy_root: PathBuf,
    backup_dir: PathBuf,
    state: Arc<dyn StateRepository>,
    store_enabled: bool,
}

impl MigrationTool {
    /// Create a tool over `legacy_root`, writing backups under
    /// `backup_dir`. `store_enabled` reflects whether the pool is live.
    pub fn new(
        legacy_root: impl Into<PathBuf>,
        backup_dir: impl Into<PathBuf>,
        state: Arc<dyn StateRepository>,
        store_enabled: bool,
    ) -> Self {
        Self {
            legacy_root: legacy_root.into(),
            backup_dir: backup_dir.into(),
            state,
            store_enabled,
        }
    }

    /// Snapshot, transform, load, and validate every legacy record.
    pub async fn migrate_all(&self) -> MigrationOutcome {
        let legacy = match open_legacy(&self.legacy_root).await {
            Ok(legacy) => legacy,
            Err(e) => return Self::failed(&e.to_string()),
        };
        if !self.store_enabled {
            return Self::failed("relational store is disabled");
        }

        let backup = match self.snapshot(&legacy, "pre-migration").await {
            Ok(manifest) => manifest,
            Err(e) => return Self::failed(&format!("snapshot failed: {e}")),
        };

        let (actors, guilds, activities) = match self.load_all(&legacy).await {
            Ok(counts) => counts,
            Err(e) => return Self::failed(&e.to_string()),
        };
        let validation = match self.validate_against(&legacy).await {
            Ok(report) => report,
            Err(e) => return Self::failed(&format!("validation failed: {e}")),
        };
        for mismatch in validation.discrepancies() {
            tracing::warn!(
                category = %mismatch.category,
                legacy = mismatch.legacy,
                relational = mismatch.relational,
                "Record count mismatch after migration"
            );
        }

        tracing::info!(
            backup_id = %backup.backup_id,
            actors = actors.migrated,
            guilds = guilds.migrated,
            activities = activities.migrated,
            failed = actors.failed.saturating_add(guilds.failed).saturating_add(activities.failed),
            "Legacy migration complete"
        );
        MigrationOutcome::Completed(Box::new(MigrationSummary {
            backup,
            actors,
            guilds,
            activities,
            validation,
        }))
    }

    fn failed(reason: &str) -> MigrationOutcome {
        tracing::error!(reason, "Legacy migration failed");
        MigrationOutcome::Failed {
            reason: reason.to_owned(),
        }
    }

    async fn load_all(
        &self,
        legacy: &LegacyStore,
    ) -> Result<(CategoryCounts, CategoryCounts, CategoryCounts), LegacyError> {
        let players = read_category::<LegacyPlayer>(legacy, Category::Actor).await?;
        let mut actors = CategoryCounts {
            found: players.records.len().saturating_add(players.failures.len()),
            failed: players.failures.len(),
            ..CategoryCounts::default()
        };
        for (path, player) in players.records {
            let result = match player.into_actor() {
                Ok(actor) => self.import_actor(&actor).await,
                Err(e) => Err(e),
            };
            tally(&mut actors, Category::Actor, &path, result);
        }

        let files = read_category::<LegacyGuild>(legacy, Category::Guild).await?;
        let mut guilds = CategoryCounts {
            found: files.records.len().saturating_add(files.failures.len()),
            failed: files.failures.len(),
            ..CategoryCounts::default()
        };
        for (path, guild) in files.records {
            let result = match guild.into_guild() {
                Ok(guild) => self.import_guild(&guild).await,
                Err(e) => Err(e),
            };
            tally(&mut guilds, Category::Guild, &path, result);
        }

        let raids = read_category::<LegacyRaid>(legacy, Category::Activity).await?;
        let mut activities = CategoryCounts {
            found: raids.records.len().saturating_add(raids.failures.len()),
            failed: raids.failures.len(),
            ..CategoryCounts::default()
        };
        for (path, raid) in raids.records {
            let result = match raid.into_activity() {
                // Already present counts as migrated; the import is rerunnable.
                Ok(activity) => self
                    .state
                    .record_activity(&activity)
                    .await
                    .map(|_| ())
                    .map_err(LegacyError::from),
                Err(e) => Err(e),
            };
            tally(&mut activities, Category::Activity, &path, result);
        }

        Ok((actors, guilds, activities))
    }

    /// Write `actor` unless the stored record is as new or newer. A kept
    /// record still counts as migrated.
    async fn import_actor(&self, actor: &ActorState) -> Result<(), LegacyError> {
        if !self.state.apply_actor_if_newer(actor).await? {
            tracing::debug!(actor_id = %actor.actor_id, "Stored actor is newer than its legacy file, kept");
        }
        Ok(())
    }

    /// Merge `guild` into the stored guild.
    async fn import_guild(&self, guild: &GuildRecord) -> Result<(), LegacyError> {
        let current = self.state.load_guild(guild.guild_id).await?;
        match merge_guild(current.as_ref(), guild) {
            Some(merged) => self.state.upsert_guild(&merged).await?,
            None => {
                tracing::debug!(guild_id = %guild.guild_id, "Stored guild already reflects its legacy file");
            }
        }
        Ok(())
    }

    async fn snapshot(&self, legacy: &LegacyStore, name: &str) -> Result<BackupManifest, LegacyError> {
        let dump = if self.store_enabled {
            Some(StoreDump::capture(self.state.as_ref()).await?)
        } else {
            None
        };
        let backup_dir = self.backup_dir.clone();
        let legacy = legacy.clone();
        let name = name.to_owned();
        blocking(move || write_backup(&backup_dir, &name, Some(&legacy), dump.as_ref(), Utc::now())).await
    }

    /// Write every relational record into `dir` in the legacy layout.
    pub async fn export_to_legacy(&self, dir: &Path) -> Result<ExportSummary, LegacyError> {
        let actors = self.state.list_actors().await?;
        let guilds = self.state.list_guilds().await?;
        let activities = self.state.list_activities().await?;

        let root = dir.to_path_buf();
        let summary = blocking(move || {
            let target = LegacyStore::create(root)?;
            for actor in &actors {
                target.write(Category::Actor, actor.actor_id.into_inner(), &LegacyPlayer::from_actor(actor))?;
            }
            for guild in &guilds {
                target.write(Category::Guild, guild.guild_id.into_inner(), &LegacyGuild::from_guild(guild))?;
            }
            for activity in &activities {
                target.write(
                    Category::Activity,
                    activity.id.into_inner(),
                    &LegacyRaid::from_activity(activity),
                )?;
            }
            Ok(ExportSummary {
                actors: actors.len(),
                guilds: guilds.len(),
                activities: activities.len(),
            })
        })
        .await?;

        tracing::info!(
            dir = %dir.display(),
            actors = summary.actors,
            guilds = summary.guilds,
            activities = summary.activities,
            "Exported store to legacy layout"
        );
        Ok(summary)
    }

    /// Back up the legacy files and, when the store is enabled, a dump of
    /// every relational record.
    pub async fn create_backup(&self, name: &str) -> Result<BackupManifest, LegacyError> {
        let legacy = open_legacy(&self.legacy_root).await?;
        self.snapshot(&legacy, name).await
    }

    /// Compare legacy file counts with relational row counts.
    pub async fn validate(&self) -> Result<ValidationReport, LegacyError> {
        let legacy = open_legacy(&self.legacy_root).await?;
        self.validate_against(&legacy).await
    }

    async fn validate_against(&self, legacy: &LegacyStore) -> Result<ValidationReport, LegacyError> {
        let files = legacy.clone();
        let legacy_counts = blocking(move || {
            Category::ALL
                .into_iter()
                .map(|category| files.count(category))
                .collect::<Result<Vec<usize>, LegacyError>>()
        })
        .await?;

        let mut categories = Vec::with_capacity(Category::ALL.len());
        for (category, legacy) in Category::ALL.into_iter().zip(legacy_counts) {
            let relational = match category {
                Category::Actor => self.state.count_actors().await?,
                Category::Guild => self.state.count_guilds().await?,
                Category::Activity => self.state.count_activities().await?,
            };
            categories.push(CategoryValidation {
                category,
                legacy,
                relational,
            });
        }
        Ok(ValidationReport { categories })
    }
}

fn tally(counts: &mut CategoryCounts, category: Category, path: &Path, result: Result<(), LegacyError>) {
    match result {
        Ok(()) => counts.migrated_one(),
        Err(e) => {
            tracing::warn!(category = %category, file = %path.display(), error = %e, "Legacy record not migrated");
            counts.failed_one();
        }
    }
}

impl std::fmt::Debug for MigrationTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationTool")
            .field("legacy_root", &self.legacy_root)
            .field("backup_dir", &self.backup_dir)
            .field("store_enabled", &self.store_enabled)
            .finish_non_exhaustive()
    }
}
