//! Timestamped snapshots of the legacy files and the relational store.
//!
//! ```text
//! <backup_dir>/<backup_id>/
//!   manifest.json
//!   legacy/...        copy of the legacy root
//!   store_dump.json   all actors, guilds, activities (store enabled only)
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use concord_db::StateRepository;
use concord_types::{ActivityCompletion, ActorState, GuildRecord};
use serde::{Deserialize, Serialize};

use crate::error::LegacyError;
use crate::files::LegacyStore;

const MANIFEST_FILE: &str = "manifest.json";
const STORE_DUMP_FILE: &str = "store_dump.json";
const LEGACY_DIR: &str = "legacy";

/// Every relational record, as written to `store_dump.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDump {
    /// Actor records.
    pub actors: Vec<ActorState>,
    /// Guild records.
    pub guilds: Vec<GuildRecord>,
    /// Activity completions.
    pub activities: Vec<ActivityCompletion>,
}

impl StoreDump {
    /// Read every record from the store.
    pub async fn capture(state: &dyn StateRepository) -> Result<Self, LegacyError> {
        Ok(Self {
            actors: state.list_actors().await?,
            guilds: state.list_guilds().await?,
            activities: state.list_activities().await?,
        })
    }
}

/// Description of one backup, written as `manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    /// Directory name under the backup root.
    pub backup_id: String,
    /// When the backup was taken.
    pub created_at: DateTime<Utc>,
    /// Legacy root that was copied, if any.
    pub legacy_root: Option<PathBuf>,
    /// Legacy files copied.
    pub files_copied: usize,
    /// Whether `store_dump.json` was written.
    pub store_dump: bool,
}

/// `{name}-{YYYYMMDDTHHMMSSmmmZ}` with `name` reduced to `[A-Za-z0-9_-]`.
pub fn backup_id(name: &str, now: DateTime<Utc>) -> String {
    let clean: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    let clean = if clean.is_empty() { "backup".to_owned() } else { clean };
    format!("{clean}-{}", now.format("%Y%m%dT%H%M%S%3fZ"))
}

/// Write a backup into a fresh directory under `backup_dir`.
///
/// # Errors
///
/// Fails if the target directory already exists or any copy fails; a
/// failed backup may leave a partial directory behind.
pub fn write_backup(
    backup_dir: &Path,
    name: &str,
    legacy: Option<&LegacyStore>,
    dump: Option<&StoreDump>,
    now: DateTime<Utc>,
) -> Result<BackupManifest, LegacyError> {
    let id = backup_id(name, now);
    fs::create_dir_all(backup_dir).map_err(|e| LegacyError::io(backup_dir, e))?;
    let target = backup_dir.join(&id);
    fs::create_dir(&target).map_err(|e| LegacyError::io(&target, e))?;

    let mut files_copied: usize = 0;
    if let Some(legacy) = legacy {
        for relative in legacy.all_files()? {
            let from = legacy.root().join(&relative);
            let to = target.join(LEGACY_DIR).join(&relative);
            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent).map_err(|e| LegacyError::io(parent, e))?;
            }
            fs::copy(&from, &to).map_err(|e| LegacyError::io(&from, e))?;
            files_copied = files_copied.saturating_add(1);
        }
    }

    if let Some(dump) = dump {
        write_json(&target.join(STORE_DUMP_FILE), dump)?;
    }

    let manifest = BackupManifest {
        backup_id: id,
        created_at: now,
        legacy_root: legacy.map(|l| l.root().to_path_buf()),
        files_copied,
        store_dump: dump.is_some(),
    };
    write_json(&target.join(MANIFEST_FILE), &manifest)?;

    tracing::info!(
        backup_id = %manifest.backup_id,
        files_copied,
        store_dump = manifest.store_dump,
        "Backup written"
    );
    Ok(manifest)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), LegacyError> {
    let text = serde_json::to_string_pretty(value)?;
    fs::write(path, text).map_err(|e| LegacyError::io(path, e))
}
