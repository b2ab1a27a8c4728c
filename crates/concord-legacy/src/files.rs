//! The legacy file store: one YAML document per record.
//!
//! ```text
//! <root>/
//!   players/<uuid>.yml
//!   guilds/<uuid>.yml
//!   raids/<uuid>.yml
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::error::LegacyError;

const RECORD_EXTENSION: &str = "yml";

/// Record category, one subdirectory each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// `players/`
    Actor,
    /// `guilds/`
    Guild,
    /// `raids/`
    Activity,
}

impl Category {
    /// Every category, in load order.
    pub const ALL: [Self; 3] = [Self::Actor, Self::Guild, Self::Activity];

    /// Subdirectory holding this category's files.
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::Actor => "players",
            Self::Guild => "guilds",
            Self::Activity => "raids",
        }
    }

    /// Label used in reports and logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Actor => "actor",
            Self::Guild => "guild",
            Self::Activity => "activity",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed documents of one category plus the files that failed to parse.
#[derive(Debug)]
pub struct Loaded<T> {
    /// Successfully parsed documents with their source files.
    pub records: Vec<(PathBuf, T)>,
    /// One error per file that could not be read or parsed.
    pub failures: Vec<LegacyError>,
}

/// Handle on a legacy data directory.
#[derive(Debug, Clone)]
pub struct LegacyStore {
    root: PathBuf,
}

impl LegacyStore {
    /// Open an existing legacy root.
    ///
    /// # Errors
    ///
    /// Returns [`LegacyError::Unreadable`] if `root` is missing or not a
    /// directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, LegacyError> {
        let root = root.into();
        match fs::metadata(&root) {
            Ok(meta) if meta.is_dir() => Ok(Self { root }),
            Ok(_) => Err(LegacyError::Unreadable {
                source: std::io::Error::new(std::io::ErrorKind::NotADirectory, "not a directory"),
                path: root,
            }),
            Err(source) => Err(LegacyError::Unreadable { path: root, source }),
        }
    }

    /// Create (or reuse) a legacy root with all category directories.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self, LegacyError> {
        let root = root.into();
        for category in Category::ALL {
            let dir = root.join(category.dir_name());
            fs::create_dir_all(&dir).map_err(|e| LegacyError::io(&dir, e))?;
        }
        Ok(Self { root })
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn category_dir(&self, category: Category) -> PathBuf {
        self.root.join(category.dir_name())
    }

    /// Record files of `category`, sorted by name. A missing category
    /// directory holds no records.
    pub fn record_files(&self, category: Category) -> Result<Vec<PathBuf>, LegacyError> {
        let dir = self.category_dir(category);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(LegacyError::io(&dir, e)),
        };

        let mut files = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| LegacyError::io(&dir, e))?.path();
            let is_record = path.is_file()
                && path
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case(RECORD_EXTENSION));
            if is_record {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Number of record files in `category`.
    pub fn count(&self, category: Category) -> Result<usize, LegacyError> {
        Ok(self.record_files(category)?.len())
    }

    /// Parse every document of `category`. Unparseable files are collected
    /// in [`Loaded::failures`] instead of failing the load.
    pub fn load<T: DeserializeOwned>(&self, category: Category) -> Result<Loaded<T>, LegacyError> {
        let mut loaded = Loaded {
            records: Vec::new(),
            failures: Vec::new(),
        };
        for path in self.record_files(category)? {
            match read_document(&path) {
                Ok(record) => loaded.records.push((path, record)),
                Err(e) => {
                    tracing::warn!(category = %category, error = %e, "Skipping unreadable legacy record");
                    loaded.failures.push(e);
                }
            }
        }
        Ok(loaded)
    }

    /// Write one document as `<category>/<id>.yml`, replacing any existing
    /// file atomically.
    pub fn write<T: Serialize>(
        &self,
        category: Category,
        id: Uuid,
        record: &T,
    ) -> Result<PathBuf, LegacyError> {
        let dir = self.category_dir(category);
        fs::create_dir_all(&dir).map_err(|e| LegacyError::io(&dir, e))?;
        let path = dir.join(format!("{id}.{RECORD_EXTENSION}"));
        let staging = dir.join(format!(".{id}.{RECORD_EXTENSION}.tmp"));

        let text = serde_yml::to_string(record)?;
        fs::write(&staging, text).map_err(|e| LegacyError::io(&staging, e))?;
        fs::rename(&staging, &path).map_err(|e| LegacyError::io(&path, e))?;
        Ok(path)
    }

    /// Every regular file under the root, relative to it, sorted.
    pub fn all_files(&self) -> Result<Vec<PathBuf>, LegacyError> {
        let mut files = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            for entry in fs::read_dir(&dir).map_err(|e| LegacyError::io(&dir, e))? {
                let path = entry.map_err(|e| LegacyError::io(&dir, e))?.path();
                if path.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.root) {
                    files.push(relative.to_path_buf());
                }
            }
        }
        files.sort();
        Ok(files)
    }
}

fn read_document<T: DeserializeOwned>(path: &Path) -> Result<T, LegacyError> {
    let text = fs::read_to_string(path).map_err(|e| LegacyError::io(path, e))?;
    serde_yml::from_str(&text).map_err(|e| LegacyError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::format::LegacyPlayer;

    #[test]
    fn missing_root_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let err = LegacyStore::open(dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, LegacyError::Unreadable { .. }));
    }

    #[test]
    fn load_skips_bad_documents() {
        let dir = tempfile::tempdir().unwrap();
        let store = LegacyStore::create(dir.path()).unwrap();
        let players = dir.path().join("players");
        fs::write(
            players.join("a.yml"),
            "uuid: 7f3c2a34-0d7e-4a7c-9d57-2b8f3e1c0a11\nname: Mirelle\n",
        )
        .unwrap();
        fs::write(players.join("b.yml"), "uuid: [not, a, uuid]\n").unwrap();
        fs::write(players.join("notes.txt"), "ignored").unwrap();

        let loaded: Loaded<LegacyPlayer> = store.load(Category::Actor).unwrap();
        assert_eq!(loaded.records.len(), 1);
        assert_eq!(loaded.failures.len(), 1);
        assert_eq!(store.count(Category::Actor).unwrap(), 2);
        assert_eq!(store.count(Category::Guild).unwrap(), 0);
    }

    #[test]
    fn write_then_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = LegacyStore::create(dir.path()).unwrap();
        let id = Uuid::now_v7();
        let player: LegacyPlayer = serde_yml::from_str(&format!("uuid: {id}\n")).unwrap();
        let path = store.write(Category::Actor, id, &player).unwrap();

        assert!(path.ends_with(format!("players/{id}.yml")));
        assert_eq!(store.record_files(Category::Actor).unwrap(), vec![path]);
        assert_eq!(
            store.all_files().unwrap(),
            vec![PathBuf::from(format!("players/{id}.yml"))]
        );
    }
}
