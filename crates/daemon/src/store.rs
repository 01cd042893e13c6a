//! Persistent session state.
//!
//! The store keeps one record per live session in `<data_dir>/state.json`.
//! Records exist so sessions can be rediscovered after the server restarts;
//! they never prove that a session is alive. Every mutation rewrites the
//! whole file through a temp file and a rename, so readers see either the
//! old or the new content and never a partial write.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current on-disk format version.
const STORE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state file I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("state file {path} is corrupt: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("state file version {0} is not supported")]
    UnsupportedVersion(u32),
}

/// Persisted projection of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Key of the record; not repeated inside the JSON value.
    #[serde(skip)]
    pub session_id: String,
    pub connection_name: String,
    pub multiplexer_name: String,
    pub log_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    #[serde(default)]
    sessions: BTreeMap<String, SessionRecord>,
}

/// JSON-backed session record store.
///
/// The internal lock is held across the file write, so concurrent writers
/// persist in the same order they mutate.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    records: Mutex<BTreeMap<String, SessionRecord>>,
}

impl StateStore {
    /// Opens the store at `path`. A missing file is an empty store.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let records = read_state_file(&path)?;
        tracing::debug!(path = %path.display(), count = records.len(), "Loaded state store");
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, SessionRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds or replaces a record and persists.
    pub fn insert(&self, record: SessionRecord) -> Result<(), StoreError> {
        let mut records = self.lock();
        let mut next = records.clone();
        next.insert(record.session_id.clone(), record);
        write_state_file(&self.path, &next)?;
        *records = next;
        Ok(())
    }

    /// Updates `last_activity_at` of a record and persists.
    ///
    /// Returns `false` when no record has that id.
    pub fn touch(&self, session_id: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut records = self.lock();
        if !records.contains_key(session_id) {
            return Ok(false);
        }
        let mut next = records.clone();
        if let Some(record) = next.get_mut(session_id) {
            record.last_activity_at = at;
        }
        write_state_file(&self.path, &next)?;
        *records = next;
        Ok(true)
    }

    /// Removes a record and persists. Removing an absent id writes nothing.
    pub fn remove(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let mut records = self.lock();
        if !records.contains_key(session_id) {
            return Ok(None);
        }
        let mut next = records.clone();
        let removed = next.remove(session_id);
        write_state_file(&self.path, &next)?;
        *records = next;
        Ok(removed)
    }

    pub fn get(&self, session_id: &str) -> Option<SessionRecord> {
        self.lock().get(session_id).cloned()
    }

    /// All records ordered by creation time, then id.
    pub fn records(&self) -> Vec<SessionRecord> {
        let mut records: Vec<SessionRecord> = self.lock().values().cloned().collect();
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        records
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Reads a state file without opening a store.
pub fn read_state_file(path: &Path) -> Result<BTreeMap<String, SessionRecord>, StoreError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::debug!("State file not found at {:?}, starting empty", path);
            return Ok(BTreeMap::new());
        }
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let data: StateFile = serde_json::from_str(&contents).map_err(|source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    if data.version != STORE_VERSION {
        return Err(StoreError::UnsupportedVersion(data.version));
    }

    Ok(data
        .sessions
        .into_iter()
        .map(|(id, mut record)| {
            record.session_id = id.clone();
            (id, record)
        })
        .collect())
}

fn write_state_file(
    path: &Path,
    records: &BTreeMap<String, SessionRecord>,
) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let data = StateFile {
        version: STORE_VERSION,
        sessions: records.clone(),
    };
    let contents = serde_json::to_string_pretty(&data)?;

    let temp_path = path.with_extension("json.tmp");
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(&temp_path).map_err(io_err)?;
    file.write_all(contents.as_bytes()).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    drop(file);

    fs::rename(&temp_path, path).map_err(io_err)?;
    tracing::trace!(path = %path.display(), count = records.len(), "Persisted state store");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn record(id: &str, created_at: DateTime<Utc>) -> SessionRecord {
        SessionRecord {
            session_id: id.to_string(),
            connection_name: "db1".to_string(),
            multiplexer_name: format!("sshmux-{id}"),
            log_path: PathBuf::from(format!("/logs/{id}.log")),
            created_at,
            last_activity_at: created_at,
        }
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::load(dir.path().join("state.json")).unwrap();
        assert!(store.is_empty());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_insert_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let store = StateStore::load(&path).unwrap();
        let now = Utc::now();

        store.insert(record("db1-1", now)).unwrap();
        store.insert(record("db1-2", now)).unwrap();

        let reloaded = StateStore::load(&path).unwrap();
        assert_eq!(reloaded.records(), store.records());
        assert_eq!(reloaded.get("db1-1").unwrap().session_id, "db1-1");
    }

    #[test]
    fn test_file_layout_keyed_by_session_id() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::load(&path).unwrap();
        store.insert(record("web", Utc::now())).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["version"], 1);
        let entry = &json["sessions"]["web"];
        assert_eq!(entry["connection_name"], "db1");
        assert_eq!(entry["multiplexer_name"], "sshmux-web");
        assert!(entry.get("session_id").is_none());
        assert!(entry["created_at"].is_string());
    }

    #[test]
    fn test_touch_and_remove() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::load(&path).unwrap();
        let created = Utc::now();
        store.insert(record("a", created)).unwrap();

        let later = created + Duration::seconds(30);
        assert!(store.touch("a", later).unwrap());
        assert!(!store.touch("missing", later).unwrap());
        assert_eq!(
            StateStore::load(&path).unwrap().get("a").unwrap().last_activity_at,
            later
        );

        let removed = store.remove("a").unwrap().unwrap();
        assert_eq!(removed.session_id, "a");
        assert!(store.remove("a").unwrap().is_none());
        assert!(StateStore::load(&path).unwrap().is_empty());
    }

    #[test]
    fn test_records_ordered_by_creation() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::load(dir.path().join("state.json")).unwrap();
        let t0 = Utc::now();
        store.insert(record("late", t0 + Duration::seconds(5))).unwrap();
        store.insert(record("early", t0)).unwrap();
        store.insert(record("b-tie", t0)).unwrap();

        let ids: Vec<String> = store.records().into_iter().map(|r| r.session_id).collect();
        assert_eq!(ids, vec!["b-tie", "early", "late"]);
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            StateStore::load(&path).unwrap_err(),
            StoreError::Parse { .. }
        ));
    }

    #[test]
    fn test_unsupported_version() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, r#"{"version": 7, "sessions": {}}"#).unwrap();
        assert!(matches!(
            StateStore::load(&path).unwrap_err(),
            StoreError::UnsupportedVersion(7)
        ));
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::load(&path).unwrap();
        store.insert(record("a", Utc::now())).unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_failed_write_keeps_memory_consistent() {
        let dir = TempDir::new().unwrap();
        // The store path is a directory, so the final rename fails.
        let path = dir.path().join("state.json");
        fs::create_dir(&path).unwrap();
        let store = StateStore {
            path: path.clone(),
            records: Mutex::new(BTreeMap::new()),
        };

        assert!(store.insert(record("a", Utc::now())).is_err());
        assert!(store.get("a").is_none());
    }
}
