//! Durable mapping from (instance id, environment commit) to image name.
//!
//! The whole file is loaded on open. Reads take a shared lock, `record` is a
//! single write-locked check-and-insert, and `flush` persists atomically by
//! writing a temp file next to the target and renaming it over. The
//! re-read, merge and rename of a flush run under an exclusive advisory
//! lock on `<file>.lock`, so concurrent processes do not lose each other's
//! keys.
//!
//! A key is bound to one image name for the lifetime of the store; any
//! attempt to rebind it is a [`MappingError::Conflict`].

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tokio::sync::RwLock;

use crate::error::MappingError;

type Mapping = BTreeMap<String, BTreeMap<String, String>>;

/// Outcome of a successful [`ImageMappingStore::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted,
    /// The key already held this exact image name.
    Unchanged,
}

/// Process-wide image mapping, shared by reference.
#[derive(Debug)]
pub struct ImageMappingStore {
    path: PathBuf,
    entries: RwLock<Mapping>,
}

impl ImageMappingStore {
    /// Load the store at `path`, starting empty when the file is absent.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, MappingError> {
        let path = path.into();
        let entries = if path.exists() {
            read_mapping(&path)?
        } else {
            Mapping::new()
        };
        tracing::debug!(path = %path.display(), instances = entries.len(), "Opened image mapping");
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    /// Load the store at `path`, which must already exist.
    pub fn open_existing(path: impl Into<PathBuf>) -> Result<Self, MappingError> {
        let path = path.into();
        if !path.exists() {
            return Err(MappingError::MissingStore(path.display().to_string()));
        }
        Self::open(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Image name recorded for the key.
    pub async fn resolve(
        &self,
        instance_id: &str,
        environment_commit: &str,
    ) -> Result<String, MappingError> {
        self.entries
            .read()
            .await
            .get(instance_id)
            .and_then(|commits| commits.get(environment_commit))
            .cloned()
            .ok_or_else(|| MappingError::NotFound {
                instance_id: instance_id.to_string(),
                environment_commit: environment_commit.to_string(),
            })
    }

    /// Bind the key to `image`. Idempotent for the same value.
    pub async fn record(
        &self,
        instance_id: &str,
        environment_commit: &str,
        image: &str,
    ) -> Result<RecordOutcome, MappingError> {
        let mut entries = self.entries.write().await;
        insert_entry(&mut entries, instance_id, environment_commit, image)
    }

    /// Number of recorded keys.
    pub async fn len(&self) -> usize {
        self.entries.read().await.values().map(BTreeMap::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Persist to disk.
    ///
    /// The on-disk file is re-read first and merged with the in-memory state
    /// under the same conflict rule, so keys recorded by another process
    /// since this store was opened are kept. On a conflict nothing is
    /// written and the in-memory state is left as it was.
    pub async fn flush(&self) -> Result<(), MappingError> {
        let mut entries = self.entries.write().await;
        let path = self.path.clone();
        let snapshot = entries.clone();

        let merged = tokio::task::spawn_blocking(move || merge_and_persist(&path, snapshot))
            .await
            .map_err(|e| MappingError::Io(std::io::Error::other(e)))??;
        *entries = merged;

        tracing::info!(
            path = %self.path.display(),
            instances = entries.len(),
            "Flushed image mapping"
        );
        Ok(())
    }
}

/// Sibling lock file guarding read-modify-write of `path`.
fn lock_path(path: &Path) -> PathBuf {
    let mut name: OsString = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("mapping"));
    name.push(".lock");
    path.with_file_name(name)
}

fn merge_and_persist(path: &Path, mut entries: Mapping) -> Result<Mapping, MappingError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(lock_path(path))?;
    lock_file.lock_exclusive()?;

    let result = merge_locked(path, &dir, &mut entries);
    drop(lock_file);
    result.map(|()| entries)
}

fn merge_locked(path: &Path, dir: &Path, entries: &mut Mapping) -> Result<(), MappingError> {
    if path.exists() {
        for (instance_id, commits) in read_mapping(path)? {
            for (commit, image) in commits {
                insert_entry(entries, &instance_id, &commit, &image)?;
            }
        }
    }

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, &*entries)?;
    tmp.write_all(b"\n")?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| MappingError::Io(e.error))?;
    Ok(())
}

fn read_mapping(path: &Path) -> Result<Mapping, MappingError> {
    let content = std::fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(Mapping::new());
    }
    Ok(serde_json::from_str(&content)?)
}

fn insert_entry(
    entries: &mut Mapping,
    instance_id: &str,
    environment_commit: &str,
    image: &str,
) -> Result<RecordOutcome, MappingError> {
    let commits = entries.entry(instance_id.to_string()).or_default();
    match commits.get(environment_commit) {
        Some(existing) if existing == image => Ok(RecordOutcome::Unchanged),
        Some(existing) => Err(MappingError::Conflict {
            instance_id: instance_id.to_string(),
            environment_commit: environment_commit.to_string(),
            existing: existing.clone(),
            attempted: image.to_string(),
        }),
        None => {
            commits.insert(environment_commit.to_string(), image.to_string());
            Ok(RecordOutcome::Inserted)
        }
    }
}
