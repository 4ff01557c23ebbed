//! Story and lock snapshot files
//!
//! Each snapshot is a complete, independently loadable record (no deltas):
//! `stories.json` holds every known story, `locks.json` every live file
//! lock. A missing file means a fresh start; a present-but-unparseable file
//! is a loud error so in-flight work is never silently discarded.

use super::{atomic_write, ensure_dir, get_foreman_dir, read_json, FileResult};
use crate::models::{FileLock, Story};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Version of the snapshot file format
const SNAPSHOT_VERSION: u32 = 1;

/// Generic snapshot file wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotFile<T> {
    /// File format version
    pub version: u32,
    /// When this snapshot was last written
    pub updated_at: DateTime<Utc>,
    /// The snapshotted entries
    pub entries: Vec<T>,
}

impl<T> Default for SnapshotFile<T> {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            updated_at: Utc::now(),
            entries: Vec::new(),
        }
    }
}

/// Get the stories snapshot path for a project
pub fn get_stories_path(project_path: &Path) -> PathBuf {
    get_foreman_dir(project_path).join("stories.json")
}

/// Get the locks snapshot path for a project
pub fn get_locks_path(project_path: &Path) -> PathBuf {
    get_foreman_dir(project_path).join("locks.json")
}

fn read_snapshot<T: serde::de::DeserializeOwned>(path: &Path) -> FileResult<SnapshotFile<T>> {
    if !path.exists() {
        return Ok(SnapshotFile::default());
    }

    read_json(path)
}

fn write_snapshot<T: serde::Serialize>(path: &Path, entries: Vec<T>) -> FileResult<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }

    let snapshot = SnapshotFile {
        version: SNAPSHOT_VERSION,
        updated_at: Utc::now(),
        entries,
    };

    let content = serde_json::to_string_pretty(&snapshot)
        .map_err(|e| format!("Failed to serialize snapshot: {}", e))?;

    atomic_write(path, &content)
}

/// Write the complete story list for a project
pub fn save_stories(project_path: &Path, stories: Vec<Story>) -> FileResult<()> {
    write_snapshot(&get_stories_path(project_path), stories)
}

/// Load the story list for a project; a missing snapshot is a fresh start
pub fn load_stories(project_path: &Path) -> FileResult<Vec<Story>> {
    let snapshot: SnapshotFile<Story> = read_snapshot(&get_stories_path(project_path))?;
    Ok(snapshot.entries)
}

/// Write the complete lock list for a project
pub fn save_locks(project_path: &Path, locks: Vec<FileLock>) -> FileResult<()> {
    write_snapshot(&get_locks_path(project_path), locks)
}

/// Load the lock list for a project; a missing snapshot is a fresh start
pub fn load_locks(project_path: &Path) -> FileResult<Vec<FileLock>> {
    let snapshot: SnapshotFile<FileLock> = read_snapshot(&get_locks_path(project_path))?;
    Ok(snapshot.entries)
}
