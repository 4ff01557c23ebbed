//! File-based persistence for coordinator state
//!
//! All durable state lives under `<project>/.foreman/`. Writes go through
//! [`atomic_write`] (temp file + rename) so a crash mid-write never leaves a
//! partially written record behind.

pub mod state;

pub use state::{
    get_locks_path, get_stories_path, load_locks, load_stories, save_locks, save_stories,
    SnapshotFile,
};

use std::fs;
use std::path::{Path, PathBuf};

/// Result type for file storage operations
pub type FileResult<T> = Result<T, String>;

/// Get the .foreman directory path for a project
pub fn get_foreman_dir(project_path: &Path) -> PathBuf {
    project_path.join(".foreman")
}

/// Create the .foreman directory if it doesn't exist and return its path
pub fn init_foreman_dir(project_path: &Path) -> FileResult<PathBuf> {
    let dir = get_foreman_dir(project_path);
    ensure_dir(&dir)?;
    Ok(dir)
}

/// Create a directory (and parents) if it doesn't exist
pub fn ensure_dir(path: &Path) -> FileResult<()> {
    if !path.exists() {
        fs::create_dir_all(path)
            .map_err(|e| format!("Failed to create directory {:?}: {}", path, e))?;
    }
    Ok(())
}

/// Write content to a file atomically: write to a temp path, then rename
/// over the target. Readers never observe a half-written file.
pub fn atomic_write(path: &Path, content: &str) -> FileResult<()> {
    let tmp_path = path.with_extension("tmp");

    fs::write(&tmp_path, content)
        .map_err(|e| format!("Failed to write temp file {:?}: {}", tmp_path, e))?;

    fs::rename(&tmp_path, path)
        .map_err(|e| format!("Failed to rename {:?} to {:?}: {}", tmp_path, path, e))
}

/// Read and deserialize a JSON file. Errors carry the path so corrupt
/// records are diagnosable; callers decide whether a missing file is fine.
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> FileResult<T> {
    let content =
        fs::read_to_string(path).map_err(|e| format!("Failed to read {:?}: {}", path, e))?;

    serde_json::from_str(&content).map_err(|e| format!("Failed to parse {:?}: {}", path, e))
}
