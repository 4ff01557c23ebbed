//! File lock management
//!
//! Mutual exclusion over file paths across agents and, through advisory
//! locks on sidecar files, across processes on the same host. Ownership is
//! tracked by timestamped records so a crashed owner's lock goes stale and
//! can be reclaimed instead of wedging the backlog.

use crate::file_storage::{ensure_dir, get_foreman_dir, FileResult};
use crate::models::FileLock;
use crate::utils::sanitize_path_component;
use chrono::Utc;
use fs2::FileExt;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::PathBuf;

/// Owner string reported when the advisory lock is held by a process this
/// coordinator has no record of
const EXTERNAL_OWNER: &str = "(external process)";

/// Outcome of a lock acquisition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAcquire {
    /// The path is now owned by the caller
    Acquired,
    /// The caller already owned the path; the ownership timestamp is
    /// refreshed so an actively working agent never goes stale
    AlreadyOwned,
    /// A live lock belongs to someone else
    Conflict { owner: String },
}

impl LockAcquire {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LockAcquire::Acquired | LockAcquire::AlreadyOwned)
    }
}

/// In-memory lock table plus the OS advisory guards backing it
#[derive(Debug)]
pub struct LockManager {
    project_path: PathBuf,
    stale_after_secs: u64,
    /// path → ownership record (persisted through the coordinator)
    locks: HashMap<String, FileLock>,
    /// path → open sidecar handle holding the OS advisory lock.
    /// Process state only, never serialized.
    guards: HashMap<String, File>,
}

impl LockManager {
    pub fn new(project_path: impl Into<PathBuf>, stale_after_secs: u64) -> Self {
        Self {
            project_path: project_path.into(),
            stale_after_secs,
            locks: HashMap::new(),
            guards: HashMap::new(),
        }
    }

    /// Restore previously persisted records, discarding any that went stale
    /// while the process was down. Returns the number discarded. OS guards
    /// for surviving records are re-taken on the owner's next acquire.
    pub fn restore(&mut self, records: Vec<FileLock>) -> usize {
        let mut discarded = 0;

        for lock in records {
            if lock.is_stale(self.stale_after_secs) {
                log::info!(
                    "[LockManager] Discarding stale lock on '{}' held by '{}' ({}s old)",
                    lock.path,
                    lock.owner,
                    lock.age_secs()
                );
                discarded += 1;
            } else {
                self.locks.insert(lock.path.clone(), lock);
            }
        }

        discarded
    }

    /// Try to take exclusive ownership of a path for an agent.
    ///
    /// A stale lock held by someone else is force-released first. Contention
    /// (in-memory or from another process's advisory lock) is reported as
    /// [`LockAcquire::Conflict`], not an error.
    pub fn acquire(
        &mut self,
        path: &str,
        agent_id: &str,
        story_id: Option<String>,
    ) -> FileResult<LockAcquire> {
        if let Some(existing) = self.locks.get(path) {
            if existing.owner == agent_id {
                if !self.ensure_guard(path)? {
                    // The record said we own it but another process holds
                    // the advisory lock; trust the OS and drop the record
                    log::warn!(
                        "[LockManager] Record for '{}' contradicted by an external advisory lock",
                        path
                    );
                    self.locks.remove(path);
                    return Ok(LockAcquire::Conflict {
                        owner: EXTERNAL_OWNER.to_string(),
                    });
                }

                if let Some(lock) = self.locks.get_mut(path) {
                    lock.acquired_at = Utc::now();
                }
                return Ok(LockAcquire::AlreadyOwned);
            }

            if !existing.is_stale(self.stale_after_secs) {
                return Ok(LockAcquire::Conflict {
                    owner: existing.owner.clone(),
                });
            }

            log::warn!(
                "[LockManager] Reclaiming stale lock on '{}' from '{}' ({}s old)",
                path,
                existing.owner,
                existing.age_secs()
            );
            self.force_release(path);
        }

        if !self.take_guard(path)? {
            log::warn!(
                "[LockManager] Path '{}' is advisory-locked by another process",
                path
            );
            return Ok(LockAcquire::Conflict {
                owner: EXTERNAL_OWNER.to_string(),
            });
        }

        log::info!("[LockManager] Agent '{}' locked '{}'", agent_id, path);
        self.locks
            .insert(path.to_string(), FileLock::new(path, agent_id, story_id));

        Ok(LockAcquire::Acquired)
    }

    /// Release a path if the caller owns it. Releasing a lock you do not
    /// own (or that does not exist) is a no-op so duplicate release calls
    /// during cleanup are harmless. Returns whether a lock was released.
    pub fn release(&mut self, path: &str, agent_id: &str) -> bool {
        match self.locks.get(path) {
            Some(lock) if lock.owner == agent_id => {
                log::info!("[LockManager] Agent '{}' released '{}'", agent_id, path);
                self.force_release(path);
                true
            }
            Some(lock) => {
                log::debug!(
                    "[LockManager] Ignoring release of '{}' by '{}' (owner is '{}')",
                    path,
                    agent_id,
                    lock.owner
                );
                false
            }
            None => false,
        }
    }

    /// Release every lock tied to a story. Called on terminal story
    /// transitions so no lock outlives its story.
    pub fn release_all_for_story(&mut self, story_id: &str) -> usize {
        let paths: Vec<String> = self
            .locks
            .values()
            .filter(|l| l.story_id.as_deref() == Some(story_id))
            .map(|l| l.path.clone())
            .collect();

        for path in &paths {
            self.force_release(path);
        }

        if !paths.is_empty() {
            log::info!(
                "[LockManager] Released {} lock(s) for story '{}'",
                paths.len(),
                story_id
            );
        }
        paths.len()
    }

    /// Release every lock held by an agent (unregistration cleanup)
    pub fn release_all_for_agent(&mut self, agent_id: &str) -> usize {
        let paths: Vec<String> = self
            .locks
            .values()
            .filter(|l| l.owner == agent_id)
            .map(|l| l.path.clone())
            .collect();

        for path in &paths {
            self.force_release(path);
        }
        paths.len()
    }

    pub fn get(&self, path: &str) -> Option<&FileLock> {
        self.locks.get(path)
    }

    /// Snapshot of all records, sorted by path for stable persistence
    pub fn snapshot(&self) -> Vec<FileLock> {
        let mut locks: Vec<FileLock> = self.locks.values().cloned().collect();
        locks.sort_by(|a, b| a.path.cmp(&b.path));
        locks
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Drop all OS guards without touching the records (shutdown path;
    /// records are persisted and recovered on the next start)
    pub fn release_guards(&mut self) {
        for (_, file) in self.guards.drain() {
            let _ = FileExt::unlock(&file);
        }
    }

    fn guard_dir(&self) -> PathBuf {
        get_foreman_dir(&self.project_path).join("locks")
    }

    fn guard_path(&self, path: &str) -> PathBuf {
        self.guard_dir()
            .join(format!("{}.lock", sanitize_path_component(path)))
    }

    // Take the OS advisory lock for a path. Ok(false) means another
    // process holds it.
    fn take_guard(&mut self, path: &str) -> FileResult<bool> {
        if self.guards.contains_key(path) {
            return Ok(true);
        }

        ensure_dir(&self.guard_dir())?;

        let guard_path = self.guard_path(path);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&guard_path)
            .map_err(|e| format!("Failed to open lock file {:?}: {}", guard_path, e))?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                self.guards.insert(path.to_string(), file);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(format!(
                "Failed to lock file {:?}: {}",
                guard_path, e
            )),
        }
    }

    fn ensure_guard(&mut self, path: &str) -> FileResult<bool> {
        self.take_guard(path)
    }

    fn force_release(&mut self, path: &str) {
        self.locks.remove(path);
        if let Some(file) = self.guards.remove(path) {
            let _ = FileExt::unlock(&file);
        }
        // Best-effort sidecar cleanup; a leftover file is harmless
        let _ = std::fs::remove_file(self.guard_path(path));
    }
}
