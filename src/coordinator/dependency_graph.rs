//! Story dependency graph and readiness gating
//!
//! Keeps forward edges (dependency → dependents) so completing a story can
//! cheaply find the stories it may unblock. `blockedBy` is always recomputed
//! from live story status, never trusted from disk. The graph must stay a
//! DAG: an edge set that would close a cycle is rejected before insertion.

use crate::models::{Story, StoryStatus};
use std::collections::{HashMap, HashSet};

/// Dependencies of `story` not yet done, given the live story map.
/// A dependency id with no matching story counts as blocking forever.
pub fn compute_blocked_by(story: &Story, stories: &HashMap<String, Story>) -> Vec<String> {
    story
        .dependencies
        .iter()
        .filter(|dep_id| {
            stories
                .get(*dep_id)
                .map(|dep| dep.status != StoryStatus::Done)
                .unwrap_or(true)
        })
        .cloned()
        .collect()
}

/// Forward-edge adjacency over story ids
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// dependency id → ids of stories that depend on it
    dependents: HashMap<String, HashSet<String>>,
    /// story id → its declared dependencies (reverse index, used to drop
    /// old edges when a story is resubmitted)
    dependencies: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a story's dependency edges.
    ///
    /// Returns an error and leaves the graph unchanged if the new edges
    /// would close a dependency cycle.
    pub fn upsert_story(&mut self, story_id: &str, deps: &[String]) -> Result<(), String> {
        if self.creates_cycle(story_id, deps) {
            return Err(format!(
                "Dependencies of story '{}' would create a cycle",
                story_id
            ));
        }

        self.remove_edges(story_id);

        for dep in deps {
            self.dependents
                .entry(dep.clone())
                .or_default()
                .insert(story_id.to_string());
        }
        self.dependencies
            .insert(story_id.to_string(), deps.to_vec());

        Ok(())
    }

    /// Stories that declared `story_id` as a dependency, sorted for
    /// deterministic unblock walks
    pub fn dependents_of(&self, story_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .dependents
            .get(story_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn dependencies_of(&self, story_id: &str) -> &[String] {
        self.dependencies
            .get(story_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Rebuild from a loaded story list. A story whose edges would close a
    /// cycle is reported back to the caller instead of registered, so one
    /// bad record cannot deadlock the whole graph.
    pub fn rebuild(&mut self, stories: &[Story]) -> Vec<String> {
        self.dependents.clear();
        self.dependencies.clear();

        let mut rejected = Vec::new();
        for story in stories {
            if self.upsert_story(&story.id, &story.dependencies).is_err() {
                rejected.push(story.id.clone());
            }
        }
        rejected
    }

    // A cycle exists when some declared dependency is (transitively) a
    // dependent of the story itself
    fn creates_cycle(&self, story_id: &str, deps: &[String]) -> bool {
        if deps.iter().any(|d| d == story_id) {
            return true;
        }

        let mut stack: Vec<&str> = vec![story_id];
        let mut visited: HashSet<&str> = HashSet::new();

        while let Some(node) = stack.pop() {
            if !visited.insert(node) {
                continue;
            }
            if let Some(children) = self.dependents.get(node) {
                for child in children {
                    if deps.iter().any(|d| d == child) {
                        return true;
                    }
                    stack.push(child.as_str());
                }
            }
        }

        false
    }

    fn remove_edges(&mut self, story_id: &str) {
        if let Some(old_deps) = self.dependencies.remove(story_id) {
            for dep in old_deps {
                if let Some(set) = self.dependents.get_mut(&dep) {
                    set.remove(story_id);
                    if set.is_empty() {
                        self.dependents.remove(&dep);
                    }
                }
            }
        }
    }
}
