//! In-memory job registry
//!
//! Owned by the supervisor task. Nothing else holds a reference to it;
//! observers only ever see cloned `JobSnapshot`s, so they can't catch an
//! entry half-way through an update.

use std::collections::HashMap;

use super::{JobEntry, JobId, JobSnapshot};

/// Ledger of all known jobs, in creation order
#[derive(Debug, Default)]
pub struct JobRegistry {
    entries: HashMap<JobId, JobEntry>,
    order: Vec<JobId>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new entry or replace the one with the same ID
    pub fn upsert(&mut self, entry: JobEntry) -> Option<JobEntry> {
        let id = entry.id.clone();
        let previous = self.entries.insert(id.clone(), entry);
        if previous.is_none() {
            self.order.push(id);
        }
        previous
    }

    pub fn get(&self, id: &JobId) -> Option<&JobEntry> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &JobId) -> Option<&mut JobEntry> {
        self.entries.get_mut(id)
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.entries.contains_key(id)
    }

    /// The non-terminal job for `target`, if any
    ///
    /// Must be consulted before creating a job: at most one active job may
    /// exist per target.
    pub fn find_active_by_target(&self, target: &str) -> Option<&JobEntry> {
        self.entries
            .values()
            .find(|entry| entry.target == target && entry.state().is_active())
    }

    pub fn remove(&mut self, id: &JobId) -> Option<JobEntry> {
        let removed = self.entries.remove(id)?;
        self.order.retain(|existing| existing != id);
        Some(removed)
    }

    /// Snapshot of every entry, oldest first
    pub fn list(&self) -> Vec<JobSnapshot> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id))
            .map(JobEntry::snapshot)
            .collect()
    }

    /// IDs of jobs that still have a worker attached
    pub fn active_ids(&self) -> Vec<JobId> {
        self.order
            .iter()
            .filter(|id| {
                self.entries
                    .get(*id)
                    .map(|entry| entry.state().is_active())
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.state().is_active())
            .count()
    }

    /// Drop every terminal entry, returning the removed IDs
    pub fn prune_terminal(&mut self) -> Vec<JobId> {
        let terminal: Vec<JobId> = self
            .order
            .iter()
            .filter(|id| {
                self.entries
                    .get(*id)
                    .map(|entry| entry.state().is_terminal())
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        for id in &terminal {
            self.remove(id);
        }
        terminal
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobRequest, JobState};
    use crate::worker::WorkerHandle;

    fn started_entry(id: &str, target: &str) -> JobEntry {
        let request = JobRequest::capture(target, format!("/out/{}.mp4", id));
        let mut entry = JobEntry::new(JobId::from(id), &request);
        let (worker, _cmd_rx) = WorkerHandle::detached(entry.id.clone());
        entry.mark_starting(worker).unwrap();
        entry
    }

    #[test]
    fn test_find_active_by_target_ignores_terminal_entries() {
        let mut registry = JobRegistry::new();
        let mut finished = started_entry("1", "streamA");
        finished.finish(None).unwrap();
        registry.upsert(finished);

        assert!(registry.find_active_by_target("streamA").is_none());

        registry.upsert(started_entry("2", "streamA"));
        let active = registry.find_active_by_target("streamA").unwrap();
        assert_eq!(active.id, JobId::from("2"));
        assert!(registry.find_active_by_target("streamB").is_none());
    }

    #[test]
    fn test_list_keeps_creation_order_across_upserts() {
        let mut registry = JobRegistry::new();
        registry.upsert(started_entry("b", "t1"));
        registry.upsert(started_entry("a", "t2"));
        registry.upsert(started_entry("c", "t3"));

        // Replacing an entry must not move it
        let replaced = registry.upsert(started_entry("a", "t2"));
        assert!(replaced.is_some());

        let ids: Vec<String> = registry
            .list()
            .into_iter()
            .map(|s| s.id.to_string())
            .collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_remove_and_prune() {
        let mut registry = JobRegistry::new();
        registry.upsert(started_entry("1", "t1"));
        let mut done = started_entry("2", "t2");
        done.finish(Some("boom".to_string())).unwrap();
        registry.upsert(done);

        assert_eq!(registry.active_count(), 1);
        assert_eq!(registry.active_ids(), vec![JobId::from("1")]);

        let pruned = registry.prune_terminal();
        assert_eq!(pruned, vec![JobId::from("2")]);
        assert!(!registry.contains(&JobId::from("2")));

        assert!(registry.remove(&JobId::from("1")).is_some());
        assert!(registry.remove(&JobId::from("1")).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshots_are_detached_copies() {
        let mut registry = JobRegistry::new();
        registry.upsert(started_entry("1", "t1"));
        let before = registry.list();

        registry
            .get_mut(&JobId::from("1"))
            .unwrap()
            .mark_running(Some(7))
            .unwrap();

        assert_eq!(before[0].state, JobState::Starting);
        assert_eq!(registry.list()[0].state, JobState::Running);
        assert_eq!(registry.get(&JobId::from("1")).unwrap().snapshot().pid, Some(7));
    }
}
