//! Progress tracker — §4.F.
//!
//! An in-memory registry of in-flight bundle builds, keyed by task id.
//! Concurrent readers (status polling) and the single writer (the bundle
//! builder advancing its own task) share the map through a [`dashmap::DashMap`],
//! the same structure the teacher uses for its `SessionStore`.

use dashmap::DashMap;
use tracing::debug;

use crate::model::{ProgressTask, TaskPhase, TaskTerminal};

/// Tracks all tasks started since process start. Tasks are never evicted
/// automatically — callers prune completed tasks older than their own
/// retention policy, if they care to.
#[derive(Default)]
pub struct ProgressTracker {
    tasks: DashMap<String, ProgressTask>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_task(&self, task_id: &str, fingerprint: &str, repos: Vec<String>, started_at: &str) {
        let task = ProgressTask {
            task_id: task_id.to_string(),
            fingerprint: fingerprint.to_string(),
            phase: TaskPhase::Starting,
            progress: 0,
            total: None,
            message: "starting".to_string(),
            repos,
            started_at: started_at.to_string(),
            updated_at: started_at.to_string(),
            terminal: None,
        };
        debug!(task_id, fingerprint, "task started");
        self.tasks.insert(task_id.to_string(), task);
    }

    pub fn update_progress(&self, task_id: &str, phase: TaskPhase, progress: u8, total: Option<u64>, message: &str, now: &str) {
        if let Some(mut entry) = self.tasks.get_mut(task_id) {
            entry.phase = phase;
            entry.progress = progress.min(100);
            entry.total = total;
            entry.message = message.to_string();
            entry.updated_at = now.to_string();
        }
    }

    pub fn complete_task(&self, task_id: &str, bundle_id: &str, now: &str) {
        if let Some(mut entry) = self.tasks.get_mut(task_id) {
            entry.phase = TaskPhase::Complete;
            entry.progress = 100;
            entry.terminal = Some(TaskTerminal::Ok { bundle_id: bundle_id.to_string() });
            entry.updated_at = now.to_string();
        }
        debug!(task_id, bundle_id, "task completed");
    }

    pub fn fail_task(&self, task_id: &str, error: &str, now: &str) {
        if let Some(mut entry) = self.tasks.get_mut(task_id) {
            entry.terminal = Some(TaskTerminal::Err { error: error.to_string() });
            entry.message = error.to_string();
            entry.updated_at = now.to_string();
        }
        debug!(task_id, error, "task failed");
    }

    pub fn get(&self, task_id: &str) -> Option<ProgressTask> {
        self.tasks.get(task_id).map(|t| t.clone())
    }

    /// Tasks with no terminal outcome yet, newest first by `started_at`.
    pub fn list_active(&self) -> Vec<ProgressTask> {
        let mut active: Vec<ProgressTask> = self.tasks.iter().filter(|t| t.terminal.is_none()).map(|t| t.clone()).collect();
        active.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_starts_updates_and_completes() {
        let tracker = ProgressTracker::new();
        tracker.start_task("t1", "fp1", vec!["o/r".to_string()], "2026-01-01T00:00:00Z");
        assert_eq!(tracker.get("t1").unwrap().phase, TaskPhase::Starting);

        tracker.update_progress("t1", TaskPhase::Indexing, 50, Some(100), "indexing", "2026-01-01T00:01:00Z");
        let mid = tracker.get("t1").unwrap();
        assert_eq!(mid.phase, TaskPhase::Indexing);
        assert_eq!(mid.progress, 50);

        tracker.complete_task("t1", "bundle-1", "2026-01-01T00:02:00Z");
        let done = tracker.get("t1").unwrap();
        assert_eq!(done.progress, 100);
        assert!(matches!(done.terminal, Some(TaskTerminal::Ok { ref bundle_id }) if bundle_id == "bundle-1"));
    }

    #[test]
    fn failed_task_carries_error_and_is_not_active() {
        let tracker = ProgressTracker::new();
        tracker.start_task("t1", "fp1", vec![], "2026-01-01T00:00:00Z");
        tracker.fail_task("t1", "clone timed out", "2026-01-01T00:01:00Z");

        let task = tracker.get("t1").unwrap();
        assert!(matches!(task.terminal, Some(TaskTerminal::Err { ref error }) if error == "clone timed out"));
        assert!(tracker.list_active().is_empty());
    }

    #[test]
    fn list_active_excludes_terminal_tasks() {
        let tracker = ProgressTracker::new();
        tracker.start_task("t1", "fp1", vec![], "2026-01-01T00:00:00Z");
        tracker.start_task("t2", "fp2", vec![], "2026-01-01T00:01:00Z");
        tracker.complete_task("t1", "bundle-1", "2026-01-01T00:02:00Z");

        let active = tracker.list_active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].task_id, "t2");
    }
}
