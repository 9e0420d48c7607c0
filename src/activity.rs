//! In-process activity tracking for the Docker backend's idle policy
//!
//! The Kubernetes backend tracks activity in the project store so multiple
//! backend replicas agree; the Docker backend runs single-host and keeps a
//! process-local map. This is an injected dependency with explicit
//! construction, not a module global.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use uuid::Uuid;

/// One tracked environment.
#[derive(Debug, Clone)]
pub struct ActivityEntry {
    pub user_id: Uuid,
    pub project_id: Uuid,
    pub last_activity: Instant,
    /// Set when Tier 1 stopped the project's services.
    pub paused_at: Option<Instant>,
}

/// Tracks per-project activity and Tier-1 pause timestamps.
#[derive(Default)]
pub struct ActivityTracker {
    entries: Mutex<HashMap<String, ActivityEntry>>,
}

/// Key shape shared with the original tracker: `user-{uid}-project-{pid}`.
pub fn project_key(user_id: Uuid, project_id: Uuid) -> String {
    format!("user-{}-project-{}", user_id, project_id)
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record activity; clears any pause state.
    pub fn touch(&self, user_id: Uuid, project_id: Uuid) {
        let key = project_key(user_id, project_id);
        let mut entries = self.entries.lock().expect("activity tracker poisoned");
        entries.insert(
            key,
            ActivityEntry {
                user_id,
                project_id,
                last_activity: Instant::now(),
                paused_at: None,
            },
        );
    }

    /// Mark an environment as paused by Tier-1 cleanup.
    pub fn mark_paused(&self, user_id: Uuid, project_id: Uuid) {
        let key = project_key(user_id, project_id);
        let mut entries = self.entries.lock().expect("activity tracker poisoned");
        if let Some(entry) = entries.get_mut(&key) {
            entry.paused_at = Some(Instant::now());
        }
    }

    /// Forget an environment entirely (stopped or deleted).
    pub fn forget(&self, user_id: Uuid, project_id: Uuid) {
        let key = project_key(user_id, project_id);
        self.entries
            .lock()
            .expect("activity tracker poisoned")
            .remove(&key);
    }

    /// Entries idle longer than `idle_for` and not yet paused (Tier 1).
    pub fn idle_entries(&self, idle_for: Duration) -> Vec<(String, ActivityEntry)> {
        let entries = self.entries.lock().expect("activity tracker poisoned");
        entries
            .iter()
            .filter(|(_, e)| e.paused_at.is_none() && e.last_activity.elapsed() > idle_for)
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect()
    }

    /// Entries paused longer than `paused_for` (Tier 2, deletable).
    pub fn long_paused_entries(&self, paused_for: Duration) -> Vec<(String, ActivityEntry)> {
        let entries = self.entries.lock().expect("activity tracker poisoned");
        entries
            .iter()
            .filter(|(_, e)| matches!(e.paused_at, Some(at) if at.elapsed() > paused_for))
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("activity tracker poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_touch_and_idle() {
        let tracker = ActivityTracker::new();
        let user = Uuid::new_v4();
        let project = Uuid::new_v4();

        tracker.touch(user, project);
        assert_eq!(tracker.len(), 1);

        // Nothing idle at a zero-ish threshold immediately after touch.
        assert!(tracker.idle_entries(Duration::from_secs(60)).is_empty());
        // Everything is idle against a zero threshold.
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(tracker.idle_entries(Duration::ZERO).len(), 1);
    }

    #[test]
    fn test_pause_transitions() {
        let tracker = ActivityTracker::new();
        let user = Uuid::new_v4();
        let project = Uuid::new_v4();

        tracker.touch(user, project);
        tracker.mark_paused(user, project);
        std::thread::sleep(Duration::from_millis(5));

        // Paused entries leave the Tier-1 candidate set...
        assert!(tracker.idle_entries(Duration::ZERO).is_empty());
        // ...and show up as Tier-2 candidates once past the threshold.
        assert_eq!(tracker.long_paused_entries(Duration::ZERO).len(), 1);

        // New activity clears the pause.
        tracker.touch(user, project);
        assert!(tracker.long_paused_entries(Duration::ZERO).is_empty());
    }

    #[test]
    fn test_forget() {
        let tracker = ActivityTracker::new();
        let user = Uuid::new_v4();
        let project = Uuid::new_v4();

        tracker.touch(user, project);
        tracker.forget(user, project);
        assert!(tracker.is_empty());
    }
}
