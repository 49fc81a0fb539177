//! In-memory reconciler state, owned by the single main task.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

/// All mutable bookkeeping for one reconciliation run.
#[derive(Debug)]
pub struct ReconcilerState {
    pub start_time: Instant,

    // Cadence slots; see `interval_due`
    pub last_poll: Option<Instant>,
    pub last_cluster_check: Option<Instant>,
    pub last_resource_check: Option<Instant>,
    pub last_progress_render: Option<Instant>,
    pub last_stuck_report: Option<Instant>,
    pub last_stuck_dump: Option<Instant>,
    pub last_workload_scan: Option<Instant>,
    pub last_repo_diagnostic: Option<Instant>,

    pub consecutive_cluster_failures: u32,

    /// Expected application count; -1 until discovery has run, 0 when
    /// discovery found nothing and the count grows dynamically.
    pub expected_app_count: i64,

    /// Highest application count ever observed. Monotonic; can overshoot
    /// when the controller briefly lists an obsolete application.
    pub max_apps_seen: usize,

    /// Applications that were Healthy+Synced at least once. Write-only-add;
    /// used for diagnostics, never for completion.
    pub ever_ready: BTreeSet<String>,

    /// Consecutive polls in which an application showed repo-server
    /// symptoms.
    pub repo_issue_counts: HashMap<String, u32>,

    pub repo_recovery_attempts: u32,

    pub total_timeout: Duration,
}

impl ReconcilerState {
    pub fn new(total_timeout: Duration) -> Self {
        Self {
            start_time: Instant::now(),
            last_poll: None,
            last_cluster_check: None,
            last_resource_check: None,
            last_progress_render: None,
            last_stuck_report: None,
            last_stuck_dump: None,
            last_workload_scan: None,
            last_repo_diagnostic: None,
            consecutive_cluster_failures: 0,
            expected_app_count: -1,
            max_apps_seen: 0,
            ever_ready: BTreeSet::new(),
            repo_issue_counts: HashMap::new(),
            repo_recovery_attempts: 0,
            total_timeout,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn mark_ever_ready(&mut self, name: &str) {
        self.ever_ready.insert(name.to_string());
    }

    pub fn note_apps_seen(&mut self, count: usize) {
        if count > self.max_apps_seen {
            self.max_apps_seen = count;
        }
    }

    /// The total the completion condition compares against: the discovered
    /// expectation, overridden by any larger observation.
    pub fn effective_total(&self) -> usize {
        let expected = self.expected_app_count.max(0) as usize;
        expected.max(self.max_apps_seen)
    }
}

/// One-shot interval gate: returns true (and re-arms the slot) when
/// `interval` has passed since the last firing, or on first use.
pub fn interval_due(slot: &mut Option<Instant>, interval: Duration) -> bool {
    let now = Instant::now();
    match slot {
        Some(last) if now.duration_since(*last) < interval => false,
        _ => {
            *slot = Some(now);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ever_ready_is_monotonic() {
        let mut state = ReconcilerState::new(Duration::from_secs(60));
        state.mark_ever_ready("a");
        state.mark_ever_ready("b");
        state.mark_ever_ready("a");
        assert_eq!(state.ever_ready.len(), 2);
        assert!(state.ever_ready.contains("a"));
    }

    #[test]
    fn test_max_apps_seen_monotonic() {
        let mut state = ReconcilerState::new(Duration::from_secs(60));
        state.note_apps_seen(3);
        state.note_apps_seen(1);
        assert_eq!(state.max_apps_seen, 3);
        state.note_apps_seen(5);
        assert_eq!(state.max_apps_seen, 5);
    }

    #[test]
    fn test_effective_total() {
        let mut state = ReconcilerState::new(Duration::from_secs(60));
        assert_eq!(state.effective_total(), 0);

        state.expected_app_count = 3;
        assert_eq!(state.effective_total(), 3);

        // A larger observation replaces the expectation
        state.note_apps_seen(5);
        assert_eq!(state.effective_total(), 5);

        // A smaller one does not shrink it back
        state.note_apps_seen(2);
        assert_eq!(state.effective_total(), 5);
    }

    #[test]
    fn test_interval_due_fires_first_time() {
        let mut slot = None;
        assert!(interval_due(&mut slot, Duration::from_secs(60)));
        assert!(!interval_due(&mut slot, Duration::from_secs(60)));
    }

    #[test]
    fn test_interval_due_rearms() {
        let mut slot = None;
        assert!(interval_due(&mut slot, Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(interval_due(&mut slot, Duration::from_millis(1)));
    }
}
