//! Shared job progress state.
//!
//! One value owned by the coordinator, written only by its
//! control-record consumer, and read snapshot-style by the dashboard.
//! Counters only ever increase, and `bytes_processed` never exceeds
//! `bytes_total`.

use std::sync::{Arc, RwLock};

/// How many diagnostic messages we keep.
const MAX_MESSAGES: usize = 200;

/// A point-in-time view of job progress.
#[derive(Clone, Debug, Default)]
pub struct ProgressSnapshot {
    /// Total number of files in the resolved input.
    pub files_total: u64,
    /// Total bytes in the resolved input.
    pub bytes_total: u64,
    /// Files successfully processed so far.
    pub files_processed: u64,
    /// Bytes successfully processed so far.
    pub bytes_processed: u64,
    /// Files given up on after exhausting their retries.
    pub files_failed: u64,
    /// The most recently processed file.
    pub last_file_processed: String,
    /// Recent diagnostic messages, oldest first.
    pub messages: Vec<String>,
}

/// A handle on the job's shared progress state.
///
/// Cloning is cheap; all clones share the same state.
#[derive(Clone, Debug, Default)]
pub struct ProgressTracker {
    inner: Arc<RwLock<ProgressSnapshot>>,
}

impl ProgressTracker {
    /// Create a tracker with all counters at zero.
    pub fn new() -> ProgressTracker {
        ProgressTracker::default()
    }

    /// Record the size of the resolved input. Called once, after
    /// resolution and before any worker starts.
    pub fn set_totals(&self, files_total: u64, bytes_total: u64) {
        let mut state = self.write();
        state.files_total = files_total;
        state.bytes_total = bytes_total;
    }

    /// Record a successfully processed file.
    pub fn record_processed(&self, uri: &str, size: u64) {
        let mut state = self.write();
        state.files_processed += 1;
        state.bytes_processed =
            state.bytes_total.min(state.bytes_processed + size);
        state.last_file_processed = uri.to_owned();
    }

    /// Record a file we gave up on.
    pub fn record_failed(&self, _uri: &str) {
        self.write().files_failed += 1;
    }

    /// Append a diagnostic message, dropping the oldest if full.
    pub fn push_message(&self, message: String) {
        let mut state = self.write();
        if state.messages.len() >= MAX_MESSAGES {
            state.messages.remove(0);
        }
        state.messages.push(message);
    }

    /// Take a snapshot for display. Safe to call concurrently with
    /// writes.
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ProgressSnapshot> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let progress = ProgressTracker::new();
        progress.set_totals(2, 10);
        progress.record_processed("file:///a", 6);
        progress.record_processed("file:///b", 4);

        let snapshot = progress.snapshot();
        assert_eq!(snapshot.files_processed, 2);
        assert_eq!(snapshot.bytes_processed, 10);
        assert_eq!(snapshot.last_file_processed, "file:///b");
    }

    #[test]
    fn bytes_processed_never_exceeds_total() {
        let progress = ProgressTracker::new();
        progress.set_totals(1, 5);
        progress.record_processed("file:///a", 100);
        assert_eq!(progress.snapshot().bytes_processed, 5);
    }

    #[test]
    fn message_log_is_bounded() {
        let progress = ProgressTracker::new();
        for i in 0..(MAX_MESSAGES + 10) {
            progress.push_message(format!("message {}", i));
        }
        let snapshot = progress.snapshot();
        assert_eq!(snapshot.messages.len(), MAX_MESSAGES);
        assert_eq!(snapshot.messages[0], "message 10");
    }
}
