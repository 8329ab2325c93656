//! Whole-percent progress with change-only reporting.

/// Integer percentage of `done` out of `total`, truncated. An empty total counts as done.
pub fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = (u128::from(done.min(total)) * 100) / u128::from(total);
    pct as u8
}

/// Emits a percentage only when it differs from the last one emitted,
/// and emits 100 at most once.
#[derive(Debug, Default, Clone)]
pub struct ProgressTracker {
    last: Option<u8>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record progress; returns the percentage to report, if it changed.
    pub fn update(&mut self, done: u64, total: u64) -> Option<u8> {
        if self.is_complete() {
            return None;
        }
        let pct = percent(done, total);
        if self.last == Some(pct) {
            return None;
        }
        self.last = Some(pct);
        Some(pct)
    }

    pub fn last(&self) -> Option<u8> {
        self.last
    }

    pub fn is_complete(&self) -> bool {
        self.last == Some(100)
    }
}
