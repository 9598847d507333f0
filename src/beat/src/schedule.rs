//! One periodic schedule entry: a task name, its run history, and the
//! interval that governs due-ness.
//!
//! Mirrors the `ScheduleEntry`/`is_due` contract from the original
//! implementation's beat tests: `total_run_count` only increases and
//! `last_run_at` only advances on a successful dispatch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub name: String,
    pub last_run_at: DateTime<Utc>,
    pub total_run_count: u64,
    pub run_every: Duration,
}

impl ScheduleEntry {
    pub fn new(name: impl Into<String>, run_every: Duration) -> Self {
        Self {
            name: name.into(),
            last_run_at: Utc::now(),
            total_run_count: 0,
            run_every,
        }
    }

    /// `(due?, seconds_until_next_check)`, matching the original
    /// predicate shape so the tick loop can take the minimum
    /// `next_check` across every non-due entry.
    pub fn is_due(&self, now: DateTime<Utc>) -> (bool, f64) {
        let elapsed = (now - self.last_run_at).to_std().unwrap_or(Duration::ZERO);
        if elapsed >= self.run_every {
            (true, 0.0)
        } else {
            (false, (self.run_every - elapsed).as_secs_f64())
        }
    }

    /// Advance the entry after a successful dispatch. Never called on
    /// failure: `SchedulingError` leaves the entry untouched so the next
    /// tick retries.
    pub fn advance(&mut self, ran_at: DateTime<Utc>) {
        self.last_run_at = ran_at;
        self.total_run_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_entry_with_zero_interval_is_immediately_due() {
        let entry = ScheduleEntry::new("tick", Duration::from_secs(0));
        let (due, _) = entry.is_due(Utc::now());
        assert!(due);
    }

    #[test]
    fn pending_entry_reports_seconds_until_next_check() {
        let entry = ScheduleEntry::new("tick", Duration::from_secs(60));
        let (due, next) = entry.is_due(Utc::now());
        assert!(!due);
        assert!(next > 0.0 && next <= 60.0);
    }

    #[test]
    fn advance_increments_count_and_moves_last_run_at() {
        let mut entry = ScheduleEntry::new("tick", Duration::from_secs(1));
        let before = entry.total_run_count;
        let now = Utc::now();
        entry.advance(now);
        assert_eq!(entry.total_run_count, before + 1);
        assert_eq!(entry.last_run_at, now);
    }
}
