use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// First wait after a failed registration attempt.
const INITIAL_BACKOFF_MINS: i64 = 5;

/// Ceiling: one attempt per day once the sequence saturates.
const MAX_BACKOFF_MINS: i64 = 24 * 60;

/// Durable record of registration attempts, persisted with the device
/// state so backoff survives restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AttemptState {
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    /// Minutes to wait after `last_attempt_at` before trying again.
    pub next_backoff_mins: i64,
}

impl AttemptState {
    /// Whether a new become-operational attempt may start now.
    pub fn can_attempt(&self, now: DateTime<Utc>) -> bool {
        match self.last_attempt_at {
            None => true,
            Some(last) => now >= last + Duration::minutes(self.next_backoff_mins),
        }
    }

    /// Record the start of an attempt and arm the next backoff window:
    /// 5m, 10m, 20m, …, capped at 24h.
    pub fn record_attempt(&mut self, now: DateTime<Utc>) {
        self.last_attempt_at = Some(now);
        self.attempt_count += 1;
        self.next_backoff_mins = backoff_for(self.attempt_count);
    }

    /// A successful registration clears the schedule.
    pub fn reset(&mut self) {
        *self = AttemptState::default();
    }

    pub fn next_backoff(&self) -> Duration {
        Duration::minutes(self.next_backoff_mins)
    }
}

/// Backoff armed after the Nth attempt (1-based).
fn backoff_for(attempts: u32) -> i64 {
    let doubled = INITIAL_BACKOFF_MINS.saturating_mul(1_i64 << (attempts - 1).min(16));
    doubled.min(MAX_BACKOFF_MINS)
}
