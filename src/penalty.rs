// PenaltyRegistry — in-memory per-key penalty-box state machine.
//
// Guarded by a single parking_lot::Mutex over a small HashMap, following the
// teacher's discipline in `engine/http.rs::CircuitBreaker` and
// `engine/sessions/mod.rs::SessionStore`: the lock is held only across
// constant-time in-memory operations, never across upstream network I/O.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// 429 backoff ladder: 15m, 1h, 2h, 6h, 12h, 24h. Level n picks entry n,
/// saturating at the last.
const SCHEDULE_429: [Duration; 6] = [
    Duration::from_secs(15 * 60),
    Duration::from_secs(60 * 60),
    Duration::from_secs(2 * 60 * 60),
    Duration::from_secs(6 * 60 * 60),
    Duration::from_secs(12 * 60 * 60),
    Duration::from_secs(24 * 60 * 60),
];

/// 5xx backoff ladder: 30s, 2m, 5m, 15m, 1h.
const SCHEDULE_5XX: [Duration; 5] = [
    Duration::from_secs(30),
    Duration::from_secs(2 * 60),
    Duration::from_secs(5 * 60),
    Duration::from_secs(15 * 60),
    Duration::from_secs(60 * 60),
];

const MAX_LEVEL_429: usize = SCHEDULE_429.len() - 1;
const MAX_LEVEL_5XX: usize = SCHEDULE_5XX.len() - 1;

#[derive(Debug, Clone, Copy)]
pub struct PenaltyEntry {
    pub expires_at: Instant,
    pub backoff_level_429: u8,
    pub backoff_level_5xx: u8,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct PenaltySnapshot {
    pub penalty_active: bool,
    pub expires_in_seconds: i64,
    pub backoff_level_429: u8,
    pub backoff_level_5xx: u8,
}

pub struct PenaltyRegistry {
    entries: Mutex<HashMap<usize, PenaltyEntry>>,
}

impl Default for PenaltyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PenaltyRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_penalized(&self, i: usize, now: Instant) -> bool {
        self.entries
            .lock()
            .get(&i)
            .is_some_and(|e| e.expires_at > now)
    }

    /// Drop the entry entirely. Used on upstream success.
    pub fn clear(&self, i: usize) {
        self.entries.lock().remove(&i);
    }

    pub fn penalize_429(&self, i: usize, now: Instant, upstream_hint_secs: Option<u64>) -> Duration {
        let mut entries = self.entries.lock();
        let existed = entries.contains_key(&i);
        let entry = entries.entry(i).or_insert(PenaltyEntry {
            expires_at: now,
            backoff_level_429: 0,
            backoff_level_5xx: 0,
        });
        let next_level = if existed {
            (entry.backoff_level_429 as usize + 1).min(MAX_LEVEL_429)
        } else {
            0
        };
        entry.backoff_level_429 = next_level as u8;
        let scheduled = SCHEDULE_429[next_level];
        let hint = upstream_hint_secs.map(Duration::from_secs).unwrap_or_default();
        let duration = scheduled.max(hint);
        entry.expires_at = now + duration;
        duration
    }

    pub fn penalize_5xx(&self, i: usize, now: Instant) -> Duration {
        let mut entries = self.entries.lock();
        let existed = entries.contains_key(&i);
        let entry = entries.entry(i).or_insert(PenaltyEntry {
            expires_at: now,
            backoff_level_429: 0,
            backoff_level_5xx: 0,
        });
        let next_level = if existed {
            (entry.backoff_level_5xx as usize + 1).min(MAX_LEVEL_5XX)
        } else {
            0
        };
        entry.backoff_level_5xx = next_level as u8;
        let duration = SCHEDULE_5XX[next_level];
        entry.expires_at = now + duration;
        duration
    }

    /// Operator-initiated: set expiry without incrementing level.
    pub fn force_penalize(&self, i: usize, now: Instant) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(i).or_insert(PenaltyEntry {
            expires_at: now,
            backoff_level_429: 0,
            backoff_level_5xx: 0,
        });
        let level = entry.backoff_level_429 as usize;
        entry.expires_at = now + SCHEDULE_429[level.min(MAX_LEVEL_429)];
    }

    /// Operator-initiated: clear and zero both backoff levels.
    pub fn reset(&self, i: usize) {
        self.entries.lock().remove(&i);
    }

    pub fn snapshot(&self) -> HashMap<usize, PenaltyEntry> {
        self.entries.lock().clone()
    }

    pub fn snapshot_one(&self, i: usize, now: Instant) -> PenaltySnapshot {
        match self.entries.lock().get(&i) {
            Some(e) => PenaltySnapshot {
                penalty_active: e.expires_at > now,
                expires_in_seconds: e
                    .expires_at
                    .checked_duration_since(now)
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0),
                backoff_level_429: e.backoff_level_429,
                backoff_level_5xx: e.backoff_level_5xx,
            },
            None => PenaltySnapshot {
                penalty_active: false,
                expires_in_seconds: 0,
                backoff_level_429: 0,
                backoff_level_5xx: 0,
            },
        }
    }

    /// Among the given indices (not in `exclude_set`), return the one with
    /// the earliest expiry, or `None` if `candidates` is empty.
    pub fn earliest_expiry(&self, candidates: &[usize]) -> Option<usize> {
        let entries = self.entries.lock();
        candidates
            .iter()
            .copied()
            .min_by_key(|i| {
                entries
                    .get(i)
                    .map(|e| e.expires_at)
                    .unwrap_or_else(Instant::now)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_implies_not_penalized() {
        let reg = PenaltyRegistry::new();
        let now = Instant::now();
        reg.penalize_429(0, now, None);
        assert!(reg.is_penalized(0, now));
        reg.clear(0);
        assert!(!reg.is_penalized(0, now));
    }

    #[test]
    fn backoff_429_escalates_and_saturates() {
        let reg = PenaltyRegistry::new();
        let now = Instant::now();
        for n in 1..=8u32 {
            let dur = reg.penalize_429(0, now, None);
            let expected_level = (n as usize - 1).min(MAX_LEVEL_429);
            assert_eq!(dur, SCHEDULE_429[expected_level]);
        }
        let snap = reg.snapshot_one(0, now);
        assert_eq!(snap.backoff_level_429, MAX_LEVEL_429 as u8);
    }

    #[test]
    fn upstream_hint_can_increase_duration() {
        let reg = PenaltyRegistry::new();
        let now = Instant::now();
        // Level 0 schedule is 900s; hint of 90s should not override (max rule).
        let dur = reg.penalize_429(0, now, Some(90));
        assert_eq!(dur, Duration::from_secs(900));

        // A much larger hint should win.
        reg.clear(0);
        let dur2 = reg.penalize_429(0, now, Some(5000));
        assert_eq!(dur2, Duration::from_secs(5000));
    }

    #[test]
    fn backoff_5xx_schedule() {
        let reg = PenaltyRegistry::new();
        let now = Instant::now();
        let dur = reg.penalize_5xx(1, now);
        assert_eq!(dur, Duration::from_secs(30));
    }

    #[test]
    fn force_penalize_does_not_advance_level() {
        let reg = PenaltyRegistry::new();
        let now = Instant::now();
        reg.force_penalize(2, now);
        let snap = reg.snapshot_one(2, now);
        assert_eq!(snap.backoff_level_429, 0);
        assert!(snap.penalty_active);
    }

    #[test]
    fn reset_clears_entry() {
        let reg = PenaltyRegistry::new();
        let now = Instant::now();
        reg.penalize_429(3, now, None);
        reg.reset(3);
        assert!(!reg.is_penalized(3, now));
    }

    #[test]
    fn first_429_enters_at_level_zero() {
        let reg = PenaltyRegistry::new();
        let now = Instant::now();
        let dur = reg.penalize_429(0, now, None);
        assert_eq!(dur, Duration::from_secs(900));
        let snap = reg.snapshot_one(0, now);
        assert_eq!(snap.backoff_level_429, 0);
    }

    #[test]
    fn first_5xx_enters_at_level_zero() {
        let reg = PenaltyRegistry::new();
        let now = Instant::now();
        let dur = reg.penalize_5xx(0, now);
        assert_eq!(dur, Duration::from_secs(30));
        let snap = reg.snapshot_one(0, now);
        assert_eq!(snap.backoff_level_5xx, 0);
    }
}
