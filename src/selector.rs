// KeySelector — pure, stateless selection policy. Reads KeyStore, the
// PenaltyRegistry, and the UsageLedger; never mutates or locks across I/O.
// Staleness of the usage figures by seconds is acceptable — the penalty
// box provides the hard correctness guarantees (spec rationale).

use crate::keys::KeyStore;
use crate::penalty::PenaltyRegistry;
use crate::usage::UsageLedger;
use std::collections::HashSet;
use std::time::Instant;

pub struct KeySelector;

impl KeySelector {
    /// Select the next key to try, excluding anything already attempted
    /// for this inbound request.
    pub fn select(
        keys: &KeyStore,
        penalties: &PenaltyRegistry,
        usage: &UsageLedger,
        exclude_set: &HashSet<usize>,
    ) -> Option<usize> {
        let now = Instant::now();
        let not_excluded: Vec<usize> = keys
            .indices()
            .filter(|i| !exclude_set.contains(i))
            .collect();

        let candidates: Vec<usize> = not_excluded
            .iter()
            .copied()
            .filter(|i| !penalties.is_penalized(*i, now))
            .collect();

        if candidates.is_empty() {
            return penalties.earliest_expiry(&not_excluded);
        }

        if candidates.len() == 1 {
            return Some(candidates[0]);
        }

        let usage_map = usage.usage_2h(&candidates).unwrap_or_default();
        candidates
            .into_iter()
            .min_by_key(|i| (usage_map.get(i).copied().unwrap_or(0), *i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(n: usize) -> KeyStore {
        KeyStore::new((0..n).map(|i| format!("key-{i}")).collect())
    }

    #[test]
    fn never_returns_excluded_key() {
        let keys = store(3);
        let penalties = PenaltyRegistry::new();
        let usage = UsageLedger::open_in_memory().unwrap();
        let mut excluded = HashSet::new();
        excluded.insert(0);
        excluded.insert(1);
        let picked = KeySelector::select(&keys, &penalties, &usage, &excluded);
        assert_eq!(picked, Some(2));
    }

    #[test]
    fn prefers_non_penalized_over_penalized() {
        let keys = store(2);
        let penalties = PenaltyRegistry::new();
        penalties.penalize_429(0, Instant::now(), None);
        let usage = UsageLedger::open_in_memory().unwrap();
        let picked = KeySelector::select(&keys, &penalties, &usage, &HashSet::new());
        assert_eq!(picked, Some(1));
    }

    #[test]
    fn all_penalized_returns_earliest_expiry() {
        let keys = store(2);
        let penalties = PenaltyRegistry::new();
        let now = Instant::now();
        penalties.penalize_5xx(0, now); // 30s
        penalties.penalize_429(1, now, None); // 900s
        let usage = UsageLedger::open_in_memory().unwrap();
        let picked = KeySelector::select(&keys, &penalties, &usage, &HashSet::new());
        assert_eq!(picked, Some(0));
    }

    #[test]
    fn picks_lowest_usage_with_tie_break_on_index() {
        let keys = store(2);
        let penalties = PenaltyRegistry::new();
        let usage = UsageLedger::open_in_memory().unwrap();
        usage.record("c", 0, "m", 1000, 0).unwrap();
        usage.record("c", 1, "m", 10, 0).unwrap();
        let picked = KeySelector::select(&keys, &penalties, &usage, &HashSet::new());
        assert_eq!(picked, Some(1));
    }

    #[test]
    fn no_candidates_at_all_returns_none() {
        let keys = store(1);
        let penalties = PenaltyRegistry::new();
        let usage = UsageLedger::open_in_memory().unwrap();
        let mut excluded = HashSet::new();
        excluded.insert(0);
        assert_eq!(
            KeySelector::select(&keys, &penalties, &usage, &excluded),
            None
        );
    }
}
