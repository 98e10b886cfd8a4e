//! Host selection strategies
//!
//! Chooses which endpoint in a backend's endpoint set services a creation
//! request. Selection happens once per create and never for delete, which
//! must locate the endpoint already holding the instance.
//!
//! The strategy is a trait so the placeholder policy can be swapped for a
//! capacity-aware one without touching the lifecycle code. Selectors work
//! on indices rather than endpoint values to stay agnostic of the endpoint
//! type.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Strategy for picking one endpoint out of `len` configured ones.
///
/// `len` is never zero: configuration loading fails before an empty
/// endpoint set can be constructed.
pub trait HostSelector: Send + Sync {
    fn pick(&self, len: usize) -> usize;
}

/// Placeholder load-balancing policy: a single endpoint is returned
/// unconditionally, several are picked uniformly at random. Not
/// capacity-aware.
#[derive(Debug, Default)]
pub struct RandomSelector;

impl HostSelector for RandomSelector {
    fn pick(&self, len: usize) -> usize {
        if len == 1 {
            return 0;
        }
        fastrand::usize(..len)
    }
}

/// Round-robin alternative. Unused by default; exists to prove the
/// lifecycle code is strategy-agnostic.
#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    next: AtomicUsize,
}

impl HostSelector for RoundRobinSelector {
    fn pick(&self, len: usize) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_endpoint_is_deterministic() {
        let selector = RandomSelector;
        for _ in 0..100 {
            assert_eq!(selector.pick(1), 0);
        }
    }

    #[test]
    fn test_random_selection_is_well_formed() {
        let selector = RandomSelector;
        for _ in 0..1000 {
            assert!(selector.pick(4) < 4);
        }
    }

    #[test]
    fn test_random_selection_spreads_over_endpoints() {
        // Statistical spread, not exact counts: over many trials every
        // endpoint should be picked and none should dominate outright.
        let selector = RandomSelector;
        let trials = 4000;
        let mut counts = [0usize; 4];
        for _ in 0..trials {
            counts[selector.pick(4)] += 1;
        }
        for (i, &count) in counts.iter().enumerate() {
            assert!(count > 0, "endpoint {} was never selected", i);
            assert!(
                count < trials * 3 / 4,
                "endpoint {} concentrated {} of {} picks",
                i,
                count,
                trials
            );
        }
    }

    #[test]
    fn test_round_robin_cycles() {
        let selector = RoundRobinSelector::default();
        let picks: Vec<usize> = (0..6).map(|_| selector.pick(3)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }
}
