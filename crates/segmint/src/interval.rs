//! Odd/even interval arithmetic.
//!
//! Interval `k` (k = 0, 1, 2, ...) covers `[k*S + 1, (k+1)*S]` for step size
//! `S`. The Odd role owns even `k`, the Even role owns odd `k`. A segment
//! record stores only the inclusive upper bound (`max_value`) of the last
//! interval its role claimed; everything else is derived here.
//!
//! All functions are pure so the partitioning rules can be tested without a
//! store or a buffer in sight.

use crate::role::Role;

/// An inclusive ID interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: i64,
    pub end: i64,
}

impl Span {
    pub const fn width(self) -> i64 {
        self.end - self.start + 1
    }
}

/// Upper bound of the first interval a role claims on a fresh record.
///
/// Odd claims interval 0 (`[1, S]`), Even claims interval 1 (`[S+1, 2S]`).
pub const fn initial_max_value(step: i64, role: Role) -> i64 {
    match role {
        Role::Odd => step,
        Role::Even => 2 * step,
    }
}

/// Index of the interval whose upper bound is `max_value`.
///
/// `max_value` must be >= 1.
pub const fn interval_index(max_value: i64, step: i64) -> i64 {
    (max_value - 1) / step
}

/// Start of the interval that ends at `max_value`.
pub const fn interval_start(max_value: i64, step: i64) -> i64 {
    interval_index(max_value, step) * step + 1
}

/// Whether `max_value` sits on an interval boundary owned by `role`.
///
/// False means the record was written with mismatched parity (or a step it
/// was never aligned to) and must not be issued from.
pub fn parity_matches(max_value: i64, step: i64, role: Role) -> bool {
    if max_value < step || max_value % step != 0 {
        return false;
    }
    role.owns_interval(interval_index(max_value, step))
}

/// The next interval `role` may claim, strictly above `global_max`.
///
/// `global_max` is the larger of the two roles' stored `max_value`s (callers
/// substitute `step` when neither record exists, so `global_max >= 1` always
/// holds). Advancing from the global maximum rather than the role's own one
/// is what keeps a refill from landing inside an interval the peer claimed
/// while this node was not looking, including the single-role stretches of a
/// failover.
pub fn next_interval(global_max: i64, step: i64, role: Role) -> Span {
    debug_assert!(global_max >= 1);
    debug_assert!(step >= 1);
    let global_k = interval_index(global_max, step);
    let mut candidate = global_k + 1;
    if !role.owns_interval(candidate) {
        candidate += 1;
    }
    Span {
        start: candidate * step + 1,
        end: (candidate + 1) * step,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const S: i64 = 1000;

    #[test]
    fn initial_claims() {
        assert_eq!(initial_max_value(S, Role::Odd), 1000);
        assert_eq!(initial_max_value(S, Role::Even), 2000);
    }

    #[test]
    fn start_of_interval_ending_at_max() {
        assert_eq!(interval_start(1000, S), 1);
        assert_eq!(interval_start(2000, S), 1001);
        assert_eq!(interval_start(3000, S), 2001);
        assert_eq!(interval_start(6000, 2000), 4001);
    }

    #[test]
    fn parity_accepts_only_owned_boundaries() {
        assert!(parity_matches(1000, S, Role::Odd)); // k = 0
        assert!(parity_matches(2000, S, Role::Even)); // k = 1
        assert!(parity_matches(3000, S, Role::Odd)); // k = 2
        assert!(!parity_matches(2000, S, Role::Odd));
        assert!(!parity_matches(3000, S, Role::Even));
        // Off-boundary values are corrupt for either role.
        assert!(!parity_matches(1500, S, Role::Odd));
        assert!(!parity_matches(1500, S, Role::Even));
        assert!(!parity_matches(0, S, Role::Odd));
    }

    #[test]
    fn next_interval_skips_the_peers_slot() {
        // Fresh Odd record consumed up to 1000; the peer holds [1001, 2000],
        // so the next Odd interval is [2001, 3000].
        let span = next_interval(1000, S, Role::Odd);
        assert_eq!(span, Span { start: 2001, end: 3000 });

        // From the same global point, Even jumps over its own history into
        // [3001, 4000] only if 2000 is the global max; from 1000 it takes
        // [1001, 2000].
        let span = next_interval(1000, S, Role::Even);
        assert_eq!(span, Span { start: 1001, end: 2000 });
    }

    #[test]
    fn next_interval_from_mixed_progress() {
        // Odd at 3000, Even at 2000: global max is 3000 (interval 2).
        // Candidate 3 belongs to Even, so Odd advances to interval 4.
        let span = next_interval(3000, S, Role::Odd);
        assert_eq!(span, Span { start: 4001, end: 5000 });

        // Even from the same point takes interval 3 directly.
        let span = next_interval(3000, S, Role::Even);
        assert_eq!(span, Span { start: 3001, end: 4000 });
    }

    #[test]
    fn next_interval_with_new_step_stays_above_history() {
        // Step change 1000 -> 2000 with global max 3000: the index grid is
        // recomputed with the new width, and the chosen interval still lies
        // strictly above everything either role ever claimed.
        let span = next_interval(3000, 2000, Role::Odd);
        assert!(span.start > 3000);
        assert_eq!(span, Span { start: 4001, end: 6000 }); // k = 2
        let span = next_interval(3000, 2000, Role::Even);
        assert_eq!(span, Span { start: 6001, end: 8000 }); // k = 3
    }

    #[test]
    fn next_interval_width_is_the_step() {
        for step in [1, 7, 100, 1000, 4096] {
            for global in [step, 3 * step, 17 * step] {
                for role in [Role::Even, Role::Odd] {
                    let span = next_interval(global, step, role);
                    assert_eq!(span.width(), step);
                    assert!(span.start > global);
                    assert!(parity_matches(span.end, step, role));
                }
            }
        }
    }
}
