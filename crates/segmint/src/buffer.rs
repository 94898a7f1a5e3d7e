//! In-memory segment buffer: an atomic cursor over one reserved interval.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use crate::role::Role;

/// Result of one issuance attempt against a buffer.
///
/// `Exhausted` does not rewind the cursor; callers refill the buffer and take
/// again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeStatus {
    /// An ID was issued.
    Issued(i64),
    /// The interval is used up; a refill must install new bounds first.
    Exhausted,
}

/// One node's live window into a reserved interval.
///
/// The cursor is the only hot-path state and is advanced with a single
/// `fetch_add`. Everything else (bounds, refresh flag, refresh attempt
/// timestamp) changes rarely and is kept in atomics so no lock is ever taken
/// on the issuance path. Buffers never persist; the durable truth is the
/// segment record.
#[derive(Debug)]
pub struct SegmentBuffer {
    start: AtomicI64,
    end: AtomicI64,
    cursor: AtomicI64,
    role: Role,
    need_refresh: AtomicBool,
    /// Milliseconds since epoch of the last refresh claim; 0 = none.
    last_refresh_attempt: AtomicU64,
    refresh_timeout: Duration,
}

impl SegmentBuffer {
    /// A buffer holding the full interval `[start, end]`.
    pub fn new(start: i64, end: i64, role: Role, refresh_timeout: Duration) -> Self {
        Self {
            start: AtomicI64::new(start),
            end: AtomicI64::new(end),
            cursor: AtomicI64::new(start),
            role,
            need_refresh: AtomicBool::new(false),
            last_refresh_attempt: AtomicU64::new(0),
            refresh_timeout,
        }
    }

    /// A buffer that is born exhausted: the first `take` forces a refill.
    ///
    /// Used whenever the stored interval may already be partially issued and
    /// resuming it could duplicate IDs: adopting a record that existed before
    /// this process started, or taking over a dead peer's segments. The
    /// unissued remainder of the old interval is deliberately wasted.
    pub fn exhausted(max_value: i64, role: Role, refresh_timeout: Duration) -> Self {
        Self::new(max_value + 1, max_value, role, refresh_timeout)
    }

    /// Atomically claim the next ID, or report exhaustion.
    pub fn take(&self) -> TakeStatus {
        let id = self.cursor.fetch_add(1, Ordering::AcqRel);
        if id <= self.end.load(Ordering::Acquire) {
            TakeStatus::Issued(id)
        } else {
            TakeStatus::Exhausted
        }
    }

    /// Fraction of the interval consumed, clipped to `[0, 1]`.
    pub fn utilisation(&self) -> f64 {
        let start = self.start.load(Ordering::Acquire);
        let end = self.end.load(Ordering::Acquire);
        let cursor = self.cursor.load(Ordering::Acquire);
        let width = end - start + 1;
        if width <= 0 {
            return 1.0;
        }
        ((cursor - start) as f64 / width as f64).clamp(0.0, 1.0)
    }

    /// Claim the refresh flag (false -> true).
    ///
    /// On a lost race, a claim older than the refresh timeout is treated as a
    /// refresh task that died without reporting (network failure mid-write,
    /// killed task): the flag is force-reset and claimed once more. `now` is
    /// milliseconds since epoch.
    pub fn try_mark_refresh(&self, now: u64) -> bool {
        if self.claim_refresh(now) {
            return true;
        }
        let last = self.last_refresh_attempt.load(Ordering::Acquire);
        if last > 0 && now.saturating_sub(last) > self.refresh_timeout.as_millis() as u64 {
            tracing::warn!(
                stale_ms = now.saturating_sub(last),
                "refresh flag held past timeout, force-resetting"
            );
            self.need_refresh.store(false, Ordering::Release);
            return self.claim_refresh(now);
        }
        false
    }

    fn claim_refresh(&self, now: u64) -> bool {
        if self
            .need_refresh
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.last_refresh_attempt.store(now, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Install freshly reserved bounds and reset all refresh state.
    pub fn install(&self, new_start: i64, new_end: i64) {
        self.start.store(new_start, Ordering::Release);
        self.end.store(new_end, Ordering::Release);
        self.cursor.store(new_start, Ordering::Release);
        self.need_refresh.store(false, Ordering::Release);
        self.last_refresh_attempt.store(0, Ordering::Release);
    }

    /// Release the refresh flag after a failed refill so another caller can
    /// retry.
    pub fn clear_refresh(&self) {
        self.need_refresh.store(false, Ordering::Release);
        self.last_refresh_attempt.store(0, Ordering::Release);
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor.load(Ordering::Acquire) > self.end.load(Ordering::Acquire)
    }

    pub fn refresh_pending(&self) -> bool {
        self.need_refresh.load(Ordering::Acquire)
    }

    /// Whether a pending refresh claim has outlived the timeout.
    pub fn refresh_stuck(&self, now: u64) -> bool {
        if !self.refresh_pending() {
            return false;
        }
        let last = self.last_refresh_attempt.load(Ordering::Acquire);
        last > 0 && now.saturating_sub(last) > self.refresh_timeout.as_millis() as u64
    }

    /// IDs still unissued in the current interval (never negative).
    pub fn remaining(&self) -> i64 {
        let end = self.end.load(Ordering::Acquire);
        let cursor = self.cursor.load(Ordering::Acquire);
        (end - cursor + 1).max(0)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn bounds(&self) -> (i64, i64) {
        (
            self.start.load(Ordering::Acquire),
            self.end.load(Ordering::Acquire),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(10_000);

    #[test]
    fn issues_the_full_interval_inclusive() {
        let buf = SegmentBuffer::new(1, 5, Role::Odd, TIMEOUT);
        for expect in 1..=5 {
            assert_eq!(buf.take(), TakeStatus::Issued(expect));
        }
        assert_eq!(buf.take(), TakeStatus::Exhausted);
        assert_eq!(buf.take(), TakeStatus::Exhausted);
        assert!(buf.is_exhausted());
    }

    #[test]
    fn exhausted_constructor_never_issues() {
        let buf = SegmentBuffer::exhausted(1000, Role::Even, TIMEOUT);
        assert!(buf.is_exhausted());
        assert_eq!(buf.take(), TakeStatus::Exhausted);
        assert_eq!(buf.remaining(), 0);
        assert_eq!(buf.utilisation(), 1.0);
    }

    #[test]
    fn utilisation_tracks_consumption_and_clips() {
        let buf = SegmentBuffer::new(1, 10, Role::Odd, TIMEOUT);
        assert_eq!(buf.utilisation(), 0.0);
        for _ in 0..5 {
            buf.take();
        }
        assert!((buf.utilisation() - 0.5).abs() < f64::EPSILON);
        for _ in 0..20 {
            buf.take();
        }
        assert_eq!(buf.utilisation(), 1.0);
    }

    #[test]
    fn refresh_flag_is_claimed_once() {
        let buf = SegmentBuffer::new(1, 10, Role::Odd, TIMEOUT);
        assert!(buf.try_mark_refresh(1_000));
        assert!(!buf.try_mark_refresh(2_000));
        assert!(buf.refresh_pending());
        buf.clear_refresh();
        assert!(buf.try_mark_refresh(3_000));
    }

    #[test]
    fn stale_refresh_claim_is_stolen_after_timeout() {
        let buf = SegmentBuffer::new(1, 10, Role::Odd, TIMEOUT);
        assert!(buf.try_mark_refresh(1_000));
        // Within the timeout the claim holds.
        assert!(!buf.try_mark_refresh(1_000 + 9_999));
        assert!(!buf.refresh_stuck(1_000 + 9_999));
        // Past it, the next caller recovers the flag for itself.
        assert!(buf.refresh_stuck(1_000 + 10_001));
        assert!(buf.try_mark_refresh(1_000 + 10_001));
        assert!(buf.refresh_pending());
    }

    #[test]
    fn install_resets_cursor_and_refresh_state() {
        let buf = SegmentBuffer::new(1, 2, Role::Odd, TIMEOUT);
        buf.take();
        buf.take();
        assert!(buf.try_mark_refresh(500));
        buf.install(2001, 3000);
        assert!(!buf.refresh_pending());
        assert_eq!(buf.bounds(), (2001, 3000));
        assert_eq!(buf.take(), TakeStatus::Issued(2001));
        assert_eq!(buf.remaining(), 999);
    }

    #[test]
    fn concurrent_takes_are_unique_and_in_range() {
        use std::collections::HashSet;
        use std::sync::Arc;

        let buf = Arc::new(SegmentBuffer::new(1, 4000, Role::Odd, TIMEOUT));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let buf = Arc::clone(&buf);
            handles.push(std::thread::spawn(move || {
                let mut got = Vec::new();
                loop {
                    match buf.take() {
                        TakeStatus::Issued(id) => got.push(id),
                        TakeStatus::Exhausted => break,
                    }
                }
                got
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.join().unwrap());
        }
        assert_eq!(all.len(), 4000);
        let unique: HashSet<i64> = all.iter().copied().collect();
        assert_eq!(unique.len(), 4000);
        assert!(all.iter().all(|id| (1..=4000).contains(id)));
    }
}
