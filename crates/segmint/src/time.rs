use std::time::{SystemTime, UNIX_EPOCH};

/// Source of wall-clock milliseconds.
///
/// The engine never calls `SystemTime::now()` directly; everything that needs
/// a timestamp goes through this trait so that tests can step time manually
/// (stuck-refresh recovery in particular is driven purely by elapsed
/// milliseconds).
pub trait TimeSource: Send + Sync + 'static {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> u64;
}

/// System clock implementation used in production.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// The default time key substituted when a request carries none: the current
/// local date as `yyyymmdd`.
pub fn default_time_key() -> String {
    chrono::Local::now().format("%Y%m%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_recent() {
        // Anything after 2020-01-01 and before 2100 counts as sane here.
        let ms = SystemClock.now_millis();
        assert!(ms > 1_577_836_800_000);
        assert!(ms < 4_102_444_800_000);
    }

    #[test]
    fn default_time_key_is_eight_digits() {
        let key = default_time_key();
        assert_eq!(key.len(), 8);
        assert!(key.bytes().all(|b| b.is_ascii_digit()));
    }
}
