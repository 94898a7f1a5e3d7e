use std::time::Duration;

/// Tunables for one issuance engine instance.
///
/// All values are process-scoped and immutable after startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Interval width used when creating a segment without an explicit step.
    pub default_step_size: i32,
    /// Utilisation fraction past which a prefetch is armed.
    pub refresh_threshold: f64,
    /// Period of the heartbeat stamp.
    pub heartbeat_interval: Duration,
    /// Period of the failover scan.
    pub failover_scan_interval: Duration,
    /// Heartbeats older than this mark a node Offline.
    pub heartbeat_stale_after: Duration,
    /// A refresh claim older than this is considered dead and stolen.
    pub refresh_timeout: Duration,
    /// Upper bound on one prefetch task, store I/O included.
    pub prefetch_deadline: Duration,
    /// Largest batch a single generate call may request.
    pub max_batch_size: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_step_size: 1000,
            refresh_threshold: 0.1,
            heartbeat_interval: Duration::from_secs(30),
            failover_scan_interval: Duration::from_secs(30),
            heartbeat_stale_after: Duration::from_secs(90),
            refresh_timeout: Duration::from_secs(10),
            prefetch_deadline: Duration::from_secs(5),
            max_batch_size: 100_000,
        }
    }
}
