use std::time::Duration;

use anyhow::bail;
use clap::Parser;
use segmint::{EngineConfig, NodeRegistry, Role};

/// Runtime configuration for the `segmint-server` binary.
///
/// Everything is settable by CLI flag or environment variable. The role and
/// the store location are the only things a deployment must decide; the rest
/// defaults to values sized for production traffic.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "segmint-server",
    version,
    about = "Dual-role segmented ID issuance service"
)]
pub struct CliArgs {
    /// Interval-parity role of this node: "even" or "odd".
    ///
    /// Exactly one node per role; the two nodes share the segment store.
    #[arg(long, env = "SEGMINT_ROLE")]
    pub role: String,

    /// PostgreSQL connection string for the shared segment store.
    #[arg(long, env = "SEGMINT_DATABASE_URL")]
    pub database_url: Option<String>,

    /// Serve from a process-local in-memory store instead of PostgreSQL.
    /// Nothing survives a restart and nothing is shared with a peer; for
    /// demos and tests only.
    #[arg(long, default_value_t = false)]
    pub memory_store: bool,

    /// Address to listen on.
    #[arg(long, env = "SEGMINT_LISTEN_ADDR", default_value_t = String::from("0.0.0.0:8040"))]
    pub listen_addr: String,

    /// Node identity as registered with the store. Derived from hostname,
    /// pid and role when omitted.
    #[arg(long, env = "SEGMINT_NODE_ID")]
    pub node_id: Option<String>,

    /// Interval width used when a segment is first created.
    #[arg(long, env = "SEGMINT_DEFAULT_STEP_SIZE", default_value_t = 1000)]
    pub default_step_size: i32,

    /// Buffer utilisation fraction past which a prefetch is armed.
    #[arg(long, env = "SEGMINT_REFRESH_THRESHOLD", default_value_t = 0.1)]
    pub refresh_threshold: f64,

    #[arg(long, env = "SEGMINT_HEARTBEAT_INTERVAL_MS", default_value_t = 30_000)]
    pub heartbeat_interval_ms: u64,

    #[arg(long, env = "SEGMINT_FAILOVER_SCAN_INTERVAL_MS", default_value_t = 30_000)]
    pub failover_scan_interval_ms: u64,

    /// Heartbeats older than this mark a node Offline.
    #[arg(long, env = "SEGMINT_HEARTBEAT_STALE_MS", default_value_t = 90_000)]
    pub heartbeat_stale_ms: u64,

    /// A refresh claim older than this is considered dead and stolen.
    #[arg(long, env = "SEGMINT_REFRESH_TIMEOUT_MS", default_value_t = 10_000)]
    pub refresh_timeout_ms: u64,

    /// Upper bound on one prefetch task, store I/O included.
    #[arg(long, env = "SEGMINT_PREFETCH_DEADLINE_MS", default_value_t = 5_000)]
    pub prefetch_deadline_ms: u64,

    /// Largest batch a single request may ask for.
    #[arg(long, env = "SEGMINT_MAX_BATCH_SIZE", default_value_t = 100_000)]
    pub max_batch_size: u32,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub role: Role,
    pub database_url: Option<String>,
    pub memory_store: bool,
    pub listen_addr: String,
    pub node_id: String,
    pub engine: EngineConfig,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let role: Role = match args.role.parse() {
            Ok(role) => role,
            Err(err) => bail!("invalid SEGMINT_ROLE: {err}"),
        };

        if !args.memory_store && args.database_url.is_none() {
            bail!("SEGMINT_DATABASE_URL is required unless --memory-store is set");
        }
        if args.default_step_size <= 0 {
            bail!("SEGMINT_DEFAULT_STEP_SIZE must be positive");
        }
        if !(args.refresh_threshold > 0.0 && args.refresh_threshold < 1.0) {
            bail!("SEGMINT_REFRESH_THRESHOLD must lie strictly between 0 and 1");
        }
        if args.max_batch_size == 0 {
            bail!("SEGMINT_MAX_BATCH_SIZE must be positive");
        }

        let node_id = args
            .node_id
            .unwrap_or_else(|| NodeRegistry::default_node_id(role));

        Ok(Self {
            role,
            database_url: args.database_url,
            memory_store: args.memory_store,
            listen_addr: args.listen_addr,
            node_id,
            engine: EngineConfig {
                default_step_size: args.default_step_size,
                refresh_threshold: args.refresh_threshold,
                heartbeat_interval: Duration::from_millis(args.heartbeat_interval_ms),
                failover_scan_interval: Duration::from_millis(args.failover_scan_interval_ms),
                heartbeat_stale_after: Duration::from_millis(args.heartbeat_stale_ms),
                refresh_timeout: Duration::from_millis(args.refresh_timeout_ms),
                prefetch_deadline: Duration::from_millis(args.prefetch_deadline_ms),
                max_batch_size: args.max_batch_size,
            },
        })
    }
}
