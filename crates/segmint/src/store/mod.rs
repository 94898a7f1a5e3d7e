//! Segment store interface.
//!
//! The store is the only state shared between the two nodes. Correctness
//! leans entirely on its atomic single-row updates and a unique index over
//! (business_type, time_key, role); no multi-row transactions and no
//! distributed locks are required of it.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::role::Role;

/// One persistent segment row: the last interval a role claimed for a
/// (business type, time key) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Segment {
    pub business_type: String,
    pub time_key: String,
    pub role: Role,
    /// Inclusive upper bound of the last claimed interval. Never moves
    /// backward.
    pub max_value: i64,
    pub step_size: i32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Offline,
    Online,
}

impl NodeStatus {
    pub const fn code(self) -> i16 {
        match self {
            NodeStatus::Offline => 0,
            NodeStatus::Online => 1,
        }
    }

    pub const fn from_code(code: i16) -> Self {
        if code == 1 {
            NodeStatus::Online
        } else {
            NodeStatus::Offline
        }
    }
}

/// One registered node instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeRecord {
    pub node_id: String,
    pub role: Role,
    pub status: NodeStatus,
    pub last_heartbeat: DateTime<Utc>,
}

/// Typed operations over the two shared tables.
///
/// Every method either succeeds fully or leaves the store unchanged. Writes
/// must be atomic at row granularity and reads must observe the caller's own
/// completed writes.
#[async_trait]
pub trait SegmentStore: Send + Sync {
    async fn get_segment(
        &self,
        business_type: &str,
        time_key: &str,
        role: Role,
    ) -> Result<Option<Segment>>;

    /// Insert the row if absent and return what is stored, plus whether this
    /// call inserted it. Racing creators are resolved by the unique index;
    /// exactly one caller observes `true`. Only the inserting caller may
    /// treat the initial interval as unissued.
    async fn create_segment(
        &self,
        business_type: &str,
        time_key: &str,
        role: Role,
        initial_max: i64,
        step: i32,
    ) -> Result<(Segment, bool)>;

    /// Store a new `max_value`. The row's maximum never moves backward: a
    /// write that does not advance it matches no rows. Returns rows affected,
    /// so 0 means either the row vanished or a concurrent writer already
    /// claimed this ground; the caller recomputes from fresh state.
    async fn set_max_value(
        &self,
        business_type: &str,
        time_key: &str,
        role: Role,
        new_max: i64,
    ) -> Result<u64>;

    /// Store `max_value` and `step_size` together in one atomic update, with
    /// the same advance-only rule as [`set_max_value`](Self::set_max_value).
    async fn set_max_value_and_step(
        &self,
        business_type: &str,
        time_key: &str,
        role: Role,
        new_max: i64,
        new_step: i32,
    ) -> Result<u64>;

    /// All segments of a business type, optionally narrowed to one time key.
    async fn list_segments(
        &self,
        business_type: &str,
        time_key: Option<&str>,
    ) -> Result<Vec<Segment>>;

    /// All segments claimed under `role`, across businesses.
    async fn list_role_segments(&self, role: Role) -> Result<Vec<Segment>>;

    async fn list_business_types(&self) -> Result<Vec<String>>;

    /// Delete rows with `time_key < cutoff` (lexicographic). Returns the
    /// number of deleted rows.
    async fn delete_expired(&self, cutoff: &str) -> Result<u64>;

    /// Sum of `max_value` over all rows of a role; a coarse load signal used
    /// for balancing, not for correctness.
    async fn sum_max_value(&self, role: Role) -> Result<i64>;

    // Node registry rows.

    /// Insert or revive this node's row: Online, heartbeat stamped.
    async fn upsert_node(&self, node_id: &str, role: Role) -> Result<()>;

    /// Stamp the heartbeat. Returns rows affected (0 means the node row is
    /// gone and the caller should re-register).
    async fn touch_heartbeat(&self, node_id: &str) -> Result<u64>;

    async fn set_node_status(&self, node_id: &str, status: NodeStatus) -> Result<u64>;

    async fn count_online(&self, role: Role) -> Result<i64>;

    /// Mark Online nodes whose heartbeat predates `cutoff` as Offline.
    async fn mark_stale_offline(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn list_nodes(&self) -> Result<Vec<NodeRecord>>;
}
