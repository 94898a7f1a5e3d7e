//! Downstream shard-routing hints.
//!
//! Pure arithmetic over an issued ID and caller-supplied shard counts; the
//! engine never looks at these values.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RoutingHint {
    pub db_index: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_index: Option<i64>,
    pub shard_db_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard_table_count: Option<u32>,
    pub routing_key: i64,
}

/// Route an ID across `shard_db_count` databases and, optionally,
/// `shard_table_count` tables per database. Computed from the first ID of a
/// batch so one batch lands in one shard.
pub fn routing_hint(id: i64, shard_db_count: u32, shard_table_count: Option<u32>) -> RoutingHint {
    let db_count = i64::from(shard_db_count.max(1));
    RoutingHint {
        db_index: id.rem_euclid(db_count),
        table_index: shard_table_count.map(|t| (id / db_count).rem_euclid(i64::from(t.max(1)))),
        shard_db_count,
        shard_table_count,
        routing_key: id,
    }
}
