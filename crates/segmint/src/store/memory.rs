//! In-memory segment store.
//!
//! Backs the integration tests and the `--memory-store` embedded mode of the
//! server. Single-process only; the map mutations are serialized by the
//! store locks, giving the same atomic-row guarantees the SQL adapter gets
//! from its database.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::Result;
use crate::role::Role;
use crate::store::{NodeRecord, NodeStatus, Segment, SegmentStore};

type SegmentKey = (String, String, Role);

#[derive(Default)]
pub struct MemoryStore {
    segments: RwLock<BTreeMap<SegmentKey, Segment>>,
    nodes: RwLock<BTreeMap<String, NodeRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(business_type: &str, time_key: &str, role: Role) -> SegmentKey {
        (business_type.to_owned(), time_key.to_owned(), role)
    }
}

#[async_trait]
impl SegmentStore for MemoryStore {
    async fn get_segment(
        &self,
        business_type: &str,
        time_key: &str,
        role: Role,
    ) -> Result<Option<Segment>> {
        let segments = self.segments.read();
        Ok(segments.get(&Self::key(business_type, time_key, role)).cloned())
    }

    async fn create_segment(
        &self,
        business_type: &str,
        time_key: &str,
        role: Role,
        initial_max: i64,
        step: i32,
    ) -> Result<(Segment, bool)> {
        let mut segments = self.segments.write();
        match segments.entry(Self::key(business_type, time_key, role)) {
            std::collections::btree_map::Entry::Occupied(entry) => Ok((entry.get().clone(), false)),
            std::collections::btree_map::Entry::Vacant(entry) => {
                let row = entry.insert(Segment {
                    business_type: business_type.to_owned(),
                    time_key: time_key.to_owned(),
                    role,
                    max_value: initial_max,
                    step_size: step,
                    updated_at: Utc::now(),
                });
                Ok((row.clone(), true))
            }
        }
    }

    async fn set_max_value(
        &self,
        business_type: &str,
        time_key: &str,
        role: Role,
        new_max: i64,
    ) -> Result<u64> {
        let mut segments = self.segments.write();
        match segments.get_mut(&Self::key(business_type, time_key, role)) {
            Some(row) if new_max > row.max_value => {
                row.max_value = new_max;
                row.updated_at = Utc::now();
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn set_max_value_and_step(
        &self,
        business_type: &str,
        time_key: &str,
        role: Role,
        new_max: i64,
        new_step: i32,
    ) -> Result<u64> {
        let mut segments = self.segments.write();
        match segments.get_mut(&Self::key(business_type, time_key, role)) {
            Some(row) if new_max > row.max_value => {
                row.max_value = new_max;
                row.step_size = new_step;
                row.updated_at = Utc::now();
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn list_segments(
        &self,
        business_type: &str,
        time_key: Option<&str>,
    ) -> Result<Vec<Segment>> {
        let segments = self.segments.read();
        Ok(segments
            .values()
            .filter(|s| s.business_type == business_type)
            .filter(|s| time_key.map_or(true, |t| s.time_key == t))
            .cloned()
            .collect())
    }

    async fn list_role_segments(&self, role: Role) -> Result<Vec<Segment>> {
        let segments = self.segments.read();
        Ok(segments.values().filter(|s| s.role == role).cloned().collect())
    }

    async fn list_business_types(&self) -> Result<Vec<String>> {
        let segments = self.segments.read();
        let mut types: Vec<String> = segments
            .values()
            .map(|s| s.business_type.clone())
            .collect();
        types.sort();
        types.dedup();
        Ok(types)
    }

    async fn delete_expired(&self, cutoff: &str) -> Result<u64> {
        let mut segments = self.segments.write();
        let before = segments.len();
        segments.retain(|_, s| s.time_key.as_str() >= cutoff);
        Ok((before - segments.len()) as u64)
    }

    async fn sum_max_value(&self, role: Role) -> Result<i64> {
        let segments = self.segments.read();
        Ok(segments
            .values()
            .filter(|s| s.role == role)
            .map(|s| s.max_value)
            .sum())
    }

    async fn upsert_node(&self, node_id: &str, role: Role) -> Result<()> {
        let mut nodes = self.nodes.write();
        nodes.insert(
            node_id.to_owned(),
            NodeRecord {
                node_id: node_id.to_owned(),
                role,
                status: NodeStatus::Online,
                last_heartbeat: Utc::now(),
            },
        );
        Ok(())
    }

    async fn touch_heartbeat(&self, node_id: &str) -> Result<u64> {
        let mut nodes = self.nodes.write();
        match nodes.get_mut(node_id) {
            Some(node) => {
                node.last_heartbeat = Utc::now();
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn set_node_status(&self, node_id: &str, status: NodeStatus) -> Result<u64> {
        let mut nodes = self.nodes.write();
        match nodes.get_mut(node_id) {
            Some(node) => {
                node.status = status;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn count_online(&self, role: Role) -> Result<i64> {
        let nodes = self.nodes.read();
        Ok(nodes
            .values()
            .filter(|n| n.role == role && n.status == NodeStatus::Online)
            .count() as i64)
    }

    async fn mark_stale_offline(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut nodes = self.nodes.write();
        let mut flipped = 0;
        for node in nodes.values_mut() {
            if node.status == NodeStatus::Online && node.last_heartbeat < cutoff {
                node.status = NodeStatus::Offline;
                flipped += 1;
            }
        }
        Ok(flipped)
    }

    async fn list_nodes(&self) -> Result<Vec<NodeRecord>> {
        let nodes = self.nodes.read();
        Ok(nodes.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_is_idempotent_and_reports_the_winner() {
        let store = MemoryStore::new();
        let (first, created) = store.create_segment("order", "20240101", Role::Odd, 1000, 1000).await.unwrap();
        assert!(created);
        let (second, created) = store.create_segment("order", "20240101", Role::Odd, 9999, 500).await.unwrap();
        assert!(!created);
        assert_eq!(first.max_value, second.max_value);
        assert_eq!(second.step_size, 1000);
    }

    #[tokio::test]
    async fn updates_report_rows_affected() {
        let store = MemoryStore::new();
        assert_eq!(store.set_max_value("order", "", Role::Odd, 2000).await.unwrap(), 0);
        store.create_segment("order", "", Role::Odd, 1000, 1000).await.unwrap();
        assert_eq!(store.set_max_value("order", "", Role::Odd, 3000).await.unwrap(), 1);
        let row = store.get_segment("order", "", Role::Odd).await.unwrap().unwrap();
        assert_eq!(row.max_value, 3000);
        // The maximum never moves backward, and re-writing the same value is
        // a lost race, not a success.
        assert_eq!(store.set_max_value("order", "", Role::Odd, 3000).await.unwrap(), 0);
        assert_eq!(store.set_max_value("order", "", Role::Odd, 2000).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn expiry_deletes_strictly_older_time_keys() {
        let store = MemoryStore::new();
        store.create_segment("order", "20240101", Role::Odd, 1000, 1000).await.unwrap();
        store.create_segment("order", "20240201", Role::Odd, 1000, 1000).await.unwrap();
        store.create_segment("user", "20240301", Role::Even, 2000, 1000).await.unwrap();
        assert_eq!(store.delete_expired("20240201").await.unwrap(), 1);
        assert!(store.get_segment("order", "20240101", Role::Odd).await.unwrap().is_none());
        assert!(store.get_segment("order", "20240201", Role::Odd).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stale_nodes_flip_offline() {
        let store = MemoryStore::new();
        store.upsert_node("a-1-odd", Role::Odd).await.unwrap();
        assert_eq!(store.count_online(Role::Odd).await.unwrap(), 1);
        let future = Utc::now() + chrono::Duration::seconds(120);
        assert_eq!(store.mark_stale_offline(future).await.unwrap(), 1);
        assert_eq!(store.count_online(Role::Odd).await.unwrap(), 0);
        // Re-registration revives the same row.
        store.upsert_node("a-1-odd", Role::Odd).await.unwrap();
        assert_eq!(store.count_online(Role::Odd).await.unwrap(), 1);
    }
}
