//! Node registration, heartbeat, and peer liveness.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::role::Role;
use crate::store::{NodeStatus, SegmentStore};

/// This node's identity and its view of the peer, persisted through the
/// shared store. There is no leader: both roles run the same registry logic.
pub struct NodeRegistry {
    node_id: String,
    role: Role,
    store: Arc<dyn SegmentStore>,
}

impl NodeRegistry {
    pub fn new(node_id: String, role: Role, store: Arc<dyn SegmentStore>) -> Self {
        Self {
            node_id,
            role,
            store,
        }
    }

    /// Default node identity: `host-pid-role`.
    pub fn default_node_id(role: Role) -> String {
        let host = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "localhost".to_owned());
        format!("{host}-{}-{role}", std::process::id())
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Upsert this node as Online with a fresh heartbeat. Called at startup
    /// and whenever a heartbeat notices the row has vanished.
    pub async fn register(&self) -> Result<()> {
        self.store.upsert_node(&self.node_id, self.role).await?;
        tracing::info!(node_id = %self.node_id, role = %self.role, "node registered");
        Ok(())
    }

    /// Stamp the heartbeat, re-registering if the row disappeared.
    pub async fn beat(&self) -> Result<()> {
        if self.store.touch_heartbeat(&self.node_id).await? == 0 {
            tracing::warn!(node_id = %self.node_id, "node row missing, re-registering");
            self.register().await?;
        }
        Ok(())
    }

    /// Mark this node Offline; used on graceful shutdown.
    pub async fn deregister(&self) -> Result<()> {
        self.store
            .set_node_status(&self.node_id, NodeStatus::Offline)
            .await?;
        Ok(())
    }

    /// At least one Online node of the given role.
    pub async fn role_online(&self, role: Role) -> Result<bool> {
        Ok(self.store.count_online(role).await? > 0)
    }

    pub async fn peer_online(&self) -> Result<bool> {
        self.role_online(self.role.peer()).await
    }

    /// Flip Online rows whose heartbeat is older than `threshold` to
    /// Offline. Heartbeat loss is what drives failover.
    pub async fn sweep_stale(&self, threshold: Duration) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(threshold)
                .unwrap_or_else(|_| chrono::Duration::seconds(90));
        let swept = self.store.mark_stale_offline(cutoff).await?;
        if swept > 0 {
            tracing::warn!(swept, "marked stale nodes offline");
        }
        Ok(swept)
    }
}

/// Spawn the periodic heartbeat. The loop logs and continues on store
/// failure; the next tick retries.
pub fn spawn_heartbeat(registry: Arc<NodeRegistry>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = registry.beat().await {
                tracing::warn!(error = %err, "heartbeat failed");
            }
        }
    })
}
