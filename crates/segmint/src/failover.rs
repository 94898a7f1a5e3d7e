//! Role selection and the peer failover protocol.
//!
//! Heartbeat loss is the only failover trigger. When the peer drops out,
//! this node adopts the peer's segments through proxy buffers and keeps both
//! interval classes advancing. When the peer returns, every proxy buffer is
//! dropped outright (their unissued IDs are wasted on purpose) and this
//! node's own buffers are invalidated too, so the next request re-anchors to
//! whatever maximum the peer pushed while it was alone.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::buffer::SegmentBuffer;
use crate::engine::{BufferKey, IssuanceEngine};
use crate::error::Result;
use crate::role::Role;
use crate::store::Segment;

/// Pick the role a request should issue under.
///
/// With both roles online the lighter side wins so the interval classes stay
/// balanced. With one side online this node serves both classes. With
/// neither visible (a store hiccup, or the very first boot of the cluster)
/// the node falls back to its own role rather than refusing service.
pub(crate) async fn select_role(
    engine: &Arc<IssuanceEngine>,
    business_type: &str,
    time_key: &str,
    forced: Option<Role>,
) -> Result<Role> {
    if let Some(role) = forced {
        return Ok(role);
    }

    let even_online = engine.registry.role_online(Role::Even).await?;
    let odd_online = engine.registry.role_online(Role::Odd).await?;

    match (even_online, odd_online) {
        (true, true) => least_loaded(engine, business_type, time_key, false).await,
        (true, false) | (false, true) => least_loaded(engine, business_type, time_key, true).await,
        (false, false) => {
            tracing::warn!(
                role = %engine.registry.role(),
                "no online nodes visible, falling back to own role"
            );
            Ok(engine.registry.role())
        }
    }
}

/// The least-loaded rule shared by balanced and single-role operation:
/// compare `max_value / step_size` of the two segment rows, prefer a role
/// with no row yet, and fall back to cluster-wide load sums (or, in
/// single-role operation, a key hash for even spread) when neither exists.
async fn least_loaded(
    engine: &Arc<IssuanceEngine>,
    business_type: &str,
    time_key: &str,
    single_role: bool,
) -> Result<Role> {
    let even = engine
        .store
        .get_segment(business_type, time_key, Role::Even)
        .await?;
    let odd = engine
        .store
        .get_segment(business_type, time_key, Role::Odd)
        .await?;

    match (even.as_ref(), odd.as_ref()) {
        (Some(even), Some(odd)) => Ok(lighter_of(even, odd)),
        (None, Some(_)) => Ok(Role::Even),
        (Some(_), None) => Ok(Role::Odd),
        (None, None) if single_role => Ok(hash_role(business_type, time_key)),
        (None, None) => {
            let even_load = engine.store.sum_max_value(Role::Even).await?;
            let odd_load = engine.store.sum_max_value(Role::Odd).await?;
            if even_load < odd_load {
                Ok(Role::Even)
            } else if odd_load < even_load {
                Ok(Role::Odd)
            } else {
                Ok(engine.registry.role())
            }
        }
    }
}

/// Lower `max_value / step_size` ratio wins; Even on a tie.
fn lighter_of(even: &Segment, odd: &Segment) -> Role {
    let even_ratio = even.max_value as f64 / even.step_size.max(1) as f64;
    let odd_ratio = odd.max_value as f64 / odd.step_size.max(1) as f64;
    if even_ratio <= odd_ratio {
        Role::Even
    } else {
        Role::Odd
    }
}

/// Deterministic spread for brand-new keys under single-role operation.
fn hash_role(business_type: &str, time_key: &str) -> Role {
    let mut hasher = DefaultHasher::new();
    business_type.hash(&mut hasher);
    time_key.hash(&mut hasher);
    if hasher.finish() % 2 == 0 {
        Role::Even
    } else {
        Role::Odd
    }
}

/// Periodic peer-status scan.
pub struct FailoverController;

impl FailoverController {
    /// Spawn the scan loop. Errors are logged and the loop keeps ticking.
    pub fn spawn(engine: Arc<IssuanceEngine>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = Self::scan_once(&engine).await {
                    tracing::warn!(error = %err, "failover scan failed");
                }
            }
        })
    }

    /// One scan: sweep stale heartbeats, then either take over a missing
    /// peer's segments or abandon proxies for a returned peer.
    pub async fn scan_once(engine: &Arc<IssuanceEngine>) -> Result<()> {
        engine
            .registry
            .sweep_stale(engine.config.heartbeat_stale_after)
            .await?;

        if engine.registry.peer_online().await? {
            if engine.proxy_count() > 0 {
                tracing::info!("peer returned, abandoning proxy state");
                engine.abandon_proxies();
            }
        } else {
            Self::take_over(engine).await?;
        }
        Ok(())
    }

    /// Adopt every segment of the missing peer's role behind proxy buffers.
    ///
    /// The dead peer's cursor positions are unknowable, so each proxy starts
    /// exhausted and the first take allocates a fresh interval above the
    /// global maximum. Runs every tick while the peer is away; existing
    /// proxies are left untouched.
    async fn take_over(engine: &Arc<IssuanceEngine>) -> Result<()> {
        let peer = engine.registry.role().peer();
        let segments = engine.store.list_role_segments(peer).await?;
        let mut adopted = 0;
        for segment in segments {
            let key = BufferKey::proxy(&segment.business_type, &segment.time_key, peer);
            let buffer = SegmentBuffer::exhausted(
                segment.max_value,
                peer,
                engine.config.refresh_timeout,
            );
            if engine.insert_proxy_if_absent(key, buffer) {
                adopted += 1;
            }
        }
        if adopted > 0 {
            tracing::warn!(adopted, peer = %peer, "peer offline, took over its segments");
        }
        Ok(())
    }
}
