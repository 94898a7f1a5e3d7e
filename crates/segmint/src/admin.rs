//! Operator surface: step-size changes, status reports, conflict repair.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::engine::IssuanceEngine;
use crate::error::{Error, Result};
use crate::interval;
use crate::role::Role;

#[derive(Debug, Clone, Serialize)]
pub struct StepChangeEntry {
    pub business_type: String,
    pub time_key: String,
    pub role: Role,
    pub current_step: i32,
    pub new_step: i32,
    pub changed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepChangeReport {
    pub preview: bool,
    pub new_step: i32,
    pub total: usize,
    pub changed: usize,
    pub skipped: usize,
    pub entries: Vec<StepChangeEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GlobalStepSyncReport {
    pub preview: bool,
    pub new_step: i32,
    pub total_changed: usize,
    pub total_skipped: usize,
    pub businesses: Vec<StepChangeReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepSizeInfo {
    pub business_type: String,
    pub time_key: String,
    pub role: Role,
    pub step_size: i32,
    pub max_value: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepSizeReport {
    pub default_step_size: i32,
    pub segments: Vec<StepSizeInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsistencyReport {
    pub business_type: String,
    pub consistent: bool,
    /// Distinct step sizes in use, ascending.
    pub steps: Vec<i32>,
    pub segments: Vec<StepSizeInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConflictEntry {
    pub business_type: String,
    pub time_key: String,
    pub role: Role,
    pub old_max: i64,
    pub new_max: i64,
    pub old_step: i32,
    pub new_step: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConflictReport {
    pub resolved_groups: usize,
    pub entries: Vec<ConflictEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AbandonReport {
    pub dropped_proxies: usize,
    pub dropped_own: usize,
    /// Unissued IDs discarded with the proxies; wasted by design.
    pub wasted_ids: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProxyDetail {
    pub business_type: String,
    pub time_key: String,
    pub role: Role,
    pub remaining: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProxyStatus {
    pub proxies: Vec<ProxyDetail>,
    pub total_remaining: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshSummary {
    pub total_buffers: usize,
    pub refreshing: usize,
    pub stuck: usize,
    pub stuck_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadBalanceInfo {
    pub even_load: i64,
    pub odd_load: i64,
    pub balanced: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub node_id: String,
    pub role: Role,
    pub buffer_count: usize,
    pub proxy_buffer_count: usize,
    pub even_online_nodes: i64,
    pub odd_online_nodes: i64,
    pub in_failover_mode: bool,
    pub refresh: RefreshSummary,
    pub load_balance: LoadBalanceInfo,
}

impl IssuanceEngine {
    /// Change the step size of one business (optionally one time key).
    ///
    /// Preview reports the diff without touching anything. Execution updates
    /// each differing row's step together with a fresh next-interval
    /// `max_value`, so the stored boundary stays on the new step's grid, and
    /// drops the local buffers so the next request refills under the new
    /// width. Repeating the call with the same step is a no-op. The peer
    /// converges lazily: its buffers keep the old width until their natural
    /// exhaustion re-reads the store.
    pub async fn change_step(
        &self,
        business_type: &str,
        time_key: Option<&str>,
        new_step: i32,
        preview: bool,
    ) -> Result<StepChangeReport> {
        if business_type.is_empty() {
            return Err(Error::validation("business_type must not be empty"));
        }
        if new_step <= 0 {
            return Err(Error::validation("step size must be positive"));
        }

        let segments = self.store.list_segments(business_type, time_key).await?;
        let mut entries = Vec::with_capacity(segments.len());
        let mut changed = 0;
        let mut skipped = 0;

        for segment in &segments {
            let needs_change = segment.step_size != new_step;
            if needs_change {
                changed += 1;
                if !preview {
                    // Recompute the anchor per row: after the first role is
                    // moved, the second role's interval must land above it.
                    let global = self
                        .global_max(&segment.business_type, &segment.time_key, new_step)
                        .await?;
                    let span =
                        interval::next_interval(global, new_step as i64, segment.role);
                    let rows = self
                        .store
                        .set_max_value_and_step(
                            &segment.business_type,
                            &segment.time_key,
                            segment.role,
                            span.end,
                            new_step,
                        )
                        .await?;
                    if rows == 0 {
                        return Err(Error::SegmentRace {
                            business_type: segment.business_type.clone(),
                            time_key: segment.time_key.clone(),
                            role: segment.role,
                        });
                    }
                    self.drop_buffers_for(&segment.business_type, &segment.time_key);
                    tracing::info!(
                        business_type = %segment.business_type,
                        time_key = %segment.time_key,
                        role = %segment.role,
                        old_step = segment.step_size,
                        new_step,
                        new_max = span.end,
                        "step size changed"
                    );
                }
            } else {
                skipped += 1;
            }
            entries.push(StepChangeEntry {
                business_type: segment.business_type.clone(),
                time_key: segment.time_key.clone(),
                role: segment.role,
                current_step: segment.step_size,
                new_step,
                changed: needs_change,
            });
        }

        Ok(StepChangeReport {
            preview,
            new_step,
            total: segments.len(),
            changed,
            skipped,
            entries,
        })
    }

    /// Apply one step size across every business type in a single sweep.
    pub async fn change_step_global(
        &self,
        new_step: i32,
        preview: bool,
    ) -> Result<GlobalStepSyncReport> {
        if new_step <= 0 {
            return Err(Error::validation("step size must be positive"));
        }
        let mut businesses = Vec::new();
        let mut total_changed = 0;
        let mut total_skipped = 0;
        for business_type in self.store.list_business_types().await? {
            let report = self.change_step(&business_type, None, new_step, preview).await?;
            total_changed += report.changed;
            total_skipped += report.skipped;
            businesses.push(report);
        }
        Ok(GlobalStepSyncReport {
            preview,
            new_step,
            total_changed,
            total_skipped,
            businesses,
        })
    }

    /// Current step sizes, for one business or across all of them.
    pub async fn step_distribution(&self, business_type: Option<&str>) -> Result<StepSizeReport> {
        let mut segments = Vec::new();
        match business_type {
            Some(business) => segments.extend(self.store.list_segments(business, None).await?),
            None => {
                for business in self.store.list_business_types().await? {
                    segments.extend(self.store.list_segments(&business, None).await?);
                }
            }
        }
        Ok(StepSizeReport {
            default_step_size: self.config.default_step_size,
            segments: segments.iter().map(step_info).collect(),
        })
    }

    /// Whether all segments of a business agree on one step size.
    pub async fn check_step_consistency(&self, business_type: &str) -> Result<ConsistencyReport> {
        if business_type.is_empty() {
            return Err(Error::validation("business_type must not be empty"));
        }
        let segments = self.store.list_segments(business_type, None).await?;
        let mut steps: Vec<i32> = segments.iter().map(|s| s.step_size).collect();
        steps.sort_unstable();
        steps.dedup();
        Ok(ConsistencyReport {
            business_type: business_type.to_owned(),
            consistent: steps.len() <= 1,
            steps,
            segments: segments.iter().map(step_info).collect(),
        })
    }

    /// Repair segment groups left inconsistent by a split-brain stretch.
    ///
    /// For every (business, time) whose rows disagree on step size or whose
    /// boundary violates role parity, each row is moved onto a fresh interval
    /// of its own parity above the group's maximum, on the widest step in
    /// the group. Local buffers for repaired keys are dropped.
    pub async fn resolve_conflicts(&self) -> Result<ConflictReport> {
        let mut entries = Vec::new();
        let mut resolved_groups = 0;

        for business_type in self.store.list_business_types().await? {
            let segments = self.store.list_segments(&business_type, None).await?;
            let mut by_time: BTreeMap<String, Vec<_>> = BTreeMap::new();
            for segment in segments {
                by_time.entry(segment.time_key.clone()).or_default().push(segment);
            }

            for (time_key, group) in by_time {
                let step = group.iter().map(|s| s.step_size).max().unwrap_or(0);
                let conflicted = group.iter().any(|s| {
                    s.step_size != step
                        || !interval::parity_matches(s.max_value, s.step_size as i64, s.role)
                });
                if !conflicted {
                    continue;
                }

                resolved_groups += 1;
                let mut anchor = group.iter().map(|s| s.max_value).max().unwrap_or(step as i64);
                // Deterministic order keeps repeated runs stable.
                let mut rows = group.clone();
                rows.sort_by_key(|s| s.role);
                for segment in rows {
                    let span = interval::next_interval(anchor, step as i64, segment.role);
                    self.store
                        .set_max_value_and_step(
                            &business_type,
                            &time_key,
                            segment.role,
                            span.end,
                            step,
                        )
                        .await?;
                    anchor = span.end;
                    entries.push(ConflictEntry {
                        business_type: business_type.clone(),
                        time_key: time_key.clone(),
                        role: segment.role,
                        old_max: segment.max_value,
                        new_max: span.end,
                        old_step: segment.step_size,
                        new_step: step,
                    });
                    tracing::info!(
                        business_type = %business_type,
                        time_key = %time_key,
                        role = %segment.role,
                        old_max = segment.max_value,
                        new_max = span.end,
                        "segment conflict resolved"
                    );
                }
                self.drop_buffers_for(&business_type, &time_key);
            }
        }

        Ok(ConflictReport {
            resolved_groups,
            entries,
        })
    }

    /// Clear refresh flags whose claim outlived the refresh timeout.
    /// Returns the labels of recovered buffers.
    pub fn recover_stuck_refresh(&self) -> Vec<String> {
        let now = self.clock.now_millis();
        let buffers = self.buffers.read();
        let mut recovered = Vec::new();
        for (key, buffer) in buffers.iter() {
            if buffer.refresh_stuck(now) {
                buffer.clear_refresh();
                tracing::info!(key = %key.label(), "recovered stuck refresh flag");
                recovered.push(key.label());
            }
        }
        recovered
    }

    /// Drop all proxy buffers and invalidate own buffers.
    ///
    /// This is the correctness move on peer return: locally cached bounds
    /// may be stale after the peer advanced alone, and dropping them forces
    /// the next refill to re-anchor on the fresh global maximum.
    pub fn abandon_proxies(&self) -> AbandonReport {
        let mut buffers = self.buffers.write();
        let mut dropped_proxies = 0;
        let mut dropped_own = 0;
        let mut wasted_ids = 0;
        for (key, buffer) in buffers.drain() {
            match key.proxy_for {
                Some(role) => {
                    dropped_proxies += 1;
                    wasted_ids += buffer.remaining();
                    tracing::info!(
                        key = %key.label(),
                        role = %role,
                        wasted = buffer.remaining(),
                        "abandoned proxy buffer"
                    );
                }
                None => dropped_own += 1,
            }
        }
        if dropped_proxies + dropped_own > 0 {
            tracing::info!(
                dropped_proxies,
                dropped_own,
                wasted_ids,
                "buffer map cleared after peer return"
            );
        }
        AbandonReport {
            dropped_proxies,
            dropped_own,
            wasted_ids,
        }
    }

    /// Live view of held proxy buffers.
    pub fn proxy_status(&self) -> ProxyStatus {
        let buffers = self.buffers.read();
        let mut proxies = Vec::new();
        let mut total_remaining = 0;
        for (key, buffer) in buffers.iter() {
            if let Some(role) = key.proxy_for {
                let remaining = buffer.remaining();
                total_remaining += remaining;
                proxies.push(ProxyDetail {
                    business_type: key.business_type.clone(),
                    time_key: key.time_key.clone(),
                    role,
                    remaining,
                });
            }
        }
        ProxyStatus {
            proxies,
            total_remaining,
        }
    }

    /// Delete segments with `time_key` strictly below the cutoff, dropping
    /// any local buffers that served them.
    pub async fn delete_expired(&self, cutoff: &str) -> Result<u64> {
        if cutoff.is_empty() {
            return Err(Error::validation("cutoff time_key must not be empty"));
        }
        let deleted = self.store.delete_expired(cutoff).await?;
        self.buffers
            .write()
            .retain(|key, _| key.time_key.as_str() >= cutoff);
        if deleted > 0 {
            tracing::info!(deleted, cutoff, "expired segments deleted");
        }
        Ok(deleted)
    }

    /// Aggregate status for the ops surface.
    pub async fn status(self: &Arc<Self>) -> Result<EngineStatus> {
        let even_online_nodes = self.store.count_online(Role::Even).await?;
        let odd_online_nodes = self.store.count_online(Role::Odd).await?;
        let even_load = self.store.sum_max_value(Role::Even).await?;
        let odd_load = self.store.sum_max_value(Role::Odd).await?;

        let now = self.clock.now_millis();
        let buffers = self.buffers.read();
        let mut refreshing = 0;
        let mut stuck_keys = Vec::new();
        let mut proxy_buffer_count = 0;
        for (key, buffer) in buffers.iter() {
            if key.proxy_for.is_some() {
                proxy_buffer_count += 1;
            }
            if buffer.refresh_pending() {
                refreshing += 1;
                if buffer.refresh_stuck(now) {
                    stuck_keys.push(key.label());
                }
            }
        }
        let buffer_count = buffers.len();
        drop(buffers);

        let total_load = even_load + odd_load;
        let balanced = if total_load > 0 {
            let even_ratio = even_load as f64 / total_load as f64;
            (even_ratio - 0.5).abs() < 0.1
        } else {
            true
        };

        Ok(EngineStatus {
            node_id: self.registry.node_id().to_owned(),
            role: self.registry.role(),
            buffer_count,
            proxy_buffer_count,
            even_online_nodes,
            odd_online_nodes,
            in_failover_mode: even_online_nodes == 0
                || odd_online_nodes == 0
                || proxy_buffer_count > 0,
            refresh: RefreshSummary {
                total_buffers: buffer_count,
                stuck: stuck_keys.len(),
                stuck_keys,
                refreshing,
            },
            load_balance: LoadBalanceInfo {
                even_load,
                odd_load,
                balanced,
            },
        })
    }
}

fn step_info(segment: &crate::store::Segment) -> StepSizeInfo {
    StepSizeInfo {
        business_type: segment.business_type.clone(),
        time_key: segment.time_key.clone(),
        role: segment.role,
        step_size: segment.step_size,
        max_value: segment.max_value,
    }
}
