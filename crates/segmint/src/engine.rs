//! End-to-end issuance: buffer lookup, role selection, refill, prefetch.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::sync::Mutex as AsyncMutex;

use crate::buffer::{SegmentBuffer, TakeStatus};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::failover;
use crate::interval;
use crate::registry::NodeRegistry;
use crate::role::Role;
use crate::store::{Segment, SegmentStore};
use crate::time::{default_time_key, TimeSource};

pub const MAX_BUSINESS_TYPE_LEN: usize = 64;
pub const MAX_TIME_KEY_LEN: usize = 32;

/// Key of one live buffer on this node.
///
/// `proxy_for` is `Some(role)` on buffers held on behalf of the opposite
/// role during a peer outage; own buffers carry `None`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct BufferKey {
    pub business_type: String,
    pub time_key: String,
    pub proxy_for: Option<Role>,
}

impl BufferKey {
    pub fn own(business_type: &str, time_key: &str) -> Self {
        Self {
            business_type: business_type.to_owned(),
            time_key: time_key.to_owned(),
            proxy_for: None,
        }
    }

    pub fn proxy(business_type: &str, time_key: &str, role: Role) -> Self {
        Self {
            business_type: business_type.to_owned(),
            time_key: time_key.to_owned(),
            proxy_for: Some(role),
        }
    }

    pub fn label(&self) -> String {
        match self.proxy_for {
            Some(role) => format!("{}:{}#proxy-{role}", self.business_type, self.time_key),
            None => format!("{}:{}", self.business_type, self.time_key),
        }
    }
}

/// One issuance request, already past transport parsing.
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub business_type: String,
    /// Defaults to the current local date (`yyyymmdd`) when absent or empty.
    pub time_key: Option<String>,
    pub count: u32,
    pub forced_role: Option<Role>,
    pub custom_step: Option<i32>,
}

/// A completed batch.
#[derive(Debug, Clone)]
pub struct Issued {
    pub ids: Vec<i64>,
    pub business_type: String,
    pub time_key: String,
    /// Role of the buffer that actually issued, which is what determines the
    /// interval class of the IDs.
    pub role: Role,
    pub node_id: String,
    pub timestamp_ms: u64,
}

/// The issuance engine: owns this node's buffer map and drives every refill
/// against the shared store.
///
/// Shared behind an `Arc`; every request is served on its caller's task and
/// only the per-key refill mutex is ever held across store I/O.
pub struct IssuanceEngine {
    pub(crate) store: Arc<dyn SegmentStore>,
    pub(crate) registry: Arc<NodeRegistry>,
    pub(crate) config: EngineConfig,
    pub(crate) clock: Arc<dyn TimeSource>,
    pub(crate) buffers: RwLock<HashMap<BufferKey, Arc<SegmentBuffer>>>,
    /// Serializes first materialisation of a buffer, separate from refills.
    create_locks: SyncMutex<HashMap<BufferKey, Arc<AsyncMutex<()>>>>,
    /// Serializes refills per buffer; held across store I/O.
    refill_locks: SyncMutex<HashMap<BufferKey, Arc<AsyncMutex<()>>>>,
}

impl IssuanceEngine {
    pub fn new(
        store: Arc<dyn SegmentStore>,
        registry: Arc<NodeRegistry>,
        clock: Arc<dyn TimeSource>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            clock,
            buffers: RwLock::new(HashMap::new()),
            create_locks: SyncMutex::new(HashMap::new()),
            refill_locks: SyncMutex::new(HashMap::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        self.registry.node_id()
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn role(&self) -> Role {
        self.registry.role()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Issue a batch of IDs.
    ///
    /// IDs within the batch are strictly increasing and contiguous except
    /// across a mid-batch refill, where the sequence jumps to the start of
    /// the freshly reserved interval. A refill failure fails the whole
    /// request; nothing issued so far is retracted, those IDs are simply
    /// lost to the caller (and never reissued).
    pub async fn generate(self: &Arc<Self>, request: GenerateRequest) -> Result<Issued> {
        self.validate(&request)?;

        let time_key = match request.time_key.as_deref() {
            Some(t) if !t.is_empty() => t.to_owned(),
            _ => default_time_key(),
        };
        let role = failover::select_role(
            self,
            &request.business_type,
            &time_key,
            request.forced_role,
        )
        .await?;
        let (key, buffer) = self
            .buffer_for(&request.business_type, &time_key, role, request.custom_step)
            .await?;

        let mut ids = Vec::with_capacity(request.count as usize);
        for _ in 0..request.count {
            loop {
                match buffer.take() {
                    TakeStatus::Issued(id) => {
                        if buffer.utilisation() > self.config.refresh_threshold
                            && buffer.try_mark_refresh(self.clock.now_millis())
                        {
                            self.spawn_prefetch(
                                key.clone(),
                                Arc::clone(&buffer),
                                request.custom_step,
                            );
                        }
                        ids.push(id);
                        break;
                    }
                    TakeStatus::Exhausted => {
                        self.refill_sync(&key, &buffer, request.custom_step).await?;
                    }
                }
            }
        }

        Ok(Issued {
            ids,
            business_type: request.business_type,
            time_key,
            role: buffer.role(),
            node_id: self.registry.node_id().to_owned(),
            timestamp_ms: self.clock.now_millis(),
        })
    }

    fn validate(&self, request: &GenerateRequest) -> Result<()> {
        if request.business_type.is_empty() {
            return Err(Error::validation("business_type must not be empty"));
        }
        if request.business_type.len() > MAX_BUSINESS_TYPE_LEN {
            return Err(Error::validation(format!(
                "business_type exceeds {MAX_BUSINESS_TYPE_LEN} characters"
            )));
        }
        if let Some(time_key) = &request.time_key {
            if time_key.len() > MAX_TIME_KEY_LEN {
                return Err(Error::validation(format!(
                    "time_key exceeds {MAX_TIME_KEY_LEN} characters"
                )));
            }
        }
        if request.count == 0 {
            return Err(Error::validation("count must be at least 1"));
        }
        if request.count > self.config.max_batch_size {
            return Err(Error::validation(format!(
                "count {} exceeds the per-request maximum of {}",
                request.count, self.config.max_batch_size
            )));
        }
        if let Some(step) = request.custom_step {
            if step <= 0 {
                return Err(Error::validation("custom step size must be positive"));
            }
        }
        Ok(())
    }

    /// Resolve the buffer serving this request.
    ///
    /// A proxy buffer wins when one exists for the selected role; otherwise
    /// the own buffer for the key is used regardless of the selected role
    /// (selection binds only at creation, exactly so that a key keeps one
    /// stable interval class while both nodes are healthy).
    async fn buffer_for(
        &self,
        business_type: &str,
        time_key: &str,
        role: Role,
        custom_step: Option<i32>,
    ) -> Result<(BufferKey, Arc<SegmentBuffer>)> {
        let own_key = BufferKey::own(business_type, time_key);
        let proxy_key = BufferKey::proxy(business_type, time_key, role);
        {
            let buffers = self.buffers.read();
            if let Some(buffer) = buffers.get(&proxy_key) {
                return Ok((proxy_key, Arc::clone(buffer)));
            }
            if let Some(buffer) = buffers.get(&own_key) {
                return Ok((own_key, Arc::clone(buffer)));
            }
        }

        let create_lock = self.lock_for(&self.create_locks, &own_key);
        let _created = create_lock.lock().await;
        if let Some(buffer) = self.buffers.read().get(&own_key) {
            return Ok((own_key, Arc::clone(buffer)));
        }

        let buffer = Arc::new(self.materialise(business_type, time_key, role, custom_step).await?);
        self.buffers
            .write()
            .insert(own_key.clone(), Arc::clone(&buffer));
        Ok((own_key, buffer))
    }

    /// Build the initial buffer for a key from the store.
    ///
    /// Only a segment row this call itself inserted is adopted as a live
    /// interval. Any pre-existing row may have been partially issued by an
    /// earlier process life (or by the peer racing us to the insert), so it
    /// is adopted exhausted and the first take allocates a fresh interval
    /// above the global maximum. The unissued tail of the old interval is
    /// wasted, never reissued.
    async fn materialise(
        &self,
        business_type: &str,
        time_key: &str,
        role: Role,
        custom_step: Option<i32>,
    ) -> Result<SegmentBuffer> {
        let refresh_timeout = self.config.refresh_timeout;
        let step = custom_step.unwrap_or(self.config.default_step_size);

        if let Some(existing) = self.store.get_segment(business_type, time_key, role).await? {
            self.check_parity(&existing)?;
            return Ok(SegmentBuffer::exhausted(existing.max_value, role, refresh_timeout));
        }

        let initial_max = interval::initial_max_value(step as i64, role);
        let (stored, created) = self
            .store
            .create_segment(business_type, time_key, role, initial_max, step)
            .await?;
        self.check_parity(&stored)?;
        if created {
            let start = interval::interval_start(stored.max_value, stored.step_size as i64);
            tracing::info!(
                business_type,
                time_key,
                %role,
                start,
                end = stored.max_value,
                "claimed initial segment"
            );
            Ok(SegmentBuffer::new(start, stored.max_value, role, refresh_timeout))
        } else {
            Ok(SegmentBuffer::exhausted(stored.max_value, role, refresh_timeout))
        }
    }

    fn check_parity(&self, segment: &Segment) -> Result<()> {
        if interval::parity_matches(segment.max_value, segment.step_size as i64, segment.role) {
            Ok(())
        } else {
            tracing::error!(
                business_type = %segment.business_type,
                time_key = %segment.time_key,
                role = %segment.role,
                max_value = segment.max_value,
                step_size = segment.step_size,
                "stored max_value violates role parity, refusing to issue"
            );
            Err(Error::CorruptSegment {
                business_type: segment.business_type.clone(),
                time_key: segment.time_key.clone(),
                role: segment.role,
                max_value: segment.max_value,
                step_size: segment.step_size,
            })
        }
    }

    /// Synchronous refill on exhaustion: wait for the key's refill mutex,
    /// then re-check, since whoever held it may already have refilled.
    ///
    /// A lost segment race (the other node claimed the ground we computed)
    /// is retried with fresh state; everything else fails the request.
    async fn refill_sync(
        &self,
        key: &BufferKey,
        buffer: &Arc<SegmentBuffer>,
        custom_step: Option<i32>,
    ) -> Result<()> {
        let lock = self.lock_for(&self.refill_locks, key);
        let _refill = lock.lock().await;
        if !buffer.is_exhausted() {
            return Ok(());
        }
        let mut races = 0;
        loop {
            match self.refill_locked(key, buffer, custom_step).await {
                Err(Error::SegmentRace { .. }) if races < 2 => {
                    races += 1;
                    tracing::debug!(key = %key.label(), races, "segment race, recomputing");
                }
                outcome => return outcome,
            }
        }
    }

    /// Advance the segment record onto the next role-owned interval and
    /// install it. The caller must hold the key's refill mutex. On any
    /// failure the refresh flag is released and the bounds stay untouched.
    pub(crate) async fn refill_locked(
        &self,
        key: &BufferKey,
        buffer: &SegmentBuffer,
        custom_step: Option<i32>,
    ) -> Result<()> {
        let outcome = self.refill_inner(key, buffer, custom_step).await;
        if outcome.is_err() {
            buffer.clear_refresh();
        }
        outcome
    }

    async fn refill_inner(
        &self,
        key: &BufferKey,
        buffer: &SegmentBuffer,
        custom_step: Option<i32>,
    ) -> Result<()> {
        let business_type = key.business_type.as_str();
        let time_key = key.time_key.as_str();
        let role = buffer.role();

        let stored = self.store.get_segment(business_type, time_key, role).await?;
        if let Some(existing) = &stored {
            self.check_parity(existing)?;
        }
        let step = custom_step
            .or_else(|| stored.as_ref().map(|s| s.step_size))
            .unwrap_or(self.config.default_step_size);

        let global_max = self.global_max(business_type, time_key, step).await?;
        let span = interval::next_interval(global_max, step as i64, role);

        let rows = match &stored {
            Some(existing) if existing.step_size != step => {
                tracing::info!(
                    business_type,
                    time_key,
                    %role,
                    old_step = existing.step_size,
                    new_step = step,
                    "adopting new step size on refill"
                );
                self.store
                    .set_max_value_and_step(business_type, time_key, role, span.end, step)
                    .await?
            }
            Some(_) => {
                self.store
                    .set_max_value(business_type, time_key, role, span.end)
                    .await?
            }
            None => {
                // The row vanished underneath a live buffer (expiry or an
                // operator delete). Recreate it directly at the computed
                // interval; a racing creator wins the insert and we report
                // the race instead of installing a guess.
                let (_, created) = self
                    .store
                    .create_segment(business_type, time_key, role, span.end, step)
                    .await?;
                u64::from(created)
            }
        };

        if rows == 0 {
            return Err(Error::SegmentRace {
                business_type: business_type.to_owned(),
                time_key: time_key.to_owned(),
                role,
            });
        }

        // The write advanced the row, so [span.start, span.end] is ours
        // alone: any later writer must land strictly above it. The read-back
        // only confirms the store kept the claim.
        let confirmed = self
            .store
            .get_segment(business_type, time_key, role)
            .await?
            .ok_or_else(|| Error::RefillFailed {
                business_type: business_type.to_owned(),
                time_key: time_key.to_owned(),
                reason: "segment disappeared after update".to_owned(),
            })?;
        if confirmed.max_value < span.end {
            return Err(Error::RefillFailed {
                business_type: business_type.to_owned(),
                time_key: time_key.to_owned(),
                reason: format!(
                    "read-back maximum {} fell below the written {}",
                    confirmed.max_value, span.end
                ),
            });
        }

        buffer.install(span.start, span.end);
        tracing::debug!(
            business_type,
            time_key,
            %role,
            start = span.start,
            end = span.end,
            "segment refilled"
        );
        Ok(())
    }

    /// Largest `max_value` either role has persisted for this key, or `step`
    /// when neither row exists yet.
    pub(crate) async fn global_max(
        &self,
        business_type: &str,
        time_key: &str,
        step: i32,
    ) -> Result<i64> {
        let even = self
            .store
            .get_segment(business_type, time_key, Role::Even)
            .await?
            .map(|s| s.max_value);
        let odd = self
            .store
            .get_segment(business_type, time_key, Role::Odd)
            .await?
            .map(|s| s.max_value);
        Ok(even.into_iter().chain(odd).max().unwrap_or(step as i64))
    }

    /// Fire-and-forget prefetch. Runs the refill protocol under the same
    /// per-key mutex, bounded by the prefetch deadline. A buffer that is not
    /// yet exhausted is left alone with its refresh flag still set, so takes
    /// between now and exhaustion do not spawn further tasks; the flag
    /// timeout is the backstop if this task dies without reporting.
    fn spawn_prefetch(
        self: &Arc<Self>,
        key: BufferKey,
        buffer: Arc<SegmentBuffer>,
        custom_step: Option<i32>,
    ) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let lock = engine.lock_for(&engine.refill_locks, &key);
            let work = async {
                let _refill = lock.lock().await;
                if !buffer.is_exhausted() {
                    return Ok(());
                }
                engine.refill_locked(&key, &buffer, custom_step).await
            };
            match tokio::time::timeout(engine.config.prefetch_deadline, work).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(key = %key.label(), error = %err, "prefetch refill failed");
                }
                Err(_) => {
                    tracing::warn!(key = %key.label(), "prefetch exceeded its deadline");
                    buffer.clear_refresh();
                }
            }
        });
    }

    fn lock_for(
        &self,
        locks: &SyncMutex<HashMap<BufferKey, Arc<AsyncMutex<()>>>>,
        key: &BufferKey,
    ) -> Arc<AsyncMutex<()>> {
        let mut locks = locks.lock();
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    // Buffer-map maintenance used by failover and the admin surface.

    pub(crate) fn proxy_count(&self) -> usize {
        self.buffers
            .read()
            .keys()
            .filter(|k| k.proxy_for.is_some())
            .count()
    }

    pub(crate) fn buffer_count(&self) -> usize {
        self.buffers.read().len()
    }

    pub(crate) fn insert_proxy_if_absent(&self, key: BufferKey, buffer: SegmentBuffer) -> bool {
        let mut buffers = self.buffers.write();
        if buffers.contains_key(&key) {
            false
        } else {
            buffers.insert(key, Arc::new(buffer));
            true
        }
    }

    /// Drop every buffer (own and proxy) serving a key, so the next request
    /// re-reads the store.
    pub(crate) fn drop_buffers_for(&self, business_type: &str, time_key: &str) {
        self.buffers
            .write()
            .retain(|k, _| !(k.business_type == business_type && k.time_key == time_key));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::time::SystemClock;

    fn engine(role: Role) -> Arc<IssuanceEngine> {
        engine_with_store(role, Arc::new(MemoryStore::new()))
    }

    fn engine_with_store(role: Role, store: Arc<dyn SegmentStore>) -> Arc<IssuanceEngine> {
        let registry = Arc::new(NodeRegistry::new(
            format!("test-{role}"),
            role,
            Arc::clone(&store),
        ));
        Arc::new(IssuanceEngine::new(
            store,
            registry,
            Arc::new(SystemClock),
            EngineConfig::default(),
        ))
    }

    fn request(business: &str, count: u32) -> GenerateRequest {
        GenerateRequest {
            business_type: business.to_owned(),
            time_key: Some("t".to_owned()),
            count,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn rejects_malformed_requests() {
        let engine = engine(Role::Odd);
        let cases = [
            GenerateRequest::default(),
            request("", 1),
            request("order", 0),
            GenerateRequest {
                custom_step: Some(0),
                ..request("order", 1)
            },
            GenerateRequest {
                time_key: Some("x".repeat(33)),
                ..request("order", 1)
            },
            request(&"b".repeat(65), 1),
        ];
        for bad in cases {
            let err = engine.generate(bad).await.unwrap_err();
            assert!(err.is_validation(), "expected validation error, got {err}");
        }
    }

    #[tokio::test]
    async fn fresh_odd_engine_issues_from_one() {
        let engine = engine(Role::Odd);
        let issued = engine
            .generate(GenerateRequest {
                forced_role: Some(Role::Odd),
                ..request("order", 10)
            })
            .await
            .unwrap();
        assert_eq!(issued.ids, (1..=10).collect::<Vec<_>>());
        assert_eq!(issued.role, Role::Odd);

        let row = engine
            .store
            .get_segment("order", "t", Role::Odd)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.max_value, 1000);
    }

    #[tokio::test]
    async fn exhaustion_skips_the_peers_interval() {
        let engine = engine(Role::Odd);
        let first = engine
            .generate(GenerateRequest {
                forced_role: Some(Role::Odd),
                ..request("order", 1000)
            })
            .await
            .unwrap();
        assert_eq!(*first.ids.last().unwrap(), 1000);

        let next = engine
            .generate(GenerateRequest {
                forced_role: Some(Role::Odd),
                ..request("order", 1)
            })
            .await
            .unwrap();
        assert_eq!(next.ids, vec![2001]);

        let row = engine
            .store
            .get_segment("order", "t", Role::Odd)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.max_value, 3000);
    }

    #[tokio::test]
    async fn adopting_an_existing_record_never_reissues_its_interval() {
        let store: Arc<dyn SegmentStore> = Arc::new(MemoryStore::new());
        store
            .create_segment("order", "t", Role::Odd, 1000, 1000)
            .await
            .unwrap();

        // A fresh engine (a restarted process) cannot know how much of
        // [1, 1000] the previous life issued, so it must start above it.
        let engine = engine_with_store(Role::Odd, store);
        let issued = engine
            .generate(GenerateRequest {
                forced_role: Some(Role::Odd),
                ..request("order", 1)
            })
            .await
            .unwrap();
        assert_eq!(issued.ids, vec![2001]);
    }

    #[tokio::test]
    async fn corrupt_parity_refuses_issuance() {
        let store: Arc<dyn SegmentStore> = Arc::new(MemoryStore::new());
        // max_value 2000 is interval 1, an Even-owned slot, stored under Odd.
        store
            .create_segment("order", "t", Role::Odd, 2000, 1000)
            .await
            .unwrap();

        let engine = engine_with_store(Role::Odd, store);
        let err = engine
            .generate(GenerateRequest {
                forced_role: Some(Role::Odd),
                ..request("order", 1)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CorruptSegment { .. }), "got {err}");
    }

    #[tokio::test]
    async fn batches_are_contiguous_within_an_interval() {
        let engine = engine(Role::Even);
        let issued = engine
            .generate(GenerateRequest {
                forced_role: Some(Role::Even),
                ..request("order", 500)
            })
            .await
            .unwrap();
        assert_eq!(issued.ids.first(), Some(&1001));
        for pair in issued.ids.windows(2) {
            assert_eq!(pair[1], pair[0] + 1);
        }
    }
}
