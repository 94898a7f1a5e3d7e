//! Shared fixtures: a two-node cluster over one in-memory store.

use std::sync::Arc;

use segmint::{
    EngineConfig, GenerateRequest, IssuanceEngine, MemoryStore, NodeRegistry, Role, SegmentStore,
    SystemClock,
};

pub struct Cluster {
    pub store: Arc<dyn SegmentStore>,
    pub even: Arc<IssuanceEngine>,
    pub odd: Arc<IssuanceEngine>,
}

pub fn engine(store: &Arc<dyn SegmentStore>, role: Role) -> Arc<IssuanceEngine> {
    let registry = Arc::new(NodeRegistry::new(
        format!("test-host-{role}"),
        role,
        Arc::clone(store),
    ));
    Arc::new(IssuanceEngine::new(
        Arc::clone(store),
        registry,
        Arc::new(SystemClock),
        EngineConfig::default(),
    ))
}

/// Both nodes up and registered.
pub async fn cluster() -> Cluster {
    let store: Arc<dyn SegmentStore> = Arc::new(MemoryStore::new());
    let even = engine(&store, Role::Even);
    let odd = engine(&store, Role::Odd);
    even.registry().register().await.expect("register even");
    odd.registry().register().await.expect("register odd");
    Cluster { store, even, odd }
}

pub fn req(business: &str, time_key: &str, count: u32) -> GenerateRequest {
    GenerateRequest {
        business_type: business.to_owned(),
        time_key: Some(time_key.to_owned()),
        count,
        ..Default::default()
    }
}

pub fn req_forced(business: &str, time_key: &str, count: u32, role: Role) -> GenerateRequest {
    GenerateRequest {
        forced_role: Some(role),
        ..req(business, time_key, count)
    }
}
