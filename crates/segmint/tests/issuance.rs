//! Issuance behavior across a healthy two-node cluster.

mod common;

use std::collections::HashSet;

use common::{cluster, req, req_forced};
use segmint::{Role, SegmentStore};

#[tokio::test]
async fn fresh_odd_node_issues_the_first_interval() {
    let cluster = cluster().await;
    let issued = cluster.odd.generate(req("order", "k1", 10)).await.unwrap();
    // Both roles idle and no segments anywhere: the tiebreak lands on the
    // serving node's own role, so the Odd node claims [1, 1000].
    assert_eq!(issued.ids, (1..=10).collect::<Vec<_>>());
    assert_eq!(issued.role, Role::Odd);

    let row = cluster
        .store
        .get_segment("order", "k1", Role::Odd)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.max_value, 1000);
    assert_eq!(row.step_size, 1000);
}

#[tokio::test]
async fn draining_the_interval_jumps_over_the_peers_slot() {
    let cluster = cluster().await;
    cluster.odd.generate(req_forced("order", "k1", 10, Role::Odd)).await.unwrap();

    // 990 singles finish off [1, 1000]; the next one refills.
    let mut last = 10;
    for _ in 0..990 {
        let issued = cluster
            .odd
            .generate(req_forced("order", "k1", 1, Role::Odd))
            .await
            .unwrap();
        last = issued.ids[0];
    }
    assert_eq!(last, 1000);

    let next = cluster
        .odd
        .generate(req_forced("order", "k1", 1, Role::Odd))
        .await
        .unwrap();
    assert_eq!(next.ids, vec![2001]);

    let row = cluster
        .store
        .get_segment("order", "k1", Role::Odd)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.max_value, 3000);
}

#[tokio::test]
async fn fresh_even_node_issues_from_its_own_class() {
    let cluster = cluster().await;
    let issued = cluster.even.generate(req("user", "k1", 1)).await.unwrap();
    assert_eq!(issued.ids, vec![1001]);
    assert_eq!(issued.role, Role::Even);

    let row = cluster
        .store
        .get_segment("user", "k1", Role::Even)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.max_value, 2000);
}

#[tokio::test]
async fn refills_from_mixed_progress_keep_the_classes_disjoint() {
    let cluster = cluster().await;
    // Odd has consumed through interval 2, Even through interval 1.
    cluster
        .store
        .create_segment("order", "d", Role::Odd, 3000, 1000)
        .await
        .unwrap();
    cluster
        .store
        .create_segment("order", "d", Role::Even, 2000, 1000)
        .await
        .unwrap();

    // The Odd node adopts its record exhausted and must refill above the
    // global maximum: candidate interval 3 is Even's, so it takes interval 4.
    let odd = cluster
        .odd
        .generate(req_forced("order", "d", 1, Role::Odd))
        .await
        .unwrap();
    assert_eq!(odd.ids, vec![4001]);

    // Even then anchors on the advanced global maximum (5000) and takes
    // interval 5.
    let even = cluster
        .even
        .generate(req_forced("order", "d", 1, Role::Even))
        .await
        .unwrap();
    assert_eq!(even.ids, vec![5001]);
}

#[tokio::test]
async fn batch_is_contiguous_with_one_jump_at_the_refill() {
    let cluster = cluster().await;
    let issued = cluster
        .odd
        .generate(req_forced("order", "k2", 1500, Role::Odd))
        .await
        .unwrap();
    assert_eq!(issued.ids.len(), 1500);
    assert_eq!(issued.ids[0], 1);

    let mut jumps = 0;
    for pair in issued.ids.windows(2) {
        if pair[1] != pair[0] + 1 {
            jumps += 1;
            assert!(pair[1] > pair[0]);
            assert_eq!(pair[0], 1000);
            assert_eq!(pair[1], 2001);
        }
    }
    assert_eq!(jumps, 1);
}

#[tokio::test]
async fn successive_batches_are_strictly_increasing_per_node() {
    let cluster = cluster().await;
    let mut last = 0;
    for _ in 0..8 {
        let issued = cluster
            .even
            .generate(req_forced("audit", "k3", 700, Role::Even))
            .await
            .unwrap();
        for id in issued.ids {
            assert!(id > last, "{id} did not advance past {last}");
            last = id;
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_generates_across_both_nodes_never_collide() {
    let cluster = cluster().await;
    let mut handles = Vec::new();
    for worker in 0..8 {
        let engine = if worker % 2 == 0 {
            std::sync::Arc::clone(&cluster.even)
        } else {
            std::sync::Arc::clone(&cluster.odd)
        };
        handles.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            for _ in 0..40 {
                let issued = engine.generate(req("order", "hot", 25)).await.unwrap();
                ids.extend(issued.ids);
            }
            ids
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    assert_eq!(all.len(), 8 * 40 * 25);
    let unique: HashSet<i64> = all.iter().copied().collect();
    assert_eq!(unique.len(), all.len(), "duplicate IDs were issued");
}

#[tokio::test]
async fn independent_keys_do_not_share_sequences() {
    let cluster = cluster().await;
    let a = cluster
        .odd
        .generate(req_forced("order", "20240101", 5, Role::Odd))
        .await
        .unwrap();
    let b = cluster
        .odd
        .generate(req_forced("order", "20240102", 5, Role::Odd))
        .await
        .unwrap();
    let c = cluster
        .odd
        .generate(req_forced("user", "20240101", 5, Role::Odd))
        .await
        .unwrap();
    assert_eq!(a.ids, (1..=5).collect::<Vec<_>>());
    assert_eq!(b.ids, (1..=5).collect::<Vec<_>>());
    assert_eq!(c.ids, (1..=5).collect::<Vec<_>>());
}

#[tokio::test]
async fn custom_step_widens_the_created_segment() {
    let cluster = cluster().await;
    let issued = cluster
        .odd
        .generate(segmint::GenerateRequest {
            custom_step: Some(5000),
            ..req_forced("bulk", "k4", 1, Role::Odd)
        })
        .await
        .unwrap();
    assert_eq!(issued.ids, vec![1]);

    let row = cluster
        .store
        .get_segment("bulk", "k4", Role::Odd)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.max_value, 5000);
    assert_eq!(row.step_size, 5000);
}

#[tokio::test]
async fn empty_time_key_defaults_to_todays_date() {
    let cluster = cluster().await;
    let issued = cluster
        .odd
        .generate(segmint::GenerateRequest {
            business_type: "order".into(),
            time_key: None,
            count: 1,
            forced_role: Some(Role::Odd),
            custom_step: None,
        })
        .await
        .unwrap();
    assert_eq!(issued.time_key, segmint::default_time_key());
}
