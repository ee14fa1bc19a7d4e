//! End-to-end scenarios: one kernel, real replicas, framed transport

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ripple_core::{AttributeSchema, EntityId, Novelty, Partition, RippleError, RippleResult, Uid, Value};
use ripple_rebase::SyncState;
use ripple_store::Db;

use crate::{init_tracing, Cluster, ClusterConfig, ConvergenceResult};

// ============================================================================
// HELPERS
// ============================================================================

/// Current value of a card-one attribute, by uid and attribute ident
fn value_of(db: &Db, uid: Uid, ident: &str) -> Option<Value> {
    let entity = db.entity_by_uid(uid)?;
    let attribute = db.schema().attribute_by_ident(ident)?;
    db.facts_of(entity)
        .into_iter()
        .find(|f| f.attribute == attribute)
        .map(|f| f.value)
}

fn values_of(db: &Db, uid: Uid, ident: &str) -> Vec<Value> {
    let (Some(entity), Some(attribute)) = (db.entity_by_uid(uid), db.schema().attribute_by_ident(ident)) else {
        return Vec::new();
    };
    db.facts_of(entity)
        .into_iter()
        .filter(|f| f.attribute == attribute)
        .map(|f| f.value)
        .collect()
}

fn leader_create(cluster: &Cluster, name: &str) -> Uid {
    let (e, _) = cluster
        .leader()
        .change(|c| {
            let attr = c.attribute("doc/name", AttributeSchema::scalar())?;
            c.create_entity(Partition::Shared, "doc", vec![(attr, Value::from(name))])
        })
        .unwrap();
    cluster.kernel.read(|db| db.uid_of(e)).unwrap()
}

fn client_create(cluster: &Cluster, client: usize, name: &str) -> (EntityId, Uid) {
    let replica = cluster.client(client);
    let e = replica
        .change(|c| {
            let attr = c.attribute("doc/name", AttributeSchema::scalar())?;
            c.create_entity(Partition::Shared, "doc", vec![(attr, Value::from(name))])
        })
        .unwrap();
    (e, replica.read(|db| db.uid_of(e)).unwrap())
}

/// Poll until the kernel has applied `index` transactions from a client
async fn kernel_applied(cluster: &Cluster, client: usize, index: u64) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while cluster.kernel.clock().get(cluster.id(client)) < index {
        assert!(Instant::now() < deadline, "kernel never reached index {}", index);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ============================================================================
// CORE SCENARIOS
// ============================================================================

#[tokio::test]
async fn test_offline_create_reaches_kernel() {
    init_tracing();
    let mut cluster = Cluster::new(ClusterConfig::default());
    let a = cluster.add_offline_client();

    let (e, uid) = client_create(&cluster, a, "a");
    let replica = cluster.client(a).clone();
    assert_eq!(replica.state(), SyncState::Speculating);
    assert_eq!(replica.read(|db| db.entity_by_uid(uid)), Some(e));
    assert_eq!(replica.read(|db| value_of(db, uid, "doc/name")), Some(Value::from("a")));

    cluster.connect(a);
    cluster.settle().await.unwrap();

    assert_eq!(cluster.kernel.clock().get(cluster.id(a)), 1);
    assert_eq!(replica.state(), SyncState::InSync);
    // the temp id survives the round trip
    assert_eq!(replica.read(|db| db.entity_by_uid(uid)), Some(e));

    let b = cluster.add_client().await.unwrap();
    assert_eq!(
        cluster.client(b).read(|db| value_of(db, uid, "doc/name")),
        Some(Value::from("a"))
    );
    assert_eq!(cluster.converge().await.unwrap(), ConvergenceResult::Converged);
    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_identical_add_converges() {
    init_tracing();
    let cluster = Cluster::start(ClusterConfig::default()).await.unwrap();
    let uid = leader_create(&cluster, "shared");
    cluster.settle().await.unwrap();

    cluster.hold(0);
    cluster.hold(1);
    for i in 0..2 {
        cluster
            .client(i)
            .change(|c| {
                let e = c
                    .db()
                    .entity_by_uid(uid)
                    .ok_or_else(|| RippleError::UnknownEntity(uid.to_string()))?;
                let tags = c.attribute("doc/tags", AttributeSchema::scalar().many())?;
                c.add(e, tags, "urgent")
            })
            .unwrap();
    }
    cluster.release(0);
    cluster.release(1);

    assert!(cluster.converge().await.unwrap().is_converged());
    assert_eq!(cluster.kernel.clock().get(cluster.id(0)), 1);
    assert_eq!(cluster.kernel.clock().get(cluster.id(1)), 1);
    assert_eq!(
        cluster.kernel.read(|db| values_of(db, uid, "doc/tags")),
        vec![Value::from("urgent")]
    );
    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stale_derived_write_rejected() {
    init_tracing();
    let cluster = Cluster::start(ClusterConfig::default()).await.unwrap();
    let uid = leader_create(&cluster, "x0");
    cluster.settle().await.unwrap();
    let (a, b) = (0, 1);

    // A derives a summary from the name while its transaction is held
    cluster.hold(a);
    cluster
        .client(a)
        .change(|c| {
            let e = c
                .db()
                .entity_by_uid(uid)
                .ok_or_else(|| RippleError::UnknownEntity(uid.to_string()))?;
            let name = c.attribute("doc/name", AttributeSchema::scalar())?;
            let summary = c.attribute("doc/summary", AttributeSchema::scalar())?;
            let current = c.get_one(e, name);
            let derived = format!("about {}", current.as_ref().and_then(Value::as_str).unwrap_or(""));
            c.add(e, summary, derived)
        })
        .unwrap();
    assert_eq!(
        cluster.client(a).read(|db| value_of(db, uid, "doc/summary")),
        Some(Value::from("about x0"))
    );

    // B changes the name first
    cluster
        .client(b)
        .change(|c| {
            let e = c
                .db()
                .entity_by_uid(uid)
                .ok_or_else(|| RippleError::UnknownEntity(uid.to_string()))?;
            let name = c.attribute("doc/name", AttributeSchema::scalar())?;
            c.add(e, name, "x1")
        })
        .unwrap();
    kernel_applied(&cluster, b, 1).await;

    let connections = cluster.connections(a);
    cluster.release(a);

    assert!(cluster.converge().await.unwrap().is_converged());
    // recovered on the same connection
    assert_eq!(cluster.connections(a), connections);
    assert_eq!(cluster.kernel.clock().get(cluster.id(a)), 0);
    assert_eq!(cluster.kernel.read(|db| value_of(db, uid, "doc/name")), Some(Value::from("x1")));
    assert_eq!(cluster.kernel.read(|db| value_of(db, uid, "doc/summary")), None);
    assert_eq!(cluster.client(a).read(|db| value_of(db, uid, "doc/summary")), None);
    cluster.shutdown().await.unwrap();
}

// ============================================================================
// RECONNECTS AND OFFERS
// ============================================================================

#[tokio::test]
async fn test_reset_carries_unacked_writes_over() {
    init_tracing();
    let cluster = Cluster::start(ClusterConfig::default()).await.unwrap();
    let (_, first) = client_create(&cluster, 0, "first");
    cluster.settle().await.unwrap();

    cluster.hold(0);
    let (_, second) = client_create(&cluster, 0, "second");
    let (_, third) = client_create(&cluster, 0, "third");

    let connections = cluster.connections(0);
    cluster.kernel.reset_subscribers();
    cluster.wait_for_connections(0, connections + 1).await.unwrap();
    cluster.release(0);

    assert!(cluster.converge().await.unwrap().is_converged());
    assert_eq!(cluster.kernel.clock().get(cluster.id(0)), 3);
    for uid in [first, second, third] {
        assert!(cluster.kernel.read(|db| db.entity_by_uid(uid)).is_some());
        assert!(cluster.client(1).read(|db| db.entity_by_uid(uid)).is_some());
    }
    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_write_to_retracted_entity_fails_cleanly() {
    init_tracing();
    let cluster = Cluster::start(ClusterConfig::default()).await.unwrap();
    let uid = leader_create(&cluster, "doomed");
    cluster.settle().await.unwrap();

    cluster.hold(1);
    cluster
        .client(1)
        .change(|c| {
            let e = c
                .db()
                .entity_by_uid(uid)
                .ok_or_else(|| RippleError::UnknownEntity(uid.to_string()))?;
            let tags = c.attribute("doc/tags", AttributeSchema::scalar().many())?;
            c.add(e, tags, "late")
        })
        .unwrap();
    cluster
        .client(0)
        .change(|c| {
            let e = c
                .db()
                .entity_by_uid(uid)
                .ok_or_else(|| RippleError::UnknownEntity(uid.to_string()))?;
            c.retract_entity(e)
        })
        .unwrap();
    kernel_applied(&cluster, 0, 1).await;
    cluster.release(1);

    assert!(cluster.converge().await.unwrap().is_converged());
    // a failed transaction still consumes its index
    assert_eq!(cluster.kernel.clock().get(cluster.id(1)), 1);
    for i in 0..2 {
        assert_eq!(cluster.client(i).read(|db| db.entity_by_uid(uid)), None);
    }
    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_upstream_retract_cascades_into_local_drafts() {
    init_tracing();
    let cluster = Cluster::start(ClusterConfig::default()).await.unwrap();
    let uid = leader_create(&cluster, "doc");
    cluster.settle().await.unwrap();

    let replica = cluster.client(0).clone();
    let (draft, note, bookmark) = replica
        .change(|c| {
            let doc = c
                .db()
                .entity_by_uid(uid)
                .ok_or_else(|| RippleError::UnknownEntity(uid.to_string()))?;
            let of_doc = c.attribute("draft/doc", AttributeSchema::reference().required())?;
            let of_draft = c.attribute("note/draft", AttributeSchema::reference().required())?;
            let target = c.attribute("bookmark/target", AttributeSchema::reference())?;
            let label = c.attribute("bookmark/label", AttributeSchema::scalar())?;
            let draft = c.create_entity(Partition::Local, "draft", vec![(of_doc, Value::from(doc))])?;
            let note = c.create_entity(Partition::Local, "note", vec![(of_draft, Value::from(draft))])?;
            let bookmark = c.create_entity(
                Partition::Local,
                "bookmark",
                vec![(target, Value::from(doc)), (label, Value::from("keep"))],
            )?;
            Ok((draft, note, bookmark))
        })
        .unwrap();
    assert!(replica.read(|db| db.exists(draft) && db.exists(note)));

    let doc = cluster.kernel.read(|db| db.entity_by_uid(uid)).unwrap();
    cluster.leader().change(|c| c.retract_entity(doc)).unwrap();
    assert!(cluster.converge().await.unwrap().is_converged());

    assert_eq!(replica.read(|db| db.entity_by_uid(uid)), None);
    assert!(!replica.read(|db| db.exists(draft)));
    assert!(!replica.read(|db| db.exists(note)));
    assert!(replica.read(|db| db.exists(bookmark)));
    assert_eq!(replica.read(|db| value_of(db, uid, "doc/name")), None);
    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failing_hook_does_not_stop_offers() {
    init_tracing();
    let cluster = Cluster::start(ClusterConfig::default()).await.unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    {
        let calls = calls.clone();
        cluster.client(1).register_hook(move |_: &Db, _: &Novelty| -> RippleResult<()> {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RippleError::Hook("always".into()))
        });
    }

    let uids: Vec<Uid> = (0..3).map(|i| client_create(&cluster, 0, &format!("doc-{}", i)).1).collect();
    assert!(cluster.converge().await.unwrap().is_converged());

    assert!(calls.load(Ordering::SeqCst) >= 1);
    for uid in uids {
        assert!(cluster.client(1).read(|db| db.entity_by_uid(uid)).is_some());
    }
    cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slow_observer_keeps_every_canonical_effect() {
    init_tracing();
    let cluster = Cluster::start(ClusterConfig::default()).await.unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    {
        let calls = calls.clone();
        cluster.client(1).register_hook(move |_: &Db, _: &Novelty| -> RippleResult<()> {
            calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(10));
            Ok(())
        });
    }

    let uids: Vec<Uid> = (0..20).map(|i| client_create(&cluster, 0, &format!("doc-{}", i)).1).collect();
    assert!(cluster.converge().await.unwrap().is_converged());

    assert!(calls.load(Ordering::SeqCst) >= 1);
    for uid in uids {
        assert!(cluster.client(1).read(|db| db.entity_by_uid(uid)).is_some());
    }
    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_direct_transport_converges() {
    init_tracing();
    let cluster = Cluster::start(ClusterConfig::direct().with_clients(3)).await.unwrap();
    let uids: Vec<Uid> = (0..3).map(|i| client_create(&cluster, i, &format!("from-{}", i)).1).collect();

    assert!(cluster.converge().await.unwrap().is_converged());
    for (i, uid) in uids.into_iter().enumerate() {
        assert_eq!(
            cluster.kernel.read(|db| value_of(db, uid, "doc/name")),
            Some(Value::from(format!("from-{}", i)))
        );
    }
    cluster.shutdown().await.unwrap();
}
