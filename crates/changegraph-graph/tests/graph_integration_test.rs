use changegraph_core::{
    ChangeGraphError, Criticality, Deadline, DependencyEdge, DependencyKind, Direction,
    GraphStore, Resource, ResourceType, StoreConfig,
};
use changegraph_graph::{open_store, DependencyGraph, GraphSnapshot};
use std::sync::Arc;
use std::thread;

fn tag(name: &str) -> Resource {
    Resource::new(&format!("tags/{}.json", name), ResourceType::TagConfig, Criticality::High)
}

fn view(name: &str) -> Resource {
    Resource::new(
        &format!("views/{}.json", name),
        ResourceType::ViewDefinition,
        Criticality::Medium,
    )
}

#[test]
fn test_direction_naming_both_ways() {
    let t = tag("Pump");
    let v = view("Overview");
    let snapshot = GraphSnapshot::from_parts(
        &[t.clone(), v.clone()],
        &[DependencyEdge::new(v.key.clone(), t.key.clone(), DependencyKind::Binds)],
    )
    .unwrap();

    // The view depends on the tag.
    assert_eq!(snapshot.neighbors(&v.key, Direction::Dependencies), vec![t.key.clone()]);
    assert_eq!(snapshot.neighbors(&t.key, Direction::Dependents), vec![v.key.clone()]);
    assert!(snapshot.neighbors(&t.key, Direction::Dependencies).is_empty());
    assert!(snapshot.neighbors(&v.key, Direction::Dependents).is_empty());
    assert_eq!(snapshot.edge_kinds(&v.key, &t.key), &[DependencyKind::Binds]);
}

#[test]
fn test_register_and_add_edge_are_idempotent() {
    let graph = DependencyGraph::new();
    let t = tag("Pump");
    let v = view("Overview");
    graph.upsert_resource(&t);
    graph.upsert_resource(&t);
    let edge = DependencyEdge::new(v.key.clone(), t.key.clone(), DependencyKind::Binds);
    graph.add_edge(edge.clone()).unwrap();
    graph.add_edge(edge).unwrap();

    let once = graph.snapshot();
    assert_eq!(once.node_count(), 2);
    assert_eq!(once.edge_count(), 1);
}

#[test]
fn test_readers_see_consistent_snapshots_during_writes() {
    let graph = Arc::new(DependencyGraph::new());
    let root = tag("Root");
    graph.upsert_resource(&root);

    let writer = {
        let graph = graph.clone();
        let root = root.key.clone();
        thread::spawn(move || {
            for i in 0..500 {
                let v = view(&format!("V{}", i));
                graph
                    .add_edge(DependencyEdge::new(v.key, root.clone(), DependencyKind::References))
                    .unwrap();
            }
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let graph = graph.clone();
            let root = root.key.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    let snapshot = graph.snapshot();
                    let reach = snapshot
                        .reachable_from(&root, 2, Direction::Dependents, &Deadline::none())
                        .unwrap();
                    // Every reached dependent is one hop away and the count
                    // matches the snapshot's own edge count.
                    assert_eq!(reach.len(), snapshot.edge_count() + 1);
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(graph.edge_count(), 500);
}

#[tokio::test]
async fn test_open_store_selects_backend() {
    let store = open_store(&StoreConfig::default()).unwrap();
    store.put_resource(&tag("Pump")).await.unwrap();
    assert_eq!(store.load_snapshot().await.unwrap().resources.len(), 1);

    let bogus = StoreConfig {
        backend: "carrier-pigeon".to_string(),
        ..StoreConfig::default()
    };
    assert!(matches!(open_store(&bogus), Err(ChangeGraphError::Config(_))));
}

#[test]
fn test_store_history_is_time_ordered() {
    use changegraph_core::{
        new_id, Change, ChangeType, Fingerprint, RiskFactors, RiskLevel,
    };
    use changegraph_graph::MemoryGraphStore;
    use chrono::{Duration, Utc};
    use tokio_test::block_on;

    let pump = tag("Pump");
    let start = Utc::now();
    let change_at = |offset: i64, after: &str| Change {
        id: new_id(),
        resource_key: pump.key.clone(),
        path: pump.path.clone(),
        previous_path: None,
        change_type: ChangeType::Modified,
        before_fingerprint: None,
        after_fingerprint: Some(Fingerprint::from_hash(after)),
        timestamp: start + Duration::seconds(offset),
        author: "dev".to_string(),
        branch: "main".to_string(),
        risk_score: 0.4,
        risk_level: RiskLevel::Medium,
        risk_factors: RiskFactors::default(),
    };
    let late = change_at(30, "b");
    let early = change_at(10, "a");

    let store = MemoryGraphStore::new();
    block_on(async {
        store.put_resource(&pump).await.unwrap();
        store.put_change(&late).await.unwrap();
        store.put_change(&early).await.unwrap();
        // Re-putting an identical record is accepted.
        store.put_change(&early).await.unwrap();

        let history = store.get_history(&pump.key).await.unwrap();
        let ids: Vec<_> = history.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![early.id, late.id]);
    });
}
