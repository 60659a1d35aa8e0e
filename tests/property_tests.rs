//! # Property-Based Tests
//!
//! Invariants of the graph checked over generated inputs: property round
//! trips, toggle parity, query algebra and index/store consistency.

use std::collections::{BTreeMap, BTreeSet};

use nodegraph::{Change, Graph, MemoryStore, NodeId, NodeRecord, NodeStore, Predicate, Value};
use parking_lot::Mutex;
use proptest::collection::vec;
use proptest::prelude::*;
use std::sync::Arc;

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
        .block_on(future)
}

fn scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        (-1.0e12f64..1.0e12).prop_map(Value::from),
        "[a-z]{0,12}".prop_map(Value::from),
        vec(any::<u8>(), 0..16).prop_map(Value::from),
    ]
}

fn value() -> impl Strategy<Value = Value> {
    scalar().prop_recursive(2, 16, 4, |inner| {
        prop_oneof![
            vec(inner.clone(), 0..4).prop_map(Value::from),
            proptest::collection::btree_map("[a-z]{1,4}", inner, 0..4).prop_map(Value::from),
        ]
    })
}

const TAGS: [&str; 4] = ["a", "b", "c", "d"];

/// One node: its tag indices and an optional `rank` property.
fn node_spec() -> impl Strategy<Value = (Vec<usize>, Option<i64>)> {
    (vec(0..TAGS.len(), 0..3), proptest::option::of(0i64..4))
}

fn primitive() -> impl Strategy<Value = Predicate> {
    let names = || vec(prop_oneof![Just("a"), Just("b"), Just("c"), Just("d"), Just("*"), Just("zz")], 0..3);
    prop_oneof![
        names().prop_map(Predicate::tagged),
        names().prop_map(|n| Predicate::tagged(n).all()),
        (0i64..4).prop_map(|r| Predicate::property_eq("rank", r)),
        Just(Predicate::has_property(["rank"])),
        Just(Predicate::of_type(["N"])),
    ]
}

fn predicate() -> impl Strategy<Value = Predicate> {
    primitive().prop_recursive(3, 12, 2, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone()).prop_map(|(l, r)| l & r),
            (inner.clone(), inner).prop_map(|(l, r)| l | r),
        ]
    })
}

async fn populate(graph: &Graph<MemoryStore>, specs: &[(Vec<usize>, Option<i64>)]) -> Vec<NodeId> {
    let mut batch = graph.batch();
    let mut ids = Vec::new();
    for (tags, rank) in specs {
        let id = batch.create_entity("N").unwrap();
        batch.add_tags(id, tags.iter().map(|t| TAGS[*t])).unwrap();
        if let Some(rank) = rank {
            batch.set_property(id, "rank", *rank).unwrap();
        }
        ids.push(id);
    }
    graph.commit(batch).await.unwrap();
    ids
}

// =============================================================================
// PROPERTY TESTS
// =============================================================================

proptest! {
    /// Whatever is set comes back unchanged after commit.
    #[test]
    fn property_round_trip(props in proptest::collection::btree_map("[a-z]{1,8}", value(), 1..8)) {
        block_on(async {
            let graph = Graph::open_memory("prop").await.unwrap();
            let mut batch = graph.batch();
            let id = batch.create_entity("N").unwrap();
            for (name, value) in &props {
                batch.set_property(id, name.as_str(), value.clone()).unwrap();
            }
            graph.commit(batch).await.unwrap();

            let stored: BTreeMap<String, Value> = graph.node(id).unwrap().properties().clone();
            assert_eq!(stored, props);
        });
    }

    /// Toggling n times leaves membership at n's parity and fires n events.
    #[test]
    fn toggle_parity(toggles in vec(0..TAGS.len(), 1..20), per_batch in 1usize..4) {
        block_on(async {
            let graph = Graph::open_memory("prop").await.unwrap();
            let id = populate(&graph, &[(Vec::new(), None)]).await[0];

            let events = Arc::new(Mutex::new(0usize));
            let counter = Arc::clone(&events);
            graph.watch(Predicate::of_type(["N"]), move |_, event| {
                assert!(matches!(event.change, Change::TagAdded(_) | Change::TagRemoved(_)));
                *counter.lock() += 1;
            });

            for chunk in toggles.chunks(per_batch) {
                let mut batch = graph.batch();
                for t in chunk {
                    batch.toggle_tags(id, [TAGS[*t]]).unwrap();
                }
                graph.commit(batch).await.unwrap();
            }

            let node = graph.node(id).unwrap();
            for (i, tag) in TAGS.iter().enumerate() {
                let flips = toggles.iter().filter(|t| **t == i).count();
                assert_eq!(node.has_tag(tag), flips % 2 == 1, "tag {tag}");
            }
            assert_eq!(*events.lock(), toggles.len());
        });
    }

    /// Index evaluation agrees with per-node matching, AND is intersection
    /// and OR is union.
    #[test]
    fn query_algebra(specs in vec(node_spec(), 0..40), p in predicate(), q in predicate()) {
        block_on(async {
            let graph = Graph::open_memory("prop").await.unwrap();
            populate(&graph, &specs).await;
            let snapshot = graph.snapshot();

            let eval = |p: &Predicate| -> BTreeSet<NodeId> { graph.search().filter(p.clone()).ids().into_iter().collect() };
            let by_match: BTreeSet<NodeId> = snapshot.nodes().filter(|n| p.matches(n)).map(|n| n.id()).collect();

            let (ps, qs) = (eval(&p), eval(&q));
            assert_eq!(ps, by_match);
            assert_eq!(eval(&(p.clone() & q.clone())), ps.intersection(&qs).copied().collect());
            assert_eq!(eval(&(p.clone() | q.clone())), ps.union(&qs).copied().collect());
        });
    }

    /// After arbitrary edits the incrementally maintained snapshot equals a
    /// snapshot rebuilt from the store's records.
    #[test]
    fn store_and_index_stay_consistent(
        specs in vec(node_spec(), 1..20),
        edits in vec((0usize..20, 0..TAGS.len(), 0u8..4), 0..30),
        p in predicate(),
    ) {
        block_on(async {
            let store = MemoryStore::new();
            let graph = Graph::open("prop", store.clone()).await.unwrap();
            let ids = populate(&graph, &specs).await;

            let mut batch = graph.batch();
            for (target, tag, action) in edits {
                let id = ids[target % ids.len()];
                if !batch.contains(id) {
                    continue;
                }
                match action {
                    0 => batch.toggle_tags(id, [TAGS[tag]]).unwrap(),
                    1 => batch.set_property(id, "rank", tag as i64).unwrap(),
                    2 => batch.remove_property(id, "rank").unwrap(),
                    _ => batch.delete(id).unwrap(),
                }
            }
            graph.commit(batch).await.unwrap();

            let rebuilt = NodeStore::hydrate(store.records());
            let live = graph.snapshot();
            let live_records: Vec<NodeRecord> = live.nodes().map(NodeRecord::from).collect();
            assert_eq!(store.records(), live_records);
            assert_eq!(p.evaluate(rebuilt.index()), p.evaluate(live.index()));
        });
    }
}
