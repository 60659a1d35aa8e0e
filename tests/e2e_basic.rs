//! End-to-end tests for the node lifecycle: batches, commits, reads.
//!
//! Every test opens an in-memory graph, mutates it through batches and
//! reads the committed snapshot back.

use std::collections::BTreeMap;

use chrono::{TimeZone, Utc};
use nodegraph::{Error, Graph, LinkSlot, NodeId, NodeKind, Value};

// ============================================================================
// 1. Property round trip
// ============================================================================

#[tokio::test]
async fn test_property_round_trip() {
    let graph = Graph::open_memory("basic").await.unwrap();

    let date = Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).unwrap();
    let mut nested = BTreeMap::new();
    nested.insert("depth".to_string(), Value::from(2));
    let values = vec![
        ("name", Value::from("Ada")),
        ("age", Value::from(36)),
        ("score", Value::from(0.5)),
        ("active", Value::from(true)),
        ("born", Value::from(date)),
        ("avatar", Value::from(vec![0u8, 1, 2])),
        ("aliases", Value::from(vec![Value::from("a"), Value::from("b")])),
        ("meta", Value::from(nested)),
    ];

    let mut batch = graph.batch();
    let id = batch.create_entity("User").unwrap();
    for (name, value) in &values {
        batch.set_property(id, *name, value.clone()).unwrap();
    }
    graph.commit(batch).await.unwrap();

    for (name, value) in &values {
        assert_eq!(graph.get(id, name).as_ref(), Some(value), "property {name}");
    }
}

#[tokio::test]
async fn test_remove_property() {
    let graph = Graph::open_memory("basic").await.unwrap();

    let mut batch = graph.batch();
    let id = batch.create_entity("User").unwrap();
    batch.set_property(id, "name", "Ada").unwrap();
    graph.commit(batch).await.unwrap();

    let mut batch = graph.batch();
    batch.put_property(id, "name", None).unwrap();
    graph.commit(batch).await.unwrap();

    assert_eq!(graph.get(id, "name"), None);
    assert!(!graph.node(id).unwrap().has_property("name"));
}

// ============================================================================
// 2. Visibility
// ============================================================================

#[tokio::test]
async fn test_batch_is_invisible_until_commit() {
    let graph = Graph::open_memory("basic").await.unwrap();

    let mut batch = graph.batch();
    let id = batch.create_entity("User").unwrap();
    batch.set_property(id, "name", "Ada").unwrap();

    assert!(batch.contains(id));
    assert!(!graph.contains(id));
    assert!(graph.is_empty());

    let receipt = graph.commit(batch).await.unwrap();
    assert_eq!(receipt.created, vec![id]);
    assert_eq!(graph.len(), 1);
    assert_eq!(graph.node(id).unwrap().node_type(), "User");
}

#[tokio::test]
async fn test_snapshot_is_stable_across_commits() {
    let graph = Graph::open_memory("basic").await.unwrap();
    let before = graph.snapshot();

    let mut batch = graph.batch();
    batch.create_entity("User").unwrap();
    graph.commit(batch).await.unwrap();

    assert!(before.is_empty());
    assert_eq!(graph.snapshot().len(), 1);
    assert!(graph.snapshot().version() > before.version());
}

// ============================================================================
// 3. Tags and groups
// ============================================================================

#[tokio::test]
async fn test_tags_and_groups_are_independent() {
    let graph = Graph::open_memory("basic").await.unwrap();

    let mut batch = graph.batch();
    let id = batch.create_entity("User").unwrap();
    batch.add_tags(id, ["admin", "beta"]).unwrap();
    batch.add_to_groups(id, ["admin"]).unwrap();
    graph.commit(batch).await.unwrap();

    let mut batch = graph.batch();
    batch.remove_tags(id, ["admin"]).unwrap();
    graph.commit(batch).await.unwrap();

    let node = graph.node(id).unwrap();
    assert!(!node.has_tag("admin"));
    assert!(node.has_tag("beta"));
    assert!(node.is_member_of("admin"));
    assert_eq!(graph.tags(), vec!["beta".to_string()]);
    assert_eq!(graph.groups(), vec!["admin".to_string()]);
    assert_eq!(graph.types(), vec!["User".to_string()]);
}

// ============================================================================
// 4. Links
// ============================================================================

#[tokio::test]
async fn test_relationship_links_and_reverse_lookup() {
    let graph = Graph::open_memory("basic").await.unwrap();

    let mut batch = graph.batch();
    let ada = batch.create_entity("User").unwrap();
    let post = batch.create_entity("Post").unwrap();
    let wrote = batch.create_link(NodeKind::Relationship, "Wrote", Some(ada), Some(post)).unwrap();
    graph.commit(batch).await.unwrap();

    let rel = graph.node(wrote).unwrap();
    assert_eq!(rel.subject(), Some(ada));
    assert_eq!(rel.object(), Some(post));
    assert_eq!(rel.other_end(ada), Some(post));

    let outgoing: Vec<NodeId> = graph.relationships_of(ada, LinkSlot::Subject).iter().map(|n| n.id()).collect();
    assert_eq!(outgoing, vec![wrote]);
    assert!(graph.relationships_of(ada, LinkSlot::Object).is_empty());
}

#[tokio::test]
async fn test_delete_clears_links_but_keeps_relationship() {
    let graph = Graph::open_memory("basic").await.unwrap();

    let mut batch = graph.batch();
    let ada = batch.create_entity("User").unwrap();
    let bob = batch.create_entity("User").unwrap();
    let bond = batch.create_link(NodeKind::Bond, "Pair", Some(ada), Some(bob)).unwrap();
    graph.commit(batch).await.unwrap();

    let mut batch = graph.batch();
    batch.delete(ada).unwrap();
    graph.commit(batch).await.unwrap();

    assert!(!graph.contains(ada));
    let bond = graph.node(bond).unwrap();
    assert_eq!(bond.subject(), None);
    assert_eq!(bond.object(), Some(bob));
    assert!(graph.relationships_of(ada, LinkSlot::Subject).is_empty());
}

#[tokio::test]
async fn test_links_rejected_on_entities() {
    let graph = Graph::open_memory("basic").await.unwrap();

    let mut batch = graph.batch();
    let a = batch.create_entity("User").unwrap();
    let b = batch.create_entity("User").unwrap();

    let err = batch.set_link(a, LinkSlot::Subject, Some(b)).unwrap_err();
    assert!(matches!(err, Error::InvalidOperation(_)));
    assert_eq!(batch.len(), 2);
}

// ============================================================================
// 5. Validation and ids
// ============================================================================

#[tokio::test]
async fn test_invalid_values_are_rejected_synchronously() {
    let graph = Graph::open_memory("basic").await.unwrap();

    let mut batch = graph.batch();
    assert!(matches!(batch.create_entity(""), Err(Error::InvalidValue(_))));
    let id = batch.create_entity("User").unwrap();
    assert!(matches!(batch.set_property(id, "x", f64::INFINITY), Err(Error::InvalidValue(_))));
    assert!(matches!(
        batch.set_property(id, "xs", vec![Value::from(1.0), Value::from(f64::NAN)]),
        Err(Error::InvalidValue(_))
    ));
    assert!(matches!(batch.add_to_groups(id, [""]), Err(Error::InvalidValue(_))));

    graph.commit(batch).await.unwrap();
    assert!(graph.node(id).unwrap().properties().is_empty());
}

#[tokio::test]
async fn test_ids_are_unique_across_concurrent_batches() {
    let graph = Graph::open_memory("basic").await.unwrap();

    let mut first = graph.batch();
    let mut second = graph.batch();
    let a = first.create_entity("User").unwrap();
    let b = second.create_entity("User").unwrap();
    let c = first.create_entity("User").unwrap();

    assert!(a < b && b < c);
    let h1 = graph.commit(second);
    let h2 = graph.commit(first);
    h1.await.unwrap();
    h2.await.unwrap();

    let ids: Vec<NodeId> = graph.snapshot().nodes().map(|n| n.id()).collect();
    assert_eq!(ids, vec![a, b, c]);
}

#[tokio::test]
async fn test_stale_mutations_are_skipped() {
    let graph = Graph::open_memory("basic").await.unwrap();

    let mut batch = graph.batch();
    let id = batch.create_entity("User").unwrap();
    graph.commit(batch).await.unwrap();

    let mut late = graph.batch();
    late.set_property(id, "name", "Ada").unwrap();
    let other = late.create_entity("User").unwrap();

    let mut delete = graph.batch();
    delete.delete(id).unwrap();
    graph.commit(delete).await.unwrap();

    let receipt = graph.commit(late).await.unwrap();
    assert_eq!(receipt.skipped, 1);
    assert_eq!(receipt.created, vec![other]);
    assert!(!graph.contains(id));
}

#[tokio::test]
async fn test_query_shorthand_and_json_values() {
    let graph = Graph::open_memory("basic").await.unwrap();

    let json = serde_json::json!({"city": "Oslo", "zip": 150});
    let value = Value::try_from(json).unwrap();
    assert!(Value::try_from(serde_json::Value::Null).is_err());

    let mut batch = graph.batch();
    let id = batch.create_entity("User").unwrap();
    batch.set_property(id, "address", value.clone()).unwrap();
    graph.commit(batch).await.unwrap();

    let found = graph.query(nodegraph::Predicate::property_eq("address", value));
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id(), id);
}
