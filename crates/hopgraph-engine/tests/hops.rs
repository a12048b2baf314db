mod common;

use common::{engine, engine_over, ids, registry, seeded_store, CountingStore};
use hopgraph_core::{Cardinality, FilterMap};
use hopgraph_engine::{EngineConfig, HopExecutor, HopOutcome, HopRequest, RequestContext};
use serde_json::json;
use std::sync::Arc;

fn companies_to_employees(source_ids: &[&str]) -> HopRequest {
    HopRequest {
        source_collection: "companies".into(),
        source_ids: source_ids.iter().map(|s| s.to_string()).collect(),
        target_collection: "employees".into(),
        via_field: "companyId".into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn empty_source_ids_never_touch_the_store() {
    let (engine, store) = engine();
    let r = engine
        .hop(&RequestContext::new("u1"), &companies_to_employees(&[]))
        .await;
    assert!(r.is_empty());
    assert_eq!(r.total, 0);
    assert!(store.calls().is_empty());
}

#[tokio::test]
async fn foreign_source_ids_are_dropped() {
    let (engine, _) = engine();
    let r = engine
        .hop(&RequestContext::new("u1"), &companies_to_employees(&["c1", "c3"]))
        .await;
    assert_eq!(ids(&r.documents), vec!["e1", "e2"]);
    assert!(r
        .documents
        .iter()
        .all(|d| d.get("userId") == Some(&json!("u1"))));
}

#[tokio::test]
async fn matching_via_field_in_another_tenant_is_not_enough() {
    let (engine, _) = engine();
    // e5 belongs to u2 and points at c1, but c1 is not u2's company
    let r = engine
        .hop(&RequestContext::new("u2"), &companies_to_employees(&["c1"]))
        .await;
    assert!(r.is_empty());
}

#[tokio::test]
async fn target_filter_is_sanitized_and_applied() {
    let (engine, _) = engine();
    let mut req = companies_to_employees(&["c1", "c2"]);
    req.filter = json!({"title": "VP Sales", "userId": "u2", "ghost": 1})
        .as_object()
        .cloned()
        .unwrap();
    let r = engine.hop(&RequestContext::new("u1"), &req).await;
    assert_eq!(ids(&r.documents), vec!["e1"]);
}

#[tokio::test]
async fn reverse_hop_uses_the_source_join_field() {
    let (engine, _) = engine();
    let path = engine.find_path("employees", "companies").unwrap();
    assert_eq!(path.cardinality, Cardinality::ManyToOne);
    let req = HopRequest::along(&path, vec!["e1".into(), "e3".into(), "e4".into()]);
    let r = engine.hop(&RequestContext::new("u1"), &req).await;
    assert_eq!(ids(&r.documents), vec!["c1", "c2"]);
}

#[tokio::test]
async fn store_failure_becomes_empty_result() {
    let store = CountingStore::new(seeded_store()).failing_on("employees");
    let engine = engine_over(Arc::new(store.clone()), EngineConfig::default());
    let r = engine
        .hop(&RequestContext::new("u1"), &companies_to_employees(&["c1"]))
        .await;
    assert!(r.is_empty());
    assert_eq!(r.confidence, 0.0);
    assert_eq!(store.calls(), vec!["companies", "employees"]);
}

#[tokio::test]
async fn unknown_collections_and_fields_yield_empty() {
    let (engine, store) = engine();
    let mut req = companies_to_employees(&["c1"]);
    req.target_collection = "ghosts".into();
    assert!(engine.hop(&RequestContext::new("u1"), &req).await.is_empty());

    let mut req = companies_to_employees(&["c1"]);
    req.via_field = "notAField".into();
    assert!(engine.hop(&RequestContext::new("u1"), &req).await.is_empty());
    assert!(store.calls().is_empty());
}

#[tokio::test]
async fn limit_caps_the_target_read() {
    let (engine, _) = engine();
    let req = companies_to_employees(&["c1"])
        .with_filter(FilterMap::new())
        .with_limit(Some(1));
    let r = engine.hop(&RequestContext::new("u1"), &req).await;
    assert_eq!(r.documents.len(), 1);
}

#[tokio::test]
async fn hop_path_follows_a_resolved_path() {
    let (engine, store) = engine();
    let path = engine.find_path("employees", "companies").unwrap();
    let hops = HopExecutor::new(registry(), Arc::new(store), &EngineConfig::default());
    let r = hops
        .hop_path(&RequestContext::new("u1"), &path, vec!["e3".into()], FilterMap::new(), None)
        .await;
    assert_eq!(ids(&r.documents), vec!["c2"]);
}

#[tokio::test]
async fn reports_say_why_a_hop_is_empty() {
    let store = CountingStore::new(seeded_store());
    let hops = HopExecutor::new(registry(), Arc::new(store), &EngineConfig::default());
    let ctx = RequestContext::new("u1");

    let joined = hops.run(&ctx, &companies_to_employees(&["c1"])).await;
    assert_eq!(joined.outcome, HopOutcome::Joined);
    let none = hops.run(&ctx, &companies_to_employees(&[])).await;
    assert_eq!(none.outcome, HopOutcome::NoSources);
    // c3 belongs to u2, so nothing survives verification
    let foreign = hops.run(&ctx, &companies_to_employees(&["c3"])).await;
    assert_eq!(foreign.outcome, HopOutcome::Empty);

    let failing = CountingStore::new(seeded_store()).failing_on("employees");
    let hops = HopExecutor::new(registry(), Arc::new(failing), &EngineConfig::default());
    let down = hops.run(&ctx, &companies_to_employees(&["c1"])).await;
    assert_eq!(down.outcome, HopOutcome::Failed);
    assert!(down.result.is_empty());
}
