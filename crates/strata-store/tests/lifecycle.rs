#![allow(missing_docs, unused_results)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use assert_matches::assert_matches;
use strata_store::logging::capture_logs;
use strata_store::{FieldDescriptor, RecordType, Referent, StoreError, Value, values};
use tracing::Level;

use common::{memory, open, registry, sample, thing_v1};

#[test]
fn first_construction_runs_ddl_once_per_database() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path(), registry([thing_v1()]));

    let before = store.stats().ddl_statements;
    let first = store.create(&thing_v1(), values! {}).unwrap();
    let after_first = store.stats().ddl_statements;
    assert_eq!(after_first - before, 2, "table and index");
    assert_eq!(first.get("a").unwrap(), Value::Integer(3));

    store.create(&thing_v1(), values! { "a" => 4 }).unwrap();
    assert_eq!(store.stats().ddl_statements, after_first);

    let other = open(dir.path(), registry([thing_v1()]));
    let baseline = other.stats().ddl_statements;
    other.create(&thing_v1(), values! {}).unwrap();
    assert_eq!(other.stats().ddl_statements, baseline);
}

#[test]
fn round_trip_keeps_values_and_id() {
    let dir = tempfile::tempdir().unwrap();
    let id = {
        let store = open(dir.path(), registry([sample()]));
        let item = store
            .create(&sample(), values! { "a" => 42, "b" => "hello", "c" => true })
            .unwrap();
        store.close().unwrap();
        item.id()
    };

    let store = open(dir.path(), registry([sample()]));
    let item = store.get_by_id(id).unwrap();
    assert_eq!(item.id(), id);
    assert_eq!(item.get("a").unwrap(), Value::Integer(42));
    assert_eq!(item.get("b").unwrap(), Value::Text("hello".into()));
    assert_eq!(item.get("c").unwrap(), Value::Boolean(true));
    assert!(!item.is_legacy());
}

#[test]
fn same_row_loads_as_same_instance() {
    let store = memory(registry([sample()]));
    let created = store.create(&sample(), values! { "a" => 1 }).unwrap();

    let by_id = store.get_by_id(created.id()).unwrap();
    let by_query = store.query(&sample()).unwrap().first().unwrap().unwrap();
    assert!(by_id.ptr_eq(&created));
    assert!(by_query.ptr_eq(&created));
    assert!(store.stats().cache_hits >= 2);
}

#[test]
fn dropped_items_leave_cache_and_fire_release_hook() {
    let released = Arc::new(AtomicI64::new(0));
    let seen = released.clone();
    let t = RecordType::builder("Tracked", 1)
        .field(FieldDescriptor::integer("n"))
        .field(FieldDescriptor::transient("memo"))
        .on_release(move |id, transient| {
            assert!(transient.contains_key("memo"));
            seen.store(id, Ordering::SeqCst);
        })
        .build()
        .unwrap();
    let store = memory(registry([t.clone()]));

    let item = store.create(&t, values! { "n" => 1 }).unwrap();
    let id = item.id();
    item.set("memo", "scratch").unwrap();
    assert_eq!(store.cached_items(), 1);

    drop(item);
    assert_eq!(released.load(Ordering::SeqCst), id);
    assert_eq!(store.cached_items(), 0);

    let misses = store.stats().cache_misses;
    let reloaded = store.get_by_id(id).unwrap();
    assert_eq!(store.stats().cache_misses, misses + 1);
    assert_eq!(reloaded.get("memo").unwrap(), Value::Null, "transient state is not persisted");
}

#[test]
fn set_outside_transaction_autocommits() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path(), registry([sample()]));
    let item = store.create(&sample(), values! { "a" => 1 }).unwrap();
    let commits = store.stats().commits;

    item.set("a", 5).unwrap();
    assert_eq!(store.stats().commits, commits + 1);

    let other = open(dir.path(), registry([sample()]));
    assert_eq!(other.get_by_id(item.id()).unwrap().get("a").unwrap(), Value::Integer(5));
}

#[test]
fn set_rejects_wrong_kind_and_unknown_field() {
    let store = memory(registry([sample()]));
    let item = store.create(&sample(), values! {}).unwrap();
    assert_matches!(item.set("a", "text"), Err(StoreError::InvalidValue { .. }));
    assert_matches!(item.set("nope", 1), Err(StoreError::UnknownField { .. }));
    assert_eq!(item.get("a").unwrap(), Value::Null);
}

#[test]
fn committed_hook_fires_once_per_touched_item() {
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let t = RecordType::builder("Hooked", 1)
        .field(FieldDescriptor::integer("n"))
        .on_committed(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();
    let store = memory(registry([t.clone()]));

    store
        .transact(|| {
            let a = store.create(&t, values! { "n" => 1 })?;
            store.create(&t, values! { "n" => 2 })?;
            a.set("n", 3)?;
            Ok::<_, StoreError>(())
        })
        .unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 2);
}

#[test]
fn store_identifier_resolves_to_store() {
    let store = memory(registry([common::dependent("Pointer", strata_store::DeletePolicy::Nullify)]));
    let pointer = store
        .create(
            &common::dependent("Pointer", strata_store::DeletePolicy::Nullify),
            values! { "target" => store.store_reference() },
        )
        .unwrap();

    assert_matches!(store.resolve(strata_store::STORE_ID).unwrap(), Referent::Store(s) if s.id() == store.id());
    assert_matches!(pointer.referent("target").unwrap(), Some(Referent::Store(_)));
    assert_matches!(store.get_by_id(strata_store::STORE_ID), Err(StoreError::InvalidOperation(_)));
}

#[test]
fn unknown_id_not_found() {
    let store = memory(registry([sample()]));
    assert_matches!(store.get_by_id(12345), Err(StoreError::ItemNotFound(12345)));
}

#[test]
fn only_current_version_can_be_created() {
    let v2 = RecordType::builder("Thing", 2)
        .field(FieldDescriptor::integer("a"))
        .build()
        .unwrap();
    let store = memory(registry([thing_v1(), v2]));
    assert_matches!(store.create(&thing_v1(), values! {}), Err(StoreError::InvalidOperation(_)));

    let unregistered = RecordType::builder("Other", 1).build().unwrap();
    assert_matches!(store.create(&unregistered, values! {}), Err(StoreError::UnknownType { .. }));
}

#[test]
fn closed_store_rejects_operations() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path(), registry([sample()]));
    let item = store.create(&sample(), values! {}).unwrap();

    store.close().unwrap();
    assert!(store.is_closed());
    store.close().unwrap();

    assert_matches!(store.create(&sample(), values! {}), Err(StoreError::Closed));
    assert_matches!(item.set("a", 1), Err(StoreError::Closed));
    assert_matches!(store.query(&sample()).unwrap().count(), Err(StoreError::Closed));
}

#[test]
fn close_inside_transaction_rejected() {
    let store = memory(registry([sample()]));
    let err = store
        .transact(|| store.close())
        .unwrap_err();
    assert_matches!(err, StoreError::InvalidOperation(_));
    assert!(!store.is_closed());
}

#[test]
fn find_or_create_reuses_match() {
    let store = memory(registry([sample()]));
    let first = store.find_or_create(&sample(), values! { "a" => 1, "b" => "x" }).unwrap();
    let again = store.find_or_create(&sample(), values! { "a" => 1, "b" => "x" }).unwrap();
    let other = store.find_or_create(&sample(), values! { "a" => 2 }).unwrap();
    assert!(first.ptr_eq(&again));
    assert_ne!(first.id(), other.id());
    assert_eq!(store.query(&sample()).unwrap().count().unwrap(), 2);
}

#[test]
fn lifecycle_events_are_logged() {
    let (logs, _guard) = capture_logs();
    let store = memory(registry([thing_v1()]));
    store.create(&thing_v1(), values! {}).unwrap();
    store.close().unwrap();

    assert!(logs.has_event(Level::INFO, "store opened"));
    let created = logs.matching("created type table");
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].field("table"), Some("item_thing_v1"));
    assert!(logs.has_event(Level::INFO, "store closed"));
}
