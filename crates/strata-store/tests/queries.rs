#![allow(missing_docs, unused_results)]

mod common;

use assert_matches::assert_matches;
use strata_store::{DeletePolicy, FieldDescriptor, Predicate, RecordType, Store, StoreError, Value, values};

use common::{dependent, memory, referee, registry, sample};

fn measured() -> RecordType {
    RecordType::builder("Measured", 1)
        .field(FieldDescriptor::text("name"))
        .field(FieldDescriptor::integer("n"))
        .field(FieldDescriptor::real("weight"))
        .build()
        .unwrap()
}

fn seeded() -> Store {
    let store = memory(registry([measured()]));
    for (name, n, weight) in [("alpha", 1, 0.5), ("beta", 2, 1.5), ("gamma", 3, 2.0), ("50%", 4, 1.0)] {
        store
            .create(&measured(), values! { "name" => name, "n" => n, "weight" => weight })
            .unwrap();
    }
    store
}

fn names(items: &[strata_store::Item]) -> Vec<String> {
    items
        .iter()
        .map(|i| i.get("name").unwrap().as_str().unwrap().to_string())
        .collect()
}

#[test]
fn query_before_table_exists_is_empty_without_ddl() {
    let store = memory(registry([sample()]));
    let ddl = store.stats().ddl_statements;
    let query = store.query(&sample()).unwrap();
    assert!(query.items().unwrap().is_empty());
    assert_eq!(query.count().unwrap(), 0);
    assert_eq!(query.sum(&sample().column("a").unwrap()).unwrap(), Value::Integer(0));
    assert!(query.first().unwrap().is_none());
    assert_eq!(store.stats().ddl_statements, ddl);
}

#[test]
fn comparisons_and_connectives() {
    let store = seeded();
    let t = measured();
    let n = t.column("n").unwrap();
    let q = || store.query(&t).unwrap();

    assert_eq!(q().filter(n.eq(2)).count().unwrap(), 1);
    assert_eq!(q().filter(n.ne(2)).count().unwrap(), 3);
    assert_eq!(q().filter(n.gt(1).and(n.le(3))).count().unwrap(), 2);
    assert_eq!(q().filter(n.lt(2).or(n.ge(4))).count().unwrap(), 2);
    assert_eq!(q().filter(n.eq(1).negate()).count().unwrap(), 3);
    assert_eq!(q().filter(n.gt(1)).filter(n.lt(3)).count().unwrap(), 1);
    assert_eq!(q().filter(Predicate::all([])).count().unwrap(), 4);
    assert_eq!(q().filter(Predicate::any([])).count().unwrap(), 0);
}

#[test]
fn membership_and_null_tests() {
    let store = seeded();
    let t = measured();
    let n = t.column("n").unwrap();
    let name = t.column("name").unwrap();
    store.create(&t, values! { "n" => 9 }).unwrap();

    assert_eq!(store.query(&t).unwrap().filter(n.is_in([1, 3])).count().unwrap(), 2);
    assert_eq!(store.query(&t).unwrap().filter(n.not_in([1, 3])).count().unwrap(), 3);
    assert_eq!(store.query(&t).unwrap().filter(n.is_in(Vec::<i64>::new())).count().unwrap(), 0);
    assert_eq!(store.query(&t).unwrap().filter(n.not_in(Vec::<i64>::new())).count().unwrap(), 5);
    assert_eq!(store.query(&t).unwrap().filter(name.is_null()).count().unwrap(), 1);
    assert_eq!(store.query(&t).unwrap().filter(name.eq(Value::Null)).count().unwrap(), 1);
    assert_eq!(store.query(&t).unwrap().filter(name.is_not_null()).count().unwrap(), 4);
}

#[test]
fn text_matching_escapes_wildcards() {
    let store = seeded();
    let t = measured();
    let name = t.column("name").unwrap();

    let percent = store.query(&t).unwrap().filter(name.starts_with("50%")).items().unwrap();
    assert_eq!(names(&percent), ["50%"]);
    assert_eq!(store.query(&t).unwrap().filter(name.starts_with("%")).count().unwrap(), 0);
    assert_eq!(store.query(&t).unwrap().filter(name.like("%a")).count().unwrap(), 3);
    assert_eq!(store.query(&t).unwrap().filter(name.eq("it's")).count().unwrap(), 0);
}

#[test]
fn ordering_and_paging() {
    let store = seeded();
    let t = measured();
    let n = t.column("n").unwrap();

    let desc = store.query(&t).unwrap().sort(n.descending()).items().unwrap();
    assert_eq!(names(&desc), ["50%", "gamma", "beta", "alpha"]);

    let page = store.query(&t).unwrap().sort(n.ascending()).offset(1).limit(2).items().unwrap();
    assert_eq!(names(&page), ["beta", "gamma"]);

    let rest = store.query(&t).unwrap().sort(n.ascending()).offset(3).items().unwrap();
    assert_eq!(names(&rest), ["50%"]);

    let first = store.query(&t).unwrap().sort(n.descending()).first().unwrap().unwrap();
    assert_eq!(first.get("n").unwrap(), Value::Integer(4));
}

#[test]
fn unique_requires_single_match() {
    let store = seeded();
    let t = measured();
    let n = t.column("n").unwrap();

    assert!(store.query(&t).unwrap().filter(n.eq(2)).unique().unwrap().is_some());
    assert!(store.query(&t).unwrap().filter(n.eq(99)).unique().unwrap().is_none());
    assert_matches!(
        store.query(&t).unwrap().filter(n.gt(1)).unique(),
        Err(StoreError::InvalidOperation(_))
    );
}

#[test]
fn sums_follow_column_kind() {
    let store = seeded();
    let t = measured();
    let n = t.column("n").unwrap();
    let weight = t.column("weight").unwrap();

    assert_eq!(store.query(&t).unwrap().sum(&n).unwrap(), Value::Integer(10));
    assert_eq!(store.query(&t).unwrap().sum(&weight).unwrap(), Value::Real(5.0));
    assert_eq!(store.query(&t).unwrap().filter(n.gt(100)).sum(&n).unwrap(), Value::Integer(0));
    assert_eq!(store.query(&t).unwrap().filter(n.gt(100)).sum(&weight).unwrap(), Value::Real(0.0));
    assert_eq!(store.sum(&t, &n, Some(n.le(2))).unwrap(), Value::Integer(3));
    assert_eq!(store.count(&t, None).unwrap(), 4);

    let name = t.column("name").unwrap();
    assert_matches!(store.query(&t).unwrap().sum(&name), Err(StoreError::InvalidOperation(_)));
}

#[test]
fn column_values() {
    let store = seeded();
    let t = measured();
    let n = t.column("n").unwrap();
    let values = store
        .query(&t)
        .unwrap()
        .filter(n.le(2))
        .sort(n.ascending())
        .values(&t.column("name").unwrap())
        .unwrap();
    assert_eq!(values, [Value::Text("alpha".into()), Value::Text("beta".into())]);
}

#[test]
fn distinct_values_collapse_duplicates() {
    let store = seeded();
    let t = measured();
    store.create(&t, values! { "name" => "delta", "n" => 5, "weight" => 1.0 }).unwrap();
    let weight = t.column("weight").unwrap();

    assert_eq!(store.query(&t).unwrap().values(&weight).unwrap().len(), 5);
    let unique = store
        .query(&t)
        .unwrap()
        .sort(weight.ascending())
        .distinct()
        .values(&weight)
        .unwrap();
    assert_eq!(unique, [Value::Real(0.5), Value::Real(1.0), Value::Real(1.5), Value::Real(2.0)]);
}

#[test]
fn joins_through_reference_columns() {
    let link = dependent("Link", DeletePolicy::Nullify);
    let store = memory(registry([referee(), link.clone()]));
    let ann = store.create(&referee(), values! { "name" => "ann" }).unwrap();
    let bob = store.create(&referee(), values! { "name" => "bob" }).unwrap();
    for (owner, label) in [(&ann, "a1"), (&ann, "a2"), (&bob, "b1")] {
        store.create(&link, values! { "target" => owner, "label" => label }).unwrap();
    }

    let joined = link
        .column("target")
        .unwrap()
        .eq(referee().id_column())
        .and(referee().column("name").unwrap().eq("ann"));
    let found = store.query(&link).unwrap().filter(joined.clone()).items().unwrap();
    assert_eq!(found.len(), 2);
    assert!(found.iter().all(|l| l.referent("target").unwrap().unwrap().into_item().unwrap().ptr_eq(&ann)));

    assert_eq!(
        store.query(&link).unwrap().filter(link.column("target").unwrap().eq(&bob)).count().unwrap(),
        1
    );

    // True for every (link, referee) pair: each link appears once per referee.
    let any_name = link
        .column("target")
        .unwrap()
        .ne(referee().id_column())
        .or(link.column("target").unwrap().eq(referee().id_column()));
    assert_eq!(store.query(&link).unwrap().filter(any_name.clone()).count().unwrap(), 6);
    assert_eq!(store.query(&link).unwrap().filter(any_name).distinct().count().unwrap(), 3);
}

#[test]
fn id_column_filters() {
    let store = seeded();
    let t = measured();
    let all = store.query(&t).unwrap().sort(t.id_column().ascending()).items().unwrap();
    let second = all[1].id();
    let found = store.query(&t).unwrap().filter(t.id_column().eq(second)).unique().unwrap().unwrap();
    assert!(found.ptr_eq(&all[1]));
}

#[test]
fn delete_all_removes_matches() {
    let store = seeded();
    let t = measured();
    let n = t.column("n").unwrap();
    assert_eq!(store.query(&t).unwrap().filter(n.ge(3)).delete_all().unwrap(), 2);
    assert_eq!(store.count(&t, None).unwrap(), 2);
}
