#![allow(dead_code, missing_docs, unused_results)]

use std::path::Path;
use std::sync::Arc;

use strata_store::{DeletePolicy, FieldDescriptor, RecordType, Registry, Store, StoreError, StoreSettings};

pub fn thing_v1() -> RecordType {
    RecordType::builder("Thing", 1)
        .field(FieldDescriptor::integer("a").default_value(3).indexed())
        .build()
        .unwrap()
}

pub fn sample() -> RecordType {
    RecordType::builder("Sample", 1)
        .field(FieldDescriptor::integer("a"))
        .field(FieldDescriptor::text("b"))
        .field(FieldDescriptor::boolean("c"))
        .field(FieldDescriptor::transient("scratch"))
        .build()
        .unwrap()
}

pub fn referee() -> RecordType {
    RecordType::builder("Referee", 1)
        .field(FieldDescriptor::text("name"))
        .build()
        .unwrap()
}

pub fn dependent(name: &str, policy: DeletePolicy) -> RecordType {
    RecordType::builder(name, 1)
        .field(FieldDescriptor::reference("target").on_delete(policy))
        .field(FieldDescriptor::text("label"))
        .build()
        .unwrap()
}

pub fn registry(types: impl IntoIterator<Item = RecordType>) -> Registry {
    let mut registry = Registry::new();
    for t in types {
        registry.register(t).unwrap();
    }
    registry
}

pub fn open(dir: &Path, registry: Registry) -> Store {
    Store::open(dir, Arc::new(registry), &StoreSettings::default()).unwrap()
}

pub fn memory(registry: Registry) -> Store {
    Store::in_memory(Arc::new(registry), &StoreSettings::default()).unwrap()
}

/// Application error type used as a transaction body error.
#[derive(Debug)]
pub enum AppError {
    Store(StoreError),
    Abort,
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}
