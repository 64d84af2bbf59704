//! # strata-store
//!
//! Persistent typed object store over a single-file `SQLite` database.
//!
//! Applications declare versioned [`RecordType`]s in a [`Registry`], open a
//! [`Store`], and work with [`Item`]s: create them, query them with typed
//! [`Predicate`]s, mutate fields, and delete them under per-field
//! [`DeletePolicy`]s. Each store keeps:
//!
//! - **Schema**: one table per type version, created lazily, described in
//!   type and attribute catalogs and checked against the registry on open.
//! - **Identity**: one live in-memory instance per row id (weakly cached).
//! - **Transactions**: re-entrant [`Store::transact`]; a failed body reverts
//!   both the database and every touched in-memory item.
//! - **Upgrades**: rows written by older type versions are upgraded on load
//!   through registered single-step upgraders.
//!
//! ```ignore
//! let mut registry = Registry::new();
//! let thing = registry.register(
//!     RecordType::builder("Thing", 1)
//!         .field(FieldDescriptor::integer("a"))
//!         .field(FieldDescriptor::text("b"))
//!         .build()?,
//! )?;
//! let store = Store::open(dir, Arc::new(registry), &StoreSettings::default())?;
//! let item = store.create(&thing, values! { "a" => 42, "b" => "hello" })?;
//! ```

#![deny(unsafe_code)]

mod cache;
pub mod errors;
pub mod item;
pub mod logging;
pub mod query;
pub mod record;
pub mod registry;
mod schema;
mod sqlite;
pub mod stats;
pub mod store;
mod txn;
mod upgrade;
pub mod value;

pub use errors::{Result, StoreError};
pub use item::Item;
pub use query::{Column, CompareOp, Direction, Operand, Predicate, Query, Sort};
pub use record::{CommittedHook, DeletePolicy, FieldDescriptor, RecordType, RecordTypeBuilder, ReleaseHook, TypeKey};
pub use registry::{Registry, Upgrader};
pub use stats::StoreStats;
pub use store::{Referent, Store};
pub use strata_settings::{JournalMode, StoreSettings};
pub use value::{FieldKind, Reference, STORE_ID, StoreId, Value, Values};
