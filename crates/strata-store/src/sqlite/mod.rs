//! `SQLite` backend for the object store.
//!
//! - **[`executor`]**: the single connection, lock retry, error translation
//!   and the transaction journal used to replay around schema changes.
//! - **[`migrations`]**: version-tracked creation of the catalog tables.
//! - **[`row_helpers`]**: typed access to owned result rows.

pub(crate) mod executor;
pub(crate) mod migrations;
pub(crate) mod row_helpers;

pub(crate) use executor::{Executor, Row};
