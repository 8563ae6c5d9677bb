//! Metadata store abstraction and implementation for Coffer.
//!
//! This crate provides the control-plane data model of single-instance
//! attachment storage:
//! - The `singleinstances` reference table tying `(hierarchy, tag)` pairs
//!   to instance ids; row counts are the reference count
//! - Orphan detection for physically deletable instances
//! - The `lob` chunk table backing the database attachment backend
//!
//! The storage engine never issues SQL itself; it talks to the repo traits
//! defined here.

pub mod error;
pub mod models;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use models::ReferenceRow;
pub use repos::{LobRepo, ReferenceRepo};
pub use store::{MetadataStore, SqliteStore};

use std::path::Path;
use std::sync::Arc;

/// Open a SQLite-backed metadata store at the given path.
pub async fn from_path(path: impl AsRef<Path>) -> MetadataResult<Arc<dyn MetadataStore>> {
    let store = SqliteStore::new(path).await?;
    Ok(Arc::new(store))
}
