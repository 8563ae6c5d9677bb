pub mod fixtures;

use coffer_metadata::{MetadataStore, SqliteStore};
use std::sync::Arc;
use tempfile::TempDir;

/// Open a fresh SQLite metadata store inside the given temp directory.
#[allow(dead_code)]
pub async fn sqlite_meta(dir: &TempDir) -> Arc<dyn MetadataStore> {
    let store = SqliteStore::new(dir.path().join("meta.db")).await.unwrap();
    Arc::new(store)
}
