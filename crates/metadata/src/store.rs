//! Metadata store trait and SQLite implementation.

use crate::error::MetadataResult;
use crate::models::ReferenceRow;
use crate::repos::{LobRepo, ReferenceRepo};
use async_trait::async_trait;
use bytes::Bytes;
use coffer_core::{HierarchyId, InstanceId, PropTag};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// SQLite schema (embedded).
const SQLITE_SCHEMA: &str = include_str!("sqlite_schema.sql");

/// SQLite has a limit of ~999 bind parameters per statement.
const BATCH_SIZE: usize = 900;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: ReferenceRepo + LobRepo + Send + Sync {
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Create a new SQLite store.
    pub async fn new(path: impl AsRef<Path>) -> MetadataResult<Self> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // SQLite permits limited write concurrency; a single connection avoids
            // persistent "database is locked" failures under concurrent workers.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        for statement in SQLITE_SCHEMA.split(';') {
            let trimmed = statement.trim();
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            if has_sql {
                sqlx::query(trimmed).execute(&self.pool).await?;
            }
        }
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ReferenceRepo for SqliteStore {
    async fn lookup_reference(
        &self,
        hierarchy: HierarchyId,
        tag: PropTag,
    ) -> MetadataResult<Option<ReferenceRow>> {
        let row = sqlx::query_as::<_, ReferenceRow>(
            "SELECT instanceid, hierarchyid, tag, filename FROM singleinstances \
             WHERE hierarchyid = ? AND tag = ?",
        )
        .bind(hierarchy.0 as i64)
        .bind(tag.0 as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn references_of(&self, hierarchy: HierarchyId) -> MetadataResult<Vec<ReferenceRow>> {
        let rows = sqlx::query_as::<_, ReferenceRow>(
            "SELECT instanceid, hierarchyid, tag, filename FROM singleinstances \
             WHERE hierarchyid = ?",
        )
        .bind(hierarchy.0 as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn allocate_instance(
        &self,
        hierarchy: HierarchyId,
        tag: PropTag,
    ) -> MetadataResult<InstanceId> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("INSERT INTO instance_ids DEFAULT VALUES")
            .execute(&mut *tx)
            .await?;
        let instance_id = result.last_insert_rowid();

        // AUTOINCREMENT tracks the high-water mark in sqlite_sequence, so
        // the row itself is disposable; drop it to keep the table empty.
        sqlx::query("DELETE FROM instance_ids WHERE id = ?")
            .bind(instance_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "REPLACE INTO singleinstances (instanceid, hierarchyid, tag, filename) \
             VALUES (?, ?, ?, NULL)",
        )
        .bind(instance_id)
        .bind(hierarchy.0 as i64)
        .bind(tag.0 as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(InstanceId(instance_id as u64))
    }

    async fn link_instance(
        &self,
        hierarchy: HierarchyId,
        tag: PropTag,
        instance: InstanceId,
    ) -> MetadataResult<()> {
        // The new row inherits the instance's backend ident from any
        // existing row pointing at it.
        sqlx::query(
            "REPLACE INTO singleinstances (instanceid, hierarchyid, tag, filename) \
             SELECT instanceid, ?, ?, filename FROM singleinstances \
             WHERE instanceid = ? LIMIT 1",
        )
        .bind(hierarchy.0 as i64)
        .bind(tag.0 as i64)
        .bind(instance.0 as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_instance_ident(
        &self,
        instance: InstanceId,
        ident: Option<&str>,
    ) -> MetadataResult<()> {
        sqlx::query("UPDATE singleinstances SET filename = ? WHERE instanceid = ?")
            .bind(ident)
            .bind(instance.0 as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn copy_references(
        &self,
        src: HierarchyId,
        dst: HierarchyId,
    ) -> MetadataResult<u64> {
        let result = sqlx::query(
            "REPLACE INTO singleinstances (instanceid, hierarchyid, tag, filename) \
             SELECT instanceid, ?, tag, filename FROM singleinstances \
             WHERE hierarchyid = ?",
        )
        .bind(dst.0 as i64)
        .bind(src.0 as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_reference(
        &self,
        hierarchy: HierarchyId,
        tag: PropTag,
    ) -> MetadataResult<Option<ReferenceRow>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, ReferenceRow>(
            "SELECT instanceid, hierarchyid, tag, filename FROM singleinstances \
             WHERE hierarchyid = ? AND tag = ?",
        )
        .bind(hierarchy.0 as i64)
        .bind(tag.0 as i64)
        .fetch_optional(&mut *tx)
        .await?;

        if row.is_some() {
            sqlx::query("DELETE FROM singleinstances WHERE hierarchyid = ? AND tag = ?")
                .bind(hierarchy.0 as i64)
                .bind(tag.0 as i64)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(row)
    }

    async fn delete_references(
        &self,
        hierarchies: &[HierarchyId],
    ) -> MetadataResult<Vec<ReferenceRow>> {
        if hierarchies.is_empty() {
            return Ok(Vec::new());
        }

        let mut removed = Vec::new();
        for batch in hierarchies.chunks(BATCH_SIZE) {
            let placeholders: Vec<&str> = batch.iter().map(|_| "?").collect();
            let in_clause = placeholders.join(", ");

            let mut tx = self.pool.begin().await?;

            let select = format!(
                "SELECT instanceid, hierarchyid, tag, filename FROM singleinstances \
                 WHERE hierarchyid IN ({in_clause})"
            );
            let mut query = sqlx::query_as::<_, ReferenceRow>(&select);
            for hierarchy in batch {
                query = query.bind(hierarchy.0 as i64);
            }
            let rows = query.fetch_all(&mut *tx).await?;

            let delete = format!("DELETE FROM singleinstances WHERE hierarchyid IN ({in_clause})");
            let mut query = sqlx::query(&delete);
            for hierarchy in batch {
                query = query.bind(hierarchy.0 as i64);
            }
            query.execute(&mut *tx).await?;

            tx.commit().await?;
            removed.extend(rows);
        }
        Ok(removed)
    }

    async fn instance_exists(&self, instance: InstanceId) -> MetadataResult<bool> {
        let row: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM singleinstances WHERE instanceid = ? LIMIT 1")
                .bind(instance.0 as i64)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    async fn orphaned_instances(
        &self,
        candidates: &[InstanceId],
    ) -> MetadataResult<Vec<InstanceId>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let mut still_referenced = std::collections::HashSet::new();
        for batch in candidates.chunks(BATCH_SIZE) {
            let placeholders: Vec<&str> = batch.iter().map(|_| "?").collect();
            let select = format!(
                "SELECT DISTINCT instanceid FROM singleinstances WHERE instanceid IN ({})",
                placeholders.join(", ")
            );
            let mut query = sqlx::query(&select);
            for instance in batch {
                query = query.bind(instance.0 as i64);
            }
            let rows = query.fetch_all(&self.pool).await?;
            for row in rows {
                let id: i64 = row.get(0);
                still_referenced.insert(InstanceId(id as u64));
            }
        }

        // Candidates minus survivors, order preserved, duplicates dropped.
        let mut seen = std::collections::HashSet::new();
        Ok(candidates
            .iter()
            .filter(|id| !still_referenced.contains(id) && seen.insert(**id))
            .copied()
            .collect())
    }
}

#[async_trait]
impl LobRepo for SqliteStore {
    async fn write_lob_chunk(
        &self,
        instance: InstanceId,
        chunk_id: u32,
        tag: PropTag,
        data: &[u8],
    ) -> MetadataResult<()> {
        sqlx::query(
            "REPLACE INTO lob (instanceid, chunkid, tag, val_binary) VALUES (?, ?, ?, ?)",
        )
        .bind(instance.0 as i64)
        .bind(chunk_id as i64)
        .bind(tag.0 as i64)
        .bind(data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn read_lob_chunk(
        &self,
        instance: InstanceId,
        chunk_id: u32,
    ) -> MetadataResult<Option<Bytes>> {
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT val_binary FROM lob WHERE instanceid = ? AND chunkid = ?")
                .bind(instance.0 as i64)
                .bind(chunk_id as i64)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(data,)| Bytes::from(data)))
    }

    async fn read_lob(&self, instance: InstanceId) -> MetadataResult<Bytes> {
        // Pre-size the output buffer; tolerates legacy inconsistent chunk sizes.
        let total = self.lob_size(instance).await?.unwrap_or(0);
        let mut out = Vec::with_capacity(total as usize);

        let rows: Vec<(Vec<u8>,)> = sqlx::query_as(
            "SELECT val_binary FROM lob WHERE instanceid = ? ORDER BY chunkid",
        )
        .bind(instance.0 as i64)
        .fetch_all(&self.pool)
        .await?;

        for (chunk,) in rows {
            out.extend_from_slice(&chunk);
        }
        Ok(Bytes::from(out))
    }

    async fn lob_size(&self, instance: InstanceId) -> MetadataResult<Option<u64>> {
        let row: (Option<i64>,) =
            sqlx::query_as("SELECT SUM(LENGTH(val_binary)) FROM lob WHERE instanceid = ?")
                .bind(instance.0 as i64)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0.map(|size| size as u64))
    }

    async fn lob_exists(&self, instance: InstanceId) -> MetadataResult<bool> {
        let row: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM lob WHERE instanceid = ? LIMIT 1")
                .bind(instance.0 as i64)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    async fn delete_lob(&self, instance: InstanceId) -> MetadataResult<()> {
        sqlx::query("DELETE FROM lob WHERE instanceid = ?")
            .bind(instance.0 as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn test_store() -> (SqliteStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("meta.db")).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_allocate_and_lookup() {
        let (store, _dir) = test_store().await;
        let h = HierarchyId(1);
        let tag = PropTag(0x3701_0102);

        let id = store.allocate_instance(h, tag).await.unwrap();
        let row = store.lookup_reference(h, tag).await.unwrap().unwrap();
        assert_eq!(row.instance_id(), id);
        assert_eq!(row.filename, None);
    }

    #[tokio::test]
    async fn test_allocate_replaces_existing_pair() {
        let (store, _dir) = test_store().await;
        let h = HierarchyId(1);
        let tag = PropTag(1);

        let first = store.allocate_instance(h, tag).await.unwrap();
        let second = store.allocate_instance(h, tag).await.unwrap();
        assert_ne!(first, second);

        // At most one row per (hierarchy, tag); the old instance is orphaned.
        let row = store.lookup_reference(h, tag).await.unwrap().unwrap();
        assert_eq!(row.instance_id(), second);
        assert!(store.is_orphaned(first).await.unwrap());
    }

    #[tokio::test]
    async fn test_allocator_ids_monotonic_and_table_empty() {
        let (store, _dir) = test_store().await;

        let a = store.allocate_instance(HierarchyId(1), PropTag(1)).await.unwrap();
        let b = store.allocate_instance(HierarchyId(2), PropTag(1)).await.unwrap();
        let c = store.allocate_instance(HierarchyId(3), PropTag(1)).await.unwrap();
        assert!(a < b && b < c);

        // The allocator only keeps the sqlite_sequence high-water mark;
        // spent rows are dropped inside the allocation transaction.
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM instance_ids")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_copy_references_shares_instances() {
        let (store, _dir) = test_store().await;
        let src = HierarchyId(10);
        let dst = HierarchyId(11);

        let a = store.allocate_instance(src, PropTag(1)).await.unwrap();
        let b = store.allocate_instance(src, PropTag(2)).await.unwrap();

        let copied = store.copy_references(src, dst).await.unwrap();
        assert_eq!(copied, 2);

        let rows = store.references_of(dst).await.unwrap();
        let mut ids: Vec<InstanceId> = rows.iter().map(|r| r.instance_id()).collect();
        ids.sort();
        assert_eq!(ids, vec![a, b]);

        // Deleting the source rows must not orphan the shared instances.
        let removed = store.delete_references(&[src]).await.unwrap();
        assert_eq!(removed.len(), 2);
        let candidates: Vec<InstanceId> = removed.iter().map(|r| r.instance_id()).collect();
        assert!(store.orphaned_instances(&candidates).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_reference_idempotent() {
        let (store, _dir) = test_store().await;
        let h = HierarchyId(5);
        let tag = PropTag(7);

        assert!(store.delete_reference(h, tag).await.unwrap().is_none());

        let id = store.allocate_instance(h, tag).await.unwrap();
        let removed = store.delete_reference(h, tag).await.unwrap().unwrap();
        assert_eq!(removed.instance_id(), id);
        assert!(store.delete_reference(h, tag).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_orphan_detection_bulk() {
        let (store, _dir) = test_store().await;

        let shared = store.allocate_instance(HierarchyId(1), PropTag(1)).await.unwrap();
        store
            .link_instance(HierarchyId(2), PropTag(1), shared)
            .await
            .unwrap();
        let lone = store.allocate_instance(HierarchyId(3), PropTag(1)).await.unwrap();

        let removed = store.delete_references(&[HierarchyId(1), HierarchyId(3)]).await.unwrap();
        let candidates: Vec<InstanceId> = removed.iter().map(|r| r.instance_id()).collect();

        // `shared` survives via hierarchy 2; `lone` is orphaned.
        let orphans = store.orphaned_instances(&candidates).await.unwrap();
        assert_eq!(orphans, vec![lone]);
    }

    #[tokio::test]
    async fn test_link_inherits_ident() {
        let (store, _dir) = test_store().await;
        let id = store.allocate_instance(HierarchyId(1), PropTag(1)).await.unwrap();
        store
            .set_instance_ident(id, Some("aa/bb/cafe"))
            .await
            .unwrap();

        store.link_instance(HierarchyId(2), PropTag(9), id).await.unwrap();
        let row = store
            .lookup_reference(HierarchyId(2), PropTag(9))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.filename.as_deref(), Some("aa/bb/cafe"));
    }

    #[tokio::test]
    async fn test_lob_chunk_roundtrip() {
        let (store, _dir) = test_store().await;
        let id = store.allocate_instance(HierarchyId(1), PropTag(1)).await.unwrap();

        store.write_lob_chunk(id, 0, PropTag(1), b"hello ").await.unwrap();
        store.write_lob_chunk(id, 1, PropTag(1), b"world").await.unwrap();

        assert_eq!(store.lob_size(id).await.unwrap(), Some(11));
        assert_eq!(&store.read_lob(id).await.unwrap()[..], b"hello world");
        assert_eq!(
            store.read_lob_chunk(id, 1).await.unwrap().as_deref(),
            Some(&b"world"[..])
        );
        assert!(store.read_lob_chunk(id, 2).await.unwrap().is_none());

        store.delete_lob(id).await.unwrap();
        assert!(!store.lob_exists(id).await.unwrap());
        assert_eq!(store.lob_size(id).await.unwrap(), None);
    }
}
