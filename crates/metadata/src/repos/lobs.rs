//! Lob chunk table repository, backing the database attachment backend.

use crate::error::MetadataResult;
use async_trait::async_trait;
use bytes::Bytes;
use coffer_core::{InstanceId, PropTag};

/// Repository for the `lob` table.
///
/// Blob bytes are chunked by the database backend and stored as ordered
/// rows; reconstruction concatenates chunks by `chunkid`. The rows live in
/// the same database as the reference table, so they commit and roll back
/// atomically with it.
#[async_trait]
pub trait LobRepo: Send + Sync {
    /// Append one chunk of an instance's payload.
    async fn write_lob_chunk(
        &self,
        instance: InstanceId,
        chunk_id: u32,
        tag: PropTag,
        data: &[u8],
    ) -> MetadataResult<()>;

    /// Read one chunk, or `None` past the end.
    async fn read_lob_chunk(
        &self,
        instance: InstanceId,
        chunk_id: u32,
    ) -> MetadataResult<Option<Bytes>>;

    /// Read the full payload, chunks concatenated in order.
    async fn read_lob(&self, instance: InstanceId) -> MetadataResult<Bytes>;

    /// Total payload size, summed over chunks. Tolerates legacy rows with
    /// inconsistent chunk sizing. `None` when no chunks exist.
    async fn lob_size(&self, instance: InstanceId) -> MetadataResult<Option<u64>>;

    /// Whether any chunk exists for the instance.
    async fn lob_exists(&self, instance: InstanceId) -> MetadataResult<bool>;

    /// Delete all chunks of an instance. Idempotent.
    async fn delete_lob(&self, instance: InstanceId) -> MetadataResult<()>;
}
