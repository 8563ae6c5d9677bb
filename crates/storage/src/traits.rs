//! Backend trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use coffer_core::{InstanceId, InstanceRef, PropTag};
use futures::Stream;
use std::pin::Pin;

/// A boxed stream of bytes for streaming loads and saves.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Chunk size for streaming reads (64 KiB).
pub const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Wrap a fully materialized buffer as a one-shot [`ByteStream`].
pub fn one_shot(data: Bytes) -> ByteStream {
    Box::pin(futures::stream::once(async move { Ok(data) }))
}

/// Raw per-instance blob I/O implemented by each storage backend.
///
/// Backends own their physical layout and transaction staging; the
/// single-instance reference semantics live above this trait in
/// [`crate::AttachmentStore`]. The engine only calls `delete` for instances
/// whose last reference row is gone.
#[async_trait]
pub trait AttachmentBackend: Send + Sync + 'static {
    /// Store the payload of a new instance. Returns the backend-chosen
    /// content ident for content-addressed layouts, `None` for positional
    /// naming.
    async fn put(
        &self,
        instance: InstanceId,
        tag: PropTag,
        data: Bytes,
    ) -> StorageResult<Option<String>>;

    /// Store the payload of a new instance from a stream, without
    /// materializing it fully in memory where the layout permits. Returns
    /// the byte count consumed and the content ident, if any.
    async fn put_stream(
        &self,
        instance: InstanceId,
        tag: PropTag,
        stream: ByteStream,
    ) -> StorageResult<(u64, Option<String>)>;

    /// Load an instance's payload.
    async fn get(&self, instance: &InstanceRef) -> StorageResult<Bytes>;

    /// Load an instance's payload as a byte stream.
    async fn get_stream(&self, instance: &InstanceRef) -> StorageResult<ByteStream>;

    /// Uncompressed payload size without loading the payload.
    async fn size(&self, instance: &InstanceRef) -> StorageResult<u64>;

    /// Whether the instance's payload is physically present.
    async fn exists(&self, instance: &InstanceRef) -> StorageResult<bool>;

    /// Physically delete an instance's payload. Deferred until `commit`
    /// while a transaction is open. Deleting an absent payload logs a
    /// warning and succeeds.
    async fn delete(&self, instance: &InstanceRef) -> StorageResult<()>;

    /// Open a transaction scope staging destructive effects. Fails if one
    /// is already open.
    async fn begin(&self) -> StorageResult<()>;

    /// Make the staged effects permanent.
    async fn commit(&self) -> StorageResult<()>;

    /// Undo everything since `begin`: remove created payloads, restore
    /// soft-deleted ones.
    async fn rollback(&self) -> StorageResult<()>;

    /// Static identifier of the backend type, for logging.
    fn backend_name(&self) -> &'static str;
}
