//! Database attachment backend.
//!
//! Blob bytes are chunked and stored as rows in the `lob` table next to the
//! reference table. No compression is applied, and the transaction hooks
//! are no-ops: the chunk rows live in the same database as the reference
//! rows, so they commit and roll back atomically with the enclosing SQL
//! transaction for free.

use crate::error::{StorageError, StorageResult};
use crate::traits::{AttachmentBackend, ByteStream};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use coffer_core::{InstanceId, InstanceRef, PropTag};
use coffer_metadata::MetadataStore;
use futures::StreamExt;
use std::sync::Arc;
use tracing::instrument;

/// Chunk size for `lob` rows (384 KiB).
pub const LOB_CHUNK_SIZE: usize = 384 * 1024;

/// Attachment backend storing payloads in the metadata database.
pub struct DatabaseBackend {
    meta: Arc<dyn MetadataStore>,
}

impl DatabaseBackend {
    /// Create a new database backend over the given metadata store.
    pub fn new(meta: Arc<dyn MetadataStore>) -> Self {
        Self { meta }
    }
}

#[async_trait]
impl AttachmentBackend for DatabaseBackend {
    #[instrument(skip(self, data), fields(backend = "database", size = data.len()))]
    async fn put(
        &self,
        instance: InstanceId,
        tag: PropTag,
        data: Bytes,
    ) -> StorageResult<Option<String>> {
        for (chunk_id, chunk) in data.chunks(LOB_CHUNK_SIZE).enumerate() {
            self.meta
                .write_lob_chunk(instance, chunk_id as u32, tag, chunk)
                .await?;
        }
        Ok(None)
    }

    #[instrument(skip(self, stream), fields(backend = "database"))]
    async fn put_stream(
        &self,
        instance: InstanceId,
        tag: PropTag,
        mut stream: ByteStream,
    ) -> StorageResult<(u64, Option<String>)> {
        let mut buf = BytesMut::new();
        let mut chunk_id = 0u32;
        let mut total = 0u64;

        while let Some(piece) = stream.next().await {
            let piece = piece?;
            total += piece.len() as u64;
            buf.extend_from_slice(&piece);
            while buf.len() >= LOB_CHUNK_SIZE {
                let chunk = buf.split_to(LOB_CHUNK_SIZE);
                self.meta
                    .write_lob_chunk(instance, chunk_id, tag, &chunk)
                    .await?;
                chunk_id += 1;
            }
        }
        if !buf.is_empty() {
            self.meta
                .write_lob_chunk(instance, chunk_id, tag, &buf)
                .await?;
        }
        Ok((total, None))
    }

    #[instrument(skip(self), fields(backend = "database"))]
    async fn get(&self, instance: &InstanceRef) -> StorageResult<Bytes> {
        if !self.meta.lob_exists(instance.id).await? {
            return Err(StorageError::NotFound(instance.id.to_string()));
        }
        Ok(self.meta.read_lob(instance.id).await?)
    }

    #[instrument(skip(self), fields(backend = "database"))]
    async fn get_stream(&self, instance: &InstanceRef) -> StorageResult<ByteStream> {
        if !self.meta.lob_exists(instance.id).await? {
            return Err(StorageError::NotFound(instance.id.to_string()));
        }

        let meta = self.meta.clone();
        let id = instance.id;
        let stream = async_stream::try_stream! {
            let mut chunk_id = 0u32;
            while let Some(chunk) = meta.read_lob_chunk(id, chunk_id).await? {
                yield chunk;
                chunk_id += 1;
            }
        };
        Ok(Box::pin(stream))
    }

    #[instrument(skip(self), fields(backend = "database"))]
    async fn size(&self, instance: &InstanceRef) -> StorageResult<u64> {
        Ok(self.meta.lob_size(instance.id).await?.unwrap_or(0))
    }

    #[instrument(skip(self), fields(backend = "database"))]
    async fn exists(&self, instance: &InstanceRef) -> StorageResult<bool> {
        Ok(self.meta.lob_exists(instance.id).await?)
    }

    #[instrument(skip(self), fields(backend = "database"))]
    async fn delete(&self, instance: &InstanceRef) -> StorageResult<()> {
        self.meta.delete_lob(instance.id).await?;
        Ok(())
    }

    async fn begin(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn commit(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn rollback(&self) -> StorageResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "database"
    }
}
