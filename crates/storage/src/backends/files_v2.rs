//! v2 content-addressed file attachment backend.
//!
//! Every instance is identified by the SHA-256 of its content; identical
//! bytes saved under any number of instances occupy the disk once. Per
//! content hash the layout is:
//!
//! ```text
//! <base>/<hh>/<hh>/<rest>/content          the bytes, stored once
//! <base>/<hh>/<hh>/<rest>/holder/s<guid>i<id>   one zero-byte marker per referrer
//! ```
//!
//! Writers first build the payload under a server-scoped staging ident
//! (guaranteed unique), then atomically rename the staging directory onto
//! the hash directory. Losing that race means identical content is already
//! stored, so the writer joins it by dropping only a holder marker.
//! Compression is deliberately absent here: dedup is computed over raw
//! bytes.

use crate::error::{StorageError, StorageResult};
use crate::traits::{AttachmentBackend, ByteStream, STREAM_CHUNK_SIZE};
use crate::transaction::TxLog;
use async_trait::async_trait;
use bytes::Bytes;
use coffer_core::{ContentHash, InstanceId, InstanceRef, PropTag};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::instrument;
use uuid::Uuid;

/// Claim attempts before falling back to the staging ident.
const CLAIM_RETRIES: usize = 3;

/// Derived paths of one content directory.
struct Layout {
    base_dir: PathBuf,
    content_file: PathBuf,
    holder_dir: PathBuf,
}

/// v2 content-addressed file backend.
pub struct FileV2Backend {
    base: PathBuf,
    server_guid: Uuid,
    tx: Mutex<TxLog<(InstanceId, String)>>,
}

impl FileV2Backend {
    /// Create a new v2 backend rooted at `base` for this server.
    pub async fn new(base: impl AsRef<Path>, server_guid: Uuid) -> StorageResult<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base).await?;
        Ok(Self {
            base,
            server_guid,
            tx: Mutex::new(TxLog::new()),
        })
    }

    fn layout(&self, ident: &str) -> Layout {
        let base_dir = self.base.join(ident);
        Layout {
            content_file: base_dir.join("content"),
            holder_dir: base_dir.join("holder"),
            base_dir,
        }
    }

    /// Holder marker name for one `(server, instance)` referrer.
    fn holder_name(&self, instance: InstanceId) -> String {
        format!("s{}i{}", self.server_guid.simple(), instance)
    }

    /// Server-scoped staging ident: unique per `(server, instance)`, never
    /// collides with another writer's staging directory.
    fn staging_ident(&self, instance: InstanceId) -> String {
        let seed = format!("{}:{}", self.server_guid.simple(), instance);
        ContentHash::compute(seed.as_bytes()).to_ident()
    }

    /// rename(2) onto an existing non-empty directory reports EEXIST or
    /// ENOTEMPTY depending on the platform.
    fn is_dir_taken(err: &std::io::Error) -> bool {
        matches!(
            err.kind(),
            std::io::ErrorKind::AlreadyExists | std::io::ErrorKind::DirectoryNotEmpty
        )
    }

    /// Claim the hash directory by renaming the fully built staging
    /// directory onto it, or join an existing one by adding only our
    /// holder marker. Returns the ident the instance ends up under.
    async fn claim_or_join(
        &self,
        staging: &Layout,
        staging_ident: &str,
        hash: &Layout,
        hash_ident: &str,
        marker: &str,
    ) -> StorageResult<String> {
        if let Some(parent) = hash.base_dir.parent() {
            fs::create_dir_all(parent).await?;
        }

        for attempt in 0..CLAIM_RETRIES {
            match fs::rename(&staging.base_dir, &hash.base_dir).await {
                Ok(()) => return Ok(hash_ident.to_string()),
                Err(e) if Self::is_dir_taken(&e) => {
                    // Another writer stored identical content first; join it.
                    match fs::File::create(hash.holder_dir.join(marker)).await {
                        Ok(_) => {
                            let _ = fs::remove_dir_all(&staging.base_dir).await;
                            return Ok(hash_ident.to_string());
                        }
                        Err(join_err) if join_err.kind() == std::io::ErrorKind::NotFound => {
                            // The winner was deleted between our rename
                            // failing and the join; yield and re-claim.
                            tracing::debug!(
                                attempt,
                                ident = hash_ident,
                                "content directory vanished during join, retrying claim"
                            );
                            tokio::task::yield_now().await;
                        }
                        Err(join_err) => return Err(join_err.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        // Degraded but correct outcome: the instance keeps its unique
        // server-scoped directory and misses this one dedup opportunity.
        tracing::warn!(
            ident = hash_ident,
            fallback = staging_ident,
            "claim retries exhausted, keeping staging ident"
        );
        Ok(staging_ident.to_string())
    }

    /// Remove this instance's holder marker; when that leaves the holder
    /// directory empty, the whole content directory is collectible.
    async fn delete_holder(&self, instance: InstanceId, ident: &str) -> StorageResult<()> {
        let layout = self.layout(ident);
        let marker = layout.holder_dir.join(self.holder_name(instance));
        if let Err(e) = fs::remove_file(&marker).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            return Err(StorageError::from_io(ident, e));
        }

        match fs::remove_dir(&layout.holder_dir).await {
            Ok(()) => {
                // Last holder gone; reclaim the content.
                if let Err(e) = fs::remove_dir_all(&layout.base_dir).await
                    && e.kind() != std::io::ErrorKind::NotFound
                {
                    return Err(StorageError::from_io(ident, e));
                }
                Ok(())
            }
            // Other holders remain, or someone else already collected it.
            Err(e)
                if e.kind() == std::io::ErrorKind::DirectoryNotEmpty
                    || e.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(e) => Err(StorageError::from_io(ident, e)),
        }
    }

    fn require_ident<'a>(instance: &'a InstanceRef) -> StorageResult<&'a str> {
        instance.ident.as_deref().ok_or_else(|| {
            StorageError::InvalidParameter(format!(
                "instance {} carries no content ident",
                instance.id
            ))
        })
    }
}

#[async_trait]
impl AttachmentBackend for FileV2Backend {
    #[instrument(skip(self, data), fields(backend = "files_v2", size = data.len()))]
    async fn put(
        &self,
        instance: InstanceId,
        _tag: PropTag,
        data: Bytes,
    ) -> StorageResult<Option<String>> {
        let hash_ident = ContentHash::compute(&data).to_ident();
        let hash = self.layout(&hash_ident);
        let marker = self.holder_name(instance);

        // Fast path: this instance already holds this exact content.
        // Nothing is created here, so nothing is staged; the holder may
        // predate the transaction and must survive a rollback.
        if fs::try_exists(hash.holder_dir.join(&marker)).await? {
            return Ok(Some(hash_ident));
        }

        let staging_ident = self.staging_ident(instance);
        let staging = self.layout(&staging_ident);
        fs::create_dir_all(&staging.holder_dir).await?;
        fs::write(&staging.content_file, &data).await?;
        fs::File::create(staging.holder_dir.join(&marker)).await?;

        let ident = self
            .claim_or_join(&staging, &staging_ident, &hash, &hash_ident, &marker)
            .await?;
        self.tx
            .lock()
            .unwrap()
            .note_created((instance, ident.clone()));
        Ok(Some(ident))
    }

    #[instrument(skip(self, stream), fields(backend = "files_v2"))]
    async fn put_stream(
        &self,
        instance: InstanceId,
        _tag: PropTag,
        mut stream: ByteStream,
    ) -> StorageResult<(u64, Option<String>)> {
        // The ident is unknowable before all bytes are seen, so spool to
        // the staging file while hashing incrementally.
        let staging_ident = self.staging_ident(instance);
        let staging = self.layout(&staging_ident);
        fs::create_dir_all(&staging.holder_dir).await?;

        let mut file = fs::File::create(&staging.content_file).await?;
        let mut hasher = ContentHash::hasher();
        let mut total = 0u64;
        while let Some(piece) = stream.next().await {
            let piece = match piece {
                Ok(piece) => piece,
                Err(e) => {
                    let _ = fs::remove_dir_all(&staging.base_dir).await;
                    return Err(e);
                }
            };
            hasher.update(&piece);
            total += piece.len() as u64;
            file.write_all(&piece).await?;
        }
        file.flush().await?;
        drop(file);

        let hash_ident = hasher.finalize().to_ident();
        let hash = self.layout(&hash_ident);
        let marker = self.holder_name(instance);

        // Existing holder for this exact content: nothing new to stage.
        if fs::try_exists(hash.holder_dir.join(&marker)).await? {
            let _ = fs::remove_dir_all(&staging.base_dir).await;
            return Ok((total, Some(hash_ident)));
        }

        fs::File::create(staging.holder_dir.join(&marker)).await?;
        let ident = self
            .claim_or_join(&staging, &staging_ident, &hash, &hash_ident, &marker)
            .await?;
        self.tx
            .lock()
            .unwrap()
            .note_created((instance, ident.clone()));
        Ok((total, Some(ident)))
    }

    #[instrument(skip(self), fields(backend = "files_v2"))]
    async fn get(&self, instance: &InstanceRef) -> StorageResult<Bytes> {
        let ident = Self::require_ident(instance)?;
        let layout = self.layout(ident);
        let data = fs::read(&layout.content_file)
            .await
            .map_err(|e| StorageError::from_io(ident, e))?;
        Ok(Bytes::from(data))
    }

    #[instrument(skip(self), fields(backend = "files_v2"))]
    async fn get_stream(&self, instance: &InstanceRef) -> StorageResult<ByteStream> {
        let ident = Self::require_ident(instance)?;
        let layout = self.layout(ident);
        let file = fs::File::open(&layout.content_file)
            .await
            .map_err(|e| StorageError::from_io(ident, e))?;

        let stream = async_stream::try_stream! {
            let mut file = file;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };
        Ok(Box::pin(stream))
    }

    #[instrument(skip(self), fields(backend = "files_v2"))]
    async fn size(&self, instance: &InstanceRef) -> StorageResult<u64> {
        let ident = Self::require_ident(instance)?;
        let layout = self.layout(ident);
        let meta = fs::metadata(&layout.content_file)
            .await
            .map_err(|e| StorageError::from_io(ident, e))?;
        Ok(meta.len())
    }

    #[instrument(skip(self), fields(backend = "files_v2"))]
    async fn exists(&self, instance: &InstanceRef) -> StorageResult<bool> {
        let ident = Self::require_ident(instance)?;
        Ok(fs::try_exists(self.layout(ident).content_file).await?)
    }

    #[instrument(skip(self), fields(backend = "files_v2"))]
    async fn delete(&self, instance: &InstanceRef) -> StorageResult<()> {
        let ident = Self::require_ident(instance)?.to_string();
        let key = (instance.id, ident.clone());

        let deferred = {
            let mut tx = self.tx.lock().unwrap();
            if tx.is_active() && !tx.remove_created(&key) {
                // Holder removal has no cheap undo, so defer it wholly to
                // commit; nothing destructive happens before then.
                tx.stage_delete(key);
                true
            } else {
                false
            }
        };

        if !deferred {
            self.delete_holder(instance.id, &ident).await?;
        }
        Ok(())
    }

    async fn begin(&self) -> StorageResult<()> {
        self.tx.lock().unwrap().begin()
    }

    async fn commit(&self) -> StorageResult<()> {
        let sets = self.tx.lock().unwrap().end()?;
        for (instance, ident) in sets.deleted {
            if let Err(e) = self.delete_holder(instance, &ident).await {
                tracing::warn!(%instance, ident, error = %e, "deferred holder delete failed");
            }
        }
        Ok(())
    }

    async fn rollback(&self) -> StorageResult<()> {
        let sets = self.tx.lock().unwrap().end()?;
        for (instance, ident) in sets.created {
            if let Err(e) = self.delete_holder(instance, &ident).await {
                tracing::warn!(%instance, ident, error = %e, "rollback of created instance failed");
            }
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "files_v2"
    }
}
