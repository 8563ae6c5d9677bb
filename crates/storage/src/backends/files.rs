//! v1 file attachment backend.
//!
//! One file per instance at `<base>/<id % L1>/<(id / L1) % L2>/<id>[.gz]`,
//! with a content-sniffing gzip decision. Deletions inside a transaction
//! are staged as reversible renames (`<name>.deleted`) and only unlinked at
//! commit, since the filesystem cannot ride the SQL rollback.

use crate::compress;
use crate::error::{StorageError, StorageResult};
use crate::traits::{AttachmentBackend, ByteStream, STREAM_CHUNK_SIZE};
use crate::transaction::TxLog;
use async_compression::Level;
use async_compression::tokio::bufread::GzipDecoder;
use async_compression::tokio::write::GzipEncoder;
use async_trait::async_trait;
use bytes::Bytes;
use coffer_core::{InstanceId, InstanceRef, PropTag};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::instrument;
use uuid::Uuid;

/// v1 fan-out file backend.
#[derive(Debug)]
pub struct FileBackend {
    base: PathBuf,
    compression_level: u32,
    fsync: bool,
    fanout: (u64, u64),
    tx: Mutex<TxLog<PathBuf>>,
}

impl FileBackend {
    /// Create a new file backend rooted at `base`.
    pub async fn new(
        base: impl AsRef<Path>,
        compression_level: u32,
        fsync: bool,
        fanout_l1: u64,
        fanout_l2: u64,
    ) -> StorageResult<Self> {
        // `path_for` divides by both levels.
        if fanout_l1 == 0 || fanout_l2 == 0 {
            return Err(StorageError::InvalidParameter(
                "directory fan-out levels must be non-zero".to_string(),
            ));
        }
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base).await?;
        Ok(Self {
            base,
            compression_level,
            fsync,
            fanout: (fanout_l1, fanout_l2),
            tx: Mutex::new(TxLog::new()),
        })
    }

    /// Physical path of an instance, fan-out bounded per directory.
    fn path_for(&self, instance: InstanceId, compressed: bool) -> PathBuf {
        let id = instance.as_u64();
        let l1 = id % self.fanout.0;
        let l2 = (id / self.fanout.0) % self.fanout.1;
        let name = if compressed {
            format!("{id}.gz")
        } else {
            format!("{id}")
        };
        self.base.join(l1.to_string()).join(l2.to_string()).join(name)
    }

    /// Soft-delete name used while a deletion is staged.
    fn marked_path(path: &Path) -> PathBuf {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(".deleted");
        path.with_file_name(name)
    }

    /// Find an instance's file, tolerating a historical change of the
    /// compression setting: if the expected variant is absent, the
    /// opposite-compression name is tried once.
    async fn resolve(&self, instance: InstanceId) -> StorageResult<(PathBuf, bool)> {
        let preferred = self.compression_level > 0;
        for compressed in [preferred, !preferred] {
            let path = self.path_for(instance, compressed);
            if fs::try_exists(&path).await? {
                return Ok((path, compressed));
            }
        }
        Err(StorageError::NotFound(instance.to_string()))
    }

    async fn ensure_parent(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Sync the containing directory so the rename survives a crash.
    async fn sync_parent(path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::File::open(parent).await?.sync_all().await?;
        }
        Ok(())
    }

    fn temp_sibling(path: &Path) -> PathBuf {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(format!(".tmp.{}", Uuid::new_v4()));
        path.with_file_name(name)
    }

    /// Write to a temp sibling, optionally fsync, then rename into place.
    async fn write_atomic(&self, path: &Path, data: &[u8]) -> StorageResult<()> {
        let temp = Self::temp_sibling(path);
        {
            let mut file = fs::File::create(&temp).await?;
            file.write_all(data).await?;
            if self.fsync {
                file.sync_all().await?;
            }
        }
        fs::rename(&temp, path).await?;
        if self.fsync {
            Self::sync_parent(path).await?;
        }
        Ok(())
    }

    async fn unlink_quiet(path: &Path) {
        if let Err(e) = fs::remove_file(path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove attachment file");
        }
    }
}

#[async_trait]
impl AttachmentBackend for FileBackend {
    #[instrument(skip(self, data), fields(backend = "files", size = data.len()))]
    async fn put(
        &self,
        instance: InstanceId,
        _tag: PropTag,
        data: Bytes,
    ) -> StorageResult<Option<String>> {
        let compress = self.compression_level > 0 && compress::should_compress(&data);
        let path = self.path_for(instance, compress);
        self.ensure_parent(&path).await?;

        if compress {
            let packed = compress::gzip_compress(&data, self.compression_level).await?;
            self.write_atomic(&path, &packed).await?;
        } else {
            self.write_atomic(&path, &data).await?;
        }

        self.tx.lock().unwrap().note_created(path);
        Ok(None)
    }

    #[instrument(skip(self, stream), fields(backend = "files"))]
    async fn put_stream(
        &self,
        instance: InstanceId,
        _tag: PropTag,
        mut stream: ByteStream,
    ) -> StorageResult<(u64, Option<String>)> {
        // Sniff enough leading bytes for the compression decision before
        // anything touches the disk.
        let mut sniff = Vec::new();
        while sniff.len() <= compress::MIN_COMPRESS_SIZE {
            match stream.next().await {
                Some(piece) => sniff.extend_from_slice(&piece?),
                None => break,
            }
        }

        let compress_it = self.compression_level > 0 && compress::should_compress(&sniff);
        let path = self.path_for(instance, compress_it);
        self.ensure_parent(&path).await?;
        let temp = Self::temp_sibling(&path);
        let file = fs::File::create(&temp).await?;
        let mut total = sniff.len() as u64;

        let result: StorageResult<()> = async {
            if compress_it {
                let mut encoder =
                    GzipEncoder::with_quality(file, Level::Precise(self.compression_level as i32));
                encoder.write_all(&sniff).await?;
                while let Some(piece) = stream.next().await {
                    let piece = piece?;
                    total += piece.len() as u64;
                    encoder.write_all(&piece).await?;
                }
                encoder.shutdown().await?;
                if self.fsync {
                    encoder.into_inner().sync_all().await?;
                }
            } else {
                let mut file = file;
                file.write_all(&sniff).await?;
                while let Some(piece) = stream.next().await {
                    let piece = piece?;
                    total += piece.len() as u64;
                    file.write_all(&piece).await?;
                }
                file.flush().await?;
                if self.fsync {
                    file.sync_all().await?;
                }
            }
            Ok(())
        }
        .await;

        if let Err(e) = result {
            Self::unlink_quiet(&temp).await;
            return Err(e);
        }

        fs::rename(&temp, &path).await?;
        if self.fsync {
            Self::sync_parent(&path).await?;
        }

        self.tx.lock().unwrap().note_created(path);
        Ok((total, None))
    }

    #[instrument(skip(self), fields(backend = "files"))]
    async fn get(&self, instance: &InstanceRef) -> StorageResult<Bytes> {
        let (path, compressed) = self.resolve(instance.id).await?;
        let data = fs::read(&path)
            .await
            .map_err(|e| StorageError::from_io(instance.id, e))?;
        if compressed {
            Ok(Bytes::from(compress::gzip_decompress(&data).await?))
        } else {
            Ok(Bytes::from(data))
        }
    }

    #[instrument(skip(self), fields(backend = "files"))]
    async fn get_stream(&self, instance: &InstanceRef) -> StorageResult<ByteStream> {
        let (path, compressed) = self.resolve(instance.id).await?;
        let file = fs::File::open(&path)
            .await
            .map_err(|e| StorageError::from_io(instance.id, e))?;

        let stream = async_stream::try_stream! {
            if compressed {
                let mut decoder = GzipDecoder::new(BufReader::new(file));
                let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
                loop {
                    let n = decoder.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    yield Bytes::copy_from_slice(&buf[..n]);
                }
            } else {
                let mut file = file;
                let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
                loop {
                    let n = file.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    yield Bytes::copy_from_slice(&buf[..n]);
                }
            }
        };
        Ok(Box::pin(stream))
    }

    #[instrument(skip(self), fields(backend = "files"))]
    async fn size(&self, instance: &InstanceRef) -> StorageResult<u64> {
        let (path, compressed) = self.resolve(instance.id).await?;
        if compressed {
            compress::gzip_uncompressed_size(&path).await
        } else {
            Ok(fs::metadata(&path).await?.len())
        }
    }

    #[instrument(skip(self), fields(backend = "files"))]
    async fn exists(&self, instance: &InstanceRef) -> StorageResult<bool> {
        match self.resolve(instance.id).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), fields(backend = "files"))]
    async fn delete(&self, instance: &InstanceRef) -> StorageResult<()> {
        let (path, _) = match self.resolve(instance.id).await {
            Ok(found) => found,
            Err(e) if e.is_not_found() => {
                tracing::warn!(instance = %instance.id, "delete of absent attachment file");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        enum Action {
            Unlink,
            Mark,
        }
        let action = {
            let mut tx = self.tx.lock().unwrap();
            if !tx.is_active() || tx.remove_created(&path) {
                // Idle, or created in this same transaction: either way the
                // file must not survive, so unlink right now.
                Action::Unlink
            } else {
                Action::Mark
            }
        };

        match action {
            Action::Unlink => {
                Self::unlink_quiet(&path).await;
            }
            Action::Mark => {
                fs::rename(&path, Self::marked_path(&path))
                    .await
                    .map_err(|e| StorageError::from_io(instance.id, e))?;
                self.tx.lock().unwrap().stage_marked(path);
            }
        }
        Ok(())
    }

    async fn begin(&self) -> StorageResult<()> {
        self.tx.lock().unwrap().begin()
    }

    async fn commit(&self) -> StorageResult<()> {
        let sets = self.tx.lock().unwrap().end()?;
        for path in sets.marked {
            Self::unlink_quiet(&Self::marked_path(&path)).await;
        }
        for path in sets.deleted {
            Self::unlink_quiet(&path).await;
        }
        Ok(())
    }

    async fn rollback(&self) -> StorageResult<()> {
        let sets = self.tx.lock().unwrap().end()?;
        for path in sets.created {
            Self::unlink_quiet(&path).await;
        }
        for path in sets.marked {
            if let Err(e) = fs::rename(Self::marked_path(&path), &path).await {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to restore soft-deleted attachment on rollback"
                );
            }
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "files"
    }
}
