//! S3 attachment backend.
//!
//! Objects are keyed positionally like the v1 file backend
//! (`<prefix>/<id>[.gz]`). Every operation retries a bounded number of
//! times on transient transport and throttling failures. A short-lived
//! positive/negative size cache absorbs repeated size probes right after a
//! write or delete; negative entries record confirmed absence so a hot
//! loop does not hammer the store with 404s.
//!
//! Deletions inside a transaction are deferred wholly to commit: S3 has no
//! cheap undo primitive, so no destructive call is ever issued before the
//! transaction outcome is known.

use crate::compress;
use crate::error::{StorageError, StorageResult};
use crate::traits::{AttachmentBackend, ByteStream, STREAM_CHUNK_SIZE};
use crate::transaction::TxLog;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::ProvideCredentials;
use aws_credential_types::provider::error::CredentialsError;
use aws_credential_types::provider::future::ProvideCredentials as ProvideCredentialsFuture;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::SdkError;
use aws_smithy_http_client::Builder as SmithyHttpClientBuilder;
use bytes::Bytes;
use coffer_core::{InstanceId, InstanceRef, PropTag};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tokio_util::io::ReaderStream;
use tracing::instrument;

/// Bounded retry on transient S3 failures.
const RETRY_ATTEMPTS: u32 = 5;
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Size cache TTLs: a found size stays fresh for ten minutes, a confirmed
/// absence for one.
const SIZE_POSITIVE_TTL: Duration = Duration::from_secs(600);
const SIZE_NEGATIVE_TTL: Duration = Duration::from_secs(60);

/// One size cache entry; `size == None` records confirmed absence.
#[derive(Clone, Copy, Debug)]
struct SizeEntry {
    expires_at: Instant,
    size: Option<u64>,
}

/// Mutex-guarded instance size cache.
#[derive(Debug, Default)]
pub(crate) struct SizeCache {
    entries: Mutex<HashMap<InstanceId, SizeEntry>>,
}

impl SizeCache {
    fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, instance: InstanceId, size: u64) {
        self.entries.lock().unwrap().insert(
            instance,
            SizeEntry {
                expires_at: Instant::now() + SIZE_POSITIVE_TTL,
                size: Some(size),
            },
        );
    }

    pub(crate) fn insert_negative(&self, instance: InstanceId) {
        self.entries.lock().unwrap().insert(
            instance,
            SizeEntry {
                expires_at: Instant::now() + SIZE_NEGATIVE_TTL,
                size: None,
            },
        );
    }

    pub(crate) fn remove(&self, instance: InstanceId) {
        self.entries.lock().unwrap().remove(&instance);
    }

    /// `None` is a miss; `Some(None)` a cached absence.
    pub(crate) fn lookup(&self, instance: InstanceId) -> Option<Option<u64>> {
        self.lookup_at(instance, Instant::now())
    }

    fn lookup_at(&self, instance: InstanceId, now: Instant) -> Option<Option<u64>> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(&instance)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.size)
    }
}

/// Lazily initializes the AWS default credentials chain on first signed
/// request, keeping backend construction free of TLS/trust-root side
/// effects in environments without ambient credentials.
#[derive(Debug)]
struct LazyCredentials {
    region: String,
    chain: OnceCell<aws_config::default_provider::credentials::DefaultCredentialsChain>,
}

impl LazyCredentials {
    async fn credentials(&self) -> aws_credential_types::provider::Result {
        let region = aws_config::Region::new(self.region.clone());
        let chain = self
            .chain
            .get_or_try_init(|| async {
                Ok::<_, CredentialsError>(
                    aws_config::default_provider::credentials::DefaultCredentialsChain::builder()
                        .region(region)
                        .build()
                        .await,
                )
            })
            .await?;
        chain.provide_credentials().await
    }
}

impl ProvideCredentials for LazyCredentials {
    fn provide_credentials<'a>(&'a self) -> ProvideCredentialsFuture<'a>
    where
        Self: 'a,
    {
        ProvideCredentialsFuture::new(self.credentials())
    }
}

/// S3-compatible attachment backend using the AWS SDK.
pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: Option<String>,
    compression_level: u32,
    size_cache: SizeCache,
    tx: Mutex<TxLog<(InstanceId, String)>>,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl S3Backend {
    /// Create a new S3 backend.
    ///
    /// `force_path_style` selects path-style URLs (`endpoint/bucket/key`)
    /// over virtual-hosted style; required for MinIO and some other
    /// S3-compatible services.
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        bucket: &str,
        endpoint: Option<String>,
        region: Option<String>,
        prefix: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        force_path_style: bool,
        compression_level: u32,
    ) -> StorageResult<Self> {
        if access_key_id.is_some() ^ secret_access_key.is_some() {
            return Err(StorageError::Config(
                "s3 config requires both access_key_id and secret_access_key when either is set"
                    .to_string(),
            ));
        }

        let resolved_region = region.unwrap_or_else(|| "us-east-1".to_string());
        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new(resolved_region.clone()));

        if let (Some(key_id), Some(secret)) = (access_key_id, secret_access_key) {
            let credentials =
                aws_sdk_s3::config::Credentials::new(key_id, secret, None, None, "coffer-config");
            builder = builder.credentials_provider(credentials);
        } else {
            builder = builder.credentials_provider(LazyCredentials {
                region: resolved_region,
                chain: OnceCell::new(),
            });
        }

        if let Some(endpoint_url) = endpoint {
            // Handle bare host:port endpoints by prepending http://
            let lower = endpoint_url.to_ascii_lowercase();
            let normalized = if lower.starts_with("http://") || lower.starts_with("https://") {
                endpoint_url
            } else {
                format!("http://{endpoint_url}")
            };

            // For explicit HTTP endpoints, use an HTTP-only client so SDK
            // initialization does not depend on native trust roots.
            if normalized.to_ascii_lowercase().starts_with("http://") {
                builder = builder.http_client(SmithyHttpClientBuilder::new().build_http());
            }
            builder = builder.endpoint_url(normalized);
        }

        if force_path_style {
            builder = builder.force_path_style(true);
        }

        // Strip trailing slashes to avoid double-slash keys.
        let prefix = prefix.map(|p| p.trim_end_matches('/').to_string());

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: bucket.to_string(),
            prefix,
            compression_level,
            size_cache: SizeCache::new(),
            tx: Mutex::new(TxLog::new()),
        })
    }

    /// Object key for an instance: `<prefix>/<id>[.gz]`.
    fn key_for(&self, instance: InstanceId, compressed: bool) -> String {
        let name = if compressed {
            format!("{instance}.gz")
        } else {
            format!("{instance}")
        };
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{name}"),
            None => name,
        }
    }

    fn is_retryable<E>(err: &SdkError<E>) -> bool {
        match err {
            SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_) => {
                true
            }
            SdkError::ServiceError(ctx) => {
                let status = ctx.raw().status().as_u16();
                status == 429 || (300..400).contains(&status) || (500..600).contains(&status)
            }
            _ => false,
        }
    }

    fn is_absent<E>(err: &SdkError<E>) -> bool {
        matches!(err, SdkError::ServiceError(ctx) if ctx.raw().status().as_u16() == 404)
    }

    fn map_sdk_error<E>(what: impl std::fmt::Display, err: SdkError<E>) -> StorageError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        if Self::is_absent(&err) {
            StorageError::NotFound(what.to_string())
        } else {
            StorageError::Network(err.to_string())
        }
    }

    /// Run one S3 call with bounded fixed-interval retry on transient
    /// failures; retries are invisible to the caller unless exhausted.
    async fn with_retry<T, E, F, Fut>(
        &self,
        what: &'static str,
        mut op: F,
    ) -> Result<T, SdkError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SdkError<E>>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < RETRY_ATTEMPTS && Self::is_retryable(&err) => {
                    tracing::warn!(what, attempt, error = %err, "retrying S3 operation");
                    tokio::time::sleep(RETRY_DELAY).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn put_object(&self, key: &str, payload: Bytes) -> StorageResult<()> {
        self.with_retry("put_object", || {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(aws_sdk_s3::primitives::ByteStream::from(payload.clone()))
                .send()
        })
        .await
        .map_err(|e| Self::map_sdk_error(key, e))?;
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> StorageResult<()> {
        match self
            .with_retry("delete_object", || {
                self.client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .send()
            })
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if Self::is_absent(&e) => Ok(()),
            Err(e) => Err(Self::map_sdk_error(key, e)),
        }
    }

    async fn head_size(&self, key: &str) -> StorageResult<u64> {
        let head = self
            .with_retry("head_object", || {
                self.client
                    .head_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .send()
            })
            .await
            .map_err(|e| Self::map_sdk_error(key, e))?;
        Ok(head.content_length().unwrap_or(0).max(0) as u64)
    }

    /// Find the key an instance is stored under, preferring the variant
    /// the current compression setting would have written.
    async fn resolve_key(&self, instance: InstanceId) -> StorageResult<(String, bool)> {
        let preferred = self.compression_level > 0;
        for compressed in [preferred, !preferred] {
            let key = self.key_for(instance, compressed);
            match self.head_size(&key).await {
                Ok(_) => return Ok((key, compressed)),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StorageError::NotFound(instance.to_string()))
    }

    async fn get_object_bytes(&self, key: &str) -> StorageResult<Bytes> {
        let resp = self
            .with_retry("get_object", || {
                self.client
                    .get_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .send()
            })
            .await
            .map_err(|e| Self::map_sdk_error(key, e))?;
        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Network(e.to_string()))?;
        Ok(data.into_bytes())
    }

    /// Remote analogue of the gzip trailer trick: fetch only the last four
    /// bytes of the object, the little-endian uncompressed size.
    async fn gzip_trailer_size(&self, key: &str) -> StorageResult<u64> {
        let resp = self
            .with_retry("get_object_range", || {
                self.client
                    .get_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .range("bytes=-4")
                    .send()
            })
            .await
            .map_err(|e| Self::map_sdk_error(key, e))?;
        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Network(e.to_string()))?
            .into_bytes();
        if data.len() != 4 {
            tracing::warn!(key, len = data.len(), "short gzip trailer, reporting size 0");
            return Ok(0);
        }
        Ok(u64::from(u32::from_le_bytes([
            data[0], data[1], data[2], data[3],
        ])))
    }
}

#[async_trait]
impl AttachmentBackend for S3Backend {
    #[instrument(skip(self, data), fields(backend = "s3", size = data.len()))]
    async fn put(
        &self,
        instance: InstanceId,
        _tag: PropTag,
        data: Bytes,
    ) -> StorageResult<Option<String>> {
        let compress = self.compression_level > 0 && compress::should_compress(&data);
        let key = self.key_for(instance, compress);
        let size = data.len() as u64;

        let payload = if compress {
            Bytes::from(compress::gzip_compress(&data, self.compression_level).await?)
        } else {
            data
        };

        self.put_object(&key, payload).await?;
        self.size_cache.insert(instance, size);
        self.tx.lock().unwrap().note_created((instance, key));
        Ok(None)
    }

    #[instrument(skip(self, stream), fields(backend = "s3"))]
    async fn put_stream(
        &self,
        instance: InstanceId,
        tag: PropTag,
        mut stream: ByteStream,
    ) -> StorageResult<(u64, Option<String>)> {
        // The SDK needs a length up front, so buffer the stream.
        let mut buf = Vec::new();
        while let Some(piece) = stream.next().await {
            buf.extend_from_slice(&piece?);
        }
        let total = buf.len() as u64;
        let ident = self.put(instance, tag, Bytes::from(buf)).await?;
        Ok((total, ident))
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get(&self, instance: &InstanceRef) -> StorageResult<Bytes> {
        let (key, compressed) = self.resolve_key(instance.id).await?;
        let data = self.get_object_bytes(&key).await?;
        if compressed {
            Ok(Bytes::from(compress::gzip_decompress(&data).await?))
        } else {
            Ok(data)
        }
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get_stream(&self, instance: &InstanceRef) -> StorageResult<ByteStream> {
        let (key, compressed) = self.resolve_key(instance.id).await?;
        if compressed {
            // Decompression needs the whole payload anyway.
            let data = self.get(instance).await?;
            return Ok(crate::traits::one_shot(data));
        }

        let resp = self
            .with_retry("get_object", || {
                self.client
                    .get_object()
                    .bucket(&self.bucket)
                    .key(&key)
                    .send()
            })
            .await
            .map_err(|e| Self::map_sdk_error(&key, e))?;

        let reader = resp.body.into_async_read();
        let stream = ReaderStream::with_capacity(reader, STREAM_CHUNK_SIZE)
            .map(|piece| piece.map_err(StorageError::Io));
        Ok(Box::pin(stream))
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn size(&self, instance: &InstanceRef) -> StorageResult<u64> {
        if let Some(cached) = self.size_cache.lookup(instance.id) {
            return cached.ok_or_else(|| StorageError::NotFound(instance.id.to_string()));
        }

        let preferred = self.compression_level > 0;
        for compressed in [preferred, !preferred] {
            let key = self.key_for(instance.id, compressed);
            match self.head_size(&key).await {
                Ok(stored) => {
                    let size = if compressed {
                        self.gzip_trailer_size(&key).await?
                    } else {
                        stored
                    };
                    self.size_cache.insert(instance.id, size);
                    return Ok(size);
                }
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }

        self.size_cache.insert_negative(instance.id);
        Err(StorageError::NotFound(instance.id.to_string()))
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn exists(&self, instance: &InstanceRef) -> StorageResult<bool> {
        match self.resolve_key(instance.id).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn delete(&self, instance: &InstanceRef) -> StorageResult<()> {
        let (key, _) = match self.resolve_key(instance.id).await {
            Ok(found) => found,
            Err(e) if e.is_not_found() => {
                tracing::warn!(instance = %instance.id, "delete of absent S3 object");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let entry = (instance.id, key.clone());
        let deferred = {
            let mut tx = self.tx.lock().unwrap();
            if tx.is_active() && !tx.remove_created(&entry) {
                tx.stage_delete(entry);
                true
            } else {
                false
            }
        };

        if !deferred {
            self.delete_object(&key).await?;
            self.size_cache.insert_negative(instance.id);
        }
        Ok(())
    }

    async fn begin(&self) -> StorageResult<()> {
        self.tx.lock().unwrap().begin()
    }

    async fn commit(&self) -> StorageResult<()> {
        let sets = self.tx.lock().unwrap().end()?;
        for (instance, key) in sets.deleted {
            match self.delete_object(&key).await {
                Ok(()) => self.size_cache.insert_negative(instance),
                Err(e) => {
                    tracing::warn!(%instance, key, error = %e, "deferred S3 delete failed")
                }
            }
        }
        Ok(())
    }

    async fn rollback(&self) -> StorageResult<()> {
        let sets = self.tx.lock().unwrap().end()?;
        for (instance, key) in sets.created {
            if let Err(e) = self.delete_object(&key).await {
                tracing::warn!(%instance, key, error = %e, "rollback of uploaded S3 object failed");
            }
            self.size_cache.remove(instance);
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_cache_positive_hit() {
        let cache = SizeCache::new();
        cache.insert(InstanceId(1), 1024);

        // Served from cache without touching the network.
        assert_eq!(cache.lookup(InstanceId(1)), Some(Some(1024)));
        assert_eq!(cache.lookup(InstanceId(2)), None);
    }

    #[test]
    fn test_size_cache_negative_hit() {
        let cache = SizeCache::new();
        cache.insert_negative(InstanceId(7));

        // A confirmed absence is a hit, not a miss: no repeated 404s.
        assert_eq!(cache.lookup(InstanceId(7)), Some(None));
    }

    #[test]
    fn test_size_cache_expiry() {
        let cache = SizeCache::new();
        cache.insert(InstanceId(1), 10);
        cache.insert_negative(InstanceId(2));

        let later = Instant::now() + SIZE_POSITIVE_TTL + Duration::from_secs(1);
        assert_eq!(cache.lookup_at(InstanceId(1), later), None);

        let after_negative = Instant::now() + SIZE_NEGATIVE_TTL + Duration::from_secs(1);
        assert_eq!(cache.lookup_at(InstanceId(2), after_negative), None);
    }

    #[test]
    fn test_size_cache_delete_overwrites_positive() {
        let cache = SizeCache::new();
        cache.insert(InstanceId(1), 10);
        cache.insert_negative(InstanceId(1));
        assert_eq!(cache.lookup(InstanceId(1)), Some(None));
    }
}
