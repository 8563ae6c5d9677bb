//! Attachment storage engine and backends for Coffer.
//!
//! Payloads are stored once per distinct instance; the metadata store's
//! reference table decides when an instance is shared and when it may be
//! physically removed. Four backends implement the physical layer:
//!
//! - [`DatabaseBackend`]: chunked rows in the metadata store's `lob` table
//! - [`FileBackend`]: one file per instance under a directory fan-out,
//!   optionally gzip-compressed
//! - [`FileV2Backend`]: content-addressed files deduplicating identical
//!   payloads server-wide
//! - [`S3Backend`]: S3-compatible object storage
//!
//! Use [`from_config`] to construct the engine the server config asks for.

pub mod backends;
pub mod compress;
pub mod engine;
pub mod error;
pub mod traits;
pub mod transaction;

pub use backends::{DatabaseBackend, FileBackend, FileV2Backend, S3Backend};
pub use engine::AttachmentStore;
pub use error::{StorageError, StorageResult};
pub use traits::{AttachmentBackend, ByteStream};

use coffer_core::AttachmentConfig;
use coffer_metadata::MetadataStore;
use std::sync::Arc;
use uuid::Uuid;

/// Build an [`AttachmentStore`] from a validated backend configuration.
///
/// `server_guid` namespaces this server's holder markers in the
/// content-addressed backend; it must stay stable across restarts.
pub async fn from_config(
    config: &AttachmentConfig,
    meta: Arc<dyn MetadataStore>,
    server_guid: Uuid,
) -> StorageResult<AttachmentStore> {
    config.validate().map_err(StorageError::Config)?;

    let backend: Arc<dyn AttachmentBackend> = match config {
        AttachmentConfig::Database => Arc::new(DatabaseBackend::new(meta.clone())),
        AttachmentConfig::Files {
            path,
            compression_level,
            fsync,
            fanout_l1,
            fanout_l2,
        } => Arc::new(
            FileBackend::new(path, *compression_level, *fsync, *fanout_l1, *fanout_l2).await?,
        ),
        AttachmentConfig::FilesV2 { path } => {
            Arc::new(FileV2Backend::new(path, server_guid).await?)
        }
        AttachmentConfig::S3 {
            bucket,
            endpoint,
            region,
            prefix,
            access_key_id,
            secret_access_key,
            force_path_style,
            compression_level,
        } => Arc::new(
            S3Backend::new(
                bucket,
                endpoint.clone(),
                region.clone(),
                prefix.clone(),
                access_key_id.clone(),
                secret_access_key.clone(),
                *force_path_style,
                *compression_level,
            )
            .await?,
        ),
    };

    Ok(AttachmentStore::new(meta, backend))
}
