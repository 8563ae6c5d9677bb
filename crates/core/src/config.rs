//! Backend configuration shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Attachment storage backend configuration.
///
/// Selects one of the four storage strategies at startup. The variant names
/// match the `attachment_storage` values accepted by the server config file.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttachmentConfig {
    /// Blob chunks stored as rows in the `lob` table of the metadata store.
    Database,

    /// One file per instance under a fixed two-level directory fan-out,
    /// optionally gzip-compressed.
    Files {
        /// Root directory for attachment files.
        path: PathBuf,
        /// Gzip level 0-9; 0 disables compression.
        #[serde(default = "default_compression_level")]
        compression_level: u32,
        /// Sync file and parent directory descriptors after each write.
        #[serde(default)]
        fsync: bool,
        /// First-level directory fan-out (`id % l1`).
        #[serde(default = "default_fanout_l1")]
        fanout_l1: u64,
        /// Second-level directory fan-out (`(id / l1) % l2`).
        #[serde(default = "default_fanout_l2")]
        fanout_l2: u64,
    },

    /// Content-addressed layout deduplicating identical bytes server-wide.
    FilesV2 {
        /// Root directory for attachment files.
        path: PathBuf,
    },

    /// S3-compatible object storage.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO, etc.).
        endpoint: Option<String>,
        /// AWS region (defaults to us-east-1 when unset).
        region: Option<String>,
        /// Key prefix within the bucket.
        prefix: Option<String>,
        /// Explicit credentials; both or neither must be set.
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        /// Use path-style URLs instead of virtual-hosted style.
        #[serde(default)]
        force_path_style: bool,
        /// Gzip level 0-9; 0 disables compression.
        #[serde(default = "default_compression_level")]
        compression_level: u32,
    },
}

fn default_compression_level() -> u32 {
    crate::DEFAULT_COMPRESSION_LEVEL
}

fn default_fanout_l1() -> u64 {
    crate::DEFAULT_FANOUT_L1
}

fn default_fanout_l2() -> u64 {
    crate::DEFAULT_FANOUT_L2
}

impl AttachmentConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            AttachmentConfig::Database => Ok(()),
            AttachmentConfig::Files {
                path,
                compression_level,
                fanout_l1,
                fanout_l2,
                ..
            } => {
                if path.as_os_str().is_empty() {
                    return Err("files config requires a non-empty path".to_string());
                }
                if *compression_level > 9 {
                    return Err(format!(
                        "compression_level must be 0-9, got {compression_level}"
                    ));
                }
                if *fanout_l1 == 0 || *fanout_l2 == 0 {
                    return Err("directory fan-out levels must be non-zero".to_string());
                }
                Ok(())
            }
            AttachmentConfig::FilesV2 { path } => {
                if path.as_os_str().is_empty() {
                    return Err("files_v2 config requires a non-empty path".to_string());
                }
                Ok(())
            }
            AttachmentConfig::S3 {
                bucket,
                access_key_id,
                secret_access_key,
                compression_level,
                ..
            } => {
                if bucket.is_empty() {
                    return Err("s3 config requires a bucket name".to_string());
                }
                if access_key_id.is_some() ^ secret_access_key.is_some() {
                    return Err(
                        "s3 config requires both access_key_id and secret_access_key when either is set"
                            .to_string(),
                    );
                }
                if *compression_level > 9 {
                    return Err(format!(
                        "compression_level must be 0-9, got {compression_level}"
                    ));
                }
                Ok(())
            }
        }
    }
}
