//! Core domain types and shared logic for the Coffer attachment store.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Instance, hierarchy and property-tag identifiers
//! - The `InstanceRef` handle tying an instance id to its backend ident
//! - Content hashing for the content-addressed backend
//! - Backend configuration

pub mod config;
pub mod error;
pub mod hash;
pub mod instance;

pub use config::AttachmentConfig;
pub use error::{Error, Result};
pub use hash::{ContentHash, ContentHasher};
pub use instance::{HierarchyId, InstanceId, InstanceRef, PropTag};

/// Default gzip compression level for the v1 file backend.
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// Default first-level directory fan-out for the v1 file backend.
pub const DEFAULT_FANOUT_L1: u64 = 10;

/// Default second-level directory fan-out for the v1 file backend.
pub const DEFAULT_FANOUT_L2: u64 = 20;
