//! Identifiers for instances and the objects referencing them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a physical attachment instance.
///
/// Allocated by the metadata store when a property is first saved. Instance
/// bytes are immutable once written; a changed property gets a fresh id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub u64);

impl InstanceId {
    /// Get the raw id.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for InstanceId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Identifier of a hierarchy object (message, folder) owning properties.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HierarchyId(pub u64);

impl fmt::Display for HierarchyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for HierarchyId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Property tag under which an attachment is stored on a hierarchy object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropTag(pub u32);

impl fmt::Display for PropTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

impl From<u32> for PropTag {
    fn from(tag: u32) -> Self {
        Self(tag)
    }
}

/// In-memory handle for one instance as seen by a backend.
///
/// `ident` is backend-specific: `None` for positionally named backends
/// (database, files v1, S3), the two-level hex content ident for the
/// content-addressed v2 backend. It mirrors the `filename` column of the
/// reference row and is never persisted anywhere else.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceRef {
    pub id: InstanceId,
    pub ident: Option<String>,
}

impl InstanceRef {
    /// Create a handle with no backend ident.
    pub fn new(id: InstanceId) -> Self {
        Self { id, ident: None }
    }

    /// Create a handle carrying a backend ident.
    pub fn with_ident(id: InstanceId, ident: impl Into<String>) -> Self {
        Self {
            id,
            ident: Some(ident.into()),
        }
    }
}

impl fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.ident {
            Some(ident) => write!(f, "{} ({ident})", self.id),
            None => write!(f, "{}", self.id),
        }
    }
}
