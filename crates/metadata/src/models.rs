//! Row types for the metadata tables.

use coffer_core::{HierarchyId, InstanceId, PropTag};
use sqlx::FromRow;

/// One row of the `singleinstances` reference table.
///
/// Associates one object's property with one instance. Many rows may point
/// to the same instance id; a `(hierarchyid, tag)` pair has at most one row.
/// An instance with no remaining rows is orphaned and physically deletable.
#[derive(Clone, Debug, FromRow)]
pub struct ReferenceRow {
    pub instanceid: i64,
    pub hierarchyid: i64,
    pub tag: i64,
    /// Backend-specific ident; the content ident for the v2 file backend,
    /// NULL for positionally named backends.
    pub filename: Option<String>,
}

impl ReferenceRow {
    /// The instance id as a domain type.
    pub fn instance_id(&self) -> InstanceId {
        InstanceId(self.instanceid as u64)
    }

    /// The hierarchy id as a domain type.
    pub fn hierarchy_id(&self) -> HierarchyId {
        HierarchyId(self.hierarchyid as u64)
    }

    /// The property tag as a domain type.
    pub fn prop_tag(&self) -> PropTag {
        PropTag(self.tag as u32)
    }
}
