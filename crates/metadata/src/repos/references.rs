//! Single-instance reference table repository.

use crate::error::MetadataResult;
use crate::models::ReferenceRow;
use async_trait::async_trait;
use coffer_core::{HierarchyId, InstanceId, PropTag};

/// Repository for the `singleinstances` reference table.
///
/// Reference counting is derived from row counts, never from an explicit
/// counter column: an instance is orphaned iff no row points to it.
#[async_trait]
pub trait ReferenceRepo: Send + Sync {
    /// Look up the reference row for one `(hierarchy, tag)` pair.
    async fn lookup_reference(
        &self,
        hierarchy: HierarchyId,
        tag: PropTag,
    ) -> MetadataResult<Option<ReferenceRow>>;

    /// All reference rows owned by one hierarchy object.
    async fn references_of(&self, hierarchy: HierarchyId) -> MetadataResult<Vec<ReferenceRow>>;

    /// Allocate a fresh instance id and bind it to `(hierarchy, tag)`,
    /// replacing any existing row for that pair.
    async fn allocate_instance(
        &self,
        hierarchy: HierarchyId,
        tag: PropTag,
    ) -> MetadataResult<InstanceId>;

    /// Bind `(hierarchy, tag)` to an already existing instance, replacing
    /// any existing row for that pair. The new row inherits the instance's
    /// backend ident.
    async fn link_instance(
        &self,
        hierarchy: HierarchyId,
        tag: PropTag,
        instance: InstanceId,
    ) -> MetadataResult<()>;

    /// Record the backend ident chosen for an instance into every row
    /// pointing at it.
    async fn set_instance_ident(
        &self,
        instance: InstanceId,
        ident: Option<&str>,
    ) -> MetadataResult<()>;

    /// Duplicate all reference rows from `src` to `dst`. Pure row copy, no
    /// backend I/O; this is the deduplication entry point.
    async fn copy_references(
        &self,
        src: HierarchyId,
        dst: HierarchyId,
    ) -> MetadataResult<u64>;

    /// Remove the reference row for `(hierarchy, tag)`, returning it.
    /// Removing a row that does not exist is a no-op, not an error.
    async fn delete_reference(
        &self,
        hierarchy: HierarchyId,
        tag: PropTag,
    ) -> MetadataResult<Option<ReferenceRow>>;

    /// Remove all reference rows of the given hierarchy objects, returning
    /// the removed rows.
    async fn delete_references(
        &self,
        hierarchies: &[HierarchyId],
    ) -> MetadataResult<Vec<ReferenceRow>>;

    /// Whether any reference row points at the instance.
    async fn instance_exists(&self, instance: InstanceId) -> MetadataResult<bool>;

    /// Whether the instance has zero remaining reference rows.
    async fn is_orphaned(&self, instance: InstanceId) -> MetadataResult<bool> {
        Ok(!self.instance_exists(instance).await?)
    }

    /// Of the candidate set, the instances with zero remaining reference
    /// rows. Must be called after the candidate rows were deleted; a single
    /// round-trip regardless of set size.
    async fn orphaned_instances(
        &self,
        candidates: &[InstanceId],
    ) -> MetadataResult<Vec<InstanceId>>;
}
