//! The attachment store engine.
//!
//! Layers single-instance reference semantics over a raw
//! [`AttachmentBackend`]: payloads are written once, shared by linking and
//! copying reference rows, and physically deleted only when the last row
//! pointing at an instance is gone.

use crate::error::{StorageError, StorageResult};
use crate::traits::{AttachmentBackend, ByteStream};
use bytes::Bytes;
use coffer_core::{HierarchyId, InstanceId, InstanceRef, PropTag};
use coffer_metadata::{MetadataError, MetadataStore, ReferenceRow};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::instrument;

/// Single-instance attachment store.
///
/// All mutations go through the metadata store first; the backend only ever
/// sees instances the reference table already accounts for.
pub struct AttachmentStore {
    meta: Arc<dyn MetadataStore>,
    backend: Arc<dyn AttachmentBackend>,
}

impl std::fmt::Debug for AttachmentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachmentStore")
            .field("backend", &self.backend.backend_name())
            .finish_non_exhaustive()
    }
}

fn instance_ref(row: &ReferenceRow) -> InstanceRef {
    InstanceRef {
        id: row.instance_id(),
        ident: row.filename.clone(),
    }
}

impl AttachmentStore {
    /// Create a store over the given metadata store and backend.
    pub fn new(meta: Arc<dyn MetadataStore>, backend: Arc<dyn AttachmentBackend>) -> Self {
        Self { meta, backend }
    }

    /// Name of the underlying backend, for logging.
    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    /// Resolve the instance a `(hierarchy, tag)` pair references.
    #[instrument(skip(self))]
    pub async fn instance(
        &self,
        hierarchy: HierarchyId,
        tag: PropTag,
    ) -> StorageResult<InstanceRef> {
        match self.meta.lookup_reference(hierarchy, tag).await? {
            Some(row) => Ok(instance_ref(&row)),
            None => Err(StorageError::NotFound(format!("{hierarchy}/{tag}"))),
        }
    }

    /// Whether an attachment is recorded for the `(hierarchy, tag)` pair.
    ///
    /// Consults the reference table only; a reference whose payload was lost
    /// by the backend still reports true.
    #[instrument(skip(self))]
    pub async fn exists(&self, hierarchy: HierarchyId, tag: PropTag) -> StorageResult<bool> {
        Ok(self.meta.lookup_reference(hierarchy, tag).await?.is_some())
    }

    /// Uncompressed payload size, or 0 when no attachment is recorded.
    #[instrument(skip(self))]
    pub async fn size(&self, hierarchy: HierarchyId, tag: PropTag) -> StorageResult<u64> {
        match self.meta.lookup_reference(hierarchy, tag).await? {
            Some(row) => self.backend.size(&instance_ref(&row)).await,
            None => Ok(0),
        }
    }

    /// Load the full payload referenced by `(hierarchy, tag)`.
    #[instrument(skip(self))]
    pub async fn load(&self, hierarchy: HierarchyId, tag: PropTag) -> StorageResult<Bytes> {
        let instance = self.instance(hierarchy, tag).await?;
        self.backend.get(&instance).await
    }

    /// Load the payload referenced by `(hierarchy, tag)` as a stream.
    #[instrument(skip(self))]
    pub async fn load_stream(
        &self,
        hierarchy: HierarchyId,
        tag: PropTag,
    ) -> StorageResult<ByteStream> {
        let instance = self.instance(hierarchy, tag).await?;
        self.backend.get_stream(&instance).await
    }

    /// Save a new payload under `(hierarchy, tag)`.
    ///
    /// Allocates a fresh instance; instances are immutable, so an existing
    /// attachment under the pair is first detached (and its payload removed
    /// if that was the last reference) when `delete_old` is set.
    #[instrument(skip(self, data), fields(size = data.len()))]
    pub async fn save(
        &self,
        hierarchy: HierarchyId,
        tag: PropTag,
        data: Bytes,
        delete_old: bool,
    ) -> StorageResult<InstanceId> {
        if delete_old {
            self.delete(hierarchy, tag).await?;
        }
        let instance = self.meta.allocate_instance(hierarchy, tag).await?;
        let ident = self.backend.put(instance, tag, data).await?;
        if let Some(ident) = ident {
            self.meta.set_instance_ident(instance, Some(&ident)).await?;
        }
        Ok(instance)
    }

    /// Save a new payload under `(hierarchy, tag)` from a stream. Returns
    /// the allocated instance id and the byte count consumed.
    #[instrument(skip(self, stream))]
    pub async fn save_stream(
        &self,
        hierarchy: HierarchyId,
        tag: PropTag,
        stream: ByteStream,
        delete_old: bool,
    ) -> StorageResult<(InstanceId, u64)> {
        if delete_old {
            self.delete(hierarchy, tag).await?;
        }
        let instance = self.meta.allocate_instance(hierarchy, tag).await?;
        let (size, ident) = self.backend.put_stream(instance, tag, stream).await?;
        if let Some(ident) = ident {
            self.meta.set_instance_ident(instance, Some(&ident)).await?;
        }
        Ok((instance, size))
    }

    /// Attach an existing instance to `(hierarchy, tag)`, sharing its
    /// payload. Apart from `delete_old`, no backend I/O; the reference row
    /// count is the only thing that grows.
    ///
    /// With `delete_old`, an attachment already recorded under the pair is
    /// first detached the same way `save` does it, so repointing a property
    /// cannot strand the old instance's payload.
    #[instrument(skip(self))]
    pub async fn link(
        &self,
        hierarchy: HierarchyId,
        tag: PropTag,
        instance: InstanceId,
        delete_old: bool,
    ) -> StorageResult<()> {
        if delete_old {
            self.delete(hierarchy, tag).await?;
        }
        if !self.meta.instance_exists(instance).await? {
            return Err(StorageError::UnableToComplete(format!(
                "cannot link to unknown instance {instance}"
            )));
        }
        self.meta.link_instance(hierarchy, tag, instance).await?;
        Ok(())
    }

    /// Copy all attachments of `src` to `dst` by duplicating reference
    /// rows. Returns the number of attachments copied.
    #[instrument(skip(self))]
    pub async fn copy(&self, src: HierarchyId, dst: HierarchyId) -> StorageResult<u64> {
        Ok(self.meta.copy_references(src, dst).await?)
    }

    /// Detach the attachment under `(hierarchy, tag)`; physically delete
    /// its payload if that was the last reference. Detaching an absent
    /// attachment is a no-op.
    #[instrument(skip(self))]
    pub async fn delete(&self, hierarchy: HierarchyId, tag: PropTag) -> StorageResult<()> {
        let Some(row) = self.meta.delete_reference(hierarchy, tag).await? else {
            return Ok(());
        };
        let instance = instance_ref(&row);
        if self.meta.is_orphaned(instance.id).await? {
            self.backend.delete(&instance).await?;
        }
        Ok(())
    }

    /// Detach all attachments of the given hierarchy objects and physically
    /// delete the instances that became orphaned.
    ///
    /// Reference rows go first, in one database round-trip sequence; backend
    /// deletion is then best-effort per orphan, so one failing payload does
    /// not strand the rest. Returns the number of orphans whose payload was
    /// removed.
    #[instrument(skip(self), fields(count = hierarchies.len()))]
    pub async fn delete_many(&self, hierarchies: &[HierarchyId]) -> StorageResult<u64> {
        let removed = self.meta.delete_references(hierarchies).await?;
        if removed.is_empty() {
            return Ok(0);
        }

        // Carry each instance's ident over from the removed rows; the
        // orphan query only returns bare ids.
        let mut idents: HashMap<InstanceId, Option<String>> = HashMap::new();
        for row in &removed {
            idents.entry(row.instance_id()).or_insert(row.filename.clone());
        }
        let candidates: Vec<InstanceId> = idents.keys().copied().collect();
        let orphans = self.meta.orphaned_instances(&candidates).await?;

        let mut deleted = 0u64;
        let mut failed = 0usize;
        for instance in orphans {
            let handle = InstanceRef {
                id: instance,
                ident: idents.get(&instance).cloned().flatten(),
            };
            match self.backend.delete(&handle).await {
                Ok(()) => deleted += 1,
                Err(e) => {
                    failed += 1;
                    tracing::warn!(%instance, error = %e, "failed to delete orphaned instance");
                }
            }
        }

        if failed > 0 {
            return Err(StorageError::Database(MetadataError::Internal(format!(
                "{failed} orphaned instance(s) could not be deleted"
            ))));
        }
        Ok(deleted)
    }

    /// Open a transaction scope on the backend. Physical destructive
    /// effects are deferred until [`commit`](Self::commit).
    pub async fn begin(&self) -> StorageResult<()> {
        self.backend.begin().await
    }

    /// Make the deferred physical effects of the open transaction permanent.
    pub async fn commit(&self) -> StorageResult<()> {
        self.backend.commit().await
    }

    /// Undo the physical effects of the open transaction.
    pub async fn rollback(&self) -> StorageResult<()> {
        self.backend.rollback().await
    }
}
