// v2 content-addressed backend: server-wide dedup via holder markers.

mod common;

use coffer_core::{ContentHash, InstanceId, InstanceRef, PropTag};
use coffer_storage::backends::FileV2Backend;
use coffer_storage::traits::AttachmentBackend;
use common::fixtures::seeded_bytes;
use tempfile::TempDir;
use uuid::Uuid;

const TAG: PropTag = PropTag(0x3701_0102);

async fn backend(dir: &TempDir) -> FileV2Backend {
    FileV2Backend::new(dir.path().join("attachments"), Uuid::new_v4())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_ident_is_content_hash() {
    let dir = TempDir::new().unwrap();
    let backend = backend(&dir).await;
    let data = seeded_bytes(1, 50_000);

    let ident = backend
        .put(InstanceId(1), TAG, data.clone())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ident, ContentHash::compute(&data).to_ident());

    let content = dir.path().join("attachments").join(&ident).join("content");
    assert!(content.is_file());
    assert_eq!(std::fs::read(&content).unwrap(), data.as_ref());
}

#[tokio::test]
async fn test_identical_payloads_stored_once() {
    let dir = TempDir::new().unwrap();
    let backend = backend(&dir).await;
    let data = seeded_bytes(2, 30_000);

    let a = backend
        .put(InstanceId(1), TAG, data.clone())
        .await
        .unwrap()
        .unwrap();
    let b = backend
        .put(InstanceId(2), TAG, data.clone())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(a, b);

    // One content file, two holder markers.
    let holder_dir = dir.path().join("attachments").join(&a).join("holder");
    assert_eq!(std::fs::read_dir(&holder_dir).unwrap().count(), 2);

    // Both instances read the shared bytes.
    for id in [InstanceId(1), InstanceId(2)] {
        let handle = InstanceRef::with_ident(id, a.clone());
        assert_eq!(backend.get(&handle).await.unwrap(), data);
    }
}

#[tokio::test]
async fn test_content_survives_until_last_holder_gone() {
    let dir = TempDir::new().unwrap();
    let backend = backend(&dir).await;
    let data = seeded_bytes(3, 10_000);

    let ident = backend
        .put(InstanceId(1), TAG, data.clone())
        .await
        .unwrap()
        .unwrap();
    backend
        .put(InstanceId(2), TAG, data.clone())
        .await
        .unwrap();

    let base_dir = dir.path().join("attachments").join(&ident);

    backend
        .delete(&InstanceRef::with_ident(InstanceId(1), ident.clone()))
        .await
        .unwrap();
    assert!(base_dir.join("content").is_file(), "one holder remains");

    backend
        .delete(&InstanceRef::with_ident(InstanceId(2), ident.clone()))
        .await
        .unwrap();
    assert!(!base_dir.exists(), "last holder gone, content collected");
}

#[tokio::test]
async fn test_put_stream_matches_put_ident() {
    let dir = TempDir::new().unwrap();
    let backend = backend(&dir).await;
    let data = seeded_bytes(4, 200_000);

    let pieces: Vec<_> = data
        .chunks(9_000)
        .map(bytes::Bytes::copy_from_slice)
        .collect();
    let stream = Box::pin(futures::stream::iter(
        pieces
            .into_iter()
            .map(Ok::<_, coffer_storage::StorageError>),
    ));
    let (size, streamed) = backend
        .put_stream(InstanceId(1), TAG, stream)
        .await
        .unwrap();
    assert_eq!(size, 200_000);
    assert_eq!(streamed.unwrap(), ContentHash::compute(&data).to_ident());
}

#[tokio::test]
async fn test_repeated_put_of_same_instance_is_stable() {
    let dir = TempDir::new().unwrap();
    let backend = backend(&dir).await;
    let data = seeded_bytes(5, 20_000);

    let first = backend
        .put(InstanceId(1), TAG, data.clone())
        .await
        .unwrap()
        .unwrap();
    // Same instance, same bytes: the existing marker short-circuits.
    let second = backend
        .put(InstanceId(1), TAG, data.clone())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, second);

    let holder_dir = dir.path().join("attachments").join(&first).join("holder");
    assert_eq!(std::fs::read_dir(&holder_dir).unwrap().count(), 1);
}

#[tokio::test]
async fn test_missing_ident_is_invalid_parameter() {
    let dir = TempDir::new().unwrap();
    let backend = backend(&dir).await;

    let err = backend.get(&InstanceRef::new(InstanceId(1))).await.unwrap_err();
    assert!(matches!(
        err,
        coffer_storage::StorageError::InvalidParameter(_)
    ));
}

#[tokio::test]
async fn test_size_and_exists() {
    let dir = TempDir::new().unwrap();
    let backend = backend(&dir).await;
    let data = seeded_bytes(6, 12_345);

    let ident = backend
        .put(InstanceId(1), TAG, data)
        .await
        .unwrap()
        .unwrap();
    let handle = InstanceRef::with_ident(InstanceId(1), ident.clone());
    assert_eq!(backend.size(&handle).await.unwrap(), 12_345);
    assert!(backend.exists(&handle).await.unwrap());

    backend.delete(&handle).await.unwrap();
    assert!(!backend.exists(&handle).await.unwrap());
}
