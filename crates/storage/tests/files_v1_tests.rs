// v1 file backend: fan-out layout, the compression heuristic, and the
// gzip trailer size shortcut.

mod common;

use bytes::Bytes;
use coffer_core::{InstanceId, InstanceRef, PropTag};
use coffer_storage::backends::FileBackend;
use coffer_storage::traits::AttachmentBackend;
use common::fixtures::{compressible_bytes, seeded_bytes};
use tempfile::TempDir;

const TAG: PropTag = PropTag(0x3701_0102);

async fn backend(dir: &TempDir, level: u32) -> FileBackend {
    FileBackend::new(dir.path().join("attachments"), level, false, 10, 20)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_zero_fanout_rejected() {
    let dir = TempDir::new().unwrap();
    for (l1, l2) in [(0, 20), (10, 0)] {
        let err = FileBackend::new(dir.path().join("attachments"), 0, false, l1, l2)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            coffer_storage::StorageError::InvalidParameter(_)
        ));
    }
}

#[tokio::test]
async fn test_fanout_layout() {
    let dir = TempDir::new().unwrap();
    let backend = backend(&dir, 0).await;

    // id 1234: l1 = 1234 % 10 = 4, l2 = (1234 / 10) % 20 = 3
    backend
        .put(InstanceId(1234), TAG, seeded_bytes(1, 8_192))
        .await
        .unwrap();
    assert!(
        dir.path()
            .join("attachments")
            .join("4")
            .join("3")
            .join("1234")
            .is_file()
    );
}

#[tokio::test]
async fn test_compressible_payload_stored_gzipped() {
    let dir = TempDir::new().unwrap();
    let backend = backend(&dir, 6).await;
    let data = compressible_bytes(50_000);

    backend.put(InstanceId(7), TAG, data.clone()).await.unwrap();

    let path = dir
        .path()
        .join("attachments")
        .join("7")
        .join("0")
        .join("7.gz");
    assert!(path.is_file());
    assert!(
        std::fs::metadata(&path).unwrap().len() < 50_000,
        "gzip must shrink repetitive data"
    );

    let handle = InstanceRef::new(InstanceId(7));
    assert_eq!(backend.get(&handle).await.unwrap(), data);
    // Size reads only the gzip trailer, never inflates.
    assert_eq!(backend.size(&handle).await.unwrap(), 50_000);
}

#[tokio::test]
async fn test_small_payload_never_compressed() {
    let dir = TempDir::new().unwrap();
    let backend = backend(&dir, 6).await;

    // 4 KiB or less is not worth a gzip header.
    backend
        .put(InstanceId(1), TAG, compressible_bytes(4_096))
        .await
        .unwrap();
    assert!(
        dir.path()
            .join("attachments")
            .join("1")
            .join("0")
            .join("1")
            .is_file()
    );
}

#[tokio::test]
async fn test_already_packed_payload_never_compressed() {
    let dir = TempDir::new().unwrap();
    let backend = backend(&dir, 6).await;

    // PNG magic marks the payload as already packed.
    let mut data = vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
    data.extend_from_slice(&compressible_bytes(20_000));
    backend
        .put(InstanceId(2), TAG, Bytes::from(data))
        .await
        .unwrap();
    assert!(
        dir.path()
            .join("attachments")
            .join("2")
            .join("0")
            .join("2")
            .is_file()
    );
}

#[tokio::test]
async fn test_reads_survive_compression_setting_change() {
    let dir = TempDir::new().unwrap();
    let data = compressible_bytes(30_000);

    // Written by a server configured with compression.
    {
        let compressing = backend(&dir, 6).await;
        compressing
            .put(InstanceId(9), TAG, data.clone())
            .await
            .unwrap();
    }

    // Read back after compression was turned off: the .gz variant is
    // found and inflated anyway.
    let plain = backend(&dir, 0).await;
    let handle = InstanceRef::new(InstanceId(9));
    assert_eq!(plain.get(&handle).await.unwrap(), data);
    assert_eq!(plain.size(&handle).await.unwrap(), 30_000);
}

#[tokio::test]
async fn test_put_stream_compresses_like_put() {
    let dir = TempDir::new().unwrap();
    let backend = backend(&dir, 6).await;
    let data = compressible_bytes(40_000);

    let pieces: Vec<_> = data.chunks(1_000).map(Bytes::copy_from_slice).collect();
    let stream = Box::pin(futures::stream::iter(
        pieces
            .into_iter()
            .map(Ok::<_, coffer_storage::StorageError>),
    ));
    let (size, ident) = backend.put_stream(InstanceId(3), TAG, stream).await.unwrap();
    assert_eq!(size, 40_000);
    assert!(ident.is_none());

    assert!(
        dir.path()
            .join("attachments")
            .join("3")
            .join("0")
            .join("3.gz")
            .is_file()
    );
    let handle = InstanceRef::new(InstanceId(3));
    assert_eq!(backend.get(&handle).await.unwrap(), data);
    assert_eq!(backend.size(&handle).await.unwrap(), 40_000);
}

#[tokio::test]
async fn test_delete_removes_file_and_tolerates_absence() {
    let dir = TempDir::new().unwrap();
    let backend = backend(&dir, 0).await;

    backend
        .put(InstanceId(5), TAG, seeded_bytes(2, 10_000))
        .await
        .unwrap();
    let handle = InstanceRef::new(InstanceId(5));
    assert!(backend.exists(&handle).await.unwrap());

    backend.delete(&handle).await.unwrap();
    assert!(!backend.exists(&handle).await.unwrap());

    // Second delete warns and succeeds.
    backend.delete(&handle).await.unwrap();
}

#[tokio::test]
async fn test_fsync_mode_roundtrip() {
    let dir = TempDir::new().unwrap();
    let backend = FileBackend::new(dir.path().join("attachments"), 6, true, 10, 20)
        .await
        .unwrap();
    let data = seeded_bytes(3, 12_000);

    backend.put(InstanceId(11), TAG, data.clone()).await.unwrap();
    assert_eq!(
        backend.get(&InstanceRef::new(InstanceId(11))).await.unwrap(),
        data
    );
}
