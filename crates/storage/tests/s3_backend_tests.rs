// S3 backend construction tests. Everything here runs without a network;
// wire-level behavior is covered against MinIO in CI.

use coffer_storage::StorageError;
use coffer_storage::backends::S3Backend;

#[tokio::test]
async fn test_construction_with_static_credentials() {
    S3Backend::new(
        "attachments",
        Some("http://localhost:9000".to_string()),
        Some("us-east-1".to_string()),
        Some("coffer/".to_string()),
        Some("minioadmin".to_string()),
        Some("minioadmin".to_string()),
        true,
        6,
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn test_construction_with_bare_endpoint() {
    // A bare host:port endpoint gets an http:// scheme prepended.
    S3Backend::new(
        "attachments",
        Some("localhost:9000".to_string()),
        None,
        None,
        Some("key".to_string()),
        Some("secret".to_string()),
        true,
        0,
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn test_partial_credentials_rejected() {
    let err = S3Backend::new(
        "attachments",
        None,
        None,
        None,
        Some("key".to_string()),
        None,
        false,
        0,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, StorageError::Config(_)));
}
