//! Storage backend implementations.

pub mod database;
pub mod files;
pub mod files_v2;
pub mod s3;

pub use database::DatabaseBackend;
pub use files::FileBackend;
pub use files_v2::FileV2Backend;
pub use s3::S3Backend;
