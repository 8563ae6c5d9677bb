//! Repository traits over the metadata tables.

pub mod lobs;
pub mod references;

pub use lobs::LobRepo;
pub use references::ReferenceRepo;
