//! # Blob store clients
//!
//! The capability consumed by the registry storage adapter: a flat
//! key/blob store with put, get, delete, list-by-prefix and existence
//! checks. Concrete backends (S3-compatible services, local disk)
//! implement [`BlobClient`]; an in-memory implementation is provided
//! for tests.

mod client;
mod error;
mod memory;

pub use client::BlobClient;
pub use client::BlobMetadata;
pub use client::BlobReader;
pub use client::Reader;
pub use error::BlobError;
pub use error::BlobErrorKind;
pub use memory::MemoryBlobStore;
pub use memory::TransferStats;
