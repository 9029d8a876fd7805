//! # Registry storage adapter
//!
//! Maps a package registry's storage contract (manifests, package
//! archives, a registry-wide name index and a signing secret) onto a
//! flat key/blob store with no native directories, transactions or
//! locking.
//!
//! ## Features
//!
//! - Per-key mutual exclusion emulating single-writer semantics
//!   within one process
//! - Packed (one blob) or unpacked (one blob per contained file)
//!   archive layouts, converted via streaming tar/gzip transforms
//! - Lazily cached package index and signing secret
//! - Pluggable blob store backend via the `blobstore` crate
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use blobstore::MemoryBlobStore;
//! use registry_storage::{RegistryStorage, StorageConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Arc::new(MemoryBlobStore::new());
//! let storage = RegistryStorage::new(client, StorageConfig::default());
//!
//! let handler = storage.handler("left-pad")?;
//! handler
//!     .create_manifest(&serde_json::json!({"name": "left-pad", "versions": {}}))
//!     .await?;
//! storage.add_package_name("left-pad").await?;
//! # Ok(())
//! # }
//! ```
//!
//! Locking is process-local and advisory: it serializes logical
//! operations on the same key within one running instance, and
//! provides nothing across instances or processes.

mod adapter;
mod config;
mod error;
mod index;
mod manifest;
mod mutex;
pub mod paths;
mod secrets;
mod tarball;

pub use adapter::{PackageHandler, RegistryStorage};
pub use config::{ArchiveLayout, StorageConfig};
pub use error::{StorageError, StorageResult};
pub use index::PackageIndex;
pub use manifest::ManifestStore;
pub use mutex::KeyedMutex;
pub use secrets::SecretStore;
pub use tarball::{ArchiveSink, ArchiveStore, PackedArchives, UnpackedArchives};
