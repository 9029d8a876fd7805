//! Adapter configuration

use camino::Utf8PathBuf;
use serde::Deserialize;

/// How package archives are laid out in the blob store.
///
/// The layout is chosen once, at adapter construction, and is global
/// to the adapter instance: archives written by one layout are not
/// readable by an adapter configured with the other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveLayout {
    /// One opaque blob per archive, holding the compressed bytes.
    #[default]
    Packed,

    /// One blob per file contained in the archive, under a key prefix
    /// derived from the archive's version. Allows partial reads and
    /// updates at the cost of non-atomic writes and deletes.
    Unpacked,
}

/// Configuration for a [`RegistryStorage`](crate::RegistryStorage)
/// instance.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StorageConfig {
    /// Key prefix under which all registry blobs are stored.
    #[serde(default)]
    pub key_prefix: Option<Utf8PathBuf>,

    /// Archive representation, fixed for the adapter's lifetime.
    #[serde(default)]
    pub layout: ArchiveLayout,
}
