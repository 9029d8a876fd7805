//! Blob key resolution
//!
//! Pure functions mapping logical (package, file) pairs to object
//! store keys. No state, no I/O.

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::{StorageError, StorageResult};

/// The manifest blob name within a package.
pub const MANIFEST_FILE: &str = "package.json";

/// The registry-wide package name index blob.
pub const INDEX_FILE: &str = "packages-list.json";

/// The registry-wide signing secret blob.
pub const SECRET_FILE: &str = "secret";

/// The archive file extension this registry serves.
pub const TARBALL_EXT: &str = ".tgz";

/// Validate a single path segment of a logical name.
///
/// Rejects anything that could traverse outside the package's key
/// space once concatenated into an object key.
fn validate_segment(segment: &str) -> StorageResult<()> {
    if segment.is_empty() {
        return Err(StorageError::InvalidName("empty name segment".into()));
    }
    if segment == "." || segment == ".." {
        return Err(StorageError::InvalidName(format!(
            "reserved name segment: {segment}"
        )));
    }
    if segment.contains(['\\', '\0']) {
        return Err(StorageError::InvalidName(format!(
            "illegal character in name: {segment:?}"
        )));
    }
    Ok(())
}

/// Validate a package name.
///
/// Scoped names (`@scope/name`) are allowed; each segment is checked
/// individually.
pub fn validate_package(package: &str) -> StorageResult<()> {
    if package.is_empty() {
        return Err(StorageError::InvalidName("empty package name".into()));
    }
    for segment in package.split('/') {
        validate_segment(segment)?;
    }
    Ok(())
}

/// Validate a file name within a package.
///
/// Unlike package names, file names are single segments: an embedded
/// separator would escape the package's key space.
pub fn validate_file(file: &str) -> StorageResult<()> {
    validate_segment(file)?;
    if file.contains('/') {
        return Err(StorageError::InvalidName(format!(
            "file name may not contain '/': {file}"
        )));
    }
    Ok(())
}

/// Validate an archive entry name before it is joined into a key.
///
/// Entry names come from untrusted tarballs. An absolute name would
/// replace the archive's key prefix outright when joined, and `.`/`..`
/// segments would escape it.
pub fn validate_entry(name: &str) -> StorageResult<()> {
    if name.starts_with('/') {
        return Err(StorageError::InvalidName(format!(
            "absolute archive entry name: {name}"
        )));
    }
    for segment in name.split('/') {
        validate_segment(segment)?;
    }
    Ok(())
}

/// Resolve the object key for a file belonging to a package.
pub fn object_key(
    prefix: Option<&Utf8Path>,
    package: &str,
    file: &str,
) -> StorageResult<Utf8PathBuf> {
    validate_package(package)?;
    validate_file(file)?;

    let mut key = prefix.map(Utf8Path::to_path_buf).unwrap_or_default();
    key.push(package);
    key.push(file);
    Ok(key)
}

/// Resolve the key prefix holding all blobs of a package.
pub fn package_prefix(prefix: Option<&Utf8Path>, package: &str) -> StorageResult<Utf8PathBuf> {
    validate_package(package)?;

    let mut key = prefix.map(Utf8Path::to_path_buf).unwrap_or_default();
    key.push(package);
    Ok(key)
}

/// Resolve a registry-scoped key (index, secret).
pub fn registry_key(prefix: Option<&Utf8Path>, file: &str) -> Utf8PathBuf {
    let mut key = prefix.map(Utf8Path::to_path_buf).unwrap_or_default();
    key.push(file);
    key
}

/// Whether a file name follows the tarball naming convention.
pub fn is_tarball(file: &str) -> bool {
    file.ends_with(TARBALL_EXT)
}

/// Extract the version stem identifying an archive.
///
/// Archive names follow `<name>-<version>.tgz`; the version is the
/// segment after the last `-` once the extension is stripped. Returns
/// `None` for names that do not follow the convention. The stem is
/// parsed explicitly rather than by trimming a fixed-length suffix,
/// so extensions of other lengths simply fail to match.
pub fn tarball_version(file: &str) -> Option<&str> {
    let stem = file.strip_suffix(TARBALL_EXT)?;
    let (_, version) = stem.rsplit_once('-')?;
    if version.is_empty() {
        return None;
    }
    Some(version)
}

/// Resolve the per-archive directory key for an unpacked archive.
///
/// Distinct archive names of the same package carry distinct versions,
/// so the derived prefixes cannot collide.
pub fn archive_prefix(
    prefix: Option<&Utf8Path>,
    package: &str,
    file: &str,
) -> StorageResult<Option<Utf8PathBuf>> {
    validate_package(package)?;
    validate_file(file)?;

    let Some(version) = tarball_version(file) else {
        return Ok(None);
    };

    let mut key = prefix.map(Utf8Path::to_path_buf).unwrap_or_default();
    key.push(package);
    key.push(version);
    Ok(Some(key))
}
