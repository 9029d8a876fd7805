//! Integration tests for the storage adapter

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;

use blobstore::{BlobClient, MemoryBlobStore};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use registry_storage::{ArchiveLayout, RegistryStorage, StorageConfig, StorageError};
use secret::Secret;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

fn adapter(layout: ArchiveLayout) -> (Arc<MemoryBlobStore>, RegistryStorage) {
    let client = Arc::new(MemoryBlobStore::new());
    let config = StorageConfig {
        key_prefix: None,
        layout,
    };
    let storage = RegistryStorage::new(client.clone() as Arc<dyn BlobClient>, config);
    (client, storage)
}

fn make_tarball(files: &BTreeMap<&str, &[u8]>) -> Vec<u8> {
    let gz = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(gz);
    for (name, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, std::path::Path::new(name), *data)
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

fn extract_tarball(bytes: &[u8]) -> BTreeMap<String, Vec<u8>> {
    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    let mut files = BTreeMap::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let name = entry.path().unwrap().to_str().unwrap().to_owned();
        let mut data = Vec::new();
        entry.read_to_end(&mut data).unwrap();
        files.insert(name, data);
    }
    files
}

#[tokio::test]
async fn left_pad_manifest_lifecycle() {
    let (_, storage) = adapter(ArchiveLayout::Packed);
    let handler = storage.handler("left-pad").unwrap();
    let manifest = json!({"name": "left-pad", "versions": {}});

    assert!(!handler.has_manifest().await.unwrap());

    handler.create_manifest(&manifest).await.unwrap();
    assert!(handler.has_manifest().await.unwrap());
    assert_eq!(handler.read_manifest().await.unwrap(), manifest);
}

#[tokio::test]
async fn missing_manifest_is_not_found() {
    let (_, storage) = adapter(ArchiveLayout::Packed);
    let handler = storage.handler("never-published").unwrap();

    let err = handler.read_manifest().await.unwrap_err();
    assert!(err.is_not_found(), "expected not-found, got {err}");
}

#[tokio::test]
async fn update_returns_without_persisting() {
    let (_, storage) = adapter(ArchiveLayout::Packed);
    let handler = storage.handler("left-pad").unwrap();
    handler
        .save_manifest(&json!({"name": "left-pad", "versions": {}}))
        .await
        .unwrap();

    let updated = handler
        .update_manifest(|mut manifest| async move {
            manifest["versions"]["1.0.0"] = json!({"dist": {}});
            Ok(manifest)
        })
        .await
        .unwrap();

    // The caller inspects the transformed manifest, then commits.
    assert!(handler.read_manifest().await.unwrap()["versions"]
        .get("1.0.0")
        .is_none());
    handler.save_manifest(&updated).await.unwrap();
    assert_eq!(handler.read_manifest().await.unwrap(), updated);
}

#[tokio::test]
async fn package_index_scenario() {
    let (_, storage) = adapter(ArchiveLayout::Packed);

    assert!(storage.list_package_names().await.unwrap().is_empty());

    storage.add_package_name("a").await.unwrap();
    storage.add_package_name("b").await.unwrap();
    storage.add_package_name("a").await.unwrap();

    assert_eq!(storage.list_package_names().await.unwrap(), vec!["a", "b"]);

    storage.remove_package_name("missing").await.unwrap();
    storage.remove_package_name("a").await.unwrap();
    assert_eq!(storage.list_package_names().await.unwrap(), vec!["b"]);
}

#[tokio::test]
async fn signing_secret_roundtrip() {
    let (client, storage) = adapter(ArchiveLayout::Packed);

    // Absent secret reads as empty, not as an error.
    assert!(storage.get_signing_secret().await.unwrap().is_empty());

    storage
        .set_signing_secret(Secret::from_str("signing-key"))
        .await
        .unwrap();
    assert_eq!(
        storage.get_signing_secret().await.unwrap().revealed(),
        "signing-key"
    );

    // A separate adapter instance sees the persisted secret.
    let other = RegistryStorage::new(client as Arc<dyn BlobClient>, StorageConfig::default());
    assert_eq!(
        other.get_signing_secret().await.unwrap().revealed(),
        "signing-key"
    );
}

#[tokio::test]
async fn unsupported_operations_fail_fast() {
    let (_, storage) = adapter(ArchiveLayout::Packed);

    assert!(matches!(
        storage.search("left").await.unwrap_err(),
        StorageError::Unsupported(_)
    ));
    assert!(matches!(
        storage.save_token(&json!({})).await.unwrap_err(),
        StorageError::Unsupported(_)
    ));
    assert!(matches!(
        storage.read_tokens().await.unwrap_err(),
        StorageError::Unsupported(_)
    ));
}

#[tokio::test]
async fn invalid_names_are_rejected() {
    let (_, storage) = adapter(ArchiveLayout::Packed);

    assert!(storage.handler("..").is_err());
    assert!(storage.handler("").is_err());

    let handler = storage.handler("ok").unwrap();
    let err = handler.delete_file("../escape", false).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidName(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn packed_archive_roundtrip() {
    let (_, storage) = adapter(ArchiveLayout::Packed);
    let handler = storage.handler("left-pad").unwrap();
    let payload = b"opaque compressed archive bytes".repeat(64);

    let mut sink = handler
        .write_archive("left-pad-1.0.0.tgz", CancellationToken::new())
        .await
        .unwrap();
    sink.ready().await.unwrap();
    sink.write_all(&payload).await.unwrap();
    sink.finish().await.unwrap();

    assert!(handler.has_archive("left-pad-1.0.0.tgz").await.unwrap());

    let mut stream = handler
        .read_archive("left-pad-1.0.0.tgz", CancellationToken::new())
        .await
        .unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, payload);

    handler
        .delete_file("left-pad-1.0.0.tgz", false)
        .await
        .unwrap();
    assert!(!handler.has_archive("left-pad-1.0.0.tgz").await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn unpacked_archive_scenario() {
    let (client, storage) = adapter(ArchiveLayout::Unpacked);
    let handler = storage.handler("pkg").unwrap();

    let mut files = BTreeMap::new();
    files.insert("package.json", &b"{\"name\":\"pkg\"}"[..]);
    files.insert("index.js", &b"module.exports = {};\n"[..]);
    let tarball = make_tarball(&files);

    let mut sink = handler
        .write_archive("pkg-1.0.0.tgz", CancellationToken::new())
        .await
        .unwrap();
    sink.ready().await.unwrap();
    sink.write_all(&tarball).await.unwrap();
    sink.finish().await.unwrap();

    // One blob per contained file, under the version-derived prefix.
    let mut keys = client.keys().await;
    keys.sort();
    assert_eq!(keys, vec!["pkg/1.0.0/index.js", "pkg/1.0.0/package.json"]);

    assert!(handler.has_archive("pkg-1.0.0.tgz").await.unwrap());

    // The reconstructed archive extracts to the original file set.
    let mut stream = handler
        .read_archive("pkg-1.0.0.tgz", CancellationToken::new())
        .await
        .unwrap();
    let mut rebuilt = Vec::new();
    stream.read_to_end(&mut rebuilt).await.unwrap();
    let extracted = extract_tarball(&rebuilt);
    assert_eq!(extracted.len(), 2);
    for (name, data) in &files {
        assert_eq!(extracted.get(*name).map(Vec::as_slice), Some(*data));
    }

    // Deletion removes every per-file blob.
    handler.delete_file("pkg-1.0.0.tgz", false).await.unwrap();
    assert!(client.keys().await.is_empty());
    assert!(!handler.has_archive("pkg-1.0.0.tgz").await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_aborts_archive_download() {
    let (client, storage) = adapter(ArchiveLayout::Packed);
    let handler = storage.handler("left-pad").unwrap();
    let payload = vec![42u8; 64 * 1024];

    let mut sink = handler
        .write_archive("left-pad-1.0.0.tgz", CancellationToken::new())
        .await
        .unwrap();
    sink.ready().await.unwrap();
    sink.write_all(&payload).await.unwrap();
    sink.finish().await.unwrap();

    let cancel = CancellationToken::new();
    let mut stream = handler
        .read_archive("left-pad-1.0.0.tgz", cancel.clone())
        .await
        .unwrap();

    let mut buf = [0u8; 1024];
    stream.read(&mut buf).await.unwrap();
    let before = client.stats().aborted();

    cancel.cancel();
    let err = stream.read(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::Interrupted);
    assert_eq!(client.stats().aborted(), before + 1);
}

#[tokio::test]
async fn key_prefix_scopes_all_blobs() {
    let client = Arc::new(MemoryBlobStore::new());
    let config: StorageConfig =
        serde_json::from_str(r#"{"key-prefix": "registry", "layout": "packed"}"#).unwrap();
    let storage = RegistryStorage::new(client.clone() as Arc<dyn BlobClient>, config);

    let handler = storage.handler("left-pad").unwrap();
    handler
        .create_manifest(&json!({"name": "left-pad"}))
        .await
        .unwrap();
    storage.add_package_name("left-pad").await.unwrap();

    let mut keys = client.keys().await;
    keys.sort();
    assert_eq!(
        keys,
        vec!["registry/left-pad/package.json", "registry/packages-list.json"]
    );
}
