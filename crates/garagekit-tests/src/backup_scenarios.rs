//! Backup engine scenarios against the in-memory object store.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::sync::Arc;

use bytes::Bytes;
use garagekit_core::{ErrorClass, RetryConfig, RetryExecutor};
use garagekit_data::archive::{self, member_path, ArchiveWriter, MANIFEST_NAME};
use garagekit_data::object_store::ObjectStore;
use garagekit_data::{
    content_digest, BackupEngine, BackupError, BackupFormat, BackupManifest, ExportOptions,
    ImportOptions, ManifestEntry, MemoryObjectStore, ObjectData, ObjectLister, SyncOptions,
};

use crate::harness::{fast_retry, seeded_store, TestEnv};

fn engine(store: &Arc<MemoryObjectStore>) -> BackupEngine {
    BackupEngine::new(store.clone()).with_retry(fast_retry())
}

fn member_names(path: &std::path::Path) -> Vec<String> {
    let file = File::open(path).unwrap();
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
    archive
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
        .collect()
}

#[tokio::test]
async fn test_round_trip_preserves_bytes_type_and_metadata() {
    let env = TestEnv::new("round_trip");
    let store = seeded_store();
    let engine = engine(&store);

    let export = engine
        .export("src", &env.archive_path(), &ExportOptions::default())
        .await
        .unwrap();
    assert!(export.is_success());

    let import = engine
        .import("dst", &env.archive_path(), &ImportOptions::default())
        .await
        .unwrap();
    assert!(import.is_success());

    for key in ["a/b.txt", "c.bin"] {
        let original = store.object("src", key).unwrap();
        let restored = store.object("dst", key).unwrap();
        assert_eq!(restored.body, original.body, "{key}");
        assert_eq!(restored.content_type, original.content_type, "{key}");
        assert_eq!(restored.metadata, original.metadata, "{key}");
        assert_eq!(
            content_digest(&restored.body),
            content_digest(&original.body)
        );
    }
}

#[tokio::test]
async fn test_directory_round_trip_matches_archive_round_trip() {
    let env = TestEnv::new("directory_round_trip");
    let root = env.tempdir().join("export");
    let store = seeded_store();
    let engine = engine(&store);
    let options = ExportOptions {
        format: BackupFormat::Directory,
        ..ExportOptions::default()
    };

    let export = engine.export("src", &root, &options).await.unwrap();
    assert!(export.is_success());
    let archived = engine
        .export("src", &env.archive_path(), &ExportOptions::default())
        .await
        .unwrap();
    assert_eq!(export.total_size, archived.total_size);

    let manifest = BackupManifest::from_slice(&std::fs::read(root.join(MANIFEST_NAME)).unwrap())
        .unwrap();
    for entry in &manifest.entries {
        let body = std::fs::read(root.join(&entry.path)).unwrap();
        assert_eq!(content_digest(&body), entry.content_digest, "{}", entry.key);
    }

    let import = engine
        .import("dst", &root, &ImportOptions::default())
        .await
        .unwrap();
    assert!(import.is_success());
    for key in ["a/b.txt", "c.bin"] {
        let original = store.object("src", key).unwrap();
        let restored = store.object("dst", key).unwrap();
        assert_eq!(restored.body, original.body, "{key}");
        assert_eq!(restored.metadata, original.metadata, "{key}");
    }
}

#[tokio::test]
async fn test_archive_layout_is_flat_with_manifest_last() {
    let env = TestEnv::new("layout");
    let store = seeded_store();
    engine(&store)
        .export("src", &env.archive_path(), &ExportOptions::default())
        .await
        .unwrap();

    let names = member_names(&env.archive_path());
    assert_eq!(
        names,
        vec!["objects/a%2Fb.txt", "objects/c.bin", MANIFEST_NAME]
    );

    let index = archive::scan(&env.archive_path()).unwrap();
    let manifest = index.manifest;
    assert_eq!(manifest.bucket_name, "src");
    assert_eq!(manifest.object_count, 2);
    assert_eq!(manifest.total_size, 9);
    let entry = manifest.entry("a/b.txt").unwrap();
    assert_eq!(entry.content_digest, content_digest(b"hello"));
    assert_eq!(entry.content_type.as_deref(), Some("text/plain"));
    assert_eq!(
        entry.custom_metadata.get("origin").map(String::as_str),
        Some("harness")
    );
}

fn write_tampered(env: &TestEnv, objects: &[(&str, &[u8])], tamper: impl FnOnce(&mut BackupManifest)) {
    let mut writer = ArchiveWriter::create(&env.archive_path()).unwrap();
    let mut manifest = BackupManifest::new("src");
    for (key, body) in objects {
        writer.append_object(key, body).unwrap();
        manifest.push(ManifestEntry {
            key: key.to_string(),
            path: member_path(key),
            size: body.len() as u64,
            content_digest: content_digest(body),
            content_type: None,
            custom_metadata: BTreeMap::new(),
        });
    }
    tamper(&mut manifest);
    writer.finish_with_manifest(&manifest).unwrap();
}

#[tokio::test]
async fn test_truncated_manifest_aborts_with_zero_puts() {
    let env = TestEnv::new("truncated");
    write_tampered(&env, &[("a", &b"1"[..]), ("b", &b"2"[..])], |m| m.object_count = 3);

    let store = seeded_store();
    let err = engine(&store)
        .import("dst", &env.archive_path(), &ImportOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BackupError::Manifest(_)), "{err}");
    assert_eq!(store.call_count("put_object"), 0);
    assert!(store.keys("dst").is_empty());
}

#[tokio::test]
async fn test_unlisted_member_aborts_with_zero_puts() {
    let env = TestEnv::new("unlisted");
    write_tampered(&env, &[("a", &b"1"[..]), ("b", &b"2"[..])], |m| {
        m.entries.pop();
        m.object_count = 1;
        m.total_size = 1;
    });

    let store = seeded_store();
    let err = engine(&store)
        .import("dst", &env.archive_path(), &ImportOptions::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unexpected archive member"));
    assert_eq!(store.call_count("put_object"), 0);
}

#[tokio::test]
async fn test_archive_without_manifest_is_rejected() {
    let env = TestEnv::new("no_manifest");
    let mut writer = ArchiveWriter::create(&env.archive_path()).unwrap();
    writer.append_object("a", b"1").unwrap();
    writer.abandon().unwrap();

    let store = seeded_store();
    let err = engine(&store)
        .import("dst", &env.archive_path(), &ImportOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BackupError::Manifest(_)));
    assert_eq!(store.call_count("put_object"), 0);
}

#[tokio::test]
async fn test_digest_mismatch_fails_only_that_key() {
    let env = TestEnv::new("digest");
    write_tampered(&env, &[("good", &b"1"[..]), ("bad", &b"2"[..])], |m| {
        m.entries[1].content_digest = content_digest(b"something else");
    });

    let store = seeded_store();
    let report = engine(&store)
        .import("dst", &env.archive_path(), &ImportOptions::default())
        .await
        .unwrap();
    assert_eq!(report.imported, vec!["good".to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].key, "bad");
    assert_eq!(report.failed[0].class, ErrorClass::Fatal);
    assert!(report.failed[0].error.contains("digest mismatch"));
    assert!(store.object("dst", "bad").is_none());
}

#[tokio::test]
async fn test_overwrite_false_skips_existing_keys() {
    let env = TestEnv::new("no_overwrite");
    let store = seeded_store();
    let engine = engine(&store);
    engine
        .export("src", &env.archive_path(), &ExportOptions::default())
        .await
        .unwrap();
    store.insert("dst", "a/b.txt", ObjectData::new("local edit"));

    let options = ImportOptions {
        overwrite: false,
        ..ImportOptions::default()
    };
    let report = engine
        .import("dst", &env.archive_path(), &options)
        .await
        .unwrap();
    assert_eq!(report.skipped, vec!["a/b.txt".to_string()]);
    assert_eq!(report.imported, vec!["c.bin".to_string()]);
    assert_eq!(
        store.object("dst", "a/b.txt").unwrap().body,
        Bytes::from_static(b"local edit")
    );
}

#[tokio::test]
async fn test_mirror_mode_deletes_extra_keys() {
    let env = TestEnv::new("mirror");
    let store = seeded_store();
    let engine = engine(&store);
    engine
        .export("src", &env.archive_path(), &ExportOptions::default())
        .await
        .unwrap();
    store.insert("dst", "extra-1", ObjectData::new("x"));
    store.insert("dst", "extra-2", ObjectData::new("y"));

    let options = ImportOptions {
        mirror: true,
        ..ImportOptions::default()
    };
    let report = engine
        .import("dst", &env.archive_path(), &options)
        .await
        .unwrap();
    assert!(report.is_success());
    assert_eq!(report.deleted, vec!["extra-1".to_string(), "extra-2".to_string()]);
    assert_eq!(store.keys("dst"), store.keys("src"));
}

#[tokio::test]
async fn test_transient_put_failures_are_retried() {
    let env = TestEnv::new("transient_put");
    let store = seeded_store();
    let engine = engine(&store);
    engine
        .export("src", &env.archive_path(), &ExportOptions::default())
        .await
        .unwrap();
    store.inject_key_fault("put_object", "c.bin", ErrorClass::Transient, 2);

    let report = engine
        .import("dst", &env.archive_path(), &ImportOptions::default())
        .await
        .unwrap();
    assert!(report.is_success());
    assert!(store.object("dst", "c.bin").is_some());
}

#[tokio::test]
async fn test_exhausted_put_is_recorded_and_import_continues() {
    let env = TestEnv::new("exhausted_put");
    let store = seeded_store();
    let engine = engine(&store);
    engine
        .export("src", &env.archive_path(), &ExportOptions::default())
        .await
        .unwrap();
    store.inject_key_fault("put_object", "a/b.txt", ErrorClass::Transient, 10);

    let report = engine
        .import("dst", &env.archive_path(), &ImportOptions::default())
        .await
        .unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].class, ErrorClass::Transient);
    assert_eq!(report.imported, vec!["c.bin".to_string()]);
    assert!(!report.stopped_early);
}

#[tokio::test]
async fn test_listing_resumes_from_last_good_cursor() {
    let store = Arc::new(MemoryObjectStore::new());
    for i in 0..10 {
        store.insert("big", &format!("key-{i:02}"), ObjectData::new(vec![i as u8]));
    }
    let retry = RetryExecutor::new(RetryConfig::no_retry());
    let mut lister = ObjectLister::new(store.clone(), retry, "big", "").with_page_size(4);

    let mut seen = Vec::new();
    seen.extend(lister.next_page().await.unwrap().unwrap());
    store.inject_fault("list_page", ErrorClass::Transient, 1);
    assert!(lister.next_page().await.is_err());
    while let Some(page) = lister.next_page().await.unwrap() {
        seen.extend(page);
    }

    let keys: Vec<_> = seen.into_iter().map(|o| o.key).collect();
    let expected: Vec<_> = (0..10).map(|i| format!("key-{i:02}")).collect();
    assert_eq!(keys, expected);
}

#[tokio::test]
async fn test_listing_failure_during_export_writes_no_manifest() {
    let env = TestEnv::new("listing_failure");
    let store = seeded_store();
    store.inject_fault("list_page", ErrorClass::Fatal, 1);

    let err = engine(&store)
        .export("src", &env.archive_path(), &ExportOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BackupError::Listing { .. }));
    assert!(!member_names(&env.archive_path()).contains(&MANIFEST_NAME.to_string()));
}

#[tokio::test]
async fn test_verify_then_sync_repairs_drift() {
    let env = TestEnv::new("verify_sync");
    let store = seeded_store();
    let engine = engine(&store);
    engine
        .export("src", &env.archive_path(), &ExportOptions::default())
        .await
        .unwrap();
    engine
        .sync("src", "dst", &SyncOptions::default())
        .await
        .unwrap();
    assert!(engine.verify("dst", &env.archive_path()).await.unwrap().is_clean());

    store
        .put_object("dst", "c.bin", ObjectData::new("corrupted"))
        .await
        .unwrap();
    let drift = engine.verify("dst", &env.archive_path()).await.unwrap();
    assert_eq!(drift.drifted, vec!["c.bin".to_string()]);

    let sync = engine
        .sync("src", "dst", &SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(sync.copied, vec!["c.bin".to_string()]);
    assert!(engine.verify("dst", &env.archive_path()).await.unwrap().is_clean());
}

#[test]
fn test_manifest_member_is_valid_json() {
    let env = TestEnv::new("manifest_json");
    write_tampered(&env, &[("k", &b"v"[..])], |_| {});
    let file = File::open(env.archive_path()).unwrap();
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
    let mut manifest = String::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        if entry.path().unwrap().to_string_lossy() == MANIFEST_NAME {
            entry.read_to_string(&mut manifest).unwrap();
        }
    }
    let value: serde_json::Value = serde_json::from_str(&manifest).unwrap();
    assert_eq!(value["formatVersion"], 1);
    assert_eq!(value["objectCount"], 1);
    assert_eq!(value["entries"][0]["path"], "objects/k");
}
