//! Test Harness - shared setup for the scenarios

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use garagekit_core::RetryConfig;
use garagekit_data::{MemoryObjectStore, ObjectData};
use garagekit_reconcile::DesiredState;
use tempfile::TempDir;

/// Scratch directory that lives as long as the test.
#[derive(Debug)]
pub struct TestEnv {
    temp_dir: TempDir,
    test_name: String,
}

impl TestEnv {
    pub fn new(test_name: &str) -> Self {
        let temp_dir = tempfile::tempdir().expect("failed to create temp dir");
        Self {
            temp_dir,
            test_name: test_name.to_string(),
        }
    }

    pub fn tempdir(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    /// Archive path named after the test.
    pub fn archive_path(&self) -> PathBuf {
        self.tempdir().join(format!("{}.tar.gz", self.test_name))
    }
}

/// Three attempts with millisecond backoff.
pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        base_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(4),
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

/// Two keys, two buckets, explicit permissions and a quota.
pub fn reference_desired_state() -> DesiredState {
    DesiredState::from_yaml_str(
        r#"
keys:
  - name: app
  - name: backup
    allowCreateBucket: true
buckets:
  - name: media
    keys: [app]
    quota:
      maxSize: 1073741824
  - name: archive
    keys: [backup]
    permissions:
      backup: { read: true, write: true, owner: true }
      app: { read: true }
"#,
    )
    .expect("reference desired state parses")
}

/// A `src` bucket holding a text object with metadata and a binary object,
/// plus an empty `dst` bucket.
pub fn seeded_store() -> Arc<MemoryObjectStore> {
    let store = Arc::new(MemoryObjectStore::new());
    let mut metadata = BTreeMap::new();
    metadata.insert("origin".to_string(), "harness".to_string());
    store.insert(
        "src",
        "a/b.txt",
        ObjectData {
            body: Bytes::from_static(b"hello"),
            content_type: Some("text/plain".to_string()),
            metadata,
            etag: None,
        },
    );
    store.insert("src", "c.bin", ObjectData::new(vec![0u8, 159, 146, 150]));
    store.create_bucket("dst");
    store
}
