//! One-way bucket sync within a store.

use std::collections::{BTreeSet, HashMap};

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backup::{BackupEngine, FailedObject, DEFAULT_WORKERS};
use crate::error::BackupError;
use crate::object_store::{ObjectLister, ObjectSummary};

/// Sync settings.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Only sync keys starting with this prefix.
    pub prefix: String,
    /// Delete keys in the destination that the source does not have.
    pub delete_orphans: bool,
    /// Concurrent copies.
    pub workers: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            delete_orphans: false,
            workers: DEFAULT_WORKERS,
        }
    }
}

/// Outcome of a sync.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    /// Source bucket.
    pub source: String,
    /// Destination bucket.
    pub dest: String,
    /// Keys copied.
    pub copied: Vec<String>,
    /// Keys already identical.
    pub skipped: Vec<String>,
    /// Orphans removed from the destination.
    pub deleted: Vec<String>,
    /// Keys that failed.
    pub failed: Vec<FailedObject>,
    /// The run was cancelled.
    pub cancelled: bool,
}

impl SyncReport {
    /// Destination now matches the source.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }
}

enum Copied {
    Copied(String),
    NotStarted,
    Failed(FailedObject),
}

impl BackupEngine {
    /// Copy objects whose ETag differs or that are missing in `dest`.
    pub async fn sync(
        &self,
        source: &str,
        dest: &str,
        options: &SyncOptions,
    ) -> Result<SyncReport, BackupError> {
        self.cancel.check()?;
        let src_objects = self.list_all(source, &options.prefix).await?;
        let dest_objects = self.list_all(dest, &options.prefix).await?;
        let dest_etags: HashMap<&str, Option<&str>> = dest_objects
            .iter()
            .map(|o| (o.key.as_str(), o.etag.as_deref()))
            .collect();

        let mut report = SyncReport {
            source: source.to_string(),
            dest: dest.to_string(),
            ..SyncReport::default()
        };
        let mut to_copy = Vec::new();
        for object in &src_objects {
            match dest_etags.get(object.key.as_str()) {
                Some(Some(etag)) if object.etag.as_deref() == Some(*etag) => {
                    report.skipped.push(object.key.clone())
                }
                _ => to_copy.push(object.key.as_str()),
            }
        }
        info!(
            source,
            dest,
            to_copy = to_copy.len(),
            unchanged = report.skipped.len(),
            "sync planned"
        );

        let copies = stream::iter(to_copy)
            .map(|key| async move {
                if self.cancel.is_cancelled() {
                    return Copied::NotStarted;
                }
                let object = match self
                    .retried("get_object", || self.store.get_object(source, key))
                    .await
                {
                    Ok(object) => object,
                    Err(e) => return Copied::Failed(FailedObject::new(key, &e)),
                };
                match self
                    .retried("put_object", || {
                        self.store.put_object(dest, key, object.clone())
                    })
                    .await
                {
                    Ok(_) => {
                        debug!(key, "copied");
                        Copied::Copied(key.to_string())
                    }
                    Err(e) => Copied::Failed(FailedObject::new(key, &e)),
                }
            })
            .buffer_unordered(options.workers.max(1));
        futures::pin_mut!(copies);
        while let Some(copied) = copies.next().await {
            match copied {
                Copied::Copied(key) => report.copied.push(key),
                Copied::NotStarted => {}
                Copied::Failed(failed) => {
                    warn!(key = %failed.key, error = %failed.error, "copy failed");
                    report.failed.push(failed);
                }
            }
        }
        report.cancelled = self.cancel.is_cancelled();

        if options.delete_orphans && !report.cancelled {
            let keep: BTreeSet<&str> = src_objects.iter().map(|o| o.key.as_str()).collect();
            for orphan in dest_objects.iter().filter(|o| !keep.contains(o.key.as_str())) {
                let key = orphan.key.as_str();
                match self
                    .retried("delete_object", || self.store.delete_object(dest, key))
                    .await
                {
                    Ok(()) => report.deleted.push(key.to_string()),
                    Err(e) => report.failed.push(FailedObject::new(key, &e)),
                }
            }
        }

        info!(
            source,
            dest,
            copied = report.copied.len(),
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "sync finished"
        );
        Ok(report)
    }

    async fn list_all(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectSummary>, BackupError> {
        ObjectLister::new(self.store.clone(), self.retry.clone(), bucket, prefix)
            .collect_all()
            .await
            .map_err(|source| BackupError::Listing {
                bucket: bucket.to_string(),
                source,
            })
    }
}
