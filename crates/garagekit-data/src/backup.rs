//! Backup engine: bucket export to an archive or a directory, import back,
//! drift check.
//!
//! Object transfers run through a bounded pool of `workers` futures. Export
//! keeps listing order (`buffered`) and hands every object to one blocking
//! writer task; import finishes objects in any order (`buffer_unordered`).
//! Every store call goes through the retry executor, and only transient
//! errors are retried.
//!
//! Objects move as whole bodies. Export holds at most `workers` fetched
//! bodies plus `2 * workers` queued for the writer; import holds
//! `2 * workers` read members plus `workers` in flight. Peak memory is that
//! many times the largest object, and `ExportOptions::max_object_size`
//! refuses objects above a limit instead of reading them.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use garagekit_core::{
    CancelReason, CancelToken, Classify, ErrorClass, RetryConfig, RetryExecutor,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::archive::{self, member_path, ArchiveIndex, ArchiveMember, ArchiveWriter, BackupSink};
use crate::directory::{self, DirectoryWriter};
use crate::error::{BackupError, StoreError, StoreResult};
use crate::manifest::{BackupManifest, ManifestEntry};
use crate::object_store::{
    content_digest, ObjectData, ObjectLister, ObjectStore, ObjectSummary, DEFAULT_PAGE_SIZE,
};

/// Default number of concurrent object transfers.
pub const DEFAULT_WORKERS: usize = 4;

/// An object that could not be transferred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedObject {
    /// Object key.
    pub key: String,
    /// Class of the last error.
    pub class: ErrorClass,
    /// Last error seen.
    pub error: String,
}

impl FailedObject {
    pub(crate) fn new(key: impl Into<String>, err: &StoreError) -> Self {
        Self {
            key: key.into(),
            class: err.class(),
            error: err.to_string(),
        }
    }
}

/// Container a backup is written to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackupFormat {
    /// One `.tar.gz` file.
    #[default]
    Archive,
    /// A directory with `objects/` and `manifest.json`.
    Directory,
}

impl BackupFormat {
    /// Format of an existing backup: directories are directory exports,
    /// anything else is read as an archive.
    pub fn detect(path: &Path) -> Self {
        if path.is_dir() {
            BackupFormat::Directory
        } else {
            BackupFormat::Archive
        }
    }
}

/// Progress of an export or import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Objects finished, successfully or not.
    pub done: u64,
    /// Objects expected, when known up front.
    pub total: Option<u64>,
}

/// Called after every finished object.
pub type ProgressFn = Arc<dyn Fn(Progress) + Send + Sync>;

/// Export settings.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// Only export keys starting with this prefix.
    pub prefix: String,
    /// Concurrent object reads.
    pub workers: usize,
    /// Keys requested per listing page.
    pub page_size: usize,
    /// Container to write.
    pub format: BackupFormat,
    /// Objects listed larger than this are recorded as failed, not read.
    pub max_object_size: Option<u64>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            workers: DEFAULT_WORKERS,
            page_size: DEFAULT_PAGE_SIZE,
            format: BackupFormat::Archive,
            max_object_size: None,
        }
    }
}

/// Outcome of an export.
#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    /// Source bucket.
    pub bucket: String,
    /// Archive path.
    pub archive: String,
    /// Objects written to the archive.
    pub exported: u64,
    /// Bytes written to the archive, before compression.
    pub total_size: u64,
    /// Objects that could not be read.
    pub failed: Vec<FailedObject>,
    /// The run was cancelled; the archive has no manifest.
    pub cancelled: bool,
    /// The manifest was written and the archive is complete.
    pub manifest_written: bool,
}

impl ExportReport {
    /// Complete archive with every object in it.
    pub fn is_success(&self) -> bool {
        self.manifest_written && self.failed.is_empty() && !self.cancelled
    }
}

/// Import settings.
#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Replace objects that already exist. When false, existing keys are
    /// skipped.
    pub overwrite: bool,
    /// Stop scheduling new objects after the first failure.
    pub stop_on_error: bool,
    /// Delete objects in the bucket that the manifest does not list.
    pub mirror: bool,
    /// Concurrent object writes.
    pub workers: usize,
    /// Prepended to every archived key. Mirror mode only deletes under it.
    pub key_prefix: String,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            overwrite: true,
            stop_on_error: false,
            mirror: false,
            workers: DEFAULT_WORKERS,
            key_prefix: String::new(),
        }
    }
}

/// Outcome of an import.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    /// Target bucket.
    pub bucket: String,
    /// Archive path.
    pub archive: String,
    /// Keys written.
    pub imported: Vec<String>,
    /// Keys left alone because they already existed.
    pub skipped: Vec<String>,
    /// Keys that failed.
    pub failed: Vec<FailedObject>,
    /// Keys removed in mirror mode.
    pub deleted: Vec<String>,
    /// Keys never attempted because the run was cancelled or stopped.
    pub abandoned: Vec<String>,
    /// The run was cancelled.
    pub cancelled: bool,
    /// The run stopped after the first failure.
    pub stopped_early: bool,
}

impl ImportReport {
    /// Every archived object is in the bucket.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && !self.cancelled && !self.stopped_early
    }
}

/// Archive contents compared with a live bucket.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DriftReport {
    /// Bucket checked.
    pub bucket: String,
    /// Keys whose content matches the archive.
    pub matching: Vec<String>,
    /// Keys whose content differs.
    pub drifted: Vec<String>,
    /// Keys absent from the bucket.
    pub missing: Vec<String>,
    /// Keys that could not be read.
    pub failed: Vec<FailedObject>,
}

impl DriftReport {
    /// No drift and nothing missing.
    pub fn is_clean(&self) -> bool {
        self.drifted.is_empty() && self.missing.is_empty() && self.failed.is_empty()
    }
}

enum WriterMsg {
    Object { entry: ManifestEntry, body: Bytes },
    Finish,
}

enum Fetched {
    Object(ObjectSummary, StoreResult<ObjectData>),
    TooLarge(ObjectSummary, u64),
    Skipped,
    ListingFailed(StoreError),
}

enum Restored {
    Imported(String),
    Skipped(String),
    Failed(FailedObject),
    // key is unknown when the member itself could not be read
    NotStarted(Option<String>),
    Unreadable(BackupError),
}

/// Export, import and verify over one object store.
#[derive(Clone)]
pub struct BackupEngine {
    pub(crate) store: Arc<dyn ObjectStore>,
    pub(crate) retry: RetryExecutor,
    pub(crate) cancel: CancelToken,
    progress: Option<ProgressFn>,
}

impl BackupEngine {
    /// Engine with the default retry policy and no cancellation.
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            retry: RetryExecutor::new(RetryConfig::default()),
            cancel: CancelToken::never(),
            progress: None,
        }
    }

    /// Use this retry policy for every store call.
    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = RetryExecutor::new(config);
        self
    }

    /// Stop at the next object boundary once `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Report progress to `progress` after every object.
    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    fn report_progress(&self, done: u64, total: Option<u64>) {
        if let Some(progress) = &self.progress {
            progress(Progress { done, total });
        }
    }

    pub(crate) async fn retried<T, F, Fut>(&self, what: &str, call: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        self.retry.execute(what, call).await.into_result()
    }

    /// Stream every object under `options.prefix` into a new archive or
    /// directory, per `options.format`.
    ///
    /// Objects that cannot be read are reported and skipped. A listing
    /// failure aborts the export; a cancelled export leaves a backup with
    /// no manifest.
    pub async fn export(
        &self,
        bucket: &str,
        dest: &Path,
        options: &ExportOptions,
    ) -> Result<ExportReport, BackupError> {
        self.cancel.check()?;
        match options.format {
            BackupFormat::Archive => {
                let sink = ArchiveWriter::create(dest)?;
                self.export_into(bucket, dest, sink, options).await
            }
            BackupFormat::Directory => {
                let sink = DirectoryWriter::create(dest)?;
                self.export_into(bucket, dest, sink, options).await
            }
        }
    }

    async fn export_into<S: BackupSink>(
        &self,
        bucket: &str,
        dest: &Path,
        sink: S,
        options: &ExportOptions,
    ) -> Result<ExportReport, BackupError> {
        info!(bucket, dest = %dest.display(), format = ?options.format, "export started");

        let workers = options.workers.max(1);
        let (tx, rx) = mpsc::channel::<WriterMsg>(workers * 2);
        let manifest = BackupManifest::new(bucket);
        let writer_task = tokio::task::spawn_blocking(move || write_backup(sink, rx, manifest));

        let lister = ObjectLister::new(
            self.store.clone(),
            self.retry.clone(),
            bucket,
            options.prefix.clone(),
        )
        .with_page_size(options.page_size);
        let listing = stream::try_unfold(lister, |mut lister| async move {
            let page = lister.next_page().await?;
            Ok::<_, StoreError>(page.map(|page| (page, lister)))
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok::<_, StoreError>)))
        .try_flatten();

        let fetches = listing
            .map(|item| async move {
                match item {
                    Ok(_) if self.cancel.is_cancelled() => Fetched::Skipped,
                    Ok(summary) => match options.max_object_size {
                        Some(max) if summary.size > max => Fetched::TooLarge(summary, max),
                        _ => {
                            let result = self
                                .retried("get_object", || self.store.get_object(bucket, &summary.key))
                                .await;
                            Fetched::Object(summary, result)
                        }
                    },
                    Err(e) => Fetched::ListingFailed(e),
                }
            })
            .buffered(workers);
        futures::pin_mut!(fetches);

        let mut report = ExportReport {
            bucket: bucket.to_string(),
            archive: dest.display().to_string(),
            exported: 0,
            total_size: 0,
            failed: Vec::new(),
            cancelled: false,
            manifest_written: false,
        };
        let mut listing_error = None;
        let mut writer_gone = false;

        while let Some(fetched) = fetches.next().await {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            match fetched {
                Fetched::Object(summary, Ok(object)) => {
                    let entry = ManifestEntry {
                        path: member_path(&summary.key),
                        size: object.body.len() as u64,
                        content_digest: content_digest(&object.body),
                        content_type: object.content_type,
                        custom_metadata: object.metadata,
                        key: summary.key,
                    };
                    debug!(key = %entry.key, size = entry.size, "archiving object");
                    report.exported += 1;
                    report.total_size += entry.size;
                    let msg = WriterMsg::Object {
                        entry,
                        body: object.body,
                    };
                    if tx.send(msg).await.is_err() {
                        writer_gone = true;
                        break;
                    }
                }
                Fetched::Object(summary, Err(e)) => {
                    warn!(key = %summary.key, error = %e, "object not exported");
                    report.failed.push(FailedObject::new(summary.key, &e));
                }
                Fetched::TooLarge(summary, max) => {
                    warn!(key = %summary.key, size = summary.size, max, "object too large, not exported");
                    report.failed.push(FailedObject {
                        error: format!("{} bytes exceeds the {max} byte limit", summary.size),
                        key: summary.key,
                        class: ErrorClass::Fatal,
                    });
                }
                Fetched::Skipped => continue,
                Fetched::ListingFailed(e) => {
                    error!(bucket, error = %e, "listing failed, export aborted");
                    listing_error = Some(e);
                    break;
                }
            }
            self.report_progress(report.exported + report.failed.len() as u64, None);
        }
        report.cancelled |= self.cancel.is_cancelled();

        if !writer_gone && listing_error.is_none() && !report.cancelled {
            // a send error here surfaces through the writer's result below
            let _ = tx.send(WriterMsg::Finish).await;
        }
        drop(tx);
        report.manifest_written = writer_task
            .await
            .map_err(|e| BackupError::Task(e.to_string()))??;

        if let Some(source) = listing_error {
            return Err(BackupError::Listing {
                bucket: bucket.to_string(),
                source,
            });
        }
        if report.cancelled {
            warn!(bucket, exported = report.exported, "export cancelled, manifest not written");
        } else {
            info!(
                bucket,
                exported = report.exported,
                failed = report.failed.len(),
                total_size = report.total_size,
                "export finished"
            );
        }
        Ok(report)
    }

    /// Restore an archive or directory export into `bucket`.
    ///
    /// The manifest is read and checked against the backup before any
    /// object is written; a mismatch aborts with nothing written.
    pub async fn import(
        &self,
        bucket: &str,
        source: &Path,
        options: &ImportOptions,
    ) -> Result<ImportReport, BackupError> {
        self.cancel.check()?;
        let format = BackupFormat::detect(source);
        let index = scan_blocking(source, format).await?;
        index.manifest.validate_against(&index.members)?;
        let manifest = index.manifest;
        info!(
            bucket,
            source = %source.display(),
            format = ?format,
            objects = manifest.object_count,
            "import started"
        );

        let entries: HashMap<&str, &ManifestEntry> = manifest
            .entries
            .iter()
            .map(|e| (e.path.as_str(), e))
            .collect();
        let (run, stop) = self.cancel.child();
        let workers = options.workers.max(1);
        let (rx, reader) = match format {
            BackupFormat::Archive => archive::spawn_reader(source.to_path_buf(), workers * 2),
            BackupFormat::Directory => directory::spawn_reader(
                source.to_path_buf(),
                manifest.entries.iter().map(|e| e.path.clone()).collect(),
                workers * 2,
            ),
        };
        let members = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|member| (member, rx))
        });

        let restores = members
            .map(|member| {
                let run = &run;
                let entries = &entries;
                async move {
                    let member = match member {
                        Ok(member) => member,
                        Err(_) if run.is_cancelled() => return Restored::NotStarted(None),
                        Err(e) => return Restored::Unreadable(e),
                    };
                    match entries.get(member.path.as_str()) {
                        Some(entry) if run.is_cancelled() => {
                            Restored::NotStarted(Some(format!("{}{}", options.key_prefix, entry.key)))
                        }
                        Some(entry) => self.restore(bucket, entry, member, options).await,
                        None => Restored::Unreadable(BackupError::Manifest(format!(
                            "member {:?} not in manifest",
                            member.path
                        ))),
                    }
                }
            })
            .buffer_unordered(workers);
        futures::pin_mut!(restores);

        let mut report = ImportReport {
            bucket: bucket.to_string(),
            archive: source.display().to_string(),
            ..ImportReport::default()
        };
        let mut unreadable = None;
        let mut done = 0u64;
        let total = Some(manifest.object_count);

        while let Some(restored) = restores.next().await {
            if !matches!(restored, Restored::NotStarted(_) | Restored::Unreadable(_)) {
                done += 1;
                self.report_progress(done, total);
            }
            match restored {
                Restored::Imported(key) => report.imported.push(key),
                Restored::Skipped(key) => report.skipped.push(key),
                Restored::Failed(failed) => {
                    warn!(key = %failed.key, error = %failed.error, "object not imported");
                    report.failed.push(failed);
                    if options.stop_on_error && !report.stopped_early {
                        report.stopped_early = true;
                        stop.cancel(CancelReason::StopOnError);
                    }
                }
                Restored::NotStarted(Some(key)) => report.abandoned.push(key),
                Restored::NotStarted(None) => {}
                Restored::Unreadable(e) => {
                    stop.cancel(CancelReason::StopOnError);
                    unreadable = Some(e);
                }
            }
        }
        drop(restores);
        reader
            .await
            .map_err(|e| BackupError::Task(e.to_string()))?;
        if let Some(e) = unreadable {
            error!(bucket, error = %e, "archive became unreadable mid-import");
            return Err(e);
        }
        report.cancelled = self.cancel.is_cancelled();

        if options.mirror && !report.cancelled && !report.stopped_early {
            let keep: BTreeSet<String> = manifest
                .entries
                .iter()
                .map(|e| format!("{}{}", options.key_prefix, e.key))
                .collect();
            self.delete_extras(bucket, &options.key_prefix, &keep, &mut report)
                .await?;
        }

        info!(
            bucket,
            imported = report.imported.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            deleted = report.deleted.len(),
            abandoned = report.abandoned.len(),
            cancelled = report.cancelled,
            "import finished"
        );
        Ok(report)
    }

    async fn restore(
        &self,
        bucket: &str,
        entry: &ManifestEntry,
        member: ArchiveMember,
        options: &ImportOptions,
    ) -> Restored {
        let key = format!("{}{}", options.key_prefix, entry.key);
        let key = key.as_str();
        let digest = content_digest(&member.data);
        if digest != entry.content_digest {
            return Restored::Failed(FailedObject {
                key: key.to_string(),
                class: ErrorClass::Fatal,
                error: format!(
                    "digest mismatch: manifest has {}, archive content is {digest}",
                    entry.content_digest
                ),
            });
        }

        if !options.overwrite {
            match self
                .retried("head_object", || self.store.head_object(bucket, key))
                .await
            {
                Ok(Some(_)) => {
                    debug!(key, "exists, skipped");
                    return Restored::Skipped(key.to_string());
                }
                Ok(None) => {}
                Err(e) => return Restored::Failed(FailedObject::new(key, &e)),
            }
        }

        let object = ObjectData {
            body: Bytes::from(member.data),
            content_type: entry.content_type.clone(),
            metadata: entry.custom_metadata.clone(),
            etag: None,
        };
        match self
            .retried("put_object", || {
                self.store.put_object(bucket, key, object.clone())
            })
            .await
        {
            Ok(_) => {
                debug!(key, size = entry.size, "imported");
                Restored::Imported(key.to_string())
            }
            Err(e) => Restored::Failed(FailedObject::new(key, &e)),
        }
    }

    async fn delete_extras(
        &self,
        bucket: &str,
        prefix: &str,
        keep: &BTreeSet<String>,
        report: &mut ImportReport,
    ) -> Result<(), BackupError> {
        let existing = ObjectLister::new(self.store.clone(), self.retry.clone(), bucket, prefix)
            .collect_all()
            .await
            .map_err(|source| BackupError::Listing {
                bucket: bucket.to_string(),
                source,
            })?;
        for summary in existing {
            if keep.contains(&summary.key) {
                continue;
            }
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let key = summary.key;
            match self
                .retried("delete_object", || self.store.delete_object(bucket, &key))
                .await
            {
                Ok(()) => {
                    info!(bucket, key = %key, "deleted object not in archive");
                    report.deleted.push(key);
                }
                Err(e) => report.failed.push(FailedObject::new(key, &e)),
            }
        }
        Ok(())
    }

    /// Compare backed-up content digests with what is in the bucket now.
    pub async fn verify(&self, bucket: &str, source: &Path) -> Result<DriftReport, BackupError> {
        let index = scan_blocking(source, BackupFormat::detect(source)).await?;
        index.manifest.validate_against(&index.members)?;
        let mut report = DriftReport {
            bucket: bucket.to_string(),
            ..DriftReport::default()
        };
        for entry in &index.manifest.entries {
            self.cancel.check()?;
            let key = entry.key.as_str();
            match self
                .retried("get_object", || self.store.get_object(bucket, key))
                .await
            {
                Ok(object) if content_digest(&object.body) == entry.content_digest => {
                    report.matching.push(key.to_string())
                }
                Ok(_) => report.drifted.push(key.to_string()),
                Err(e) if e.is_not_found() => report.missing.push(key.to_string()),
                Err(e) => report.failed.push(FailedObject::new(key, &e)),
            }
        }
        info!(
            bucket,
            matching = report.matching.len(),
            drifted = report.drifted.len(),
            missing = report.missing.len(),
            "verify finished"
        );
        Ok(report)
    }
}

async fn scan_blocking(path: &Path, format: BackupFormat) -> Result<ArchiveIndex, BackupError> {
    let path: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || match format {
        BackupFormat::Archive => archive::scan(&path),
        BackupFormat::Directory => directory::scan(&path),
    })
    .await
    .map_err(|e| BackupError::Task(e.to_string()))?
}

fn write_backup<S: BackupSink>(
    mut sink: S,
    mut rx: mpsc::Receiver<WriterMsg>,
    mut manifest: BackupManifest,
) -> Result<bool, BackupError> {
    while let Some(msg) = rx.blocking_recv() {
        match msg {
            WriterMsg::Object { entry, body } => {
                sink.put(&entry.key, &body)
                    .map_err(|e| BackupError::Archive(format!("{}: {e}", entry.key)))?;
                manifest.push(entry);
            }
            WriterMsg::Finish => {
                sink.seal(&manifest)?;
                return Ok(true);
            }
        }
    }
    sink.discard()?;
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryObjectStore;
    use garagekit_core::new_cancel_pair;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tempfile::TempDir;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            jitter: false,
            ..RetryConfig::default()
        }
    }

    fn seeded() -> Arc<MemoryObjectStore> {
        let store = Arc::new(MemoryObjectStore::new());
        let mut metadata = BTreeMap::new();
        metadata.insert("owner".to_string(), "ops".to_string());
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
        store.insert("src", "c.bin", ObjectData::new(vec![0u8, 1, 2, 255]));
        store.create_bucket("dst");
        store
    }

    fn engine(store: &Arc<MemoryObjectStore>) -> BackupEngine {
        BackupEngine::new(store.clone()).with_retry(fast_retry())
    }

    #[tokio::test]
    async fn test_export_then_import_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("src.tar.gz");
        let store = seeded();
        let engine = engine(&store);

        let export = engine
            .export("src", &path, &ExportOptions::default())
            .await
            .unwrap();
        assert!(export.is_success());
        assert_eq!(export.exported, 2);
        assert_eq!(export.total_size, 9);

        let import = engine
            .import("dst", &path, &ImportOptions::default())
            .await
            .unwrap();
        assert!(import.is_success());
        assert_eq!(import.imported.len(), 2);

        let restored = store.object("dst", "a/b.txt").unwrap();
        assert_eq!(restored.body, Bytes::from_static(b"hello"));
        assert_eq!(restored.content_type.as_deref(), Some("text/plain"));
        assert_eq!(restored.metadata.get("owner").map(String::as_str), Some("ops"));
        assert_eq!(
            store.object("dst", "c.bin").unwrap().body,
            Bytes::from(vec![0u8, 1, 2, 255])
        );
    }

    #[tokio::test]
    async fn test_export_records_unreadable_object_and_continues() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("src.tar.gz");
        let store = seeded();
        store.inject_key_fault("get_object", "c.bin", ErrorClass::Fatal, 1);

        let report = engine(&store)
            .export("src", &path, &ExportOptions::default())
            .await
            .unwrap();
        assert!(report.manifest_written);
        assert_eq!(report.exported, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].key, "c.bin");
        assert!(!report.is_success());

        let index = archive::scan(&path).unwrap();
        assert_eq!(index.manifest.object_count, 1);
    }

    #[tokio::test]
    async fn test_export_retries_transient_reads() {
        let dir = TempDir::new().unwrap();
        let store = seeded();
        store.inject_key_fault("get_object", "c.bin", ErrorClass::Transient, 2);
        let report = engine(&store)
            .export("src", &dir.path().join("a.tar.gz"), &ExportOptions::default())
            .await
            .unwrap();
        assert!(report.is_success());
        assert_eq!(report.exported, 2);
    }

    #[tokio::test]
    async fn test_export_listing_failure_aborts_without_manifest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("src.tar.gz");
        let store = seeded();
        store.inject_fault("list_page", ErrorClass::Transient, 10);

        let err = engine(&store)
            .export("src", &path, &ExportOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Listing { .. }));
        assert!(archive::scan(&path).is_err());
    }

    #[tokio::test]
    async fn test_export_to_unwritable_destination_fails_first() {
        let store = seeded();
        let err = engine(&store)
            .export(
                "src",
                Path::new("/nonexistent-dir/deeper/out.tar.gz"),
                &ExportOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Io { .. }));
        assert_eq!(store.call_count("list_page"), 0);
    }

    #[tokio::test]
    async fn test_export_prefix_filter() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.tar.gz");
        let store = seeded();
        let options = ExportOptions {
            prefix: "a/".to_string(),
            ..ExportOptions::default()
        };
        let report = engine(&store).export("src", &path, &options).await.unwrap();
        assert_eq!(report.exported, 1);
        let index = archive::scan(&path).unwrap();
        assert_eq!(index.manifest.entries[0].key, "a/b.txt");
    }

    #[tokio::test]
    async fn test_cancelled_export_has_no_manifest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("src.tar.gz");
        let store = seeded();
        let (token, handle) = new_cancel_pair();
        let engine = engine(&store).with_cancel(token);
        handle.cancel(CancelReason::Interrupted);

        let err = engine
            .export("src", &path, &ExportOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Cancelled(_)));
        assert_eq!(store.call_count("get_object"), 0);
    }

    /// Fires a cancel handle on the first `on` call ("get_object" or
    /// "put_object").
    struct CancelOnCall {
        inner: Arc<MemoryObjectStore>,
        handle: garagekit_core::CancelHandle,
        on: &'static str,
    }

    impl CancelOnCall {
        fn fire(&self, op: &str) {
            if op == self.on {
                self.handle.cancel(CancelReason::Interrupted);
            }
        }
    }

    #[async_trait::async_trait]
    impl ObjectStore for CancelOnCall {
        async fn list_buckets(&self) -> StoreResult<Vec<String>> {
            self.inner.list_buckets().await
        }
        async fn bucket_exists(&self, bucket: &str) -> StoreResult<bool> {
            self.inner.bucket_exists(bucket).await
        }
        async fn list_page(
            &self,
            bucket: &str,
            prefix: &str,
            cursor: Option<&str>,
            max_keys: usize,
        ) -> StoreResult<crate::object_store::ListPage> {
            self.inner.list_page(bucket, prefix, cursor, max_keys).await
        }
        async fn get_object(&self, bucket: &str, key: &str) -> StoreResult<ObjectData> {
            self.fire("get_object");
            self.inner.get_object(bucket, key).await
        }
        async fn put_object(
            &self,
            bucket: &str,
            key: &str,
            object: ObjectData,
        ) -> StoreResult<Option<String>> {
            self.fire("put_object");
            self.inner.put_object(bucket, key, object).await
        }
        async fn head_object(
            &self,
            bucket: &str,
            key: &str,
        ) -> StoreResult<Option<crate::object_store::ObjectHead>> {
            self.inner.head_object(bucket, key).await
        }
        async fn delete_object(&self, bucket: &str, key: &str) -> StoreResult<()> {
            self.inner.delete_object(bucket, key).await
        }
    }

    #[tokio::test]
    async fn test_export_cancelled_mid_run_leaves_no_manifest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("src.tar.gz");
        let (token, handle) = new_cancel_pair();
        let store = Arc::new(CancelOnCall {
            inner: seeded(),
            handle,
            on: "get_object",
        });
        let engine = BackupEngine::new(store)
            .with_retry(fast_retry())
            .with_cancel(token);
        let options = ExportOptions {
            workers: 1,
            ..ExportOptions::default()
        };

        let report = engine.export("src", &path, &options).await.unwrap();
        assert!(report.cancelled);
        assert!(!report.manifest_written);
        assert!(!report.is_success());
        let err = archive::scan(&path).unwrap_err();
        assert!(err.to_string().contains("incomplete"));
    }

    #[tokio::test]
    async fn test_import_cancelled_on_first_put_lists_abandoned_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("src.tar.gz");
        let inner = seeded();
        inner.insert("src", "d.txt", ObjectData::new("more"));
        engine(&inner)
            .export("src", &path, &ExportOptions::default())
            .await
            .unwrap();

        let (token, handle) = new_cancel_pair();
        let store = Arc::new(CancelOnCall {
            inner: inner.clone(),
            handle,
            on: "put_object",
        });
        let engine = BackupEngine::new(store)
            .with_retry(fast_retry())
            .with_cancel(token);
        let options = ImportOptions {
            workers: 1,
            ..ImportOptions::default()
        };

        let report = engine.import("dst", &path, &options).await.unwrap();
        assert!(report.cancelled);
        assert!(!report.is_success());
        // the put that fired the cancel still completes
        assert_eq!(report.imported, vec!["a/b.txt".to_string()]);
        let mut abandoned = report.abandoned.clone();
        abandoned.sort();
        assert_eq!(abandoned, vec!["c.bin".to_string(), "d.txt".to_string()]);
        assert_eq!(inner.keys("dst"), vec!["a/b.txt"]);
    }

    #[tokio::test]
    async fn test_import_rejects_tampered_manifest_before_writing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.tar.gz");
        let mut writer = ArchiveWriter::create(&path).unwrap();
        writer.append_object("a", b"1").unwrap();
        writer.append_object("b", b"2").unwrap();
        let mut manifest = BackupManifest::new("src");
        for (key, body) in [("a", b"1"), ("b", b"2")] {
            manifest.push(ManifestEntry {
                key: key.to_string(),
                path: member_path(key),
                size: 1,
                content_digest: content_digest(body),
                content_type: None,
                custom_metadata: BTreeMap::new(),
            });
        }
        manifest.object_count = 3;
        writer.finish_with_manifest(&manifest).unwrap();

        let store = seeded();
        let err = engine(&store)
            .import("dst", &path, &ImportOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Manifest(_)));
        assert_eq!(store.call_count("put_object"), 0);
    }

    #[tokio::test]
    async fn test_import_without_overwrite_skips_existing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("src.tar.gz");
        let store = seeded();
        let engine = engine(&store);
        engine
            .export("src", &path, &ExportOptions::default())
            .await
            .unwrap();
        store.insert("dst", "c.bin", ObjectData::new("newer"));

        let options = ImportOptions {
            overwrite: false,
            ..ImportOptions::default()
        };
        let report = engine.import("dst", &path, &options).await.unwrap();
        assert_eq!(report.imported, vec!["a/b.txt".to_string()]);
        assert_eq!(report.skipped, vec!["c.bin".to_string()]);
        assert_eq!(
            store.object("dst", "c.bin").unwrap().body,
            Bytes::from_static(b"newer")
        );
    }

    #[tokio::test]
    async fn test_import_stop_on_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("src.tar.gz");
        let store = seeded();
        let engine = engine(&store);
        engine
            .export("src", &path, &ExportOptions::default())
            .await
            .unwrap();
        store.inject_fault("put_object", ErrorClass::Fatal, 1);

        let options = ImportOptions {
            stop_on_error: true,
            workers: 1,
            ..ImportOptions::default()
        };
        let report = engine.import("dst", &path, &options).await.unwrap();
        assert!(report.stopped_early);
        assert_eq!(report.failed.len(), 1);
        assert!(report.imported.is_empty());
        assert!(!report.is_success());
    }

    #[tokio::test]
    async fn test_mirror_import_deletes_extras() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("src.tar.gz");
        let store = seeded();
        let engine = engine(&store);
        engine
            .export("src", &path, &ExportOptions::default())
            .await
            .unwrap();
        store.insert("dst", "stale", ObjectData::new("old"));

        let additive = engine
            .import("dst", &path, &ImportOptions::default())
            .await
            .unwrap();
        assert!(additive.deleted.is_empty());
        assert!(store.object("dst", "stale").is_some());

        let options = ImportOptions {
            mirror: true,
            ..ImportOptions::default()
        };
        let report = engine.import("dst", &path, &options).await.unwrap();
        assert_eq!(report.deleted, vec!["stale".to_string()]);
        assert_eq!(store.keys("dst"), vec!["a/b.txt", "c.bin"]);
    }

    #[tokio::test]
    async fn test_directory_export_then_import_round_trip() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("src-export");
        let store = seeded();
        let engine = engine(&store);
        let options = ExportOptions {
            format: BackupFormat::Directory,
            ..ExportOptions::default()
        };

        let export = engine.export("src", &root, &options).await.unwrap();
        assert!(export.is_success());
        assert_eq!(export.exported, 2);
        assert!(root.join("manifest.json").is_file());
        assert!(root.join("objects/a%2Fb.txt").is_file());
        assert_eq!(BackupFormat::detect(&root), BackupFormat::Directory);

        let import = engine
            .import("dst", &root, &ImportOptions::default())
            .await
            .unwrap();
        assert!(import.is_success());
        let restored = store.object("dst", "a/b.txt").unwrap();
        assert_eq!(restored.body, Bytes::from_static(b"hello"));
        assert_eq!(restored.metadata.get("owner").map(String::as_str), Some("ops"));

        let drift = engine.verify("dst", &root).await.unwrap();
        assert!(drift.is_clean());
    }

    #[tokio::test]
    async fn test_directory_export_refuses_existing_backup() {
        let dir = TempDir::new().unwrap();
        let store = seeded();
        let options = ExportOptions {
            format: BackupFormat::Directory,
            ..ExportOptions::default()
        };
        engine(&store)
            .export("src", dir.path(), &options)
            .await
            .unwrap();
        let err = engine(&store)
            .export("src", dir.path(), &options)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Io { .. }));
    }

    #[tokio::test]
    async fn test_tampered_directory_aborts_with_zero_puts() {
        let dir = TempDir::new().unwrap();
        let store = seeded();
        let options = ExportOptions {
            format: BackupFormat::Directory,
            ..ExportOptions::default()
        };
        engine(&store)
            .export("src", dir.path(), &options)
            .await
            .unwrap();
        std::fs::remove_file(dir.path().join("objects/c.bin")).unwrap();

        let err = engine(&store)
            .import("dst", dir.path(), &ImportOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Manifest(_)), "{err}");
        assert_eq!(store.call_count("put_object"), 0);
    }

    #[tokio::test]
    async fn test_oversized_objects_are_not_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("src.tar.gz");
        let store = seeded();
        let options = ExportOptions {
            max_object_size: Some(4),
            ..ExportOptions::default()
        };
        let report = engine(&store).export("src", &path, &options).await.unwrap();
        assert!(report.manifest_written);
        assert_eq!(report.exported, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].key, "a/b.txt");
        assert_eq!(report.failed[0].class, ErrorClass::Fatal);
        assert_eq!(store.call_count("get_object"), 1);
    }

    #[tokio::test]
    async fn test_import_under_key_prefix_mirrors_only_that_prefix() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("src.tar.gz");
        let store = seeded();
        let engine = engine(&store);
        engine
            .export("src", &path, &ExportOptions::default())
            .await
            .unwrap();
        store.insert("dst", "restored/stale", ObjectData::new("old"));
        store.insert("dst", "other", ObjectData::new("keep"));

        let options = ImportOptions {
            key_prefix: "restored/".to_string(),
            mirror: true,
            ..ImportOptions::default()
        };
        let report = engine.import("dst", &path, &options).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.deleted, vec!["restored/stale".to_string()]);
        assert_eq!(
            store.keys("dst"),
            vec!["other", "restored/a/b.txt", "restored/c.bin"]
        );
    }

    #[tokio::test]
    async fn test_progress_counts_every_object() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("src.tar.gz");
        let store = seeded();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let engine = engine(&store).with_progress(Arc::new(move |p: Progress| {
            sink.lock().unwrap().push(p);
        }));

        engine
            .export("src", &path, &ExportOptions::default())
            .await
            .unwrap();
        engine
            .import("dst", &path, &ImportOptions::default())
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[1], Progress { done: 2, total: None });
        assert_eq!(seen[3], Progress { done: 2, total: Some(2) });
    }

    #[tokio::test]
    async fn test_verify_reports_drift() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("src.tar.gz");
        let store = seeded();
        let engine = engine(&store);
        engine
            .export("src", &path, &ExportOptions::default())
            .await
            .unwrap();
        store.insert("src", "a/b.txt", ObjectData::new("changed"));

        let clean = engine.verify("src", &path).await.unwrap();
        assert_eq!(clean.drifted, vec!["a/b.txt".to_string()]);
        assert_eq!(clean.matching, vec!["c.bin".to_string()]);

        let report = engine.verify("dst", &path).await.unwrap();
        assert_eq!(report.missing.len(), 2);
        assert!(!report.is_clean());
    }
}
