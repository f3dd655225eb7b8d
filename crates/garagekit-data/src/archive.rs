//! Archive container: a gzip-compressed tar.
//!
//! Object content lives under `objects/<escaped key>`. Keys are flattened by
//! percent-encoding every byte outside `[A-Za-z0-9-_.~]`, so the archive has
//! no nested directories and a member name can never climb out of
//! `objects/`. `manifest.json` is always the last member; an archive without
//! it is incomplete.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::BackupError;
use crate::manifest::BackupManifest;

/// Name of the manifest member.
pub const MANIFEST_NAME: &str = "manifest.json";

/// Directory holding object members.
pub const OBJECTS_DIR: &str = "objects/";

/// Flatten an object key into a single path component.
///
/// `.` and `..` keys have their dots encoded too.
pub fn escape_key(key: &str) -> String {
    let escaped = urlencoding::encode(key).into_owned();
    if escaped == "." || escaped == ".." {
        escaped.replace('.', "%2E")
    } else {
        escaped
    }
}

/// Member name for an object key.
pub fn member_path(key: &str) -> String {
    format!("{OBJECTS_DIR}{}", escape_key(key))
}

fn archive_error(path: &Path, e: std::io::Error) -> BackupError {
    BackupError::Archive(format!("{}: {e}", path.display()))
}

/// Destination of an export: object content first, the manifest last.
///
/// Called from a blocking thread.
pub trait BackupSink: Send + 'static {
    /// Store one object's content.
    fn put(&mut self, key: &str, data: &[u8]) -> std::io::Result<()>;
    /// Write the manifest and close; the backup is complete.
    fn seal(self, manifest: &BackupManifest) -> Result<(), BackupError>;
    /// Close without a manifest; the backup stays incomplete.
    fn discard(self) -> Result<(), BackupError>;
}

/// Appends object members, then the manifest.
pub struct ArchiveWriter<W: Write> {
    builder: tar::Builder<GzEncoder<W>>,
    mtime: u64,
}

impl ArchiveWriter<BufWriter<File>> {
    /// Create (or truncate) the archive file at `path`.
    pub fn create(path: &Path) -> Result<Self, BackupError> {
        let file = File::create(path).map_err(|e| BackupError::io(path, e))?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> ArchiveWriter<W> {
    /// Writer over any byte sink.
    pub fn new(inner: W) -> Self {
        let mtime = chrono::Utc::now().timestamp().max(0) as u64;
        Self {
            builder: tar::Builder::new(GzEncoder::new(inner, Compression::default())),
            mtime,
        }
    }

    fn append(&mut self, name: &str, data: &[u8]) -> std::io::Result<()> {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(self.mtime);
        header.set_entry_type(tar::EntryType::Regular);
        self.builder.append_data(&mut header, name, data)
    }

    /// Append one object's content under its member path.
    pub fn append_object(&mut self, key: &str, data: &[u8]) -> std::io::Result<()> {
        self.append(&member_path(key), data)
    }

    /// Write the manifest as the last member and close the archive.
    pub fn finish_with_manifest(mut self, manifest: &BackupManifest) -> Result<W, BackupError> {
        let bytes = manifest.to_vec()?;
        self.append(MANIFEST_NAME, &bytes)
            .map_err(|e| BackupError::Archive(e.to_string()))?;
        self.close()
    }

    /// Close the archive without a manifest.
    pub fn abandon(self) -> Result<W, BackupError> {
        self.close()
    }

    fn close(self) -> Result<W, BackupError> {
        let encoder = self
            .builder
            .into_inner()
            .map_err(|e| BackupError::Archive(e.to_string()))?;
        let mut inner = encoder
            .finish()
            .map_err(|e| BackupError::Archive(e.to_string()))?;
        inner
            .flush()
            .map_err(|e| BackupError::Archive(e.to_string()))?;
        Ok(inner)
    }
}

impl<W: Write + Send + 'static> BackupSink for ArchiveWriter<W> {
    fn put(&mut self, key: &str, data: &[u8]) -> std::io::Result<()> {
        self.append_object(key, data)
    }

    fn seal(self, manifest: &BackupManifest) -> Result<(), BackupError> {
        self.finish_with_manifest(manifest).map(|_| ())
    }

    fn discard(self) -> Result<(), BackupError> {
        self.abandon().map(|_| ())
    }
}

/// Member names and manifest found by a first pass over an archive.
#[derive(Debug, Clone)]
pub struct ArchiveIndex {
    /// Every member except the manifest.
    pub members: BTreeSet<String>,
    /// Parsed manifest.
    pub manifest: BackupManifest,
}

/// Read an archive once, collecting member names and the manifest.
///
/// Fails if the archive is unreadable, has no manifest, or has members after
/// the manifest.
pub fn scan(path: &Path) -> Result<ArchiveIndex, BackupError> {
    let file = File::open(path).map_err(|e| BackupError::io(path, e))?;
    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    let mut members = BTreeSet::new();
    let mut manifest_bytes: Option<Vec<u8>> = None;

    for entry in archive.entries().map_err(|e| archive_error(path, e))? {
        let mut entry = entry.map_err(|e| archive_error(path, e))?;
        let name = entry_name(&entry).map_err(|e| archive_error(path, e))?;
        if manifest_bytes.is_some() {
            return Err(BackupError::Manifest(format!(
                "member {name:?} follows {MANIFEST_NAME}"
            )));
        }
        if name == MANIFEST_NAME {
            let mut bytes = Vec::new();
            entry
                .read_to_end(&mut bytes)
                .map_err(|e| archive_error(path, e))?;
            manifest_bytes = Some(bytes);
        } else {
            members.insert(name);
        }
    }

    let bytes = manifest_bytes.ok_or_else(|| {
        BackupError::Manifest(format!("{MANIFEST_NAME} missing; archive is incomplete"))
    })?;
    let manifest = BackupManifest::from_slice(&bytes)?;
    debug!(path = %path.display(), members = members.len(), "scanned archive");
    Ok(ArchiveIndex { members, manifest })
}

fn entry_name<R: Read>(entry: &tar::Entry<'_, R>) -> std::io::Result<String> {
    Ok(entry.path()?.to_string_lossy().into_owned())
}

/// One object member read back from an archive.
#[derive(Debug, Clone)]
pub struct ArchiveMember {
    /// Member name.
    pub path: String,
    /// Member content.
    pub data: Vec<u8>,
}

/// Stream object members from `path` on a blocking thread.
///
/// Members arrive in archive order; the manifest is skipped. The reader stops
/// early once the receiver is dropped.
///
/// Each member is read whole, so at most `capacity` members plus the one
/// being read are held in memory at a time.
pub fn spawn_reader(
    path: PathBuf,
    capacity: usize,
) -> (
    mpsc::Receiver<Result<ArchiveMember, BackupError>>,
    JoinHandle<()>,
) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let handle = tokio::task::spawn_blocking(move || {
        if let Err(e) = read_members(&path, &tx) {
            let _ = tx.blocking_send(Err(e));
        }
    });
    (rx, handle)
}

fn read_members(
    path: &Path,
    tx: &mpsc::Sender<Result<ArchiveMember, BackupError>>,
) -> Result<(), BackupError> {
    let file = File::open(path).map_err(|e| BackupError::io(path, e))?;
    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    for entry in archive.entries().map_err(|e| archive_error(path, e))? {
        let mut entry = entry.map_err(|e| archive_error(path, e))?;
        let name = entry_name(&entry).map_err(|e| archive_error(path, e))?;
        if name == MANIFEST_NAME {
            continue;
        }
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut data)
            .map_err(|e| archive_error(path, e))?;
        if tx.blocking_send(Ok(ArchiveMember { path: name, data })).is_err() {
            break;
        }
    }
    Ok(())
}
