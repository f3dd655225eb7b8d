//! Directory container: the archive layout unpacked on disk.
//!
//! `<root>/objects/<escaped key>` holds each object and `<root>/manifest.json`
//! is written last, through a temporary file and a rename. A directory
//! without the manifest is an incomplete export.

use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::archive::{member_path, ArchiveIndex, ArchiveMember, BackupSink, MANIFEST_NAME, OBJECTS_DIR};
use crate::error::BackupError;
use crate::manifest::BackupManifest;

/// Writes object files, then the manifest.
#[derive(Debug)]
pub struct DirectoryWriter {
    root: PathBuf,
}

fn objects_dir(root: &Path) -> PathBuf {
    root.join(OBJECTS_DIR.trim_end_matches('/'))
}

impl DirectoryWriter {
    /// Prepare `root` for a new export, creating it if needed.
    ///
    /// A directory that already holds a manifest or object files is refused.
    pub fn create(root: &Path) -> Result<Self, BackupError> {
        let objects = objects_dir(root);
        if root.join(MANIFEST_NAME).exists() || has_entries(&objects)? {
            return Err(BackupError::io(
                root,
                std::io::Error::new(ErrorKind::AlreadyExists, "directory already holds a backup"),
            ));
        }
        fs::create_dir_all(&objects).map_err(|e| BackupError::io(&objects, e))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Write one object's content under its member path.
    pub fn append_object(&mut self, key: &str, data: &[u8]) -> std::io::Result<()> {
        fs::write(self.root.join(member_path(key)), data)
    }

    /// Write the manifest, making the export complete.
    pub fn finish_with_manifest(self, manifest: &BackupManifest) -> Result<(), BackupError> {
        let bytes = manifest.to_vec()?;
        let tmp = self.root.join(format!("{MANIFEST_NAME}.partial"));
        let path = self.root.join(MANIFEST_NAME);
        fs::write(&tmp, bytes).map_err(|e| BackupError::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| BackupError::io(&path, e))
    }
}

impl BackupSink for DirectoryWriter {
    fn put(&mut self, key: &str, data: &[u8]) -> std::io::Result<()> {
        self.append_object(key, data)
    }

    fn seal(self, manifest: &BackupManifest) -> Result<(), BackupError> {
        self.finish_with_manifest(manifest)
    }

    fn discard(self) -> Result<(), BackupError> {
        Ok(())
    }
}

fn has_entries(dir: &Path) -> Result<bool, BackupError> {
    match fs::read_dir(dir) {
        Ok(mut entries) => Ok(entries.next().is_some()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(BackupError::io(dir, e)),
    }
}

/// Collect member names and the manifest of a directory export.
///
/// Every entry under `objects/` counts as a member, so stray files show up
/// when the manifest is validated.
pub fn scan(root: &Path) -> Result<ArchiveIndex, BackupError> {
    let objects = objects_dir(root);
    let entries = match fs::read_dir(&objects) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(BackupError::Manifest(format!(
                "{} has no {OBJECTS_DIR} directory",
                root.display()
            )))
        }
        Err(e) => return Err(BackupError::io(&objects, e)),
    };
    let mut members = BTreeSet::new();
    for entry in entries {
        let entry = entry.map_err(|e| BackupError::io(&objects, e))?;
        members.insert(format!(
            "{OBJECTS_DIR}{}",
            entry.file_name().to_string_lossy()
        ));
    }

    let manifest_path = root.join(MANIFEST_NAME);
    let bytes = match fs::read(&manifest_path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(BackupError::Manifest(format!(
                "{MANIFEST_NAME} missing; directory is incomplete"
            )))
        }
        Err(e) => return Err(BackupError::io(&manifest_path, e)),
    };
    let manifest = BackupManifest::from_slice(&bytes)?;
    debug!(path = %root.display(), members = members.len(), "scanned directory");
    Ok(ArchiveIndex { members, manifest })
}

/// Read `members` from `root` on a blocking thread, in the order given.
///
/// The reader stops early once the receiver is dropped.
pub fn spawn_reader(
    root: PathBuf,
    members: Vec<String>,
    capacity: usize,
) -> (
    mpsc::Receiver<Result<ArchiveMember, BackupError>>,
    JoinHandle<()>,
) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let handle = tokio::task::spawn_blocking(move || {
        for name in members {
            let path = root.join(&name);
            let member = fs::read(&path)
                .map(|data| ArchiveMember { path: name, data })
                .map_err(|e| BackupError::io(&path, e));
            let failed = member.is_err();
            if tx.blocking_send(member).is_err() || failed {
                break;
            }
        }
    });
    (rx, handle)
}
