//! Backup manifest: the last member of every complete archive.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::archive::member_path;
use crate::error::BackupError;

/// Manifest format written by this version.
pub const FORMAT_VERSION: u32 = 1;

/// One archived object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    /// Original object key.
    pub key: String,
    /// Archive member holding the content.
    pub path: String,
    /// Content length in bytes.
    pub size: u64,
    /// `sha256:<hex>` of the content.
    pub content_digest: String,
    /// Content type, if the object had one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// User metadata.
    #[serde(default)]
    pub custom_metadata: BTreeMap<String, String>,
}

/// Index of an archive, written once after every object member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    /// Manifest format version.
    pub format_version: u32,
    /// Bucket the archive was taken from.
    pub bucket_name: String,
    /// Number of entries.
    pub object_count: u64,
    /// Sum of entry sizes.
    pub total_size: u64,
    /// Time the export started.
    pub created_at: DateTime<Utc>,
    /// Entries in archive order.
    pub entries: Vec<ManifestEntry>,
}

impl BackupManifest {
    /// Empty manifest for `bucket`.
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            bucket_name: bucket.into(),
            object_count: 0,
            total_size: 0,
            created_at: Utc::now(),
            entries: Vec::new(),
        }
    }

    /// Append an entry and update the totals.
    pub fn push(&mut self, entry: ManifestEntry) {
        self.object_count += 1;
        self.total_size += entry.size;
        self.entries.push(entry);
    }

    /// Parse manifest bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, BackupError> {
        serde_json::from_slice(bytes).map_err(|e| BackupError::Manifest(e.to_string()))
    }

    /// Serialize for the archive.
    pub fn to_vec(&self) -> Result<Vec<u8>, BackupError> {
        serde_json::to_vec_pretty(self).map_err(|e| BackupError::Manifest(e.to_string()))
    }

    /// Entry for `key`, if any.
    pub fn entry(&self, key: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.key == key)
    }

    /// Check the manifest against the object members present in the archive.
    ///
    /// Every problem found is reported in one error.
    pub fn validate_against(&self, members: &BTreeSet<String>) -> Result<(), BackupError> {
        let mut issues = Vec::new();
        if self.format_version != FORMAT_VERSION {
            issues.push(format!(
                "unsupported format version {} (expected {FORMAT_VERSION})",
                self.format_version
            ));
        }
        if self.object_count != self.entries.len() as u64 {
            issues.push(format!(
                "objectCount is {} but there are {} entries",
                self.object_count,
                self.entries.len()
            ));
        }
        let total: u64 = self.entries.iter().map(|e| e.size).sum();
        if total != self.total_size {
            issues.push(format!(
                "totalSize is {} but entries sum to {total}",
                self.total_size
            ));
        }

        let mut seen = BTreeSet::new();
        for entry in &self.entries {
            if !seen.insert(entry.key.as_str()) {
                issues.push(format!("duplicate entry for key {:?}", entry.key));
            }
            if entry.path != member_path(&entry.key) {
                issues.push(format!(
                    "entry {:?} points at {:?}, expected {:?}",
                    entry.key,
                    entry.path,
                    member_path(&entry.key)
                ));
            }
            if !members.contains(&entry.path) {
                issues.push(format!("member {:?} missing from archive", entry.path));
            }
        }

        let listed: BTreeSet<&str> = self.entries.iter().map(|e| e.path.as_str()).collect();
        for member in members {
            if !listed.contains(member.as_str()) {
                issues.push(format!("unexpected archive member {member:?}"));
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(BackupError::Manifest(issues.join("; ")))
        }
    }
}
