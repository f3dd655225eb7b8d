//! Declarative description of the cluster configuration.
//!
//! A document lists keys, buckets (with grants, quotas and website hosting)
//! and optionally the node layout. It is loaded from YAML or JSON, from an
//! inline string, or from environment variables, and validated as a whole
//! before anything is applied.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::marker::PhantomData;
use std::path::Path;

use serde::de::value::MapAccessDeserializer;
use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use crate::admin_client::{Permissions, WebsiteAccess};
use crate::error::DesiredStateError;

/// Full JSON document in an environment variable.
pub const ENV_CONFIG: &str = "GARAGE_BOOTSTRAP_CONFIG";
/// Comma-separated bucket names.
pub const ENV_BUCKETS: &str = "GARAGE_BUCKETS";
/// Comma-separated key names.
pub const ENV_KEYS: &str = "GARAGE_KEYS";

/// Bucket quota. Absolute values; at least one must be set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct QuotaSpec {
    /// Maximum total size in bytes.
    pub max_size: Option<u64>,
    /// Maximum number of objects.
    pub max_objects: Option<u64>,
}

/// A bucket, identified by its global alias.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BucketSpec {
    /// Global alias.
    pub name: String,
    /// Keys granted access. Read and write unless `permissions` says otherwise.
    #[serde(default)]
    pub keys: BTreeSet<String>,
    /// Explicit per-key flags.
    #[serde(default)]
    pub permissions: BTreeMap<String, Permissions>,
    /// Optional quota.
    #[serde(default, alias = "quotas", skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaSpec>,
    /// Optional static website hosting. Absent means left as is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website_access: Option<WebsiteAccess>,
}

impl BucketSpec {
    /// A bucket with no grants and no quota.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Every key this bucket references, with the flags it should hold.
    ///
    /// Keys listed without a `permissions` entry get read and write. A
    /// `permissions` entry for a key not in `keys` still grants access.
    pub fn effective_grants(&self) -> BTreeMap<String, Permissions> {
        let mut grants: BTreeMap<String, Permissions> = self
            .keys
            .iter()
            .map(|k| (k.clone(), Permissions::READ_WRITE))
            .collect();
        for (key, perms) in &self.permissions {
            grants.insert(key.clone(), *perms);
        }
        grants
    }
}

/// An access key, identified by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct KeySpec {
    /// Key name.
    pub name: String,
    /// May this key create buckets.
    #[serde(default)]
    pub allow_create_bucket: bool,
}

impl KeySpec {
    /// A key with default flags.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            allow_create_bucket: false,
        }
    }
}

/// Role of one storage node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LayoutNodeSpec {
    /// Node identifier.
    pub node_id: String,
    /// Zone name.
    pub zone: String,
    /// Capacity in bytes. `None` makes the node a gateway.
    #[serde(default)]
    pub capacity: Option<u64>,
    /// Free-form tags.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A list item given as a bare name or as a full object. Errors inside the
/// object (such as an unknown field) are reported as they are.
enum Entry<T> {
    Name(String),
    Full(T),
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Entry<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntryVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for EntryVisitor<T> {
            type Value = Entry<T>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a name or an object")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Ok(Entry::Name(v.to_string()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<Self::Value, E> {
                Ok(Entry::Name(v))
            }

            fn visit_map<A: MapAccess<'de>>(self, map: A) -> Result<Self::Value, A::Error> {
                T::deserialize(MapAccessDeserializer::new(map)).map(Entry::Full)
            }
        }

        deserializer.deserialize_any(EntryVisitor(PhantomData))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawDocument {
    #[serde(default)]
    buckets: Vec<Entry<BucketSpec>>,
    #[serde(default)]
    keys: Vec<Entry<KeySpec>>,
    #[serde(default)]
    layout: Vec<LayoutNodeSpec>,
    #[serde(default = "default_apply_layout")]
    apply_layout: bool,
}

fn default_apply_layout() -> bool {
    true
}

/// The declared configuration of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawDocument", rename_all = "camelCase")]
pub struct DesiredState {
    /// Buckets, in document order.
    pub buckets: Vec<BucketSpec>,
    /// Keys, in document order.
    pub keys: Vec<KeySpec>,
    /// Node roles. Empty means the layout is not managed.
    pub layout: Vec<LayoutNodeSpec>,
    /// Commit staged layout changes.
    pub apply_layout: bool,
}

impl Default for DesiredState {
    fn default() -> Self {
        Self {
            buckets: Vec::new(),
            keys: Vec::new(),
            layout: Vec::new(),
            apply_layout: true,
        }
    }
}

impl From<RawDocument> for DesiredState {
    fn from(raw: RawDocument) -> Self {
        Self {
            buckets: raw
                .buckets
                .into_iter()
                .map(|e| match e {
                    Entry::Name(name) => BucketSpec::named(name),
                    Entry::Full(spec) => spec,
                })
                .collect(),
            keys: raw
                .keys
                .into_iter()
                .map(|e| match e {
                    Entry::Name(name) => KeySpec::named(name),
                    Entry::Full(spec) => spec,
                })
                .collect(),
            layout: raw.layout,
            apply_layout: raw.apply_layout,
        }
    }
}

impl DesiredState {
    /// Load a document, YAML for `.yml`/`.yaml` and JSON otherwise.
    pub fn from_file(path: &Path) -> Result<Self, DesiredStateError> {
        let contents =
            std::fs::read_to_string(path).map_err(|source| DesiredStateError::Io {
                path: path.display().to_string(),
                source,
            })?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_lowercase();
        match ext.as_str() {
            "yml" | "yaml" => Self::from_yaml_str(&contents),
            _ => Self::from_json_str(&contents),
        }
    }

    /// Parse a YAML document. An empty document is an empty state.
    pub fn from_yaml_str(contents: &str) -> Result<Self, DesiredStateError> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents).map_err(|e| DesiredStateError::Parse {
            format: "yaml",
            reason: e.to_string(),
        })
    }

    /// Parse a JSON document.
    pub fn from_json_str(contents: &str) -> Result<Self, DesiredStateError> {
        serde_json::from_str(contents).map_err(|e| DesiredStateError::Parse {
            format: "json",
            reason: e.to_string(),
        })
    }

    /// Build from the process environment.
    pub fn from_env() -> Result<Self, DesiredStateError> {
        Self::from_env_map(|name| std::env::var(name).ok())
    }

    /// Build from an environment lookup.
    ///
    /// A non-empty [`ENV_CONFIG`] wins; otherwise [`ENV_BUCKETS`] and
    /// [`ENV_KEYS`] give bare names.
    pub fn from_env_map<F>(lookup: F) -> Result<Self, DesiredStateError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(doc) = lookup(ENV_CONFIG).filter(|d| !d.trim().is_empty()) {
            return Self::from_json_str(&doc);
        }
        let names = |var: &str| -> Vec<String> {
            lookup(var)
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .collect()
        };
        Ok(Self {
            buckets: names(ENV_BUCKETS).into_iter().map(BucketSpec::named).collect(),
            keys: names(ENV_KEYS).into_iter().map(KeySpec::named).collect(),
            ..Self::default()
        })
    }

    /// True if the document declares nothing.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty() && self.keys.is_empty() && self.layout.is_empty()
    }

    /// Declared key by name.
    pub fn key(&self, name: &str) -> Option<&KeySpec> {
        self.keys.iter().find(|k| k.name == name)
    }

    /// Check every invariant and report all violations at once.
    pub fn validate(&self) -> Result<(), DesiredStateError> {
        let mut issues = Vec::new();

        let mut key_names = HashSet::new();
        for (i, key) in self.keys.iter().enumerate() {
            if key.name.trim().is_empty() {
                issues.push(format!("keys[{i}]: name is empty"));
            } else if !key_names.insert(key.name.as_str()) {
                issues.push(format!("key '{}' is declared more than once", key.name));
            }
        }

        let mut bucket_names = HashSet::new();
        for (i, bucket) in self.buckets.iter().enumerate() {
            if bucket.name.trim().is_empty() {
                issues.push(format!("buckets[{i}]: name is empty"));
            } else if !bucket_names.insert(bucket.name.as_str()) {
                issues.push(format!(
                    "bucket '{}' is declared more than once",
                    bucket.name
                ));
            }
            for key in bucket.effective_grants().keys() {
                if !key_names.contains(key.as_str()) {
                    issues.push(format!(
                        "bucket '{}' references undeclared key '{}'",
                        bucket.name, key
                    ));
                }
            }
            if let Some(quota) = bucket.quota {
                if quota.max_size.is_none() && quota.max_objects.is_none() {
                    issues.push(format!(
                        "bucket '{}': quota sets neither maxSize nor maxObjects",
                        bucket.name
                    ));
                }
                if quota.max_size == Some(0) {
                    issues.push(format!("bucket '{}': maxSize must be > 0", bucket.name));
                }
                if quota.max_objects == Some(0) {
                    issues.push(format!(
                        "bucket '{}': maxObjects must be > 0",
                        bucket.name
                    ));
                }
            }
            if let Some(website) = &bucket.website_access {
                let index = website.index_document.as_deref().unwrap_or_default();
                if website.enabled && index.trim().is_empty() {
                    issues.push(format!(
                        "bucket '{}': websiteAccess is enabled without indexDocument",
                        bucket.name
                    ));
                }
            }
        }

        let mut node_ids = HashSet::new();
        for (i, node) in self.layout.iter().enumerate() {
            if node.node_id.trim().is_empty() {
                issues.push(format!("layout[{i}]: nodeId is empty"));
            } else if !node_ids.insert(node.node_id.as_str()) {
                issues.push(format!(
                    "node '{}' appears more than once in layout",
                    node.node_id
                ));
            }
            if node.zone.trim().is_empty() {
                issues.push(format!("layout[{i}]: zone is empty"));
            }
            if node.capacity == Some(0) {
                issues.push(format!("layout[{i}]: capacity must be > 0"));
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(DesiredStateError::Invalid { issues })
        }
    }
}
