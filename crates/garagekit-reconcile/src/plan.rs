//! Diff between the desired state and the fetched cluster state.
//!
//! Planning is pure: it makes no calls and the same inputs always give the
//! same plan. Operations name keys and buckets by name and alias; the
//! reconciler resolves identifiers when it applies them.

use std::fmt;

use serde::Serialize;

use crate::admin_client::{BucketQuotas, LayoutRole, Permissions, WebsiteAccess};
use crate::cluster_state::ClusterState;
use crate::desired::{DesiredState, LayoutNodeSpec};

/// One change to make on the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Create an access key. New keys cannot create buckets; an
    /// [`Operation::UpdateKey`] follows when they should.
    CreateKey {
        /// Key name.
        name: String,
    },
    /// Change the flags of a key.
    UpdateKey {
        /// Key name.
        name: String,
        /// Allow the key to create buckets.
        allow_create_bucket: bool,
    },
    /// Create a bucket with a global alias.
    CreateBucket {
        /// Global alias.
        alias: String,
    },
    /// Stage role changes and optionally commit them.
    ApplyLayout {
        /// Roles to stage.
        changes: Vec<LayoutRole>,
        /// Version to commit.
        version: u64,
        /// Commit after staging.
        commit: bool,
    },
    /// Give a key flags on a bucket.
    GrantPermission {
        /// Bucket alias.
        bucket: String,
        /// Key name.
        key: String,
        /// Flags to add.
        permissions: Permissions,
    },
    /// Take flags away from a key on a bucket.
    RevokePermission {
        /// Bucket alias.
        bucket: String,
        /// Key name.
        key: String,
        /// Flags to remove.
        permissions: Permissions,
    },
    /// Set the bucket quota to absolute values.
    SetQuota {
        /// Bucket alias.
        bucket: String,
        /// Target quota.
        quota: BucketQuotas,
    },
    /// Set the bucket's website hosting.
    SetWebsite {
        /// Bucket alias.
        bucket: String,
        /// Target settings.
        website: WebsiteAccess,
    },
}

impl Operation {
    /// Short name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::CreateKey { .. } => "create_key",
            Operation::UpdateKey { .. } => "update_key",
            Operation::CreateBucket { .. } => "create_bucket",
            Operation::ApplyLayout { .. } => "apply_layout",
            Operation::GrantPermission { .. } => "grant_permission",
            Operation::RevokePermission { .. } => "revoke_permission",
            Operation::SetQuota { .. } => "set_quota",
            Operation::SetWebsite { .. } => "set_website",
        }
    }
}

fn quota_text(value: Option<u64>) -> String {
    value.map_or_else(|| "unlimited".to_string(), |v| v.to_string())
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::CreateKey { name } => write!(f, "create key {name}"),
            Operation::UpdateKey {
                name,
                allow_create_bucket,
            } => write!(f, "update key {name} (createBucket={allow_create_bucket})"),
            Operation::CreateBucket { alias } => write!(f, "create bucket {alias}"),
            Operation::ApplyLayout {
                changes,
                version,
                commit,
            } => {
                let nodes: Vec<&str> = changes.iter().map(|c| c.id.as_str()).collect();
                write!(f, "stage layout [{}]", nodes.join(", "))?;
                if *commit {
                    write!(f, " and apply version {version}")?;
                }
                Ok(())
            }
            Operation::GrantPermission {
                bucket,
                key,
                permissions,
            } => write!(f, "grant {permissions} on {bucket} to {key}"),
            Operation::RevokePermission {
                bucket,
                key,
                permissions,
            } => write!(f, "revoke {permissions} on {bucket} from {key}"),
            Operation::SetQuota { bucket, quota } => write!(
                f,
                "set quota on {bucket}: maxSize={} maxObjects={}",
                quota_text(quota.max_size),
                quota_text(quota.max_objects)
            ),
            Operation::SetWebsite { bucket, website } if website.enabled => {
                write!(
                    f,
                    "enable website on {bucket}: index={}",
                    website.index_document.as_deref().unwrap_or_default()
                )?;
                if let Some(error) = &website.error_document {
                    write!(f, " error={error}")?;
                }
                Ok(())
            }
            Operation::SetWebsite { bucket, .. } => write!(f, "disable website on {bucket}"),
        }
    }
}

/// Ordered operations that take the cluster to the desired state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ReconciliationPlan {
    operations: Vec<Operation>,
}

impl ReconciliationPlan {
    /// Diff `desired` against `state`.
    ///
    /// Order: keys, buckets, layout, permissions, quotas, website settings.
    /// Resources that already match emit nothing.
    pub fn build(desired: &DesiredState, state: &ClusterState) -> Self {
        let mut operations = Vec::new();

        for key in &desired.keys {
            match state.keys.get(&key.name) {
                None => {
                    operations.push(Operation::CreateKey {
                        name: key.name.clone(),
                    });
                    if key.allow_create_bucket {
                        operations.push(Operation::UpdateKey {
                            name: key.name.clone(),
                            allow_create_bucket: true,
                        });
                    }
                }
                Some(current) if current.allow_create_bucket != key.allow_create_bucket => {
                    operations.push(Operation::UpdateKey {
                        name: key.name.clone(),
                        allow_create_bucket: key.allow_create_bucket,
                    })
                }
                Some(_) => {}
            }
        }

        for bucket in &desired.buckets {
            if !state.buckets.contains_key(&bucket.name) {
                operations.push(Operation::CreateBucket {
                    alias: bucket.name.clone(),
                });
            }
        }

        if let Some(op) = plan_layout(desired, state) {
            operations.push(op);
        }

        for bucket in &desired.buckets {
            for (key, want) in bucket.effective_grants() {
                let current = state.permissions(&bucket.name, &key);
                let grant = want.minus(&current);
                if !grant.is_empty() {
                    operations.push(Operation::GrantPermission {
                        bucket: bucket.name.clone(),
                        key: key.clone(),
                        permissions: grant,
                    });
                }
                let revoke = current.minus(&want);
                if !revoke.is_empty() {
                    operations.push(Operation::RevokePermission {
                        bucket: bucket.name.clone(),
                        key,
                        permissions: revoke,
                    });
                }
            }
        }

        for bucket in &desired.buckets {
            let Some(quota) = bucket.quota else {
                continue;
            };
            let target = BucketQuotas {
                max_size: quota.max_size,
                max_objects: quota.max_objects,
            };
            let current = state
                .buckets
                .get(&bucket.name)
                .map(|b| b.quotas)
                .unwrap_or_default();
            if current != target {
                operations.push(Operation::SetQuota {
                    bucket: bucket.name.clone(),
                    quota: target,
                });
            }
        }

        for bucket in &desired.buckets {
            let Some(website) = &bucket.website_access else {
                continue;
            };
            let target = website.normalized();
            let current = state
                .buckets
                .get(&bucket.name)
                .map(|b| b.website.clone())
                .unwrap_or_default();
            if current != target {
                operations.push(Operation::SetWebsite {
                    bucket: bucket.name.clone(),
                    website: target,
                });
            }
        }

        Self { operations }
    }

    /// Wrap an explicit list.
    pub fn from_operations(operations: Vec<Operation>) -> Self {
        Self { operations }
    }

    /// Operations in apply order.
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Number of operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// True if the cluster already matches.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Iterate in apply order.
    pub fn iter(&self) -> std::slice::Iter<'_, Operation> {
        self.operations.iter()
    }
}

impl<'a> IntoIterator for &'a ReconciliationPlan {
    type Item = &'a Operation;
    type IntoIter = std::slice::Iter<'a, Operation>;

    fn into_iter(self) -> Self::IntoIter {
        self.operations.iter()
    }
}

fn role_of(node: &LayoutNodeSpec) -> LayoutRole {
    let mut tags = node.tags.clone();
    tags.sort();
    LayoutRole {
        id: node.node_id.clone(),
        zone: node.zone.clone(),
        capacity: node.capacity,
        tags,
    }
}

fn same_role(a: &LayoutRole, b: &LayoutRole) -> bool {
    let mut a_tags = a.tags.clone();
    let mut b_tags = b.tags.clone();
    a_tags.sort();
    b_tags.sort();
    a.id == b.id && a.zone == b.zone && a.capacity == b.capacity && a_tags == b_tags
}

fn plan_layout(desired: &DesiredState, state: &ClusterState) -> Option<Operation> {
    let layout = state.layout.as_ref()?;
    if desired.layout.is_empty() {
        return None;
    }

    let mut changes = Vec::new();
    let mut uncommitted = false;
    for node in &desired.layout {
        let want = role_of(node);
        let active = layout.roles.iter().find(|r| r.id == want.id);
        let staged = layout.staged_role_changes.iter().find(|r| r.id == want.id);
        let effective = staged.or(active);
        if !effective.is_some_and(|r| same_role(r, &want)) {
            changes.push(want.clone());
        }
        if !active.is_some_and(|r| same_role(r, &want)) {
            uncommitted = true;
        }
    }

    let commit = desired.apply_layout && uncommitted;
    if changes.is_empty() && !commit {
        return None;
    }
    Some(Operation::ApplyLayout {
        changes,
        version: layout.version + 1,
        commit,
    })
}
