//! Snapshot of the live cluster, restricted to what the desired state names.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;

use garagekit_core::{RetryExecutor, RetryOutcome};
use serde::Serialize;
use tracing::{debug, warn};

use crate::admin_client::{
    AdminApi, AdminResult, BucketQuotas, ClusterLayout, Permissions, WebsiteAccess,
};
use crate::desired::DesiredState;
use crate::error::ReconcileError;

/// A bucket as the cluster reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketState {
    /// Bucket identifier.
    pub id: String,
    /// Flags held per access key id.
    pub grants: BTreeMap<String, Permissions>,
    /// Current quota.
    pub quotas: BucketQuotas,
    /// Website settings, normalized.
    pub website: WebsiteAccess,
}

/// An access key as the cluster reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyState {
    /// Access key id.
    pub id: String,
    /// May create buckets.
    pub allow_create_bucket: bool,
}

/// Cluster state relevant to one run. Re-read every run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterState {
    /// Buckets by global alias.
    pub buckets: BTreeMap<String, BucketState>,
    /// Keys by name.
    pub keys: BTreeMap<String, KeyState>,
    /// Layout, fetched only when the desired state declares one.
    pub layout: Option<ClusterLayout>,
}

/// Run a call under the retry policy and turn exhaustion into a
/// [`ReconcileError::Call`].
pub(crate) async fn retried<T, F, Fut>(
    retry: &RetryExecutor,
    what: &str,
    operation: F,
) -> Result<(T, u32), ReconcileError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AdminResult<T>>,
{
    let mut attempts = 0u32;
    let mut counted = operation;
    let outcome = retry
        .execute(what, || {
            attempts += 1;
            counted()
        })
        .await;
    match outcome {
        RetryOutcome::Success(value) => Ok((value, attempts)),
        RetryOutcome::Exhausted {
            last_error,
            attempts,
        } => Err(ReconcileError::Call {
            what: what.to_string(),
            attempts,
            source: last_error,
        }),
    }
}

impl ClusterState {
    /// Read the keys, buckets and layout named by `desired`.
    ///
    /// Details are fetched only for declared resources; everything else is
    /// ignored. Each call runs under `retry`.
    pub async fn fetch(
        api: &dyn AdminApi,
        retry: &RetryExecutor,
        desired: &DesiredState,
    ) -> Result<Self, ReconcileError> {
        let mut state = ClusterState::default();

        let wanted_keys: HashSet<&str> = desired.keys.iter().map(|k| k.name.as_str()).collect();
        let (keys, _) = retried(retry, "list_keys", || api.list_keys()).await?;
        for item in keys {
            if !wanted_keys.contains(item.name.as_str()) {
                continue;
            }
            if state.keys.contains_key(&item.name) {
                warn!(name = %item.name, id = %item.id, "duplicate key name, keeping first");
                continue;
            }
            let what = format!("get_key {}", item.name);
            let (info, _) = retried(retry, &what, || api.get_key(&item.id)).await?;
            state.keys.insert(
                item.name.clone(),
                KeyState {
                    id: info.access_key_id,
                    allow_create_bucket: info.permissions.create_bucket,
                },
            );
        }

        let wanted_buckets: HashSet<&str> =
            desired.buckets.iter().map(|b| b.name.as_str()).collect();
        let (buckets, _) = retried(retry, "list_buckets", || api.list_buckets()).await?;
        for item in buckets {
            let Some(alias) = item
                .global_aliases
                .iter()
                .find(|a| wanted_buckets.contains(a.as_str()))
            else {
                continue;
            };
            let what = format!("get_bucket {alias}");
            let (info, _) = retried(retry, &what, || api.get_bucket(&item.id)).await?;
            let grants = info
                .keys
                .iter()
                .map(|k| (k.access_key_id.clone(), k.permissions))
                .collect();
            state.buckets.insert(
                alias.clone(),
                BucketState {
                    website: info.website(),
                    id: info.id,
                    grants,
                    quotas: info.quotas,
                },
            );
        }

        if !desired.layout.is_empty() {
            let (layout, _) = retried(retry, "get_layout", || api.get_layout()).await?;
            state.layout = Some(layout);
        }

        debug!(
            keys = state.keys.len(),
            buckets = state.buckets.len(),
            layout_version = state.layout.as_ref().map(|l| l.version),
            "fetched cluster state"
        );
        Ok(state)
    }

    /// Access key id for a key name.
    pub fn key_id(&self, name: &str) -> Option<&str> {
        self.keys.get(name).map(|k| k.id.as_str())
    }

    /// Bucket id for a global alias.
    pub fn bucket_id(&self, alias: &str) -> Option<&str> {
        self.buckets.get(alias).map(|b| b.id.as_str())
    }

    /// Flags `key_name` holds on `alias`; empty if either is unknown.
    pub fn permissions(&self, alias: &str, key_name: &str) -> Permissions {
        match (self.buckets.get(alias), self.key_id(key_name)) {
            (Some(bucket), Some(key_id)) => {
                bucket.grants.get(key_id).copied().unwrap_or_default()
            }
            _ => Permissions::default(),
        }
    }
}
