//! In-memory [`AdminApi`] for tests and dry runs.
//!
//! Behaves like the real administrative API for the operations the
//! reconciler uses: bucket aliases are unique (409 on reuse), key secrets
//! are returned on creation only, allow/deny only touch the flags they name.
//! Every call is counted, and faults can be injected per method.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use garagekit_core::ErrorClass;
use tracing::debug;

use crate::admin_client::{
    AdminApi, AdminResult, ApplyLayoutResponse, BucketInfo, BucketKeyAccess, BucketListItem,
    BucketQuotas, ClusterLayout, ClusterStatus, HealthStatus, KeyInfo, KeyListItem,
    KeyPermissions, LayoutRole, NodeStatus, Permissions, SecretKey, UpdateBucketRequest,
    UpdateKeyRequest, WebsiteAccess, WebsiteConfig,
};
use crate::error::AdminError;

#[derive(Debug, Clone)]
struct StoredBucket {
    id: String,
    aliases: Vec<String>,
    quotas: BucketQuotas,
    website: WebsiteAccess,
    grants: BTreeMap<String, Permissions>,
}

#[derive(Debug, Clone)]
struct StoredKey {
    id: String,
    name: String,
    allow: KeyPermissions,
}

#[derive(Debug, Default)]
struct State {
    buckets: BTreeMap<String, StoredBucket>,
    keys: BTreeMap<String, StoredKey>,
    layout: ClusterLayout,
    next_id: u64,
    calls: Vec<String>,
    faults: HashMap<String, VecDeque<ErrorClass>>,
}

impl State {
    fn bucket_info(&self, bucket: &StoredBucket) -> BucketInfo {
        BucketInfo {
            id: bucket.id.clone(),
            global_aliases: bucket.aliases.clone(),
            keys: bucket
                .grants
                .iter()
                .filter(|(_, p)| !p.is_empty())
                .map(|(key_id, p)| BucketKeyAccess {
                    access_key_id: key_id.clone(),
                    name: self
                        .keys
                        .get(key_id)
                        .map(|k| k.name.clone())
                        .unwrap_or_default(),
                    permissions: *p,
                })
                .collect(),
            quotas: bucket.quotas,
            website_access: bucket.website.enabled,
            website_config: bucket.website.enabled.then(|| WebsiteConfig {
                index_document: bucket.website.index_document.clone(),
                error_document: bucket.website.error_document.clone(),
            }),
            objects: 0,
            bytes: 0,
        }
    }

    fn key_info(key: &StoredKey) -> KeyInfo {
        KeyInfo {
            access_key_id: key.id.clone(),
            name: key.name.clone(),
            secret_access_key: None,
            permissions: key.allow,
        }
    }

    fn alias_owner(&self, alias: &str) -> Option<&str> {
        self.buckets
            .values()
            .find(|b| b.aliases.iter().any(|a| a == alias))
            .map(|b| b.id.as_str())
    }

    fn fresh_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}{:024x}", self.next_id)
    }
}

/// In-memory administrative API.
#[derive(Default)]
pub struct MemoryAdminApi {
    state: Mutex<State>,
}

const MUTATING: &[&str] = &[
    "stage_layout",
    "apply_layout",
    "revert_layout",
    "create_bucket",
    "update_bucket",
    "add_bucket_alias",
    "remove_bucket_alias",
    "delete_bucket",
    "create_key",
    "update_key",
    "delete_key",
    "allow_key",
    "deny_key",
];

fn injected(method: &str, class: ErrorClass) -> AdminError {
    let status = match class {
        ErrorClass::Transient => 503,
        ErrorClass::Conflict => 409,
        ErrorClass::Fatal => 400,
    };
    AdminError::Status {
        method: "MEMORY".to_string(),
        path: method.to_string(),
        status,
        body: "injected fault".to_string(),
    }
}

fn rejected(method: &str, status: u16, body: String) -> AdminError {
    AdminError::Status {
        method: "MEMORY".to_string(),
        path: method.to_string(),
        status,
        body,
    }
}

fn not_found(method: &str, what: &str) -> AdminError {
    rejected(method, 404, format!("{what} not found"))
}

impl MemoryAdminApi {
    /// Empty cluster with layout version 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` calls to `method` fail with `class`.
    pub fn inject_fault(&self, method: &str, class: ErrorClass, times: usize) {
        let mut state = self.state.lock().unwrap();
        let queue = state.faults.entry(method.to_string()).or_default();
        for _ in 0..times {
            queue.push_back(class);
        }
    }

    /// Names of every call made so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Number of calls made so far.
    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }

    /// Number of calls that change cluster state.
    pub fn mutating_call_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| MUTATING.contains(&c.as_str()))
            .count()
    }

    /// Forget the call log.
    pub fn reset_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    /// Bucket id bound to a global alias.
    pub fn bucket_id(&self, alias: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .buckets
            .values()
            .find(|b| b.aliases.iter().any(|a| a == alias))
            .map(|b| b.id.clone())
    }

    /// Key id of the first key with this name.
    pub fn key_id(&self, name: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .keys
            .values()
            .find(|k| k.name == name)
            .map(|k| k.id.clone())
    }

    /// Permissions held by key `key_name` on bucket `alias`.
    pub fn permissions(&self, alias: &str, key_name: &str) -> Permissions {
        let bucket_id = self.bucket_id(alias);
        let key_id = self.key_id(key_name);
        let state = self.state.lock().unwrap();
        match (bucket_id, key_id) {
            (Some(b), Some(k)) => state
                .buckets
                .get(&b)
                .and_then(|bucket| bucket.grants.get(&k).copied())
                .unwrap_or_default(),
            _ => Permissions::default(),
        }
    }

    /// Quotas of bucket `alias`.
    pub fn quotas(&self, alias: &str) -> Option<BucketQuotas> {
        let bucket_id = self.bucket_id(alias)?;
        let state = self.state.lock().unwrap();
        state.buckets.get(&bucket_id).map(|b| b.quotas)
    }

    /// Website settings of bucket `alias`.
    pub fn website(&self, alias: &str) -> Option<WebsiteAccess> {
        let bucket_id = self.bucket_id(alias)?;
        let state = self.state.lock().unwrap();
        state.buckets.get(&bucket_id).map(|b| b.website.clone())
    }

    /// Global aliases of the bucket with this id.
    pub fn aliases(&self, bucket_id: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .buckets
            .get(bucket_id)
            .map(|b| b.aliases.clone())
            .unwrap_or_default()
    }

    /// Whether key `name` may create buckets.
    pub fn can_create_buckets(&self, name: &str) -> bool {
        let state = self.state.lock().unwrap();
        state
            .keys
            .values()
            .any(|k| k.name == name && k.allow.create_bucket)
    }

    /// Applied layout.
    pub fn layout(&self) -> ClusterLayout {
        self.state.lock().unwrap().layout.clone()
    }

    /// Number of buckets.
    pub fn bucket_count(&self) -> usize {
        self.state.lock().unwrap().buckets.len()
    }

    /// Number of keys.
    pub fn key_count(&self) -> usize {
        self.state.lock().unwrap().keys.len()
    }

    fn enter(&self, method: &str) -> AdminResult<std::sync::MutexGuard<'_, State>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(method.to_string());
        debug!(method, "memory admin call");
        if let Some(class) = state.faults.get_mut(method).and_then(|q| q.pop_front()) {
            return Err(injected(method, class));
        }
        Ok(state)
    }
}

#[async_trait]
impl AdminApi for MemoryAdminApi {
    async fn health(&self) -> AdminResult<HealthStatus> {
        self.enter("health")?;
        Ok(HealthStatus {
            status: "healthy".to_string(),
        })
    }

    async fn cluster_status(&self) -> AdminResult<ClusterStatus> {
        let state = self.enter("cluster_status")?;
        Ok(ClusterStatus {
            layout_version: state.layout.version,
            nodes: state
                .layout
                .roles
                .iter()
                .map(|r| NodeStatus {
                    id: r.id.clone(),
                    addr: None,
                    hostname: None,
                    is_up: true,
                })
                .collect(),
        })
    }

    async fn get_layout(&self) -> AdminResult<ClusterLayout> {
        let state = self.enter("get_layout")?;
        Ok(state.layout.clone())
    }

    async fn stage_layout(&self, changes: &[LayoutRole]) -> AdminResult<ClusterLayout> {
        let mut state = self.enter("stage_layout")?;
        for change in changes {
            state.layout.staged_role_changes.retain(|r| r.id != change.id);
            state.layout.staged_role_changes.push(change.clone());
        }
        Ok(state.layout.clone())
    }

    async fn apply_layout(&self, version: u64) -> AdminResult<ApplyLayoutResponse> {
        let mut state = self.enter("apply_layout")?;
        if version != state.layout.version + 1 {
            return Err(AdminError::Status {
                method: "MEMORY".to_string(),
                path: "apply_layout".to_string(),
                status: 400,
                body: format!(
                    "expected version {}, got {}",
                    state.layout.version + 1,
                    version
                ),
            });
        }
        let staged = std::mem::take(&mut state.layout.staged_role_changes);
        for change in staged {
            state.layout.roles.retain(|r| r.id != change.id);
            state.layout.roles.push(change);
        }
        state.layout.roles.sort_by(|a, b| a.id.cmp(&b.id));
        state.layout.version = version;
        Ok(ApplyLayoutResponse {
            message: vec![format!("layout version {version} applied")],
            layout: state.layout.clone(),
        })
    }

    async fn revert_layout(&self) -> AdminResult<()> {
        let mut state = self.enter("revert_layout")?;
        state.layout.staged_role_changes.clear();
        Ok(())
    }

    async fn list_buckets(&self) -> AdminResult<Vec<BucketListItem>> {
        let state = self.enter("list_buckets")?;
        Ok(state
            .buckets
            .values()
            .map(|b| BucketListItem {
                id: b.id.clone(),
                global_aliases: b.aliases.clone(),
            })
            .collect())
    }

    async fn get_bucket(&self, bucket_id: &str) -> AdminResult<BucketInfo> {
        let state = self.enter("get_bucket")?;
        let bucket = state
            .buckets
            .get(bucket_id)
            .ok_or_else(|| not_found("get_bucket", "bucket"))?;
        Ok(state.bucket_info(bucket))
    }

    async fn create_bucket(&self, global_alias: &str) -> AdminResult<BucketInfo> {
        let mut state = self.enter("create_bucket")?;
        if state.alias_owner(global_alias).is_some() {
            return Err(rejected(
                "create_bucket",
                409,
                format!("BucketAlreadyExists: {global_alias}"),
            ));
        }
        let id = state.fresh_id("b");
        let bucket = StoredBucket {
            id: id.clone(),
            aliases: vec![global_alias.to_string()],
            quotas: BucketQuotas::default(),
            website: WebsiteAccess::default(),
            grants: BTreeMap::new(),
        };
        let info = state.bucket_info(&bucket);
        state.buckets.insert(id, bucket);
        Ok(info)
    }

    async fn update_bucket(
        &self,
        bucket_id: &str,
        update: &UpdateBucketRequest,
    ) -> AdminResult<BucketInfo> {
        let mut state = self.enter("update_bucket")?;
        if let Some(website) = &update.website_access {
            if website.enabled && website.index_document.is_none() {
                return Err(rejected(
                    "update_bucket",
                    400,
                    "indexDocument required when website access is enabled".to_string(),
                ));
            }
        }
        let bucket = state
            .buckets
            .get_mut(bucket_id)
            .ok_or_else(|| not_found("update_bucket", "bucket"))?;
        if let Some(quotas) = update.quotas {
            bucket.quotas = quotas;
        }
        if let Some(website) = &update.website_access {
            bucket.website = website.normalized();
        }
        let bucket = bucket.clone();
        Ok(state.bucket_info(&bucket))
    }

    async fn add_bucket_alias(&self, bucket_id: &str, alias: &str) -> AdminResult<BucketInfo> {
        let mut state = self.enter("add_bucket_alias")?;
        match state.alias_owner(alias) {
            Some(owner) if owner != bucket_id => {
                return Err(rejected(
                    "add_bucket_alias",
                    409,
                    format!("BucketAlreadyExists: {alias}"),
                ))
            }
            _ => {}
        }
        let bucket = state
            .buckets
            .get_mut(bucket_id)
            .ok_or_else(|| not_found("add_bucket_alias", "bucket"))?;
        if !bucket.aliases.iter().any(|a| a == alias) {
            bucket.aliases.push(alias.to_string());
        }
        let bucket = bucket.clone();
        Ok(state.bucket_info(&bucket))
    }

    async fn remove_bucket_alias(
        &self,
        bucket_id: &str,
        alias: &str,
    ) -> AdminResult<BucketInfo> {
        let mut state = self.enter("remove_bucket_alias")?;
        let bucket = state
            .buckets
            .get_mut(bucket_id)
            .ok_or_else(|| not_found("remove_bucket_alias", "bucket"))?;
        if !bucket.aliases.iter().any(|a| a == alias) {
            return Err(not_found("remove_bucket_alias", "alias"));
        }
        if bucket.aliases.len() == 1 {
            return Err(rejected(
                "remove_bucket_alias",
                400,
                format!("cannot remove last alias {alias}"),
            ));
        }
        bucket.aliases.retain(|a| a != alias);
        let bucket = bucket.clone();
        Ok(state.bucket_info(&bucket))
    }

    async fn delete_bucket(&self, bucket_id: &str) -> AdminResult<()> {
        let mut state = self.enter("delete_bucket")?;
        state
            .buckets
            .remove(bucket_id)
            .map(|_| ())
            .ok_or_else(|| not_found("delete_bucket", "bucket"))
    }

    async fn list_keys(&self) -> AdminResult<Vec<KeyListItem>> {
        let state = self.enter("list_keys")?;
        Ok(state
            .keys
            .values()
            .map(|k| KeyListItem {
                id: k.id.clone(),
                name: k.name.clone(),
            })
            .collect())
    }

    async fn get_key(&self, key_id: &str) -> AdminResult<KeyInfo> {
        let state = self.enter("get_key")?;
        state
            .keys
            .get(key_id)
            .map(State::key_info)
            .ok_or_else(|| not_found("get_key", "key"))
    }

    async fn create_key(&self, name: &str) -> AdminResult<KeyInfo> {
        let mut state = self.enter("create_key")?;
        let id = state.fresh_id("GK");
        let key = StoredKey {
            id: id.clone(),
            name: name.to_string(),
            allow: KeyPermissions::default(),
        };
        let mut info = State::key_info(&key);
        info.secret_access_key = Some(SecretKey::new(uuid::Uuid::new_v4().simple().to_string()));
        state.keys.insert(id, key);
        Ok(info)
    }

    async fn update_key(&self, key_id: &str, update: &UpdateKeyRequest) -> AdminResult<KeyInfo> {
        let mut state = self.enter("update_key")?;
        let key = state
            .keys
            .get_mut(key_id)
            .ok_or_else(|| not_found("update_key", "key"))?;
        if let Some(name) = &update.name {
            key.name = name.clone();
        }
        if let Some(allow) = update.allow {
            key.allow.create_bucket |= allow.create_bucket;
        }
        if let Some(deny) = update.deny {
            key.allow.create_bucket &= !deny.create_bucket;
        }
        Ok(State::key_info(key))
    }

    async fn delete_key(&self, key_id: &str) -> AdminResult<()> {
        let mut state = self.enter("delete_key")?;
        state
            .keys
            .remove(key_id)
            .ok_or_else(|| not_found("delete_key", "key"))?;
        for bucket in state.buckets.values_mut() {
            bucket.grants.remove(key_id);
        }
        Ok(())
    }

    async fn allow_key(
        &self,
        bucket_id: &str,
        key_id: &str,
        permissions: Permissions,
    ) -> AdminResult<BucketInfo> {
        let mut state = self.enter("allow_key")?;
        if !state.keys.contains_key(key_id) {
            return Err(not_found("allow_key", "key"));
        }
        let bucket = state
            .buckets
            .get_mut(bucket_id)
            .ok_or_else(|| not_found("allow_key", "bucket"))?;
        let grant = bucket.grants.entry(key_id.to_string()).or_default();
        grant.read |= permissions.read;
        grant.write |= permissions.write;
        grant.owner |= permissions.owner;
        let bucket = bucket.clone();
        Ok(state.bucket_info(&bucket))
    }

    async fn deny_key(
        &self,
        bucket_id: &str,
        key_id: &str,
        permissions: Permissions,
    ) -> AdminResult<BucketInfo> {
        let mut state = self.enter("deny_key")?;
        let bucket = state
            .buckets
            .get_mut(bucket_id)
            .ok_or_else(|| not_found("deny_key", "bucket"))?;
        if let Some(grant) = bucket.grants.get_mut(key_id) {
            grant.read &= !permissions.read;
            grant.write &= !permissions.write;
            grant.owner &= !permissions.owner;
        }
        let bucket = bucket.clone();
        Ok(state.bucket_info(&bucket))
    }
}
