//! Typed client for the cluster's administrative HTTP API.
//!
//! One method per administrative resource. The client keeps only the
//! endpoint, the bearer token and an HTTP connection pool; it never retries
//! on its own. Retry policy belongs to the caller.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AdminError;

/// Result type for admin API calls.
pub type AdminResult<T> = std::result::Result<T, AdminError>;

const MAX_ERROR_BODY: usize = 512;

/// Secret access key material. Never printed by `Debug`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretKey(String);

impl SecretKey {
    /// Wrap a secret.
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// The raw secret. Callers must not log it.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretKey(***)")
    }
}

/// Key permissions on a bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Permissions {
    /// Read objects.
    pub read: bool,
    /// Write and delete objects.
    pub write: bool,
    /// Manage bucket settings.
    pub owner: bool,
}

impl Permissions {
    /// Read and write, not owner.
    pub const READ_WRITE: Permissions = Permissions {
        read: true,
        write: true,
        owner: false,
    };

    /// True if no flag is set.
    pub fn is_empty(&self) -> bool {
        !self.read && !self.write && !self.owner
    }

    /// Flags set in `self` but not in `other`.
    pub fn minus(&self, other: &Permissions) -> Permissions {
        Permissions {
            read: self.read && !other.read,
            write: self.write && !other.write,
            owner: self.owner && !other.owner,
        }
    }
}

impl std::fmt::Display for Permissions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut flags = Vec::new();
        if self.read {
            flags.push("read");
        }
        if self.write {
            flags.push("write");
        }
        if self.owner {
            flags.push("owner");
        }
        if flags.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", flags.join("+"))
        }
    }
}

/// Health check answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthStatus {
    /// Status string reported by the server.
    pub status: String,
}

/// One node as seen by the cluster status endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeStatus {
    /// Node identifier.
    pub id: String,
    /// RPC address, when known.
    pub addr: Option<String>,
    /// Hostname, when known.
    pub hostname: Option<String>,
    /// Whether the node answers.
    pub is_up: bool,
}

/// Cluster status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Current layout version.
    pub layout_version: u64,
    /// Known nodes.
    pub nodes: Vec<NodeStatus>,
}

/// A node's role in the layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LayoutRole {
    /// Node identifier.
    pub id: String,
    /// Zone the node lives in.
    pub zone: String,
    /// Storage capacity in bytes; `None` for a gateway node.
    pub capacity: Option<u64>,
    /// Free-form tags.
    pub tags: Vec<String>,
}

/// Cluster layout, applied and staged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClusterLayout {
    /// Applied layout version.
    pub version: u64,
    /// Applied roles.
    pub roles: Vec<LayoutRole>,
    /// Role changes staged but not yet applied.
    pub staged_role_changes: Vec<LayoutRole>,
}

/// Answer to a layout apply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplyLayoutResponse {
    /// Server messages describing the new assignment.
    pub message: Vec<String>,
    /// The layout after applying.
    pub layout: ClusterLayout,
}

/// A bucket in the bucket listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BucketListItem {
    /// Bucket identifier.
    pub id: String,
    /// Global aliases bound to the bucket.
    pub global_aliases: Vec<String>,
}

/// Bucket quotas; `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketQuotas {
    /// Maximum total size in bytes.
    pub max_size: Option<u64>,
    /// Maximum number of objects.
    pub max_objects: Option<u64>,
}

/// Static website hosting for a bucket, as sent on bucket update.
///
/// While `enabled` is false the documents carry no meaning; compare
/// settings through [`WebsiteAccess::normalized`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct WebsiteAccess {
    /// Serve the bucket as a website.
    pub enabled: bool,
    /// Document served for directory requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_document: Option<String>,
    /// Document served on errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_document: Option<String>,
}

impl WebsiteAccess {
    /// Website hosting on, with an index document.
    pub fn enabled(index_document: impl Into<String>) -> Self {
        Self {
            enabled: true,
            index_document: Some(index_document.into()),
            error_document: None,
        }
    }

    /// Disabled settings collapse to the default.
    pub fn normalized(&self) -> Self {
        if self.enabled {
            self.clone()
        } else {
            Self::default()
        }
    }
}

/// Website documents as reported by the bucket endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WebsiteConfig {
    /// Index document.
    pub index_document: Option<String>,
    /// Error document.
    pub error_document: Option<String>,
}

/// A key's access to a bucket, as reported by the bucket endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BucketKeyAccess {
    /// Access key identifier.
    pub access_key_id: String,
    /// Key name.
    pub name: String,
    /// Granted flags.
    pub permissions: Permissions,
}

/// Full bucket information.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BucketInfo {
    /// Bucket identifier.
    pub id: String,
    /// Global aliases bound to the bucket.
    pub global_aliases: Vec<String>,
    /// Keys with access to the bucket.
    pub keys: Vec<BucketKeyAccess>,
    /// Current quotas.
    pub quotas: BucketQuotas,
    /// Website hosting is on.
    pub website_access: bool,
    /// Website documents, when hosting is on.
    pub website_config: Option<WebsiteConfig>,
    /// Object count.
    pub objects: u64,
    /// Stored bytes.
    pub bytes: u64,
}

impl BucketInfo {
    /// Website settings in the shape used on update.
    pub fn website(&self) -> WebsiteAccess {
        let config = self.website_config.clone().unwrap_or_default();
        WebsiteAccess {
            enabled: self.website_access,
            index_document: config.index_document,
            error_document: config.error_document,
        }
        .normalized()
    }
}

/// A key in the key listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyListItem {
    /// Access key identifier.
    pub id: String,
    /// Key name.
    pub name: String,
}

/// Cluster-wide key permissions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KeyPermissions {
    /// May create buckets.
    pub create_bucket: bool,
}

/// Full key information.
///
/// `secret_access_key` is only present in the answer to key creation and
/// cannot be fetched again.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KeyInfo {
    /// Access key identifier.
    pub access_key_id: String,
    /// Key name.
    pub name: String,
    /// Secret, on creation only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_access_key: Option<SecretKey>,
    /// Cluster-wide permissions.
    pub permissions: KeyPermissions,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateBucketRequest<'a> {
    global_alias: &'a str,
}

/// Bucket settings update. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateBucketRequest {
    /// New website settings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website_access: Option<WebsiteAccess>,
    /// New quotas; a `None` limit inside means unlimited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quotas: Option<BucketQuotas>,
}

impl UpdateBucketRequest {
    /// Replace quotas only.
    pub fn quotas(quotas: BucketQuotas) -> Self {
        Self {
            quotas: Some(quotas),
            ..Self::default()
        }
    }

    /// Replace website settings only.
    pub fn website(website: WebsiteAccess) -> Self {
        Self {
            website_access: Some(website),
            ..Self::default()
        }
    }
}

#[derive(Debug, Serialize)]
struct CreateKeyRequest<'a> {
    name: &'a str,
}

/// Key update: rename, and flags to turn on (`allow`) or off (`deny`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpdateKeyRequest {
    /// New key name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Flags to set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow: Option<KeyPermissions>,
    /// Flags to clear.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deny: Option<KeyPermissions>,
}

impl UpdateKeyRequest {
    /// Allow or deny bucket creation.
    pub fn create_bucket(allowed: bool) -> Self {
        let flags = KeyPermissions {
            create_bucket: true,
        };
        if allowed {
            Self {
                allow: Some(flags),
                ..Self::default()
            }
        } else {
            Self {
                deny: Some(flags),
                ..Self::default()
            }
        }
    }

    /// Rename the key.
    pub fn rename(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BucketKeyRequest<'a> {
    access_key_id: &'a str,
    permissions: Permissions,
}

#[derive(Debug, Serialize)]
struct StagedRole<'a> {
    zone: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    capacity: Option<u64>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    tags: &'a [String],
}

#[derive(Debug, Serialize)]
struct ApplyLayoutRequest {
    version: u64,
}

/// The administrative operations the reconciler needs.
#[async_trait]
pub trait AdminApi: Send + Sync {
    /// Check liveness.
    async fn health(&self) -> AdminResult<HealthStatus>;
    /// Cluster status and node list.
    async fn cluster_status(&self) -> AdminResult<ClusterStatus>;
    /// Current layout, applied and staged.
    async fn get_layout(&self) -> AdminResult<ClusterLayout>;
    /// Stage role changes for the given nodes.
    async fn stage_layout(&self, changes: &[LayoutRole]) -> AdminResult<ClusterLayout>;
    /// Apply staged changes as layout `version`.
    async fn apply_layout(&self, version: u64) -> AdminResult<ApplyLayoutResponse>;
    /// Drop staged changes.
    async fn revert_layout(&self) -> AdminResult<()>;
    /// List buckets.
    async fn list_buckets(&self) -> AdminResult<Vec<BucketListItem>>;
    /// Get one bucket by identifier.
    async fn get_bucket(&self, bucket_id: &str) -> AdminResult<BucketInfo>;
    /// Create a bucket bound to a global alias.
    async fn create_bucket(&self, global_alias: &str) -> AdminResult<BucketInfo>;
    /// Change bucket settings: quotas, website hosting or both.
    async fn update_bucket(
        &self,
        bucket_id: &str,
        update: &UpdateBucketRequest,
    ) -> AdminResult<BucketInfo>;
    /// Bind another global alias to a bucket.
    async fn add_bucket_alias(&self, bucket_id: &str, alias: &str) -> AdminResult<BucketInfo>;
    /// Unbind a global alias from a bucket.
    async fn remove_bucket_alias(&self, bucket_id: &str, alias: &str)
        -> AdminResult<BucketInfo>;
    /// Delete an empty bucket.
    async fn delete_bucket(&self, bucket_id: &str) -> AdminResult<()>;
    /// List access keys.
    async fn list_keys(&self) -> AdminResult<Vec<KeyListItem>>;
    /// Get one key by access key identifier.
    async fn get_key(&self, key_id: &str) -> AdminResult<KeyInfo>;
    /// Create a key. The answer carries the secret, once.
    async fn create_key(&self, name: &str) -> AdminResult<KeyInfo>;
    /// Rename a key or change its cluster-wide permissions.
    async fn update_key(&self, key_id: &str, update: &UpdateKeyRequest) -> AdminResult<KeyInfo>;
    /// Delete a key.
    async fn delete_key(&self, key_id: &str) -> AdminResult<()>;
    /// Grant the flags set in `permissions` to a key on a bucket.
    async fn allow_key(
        &self,
        bucket_id: &str,
        key_id: &str,
        permissions: Permissions,
    ) -> AdminResult<BucketInfo>;
    /// Revoke the flags set in `permissions` from a key on a bucket.
    async fn deny_key(
        &self,
        bucket_id: &str,
        key_id: &str,
        permissions: Permissions,
    ) -> AdminResult<BucketInfo>;
}

/// [`AdminApi`] over HTTP with a bearer token.
#[derive(Clone)]
pub struct HttpAdminClient {
    endpoint: String,
    token: String,
    http: Client,
}

impl std::fmt::Debug for HttpAdminClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAdminClient")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl HttpAdminClient {
    /// Build a client for `endpoint` authenticating with `token`.
    ///
    /// `timeout` applies to every individual call.
    pub fn new(
        endpoint: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> AdminResult<Self> {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(AdminError::Config(format!(
                "endpoint must start with http:// or https://, got {endpoint}"
            )));
        }
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AdminError::Config(e.to_string()))?;
        Ok(Self {
            endpoint,
            token: token.into(),
            http,
        })
    }

    /// The endpoint this client talks to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> AdminResult<String> {
        let url = format!("{}{}", self.endpoint, path);
        debug!(method = %method, path, "admin request");

        let mut request = self
            .http
            .request(method.clone(), &url)
            .bearer_auth(&self.token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|source| AdminError::Transport {
            method: method.to_string(),
            path: path.to_string(),
            source,
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|source| AdminError::Transport {
            method: method.to_string(),
            path: path.to_string(),
            source,
        })?;

        if !status.is_success() {
            return Err(AdminError::Status {
                method: method.to_string(),
                path: path.to_string(),
                status: status.as_u16(),
                body: truncate(&text, MAX_ERROR_BODY),
            });
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(String::new());
        }
        Ok(text)
    }

    async fn call<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> AdminResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let text = self.send(method.clone(), path, body).await?;
        let text = if text.trim().is_empty() { "null" } else { text.as_str() };
        serde_json::from_str(text).map_err(|e| AdminError::Decode {
            method: method.to_string(),
            path: path.to_string(),
            reason: e.to_string(),
        })
    }

    async fn call_empty<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> AdminResult<()> {
        self.send(method, path, body).await.map(|_| ())
    }
}

fn segment(id: &str) -> String {
    urlencoding::encode(id).into_owned()
}

fn alias_path(bucket_id: &str, alias: &str) -> String {
    format!(
        "/v2/buckets/{}/aliases?alias={}&global=true",
        segment(bucket_id),
        urlencoding::encode(alias)
    )
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

const NO_BODY: Option<&()> = None;

#[async_trait]
impl AdminApi for HttpAdminClient {
    async fn health(&self) -> AdminResult<HealthStatus> {
        let text = self.send(Method::GET, "/health", NO_BODY).await?;
        // Some versions answer with plain text.
        Ok(serde_json::from_str(&text).unwrap_or_else(|_| HealthStatus {
            status: text.trim().to_string(),
        }))
    }

    async fn cluster_status(&self) -> AdminResult<ClusterStatus> {
        self.call(Method::GET, "/v2/cluster", NO_BODY).await
    }

    async fn get_layout(&self) -> AdminResult<ClusterLayout> {
        self.call(Method::GET, "/v2/layout", NO_BODY).await
    }

    async fn stage_layout(&self, changes: &[LayoutRole]) -> AdminResult<ClusterLayout> {
        let body: BTreeMap<&str, StagedRole<'_>> = changes
            .iter()
            .map(|role| {
                (
                    role.id.as_str(),
                    StagedRole {
                        zone: &role.zone,
                        capacity: role.capacity,
                        tags: &role.tags,
                    },
                )
            })
            .collect();
        self.call(Method::POST, "/v2/layout", Some(&body)).await
    }

    async fn apply_layout(&self, version: u64) -> AdminResult<ApplyLayoutResponse> {
        self.call(
            Method::POST,
            "/v2/layout/apply",
            Some(&ApplyLayoutRequest { version }),
        )
        .await
    }

    async fn revert_layout(&self) -> AdminResult<()> {
        self.call_empty(Method::POST, "/v2/layout/revert", NO_BODY).await
    }

    async fn list_buckets(&self) -> AdminResult<Vec<BucketListItem>> {
        self.call(Method::GET, "/v2/buckets", NO_BODY).await
    }

    async fn get_bucket(&self, bucket_id: &str) -> AdminResult<BucketInfo> {
        let path = format!("/v2/buckets/{}", segment(bucket_id));
        self.call(Method::GET, &path, NO_BODY).await
    }

    async fn create_bucket(&self, global_alias: &str) -> AdminResult<BucketInfo> {
        self.call(
            Method::POST,
            "/v2/buckets",
            Some(&CreateBucketRequest { global_alias }),
        )
        .await
    }

    async fn update_bucket(
        &self,
        bucket_id: &str,
        update: &UpdateBucketRequest,
    ) -> AdminResult<BucketInfo> {
        let path = format!("/v2/buckets/{}", segment(bucket_id));
        self.call(Method::PUT, &path, Some(update)).await
    }

    async fn add_bucket_alias(&self, bucket_id: &str, alias: &str) -> AdminResult<BucketInfo> {
        self.call(Method::PUT, &alias_path(bucket_id, alias), NO_BODY)
            .await
    }

    async fn remove_bucket_alias(
        &self,
        bucket_id: &str,
        alias: &str,
    ) -> AdminResult<BucketInfo> {
        self.call(Method::DELETE, &alias_path(bucket_id, alias), NO_BODY)
            .await
    }

    async fn delete_bucket(&self, bucket_id: &str) -> AdminResult<()> {
        let path = format!("/v2/buckets/{}", segment(bucket_id));
        self.call_empty(Method::DELETE, &path, NO_BODY).await
    }

    async fn list_keys(&self) -> AdminResult<Vec<KeyListItem>> {
        self.call(Method::GET, "/v2/keys", NO_BODY).await
    }

    async fn get_key(&self, key_id: &str) -> AdminResult<KeyInfo> {
        let path = format!("/v2/keys/{}", segment(key_id));
        self.call(Method::GET, &path, NO_BODY).await
    }

    async fn create_key(&self, name: &str) -> AdminResult<KeyInfo> {
        self.call(Method::POST, "/v2/keys", Some(&CreateKeyRequest { name }))
            .await
    }

    async fn update_key(&self, key_id: &str, update: &UpdateKeyRequest) -> AdminResult<KeyInfo> {
        let path = format!("/v2/keys/{}", segment(key_id));
        self.call(Method::POST, &path, Some(update)).await
    }

    async fn delete_key(&self, key_id: &str) -> AdminResult<()> {
        let path = format!("/v2/keys/{}", segment(key_id));
        self.call_empty(Method::DELETE, &path, NO_BODY).await
    }

    async fn allow_key(
        &self,
        bucket_id: &str,
        key_id: &str,
        permissions: Permissions,
    ) -> AdminResult<BucketInfo> {
        let path = format!("/v2/buckets/{}/allow_key", segment(bucket_id));
        let body = BucketKeyRequest {
            access_key_id: key_id,
            permissions,
        };
        self.call(Method::POST, &path, Some(&body)).await
    }

    async fn deny_key(
        &self,
        bucket_id: &str,
        key_id: &str,
        permissions: Permissions,
    ) -> AdminResult<BucketInfo> {
        let path = format!("/v2/buckets/{}/deny_key", segment(bucket_id));
        let body = BucketKeyRequest {
            access_key_id: key_id,
            permissions,
        };
        self.call(Method::POST, &path, Some(&body)).await
    }
}
