//! S3-compatible object access.
//!
//! [`ObjectStore`] is the narrow surface the backup engine, sync and the
//! connectivity suite need: bucket listing, paged object listing, and whole
//! object get/put/head/delete. [`S3ObjectStore`] implements it over
//! `aws-sdk-s3` with path-style addressing and static credentials.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region, SharedCredentialsProvider};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::{Client, Config};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use garagekit_core::{ErrorClass, RetryExecutor, RetryOutcome};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::S3Settings;
use crate::error::{StoreError, StoreResult};

/// Default content type when the store reports none.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// One entry of a listing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSummary {
    /// Object key.
    pub key: String,
    /// Size in bytes.
    pub size: u64,
    /// Entity tag, without quotes.
    pub etag: Option<String>,
    /// Last modification time.
    pub last_modified: Option<DateTime<Utc>>,
}

/// One page of a bucket listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    /// Objects in key order.
    pub objects: Vec<ObjectSummary>,
    /// Cursor for the next page; `None` on the last page.
    pub next_cursor: Option<String>,
}

/// Object content with the attributes that travel with it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectData {
    /// Content.
    pub body: Bytes,
    /// Content type.
    pub content_type: Option<String>,
    /// User metadata (`x-amz-meta-*`).
    pub metadata: BTreeMap<String, String>,
    /// Entity tag, without quotes. Ignored on put.
    pub etag: Option<String>,
}

impl ObjectData {
    /// Content with no type or metadata.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }
}

/// Attributes returned by a HEAD.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectHead {
    /// Size in bytes.
    pub size: u64,
    /// Entity tag, without quotes.
    pub etag: Option<String>,
    /// Content type.
    pub content_type: Option<String>,
    /// User metadata.
    pub metadata: BTreeMap<String, String>,
}

/// S3-compatible object operations.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Names of every bucket visible to the credentials.
    async fn list_buckets(&self) -> StoreResult<Vec<String>>;

    /// True if `bucket` exists and is reachable.
    async fn bucket_exists(&self, bucket: &str) -> StoreResult<bool>;

    /// One page of keys under `prefix`, starting after `cursor`.
    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        cursor: Option<&str>,
        max_keys: usize,
    ) -> StoreResult<ListPage>;

    /// Whole object with its attributes.
    ///
    /// The body is buffered in memory; callers bound how many bodies are
    /// held at once.
    async fn get_object(&self, bucket: &str, key: &str) -> StoreResult<ObjectData>;

    /// Store an object; returns the new entity tag.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        object: ObjectData,
    ) -> StoreResult<Option<String>>;

    /// Attributes, or `None` if the object does not exist.
    async fn head_object(&self, bucket: &str, key: &str) -> StoreResult<Option<ObjectHead>>;

    /// Delete an object. Deleting a missing object succeeds.
    async fn delete_object(&self, bucket: &str, key: &str) -> StoreResult<()>;
}

/// `sha256:<hex>` of `bytes`.
pub fn content_digest(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

fn trim_etag(etag: Option<&str>) -> Option<String> {
    etag.map(|e| e.trim_matches('"').to_string())
}

/// [`ObjectStore`] over the AWS SDK.
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    endpoint: String,
    timeout: Duration,
}

impl std::fmt::Debug for S3ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3ObjectStore")
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl S3ObjectStore {
    /// Build a client from connection settings.
    pub fn new(settings: &S3Settings) -> StoreResult<Self> {
        let (Some(access_key), Some(secret_key)) = (&settings.access_key, &settings.secret_key)
        else {
            return Err(StoreError::Config(
                "access key and secret key are required".to_string(),
            ));
        };
        let endpoint = settings.endpoint_url();
        let creds = Credentials::new(access_key, secret_key, None, None, "garagekit");
        let config = Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()))
            .endpoint_url(&endpoint)
            .force_path_style(true)
            .credentials_provider(SharedCredentialsProvider::new(creds))
            .build();
        Ok(Self {
            client: Client::from_conf(config),
            endpoint,
            timeout: Duration::from_secs(settings.timeout_secs),
        })
    }

    /// Endpoint URL in use.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn timed<T, E, F>(&self, op: &'static str, target: &str, call: F) -> StoreResult<T>
    where
        F: Future<Output = Result<T, SdkError<E>>>,
        E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    {
        debug!(op, target, "object store call");
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(sdk_error(op, target, err)),
            Err(_) => Err(StoreError::Timeout {
                op,
                target: target.to_string(),
                secs: self.timeout.as_secs(),
            }),
        }
    }
}

fn sdk_error<E>(op: &'static str, target: &str, err: SdkError<E>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let message = DisplayErrorContext(&err).to_string();
    let target = target.to_string();
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StoreError::Remote {
                op,
                target,
                status: None,
                class: ErrorClass::Transient,
                message,
            }
        }
        SdkError::ServiceError(service) => {
            let status = service.raw().status().as_u16();
            let code = err.code().unwrap_or_default();
            if status == 404 || matches!(code, "NoSuchKey" | "NoSuchBucket" | "NotFound") {
                return StoreError::NotFound { op, target };
            }
            let class = match code {
                "SlowDown" | "Throttling" | "RequestTimeout" | "InternalError" => {
                    ErrorClass::Transient
                }
                _ => ErrorClass::from_status(status),
            };
            StoreError::Remote {
                op,
                target,
                status: Some(status),
                class,
                message,
            }
        }
        _ => StoreError::Remote {
            op,
            target,
            status: None,
            class: ErrorClass::Fatal,
            message,
        },
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn list_buckets(&self) -> StoreResult<Vec<String>> {
        let out = self
            .timed("list_buckets", "", self.client.list_buckets().send())
            .await?;
        Ok(out
            .buckets()
            .iter()
            .filter_map(|b| b.name().map(str::to_string))
            .collect())
    }

    async fn bucket_exists(&self, bucket: &str) -> StoreResult<bool> {
        match self
            .timed(
                "head_bucket",
                bucket,
                self.client.head_bucket().bucket(bucket).send(),
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        cursor: Option<&str>,
        max_keys: usize,
    ) -> StoreResult<ListPage> {
        let mut request = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .max_keys(i32::try_from(max_keys).unwrap_or(i32::MAX));
        if !prefix.is_empty() {
            request = request.prefix(prefix);
        }
        if let Some(cursor) = cursor {
            request = request.continuation_token(cursor);
        }
        let out = self.timed("list_objects", bucket, request.send()).await?;
        let objects = out
            .contents()
            .iter()
            .filter_map(|o| {
                Some(ObjectSummary {
                    key: o.key()?.to_string(),
                    size: o.size().unwrap_or_default().max(0) as u64,
                    etag: trim_etag(o.e_tag()),
                    last_modified: o
                        .last_modified()
                        .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos())),
                })
            })
            .collect();
        let next_cursor = if out.is_truncated().unwrap_or(false) {
            out.next_continuation_token().map(str::to_string)
        } else {
            None
        };
        Ok(ListPage {
            objects,
            next_cursor,
        })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> StoreResult<ObjectData> {
        let target = format!("{bucket}/{key}");
        let out = self
            .timed(
                "get_object",
                &target,
                self.client.get_object().bucket(bucket).key(key).send(),
            )
            .await?;
        let content_type = out.content_type().map(str::to_string);
        let metadata = out
            .metadata()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        let etag = trim_etag(out.e_tag());
        // the whole body, under the per-call timeout
        let body = match tokio::time::timeout(self.timeout, out.body.collect()).await {
            Ok(Ok(aggregated)) => aggregated.into_bytes(),
            Ok(Err(e)) => {
                return Err(StoreError::Remote {
                    op: "get_object",
                    target,
                    status: None,
                    class: ErrorClass::Transient,
                    message: e.to_string(),
                })
            }
            Err(_) => {
                return Err(StoreError::Timeout {
                    op: "get_object",
                    target,
                    secs: self.timeout.as_secs(),
                })
            }
        };
        Ok(ObjectData {
            body,
            content_type,
            metadata,
            etag,
        })
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        object: ObjectData,
    ) -> StoreResult<Option<String>> {
        let target = format!("{bucket}/{key}");
        let metadata = if object.metadata.is_empty() {
            None
        } else {
            Some(object.metadata.into_iter().collect())
        };
        let request = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(object.body))
            .set_content_type(object.content_type)
            .set_metadata(metadata);
        let out = self.timed("put_object", &target, request.send()).await?;
        Ok(trim_etag(out.e_tag()))
    }

    async fn head_object(&self, bucket: &str, key: &str) -> StoreResult<Option<ObjectHead>> {
        let target = format!("{bucket}/{key}");
        let result = self
            .timed(
                "head_object",
                &target,
                self.client.head_object().bucket(bucket).key(key).send(),
            )
            .await;
        match result {
            Ok(out) => Ok(Some(ObjectHead {
                size: out.content_length().unwrap_or_default().max(0) as u64,
                etag: trim_etag(out.e_tag()),
                content_type: out.content_type().map(str::to_string),
                metadata: out
                    .metadata()
                    .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                    .unwrap_or_default(),
            })),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> StoreResult<()> {
        let target = format!("{bucket}/{key}");
        match self
            .timed(
                "delete_object",
                &target,
                self.client.delete_object().bucket(bucket).key(key).send(),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Default page size for listings.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Lazy, restartable walk over every key under a prefix.
///
/// Each page is fetched under the retry policy. The cursor only moves after
/// a page has been returned, so calling [`next_page`](Self::next_page) again
/// after an error resumes from the last good position.
pub struct ObjectLister {
    store: Arc<dyn ObjectStore>,
    retry: RetryExecutor,
    bucket: String,
    prefix: String,
    page_size: usize,
    cursor: Option<String>,
    done: bool,
    pages: u64,
}

impl ObjectLister {
    /// Lister over `bucket` starting at the first key under `prefix`.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        retry: RetryExecutor,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            retry,
            bucket: bucket.into(),
            prefix: prefix.into(),
            page_size: DEFAULT_PAGE_SIZE,
            cursor: None,
            done: false,
            pages: 0,
        }
    }

    /// Keys requested per page.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Cursor of the next page; `None` before the first page.
    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    /// Pages returned so far.
    pub fn pages(&self) -> u64 {
        self.pages
    }

    /// The next page, or `None` when the listing is complete.
    pub async fn next_page(&mut self) -> StoreResult<Option<Vec<ObjectSummary>>> {
        if self.done {
            return Ok(None);
        }
        let store = &self.store;
        let bucket = self.bucket.as_str();
        let prefix = self.prefix.as_str();
        let cursor = self.cursor.as_deref();
        let page_size = self.page_size;
        let outcome = self
            .retry
            .execute("list_objects", || {
                store.list_page(bucket, prefix, cursor, page_size)
            })
            .await;
        let page = match outcome {
            RetryOutcome::Success(page) => page,
            RetryOutcome::Exhausted { last_error, .. } => return Err(last_error),
        };
        self.pages += 1;
        match page.next_cursor {
            Some(next) => self.cursor = Some(next),
            None => self.done = true,
        }
        debug!(
            bucket = %self.bucket,
            page = self.pages,
            objects = page.objects.len(),
            "listed page"
        );
        Ok(Some(page.objects))
    }

    /// Drain the whole listing.
    pub async fn collect_all(mut self) -> StoreResult<Vec<ObjectSummary>> {
        let mut all = Vec::new();
        while let Some(page) = self.next_page().await? {
            all.extend(page);
        }
        Ok(all)
    }
}
