//! In-memory [`ObjectStore`] for tests.
//!
//! Buckets are ordered maps, so listings come back in key order like S3.
//! Calls are counted per method, and faults can be injected per method or
//! per key.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use garagekit_core::ErrorClass;

use crate::error::{StoreError, StoreResult};
use crate::object_store::{
    content_digest, ListPage, ObjectData, ObjectHead, ObjectStore, ObjectSummary,
};

#[derive(Debug, Default)]
struct State {
    buckets: BTreeMap<String, BTreeMap<String, ObjectData>>,
    calls: Vec<String>,
    faults: HashMap<String, VecDeque<ErrorClass>>,
    key_faults: HashMap<(String, String), VecDeque<ErrorClass>>,
}

impl State {
    fn enter(&mut self, method: &str, key: Option<&str>) -> StoreResult<()> {
        self.calls.push(method.to_string());
        let class = match key {
            Some(key) => self
                .key_faults
                .get_mut(&(method.to_string(), key.to_string()))
                .and_then(VecDeque::pop_front),
            None => None,
        }
        .or_else(|| self.faults.get_mut(method).and_then(VecDeque::pop_front));
        match class {
            Some(class) => Err(StoreError::Remote {
                op: "memory",
                target: key.unwrap_or(method).to_string(),
                status: Some(match class {
                    ErrorClass::Transient => 503,
                    ErrorClass::Conflict => 409,
                    ErrorClass::Fatal => 400,
                }),
                class,
                message: format!("injected fault in {method}"),
            }),
            None => Ok(()),
        }
    }

    fn bucket(&self, op: &'static str, bucket: &str) -> StoreResult<&BTreeMap<String, ObjectData>> {
        self.buckets.get(bucket).ok_or_else(|| StoreError::NotFound {
            op,
            target: bucket.to_string(),
        })
    }
}

/// In-memory object store.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    state: Mutex<State>,
}

impl MemoryObjectStore {
    /// Store with no buckets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty bucket; no-op if it exists.
    pub fn create_bucket(&self, bucket: &str) {
        self.state
            .lock()
            .unwrap()
            .buckets
            .entry(bucket.to_string())
            .or_default();
    }

    /// Put an object directly, bypassing counters and faults.
    pub fn insert(&self, bucket: &str, key: &str, mut object: ObjectData) {
        object.etag = Some(etag_of(&object));
        self.state
            .lock()
            .unwrap()
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), object);
    }

    /// Stored object, if any.
    pub fn object(&self, bucket: &str, key: &str) -> Option<ObjectData> {
        self.state
            .lock()
            .unwrap()
            .buckets
            .get(bucket)
            .and_then(|b| b.get(key))
            .cloned()
    }

    /// Keys in `bucket`, in order.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .buckets
            .get(bucket)
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Make the next `times` calls to `method` fail with `class`.
    pub fn inject_fault(&self, method: &str, class: ErrorClass, times: usize) {
        let mut state = self.state.lock().unwrap();
        let queue = state.faults.entry(method.to_string()).or_default();
        queue.extend(std::iter::repeat(class).take(times));
    }

    /// Make the next `times` calls to `method` on `key` fail with `class`.
    pub fn inject_key_fault(&self, method: &str, key: &str, class: ErrorClass, times: usize) {
        let mut state = self.state.lock().unwrap();
        let queue = state
            .key_faults
            .entry((method.to_string(), key.to_string()))
            .or_default();
        queue.extend(std::iter::repeat(class).take(times));
    }

    /// Every method called so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Calls made to `method`.
    pub fn call_count(&self, method: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.as_str() == method)
            .count()
    }

    /// Forget the call log.
    pub fn reset_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }
}

fn etag_of(object: &ObjectData) -> String {
    let digest = content_digest(&object.body);
    digest
        .strip_prefix("sha256:")
        .unwrap_or(&digest)
        .chars()
        .take(32)
        .collect()
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list_buckets(&self) -> StoreResult<Vec<String>> {
        let mut state = self.state.lock().unwrap();
        state.enter("list_buckets", None)?;
        Ok(state.buckets.keys().cloned().collect())
    }

    async fn bucket_exists(&self, bucket: &str) -> StoreResult<bool> {
        let mut state = self.state.lock().unwrap();
        state.enter("bucket_exists", None)?;
        Ok(state.buckets.contains_key(bucket))
    }

    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        cursor: Option<&str>,
        max_keys: usize,
    ) -> StoreResult<ListPage> {
        let mut state = self.state.lock().unwrap();
        state.enter("list_page", None)?;
        let objects = state.bucket("list_objects", bucket)?;
        let mut page: Vec<ObjectSummary> = objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .filter(|(k, _)| cursor.map_or(true, |c| k.as_str() > c))
            .take(max_keys.max(1) + 1)
            .map(|(k, o)| ObjectSummary {
                key: k.clone(),
                size: o.body.len() as u64,
                etag: o.etag.clone(),
                last_modified: None,
            })
            .collect();
        let next_cursor = if page.len() > max_keys.max(1) {
            page.pop();
            page.last().map(|o| o.key.clone())
        } else {
            None
        };
        Ok(ListPage {
            objects: page,
            next_cursor,
        })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> StoreResult<ObjectData> {
        let mut state = self.state.lock().unwrap();
        state.enter("get_object", Some(key))?;
        state
            .bucket("get_object", bucket)?
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                op: "get_object",
                target: format!("{bucket}/{key}"),
            })
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        mut object: ObjectData,
    ) -> StoreResult<Option<String>> {
        let mut state = self.state.lock().unwrap();
        state.enter("put_object", Some(key))?;
        let objects = state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| StoreError::NotFound {
                op: "put_object",
                target: bucket.to_string(),
            })?;
        let etag = etag_of(&object);
        object.etag = Some(etag.clone());
        objects.insert(key.to_string(), object);
        Ok(Some(etag))
    }

    async fn head_object(&self, bucket: &str, key: &str) -> StoreResult<Option<ObjectHead>> {
        let mut state = self.state.lock().unwrap();
        state.enter("head_object", Some(key))?;
        Ok(state.bucket("head_object", bucket)?.get(key).map(|o| ObjectHead {
            size: o.body.len() as u64,
            etag: o.etag.clone(),
            content_type: o.content_type.clone(),
            metadata: o.metadata.clone(),
        }))
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        state.enter("delete_object", Some(key))?;
        if let Some(objects) = state.buckets.get_mut(bucket) {
            objects.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pagination_by_cursor() {
        let store = MemoryObjectStore::new();
        for key in ["a", "b", "c"] {
            store.insert("bkt", key, ObjectData::new(key.as_bytes().to_vec()));
        }
        let first = store.list_page("bkt", "", None, 2).await.unwrap();
        assert_eq!(first.objects.len(), 2);
        assert_eq!(first.next_cursor.as_deref(), Some("b"));
        let second = store.list_page("bkt", "", Some("b"), 2).await.unwrap();
        assert_eq!(second.objects.len(), 1);
        assert_eq!(second.objects[0].key, "c");
        assert!(second.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_missing_bucket_is_not_found() {
        let store = MemoryObjectStore::new();
        let err = store.list_page("nope", "", None, 10).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!store.bucket_exists("nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_put_sets_etag_and_head_reports_it() {
        let store = MemoryObjectStore::new();
        store.create_bucket("bkt");
        let etag = store
            .put_object("bkt", "k", ObjectData::new("hello"))
            .await
            .unwrap();
        let head = store.head_object("bkt", "k").await.unwrap().unwrap();
        assert_eq!(head.etag, etag);
        assert_eq!(head.size, 5);
        assert!(store.head_object("bkt", "other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_key_fault_only_hits_that_key() {
        let store = MemoryObjectStore::new();
        store.insert("bkt", "good", ObjectData::new("1"));
        store.insert("bkt", "bad", ObjectData::new("2"));
        store.inject_key_fault("get_object", "bad", ErrorClass::Fatal, 1);
        assert!(store.get_object("bkt", "good").await.is_ok());
        assert!(store.get_object("bkt", "bad").await.is_err());
        assert!(store.get_object("bkt", "bad").await.is_ok());
        assert_eq!(store.call_count("get_object"), 3);
    }
}
