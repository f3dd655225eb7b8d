//! Connectivity suite: a short round trip through every object operation.

use std::time::Instant;

use bytes::Bytes;
use serde::Serialize;
use tracing::{info, warn};

use crate::object_store::{ObjectData, ObjectStore};

/// Content written by the put step.
pub const TEST_DATA: &[u8] = b"Hello from Garage Bootstrap connectivity test!";

/// One step of the suite.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    /// Step name.
    pub name: String,
    /// Step outcome.
    pub passed: bool,
    /// Failure description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall time spent.
    pub duration_ms: u64,
}

/// Outcome of the whole suite.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectivityReport {
    /// Endpoint tested.
    pub endpoint: String,
    /// Bucket tested.
    pub bucket: String,
    /// Key written and removed by the suite.
    pub test_key: String,
    /// Steps in execution order.
    pub steps: Vec<StepResult>,
    /// Every step passed.
    pub success: bool,
}

impl std::fmt::Display for ConnectivityReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Connectivity test against {} (bucket {})", self.endpoint, self.bucket)?;
        for step in &self.steps {
            let mark = if step.passed { "PASS" } else { "FAIL" };
            write!(f, "  [{mark}] {} ({} ms)", step.name, step.duration_ms)?;
            if let Some(error) = &step.error {
                write!(f, ": {error}")?;
            }
            writeln!(f)?;
        }
        let passed = self.steps.iter().filter(|s| s.passed).count();
        writeln!(
            f,
            "{}: {passed}/{} steps passed",
            if self.success { "OK" } else { "FAILED" },
            self.steps.len()
        )
    }
}

struct Steps {
    steps: Vec<StepResult>,
}

impl Steps {
    fn record(&mut self, name: &str, started: Instant, outcome: Result<(), String>) {
        let duration_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            Ok(()) => info!(step = name, duration_ms, "passed"),
            Err(e) => warn!(step = name, error = %e, "failed"),
        }
        self.steps.push(StepResult {
            name: name.to_string(),
            passed: outcome.is_ok(),
            error: outcome.err(),
            duration_ms,
        });
    }
}

/// Run the suite against `bucket` with a fresh test key.
///
/// Every step runs even if an earlier one failed, so one run shows all the
/// problems at once. The test key is deleted by the last step.
pub async fn run_connectivity_suite(
    store: &dyn ObjectStore,
    endpoint: &str,
    bucket: &str,
) -> ConnectivityReport {
    let test_key = format!("connectivity-test-{}.txt", uuid::Uuid::new_v4());
    let mut steps = Steps { steps: Vec::new() };

    let started = Instant::now();
    let outcome = match store.bucket_exists(bucket).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(format!("bucket {bucket} does not exist")),
        Err(e) => Err(e.to_string()),
    };
    steps.record("bucket_exists", started, outcome);

    let started = Instant::now();
    let object = ObjectData {
        body: Bytes::from_static(TEST_DATA),
        content_type: Some("text/plain".to_string()),
        ..ObjectData::default()
    };
    let outcome = store
        .put_object(bucket, &test_key, object)
        .await
        .map(|_| ())
        .map_err(|e| e.to_string());
    steps.record("put_object", started, outcome);

    let started = Instant::now();
    let outcome = match store.get_object(bucket, &test_key).await {
        Ok(object) if object.body.as_ref() == TEST_DATA => Ok(()),
        Ok(object) => Err(format!(
            "content mismatch: read {} bytes, expected {}",
            object.body.len(),
            TEST_DATA.len()
        )),
        Err(e) => Err(e.to_string()),
    };
    steps.record("get_object", started, outcome);

    let started = Instant::now();
    let outcome = match store.list_page(bucket, &test_key, None, 10).await {
        Ok(page) if page.objects.iter().any(|o| o.key == test_key) => Ok(()),
        Ok(_) => Err(format!("{test_key} not in listing")),
        Err(e) => Err(e.to_string()),
    };
    steps.record("list_objects", started, outcome);

    let started = Instant::now();
    let outcome = store
        .delete_object(bucket, &test_key)
        .await
        .map_err(|e| e.to_string());
    steps.record("delete_object", started, outcome);

    let success = steps.steps.iter().all(|s| s.passed);
    ConnectivityReport {
        endpoint: endpoint.to_string(),
        bucket: bucket.to_string(),
        test_key,
        steps: steps.steps,
        success,
    }
}
