//! Wait for the admin API to answer its health check.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::admin_client::{AdminApi, HealthStatus};
use crate::error::ReconcileError;

/// Poll `health` every `interval` until it succeeds or `timeout` elapses.
pub async fn wait_for_ready(
    api: &dyn AdminApi,
    timeout: Duration,
    interval: Duration,
) -> Result<HealthStatus, ReconcileError> {
    let start = Instant::now();
    let deadline = start + timeout;
    let mut polls = 0u32;
    loop {
        polls += 1;
        match api.health().await {
            Ok(status) => {
                info!(polls, status = %status.status, "cluster is ready");
                return Ok(status);
            }
            Err(e) => {
                debug!(polls, error = %e, "cluster not ready yet");
                if Instant::now() + interval > deadline {
                    return Err(ReconcileError::NotReady {
                        waited_secs: start.elapsed().as_secs(),
                        last_error: e.to_string(),
                    });
                }
            }
        }
        tokio::time::sleep(interval).await;
    }
}
