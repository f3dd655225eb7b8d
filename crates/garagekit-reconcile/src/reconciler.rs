//! Reconciliation run: validate, fetch, plan, apply, report.
//!
//! Operations are applied one at a time in plan order. A conflict means the
//! change is already in place; transient failures are retried; a fatal error
//! or an exhausted retry budget stops the run, and the report lists what was
//! applied before it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use garagekit_core::{
    CancelReason, CancelToken, Classify, ErrorClass, RetryConfig, RetryExecutor,
};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::admin_client::{AdminApi, SecretKey, UpdateBucketRequest, UpdateKeyRequest};
use crate::cluster_state::{retried, ClusterState};
use crate::desired::DesiredState;
use crate::error::{DesiredStateError, ReconcileError};
use crate::plan::{Operation, ReconciliationPlan};

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The cluster matches the desired state (or would, for a dry run).
    Converged,
    /// The run stopped early.
    Failed,
}

/// Stage a run failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Desired state validation.
    Validate,
    /// Reading cluster state.
    Fetch,
    /// Applying operations.
    Apply,
}

/// How an operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationOutcome {
    /// The change was made.
    Applied,
    /// The cluster reported the change as already made.
    AlreadySatisfied,
}

/// An operation that completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedOperation {
    /// The operation.
    pub operation: Operation,
    /// How it ended.
    pub outcome: OperationOutcome,
    /// Calls made, retries included.
    pub attempts: u32,
}

/// Why a run failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunFailure {
    /// Stage that failed.
    pub stage: Stage,
    /// Operation being applied, if any.
    pub operation: Option<Operation>,
    /// Class of the error.
    pub class: ErrorClass,
    /// Error message.
    pub error: String,
}

/// A key created by this run. The secret is only ever returned here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedKey {
    /// Key name.
    pub name: String,
    /// Access key id.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: Option<SecretKey>,
}

/// A bucket created by this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedBucket {
    /// Global alias.
    pub alias: String,
    /// Bucket id.
    pub id: String,
}

/// Outcome of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Terminal state.
    pub status: RunStatus,
    /// True if no mutating call was made on purpose.
    pub dry_run: bool,
    /// The computed plan.
    pub plan: ReconciliationPlan,
    /// Operations completed, in order.
    pub applied: Vec<AppliedOperation>,
    /// Failure cause, if the run failed.
    pub failure: Option<RunFailure>,
    /// Keys created, with their secrets.
    pub created_keys: Vec<CreatedKey>,
    /// Buckets created.
    pub created_buckets: Vec<CreatedBucket>,
    /// Set if the run was cancelled.
    pub cancelled: Option<CancelReason>,
}

impl ReconcileReport {
    fn new(dry_run: bool) -> Self {
        Self {
            status: RunStatus::Converged,
            dry_run,
            plan: ReconciliationPlan::default(),
            applied: Vec::new(),
            failure: None,
            created_keys: Vec::new(),
            created_buckets: Vec::new(),
            cancelled: None,
        }
    }

    /// Report for a desired state that failed to load or validate.
    pub fn rejected(dry_run: bool, err: DesiredStateError) -> Self {
        let mut report = Self::new(dry_run);
        report.fail(Stage::Validate, None, &ReconcileError::from(err));
        report
    }

    fn fail(&mut self, stage: Stage, operation: Option<Operation>, err: &ReconcileError) {
        self.status = RunStatus::Failed;
        self.failure = Some(RunFailure {
            stage,
            operation,
            class: err.class(),
            error: err.to_string(),
        });
    }

    /// True if the run converged.
    pub fn is_converged(&self) -> bool {
        self.status == RunStatus::Converged
    }
}

impl fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self.status {
            RunStatus::Converged => "converged",
            RunStatus::Failed => "failed",
        };
        if self.dry_run {
            writeln!(f, "dry run: {} operation(s) planned", self.plan.len())?;
            for op in &self.plan {
                writeln!(f, "  - {op}")?;
            }
        } else {
            writeln!(
                f,
                "{status}: {}/{} operation(s) applied",
                self.applied.len(),
                self.plan.len()
            )?;
            for done in &self.applied {
                let note = match done.outcome {
                    OperationOutcome::Applied => "",
                    OperationOutcome::AlreadySatisfied => " (already satisfied)",
                };
                writeln!(f, "  + {}{note}", done.operation)?;
            }
        }
        for key in &self.created_keys {
            writeln!(f, "created key {} ({})", key.name, key.access_key_id)?;
            if let Some(secret) = &key.secret_access_key {
                writeln!(f, "  secret: {}", secret.expose())?;
            }
        }
        for bucket in &self.created_buckets {
            writeln!(f, "created bucket {} ({})", bucket.alias, bucket.id)?;
        }
        if let Some(reason) = self.cancelled {
            writeln!(f, "cancelled: {reason}")?;
        }
        if let Some(failure) = &self.failure {
            write!(f, "error during {:?} ({}): {}", failure.stage, failure.class, failure.error)?;
            if let Some(op) = &failure.operation {
                write!(f, " while applying '{op}'")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Name and alias to id mapping, grown as keys and buckets are created.
#[derive(Debug, Default)]
struct Resolver {
    keys: HashMap<String, String>,
    buckets: HashMap<String, String>,
}

impl Resolver {
    fn from_state(state: &ClusterState) -> Self {
        Self {
            keys: state
                .keys
                .iter()
                .map(|(name, k)| (name.clone(), k.id.clone()))
                .collect(),
            buckets: state
                .buckets
                .iter()
                .map(|(alias, b)| (alias.clone(), b.id.clone()))
                .collect(),
        }
    }

    fn key(&self, name: &str) -> Result<String, ReconcileError> {
        self.keys
            .get(name)
            .cloned()
            .ok_or_else(|| ReconcileError::Unresolved {
                kind: "key",
                name: name.to_string(),
            })
    }

    fn bucket(&self, alias: &str) -> Result<String, ReconcileError> {
        self.buckets
            .get(alias)
            .cloned()
            .ok_or_else(|| ReconcileError::Unresolved {
                kind: "bucket",
                name: alias.to_string(),
            })
    }
}

/// Drives one cluster towards a desired state.
pub struct Reconciler {
    api: Arc<dyn AdminApi>,
    retry: RetryExecutor,
    cancel: CancelToken,
}

impl Reconciler {
    /// Reconciler with the default retry policy and no cancellation.
    pub fn new(api: Arc<dyn AdminApi>) -> Self {
        Self {
            api,
            retry: RetryExecutor::default(),
            cancel: CancelToken::never(),
        }
    }

    /// Use `config` for every remote call.
    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = RetryExecutor::new(config);
        self
    }

    /// Stop between operations once `token` is cancelled.
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Validate, fetch and plan without changing anything.
    pub async fn dry_run(&self, desired: &DesiredState) -> ReconcileReport {
        let mut report = ReconcileReport::new(true);
        if let Some(state) = self.prepare(desired, &mut report).await {
            report.plan = ReconciliationPlan::build(desired, &state);
            info!(operations = report.plan.len(), "dry run planned");
        }
        report
    }

    /// Converge the cluster with `desired`.
    pub async fn run(&self, desired: &DesiredState) -> ReconcileReport {
        let mut report = ReconcileReport::new(false);
        let Some(state) = self.prepare(desired, &mut report).await else {
            return report;
        };
        report.plan = ReconciliationPlan::build(desired, &state);
        info!(operations = report.plan.len(), "plan computed");

        let mut resolver = Resolver::from_state(&state);
        let plan = report.plan.clone();
        for op in &plan {
            if let Err(cancelled) = self.cancel.check() {
                warn!(reason = %cancelled.0, applied = report.applied.len(), "run cancelled");
                report.status = RunStatus::Failed;
                report.cancelled = Some(cancelled.0);
                return report;
            }
            match self.apply(op, &mut resolver, &mut report).await {
                Ok((outcome, attempts)) => {
                    info!(operation = %op, ?outcome, attempts, "operation done");
                    report.applied.push(AppliedOperation {
                        operation: op.clone(),
                        outcome,
                        attempts,
                    });
                }
                Err(err) => {
                    error!(operation = %op, error = %err, "operation failed, stopping run");
                    report.fail(Stage::Apply, Some(op.clone()), &err);
                    return report;
                }
            }
        }

        info!(applied = report.applied.len(), "cluster converged");
        report
    }

    async fn prepare(
        &self,
        desired: &DesiredState,
        report: &mut ReconcileReport,
    ) -> Option<ClusterState> {
        if let Err(err) = desired.validate() {
            error!(error = %err, "desired state rejected");
            *report = ReconcileReport::rejected(report.dry_run, err);
            return None;
        }
        match ClusterState::fetch(self.api.as_ref(), &self.retry, desired).await {
            Ok(state) => Some(state),
            Err(err) => {
                error!(error = %err, "cannot read cluster state");
                report.fail(Stage::Fetch, None, &err);
                None
            }
        }
    }

    async fn apply(
        &self,
        op: &Operation,
        resolver: &mut Resolver,
        report: &mut ReconcileReport,
    ) -> Result<(OperationOutcome, u32), ReconcileError> {
        let api = self.api.as_ref();
        let retry = &self.retry;
        let what = op.to_string();

        match op {
            Operation::CreateKey { name } => {
                let (key_id, outcome, attempts) =
                    match retried(retry, &what, || api.create_key(name)).await {
                        Ok((info, attempts)) => {
                            report.created_keys.push(CreatedKey {
                                name: name.clone(),
                                access_key_id: info.access_key_id.clone(),
                                secret_access_key: info.secret_access_key,
                            });
                            (info.access_key_id, OperationOutcome::Applied, attempts)
                        }
                        Err(err) if err.is_conflict() => {
                            let (keys, attempts) =
                                retried(retry, "list_keys", || api.list_keys()).await?;
                            let id = keys
                                .into_iter()
                                .find(|k| &k.name == name)
                                .map(|k| k.id)
                                .ok_or_else(|| ReconcileError::Unresolved {
                                    kind: "key",
                                    name: name.clone(),
                                })?;
                            (id, OperationOutcome::AlreadySatisfied, attempts + 1)
                        }
                        Err(err) => return Err(err),
                    };
                resolver.keys.insert(name.clone(), key_id);
                Ok((outcome, attempts))
            }
            Operation::UpdateKey {
                name,
                allow_create_bucket,
            } => {
                let key_id = resolver.key(name)?;
                let update = UpdateKeyRequest::create_bucket(*allow_create_bucket);
                tolerate_conflict(retried(retry, &what, || api.update_key(&key_id, &update)).await)
            }
            Operation::CreateBucket { alias } => {
                match retried(retry, &what, || api.create_bucket(alias)).await {
                    Ok((info, attempts)) => {
                        report.created_buckets.push(CreatedBucket {
                            alias: alias.clone(),
                            id: info.id.clone(),
                        });
                        resolver.buckets.insert(alias.clone(), info.id);
                        Ok((OperationOutcome::Applied, attempts))
                    }
                    Err(err) if err.is_conflict() => {
                        let (buckets, attempts) =
                            retried(retry, "list_buckets", || api.list_buckets()).await?;
                        let id = buckets
                            .into_iter()
                            .find(|b| b.global_aliases.iter().any(|a| a == alias))
                            .map(|b| b.id)
                            .ok_or_else(|| ReconcileError::Unresolved {
                                kind: "bucket",
                                name: alias.clone(),
                            })?;
                        resolver.buckets.insert(alias.clone(), id);
                        Ok((OperationOutcome::AlreadySatisfied, attempts + 1))
                    }
                    Err(err) => Err(err),
                }
            }
            Operation::ApplyLayout {
                changes,
                version,
                commit,
            } => {
                let mut attempts = 0;
                if !changes.is_empty() {
                    let (_, n) =
                        retried(retry, "stage_layout", || api.stage_layout(changes)).await?;
                    attempts += n;
                }
                if *commit {
                    let (outcome, n) = tolerate_conflict(
                        retried(retry, "apply_layout", || api.apply_layout(*version)).await,
                    )?;
                    if outcome == OperationOutcome::AlreadySatisfied && changes.is_empty() {
                        return Ok((outcome, attempts + n));
                    }
                    attempts += n;
                }
                Ok((OperationOutcome::Applied, attempts))
            }
            Operation::GrantPermission {
                bucket,
                key,
                permissions,
            } => {
                let bucket_id = resolver.bucket(bucket)?;
                let key_id = resolver.key(key)?;
                tolerate_conflict(
                    retried(retry, &what, || {
                        api.allow_key(&bucket_id, &key_id, *permissions)
                    })
                    .await,
                )
            }
            Operation::RevokePermission {
                bucket,
                key,
                permissions,
            } => {
                let bucket_id = resolver.bucket(bucket)?;
                let key_id = resolver.key(key)?;
                tolerate_conflict(
                    retried(retry, &what, || {
                        api.deny_key(&bucket_id, &key_id, *permissions)
                    })
                    .await,
                )
            }
            Operation::SetQuota { bucket, quota } => {
                let bucket_id = resolver.bucket(bucket)?;
                let update = UpdateBucketRequest::quotas(*quota);
                tolerate_conflict(
                    retried(retry, &what, || api.update_bucket(&bucket_id, &update)).await,
                )
            }
            Operation::SetWebsite { bucket, website } => {
                let bucket_id = resolver.bucket(bucket)?;
                let update = UpdateBucketRequest::website(website.clone());
                tolerate_conflict(
                    retried(retry, &what, || api.update_bucket(&bucket_id, &update)).await,
                )
            }
        }
    }
}

fn tolerate_conflict<T>(
    result: Result<(T, u32), ReconcileError>,
) -> Result<(OperationOutcome, u32), ReconcileError> {
    match result {
        Ok((_, attempts)) => Ok((OperationOutcome::Applied, attempts)),
        Err(ReconcileError::Call {
            attempts, source, ..
        }) if source.class() == ErrorClass::Conflict => {
            Ok((OperationOutcome::AlreadySatisfied, attempts))
        }
        Err(err) => Err(err),
    }
}
