//! Reconciler scenarios against the in-memory admin API.

use std::sync::Arc;

use garagekit_core::{new_cancel_pair, CancelReason, ErrorClass};
use garagekit_reconcile::admin_client::{AdminApi, Permissions, UpdateKeyRequest};
use garagekit_reconcile::{
    BucketSpec, DesiredState, KeySpec, MemoryAdminApi, Operation, OperationOutcome, Reconciler,
    RunStatus, Stage,
};
use proptest::prelude::*;

use crate::harness::{fast_retry, reference_desired_state};

fn reconciler(api: &Arc<MemoryAdminApi>) -> Reconciler {
    Reconciler::new(api.clone()).with_retry(fast_retry())
}

fn position(ops: &[Operation], pred: impl Fn(&Operation) -> bool) -> usize {
    ops.iter().position(pred).expect("operation planned")
}

#[tokio::test]
async fn test_reference_state_converges_and_second_run_is_empty() {
    let api = Arc::new(MemoryAdminApi::new());
    let desired = reference_desired_state();

    let first = reconciler(&api).run(&desired).await;
    assert!(first.is_converged(), "{first}");
    assert_eq!(api.key_count(), 2);
    assert_eq!(api.bucket_count(), 2);
    assert_eq!(api.permissions("media", "app"), Permissions::READ_WRITE);
    let archive_app = api.permissions("archive", "app");
    assert!(archive_app.read && !archive_app.write && !archive_app.owner);
    assert!(api.permissions("archive", "backup").owner);
    assert_eq!(api.quotas("media").unwrap().max_size, Some(1u64 << 30));

    api.reset_calls();
    let second = reconciler(&api).run(&desired).await;
    assert!(second.is_converged());
    assert!(second.plan.is_empty(), "{:?}", second.plan);
    assert_eq!(api.mutating_call_count(), 0);
}

#[tokio::test]
async fn test_creates_come_before_grants() {
    let api = Arc::new(MemoryAdminApi::new());
    let report = reconciler(&api).dry_run(&reference_desired_state()).await;
    let ops = report.plan.operations();

    let create_backup = position(ops, |op| {
        matches!(op, Operation::CreateKey { name, .. } if name == "backup")
    });
    let create_archive = position(ops, |op| {
        matches!(op, Operation::CreateBucket { alias } if alias == "archive")
    });
    let grant_backup = position(ops, |op| {
        matches!(op, Operation::GrantPermission { key, bucket, .. } if key == "backup" && bucket == "archive")
    });
    let quota = position(ops, |op| matches!(op, Operation::SetQuota { .. }));
    let create_media = position(ops, |op| {
        matches!(op, Operation::CreateBucket { alias } if alias == "media")
    });

    assert!(create_backup < grant_backup);
    assert!(create_archive < grant_backup);
    assert!(create_media < quota);
}

#[tokio::test]
async fn test_invalid_document_makes_zero_calls() {
    let api = Arc::new(MemoryAdminApi::new());
    let desired = DesiredState::from_yaml_str(
        "keys: [app]\nbuckets:\n  - name: media\n    keys: [app, ghost]\n  - name: media\n",
    )
    .unwrap();

    let report = reconciler(&api).run(&desired).await;
    assert_eq!(report.status, RunStatus::Failed);
    let failure = report.failure.unwrap();
    assert_eq!(failure.stage, Stage::Validate);
    assert!(failure.error.contains("ghost"));
    assert!(failure.error.contains("media"));
    assert_eq!(api.call_count(), 0);
}

#[tokio::test]
async fn test_partial_failure_then_resume() {
    let api = Arc::new(MemoryAdminApi::new());
    api.inject_fault("allow_key", ErrorClass::Fatal, 1);
    let desired = reference_desired_state();

    let failed = reconciler(&api).run(&desired).await;
    assert_eq!(failed.status, RunStatus::Failed);
    let failure = failed.failure.as_ref().unwrap();
    assert_eq!(failure.stage, Stage::Apply);
    assert_eq!(failure.class, ErrorClass::Fatal);
    assert_eq!(failure.operation.as_ref().unwrap().kind(), "grant_permission");
    assert!(failed.applied.len() < failed.plan.len());
    assert!(failed
        .applied
        .iter()
        .all(|a| a.operation.kind() != "grant_permission"));
    assert_eq!(api.key_count(), 2);

    let resumed = reconciler(&api).run(&desired).await;
    assert!(resumed.is_converged(), "{resumed}");
    assert!(resumed.created_keys.is_empty());
    assert!(resumed.created_buckets.is_empty());
    assert_eq!(api.key_count(), 2);
    assert_eq!(api.permissions("media", "app"), Permissions::READ_WRITE);
}

#[tokio::test]
async fn test_transient_faults_are_absorbed() {
    let api = Arc::new(MemoryAdminApi::new());
    api.inject_fault("create_bucket", ErrorClass::Transient, 2);
    api.inject_fault("list_keys", ErrorClass::Transient, 1);

    let report = reconciler(&api).run(&reference_desired_state()).await;
    assert!(report.is_converged(), "{report}");
    let bucket_attempts = report
        .applied
        .iter()
        .find(|a| a.operation.kind() == "create_bucket")
        .map(|a| a.attempts);
    assert_eq!(bucket_attempts, Some(3));
}

#[tokio::test]
async fn test_grant_conflict_is_tolerated_and_next_run_repairs() {
    let api = Arc::new(MemoryAdminApi::new());
    api.inject_fault("allow_key", ErrorClass::Conflict, 1);
    let desired = reference_desired_state();

    let report = reconciler(&api).run(&desired).await;
    assert!(report.is_converged(), "{report}");
    assert!(report
        .applied
        .iter()
        .any(|a| a.outcome == OperationOutcome::AlreadySatisfied));

    let repair = reconciler(&api).run(&desired).await;
    assert!(repair.is_converged());
    assert_eq!(repair.plan.len(), 1);
    assert_eq!(repair.plan.operations()[0].kind(), "grant_permission");
}

#[tokio::test]
async fn test_out_of_band_drift_is_repaired() {
    let api = Arc::new(MemoryAdminApi::new());
    let desired = reference_desired_state();
    assert!(reconciler(&api).run(&desired).await.is_converged());

    let media = api.bucket_id("media").unwrap();
    let archive = api.bucket_id("archive").unwrap();
    let app = api.key_id("app").unwrap();
    let write = Permissions {
        write: true,
        ..Permissions::default()
    };
    api.deny_key(&media, &app, write).await.unwrap();
    api.allow_key(&archive, &app, write).await.unwrap();

    let report = reconciler(&api).run(&desired).await;
    assert!(report.is_converged(), "{report}");
    let kinds: Vec<_> = report.plan.iter().map(Operation::kind).collect();
    assert!(kinds.contains(&"grant_permission"));
    assert!(kinds.contains(&"revoke_permission"));
    assert_eq!(api.permissions("media", "app"), Permissions::READ_WRITE);
    assert!(!api.permissions("archive", "app").write);
}

#[tokio::test]
async fn test_quota_change_is_absolute() {
    let api = Arc::new(MemoryAdminApi::new());
    let mut desired = reference_desired_state();
    assert!(reconciler(&api).run(&desired).await.is_converged());

    desired.buckets[0].quota.as_mut().unwrap().max_size = Some(2u64 << 30);
    let report = reconciler(&api).run(&desired).await;
    assert!(report.is_converged());
    assert_eq!(report.plan.len(), 1);
    assert_eq!(api.quotas("media").unwrap().max_size, Some(2u64 << 30));

    api.reset_calls();
    let again = reconciler(&api).run(&desired).await;
    assert!(again.plan.is_empty());
    assert_eq!(api.mutating_call_count(), 0);
}

#[tokio::test]
async fn test_cancel_before_apply_changes_nothing() {
    let api = Arc::new(MemoryAdminApi::new());
    let (token, handle) = new_cancel_pair();
    handle.cancel(CancelReason::Interrupted);

    let report = reconciler(&api)
        .with_cancel(token)
        .run(&reference_desired_state())
        .await;
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.cancelled, Some(CancelReason::Interrupted));
    assert!(report.applied.is_empty());
    assert_eq!(api.mutating_call_count(), 0);
}

#[tokio::test]
async fn test_website_document_converges() {
    let api = Arc::new(MemoryAdminApi::new());
    let desired = DesiredState::from_yaml_str(
        "keys: [app]\nbuckets:\n  - name: site\n    keys: [app]\n    websiteAccess: {enabled: true, indexDocument: index.html}",
    )
    .unwrap();

    let report = reconciler(&api).run(&desired).await;
    assert!(report.is_converged(), "{report}");
    assert_eq!(
        report.plan.operations().last().map(Operation::kind),
        Some("set_website")
    );
    let website = api.website("site").unwrap();
    assert!(website.enabled);
    assert_eq!(website.index_document.as_deref(), Some("index.html"));

    api.reset_calls();
    let again = reconciler(&api).run(&desired).await;
    assert!(again.plan.is_empty(), "{:?}", again.plan);
    assert_eq!(api.mutating_call_count(), 0);
}

#[tokio::test]
async fn test_extra_alias_and_renamed_key() {
    let api = Arc::new(MemoryAdminApi::new());
    let desired = reference_desired_state();
    assert!(reconciler(&api).run(&desired).await.is_converged());

    let media = api.bucket_id("media").unwrap();
    api.add_bucket_alias(&media, "media-cdn").await.unwrap();
    let again = reconciler(&api).run(&desired).await;
    assert!(again.plan.is_empty(), "{:?}", again.plan);
    assert_eq!(api.bucket_count(), 2);

    // a renamed key no longer matches its declared name and is recreated
    let app = api.key_id("app").unwrap();
    api.update_key(&app, &UpdateKeyRequest::rename("app-old"))
        .await
        .unwrap();
    let report = reconciler(&api).run(&desired).await;
    assert!(report.is_converged(), "{report}");
    assert_eq!(report.created_keys.len(), 1);
    assert_eq!(api.key_count(), 3);
}

fn desired_from(keys: &[usize], grants: &[(usize, usize)]) -> DesiredState {
    let mut desired = DesiredState::default();
    for k in keys {
        desired.keys.push(KeySpec::named(format!("key{k}")));
    }
    for b in 0..3 {
        let mut bucket = BucketSpec::named(format!("bucket{b}"));
        for (gb, gk) in grants {
            if *gb == b && keys.contains(gk) {
                bucket.keys.insert(format!("key{gk}"));
            }
        }
        desired.buckets.push(bucket);
    }
    desired
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn any_valid_state_converges_in_one_run(
        keys in proptest::collection::btree_set(0usize..4, 0..4),
        grants in proptest::collection::vec((0usize..3, 0usize..4), 0..8),
    ) {
        let keys: Vec<usize> = keys.into_iter().collect();
        let desired = desired_from(&keys, &grants);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let api = Arc::new(MemoryAdminApi::new());
            let first = reconciler(&api).run(&desired).await;
            prop_assert!(first.is_converged());
            api.reset_calls();
            let second = reconciler(&api).run(&desired).await;
            prop_assert!(second.plan.is_empty());
            prop_assert_eq!(api.mutating_call_count(), 0);
            Ok(())
        })?;
    }
}
