#![warn(missing_docs)]

//! garagekit reconciler: converge a Garage cluster with a declared desired state

pub mod admin_client;
pub mod cli;
pub mod cluster_state;
pub mod config;
pub mod desired;
pub mod error;
pub mod memory;
pub mod plan;
pub mod ready;
pub mod reconciler;

pub use admin_client::{
    AdminApi, HttpAdminClient, Permissions, UpdateBucketRequest, UpdateKeyRequest, WebsiteAccess,
};
pub use cluster_state::ClusterState;
pub use config::AdminSettings;
pub use desired::{BucketSpec, DesiredState, KeySpec, LayoutNodeSpec, QuotaSpec};
pub use error::{AdminError, DesiredStateError, ReconcileError};
pub use memory::MemoryAdminApi;
pub use plan::{Operation, ReconciliationPlan};
pub use ready::wait_for_ready;
pub use reconciler::{OperationOutcome, ReconcileReport, Reconciler, RunStatus, Stage};
