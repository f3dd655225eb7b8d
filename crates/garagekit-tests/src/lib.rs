//! garagekit end-to-end scenarios
//!
//! Cross-crate runs of the reconciler and the backup engine against the
//! in-memory admin API and object store. The shared setup lives in
//! [`harness`]; the scenarios themselves are test-only modules.

pub mod harness;

#[cfg(test)]
mod backup_scenarios;
#[cfg(test)]
mod reconcile_scenarios;

pub use harness::{fast_retry, reference_desired_state, seeded_store, TestEnv};
