#![warn(missing_docs)]

//! garagekit data plane: S3 object access, bucket backups (archives and directories), bucket sync and connectivity checks

pub mod archive;
pub mod backup;
pub mod cli;
pub mod config;
pub mod connectivity;
pub mod directory;
pub mod error;
pub mod manifest;
pub mod memory;
pub mod object_store;
pub mod sync;

pub use backup::{
    BackupEngine, BackupFormat, DriftReport, ExportOptions, ExportReport, FailedObject,
    ImportOptions, ImportReport, Progress, ProgressFn,
};
pub use config::{DataSettings, S3Settings};
pub use connectivity::{run_connectivity_suite, ConnectivityReport, StepResult};
pub use error::{BackupError, StoreError, StoreResult};
pub use manifest::{BackupManifest, ManifestEntry};
pub use memory::MemoryObjectStore;
pub use object_store::{
    content_digest, ObjectData, ObjectHead, ObjectLister, ObjectStore, ObjectSummary,
    S3ObjectStore,
};
pub use sync::{SyncOptions, SyncReport};
