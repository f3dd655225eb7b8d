//! Command lines of the `gk-data` and `gk-connectivity` binaries.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use garagekit_core::CancelToken;
use serde::Serialize;
use tracing::{error, info};

use crate::backup::{
    BackupEngine, BackupFormat, DriftReport, ExportOptions, ExportReport, ImportOptions,
    ImportReport, Progress,
};
use crate::config::{DataSettings, S3Settings};
use crate::connectivity::{run_connectivity_suite, ConnectivityReport};
use crate::error::BackupError;
use crate::object_store::{ObjectStore, S3ObjectStore};
use crate::sync::{SyncOptions, SyncReport};

/// Exit status: everything succeeded.
pub const EXIT_OK: u8 = 0;
/// Exit status: some object failed or the run aborted.
pub const EXIT_FAILED: u8 = 1;
/// Exit status: bad arguments or settings.
pub const EXIT_USAGE: u8 = 2;

/// Report format on stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human readable summary.
    Text,
    /// The full report as JSON.
    Json,
}

/// Command line of `gk-data`.
#[derive(Parser, Debug)]
#[command(name = "gk-data")]
#[command(about = "Back up, restore and sync Garage bucket contents", long_about = None)]
pub struct DataCli {
    /// S3 endpoint, host:port or URL [default: localhost:3900]
    #[arg(short, long, global = true, env = "GARAGE_S3_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Access key id
    #[arg(long, global = true, env = "GARAGE_ACCESS_KEY")]
    pub access_key: Option<String>,

    /// Secret access key
    #[arg(long, global = true, env = "GARAGE_SECRET_KEY", hide_env_values = true)]
    pub secret_key: Option<String>,

    /// Signing region [default: garage]
    #[arg(long, global = true)]
    pub region: Option<String>,

    /// Use https when the endpoint has no scheme
    #[arg(long, global = true)]
    pub secure: bool,

    /// Concurrent object transfers
    #[arg(short, long, global = true)]
    pub workers: Option<usize>,

    /// Settings file (.toml or .json)
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    /// Report format
    #[arg(id = "report_format", long = "output", value_name = "OUTPUT", global = true, value_enum, default_value_t = OutputFormat::Text)]
    pub output: OutputFormat,

    /// Log progress after every object
    #[arg(long, global = true)]
    pub progress: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// `gk-data` subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Write a bucket to an archive or a directory
    Export {
        /// Source bucket
        bucket: String,
        /// Archive file (.tar.gz) or directory to create
        output: PathBuf,
        /// Only keys starting with this prefix
        #[arg(long, default_value = "")]
        prefix: String,
        /// Container to write
        #[arg(long, value_enum, default_value_t = BackupFormat::Archive)]
        format: BackupFormat,
        /// Refuse objects larger than this many bytes
        #[arg(long)]
        max_object_size: Option<u64>,
    },
    /// Restore an archive or directory export into a bucket
    Import {
        /// Target bucket
        bucket: String,
        /// Archive file or export directory to read
        input: PathBuf,
        /// Prepend this to every restored key
        #[arg(long, default_value = "")]
        key_prefix: String,
        /// Skip keys that already exist
        #[arg(long)]
        no_overwrite: bool,
        /// Delete keys the archive does not contain
        #[arg(long)]
        mirror: bool,
        /// Stop after the first failed object
        #[arg(long)]
        stop_on_error: bool,
    },
    /// Compare a backup with a live bucket
    Verify {
        /// Bucket to check
        bucket: String,
        /// Archive file or export directory to compare with
        input: PathBuf,
    },
    /// Copy changed objects from one bucket to another
    Sync {
        /// Source bucket
        source: String,
        /// Destination bucket
        dest: String,
        /// Only keys starting with this prefix
        #[arg(long, default_value = "")]
        prefix: String,
        /// Delete destination keys missing from the source
        #[arg(long)]
        delete_orphans: bool,
    },
    /// List buckets visible to the credentials
    ListBuckets,
}

/// Result of one `gk-data` command.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum CommandReport {
    /// `export`
    Export(ExportReport),
    /// `import`
    Import(ImportReport),
    /// `verify`
    Verify(DriftReport),
    /// `sync`
    Sync(SyncReport),
    /// `list-buckets`
    ListBuckets {
        /// Bucket names.
        buckets: Vec<String>,
    },
}

impl CommandReport {
    /// Nothing failed and nothing was cancelled.
    pub fn is_success(&self) -> bool {
        match self {
            CommandReport::Export(r) => r.is_success(),
            CommandReport::Import(r) => r.is_success(),
            CommandReport::Verify(r) => r.is_clean(),
            CommandReport::Sync(r) => r.is_success(),
            CommandReport::ListBuckets { .. } => true,
        }
    }
}

fn write_failures(f: &mut fmt::Formatter<'_>, failed: &[crate::backup::FailedObject]) -> fmt::Result {
    for failure in failed {
        writeln!(f, "  failed {} ({}): {}", failure.key, failure.class, failure.error)?;
    }
    Ok(())
}

impl fmt::Display for CommandReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandReport::Export(r) => {
                writeln!(
                    f,
                    "exported {} objects ({} bytes) from {} to {}",
                    r.exported, r.total_size, r.bucket, r.archive
                )?;
                write_failures(f, &r.failed)?;
                if r.cancelled {
                    writeln!(f, "cancelled: backup is incomplete (no manifest)")?;
                }
            }
            CommandReport::Import(r) => {
                writeln!(
                    f,
                    "imported {} objects into {} ({} skipped, {} deleted, {} failed)",
                    r.imported.len(),
                    r.bucket,
                    r.skipped.len(),
                    r.deleted.len(),
                    r.failed.len()
                )?;
                write_failures(f, &r.failed)?;
                if !r.abandoned.is_empty() {
                    writeln!(f, "  {} objects not attempted", r.abandoned.len())?;
                }
                if r.stopped_early {
                    writeln!(f, "stopped after the first failure")?;
                }
                if r.cancelled {
                    writeln!(f, "cancelled")?;
                }
            }
            CommandReport::Verify(r) => {
                writeln!(
                    f,
                    "{}: {} matching, {} drifted, {} missing",
                    r.bucket,
                    r.matching.len(),
                    r.drifted.len(),
                    r.missing.len()
                )?;
                for key in &r.drifted {
                    writeln!(f, "  drifted {key}")?;
                }
                for key in &r.missing {
                    writeln!(f, "  missing {key}")?;
                }
                write_failures(f, &r.failed)?;
            }
            CommandReport::Sync(r) => {
                writeln!(
                    f,
                    "{} -> {}: {} copied, {} unchanged, {} deleted, {} failed",
                    r.source,
                    r.dest,
                    r.copied.len(),
                    r.skipped.len(),
                    r.deleted.len(),
                    r.failed.len()
                )?;
                write_failures(f, &r.failed)?;
            }
            CommandReport::ListBuckets { buckets } => {
                for bucket in buckets {
                    writeln!(f, "{bucket}")?;
                }
            }
        }
        Ok(())
    }
}

fn print_report<T: Serialize + fmt::Display>(output: OutputFormat, report: &T) -> Result<()> {
    match output {
        OutputFormat::Text => print!("{report}"),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}

impl DataCli {
    /// Run and return the process exit status.
    pub async fn run(self, cancel: CancelToken) -> Result<u8> {
        let settings = self.settings()?;
        let store = S3ObjectStore::new(&settings.s3)
            .context("pass --access-key/--secret-key or set GARAGE_ACCESS_KEY/GARAGE_SECRET_KEY")?;
        info!(endpoint = %store.endpoint(), "connected");

        match self.execute(Arc::new(store), &settings, cancel).await {
            Ok(report) => {
                print_report(self.output, &report)?;
                Ok(if report.is_success() { EXIT_OK } else { EXIT_FAILED })
            }
            Err(e) => {
                error!(error = %e, "run aborted");
                eprintln!("{e}");
                Ok(EXIT_FAILED)
            }
        }
    }

    /// Settings file, then flag and environment overrides.
    pub fn settings(&self) -> Result<DataSettings> {
        let mut settings = match &self.settings {
            Some(path) => DataSettings::from_file(path)
                .with_context(|| format!("cannot load settings from {}", path.display()))?,
            None => DataSettings::default(),
        };
        if let Some(endpoint) = &self.endpoint {
            settings.s3.endpoint = endpoint.clone();
        }
        if let Some(key) = &self.access_key {
            settings.s3.access_key = Some(key.clone());
        }
        if let Some(secret) = &self.secret_key {
            settings.s3.secret_key = Some(secret.clone());
        }
        if let Some(region) = &self.region {
            settings.s3.region = region.clone();
        }
        if self.secure {
            settings.s3.secure = true;
        }
        if let Some(workers) = self.workers {
            settings.workers = workers;
        }
        Ok(settings)
    }

    /// Run the subcommand against `store`.
    pub async fn execute(
        &self,
        store: Arc<dyn ObjectStore>,
        settings: &DataSettings,
        cancel: CancelToken,
    ) -> std::result::Result<CommandReport, BackupError> {
        let mut engine = BackupEngine::new(store.clone())
            .with_retry(settings.retry.clone())
            .with_cancel(cancel);
        if self.progress {
            engine = engine.with_progress(Arc::new(|p: Progress| {
                info!(done = p.done, total = ?p.total, "progress");
            }));
        }
        Ok(match &self.command {
            Command::Export {
                bucket,
                output,
                prefix,
                format,
                max_object_size,
            } => {
                let options = ExportOptions {
                    prefix: prefix.clone(),
                    workers: settings.workers,
                    page_size: settings.page_size,
                    format: *format,
                    max_object_size: *max_object_size,
                };
                CommandReport::Export(engine.export(bucket, output, &options).await?)
            }
            Command::Import {
                bucket,
                input,
                key_prefix,
                no_overwrite,
                mirror,
                stop_on_error,
            } => {
                let options = ImportOptions {
                    overwrite: !no_overwrite,
                    stop_on_error: *stop_on_error,
                    mirror: *mirror,
                    workers: settings.workers,
                    key_prefix: key_prefix.clone(),
                };
                CommandReport::Import(engine.import(bucket, input, &options).await?)
            }
            Command::Verify { bucket, input } => {
                CommandReport::Verify(engine.verify(bucket, input).await?)
            }
            Command::Sync {
                source,
                dest,
                prefix,
                delete_orphans,
            } => {
                let options = SyncOptions {
                    prefix: prefix.clone(),
                    delete_orphans: *delete_orphans,
                    workers: settings.workers,
                };
                CommandReport::Sync(engine.sync(source, dest, &options).await?)
            }
            Command::ListBuckets => CommandReport::ListBuckets {
                buckets: store
                    .list_buckets()
                    .await
                    .map_err(|source| BackupError::Listing {
                        bucket: String::from("*"),
                        source,
                    })?,
            },
        })
    }
}

/// Command line of `gk-connectivity`.
#[derive(Parser, Debug)]
#[command(name = "gk-connectivity")]
#[command(about = "Check that an S3 endpoint serves a bucket end to end", long_about = None)]
pub struct ConnectivityCli {
    /// S3 endpoint, host:port or URL
    #[arg(short, long, env = "GARAGE_S3_ENDPOINT", default_value = "localhost:3900")]
    pub endpoint: String,

    /// Access key id
    #[arg(long, env = "TEST_ACCESS_KEY")]
    pub access_key: Option<String>,

    /// Secret access key
    #[arg(long, env = "TEST_SECRET_KEY", hide_env_values = true)]
    pub secret_key: Option<String>,

    /// Bucket to test against
    #[arg(short, long, env = "TEST_BUCKET", default_value = "test-bucket")]
    pub bucket: String,

    /// Signing region
    #[arg(long, env = "TEST_REGION", default_value = "garage")]
    pub region: String,

    /// Use https when the endpoint has no scheme
    #[arg(long, env = "TEST_SECURE")]
    pub secure: bool,

    /// Per-call timeout in seconds
    #[arg(long, default_value_t = 30)]
    pub timeout: u64,

    /// Report format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub output: OutputFormat,

    /// Debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl ConnectivityCli {
    /// Connection settings from the flags.
    pub fn s3_settings(&self) -> S3Settings {
        S3Settings {
            endpoint: self.endpoint.clone(),
            access_key: self.access_key.clone(),
            secret_key: self.secret_key.clone(),
            region: self.region.clone(),
            secure: self.secure,
            timeout_secs: self.timeout,
        }
    }

    /// Run the suite and return the process exit status.
    pub async fn run(self) -> Result<u8> {
        let settings = self.s3_settings();
        let store = S3ObjectStore::new(&settings)
            .context("pass --access-key/--secret-key or set TEST_ACCESS_KEY/TEST_SECRET_KEY")?;
        let report = self.check(&store, store.endpoint()).await;
        print_report(self.output, &report)?;
        Ok(if report.success { EXIT_OK } else { EXIT_FAILED })
    }

    /// Run the suite against `store`.
    pub async fn check(&self, store: &dyn ObjectStore, endpoint: &str) -> ConnectivityReport {
        info!(endpoint, bucket = %self.bucket, "running connectivity suite");
        run_connectivity_suite(store, endpoint, &self.bucket).await
    }
}
