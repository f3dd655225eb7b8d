//! Command line of the `gk-bootstrap` binary.

use crate::admin_client::{AdminApi, HttpAdminClient};
use crate::config::AdminSettings;
use crate::desired::DesiredState;
use crate::error::{DesiredStateError, ReconcileError};
use crate::ready::wait_for_ready;
use crate::reconciler::{ReconcileReport, Reconciler};
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use garagekit_core::CancelToken;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Exit status: the cluster converged.
pub const EXIT_CONVERGED: u8 = 0;
/// Exit status: the run failed.
pub const EXIT_FAILED: u8 = 1;
/// Exit status: bad arguments, settings or desired state.
pub const EXIT_USAGE: u8 = 2;

/// Report format on stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human readable summary.
    Text,
    /// The full report as JSON.
    Json,
}

/// Command line of `gk-bootstrap`.
#[derive(Parser, Debug)]
#[command(name = "gk-bootstrap")]
#[command(about = "Converge a Garage cluster with a declared desired state", long_about = None)]
pub struct Cli {
    /// Admin API endpoint [default: http://localhost:3903]
    #[arg(short, long, env = "GARAGE_ADMIN_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Admin API bearer token
    #[arg(short, long, env = "GARAGE_ADMIN_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Desired state file (.yaml, .yml or .json)
    #[arg(short, long, conflicts_with = "inline")]
    pub config: Option<PathBuf>,

    /// Desired state document given inline (YAML or JSON)
    #[arg(long)]
    pub inline: Option<String>,

    /// Plan only, change nothing
    #[arg(long)]
    pub dry_run: bool,

    /// Skip the health check wait
    #[arg(long)]
    pub no_wait: bool,

    /// Seconds to wait for the cluster to become ready
    #[arg(long)]
    pub ready_timeout: Option<u64>,

    /// Per-call timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Total attempts per call
    #[arg(long)]
    pub retry_attempts: Option<u32>,

    /// Settings file (.toml or .json)
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Report format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub output: OutputFormat,

    /// Debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Run and return the process exit status.
    pub async fn run(self, cancel: CancelToken) -> Result<u8> {
        let settings = self.settings()?;

        let desired = match self.checked_desired() {
            Ok(desired) => desired,
            Err(report) => {
                self.print(&report)?;
                return Ok(EXIT_USAGE);
            }
        };

        let token = settings
            .token
            .clone()
            .context("admin token missing: pass --token or set GARAGE_ADMIN_TOKEN")?;
        let client = HttpAdminClient::new(
            settings.endpoint.clone(),
            token,
            Duration::from_secs(settings.request_timeout_secs),
        )?;
        info!(endpoint = %client.endpoint(), dry_run = self.dry_run, "starting reconciliation");

        match self
            .reconcile(Arc::new(client), &settings, &desired, cancel)
            .await
        {
            Ok(report) => {
                self.print(&report)?;
                Ok(if report.is_converged() {
                    EXIT_CONVERGED
                } else {
                    EXIT_FAILED
                })
            }
            Err(e) => {
                error!(error = %e, "run aborted");
                eprintln!("{e}");
                Ok(EXIT_FAILED)
            }
        }
    }

    /// Settings file, then flag and environment overrides.
    pub fn settings(&self) -> Result<AdminSettings> {
        let mut settings = match &self.settings {
            Some(path) => AdminSettings::from_file(path)
                .with_context(|| format!("cannot load settings from {}", path.display()))?,
            None => AdminSettings::default(),
        };
        if let Some(endpoint) = &self.endpoint {
            settings.endpoint = endpoint.clone();
        }
        if let Some(token) = &self.token {
            settings.token = Some(token.clone());
        }
        if let Some(secs) = self.ready_timeout {
            settings.ready_timeout_secs = secs;
        }
        if let Some(secs) = self.timeout {
            settings.request_timeout_secs = secs;
        }
        if let Some(attempts) = self.retry_attempts {
            settings.retry.max_attempts = attempts;
        }
        if self.no_wait {
            settings.wait_for_ready = false;
        }
        Ok(settings)
    }

    /// The desired state from `--config`, `--inline` or the environment.
    pub fn desired(&self) -> std::result::Result<DesiredState, DesiredStateError> {
        if let Some(path) = &self.config {
            DesiredState::from_file(path)
        } else if let Some(doc) = &self.inline {
            DesiredState::from_yaml_str(doc)
        } else {
            DesiredState::from_env()
        }
    }

    /// The desired state, loaded and validated. On failure the report
    /// describes the rejection as a validate-stage failure.
    pub fn checked_desired(&self) -> std::result::Result<DesiredState, ReconcileReport> {
        match self.desired().and_then(|d| d.validate().map(|_| d)) {
            Ok(desired) => Ok(desired),
            Err(e) => {
                error!(error = %e, "desired state rejected");
                Err(ReconcileReport::rejected(self.dry_run, e))
            }
        }
    }

    /// Wait for readiness if configured, then run or plan.
    pub async fn reconcile(
        &self,
        api: Arc<dyn AdminApi>,
        settings: &AdminSettings,
        desired: &DesiredState,
        cancel: CancelToken,
    ) -> std::result::Result<ReconcileReport, ReconcileError> {
        if settings.wait_for_ready {
            wait_for_ready(
                api.as_ref(),
                Duration::from_secs(settings.ready_timeout_secs),
                Duration::from_millis(settings.ready_interval_ms),
            )
            .await?;
        }
        let reconciler = Reconciler::new(api)
            .with_retry(settings.retry.clone())
            .with_cancel(cancel);
        Ok(if self.dry_run {
            reconciler.dry_run(desired).await
        } else {
            reconciler.run(desired).await
        })
    }

    fn print(&self, report: &ReconcileReport) -> Result<()> {
        println!("{}", self.render(report)?);
        Ok(())
    }

    /// The report in the selected output format.
    pub fn render(&self, report: &ReconcileReport) -> Result<String> {
        Ok(match self.output {
            OutputFormat::Text => report.to_string().trim_end().to_string(),
            OutputFormat::Json => serde_json::to_string_pretty(report)?,
        })
    }
}
