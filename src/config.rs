//! Daemon configuration.
//!
//! Layered from an optional TOML file and `GRIDFLOW_*` environment
//! variables, deserialized into typed structs with per-field defaults.

use crate::core::adapter::{AdapterKind, BatchStatus};
use crate::resources::group::Requirement;
use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

/// Where the remote queue service lives.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_address")]
    pub address: String,
    /// Bearer token; usually injected via GRIDFLOW_SERVICE__TOKEN.
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_site")]
    pub site: String,
    /// Identity this daemon submits under. Defaults to `{site}.{hostname}`.
    #[serde(default)]
    pub queue_host: Option<String>,
    /// Root for pilot submit directories. Defaults to the data dir.
    #[serde(default)]
    pub submit_dir: Option<PathBuf>,
    #[serde(default)]
    pub credentials_dir: Option<PathBuf>,
    #[serde(default = "default_adapter")]
    pub adapter: AdapterKind,
    /// What this site's worker nodes can offer, e.g. `memory = 8.0` or
    /// `gpu = 1`. Sent as the capacity envelope when claiming tasks, so
    /// the service never hands over work the site cannot run.
    #[serde(default)]
    pub resources: Requirement,
    /// Extra raw descriptor options passed through to the adapter.
    #[serde(default)]
    pub batchopts: HashMap<String, String>,
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    /// How long a pilot may sit queued before it is presumed stuck.
    #[serde(default = "default_queued_timeout")]
    pub queued_timeout_secs: u64,
    #[serde(default = "default_processing_timeout")]
    pub processing_timeout_secs: u64,
    #[serde(default = "default_suspend_timeout")]
    pub suspend_timeout_secs: u64,
    #[serde(default = "default_max_idle_pilots")]
    pub max_idle_pilots: usize,
    #[serde(default = "default_max_total_pilots")]
    pub max_total_pilots: usize,
    #[serde(default = "default_max_pilots_per_cycle")]
    pub max_pilots_per_cycle: usize,
    /// How many finished jobs to pull from batch history each cycle.
    #[serde(default = "default_completions_limit")]
    pub completions_limit: usize,
    /// Concurrent submission pipelines per cycle.
    #[serde(default = "default_parallel_submits")]
    pub parallel_submits: usize,
}

fn default_address() -> String {
    "http://localhost:8080".to_string()
}

fn default_site() -> String {
    "site".to_string()
}

fn default_adapter() -> AdapterKind {
    AdapterKind::Htcondor
}

fn default_check_interval() -> u64 {
    300
}

fn default_queued_timeout() -> u64 {
    86400 * 2
}

fn default_processing_timeout() -> u64 {
    86400 * 2
}

fn default_suspend_timeout() -> u64 {
    86400
}

fn default_max_idle_pilots() -> usize {
    1000
}

fn default_max_total_pilots() -> usize {
    5000
}

fn default_max_pilots_per_cycle() -> usize {
    100
}

fn default_completions_limit() -> usize {
    200
}

fn default_parallel_submits() -> usize {
    8
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            address: default_address(),
            token: None,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            site: default_site(),
            queue_host: None,
            submit_dir: None,
            credentials_dir: None,
            adapter: default_adapter(),
            resources: Requirement::default(),
            batchopts: HashMap::new(),
            check_interval_secs: default_check_interval(),
            queued_timeout_secs: default_queued_timeout(),
            processing_timeout_secs: default_processing_timeout(),
            suspend_timeout_secs: default_suspend_timeout(),
            max_idle_pilots: default_max_idle_pilots(),
            max_total_pilots: default_max_total_pilots(),
            max_pilots_per_cycle: default_max_pilots_per_cycle(),
            completions_limit: default_completions_limit(),
            parallel_submits: default_parallel_submits(),
        }
    }
}

impl QueueConfig {
    /// Effective queue host identity.
    pub fn queue_host(&self) -> String {
        self.queue_host.clone().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
            format!("{}.{hostname}", self.site)
        })
    }

    /// Maximum pilot age per batch status, in seconds. A pilot past its
    /// status limit is presumed stuck and force-removed. Limits accumulate
    /// through the lifecycle, so a completed-but-unprocessed job gets the
    /// whole budget.
    pub fn max_age_secs(&self, status: BatchStatus) -> u64 {
        match status {
            BatchStatus::Queued => self.queued_timeout_secs,
            BatchStatus::Processing => self.queued_timeout_secs + self.processing_timeout_secs,
            BatchStatus::Completed | BatchStatus::Error | BatchStatus::Unknown => {
                self.queued_timeout_secs + self.processing_timeout_secs + self.suspend_timeout_secs
            }
        }
    }
}

impl Config {
    /// Load configuration from `path` (or the default location when absent)
    /// layered under `GRIDFLOW_*` environment variables.
    pub fn load(path: Option<PathBuf>) -> anyhow::Result<Config> {
        let path = match path {
            Some(path) => Some(path),
            None => crate::get_config_dir()
                .ok()
                .map(|dir| dir.join("gridflowd.toml")),
        };
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            if path.exists() {
                builder = builder.add_source(config::File::from(path));
            }
        }
        builder = builder.add_source(
            config::Environment::with_prefix("GRIDFLOW")
                .separator("__")
                .try_parsing(true),
        );
        builder
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")
    }
}
