//! Daemon settings
//!
//! Loaded once at startup from a YAML file and then shared read-only
//! (`Arc<Settings>`) by the scheduler, the collector and the HTTP server.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// A named group of hosts whose listings are merged into one flame graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cluster {
    pub name: String,
    #[serde(default)]
    pub hosts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowStoreSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// SQLite database file holding the `flamegraph` table.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    /// Filter directive used when `RUST_LOG` is unset or empty.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Cluster units allowed to run at the same time.
    #[serde(default = "default_clusters_in_parallel")]
    pub clusters_in_parallel: usize,
    /// Listing fetches in flight per cluster.
    #[serde(default = "default_fetch_per_cluster")]
    pub fetch_per_cluster: usize,
    #[serde(default = "default_fetch_attempts")]
    pub fetch_attempts: u32,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Port of the host agent serving `/metrics/list/`.
    #[serde(default = "default_agent_port")]
    pub agent_port: u16,
    /// Percentage of the snapshot total a node must exceed to be kept.
    #[serde(default)]
    pub remove_lowest_pct: f64,
    #[serde(default = "default_rerun_interval_secs")]
    pub rerun_interval_secs: u64,
    #[serde(default)]
    pub clusters: Vec<Cluster>,
    #[serde(default)]
    pub write_to_file: bool,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub row_store: RowStoreSettings,
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub log: LogSettings,
}

fn default_true() -> bool {
    true
}

fn default_store_path() -> PathBuf {
    PathBuf::from("flamegraph.db")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_clusters_in_parallel() -> usize {
    2
}

fn default_fetch_per_cluster() -> usize {
    4
}

fn default_fetch_attempts() -> u32 {
    3
}

fn default_fetch_timeout_secs() -> u64 {
    120
}

fn default_agent_port() -> u16 {
    8080
}

fn default_rerun_interval_secs() -> u64 {
    600 // 10 minutes
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_listen() -> String {
    "[::]:8088".to_string()
}

impl Default for RowStoreSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_store_path(),
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            clusters_in_parallel: default_clusters_in_parallel(),
            fetch_per_cluster: default_fetch_per_cluster(),
            fetch_attempts: default_fetch_attempts(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            agent_port: default_agent_port(),
            remove_lowest_pct: 0.0,
            rerun_interval_secs: default_rerun_interval_secs(),
            clusters: Vec::new(),
            write_to_file: false,
            output_dir: default_output_dir(),
            row_store: RowStoreSettings::default(),
            listen: default_listen(),
            log: LogSettings::default(),
        }
    }
}

impl Settings {
    /// Read and parse a YAML settings file. Does not validate.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Startup preconditions; any failure here stops the process.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.clusters.is_empty() {
            return Err(ConfigError::Invalid("no clusters configured".into()));
        }
        if !self.write_to_file && !self.row_store.enabled {
            return Err(ConfigError::Invalid(
                "neither row store nor file output is enabled".into(),
            ));
        }
        if !(0.0..100.0).contains(&self.remove_lowest_pct) {
            return Err(ConfigError::Invalid(format!(
                "remove_lowest_pct must be in [0, 100), got {}",
                self.remove_lowest_pct
            )));
        }
        if self.clusters_in_parallel == 0 || self.fetch_per_cluster == 0 {
            return Err(ConfigError::Invalid(
                "clusters_in_parallel and fetch_per_cluster must be at least 1".into(),
            ));
        }
        if self.fetch_attempts == 0 {
            return Err(ConfigError::Invalid("fetch_attempts must be at least 1".into()));
        }
        if let Some(cluster) = self.clusters.iter().find(|c| c.name.is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "cluster with hosts {:?} has an empty name",
                cluster.hosts
            )));
        }
        // Snapshots are keyed by cluster name
        let mut names = HashSet::new();
        if let Some(cluster) = self.clusters.iter().find(|c| !names.insert(c.name.as_str())) {
            return Err(ConfigError::Invalid(format!(
                "cluster '{}' is configured more than once",
                cluster.name
            )));
        }
        Ok(())
    }

    /// `remove_lowest_pct` as a fraction in [0, 1).
    pub fn remove_lowest_fraction(&self) -> f64 {
        self.remove_lowest_pct / 100.0
    }

    pub fn rerun_interval(&self) -> Duration {
        Duration::from_secs(self.rerun_interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}
