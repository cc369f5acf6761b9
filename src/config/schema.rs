use crate::worker::schema::{Standard, ToolOptions};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Sniffer executable, optionally followed by quoted arguments
    #[serde(default = "default_executable")]
    pub executable: String,
    /// Coding standard; `Disabled` turns linting off, `Default` defers to the tool
    #[serde(default)]
    pub standard: Standard,
    /// Report passed to `--report=`
    #[serde(default = "default_report")]
    pub report: String,
    /// Number of workers in the pool
    #[serde(default = "default_pool_size", alias = "pool_size")]
    pub pool_size: usize,
    #[serde(default, alias = "working_directory")]
    pub working_directory: Option<PathBuf>,
}

fn default_executable() -> String {
    "phpcs".to_string()
}

fn default_report() -> String {
    "SniffPool".to_string()
}

fn default_pool_size() -> usize {
    num_cpus::get().clamp(1, 4)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            standard: Standard::default(),
            report: default_report(),
            pool_size: default_pool_size(),
            working_directory: None,
        }
    }
}

impl Config {
    /// Tool options applied to every request
    pub fn invocation_options(&self) -> ToolOptions {
        ToolOptions {
            executable: self.executable.clone(),
            standard: self.standard.clone(),
            report: self.report.clone(),
        }
    }
}
