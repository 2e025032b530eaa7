use crate::errors::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Default cap on bytes read from the host's stdout (the report) and stderr.
pub const DEFAULT_MAX_REPORT_BYTES: usize = 4 * 1024 * 1024;

/// Engine-wide configuration. Per-request limits live on the
/// [`crate::Policy`]; these are the knobs that do not vary by tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Interpreter for the execution host. `None` searches `PATH` for
    /// `python3`, then `python`.
    pub python_path: Option<PathBuf>,
    /// Base directory for per-request workspaces
    pub workspace_base: PathBuf,
    /// Maximum number of execution hosts alive at once
    pub max_concurrency: usize,
    /// Bytes kept from each of the host's output streams
    pub max_report_bytes: usize,
    /// Thread count for numeric libraries inside the host
    pub max_threads: u32,
    /// RLIMIT_NPROC for the host
    pub max_processes: u64,
    /// Extra environment entries; credential-shaped names are still dropped
    pub extra_env: BTreeMap<String, String>,
    /// JSON policy file overlaid on the built-in tiers
    pub policy_file: Option<PathBuf>,
    /// Entries kept by the result cache
    pub cache_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            python_path: None,
            workspace_base: std::env::temp_dir().join("analysis-sandbox"),
            max_concurrency: 4,
            max_report_bytes: DEFAULT_MAX_REPORT_BYTES,
            max_threads: 1,
            max_processes: 64,
            extra_env: BTreeMap::new(),
            policy_file: None,
            cache_capacity: 128,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `SANDBOX_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(path) = lookup("SANDBOX_PYTHON_PATH") {
            config.python_path = Some(PathBuf::from(path));
        }
        if let Some(dir) = lookup("SANDBOX_WORKSPACE_DIR") {
            config.workspace_base = PathBuf::from(dir);
        }
        if let Some(value) = lookup("SANDBOX_MAX_CONCURRENCY") {
            config.max_concurrency = parse_number("SANDBOX_MAX_CONCURRENCY", &value)?;
        }
        if let Some(value) = lookup("SANDBOX_MAX_REPORT_BYTES") {
            config.max_report_bytes = parse_number("SANDBOX_MAX_REPORT_BYTES", &value)?;
        }
        if let Some(path) = lookup("SANDBOX_POLICY_FILE") {
            config.policy_file = Some(PathBuf::from(path));
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(SandboxError::InvalidConfig(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.max_report_bytes < 1024 {
            return Err(SandboxError::InvalidConfig(
                "max_report_bytes must be at least 1024".to_string(),
            ));
        }
        if self.max_threads == 0 || self.max_processes == 0 {
            return Err(SandboxError::InvalidConfig(
                "max_threads and max_processes must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| SandboxError::InvalidConfig(format!("{} is not a number: {:?}", key, value)))
}
