use crate::{
    config::EngineConfig, native::PythonProcessBackend, policy::PolicySet, Result,
    SandboxManager,
};
use std::sync::Arc;

/// Create a sandbox manager backed by a local Python interpreter.
///
/// The interpreter is `config.python_path` when set, else the first
/// `python3`/`python` on `PATH`. Policies are the built-in tiers, overlaid
/// with `config.policy_file` when one is configured.
pub fn create_sandbox_with_config(config: EngineConfig) -> Result<SandboxManager> {
    let backend = match &config.python_path {
        Some(path) => PythonProcessBackend::with_python_path(path.clone())?,
        None => PythonProcessBackend::new()?,
    };
    let policies = match &config.policy_file {
        Some(path) => PolicySet::load_json_file(path)?,
        None => PolicySet::builtin(),
    };
    SandboxManager::new(config, policies, Arc::new(backend))
}

/// Create a sandbox manager configured from `SANDBOX_*` environment
/// variables.
pub fn create_default_sandbox() -> Result<SandboxManager> {
    create_sandbox_with_config(EngineConfig::from_env()?)
}
