use crate::environment::Environment;
use crate::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// OS-level ceilings applied to the execution host process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessLimits {
    /// Address-space ceiling in MB
    pub memory_mb: u64,
    /// CPU time ceiling in seconds
    pub cpu_seconds: u64,
    /// Maximum number of processes for the host's user
    pub max_processes: u64,
}

/// Everything a backend needs to run one execution host.
#[derive(Debug, Clone)]
pub struct HostLaunch {
    /// Generated host program
    pub script: PathBuf,
    /// Per-request workspace; becomes the working directory
    pub workdir: PathBuf,
    /// The complete child environment
    pub env: Environment,
    pub limits: ProcessLimits,
    /// Wall-clock deadline
    pub timeout: Duration,
    /// Bytes kept from each output stream; the rest is drained
    pub max_capture_bytes: usize,
}

/// How the host process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    Exited(i32),
    Signaled(i32),
    /// Killed by the supervisor at the deadline.
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub exit: ProcessExit,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub duration: Duration,
}

/// Capabilities of a host backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendInfo {
    /// Backend name
    pub name: String,
    /// Interpreter the backend launches, if any
    pub interpreter: Option<PathBuf>,
    /// Whether OS resource limits are enforced
    pub enforces_limits: bool,
}

/// Runs a generated host program to completion or deadline.
///
/// Implementations never leave a process behind: on return, the host and
/// anything it started are gone.
#[async_trait]
pub trait HostBackend: Send + Sync {
    async fn launch(&self, launch: HostLaunch) -> Result<ProcessOutcome>;

    fn info(&self) -> BackendInfo;
}
