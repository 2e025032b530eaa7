//! Sandbox Manager: request in, [`ExecutionResult`] out.
//!
//! For every request the manager validates the source, prepares a private
//! workspace holding the generated host program, launches it through the
//! configured [`HostBackend`] under the policy's ceilings and translates the
//! process outcome into a result. Nothing outlives the call except an entry
//! in the explicit result cache.

use crate::cache::ResultCache;
use crate::config::EngineConfig;
use crate::engine::{BackendInfo, HostBackend, HostLaunch, ProcessExit, ProcessLimits, ProcessOutcome};
use crate::environment::EnvironmentBuilder;
use crate::errors::Result;
use crate::host::{HostReport, HostScript};
use crate::policy::{Policy, PolicySet};
use crate::request::{
    truncate_utf8, validate_context_names, ExecutionRequest, ExecutionResult, FailureReason,
};
use crate::state::{ExecutionState, ExecutionTracker};
use crate::validator::{CodeValidator, ValidationOutcome};
use crate::workspace::IsolatedWorkspace;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Bytes of host stderr kept in a failure detail.
const STDERR_DETAIL_BYTES: usize = 2048;

pub struct SandboxManager {
    policies: Arc<PolicySet>,
    analysis_policy: Arc<Policy>,
    backend: Arc<dyn HostBackend>,
    config: EngineConfig,
    permits: Arc<Semaphore>,
    validator: CodeValidator,
    environment: EnvironmentBuilder,
    cache: ResultCache,
}

impl SandboxManager {
    pub fn new(
        config: EngineConfig,
        policies: PolicySet,
        backend: Arc<dyn HostBackend>,
    ) -> Result<Self> {
        config.validate()?;
        let info = backend.info();
        info!(
            "[SANDBOX] Sandbox manager ready: backend={} policies={:?} (version {}) max_concurrency={}",
            info.name,
            policies.names(),
            policies.version(),
            config.max_concurrency
        );
        Ok(Self {
            policies: Arc::new(policies),
            analysis_policy: Arc::new(Policy::named_analysis()),
            backend,
            permits: Arc::new(Semaphore::new(config.max_concurrency)),
            validator: CodeValidator::new(),
            environment: EnvironmentBuilder::new(config.max_threads)
                .with_extra(config.extra_env.clone()),
            cache: ResultCache::new(config.cache_capacity),
            config,
        })
    }

    pub fn policies(&self) -> &PolicySet {
        &self.policies
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn backend_info(&self) -> BackendInfo {
        self.backend.info()
    }

    pub(crate) fn analysis_policy(&self) -> Arc<Policy> {
        self.analysis_policy.clone()
    }

    /// Stop admitting executions. Running ones finish normally.
    pub fn shutdown(&self) {
        info!("[SANDBOX] Sandbox manager shutting down");
        self.permits.close();
    }

    /// Run one request. Never fails: every outcome, including engine-side
    /// problems, is an [`ExecutionResult`].
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let request_id = Uuid::new_v4();
        let Some(policy) = self.policies.get(&request.policy_name) else {
            warn!(
                "[SANDBOX] {} rejected: unknown policy '{}'",
                request_id, request.policy_name
            );
            return ExecutionResult::failure(
                request_id,
                FailureReason::ValidationRejected,
                format!("unknown policy '{}'", request.policy_name),
            );
        };
        self.execute_with_policy(request_id, &request, &policy).await
    }

    pub async fn execute_source(
        &self,
        source_code: impl Into<String>,
        context: Map<String, Value>,
        policy_name: impl Into<String>,
        timeout_seconds: Option<u64>,
    ) -> ExecutionResult {
        let mut request = ExecutionRequest::new(source_code, policy_name).with_context(context);
        request.timeout_seconds = timeout_seconds;
        self.execute(request).await
    }

    /// Like [`SandboxManager::execute`], but reuses the stored result when
    /// `cache_key` was last used with an identical request.
    pub async fn execute_cached(&self, cache_key: &str, request: ExecutionRequest) -> ExecutionResult {
        if let Some(hit) = self.cache.get(cache_key, &request) {
            debug!("[SANDBOX] Cache hit for key '{}'", cache_key);
            return hit;
        }
        let result = self.execute(request.clone()).await;
        self.cache.put(cache_key, &request, &result);
        result
    }

    pub fn invalidate_cached(&self, cache_key: &str) {
        self.cache.invalidate(cache_key);
    }

    pub(crate) async fn execute_with_policy(
        &self,
        request_id: Uuid,
        request: &ExecutionRequest,
        policy: &Policy,
    ) -> ExecutionResult {
        let mut tracker = ExecutionTracker::new(request_id);
        let result = self.run(&mut tracker, request_id, request, policy).await;

        match result.failure_reason {
            None => info!(
                "[SANDBOX] {} completed under '{}' in {}ms",
                request_id,
                policy.name(),
                result.duration_ms
            ),
            Some(reason) => info!(
                "[SANDBOX] {} failed under '{}' in {}ms: {}",
                request_id,
                policy.name(),
                result.duration_ms,
                reason
            ),
        }
        result
    }

    async fn run(
        &self,
        tracker: &mut ExecutionTracker,
        request_id: Uuid,
        request: &ExecutionRequest,
        policy: &Policy,
    ) -> ExecutionResult {
        step(tracker, ExecutionState::Validating);
        if let Err(reason) = validate_context_names(&request.context) {
            step(tracker, ExecutionState::Failed);
            return ExecutionResult::failure(request_id, FailureReason::ValidationRejected, reason);
        }
        if let ValidationOutcome::Rejected(rejection) =
            self.validator.validate(&request.source_code, policy)
        {
            warn!("[SANDBOX] {} rejected by validator: {}", request_id, rejection);
            step(tracker, ExecutionState::Failed);
            return ExecutionResult::failure(
                request_id,
                rejection.failure_reason(),
                rejection.to_string(),
            );
        }

        step(tracker, ExecutionState::Spawning);
        let Ok(_permit) = self.permits.clone().acquire_owned().await else {
            step(tracker, ExecutionState::Failed);
            return ExecutionResult::failure(
                request_id,
                FailureReason::RuntimeError,
                "sandbox manager is shut down",
            );
        };

        let timeout = policy.clamp_timeout(request.timeout_seconds);
        let (workspace, launch) = match self.prepare(request_id, request, policy, timeout) {
            Ok(prepared) => prepared,
            Err(e) => {
                error!("[SANDBOX] {} failed to prepare execution host: {}", request_id, e);
                step(tracker, ExecutionState::Failed);
                return ExecutionResult::failure(
                    request_id,
                    FailureReason::RuntimeError,
                    format!("failed to prepare execution host: {}", e),
                );
            }
        };

        step(tracker, ExecutionState::Running);
        let launched = self.backend.launch(launch).await;
        drop(workspace);

        let outcome = match launched {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("[SANDBOX] {} launch failed: {}", request_id, e);
                step(tracker, ExecutionState::Collecting);
                step(tracker, ExecutionState::Failed);
                return ExecutionResult::failure(
                    request_id,
                    FailureReason::RuntimeError,
                    e.to_string(),
                );
            }
        };

        if outcome.exit == ProcessExit::TimedOut {
            step(tracker, ExecutionState::TimedOut);
        } else {
            step(tracker, ExecutionState::Collecting);
        }
        // Wall-clock time of the host process only
        let result = classify(request_id, &outcome, policy, timeout)
            .with_duration_ms(outcome.duration.as_millis() as u64);
        if outcome.exit != ProcessExit::TimedOut {
            step(
                tracker,
                if result.succeeded {
                    ExecutionState::Completed
                } else {
                    ExecutionState::Failed
                },
            );
        }
        result
    }

    fn prepare(
        &self,
        request_id: Uuid,
        request: &ExecutionRequest,
        policy: &Policy,
        timeout: Duration,
    ) -> Result<(IsolatedWorkspace, HostLaunch)> {
        let workspace = IsolatedWorkspace::new(&self.config.workspace_base, request_id)?;
        let script = HostScript::new(policy, &request.source_code, &request.context).render()?;
        let script_path = workspace.write_script(&script)?;
        let launch = HostLaunch {
            script: script_path,
            workdir: workspace.path().to_path_buf(),
            env: self.environment.build(workspace.path()),
            limits: ProcessLimits {
                memory_mb: policy.max_memory_mb(),
                cpu_seconds: policy.max_execution_seconds() + 1,
                max_processes: self.config.max_processes,
            },
            timeout,
            max_capture_bytes: self.config.max_report_bytes,
        };
        Ok((workspace, launch))
    }
}

fn step(tracker: &mut ExecutionTracker, next: ExecutionState) {
    if let Err(e) = tracker.advance(next) {
        error!("[SANDBOX] {}", e);
    }
}

/// Translate a finished host process into a result.
///
/// A well-formed report decides the outcome. Without one, the exit status
/// and stderr are all there is to go on.
pub(crate) fn classify(
    request_id: Uuid,
    outcome: &ProcessOutcome,
    policy: &Policy,
    timeout: Duration,
) -> ExecutionResult {
    let cap = policy.max_output_bytes();

    if outcome.exit == ProcessExit::TimedOut {
        return ExecutionResult::failure(
            request_id,
            FailureReason::Timeout,
            format!("execution exceeded {}s", timeout.as_secs()),
        );
    }

    let report = if outcome.stdout_truncated {
        None
    } else {
        HostReport::parse(&outcome.stdout)
    };
    if let Some(report) = report {
        let stdout = truncate_utf8(&report.stdout, cap).to_string();
        let stderr = truncate_utf8(&report.stderr, cap).to_string();
        let result = match report.status.failure_reason() {
            None => ExecutionResult::success(request_id, report.result),
            Some(reason) => ExecutionResult::failure(request_id, reason, report.detail()),
        };
        return result.with_output(stdout, stderr);
    }

    let stderr = String::from_utf8_lossy(&outcome.stderr);
    let tail = stderr_tail(&stderr);
    let memory_trouble =
        stderr.contains("MemoryError") || stderr.contains("Cannot allocate memory");

    let (reason, detail) = match outcome.exit {
        _ if memory_trouble => (
            FailureReason::MemoryExceeded,
            format!("memory limit of {} MB exceeded", policy.max_memory_mb()),
        ),
        ProcessExit::Signaled(signal) => signal_failure(signal, policy),
        ProcessExit::Exited(0) if outcome.stdout_truncated => (
            FailureReason::NonSerializableResult,
            "result exceeds the report size limit".to_string(),
        ),
        ProcessExit::Exited(0) => (
            FailureReason::NonSerializableResult,
            "execution host output was not a single JSON document".to_string(),
        ),
        ProcessExit::Exited(code) => (
            FailureReason::RuntimeError,
            format!("execution host exited with status {}: {}", code, tail),
        ),
        ProcessExit::TimedOut => (FailureReason::Timeout, String::new()),
    };
    ExecutionResult::failure(request_id, reason, detail)
        .with_output(String::new(), truncate_utf8(&stderr, cap).to_string())
}

#[cfg(unix)]
fn signal_failure(signal: i32, policy: &Policy) -> (FailureReason, String) {
    match signal {
        libc::SIGKILL | libc::SIGABRT => (
            FailureReason::MemoryExceeded,
            format!(
                "execution host killed by signal {} (memory limit {} MB)",
                signal,
                policy.max_memory_mb()
            ),
        ),
        libc::SIGXCPU => (
            FailureReason::Timeout,
            format!("cpu time limit of {}s exceeded", policy.max_execution_seconds()),
        ),
        _ => (
            FailureReason::RuntimeError,
            format!("execution host killed by signal {}", signal),
        ),
    }
}

#[cfg(not(unix))]
fn signal_failure(signal: i32, _policy: &Policy) -> (FailureReason, String) {
    (
        FailureReason::RuntimeError,
        format!("execution host killed by signal {}", signal),
    )
}

fn stderr_tail(stderr: &str) -> &str {
    let trimmed = stderr.trim_end();
    if trimmed.len() <= STDERR_DETAIL_BYTES {
        return trimmed;
    }
    let mut start = trimmed.len() - STDERR_DETAIL_BYTES;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    &trimmed[start..]
}
