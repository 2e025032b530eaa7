use crate::engine::{BackendInfo, HostBackend, HostLaunch, ProcessExit, ProcessLimits, ProcessOutcome};
use crate::errors::{Result, SandboxError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Runs the execution host as a `python3` child process.
///
/// The child starts without the user site directory (`-s`), with a cleared
/// environment, in its own process group and under rlimits. `-E` is not
/// used: the environment is ours and carries `PYTHONHASHSEED`. At the
/// deadline the whole group is killed.
pub struct PythonProcessBackend {
    python_path: PathBuf,
}

impl PythonProcessBackend {
    /// Use the first `python3` (or `python`) on `PATH`.
    pub fn new() -> Result<Self> {
        let python_path = which::which("python3")
            .or_else(|_| which::which("python"))
            .map_err(|_| SandboxError::PythonNotFound)?;
        Ok(Self { python_path })
    }

    pub fn with_python_path(python_path: PathBuf) -> Result<Self> {
        if !python_path.exists() {
            return Err(SandboxError::PythonNotFound);
        }
        Ok(Self { python_path })
    }

    pub fn python_path(&self) -> &Path {
        &self.python_path
    }

    #[cfg(unix)]
    fn apply_resource_limits(&self, cmd: &mut Command, limits: &ProcessLimits) {
        let cpu_seconds = limits.cpu_seconds;
        #[cfg(not(target_os = "macos"))]
        let memory_bytes = limits.memory_mb * 1024 * 1024;
        #[cfg(not(target_os = "macos"))]
        let max_processes = limits.max_processes;

        unsafe {
            cmd.pre_exec(move || {
                // Own process group so the deadline kill reaches descendants
                if libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }

                // RLIMIT_AS is not honoured on macOS
                #[cfg(not(target_os = "macos"))]
                set_limit(libc::RLIMIT_AS, memory_bytes)?;

                set_limit(libc::RLIMIT_CPU, cpu_seconds)?;
                set_limit(libc::RLIMIT_CORE, 0)?;

                #[cfg(not(target_os = "macos"))]
                set_limit(libc::RLIMIT_NPROC, max_processes)?;

                Ok(())
            });
        }
    }

    #[cfg(not(unix))]
    fn apply_resource_limits(&self, _cmd: &mut Command, _limits: &ProcessLimits) {
        // Only the wall-clock deadline applies here
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
type RlimitResource = libc::__rlimit_resource_t;
#[cfg(all(unix, not(all(target_os = "linux", target_env = "gnu"))))]
type RlimitResource = libc::c_int;

/// Set soft and hard limit, never above the inherited hard limit.
#[cfg(unix)]
fn set_limit(resource: RlimitResource, value: u64) -> std::io::Result<()> {
    let mut current = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(resource, &mut current) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    let value = (value as libc::rlim_t).min(current.rlim_max);
    let rlimit = libc::rlimit {
        rlim_cur: value,
        rlim_max: value,
    };
    if unsafe { libc::setrlimit(resource, &rlimit) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// SIGKILL the process group led by `pid`. A group that is already gone is
/// not an error.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => warn!("[SANDBOX] Failed to kill process group {}: {}", pid, e),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

#[cfg(unix)]
fn exit_kind(status: std::process::ExitStatus) -> ProcessExit {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => ProcessExit::Exited(code),
        (None, Some(signal)) => ProcessExit::Signaled(signal),
        (None, None) => ProcessExit::Exited(-1),
    }
}

#[cfg(not(unix))]
fn exit_kind(status: std::process::ExitStatus) -> ProcessExit {
    ProcessExit::Exited(status.code().unwrap_or(-1))
}

/// How long the pipes may stay open once the host itself is gone. A
/// descendant that left the process group can hold them indefinitely.
const PIPE_DRAIN_GRACE: Duration = Duration::from_millis(500);

#[derive(Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

type SharedCapture = Arc<Mutex<Captured>>;

/// Read a stream to its end into `sink`, keeping at most `cap` bytes.
async fn read_capped<R>(reader: Option<R>, cap: usize, sink: SharedCapture) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(());
    };
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let mut captured = sink.lock().unwrap_or_else(|e| e.into_inner());
        let room = cap.saturating_sub(captured.bytes.len());
        if n > room {
            captured.truncated = true;
        }
        captured.bytes.extend_from_slice(&buf[..n.min(room)]);
    }
}

fn spawn_reader<R>(reader: Option<R>, cap: usize) -> (JoinHandle<std::io::Result<()>>, SharedCapture)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let sink = SharedCapture::default();
    let task = tokio::spawn(read_capped(reader, cap, sink.clone()));
    (task, sink)
}

/// Wait up to `grace` for a reader to hit EOF, then abandon it and keep
/// whatever it captured.
async fn drain(
    mut task: JoinHandle<std::io::Result<()>>,
    sink: SharedCapture,
    stream: &str,
    grace: Duration,
) -> Result<Captured> {
    match tokio::time::timeout(grace, &mut task).await {
        Ok(joined) => joined
            .map_err(|e| SandboxError::InternalError(format!("{} reader: {}", stream, e)))??,
        Err(_) => {
            warn!(
                "[SANDBOX] {} still open {:?} after the host exited, abandoning it",
                stream, grace
            );
            task.abort();
        }
    }
    let mut captured = sink.lock().unwrap_or_else(|e| e.into_inner());
    Ok(std::mem::take(&mut *captured))
}

#[async_trait]
impl HostBackend for PythonProcessBackend {
    async fn launch(&self, launch: HostLaunch) -> Result<ProcessOutcome> {
        let mut cmd = Command::new(&self.python_path);
        cmd.arg("-s")
            .arg("-B")
            .arg(&launch.script)
            .current_dir(&launch.workdir)
            .env_clear()
            .envs(launch.env.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        self.apply_resource_limits(&mut cmd, &launch.limits);

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            error!("[SANDBOX] Failed to spawn {:?}: {}", self.python_path, e);
            SandboxError::LaunchFailed(e.to_string())
        })?;
        let pid = child.id();
        debug!("[SANDBOX] Started execution host pid={:?}", pid);

        let cap = launch.max_capture_bytes;
        let (stdout_task, stdout_sink) = spawn_reader(child.stdout.take(), cap);
        let (stderr_task, stderr_sink) = spawn_reader(child.stderr.take(), cap);

        let exit = match tokio::time::timeout(launch.timeout, child.wait()).await {
            Ok(status) => {
                let exit = exit_kind(status?);
                // Anything the host left running still holds the pipes
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                exit
            }
            Err(_) => {
                warn!(
                    "[SANDBOX] Execution host pid={:?} exceeded {:?}, killing process group",
                    pid, launch.timeout
                );
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                let _ = child.start_kill();
                child.wait().await?;
                ProcessExit::TimedOut
            }
        };
        let duration = started.elapsed();

        let stdout = drain(stdout_task, stdout_sink, "stdout", PIPE_DRAIN_GRACE).await?;
        let stderr = drain(stderr_task, stderr_sink, "stderr", PIPE_DRAIN_GRACE).await?;

        Ok(ProcessOutcome {
            exit,
            stdout: stdout.bytes,
            stderr: stderr.bytes,
            stdout_truncated: stdout.truncated,
            duration,
        })
    }

    fn info(&self) -> BackendInfo {
        BackendInfo {
            name: "python-process".to_string(),
            interpreter: Some(self.python_path.clone()),
            enforces_limits: cfg!(unix),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::environment::EnvironmentBuilder;
    use std::time::Duration;

    fn backend() -> Option<PythonProcessBackend> {
        PythonProcessBackend::new().ok()
    }

    fn launch_for(dir: &Path, program: &str, timeout: Duration) -> HostLaunch {
        let script = dir.join("host.py");
        std::fs::write(&script, program).unwrap();
        HostLaunch {
            script,
            workdir: dir.to_path_buf(),
            env: EnvironmentBuilder::new(1).build(dir),
            limits: ProcessLimits {
                memory_mb: 512,
                cpu_seconds: 30,
                max_processes: u64::MAX,
            },
            timeout,
            max_capture_bytes: 1024,
        }
    }

    #[tokio::test]
    async fn test_collects_output_and_exit_code() {
        let Some(backend) = backend() else { return };
        let dir = tempfile::tempdir().unwrap();
        let launch = launch_for(
            dir.path(),
            "import sys\nprint('{\"ok\": true}')\nsys.stderr.write('warn')\nsys.exit(3)\n",
            Duration::from_secs(10),
        );
        let outcome = backend.launch(launch).await.unwrap();
        assert_eq!(outcome.exit, ProcessExit::Exited(3));
        assert_eq!(String::from_utf8_lossy(&outcome.stdout).trim(), "{\"ok\": true}");
        assert_eq!(String::from_utf8_lossy(&outcome.stderr), "warn");
        assert!(!outcome.stdout_truncated);
    }

    #[tokio::test]
    async fn test_environment_is_cleared() {
        let Some(backend) = backend() else { return };
        let dir = tempfile::tempdir().unwrap();
        let launch = launch_for(
            dir.path(),
            "import os\nprint(sorted(k for k in os.environ if k == 'USER' or k.endswith('_KEY')))\n",
            Duration::from_secs(10),
        );
        let outcome = backend.launch(launch).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&outcome.stdout).trim(), "[]");
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        let Some(backend) = backend() else { return };
        let dir = tempfile::tempdir().unwrap();
        let launch = launch_for(dir.path(), "print('x' * 100000)\n", Duration::from_secs(10));
        let outcome = backend.launch(launch).await.unwrap();
        assert_eq!(outcome.stdout.len(), 1024);
        assert!(outcome.stdout_truncated);
        assert_eq!(outcome.exit, ProcessExit::Exited(0));
    }

    #[tokio::test]
    async fn test_deadline_kills_process_group() {
        let Some(backend) = backend() else { return };
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("child.pid");
        let program = format!(
            "import os, subprocess, time\n\
             p = subprocess.Popen(['sleep', '30'])\n\
             open({:?}, 'w').write(str(p.pid))\n\
             time.sleep(30)\n",
            pid_file.to_string_lossy()
        );
        let launch = launch_for(dir.path(), &program, Duration::from_secs(2));
        let started = Instant::now();
        let outcome = backend.launch(launch).await.unwrap();
        assert_eq!(outcome.exit, ProcessExit::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));

        if let Ok(pid) = std::fs::read_to_string(&pid_file) {
            let pid: i32 = pid.trim().parse().unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
            assert!(!is_running(pid), "grandchild {} survived the deadline", pid);
        }
    }

    #[tokio::test]
    async fn test_detached_descendant_does_not_hold_the_result() {
        let Some(backend) = backend() else { return };
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("detached.pid");
        let program = format!(
            "import os, time\n\
             if os.fork() == 0:\n\
             \x20   os.setsid()\n\
             \x20   open({:?}, 'w').write(str(os.getpid()))\n\
             \x20   time.sleep(20)\n\
             \x20   os._exit(0)\n\
             print('{{\"ok\": true}}')\n",
            pid_file.to_string_lossy()
        );
        let launch = launch_for(dir.path(), &program, Duration::from_secs(10));
        let started = Instant::now();
        let outcome = backend.launch(launch).await.unwrap();
        let elapsed = started.elapsed();

        if let Ok(pid) = std::fs::read_to_string(&pid_file) {
            let pid = nix::unistd::Pid::from_raw(pid.trim().parse().unwrap());
            let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL);
        }
        assert!(elapsed < Duration::from_secs(5), "returned after {:?}", elapsed);
        assert_eq!(outcome.exit, ProcessExit::Exited(0));
        assert_eq!(String::from_utf8_lossy(&outcome.stdout).trim(), "{\"ok\": true}");
    }

    // Zombies awaiting reaping by init do not count.
    fn is_running(pid: i32) -> bool {
        if nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_err() {
            return false;
        }
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => !stat
                .rsplit(')')
                .next()
                .map(|rest| rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
            Err(_) => !Path::new("/proc").exists(),
        }
    }

    #[test]
    fn test_missing_interpreter() {
        let result = PythonProcessBackend::with_python_path(PathBuf::from("/nonexistent/python3"));
        assert!(matches!(result, Err(SandboxError::PythonNotFound)));
    }
}
