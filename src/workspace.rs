use crate::errors::Result;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};
use uuid::Uuid;

/// File name of the generated host program inside a workspace.
pub const HOST_SCRIPT_NAME: &str = "host.py";

/// Per-request scratch directory. It is the host's working directory, home
/// and temp dir, and is removed when the workspace is dropped.
pub struct IsolatedWorkspace {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl IsolatedWorkspace {
    /// Create a new private (0700) workspace under `base`.
    pub fn new(base: &Path, request_id: Uuid) -> Result<Self> {
        std::fs::create_dir_all(base)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("sbx-{}-", request_id.simple()))
            .tempdir_in(base)?;
        let path = dir.path().to_path_buf();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))?;
        }
        debug!("[SANDBOX] Created workspace: {:?}", path);
        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the host program and return its path.
    pub fn write_script(&self, script: &str) -> Result<PathBuf> {
        let target = self.path.join(HOST_SCRIPT_NAME);
        std::fs::write(&target, script)?;
        Ok(target)
    }
}

impl Drop for IsolatedWorkspace {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            match dir.close() {
                Ok(()) => debug!("[SANDBOX] Cleaned up workspace: {:?}", self.path),
                Err(e) => warn!(
                    "[SANDBOX] Failed to cleanup workspace {:?}: {}",
                    self.path, e
                ),
            }
        }
    }
}
