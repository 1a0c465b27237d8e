//! Runtime-environment builder facade.
//!
//! Each slot carries its own isolated runtime environment under a fixed
//! subpath of the working copy, so siblings never share interpreter state.
//! The production implementation builds a Python virtualenv and installs the
//! checked-out application into it.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tracing::{debug, info, instrument};

use crate::io::process::run_with_timeout;

/// Environment directory inside every slot.
pub const ENV_DIR: &str = ".venv";

/// Failure of one environment-build step, with captured diagnostics.
#[derive(Debug, thiserror::Error)]
#[error("{op} in {}: {detail}", dir.display())]
pub struct EnvError {
    pub op: &'static str,
    pub dir: PathBuf,
    pub detail: String,
}

/// Narrow interface over environment creation and dependency installation.
pub trait EnvironmentBuilder {
    /// Create the runtime environment if it does not exist yet, returning
    /// its path. Must be idempotent: an existing environment is kept as-is.
    fn build_if_absent(&self, slot_dir: &Path) -> Result<PathBuf, EnvError>;

    /// Install or update the application's dependencies into the
    /// environment.
    fn install(&self, slot_dir: &Path) -> Result<(), EnvError>;
}

/// Python-virtualenv implementation.
#[derive(Debug, Clone)]
pub struct VenvBuilder {
    timeout: Duration,
    output_limit_bytes: usize,
}

impl VenvBuilder {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            output_limit_bytes: 64 * 1024,
        }
    }

    fn run_checked(&self, op: &'static str, dir: &Path, mut cmd: Command) -> Result<(), EnvError> {
        cmd.current_dir(dir);
        let output =
            run_with_timeout(cmd, self.timeout, self.output_limit_bytes).map_err(|err| {
                EnvError {
                    op,
                    dir: dir.to_path_buf(),
                    detail: format!("{err:#}"),
                }
            })?;
        if output.timed_out {
            return Err(EnvError {
                op,
                dir: dir.to_path_buf(),
                detail: format!("timed out after {:?}", self.timeout),
            });
        }
        if !output.status.success() {
            return Err(EnvError {
                op,
                dir: dir.to_path_buf(),
                detail: output.stderr_lossy(),
            });
        }
        Ok(())
    }
}

impl Default for VenvBuilder {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}

impl EnvironmentBuilder for VenvBuilder {
    #[instrument(skip(self), fields(slot_dir = %slot_dir.display()))]
    fn build_if_absent(&self, slot_dir: &Path) -> Result<PathBuf, EnvError> {
        let env_dir = slot_dir.join(ENV_DIR);
        if env_dir.exists() {
            debug!("environment already present, keeping");
            return Ok(env_dir);
        }
        info!("creating virtualenv");
        let mut cmd = Command::new("python3");
        cmd.arg("-m").arg("venv").arg(ENV_DIR);
        self.run_checked("create-env", slot_dir, cmd)?;
        Ok(env_dir)
    }

    #[instrument(skip(self), fields(slot_dir = %slot_dir.display()))]
    fn install(&self, slot_dir: &Path) -> Result<(), EnvError> {
        info!("installing application into environment");
        let pip = Path::new(ENV_DIR).join("bin").join("pip");
        let mut cmd = Command::new(pip);
        cmd.arg("install").arg("-e").arg(".");
        self.run_checked("install", slot_dir, cmd)
    }
}
