//! Version-control facade for slot working copies.
//!
//! Slot provisioning and updates only ever need a handful of operations, so
//! we keep a small explicit wrapper around `git` subprocess calls. The trait
//! seam exists so lifecycle tests can run against a scripted double without
//! touching the network.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tracing::{debug, instrument};

use crate::io::process::run_with_timeout;

/// Failure of one version-control operation, with captured diagnostics.
#[derive(Debug, thiserror::Error)]
#[error("{op} in {}: {detail}", dir.display())]
pub struct VcsError {
    pub op: &'static str,
    pub dir: PathBuf,
    pub detail: String,
}

/// Narrow interface over the version-control tool.
pub trait VersionControl {
    /// Check out a fresh working copy of `url` at `dest`.
    fn clone_repo(&self, url: &str, dest: &Path) -> Result<(), VcsError>;

    /// Fetch the latest changes without touching the working copy.
    fn pull(&self, dir: &Path) -> Result<(), VcsError>;

    /// Force the working copy to the latest fetched revision, discarding
    /// local modifications.
    fn force_update(&self, dir: &Path) -> Result<(), VcsError>;

    /// Remove untracked files and reset tracked ones, returning the copy to
    /// a pristine checkout of its current revision.
    fn sanitize(&self, dir: &Path) -> Result<(), VcsError>;

    /// Whether the working copy differs from its checked-out revision.
    fn has_local_changes(&self, dir: &Path) -> Result<bool, VcsError>;
}

/// `git`-backed implementation.
#[derive(Debug, Clone)]
pub struct GitVcs {
    timeout: Duration,
    output_limit_bytes: usize,
}

impl GitVcs {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            output_limit_bytes: 64 * 1024,
        }
    }

    #[instrument(skip(self), fields(args = args.join(" ")))]
    fn run_checked(
        &self,
        op: &'static str,
        dir: &Path,
        args: &[&str],
    ) -> Result<String, VcsError> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(dir);
        let output = run_with_timeout(cmd, self.timeout, self.output_limit_bytes).map_err(
            |err| VcsError {
                op,
                dir: dir.to_path_buf(),
                detail: format!("{err:#}"),
            },
        )?;
        if output.timed_out {
            return Err(VcsError {
                op,
                dir: dir.to_path_buf(),
                detail: format!("git {} timed out after {:?}", args.join(" "), self.timeout),
            });
        }
        if !output.status.success() {
            return Err(VcsError {
                op,
                dir: dir.to_path_buf(),
                detail: format!("git {} failed: {}", args.join(" "), output.stderr_lossy()),
            });
        }
        debug!(op, "git operation succeeded");
        Ok(output.stdout_lossy())
    }
}

impl Default for GitVcs {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}

impl VersionControl for GitVcs {
    fn clone_repo(&self, url: &str, dest: &Path) -> Result<(), VcsError> {
        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        let target = dest.to_string_lossy().into_owned();
        self.run_checked("clone", parent, &["clone", url, &target])?;
        Ok(())
    }

    fn pull(&self, dir: &Path) -> Result<(), VcsError> {
        self.run_checked("pull", dir, &["fetch", "--prune"])?;
        Ok(())
    }

    fn force_update(&self, dir: &Path) -> Result<(), VcsError> {
        self.run_checked("force-update", dir, &["reset", "--hard", "@{upstream}"])?;
        Ok(())
    }

    fn sanitize(&self, dir: &Path) -> Result<(), VcsError> {
        self.run_checked("sanitize", dir, &["clean", "-fd"])?;
        self.run_checked("sanitize", dir, &["reset", "--hard"])?;
        Ok(())
    }

    fn has_local_changes(&self, dir: &Path) -> Result<bool, VcsError> {
        let out = self.run_checked("status", dir, &["status", "--porcelain"])?;
        Ok(!out.is_empty())
    }
}
