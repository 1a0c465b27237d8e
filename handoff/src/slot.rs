//! Slot lifecycle: provision, update, start with hand-over, pause, resume,
//! stop, and reload.
//!
//! A slot couples one directory under the application root, one runtime
//! environment inside it, and one supervised process of the same name. The
//! supervisor owns the process; operations here only drive it through the
//! facade and keep lifecycle calls idempotent: "already in the desired
//! state" answers are swallowed, everything else propagates.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use crate::app::Application;
use crate::core::state::RunState;
use crate::core::sweep::is_recycled_name;
use crate::error::{DeployError, Result, UpdatePhase};
use crate::io::env::EnvironmentBuilder;
use crate::io::supervisor::{ProcessSpec, Supervisor, SupervisorError};
use crate::io::vcs::VersionControl;

/// Name of the log symlink placed inside every slot directory.
pub const LOG_LINK: &str = "process.log";

/// Interval for run-state polling after start/reload.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One slot of an application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    /// Owning application name.
    pub app: String,
    /// Two-word slot name, unique within the application while a process
    /// record exists for it.
    pub name: String,
    /// Slot directory (`<app dir>/<name>`).
    pub dir: PathBuf,
}

/// Outcome of [`Slot::start`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartReport {
    /// The slot was merely paused and was resumed instead of restarted.
    pub resumed: bool,
    /// Siblings that could not be paused during hand-over, with the reason.
    /// Best-effort: these never fail the start of the primary slot.
    pub sibling_failures: Vec<(String, String)>,
}

impl Slot {
    pub fn new(app: &Application, name: &str) -> Self {
        Self {
            app: app.name.clone(),
            name: name.to_string(),
            dir: app.dir.join(name),
        }
    }

    pub fn env_dir(&self) -> PathBuf {
        self.dir.join(crate::io::env::ENV_DIR)
    }

    /// Claim a recyclable folder or perform a fresh checkout, build the
    /// runtime environment, register with the supervisor, and point the log
    /// symlink at the supervisor's log file.
    ///
    /// Partially provisioned state left behind by a failure is reclaimed by
    /// the next cleanup pass.
    #[instrument(skip_all, fields(slot = %self.qualified()))]
    pub fn provision(
        &self,
        app: &Application,
        vcs: &dyn VersionControl,
        env: &dyn EnvironmentBuilder,
        supervisor: &dyn Supervisor,
    ) -> Result<()> {
        info!("provisioning");
        if !self.claim_recycled(app, vcs)? {
            debug!(repository = %app.repository, "no recyclable folder, cloning");
            vcs.clone_repo(&app.repository, &self.dir)
                .map_err(|err| self.provision_err(err))?;
        }

        let env_dir = env
            .build_if_absent(&self.dir)
            .map_err(|err| self.provision_err(err))?;
        env.install(&self.dir)
            .map_err(|err| self.provision_err(err))?;

        let spec = ProcessSpec {
            env_dir,
            entry_point: self.dir.join(&app.entry_point),
        };
        supervisor
            .register(&self.app, &self.name, &spec)
            .map_err(|err| self.provision_err(err))?;

        self.refresh_log_link(supervisor)?;
        info!("provisioned");
        Ok(())
    }

    /// Try to claim an existing recyclable folder. First match in directory
    /// order wins; a folder that cannot be sanitized back to a pristine
    /// checkout is discarded destructively and probing continues.
    fn claim_recycled(&self, app: &Application, vcs: &dyn VersionControl) -> Result<bool> {
        let entries = fs::read_dir(&app.dir)
            .map_err(|err| DeployError::io(format!("list {}", app.dir.display()), err))?;
        for entry in entries {
            let entry =
                entry.map_err(|err| DeployError::io(format!("list {}", app.dir.display()), err))?;
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy();
            if !is_recycled_name(&name) || !entry.path().is_dir() {
                continue;
            }
            fs::rename(entry.path(), &self.dir)
                .map_err(|err| DeployError::io(format!("claim {name}"), err))?;
            match vcs.sanitize(&self.dir) {
                Ok(()) => {
                    info!(claimed = %name, "reusing recycled folder");
                    return Ok(true);
                }
                Err(err) => {
                    warn!(claimed = %name, %err, "cannot sanitize recycled folder, discarding");
                    fs::remove_dir_all(&self.dir).map_err(|err| {
                        DeployError::io(format!("discard {}", self.dir.display()), err)
                    })?;
                }
            }
        }
        Ok(false)
    }

    /// Pull the latest changes and force the working copy to match them,
    /// discarding local modifications. Never restarts a running process.
    #[instrument(skip_all, fields(slot = %self.qualified()))]
    pub fn update(&self, vcs: &dyn VersionControl) -> Result<()> {
        info!("updating");
        vcs.pull(&self.dir).map_err(|err| DeployError::Update {
            slot: self.qualified(),
            phase: UpdatePhase::Pull,
            reason: err.to_string(),
        })?;
        vcs.force_update(&self.dir)
            .map_err(|err| DeployError::Update {
                slot: self.qualified(),
                phase: UpdatePhase::Reset,
                reason: err.to_string(),
            })?;
        Ok(())
    }

    /// Start the slot and wait (bounded by `patience`) for it to reach
    /// `Running`.
    ///
    /// A paused slot is resumed instead of restarted. With `handover`, every
    /// sibling is paused once the slot is confirmed running; individual
    /// sibling failures are collected in the report rather than failing the
    /// start.
    #[instrument(skip_all, fields(slot = %self.qualified(), handover))]
    pub fn start(
        &self,
        supervisor: &dyn Supervisor,
        handover: bool,
        patience: Duration,
    ) -> Result<StartReport> {
        let mut report = StartReport::default();
        let state = supervisor.run_state(&self.app, &self.name)?;
        if state == RunState::Paused {
            debug!("paused, resuming instead of restarting");
            self.resume(supervisor)?;
            report.resumed = true;
        } else {
            supervisor.regen_config(&self.app, Some(&self.name))?;
            match supervisor.start(&self.app, &self.name) {
                Ok(()) | Err(SupervisorError::AlreadyRunning) => {}
                Err(err) => return Err(err.into()),
            }
        }

        let settled = self.wait_settled(supervisor, patience)?;
        if settled != RunState::Running {
            warn!(%settled, "did not reach running state");
            return Err(DeployError::StartFailed {
                slot: self.qualified(),
            });
        }
        info!("running");

        if handover {
            report.sibling_failures = self.pause_siblings(supervisor)?;
        }
        Ok(report)
    }

    /// Pause every sibling slot, tolerating benign answers; failures are
    /// returned, not raised.
    fn pause_siblings(&self, supervisor: &dyn Supervisor) -> Result<Vec<(String, String)>> {
        let mut failures = Vec::new();
        for record in supervisor.processes(&self.app)? {
            if record.name == self.name {
                continue;
            }
            match supervisor.pause(&self.app, &record.name) {
                Ok(()) => debug!(sibling = %record.name, "sibling paused"),
                Err(SupervisorError::NotRunning | SupervisorError::AlreadyPaused) => {}
                Err(err) => {
                    warn!(sibling = %record.name, %err, "sibling pause failed");
                    failures.push((record.name, err.to_string()));
                }
            }
        }
        Ok(failures)
    }

    /// Suspend the process, keeping it warm. A no-op if it is already
    /// paused or not running.
    pub fn pause(&self, supervisor: &dyn Supervisor) -> Result<()> {
        match supervisor.pause(&self.app, &self.name) {
            Ok(()) | Err(SupervisorError::AlreadyPaused | SupervisorError::NotRunning) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Wake a paused process. A no-op if it is not paused or not running.
    pub fn resume(&self, supervisor: &dyn Supervisor) -> Result<()> {
        match supervisor.resume(&self.app, &self.name) {
            Ok(()) | Err(SupervisorError::NotPaused | SupervisorError::NotRunning) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Stop the process. Idempotent: stopping a stopped slot succeeds.
    pub fn stop(&self, supervisor: &dyn Supervisor) -> Result<()> {
        match supervisor.stop(&self.app, &self.name) {
            Ok(()) | Err(SupervisorError::NotRunning) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Request an in-place reload and wait for the process to settle back
    /// into `Running`.
    #[instrument(skip_all, fields(slot = %self.qualified()))]
    pub fn reload(&self, supervisor: &dyn Supervisor, patience: Duration) -> Result<()> {
        supervisor.reload(&self.app, &self.name)?;
        let settled = self.wait_settled(supervisor, patience)?;
        if settled != RunState::Running {
            return Err(DeployError::StartFailed {
                slot: self.qualified(),
            });
        }
        Ok(())
    }

    /// Poll until the run state is no longer `Starting`, bounded by
    /// `patience`. Running out of patience counts as a failed start.
    fn wait_settled(&self, supervisor: &dyn Supervisor, patience: Duration) -> Result<RunState> {
        let deadline = Instant::now() + patience;
        loop {
            let state = supervisor.run_state(&self.app, &self.name)?;
            if state != RunState::Starting {
                return Ok(state);
            }
            if Instant::now() >= deadline {
                warn!(patience_secs = patience.as_secs(), "start patience exhausted");
                return Err(DeployError::StartFailed {
                    slot: self.qualified(),
                });
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn refresh_log_link(&self, supervisor: &dyn Supervisor) -> Result<()> {
        let link = self.dir.join(LOG_LINK);
        match fs::remove_file(&link) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(DeployError::io(format!("remove {}", link.display()), err));
            }
        }
        let target = supervisor.log_path(&self.app, &self.name)?;
        link_log(&target, &link)
            .map_err(|err| DeployError::io(format!("link {}", link.display()), err))
    }

    /// `app/name`, as operators type it.
    pub fn qualified(&self) -> String {
        format!("{}/{}", self.app, self.name)
    }

    fn provision_err(&self, err: impl std::fmt::Display) -> DeployError {
        DeployError::Provision {
            slot: self.qualified(),
            reason: err.to_string(),
        }
    }
}

#[cfg(unix)]
fn link_log(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn link_log(_target: &Path, _link: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockEnv, MockSupervisor, MockVcs, test_app};

    #[test]
    fn pause_and_stop_are_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let app = test_app(temp.path(), "demo");
        let supervisor = MockSupervisor::new(temp.path().join("logs"));
        let vcs = MockVcs::default();
        let env = MockEnv;
        std::fs::create_dir_all(&app.dir).expect("app dir");

        let slot = app
            .create_slot(Some("alfa-bravo"), &vcs, &env, &supervisor)
            .expect("create");
        slot.start(&supervisor, false, Duration::from_secs(1))
            .expect("start");

        slot.pause(&supervisor).expect("pause");
        slot.pause(&supervisor).expect("pause again is a no-op");
        assert_eq!(
            supervisor.run_state("demo", "alfa-bravo").expect("state"),
            RunState::Paused
        );

        slot.stop(&supervisor).expect("stop");
        slot.stop(&supervisor).expect("stop again is a no-op");
        assert_eq!(
            supervisor.run_state("demo", "alfa-bravo").expect("state"),
            RunState::Stopped
        );
    }

    #[test]
    fn start_resumes_a_paused_slot() {
        let temp = tempfile::tempdir().expect("tempdir");
        let app = test_app(temp.path(), "demo");
        let supervisor = MockSupervisor::new(temp.path().join("logs"));
        let vcs = MockVcs::default();
        let env = MockEnv;
        std::fs::create_dir_all(&app.dir).expect("app dir");

        let slot = app
            .create_slot(Some("alfa-bravo"), &vcs, &env, &supervisor)
            .expect("create");
        slot.start(&supervisor, false, Duration::from_secs(1))
            .expect("start");
        slot.pause(&supervisor).expect("pause");

        let report = slot
            .start(&supervisor, false, Duration::from_secs(1))
            .expect("restart");
        assert!(report.resumed);
        assert_eq!(
            supervisor.run_state("demo", "alfa-bravo").expect("state"),
            RunState::Running
        );
    }

    #[test]
    fn start_fails_when_stuck_in_starting() {
        let temp = tempfile::tempdir().expect("tempdir");
        let app = test_app(temp.path(), "demo");
        let supervisor = MockSupervisor::new(temp.path().join("logs"));
        let vcs = MockVcs::default();
        let env = MockEnv;
        std::fs::create_dir_all(&app.dir).expect("app dir");

        let slot = app
            .create_slot(Some("alfa-bravo"), &vcs, &env, &supervisor)
            .expect("create");
        supervisor.stall("alfa-bravo");

        let err = slot
            .start(&supervisor, false, Duration::from_millis(250))
            .unwrap_err();
        assert!(matches!(err, DeployError::StartFailed { .. }), "{err}");
    }

    #[test]
    fn reload_does_not_wake_a_paused_slot() {
        let temp = tempfile::tempdir().expect("tempdir");
        let app = test_app(temp.path(), "demo");
        let supervisor = MockSupervisor::new(temp.path().join("logs"));
        let vcs = MockVcs::default();
        let env = MockEnv;
        std::fs::create_dir_all(&app.dir).expect("app dir");

        let slot = app
            .create_slot(Some("alfa-bravo"), &vcs, &env, &supervisor)
            .expect("create");
        slot.start(&supervisor, false, Duration::from_secs(1))
            .expect("start");
        slot.pause(&supervisor).expect("pause");

        // The suspended process never handles the reload signal, so the slot
        // does not settle into running.
        let err = slot
            .reload(&supervisor, Duration::from_millis(250))
            .unwrap_err();
        assert!(matches!(err, DeployError::StartFailed { .. }), "{err}");
        assert_eq!(
            supervisor.run_state("demo", "alfa-bravo").expect("state"),
            RunState::Paused
        );
    }

    #[test]
    fn update_distinguishes_pull_and_reset_failures() {
        let temp = tempfile::tempdir().expect("tempdir");
        let app = test_app(temp.path(), "demo");
        let vcs = MockVcs::default();
        std::fs::create_dir_all(&app.dir).expect("app dir");
        let slot = Slot::new(&app, "alfa-bravo");

        vcs.set_pull_fails(true);
        let err = slot.update(&vcs).unwrap_err();
        match err {
            DeployError::Update { phase, .. } => assert_eq!(phase, UpdatePhase::Pull),
            other => panic!("unexpected error: {other}"),
        }

        vcs.set_pull_fails(false);
        vcs.set_reset_fails(true);
        let err = slot.update(&vcs).unwrap_err();
        match err {
            DeployError::Update { phase, .. } => assert_eq!(phase, UpdatePhase::Reset),
            other => panic!("unexpected error: {other}"),
        }
    }
}
