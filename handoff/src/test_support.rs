//! Test-only doubles for the external facades, plus small fixtures.
//!
//! The mocks are deliberately boring: an in-memory process table for the
//! supervisor and call recorders for version control and environment
//! building, with a few scripted failure knobs. Lifecycle tests drive the
//! real orchestration code against them without spawning processes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::app::Application;
use crate::core::state::RunState;
use crate::io::env::{ENV_DIR, EnvError, EnvironmentBuilder};
use crate::io::supervisor::{ProcessRecord, ProcessSpec, Supervisor, SupervisorError};
use crate::io::vcs::{VcsError, VersionControl};

/// Application fixture rooted in a temp directory.
pub fn test_app(root: &Path, name: &str) -> Application {
    Application {
        name: name.to_string(),
        repository: "https://example.org/demo.git".to_string(),
        entry_point: PathBuf::from("app.ini"),
        dir: root.join(name),
    }
}

#[derive(Debug, Clone)]
struct MockProc {
    #[allow(dead_code)]
    spec: ProcessSpec,
    state: RunState,
}

/// In-memory supervisor double.
#[derive(Debug)]
pub struct MockSupervisor {
    table: Mutex<HashMap<String, BTreeMap<String, MockProc>>>,
    running_supervisors: Mutex<BTreeSet<String>>,
    /// Names whose start/reload never leaves `Starting`.
    stalled: Mutex<BTreeSet<String>>,
    /// Names whose pause fails with a scripted error.
    failing_pauses: Mutex<BTreeSet<String>>,
    log_dir: PathBuf,
}

impl MockSupervisor {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            running_supervisors: Mutex::new(BTreeSet::new()),
            stalled: Mutex::new(BTreeSet::new()),
            failing_pauses: Mutex::new(BTreeSet::new()),
            log_dir: log_dir.into(),
        }
    }

    /// Make `name` hang in `Starting` forever after start/reload.
    pub fn stall(&self, name: &str) {
        self.stalled.lock().expect("lock").insert(name.to_string());
    }

    /// Make pausing `name` fail with a scripted error.
    pub fn fail_pause(&self, name: &str) {
        self.failing_pauses
            .lock()
            .expect("lock")
            .insert(name.to_string());
    }

    /// Whether the per-application supervisor instance is running.
    pub fn supervisor_running(&self, app: &str) -> bool {
        self.running_supervisors.lock().expect("lock").contains(app)
    }

    fn with_proc<T>(
        &self,
        app: &str,
        name: &str,
        f: impl FnOnce(&mut MockProc) -> Result<T, SupervisorError>,
    ) -> Result<T, SupervisorError> {
        let mut table = self.table.lock().expect("lock");
        let proc = table
            .get_mut(app)
            .and_then(|procs| procs.get_mut(name))
            .ok_or_else(|| SupervisorError::UnknownProcess(name.to_string()))?;
        f(proc)
    }
}

impl Supervisor for MockSupervisor {
    fn processes(&self, app: &str) -> Result<Vec<ProcessRecord>, SupervisorError> {
        let table = self.table.lock().expect("lock");
        Ok(table
            .get(app)
            .map(|procs| {
                procs
                    .iter()
                    .map(|(name, proc)| ProcessRecord {
                        name: name.clone(),
                        state: proc.state,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn register(&self, app: &str, name: &str, spec: &ProcessSpec) -> Result<(), SupervisorError> {
        fs::create_dir_all(&self.log_dir)
            .map_err(|err| SupervisorError::Failed(err.to_string()))?;
        fs::write(self.log_dir.join(format!("{app}-{name}.log")), b"")
            .map_err(|err| SupervisorError::Failed(err.to_string()))?;
        let mut table = self.table.lock().expect("lock");
        table.entry(app.to_string()).or_default().insert(
            name.to_string(),
            MockProc {
                spec: spec.clone(),
                state: RunState::Dormant,
            },
        );
        Ok(())
    }

    fn deregister(&self, app: &str, name: &str) -> Result<(), SupervisorError> {
        let mut table = self.table.lock().expect("lock");
        table
            .get_mut(app)
            .and_then(|procs| procs.remove(name))
            .map(|_| ())
            .ok_or_else(|| SupervisorError::UnknownProcess(name.to_string()))
    }

    fn run_state(&self, app: &str, name: &str) -> Result<RunState, SupervisorError> {
        self.with_proc(app, name, |proc| Ok(proc.state))
    }

    fn start(&self, app: &str, name: &str) -> Result<(), SupervisorError> {
        let stalled = self.stalled.lock().expect("lock").contains(name);
        self.with_proc(app, name, |proc| {
            if proc.state.is_alive() {
                return Err(SupervisorError::AlreadyRunning);
            }
            proc.state = if stalled {
                RunState::Starting
            } else {
                RunState::Running
            };
            Ok(())
        })
    }

    fn stop(&self, app: &str, name: &str) -> Result<(), SupervisorError> {
        self.with_proc(app, name, |proc| {
            if !proc.state.is_alive() {
                return Err(SupervisorError::NotRunning);
            }
            proc.state = RunState::Stopped;
            Ok(())
        })
    }

    fn pause(&self, app: &str, name: &str) -> Result<(), SupervisorError> {
        if self.failing_pauses.lock().expect("lock").contains(name) {
            return Err(SupervisorError::Failed("scripted pause failure".to_string()));
        }
        self.with_proc(app, name, |proc| match proc.state {
            RunState::Running => {
                proc.state = RunState::Paused;
                Ok(())
            }
            RunState::Paused => Err(SupervisorError::AlreadyPaused),
            _ => Err(SupervisorError::NotRunning),
        })
    }

    fn resume(&self, app: &str, name: &str) -> Result<(), SupervisorError> {
        self.with_proc(app, name, |proc| match proc.state {
            RunState::Paused => {
                proc.state = RunState::Running;
                Ok(())
            }
            RunState::Running => Err(SupervisorError::NotPaused),
            _ => Err(SupervisorError::NotRunning),
        })
    }

    fn reload(&self, app: &str, name: &str) -> Result<(), SupervisorError> {
        let stalled = self.stalled.lock().expect("lock").contains(name);
        self.with_proc(app, name, |proc| match proc.state {
            // A suspended process cannot handle the reload signal; it stays
            // paused until resumed.
            RunState::Paused => Ok(()),
            state if state.is_alive() => {
                proc.state = if stalled {
                    RunState::Starting
                } else {
                    RunState::Running
                };
                Ok(())
            }
            _ => Err(SupervisorError::NotRunning),
        })
    }

    fn regen_config(&self, app: &str, name: Option<&str>) -> Result<(), SupervisorError> {
        match name {
            Some(name) => self.with_proc(app, name, |_| Ok(())),
            None => Ok(()),
        }
    }

    fn log_path(&self, app: &str, name: &str) -> Result<PathBuf, SupervisorError> {
        self.with_proc(app, name, |_| Ok(()))?;
        Ok(self.log_dir.join(format!("{app}-{name}.log")))
    }

    fn start_supervisor(&self, app: &str) -> Result<(), SupervisorError> {
        let mut running = self.running_supervisors.lock().expect("lock");
        if !running.insert(app.to_string()) {
            return Err(SupervisorError::AlreadyRunning);
        }
        Ok(())
    }

    fn stop_supervisor(&self, app: &str) -> Result<(), SupervisorError> {
        let mut running = self.running_supervisors.lock().expect("lock");
        if !running.remove(app) {
            return Err(SupervisorError::NotRunning);
        }
        Ok(())
    }
}

/// Recording version-control double. Checkouts are empty directories with a
/// marker file.
#[derive(Debug, Default)]
pub struct MockVcs {
    clones: Mutex<Vec<(String, PathBuf)>>,
    sanitized: Mutex<Vec<PathBuf>>,
    pull_fails: Mutex<bool>,
    reset_fails: Mutex<bool>,
    sanitize_fails: Mutex<bool>,
}

impl MockVcs {
    pub fn clone_count(&self) -> usize {
        self.clones.lock().expect("lock").len()
    }

    pub fn sanitize_count(&self) -> usize {
        self.sanitized.lock().expect("lock").len()
    }

    pub fn set_pull_fails(&self, fails: bool) {
        *self.pull_fails.lock().expect("lock") = fails;
    }

    pub fn set_reset_fails(&self, fails: bool) {
        *self.reset_fails.lock().expect("lock") = fails;
    }

    pub fn set_sanitize_fails(&self, fails: bool) {
        *self.sanitize_fails.lock().expect("lock") = fails;
    }

    fn scripted(op: &'static str, dir: &Path) -> VcsError {
        VcsError {
            op,
            dir: dir.to_path_buf(),
            detail: "scripted failure".to_string(),
        }
    }
}

impl VersionControl for MockVcs {
    fn clone_repo(&self, url: &str, dest: &Path) -> Result<(), VcsError> {
        fs::create_dir_all(dest).map_err(|err| VcsError {
            op: "clone",
            dir: dest.to_path_buf(),
            detail: err.to_string(),
        })?;
        fs::write(dest.join(".checkout"), url).map_err(|err| VcsError {
            op: "clone",
            dir: dest.to_path_buf(),
            detail: err.to_string(),
        })?;
        self.clones
            .lock()
            .expect("lock")
            .push((url.to_string(), dest.to_path_buf()));
        Ok(())
    }

    fn pull(&self, dir: &Path) -> Result<(), VcsError> {
        if *self.pull_fails.lock().expect("lock") {
            return Err(Self::scripted("pull", dir));
        }
        Ok(())
    }

    fn force_update(&self, dir: &Path) -> Result<(), VcsError> {
        if *self.reset_fails.lock().expect("lock") {
            return Err(Self::scripted("force-update", dir));
        }
        Ok(())
    }

    fn sanitize(&self, dir: &Path) -> Result<(), VcsError> {
        if *self.sanitize_fails.lock().expect("lock") {
            return Err(Self::scripted("sanitize", dir));
        }
        self.sanitized.lock().expect("lock").push(dir.to_path_buf());
        Ok(())
    }

    fn has_local_changes(&self, _dir: &Path) -> Result<bool, VcsError> {
        Ok(false)
    }
}

/// Environment-builder double: the environment is just a directory.
#[derive(Debug, Clone, Copy)]
pub struct MockEnv;

impl EnvironmentBuilder for MockEnv {
    fn build_if_absent(&self, slot_dir: &Path) -> Result<PathBuf, EnvError> {
        let env_dir = slot_dir.join(ENV_DIR);
        fs::create_dir_all(&env_dir).map_err(|err| EnvError {
            op: "create-env",
            dir: slot_dir.to_path_buf(),
            detail: err.to_string(),
        })?;
        Ok(env_dir)
    }

    fn install(&self, _slot_dir: &Path) -> Result<(), EnvError> {
        Ok(())
    }
}
