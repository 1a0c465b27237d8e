//! Process-supervisor facade.
//!
//! The supervisor owns the actual OS processes and their run state; this
//! crate only references them. Lifecycle logic depends on the [`Supervisor`]
//! trait alone, so tests drive it with an in-memory double. The production
//! implementation manages one uwsgi emperor per application: registered
//! processes are ini files, starting a process places its ini under the
//! emperor's watched directory, and stopping removes it again.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::state::RunState;
use crate::io::process::run_with_timeout;

/// One known process record, as reported by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub name: String,
    pub state: RunState,
}

/// Everything the supervisor needs to launch one slot's process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// Absolute path of the slot's runtime environment.
    pub env_dir: PathBuf,
    /// Absolute path of the launch configuration inside the slot.
    pub entry_point: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The process (or supervisor instance) is not running.
    #[error("not running")]
    NotRunning,
    #[error("already running")]
    AlreadyRunning,
    #[error("already paused")]
    AlreadyPaused,
    #[error("not paused")]
    NotPaused,
    #[error("unknown process '{0}'")]
    UnknownProcess(String),
    #[error("{0}")]
    Failed(String),
}

impl SupervisorError {
    fn io(context: impl std::fmt::Display, err: std::io::Error) -> Self {
        Self::Failed(format!("{context}: {err}"))
    }
}

/// Capability interface over the external process supervisor.
///
/// Operations that are "not applicable in the current state" fail with the
/// matching benign [`SupervisorError`] variant; callers decide whether that
/// is an error or an already-satisfied intent.
pub trait Supervisor {
    /// All known process records for one application.
    fn processes(&self, app: &str) -> Result<Vec<ProcessRecord>, SupervisorError>;

    /// Create a named process record.
    fn register(&self, app: &str, name: &str, spec: &ProcessSpec) -> Result<(), SupervisorError>;

    /// Remove a named process record, releasing its name for reuse.
    fn deregister(&self, app: &str, name: &str) -> Result<(), SupervisorError>;

    fn run_state(&self, app: &str, name: &str) -> Result<RunState, SupervisorError>;

    fn start(&self, app: &str, name: &str) -> Result<(), SupervisorError>;
    fn stop(&self, app: &str, name: &str) -> Result<(), SupervisorError>;
    fn pause(&self, app: &str, name: &str) -> Result<(), SupervisorError>;
    fn resume(&self, app: &str, name: &str) -> Result<(), SupervisorError>;
    fn reload(&self, app: &str, name: &str) -> Result<(), SupervisorError>;

    /// Regenerate on-disk supervisor configuration for one record, or for
    /// the whole application when `name` is `None`.
    fn regen_config(&self, app: &str, name: Option<&str>) -> Result<(), SupervisorError>;

    /// Log file the supervisor writes for a named process.
    fn log_path(&self, app: &str, name: &str) -> Result<PathBuf, SupervisorError>;

    /// Start the per-application supervisor instance.
    fn start_supervisor(&self, app: &str) -> Result<(), SupervisorError>;

    /// Stop the per-application supervisor instance.
    fn stop_supervisor(&self, app: &str) -> Result<(), SupervisorError>;
}

/// uwsgi-emperor-backed supervisor.
///
/// State for application `app` lives under `<state_dir>/<app>/`:
/// `records/` (registered specs), `inis/` (generated vassal configs),
/// `vassals/` (the emperor's watched directory; presence means started),
/// `pids/`, `logs/`, and `marks/` (paused markers).
#[derive(Debug, Clone)]
pub struct UwsgiSupervisor {
    state_dir: PathBuf,
    uwsgi_bin: String,
    command_timeout: Duration,
}

#[derive(Debug, Clone)]
struct AppPaths {
    records: PathBuf,
    inis: PathBuf,
    vassals: PathBuf,
    pids: PathBuf,
    logs: PathBuf,
    marks: PathBuf,
    emperor_ini: PathBuf,
    emperor_pid: PathBuf,
    emperor_log: PathBuf,
}

impl UwsgiSupervisor {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            uwsgi_bin: "uwsgi".to_string(),
            command_timeout: Duration::from_secs(30),
        }
    }

    fn paths(&self, app: &str) -> AppPaths {
        let base = self.state_dir.join(app);
        AppPaths {
            records: base.join("records"),
            inis: base.join("inis"),
            vassals: base.join("vassals"),
            pids: base.join("pids"),
            logs: base.join("logs"),
            marks: base.join("marks"),
            emperor_ini: base.join("emperor.ini"),
            emperor_pid: base.join("emperor.pid"),
            emperor_log: base.join("emperor.log"),
        }
    }

    fn ensure_layout(&self, paths: &AppPaths) -> Result<(), SupervisorError> {
        for dir in [
            &paths.records,
            &paths.inis,
            &paths.vassals,
            &paths.pids,
            &paths.logs,
            &paths.marks,
        ] {
            fs::create_dir_all(dir)
                .map_err(|err| SupervisorError::io(format!("create {}", dir.display()), err))?;
        }
        Ok(())
    }

    fn load_spec(&self, paths: &AppPaths, name: &str) -> Result<ProcessSpec, SupervisorError> {
        let path = paths.records.join(format!("{name}.json"));
        if !path.is_file() {
            return Err(SupervisorError::UnknownProcess(name.to_string()));
        }
        let contents = fs::read_to_string(&path)
            .map_err(|err| SupervisorError::io(format!("read {}", path.display()), err))?;
        serde_json::from_str(&contents)
            .map_err(|err| SupervisorError::Failed(format!("parse {}: {err}", path.display())))
    }

    fn write_vassal_ini(
        &self,
        paths: &AppPaths,
        name: &str,
        spec: &ProcessSpec,
    ) -> Result<(), SupervisorError> {
        let ini = vassal_ini(
            spec,
            &paths.pids.join(format!("{name}.pid")),
            &paths.logs.join(format!("{name}.log")),
        );
        let path = paths.inis.join(format!("{name}.ini"));
        fs::write(&path, &ini)
            .map_err(|err| SupervisorError::io(format!("write {}", path.display()), err))?;
        // A started process keeps its active copy in sync.
        let active = paths.vassals.join(format!("{name}.ini"));
        if active.exists() {
            fs::write(&active, &ini)
                .map_err(|err| SupervisorError::io(format!("write {}", active.display()), err))?;
        }
        Ok(())
    }

    fn state_of(&self, paths: &AppPaths, name: &str) -> Result<RunState, SupervisorError> {
        if !paths.records.join(format!("{name}.json")).is_file() {
            return Err(SupervisorError::UnknownProcess(name.to_string()));
        }
        let active = paths.vassals.join(format!("{name}.ini")).exists();
        let pid = read_pid(&paths.pids.join(format!("{name}.pid")));
        let alive = pid.is_some_and(pid_alive);
        let paused = paths.marks.join(format!("{name}.paused")).exists();
        let state = if active {
            if !alive {
                RunState::Starting
            } else if paused {
                RunState::Paused
            } else {
                RunState::Running
            }
        } else if pid.is_some() {
            RunState::Stopped
        } else {
            RunState::Dormant
        };
        Ok(state)
    }

    fn live_pid(&self, paths: &AppPaths, name: &str) -> Result<i32, SupervisorError> {
        let pid = read_pid(&paths.pids.join(format!("{name}.pid")));
        match pid {
            Some(pid) if pid_alive(pid) => Ok(pid),
            _ => Err(SupervisorError::NotRunning),
        }
    }

    fn run_uwsgi(&self, args: &[&str]) -> Result<(), SupervisorError> {
        let mut cmd = Command::new(&self.uwsgi_bin);
        cmd.args(args);
        let output = run_with_timeout(cmd, self.command_timeout, 16 * 1024)
            .map_err(|err| SupervisorError::Failed(format!("{err:#}")))?;
        if output.timed_out {
            return Err(SupervisorError::Failed(format!(
                "uwsgi {} timed out",
                args.join(" ")
            )));
        }
        if !output.status.success() {
            return Err(SupervisorError::Failed(format!(
                "uwsgi {} failed: {}",
                args.join(" "),
                output.stderr_lossy()
            )));
        }
        Ok(())
    }
}

impl Supervisor for UwsgiSupervisor {
    fn processes(&self, app: &str) -> Result<Vec<ProcessRecord>, SupervisorError> {
        let paths = self.paths(app);
        if !paths.records.is_dir() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&paths.records)
            .map_err(|err| SupervisorError::io(format!("list {}", paths.records.display()), err))?;
        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| {
                SupervisorError::io(format!("list {}", paths.records.display()), err)
            })?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_string_lossy().strip_suffix(".json").map(String::from)
            else {
                continue;
            };
            let state = self.state_of(&paths, &name)?;
            records.push(ProcessRecord { name, state });
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    #[instrument(skip(self, spec))]
    fn register(&self, app: &str, name: &str, spec: &ProcessSpec) -> Result<(), SupervisorError> {
        let paths = self.paths(app);
        self.ensure_layout(&paths)?;
        let record = paths.records.join(format!("{name}.json"));
        let mut payload = serde_json::to_string_pretty(spec)
            .map_err(|err| SupervisorError::Failed(format!("serialize record: {err}")))?;
        payload.push('\n');
        fs::write(&record, payload)
            .map_err(|err| SupervisorError::io(format!("write {}", record.display()), err))?;
        self.write_vassal_ini(&paths, name, spec)?;
        debug!("process registered");
        Ok(())
    }

    #[instrument(skip(self))]
    fn deregister(&self, app: &str, name: &str) -> Result<(), SupervisorError> {
        let paths = self.paths(app);
        if !paths.records.join(format!("{name}.json")).is_file() {
            return Err(SupervisorError::UnknownProcess(name.to_string()));
        }
        for path in [
            paths.vassals.join(format!("{name}.ini")),
            paths.inis.join(format!("{name}.ini")),
            paths.pids.join(format!("{name}.pid")),
            paths.marks.join(format!("{name}.paused")),
            paths.records.join(format!("{name}.json")),
        ] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(SupervisorError::io(format!("remove {}", path.display()), err));
                }
            }
        }
        debug!("process deregistered");
        Ok(())
    }

    fn run_state(&self, app: &str, name: &str) -> Result<RunState, SupervisorError> {
        self.state_of(&self.paths(app), name)
    }

    #[instrument(skip(self))]
    fn start(&self, app: &str, name: &str) -> Result<(), SupervisorError> {
        let paths = self.paths(app);
        match self.state_of(&paths, name)? {
            RunState::Running | RunState::Paused => return Err(SupervisorError::AlreadyRunning),
            RunState::Starting => return Err(SupervisorError::AlreadyRunning),
            RunState::Dormant | RunState::Stopped => {}
        }
        let ini = paths.inis.join(format!("{name}.ini"));
        if !ini.is_file() {
            return Err(SupervisorError::Failed(format!(
                "no generated config for '{name}' (regenerate first)"
            )));
        }
        // Drop stale run artifacts so liveness is judged against this start.
        remove_if_exists(&paths.pids.join(format!("{name}.pid")))?;
        remove_if_exists(&paths.marks.join(format!("{name}.paused")))?;
        fs::copy(&ini, paths.vassals.join(format!("{name}.ini")))
            .map_err(|err| SupervisorError::io("activate vassal config", err))?;
        info!("start issued");
        Ok(())
    }

    #[instrument(skip(self))]
    fn stop(&self, app: &str, name: &str) -> Result<(), SupervisorError> {
        let paths = self.paths(app);
        let active = paths.vassals.join(format!("{name}.ini"));
        if !self.state_of(&paths, name)?.is_alive() || !active.exists() {
            return Err(SupervisorError::NotRunning);
        }
        remove_if_exists(&active)?;
        remove_if_exists(&paths.marks.join(format!("{name}.paused")))?;
        info!("stop issued");
        Ok(())
    }

    #[instrument(skip(self))]
    fn pause(&self, app: &str, name: &str) -> Result<(), SupervisorError> {
        let paths = self.paths(app);
        match self.state_of(&paths, name)? {
            RunState::Paused => return Err(SupervisorError::AlreadyPaused),
            RunState::Running => {}
            _ => return Err(SupervisorError::NotRunning),
        }
        let pid = self.live_pid(&paths, name)?;
        suspend_toggle(pid)?;
        let mark = paths.marks.join(format!("{name}.paused"));
        fs::write(&mark, b"")
            .map_err(|err| SupervisorError::io(format!("write {}", mark.display()), err))?;
        info!("paused");
        Ok(())
    }

    #[instrument(skip(self))]
    fn resume(&self, app: &str, name: &str) -> Result<(), SupervisorError> {
        let paths = self.paths(app);
        match self.state_of(&paths, name)? {
            RunState::Paused => {}
            RunState::Running => return Err(SupervisorError::NotPaused),
            _ => return Err(SupervisorError::NotRunning),
        }
        let pid = self.live_pid(&paths, name)?;
        suspend_toggle(pid)?;
        remove_if_exists(&paths.marks.join(format!("{name}.paused")))?;
        info!("resumed");
        Ok(())
    }

    #[instrument(skip(self))]
    fn reload(&self, app: &str, name: &str) -> Result<(), SupervisorError> {
        let paths = self.paths(app);
        if !self.state_of(&paths, name)?.is_alive() {
            return Err(SupervisorError::NotRunning);
        }
        let pid = self.live_pid(&paths, name)?;
        graceful_reload(pid)?;
        info!("reload issued");
        Ok(())
    }

    fn regen_config(&self, app: &str, name: Option<&str>) -> Result<(), SupervisorError> {
        let paths = self.paths(app);
        self.ensure_layout(&paths)?;
        match name {
            Some(name) => {
                let spec = self.load_spec(&paths, name)?;
                self.write_vassal_ini(&paths, name, &spec)
            }
            None => {
                let ini = emperor_ini(&paths);
                fs::write(&paths.emperor_ini, ini).map_err(|err| {
                    SupervisorError::io(format!("write {}", paths.emperor_ini.display()), err)
                })?;
                for record in self.processes(app)? {
                    let spec = self.load_spec(&paths, &record.name)?;
                    self.write_vassal_ini(&paths, &record.name, &spec)?;
                }
                Ok(())
            }
        }
    }

    fn log_path(&self, app: &str, name: &str) -> Result<PathBuf, SupervisorError> {
        let paths = self.paths(app);
        if !paths.records.join(format!("{name}.json")).is_file() {
            return Err(SupervisorError::UnknownProcess(name.to_string()));
        }
        Ok(paths.logs.join(format!("{name}.log")))
    }

    #[instrument(skip(self))]
    fn start_supervisor(&self, app: &str) -> Result<(), SupervisorError> {
        let paths = self.paths(app);
        self.ensure_layout(&paths)?;
        if read_pid(&paths.emperor_pid).is_some_and(pid_alive) {
            return Err(SupervisorError::AlreadyRunning);
        }
        if !paths.emperor_ini.is_file() {
            let ini = emperor_ini(&paths);
            fs::write(&paths.emperor_ini, ini).map_err(|err| {
                SupervisorError::io(format!("write {}", paths.emperor_ini.display()), err)
            })?;
        }
        let ini = paths.emperor_ini.to_string_lossy().into_owned();
        self.run_uwsgi(&["--ini", &ini])?;
        info!("supervisor started");
        Ok(())
    }

    #[instrument(skip(self))]
    fn stop_supervisor(&self, app: &str) -> Result<(), SupervisorError> {
        let paths = self.paths(app);
        if !read_pid(&paths.emperor_pid).is_some_and(pid_alive) {
            return Err(SupervisorError::NotRunning);
        }
        let pidfile = paths.emperor_pid.to_string_lossy().into_owned();
        self.run_uwsgi(&["--stop", &pidfile])?;
        remove_if_exists(&paths.emperor_pid)?;
        info!("supervisor stopped");
        Ok(())
    }
}

fn vassal_ini(spec: &ProcessSpec, pidfile: &Path, logfile: &Path) -> String {
    format!(
        "[uwsgi]\nini-paste = {}\nvirtualenv = {}\nmaster = true\npidfile = {}\ndaemonize = {}\nvacuum = true\n",
        spec.entry_point.display(),
        spec.env_dir.display(),
        pidfile.display(),
        logfile.display()
    )
}

fn emperor_ini(paths: &AppPaths) -> String {
    format!(
        "[uwsgi]\nemperor = {}\npidfile = {}\ndaemonize = {}\n",
        paths.vassals.display(),
        paths.emperor_pid.display(),
        paths.emperor_log.display()
    )
}

fn read_pid(path: &Path) -> Option<i32> {
    let contents = fs::read_to_string(path).ok()?;
    contents.trim().parse().ok()
}

fn remove_if_exists(path: &Path) -> Result<(), SupervisorError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(SupervisorError::io(format!("remove {}", path.display()), err)),
    }
}

#[cfg(unix)]
fn pid_alive(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

#[cfg(not(unix))]
fn pid_alive(_pid: i32) -> bool {
    false
}

/// uwsgi's master toggles suspend/resume on SIGTSTP.
#[cfg(unix)]
fn suspend_toggle(pid: i32) -> Result<(), SupervisorError> {
    send_signal(pid, nix::sys::signal::Signal::SIGTSTP)
}

/// SIGHUP asks the uwsgi master for a graceful reload.
#[cfg(unix)]
fn graceful_reload(pid: i32) -> Result<(), SupervisorError> {
    send_signal(pid, nix::sys::signal::Signal::SIGHUP)
}

#[cfg(unix)]
fn send_signal(pid: i32, signal: nix::sys::signal::Signal) -> Result<(), SupervisorError> {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), signal).map_err(|err| {
        warn!(pid, %signal, %err, "signal delivery failed");
        SupervisorError::Failed(format!("signal {signal} to pid {pid}: {err}"))
    })
}

#[cfg(not(unix))]
fn suspend_toggle(_pid: i32) -> Result<(), SupervisorError> {
    Err(SupervisorError::Failed(
        "process signals are not supported on this platform".to_string(),
    ))
}

#[cfg(not(unix))]
fn graceful_reload(_pid: i32) -> Result<(), SupervisorError> {
    Err(SupervisorError::Failed(
        "process signals are not supported on this platform".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(temp: &Path) -> ProcessSpec {
        ProcessSpec {
            env_dir: temp.join("slot/.venv"),
            entry_point: temp.join("slot/app.ini"),
        }
    }

    fn own_pid() -> i32 {
        i32::try_from(std::process::id()).expect("pid fits")
    }

    #[test]
    fn register_creates_dormant_record() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sup = UwsgiSupervisor::new(temp.path().join("state"));
        sup.register("demo", "alfa-bravo", &spec(temp.path()))
            .expect("register");

        assert_eq!(
            sup.run_state("demo", "alfa-bravo").expect("state"),
            RunState::Dormant
        );
        let records = sup.processes("demo").expect("processes");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "alfa-bravo");
    }

    #[test]
    fn generated_ini_binds_environment_and_entry_point() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sup = UwsgiSupervisor::new(temp.path().join("state"));
        sup.register("demo", "alfa-bravo", &spec(temp.path()))
            .expect("register");

        let ini = fs::read_to_string(
            temp.path()
                .join("state/demo/inis/alfa-bravo.ini"),
        )
        .expect("read ini");
        assert!(ini.contains("virtualenv = "));
        assert!(ini.contains(".venv"));
        assert!(ini.contains("ini-paste = "));
        assert!(ini.contains("app.ini"));
    }

    #[test]
    fn run_state_follows_vassal_and_pid() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sup = UwsgiSupervisor::new(temp.path().join("state"));
        sup.register("demo", "alfa-bravo", &spec(temp.path()))
            .expect("register");
        let paths = sup.paths("demo");

        // Start issued, no live pid yet.
        sup.start("demo", "alfa-bravo").expect("start");
        assert_eq!(
            sup.run_state("demo", "alfa-bravo").expect("state"),
            RunState::Starting
        );

        // Live pid appears (use our own pid as a stand-in).
        fs::write(paths.pids.join("alfa-bravo.pid"), own_pid().to_string()).expect("pidfile");
        assert_eq!(
            sup.run_state("demo", "alfa-bravo").expect("state"),
            RunState::Running
        );

        // Paused marker flips the report.
        fs::write(paths.marks.join("alfa-bravo.paused"), b"").expect("mark");
        assert_eq!(
            sup.run_state("demo", "alfa-bravo").expect("state"),
            RunState::Paused
        );

        // Stop removes the active config; the stale pidfile reads Stopped.
        fs::remove_file(paths.marks.join("alfa-bravo.paused")).expect("unmark");
        sup.stop("demo", "alfa-bravo").expect("stop");
        assert_eq!(
            sup.run_state("demo", "alfa-bravo").expect("state"),
            RunState::Stopped
        );
    }

    #[test]
    fn stop_without_start_is_not_running() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sup = UwsgiSupervisor::new(temp.path().join("state"));
        sup.register("demo", "alfa-bravo", &spec(temp.path()))
            .expect("register");

        let err = sup.stop("demo", "alfa-bravo").unwrap_err();
        assert!(matches!(err, SupervisorError::NotRunning), "{err}");
    }

    #[test]
    fn deregister_releases_the_name() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sup = UwsgiSupervisor::new(temp.path().join("state"));
        sup.register("demo", "alfa-bravo", &spec(temp.path()))
            .expect("register");
        sup.deregister("demo", "alfa-bravo").expect("deregister");

        assert!(sup.processes("demo").expect("processes").is_empty());
        let err = sup.run_state("demo", "alfa-bravo").unwrap_err();
        assert!(matches!(err, SupervisorError::UnknownProcess(_)), "{err}");
    }

    #[test]
    fn unknown_process_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sup = UwsgiSupervisor::new(temp.path().join("state"));
        let err = sup.run_state("demo", "ghost").unwrap_err();
        assert!(matches!(err, SupervisorError::UnknownProcess(_)), "{err}");
    }
}
