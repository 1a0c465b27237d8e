//! Reconcile on-disk slot directories against the supervisor's process
//! table.
//!
//! Dead slots are retired into the recycled pool (their directories renamed
//! to the reserved `_unused_N` pattern so the checkout and environment can be
//! reused), garbage is deleted, and directories of alive processes are left
//! untouched. A single operator/automation process is assumed per
//! application; concurrent cleanups of the same root are not coordinated.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use tracing::{debug, info, instrument, warn};

use crate::app::Application;
use crate::core::sweep::{SUFFIX_PROBE_LIMIT, SweepAction, classify, recycled_name};
use crate::error::{DeployError, Result};
use crate::io::supervisor::Supervisor;

/// What one cleanup pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Slot names with an alive process whose directories were kept.
    pub live: Vec<String>,
    /// Directories renamed into the recycled pool (`old name -> new name`).
    pub retired: Vec<(String, String)>,
    /// Entries deleted as garbage.
    pub deleted: Vec<String>,
    /// Per-item failures; the pass continues past them.
    pub failures: Vec<(String, String)>,
}

/// Run one cleanup pass for an application.
///
/// Per-record failures (deregister, rename) and per-entry delete failures
/// are accumulated in the report. A failure to list the application
/// directory is fatal: without a complete listing no deletion decision is
/// safe.
#[instrument(skip_all, fields(app = %app.name))]
pub fn cleanup(app: &Application, supervisor: &dyn Supervisor) -> Result<CleanupReport> {
    let mut report = CleanupReport::default();
    let mut live = BTreeSet::new();

    // Pass 1: retire records without an alive process. The suffix cursor is
    // monotone across the pass so retired folders never collide with each
    // other, and probing starts from the filesystem's current state.
    let mut suffix = 0u32;
    for record in supervisor.processes(&app.name)? {
        if record.state.is_alive() {
            live.insert(record.name.clone());
            continue;
        }
        debug!(slot = %record.name, state = %record.state, "retiring dead record");
        if let Err(err) = supervisor.deregister(&app.name, &record.name) {
            warn!(slot = %record.name, %err, "deregister failed, skipping");
            report
                .failures
                .push((record.name.clone(), format!("deregister: {err}")));
            continue;
        }
        let dir = app.dir.join(&record.name);
        if !dir.is_dir() {
            continue;
        }
        match retire_dir(&app.dir, &dir, &mut suffix, SUFFIX_PROBE_LIMIT) {
            Ok(new_name) => report.retired.push((record.name.clone(), new_name)),
            Err(err) => {
                warn!(slot = %record.name, %err, "retire failed, skipping");
                report.failures.push((record.name.clone(), err.to_string()));
            }
        }
    }

    // Pass 2: sweep the post-rename listing.
    let entries = fs::read_dir(&app.dir)
        .map_err(|err| DeployError::io(format!("list {}", app.dir.display()), err))?;
    for entry in entries {
        let entry =
            entry.map_err(|err| DeployError::io(format!("list {}", app.dir.display()), err))?;
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy().into_owned();
        let is_dir = entry.path().is_dir();
        match classify(&name, is_dir, &live) {
            SweepAction::Keep => report.live.push(name),
            SweepAction::KeepRecycled => {}
            SweepAction::Delete => {
                debug!(entry = %name, "deleting garbage");
                let removed = if is_dir {
                    fs::remove_dir_all(entry.path())
                } else {
                    fs::remove_file(entry.path())
                };
                match removed {
                    Ok(()) => report.deleted.push(name),
                    Err(err) => {
                        warn!(entry = %name, %err, "delete failed, skipping");
                        report.failures.push((name, format!("delete: {err}")));
                    }
                }
            }
        }
    }

    report.live.sort();
    info!(
        live = report.live.len(),
        retired = report.retired.len(),
        deleted = report.deleted.len(),
        failures = report.failures.len(),
        "cleanup finished"
    );
    Ok(report)
}

/// Rename `dir` to the lowest unused `_unused_N` name, probing upward on
/// collision. The probe is bounded; exhaustion is an error.
fn retire_dir(app_dir: &Path, dir: &Path, suffix: &mut u32, limit: u32) -> Result<String> {
    loop {
        if *suffix >= limit {
            return Err(DeployError::SuffixExhausted {
                dir: app_dir.to_path_buf(),
                limit,
            });
        }
        let candidate = recycled_name(*suffix);
        let target = app_dir.join(&candidate);
        if target.exists() {
            *suffix += 1;
            continue;
        }
        match fs::rename(dir, &target) {
            Ok(()) => {
                debug!(from = %dir.display(), to = %candidate, "retired");
                return Ok(candidate);
            }
            // Lost a race against something that took the name between the
            // existence check and the rename; keep probing.
            Err(_) if target.exists() => *suffix += 1,
            Err(err) => {
                return Err(DeployError::io(
                    format!("rename {} -> {candidate}", dir.display()),
                    err,
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::supervisor::{ProcessSpec, Supervisor};
    use crate::test_support::{MockSupervisor, test_app};
    use std::path::PathBuf;

    fn register(supervisor: &MockSupervisor, name: &str) {
        supervisor
            .register(
                "demo",
                name,
                &ProcessSpec {
                    env_dir: PathBuf::from("/tmp/x/.venv"),
                    entry_point: PathBuf::from("/tmp/x/app.ini"),
                },
            )
            .expect("register");
    }

    #[test]
    fn retire_probe_exhaustion_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        for i in 0..3 {
            fs::create_dir(temp.path().join(recycled_name(i))).expect("pool");
        }
        let dir = temp.path().join("alfa-bravo");
        fs::create_dir(&dir).expect("slot dir");

        let mut suffix = 0;
        let err = retire_dir(temp.path(), &dir, &mut suffix, 3).unwrap_err();
        assert!(
            matches!(err, DeployError::SuffixExhausted { limit: 3, .. }),
            "{err}"
        );
        assert!(dir.is_dir());
    }

    #[test]
    fn cleanup_records_exhaustion_and_keeps_sweeping() {
        let temp = tempfile::tempdir().expect("tempdir");
        let app = test_app(temp.path(), "demo");
        let supervisor = MockSupervisor::new(temp.path().join("logs"));
        fs::create_dir_all(&app.dir).expect("app dir");
        for i in 0..SUFFIX_PROBE_LIMIT {
            fs::create_dir(app.dir.join(recycled_name(i))).expect("pool");
        }
        register(&supervisor, "alfa-bravo");
        fs::create_dir(app.dir.join("alfa-bravo")).expect("live dir");
        supervisor.start("demo", "alfa-bravo").expect("start");
        register(&supervisor, "echo-foxtrot");
        fs::create_dir(app.dir.join("echo-foxtrot")).expect("dead dir");

        let report = cleanup(&app, &supervisor).expect("cleanup");
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "echo-foxtrot");
        assert!(report.failures[0].1.contains("suffix"), "{}", report.failures[0].1);

        // The pass carried on: the live slot is untouched and the
        // unretirable directory fell through to the garbage sweep.
        assert_eq!(report.live, vec!["alfa-bravo"]);
        assert!(app.dir.join("alfa-bravo").is_dir());
        assert!(report.deleted.contains(&"echo-foxtrot".to_string()));
        assert!(!app.dir.join("echo-foxtrot").exists());
    }
}
