//! Application registry: owns the slot storage root for one deployable
//! application and hands out [`Slot`] views over the supervisor's process
//! set.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, instrument};

use crate::core::naming;
use crate::core::state::RunState;
use crate::error::{DeployError, Result};
use crate::io::config::AppConfig;
use crate::io::env::EnvironmentBuilder;
use crate::io::supervisor::{Supervisor, SupervisorError};
use crate::io::vcs::VersionControl;
use crate::recycle::{self, CleanupReport};
use crate::slot::Slot;

/// Attempts before giving up on minting an unused name.
const MINT_ATTEMPTS: usize = 32;

/// One deployable application and its slot storage root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Application {
    pub name: String,
    /// Source repository the slots are cloned from.
    pub repository: String,
    /// Launch configuration path inside each slot.
    pub entry_point: PathBuf,
    /// Application directory (`<root>/<name>`); used exclusively for this
    /// application's slots and recycling artifacts.
    pub dir: PathBuf,
}

impl Application {
    pub fn from_config(name: &str, config: &AppConfig, root: &Path) -> Self {
        Self {
            name: name.to_string(),
            repository: config.repository.clone(),
            entry_point: config.entry_point.clone(),
            dir: root.join(name),
        }
    }

    /// First-time (and repeatable) initialization: create the application
    /// directory, stop any previous supervisor instance, reclaim leftovers,
    /// regenerate supervisor configuration, and start the supervisor.
    #[instrument(skip_all, fields(app = %self.name))]
    pub fn initialize(&self, supervisor: &dyn Supervisor) -> Result<CleanupReport> {
        fs::create_dir_all(&self.dir).map_err(|err| {
            DeployError::Configuration(format!(
                "cannot initialize folder of {}: {err}",
                self.name
            ))
        })?;
        match supervisor.stop_supervisor(&self.name) {
            Ok(()) | Err(SupervisorError::NotRunning) => {}
            Err(err) => return Err(err.into()),
        }
        let report = recycle::cleanup(self, supervisor)?;
        supervisor.regen_config(&self.name, None)?;
        supervisor.start_supervisor(&self.name)?;
        info!("initialized");
        Ok(report)
    }

    /// Create and provision a new slot. Without an explicit name, one is
    /// minted and re-minted until it collides with neither a registered
    /// process nor an existing directory.
    #[instrument(skip_all, fields(app = %self.name))]
    pub fn create_slot(
        &self,
        name: Option<&str>,
        vcs: &dyn VersionControl,
        env: &dyn EnvironmentBuilder,
        supervisor: &dyn Supervisor,
    ) -> Result<Slot> {
        let name = match name {
            Some(name) => {
                naming::validate_name(name)?;
                if self.dir.join(name).exists() {
                    return Err(DeployError::Provision {
                        slot: format!("{}/{name}", self.name),
                        reason: "a directory with this name already exists".to_string(),
                    });
                }
                name.to_string()
            }
            None => self.mint_unused(supervisor)?,
        };
        info!(slot = %name, "creating slot");
        let slot = Slot::new(self, &name);
        slot.provision(self, vcs, env, supervisor)?;
        Ok(slot)
    }

    fn mint_unused(&self, supervisor: &dyn Supervisor) -> Result<String> {
        let mut taken: BTreeSet<String> = supervisor
            .processes(&self.name)?
            .into_iter()
            .map(|record| record.name)
            .collect();
        if let Ok(entries) = fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                taken.insert(entry.file_name().to_string_lossy().into_owned());
            }
        }
        let mut rng = rand::thread_rng();
        for _ in 0..MINT_ATTEMPTS {
            let name = naming::mint(&mut rng);
            if !taken.contains(&name) {
                return Ok(name);
            }
        }
        Err(DeployError::Provision {
            slot: self.name.clone(),
            reason: format!("could not mint an unused slot name in {MINT_ATTEMPTS} attempts"),
        })
    }

    /// All slots known to the supervisor, with their run states.
    pub fn slots(&self, supervisor: &dyn Supervisor) -> Result<Vec<(Slot, RunState)>> {
        let records = supervisor.processes(&self.name)?;
        Ok(records
            .into_iter()
            .map(|record| (Slot::new(self, &record.name), record.state))
            .collect())
    }

    /// Slot view for a known process name.
    pub fn slot(&self, supervisor: &dyn Supervisor, name: &str) -> Result<Slot> {
        let known = supervisor
            .processes(&self.name)?
            .into_iter()
            .any(|record| record.name == name);
        if !known {
            return Err(DeployError::NotFound(format!("{}/{name}", self.name)));
        }
        Ok(Slot::new(self, name))
    }
}

/// Find a slot by resolved name across every application.
///
/// Succeeds only when exactly one application knows the name.
pub fn find_slot<'a>(
    apps: &'a [Application],
    supervisor: &dyn Supervisor,
    name: &str,
) -> Result<(&'a Application, Slot)> {
    let mut matches = Vec::new();
    for app in apps {
        if supervisor
            .processes(&app.name)?
            .iter()
            .any(|record| record.name == name)
        {
            matches.push(app);
        }
    }
    match matches.as_slice() {
        [] => Err(DeployError::NotFound(name.to_string())),
        [app] => Ok((app, Slot::new(app, name))),
        _ => Err(DeployError::AmbiguousAlias(name.to_string())),
    }
}
