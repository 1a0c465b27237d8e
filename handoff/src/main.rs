//! Slot deployment CLI.
//!
//! Thin glue over the library: loads the TOML configuration, wires the
//! production facades (git, virtualenv, uwsgi emperor), and maps one
//! subcommand to one library operation. Operator-facing output goes to
//! stdout; diagnostics go through tracing to stderr.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use clap::{Parser, Subcommand};

use handoff::app::{self, Application};
use handoff::core::naming;
use handoff::core::state::RunState;
use handoff::io::config::{DeployConfig, load_config};
use handoff::io::env::VenvBuilder;
use handoff::io::supervisor::{Supervisor, UwsgiSupervisor};
use handoff::io::vcs::{GitVcs, VersionControl};
use handoff::recycle::{self, CleanupReport};
use handoff::slot::Slot;

#[derive(Parser)]
#[command(
    name = "handoff",
    version,
    about = "Zero-downtime slot deployment manager"
)]
struct Cli {
    /// Path to the deployment configuration file.
    #[arg(short, long, default_value = "handoff.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize every configured application and start its supervisor.
    Init,
    /// Retire dead slots into the recycled pool and delete garbage.
    Cleanup {
        /// Only clean up this application.
        app: Option<String>,
    },
    /// List every slot with its run state.
    Status,
    /// Provision a new slot for an application.
    CreateSlot {
        /// Application name from the configuration.
        app: String,
        /// Explicit slot name; minted when omitted.
        #[arg(long)]
        name: Option<String>,
    },
    /// Fetch the latest code into a slot, discarding local changes.
    Update {
        /// Slot: `app/name`, `app/ab`, a full name, or a two-letter alias.
        alias: String,
        /// Update even while the slot's process is alive, then reload it.
        #[arg(long)]
        force: bool,
    },
    /// Start a slot and hand over: pause its siblings once it is running.
    Start {
        /// Slot: `app/name`, `app/ab`, a full name, or a two-letter alias.
        alias: String,
        /// Leave siblings running instead of pausing them.
        #[arg(long)]
        multi: bool,
    },
    /// Pause a slot's process, keeping it warm.
    Pause {
        /// Slot: `app/name`, `app/ab`, a full name, or a two-letter alias.
        alias: String,
    },
    /// Stop a slot's process.
    Stop {
        /// Slot: `app/name`, `app/ab`, a full name, or a two-letter alias.
        alias: String,
    },
    /// Gracefully reload a slot's process in place.
    Reload {
        /// Slot: `app/name`, `app/ab`, a full name, or a two-letter alias.
        alias: String,
    },
    /// Write a slot's process log to stdout.
    Log {
        /// Slot: `app/name`, `app/ab`, a full name, or a two-letter alias.
        alias: String,
    },
}

/// Everything a command needs: configuration plus the production facades.
struct Context {
    apps: Vec<Application>,
    vcs: GitVcs,
    env: VenvBuilder,
    supervisor: UwsgiSupervisor,
    start_patience: Duration,
}

impl Context {
    fn load(path: &Path) -> Result<Self> {
        let config = load_config(path)?;
        Ok(Self::from_config(&config))
    }

    fn from_config(config: &DeployConfig) -> Self {
        let apps = config
            .apps
            .iter()
            .map(|(name, app)| Application::from_config(name, app, &config.root))
            .collect();
        let subprocess_timeout = Duration::from_secs(config.subprocess_timeout_secs);
        Self {
            apps,
            vcs: GitVcs::new(subprocess_timeout),
            env: VenvBuilder::new(subprocess_timeout),
            supervisor: UwsgiSupervisor::new(config.root.join(".supervisor")),
            start_patience: Duration::from_secs(config.start_patience_secs),
        }
    }

    fn app(&self, name: &str) -> Result<&Application> {
        self.apps
            .iter()
            .find(|app| app.name == name)
            .with_context(|| format!("no application '{name}' in the configuration"))
    }

    /// Resolve an operator-typed slot reference.
    ///
    /// `app/name` and `app/ab` are looked up within one application; a bare
    /// name or alias must match exactly one slot across all of them.
    fn resolve(&self, alias: &str) -> Result<(&Application, Slot)> {
        match alias.split_once('/') {
            Some((app_name, rest)) => {
                let app = self.app(app_name)?;
                let name = naming::resolve(rest)?;
                let slot = app.slot(&self.supervisor, &name)?;
                Ok((app, slot))
            }
            None => {
                let name = naming::resolve(alias)?;
                Ok(app::find_slot(&self.apps, &self.supervisor, &name)?)
            }
        }
    }
}

fn main() {
    handoff::logging::init();
    if let Err(err) = run() {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let ctx = Context::load(&cli.config)?;
    match cli.command {
        Command::Init => cmd_init(&ctx),
        Command::Cleanup { app } => cmd_cleanup(&ctx, app.as_deref()),
        Command::Status => cmd_status(&ctx),
        Command::CreateSlot { app, name } => cmd_create_slot(&ctx, &app, name.as_deref()),
        Command::Update { alias, force } => cmd_update(&ctx, &alias, force),
        Command::Start { alias, multi } => cmd_start(&ctx, &alias, multi),
        Command::Pause { alias } => cmd_pause(&ctx, &alias),
        Command::Stop { alias } => cmd_stop(&ctx, &alias),
        Command::Reload { alias } => cmd_reload(&ctx, &alias),
        Command::Log { alias } => cmd_log(&ctx, &alias),
    }
}

fn cmd_init(ctx: &Context) -> Result<()> {
    if ctx.apps.is_empty() {
        bail!("no applications configured");
    }
    for app in &ctx.apps {
        let report = app.initialize(&ctx.supervisor)?;
        println!("{}: initialized", app.name);
        print_report(&app.name, &report);
    }
    Ok(())
}

fn cmd_cleanup(ctx: &Context, only: Option<&str>) -> Result<()> {
    let apps: Vec<&Application> = match only {
        Some(name) => vec![ctx.app(name)?],
        None => ctx.apps.iter().collect(),
    };
    for app in apps {
        let report = recycle::cleanup(app, &ctx.supervisor)?;
        print_report(&app.name, &report);
    }
    Ok(())
}

fn print_report(app: &str, report: &CleanupReport) {
    for (old, new) in &report.retired {
        println!("{app}: retired {old} -> {new}");
    }
    for name in &report.deleted {
        println!("{app}: deleted {name}");
    }
    for (name, reason) in &report.failures {
        println!("{app}: FAILED {name}: {reason}");
    }
}

fn cmd_status(ctx: &Context) -> Result<()> {
    for app in &ctx.apps {
        for (slot, state) in app.slots(&ctx.supervisor)? {
            let modified = slot.dir.is_dir()
                && ctx
                    .vcs
                    .has_local_changes(&slot.dir)
                    .with_context(|| format!("status of {}", slot.qualified()))?;
            let flag = if modified { "  (modified)" } else { "" };
            println!("{:<32} {}{}", slot.qualified(), state, flag);
        }
    }
    Ok(())
}

fn cmd_create_slot(ctx: &Context, app: &str, name: Option<&str>) -> Result<()> {
    let app = ctx.app(app)?;
    let slot = app.create_slot(name, &ctx.vcs, &ctx.env, &ctx.supervisor)?;
    println!("{}", slot.qualified());
    Ok(())
}

fn cmd_update(ctx: &Context, alias: &str, force: bool) -> Result<()> {
    let (_, slot) = ctx.resolve(alias)?;
    let reloaded =
        update_and_maybe_reload(&slot, &ctx.vcs, &ctx.supervisor, force, ctx.start_patience)?;
    println!("{}: updated", slot.qualified());
    if reloaded {
        println!("{}: reloaded", slot.qualified());
    }
    Ok(())
}

/// Update the working copy, reloading the process only when it is actively
/// serving.
///
/// Only a `Running` process demands `--force`. A suspended process cannot
/// act on a reload signal until resumed, so paused slots update without
/// `--force` and are left paused. Returns whether a reload was issued.
fn update_and_maybe_reload(
    slot: &Slot,
    vcs: &dyn VersionControl,
    supervisor: &dyn Supervisor,
    force: bool,
    patience: Duration,
) -> Result<bool> {
    let running = supervisor.run_state(&slot.app, &slot.name)? == RunState::Running;
    if running && !force {
        bail!(
            "{} is running; pass --force to update and reload it",
            slot.qualified()
        );
    }
    slot.update(vcs)?;
    if running {
        slot.reload(supervisor, patience)?;
    }
    Ok(running)
}

fn cmd_start(ctx: &Context, alias: &str, multi: bool) -> Result<()> {
    let (_, slot) = ctx.resolve(alias)?;
    let report = slot.start(&ctx.supervisor, !multi, ctx.start_patience)?;
    if report.resumed {
        println!("{}: resumed", slot.qualified());
    } else {
        println!("{}: running", slot.qualified());
    }
    for (sibling, reason) in &report.sibling_failures {
        println!("warning: could not pause sibling {sibling}: {reason}");
    }
    Ok(())
}

fn cmd_pause(ctx: &Context, alias: &str) -> Result<()> {
    let (_, slot) = ctx.resolve(alias)?;
    slot.pause(&ctx.supervisor)?;
    println!("{}: paused", slot.qualified());
    Ok(())
}

fn cmd_stop(ctx: &Context, alias: &str) -> Result<()> {
    let (_, slot) = ctx.resolve(alias)?;
    slot.stop(&ctx.supervisor)?;
    println!("{}: stopped", slot.qualified());
    Ok(())
}

fn cmd_reload(ctx: &Context, alias: &str) -> Result<()> {
    let (_, slot) = ctx.resolve(alias)?;
    slot.reload(&ctx.supervisor, ctx.start_patience)?;
    println!("{}: reloaded", slot.qualified());
    Ok(())
}

fn cmd_log(ctx: &Context, alias: &str) -> Result<()> {
    let (_, slot) = ctx.resolve(alias)?;
    let path = ctx.supervisor.log_path(&slot.app, &slot.name)?;
    let mut file = std::fs::File::open(&path)
        .with_context(|| format!("open log {}", path.display()))?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    std::io::copy(&mut file, &mut out).context("write log to stdout")?;
    out.flush().context("flush stdout")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use handoff::test_support::{MockEnv, MockSupervisor, MockVcs, test_app};

    fn started_slot(
        temp: &std::path::Path,
        supervisor: &MockSupervisor,
        vcs: &MockVcs,
    ) -> Slot {
        let app = test_app(temp, "demo");
        std::fs::create_dir_all(&app.dir).expect("app dir");
        let slot = app
            .create_slot(Some("alfa-bravo"), vcs, &MockEnv, supervisor)
            .expect("create");
        slot.start(supervisor, false, Duration::from_secs(1))
            .expect("start");
        slot
    }

    #[test]
    fn update_refuses_a_running_slot_without_force() {
        let temp = tempfile::tempdir().expect("tempdir");
        let supervisor = MockSupervisor::new(temp.path().join("logs"));
        let vcs = MockVcs::default();
        let slot = started_slot(temp.path(), &supervisor, &vcs);

        let err = update_and_maybe_reload(
            &slot,
            &vcs,
            &supervisor,
            false,
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert!(err.to_string().contains("--force"), "{err}");
        assert_eq!(
            supervisor.run_state("demo", "alfa-bravo").expect("state"),
            RunState::Running
        );
    }

    #[test]
    fn update_of_a_paused_slot_needs_no_force_and_skips_the_reload() {
        let temp = tempfile::tempdir().expect("tempdir");
        let supervisor = MockSupervisor::new(temp.path().join("logs"));
        let vcs = MockVcs::default();
        let slot = started_slot(temp.path(), &supervisor, &vcs);
        slot.pause(&supervisor).expect("pause");

        let reloaded = update_and_maybe_reload(
            &slot,
            &vcs,
            &supervisor,
            false,
            Duration::from_secs(1),
        )
        .expect("update");
        assert!(!reloaded);
        assert_eq!(
            supervisor.run_state("demo", "alfa-bravo").expect("state"),
            RunState::Paused
        );
    }

    #[test]
    fn forced_update_reloads_a_running_slot() {
        let temp = tempfile::tempdir().expect("tempdir");
        let supervisor = MockSupervisor::new(temp.path().join("logs"));
        let vcs = MockVcs::default();
        let slot = started_slot(temp.path(), &supervisor, &vcs);

        let reloaded = update_and_maybe_reload(
            &slot,
            &vcs,
            &supervisor,
            true,
            Duration::from_secs(1),
        )
        .expect("update");
        assert!(reloaded);
        assert_eq!(
            supervisor.run_state("demo", "alfa-bravo").expect("state"),
            RunState::Running
        );
    }

    #[test]
    fn parse_status() {
        let cli = Cli::parse_from(["handoff", "status"]);
        assert!(matches!(cli.command, Command::Status));
        assert_eq!(cli.config, PathBuf::from("handoff.toml"));
    }

    #[test]
    fn parse_create_slot_with_name() {
        let cli = Cli::parse_from(["handoff", "create-slot", "demo", "--name", "alfa-bravo"]);
        match cli.command {
            Command::CreateSlot { app, name } => {
                assert_eq!(app, "demo");
                assert_eq!(name.as_deref(), Some("alfa-bravo"));
            }
            _ => panic!("expected create-slot"),
        }
    }

    #[test]
    fn parse_update_force() {
        let cli = Cli::parse_from(["handoff", "update", "demo/ab", "--force"]);
        assert!(matches!(
            cli.command,
            Command::Update { force: true, .. }
        ));
    }

    #[test]
    fn parse_start_multi() {
        let cli = Cli::parse_from(["handoff", "start", "ab", "--multi"]);
        match cli.command {
            Command::Start { alias, multi } => {
                assert_eq!(alias, "ab");
                assert!(multi);
            }
            _ => panic!("expected start"),
        }
    }

    #[test]
    fn parse_global_config_flag() {
        let cli = Cli::parse_from(["handoff", "status", "--config", "/etc/handoff.toml"]);
        assert_eq!(cli.config, PathBuf::from("/etc/handoff.toml"));
    }
}
