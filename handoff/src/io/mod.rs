//! Side-effecting facades: configuration, subprocesses, version control,
//! environment building, and the process supervisor.

pub mod config;
pub mod env;
pub mod process;
pub mod supervisor;
pub mod vcs;
