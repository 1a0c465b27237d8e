//! Zero-downtime slot deployment manager.
//!
//! An application is deployed into named, independently-deployable "slots":
//! each slot couples an isolated working copy of the code, an isolated
//! runtime environment, and one supervised OS process. A new slot can be
//! provisioned and started while an older one keeps serving; once it proves
//! healthy, hand-over pauses the siblings and the new slot becomes the
//! exclusive active instance. Retired slot directories are recycled instead
//! of deleted, so the next slot can skip the checkout.
//!
//! The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (naming, run states, sweep
//!   classification). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting facades (config, subprocesses, version
//!   control, environment building, process supervision). Trait seams
//!   enable scripted doubles in tests.
//!
//! Orchestration modules ([`app`], [`slot`], [`recycle`]) coordinate core
//! logic with I/O to implement the CLI commands.

pub mod app;
pub mod core;
pub mod error;
pub mod io;
pub mod logging;
pub mod recycle;
pub mod slot;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use error::{DeployError, Result};
