//! Domain error taxonomy shared across the crate.
//!
//! Orchestration and CLI glue use `anyhow`; the variants here exist so that
//! callers (and tests) can match on the failure kind instead of scraping
//! messages. Supervisor "not applicable in current state" conditions are
//! modelled on [`SupervisorError`](crate::io::supervisor::SupervisorError)
//! and swallowed at the slot layer, so they never surface through this enum
//! unless they were genuinely fatal for the attempted operation.

use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use crate::io::supervisor::SupervisorError;

/// Result alias for deployment operations.
pub type Result<T> = std::result::Result<T, DeployError>;

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    /// Missing or invalid setup, fatal at startup.
    #[error("configuration: {0}")]
    Configuration(String),

    /// Checkout, environment build, or registration failed during slot
    /// creation. The slot is left unusable; the next cleanup pass reclaims
    /// whatever was partially created.
    #[error("provisioning {slot} failed: {reason}")]
    Provision { slot: String, reason: String },

    /// Pull or working-copy reset failed. The slot keeps its old code and a
    /// running process is unaffected.
    #[error("updating {slot} failed during {phase}: {reason}")]
    Update {
        slot: String,
        phase: UpdatePhase,
        reason: String,
    },

    /// The process did not reach `Running` after a start or reload.
    #[error("{slot} did not reach running state")]
    StartFailed { slot: String },

    #[error("no slot matches '{0}'")]
    NotFound(String),

    #[error("alias '{0}' matches slots in more than one application")]
    AmbiguousAlias(String),

    #[error("invalid alias '{alias}': {reason}")]
    InvalidAlias { alias: String, reason: String },

    /// Recycled-folder suffix probing hit its bound without finding a free
    /// name.
    #[error("no unused recycled-folder suffix below {limit} under {}", dir.display())]
    SuffixExhausted { dir: PathBuf, limit: u32 },

    /// Supervisor failure that was not benign for the attempted operation.
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl DeployError {
    /// Attach an I/O error with a human-readable context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Which phase of [`update`](crate::slot::Slot::update) failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePhase {
    Pull,
    Reset,
}

impl Display for UpdatePhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pull => write!(f, "pull"),
            Self::Reset => write!(f, "reset"),
        }
    }
}
