//! Pure, deterministic logic: naming, run-state classification, and sweep
//! planning. No I/O.

pub mod naming;
pub mod state;
pub mod sweep;
