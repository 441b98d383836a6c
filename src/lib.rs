//! Purpose: Shared core library crate used by the `threadctl` CLI and tests.
//! Exports: `core` (dynamic library scanning, controller registry, thread
//! limiting, errors) plus crate-level shorthands `info`, `limit`, `register`.
//! Role: Internal library backing the binary; not yet a stable public SDK.
//! Invariants: Treat the crate API as internal until a dedicated library release.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod core;

pub use crate::core::aggregate::{ControllerSet, Selector};
pub use crate::core::controller::{Controller, LibController, LibraryInfo, ThreadingLayer};
pub use crate::core::error::{Error, ErrorKind, to_exit_code};
pub use crate::core::limits::{LimitGuard, LimitSpec};
pub use crate::core::registry::{Registry, Signature};

/// Scans the process and reports the state of every recognized library.
pub fn info() -> Vec<LibraryInfo> {
    ControllerSet::new().info()
}

/// Opens a limiting scope over a fresh scan of the process.
pub fn limit(limits: Option<&LimitSpec>, user_api: Option<&str>) -> Result<LimitGuard, Error> {
    ControllerSet::new().limit(limits, user_api)
}

/// Appends a signature to the process-global registry. Sets built after the
/// call classify against it; existing sets are unaffected.
pub fn register(signature: Signature) {
    crate::core::registry::register(signature);
}
