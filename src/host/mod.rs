//! Execution host program.
//!
//! Each request runs in a fresh interpreter process executing a generated
//! script ([`HostScript`]). The script reports back through exactly one JSON
//! document on its stdout ([`HostReport`]); the caller's own prints are
//! captured and travel inside that document.

mod helpers;
pub mod report;
pub mod script;

pub use report::{HostReport, HostStatus};
pub use script::HostScript;
