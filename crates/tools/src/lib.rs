//! Developer tooling: streaming inspector, debug filters, console commands.
//!
//! # Invariants
//! - Tools only read the subsystem, except console variables, which write
//!   the live streaming config.

mod console;
mod inspector;

pub use console::{Console, ConsoleError};
pub use inspector::{CellInfo, DebugFilter, StreamingInspector, StreamingSummary, dump_streaming_sources};

pub fn crate_info() -> &'static str {
    "partition-tools v0.1.0"
}
