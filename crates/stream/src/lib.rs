//! World partition runtime streaming.
//!
//! Streaming sources (players, cameras, scripted probes) describe shapes in
//! the world. Each tick the policy intersects those shapes with the cell
//! index, diffs the result against what is already resident and drives the
//! level streamer: loads under a concurrency budget, activations in
//! importance order, unloads as soon as nothing wants a cell.
//!
//! # Invariants
//! - A cell is never both in the loaded set and the activated set.
//! - Every load request resolves exactly once, success or failure.
//! - Loads started in one update never exceed the loading budget.

mod cell;
mod config;
mod context;
mod data_layer;
mod error;
mod index;
mod loader;
mod performance;
mod policy;
mod query;
mod source;
mod subsystem;
mod velocity;

pub use cell::{
    CellHandle, CellState, LoadResolution, RuntimeCell, RuntimeCellState, SourceInfoCache,
};
pub use config::StreamConfig;
pub use context::{NetMode, WorldContext};
pub use data_layer::{DataLayerRuntimeState, DataLayerSubsystem};
pub use error::StreamError;
pub use index::{CellIndex, CellIndexBuilder, GridSettings, StreamingCells, StreamingGrid};
pub use loader::{
    CellEvent, CellEventKind, CellLoader, DeferredLoader, ImmediateLoader, LevelStreamer,
    LoadCompletion, LoadOutcome,
};
pub use performance::{StreamingPerformance, classify as classify_performance};
pub use policy::{StreamingPolicy, StreamingUpdate, UpdateInputs};
pub use query::is_streaming_completed;
pub use source::{
    ControlledSource, ReplaySourceProvider, SourcePriority, SourceShape, StreamingQuerySource,
    StreamingSource, StreamingSourceProvider, TargetState,
};
pub use subsystem::WorldPartitionSubsystem;
pub use velocity::{VelocityTracker, VelocityTrackers};

pub fn crate_info() -> &'static str {
    "partition-stream v0.1.0"
}
