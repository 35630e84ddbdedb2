use crate::cell::{RuntimeCell, RuntimeCellState};
use crate::config::StreamConfig;
use crate::context::WorldContext;
use crate::data_layer::{DataLayerRuntimeState, DataLayerSubsystem};
use crate::index::CellIndex;
use crate::source::StreamingQuerySource;

/// Whether every cell matched by `query_sources` has reached `target`
/// (exactly, or at least when `exact` is false).
///
/// A cell already past the requested state is not held against an exact
/// query when one of its data layers outside the query is active on its own.
pub fn is_streaming_completed(
    index: &CellIndex,
    data_layers: &DataLayerSubsystem,
    ctx: &WorldContext,
    config: &StreamConfig,
    target: RuntimeCellState,
    query_sources: &[StreamingQuerySource],
    exact: bool,
) -> bool {
    for query in query_sources {
        for handle in index.query(query, ctx, config) {
            let Some(cell) = index.cell(handle) else {
                continue;
            };
            if cell.is_hlod && !config.hlod_enabled {
                continue;
            }
            let state = cell.runtime_state();
            let satisfied = if exact { state == target } else { state >= target };
            if satisfied || exempt_by_outside_layer(cell, state, target, query, data_layers) {
                continue;
            }
            tracing::trace!(cell = %cell.name, ?state, ?target, "streaming not completed");
            return false;
        }
    }
    true
}

fn exempt_by_outside_layer(
    cell: &RuntimeCell,
    state: RuntimeCellState,
    target: RuntimeCellState,
    query: &StreamingQuerySource,
    data_layers: &DataLayerSubsystem,
) -> bool {
    if state <= target || query.data_layers.is_empty() {
        return false;
    }
    let requested = match target {
        RuntimeCellState::Unloaded => DataLayerRuntimeState::Unloaded,
        RuntimeCellState::Loaded => DataLayerRuntimeState::Loaded,
        RuntimeCellState::Activated => DataLayerRuntimeState::Activated,
    };
    cell.data_layers
        .iter()
        .filter(|layer| !query.data_layers.contains(*layer))
        .any(|layer| data_layers.effective_state(layer) > requested)
}
