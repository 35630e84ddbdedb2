use std::collections::BTreeMap;
use std::fmt;

use partition_stream::{
    CellHandle, CellState, RuntimeCell, StreamingPerformance, WorldPartitionSubsystem,
};
use serde::Serialize;

/// Streaming inspector for developer tooling.
///
/// Read-only views of the subsystem for debug overlays, console output and
/// the CLI.
pub struct StreamingInspector;

impl StreamingInspector {
    /// Produce a summary of the streaming state.
    pub fn summary(wp: &WorldPartitionSubsystem) -> StreamingSummary {
        let mut states: BTreeMap<String, usize> = BTreeMap::new();
        for (_, cell) in wp.index().iter() {
            *states.entry(cell.state().label().to_owned()).or_default() += 1;
        }
        StreamingSummary {
            tick: wp.tick_count(),
            epoch: wp.policy().epoch(),
            cells: wp.index().len(),
            grids: wp.index().grids().len(),
            states,
            loaded_set: wp.policy().loaded_cells().len(),
            activated_set: wp.policy().activated_cells().len(),
            loading: wp.streamer().loading_count(),
            performance: wp.streaming_performance(),
            sources: wp.streaming_sources().len(),
        }
    }

    /// Cells accepted by `filter`, sorted by name.
    pub fn cells(wp: &WorldPartitionSubsystem, filter: &DebugFilter) -> Vec<CellInfo> {
        let mut cells: Vec<CellInfo> = wp
            .index()
            .iter()
            .filter(|(_, cell)| filter.accepts(cell))
            .map(|(handle, cell)| CellInfo::new(handle, cell))
            .collect();
        cells.sort_by(|a, b| a.name.cmp(&b.name));
        cells
    }
}

/// Summary of streaming state for the inspector.
#[derive(Debug, Clone, Serialize)]
pub struct StreamingSummary {
    pub tick: u64,
    pub epoch: u64,
    pub cells: usize,
    pub grids: usize,
    /// Cell count per lifecycle state label.
    pub states: BTreeMap<String, usize>,
    pub loaded_set: usize,
    pub activated_set: usize,
    pub loading: usize,
    pub performance: StreamingPerformance,
    pub sources: usize,
}

impl StreamingSummary {
    pub fn count(&self, state: CellState) -> usize {
        self.states.get(state.label()).copied().unwrap_or(0)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for StreamingSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Streaming: tick={} epoch={} cells={} loaded={} activated={} loading={} performance={:?} sources={}",
            self.tick,
            self.epoch,
            self.cells,
            self.loaded_set,
            self.activated_set,
            self.loading,
            self.performance,
            self.sources
        )
    }
}

/// Detailed info about a single cell.
#[derive(Debug, Clone, Serialize)]
pub struct CellInfo {
    #[serde(skip)]
    pub handle: CellHandle,
    pub name: String,
    pub grid: String,
    pub level: u32,
    pub coord: [i32; 2],
    pub state: CellState,
    pub always_loaded: bool,
    pub data_layers: Vec<String>,
    pub streaming_priority: Option<usize>,
    pub failures: u32,
}

impl CellInfo {
    fn new(handle: CellHandle, cell: &RuntimeCell) -> Self {
        Self {
            handle,
            name: cell.name.clone(),
            grid: cell.grid_name.clone(),
            level: cell.level,
            coord: [cell.coord.x, cell.coord.y],
            state: cell.state(),
            always_loaded: cell.always_loaded,
            data_layers: cell.data_layers.iter().cloned().collect(),
            streaming_priority: cell.streaming_priority(),
            failures: cell.failures(),
        }
    }
}

impl fmt::Display for CellInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{} L{} ({}, {})] {}",
            self.name,
            self.grid,
            self.level,
            self.coord[0],
            self.coord[1],
            self.state.label()
        )?;
        if let Some(priority) = self.streaming_priority {
            write!(f, " priority={priority}")?;
        }
        if self.always_loaded {
            write!(f, " always_loaded")?;
        }
        if self.failures > 0 {
            write!(f, " failures={}", self.failures)?;
        }
        if !self.data_layers.is_empty() {
            write!(f, " layers={}", self.data_layers.join(","))?;
        }
        Ok(())
    }
}

/// Which cells the debug views display. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugFilter {
    pub grid_name: Option<String>,
    pub data_layer: Option<String>,
    pub status: Option<CellState>,
    pub name_substring: Option<String>,
}

impl DebugFilter {
    pub fn accepts(&self, cell: &RuntimeCell) -> bool {
        if self.grid_name.as_ref().is_some_and(|g| *g != cell.grid_name) {
            return false;
        }
        if self
            .data_layer
            .as_ref()
            .is_some_and(|layer| !cell.data_layers.contains(layer))
        {
            return false;
        }
        if self.status.is_some_and(|s| s != cell.state()) {
            return false;
        }
        let name = cell.name.to_ascii_lowercase();
        !self
            .name_substring
            .as_ref()
            .is_some_and(|needle| !name.contains(&needle.to_ascii_lowercase()))
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// One line per current streaming source, also written to the log.
pub fn dump_streaming_sources(wp: &WorldPartitionSubsystem) -> Vec<String> {
    let lines: Vec<String> = wp
        .streaming_sources()
        .iter()
        .map(|source| source.to_string())
        .collect();
    tracing::info!(count = lines.len(), "streaming sources");
    for line in &lines {
        tracing::info!("  {line}");
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use partition_common::Aabb;
    use partition_stream::{
        CellIndex, ControlledSource, GridSettings, ImmediateLoader, StreamConfig, StreamingSource,
    };

    fn subsystem() -> WorldPartitionSubsystem {
        let mut builder = CellIndex::builder();
        builder
            .add_grid(GridSettings::new("main", 100.0, 150.0))
            .unwrap();
        builder
            .add_grid(GridSettings::new("props", 50.0, 100.0))
            .unwrap();
        for k in 0..4 {
            let min = Vec3::new(k as f32 * 300.0, 0.0, 0.0);
            let bounds = Aabb::new(min, min + Vec3::new(100.0, 10.0, 100.0));
            let mut cell = RuntimeCell::new(format!("Main_{k}"), "main", bounds);
            if k == 3 {
                cell = cell.with_data_layer("night");
            }
            builder.add_cell(cell).unwrap();
        }
        builder
            .add_cell(RuntimeCell::new(
                "Props_0",
                "props",
                Aabb::new(Vec3::ZERO, Vec3::new(50.0, 10.0, 50.0)),
            ))
            .unwrap();
        WorldPartitionSubsystem::new(
            builder.build(),
            Box::new(ImmediateLoader::new()),
            StreamConfig::default(),
        )
    }

    #[test]
    fn summary_empty_world() {
        let wp = subsystem();
        let summary = StreamingInspector::summary(&wp);
        assert_eq!(summary.tick, 0);
        assert_eq!(summary.cells, 5);
        assert_eq!(summary.grids, 2);
        assert_eq!(summary.count(CellState::Unloaded), 5);
        assert_eq!(summary.performance, StreamingPerformance::Good);
    }

    #[test]
    fn summary_after_tick() {
        let mut wp = subsystem();
        wp.register_provider(Box::new(ControlledSource::new(StreamingSource::new(
            "player",
            Vec3::new(50.0, 0.0, 50.0),
        ))));
        wp.tick(0.016);

        let summary = StreamingInspector::summary(&wp);
        assert_eq!(summary.tick, 1);
        assert_eq!(summary.sources, 1);
        assert_eq!(summary.count(CellState::Activated), 2);
        assert_eq!(summary.activated_set, 2);
        assert!(format!("{summary}").contains("activated=2"));

        let json = summary.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["states"]["activated"], 2);
        assert_eq!(value["performance"], "Good");
    }

    #[test]
    fn filters_combine() {
        let wp = subsystem();
        let all = StreamingInspector::cells(&wp, &DebugFilter::default());
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].name, "Main_0");

        let by_grid = DebugFilter {
            grid_name: Some("props".into()),
            ..DebugFilter::default()
        };
        assert_eq!(StreamingInspector::cells(&wp, &by_grid).len(), 1);

        let by_layer = DebugFilter {
            data_layer: Some("night".into()),
            ..DebugFilter::default()
        };
        let night = StreamingInspector::cells(&wp, &by_layer);
        assert_eq!(night.len(), 1);
        assert!(night[0].to_string().contains("layers=night"));

        let by_name_and_status = DebugFilter {
            name_substring: Some("main_".into()),
            status: Some(CellState::Activated),
            ..DebugFilter::default()
        };
        assert!(StreamingInspector::cells(&wp, &by_name_and_status).is_empty());
        assert!(!by_name_and_status.is_empty());
    }

    #[test]
    fn dump_lists_every_source() {
        let mut wp = subsystem();
        wp.register_provider(Box::new(ControlledSource::new(StreamingSource::new(
            "player",
            Vec3::ZERO,
        ))));
        wp.register_provider(Box::new(ControlledSource::new(StreamingSource::new(
            "camera",
            Vec3::new(500.0, 0.0, 0.0),
        ))));
        wp.tick(0.016);

        let lines = dump_streaming_sources(&wp);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("player"));
        assert!(lines[1].starts_with("camera"));
    }
}
