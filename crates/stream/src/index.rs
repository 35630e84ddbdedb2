//! Cell index: grids of runtime cells bucketed per level by XZ coordinate.
//!
//! The index is built once by [`CellIndexBuilder`] and is structurally
//! immutable afterwards. Queries hash the coordinate range covered by a
//! shape's bounding box instead of scanning every cell, then run the exact
//! shape test on the candidates.

use std::collections::{BTreeSet, HashMap, HashSet};

use glam::{I64Vec2, IVec2, Vec2, Vec3};
use partition_common::{ActorId, Arena, StreamingShape};
use serde::{Deserialize, Serialize};

use crate::cell::{CellHandle, RuntimeCell};
use crate::config::StreamConfig;
use crate::context::WorldContext;
use crate::data_layer::{DataLayerRuntimeState, DataLayerSubsystem};
use crate::error::StreamError;
use crate::performance::{self, StreamingPerformance};
use crate::source::{StreamingQuerySource, StreamingSource, TargetState};

/// Settings of one streaming grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSettings {
    pub name: String,
    /// XZ origin of cell `(0, 0)`.
    pub origin: Vec2,
    /// Cell size at level 0; level `L` cells are `cell_size << L`.
    pub cell_size: f32,
    pub loading_range: f32,
    pub block_on_slow_streaming: bool,
    /// Grid content only matters to clients; servers skip it.
    pub client_only_visible: bool,
}

impl GridSettings {
    pub fn new(name: impl Into<String>, cell_size: f32, loading_range: f32) -> Self {
        Self {
            name: name.into(),
            origin: Vec2::ZERO,
            cell_size,
            loading_range,
            block_on_slow_streaming: true,
            client_only_visible: false,
        }
    }
}

#[derive(Debug)]
pub struct StreamingGrid {
    pub settings: GridSettings,
    /// Console override of `settings.loading_range`.
    pub override_loading_range: Option<f32>,
    levels: Vec<GridLevel>,
    always_loaded: Vec<CellHandle>,
}

#[derive(Debug, Default)]
struct GridLevel {
    buckets: HashMap<IVec2, Vec<CellHandle>>,
    /// How far cell bounds reach past their own grid square.
    overhang: f32,
}

impl StreamingGrid {
    fn new(settings: GridSettings) -> Self {
        Self {
            settings,
            override_loading_range: None,
            levels: Vec::new(),
            always_loaded: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn loading_range(&self) -> f32 {
        self.override_loading_range
            .unwrap_or(self.settings.loading_range)
    }

    pub fn level_cell_size(&self, level: u32) -> f32 {
        self.settings.cell_size * (1u64 << level.min(31)) as f32
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    pub fn always_loaded_cells(&self) -> &[CellHandle] {
        &self.always_loaded
    }

    pub fn coord_at(&self, level: u32, position: Vec3) -> IVec2 {
        let size = self.level_cell_size(level);
        let local = Vec2::new(position.x, position.z) - self.settings.origin;
        (local / size).floor().as_ivec2()
    }

    fn level_mut(&mut self, level: u32) -> &mut GridLevel {
        let level = level as usize;
        if self.levels.len() <= level {
            self.levels.resize_with(level + 1, GridLevel::default);
        }
        &mut self.levels[level]
    }

    /// Candidate cells whose grid square lies under the shape's bounding box.
    fn for_each_candidate(&self, shape: &StreamingShape, mut f: impl FnMut(CellHandle)) {
        let bounds = shape.bounding_box();
        for (level, grid_level) in self.levels.iter().enumerate() {
            let level = level as u32;
            let pad = Vec3::new(grid_level.overhang, 0.0, grid_level.overhang);
            let lo = self.coord_at(level, bounds.min - pad);
            let hi = self.coord_at(level, bounds.max + pad);
            let span = hi.as_i64vec2() - lo.as_i64vec2() + I64Vec2::ONE;
            if span.x.saturating_mul(span.y) > grid_level.buckets.len() as i64 {
                for handles in grid_level.buckets.values() {
                    handles.iter().copied().for_each(&mut f);
                }
                continue;
            }
            for z in lo.y..=hi.y {
                for x in lo.x..=hi.x {
                    if let Some(handles) = grid_level.buckets.get(&IVec2::new(x, z)) {
                        handles.iter().copied().for_each(&mut f);
                    }
                }
            }
        }
    }
}

/// Cells bucketed by the state streaming sources want them in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamingCells {
    pub activate: HashSet<CellHandle>,
    pub load: HashSet<CellHandle>,
}

impl StreamingCells {
    fn insert(&mut self, handle: CellHandle, target: TargetState) {
        match target {
            TargetState::Activated => self.activate.insert(handle),
            TargetState::Loaded => self.load.insert(handle),
        };
    }

    /// Activation wins: drop anything also wanted activated from the load set.
    fn resolve(&mut self) {
        let activate = &self.activate;
        self.load.retain(|h| !activate.contains(h));
    }
}

#[derive(Debug, Default)]
pub struct CellIndex {
    cells: Arena<RuntimeCell>,
    grids: Vec<StreamingGrid>,
    by_name: HashMap<String, CellHandle>,
    by_actor: HashMap<ActorId, Vec<CellHandle>>,
}

impl CellIndex {
    pub fn builder() -> CellIndexBuilder {
        CellIndexBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn cell(&self, handle: CellHandle) -> Option<&RuntimeCell> {
        self.cells.get(handle)
    }

    pub fn cell_mut(&mut self, handle: CellHandle) -> Option<&mut RuntimeCell> {
        self.cells.get_mut(handle)
    }

    pub fn try_cell(&self, handle: CellHandle) -> Result<&RuntimeCell, StreamError> {
        self.cells.get(handle).ok_or(StreamError::StaleCell)
    }

    pub fn iter(&self) -> impl Iterator<Item = (CellHandle, &RuntimeCell)> {
        self.cells.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (CellHandle, &mut RuntimeCell)> {
        self.cells.iter_mut()
    }

    pub fn find_by_name(&self, name: &str) -> Option<CellHandle> {
        self.by_name.get(name).copied()
    }

    pub fn cells_for_actor(&self, actor: ActorId) -> &[CellHandle] {
        self.by_actor.get(&actor).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn grids(&self) -> &[StreamingGrid] {
        &self.grids
    }

    pub fn grid(&self, name: &str) -> Option<&StreamingGrid> {
        self.grids.iter().find(|g| g.name() == name)
    }

    pub fn grid_mut(&mut self, name: &str) -> Option<&mut StreamingGrid> {
        self.grids.iter_mut().find(|g| g.name() == name)
    }

    pub fn grid_at_mut(&mut self, index: usize) -> Option<&mut StreamingGrid> {
        self.grids.get_mut(index)
    }

    pub fn grid_of(&self, cell: &RuntimeCell) -> Option<&StreamingGrid> {
        self.grid(&cell.grid_name)
    }

    /// Drop every cell; all outstanding handles go stale.
    pub fn clear(&mut self) {
        self.cells.clear();
        self.grids.clear();
        self.by_name.clear();
        self.by_actor.clear();
    }

    /// Every cell, or only those matching the layer filter.
    pub fn get_all_cells(
        &self,
        all_data_layers: bool,
        data_layers_only: bool,
        layers: &BTreeSet<String>,
    ) -> Vec<CellHandle> {
        self.cells
            .iter()
            .filter(|(_, cell)| {
                all_data_layers || layer_filter_accepts(cell, data_layers_only, layers)
            })
            .map(|(h, _)| h)
            .collect()
    }

    pub fn always_loaded_cells(&self) -> impl Iterator<Item = CellHandle> + '_ {
        self.grids.iter().flat_map(|g| g.always_loaded.iter().copied())
    }

    /// Resolve sources to the cells they want loaded or activated, caching
    /// per-cell sort keys for `epoch` along the way.
    pub fn get_streaming_cells(
        &self,
        sources: &[StreamingSource],
        data_layers: &DataLayerSubsystem,
        ctx: &WorldContext,
        epoch: u64,
        config: &StreamConfig,
    ) -> StreamingCells {
        let mut out = StreamingCells::default();

        for grid in &self.grids {
            if grid.settings.client_only_visible && ctx.is_server() {
                continue;
            }
            for &handle in &grid.always_loaded {
                let Some(cell) = self.cells.get(handle) else {
                    continue;
                };
                if let Some(target) = layer_target(cell, TargetState::Activated, data_layers) {
                    cell.cache_always_loaded(epoch);
                    out.insert(handle, target);
                }
            }

            for source in sources {
                source.for_each_shape(grid.loading_range(), grid.name(), |shape| {
                    let z_range = (shape.center().y - shape.radius(), shape.center().y + shape.radius());
                    grid.for_each_candidate(&shape, |handle| {
                        let Some(cell) = self.cells.get(handle) else {
                            return;
                        };
                        if !shape.intersects_box(&cell.bounds) {
                            return;
                        }
                        if config.enable_z_culling && !cell.bounds.overlaps_y(z_range.0, z_range.1) {
                            return;
                        }
                        let Some(target) = layer_target(cell, source.target_state, data_layers) else {
                            return;
                        };
                        cell.cache_streaming_source_info(
                            epoch,
                            source,
                            &shape,
                            config.angle_contribution,
                        );
                        out.insert(handle, target);
                    });
                });
            }
        }

        for (handle, cell) in self.cells.iter() {
            if cell.is_pinned() {
                cell.cache_always_loaded(epoch);
                out.activate.insert(handle);
            }
        }

        out.resolve();
        out
    }

    /// Cells wanted by a server: decided by data-layer state alone.
    pub fn get_data_layer_cells(
        &self,
        data_layers: &DataLayerSubsystem,
        ctx: &WorldContext,
        epoch: u64,
    ) -> StreamingCells {
        let mut out = StreamingCells::default();
        for grid in &self.grids {
            if grid.settings.client_only_visible && ctx.is_server() {
                continue;
            }
            for level in &grid.levels {
                for handles in level.buckets.values() {
                    for &handle in handles {
                        self.insert_by_layer_state(handle, data_layers, epoch, &mut out);
                    }
                }
            }
            for &handle in &grid.always_loaded {
                self.insert_by_layer_state(handle, data_layers, epoch, &mut out);
            }
        }
        out.resolve();
        out
    }

    fn insert_by_layer_state(
        &self,
        handle: CellHandle,
        data_layers: &DataLayerSubsystem,
        epoch: u64,
        out: &mut StreamingCells,
    ) {
        let Some(cell) = self.cells.get(handle) else {
            return;
        };
        if let Some(target) = layer_target(cell, TargetState::Activated, data_layers) {
            cell.cache_always_loaded(epoch);
            out.insert(handle, target);
        }
    }

    /// Cells matched by a query source. Non-spatial queries only return
    /// always-loaded cells.
    pub fn query(
        &self,
        query: &StreamingQuerySource,
        ctx: &WorldContext,
        config: &StreamConfig,
    ) -> HashSet<CellHandle> {
        let mut out = HashSet::new();
        for grid in &self.grids {
            if grid.settings.client_only_visible && ctx.is_server() {
                continue;
            }
            for &handle in &grid.always_loaded {
                let accepted = self.cells.get(handle).is_some_and(|cell| {
                    layer_filter_accepts(cell, query.data_layers_only, &query.data_layers)
                });
                if accepted {
                    out.insert(handle);
                }
            }
            if !query.spatial_query {
                continue;
            }
            let shape = query.shape(grid.loading_range());
            let (z_min, z_max) = (shape.center().y - shape.radius(), shape.center().y + shape.radius());
            grid.for_each_candidate(&shape, |handle| {
                let accepted = self.cells.get(handle).is_some_and(|cell| {
                    shape.intersects_box(&cell.bounds)
                        && (!config.enable_z_culling || cell.bounds.overlaps_y(z_min, z_max))
                        && layer_filter_accepts(cell, query.data_layers_only, &query.data_layers)
                });
                if accepted {
                    out.insert(handle);
                }
            });
        }
        out
    }

    /// Health of a pending cell from its cached blocking-source distance.
    pub fn performance_for_cell(&self, handle: CellHandle, config: &StreamConfig) -> StreamingPerformance {
        let Some(cell) = self.cells.get(handle) else {
            return StreamingPerformance::Good;
        };
        let Some(grid) = self.grid_of(cell) else {
            return StreamingPerformance::Good;
        };
        if !grid.settings.block_on_slow_streaming || cell.always_loaded {
            return StreamingPerformance::Good;
        }
        performance::classify(
            &cell.cache(),
            grid.level_cell_size(cell.level),
            grid.loading_range(),
            config,
        )
    }
}

/// Bucket a cell by data-layer state: untagged cells follow the source,
/// cells with an activated layer follow the source, cells with only loaded
/// layers are capped at loaded, anything else is not wanted.
fn layer_target(
    cell: &RuntimeCell,
    wanted: TargetState,
    data_layers: &DataLayerSubsystem,
) -> Option<TargetState> {
    if cell.data_layers.is_empty()
        || data_layers.is_any_in_effective_state(&cell.data_layers, DataLayerRuntimeState::Activated)
    {
        Some(wanted)
    } else if data_layers.is_any_in_effective_state(&cell.data_layers, DataLayerRuntimeState::Loaded) {
        Some(TargetState::Loaded)
    } else {
        None
    }
}

fn layer_filter_accepts(cell: &RuntimeCell, data_layers_only: bool, layers: &BTreeSet<String>) -> bool {
    if cell.data_layers.is_empty() {
        !data_layers_only
    } else {
        cell.data_layers.iter().any(|l| layers.contains(l))
    }
}

/// Assembles grids and cells at streaming-generation time.
#[derive(Debug, Default)]
pub struct CellIndexBuilder {
    index: CellIndex,
}

impl CellIndexBuilder {
    pub fn add_grid(&mut self, settings: GridSettings) -> Result<&mut Self, StreamError> {
        if !(settings.cell_size.is_finite() && settings.cell_size > 0.0) {
            return Err(StreamError::InvalidCellSize {
                grid: settings.name,
                cell_size: settings.cell_size,
            });
        }
        if self.index.grid(&settings.name).is_some() {
            return Err(StreamError::DuplicateGrid(settings.name));
        }
        self.index.grids.push(StreamingGrid::new(settings));
        Ok(self)
    }

    pub fn add_cell(&mut self, mut cell: RuntimeCell) -> Result<CellHandle, StreamError> {
        if self.index.by_name.contains_key(&cell.name) {
            return Err(StreamError::DuplicateCell(cell.name));
        }
        let grid_pos = self
            .index
            .grids
            .iter()
            .position(|g| g.name() == cell.grid_name)
            .ok_or_else(|| StreamError::UnknownGrid(cell.grid_name.clone()))?;

        let grid = &self.index.grids[grid_pos];
        let level = cell.level;
        let half_size = grid.level_cell_size(level) * 0.5;
        cell.coord = grid.coord_at(level, cell.bounds.center());
        let extent = cell.bounds.extent();
        let overhang = (extent.x.max(extent.z) - half_size).max(0.0);

        let name = cell.name.clone();
        let actors = cell.actors.clone();
        let always_loaded = cell.always_loaded;
        let coord = cell.coord;
        let handle = self.index.cells.insert(cell);

        let grid = &mut self.index.grids[grid_pos];
        if always_loaded {
            grid.always_loaded.push(handle);
        } else {
            let grid_level = grid.level_mut(level);
            grid_level.overhang = grid_level.overhang.max(overhang);
            grid_level.buckets.entry(coord).or_default().push(handle);
        }
        self.index.by_name.insert(name, handle);
        for actor in actors {
            self.index.by_actor.entry(actor).or_default().push(handle);
        }
        Ok(handle)
    }

    pub fn build(self) -> CellIndex {
        tracing::debug!(
            grids = self.index.grids.len(),
            cells = self.index.cells.len(),
            "cell index built"
        );
        self.index
    }
}
