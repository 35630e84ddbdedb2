//! The streaming policy: once per tick, turn the current sources into cell
//! transitions under the load budget.

use std::cmp::Ordering;
use std::collections::HashSet;

use serde::Serialize;

use crate::cell::{CellHandle, CellState, RuntimeCellState};
use crate::config::StreamConfig;
use crate::context::WorldContext;
use crate::data_layer::DataLayerSubsystem;
use crate::index::{CellIndex, StreamingCells};
use crate::loader::LevelStreamer;
use crate::performance::StreamingPerformance;
use crate::source::{StreamingSource, TargetState};

/// What one policy update did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamingUpdate {
    pub epoch: u64,
    /// Server update skipped because data-layer state did not change.
    pub skipped: bool,
    pub unloaded: usize,
    pub deactivated: usize,
    pub activated: usize,
    pub loaded: usize,
    /// Loads started this update (`Unloaded -> Loading`).
    pub load_requests: usize,
    pub deferred_by_budget: usize,
    pub deferred_by_blocking: usize,
    pub deferred_by_retry: usize,
    pub refused_unloads: usize,
    pub healed: usize,
    pub performance: StreamingPerformance,
}

impl StreamingUpdate {
    pub fn deferred(&self) -> usize {
        self.deferred_by_budget + self.deferred_by_blocking + self.deferred_by_retry
    }
}

/// Everything an update reads besides the policy's own state.
pub struct UpdateInputs<'a> {
    pub sources: &'a [StreamingSource],
    pub data_layers: &'a DataLayerSubsystem,
    pub ctx: &'a WorldContext,
    pub config: &'a StreamConfig,
    pub tick: u64,
}

#[derive(Debug, Default)]
pub struct StreamingPolicy {
    loaded_cells: HashSet<CellHandle>,
    activated_cells: HashSet<CellHandle>,
    epoch: u64,
    server_epoch: Option<u64>,
    performance: StreamingPerformance,
    blocking_request_epoch: u64,
    blocking_consumed_epoch: u64,
    blocking_episode: bool,
    activation_priorities: Vec<CellHandle>,
    last_update: StreamingUpdate,
}

impl StreamingPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn loaded_cells(&self) -> &HashSet<CellHandle> {
        &self.loaded_cells
    }

    pub fn activated_cells(&self) -> &HashSet<CellHandle> {
        &self.activated_cells
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn performance(&self) -> StreamingPerformance {
        self.performance
    }

    pub fn last_update(&self) -> &StreamingUpdate {
        &self.last_update
    }

    /// Cells waiting to join the live world, most important first.
    pub fn activation_priorities(&self) -> &[CellHandle] {
        &self.activation_priorities
    }

    /// A blocking flush was requested and has not run yet.
    pub fn should_block_on_slow_streaming(&self) -> bool {
        self.blocking_request_epoch > self.blocking_consumed_epoch
    }

    pub fn on_blocking_flush_executed(&mut self) {
        self.blocking_consumed_epoch = self.blocking_request_epoch;
    }

    /// Non-blocking cells are held back while this is set.
    pub fn is_blocking_episode(&self) -> bool {
        self.blocking_episode
    }

    /// Loads that may start now; `None` means unbounded.
    pub fn max_cells_to_load(
        &self,
        streamer: &LevelStreamer,
        ctx: &WorldContext,
        config: &StreamConfig,
    ) -> Option<usize> {
        if !ctx.match_started || ctx.is_server() {
            return None;
        }
        Some(config.max_loading_cells.saturating_sub(streamer.loading_count()))
    }

    /// Forget all cells, e.g. on world teardown.
    pub fn reset(&mut self) {
        *self = Self {
            epoch: self.epoch,
            ..Self::default()
        };
    }

    pub fn update_streaming_state(
        &mut self,
        index: &mut CellIndex,
        streamer: &mut LevelStreamer,
        inputs: &UpdateInputs<'_>,
    ) -> StreamingUpdate {
        let _span = tracing::info_span!("stream_update", epoch = self.epoch + 1).entered();
        let mut report = StreamingUpdate::default();

        report.healed = self.heal_sets(index);

        let ctx = inputs.ctx;
        let layers_epoch = inputs.data_layers.epoch();
        if ctx.is_server() && report.healed == 0 && self.server_epoch == Some(layers_epoch) {
            tracing::trace!("data layers unchanged, skipping server streaming update");
            report.epoch = self.epoch;
            report.skipped = true;
            report.performance = self.performance;
            self.last_update = report.clone();
            return report;
        }

        self.epoch += 1;
        report.epoch = self.epoch;

        let wanted = if ctx.is_server() {
            index.get_data_layer_cells(inputs.data_layers, ctx, self.epoch)
        } else {
            index.get_streaming_cells(
                inputs.sources,
                inputs.data_layers,
                ctx,
                self.epoch,
                inputs.config,
            )
        };

        let to_unload: Vec<CellHandle> = self
            .activated_cells
            .iter()
            .chain(self.loaded_cells.iter())
            .filter(|h| !wanted.activate.contains(h) && !wanted.load.contains(h))
            .copied()
            .collect();
        let to_activate: Vec<CellHandle> = wanted
            .activate
            .iter()
            .filter(|h| !self.activated_cells.contains(h))
            .copied()
            .collect();
        let to_load: Vec<CellHandle> = wanted
            .load
            .iter()
            .filter(|h| !self.loaded_cells.contains(h))
            .copied()
            .collect();

        self.apply_unloads(index, streamer, to_unload, &mut report);

        let mut budget = self.max_cells_to_load(streamer, ctx, inputs.config);
        self.apply_wanted(
            index,
            streamer,
            to_activate,
            TargetState::Activated,
            &mut budget,
            inputs.tick,
            &mut report,
        );
        self.apply_wanted(
            index,
            streamer,
            to_load,
            TargetState::Loaded,
            &mut budget,
            inputs.tick,
            &mut report,
        );

        self.update_activation_priorities(index, streamer);
        self.update_performance(index, &wanted, inputs, &mut report);

        if ctx.is_server() {
            let settled = report.deferred() == 0 && report.refused_unloads == 0;
            self.server_epoch = settled.then_some(layers_epoch);
        }

        debug_assert!(self.loaded_cells.is_disjoint(&self.activated_cells));
        tracing::debug!(
            unloaded = report.unloaded,
            deactivated = report.deactivated,
            activated = report.activated,
            loaded = report.loaded,
            deferred = report.deferred(),
            refused = report.refused_unloads,
            loaded_total = self.loaded_cells.len(),
            activated_total = self.activated_cells.len(),
            "stream update complete"
        );
        self.last_update = report.clone();
        report
    }

    /// Restore `LoadedCells ∩ ActivatedCells = ∅` (activated wins) and
    /// forget cells whose load failed so they are requested again.
    fn heal_sets(&mut self, index: &CellIndex) -> usize {
        let overlap: Vec<CellHandle> = self
            .loaded_cells
            .intersection(&self.activated_cells)
            .copied()
            .collect();
        for handle in &overlap {
            tracing::error!(?handle, "cell in both loaded and activated sets, keeping it activated");
            self.loaded_cells.remove(handle);
        }

        let dropped = |handle: &CellHandle| {
            index
                .cell(*handle)
                .is_none_or(|cell| matches!(cell.state(), CellState::Unloaded | CellState::Failed))
        };
        let before = self.loaded_cells.len() + self.activated_cells.len();
        self.loaded_cells.retain(|h| !dropped(h));
        self.activated_cells.retain(|h| !dropped(h));
        let after = self.loaded_cells.len() + self.activated_cells.len();
        overlap.len() + (before - after)
    }

    fn apply_unloads(
        &mut self,
        index: &mut CellIndex,
        streamer: &mut LevelStreamer,
        mut to_unload: Vec<CellHandle>,
        report: &mut StreamingUpdate,
    ) {
        to_unload.sort();
        for handle in to_unload {
            let Some(cell) = index.cell_mut(handle) else {
                self.loaded_cells.remove(&handle);
                self.activated_cells.remove(&handle);
                continue;
            };
            if !cell.can_unload() {
                report.refused_unloads += 1;
                continue;
            }
            tracing::trace!(cell = %cell.name, "unloading cell");
            streamer.unload(handle, cell);
            self.loaded_cells.remove(&handle);
            self.activated_cells.remove(&handle);
            report.unloaded += 1;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_wanted(
        &mut self,
        index: &mut CellIndex,
        streamer: &mut LevelStreamer,
        mut handles: Vec<CellHandle>,
        target: TargetState,
        budget: &mut Option<usize>,
        tick: u64,
        report: &mut StreamingUpdate,
    ) {
        sort_by_importance(index, &mut handles);
        for handle in handles {
            let Some(cell) = index.cell_mut(handle) else {
                continue;
            };

            if target == TargetState::Loaded && self.activated_cells.contains(&handle) {
                tracing::trace!(cell = %cell.name, "deactivating cell");
                streamer.deactivate(handle, cell);
                self.activated_cells.remove(&handle);
                self.loaded_cells.insert(handle);
                report.deactivated += 1;
                continue;
            }

            if cell.state() == CellState::Failed {
                continue;
            }
            let exempt = cell.always_loaded || cell.is_pinned();
            if !exempt && self.blocking_episode && !cell.cache().is_blocking_source {
                report.deferred_by_blocking += 1;
                continue;
            }
            let needs_load = cell.state() == CellState::Unloaded;
            if needs_load && !cell.can_retry(tick) {
                report.deferred_by_retry += 1;
                continue;
            }
            if needs_load && !exempt && *budget == Some(0) {
                report.deferred_by_budget += 1;
                continue;
            }

            cell.cancel_pending_unload();
            match target {
                TargetState::Activated => {
                    streamer.activate(handle, cell);
                    self.loaded_cells.remove(&handle);
                    self.activated_cells.insert(handle);
                    report.activated += 1;
                }
                TargetState::Loaded => {
                    streamer.load(handle, cell);
                    self.loaded_cells.insert(handle);
                    report.loaded += 1;
                }
            }
            if needs_load && cell.state() == CellState::Loading {
                report.load_requests += 1;
                if let (false, Some(remaining)) = (exempt, budget.as_mut()) {
                    *remaining -= 1;
                }
            }
        }
    }

    fn update_activation_priorities(&mut self, index: &mut CellIndex, streamer: &mut LevelStreamer) {
        let mut pending: Vec<CellHandle> = self
            .activated_cells
            .iter()
            .copied()
            .filter(|h| {
                index.cell(*h).is_some_and(|cell| {
                    cell.state() == CellState::Activating
                        || (cell.state() == CellState::Loading && cell.has_pending_activate())
                })
            })
            .collect();
        sort_by_importance(index, &mut pending);

        let current = streamer.current_activation();
        if let Some(pos) = pending.iter().position(|h| Some(*h) == current) {
            let current = pending.remove(pos);
            pending.insert(0, current);
        }

        for (_, cell) in index.iter_mut() {
            cell.streaming_priority = None;
        }
        for (rank, handle) in pending.iter().enumerate() {
            if let Some(cell) = index.cell_mut(*handle) {
                cell.streaming_priority = Some(rank);
            }
        }
        streamer.set_activation_order(pending.clone());
        self.activation_priorities = pending;
    }

    fn update_performance(
        &mut self,
        index: &CellIndex,
        wanted: &StreamingCells,
        inputs: &UpdateInputs<'_>,
        report: &mut StreamingUpdate,
    ) {
        let worst = wanted
            .activate
            .iter()
            .chain(wanted.load.iter())
            .filter(|h| {
                index.cell(**h).is_some_and(|cell| match cell.state() {
                    // Failed and backing-off cells are not expected to arrive soon.
                    CellState::Failed => false,
                    CellState::Unloaded => cell.can_retry(inputs.tick),
                    _ => cell.runtime_state() == RuntimeCellState::Unloaded,
                })
            })
            .map(|h| index.performance_for_cell(*h, inputs.config))
            .max()
            .unwrap_or_default();

        let previous = self.performance;
        self.performance = worst;
        report.performance = worst;

        let can_block = inputs.ctx.is_standalone() && inputs.config.block_on_slow_streaming;
        self.blocking_episode = can_block && worst == StreamingPerformance::Critical;
        if self.blocking_episode && previous != StreamingPerformance::Critical {
            self.blocking_request_epoch += 1;
            tracing::warn!(
                epoch = self.blocking_request_epoch,
                "streaming performance critical, requesting blocking flush"
            );
        } else if worst != previous {
            tracing::debug!(?previous, current = ?worst, "streaming performance changed");
        }
    }
}

fn sort_by_importance(index: &CellIndex, handles: &mut [CellHandle]) {
    handles.sort_by(|a, b| match (index.cell(*a), index.cell(*b)) {
        (Some(ca), Some(cb)) => ca.sort_compare(cb).then_with(|| a.cmp(b)),
        _ => Ordering::Equal,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::RuntimeCell;
    use crate::context::NetMode;
    use crate::data_layer::DataLayerRuntimeState;
    use crate::index::GridSettings;
    use crate::loader::{DeferredLoader, ImmediateLoader};
    use glam::Vec3;
    use partition_common::Aabb;

    fn square(x: f32, z: f32) -> Aabb {
        Aabb::new(Vec3::new(x, 0.0, z), Vec3::new(x + 100.0, 100.0, z + 100.0))
    }

    fn row(count: usize) -> CellIndex {
        let mut builder = CellIndex::builder();
        builder.add_grid(GridSettings::new("main", 100.0, 450.0)).unwrap();
        for k in 0..count {
            builder
                .add_cell(RuntimeCell::new(format!("c{k}"), "main", square(k as f32 * 100.0, 0.0)))
                .unwrap();
        }
        builder.build()
    }

    struct Harness {
        index: CellIndex,
        streamer: LevelStreamer,
        policy: StreamingPolicy,
        layers: DataLayerSubsystem,
        ctx: WorldContext,
        config: StreamConfig,
        tick: u64,
    }

    impl Harness {
        fn new(index: CellIndex, streamer: LevelStreamer) -> Self {
            Self {
                index,
                streamer,
                policy: StreamingPolicy::new(),
                layers: DataLayerSubsystem::new(),
                ctx: WorldContext::standalone(),
                config: StreamConfig {
                    block_on_slow_streaming: false,
                    ..StreamConfig::default()
                },
                tick: 0,
            }
        }

        fn update(&mut self, sources: &[StreamingSource]) -> StreamingUpdate {
            self.tick += 1;
            let inputs = UpdateInputs {
                sources,
                data_layers: &self.layers,
                ctx: &self.ctx,
                config: &self.config,
                tick: self.tick,
            };
            let report =
                self.policy
                    .update_streaming_state(&mut self.index, &mut self.streamer, &inputs);
            self.streamer.process(&mut self.index, self.tick, &self.config);
            report
        }

        fn state(&self, name: &str) -> CellState {
            let handle = self.index.find_by_name(name).unwrap();
            self.index.cell(handle).unwrap().state()
        }
    }

    fn immediate(index: CellIndex) -> Harness {
        Harness::new(index, LevelStreamer::new(Box::new(ImmediateLoader::new())))
    }

    #[test]
    fn activated_cell_wanted_loaded_is_deactivated_not_unloaded() {
        let mut h = immediate(row(3));
        let active = vec![StreamingSource::new("p", Vec3::new(50.0, 0.0, 50.0)).with_radius(10.0)];
        h.update(&active);
        assert_eq!(h.state("c0"), CellState::Activated);

        let passive = vec![
            StreamingSource::new("p", Vec3::new(50.0, 0.0, 50.0))
                .with_target_state(TargetState::Loaded)
                .with_radius(10.0),
        ];
        let report = h.update(&passive);
        assert_eq!(report.deactivated, 1);
        assert_eq!(report.unloaded, 0);
        assert_eq!(h.state("c0"), CellState::Loaded);
        let c0 = h.index.find_by_name("c0").unwrap();
        assert!(h.policy.loaded_cells().contains(&c0));
        assert!(!h.policy.activated_cells().contains(&c0));
    }

    #[test]
    fn held_cells_refuse_unload_and_retry_later() {
        let mut h = immediate(row(1));
        let source = vec![StreamingSource::new("p", Vec3::new(50.0, 0.0, 50.0))];
        h.update(&source);
        let c0 = h.index.find_by_name("c0").unwrap();
        h.index.cell_mut(c0).unwrap().hold();

        let report = h.update(&[]);
        assert_eq!(report.refused_unloads, 1);
        assert_eq!(h.state("c0"), CellState::Activated);
        assert!(h.policy.activated_cells().contains(&c0));

        h.index.cell_mut(c0).unwrap().release_hold();
        let report = h.update(&[]);
        assert_eq!(report.unloaded, 1);
        assert_eq!(h.state("c0"), CellState::Unloaded);
    }

    #[test]
    fn overlapping_sets_heal_toward_activated() {
        let mut h = immediate(row(1));
        h.update(&[StreamingSource::new("p", Vec3::new(50.0, 0.0, 50.0))]);
        let c0 = h.index.find_by_name("c0").unwrap();
        h.policy.loaded_cells.insert(c0);

        let report = h.update(&[StreamingSource::new("p", Vec3::new(50.0, 0.0, 50.0))]);
        assert_eq!(report.healed, 1);
        assert!(h.policy.activated_cells().contains(&c0));
        assert!(!h.policy.loaded_cells().contains(&c0));
    }

    #[test]
    fn budget_caps_new_loads_per_update() {
        let mut h = Harness::new(row(8), LevelStreamer::new(Box::new(DeferredLoader::new())));
        h.config.max_loading_cells = 3;
        let sources = vec![StreamingSource::new("p", Vec3::ZERO).with_radius(10_000.0)];

        let report = h.update(&sources);
        assert_eq!(report.load_requests, 3);
        assert_eq!(report.deferred_by_budget, 5);
        assert_eq!(h.streamer.loading_count(), 3);

        // Nothing completed, so nothing new may start.
        let report = h.update(&sources);
        assert_eq!(report.load_requests, 0);
        assert_eq!(h.policy.max_cells_to_load(&h.streamer, &h.ctx, &h.config), Some(0));
    }

    #[test]
    fn budget_is_unbounded_before_match_start_and_on_servers() {
        let mut h = Harness::new(row(8), LevelStreamer::new(Box::new(DeferredLoader::new())));
        h.config.max_loading_cells = 1;
        h.ctx.match_started = false;
        assert_eq!(h.policy.max_cells_to_load(&h.streamer, &h.ctx, &h.config), None);
        let report = h.update(&[StreamingSource::new("p", Vec3::ZERO).with_radius(10_000.0)]);
        assert_eq!(report.load_requests, 8);

        h.ctx = WorldContext {
            net_mode: NetMode::ListenServer,
            match_started: true,
        };
        assert_eq!(h.policy.max_cells_to_load(&h.streamer, &h.ctx, &h.config), None);
    }

    #[test]
    fn unwanted_loading_cell_unloads_after_completion() {
        let loader = DeferredLoader::new();
        let mut h = Harness::new(row(1), LevelStreamer::new(Box::new(loader.clone())));
        h.update(&[StreamingSource::new("p", Vec3::new(50.0, 0.0, 50.0))]);
        assert_eq!(h.state("c0"), CellState::Loading);

        h.update(&[]);
        assert_eq!(h.state("c0"), CellState::Loading);

        loader.complete_all();
        h.update(&[]);
        assert_eq!(h.state("c0"), CellState::Unloaded);
        assert_eq!(loader.released(), vec!["c0".to_string()]);
    }

    #[test]
    fn failed_loads_wait_for_backoff() {
        let mut h = Harness::new(
            row(1),
            LevelStreamer::new(Box::new(ImmediateLoader::failing(["c0"]))),
        );
        h.config.retry_backoff_ticks = 3;
        h.config.max_load_attempts = 2;
        let sources = vec![StreamingSource::new("p", Vec3::new(50.0, 0.0, 50.0))];

        h.update(&sources);
        assert_eq!(h.state("c0"), CellState::Unloaded);
        let report = h.update(&sources);
        assert_eq!(report.deferred_by_retry, 1);
        h.update(&sources);
        let report = h.update(&sources);
        assert_eq!(report.load_requests, 1);
        assert_eq!(h.state("c0"), CellState::Failed);

        let report = h.update(&sources);
        assert_eq!(report.load_requests, 0);
        assert!(h.policy.activated_cells().is_empty());
    }

    #[test]
    fn server_follows_data_layers_and_skips_unchanged_epochs() {
        let mut builder = CellIndex::builder();
        builder.add_grid(GridSettings::new("main", 100.0, 100.0)).unwrap();
        builder.add_cell(RuntimeCell::new("plain", "main", square(5000.0, 0.0))).unwrap();
        builder
            .add_cell(RuntimeCell::new("night", "main", square(9000.0, 0.0)).with_data_layer("night"))
            .unwrap();
        let mut h = immediate(builder.build());
        h.ctx = WorldContext {
            net_mode: NetMode::DedicatedServer,
            match_started: true,
        };

        let report = h.update(&[]);
        assert!(!report.skipped);
        assert_eq!(h.state("plain"), CellState::Activated);
        assert_eq!(h.state("night"), CellState::Unloaded);

        assert!(h.update(&[]).skipped);

        h.layers.set_runtime_state("night", DataLayerRuntimeState::Loaded);
        let report = h.update(&[]);
        assert!(!report.skipped);
        assert_eq!(h.state("night"), CellState::Loaded);
    }

    #[test]
    fn critical_streaming_requests_one_flush_per_episode() {
        let loader = DeferredLoader::new();
        let mut h = Harness::new(row(2), LevelStreamer::new(Box::new(loader.clone())));
        h.config.block_on_slow_streaming = true;
        let sources = vec![StreamingSource::new("p", Vec3::new(50.0, 0.0, 50.0)).blocking(true)];

        let report = h.update(&sources);
        assert_eq!(report.performance, StreamingPerformance::Critical);
        assert!(h.policy.should_block_on_slow_streaming());
        h.policy.on_blocking_flush_executed();
        assert!(!h.policy.should_block_on_slow_streaming());

        h.update(&sources);
        assert!(!h.policy.should_block_on_slow_streaming());

        loader.complete_all();
        h.streamer.process(&mut h.index, h.tick, &h.config);
        let report = h.update(&sources);
        assert_eq!(report.performance, StreamingPerformance::Good);
        assert!(!h.policy.is_blocking_episode());
    }

    #[test]
    fn blocking_episode_defers_non_blocking_cells() {
        let loader = DeferredLoader::new();
        let mut h = Harness::new(row(6), LevelStreamer::new(Box::new(loader.clone())));
        h.config.block_on_slow_streaming = true;
        let blocking = StreamingSource::new("p", Vec3::new(50.0, 0.0, 50.0))
            .blocking(true)
            .with_radius(10.0);
        h.update(std::slice::from_ref(&blocking));
        assert!(h.policy.is_blocking_episode());

        let passive = StreamingSource::new("cam", Vec3::new(450.0, 0.0, 50.0)).with_radius(10.0);
        let report = h.update(&[blocking, passive]);
        assert_eq!(report.deferred_by_blocking, 1);
        assert_eq!(h.state("c4"), CellState::Unloaded);
    }

    #[test]
    fn failed_cell_does_not_hold_blocking_episode() {
        let mut h = Harness::new(
            row(6),
            LevelStreamer::new(Box::new(ImmediateLoader::failing(["c0"]))),
        );
        h.config.block_on_slow_streaming = true;
        h.config.max_load_attempts = 1;
        let blocking = StreamingSource::new("p", Vec3::new(50.0, 0.0, 50.0))
            .blocking(true)
            .with_radius(10.0);
        h.update(std::slice::from_ref(&blocking));
        assert!(h.policy.is_blocking_episode());
        assert_eq!(h.state("c0"), CellState::Failed);

        let passive = StreamingSource::new("cam", Vec3::new(450.0, 0.0, 50.0)).with_radius(10.0);
        let sources = [blocking, passive];
        for _ in 0..3 {
            h.update(&sources);
        }
        assert_eq!(h.state("c0"), CellState::Failed);
        assert_eq!(h.state("c4"), CellState::Activated);
        assert_eq!(h.policy.performance(), StreamingPerformance::Good);
        assert!(!h.policy.is_blocking_episode());
        assert_eq!(h.policy.last_update().deferred_by_blocking, 0);
    }

    #[test]
    fn cells_backing_off_do_not_count_as_slow() {
        let mut h = Harness::new(
            row(1),
            LevelStreamer::new(Box::new(ImmediateLoader::failing(["c0"]))),
        );
        h.config.block_on_slow_streaming = true;
        h.config.max_load_attempts = 5;
        h.config.retry_backoff_ticks = 10;
        let blocking = [StreamingSource::new("p", Vec3::new(50.0, 0.0, 50.0)).blocking(true)];

        assert_eq!(h.update(&blocking).performance, StreamingPerformance::Critical);
        let report = h.update(&blocking);
        assert_eq!(report.deferred_by_retry, 1);
        assert_eq!(report.performance, StreamingPerformance::Good);
        assert!(!h.policy.is_blocking_episode());
    }

    #[test]
    fn activation_priorities_follow_importance() {
        let loader = DeferredLoader::new();
        let mut h = Harness::new(row(3), LevelStreamer::new(Box::new(loader.clone())));
        h.config.activation_work_per_tick = Some(0);
        h.update(&[StreamingSource::new("p", Vec3::new(50.0, 0.0, 50.0))]);
        let order: Vec<&str> = h
            .policy
            .activation_priorities()
            .iter()
            .map(|x| h.index.cell(*x).unwrap().name.as_str())
            .collect();
        assert_eq!(order, vec!["c0", "c1", "c2"]);
        let c0 = h.index.find_by_name("c0").unwrap();
        assert_eq!(h.index.cell(c0).unwrap().streaming_priority(), Some(0));
    }
}
