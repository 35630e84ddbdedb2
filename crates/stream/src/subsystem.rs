//! The world partition subsystem: owns everything streaming needs for one
//! world and runs it once per tick.

use partition_common::{ActorId, ProviderId};

use crate::cell::{CellHandle, CellState, RuntimeCellState};
use crate::config::StreamConfig;
use crate::context::WorldContext;
use crate::data_layer::DataLayerSubsystem;
use crate::error::StreamError;
use crate::index::CellIndex;
use crate::loader::{CellEvent, CellLoader, LevelStreamer};
use crate::performance::StreamingPerformance;
use crate::policy::{StreamingPolicy, StreamingUpdate, UpdateInputs};
use crate::query;
use crate::source::{StreamingQuerySource, StreamingSource, StreamingSourceProvider};
use crate::velocity::VelocityTrackers;

pub struct WorldPartitionSubsystem {
    config: StreamConfig,
    ctx: WorldContext,
    index: CellIndex,
    data_layers: DataLayerSubsystem,
    policy: StreamingPolicy,
    streamer: LevelStreamer,
    providers: Vec<(ProviderId, Box<dyn StreamingSourceProvider>)>,
    velocities: VelocityTrackers,
    sources: Vec<StreamingSource>,
    source_epoch: u64,
    tick: u64,
}

impl WorldPartitionSubsystem {
    pub fn new(index: CellIndex, loader: Box<dyn CellLoader>, config: StreamConfig) -> Self {
        tracing::info!(cells = index.len(), grids = index.grids().len(), "world partition initialized");
        Self {
            config: config.sanitized(),
            ctx: WorldContext::standalone(),
            index,
            data_layers: DataLayerSubsystem::new(),
            policy: StreamingPolicy::new(),
            streamer: LevelStreamer::new(loader),
            providers: Vec::new(),
            velocities: VelocityTrackers::new(),
            sources: Vec::new(),
            source_epoch: 0,
            tick: 0,
        }
    }

    pub fn register_provider(&mut self, provider: Box<dyn StreamingSourceProvider>) -> ProviderId {
        let id = ProviderId::new();
        self.providers.push((id, provider));
        tracing::debug!(?id, "streaming source provider registered");
        id
    }

    pub fn unregister_provider(&mut self, id: ProviderId) -> Result<(), StreamError> {
        let pos = self
            .providers
            .iter()
            .position(|(pid, _)| *pid == id)
            .ok_or(StreamError::UnknownProvider(id))?;
        self.providers.remove(pos);
        tracing::debug!(?id, "streaming source provider unregistered");
        Ok(())
    }

    /// Rebuild this tick's sources from the registered providers and
    /// smooth their velocities.
    pub fn update_streaming_sources(&mut self, dt: f32) {
        self.source_epoch += 1;
        let epoch = self.source_epoch;
        let mut sources: Vec<StreamingSource> = self
            .providers
            .iter()
            .filter_map(|(_, provider)| provider.streaming_source())
            .collect();
        for source in &mut sources {
            source.velocity =
                self.velocities
                    .update(&source.name, source.location(), dt, epoch, &self.config);
        }
        self.velocities.retain_epoch(epoch);
        self.sources = sources;
    }

    /// Run one policy decision step against the current sources.
    pub fn update_streaming_state(&mut self) -> StreamingUpdate {
        self.streamer
            .drain_completions(&mut self.index, self.tick, &self.config);
        let inputs = UpdateInputs {
            sources: &self.sources,
            data_layers: &self.data_layers,
            ctx: &self.ctx,
            config: &self.config,
            tick: self.tick,
        };
        self.policy
            .update_streaming_state(&mut self.index, &mut self.streamer, &inputs)
    }

    /// Sources, then the policy, then host visibility work, then a blocking
    /// flush if streaming turned critical.
    pub fn tick(&mut self, dt: f32) -> StreamingUpdate {
        self.tick += 1;
        self.update_streaming_sources(dt);
        let report = self.update_streaming_state();
        self.streamer.process(&mut self.index, self.tick, &self.config);
        if self.policy.should_block_on_slow_streaming() {
            tracing::info!(tick = self.tick, "executing blocking streaming flush");
            self.flush_streaming();
            self.policy.on_blocking_flush_executed();
        }
        report
    }

    /// Synchronously drain in-flight loads and visibility work.
    pub fn flush_streaming(&mut self) {
        self.streamer.flush(&mut self.index, self.tick, &self.config);
    }

    pub fn is_streaming_completed(
        &self,
        target: RuntimeCellState,
        query_sources: &[StreamingQuerySource],
        exact: bool,
    ) -> bool {
        query::is_streaming_completed(
            &self.index,
            &self.data_layers,
            &self.ctx,
            &self.config,
            target,
            query_sources,
            exact,
        )
    }

    pub fn streaming_sources(&self) -> &[StreamingSource] {
        &self.sources
    }

    /// Keep the cells owning `actors` activated regardless of sources.
    /// Returns the number of cells pinned.
    pub fn pin_actors(&mut self, actors: &[ActorId]) -> usize {
        self.for_actor_cells(actors, |cell| cell.pin())
    }

    pub fn unpin_actors(&mut self, actors: &[ActorId]) -> usize {
        self.for_actor_cells(actors, |cell| cell.unpin())
    }

    fn for_actor_cells(
        &mut self,
        actors: &[ActorId],
        mut f: impl FnMut(&mut crate::cell::RuntimeCell),
    ) -> usize {
        let handles: Vec<CellHandle> = actors
            .iter()
            .flat_map(|a| self.index.cells_for_actor(*a).iter().copied())
            .collect();
        let mut count = 0;
        for handle in handles {
            if let Some(cell) = self.index.cell_mut(handle) {
                f(cell);
                count += 1;
            }
        }
        count
    }

    /// Veto unloading of a cell until [`Self::release_cell`].
    pub fn hold_cell(&mut self, handle: CellHandle) -> Result<(), StreamError> {
        self.index
            .cell_mut(handle)
            .ok_or(StreamError::StaleCell)?
            .hold();
        Ok(())
    }

    pub fn release_cell(&mut self, handle: CellHandle) -> Result<(), StreamError> {
        self.index
            .cell_mut(handle)
            .ok_or(StreamError::StaleCell)?
            .release_hold();
        Ok(())
    }

    /// Let permanently failed cells be requested again.
    pub fn retry_failed_cells(&mut self) -> usize {
        self.index
            .iter_mut()
            .filter(|(_, cell)| cell.state() == CellState::Failed)
            .map(|(_, cell)| cell.reset_failure())
            .filter(|reset| *reset)
            .count()
    }

    /// Release all content and drop every cell and provider.
    pub fn teardown(&mut self) {
        tracing::info!(cells = self.index.len(), "world partition teardown");
        self.streamer.teardown(&mut self.index);
        self.policy.reset();
        self.index.clear();
        self.providers.clear();
        self.velocities.clear();
        self.sources.clear();
    }

    pub fn drain_events(&mut self) -> Vec<CellEvent> {
        self.streamer.drain_events()
    }

    pub fn streaming_performance(&self) -> StreamingPerformance {
        self.policy.performance()
    }

    pub fn cell_state(&self, name: &str) -> Option<CellState> {
        let handle = self.index.find_by_name(name)?;
        self.index.cell(handle).map(|c| c.state())
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut StreamConfig {
        &mut self.config
    }

    pub fn data_layers(&self) -> &DataLayerSubsystem {
        &self.data_layers
    }

    pub fn data_layers_mut(&mut self) -> &mut DataLayerSubsystem {
        &mut self.data_layers
    }

    pub fn index(&self) -> &CellIndex {
        &self.index
    }

    pub fn index_mut(&mut self) -> &mut CellIndex {
        &mut self.index
    }

    pub fn policy(&self) -> &StreamingPolicy {
        &self.policy
    }

    pub fn streamer(&self) -> &LevelStreamer {
        &self.streamer
    }

    pub fn world_context(&self) -> WorldContext {
        self.ctx
    }

    pub fn set_world_context(&mut self, ctx: WorldContext) {
        self.ctx = ctx;
    }

    pub fn tick_count(&self) -> u64 {
        self.tick
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::RuntimeCell;
    use crate::index::GridSettings;
    use crate::loader::{CellEventKind, DeferredLoader, ImmediateLoader};
    use crate::source::{ControlledSource, SourcePriority, TargetState};
    use glam::Vec3;
    use partition_common::Aabb;

    const CELL: f32 = 100.0;

    fn cell_at(name: &str, x: f32, z: f32) -> RuntimeCell {
        RuntimeCell::new(
            name,
            "main",
            Aabb::new(Vec3::new(x, 0.0, z), Vec3::new(x + CELL, 50.0, z + CELL)),
        )
    }

    /// Ten cells at grid coordinates (2k, 0).
    fn ten_cells(loading_range: f32) -> CellIndex {
        let mut builder = CellIndex::builder();
        builder
            .add_grid(GridSettings::new("main", CELL, loading_range))
            .unwrap();
        for k in 0..10 {
            builder
                .add_cell(cell_at(&format!("c{k}"), (2 * k) as f32 * CELL, 0.0))
                .unwrap();
        }
        builder.build()
    }

    fn subsystem(index: CellIndex, loader: Box<dyn CellLoader>) -> WorldPartitionSubsystem {
        let config = StreamConfig {
            block_on_slow_streaming: false,
            ..StreamConfig::default()
        };
        WorldPartitionSubsystem::new(index, loader, config)
    }

    fn add_source(wp: &mut WorldPartitionSubsystem, source: StreamingSource) -> ControlledSource {
        let handle = ControlledSource::new(source);
        wp.register_provider(Box::new(handle.clone()));
        handle
    }

    fn assert_sets_disjoint(wp: &WorldPartitionSubsystem) {
        assert!(wp
            .policy()
            .loaded_cells()
            .is_disjoint(wp.policy().activated_cells()));
    }

    #[test]
    fn origin_source_streams_exactly_the_cells_in_range() {
        let mut wp = subsystem(ten_cells(450.0), Box::new(ImmediateLoader::new()));
        add_source(&mut wp, StreamingSource::new("player", Vec3::ZERO));
        wp.tick(0.016);

        for k in 0..10 {
            let expected = if k < 3 { CellState::Activated } else { CellState::Unloaded };
            assert_eq!(wp.cell_state(&format!("c{k}")), Some(expected), "c{k}");
        }
    }

    #[test]
    fn loaded_target_stops_at_loaded() {
        let mut wp = subsystem(ten_cells(450.0), Box::new(ImmediateLoader::new()));
        add_source(
            &mut wp,
            StreamingSource::new("probe", Vec3::ZERO).with_target_state(TargetState::Loaded),
        );
        wp.tick(0.016);
        let loaded = (0..10)
            .filter(|k| wp.cell_state(&format!("c{k}")) == Some(CellState::Loaded))
            .count();
        assert_eq!(loaded, 3);
        assert_eq!(wp.policy().loaded_cells().len(), 3);
        assert!(wp.policy().activated_cells().is_empty());
    }

    #[test]
    fn budget_promotes_cells_in_priority_order() {
        let mut builder = CellIndex::builder();
        builder.add_grid(GridSettings::new("main", CELL, 500.0)).unwrap();
        for k in 0..5 {
            builder.add_cell(cell_at(&format!("c{k}"), k as f32 * 1000.0, 0.0)).unwrap();
        }
        let mut wp = subsystem(builder.build(), Box::new(ImmediateLoader::new()));
        wp.config_mut().max_loading_cells = 2;

        let priorities = [
            SourcePriority::Lowest,
            SourcePriority::Low,
            SourcePriority::Normal,
            SourcePriority::High,
            SourcePriority::Highest,
        ];
        for (k, priority) in priorities.into_iter().enumerate() {
            add_source(
                &mut wp,
                StreamingSource::new(format!("s{k}"), Vec3::new(k as f32 * 1000.0 + 50.0, 0.0, 50.0))
                    .with_target_state(TargetState::Loaded)
                    .with_priority(priority)
                    .with_radius(10.0),
            );
        }

        let loaded = |wp: &WorldPartitionSubsystem| -> Vec<String> {
            let mut names: Vec<String> = (0..5)
                .map(|k| format!("c{k}"))
                .filter(|n| wp.cell_state(n) == Some(CellState::Loaded))
                .collect();
            names.sort();
            names
        };

        let report = wp.tick(0.016);
        assert_eq!(report.load_requests, 2);
        assert_eq!(loaded(&wp), vec!["c3", "c4"]);

        wp.tick(0.016);
        assert_eq!(loaded(&wp), vec!["c1", "c2", "c3", "c4"]);

        wp.tick(0.016);
        assert_eq!(loaded(&wp).len(), 5);
    }

    #[test]
    fn source_round_trip_through_the_lifecycle() {
        let mut builder = CellIndex::builder();
        builder.add_grid(GridSettings::new("main", CELL, 500.0)).unwrap();
        let c = builder.add_cell(cell_at("c", 1000.0, 0.0)).unwrap();
        let mut wp = subsystem(builder.build(), Box::new(ImmediateLoader::new()));

        let start = Vec3::new(-2000.0, 0.0, 50.0);
        let outer = add_source(
            &mut wp,
            StreamingSource::new("outer", start)
                .with_target_state(TargetState::Loaded)
                .with_radius(500.0),
        );
        let inner = add_source(&mut wp, StreamingSource::new("inner", start).with_radius(200.0));
        let move_to = |x: f32| {
            outer.set_position(Vec3::new(x, 0.0, 50.0));
            inner.set_position(Vec3::new(x, 0.0, 50.0));
        };

        wp.tick(0.1);
        assert_eq!(wp.cell_state("c"), Some(CellState::Unloaded));
        assert!(wp.policy().loaded_cells().is_empty());

        move_to(550.0);
        wp.tick(0.1);
        assert_eq!(wp.cell_state("c"), Some(CellState::Loaded));
        assert!(wp.policy().loaded_cells().contains(&c));

        move_to(850.0);
        wp.tick(0.1);
        assert_eq!(wp.cell_state("c"), Some(CellState::Activated));
        assert!(wp.policy().activated_cells().contains(&c));
        assert!(!wp.policy().loaded_cells().contains(&c));

        move_to(-2000.0);
        let report = wp.tick(0.1);
        assert_eq!(report.unloaded, 1);
        assert_eq!(wp.cell_state("c"), Some(CellState::Unloaded));
        assert_sets_disjoint(&wp);

        let kinds: Vec<CellEventKind> = wp.drain_events().into_iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                CellEventKind::Loaded,
                CellEventKind::Shown,
                CellEventKind::Hidden,
                CellEventKind::Unloaded
            ]
        );
    }

    #[test]
    fn streaming_completes_once_loads_finish() {
        let loader = DeferredLoader::new();
        let mut wp = subsystem(ten_cells(450.0), Box::new(loader.clone()));
        add_source(&mut wp, StreamingSource::new("player", Vec3::ZERO));
        let origin = [StreamingQuerySource::at(Vec3::ZERO)];

        wp.tick(0.016);
        assert_eq!(wp.cell_state("c0"), Some(CellState::Loading));
        assert!(!wp.is_streaming_completed(RuntimeCellState::Activated, &origin, true));

        loader.complete_all();
        wp.tick(0.016);
        assert!(wp.is_streaming_completed(RuntimeCellState::Activated, &origin, true));
    }

    #[test]
    fn always_loaded_cells_activate_on_first_update() {
        let mut builder = CellIndex::builder();
        builder.add_grid(GridSettings::new("main", CELL, 500.0)).unwrap();
        builder
            .add_cell(cell_at("persistent", 50_000.0, 0.0).with_always_loaded(true))
            .unwrap();
        builder.add_cell(cell_at("spatial", 0.0, 0.0)).unwrap();
        let mut wp = subsystem(builder.build(), Box::new(ImmediateLoader::new()));
        wp.config_mut().max_loading_cells = 0;

        let report = wp.tick(0.016);
        assert_eq!(wp.cell_state("persistent"), Some(CellState::Activated));
        assert_eq!(wp.cell_state("spatial"), Some(CellState::Unloaded));
        assert_eq!(report.deferred_by_budget, 0);
    }

    #[test]
    fn velocities_are_smoothed_per_named_source() {
        let mut wp = subsystem(ten_cells(450.0), Box::new(ImmediateLoader::new()));
        let player = add_source(&mut wp, StreamingSource::new("player", Vec3::ZERO));
        add_source(&mut wp, StreamingSource::new("", Vec3::ZERO));

        wp.tick(0.1);
        player.set_position(Vec3::new(10.0, 0.0, 0.0));
        wp.tick(0.1);
        let sources = wp.streaming_sources();
        assert!((sources[0].velocity.x - 100.0).abs() < 1e-2);
        assert_eq!(sources[1].velocity, Vec3::ZERO);
    }

    #[test]
    fn providers_can_be_unregistered() {
        let mut wp = subsystem(ten_cells(450.0), Box::new(ImmediateLoader::new()));
        let id = wp.register_provider(Box::new(ControlledSource::new(StreamingSource::new(
            "player",
            Vec3::ZERO,
        ))));
        wp.tick(0.016);
        assert_eq!(wp.streaming_sources().len(), 1);

        wp.unregister_provider(id).unwrap();
        assert!(matches!(
            wp.unregister_provider(id),
            Err(StreamError::UnknownProvider(_))
        ));
        wp.tick(0.016);
        assert!(wp.streaming_sources().is_empty());
        assert_eq!(wp.cell_state("c0"), Some(CellState::Unloaded));
    }

    #[test]
    fn pinned_actors_keep_their_cells() {
        let actor = ActorId::new();
        let mut builder = CellIndex::builder();
        builder.add_grid(GridSettings::new("main", CELL, 500.0)).unwrap();
        builder.add_cell(cell_at("home", 0.0, 0.0).with_actor(actor)).unwrap();
        let mut wp = subsystem(builder.build(), Box::new(ImmediateLoader::new()));
        let player = add_source(&mut wp, StreamingSource::new("player", Vec3::ZERO));
        wp.tick(0.016);
        assert_eq!(wp.pin_actors(&[actor]), 1);

        player.set_position(Vec3::new(90_000.0, 0.0, 0.0));
        wp.tick(0.016);
        assert_eq!(wp.cell_state("home"), Some(CellState::Activated));

        wp.unpin_actors(&[actor]);
        wp.tick(0.016);
        assert_eq!(wp.cell_state("home"), Some(CellState::Unloaded));
    }

    #[test]
    fn held_cell_survives_until_released() {
        let mut wp = subsystem(ten_cells(450.0), Box::new(ImmediateLoader::new()));
        let player = add_source(&mut wp, StreamingSource::new("player", Vec3::ZERO));
        wp.tick(0.016);
        let c0 = wp.index().find_by_name("c0").unwrap();
        wp.hold_cell(c0).unwrap();

        player.set_enabled(false);
        wp.tick(0.016);
        assert_eq!(wp.cell_state("c0"), Some(CellState::Activated));
        assert_eq!(wp.cell_state("c1"), Some(CellState::Unloaded));

        wp.release_cell(c0).unwrap();
        wp.tick(0.016);
        assert_eq!(wp.cell_state("c0"), Some(CellState::Unloaded));
    }

    #[test]
    fn critical_streaming_flushes_within_the_tick() {
        let loader = DeferredLoader::new();
        let mut wp = subsystem(ten_cells(450.0), Box::new(loader.clone()));
        wp.config_mut().block_on_slow_streaming = true;
        add_source(&mut wp, StreamingSource::new("player", Vec3::new(50.0, 0.0, 50.0)).blocking(true));

        let report = wp.tick(0.016);
        assert_eq!(report.performance, StreamingPerformance::Critical);
        assert!(!wp.policy().should_block_on_slow_streaming());
        assert_eq!(wp.cell_state("c0"), Some(CellState::Activated));
        assert!(loader.queued().is_empty());
    }

    #[test]
    fn permanently_failed_cells_can_be_retried() {
        let loader = DeferredLoader::new();
        loader.fail("c0");
        let mut wp = subsystem(ten_cells(150.0), Box::new(loader.clone()));
        wp.config_mut().max_load_attempts = 1;
        add_source(&mut wp, StreamingSource::new("player", Vec3::new(50.0, 0.0, 50.0)));

        wp.tick(0.016);
        loader.complete_all();
        wp.tick(0.016);
        assert_eq!(wp.cell_state("c0"), Some(CellState::Failed));

        loader.heal("c0");
        assert_eq!(wp.retry_failed_cells(), 1);
        wp.tick(0.016);
        loader.complete_all();
        wp.tick(0.016);
        assert_eq!(wp.cell_state("c0"), Some(CellState::Activated));
    }

    #[test]
    fn sets_stay_disjoint_and_loads_stay_in_budget_while_moving() {
        let loader = DeferredLoader::new();
        let mut wp = subsystem(ten_cells(300.0), Box::new(loader.clone()));
        wp.config_mut().max_loading_cells = 2;
        let player = add_source(&mut wp, StreamingSource::new("player", Vec3::ZERO));
        add_source(
            &mut wp,
            StreamingSource::new("camera", Vec3::new(1000.0, 0.0, 0.0))
                .with_target_state(TargetState::Loaded),
        );

        for step in 0..60 {
            player.set_position(Vec3::new(step as f32 * 40.0, 0.0, 50.0));
            let report = wp.tick(0.05);
            assert!(report.load_requests <= 2);
            assert!(wp.streamer().loading_count() <= 2);
            assert_sets_disjoint(&wp);
            if step % 3 == 0 {
                loader.complete_next(1);
            }
        }
    }

    #[test]
    fn teardown_releases_everything() {
        let loader = DeferredLoader::new();
        let mut wp = subsystem(ten_cells(450.0), Box::new(loader.clone()));
        add_source(&mut wp, StreamingSource::new("player", Vec3::ZERO));
        let c0 = wp.index().find_by_name("c0").unwrap();
        wp.tick(0.016);
        loader.complete_all();
        wp.tick(0.016);

        wp.teardown();
        assert!(wp.index().is_empty());
        assert!(wp.streaming_sources().is_empty());
        assert_eq!(loader.released().len(), 3);
        assert!(matches!(wp.hold_cell(c0), Err(StreamError::StaleCell)));
    }
}
