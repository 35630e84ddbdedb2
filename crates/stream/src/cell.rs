//! Runtime cells and their lifecycle state machine.
//!
//! A cell is created once when the index is built and cycles through
//! `Unloaded -> Loading -> Loaded <-> Activating -> Activated` and back via
//! `Deactivating` and `Unloading`. Only the policy and the level streamer
//! drive these transitions.

use std::cell::Cell;
use std::cmp::Ordering;
use std::collections::BTreeSet;

use glam::{IVec2, Vec2};
use partition_common::{ActorId, Aabb, Handle, StreamingShape};
use serde::{Deserialize, Serialize};

use crate::config::StreamConfig;
use crate::source::{SourcePriority, StreamingSource, TargetState};

pub type CellHandle = Handle<RuntimeCell>;

/// Full lifecycle state of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CellState {
    Unloaded,
    Loading,
    Loaded,
    Activating,
    Activated,
    Deactivating,
    Unloading,
    /// Gave up after repeated load failures.
    Failed,
}

impl CellState {
    pub fn runtime_state(self) -> RuntimeCellState {
        match self {
            Self::Unloaded | Self::Loading | Self::Failed => RuntimeCellState::Unloaded,
            Self::Loaded | Self::Activating | Self::Unloading => RuntimeCellState::Loaded,
            Self::Activated | Self::Deactivating => RuntimeCellState::Activated,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Unloaded => "unloaded",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Activating => "activating",
            Self::Activated => "activated",
            Self::Deactivating => "deactivating",
            Self::Unloading => "unloading",
            Self::Failed => "failed",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        [
            Self::Unloaded,
            Self::Loading,
            Self::Loaded,
            Self::Activating,
            Self::Activated,
            Self::Deactivating,
            Self::Unloading,
            Self::Failed,
        ]
        .into_iter()
        .find(|s| s.label().eq_ignore_ascii_case(label))
    }
}

/// Coarse state used by completion queries, ordered
/// `Unloaded < Loaded < Activated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RuntimeCellState {
    Unloaded,
    Loaded,
    Activated,
}

impl From<TargetState> for RuntimeCellState {
    fn from(state: TargetState) -> Self {
        match state {
            TargetState::Loaded => Self::Loaded,
            TargetState::Activated => Self::Activated,
        }
    }
}

/// Per-update sort keys, valid only while `epoch` matches the policy epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceInfoCache {
    pub epoch: u64,
    pub priority: SourcePriority,
    pub min_sq_distance: f32,
    pub sorting_distance: f32,
    pub is_blocking_source: bool,
    pub min_sq_distance_to_blocking_source: f32,
    pub blocking_source_speed: f32,
}

impl Default for SourceInfoCache {
    fn default() -> Self {
        Self {
            epoch: 0,
            priority: SourcePriority::Lowest,
            min_sq_distance: f32::MAX,
            sorting_distance: f32::MAX,
            is_blocking_source: false,
            min_sq_distance_to_blocking_source: f32::MAX,
            blocking_source_speed: 0.0,
        }
    }
}

/// Result of a completed load, as seen by the streamer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadResolution {
    Loaded,
    Retrying { attempt: u32, retry_at_tick: u64 },
    PermanentlyFailed { attempts: u32 },
    /// The cell was not loading; the completion is ignored.
    Stale,
}

#[derive(Debug)]
pub struct RuntimeCell {
    pub name: String,
    pub grid_name: String,
    pub level: u32,
    pub coord: IVec2,
    pub bounds: Aabb,
    pub always_loaded: bool,
    pub data_layers: BTreeSet<String>,
    pub actors: Vec<ActorId>,
    pub is_hlod: bool,
    state: CellState,
    pending_activate: bool,
    pending_unload: bool,
    failures: u32,
    retry_at_tick: u64,
    holds: u32,
    pin_count: u32,
    pub(crate) activation_work_done: u32,
    pub(crate) streaming_priority: Option<usize>,
    cache: Cell<SourceInfoCache>,
}

impl RuntimeCell {
    pub fn new(name: impl Into<String>, grid_name: impl Into<String>, bounds: Aabb) -> Self {
        Self {
            name: name.into(),
            grid_name: grid_name.into(),
            level: 0,
            coord: IVec2::ZERO,
            bounds,
            always_loaded: false,
            data_layers: BTreeSet::new(),
            actors: Vec::new(),
            is_hlod: false,
            state: CellState::Unloaded,
            pending_activate: false,
            pending_unload: false,
            failures: 0,
            retry_at_tick: 0,
            holds: 0,
            pin_count: 0,
            activation_work_done: 0,
            streaming_priority: None,
            cache: Cell::new(SourceInfoCache::default()),
        }
    }

    pub fn with_level(mut self, level: u32) -> Self {
        self.level = level;
        self
    }

    pub fn with_always_loaded(mut self, always_loaded: bool) -> Self {
        self.always_loaded = always_loaded;
        self
    }

    pub fn with_data_layer(mut self, layer: impl Into<String>) -> Self {
        self.data_layers.insert(layer.into());
        self
    }

    pub fn with_actor(mut self, actor: ActorId) -> Self {
        self.actors.push(actor);
        self
    }

    pub fn with_hlod(mut self, is_hlod: bool) -> Self {
        self.is_hlod = is_hlod;
        self
    }

    pub fn state(&self) -> CellState {
        self.state
    }

    pub fn runtime_state(&self) -> RuntimeCellState {
        self.state.runtime_state()
    }

    pub fn is_loading(&self) -> bool {
        self.state == CellState::Loading
    }

    pub fn has_pending_activate(&self) -> bool {
        self.pending_activate
    }

    pub fn has_pending_unload(&self) -> bool {
        self.pending_unload
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn is_pinned(&self) -> bool {
        self.pin_count > 0
    }

    /// Position in the host activation order, if waiting to become visible.
    pub fn streaming_priority(&self) -> Option<usize> {
        self.streaming_priority
    }

    pub fn cache(&self) -> SourceInfoCache {
        self.cache.get()
    }

    /// Whether a load may be requested at `tick`.
    pub fn can_retry(&self, tick: u64) -> bool {
        self.state == CellState::Unloaded && tick >= self.retry_at_tick
    }

    /// Start loading. No-op unless `Unloaded`; an `Unloading` cell is kept.
    pub fn load(&mut self) -> bool {
        match self.state {
            CellState::Unloaded => {
                self.state = CellState::Loading;
                true
            }
            CellState::Unloading => {
                self.state = CellState::Loaded;
                true
            }
            _ => false,
        }
    }

    /// Move toward `Activated`, loading first if needed.
    pub fn activate(&mut self) -> bool {
        match self.state {
            CellState::Unloaded => {
                self.state = CellState::Loading;
                self.pending_activate = true;
                true
            }
            CellState::Loading => {
                self.pending_activate = true;
                self.pending_unload = false;
                false
            }
            CellState::Loaded | CellState::Unloading => {
                self.state = CellState::Activating;
                self.pending_unload = false;
                true
            }
            // Still part of the live world: cancel the deactivation.
            CellState::Deactivating => {
                self.state = CellState::Activated;
                self.pending_unload = false;
                true
            }
            CellState::Activating | CellState::Activated | CellState::Failed => false,
        }
    }

    /// Move down to `Loaded`.
    pub fn deactivate(&mut self) -> bool {
        match self.state {
            CellState::Activated => {
                self.state = CellState::Deactivating;
                true
            }
            CellState::Activating => {
                self.state = CellState::Loaded;
                self.activation_work_done = 0;
                true
            }
            CellState::Loading => {
                self.pending_activate = false;
                false
            }
            _ => false,
        }
    }

    /// Move toward `Unloaded`, deactivating first if needed. An in-flight
    /// load is not cancelled; the cell unloads once it completes.
    pub fn unload(&mut self) -> bool {
        match self.state {
            CellState::Loaded | CellState::Activating => {
                self.state = CellState::Unloading;
                self.activation_work_done = 0;
                true
            }
            CellState::Activated => {
                self.state = CellState::Deactivating;
                self.pending_unload = true;
                true
            }
            CellState::Deactivating | CellState::Loading => {
                self.pending_activate = false;
                self.pending_unload = true;
                false
            }
            CellState::Unloaded | CellState::Unloading | CellState::Failed => false,
        }
    }

    pub fn cancel_pending_unload(&mut self) {
        self.pending_unload = false;
    }

    /// Unload veto: false while an external dependent holds the cell.
    pub fn can_unload(&self) -> bool {
        self.holds == 0
    }

    pub fn hold(&mut self) {
        self.holds += 1;
    }

    pub fn release_hold(&mut self) {
        self.holds = self.holds.saturating_sub(1);
    }

    pub fn pin(&mut self) {
        self.pin_count += 1;
    }

    pub fn unpin(&mut self) {
        self.pin_count = self.pin_count.saturating_sub(1);
    }

    /// Apply the outcome of this cell's load request.
    pub fn on_load_completed(
        &mut self,
        result: Result<(), String>,
        tick: u64,
        config: &StreamConfig,
    ) -> LoadResolution {
        if self.state != CellState::Loading {
            return LoadResolution::Stale;
        }
        match result {
            Ok(()) => {
                self.failures = 0;
                self.retry_at_tick = 0;
                self.state = CellState::Loaded;
                if self.pending_unload && self.can_unload() {
                    self.pending_unload = false;
                    self.pending_activate = false;
                    self.state = CellState::Unloading;
                } else if self.pending_activate {
                    self.pending_activate = false;
                    self.state = CellState::Activating;
                }
                LoadResolution::Loaded
            }
            Err(_) => {
                self.failures += 1;
                self.pending_activate = false;
                self.pending_unload = false;
                if self.failures >= config.max_load_attempts {
                    self.state = CellState::Failed;
                    return LoadResolution::PermanentlyFailed {
                        attempts: self.failures,
                    };
                }
                let shift = (self.failures - 1).min(16);
                self.retry_at_tick = tick + config.retry_backoff_ticks.saturating_mul(1 << shift);
                self.state = CellState::Unloaded;
                LoadResolution::Retrying {
                    attempt: self.failures,
                    retry_at_tick: self.retry_at_tick,
                }
            }
        }
    }

    /// Give a permanently failed cell another chance.
    pub fn reset_failure(&mut self) -> bool {
        if self.state != CellState::Failed {
            return false;
        }
        self.state = CellState::Unloaded;
        self.failures = 0;
        self.retry_at_tick = 0;
        true
    }

    pub fn finish_activation(&mut self) -> bool {
        if self.state != CellState::Activating {
            return false;
        }
        self.state = CellState::Activated;
        self.activation_work_done = 0;
        self.streaming_priority = None;
        true
    }

    pub fn finish_deactivation(&mut self) -> bool {
        if self.state != CellState::Deactivating {
            return false;
        }
        self.state = CellState::Loaded;
        self.start_pending_unload();
        true
    }

    /// Start a deferred unload once the veto is lifted.
    pub fn start_pending_unload(&mut self) -> bool {
        if self.state == CellState::Loaded && self.pending_unload && self.can_unload() {
            self.pending_unload = false;
            self.state = CellState::Unloading;
            return true;
        }
        false
    }

    pub fn finish_unload(&mut self) -> bool {
        if self.state != CellState::Unloading {
            return false;
        }
        self.state = CellState::Unloaded;
        true
    }

    /// Fold one source shape into this tick's cached sort keys. The first
    /// call of a new epoch resets the cache and returns true.
    pub fn cache_streaming_source_info(
        &self,
        epoch: u64,
        source: &StreamingSource,
        shape: &StreamingShape,
        angle_contribution: f32,
    ) -> bool {
        let center = self.bounds.center();
        let to_cell = Vec2::new(center.x - shape.center().x, center.z - shape.center().z);
        let sq_distance = to_cell.length_squared();
        let angle_factor = angle_factor(source, to_cell, angle_contribution);
        let sorting_distance = sq_distance * angle_factor;
        let speed = source.velocity.length();

        let mut cache = self.cache.get();
        let dirtied = cache.epoch != epoch;
        if dirtied {
            cache = SourceInfoCache {
                epoch,
                priority: source.priority,
                min_sq_distance: sq_distance,
                sorting_distance,
                is_blocking_source: source.block_on_slow_loading,
                min_sq_distance_to_blocking_source: if source.block_on_slow_loading {
                    sq_distance
                } else {
                    f32::MAX
                },
                blocking_source_speed: if source.block_on_slow_loading { speed } else { 0.0 },
            };
        } else {
            cache.priority = cache.priority.min(source.priority);
            cache.min_sq_distance = cache.min_sq_distance.min(sq_distance);
            cache.sorting_distance = cache.sorting_distance.min(sorting_distance);
            if source.block_on_slow_loading {
                cache.is_blocking_source = true;
                if sq_distance < cache.min_sq_distance_to_blocking_source {
                    cache.min_sq_distance_to_blocking_source = sq_distance;
                    cache.blocking_source_speed = speed;
                }
            }
        }
        self.cache.set(cache);
        dirtied
    }

    /// Always-loaded and pinned cells sort ahead of everything else.
    pub(crate) fn cache_always_loaded(&self, epoch: u64) {
        self.cache.set(SourceInfoCache {
            epoch,
            priority: SourcePriority::Highest,
            min_sq_distance: 0.0,
            sorting_distance: 0.0,
            ..SourceInfoCache::default()
        });
    }

    /// Importance order: source priority, then coarser level first, then
    /// angle-weighted distance.
    pub fn sort_compare(&self, other: &Self) -> Ordering {
        let a = self.cache.get();
        let b = other.cache.get();
        a.priority
            .cmp(&b.priority)
            .then_with(|| other.level.cmp(&self.level))
            .then_with(|| a.sorting_distance.total_cmp(&b.sorting_distance))
    }
}

fn angle_factor(source: &StreamingSource, to_cell: Vec2, angle_contribution: f32) -> f32 {
    if angle_contribution <= 0.0 {
        return 1.0;
    }
    let forward = source.transform.forward();
    let forward = Vec2::new(forward.x, forward.z).normalize_or_zero();
    let to_cell = to_cell.normalize_or_zero();
    if forward == Vec2::ZERO || to_cell == Vec2::ZERO {
        return 1.0;
    }
    let normalized_angle = (forward.dot(to_cell).clamp(-1.0, 1.0).acos() / std::f32::consts::PI)
        .abs()
        .clamp(0.0, 1.0);
    normalized_angle.powf(angle_contribution)
}
