//! Streaming sources: the per-tick viewpoint snapshots that drive streaming,
//! the provider interface that produces them, and query sources used by
//! completion checks.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::fmt;
use std::rc::Rc;

use glam::{Quat, Vec3};
use partition_common::{StreamingShape, Transform};
use serde::{Deserialize, Serialize};

/// State a source wants the cells around it to reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetState {
    Loaded,
    Activated,
}

/// Streaming priority of a source. Lower values are more important.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum SourcePriority {
    Highest = 0,
    High = 64,
    #[default]
    Normal = 128,
    Low = 192,
    Lowest = 255,
}

/// A source-local shape, resolved against each grid's loading range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SourceShape {
    /// Use the grid loading range (scaled) instead of `radius`.
    pub use_grid_loading_range: bool,
    pub radius: f32,
    pub loading_range_scale: f32,
    /// Offset from the source position, in source-local space.
    pub location_offset: Vec3,
    /// Full opening angle in degrees; `None` is a sphere.
    pub sector_angle: Option<f32>,
}

impl Default for SourceShape {
    fn default() -> Self {
        Self {
            use_grid_loading_range: true,
            radius: 0.0,
            loading_range_scale: 1.0,
            location_offset: Vec3::ZERO,
            sector_angle: None,
        }
    }
}

impl SourceShape {
    pub fn with_radius(radius: f32) -> Self {
        Self {
            use_grid_loading_range: false,
            radius,
            ..Self::default()
        }
    }

    pub fn sector(radius: f32, angle: f32) -> Self {
        Self {
            sector_angle: Some(angle),
            ..Self::with_radius(radius)
        }
    }

    fn resolve(&self, transform: &Transform, grid_loading_range: f32) -> StreamingShape {
        let radius = if self.use_grid_loading_range {
            grid_loading_range * self.loading_range_scale
        } else {
            self.radius
        };
        let center = transform.position + transform.rotation * self.location_offset;
        match self.sector_angle {
            Some(angle) => StreamingShape::sector(center, radius, transform.forward(), angle),
            None => StreamingShape::sphere(center, radius),
        }
    }
}

/// Immutable snapshot of a viewpoint, rebuilt every tick from its provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingSource {
    /// Keys the velocity history; empty names are not smoothed.
    pub name: String,
    pub transform: Transform,
    pub target_state: TargetState,
    pub priority: SourcePriority,
    pub block_on_slow_loading: bool,
    /// Empty means one sphere of the grid loading range.
    pub shapes: Vec<SourceShape>,
    /// Grids this source affects; empty means all grids.
    pub target_grids: Vec<String>,
    /// Smoothed velocity, filled in when sources are gathered.
    pub velocity: Vec3,
}

impl StreamingSource {
    pub fn new(name: impl Into<String>, position: Vec3) -> Self {
        Self {
            name: name.into(),
            transform: Transform::from_position(position),
            target_state: TargetState::Activated,
            priority: SourcePriority::Normal,
            block_on_slow_loading: false,
            shapes: Vec::new(),
            target_grids: Vec::new(),
            velocity: Vec3::ZERO,
        }
    }

    pub fn with_target_state(mut self, target_state: TargetState) -> Self {
        self.target_state = target_state;
        self
    }

    pub fn with_priority(mut self, priority: SourcePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.transform.rotation = rotation;
        self
    }

    pub fn with_radius(self, radius: f32) -> Self {
        self.with_shape(SourceShape::with_radius(radius))
    }

    pub fn with_shape(mut self, shape: SourceShape) -> Self {
        self.shapes.push(shape);
        self
    }

    pub fn with_target_grid(mut self, grid: impl Into<String>) -> Self {
        self.target_grids.push(grid.into());
        self
    }

    pub fn blocking(mut self, block_on_slow_loading: bool) -> Self {
        self.block_on_slow_loading = block_on_slow_loading;
        self
    }

    pub fn location(&self) -> Vec3 {
        self.transform.position
    }

    pub fn affects_grid(&self, grid_name: &str) -> bool {
        self.target_grids.is_empty() || self.target_grids.iter().any(|g| g == grid_name)
    }

    /// Resolve this source's shapes against a grid.
    pub fn for_each_shape(
        &self,
        grid_loading_range: f32,
        grid_name: &str,
        mut f: impl FnMut(StreamingShape),
    ) {
        if !self.affects_grid(grid_name) {
            return;
        }
        if self.shapes.is_empty() {
            f(StreamingShape::sphere(self.transform.position, grid_loading_range));
            return;
        }
        for shape in &self.shapes {
            f(shape.resolve(&self.transform, grid_loading_range));
        }
    }
}

impl fmt::Display for StreamingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = self.transform.position;
        let fwd = self.transform.forward();
        write!(
            f,
            "{} pos=({:.1}, {:.1}, {:.1}) fwd=({:.2}, {:.2}, {:.2}) target={:?} priority={:?} \
             blocking={} shapes={} speed={:.1}",
            if self.name.is_empty() { "<unnamed>" } else { self.name.as_str() },
            p.x,
            p.y,
            p.z,
            fwd.x,
            fwd.y,
            fwd.z,
            self.target_state,
            self.priority,
            self.block_on_slow_loading,
            self.shapes.len().max(1),
            self.velocity.length(),
        )
    }
}

/// Anything that can contribute a streaming source this tick: player
/// controllers, camera rigs, replay playback, gameplay objects.
pub trait StreamingSourceProvider {
    /// The current source, or `None` if the provider has nothing this tick.
    fn streaming_source(&self) -> Option<StreamingSource>;
}

/// A provider whose source is driven from outside, the way a player
/// controller or camera rig moves its viewpoint. Clones share state, so the
/// caller keeps one handle and registers another.
#[derive(Debug, Clone)]
pub struct ControlledSource {
    inner: Rc<RefCell<ControlledState>>,
}

#[derive(Debug)]
struct ControlledState {
    source: StreamingSource,
    enabled: bool,
}

impl ControlledSource {
    pub fn new(source: StreamingSource) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ControlledState {
                source,
                enabled: true,
            })),
        }
    }

    pub fn set_position(&self, position: Vec3) {
        self.inner.borrow_mut().source.transform.position = position;
    }

    pub fn set_transform(&self, transform: Transform) {
        self.inner.borrow_mut().source.transform = transform;
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.borrow_mut().enabled = enabled;
    }

    /// Edit the underlying source in place.
    pub fn modify(&self, f: impl FnOnce(&mut StreamingSource)) {
        f(&mut self.inner.borrow_mut().source);
    }

    pub fn position(&self) -> Vec3 {
        self.inner.borrow().source.transform.position
    }
}

impl StreamingSourceProvider for ControlledSource {
    fn streaming_source(&self) -> Option<StreamingSource> {
        let state = self.inner.borrow();
        state.enabled.then(|| state.source.clone())
    }
}

/// Plays back recorded source samples, one per poll. Returns `None` once
/// the recording is exhausted.
#[derive(Debug)]
pub struct ReplaySourceProvider {
    samples: Vec<StreamingSource>,
    cursor: Cell<usize>,
}

impl ReplaySourceProvider {
    pub fn new(samples: Vec<StreamingSource>) -> Self {
        Self {
            samples,
            cursor: Cell::new(0),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.cursor.get() >= self.samples.len()
    }
}

impl StreamingSourceProvider for ReplaySourceProvider {
    fn streaming_source(&self) -> Option<StreamingSource> {
        let index = self.cursor.get();
        let sample = self.samples.get(index)?.clone();
        self.cursor.set(index + 1);
        Some(sample)
    }
}

/// A point-in-time query used by streaming completion checks.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingQuerySource {
    pub location: Vec3,
    pub rotation: Quat,
    /// Explicit radius, used when `use_loading_range_radius` is false.
    pub radius: f32,
    /// Sector opening angle in degrees; `None` is a sphere.
    pub angle: Option<f32>,
    pub use_loading_range_radius: bool,
    /// When false only always-loaded (non-spatial) cells are considered.
    pub spatial_query: bool,
    pub data_layers: BTreeSet<String>,
    /// Only cells in `data_layers` are considered; untagged cells are skipped.
    pub data_layers_only: bool,
}

impl Default for StreamingQuerySource {
    fn default() -> Self {
        Self {
            location: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            radius: 0.0,
            angle: None,
            use_loading_range_radius: true,
            spatial_query: true,
            data_layers: BTreeSet::new(),
            data_layers_only: false,
        }
    }
}

impl StreamingQuerySource {
    pub fn at(location: Vec3) -> Self {
        Self {
            location,
            ..Self::default()
        }
    }

    pub fn with_radius(mut self, radius: f32) -> Self {
        self.radius = radius;
        self.use_loading_range_radius = false;
        self
    }

    pub fn with_data_layer(mut self, layer: impl Into<String>) -> Self {
        self.data_layers.insert(layer.into());
        self
    }

    pub fn non_spatial(mut self) -> Self {
        self.spatial_query = false;
        self
    }

    pub fn shape(&self, grid_loading_range: f32) -> StreamingShape {
        let radius = if self.use_loading_range_radius {
            grid_loading_range
        } else {
            self.radius
        };
        match self.angle {
            Some(angle) => {
                StreamingShape::sector(self.location, radius, self.rotation * Vec3::NEG_Z, angle)
            }
            None => StreamingShape::sphere(self.location, radius),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_order_puts_highest_first() {
        assert!(SourcePriority::Highest < SourcePriority::High);
        assert!(SourcePriority::Low < SourcePriority::Lowest);
        assert_eq!(SourcePriority::Lowest as u8, 255);
    }

    #[test]
    fn source_without_shapes_uses_grid_loading_range() {
        let source = StreamingSource::new("player", Vec3::new(1.0, 2.0, 3.0));
        let mut shapes = Vec::new();
        source.for_each_shape(500.0, "main", |s| shapes.push(s));
        assert_eq!(shapes, vec![StreamingShape::sphere(Vec3::new(1.0, 2.0, 3.0), 500.0)]);
    }

    #[test]
    fn explicit_radius_and_scaled_range_shapes() {
        let source = StreamingSource::new("player", Vec3::ZERO)
            .with_radius(50.0)
            .with_shape(SourceShape {
                loading_range_scale: 0.5,
                ..SourceShape::default()
            });
        let mut radii = Vec::new();
        source.for_each_shape(400.0, "main", |s| radii.push(s.radius()));
        assert_eq!(radii, vec![50.0, 200.0]);
    }

    #[test]
    fn shape_offset_follows_source_rotation() {
        let source = StreamingSource::new("cam", Vec3::ZERO)
            .with_rotation(Quat::from_rotation_y(std::f32::consts::PI))
            .with_shape(SourceShape {
                location_offset: Vec3::new(0.0, 0.0, -10.0),
                ..SourceShape::with_radius(1.0)
            });
        let mut centers = Vec::new();
        source.for_each_shape(0.0, "main", |s| centers.push(s.center()));
        assert!((centers[0] - Vec3::new(0.0, 0.0, 10.0)).length() < 1e-4);
    }

    #[test]
    fn target_grids_filter_shapes() {
        let source = StreamingSource::new("hlod", Vec3::ZERO).with_target_grid("hlod0");
        let mut count = 0;
        source.for_each_shape(100.0, "main", |_| count += 1);
        assert_eq!(count, 0);
        source.for_each_shape(100.0, "hlod0", |_| count += 1);
        assert_eq!(count, 1);
    }

    #[test]
    fn controlled_source_shares_state_between_clones() {
        let handle = ControlledSource::new(StreamingSource::new("p0", Vec3::ZERO));
        let registered = handle.clone();
        handle.set_position(Vec3::new(5.0, 0.0, 0.0));
        let source = registered.streaming_source().unwrap();
        assert_eq!(source.location(), Vec3::new(5.0, 0.0, 0.0));

        handle.set_enabled(false);
        assert!(registered.streaming_source().is_none());
    }

    #[test]
    fn replay_provider_plays_samples_in_order() {
        let replay = ReplaySourceProvider::new(vec![
            StreamingSource::new("replay", Vec3::ZERO),
            StreamingSource::new("replay", Vec3::X),
        ]);
        assert_eq!(replay.streaming_source().unwrap().location(), Vec3::ZERO);
        assert_eq!(replay.streaming_source().unwrap().location(), Vec3::X);
        assert!(replay.streaming_source().is_none());
        assert!(replay.is_finished());
    }

    #[test]
    fn query_source_radius_modes() {
        let q = StreamingQuerySource::at(Vec3::ZERO);
        assert_eq!(q.shape(300.0).radius(), 300.0);
        let q = q.with_radius(0.0);
        assert_eq!(q.shape(300.0).radius(), 0.0);
    }
}
