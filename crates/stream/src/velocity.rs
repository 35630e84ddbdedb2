use std::collections::HashMap;

use glam::Vec3;

use crate::config::StreamConfig;

/// Ring buffer of recent velocity samples for one streaming source.
#[derive(Debug)]
pub struct VelocityTracker {
    history: Vec<Vec3>,
    capacity: usize,
    index: usize,
    filled: bool,
    last_position: Option<Vec3>,
}

impl VelocityTracker {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            history: vec![Vec3::ZERO; capacity],
            capacity,
            index: 0,
            filled: false,
            last_position: None,
        }
    }

    pub fn record(&mut self, velocity: Vec3) {
        self.history[self.index] = velocity;
        self.index = (self.index + 1) % self.capacity;
        if self.index == 0 {
            self.filled = true;
        }
    }

    /// Feed a new position. Invalid or oversized deltas record a zero
    /// sample; a jump over `teleport_distance` discards the history.
    pub fn update(&mut self, position: Vec3, dt: f32, config: &StreamConfig) -> Vec3 {
        let Some(last) = self.last_position.replace(position) else {
            return self.average();
        };
        let displacement = position - last;
        if displacement.length() > config.teleport_distance {
            tracing::debug!(distance = displacement.length(), "streaming source teleported");
            self.reset();
            self.last_position = Some(position);
            return Vec3::ZERO;
        }
        if !dt.is_finite() || dt <= 0.0 || dt > config.max_velocity_delta_time {
            self.record(Vec3::ZERO);
        } else {
            self.record(displacement / dt);
        }
        self.average()
    }

    pub fn reset(&mut self) {
        self.history.fill(Vec3::ZERO);
        self.index = 0;
        self.filled = false;
        self.last_position = None;
    }

    pub fn average(&self) -> Vec3 {
        let count = self.count();
        if count == 0 {
            return Vec3::ZERO;
        }
        let total: Vec3 = self.history[..count].iter().copied().sum();
        total / count as f32
    }

    pub fn count(&self) -> usize {
        if self.filled {
            self.capacity
        } else {
            self.index
        }
    }
}

/// Velocity trackers keyed by source name, dropped when a source stops
/// being reported.
#[derive(Debug, Default)]
pub struct VelocityTrackers {
    trackers: HashMap<String, (VelocityTracker, u64)>,
}

impl VelocityTrackers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the smoothed velocity, or zero for unnamed sources.
    pub fn update(
        &mut self,
        name: &str,
        position: Vec3,
        dt: f32,
        epoch: u64,
        config: &StreamConfig,
    ) -> Vec3 {
        if name.is_empty() {
            return Vec3::ZERO;
        }
        let (tracker, seen) = self
            .trackers
            .entry(name.to_owned())
            .or_insert_with(|| (VelocityTracker::new(config.velocity_sample_count), epoch));
        *seen = epoch;
        tracker.update(position, dt, config)
    }

    /// Drop trackers not updated during `epoch`.
    pub fn retain_epoch(&mut self, epoch: u64) {
        self.trackers.retain(|_, (_, seen)| *seen == epoch);
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    pub fn clear(&mut self) {
        self.trackers.clear();
    }
}
