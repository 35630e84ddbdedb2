use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::StreamError;

/// Streaming configuration: load budget, sort weighting, slow-streaming
/// thresholds, velocity smoothing and load retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Maximum number of cells loading at the same time.
    pub max_loading_cells: usize,
    /// Weight in `[0, 1]` of the source-forward angle in the distance sort key.
    pub angle_contribution: f32,
    /// Request a blocking flush when streaming turns critical (standalone only).
    pub block_on_slow_streaming: bool,
    /// Distance-to-cell / loading-range ratio under which streaming is critical.
    pub block_on_slow_streaming_ratio: f32,
    /// Multiplier of the critical ratio under which streaming is slow.
    pub block_on_slow_streaming_warning_factor: f32,
    /// Velocity samples kept per source.
    pub velocity_sample_count: usize,
    /// Displacement in one update treated as a teleport.
    pub teleport_distance: f32,
    /// Largest update delta time accepted for velocity sampling, in seconds.
    pub max_velocity_delta_time: f32,
    /// Seconds of source travel subtracted from the distance to a pending
    /// cell when classifying streaming performance.
    pub velocity_lookahead: f32,
    /// Load attempts before a cell is marked permanently failed.
    pub max_load_attempts: u32,
    /// Ticks to wait before the first retry; doubles with every failure.
    pub retry_backoff_ticks: u64,
    /// Host-side activation work per tick (actor count units). `None` is unbounded.
    pub activation_work_per_tick: Option<u32>,
    /// Cull cells whose vertical span does not overlap the source shape.
    pub enable_z_culling: bool,
    /// Whether HLOD cells take part in streaming completion queries.
    pub hlod_enabled: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_loading_cells: 4,
            angle_contribution: 1.0,
            block_on_slow_streaming: true,
            block_on_slow_streaming_ratio: 0.25,
            block_on_slow_streaming_warning_factor: 2.0,
            velocity_sample_count: 8,
            teleport_distance: 10_000.0,
            max_velocity_delta_time: 0.5,
            velocity_lookahead: 0.0,
            max_load_attempts: 3,
            retry_backoff_ticks: 2,
            activation_work_per_tick: None,
            enable_z_culling: false,
            hlod_enabled: true,
        }
    }
}

impl StreamConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self, StreamError> {
        let config: Self = serde_yaml::from_str(text)?;
        Ok(config.sanitized())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, StreamError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn to_yaml(&self) -> Result<String, StreamError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Clamp values into their valid ranges.
    pub fn sanitized(mut self) -> Self {
        if !self.angle_contribution.is_finite() {
            self.angle_contribution = 0.0;
        }
        self.angle_contribution = self.angle_contribution.clamp(0.0, 1.0);
        self.block_on_slow_streaming_ratio = self.block_on_slow_streaming_ratio.max(0.0);
        self.block_on_slow_streaming_warning_factor =
            self.block_on_slow_streaming_warning_factor.max(1.0);
        self.velocity_sample_count = self.velocity_sample_count.max(1);
        self.teleport_distance = self.teleport_distance.max(0.0);
        self.max_velocity_delta_time = self.max_velocity_delta_time.max(0.0);
        self.velocity_lookahead = self.velocity_lookahead.max(0.0);
        self.max_load_attempts = self.max_load_attempts.max(1);
        self
    }
}
