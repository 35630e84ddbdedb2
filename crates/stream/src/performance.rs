use serde::{Deserialize, Serialize};

use crate::cell::SourceInfoCache;
use crate::config::StreamConfig;

/// Aggregate streaming health, ordered from best to worst.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum StreamingPerformance {
    #[default]
    Good,
    Slow,
    Critical,
}

/// Classify a pending cell by how close its nearest blocking source is,
/// relative to the grid loading range.
///
/// The distance is measured to the cell edge (center distance minus half the
/// cell size) and shortened by how far the source travels in
/// `velocity_lookahead` seconds.
pub fn classify(
    cache: &SourceInfoCache,
    level_cell_size: f32,
    loading_range: f32,
    config: &StreamConfig,
) -> StreamingPerformance {
    if !cache.is_blocking_source {
        return StreamingPerformance::Good;
    }
    if loading_range <= 0.0 {
        return StreamingPerformance::Critical;
    }
    let distance = cache.min_sq_distance_to_blocking_source.sqrt()
        - cache.blocking_source_speed * config.velocity_lookahead
        - level_cell_size * 0.5;
    let ratio = distance / loading_range;
    let critical = config.block_on_slow_streaming_ratio;
    if ratio < critical {
        StreamingPerformance::Critical
    } else if ratio < critical * config.block_on_slow_streaming_warning_factor {
        StreamingPerformance::Slow
    } else {
        StreamingPerformance::Good
    }
}
