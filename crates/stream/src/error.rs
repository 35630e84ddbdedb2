use partition_common::ProviderId;

/// Errors from building the cell index, loading configuration and the
/// fallible parts of the subsystem API.
///
/// The per-tick streaming entry points never return these; they log and
/// carry on.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML config error: {0}")]
    Config(#[from] serde_yaml::Error),
    #[error("unknown streaming grid: {0}")]
    UnknownGrid(String),
    #[error("duplicate streaming grid: {0}")]
    DuplicateGrid(String),
    #[error("duplicate cell name: {0}")]
    DuplicateCell(String),
    #[error("grid {grid} has invalid cell size {cell_size}")]
    InvalidCellSize { grid: String, cell_size: f32 },
    #[error("stale or unknown cell handle")]
    StaleCell,
    #[error("streaming source provider {0:?} is not registered")]
    UnknownProvider(ProviderId),
}
