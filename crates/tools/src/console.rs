//! `wp.*` console variables and commands.

use partition_stream::{CellState, WorldPartitionSubsystem};

use crate::inspector::{DebugFilter, dump_streaming_sources};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConsoleError {
    #[error("empty command line")]
    Empty,
    #[error("unknown console command: {0}")]
    UnknownCommand(String),
    #[error("{command}: missing argument {argument}")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },
    #[error("{command}: invalid value {value:?}")]
    InvalidValue { command: &'static str, value: String },
    #[error("no streaming grid at index {0}")]
    UnknownGrid(usize),
}

/// Console state that outlives single commands: the debug display filter.
#[derive(Debug, Default)]
pub struct Console {
    filter: DebugFilter,
}

const MAX_LOADING: &str = "wp.Runtime.MaxLoadingStreamingCells";
const ANGLE: &str = "wp.Runtime.AngleContribution";
const BLOCK: &str = "wp.Runtime.BlockOnSlowStreaming";
const OVERRIDE_RANGE: &str = "wp.Runtime.OverrideLoadingRange";
const DUMP_SOURCES: &str = "wp.Runtime.DumpStreamingSources";
const FILTER_GRID: &str = "wp.Debug.FilterGrid";
const FILTER_LAYER: &str = "wp.Debug.FilterDataLayer";
const FILTER_STATUS: &str = "wp.Debug.FilterStatus";
const FILTER_NAME: &str = "wp.Debug.FilterName";

const COMMANDS: [&str; 9] = [
    MAX_LOADING,
    ANGLE,
    BLOCK,
    OVERRIDE_RANGE,
    DUMP_SOURCES,
    FILTER_GRID,
    FILTER_LAYER,
    FILTER_STATUS,
    FILTER_NAME,
];

impl Console {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(&self) -> &DebugFilter {
        &self.filter
    }

    pub fn commands() -> &'static [&'static str] {
        &COMMANDS
    }

    /// Run one command line against `wp`. Variables given without a value
    /// print their current setting.
    pub fn execute(
        &mut self,
        wp: &mut WorldPartitionSubsystem,
        line: &str,
    ) -> Result<Vec<String>, ConsoleError> {
        let mut words = line.split_whitespace();
        let name = words.next().ok_or(ConsoleError::Empty)?;
        let args: Vec<&str> = words.collect();
        let command = COMMANDS
            .iter()
            .copied()
            .find(|c| c.eq_ignore_ascii_case(name))
            .ok_or_else(|| ConsoleError::UnknownCommand(name.to_owned()))?;
        tracing::debug!(command, ?args, "console command");

        let value = args.first().copied();
        let output = match command {
            MAX_LOADING => {
                if let Some(v) = value {
                    wp.config_mut().max_loading_cells = parse(command, v)?;
                }
                vec![format!("{command} = {}", wp.config().max_loading_cells)]
            }
            ANGLE => {
                if let Some(v) = value {
                    let angle: f32 = parse(command, v)?;
                    if !angle.is_finite() {
                        return Err(invalid(command, v));
                    }
                    wp.config_mut().angle_contribution = angle.clamp(0.0, 1.0);
                }
                vec![format!("{command} = {}", wp.config().angle_contribution)]
            }
            BLOCK => {
                if let Some(v) = value {
                    wp.config_mut().block_on_slow_streaming = match v {
                        "0" | "false" => false,
                        "1" | "true" => true,
                        _ => return Err(invalid(command, v)),
                    };
                }
                vec![format!(
                    "{command} = {}",
                    u8::from(wp.config().block_on_slow_streaming)
                )]
            }
            OVERRIDE_RANGE => override_loading_range(wp, &args)?,
            DUMP_SOURCES => dump_streaming_sources(wp),
            FILTER_GRID => set_filter(command, &mut self.filter.grid_name, value, Ok)?,
            FILTER_LAYER => set_filter(command, &mut self.filter.data_layer, value, Ok)?,
            FILTER_NAME => set_filter(command, &mut self.filter.name_substring, value, Ok)?,
            FILTER_STATUS => set_filter(command, &mut self.filter.status, value, |v| {
                CellState::from_label(&v).ok_or(v)
            })?,
            _ => return Err(ConsoleError::UnknownCommand(name.to_owned())),
        };
        Ok(output)
    }
}

fn parse<T: std::str::FromStr>(command: &'static str, value: &str) -> Result<T, ConsoleError> {
    value.parse().map_err(|_| invalid(command, value))
}

fn invalid(command: &'static str, value: &str) -> ConsoleError {
    ConsoleError::InvalidValue {
        command,
        value: value.to_owned(),
    }
}

fn override_loading_range(
    wp: &mut WorldPartitionSubsystem,
    args: &[&str],
) -> Result<Vec<String>, ConsoleError> {
    let mut grid = None;
    let mut range = None;
    for arg in args {
        if let Some(v) = arg.strip_prefix("-grid=") {
            grid = Some(parse::<usize>(OVERRIDE_RANGE, v)?);
        } else if let Some(v) = arg.strip_prefix("-range=") {
            range = Some(parse::<f32>(OVERRIDE_RANGE, v)?);
        } else {
            return Err(invalid(OVERRIDE_RANGE, arg));
        }
    }
    let grid = grid.ok_or(ConsoleError::MissingArgument {
        command: OVERRIDE_RANGE,
        argument: "-grid=<index>",
    })?;
    let range = range.ok_or(ConsoleError::MissingArgument {
        command: OVERRIDE_RANGE,
        argument: "-range=<distance>",
    })?;
    let target = wp
        .index_mut()
        .grid_at_mut(grid)
        .ok_or(ConsoleError::UnknownGrid(grid))?;
    // A non-positive range restores the grid's own setting.
    target.override_loading_range = (range > 0.0 && range.is_finite()).then_some(range);
    Ok(vec![format!(
        "grid {} loading range = {}",
        target.name(),
        target.loading_range()
    )])
}

fn set_filter<T: std::fmt::Debug>(
    command: &'static str,
    slot: &mut Option<T>,
    value: Option<&str>,
    convert: impl FnOnce(String) -> Result<T, String>,
) -> Result<Vec<String>, ConsoleError> {
    match value {
        None => {}
        Some(v) if v.eq_ignore_ascii_case("clear") => *slot = None,
        Some(v) => {
            *slot = Some(convert(v.to_owned()).map_err(|v| invalid(command, &v))?);
        }
    }
    Ok(vec![match slot {
        Some(v) => format!("{command} = {v:?}"),
        None => format!("{command} = <none>"),
    }])
}
