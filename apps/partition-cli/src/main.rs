use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use glam::Vec3;
use partition_common::Aabb;
use partition_stream::{
    CellIndex, CellLoader, ControlledSource, DeferredLoader, GridSettings, ImmediateLoader,
    RuntimeCell, StreamConfig, StreamingSource, WorldPartitionSubsystem,
};
use partition_tools::{Console, StreamingInspector};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "partition-cli", about = "CLI tool for world partition streaming")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print version and crate info
    Info,
    /// Move a streaming source across a square grid of cells
    Simulate {
        /// Cells per side of the grid
        #[arg(short, long, default_value = "16")]
        size: u32,
        /// Cell edge length in world units
        #[arg(long, default_value = "100.0")]
        cell_size: f32,
        /// Grid loading range
        #[arg(long, default_value = "300.0")]
        loading_range: f32,
        /// Number of ticks to simulate
        #[arg(short, long, default_value = "120")]
        ticks: u64,
        /// Source speed in units per second
        #[arg(long, default_value = "400.0")]
        speed: f32,
        /// Override the concurrent loading budget
        #[arg(short, long)]
        budget: Option<usize>,
        /// YAML streaming config
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Complete loads over several ticks instead of immediately
        #[arg(long)]
        deferred: bool,
        /// Loads completed per tick with --deferred
        #[arg(long, default_value = "2")]
        completions_per_tick: usize,
        /// Console commands to run before the first tick (repeatable)
        #[arg(long = "exec")]
        exec: Vec<String>,
        /// Print a stats line every N ticks
        #[arg(long, default_value = "10")]
        report_every: u64,
        /// Print the final summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the effective streaming config as YAML
    DumpConfig {
        /// YAML streaming config to load first
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<StreamConfig> {
    match path {
        Some(path) => StreamConfig::load(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(StreamConfig::default()),
    }
}

fn build_grid(size: u32, cell_size: f32, loading_range: f32) -> anyhow::Result<CellIndex> {
    let mut builder = CellIndex::builder();
    builder.add_grid(GridSettings::new("main", cell_size, loading_range))?;
    for x in 0..size {
        for z in 0..size {
            let min = Vec3::new(x as f32 * cell_size, 0.0, z as f32 * cell_size);
            let bounds = Aabb::new(min, min + Vec3::new(cell_size, cell_size * 0.5, cell_size));
            builder.add_cell(RuntimeCell::new(format!("main_{x}_{z}"), "main", bounds))?;
        }
    }
    Ok(builder.build())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match cli.command {
        Commands::Info => {
            println!("partition-cli v{}", env!("CARGO_PKG_VERSION"));
            println!("stream: {}", partition_stream::crate_info());
            println!("tools: {}", partition_tools::crate_info());
            println!("console commands:");
            for command in Console::commands() {
                println!("  {command}");
            }
        }
        Commands::Simulate {
            size,
            cell_size,
            loading_range,
            ticks,
            speed,
            budget,
            config,
            deferred,
            completions_per_tick,
            exec,
            report_every,
            json,
        } => {
            let mut config = load_config(config.as_ref())?;
            if let Some(budget) = budget {
                config.max_loading_cells = budget;
            }
            let index = build_grid(size, cell_size, loading_range)?;
            let deferred_loader = deferred.then(DeferredLoader::new);
            let loader: Box<dyn CellLoader> = match &deferred_loader {
                Some(loader) => Box::new(loader.clone()),
                None => Box::new(ImmediateLoader::new()),
            };
            let mut wp = WorldPartitionSubsystem::new(index, loader, config);

            let mut console = Console::new();
            for line in &exec {
                for out in console
                    .execute(&mut wp, line)
                    .with_context(|| format!("console command {line:?}"))?
                {
                    println!("{out}");
                }
            }

            let extent = size as f32 * cell_size;
            let player = ControlledSource::new(StreamingSource::new("player", Vec3::ZERO));
            wp.register_provider(Box::new(player.clone()));

            println!(
                "Simulating {ticks} ticks over {} cells (deferred={deferred})",
                wp.index().len()
            );
            let dt = 1.0 / 30.0;
            let direction = Vec3::new(1.0, 0.0, 1.0).normalize();
            for tick in 1..=ticks {
                let mut position = player.position() + direction * speed * dt;
                if position.x > extent || position.z > extent {
                    position = Vec3::ZERO;
                }
                player.set_position(position);

                let report = wp.tick(dt);
                if let Some(loader) = &deferred_loader {
                    loader.complete_next(completions_per_tick);
                }
                if report_every > 0 && tick % report_every == 0 {
                    println!(
                        "tick {tick:>5}: requests={} activated={} unloaded={} deferred={} performance={:?}",
                        report.load_requests,
                        report.activated,
                        report.unloaded,
                        report.deferred(),
                        report.performance
                    );
                }
            }

            let summary = StreamingInspector::summary(&wp);
            if json {
                println!("{}", summary.to_json()?);
            } else {
                println!("{summary}");
                for (state, count) in &summary.states {
                    println!("  {state}: {count}");
                }
            }
            wp.teardown();
        }
        Commands::DumpConfig { config } => {
            let config = load_config(config.as_ref())?;
            print!("{}", config.to_yaml()?);
        }
    }

    Ok(())
}
