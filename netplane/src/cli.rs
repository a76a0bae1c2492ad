//! Parses the command line arguments and runs the chosen simulation.
//!
//! Running the triangle for thirty ticks with logging written to `./logs`:
//!
//! ```cargo run -- --scenario triangle --ticks 30 --log```

use crate::{simulations, Simulation};
use anyhow::Context;
use clap::{Parser, ValueEnum};
use netplane_core::{DependencyManager, ExitStatus};
use std::{
    fs::{create_dir_all, OpenOptions},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Scenario {
    /// Three routers in a ring.
    Triangle,
    /// The ring, with one link failing halfway through the run.
    LinkFailure,
}

/// Stores the different command line arguments.
#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Args {
    /// Write JSON logs to a file under ./logs instead of the terminal.
    #[arg(short, long)]
    pub log: bool,
    /// How many ticks to run.
    #[arg(short, long, default_value_t = 10)]
    pub ticks: u64,
    /// Milliseconds between ticks.
    #[arg(long, default_value_t = 1000)]
    pub tick_ms: u64,
    #[arg(short, long, value_enum, default_value_t = Scenario::Triangle)]
    pub scenario: Scenario,
    /// JSON file to load the protocol dependency graph from, instead of the
    /// built-in one.
    #[arg(short, long)]
    pub dependencies: Option<PathBuf>,
    /// Write the dependency graph in use to this JSON file.
    #[arg(long)]
    pub dump_dependencies: Option<PathBuf>,
}

/// Parses the process arguments and runs the simulation they describe.
pub async fn initialize_from_arguments() -> anyhow::Result<()> {
    let args = Args::parse();
    if args.log {
        initialize_logging()?;
    } else {
        initialize_terminal_logging()?;
    }
    let status = run(&args).await?;
    println!("Finished with {:?}", status);
    Ok(())
}

/// Loads the dependency graph named by `args`, or the built-in one.
pub fn dependencies(args: &Args) -> anyhow::Result<DependencyManager> {
    let dependencies = match &args.dependencies {
        Some(path) => DependencyManager::load(path)
            .with_context(|| format!("Could not load {}", path.display()))?,
        None => DependencyManager::with_defaults(),
    };
    if let Some(path) = &args.dump_dependencies {
        dependencies
            .save(path)
            .with_context(|| format!("Could not write {}", path.display()))?;
        tracing::info!("Dependency graph written to {}", path.display());
    }
    Ok(dependencies)
}

/// Runs the scenario in `args` to completion or until interrupted, then
/// prints what each device ended up with.
pub async fn run(args: &Args) -> anyhow::Result<ExitStatus> {
    let sim = simulations::triangle_topology(dependencies(args)?)?
        .with_interval(Duration::from_millis(args.tick_ms.max(1)));

    let shutdown = sim.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted");
            shutdown.shut_down_with_status(ExitStatus::Status(130));
        }
    });

    let status = match args.scenario {
        Scenario::Triangle => simulations::triangle(&sim, args.ticks).await?,
        Scenario::LinkFailure => simulations::link_failure(&sim, args.ticks).await?,
    };
    print_summary(&sim);
    sim.finish().await;
    Ok(status)
}

fn print_summary(sim: &Simulation) {
    for device in sim.summary() {
        print!("{}", device);
    }
}

/// Sends JSON logs to a timestamped file in `./logs`. Only call once.
fn initialize_logging() -> anyhow::Result<()> {
    let main_path = "./logs";
    create_dir_all(main_path)?;
    let file_path = format!(
        "{}/debug-{}.log",
        main_path,
        chrono::offset::Local::now().format("%y-%m-%d_%H-%M-%S")
    );
    let file = OpenOptions::new()
        .write(true)
        .append(true)
        .create(true)
        .open(&file_path)
        .with_context(|| format!("Could not open {}", file_path))?;
    let subscriber = FmtSubscriber::builder()
        .with_writer(Arc::new(file))
        .with_max_level(tracing::Level::DEBUG)
        .json()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Sends logs to stderr, filtered by `RUST_LOG` and defaulting to `info`.
fn initialize_terminal_logging() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = Args::parse_from(["netplane"]);
        assert!(!args.log);
        assert_eq!(args.ticks, 10);
        assert_eq!(args.tick_ms, 1000);
        assert_eq!(args.scenario, Scenario::Triangle);
        assert!(args.dependencies.is_none());
    }

    #[test]
    fn scenario_names() {
        let args = Args::parse_from(["netplane", "--scenario", "link-failure", "-t", "4"]);
        assert_eq!(args.scenario, Scenario::LinkFailure);
        assert_eq!(args.ticks, 4);
    }
}
