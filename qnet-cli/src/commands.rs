//! CLI command implementations

use anyhow::{Context, Result, bail};
use clap::{Subcommand, ValueEnum};
use qnet_sim::{Scenario, SimulationConfig, simulate};
use tracing::info;

/// Output format of a run report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Built-in scenario selectable on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ScenarioArg {
    Mm1,
    ClosedCycle,
    ForkJoin,
    Cache,
    Petri,
    Heterogeneous,
}

impl From<ScenarioArg> for Scenario {
    fn from(arg: ScenarioArg) -> Self {
        match arg {
            ScenarioArg::Mm1 => Scenario::Mm1,
            ScenarioArg::ClosedCycle => Scenario::ClosedCycle,
            ScenarioArg::ForkJoin => Scenario::ForkJoin,
            ScenarioArg::Cache => Scenario::Cache,
            ScenarioArg::Petri => Scenario::PetriProducerConsumer,
            ScenarioArg::Heterogeneous => Scenario::HeterogeneousServer,
        }
    }
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run a built-in scenario
    Run {
        /// Scenario to simulate
        #[arg(value_enum)]
        scenario: ScenarioArg,
        /// Seed of the random stream (QNET_SEED when omitted, else 42)
        #[arg(short, long)]
        seed: Option<u64>,
        /// Simulated time at which the run stops
        #[arg(long)]
        horizon: Option<f64>,
        /// Upper bound on delivered events
        #[arg(long)]
        max_events: Option<u64>,
        /// Check network invariants after every event
        #[arg(long)]
        check: bool,
        /// Report format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// List the built-in scenarios
    List,
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub fn handle_command(command: Commands) -> Result<()> {
    match command {
        Commands::Run {
            scenario,
            seed,
            horizon,
            max_events,
            check,
            format,
        } => {
            let config = run_config(SimulationConfig::from_env(), seed, horizon, max_events, check)?;
            run_scenario(scenario.into(), config, format)
        }
        Commands::List => {
            list_scenarios();
            Ok(())
        }
    }
}

/// Applies command-line overrides on top of the environment configuration.
///
/// # Errors
/// - If the horizon is negative or not finite
fn run_config(
    mut config: SimulationConfig,
    seed: Option<u64>,
    horizon: Option<f64>,
    max_events: Option<u64>,
    check: bool,
) -> Result<SimulationConfig> {
    if let Some(seed) = seed {
        config.deterministic_seed = Some(seed);
    }
    if config.deterministic_seed.is_none() {
        config.deterministic_seed = SimulationConfig::deterministic_testing().deterministic_seed;
    }
    if let Some(horizon) = horizon {
        if !horizon.is_finite() || horizon < 0.0 {
            bail!("horizon must be a finite non-negative time, got {horizon}");
        }
        config.horizon = horizon;
    }
    if let Some(max_events) = max_events {
        config.max_events = max_events;
    }
    config.check_invariants |= check;
    Ok(config)
}

/// Run one scenario and print its report
///
/// # Errors
/// - Network linking failed
/// - The simulation failed
/// - The report could not be serialized
pub fn run_scenario(scenario: Scenario, config: SimulationConfig, format: OutputFormat) -> Result<()> {
    info!(scenario = scenario.name(), ?config, "running scenario");
    let network = scenario
        .build()
        .with_context(|| format!("failed to build scenario {scenario}"))?;
    let report = simulate(network, config).with_context(|| format!("scenario {scenario} failed"))?;

    match format {
        OutputFormat::Text => {
            println!("Scenario: {scenario} ({})", scenario.description());
            print!("{}", report.summary());
        }
        OutputFormat::Json => println!("{}", report.to_json()?),
    }

    if !report.success {
        bail!("{} invariant violations", report.invariant_violations.len());
    }
    Ok(())
}

fn list_scenarios() {
    println!("Built-in scenarios:");
    for scenario in Scenario::ALL {
        println!("  {:<16} {}", scenario.name(), scenario.description());
    }
}
