mod demo;

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use sf_engine::{
    Collaborators, EngineConfig, EngineError, EngineResult, SimulationCatalog, SimulationEngine,
};

#[derive(Parser)]
#[command(name = "sf-cli")]
#[command(about = "Scenflow CLI - build cached scenarios and run what-if simulations", long_about = None)]
struct Cli {
    /// Engine configuration YAML
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Store root (overrides the configuration file)
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered simulations
    Simulations,
    /// Build a scenario, or reuse a live one with the same config
    Build {
        simulation: String,
        /// Scenario config as JSON, or @path to a JSON file
        input: String,
        #[arg(long)]
        ttl_hours: Option<i64>,
        /// Always build a fresh scenario
        #[arg(long)]
        no_reuse: bool,
    },
    /// Run parameters against a stored scenario
    Run {
        simulation: String,
        scenario_id: String,
        /// Parameters as JSON, or @path
        #[arg(default_value = "{}")]
        parameters: String,
    },
    /// Build-or-reuse and run in one step
    Inline {
        simulation: String,
        input: String,
        #[arg(default_value = "{}")]
        parameters: String,
        #[arg(long)]
        ttl_hours: Option<i64>,
    },
    /// Run a JSON array of parameter sets against one scenario
    Sweep {
        simulation: String,
        scenario_id: String,
        parameter_sets: String,
        /// Skip the default-parameter baseline
        #[arg(long)]
        no_baseline: bool,
    },
    /// List scenarios of a simulation
    Scenarios {
        simulation: String,
        /// Include expired scenarios
        #[arg(long)]
        all: bool,
    },
    /// Show one scenario
    Show {
        simulation: String,
        scenario_id: String,
    },
    /// Delete a scenario and its artifacts
    Delete {
        simulation: String,
        scenario_id: String,
    },
    /// Remove expired scenarios
    Cleanup { simulation: Option<String> },
    /// List recorded runs of a simulation, newest first
    Runs {
        simulation: String,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show one recorded run
    ShowRun { simulation: String, run_id: String },
}

fn main() -> EngineResult<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let engine = open_engine(cli.config.as_ref(), cli.root)?;
    debug!(
        root = %engine.store().layout().root().display(),
        simulations = engine.catalog().len(),
        "engine ready"
    );

    match cli.command {
        Commands::Simulations => print_json(&engine.list_simulations()),
        Commands::Build {
            simulation,
            input,
            ttl_hours,
            no_reuse,
        } => {
            let config = parse_json_arg("config", &input)?;
            print_json(&engine.build_scenario(&simulation, &config, ttl_hours, !no_reuse)?)
        }
        Commands::Run {
            simulation,
            scenario_id,
            parameters,
        } => {
            let parameters = parse_json_arg("parameters", &parameters)?;
            print_json(&engine.run_simulation(&simulation, &scenario_id, &parameters)?)
        }
        Commands::Inline {
            simulation,
            input,
            parameters,
            ttl_hours,
        } => {
            let config = parse_json_arg("config", &input)?;
            let parameters = parse_json_arg("parameters", &parameters)?;
            print_json(&engine.run_inline(&simulation, &config, &parameters, ttl_hours)?)
        }
        Commands::Sweep {
            simulation,
            scenario_id,
            parameter_sets,
            no_baseline,
        } => {
            let sets = match parse_json_arg("parameter sets", &parameter_sets)? {
                Value::Array(sets) => sets,
                _ => {
                    return Err(EngineError::Validation {
                        what: "parameter sets",
                        message: "expected a JSON array".to_string(),
                    });
                }
            };
            print_json(&engine.sweep(&simulation, &scenario_id, &sets, !no_baseline)?)
        }
        Commands::Scenarios { simulation, all } => {
            print_json(&engine.list_scenarios(&simulation, all)?)
        }
        Commands::Show {
            simulation,
            scenario_id,
        } => print_json(&engine.get_scenario(&simulation, &scenario_id)?),
        Commands::Delete {
            simulation,
            scenario_id,
        } => {
            engine.delete_scenario(&simulation, &scenario_id)?;
            println!("Deleted scenario {scenario_id}");
            Ok(())
        }
        Commands::Cleanup { simulation } => {
            let report = engine.cleanup_expired(simulation.as_deref());
            println!("Removed {} expired scenario(s)", report.removed.len());
            for (scenario_id, error) in &report.failed {
                eprintln!("  failed to remove {scenario_id}: {error}");
            }
            Ok(())
        }
        Commands::Runs { simulation, limit } => print_json(&engine.list_runs(&simulation, limit)?),
        Commands::ShowRun { simulation, run_id } => {
            print_json(&engine.get_run(&simulation, &run_id)?)
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_engine(config_path: Option<&PathBuf>, root: Option<PathBuf>) -> EngineResult<SimulationEngine> {
    let mut config = match config_path {
        Some(path) => EngineConfig::load_yaml(path)?,
        None => EngineConfig::default(),
    };
    if let Some(root) = root {
        config.workspace_root = root;
    }

    let catalog = SimulationCatalog::new().with(demo::PvSizing)?;
    let collaborators = Collaborators::with_values(Arc::new(demo::SyntheticValues));
    SimulationEngine::open(catalog, config, collaborators)
}

/// Inline JSON, or `@path` to read it from a file.
fn parse_json_arg(what: &'static str, arg: &str) -> EngineResult<Value> {
    let text = match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)?,
        None => arg.to_string(),
    };
    serde_json::from_str(&text).map_err(|e| EngineError::Validation {
        what,
        message: e.to_string(),
    })
}

fn print_json<T: Serialize>(value: &T) -> EngineResult<()> {
    let text = serde_json::to_string_pretty(value).map_err(std::io::Error::from)?;
    println!("{text}");
    Ok(())
}
