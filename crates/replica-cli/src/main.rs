//! `replica` binary
//!
//! Runs a loopback simulation of one authority and N observers, or prints a
//! sample tree as one observer would receive it.

mod simulation;
mod wire;

use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use replica_core::ObserverId;
use simulation::{run_simulation, sample_world, SimulationConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("replica")
        .version(replica_core::VERSION)
        .about("Replicated state trees: loopback simulator")
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .subcommand(
            Command::new("simulate")
                .about("Drive random writes through one authority and N observers")
                .arg(
                    Arg::new("config")
                        .long("config")
                        .value_parser(value_parser!(PathBuf))
                        .help("SimulationConfig file (TOML or JSON)"),
                )
                .arg(
                    Arg::new("observers")
                        .long("observers")
                        .value_parser(value_parser!(u64))
                        .help("Number of observers"),
                )
                .arg(
                    Arg::new("steps")
                        .long("steps")
                        .value_parser(value_parser!(u64))
                        .help("Number of random operations"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .value_parser(value_parser!(u64))
                        .help("Random seed for reproducibility"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print the report as JSON"),
                ),
        )
        .subcommand(
            Command::new("inspect")
                .about("Print the sample world, optionally as one observer sees it")
                .arg(
                    Arg::new("observer")
                        .long("observer")
                        .value_parser(value_parser!(u64))
                        .help("Redact for this observer id"),
                )
                .arg(
                    Arg::new("depth")
                        .long("depth")
                        .default_value("8")
                        .value_parser(value_parser!(usize))
                        .help("Maximum nesting to print"),
                ),
        )
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.with_target(false).try_init()
    };
}

fn load_config(args: &ArgMatches) -> Result<SimulationConfig> {
    let mut config = match args.get_one::<PathBuf>("config") {
        Some(path) => SimulationConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SimulationConfig::default(),
    };
    if let Some(observers) = args.get_one::<u64>("observers") {
        config.observers = *observers;
    }
    if let Some(steps) = args.get_one::<u64>("steps") {
        config.steps = *steps;
    }
    if let Some(seed) = args.get_one::<u64>("seed") {
        config.seed = *seed;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("json-logs"));

    match matches.subcommand() {
        Some(("simulate", args)) => {
            let config = load_config(args)?;
            let report = run_simulation(config).await?;
            if args.get_flag("json") {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", report.generate_text());
            }
            if !report.passed() {
                std::process::exit(1);
            }
        }
        Some(("inspect", args)) => {
            let depth = args.get_one::<usize>("depth").copied();
            let world = sample_world(&SimulationConfig::default())?;
            let view = match args.get_one::<u64>("observer") {
                Some(id) => {
                    let diff = world.serialize(None, Some(ObserverId(*id)))?;
                    println!("{}", replica_value::codec::to_json(&diff)?);
                    replica_core::Replicant::from_serialized(
                        &diff,
                        replica_core::Role::Observer,
                        None,
                    )?
                }
                None => world,
            };
            println!("{}", view.inspect(depth)?);
        }
        _ => {
            cli().print_help()?;
        }
    }
    Ok(())
}
