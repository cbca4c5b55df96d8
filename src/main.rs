//! # IoT Protocol Benchmark - Main Entry Point
//!
//! 1. **Parse arguments** and install logging
//! 2. **Handle listing commands** (`--list-protocols`, `--list-scenarios`)
//! 3. **Load the run configuration** from a file or a named scenario
//! 4. **Run** a single protocol, or compare several sequentially
//!
//! A single run that produces no summary, and a comparison that produced
//! nothing or was interrupted, exit with status 1.

use anyhow::{Context, Result};
use clap::Parser;
use iot_bench::{
    cli::Args,
    comparator::Comparator,
    config::load_scenario,
    logging,
    network::{NetworkEmulator, NoEmulation, TcNetem},
    orchestrator::run_single,
    protocol::AdapterRegistry,
    results::DirectorySink,
};
use std::path::Path;
use std::process::ExitCode;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let _log_guard = logging::init(args.verbose, args.log_file.as_deref())?;

    let registry = AdapterRegistry::with_defaults();

    if args.list_protocols {
        println!("\nAvailable Protocols:");
        println!("{}", "=".repeat(60));
        for name in registry.names() {
            println!("   {}", name);
        }
        println!();
        return Ok(ExitCode::SUCCESS);
    }

    if args.list_scenarios {
        list_scenarios(&args.scenarios_dir)?;
        return Ok(ExitCode::SUCCESS);
    }

    info!("Starting IoT Protocol Benchmark v{}", iot_bench::VERSION);
    let config = match args.load_config() {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            return Ok(ExitCode::FAILURE);
        }
    };
    info!("Loaded scenario '{}'", config.scenario_name());

    let sink = DirectorySink::new(&args.output_dir);
    let mut emulator: Box<dyn NetworkEmulator> = if args.no_emulation {
        Box::new(NoEmulation)
    } else {
        Box::new(TcNetem::new(&args.interface))
    };

    if let Some(protocols) = args.comparison_protocols() {
        let report = Comparator::new(&registry, &sink)
            .with_use_case(args.use_case)
            .run(&config, &protocols, emulator.as_mut())
            .await?;
        info!(
            "Comparison complete: {} of {} protocols reported",
            report.results.len(),
            report.protocols.len()
        );
        return Ok(if report.results.is_empty() || report.interrupted {
            ExitCode::FAILURE
        } else {
            ExitCode::SUCCESS
        });
    }

    match run_single(&config, &registry, &sink, emulator.as_mut()).await? {
        Some(_) => {
            info!("Test completed successfully");
            Ok(ExitCode::SUCCESS)
        }
        None => Ok(ExitCode::FAILURE),
    }
}

/// Print every `*.json` scenario in `dir` with its name and description
fn list_scenarios(dir: &Path) -> Result<()> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read scenarios directory {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().map_or(false, |ext| ext == "json"))
        .filter_map(|path| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .collect();
    names.sort();

    println!("\nAvailable Scenarios:");
    println!("{}", "=".repeat(60));
    for name in names {
        match load_scenario(dir, &name) {
            Ok(config) => {
                println!("\n  {}", name);
                println!("    Name: {}", config.scenario_name());
                println!(
                    "    Description: {}",
                    config.description.as_deref().unwrap_or("No description")
                );
            }
            Err(e) => println!("  {} (error loading: {})", name, e),
        }
    }
    println!();
    Ok(())
}
