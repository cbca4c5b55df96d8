use crate::comparator::{UseCase, DEFAULT_PROTOCOLS};
use crate::config::{load_scenario, RunConfig};
use crate::sensor::parse_sensor_list;
use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;

/// IoT Protocol Benchmark - drives MQTT, CoAP and custom UDP implementations
/// through identical synthetic sensor workloads
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Run configuration file (JSON)
    #[clap(help_heading = "Core Options")]
    pub config: Option<PathBuf>,

    /// Predefined scenario name, resolved in --scenarios-dir
    #[clap(short = 's', long, help_heading = "Core Options")]
    pub scenario: Option<String>,

    /// Directory holding scenario files
    #[clap(long, default_value = "configs/scenarios")]
    pub scenarios_dir: PathBuf,

    /// Override the configured protocol
    #[clap(short = 'p', long, help_heading = "Core Options")]
    pub protocol: Option<String>,

    /// Compare protocols on the same scenario (comma-separated; empty means
    /// mqtt,coap,my_udp)
    #[clap(long, value_delimiter = ',', num_args = 0..)]
    pub compare: Option<Vec<String>>,

    /// Use case that picks the recommended protocol in a comparison
    #[clap(long, value_enum, default_value_t = UseCase::Balanced)]
    pub use_case: UseCase,

    /// Override the number of simulated clients
    #[clap(short = 'n', long)]
    pub num_clients: Option<usize>,

    /// Override the run duration in seconds
    #[clap(short = 'd', long)]
    pub duration: Option<f64>,

    /// Override the sensor list (e.g. "temp,humidity,motion:20")
    #[clap(long)]
    pub sensors: Option<String>,

    /// Root directory for result folders
    #[clap(short = 'o', long, default_value = "results")]
    pub output_dir: PathBuf,

    /// Interface network profiles are applied to
    #[clap(long, default_value = "lo")]
    pub interface: String,

    /// Ignore network profiles instead of invoking tc
    #[clap(long, default_value_t = false)]
    pub no_emulation: bool,

    /// Also write logs to this file
    #[clap(long)]
    pub log_file: Option<PathBuf>,

    /// Verbose output (-v debug, -vv trace)
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// List registered protocols and exit
    #[clap(long, default_value_t = false)]
    pub list_protocols: bool,

    /// List scenarios in --scenarios-dir and exit
    #[clap(long, default_value_t = false)]
    pub list_scenarios: bool,
}

impl Args {
    /// Build the run configuration from the config file or scenario, then
    /// apply command-line overrides
    pub fn load_config(&self) -> Result<RunConfig> {
        let mut config = match (&self.config, &self.scenario) {
            (Some(path), _) => {
                let mut config = RunConfig::from_file(path)
                    .with_context(|| format!("Failed to load config {}", path.display()))?;
                if config.name.is_none() {
                    config.name = path
                        .file_stem()
                        .map(|stem| stem.to_string_lossy().into_owned());
                }
                config
            }
            (None, Some(name)) => load_scenario(&self.scenarios_dir, name)
                .with_context(|| format!("Failed to load scenario '{}'", name))?,
            (None, None) => bail!("No configuration specified. Pass a config file or --scenario"),
        };

        if let Some(protocol) = &self.protocol {
            config.protocol = protocol.clone();
        }
        if let Some(num_clients) = self.num_clients {
            config.num_clients = num_clients;
        }
        if let Some(duration) = self.duration {
            config.duration = duration;
        }
        if let Some(sensors) = &self.sensors {
            config.sensors = parse_sensor_list(sensors);
        }
        config.validate()?;
        Ok(config)
    }

    /// Protocols to compare, if a comparison was requested
    pub fn comparison_protocols(&self) -> Option<Vec<String>> {
        self.compare.as_ref().map(|list| {
            let protocols: Vec<String> = list
                .iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
            if protocols.is_empty() {
                DEFAULT_PROTOCOLS.iter().map(|p| p.to_string()).collect()
            } else {
                protocols
            }
        })
    }
}
