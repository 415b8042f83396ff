//! CLI for qnetsim — run repeater-chain congestion experiments.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use qnetsim_core::ExperimentConfig;
use qnetsim_core::network::run_experiment;

#[derive(Parser)]
#[command(name = "qnetsim")]
#[command(about = "Discrete-event simulator for congestion control on quantum repeater chains")]
#[command(version = qnetsim_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an experiment described by a YAML descriptor and write the metric
    /// CSV streams next to it
    Run {
        /// Experiment descriptor (references the topology file)
        experiment: PathBuf,

        /// Override the descriptor's random seed
        #[arg(long)]
        seed: Option<u64>,

        /// Override the descriptor's output directory
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            experiment,
            seed,
            output_dir,
        } => {
            let mut config = match ExperimentConfig::load(&experiment) {
                Ok(config) => config,
                Err(err) => {
                    log::error!("cannot load {}: {err}", experiment.display());
                    eprintln!("error: {err}");
                    return ExitCode::FAILURE;
                }
            };
            if let Some(seed) = seed {
                config.seed = seed;
            }
            if let Some(dir) = output_dir {
                config.output_dir = dir;
            }

            match run_experiment(&config) {
                Ok(report) => {
                    println!(
                        "{}: {} events, {} metric samples -> {}",
                        config.name,
                        report.stats.events_processed,
                        report.metrics.total_samples(),
                        config.output_dir.display()
                    );
                    ExitCode::SUCCESS
                }
                Err(err) => {
                    log::error!("run failed: {err}");
                    eprintln!("error: {err}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}
