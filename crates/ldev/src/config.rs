use std::path::PathBuf;

use lamport_sim::config::SimulationArgs;
use rand::RngCore;
use tracing::level_filters::LevelFilter;

#[derive(clap::Parser, Clone)]
#[clap(name = "Lamport Simulator Development Tool")]
#[clap(version)]
pub struct Config {
    #[clap(subcommand)]
    pub sub_command: SubCommand,
    /// Log level of the tool itself.
    #[arg(long, global = true, env = "LOG_LEVEL")]
    pub log_level: Option<LevelFilter>,
}

#[derive(clap::Subcommand, Clone)]
pub enum SubCommand {
    Experiment(ExperimentConfig),
    Analyze(AnalyzeConfig),
}

/// Runs a batch of simulation runs, each one writing a log file per machine
/// into its own directory.
#[derive(clap::Parser, Clone, Debug)]
pub struct ExperimentConfig {
    /// Number of consecutive runs.
    #[arg(long, default_value_t = 5)]
    pub runs: usize,

    /// Machines per run.
    #[arg(long, default_value_t = 3)]
    pub machines: usize,

    /// Length of each run. 0 runs until interrupted.
    #[arg(long, default_value_t = 60)]
    pub duration_secs: u64,

    /// Port of the first machine; the others listen on the following ports.
    #[arg(long, default_value_t = 50051)]
    pub base_port: u16,

    /// Host the machines listen on and reach each other through.
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// Directory receiving one `run_<i>` directory per run.
    #[arg(long, default_value = "experiments")]
    pub output: PathBuf,

    /// Run the machines as tasks of this process instead of spawning processes.
    #[arg(long)]
    pub in_process: bool,

    /// Master seed. Picked at random when missing; always logged.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Machine executable used when spawning processes.
    #[arg(long, env = "LAMPORT_MACHINE_BIN", default_value = "lamport-machine")]
    pub machine_bin: PathBuf,

    #[clap(flatten)]
    pub simulation: SimulationArgs,
}

impl ExperimentConfig {
    pub fn seed(&self) -> u64 {
        self.seed.unwrap_or_else(|| rand::rngs::OsRng.next_u64())
    }
}

/// Prints statistics of the event logs found in run directories.
#[derive(clap::Parser, Clone, Debug)]
pub struct AnalyzeConfig {
    /// Run directories holding `<machine>_log.txt` files.
    #[arg(required = true)]
    pub dirs: Vec<PathBuf>,

    /// Print JSON instead of tables.
    #[arg(long)]
    pub json: bool,
}
