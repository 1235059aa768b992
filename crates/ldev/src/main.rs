use clap::Parser;

mod analyze;
mod config;
mod experiment;

use crate::config::{Config, SubCommand};

fn main() -> Result<(), anyhow::Error> {
    let tokio_rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let config = Config::parse();
    lamport_sim::config::set_logger(config.log_level);
    tokio_rt.block_on(async move {
        match config.sub_command {
            SubCommand::Experiment(experiment_config) => {
                experiment::run_experiments(experiment_config).await
            }
            SubCommand::Analyze(analyze_config) => analyze::analyze(analyze_config),
        }
    })
}
