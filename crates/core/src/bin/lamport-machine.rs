use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use lamport_sim::{
    config::{set_logger, ConfigArgs, MachineConfig},
    transport::tcp::TcpTransport,
    MachineNode,
};

async fn run(config: MachineConfig) -> anyhow::Result<()> {
    let transport = TcpTransport::new(config.send_timeout);
    let node = MachineNode::build_with_event_log(config, transport).await?;
    let shutdown = node.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, shutting down");
            shutdown.shutdown();
        }
    });

    node.run().await.context("machine aborted")?;
    Ok(())
}

fn main() -> ExitCode {
    let args = ConfigArgs::parse();
    let cli_level = args.log_level;
    let config = match args.build() {
        Ok(config) => config,
        Err(err) => {
            set_logger(cli_level);
            tracing::error!(error = %err, "Invalid configuration");
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };
    set_logger(config.log_level);

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("error: failed starting runtime: {err}");
            return ExitCode::FAILURE;
        }
    };
    match rt.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = ?err, "Machine failed");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
