use std::{
    future::Future,
    io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Duration,
};

use anyhow::{anyhow, Context};
use lamport_sim::{
    config::{machine_port, ConfigError, SimulationArgs},
    simulation::{ClusterConfig, SimCluster, SimulationRng},
};
use tokio::process::{Child, Command};

use crate::config::ExperimentConfig;

/// How long interrupted machines get to flush their logs before they are killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunOutcome {
    Completed,
    Interrupted,
}

pub async fn run_experiments(config: ExperimentConfig) -> anyhow::Result<()> {
    let Some(last) = config.machines.checked_sub(1) else {
        anyhow::bail!("an experiment needs at least one machine");
    };
    machine_port(config.base_port, last)?;
    let seed = config.seed();
    tracing::info!(
        seed,
        runs = config.runs,
        machines = config.machines,
        in_process = config.in_process,
        "Starting experiments"
    );
    let master = SimulationRng::new(seed);
    for run in 1..=config.runs {
        let dir = run_dir(&config.output, run);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed creating {}", dir.display()))?;
        let run_seed = master.child_with_index(run as u64).seed();
        tracing::info!(run, seed = run_seed, dir = %dir.display(), "Starting run");
        let outcome = if config.in_process {
            run_in_process(&config, &dir, run_seed).await?
        } else {
            run_processes(&config, &dir, run_seed, ctrl_c()).await?
        };
        if outcome == RunOutcome::Interrupted {
            tracing::info!(run, "Run interrupted, skipping the remaining runs");
            break;
        }
        tracing::info!(run, "Run finished");
    }
    println!(
        "Logs written to {}; inspect them with `ldev analyze {}/run_*`",
        config.output.display(),
        config.output.display()
    );
    Ok(())
}

async fn ctrl_c() {
    if tokio::signal::ctrl_c().await.is_err() {
        // no signal handler, never interrupted
        std::future::pending::<()>().await;
    }
}

fn run_dir(output: &Path, run: usize) -> PathBuf {
    output.join(format!("run_{run}"))
}

fn duration(config: &ExperimentConfig) -> Option<Duration> {
    (config.duration_secs > 0).then(|| Duration::from_secs(config.duration_secs))
}

async fn run_in_process(
    config: &ExperimentConfig,
    dir: &Path,
    seed: u64,
) -> anyhow::Result<RunOutcome> {
    let cluster_config = ClusterConfig {
        machines: config.machines,
        host: config.host.clone(),
        base_port: config.base_port,
        tick_range: config.simulation.tick_range()?,
        internal_prob: config.simulation.internal_prob()?,
        fan_out: config.simulation.fan_out.unwrap_or_default(),
        duration: duration(config),
        seed,
    };
    let cluster = SimCluster::start(cluster_config).await?;
    let stop = cluster.shutdown_handle();
    let shutdown = stop.clone();
    let interrupt = tokio::spawn(async move {
        ctrl_c().await;
        tracing::info!("Interrupted, stopping the cluster");
        shutdown.shutdown();
    });
    let report = cluster.run().await;
    interrupt.abort();
    let report = report?;

    for summary in &report.summaries {
        tracing::info!(
            machine = %summary.id,
            tick_rate = summary.tick_rate,
            final_clock = summary.final_clock,
            events = summary.counts.total(),
            "Machine finished"
        );
    }
    tracing::info!(drift = report.drift(), "Cluster finished");
    report
        .write_logs(dir)
        .with_context(|| format!("failed writing logs into {}", dir.display()))?;
    Ok(if stop.is_shutdown() {
        RunOutcome::Interrupted
    } else {
        RunOutcome::Completed
    })
}

/// Arguments of machine `index` (0-based) for one run.
fn machine_command(
    config: &ExperimentConfig,
    index: usize,
    dir: &Path,
    seed: u64,
) -> Result<Vec<String>, ConfigError> {
    let port = |i: usize| machine_port(config.base_port, i);
    let peers = (0..config.machines)
        .filter(|other| *other != index)
        .map(|other| Ok(format!("{}:{}", config.host, port(other)?)))
        .collect::<Result<Vec<_>, ConfigError>>()?
        .join(",");

    let mut args = vec![format!("machine{}", index + 1), port(index)?.to_string()];
    if !peers.is_empty() {
        args.push(peers);
    }

    args.push("--duration-secs".to_owned());
    args.push(config.duration_secs.to_string());
    args.push("--log-dir".to_owned());
    args.push(dir.display().to_string());
    args.push("--seed".to_owned());
    args.push(seed.to_string());
    args.extend(simulation_flags(&config.simulation));
    Ok(args)
}

fn simulation_flags(simulation: &SimulationArgs) -> Vec<String> {
    let mut args = Vec::new();
    if simulation.tight {
        args.push("--tight".to_owned());
    }
    if let Some(min_ticks) = simulation.min_ticks {
        args.push("--min-ticks".to_owned());
        args.push(min_ticks.to_string());
    }
    if let Some(max_ticks) = simulation.max_ticks {
        args.push("--max-ticks".to_owned());
        args.push(max_ticks.to_string());
    }
    if let Some(internal_prob) = simulation.internal_prob {
        args.push("--internal-prob".to_owned());
        args.push(internal_prob.to_string());
    }
    if let Some(fan_out) = simulation.fan_out {
        args.push("--fan-out".to_owned());
        args.push(fan_out.to_string());
    }
    args
}

async fn wait_all(children: &mut [(String, Child)]) -> io::Result<Vec<(String, ExitStatus)>> {
    let mut statuses = Vec::with_capacity(children.len());
    for (machine, child) in children.iter_mut() {
        statuses.push((machine.clone(), child.wait().await?));
    }
    Ok(statuses)
}

/// Asks a machine to stop the way a terminal Ctrl-C would.
#[cfg(unix)]
fn interrupt(child: &mut Child) -> io::Result<()> {
    let Some(pid) = child.id() else {
        // already reaped
        return Ok(());
    };
    let pid = libc::pid_t::try_from(pid).map_err(io::Error::other)?;
    // SAFETY: `kill` has no memory safety requirements; `pid` is our unreaped child.
    if unsafe { libc::kill(pid, libc::SIGINT) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn interrupt(child: &mut Child) -> io::Result<()> {
    child.start_kill()
}

/// Interrupts every machine, waits up to `grace` for all of them to exit and
/// kills whatever is still running afterwards.
async fn stop_children(
    children: &mut [(String, Child)],
    grace: Duration,
) -> io::Result<Vec<(String, ExitStatus)>> {
    for (machine, child) in children.iter_mut() {
        if let Err(err) = interrupt(child) {
            tracing::warn!(%machine, error = %err, "Failed interrupting machine");
        }
    }
    if let Ok(statuses) = tokio::time::timeout(grace, wait_all(children)).await {
        return statuses;
    }
    for (machine, child) in children.iter_mut() {
        if matches!(child.try_wait(), Ok(None)) {
            tracing::warn!(%machine, ?grace, "Machine did not stop in time, killing it");
            if let Err(err) = child.start_kill() {
                tracing::warn!(%machine, error = %err, "Failed killing machine");
            }
        }
    }
    wait_all(children).await
}

async fn run_processes(
    config: &ExperimentConfig,
    dir: &Path,
    seed: u64,
    interrupted: impl Future<Output = ()>,
) -> anyhow::Result<RunOutcome> {
    // validate before spawning anything
    config.simulation.tick_range()?;
    config.simulation.internal_prob()?;

    let master = SimulationRng::new(seed);
    let mut children: Vec<(String, Child)> = Vec::with_capacity(config.machines);
    for index in 0..config.machines {
        let machine_seed = master.child_with_index(index as u64).seed();
        let args = machine_command(config, index, dir, machine_seed)?;
        let child = Command::new(&config.machine_bin)
            .kill_on_drop(true)
            .args(&args)
            .stdin(Stdio::null())
            .spawn()
            .with_context(|| format!("failed spawning {}", config.machine_bin.display()))?;
        tracing::debug!(pid = ?child.id(), ?args, "Spawned machine");
        children.push((args[0].clone(), child));
    }

    let finished = tokio::select! {
        statuses = wait_all(&mut children) => Some(statuses?),
        _ = interrupted => None,
    };
    let (outcome, statuses) = match finished {
        Some(statuses) => (RunOutcome::Completed, statuses),
        None => {
            tracing::info!("Interrupted, stopping machines");
            let statuses = stop_children(&mut children, SHUTDOWN_GRACE).await?;
            (RunOutcome::Interrupted, statuses)
        }
    };

    let mut failed = Vec::new();
    for (machine, status) in statuses {
        if !status.success() {
            tracing::warn!(%machine, %status, "Machine exited with failure");
            failed.push(machine);
        }
    }
    if !failed.is_empty() {
        return Err(anyhow!("machines failed: {}", failed.join(", ")));
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::config::{Config, SubCommand};

    fn experiment(args: &[&str]) -> ExperimentConfig {
        let args = ["ldev", "experiment"].iter().chain(args);
        match Config::try_parse_from(args).unwrap().sub_command {
            SubCommand::Experiment(config) => config,
            SubCommand::Analyze(_) => unreachable!(),
        }
    }

    #[test]
    fn machine_command_lists_every_other_peer() {
        let config = experiment(&[
            "--machines",
            "3",
            "--base-port",
            "6000",
            "--duration-secs",
            "5",
        ]);
        let args = machine_command(&config, 1, Path::new("out/run_1"), 11).unwrap();
        assert_eq!(
            args,
            [
                "machine2",
                "6001",
                "localhost:6000,localhost:6002",
                "--duration-secs",
                "5",
                "--log-dir",
                "out/run_1",
                "--seed",
                "11",
            ]
        );
    }

    #[test]
    fn machine_command_forwards_simulation_flags() {
        let config = experiment(&[
            "--machines",
            "1",
            "--tight",
            "--internal-prob",
            "0.25",
            "--fan-out",
            "random",
        ]);
        let args = machine_command(&config, 0, Path::new("out"), 0).unwrap();
        assert_eq!(args[..2], ["machine1", "50051"]);
        assert_eq!(args[2], "--duration-secs");
        assert!(args.ends_with(&[
            "--tight".to_owned(),
            "--internal-prob".to_owned(),
            "0.25".to_owned(),
            "--fan-out".to_owned(),
            "random".to_owned(),
        ]));
    }

    #[test]
    fn machine_command_is_understood_by_the_machine() {
        let config = experiment(&["--machines", "2", "--min-ticks", "2", "--max-ticks", "3"]);
        let args = machine_command(&config, 0, Path::new("logs"), 5).unwrap();
        let machine = lamport_sim::config::ConfigArgs::try_parse_from(
            std::iter::once("lamport-machine".to_owned()).chain(args),
        )
        .unwrap()
        .build()
        .unwrap();
        assert_eq!(machine.id.as_str(), "machine1");
        assert_eq!(machine.peers.len(), 1);
        assert_eq!(machine.seed, Some(5));
        assert_eq!(machine.tick_range.min(), 2);
        assert_eq!(machine.tick_range.max(), 3);
        assert_eq!(machine.log_dir.as_deref(), Some(Path::new("logs")));
    }

    #[tokio::test]
    async fn in_process_run_writes_one_log_per_machine() -> testresult::TestResult {
        let output = tempfile::tempdir()?;
        let config = experiment(&[
            "--in-process",
            "--machines",
            "2",
            "--min-ticks",
            "20",
            "--max-ticks",
            "20",
            "--duration-secs",
            "1",
        ]);
        let dir = run_dir(output.path(), 1);
        let outcome = run_in_process(&config, &dir, 3).await?;
        assert_eq!(outcome, RunOutcome::Completed);
        for machine in ["machine1", "machine2"] {
            let contents = std::fs::read_to_string(dir.join(format!("{machine}_log.txt")))?;
            assert!(contents.lines().count() > 1);
        }
        Ok(())
    }

    #[tokio::test]
    async fn ports_past_the_range_are_rejected_up_front() -> testresult::TestResult {
        let output = tempfile::tempdir()?;
        let mut config = experiment(&["--machines", "3", "--base-port", "65534"]);
        config.output = output.path().to_owned();

        let err = machine_command(&config, 0, output.path(), 0).unwrap_err();
        assert_eq!(
            err,
            ConfigError::PortOutOfRange {
                base_port: 65534,
                index: 2
            }
        );
        assert!(run_experiments(config).await.is_err());
        assert!(!run_dir(output.path(), 1).exists());
        Ok(())
    }

    /// Stand-in for `lamport-machine`: waits for SIGINT, runs `on_interrupt` and exits.
    #[cfg(unix)]
    fn fake_machine(dir: &Path, on_interrupt: &str) -> std::io::Result<PathBuf> {
        use std::os::unix::fs::PermissionsExt;

        let script = format!(
            r#"#!/bin/sh
id="$1"
while [ $# -gt 0 ]; do
  if [ "$1" = "--log-dir" ]; then dir="$2"; fi
  shift
done
{on_interrupt}
touch "$dir/$id.ready"
while :; do sleep 0.05; done
"#
        );
        let path = dir.join("fake-machine");
        std::fs::write(&path, script)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        Ok(path)
    }

    #[cfg(unix)]
    async fn all_ready(dir: &Path, machines: usize) {
        loop {
            let ready = (1..=machines)
                .filter(|i| dir.join(format!("machine{i}.ready")).exists())
                .count();
            if ready == machines {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn interrupted_run_lets_machines_write_their_logs() -> testresult::TestResult {
        let bin_dir = tempfile::tempdir()?;
        let output = tempfile::tempdir()?;
        let init = r#"echo "2025-03-01T10:00:00.000000Z $id INIT tick_rate=4""#;
        let machine_bin = fake_machine(
            bin_dir.path(),
            &format!(r#"trap '{init} > "$dir/${{id}}_log.txt"; exit 0' INT"#),
        )?;
        let mut config = experiment(&["--machines", "2", "--duration-secs", "0"]);
        config.machine_bin = machine_bin;
        let dir = run_dir(output.path(), 1);
        std::fs::create_dir_all(&dir)?;

        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            run_processes(&config, &dir, 1, all_ready(&dir, 2)),
        )
        .await??;
        assert_eq!(outcome, RunOutcome::Interrupted);

        let analysis = crate::analyze::analyze_dir(&dir)?;
        assert_eq!(analysis.machines.len(), 2);
        for stats in &analysis.machines {
            assert_eq!(stats.tick_rate, Some(4));
        }
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn machines_ignoring_the_interrupt_are_killed() -> testresult::TestResult {
        let bin_dir = tempfile::tempdir()?;
        let dir = tempfile::tempdir()?;
        let machine_bin = fake_machine(bin_dir.path(), "trap '' INT")?;
        let mut config = experiment(&["--machines", "1", "--duration-secs", "0"]);
        config.machine_bin = machine_bin;

        let args = machine_command(&config, 0, dir.path(), 0)?;
        let child = Command::new(&config.machine_bin)
            .kill_on_drop(true)
            .args(&args)
            .spawn()?;
        let mut children = vec![("machine1".to_owned(), child)];
        all_ready(dir.path(), 1).await;

        let statuses = tokio::time::timeout(
            Duration::from_secs(10),
            stop_children(&mut children, Duration::from_millis(200)),
        )
        .await??;
        assert_eq!(statuses.len(), 1);
        assert!(!statuses[0].1.success());
        Ok(())
    }
}
