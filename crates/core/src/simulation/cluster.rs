use std::{
    io::{self, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    config::{machine_port, ConfigError, MachineConfig, TickRateRange},
    message::MachineId,
    node::{
        policy::DEFAULT_INTERNAL_PROB, FanOut, MachineError, MachineNode, RunSummary,
        ShutdownHandle, StartupError,
    },
    tracing::{LogFileRegister, LogLine, MemoryRegister},
    transport::{in_memory::InMemoryNetwork, PeerAddress},
};

use super::SimulationRng;

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub machines: usize,
    pub host: String,
    pub base_port: u16,
    pub tick_range: TickRateRange,
    pub internal_prob: f64,
    pub fan_out: FanOut,
    /// `None` runs until the cluster's shutdown handle fires.
    pub duration: Option<Duration>,
    /// Master seed; machine `i` uses the child RNG with index `i`.
    pub seed: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            machines: 3,
            host: "localhost".into(),
            base_port: 50051,
            tick_range: TickRateRange::default(),
            internal_prob: DEFAULT_INTERNAL_PROB,
            fan_out: FanOut::default(),
            duration: Some(Duration::from_secs(60)),
            seed: 0,
        }
    }
}

impl ClusterConfig {
    fn address(&self, index: usize) -> Result<PeerAddress, ConfigError> {
        Ok(PeerAddress::new(
            self.host.clone(),
            machine_port(self.base_port, index)?,
        ))
    }

    /// Configuration of machine `index` (0-based, named `machine{index + 1}`).
    pub fn machine_config(&self, index: usize) -> Result<MachineConfig, StartupError> {
        let id = MachineId::new(format!("machine{}", index + 1))
            .map_err(|err| StartupError::Config(err.into()))?;
        let peers = (0..self.machines)
            .filter(|other| *other != index)
            .map(|other| self.address(other))
            .collect::<Result<_, _>>()?;
        let mut config = MachineConfig::new(id, self.address(index)?, peers);
        config.tick_range = self.tick_range;
        config.internal_prob = self.internal_prob;
        config.fan_out = self.fan_out;
        config.duration = self.duration;
        Ok(config)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error(transparent)]
    Machine(#[from] MachineError),
    #[error("machine task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// A fully connected set of machines running as tasks over an [`InMemoryNetwork`].
pub struct SimCluster {
    network: InMemoryNetwork,
    nodes: Vec<MachineNode<InMemoryNetwork>>,
    registers: Vec<MemoryRegister>,
    shutdown: ShutdownHandle,
}

impl SimCluster {
    /// Initializes every machine. Nothing ticks until [`SimCluster::run`].
    pub async fn start(config: ClusterConfig) -> Result<Self, StartupError> {
        if let Some(last) = config.machines.checked_sub(1) {
            machine_port(config.base_port, last)?;
        }
        let network = InMemoryNetwork::new();
        let master = SimulationRng::new(config.seed);
        let shutdown = ShutdownHandle::new();
        let mut nodes = Vec::with_capacity(config.machines);
        let mut registers = Vec::with_capacity(config.machines);
        for index in 0..config.machines {
            let register = MemoryRegister::new();
            let node = MachineNode::build_with_rng(
                config.machine_config(index)?,
                network.clone(),
                register.clone(),
                master.child_with_index(index as u64),
            )
            .await?
            .with_shutdown_handle(shutdown.clone());
            nodes.push(node);
            registers.push(register);
        }
        tracing::info!(machines = config.machines, seed = config.seed, "Cluster initialized");
        Ok(Self {
            network,
            nodes,
            registers,
            shutdown,
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn network(&self) -> &InMemoryNetwork {
        &self.network
    }

    /// Runs every machine concurrently until all of them stop.
    pub async fn run(self) -> Result<ClusterReport, ClusterError> {
        let tasks = self.nodes.into_iter().map(|node| tokio::spawn(node.run()));
        let results = futures::future::join_all(tasks).await;

        let mut summaries = Vec::with_capacity(results.len());
        for result in results {
            summaries.push(result??);
        }
        let logs = self.registers.iter().map(MemoryRegister::lines).collect();
        Ok(ClusterReport { summaries, logs })
    }
}

/// What every machine of a finished cluster run did.
#[derive(Debug, Clone)]
pub struct ClusterReport {
    pub summaries: Vec<RunSummary>,
    /// Event log of each machine, in machine order.
    pub logs: Vec<Vec<LogLine>>,
}

impl ClusterReport {
    /// Difference between the highest and the lowest final clock.
    pub fn drift(&self) -> u64 {
        let clocks = self.summaries.iter().map(|s| s.final_clock);
        let max = clocks.clone().max().unwrap_or_default();
        let min = clocks.min().unwrap_or_default();
        max - min
    }

    /// Writes `<dir>/<machine>_log.txt` for every machine, in the same format a
    /// machine process writes.
    pub fn write_logs(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        std::fs::create_dir_all(dir)?;
        let mut written = Vec::with_capacity(self.summaries.len());
        for (summary, lines) in self.summaries.iter().zip(&self.logs) {
            let path = LogFileRegister::log_path(dir, &summary.id);
            let mut file = io::BufWriter::new(std::fs::File::create(&path)?);
            for line in lines {
                writeln!(file, "{line}")?;
            }
            file.flush()?;
            written.push(path);
        }
        Ok(written)
    }
}
