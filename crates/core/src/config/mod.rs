use std::{
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::{
    message::{InvalidMachineId, MachineId},
    node::policy::{FanOut, DEFAULT_INTERNAL_PROB, TIGHT_INTERNAL_PROB},
    simulation::EventRng,
    transport::{parse_peer_list, InvalidPeerAddress, PeerAddress, DEFAULT_SEND_TIMEOUT},
};

/// Default run length of a machine.
pub const DEFAULT_DURATION: Duration = Duration::from_secs(60);
/// Tick rates (ticks per second) are drawn from this range unless configured.
pub const DEFAULT_TICK_RANGE: (u32, u32) = (1, 6);
/// Tick range used by tight mode.
pub const TIGHT_TICK_RANGE: (u32, u32) = (3, 4);

fn default_listening_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

/// Knobs that shape a machine's behaviour, shared by the machine binary and the
/// experiment runner.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct SimulationArgs {
    /// Narrower tick range ([3, 4]) and more communication (internal probability 0.4),
    /// unless explicitly overridden.
    #[arg(long)]
    pub tight: bool,

    /// Lower bound of the tick rate range (ticks per second).
    #[arg(long, env = "MIN_TICKS")]
    pub min_ticks: Option<u32>,

    /// Upper bound of the tick rate range (ticks per second).
    #[arg(long, env = "MAX_TICKS")]
    pub max_ticks: Option<u32>,

    /// Probability that a tick without pending messages is an internal event.
    #[arg(long, env = "INTERNAL_PROB")]
    pub internal_prob: Option<f64>,

    /// How a single-target send picks its peer.
    #[arg(long, value_enum)]
    pub fan_out: Option<FanOut>,
}

impl SimulationArgs {
    /// Fills every unset value from `other`.
    fn merge(self, other: SimulationArgs) -> Self {
        Self {
            tight: self.tight || other.tight,
            min_ticks: self.min_ticks.or(other.min_ticks),
            max_ticks: self.max_ticks.or(other.max_ticks),
            internal_prob: self.internal_prob.or(other.internal_prob),
            fan_out: self.fan_out.or(other.fan_out),
        }
    }

    pub fn tick_range(&self) -> Result<TickRateRange, ConfigError> {
        let (min, max) = if self.tight {
            TIGHT_TICK_RANGE
        } else {
            DEFAULT_TICK_RANGE
        };
        TickRateRange::new(self.min_ticks.unwrap_or(min), self.max_ticks.unwrap_or(max))
    }

    pub fn internal_prob(&self) -> Result<f64, ConfigError> {
        let default = if self.tight {
            TIGHT_INTERNAL_PROB
        } else {
            DEFAULT_INTERNAL_PROB
        };
        let prob = self.internal_prob.unwrap_or(default);
        if !(0.0..=1.0).contains(&prob) {
            return Err(ConfigError::InvalidProbability(prob));
        }
        Ok(prob)
    }
}

/// Command line of a single machine.
#[derive(clap::Parser, Debug, Clone)]
#[command(name = "lamport-machine", version, about = "Run one Lamport clock machine")]
pub struct ConfigArgs {
    /// Identifier of this machine, written into every log line.
    pub machine_id: String,

    /// Port to listen on for messages from peers.
    pub port: u16,

    /// Comma-separated `host:port` list of the other machines.
    pub peers: Option<String>,

    /// IP address to listen on.
    #[arg(long, env = "ADDRESS")]
    pub address: Option<IpAddr>,

    #[command(flatten)]
    pub simulation: SimulationArgs,

    /// Seconds to run before shutting down; 0 runs until interrupted.
    #[arg(long, env = "DURATION_SECS")]
    pub duration_secs: Option<u64>,

    /// Seed for every random decision of this machine.
    #[arg(long, env = "SEED")]
    pub seed: Option<u64>,

    /// Time a peer has to acknowledge a message.
    #[arg(long, env = "SEND_TIMEOUT_MS")]
    pub send_timeout_ms: Option<u64>,

    /// Directory the `<machine_id>_log.txt` event log is written to.
    #[arg(long, env = "LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<LevelFilter>,

    /// TOML file providing defaults for every option. Command line values win.
    #[arg(long, env = "LAMPORT_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Contents of a config file. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub peers: Option<String>,
    pub address: Option<IpAddr>,
    #[serde(default)]
    pub tight: bool,
    pub min_ticks: Option<u32>,
    pub max_ticks: Option<u32>,
    pub internal_prob: Option<f64>,
    pub fan_out: Option<FanOut>,
    pub duration_secs: Option<u64>,
    pub seed: Option<u64>,
    pub send_timeout_ms: Option<u64>,
    pub log_dir: Option<PathBuf>,
    #[serde(default, with = "serde_log_level_filter")]
    pub log_level: Option<LevelFilter>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config_err = |reason: String| ConfigError::ConfigFile {
            path: path.to_owned(),
            reason,
        };
        let contents = std::fs::read_to_string(path).map_err(|err| config_err(err.to_string()))?;
        toml::from_str(&contents).map_err(|err| config_err(err.to_string()))
    }

    fn simulation(&self) -> SimulationArgs {
        SimulationArgs {
            tight: self.tight,
            min_ticks: self.min_ticks,
            max_ticks: self.max_ticks,
            internal_prob: self.internal_prob,
            fan_out: self.fan_out,
        }
    }
}

impl ConfigArgs {
    /// Merges the optional config file and validates the result.
    pub fn build(self) -> Result<MachineConfig, ConfigError> {
        let file = match &self.config {
            Some(path) => ConfigFile::load(path)?,
            None => ConfigFile::default(),
        };
        let simulation = self.simulation.merge(file.simulation());
        let id = MachineId::new(self.machine_id)?;
        let address = self
            .address
            .or(file.address)
            .unwrap_or_else(default_listening_address);
        let peers = parse_peer_list(self.peers.or(file.peers).as_deref().unwrap_or_default())?;
        let duration = match self.duration_secs.or(file.duration_secs) {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => Some(DEFAULT_DURATION),
        };

        let config = MachineConfig {
            id,
            listen: PeerAddress::new(address.to_string(), self.port),
            peers,
            tick_range: simulation.tick_range()?,
            internal_prob: simulation.internal_prob()?,
            fan_out: simulation.fan_out.unwrap_or_default(),
            duration,
            seed: self.seed.or(file.seed),
            send_timeout: self
                .send_timeout_ms
                .or(file.send_timeout_ms)
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_SEND_TIMEOUT),
            log_dir: Some(
                self.log_dir
                    .or(file.log_dir)
                    .unwrap_or_else(|| PathBuf::from(".")),
            ),
            log_level: self.log_level.or(file.log_level),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Inclusive range of tick rates, in ticks per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickRateRange {
    min: u32,
    max: u32,
}

impl TickRateRange {
    pub fn new(min: u32, max: u32) -> Result<Self, ConfigError> {
        if min == 0 || min > max {
            return Err(ConfigError::InvalidTickRange { min, max });
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> u32 {
        self.min
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn draw(&self, rng: &mut impl EventRng) -> u32 {
        rng.draw(self.min..=self.max)
    }
}

impl Default for TickRateRange {
    fn default() -> Self {
        Self {
            min: DEFAULT_TICK_RANGE.0,
            max: DEFAULT_TICK_RANGE.1,
        }
    }
}

/// Validated configuration of one machine.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub id: MachineId,
    pub listen: PeerAddress,
    pub peers: Vec<PeerAddress>,
    pub tick_range: TickRateRange,
    pub internal_prob: f64,
    pub fan_out: FanOut,
    /// `None` runs until stopped.
    pub duration: Option<Duration>,
    /// `None` seeds from entropy.
    pub seed: Option<u64>,
    pub send_timeout: Duration,
    /// `None` disables the event log file.
    pub log_dir: Option<PathBuf>,
    pub log_level: Option<LevelFilter>,
}

impl MachineConfig {
    /// A configuration with every knob at its default, no log file, running until stopped.
    pub fn new(id: MachineId, listen: PeerAddress, peers: Vec<PeerAddress>) -> Self {
        Self {
            id,
            listen,
            peers,
            tick_range: TickRateRange::default(),
            internal_prob: DEFAULT_INTERNAL_PROB,
            fan_out: FanOut::default(),
            duration: None,
            seed: None,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            log_dir: None,
            log_level: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        TickRateRange::new(self.tick_range.min, self.tick_range.max)?;
        if !(0.0..=1.0).contains(&self.internal_prob) {
            return Err(ConfigError::InvalidProbability(self.internal_prob));
        }
        if let Some(peer) = self.peers.iter().find(|peer| self.is_own_address(peer)) {
            return Err(ConfigError::ListenOnPeer(peer.clone()));
        }
        Ok(())
    }

    fn is_own_address(&self, peer: &PeerAddress) -> bool {
        if *peer == self.listen {
            return true;
        }
        if peer.port() != self.listen.port() {
            return false;
        }
        let unspecified = self
            .listen
            .host()
            .parse::<IpAddr>()
            .is_ok_and(|ip| ip.is_unspecified());
        let loopback = peer.host() == "localhost"
            || peer
                .host()
                .parse::<IpAddr>()
                .is_ok_and(|ip| ip.is_loopback() || ip.is_unspecified());
        unspecified && loopback
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid tick rate range [{min}, {max}]: bounds must be positive and ordered")]
    InvalidTickRange { min: u32, max: u32 },
    #[error("internal event probability {0} is outside [0, 1]")]
    InvalidProbability(f64),
    #[error(transparent)]
    InvalidPeerAddress(#[from] InvalidPeerAddress),
    #[error(transparent)]
    InvalidMachineId(#[from] InvalidMachineId),
    #[error("peer {0} is this machine's own listen address")]
    ListenOnPeer(PeerAddress),
    #[error("failed reading config file {}: {reason}", .path.display())]
    ConfigFile { path: PathBuf, reason: String },
    #[error("no port left for machine {index}: {base_port} + {index} exceeds 65535")]
    PortOutOfRange { base_port: u16, index: usize },
}

/// Port of the machine at `index` when machines listen on consecutive ports
/// starting at `base_port`.
pub fn machine_port(base_port: u16, index: usize) -> Result<u16, ConfigError> {
    u16::try_from(index)
        .ok()
        .and_then(|offset| base_port.checked_add(offset))
        .ok_or(ConfigError::PortOutOfRange { base_port, index })
}

mod serde_log_level_filter {
    use serde::{Deserialize, Deserializer, Serializer};
    use tracing::level_filters::LevelFilter;

    pub fn parse_log_level_str<'a, D>(level: &str) -> Result<LevelFilter, D::Error>
    where
        D: serde::Deserializer<'a>,
    {
        level
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("unknown log level: {level}")))
    }

    pub fn serialize<S>(level: &Option<LevelFilter>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match level {
            Some(level) => serializer.serialize_str(&level.to_string().to_lowercase()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<LevelFilter>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level = Option::<String>::deserialize(deserializer)?;
        level
            .map(|level| parse_log_level_str::<D>(level.as_str()))
            .transpose()
    }
}

/// Installs the global `tracing` subscriber once; later calls are no-ops.
pub fn set_logger(level: Option<LevelFilter>) {
    #[cfg(feature = "trace")]
    {
        static LOGGER_SET: AtomicBool = AtomicBool::new(false);
        if LOGGER_SET
            .compare_exchange(
                false,
                true,
                std::sync::atomic::Ordering::Release,
                std::sync::atomic::Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }

        if let Err(err) = crate::tracing::tracer::init_tracer(level) {
            eprintln!("failed tracing initialization: {err}");
        }
    }
    #[cfg(not(feature = "trace"))]
    let _ = level;
}
