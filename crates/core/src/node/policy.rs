use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

/// Rolls are drawn uniformly from this range.
pub const ROLL_RANGE: std::ops::RangeInclusive<u32> = 1..=10;

pub const DEFAULT_INTERNAL_PROB: f64 = 0.7;
pub const TIGHT_INTERNAL_PROB: f64 = 0.4;

/// How a roll inside the communication band (other than the broadcast roll)
/// picks its single target.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FanOut {
    /// Roll `r` targets peer `(r - 1) mod n`.
    #[default]
    Designated,
    /// A peer drawn uniformly from the machine's RNG.
    Random,
}

impl Display for FanOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Designated => f.write_str("designated"),
            Self::Random => f.write_str("random"),
        }
    }
}

impl FromStr for FanOut {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "designated" => Ok(Self::Designated),
            "random" => Ok(Self::Random),
            other => Err(format!("unknown fan-out `{other}`")),
        }
    }
}

/// What a tick without a pending message does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Internal,
    /// Send to one peer. `Designated` carries the peer index, `Random` leaves the
    /// choice to the caller's RNG.
    SendOne(Option<usize>),
    Broadcast,
}

/// Maps a roll in `1..=10` to a [`Decision`].
///
/// Rolls in `1..=band` communicate; the highest roll in the band broadcasts.
/// The band width follows from the internal-event probability: `p = 0.7` gives
/// the rolls `{1, 2, 3}`, `p = 0.4` gives `{1..6}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventPolicy {
    band: u32,
    fan_out: FanOut,
}

impl EventPolicy {
    /// `internal_prob` must lie in `[0, 1]`; it is validated by the configuration.
    pub fn new(internal_prob: f64, fan_out: FanOut) -> Self {
        let band = (10.0 * (1.0 - internal_prob)).round().clamp(0.0, 10.0) as u32;
        Self { band, fan_out }
    }

    pub fn band(&self) -> u32 {
        self.band
    }

    pub fn fan_out(&self) -> FanOut {
        self.fan_out
    }

    pub fn classify(&self, roll: u32, peers: usize) -> Decision {
        if roll == 0 || roll > self.band || peers == 0 {
            return Decision::Internal;
        }
        if roll == self.band {
            return Decision::Broadcast;
        }
        match self.fan_out {
            FanOut::Designated => Decision::SendOne(Some((roll as usize - 1) % peers)),
            FanOut::Random => Decision::SendOne(None),
        }
    }
}

impl Default for EventPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_INTERNAL_PROB, FanOut::default())
    }
}
