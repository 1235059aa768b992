//! Messages exchanged between machines and their wire representation.

use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Stable identifier of a machine, assigned at startup.
///
/// Identifiers are single tokens (no whitespace, no commas) so they can be written
/// verbatim into event log lines.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MachineId(String);

impl MachineId {
    pub fn new(id: impl Into<String>) -> Result<Self, InvalidMachineId> {
        let id = id.into();
        if id.is_empty() || id.chars().any(|c| c.is_whitespace() || c == ',') {
            return Err(InvalidMachineId(id));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid machine identifier `{0}`: must be non-empty without whitespace or commas")]
pub struct InvalidMachineId(pub String);

impl Display for MachineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MachineId {
    type Err = InvalidMachineId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for MachineId {
    type Error = InvalidMachineId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<MachineId> for String {
    fn from(id: MachineId) -> Self {
        id.0
    }
}

/// A clock value sent from one machine to another.
///
/// Produced at send time, consumed exactly once by the receiver's tick loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockMessage {
    pub sender_id: MachineId,
    pub logical_clock: u64,
    /// Wall-clock time at the sender, only used for logging.
    pub timestamp: String,
}

impl ClockMessage {
    pub fn new(sender_id: MachineId, logical_clock: u64, sent_at: DateTime<Utc>) -> Self {
        Self {
            sender_id,
            logical_clock,
            timestamp: format_timestamp(&sent_at),
        }
    }
}

pub(crate) fn format_timestamp(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Raw `DeliverClockMessage` request as it arrives from the network.
///
/// Fields are not validated; [`ClockMessage::try_from`] performs validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliverClockMessage {
    pub sender_id: String,
    pub logical_clock: i64,
    pub timestamp: String,
}

impl TryFrom<&ClockMessage> for DeliverClockMessage {
    type Error = ClockOutOfRange;

    fn try_from(msg: &ClockMessage) -> Result<Self, Self::Error> {
        let logical_clock =
            i64::try_from(msg.logical_clock).map_err(|_| ClockOutOfRange(msg.logical_clock))?;
        Ok(Self {
            sender_id: msg.sender_id.to_string(),
            logical_clock,
            timestamp: msg.timestamp.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("logical clock {0} cannot be represented on the wire")]
pub struct ClockOutOfRange(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedMessage {
    #[error("missing sender id")]
    MissingSender,
    #[error(transparent)]
    InvalidSender(#[from] InvalidMachineId),
    #[error("negative logical clock {0}")]
    NegativeClock(i64),
    #[error("missing timestamp")]
    MissingTimestamp,
}

impl TryFrom<DeliverClockMessage> for ClockMessage {
    type Error = MalformedMessage;

    fn try_from(req: DeliverClockMessage) -> Result<Self, Self::Error> {
        if req.sender_id.is_empty() {
            return Err(MalformedMessage::MissingSender);
        }
        let sender_id = MachineId::new(req.sender_id)?;
        let logical_clock = u64::try_from(req.logical_clock)
            .map_err(|_| MalformedMessage::NegativeClock(req.logical_clock))?;
        if req.timestamp.trim().is_empty() {
            return Err(MalformedMessage::MissingTimestamp);
        }
        Ok(ClockMessage {
            sender_id,
            logical_clock,
            timestamp: req.timestamp,
        })
    }
}

/// Delivery confirmation. Carries no clock information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub received: bool,
}

impl Ack {
    pub const fn received() -> Self {
        Self { received: true }
    }

    pub const fn rejected() -> Self {
        Self { received: false }
    }
}

/// Requests understood by a machine's network endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireRequest {
    DeliverClockMessage(DeliverClockMessage),
}
