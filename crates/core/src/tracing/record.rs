use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};

use crate::{
    message::{format_timestamp, InvalidMachineId, MachineId},
    transport::{InvalidPeerAddress, PeerAddress},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Internal,
    Send {
        targets: Vec<PeerAddress>,
        failed: Vec<PeerAddress>,
    },
    Receive {
        /// Queue length right after the message was dequeued.
        queue_length: usize,
        from: MachineId,
    },
}

impl EventKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Internal => "INTERNAL",
            Self::Send { .. } => "SEND",
            Self::Receive { .. } => "RECEIVE",
        }
    }
}

/// One processed tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub machine: MachineId,
    pub wall_time: DateTime<Utc>,
    /// Clock value after the event.
    pub logical_clock: u64,
    pub kind: EventKind,
}

/// A line of a machine's event log.
///
/// ```text
/// <rfc3339> <machine> INIT tick_rate=<n>
/// <rfc3339> <machine> INTERNAL clock=<n>
/// <rfc3339> <machine> SEND clock=<n> to=<addr>[,<addr>...] failed=<addr,...|->
/// <rfc3339> <machine> RECEIVE clock=<n> queue_length=<q> from=<machine>
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogLine {
    Init {
        machine: MachineId,
        wall_time: DateTime<Utc>,
        tick_rate: u32,
    },
    Event(EventRecord),
}

impl LogLine {
    pub fn machine(&self) -> &MachineId {
        match self {
            Self::Init { machine, .. } => machine,
            Self::Event(record) => &record.machine,
        }
    }

    pub fn wall_time(&self) -> &DateTime<Utc> {
        match self {
            Self::Init { wall_time, .. } => wall_time,
            Self::Event(record) => &record.wall_time,
        }
    }

    pub fn as_event(&self) -> Option<&EventRecord> {
        match self {
            Self::Event(record) => Some(record),
            Self::Init { .. } => None,
        }
    }
}

impl From<EventRecord> for LogLine {
    fn from(record: EventRecord) -> Self {
        Self::Event(record)
    }
}

struct AddressList<'a>(&'a [PeerAddress]);

impl Display for AddressList<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return f.write_str("-");
        }
        for (i, addr) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{addr}")?;
        }
        Ok(())
    }
}

impl Display for EventRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} clock={}",
            format_timestamp(&self.wall_time),
            self.machine,
            self.kind.label(),
            self.logical_clock
        )?;
        match &self.kind {
            EventKind::Internal => Ok(()),
            EventKind::Send { targets, failed } => {
                write!(f, " to={} failed={}", AddressList(targets), AddressList(failed))
            }
            EventKind::Receive { queue_length, from } => {
                write!(f, " queue_length={queue_length} from={from}")
            }
        }
    }
}

impl Display for LogLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init {
                machine,
                wall_time,
                tick_rate,
            } => write!(
                f,
                "{} {machine} INIT tick_rate={tick_rate}",
                format_timestamp(wall_time)
            ),
            Self::Event(record) => record.fmt(f),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogParseError {
    #[error("missing field `{0}`")]
    Missing(&'static str),
    #[error("invalid timestamp `{0}`")]
    Timestamp(String),
    #[error(transparent)]
    Machine(#[from] InvalidMachineId),
    #[error("unknown event kind `{0}`")]
    UnknownKind(String),
    #[error("expected `{expected}=...`, found `{found}`")]
    Label { expected: &'static str, found: String },
    #[error("invalid number `{0}`")]
    Number(String),
    #[error(transparent)]
    Address(#[from] InvalidPeerAddress),
    #[error("unexpected trailing input `{0}`")]
    Trailing(String),
}

struct Fields<'a>(std::str::SplitWhitespace<'a>);

impl<'a> Fields<'a> {
    fn next(&mut self, name: &'static str) -> Result<&'a str, LogParseError> {
        self.0.next().ok_or(LogParseError::Missing(name))
    }

    fn labeled(&mut self, label: &'static str) -> Result<&'a str, LogParseError> {
        let token = self.next(label)?;
        token
            .strip_prefix(label)
            .and_then(|rest| rest.strip_prefix('='))
            .ok_or_else(|| LogParseError::Label {
                expected: label,
                found: token.to_owned(),
            })
    }

    fn number<N: FromStr>(&mut self, label: &'static str) -> Result<N, LogParseError> {
        let value = self.labeled(label)?;
        value
            .parse()
            .map_err(|_| LogParseError::Number(value.to_owned()))
    }

    fn addresses(&mut self, label: &'static str) -> Result<Vec<PeerAddress>, LogParseError> {
        match self.labeled(label)? {
            "-" => Ok(Vec::new()),
            list => list
                .split(',')
                .map(|addr| addr.parse().map_err(LogParseError::from))
                .collect(),
        }
    }

    fn finish(mut self) -> Result<(), LogParseError> {
        match self.0.next() {
            None => Ok(()),
            Some(extra) => Err(LogParseError::Trailing(extra.to_owned())),
        }
    }
}

impl FromStr for LogLine {
    type Err = LogParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut fields = Fields(line.split_whitespace());
        let ts = fields.next("timestamp")?;
        let wall_time = DateTime::parse_from_rfc3339(ts)
            .map_err(|_| LogParseError::Timestamp(ts.to_owned()))?
            .with_timezone(&Utc);
        let machine = MachineId::new(fields.next("machine")?)?;
        let kind = fields.next("kind")?;
        if kind == "INIT" {
            let tick_rate = fields.number("tick_rate")?;
            fields.finish()?;
            return Ok(LogLine::Init {
                machine,
                wall_time,
                tick_rate,
            });
        }

        let logical_clock = fields.number("clock")?;
        let kind = match kind {
            "INTERNAL" => EventKind::Internal,
            "SEND" => EventKind::Send {
                targets: fields.addresses("to")?,
                failed: fields.addresses("failed")?,
            },
            "RECEIVE" => EventKind::Receive {
                queue_length: fields.number("queue_length")?,
                from: MachineId::new(fields.labeled("from")?)?,
            },
            other => return Err(LogParseError::UnknownKind(other.to_owned())),
        };
        fields.finish()?;
        Ok(LogLine::Event(EventRecord {
            machine,
            wall_time,
            logical_clock,
            kind,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINES: &[&str] = &[
        "2026-03-01T10:00:00.000000Z machine1 INIT tick_rate=4",
        "2026-03-01T10:00:00.250000Z machine1 INTERNAL clock=1",
        "2026-03-01T10:00:00.500000Z machine1 SEND clock=2 \
         to=localhost:50052,localhost:50053 failed=localhost:50053",
        "2026-03-01T10:00:00.750000Z machine1 SEND clock=3 to=localhost:50052 failed=-",
        "2026-03-01T10:00:01.000000Z machine1 RECEIVE clock=7 queue_length=2 from=machine2",
    ];

    #[test]
    fn lines_round_trip() {
        for line in LINES {
            let parsed: LogLine = line.parse().unwrap();
            assert_eq!(&parsed.to_string(), line);
        }
    }

    #[test]
    fn parses_fields() {
        let LogLine::Event(record) = LINES[2].parse().unwrap() else {
            panic!("expected an event");
        };
        assert_eq!(record.machine.as_str(), "machine1");
        assert_eq!(record.logical_clock, 2);
        assert_eq!(
            record.kind,
            EventKind::Send {
                targets: vec![
                    PeerAddress::new("localhost", 50052),
                    PeerAddress::new("localhost", 50053)
                ],
                failed: vec![PeerAddress::new("localhost", 50053)],
            }
        );

        let init: LogLine = LINES[0].parse().unwrap();
        assert!(matches!(init, LogLine::Init { tick_rate: 4, .. }));
    }

    #[test]
    fn rejects_malformed_lines() {
        let ts = "2026-03-01T10:00:00.000000Z";
        assert_eq!(
            "".parse::<LogLine>(),
            Err(LogParseError::Missing("timestamp"))
        );
        assert!(matches!(
            "yesterday m INTERNAL clock=1".parse::<LogLine>(),
            Err(LogParseError::Timestamp(_))
        ));
        assert_eq!(
            format!("{ts} m JUMP clock=1").parse::<LogLine>(),
            Err(LogParseError::UnknownKind("JUMP".into()))
        );
        assert!(matches!(
            format!("{ts} m INTERNAL value=1").parse::<LogLine>(),
            Err(LogParseError::Label { expected: "clock", .. })
        ));
        assert_eq!(
            format!("{ts} m INTERNAL clock=-1").parse::<LogLine>(),
            Err(LogParseError::Number("-1".into()))
        );
        assert_eq!(
            format!("{ts} m RECEIVE clock=3 queue_length=0").parse::<LogLine>(),
            Err(LogParseError::Missing("from"))
        );
        assert_eq!(
            format!("{ts} m INTERNAL clock=3 extra").parse::<LogLine>(),
            Err(LogParseError::Trailing("extra".into()))
        );
    }
}
