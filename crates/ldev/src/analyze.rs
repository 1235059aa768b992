use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::Context;
use lamport_sim::tracing::{EventKind, LogLine, LogParseError};
use prettytable::{Cell, Row, Table};
use serde::Serialize;

use crate::config::AnalyzeConfig;

/// Clock readings further than this from a sampled instant are not compared.
const DRIFT_WINDOW_MICROS: i64 = 100_000;
/// Upper bound on the instants sampled per machine pair.
const DRIFT_SAMPLES: usize = 100;

#[derive(Debug, thiserror::Error)]
#[error("{}:{line}: {source}", path.display())]
pub struct LogFileError {
    path: PathBuf,
    line: usize,
    #[source]
    source: LogParseError,
}

/// Differences between consecutive clock values of one machine.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JumpStats {
    pub count: usize,
    pub avg: f64,
    pub min: i64,
    pub max: i64,
    /// Sample standard deviation, 0 with fewer than two jumps.
    pub std: f64,
}

impl JumpStats {
    fn new(jumps: &[i64]) -> Self {
        let (Some(min), Some(max)) = (jumps.iter().min(), jumps.iter().max()) else {
            return Self::default();
        };
        let count = jumps.len();
        let avg = jumps.iter().sum::<i64>() as f64 / count as f64;
        let std = if count > 1 {
            let variance = jumps
                .iter()
                .map(|jump| (*jump as f64 - avg).powi(2))
                .sum::<f64>()
                / (count - 1) as f64;
            variance.sqrt()
        } else {
            0.0
        };
        Self {
            count,
            avg,
            min: *min,
            max: *max,
            std,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MachineStats {
    pub machine: String,
    /// Missing when the log has no INIT line.
    pub tick_rate: Option<u32>,
    pub final_clock: u64,
    pub internal: u64,
    pub send: u64,
    pub receive: u64,
    pub failed_deliveries: u64,
    pub jumps: JumpStats,
    pub avg_queue_length: f64,
    pub max_queue_length: Option<usize>,
    /// Number of receive events seen per queue length.
    pub queue_length_distribution: BTreeMap<usize, u64>,
    /// Messages received per sending machine.
    pub received_from: BTreeMap<String, u64>,
    /// Wall seconds between the first and the last event.
    pub elapsed_secs: f64,
    /// Logical ticks per wall second, `None` below two events or without elapsed time.
    pub clock_rate: Option<f64>,
    pub non_positive_jumps: usize,
    /// `(wall time in microseconds, logical clock)` of every event, in wall time order.
    #[serde(skip)]
    pub clocks: Vec<(i64, u64)>,
}

impl MachineStats {
    /// Statistics of one machine's log. `None` for an empty log.
    pub fn from_lines(lines: &[LogLine]) -> Option<Self> {
        let machine = lines.first()?.machine().to_string();
        let tick_rate = lines.iter().find_map(|line| match line {
            LogLine::Init { tick_rate, .. } => Some(*tick_rate),
            LogLine::Event(_) => None,
        });

        let mut events: Vec<_> = lines.iter().filter_map(LogLine::as_event).collect();
        events.sort_by_key(|record| record.wall_time);

        let mut stats = Self {
            machine,
            tick_rate,
            final_clock: events.last().map(|record| record.logical_clock).unwrap_or(0),
            internal: 0,
            send: 0,
            receive: 0,
            failed_deliveries: 0,
            jumps: JumpStats::default(),
            avg_queue_length: 0.0,
            max_queue_length: None,
            queue_length_distribution: BTreeMap::new(),
            received_from: BTreeMap::new(),
            elapsed_secs: 0.0,
            clock_rate: None,
            non_positive_jumps: 0,
            clocks: events
                .iter()
                .map(|record| (record.wall_time.timestamp_micros(), record.logical_clock))
                .collect(),
        };
        let mut queue_lengths = Vec::new();
        for record in &events {
            match &record.kind {
                EventKind::Internal => stats.internal += 1,
                EventKind::Send { failed, .. } => {
                    stats.send += 1;
                    stats.failed_deliveries += failed.len() as u64;
                }
                EventKind::Receive { queue_length, from } => {
                    stats.receive += 1;
                    queue_lengths.push(*queue_length);
                    *stats
                        .queue_length_distribution
                        .entry(*queue_length)
                        .or_default() += 1;
                    *stats.received_from.entry(from.to_string()).or_default() += 1;
                }
            }
        }
        if !queue_lengths.is_empty() {
            stats.avg_queue_length =
                queue_lengths.iter().sum::<usize>() as f64 / queue_lengths.len() as f64;
        }
        stats.max_queue_length = queue_lengths.iter().max().copied();

        if let (Some((start, first)), Some((end, last))) =
            (stats.clocks.first(), stats.clocks.last())
        {
            stats.elapsed_secs = (end - start) as f64 / 1e6;
            if stats.elapsed_secs > 0.0 {
                stats.clock_rate = Some((*last as f64 - *first as f64) / stats.elapsed_secs);
            }
        }

        let jumps: Vec<i64> = events
            .windows(2)
            .map(|pair| pair[1].logical_clock as i64 - pair[0].logical_clock as i64)
            .collect();
        stats.non_positive_jumps = jumps.iter().filter(|jump| **jump <= 0).count();
        stats.jumps = JumpStats::new(&jumps);
        Some(stats)
    }
}

/// Messages one machine received from another.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Communication {
    pub from: String,
    pub to: String,
    pub messages: u64,
    /// Fraction of everything `from` got delivered that went to `to`.
    pub share: f64,
}

/// Clock difference of two machines at sampled wall clock instants.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairDrift {
    pub first: String,
    pub second: String,
    pub avg: f64,
    pub min: u64,
    pub max: u64,
    pub samples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunAnalysis {
    pub dir: PathBuf,
    pub machines: Vec<MachineStats>,
    /// Highest minus lowest final clock, `None` when no log was found.
    pub drift: Option<u64>,
    pub communication: Vec<Communication>,
    pub pairwise_drift: Vec<PairDrift>,
}

fn communication(machines: &[MachineStats]) -> Vec<Communication> {
    let mut pairs = BTreeMap::<(&str, &str), u64>::new();
    for stats in machines {
        for (from, messages) in &stats.received_from {
            *pairs.entry((from.as_str(), stats.machine.as_str())).or_default() += messages;
        }
    }
    let mut sent = BTreeMap::<&str, u64>::new();
    for ((from, _), messages) in &pairs {
        *sent.entry(*from).or_default() += messages;
    }
    pairs
        .into_iter()
        .map(|((from, to), messages)| Communication {
            from: from.to_owned(),
            to: to.to_owned(),
            messages,
            share: messages as f64 / sent[from] as f64,
        })
        .collect()
}

/// Clock of the reading closest to `at`, ignoring readings outside the drift window.
fn clock_near(clocks: &[(i64, u64)], at: i64) -> Option<u64> {
    clocks
        .iter()
        .map(|(time, clock)| ((time - at).abs(), *clock))
        .filter(|(distance, _)| *distance < DRIFT_WINDOW_MICROS)
        .min_by_key(|(distance, _)| *distance)
        .map(|(_, clock)| clock)
}

fn pairwise_drift(machines: &[MachineStats]) -> Vec<PairDrift> {
    let mut instants: Vec<i64> = machines
        .iter()
        .flat_map(|stats| stats.clocks.iter().map(|(time, _)| *time))
        .collect();
    instants.sort_unstable();
    instants.dedup();
    let step = (instants.len() / DRIFT_SAMPLES.min(instants.len()).max(1)).max(1);

    let mut sorted: Vec<_> = machines.iter().collect();
    sorted.sort_by(|a, b| a.machine.cmp(&b.machine));
    let mut pairs = Vec::new();
    for (idx, first) in sorted.iter().enumerate() {
        for second in &sorted[idx + 1..] {
            let drifts: Vec<u64> = instants
                .iter()
                .step_by(step)
                .filter_map(|at| {
                    let a = clock_near(&first.clocks, *at)?;
                    let b = clock_near(&second.clocks, *at)?;
                    Some(a.abs_diff(b))
                })
                .collect();
            let (Some(min), Some(max)) = (drifts.iter().min(), drifts.iter().max()) else {
                continue;
            };
            pairs.push(PairDrift {
                first: first.machine.clone(),
                second: second.machine.clone(),
                avg: drifts.iter().sum::<u64>() as f64 / drifts.len() as f64,
                min: *min,
                max: *max,
                samples: drifts.len(),
            });
        }
    }
    pairs
}

fn parse_log(path: &Path, contents: &str) -> Result<Vec<LogLine>, LogFileError> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            line.parse().map_err(|source| LogFileError {
                path: path.to_owned(),
                line: idx + 1,
                source,
            })
        })
        .collect()
}

pub fn analyze_dir(dir: &Path) -> anyhow::Result<RunAnalysis> {
    if !dir.is_dir() {
        anyhow::bail!("run directory {} does not exist", dir.display());
    }
    let pattern = format!(
        "{}/*_log.txt",
        glob::Pattern::escape(&dir.display().to_string())
    );
    let mut paths = glob::glob(&pattern)?.collect::<Result<Vec<_>, _>>()?;
    paths.sort();

    let mut machines = Vec::with_capacity(paths.len());
    for path in paths {
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed reading {}", path.display()))?;
        let lines = parse_log(&path, &contents)?;
        let Some(stats) = MachineStats::from_lines(&lines) else {
            tracing::warn!(path = %path.display(), "Empty log file");
            continue;
        };
        if stats.tick_rate.is_none() {
            tracing::warn!(machine = %stats.machine, "No INIT line, tick rate unknown");
        }
        if stats.non_positive_jumps > 0 {
            tracing::warn!(
                machine = %stats.machine,
                count = stats.non_positive_jumps,
                "Logical clock did not advance between consecutive events"
            );
        }
        machines.push(stats);
    }

    let clocks = machines.iter().map(|stats| stats.final_clock);
    let drift = clocks
        .clone()
        .max()
        .zip(clocks.min())
        .map(|(max, min)| max - min);
    Ok(RunAnalysis {
        dir: dir.to_owned(),
        communication: communication(&machines),
        pairwise_drift: pairwise_drift(&machines),
        machines,
        drift,
    })
}

pub fn analyze(config: AnalyzeConfig) -> anyhow::Result<()> {
    let analyses = config
        .dirs
        .iter()
        .map(|dir| analyze_dir(dir))
        .collect::<anyhow::Result<Vec<_>>>()?;
    if config.json {
        println!("{}", serde_json::to_string_pretty(&analyses)?);
    } else {
        for analysis in &analyses {
            print_analysis(analysis);
        }
    }
    Ok(())
}

fn format_optional<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_owned(), |value| value.to_string())
}

fn stats_table(analysis: &RunAnalysis) -> Table {
    let mut table = Table::new();
    table.add_row(Row::new(vec![
        Cell::new("Machine"),
        Cell::new("Tick rate"),
        Cell::new("Final clock"),
        Cell::new("Internal"),
        Cell::new("Send"),
        Cell::new("Receive"),
        Cell::new("Failed deliveries"),
        Cell::new("Jump avg"),
        Cell::new("Jump min"),
        Cell::new("Jump max"),
        Cell::new("Jump std"),
        Cell::new("Avg queue length"),
        Cell::new("Max queue"),
        Cell::new("Queue lengths"),
        Cell::new("Clock rate"),
    ]));
    for stats in &analysis.machines {
        table.add_row(Row::new(vec![
            Cell::new(&stats.machine),
            Cell::new(&format_optional(stats.tick_rate)),
            Cell::new(&stats.final_clock.to_string()),
            Cell::new(&stats.internal.to_string()),
            Cell::new(&stats.send.to_string()),
            Cell::new(&stats.receive.to_string()),
            Cell::new(&stats.failed_deliveries.to_string()),
            Cell::new(&format!("{:.2}", stats.jumps.avg)),
            Cell::new(&stats.jumps.min.to_string()),
            Cell::new(&stats.jumps.max.to_string()),
            Cell::new(&format!("{:.2}", stats.jumps.std)),
            Cell::new(&format!("{:.2}", stats.avg_queue_length)),
            Cell::new(&format_optional(stats.max_queue_length)),
            Cell::new(&queue_distribution(&stats.queue_length_distribution)),
            Cell::new(&format_optional(stats.clock_rate.map(|rate| format!("{rate:.2}/s")))),
        ]));
    }
    table
}

/// `length:count` pairs, e.g. `0:12 1:3`.
fn queue_distribution(distribution: &BTreeMap<usize, u64>) -> String {
    if distribution.is_empty() {
        return "-".to_owned();
    }
    distribution
        .iter()
        .map(|(length, count)| format!("{length}:{count}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn communication_table(analysis: &RunAnalysis) -> Table {
    let mut table = Table::new();
    table.add_row(Row::new(vec![
        Cell::new("From"),
        Cell::new("To"),
        Cell::new("Messages"),
        Cell::new("Share"),
    ]));
    for pair in &analysis.communication {
        table.add_row(Row::new(vec![
            Cell::new(&pair.from),
            Cell::new(&pair.to),
            Cell::new(&pair.messages.to_string()),
            Cell::new(&format!("{:.2}%", pair.share * 100.0)),
        ]));
    }
    table
}

fn drift_table(analysis: &RunAnalysis) -> Table {
    let mut table = Table::new();
    table.add_row(Row::new(vec![
        Cell::new("Machines"),
        Cell::new("Avg drift"),
        Cell::new("Min drift"),
        Cell::new("Max drift"),
        Cell::new("Samples"),
    ]));
    for pair in &analysis.pairwise_drift {
        table.add_row(Row::new(vec![
            Cell::new(&format!("{} / {}", pair.first, pair.second)),
            Cell::new(&format!("{:.2}", pair.avg)),
            Cell::new(&pair.min.to_string()),
            Cell::new(&pair.max.to_string()),
            Cell::new(&pair.samples.to_string()),
        ]));
    }
    table
}

fn print_analysis(analysis: &RunAnalysis) {
    println!("\nStatistics for run: {}", analysis.dir.display());
    if analysis.machines.is_empty() {
        println!("  No data available.");
        return;
    }
    stats_table(analysis).printstd();
    println!(
        "Drift between machines (final clock difference): {}",
        format_optional(analysis.drift)
    );
    if !analysis.communication.is_empty() {
        println!("\nMessages received per sender:");
        communication_table(analysis).printstd();
    }
    if !analysis.pairwise_drift.is_empty() {
        println!("\nClock drift over time (readings within 100ms of each sample):");
        drift_table(analysis).printstd();
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use lamport_sim::{message::MachineId, tracing::EventRecord};
    use testresult::TestResult;

    use super::*;

    const MACHINE1_LOG: &str = "\
2025-03-01T10:00:00.000000Z machine1 INIT tick_rate=3
2025-03-01T10:00:00.333000Z machine1 INTERNAL clock=1
2025-03-01T10:00:00.666000Z machine1 SEND clock=2 to=localhost:50052,\
localhost:50053 failed=localhost:50053
2025-03-01T10:00:01.000000Z machine1 RECEIVE clock=8 queue_length=2 from=machine2
2025-03-01T10:00:01.333000Z machine1 RECEIVE clock=9 queue_length=0 from=machine3
";

    const MACHINE2_LOG: &str = "\
2025-03-01T10:00:00.000000Z machine2 INIT tick_rate=6
2025-03-01T10:00:00.166000Z machine2 INTERNAL clock=1
2025-03-01T10:00:00.333000Z machine2 SEND clock=2 to=localhost:50051 failed=-
";

    fn parse(contents: &str) -> Vec<LogLine> {
        parse_log(Path::new("test_log.txt"), contents).unwrap()
    }

    #[test]
    fn machine_stats_from_log_text() {
        let stats = MachineStats::from_lines(&parse(MACHINE1_LOG)).unwrap();
        assert_eq!(stats.machine, "machine1");
        assert_eq!(stats.tick_rate, Some(3));
        assert_eq!(stats.final_clock, 9);
        assert_eq!((stats.internal, stats.send, stats.receive), (1, 1, 2));
        assert_eq!(stats.failed_deliveries, 1);
        assert_eq!(stats.avg_queue_length, 1.0);
        // jumps: 1, 6, 1
        assert_eq!(stats.jumps.count, 3);
        assert_eq!(stats.jumps.min, 1);
        assert_eq!(stats.jumps.max, 6);
        assert!((stats.jumps.avg - 8.0 / 3.0).abs() < 1e-9);
        assert!((stats.jumps.std - (25.0f64 / 3.0).sqrt()).abs() < 1e-9);
        assert_eq!(stats.non_positive_jumps, 0);
        assert_eq!(stats.received_from["machine2"], 1);
        assert_eq!(stats.received_from["machine3"], 1);
    }

    #[test]
    fn clock_readings_near_an_instant() {
        let clocks = [(0, 1), (150_000, 2), (190_000, 3)];
        assert_eq!(clock_near(&clocks, 50_000), Some(1));
        assert_eq!(clock_near(&clocks, 180_000), Some(3));
        // the window is exclusive
        assert_eq!(clock_near(&clocks, 290_000), None);
        assert_eq!(clock_near(&[], 0), None);
    }

    #[test]
    fn single_event_has_no_clock_rate() {
        let log = "2025-03-01T10:00:00.100000Z m INTERNAL clock=5\n";
        let stats = MachineStats::from_lines(&parse(log)).unwrap();
        assert_eq!(stats.elapsed_secs, 0.0);
        assert_eq!(stats.clock_rate, None);
    }

    #[test]
    fn jump_stats() {
        assert_eq!(JumpStats::new(&[]), JumpStats::default());
        let single = JumpStats::new(&[4]);
        assert_eq!((single.min, single.max, single.std), (4, 4, 0.0));
        let stats = JumpStats::new(&[1, 3]);
        assert_eq!(stats.avg, 2.0);
        assert!((stats.std - 2f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn events_are_ordered_by_wall_time() {
        let at = |ms| Utc.timestamp_millis_opt(ms).unwrap();
        let event = |ms, clock| {
            LogLine::Event(EventRecord {
                machine: MachineId::new("m").unwrap(),
                wall_time: at(ms),
                logical_clock: clock,
                kind: EventKind::Internal,
            })
        };
        let stats = MachineStats::from_lines(&[event(20, 2), event(10, 1), event(30, 3)]).unwrap();
        assert_eq!(stats.final_clock, 3);
        assert_eq!(stats.jumps.min, 1);
        assert_eq!(stats.tick_rate, None);
    }

    #[test]
    fn non_positive_jumps_are_counted() {
        let log = "\
2025-03-01T10:00:00.100000Z m INTERNAL clock=5
2025-03-01T10:00:00.200000Z m INTERNAL clock=5
2025-03-01T10:00:00.300000Z m INTERNAL clock=4
";
        let stats = MachineStats::from_lines(&parse(log)).unwrap();
        assert_eq!(stats.non_positive_jumps, 2);
        assert_eq!(stats.jumps.min, -1);
    }

    #[test]
    fn parse_errors_point_at_the_line() {
        let log = "2025-03-01T10:00:00.100000Z m INTERNAL clock=5\n\nnot a log line\n";
        let err = parse_log(Path::new("m_log.txt"), log).unwrap_err();
        assert_eq!(err.line, 3);
        assert!(err.to_string().starts_with("m_log.txt:3:"));
    }

    #[test]
    fn analyze_run_directory() -> TestResult {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("machine1_log.txt"), MACHINE1_LOG)?;
        std::fs::write(dir.path().join("machine2_log.txt"), MACHINE2_LOG)?;
        std::fs::write(dir.path().join("notes.txt"), "ignored")?;

        let analysis = analyze_dir(dir.path())?;
        let names: Vec<_> = analysis.machines.iter().map(|m| m.machine.as_str()).collect();
        assert_eq!(names, ["machine1", "machine2"]);
        assert_eq!(analysis.drift, Some(7));

        let (first, second) = (&analysis.machines[0], &analysis.machines[1]);
        assert_eq!(first.elapsed_secs, 1.0);
        assert_eq!(first.clock_rate, Some(8.0));
        assert!((second.clock_rate.unwrap() - 1.0 / 0.167).abs() < 1e-6);
        assert_eq!(first.max_queue_length, Some(2));
        assert_eq!(
            first.queue_length_distribution,
            BTreeMap::from([(0, 1), (2, 1)])
        );
        assert_eq!(second.max_queue_length, None);

        let pairs: Vec<_> = analysis
            .communication
            .iter()
            .map(|c| (c.from.as_str(), c.to.as_str(), c.messages, c.share))
            .collect();
        assert_eq!(
            pairs,
            [("machine2", "machine1", 1, 1.0), ("machine3", "machine1", 1, 1.0)]
        );

        // only 10:00:00.333 has readings of both machines within 100ms
        assert_eq!(
            analysis.pairwise_drift,
            [PairDrift {
                first: "machine1".into(),
                second: "machine2".into(),
                avg: 1.0,
                min: 1,
                max: 1,
                samples: 1,
            }]
        );

        let table = stats_table(&analysis).to_string();
        assert!(table.contains("machine2"));
        assert!(table.contains("0:1 2:1"));
        assert!(table.contains("8.00/s"));
        assert!(communication_table(&analysis).to_string().contains("machine3"));
        assert!(drift_table(&analysis).to_string().contains("machine1 / machine2"));

        let json = serde_json::to_value(&analysis)?;
        assert_eq!(json["machines"][1]["tick_rate"], 6);
        assert_eq!(json["machines"][0]["max_queue_length"], 2);
        assert_eq!(json["machines"][0]["clock_rate"], 8.0);
        assert_eq!(json["communication"][0]["from"], "machine2");
        assert_eq!(json["pairwise_drift"][0]["samples"], 1);
        assert!(json["machines"][0].get("clocks").is_none());
        Ok(())
    }

    #[test]
    fn empty_and_missing_directories() -> TestResult {
        let dir = tempfile::tempdir()?;
        let analysis = analyze_dir(dir.path())?;
        assert!(analysis.machines.is_empty());
        assert_eq!(analysis.drift, None);
        assert!(analysis.communication.is_empty());
        assert!(analysis.pairwise_drift.is_empty());

        assert!(analyze_dir(&dir.path().join("missing")).is_err());
        Ok(())
    }
}
