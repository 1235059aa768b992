//! End-to-end runs of several machines, in memory and over TCP.

use std::{net::TcpListener, time::Duration};

use lamport_sim::{
    config::{ConfigError, MachineConfig, TickRateRange},
    message::MachineId,
    simulation::{ClusterConfig, SimCluster},
    tracing::{EventKind, LogLine, MemoryRegister},
    transport::{tcp::TcpTransport, PeerAddress},
    MachineNode, StartupError,
};
use testresult::TestResult;

fn assert_well_formed(lines: &[LogLine]) {
    let LogLine::Init { machine, .. } = &lines[0] else {
        panic!("first line must be INIT, got {}", lines[0]);
    };
    let mut previous = 0;
    for line in &lines[1..] {
        let record = line.as_event().expect("only one INIT line per run");
        assert_eq!(&record.machine, machine);
        assert!(
            record.logical_clock > previous,
            "{machine}: clock went from {previous} to {}",
            record.logical_clock
        );
        if let EventKind::Receive { from, .. } = &record.kind {
            assert_ne!(from, machine, "machines never message themselves");
        }
        previous = record.logical_clock;
    }
}

#[tokio::test]
#[test_log::test]
async fn in_memory_cluster_exchanges_messages() -> TestResult {
    let config = ClusterConfig {
        machines: 3,
        tick_range: TickRateRange::new(20, 30)?,
        duration: Some(Duration::from_millis(800)),
        seed: 42,
        ..Default::default()
    };
    let cluster = SimCluster::start(config).await?;
    assert_eq!(cluster.network().bound(), 3);
    let network = cluster.network().clone();
    let report = cluster.run().await?;
    assert_eq!(network.bound(), 0);

    assert_eq!(report.summaries.len(), 3);
    for lines in &report.logs {
        assert_well_formed(lines);
    }
    let receives: u64 = report.summaries.iter().map(|s| s.counts.receive).sum();
    assert!(receives > 0, "no message was ever received");
    // deliveries may fail while the cluster shuts down, machines stop at different ticks
    for summary in &report.summaries {
        assert!((20..=30).contains(&summary.tick_rate));
    }
    let max = report.summaries.iter().map(|s| s.final_clock).max().unwrap_or_default();
    let min = report.summaries.iter().map(|s| s.final_clock).min().unwrap_or_default();
    assert_eq!(report.drift(), max - min);

    let dir = tempfile::tempdir()?;
    let written = report.write_logs(dir.path())?;
    assert_eq!(written.len(), 3);
    let contents = std::fs::read_to_string(dir.path().join("machine2_log.txt"))?;
    let parsed = contents
        .lines()
        .map(str::parse::<LogLine>)
        .collect::<Result<Vec<_>, _>>()?;
    assert_eq!(parsed.len(), report.logs[1].len());
    Ok(())
}

#[tokio::test]
#[test_log::test]
async fn cluster_stops_on_shutdown() -> TestResult {
    let config = ClusterConfig {
        machines: 2,
        tick_range: TickRateRange::new(10, 10)?,
        duration: None,
        seed: 7,
        ..Default::default()
    };
    let cluster = SimCluster::start(config).await?;
    let handle = cluster.shutdown_handle();
    let run = tokio::spawn(cluster.run());
    tokio::time::sleep(Duration::from_millis(250)).await;
    handle.shutdown();

    let report = tokio::time::timeout(Duration::from_secs(2), run).await???;
    for summary in &report.summaries {
        assert!(summary.counts.total() > 0);
    }
    Ok(())
}

#[tokio::test]
#[test_log::test]
async fn cluster_rejects_ports_past_the_range() -> TestResult {
    let config = ClusterConfig {
        machines: 3,
        base_port: 65534,
        ..Default::default()
    };
    let err = SimCluster::start(config)
        .await
        .err()
        .ok_or("ports 65534..=65536 do not fit")?;
    assert!(matches!(
        err,
        StartupError::Config(ConfigError::PortOutOfRange {
            base_port: 65534,
            index: 2
        })
    ));
    Ok(())
}

fn free_ports() -> TestResult<[u16; 2]> {
    let first = TcpListener::bind("127.0.0.1:0")?;
    let second = TcpListener::bind("127.0.0.1:0")?;
    Ok([first.local_addr()?.port(), second.local_addr()?.port()])
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[test_log::test]
async fn machines_talk_over_tcp() -> TestResult {
    let ports = free_ports()?;
    let addr = |port: u16| PeerAddress::new("127.0.0.1", port);

    let mut nodes = Vec::new();
    let mut registers = Vec::new();
    for (i, port) in ports.iter().enumerate() {
        let other = ports[1 - i];
        let mut config = MachineConfig::new(
            MachineId::new(format!("machine{}", i + 1))?,
            addr(*port),
            vec![addr(other)],
        );
        config.tick_range = TickRateRange::new(20, 20)?;
        // every roll communicates
        config.internal_prob = 0.0;
        config.duration = Some(Duration::from_millis(600));
        config.seed = Some(i as u64);
        let register = MemoryRegister::new();
        let transport = TcpTransport::new(Duration::from_millis(500));
        let node = MachineNode::build(config, transport, register.clone()).await?;
        nodes.push(node);
        registers.push(register);
    }

    let runs: Vec<_> = nodes.into_iter().map(|node| tokio::spawn(node.run())).collect();
    let mut summaries = Vec::new();
    for run in runs {
        summaries.push(run.await??);
    }

    for (summary, register) in summaries.iter().zip(&registers) {
        assert_well_formed(&register.lines());
        assert!(summary.counts.send > 0);
    }
    let receives: u64 = summaries.iter().map(|s| s.counts.receive).sum();
    assert!(receives > 0, "no message crossed the TCP transport");
    Ok(())
}
