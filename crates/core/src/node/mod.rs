//! The machine: a Lamport clock driven by a fixed-rate tick loop.
//!
//! A [`Machine`] owns its clock and processes exactly one event per tick:
//!
//! - if the [`InboundQueue`] holds a message, the tick is a receive event and the
//!   clock becomes `max(local, received) + 1`;
//! - otherwise a roll in `1..=10` is classified by the [`EventPolicy`] into a send
//!   event (the clock is incremented once and the new value is delivered to the
//!   selected peers) or an internal event (`+1`).
//!
//! [`MachineNode`] wires a machine to a [`Transport`]: it binds the listener that
//! feeds the inbound queue, connects to the peers and drives the
//! `Initializing → Running → ShuttingDown → Stopped` lifecycle.

use std::{path::PathBuf, sync::Arc, time::Duration};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::{sync::watch, time::Instant};

use crate::{
    clock::{ClockRegression, LogicalClock},
    config::{ConfigError, MachineConfig, TickRateRange},
    message::{ClockMessage, MachineId},
    simulation::{EventRng, SimulationRng},
    tracing::{
        CombinedRegister, EventKind, EventRecord, EventRegister, LogFileRegister, LogLine,
        TracingRegister,
    },
    transport::{
        ListenerHandle, NetworkEndpoint, NetworkError, PeerAddress, PeerClient, Transport,
    },
};

pub mod inbound_queue;
pub mod policy;

pub use inbound_queue::InboundQueue;
pub use policy::{Decision, EventPolicy, FanOut};

/// Stops one or more machines. Cloning is cheap; every clone controls the same signal.
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Requests a graceful stop. The tick loop exits at its next tick boundary.
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineState {
    Initializing,
    Running,
    ShuttingDown,
    Stopped,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCounts {
    pub internal: u64,
    pub send: u64,
    pub receive: u64,
    /// Individual deliveries that failed, across all send events.
    pub failed_deliveries: u64,
}

impl EventCounts {
    pub fn total(&self) -> u64 {
        self.internal + self.send + self.receive
    }

    fn count(&mut self, kind: &EventKind) {
        match kind {
            EventKind::Internal => self.internal += 1,
            EventKind::Send { failed, .. } => {
                self.send += 1;
                self.failed_deliveries += failed.len() as u64;
            }
            EventKind::Receive { .. } => self.receive += 1,
        }
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: MachineId,
    pub tick_rate: u32,
    pub final_clock: u64,
    pub counts: EventCounts,
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed binding {addr}: {source}")]
    Bind {
        addr: PeerAddress,
        #[source]
        source: std::io::Error,
    },
    #[error("failed creating event log in {}: {source}", .dir.display())]
    EventLog {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum MachineError {
    #[error(transparent)]
    Startup(#[from] StartupError),
    #[error(transparent)]
    ClockRegression(#[from] ClockRegression),
}

/// One machine's tick loop state.
pub struct Machine<C, R = SimulationRng> {
    id: MachineId,
    clock: LogicalClock,
    queue: InboundQueue,
    peers: Vec<C>,
    rng: R,
    policy: EventPolicy,
    tick_rate: u32,
    state: MachineState,
    register: Box<dyn EventRegister>,
    counts: EventCounts,
}

impl<C, R> Machine<C, R>
where
    C: PeerClient,
    R: EventRng,
{
    /// Creates a machine in the `Initializing` state. The tick rate is the first draw
    /// from `rng`.
    pub fn new(
        id: MachineId,
        queue: InboundQueue,
        peers: Vec<C>,
        policy: EventPolicy,
        tick_range: TickRateRange,
        mut rng: R,
        register: Box<dyn EventRegister>,
    ) -> Self {
        let tick_rate = tick_range.draw(&mut rng);
        Self {
            id,
            clock: LogicalClock::new(),
            queue,
            peers,
            rng,
            policy,
            tick_rate,
            state: MachineState::Initializing,
            register,
            counts: EventCounts::default(),
        }
    }

    pub fn with_clock(mut self, clock: LogicalClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn id(&self) -> &MachineId {
        &self.id
    }

    pub fn clock(&self) -> u64 {
        self.clock.value()
    }

    pub fn queue(&self) -> &InboundQueue {
        &self.queue
    }

    pub fn tick_rate(&self) -> u32 {
        self.tick_rate
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_rate.max(1)))
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    pub fn counts(&self) -> EventCounts {
        self.counts
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            id: self.id.clone(),
            tick_rate: self.tick_rate,
            final_clock: self.clock.value(),
            counts: self.counts,
        }
    }

    /// Processes exactly one event and registers its log line.
    pub async fn tick(&mut self) -> Result<EventRecord, ClockRegression> {
        let kind = match self.queue.try_dequeue() {
            Some(msg) => self.receive(msg)?,
            None => {
                let roll = self.rng.draw(policy::ROLL_RANGE);
                match self.policy.classify(roll, self.peers.len()) {
                    Decision::Internal => {
                        self.clock.tick_internal()?;
                        EventKind::Internal
                    }
                    Decision::Broadcast => self.send((0..self.peers.len()).collect()).await?,
                    Decision::SendOne(Some(target)) => self.send(vec![target]).await?,
                    Decision::SendOne(None) => {
                        let last = u32::try_from(self.peers.len() - 1).unwrap_or(u32::MAX);
                        let target = self.rng.draw(0..=last) as usize;
                        self.send(vec![target]).await?
                    }
                }
            }
        };
        let record = EventRecord {
            machine: self.id.clone(),
            wall_time: Utc::now(),
            logical_clock: self.clock.value(),
            kind,
        };
        self.counts.count(&record.kind);
        self.register
            .register(&LogLine::Event(record.clone()))
            .await;
        Ok(record)
    }

    fn receive(&mut self, msg: ClockMessage) -> Result<EventKind, ClockRegression> {
        self.clock.advance_on_receive(msg.logical_clock)?;
        Ok(EventKind::Receive {
            queue_length: self.queue.len(),
            from: msg.sender_id,
        })
    }

    async fn send(&mut self, targets: Vec<usize>) -> Result<EventKind, ClockRegression> {
        let clock = self.clock.tick_internal()?;
        let msg = ClockMessage::new(self.id.clone(), clock, Utc::now());
        let deliveries = targets.iter().filter_map(|idx| self.peers.get(*idx)).map(|peer| {
            let msg = msg.clone();
            async move {
                let result = match peer.deliver(msg).await {
                    Ok(ack) if ack.received => Ok(()),
                    Ok(_) => Err(NetworkError::Rejected {
                        peer: peer.address().clone(),
                    }),
                    Err(err) => Err(err),
                };
                (peer.address().clone(), result)
            }
        });
        let results = futures::future::join_all(deliveries).await;

        let mut targets = Vec::with_capacity(results.len());
        let mut failed = Vec::new();
        for (peer, result) in results {
            if let Err(err) = result {
                tracing::warn!(
                    machine = %self.id,
                    %peer,
                    error = %err,
                    "Failed delivering clock message"
                );
                failed.push(peer.clone());
            }
            targets.push(peer);
        }
        Ok(EventKind::Send { targets, failed })
    }

    /// Runs ticks until `stop` fires or `duration` elapses.
    ///
    /// Each tick starts one period after the previous one started; a slow tick is not
    /// compensated by shorter sleeps afterwards.
    pub async fn run(
        &mut self,
        mut stop: watch::Receiver<bool>,
        duration: Option<Duration>,
    ) -> Result<(), ClockRegression> {
        self.state = MachineState::Running;
        let init = LogLine::Init {
            machine: self.id.clone(),
            wall_time: Utc::now(),
            tick_rate: self.tick_rate,
        };
        self.register.register(&init).await;
        tracing::info!(
            machine = %self.id,
            tick_rate = self.tick_rate,
            peers = self.peers.len(),
            "Machine running"
        );

        let period = self.tick_period();
        let deadline = duration.map(|duration| Instant::now() + duration);
        loop {
            if *stop.borrow() {
                tracing::debug!(machine = %self.id, "Stop requested");
                break;
            }
            let tick_start = Instant::now();
            if deadline.is_some_and(|deadline| tick_start >= deadline) {
                tracing::debug!(machine = %self.id, "Run duration elapsed");
                break;
            }
            if let Err(err) = self.tick().await {
                tracing::error!(
                    machine = %self.id,
                    error = %err,
                    "Clock invariant violated, stopping machine"
                );
                self.state = MachineState::ShuttingDown;
                return Err(err);
            }
            let next_tick = tick_start + period;
            tokio::select! {
                _ = tokio::time::sleep_until(next_tick) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        // every shutdown handle is gone, nobody can stop us early anymore
                        tokio::time::sleep_until(next_tick).await;
                    }
                }
            }
        }
        self.state = MachineState::ShuttingDown;
        Ok(())
    }
}

/// A machine bound to a transport.
pub struct MachineNode<T: Transport, R = SimulationRng> {
    machine: Machine<T::Client, R>,
    listener: ListenerHandle,
    shutdown: ShutdownHandle,
    duration: Option<Duration>,
}

impl<T: Transport> MachineNode<T> {
    /// Initializes a machine from `config`, seeding its RNG from `config.seed` (or
    /// from entropy when unset).
    pub async fn build(
        config: MachineConfig,
        transport: T,
        register: impl EventRegister,
    ) -> Result<Self, StartupError> {
        let rng = config
            .seed
            .map(SimulationRng::new)
            .unwrap_or_else(SimulationRng::from_entropy);
        tracing::debug!(machine = %config.id, seed = rng.seed(), "Seeded machine RNG");
        Self::build_with_rng(config, transport, register, rng).await
    }

    /// Like [`MachineNode::build`] with console logging, plus the
    /// `<log_dir>/<id>_log.txt` event log when `config.log_dir` is set.
    ///
    /// The log file is only created (and truncated) once the listener is bound.
    pub async fn build_with_event_log(
        config: MachineConfig,
        transport: T,
    ) -> Result<Self, StartupError> {
        let log_dir = config.log_dir.clone();
        let node = Self::build(config, transport, TracingRegister).await?;
        let Some(dir) = log_dir else {
            return Ok(node);
        };
        let log_file = LogFileRegister::create(&dir, node.machine.id())
            .await
            .map_err(|source| StartupError::EventLog {
                dir: dir.clone(),
                source,
            })?;
        tracing::info!(path = ?log_file.path(), "Writing event log");
        Ok(node.with_register(CombinedRegister::new([
            Box::new(log_file) as Box<dyn EventRegister>,
            Box::new(TracingRegister),
        ])))
    }
}

impl<T, R> MachineNode<T, R>
where
    T: Transport,
    R: EventRng,
{
    pub async fn build_with_rng(
        config: MachineConfig,
        transport: T,
        register: impl EventRegister,
        rng: R,
    ) -> Result<Self, StartupError> {
        config.validate()?;
        let queue = InboundQueue::new();
        let endpoint = NetworkEndpoint::new(config.id.clone(), queue.clone());
        let listener = transport
            .bind(config.listen.clone(), endpoint)
            .await
            .map_err(|source| StartupError::Bind {
                addr: config.listen.clone(),
                source,
            })?;
        let peers = config
            .peers
            .iter()
            .cloned()
            .map(|peer| transport.connect(peer))
            .collect();
        let policy = EventPolicy::new(config.internal_prob, config.fan_out);
        let machine = Machine::new(
            config.id,
            queue,
            peers,
            policy,
            config.tick_range,
            rng,
            Box::new(register),
        );
        tracing::info!(
            machine = %machine.id(),
            addr = %listener.local_addr(),
            tick_rate = machine.tick_rate(),
            band = policy.band(),
            fan_out = %policy.fan_out(),
            "Machine initialized"
        );
        Ok(Self {
            machine,
            listener,
            shutdown: ShutdownHandle::new(),
            duration: config.duration,
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Replaces this node's stop signal, so several nodes can share one.
    pub fn with_shutdown_handle(mut self, shutdown: ShutdownHandle) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Replaces the register every log line goes to.
    pub fn with_register(mut self, register: impl EventRegister) -> Self {
        self.machine.register = Box::new(register);
        self
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> &PeerAddress {
        self.listener.local_addr()
    }

    pub fn machine(&self) -> &Machine<T::Client, R> {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut Machine<T::Client, R> {
        &mut self.machine
    }

    /// Runs until the configured duration elapses, the shutdown handle fires or the
    /// clock invariant breaks. The listener is stopped and the event log flushed in
    /// every case.
    pub async fn run(mut self) -> Result<RunSummary, MachineError> {
        let stop = self.shutdown.subscribe();
        let result = self.machine.run(stop, self.duration).await;

        self.machine.state = MachineState::ShuttingDown;
        self.listener.shutdown().await;
        self.machine.register.flush().await;
        self.machine.state = MachineState::Stopped;

        let summary = self.machine.summary();
        match result {
            Ok(()) => {
                tracing::info!(
                    machine = %summary.id,
                    final_clock = summary.final_clock,
                    events = summary.counts.total(),
                    failed_deliveries = summary.counts.failed_deliveries,
                    "Machine stopped"
                );
                Ok(summary)
            }
            Err(err) => Err(err.into()),
        }
    }
}
