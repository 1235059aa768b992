/// Lamport logical clock of a single machine.
pub mod clock;

/// Machine configuration: command line, config file and validation.
pub mod config;

/// Clock messages and their wire representation.
pub mod message;

/// Machine tick loop, inbound queue, event policy and lifecycle.
pub mod node;
pub use node::{Machine, MachineError, MachineNode, RunSummary, ShutdownHandle, StartupError};

/// Seeded randomness and in-process clusters of machines.
pub mod simulation;

/// Tracing and logging infrastructure. Includes the event log line format and its registers.
pub mod tracing;

/// Delivery of clock messages between machines, over TCP or in memory.
pub mod transport;
