//! Reproducible runs of several machines inside one process.
//!
//! - [`rng`]: injectable, seedable randomness for every machine decision.
//! - [`cluster`]: N machines wired over the in-memory transport, each with its own
//!   child RNG derived from a master seed.

pub mod cluster;
pub mod rng;

pub use cluster::{ClusterConfig, ClusterError, ClusterReport, SimCluster};
pub use rng::{EventRng, ScriptedRng, SimulationRng};
