//! Seeded random number generation for machines.
//!
//! Every random decision a machine makes (tick rate, event roll, random fan-out
//! target) goes through an [`EventRng`], so a run can be replayed from a seed or
//! driven by a scripted sequence in tests.

use std::ops::RangeInclusive;

use rand::{rngs::SmallRng, Rng, SeedableRng};

/// Source of the uniform draws a machine makes.
pub trait EventRng: Send + 'static {
    /// Draws uniformly from `range` (inclusive on both ends).
    fn draw(&mut self, range: RangeInclusive<u32>) -> u32;
}

/// Seeded RNG owned by a single machine.
///
/// # Determinism
///
/// Two `SimulationRng`s created from the same seed produce the same sequence.
/// Per-machine generators of a cluster are derived from one master seed with
/// [`SimulationRng::child_with_index`], so the mapping does not depend on the
/// order in which machines start.
pub struct SimulationRng {
    inner: SmallRng,
    seed: u64,
}

impl SimulationRng {
    pub fn new(seed: u64) -> Self {
        Self {
            inner: SmallRng::seed_from_u64(seed),
            seed,
        }
    }

    /// Seeds from the OS entropy source. The chosen seed is still reported by
    /// [`SimulationRng::seed`] so the run can be reproduced.
    pub fn from_entropy() -> Self {
        Self::new(rand::rngs::OsRng.gen())
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Creates a child RNG whose seed is derived from this RNG's seed and `index`.
    pub fn child_with_index(&self, index: u64) -> Self {
        let derived_seed = self
            .seed
            .wrapping_mul(0x517cc1b727220a95)
            .wrapping_add(index);
        Self::new(derived_seed)
    }
}

impl EventRng for SimulationRng {
    fn draw(&mut self, range: RangeInclusive<u32>) -> u32 {
        self.inner.gen_range(range)
    }
}

impl std::fmt::Debug for SimulationRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationRng")
            .field("seed", &self.seed)
            .finish()
    }
}

/// Replays a fixed sequence of draws, cycling when exhausted.
///
/// Values are clamped into the requested range so a script written for one
/// range cannot produce an out-of-range draw.
#[derive(Debug, Clone)]
pub struct ScriptedRng {
    values: Vec<u32>,
    next: usize,
}

impl ScriptedRng {
    pub fn new(values: impl Into<Vec<u32>>) -> Self {
        Self {
            values: values.into(),
            next: 0,
        }
    }
}

impl EventRng for ScriptedRng {
    fn draw(&mut self, range: RangeInclusive<u32>) -> u32 {
        let Some(value) = self.values.get(self.next % self.values.len().max(1)) else {
            return *range.start();
        };
        self.next += 1;
        (*value).clamp(*range.start(), *range.end())
    }
}
