//! Lamport logical clock owned by a single machine.
//!
//! The clock is only ever mutated from the machine's own tick loop; the network
//! listener never touches it (it deposits messages into the inbound queue instead),
//! so no synchronization is needed here.

use std::fmt::Display;

/// A computed clock value failed to advance past the previous one.
///
/// This is an internal consistency violation, not a transient condition: the
/// owning machine must stop instead of continuing with a corrupted clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("logical clock regression: {} does not advance past {previous}", Attempt(.attempted))]
pub struct ClockRegression {
    pub previous: u64,
    /// `None` when the increment overflowed the counter.
    pub attempted: Option<u64>,
}

struct Attempt<'a>(&'a Option<u64>);

impl Display for Attempt<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(value) => write!(f, "{value}"),
            None => f.write_str("overflow"),
        }
    }
}

/// One machine's Lamport counter.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LogicalClock {
    counter: u64,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the clock at an arbitrary value.
    pub fn starting_at(value: u64) -> Self {
        Self { counter: value }
    }

    #[inline]
    pub fn value(&self) -> u64 {
        self.counter
    }

    /// Advances the clock for an internal or send event: `counter + 1`.
    pub fn tick_internal(&mut self) -> Result<u64, ClockRegression> {
        self.commit(self.counter.checked_add(1))
    }

    /// Lamport receive rule: `max(counter, received) + 1`.
    pub fn advance_on_receive(&mut self, received: u64) -> Result<u64, ClockRegression> {
        self.commit(self.counter.max(received).checked_add(1))
    }

    fn commit(&mut self, next: Option<u64>) -> Result<u64, ClockRegression> {
        match next {
            Some(value) if value > self.counter => {
                self.counter = value;
                Ok(value)
            }
            attempted => Err(ClockRegression {
                previous: self.counter,
                attempted,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receive_takes_max_plus_one() {
        let mut clock = LogicalClock::starting_at(2);
        assert_eq!(clock.advance_on_receive(6), Ok(7));
        assert_eq!(clock.value(), 7);

        let mut clock = LogicalClock::starting_at(10);
        assert_eq!(clock.advance_on_receive(3), Ok(11));

        let mut clock = LogicalClock::starting_at(4);
        assert_eq!(clock.advance_on_receive(4), Ok(5));
    }

    #[test]
    fn internal_tick_is_exactly_one() {
        let mut clock = LogicalClock::starting_at(10);
        assert_eq!(clock.tick_internal(), Ok(11));
        assert_eq!(clock.tick_internal(), Ok(12));

        let mut clock = LogicalClock::new();
        let mut previous = clock.value();
        for _ in 0..100 {
            let next = clock.tick_internal().unwrap();
            assert_eq!(next, previous + 1);
            previous = next;
        }
    }

    #[test]
    fn overflow_is_a_regression() {
        let mut clock = LogicalClock::starting_at(5);
        let err = clock.advance_on_receive(u64::MAX).unwrap_err();
        assert_eq!(
            err,
            ClockRegression {
                previous: 5,
                attempted: None
            }
        );
        assert_eq!(clock.value(), 5, "a failed advance must leave the clock untouched");

        let mut clock = LogicalClock::starting_at(u64::MAX);
        assert!(clock.tick_internal().is_err());
        assert_eq!(clock.value(), u64::MAX);
    }
}
