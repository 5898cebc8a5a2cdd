//! Logical clock shared by a data store and its scope store.

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing logical clock.
///
/// Every write in a store takes a fresh value from [`LogicalClock::tick`].
/// Reading the clock with [`LogicalClock::current`] never advances it, so a
/// store that saw no writes reports the same value twice.
#[derive(Debug, Default)]
pub struct LogicalClock {
    last: AtomicU64,
}

impl LogicalClock {
    /// Creates a clock that has not assigned any value yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a clock resuming after `last`.
    pub fn starting_at(last: u64) -> Self {
        Self {
            last: AtomicU64::new(last),
        }
    }

    /// Assigns the next value.
    pub fn tick(&self) -> u64 {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns the last assigned value (0 if none).
    pub fn current(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }

    /// Moves the clock forward to at least `value`.
    pub fn observe(&self, value: u64) {
        self.last.fetch_max(value, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_is_strictly_increasing() {
        let clock = LogicalClock::new();
        assert_eq!(clock.current(), 0);
        let a = clock.tick();
        let b = clock.tick();
        assert!(b > a);
        assert_eq!(clock.current(), b);
        assert_eq!(clock.current(), b);
    }

    #[test]
    fn observe_never_moves_backwards() {
        let clock = LogicalClock::starting_at(10);
        clock.observe(5);
        assert_eq!(clock.current(), 10);
        clock.observe(20);
        assert_eq!(clock.tick(), 21);
    }
}
