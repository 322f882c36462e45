// src/watchdog.rs
// Fail-safe supervisor that fatal engine faults are escalated to

use crate::error::{Result, VentError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::error;

/// Supervisor outside the alarm engine.
///
/// The engine feeds it once per evaluated cycle and trips it on a fatal
/// fault. A tripped watchdog stays tripped; recovery is a reset of the
/// supervised system, never a retry inside the engine.
pub trait Watchdog: Send {
    /// Signal liveness for `cycle`
    fn feed(&mut self, cycle: u64) -> Result<()>;

    /// Force the fail-safe state
    fn trip(&mut self, reason: &str);

    fn is_tripped(&self) -> bool;
}

/// Software watchdog; clones observe the same state
#[derive(Debug, Clone, Default)]
pub struct SoftwareWatchdog {
    tripped: Arc<AtomicBool>,
    last_fed: Arc<AtomicU64>,
    reason: Arc<Mutex<Option<String>>>,
}

impl SoftwareWatchdog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_fed_cycle(&self) -> u64 {
        self.last_fed.load(Ordering::Acquire)
    }

    pub fn trip_reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    /// True once more than `max_gap` cycles have passed without a feed
    pub fn is_starved(&self, current_cycle: u64, max_gap: u64) -> bool {
        current_cycle.saturating_sub(self.last_fed_cycle()) > max_gap
    }
}

impl Watchdog for SoftwareWatchdog {
    fn feed(&mut self, cycle: u64) -> Result<()> {
        if self.is_tripped() {
            return Err(VentError::NotArmed("watchdog tripped".into()));
        }
        self.last_fed.store(cycle, Ordering::Release);
        Ok(())
    }

    fn trip(&mut self, reason: &str) {
        error!("Watchdog tripped: {}", reason);
        *self.reason.lock() = Some(reason.to_string());
        self.tripped.store(true, Ordering::Release);
    }

    fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trip_is_shared_and_permanent() {
        let mut dog = SoftwareWatchdog::new();
        let observer = dog.clone();
        dog.feed(3).unwrap();
        assert_eq!(observer.last_fed_cycle(), 3);

        dog.trip("deadline");
        assert!(observer.is_tripped());
        assert_eq!(observer.trip_reason().as_deref(), Some("deadline"));
        assert!(dog.feed(4).is_err());
    }

    #[test]
    fn test_starvation() {
        let mut dog = SoftwareWatchdog::new();
        dog.feed(10).unwrap();
        assert!(!dog.is_starved(11, 2));
        assert!(dog.is_starved(13, 2));
    }
}
