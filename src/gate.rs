//! Startup concurrency gate.
//!
//! VM bring-up is CPU and memory heavy while the guest boots; running a
//! command over ssh is not. Only `vagrant up` goes through this gate, so a
//! queue of booting VMs never blocks commands against VMs that are already
//! running.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

use crate::error::{ConfigError, SandboxError};

/// Environment variable overriding the gate capacity.
pub const MAX_STARTUPS_ENV: &str = "INSPECT_MAX_VAGRANT_STARTUPS";

/// Counting semaphore bounding concurrent bring-ups.
///
/// Waiters are served in FIFO order.
#[derive(Debug)]
pub struct StartupGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

/// Lifetime counters for a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateStats {
    pub acquired: usize,
    pub released: usize,
}

impl StartupGate {
    /// Creates a gate with room for `capacity` concurrent bring-ups.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidStartupLimit` if `capacity` is zero.
    pub fn new(capacity: usize) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::InvalidStartupLimit {
                value: capacity.to_string(),
            });
        }
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        })
    }

    /// Creates a gate sized from `INSPECT_MAX_VAGRANT_STARTUPS`, or the host
    /// logical-core count.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidStartupLimit` if the variable is set but
    /// is not a positive integer.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::new(default_startup_limit()?)
    }

    /// Waits for a free slot.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::GateClosed` if the gate was closed.
    pub async fn acquire(self: &Arc<Self>) -> Result<ConcurrencyTicket, SandboxError> {
        trace!(available = self.available(), "waiting for startup slot");
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| SandboxError::GateClosed)?;

        self.acquired.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        debug!(in_flight = now, capacity = self.capacity, "startup slot acquired");

        Ok(ConcurrencyTicket {
            permit: Some(permit),
            gate: Arc::clone(self),
        })
    }

    /// Closes the gate; pending and future `acquire` calls fail.
    pub fn close(&self) {
        self.semaphore.close();
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Tickets currently held.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of tickets ever held at once.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn stats(&self) -> GateStats {
        GateStats {
            acquired: self.acquired.load(Ordering::SeqCst),
            released: self.released.load(Ordering::SeqCst),
        }
    }

    fn on_release(&self) {
        let left = self.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        self.released.fetch_add(1, Ordering::SeqCst);
        debug!(in_flight = left, "startup slot released");
    }
}

/// A lease on one gate slot.
///
/// Released by [`ConcurrencyTicket::release`], or on drop if it never was.
/// `release` consumes the ticket, so a second release does not compile.
#[derive(Debug)]
#[must_use = "dropping a ticket releases its slot immediately"]
pub struct ConcurrencyTicket {
    permit: Option<OwnedSemaphorePermit>,
    gate: Arc<StartupGate>,
}

impl ConcurrencyTicket {
    /// Returns the slot to the gate.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.gate.on_release();
            drop(permit);
        }
    }
}

impl Drop for ConcurrencyTicket {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Resolves the startup limit: `INSPECT_MAX_VAGRANT_STARTUPS` if set,
/// otherwise the host logical-core count.
///
/// # Errors
///
/// Returns `ConfigError::InvalidStartupLimit` for a non-positive or
/// non-numeric override.
pub fn default_startup_limit() -> Result<usize, ConfigError> {
    match std::env::var(MAX_STARTUPS_ENV) {
        Ok(value) => parse_startup_limit(&value),
        Err(_) => Ok(std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1)),
    }
}

/// Parses a startup limit override.
///
/// # Errors
///
/// Returns `ConfigError::InvalidStartupLimit` unless `value` is a positive integer.
pub fn parse_startup_limit(value: &str) -> Result<usize, ConfigError> {
    value
        .trim()
        .parse::<NonZeroUsize>()
        .map(NonZeroUsize::get)
        .map_err(|_| ConfigError::InvalidStartupLimit {
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(
            StartupGate::new(0),
            Err(ConfigError::InvalidStartupLimit { .. })
        ));
    }

    #[test]
    fn test_parse_startup_limit() {
        assert_eq!(parse_startup_limit("4").expect("valid"), 4);
        assert_eq!(parse_startup_limit(" 2 ").expect("valid"), 2);
        assert!(parse_startup_limit("0").is_err());
        assert!(parse_startup_limit("-1").is_err());
        assert!(parse_startup_limit("many").is_err());
    }

    #[tokio::test]
    async fn test_release_returns_slot() {
        let gate = Arc::new(StartupGate::new(2).expect("gate"));

        let a = gate.acquire().await.expect("acquire");
        let b = gate.acquire().await.expect("acquire");
        assert_eq!(gate.available(), 0);
        assert_eq!(gate.in_flight(), 2);

        a.release();
        assert_eq!(gate.available(), 1);
        drop(b);
        assert_eq!(gate.available(), 2);

        assert_eq!(gate.stats(), GateStats { acquired: 2, released: 2 });
        assert_eq!(gate.peak_in_flight(), 2);
    }

    #[tokio::test]
    async fn test_acquire_blocks_at_capacity() {
        let gate = Arc::new(StartupGate::new(1).expect("gate"));
        let held = gate.acquire().await.expect("acquire");

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.acquire().await.map(ConcurrencyTicket::release) })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        held.release();
        waiter.await.expect("join").expect("acquire after release");
        assert_eq!(gate.stats(), GateStats { acquired: 2, released: 2 });
    }

    #[tokio::test]
    async fn test_closed_gate() {
        let gate = Arc::new(StartupGate::new(1).expect("gate"));
        gate.close();
        assert!(matches!(gate.acquire().await, Err(SandboxError::GateClosed)));
    }
}
