//! Public port allocation.
//!
//! Hands out TCP ports from a fixed range to registering clients and
//! reclaims them when a session closes. Allocation is deterministic
//! (smallest free port first) rather than random, to keep logs and tests
//! reproducible — unlike a general-purpose ephemeral-port pool, this range
//! is small and human-facing (an operator reads the assigned port off a
//! `registered` message), so determinism beats the anti-guessing value a
//! random pick would otherwise buy.

use std::collections::BTreeSet;
use std::ops::RangeInclusive;

/// The configured `[min, max]` public port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub fn new(min: u16, max: u16) -> Self {
        assert!(min <= max, "port range min must be <= max");
        Self { min, max }
    }

    pub fn size(&self) -> usize {
        (self.max - self.min) as usize + 1
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.min && port <= self.max
    }

    pub fn as_range_inclusive(&self) -> RangeInclusive<u16> {
        self.min..=self.max
    }
}

impl std::str::FromStr for PortRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (min, max) = s
            .split_once('-')
            .ok_or_else(|| format!("invalid port range {s:?}, expected MIN-MAX"))?;
        let min: u16 = min.trim().parse().map_err(|e| format!("invalid port range min: {e}"))?;
        let max: u16 = max.trim().parse().map_err(|e| format!("invalid port range max: {e}"))?;
        if min > max {
            return Err(format!("port range min ({min}) must be <= max ({max})"));
        }
        Ok(PortRange { min, max })
    }
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

/// Error returned when the free set is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no public port available in range")]
pub struct NoPortAvailable;

/// Ordered set of free ports plus the set currently in use.
///
/// Single shared resource: all operations are expected to be called behind
/// one lock (see `SessionManager`), so contention is the only synchronization
/// concern — trivial at human-scale client counts per `spec.md` §4.2.
pub struct PortAllocator {
    range: PortRange,
    free: BTreeSet<u16>,
    in_use: std::collections::HashSet<u16>,
}

impl PortAllocator {
    pub fn new(range: PortRange) -> Self {
        let free = range.as_range_inclusive().collect();
        Self {
            range,
            free,
            in_use: std::collections::HashSet::new(),
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Allocate the smallest free port, or `NoPortAvailable` if the range
    /// is exhausted.
    pub fn allocate(&mut self) -> Result<u16, NoPortAvailable> {
        let port = self.free.iter().next().copied().ok_or(NoPortAvailable)?;
        self.free.remove(&port);
        self.in_use.insert(port);
        Ok(port)
    }

    /// Return a port to the free set. Idempotent on already-free ports.
    pub fn release(&mut self, port: u16) {
        if self.in_use.remove(&port) {
            self.free.insert(port);
        }
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_smallest_free_port_first() {
        let mut pool = PortAllocator::new(PortRange::new(5000, 5002));
        assert_eq!(pool.allocate().unwrap(), 5000);
        assert_eq!(pool.allocate().unwrap(), 5001);
        assert_eq!(pool.allocate().unwrap(), 5002);
        assert!(pool.allocate().is_err());
    }

    #[test]
    fn release_returns_port_to_free_set_and_reuses_it() {
        let mut pool = PortAllocator::new(PortRange::new(5000, 5000));
        let port = pool.allocate().unwrap();
        assert_eq!(pool.in_use_count(), 1);
        pool.release(port);
        assert_eq!(pool.in_use_count(), 0);
        assert_eq!(pool.allocate().unwrap(), port);
    }

    #[test]
    fn release_is_idempotent_on_already_free_port() {
        let mut pool = PortAllocator::new(PortRange::new(5000, 5001));
        pool.release(5000);
        pool.release(5000);
        assert_eq!(pool.in_use_count(), 0);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn exhaustion_then_release_recovers() {
        let mut pool = PortAllocator::new(PortRange::new(7000, 7000));
        let p = pool.allocate().unwrap();
        assert!(pool.allocate().is_err());
        pool.release(p);
        assert!(pool.allocate().is_ok());
    }

    #[test]
    fn port_range_parses_from_str() {
        let range: PortRange = "5000-5010".parse().unwrap();
        assert_eq!(range, PortRange::new(5000, 5010));
        assert!("5010-5000".parse::<PortRange>().is_err());
        assert!("bogus".parse::<PortRange>().is_err());
    }
}
