//! Port broker for reverse-forward listeners.
//!
//! Allocates loopback ports for device forwards out of a configured
//! inclusive range. Allocation is lowest-free-first so operators see
//! deterministic assignments.

use std::collections::BTreeSet;
use std::sync::Mutex;

use edgetainer_core::{TunnelError, TunnelResult};

/// Thread-safe allocator over an inclusive port range.
///
/// The mutex guards only the in-use set; it is never held across I/O.
pub struct PortBroker {
    start: u16,
    end: u16,
    in_use: Mutex<BTreeSet<u16>>,
}

impl PortBroker {
    /// Create a broker over `[start, end]`.
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            in_use: Mutex::new(BTreeSet::new()),
        }
    }

    /// Allocate the lowest free port in the range.
    pub fn allocate(&self) -> TunnelResult<u16> {
        let mut in_use = self.in_use.lock().unwrap();
        for port in self.start..=self.end {
            if !in_use.contains(&port) {
                in_use.insert(port);
                return Ok(port);
            }
        }
        Err(TunnelError::Resource(format!(
            "no available ports in range {}-{}",
            self.start, self.end
        )))
    }

    /// Claim a specific port. Returns `false` if it is outside the range
    /// or already in use.
    pub fn claim(&self, port: u16) -> bool {
        if port < self.start || port > self.end {
            return false;
        }
        self.in_use.lock().unwrap().insert(port)
    }

    /// Return a port to the pool. Releasing a free port is a no-op.
    pub fn release(&self, port: u16) {
        if port >= self.start && port <= self.end {
            self.in_use.lock().unwrap().remove(&port);
        }
    }

    /// Number of ports currently allocated.
    pub fn in_use_count(&self) -> usize {
        self.in_use.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_allocates_lowest_free_first() {
        let broker = PortBroker::new(10000, 10002);
        assert_eq!(broker.allocate().unwrap(), 10000);
        assert_eq!(broker.allocate().unwrap(), 10001);
        broker.release(10000);
        assert_eq!(broker.allocate().unwrap(), 10000);
    }

    #[test]
    fn test_exhaustion_is_distinct_error() {
        let broker = PortBroker::new(10000, 10001);
        broker.allocate().unwrap();
        broker.allocate().unwrap();
        match broker.allocate() {
            Err(TunnelError::Resource(msg)) => assert!(msg.contains("10000-10001")),
            other => panic!("expected resource error, got {other:?}"),
        }
    }

    #[test]
    fn test_allocate_release_roundtrip() {
        let broker = PortBroker::new(10000, 10010);
        let port = broker.allocate().unwrap();
        assert_eq!(broker.in_use_count(), 1);
        broker.release(port);
        assert_eq!(broker.in_use_count(), 0);
        // Releasing again is harmless.
        broker.release(port);
        assert_eq!(broker.in_use_count(), 0);
    }

    #[test]
    fn test_claim_specific_port() {
        let broker = PortBroker::new(10000, 10002);
        assert!(broker.claim(10001));
        assert!(!broker.claim(10001));
        assert!(!broker.claim(9999));
        assert_eq!(broker.allocate().unwrap(), 10000);
        assert_eq!(broker.allocate().unwrap(), 10002);
    }

    #[test]
    fn test_concurrent_allocation_never_duplicates() {
        let broker = Arc::new(PortBroker::new(20000, 20063));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let broker = Arc::clone(&broker);
            handles.push(std::thread::spawn(move || {
                let mut got = Vec::new();
                for _ in 0..8 {
                    got.push(broker.allocate().unwrap());
                }
                got
            }));
        }
        let mut all: Vec<u16> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 64);
    }
}
