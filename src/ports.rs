//! Management-port allocator.
//!
//! Every task gets a private port for its control API. Ports are handed out lowest-first
//! from a fixed base and stay reserved until the owning worker retires.

use std::collections::BTreeSet;
use std::sync::Mutex;

use tracing::{debug, warn};

/// Hands out unique local ports at or above `base`.
#[derive(Debug)]
pub struct PortAllocator {
    base: u16,
    in_use: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    pub fn new(base: u16) -> Self {
        Self {
            base,
            in_use: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    /// Reserve the lowest free port, or `None` once the range up to `u16::MAX` is exhausted.
    pub fn acquire(&self) -> Option<u16> {
        let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());

        let mut candidate = self.base;
        for &taken in in_use.range(self.base..) {
            if taken != candidate {
                break;
            }
            candidate = match candidate.checked_add(1) {
                Some(next) => next,
                None => {
                    warn!(base = self.base, "Management port range exhausted");
                    return None;
                }
            };
        }

        in_use.insert(candidate);
        debug!(port = candidate, "Management port acquired");
        Some(candidate)
    }

    /// Return `port` to the free set. Returns `false` if it was not reserved.
    pub fn release(&self, port: u16) -> bool {
        let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
        let released = in_use.remove(&port);
        if released {
            debug!(port, "Management port released");
        }
        released
    }

    pub fn in_use(&self) -> usize {
        self.in_use.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hands_out_lowest_free_port() {
        let ports = PortAllocator::new(32000);
        assert_eq!(ports.acquire(), Some(32000));
        assert_eq!(ports.acquire(), Some(32001));
        assert_eq!(ports.acquire(), Some(32002));

        assert!(ports.release(32001));
        assert_eq!(ports.acquire(), Some(32001));
        assert_eq!(ports.acquire(), Some(32003));
    }

    #[test]
    fn double_release_is_a_no_op() {
        let ports = PortAllocator::new(40000);
        let port = ports.acquire().unwrap();
        assert!(ports.release(port));
        assert!(!ports.release(port));
        assert_eq!(ports.in_use(), 0);
    }

    #[test]
    fn exhausted_range_returns_none() {
        let ports = PortAllocator::new(u16::MAX - 1);
        assert_eq!(ports.acquire(), Some(u16::MAX - 1));
        assert_eq!(ports.acquire(), Some(u16::MAX));
        assert_eq!(ports.acquire(), None);
    }
}
