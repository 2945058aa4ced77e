//! Host port allocation

use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::Mutex;

use tracing::debug;

use crate::errors::EngineError;

struct PortTable {
    in_use: HashSet<u16>,

    /// Next port to try, so released ports are not immediately reused
    cursor: u16,
}

/// Serialized allocator over a host port range
pub struct PortAllocator {
    start: u16,
    end: u16,

    /// Skip ports a foreign process already listens on
    probe_host: bool,

    table: Mutex<PortTable>,
}

impl PortAllocator {
    /// Range is inclusive on both ends
    pub fn new(start: u16, end: u16, probe_host: bool) -> Self {
        Self {
            start,
            end,
            probe_host,
            table: Mutex::new(PortTable {
                in_use: HashSet::new(),
                cursor: start,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PortTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn host_port_free(port: u16) -> bool {
        TcpListener::bind(("127.0.0.1", port)).is_ok()
    }

    /// Allocate `count` distinct ports in one critical section
    pub fn allocate(&self, count: usize) -> Result<Vec<u16>, EngineError> {
        let mut table = self.lock();
        let span = (self.end - self.start) as usize + 1;
        let mut ports = Vec::with_capacity(count);
        let mut port = table.cursor;

        for _ in 0..span {
            if ports.len() == count {
                break;
            }
            let candidate = port;
            port = if port >= self.end { self.start } else { port + 1 };

            if table.in_use.contains(&candidate) {
                continue;
            }
            if self.probe_host && !Self::host_port_free(candidate) {
                continue;
            }
            ports.push(candidate);
        }

        if ports.len() < count {
            return Err(EngineError::Infrastructure(format!(
                "no free host ports left in {}-{}",
                self.start, self.end
            )));
        }

        table.cursor = port;
        table.in_use.extend(ports.iter().copied());
        debug!("Allocated host ports {:?}", ports);
        Ok(ports)
    }

    /// Mark a port as taken (used when recovering live replicas)
    pub fn reserve(&self, port: u16) {
        self.lock().in_use.insert(port);
    }

    pub fn release(&self, port: u16) {
        if self.lock().in_use.remove(&port) {
            debug!("Released host port {}", port);
        }
    }

    pub fn in_use(&self) -> usize {
        self.lock().in_use.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_distinct_ports() {
        let allocator = PortAllocator::new(20000, 20009, false);
        let first = allocator.allocate(3).unwrap();
        let second = allocator.allocate(3).unwrap();

        let mut all: Vec<u16> = first.iter().chain(second.iter()).copied().collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 6);
        assert_eq!(allocator.in_use(), 6);
    }

    #[test]
    fn test_exhaustion_allocates_nothing() {
        let allocator = PortAllocator::new(20000, 20002, false);
        allocator.allocate(2).unwrap();
        assert!(allocator.allocate(2).is_err());
        assert_eq!(allocator.in_use(), 2);
    }

    #[test]
    fn test_reserve_and_release() {
        let allocator = PortAllocator::new(20000, 20001, false);
        allocator.reserve(20000);
        assert_eq!(allocator.allocate(1).unwrap(), vec![20001]);
        assert!(allocator.allocate(1).is_err());

        allocator.release(20000);
        assert_eq!(allocator.allocate(1).unwrap(), vec![20000]);
    }

    #[test]
    fn test_probe_skips_bound_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = listener.local_addr().unwrap().port();
        if taken > u16::MAX - 64 {
            return;
        }
        let allocator = PortAllocator::new(taken, taken + 64, true);
        let ports = allocator.allocate(1).unwrap();
        assert_ne!(ports[0], taken);
    }
}
