//! Connection ceiling enforcement
//!
//! The acceptor asks the monitor for a [`ConnectionPermit`] before spawning a
//! connection task; the permit gives the slot back when the task drops it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceStats {
    pub current_connections: usize,
    pub max_connections: usize,
    pub total_accepted: u64,
    pub total_rejected: u64,
}

#[derive(Debug)]
pub struct ResourceMonitor {
    max_connections: usize,
    connection_count: AtomicUsize,
    total_accepted: AtomicU64,
    total_rejected: AtomicU64,
}

impl ResourceMonitor {
    #[must_use]
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            connection_count: AtomicUsize::new(0),
            total_accepted: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
        }
    }

    /// Reserves a connection slot, or returns `None` when the ceiling is
    /// reached.
    #[must_use]
    pub fn try_acquire(self: &Arc<Self>, peer: SocketAddr) -> Option<ConnectionPermit> {
        let reserved = self
            .connection_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.max_connections).then_some(current + 1)
            });

        match reserved {
            Ok(previous) => {
                self.total_accepted.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Connection from {peer} accepted ({}/{})",
                    previous + 1,
                    self.max_connections
                );
                Some(ConnectionPermit {
                    monitor: Arc::clone(self),
                })
            }
            Err(current) => {
                self.total_rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Connection rejected from {peer}: limit reached ({current}/{})",
                    self.max_connections
                );
                None
            }
        }
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn stats(&self) -> ResourceStats {
        ResourceStats {
            current_connections: self.connection_count(),
            max_connections: self.max_connections,
            total_accepted: self.total_accepted.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
        }
    }

    fn release(&self) {
        self.connection_count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// One occupied connection slot.
#[derive(Debug)]
pub struct ConnectionPermit {
    monitor: Arc<ResourceMonitor>,
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.monitor.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "192.168.1.1:40000".parse().unwrap()
    }

    #[test]
    fn test_connection_limits() {
        let monitor = Arc::new(ResourceMonitor::new(2));

        let first = monitor.try_acquire(peer()).unwrap();
        let _second = monitor.try_acquire(peer()).unwrap();
        assert!(monitor.try_acquire(peer()).is_none());
        assert_eq!(monitor.connection_count(), 2);

        drop(first);
        assert_eq!(monitor.connection_count(), 1);
        assert!(monitor.try_acquire(peer()).is_some());

        let stats = monitor.stats();
        assert_eq!(stats.total_accepted, 3);
        assert_eq!(stats.total_rejected, 1);
        assert_eq!(stats.max_connections, 2);
    }

    #[tokio::test]
    async fn test_permit_released_when_task_ends() {
        let monitor = Arc::new(ResourceMonitor::new(1));
        let permit = monitor.try_acquire(peer()).unwrap();

        tokio::spawn(async move {
            let _permit = permit;
        })
        .await
        .unwrap();

        assert_eq!(monitor.connection_count(), 0);
    }
}
