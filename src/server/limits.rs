//! WebSocket connection limits.
//!
//! `ConnectionTracker` enforces a global cap on concurrent sessions and a
//! per-IP cap. A successful `try_acquire` returns a `ConnectionGuard`
//! whose `Drop` impl decrements the counters, so a session that ends for
//! any reason releases its slot.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Default maximum total concurrent sessions.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;

/// Default maximum concurrent sessions from a single IP.
pub const DEFAULT_MAX_PER_IP: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LimitExceeded {
    #[error("total connection limit reached")]
    TotalLimit,
    #[error("per-IP connection limit reached")]
    PerIpLimit,
}

struct TrackerInner {
    total: AtomicUsize,
    per_ip: Mutex<HashMap<IpAddr, usize>>,
    max_connections: usize,
    max_per_ip: usize,
}

#[derive(Clone)]
pub struct ConnectionTracker {
    inner: Arc<TrackerInner>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_PER_IP)
    }

    pub fn with_limits(max_connections: usize, max_per_ip: usize) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                total: AtomicUsize::new(0),
                per_ip: Mutex::new(HashMap::new()),
                max_connections,
                max_per_ip,
            }),
        }
    }

    /// Try to claim a slot for `ip`. Loopback addresses are exempt from
    /// the per-IP cap but still count against the total.
    pub fn try_acquire(&self, ip: IpAddr) -> Result<ConnectionGuard, LimitExceeded> {
        let inner = &self.inner;

        // Optimistically claim a total slot; roll back on overshoot.
        let prev = inner.total.fetch_add(1, Ordering::SeqCst);
        if prev >= inner.max_connections {
            inner.total.fetch_sub(1, Ordering::SeqCst);
            return Err(LimitExceeded::TotalLimit);
        }

        let is_loopback = ip.is_loopback();
        if !is_loopback {
            let mut map = inner.per_ip.lock();
            let count = map.entry(ip).or_insert(0);
            if *count >= inner.max_per_ip {
                inner.total.fetch_sub(1, Ordering::SeqCst);
                return Err(LimitExceeded::PerIpLimit);
            }
            *count += 1;
        }

        Ok(ConnectionGuard {
            tracker: Arc::clone(&self.inner),
            ip,
            is_loopback,
        })
    }

    pub fn total(&self) -> usize {
        self.inner.total.load(Ordering::SeqCst)
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConnectionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTracker")
            .field("total", &self.total())
            .field("max_connections", &self.inner.max_connections)
            .field("max_per_ip", &self.inner.max_per_ip)
            .finish()
    }
}

/// RAII guard that releases the claimed slot when dropped.
pub struct ConnectionGuard {
    tracker: Arc<TrackerInner>,
    ip: IpAddr,
    is_loopback: bool,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.total.fetch_sub(1, Ordering::SeqCst);
        if !self.is_loopback {
            let mut map = self.tracker.per_ip.lock();
            if let Some(count) = map.get_mut(&self.ip) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    map.remove(&self.ip);
                }
            }
        }
    }
}
