//! Port allocation for supervised servers.
//!
//! The allocator probes a configured range for a free TCP port, skipping
//! ports reserved by other live server records. Availability is tested by
//! binding a listener on localhost and dropping it. A previously persisted
//! port is reused when still free, so assignments stay stable across
//! manager restarts.
//!
//! Allocation runs inside the owning record's serialization domain and the
//! result is persisted before any process is launched, so two concurrent
//! allocations can never hand out the same port.

use crate::config::PortRange;
use crate::error::{Error, Result};
use std::collections::HashSet;
use tokio::net::TcpListener;

/// Chooses unused TCP ports from a configured range.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    range: PortRange,
}

impl PortAllocator {
    /// Creates an allocator probing `range`.
    pub fn new(range: PortRange) -> Self {
        Self { range }
    }

    /// The range this allocator probes.
    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Returns true if `port` can currently be bound on localhost.
    ///
    /// A bind-and-drop probe: best effort against unrelated OS-level
    /// listeners, authoritative for nothing else.
    pub async fn is_free(&self, port: u16) -> bool {
        TcpListener::bind(("127.0.0.1", port)).await.is_ok()
    }

    /// Picks a free port, preferring `preferred` when it is still free
    /// and not reserved by another live record.
    ///
    /// Falls back to the first free port in the range that is not in
    /// `reserved`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PortUnavailable`] when the entire range is
    /// reserved or occupied.
    pub async fn allocate(&self, preferred: Option<u16>, reserved: &HashSet<u16>) -> Result<u16> {
        if let Some(port) = preferred {
            if !reserved.contains(&port) && self.is_free(port).await {
                tracing::debug!(port, "Reusing previously assigned port");
                return Ok(port);
            }
            tracing::debug!(port, "Previously assigned port no longer free");
        }

        for port in self.range.start..self.range.end {
            if reserved.contains(&port) {
                continue;
            }
            if self.is_free(port).await {
                tracing::debug!(port, "Allocated port");
                return Ok(port);
            }
        }

        tracing::warn!(
            start = self.range.start,
            end = self.range.end,
            "Port range exhausted"
        );
        Err(Error::PortUnavailable {
            start: self.range.start,
            end: self.range.end,
        })
    }
}
