//! Process-lifetime traffic counters

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bytes moved through the tunnel and sessions restarted, across all sessions
#[derive(Debug, Default)]
pub struct TrafficStats {
    uploaded: AtomicU64,
    downloaded: AtomicU64,
    reconnects: AtomicU64,
}

impl TrafficStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interface to transport
    pub fn add_uploaded(&self, bytes: u64) -> u64 {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed) + bytes
    }

    /// Transport to interface
    pub fn add_downloaded(&self, bytes: u64) -> u64 {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed) + bytes
    }

    pub fn record_reconnect(&self) -> u64 {
        self.reconnects.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }
}

impl fmt::Display for TrafficStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Uploaded: {} Downloaded: {} Reconnects: {}",
            self.uploaded(),
            self.downloaded(),
            self.reconnects()
        )
    }
}
