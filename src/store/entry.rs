//! A single stored value with optional expiry.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub value: Vec<u8>,
    /// Absolute expiry in epoch milliseconds; `None` means no expiry.
    pub expires_at: Option<u64>,
    /// Opaque memcached flags, echoed back in `VALUE` lines.
    pub mc_flag: u32,
}

impl Entry {
    pub fn new(value: Vec<u8>) -> Self {
        Entry {
            value,
            expires_at: None,
            mc_flag: 0,
        }
    }

    pub fn with_flags(value: Vec<u8>, mc_flag: u32) -> Self {
        Entry {
            value,
            expires_at: None,
            mc_flag,
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now_ms)
    }

    /// Remaining lifetime in milliseconds; -1 when the key has no expiry.
    pub fn ttl_millis(&self, now_ms: u64) -> i64 {
        match self.expires_at {
            None => -1,
            Some(at) => at.saturating_sub(now_ms) as i64,
        }
    }
}
