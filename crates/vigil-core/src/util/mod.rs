//! Shared primitives: sliding windows, running stats, bloom filters,
//! the string interner and the alert queue.

pub mod bloom;
pub mod interner;
pub mod queue;
pub mod stats;
pub mod window;

pub use bloom::{BloomFilter, CountingBloomFilter};
pub use interner::StringInterner;
pub use queue::AlertQueue;
pub use stats::{CompactStatsTracker, StatsTracker};
pub use window::{SlidingWindow, TimestampWindow};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// FNV-1a over a byte slice, truncated to 32 bits. Used for path keys.
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Pack a dotted-quad IPv4 address into a u32. Non-IPv4 sources
/// (IPv6, hostnames) fall back to a 32-bit hash so they still key a
/// state slot.
pub fn ip_key(ip: &str) -> u32 {
    match ip.parse::<std::net::Ipv4Addr>() {
        Ok(addr) => u32::from(addr),
        Err(_) => fnv1a_32(ip.as_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_known_vector() {
        // FNV-1a("a") = 0xe40c292c
        assert_eq!(fnv1a_32(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a_32(b""), 0x811c_9dc5);
    }

    #[test]
    fn test_ip_key_v4() {
        assert_eq!(ip_key("1.2.3.4"), 0x0102_0304);
        assert_eq!(ip_key("0.0.0.0"), 0);
    }

    #[test]
    fn test_ip_key_fallback() {
        let a = ip_key("2001:db8::1");
        let b = ip_key("2001:db8::2");
        assert_ne!(a, b);
    }
}
