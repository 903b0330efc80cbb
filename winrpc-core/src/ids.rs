//! Unique identifier generation for requestIds, streamIds, and endpoint ids.
//!
//! A process-wide atomic counter plus a random salt fixed at process start
//! stands in for a UUID library.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

static COUNTER: AtomicU64 = AtomicU64::new(0);

fn process_salt() -> u64 {
    static SALT: OnceLock<u64> = OnceLock::new();
    *SALT.get_or_init(|| {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        // Mix in the address of a stack value for a bit more process-to-process spread.
        let stack_addr = &nanos as *const u64 as u64;
        nanos ^ stack_addr.rotate_left(17)
    })
}

/// Generates a unique, opaque identifier suitable for `requestId`/`streamId`.
///
/// Not cryptographically random; only uniqueness within and across the
/// process lifetime is required by the protocol.
pub fn generate_id(prefix: &str) -> String {
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_{:016x}_{seq:x}", process_salt())
}

pub fn generate_request_id() -> String {
    generate_id("req")
}

pub fn generate_stream_id() -> String {
    generate_id("strm")
}

pub fn generate_endpoint_id() -> String {
    generate_id("ep")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = generate_request_id();
        let b = generate_request_id();
        assert_ne!(a, b);
        assert!(a.starts_with("req_"));
    }

    #[test]
    fn different_prefixes_are_distinguishable() {
        let req = generate_request_id();
        let strm = generate_stream_id();
        assert!(req.starts_with("req_"));
        assert!(strm.starts_with("strm_"));
    }
}
