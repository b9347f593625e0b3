//! Stable string hash for server placement.
//!
//! Placement is a wire-compatibility concern: every client build must map
//! the same `(namespace, name)` to the same server for stored data to be
//! found again, so the hash is pinned here rather than delegated to a
//! hasher whose output may change between releases.

pub fn hash(parts: &[&str]) -> u32 {
    let mut h: u32 = 5381;
    for part in parts {
        for byte in part.bytes() {
            h = h.wrapping_mul(33) ^ u32::from(byte);
        }
    }
    h
}

/// Server index for a handle identified by `parts`.
pub fn server_index(parts: &[&str], server_count: u32) -> u32 {
    hash(parts) % server_count.max(1)
}
