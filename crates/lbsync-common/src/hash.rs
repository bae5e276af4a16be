//! Stable hashing helpers
//!
//! Both functions are stable across processes and toolchain releases, so
//! their output may be persisted on the remote controller or used to route
//! work to a fixed shard.

/// Compute a deterministic hash of the input string, returning a 16-char hex digest.
///
/// Uses truncated SHA-256. `DefaultHasher` is not guaranteed stable across
/// Rust releases, so this is used whenever the hash is persisted (e.g. the
/// `cloud_config_cksum` stored on remote objects).
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Map a shard key onto one of `shards` buckets using 32-bit FNV-1a.
///
/// Returns 0 when `shards` is 0 or 1.
pub fn shard_index(key: &str, shards: usize) -> usize {
    if shards <= 1 {
        return 0;
    }
    let hash = key.bytes().fold(FNV_OFFSET_BASIS, |h, b| {
        (h ^ u32::from(b)).wrapping_mul(FNV_PRIME)
    });
    hash as usize % shards
}
