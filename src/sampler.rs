//! Deterministic per-installation sampling
//!
//! The client id is hashed with SHA-256 and the first eight bytes, read
//! big-endian, are reduced modulo 10 000. The result is a bucket in
//! `[0, 100)` with 0.01 granularity; the hit is admitted when the bucket is
//! strictly below the sample rate. The same installation therefore lands in
//! the same bucket on every call, and raising the rate only ever adds
//! installations.

use sha2::{Digest, Sha256};

const BUCKETS: u64 = 10_000;

/// Position of a client id in `[0, 100)`
pub fn bucket(client_id: &str) -> f64 {
    let digest = Sha256::digest(client_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % BUCKETS) as f64 / 100.0
}

pub fn should_admit(client_id: &str, sample_rate: f64) -> bool {
    if sample_rate >= 100.0 {
        return true;
    }
    if sample_rate <= 0.0 || sample_rate.is_nan() {
        return false;
    }
    bucket(client_id) < sample_rate
}
