//! Sharder implementation.
use sha1::{Digest, Sha1};

/// Maps an input string onto one of `total_shards` buckets.
pub trait Sharder {
    /// Return the bucket for `input` in `0..total_shards`.
    fn get_shard(&self, input: impl AsRef<[u8]>, total_shards: u64) -> u64;
}

/// The default (and only) sharder: the first 7 hex digits of the SHA-1 digest, modulo
/// `total_shards`.
pub struct Sha1Sharder;

impl Sharder for Sha1Sharder {
    fn get_shard(&self, input: impl AsRef<[u8]>, total_shards: u64) -> u64 {
        let hash = Sha1::digest(input);
        // 7 hex digits are the top 28 bits of the first 4 bytes.
        let value = u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]]) >> 4;
        (value as u64) % total_shards
    }
}

/// Lowercase hex SHA-1 digest, as used by sensitive comparators.
pub(crate) fn sha1_hex(input: impl AsRef<[u8]>) -> String {
    format!("{:x}", Sha1::digest(input))
}
