//! Bucketing math
//!
//! Pure functions mapping tags and timestamps onto bucket values, logical
//! chunk identifiers and worker slots. Nothing here holds state, so the same
//! inputs always land on the same chunk and the same worker.

use crate::{TagId, Timestamp};
use std::fmt::Display;

/// Round a timestamp down to the start of its bucket
///
/// Uses the euclidean remainder so that negative timestamps bucket towards
/// negative infinity and `bucket_time(bucket_time(x, w), w) == bucket_time(x, w)`.
/// The lowest bucket saturates at `i64::MIN`.
pub fn bucket_time(value: Timestamp, width: i64) -> Timestamp {
    value.div_euclid(width).saturating_mul(width)
}

/// Round a tag id down to the start of its bucket
pub fn bucket_tag(value: TagId, width: TagId) -> TagId {
    value - (value % width)
}

/// Build a logical chunk id: `prefix + sep + join(dimensions, sep)`
pub fn logical_chunk_id<D: Display>(dimensions: &[D], prefix: &str, sep: &str) -> String {
    let mut id = String::with_capacity(prefix.len() + dimensions.len() * 12);
    id.push_str(prefix);
    for dimension in dimensions {
        id.push_str(sep);
        id.push_str(&dimension.to_string());
    }
    id
}

/// Deterministic worker slot for a key
pub fn affinity(key: &str, cardinality: usize) -> usize {
    if cardinality == 0 {
        return 0;
    }
    crc32fast::hash(key.as_bytes()) as usize % cardinality
}

/// Maps a tag name into the numeric domain used for bucketing
pub trait TagHasher: Send + Sync {
    /// Short identifier for logs and diagnostics
    fn name(&self) -> &'static str;

    /// Hash a tag name to its numeric id
    fn hash_tag(&self, tag: &str) -> TagId;
}

/// Classic multiplicative string hash (`h = h * 31 + byte`) over 64 bits
#[derive(Debug, Clone, Copy, Default)]
pub struct MultiplicativeTagHasher;

impl TagHasher for MultiplicativeTagHasher {
    fn name(&self) -> &'static str {
        "multiplicative"
    }

    fn hash_tag(&self, tag: &str) -> TagId {
        let h = tag
            .bytes()
            .fold(0u64, |h, b| h.wrapping_mul(31).wrapping_add(b as u64));
        h as TagId
    }
}

/// Tags that already are numeric ids
///
/// Non-numeric tags fall back to the multiplicative hash so that every tag
/// still maps somewhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct NumericTagHasher;

impl TagHasher for NumericTagHasher {
    fn name(&self) -> &'static str {
        "numeric"
    }

    fn hash_tag(&self, tag: &str) -> TagId {
        tag.trim()
            .parse::<TagId>()
            .unwrap_or_else(|_| MultiplicativeTagHasher.hash_tag(tag))
    }
}

/// Four salted CRC32 lanes packed into a 128-bit id
#[derive(Debug, Clone, Copy, Default)]
pub struct LaneTagHasher;

impl TagHasher for LaneTagHasher {
    fn name(&self) -> &'static str {
        "lanes"
    }

    fn hash_tag(&self, tag: &str) -> TagId {
        (0u8..4).fold(0 as TagId, |acc, lane| {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&[lane]);
            hasher.update(tag.as_bytes());
            (acc << 32) | hasher.finalize() as TagId
        })
    }
}

/// Look up a tag hasher by its configured name
pub fn tag_hasher_by_name(name: &str) -> Option<Box<dyn TagHasher>> {
    match name {
        "multiplicative" => Some(Box::new(MultiplicativeTagHasher)),
        "numeric" => Some(Box::new(NumericTagHasher)),
        "lanes" => Some(Box::new(LaneTagHasher)),
        _ => None,
    }
}
