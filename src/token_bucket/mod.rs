//! Token-bucket rate limiting.
//!
//! A [`TokenBucketStore`] bounds how often a collector may emit an artifact
//! for a given key. Refill is lazy: whenever a bucket is accessed and a whole
//! period has elapsed since its last refill, it is reset to full capacity.
//! Being rate-limited is a normal `false` result, never an error.

mod bucket;
mod store;

pub use bucket::{BucketParams, TokenBucket, TokenBucketMap, BOOT_TIME};
pub use store::TokenBucketStore;
