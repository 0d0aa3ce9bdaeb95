//! Tunables for the merge throttler and the state-checker pipeline.
//!
//! A single [`DistributorConfig`] is shared read-only across both; there is
//! no live-reload story modeled here (a new config is a new value, same as
//! [`vds_model::Distribution`]).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Split/join/merge/GC/activation knobs, with the documented reference
/// defaults where the spec names one (e.g. 15s backpressure).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributorConfig {
    /// Byte-size threshold past which a bucket is split to the maximum
    /// (58) used-bits.
    pub split_size_bytes: u64,
    /// Document-count threshold, same role as `split_size_bytes`.
    pub split_count_docs: u32,
    /// Meta-entry-count threshold; compared as `meta_count / 2`.
    pub split_meta_count: u32,
    /// On-disk file-size threshold; compared as `used_file_size / 2`.
    pub split_file_size_bytes: u64,
    /// Every bucket is split to at least this many used-bits regardless
    /// of size, at `Medium` priority.
    pub minimal_split_bits: u8,

    /// Combined file-size threshold below which two sibling buckets (or a
    /// single childless one) are eligible to join.
    pub join_size_bytes: u64,
    /// Combined meta-count threshold, same role as `join_size_bytes`.
    pub join_count: u32,
    /// Allow joining siblings that hold different replica sets, as long
    /// as both match the ideal placement.
    pub enable_inconsistent_join: bool,
    /// Allow joining a bucket with no sibling in the tree at all (a
    /// single-bucket join up to its childless parent).
    pub enable_join_for_single_bucket: bool,

    pub merges_disabled: bool,
    pub activation_disabled: bool,
    /// `0` disables the majority-consistency activation inhibitor
    /// entirely; otherwise the maximum number of leaf groups it may
    /// inhibit activation for in a single tick.
    pub max_activation_inhibited_out_of_sync_groups: usize,

    /// `Duration::ZERO` disables garbage collection.
    pub garbage_collection_interval: Duration,

    /// How long `MergeThrottler::apply_backpressure` bounces merges for.
    pub backpressure_duration: Duration,
    /// Maximum number of merges the throttler will execute concurrently.
    pub max_active_merges: usize,
    /// Maximum number of merges the throttler will hold pending once
    /// `max_active_merges` is reached.
    pub max_queue_size: usize,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            split_size_bytes: 32 * 1024 * 1024,
            split_count_docs: 4_000_000,
            split_meta_count: 8_000_000,
            split_file_size_bytes: 48 * 1024 * 1024,
            minimal_split_bits: 8,

            join_size_bytes: 16 * 1024 * 1024,
            join_count: 2_000_000,
            enable_inconsistent_join: false,
            enable_join_for_single_bucket: false,

            merges_disabled: false,
            activation_disabled: false,
            max_activation_inhibited_out_of_sync_groups: 0,

            garbage_collection_interval: Duration::from_secs(3600),

            backpressure_duration: Duration::from_secs(15),
            max_active_merges: 25,
            max_queue_size: 1024,
        }
    }
}
