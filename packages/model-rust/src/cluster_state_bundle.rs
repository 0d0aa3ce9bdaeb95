//! A baseline [`ClusterState`] plus any per-bucket-space state that
//! diverges from it: [`ClusterStateBundle`].

use std::collections::BTreeMap;

use crate::cluster_state::ClusterState;

/// Whether the cluster controller is asking clients to stop feeding, and
/// why. Distinct from any per-node state: this is a cluster-wide signal
/// derived from resource exhaustion on one or more content nodes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedBlock {
    block_feed_in_cluster: bool,
    description: String,
}

impl FeedBlock {
    pub fn blocked(description: impl Into<String>) -> Self {
        Self { block_feed_in_cluster: true, description: description.into() }
    }

    pub fn is_blocking(&self) -> bool {
        self.block_feed_in_cluster
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

/// The unit actually published to distributors and storage nodes. Most of
/// the time every bucket space shares the same state as the baseline; the
/// per-space map only holds entries where a space's state has been
/// independently derived (e.g. the global space lagging behind default
/// during a merge storm).
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterStateBundle {
    baseline: ClusterState,
    derived: BTreeMap<String, ClusterState>,
    feed_block: Option<FeedBlock>,
    deferred_activation: bool,
}

impl ClusterStateBundle {
    pub fn new(baseline: ClusterState) -> Self {
        Self {
            baseline,
            derived: BTreeMap::new(),
            feed_block: None,
            deferred_activation: false,
        }
    }

    pub fn with_derived_state(mut self, bucket_space: impl Into<String>, state: ClusterState) -> Self {
        self.derived.insert(bucket_space.into(), state);
        self
    }

    pub fn with_feed_block(mut self, feed_block: FeedBlock) -> Self {
        self.feed_block = Some(feed_block);
        self
    }

    pub fn with_deferred_activation(mut self, deferred: bool) -> Self {
        self.deferred_activation = deferred;
        self
    }

    pub fn baseline(&self) -> &ClusterState {
        &self.baseline
    }

    pub fn version(&self) -> u32 {
        self.baseline.version
    }

    pub fn feed_block(&self) -> Option<&FeedBlock> {
        self.feed_block.as_ref()
    }

    pub fn block_feed_in_cluster(&self) -> bool {
        self.feed_block.as_ref().is_some_and(FeedBlock::is_blocking)
    }

    pub fn deferred_activation(&self) -> bool {
        self.deferred_activation
    }

    /// The state for `bucket_space`, falling back to the baseline when no
    /// derived state has been recorded for it.
    pub fn state_for(&self, bucket_space: &str) -> &ClusterState {
        self.derived.get(bucket_space).unwrap_or(&self.baseline)
    }

    pub fn bucket_spaces_with_derived_state(&self) -> impl Iterator<Item = &str> {
        self.derived.keys().map(String::as_str)
    }
}
