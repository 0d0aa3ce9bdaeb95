//! The distributor's per-bucket maintenance-operation pipeline.
//!
//! Seven checkers run in a fixed order for one bucket at a time; the first
//! to emit a result short-circuits the rest, the way the teacher's
//! middleware stack short-circuits on a terminal response — except there
//! is no suspension point here, so this is a plain synchronous `Vec<Box<dyn
//! StateChecker>>` walk rather than a `tower` service stack.

mod delete_extra_copies;
mod garbage_collection;
mod join_buckets;
mod set_bucket_state;
mod split_bucket;
mod split_inconsistent;
mod synchronize_and_move;

pub use delete_extra_copies::DeleteExtraCopiesChecker;
pub use garbage_collection::{GarbageCollectionChecker, IntervalShouldGc, ShouldGc};
pub use join_buckets::JoinBucketsChecker;
pub use set_bucket_state::SetBucketStateChecker;
pub use split_bucket::SplitBucketChecker;
pub use split_inconsistent::SplitInconsistentBucketsChecker;
pub use synchronize_and_move::SynchronizeAndMoveChecker;

use std::collections::HashMap;

use vds_model::{ClusterState, Distribution, NodeSupportedFeatures, NodeType};
use vds_model::{BucketDbEntry, BucketId, Node, State};

use crate::bucket_db::BucketDatabase;
use crate::clock::Clock;
use crate::config::DistributorConfig;
use crate::messages::{BucketSpace, MaintenanceOperation, SchedulePriority};

/// State mask a node must be in to count as an *ideal* placement candidate
/// for checker purposes. Wider than the mask a client would use to decide
/// whether redundancy is satisfied: a `Maintenance` node is still "ideal"
/// here, just flagged by the individual checkers that care.
pub const IDEAL_NODE_STATES: &str = "uimr";

/// Everything a single checker invocation needs, gathered for one bucket.
/// Checkers never reach for ambient globals — config, clock, and topology
/// all arrive through this struct, mirroring the spec's "no process-wide
/// singletons" rule.
pub struct CheckerContext<'a> {
    pub bucket_id: BucketId,
    pub entry: &'a BucketDbEntry,
    pub db: &'a dyn BucketDatabase,
    pub distribution: &'a Distribution,
    pub cluster_state: &'a ClusterState,
    pub config: &'a DistributorConfig,
    pub clock: &'a dyn Clock,
    pub bucket_space: BucketSpace,
    pub node_features: &'a HashMap<u16, NodeSupportedFeatures>,
}

impl<'a> CheckerContext<'a> {
    /// This bucket's preferred storage placement, widened to include
    /// `Maintenance` and `Retired` nodes (see [`IDEAL_NODE_STATES`]).
    /// Placement failure (too few bucket bits) degrades to an empty list
    /// rather than propagating — a checker sees "no ideal nodes" the same
    /// way it would see a bucket nobody has split into range yet.
    pub fn ideal_storage_nodes(&self) -> Vec<u16> {
        self.distribution
            .ideal_nodes(NodeType::Storage, self.cluster_state, self.bucket_id, IDEAL_NODE_STATES)
            .unwrap_or_default()
    }

    pub fn any_ideal_node_in_state(&self, state: State) -> bool {
        self.ideal_storage_nodes()
            .iter()
            .any(|&n| self.cluster_state.node_state(Node::storage(n)).state == state)
    }

    pub fn redundancy(&self) -> u16 {
        self.distribution.redundancy
    }

    /// `true` when the bucket database holds more than one entry covering
    /// this bucket's logical range at different split depths — the
    /// condition [`crate::checkers::SplitInconsistentBucketsChecker`]
    /// resolves. Every checker downstream of it must stand down until
    /// that resolves, rather than racing a merge/activation/deletion
    /// against a tree that hasn't finished splitting.
    pub fn is_inconsistently_split(&self) -> bool {
        self.db.entries_overlapping(&self.bucket_id).len() > 1
    }

    pub fn features_for(&self, node: u16) -> NodeSupportedFeatures {
        self.node_features.get(&node).copied().unwrap_or_default()
    }
}

/// What a checker decided for one bucket.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckerOutcome {
    NoMaintenance,
    Stored { operation: MaintenanceOperation, priority: SchedulePriority },
}

/// One policy evaluator in the pipeline. Implementations must be pure
/// functions of `ctx` — no interior mutability, no I/O.
pub trait StateChecker: Send + Sync {
    fn name(&self) -> &'static str;
    fn check(&self, ctx: &CheckerContext<'_>) -> CheckerOutcome;
}

/// Runs `checkers` in order against `ctx`, stopping at the first
/// non-`NoMaintenance` result.
pub fn run_pipeline(checkers: &[Box<dyn StateChecker>], ctx: &CheckerContext<'_>) -> CheckerOutcome {
    for checker in checkers {
        let outcome = checker.check(ctx);
        if !matches!(outcome, CheckerOutcome::NoMaintenance) {
            tracing::trace!(checker = checker.name(), bucket = %ctx.bucket_id, "checker produced a maintenance operation");
            return outcome;
        }
    }
    CheckerOutcome::NoMaintenance
}

/// The checker order the spec mandates. Fixed at build time, per the
/// "dynamic dispatch across checkers" design note.
pub fn default_pipeline() -> Vec<Box<dyn StateChecker>> {
    vec![
        Box::new(SplitBucketChecker),
        Box::new(JoinBucketsChecker),
        Box::new(SplitInconsistentBucketsChecker),
        Box::new(SynchronizeAndMoveChecker),
        Box::new(DeleteExtraCopiesChecker),
        Box::new(SetBucketStateChecker),
        Box::new(GarbageCollectionChecker::new(Box::new(IntervalShouldGc))),
    ]
}
