//! `vds-distributor` -- the distributor's decision engine: merge admission
//! and throttling, and the per-bucket state-checker pipeline that turns a
//! bucket database entry into maintenance operations.
//!
//! - **Messages** ([`messages`]): wire types for merges and the operations a checker emits
//! - **Config** ([`config`]): split/join/merge/GC/activation tunables
//! - **Clock** ([`clock`]): injectable time source for deterministic GC/backpressure tests
//! - **BucketDb** ([`bucket_db`]): the bucket-id -> replica-list collaborator the pipeline reads
//! - **MergeThrottler** ([`merge_throttler`]): admission, forwarding, and backpressure for merges
//! - **Checkers** ([`checkers`]): the seven-stage state-checker pipeline

pub mod bucket_db;
pub mod checkers;
pub mod clock;
pub mod config;
pub mod merge_throttler;
pub mod messages;

pub use bucket_db::{BucketDatabase, InMemoryBucketDatabase};
pub use checkers::{default_pipeline, run_pipeline, CheckerContext, CheckerOutcome, StateChecker};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::DistributorConfig;
pub use merge_throttler::{dispatch_with, Disposition, MergeThrottler, PersistenceSink};
pub use messages::{MaintenanceOperation, MergeBucketCommand, MergeNode, MergeReply, ReplyCode, SchedulePriority};

#[cfg(test)]
mod tests {
    use vds_model::{BucketDbEntry, BucketId, ClusterState, Group};

    use super::*;
    use crate::config::DistributorConfig;

    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }

    /// A bucket entry with no replicas at all runs the full pipeline
    /// without any checker panicking and comes out with no maintenance
    /// operation pending.
    #[test]
    fn empty_entry_runs_the_whole_pipeline_cleanly() {
        let entry = BucketDbEntry::new(BucketId::new(16, 0));
        let cluster_state = ClusterState::new(1);
        let config = DistributorConfig::default();
        let clock = ManualClock::new(0);
        let db = InMemoryBucketDatabase::new();
        let root = Group::leaf(0, "root", (0..4).collect());
        let distribution = vds_model::Distribution::new(root, 2, 2, 2, false, false, true, "test");
        let features = std::collections::HashMap::new();

        let ctx = CheckerContext {
            bucket_id: entry.bucket_id,
            entry: &entry,
            db: &db,
            distribution: &distribution,
            cluster_state: &cluster_state,
            config: &config,
            clock: &clock,
            bucket_space: messages::BucketSpace::Default,
            node_features: &features,
        };

        let outcome = run_pipeline(&default_pipeline(), &ctx);
        assert_eq!(outcome, CheckerOutcome::NoMaintenance);
    }
}
