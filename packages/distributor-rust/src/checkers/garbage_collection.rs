//! Periodically reclaims space held by tombstoned documents once a bucket
//! has gone untouched by garbage collection for longer than the configured
//! interval.

use vds_model::State;

use super::{CheckerContext, CheckerOutcome, StateChecker};
use crate::messages::{MaintenanceOperation, SchedulePriority};

/// Decides whether a bucket is due for garbage collection, pulled out
/// behind a trait so tests can force the decision without racing a real
/// clock.
pub trait ShouldGc: Send + Sync {
    fn should_gc(&self, entry_last_gc_ms: u64, now_ms: u64, interval: std::time::Duration) -> bool;
}

/// The reference calculator: due once `interval` has elapsed since
/// `last_garbage_collection_time`.
pub struct IntervalShouldGc;

impl ShouldGc for IntervalShouldGc {
    fn should_gc(&self, entry_last_gc_ms: u64, now_ms: u64, interval: std::time::Duration) -> bool {
        if interval.is_zero() {
            return false;
        }
        let elapsed = now_ms.saturating_sub(entry_last_gc_ms);
        elapsed >= u64::try_from(interval.as_millis()).unwrap_or(u64::MAX)
    }
}

pub struct GarbageCollectionChecker {
    should_gc: Box<dyn ShouldGc>,
}

impl GarbageCollectionChecker {
    pub fn new(should_gc: Box<dyn ShouldGc>) -> Self {
        Self { should_gc }
    }
}

impl StateChecker for GarbageCollectionChecker {
    fn name(&self) -> &'static str {
        "GarbageCollection"
    }

    fn check(&self, ctx: &CheckerContext<'_>) -> CheckerOutcome {
        let interval = ctx.config.garbage_collection_interval;
        if interval.is_zero() || ctx.entry.node_count() == 0 {
            return CheckerOutcome::NoMaintenance;
        }

        if ctx.any_ideal_node_in_state(State::Maintenance) {
            return CheckerOutcome::NoMaintenance;
        }

        let now = ctx.clock.now_ms();
        if !self.should_gc.should_gc(ctx.entry.last_garbage_collection_time, now, interval) {
            return CheckerOutcome::NoMaintenance;
        }

        CheckerOutcome::Stored {
            operation: MaintenanceOperation::GarbageCollection { bucket_id: ctx.bucket_id },
            priority: SchedulePriority::VeryLow,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use vds_model::{BucketCopy, BucketDbEntry, BucketId, BucketInfo, ClusterState, NodeState};

    use super::*;
    use crate::bucket_db::InMemoryBucketDatabase;
    use crate::checkers::tests::flat_distribution;
    use crate::clock::ManualClock;
    use crate::config::DistributorConfig;
    use crate::messages::BucketSpace;

    fn context_for<'a>(
        entry: &'a BucketDbEntry,
        db: &'a InMemoryBucketDatabase,
        distribution: &'a vds_model::Distribution,
        cluster_state: &'a ClusterState,
        config: &'a DistributorConfig,
        clock: &'a ManualClock,
        features: &'a HashMap<u16, vds_model::NodeSupportedFeatures>,
    ) -> CheckerContext<'a> {
        CheckerContext {
            bucket_id: entry.bucket_id,
            entry,
            db,
            distribution,
            cluster_state,
            config,
            clock,
            bucket_space: BucketSpace::Default,
            node_features: features,
        }
    }

    #[test]
    fn bucket_past_interval_is_collected() {
        let mut entry = BucketDbEntry::new(BucketId::new(16, 1));
        entry.copies.push(BucketCopy::new(0, BucketInfo::default()));
        entry.last_garbage_collection_time = 0;

        let db = InMemoryBucketDatabase::new();
        let dist = flat_distribution(4, 2);
        let cs = ClusterState::new(1);
        let config = DistributorConfig { garbage_collection_interval: Duration::from_secs(3600), ..Default::default() };
        let clock = ManualClock::new(3_600_000);
        let features = HashMap::new();
        let ctx = context_for(&entry, &db, &dist, &cs, &config, &clock, &features);

        let outcome = GarbageCollectionChecker::new(Box::new(IntervalShouldGc)).check(&ctx);
        assert_eq!(
            outcome,
            CheckerOutcome::Stored {
                operation: MaintenanceOperation::GarbageCollection { bucket_id: entry.bucket_id },
                priority: SchedulePriority::VeryLow,
            }
        );
    }

    #[test]
    fn recently_collected_bucket_is_skipped() {
        let mut entry = BucketDbEntry::new(BucketId::new(16, 1));
        entry.copies.push(BucketCopy::new(0, BucketInfo::default()));
        entry.last_garbage_collection_time = 3_500_000;

        let db = InMemoryBucketDatabase::new();
        let dist = flat_distribution(4, 2);
        let cs = ClusterState::new(1);
        let config = DistributorConfig { garbage_collection_interval: Duration::from_secs(3600), ..Default::default() };
        let clock = ManualClock::new(3_600_000);
        let features = HashMap::new();
        let ctx = context_for(&entry, &db, &dist, &cs, &config, &clock, &features);

        let outcome = GarbageCollectionChecker::new(Box::new(IntervalShouldGc)).check(&ctx);
        assert_eq!(outcome, CheckerOutcome::NoMaintenance);
    }

    #[test]
    fn disabled_interval_never_collects() {
        let mut entry = BucketDbEntry::new(BucketId::new(16, 1));
        entry.copies.push(BucketCopy::new(0, BucketInfo::default()));

        let db = InMemoryBucketDatabase::new();
        let dist = flat_distribution(4, 2);
        let cs = ClusterState::new(1);
        let config = DistributorConfig { garbage_collection_interval: Duration::ZERO, ..Default::default() };
        let clock = ManualClock::new(1_000_000_000);
        let features = HashMap::new();
        let ctx = context_for(&entry, &db, &dist, &cs, &config, &clock, &features);

        let outcome = GarbageCollectionChecker::new(Box::new(IntervalShouldGc)).check(&ctx);
        assert_eq!(outcome, CheckerOutcome::NoMaintenance);
    }

    #[test]
    fn ideal_node_in_maintenance_defers_collection() {
        let bucket = BucketId::new(16, 1);
        let dist = flat_distribution(4, 2);
        let mut cs = ClusterState::new(1);
        let ideal = dist.ideal_nodes(vds_model::NodeType::Storage, &cs, bucket, "uimr").unwrap();
        cs.set_node_state(vds_model::Node::storage(ideal[0]), NodeState::new(State::Maintenance));

        let mut entry = BucketDbEntry::new(bucket);
        entry.copies.push(BucketCopy::new(ideal[1], BucketInfo::default()));

        let db = InMemoryBucketDatabase::new();
        let config = DistributorConfig { garbage_collection_interval: Duration::from_secs(3600), ..Default::default() };
        let clock = ManualClock::new(3_600_000);
        let features = HashMap::new();
        let ctx = context_for(&entry, &db, &dist, &cs, &config, &clock, &features);

        let outcome = GarbageCollectionChecker::new(Box::new(IntervalShouldGc)).check(&ctx);
        assert_eq!(outcome, CheckerOutcome::NoMaintenance);
    }
}
