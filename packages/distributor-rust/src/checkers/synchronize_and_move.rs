//! Moves a bucket's replicas toward its ideal placement and keeps
//! out-of-sync copies in sync, by emitting a `MergeBucket` command that
//! lists every node that should end up holding the bucket.

use vds_model::State;

use super::{CheckerContext, CheckerOutcome, StateChecker};
use crate::messages::{MaintenanceOperation, MergeNode, SchedulePriority};

pub struct SynchronizeAndMoveChecker;

impl StateChecker for SynchronizeAndMoveChecker {
    fn name(&self) -> &'static str {
        "SynchronizeAndMove"
    }

    fn check(&self, ctx: &CheckerContext<'_>) -> CheckerOutcome {
        let entry = ctx.entry;
        if ctx.config.merges_disabled || entry.node_count() == 0 || ctx.is_inconsistently_split() {
            return CheckerOutcome::NoMaintenance;
        }
        // An entry with only invalid copies has nothing a merge could
        // synchronize yet; it needs a scan first, not a merge.
        if !entry.copies.is_empty() && entry.copies.iter().all(|c| !c.valid) {
            return CheckerOutcome::NoMaintenance;
        }
        // An ideal node sitting in Maintenance can't take a merge target
        // right now; wait for it to come back rather than grinding on a
        // merge that would just be redone once it does.
        if ctx.any_ideal_node_in_state(State::Maintenance) {
            return CheckerOutcome::NoMaintenance;
        }

        let ideal = ctx.ideal_storage_nodes();
        let present = entry.nodes();

        let missing: Vec<u16> = ideal.iter().copied().filter(|n| !present.contains(n)).collect();
        let non_ideal: Vec<u16> = present.iter().copied().filter(|n| !ideal.contains(n)).collect();

        let has_checksum_mismatch = !entry.valid_and_consistent();
        // Widened per the ideal-node state mask: an ideal node outside
        // {Up, Initializing, Retired} is mid cluster-state-change and
        // still needs its copy reconciled even if not literally missing.
        let any_ideal_unsettled = ctx.any_ideal_node_in_state(State::Down)
            || ctx.any_ideal_node_in_state(State::Stopping)
            || ctx.any_ideal_node_in_state(State::Unknown);

        if missing.is_empty() && non_ideal.is_empty() && !has_checksum_mismatch && !any_ideal_unsettled {
            return CheckerOutcome::NoMaintenance;
        }

        let mut nodes = Vec::new();
        for &n in &ideal {
            nodes.push(MergeNode::target(n));
        }
        for &n in &non_ideal {
            // A non-ideal copy still contributes data to the merge but is
            // not a replica target once it completes.
            nodes.push(MergeNode::new(n, true));
        }

        if !missing.is_empty() {
            metrics::counter!("distributor_synchronize_moving_out").increment(1);
            metrics::counter!("distributor_synchronize_copying_in").increment(missing.len() as u64);
        }
        if !non_ideal.is_empty() {
            metrics::counter!("distributor_synchronize_copying_out").increment(non_ideal.len() as u64);
        }
        if has_checksum_mismatch {
            metrics::counter!("distributor_synchronize_syncing").increment(1);
        }

        let priority = priority_for(ctx, &missing, has_checksum_mismatch);

        CheckerOutcome::Stored {
            operation: MaintenanceOperation::MergeBucket { bucket_id: ctx.bucket_id, nodes },
            priority,
        }
    }
}

/// Global-space merges never starve behind default-space churn; a missing
/// ideal copy (under-replication) always outranks a mere resync.
fn priority_for(ctx: &CheckerContext<'_>, missing: &[u16], has_checksum_mismatch: bool) -> SchedulePriority {
    use crate::messages::BucketSpace;
    let base = if !missing.is_empty() {
        SchedulePriority::High
    } else if has_checksum_mismatch {
        SchedulePriority::Medium
    } else {
        SchedulePriority::Low
    };
    if ctx.bucket_space == BucketSpace::Global {
        match base {
            SchedulePriority::High => SchedulePriority::VeryHigh,
            SchedulePriority::Medium => SchedulePriority::High,
            SchedulePriority::Low => SchedulePriority::Medium,
            other => other,
        }
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use vds_model::{BucketCopy, BucketDbEntry, BucketId, BucketInfo, ClusterState, Node, NodeState};

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
        bucket_space: BucketSpace,
    ) -> CheckerContext<'a> {
        CheckerContext {
            bucket_id: entry.bucket_id,
            entry,
            db,
            distribution,
            cluster_state,
            config,
            clock,
            bucket_space,
            node_features: features,
        }
    }

    #[test]
    fn missing_ideal_copy_emits_merge_at_high_priority() {
        let bucket = BucketId::new(16, 1);
        let mut entry = BucketDbEntry::new(bucket);
        entry.copies.push(BucketCopy::new(0, BucketInfo::default()));

        let db = InMemoryBucketDatabase::new();
        let dist = flat_distribution(3, 2);
        let cs = ClusterState::new(1);
        let config = DistributorConfig::default();
        let clock = ManualClock::new(0);
        let features = HashMap::new();
        let ctx = context_for(&entry, &db, &dist, &cs, &config, &clock, &features, BucketSpace::Default);

        let outcome = SynchronizeAndMoveChecker.check(&ctx);
        match outcome {
            CheckerOutcome::Stored { operation: MaintenanceOperation::MergeBucket { bucket_id, nodes }, priority } => {
                assert_eq!(bucket_id, bucket);
                assert_eq!(priority, SchedulePriority::High);
                assert!(nodes.iter().any(|n| !n.source_only));
            }
            other => panic!("expected a merge, got {other:?}"),
        }
    }

    #[test]
    fn fully_ideal_and_consistent_bucket_needs_no_merge() {
        let bucket = BucketId::new(16, 1);
        let dist = flat_distribution(2, 2);
        let cs = ClusterState::new(1);
        let ideal = dist.ideal_nodes(vds_model::NodeType::Storage, &cs, bucket, "uimr").unwrap();

        let mut entry = BucketDbEntry::new(bucket);
        for &n in &ideal {
            entry.copies.push(BucketCopy::new(n, BucketInfo::default()));
        }

        let db = InMemoryBucketDatabase::new();
        let config = DistributorConfig::default();
        let clock = ManualClock::new(0);
        let features = HashMap::new();
        let ctx = context_for(&entry, &db, &dist, &cs, &config, &clock, &features, BucketSpace::Default);

        assert_eq!(SynchronizeAndMoveChecker.check(&ctx), CheckerOutcome::NoMaintenance);
    }

    #[test]
    fn all_invalid_copies_are_skipped_pending_a_scan() {
        let bucket = BucketId::new(16, 1);
        let mut entry = BucketDbEntry::new(bucket);
        entry.copies.push(BucketCopy::invalid(0));

        let db = InMemoryBucketDatabase::new();
        let dist = flat_distribution(2, 1);
        let cs = ClusterState::new(1);
        let config = DistributorConfig::default();
        let clock = ManualClock::new(0);
        let features = HashMap::new();
        let ctx = context_for(&entry, &db, &dist, &cs, &config, &clock, &features, BucketSpace::Default);

        assert_eq!(SynchronizeAndMoveChecker.check(&ctx), CheckerOutcome::NoMaintenance);
    }

    #[test]
    fn global_space_merge_is_escalated_a_tier() {
        let bucket = BucketId::new(16, 1);
        let mut entry = BucketDbEntry::new(bucket);
        entry.copies.push(BucketCopy::new(0, BucketInfo::default()));

        let db = InMemoryBucketDatabase::new();
        let dist = flat_distribution(3, 2);
        let cs = ClusterState::new(1);
        let config = DistributorConfig::default();
        let clock = ManualClock::new(0);
        let features = HashMap::new();
        let ctx = context_for(&entry, &db, &dist, &cs, &config, &clock, &features, BucketSpace::Global);

        let outcome = SynchronizeAndMoveChecker.check(&ctx);
        assert!(matches!(outcome, CheckerOutcome::Stored { priority: SchedulePriority::VeryHigh, .. }));
    }

    #[test]
    fn ideal_node_in_maintenance_defers_the_merge() {
        let bucket = BucketId::new(16, 1);
        let dist = flat_distribution(2, 2);
        let mut cs = ClusterState::new(1);
        let ideal = dist.ideal_nodes(vds_model::NodeType::Storage, &cs, bucket, "uimr").unwrap();
        cs.set_node_state(Node::storage(ideal[0]), NodeState::new(State::Maintenance));

        // Deliberately missing one ideal copy: a merge would otherwise be
        // warranted, but the Maintenance node must suppress it anyway.
        let mut entry = BucketDbEntry::new(bucket);
        entry.copies.push(BucketCopy::new(ideal[1], BucketInfo::default()));

        let db = InMemoryBucketDatabase::new();
        let config = DistributorConfig::default();
        let clock = ManualClock::new(0);
        let features = HashMap::new();
        let ctx = context_for(&entry, &db, &dist, &cs, &config, &clock, &features, BucketSpace::Default);

        assert_eq!(SynchronizeAndMoveChecker.check(&ctx), CheckerOutcome::NoMaintenance);
    }

    #[test]
    fn globally_disabled_merges_never_trigger() {
        let bucket = BucketId::new(16, 1);
        let mut entry = BucketDbEntry::new(bucket);
        entry.copies.push(BucketCopy::new(0, BucketInfo::default()));

        let db = InMemoryBucketDatabase::new();
        let dist = flat_distribution(3, 2);
        let cs = ClusterState::new(1);
        let config = DistributorConfig { merges_disabled: true, ..Default::default() };
        let clock = ManualClock::new(0);
        let features = HashMap::new();
        let ctx = context_for(&entry, &db, &dist, &cs, &config, &clock, &features, BucketSpace::Default);

        assert_eq!(SynchronizeAndMoveChecker.check(&ctx), CheckerOutcome::NoMaintenance);
    }
}
