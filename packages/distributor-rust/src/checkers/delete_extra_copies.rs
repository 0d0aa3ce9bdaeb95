//! Deletes copies the bucket no longer needs: every copy of a truly empty
//! bucket, every empty non-ideal copy, or — once the entry is internally
//! consistent and enough ideal-plus-kept copies already satisfy redundancy
//! — the lowest-index non-ideal, non-active redundant copies.

use vds_model::State;

use super::{CheckerContext, CheckerOutcome, StateChecker};
use crate::messages::{MaintenanceOperation, SchedulePriority};

pub struct DeleteExtraCopiesChecker;

impl StateChecker for DeleteExtraCopiesChecker {
    fn name(&self) -> &'static str {
        "DeleteExtraCopies"
    }

    fn check(&self, ctx: &CheckerContext<'_>) -> CheckerOutcome {
        let entry = ctx.entry;
        if entry.node_count() == 0 || entry.has_invalid_copy() || ctx.any_ideal_node_in_state(State::Maintenance) {
            return CheckerOutcome::NoMaintenance;
        }

        if entry.empty_and_consistent() {
            let nodes = entry.nodes();
            return CheckerOutcome::Stored {
                operation: MaintenanceOperation::DeleteExtraCopies { bucket_id: ctx.bucket_id, nodes },
                priority: SchedulePriority::High,
            };
        }

        let redundancy = ctx.redundancy() as usize;
        if entry.node_count() <= redundancy {
            return CheckerOutcome::NoMaintenance;
        }

        let ideal = ctx.ideal_storage_nodes();
        // Whether every valid copy agrees on checksum. Only an internally
        // consistent entry can tell a truly redundant in-sync copy apart
        // from one that might still be the sole holder of divergent data.
        let consistent = entry.valid_and_consistent();

        let mut non_ideal: Vec<&vds_model::BucketCopy> = entry.copies.iter().filter(|c| !ideal.contains(&c.node)).collect();
        non_ideal.sort_unstable_by_key(|c| c.node);

        // Every ideal copy already present counts toward redundancy; a
        // non-ideal copy we decide to keep below adds to this running
        // total as we go, lowest node index first.
        let mut kept_count = entry.copies.iter().filter(|c| ideal.contains(&c.node)).count();
        let mut to_delete = Vec::new();
        for copy in non_ideal {
            if copy.empty() {
                to_delete.push(copy.node);
                continue;
            }
            if consistent && kept_count >= redundancy && !copy.active {
                to_delete.push(copy.node);
            } else {
                kept_count += 1;
            }
        }

        if to_delete.is_empty() {
            return CheckerOutcome::NoMaintenance;
        }

        CheckerOutcome::Stored {
            operation: MaintenanceOperation::DeleteExtraCopies { bucket_id: ctx.bucket_id, nodes: to_delete },
            priority: SchedulePriority::High,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use vds_model::{BucketCopy, BucketDbEntry, BucketId, BucketInfo, ClusterState};

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
    fn empty_bucket_deletes_every_copy() {
        let mut entry = BucketDbEntry::new(BucketId::new(16, 1));
        entry.copies.push(BucketCopy::new(0, BucketInfo::default()));
        entry.copies.push(BucketCopy::new(1, BucketInfo::default()));

        let db = InMemoryBucketDatabase::new();
        let dist = flat_distribution(4, 2);
        let cs = ClusterState::new(1);
        let config = DistributorConfig::default();
        let clock = ManualClock::new(0);
        let features = HashMap::new();
        let ctx = context_for(&entry, &db, &dist, &cs, &config, &clock, &features);

        let outcome = DeleteExtraCopiesChecker.check(&ctx);
        match outcome {
            CheckerOutcome::Stored { operation: MaintenanceOperation::DeleteExtraCopies { nodes, .. }, priority } => {
                let mut nodes = nodes;
                nodes.sort_unstable();
                assert_eq!(nodes, vec![0, 1]);
                assert_eq!(priority, SchedulePriority::High);
            }
            other => panic!("expected a deletion, got {other:?}"),
        }
    }

    #[test]
    fn redundant_non_ideal_copies_beyond_redundancy_are_deleted() {
        let bucket = BucketId::new(16, 1);
        let dist = flat_distribution(6, 2);
        let cs = ClusterState::new(1);
        let ideal = dist.ideal_nodes(vds_model::NodeType::Storage, &cs, bucket, "uimr").unwrap();

        let mut entry = BucketDbEntry::new(bucket);
        for &n in &ideal {
            entry.copies.push(BucketCopy::new(n, BucketInfo { meta_count: 1, ..Default::default() }));
        }
        // Two additional, non-ideal legacy copies.
        let extra: Vec<u16> = (0..6u16).filter(|n| !ideal.contains(n)).take(2).collect();
        for &n in &extra {
            entry.copies.push(BucketCopy::new(n, BucketInfo { meta_count: 1, ..Default::default() }));
        }

        let db = InMemoryBucketDatabase::new();
        let config = DistributorConfig::default();
        let clock = ManualClock::new(0);
        let features = HashMap::new();
        let ctx = context_for(&entry, &db, &dist, &cs, &config, &clock, &features);

        let outcome = DeleteExtraCopiesChecker.check(&ctx);
        match outcome {
            CheckerOutcome::Stored { operation: MaintenanceOperation::DeleteExtraCopies { nodes, .. }, priority } => {
                assert_eq!(nodes, extra);
                assert_eq!(priority, SchedulePriority::High);
            }
            other => panic!("expected a deletion, got {other:?}"),
        }
    }

    #[test]
    fn fully_ideal_bucket_at_redundancy_deletes_nothing() {
        let bucket = BucketId::new(16, 1);
        let dist = flat_distribution(2, 2);
        let cs = ClusterState::new(1);
        let ideal = dist.ideal_nodes(vds_model::NodeType::Storage, &cs, bucket, "uimr").unwrap();

        let mut entry = BucketDbEntry::new(bucket);
        for &n in &ideal {
            entry.copies.push(BucketCopy::new(n, BucketInfo { meta_count: 1, ..Default::default() }));
        }

        let db = InMemoryBucketDatabase::new();
        let config = DistributorConfig::default();
        let clock = ManualClock::new(0);
        let features = HashMap::new();
        let ctx = context_for(&entry, &db, &dist, &cs, &config, &clock, &features);

        assert_eq!(DeleteExtraCopiesChecker.check(&ctx), CheckerOutcome::NoMaintenance);
    }

    #[test]
    fn an_invalid_copy_blocks_any_deletion() {
        let mut entry = BucketDbEntry::new(BucketId::new(16, 1));
        entry.copies.push(BucketCopy::new(0, BucketInfo::default()));
        entry.copies.push(BucketCopy::invalid(1));

        let db = InMemoryBucketDatabase::new();
        let dist = flat_distribution(4, 2);
        let cs = ClusterState::new(1);
        let config = DistributorConfig::default();
        let clock = ManualClock::new(0);
        let features = HashMap::new();
        let ctx = context_for(&entry, &db, &dist, &cs, &config, &clock, &features);

        assert_eq!(DeleteExtraCopiesChecker.check(&ctx), CheckerOutcome::NoMaintenance);
    }

    #[test]
    fn active_non_ideal_copy_is_never_deleted_even_when_redundant() {
        let bucket = BucketId::new(16, 1);
        let dist = flat_distribution(6, 2);
        let cs = ClusterState::new(1);
        let ideal = dist.ideal_nodes(vds_model::NodeType::Storage, &cs, bucket, "uimr").unwrap();

        let mut entry = BucketDbEntry::new(bucket);
        for &n in &ideal {
            entry.copies.push(BucketCopy::new(n, BucketInfo { meta_count: 1, ..Default::default() }));
        }
        let extra: Vec<u16> = (0..6u16).filter(|n| !ideal.contains(n)).take(1).collect();
        let mut active_copy = BucketCopy::new(extra[0], BucketInfo { meta_count: 1, ..Default::default() });
        active_copy.active = true;
        entry.copies.push(active_copy);

        let db = InMemoryBucketDatabase::new();
        let config = DistributorConfig::default();
        let clock = ManualClock::new(0);
        let features = HashMap::new();
        let ctx = context_for(&entry, &db, &dist, &cs, &config, &clock, &features);

        assert_eq!(DeleteExtraCopiesChecker.check(&ctx), CheckerOutcome::NoMaintenance);
    }

    #[test]
    fn empty_non_ideal_copy_is_deleted_regardless_of_redundancy_slack() {
        let bucket = BucketId::new(16, 1);
        let dist = flat_distribution(6, 2);
        let cs = ClusterState::new(1);
        let ideal = dist.ideal_nodes(vds_model::NodeType::Storage, &cs, bucket, "uimr").unwrap();

        // Only one ideal copy present, below redundancy(2), so without the
        // unconditional empty-copy rule the kept-count gate alone would
        // keep every non-ideal copy around.
        let mut entry = BucketDbEntry::new(bucket);
        entry.copies.push(BucketCopy::new(ideal[0], BucketInfo { meta_count: 1, ..Default::default() }));
        let extra: Vec<u16> = (0..6u16).filter(|n| !ideal.contains(n)).take(2).collect();
        let mut sorted_extra = extra.clone();
        sorted_extra.sort_unstable();
        entry.copies.push(BucketCopy::new(sorted_extra[0], BucketInfo::default()));
        entry.copies.push(BucketCopy::new(sorted_extra[1], BucketInfo { meta_count: 1, ..Default::default() }));

        let db = InMemoryBucketDatabase::new();
        let config = DistributorConfig::default();
        let clock = ManualClock::new(0);
        let features = HashMap::new();
        let ctx = context_for(&entry, &db, &dist, &cs, &config, &clock, &features);

        match DeleteExtraCopiesChecker.check(&ctx) {
            CheckerOutcome::Stored { operation: MaintenanceOperation::DeleteExtraCopies { nodes, .. }, priority } => {
                assert_eq!(nodes, vec![sorted_extra[0]]);
                assert_eq!(priority, SchedulePriority::High);
            }
            other => panic!("expected a deletion, got {other:?}"),
        }
    }

    #[test]
    fn inconsistent_entry_keeps_non_empty_non_ideal_copies() {
        let bucket = BucketId::new(16, 1);
        let dist = flat_distribution(6, 2);
        let cs = ClusterState::new(1);
        let ideal = dist.ideal_nodes(vds_model::NodeType::Storage, &cs, bucket, "uimr").unwrap();

        let mut entry = BucketDbEntry::new(bucket);
        for &n in &ideal {
            entry.copies.push(BucketCopy::new(n, BucketInfo { checksum: 1, meta_count: 1, ..Default::default() }));
        }
        let extra: Vec<u16> = (0..6u16).filter(|n| !ideal.contains(n)).take(1).collect();
        // Differing checksum makes the whole entry internally inconsistent.
        entry.copies.push(BucketCopy::new(extra[0], BucketInfo { checksum: 2, meta_count: 1, ..Default::default() }));

        let db = InMemoryBucketDatabase::new();
        let config = DistributorConfig::default();
        let clock = ManualClock::new(0);
        let features = HashMap::new();
        let ctx = context_for(&entry, &db, &dist, &cs, &config, &clock, &features);

        assert_eq!(DeleteExtraCopiesChecker.check(&ctx), CheckerOutcome::NoMaintenance);
    }

    #[test]
    fn ideal_node_in_maintenance_blocks_deletion() {
        let bucket = BucketId::new(16, 1);
        let dist = flat_distribution(4, 2);
        let mut cs = ClusterState::new(1);
        let ideal = dist.ideal_nodes(vds_model::NodeType::Storage, &cs, bucket, "uimr").unwrap();
        cs.set_node_state(vds_model::Node::storage(ideal[0]), vds_model::NodeState::new(State::Maintenance));

        let mut entry = BucketDbEntry::new(bucket);
        entry.copies.push(BucketCopy::new(0, BucketInfo::default()));
        entry.copies.push(BucketCopy::new(1, BucketInfo::default()));

        let db = InMemoryBucketDatabase::new();
        let config = DistributorConfig::default();
        let clock = ManualClock::new(0);
        let features = HashMap::new();
        let ctx = context_for(&entry, &db, &dist, &cs, &config, &clock, &features);

        assert_eq!(DeleteExtraCopiesChecker.check(&ctx), CheckerOutcome::NoMaintenance);
    }
}
