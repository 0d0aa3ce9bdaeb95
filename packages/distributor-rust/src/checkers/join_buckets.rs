//! Joins a bucket back into its sibling (or parent, for a childless single
//! bucket) once both sides have shrunk enough that keeping them split is no
//! longer worth the bucket-count overhead.

use vds_model::BucketId;

use super::{CheckerContext, CheckerOutcome, StateChecker};
use crate::messages::{MaintenanceOperation, SchedulePriority};

pub struct JoinBucketsChecker;

impl StateChecker for JoinBucketsChecker {
    fn name(&self) -> &'static str {
        "JoinBuckets"
    }

    fn check(&self, ctx: &CheckerContext<'_>) -> CheckerOutcome {
        let cfg = ctx.config;
        let entry = ctx.entry;
        let node_count = entry.node_count();
        let min_allowed_bits = ctx.cluster_state.distribution_bit_count().max(cfg.minimal_split_bits);

        if node_count == 0
            || node_count as u16 > ctx.redundancy()
            || (cfg.join_size_bytes == 0 && cfg.join_count == 0)
            || ctx.bucket_id.used_bits() <= min_allowed_bits
            || entry.recently_created_empty_copy
        {
            return CheckerOutcome::NoMaintenance;
        }

        if ctx.bucket_id.is_first_sibling() {
            if let Some(outcome) = try_sibling_join(ctx) {
                return outcome;
            }
        }

        if cfg.enable_join_for_single_bucket {
            if let Some(outcome) = try_single_bucket_join(ctx, min_allowed_bits) {
                return outcome;
            }
        }

        CheckerOutcome::NoMaintenance
    }
}

fn try_sibling_join(ctx: &CheckerContext<'_>) -> Option<CheckerOutcome> {
    let parent = ctx.bucket_id.parent()?;
    let (_low, sibling_id) = parent.children()?;
    let sibling = ctx.db.get(&sibling_id)?;

    if !sibling.valid_and_consistent() || !ctx.entry.valid_and_consistent() {
        return None;
    }

    let mut ours = ctx.entry.nodes();
    let mut theirs = sibling.nodes();
    ours.sort_unstable();
    theirs.sort_unstable();

    let same_nodes = ours == theirs;
    let both_match_ideal = {
        let mut ideal = ctx.ideal_storage_nodes();
        ideal.sort_unstable();
        ours == ideal && theirs == ideal
    };
    if !(same_nodes || (ctx.config.enable_inconsistent_join && both_match_ideal)) {
        return None;
    }

    let combined_file_size = ctx.entry.highest_used_file_size() + sibling.highest_used_file_size();
    let combined_meta_count = ctx.entry.highest_meta_count() + sibling.highest_meta_count();
    if combined_file_size >= ctx.config.join_size_bytes || u64::from(combined_meta_count) >= u64::from(ctx.config.join_count) {
        return None;
    }

    Some(CheckerOutcome::Stored {
        operation: MaintenanceOperation::JoinBuckets { sources: vec![ctx.bucket_id, sibling_id], target: parent },
        priority: SchedulePriority::Low,
    })
}

fn try_single_bucket_join(ctx: &CheckerContext<'_>, min_allowed_bits: u8) -> Option<CheckerOutcome> {
    let mut target = ctx.bucket_id.parent()?;
    if ctx.db.child_count(&target) != 1 {
        return None;
    }
    loop {
        let Some(grandparent) = target.parent() else { break };
        if grandparent.used_bits() < min_allowed_bits {
            break;
        }
        if ctx.db.child_count(&grandparent) == 1 {
            target = grandparent;
        } else {
            break;
        }
    }

    Some(CheckerOutcome::Stored {
        operation: MaintenanceOperation::JoinBuckets { sources: vec![ctx.bucket_id], target },
        priority: SchedulePriority::VeryLow,
    })
}
