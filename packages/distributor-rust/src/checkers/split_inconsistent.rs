//! Resolves an inconsistently split bucket tree — more than one bucket
//! database entry covering the same logical range at different split
//! depths — by splitting the least-split entry up to match the others.

use super::{CheckerContext, CheckerOutcome, StateChecker};
use crate::messages::{MaintenanceOperation, SchedulePriority};

pub struct SplitInconsistentBucketsChecker;

impl StateChecker for SplitInconsistentBucketsChecker {
    fn name(&self) -> &'static str {
        "SplitInconsistentBuckets"
    }

    fn check(&self, ctx: &CheckerContext<'_>) -> CheckerOutcome {
        let overlapping = ctx.db.entries_overlapping(&ctx.bucket_id);
        if overlapping.len() <= 1 {
            return CheckerOutcome::NoMaintenance;
        }

        // Ties (two entries at the same minimal used-bits) are broken by
        // ascending raw id so exactly one of them ever claims the split —
        // map-iteration order alone isn't a stable enough tie-break.
        let least_split = overlapping
            .iter()
            .min_by_key(|e| (e.bucket_id.used_bits(), e.bucket_id.raw_id()))
            .expect("non-empty: checked above");
        if least_split.bucket_id != ctx.bucket_id {
            return CheckerOutcome::NoMaintenance;
        }

        let highest_bits = overlapping.iter().map(|e| e.bucket_id.used_bits()).max().expect("non-empty: checked above");
        CheckerOutcome::Stored {
            operation: MaintenanceOperation::SplitBucket { bucket_id: ctx.bucket_id, split_to_bits: highest_bits },
            priority: SchedulePriority::High,
        }
    }
}
