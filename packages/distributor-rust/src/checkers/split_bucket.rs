//! Splits a bucket that has grown too large, or that hasn't yet been split
//! down to the configured minimum.

use vds_model::BucketId;

use super::{CheckerContext, CheckerOutcome, StateChecker};
use crate::messages::{MaintenanceOperation, SchedulePriority};

pub struct SplitBucketChecker;

impl StateChecker for SplitBucketChecker {
    fn name(&self) -> &'static str {
        "SplitBucket"
    }

    fn check(&self, ctx: &CheckerContext<'_>) -> CheckerOutcome {
        if ctx.entry.node_count() == 0 || ctx.bucket_id.used_bits() >= BucketId::MAX_USED_BITS {
            return CheckerOutcome::NoMaintenance;
        }

        let cfg = ctx.config;
        let bytes_ratio = ratio(ctx.entry.highest_total_document_size(), cfg.split_size_bytes);
        let docs_ratio = ratio(u64::from(ctx.entry.highest_document_count()), u64::from(cfg.split_count_docs));
        let meta_ratio = ratio(u64::from(ctx.entry.highest_meta_count()) / 2, u64::from(cfg.split_meta_count));
        let file_ratio = ratio(ctx.entry.highest_used_file_size() / 2, cfg.split_file_size_bytes);
        let max_ratio = [bytes_ratio, docs_ratio, meta_ratio, file_ratio].into_iter().fold(0.0_f64, f64::max);

        if max_ratio > 1.0 {
            return CheckerOutcome::Stored {
                operation: MaintenanceOperation::SplitBucket { bucket_id: ctx.bucket_id, split_to_bits: BucketId::MAX_USED_BITS },
                priority: SchedulePriority::High,
            };
        }

        if ctx.bucket_id.used_bits() < cfg.minimal_split_bits {
            return CheckerOutcome::Stored {
                operation: MaintenanceOperation::SplitBucket { bucket_id: ctx.bucket_id, split_to_bits: cfg.minimal_split_bits },
                priority: SchedulePriority::Medium,
            };
        }

        CheckerOutcome::NoMaintenance
    }
}

fn ratio(value: u64, threshold: u64) -> f64 {
    if threshold == 0 {
        if value > 0 {
            f64::INFINITY
        } else {
            0.0
        }
    } else {
        value as f64 / threshold as f64
    }
}
