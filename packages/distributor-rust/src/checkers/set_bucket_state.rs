//! Decides which replica of a bucket should be the active (query-serving)
//! copy, per leaf group when the distribution spreads activation across
//! groups, or globally otherwise.

use std::cmp::Reverse;

use vds_model::{BucketCopy, Group, Node, State};

use super::{CheckerContext, CheckerOutcome, StateChecker};
use crate::messages::{MaintenanceOperation, SchedulePriority};

pub struct SetBucketStateChecker;

impl StateChecker for SetBucketStateChecker {
    fn name(&self) -> &'static str {
        "SetBucketState"
    }

    fn check(&self, ctx: &CheckerContext<'_>) -> CheckerOutcome {
        if ctx.config.activation_disabled || ctx.entry.node_count() == 0 || ctx.is_inconsistently_split() {
            return CheckerOutcome::NoMaintenance;
        }

        let ideal = ctx.ideal_storage_nodes();
        let mut activate = Vec::new();
        let mut deactivate = Vec::new();
        let mut inhibited_groups = 0usize;

        if ctx.distribution.active_per_group {
            for leaf in leaf_groups(ctx.distribution.root()) {
                let candidates: Vec<&BucketCopy> = ctx.entry.copies.iter().filter(|c| leaf.nodes().contains(&c.node)).collect();
                if candidates.is_empty() {
                    continue;
                }
                if !decide_group(ctx, &ideal, &candidates, &mut activate, &mut deactivate, &mut inhibited_groups) {
                    return CheckerOutcome::NoMaintenance;
                }
            }
        } else {
            let candidates: Vec<&BucketCopy> = ctx.entry.copies.iter().collect();
            if !decide_group(ctx, &ideal, &candidates, &mut activate, &mut deactivate, &mut inhibited_groups) {
                return CheckerOutcome::NoMaintenance;
            }
        }

        if activate.is_empty() && deactivate.is_empty() {
            return CheckerOutcome::NoMaintenance;
        }

        CheckerOutcome::Stored {
            operation: MaintenanceOperation::SetBucketState { bucket_id: ctx.bucket_id, activate, deactivate },
            priority: SchedulePriority::Highest,
        }
    }
}

fn leaf_groups(group: &Group) -> Vec<&Group> {
    if group.is_leaf() {
        vec![group]
    } else {
        group.children().into_iter().flat_map(leaf_groups).collect()
    }
}

/// `(not-ready, highest document count first, closest-to-ideal, already
/// active, lowest node index)` — the tie-break chain that decides which
/// candidate within one group wins activation.
fn score_key(ideal: &[u16], c: &BucketCopy) -> (bool, Reverse<u32>, usize, bool, u16) {
    let ideal_index = ideal.iter().position(|&n| n == c.node).unwrap_or(usize::MAX);
    (!c.ready, Reverse(c.info.document_count), ideal_index, !c.active, c.node)
}

/// Decides activation for one group's candidates. Returns `false` when the
/// whole operation (across every group, not just this one) must be
/// abandoned — the Maintenance/not-ready/no-exemption rule below is a
/// global abort, not a per-group skip, since activating any group while
/// that ideal node is unreachable would still force background indexing
/// on the eventual winner.
fn decide_group(
    ctx: &CheckerContext<'_>,
    ideal: &[u16],
    candidates: &[&BucketCopy],
    activate: &mut Vec<u16>,
    deactivate: &mut Vec<u16>,
    inhibited_groups: &mut usize,
) -> bool {
    let eligible: Vec<&BucketCopy> = candidates
        .iter()
        .copied()
        .filter(|c| {
            let state = ctx.cluster_state.node_state(Node::storage(c.node)).state;
            if state == State::Maintenance {
                return false;
            }
            c.ready || ctx.features_for(c.node).no_implicit_indexing_of_active_buckets
        })
        .collect();

    if eligible.is_empty() {
        return true;
    }

    let best = eligible.iter().min_by_key(|c| score_key(ideal, c)).copied().expect("eligible is non-empty");

    if ctx.any_ideal_node_in_state(State::Maintenance)
        && !best.ready
        && !ctx.features_for(best.node).no_implicit_indexing_of_active_buckets
    {
        return false;
    }

    if let Some(majority) = ctx.entry.majority_consistent_bucket_info() {
        let inhibitor_enabled = ctx.config.max_activation_inhibited_out_of_sync_groups > 0;
        if inhibitor_enabled && !best.info.equal_document_info(&majority) && *inhibited_groups < ctx.config.max_activation_inhibited_out_of_sync_groups {
            *inhibited_groups += 1;
            return true;
        }
    }

    for c in candidates {
        if c.node == best.node {
            if !c.active {
                activate.push(c.node);
            }
        } else if c.active {
            deactivate.push(c.node);
        }
    }
    true
}
