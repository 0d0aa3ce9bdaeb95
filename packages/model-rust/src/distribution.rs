//! Hierarchical distribution topology and the ideal-node placement
//! algorithm: [`Distribution::ideal_nodes`].
//!
//! Placement is a deterministic, seeded weighted-random walk down the group
//! tree: every bucket maps to a 32-bit seed, every group/node combines that
//! seed with its own precomputed `distribution_hash` to draw a score, and
//! the highest-scoring candidates win. The whole thing is pure and
//! stateless — the same `(Distribution, ClusterState, BucketId)` triple
//! always yields the same ordered node list, on any process, forever.

use std::collections::BTreeMap;

use crate::bucket::BucketId;
use crate::cluster_state::ClusterState;
use crate::error::PlacementError;
use crate::group::Group;
use crate::node::{Node, NodeType};
use crate::prng::LehmerRandom;

/// The full distribution configuration: the group tree plus the knobs that
/// govern how a bucket's ideal replica set is computed from it.
///
/// Immutable once built; any change to redundancy, flags, or the tree shape
/// produces a new `Distribution`. `serialized_config` is the raw
/// configuration text and is what equality and identity are defined over —
/// two configs that parse to structurally different trees are never equal
/// even if the final node assignment happens to coincide.
#[derive(Debug, Clone)]
pub struct Distribution {
    pub redundancy: u16,
    pub initial_redundancy: u16,
    pub ready_copies: u16,
    pub active_per_group: bool,
    pub ensure_primary_persisted: bool,
    pub whole_group_ownership_transfer: bool,
    root: Group,
    node_to_group: BTreeMap<u16, u16>,
    serialized_config: String,
}

impl Distribution {
    pub fn new(
        mut root: Group,
        redundancy: u16,
        initial_redundancy: u16,
        ready_copies: u16,
        active_per_group: bool,
        ensure_primary_persisted: bool,
        whole_group_ownership_transfer: bool,
        serialized_config: impl Into<String>,
    ) -> Self {
        root.calculate_distribution_hash_values();
        let mut node_to_group = BTreeMap::new();
        root.build_node_to_group_index(&mut node_to_group);
        Self {
            redundancy,
            initial_redundancy,
            ready_copies,
            active_per_group,
            ensure_primary_persisted,
            whole_group_ownership_transfer,
            root,
            node_to_group,
            serialized_config: serialized_config.into(),
        }
    }

    pub fn root(&self) -> &Group {
        &self.root
    }

    pub fn serialized_config(&self) -> &str {
        &self.serialized_config
    }

    pub fn group_for_node(&self, node_index: u16) -> Option<u16> {
        self.node_to_group.get(&node_index).copied()
    }

    /// The preferred replica placement for `bucket_id`, deterministic given
    /// the triple of `(self, cluster_state, bucket_id)`.
    ///
    /// `up_states` is a mask of serialized state characters a node must be
    /// in to count toward redundancy (e.g. `"ui"` for Up+Initializing).
    /// Fails with [`PlacementError::TooFewBucketBits`] if the bucket hasn't
    /// been split down to at least the cluster's distribution-bit count,
    /// and with [`PlacementError::NoDistributorsAvailable`] for distributor
    /// placement when literally no group has an eligible node.
    pub fn ideal_nodes(
        &self,
        node_type: NodeType,
        cluster_state: &ClusterState,
        bucket_id: BucketId,
        up_states: &str,
    ) -> Result<Vec<u16>, PlacementError> {
        let distribution_bits = cluster_state.distribution_bit_count();
        if bucket_id.used_bits() < distribution_bits {
            return Err(PlacementError::TooFewBucketBits {
                bucket_bits: bucket_id.used_bits(),
                distribution_bits,
            });
        }
        let bucket_seed = bucket_seed(node_type, bucket_id, distribution_bits);
        match node_type {
            NodeType::Distributor => self.ideal_distributor_nodes(cluster_state, bucket_seed, up_states),
            NodeType::Storage => Ok(self.ideal_storage_nodes(cluster_state, bucket_seed, up_states)),
        }
    }

    fn ideal_distributor_nodes(
        &self,
        cluster_state: &ClusterState,
        bucket_seed: u32,
        up_states: &str,
    ) -> Result<Vec<u16>, PlacementError> {
        let leaf = self
            .pick_distributor_leaf(&self.root, bucket_seed, cluster_state, up_states)
            .ok_or(PlacementError::NoDistributorsAvailable)?;
        let mut scored = score_leaf_nodes(leaf, bucket_seed, cluster_state, NodeType::Distributor, up_states);
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        let nodes: Vec<u16> = scored.into_iter().map(|(n, _)| n).collect();
        if nodes.is_empty() {
            return Err(PlacementError::NoDistributorsAvailable);
        }
        Ok(nodes)
    }

    /// Walks down from `group`, at each branch trying children in
    /// score-descending order and falling through to the next-best sibling
    /// when a subtree has no node that satisfies `up_states`.
    ///
    /// When `whole_group_ownership_transfer` is set, a child branch is
    /// skipped outright (never descended into, regardless of score) unless
    /// every distributor anywhere under it is `Up` or `Initializing` — a
    /// single `Down`/`Maintenance`/etc. distributor in the subtree cedes
    /// the whole group's ownership to the next candidate, not just the
    /// individual down node's share of it.
    fn pick_distributor_leaf<'a>(
        &self,
        group: &'a Group,
        bucket_seed: u32,
        cluster_state: &ClusterState,
        up_states: &str,
    ) -> Option<&'a Group> {
        if group.is_leaf() {
            let has_eligible = group.nodes().iter().any(|&n| {
                cluster_state
                    .node_state(Node::distributor(n))
                    .state
                    .one_of(up_states)
            });
            return has_eligible.then_some(group);
        }
        for child in ranked_children(group, bucket_seed) {
            if self.whole_group_ownership_transfer && !group_distributors_all_up_or_initializing(child, cluster_state) {
                continue;
            }
            if let Some(leaf) = self.pick_distributor_leaf(child, bucket_seed, cluster_state, up_states) {
                return Some(leaf);
            }
        }
        None
    }

    /// Storage placement never fails to produce *some* candidate list
    /// (callers decide whether the result satisfies enough redundancy);
    /// trimming by reliability happens once, over the whole flattened
    /// candidate order.
    fn ideal_storage_nodes(&self, cluster_state: &ClusterState, bucket_seed: u32, up_states: &str) -> Vec<u16> {
        let mut candidates = Vec::new();
        collect_storage_candidates(&self.root, bucket_seed, self.redundancy, cluster_state, up_states, &mut candidates);
        trim_by_reliability(candidates, cluster_state, NodeType::Storage, self.redundancy)
    }
}

/// Whether every distributor node anywhere under `group` is `Up` or
/// `Initializing`. A group with no nodes at all is vacuously eligible —
/// there is nothing down to cede ownership away from.
fn group_distributors_all_up_or_initializing(group: &Group, cluster_state: &ClusterState) -> bool {
    group.all_node_indices().iter().all(|&n| {
        matches!(
            cluster_state.node_state(Node::distributor(n)).state,
            crate::state::State::Up | crate::state::State::Initializing
        )
    })
}

/// `raw_id` masked to `distribution_bits`; for storage lookups on buckets
/// split past 33 used-bits, the next `used_bits - 1 - 32` bits are folded
/// in at bit 6 so that siblings sharing the low 32 bits still diverge.
fn bucket_seed(node_type: NodeType, bucket_id: BucketId, distribution_bits: u8) -> u32 {
    let mask: u32 = if distribution_bits >= 32 {
        u32::MAX
    } else {
        (1u32 << distribution_bits) - 1
    };
    #[allow(clippy::cast_possible_truncation)]
    let mut seed = (bucket_id.raw_id() as u32) & mask;
    if node_type == NodeType::Storage && bucket_id.used_bits() > 33 {
        let extra_bit_count = bucket_id.used_bits() - 1 - 32;
        let extra = (bucket_id.raw_id() >> 32) & ((1u64 << extra_bit_count) - 1);
        #[allow(clippy::cast_possible_truncation)]
        let extra = extra as u32;
        seed ^= extra << 6;
    }
    seed
}

/// Draws one double per entry of `indices` from a single generator seeded
/// with `seed`, skipping forward (burning dummy draws) over any index gap
/// so that the draw for index `k` never depends on which other indices are
/// actually present — only on `k` itself.
fn skip_forward_draws(seed: u32, indices: &[u16]) -> Vec<f64> {
    let mut rng = LehmerRandom::new(seed);
    let mut last = -1i32;
    let mut draws = Vec::with_capacity(indices.len());
    for &idx in indices {
        let idx = i32::from(idx);
        for _ in 0..(idx - last - 1) {
            rng.next_double();
        }
        draws.push(rng.next_double());
        last = idx;
    }
    draws
}

/// Children of `group` ranked by capacity-weighted score, highest first.
/// The group-level seed is `bucket_seed XOR child.distribution_hash`
/// (the parent's own hash is already folded into each child's
/// precomputed hash, so no additional XOR against the parent is needed
/// here).
fn ranked_children(group: &Group, bucket_seed: u32) -> Vec<&Group> {
    let children = group.children();
    let indices: Vec<u16> = children.iter().map(|c| c.index).collect();
    let draws = skip_forward_draws(bucket_seed, &indices);
    let mut scored: Vec<(&Group, f64)> = children
        .into_iter()
        .zip(draws)
        .map(|(child, draw)| (child, draw.powf(1.0 / child.capacity.max(f64::MIN_POSITIVE))))
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.into_iter().map(|(g, _)| g).collect()
}

/// Nodes of a leaf group ranked by capacity-weighted score (capacity taken
/// from the node's own reported [`crate::state::NodeState`], not the
/// group's), highest first. Nodes whose resolved state isn't one of
/// `up_states` are never candidates at all — filtered before drawing, not
/// after, though the draw for a surviving node still only depends on its
/// own absolute index (the skip-forward draw sequence is keyed by index,
/// not list position).
fn score_leaf_nodes(
    group: &Group,
    bucket_seed: u32,
    cluster_state: &ClusterState,
    node_type: NodeType,
    up_states: &str,
) -> Vec<(u16, f64)> {
    let indices: Vec<u16> = group
        .nodes()
        .iter()
        .copied()
        .filter(|&n| cluster_state.node_state(Node::new(node_type, n)).state.one_of(up_states))
        .collect();
    let draws = skip_forward_draws(bucket_seed ^ group.distribution_hash, &indices);
    indices
        .into_iter()
        .zip(draws)
        .map(|(n, draw)| {
            let capacity = cluster_state.node_state(Node::new(node_type, n)).capacity;
            (n, draw.powf(1.0 / capacity.max(f64::MIN_POSITIVE)))
        })
        .collect()
}

/// Recursively walks the tree assigning each branch's children a share of
/// `budget` nodes via its [`crate::group::RedundancyGroupDistribution`],
/// handed out in score-descending order (best-scoring child gets the
/// largest share), and at each leaf appends its top-`budget` nodes by
/// score to `out`.
fn collect_storage_candidates(
    group: &Group,
    bucket_seed: u32,
    budget: u16,
    cluster_state: &ClusterState,
    up_states: &str,
    out: &mut Vec<u16>,
) {
    if budget == 0 {
        return;
    }
    if group.is_leaf() {
        let mut scored = score_leaf_nodes(group, bucket_seed, cluster_state, NodeType::Storage, up_states);
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        // One extra candidate beyond the assigned share gives the final
        // reliability trim room to skip a retired pick without starving
        // this group's contribution.
        out.extend(scored.into_iter().take(budget as usize + 1).map(|(n, _)| n));
        return;
    }
    let ranked = ranked_children(group, bucket_seed);
    let Some(spec) = group.distribution_spec() else { return };
    let expanded = spec.expand(budget);
    for (child, &share) in ranked.into_iter().zip(expanded.values()) {
        collect_storage_candidates(child, bucket_seed ^ child.distribution_hash, share, cluster_state, up_states, out);
    }
}

/// A node already known to satisfy `up_states` counts as 1 toward the
/// cumulative reliability total, unless it is `Retired` — then it
/// contributes 0: present as a placement candidate worth keeping around,
/// but not enough on its own to satisfy the redundancy bound.
fn reliability(node_type: NodeType, node_index: u16, cluster_state: &ClusterState) -> u16 {
    u16::from(cluster_state.node_state(Node::new(node_type, node_index)).state != crate::state::State::Retired)
}

/// Forward pass keeps candidates until cumulative reliability meets
/// `redundancy`; backward pass then drops any kept candidate whose removal
/// still leaves the cumulative total at or above `redundancy`, so the
/// final list is as short as it can be while still satisfying the bound.
fn trim_by_reliability(
    candidates: Vec<u16>,
    cluster_state: &ClusterState,
    node_type: NodeType,
    redundancy: u16,
) -> Vec<u16> {
    let mut kept = Vec::new();
    let mut cumulative = 0u16;
    for n in candidates {
        let r = reliability(node_type, n, cluster_state);
        kept.push(n);
        cumulative += r;
        if cumulative >= redundancy {
            break;
        }
    }
    let mut i = kept.len();
    while i > 0 {
        i -= 1;
        let r = reliability(node_type, kept[i], cluster_state);
        if r > 0 && cumulative - r >= redundancy {
            cumulative -= r;
            kept.remove(i);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::RedundancyGroupDistribution;
    use crate::node::NodeType;
    use crate::state::{NodeState, State};

    fn flat_distribution(node_count: u16, redundancy: u16) -> Distribution {
        let root = Group::leaf(0, "root", (0..node_count).collect());
        Distribution::new(root, redundancy, redundancy, redundancy, false, false, true, "test")
    }

    fn two_group_distribution(redundancy: u16) -> Distribution {
        let mut root = Group::branch(0, "root", RedundancyGroupDistribution::parse("*|*").unwrap());
        root.add_child(Group::leaf(0, "rack0", vec![0, 1, 2])).unwrap();
        root.add_child(Group::leaf(1, "rack1", vec![3, 4, 5])).unwrap();
        Distribution::new(root, redundancy, redundancy, redundancy, true, false, true, "test")
    }

    #[test]
    fn determinism_same_inputs_same_output() {
        let dist = flat_distribution(10, 3);
        let cs = ClusterState::new(1);
        let bucket = BucketId::new(16, 0xabcd);
        let a = dist.ideal_nodes(NodeType::Storage, &cs, bucket, "ui").unwrap();
        let b = dist.ideal_nodes(NodeType::Storage, &cs, bucket, "ui").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn redundancy_bound_is_respected() {
        let dist = flat_distribution(10, 3);
        let cs = ClusterState::new(1);
        for raw in 0..50u64 {
            let bucket = BucketId::new(16, raw);
            let nodes = dist.ideal_nodes(NodeType::Storage, &cs, bucket, "ui").unwrap();
            assert!(nodes.len() <= 3, "{} nodes for bucket {raw}", nodes.len());
        }
    }

    #[test]
    fn too_few_bucket_bits_is_rejected() {
        let dist = flat_distribution(10, 3);
        let cs = ClusterState::new(1);
        let bucket = BucketId::new(8, 1);
        let err = dist.ideal_nodes(NodeType::Storage, &cs, bucket, "ui").unwrap_err();
        assert_eq!(
            err,
            PlacementError::TooFewBucketBits { bucket_bits: 8, distribution_bits: 16 }
        );
    }

    #[test]
    fn split_across_two_leaf_groups_stays_within_redundancy() {
        let dist = two_group_distribution(4);
        let cs = ClusterState::new(1);
        let bucket = BucketId::new(16, 777);
        let nodes = dist.ideal_nodes(NodeType::Storage, &cs, bucket, "ui").unwrap();
        assert!(nodes.len() <= 4);
        let rack0: Vec<_> = nodes.iter().filter(|&&n| n < 3).collect();
        let rack1: Vec<_> = nodes.iter().filter(|&&n| n >= 3).collect();
        assert!(!rack0.is_empty() && !rack1.is_empty());
    }

    #[test]
    fn retired_nodes_do_not_satisfy_redundancy_alone() {
        let dist = flat_distribution(3, 2);
        let mut cs = ClusterState::new(1);
        cs.set_node_state(Node::storage(0), NodeState::new(State::Retired));
        let bucket = BucketId::new(16, 1);
        let nodes = dist.ideal_nodes(NodeType::Storage, &cs, bucket, "uir").unwrap();
        let reliable_count = nodes
            .iter()
            .filter(|&&n| cs.node_state(Node::storage(n)).state != State::Retired)
            .count();
        assert!(reliable_count >= 2 || nodes.len() == 3);
    }

    #[test]
    fn distributor_selection_fails_when_no_group_has_an_up_node() {
        let dist = flat_distribution(2, 1);
        let mut cs = ClusterState::new(1);
        cs.set_node_state(Node::distributor(0), NodeState::new(State::Down));
        cs.set_node_state(Node::distributor(1), NodeState::new(State::Down));
        let bucket = BucketId::new(16, 5);
        let err = dist.ideal_nodes(NodeType::Distributor, &cs, bucket, "u").unwrap_err();
        assert_eq!(err, PlacementError::NoDistributorsAvailable);
    }

    #[test]
    fn ownership_transfers_to_the_next_group_when_the_best_is_all_down() {
        let dist = two_group_distribution(1);
        let mut cs = ClusterState::new(1);
        cs.set_node_state(Node::distributor(0), NodeState::new(State::Down));
        cs.set_node_state(Node::distributor(1), NodeState::new(State::Down));
        cs.set_node_state(Node::distributor(2), NodeState::new(State::Down));
        let bucket = BucketId::new(16, 42);
        let nodes = dist.ideal_nodes(NodeType::Distributor, &cs, bucket, "u").unwrap();
        assert!(!nodes.is_empty());
        assert!(nodes.iter().all(|&n| n >= 3));
    }

    #[test]
    fn whole_group_ownership_transfer_skips_a_group_with_even_one_down_distributor() {
        // rack0 (nodes 0,1,2) has a single down distributor; the other two
        // are up. With the flag set this must still cede the whole group
        // to rack1 rather than place into rack0's remaining up nodes.
        let dist = two_group_distribution(1);
        let mut cs = ClusterState::new(1);
        cs.set_node_state(Node::distributor(0), NodeState::new(State::Down));
        let bucket = BucketId::new(16, 42);
        let nodes = dist.ideal_nodes(NodeType::Distributor, &cs, bucket, "u").unwrap();
        assert!(!nodes.is_empty());
        assert!(nodes.iter().all(|&n| n >= 3), "expected rack1 only, got {nodes:?}");
    }

    #[test]
    fn without_whole_group_ownership_transfer_a_partially_down_group_still_places_into_it() {
        let mut root = Group::branch(0, "root", RedundancyGroupDistribution::parse("*|*").unwrap());
        root.add_child(Group::leaf(0, "rack0", vec![0, 1, 2])).unwrap();
        root.add_child(Group::leaf(1, "rack1", vec![3, 4, 5])).unwrap();
        let dist = Distribution::new(root, 1, 1, 1, true, false, false, "test");
        let mut cs = ClusterState::new(1);
        cs.set_node_state(Node::distributor(0), NodeState::new(State::Down));
        let bucket = BucketId::new(16, 42);
        let nodes = dist.ideal_nodes(NodeType::Distributor, &cs, bucket, "u").unwrap();
        assert!(!nodes.is_empty());
        assert!(!nodes.contains(&0), "down node must never be a candidate");
    }
}
