//! The hierarchical group tree ([`Group`]) and the per-child redundancy
//! spread rule ([`RedundancyGroupDistribution`]) used to decide how many
//! copies each subtree gets.

use std::collections::BTreeMap;

use crate::error::ConfigError;

/// A `N|M|*|*|...` redundancy spread: a fixed per-child copy count for the
/// leading entries, with trailing `*` entries (stored as `0`) absorbing
/// whatever redundancy remains.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RedundancyGroupDistribution {
    /// `0` marks an asterisk slot.
    values: Vec<u16>,
}

impl RedundancyGroupDistribution {
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        if spec.is_empty() {
            return Ok(Self { values: Vec::new() });
        }
        let tokens: Vec<&str> = spec.split('|').collect();
        let mut seen_asterisk = false;
        for &token in &tokens {
            if token == "*" {
                seen_asterisk = true;
                continue;
            }
            if seen_asterisk {
                return Err(ConfigError::InvalidDistributionSpec {
                    spec: spec.to_string(),
                    reason: "asterisk specifications must trail the spec",
                });
            }
            let n: u32 = token.parse().map_err(|_| ConfigError::InvalidDistributionSpec {
                spec: spec.to_string(),
                reason: "token isn't asterisk or number",
            })?;
            if n == 0 || n >= 256 {
                return Err(ConfigError::InvalidDistributionSpec {
                    spec: spec.to_string(),
                    reason: "copy counts must be in the range 1-255",
                });
            }
        }
        let values = tokens
            .into_iter()
            .map(|t| if t == "*" { 0 } else { t.parse().unwrap_or(0) })
            .collect();
        Ok(Self { values })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn first_asterisk_index(&self) -> Result<usize, ConfigError> {
        if self.values.is_empty() || *self.values.last().unwrap() != 0 {
            return Err(ConfigError::InvalidDistributionSpec {
                spec: self.to_string(),
                reason: "no asterisk entries found",
            });
        }
        let mut first = self.values.len() - 1;
        while first > 0 && self.values[first - 1] == 0 {
            first -= 1;
        }
        Ok(first)
    }

    /// Expands this spec for a concrete `redundancy` budget: non-asterisk
    /// slots fill to their bound first, then asterisks divide the
    /// remainder round-robin, and the result is sorted descending so the
    /// most-replicated child is always first.
    pub fn expand(&self, mut redundancy: u16) -> Self {
        if redundancy <= self.len() as u16 {
            return Self { values: vec![1; redundancy as usize] };
        }
        let Ok(first_asterisk) = self.first_asterisk_index() else {
            // No asterisk: every slot just gets 1 copy plus whatever a
            // round-robin distributes, capped by nothing (legacy callers
            // only ever reach here with a well-formed spec).
            let mut values = vec![1u16; self.len()];
            redundancy -= self.len() as u16;
            divide_specified_copies(&mut values, 0, self.len(), redundancy, &self.values);
            values.sort_unstable_by(|a, b| b.cmp(a));
            return Self { values };
        };
        let mut values = vec![1u16; self.len()];
        redundancy -= self.len() as u16;
        let remaining = divide_specified_copies(&mut values, 0, first_asterisk, redundancy, &self.values);
        divide_specified_copies(&mut values, first_asterisk, self.len(), remaining, &self.values);
        values.sort_unstable_by(|a, b| b.cmp(a));
        Self { values }
    }

    pub fn values(&self) -> &[u16] {
        &self.values
    }
}

/// Round-robins `redundancy` extra copies across `[start, end)`, respecting
/// each slot's bound (`0` in `max_values` means unbounded, i.e. an
/// asterisk). Returns whatever could not be placed (always 0 unless every
/// slot in range is bounded and full).
fn divide_specified_copies(values: &mut [u16], start: usize, end: usize, mut redundancy: u16, max_values: &[u16]) -> u16 {
    loop {
        let before = redundancy;
        for i in start..end {
            if redundancy == 0 {
                break;
            }
            if max_values[i] == 0 || values[i] < max_values[i] {
                values[i] += 1;
                redundancy -= 1;
            }
        }
        if redundancy == 0 || redundancy == before {
            break;
        }
    }
    redundancy
}

impl std::fmt::Display for RedundancyGroupDistribution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .values
            .iter()
            .map(|&v| if v == 0 { "*".to_string() } else { v.to_string() })
            .collect();
        write!(f, "{}", parts.join("|"))
    }
}

/// A node of the hierarchical distribution tree: either a leaf holding a
/// sorted set of storage/distributor node indices, or a branch holding
/// ordered child groups plus the [`RedundancyGroupDistribution`] spec that
/// decides how redundancy splits across them.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Group {
    pub index: u16,
    pub name: String,
    pub capacity: f64,
    pub distribution_hash: u32,
    kind: GroupKind,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
enum GroupKind {
    Leaf { nodes: Vec<u16> },
    Branch { children: BTreeMap<u16, Group>, spec: RedundancyGroupDistribution },
}

const ROOT_HASH_SEED: u32 = 0x8bad_f00d;

impl Group {
    pub fn leaf(index: u16, name: impl Into<String>, mut nodes: Vec<u16>) -> Self {
        nodes.sort_unstable();
        Self {
            index,
            name: name.into(),
            capacity: 1.0,
            distribution_hash: 0,
            kind: GroupKind::Leaf { nodes },
        }
    }

    pub fn branch(index: u16, name: impl Into<String>, spec: RedundancyGroupDistribution) -> Self {
        Self {
            index,
            name: name.into(),
            capacity: 1.0,
            distribution_hash: 0,
            kind: GroupKind::Branch { children: BTreeMap::new(), spec },
        }
    }

    pub fn with_capacity(mut self, capacity: f64) -> Result<Self, ConfigError> {
        self.set_capacity(capacity)?;
        Ok(self)
    }

    pub fn set_capacity(&mut self, capacity: f64) -> Result<(), ConfigError> {
        if capacity <= 0.0 {
            return Err(ConfigError::InvalidGroup(format!(
                "group {} capacity must be positive, got {capacity}",
                self.index
            )));
        }
        self.capacity = capacity;
        Ok(())
    }

    pub fn add_child(&mut self, child: Group) -> Result<(), ConfigError> {
        match &mut self.kind {
            GroupKind::Branch { children, .. } => {
                children.insert(child.index, child);
                Ok(())
            }
            GroupKind::Leaf { .. } => Err(ConfigError::InvalidGroup(format!(
                "cannot add a child group to leaf group {}",
                self.index
            ))),
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, GroupKind::Leaf { .. })
    }

    pub fn nodes(&self) -> &[u16] {
        match &self.kind {
            GroupKind::Leaf { nodes } => nodes,
            GroupKind::Branch { .. } => &[],
        }
    }

    pub fn children(&self) -> Vec<&Group> {
        match &self.kind {
            GroupKind::Branch { children, .. } => children.values().collect(),
            GroupKind::Leaf { .. } => Vec::new(),
        }
    }

    pub fn distribution_spec(&self) -> Option<&RedundancyGroupDistribution> {
        match &self.kind {
            GroupKind::Branch { spec, .. } => Some(spec),
            GroupKind::Leaf { .. } => None,
        }
    }

    /// Recomputes `distribution_hash` for this group and every descendant,
    /// seeded from the traditional constant at the root. Must be called
    /// after the tree is fully built (and any time its shape changes).
    pub fn calculate_distribution_hash_values(&mut self) {
        self.calculate_distribution_hash_values_from(ROOT_HASH_SEED);
    }

    fn calculate_distribution_hash_values_from(&mut self, parent_hash: u32) {
        self.distribution_hash = parent_hash ^ hash_step(self.index, parent_hash);
        if let GroupKind::Branch { children, .. } = &mut self.kind {
            for child in children.values_mut() {
                child.calculate_distribution_hash_values_from(self.distribution_hash);
            }
        }
    }

    /// Finds the leaf group owning `node_index`, if any.
    pub fn group_for_node(&self, node_index: u16) -> Option<&Group> {
        match &self.kind {
            GroupKind::Leaf { nodes } => nodes.contains(&node_index).then_some(self),
            GroupKind::Branch { children, .. } => children.values().find_map(|c| c.group_for_node(node_index)),
        }
    }

    /// Every node index anywhere under this group, leaves collected
    /// depth-first. Used by whole-group-ownership-transfer checks, which
    /// need every distributor in a subtree, not just one leaf's worth.
    pub fn all_node_indices(&self) -> Vec<u16> {
        let mut out = Vec::new();
        self.collect_all_node_indices(&mut out);
        out
    }

    fn collect_all_node_indices(&self, out: &mut Vec<u16>) {
        match &self.kind {
            GroupKind::Leaf { nodes } => out.extend_from_slice(nodes),
            GroupKind::Branch { children, .. } => {
                for child in children.values() {
                    child.collect_all_node_indices(out);
                }
            }
        }
    }

    /// A flat `node_index -> leaf group index` map, used for O(1) lookups
    /// (e.g. [`crate::distribution::Distribution::split_into_leaf_groups`]).
    pub fn build_node_to_group_index(&self, out: &mut BTreeMap<u16, u16>) {
        match &self.kind {
            GroupKind::Leaf { nodes } => {
                for &n in nodes {
                    out.insert(n, self.index);
                }
            }
            GroupKind::Branch { children, .. } => {
                for child in children.values() {
                    child.build_node_to_group_index(out);
                }
            }
        }
    }
}

/// `hash = 1664525 * index + 1013904223`, XORed against the parent hash
/// by the caller (root is seeded with `ROOT_HASH_SEED` in place of a
/// parent hash).
fn hash_step(index: u16, _parent_hash: u32) -> u32 {
    let value = 1_664_525u64
        .wrapping_mul(u64::from(index))
        .wrapping_add(1_013_904_223);
    value as u32
}
