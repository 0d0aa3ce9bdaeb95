//! The small set of optional capabilities a node can declare it supports,
//! consulted by the state-checker pipeline when deciding whether an
//! operation is safe (e.g. whether activating a not-ready copy would force
//! background indexing on that node).

/// Immutable, copy-on-write: updates replace the whole value rather than
/// flipping individual bits in place, since a feature set only ever changes
/// as a whole unit when a node reports new capabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NodeSupportedFeatures {
    pub unordered_merge_chaining: bool,
    pub two_phase_remove_location: bool,
    pub no_implicit_indexing_of_active_buckets: bool,
}

impl NodeSupportedFeatures {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self {
            unordered_merge_chaining: true,
            two_phase_remove_location: true,
            no_implicit_indexing_of_active_buckets: true,
        }
    }

    /// The union of two reports: a capability is supported once any report
    /// we've seen from the node has claimed it, even across reconnects.
    pub fn union(self, other: Self) -> Self {
        Self {
            unordered_merge_chaining: self.unordered_merge_chaining || other.unordered_merge_chaining,
            two_phase_remove_location: self.two_phase_remove_location || other.two_phase_remove_location,
            no_implicit_indexing_of_active_buckets: self.no_implicit_indexing_of_active_buckets
                || other.no_implicit_indexing_of_active_buckets,
        }
    }
}
