//! Error types for the data model and placement algorithm.
//!
//! Parse and placement failures are modeled as typed [`thiserror::Error`]
//! enums rather than panics; only malformed configuration at construction
//! time is allowed to abort a process, and even that surfaces as a
//! `Result` for the caller to decide on.

use crate::node::NodeType;

/// Failures constructing or parsing a [`crate::distribution::Distribution`],
/// [`crate::group::Group`], or [`crate::state::NodeState`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid state token: {0}")]
    InvalidState(String),

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("{field} must be in [{low}, {high}], got {value}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        low: f64,
        high: f64,
    },

    #[error("state {state} is not valid for node type {node_type}")]
    InvalidStateForNodeType {
        state: &'static str,
        node_type: NodeType,
    },

    #[error("illegal distribution spec \"{spec}\": {reason}")]
    InvalidDistributionSpec { spec: String, reason: &'static str },

    #[error("group validation failed: {0}")]
    InvalidGroup(String),

    #[error("malformed cluster state string: {0}")]
    MalformedClusterState(String),
}

/// Failures from the ideal-node placement algorithm
/// ([`crate::distribution::Distribution::ideal_nodes`]).
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone, Copy)]
pub enum PlacementError {
    #[error("bucket has fewer used-bits ({bucket_bits}) than the cluster's distribution-bit count ({distribution_bits})")]
    TooFewBucketBits {
        bucket_bits: u8,
        distribution_bits: u8,
    },

    #[error("no distributors are available in any group")]
    NoDistributorsAvailable,
}
