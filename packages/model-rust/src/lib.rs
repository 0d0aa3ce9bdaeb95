//! `vds-model` -- cluster state, distribution topology, and bucket data
//! model for the content cluster control plane.
//!
//! - **Node** ([`node`]): participant identity (`NodeType`, `Node`)
//! - **State** ([`state`]): the seven-state node lifecycle and [`state::NodeState`]
//! - **Bucket** ([`bucket`]): bucket identity and replica bookkeeping (`BucketId`, `BucketDbEntry`)
//! - **Group** ([`group`]): the hierarchical distribution tree and redundancy spread rule
//! - **Distribution** ([`distribution`]): ideal-node placement over the group tree
//! - **ClusterState** ([`cluster_state`]): the versioned per-node state snapshot
//! - **ClusterStateBundle** ([`cluster_state_bundle`]): baseline + per-bucket-space overrides
//! - **Features** ([`features`]): optional node capabilities consulted by the checker pipeline
//! - **PRNG** ([`prng`]): the deterministic generator placement scoring is built on
//! - **Error** ([`error`]): typed failures for parsing, config, and placement

pub mod bucket;
pub mod cluster_state;
pub mod cluster_state_bundle;
pub mod distribution;
pub mod error;
pub mod features;
pub mod group;
pub mod node;
pub mod prng;
pub mod state;

pub use bucket::{BucketCopy, BucketDbEntry, BucketId, BucketInfo};
pub use cluster_state::ClusterState;
pub use cluster_state_bundle::{ClusterStateBundle, FeedBlock};
pub use distribution::Distribution;
pub use error::{ConfigError, PlacementError};
pub use features::NodeSupportedFeatures;
pub use group::{Group, RedundancyGroupDistribution};
pub use node::{Node, NodeType};
pub use prng::LehmerRandom;
pub use state::{NodeState, State};
