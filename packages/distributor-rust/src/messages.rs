//! Wire-compatible message types for the merge-throttler and its
//! surrounding protocol: [`MergeBucketCommand`], the reply codes a peer or
//! persistence can send back, and the maintenance operations the
//! state-checker pipeline emits.
//!
//! These model the payload a transport would carry; no transport is
//! wired up here (see the crate-level docs).

use serde::{Deserialize, Serialize};
use vds_model::BucketId;

/// One participant of a merge: its node index plus whether it only
/// contributes data and is not a replica target once the merge completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeNode {
    pub index: u16,
    pub source_only: bool,
}

impl MergeNode {
    pub fn new(index: u16, source_only: bool) -> Self {
        Self { index, source_only }
    }

    pub fn target(index: u16) -> Self {
        Self::new(index, false)
    }
}

/// A merge operation in flight, as it travels the storage node chain.
///
/// `chain` accumulates the nodes that have already forwarded this exact
/// command; it is empty on first send from the distributor and grows by
/// one entry per hop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeBucketCommand {
    pub bucket_id: BucketId,
    pub nodes: Vec<MergeNode>,
    pub max_timestamp: u64,
    pub cluster_state_version: u32,
    pub chain: Vec<u16>,
    pub priority: u8,
    pub timeout_ms: u32,
}

impl MergeBucketCommand {
    pub fn new(bucket_id: BucketId, nodes: Vec<MergeNode>, cluster_state_version: u32, priority: u8, timeout_ms: u32) -> Self {
        Self {
            bucket_id,
            nodes,
            max_timestamp: 0,
            cluster_state_version,
            chain: Vec::new(),
            priority,
            timeout_ms,
        }
    }

    /// Node indices that are replica targets after the merge completes,
    /// ascending by index: the canonical forwarding chain.
    pub fn target_nodes(&self) -> Vec<u16> {
        let mut targets: Vec<u16> = self.nodes.iter().filter(|n| !n.source_only).map(|n| n.index).collect();
        targets.sort_unstable();
        targets
    }

    pub fn contains_node(&self, index: u16) -> bool {
        self.nodes.iter().any(|n| n.index == index)
    }

    pub fn is_source_only(&self, index: u16) -> bool {
        self.nodes.iter().any(|n| n.index == index && n.source_only)
    }

    /// A command forwarded one hop further: the chain gains `from`, all
    /// other fields (priority, version, timeout) are preserved untouched.
    pub fn forwarded_from(&self, from: u16) -> Self {
        let mut next = self.clone();
        next.chain.push(from);
        next
    }
}

/// Outcome of a `receive()` call or a persistence round-trip.
///
/// `WrongDistribution` is the only variant that carries data: the local
/// cluster-state version the sender should retry against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "code", content = "data")]
pub enum ReplyCode {
    Ok,
    Busy,
    WrongDistribution { local_version: u32 },
    Rejected,
    Aborted,
    NotConnected,
    MessageIgnored,
}

impl ReplyCode {
    pub fn is_ok(self) -> bool {
        matches!(self, ReplyCode::Ok)
    }
}

/// A reply to a [`MergeBucketCommand`], carrying the human-readable reason
/// a rejection happened for — logs and status pages want this even though
/// the [`ReplyCode`] alone is enough to drive retry logic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeReply {
    pub code: ReplyCode,
    pub reason: String,
}

impl MergeReply {
    pub fn ok() -> Self {
        Self { code: ReplyCode::Ok, reason: String::new() }
    }

    pub fn new(code: ReplyCode, reason: impl Into<String>) -> Self {
        Self { code, reason: reason.into() }
    }

    pub fn busy(reason: impl Into<String>) -> Self {
        Self::new(ReplyCode::Busy, reason)
    }

    pub fn wrong_distribution(local_version: u32) -> Self {
        Self::new(ReplyCode::WrongDistribution { local_version }, "cluster state version mismatch")
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::new(ReplyCode::Rejected, reason)
    }

    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::new(ReplyCode::Aborted, reason)
    }
}

/// A sibling request that must be checked against the active-merge set
/// before it is allowed to reach persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiblingRequestKind {
    GetBucketDiff,
    ApplyBucketDiff,
}

/// Published by the controller when the cluster state advances;
/// everything queued or active for a stale version must drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetSystemState {
    pub new_version: u32,
}

/// Which logical partition of the bucket space a bucket belongs to.
/// Affects merge scheduling priority (the global space must not starve
/// behind default-space churn).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BucketSpace {
    Default,
    Global,
}

impl BucketSpace {
    pub fn tag(self) -> &'static str {
        match self {
            BucketSpace::Default => "default",
            BucketSpace::Global => "global",
        }
    }
}

/// The scheduling priority a checker attaches to its emitted operation.
/// Ordered so the highest-priority variant compares greatest; the
/// pipeline keeps whichever checker's result has the greatest priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SchedulePriority {
    VeryLow,
    Low,
    Medium,
    High,
    VeryHigh,
    Highest,
}

/// A corrective maintenance operation a state checker emits for one
/// bucket: the thing the distributor actually dispatches (as a
/// `MergeBucketCommand`, a split request, etc.) once a checker wins the
/// pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "operation")]
pub enum MaintenanceOperation {
    SplitBucket { bucket_id: BucketId, split_to_bits: u8 },
    JoinBuckets { sources: Vec<BucketId>, target: BucketId },
    MergeBucket { bucket_id: BucketId, nodes: Vec<MergeNode> },
    DeleteExtraCopies { bucket_id: BucketId, nodes: Vec<u16> },
    SetBucketState { bucket_id: BucketId, activate: Vec<u16>, deactivate: Vec<u16> },
    GarbageCollection { bucket_id: BucketId },
}
