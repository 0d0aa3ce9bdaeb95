//! Bucket identity and the per-bucket replica bookkeeping the distributor
//! reasons about: [`BucketId`], [`BucketCopy`], and [`BucketDbEntry`].

use std::fmt;

/// A bucket identifier: a raw 64-bit id plus a used-bits count in `[1, 58]`
/// that says how many of the top bits of `raw_id` actually identify the
/// bucket. A bucket with `u` used bits is the parent of exactly two buckets
/// with `u + 1` used bits (its children in the split tree).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct BucketId {
    used_bits: u8,
    raw_id: u64,
}

impl BucketId {
    pub const MIN_USED_BITS: u8 = 1;
    pub const MAX_USED_BITS: u8 = 58;

    /// Builds a bucket id, masking `raw_id` down to its `used_bits` most
    /// significant bits and stamping the used-bits count into the low
    /// byte the way the reference implementation packs it.
    pub fn new(used_bits: u8, raw_id: u64) -> Self {
        let masked = mask_to_used_bits(used_bits, raw_id);
        Self { used_bits, raw_id: masked }
    }

    pub fn used_bits(&self) -> u8 {
        self.used_bits
    }

    /// The raw identifier, already masked to `used_bits`.
    pub fn raw_id(&self) -> u64 {
        self.raw_id
    }

    /// A single `u64` suitable as a hash-table key: the reference
    /// implementation packs `used_bits` into bit 58 onward; we keep the
    /// two fields separate internally but expose this for callers that
    /// want a flat key.
    pub fn packed_id(&self) -> u64 {
        (self.raw_id) | (u64::from(self.used_bits) << 58)
    }

    /// The two buckets one level down the split tree: `(used_bits + 1,
    /// raw_id)` and `(used_bits + 1, raw_id | 1 << used_bits)`.
    pub fn children(&self) -> Option<(BucketId, BucketId)> {
        if self.used_bits >= Self::MAX_USED_BITS {
            return None;
        }
        let child_bits = self.used_bits + 1;
        let low = BucketId::new(child_bits, self.raw_id);
        let high = BucketId::new(child_bits, self.raw_id | (1u64 << self.used_bits));
        Some((low, high))
    }

    /// The single bucket one level up the split tree, dropping the top
    /// used bit.
    pub fn parent(&self) -> Option<BucketId> {
        if self.used_bits <= Self::MIN_USED_BITS {
            return None;
        }
        Some(BucketId::new(self.used_bits - 1, self.raw_id))
    }

    /// `true` if this bucket is the "first" (low) sibling of its pair: the
    /// bit just below `used_bits` is 0.
    pub fn is_first_sibling(&self) -> bool {
        (self.raw_id & (1u64 << (self.used_bits - 1))) == 0
    }

    /// `true` if `self` and `other` refer to the same logical path, i.e.
    /// one is a prefix-compatible ancestor/descendant/equal of the other.
    pub fn contains(&self, other: &BucketId) -> bool {
        if self.used_bits > other.used_bits {
            return false;
        }
        mask_to_used_bits(self.used_bits, other.raw_id) == self.raw_id
    }
}

fn mask_to_used_bits(used_bits: u8, raw_id: u64) -> u64 {
    if used_bits >= 64 {
        raw_id
    } else {
        raw_id & ((1u64 << used_bits) - 1)
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BucketId({}, 0x{:x})", self.used_bits, self.raw_id)
    }
}

/// Replica-level statistics reported by persistence for one copy of a
/// bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BucketInfo {
    pub checksum: u32,
    pub document_count: u32,
    pub total_document_size: u64,
    pub meta_count: u32,
    pub used_file_size: u64,
}

impl BucketInfo {
    /// Whether two infos describe the same document content (ignoring
    /// file-size/meta bookkeeping, which can legitimately differ across
    /// replicas without the content differing).
    pub fn equal_document_info(&self, other: &BucketInfo) -> bool {
        self.checksum == other.checksum && self.document_count == other.document_count
    }
}

/// One replica of a bucket as known to the distributor: where it lives and
/// what state it reports itself to be in.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BucketCopy {
    pub node: u16,
    pub info: BucketInfo,
    pub trusted: bool,
    pub ready: bool,
    pub active: bool,
    /// A copy reported with no valid checksum at all — e.g. the node
    /// hasn't scanned the bucket yet.
    pub valid: bool,
}

impl BucketCopy {
    pub fn new(node: u16, info: BucketInfo) -> Self {
        Self {
            node,
            info,
            trusted: false,
            ready: false,
            active: false,
            valid: true,
        }
    }

    pub fn invalid(node: u16) -> Self {
        Self {
            node,
            info: BucketInfo::default(),
            trusted: false,
            ready: false,
            active: false,
            valid: false,
        }
    }

    pub fn empty(&self) -> bool {
        self.info.meta_count == 0
    }
}

/// Everything the distributor knows about one logical bucket: its replica
/// set plus garbage-collection and provisional-copy bookkeeping.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BucketDbEntry {
    pub bucket_id: BucketId,
    pub copies: Vec<BucketCopy>,
    pub last_garbage_collection_time: u64,
    /// Set briefly after a bucket is first created so state-checkers don't
    /// race ahead and delete/join it before any replica has had a chance
    /// to receive data.
    pub recently_created_empty_copy: bool,
}

impl BucketDbEntry {
    pub fn new(bucket_id: BucketId) -> Self {
        Self {
            bucket_id,
            copies: Vec::new(),
            last_garbage_collection_time: 0,
            recently_created_empty_copy: false,
        }
    }

    pub fn node_count(&self) -> usize {
        self.copies.len()
    }

    pub fn nodes(&self) -> Vec<u16> {
        self.copies.iter().map(|c| c.node).collect()
    }

    pub fn get_node(&self, node: u16) -> Option<&BucketCopy> {
        self.copies.iter().find(|c| c.node == node)
    }

    pub fn has_invalid_copy(&self) -> bool {
        self.copies.iter().any(|c| !c.valid)
    }

    pub fn highest_meta_count(&self) -> u32 {
        self.copies.iter().map(|c| c.info.meta_count).max().unwrap_or(0)
    }

    pub fn highest_document_count(&self) -> u32 {
        self.copies.iter().map(|c| c.info.document_count).max().unwrap_or(0)
    }

    pub fn highest_total_document_size(&self) -> u64 {
        self.copies.iter().map(|c| c.info.total_document_size).max().unwrap_or(0)
    }

    pub fn highest_used_file_size(&self) -> u64 {
        self.copies.iter().map(|c| c.info.used_file_size).max().unwrap_or(0)
    }

    /// `true` if the bucket has no replicas at all and no created-empty
    /// grace flag, i.e. it is truly empty and safe to reclaim.
    pub fn empty_and_consistent(&self) -> bool {
        self.copies.is_empty() || (self.highest_meta_count() == 0 && !self.recently_created_empty_copy)
    }

    /// All *valid* copies agree on checksum.
    pub fn valid_and_consistent(&self) -> bool {
        let mut reference: Option<u32> = None;
        for copy in &self.copies {
            if !copy.valid {
                continue;
            }
            match reference {
                None => reference = Some(copy.info.checksum),
                Some(checksum) if checksum != copy.info.checksum => return false,
                Some(_) => {}
            }
        }
        true
    }

    /// The [`BucketInfo`] shared by a strict majority of copies, if any,
    /// used to decide which out-of-sync replica is "the" correct one when
    /// inhibiting activation.
    pub fn majority_consistent_bucket_info(&self) -> Option<BucketInfo> {
        if self.copies.is_empty() {
            return None;
        }
        let mut counts: Vec<(BucketInfo, usize)> = Vec::new();
        for copy in &self.copies {
            if let Some(entry) = counts.iter_mut().find(|(info, _)| info.equal_document_info(&copy.info)) {
                entry.1 += 1;
            } else {
                counts.push((copy.info, 1));
            }
        }
        let majority_threshold = self.copies.len() / 2 + 1;
        counts
            .into_iter()
            .find(|(_, count)| *count >= majority_threshold)
            .map(|(info, _)| info)
    }
}
