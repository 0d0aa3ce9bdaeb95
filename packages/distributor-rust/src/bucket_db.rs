//! The bucket database: a `bucket-id -> replica-list` map with a
//! child-count query, treated as an external collaborator per the spec's
//! scope but given a reference in-memory implementation here so the
//! checker pipeline and merge throttler can be exercised end-to-end.

use dashmap::DashMap;
use vds_model::{BucketDbEntry, BucketId};

/// Pluggable storage for bucket replica metadata, mirroring the teacher's
/// split between a trait boundary and a default in-memory engine
/// ([`crate::storage`] in the original, here a single flat trait since
/// there is no multi-layer record-store architecture to mirror).
pub trait BucketDatabase: Send + Sync {
    fn get(&self, id: &BucketId) -> Option<BucketDbEntry>;
    fn put(&self, entry: BucketDbEntry);
    fn remove(&self, id: &BucketId);
    fn contains(&self, id: &BucketId) -> bool;

    /// Number of buckets in the database that are direct children of
    /// `id` in the split tree (used by the single-bucket join path).
    fn child_count(&self, id: &BucketId) -> usize;

    /// All entries whose bucket id's logical range overlaps `id` at any
    /// split depth, used to detect an inconsistently split bucket (more
    /// than one entry for the same logical range at different depths).
    fn entries_overlapping(&self, id: &BucketId) -> Vec<BucketDbEntry>;
}

/// `DashMap`-backed reference implementation, mirroring the teacher's
/// `storage::engines::HashMapStorage` default.
#[derive(Debug, Default)]
pub struct InMemoryBucketDatabase {
    entries: DashMap<BucketId, BucketDbEntry>,
}

impl InMemoryBucketDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn all_bucket_ids(&self) -> Vec<BucketId> {
        self.entries.iter().map(|e| *e.key()).collect()
    }
}

impl BucketDatabase for InMemoryBucketDatabase {
    fn get(&self, id: &BucketId) -> Option<BucketDbEntry> {
        self.entries.get(id).map(|e| e.clone())
    }

    fn put(&self, entry: BucketDbEntry) {
        self.entries.insert(entry.bucket_id, entry);
    }

    fn remove(&self, id: &BucketId) {
        self.entries.remove(id);
    }

    fn contains(&self, id: &BucketId) -> bool {
        self.entries.contains_key(id)
    }

    fn child_count(&self, id: &BucketId) -> usize {
        let Some((low, high)) = id.children() else { return 0 };
        usize::from(self.entries.contains_key(&low)) + usize::from(self.entries.contains_key(&high))
    }

    fn entries_overlapping(&self, id: &BucketId) -> Vec<BucketDbEntry> {
        self.entries
            .iter()
            .filter(|e| e.key().contains(id) || id.contains(e.key()))
            .map(|e| e.value().clone())
            .collect()
    }
}
