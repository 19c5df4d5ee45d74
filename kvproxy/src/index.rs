//! In-memory longest-common-prefix index over cache entries.
//!
//! A trie keyed by block signatures, one subtree per model id. Every node
//! records the save ids whose fingerprint passes through it, so a lookup
//! walks the request's signatures to the divergence point and reads the
//! candidate set off the deepest node reached. A single reader-writer
//! lock over the whole structure is adequate at the expected catalog
//! size; lookups share it, admissions and evictions take it exclusively.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::fingerprint::{BlockSig, Fingerprint};
use crate::meta::CacheEntry;

#[derive(Debug, Default)]
struct TrieNode {
    children: HashMap<BlockSig, TrieNode>,
    /// Save ids of entries whose fingerprint passes through this node.
    entries: HashSet<String>,
}

#[derive(Debug, Default)]
struct IndexInner {
    /// One trie root per model id.
    tries: HashMap<String, TrieNode>,
    entries: HashMap<String, CacheEntry>,
}

/// A lookup result: the best reusable entry and how much of the request's
/// fingerprint it covers.
#[derive(Debug, Clone)]
pub struct PrefixMatch {
    pub entry: CacheEntry,
    pub matched_blocks: usize,
    pub ratio: f64,
}

/// Point-in-time lookup counters, read off the index for the stats
/// endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl IndexStats {
    pub fn hit_rate(&self) -> f64 {
        match self.hits + self.misses {
            0 => 0.0,
            total => self.hits as f64 / total as f64,
        }
    }
}

#[derive(Debug, Default)]
pub struct LcpIndex {
    inner: RwLock<IndexInner>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl LcpIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            entries: self.inner.read().entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    pub fn entry(&self, save_id: &str) -> Option<CacheEntry> {
        self.inner.read().entries.get(save_id).cloned()
    }

    /// Snapshot of every entry, for the janitor's enumeration passes.
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.inner.read().entries.values().cloned().collect()
    }

    /// Insert an entry, replacing any previous entry with the same save id.
    pub fn insert(&self, entry: CacheEntry) {
        let mut inner = self.inner.write();
        Self::detach(&mut inner, &entry.save_id);

        let root = inner.tries.entry(entry.model.clone()).or_default();
        let mut node = root;
        for sig in &entry.signatures {
            node = node.children.entry(*sig).or_default();
            node.entries.insert(entry.save_id.clone());
        }
        inner.entries.insert(entry.save_id.clone(), entry);
    }

    /// Remove an entry and prune its now-empty trie path. Counted as an
    /// eviction when the entry existed.
    pub fn remove(&self, save_id: &str) -> Option<CacheEntry> {
        let mut inner = self.inner.write();
        let removed = Self::detach(&mut inner, save_id);
        if removed.is_some() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Refresh an entry's recency; used on hits.
    pub fn touch(&self, save_id: &str, ts: u64) {
        let mut inner = self.inner.write();
        if let Some(entry) = inner.entries.get_mut(save_id) {
            entry.last_used_at = ts;
        }
    }

    /// Best entry under `model` sharing a block prefix with `fingerprint`,
    /// subject to the similarity threshold. Equally-long matches tie-break
    /// on most recent use.
    pub fn lookup(
        &self,
        model: &str,
        fingerprint: &Fingerprint,
        threshold: f64,
    ) -> Option<PrefixMatch> {
        if fingerprint.is_empty() {
            return None;
        }

        let inner = self.inner.read();
        let result = Self::walk(&inner, model, fingerprint, threshold);
        match &result {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    fn walk(
        inner: &IndexInner,
        model: &str,
        fingerprint: &Fingerprint,
        threshold: f64,
    ) -> Option<PrefixMatch> {
        let root = inner.tries.get(model)?;

        let mut node = root;
        let mut depth = 0usize;
        for sig in &fingerprint.signatures {
            match node.children.get(sig) {
                Some(child) => {
                    node = child;
                    depth += 1;
                }
                None => break,
            }
        }
        if depth == 0 {
            return None;
        }

        let ratio = depth as f64 / fingerprint.blocks() as f64;
        if ratio < threshold {
            return None;
        }

        node.entries
            .iter()
            .filter_map(|id| inner.entries.get(id))
            .max_by_key(|e| e.last_used_at)
            .map(|entry| PrefixMatch {
                entry: entry.clone(),
                matched_blocks: depth,
                ratio,
            })
    }

    fn detach(inner: &mut IndexInner, save_id: &str) -> Option<CacheEntry> {
        let entry = inner.entries.remove(save_id)?;
        if let Some(root) = inner.tries.get_mut(&entry.model) {
            Self::prune(root, &entry.signatures, save_id);
            if root.children.is_empty() {
                inner.tries.remove(&entry.model);
            }
        }
        Some(entry)
    }

    /// Drop `save_id` from the path below `node`, removing child nodes
    /// that end up with no entries.
    fn prune(node: &mut TrieNode, path: &[BlockSig], save_id: &str) {
        let Some((sig, rest)) = path.split_first() else {
            return;
        };
        if let Some(child) = node.children.get_mut(sig) {
            child.entries.remove(save_id);
            Self::prune(child, rest, save_id);
            if child.entries.is_empty() {
                node.children.remove(sig);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint;

    fn entry(save_id: &str, model: &str, text: &str, last_used_at: u64) -> CacheEntry {
        let fp = fingerprint(text, 4);
        CacheEntry {
            save_id: save_id.to_string(),
            model: model.to_string(),
            signatures: fp.signatures,
            word_count: fp.word_count,
            created_at: last_used_at,
            last_used_at,
            bytes_on_disk: None,
        }
    }

    #[test]
    fn test_exact_match() {
        let index = LcpIndex::new();
        index.insert(entry("e1", "m", "a b c d e f g h", 1));

        let fp = fingerprint("a b c d e f g h", 4);
        let m = index.lookup("m", &fp, 0.5).unwrap();
        assert_eq!(m.entry.save_id, "e1");
        assert_eq!(m.matched_blocks, 2);
        assert_eq!(m.ratio, 1.0);
    }

    #[test]
    fn test_partial_match_meets_threshold() {
        let index = LcpIndex::new();
        index.insert(entry("e1", "m", "a b c d e f g h", 1));

        // 3 request blocks, 2 shared: ratio 2/3.
        let fp = fingerprint("a b c d e f g h x y z w", 4);
        let m = index.lookup("m", &fp, 0.5).unwrap();
        assert_eq!(m.entry.save_id, "e1");
        assert_eq!(m.matched_blocks, 2);
        assert!((m.ratio - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_below_threshold_misses() {
        let index = LcpIndex::new();
        index.insert(entry("e1", "m", "a b c d", 1));

        // 1 shared block out of 3: ratio 1/3 < 0.5.
        let fp = fingerprint("a b c d x y z w p q r s", 4);
        assert!(index.lookup("m", &fp, 0.5).is_none());
        // A laxer threshold accepts it.
        assert!(index.lookup("m", &fp, 0.3).is_some());
    }

    #[test]
    fn test_cross_model_isolation() {
        let index = LcpIndex::new();
        index.insert(entry("e1", "m", "a b c d e f g h", 1));

        let fp = fingerprint("a b c d e f g h", 4);
        assert!(index.lookup("other", &fp, 0.5).is_none());
        assert!(index.lookup("m", &fp, 0.5).is_some());
    }

    #[test]
    fn test_tie_break_most_recent() {
        let index = LcpIndex::new();
        index.insert(entry("old", "m", "a b c d e f g h", 10));
        index.insert(entry("new", "m", "a b c d e f g h", 20));

        let fp = fingerprint("a b c d e f g h", 4);
        let m = index.lookup("m", &fp, 0.5).unwrap();
        assert_eq!(m.entry.save_id, "new");

        index.touch("old", 30);
        let m = index.lookup("m", &fp, 0.5).unwrap();
        assert_eq!(m.entry.save_id, "old");
    }

    #[test]
    fn test_longest_prefix_wins() {
        let index = LcpIndex::new();
        index.insert(entry("short", "m", "a b c d", 99));
        index.insert(entry("long", "m", "a b c d e f g h", 1));

        // The request extends past the short entry; the deepest node only
        // holds the long one.
        let fp = fingerprint("a b c d e f g h", 4);
        let m = index.lookup("m", &fp, 0.5).unwrap();
        assert_eq!(m.entry.save_id, "long");
        assert_eq!(m.matched_blocks, 2);
    }

    #[test]
    fn test_empty_fingerprint_never_matches() {
        let index = LcpIndex::new();
        index.insert(entry("e1", "m", "a b c d", 1));

        let fp = fingerprint("a b", 4);
        assert!(fp.is_empty());
        assert!(index.lookup("m", &fp, 0.0).is_none());
    }

    #[test]
    fn test_remove_then_miss() {
        let index = LcpIndex::new();
        index.insert(entry("e1", "m", "a b c d e f g h", 1));
        assert_eq!(index.len(), 1);

        let removed = index.remove("e1").unwrap();
        assert_eq!(removed.save_id, "e1");
        assert!(index.is_empty());

        let fp = fingerprint("a b c d e f g h", 4);
        assert!(index.lookup("m", &fp, 0.5).is_none());
        assert_eq!(index.stats().evictions, 1);
    }

    #[test]
    fn test_remove_missing_is_none() {
        let index = LcpIndex::new();
        assert!(index.remove("ghost").is_none());
        assert_eq!(index.stats().evictions, 0);
    }

    #[test]
    fn test_insert_same_id_replaces() {
        let index = LcpIndex::new();
        index.insert(entry("e1", "m", "a b c d", 1));
        index.insert(entry("e1", "m", "x y z w", 2));
        assert_eq!(index.len(), 1);

        let old = fingerprint("a b c d", 4);
        assert!(index.lookup("m", &old, 0.5).is_none());
        let new = fingerprint("x y z w", 4);
        assert!(index.lookup("m", &new, 0.5).is_some());
    }

    #[test]
    fn test_prune_keeps_siblings() {
        let index = LcpIndex::new();
        index.insert(entry("e1", "m", "a b c d e f g h", 1));
        index.insert(entry("e2", "m", "a b c d x y z w", 1));

        index.remove("e1");

        let fp = fingerprint("a b c d x y z w", 4);
        let m = index.lookup("m", &fp, 0.5).unwrap();
        assert_eq!(m.entry.save_id, "e2");
        assert_eq!(m.matched_blocks, 2);
    }

    #[test]
    fn test_stats_counts() {
        let index = LcpIndex::new();
        index.insert(entry("e1", "m", "a b c d", 1));

        let hit = fingerprint("a b c d", 4);
        let miss = fingerprint("p q r s", 4);
        index.lookup("m", &hit, 0.5);
        index.lookup("m", &miss, 0.5);

        let stats = index.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_hit_rate_empty_index() {
        let index = LcpIndex::new();
        assert_eq!(index.stats().hit_rate(), 0.0);
        assert_eq!(index.stats(), IndexStats::default());
    }
}
