//! The translation cache ("TLB"): a bounded, LRU-evicted, multi-indexed
//! cache of recent successful translations.
//!
//! The primary structure is an intrusive doubly-linked list (MRU at the
//! head) stored in a slot array, plus a `CacheKey -> slot` hash map. Three
//! secondary indices (by StreamID, by (StreamID, PASID), by SecurityDomain)
//! make selective invalidation O(k) in the number of affected entries
//! instead of O(N) in cache size (spec.md §9's explicit design note).

use std::collections::{HashMap, HashSet};
use std::hash::{BuildHasherDefault, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::types::{Error, Pasid, PagePermissions, Result, SecurityDomain, Stage, StreamId, PASID_MAX, STREAM_ID_MAX};

/// FNV-1a mixer over the four `CacheKey` fields. A `HashMap` keyed on the
/// raw page number alone would waste its low `granule_shift` bits (always
/// zero); this folds StreamID, PASID, and SecurityDomain into the mix too,
/// per spec.md §9.
#[derive(Default)]
pub struct FnvHasher(u64);

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

impl Hasher for FnvHasher {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        let mut hash = if self.0 == 0 { FNV_OFFSET_BASIS } else { self.0 };
        for &b in bytes {
            hash ^= b as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        self.0 = hash;
    }
}

pub type FnvBuildHasher = BuildHasherDefault<FnvHasher>;

/// `(StreamID, PASID, IOVA-page, SecurityDomain)` — the TLB's primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub sid: StreamId,
    pub pasid: Pasid,
    pub iova_page: u64,
    pub domain: SecurityDomain,
}

/// One cached translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbEntry {
    pub sid: StreamId,
    pub pasid: Pasid,
    pub iova_page: u64,
    pub pa_page: u64,
    pub perms: PagePermissions,
    pub domain: SecurityDomain,
    pub valid: bool,
    pub timestamp: u64,
    /// Which stage(s) produced this translation, stamped at insert time so a
    /// permission fault on a later cache hit can be attributed correctly
    /// without the engine re-acquiring the stream's context lock.
    pub stage: Stage,
}

/// Consistent snapshot of cache counters: `hits + misses == total_lookups`
/// always holds in a value returned from [`Tlb::atomic_statistics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbStatistics {
    pub hits: u64,
    pub misses: u64,
    pub total_lookups: u64,
    pub current_size: usize,
    pub bound: usize,
}

struct Node {
    key: CacheKey,
    entry: TlbEntry,
    prev: Option<usize>,
    next: Option<usize>,
}

struct Inner {
    slots: Vec<Option<Node>>,
    free: Vec<usize>,
    key_to_slot: HashMap<CacheKey, usize, FnvBuildHasher>,
    head: Option<usize>, // MRU
    tail: Option<usize>, // LRU
    len: usize,
    bound: usize,

    by_stream: HashMap<StreamId, HashSet<usize>>,
    by_stream_pasid: HashMap<(StreamId, Pasid), HashSet<usize>>,
    by_domain: HashMap<SecurityDomain, HashSet<usize>>,
}

impl Inner {
    fn unlink(&mut self, slot: usize) {
        let (prev, next) = {
            let node = self.slots[slot].as_ref().unwrap();
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.slots[p].as_mut().unwrap().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].as_mut().unwrap().prev = prev,
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, slot: usize) {
        let old_head = self.head;
        {
            let node = self.slots[slot].as_mut().unwrap();
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            self.slots[h].as_mut().unwrap().prev = Some(slot);
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }

    fn promote(&mut self, slot: usize) {
        if self.head == Some(slot) {
            return;
        }
        self.unlink(slot);
        self.push_front(slot);
    }

    fn index_insert(&mut self, slot: usize, key: &CacheKey) {
        self.by_stream.entry(key.sid).or_default().insert(slot);
        self.by_stream_pasid.entry((key.sid, key.pasid)).or_default().insert(slot);
        self.by_domain.entry(key.domain).or_default().insert(slot);
    }

    fn index_remove(&mut self, slot: usize, key: &CacheKey) {
        if let Some(set) = self.by_stream.get_mut(&key.sid) {
            set.remove(&slot);
            if set.is_empty() {
                self.by_stream.remove(&key.sid);
            }
        }
        if let Some(set) = self.by_stream_pasid.get_mut(&(key.sid, key.pasid)) {
            set.remove(&slot);
            if set.is_empty() {
                self.by_stream_pasid.remove(&(key.sid, key.pasid));
            }
        }
        if let Some(set) = self.by_domain.get_mut(&key.domain) {
            set.remove(&slot);
            if set.is_empty() {
                self.by_domain.remove(&key.domain);
            }
        }
    }

    fn remove_slot(&mut self, slot: usize) {
        self.unlink(slot);
        let node = self.slots[slot].take().unwrap();
        self.key_to_slot.remove(&node.key);
        self.index_remove(slot, &node.key);
        self.free.push(slot);
        self.len -= 1;
    }

    fn evict_lru(&mut self) {
        if let Some(tail) = self.tail {
            self.remove_slot(tail);
        }
    }

    fn alloc_slot(&mut self, key: CacheKey, entry: TlbEntry) -> usize {
        let node = Node {
            key,
            entry,
            prev: None,
            next: None,
        };
        let slot = match self.free.pop() {
            Some(s) => {
                self.slots[s] = Some(node);
                s
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.len += 1;
        slot
    }
}

/// The global translation cache. One instance is owned by
/// [`crate::engine::TranslationEngine`].
pub struct Tlb {
    inner: Mutex<Inner>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Tlb {
    /// Creates an empty cache bounded to hold at most `bound` entries.
    pub fn new(bound: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: Vec::new(),
                free: Vec::new(),
                key_to_slot: HashMap::default(),
                head: None,
                tail: None,
                len: 0,
                bound: bound.max(1),
                by_stream: HashMap::new(),
                by_stream_pasid: HashMap::new(),
                by_domain: HashMap::new(),
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn validate_range(sid: StreamId, pasid: Pasid) -> Result<()> {
        if sid >= STREAM_ID_MAX {
            return Err(Error::InvalidStreamID);
        }
        if pasid >= PASID_MAX {
            return Err(Error::InvalidPASID);
        }
        Ok(())
    }

    /// Looks up a cached translation, promoting it to MRU on a hit. Returns
    /// [`Error::CacheEntryNotFound`] on a plain miss, or a range error if
    /// `sid`/`pasid` are out of bounds.
    pub fn lookup(
        &self,
        sid: StreamId,
        pasid: Pasid,
        iova_page: u64,
        domain: SecurityDomain,
    ) -> Result<TlbEntry> {
        Self::validate_range(sid, pasid)?;
        let key = CacheKey { sid, pasid, iova_page, domain };
        let mut inner = self.inner.lock();
        match inner.key_to_slot.get(&key).copied() {
            Some(slot) => {
                inner.promote(slot);
                let entry = inner.slots[slot].as_ref().unwrap().entry;
                drop(inner);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(entry)
            }
            None => {
                drop(inner);
                self.misses.fetch_add(1, Ordering::Relaxed);
                Err(Error::CacheEntryNotFound)
            }
        }
    }

    /// Inserts or overwrites a translation, evicting the LRU entry first if
    /// the cache is at its bound and the key is new.
    pub fn insert(&self, entry: TlbEntry) {
        let key = CacheKey {
            sid: entry.sid,
            pasid: entry.pasid,
            iova_page: entry.iova_page,
            domain: entry.domain,
        };
        let mut inner = self.inner.lock();
        if let Some(&slot) = inner.key_to_slot.get(&key) {
            inner.slots[slot].as_mut().unwrap().entry = entry;
            inner.promote(slot);
            return;
        }
        if inner.len >= inner.bound {
            inner.evict_lru();
        }
        let slot = inner.alloc_slot(key, entry);
        inner.push_front(slot);
        inner.key_to_slot.insert(key, slot);
        inner.index_insert(slot, &key);
    }

    /// Removes one entry if present; a no-op otherwise.
    pub fn invalidate(&self, sid: StreamId, pasid: Pasid, iova_page: u64, domain: SecurityDomain) {
        let key = CacheKey { sid, pasid, iova_page, domain };
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.key_to_slot.get(&key).copied() {
            inner.remove_slot(slot);
        }
    }

    /// Removes every entry for `sid`, via the StreamID secondary index.
    pub fn invalidate_stream(&self, sid: StreamId) {
        let mut inner = self.inner.lock();
        let slots: Vec<usize> = inner.by_stream.get(&sid).map(|s| s.iter().copied().collect()).unwrap_or_default();
        for slot in slots {
            inner.remove_slot(slot);
        }
    }

    /// Removes every entry for `(sid, pasid)`, via the composite secondary
    /// index.
    pub fn invalidate_pasid(&self, sid: StreamId, pasid: Pasid) {
        let mut inner = self.inner.lock();
        let slots: Vec<usize> = inner
            .by_stream_pasid
            .get(&(sid, pasid))
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        for slot in slots {
            inner.remove_slot(slot);
        }
    }

    /// Removes every entry tagged with `domain`, via the security-domain
    /// secondary index.
    pub fn invalidate_by_security_domain(&self, domain: SecurityDomain) {
        let mut inner = self.inner.lock();
        let slots: Vec<usize> = inner.by_domain.get(&domain).map(|s| s.iter().copied().collect()).unwrap_or_default();
        for slot in slots {
            inner.remove_slot(slot);
        }
    }

    /// Drops every entry.
    pub fn invalidate_all(&self) {
        let mut inner = self.inner.lock();
        inner.slots.clear();
        inner.free.clear();
        inner.key_to_slot.clear();
        inner.head = None;
        inner.tail = None;
        inner.len = 0;
        inner.by_stream.clear();
        inner.by_stream_pasid.clear();
        inner.by_domain.clear();
    }

    /// Alias for [`Tlb::invalidate_all`].
    pub fn clear(&self) {
        self.invalidate_all();
    }

    /// Shrinks the bound, evicting from the LRU end until `size <= n`.
    pub fn set_max_size(&self, n: usize) {
        let mut inner = self.inner.lock();
        inner.bound = n.max(1);
        while inner.len > inner.bound {
            inner.evict_lru();
        }
    }

    /// A consistent snapshot: reads `hits`/`misses` and retries until two
    /// consecutive reads agree, so a concurrent increment can never be
    /// observed mid-update (spec.md §4.2/§9).
    pub fn atomic_statistics(&self) -> TlbStatistics {
        loop {
            let h1 = self.hits.load(Ordering::Relaxed);
            let m1 = self.misses.load(Ordering::Relaxed);
            let h2 = self.hits.load(Ordering::Relaxed);
            let m2 = self.misses.load(Ordering::Relaxed);
            if h1 == h2 && m1 == m2 {
                let inner = self.inner.lock();
                return TlbStatistics {
                    hits: h1,
                    misses: m1,
                    total_lookups: h1 + m1,
                    current_size: inner.len,
                    bound: inner.bound,
                };
            }
        }
    }

    /// Resets the hit/miss counters to zero without touching cached
    /// entries.
    pub fn reset_statistics(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    /// Current number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    /// Whether the cache currently holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(sid: StreamId, pasid: Pasid, page: u64) -> TlbEntry {
        TlbEntry {
            sid,
            pasid,
            iova_page: page,
            pa_page: page,
            perms: PagePermissions::READ,
            domain: SecurityDomain::NonSecure,
            valid: true,
            timestamp: 0,
            stage: Stage::Stage1Only,
        }
    }

    #[test]
    fn hit_then_miss_after_invalidate() {
        let tlb = Tlb::new(16);
        tlb.insert(entry(1, 1, 100));
        assert!(tlb.lookup(1, 1, 100, SecurityDomain::NonSecure).is_ok());
        tlb.invalidate(1, 1, 100, SecurityDomain::NonSecure);
        assert_eq!(
            tlb.lookup(1, 1, 100, SecurityDomain::NonSecure),
            Err(Error::CacheEntryNotFound)
        );
    }

    #[test]
    fn stats_hits_plus_misses_equals_total() {
        let tlb = Tlb::new(16);
        tlb.insert(entry(1, 1, 100));
        let _ = tlb.lookup(1, 1, 100, SecurityDomain::NonSecure);
        let _ = tlb.lookup(1, 1, 999, SecurityDomain::NonSecure);
        let stats = tlb.atomic_statistics();
        assert_eq!(stats.hits + stats.misses, stats.total_lookups);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn lru_eviction_drops_oldest() {
        let tlb = Tlb::new(2);
        tlb.insert(entry(1, 1, 1));
        tlb.insert(entry(1, 1, 2));
        tlb.insert(entry(1, 1, 3));
        assert_eq!(tlb.len(), 2);
        assert_eq!(
            tlb.lookup(1, 1, 1, SecurityDomain::NonSecure),
            Err(Error::CacheEntryNotFound)
        );
        assert!(tlb.lookup(1, 1, 2, SecurityDomain::NonSecure).is_ok());
        assert!(tlb.lookup(1, 1, 3, SecurityDomain::NonSecure).is_ok());
    }

    #[test]
    fn promote_on_hit_protects_from_eviction() {
        let tlb = Tlb::new(2);
        tlb.insert(entry(1, 1, 1));
        tlb.insert(entry(1, 1, 2));
        assert!(tlb.lookup(1, 1, 1, SecurityDomain::NonSecure).is_ok()); // promote 1
        tlb.insert(entry(1, 1, 3)); // should evict 2, not 1
        assert!(tlb.lookup(1, 1, 1, SecurityDomain::NonSecure).is_ok());
        assert_eq!(
            tlb.lookup(1, 1, 2, SecurityDomain::NonSecure),
            Err(Error::CacheEntryNotFound)
        );
    }

    #[test]
    fn invalidate_stream_is_selective() {
        let tlb = Tlb::new(16);
        tlb.insert(entry(1, 1, 1));
        tlb.insert(entry(2, 1, 1));
        tlb.invalidate_stream(1);
        assert_eq!(
            tlb.lookup(1, 1, 1, SecurityDomain::NonSecure),
            Err(Error::CacheEntryNotFound)
        );
        assert!(tlb.lookup(2, 1, 1, SecurityDomain::NonSecure).is_ok());
    }

    #[test]
    fn invalidate_pasid_is_selective() {
        let tlb = Tlb::new(16);
        tlb.insert(entry(1, 1, 1));
        tlb.insert(entry(1, 2, 1));
        tlb.invalidate_pasid(1, 1);
        assert_eq!(
            tlb.lookup(1, 1, 1, SecurityDomain::NonSecure),
            Err(Error::CacheEntryNotFound)
        );
        assert!(tlb.lookup(1, 2, 1, SecurityDomain::NonSecure).is_ok());
    }

    #[test]
    fn invalidate_by_security_domain_is_selective() {
        let tlb = Tlb::new(16);
        let mut e1 = entry(1, 1, 1);
        e1.domain = SecurityDomain::Secure;
        let mut e2 = entry(1, 1, 2);
        e2.domain = SecurityDomain::NonSecure;
        tlb.insert(e1);
        tlb.insert(e2);
        tlb.invalidate_by_security_domain(SecurityDomain::Secure);
        assert_eq!(tlb.lookup(1, 1, 1, SecurityDomain::Secure), Err(Error::CacheEntryNotFound));
        assert!(tlb.lookup(1, 1, 2, SecurityDomain::NonSecure).is_ok());
    }

    #[test]
    fn out_of_range_sid_is_typed_error() {
        let tlb = Tlb::new(16);
        assert_eq!(
            tlb.lookup(STREAM_ID_MAX, 0, 0, SecurityDomain::NonSecure),
            Err(Error::InvalidStreamID)
        );
    }

    #[test]
    fn set_max_size_evicts_down_to_bound() {
        let tlb = Tlb::new(16);
        for i in 0..8 {
            tlb.insert(entry(1, 1, i));
        }
        tlb.set_max_size(4);
        assert_eq!(tlb.len(), 4);
    }
}
