//! The translation-unit cache.
//!
//! Fixed array of hash buckets plus a global LRU order, both intrusive
//! doubly-linked lists threading through the units. Only core 0
//! touches any of this, so there is no locking.

use std::sync::Arc;

use intrusive_collections::LinkedList;

use crate::bus::{BusBackend, crc_range};
use crate::config::JitConfig;
use crate::error::CoreError;
use crate::state::JitStats;

use super::unit::{BuiltUnit, ExecPtr, HashAdapter, LruAdapter, TranslationUnit, build_unit};

/// Bucket index: (pc >> 5) masked to the table size.
pub const HASH_SHIFT: u32 = 5;
pub const HASH_SIZE: usize = 1 << 16;
const HASH_MASK: u32 = (HASH_SIZE - 1) as u32;

/// Units evicted per attempt when the executable heap runs dry.
const EVICTION_BATCH: usize = 8;

#[inline]
fn bucket_of(pc: u32) -> usize {
    ((pc >> HASH_SHIFT) & HASH_MASK) as usize
}

/// Accounting for the double-mapped executable heap. The translator
/// writes through one mapping; the dispatcher calls through the other.
#[derive(Debug)]
struct CodeHeap {
    capacity: usize,
    used: usize,
    next_base: u64,
}

impl CodeHeap {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            used: 0,
            next_base: 0x1000,
        }
    }

    fn alloc(&mut self, bytes: usize) -> Option<u64> {
        if self.used + bytes > self.capacity {
            return None;
        }
        self.used += bytes;
        let base = self.next_base;
        self.next_base += bytes as u64;
        Some(base)
    }

    fn free(&mut self, bytes: usize) {
        self.used = self.used.saturating_sub(bytes);
    }

    fn free_bytes(&self) -> usize {
        self.capacity - self.used
    }
}

/// Hash-bucketed LRU cache of translation units keyed by guest PC.
pub struct ICache {
    buckets: Vec<LinkedList<HashAdapter>>,
    lru: LinkedList<LruAdapter>,
    heap: CodeHeap,
    stats: Arc<JitStats>,
}

impl ICache {
    pub fn new(heap_capacity: usize, stats: Arc<JitStats>) -> Self {
        let mut buckets = Vec::with_capacity(HASH_SIZE);
        for _ in 0..HASH_SIZE {
            buckets.push(LinkedList::new(HashAdapter::new()));
        }
        stats
            .cache_total
            .store(heap_capacity as u32, std::sync::atomic::Ordering::Relaxed);
        stats
            .cache_free
            .store(heap_capacity as u32, std::sync::atomic::Ordering::Relaxed);
        Self {
            buckets,
            lru: LinkedList::new(LruAdapter::new()),
            heap: CodeHeap::new(heap_capacity),
            stats,
        }
    }

    fn publish_heap_stats(&self) {
        use std::sync::atomic::Ordering::Relaxed;
        self.stats
            .cache_free
            .store(self.heap.free_bytes() as u32, Relaxed);
    }

    /// Look a unit up by entry PC. On a hit the unit moves to the head
    /// of both its bucket and the LRU order.
    pub fn lookup(&mut self, pc: u32) -> Option<Arc<TranslationUnit>> {
        let bucket = &mut self.buckets[bucket_of(pc)];
        let mut cursor = bucket.front_mut();
        let mut found = None;
        loop {
            let hit = match cursor.get() {
                Some(unit) => unit.guest_entry_pc == pc,
                None => break,
            };
            if hit {
                found = cursor.remove();
                break;
            }
            cursor.move_next();
        }
        let unit = found?;
        bucket.push_front(unit.clone());

        // Refresh the LRU position.
        let lru_copy = unsafe { self.lru.cursor_mut_from_ptr(&*unit).remove() };
        debug_assert!(lru_copy.is_some());
        if let Some(u) = lru_copy {
            self.lru.push_front(u);
        }

        unit.use_count.set(unit.use_count.get() + 1);
        Some(unit)
    }

    /// Install a freshly built unit, evicting from the LRU tail in
    /// batches until the executable heap accepts the allocation.
    pub fn install(&mut self, built: BuiltUnit) -> Result<Arc<TranslationUnit>, CoreError> {
        use std::sync::atomic::Ordering::Relaxed;

        let bytes = (built.host_code.len() * 4 + 64 + 63) & !63;
        let base = loop {
            if let Some(base) = self.heap.alloc(bytes) {
                break base;
            }
            log::debug!(
                target: "icache",
                "executable heap full ({} bytes requested), evicting {} LRU tail units",
                bytes,
                EVICTION_BATCH
            );
            let mut evicted = 0;
            for _ in 0..EVICTION_BATCH {
                let Some(tail) = self.lru.pop_back() else {
                    break;
                };
                self.detach_from_bucket(&tail);
                self.heap.free(tail.heap_bytes());
                self.stats.unit_count.fetch_sub(1, Relaxed);
                evicted += 1;
            }
            if evicted == 0 {
                self.publish_heap_stats();
                return Err(CoreError::HeapExhausted { requested: bytes });
            }
        };

        let unit = Arc::new(TranslationUnit {
            hash_link: Default::default(),
            lru_link: Default::default(),
            guest_entry_pc: built.guest_entry_pc,
            guest_low: built.guest_low,
            guest_high: built.guest_high,
            crc32: built.crc32,
            host_code: built.host_code,
            host_entry: ExecPtr::new(base),
            insn_count: built.insn_count,
            use_count: 0.into(),
            fetch_count: 0.into(),
        });

        self.buckets[bucket_of(unit.guest_entry_pc)].push_front(unit.clone());
        self.lru.push_front(unit.clone());
        self.stats.unit_count.fetch_add(1, Relaxed);
        self.stats.cache_miss.fetch_add(1, Relaxed);
        self.publish_heap_stats();
        Ok(unit)
    }

    fn detach_from_bucket(&mut self, unit: &TranslationUnit) {
        let bucket = &mut self.buckets[bucket_of(unit.guest_entry_pc)];
        let mut cursor = unsafe { bucket.cursor_mut_from_ptr(unit) };
        cursor.remove();
    }

    /// Drop a unit from both structures and release its allocation.
    pub fn remove(&mut self, unit: &Arc<TranslationUnit>) {
        use std::sync::atomic::Ordering::Relaxed;
        self.detach_from_bucket(unit);
        let lru_copy = unsafe { self.lru.cursor_mut_from_ptr(&**unit).remove() };
        debug_assert!(lru_copy.is_some());
        self.heap.free(unit.heap_bytes());
        self.stats.unit_count.fetch_sub(1, Relaxed);
        self.publish_heap_stats();
    }

    /// Recompute the CRC over the unit's guest footprint. A mismatch
    /// means the code under it changed: the unit is dropped and the
    /// caller retranslates.
    pub fn verify(
        &mut self,
        bus: &mut dyn BusBackend,
        unit: Arc<TranslationUnit>,
    ) -> Option<Arc<TranslationUnit>> {
        let crc = crc_range(bus, unit.guest_low, unit.guest_high);
        if crc == unit.crc32 {
            Some(unit)
        } else {
            log::debug!(
                target: "icache",
                "checksum mismatch for unit at {:#010x} ({crc:#010x} != {:#010x}), dropping",
                unit.guest_entry_pc,
                unit.crc32
            );
            self.remove(&unit);
            None
        }
    }

    /// Cache lookup with verification, translating on miss or after a
    /// mismatch drop.
    pub fn lookup_or_translate(
        &mut self,
        bus: &mut dyn BusBackend,
        cfg: &JitConfig,
        pc: u32,
    ) -> Result<Arc<TranslationUnit>, CoreError> {
        if let Some(unit) = self.lookup(pc)
            && let Some(unit) = self.verify(bus, unit)
        {
            unit.fetch_count.set(unit.fetch_count.get() + 1);
            return Ok(unit);
        }
        let built = build_unit(bus, cfg, pc)?;
        let unit = self.install(built)?;
        unit.fetch_count.set(unit.fetch_count.get() + 1);
        Ok(unit)
    }

    /// Drop everything (guest-requested soft flush).
    pub fn flush_all(&mut self) {
        use std::sync::atomic::Ordering::Relaxed;
        while let Some(unit) = self.lru.pop_back() {
            self.detach_from_bucket(&unit);
            self.heap.free(unit.heap_bytes());
        }
        self.stats.unit_count.store(0, Relaxed);
        self.publish_heap_stats();
        log::debug!(target: "icache", "cache flushed");
    }

    pub fn unit_count(&self) -> u32 {
        self.stats
            .unit_count
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Head-of-bucket check used by tests and the dispatcher's inline
    /// probe.
    pub fn bucket_head(&self, pc: u32) -> Option<&TranslationUnit> {
        self.buckets[bucket_of(pc)].front().get()
    }

    pub fn lru_head(&self) -> Option<&TranslationUnit> {
        self.lru.front().get()
    }

    pub fn lru_tail(&self) -> Option<&TranslationUnit> {
        self.lru.back().get()
    }
}

impl std::fmt::Debug for ICache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ICache")
            .field("units", &self.unit_count())
            .field("heap_used", &self.heap.used)
            .field("heap_capacity", &self.heap.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{ShadowRam, Width};

    fn ram_with_rts(entries: &[u32]) -> ShadowRam {
        let mut ram = ShadowRam::new(0, 0x100000);
        for &pc in entries {
            ram.write(pc, Width::Word, 0x4e75); // RTS
        }
        ram
    }

    fn stats() -> Arc<JitStats> {
        Arc::new(JitStats::default())
    }

    #[test]
    fn lookup_after_install_hits_and_heads_lists() {
        let mut ram = ram_with_rts(&[0x1000]);
        let cfg = JitConfig::default();
        let mut cache = ICache::new(1 << 20, stats());
        let unit = cache.lookup_or_translate(&mut ram, &cfg, 0x1000).unwrap();
        assert_eq!(unit.guest_entry_pc, 0x1000);
        assert_eq!(cache.bucket_head(0x1000).unwrap().guest_entry_pc, 0x1000);
        assert_eq!(cache.lru_head().unwrap().guest_entry_pc, 0x1000);

        // Second lookup is a pure cache hit.
        let misses = cache.stats.cache_miss.load(std::sync::atomic::Ordering::Relaxed);
        let again = cache.lookup(0x1000).unwrap();
        assert!(Arc::ptr_eq(&unit, &again));
        assert_eq!(
            cache.stats.cache_miss.load(std::sync::atomic::Ordering::Relaxed),
            misses
        );
    }

    #[test]
    fn hit_moves_unit_to_lru_head() {
        let mut ram = ram_with_rts(&[0x1000, 0x2000]);
        let cfg = JitConfig::default();
        let mut cache = ICache::new(1 << 20, stats());
        cache.lookup_or_translate(&mut ram, &cfg, 0x1000).unwrap();
        cache.lookup_or_translate(&mut ram, &cfg, 0x2000).unwrap();
        assert_eq!(cache.lru_head().unwrap().guest_entry_pc, 0x2000);
        cache.lookup(0x1000).unwrap();
        assert_eq!(cache.lru_head().unwrap().guest_entry_pc, 0x1000);
        assert_eq!(cache.lru_tail().unwrap().guest_entry_pc, 0x2000);
    }

    #[test]
    fn crc_mismatch_drops_unit() {
        let mut ram = ram_with_rts(&[0x1000]);
        let cfg = JitConfig::default();
        let mut cache = ICache::new(1 << 20, stats());
        let unit = cache.lookup_or_translate(&mut ram, &cfg, 0x1000).unwrap();
        // Overwrite the code underneath.
        ram.write(0x1000, Width::Word, 0x7001);
        assert!(cache.verify(&mut ram, unit).is_none());
        assert_eq!(cache.unit_count(), 0);
        // Retranslation produces a fresh unit.
        let unit = cache.lookup_or_translate(&mut ram, &cfg, 0x1000).unwrap();
        assert_eq!(unit.guest_entry_pc, 0x1000);
    }

    #[test]
    fn heap_pressure_evicts_lru_tail_in_batches() {
        let mut ram = ShadowRam::new(0, 0x100000);
        for i in 0..64u32 {
            ram.write(0x1000 + i * 0x40, Width::Word, 0x4e75);
        }
        let cfg = JitConfig::default();
        // Room for only a handful of small units.
        let mut cache = ICache::new(4096, stats());
        for i in 0..64u32 {
            cache
                .lookup_or_translate(&mut ram, &cfg, 0x1000 + i * 0x40)
                .unwrap();
        }
        // The earliest entries must have been evicted.
        assert!(cache.lookup(0x1000).is_none());
        assert!(cache.unit_count() < 64);
        // The most recent one survives.
        assert!(cache.lookup(0x1000 + 63 * 0x40).is_some());
    }

    #[test]
    fn flush_all_empties_the_cache() {
        let mut ram = ram_with_rts(&[0x1000, 0x2000]);
        let cfg = JitConfig::default();
        let mut cache = ICache::new(1 << 20, stats());
        cache.lookup_or_translate(&mut ram, &cfg, 0x1000).unwrap();
        cache.lookup_or_translate(&mut ram, &cfg, 0x2000).unwrap();
        cache.flush_all();
        assert_eq!(cache.unit_count(), 0);
        assert!(cache.lookup(0x1000).is_none());
    }
}
