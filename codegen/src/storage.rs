//! Process-wide deduplication of compiled-method components.
//!
//! Each component (code, mapping table, vmap table, GC map, CFI, patch
//! list) is interned separately: a hash bucket scan compares full contents,
//! so two methods share storage only when the bytes are identical. Tables
//! are guarded by a mutex each; hold time is the comparison itself.
//!
//! A JIT embedder constructs the storage with deduplication disabled and
//! every method gets unique allocations.

use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use rustc_hash::{FxHashMap, FxHasher};

use crate::compiled::{CompiledMethod, LinkerPatch, SrcMapElem};

struct DedupTable<T: ?Sized> {
    name: &'static str,
    buckets: Mutex<FxHashMap<u64, Vec<Arc<T>>>>,
}

impl<T: ?Sized> DedupTable<T> {
    fn new(name: &'static str) -> Self {
        Self { name, buckets: Mutex::new(FxHashMap::default()) }
    }
}

impl<T> DedupTable<[T]>
where
    T: Hash + PartialEq + Clone,
{
    fn intern(&self, data: &[T]) -> Arc<[T]> {
        let mut hasher = FxHasher::default();
        data.hash(&mut hasher);
        let hash = hasher.finish();

        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets.entry(hash).or_default();
        // Identical hashes only dedupe on full equality.
        for existing in bucket.iter() {
            if existing.as_ref() == data {
                log::trace!("deduplicated {} ({} entries)", self.name, data.len());
                return Arc::clone(existing);
            }
        }
        let interned: Arc<[T]> = data.into();
        bucket.push(Arc::clone(&interned));
        interned
    }
}

/// Owns every `CompiledMethod`'s byte storage for the life of the driver.
pub struct CompiledMethodStorage {
    dedupe_enabled: bool,
    code: DedupTable<[u8]>,
    src_mapping: DedupTable<[SrcMapElem]>,
    mapping_table: DedupTable<[u8]>,
    vmap_table: DedupTable<[u8]>,
    gc_map: DedupTable<[u8]>,
    cfi_info: DedupTable<[u8]>,
    patches: DedupTable<[LinkerPatch]>,
}

impl CompiledMethodStorage {
    pub fn new(dedupe_enabled: bool) -> Self {
        Self {
            dedupe_enabled,
            code: DedupTable::new("code"),
            src_mapping: DedupTable::new("src-mapping"),
            mapping_table: DedupTable::new("mapping-table"),
            vmap_table: DedupTable::new("vmap-table"),
            gc_map: DedupTable::new("gc-map"),
            cfi_info: DedupTable::new("cfi"),
            patches: DedupTable::new("patches"),
        }
    }

    pub fn dedupe_enabled(&self) -> bool {
        self.dedupe_enabled
    }

    pub fn dedupe_code(&self, data: &[u8]) -> Arc<[u8]> {
        if self.dedupe_enabled { self.code.intern(data) } else { data.into() }
    }

    pub fn dedupe_src_mapping(&self, data: &[SrcMapElem]) -> Arc<[SrcMapElem]> {
        if self.dedupe_enabled { self.src_mapping.intern(data) } else { data.into() }
    }

    pub fn dedupe_mapping_table(&self, data: &[u8]) -> Arc<[u8]> {
        if self.dedupe_enabled { self.mapping_table.intern(data) } else { data.into() }
    }

    pub fn dedupe_vmap_table(&self, data: &[u8]) -> Arc<[u8]> {
        if self.dedupe_enabled { self.vmap_table.intern(data) } else { data.into() }
    }

    pub fn dedupe_gc_map(&self, data: &[u8]) -> Arc<[u8]> {
        if self.dedupe_enabled { self.gc_map.intern(data) } else { data.into() }
    }

    pub fn dedupe_cfi(&self, data: &[u8]) -> Arc<[u8]> {
        if self.dedupe_enabled { self.cfi_info.intern(data) } else { data.into() }
    }

    pub fn dedupe_patches(&self, data: &[LinkerPatch]) -> Arc<[LinkerPatch]> {
        if self.dedupe_enabled { self.patches.intern(data) } else { data.into() }
    }

    /// True if two methods share all interned components, for tests and
    /// stats.
    pub fn is_fully_shared(a: &CompiledMethod, b: &CompiledMethod) -> bool {
        Arc::ptr_eq(&a.code, &b.code)
            && Arc::ptr_eq(&a.mapping_table, &b.mapping_table)
            && Arc::ptr_eq(&a.vmap_table, &b.vmap_table)
            && Arc::ptr_eq(&a.gc_map, &b.gc_map)
            && Arc::ptr_eq(&a.cfi_info, &b.cfi_info)
            && Arc::ptr_eq(&a.patches, &b.patches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_code_shares_storage() {
        let storage = CompiledMethodStorage::new(true);
        let a = storage.dedupe_code(&[1, 2, 3]);
        let b = storage.dedupe_code(&[1, 2, 3]);
        let c = storage.dedupe_code(&[4, 3, 2, 1]);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn dedupe_disabled_returns_unique_storage() {
        let storage = CompiledMethodStorage::new(false);
        let a = storage.dedupe_code(&[1, 2, 3]);
        let b = storage.dedupe_code(&[1, 2, 3]);
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(&a[..], &b[..]);
    }

    #[test]
    fn patches_dedupe_on_contents() {
        use crate::dex::{DexFileId, MethodReference};
        let storage = CompiledMethodStorage::new(true);
        let target = MethodReference::new(DexFileId(1), 2);
        let list = [LinkerPatch::Code { literal_offset: 0, target }];
        let a = storage.dedupe_patches(&list);
        let b = storage.dedupe_patches(&list);
        assert!(Arc::ptr_eq(&a, &b));
    }
}
