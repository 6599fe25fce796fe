//! Verification results consumed by the compiler.
//!
//! The bytecode verifier is an external collaborator. Per method it leaves
//! behind a [`VerifiedMethod`]: devirtualization targets, the set of dex PCs
//! where a `check-cast` is statically safe, and a dex-PC-keyed reference map
//! (one bit per vreg holding a reference at that point). All of it is
//! read-only once registered; the compiler may release a method's entry
//! after consuming it.

use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;

use crate::dex::MethodReference;

/// Reference bitmap per interesting dex PC, produced by the verifier.
#[derive(Clone, Debug, Default)]
pub struct DexGcMap {
    /// Bitmap width in bytes, constant for the method.
    pub reg_width: u16,
    /// `(dex_pc, bitmap)` pairs sorted by dex PC; each bitmap is
    /// `reg_width` bytes, bit `v` set when vreg `v` holds a reference.
    entries: Vec<(u32, Vec<u8>)>,
}

impl DexGcMap {
    pub fn new(reg_width: u16, mut entries: Vec<(u32, Vec<u8>)>) -> Self {
        entries.sort_by_key(|&(pc, _)| pc);
        debug_assert!(entries.iter().all(|(_, bits)| bits.len() == usize::from(reg_width)));
        Self { reg_width, entries }
    }

    /// Find the bitmap for `dex_pc`, if the verifier recorded one.
    pub fn find_bitmap(&self, dex_pc: u32) -> Option<&[u8]> {
        self.entries
            .binary_search_by_key(&dex_pc, |&(pc, _)| pc)
            .ok()
            .map(|i| &self.entries[i].1[..])
    }

    /// Bitmap for the largest recorded dex PC `<= dex_pc`. Safepoints can
    /// land between verifier records when instructions were combined.
    pub fn find_bitmap_at_or_before(&self, dex_pc: u32) -> Option<&[u8]> {
        match self.entries.binary_search_by_key(&dex_pc, |&(pc, _)| pc) {
            Ok(i) => Some(&self.entries[i].1[..]),
            Err(0) => None,
            Err(i) => Some(&self.entries[i - 1].1[..]),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Everything the verifier tells the compiler about one method.
#[derive(Debug, Default)]
pub struct VerifiedMethod {
    /// dex PC of an invoke → proven concrete target.
    devirt_map: FxHashMap<u32, MethodReference>,
    /// dex PCs whose `check-cast` always succeeds, sorted.
    safe_cast_pcs: Vec<u32>,
    pub dex_gc_map: DexGcMap,
    /// Set when verification found a soft failure that the interpreter must
    /// handle; the compiler skips such methods.
    pub has_runtime_throw: bool,
}

impl VerifiedMethod {
    pub fn new(
        devirt_map: FxHashMap<u32, MethodReference>,
        mut safe_cast_pcs: Vec<u32>,
        dex_gc_map: DexGcMap,
    ) -> Self {
        safe_cast_pcs.sort_unstable();
        Self { devirt_map, safe_cast_pcs, dex_gc_map, has_runtime_throw: false }
    }

    pub fn devirt_target(&self, dex_pc: u32) -> Option<MethodReference> {
        self.devirt_map.get(&dex_pc).copied()
    }

    pub fn is_safe_cast(&self, dex_pc: u32) -> bool {
        self.safe_cast_pcs.binary_search(&dex_pc).is_ok()
    }
}

/// Process-wide store of verification results.
///
/// Written by the verifier before compilation begins, read concurrently by
/// every compilation thread, individual entries released as methods finish
/// consuming them.
#[derive(Default)]
pub struct VerificationResults {
    methods: RwLock<FxHashMap<MethodReference, Arc<VerifiedMethod>>>,
}

impl VerificationResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_verified_method(&self, method: MethodReference, result: VerifiedMethod) {
        self.methods.write().unwrap().insert(method, Arc::new(result));
    }

    pub fn get_verified_method(&self, method: MethodReference) -> Option<Arc<VerifiedMethod>> {
        self.methods.read().unwrap().get(&method).cloned()
    }

    /// Release a method's results to reclaim memory.
    pub fn clear_verified_method(&self, method: MethodReference) {
        self.methods.write().unwrap().remove(&method);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::DexFileId;

    #[test]
    fn gc_map_lookup() {
        let map = DexGcMap::new(1, vec![(0, vec![0b01]), (4, vec![0b11])]);
        assert_eq!(map.find_bitmap(0), Some(&[0b01][..]));
        assert_eq!(map.find_bitmap(4), Some(&[0b11][..]));
        assert_eq!(map.find_bitmap(2), None);
        assert_eq!(map.find_bitmap_at_or_before(2), Some(&[0b01][..]));
        assert_eq!(map.find_bitmap_at_or_before(100), Some(&[0b11][..]));
    }

    #[test]
    fn results_lifecycle() {
        let results = VerificationResults::new();
        let method = MethodReference::new(DexFileId(0), 3);
        results.add_verified_method(method, VerifiedMethod::default());
        assert!(results.get_verified_method(method).is_some());
        results.clear_verified_method(method);
        assert!(results.get_verified_method(method).is_none());
    }

    #[test]
    fn safe_cast_lookup() {
        let vm = VerifiedMethod::new(FxHashMap::default(), vec![8, 2], DexGcMap::default());
        assert!(vm.is_safe_cast(2));
        assert!(vm.is_safe_cast(8));
        assert!(!vm.is_safe_cast(4));
    }
}
