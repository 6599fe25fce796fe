//! Per-method scratch arenas.
//!
//! Two arenas exist per compilation unit. The unit-lifetime [`Arena`]
//! holds scratch that must survive until the method is sealed: the GC-map
//! replay bit buffers and the switch and fill-array payload copies the
//! assembler installs late. The [`ArenaStack`] hands out [`ScopedArena`]s
//! for pass-local scratch (the lowering-cache packing arrays); a scope's
//! allocations are released when it drops. Regions are recycled through a
//! process-wide [`ArenaPool`] so that compiling many small methods does
//! not thrash the allocator.

use std::cell::Cell;
use std::fmt;
use std::sync::Mutex;

use bumpalo::Bump;

use crate::error::{CompileError, CompileResult};

/// Default region size. Bumpalo doubles chunks internally; starting at 16
/// KiB keeps small methods in a single region.
const INITIAL_REGION_SIZE: usize = 16 * 1024;

/// What an allocation is for. Only used for accounting.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AllocKind {
    Misc,
    BitVector,
    LoweringInfo,
    SwitchTable,
    FillArrayData,
}

const NUM_ALLOC_KINDS: usize = 5;

/// A process-wide pool of recycled arena regions.
///
/// The driver owns one pool; every compilation unit borrows from it.
pub struct ArenaPool {
    free: Mutex<Vec<Bump>>,
}

impl ArenaPool {
    pub fn new() -> Self {
        Self { free: Mutex::new(Vec::new()) }
    }

    fn take(&self) -> Bump {
        let mut free = self.free.lock().unwrap();
        free.pop().unwrap_or_else(|| Bump::with_capacity(INITIAL_REGION_SIZE))
    }

    fn put(&self, mut bump: Bump) {
        bump.reset();
        let mut free = self.free.lock().unwrap();
        if free.len() < 64 {
            free.push(bump);
        }
    }
}

impl Default for ArenaPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A bump arena borrowed from an [`ArenaPool`] for the compilation unit's
/// lifetime.
///
/// Allocations are never individually freed; [`Arena::reset`] discards
/// everything at once. Zero-sized allocations are permitted and return an
/// empty slice.
pub struct Arena<'p> {
    pool: &'p ArenaPool,
    bump: Bump,
    alloc_by_kind: [Cell<usize>; NUM_ALLOC_KINDS],
    bytes_allocated: Cell<usize>,
    peak_bytes: Cell<usize>,
}

impl<'p> Arena<'p> {
    pub fn new(pool: &'p ArenaPool) -> Self {
        Self {
            pool,
            bump: pool.take(),
            alloc_by_kind: Default::default(),
            bytes_allocated: Cell::new(0),
            peak_bytes: Cell::new(0),
        }
    }

    /// Allocate `len` zeroed bytes. Fails with `CompileError::OutOfMemory`
    /// instead of aborting; the caller abandons the method.
    pub fn alloc(&self, len: usize, kind: AllocKind) -> CompileResult<&mut [u8]> {
        let slice = self
            .bump
            .try_alloc_slice_fill_copy(len, 0u8)
            .map_err(|_| CompileError::OutOfMemory)?;
        self.record(len.max(8), kind);
        Ok(slice)
    }

    /// Allocate a slice of `len` copies of `value`.
    pub fn alloc_slice<T: Copy>(&self, len: usize, value: T, kind: AllocKind) -> &mut [T] {
        self.record(len * std::mem::size_of::<T>(), kind);
        self.bump.alloc_slice_fill_copy(len, value)
    }

    fn record(&self, bytes: usize, kind: AllocKind) {
        let cell = &self.alloc_by_kind[kind as usize];
        cell.set(cell.get() + bytes);
        let total = self.bytes_allocated.get() + bytes;
        self.bytes_allocated.set(total);
        if total > self.peak_bytes.get() {
            self.peak_bytes.set(total);
        }
    }

    /// Discard all allocations, keeping the regions for reuse.
    pub fn reset(&mut self) {
        self.bump.reset();
        self.bytes_allocated.set(0);
        for cell in &self.alloc_by_kind {
            cell.set(0);
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated.get()
    }

    /// High-water mark across the arena's lifetime, including before resets.
    pub fn peak_bytes(&self) -> usize {
        self.peak_bytes.get()
    }

    pub fn stats(&self) -> MemStats {
        let mut by_kind = [0usize; NUM_ALLOC_KINDS];
        for (out, cell) in by_kind.iter_mut().zip(&self.alloc_by_kind) {
            *out = cell.get();
        }
        MemStats { total: self.bytes_allocated.get(), peak: self.peak_bytes.get(), by_kind }
    }
}

impl Drop for Arena<'_> {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.bump));
    }
}

/// The "stack" variant: a source of [`ScopedArena`]s whose allocations are
/// released on scope exit. Nesting is just multiple live scopes.
pub struct ArenaStack<'p> {
    pool: &'p ArenaPool,
    peak_bytes: Cell<usize>,
}

impl<'p> ArenaStack<'p> {
    pub fn new(pool: &'p ArenaPool) -> Self {
        Self { pool, peak_bytes: Cell::new(0) }
    }

    /// Open a scope. Everything allocated through it is released when the
    /// returned arena drops.
    pub fn scope(&self) -> ScopedArena<'_> {
        ScopedArena { stack: self, bump: self.pool.take(), bytes_allocated: Cell::new(0) }
    }

    /// High-water mark across all scopes taken from this stack.
    pub fn peak_bytes(&self) -> usize {
        self.peak_bytes.get()
    }
}

/// Pass-local scratch released when this scope drops.
pub struct ScopedArena<'s> {
    stack: &'s ArenaStack<'s>,
    bump: Bump,
    bytes_allocated: Cell<usize>,
}

impl ScopedArena<'_> {
    /// Allocate `len` zeroed bytes, failing like [`Arena::alloc`].
    pub fn alloc(&self, len: usize, _kind: AllocKind) -> CompileResult<&mut [u8]> {
        let slice = self
            .bump
            .try_alloc_slice_fill_copy(len, 0u8)
            .map_err(|_| CompileError::OutOfMemory)?;
        self.record(len.max(8));
        Ok(slice)
    }

    /// Allocate a slice of `len` copies of `value`.
    pub fn alloc_slice<T: Copy>(&self, len: usize, value: T, _kind: AllocKind) -> &mut [T] {
        self.record(len * std::mem::size_of::<T>());
        self.bump.alloc_slice_fill_copy(len, value)
    }

    fn record(&self, bytes: usize) {
        self.bytes_allocated.set(self.bytes_allocated.get() + bytes);
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated.get()
    }
}

impl Drop for ScopedArena<'_> {
    fn drop(&mut self) {
        if self.bytes_allocated.get() > self.stack.peak_bytes.get() {
            self.stack.peak_bytes.set(self.bytes_allocated.get());
        }
        self.stack.pool.put(std::mem::take(&mut self.bump));
    }
}

/// Snapshot of arena usage, printable for the memory-usage debug flag.
#[derive(Clone, Debug)]
pub struct MemStats {
    pub total: usize,
    pub peak: usize,
    by_kind: [usize; NUM_ALLOC_KINDS],
}

impl fmt::Display for MemStats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "arena: {} bytes allocated, peak {}", self.total, self.peak)?;
        const NAMES: [&str; NUM_ALLOC_KINDS] = [
            "misc",
            "bit-vector",
            "lowering-info",
            "switch-table",
            "fill-array-data",
        ];
        for (name, bytes) in NAMES.iter().zip(self.by_kind) {
            if bytes != 0 {
                writeln!(f, "  {name}: {bytes}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_reset() {
        let pool = ArenaPool::new();
        let mut arena = Arena::new(&pool);
        let a = arena.alloc(100, AllocKind::Misc).unwrap();
        assert_eq!(a.len(), 100);
        assert!(a.iter().all(|&b| b == 0));
        assert!(arena.bytes_allocated() >= 100);
        let peak = arena.peak_bytes();
        arena.reset();
        assert_eq!(arena.bytes_allocated(), 0);
        assert_eq!(arena.peak_bytes(), peak);
    }

    #[test]
    fn zero_sized() {
        let pool = ArenaPool::new();
        let arena = Arena::new(&pool);
        let empty = arena.alloc(0, AllocKind::Misc).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn pool_recycles_regions() {
        let pool = ArenaPool::new();
        {
            let arena = Arena::new(&pool);
            arena.alloc(1024, AllocKind::BitVector).unwrap();
        }
        assert_eq!(pool.free.lock().unwrap().len(), 1);
        let _arena = Arena::new(&pool);
        assert_eq!(pool.free.lock().unwrap().len(), 0);
    }

    #[test]
    fn scopes_release_on_exit() {
        let pool = ArenaPool::new();
        let stack = ArenaStack::new(&pool);
        {
            let scope = stack.scope();
            let scratch = scope.alloc_slice(256, 0u32, AllocKind::LoweringInfo);
            scratch[0] = 7;
            assert!(scope.bytes_allocated() >= 1024);
        }
        // The scope's region went back to the pool on drop.
        assert_eq!(pool.free.lock().unwrap().len(), 1);
        assert!(stack.peak_bytes() >= 1024);
    }

    #[test]
    fn scopes_nest() {
        let pool = ArenaPool::new();
        let stack = ArenaStack::new(&pool);
        let outer = stack.scope();
        outer.alloc(16, AllocKind::Misc).unwrap();
        {
            let inner = stack.scope();
            inner.alloc(4096, AllocKind::Misc).unwrap();
        }
        assert!(outer.bytes_allocated() < 4096);
        assert!(stack.peak_bytes() >= 4096);
    }
}
