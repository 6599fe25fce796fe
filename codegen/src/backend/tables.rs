//! Side-table production: the PC mapping table, the vmap table, the native
//! GC map, and the final `CompiledMethod` assembly.

use crate::compiled::{CompiledMethod, SrcMapElem};
use crate::leb128::{
    read_signed_leb128, read_unsigned_leb128, signed_leb128_size, unsigned_leb128_size,
    write_signed_leb128, write_unsigned_leb128,
};
use crate::mir::dataflow::update_reference_vregs;
use crate::mir::MirId;
use crate::storage::CompiledMethodStorage;

use super::lir::{LirOp, PseudoLir};
use super::regs::PromotionLocation;
use super::{CodeGen, Target};

/// Marker separating the core and fp halves of the vmap table.
pub const VMAP_FP_MARKER: u32 = 0xffff;

/// Build the encoded mapping table: safepoint pc→dex entries followed by
/// catch-handler dex→pc entries, each a pair of LEB128 delta streams.
pub fn create_mapping_tables<T: Target>(cg: &mut CodeGen<'_, T>) {
    let generate_src_map = cg.cu.options.generate_debug_info;

    let mut pc2dex_data_size = 0usize;
    let mut pc2dex_entries = 0u32;
    let mut pc2dex_offset = 0u32;
    let mut pc2dex_dalvik_offset = 0i32;
    let mut dex2pc_data_size = 0usize;
    let mut dex2pc_entries = 0u32;
    let mut dex2pc_offset = 0u32;
    let mut dex2pc_dalvik_offset = 0i32;

    let mut cursor = cg.first_lir;
    while let Some(id) = cursor {
        let lir = &cg.lirs[id];
        if !lir.flags.is_nop && lir.opcode == LirOp::Pseudo(PseudoLir::SafepointPc) {
            pc2dex_entries += 1;
            debug_assert!(pc2dex_offset <= lir.offset, "mapping table going backwards");
            pc2dex_data_size += unsigned_leb128_size(lir.offset - pc2dex_offset);
            pc2dex_data_size +=
                signed_leb128_size(lir.dalvik_offset as i32 - pc2dex_dalvik_offset);
            pc2dex_offset = lir.offset;
            pc2dex_dalvik_offset = lir.dalvik_offset as i32;
        }
        if !lir.flags.is_nop && lir.opcode == LirOp::Pseudo(PseudoLir::ExportedPc) {
            dex2pc_entries += 1;
            debug_assert!(dex2pc_offset <= lir.offset, "mapping table going backwards");
            dex2pc_data_size += unsigned_leb128_size(lir.offset - dex2pc_offset);
            dex2pc_data_size +=
                signed_leb128_size(lir.dalvik_offset as i32 - dex2pc_dalvik_offset);
            dex2pc_offset = lir.offset;
            dex2pc_dalvik_offset = lir.dalvik_offset as i32;
        }
        cursor = lir.next;
    }

    let total_entries = pc2dex_entries + dex2pc_entries;
    let mut table = Vec::with_capacity(
        unsigned_leb128_size(total_entries)
            + unsigned_leb128_size(pc2dex_entries)
            + pc2dex_data_size
            + dex2pc_data_size,
    );
    write_unsigned_leb128(&mut table, total_entries);
    write_unsigned_leb128(&mut table, pc2dex_entries);

    let mut dex2pc_stream = Vec::with_capacity(dex2pc_data_size);
    pc2dex_offset = 0;
    pc2dex_dalvik_offset = 0;
    dex2pc_offset = 0;
    dex2pc_dalvik_offset = 0;
    let mut in_prologue_or_epilogue = false;
    let mut cursor = cg.first_lir;
    while let Some(id) = cursor {
        let lir = &cg.lirs[id];
        if generate_src_map
            && !lir.flags.is_nop
            && matches!(lir.opcode, LirOp::Target(_))
            && !in_prologue_or_epilogue
        {
            cg.src_mapping.push(SrcMapElem { from: lir.offset, to: lir.dalvik_offset as i32 });
        }
        if !lir.flags.is_nop && lir.opcode == LirOp::Pseudo(PseudoLir::SafepointPc) {
            write_unsigned_leb128(&mut table, lir.offset - pc2dex_offset);
            write_signed_leb128(&mut table, lir.dalvik_offset as i32 - pc2dex_dalvik_offset);
            pc2dex_offset = lir.offset;
            pc2dex_dalvik_offset = lir.dalvik_offset as i32;
        }
        if !lir.flags.is_nop && lir.opcode == LirOp::Pseudo(PseudoLir::ExportedPc) {
            write_unsigned_leb128(&mut dex2pc_stream, lir.offset - dex2pc_offset);
            write_signed_leb128(
                &mut dex2pc_stream,
                lir.dalvik_offset as i32 - dex2pc_dalvik_offset,
            );
            dex2pc_offset = lir.offset;
            dex2pc_dalvik_offset = lir.dalvik_offset as i32;
        }
        match lir.opcode {
            LirOp::Pseudo(PseudoLir::PrologueBegin | PseudoLir::EpilogueBegin) => {
                in_prologue_or_epilogue = true;
            }
            LirOp::Pseudo(PseudoLir::PrologueEnd | PseudoLir::EpilogueEnd) => {
                in_prologue_or_epilogue = false;
            }
            _ => {}
        }
        cursor = lir.next;
    }
    table.extend_from_slice(&dex2pc_stream);
    cg.encoded_mapping_table = table;

    if cfg!(debug_assertions) {
        verify_catch_entries(cg);
        // Decoding must reproduce exactly what was encoded.
        let decoded = MappingTable::new(&cg.encoded_mapping_table);
        debug_assert_eq!(decoded.pc_to_dex_size(), pc2dex_entries);
        debug_assert_eq!(decoded.total_size(), total_entries);
    }
}

/// Check that every verified catch entry has an exported native PC.
fn verify_catch_entries<T: Target>(cg: &CodeGen<'_, T>) {
    let table = MappingTable::new(&cg.encoded_mapping_table);
    let mut dex_pcs: Vec<u32> = table.dex_to_pc_entries().map(|(_, dex_pc)| dex_pc).collect();
    dex_pcs.sort_unstable();
    for &catch_pc in &cg.graph.catches {
        if dex_pcs.binary_search(&catch_pc).is_err() {
            panic!("missing native PC for catch entry at {catch_pc:#x}");
        }
    }
}

/// Decoder for the encoded mapping table, used by verification and the
/// GC-map builder.
pub struct MappingTable<'a> {
    total_entries: u32,
    pc2dex_entries: u32,
    data: &'a [u8],
}

impl<'a> MappingTable<'a> {
    pub fn new(encoded: &'a [u8]) -> MappingTable<'a> {
        if encoded.is_empty() {
            return MappingTable { total_entries: 0, pc2dex_entries: 0, data: &[] };
        }
        let mut slice = encoded;
        let total_entries = read_unsigned_leb128(&mut slice);
        let pc2dex_entries = read_unsigned_leb128(&mut slice);
        MappingTable { total_entries, pc2dex_entries, data: slice }
    }

    pub fn total_size(&self) -> u32 {
        self.total_entries
    }

    pub fn pc_to_dex_size(&self) -> u32 {
        self.pc2dex_entries
    }

    /// `(native_pc, dex_pc)` pairs of the safepoint sub-stream.
    pub fn pc_to_dex_entries(&self) -> impl Iterator<Item = (u32, u32)> + 'a {
        DeltaStream { data: self.data, remaining: self.pc2dex_entries, pc: 0, dex: 0 }
    }

    /// `(native_pc, dex_pc)` pairs of the catch-handler sub-stream.
    pub fn dex_to_pc_entries(&self) -> impl Iterator<Item = (u32, u32)> + 'a {
        // Skip over the first sub-stream.
        let mut slice = self.data;
        for _ in 0..self.pc2dex_entries {
            read_unsigned_leb128(&mut slice);
            read_signed_leb128(&mut slice);
        }
        DeltaStream {
            data: slice,
            remaining: self.total_entries - self.pc2dex_entries,
            pc: 0,
            dex: 0,
        }
    }
}

struct DeltaStream<'a> {
    data: &'a [u8],
    remaining: u32,
    pc: u32,
    dex: i32,
}

impl Iterator for DeltaStream<'_> {
    type Item = (u32, u32);

    fn next(&mut self) -> Option<(u32, u32)> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        self.pc += read_unsigned_leb128(&mut self.data);
        self.dex += read_signed_leb128(&mut self.data);
        Some((self.pc, self.dex as u32))
    }
}

/// Build the native GC map: `(native_pc, reference bitmap)` per safepoint.
///
/// Reference liveness is replayed over each safepoint's block, seeded from
/// the verifier's map at the block entry and updated per MIR. The bit
/// buffers come out of the unit arena.
pub fn create_native_gc_map<T: Target>(cg: &mut CodeGen<'_, T>) {
    let num_vregs = usize::from(cg.graph.num_vregs);
    let verified = cg.cu.verified.clone();
    let arena = cg.cu.arena;

    // Per-safepoint bitmaps, still as bools.
    let mut entries: Vec<(u32, &[bool])> = Vec::with_capacity(cg.safepoints.len());
    let mut max_ref_vreg: i32 = -1;
    for &(lir_id, mir_id) in &cg.safepoints {
        let native_offset = cg.lirs[lir_id].offset;
        let refs =
            arena.alloc_slice(num_vregs, false, crate::arena::AllocKind::BitVector);
        match mir_id {
            Some(mir_id) => replay_references(cg, mir_id, refs, verified.as_deref()),
            // Prologue safepoint: the verifier's entry map is authoritative.
            None => {
                seed_references(cg.lirs[lir_id].dalvik_offset, refs, verified.as_deref())
            }
        }
        if let Some(highest) = refs.iter().rposition(|&b| b) {
            max_ref_vreg = max_ref_vreg.max(highest as i32);
        }
        entries.push((native_offset, refs));
    }
    entries.sort_by_key(|&(pc, _)| pc);
    entries.dedup_by_key(|&mut (pc, _)| pc);

    if entries.is_empty() {
        cg.native_gc_map = Vec::new();
        return;
    }

    let reg_width = ((max_ref_vreg + 8) / 8) as usize;
    let mut map = Vec::new();
    write_unsigned_leb128(&mut map, entries.len() as u32);
    write_unsigned_leb128(&mut map, reg_width as u32);
    for (native_offset, refs) in &entries {
        write_unsigned_leb128(&mut map, *native_offset);
        let mut bytes = vec![0u8; reg_width];
        for (vreg, &is_ref) in refs.iter().enumerate() {
            if is_ref && vreg / 8 < reg_width {
                bytes[vreg / 8] |= 1 << (vreg % 8);
            }
        }
        map.extend_from_slice(&bytes);
    }
    cg.native_gc_map = map;
}

fn seed_references(
    dex_pc: u32,
    refs: &mut [bool],
    verified: Option<&crate::verified::VerifiedMethod>,
) {
    if let Some(bits) = verified.and_then(|v| v.dex_gc_map.find_bitmap_at_or_before(dex_pc)) {
        for (vreg, slot) in refs.iter_mut().enumerate() {
            if vreg / 8 < bits.len() {
                *slot = bits[vreg / 8] & (1 << (vreg % 8)) != 0;
            }
        }
    }
}

fn replay_references<T: Target>(
    cg: &CodeGen<'_, T>,
    mir_id: MirId,
    refs: &mut [bool],
    verified: Option<&crate::verified::VerifiedMethod>,
) {
    let block = cg.graph.mir(mir_id).bb;
    let start_offset = cg.graph.block(block).start_offset;
    seed_references(start_offset, refs, verified);
    for step in cg.graph.block_mirs(block) {
        update_reference_vregs(cg.graph.mir(step), refs);
        if step == mir_id {
            break;
        }
    }
}

/// A decoded native GC map, for tests and the runtime shim.
pub struct NativeGcMap<'a> {
    pub reg_width: usize,
    entries: Vec<(u32, &'a [u8])>,
}

impl<'a> NativeGcMap<'a> {
    pub fn new(mut encoded: &'a [u8]) -> NativeGcMap<'a> {
        if encoded.is_empty() {
            return NativeGcMap { reg_width: 0, entries: Vec::new() };
        }
        let count = read_unsigned_leb128(&mut encoded);
        let reg_width = read_unsigned_leb128(&mut encoded) as usize;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let pc = read_unsigned_leb128(&mut encoded);
            entries.push((pc, &encoded[..reg_width]));
            encoded = &encoded[reg_width..];
        }
        NativeGcMap { reg_width, entries }
    }

    pub fn entries(&self) -> &[(u32, &'a [u8])] {
        &self.entries
    }

    pub fn find_bitmap(&self, native_pc: u32) -> Option<&'a [u8]> {
        self.entries
            .binary_search_by_key(&native_pc, |&(pc, _)| pc)
            .ok()
            .map(|i| self.entries[i].1)
    }
}

/// Combine the promotion results into the encoded vmap table.
fn build_vmap_table<T: Target>(cg: &CodeGen<'_, T>) -> Vec<u8> {
    let mut encoder = Vec::new();
    if cg.frame_size == 0 {
        debug_assert_eq!(cg.core_spill_mask.count_ones(), 0);
        debug_assert_eq!(cg.fp_spill_mask.count_ones(), 0);
        write_unsigned_leb128(&mut encoder, 0);
        return encoder;
    }
    let mut core_entries: Vec<u32> = Vec::new();
    let mut fp_entries: Vec<u32> = Vec::new();
    for (vreg, entry) in cg.promotion.map.iter().enumerate() {
        if entry.core_location == PromotionLocation::PhysReg {
            core_entries.push(vreg as u32);
        }
        if entry.fp_location == PromotionLocation::PhysReg {
            fp_entries.push(vreg as u32);
        }
    }
    core_entries.sort_unstable();
    fp_entries.sort_unstable();
    let size = core_entries.len() + 1 + fp_entries.len();
    write_unsigned_leb128(&mut encoder, size as u32);
    for &vreg in &core_entries {
        write_unsigned_leb128(&mut encoder, vreg);
    }
    write_unsigned_leb128(&mut encoder, VMAP_FP_MARKER);
    for &vreg in &fp_entries {
        write_unsigned_leb128(&mut encoder, vreg);
    }
    encoder
}

/// Seal the method: encode remaining tables, sort patches, and intern the
/// components. Returns `None` when no code was produced.
pub fn get_compiled_method<T: Target>(
    cg: &mut CodeGen<'_, T>,
    storage: &CompiledMethodStorage,
) -> Option<CompiledMethod> {
    if cg.code_buffer.is_empty() {
        return None;
    }
    let vmap_table = build_vmap_table(cg);
    let cfi_bytes = if cg.cfi.enabled() {
        let lirs = &cg.lirs;
        cg.cfi.finish(
            cg.total_size,
            cg.target.dwarf_return_address_reg(),
            cg.target.dwarf_stack_pointer_reg(),
            |lir| lirs[lir].offset + lirs[lir].size,
        )
    } else {
        Vec::new()
    };

    // Sort patches by literal offset so the artifact writer applies them
    // in one forward scan.
    cg.patches.sort_by_key(|patch| patch.literal_offset());

    Some(CompiledMethod {
        instruction_set: T::ISA,
        code: storage.dedupe_code(&cg.code_buffer),
        frame_size_in_bytes: cg.frame_size,
        core_spill_mask: cg.core_spill_mask,
        fp_spill_mask: cg.fp_spill_mask,
        src_mapping_table: storage.dedupe_src_mapping(&cg.src_mapping),
        mapping_table: storage.dedupe_mapping_table(&cg.encoded_mapping_table),
        vmap_table: storage.dedupe_vmap_table(&vmap_table),
        gc_map: storage.dedupe_gc_map(&cg.native_gc_map),
        cfi_info: storage.dedupe_cfi(&cfi_bytes),
        patches: if cg.cu.options.include_patch_information {
            storage.dedupe_patches(&cg.patches)
        } else {
            storage.dedupe_patches(&[])
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_table_round_trip() {
        // Hand-encode two safepoints and one catch entry.
        let mut encoded = Vec::new();
        write_unsigned_leb128(&mut encoded, 3); // total
        write_unsigned_leb128(&mut encoded, 2); // pc2dex
        write_unsigned_leb128(&mut encoded, 8); // pc 8
        write_signed_leb128(&mut encoded, 3); // dex 3
        write_unsigned_leb128(&mut encoded, 4); // pc 12
        write_signed_leb128(&mut encoded, -1); // dex 2
        write_unsigned_leb128(&mut encoded, 20); // pc 20
        write_signed_leb128(&mut encoded, 6); // dex 6

        let table = MappingTable::new(&encoded);
        assert_eq!(table.total_size(), 3);
        assert_eq!(table.pc_to_dex_size(), 2);
        let pc2dex: Vec<_> = table.pc_to_dex_entries().collect();
        assert_eq!(pc2dex, [(8, 3), (12, 2)]);
        let dex2pc: Vec<_> = table.dex_to_pc_entries().collect();
        assert_eq!(dex2pc, [(20, 6)]);
    }

    #[test]
    fn gc_map_round_trip() {
        let mut encoded = Vec::new();
        write_unsigned_leb128(&mut encoded, 2); // entries
        write_unsigned_leb128(&mut encoded, 1); // width
        write_unsigned_leb128(&mut encoded, 4);
        encoded.push(0b0000_0001);
        write_unsigned_leb128(&mut encoded, 12);
        encoded.push(0b0000_0011);

        let map = NativeGcMap::new(&encoded);
        assert_eq!(map.reg_width, 1);
        assert_eq!(map.find_bitmap(4), Some(&[0b0000_0001][..]));
        assert_eq!(map.find_bitmap(12), Some(&[0b0000_0011][..]));
        assert_eq!(map.find_bitmap(8), None);
    }
}
