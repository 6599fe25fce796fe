//! Two-pass assembly: assign offsets, then emit, retrying with widened
//! encodings when a branch turns out to be out of range.

use cranelift_entity::PrimaryMap;

use crate::compiled::LinkerPatch;
use crate::options::InstructionSet;

use super::lir::{CodeOffset, Lir, LirId, LirOp};
use super::{CodeGen, Target};

/// The reference point table displacements are measured from, per ISA:
/// Thumb2's anchor materializes the PC, which reads four bytes ahead;
/// x86-64's anchor is RIP-relative to the table itself; every other ISA
/// uses the anchor offset as-is. The anchor encoders and the installer
/// must agree, so both go through here.
pub fn table_reference_offset(
    isa: InstructionSet,
    anchor_offset: CodeOffset,
    table_offset: CodeOffset,
) -> CodeOffset {
    match isa {
        InstructionSet::Thumb2 => anchor_offset + 4,
        InstructionSet::X86_64 => table_offset,
        InstructionSet::Arm64 | InstructionSet::X86 | InstructionSet::Mips => anchor_offset,
    }
}

/// Returned by an encoder that cannot reach its target in the current
/// form; the offending LIR is rewritten to its long form and assembly
/// restarts from offset assignment.
#[derive(Debug)]
pub struct WidenRequest;

/// Read-only context handed to the per-ISA encoders.
pub struct AsmEnv<'e, Op> {
    pub lirs: &'e PrimaryMap<LirId, Lir<Op>>,
    /// Base offsets of the five literal pools, indexed by
    /// [`super::LiteralPool`].
    pub pool_base: [CodeOffset; 5],
    pub switch_table_offsets: &'e [CodeOffset],
    pub fill_array_offsets: &'e [CodeOffset],
}

impl<Op> AsmEnv<'_, Op> {
    pub fn label_offset(&self, label: LirId) -> CodeOffset {
        self.lirs[label].offset
    }
}

/// Assemble the LIR list into `cg.code_buffer` and install the data
/// section. Panics if the retry budget is exhausted, which a finite LIR
/// list cannot do unless an encoder fails to widen.
pub fn assemble_lir<T: Target>(cg: &mut CodeGen<'_, T>) {
    if cg.first_lir.is_none() {
        return;
    }
    // Each retry widens at least one instruction permanently, so the
    // number of instructions bounds the loop.
    let max_retries = cg.lirs.len() + 8;
    let mut code_size;
    let mut buf: Vec<u8>;
    let mut retries = 0;
    loop {
        code_size = assign_offsets(cg);
        let data_layout = assign_data_offsets(cg, code_size);
        buf = Vec::with_capacity(cg.total_size as usize);

        let mut widened_any = false;
        let ids: Vec<LirId> = iter_list(cg);
        let switch_offsets: Vec<CodeOffset> =
            cg.switch_tables.iter().map(|t| t.offset).collect();
        let fill_offsets: Vec<CodeOffset> =
            cg.fill_array_data.iter().map(|t| t.offset).collect();
        {
            let env = AsmEnv {
                lirs: &cg.lirs,
                pool_base: data_layout,
                switch_table_offsets: &switch_offsets,
                fill_array_offsets: &fill_offsets,
            };
            for &id in &ids {
                let lir = &env.lirs[id];
                if lir.flags.is_nop || matches!(lir.opcode, LirOp::Pseudo(_)) {
                    continue;
                }
                debug_assert_eq!(buf.len() as CodeOffset, lir.offset);
                if T::encode(lir, &env, &mut buf).is_err() {
                    widened_any = true;
                    break;
                }
            }
        }
        if !widened_any {
            break;
        }
        // The encoder reported the failure; the offending instruction is
        // the one whose byte range the buffer stopped inside (composite
        // encoders may have pushed a prefix before validating the range).
        let emitted = buf.len() as CodeOffset;
        let victim = ids
            .iter()
            .copied()
            .find(|&id| {
                let lir = &cg.lirs[id];
                !lir.flags.is_nop
                    && !matches!(lir.opcode, LirOp::Pseudo(_))
                    && lir.offset <= emitted
                    && emitted < lir.offset + lir.size.max(1)
            })
            .expect("widen request without a matching instruction");
        assert!(!cg.lirs[victim].flags.widened, "instruction widened twice");
        cg.lirs[victim].flags.widened = true;
        retries += 1;
        assert!(retries <= max_retries, "assembly retry budget exhausted");
        log::trace!("assembly retry {retries}: widened {victim:?}");
    }

    // Pad the code to the ISA's alignment before the data section.
    debug_assert_eq!(buf.len() as CodeOffset, code_size);
    while (buf.len() as CodeOffset) < cg.data_offset {
        buf.push(0);
    }
    install_data(cg, &mut buf);
    while buf.len() % T::ISA.code_alignment() as usize != 0 {
        buf.push(0);
    }
    cg.total_size = buf.len() as CodeOffset;
    cg.code_buffer = buf;

    // Relative-call sites become patches now that offsets are final.
    for &(lir, target) in &cg.relative_call_sites {
        cg.patches.push(LinkerPatch::RelativeCall {
            literal_offset: cg.lirs[lir].offset,
            target,
        });
    }
}

fn iter_list<T: Target>(cg: &CodeGen<'_, T>) -> Vec<LirId> {
    let mut out = Vec::with_capacity(cg.lirs.len());
    let mut cursor = cg.first_lir;
    while let Some(id) = cursor {
        out.push(id);
        cursor = cg.lirs[id].next;
    }
    out
}

/// First pass: compute each instruction's size and byte offset.
fn assign_offsets<T: Target>(cg: &mut CodeGen<'_, T>) -> CodeOffset {
    let ids = iter_list(cg);
    let mut offset: CodeOffset = 0;
    for id in ids {
        let size = {
            let lir = &cg.lirs[id];
            if lir.flags.is_nop || matches!(lir.opcode, LirOp::Pseudo(_)) {
                0
            } else {
                T::inst_size(lir)
            }
        };
        let lir = &mut cg.lirs[id];
        lir.offset = offset;
        lir.size = size;
        offset += size;
    }
    offset
}

/// Lay out the data section after the code: word pool, pointer pools,
/// switch tables, fill-array payloads. Returns the pool base offsets.
fn assign_data_offsets<T: Target>(cg: &mut CodeGen<'_, T>, code_size: CodeOffset) -> [CodeOffset; 5] {
    let mut offset = code_size.next_multiple_of(4);
    cg.data_offset = offset;

    let word_base = offset;
    offset += cg.word_pool.len() as CodeOffset * 4;
    let code_base = offset;
    offset += cg.code_pool.len() as CodeOffset * 4;
    let method_base = offset;
    offset += cg.method_pool.len() as CodeOffset * 4;
    let class_base = offset;
    offset += cg.class_pool.len() as CodeOffset * 4;
    let string_base = offset;
    offset += cg.string_pool.len() as CodeOffset * 4;

    for table in &mut cg.switch_tables {
        offset = offset.next_multiple_of(4);
        table.offset = offset;
        offset += table.size_in_bytes();
    }
    for fill in &mut cg.fill_array_data {
        offset = offset.next_multiple_of(4);
        fill.offset = offset;
        offset += fill.size_in_bytes();
    }
    cg.total_size = offset;
    [word_base, code_base, method_base, class_base, string_base]
}

/// Serialize the data section into the buffer, recording linker patches
/// for the pointer pools.
fn install_data<T: Target>(cg: &mut CodeGen<'_, T>, buf: &mut Vec<u8>) {
    fn push_u32(buf: &mut Vec<u8>, value: u32) {
        buf.extend_from_slice(&value.to_le_bytes());
    }
    fn align4(buf: &mut Vec<u8>) {
        while buf.len() % 4 != 0 {
            buf.push(0);
        }
    }

    for &word in &cg.word_pool {
        push_u32(buf, word as u32);
    }
    for &target in &cg.code_pool {
        cg.patches.push(LinkerPatch::Code { literal_offset: buf.len() as u32, target });
        push_u32(buf, 0);
    }
    for &target in &cg.method_pool {
        cg.patches.push(LinkerPatch::Method { literal_offset: buf.len() as u32, target });
        push_u32(buf, 0);
    }
    for &(dex_file, type_idx) in &cg.class_pool {
        cg.patches.push(LinkerPatch::Type {
            literal_offset: buf.len() as u32,
            dex_file,
            type_idx,
        });
        push_u32(buf, 0);
    }
    for &(dex_file, string_idx) in &cg.string_pool {
        cg.patches.push(LinkerPatch::String {
            literal_offset: buf.len() as u32,
            dex_file,
            string_idx,
        });
        push_u32(buf, 0);
    }

    install_switch_tables(cg, buf);

    for fill in &cg.fill_array_data {
        align4(buf);
        debug_assert_eq!(buf.len() as CodeOffset, fill.offset);
        for &unit in fill.data {
            buf.extend_from_slice(&unit.to_le_bytes());
        }
    }
}

/// Write the switch tables. Case displacements are relative to the
/// anchor's per-ISA reference point, which is the address the dispatch
/// sequence adds them to at run time.
fn install_switch_tables<T: Target>(cg: &mut CodeGen<'_, T>, buf: &mut Vec<u8>) {
    let switch_tables = std::mem::take(&mut cg.switch_tables);
    for table in &switch_tables {
        while buf.len() % 4 != 0 {
            buf.push(0);
        }
        debug_assert_eq!(buf.len() as CodeOffset, table.offset);
        let anchor = table.anchor.expect("switch table without an anchor");
        let reference_offset =
            table_reference_offset(T::ISA, cg.lirs[anchor].offset, table.offset);
        if table.is_sparse {
            // Keys first, then displacements, matching the scan loop.
            for &key in table.keys {
                buf.extend_from_slice(&key.to_le_bytes());
            }
            for &target in table.targets {
                let label = cg.block_labels[target].expect("case target has no label");
                let disp = cg.lirs[label].offset as i64 - reference_offset as i64;
                buf.extend_from_slice(&(disp as i32).to_le_bytes());
            }
        } else {
            for &target in table.targets {
                let label = cg.block_labels[target].expect("case target has no label");
                let disp = cg.lirs[label].offset as i64 - reference_offset as i64;
                buf.extend_from_slice(&(disp as i32).to_le_bytes());
            }
        }
    }
    cg.switch_tables = switch_tables;
}
