//! The compilation artifact: code bytes plus the side tables that make
//! them safepoint-safe and GC-correct, and the fixed header that precedes
//! the code in the output container.

use std::sync::Arc;

use crate::dex::{DexFileId, MethodReference};
use crate::options::InstructionSet;

/// One `(native_pc, dex_pc)` debug source mapping.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct SrcMapElem {
    pub from: u32,
    pub to: i32,
}

/// A deferred relocation applied when the artifact is finalized.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum LinkerPatch {
    /// Direct pointer to another method's code.
    Code { literal_offset: u32, target: MethodReference },
    /// Pointer to an `ArtMethod`.
    Method { literal_offset: u32, target: MethodReference },
    /// Pointer to a class object.
    Type { literal_offset: u32, dex_file: DexFileId, type_idx: u32 },
    /// Pointer to an interned string.
    String { literal_offset: u32, dex_file: DexFileId, string_idx: u32 },
    /// PC-relative call, possibly across dex files.
    RelativeCall { literal_offset: u32, target: MethodReference },
}

impl LinkerPatch {
    pub fn literal_offset(&self) -> u32 {
        match *self {
            LinkerPatch::Code { literal_offset, .. }
            | LinkerPatch::Method { literal_offset, .. }
            | LinkerPatch::Type { literal_offset, .. }
            | LinkerPatch::String { literal_offset, .. }
            | LinkerPatch::RelativeCall { literal_offset, .. } => literal_offset,
        }
    }
}

/// The fixed-size header immediately preceding the code bytes. All fields
/// are little-endian `u32`; the table offsets point backwards from the
/// start of the code.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QuickMethodHeader {
    pub mapping_table_offset: u32,
    pub vmap_table_offset: u32,
    pub frame_size_in_bytes: u32,
    pub core_spill_mask: u32,
    pub fp_spill_mask: u32,
    pub code_size: u32,
}

impl QuickMethodHeader {
    pub const SIZE: usize = 24;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        for (index, value) in [
            self.mapping_table_offset,
            self.vmap_table_offset,
            self.frame_size_in_bytes,
            self.core_spill_mask,
            self.fp_spill_mask,
            self.code_size,
        ]
        .into_iter()
        .enumerate()
        {
            out[index * 4..index * 4 + 4].copy_from_slice(&value.to_le_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8; Self::SIZE]) -> QuickMethodHeader {
        let field = |index: usize| {
            u32::from_le_bytes(bytes[index * 4..index * 4 + 4].try_into().unwrap())
        };
        QuickMethodHeader {
            mapping_table_offset: field(0),
            vmap_table_offset: field(1),
            frame_size_in_bytes: field(2),
            core_spill_mask: field(3),
            fp_spill_mask: field(4),
            code_size: field(5),
        }
    }
}

/// A compiled method. Immutable; the byte components are interned through
/// [`crate::storage::CompiledMethodStorage`] so identical outputs share
/// memory.
#[derive(Clone, Debug)]
pub struct CompiledMethod {
    pub instruction_set: InstructionSet,
    pub code: Arc<[u8]>,
    pub frame_size_in_bytes: u32,
    pub core_spill_mask: u32,
    pub fp_spill_mask: u32,
    pub src_mapping_table: Arc<[SrcMapElem]>,
    pub mapping_table: Arc<[u8]>,
    pub vmap_table: Arc<[u8]>,
    pub gc_map: Arc<[u8]>,
    pub cfi_info: Arc<[u8]>,
    pub patches: Arc<[LinkerPatch]>,
}

impl CompiledMethod {
    /// Code size excluding any trailing data section.
    pub fn code_size(&self) -> u32 {
        self.code.len() as u32
    }

    /// Produce the container image for this method: maps, header, then
    /// aligned code. Returns the image and the offset of the code within
    /// it.
    pub fn emit_with_header(&self) -> (Vec<u8>, usize) {
        let alignment = self.instruction_set.code_alignment() as usize;
        let mut out = Vec::new();
        out.extend_from_slice(&self.mapping_table);
        let mapping_table_end = out.len();
        out.extend_from_slice(&self.vmap_table);

        // Pad so that the code that follows the header lands aligned.
        while (out.len() + QuickMethodHeader::SIZE) % alignment != 0 {
            out.push(0);
        }
        let code_start = out.len() + QuickMethodHeader::SIZE;
        // Offsets point backwards from the start of the code to the start
        // of each table.
        let header = QuickMethodHeader {
            mapping_table_offset: if self.mapping_table.is_empty() {
                0
            } else {
                code_start as u32
            },
            vmap_table_offset: if self.vmap_table.is_empty() {
                0
            } else {
                (code_start - mapping_table_end) as u32
            },
            frame_size_in_bytes: self.frame_size_in_bytes,
            core_spill_mask: self.core_spill_mask,
            fp_spill_mask: self.fp_spill_mask,
            code_size: self.code_size(),
        };
        out.extend_from_slice(&header.encode());
        debug_assert_eq!(out.len(), code_start);
        out.extend_from_slice(&self.code);
        (out, code_start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = QuickMethodHeader {
            mapping_table_offset: 40,
            vmap_table_offset: 28,
            frame_size_in_bytes: 64,
            core_spill_mask: 0x4ff0,
            fp_spill_mask: 0,
            code_size: 128,
        };
        assert_eq!(QuickMethodHeader::decode(&header.encode()), header);
    }

    #[test]
    fn patches_sort_by_literal_offset() {
        let target = MethodReference::new(DexFileId(0), 1);
        let mut patches = vec![
            LinkerPatch::Method { literal_offset: 8, target },
            LinkerPatch::Code { literal_offset: 4, target },
        ];
        patches.sort_by_key(|p| p.literal_offset());
        assert_eq!(patches[0].literal_offset(), 4);
    }
}
