//! Field and method lowering-info caches.
//!
//! One walk over the MIR finds every field access and invoke, collapses
//! duplicate sites to a single cache entry (first-seen order), resolves the
//! unique entries through the class linker, and leaves a small index in
//! each MIR's `meta`. Codegen then never talks to the linker.

use std::collections::BTreeMap;

use crate::arena::{AllocKind, ScopedArena};
use crate::dex::{DexFile, InvokeType, MethodReference};
use crate::insn::Opcode;
use crate::linker::{ClassLinker, FieldInfo, MethodInfo};
use crate::mir::{BlockType, MethodKey, MirGraph, MirMeta, MirOpcode};
use crate::verified::VerifiedMethod;

/// High bit of a field cache key: the site came from a quickened opcode and
/// the low bits are the MIR offset, not a field index. Keeps dequickened
/// sites from deduplicating against normal ones.
const FIELD_INDEX_FLAG_QUICKENED: u32 = 0x8000_0000;

/// Memory widths of field accesses.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MemAccessType {
    Word,
    Wide,
    Object,
    Boolean,
    Byte,
    Char,
    Short,
}

impl MemAccessType {
    fn of_iget_iput(op: Opcode) -> MemAccessType {
        match op {
            Opcode::Iget | Opcode::Iput | Opcode::IgetQuick | Opcode::IputQuick => Self::Word,
            Opcode::IgetWide | Opcode::IputWide | Opcode::IgetWideQuick | Opcode::IputWideQuick => {
                Self::Wide
            }
            Opcode::IgetObject
            | Opcode::IputObject
            | Opcode::IgetObjectQuick
            | Opcode::IputObjectQuick => Self::Object,
            Opcode::IgetBoolean | Opcode::IputBoolean => Self::Boolean,
            Opcode::IgetByte | Opcode::IputByte => Self::Byte,
            Opcode::IgetChar | Opcode::IputChar => Self::Char,
            Opcode::IgetShort | Opcode::IputShort => Self::Short,
            _ => panic!("not an instance field opcode: {op:?}"),
        }
    }

    fn of_sget_sput(op: Opcode) -> MemAccessType {
        match op {
            Opcode::Sget | Opcode::Sput => Self::Word,
            Opcode::SgetWide | Opcode::SputWide => Self::Wide,
            Opcode::SgetObject | Opcode::SputObject => Self::Object,
            Opcode::SgetBoolean | Opcode::SputBoolean => Self::Boolean,
            Opcode::SgetByte | Opcode::SputByte => Self::Byte,
            Opcode::SgetChar | Opcode::SputChar => Self::Char,
            Opcode::SgetShort | Opcode::SputShort => Self::Short,
            _ => panic!("not a static field opcode: {op:?}"),
        }
    }
}

/// Cached lowering info for one unique instance-field site.
#[derive(Clone, Debug)]
pub struct IFieldLoweringInfo {
    pub field_idx: u32,
    pub access_type: MemAccessType,
    pub is_quickened: bool,
    /// `None` until resolution; stays `None` for unresolved sites, which
    /// lower to runtime resolution calls.
    pub resolved: Option<FieldInfo>,
}

impl IFieldLoweringInfo {
    pub fn fast_get(&self) -> bool {
        self.resolved.is_some()
    }

    pub fn fast_put(&self) -> bool {
        self.resolved.is_some()
    }
}

/// Cached lowering info for one unique static-field site.
#[derive(Clone, Debug)]
pub struct SFieldLoweringInfo {
    pub field_idx: u32,
    pub access_type: MemAccessType,
    pub resolved: Option<FieldInfo>,
}

/// Cached lowering info for one unique invoke site.
#[derive(Clone, Debug)]
pub struct MethodLoweringInfo {
    pub target: MethodReference,
    pub invoke_type: InvokeType,
    /// Dispatch after devirtualization and sharpening.
    pub sharp_type: InvokeType,
    pub is_quickened: bool,
    pub vtable_index: u32,
    pub devirt_target: Option<MethodReference>,
    pub direct_code: u64,
    pub direct_method: u64,
    pub needs_class_initialization: bool,
    pub resolved: bool,
}

impl MethodLoweringInfo {
    pub fn fast_path(&self) -> bool {
        self.resolved
    }
}

fn invoke_type_of(op: Opcode) -> InvokeType {
    match op {
        Opcode::InvokeStatic | Opcode::InvokeStaticRange => InvokeType::Static,
        Opcode::InvokeDirect | Opcode::InvokeDirectRange => InvokeType::Direct,
        Opcode::InvokeSuper | Opcode::InvokeSuperRange => InvokeType::Super,
        Opcode::InvokeInterface | Opcode::InvokeInterfaceRange => InvokeType::Interface,
        _ => InvokeType::Virtual,
    }
}

/// Populate [`MirGraph::ifield_lowering_infos`] and
/// [`MirGraph::sfield_lowering_infos`], and point each field MIR at its
/// entry.
///
/// Instance fields pack from the front of one scratch array and static
/// fields from the back; a linear scan from the insertion point finds
/// duplicates faster than a map for the handful of fields real methods
/// touch.
pub fn cache_field_lowering_info(
    graph: &mut MirGraph,
    allocator: &ScopedArena,
    dex_file: &DexFile,
    linker: &dyn ClassLinker,
) {
    // Every field access is 2 code units and a method ends with a return.
    let max_refs = graph.num_dalvik_insns.saturating_sub(1) / 2;
    if max_refs == 0 {
        return;
    }
    let field_idxs: &mut [u32] = allocator.alloc_slice(max_refs, 0u32, AllocKind::LoweringInfo);
    let field_types: &mut [MemAccessType] =
        allocator.alloc_slice(max_refs, MemAccessType::Word, AllocKind::LoweringInfo);

    let mut ifield_pos = 0usize;
    let mut sfield_pos = max_refs;

    let blocks: Vec<_> = graph.all_blocks().collect();
    for block in blocks {
        if !matches!(graph.block(block).block_type, BlockType::DalvikByteCode | BlockType::Catch) {
            continue;
        }
        let mirs: Vec<_> = graph.block_mirs(block).collect();
        for mir_id in mirs {
            let mir = graph.mir(mir_id);
            let op = match mir.opcode.dex() {
                Some(op) => op,
                None => continue,
            };
            if op.is_iget_or_iput() || op.is_iget_or_iput_quick() {
                let (field_idx, access_type) = if op.is_iget_or_iput() {
                    (mir.dalvik.vc, MemAccessType::of_iget_iput(op))
                } else {
                    // Quickened: key on the MIR offset so distinct sites
                    // stay distinct.
                    (mir.offset | FIELD_INDEX_FLAG_QUICKENED, MemAccessType::of_iget_iput(op))
                };
                // Duplicates are usually recent; search backwards.
                let mut i = ifield_pos;
                while i != 0 && field_idxs[i - 1] != field_idx {
                    i -= 1;
                }
                let index = if i != 0 {
                    debug_assert_eq!(field_types[i - 1], access_type);
                    i - 1
                } else {
                    field_idxs[ifield_pos] = field_idx;
                    field_types[ifield_pos] = access_type;
                    ifield_pos += 1;
                    ifield_pos - 1
                };
                graph.mir_mut(mir_id).meta = MirMeta::IFieldInfo(index as u16);
            } else if op.is_sget_or_sput() {
                let field_idx = mir.dalvik.vb;
                let access_type = MemAccessType::of_sget_sput(op);
                let mut i = sfield_pos;
                while i != max_refs && field_idxs[i] != field_idx {
                    i += 1;
                }
                let index = if i != max_refs {
                    debug_assert_eq!(field_types[i], access_type);
                    max_refs - i - 1
                } else {
                    sfield_pos -= 1;
                    field_idxs[sfield_pos] = field_idx;
                    field_types[sfield_pos] = access_type;
                    max_refs - sfield_pos - 1
                };
                graph.mir_mut(mir_id).meta = MirMeta::SFieldInfo(index as u16);
            }
            debug_assert!(ifield_pos <= sfield_pos);
        }
    }

    graph.ifield_lowering_infos.reserve(ifield_pos);
    for pos in 0..ifield_pos {
        let key = field_idxs[pos];
        let is_quickened = key & FIELD_INDEX_FLAG_QUICKENED != 0;
        let field_idx = key & !FIELD_INDEX_FLAG_QUICKENED;
        // Quickened sites already carry the field offset in the bytecode;
        // the linker cannot resolve a dex offset.
        let resolved =
            if is_quickened { None } else { linker.resolve_field(dex_file, field_idx, false) };
        graph.ifield_lowering_infos.push(IFieldLoweringInfo {
            field_idx,
            access_type: field_types[pos],
            is_quickened,
            resolved,
        });
    }

    let num_sfields = max_refs - sfield_pos;
    graph.sfield_lowering_infos.reserve(num_sfields);
    for n in 0..num_sfields {
        let pos = max_refs - n - 1;
        let field_idx = field_idxs[pos];
        graph.sfield_lowering_infos.push(SFieldLoweringInfo {
            field_idx,
            access_type: field_types[pos],
            resolved: linker.resolve_field(dex_file, field_idx, true),
        });
    }
}

/// Populate [`MirGraph::method_lowering_infos`] and point each invoke MIR
/// at its entry. Devirtualization targets come from the verifier.
pub fn cache_method_lowering_info(
    graph: &mut MirGraph,
    dex_file: &DexFile,
    linker: &dyn ClassLinker,
    verified: Option<&VerifiedMethod>,
) {
    // Ordered map so cache indices are deterministic under any MIR walk
    // order.
    let mut index_by_key: BTreeMap<MethodKey, u16> = BTreeMap::new();

    let blocks: Vec<_> = graph.all_blocks().collect();
    for block in blocks {
        if !matches!(graph.block(block).block_type, BlockType::DalvikByteCode | BlockType::Catch) {
            continue;
        }
        let mirs: Vec<_> = graph.block_mirs(block).collect();
        for mir_id in mirs {
            let mir = graph.mir(mir_id);
            let op = match mir.opcode.dex() {
                Some(op) if op.is_invoke() => op,
                _ => continue,
            };
            let quickened =
                matches!(op, Opcode::InvokeVirtualQuick | Opcode::InvokeVirtualRangeQuick);
            let target_method_idx = mir.dalvik.vb;
            let invoke_type = invoke_type_of(op);
            let devirt_target = verified.and_then(|v| v.devirt_target(mir.offset));
            let key = MethodKey {
                method_idx: target_method_idx,
                invoke_kind: invoke_type as u8,
                // Quickened invokes carry the vtable index in place of a
                // method index.
                vtable_idx: if quickened { target_method_idx } else { 0 },
                devirt_target,
            };
            let next_index = index_by_key.len() as u16;
            let index = *index_by_key.entry(key).or_insert(next_index);
            if usize::from(index) == graph.method_lowering_infos.len() {
                graph.method_lowering_infos.push(make_method_info(
                    dex_file,
                    linker,
                    target_method_idx,
                    invoke_type,
                    quickened,
                    devirt_target,
                ));
            }
            graph.mir_mut(mir_id).meta = MirMeta::MethodInfo(index);
        }
    }
}

fn make_method_info(
    dex_file: &DexFile,
    linker: &dyn ClassLinker,
    method_idx: u32,
    invoke_type: InvokeType,
    quickened: bool,
    devirt_target: Option<MethodReference>,
) -> MethodLoweringInfo {
    let target = MethodReference::new(dex_file.id, method_idx);
    let mut info = MethodLoweringInfo {
        target,
        invoke_type,
        sharp_type: invoke_type,
        is_quickened: quickened,
        vtable_index: if quickened { method_idx } else { 0 },
        devirt_target,
        direct_code: 0,
        direct_method: 0,
        needs_class_initialization: false,
        resolved: false,
    };
    if quickened {
        // Already sharpened to a vtable slot by the dequickener.
        info.resolved = true;
        return info;
    }
    // A devirtualized virtual call resolves like a direct call to the
    // proven target.
    let (resolve_idx, resolve_type) = match devirt_target {
        Some(devirt) if devirt.dex_file == dex_file.id => (devirt.method_idx, InvokeType::Direct),
        _ => (method_idx, invoke_type),
    };
    if let Some(resolved) = linker.resolve_method(dex_file, resolve_idx, resolve_type) {
        info.sharp_type = resolved.sharp_type;
        info.vtable_index = resolved.vtable_index;
        info.direct_code = resolved.direct_code;
        info.direct_method = resolved.direct_method;
        info.needs_class_initialization = resolved.needs_class_initialization;
        info.target = resolved.target;
        info.resolved = true;
    } else if let Some(devirt) = devirt_target {
        // Cross-dex devirtualization: keep the hint, dispatch direct.
        info.sharp_type = InvokeType::Direct;
        info.target = devirt;
        info.resolved = true;
    }
    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{ArenaPool, ArenaStack};
    use crate::dex::CodeItem;
    use crate::linker::NullClassLinker;
    use crate::mir::build::build_graph;

    fn dex() -> DexFile {
        DexFile::new(crate::dex::DexFileId(0), "test.dex".into(), 0, vec![])
    }

    #[test]
    fn duplicate_ifield_sites_share_an_entry() {
        // iget v0, v1, field@7; iget v0, v1, field@7; return-void
        let item = CodeItem {
            registers_size: 2,
            ins_size: 1,
            outs_size: 0,
            insns: vec![0x1052, 0x0007, 0x1052, 0x0007, 0x000e],
            tries: vec![],
        };
        let mut graph = build_graph(&item);
        let pool = ArenaPool::new();
        let stack = ArenaStack::new(&pool);
        cache_field_lowering_info(&mut graph, &stack.scope(), &dex(), &NullClassLinker);
        assert_eq!(graph.ifield_lowering_infos.len(), 1);
        assert_eq!(graph.ifield_lowering_infos[0].field_idx, 7);
        let indices: Vec<u16> = graph
            .mirs
            .values()
            .filter_map(|m| match m.meta {
                MirMeta::IFieldInfo(i) => Some(i),
                _ => None,
            })
            .collect();
        assert_eq!(indices, [0, 0]);
    }

    #[test]
    fn static_and_instance_fields_pack_separately() {
        // sget v0, field@3; iget v0, v1, field@3; return-void
        let item = CodeItem {
            registers_size: 2,
            ins_size: 1,
            outs_size: 0,
            insns: vec![0x0060, 0x0003, 0x1052, 0x0003, 0x000e],
            tries: vec![],
        };
        let mut graph = build_graph(&item);
        let pool = ArenaPool::new();
        let stack = ArenaStack::new(&pool);
        cache_field_lowering_info(&mut graph, &stack.scope(), &dex(), &NullClassLinker);
        assert_eq!(graph.ifield_lowering_infos.len(), 1);
        assert_eq!(graph.sfield_lowering_infos.len(), 1);
        assert_eq!(graph.sfield_lowering_infos[0].field_idx, 3);
    }

    #[test]
    fn invoke_sites_get_method_infos() {
        // invoke-static {}, method@5; invoke-static {}, method@5; return-void
        let item = CodeItem {
            registers_size: 1,
            ins_size: 0,
            outs_size: 0,
            insns: vec![0x0071, 0x0005, 0x0000, 0x0071, 0x0005, 0x0000, 0x000e],
            tries: vec![],
        };
        let mut graph = build_graph(&item);
        cache_method_lowering_info(&mut graph, &dex(), &NullClassLinker, None);
        assert_eq!(graph.method_lowering_infos.len(), 1);
        let info = &graph.method_lowering_infos[0];
        assert_eq!(info.invoke_type, InvokeType::Static);
        assert!(!info.resolved);
    }
}
