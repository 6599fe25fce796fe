//! The optimization pass driver and the passes themselves.
//!
//! Every pass reads and writes MIR in place and must not invalidate block
//! ids. Each is gated by a bit in the compilation unit's disable mask and
//! can additionally be skipped per ISA through the same mask. The passes
//! here work block-locally: without SSA form a cross-block fact is only
//! trusted when it is true on every path, and the block-local versions of
//! these optimizations catch nearly all of what the bytecode offers while
//! staying trivially sound.

use cranelift_bitset::CompoundBitSet;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::dex::DexFile;
use crate::inliner::{DexFileMethodInliner, InlinePattern};
use crate::insn::{DecodedInsn, Opcode};
use crate::mir::dataflow::compute_ssa_rep;
use crate::mir::lowering::{IFieldLoweringInfo, MemAccessType};
use crate::mir::{opt_flags, Block, BlockType, Mir, MirGraph, MirId, MirMeta, MirOpcode, PseudoOp};
use crate::options::Optimization;

/// Everything a pass may look at besides the graph.
pub struct PassContext<'a> {
    pub dex_file: &'a DexFile,
    pub disable_opt: u32,
    pub verbose: bool,
    pub dump_passes: bool,
    pub inliner: Option<&'a DexFileMethodInliner>,
}

struct PassInfo {
    name: &'static str,
    gate: Option<Optimization>,
    run: fn(&mut MirGraph, &PassContext),
}

/// The canonical pass order.
const PASSES: &[PassInfo] = &[
    PassInfo {
        name: "NullCheckElimination",
        gate: Some(Optimization::NullCheckElimination),
        run: eliminate_null_checks,
    },
    PassInfo {
        name: "ClassInitCheckElimination",
        gate: Some(Optimization::ClassInitCheckElimination),
        run: eliminate_class_init_checks,
    },
    PassInfo {
        name: "SpecialMethodInlining",
        gate: Some(Optimization::SuppressMethodInlining),
        run: inline_special_methods,
    },
    PassInfo {
        name: "GlobalValueNumbering",
        gate: Some(Optimization::GlobalValueNumbering),
        run: value_numbering,
    },
    PassInfo {
        name: "DeadCodeElimination",
        gate: Some(Optimization::SafeOptimizations),
        run: eliminate_dead_code,
    },
    PassInfo {
        name: "ConstantPropagation",
        gate: Some(Optimization::SafeOptimizations),
        run: propagate_constants,
    },
    PassInfo {
        name: "LoadStoreElimination",
        gate: Some(Optimization::LoadStoreElimination),
        run: eliminate_redundant_loads,
    },
    PassInfo {
        name: "BasicBlockCombine",
        gate: Some(Optimization::BasicBlockOpt),
        run: combine_blocks,
    },
    PassInfo {
        name: "BasicBlockOptimization",
        gate: Some(Optimization::BasicBlockOpt),
        run: fuse_compare_branches,
    },
    PassInfo { name: "RegisterPromotion", gate: Some(Optimization::PromoteRegs), run: count_uses },
    PassInfo {
        name: "TempLiveness",
        gate: Some(Optimization::TrackLiveTemps),
        run: order_promotion_candidates,
    },
];

/// Run the optimization passes in canonical order.
pub fn run_passes(graph: &mut MirGraph, ctx: &PassContext) {
    for pass in PASSES {
        if let Some(gate) = pass.gate {
            // `SuppressMethodInlining` disables inlining when SET; the
            // other gates disable their pass when set too, so the test is
            // uniform.
            if ctx.disable_opt & gate.bit() != 0 {
                if ctx.dump_passes {
                    log::debug!("pass {} skipped (disabled)", pass.name);
                }
                continue;
            }
        }
        if ctx.dump_passes {
            log::debug!("pass {}", pass.name);
        }
        (pass.run)(graph, ctx);
    }
}

fn is_code_block(graph: &MirGraph, block: Block) -> bool {
    matches!(graph.block(block).block_type, BlockType::DalvikByteCode | BlockType::Catch)
}

fn code_blocks(graph: &MirGraph) -> Vec<Block> {
    graph.all_blocks().filter(|&b| is_code_block(graph, b)).collect()
}

//=============================================================================
// Null-check elimination

/// Opcodes that null-check their object operand, and which operand it is.
fn null_checked_operand(mir: &Mir) -> Option<u32> {
    let op = mir.opcode.dex()?;
    if op.is_iget_or_iput() || op.is_iget_or_iput_quick() {
        return Some(mir.dalvik.vb);
    }
    match op {
        Opcode::ArrayLength | Opcode::MonitorEnter | Opcode::MonitorExit | Opcode::Throw
        | Opcode::FillArrayData => Some(mir.dalvik.va),
        op if op as u8 >= 0x44 && op as u8 <= 0x51 => Some(mir.dalvik.vb),
        Opcode::InvokeVirtual | Opcode::InvokeDirect | Opcode::InvokeSuper
        | Opcode::InvokeInterface | Opcode::InvokeVirtualQuick => Some(mir.dalvik.arg[0]),
        Opcode::InvokeVirtualRange | Opcode::InvokeDirectRange | Opcode::InvokeSuperRange
        | Opcode::InvokeInterfaceRange | Opcode::InvokeVirtualRangeQuick => Some(mir.dalvik.vc),
        _ => None,
    }
}

/// Mark null checks proven redundant within each block. The receiver
/// (`this`) of an instance method is non-null on entry; object-creating
/// instructions and already-checked vregs extend the set until the vreg is
/// redefined.
fn eliminate_null_checks(graph: &mut MirGraph, _ctx: &PassContext) {
    let this_vreg = (!graph.static_entry).then(|| usize::from(graph.first_in_vreg()));
    for block in code_blocks(graph) {
        // Bit per vreg known non-null at this point in the block.
        let mut non_null: CompoundBitSet<u32> =
            CompoundBitSet::with_capacity(usize::from(graph.num_vregs));
        if let Some(this_vreg) = this_vreg {
            non_null.insert(this_vreg);
        }
        let mirs: Vec<_> = graph.block_mirs(block).collect();
        for mir_id in mirs {
            let mir = graph.mir(mir_id);
            let checked = null_checked_operand(mir);
            let op = mir.opcode.dex();
            if let Some(obj) = checked {
                if non_null.contains(obj as usize) {
                    graph.mir_mut(mir_id).optimization_flags |= opt_flags::IGNORE_NULL_CHECK;
                } else {
                    // Surviving the check proves non-null from here on.
                    non_null.insert(obj as usize);
                }
            }
            let mir = graph.mir(mir_id);
            // Moves propagate the fact; any other def kills it.
            if let Some(op) = op {
                if matches!(op, Opcode::MoveObject | Opcode::MoveObjectFrom16 | Opcode::MoveObject16)
                {
                    let src_known = non_null.contains(mir.dalvik.vb as usize);
                    let dest = mir.dalvik.va as usize;
                    non_null.remove(dest);
                    if src_known {
                        non_null.insert(dest);
                    }
                    continue;
                }
            }
            let defines_object = mir.opcode.dex().is_some_and(|op| {
                matches!(
                    op,
                    Opcode::NewInstance
                        | Opcode::NewArray
                        | Opcode::ConstString
                        | Opcode::ConstStringJumbo
                        | Opcode::ConstClass
                )
            });
            let defs: SmallVec<[u32; 2]> = mir.ssa_rep.defs.clone();
            for def in defs {
                non_null.remove(def as usize);
                if defines_object {
                    non_null.insert(def as usize);
                }
            }
        }
    }
}

//=============================================================================
// Class-init-check elimination

/// Within a block, the first static access to a storage index initializes
/// the class; later accesses to the same storage need no check.
fn eliminate_class_init_checks(graph: &mut MirGraph, _ctx: &PassContext) {
    for block in code_blocks(graph) {
        let mut initialized: SmallVec<[u32; 8]> = SmallVec::new();
        let mirs: Vec<_> = graph.block_mirs(block).collect();
        for mir_id in mirs {
            let info = match graph.mir(mir_id).meta {
                MirMeta::SFieldInfo(index) => &graph.sfield_lowering_infos[usize::from(index)],
                _ => continue,
            };
            let storage = match &info.resolved {
                Some(field) => {
                    if field.is_referrers_class || field.is_class_initialized {
                        graph.mir_mut(mir_id).optimization_flags |=
                            opt_flags::IGNORE_CLINIT_CHECK;
                        continue;
                    }
                    field.storage_index
                }
                None => continue,
            };
            if initialized.contains(&storage) {
                graph.mir_mut(mir_id).optimization_flags |= opt_flags::IGNORE_CLINIT_CHECK;
            } else {
                initialized.push(storage);
            }
        }
    }
}

//=============================================================================
// Special-method inlining

/// Replace invokes of pattern methods with the pattern's body.
fn inline_special_methods(graph: &mut MirGraph, ctx: &PassContext) {
    let inliner = match ctx.inliner {
        Some(inliner) => inliner,
        None => return,
    };
    for block in code_blocks(graph) {
        let mirs: Vec<_> = graph.block_mirs(block).collect();
        for (index, &mir_id) in mirs.iter().enumerate() {
            let mir = graph.mir(mir_id);
            let op = match mir.opcode.dex() {
                Some(op) if op.is_invoke() => op,
                _ => continue,
            };
            // Quickened invokes have no resolvable target.
            if matches!(op, Opcode::InvokeVirtualQuick | Opcode::InvokeVirtualRangeQuick) {
                continue;
            }
            let pattern = match inliner.pattern(mir.dalvik.vb) {
                Some(pattern) => pattern,
                None => continue,
            };
            let move_result = mirs.get(index + 1).copied().filter(|&next| {
                matches!(
                    graph.mir(next).opcode.dex(),
                    Some(
                        Opcode::MoveResult | Opcode::MoveResultWide | Opcode::MoveResultObject
                    )
                )
            });
            if apply_inline_pattern(graph, mir_id, move_result, pattern) {
                if ctx.verbose {
                    log::debug!(
                        "inlined special invoke of method {} at {:#x}",
                        graph.mir(mir_id).dalvik.vb,
                        graph.mir(mir_id).offset
                    );
                }
            }
        }
    }
}

/// Argument vregs of an invoke at the call site, in order.
fn invoke_arg_vregs(insn: &DecodedInsn, is_range: bool) -> SmallVec<[u32; 5]> {
    if is_range {
        (0..insn.va).map(|i| insn.vc + i).collect()
    } else {
        (0..insn.va as usize).map(|i| insn.arg[i]).collect()
    }
}

fn nop_out(graph: &mut MirGraph, mir_id: MirId) {
    let mir = graph.mir_mut(mir_id);
    mir.opcode = MirOpcode::Pseudo(PseudoOp::Nop);
    mir.optimization_flags |= opt_flags::INLINED;
    mir.ssa_rep.uses.clear();
    mir.ssa_rep.defs.clear();
}

fn apply_inline_pattern(
    graph: &mut MirGraph,
    invoke: MirId,
    move_result: Option<MirId>,
    pattern: InlinePattern,
) -> bool {
    let insn = graph.mir(invoke).dalvik;
    let is_range = insn.opcode.is_invoke_range();
    let args = invoke_arg_vregs(&insn, is_range);
    match pattern {
        InlinePattern::Empty => {
            if move_result.is_some() {
                return false;
            }
            nop_out(graph, invoke);
            true
        }
        InlinePattern::ReturnArg { arg, wide, is_object } => {
            let move_result = match move_result {
                Some(id) => id,
                // Result unused: the call is a no-op.
                None => {
                    nop_out(graph, invoke);
                    return true;
                }
            };
            // Position `arg` counts the receiver for instance methods; the
            // pattern's index is relative to the first real argument, and
            // non-static invokes pass `this` as args[0].
            let receiver_adjust = usize::from(!matches!(
                insn.opcode,
                Opcode::InvokeStatic | Opcode::InvokeStaticRange
            ));
            let src = match args.get(receiver_adjust + usize::from(arg)) {
                Some(&src) => src,
                None => return false,
            };
            let dest = graph.mir(move_result).dalvik.va;
            let opcode = if wide {
                Opcode::MoveWide
            } else if is_object {
                Opcode::MoveObject
            } else {
                Opcode::Move
            };
            rewrite(graph, move_result, opcode, |d| {
                d.va = dest;
                d.vb = src;
            });
            graph.mir_mut(move_result).optimization_flags |= opt_flags::INLINED;
            nop_out(graph, invoke);
            true
        }
        InlinePattern::Const { value, wide } => {
            let move_result = match move_result {
                Some(id) => id,
                None => {
                    nop_out(graph, invoke);
                    return true;
                }
            };
            let dest = graph.mir(move_result).dalvik.va;
            let opcode = if wide { Opcode::ConstWide } else { Opcode::Const };
            rewrite(graph, move_result, opcode, |d| {
                d.va = dest;
                d.literal = value;
            });
            graph.mir_mut(move_result).optimization_flags |= opt_flags::INLINED;
            graph.constant_values.insert(move_result, value);
            nop_out(graph, invoke);
            true
        }
        InlinePattern::IGet { field, field_idx, access_type, object_arg } => {
            let move_result = match move_result {
                Some(id) => id,
                None => {
                    nop_out(graph, invoke);
                    return true;
                }
            };
            let obj = match args.get(usize::from(object_arg)) {
                Some(&obj) => obj,
                None => return false,
            };
            let dest = graph.mir(move_result).dalvik.va;
            let opcode = iget_opcode(access_type);
            let index = push_inlined_ifield(graph, field, field_idx, access_type);
            rewrite(graph, move_result, opcode, |d| {
                d.va = dest;
                d.vb = obj;
                d.vc = field_idx;
            });
            let mir = graph.mir_mut(move_result);
            mir.meta = MirMeta::IFieldInfo(index);
            mir.optimization_flags |= opt_flags::INLINED;
            nop_out(graph, invoke);
            true
        }
        InlinePattern::IPut { field, field_idx, access_type, object_arg, src_arg } => {
            if move_result.is_some() {
                return false;
            }
            let obj = match args.get(usize::from(object_arg)) {
                Some(&obj) => obj,
                None => return false,
            };
            let src = match args.get(1 + usize::from(src_arg)) {
                Some(&src) => src,
                None => return false,
            };
            let opcode = iput_opcode(access_type);
            let index = push_inlined_ifield(graph, field, field_idx, access_type);
            rewrite(graph, invoke, opcode, |d| {
                d.va = src;
                d.vb = obj;
                d.vc = field_idx;
            });
            graph.mir_mut(invoke).meta = MirMeta::IFieldInfo(index);
            graph.mir_mut(invoke).optimization_flags |= opt_flags::INLINED;
            true
        }
    }
}

fn rewrite(graph: &mut MirGraph, mir_id: MirId, opcode: Opcode, fill: impl FnOnce(&mut DecodedInsn)) {
    let mir = graph.mir_mut(mir_id);
    let mut dalvik = DecodedInsn { opcode, va: 0, vb: 0, vc: 0, arg: [0; 5], literal: 0 };
    fill(&mut dalvik);
    mir.opcode = MirOpcode::Dex(opcode);
    mir.dalvik = dalvik;
    mir.ssa_rep = compute_ssa_rep(MirOpcode::Dex(opcode), &dalvik);
}

fn push_inlined_ifield(
    graph: &mut MirGraph,
    field: crate::linker::FieldInfo,
    field_idx: u32,
    access_type: MemAccessType,
) -> u16 {
    let index = graph.ifield_lowering_infos.len() as u16;
    graph.ifield_lowering_infos.push(IFieldLoweringInfo {
        field_idx,
        access_type,
        is_quickened: false,
        resolved: Some(field),
    });
    index
}

fn iget_opcode(access: MemAccessType) -> Opcode {
    match access {
        MemAccessType::Word => Opcode::Iget,
        MemAccessType::Wide => Opcode::IgetWide,
        MemAccessType::Object => Opcode::IgetObject,
        MemAccessType::Boolean => Opcode::IgetBoolean,
        MemAccessType::Byte => Opcode::IgetByte,
        MemAccessType::Char => Opcode::IgetChar,
        MemAccessType::Short => Opcode::IgetShort,
    }
}

fn iput_opcode(access: MemAccessType) -> Opcode {
    match access {
        MemAccessType::Word => Opcode::Iput,
        MemAccessType::Wide => Opcode::IputWide,
        MemAccessType::Object => Opcode::IputObject,
        MemAccessType::Boolean => Opcode::IputBoolean,
        MemAccessType::Byte => Opcode::IputByte,
        MemAccessType::Char => Opcode::IputChar,
        MemAccessType::Short => Opcode::IputShort,
    }
}

//=============================================================================
// Value numbering

/// Block-local value numbering over side-effect-free integer computations.
/// A re-computed expression whose source vreg still holds the value becomes
/// a copy.
fn value_numbering(graph: &mut MirGraph, _ctx: &PassContext) {
    type Vn = u32;
    for block in code_blocks(graph) {
        let mut next_vn: Vn = 0;
        let mut vreg_vn: FxHashMap<u32, Vn> = FxHashMap::default();
        let mut expr_home: FxHashMap<(u8, Vn, Vn, i64), (Vn, u32)> = FxHashMap::default();
        fn fresh(next_vn: &mut Vn, vreg_vn: &mut FxHashMap<u32, Vn>, vreg: u32) -> Vn {
            let vn = *next_vn;
            *next_vn += 1;
            vreg_vn.insert(vreg, vn);
            vn
        }
        fn vn_of(next_vn: &mut Vn, vreg_vn: &mut FxHashMap<u32, Vn>, vreg: u32) -> Vn {
            match vreg_vn.get(&vreg) {
                Some(&vn) => vn,
                None => fresh(next_vn, vreg_vn, vreg),
            }
        }
        let mirs: Vec<_> = graph.block_mirs(block).collect();
        for mir_id in mirs {
            let mir = graph.mir(mir_id);
            let op = match mir.opcode.dex() {
                Some(op) => op,
                None => continue,
            };
            let byte = op as u8;
            // Only non-throwing, single-def 32-bit arithmetic is numbered;
            // div and rem can throw and stay out.
            let eligible = matches!(byte, 0x90..=0x9a | 0xd0..=0xe2)
                && !matches!(
                    op,
                    Opcode::DivInt
                        | Opcode::RemInt
                        | Opcode::DivIntLit16
                        | Opcode::RemIntLit16
                        | Opcode::DivIntLit8
                        | Opcode::RemIntLit8
                );
            if !eligible {
                // Any def invalidates the destination's number.
                let defs: SmallVec<[u32; 2]> = mir.ssa_rep.defs.clone();
                for def in defs {
                    fresh(&mut next_vn, &mut vreg_vn, def);
                }
                continue;
            }
            let insn = mir.dalvik;
            let dest = insn.va;
            let lhs = vn_of(&mut next_vn, &mut vreg_vn, insn.vb);
            let rhs = if byte <= 0x9a { vn_of(&mut next_vn, &mut vreg_vn, insn.vc) } else { 0 };
            let key = (byte, lhs, rhs, insn.literal);
            match expr_home.get(&key) {
                Some(&(vn, home)) if vreg_vn.get(&home) == Some(&vn) && home != dest => {
                    // Same expression, source still live: rewrite as copy.
                    let mir = graph.mir_mut(mir_id);
                    mir.opcode = MirOpcode::Pseudo(PseudoOp::Copy);
                    mir.dalvik.va = dest;
                    mir.dalvik.vb = home;
                    mir.optimization_flags |= opt_flags::MARK;
                    mir.ssa_rep.uses = SmallVec::from_slice(&[home]);
                    mir.ssa_rep.defs = SmallVec::from_slice(&[dest]);
                    vreg_vn.insert(dest, vn);
                }
                _ => {
                    let vn = fresh(&mut next_vn, &mut vreg_vn, dest);
                    expr_home.insert(key, (vn, dest));
                }
            }
        }
    }
}

//=============================================================================
// Dead code elimination

/// Nop out a def that is overwritten later in the same block with no
/// intervening use and no side effects.
fn eliminate_dead_code(graph: &mut MirGraph, _ctx: &PassContext) {
    for block in code_blocks(graph) {
        let mirs: Vec<_> = graph.block_mirs(block).collect();
        // For each MIR, the next instruction in-block that uses or
        // redefines its def.
        for (index, &mir_id) in mirs.iter().enumerate() {
            let mir = graph.mir(mir_id);
            let op = match mir.opcode.dex() {
                Some(op) => op,
                None => continue,
            };
            // Side-effect-free, single-def producers only.
            let removable = matches!(op as u8, 0x01..=0x09 | 0x12..=0x19)
                || matches!(op, Opcode::Move | Opcode::Const4);
            if !removable || mir.ssa_rep.defs.len() != 1 {
                continue;
            }
            let def = mir.ssa_rep.defs[0];
            let wide = crate::mir::dataflow::def_is_wide(op);
            let mut dead = false;
            for &later in &mirs[index + 1..] {
                let later_mir = graph.mir(later);
                let uses_def = later_mir
                    .ssa_rep
                    .uses
                    .iter()
                    .any(|&u| u == def || (wide && u == def + 1));
                if uses_def {
                    break;
                }
                let redefines = later_mir.ssa_rep.defs.contains(&def);
                if redefines {
                    dead = true;
                    break;
                }
            }
            if dead {
                nop_out(graph, mir_id);
            }
        }
    }
}

//=============================================================================
// Constant propagation and folding

fn const_of(op: Opcode) -> bool {
    matches!(op as u8, 0x12..=0x19)
}

/// Track constants per block; fold arithmetic over known constants into
/// `const` MIR and record every known value for codegen.
fn propagate_constants(graph: &mut MirGraph, _ctx: &PassContext) {
    for block in code_blocks(graph) {
        let mut constants: FxHashMap<u32, i64> = FxHashMap::default();
        let mirs: Vec<_> = graph.block_mirs(block).collect();
        for mir_id in mirs {
            let mir = graph.mir(mir_id);
            let op = match mir.opcode.dex() {
                Some(op) => op,
                None => {
                    let defs: SmallVec<[u32; 2]> = mir.ssa_rep.defs.clone();
                    for def in defs {
                        constants.remove(&def);
                    }
                    continue;
                }
            };
            let insn = mir.dalvik;
            if const_of(op) {
                constants.insert(insn.va, insn.literal);
                graph.constant_values.insert(mir_id, insn.literal);
                continue;
            }
            let folded = fold(op, &insn, &constants);
            if let Some(value) = folded {
                let wide = crate::mir::dataflow::def_is_wide(op);
                let dest = insn.va;
                rewrite(graph, mir_id, if wide { Opcode::ConstWide } else { Opcode::Const }, |d| {
                    d.va = dest;
                    d.literal = value;
                });
                constants.insert(dest, value);
                graph.constant_values.insert(mir_id, value);
                continue;
            }
            let defs: SmallVec<[u32; 2]> = graph.mir(mir_id).ssa_rep.defs.clone();
            for def in defs {
                constants.remove(&def);
                constants.remove(&(def + 1));
            }
        }
    }
}

/// Fold one instruction over known constants. Division stays unfolded when
/// the divisor is zero so the runtime check still throws.
fn fold(op: Opcode, insn: &DecodedInsn, constants: &FxHashMap<u32, i64>) -> Option<i64> {
    let byte = op as u8;
    let lit8_or_16 = matches!(byte, 0xd0..=0xe2);
    let (lhs, rhs) = if lit8_or_16 {
        (*constants.get(&insn.vb)? as i32, insn.literal as i32)
    } else if matches!(byte, 0x90..=0x9a) {
        (*constants.get(&insn.vb)? as i32, *constants.get(&insn.vc)? as i32)
    } else if matches!(byte, 0xb0..=0xba) {
        (*constants.get(&insn.va)? as i32, *constants.get(&insn.vb)? as i32)
    } else {
        return None;
    };
    let value = match op {
        Opcode::AddInt | Opcode::AddInt2Addr | Opcode::AddIntLit16 | Opcode::AddIntLit8 => {
            lhs.wrapping_add(rhs)
        }
        Opcode::SubInt | Opcode::SubInt2Addr => lhs.wrapping_sub(rhs),
        Opcode::RsubInt | Opcode::RsubIntLit8 => rhs.wrapping_sub(lhs),
        Opcode::MulInt | Opcode::MulInt2Addr | Opcode::MulIntLit16 | Opcode::MulIntLit8 => {
            lhs.wrapping_mul(rhs)
        }
        Opcode::AndInt | Opcode::AndInt2Addr | Opcode::AndIntLit16 | Opcode::AndIntLit8 => {
            lhs & rhs
        }
        Opcode::OrInt | Opcode::OrInt2Addr | Opcode::OrIntLit16 | Opcode::OrIntLit8 => lhs | rhs,
        Opcode::XorInt | Opcode::XorInt2Addr | Opcode::XorIntLit16 | Opcode::XorIntLit8 => {
            lhs ^ rhs
        }
        Opcode::ShlInt | Opcode::ShlInt2Addr | Opcode::ShlIntLit8 => lhs.wrapping_shl(rhs as u32),
        Opcode::ShrInt | Opcode::ShrInt2Addr | Opcode::ShrIntLit8 => lhs.wrapping_shr(rhs as u32),
        Opcode::UshrInt | Opcode::UshrInt2Addr | Opcode::UshrIntLit8 => {
            ((lhs as u32).wrapping_shr(rhs as u32)) as i32
        }
        Opcode::DivInt | Opcode::DivInt2Addr | Opcode::DivIntLit16 | Opcode::DivIntLit8
            if rhs != 0 =>
        {
            lhs.wrapping_div(rhs)
        }
        Opcode::RemInt | Opcode::RemInt2Addr | Opcode::RemIntLit16 | Opcode::RemIntLit8
            if rhs != 0 =>
        {
            lhs.wrapping_rem(rhs)
        }
        _ => return None,
    };
    Some(i64::from(value))
}

//=============================================================================
// Load-store elimination

/// Block-local: a load of the same (object vreg, field) as an earlier load
/// or store with no intervening clobber becomes a copy.
fn eliminate_redundant_loads(graph: &mut MirGraph, _ctx: &PassContext) {
    for block in code_blocks(graph) {
        // (base vreg, field index) -> vreg holding the value
        let mut known: FxHashMap<(u32, u32), u32> = FxHashMap::default();
        let mirs: Vec<_> = graph.block_mirs(block).collect();
        for mir_id in mirs {
            let mir = graph.mir(mir_id);
            let op = match mir.opcode.dex() {
                Some(op) => op,
                None => continue,
            };
            if op.is_invoke() || matches!(op, Opcode::MonitorEnter | Opcode::MonitorExit) {
                // Calls and synchronization can change any field.
                known.clear();
                continue;
            }
            let insn = mir.dalvik;
            if op.is_iget_or_iput() && !matches!(op, Opcode::IgetWide | Opcode::IputWide) {
                let key = (insn.vb, insn.vc);
                if op.is_field_get() {
                    if let Some(&home) = known.get(&key) {
                        if home != insn.va {
                            let is_object = op == Opcode::IgetObject;
                            let dest = insn.va;
                            rewrite(
                                graph,
                                mir_id,
                                if is_object { Opcode::MoveObject } else { Opcode::Move },
                                |d| {
                                    d.va = dest;
                                    d.vb = home;
                                },
                            );
                            known.insert(key, dest);
                            continue;
                        }
                    }
                    known.insert(key, insn.va);
                } else {
                    // A store publishes the stored vreg as the field value.
                    known.retain(|&(_, field), _| field != insn.vc);
                    known.insert(key, insn.va);
                }
            }
            // Any redefinition invalidates entries naming the vreg.
            let defs: SmallVec<[u32; 2]> = graph.mir(mir_id).ssa_rep.defs.clone();
            for def in defs {
                known.retain(|&(base, _), value| base != def && *value != def);
            }
        }
    }
}

//=============================================================================
// Block combining and compare-branch fusing

/// Merge straight-line chains: a block whose single successor has a single
/// predecessor absorbs it.
fn combine_blocks(graph: &mut MirGraph, _ctx: &PassContext) {
    graph.compute_predecessors();
    loop {
        let mut merged = false;
        for block in code_blocks(graph) {
            let bb = graph.block(block);
            if bb.taken.is_some() || !bb.successors.is_empty() {
                continue;
            }
            let next = match bb.fall_through {
                Some(next) => next,
                None => continue,
            };
            let next_bb = graph.block(next);
            if next_bb.block_type != BlockType::DalvikByteCode
                || next_bb.catch_entry
                || next_bb.predecessors.len() != 1
                || next == block
            {
                continue;
            }
            // Splice next's MIR chain onto block.
            let (next_first, next_last) = (next_bb.first_mir, next_bb.last_mir);
            let (taken, fall_through) = (next_bb.taken, next_bb.fall_through);
            let successors = next_bb.successors.clone();
            match graph.block(block).last_mir {
                Some(last) => graph.mir_mut(last).next = next_first,
                None => graph.block_mut(block).first_mir = next_first,
            }
            if next_last.is_some() {
                graph.block_mut(block).last_mir = next_last;
            }
            let mut mir_cursor = next_first;
            while let Some(id) = mir_cursor {
                graph.mir_mut(id).bb = block;
                mir_cursor = graph.mir(id).next;
            }
            let bb = graph.block_mut(block);
            bb.taken = taken;
            bb.fall_through = fall_through;
            bb.successors = successors;
            let dead = graph.block_mut(next);
            dead.block_type = BlockType::Dead;
            dead.first_mir = None;
            dead.last_mir = None;
            dead.taken = None;
            dead.fall_through = None;
            dead.successors.clear();
            merged = true;
            break;
        }
        if !merged {
            break;
        }
        graph.compute_predecessors();
    }
    graph.compute_dfs_order();
    graph.compute_predecessors();
}

/// Fuse `cmp` + conditional branch over its result into one pseudo MIR so
/// the backend can emit a compare-and-branch without materializing the
/// -1/0/1 value.
fn fuse_compare_branches(graph: &mut MirGraph, _ctx: &PassContext) {
    for block in code_blocks(graph) {
        let mirs: Vec<_> = graph.block_mirs(block).collect();
        if mirs.len() < 2 {
            continue;
        }
        let cmp_id = mirs[mirs.len() - 2];
        let br_id = mirs[mirs.len() - 1];
        let cmp = graph.mir(cmp_id);
        let br = graph.mir(br_id);
        let pseudo = match cmp.opcode.dex() {
            Some(Opcode::CmplFloat) => PseudoOp::FusedCmplFloat,
            Some(Opcode::CmpgFloat) => PseudoOp::FusedCmpgFloat,
            Some(Opcode::CmplDouble) => PseudoOp::FusedCmplDouble,
            Some(Opcode::CmpgDouble) => PseudoOp::FusedCmpgDouble,
            Some(Opcode::CmpLong) => PseudoOp::FusedCmpLong,
            _ => continue,
        };
        let is_z_branch = matches!(
            br.opcode.dex(),
            Some(
                Opcode::IfEqz
                    | Opcode::IfNez
                    | Opcode::IfLtz
                    | Opcode::IfGez
                    | Opcode::IfGtz
                    | Opcode::IfLez
            )
        );
        if !is_z_branch || br.dalvik.va != cmp.dalvik.va {
            continue;
        }
        // The compare result must die here: only fuse when the branch is
        // the only consumer in the block and the vreg is not live out
        // (conservatively approximated by a redefinition check elsewhere
        // being absent, so only fuse compiler-visible temporaries).
        let result = cmp.dalvik.va;
        let used_elsewhere = graph.mirs.values().any(|m| {
            m.bb != block && (m.ssa_rep.uses.contains(&result))
        });
        if used_elsewhere {
            continue;
        }
        let (src1, src2) = (cmp.dalvik.vb, cmp.dalvik.vc);
        let branch_op = br.dalvik.opcode;
        let branch_literal = br.dalvik.literal;
        let fused = graph.mir_mut(br_id);
        fused.opcode = MirOpcode::Pseudo(pseudo);
        fused.dalvik.va = branch_op as u8 as u32;
        fused.dalvik.vb = src1;
        fused.dalvik.vc = src2;
        fused.dalvik.literal = branch_literal;
        fused.ssa_rep.uses = SmallVec::from_slice(&[src1, src2]);
        fused.ssa_rep.defs.clear();
        nop_out(graph, cmp_id);
    }
}

//=============================================================================
// Promotion bookkeeping

/// Count vreg uses, weighting blocks that are branch targets of back edges
/// as cheap loop bodies.
fn count_uses(graph: &mut MirGraph, _ctx: &PassContext) {
    let num_vregs = usize::from(graph.num_vregs);
    let mut counts = vec![0u32; num_vregs];
    let mut weighted = vec![0u32; num_vregs];
    for (_, mir) in graph.mirs.iter() {
        let block = graph.block(mir.bb);
        if block.block_type == BlockType::Dead {
            continue;
        }
        // A block targeted by a higher-numbered block is a loop head in
        // RPO numbering.
        let in_loop = block.predecessors.iter().any(|&p| p > mir.bb);
        let weight = if in_loop { 3 } else { 1 };
        for &used in mir.ssa_rep.uses.iter().chain(mir.ssa_rep.defs.iter()) {
            if (used as usize) < num_vregs {
                counts[used as usize] += 1;
                weighted[used as usize] += weight;
            }
        }
    }
    graph.use_counts = counts;
    graph.weighted_use_counts = weighted;
}

/// Order promotion candidates by weighted use count, descending. The
/// register allocator pins the leading candidates to callee-saves.
fn order_promotion_candidates(graph: &mut MirGraph, _ctx: &PassContext) {
    if graph.weighted_use_counts.is_empty() {
        return;
    }
    let mut order: Vec<u16> = (0..graph.num_vregs).collect();
    order.sort_by_key(|&v| std::cmp::Reverse(graph.weighted_use_counts[usize::from(v)]));
    order.retain(|&v| graph.weighted_use_counts[usize::from(v)] > 0);
    graph.promotion_order = order;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::{CodeItem, DexFileId};
    use crate::mir::build::build_graph;

    fn ctx(dex_file: &DexFile) -> PassContext<'_> {
        PassContext { dex_file, disable_opt: 0, verbose: false, dump_passes: false, inliner: None }
    }

    fn dex() -> DexFile {
        DexFile::new(DexFileId(0), "test.dex".into(), 0, vec![])
    }

    fn graph_of(insns: Vec<u16>, registers: u16, ins: u16) -> MirGraph {
        let item = CodeItem { registers_size: registers, ins_size: ins, outs_size: 0, insns, tries: vec![] };
        build_graph(&item)
    }

    #[test]
    fn second_monitor_op_skips_null_check() {
        // monitor-enter v1; monitor-exit v1; return-void (v1 = this)
        let mut graph = graph_of(vec![0x011d, 0x011e, 0x000e], 2, 1);
        graph.static_entry = false;
        let dex = dex();
        eliminate_null_checks(&mut graph, &ctx(&dex));
        let flags: Vec<u16> = graph.mirs.values().map(|m| m.optimization_flags).collect();
        // Both are on `this`, non-null on entry.
        assert!(flags[0] & opt_flags::IGNORE_NULL_CHECK != 0);
        assert!(flags[1] & opt_flags::IGNORE_NULL_CHECK != 0);
    }

    #[test]
    fn constant_folding_rewrites_add() {
        // const/4 v0, #2; const/4 v1, #3; add-int v2, v0, v1; return v2
        let mut graph =
            graph_of(vec![0x2012, 0x3112, 0x0290, 0x0100, 0x020f], 3, 0);
        let dex = dex();
        propagate_constants(&mut graph, &ctx(&dex));
        let add = graph
            .mirs
            .values()
            .find(|m| m.opcode == MirOpcode::Dex(Opcode::Const))
            .expect("folded MIR");
        assert_eq!(add.dalvik.literal, 5);
    }

    #[test]
    fn dead_store_removed() {
        // const/4 v0, #1; const/4 v0, #2; return v0
        let mut graph = graph_of(vec![0x1012, 0x2012, 0x000f], 1, 0);
        let dex = dex();
        eliminate_dead_code(&mut graph, &ctx(&dex));
        let nops = graph
            .mirs
            .values()
            .filter(|m| m.opcode == MirOpcode::Pseudo(PseudoOp::Nop))
            .count();
        assert_eq!(nops, 1);
    }

    #[test]
    fn cmp_branch_fusion() {
        // cmp-long v0, v1, v3; if-gez v0, +4; return-void; return-void
        let mut graph = graph_of(
            vec![0x0031, 0x0301, 0x003b, 0x0004, 0x000e, 0x000e, 0x000e],
            5,
            0,
        );
        let dex = dex();
        fuse_compare_branches(&mut graph, &ctx(&dex));
        assert!(graph
            .mirs
            .values()
            .any(|m| m.opcode == MirOpcode::Pseudo(PseudoOp::FusedCmpLong)));
    }

    #[test]
    fn straight_line_blocks_merge() {
        // Split blocks artificially via a goto to the next instruction:
        // goto +1; return-void
        let mut graph = graph_of(vec![0x0128, 0x000e], 1, 0);
        let dex = dex();
        combine_blocks(&mut graph, &ctx(&dex));
        // Still compiles to a sane graph with entry reaching exit.
        assert!(graph.dfs_order().contains(&graph.exit_block));
    }

    #[test]
    fn promotion_order_prefers_hot_vregs() {
        // v1 used twice, v0 once.
        let mut graph = graph_of(vec![0x0101u16 | 0, 0x1101, 0x010f], 2, 0);
        let dex = dex();
        let c = ctx(&dex);
        count_uses(&mut graph, &c);
        order_promotion_candidates(&mut graph, &c);
        assert_eq!(graph.promotion_order.first(), Some(&1));
    }
}
