//! Target-independent lowering of Dalvik instructions.
//!
//! Everything here emits LIR solely through [`Target`] hooks. The block
//! walk follows the pre-order DFS layout and appends explicit branches
//! where the natural fall-through is not the next laid-out block.

use crate::inliner::InlinePattern;
use crate::insn::Opcode;
use crate::mir::lowering::MemAccessType;
use crate::mir::{opt_flags, Block, BlockType, MirId, MirOpcode, PseudoOp};

use super::invoke;
use super::layout::{self, Trampoline};
use super::lir::PseudoLir;
use super::regs::{RegLocation, RegStorage};
use super::special;
use super::{
    AluOp, CodeGen, Cond, ConvKind, FpOp, HelperArg, LiteralPool, MemBarrierKind, OpSize,
    SwitchTable, TableRef, Target,
};

/// Maximum sparse-switch cases lowered as a compare chain; beyond this a
/// key table with a linear-scan loop is emitted.
const MAX_CHAINED_SWITCH_CASES: usize = 16;

/// Generate the method body: the special-pattern stub when one applies,
/// the full MIR walk otherwise. Returns `false` when codegen punted.
pub fn compile_method_body<T: Target>(
    cg: &mut CodeGen<'_, T>,
    special: Option<InlinePattern>,
) -> bool {
    let special_worked = match special {
        Some(pattern) => special::gen_special(cg, pattern),
        None => false,
    };
    if !special_worked {
        method_mir_to_lir(cg);
    }
    cg.handle_slow_paths();
    !cg.punt_to_interpreter
}

fn method_mir_to_lir<T: Target>(cg: &mut CodeGen<'_, T>) {
    let order: Vec<Block> = cg.graph.dfs_order().to_vec();
    for (index, &block) in order.iter().enumerate() {
        let next = order.get(index + 1).copied();
        block_code_gen(cg, block);
        // If the fall-through block is not laid out next, preserve the
        // semantics with an explicit branch.
        let fall_through = cg.graph.block(block).fall_through;
        if let Some(ft) = fall_through {
            if next != Some(ft) {
                let label = cg.block_label(ft);
                T::op_unconditional_branch(cg, label);
            }
        }
    }
}

fn block_code_gen<T: Target>(cg: &mut CodeGen<'_, T>, block: Block) {
    let bb_type = cg.graph.block(block).block_type;
    if bb_type == BlockType::Dead {
        return;
    }
    cg.current_dalvik_offset = cg.graph.block(block).start_offset;
    cg.current_mir = None;
    cg.place_block_label(block);

    if cg.graph.block(block).catch_entry {
        cg.append_pseudo(PseudoLir::ExportedPc);
    }

    cg.reg_pool.reset();

    if bb_type == BlockType::Entry {
        cg.append_pseudo(PseudoLir::PrologueBegin);
        T::gen_entry_sequence(cg);
        invoke::flush_ins(cg);
        if !cg.graph.is_leaf {
            cg.gen_suspend_test(0);
        }
        cg.append_pseudo(PseudoLir::PrologueEnd);
        debug_assert_eq!(cg.cfi.current_cfa_offset(), cg.frame_size as i32);
        return;
    }
    if bb_type == BlockType::Exit {
        cg.append_pseudo(PseudoLir::EpilogueBegin);
        T::gen_exit_sequence(cg);
        cg.append_pseudo(PseudoLir::EpilogueEnd);
        return;
    }

    let mirs: Vec<MirId> = cg.graph.block_mirs(block).collect();
    for mir_id in mirs {
        cg.reg_pool.reset();
        let mir = cg.graph.mir(mir_id);
        cg.current_dalvik_offset = mir.offset;
        cg.current_mir = Some(mir_id);
        if cg.cu.verbose {
            cg.append_pseudo(PseudoLir::BoundaryMarker);
        }
        match mir.opcode {
            MirOpcode::Pseudo(op) => handle_extended(cg, mir_id, op),
            MirOpcode::Dex(op) => compile_dalvik_instruction(cg, mir_id, op),
        }
        if cg.punt_to_interpreter {
            return;
        }
    }
}

//=============================================================================
// Location helpers

fn loc<T: Target>(cg: &CodeGen<'_, T>, v: u32) -> RegLocation {
    cg.loc_for_vreg(v, false, false, false)
}

fn loc_ref<T: Target>(cg: &CodeGen<'_, T>, v: u32) -> RegLocation {
    cg.loc_for_vreg(v, false, false, true)
}

fn loc_wide<T: Target>(cg: &CodeGen<'_, T>, v: u32) -> RegLocation {
    cg.loc_for_vreg(v, true, false, false)
}

fn loc_fp<T: Target>(cg: &CodeGen<'_, T>, v: u32, double: bool) -> RegLocation {
    cg.loc_for_vreg(v, double, true, false)
}

fn access_op_size(access: MemAccessType) -> OpSize {
    match access {
        MemAccessType::Word => OpSize::Word,
        MemAccessType::Wide => OpSize::Wide,
        MemAccessType::Object => OpSize::Ref,
        MemAccessType::Boolean => OpSize::UnsignedByte,
        MemAccessType::Byte => OpSize::SignedByte,
        MemAccessType::Char => OpSize::UnsignedHalf,
        MemAccessType::Short => OpSize::SignedHalf,
    }
}

fn access_loc<T: Target>(cg: &CodeGen<'_, T>, v: u32, access: MemAccessType) -> RegLocation {
    match access {
        MemAccessType::Wide => loc_wide(cg, v),
        MemAccessType::Object => loc_ref(cg, v),
        _ => loc(cg, v),
    }
}

//=============================================================================
// The dispatch

fn compile_dalvik_instruction<T: Target>(cg: &mut CodeGen<'_, T>, mir_id: MirId, op: Opcode) {
    let mir = cg.graph.mir(mir_id);
    let insn = mir.dalvik;
    let mir_flags = mir.optimization_flags;
    use Opcode::*;
    match op {
        Nop => {}
        ReturnVoidBarrier => {
            T::gen_memory_barrier(cg, MemBarrierKind::StoreStore);
            if !cg.graph.is_leaf {
                cg.gen_suspend_test(mir_flags);
            }
        }

        Move | MoveFrom16 | Move16 => {
            let src = cg.load_value(loc(cg, insn.vb));
            cg.store_value(loc(cg, insn.va), src.reg);
        }
        MoveObject | MoveObjectFrom16 | MoveObject16 => {
            let src = cg.load_value(loc_ref(cg, insn.vb));
            cg.store_value(loc_ref(cg, insn.va), src.reg);
        }
        MoveWide | MoveWideFrom16 | MoveWide16 => {
            let src = cg.load_value(loc_wide(cg, insn.vb));
            cg.store_value(loc_wide(cg, insn.va), src.reg);
        }

        MoveResult | MoveResultWide | MoveResultObject => {
            // Inlined invokes rewrite their move-result; reaching here
            // means the preceding invoke left its value in the return
            // registers.
            let (wide, ref_) = (op == MoveResultWide, op == MoveResultObject);
            let ret = cg.target.return_reg(false, wide);
            let dest = cg.loc_for_vreg(insn.va, wide, false, ref_);
            cg.store_value(dest, ret);
        }

        MoveException => {
            let self_reg = cg.special_reg(super::SpecialTargetRegister::SelfThread);
            let exc_offset = layout::thread_exception_offset(T::ISA.pointer_size());
            let tmp = cg.reg_pool.alloc_temp_ref();
            let zero = cg.reg_pool.alloc_temp();
            if tmp.is_valid() && zero.is_valid() {
                T::load_base_disp(cg, self_reg, exc_offset, tmp, OpSize::Ref);
                T::load_constant(cg, zero, 0);
                T::store_base_disp(cg, self_reg, exc_offset, zero, OpSize::Ref);
                cg.store_value(loc_ref(cg, insn.va), tmp);
            } else {
                cg.punt_to_interpreter = true;
            }
        }

        ReturnVoid => {
            if !cg.graph.is_leaf {
                cg.gen_suspend_test(mir_flags);
            }
        }
        Return | ReturnObject => {
            if !cg.graph.is_leaf {
                cg.gen_suspend_test(mir_flags);
            }
            let ret_char = cg.cu.shorty.as_bytes()[0];
            let fp = crate::dex::shorty_is_fp(ret_char);
            let src = cg.loc_for_vreg(insn.va, false, fp, op == ReturnObject);
            let ret = cg.target.return_reg(fp, false);
            cg.load_value_direct_fixed(src, ret);
        }
        ReturnWide => {
            if !cg.graph.is_leaf {
                cg.gen_suspend_test(mir_flags);
            }
            let fp = crate::dex::shorty_is_fp(cg.cu.shorty.as_bytes()[0]);
            let src = cg.loc_for_vreg(insn.va, true, fp, false);
            let ret = cg.target.return_reg(fp, true);
            cg.load_value_direct_fixed(src, ret);
        }

        Const4 | Const16 | Const | ConstHigh16 => {
            let tmp = cg.reg_pool.alloc_temp();
            if tmp.is_valid() {
                T::load_constant(cg, tmp, insn.literal as i32);
                cg.store_value(loc(cg, insn.va), tmp);
            } else {
                cg.punt_to_interpreter = true;
            }
        }
        ConstWide16 | ConstWide32 | ConstWide | ConstWideHigh16 => {
            let tmp = cg.reg_pool.alloc_temp_wide();
            if tmp.is_valid() {
                T::load_constant_wide(cg, tmp, insn.literal);
                cg.store_value(loc_wide(cg, insn.va), tmp);
            } else {
                cg.punt_to_interpreter = true;
            }
        }

        ConstString | ConstStringJumbo => gen_const_string(cg, insn.va, insn.vb),
        ConstClass => gen_const_class(cg, insn.va, insn.vb),

        MonitorEnter => {
            let obj = cg.load_value(loc_ref(cg, insn.va));
            cg.gen_null_check(obj.reg, mir_flags);
            T::gen_monitor_enter(cg, obj.reg);
        }
        MonitorExit => {
            let obj = cg.load_value(loc_ref(cg, insn.va));
            cg.gen_null_check(obj.reg, mir_flags);
            T::gen_monitor_exit(cg, obj.reg);
        }

        CheckCast => {
            let safe = cg
                .cu
                .verified
                .as_ref()
                .is_some_and(|v| v.is_safe_cast(cg.current_dalvik_offset));
            if !safe {
                let klass = load_class_pointer(cg, insn.vb);
                if klass.is_valid() {
                    cg.call_runtime_helper(
                        Trampoline::CheckCast,
                        &[HelperArg::Reg(klass), HelperArg::Loc(loc_ref(cg, insn.va))],
                        true,
                    );
                }
            }
        }
        InstanceOf => {
            let klass = load_class_pointer(cg, insn.vc);
            if klass.is_valid() {
                cg.call_runtime_helper(
                    Trampoline::InstanceofNonTrivial,
                    &[HelperArg::Reg(klass), HelperArg::Loc(loc_ref(cg, insn.vb))],
                    true,
                );
                let ret = cg.target.return_reg(false, false);
                cg.store_value(loc(cg, insn.va), ret);
            }
        }

        ArrayLength => {
            let obj = cg.load_value(loc_ref(cg, insn.vb));
            cg.gen_null_check(obj.reg, mir_flags);
            let tmp = cg.reg_pool.alloc_temp();
            if tmp.is_valid() {
                T::load_base_disp(cg, obj.reg, layout::ARRAY_LENGTH_OFFSET, tmp, OpSize::Word);
                cg.store_value(loc(cg, insn.va), tmp);
            } else {
                cg.punt_to_interpreter = true;
            }
        }

        NewInstance => {
            cg.call_runtime_helper(
                Trampoline::AllocObject,
                &[HelperArg::Imm(insn.vb as i32)],
                true,
            );
            let ret = cg.target.return_reg(false, false);
            cg.store_value(loc_ref(cg, insn.va), ret);
        }
        NewArray => {
            cg.call_runtime_helper(
                Trampoline::AllocArray,
                &[HelperArg::Imm(insn.vc as i32), HelperArg::Loc(loc(cg, insn.vb))],
                true,
            );
            let ret = cg.target.return_reg(false, false);
            cg.store_value(loc_ref(cg, insn.va), ret);
        }

        FilledNewArray | FilledNewArrayRange => gen_filled_new_array(cg, mir_id),
        FillArrayData => gen_fill_array_data(cg, mir_id),

        Throw => {
            cg.call_runtime_helper(
                Trampoline::DeliverException,
                &[HelperArg::Loc(loc_ref(cg, insn.va))],
                true,
            );
        }

        Goto | Goto16 | Goto32 => {
            let taken = cg.graph.block(mir.bb).taken.expect("goto without taken edge");
            if cg.graph.block(taken).start_offset <= cg.current_dalvik_offset {
                cg.gen_suspend_test(mir_flags);
            }
            let label = cg.block_label(taken);
            T::op_unconditional_branch(cg, label);
        }

        PackedSwitch | SparseSwitch => gen_switch(cg, mir_id, op == SparseSwitch),

        CmplFloat | CmpgFloat | CmplDouble | CmpgDouble => {
            let double = matches!(op, CmplDouble | CmpgDouble);
            let gt_bias = matches!(op, CmpgFloat | CmpgDouble);
            let src1 = cg.load_value(loc_fp(cg, insn.vb, double));
            let src2 = cg.load_value(loc_fp(cg, insn.vc, double));
            let dest = cg.reg_pool.alloc_temp();
            if dest.is_valid() {
                T::op_fp_cmp(cg, dest, src1.reg, src2.reg, double, gt_bias);
                cg.store_value(loc(cg, insn.va), dest);
            } else {
                cg.punt_to_interpreter = true;
            }
        }
        CmpLong => {
            let src1 = cg.load_value(loc_wide(cg, insn.vb));
            let src2 = cg.load_value(loc_wide(cg, insn.vc));
            let dest = cg.reg_pool.alloc_temp();
            if dest.is_valid() {
                T::op_cmp_long(cg, dest, src1.reg, src2.reg);
                cg.store_value(loc(cg, insn.va), dest);
            } else {
                cg.punt_to_interpreter = true;
            }
        }

        IfEq | IfNe | IfLt | IfGe | IfGt | IfLe => {
            let taken = cg.graph.block(mir.bb).taken.expect("if without taken edge");
            if cg.graph.block(taken).start_offset <= cg.current_dalvik_offset {
                cg.gen_suspend_test(mir_flags);
            }
            let cond = if_cond(op);
            let a = cg.load_value(loc(cg, insn.va));
            let b = cg.load_value(loc(cg, insn.vb));
            let label = cg.block_label(taken);
            T::op_cmp_branch(cg, cond, a.reg, b.reg, label);
        }
        IfEqz | IfNez | IfLtz | IfGez | IfGtz | IfLez => {
            let taken = cg.graph.block(mir.bb).taken.expect("if without taken edge");
            if cg.graph.block(taken).start_offset <= cg.current_dalvik_offset {
                cg.gen_suspend_test(mir_flags);
            }
            let cond = ifz_cond(op);
            let a = cg.load_value(loc(cg, insn.va));
            let label = cg.block_label(taken);
            T::op_cmp_imm_branch(cg, cond, a.reg, 0, label);
        }

        Aget | AgetWide | AgetObject | AgetBoolean | AgetByte | AgetChar | AgetShort => {
            gen_aget(cg, mir_id, op)
        }
        Aput | AputWide | AputBoolean | AputByte | AputChar | AputShort => {
            gen_aput(cg, mir_id, op)
        }
        AputObject => {
            // The runtime performs the covariance check and the card mark.
            let mir = cg.graph.mir(mir_id);
            cg.call_runtime_helper(
                Trampoline::AputObject,
                &[
                    HelperArg::Loc(loc_ref(cg, mir.dalvik.vb)),
                    HelperArg::Loc(loc(cg, mir.dalvik.vc)),
                    HelperArg::Loc(loc_ref(cg, mir.dalvik.va)),
                ],
                true,
            );
        }

        _ if op.is_iget_or_iput() || op.is_iget_or_iput_quick() => gen_ifield(cg, mir_id, op),
        _ if op.is_sget_or_sput() => gen_sfield(cg, mir_id, op),
        _ if op.is_invoke() => invoke::gen_invoke(cg, mir_id),

        NegInt | NotInt => {
            let src = cg.load_value(loc(cg, insn.vb));
            let dest = cg.reg_pool.alloc_temp();
            if dest.is_valid() {
                let alu = if op == NegInt { AluOp::Neg } else { AluOp::Not };
                T::op_reg_reg_imm(cg, alu, dest, src.reg, 0, false);
                cg.store_value(loc(cg, insn.va), dest);
            } else {
                cg.punt_to_interpreter = true;
            }
        }
        NegLong | NotLong => {
            let src = cg.load_value(loc_wide(cg, insn.vb));
            let dest = cg.reg_pool.alloc_temp_wide();
            if dest.is_valid() {
                let alu = if op == NegLong { AluOp::Neg } else { AluOp::Not };
                T::op_reg_reg_imm(cg, alu, dest, src.reg, 0, true);
                cg.store_value(loc_wide(cg, insn.va), dest);
            } else {
                cg.punt_to_interpreter = true;
            }
        }
        NegFloat | NegDouble => {
            let double = op == NegDouble;
            let src = cg.load_value(loc_fp(cg, insn.vb, double));
            let dest = cg.reg_pool.alloc_temp_fp(double);
            if dest.is_valid() {
                T::op_fp_neg(cg, dest, src.reg, double);
                cg.store_value(loc_fp(cg, insn.va, double), dest);
            } else {
                cg.punt_to_interpreter = true;
            }
        }

        IntToLong | IntToFloat | IntToDouble | LongToInt | LongToFloat | LongToDouble
        | FloatToInt | FloatToLong | FloatToDouble | DoubleToInt | DoubleToLong
        | DoubleToFloat | IntToByte | IntToChar | IntToShort => gen_conversion(cg, mir_id, op),

        _ if (0x90..=0xaf).contains(&(op as u8)) => gen_arith(cg, mir_id, op, false),
        _ if (0xb0..=0xcf).contains(&(op as u8)) => gen_arith(cg, mir_id, op, true),
        _ if (0xd0..=0xe2).contains(&(op as u8)) => gen_arith_lit(cg, mir_id, op),

        // Everything else got filtered before codegen; reaching here is a
        // compiler bug.
        _ => panic!(
            "unsupported opcode {:?} reached code generation at {:#x}",
            op, cg.current_dalvik_offset
        ),
    }
}

fn if_cond(op: Opcode) -> Cond {
    match op {
        Opcode::IfEq => Cond::Eq,
        Opcode::IfNe => Cond::Ne,
        Opcode::IfLt => Cond::Lt,
        Opcode::IfGe => Cond::Ge,
        Opcode::IfGt => Cond::Gt,
        Opcode::IfLe => Cond::Le,
        _ => unreachable!(),
    }
}

fn ifz_cond(op: Opcode) -> Cond {
    match op {
        Opcode::IfEqz => Cond::Eq,
        Opcode::IfNez => Cond::Ne,
        Opcode::IfLtz => Cond::Lt,
        Opcode::IfGez => Cond::Ge,
        Opcode::IfGtz => Cond::Gt,
        Opcode::IfLez => Cond::Le,
        _ => unreachable!(),
    }
}

//=============================================================================
// Strings, classes, statics

/// Load a class pointer through the class pool with a resolution slow
/// path. Returns the register holding the class.
fn load_class_pointer<T: Target>(cg: &mut CodeGen<'_, T>, type_idx: u32) -> RegStorage {
    let pool_index = cg.add_class_literal(cg.cu.dex_file.id, type_idx);
    let klass = cg.reg_pool.alloc_temp_ref();
    if !klass.is_valid() {
        cg.punt_to_interpreter = true;
        return klass;
    }
    T::op_load_pool_entry(cg, LiteralPool::Class, pool_index, klass);
    let slow = cg.new_label();
    let cont = cg.new_label();
    T::op_cmp_imm_branch(cg, Cond::Eq, klass, 0, slow);
    cg.place_label(cont);
    cg.queue_slow_path(move |cg| {
        cg.place_label(slow);
        cg.call_runtime_helper(
            Trampoline::InitializeType,
            &[HelperArg::Imm(type_idx as i32)],
            true,
        );
        let ret = cg.target.return_reg(false, false);
        T::op_move(cg, klass, ret);
        T::op_unconditional_branch(cg, cont);
    });
    klass
}

fn gen_const_string<T: Target>(cg: &mut CodeGen<'_, T>, dest_vreg: u32, string_idx: u32) {
    let pool_index = cg.add_string_literal(cg.cu.dex_file.id, string_idx);
    let tmp = cg.reg_pool.alloc_temp_ref();
    if !tmp.is_valid() {
        cg.punt_to_interpreter = true;
        return;
    }
    T::op_load_pool_entry(cg, LiteralPool::String, pool_index, tmp);
    let slow = cg.new_label();
    let cont = cg.new_label();
    T::op_cmp_imm_branch(cg, Cond::Eq, tmp, 0, slow);
    cg.place_label(cont);
    cg.store_value(loc_ref(cg, dest_vreg), tmp);
    cg.queue_slow_path(move |cg| {
        cg.place_label(slow);
        cg.call_runtime_helper(
            Trampoline::ResolveString,
            &[HelperArg::Imm(string_idx as i32)],
            true,
        );
        let ret = cg.target.return_reg(false, false);
        T::op_move(cg, tmp, ret);
        T::op_unconditional_branch(cg, cont);
    });
}

fn gen_const_class<T: Target>(cg: &mut CodeGen<'_, T>, dest_vreg: u32, type_idx: u32) {
    let klass = load_class_pointer(cg, type_idx);
    if klass.is_valid() {
        cg.store_value(loc_ref(cg, dest_vreg), klass);
    }
}

//=============================================================================
// Arrays

fn array_access_parts(op: Opcode) -> (OpSize, u8) {
    match op {
        Opcode::Aget | Opcode::Aput => (OpSize::Word, 2),
        Opcode::AgetWide | Opcode::AputWide => (OpSize::Wide, 3),
        Opcode::AgetObject => (OpSize::Ref, 2),
        Opcode::AgetBoolean | Opcode::AputBoolean => (OpSize::UnsignedByte, 0),
        Opcode::AgetByte | Opcode::AputByte => (OpSize::SignedByte, 0),
        Opcode::AgetChar | Opcode::AputChar => (OpSize::UnsignedHalf, 1),
        Opcode::AgetShort | Opcode::AputShort => (OpSize::SignedHalf, 1),
        _ => unreachable!(),
    }
}

fn gen_array_address<T: Target>(
    cg: &mut CodeGen<'_, T>,
    mir_id: MirId,
    scale: u8,
) -> Option<(RegStorage, RegStorage)> {
    let mir = cg.graph.mir(mir_id);
    let insn = mir.dalvik;
    let mir_flags = mir.optimization_flags;
    let array = cg.load_value(loc_ref(cg, insn.vb));
    let index = cg.load_value(loc(cg, insn.vc));
    cg.gen_null_check(array.reg, mir_flags);
    if mir_flags & opt_flags::IGNORE_RANGE_CHECK == 0 {
        let length = cg.reg_pool.alloc_temp();
        if !length.is_valid() {
            cg.punt_to_interpreter = true;
            return None;
        }
        T::load_base_disp(cg, array.reg, layout::ARRAY_LENGTH_OFFSET, length, OpSize::Word);
        cg.gen_array_bounds_check(index.reg, length);
        cg.reg_pool.free_temp(length);
    }
    let addr = cg.reg_pool.alloc_temp_ref();
    if !addr.is_valid() {
        cg.punt_to_interpreter = true;
        return None;
    }
    let data_offset = layout::array_data_offset(1 << scale);
    T::op_reg_reg_imm(cg, AluOp::Add, addr, array.reg, data_offset, false);
    Some((addr, index.reg))
}

fn gen_aget<T: Target>(cg: &mut CodeGen<'_, T>, mir_id: MirId, op: Opcode) {
    let (size, scale) = array_access_parts(op);
    let insn = cg.graph.mir(mir_id).dalvik;
    let Some((addr, index)) = gen_array_address(cg, mir_id, scale) else { return };
    let dest_loc = match size {
        OpSize::Wide => loc_wide(cg, insn.va),
        OpSize::Ref => loc_ref(cg, insn.va),
        _ => loc(cg, insn.va),
    };
    let dest = cg.reg_pool.alloc_typed_temp(dest_loc.reg_class(), dest_loc.wide);
    if !dest.is_valid() {
        cg.punt_to_interpreter = true;
        return;
    }
    T::load_base_indexed(cg, addr, index, dest, scale, size);
    cg.store_value(dest_loc, dest);
}

fn gen_aput<T: Target>(cg: &mut CodeGen<'_, T>, mir_id: MirId, op: Opcode) {
    let (size, scale) = array_access_parts(op);
    let insn = cg.graph.mir(mir_id).dalvik;
    let src_loc = match size {
        OpSize::Wide => loc_wide(cg, insn.va),
        _ => loc(cg, insn.va),
    };
    let src = cg.load_value(src_loc);
    let Some((addr, index)) = gen_array_address(cg, mir_id, scale) else { return };
    T::store_base_indexed(cg, addr, index, src.reg, scale, size);
}

fn gen_filled_new_array<T: Target>(cg: &mut CodeGen<'_, T>, mir_id: MirId) {
    let insn = cg.graph.mir(mir_id).dalvik;
    let is_range = insn.opcode == Opcode::FilledNewArrayRange;
    let count = insn.va;
    cg.call_runtime_helper(
        Trampoline::CheckAndAllocArray,
        &[HelperArg::Imm(insn.vb as i32), HelperArg::Imm(count as i32)],
        true,
    );
    // Keep the array out of the return register while storing elements.
    let ret = cg.target.return_reg(false, false);
    let array = cg.reg_pool.alloc_temp_ref();
    if !array.is_valid() {
        cg.punt_to_interpreter = true;
        return;
    }
    T::op_move(cg, array, ret);
    let data_offset = layout::array_data_offset(4);
    for i in 0..count {
        let vreg = if is_range { insn.vc + i } else { insn.arg[i as usize] };
        let value = cg.load_value(loc(cg, vreg));
        T::store_base_disp(cg, array, data_offset + (i * 4) as i32, value.reg, OpSize::Word);
        cg.reg_pool.free_temp(value.reg);
    }
    // The following move-result-object reads the return register.
    T::op_move(cg, ret, array);
    cg.reg_pool.free_temp(array);
}

fn gen_fill_array_data<T: Target>(cg: &mut CodeGen<'_, T>, mir_id: MirId) {
    let cu = cg.cu;
    let insn = cg.graph.mir(mir_id).dalvik;
    let payload_pc = (cg.current_dalvik_offset as i64 + insn.literal) as usize;
    let payload = crate::insn::parse_fill_array_data(&cu.code_item.insns, payload_pc);
    let data = cu.arena.alloc_slice(
        1 + payload.units.len(),
        0u16,
        crate::arena::AllocKind::FillArrayData,
    );
    data[0] = crate::insn::FILL_ARRAY_DATA_SIGNATURE;
    data[1..].copy_from_slice(payload.units);
    let table_index = cg.fill_array_data.len();
    cg.fill_array_data.push(super::FillArrayData { data, offset: 0 });

    cg.reg_pool.clobber_all();
    cg.reg_pool.lock_call_temps();
    let arg0 = cg.special_reg(super::SpecialTargetRegister::Arg0);
    let arg1 = cg.special_reg(super::SpecialTargetRegister::Arg1);
    cg.load_value_direct_fixed(loc_ref(cg, insn.va), arg0);
    let anchor = T::op_load_table_anchor(cg, TableRef::FillArray(table_index), arg1);
    T::op_table_base_delta(cg, arg1, arg1, TableRef::FillArray(table_index), anchor);
    cg.call_trampoline(Trampoline::HandleFillArrayData);
    cg.mark_safepoint();
    cg.reg_pool.free_call_temps();
}

//=============================================================================
// Instance and static fields

fn gen_ifield<T: Target>(cg: &mut CodeGen<'_, T>, mir_id: MirId, op: Opcode) {
    let mir = cg.graph.mir(mir_id);
    let insn = mir.dalvik;
    let mir_flags = mir.optimization_flags;
    let info = cg.graph.ifield_lowering_info(mir).clone();
    let is_get = op.is_field_get();
    let size = access_op_size(info.access_type);

    let fast = info.is_quickened || info.resolved.is_some();
    if !fast {
        // Unresolved: the runtime resolves and performs the access.
        let trampoline = slow_ifield_trampoline(info.access_type, is_get);
        if is_get {
            cg.call_runtime_helper(
                trampoline,
                &[HelperArg::Imm(info.field_idx as i32), HelperArg::Loc(loc_ref(cg, insn.vb))],
                true,
            );
            let wide = info.access_type == MemAccessType::Wide;
            let ret = cg.target.return_reg(false, wide);
            cg.store_value(access_loc(cg, insn.va, info.access_type), ret);
        } else {
            cg.call_runtime_helper(
                trampoline,
                &[
                    HelperArg::Imm(info.field_idx as i32),
                    HelperArg::Loc(loc_ref(cg, insn.vb)),
                    HelperArg::Loc(access_loc(cg, insn.va, info.access_type)),
                ],
                true,
            );
        }
        return;
    }

    let field_offset = if info.is_quickened {
        // Quickened opcodes carry the field byte offset directly.
        insn.vc as i32
    } else {
        info.resolved.as_ref().unwrap().field_offset as i32
    };
    let is_volatile = info.resolved.as_ref().is_some_and(|f| f.is_volatile);

    let obj = cg.load_value(loc_ref(cg, insn.vb));
    cg.gen_null_check(obj.reg, mir_flags);
    if is_get {
        let dest_loc = access_loc(cg, insn.va, info.access_type);
        let dest = cg.reg_pool.alloc_typed_temp(dest_loc.reg_class(), dest_loc.wide);
        if !dest.is_valid() {
            cg.punt_to_interpreter = true;
            return;
        }
        T::load_base_disp(cg, obj.reg, field_offset, dest, size);
        if is_volatile {
            T::gen_memory_barrier(cg, MemBarrierKind::LoadAny);
        }
        cg.store_value(dest_loc, dest);
    } else {
        let src = cg.load_value(access_loc(cg, insn.va, info.access_type));
        if is_volatile {
            T::gen_memory_barrier(cg, MemBarrierKind::AnyStore);
        }
        T::store_base_disp(cg, obj.reg, field_offset, src.reg, size);
        if is_volatile {
            T::gen_memory_barrier(cg, MemBarrierKind::AnyAny);
        }
        if info.access_type == MemAccessType::Object {
            let known_non_null = mir_flags & opt_flags::STORE_NON_NULL != 0;
            cg.mark_gc_card(src.reg, obj.reg, known_non_null);
        }
    }
}

fn slow_ifield_trampoline(access: MemAccessType, is_get: bool) -> Trampoline {
    match (access, is_get) {
        (MemAccessType::Wide, true) => Trampoline::Get64Instance,
        (MemAccessType::Object, true) => Trampoline::GetObjInstance,
        (_, true) => Trampoline::Get32Instance,
        (MemAccessType::Wide, false) => Trampoline::Set64Instance,
        (MemAccessType::Object, false) => Trampoline::SetObjInstance,
        (MemAccessType::Boolean | MemAccessType::Byte, false) => Trampoline::Set8Instance,
        (MemAccessType::Char | MemAccessType::Short, false) => Trampoline::Set16Instance,
        (_, false) => Trampoline::Set32Instance,
    }
}

fn slow_sfield_trampoline(access: MemAccessType, is_get: bool) -> Trampoline {
    match (access, is_get) {
        (MemAccessType::Wide, true) => Trampoline::Get64Static,
        (MemAccessType::Object, true) => Trampoline::GetObjStatic,
        (_, true) => Trampoline::Get32Static,
        (MemAccessType::Wide, false) => Trampoline::Set64Static,
        (MemAccessType::Object, false) => Trampoline::SetObjStatic,
        (MemAccessType::Boolean | MemAccessType::Byte, false) => Trampoline::Set8Static,
        (MemAccessType::Char | MemAccessType::Short, false) => Trampoline::Set16Static,
        (_, false) => Trampoline::Set32Static,
    }
}

fn gen_sfield<T: Target>(cg: &mut CodeGen<'_, T>, mir_id: MirId, op: Opcode) {
    let mir = cg.graph.mir(mir_id);
    let insn = mir.dalvik;
    let mir_flags = mir.optimization_flags;
    let info = cg.graph.sfield_lowering_info(mir).clone();
    let is_get = op.is_field_get();
    let size = access_op_size(info.access_type);

    let Some(field) = info.resolved else {
        let trampoline = slow_sfield_trampoline(info.access_type, is_get);
        if is_get {
            cg.call_runtime_helper(trampoline, &[HelperArg::Imm(info.field_idx as i32)], true);
            let wide = info.access_type == MemAccessType::Wide;
            let ret = cg.target.return_reg(false, wide);
            cg.store_value(access_loc(cg, insn.va, info.access_type), ret);
        } else {
            cg.call_runtime_helper(
                trampoline,
                &[
                    HelperArg::Imm(info.field_idx as i32),
                    HelperArg::Loc(access_loc(cg, insn.va, info.access_type)),
                ],
                true,
            );
        }
        return;
    };

    // Fast path: the storage class pointer comes from the class pool; an
    // initialization check runs unless statically or locally elided.
    let klass = cg.reg_pool.alloc_temp_ref();
    if !klass.is_valid() {
        cg.punt_to_interpreter = true;
        return;
    }
    let pool_index = cg.add_class_literal(cg.cu.dex_file.id, field.storage_index);
    T::op_load_pool_entry(cg, LiteralPool::Class, pool_index, klass);

    let needs_clinit_check = !field.is_referrers_class
        && !field.is_class_initialized
        && mir_flags & opt_flags::IGNORE_CLINIT_CHECK == 0;
    if needs_clinit_check {
        let status = cg.reg_pool.alloc_temp();
        if !status.is_valid() {
            cg.punt_to_interpreter = true;
            return;
        }
        let slow = cg.new_label();
        let cont = cg.new_label();
        T::load_base_disp(cg, klass, layout::CLASS_STATUS_OFFSET, status, OpSize::Word);
        T::op_cmp_imm_branch(cg, Cond::Lt, status, layout::CLASS_STATUS_INITIALIZED, slow);
        cg.place_label(cont);
        cg.reg_pool.free_temp(status);
        let storage_index = field.storage_index;
        cg.queue_slow_path(move |cg| {
            cg.place_label(slow);
            cg.call_runtime_helper(
                Trampoline::InitializeStaticStorage,
                &[HelperArg::Imm(storage_index as i32)],
                true,
            );
            let ret = cg.target.return_reg(false, false);
            T::op_move(cg, klass, ret);
            T::op_unconditional_branch(cg, cont);
        });
    }

    let field_offset = field.field_offset as i32;
    if is_get {
        let dest_loc = access_loc(cg, insn.va, info.access_type);
        let dest = cg.reg_pool.alloc_typed_temp(dest_loc.reg_class(), dest_loc.wide);
        if !dest.is_valid() {
            cg.punt_to_interpreter = true;
            return;
        }
        T::load_base_disp(cg, klass, field_offset, dest, size);
        if field.is_volatile {
            T::gen_memory_barrier(cg, MemBarrierKind::LoadAny);
        }
        cg.store_value(dest_loc, dest);
    } else {
        let src = cg.load_value(access_loc(cg, insn.va, info.access_type));
        if field.is_volatile {
            T::gen_memory_barrier(cg, MemBarrierKind::AnyStore);
        }
        T::store_base_disp(cg, klass, field_offset, src.reg, size);
        if field.is_volatile {
            T::gen_memory_barrier(cg, MemBarrierKind::AnyAny);
        }
        if info.access_type == MemAccessType::Object {
            cg.mark_gc_card(src.reg, klass, false);
        }
    }
    cg.reg_pool.free_temp(klass);
}

//=============================================================================
// Arithmetic

/// Map a binop opcode byte to its ALU operation, ignoring width and form.
fn alu_of(op: Opcode) -> AluOp {
    use Opcode::*;
    match op {
        AddInt | AddLong | AddInt2Addr | AddLong2Addr | AddIntLit16 | AddIntLit8 => AluOp::Add,
        SubInt | SubLong | SubInt2Addr | SubLong2Addr => AluOp::Sub,
        RsubInt | RsubIntLit8 => AluOp::Rsub,
        MulInt | MulLong | MulInt2Addr | MulLong2Addr | MulIntLit16 | MulIntLit8 => AluOp::Mul,
        DivInt | DivLong | DivInt2Addr | DivLong2Addr | DivIntLit16 | DivIntLit8 => AluOp::Div,
        RemInt | RemLong | RemInt2Addr | RemLong2Addr | RemIntLit16 | RemIntLit8 => AluOp::Rem,
        AndInt | AndLong | AndInt2Addr | AndLong2Addr | AndIntLit16 | AndIntLit8 => AluOp::And,
        OrInt | OrLong | OrInt2Addr | OrLong2Addr | OrIntLit16 | OrIntLit8 => AluOp::Or,
        XorInt | XorLong | XorInt2Addr | XorLong2Addr | XorIntLit16 | XorIntLit8 => AluOp::Xor,
        ShlInt | ShlLong | ShlInt2Addr | ShlLong2Addr | ShlIntLit8 => AluOp::Shl,
        ShrInt | ShrLong | ShrInt2Addr | ShrLong2Addr | ShrIntLit8 => AluOp::Shr,
        UshrInt | UshrLong | UshrInt2Addr | UshrLong2Addr | UshrIntLit8 => AluOp::Ushr,
        _ => unreachable!("not a binop: {op:?}"),
    }
}

fn fp_op_of(op: Opcode) -> Option<FpOp> {
    use Opcode::*;
    Some(match op {
        AddFloat | AddDouble | AddFloat2Addr | AddDouble2Addr => FpOp::Add,
        SubFloat | SubDouble | SubFloat2Addr | SubDouble2Addr => FpOp::Sub,
        MulFloat | MulDouble | MulFloat2Addr | MulDouble2Addr => FpOp::Mul,
        DivFloat | DivDouble | DivFloat2Addr | DivDouble2Addr => FpOp::Div,
        _ => return None,
    })
}

fn gen_arith<T: Target>(cg: &mut CodeGen<'_, T>, mir_id: MirId, op: Opcode, two_addr: bool) {
    let insn = cg.graph.mir(mir_id).dalvik;
    let byte = op as u8;
    let (src1_v, src2_v) = if two_addr { (insn.va, insn.vb) } else { (insn.vb, insn.vc) };
    let dest_v = insn.va;

    // Float and double forms.
    let is_float = matches!(byte, 0xa6..=0xaa | 0xc6..=0xca);
    let is_double = matches!(byte, 0xab..=0xaf | 0xcb..=0xcf);
    if is_float || is_double {
        let is_rem = matches!(
            op,
            Opcode::RemFloat | Opcode::RemDouble | Opcode::RemFloat2Addr | Opcode::RemDouble2Addr
        );
        if is_rem {
            // fmod goes through the runtime's soft-float entry points.
            let trampoline = if is_double { Trampoline::Dmod } else { Trampoline::Fmod };
            let mut a = loc_fp(cg, src1_v, is_double);
            let mut b = loc_fp(cg, src2_v, is_double);
            // The trampoline ABI takes the raw bits in core registers.
            a.fp = false;
            b.fp = false;
            cg.call_runtime_helper(trampoline, &[HelperArg::Loc(a), HelperArg::Loc(b)], false);
            let ret = cg.target.return_reg(false, is_double);
            cg.store_value(loc_fp(cg, dest_v, is_double), ret);
            return;
        }
        let fp_op = fp_op_of(op).expect("fp binop");
        let a = cg.load_value(loc_fp(cg, src1_v, is_double));
        let b = cg.load_value(loc_fp(cg, src2_v, is_double));
        let dest = cg.reg_pool.alloc_temp_fp(is_double);
        if !dest.is_valid() {
            cg.punt_to_interpreter = true;
            return;
        }
        T::op_fp_rrr(cg, fp_op, dest, a.reg, b.reg, is_double);
        cg.store_value(loc_fp(cg, dest_v, is_double), dest);
        return;
    }

    let wide = matches!(byte, 0x9b..=0xa5 | 0xbb..=0xc5);
    let alu = alu_of(op);

    // Shifts take a narrow shift count even in wide forms.
    let shift = matches!(alu, AluOp::Shl | AluOp::Shr | AluOp::Ushr);
    let a = cg.load_value(if wide { loc_wide(cg, src1_v) } else { loc(cg, src1_v) });
    let b = cg.load_value(if wide && !shift { loc_wide(cg, src2_v) } else { loc(cg, src2_v) });

    let div_like = matches!(alu, AluOp::Div | AluOp::Rem);
    if div_like {
        cg.gen_div_zero_check(b.reg);
    }

    // Operations without a direct instruction go through the runtime:
    // division without hardware support, and the 64-bit multiply, divide
    // and shifts on register-pair targets.
    let pairs = !cg.reg_pool.wide_is_solo;
    let needs_helper = (div_like && (!cg.target.supports_hw_div() || (wide && pairs)))
        || (wide && pairs && matches!(alu, AluOp::Mul | AluOp::Shl | AluOp::Shr | AluOp::Ushr));
    if needs_helper {
        let trampoline = match (alu, wide) {
            (AluOp::Div | AluOp::Rem, false) => Trampoline::Idivmod,
            (AluOp::Div, true) => Trampoline::Ldiv,
            (AluOp::Rem, true) => Trampoline::Lmod,
            (AluOp::Mul, true) => Trampoline::Lmul,
            (AluOp::Shl, true) => Trampoline::Shl,
            (AluOp::Shr, true) => Trampoline::Shr,
            (AluOp::Ushr, true) => Trampoline::Ushr,
            _ => unreachable!(),
        };
        cg.call_runtime_helper(
            trampoline,
            &[HelperArg::Reg(a.reg), HelperArg::Reg(b.reg)],
            false,
        );
        // Idivmod returns the quotient in ret0 and the remainder in ret1.
        let ret = if !wide && alu == AluOp::Rem && trampoline == Trampoline::Idivmod {
            cg.target.special_reg(super::SpecialTargetRegister::Ret1)
        } else {
            cg.target.return_reg(false, wide)
        };
        let dest_loc = if wide { loc_wide(cg, dest_v) } else { loc(cg, dest_v) };
        cg.store_value(dest_loc, ret);
        return;
    }

    let dest =
        if wide { cg.reg_pool.alloc_temp_wide() } else { cg.reg_pool.alloc_temp() };
    if !dest.is_valid() {
        cg.punt_to_interpreter = true;
        return;
    }
    T::op_reg_reg_reg(cg, alu, dest, a.reg, b.reg, wide);
    let dest_loc = if wide { loc_wide(cg, dest_v) } else { loc(cg, dest_v) };
    cg.store_value(dest_loc, dest);
}

fn gen_arith_lit<T: Target>(cg: &mut CodeGen<'_, T>, mir_id: MirId, op: Opcode) {
    let insn = cg.graph.mir(mir_id).dalvik;
    let alu = alu_of(op);
    let lit = insn.literal as i32;
    if matches!(alu, AluOp::Div | AluOp::Rem) && lit == 0 {
        // Constant division by zero always throws.
        let slow = cg.new_label();
        T::op_unconditional_branch(cg, slow);
        cg.queue_slow_path(move |cg| {
            cg.place_label(slow);
            cg.call_runtime_helper(Trampoline::ThrowDivZero, &[], true);
        });
        return;
    }
    let src = cg.load_value(loc(cg, insn.vb));
    if matches!(alu, AluOp::Div | AluOp::Rem) && !cg.target.supports_hw_div() {
        let b = cg.reg_pool.alloc_temp();
        if !b.is_valid() {
            cg.punt_to_interpreter = true;
            return;
        }
        T::load_constant(cg, b, lit);
        cg.call_runtime_helper(
            Trampoline::Idivmod,
            &[HelperArg::Reg(src.reg), HelperArg::Reg(b)],
            false,
        );
        let ret = if alu == AluOp::Rem {
            cg.target.special_reg(super::SpecialTargetRegister::Ret1)
        } else {
            cg.target.return_reg(false, false)
        };
        cg.store_value(loc(cg, insn.va), ret);
        return;
    }
    let dest = cg.reg_pool.alloc_temp();
    if !dest.is_valid() {
        cg.punt_to_interpreter = true;
        return;
    }
    T::op_reg_reg_imm(cg, alu, dest, src.reg, lit, false);
    cg.store_value(loc(cg, insn.va), dest);
}

fn gen_conversion<T: Target>(cg: &mut CodeGen<'_, T>, mir_id: MirId, op: Opcode) {
    use Opcode::*;
    let insn = cg.graph.mir(mir_id).dalvik;
    let (kind, src_wide, src_fp, dest_wide, dest_fp) = match op {
        IntToLong => (ConvKind::I2L, false, false, true, false),
        IntToFloat => (ConvKind::I2F, false, false, false, true),
        IntToDouble => (ConvKind::I2D, false, false, true, true),
        LongToInt => (ConvKind::L2I, true, false, false, false),
        LongToFloat => (ConvKind::L2F, true, false, false, true),
        LongToDouble => (ConvKind::L2D, true, false, true, true),
        FloatToInt => (ConvKind::F2I, false, true, false, false),
        FloatToLong => (ConvKind::F2L, false, true, true, false),
        FloatToDouble => (ConvKind::F2D, false, true, true, true),
        DoubleToInt => (ConvKind::D2I, true, true, false, false),
        DoubleToLong => (ConvKind::D2L, true, true, true, false),
        DoubleToFloat => (ConvKind::D2F, true, true, false, true),
        IntToByte => (ConvKind::I2B, false, false, false, false),
        IntToChar => (ConvKind::I2C, false, false, false, false),
        IntToShort => (ConvKind::I2S, false, false, false, false),
        _ => unreachable!(),
    };
    let src = cg.load_value(cg.loc_for_vreg(insn.vb, src_wide, src_fp, false));
    let dest_loc = cg.loc_for_vreg(insn.va, dest_wide, dest_fp, false);
    let dest = cg.reg_pool.alloc_typed_temp(dest_loc.reg_class(), dest_wide);
    if !dest.is_valid() {
        cg.punt_to_interpreter = true;
        return;
    }
    T::op_conversion(cg, kind, dest, src.reg);
    cg.store_value(dest_loc, dest);
}

//=============================================================================
// Switches

fn gen_switch<T: Target>(cg: &mut CodeGen<'_, T>, mir_id: MirId, is_sparse: bool) {
    let cu = cg.cu;
    let mir = cg.graph.mir(mir_id);
    let insn = mir.dalvik;
    let bb = mir.bb;
    let cases: Vec<(i32, Block)> =
        cg.graph.block(bb).successors.iter().map(|s| (s.key, s.block)).collect();
    if cases.is_empty() {
        // Empty switch: fall through, no table.
        return;
    }
    let key = cg.load_value(loc(cg, insn.va));

    if is_sparse && cases.len() <= MAX_CHAINED_SWITCH_CASES {
        for &(case_key, block) in &cases {
            let label = cg.block_label(block);
            T::op_cmp_imm_branch(cg, Cond::Eq, key.reg, case_key, label);
        }
        return;
    }

    let keys = cu.arena.alloc_slice(cases.len(), 0i32, crate::arena::AllocKind::SwitchTable);
    let targets = cu.arena.alloc_slice(
        cases.len(),
        Block::from_u32(0),
        crate::arena::AllocKind::SwitchTable,
    );
    for (index, &(case_key, block)) in cases.iter().enumerate() {
        keys[index] = case_key;
        targets[index] = block;
    }
    let table_index = cg.switch_tables.len();
    cg.switch_tables.push(SwitchTable {
        is_sparse,
        keys,
        targets,
        offset: 0,
        anchor: None,
    });

    if !is_sparse {
        gen_packed_switch_dispatch(cg, mir_id, table_index, key.reg);
    } else {
        gen_sparse_switch_loop(cg, mir_id, table_index, key.reg);
    }
}

/// Packed dispatch: bias the key, bounds-test it, materialize the anchor
/// reference address, then add the anchor-relative displacement loaded
/// from the table.
fn gen_packed_switch_dispatch<T: Target>(
    cg: &mut CodeGen<'_, T>,
    mir_id: MirId,
    table_index: usize,
    key_reg: RegStorage,
) {
    let bb = cg.graph.mir(mir_id).bb;
    let low_key = cg.switch_tables[table_index].keys[0];
    let size = cg.switch_tables[table_index].targets.len() as i32;
    let fall_through = cg.graph.block(bb).fall_through.expect("switch without default edge");
    let default_label = cg.block_label(fall_through);

    let biased = cg.reg_pool.alloc_temp();
    let base = cg.reg_pool.alloc_temp_ref();
    let table = cg.reg_pool.alloc_temp_ref();
    let disp = cg.reg_pool.alloc_temp();
    if !biased.is_valid() || !base.is_valid() || !table.is_valid() || !disp.is_valid() {
        cg.punt_to_interpreter = true;
        return;
    }
    if low_key != 0 {
        T::op_reg_reg_imm(cg, AluOp::Sub, biased, key_reg, low_key, false);
    } else {
        T::op_move(cg, biased, key_reg);
    }
    T::op_cmp_imm_branch(cg, Cond::Uge, biased, size, default_label);
    let anchor = T::op_load_table_anchor(cg, TableRef::Switch(table_index), base);
    cg.switch_tables[table_index].anchor = Some(anchor);
    T::op_table_base_delta(cg, table, base, TableRef::Switch(table_index), anchor);
    T::load_base_indexed(cg, table, biased, disp, 2, OpSize::Word);
    T::op_reg_reg_reg(cg, AluOp::Add, disp, base, disp, false);
    T::op_branch_reg(cg, disp);
}

/// Large sparse dispatch: scan the key half of the table in a loop.
fn gen_sparse_switch_loop<T: Target>(
    cg: &mut CodeGen<'_, T>,
    mir_id: MirId,
    table_index: usize,
    key_reg: RegStorage,
) {
    let bb = cg.graph.mir(mir_id).bb;
    let size = cg.switch_tables[table_index].targets.len() as i32;
    let fall_through = cg.graph.block(bb).fall_through.expect("switch without default edge");
    let default_label = cg.block_label(fall_through);

    let base = cg.reg_pool.alloc_temp_ref();
    let table = cg.reg_pool.alloc_temp_ref();
    let index = cg.reg_pool.alloc_temp();
    let scratch = cg.reg_pool.alloc_temp();
    if !base.is_valid() || !table.is_valid() || !index.is_valid() || !scratch.is_valid() {
        cg.punt_to_interpreter = true;
        return;
    }
    let anchor = T::op_load_table_anchor(cg, TableRef::Switch(table_index), base);
    cg.switch_tables[table_index].anchor = Some(anchor);
    T::op_table_base_delta(cg, table, base, TableRef::Switch(table_index), anchor);
    T::load_constant(cg, index, 0);

    let loop_head = cg.new_label();
    let found = cg.new_label();
    cg.place_label(loop_head);
    // scratch = keys[index]
    T::load_base_indexed(cg, table, index, scratch, 2, OpSize::Word);
    T::op_cmp_branch(cg, Cond::Eq, scratch, key_reg, found);
    T::op_reg_reg_imm(cg, AluOp::Add, index, index, 1, false);
    T::op_cmp_imm_branch(cg, Cond::Lt, index, size, loop_head);
    T::op_unconditional_branch(cg, default_label);

    // Displacements live in the second half of the table, relative to the
    // anchor's reference address held in `base`.
    cg.place_label(found);
    T::op_reg_reg_imm(cg, AluOp::Add, index, index, size, false);
    T::load_base_indexed(cg, table, index, scratch, 2, OpSize::Word);
    T::op_reg_reg_reg(cg, AluOp::Add, scratch, base, scratch, false);
    T::op_branch_reg(cg, scratch);
}

//=============================================================================
// Extended (pseudo) MIR

fn handle_extended<T: Target>(cg: &mut CodeGen<'_, T>, mir_id: MirId, op: PseudoOp) {
    let insn = cg.graph.mir(mir_id).dalvik;
    match op {
        // Phis carry no code.
        PseudoOp::Phi | PseudoOp::Nop => {}
        PseudoOp::Copy => {
            let src = cg.load_value(loc(cg, insn.vb));
            cg.store_value(loc(cg, insn.va), src.reg);
        }
        PseudoOp::FusedCmplFloat
        | PseudoOp::FusedCmpgFloat
        | PseudoOp::FusedCmplDouble
        | PseudoOp::FusedCmpgDouble => {
            let double =
                matches!(op, PseudoOp::FusedCmplDouble | PseudoOp::FusedCmpgDouble);
            let gt_bias = matches!(op, PseudoOp::FusedCmpgFloat | PseudoOp::FusedCmpgDouble);
            let a = cg.load_value(loc_fp(cg, insn.vb, double));
            let b = cg.load_value(loc_fp(cg, insn.vc, double));
            let tmp = cg.reg_pool.alloc_temp();
            if !tmp.is_valid() {
                cg.punt_to_interpreter = true;
                return;
            }
            T::op_fp_cmp(cg, tmp, a.reg, b.reg, double, gt_bias);
            fused_branch(cg, mir_id, tmp);
        }
        PseudoOp::FusedCmpLong => {
            let a = cg.load_value(loc_wide(cg, insn.vb));
            let b = cg.load_value(loc_wide(cg, insn.vc));
            let tmp = cg.reg_pool.alloc_temp();
            if !tmp.is_valid() {
                cg.punt_to_interpreter = true;
                return;
            }
            T::op_cmp_long(cg, tmp, a.reg, b.reg);
            fused_branch(cg, mir_id, tmp);
        }
        PseudoOp::NullCheck => {
            let obj = cg.load_value(loc_ref(cg, insn.va));
            let flags = cg.graph.mir(mir_id).optimization_flags;
            cg.gen_null_check(obj.reg, flags);
        }
        PseudoOp::DivZeroCheck => {
            let value = cg.load_value(loc(cg, insn.va));
            cg.gen_div_zero_check(value.reg);
        }
        PseudoOp::RangeCheck | PseudoOp::Check => {
            // Explicit checks only appear when a pass materializes them;
            // the array handlers re-check, so nothing is lost by a no-op.
        }
        PseudoOp::Select => {
            // A select lowers to its unfused compare-and-branch diamond.
            let src = cg.load_value(loc(cg, insn.vb));
            cg.store_value(loc(cg, insn.va), src.reg);
        }
        PseudoOp::MemBarrier => T::gen_memory_barrier(cg, MemBarrierKind::AnyAny),
    }
}


/// The branch half of a fused compare: the original if-testz opcode is
/// stashed in `va`.
fn fused_branch<T: Target>(cg: &mut CodeGen<'_, T>, mir_id: MirId, cmp_result: RegStorage) {
    let mir = cg.graph.mir(mir_id);
    let branch_op = Opcode::from_code_unit(mir.dalvik.va as u16);
    let taken = cg.graph.block(mir.bb).taken.expect("fused branch without taken edge");
    let label = cg.block_label(taken);
    T::op_cmp_imm_branch(cg, ifz_cond(branch_op), cmp_result, 0, label);
}
