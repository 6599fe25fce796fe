//! The ARM64 backend.

use crate::backend::assemble::{AsmEnv, WidenRequest};
use crate::backend::lir::{FixupKind, Lir, LirId, LirOp};
use crate::backend::regalloc::RegPoolTemplate;
use crate::backend::regs::RegStorage;
use crate::backend::{
    AluOp, CodeGen, Cond, ConvKind, FpOp, LiteralPool, MemBarrierKind, OpSize,
    SpecialTargetRegister, TableRef, Target,
};
use crate::options::{InstructionSet, InstructionSetFeatures};

pub mod emit;
pub mod regs;

use regs::{dreg, sreg, wreg, xreg, HIDDEN_ARG, LR, SELF_REG};

/// ARM64 target opcodes. Composite operations (constant materialization,
/// compare-and-set sequences) count as one LIR whose size the encoder
/// computes.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum A64Op {
    LoadConst,
    LoadConst64,
    Load,
    Store,
    LoadIndexed,
    StoreIndexed,
    Mov,
    AluRRR,
    AluRRI,
    FpRRR,
    FpNeg,
    FpCmp,
    CmpLong,
    Conv,
    CmpBr,
    CmpImmBr,
    B,
    Blr,
    Bl,
    Br,
    Ret,
    LoadPool,
    /// `adr xd, #0`: the instruction's own address, the displacement
    /// reference point for switch and fill-array tables.
    Adr,
    /// `xd = xs + (table offset − anchor offset)`, two shifted adds.
    TableDelta,
    Dmb,
    SpAdjust,
    Spill,
    Unspill,
    Ldxr,
    Stxr,
    Probe,
}

pub struct Arm64Target {
    #[allow(dead_code)]
    features: InstructionSetFeatures,
}

fn op_lir(op: A64Op, operands: [i32; 5]) -> Lir<A64Op> {
    let mut lir = Lir::new(LirOp::Target(op), 0);
    lir.operands = operands;
    lir
}

fn rbits(reg: RegStorage) -> i32 {
    i32::from(reg.bits())
}

impl Arm64Target {
    fn push(cg: &mut CodeGen<Self>, op: A64Op, operands: [i32; 5]) -> LirId {
        cg.append(op_lir(op, operands))
    }

    fn push_branch(
        cg: &mut CodeGen<Self>,
        op: A64Op,
        operands: [i32; 5],
        target: LirId,
    ) -> LirId {
        let mut lir = op_lir(op, operands);
        lir.target = Some(target);
        lir.flags.fixup = FixupKind::Branch;
        cg.append(lir)
    }

    /// Spill-area offsets, top of frame downward: core saves first (link
    /// register highest), then fp saves.
    fn spill_slots(cg: &CodeGen<Self>) -> Vec<(RegStorage, i32)> {
        let mut slots = Vec::new();
        let mut offset = cg.frame_size as i32;
        for num in (0..=31u8).rev() {
            if cg.core_spill_mask & (1 << num) != 0 {
                offset -= 8;
                slots.push((xreg(num), offset));
            }
        }
        for num in (0..=31u8).rev() {
            if cg.fp_spill_mask & (1 << num) != 0 {
                offset -= 8;
                slots.push((dreg(num), offset));
            }
        }
        slots
    }
}

impl Target for Arm64Target {
    type Op = A64Op;
    const ISA: InstructionSet = InstructionSet::Arm64;

    fn new(features: InstructionSetFeatures) -> Self {
        Self { features }
    }

    fn reg_pool_template(&self) -> RegPoolTemplate {
        regs::pool_template()
    }

    fn special_reg(&self, reg: SpecialTargetRegister) -> RegStorage {
        use SpecialTargetRegister::*;
        match reg {
            SelfThread => xreg(SELF_REG),
            Sp => xreg(31),
            Arg0 => wreg(0),
            Arg1 => wreg(1),
            Arg2 => wreg(2),
            Arg3 => wreg(3),
            FArg0 => sreg(0),
            FArg1 => sreg(1),
            FArg2 => sreg(2),
            FArg3 => sreg(3),
            Ret0 => wreg(0),
            Ret1 => wreg(1),
            InvokeTgt => xreg(LR),
            HiddenArg => wreg(HIDDEN_ARG),
        }
    }

    fn arg_reg(&self, index: usize, fp: bool, wide: bool) -> Option<RegStorage> {
        regs::arg_reg(index, fp, wide)
    }

    fn return_reg(&self, fp: bool, wide: bool) -> RegStorage {
        match (fp, wide) {
            (true, true) => dreg(0),
            (true, false) => sreg(0),
            (false, true) => xreg(0),
            (false, false) => wreg(0),
        }
    }

    fn return_address_spill_mask(&self) -> u32 {
        1 << LR
    }

    fn dwarf_reg(&self, reg: RegStorage) -> u16 {
        regs::dwarf_reg(reg)
    }

    fn dwarf_return_address_reg(&self) -> u16 {
        u16::from(LR)
    }

    fn dwarf_stack_pointer_reg(&self) -> u16 {
        31
    }

    fn load_constant(cg: &mut CodeGen<Self>, dest: RegStorage, value: i32) {
        Self::push(cg, A64Op::LoadConst, [rbits(dest), value, 0, 0, 0]);
    }

    fn load_constant_wide(cg: &mut CodeGen<Self>, dest: RegStorage, value: i64) {
        Self::push(
            cg,
            A64Op::LoadConst64,
            [rbits(dest), value as u32 as i32, (value >> 32) as i32, 0, 0],
        );
    }

    fn load_base_disp(
        cg: &mut CodeGen<Self>,
        base: RegStorage,
        disp: i32,
        dest: RegStorage,
        size: OpSize,
    ) {
        Self::push(
            cg,
            A64Op::Load,
            [rbits(dest), rbits(base), disp, emit::size_tag(size), 0],
        );
    }

    fn store_base_disp(
        cg: &mut CodeGen<Self>,
        base: RegStorage,
        disp: i32,
        src: RegStorage,
        size: OpSize,
    ) {
        Self::push(
            cg,
            A64Op::Store,
            [rbits(src), rbits(base), disp, emit::size_tag(size), 0],
        );
    }

    fn load_base_indexed(
        cg: &mut CodeGen<Self>,
        base: RegStorage,
        index: RegStorage,
        dest: RegStorage,
        scale: u8,
        size: OpSize,
    ) {
        Self::push(
            cg,
            A64Op::LoadIndexed,
            [rbits(dest), rbits(base), rbits(index), i32::from(scale), emit::size_tag(size)],
        );
    }

    fn store_base_indexed(
        cg: &mut CodeGen<Self>,
        base: RegStorage,
        index: RegStorage,
        src: RegStorage,
        scale: u8,
        size: OpSize,
    ) {
        Self::push(
            cg,
            A64Op::StoreIndexed,
            [rbits(src), rbits(base), rbits(index), i32::from(scale), emit::size_tag(size)],
        );
    }

    fn op_move(cg: &mut CodeGen<Self>, dest: RegStorage, src: RegStorage) {
        Self::push(cg, A64Op::Mov, [rbits(dest), rbits(src), 0, 0, 0]);
    }

    fn op_reg_reg_reg(
        cg: &mut CodeGen<Self>,
        op: AluOp,
        dest: RegStorage,
        src1: RegStorage,
        src2: RegStorage,
        wide: bool,
    ) {
        let (dest, src1, src2) = if wide {
            (
                RegStorage::solo64(dest.reg_num()),
                RegStorage::solo64(src1.reg_num()),
                RegStorage::solo64(src2.reg_num()),
            )
        } else {
            (dest, src1, src2)
        };
        Self::push(
            cg,
            A64Op::AluRRR,
            [emit::alu_tag(op), rbits(dest), rbits(src1), rbits(src2), 0],
        );
    }

    fn op_reg_reg_imm(
        cg: &mut CodeGen<Self>,
        op: AluOp,
        dest: RegStorage,
        src: RegStorage,
        value: i32,
        wide: bool,
    ) {
        let (dest, src) = if wide {
            (RegStorage::solo64(dest.reg_num()), RegStorage::solo64(src.reg_num()))
        } else {
            (dest, src)
        };
        Self::push(
            cg,
            A64Op::AluRRI,
            [emit::alu_tag(op), rbits(dest), rbits(src), value, 0],
        );
    }

    fn op_fp_rrr(
        cg: &mut CodeGen<Self>,
        op: FpOp,
        dest: RegStorage,
        src1: RegStorage,
        src2: RegStorage,
        _double: bool,
    ) {
        Self::push(
            cg,
            A64Op::FpRRR,
            [op as i32, rbits(dest), rbits(src1), rbits(src2), 0],
        );
    }

    fn op_fp_neg(cg: &mut CodeGen<Self>, dest: RegStorage, src: RegStorage, _double: bool) {
        Self::push(cg, A64Op::FpNeg, [rbits(dest), rbits(src), 0, 0, 0]);
    }

    fn op_fp_cmp(
        cg: &mut CodeGen<Self>,
        dest: RegStorage,
        src1: RegStorage,
        src2: RegStorage,
        _double: bool,
        gt_bias: bool,
    ) {
        Self::push(
            cg,
            A64Op::FpCmp,
            [rbits(dest), rbits(src1), rbits(src2), i32::from(gt_bias), 0],
        );
    }

    fn op_cmp_long(
        cg: &mut CodeGen<Self>,
        dest: RegStorage,
        src1: RegStorage,
        src2: RegStorage,
    ) {
        Self::push(cg, A64Op::CmpLong, [rbits(dest), rbits(src1), rbits(src2), 0, 0]);
    }

    fn op_conversion(cg: &mut CodeGen<Self>, kind: ConvKind, dest: RegStorage, src: RegStorage) {
        Self::push(cg, A64Op::Conv, [emit::conv_tag(kind), rbits(dest), rbits(src), 0, 0]);
    }

    fn op_cmp_branch(
        cg: &mut CodeGen<Self>,
        cond: Cond,
        a: RegStorage,
        b: RegStorage,
        target: LirId,
    ) -> LirId {
        Self::push_branch(
            cg,
            A64Op::CmpBr,
            [emit::cond_tag(cond), rbits(a), rbits(b), 0, 0],
            target,
        )
    }

    fn op_cmp_imm_branch(
        cg: &mut CodeGen<Self>,
        cond: Cond,
        reg: RegStorage,
        value: i32,
        target: LirId,
    ) -> LirId {
        Self::push_branch(
            cg,
            A64Op::CmpImmBr,
            [emit::cond_tag(cond), rbits(reg), value, 0, 0],
            target,
        )
    }

    fn op_unconditional_branch(cg: &mut CodeGen<Self>, target: LirId) -> LirId {
        Self::push_branch(cg, A64Op::B, [0; 5], target)
    }

    fn op_call_reg(cg: &mut CodeGen<Self>, reg: RegStorage) -> LirId {
        Self::push(cg, A64Op::Blr, [rbits(reg), 0, 0, 0, 0])
    }

    fn op_call_direct(cg: &mut CodeGen<Self>) -> LirId {
        Self::push(cg, A64Op::Bl, [0; 5])
    }

    fn op_load_pool_entry(
        cg: &mut CodeGen<Self>,
        pool: LiteralPool,
        index: usize,
        dest: RegStorage,
    ) -> LirId {
        let mut lir = op_lir(A64Op::LoadPool, [rbits(dest), pool as i32, index as i32, 0, 0]);
        lir.flags.fixup = FixupKind::Load;
        cg.append(lir)
    }

    fn op_load_table_anchor(
        cg: &mut CodeGen<Self>,
        _table: TableRef,
        dest: RegStorage,
    ) -> LirId {
        // The anchor materializes its own address; displacements are
        // relative to its offset as-is on this target.
        Self::push(cg, A64Op::Adr, [rbits(dest), 0, 0, 0, 0])
    }

    fn op_table_base_delta(
        cg: &mut CodeGen<Self>,
        dest: RegStorage,
        src: RegStorage,
        table: TableRef,
        anchor: LirId,
    ) {
        let (kind, index) = match table {
            TableRef::Switch(index) => (0, index),
            TableRef::FillArray(index) => (1, index),
        };
        let mut lir =
            op_lir(A64Op::TableDelta, [rbits(dest), rbits(src), kind, index as i32, 0]);
        lir.target = Some(anchor);
        lir.flags.fixup = FixupKind::SwitchTable;
        cg.append(lir);
    }

    fn op_branch_reg(cg: &mut CodeGen<Self>, reg: RegStorage) {
        Self::push(cg, A64Op::Br, [rbits(reg), 0, 0, 0, 0]);
    }

    fn gen_entry_sequence(cg: &mut CodeGen<Self>) {
        if cg.frame_size == 0 {
            cg.cfi.def_cfa_offset(cg.last_lir, 0);
            return;
        }
        // Explicit stack-overflow probe below the new frame.
        if !cg.cu.options.implicit_stack_overflow_checks && !cg.graph.is_leaf {
            Self::push(
                cg,
                A64Op::Probe,
                [crate::backend::layout::STACK_OVERFLOW_RESERVED_BYTES, 0, 0, 0, 0],
            );
        }
        let frame = cg.frame_size as i32;
        let adjust = Self::push(cg, A64Op::SpAdjust, [-frame, 0, 0, 0, 0]);
        cg.cfi.def_cfa_offset(Some(adjust), frame);
        for (reg, offset) in Self::spill_slots(cg) {
            let spill = Self::push(cg, A64Op::Spill, [rbits(reg), offset, 0, 0, 0]);
            let dwarf = regs::dwarf_reg(reg);
            cg.cfi.rel_offset(Some(spill), dwarf, frame - offset);
        }
        // Home the ArtMethod* at the base of the frame.
        Self::push(
            cg,
            A64Op::Store,
            [rbits(xreg(0)), rbits(xreg(31)), 0, emit::size_tag(OpSize::Ref), 0],
        );
    }

    fn gen_exit_sequence(cg: &mut CodeGen<Self>) {
        if cg.frame_size != 0 {
            cg.cfi.remember_state(cg.last_lir);
            for (reg, offset) in Self::spill_slots(cg) {
                let unspill = Self::push(cg, A64Op::Unspill, [rbits(reg), offset, 0, 0, 0]);
                cg.cfi.restore(Some(unspill), regs::dwarf_reg(reg));
            }
            let frame = cg.frame_size as i32;
            let adjust = Self::push(cg, A64Op::SpAdjust, [frame, 0, 0, 0, 0]);
            cg.cfi.def_cfa_offset(Some(adjust), 0);
        }
        let ret = Self::push(cg, A64Op::Ret, [0; 5]);
        if cg.frame_size != 0 {
            cg.cfi.restore_state(Some(ret));
            // Following blocks are again inside the frame.
            cg.cfi.def_cfa_offset(Some(ret), cg.frame_size as i32);
        }
    }

    fn gen_memory_barrier(cg: &mut CodeGen<Self>, kind: MemBarrierKind) {
        Self::push(cg, A64Op::Dmb, [kind as i32, 0, 0, 0, 0]);
    }

    fn gen_monitor_enter(cg: &mut CodeGen<Self>, obj: RegStorage) {
        use crate::backend::layout::{
            Trampoline, LOCK_WORD_READ_BARRIER_MASK, OBJECT_LOCK_WORD_OFFSET, THREAD_ID_OFFSET,
        };
        // Thin-lock fast path over ldxr/stxr; contention and inflation go
        // to the runtime. Read-barrier bits stay untouched in the stored
        // word.
        let slow = cg.new_label();
        let retry = cg.new_label();
        let cont = cg.new_label();
        let tmp = cg.reg_pool.alloc_temp();
        let tid = cg.reg_pool.alloc_temp();
        let status = cg.reg_pool.alloc_temp();
        if !tmp.is_valid() || !tid.is_valid() || !status.is_valid() {
            cg.call_runtime_helper(
                Trampoline::LockObject,
                &[crate::backend::HelperArg::Reg(obj)],
                true,
            );
            return;
        }
        let self_reg = cg.special_reg(SpecialTargetRegister::SelfThread);
        Self::load_base_disp(cg, self_reg, THREAD_ID_OFFSET, tid, OpSize::Word);
        let addr = RegStorage::solo64(regs::SCRATCH);
        Self::op_reg_reg_imm(cg, AluOp::Add, addr, RegStorage::solo64(obj.reg_num()), OBJECT_LOCK_WORD_OFFSET, true);
        cg.place_label(retry);
        Self::push(cg, A64Op::Ldxr, [rbits(tmp), rbits(addr), 0, 0, 0]);
        Self::op_reg_reg_imm(cg, AluOp::And, status, tmp, !LOCK_WORD_READ_BARRIER_MASK, false);
        Self::op_cmp_imm_branch(cg, crate::backend::Cond::Ne, status, 0, slow);
        Self::op_reg_reg_reg(cg, AluOp::Or, tid, tid, tmp, false);
        Self::push(cg, A64Op::Stxr, [rbits(status), rbits(tid), rbits(addr), 0, 0]);
        Self::op_cmp_imm_branch(cg, crate::backend::Cond::Ne, status, 0, retry);
        Self::push(cg, A64Op::Dmb, [3, 0, 0, 0, 0]);
        cg.place_label(cont);
        cg.reg_pool.free_temp(tmp);
        cg.reg_pool.free_temp(tid);
        cg.reg_pool.free_temp(status);
        cg.queue_slow_path(move |cg| {
            cg.place_label(slow);
            cg.call_runtime_helper(
                Trampoline::LockObject,
                &[crate::backend::HelperArg::Reg(obj)],
                true,
            );
            Self::push_branch(cg, A64Op::B, [0; 5], cont);
        });
    }

    fn gen_monitor_exit(cg: &mut CodeGen<Self>, obj: RegStorage) {
        use crate::backend::layout::{
            Trampoline, LOCK_WORD_READ_BARRIER_MASK, OBJECT_LOCK_WORD_OFFSET, THREAD_ID_OFFSET,
        };
        let slow = cg.new_label();
        let cont = cg.new_label();
        let tmp = cg.reg_pool.alloc_temp();
        let tid = cg.reg_pool.alloc_temp();
        if !tmp.is_valid() || !tid.is_valid() {
            cg.call_runtime_helper(
                Trampoline::UnlockObject,
                &[crate::backend::HelperArg::Reg(obj)],
                true,
            );
            return;
        }
        let self_reg = cg.special_reg(SpecialTargetRegister::SelfThread);
        Self::load_base_disp(cg, obj, OBJECT_LOCK_WORD_OFFSET, tmp, OpSize::Word);
        Self::load_base_disp(cg, self_reg, THREAD_ID_OFFSET, tid, OpSize::Word);
        Self::op_reg_reg_imm(cg, AluOp::And, tmp, tmp, !LOCK_WORD_READ_BARRIER_MASK, false);
        Self::op_cmp_branch(cg, crate::backend::Cond::Ne, tmp, tid, slow);
        Self::push(cg, A64Op::Dmb, [3, 0, 0, 0, 0]);
        Self::load_base_disp(cg, obj, OBJECT_LOCK_WORD_OFFSET, tmp, OpSize::Word);
        Self::op_reg_reg_imm(cg, AluOp::And, tmp, tmp, LOCK_WORD_READ_BARRIER_MASK, false);
        Self::store_base_disp(cg, obj, OBJECT_LOCK_WORD_OFFSET, tmp, OpSize::Word);
        cg.place_label(cont);
        cg.reg_pool.free_temp(tmp);
        cg.reg_pool.free_temp(tid);
        cg.queue_slow_path(move |cg| {
            cg.place_label(slow);
            cg.call_runtime_helper(
                Trampoline::UnlockObject,
                &[crate::backend::HelperArg::Reg(obj)],
                true,
            );
            Self::push_branch(cg, A64Op::B, [0; 5], cont);
        });
    }

    fn inst_size(lir: &Lir<A64Op>) -> u32 {
        emit::inst_size(lir)
    }

    fn encode(
        lir: &Lir<A64Op>,
        env: &AsmEnv<'_, A64Op>,
        buf: &mut Vec<u8>,
    ) -> Result<(), WidenRequest> {
        emit::encode(lir, env, buf)
    }
}
