//! The x86 and x86-64 backends, one implementation parameterized by
//! operand width.

use crate::backend::assemble::{AsmEnv, WidenRequest};
use crate::backend::lir::{FixupKind, Lir, LirId, LirOp};
use crate::backend::regalloc::RegPoolTemplate;
use crate::backend::regs::RegStorage;
use crate::backend::{
    AluOp, CodeGen, Cond, ConvKind, FpOp, HelperArg, LiteralPool, MemBarrierKind, OpSize,
    SpecialTargetRegister, TableRef, Target,
};
use crate::backend::layout::Trampoline;
use crate::options::{InstructionSet, InstructionSetFeatures};

pub mod emit;
pub mod regs;

use regs::{gpr32, gpr64, xmm32, xmm64, RAX, RBX, RCX, RDI, RDX, RSI, RSP};

/// x86 family opcodes. Two-address forms are wrapped into three-address
/// macro LIRs; the encoder inserts the moves.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum X86Op {
    MovRI,
    MovRI64,
    Load,
    Store,
    LoadIndexed,
    StoreIndexed,
    Mov,
    AluRRR,
    AluRRI,
    FpRRR,
    FpNeg,
    Ucomi,
    CmpRR,
    Conv,
    CmpBr,
    CmpImmBr,
    Jcc,
    Jmp,
    CallReg,
    CallRel,
    JmpReg,
    Ret,
    LoadPool,
    /// Materialize the table displacement reference: `lea` of the table
    /// itself (RIP-relative, 64-bit) or the call/pop idiom adjusted back
    /// to the anchor's own address (32-bit).
    TableAnchor,
    /// `rd = rs + (table offset − anchor reference)` via `lea`.
    TableDelta,
    Mfence,
    SpAdjust,
    Spill,
    Unspill,
    Probe,
}

pub struct X86Target<const X64: bool> {
    #[allow(dead_code)]
    features: InstructionSetFeatures,
}

/// The 32-bit backend.
pub type X86_32Target = X86Target<false>;
/// The 64-bit backend.
pub type X86_64Target = X86Target<true>;

fn op_lir(op: X86Op, operands: [i32; 5]) -> Lir<X86Op> {
    let mut lir = Lir::new(LirOp::Target(op), 0);
    lir.operands = operands;
    lir
}

fn rbits(reg: RegStorage) -> i32 {
    i32::from(reg.bits())
}

impl<const X64: bool> X86Target<X64> {
    fn push(cg: &mut CodeGen<Self>, op: X86Op, operands: [i32; 5]) -> LirId {
        cg.append(op_lir(op, operands))
    }

    fn push_branch(
        cg: &mut CodeGen<Self>,
        op: X86Op,
        operands: [i32; 5],
        target: LirId,
    ) -> LirId {
        let mut lir = op_lir(op, operands);
        lir.target = Some(target);
        lir.flags.fixup = FixupKind::Branch;
        cg.append(lir)
    }

    /// Raw-condition jump; `cc` is the x86 condition nibble.
    fn jcc(cg: &mut CodeGen<Self>, cc: u8, target: LirId) -> LirId {
        Self::push_branch(cg, X86Op::Jcc, [i32::from(cc), 0, 0, 0, 0], target)
    }

    fn cmp_rr(cg: &mut CodeGen<Self>, a: RegStorage, b: RegStorage) {
        Self::push(cg, X86Op::CmpRR, [rbits(a), rbits(b), 0, 0, 0]);
    }

    fn mov_ri(cg: &mut CodeGen<Self>, dest: RegStorage, value: i32) {
        Self::push(cg, X86Op::MovRI, [rbits(dest), value, 0, 0, 0]);
    }

    /// Spill slots sit just below the return-address slot at the frame
    /// top.
    fn spill_slots(cg: &CodeGen<Self>) -> Vec<(RegStorage, i32)> {
        let ptr = Self::ISA.pointer_size() as i32;
        let mut slots = Vec::new();
        let mut offset = cg.frame_size as i32 - ptr;
        for num in 0..16u8 {
            if cg.core_spill_mask & (1 << num) != 0 {
                offset -= ptr;
                slots.push((if X64 { gpr64(num) } else { gpr32(num) }, offset));
            }
        }
        for num in 0..16u8 {
            if cg.fp_spill_mask & (1 << num) != 0 {
                offset -= 8;
                slots.push((xmm64(num), offset));
            }
        }
        slots
    }
}

impl<const X64: bool> Target for X86Target<X64> {
    type Op = X86Op;
    const ISA: InstructionSet =
        if X64 { InstructionSet::X86_64 } else { InstructionSet::X86 };

    fn new(features: InstructionSetFeatures) -> Self {
        Self { features }
    }

    fn reg_pool_template(&self) -> RegPoolTemplate {
        regs::pool_template(X64)
    }

    fn special_reg(&self, reg: SpecialTargetRegister) -> RegStorage {
        use SpecialTargetRegister::*;
        let gpr = |num: u8| if X64 { gpr64(num) } else { gpr32(num) };
        match reg {
            SelfThread => gpr(if X64 { 15 } else { RSI }),
            Sp => gpr(RSP),
            Arg0 => gpr32(if X64 { RDI } else { RAX }),
            Arg1 => gpr32(if X64 { RSI } else { RCX }),
            Arg2 => gpr32(RDX),
            Arg3 => gpr32(if X64 { RCX } else { RBX }),
            FArg0 => xmm32(0),
            FArg1 => xmm32(1),
            FArg2 => xmm32(2),
            FArg3 => xmm32(3),
            Ret0 => gpr32(RAX),
            Ret1 => gpr32(RDX),
            InvokeTgt => {
                if X64 {
                    gpr64(11)
                } else {
                    // ebp is the 32-bit encoder scratch *and* the invoke
                    // target: the dispatch machine writes it last.
                    gpr32(5)
                }
            }
            HiddenArg => {
                if X64 {
                    gpr32(RAX)
                } else {
                    xmm32(7)
                }
            }
        }
    }

    fn arg_reg(&self, index: usize, fp: bool, wide: bool) -> Option<RegStorage> {
        let reg = regs::arg_reg(X64, index, fp, wide)?;
        if wide && !X64 {
            // Wide values arrive as two consecutive word slots; the pair
            // is assembled from this slot and the next register when one
            // exists, else the value is split register/stack and handled
            // as memory by the caller.
            let next = regs::arg_reg(X64, index + 1, fp, false)?;
            return Some(RegStorage::pair(reg, next));
        }
        Some(reg)
    }

    fn return_reg(&self, fp: bool, wide: bool) -> RegStorage {
        match (fp, wide) {
            (true, true) => xmm64(0),
            (true, false) => xmm32(0),
            (false, true) => {
                if X64 {
                    gpr64(RAX)
                } else {
                    RegStorage::pair(gpr32(RAX), gpr32(RDX))
                }
            }
            (false, false) => gpr32(RAX),
        }
    }

    fn dwarf_reg(&self, reg: RegStorage) -> u16 {
        regs::dwarf_reg(X64, reg)
    }

    fn dwarf_return_address_reg(&self) -> u16 {
        if X64 { 16 } else { 8 }
    }

    fn dwarf_stack_pointer_reg(&self) -> u16 {
        if X64 { 7 } else { 4 }
    }

    fn load_constant(cg: &mut CodeGen<Self>, dest: RegStorage, value: i32) {
        Self::push(cg, X86Op::MovRI, [rbits(dest), value, 0, 0, 0]);
    }

    fn load_constant_wide(cg: &mut CodeGen<Self>, dest: RegStorage, value: i64) {
        Self::push(
            cg,
            X86Op::MovRI64,
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
        Self::push(cg, X86Op::Load, [rbits(dest), rbits(base), disp, emit::size_tag(size), 0]);
    }

    fn store_base_disp(
        cg: &mut CodeGen<Self>,
        base: RegStorage,
        disp: i32,
        src: RegStorage,
        size: OpSize,
    ) {
        Self::push(cg, X86Op::Store, [rbits(src), rbits(base), disp, emit::size_tag(size), 0]);
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
            X86Op::LoadIndexed,
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
            X86Op::StoreIndexed,
            [rbits(src), rbits(base), rbits(index), i32::from(scale), emit::size_tag(size)],
        );
    }

    fn op_move(cg: &mut CodeGen<Self>, dest: RegStorage, src: RegStorage) {
        Self::push(cg, X86Op::Mov, [rbits(dest), rbits(src), 0, 0, 0]);
    }

    fn op_reg_reg_reg(
        cg: &mut CodeGen<Self>,
        op: AluOp,
        dest: RegStorage,
        src1: RegStorage,
        src2: RegStorage,
        wide: bool,
    ) {
        let widen = |r: RegStorage| {
            if wide && X64 && !r.is_pair() {
                RegStorage::solo64(r.reg_num())
            } else {
                r
            }
        };
        Self::push(
            cg,
            X86Op::AluRRR,
            [emit::alu_tag(op), rbits(widen(dest)), rbits(widen(src1)), rbits(widen(src2)), 0],
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
        let widen = |r: RegStorage| {
            if wide && X64 && !r.is_pair() {
                RegStorage::solo64(r.reg_num())
            } else {
                r
            }
        };
        Self::push(
            cg,
            X86Op::AluRRI,
            [emit::alu_tag(op), rbits(widen(dest)), rbits(widen(src)), value, 0],
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
        Self::push(cg, X86Op::FpRRR, [op as i32, rbits(dest), rbits(src1), rbits(src2), 0]);
    }

    fn op_fp_neg(cg: &mut CodeGen<Self>, dest: RegStorage, src: RegStorage, double: bool) {
        Self::push(cg, X86Op::FpNeg, [rbits(dest), rbits(src), i32::from(double), 0, 0]);
    }

    fn op_fp_cmp(
        cg: &mut CodeGen<Self>,
        dest: RegStorage,
        src1: RegStorage,
        src2: RegStorage,
        double: bool,
        gt_bias: bool,
    ) {
        // ucomis sets CF/ZF/PF; materialize -1/0/1 with short branches.
        // An unordered result sets all three flags, so the NaN-biased
        // outcome must be tested before ZF.
        let done = cg.new_label();
        let equal = cg.new_label();
        Self::push(cg, X86Op::Ucomi, [rbits(src1), rbits(src2), i32::from(double), 0, 0]);
        if gt_bias {
            Self::mov_ri(cg, dest, 1);
            Self::jcc(cg, 0x7, done); // ja: above
            Self::jcc(cg, 0xa, done); // jp: unordered compares greater
            Self::jcc(cg, 0x4, equal); // je
            Self::mov_ri(cg, dest, -1);
        } else {
            Self::mov_ri(cg, dest, -1);
            Self::jcc(cg, 0x2, done); // jb: below or unordered
            Self::jcc(cg, 0x4, equal); // je
            Self::mov_ri(cg, dest, 1);
        }
        Self::push_branch(cg, X86Op::Jmp, [0; 5], done);
        cg.place_label(equal);
        Self::mov_ri(cg, dest, 0);
        cg.place_label(done);
    }

    fn op_cmp_long(
        cg: &mut CodeGen<Self>,
        dest: RegStorage,
        src1: RegStorage,
        src2: RegStorage,
    ) {
        let done = cg.new_label();
        let neg = cg.new_label();
        let pos = cg.new_label();
        if X64 {
            Self::cmp_rr(
                cg,
                RegStorage::solo64(src1.reg_num()),
                RegStorage::solo64(src2.reg_num()),
            );
            Self::jcc(cg, 0xc, neg); // jl
            Self::jcc(cg, 0xf, pos); // jg
        } else {
            Self::cmp_rr(cg, src1.high(), src2.high());
            Self::jcc(cg, 0xc, neg);
            Self::jcc(cg, 0xf, pos);
            Self::cmp_rr(cg, src1.low(), src2.low());
            Self::jcc(cg, 0x2, neg); // jb: low half compares unsigned
            Self::jcc(cg, 0x7, pos); // ja
        }
        Self::mov_ri(cg, dest, 0);
        Self::push_branch(cg, X86Op::Jmp, [0; 5], done);
        cg.place_label(neg);
        Self::mov_ri(cg, dest, -1);
        Self::push_branch(cg, X86Op::Jmp, [0; 5], done);
        cg.place_label(pos);
        Self::mov_ri(cg, dest, 1);
        cg.place_label(done);
    }

    fn op_conversion(cg: &mut CodeGen<Self>, kind: ConvKind, dest: RegStorage, src: RegStorage) {
        if !X64 {
            // Conversions touching 64-bit integers go through the runtime
            // on register-pair targets.
            let trampoline = match kind {
                ConvKind::F2L => Some(Trampoline::F2l),
                ConvKind::D2L => Some(Trampoline::D2l),
                ConvKind::L2F => Some(Trampoline::L2f),
                ConvKind::L2D => Some(Trampoline::L2d),
                _ => None,
            };
            if let Some(trampoline) = trampoline {
                cg.call_runtime_helper(trampoline, &[HelperArg::Reg(src)], false);
                let ret = match kind {
                    ConvKind::F2L | ConvKind::D2L => cg.target.return_reg(false, true),
                    ConvKind::L2F => cg.target.return_reg(true, false),
                    _ => cg.target.return_reg(true, true),
                };
                Self::op_move(cg, dest, ret);
                return;
            }
        }
        Self::push(cg, X86Op::Conv, [emit::conv_tag(kind), rbits(dest), rbits(src), 0, 0]);
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
            X86Op::CmpBr,
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
            X86Op::CmpImmBr,
            [emit::cond_tag(cond), rbits(reg), value, 0, 0],
            target,
        )
    }

    fn op_unconditional_branch(cg: &mut CodeGen<Self>, target: LirId) -> LirId {
        Self::push_branch(cg, X86Op::Jmp, [0; 5], target)
    }

    fn op_call_reg(cg: &mut CodeGen<Self>, reg: RegStorage) -> LirId {
        Self::push(cg, X86Op::CallReg, [rbits(reg), 0, 0, 0, 0])
    }

    fn op_call_direct(cg: &mut CodeGen<Self>) -> LirId {
        Self::push(cg, X86Op::CallRel, [0; 5])
    }

    fn op_load_pool_entry(
        cg: &mut CodeGen<Self>,
        pool: LiteralPool,
        index: usize,
        dest: RegStorage,
    ) -> LirId {
        let mut lir = op_lir(X86Op::LoadPool, [rbits(dest), pool as i32, index as i32, 0, 0]);
        lir.flags.fixup = FixupKind::Load;
        cg.append(lir)
    }

    fn op_load_table_anchor(
        cg: &mut CodeGen<Self>,
        table: TableRef,
        dest: RegStorage,
    ) -> LirId {
        let (kind, index) = match table {
            TableRef::Switch(index) => (0, index),
            TableRef::FillArray(index) => (1, index),
        };
        let mut lir = op_lir(X86Op::TableAnchor, [rbits(dest), kind, index as i32, 0, 0]);
        lir.flags.fixup = FixupKind::SwitchTable;
        cg.append(lir)
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
            op_lir(X86Op::TableDelta, [rbits(dest), rbits(src), kind, index as i32, 0]);
        lir.target = Some(anchor);
        lir.flags.fixup = FixupKind::SwitchTable;
        cg.append(lir);
    }

    fn op_branch_reg(cg: &mut CodeGen<Self>, reg: RegStorage) {
        Self::push(cg, X86Op::JmpReg, [rbits(reg), 0, 0, 0, 0]);
    }

    fn gen_entry_sequence(cg: &mut CodeGen<Self>) {
        let ptr = Self::ISA.pointer_size() as i32;
        // The call pushed the return address; the CFA starts one slot up.
        cg.cfi.def_cfa_offset(cg.last_lir, ptr);
        if cg.frame_size == 0 {
            return;
        }
        if !cg.cu.options.implicit_stack_overflow_checks && !cg.graph.is_leaf {
            Self::push(
                cg,
                X86Op::Probe,
                [crate::backend::layout::STACK_OVERFLOW_RESERVED_BYTES, 0, 0, 0, 0],
            );
        }
        let adjust = cg.frame_size as i32 - ptr;
        let sp = Self::push(cg, X86Op::SpAdjust, [-adjust, 0, 0, 0, 0]);
        cg.cfi.def_cfa_offset(Some(sp), cg.frame_size as i32);
        for (reg, offset) in Self::spill_slots(cg) {
            let spill = Self::push(cg, X86Op::Spill, [rbits(reg), offset, 0, 0, 0]);
            let dwarf = regs::dwarf_reg(X64, reg);
            cg.cfi.rel_offset(Some(spill), dwarf, cg.frame_size as i32 - offset);
        }
        // Home the ArtMethod* at the base of the frame.
        let method = cg.target.special_reg(SpecialTargetRegister::Arg0);
        Self::push(
            cg,
            X86Op::Store,
            [rbits(method), rbits(gpr64(RSP)), 0, emit::size_tag(OpSize::Ref), 0],
        );
    }

    fn gen_exit_sequence(cg: &mut CodeGen<Self>) {
        let ptr = Self::ISA.pointer_size() as i32;
        if cg.frame_size != 0 {
            cg.cfi.remember_state(cg.last_lir);
            for (reg, offset) in Self::spill_slots(cg) {
                let unspill = Self::push(cg, X86Op::Unspill, [rbits(reg), offset, 0, 0, 0]);
                cg.cfi.restore(Some(unspill), regs::dwarf_reg(X64, reg));
            }
            let adjust = cg.frame_size as i32 - ptr;
            let sp = Self::push(cg, X86Op::SpAdjust, [adjust, 0, 0, 0, 0]);
            cg.cfi.def_cfa_offset(Some(sp), ptr);
        }
        let ret = Self::push(cg, X86Op::Ret, [0; 5]);
        if cg.frame_size != 0 {
            cg.cfi.restore_state(Some(ret));
            cg.cfi.def_cfa_offset(Some(ret), cg.frame_size as i32);
        }
    }

    fn gen_memory_barrier(cg: &mut CodeGen<Self>, kind: MemBarrierKind) {
        // x86 only reorders stores after loads; a full fence covers the
        // AnyAny case and the rest are compiler barriers.
        if kind == MemBarrierKind::AnyAny {
            Self::push(cg, X86Op::Mfence, [0; 5]);
        }
    }

    fn inst_size(lir: &Lir<X86Op>) -> u32 {
        emit::inst_size_impl(X64, lir)
    }

    fn encode(
        lir: &Lir<X86Op>,
        env: &AsmEnv<'_, X86Op>,
        buf: &mut Vec<u8>,
    ) -> Result<(), WidenRequest> {
        emit::encode_impl(X64, lir, env, buf)
    }
}
