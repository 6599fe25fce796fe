//! The MIPS32 backend. Most optimization passes are disabled for this
//! target (see the per-ISA masks); the lowering favors plainness over
//! cleverness accordingly.

use crate::backend::assemble::{AsmEnv, WidenRequest};
use crate::backend::layout::{self, Trampoline};
use crate::backend::lir::{FixupKind, Lir, LirId, LirOp};
use crate::backend::regalloc::RegPoolTemplate;
use crate::backend::regs::RegStorage;
use crate::backend::{
    AluOp, CodeGen, Cond, ConvKind, FpOp, HelperArg, LiteralPool, MemBarrierKind, OpSize,
    SpecialTargetRegister, TableRef, Target,
};
use crate::options::{InstructionSet, InstructionSetFeatures};

pub mod emit;
pub mod regs;

use regs::{freg, rreg, RA, SELF_REG, SP, T9, V0, V1};

pub(crate) const STACK_PROBE_BYTES: i32 = layout::STACK_OVERFLOW_RESERVED_BYTES;

/// MIPS32 target opcodes. Branch macros include their delay-slot `nop`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MipsOp {
    LoadConst,
    Load,
    Store,
    LoadIndexed,
    StoreIndexed,
    Mov,
    FpMov,
    Mtc1,
    Mfc1,
    AluRRR,
    AluRRI,
    FpRRR,
    FpNeg,
    FpCmpBr,
    /// `sltu at, a, b`: the carry/borrow feeding wide add and subtract.
    Sltu,
    Conv,
    CmpBr,
    CmpImmBr,
    B,
    Jalr,
    Jr,
    Bal,
    LoadPool,
    /// `bal +0 ; nop ; addiu rd, ra, -8`: the anchor's own address, the
    /// table displacement reference point.
    TableAnchor,
    /// `rd = rs + (table offset − anchor offset)` via lui/ori/addu.
    TableDelta,
    Sync,
    SpAdjust,
    Spill,
    Unspill,
    Probe,
}

pub struct MipsTarget {
    #[allow(dead_code)]
    features: InstructionSetFeatures,
}

fn op_lir(op: MipsOp, operands: [i32; 5]) -> Lir<MipsOp> {
    let mut lir = Lir::new(LirOp::Target(op), 0);
    lir.operands = operands;
    lir
}

fn rbits(reg: RegStorage) -> i32 {
    i32::from(reg.bits())
}

/// A double register handle for an aligned single pair.
fn dreg_of(reg: RegStorage) -> RegStorage {
    if reg.is_pair() {
        freg(reg.low().reg_num())
    } else {
        reg
    }
}

impl MipsTarget {
    fn push(cg: &mut CodeGen<Self>, op: MipsOp, operands: [i32; 5]) -> LirId {
        cg.append(op_lir(op, operands))
    }

    fn push_branch(
        cg: &mut CodeGen<Self>,
        op: MipsOp,
        operands: [i32; 5],
        target: LirId,
    ) -> LirId {
        let mut lir = op_lir(op, operands);
        lir.target = Some(target);
        lir.flags.fixup = FixupKind::Branch;
        cg.append(lir)
    }

    fn spill_slots(cg: &CodeGen<Self>) -> Vec<(RegStorage, i32)> {
        let mut slots = Vec::new();
        let mut offset = cg.frame_size as i32;
        for num in (0..32u8).rev() {
            if cg.core_spill_mask & (1 << num) != 0 {
                offset -= 4;
                slots.push((rreg(num), offset));
            }
        }
        for num in (0..32u8).rev() {
            if cg.fp_spill_mask & (1 << num) != 0 {
                offset -= 4;
                slots.push((freg(num), offset));
            }
        }
        slots
    }

    /// Preassembled COP1 word for a conversion.
    fn cop1_word(kind: ConvKind, fd: u8, fs: u8) -> u32 {
        let (fmt, funct) = match kind {
            ConvKind::I2F => (0x14, 0x20),  // cvt.s.w
            ConvKind::I2D => (0x14, 0x21),  // cvt.d.w
            ConvKind::F2I => (0x10, 0x0d),  // trunc.w.s
            ConvKind::D2I => (0x11, 0x0d),  // trunc.w.d
            ConvKind::F2D => (0x10, 0x21),  // cvt.d.s
            ConvKind::D2F => (0x11, 0x20),  // cvt.s.d
            _ => unreachable!("integer and long conversions bypass COP1"),
        };
        (0x11 << 26) | (fmt << 21) | (u32::from(fs) << 11) | (u32::from(fd) << 6) | funct
    }
}

impl Target for MipsTarget {
    type Op = MipsOp;
    const ISA: InstructionSet = InstructionSet::Mips;

    fn new(features: InstructionSetFeatures) -> Self {
        Self { features }
    }

    fn reg_pool_template(&self) -> RegPoolTemplate {
        regs::pool_template()
    }

    fn special_reg(&self, reg: SpecialTargetRegister) -> RegStorage {
        use SpecialTargetRegister::*;
        match reg {
            SelfThread => rreg(SELF_REG),
            Sp => rreg(SP),
            Arg0 => rreg(4),
            Arg1 => rreg(5),
            Arg2 => rreg(6),
            Arg3 => rreg(7),
            FArg0 => freg(12),
            FArg1 => freg(13),
            FArg2 => freg(14),
            FArg3 => freg(15),
            Ret0 => rreg(V0),
            Ret1 => rreg(V1),
            InvokeTgt => rreg(T9),
            HiddenArg => rreg(8),
        }
    }

    fn arg_reg(&self, index: usize, fp: bool, wide: bool) -> Option<RegStorage> {
        regs::arg_reg(index, fp, wide)
    }

    fn return_reg(&self, fp: bool, wide: bool) -> RegStorage {
        match (fp, wide) {
            (true, true) => RegStorage::pair(freg(0), freg(1)),
            (true, false) => freg(0),
            (false, true) => RegStorage::pair(rreg(V0), rreg(V1)),
            (false, false) => rreg(V0),
        }
    }

    fn supports_hw_div(&self) -> bool {
        true
    }

    fn return_address_spill_mask(&self) -> u32 {
        1 << RA
    }

    fn dwarf_reg(&self, reg: RegStorage) -> u16 {
        regs::dwarf_reg(reg)
    }

    fn dwarf_return_address_reg(&self) -> u16 {
        u16::from(RA)
    }

    fn dwarf_stack_pointer_reg(&self) -> u16 {
        u16::from(SP)
    }

    fn load_constant(cg: &mut CodeGen<Self>, dest: RegStorage, value: i32) {
        if dest.is_float() {
            Self::push(cg, MipsOp::LoadConst, [rbits(rreg(regs::AT)), value, 0, 0, 0]);
            Self::push(cg, MipsOp::Mtc1, [rbits(dest), rbits(rreg(regs::AT)), 0, 0, 0]);
        } else {
            Self::push(cg, MipsOp::LoadConst, [rbits(dest), value, 0, 0, 0]);
        }
    }

    fn load_constant_wide(cg: &mut CodeGen<Self>, dest: RegStorage, value: i64) {
        Self::load_constant(cg, dest.low(), value as i32);
        Self::load_constant(cg, dest.high(), (value >> 32) as i32);
    }

    fn load_base_disp(
        cg: &mut CodeGen<Self>,
        base: RegStorage,
        disp: i32,
        dest: RegStorage,
        size: OpSize,
    ) {
        match size {
            OpSize::Wide | OpSize::Double if dest.is_pair() => {
                let half = if size == OpSize::Double { OpSize::Single } else { OpSize::Word };
                Self::push(
                    cg,
                    MipsOp::Load,
                    [rbits(dest.low()), rbits(base), disp, emit::size_tag(half), 0],
                );
                Self::push(
                    cg,
                    MipsOp::Load,
                    [rbits(dest.high()), rbits(base), disp + 4, emit::size_tag(half), 0],
                );
            }
            _ => {
                let tag = if size == OpSize::Ref { OpSize::Word } else { size };
                Self::push(
                    cg,
                    MipsOp::Load,
                    [rbits(dest), rbits(base), disp, emit::size_tag(tag), 0],
                );
            }
        }
    }

    fn store_base_disp(
        cg: &mut CodeGen<Self>,
        base: RegStorage,
        disp: i32,
        src: RegStorage,
        size: OpSize,
    ) {
        match size {
            OpSize::Wide | OpSize::Double if src.is_pair() => {
                let half = if size == OpSize::Double { OpSize::Single } else { OpSize::Word };
                Self::push(
                    cg,
                    MipsOp::Store,
                    [rbits(src.low()), rbits(base), disp, emit::size_tag(half), 0],
                );
                Self::push(
                    cg,
                    MipsOp::Store,
                    [rbits(src.high()), rbits(base), disp + 4, emit::size_tag(half), 0],
                );
            }
            _ => {
                let tag = if size == OpSize::Ref { OpSize::Word } else { size };
                Self::push(
                    cg,
                    MipsOp::Store,
                    [rbits(src), rbits(base), disp, emit::size_tag(tag), 0],
                );
            }
        }
    }

    fn load_base_indexed(
        cg: &mut CodeGen<Self>,
        base: RegStorage,
        index: RegStorage,
        dest: RegStorage,
        scale: u8,
        size: OpSize,
    ) {
        if size == OpSize::Wide && dest.is_pair() {
            // addr = base + (index << scale), then a pair load.
            let tmp = cg.reg_pool.alloc_temp();
            if !tmp.is_valid() {
                cg.punt_to_interpreter = true;
                return;
            }
            Self::op_reg_reg_imm(cg, AluOp::Shl, tmp, index, i32::from(scale), false);
            Self::op_reg_reg_reg(cg, AluOp::Add, tmp, base, tmp, false);
            Self::load_base_disp(cg, tmp, 0, dest, OpSize::Wide);
            cg.reg_pool.free_temp(tmp);
            return;
        }
        let tag = if size == OpSize::Ref { OpSize::Word } else { size };
        Self::push(
            cg,
            MipsOp::LoadIndexed,
            [rbits(dest), rbits(base), rbits(index), i32::from(scale), emit::size_tag(tag)],
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
        if size == OpSize::Wide && src.is_pair() {
            let tmp = cg.reg_pool.alloc_temp();
            if !tmp.is_valid() {
                cg.punt_to_interpreter = true;
                return;
            }
            Self::op_reg_reg_imm(cg, AluOp::Shl, tmp, index, i32::from(scale), false);
            Self::op_reg_reg_reg(cg, AluOp::Add, tmp, base, tmp, false);
            Self::store_base_disp(cg, tmp, 0, src, OpSize::Wide);
            cg.reg_pool.free_temp(tmp);
            return;
        }
        let tag = if size == OpSize::Ref { OpSize::Word } else { size };
        Self::push(
            cg,
            MipsOp::StoreIndexed,
            [rbits(src), rbits(base), rbits(index), i32::from(scale), emit::size_tag(tag)],
        );
    }

    fn op_move(cg: &mut CodeGen<Self>, dest: RegStorage, src: RegStorage) {
        match (dest.is_pair(), src.is_pair()) {
            (true, true) => {
                Self::op_move(cg, dest.low(), src.low());
                Self::op_move(cg, dest.high(), src.high());
            }
            _ => match (dest.is_float(), src.is_float()) {
                (false, false) => {
                    Self::push(cg, MipsOp::Mov, [rbits(dest), rbits(src), 0, 0, 0]);
                }
                (true, true) => {
                    Self::push(cg, MipsOp::FpMov, [rbits(dest), rbits(src), 0, 0, 0]);
                }
                (true, false) => {
                    Self::push(cg, MipsOp::Mtc1, [rbits(dest), rbits(src), 0, 0, 0]);
                }
                (false, true) => {
                    Self::push(cg, MipsOp::Mfc1, [rbits(dest), rbits(src), 0, 0, 0]);
                }
            },
        }
    }

    fn op_reg_reg_reg(
        cg: &mut CodeGen<Self>,
        op: AluOp,
        dest: RegStorage,
        src1: RegStorage,
        src2: RegStorage,
        wide: bool,
    ) {
        if wide && dest.is_pair() {
            match op {
                AluOp::Add => {
                    // Low halves add; carry = (sum < a) unsigned.
                    Self::push(
                        cg,
                        MipsOp::AluRRR,
                        [
                            emit::alu_tag(AluOp::Add),
                            rbits(dest.low()),
                            rbits(src1.low()),
                            rbits(src2.low()),
                            0,
                        ],
                    );
                    // sltu at, dest.lo, src1.lo
                    Self::push(
                        cg,
                        MipsOp::Sltu,
                        [rbits(dest.low()), rbits(src1.low()), 0, 0, 0],
                    );
                    Self::push(
                        cg,
                        MipsOp::AluRRR,
                        [
                            emit::alu_tag(AluOp::Adc),
                            rbits(dest.high()),
                            rbits(src1.high()),
                            rbits(src2.high()),
                            0,
                        ],
                    );
                }
                AluOp::Sub => {
                    Self::push(
                        cg,
                        MipsOp::Sltu,
                        [rbits(src1.low()), rbits(src2.low()), 0, 0, 0],
                    );
                    Self::push(
                        cg,
                        MipsOp::AluRRR,
                        [
                            emit::alu_tag(AluOp::Sub),
                            rbits(dest.low()),
                            rbits(src1.low()),
                            rbits(src2.low()),
                            0,
                        ],
                    );
                    Self::push(
                        cg,
                        MipsOp::AluRRR,
                        [
                            emit::alu_tag(AluOp::Sbc),
                            rbits(dest.high()),
                            rbits(src1.high()),
                            rbits(src2.high()),
                            0,
                        ],
                    );
                }
                AluOp::And | AluOp::Or | AluOp::Xor => {
                    Self::op_reg_reg_reg(cg, op, dest.low(), src1.low(), src2.low(), false);
                    Self::op_reg_reg_reg(cg, op, dest.high(), src1.high(), src2.high(), false);
                }
                AluOp::Not => {
                    Self::op_reg_reg_reg(cg, op, dest.low(), src1.low(), src1.low(), false);
                    Self::op_reg_reg_reg(cg, op, dest.high(), src1.high(), src1.high(), false);
                }
                AluOp::Neg => {
                    // 0 - value through the carry helpers.
                    let zero_pair = RegStorage::pair(rreg(regs::ZERO), rreg(regs::ZERO));
                    Self::op_reg_reg_reg(cg, AluOp::Sub, dest, zero_pair, src1, true);
                }
                _ => unreachable!("wide {op:?} reached the mips backend"),
            }
            return;
        }
        Self::push(
            cg,
            MipsOp::AluRRR,
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
        if wide && dest.is_pair() {
            match op {
                AluOp::Neg | AluOp::Not => Self::op_reg_reg_reg(cg, op, dest, src, src, true),
                _ => {
                    Self::op_reg_reg_imm(cg, op, dest.low(), src.low(), value, false);
                }
            }
            return;
        }
        Self::push(
            cg,
            MipsOp::AluRRI,
            [emit::alu_tag(op), rbits(dest), rbits(src), value, 0],
        );
    }

    fn op_fp_rrr(
        cg: &mut CodeGen<Self>,
        op: FpOp,
        dest: RegStorage,
        src1: RegStorage,
        src2: RegStorage,
        double: bool,
    ) {
        Self::push(
            cg,
            MipsOp::FpRRR,
            [
                op as i32,
                rbits(dreg_of(dest)),
                rbits(dreg_of(src1)),
                rbits(dreg_of(src2)),
                i32::from(double),
            ],
        );
    }

    fn op_fp_neg(cg: &mut CodeGen<Self>, dest: RegStorage, src: RegStorage, double: bool) {
        Self::push(
            cg,
            MipsOp::FpNeg,
            [rbits(dreg_of(dest)), rbits(dreg_of(src)), i32::from(double), 0, 0],
        );
    }

    fn op_fp_cmp(
        cg: &mut CodeGen<Self>,
        dest: RegStorage,
        src1: RegStorage,
        src2: RegStorage,
        double: bool,
        gt_bias: bool,
    ) {
        // c.olt / c.ult / c.eq with bc1t trees. The unordered variants
        // fold the NaN bias into the right branch.
        let done = cg.new_label();
        let less = cg.new_label();
        let (a, b) = (dreg_of(src1), dreg_of(src2));
        // less when a < b, unordered counting per bias.
        let lt_cond = if gt_bias { 0x04 } else { 0x05 }; // c.olt / c.ult
        let mut lir = op_lir(
            MipsOp::FpCmpBr,
            [lt_cond, rbits(a), rbits(b), i32::from(double), 1],
        );
        lir.target = Some(less);
        lir.flags.fixup = FixupKind::Branch;
        cg.append(lir);
        // Delay slot: harmless move.
        Self::push(cg, MipsOp::Mov, [rbits(dest), rbits(rreg(regs::ZERO)), 0, 0, 0]);
        // Equal (ordered) leaves zero; c.eq is false on NaN.
        let eq = cg.new_label();
        let mut lir = op_lir(MipsOp::FpCmpBr, [0x02, rbits(a), rbits(b), i32::from(double), 1]);
        lir.target = Some(eq);
        lir.flags.fixup = FixupKind::Branch;
        cg.append(lir);
        Self::push(cg, MipsOp::Mov, [rbits(dest), rbits(rreg(regs::ZERO)), 0, 0, 0]);
        Self::load_constant(cg, dest, 1);
        Self::push_branch(cg, MipsOp::B, [0; 5], done);
        cg.place_label(less);
        Self::load_constant(cg, dest, -1);
        Self::push_branch(cg, MipsOp::B, [0; 5], done);
        cg.place_label(eq);
        Self::load_constant(cg, dest, 0);
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
        Self::push_branch(
            cg,
            MipsOp::CmpBr,
            [emit::cond_tag(Cond::Lt), rbits(src1.high()), rbits(src2.high()), 0, 0],
            neg,
        );
        Self::push_branch(
            cg,
            MipsOp::CmpBr,
            [emit::cond_tag(Cond::Gt), rbits(src1.high()), rbits(src2.high()), 0, 0],
            pos,
        );
        Self::push_branch(
            cg,
            MipsOp::CmpBr,
            [emit::cond_tag(Cond::Ult), rbits(src1.low()), rbits(src2.low()), 0, 0],
            neg,
        );
        Self::push_branch(
            cg,
            MipsOp::CmpBr,
            [emit::cond_tag(Cond::Ne), rbits(src1.low()), rbits(src2.low()), 0, 0],
            pos,
        );
        Self::load_constant(cg, dest, 0);
        Self::push_branch(cg, MipsOp::B, [0; 5], done);
        cg.place_label(neg);
        Self::load_constant(cg, dest, -1);
        Self::push_branch(cg, MipsOp::B, [0; 5], done);
        cg.place_label(pos);
        Self::load_constant(cg, dest, 1);
        cg.place_label(done);
    }

    fn op_conversion(cg: &mut CodeGen<Self>, kind: ConvKind, dest: RegStorage, src: RegStorage) {
        match kind {
            ConvKind::I2B => {
                Self::op_reg_reg_imm(cg, AluOp::Shl, dest, src, 24, false);
                Self::op_reg_reg_imm(cg, AluOp::Shr, dest, dest, 24, false);
            }
            ConvKind::I2C => {
                Self::op_reg_reg_imm(cg, AluOp::Shl, dest, src, 16, false);
                Self::op_reg_reg_imm(cg, AluOp::Ushr, dest, dest, 16, false);
            }
            ConvKind::I2S => {
                Self::op_reg_reg_imm(cg, AluOp::Shl, dest, src, 16, false);
                Self::op_reg_reg_imm(cg, AluOp::Shr, dest, dest, 16, false);
            }
            ConvKind::I2L => {
                Self::op_move(cg, dest.low(), src);
                Self::op_move(cg, dest.high(), src);
                Self::op_reg_reg_imm(cg, AluOp::Shr, dest.high(), dest.high(), 31, false);
            }
            ConvKind::L2I => Self::op_move(cg, dest, src.low()),
            ConvKind::F2L | ConvKind::D2L | ConvKind::L2F | ConvKind::L2D => {
                let trampoline = match kind {
                    ConvKind::F2L => Trampoline::F2l,
                    ConvKind::D2L => Trampoline::D2l,
                    ConvKind::L2F => Trampoline::L2f,
                    _ => Trampoline::L2d,
                };
                cg.call_runtime_helper(trampoline, &[HelperArg::Reg(src)], false);
                let ret = match kind {
                    ConvKind::L2F => cg.target.return_reg(false, false),
                    _ => cg.target.return_reg(false, true),
                };
                Self::op_move(cg, dest, ret);
            }
            ConvKind::I2F | ConvKind::I2D => {
                // Move through COP1, then convert in place.
                let fp_src = if src.is_float() {
                    src
                } else {
                    let tmp = cg.reg_pool.alloc_temp_fp(false);
                    if !tmp.is_valid() {
                        cg.punt_to_interpreter = true;
                        return;
                    }
                    Self::push(cg, MipsOp::Mtc1, [rbits(tmp), rbits(src), 0, 0, 0]);
                    tmp
                };
                let word =
                    Self::cop1_word(kind, dreg_of(dest).reg_num(), fp_src.reg_num());
                Self::push(
                    cg,
                    MipsOp::Conv,
                    [emit::conv_tag(kind), 0, 0, word as i32, 0],
                );
            }
            ConvKind::F2I | ConvKind::D2I => {
                let fp_dest = if dest.is_float() {
                    dest
                } else {
                    let tmp = cg.reg_pool.alloc_temp_fp(false);
                    if !tmp.is_valid() {
                        cg.punt_to_interpreter = true;
                        return;
                    }
                    tmp
                };
                let word =
                    Self::cop1_word(kind, fp_dest.reg_num(), dreg_of(src).reg_num());
                Self::push(cg, MipsOp::Conv, [emit::conv_tag(kind), 0, 0, word as i32, 0]);
                if !dest.is_float() {
                    Self::push(cg, MipsOp::Mfc1, [rbits(dest), rbits(fp_dest), 0, 0, 0]);
                }
            }
            ConvKind::F2D | ConvKind::D2F => {
                let word =
                    Self::cop1_word(kind, dreg_of(dest).reg_num(), dreg_of(src).reg_num());
                Self::push(cg, MipsOp::Conv, [emit::conv_tag(kind), 0, 0, word as i32, 0]);
            }
        }
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
            MipsOp::CmpBr,
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
            MipsOp::CmpImmBr,
            [emit::cond_tag(cond), rbits(reg), value, 0, 0],
            target,
        )
    }

    fn op_unconditional_branch(cg: &mut CodeGen<Self>, target: LirId) -> LirId {
        Self::push_branch(cg, MipsOp::B, [0; 5], target)
    }

    fn op_call_reg(cg: &mut CodeGen<Self>, reg: RegStorage) -> LirId {
        // o32 expects the callee address in t9.
        if reg.reg_num() != T9 {
            Self::op_move(cg, rreg(T9), reg);
        }
        Self::push(cg, MipsOp::Jalr, [rbits(rreg(T9)), 0, 0, 0, 0])
    }

    fn op_call_direct(cg: &mut CodeGen<Self>) -> LirId {
        Self::push(cg, MipsOp::Bal, [0; 5])
    }

    fn op_load_pool_entry(
        cg: &mut CodeGen<Self>,
        pool: LiteralPool,
        index: usize,
        dest: RegStorage,
    ) -> LirId {
        let mut lir = op_lir(MipsOp::LoadPool, [rbits(dest), pool as i32, index as i32, 0, 0]);
        lir.flags.fixup = FixupKind::Load;
        cg.append(lir)
    }

    fn op_load_table_anchor(
        cg: &mut CodeGen<Self>,
        _table: TableRef,
        dest: RegStorage,
    ) -> LirId {
        Self::push(cg, MipsOp::TableAnchor, [rbits(dest), 0, 0, 0, 0])
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
            op_lir(MipsOp::TableDelta, [rbits(dest), rbits(src), kind, index as i32, 0]);
        lir.target = Some(anchor);
        lir.flags.fixup = FixupKind::SwitchTable;
        cg.append(lir);
    }

    fn op_branch_reg(cg: &mut CodeGen<Self>, reg: RegStorage) {
        Self::push(cg, MipsOp::Jr, [rbits(reg), 0, 0, 0, 0]);
    }

    fn gen_entry_sequence(cg: &mut CodeGen<Self>) {
        if cg.frame_size == 0 {
            cg.cfi.def_cfa_offset(cg.last_lir, 0);
            return;
        }
        if !cg.cu.options.implicit_stack_overflow_checks && !cg.graph.is_leaf {
            Self::push(cg, MipsOp::Probe, [0; 5]);
        }
        let frame = cg.frame_size as i32;
        let adjust = Self::push(cg, MipsOp::SpAdjust, [-frame, 0, 0, 0, 0]);
        cg.cfi.def_cfa_offset(Some(adjust), frame);
        for (reg, offset) in Self::spill_slots(cg) {
            let spill = Self::push(cg, MipsOp::Spill, [rbits(reg), offset, 0, 0, 0]);
            cg.cfi.rel_offset(Some(spill), regs::dwarf_reg(reg), frame - offset);
        }
        Self::push(
            cg,
            MipsOp::Store,
            [rbits(rreg(4)), rbits(rreg(SP)), 0, emit::size_tag(OpSize::Word), 0],
        );
    }

    fn gen_exit_sequence(cg: &mut CodeGen<Self>) {
        if cg.frame_size != 0 {
            cg.cfi.remember_state(cg.last_lir);
            for (reg, offset) in Self::spill_slots(cg) {
                let unspill = Self::push(cg, MipsOp::Unspill, [rbits(reg), offset, 0, 0, 0]);
                cg.cfi.restore(Some(unspill), regs::dwarf_reg(reg));
            }
            let frame = cg.frame_size as i32;
            let adjust = Self::push(cg, MipsOp::SpAdjust, [frame, 0, 0, 0, 0]);
            cg.cfi.def_cfa_offset(Some(adjust), 0);
        }
        let ret = Self::push(cg, MipsOp::Jr, [rbits(rreg(RA)), 0, 0, 0, 0]);
        if cg.frame_size != 0 {
            cg.cfi.restore_state(Some(ret));
            cg.cfi.def_cfa_offset(Some(ret), cg.frame_size as i32);
        }
    }

    fn gen_memory_barrier(cg: &mut CodeGen<Self>, _kind: MemBarrierKind) {
        Self::push(cg, MipsOp::Sync, [0; 5]);
    }

    fn inst_size(lir: &Lir<MipsOp>) -> u32 {
        emit::inst_size(lir)
    }

    fn encode(
        lir: &Lir<MipsOp>,
        env: &AsmEnv<'_, MipsOp>,
        buf: &mut Vec<u8>,
    ) -> Result<(), WidenRequest> {
        emit::encode(lir, env, buf)
    }
}
