//! ARM64 binary encoding.
//!
//! `inst_size` and `encode` must agree exactly; the assembler asserts the
//! running offset against the assigned one before every instruction.
//! Encoders validate PC-relative ranges before pushing any bytes, so a
//! `WidenRequest` leaves the buffer at the instruction boundary.

use crate::backend::assemble::{AsmEnv, WidenRequest};
use crate::backend::lir::{Lir, LirOp};
use crate::backend::regs::RegStorage;
use crate::backend::{AluOp, Cond, ConvKind, MemBarrierKind, OpSize};

use super::regs::SCRATCH;
use super::A64Op;

fn reg(bits: i32) -> u32 {
    u32::from(RegStorage::from_bits(bits as u16).reg_num())
}

fn is_wide(bits: i32) -> bool {
    RegStorage::from_bits(bits as u16).is_solo64()
}

fn sf(bits: i32) -> u32 {
    u32::from(is_wide(bits))
}

pub(super) fn alu_tag(op: AluOp) -> i32 {
    op as i32
}

fn alu_from_tag(tag: i32) -> AluOp {
    [
        AluOp::Add,
        AluOp::Sub,
        AluOp::Rsub,
        AluOp::Mul,
        AluOp::Div,
        AluOp::Rem,
        AluOp::And,
        AluOp::Or,
        AluOp::Xor,
        AluOp::Shl,
        AluOp::Shr,
        AluOp::Ushr,
        AluOp::Adc,
        AluOp::Sbc,
        AluOp::Neg,
        AluOp::Not,
        AluOp::Mov,
    ][tag as usize]
}

pub(super) fn size_tag(size: OpSize) -> i32 {
    size as i32
}

fn size_from_tag(tag: i32) -> OpSize {
    [
        OpSize::Word,
        OpSize::Wide,
        OpSize::Ref,
        OpSize::UnsignedByte,
        OpSize::SignedByte,
        OpSize::UnsignedHalf,
        OpSize::SignedHalf,
        OpSize::Single,
        OpSize::Double,
    ][tag as usize]
}

pub(super) fn cond_tag(cond: Cond) -> i32 {
    cond as i32
}

/// AArch64 condition code nibble for a [`Cond`] tag.
fn cond_bits(tag: i32) -> u32 {
    match tag {
        0 => 0b0000, // eq
        1 => 0b0001, // ne
        2 => 0b1011, // lt
        3 => 0b1010, // ge
        4 => 0b1100, // gt
        5 => 0b1101, // le
        6 => 0b0011, // lo (ult)
        7 => 0b0010, // hs (uge)
        _ => unreachable!(),
    }
}

fn invert_cond_bits(bits: u32) -> u32 {
    bits ^ 1
}

pub(super) fn conv_tag(kind: ConvKind) -> i32 {
    kind as i32
}

//=============================================================================
// Field assemblers

fn enc_arith_rrr(bits_31_21: u32, bits_15_10: u32, rd: u32, rn: u32, rm: u32) -> u32 {
    (bits_31_21 << 21) | (rm << 16) | (bits_15_10 << 10) | (rn << 5) | rd
}

fn enc_arith_rr_imm12(bits_31_24: u32, imm12: u32, rn: u32, rd: u32) -> u32 {
    debug_assert!(imm12 < (1 << 12));
    (bits_31_24 << 24) | (imm12 << 10) | (rn << 5) | rd
}

fn enc_move_wide(sf_bit: u32, opc: u32, hw: u32, imm16: u32, rd: u32) -> u32 {
    (sf_bit << 31) | (opc << 29) | (0b100101 << 23) | (hw << 21) | (imm16 << 5) | rd
}

fn enc_ldst_uimm12(size: u32, v: u32, opc: u32, imm12: u32, rn: u32, rt: u32) -> u32 {
    debug_assert!(imm12 < (1 << 12));
    (size << 30) | (0b111 << 27) | (v << 26) | (0b01 << 24) | (opc << 22) | (imm12 << 10)
        | (rn << 5)
        | rt
}

fn enc_ldst_simm9(size: u32, v: u32, opc: u32, simm9: i32, rn: u32, rt: u32) -> u32 {
    debug_assert!((-256..256).contains(&simm9));
    (size << 30) | (0b111 << 27) | (v << 26) | (opc << 22) | (((simm9 as u32) & 0x1ff) << 12)
        | (rn << 5)
        | rt
}

fn enc_ldst_regoff(size: u32, v: u32, opc: u32, rm: u32, scaled: bool, rn: u32, rt: u32) -> u32 {
    // LSL extend (option 011), S = scaled.
    (size << 30) | (0b111 << 27) | (v << 26) | (opc << 22) | (1 << 21) | (rm << 16)
        | (0b011 << 13)
        | (u32::from(scaled) << 12)
        | (0b10 << 10)
        | (rn << 5)
        | rt
}

fn enc_cbr(cond: u32, off19: i32) -> u32 {
    (0b01010100 << 24) | ((((off19 >> 2) as u32) & 0x7ffff) << 5) | cond
}

fn enc_b(op: u32, off26: i64) -> u32 {
    (op << 31) | (0b00101 << 26) | (((off26 >> 2) as u32) & 0x3ff_ffff)
}

fn push32(buf: &mut Vec<u8>, word: u32) {
    buf.extend_from_slice(&word.to_le_bytes());
}

//=============================================================================
// Size/emission of the composite pieces

/// Number of `mov`/`movk` instructions to materialize a 32-bit constant.
fn const32_insns(value: i32) -> u32 {
    let v = value as u32;
    if v & 0xffff == v || v & 0xffff_0000 == v {
        1
    } else if (!v) & 0xffff == !v {
        1 // movn
    } else {
        2
    }
}

fn emit_const32(buf: &mut Vec<u8>, rd: u32, value: i32) {
    let v = value as u32;
    if v & 0xffff == v {
        push32(buf, enc_move_wide(0, 0b10, 0, v, rd));
    } else if v & 0xffff_0000 == v {
        push32(buf, enc_move_wide(0, 0b10, 1, v >> 16, rd));
    } else if (!v) & 0xffff == !v {
        push32(buf, enc_move_wide(0, 0b00, 0, !v & 0xffff, rd));
    } else {
        push32(buf, enc_move_wide(0, 0b10, 0, v & 0xffff, rd));
        push32(buf, enc_move_wide(0, 0b11, 1, v >> 16, rd));
    }
}

fn const64_insns(value: i64) -> u32 {
    let halves =
        (0..4).filter(|&h| (value as u64 >> (16 * h)) & 0xffff != 0).count() as u32;
    halves.max(1)
}

fn emit_const64(buf: &mut Vec<u8>, rd: u32, value: i64) {
    let mut first = true;
    for h in 0..4u32 {
        let half = ((value as u64) >> (16 * h)) as u32 & 0xffff;
        if half != 0 || (h == 3 && first) {
            let opc = if first { 0b10 } else { 0b11 };
            push32(buf, enc_move_wide(1, opc, h, half, rd));
            first = false;
        }
    }
    if first {
        push32(buf, enc_move_wide(1, 0b10, 0, 0, rd));
    }
}

/// `(size2, v, opc)` triple plus scale for a load of `size`.
fn load_params(size: OpSize) -> (u32, u32, u32, u32) {
    match size {
        OpSize::Word => (0b10, 0, 0b01, 2),
        OpSize::Wide => (0b11, 0, 0b01, 3),
        OpSize::Ref => (0b11, 0, 0b01, 3),
        OpSize::UnsignedByte => (0b00, 0, 0b01, 0),
        OpSize::SignedByte => (0b00, 0, 0b10, 0),
        OpSize::UnsignedHalf => (0b01, 0, 0b01, 1),
        OpSize::SignedHalf => (0b01, 0, 0b10, 1),
        OpSize::Single => (0b10, 1, 0b01, 2),
        OpSize::Double => (0b11, 1, 0b01, 3),
    }
}

fn store_params(size: OpSize) -> (u32, u32, u32, u32) {
    match size {
        OpSize::Word => (0b10, 0, 0b00, 2),
        OpSize::Wide | OpSize::Ref => (0b11, 0, 0b00, 3),
        OpSize::UnsignedByte | OpSize::SignedByte => (0b00, 0, 0b00, 0),
        OpSize::UnsignedHalf | OpSize::SignedHalf => (0b01, 0, 0b00, 1),
        OpSize::Single => (0b10, 1, 0b00, 2),
        OpSize::Double => (0b11, 1, 0b00, 3),
    }
}

fn ldst_insns(disp: i32, scale: u32) -> u32 {
    if disp >= 0 && disp % (1 << scale) == 0 && (disp >> scale) < (1 << 12) {
        1
    } else if (-256..256).contains(&disp) {
        1
    } else {
        // Materialize the offset into the scratch register and add.
        const32_insns(disp) + 2
    }
}

fn emit_ldst(buf: &mut Vec<u8>, load: bool, size: OpSize, rt: u32, rn: u32, disp: i32) {
    let (sz, v, opc, scale) = if load { load_params(size) } else { store_params(size) };
    if disp >= 0 && disp % (1 << scale) == 0 && (disp >> scale) < (1 << 12) {
        push32(buf, enc_ldst_uimm12(sz, v, opc, (disp >> scale) as u32, rn, rt));
    } else if (-256..256).contains(&disp) {
        push32(buf, enc_ldst_simm9(sz, v, opc, disp, rn, rt));
    } else {
        emit_const32(buf, u32::from(SCRATCH), disp);
        // add x16, xn, x16
        push32(buf, enc_arith_rrr(0b100_0101_1000, 0, u32::from(SCRATCH), rn, u32::from(SCRATCH)));
        push32(buf, enc_ldst_uimm12(sz, v, opc, 0, u32::from(SCRATCH), rt));
    }
}

fn cmp_imm_insns(imm: i32) -> u32 {
    if (0..4096).contains(&imm) || (-4095..0).contains(&imm) {
        1
    } else {
        const32_insns(imm) + 1
    }
}

fn emit_cmp_imm(buf: &mut Vec<u8>, rn_bits: i32, imm: i32) {
    let rn = reg(rn_bits);
    let sf_bit = sf(rn_bits);
    if (0..4096).contains(&imm) {
        // subs zr, rn, #imm
        push32(buf, enc_arith_rr_imm12((sf_bit << 7) | 0b111_0001, imm as u32, rn, 31));
    } else if (-4095..0).contains(&imm) {
        // adds zr, rn, #-imm
        push32(buf, enc_arith_rr_imm12((sf_bit << 7) | 0b011_0001, (-imm) as u32, rn, 31));
    } else {
        emit_const32(buf, u32::from(SCRATCH), imm);
        // subs zr, rn, x16
        push32(
            buf,
            enc_arith_rrr((sf_bit << 10) | 0b110_1011_000, 0, 31, rn, u32::from(SCRATCH)),
        );
    }
}

fn alu_rrr_insns(alu: AluOp) -> u32 {
    match alu {
        AluOp::Rem => 2,
        _ => 1,
    }
}

fn emit_alu_rrr(buf: &mut Vec<u8>, alu: AluOp, rd_bits: i32, rn_bits: i32, rm_bits: i32) {
    let (rd, rn, rm) = (reg(rd_bits), reg(rn_bits), reg(rm_bits));
    let s = sf(rd_bits) << 10;
    match alu {
        AluOp::Add => push32(buf, enc_arith_rrr(s | 0b000_1011_000, 0, rd, rn, rm)),
        AluOp::Sub => push32(buf, enc_arith_rrr(s | 0b100_1011_000, 0, rd, rn, rm)),
        AluOp::Rsub => push32(buf, enc_arith_rrr(s | 0b100_1011_000, 0, rd, rm, rn)),
        AluOp::And => push32(buf, enc_arith_rrr(s | 0b000_1010_000, 0, rd, rn, rm)),
        AluOp::Or => push32(buf, enc_arith_rrr(s | 0b010_1010_000, 0, rd, rn, rm)),
        AluOp::Xor => push32(buf, enc_arith_rrr(s | 0b100_1010_000, 0, rd, rn, rm)),
        AluOp::Mul => {
            // madd rd, rn, rm, zr
            push32(buf, enc_arith_rrr(s | 0b000_1101_1000, 0b011111, rd, rn, rm));
        }
        AluOp::Div => push32(buf, enc_arith_rrr(s | 0b000_1101_0110, 0b000011, rd, rn, rm)),
        AluOp::Rem => {
            // sdiv scratch, rn, rm; msub rd, scratch, rm, rn
            push32(
                buf,
                enc_arith_rrr(s | 0b000_1101_0110, 0b000011, u32::from(SCRATCH), rn, rm),
            );
            push32(
                buf,
                enc_arith_rrr(s | 0b000_1101_1000, 0b100000 | rn, rd, u32::from(SCRATCH), rm),
            );
        }
        AluOp::Shl => push32(buf, enc_arith_rrr(s | 0b000_1101_0110, 0b001000, rd, rn, rm)),
        AluOp::Ushr => push32(buf, enc_arith_rrr(s | 0b000_1101_0110, 0b001001, rd, rn, rm)),
        AluOp::Shr => push32(buf, enc_arith_rrr(s | 0b000_1101_0110, 0b001010, rd, rn, rm)),
        AluOp::Adc => push32(buf, enc_arith_rrr(s | 0b000_1101_0000, 0, rd, rn, rm)),
        AluOp::Sbc => push32(buf, enc_arith_rrr(s | 0b100_1101_0000, 0, rd, rn, rm)),
        AluOp::Neg => push32(buf, enc_arith_rrr(s | 0b100_1011_000, 0, rd, 31, rn)),
        AluOp::Not => {
            // orn rd, zr, rn
            push32(buf, enc_arith_rrr(s | 0b010_1010_001, 0, rd, 31, rn));
        }
        AluOp::Mov => push32(buf, enc_arith_rrr(s | 0b010_1010_000, 0, rd, 31, rm)),
    }
}

fn alu_rri_insns(alu: AluOp, imm: i32) -> u32 {
    match alu {
        AluOp::Add | AluOp::Sub | AluOp::Rsub => {
            if (0..4096).contains(&imm) || (-4095..0).contains(&imm) {
                1
            } else {
                const32_insns(imm) + 1
            }
        }
        AluOp::Shl | AluOp::Shr | AluOp::Ushr => 1,
        AluOp::Neg | AluOp::Not | AluOp::Mov => 1,
        // Logical and multiplicative immediates go through the scratch
        // register.
        _ => const32_insns(imm) + alu_rrr_insns(alu),
    }
}

fn emit_alu_rri(buf: &mut Vec<u8>, alu: AluOp, rd_bits: i32, rn_bits: i32, imm: i32) {
    let (rd, rn) = (reg(rd_bits), reg(rn_bits));
    let sf_bit = sf(rd_bits);
    let wide = is_wide(rd_bits);
    match alu {
        AluOp::Add | AluOp::Sub => {
            // A negative immediate flips the operation.
            let subtract = (alu == AluOp::Sub) != (imm < 0);
            let magnitude = imm.unsigned_abs();
            if magnitude < 4096 {
                let op8 =
                    (sf_bit << 7) | if subtract { 0b101_0001 } else { 0b001_0001 };
                push32(buf, enc_arith_rr_imm12(op8, magnitude, rn, rd));
            } else {
                emit_const32(buf, u32::from(SCRATCH), imm);
                emit_alu_rrr(buf, alu, rd_bits, rn_bits, scratch_bits(wide));
            }
        }
        AluOp::Rsub => {
            emit_const32(buf, u32::from(SCRATCH), imm);
            emit_alu_rrr(buf, AluOp::Sub, rd_bits, scratch_bits(wide), rn_bits);
        }
        AluOp::Shl | AluOp::Shr | AluOp::Ushr => {
            let bits = if wide { 64 } else { 32 };
            let shift = (imm as u32) % bits;
            let (opc, immr, imms) = match alu {
                AluOp::Shl => (0b10, (bits - shift) % bits, bits - 1 - shift),
                AluOp::Ushr => (0b10, shift, bits - 1),
                _ => (0b00, shift, bits - 1),
            };
            let n = sf_bit;
            let word = (sf_bit << 31)
                | (opc << 29)
                | (0b100110 << 23)
                | (n << 22)
                | (immr << 16)
                | (imms << 10)
                | (rn << 5)
                | rd;
            push32(buf, word);
        }
        AluOp::Neg => emit_alu_rrr(buf, AluOp::Neg, rd_bits, 0, rn_bits),
        AluOp::Not => emit_alu_rrr(buf, AluOp::Not, rd_bits, rn_bits, 0),
        AluOp::Mov => emit_alu_rrr(buf, AluOp::Mov, rd_bits, 0, rn_bits),
        _ => {
            emit_const32(buf, u32::from(SCRATCH), imm);
            emit_alu_rrr(buf, alu, rd_bits, rn_bits, scratch_bits(wide));
        }
    }
}

fn scratch_bits(wide: bool) -> i32 {
    let reg = if wide {
        RegStorage::solo64(SCRATCH)
    } else {
        RegStorage::solo32(SCRATCH)
    };
    i32::from(reg.bits())
}

fn emit_fp_rrr(buf: &mut Vec<u8>, tag: i32, rd: u32, rn: u32, rm: u32, double: bool) {
    let ty = u32::from(double);
    // fadd/fsub/fmul/fdiv
    let opcode = match tag {
        0 => 0b0010, // fadd
        1 => 0b0011, // fsub
        2 => 0b0000, // fmul
        3 => 0b0001, // fdiv
        _ => unreachable!(),
    };
    let word = (0b00011110 << 24) | (ty << 22) | (1 << 21) | (rm << 16) | (opcode << 12)
        | (0b10 << 10)
        | (rn << 5)
        | rd;
    push32(buf, word);
}

fn emit_fcmp(buf: &mut Vec<u8>, rn: u32, rm: u32, double: bool) {
    let ty = u32::from(double);
    push32(buf, (0b00011110 << 24) | (ty << 22) | (1 << 21) | (rm << 16) | (0b1000 << 10) | (rn << 5));
}

fn emit_cset(buf: &mut Vec<u8>, rd: u32, cond: u32) {
    // csinc rd, wzr, wzr, inv(cond)
    push32(
        buf,
        (0b0001_1010_100 << 21) | (31 << 16) | (invert_cond_bits(cond) << 12) | (0b01 << 10)
            | (31 << 5)
            | rd,
    );
}

fn emit_csinv(buf: &mut Vec<u8>, rd: u32, rn: u32, rm: u32, cond: u32) {
    push32(buf, (0b0101_1010_100 << 21) | (rm << 16) | (cond << 12) | (rn << 5) | rd);
}

//=============================================================================
// Public entry points

pub fn inst_size(lir: &Lir<A64Op>) -> u32 {
    let op = match lir.opcode {
        LirOp::Target(op) => op,
        LirOp::Pseudo(_) => return 0,
    };
    let ops = &lir.operands;
    let insns = match op {
        A64Op::LoadConst => const32_insns(ops[1]),
        A64Op::LoadConst64 => {
            let value = (ops[1] as u32 as i64) | ((ops[2] as i64) << 32);
            const64_insns(value)
        }
        A64Op::Load | A64Op::Store => {
            let (_, _, _, scale) = if op == A64Op::Load {
                load_params(size_from_tag(ops[3]))
            } else {
                store_params(size_from_tag(ops[3]))
            };
            ldst_insns(ops[2], scale)
        }
        A64Op::LoadIndexed | A64Op::StoreIndexed => 1,
        A64Op::Mov => 1,
        A64Op::AluRRR => alu_rrr_insns(alu_from_tag(ops[0])),
        A64Op::AluRRI => alu_rri_insns(alu_from_tag(ops[0]), ops[3]),
        A64Op::FpRRR | A64Op::FpNeg | A64Op::Conv => 1,
        A64Op::FpCmp => 3,
        A64Op::CmpLong => 3,
        A64Op::CmpBr => 2 + u32::from(lir.flags.widened),
        A64Op::CmpImmBr => cmp_imm_insns(ops[2]) + 1 + u32::from(lir.flags.widened),
        A64Op::B | A64Op::Blr | A64Op::Bl | A64Op::Br | A64Op::Ret => 1,
        A64Op::LoadPool | A64Op::Adr => 1,
        A64Op::TableDelta => 2,
        A64Op::Dmb => 1,
        A64Op::SpAdjust => {
            let magnitude = ops[0].unsigned_abs();
            if magnitude < 4096 { 1 } else { 2 }
        }
        A64Op::Spill | A64Op::Unspill => 1,
        A64Op::Ldxr | A64Op::Stxr => 1,
        A64Op::Probe => 2,
    };
    insns * 4
}

pub fn encode(
    lir: &Lir<A64Op>,
    env: &AsmEnv<'_, A64Op>,
    buf: &mut Vec<u8>,
) -> Result<(), WidenRequest> {
    let op = match lir.opcode {
        LirOp::Target(op) => op,
        LirOp::Pseudo(_) => return Ok(()),
    };
    let ops = &lir.operands;
    let pc = lir.offset as i64;
    match op {
        A64Op::LoadConst => emit_const32(buf, reg(ops[0]), ops[1]),
        A64Op::LoadConst64 => {
            let value = (ops[1] as u32 as i64) | ((ops[2] as i64) << 32);
            emit_const64(buf, reg(ops[0]), value);
        }
        A64Op::Load => {
            emit_ldst(buf, true, size_from_tag(ops[3]), reg(ops[0]), reg(ops[1]), ops[2]);
        }
        A64Op::Store => {
            emit_ldst(buf, false, size_from_tag(ops[3]), reg(ops[0]), reg(ops[1]), ops[2]);
        }
        A64Op::LoadIndexed | A64Op::StoreIndexed => {
            let load = op == A64Op::LoadIndexed;
            let size = size_from_tag(ops[4]);
            let (sz, v, opc, scale) =
                if load { load_params(size) } else { store_params(size) };
            let scaled = ops[3] as u32 == scale && scale != 0;
            push32(
                buf,
                enc_ldst_regoff(sz, v, opc, reg(ops[2]), scaled, reg(ops[1]), reg(ops[0])),
            );
        }
        A64Op::Mov => {
            let dest = RegStorage::from_bits(ops[0] as u16);
            let src = RegStorage::from_bits(ops[1] as u16);
            match (dest.is_float(), src.is_float()) {
                (false, false) => emit_alu_rrr(buf, AluOp::Mov, ops[0], 0, ops[1]),
                (true, true) => {
                    let ty = u32::from(dest.is_solo64());
                    // fmov fd, fn
                    push32(
                        buf,
                        (0b00011110 << 24) | (ty << 22) | (1 << 21) | (0b10000 << 10)
                            | (reg(ops[1]) << 5)
                            | reg(ops[0]),
                    );
                }
                (to_fp, _) => {
                    // fmov between register files.
                    let sf_bit = u32::from(dest.is_solo64() || src.is_solo64());
                    let ty = sf_bit;
                    let opcode = if to_fp { 0b111 } else { 0b110 };
                    push32(
                        buf,
                        (sf_bit << 31) | (0b0011110 << 24) | (ty << 22) | (1 << 21)
                            | (opcode << 16)
                            | (reg(ops[1]) << 5)
                            | reg(ops[0]),
                    );
                }
            }
        }
        A64Op::AluRRR => emit_alu_rrr(buf, alu_from_tag(ops[0]), ops[1], ops[2], ops[3]),
        A64Op::AluRRI => emit_alu_rri(buf, alu_from_tag(ops[0]), ops[1], ops[2], ops[3]),
        A64Op::FpRRR => {
            emit_fp_rrr(buf, ops[0], reg(ops[1]), reg(ops[2]), reg(ops[3]), is_double(ops[1]));
        }
        A64Op::FpNeg => {
            let ty = u32::from(is_double(ops[0]));
            push32(
                buf,
                (0b00011110 << 24) | (ty << 22) | (1 << 21) | (0b000010 << 15) | (0b10000 << 10)
                    | (reg(ops[1]) << 5)
                    | reg(ops[0]),
            );
        }
        A64Op::FpCmp => {
            let gt_bias = ops[3] != 0;
            emit_fcmp(buf, reg(ops[1]), reg(ops[2]), is_double(ops[1]));
            if gt_bias {
                emit_cset(buf, reg(ops[0]), 0b1000); // hi
                emit_csinv(buf, reg(ops[0]), reg(ops[0]), 31, 0b0101); // pl
            } else {
                emit_cset(buf, reg(ops[0]), 0b1100); // gt
                emit_csinv(buf, reg(ops[0]), reg(ops[0]), 31, 0b1010); // ge
            }
        }
        A64Op::CmpLong => {
            // cmp xn, xm; cset rd, gt; csinv rd, rd, zr, ge
            push32(
                buf,
                enc_arith_rrr((1 << 10) | 0b110_1011_000, 0, 31, reg(ops[1]), reg(ops[2])),
            );
            emit_cset(buf, reg(ops[0]), 0b1100);
            emit_csinv(buf, reg(ops[0]), reg(ops[0]), 31, 0b1010);
        }
        A64Op::Conv => emit_conversion(buf, ops[0], reg(ops[1]), reg(ops[2])),
        A64Op::CmpBr => {
            let target = env.label_offset(lir.target.expect("branch without target"));
            let s = sf(ops[1]) << 10;
            push32(buf, enc_arith_rrr(s | 0b110_1011_000, 0, 31, reg(ops[1]), reg(ops[2])));
            emit_cond_branch(buf, lir, cond_bits(ops[0]), pc + 4, target)?;
        }
        A64Op::CmpImmBr => {
            let target = env.label_offset(lir.target.expect("branch without target"));
            let cmp_len = cmp_imm_insns(ops[2]) * 4;
            emit_cmp_imm(buf, ops[1], ops[2]);
            emit_cond_branch(buf, lir, cond_bits(ops[0]), pc + i64::from(cmp_len), target)?;
        }
        A64Op::B => {
            let target = env.label_offset(lir.target.expect("branch without target"));
            push32(buf, enc_b(0, i64::from(target) - pc));
        }
        A64Op::Blr => {
            push32(buf, (0b1101011000111111 << 16) | (reg(ops[0]) << 5));
        }
        A64Op::Bl => push32(buf, enc_b(1, 0)),
        A64Op::Br => push32(buf, (0b1101011000011111 << 16) | (reg(ops[0]) << 5)),
        A64Op::Ret => push32(buf, 0xd65f03c0),
        A64Op::LoadPool => {
            let base = env.pool_base[ops[1] as usize] + ops[2] as u32 * 4;
            let disp = i64::from(base) - pc;
            if !(-(1 << 20)..(1 << 20)).contains(&disp) {
                return Err(WidenRequest);
            }
            // ldr w(rt), <literal>
            push32(buf, (0b00011000 << 24) | ((((disp >> 2) as u32) & 0x7ffff) << 5) | reg(ops[0]));
        }
        A64Op::Adr => {
            // adr xd, #0: the instruction's own address.
            push32(buf, (0b10000 << 24) | reg(ops[0]));
        }
        A64Op::TableDelta => {
            let table_offset = if ops[2] == 0 {
                env.switch_table_offsets[ops[3] as usize]
            } else {
                env.fill_array_offsets[ops[3] as usize]
            };
            let anchor = lir.target.expect("table delta without an anchor");
            let reference = crate::backend::assemble::table_reference_offset(
                crate::options::InstructionSet::Arm64,
                env.lirs[anchor].offset,
                table_offset,
            );
            let delta = table_offset - reference;
            debug_assert!(delta < 1 << 24, "table delta out of range");
            // add xd, xs, #lo12 ; add xd, xd, #hi12, lsl #12
            push32(
                buf,
                enc_arith_rr_imm12(0b1001_0001, delta & 0xfff, reg(ops[1]), reg(ops[0])),
            );
            push32(
                buf,
                enc_arith_rr_imm12(0b1001_0001, delta >> 12, reg(ops[0]), reg(ops[0]))
                    | (1 << 22),
            );
        }
        A64Op::Dmb => {
            let option = match ops[0] {
                0 => 0b1010, // ishst
                1 => 0b1001, // ishld
                2 => 0b1010, // ishst
                _ => 0b1011, // ish
            };
            push32(buf, 0xd503_303f | (option << 8));
        }
        A64Op::SpAdjust => {
            let delta = ops[0];
            let magnitude = delta.unsigned_abs();
            let sub = delta < 0;
            let op8 = if sub { 0b1101_0001 } else { 0b1001_0001 };
            if magnitude < 4096 {
                push32(buf, enc_arith_rr_imm12(op8, magnitude, 31, 31));
            } else {
                push32(buf, enc_arith_rr_imm12(op8, magnitude & 0xfff, 31, 31));
                // Shifted-by-12 second piece.
                push32(
                    buf,
                    enc_arith_rr_imm12(op8, magnitude >> 12, 31, 31) | (1 << 22),
                );
            }
        }
        A64Op::Spill | A64Op::Unspill => {
            let storage = RegStorage::from_bits(ops[0] as u16);
            let size = if storage.is_float() { OpSize::Double } else { OpSize::Wide };
            emit_ldst(buf, op == A64Op::Unspill, size, reg(ops[0]), 31, ops[1]);
        }
        A64Op::Ldxr => {
            // ldxr wt, [xn]
            push32(buf, 0x885f_7c00 | (reg(ops[1]) << 5) | reg(ops[0]));
        }
        A64Op::Stxr => {
            // stxr ws, wt, [xn]
            push32(
                buf,
                0x8800_7c00 | (reg(ops[0]) << 16) | (reg(ops[2]) << 5) | reg(ops[1]),
            );
        }
        A64Op::Probe => {
            // sub x16, sp, #reserved; ldr wzr, [x16]
            push32(buf, enc_arith_rr_imm12(0b1101_0001, ops[0] as u32, 31, u32::from(SCRATCH)));
            push32(buf, enc_ldst_uimm12(0b10, 0, 0b01, 0, u32::from(SCRATCH), 31));
        }
    }
    Ok(())
}

fn is_double(bits: i32) -> bool {
    RegStorage::from_bits(bits as u16).is_solo64()
}

fn emit_cond_branch(
    buf: &mut Vec<u8>,
    lir: &Lir<A64Op>,
    cond: u32,
    branch_pc: i64,
    target: u32,
) -> Result<(), WidenRequest> {
    let disp = i64::from(target) - branch_pc;
    if !lir.flags.widened {
        if !(-(1 << 20)..(1 << 20)).contains(&disp) {
            return Err(WidenRequest);
        }
        push32(buf, enc_cbr(cond, disp as i32));
    } else {
        // Inverted short branch over an unconditional long one.
        push32(buf, enc_cbr(invert_cond_bits(cond), 8));
        push32(buf, enc_b(0, i64::from(target) - (branch_pc + 4)));
    }
    Ok(())
}

fn emit_conversion(buf: &mut Vec<u8>, tag: i32, rd: u32, rn: u32) {
    // (sf, type, rmode, opcode) per kind; sign/zero extends use bitfield
    // ops instead.
    let word = match tag {
        // I2L: sxtw xd, wn
        0 => (1 << 31) | (0b00100110 << 23) | (1 << 22) | (0b011111 << 10) | (rn << 5) | rd,
        // I2F: scvtf s, w
        1 => 0x1e22_0000 | (rn << 5) | rd,
        // I2D: scvtf d, w
        2 => 0x1e62_0000 | (rn << 5) | rd,
        // L2I: mov wd, wn
        3 => (0b010_1010_000 << 21) | (rn << 16) | (31 << 5) | rd,
        // L2F: scvtf s, x
        4 => 0x9e22_0000 | (rn << 5) | rd,
        // L2D: scvtf d, x
        5 => 0x9e62_0000 | (rn << 5) | rd,
        // F2I: fcvtzs w, s
        6 => 0x1e38_0000 | (rn << 5) | rd,
        // F2L: fcvtzs x, s
        7 => 0x9e38_0000 | (rn << 5) | rd,
        // F2D: fcvt d, s
        8 => 0x1e22_c000 | (rn << 5) | rd,
        // D2I: fcvtzs w, d
        9 => 0x1e78_0000 | (rn << 5) | rd,
        // D2L: fcvtzs x, d
        10 => 0x9e78_0000 | (rn << 5) | rd,
        // D2F: fcvt s, d
        11 => 0x1e62_4000 | (rn << 5) | rd,
        // I2B: sxtb wd, wn
        12 => (0b00100110 << 23) | (0b000111 << 10) | (rn << 5) | rd,
        // I2C: uxth wd, wn
        13 => (0b01010011 << 24) | (0b001111 << 10) | (rn << 5) | rd,
        // I2S: sxth wd, wn
        14 => (0b00100110 << 23) | (0b001111 << 10) | (rn << 5) | rd,
        _ => unreachable!(),
    };
    push32(buf, word);
}

#[cfg(test)]
mod emit_tests {
    use super::*;
    use crate::backend::lir::Lir;

    fn lir(op: A64Op, operands: [i32; 5]) -> Lir<A64Op> {
        let mut lir = Lir::new(LirOp::Target(op), 0);
        lir.operands = operands;
        lir
    }

    fn encode_one(l: &Lir<A64Op>) -> Vec<u8> {
        let lirs = cranelift_entity::PrimaryMap::new();
        let env = AsmEnv {
            lirs: &lirs,
            pool_base: [0; 5],
            switch_table_offsets: &[],
            fill_array_offsets: &[],
        };
        let mut buf = Vec::new();
        encode(l, &env, &mut buf).unwrap();
        buf
    }

    fn w(bits: &[u8]) -> u32 {
        u32::from_le_bytes(bits.try_into().unwrap())
    }

    #[test]
    fn ret_encodes() {
        let bytes = encode_one(&lir(A64Op::Ret, [0; 5]));
        assert_eq!(w(&bytes), 0xd65f03c0);
    }

    #[test]
    fn movz_small_constant() {
        let rd = i32::from(RegStorage::solo32(0).bits());
        let bytes = encode_one(&lir(A64Op::LoadConst, [rd, 7, 0, 0, 0]));
        // movz w0, #7
        assert_eq!(w(&bytes), 0x5280_00e0);
        assert_eq!(bytes.len() as u32, inst_size(&lir(A64Op::LoadConst, [rd, 7, 0, 0, 0])));
    }

    #[test]
    fn add_registers() {
        let rd = i32::from(RegStorage::solo32(0).bits());
        let rn = i32::from(RegStorage::solo32(1).bits());
        let rm = i32::from(RegStorage::solo32(2).bits());
        let l = lir(A64Op::AluRRR, [alu_tag(AluOp::Add), rd, rn, rm, 0]);
        // add w0, w1, w2
        assert_eq!(w(&encode_one(&l)), 0x0b02_0020);
    }

    #[test]
    fn ldr_unsigned_offset() {
        let rt = i32::from(RegStorage::solo32(0).bits());
        let rn = i32::from(RegStorage::solo64(1).bits());
        let l = lir(A64Op::Load, [rt, rn, 8, size_tag(OpSize::Word), 0]);
        // ldr w0, [x1, #8]
        assert_eq!(w(&encode_one(&l)), 0xb940_0820);
    }

    #[test]
    fn size_matches_encoding_for_large_offsets() {
        let rt = i32::from(RegStorage::solo32(0).bits());
        let rn = i32::from(RegStorage::solo64(1).bits());
        let l = lir(A64Op::Load, [rt, rn, 0x12345, size_tag(OpSize::Word), 0]);
        assert_eq!(encode_one(&l).len() as u32, inst_size(&l));
    }
}
