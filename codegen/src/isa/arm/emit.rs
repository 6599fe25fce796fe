//! Thumb2 binary encoding.
//!
//! Wide (32-bit) T32 encodings are used throughout except for the
//! conditional branch, which starts in its 16-bit form and is widened to
//! the 32-bit form when assembly finds the displacement out of range, and
//! the short register-call forms. 32-bit encodings are emitted high
//! halfword first, as the T32 stream requires.

use crate::backend::assemble::{AsmEnv, WidenRequest};
use crate::backend::lir::{Lir, LirOp};
use crate::backend::regs::RegStorage;
use crate::backend::{AluOp, Cond, ConvKind, OpSize};

use super::regs::{LR, PC};
use super::ThumbOp;

/// Encoder scratch; also the invoke-target register, which the dispatch
/// machinery writes only immediately before the call.
pub const SCRATCH: u8 = LR;

fn reg(bits: i32) -> u8 {
    RegStorage::from_bits(bits as u16).reg_num()
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

pub(super) fn cond_tag(cond: Cond) -> i32 {
    cond as i32
}

/// ARM condition nibble for a [`Cond`] tag.
pub(super) fn cond_bits(tag: i32) -> u32 {
    match tag {
        0 => 0b0000, // eq
        1 => 0b0001, // ne
        2 => 0b1011, // lt
        3 => 0b1010, // ge
        4 => 0b1100, // gt
        5 => 0b1101, // le
        6 => 0b0011, // lo
        7 => 0b0010, // hs
        _ => unreachable!(),
    }
}

pub(super) fn conv_tag(kind: ConvKind) -> i32 {
    kind as i32
}

fn push16(buf: &mut Vec<u8>, half: u16) {
    buf.extend_from_slice(&half.to_le_bytes());
}

fn push32(buf: &mut Vec<u8>, word: u32) {
    // T32: high halfword first.
    push16(buf, (word >> 16) as u16);
    push16(buf, word as u16);
}

//=============================================================================
// Encoding helpers

/// `movw`/`movt` pair (or just `movw`) for a 32-bit constant.
fn const32_insns(value: i32) -> u32 {
    if value as u32 >> 16 == 0 { 1 } else { 2 }
}

fn enc_movw(rd: u8, imm16: u32) -> u32 {
    enc_mov_imm16(0b100100, rd, imm16)
}

fn enc_movt(rd: u8, imm16: u32) -> u32 {
    enc_mov_imm16(0b101100, rd, imm16)
}

fn enc_mov_imm16(op6: u32, rd: u8, imm16: u32) -> u32 {
    let i = (imm16 >> 11) & 1;
    let imm4 = imm16 >> 12;
    let imm3 = (imm16 >> 8) & 7;
    let imm8 = imm16 & 0xff;
    (0b11110 << 27) | (i << 26) | (op6 << 20) | (imm4 << 16) | (imm3 << 12)
        | (u32::from(rd) << 8)
        | imm8
}

fn emit_const32(buf: &mut Vec<u8>, rd: u8, value: i32) {
    let v = value as u32;
    push32(buf, enc_movw(rd, v & 0xffff));
    if v >> 16 != 0 {
        push32(buf, enc_movt(rd, v >> 16));
    }
}

/// Wide load/store with a positive 12-bit offset; larger offsets add the
/// scratch register.
fn ldst_base(size: OpSize, load: bool) -> u32 {
    match (size, load) {
        (OpSize::Word | OpSize::Ref, true) => 0xf8d0_0000,
        (OpSize::Word | OpSize::Ref, false) => 0xf8c0_0000,
        (OpSize::UnsignedByte, true) => 0xf890_0000,
        (OpSize::SignedByte, true) => 0xf990_0000,
        (OpSize::UnsignedHalf, true) => 0xf8b0_0000,
        (OpSize::SignedHalf, true) => 0xf9b0_0000,
        (OpSize::UnsignedByte | OpSize::SignedByte, false) => 0xf880_0000,
        (OpSize::UnsignedHalf | OpSize::SignedHalf, false) => 0xf8a0_0000,
        // vldr/vstr handled separately.
        _ => unreachable!(),
    }
}

fn ldst_insns(size: OpSize, disp: i32) -> u32 {
    if matches!(size, OpSize::Single | OpSize::Double) {
        // vldr reaches imm8*4 with either sign.
        if disp % 4 == 0 && disp.unsigned_abs() / 4 < 256 {
            1
        } else {
            const32_insns(disp) + 2
        }
    } else if (0..4096).contains(&disp) {
        1
    } else {
        const32_insns(disp) + 2
    }
}

fn emit_vldst(buf: &mut Vec<u8>, load: bool, double: bool, vd: u8, rn: u8, disp: i32) {
    debug_assert!(disp % 4 == 0 && disp.unsigned_abs() / 4 < 256);
    let u = u32::from(disp >= 0);
    let imm8 = (disp.unsigned_abs() / 4) & 0xff;
    let l = u32::from(load);
    let (d_bit, vd_field) = if double {
        (u32::from(vd >> 4) & 1, u32::from(vd & 0xf))
    } else {
        (u32::from(vd) & 1, u32::from(vd >> 1))
    };
    let sz = u32::from(double);
    push32(
        buf,
        (0b1110_1101 << 24) | (u << 23) | (d_bit << 22) | (l << 20) | (u32::from(rn) << 16)
            | (vd_field << 12)
            | (0b101 << 9)
            | (sz << 8)
            | imm8,
    );
}

fn emit_ldst(buf: &mut Vec<u8>, load: bool, size: OpSize, rt: u8, rn: u8, disp: i32) {
    if matches!(size, OpSize::Single | OpSize::Double) {
        if disp % 4 == 0 && disp.unsigned_abs() / 4 < 256 {
            emit_vldst(buf, load, size == OpSize::Double, rt, rn, disp);
        } else {
            emit_const32(buf, SCRATCH, disp);
            // add scratch, rn, scratch
            push32(buf, enc_dp_reg(0b1000, false, SCRATCH, rn, SCRATCH));
            emit_vldst(buf, load, size == OpSize::Double, rt, SCRATCH, 0);
        }
        return;
    }
    if (0..4096).contains(&disp) {
        push32(
            buf,
            ldst_base(size, load) | (u32::from(rn) << 16) | (u32::from(rt) << 12) | disp as u32,
        );
    } else {
        emit_const32(buf, SCRATCH, disp);
        push32(buf, enc_dp_reg(0b1000, false, SCRATCH, rn, SCRATCH));
        push32(
            buf,
            ldst_base(size, load) | (u32::from(SCRATCH) << 16) | (u32::from(rt) << 12),
        );
    }
}

/// Data-processing, shifted register, shift amount zero.
/// op4: and 0000, eor 0100, orr 0010 (with rn), add 1000, adc 1010,
/// sbc 1011, sub 1101, rsb 1110.
fn enc_dp_reg(op4: u32, set_flags: bool, rd: u8, rn: u8, rm: u8) -> u32 {
    (0b1110101 << 25) | (op4 << 21) | (u32::from(set_flags) << 20) | (u32::from(rn) << 16)
        | (u32::from(rd) << 8)
        | u32::from(rm)
}

fn enc_shift_reg(op2: u32, rd: u8, rn: u8, rm: u8) -> u32 {
    // lsl 00, lsr 01, asr 10 (register-controlled)
    (0b11111010_0000 << 20) | (op2 << 21) | (u32::from(rn) << 16) | (0b1111 << 12)
        | (u32::from(rd) << 8)
        | u32::from(rm)
}

fn alu_rrr_insns(alu: AluOp) -> u32 {
    match alu {
        AluOp::Rem => 2,
        _ => 1,
    }
}

fn emit_alu_rrr(buf: &mut Vec<u8>, alu: AluOp, rd: u8, rn: u8, rm: u8) {
    emit_alu_rrr_flags(buf, alu, rd, rn, rm, false)
}

fn emit_alu_rrr_flags(buf: &mut Vec<u8>, alu: AluOp, rd: u8, rn: u8, rm: u8, set_flags: bool) {
    match alu {
        AluOp::Add => push32(buf, enc_dp_reg(0b1000, set_flags, rd, rn, rm)),
        AluOp::Adc => push32(buf, enc_dp_reg(0b1010, set_flags, rd, rn, rm)),
        AluOp::Sub => push32(buf, enc_dp_reg(0b1101, set_flags, rd, rn, rm)),
        AluOp::Sbc => push32(buf, enc_dp_reg(0b1011, set_flags, rd, rn, rm)),
        AluOp::Rsub => push32(buf, enc_dp_reg(0b1101, set_flags, rd, rm, rn)),
        AluOp::And => push32(buf, enc_dp_reg(0b0000, false, rd, rn, rm)),
        AluOp::Or => push32(buf, enc_dp_reg(0b0010, false, rd, rn, rm)),
        AluOp::Xor => push32(buf, enc_dp_reg(0b0100, false, rd, rn, rm)),
        AluOp::Shl => push32(buf, enc_shift_reg(0b00, rd, rn, rm)),
        AluOp::Ushr => push32(buf, enc_shift_reg(0b01, rd, rn, rm)),
        AluOp::Shr => push32(buf, enc_shift_reg(0b10, rd, rn, rm)),
        AluOp::Mul => {
            // mul rd, rn, rm
            push32(
                buf,
                (0b111110110000 << 20) | (u32::from(rn) << 16) | (0b1111 << 12)
                    | (u32::from(rd) << 8)
                    | u32::from(rm),
            );
        }
        AluOp::Div => {
            // sdiv rd, rn, rm
            push32(
                buf,
                (0b111110111001 << 20) | (u32::from(rn) << 16) | (0b1111 << 12)
                    | (u32::from(rd) << 8)
                    | (0b1111 << 4)
                    | u32::from(rm),
            );
        }
        AluOp::Rem => {
            // sdiv scratch, rn, rm ; mls rd, scratch, rm, rn
            emit_alu_rrr(buf, AluOp::Div, SCRATCH, rn, rm);
            push32(
                buf,
                (0b111110110000 << 20) | (u32::from(SCRATCH) << 16) | (u32::from(rn) << 12)
                    | (u32::from(rd) << 8)
                    | (1 << 4)
                    | u32::from(rm),
            );
        }
        AluOp::Neg => {
            // rsb rd, rn, #0
            push32(buf, 0xf1c0_0000 | (u32::from(rn) << 16) | (u32::from(rd) << 8));
        }
        AluOp::Not => {
            // mvn rd, rm: orn family with rn=pc? MVN (register) T2:
            // 11101010011 S 1111 0 000 rd 0000 rm
            push32(
                buf,
                (0b1110101_0011_0 << 20) | (0b1111 << 16) | (u32::from(rd) << 8) | u32::from(rn),
            );
        }
        AluOp::Mov => {
            // mov rd, rm (orr rd, zr-like with rn=0b1111)
            push32(
                buf,
                (0b1110101_0010_0 << 20) | (0b1111 << 16) | (u32::from(rd) << 8) | u32::from(rm),
            );
        }
    }
}

fn alu_rri_insns(alu: AluOp, imm: i32) -> u32 {
    match alu {
        AluOp::Add | AluOp::Sub => {
            if (0..4096).contains(&imm.abs()) {
                1
            } else {
                const32_insns(imm) + 1
            }
        }
        AluOp::Shl | AluOp::Shr | AluOp::Ushr => 1,
        AluOp::Neg | AluOp::Not | AluOp::Mov => 1,
        _ => const32_insns(imm) + alu_rrr_insns(alu),
    }
}

fn emit_alu_rri(buf: &mut Vec<u8>, alu: AluOp, rd: u8, rn: u8, imm: i32) {
    match alu {
        AluOp::Add | AluOp::Sub => {
            let subtract = (alu == AluOp::Sub) != (imm < 0);
            let magnitude = imm.unsigned_abs();
            if magnitude < 4096 {
                // addw / subw (T4, plain imm12)
                let op6: u32 = if subtract { 0b101010 } else { 0b100000 };
                let i = (magnitude >> 11) & 1;
                let imm3 = (magnitude >> 8) & 7;
                let imm8 = magnitude & 0xff;
                push32(
                    buf,
                    (0b11110 << 27) | (i << 26) | (op6 << 20) | (u32::from(rn) << 16)
                        | (imm3 << 12)
                        | (u32::from(rd) << 8)
                        | imm8,
                );
            } else {
                emit_const32(buf, SCRATCH, imm);
                emit_alu_rrr(buf, alu, rd, rn, SCRATCH);
            }
        }
        AluOp::Shl | AluOp::Shr | AluOp::Ushr => {
            // Immediate shifts via the mov-shifted-register form.
            let imm5 = (imm as u32) & 31;
            let ty = match alu {
                AluOp::Shl => 0b00,
                AluOp::Ushr => 0b01,
                _ => 0b10,
            };
            let imm3 = (imm5 >> 2) & 7;
            let imm2 = imm5 & 3;
            push32(
                buf,
                (0b1110101_0010_0 << 20) | (0b1111 << 16) | (imm3 << 12) | (u32::from(rd) << 8)
                    | (imm2 << 6)
                    | (ty << 4)
                    | u32::from(rn),
            );
        }
        AluOp::Neg => emit_alu_rrr(buf, AluOp::Neg, rd, rn, rn),
        AluOp::Not => emit_alu_rrr(buf, AluOp::Not, rd, rn, rn),
        AluOp::Mov => emit_alu_rrr(buf, AluOp::Mov, rd, 0, rn),
        _ => {
            emit_const32(buf, SCRATCH, imm);
            emit_alu_rrr(buf, alu, rd, rn, SCRATCH);
        }
    }
}

fn cmp_imm_insns(imm: i32) -> u32 {
    if (0..256).contains(&imm) {
        1
    } else {
        const32_insns(imm) + 1
    }
}

fn emit_cmp_imm(buf: &mut Vec<u8>, rn: u8, imm: i32) {
    if (0..256).contains(&imm) {
        // cmp.w rn, #imm8
        push32(
            buf,
            (0b11110_0_0_1101_1 << 20) | (u32::from(rn) << 16) | (0b1111 << 8) | imm as u32,
        );
    } else {
        emit_const32(buf, SCRATCH, imm);
        emit_cmp_reg(buf, rn, SCRATCH);
    }
}

fn emit_cmp_reg(buf: &mut Vec<u8>, rn: u8, rm: u8) {
    // cmp.w rn, rm: sub family, S=1, rd=pc
    push32(buf, enc_dp_reg(0b1101, true, PC, rn, rm));
}

//=============================================================================
// Entry points

pub fn inst_size(lir: &Lir<ThumbOp>) -> u32 {
    let op = match lir.opcode {
        LirOp::Target(op) => op,
        LirOp::Pseudo(_) => return 0,
    };
    let ops = &lir.operands;
    match op {
        ThumbOp::LoadConst => const32_insns(ops[1]) * 4,
        ThumbOp::Load | ThumbOp::Store => ldst_insns(size_from_tag(ops[3]), ops[2]) * 4,
        ThumbOp::LoadIndexed | ThumbOp::StoreIndexed => 4,
        ThumbOp::Mov | ThumbOp::FpMov | ThumbOp::CoreToFp | ThumbOp::FpToCore => 4,
        ThumbOp::AluRRR => alu_rrr_insns(alu_from_tag(ops[0])) * 4,
        ThumbOp::AluRRI => alu_rri_insns(alu_from_tag(ops[0]), ops[3]) * 4,
        ThumbOp::FpRRR | ThumbOp::FpNeg | ThumbOp::Vcmp | ThumbOp::Vmrs | ThumbOp::Conv => 4,
        ThumbOp::CmpBr => 4 + if lir.flags.widened { 4 } else { 2 },
        ThumbOp::CmpImmBr => {
            cmp_imm_insns(ops[2]) * 4 + if lir.flags.widened { 4 } else { 2 }
        }
        ThumbOp::CondBr => {
            if lir.flags.widened {
                4
            } else {
                2
            }
        }
        ThumbOp::B => 4,
        ThumbOp::Blx => 2,
        ThumbOp::Bl => 4,
        ThumbOp::Bx | ThumbOp::MovPc => 2,
        // The short form reaches 4 KiB; the widened form builds the
        // pc-relative delta with movw/movt.
        ThumbOp::LoadPool => {
            if lir.flags.widened {
                16
            } else {
                4
            }
        }
        ThumbOp::Adr => 2,
        ThumbOp::TableDelta => 12,
        ThumbOp::Dmb => 4,
        ThumbOp::SpAdjust => {
            if ops[0].unsigned_abs() < 4096 {
                4
            } else {
                const32_insns(ops[0]) * 4 + 4
            }
        }
        ThumbOp::Spill | ThumbOp::Unspill => 4,
        ThumbOp::Ldrex | ThumbOp::Strex => 4,
        ThumbOp::Probe => const32_insns(super::STACK_PROBE_BYTES) * 4 + 4 + 4,
    }
}

pub fn encode(
    lir: &Lir<ThumbOp>,
    env: &AsmEnv<'_, ThumbOp>,
    buf: &mut Vec<u8>,
) -> Result<(), WidenRequest> {
    let op = match lir.opcode {
        LirOp::Target(op) => op,
        LirOp::Pseudo(_) => return Ok(()),
    };
    let ops = &lir.operands;
    let pc = lir.offset as i64;
    match op {
        ThumbOp::LoadConst => emit_const32(buf, reg(ops[0]), ops[1]),
        ThumbOp::Load => {
            emit_ldst(buf, true, size_from_tag(ops[3]), reg(ops[0]), reg(ops[1]), ops[2]);
        }
        ThumbOp::Store => {
            emit_ldst(buf, false, size_from_tag(ops[3]), reg(ops[0]), reg(ops[1]), ops[2]);
        }
        ThumbOp::LoadIndexed | ThumbOp::StoreIndexed => {
            let load = op == ThumbOp::LoadIndexed;
            let size = size_from_tag(ops[4]);
            // ldr rt, [rn, rm, lsl #scale]
            let base = match (size, load) {
                (OpSize::Word | OpSize::Ref, true) => 0xf850_0000u32,
                (OpSize::Word | OpSize::Ref, false) => 0xf840_0000,
                (OpSize::UnsignedByte, true) => 0xf810_0000,
                (OpSize::SignedByte, true) => 0xf910_0000,
                (OpSize::UnsignedHalf, true) => 0xf830_0000,
                (OpSize::SignedHalf, true) => 0xf930_0000,
                (OpSize::UnsignedByte | OpSize::SignedByte, false) => 0xf800_0000,
                (OpSize::UnsignedHalf | OpSize::SignedHalf, false) => 0xf820_0000,
                _ => unreachable!("fp indexed accesses are pre-added"),
            };
            push32(
                buf,
                base | (u32::from(reg(ops[1])) << 16) | (u32::from(reg(ops[0])) << 12)
                    | ((ops[3] as u32 & 3) << 4)
                    | u32::from(reg(ops[2])),
            );
        }
        ThumbOp::Mov => emit_alu_rrr(buf, AluOp::Mov, reg(ops[0]), 0, reg(ops[1])),
        ThumbOp::FpMov => {
            // vmov.f32 sd, sm
            let (sd, sm) = (reg(ops[0]), reg(ops[1]));
            push32(
                buf,
                0xeeb0_0a40
                    | ((u32::from(sd) & 1) << 22)
                    | ((u32::from(sd) >> 1) << 12)
                    | ((u32::from(sm) & 1) << 5)
                    | (u32::from(sm) >> 1),
            );
        }
        ThumbOp::CoreToFp => {
            // vmov sn, rt
            let (sn, rt) = (reg(ops[0]), reg(ops[1]));
            push32(
                buf,
                0xee00_0a10 | ((u32::from(sn) >> 1) << 16) | (u32::from(rt) << 12)
                    | ((u32::from(sn) & 1) << 7),
            );
        }
        ThumbOp::FpToCore => {
            let (rt, sn) = (reg(ops[0]), reg(ops[1]));
            push32(
                buf,
                0xee10_0a10 | ((u32::from(sn) >> 1) << 16) | (u32::from(rt) << 12)
                    | ((u32::from(sn) & 1) << 7),
            );
        }
        ThumbOp::AluRRR => emit_alu_rrr_flags(
            buf,
            alu_from_tag(ops[0]),
            reg(ops[1]),
            reg(ops[2]),
            reg(ops[3]),
            ops[4] != 0,
        ),
        ThumbOp::AluRRI => emit_alu_rri(buf, alu_from_tag(ops[0]), reg(ops[1]), reg(ops[2]), ops[3]),
        ThumbOp::FpRRR => {
            let double = ops[4] != 0;
            let (vd, vn, vm) = (reg(ops[1]), reg(ops[2]), reg(ops[3]));
            let opcode = match ops[0] {
                0 => 0x0e30_0a00u32, // vadd
                1 => 0x0e30_0a40,    // vsub
                2 => 0x0e20_0a00,    // vmul
                _ => 0x0e80_0a00,    // vdiv
            };
            push32(buf, 0xe000_0000 | opcode | vfp_fields(vd, vn, vm, double));
        }
        ThumbOp::FpNeg => {
            let double = ops[2] != 0;
            let (vd, vm) = (reg(ops[0]), reg(ops[1]));
            push32(buf, 0xeeb1_0a40 | vfp_dm_fields(vd, vm, double));
        }
        ThumbOp::Vcmp => {
            let double = ops[2] != 0;
            let (vd, vm) = (reg(ops[0]), reg(ops[1]));
            push32(buf, 0xeeb4_0a40 | vfp_dm_fields(vd, vm, double));
        }
        ThumbOp::Vmrs => push32(buf, 0xeef1_fa10),
        ThumbOp::Conv => emit_conversion(buf, ops),
        ThumbOp::CmpBr => {
            emit_cmp_reg(buf, reg(ops[1]), reg(ops[2]));
            let target = env.label_offset(lir.target.expect("branch without target"));
            emit_cond_branch(buf, lir, cond_bits(ops[0]), pc + 4, target)?;
        }
        ThumbOp::CmpImmBr => {
            let cmp_len = i64::from(cmp_imm_insns(ops[2]) * 4);
            emit_cmp_imm(buf, reg(ops[1]), ops[2]);
            let target = env.label_offset(lir.target.expect("branch without target"));
            emit_cond_branch(buf, lir, cond_bits(ops[0]), pc + cmp_len, target)?;
        }
        ThumbOp::CondBr => {
            let target = env.label_offset(lir.target.expect("branch without target"));
            emit_cond_branch(buf, lir, ops[0] as u32, pc, target)?;
        }
        ThumbOp::B => {
            let target = env.label_offset(lir.target.expect("branch without target"));
            let disp = i64::from(target) - (pc + 4);
            push32(buf, enc_b_t4(disp as i32));
        }
        ThumbOp::Blx => {
            push16(buf, 0x4780 | (u16::from(reg(ops[0])) << 3));
        }
        ThumbOp::Bl => {
            // Displacement zero; patched by the linker.
            push32(buf, 0xf000_f800);
        }
        ThumbOp::Bx => push16(buf, 0x4700 | (u16::from(reg(ops[0])) << 3)),
        ThumbOp::LoadPool => {
            let base = env.pool_base[ops[1] as usize] + ops[2] as u32 * 4;
            if !lir.flags.widened {
                // ldr.w rt, [pc, #imm12]; pc reads as align4(insn + 4).
                let pc_val = (pc + 4) & !3;
                let disp = i64::from(base) - pc_val;
                if !(0..4096).contains(&disp) {
                    return Err(WidenRequest);
                }
                push32(
                    buf,
                    0xf8df_0000 | (u32::from(reg(ops[0])) << 12) | (disp as u32),
                );
            } else {
                // movw/movt delta, add pc, then load through the register.
                let rd = reg(ops[0]);
                emit_adr_long(buf, pc, base, rd);
                push32(
                    buf,
                    ldst_base(OpSize::Word, true) | (u32::from(rd) << 16)
                        | (u32::from(rd) << 12),
                );
            }
        }
        ThumbOp::Adr => {
            // mov rd, pc (T1 high-register form): rd = anchor + 4.
            let rd = reg(ops[0]);
            push16(
                buf,
                0x4600 | (u16::from(rd >> 3) << 7) | (u16::from(PC) << 3) | u16::from(rd & 7),
            );
        }
        ThumbOp::TableDelta => {
            let table_offset = if ops[2] == 0 {
                env.switch_table_offsets[ops[3] as usize]
            } else {
                env.fill_array_offsets[ops[3] as usize]
            };
            let anchor = lir.target.expect("table delta without an anchor");
            let reference = crate::backend::assemble::table_reference_offset(
                crate::options::InstructionSet::Thumb2,
                env.lirs[anchor].offset,
                table_offset,
            );
            let delta = table_offset.wrapping_sub(reference);
            push32(buf, enc_movw(SCRATCH, delta & 0xffff));
            push32(buf, enc_movt(SCRATCH, delta >> 16));
            push32(buf, enc_dp_reg(0b1000, false, reg(ops[0]), reg(ops[1]), SCRATCH));
        }
        ThumbOp::MovPc => {
            // mov pc, rm: a Thumb-state branch to the computed target.
            push16(buf, 0x4687 | (u16::from(reg(ops[0])) << 3));
        }
        ThumbOp::Dmb => push32(buf, 0xf3bf_8f5b), // dmb ish
        ThumbOp::SpAdjust => {
            let delta = ops[0];
            if delta.unsigned_abs() < 4096 {
                emit_alu_rri(buf, if delta < 0 { AluOp::Sub } else { AluOp::Add }, 13, 13, delta.abs());
            } else {
                emit_const32(buf, SCRATCH, delta);
                emit_alu_rrr(buf, AluOp::Add, 13, 13, SCRATCH);
            }
        }
        ThumbOp::Spill | ThumbOp::Unspill => {
            let storage = RegStorage::from_bits(ops[0] as u16);
            let load = op == ThumbOp::Unspill;
            if storage.is_float() {
                emit_vldst(buf, load, false, storage.reg_num(), 13, ops[1]);
            } else {
                emit_ldst(buf, load, OpSize::Word, storage.reg_num(), 13, ops[1]);
            }
        }
        ThumbOp::Ldrex => {
            // ldrex rt, [rn]
            push32(
                buf,
                0xe850_0f00 | (u32::from(reg(ops[1])) << 16) | (u32::from(reg(ops[0])) << 12),
            );
        }
        ThumbOp::Strex => {
            // strex rd, rt, [rn]
            push32(
                buf,
                0xe840_0000 | (u32::from(reg(ops[2])) << 16) | (u32::from(reg(ops[1])) << 12)
                    | (u32::from(reg(ops[0])) << 8),
            );
        }
        ThumbOp::Probe => {
            emit_const32(buf, SCRATCH, super::STACK_PROBE_BYTES);
            emit_alu_rrr(buf, AluOp::Sub, SCRATCH, 13, SCRATCH);
            push32(
                buf,
                ldst_base(OpSize::Word, true) | (u32::from(SCRATCH) << 16)
                    | (u32::from(SCRATCH) << 12),
            );
        }
    }
    Ok(())
}

/// Long-form address materialization: `movw`/`movt` the delta from the
/// PC value of the final `add`, then `add rd, pc, rd`. Always three
/// instructions so the size is displacement-independent.
fn emit_adr_long(buf: &mut Vec<u8>, lir_pc: i64, target_offset: u32, rd: u8) {
    // The add reads pc as its own address + 4.
    let add_pc = lir_pc + 8;
    let delta = (i64::from(target_offset) - (add_pc + 4)) as i64 as u32;
    push32(buf, enc_movw(rd, delta & 0xffff));
    push32(buf, enc_movt(rd, delta >> 16));
    push32(buf, enc_dp_reg(0b1000, false, rd, PC, rd));
}

fn vfp_fields(vd: u8, vn: u8, vm: u8, double: bool) -> u32 {
    if double {
        ((u32::from(vd) >> 4) << 22)
            | ((u32::from(vn) & 0xf) << 16)
            | ((u32::from(vd) & 0xf) << 12)
            | (1 << 8)
            | ((u32::from(vn) >> 4) << 7)
            | ((u32::from(vm) >> 4) << 5)
            | (u32::from(vm) & 0xf)
    } else {
        ((u32::from(vd) & 1) << 22)
            | ((u32::from(vn) >> 1) << 16)
            | ((u32::from(vd) >> 1) << 12)
            | ((u32::from(vn) & 1) << 7)
            | ((u32::from(vm) & 1) << 5)
            | (u32::from(vm) >> 1)
    }
}

fn vfp_dm_fields(vd: u8, vm: u8, double: bool) -> u32 {
    if double {
        ((u32::from(vd) >> 4) << 22) | ((u32::from(vd) & 0xf) << 12) | (1 << 8)
            | ((u32::from(vm) >> 4) << 5)
            | (u32::from(vm) & 0xf)
    } else {
        ((u32::from(vd) & 1) << 22) | ((u32::from(vd) >> 1) << 12)
            | ((u32::from(vm) & 1) << 5)
            | (u32::from(vm) >> 1)
    }
}

fn enc_b_t4(disp: i32) -> u32 {
    let imm = (disp >> 1) as u32;
    let s = (imm >> 23) & 1;
    let i1 = (imm >> 22) & 1;
    let i2 = (imm >> 21) & 1;
    let j1 = (!(i1 ^ s)) & 1;
    let j2 = (!(i2 ^ s)) & 1;
    let imm10 = (imm >> 11) & 0x3ff;
    let imm11 = imm & 0x7ff;
    (0b11110 << 27) | (s << 26) | (imm10 << 16) | (0b10 << 14) | (j1 << 13) | (1 << 12)
        | (j2 << 11)
        | imm11
}

fn emit_cond_branch(
    buf: &mut Vec<u8>,
    lir: &Lir<ThumbOp>,
    cond: u32,
    branch_pc: i64,
    target: u32,
) -> Result<(), WidenRequest> {
    // The PC reads four bytes ahead of the branch instruction.
    let disp = i64::from(target) - (branch_pc + 4);
    if !lir.flags.widened {
        if !(-256..256).contains(&disp) {
            return Err(WidenRequest);
        }
        // b<cond> T1
        push16(buf, 0xd000 | ((cond as u16) << 8) | (((disp >> 1) as u16) & 0xff));
    } else {
        // b<cond> T3
        if !(-(1 << 20)..(1 << 20)).contains(&disp) {
            return Err(WidenRequest);
        }
        let imm = (disp >> 1) as u32;
        let s = (imm >> 19) & 1;
        let j2 = (imm >> 18) & 1;
        let j1 = (imm >> 17) & 1;
        let imm6 = (imm >> 11) & 0x3f;
        let imm11 = imm & 0x7ff;
        push32(
            buf,
            (0b11110 << 27) | (s << 26) | (cond << 22) | (imm6 << 16) | (0b10 << 14)
                | (j1 << 13)
                | (j2 << 11)
                | imm11,
        );
    }
    Ok(())
}

fn emit_conversion(buf: &mut Vec<u8>, ops: &[i32; 5]) {
    let (rd, rn) = (reg(ops[1]), reg(ops[2]));
    match ops[0] {
        // I2B: sxtb
        12 => push32(buf, 0xfa4f_f080 | (u32::from(rd) << 8) | u32::from(rn)),
        // I2C: uxth
        13 => push32(buf, 0xfa1f_f080 | (u32::from(rd) << 8) | u32::from(rn)),
        // I2S: sxth
        14 => push32(buf, 0xfa0f_f080 | (u32::from(rd) << 8) | u32::from(rn)),
        // vcvt family: the target hook routes everything else here with
        // the VFP opcode preassembled in operand 3.
        _ => push32(buf, ops[3] as u32),
    }
}

#[cfg(test)]
mod emit_tests {
    use super::*;
    use crate::backend::lir::Lir;

    fn lir(op: ThumbOp, operands: [i32; 5]) -> Lir<ThumbOp> {
        let mut l = Lir::new(LirOp::Target(op), 0);
        l.operands = operands;
        l
    }

    fn encode_one(l: &Lir<ThumbOp>) -> Vec<u8> {
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

    #[test]
    fn movw_r0() {
        let rd = i32::from(RegStorage::solo32(0).bits());
        let bytes = encode_one(&lir(ThumbOp::LoadConst, [rd, 0x1234, 0, 0, 0]));
        // movw r0, #0x1234 => f241 3034
        assert_eq!(bytes, [0x41, 0xf2, 0x34, 0x30]);
    }

    #[test]
    fn blx_is_16_bit() {
        let rm = i32::from(RegStorage::solo32(14).bits());
        let l = lir(ThumbOp::Blx, [rm, 0, 0, 0, 0]);
        assert_eq!(encode_one(&l).len(), 2);
        assert_eq!(inst_size(&l), 2);
    }

    #[test]
    fn sizes_match_for_loads() {
        let rt = i32::from(RegStorage::solo32(0).bits());
        let rn = i32::from(RegStorage::solo32(1).bits());
        for disp in [0, 64, 4095, 4096, -8] {
            let l = lir(ThumbOp::Load, [rt, rn, disp, size_tag(OpSize::Word), 0]);
            assert_eq!(encode_one(&l).len() as u32, inst_size(&l), "disp={disp}");
        }
    }
}
