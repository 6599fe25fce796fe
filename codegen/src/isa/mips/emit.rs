//! MIPS32 binary encoding. Every instruction is four bytes; branches and
//! jumps are followed by an explicit `nop` delay slot, counted as part of
//! the macro instruction.

use crate::backend::assemble::{AsmEnv, WidenRequest};
use crate::backend::lir::{Lir, LirOp};
use crate::backend::regs::RegStorage;
use crate::backend::{AluOp, Cond, ConvKind, OpSize};

use super::regs::{AT, RA, ZERO};
use super::MipsOp;

fn reg(bits: i32) -> u32 {
    u32::from(RegStorage::from_bits(bits as u16).reg_num())
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

pub(super) fn conv_tag(kind: ConvKind) -> i32 {
    kind as i32
}

fn push32(buf: &mut Vec<u8>, word: u32) {
    buf.extend_from_slice(&word.to_le_bytes());
}

//=============================================================================
// Field assemblers

fn r_type(funct: u32, rd: u32, rs: u32, rt: u32) -> u32 {
    (rs << 21) | (rt << 16) | (rd << 11) | funct
}

fn r_shift(funct: u32, rd: u32, rt: u32, sa: u32) -> u32 {
    (rt << 16) | (rd << 11) | (sa << 6) | funct
}

fn i_type(opcode: u32, rt: u32, rs: u32, imm16: u32) -> u32 {
    (opcode << 26) | (rs << 21) | (rt << 16) | (imm16 & 0xffff)
}

fn nop(buf: &mut Vec<u8>) {
    push32(buf, 0);
}

fn const32_insns(value: i32) -> u32 {
    if (-32768..32768).contains(&value) || value as u32 >> 16 == 0 {
        1
    } else {
        2
    }
}

fn emit_const32(buf: &mut Vec<u8>, rd: u32, value: i32) {
    if (-32768..32768).contains(&value) {
        // addiu rd, zero, imm
        push32(buf, i_type(0x09, rd, u32::from(ZERO), value as u32));
    } else if value as u32 >> 16 == 0 {
        // ori rd, zero, imm
        push32(buf, i_type(0x0d, rd, u32::from(ZERO), value as u32));
    } else {
        // lui + ori
        push32(buf, i_type(0x0f, rd, 0, (value as u32) >> 16));
        push32(buf, i_type(0x0d, rd, rd, value as u32 & 0xffff));
    }
}

fn ldst_opcode(size: OpSize, load: bool) -> u32 {
    match (size, load) {
        (OpSize::Word | OpSize::Ref, true) => 0x23,  // lw
        (OpSize::Word | OpSize::Ref, false) => 0x2b, // sw
        (OpSize::UnsignedByte, true) => 0x24,        // lbu
        (OpSize::SignedByte, true) => 0x20,          // lb
        (OpSize::UnsignedHalf, true) => 0x25,        // lhu
        (OpSize::SignedHalf, true) => 0x21,          // lh
        (OpSize::UnsignedByte | OpSize::SignedByte, false) => 0x28, // sb
        (OpSize::UnsignedHalf | OpSize::SignedHalf, false) => 0x29, // sh
        (OpSize::Single, true) => 0x31,              // lwc1
        (OpSize::Single, false) => 0x39,             // swc1
        (OpSize::Double, true) => 0x35,              // ldc1
        (OpSize::Double, false) => 0x3d,             // sdc1
    }
}

fn ldst_insns(disp: i32) -> u32 {
    if (-32768..32768).contains(&disp) {
        1
    } else {
        const32_insns(disp) + 2
    }
}

fn emit_ldst(buf: &mut Vec<u8>, load: bool, size: OpSize, rt: u32, base: u32, disp: i32) {
    if (-32768..32768).contains(&disp) {
        push32(buf, i_type(ldst_opcode(size, load), rt, base, disp as u32));
    } else {
        emit_const32(buf, u32::from(AT), disp);
        push32(buf, r_type(0x21, u32::from(AT), base, u32::from(AT))); // addu
        push32(buf, i_type(ldst_opcode(size, load), rt, u32::from(AT), 0));
    }
}

fn alu_insns(alu: AluOp) -> u32 {
    match alu {
        // div writes HI/LO; the result moves out separately.
        AluOp::Div | AluOp::Rem => 2,
        // adc/sbc synthesize the carry through sltu.
        AluOp::Adc | AluOp::Sbc => 3,
        _ => 1,
    }
}

fn emit_alu_rrr(buf: &mut Vec<u8>, alu: AluOp, rd: u32, rn: u32, rm: u32) {
    match alu {
        AluOp::Add => push32(buf, r_type(0x21, rd, rn, rm)), // addu
        AluOp::Sub => push32(buf, r_type(0x23, rd, rn, rm)), // subu
        AluOp::Rsub => push32(buf, r_type(0x23, rd, rm, rn)),
        AluOp::And => push32(buf, r_type(0x24, rd, rn, rm)),
        AluOp::Or => push32(buf, r_type(0x25, rd, rn, rm)),
        AluOp::Xor => push32(buf, r_type(0x26, rd, rn, rm)),
        AluOp::Shl => push32(buf, r_type(0x04, rd, rm, rn)), // sllv rd, rn, rm
        AluOp::Ushr => push32(buf, r_type(0x06, rd, rm, rn)), // srlv
        AluOp::Shr => push32(buf, r_type(0x07, rd, rm, rn)), // srav
        AluOp::Mul => push32(buf, (0x1c << 26) | r_type(0x02, rd, rn, rm)), // mul (R2)
        AluOp::Div => {
            push32(buf, r_type(0x1a, 0, rn, rm)); // div rn, rm
            push32(buf, r_shift(0x12, rd, 0, 0)); // mflo rd
        }
        AluOp::Rem => {
            push32(buf, r_type(0x1a, 0, rn, rm));
            push32(buf, r_shift(0x10, rd, 0, 0)); // mfhi rd
        }
        AluOp::Adc => {
            // rd = rn + rm + carry(previous low add): the wide lowering
            // computes the carry into AT beforehand.
            push32(buf, r_type(0x21, rd, rn, rm));
            push32(buf, r_type(0x21, rd, rd, u32::from(AT)));
            nop(buf);
        }
        AluOp::Sbc => {
            push32(buf, r_type(0x23, rd, rn, rm));
            push32(buf, r_type(0x23, rd, rd, u32::from(AT)));
            nop(buf);
        }
        AluOp::Neg => push32(buf, r_type(0x23, rd, u32::from(ZERO), rn)),
        AluOp::Not => push32(buf, r_type(0x27, rd, rn, u32::from(ZERO))), // nor
        AluOp::Mov => push32(buf, r_type(0x25, rd, rn, u32::from(ZERO))),
    }
}

fn alu_rri_insns(alu: AluOp, imm: i32) -> u32 {
    match alu {
        AluOp::Add | AluOp::Sub if (-32768..32768).contains(&imm) => 1,
        AluOp::And | AluOp::Or | AluOp::Xor if imm as u32 >> 16 == 0 && imm >= 0 => 1,
        AluOp::Shl | AluOp::Shr | AluOp::Ushr => 1,
        AluOp::Neg | AluOp::Not | AluOp::Mov => 1,
        _ => const32_insns(imm) + alu_insns(alu),
    }
}

fn emit_alu_rri(buf: &mut Vec<u8>, alu: AluOp, rd: u32, rn: u32, imm: i32) {
    match alu {
        AluOp::Add if (-32768..32768).contains(&imm) => {
            push32(buf, i_type(0x09, rd, rn, imm as u32));
        }
        AluOp::Sub if (-32768..32768).contains(&imm) && imm != i32::MIN => {
            push32(buf, i_type(0x09, rd, rn, (-imm) as u32));
        }
        AluOp::And if imm as u32 >> 16 == 0 && imm >= 0 => {
            push32(buf, i_type(0x0c, rd, rn, imm as u32));
        }
        AluOp::Or if imm as u32 >> 16 == 0 && imm >= 0 => {
            push32(buf, i_type(0x0d, rd, rn, imm as u32));
        }
        AluOp::Xor if imm as u32 >> 16 == 0 && imm >= 0 => {
            push32(buf, i_type(0x0e, rd, rn, imm as u32));
        }
        AluOp::Shl => push32(buf, r_shift(0x00, rd, rn, imm as u32 & 31)),
        AluOp::Ushr => push32(buf, r_shift(0x02, rd, rn, imm as u32 & 31)),
        AluOp::Shr => push32(buf, r_shift(0x03, rd, rn, imm as u32 & 31)),
        AluOp::Neg | AluOp::Not => emit_alu_rrr(buf, alu, rd, rn, rn),
        AluOp::Mov => emit_alu_rrr(buf, AluOp::Mov, rd, rn, rn),
        _ => {
            emit_const32(buf, u32::from(AT), imm);
            emit_alu_rrr(buf, alu, rd, rn, u32::from(AT));
        }
    }
}

/// `(need_slt, swap, branch_on_true)` for lowering a condition to
/// slt/beq/bne.
fn branch_plan(tag: i32) -> (Option<bool>, bool, bool) {
    match tag {
        0 => (None, false, true),         // eq: beq
        1 => (None, false, false),        // ne: bne
        2 => (Some(false), false, true),  // lt: slt a,b ; bne
        3 => (Some(false), false, false), // ge: slt a,b ; beq
        4 => (Some(false), true, true),   // gt: slt b,a ; bne
        5 => (Some(false), true, false),  // le: slt b,a ; beq
        6 => (Some(true), false, true),   // ult
        7 => (Some(true), false, false),  // uge
        _ => unreachable!(),
    }
}

pub(super) fn cmp_branch_insns(tag: i32) -> u32 {
    let (slt, _, _) = branch_plan(tag);
    (if slt.is_some() { 1 } else { 0 }) + 1 + 1 // [slt] + branch + delay nop
}

fn emit_cmp_branch(
    buf: &mut Vec<u8>,
    tag: i32,
    rn: u32,
    rm: u32,
    branch_pc: i64,
    target: u32,
) -> Result<(), WidenRequest> {
    let (slt, swap, on_true) = branch_plan(tag);
    let (mut a, mut b) = (rn, rm);
    if swap {
        std::mem::swap(&mut a, &mut b);
    }
    let (cmp_a, cmp_b) = if let Some(unsigned) = slt {
        let funct = if unsigned { 0x2b } else { 0x2a };
        push32(buf, r_type(funct, u32::from(AT), a, b));
        (u32::from(AT), u32::from(ZERO))
    } else {
        (a, b)
    };
    // Branch displacement counts from the delay slot.
    let branch_end = branch_pc + i64::from(cmp_branch_insns(tag) * 4) - 4;
    let disp_insns = (i64::from(target) - branch_end) >> 2;
    if !(-32768..32768).contains(&disp_insns) {
        return Err(WidenRequest);
    }
    let opcode = if on_true { 0x05 } else { 0x04 }; // bne / beq
    push32(buf, i_type(opcode, cmp_b, cmp_a, disp_insns as u32));
    nop(buf);
    Ok(())
}

//=============================================================================
// Entry points

pub fn inst_size(lir: &Lir<MipsOp>) -> u32 {
    let op = match lir.opcode {
        LirOp::Target(op) => op,
        LirOp::Pseudo(_) => return 0,
    };
    let ops = &lir.operands;
    let insns = match op {
        MipsOp::LoadConst => const32_insns(ops[1]),
        MipsOp::Load | MipsOp::Store => ldst_insns(ops[2]),
        MipsOp::LoadIndexed | MipsOp::StoreIndexed => 3,
        MipsOp::Mov | MipsOp::FpMov | MipsOp::Mtc1 | MipsOp::Mfc1 => 1,
        MipsOp::AluRRR => alu_insns(alu_from_tag(ops[0])),
        MipsOp::AluRRI => alu_rri_insns(alu_from_tag(ops[0]), ops[3]),
        MipsOp::FpRRR | MipsOp::FpNeg | MipsOp::Conv => 1,
        MipsOp::FpCmpBr => 2, // c.cond + bc1t/f, delay filled by caller op
        MipsOp::Sltu => 1,
        MipsOp::CmpBr => {
            let base = cmp_branch_insns(ops[0]);
            base
        }
        MipsOp::CmpImmBr => {
            let imm = ops[2];
            let setup = if imm == 0 { 0 } else { const32_insns(imm) };
            setup + cmp_branch_insns(ops[0])
        }
        MipsOp::B => 2,
        MipsOp::Jalr | MipsOp::Jr => 2,
        MipsOp::Bal => 2,
        MipsOp::LoadPool => 2 + 2, // bal+nop, addiu/lw via ra
        MipsOp::TableAnchor => 3,  // bal+nop, addiu rd, ra, -8
        MipsOp::TableDelta => 3,   // lui+ori+addu
        MipsOp::Sync => 1,
        MipsOp::SpAdjust => 1,
        MipsOp::Spill | MipsOp::Unspill => 1,
        MipsOp::Probe => const32_insns(super::STACK_PROBE_BYTES) + 2,
    };
    insns * 4
}

pub fn encode(
    lir: &Lir<MipsOp>,
    env: &AsmEnv<'_, MipsOp>,
    buf: &mut Vec<u8>,
) -> Result<(), WidenRequest> {
    let op = match lir.opcode {
        LirOp::Target(op) => op,
        LirOp::Pseudo(_) => return Ok(()),
    };
    let ops = &lir.operands;
    let pc = lir.offset as i64;
    match op {
        MipsOp::LoadConst => emit_const32(buf, reg(ops[0]), ops[1]),
        MipsOp::Load => {
            emit_ldst(buf, true, size_from_tag(ops[3]), reg(ops[0]), reg(ops[1]), ops[2]);
        }
        MipsOp::Store => {
            emit_ldst(buf, false, size_from_tag(ops[3]), reg(ops[0]), reg(ops[1]), ops[2]);
        }
        MipsOp::LoadIndexed | MipsOp::StoreIndexed => {
            let load = op == MipsOp::LoadIndexed;
            // sll at, index, scale ; addu at, base, at ; l/s rt, 0(at)
            push32(buf, r_shift(0x00, u32::from(AT), reg(ops[2]), ops[3] as u32 & 31));
            push32(buf, r_type(0x21, u32::from(AT), reg(ops[1]), u32::from(AT)));
            push32(buf, i_type(ldst_opcode(size_from_tag(ops[4]), load), reg(ops[0]), u32::from(AT), 0));
        }
        MipsOp::Mov => emit_alu_rrr(buf, AluOp::Mov, reg(ops[0]), reg(ops[1]), reg(ops[1])),
        MipsOp::FpMov => {
            // mov.s fd, fs
            push32(buf, (0x11 << 26) | (0x10 << 21) | (reg(ops[1]) << 11) | (reg(ops[0]) << 6) | 0x06);
        }
        MipsOp::Mtc1 => {
            push32(buf, (0x11 << 26) | (0x04 << 21) | (reg(ops[1]) << 16) | (reg(ops[0]) << 11));
        }
        MipsOp::Mfc1 => {
            push32(buf, (0x11 << 26) | (reg(ops[0]) << 16) | (reg(ops[1]) << 11));
        }
        MipsOp::AluRRR => {
            emit_alu_rrr(buf, alu_from_tag(ops[0]), reg(ops[1]), reg(ops[2]), reg(ops[3]));
        }
        MipsOp::AluRRI => {
            emit_alu_rri(buf, alu_from_tag(ops[0]), reg(ops[1]), reg(ops[2]), ops[3]);
        }
        MipsOp::FpRRR => {
            let fmt = if ops[4] != 0 { 0x11 } else { 0x10 };
            let funct = match ops[0] {
                0 => 0x00, // add
                1 => 0x01, // sub
                2 => 0x02, // mul
                _ => 0x03, // div
            };
            push32(
                buf,
                (0x11 << 26) | (fmt << 21) | (reg(ops[3]) << 16) | (reg(ops[2]) << 11)
                    | (reg(ops[1]) << 6)
                    | funct,
            );
        }
        MipsOp::FpNeg => {
            let fmt = if ops[2] != 0 { 0x11 } else { 0x10 };
            push32(
                buf,
                (0x11 << 26) | (fmt << 21) | (reg(ops[1]) << 11) | (reg(ops[0]) << 6) | 0x07,
            );
        }
        MipsOp::FpCmpBr => {
            // c.cond.fmt fs, ft ; bc1t/bc1f target (delay slot is the
            // next emitted instruction; callers place a Mov there).
            let fmt = if ops[3] != 0 { 0x11 } else { 0x10 };
            let cond = ops[0] as u32; // raw c.cond code
            push32(buf, (0x11 << 26) | (fmt << 21) | (reg(ops[2]) << 16) | (reg(ops[1]) << 11) | 0x30 | cond);
            let target = env.label_offset(lir.target.expect("fp branch without target"));
            let disp_insns = (i64::from(target) - (pc + 8)) >> 2;
            if !(-32768..32768).contains(&disp_insns) {
                return Err(WidenRequest);
            }
            let on_true = ops[4] != 0;
            push32(
                buf,
                (0x11 << 26) | (0x08 << 21) | (u32::from(on_true) << 16) | (disp_insns as u32 & 0xffff),
            );
        }
        MipsOp::CmpBr => {
            let target = env.label_offset(lir.target.expect("branch without target"));
            emit_cmp_branch(buf, ops[0], reg(ops[1]), reg(ops[2]), pc, target)?;
        }
        MipsOp::CmpImmBr => {
            let imm = ops[2];
            let mut branch_pc = pc;
            let rn = if imm == 0 {
                reg(ops[1])
            } else {
                emit_const32(buf, u32::from(AT), imm);
                branch_pc += i64::from(const32_insns(imm) * 4);
                u32::from(AT)
            };
            let rm = if imm == 0 { u32::from(ZERO) } else { reg(ops[1]) };
            let (a, b) = if imm == 0 { (rn, rm) } else { (rm, rn) };
            let target = env.label_offset(lir.target.expect("branch without target"));
            emit_cmp_branch(buf, ops[0], a, b, branch_pc, target)?;
        }
        MipsOp::B => {
            let target = env.label_offset(lir.target.expect("branch without target"));
            let disp_insns = (i64::from(target) - (pc + 4)) >> 2;
            if !(-32768..32768).contains(&disp_insns) {
                return Err(WidenRequest);
            }
            push32(buf, i_type(0x04, u32::from(ZERO), u32::from(ZERO), disp_insns as u32));
            nop(buf);
        }
        MipsOp::Jalr => {
            push32(buf, r_type(0x09, u32::from(RA), reg(ops[0]), 0));
            nop(buf);
        }
        MipsOp::Jr => {
            push32(buf, r_type(0x08, 0, reg(ops[0]), 0));
            nop(buf);
        }
        MipsOp::Bal => {
            // bal with zero displacement; patched by the linker.
            push32(buf, i_type(0x01, 0x11, 0, 0));
            nop(buf);
        }
        MipsOp::LoadPool => {
            let base = env.pool_base[ops[1] as usize] + ops[2] as u32 * 4;
            emit_pc_relative_load(buf, pc, base, reg(ops[0]))?;
        }
        MipsOp::TableAnchor => {
            // bal +0 ; nop leaves the anchor's address plus eight in ra.
            push32(buf, i_type(0x01, 0x11, 0, 0));
            nop(buf);
            push32(buf, i_type(0x09, reg(ops[0]), u32::from(RA), (-8i32) as u32));
        }
        MipsOp::TableDelta => {
            let table = if ops[2] == 0 {
                env.switch_table_offsets[ops[3] as usize]
            } else {
                env.fill_array_offsets[ops[3] as usize]
            };
            let anchor = lir.target.expect("table delta without an anchor");
            let reference = crate::backend::assemble::table_reference_offset(
                crate::options::InstructionSet::Mips,
                env.lirs[anchor].offset,
                table,
            );
            let delta = table.wrapping_sub(reference);
            push32(buf, i_type(0x0f, u32::from(AT), 0, delta >> 16));
            push32(buf, i_type(0x0d, u32::from(AT), u32::from(AT), delta & 0xffff));
            push32(buf, r_type(0x21, reg(ops[0]), reg(ops[1]), u32::from(AT)));
        }
        MipsOp::Sltu => {
            push32(buf, r_type(0x2b, u32::from(AT), reg(ops[0]), reg(ops[1])));
        }
        MipsOp::Sync => push32(buf, 0x0000_000f),
        MipsOp::SpAdjust => {
            push32(buf, i_type(0x09, u32::from(super::regs::SP), u32::from(super::regs::SP), ops[0] as u32));
        }
        MipsOp::Spill | MipsOp::Unspill => {
            let storage = RegStorage::from_bits(ops[0] as u16);
            let load = op == MipsOp::Unspill;
            let size = if storage.is_float() { OpSize::Single } else { OpSize::Word };
            push32(
                buf,
                i_type(
                    ldst_opcode(size, load),
                    u32::from(storage.reg_num()),
                    u32::from(super::regs::SP),
                    ops[1] as u32,
                ),
            );
        }
        MipsOp::Probe => {
            emit_const32(buf, u32::from(AT), super::STACK_PROBE_BYTES);
            push32(buf, r_type(0x23, u32::from(AT), u32::from(super::regs::SP), u32::from(AT)));
            push32(buf, i_type(0x23, u32::from(AT), u32::from(AT), 0));
        }
        MipsOp::Conv => {
            // Preassembled COP1 word from the target hook.
            push32(buf, ops[3] as u32);
        }
    }
    Ok(())
}

/// `bal +0 ; nop` leaves the address of `bal + 8` in `ra`; adjust into
/// `rd` and load the pool word through it.
fn emit_pc_relative_load(
    buf: &mut Vec<u8>,
    pc: i64,
    target_offset: u32,
    rd: u32,
) -> Result<(), WidenRequest> {
    push32(buf, i_type(0x01, 0x11, 0, 0)); // bal .+4
    nop(buf);
    let ra_value = pc + 8;
    let delta = i64::from(target_offset) - ra_value;
    if !(-32768..32768).contains(&delta) {
        return Err(WidenRequest);
    }
    // addiu rd, ra, delta ; lw rd, 0(rd)
    push32(buf, i_type(0x09, rd, u32::from(RA), delta as u32));
    push32(buf, i_type(0x23, rd, rd, 0));
    Ok(())
}

#[cfg(test)]
mod emit_tests {
    use super::*;
    use crate::backend::lir::Lir;

    fn lir(op: MipsOp, operands: [i32; 5]) -> Lir<MipsOp> {
        let mut l = Lir::new(LirOp::Target(op), 0);
        l.operands = operands;
        l
    }

    fn encode_one(l: &Lir<MipsOp>) -> Vec<u8> {
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
    fn addiu_constant() {
        let rd = i32::from(RegStorage::solo32(8).bits());
        let bytes = encode_one(&lir(MipsOp::LoadConst, [rd, 5, 0, 0, 0]));
        // addiu t0, zero, 5
        assert_eq!(u32::from_le_bytes(bytes.try_into().unwrap()), 0x2408_0005);
    }

    #[test]
    fn lw_and_sizes() {
        let rt = i32::from(RegStorage::solo32(8).bits());
        let base = i32::from(RegStorage::solo32(29).bits());
        for disp in [0, 16, 40000] {
            let l = lir(MipsOp::Load, [rt, base, disp, size_tag(OpSize::Word), 0]);
            assert_eq!(encode_one(&l).len() as u32, inst_size(&l), "disp={disp}");
        }
    }

    #[test]
    fn branches_have_delay_slots() {
        // Branch to self keeps the displacement in range.
        let l = lir(MipsOp::Jr, [i32::from(RegStorage::solo32(31).bits()), 0, 0, 0, 0]);
        let bytes = encode_one(&l);
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[4..], [0, 0, 0, 0]);
    }
}
