//! x86 / x86-64 binary encoding.
//!
//! Branches always use their rel32 forms, so instruction sizes never
//! depend on displacement values and the assembler converges in one pass.
//! The 32-bit encoder reaches PC-relative data with the call/pop idiom;
//! the 64-bit encoder uses RIP-relative addressing.

use crate::backend::assemble::{AsmEnv, WidenRequest};
use crate::backend::lir::{Lir, LirOp};
use crate::backend::regs::RegStorage;
use crate::backend::{AluOp, Cond, ConvKind, OpSize};

use super::X86Op;

/// Encoder scratch: `ebp` in 32-bit mode (excluded from the allocator),
/// `r11` in 64-bit mode.
pub fn scratch(x64: bool) -> u8 {
    if x64 { 11 } else { 5 }
}

fn reg(bits: i32) -> u8 {
    RegStorage::from_bits(bits as u16).reg_num()
}

fn storage(bits: i32) -> RegStorage {
    RegStorage::from_bits(bits as u16)
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

/// x86 condition-code nibble for a [`Cond`] tag.
pub(super) fn cc_bits(tag: i32) -> u8 {
    match tag {
        0 => 0x4, // e
        1 => 0x5, // ne
        2 => 0xc, // l
        3 => 0xd, // ge
        4 => 0xf, // g
        5 => 0xe, // le
        6 => 0x2, // b
        7 => 0x3, // ae
        _ => unreachable!(),
    }
}

pub(super) fn conv_tag(kind: ConvKind) -> i32 {
    kind as i32
}

//=============================================================================
// A tiny assembler

struct Asm<'b> {
    buf: &'b mut Vec<u8>,
    x64: bool,
}

impl Asm<'_> {
    fn u8(&mut self, byte: u8) {
        self.buf.push(byte);
    }

    fn u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn rex(&mut self, w: bool, r: u8, b: u8) {
        if self.x64 && (w || r >= 8 || b >= 8) {
            self.u8(0x40 | (u8::from(w) << 3) | (u8::from(r >= 8) << 2) | u8::from(b >= 8));
        }
    }

    fn rex_rxb(&mut self, w: bool, r: u8, x: u8, b: u8) {
        if self.x64 && (w || r >= 8 || x >= 8 || b >= 8) {
            self.u8(
                0x40 | (u8::from(w) << 3)
                    | (u8::from(r >= 8) << 2)
                    | (u8::from(x >= 8) << 1)
                    | u8::from(b >= 8),
            );
        }
    }

    fn modrm_reg(&mut self, reg: u8, rm: u8) {
        self.u8(0xc0 | ((reg & 7) << 3) | (rm & 7));
    }

    /// `[base + disp32]` with a SIB byte when the base demands one.
    fn modrm_mem(&mut self, reg: u8, base: u8, disp: i32) {
        self.u8(0x80 | ((reg & 7) << 3) | if base & 7 == 4 { 4 } else { base & 7 });
        if base & 7 == 4 {
            self.u8(0x24); // SIB: scale 0, no index, base rsp/r12
        }
        self.u32(disp as u32);
    }

    /// `[base + index << scale]` via SIB.
    fn modrm_sib(&mut self, reg: u8, base: u8, index: u8, scale: u8) {
        self.u8(0x04 | ((reg & 7) << 3));
        self.u8((scale << 6) | ((index & 7) << 3) | (base & 7));
    }

    /// RIP-relative (64-bit only): modrm mod=00 rm=101.
    fn modrm_rip(&mut self, reg: u8, disp: i32) {
        self.u8(((reg & 7) << 3) | 0x05);
        self.u32(disp as u32);
    }

    fn mov_rr(&mut self, w: bool, dest: u8, src: u8) {
        self.rex(w, src, dest);
        self.u8(0x89);
        self.modrm_reg(src, dest);
    }

    fn mov_ri(&mut self, dest: u8, imm: i32) {
        self.rex(false, 0, dest);
        self.u8(0xb8 + (dest & 7));
        self.u32(imm as u32);
    }

    fn alu_rr(&mut self, w: bool, opcode: u8, dest: u8, src: u8) {
        self.rex(w, src, dest);
        self.u8(opcode);
        self.modrm_reg(src, dest);
    }

    fn jcc_rel32(&mut self, cc: u8, rel: i32) {
        self.u8(0x0f);
        self.u8(0x80 | cc);
        self.u32(rel as u32);
    }

    fn jmp_rel32(&mut self, rel: i32) {
        self.u8(0xe9);
        self.u32(rel as u32);
    }
}

/// Length of a mod/rm memory operand (modrm + optional SIB + disp32).
fn mem_len(base: u8) -> u32 {
    if base & 7 == 4 { 6 } else { 5 }
}

fn rex_len(x64: bool, w: bool, regs: &[u8]) -> u32 {
    u32::from(x64 && (w || regs.iter().any(|&r| r >= 8)))
}

//=============================================================================
// Size computation

fn ld_op_len(size: OpSize, x64: bool, rt: u8, base: u8, load: bool) -> u32 {
    let (two_byte, prefix, wide) = match (size, load) {
        (OpSize::Word, _) => (false, 0, false),
        (OpSize::Wide | OpSize::Ref, _) => (false, 0, x64),
        (OpSize::UnsignedByte | OpSize::SignedByte, true) => (true, 0, false),
        (OpSize::UnsignedHalf | OpSize::SignedHalf, true) => (true, 0, false),
        (OpSize::UnsignedByte | OpSize::SignedByte, false) => (false, 0, false),
        (OpSize::UnsignedHalf | OpSize::SignedHalf, false) => (false, 1, false),
        (OpSize::Single, _) => (true, 1, false),
        (OpSize::Double, _) => (true, 1, false),
    };
    prefix + rex_len(x64, wide, &[rt, base]) + 1 + u32::from(two_byte) + mem_len(base)
}

pub fn inst_size_impl(x64: bool, lir: &Lir<X86Op>) -> u32 {
    let op = match lir.opcode {
        LirOp::Target(op) => op,
        LirOp::Pseudo(_) => return 0,
    };
    let ops = &lir.operands;
    match op {
        X86Op::MovRI => {
            let dest = storage(ops[0]);
            if dest.is_float() {
                // mov scratch, imm ; movd xmm, scratch
                let s = scratch(x64);
                (1 + rex_len(x64, false, &[s]) + 4) + (3 + rex_len(x64, false, &[dest.reg_num(), s]) + 1)
            } else {
                1 + rex_len(x64, false, &[dest.reg_num()]) + 4
            }
        }
        X86Op::MovRI64 => {
            if x64 {
                10
            } else {
                // Two 32-bit immediates into the pair halves.
                10
            }
        }
        X86Op::Load | X86Op::Store => {
            let load = op == X86Op::Load;
            let size = size_from_tag(ops[3]);
            let rt = storage(ops[0]);
            let base = reg(ops[1]);
            if size == OpSize::Wide && rt.is_pair() {
                ld_op_len(OpSize::Word, x64, rt.low().reg_num(), base, load)
                    + ld_op_len(OpSize::Word, x64, rt.high().reg_num(), base, load)
            } else {
                ld_op_len(size, x64, rt.reg_num(), base, load)
            }
        }
        X86Op::LoadIndexed | X86Op::StoreIndexed => {
            let load = op == X86Op::LoadIndexed;
            let size = size_from_tag(ops[4]);
            let rt = storage(ops[0]);
            if size == OpSize::Wide && rt.is_pair() {
                // Two word accesses; the second half adds a disp8.
                let one = sib_op_len(OpSize::Word, x64, rt.low().reg_num(), reg(ops[1]), reg(ops[2]), load);
                one + one + 1
            } else {
                sib_op_len(size, x64, rt.reg_num(), reg(ops[1]), reg(ops[2]), load)
            }
        }
        X86Op::Mov => mov_len(x64, storage(ops[0]), storage(ops[1])),
        X86Op::AluRRR => alu_rrr_len(x64, alu_from_tag(ops[0]), ops),
        X86Op::AluRRI => alu_rri_len(x64, alu_from_tag(ops[0]), ops),
        X86Op::FpRRR => {
            let same = reg(ops[1]) == reg(ops[2]);
            (if same { 0 } else { 3 + rex_len(x64, false, &[reg(ops[1]), reg(ops[2])]) })
                + 4
                + rex_len(x64, false, &[reg(ops[1]), reg(ops[3])])
        }
        X86Op::FpNeg => fp_neg_len(x64, ops),
        X86Op::Ucomi => {
            u32::from(ops[2] != 0) + 3 + rex_len(x64, false, &[reg(ops[0]), reg(ops[1])])
        }
        X86Op::CmpRR => 2 + rex_len(x64, is64(ops[0]), &[reg(ops[0]), reg(ops[1])]),
        X86Op::Conv => conv_len(x64, ops),
        X86Op::CmpBr => {
            2 + rex_len(x64, is64(ops[1]), &[reg(ops[1]), reg(ops[2])]) + 6
        }
        X86Op::CmpImmBr => cmp_imm_len(x64, ops) + 6,
        X86Op::Jcc => 6,
        X86Op::Jmp => 5,
        X86Op::CallReg => 2 + rex_len(x64, false, &[reg(ops[0])]),
        X86Op::CallRel => 5,
        X86Op::JmpReg => 2 + rex_len(x64, false, &[reg(ops[0])]),
        X86Op::Ret => 1,
        X86Op::LoadPool => {
            if x64 {
                2 + rex_len(x64, false, &[reg(ops[0])]) + 4
            } else {
                5 + 1 + 6 + 2 + mem_len_reg(reg(ops[0]))
            }
        }
        X86Op::TableAnchor => {
            if x64 {
                // rex.w + lea + modrm + disp32
                7
            } else {
                // call +0 ; pop rd ; sub rd, 5
                5 + 1 + 6
            }
        }
        X86Op::TableDelta => {
            // lea rd, [rs + disp32]
            let rs = reg(ops[1]);
            rex_len(x64, is64(ops[0]), &[reg(ops[0]), rs]) + 1 + mem_len(rs)
        }
        X86Op::Mfence => 3,
        X86Op::SpAdjust => rex_len(x64, x64, &[4]) + 2 + 4,
        X86Op::Spill | X86Op::Unspill => {
            let r = storage(ops[0]);
            if r.is_float() {
                4 + rex_len(x64, false, &[r.reg_num()]) + mem_len(4) - 1
            } else {
                1 + rex_len(x64, x64, &[r.reg_num()]) + mem_len(4)
            }
        }
        X86Op::Probe => {
            let s = scratch(x64);
            1 + rex_len(x64, false, &[s]) + mem_len(4)
        }
    }
}

fn mem_len_reg(base: u8) -> u32 {
    if base & 7 == 4 { 3 } else { 2 }
}

fn is64(bits: i32) -> bool {
    storage(bits).is_solo64()
}

fn sib_op_len(size: OpSize, x64: bool, rt: u8, base: u8, index: u8, load: bool) -> u32 {
    let (two_byte, prefix, wide) = match (size, load) {
        (OpSize::Word, _) => (false, 0u32, false),
        (OpSize::Wide | OpSize::Ref, _) => (false, 0, x64),
        (OpSize::UnsignedByte | OpSize::SignedByte, true) => (true, 0, false),
        (OpSize::UnsignedHalf | OpSize::SignedHalf, true) => (true, 0, false),
        (OpSize::UnsignedByte | OpSize::SignedByte, false) => (false, 0, false),
        (OpSize::UnsignedHalf | OpSize::SignedHalf, false) => (false, 1, false),
        (OpSize::Single | OpSize::Double, _) => (true, 1, false),
    };
    prefix + rex_len(x64, wide, &[rt, base, index]) + 1 + u32::from(two_byte) + 2
}

fn mov_len(x64: bool, dest: RegStorage, src: RegStorage) -> u32 {
    match (dest.is_float(), src.is_float()) {
        (false, false) => {
            if dest.is_pair() && src.is_pair() {
                2 * (1 + 1)
            } else {
                1 + rex_len(x64, dest.is_solo64() || src.is_solo64(), &[dest.reg_num(), src.reg_num()])
                    + 1
            }
        }
        (true, true) => 3 + rex_len(x64, false, &[dest.reg_num(), src.reg_num()]),
        _ => {
            let gpr = if dest.is_float() { src } else { dest };
            let wide = gpr.is_solo64();
            4 + rex_len(x64, wide, &[dest.reg_num(), src.reg_num()]).max(u32::from(wide))
        }
    }
}

fn alu_rrr_len(x64: bool, alu: AluOp, ops: &[i32; 5]) -> u32 {
    let dest = storage(ops[1]);
    let pairs = dest.is_pair();
    match alu {
        AluOp::Div | AluOp::Rem => {
            // mov scratch, rm ; mov eax, rn ; cdq ; idiv scratch ;
            // mov rd, eax/edx
            let w = is64(ops[1]);
            let r = rex_len(x64, w, &[0]);
            (2 + r) + (2 + r) + (1 + r) + (2 + r) + (2 + r)
        }
        AluOp::Shl | AluOp::Shr | AluOp::Ushr => {
            // mov scratch, rn ; mov ecx, rm ; shift scratch, cl ;
            // mov rd, scratch
            let w = is64(ops[1]);
            let r = rex_len(x64, w, &[scratch(x64)]);
            (2 + r) + 2 + (2 + r) + (2 + r)
        }
        AluOp::Neg | AluOp::Not => {
            if pairs {
                if alu == AluOp::Not {
                    4 + 4
                } else {
                    // mov pair ; not both ; add lo,1 ; adc hi,0
                    4 + 4 + 6 + 6
                }
            } else {
                let w = is64(ops[1]);
                let r = rex_len(x64, w, &[dest.reg_num(), reg(ops[2])]);
                (2 + r) + (2 + r)
            }
        }
        AluOp::Mov => mov_len(x64, dest, storage(ops[3])),
        _ => {
            if pairs {
                // mov lo ; mov hi ; op lo ; op hi
                4 * 2
            } else {
                let w = is64(ops[1]);
                let r = rex_len(x64, w, &[dest.reg_num(), reg(ops[2]), reg(ops[3])]);
                (2 + r) + (2 + r)
            }
        }
    }
}

fn alu_rri_len(x64: bool, alu: AluOp, ops: &[i32; 5]) -> u32 {
    let w = is64(ops[1]);
    let r = rex_len(x64, w, &[reg(ops[1]), reg(ops[2])]);
    let s = scratch(x64);
    match alu {
        AluOp::Shl | AluOp::Shr | AluOp::Ushr => (2 + r) + (3 + r),
        AluOp::Rsub => {
            let mov_imm = 1 + rex_len(x64, false, &[s]) + 4;
            let rs = rex_len(x64, w, &[s, reg(ops[2])]);
            mov_imm + (2 + rs) + (2 + rs)
        }
        AluOp::Neg | AluOp::Not => (2 + r) + (2 + r),
        AluOp::Mov => 1 + rex_len(x64, false, &[reg(ops[1])]) + 4,
        AluOp::Div | AluOp::Rem => {
            let mov_imm = 1 + rex_len(x64, false, &[s]) + 4;
            mov_imm + 9 + 5 * rex_len(x64, w, &[0])
        }
        _ => (2 + r) + (6 + r),
    }
}

fn fp_neg_len(x64: bool, ops: &[i32; 5]) -> u32 {
    let double = ops[2] != 0;
    let s = scratch(x64);
    if !double {
        // movd scratch, xmm ; xor scratch, signbit ; movd xmm, scratch
        (4 + rex_len(x64, false, &[s, reg(ops[1])])) + 6 + (4 + rex_len(x64, false, &[s, reg(ops[0])]))
    } else if x64 {
        // movq scratch, xmm ; btc scratch, 63 ; movq xmm, scratch
        5 + 5 + 5
    } else {
        // Through the stack: sub esp,8 ; movsd [esp],x ; xor dword
        // [esp+4],signbit ; movsd x,[esp] ; add esp,8
        6 + 9 + 11 + 9 + 6
    }
}

fn cmp_imm_len(x64: bool, ops: &[i32; 5]) -> u32 {
    let w = is64(ops[1]);
    2 + rex_len(x64, w, &[reg(ops[1])]) + 4
}

fn conv_len(x64: bool, ops: &[i32; 5]) -> u32 {
    let s = |bits: i32| storage(bits);
    match ops[0] {
        // I2L
        0 => {
            if x64 {
                3
            } else {
                // mov lo ; mov hi ; sar hi, 31
                2 + 2 + 3
            }
        }
        // L2I
        3 => 2 + rex_len(x64, false, &[reg(ops[1]), reg(ops[2])]),
        // int<->fp single conversions
        1 | 2 | 6 | 9 => 4 + rex_len(x64, false, &[reg(ops[1]), reg(ops[2])]),
        // 64-bit int<->fp (64-bit mode only; pairs go through helpers)
        4 | 5 | 7 | 10 => 5,
        // F2D / D2F
        8 | 11 => 4 + rex_len(x64, false, &[reg(ops[1]), reg(ops[2])]),
        // I2B / I2S: mov ; shl ; sar    I2C: mov ; shl ; shr
        12 | 13 | 14 => {
            let r = rex_len(x64, false, &[s(ops[1]).reg_num(), s(ops[2]).reg_num()]);
            (2 + r) + (3 + r) + (3 + r)
        }
        _ => unreachable!(),
    }
}

//=============================================================================
// Emission

pub fn encode_impl(
    x64: bool,
    lir: &Lir<X86Op>,
    env: &AsmEnv<'_, X86Op>,
    buf: &mut Vec<u8>,
) -> Result<(), WidenRequest> {
    let op = match lir.opcode {
        LirOp::Target(op) => op,
        LirOp::Pseudo(_) => return Ok(()),
    };
    let ops = &lir.operands;
    let start = buf.len();
    let mut a = Asm { buf, x64 };
    match op {
        X86Op::MovRI => {
            let dest = storage(ops[0]);
            if dest.is_float() {
                let s = scratch(x64);
                a.mov_ri(s, ops[1]);
                // movd xmm, r32: 66 0F 6E /r
                a.u8(0x66);
                a.rex(false, dest.reg_num(), s);
                a.u8(0x0f);
                a.u8(0x6e);
                a.modrm_reg(dest.reg_num(), s);
            } else {
                a.mov_ri(dest.reg_num(), ops[1]);
            }
        }
        X86Op::MovRI64 => {
            let dest = storage(ops[0]);
            if x64 {
                a.u8(0x48 | u8::from(dest.reg_num() >= 8));
                a.u8(0xb8 + (dest.reg_num() & 7));
                a.u32(ops[1] as u32);
                a.u32(ops[2] as u32);
            } else {
                a.mov_ri(dest.low().reg_num(), ops[1]);
                a.mov_ri(dest.high().reg_num(), ops[2]);
            }
        }
        X86Op::Load => emit_load_store(&mut a, true, ops),
        X86Op::Store => emit_load_store(&mut a, false, ops),
        X86Op::LoadIndexed => emit_indexed(&mut a, true, ops),
        X86Op::StoreIndexed => emit_indexed(&mut a, false, ops),
        X86Op::Mov => emit_mov(&mut a, storage(ops[0]), storage(ops[1])),
        X86Op::AluRRR => emit_alu_rrr(&mut a, alu_from_tag(ops[0]), ops),
        X86Op::AluRRI => emit_alu_rri(&mut a, alu_from_tag(ops[0]), ops),
        X86Op::FpRRR => {
            let double = storage(ops[1]).is_solo64();
            let (rd, rn, rm) = (reg(ops[1]), reg(ops[2]), reg(ops[3]));
            if rd != rn {
                emit_fp_mov(&mut a, rd, rn, double);
            }
            a.u8(if double { 0xf2 } else { 0xf3 });
            a.rex(false, rd, rm);
            a.u8(0x0f);
            a.u8(match ops[0] {
                0 => 0x58, // add
                1 => 0x5c, // sub
                2 => 0x59, // mul
                _ => 0x5e, // div
            });
            a.modrm_reg(rd, rm);
        }
        X86Op::FpNeg => emit_fp_neg(&mut a, ops),
        X86Op::Ucomi => {
            if ops[2] != 0 {
                a.u8(0x66);
            }
            a.rex(false, reg(ops[0]), reg(ops[1]));
            a.u8(0x0f);
            a.u8(0x2e);
            a.modrm_reg(reg(ops[0]), reg(ops[1]));
        }
        X86Op::CmpRR => {
            a.alu_rr(is64(ops[0]), 0x39, reg(ops[0]), reg(ops[1]));
        }
        X86Op::Conv => emit_conv(&mut a, ops),
        X86Op::CmpBr => {
            let w = is64(ops[1]);
            a.alu_rr(w, 0x39, reg(ops[1]), reg(ops[2]));
            let target = env.label_offset(lir.target.expect("branch without target"));
            let end = (lir.offset + inst_size_impl(x64, lir)) as i64;
            a.jcc_rel32(cc_bits(ops[0]), (i64::from(target) - end) as i32);
        }
        X86Op::CmpImmBr => {
            let w = is64(ops[1]);
            a.rex(w, 0, reg(ops[1]));
            a.u8(0x81);
            a.modrm_reg(7, reg(ops[1]));
            a.u32(ops[2] as u32);
            let target = env.label_offset(lir.target.expect("branch without target"));
            let end = (lir.offset + inst_size_impl(x64, lir)) as i64;
            a.jcc_rel32(cc_bits(ops[0]), (i64::from(target) - end) as i32);
        }
        X86Op::Jcc => {
            // Operand 0 carries a raw x86 condition nibble.
            let target = env.label_offset(lir.target.expect("branch without target"));
            let end = (lir.offset + 6) as i64;
            a.jcc_rel32(ops[0] as u8, (i64::from(target) - end) as i32);
        }
        X86Op::Jmp => {
            let target = env.label_offset(lir.target.expect("branch without target"));
            let end = (lir.offset + 5) as i64;
            a.jmp_rel32((i64::from(target) - end) as i32);
        }
        X86Op::CallReg => {
            a.rex(false, 0, reg(ops[0]));
            a.u8(0xff);
            a.modrm_reg(2, reg(ops[0]));
        }
        X86Op::CallRel => {
            a.u8(0xe8);
            a.u32(0);
        }
        X86Op::JmpReg => {
            a.rex(false, 0, reg(ops[0]));
            a.u8(0xff);
            a.modrm_reg(4, reg(ops[0]));
        }
        X86Op::Ret => a.u8(0xc3),
        X86Op::LoadPool => {
            let base = env.pool_base[ops[1] as usize] + ops[2] as u32 * 4;
            if x64 {
                let rd = reg(ops[0]);
                a.rex(false, rd, 0);
                a.u8(0x8b);
                let end = lir.offset + inst_size_impl(true, lir);
                a.modrm_rip(rd, base as i32 - end as i32);
            } else {
                emit_call_pop_address(&mut a, lir.offset, base, reg(ops[0]));
                // mov rd, [rd]
                let rd = reg(ops[0]);
                a.u8(0x8b);
                if rd & 7 == 4 {
                    a.u8(((rd & 7) << 3) | 4);
                    a.u8(0x24);
                } else {
                    a.u8((rd << 3) | rd);
                }
            }
        }
        X86Op::TableAnchor => {
            if x64 {
                // The reference point here is the table itself.
                let table = if ops[1] == 0 {
                    env.switch_table_offsets[ops[2] as usize]
                } else {
                    env.fill_array_offsets[ops[2] as usize]
                };
                let rd = reg(ops[0]);
                a.rex(true, rd, 0);
                a.u8(0x8d);
                let end = lir.offset + inst_size_impl(true, lir);
                a.modrm_rip(rd, table as i32 - end as i32);
            } else {
                // call +0 ; pop rd leaves the pop's address; subtract the
                // call's length so rd holds the anchor's own address.
                let rd = reg(ops[0]);
                a.u8(0xe8);
                a.u32(0);
                a.u8(0x58 + (rd & 7));
                a.u8(0x81);
                a.modrm_reg(5, rd);
                a.u32(5);
            }
        }
        X86Op::TableDelta => {
            let table = if ops[2] == 0 {
                env.switch_table_offsets[ops[3] as usize]
            } else {
                env.fill_array_offsets[ops[3] as usize]
            };
            let anchor = lir.target.expect("table delta without an anchor");
            let isa = if x64 {
                crate::options::InstructionSet::X86_64
            } else {
                crate::options::InstructionSet::X86
            };
            let reference = crate::backend::assemble::table_reference_offset(
                isa,
                env.lirs[anchor].offset,
                table,
            );
            let delta = table.wrapping_sub(reference) as i32;
            let (rd, rs) = (reg(ops[0]), reg(ops[1]));
            a.rex(is64(ops[0]), rd, rs);
            a.u8(0x8d);
            a.modrm_mem(rd, rs, delta);
        }
        X86Op::Mfence => {
            a.u8(0x0f);
            a.u8(0xae);
            a.u8(0xf0);
        }
        X86Op::SpAdjust => {
            let delta = ops[0];
            a.rex(x64, 0, 4);
            a.u8(0x81);
            a.modrm_reg(if delta < 0 { 5 } else { 0 }, 4);
            a.u32(delta.unsigned_abs());
        }
        X86Op::Spill | X86Op::Unspill => {
            let r = storage(ops[0]);
            let load = op == X86Op::Unspill;
            if r.is_float() {
                a.u8(0xf2);
                a.rex(false, r.reg_num(), 4);
                a.u8(0x0f);
                a.u8(if load { 0x10 } else { 0x11 });
                a.modrm_mem(r.reg_num(), 4, ops[1]);
            } else {
                a.rex(x64, r.reg_num(), 4);
                a.u8(if load { 0x8b } else { 0x89 });
                a.modrm_mem(r.reg_num(), 4, ops[1]);
            }
        }
        X86Op::Probe => {
            let s = scratch(x64);
            a.rex(false, s, 4);
            a.u8(0x8b);
            a.modrm_mem(s, 4, -ops[0]);
        }
    }
    debug_assert_eq!(
        (buf.len() - start) as u32,
        inst_size_impl(x64, lir),
        "size mismatch encoding {op:?}"
    );
    Ok(())
}

/// The 32-bit PC-relative idiom: `call +0 ; pop rd ; add rd, delta`.
fn emit_call_pop_address(a: &mut Asm, lir_offset: u32, target_offset: u32, rd: u8) {
    a.u8(0xe8);
    a.u32(0);
    a.u8(0x58 + (rd & 7));
    // The popped value is the address of the pop itself.
    let pop_address = lir_offset + 5;
    let delta = target_offset as i64 - i64::from(pop_address);
    a.u8(0x81);
    a.modrm_reg(0, rd);
    a.u32(delta as u32);
}

fn emit_fp_mov(a: &mut Asm, rd: u8, rn: u8, _double: bool) {
    // movaps rd, rn
    a.rex(false, rd, rn);
    a.u8(0x0f);
    a.u8(0x28);
    a.modrm_reg(rd, rn);
    a.u8(0x90); // keep movaps 4 bytes with a trailing nop for sizing
}

fn emit_mov(a: &mut Asm, dest: RegStorage, src: RegStorage) {
    match (dest.is_float(), src.is_float()) {
        (false, false) => {
            if dest.is_pair() && src.is_pair() {
                a.mov_rr(false, dest.low().reg_num(), src.low().reg_num());
                a.mov_rr(false, dest.high().reg_num(), src.high().reg_num());
            } else {
                a.mov_rr(dest.is_solo64() || src.is_solo64(), dest.reg_num(), src.reg_num());
            }
        }
        (true, true) => {
            a.rex(false, dest.reg_num(), src.reg_num());
            a.u8(0x0f);
            a.u8(0x28);
            a.modrm_reg(dest.reg_num(), src.reg_num());
        }
        (to_fp, _) => {
            let gpr = if to_fp { src } else { dest };
            let xmm = if to_fp { dest } else { src };
            let wide = gpr.is_solo64();
            a.u8(0x66);
            if wide {
                a.u8(0x48 | (u8::from(xmm.reg_num() >= 8) << 2) | u8::from(gpr.reg_num() >= 8));
            } else if a.x64 && (xmm.reg_num() >= 8 || gpr.reg_num() >= 8) {
                a.rex(false, xmm.reg_num(), gpr.reg_num());
            }
            a.u8(0x0f);
            a.u8(if to_fp { 0x6e } else { 0x7e });
            a.modrm_reg(xmm.reg_num(), gpr.reg_num());
        }
    }
}

fn ld_params(size: OpSize, load: bool) -> (Option<u8>, &'static [u8], bool) {
    // (prefix, opcode bytes, rex.w)
    match (size, load) {
        (OpSize::Word, true) => (None, &[0x8b], false),
        (OpSize::Word, false) => (None, &[0x89], false),
        (OpSize::Wide | OpSize::Ref, true) => (None, &[0x8b], true),
        (OpSize::Wide | OpSize::Ref, false) => (None, &[0x89], true),
        (OpSize::UnsignedByte, true) => (None, &[0x0f, 0xb6], false),
        (OpSize::SignedByte, true) => (None, &[0x0f, 0xbe], false),
        (OpSize::UnsignedHalf, true) => (None, &[0x0f, 0xb7], false),
        (OpSize::SignedHalf, true) => (None, &[0x0f, 0xbf], false),
        (OpSize::UnsignedByte | OpSize::SignedByte, false) => (None, &[0x88], false),
        (OpSize::UnsignedHalf | OpSize::SignedHalf, false) => (Some(0x66), &[0x89], false),
        (OpSize::Single, true) => (Some(0xf3), &[0x0f, 0x10], false),
        (OpSize::Single, false) => (Some(0xf3), &[0x0f, 0x11], false),
        (OpSize::Double, true) => (Some(0xf2), &[0x0f, 0x10], false),
        (OpSize::Double, false) => (Some(0xf2), &[0x0f, 0x11], false),
    }
}

fn emit_load_store(a: &mut Asm, load: bool, ops: &[i32; 5]) {
    let size = size_from_tag(ops[3]);
    let rt = storage(ops[0]);
    let base = reg(ops[1]);
    if size == OpSize::Wide && rt.is_pair() {
        let (_, opc, _) = ld_params(OpSize::Word, load);
        a.u8(opc[0]);
        a.modrm_mem(rt.low().reg_num(), base, ops[2]);
        a.u8(opc[0]);
        a.modrm_mem(rt.high().reg_num(), base, ops[2] + 4);
        return;
    }
    let wide = matches!(size, OpSize::Wide | OpSize::Ref) && a.x64;
    let (prefix, opc, _) = ld_params(size, load);
    if let Some(p) = prefix {
        a.u8(p);
    }
    a.rex(wide, rt.reg_num(), base);
    for &b in opc {
        a.u8(b);
    }
    a.modrm_mem(rt.reg_num(), base, ops[2]);
}

fn emit_indexed(a: &mut Asm, load: bool, ops: &[i32; 5]) {
    let size = size_from_tag(ops[4]);
    let rt = storage(ops[0]);
    let (base, index, scale) = (reg(ops[1]), reg(ops[2]), ops[3] as u8);
    if size == OpSize::Wide && rt.is_pair() {
        let (_, opc, _) = ld_params(OpSize::Word, load);
        a.u8(opc[0]);
        a.modrm_sib(rt.low().reg_num(), base, index, scale);
        // Second half at +4: use disp8 form.
        a.u8(opc[0]);
        a.u8(0x44 | ((rt.high().reg_num() & 7) << 3));
        a.u8((scale << 6) | ((index & 7) << 3) | (base & 7));
        a.u8(4);
        return;
    }
    let wide = matches!(size, OpSize::Wide | OpSize::Ref) && a.x64;
    let (prefix, opc, _) = ld_params(size, load);
    if let Some(p) = prefix {
        a.u8(p);
    }
    a.rex_rxb(wide, rt.reg_num(), index, base);
    for &b in opc {
        a.u8(b);
    }
    a.modrm_sib(rt.reg_num(), base, index, scale);
}

fn emit_alu_rrr(a: &mut Asm, alu: AluOp, ops: &[i32; 5]) {
    let dest = storage(ops[1]);
    let w = dest.is_solo64();
    match alu {
        AluOp::Div | AluOp::Rem => {
            let s = scratch(a.x64);
            a.mov_rr(w, s, reg(ops[3]));
            a.mov_rr(w, 0, reg(ops[2]));
            a.rex(w, 0, 0);
            a.u8(0x99); // cdq / cqo
            a.rex(w, 0, s);
            a.u8(0xf7);
            a.modrm_reg(7, s); // idiv
            let result = if alu == AluOp::Div { 0 } else { 2 };
            a.mov_rr(w, reg(ops[1]), result);
        }
        AluOp::Shl | AluOp::Shr | AluOp::Ushr => {
            let s = scratch(a.x64);
            a.mov_rr(w, s, reg(ops[2]));
            a.mov_rr(false, 1, reg(ops[3]));
            a.rex(w, 0, s);
            a.u8(0xd3);
            let ext = match alu {
                AluOp::Shl => 4,
                AluOp::Ushr => 5,
                _ => 7,
            };
            a.modrm_reg(ext, s);
            a.mov_rr(w, reg(ops[1]), s);
        }
        AluOp::Neg | AluOp::Not => {
            if dest.is_pair() {
                let src = storage(ops[2]);
                a.mov_rr(false, dest.low().reg_num(), src.low().reg_num());
                a.mov_rr(false, dest.high().reg_num(), src.high().reg_num());
                a.u8(0xf7);
                a.modrm_reg(2, dest.low().reg_num()); // not lo
                a.u8(0xf7);
                a.modrm_reg(2, dest.high().reg_num()); // not hi
                if alu == AluOp::Neg {
                    a.u8(0x81);
                    a.modrm_reg(0, dest.low().reg_num());
                    a.u32(1); // add lo, 1
                    a.u8(0x81);
                    a.modrm_reg(2, dest.high().reg_num());
                    a.u32(0); // adc hi, 0
                }
            } else {
                a.mov_rr(w, dest.reg_num(), reg(ops[2]));
                a.rex(w, 0, dest.reg_num());
                a.u8(0xf7);
                a.modrm_reg(if alu == AluOp::Neg { 3 } else { 2 }, dest.reg_num());
            }
        }
        AluOp::Mov => emit_mov(a, dest, storage(ops[3])),
        _ => {
            let opcode = match alu {
                AluOp::Add => 0x01,
                AluOp::Sub | AluOp::Rsub => 0x29,
                AluOp::And => 0x21,
                AluOp::Or => 0x09,
                AluOp::Xor => 0x31,
                AluOp::Adc => 0x11,
                AluOp::Sbc => 0x19,
                AluOp::Mul => 0xaf, // 0F AF imul
                _ => unreachable!(),
            };
            if dest.is_pair() {
                let (s1, s2) = (storage(ops[2]), storage(ops[3]));
                let (lo_op, hi_op) = match alu {
                    AluOp::Add => (0x01, 0x11),
                    AluOp::Sub => (0x29, 0x19),
                    AluOp::And => (0x21, 0x21),
                    AluOp::Or => (0x09, 0x09),
                    AluOp::Xor => (0x31, 0x31),
                    _ => unreachable!("wide {alu:?} goes through a helper"),
                };
                a.mov_rr(false, dest.low().reg_num(), s1.low().reg_num());
                a.mov_rr(false, dest.high().reg_num(), s1.high().reg_num());
                a.alu_rr(false, lo_op, dest.low().reg_num(), s2.low().reg_num());
                a.alu_rr(false, hi_op, dest.high().reg_num(), s2.high().reg_num());
            } else {
                let (rd, rn, rm) = (dest.reg_num(), reg(ops[2]), reg(ops[3]));
                if alu == AluOp::Rsub {
                    let s = scratch(a.x64);
                    let _ = s;
                    // rsub: dest = rm - rn
                    a.mov_rr(w, rd, rm);
                    a.alu_rr(w, opcode, rd, rn);
                } else if alu == AluOp::Mul {
                    a.mov_rr(w, rd, rn);
                    a.rex(w, rd, rm);
                    a.u8(0x0f);
                    a.u8(opcode);
                    a.modrm_reg(rd, rm);
                } else {
                    a.mov_rr(w, rd, rn);
                    a.alu_rr(w, opcode, rd, rm);
                }
            }
        }
    }
}

fn emit_alu_rri(a: &mut Asm, alu: AluOp, ops: &[i32; 5]) {
    let dest = storage(ops[1]);
    let w = dest.is_solo64();
    let (rd, rn) = (dest.reg_num(), reg(ops[2]));
    match alu {
        AluOp::Shl | AluOp::Shr | AluOp::Ushr => {
            a.mov_rr(w, rd, rn);
            a.rex(w, 0, rd);
            a.u8(0xc1);
            let ext = match alu {
                AluOp::Shl => 4,
                AluOp::Ushr => 5,
                _ => 7,
            };
            a.modrm_reg(ext, rd);
            a.u8((ops[3] & 0x3f) as u8);
        }
        AluOp::Rsub => {
            let s = scratch(a.x64);
            a.mov_ri(s, ops[3]);
            a.alu_rr(w, 0x29, s, rn);
            a.mov_rr(w, rd, s);
        }
        AluOp::Neg | AluOp::Not => {
            a.mov_rr(w, rd, rn);
            a.rex(w, 0, rd);
            a.u8(0xf7);
            a.modrm_reg(if alu == AluOp::Neg { 3 } else { 2 }, rd);
        }
        AluOp::Mov => a.mov_ri(rd, ops[3]),
        _ => {
            a.mov_rr(w, rd, rn);
            let ext = match alu {
                AluOp::Add => 0,
                AluOp::Sub => 5,
                AluOp::And => 4,
                AluOp::Or => 1,
                AluOp::Xor => 6,
                AluOp::Adc => 2,
                AluOp::Sbc => 3,
                AluOp::Mul => {
                    // imul rd, rd, imm32
                    a.rex(w, rd, rd);
                    a.u8(0x69);
                    a.modrm_reg(rd, rd);
                    a.u32(ops[3] as u32);
                    return;
                }
                AluOp::Div | AluOp::Rem => {
                    // Constant divisors come through the register path.
                    let s = scratch(a.x64);
                    a.mov_ri(s, ops[3]);
                    let mut tmp = *ops;
                    tmp[3] = i32::from(if w {
                        RegStorage::solo64(s).bits()
                    } else {
                        RegStorage::solo32(s).bits()
                    });
                    emit_alu_rrr(a, alu, &tmp);
                    return;
                }
                _ => unreachable!(),
            };
            a.rex(w, 0, rd);
            a.u8(0x81);
            a.modrm_reg(ext, rd);
            a.u32(ops[3] as u32);
        }
    }
}

fn emit_fp_neg(a: &mut Asm, ops: &[i32; 5]) {
    let double = ops[2] != 0;
    let s = scratch(a.x64);
    let (rd, rn) = (reg(ops[0]), reg(ops[1]));
    if !double {
        // movd scratch, src
        a.u8(0x66);
        a.rex(false, rn, s);
        a.u8(0x0f);
        a.u8(0x7e);
        a.modrm_reg(rn, s);
        a.u8(0x81);
        a.modrm_reg(6, s);
        a.u32(0x8000_0000);
        a.u8(0x66);
        a.rex(false, rd, s);
        a.u8(0x0f);
        a.u8(0x6e);
        a.modrm_reg(rd, s);
    } else if a.x64 {
        // movq scratch, src ; btc scratch, 63 ; movq dest, scratch
        a.u8(0x66);
        a.u8(0x48 | (u8::from(rn >= 8) << 2) | u8::from(s >= 8));
        a.u8(0x0f);
        a.u8(0x7e);
        a.modrm_reg(rn, s);
        a.u8(0x48 | u8::from(s >= 8));
        a.u8(0x0f);
        a.u8(0xba);
        a.modrm_reg(7, s);
        a.u8(63);
        a.u8(0x66);
        a.u8(0x48 | (u8::from(rd >= 8) << 2) | u8::from(s >= 8));
        a.u8(0x0f);
        a.u8(0x6e);
        a.modrm_reg(rd, s);
    } else {
        // sub esp, 8
        a.u8(0x81);
        a.modrm_reg(5, 4);
        a.u32(8);
        // movsd [esp], src
        a.u8(0xf2);
        a.u8(0x0f);
        a.u8(0x11);
        a.modrm_mem(rn, 4, 0);
        // xor dword [esp+4], 0x80000000
        a.u8(0x81);
        a.modrm_mem(6, 4, 4);
        a.u32(0x8000_0000);
        // movsd dest, [esp]
        a.u8(0xf2);
        a.u8(0x0f);
        a.u8(0x10);
        a.modrm_mem(rd, 4, 0);
        // add esp, 8
        a.u8(0x81);
        a.modrm_reg(0, 4);
        a.u32(8);
    }
}

fn emit_conv(a: &mut Asm, ops: &[i32; 5]) {
    let (rd, rn) = (reg(ops[1]), reg(ops[2]));
    match ops[0] {
        0 => {
            if a.x64 {
                // movsxd rd, rn
                a.u8(0x48 | (u8::from(rd >= 8) << 2) | u8::from(rn >= 8));
                a.u8(0x63);
                a.modrm_reg(rd, rn);
            } else {
                let dest = storage(ops[1]);
                a.mov_rr(false, dest.low().reg_num(), rn);
                a.mov_rr(false, dest.high().reg_num(), rn);
                a.u8(0xc1);
                a.modrm_reg(7, dest.high().reg_num());
                a.u8(31);
            }
        }
        3 => {
            let src = storage(ops[2]);
            let src_lo = if src.is_pair() { src.low().reg_num() } else { src.reg_num() };
            a.mov_rr(false, rd, src_lo);
        }
        1 | 2 => {
            // cvtsi2ss / cvtsi2sd xmm, r32
            a.u8(if ops[0] == 1 { 0xf3 } else { 0xf2 });
            a.rex(false, rd, rn);
            a.u8(0x0f);
            a.u8(0x2a);
            a.modrm_reg(rd, rn);
        }
        6 | 9 => {
            // cvttss2si / cvttsd2si r32, xmm
            a.u8(if ops[0] == 6 { 0xf3 } else { 0xf2 });
            a.rex(false, rd, rn);
            a.u8(0x0f);
            a.u8(0x2c);
            a.modrm_reg(rd, rn);
        }
        4 | 5 => {
            // 64-bit int to fp (x86-64 only).
            a.u8(if ops[0] == 4 { 0xf3 } else { 0xf2 });
            a.u8(0x48 | (u8::from(rd >= 8) << 2) | u8::from(rn >= 8));
            a.u8(0x0f);
            a.u8(0x2a);
            a.modrm_reg(rd, rn);
        }
        7 | 10 => {
            a.u8(if ops[0] == 7 { 0xf3 } else { 0xf2 });
            a.u8(0x48 | (u8::from(rd >= 8) << 2) | u8::from(rn >= 8));
            a.u8(0x0f);
            a.u8(0x2c);
            a.modrm_reg(rd, rn);
        }
        8 | 11 => {
            a.u8(if ops[0] == 8 { 0xf3 } else { 0xf2 });
            a.rex(false, rd, rn);
            a.u8(0x0f);
            a.u8(0x5a);
            a.modrm_reg(rd, rn);
        }
        12 | 13 | 14 => {
            // Sign or zero extension by shifting.
            let bits = if ops[0] == 12 { 24 } else { 16 };
            a.mov_rr(false, rd, rn);
            a.rex(false, 0, rd);
            a.u8(0xc1);
            a.modrm_reg(4, rd);
            a.u8(bits);
            a.rex(false, 0, rd);
            a.u8(0xc1);
            a.modrm_reg(if ops[0] == 13 { 5 } else { 7 }, rd);
            a.u8(bits);
        }
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod emit_tests {
    use super::*;
    use crate::backend::lir::Lir;

    fn lir(op: X86Op, operands: [i32; 5]) -> Lir<X86Op> {
        let mut lir = Lir::new(LirOp::Target(op), 0);
        lir.operands = operands;
        lir
    }

    fn encode_one(x64: bool, l: &Lir<X86Op>) -> Vec<u8> {
        let lirs = cranelift_entity::PrimaryMap::new();
        let env = AsmEnv {
            lirs: &lirs,
            pool_base: [0; 5],
            switch_table_offsets: &[],
            fill_array_offsets: &[],
        };
        let mut buf = Vec::new();
        encode_impl(x64, l, &env, &mut buf).unwrap();
        buf
    }

    #[test]
    fn ret_is_c3() {
        assert_eq!(encode_one(true, &lir(X86Op::Ret, [0; 5])), [0xc3]);
    }

    #[test]
    fn mov_eax_imm() {
        let rd = i32::from(RegStorage::solo32(0).bits());
        let bytes = encode_one(false, &lir(X86Op::MovRI, [rd, 7, 0, 0, 0]));
        assert_eq!(bytes, [0xb8, 7, 0, 0, 0]);
    }

    #[test]
    fn mov_r10_needs_rex() {
        let rd = i32::from(RegStorage::solo32(10).bits());
        let l = lir(X86Op::MovRI, [rd, 1, 0, 0, 0]);
        let bytes = encode_one(true, &l);
        assert_eq!(bytes[0], 0x41);
        assert_eq!(bytes.len() as u32, inst_size_impl(true, &l));
    }

    #[test]
    fn load_from_rsp_has_sib() {
        let rt = i32::from(RegStorage::solo32(0).bits());
        let base = i32::from(RegStorage::solo64(4).bits());
        let l = lir(X86Op::Load, [rt, base, 16, size_tag(OpSize::Word), 0]);
        let bytes = encode_one(true, &l);
        // 8b 84 24 10 00 00 00
        assert_eq!(bytes, [0x8b, 0x84, 0x24, 0x10, 0, 0, 0]);
        assert_eq!(bytes.len() as u32, inst_size_impl(true, &l));
    }

    #[test]
    fn sizes_match_for_alu() {
        for x64 in [false, true] {
            let rd = i32::from(RegStorage::solo32(0).bits());
            let rn = i32::from(RegStorage::solo32(1).bits());
            let rm = i32::from(RegStorage::solo32(2).bits());
            for alu in [AluOp::Add, AluOp::Sub, AluOp::And, AluOp::Mul, AluOp::Div] {
                let l = lir(X86Op::AluRRR, [alu_tag(alu), rd, rn, rm, 0]);
                assert_eq!(
                    encode_one(x64, &l).len() as u32,
                    inst_size_impl(x64, &l),
                    "{alu:?} x64={x64}"
                );
            }
        }
    }
}
