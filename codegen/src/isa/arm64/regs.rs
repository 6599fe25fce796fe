//! ARM64 register environment.
//!
//! Quick ABI: `x0` carries the callee `ArtMethod*`; argument words go in
//! `x1`..`x7` by position (a wide argument occupies one register and its
//! second word slot stays unused), the rest on the stack. `x19` is the
//! thread register, `x30` doubles as the invoke-target scratch.

use crate::backend::regalloc::RegPoolTemplate;
use crate::backend::regs::RegStorage;

pub fn xreg(num: u8) -> RegStorage {
    RegStorage::solo64(num)
}

pub fn wreg(num: u8) -> RegStorage {
    RegStorage::solo32(num)
}

pub fn dreg(num: u8) -> RegStorage {
    RegStorage::solo64_fp(num)
}

pub fn sreg(num: u8) -> RegStorage {
    RegStorage::solo32_fp(num)
}

/// The zero register in a load/store context.
pub const ZR: u8 = 31;

pub const SELF_REG: u8 = 19;
pub const LR: u8 = 30;
/// Encoder scratch, kept out of the allocator (linker veneers also use
/// it).
pub const SCRATCH: u8 = 16;
pub const HIDDEN_ARG: u8 = 12;

pub fn pool_template() -> RegPoolTemplate {
    RegPoolTemplate {
        core_temps: (8..=15).map(wreg).collect(),
        fp_temps: (16..=31).map(sreg).collect(),
        core_callee_saves: (20..=28).map(wreg).collect(),
        fp_callee_saves: (8..=15).map(sreg).collect(),
        call_temps: (0..=7).map(wreg).collect(),
        wide_is_solo: true,
        fp_wide_is_solo: true,
    }
}

/// Argument register for word `index`, or `None` once on the stack.
pub fn arg_reg(index: usize, fp: bool, wide: bool) -> Option<RegStorage> {
    if index >= 7 {
        return None;
    }
    let num = (index + 1) as u8;
    Some(match (fp, wide) {
        // The quick trampoline ABI passes everything in core registers.
        (_, true) => xreg(num),
        (_, false) => wreg(num),
    })
}

pub fn dwarf_reg(reg: RegStorage) -> u16 {
    if reg.is_float() {
        64 + u16::from(reg.reg_num())
    } else {
        u16::from(reg.reg_num())
    }
}
