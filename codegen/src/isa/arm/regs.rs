//! Thumb2 (ARMv7) register environment.
//!
//! Quick ABI: `r0` carries the callee `ArtMethod*`, argument words ride in
//! `r1`..`r3` then the stack; `r9` is the thread register, `lr` doubles as
//! the invoke-target scratch and the encoder scratch.

use crate::backend::regalloc::RegPoolTemplate;
use crate::backend::regs::RegStorage;

pub const SELF_REG: u8 = 9;
pub const R12: u8 = 12;
pub const SP: u8 = 13;
pub const LR: u8 = 14;
pub const PC: u8 = 15;

pub fn rreg(num: u8) -> RegStorage {
    RegStorage::solo32(num)
}

pub fn sreg(num: u8) -> RegStorage {
    RegStorage::solo32_fp(num)
}

pub fn pool_template() -> RegPoolTemplate {
    RegPoolTemplate {
        core_temps: [0, 1, 2, 3, R12].into_iter().map(rreg).collect(),
        fp_temps: (16..=31).map(sreg).collect(),
        core_callee_saves: [4, 5, 6, 7, 8, 10, 11].into_iter().map(rreg).collect(),
        fp_callee_saves: (8..=15).map(sreg).collect(),
        call_temps: [0, 1, 2, 3].into_iter().map(rreg).collect(),
        wide_is_solo: false,
        fp_wide_is_solo: false,
    }
}

pub fn arg_reg(index: usize, _fp: bool, wide: bool) -> Option<RegStorage> {
    if index >= 3 {
        return None;
    }
    let num = (index + 1) as u8;
    if wide {
        if index + 1 >= 3 {
            // Second half would be on the stack; pass the whole value in
            // memory.
            return None;
        }
        Some(RegStorage::pair(rreg(num), rreg(num + 1)))
    } else {
        Some(rreg(num))
    }
}

pub fn dwarf_reg(reg: RegStorage) -> u16 {
    if reg.is_float() {
        // s0..s31 map to 64..95.
        64 + u16::from(reg.reg_num())
    } else {
        u16::from(reg.reg_num())
    }
}
