//! MIPS32 register environment.
//!
//! Quick ABI: `a0` carries the callee `ArtMethod*`, argument words ride in
//! `a1`..`a3` then the stack. `s1` is the thread register; calls go
//! through `t9` as the o32 convention expects.

use crate::backend::regalloc::RegPoolTemplate;
use crate::backend::regs::RegStorage;

pub const ZERO: u8 = 0;
pub const V0: u8 = 2;
pub const V1: u8 = 3;
pub const A0: u8 = 4;
pub const SELF_REG: u8 = 17; // s1
pub const T9: u8 = 25;
pub const SP: u8 = 29;
pub const RA: u8 = 31;
/// Encoder scratch (the assembler temporary, as tradition demands).
pub const AT: u8 = 1;

pub fn rreg(num: u8) -> RegStorage {
    RegStorage::solo32(num)
}

pub fn freg(num: u8) -> RegStorage {
    RegStorage::solo32_fp(num)
}

pub fn pool_template() -> RegPoolTemplate {
    RegPoolTemplate {
        // t0..t7 plus the argument registers via the call-temp list.
        core_temps: (8..=15).map(rreg).collect(),
        // Even singles only, so doubles always find an aligned pair.
        fp_temps: (4..=19).map(freg).collect(),
        core_callee_saves: [18, 19, 20, 21, 22, 23].into_iter().map(rreg).collect(),
        fp_callee_saves: (20..=30).step_by(2).map(freg).collect(),
        call_temps: (4..=7).map(rreg).collect(),
        wide_is_solo: false,
        fp_wide_is_solo: false,
    }
}

pub fn arg_reg(index: usize, _fp: bool, wide: bool) -> Option<RegStorage> {
    if index >= 3 {
        return None;
    }
    let num = (A0 + 1 + index as u8) as u8;
    if wide {
        if index + 1 >= 3 {
            return None;
        }
        Some(RegStorage::pair(rreg(num), rreg(num + 1)))
    } else {
        Some(rreg(num))
    }
}

pub fn dwarf_reg(reg: RegStorage) -> u16 {
    if reg.is_float() {
        32 + u16::from(reg.reg_num())
    } else {
        u16::from(reg.reg_num())
    }
}
