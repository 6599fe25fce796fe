//! x86 / x86-64 register environment.
//!
//! Quick ABI (this runtime's, not the native C one): the callee method
//! pointer and arguments ride in `Arg0..Arg3` with the rest on the stack;
//! the thread register is `esi` (32-bit) or `r15` (64-bit). No segment
//! registers are involved: thread-relative accesses go through the thread
//! GPR, which keeps the encoders uniform across both widths.

use crate::backend::regalloc::RegPoolTemplate;
use crate::backend::regs::RegStorage;

pub const RAX: u8 = 0;
pub const RCX: u8 = 1;
pub const RDX: u8 = 2;
pub const RBX: u8 = 3;
pub const RSP: u8 = 4;
pub const RBP: u8 = 5;
pub const RSI: u8 = 6;
pub const RDI: u8 = 7;

pub fn gpr32(num: u8) -> RegStorage {
    RegStorage::solo32(num)
}

pub fn gpr64(num: u8) -> RegStorage {
    RegStorage::solo64(num)
}

pub fn xmm32(num: u8) -> RegStorage {
    RegStorage::solo32_fp(num)
}

pub fn xmm64(num: u8) -> RegStorage {
    RegStorage::solo64_fp(num)
}

pub fn pool_template(x64: bool) -> RegPoolTemplate {
    if x64 {
        RegPoolTemplate {
            // rax plus r8..r11; argument registers are reserved separately.
            core_temps: [RAX, 8, 9, 10].into_iter().map(gpr32).collect(),
            fp_temps: (4..=11).map(xmm32).collect(),
            core_callee_saves: [RBX, RBP, 12, 13, 14].into_iter().map(gpr32).collect(),
            fp_callee_saves: (12..=15).map(xmm32).collect(),
            call_temps: [RDI, RSI, RDX, RCX].into_iter().map(gpr32).collect(),
            wide_is_solo: true,
            fp_wide_is_solo: true,
        }
    } else {
        RegPoolTemplate {
            // Byte-addressable registers first; byte stores cannot encode
            // the others in 32-bit mode.
            core_temps: [RAX, RCX, RDX, RBX, RDI].into_iter().map(gpr32).collect(),
            fp_temps: (0..=6).map(xmm32).collect(),
            // Nothing is left over for promotion in 32-bit mode.
            core_callee_saves: Vec::new(),
            fp_callee_saves: Vec::new(),
            call_temps: [RAX, RCX, RDX, RBX].into_iter().map(gpr32).collect(),
            wide_is_solo: false,
            fp_wide_is_solo: true,
        }
    }
}

/// Argument register for word `index`. `Arg0` carries the method pointer,
/// so argument words start at the second argument register.
pub fn arg_reg(x64: bool, index: usize, _fp: bool, wide: bool) -> Option<RegStorage> {
    let regs: &[u8] = if x64 { &[RSI, RDX, RCX] } else { &[RCX, RDX, RBX] };
    if index >= regs.len() {
        return None;
    }
    let num = regs[index];
    Some(if wide && x64 { gpr64(num) } else { gpr32(num) })
}

/// DWARF register numbers (SysV).
pub fn dwarf_reg(x64: bool, reg: RegStorage) -> u16 {
    let num = u16::from(reg.reg_num());
    if reg.is_float() {
        return if x64 { 17 + num } else { 21 + num };
    }
    if x64 {
        // rax rdx rcx rbx rsi rdi rbp rsp then r8..
        match num {
            0 => 0,
            1 => 2,
            2 => 1,
            3 => 3,
            4 => 7,
            5 => 6,
            6 => 4,
            7 => 5,
            n => n,
        }
    } else {
        // eax ecx edx ebx esp ebp esi edi
        num
    }
}
