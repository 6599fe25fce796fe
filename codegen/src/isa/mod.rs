//! Per-ISA backends.
//!
//! Each architecture module provides a [`crate::backend::Target`]
//! implementation: register environment, lowering primitives, and the
//! encoder pair used by the two-pass assembler. The backend is selected
//! once per method; no per-instruction dynamic dispatch exists.

#[cfg(feature = "arm")]
pub mod arm;
#[cfg(feature = "arm64")]
pub mod arm64;
#[cfg(feature = "mips")]
pub mod mips;
#[cfg(feature = "x86")]
pub mod x86;

use crate::insn::Opcode;
use crate::options::InstructionSet;

/// Opcodes an ISA cannot compile; `None` means everything is supported.
/// Every enabled backend currently supports the full set, but the gate
/// stays: a new backend starts life with a list here.
pub fn unsupported_opcodes(isa: InstructionSet) -> Option<&'static [Opcode]> {
    match isa {
        InstructionSet::Thumb2
        | InstructionSet::Arm64
        | InstructionSet::X86
        | InstructionSet::X86_64
        | InstructionSet::Mips => None,
    }
}

/// Shorty characters an ISA supports; `None` means all of them.
pub fn supported_shorty_types(isa: InstructionSet) -> Option<&'static str> {
    match isa {
        InstructionSet::Thumb2
        | InstructionSet::Arm64
        | InstructionSet::X86
        | InstructionSet::X86_64
        | InstructionSet::Mips => None,
    }
}

/// True if this build carries a backend for `isa`.
pub fn is_isa_enabled(isa: InstructionSet) -> bool {
    match isa {
        InstructionSet::Thumb2 => cfg!(feature = "arm"),
        InstructionSet::Arm64 => cfg!(feature = "arm64"),
        InstructionSet::X86 | InstructionSet::X86_64 => cfg!(feature = "x86"),
        InstructionSet::Mips => cfg!(feature = "mips"),
    }
}
