//! Static per-opcode facts: analysis attributes for the method filter and
//! def/use summaries for the optimization passes and GC-map replay.

use smallvec::{smallvec, SmallVec};

use crate::insn::{DecodedInsn, Opcode};
use crate::mir::{Mir, MirOpcode, SsaRep};

/// Analysis attribute bits, used by the soft filter's statistics walk.
pub mod attrs {
    pub const NONE: u16 = 1 << 0;
    pub const MATH: u16 = 1 << 1;
    pub const FP: u16 = 1 << 2;
    pub const LONG: u16 = 1 << 3;
    pub const INT: u16 = 1 << 4;
    pub const BRANCH: u16 = 1 << 5;
    pub const INVOKE: u16 = 1 << 6;
    pub const ARRAY_OP: u16 = 1 << 7;
    pub const HEAVYWEIGHT: u16 = 1 << 8;
    pub const SIMPLE_CONST: u16 = 1 << 9;
    pub const MOVE: u16 = 1 << 10;
    pub const SWITCH: u16 = 1 << 11;

    /// Ops that keep a block "computational" for the loop heuristic.
    pub const COMPUTATIONAL: u16 = MATH | ARRAY_OP | MOVE | SIMPLE_CONST;
}

/// Analysis attributes of one opcode.
pub fn analysis_attrs(opcode: MirOpcode) -> u16 {
    use attrs::*;
    let op = match opcode {
        MirOpcode::Dex(op) => op,
        // Pseudo MIR is invisible to the filter statistics.
        MirOpcode::Pseudo(_) => return NONE,
    };
    let byte = op as u8;
    match byte {
        // nop
        0x00 => NONE,
        // moves, including move-result and move-exception
        0x01..=0x0d => MOVE,
        // returns
        0x0e..=0x11 => BRANCH,
        // const/4 .. const-wide/high16
        0x12..=0x19 => SIMPLE_CONST,
        // const-string .. check-cast, instance-of
        0x1a..=0x20 => NONE,
        // array-length
        0x21 => ARRAY_OP,
        // new-instance .. filled-new-array/range
        0x22..=0x25 => HEAVYWEIGHT,
        // fill-array-data
        0x26 => NONE,
        // throw
        0x27 => HEAVYWEIGHT | BRANCH,
        // goto family
        0x28..=0x2a => BRANCH,
        // switches
        0x2b..=0x2c => SWITCH,
        // cmpl/cmpg float
        0x2d..=0x2e => MATH | FP,
        // cmpl/cmpg double
        0x2f..=0x30 => MATH | FP,
        // cmp-long
        0x31 => MATH | LONG,
        // if-test, if-testz
        0x32..=0x3d => MATH | BRANCH | INT,
        // aget/aput families
        0x44..=0x51 => ARRAY_OP,
        // field accesses resolve to loads and stores; uninteresting here
        0x52..=0x6d => NONE,
        // invokes
        0x6e..=0x72 | 0x74..=0x78 => INVOKE | HEAVYWEIGHT,
        0x73 => BRANCH,
        // int unops and conversions out of int
        0x7b | 0x7c | 0x8d..=0x8f => MATH | INT,
        0x7d | 0x7e | 0x84 => MATH | LONG,
        0x7f | 0x87 | 0x88 | 0x89 => MATH | FP,
        0x80 | 0x8a | 0x8b | 0x8c => MATH | FP,
        0x81 => MATH | INT | LONG,
        0x82 | 0x83 => MATH | FP | INT,
        0x85 | 0x86 => MATH | FP | LONG,
        // int binops
        0x90..=0x9a => MATH | INT,
        // long binops
        0x9b..=0xa5 => MATH | LONG,
        // float binops
        0xa6..=0xaa => MATH | FP,
        // double binops
        0xab..=0xaf => MATH | FP,
        // 2addr forms mirror the base forms
        0xb0..=0xba => MATH | INT,
        0xbb..=0xc5 => MATH | LONG,
        0xc6..=0xca => MATH | FP,
        0xcb..=0xcf => MATH | FP,
        // literal forms
        0xd0..=0xe2 => MATH | INT,
        // quickened field ops
        0xe3..=0xe8 => NONE,
        // quickened invokes
        0xe9..=0xea => INVOKE | HEAVYWEIGHT,
        _ => NONE,
    }
}

/// True if the instruction's definition is 64 bits wide.
pub fn def_is_wide(op: Opcode) -> bool {
    matches!(
        op,
        Opcode::MoveWide
            | Opcode::MoveWideFrom16
            | Opcode::MoveWide16
            | Opcode::MoveResultWide
            | Opcode::ConstWide16
            | Opcode::ConstWide32
            | Opcode::ConstWide
            | Opcode::ConstWideHigh16
            | Opcode::AgetWide
            | Opcode::IgetWide
            | Opcode::IgetWideQuick
            | Opcode::SgetWide
            | Opcode::IntToLong
            | Opcode::IntToDouble
            | Opcode::LongToDouble
            | Opcode::FloatToLong
            | Opcode::FloatToDouble
            | Opcode::DoubleToLong
            | Opcode::NegLong
            | Opcode::NotLong
            | Opcode::NegDouble
    ) || matches!(op as u8, 0x9b..=0xa5 | 0xab..=0xaf | 0xbb..=0xc5 | 0xcb..=0xcf)
}

/// True if the instruction's definition is an object reference.
pub fn def_is_ref(op: Opcode) -> bool {
    matches!(
        op,
        Opcode::MoveObject
            | Opcode::MoveObjectFrom16
            | Opcode::MoveObject16
            | Opcode::MoveResultObject
            | Opcode::MoveException
            | Opcode::ConstString
            | Opcode::ConstStringJumbo
            | Opcode::ConstClass
            | Opcode::NewInstance
            | Opcode::NewArray
            | Opcode::AgetObject
            | Opcode::IgetObject
            | Opcode::IgetObjectQuick
            | Opcode::SgetObject
    )
}

/// Compute the def/use summary for a decoded instruction. Wide values are
/// named by their low vreg only.
pub fn compute_ssa_rep(opcode: MirOpcode, insn: &DecodedInsn) -> SsaRep {
    let op = match opcode {
        MirOpcode::Dex(op) => op,
        MirOpcode::Pseudo(_) => return SsaRep::default(),
    };
    let byte = op as u8;
    let (defs, uses): (SmallVec<[u32; 2]>, SmallVec<[u32; 4]>) = match byte {
        // moves
        0x01..=0x09 => (smallvec![insn.va], smallvec![insn.vb]),
        // move-result, move-exception
        0x0a..=0x0d => (smallvec![insn.va], smallvec![]),
        // return with operand
        0x0f..=0x11 => (smallvec![], smallvec![insn.va]),
        // consts, const-string, const-class
        0x12..=0x1c => (smallvec![insn.va], smallvec![]),
        // monitor-enter/exit, throw
        0x1d | 0x1e | 0x27 => (smallvec![], smallvec![insn.va]),
        // check-cast
        0x1f => (smallvec![], smallvec![insn.va]),
        // instance-of, array-length, new-array
        0x20 | 0x21 | 0x23 => (smallvec![insn.va], smallvec![insn.vb]),
        // new-instance
        0x22 => (smallvec![insn.va], smallvec![]),
        // filled-new-array
        0x24 => (smallvec![], (0..insn.va as usize).map(|i| insn.arg[i]).collect()),
        0x25 => (smallvec![], (0..insn.va).map(|i| insn.vc + i).collect()),
        // fill-array-data, switches
        0x26 | 0x2b | 0x2c => (smallvec![], smallvec![insn.va]),
        // cmp
        0x2d..=0x31 => (smallvec![insn.va], smallvec![insn.vb, insn.vc]),
        // if-test
        0x32..=0x37 => (smallvec![], smallvec![insn.va, insn.vb]),
        // if-testz
        0x38..=0x3d => (smallvec![], smallvec![insn.va]),
        // aget
        0x44..=0x4a => (smallvec![insn.va], smallvec![insn.vb, insn.vc]),
        // aput
        0x4b..=0x51 => (smallvec![], smallvec![insn.va, insn.vb, insn.vc]),
        // iget (+quickened)
        0x52..=0x58 | 0xe3..=0xe5 => (smallvec![insn.va], smallvec![insn.vb]),
        // iput (+quickened)
        0x59..=0x5f | 0xe6..=0xe8 => (smallvec![], smallvec![insn.va, insn.vb]),
        // sget
        0x60..=0x66 => (smallvec![insn.va], smallvec![]),
        // sput
        0x67..=0x6d => (smallvec![], smallvec![insn.va]),
        // invoke {args}
        0x6e..=0x72 | 0xe9 => {
            (smallvec![], (0..insn.va as usize).map(|i| insn.arg[i]).collect())
        }
        // invoke/range
        0x74..=0x78 | 0xea => (smallvec![], (0..insn.va).map(|i| insn.vc + i).collect()),
        // unops
        0x7b..=0x8f => (smallvec![insn.va], smallvec![insn.vb]),
        // binops
        0x90..=0xaf => (smallvec![insn.va], smallvec![insn.vb, insn.vc]),
        // 2addr binops
        0xb0..=0xcf => (smallvec![insn.va], smallvec![insn.va, insn.vb]),
        // literal binops
        0xd0..=0xe2 => (smallvec![insn.va], smallvec![insn.vb]),
        _ => (smallvec![], smallvec![]),
    };
    SsaRep { uses, defs }
}

/// Update a per-vreg reference bitmap across one MIR, for safepoint GC
/// maps. Setting over-approximates; a non-reference def conservatively
/// clears the bit (and its pair for wide defs).
pub fn update_reference_vregs(mir: &Mir, references: &mut [bool]) {
    let op = match mir.opcode {
        MirOpcode::Dex(op) => op,
        MirOpcode::Pseudo(_) => return,
    };
    for &def in &mir.ssa_rep.defs {
        let def = def as usize;
        if def >= references.len() {
            continue;
        }
        if def_is_ref(op) {
            references[def] = true;
        } else {
            references[def] = false;
            if def_is_wide(op) && def + 1 < references.len() {
                references[def + 1] = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::DecodedInsn;
    use crate::mir::MirOpcode;

    fn rep(insns: &[u16]) -> SsaRep {
        let insn = DecodedInsn::decode(insns, 0);
        compute_ssa_rep(MirOpcode::Dex(insn.opcode), &insn)
    }

    #[test]
    fn binop_defs_and_uses() {
        // add-int v1, v2, v3
        let r = rep(&[0x0190, 0x0302]);
        assert_eq!(r.defs.as_slice(), [1]);
        assert_eq!(r.uses.as_slice(), [2, 3]);
    }

    #[test]
    fn two_addr_uses_dest() {
        // add-int/2addr v1, v2
        let r = rep(&[0x21b0]);
        assert_eq!(r.defs.as_slice(), [1]);
        assert_eq!(r.uses.as_slice(), [1, 2]);
    }

    #[test]
    fn invoke_uses_args() {
        // invoke-static {v4, v5}, method@0
        let r = rep(&[0x2071, 0x0000, 0x0054]);
        assert_eq!(r.uses.as_slice(), [4, 5]);
        assert!(r.defs.is_empty());
    }

    #[test]
    fn attrs_match_filter_expectations() {
        assert_eq!(analysis_attrs(MirOpcode::Dex(Opcode::AddInt)), attrs::MATH | attrs::INT);
        assert_eq!(
            analysis_attrs(MirOpcode::Dex(Opcode::Throw)),
            attrs::HEAVYWEIGHT | attrs::BRANCH
        );
        assert_eq!(analysis_attrs(MirOpcode::Dex(Opcode::PackedSwitch)), attrs::SWITCH);
        assert_eq!(analysis_attrs(MirOpcode::Dex(Opcode::Move)), attrs::MOVE);
        assert!(analysis_attrs(MirOpcode::Dex(Opcode::AddDouble)) & attrs::FP != 0);
    }

    #[test]
    fn reference_replay() {
        let insns = [0x0022u16, 0x0000]; // new-instance v0, type@0
        let insn = DecodedInsn::decode(&insns, 0);
        let mir = Mir {
            opcode: MirOpcode::Dex(insn.opcode),
            dalvik: insn,
            offset: 0,
            optimization_flags: 0,
            ssa_rep: compute_ssa_rep(MirOpcode::Dex(insn.opcode), &insn),
            meta: crate::mir::MirMeta::None,
            bb: crate::mir::Block::from_u32(0),
            next: None,
        };
        let mut refs = [false; 2];
        update_reference_vregs(&mir, &mut refs);
        assert!(refs[0]);
    }
}
