//! Call-frame information emission.
//!
//! Targets report frame changes (CFA adjustments, register saves) as they
//! emit prologue and epilogue LIR; the records are tagged with the LIR they
//! follow and patched to real code offsets once assembly has fixed the
//! layout. The result is a DWARF `.debug_frame` fragment for the method.

use gimli::write::{
    CallFrameInstruction, CommonInformationEntry, EndianVec, FrameDescriptionEntry, FrameTable,
    Writer,
};
use gimli::{Encoding, Format, LittleEndian, Register};

use crate::backend::lir::LirId;

/// One recorded frame-state change.
#[derive(Copy, Clone, Debug)]
enum CfiRule {
    DefCfaOffset { offset: i32 },
    Offset { reg: u16, cfa_offset: i32 },
    Restore { reg: u16 },
    RememberState,
    RestoreState,
}

/// Accumulates CFI while LIR is generated, finalized after assembly.
pub struct CfiBuilder {
    enabled: bool,
    /// `(after_lir, rule)` in emission order; `None` anchors to offset 0.
    rules: Vec<(Option<LirId>, CfiRule)>,
    current_cfa_offset: i32,
}

impl CfiBuilder {
    pub fn new(enabled: bool) -> Self {
        Self { enabled, rules: Vec::new(), current_cfa_offset: 0 }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn current_cfa_offset(&self) -> i32 {
        self.current_cfa_offset
    }

    /// The CFA is now `offset` above the stack pointer.
    pub fn def_cfa_offset(&mut self, after: Option<LirId>, offset: i32) {
        self.current_cfa_offset = offset;
        if self.enabled {
            self.rules.push((after, CfiRule::DefCfaOffset { offset }));
        }
    }

    /// `reg` was saved `cfa_offset` below the CFA.
    pub fn rel_offset(&mut self, after: Option<LirId>, reg: u16, cfa_offset: i32) {
        if self.enabled {
            self.rules.push((after, CfiRule::Offset { reg, cfa_offset }));
        }
    }

    pub fn restore(&mut self, after: Option<LirId>, reg: u16) {
        if self.enabled {
            self.rules.push((after, CfiRule::Restore { reg }));
        }
    }

    pub fn remember_state(&mut self, after: Option<LirId>) {
        if self.enabled {
            self.rules.push((after, CfiRule::RememberState));
        }
    }

    pub fn restore_state(&mut self, after: Option<LirId>) {
        if self.enabled {
            self.rules.push((after, CfiRule::RestoreState));
        }
    }

    /// Serialize to `.debug_frame` bytes. `lir_end_offset` resolves a LIR
    /// to the code offset just past it; `return_address_register` and the
    /// data alignment come from the target.
    pub fn finish(
        &self,
        code_size: u32,
        return_address_register: u16,
        stack_pointer_register: u16,
        lir_end_offset: impl Fn(LirId) -> u32,
    ) -> Vec<u8> {
        if !self.enabled {
            return Vec::new();
        }
        let encoding =
            Encoding { format: Format::Dwarf32, version: 4, address_size: 8 };
        let mut cie = CommonInformationEntry::new(
            encoding,
            /* code_alignment_factor = */ 1,
            /* data_alignment_factor = */ -4,
            Register(return_address_register),
        );
        cie.add_instruction(CallFrameInstruction::Cfa(Register(stack_pointer_register), 0));

        let mut table = FrameTable::default();
        let cie_id = table.add_cie(cie);
        let mut fde = FrameDescriptionEntry::new(
            gimli::write::Address::Constant(0),
            code_size,
        );
        for &(after, rule) in &self.rules {
            let offset = after.map_or(0, &lir_end_offset);
            let instruction = match rule {
                CfiRule::DefCfaOffset { offset } => CallFrameInstruction::CfaOffset(offset),
                CfiRule::Offset { reg, cfa_offset } => {
                    CallFrameInstruction::Offset(Register(reg), -cfa_offset)
                }
                CfiRule::Restore { reg } => CallFrameInstruction::Restore(Register(reg)),
                CfiRule::RememberState => CallFrameInstruction::RememberState,
                CfiRule::RestoreState => CallFrameInstruction::RestoreState,
            };
            fde.add_instruction(offset, instruction);
        }
        table.add_fde(cie_id, fde);

        let mut debug_frame = gimli::write::DebugFrame::from(EndianVec::new(LittleEndian));
        table.write_debug_frame(&mut debug_frame).expect("in-memory CFI write cannot fail");
        debug_frame.0.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_builder_emits_nothing() {
        let cfi = CfiBuilder::new(false);
        assert!(cfi.finish(16, 30, 31, |_| 0).is_empty());
    }

    #[test]
    fn frame_rules_serialize() {
        let mut cfi = CfiBuilder::new(true);
        cfi.def_cfa_offset(None, 64);
        cfi.rel_offset(None, 19, 64);
        assert_eq!(cfi.current_cfa_offset(), 64);
        let bytes = cfi.finish(32, 30, 31, |_| 4);
        // A CIE and one FDE at minimum.
        assert!(bytes.len() > 16);
    }
}
