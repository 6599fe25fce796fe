//! Canned code for inliner-special methods.
//!
//! These stubs run without a frame: no spills, no suspend check, no GC
//! interaction beyond the card mark of a setter. The receiver of a getter
//! or setter is `this`, which the calling convention guarantees non-null,
//! so no check and therefore no throwing slow path is needed.

use crate::inliner::InlinePattern;
use crate::mir::lowering::MemAccessType;

use super::lir::PseudoLir;
use super::regs::RegClass;
use super::{CodeGen, OpSize, SpecialTargetRegister, Target};

/// Try to emit the canned stub; `false` falls back to the full path.
pub fn gen_special<T: Target>(cg: &mut CodeGen<'_, T>, pattern: InlinePattern) -> bool {
    // Feasibility must be decided before any state changes; the full path
    // runs on the same `CodeGen` when the stub declines.
    if matches!(pattern, InlinePattern::IGet { .. } | InlinePattern::IPut { .. })
        && cg.target.arg_reg(0, false, false).is_none()
    {
        return false;
    }

    // No frame: the stub neither spills nor calls.
    cg.frame_size = 0;
    cg.core_spill_mask = 0;
    cg.fp_spill_mask = 0;
    cg.num_core_spills = 0;
    cg.num_fp_spills = 0;

    cg.append_pseudo(PseudoLir::PrologueBegin);
    cg.append_pseudo(PseudoLir::PrologueEnd);

    match pattern {
        InlinePattern::Empty => {}
        InlinePattern::Const { value, wide } => {
            let ret = cg.target.return_reg(false, wide);
            if wide {
                T::load_constant_wide(cg, ret, value);
            } else {
                T::load_constant(cg, ret, value as i32);
            }
        }
        InlinePattern::ReturnArg { arg, wide, is_object } => {
            let word = usize::from(arg) + usize::from(!cg.graph.static_entry);
            let ret = cg.target.return_reg(false, wide);
            match cg.target.arg_reg(word, false, wide) {
                Some(reg) => {
                    if reg != ret {
                        T::op_move(cg, ret, reg);
                    }
                }
                None => {
                    let sp = cg.special_reg(SpecialTargetRegister::Sp);
                    let disp = (T::ISA.pointer_size() + word as u32 * 4) as i32;
                    let size = if wide {
                        OpSize::Wide
                    } else if is_object {
                        OpSize::Ref
                    } else {
                        OpSize::Word
                    };
                    T::load_base_disp(cg, sp, disp, ret, size);
                }
            }
        }
        InlinePattern::IGet { field, access_type, .. } => {
            // The feasibility check above guarantees a receiver register.
            let this = cg.target.arg_reg(0, false, false).unwrap();
            let wide = access_type == MemAccessType::Wide;
            let ret = cg.target.return_reg(false, wide);
            T::load_base_disp(cg, this, field.field_offset as i32, ret, access_size(access_type));
        }
        InlinePattern::IPut { field, access_type, src_arg, .. } => {
            let this = cg.target.arg_reg(0, false, false).unwrap();
            let wide = access_type == MemAccessType::Wide;
            let word = 1 + usize::from(src_arg);
            let src = match cg.target.arg_reg(word, false, wide) {
                Some(reg) => reg,
                None => {
                    let sp = cg.special_reg(SpecialTargetRegister::Sp);
                    let tmp = cg.reg_pool.alloc_typed_temp(RegClass::Core, wide);
                    if !tmp.is_valid() {
                        // Fresh pools cannot run dry here; bail to the
                        // interpreter rather than emit half a stub.
                        cg.punt_to_interpreter = true;
                        return true;
                    }
                    let disp = (T::ISA.pointer_size() + word as u32 * 4) as i32;
                    T::load_base_disp(cg, sp, disp, tmp, access_size(access_type));
                    tmp
                }
            };
            T::store_base_disp(cg, this, field.field_offset as i32, src, access_size(access_type));
            if access_type == MemAccessType::Object {
                cg.mark_gc_card(src, this, false);
            }
        }
    }

    cg.append_pseudo(PseudoLir::EpilogueBegin);
    T::gen_exit_sequence(cg);
    cg.append_pseudo(PseudoLir::EpilogueEnd);
    log::debug!("emitted special stub for {:?}", pattern);
    true
}

fn access_size(access: MemAccessType) -> OpSize {
    match access {
        MemAccessType::Word => OpSize::Word,
        MemAccessType::Wide => OpSize::Wide,
        MemAccessType::Object => OpSize::Ref,
        MemAccessType::Boolean => OpSize::UnsignedByte,
        MemAccessType::Byte => OpSize::SignedByte,
        MemAccessType::Char => OpSize::UnsignedHalf,
        MemAccessType::Short => OpSize::SignedHalf,
    }
}
