//! Invoke lowering: argument marshalling and the per-dispatch-kind call
//! state machines.
//!
//! A state machine emits one instruction per step and is interleaved with
//! argument moves so that the loads of the dispatch sequence overlap the
//! argument shuffling, the same interleaving the original interpreter of
//! this ABI expects. The terminal state returns -1.

use crate::dex::{shorty_arg_width, shorty_is_fp, shorty_is_ref, InvokeType};
use crate::mir::lowering::MethodLoweringInfo;
use crate::mir::{opt_flags, MirId};

use super::layout::{self, Trampoline};
use super::regs::{Location, RegLocation};
use super::{AluOp, CodeGen, LiteralPool, OpSize, SpecialTargetRegister, Target};

/// Outgoing-argument word count above which a bulk memcpy replaces inline
/// moves.
const BULK_COPY_THRESHOLD: u32 = 16;

/// Everything the call lowering needs about one invoke site.
pub struct CallInfo {
    pub invoke_type: InvokeType,
    pub is_range: bool,
    pub method_idx: u32,
    pub opt_flags: u16,
    /// One entry per argument value (wide args take one entry).
    pub args: Vec<RegLocation>,
    pub num_arg_words: u32,
}

type NextCallInsn<T> = fn(&mut CodeGen<'_, T>, &CallInfo, i32, &MethodLoweringInfo) -> i32;

/// Copy incoming arguments from their ABI locations into their vreg homes
/// (or promoted registers). Runs at the end of the prologue.
pub fn flush_ins<T: Target>(cg: &mut CodeGen<'_, T>) {
    let num_ins = u32::from(cg.graph.num_ins);
    if num_ins == 0 {
        return;
    }
    let start_vreg = u32::from(cg.graph.first_in_vreg());
    let shorty: Vec<u8> = cg.cu.shorty.as_bytes().to_vec();
    let is_static = cg.graph.static_entry;
    let sp = cg.special_reg(SpecialTargetRegister::Sp);

    // Walk argument words; `this` occupies the first for instance methods.
    let mut word = 0u32;
    let mut shorty_pos = 1usize; // index 0 is the return type
    while word < num_ins {
        let (width, fp, ref_) = if word == 0 && !is_static {
            (1, false, true)
        } else {
            // A short shorty can only happen on malformed input; treat the
            // extra words as plain ints rather than faulting.
            let c = shorty.get(shorty_pos).copied().unwrap_or(b'I');
            shorty_pos += 1;
            (shorty_arg_width(c), shorty_is_fp(c), shorty_is_ref(c))
        };
        let wide = width == 2;
        let vreg = start_vreg + word;
        let dest = cg.loc_for_vreg(vreg, wide, fp, ref_);
        match cg.target.arg_reg(word as usize, fp, wide) {
            Some(reg) => {
                cg.store_value(dest, reg);
            }
            None => {
                // Stack-passed: copy from above the frame into the home,
                // word at a time so one scratch register always suffices.
                let in_disp =
                    (cg.frame_size + T::ISA.pointer_size() + word * 4) as i32;
                let tmp = cg.reg_pool.alloc_temp();
                if !tmp.is_valid() {
                    cg.punt_to_interpreter = true;
                    return;
                }
                let home = cg.s_reg_offset(vreg);
                for half in 0..width {
                    let off = (half * 4) as i32;
                    T::load_base_disp(cg, sp, in_disp + off, tmp, OpSize::Word);
                    T::store_base_disp(cg, sp, home + off, tmp, OpSize::Word);
                }
                cg.reg_pool.free_temp(tmp);
                // A promoted argument also wants its pinned register
                // populated.
                if dest.location == Location::PhysReg {
                    let size = if wide { OpSize::Wide } else { OpSize::Word };
                    T::load_base_disp(cg, sp, home, dest.reg, size);
                }
            }
        }
        word += width;
    }
}

/// Build the call info for an invoke MIR.
fn build_call_info<T: Target>(cg: &CodeGen<'_, T>, mir_id: MirId) -> CallInfo {
    let mir = cg.graph.mir(mir_id);
    let insn = mir.dalvik;
    let is_range = insn.opcode.is_invoke_range();
    let info = cg.graph.method_lowering_info(mir);
    let invoke_type = info.invoke_type;

    // Argument types come from the target's shorty; quickened invokes fall
    // back to the devirtualized target when the verifier supplied one.
    let shorty_owner;
    let shorty: &[u8] = if info.is_quickened {
        match info.devirt_target {
            Some(devirt) if devirt.dex_file == cg.cu.dex_file.id => {
                shorty_owner = cg.cu.dex_file.method_shorty(devirt.method_idx).to_string();
                shorty_owner.as_bytes()
            }
            _ => b"V",
        }
    } else {
        shorty_owner = cg.cu.dex_file.method_shorty(insn.vb).to_string();
        shorty_owner.as_bytes()
    };

    let mut args = Vec::new();
    let mut word = 0u32;
    let mut shorty_pos = 1usize;
    let num_arg_words = insn.va;
    let arg_vreg = |w: u32| if is_range { insn.vc + w } else { insn.arg[w as usize] };
    while word < num_arg_words {
        let (width, fp, ref_) = if word == 0 && invoke_type != InvokeType::Static {
            (1, false, true)
        } else if shorty_pos < shorty.len() {
            let c = shorty[shorty_pos];
            shorty_pos += 1;
            (shorty_arg_width(c), shorty_is_fp(c), shorty_is_ref(c))
        } else {
            (1, false, false)
        };
        let wide = width == 2;
        args.push(cg.loc_for_vreg(arg_vreg(word), wide, fp, ref_));
        word += width;
    }
    CallInfo {
        invoke_type,
        is_range,
        method_idx: insn.vb,
        opt_flags: mir.optimization_flags,
        args,
        num_arg_words,
    }
}

/// Lower one invoke MIR.
pub fn gen_invoke<T: Target>(cg: &mut CodeGen<'_, T>, mir_id: MirId) {
    let info = build_call_info(cg, mir_id);
    let ml = cg.graph.method_lowering_info(cg.graph.mir(mir_id)).clone();

    cg.reg_pool.clobber_all();
    cg.reg_pool.lock_call_temps();

    let next: NextCallInsn<T> = if !ml.fast_path() {
        match info.invoke_type {
            InvokeType::Static => next_static_call_insn_sp,
            InvokeType::Direct => next_direct_call_insn_sp,
            InvokeType::Super => next_super_call_insn_sp,
            InvokeType::Virtual => next_virtual_call_insn_sp,
            InvokeType::Interface => next_interface_call_insn_sp,
        }
    } else {
        match ml.sharp_type {
            InvokeType::Static | InvokeType::Direct => next_sd_call_insn,
            InvokeType::Super => next_sd_call_insn,
            InvokeType::Virtual => next_virtual_call_insn,
            InvokeType::Interface => next_interface_call_insn,
        }
    };

    let mut state = next(cg, &info, 0, &ml);
    state = gen_dalvik_args(cg, &info, state, next, &ml);
    while state != -1 {
        state = next(cg, &info, state, &ml);
    }

    // Instance dispatch through a known target still needs the receiver
    // null-checked; virtual and interface paths get it from the class
    // load.
    if matches!(ml.sharp_type, InvokeType::Direct | InvokeType::Super)
        && info.invoke_type != InvokeType::Static
        && info.opt_flags & opt_flags::IGNORE_NULL_CHECK == 0
    {
        let this_reg = cg.special_reg(SpecialTargetRegister::Arg1);
        cg.gen_null_check(this_reg, info.opt_flags);
    }

    if let Some(target) = cg.pending_direct_call.take() {
        let call = T::op_call_direct(cg);
        cg.relative_call_sites.push((call, target));
    } else {
        let tgt = cg.special_reg(SpecialTargetRegister::InvokeTgt);
        T::op_call_reg(cg, tgt);
    }
    cg.mark_safepoint();
    cg.reg_pool.free_call_temps();
    cg.reg_pool.clobber_all();
}

//=============================================================================
// Argument marshalling

/// Move the arguments into registers and out slots, advancing the call
/// state machine between moves.
fn gen_dalvik_args<T: Target>(
    cg: &mut CodeGen<'_, T>,
    info: &CallInfo,
    mut state: i32,
    next: NextCallInsn<T>,
    ml: &MethodLoweringInfo,
) -> i32 {
    let sp = cg.special_reg(SpecialTargetRegister::Sp);

    if info.is_range && info.num_arg_words > BULK_COPY_THRESHOLD {
        state = gen_bulk_copy(cg, info, state, next, ml);
        // Registers still carry their words after the bulk copy.
        let mut word = 0u32;
        for arg in &info.args {
            let wide = arg.wide;
            if let Some(reg) = cg.target.arg_reg(word as usize, arg.fp, wide) {
                cg.load_value_direct_fixed(*arg, reg);
                state = next(cg, info, state, ml);
            }
            word += if wide { 2 } else { 1 };
        }
        return state;
    }

    let mut word = 0u32;
    for arg in &info.args {
        let wide = arg.wide;
        match cg.target.arg_reg(word as usize, arg.fp, wide) {
            Some(reg) => {
                cg.load_value_direct_fixed(*arg, reg);
            }
            None => {
                // Stack-passed: copy word at a time from the vreg home so
                // one scratch register always suffices, even while the
                // call registers are locked.
                let tmp = cg.reg_pool.alloc_temp();
                if !tmp.is_valid() {
                    cg.punt_to_interpreter = true;
                    return state;
                }
                let home = cg.s_reg_offset(arg.s_reg_low as u32);
                let out = cg.out_offset(word);
                let words = if wide { 2 } else { 1 };
                for half in 0..words {
                    let off = half * 4;
                    T::load_base_disp(cg, sp, home + off, tmp, OpSize::Word);
                    T::store_base_disp(cg, sp, out + off, tmp, OpSize::Word);
                }
                cg.reg_pool.free_temp(tmp);
            }
        }
        state = next(cg, info, state, ml);
        word += if wide { 2 } else { 1 };
    }
    state
}

/// Copy a long contiguous range of outgoing words with the runtime's
/// memcpy instead of word-by-word moves.
fn gen_bulk_copy<T: Target>(
    cg: &mut CodeGen<'_, T>,
    info: &CallInfo,
    state: i32,
    next: NextCallInsn<T>,
    ml: &MethodLoweringInfo,
) -> i32 {
    debug_assert!(info.is_range);
    let first_vreg = info.args[0].s_reg_low as u32;
    let bytes = info.num_arg_words * 4;
    let sp = cg.special_reg(SpecialTargetRegister::Sp);
    let arg0 = cg.special_reg(SpecialTargetRegister::Arg0);
    let arg1 = cg.special_reg(SpecialTargetRegister::Arg1);
    let arg2 = cg.special_reg(SpecialTargetRegister::Arg2);
    let out_base = cg.out_offset(0);
    let in_base = cg.s_reg_offset(first_vreg);
    T::op_reg_reg_imm(cg, AluOp::Add, arg0, sp, out_base, false);
    T::op_reg_reg_imm(cg, AluOp::Add, arg1, sp, in_base, false);
    T::load_constant(cg, arg2, bytes as i32);
    cg.call_trampoline(Trampoline::Memcpy);
    // The helper clobbered the dispatch state; restart the sequence.
    let mut state = state;
    while state != -1 {
        state = next(cg, info, state, ml);
    }
    next(cg, info, 0, ml)
}

//=============================================================================
// Dispatch state machines

/// Fast path for static and direct (and sharpened super) invokes with a
/// resolved target: the method pointer comes from the literal pool, the
/// code address from the target's entry point or a patched code literal.
fn next_sd_call_insn<T: Target>(
    cg: &mut CodeGen<'_, T>,
    _info: &CallInfo,
    state: i32,
    ml: &MethodLoweringInfo,
) -> i32 {
    match state {
        0 => {
            // kArg0 := target ArtMethod*
            let pool_index = cg.add_method_literal(ml.target);
            let arg0 = cg.special_reg(SpecialTargetRegister::Arg0);
            T::op_load_pool_entry(cg, LiteralPool::Method, pool_index, arg0);
            1
        }
        1 => {
            let tgt = cg.special_reg(SpecialTargetRegister::InvokeTgt);
            if ml.direct_code != 0 {
                if cg.cu.options.compile_pic {
                    // The call itself becomes a PC-relative branch patched
                    // by the linker; nothing to load.
                    cg.pending_direct_call = Some(ml.target);
                } else {
                    // Known code address, patched by the linker.
                    let pool_index = cg.add_code_literal(ml.target);
                    T::op_load_pool_entry(cg, LiteralPool::Code, pool_index, tgt);
                }
            } else {
                let arg0 = cg.special_reg(SpecialTargetRegister::Arg0);
                let disp = layout::method_quick_code_offset(T::ISA.pointer_size());
                T::load_base_disp(cg, arg0, disp, tgt, OpSize::Ref);
            }
            -1
        }
        _ => -1,
    }
}

/// Fully resolved virtual dispatch: `this->klass->embedded_vtable[idx]`.
fn next_virtual_call_insn<T: Target>(
    cg: &mut CodeGen<'_, T>,
    info: &CallInfo,
    state: i32,
    ml: &MethodLoweringInfo,
) -> i32 {
    match state {
        0 => {
            // kArg1 := this
            let arg1 = cg.special_reg(SpecialTargetRegister::Arg1);
            cg.load_value_direct_fixed(info.args[0], arg1);
            1
        }
        1 => {
            // kArg0 := this->klass, with the receiver null check.
            let arg1 = cg.special_reg(SpecialTargetRegister::Arg1);
            cg.gen_null_check(arg1, info.opt_flags);
            let arg0 = cg.special_reg(SpecialTargetRegister::Arg0);
            T::load_base_disp(cg, arg1, layout::OBJECT_CLASS_OFFSET, arg0, OpSize::Ref);
            2
        }
        2 => {
            // kArg0 := klass->embedded_vtable[idx]
            let arg0 = cg.special_reg(SpecialTargetRegister::Arg0);
            let disp =
                layout::embedded_vtable_entry_offset(ml.vtable_index, T::ISA.pointer_size());
            T::load_base_disp(cg, arg0, disp, arg0, OpSize::Ref);
            3
        }
        3 => {
            // kInvokeTgt := method->entry_point
            let arg0 = cg.special_reg(SpecialTargetRegister::Arg0);
            let tgt = cg.special_reg(SpecialTargetRegister::InvokeTgt);
            let disp = layout::method_quick_code_offset(T::ISA.pointer_size());
            T::load_base_disp(cg, arg0, disp, tgt, OpSize::Ref);
            -1
        }
        _ => -1,
    }
}

/// Interface dispatch through the IMT, passing the method index in the
/// hidden argument register for the conflict trampoline.
fn next_interface_call_insn<T: Target>(
    cg: &mut CodeGen<'_, T>,
    info: &CallInfo,
    state: i32,
    ml: &MethodLoweringInfo,
) -> i32 {
    match state {
        0 => {
            let hidden = cg.special_reg(SpecialTargetRegister::HiddenArg);
            T::load_constant(cg, hidden, ml.target.method_idx as i32);
            1
        }
        1 => {
            let arg1 = cg.special_reg(SpecialTargetRegister::Arg1);
            cg.load_value_direct_fixed(info.args[0], arg1);
            2
        }
        2 => {
            let arg1 = cg.special_reg(SpecialTargetRegister::Arg1);
            cg.gen_null_check(arg1, info.opt_flags);
            let arg0 = cg.special_reg(SpecialTargetRegister::Arg0);
            T::load_base_disp(cg, arg1, layout::OBJECT_CLASS_OFFSET, arg0, OpSize::Ref);
            3
        }
        3 => {
            let arg0 = cg.special_reg(SpecialTargetRegister::Arg0);
            let disp =
                layout::embedded_imtable_entry_offset(ml.vtable_index, T::ISA.pointer_size());
            T::load_base_disp(cg, arg0, disp, arg0, OpSize::Ref);
            4
        }
        4 => {
            let arg0 = cg.special_reg(SpecialTargetRegister::Arg0);
            let tgt = cg.special_reg(SpecialTargetRegister::InvokeTgt);
            let disp = layout::method_quick_code_offset(T::ISA.pointer_size());
            T::load_base_disp(cg, arg0, disp, tgt, OpSize::Ref);
            -1
        }
        _ => -1,
    }
}

/// Unresolved targets bail to a resolution-and-invoke trampoline with the
/// method index in kArg0.
fn next_invoke_insn_sp<T: Target>(
    cg: &mut CodeGen<'_, T>,
    trampoline: Trampoline,
    state: i32,
    method_idx: u32,
) -> i32 {
    if state == 0 {
        // The final transfer goes through kInvokeTgt on every target, so
        // materialize the trampoline's entry point there.
        let self_reg = cg.special_reg(SpecialTargetRegister::SelfThread);
        let tgt = cg.special_reg(SpecialTargetRegister::InvokeTgt);
        let disp = layout::trampoline_offset(trampoline, T::ISA.pointer_size());
        T::load_base_disp(cg, self_reg, disp, tgt, OpSize::Ref);
        let arg0 = cg.special_reg(SpecialTargetRegister::Arg0);
        T::load_constant(cg, arg0, method_idx as i32);
        return 1;
    }
    -1
}

fn next_static_call_insn_sp<T: Target>(
    cg: &mut CodeGen<'_, T>,
    _info: &CallInfo,
    state: i32,
    ml: &MethodLoweringInfo,
) -> i32 {
    next_invoke_insn_sp(
        cg,
        Trampoline::InvokeStaticTrampolineWithAccessCheck,
        state,
        ml.target.method_idx,
    )
}

fn next_direct_call_insn_sp<T: Target>(
    cg: &mut CodeGen<'_, T>,
    _info: &CallInfo,
    state: i32,
    ml: &MethodLoweringInfo,
) -> i32 {
    next_invoke_insn_sp(
        cg,
        Trampoline::InvokeDirectTrampolineWithAccessCheck,
        state,
        ml.target.method_idx,
    )
}

fn next_super_call_insn_sp<T: Target>(
    cg: &mut CodeGen<'_, T>,
    _info: &CallInfo,
    state: i32,
    ml: &MethodLoweringInfo,
) -> i32 {
    next_invoke_insn_sp(
        cg,
        Trampoline::InvokeSuperTrampolineWithAccessCheck,
        state,
        ml.target.method_idx,
    )
}

fn next_virtual_call_insn_sp<T: Target>(
    cg: &mut CodeGen<'_, T>,
    _info: &CallInfo,
    state: i32,
    ml: &MethodLoweringInfo,
) -> i32 {
    next_invoke_insn_sp(
        cg,
        Trampoline::InvokeVirtualTrampolineWithAccessCheck,
        state,
        ml.target.method_idx,
    )
}

fn next_interface_call_insn_sp<T: Target>(
    cg: &mut CodeGen<'_, T>,
    _info: &CallInfo,
    state: i32,
    ml: &MethodLoweringInfo,
) -> i32 {
    next_invoke_insn_sp(
        cg,
        Trampoline::InvokeInterfaceTrampolineWithAccessCheck,
        state,
        ml.target.method_idx,
    )
}

