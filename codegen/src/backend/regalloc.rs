//! The simple local register allocator.
//!
//! Temps are handed out round-robin from per-class pools and invalidated
//! wholesale at call boundaries and instruction edges. Promotion pins the
//! hottest vregs to callee-save registers for the whole method; everything
//! else lives in the frame's vreg array between instructions.

use rustc_hash::FxHashSet;

use crate::backend::regs::{
    PromotionLocation, PromotionMapEntry, RegClass, RegStorage, INVALID_SREG,
};
use crate::mir::dataflow::def_is_wide;
use crate::mir::{MirGraph, MirOpcode};
use crate::mir::dataflow::{analysis_attrs, attrs};

/// Allocation state of one physical register.
#[derive(Clone, Debug)]
pub struct RegisterInfo {
    pub reg: RegStorage,
    pub is_temp: bool,
    pub in_use: bool,
    /// Vreg whose value this register currently holds, if tracked live.
    pub s_reg: i32,
    pub live: bool,
}

impl RegisterInfo {
    fn new(reg: RegStorage, is_temp: bool) -> Self {
        Self { reg, is_temp, in_use: false, s_reg: INVALID_SREG, live: false }
    }
}

/// What the target contributes to pool construction.
#[derive(Clone, Debug, Default)]
pub struct RegPoolTemplate {
    pub core_temps: Vec<RegStorage>,
    pub fp_temps: Vec<RegStorage>,
    /// Callee-saves available for promotion.
    pub core_callee_saves: Vec<RegStorage>,
    pub fp_callee_saves: Vec<RegStorage>,
    /// Argument-passing registers, reserved around invoke sequences.
    pub call_temps: Vec<RegStorage>,
    /// Wide values use a solo 64-bit register rather than a pair.
    pub wide_is_solo: bool,
    /// Doubles use a solo 64-bit FP register even when core values pair.
    pub fp_wide_is_solo: bool,
}

pub struct RegisterPool {
    pub core_regs: Vec<RegisterInfo>,
    pub fp_regs: Vec<RegisterInfo>,
    next_core: usize,
    next_fp: usize,
    call_temps: Vec<RegStorage>,
    pub wide_is_solo: bool,
    pub fp_wide_is_solo: bool,
}

impl RegisterPool {
    pub fn new(template: &RegPoolTemplate) -> Self {
        let core_regs =
            template.core_temps.iter().map(|&r| RegisterInfo::new(r, true)).collect();
        let fp_regs = template.fp_temps.iter().map(|&r| RegisterInfo::new(r, true)).collect();
        Self {
            core_regs,
            fp_regs,
            next_core: 0,
            next_fp: 0,
            call_temps: template.call_temps.clone(),
            wide_is_solo: template.wide_is_solo,
            fp_wide_is_solo: template.fp_wide_is_solo,
        }
    }

    fn alloc_from(regs: &mut [RegisterInfo], next: &mut usize) -> RegStorage {
        let len = regs.len();
        for step in 0..len {
            let index = (*next + step) % len;
            if regs[index].is_temp && !regs[index].in_use {
                regs[index].in_use = true;
                regs[index].live = false;
                regs[index].s_reg = INVALID_SREG;
                *next = (index + 1) % len;
                return regs[index].reg;
            }
        }
        // Running out of temps means the codegen kept too many values
        // live; this is a register-pressure budget failure, reported by
        // the caller as punt-to-interpreter.
        RegStorage::INVALID
    }

    /// Allocate a 32-bit core temp. Invalid when the pool is exhausted.
    pub fn alloc_temp(&mut self) -> RegStorage {
        Self::alloc_from(&mut self.core_regs, &mut self.next_core)
    }

    /// Allocate a temp suitable for a heap reference.
    pub fn alloc_temp_ref(&mut self) -> RegStorage {
        let reg = self.alloc_temp();
        if reg.is_valid() && self.wide_is_solo {
            // References are pointer width on 64-bit targets.
            RegStorage::solo64(reg.reg_num())
        } else {
            reg
        }
    }

    /// Allocate a 64-bit temp: a solo wide register or a pair.
    pub fn alloc_temp_wide(&mut self) -> RegStorage {
        if self.wide_is_solo {
            let reg = self.alloc_temp();
            if reg.is_valid() { RegStorage::solo64(reg.reg_num()) } else { reg }
        } else {
            let low = self.alloc_temp();
            let high = self.alloc_temp();
            if low.is_valid() && high.is_valid() {
                RegStorage::pair(low, high)
            } else {
                RegStorage::INVALID
            }
        }
    }

    pub fn alloc_temp_fp(&mut self, double: bool) -> RegStorage {
        if !double {
            return Self::alloc_from(&mut self.fp_regs, &mut self.next_fp);
        }
        if self.fp_wide_is_solo {
            let reg = Self::alloc_from(&mut self.fp_regs, &mut self.next_fp);
            if reg.is_valid() { RegStorage::solo64_fp(reg.reg_num()) } else { reg }
        } else {
            // Aliased single/double banks: the pair must start on an even
            // register so it names a double register.
            for index in 0..self.fp_regs.len().saturating_sub(1) {
                let (low, high) = (self.fp_regs[index].reg, self.fp_regs[index + 1].reg);
                if low.reg_num() % 2 == 0
                    && high.reg_num() == low.reg_num() + 1
                    && self.fp_regs[index].is_temp
                    && !self.fp_regs[index].in_use
                    && !self.fp_regs[index + 1].in_use
                {
                    self.fp_regs[index].in_use = true;
                    self.fp_regs[index + 1].in_use = true;
                    return RegStorage::pair(low, high);
                }
            }
            RegStorage::INVALID
        }
    }

    pub fn alloc_typed_temp(&mut self, reg_class: RegClass, wide: bool) -> RegStorage {
        match reg_class {
            RegClass::Fp => self.alloc_temp_fp(wide),
            RegClass::Ref => self.alloc_temp_ref(),
            RegClass::Core => {
                if wide {
                    self.alloc_temp_wide()
                } else {
                    self.alloc_temp()
                }
            }
        }
    }

    fn for_each_half(reg: RegStorage, mut f: impl FnMut(RegStorage)) {
        if reg.is_pair() {
            f(reg.low());
            f(reg.high());
        } else {
            f(reg);
        }
    }

    pub fn free_temp(&mut self, reg: RegStorage) {
        if !reg.is_valid() {
            return;
        }
        Self::for_each_half(reg, |half| {
            for info in self.core_regs.iter_mut().chain(self.fp_regs.iter_mut()) {
                if info.reg.same_reg(half) {
                    info.in_use = false;
                }
            }
        });
    }

    /// Invalidate all cached values; temps stay allocated.
    pub fn clobber_all(&mut self) {
        for info in self.core_regs.iter_mut().chain(self.fp_regs.iter_mut()) {
            info.live = false;
            info.s_reg = INVALID_SREG;
        }
    }

    /// Release every temp and forget cached values. Called at instruction
    /// boundaries.
    pub fn reset(&mut self) {
        for info in self.core_regs.iter_mut().chain(self.fp_regs.iter_mut()) {
            info.in_use = false;
            info.live = false;
            info.s_reg = INVALID_SREG;
        }
    }

    /// Reserve the argument-passing registers around an invoke sequence.
    pub fn lock_call_temps(&mut self) {
        let call_temps = self.call_temps.clone();
        for reg in call_temps {
            Self::for_each_half(reg, |half| {
                for info in self.core_regs.iter_mut().chain(self.fp_regs.iter_mut()) {
                    if info.reg.same_reg(half) {
                        info.in_use = true;
                        info.live = false;
                    }
                }
            });
        }
    }

    pub fn free_call_temps(&mut self) {
        let call_temps = self.call_temps.clone();
        for reg in call_temps {
            Self::for_each_half(reg, |half| {
                for info in self.core_regs.iter_mut().chain(self.fp_regs.iter_mut()) {
                    if info.reg.same_reg(half) {
                        info.in_use = false;
                    }
                }
            });
        }
    }

    /// Record that `reg` holds vreg `s_reg`.
    pub fn mark_live(&mut self, reg: RegStorage, s_reg: i32) {
        Self::for_each_half(reg, |half| {
            for info in self.core_regs.iter_mut().chain(self.fp_regs.iter_mut()) {
                if info.reg.same_reg(half) {
                    info.live = true;
                    info.s_reg = s_reg;
                }
            }
        });
    }
}

/// Outcome of the promotion pass over a method.
pub struct Promotion {
    pub map: Vec<PromotionMapEntry>,
    /// Callee-saves actually used, to be spilled by the prologue.
    pub core_spills: Vec<RegStorage>,
    pub fp_spills: Vec<RegStorage>,
}

/// Pin the hottest vregs to callee-save registers.
///
/// Vregs touched by wide operations are not promoted (their two halves
/// would need paired homes), and vregs touched by floating-point code are
/// promoted only to FP callee-saves.
pub fn promote_registers(graph: &MirGraph, template: &RegPoolTemplate) -> Promotion {
    let num_vregs = usize::from(graph.num_vregs);
    let mut map = vec![PromotionMapEntry::default(); num_vregs];
    let mut core_spills = Vec::new();
    let mut fp_spills = Vec::new();

    // Classify vregs: wide-touched are ineligible, fp-touched want an FP
    // home.
    let mut wide_touched: FxHashSet<u32> = FxHashSet::default();
    let mut fp_touched: FxHashSet<u32> = FxHashSet::default();
    for (_, mir) in graph.mirs.iter() {
        let fp = analysis_attrs(mir.opcode) & attrs::FP != 0;
        let wide = match mir.opcode {
            MirOpcode::Dex(op) => def_is_wide(op),
            MirOpcode::Pseudo(_) => false,
        };
        for &v in mir.ssa_rep.defs.iter().chain(mir.ssa_rep.uses.iter()) {
            if wide {
                wide_touched.insert(v);
                wide_touched.insert(v + 1);
            }
            if fp {
                fp_touched.insert(v);
            }
        }
    }

    let mut core_saves = template.core_callee_saves.iter().copied();
    let mut fp_saves = template.fp_callee_saves.iter().copied();
    for &vreg in &graph.promotion_order {
        let v = u32::from(vreg);
        if wide_touched.contains(&v) {
            continue;
        }
        let entry = &mut map[usize::from(vreg)];
        if fp_touched.contains(&v) {
            if let Some(reg) = fp_saves.next() {
                entry.fp_location = PromotionLocation::PhysReg;
                entry.fp_reg = reg;
                fp_spills.push(reg);
            }
        } else if let Some(reg) = core_saves.next() {
            entry.core_location = PromotionLocation::PhysReg;
            entry.core_reg = reg;
            core_spills.push(reg);
        }
    }

    Promotion { map, core_spills, fp_spills }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> RegPoolTemplate {
        RegPoolTemplate {
            core_temps: vec![RegStorage::solo32(0), RegStorage::solo32(1), RegStorage::solo32(2)],
            fp_temps: vec![RegStorage::solo32_fp(0), RegStorage::solo32_fp(1)],
            core_callee_saves: vec![RegStorage::solo32(4), RegStorage::solo32(5)],
            fp_callee_saves: vec![RegStorage::solo32_fp(8)],
            call_temps: vec![RegStorage::solo32(0), RegStorage::solo32(1)],
            wide_is_solo: false,
            fp_wide_is_solo: false,
        }
    }

    #[test]
    fn temps_round_robin_and_free() {
        let mut pool = RegisterPool::new(&template());
        let a = pool.alloc_temp();
        let b = pool.alloc_temp();
        assert_ne!(a.reg_num(), b.reg_num());
        pool.free_temp(a);
        let c = pool.alloc_temp();
        let d = pool.alloc_temp();
        assert!(c.is_valid() && d.is_valid());
        // Pool of three: all allocated now.
        assert!(!pool.alloc_temp().is_valid());
    }

    #[test]
    fn wide_pairs_on_32bit() {
        let mut pool = RegisterPool::new(&template());
        let wide = pool.alloc_temp_wide();
        assert!(wide.is_pair());
    }

    #[test]
    fn call_temps_lock_out_allocation() {
        let mut pool = RegisterPool::new(&template());
        pool.lock_call_temps();
        // r0 and r1 are locked; only r2 remains.
        let only = pool.alloc_temp();
        assert_eq!(only.reg_num(), 2);
        assert!(!pool.alloc_temp().is_valid());
        pool.free_call_temps();
        assert!(pool.alloc_temp().is_valid());
    }
}
