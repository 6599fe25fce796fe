//! The backend: MIR to LIR lowering, register allocation, assembly and
//! side-table production.
//!
//! A `CodeGen` pairs the target-independent lowering (this module) with one
//! concrete [`Target`] implementation chosen once per method. The shared
//! code walks blocks in pre-order DFS, dispatches on each Dalvik opcode,
//! and emits LIR exclusively through the target's primitive hooks, so the
//! per-ISA modules contain encodings and ABI details but no bytecode
//! knowledge.

use cranelift_entity::{PrimaryMap, SecondaryMap};

use crate::compiled::{LinkerPatch, SrcMapElem};
use crate::dex::{shorty_is_fp, shorty_is_ref, shorty_is_wide, DexFileId, MethodReference};
use crate::mir::{opt_flags, Block, MirGraph, MirId};
use crate::options::{InstructionSet, InstructionSetFeatures};
use crate::CompilationUnit;

pub mod assemble;
pub mod cfi;
pub mod invoke;
pub mod layout;
pub mod lir;
pub mod regalloc;
pub mod regs;
pub mod tables;

use cfi::CfiBuilder;
use layout::Trampoline;
use lir::{CodeOffset, FixupKind, Lir, LirId, LirOp, PseudoLir};
use regalloc::{Promotion, RegPoolTemplate, RegisterPool};
use regs::{Location, PromotionLocation, RegClass, RegLocation, RegStorage};

/// Memory operation widths.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum OpSize {
    Word,
    Wide,
    /// Pointer-width reference.
    Ref,
    UnsignedByte,
    SignedByte,
    UnsignedHalf,
    SignedHalf,
    Single,
    Double,
}

impl OpSize {
    pub fn bytes(self, ptr_size: u32) -> u32 {
        match self {
            OpSize::Word | OpSize::Single => 4,
            OpSize::Wide | OpSize::Double => 8,
            OpSize::Ref => ptr_size,
            OpSize::UnsignedByte | OpSize::SignedByte => 1,
            OpSize::UnsignedHalf | OpSize::SignedHalf => 2,
        }
    }
}

/// Target-independent ALU operations. Wide forms operate on pairs on
/// 32-bit targets; the target impl handles the decomposition.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum AluOp {
    Add,
    Sub,
    Rsub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Ushr,
    Adc,
    Sbc,
    Neg,
    Not,
    Mov,
}

/// Floating-point binary operations.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum FpOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// The fifteen Dalvik primitive conversions.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ConvKind {
    I2L,
    I2F,
    I2D,
    L2I,
    L2F,
    L2D,
    F2I,
    F2L,
    F2D,
    D2I,
    D2L,
    D2F,
    I2B,
    I2C,
    I2S,
}

/// Branch conditions.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
    /// Unsigned comparisons, for range checks.
    Ult,
    Uge,
}

impl Cond {
    pub fn negated(self) -> Cond {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Lt => Cond::Ge,
            Cond::Ge => Cond::Lt,
            Cond::Gt => Cond::Le,
            Cond::Le => Cond::Gt,
            Cond::Ult => Cond::Uge,
            Cond::Uge => Cond::Ult,
        }
    }
}

/// Memory barrier kinds for volatile accesses and monitors.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MemBarrierKind {
    AnyStore,
    LoadAny,
    StoreStore,
    AnyAny,
}

/// Symbolic registers every target provides.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SpecialTargetRegister {
    /// The thread register.
    SelfThread,
    Sp,
    Arg0,
    Arg1,
    Arg2,
    Arg3,
    FArg0,
    FArg1,
    FArg2,
    FArg3,
    Ret0,
    Ret1,
    /// Scratch register holding the branch target of an invoke.
    InvokeTgt,
    /// Extra argument register carrying the method index into the
    /// interface conflict trampoline.
    HiddenArg,
}

/// A reference to a side table in the literal-pool region.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TableRef {
    Switch(usize),
    FillArray(usize),
}

/// Literal pool classes. Pointer pools emit linker patches.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum LiteralPool {
    Word = 0,
    Code = 1,
    Method = 2,
    Class = 3,
    String = 4,
}

/// A per-method switch table record. The key and target copies live in
/// the unit arena; the anchor LIR's final offset is the reference point
/// the installed displacements are relative to.
pub struct SwitchTable<'a> {
    pub is_sparse: bool,
    pub keys: &'a [i32],
    /// Case target blocks, parallel to `keys`.
    pub targets: &'a [Block],
    /// Resolved offset of the table in the output, assigned at assembly.
    pub offset: CodeOffset,
    /// The instruction the displacements are relative to.
    pub anchor: Option<LirId>,
}

impl SwitchTable<'_> {
    /// Size of the installed table in bytes.
    pub fn size_in_bytes(&self) -> u32 {
        let entries = self.targets.len() as u32;
        if self.is_sparse { entries * 8 } else { entries * 4 }
    }
}

/// A fill-array-data payload copied to the literal region, backed by the
/// unit arena.
pub struct FillArrayData<'a> {
    /// Raw 16-bit units including the payload header.
    pub data: &'a [u16],
    pub offset: CodeOffset,
}

impl FillArrayData<'_> {
    pub fn size_in_bytes(&self) -> u32 {
        (self.data.len() * 2) as u32
    }
}

/// An argument to a runtime helper call.
#[derive(Copy, Clone, Debug)]
pub enum HelperArg {
    Imm(i32),
    Reg(RegStorage),
    Loc(RegLocation),
}

/// A concrete code-generation target.
///
/// Every hook appends LIR through the `CodeGen` it is handed; the
/// assembly-time hooks (`inst_size`, `encode`) are pure.
pub trait Target: Sized {
    /// The target opcode enumeration.
    type Op: Copy + PartialEq + Eq + std::fmt::Debug;

    const ISA: InstructionSet;
    /// x86 calls entrypoints directly out of thread memory instead of
    /// loading them into a register first.
    const CALLS_THREAD_OFFSET_DIRECTLY: bool = false;

    fn new(features: InstructionSetFeatures) -> Self;

    fn reg_pool_template(&self) -> RegPoolTemplate;
    fn special_reg(&self, reg: SpecialTargetRegister) -> RegStorage;
    /// Register for incoming argument `index` (in vreg widths), or `None`
    /// once arguments go to the stack.
    fn arg_reg(&self, index: usize, fp: bool, wide: bool) -> Option<RegStorage>;
    fn return_reg(&self, fp: bool, wide: bool) -> RegStorage;
    fn supports_hw_div(&self) -> bool {
        true
    }
    /// Bit(s) the return-address register contributes to the core spill
    /// mask; zero where the call instruction itself pushes it.
    fn return_address_spill_mask(&self) -> u32 {
        0
    }
    /// DWARF register number, for CFI.
    fn dwarf_reg(&self, reg: RegStorage) -> u16;
    fn dwarf_return_address_reg(&self) -> u16;
    fn dwarf_stack_pointer_reg(&self) -> u16;

    // Emission primitives.
    fn load_constant(cg: &mut CodeGen<Self>, dest: RegStorage, value: i32);
    fn load_constant_wide(cg: &mut CodeGen<Self>, dest: RegStorage, value: i64);
    fn load_base_disp(cg: &mut CodeGen<Self>, base: RegStorage, disp: i32, dest: RegStorage, size: OpSize);
    fn store_base_disp(cg: &mut CodeGen<Self>, base: RegStorage, disp: i32, src: RegStorage, size: OpSize);
    fn load_base_indexed(cg: &mut CodeGen<Self>, base: RegStorage, index: RegStorage, dest: RegStorage, scale: u8, size: OpSize);
    fn store_base_indexed(cg: &mut CodeGen<Self>, base: RegStorage, index: RegStorage, src: RegStorage, scale: u8, size: OpSize);
    fn op_move(cg: &mut CodeGen<Self>, dest: RegStorage, src: RegStorage);
    fn op_reg_reg_reg(cg: &mut CodeGen<Self>, op: AluOp, dest: RegStorage, src1: RegStorage, src2: RegStorage, wide: bool);
    fn op_reg_reg_imm(cg: &mut CodeGen<Self>, op: AluOp, dest: RegStorage, src: RegStorage, value: i32, wide: bool);
    fn op_fp_rrr(cg: &mut CodeGen<Self>, op: FpOp, dest: RegStorage, src1: RegStorage, src2: RegStorage, double: bool);
    fn op_fp_neg(cg: &mut CodeGen<Self>, dest: RegStorage, src: RegStorage, double: bool);
    /// Materialize the -1/0/1 result of `cmpl`/`cmpg`.
    fn op_fp_cmp(cg: &mut CodeGen<Self>, dest: RegStorage, src1: RegStorage, src2: RegStorage, double: bool, gt_bias: bool);
    /// Materialize the -1/0/1 result of `cmp-long`.
    fn op_cmp_long(cg: &mut CodeGen<Self>, dest: RegStorage, src1: RegStorage, src2: RegStorage);
    fn op_conversion(cg: &mut CodeGen<Self>, kind: ConvKind, dest: RegStorage, src: RegStorage);
    fn op_cmp_branch(cg: &mut CodeGen<Self>, cond: Cond, a: RegStorage, b: RegStorage, target: LirId) -> LirId;
    fn op_cmp_imm_branch(cg: &mut CodeGen<Self>, cond: Cond, reg: RegStorage, value: i32, target: LirId) -> LirId;
    fn op_unconditional_branch(cg: &mut CodeGen<Self>, target: LirId) -> LirId;
    fn op_call_reg(cg: &mut CodeGen<Self>, reg: RegStorage) -> LirId;
    /// Direct branch-and-link to a link-time-patched target.
    fn op_call_direct(cg: &mut CodeGen<Self>) -> LirId;
    fn op_call_thread_offset(cg: &mut CodeGen<Self>, disp: i32) -> LirId {
        let _ = (cg, disp);
        unreachable!("target does not call thread offsets directly")
    }
    /// Load a PC-relative pool entry; `pool` selects the pool and `index`
    /// the entry. Pointer pools get linker patches at install time.
    fn op_load_pool_entry(cg: &mut CodeGen<Self>, pool: LiteralPool, index: usize, dest: RegStorage) -> LirId;
    /// Materialize the displacement reference point for a switch or
    /// fill-array table into `dest`. The returned LIR is the anchor:
    /// installed displacements are relative to its per-ISA reference
    /// offset (see [`assemble::table_reference_offset`]).
    fn op_load_table_anchor(cg: &mut CodeGen<Self>, table: TableRef, dest: RegStorage) -> LirId;
    /// `dest = src + (table offset − anchor reference offset)`, the
    /// assembly-time constant that turns the anchor address into the
    /// table's address. `dest` may alias `src`.
    fn op_table_base_delta(
        cg: &mut CodeGen<Self>,
        dest: RegStorage,
        src: RegStorage,
        table: TableRef,
        anchor: LirId,
    );
    /// Indirect branch used by table switches.
    fn op_branch_reg(cg: &mut CodeGen<Self>, reg: RegStorage);

    fn gen_entry_sequence(cg: &mut CodeGen<Self>);
    fn gen_exit_sequence(cg: &mut CodeGen<Self>);
    fn gen_memory_barrier(cg: &mut CodeGen<Self>, kind: MemBarrierKind);

    /// Inline fast path for monitor-enter/exit; the default goes straight
    /// to the runtime.
    fn gen_monitor_enter(cg: &mut CodeGen<Self>, obj: RegStorage) {
        cg.call_runtime_helper(Trampoline::LockObject, &[HelperArg::Reg(obj)], true);
    }

    fn gen_monitor_exit(cg: &mut CodeGen<Self>, obj: RegStorage) {
        cg.call_runtime_helper(Trampoline::UnlockObject, &[HelperArg::Reg(obj)], true);
    }

    // Assembly hooks.
    fn inst_size(lir: &Lir<Self::Op>) -> u32;
    fn encode(
        lir: &Lir<Self::Op>,
        env: &assemble::AsmEnv<'_, Self::Op>,
        buf: &mut Vec<u8>,
    ) -> Result<(), assemble::WidenRequest>;
}

/// Shared code-generation state, the `Mir2Lir` of this compiler.
pub struct CodeGen<'a, T: Target> {
    pub cu: &'a CompilationUnit<'a>,
    pub graph: &'a MirGraph,
    pub target: T,

    pub lirs: PrimaryMap<LirId, Lir<T::Op>>,
    pub first_lir: Option<LirId>,
    pub last_lir: Option<LirId>,
    block_labels: SecondaryMap<Block, Option<LirId>>,

    // Literal pools. The word pool holds raw constants; the pointer pools
    // hold references patched by the linker.
    pub word_pool: Vec<i32>,
    pub code_pool: Vec<MethodReference>,
    pub method_pool: Vec<MethodReference>,
    pub class_pool: Vec<(DexFileId, u32)>,
    pub string_pool: Vec<(DexFileId, u32)>,

    pub switch_tables: Vec<SwitchTable<'a>>,
    pub fill_array_data: Vec<FillArrayData<'a>>,
    /// `(safepoint LIR, originating MIR)`; prologue safepoints have no
    /// MIR and take their liveness from the verifier's entry map.
    pub safepoints: Vec<(LirId, Option<MirId>)>,
    slow_paths: Vec<Box<dyn FnOnce(&mut CodeGen<'a, T>)>>,
    /// Direct-call sites awaiting a `RelativeCall` linker patch.
    pub relative_call_sites: Vec<(LirId, MethodReference)>,
    /// Set by the dispatch state machine when the call itself should be a
    /// patched PC-relative branch.
    pub pending_direct_call: Option<MethodReference>,

    pub reg_pool: RegisterPool,
    pub promotion: Promotion,

    pub frame_size: u32,
    pub core_spill_mask: u32,
    pub fp_spill_mask: u32,
    pub num_core_spills: u32,
    pub num_fp_spills: u32,

    pub code_buffer: Vec<u8>,
    pub data_offset: CodeOffset,
    pub total_size: CodeOffset,
    pub encoded_mapping_table: Vec<u8>,
    pub core_vmap_table: Vec<u32>,
    pub fp_vmap_table: Vec<u32>,
    pub native_gc_map: Vec<u8>,
    pub src_mapping: Vec<SrcMapElem>,
    pub patches: Vec<LinkerPatch>,
    pub cfi: CfiBuilder,

    pub current_dalvik_offset: u32,
    pub current_mir: Option<MirId>,
    /// Register pressure exceeded the local allocator's budget; the method
    /// is abandoned to the interpreter.
    pub punt_to_interpreter: bool,
}

impl<'a, T: Target> CodeGen<'a, T> {
    pub fn new(cu: &'a CompilationUnit<'a>, graph: &'a MirGraph, target: T) -> Self {
        let template = target.reg_pool_template();
        let promotion = if cu.disable_opt & crate::options::Optimization::PromoteRegs.bit() == 0 {
            regalloc::promote_registers(graph, &template)
        } else {
            Promotion {
                map: vec![Default::default(); usize::from(graph.num_vregs)],
                core_spills: Vec::new(),
                fp_spills: Vec::new(),
            }
        };
        let cfi = CfiBuilder::new(cu.options.generate_debug_info);
        let mut cg = CodeGen {
            cu,
            graph,
            target,
            lirs: PrimaryMap::new(),
            first_lir: None,
            last_lir: None,
            block_labels: SecondaryMap::with_default(None),
            word_pool: Vec::new(),
            code_pool: Vec::new(),
            method_pool: Vec::new(),
            class_pool: Vec::new(),
            string_pool: Vec::new(),
            switch_tables: Vec::new(),
            fill_array_data: Vec::new(),
            safepoints: Vec::new(),
            slow_paths: Vec::new(),
            relative_call_sites: Vec::new(),
            pending_direct_call: None,
            reg_pool: RegisterPool::new(&template),
            promotion,
            frame_size: 0,
            core_spill_mask: 0,
            fp_spill_mask: 0,
            num_core_spills: 0,
            num_fp_spills: 0,
            code_buffer: Vec::new(),
            data_offset: 0,
            total_size: 0,
            encoded_mapping_table: Vec::new(),
            core_vmap_table: Vec::new(),
            fp_vmap_table: Vec::new(),
            native_gc_map: Vec::new(),
            src_mapping: Vec::new(),
            patches: Vec::new(),
            cfi,
            current_dalvik_offset: 0,
            current_mir: None,
            punt_to_interpreter: false,
        };
        cg.compute_spill_masks();
        cg.frame_size = cg.compute_frame_size();
        cg
    }

    fn compute_spill_masks(&mut self) {
        for &reg in &self.promotion.core_spills {
            self.core_spill_mask |= 1 << reg.reg_num();
        }
        for &reg in &self.promotion.fp_spills {
            self.fp_spill_mask |= 1 << reg.reg_num();
        }
        // The return address is spilled whenever a frame exists.
        if self.graph.num_dalvik_insns > 0 {
            self.core_spill_mask |= self.target.return_address_spill_mask();
        }
        self.num_core_spills = self.core_spill_mask.count_ones();
        self.num_fp_spills = self.fp_spill_mask.count_ones();
    }

    /// Frame layout, sp-relative, low to high: method pointer, outgoing
    /// args, vreg array, filler, fp spills, core spills.
    pub fn compute_frame_size(&self) -> u32 {
        let isa = T::ISA;
        if self.graph.num_dalvik_insns == 0 {
            return 0;
        }
        let size = self.num_core_spills * isa.gpr_spill_size()
            + self.num_fp_spills * isa.fpr_spill_size()
            + 4 // filler
            + (u32::from(self.graph.num_vregs) + u32::from(self.graph.num_outs)) * 4
            + isa.pointer_size();
        size.next_multiple_of(isa.stack_alignment())
    }

    /// Frame offset of vreg `v`'s home slot.
    pub fn s_reg_offset(&self, v: u32) -> i32 {
        (T::ISA.pointer_size() + u32::from(self.graph.num_outs) * 4 + v * 4) as i32
    }

    /// Frame offset of outgoing argument word `index`.
    pub fn out_offset(&self, index: u32) -> i32 {
        (T::ISA.pointer_size() + index * 4) as i32
    }

    //=========================================================================
    // LIR list management

    pub fn append(&mut self, mut lir: Lir<T::Op>) -> LirId {
        lir.dalvik_offset = self.current_dalvik_offset;
        lir.mir = self.current_mir;
        lir.prev = self.last_lir;
        lir.next = None;
        let id = self.lirs.push(lir);
        match self.last_lir {
            Some(last) => self.lirs[last].next = Some(id),
            None => self.first_lir = Some(id),
        }
        self.last_lir = Some(id);
        id
    }

    pub fn append_pseudo(&mut self, pseudo: PseudoLir) -> LirId {
        let mut lir = Lir::new(LirOp::Pseudo(pseudo), self.current_dalvik_offset);
        if matches!(pseudo, PseudoLir::BlockLabel | PseudoLir::TargetLabel | PseudoLir::CaseLabel)
        {
            lir.flags.fixup = FixupKind::Label;
        }
        self.append(lir)
    }

    /// The label LIR for `block`, created on first request and appended to
    /// the list when the block is visited.
    pub fn block_label(&mut self, block: Block) -> LirId {
        if let Some(label) = self.block_labels[block] {
            return label;
        }
        let mut lir = Lir::new(LirOp::Pseudo(PseudoLir::BlockLabel), 0);
        lir.flags.fixup = FixupKind::Label;
        let id = self.lirs.push(lir);
        self.block_labels[block] = Some(id);
        id
    }

    fn place_block_label(&mut self, block: Block) {
        let id = self.block_label(block);
        self.lirs[id].dalvik_offset = self.graph.block(block).start_offset;
        self.lirs[id].prev = self.last_lir;
        self.lirs[id].next = None;
        match self.last_lir {
            Some(last) => self.lirs[last].next = Some(id),
            None => self.first_lir = Some(id),
        }
        self.last_lir = Some(id);
    }

    /// A fresh out-of-line label, not yet placed.
    pub fn new_label(&mut self) -> LirId {
        let mut lir = Lir::new(LirOp::Pseudo(PseudoLir::TargetLabel), self.current_dalvik_offset);
        lir.flags.fixup = FixupKind::Label;
        self.lirs.push(lir)
    }

    /// Place a label created by [`CodeGen::new_label`] at the current
    /// position.
    pub fn place_label(&mut self, label: LirId) {
        debug_assert!(self.lirs[label].prev.is_none() && self.lirs[label].next.is_none());
        self.lirs[label].prev = self.last_lir;
        match self.last_lir {
            Some(last) => self.lirs[last].next = Some(label),
            None => self.first_lir = Some(label),
        }
        self.last_lir = Some(label);
    }

    /// Append a safepoint marker and record its originating MIR.
    pub fn mark_safepoint(&mut self) {
        let id = self.append_pseudo(PseudoLir::SafepointPc);
        self.safepoints.push((id, self.current_mir));
    }

    pub fn queue_slow_path(&mut self, path: impl FnOnce(&mut CodeGen<'a, T>) + 'static) {
        self.slow_paths.push(Box::new(path));
    }

    fn handle_slow_paths(&mut self) {
        while let Some(path) = self.slow_paths.pop() {
            self.reg_pool.reset();
            path(self);
        }
    }

    //=========================================================================
    // Literal pools

    /// Intern a word constant, returning its pool index.
    pub fn add_word_literal(&mut self, value: i32) -> usize {
        match self.word_pool.iter().position(|&v| v == value) {
            Some(index) => index,
            None => {
                self.word_pool.push(value);
                self.word_pool.len() - 1
            }
        }
    }

    pub fn add_code_literal(&mut self, target: MethodReference) -> usize {
        match self.code_pool.iter().position(|&t| t == target) {
            Some(index) => index,
            None => {
                self.code_pool.push(target);
                self.code_pool.len() - 1
            }
        }
    }

    pub fn add_method_literal(&mut self, target: MethodReference) -> usize {
        match self.method_pool.iter().position(|&t| t == target) {
            Some(index) => index,
            None => {
                self.method_pool.push(target);
                self.method_pool.len() - 1
            }
        }
    }

    pub fn add_class_literal(&mut self, dex_file: DexFileId, type_idx: u32) -> usize {
        let key = (dex_file, type_idx);
        match self.class_pool.iter().position(|&k| k == key) {
            Some(index) => index,
            None => {
                self.class_pool.push(key);
                self.class_pool.len() - 1
            }
        }
    }

    pub fn add_string_literal(&mut self, dex_file: DexFileId, string_idx: u32) -> usize {
        let key = (dex_file, string_idx);
        match self.string_pool.iter().position(|&k| k == key) {
            Some(index) => index,
            None => {
                self.string_pool.push(key);
                self.string_pool.len() - 1
            }
        }
    }

    //=========================================================================
    // Value movement

    pub fn special_reg(&self, reg: SpecialTargetRegister) -> RegStorage {
        self.target.special_reg(reg)
    }

    /// The location handle for a use of vreg `v`, honoring promotion.
    pub fn loc_for_vreg(&self, v: u32, wide: bool, fp: bool, ref_: bool) -> RegLocation {
        let mut loc = RegLocation::vreg(v as u16, wide, fp, ref_);
        if !wide {
            if let Some(entry) = self.promotion.map.get(v as usize) {
                if fp && entry.fp_location == PromotionLocation::PhysReg {
                    loc.location = Location::PhysReg;
                    loc.reg = entry.fp_reg;
                } else if !fp && entry.core_location == PromotionLocation::PhysReg {
                    loc.location = Location::PhysReg;
                    loc.reg = entry.core_reg;
                }
            }
        }
        loc
    }

    fn alloc_temp_checked(&mut self, reg_class: RegClass, wide: bool) -> RegStorage {
        let reg = self.reg_pool.alloc_typed_temp(reg_class, wide);
        if !reg.is_valid() {
            // Register-pressure budget exceeded.
            self.punt_to_interpreter = true;
        }
        reg
    }

    /// Materialize `loc` into a register of its natural class.
    pub fn load_value(&mut self, loc: RegLocation) -> RegLocation {
        let reg_class = loc.reg_class();
        if loc.location == Location::PhysReg && loc.reg.is_valid() {
            return loc;
        }
        let reg = self.alloc_temp_checked(reg_class, loc.wide);
        if !reg.is_valid() {
            return loc;
        }
        let mut out = loc;
        out.location = Location::PhysReg;
        out.reg = reg;
        let sp = self.special_reg(SpecialTargetRegister::Sp);
        let offset = self.s_reg_offset(loc.s_reg_low as u32);
        let size = if loc.wide {
            if loc.fp { OpSize::Double } else { OpSize::Wide }
        } else if loc.fp {
            OpSize::Single
        } else if loc.ref_ {
            OpSize::Ref
        } else {
            OpSize::Word
        };
        T::load_base_disp(self, sp, offset, reg, size);
        self.reg_pool.mark_live(reg, loc.s_reg_low);
        out
    }

    /// Load `loc` directly into `dest` (argument marshalling).
    pub fn load_value_direct_fixed(&mut self, loc: RegLocation, dest: RegStorage) {
        if loc.location == Location::PhysReg && loc.reg.is_valid() {
            if !loc.reg.same_reg(dest) || loc.reg.is_pair() != dest.is_pair() {
                T::op_move(self, dest, loc.reg);
            }
            return;
        }
        let sp = self.special_reg(SpecialTargetRegister::Sp);
        let offset = self.s_reg_offset(loc.s_reg_low as u32);
        let size = if loc.wide {
            if loc.fp { OpSize::Double } else { OpSize::Wide }
        } else if loc.fp {
            OpSize::Single
        } else if loc.ref_ {
            OpSize::Ref
        } else {
            OpSize::Word
        };
        T::load_base_disp(self, sp, offset, dest, size);
    }

    /// Write `src` (a physical register) back to `dest`'s home.
    pub fn store_value(&mut self, dest: RegLocation, src: RegStorage) {
        debug_assert!(src.is_valid());
        if dest.location == Location::PhysReg && dest.reg.is_valid() {
            if !dest.reg.same_reg(src) {
                T::op_move(self, dest.reg, src);
            }
            return;
        }
        let sp = self.special_reg(SpecialTargetRegister::Sp);
        let offset = self.s_reg_offset(dest.s_reg_low as u32);
        let size = if dest.wide {
            if dest.fp { OpSize::Double } else { OpSize::Wide }
        } else if dest.fp {
            OpSize::Single
        } else if dest.ref_ {
            OpSize::Ref
        } else {
            OpSize::Word
        };
        T::store_base_disp(self, sp, offset, src, size);
        self.reg_pool.mark_live(src, dest.s_reg_low);
    }

    //=========================================================================
    // Runtime helper calls

    /// Call a runtime trampoline with up to three word-or-wide arguments,
    /// optionally recording a safepoint.
    pub fn call_runtime_helper(
        &mut self,
        trampoline: Trampoline,
        args: &[HelperArg],
        safepoint: bool,
    ) {
        self.reg_pool.clobber_all();
        self.reg_pool.lock_call_temps();
        let arg_regs = [
            SpecialTargetRegister::Arg0,
            SpecialTargetRegister::Arg1,
            SpecialTargetRegister::Arg2,
            SpecialTargetRegister::Arg3,
        ];
        let mut next = 0usize;
        for arg in args {
            match *arg {
                HelperArg::Imm(value) => {
                    let dest = self.special_reg(arg_regs[next]);
                    T::load_constant(self, dest, value);
                    next += 1;
                }
                HelperArg::Reg(reg) => {
                    let dest = if reg.is_wide() && !self.reg_pool.wide_is_solo {
                        let low = self.special_reg(arg_regs[next]);
                        let high = self.special_reg(arg_regs[next + 1]);
                        next += 2;
                        RegStorage::pair(low, high)
                    } else {
                        let dest = self.special_reg(arg_regs[next]);
                        next += 1;
                        if reg.is_wide() { RegStorage::solo64(dest.reg_num()) } else { dest }
                    };
                    if dest != reg {
                        T::op_move(self, dest, reg);
                    }
                }
                HelperArg::Loc(loc) => {
                    let dest = if loc.wide && !self.reg_pool.wide_is_solo {
                        let low = self.special_reg(arg_regs[next]);
                        let high = self.special_reg(arg_regs[next + 1]);
                        next += 2;
                        RegStorage::pair(low, high)
                    } else {
                        let dest = self.special_reg(arg_regs[next]);
                        next += 1;
                        if loc.wide { RegStorage::solo64(dest.reg_num()) } else { dest }
                    };
                    self.load_value_direct_fixed(loc, dest);
                }
            }
        }
        self.call_trampoline(trampoline);
        if safepoint {
            self.mark_safepoint();
        }
        self.reg_pool.free_call_temps();
    }

    /// Emit the actual transfer to a trampoline.
    pub fn call_trampoline(&mut self, trampoline: Trampoline) {
        let disp = layout::trampoline_offset(trampoline, T::ISA.pointer_size());
        if T::CALLS_THREAD_OFFSET_DIRECTLY {
            T::op_call_thread_offset(self, disp);
        } else {
            let self_reg = self.special_reg(SpecialTargetRegister::SelfThread);
            let tgt = self.special_reg(SpecialTargetRegister::InvokeTgt);
            T::load_base_disp(self, self_reg, disp, tgt, OpSize::Ref);
            T::op_call_reg(self, tgt);
        }
    }

    //=========================================================================
    // Checks

    /// Explicit null check unless elided or implicit.
    pub fn gen_null_check(&mut self, reg: RegStorage, mir_opt_flags: u16) {
        if mir_opt_flags & opt_flags::IGNORE_NULL_CHECK != 0 {
            return;
        }
        if self.cu.options.implicit_null_checks {
            // The faulting access itself is the check; make sure the GC can
            // walk the frame there.
            self.mark_safepoint();
            return;
        }
        let slow = self.new_label();
        T::op_cmp_imm_branch(self, Cond::Eq, reg, 0, slow);
        self.queue_slow_path(move |cg| {
            cg.place_label(slow);
            cg.call_runtime_helper(Trampoline::ThrowNullPointer, &[], true);
        });
    }

    pub fn gen_div_zero_check(&mut self, reg: RegStorage) {
        let check_reg = if reg.is_pair() {
            // A wide divisor is zero when both halves are.
            let tmp = self.alloc_temp_checked(RegClass::Core, false);
            if !tmp.is_valid() {
                return;
            }
            T::op_reg_reg_reg(self, AluOp::Or, tmp, reg.low(), reg.high(), false);
            tmp
        } else {
            reg
        };
        let slow = self.new_label();
        T::op_cmp_imm_branch(self, Cond::Eq, check_reg, 0, slow);
        self.queue_slow_path(move |cg| {
            cg.place_label(slow);
            cg.call_runtime_helper(Trampoline::ThrowDivZero, &[], true);
        });
    }

    pub fn gen_array_bounds_check(&mut self, index: RegStorage, length: RegStorage) {
        let slow = self.new_label();
        T::op_cmp_branch(self, Cond::Uge, index, length, slow);
        self.queue_slow_path(move |cg| {
            cg.place_label(slow);
            cg.call_runtime_helper(
                Trampoline::ThrowArrayBounds,
                &[HelperArg::Reg(index), HelperArg::Reg(length)],
                true,
            );
        });
    }

    /// Test the thread's suspend flag; slow path calls the runtime.
    pub fn gen_suspend_test(&mut self, mir_opt_flags: u16) {
        if mir_opt_flags & opt_flags::IGNORE_SUSPEND_CHECK != 0 {
            return;
        }
        let self_reg = self.special_reg(SpecialTargetRegister::SelfThread);
        if self.cu.options.implicit_suspend_checks {
            // Poke the suspend trigger page; a pending suspension faults.
            let tmp = self.alloc_temp_checked(RegClass::Core, false);
            if !tmp.is_valid() {
                return;
            }
            let disp = layout::thread_suspend_trigger_offset(T::ISA.pointer_size());
            T::load_base_disp(self, self_reg, disp, tmp, OpSize::Ref);
            T::load_base_disp(self, tmp, 0, tmp, OpSize::Word);
            self.mark_safepoint();
            self.reg_pool.free_temp(tmp);
            return;
        }
        let tmp = self.alloc_temp_checked(RegClass::Core, false);
        if !tmp.is_valid() {
            return;
        }
        T::load_base_disp(self, self_reg, layout::thread_flags_offset(), tmp, OpSize::UnsignedHalf);
        let slow = self.new_label();
        let cont = self.new_label();
        T::op_cmp_imm_branch(self, Cond::Ne, tmp, 0, slow);
        self.place_label(cont);
        self.reg_pool.free_temp(tmp);
        self.queue_slow_path(move |cg| {
            cg.place_label(slow);
            cg.call_runtime_helper(Trampoline::TestSuspend, &[], true);
            T::op_unconditional_branch(cg, cont);
        });
    }

    /// Mark the GC card for an object that just had a reference stored
    /// into it. `value` known non-null elides the null test.
    pub fn mark_gc_card(&mut self, value: RegStorage, object: RegStorage, value_known_non_null: bool) {
        let skip = if value_known_non_null {
            None
        } else {
            let skip = self.new_label();
            T::op_cmp_imm_branch(self, Cond::Eq, value, 0, skip);
            Some(skip)
        };
        let self_reg = self.special_reg(SpecialTargetRegister::SelfThread);
        let card_base = self.alloc_temp_checked(RegClass::Ref, false);
        let card_no = self.alloc_temp_checked(RegClass::Core, false);
        if card_base.is_valid() && card_no.is_valid() {
            let disp = layout::thread_card_table_offset(T::ISA.pointer_size());
            T::load_base_disp(self, self_reg, disp, card_base, OpSize::Ref);
            T::op_reg_reg_imm(self, AluOp::Ushr, card_no, object, layout::CARD_SHIFT, false);
            T::store_base_indexed(self, card_base, card_no, card_base, 0, OpSize::UnsignedByte);
        }
        self.reg_pool.free_temp(card_base);
        self.reg_pool.free_temp(card_no);
        if let Some(skip) = skip {
            self.place_label(skip);
        }
    }

    //=========================================================================
    // Shorty helpers

    /// Location handle for the method's return value.
    pub fn return_loc(&self) -> Option<RegLocation> {
        let ret = self.cu.shorty.as_bytes()[0];
        if ret == b'V' {
            return None;
        }
        let mut loc = RegLocation::result(shorty_is_wide(ret), shorty_is_fp(ret), shorty_is_ref(ret));
        loc.location = Location::PhysReg;
        loc.reg = self.target.return_reg(loc.fp, loc.wide);
        Some(loc)
    }
}

mod gen_common;
mod special;

pub use gen_common::compile_method_body;
