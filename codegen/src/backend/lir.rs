//! The low IR: a doubly linked list of target instructions and pseudo
//! markers, stored in an entity map and ordered by explicit prev/next ids.

use cranelift_entity::entity_impl;

use crate::mir::MirId;

/// An opaque reference to an LIR node.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LirId(u32);
entity_impl!(LirId, "lir");

/// Byte offset in the code stream.
pub type CodeOffset = u32;

/// Pseudo-LIR that emits no bytes but anchors labels, safepoints and
/// frame-change markers.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PseudoLir {
    /// Start of a basic block; branch targets point here.
    BlockLabel,
    /// An out-of-line target label (slow paths, case bodies).
    TargetLabel,
    /// A switch-case landing label; operand 0 carries the case key.
    CaseLabel,
    /// The GC may inspect the stack at the preceding instruction.
    SafepointPc,
    /// Native PC exported for a catch-handler entry.
    ExportedPc,
    PrologueBegin,
    PrologueEnd,
    EpilogueBegin,
    EpilogueEnd,
    /// Scheduling barrier; keeps local optimization from crossing.
    Barrier,
    /// Dalvik instruction boundary, for disassembly dumps.
    BoundaryMarker,
}

/// Branch-fixup classes, consulted during assembly.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum FixupKind {
    #[default]
    None,
    /// PC-relative branch to a label; may need widening.
    Branch,
    /// PC-relative load from the literal pool.
    Load,
    /// PC-relative address of a switch table.
    SwitchTable,
    /// Label nodes themselves.
    Label,
}

/// Per-LIR flags.
#[derive(Copy, Clone, Default, Debug)]
pub struct LirFlags {
    pub is_nop: bool,
    pub fixup: FixupKind,
    /// The use/def masks are not meaningful for this LIR.
    pub use_def_invalid: bool,
    /// Assembly widened this instruction to its long form.
    pub widened: bool,
}

/// The opcode of an LIR node: target-specific or pseudo.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum LirOp<Op> {
    Target(Op),
    Pseudo(PseudoLir),
}

impl<Op> LirOp<Op> {
    pub fn is_pseudo(&self) -> bool {
        matches!(self, LirOp::Pseudo(_))
    }
}

/// One LIR node. `operands` meaning is target-specific; branches keep
/// their destination in `target` instead.
#[derive(Clone, Debug)]
pub struct Lir<Op> {
    pub opcode: LirOp<Op>,
    pub operands: [i32; 5],
    /// Byte offset in the code stream, assigned during assembly.
    pub offset: CodeOffset,
    /// Source dex PC.
    pub dalvik_offset: u32,
    /// Encoded size in bytes, assigned during assembly.
    pub size: u32,
    pub flags: LirFlags,
    /// Branch or load destination.
    pub target: Option<LirId>,
    /// Resource masks for the local optimizer; bit per tracked resource.
    pub use_mask: u64,
    pub def_mask: u64,
    /// MIR that generated this LIR, for safepoint bookkeeping.
    pub mir: Option<MirId>,
    pub prev: Option<LirId>,
    pub next: Option<LirId>,
}

impl<Op> Lir<Op> {
    pub fn new(opcode: LirOp<Op>, dalvik_offset: u32) -> Self {
        Lir {
            opcode,
            operands: [0; 5],
            offset: 0,
            dalvik_offset,
            size: 0,
            flags: LirFlags::default(),
            target: None,
            use_mask: 0,
            def_mask: 0,
            mir: None,
            prev: None,
            next: None,
        }
    }
}

/// Resource-mask bits shared by all targets. Target registers map into the
/// low bits; these name the non-register resources.
pub mod resource {
    /// Dalvik frame memory.
    pub const DALVIK_REG: u64 = 1 << 48;
    /// Heap memory.
    pub const HEAP_REF: u64 = 1 << 49;
    /// Literal pool memory.
    pub const LITERAL: u64 = 1 << 50;
    /// Must not alias or move across anything.
    pub const MUST_NOT_ALIAS: u64 = 1 << 51;
    /// Condition codes.
    pub const CC: u64 = 1 << 52;
    pub const ALL: u64 = !0;
}
