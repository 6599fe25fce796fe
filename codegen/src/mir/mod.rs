//! The middle intermediate representation: a basic-block graph over decoded
//! Dalvik instructions.
//!
//! Blocks and instructions live in entity maps; intra-graph links are
//! entity ids, never owning pointers, so passes can rewrite edges freely
//! and the whole graph is dropped at once when the method finishes.

use cranelift_entity::{entity_impl, EntityRef, PrimaryMap, SecondaryMap};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::dex::MethodReference;
use crate::insn::{DecodedInsn, Opcode};

pub mod analysis;
pub mod build;
pub mod dataflow;
pub mod lowering;
pub mod passes;

pub use lowering::{IFieldLoweringInfo, MethodLoweringInfo, SFieldLoweringInfo};

/// An opaque reference to a basic block.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(u32);
entity_impl!(Block, "block");

/// An opaque reference to a MIR instruction.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MirId(u32);
entity_impl!(MirId, "mir");

/// Kinds of basic blocks.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum BlockType {
    Entry,
    Exit,
    DalvikByteCode,
    Catch,
    Dead,
}

/// A successor edge of a switch or a throwing instruction, carrying the
/// case key (switches) or handler type index (exception edges).
#[derive(Copy, Clone, Debug)]
pub struct SuccessorInfo {
    pub block: Block,
    pub key: i32,
}

/// A basic block.
///
/// `taken` and `fall_through` are `None` or live blocks; a block ending in
/// a switch keeps its cases in `successors` and leaves both `None`.
#[derive(Clone, Debug)]
pub struct BasicBlock {
    pub block_type: BlockType,
    /// Dex PC of the first instruction.
    pub start_offset: u32,
    pub first_mir: Option<MirId>,
    pub last_mir: Option<MirId>,
    pub taken: Option<Block>,
    pub fall_through: Option<Block>,
    /// Switch cases or exception-handler edges.
    pub successors: Vec<SuccessorInfo>,
    pub predecessors: Vec<Block>,
    /// This block is the start of a catch handler.
    pub catch_entry: bool,
    /// Scratch flag for graph walks; cleared by `clear_visited_flags`.
    pub visited: bool,
}

impl BasicBlock {
    fn new(block_type: BlockType, start_offset: u32) -> Self {
        Self {
            block_type,
            start_offset,
            first_mir: None,
            last_mir: None,
            taken: None,
            fall_through: None,
            successors: Vec::new(),
            predecessors: Vec::new(),
            catch_entry: false,
            visited: false,
        }
    }
}

/// Pseudo-opcodes that extend the Dalvik space. Generated by passes, never
/// by the decoder.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum PseudoOp {
    Phi,
    Copy,
    FusedCmplFloat,
    FusedCmpgFloat,
    FusedCmplDouble,
    FusedCmpgDouble,
    FusedCmpLong,
    Nop,
    NullCheck,
    RangeCheck,
    DivZeroCheck,
    Check,
    Select,
    MemBarrier,
}

/// The opcode of a MIR instruction: either a decoded Dalvik opcode or one
/// of the pseudo extensions.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum MirOpcode {
    Dex(Opcode),
    Pseudo(PseudoOp),
}

impl MirOpcode {
    pub fn is_pseudo(self) -> bool {
        matches!(self, Self::Pseudo(_))
    }

    pub fn dex(self) -> Option<Opcode> {
        match self {
            Self::Dex(op) => Some(op),
            Self::Pseudo(_) => None,
        }
    }
}

/// Optimization flags attached to individual MIR instructions.
pub mod opt_flags {
    pub const IGNORE_NULL_CHECK: u16 = 1 << 0;
    pub const IGNORE_RANGE_CHECK: u16 = 1 << 1;
    pub const IGNORE_CLINIT_CHECK: u16 = 1 << 2;
    pub const IGNORE_DIV_ZERO_CHECK: u16 = 1 << 3;
    pub const IGNORE_SUSPEND_CHECK: u16 = 1 << 4;
    pub const INLINED: u16 = 1 << 5;
    /// Set by local value numbering on a redundant computation.
    pub const MARK: u16 = 1 << 6;
    /// The value stored by this instruction is known non-null.
    pub const STORE_NON_NULL: u16 = 1 << 7;
}

/// Side data valid only for specific opcode classes.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum MirMeta {
    #[default]
    None,
    /// Index into [`MirGraph::ifield_lowering_infos`].
    IFieldInfo(u16),
    /// Index into [`MirGraph::sfield_lowering_infos`].
    SFieldInfo(u16),
    /// Index into [`MirGraph::method_lowering_infos`].
    MethodInfo(u16),
}

/// Trivial def/use summary. Register numbers are Dalvik vregs; wide values
/// name only their low vreg, with `wide` flags in the dataflow attributes.
#[derive(Clone, Debug, Default)]
pub struct SsaRep {
    pub uses: SmallVec<[u32; 4]>,
    pub defs: SmallVec<[u32; 2]>,
}

/// One MIR instruction.
#[derive(Clone, Debug)]
pub struct Mir {
    pub opcode: MirOpcode,
    /// The decoded Dalvik operands. Pseudo ops reuse `va`/`vb`/`vc` with
    /// op-specific meaning.
    pub dalvik: DecodedInsn,
    /// Dex PC of this instruction.
    pub offset: u32,
    pub optimization_flags: u16,
    pub ssa_rep: SsaRep,
    pub meta: MirMeta,
    /// Owning block.
    pub bb: Block,
    pub next: Option<MirId>,
}

/// The per-method control-flow graph.
pub struct MirGraph {
    pub blocks: PrimaryMap<Block, BasicBlock>,
    pub mirs: PrimaryMap<MirId, Mir>,
    pub entry_block: Block,
    pub exit_block: Block,

    /// Pre-order DFS over live blocks, entry first. The graph builder
    /// renumbers blocks into reverse post-order, so ascending id order is
    /// an RPO walk.
    dfs_order: Vec<Block>,

    /// Dex PCs that start a catch handler.
    pub catches: Vec<u32>,

    /// Number of decoded Dalvik instructions (pseudo MIR excluded).
    pub num_dalvik_insns: usize,
    pub num_branches: usize,

    pub num_vregs: u16,
    pub num_ins: u16,
    pub num_outs: u16,

    pub ifield_lowering_infos: Vec<IFieldLoweringInfo>,
    pub sfield_lowering_infos: Vec<SFieldLoweringInfo>,
    pub method_lowering_infos: Vec<MethodLoweringInfo>,

    /// Constant value defined by a MIR, filled by constant propagation.
    pub constant_values: FxHashMap<MirId, i64>,
    /// Per-vreg use counts, filled by the promotion-counting pass.
    pub use_counts: Vec<u32>,
    /// Per-vreg weighted use counts (loop headers count more).
    pub weighted_use_counts: Vec<u32>,
    /// Vregs in descending promotion priority, filled by the promotion
    /// pass; the register allocator pins the leading entries.
    pub promotion_order: Vec<u16>,

    /// Method makes no calls; filled during analysis.
    pub is_leaf: bool,
    /// The compiled method has no `this` argument. Set by the compilation
    /// unit before passes run.
    pub static_entry: bool,
    /// A pass found a shape it cannot compile; defer to the interpreter.
    pub punt_to_interpreter: bool,
}

impl MirGraph {
    pub fn new(num_vregs: u16, num_ins: u16, num_outs: u16) -> Self {
        let mut blocks = PrimaryMap::new();
        let entry_block = blocks.push(BasicBlock::new(BlockType::Entry, 0));
        let exit_block = blocks.push(BasicBlock::new(BlockType::Exit, 0));
        Self {
            blocks,
            mirs: PrimaryMap::new(),
            entry_block,
            exit_block,
            dfs_order: Vec::new(),
            catches: Vec::new(),
            num_dalvik_insns: 0,
            num_branches: 0,
            num_vregs,
            num_ins,
            num_outs,
            ifield_lowering_infos: Vec::new(),
            sfield_lowering_infos: Vec::new(),
            method_lowering_infos: Vec::new(),
            constant_values: FxHashMap::default(),
            use_counts: Vec::new(),
            weighted_use_counts: Vec::new(),
            promotion_order: Vec::new(),
            is_leaf: true,
            static_entry: true,
            punt_to_interpreter: false,
        }
    }

    pub fn block(&self, id: Block) -> &BasicBlock {
        &self.blocks[id]
    }

    pub fn block_mut(&mut self, id: Block) -> &mut BasicBlock {
        &mut self.blocks[id]
    }

    pub fn mir(&self, id: MirId) -> &Mir {
        &self.mirs[id]
    }

    pub fn mir_mut(&mut self, id: MirId) -> &mut Mir {
        &mut self.mirs[id]
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Number of virtual registers local to the frame (excludes ins).
    pub fn num_local_vregs(&self) -> u16 {
        self.num_vregs - self.num_ins
    }

    /// First vreg holding an incoming argument.
    pub fn first_in_vreg(&self) -> u16 {
        self.num_vregs - self.num_ins
    }

    /// Append a MIR instruction to `block`.
    pub fn append_mir(&mut self, block: Block, mut mir: Mir) -> MirId {
        mir.bb = block;
        mir.next = None;
        let id = self.mirs.push(mir);
        let bb = &mut self.blocks[block];
        match bb.last_mir {
            None => bb.first_mir = Some(id),
            Some(last) => self.mirs[last].next = Some(id),
        }
        self.blocks[block].last_mir = Some(id);
        id
    }

    /// Iterate the MIR instructions of one block in order.
    pub fn block_mirs(&self, block: Block) -> BlockMirIter<'_> {
        BlockMirIter { graph: self, next: self.blocks[block].first_mir }
    }

    /// All blocks in entity order (includes dead blocks).
    pub fn all_blocks(&self) -> impl Iterator<Item = Block> + '_ {
        self.blocks.keys()
    }

    /// Pre-order DFS over live blocks. Requires `compute_dfs_order`.
    pub fn dfs_order(&self) -> &[Block] {
        &self.dfs_order
    }

    /// Successor blocks of `block`: taken, fall-through, then the successor
    /// list (switch cases or exception edges).
    pub fn successors_of(&self, block: Block) -> SmallVec<[Block; 4]> {
        let bb = &self.blocks[block];
        let mut out = SmallVec::new();
        if let Some(taken) = bb.taken {
            out.push(taken);
        }
        if let Some(ft) = bb.fall_through {
            out.push(ft);
        }
        for succ in &bb.successors {
            out.push(succ.block);
        }
        out
    }

    /// Recompute `dfs_order` by pre-order walk from the entry block, and
    /// mark unreached bytecode blocks dead.
    pub fn compute_dfs_order(&mut self) {
        self.clear_visited_flags();
        self.dfs_order.clear();
        let mut stack = vec![self.entry_block];
        while let Some(block) = stack.pop() {
            if self.blocks[block].visited || self.blocks[block].block_type == BlockType::Dead {
                continue;
            }
            self.blocks[block].visited = true;
            self.dfs_order.push(block);
            // Push in reverse so taken is visited first.
            let succs = self.successors_of(block);
            for &succ in succs.iter().rev() {
                stack.push(succ);
            }
        }
        let reached: Vec<bool> = {
            let mut reached = vec![false; self.blocks.len()];
            for &b in &self.dfs_order {
                reached[b.index()] = true;
            }
            reached
        };
        for block in self.blocks.keys().collect::<Vec<_>>() {
            let bb = &mut self.blocks[block];
            if !reached[block.index()]
                && matches!(bb.block_type, BlockType::DalvikByteCode | BlockType::Catch)
            {
                bb.block_type = BlockType::Dead;
                bb.first_mir = None;
                bb.last_mir = None;
                bb.taken = None;
                bb.fall_through = None;
                bb.successors.clear();
            }
        }
    }

    pub fn clear_visited_flags(&mut self) {
        for (_, bb) in self.blocks.iter_mut() {
            bb.visited = false;
        }
    }

    /// Rebuild predecessor lists from the edge fields.
    pub fn compute_predecessors(&mut self) {
        for (_, bb) in self.blocks.iter_mut() {
            bb.predecessors.clear();
        }
        for block in self.blocks.keys().collect::<Vec<_>>() {
            for succ in self.successors_of(block) {
                self.blocks[succ].predecessors.push(block);
            }
        }
    }

    /// The block starting at dex PC `offset`, if any.
    pub fn block_at_offset(&self, offset: u32) -> Option<Block> {
        self.blocks.iter().find_map(|(id, bb)| {
            (bb.start_offset == offset
                && matches!(bb.block_type, BlockType::DalvikByteCode | BlockType::Catch))
            .then_some(id)
        })
    }

    /// Devirtualization key: `MethodLoweringInfo` index stored in a MIR.
    pub fn method_lowering_info(&self, mir: &Mir) -> &MethodLoweringInfo {
        match mir.meta {
            MirMeta::MethodInfo(index) => &self.method_lowering_infos[usize::from(index)],
            _ => panic!("MIR at {:#x} has no method lowering info", mir.offset),
        }
    }

    pub fn ifield_lowering_info(&self, mir: &Mir) -> &IFieldLoweringInfo {
        match mir.meta {
            MirMeta::IFieldInfo(index) => &self.ifield_lowering_infos[usize::from(index)],
            _ => panic!("MIR at {:#x} has no instance-field lowering info", mir.offset),
        }
    }

    pub fn sfield_lowering_info(&self, mir: &Mir) -> &SFieldLoweringInfo {
        match mir.meta {
            MirMeta::SFieldInfo(index) => &self.sfield_lowering_infos[usize::from(index)],
            _ => panic!("MIR at {:#x} has no static-field lowering info", mir.offset),
        }
    }
}

/// Iterator over one block's MIR chain.
pub struct BlockMirIter<'a> {
    graph: &'a MirGraph,
    next: Option<MirId>,
}

impl Iterator for BlockMirIter<'_> {
    type Item = MirId;

    fn next(&mut self) -> Option<MirId> {
        let id = self.next?;
        self.next = self.graph.mirs[id].next;
        Some(id)
    }
}

/// A reusable secondary map keyed by block, the shape passes use for
/// per-block facts.
pub type BlockMap<T> = SecondaryMap<Block, T>;

/// Key for devirtualized invoke caching.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct MethodKey {
    pub method_idx: u32,
    pub invoke_kind: u8,
    pub vtable_idx: u32,
    pub devirt_target: Option<MethodReference>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::Opcode;

    fn dummy_mir(opcode: Opcode, offset: u32) -> Mir {
        Mir {
            opcode: MirOpcode::Dex(opcode),
            dalvik: DecodedInsn::decode(&[opcode as u16], 0),
            offset,
            optimization_flags: 0,
            ssa_rep: SsaRep::default(),
            meta: MirMeta::None,
            bb: Block::from_u32(0),
            next: None,
        }
    }

    #[test]
    fn append_links_mir_chain() {
        let mut graph = MirGraph::new(4, 1, 0);
        let block = graph.blocks.push(BasicBlock::new(BlockType::DalvikByteCode, 0));
        let a = graph.append_mir(block, dummy_mir(Opcode::Nop, 0));
        let b = graph.append_mir(block, dummy_mir(Opcode::ReturnVoid, 1));
        assert_eq!(graph.block(block).first_mir, Some(a));
        assert_eq!(graph.block(block).last_mir, Some(b));
        let collected: Vec<_> = graph.block_mirs(block).collect();
        assert_eq!(collected, [a, b]);
    }

    #[test]
    fn dfs_marks_unreachable_dead() {
        let mut graph = MirGraph::new(1, 0, 0);
        let reachable = graph.blocks.push(BasicBlock::new(BlockType::DalvikByteCode, 0));
        let orphan = graph.blocks.push(BasicBlock::new(BlockType::DalvikByteCode, 8));
        graph.blocks[graph.entry_block].fall_through = Some(reachable);
        graph.blocks[reachable].fall_through = Some(graph.exit_block);
        graph.compute_dfs_order();
        assert_eq!(graph.block(orphan).block_type, BlockType::Dead);
        assert_eq!(graph.dfs_order().first(), Some(&graph.entry_block));
        assert!(graph.dfs_order().contains(&reachable));
    }
}
