//! MIR graph construction from a code item.
//!
//! Two walks over the instruction stream: the first finds block leaders
//! (branch targets, switch cases, catch handlers, the instruction after any
//! throwing instruction inside a try range), the second creates blocks in
//! PC order and wires the edges. Blocks are then renumbered so that ids are
//! contiguous in reverse post-order of the DFS from the entry block.

use cranelift_entity::{EntityRef, PrimaryMap};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::dex::CodeItem;
use crate::insn::{self, DecodedInsn, Opcode};
use crate::mir::{BasicBlock, Block, BlockType, Mir, MirGraph, MirMeta, MirOpcode, SuccessorInfo};

/// Build the MIR graph for `code_item`.
pub fn build_graph(code_item: &CodeItem) -> MirGraph {
    let mut graph = MirGraph::new(
        code_item.registers_size,
        code_item.ins_size,
        code_item.outs_size,
    );
    let insns = &code_item.insns[..];
    if insns.is_empty() {
        graph.compute_dfs_order();
        return graph;
    }

    // Decode every instruction once, skipping inline payloads.
    let mut decoded: Vec<(u32, DecodedInsn, u32)> = Vec::new();
    let mut pc = 0usize;
    while pc < insns.len() {
        let unit = insns[pc];
        let width = DecodedInsn::width(insns, pc);
        if unit & 0xff != 0 || unit == 0 {
            decoded.push((pc as u32, DecodedInsn::decode(insns, pc), width));
        }
        pc += width as usize;
    }

    let leaders = find_leaders(code_item, &decoded);

    // Create a block per leader, in PC order.
    let mut block_at: FxHashMap<u32, Block> = FxHashMap::default();
    for &(pc, _, _) in &decoded {
        if leaders.contains(&pc) {
            let block = graph.blocks.push(BasicBlock {
                block_type: BlockType::DalvikByteCode,
                start_offset: pc,
                ..BasicBlock::new(BlockType::DalvikByteCode, pc)
            });
            block_at.insert(pc, block);
        }
    }

    // Catch-handler entries.
    let mut catches: FxHashSet<u32> = FxHashSet::default();
    for try_item in &code_item.tries {
        for handler in &try_item.handlers {
            catches.insert(handler.address);
        }
    }
    for &handler_pc in &catches {
        if let Some(&block) = block_at.get(&handler_pc) {
            graph.blocks[block].block_type = BlockType::Catch;
            graph.blocks[block].catch_entry = true;
        }
    }
    graph.catches = catches.iter().copied().collect();
    graph.catches.sort_unstable();

    // Fill blocks and wire edges.
    let entry = graph.entry_block;
    let exit = graph.exit_block;
    graph.blocks[entry].fall_through = block_at.get(&0).copied();

    let mut current = None;
    for (index, &(pc, insn, width)) in decoded.iter().enumerate() {
        if let Some(&block) = block_at.get(&pc) {
            current = Some(block);
        }
        let block = current.expect("instruction before first leader");
        let opcode = insn.opcode;
        graph.num_dalvik_insns += 1;

        let mir = Mir {
            opcode: MirOpcode::Dex(opcode),
            dalvik: insn,
            offset: pc,
            optimization_flags: 0,
            ssa_rep: super::dataflow::compute_ssa_rep(MirOpcode::Dex(opcode), &insn),
            meta: MirMeta::None,
            bb: block,
            next: None,
        };
        graph.append_mir(block, mir);
        if opcode.is_invoke() {
            graph.is_leaf = false;
        }

        let next_pc = decoded.get(index + 1).map(|&(pc, _, _)| pc);
        let ends_block = opcode.is_branch()
            || opcode.is_switch()
            || opcode.is_return()
            || opcode == Opcode::Throw
            || next_pc.is_some_and(|pc| leaders.contains(&pc));
        if !ends_block {
            continue;
        }

        let target_of = |rel: i64| {
            let target = (pc as i64 + rel) as u32;
            block_at[&target]
        };
        if opcode.is_conditional_branch() {
            graph.num_branches += 1;
            graph.blocks[block].taken = Some(target_of(insn.literal));
            graph.blocks[block].fall_through = next_pc.map(|pc| block_at[&pc]);
        } else if opcode.is_branch() {
            graph.num_branches += 1;
            graph.blocks[block].taken = Some(target_of(insn.literal));
        } else if opcode.is_switch() {
            wire_switch(&mut graph, code_item, &block_at, block, pc, insn);
            // No-match falls through to the next instruction.
            graph.blocks[block].fall_through = next_pc.map(|pc| block_at[&pc]);
        } else if opcode.is_return() {
            graph.blocks[block].fall_through = Some(exit);
        } else if opcode == Opcode::Throw {
            // Control only continues through a handler (wired below).
        } else if opcode.can_continue() {
            graph.blocks[block].fall_through = next_pc.map(|pc| block_at[&pc]);
        }
        current = None;
    }

    wire_exception_edges(&mut graph, code_item, &block_at);
    renumber_in_rpo(&mut graph);
    graph.compute_dfs_order();
    graph.compute_predecessors();
    graph
}

/// First walk: every PC that must start a block.
fn find_leaders(code_item: &CodeItem, decoded: &[(u32, DecodedInsn, u32)]) -> FxHashSet<u32> {
    let mut leaders: FxHashSet<u32> = FxHashSet::default();
    leaders.insert(0);

    let in_try = |pc: u32| {
        code_item
            .tries
            .iter()
            .any(|t| pc >= t.start_addr && pc < t.start_addr + u32::from(t.insn_count))
    };

    for (index, &(pc, insn, _)) in decoded.iter().enumerate() {
        let opcode = insn.opcode;
        let next_pc = decoded.get(index + 1).map(|&(pc, _, _)| pc);
        if opcode.is_branch() {
            leaders.insert((pc as i64 + insn.literal) as u32);
            if let Some(next) = next_pc {
                leaders.insert(next);
            }
        } else if opcode.is_switch() {
            let payload_pc = (pc as i64 + insn.literal) as usize;
            match code_item.insns[payload_pc] {
                insn::PACKED_SWITCH_SIGNATURE => {
                    let payload = insn::parse_packed_switch(&code_item.insns, payload_pc);
                    for case in 0..usize::from(payload.size) {
                        leaders.insert((pc as i64 + i64::from(payload.target(case))) as u32);
                    }
                }
                _ => {
                    let payload = insn::parse_sparse_switch(&code_item.insns, payload_pc);
                    for case in 0..usize::from(payload.size) {
                        leaders.insert((pc as i64 + i64::from(payload.target(case))) as u32);
                    }
                }
            }
            if let Some(next) = next_pc {
                leaders.insert(next);
            }
        } else if opcode.is_return() || opcode == Opcode::Throw {
            if let Some(next) = next_pc {
                leaders.insert(next);
            }
        } else if opcode.can_throw() && in_try(pc) {
            // Split after a throwing instruction inside a try so the
            // exception edge set is per-block precise.
            if let Some(next) = next_pc {
                leaders.insert(next);
            }
        }
    }

    for try_item in &code_item.tries {
        for handler in &try_item.handlers {
            leaders.insert(handler.address);
        }
    }
    leaders
}

fn wire_switch(
    graph: &mut MirGraph,
    code_item: &CodeItem,
    block_at: &FxHashMap<u32, Block>,
    block: Block,
    pc: u32,
    insn: DecodedInsn,
) {
    let payload_pc = (pc as i64 + insn.literal) as usize;
    let mut cases = Vec::new();
    match code_item.insns[payload_pc] {
        insn::PACKED_SWITCH_SIGNATURE => {
            let payload = insn::parse_packed_switch(&code_item.insns, payload_pc);
            for case in 0..usize::from(payload.size) {
                let target = (pc as i64 + i64::from(payload.target(case))) as u32;
                cases.push((payload.first_key + case as i32, target));
            }
        }
        _ => {
            let payload = insn::parse_sparse_switch(&code_item.insns, payload_pc);
            for case in 0..usize::from(payload.size) {
                let target = (pc as i64 + i64::from(payload.target(case))) as u32;
                cases.push((payload.key(case), target));
            }
        }
    }
    for (key, target_pc) in cases {
        // All case targets were registered as leaders, so the lookup is
        // infallible.
        let target = block_at[&target_pc];
        graph.blocks[block].successors.push(SuccessorInfo { block: target, key });
    }
}

/// Add `successors` edges from every block containing a throwing
/// instruction in a try range to the range's handlers.
fn wire_exception_edges(
    graph: &mut MirGraph,
    code_item: &CodeItem,
    block_at: &FxHashMap<u32, Block>,
) {
    for try_item in &code_item.tries {
        let start = try_item.start_addr;
        let end = try_item.start_addr + u32::from(try_item.insn_count);
        let blocks: Vec<Block> = graph
            .blocks
            .iter()
            .filter(|(_, bb)| {
                matches!(bb.block_type, BlockType::DalvikByteCode | BlockType::Catch)
                    && bb.start_offset >= start
                    && bb.start_offset < end
            })
            .map(|(id, _)| id)
            .collect();
        for block in blocks {
            let throws = graph
                .block_mirs(block)
                .any(|m| graph.mir(m).opcode.dex().is_some_and(|op| op.can_throw()));
            if !throws {
                continue;
            }
            for handler in &try_item.handlers {
                let handler_block = block_at[&handler.address];
                let key = handler.type_idx.map_or(-1, |idx| idx as i32);
                graph.blocks[block].successors.push(SuccessorInfo { block: handler_block, key });
            }
        }
    }
}

/// Renumber blocks so ids ascend in reverse post-order of the DFS. Dead
/// and unreached blocks keep their relative order after the live ones.
fn renumber_in_rpo(graph: &mut MirGraph) {
    // Post-order DFS.
    let mut post: Vec<Block> = Vec::with_capacity(graph.blocks.len());
    let mut visited = vec![false; graph.blocks.len()];
    let mut stack: Vec<(Block, usize)> = vec![(graph.entry_block, 0)];
    visited[graph.entry_block.index()] = true;
    while let Some(&(block, child)) = stack.last() {
        let succs = graph.successors_of(block);
        if child < succs.len() {
            stack.last_mut().unwrap().1 += 1;
            let next = succs[child];
            if !visited[next.index()] {
                visited[next.index()] = true;
                stack.push((next, 0));
            }
        } else {
            post.push(block);
            stack.pop();
        }
    }

    let mut order: Vec<Block> = post.into_iter().rev().collect();
    for (id, _) in graph.blocks.iter() {
        if !visited[id.index()] {
            order.push(id);
        }
    }

    let mut remap = vec![Block::from_u32(0); graph.blocks.len()];
    for (new_index, &old) in order.iter().enumerate() {
        remap[old.index()] = Block::from_u32(new_index as u32);
    }

    let mut new_blocks = PrimaryMap::with_capacity(graph.blocks.len());
    for &old in &order {
        let mut bb = graph.blocks[old].clone();
        bb.taken = bb.taken.map(|b| remap[b.index()]);
        bb.fall_through = bb.fall_through.map(|b| remap[b.index()]);
        for succ in &mut bb.successors {
            succ.block = remap[succ.block.index()];
        }
        bb.predecessors.clear();
        new_blocks.push(bb);
    }
    graph.blocks = new_blocks;
    graph.entry_block = remap[graph.entry_block.index()];
    graph.exit_block = remap[graph.exit_block.index()];
    let mir_ids: Vec<_> = graph.mirs.keys().collect();
    for id in mir_ids {
        let old = graph.mirs[id].bb;
        graph.mirs[id].bb = remap[old.index()];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::{CatchHandler, TryItem};

    fn code_item(insns: Vec<u16>, registers: u16, ins: u16) -> CodeItem {
        CodeItem { registers_size: registers, ins_size: ins, outs_size: 0, insns, tries: vec![] }
    }

    #[test]
    fn straight_line_method() {
        // const/4 v0, #1; return v0
        let item = code_item(vec![0x1012, 0x000f], 1, 0);
        let graph = build_graph(&item);
        assert_eq!(graph.num_dalvik_insns, 2);
        let code_blocks: Vec<_> = graph
            .blocks
            .iter()
            .filter(|(_, bb)| bb.block_type == BlockType::DalvikByteCode)
            .collect();
        assert_eq!(code_blocks.len(), 1);
        let (_, bb) = code_blocks[0];
        assert_eq!(bb.fall_through, Some(graph.exit_block));
    }

    #[test]
    fn diamond_from_if() {
        // 0: if-eqz v0, +4
        // 2: const/4 v0, #1
        // 3: goto +2
        // 4: const/4 v0, #2   <- wait, goto target must be 5
        //
        // Layout: if-eqz v0 -> +4 (pc 4); const/4; return-void at 4.
        let item = code_item(
            vec![
                0x0038, 0x0004, // 0: if-eqz v0, +4 -> pc 4
                0x1012, // 2: const/4 v0, #1
                0x000e, // 3: return-void
                0x000e, // 4: return-void
            ],
            1,
            1,
        );
        let graph = build_graph(&item);
        assert_eq!(graph.num_branches, 1);
        let branch_block = graph
            .blocks
            .iter()
            .find(|(_, bb)| bb.start_offset == 0 && bb.block_type == BlockType::DalvikByteCode)
            .map(|(id, _)| id)
            .unwrap();
        let bb = graph.block(branch_block);
        assert!(bb.taken.is_some());
        assert!(bb.fall_through.is_some());
        assert_ne!(bb.taken, bb.fall_through);
        // Entry must be block id 0 after RPO renumbering.
        assert_eq!(graph.entry_block.index(), 0);
    }

    #[test]
    fn catch_handler_becomes_catch_block() {
        // 0: invoke-static {}, method@0  (throwing, inside try)
        // 3: return-void
        // 4: move-exception v0; return-void  (handler)
        let item = CodeItem {
            registers_size: 1,
            ins_size: 0,
            outs_size: 0,
            insns: vec![0x0071, 0x0000, 0x0000, 0x000e, 0x000d, 0x000e],
            tries: vec![TryItem {
                start_addr: 0,
                insn_count: 3,
                handlers: vec![CatchHandler { type_idx: None, address: 4 }],
            }],
        };
        let graph = build_graph(&item);
        assert_eq!(graph.catches, vec![4]);
        let handler = graph.block_at_offset(4).unwrap();
        assert_eq!(graph.block(handler).block_type, BlockType::Catch);
        assert!(graph.block(handler).catch_entry);
        // The throwing block has an exception edge to the handler.
        let thrower = graph.block_at_offset(0).unwrap();
        assert!(graph.block(thrower).successors.iter().any(|s| s.block == handler));
        assert!(!graph.is_leaf);
    }

    #[test]
    fn packed_switch_edges() {
        let mut insns = vec![
            0x002b, 0x0005, 0x0000, // 0: packed-switch v0, payload @5
            0x000e, // 3: return-void (default, fall-through)
            0x000e, // 4: case target
        ];
        // payload at pc 5: signature, size=1, first_key=0, target +4
        insns.extend_from_slice(&[insn::PACKED_SWITCH_SIGNATURE, 1, 0, 0, 4, 0]);
        let item = code_item(insns, 1, 1);
        let graph = build_graph(&item);
        let switch_block = graph.block_at_offset(0).unwrap();
        let bb = graph.block(switch_block);
        assert_eq!(bb.successors.len(), 1);
        assert_eq!(bb.successors[0].key, 0);
        assert!(bb.taken.is_none());
        assert!(bb.fall_through.is_some());
    }
}
