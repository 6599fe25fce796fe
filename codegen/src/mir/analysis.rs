//! The soft method filter: cheap shape statistics and the decision matrix
//! that decides compile vs. defer-to-interpreter.
//!
//! The statistics deliberately avoid dataflow analysis; the point is to
//! make an informed guess before investing in compilation. Blocks broken by
//! exception edges are walked as one linear region, and a simple back-edge
//! test stands in for loop detection, scaling the counts of loop bodies.

use crate::mir::dataflow::{analysis_attrs, attrs};
use crate::mir::{Block, BlockType, MirGraph};
use crate::options::{CompilerFilter, CompilerOptions};

/// Counts in loop-scaled dex instructions.
const LOOP_SCALE_FACTOR: usize = 25;

#[derive(Default, Debug)]
pub struct MethodStats {
    pub dex_instructions: usize,
    pub math_ops: usize,
    pub fp_ops: usize,
    pub array_ops: usize,
    pub branch_ops: usize,
    pub heavyweight_ops: usize,
    pub has_computational_loop: bool,
    pub has_switch: bool,
}

impl MethodStats {
    fn ratio(&self, count: usize) -> f32 {
        count as f32 / self.dex_instructions as f32
    }

    pub fn math_ratio(&self) -> f32 {
        self.ratio(self.math_ops)
    }

    pub fn fp_ratio(&self) -> f32 {
        self.ratio(self.fp_ops)
    }

    pub fn array_ratio(&self) -> f32 {
        self.ratio(self.array_ops)
    }

    pub fn branch_ratio(&self) -> f32 {
        self.ratio(self.branch_ops)
    }

    pub fn heavyweight_ratio(&self) -> f32 {
        self.ratio(self.heavyweight_ops)
    }
}

/// The filter verdict.
#[derive(Debug)]
pub enum FilterDecision {
    Compile,
    /// Emit the canned pattern for an inliner-special method.
    CompileSpecial,
    Skip(String),
}

fn is_code_block(block_type: BlockType) -> bool {
    matches!(block_type, BlockType::DalvikByteCode | BlockType::Catch)
}

/// Accumulate statistics for the linear region starting at `bb`, following
/// exception fall-through edges as if they were one block.
fn analyze_block(graph: &mut MirGraph, bb: Block, stats: &mut MethodStats) {
    if graph.block(bb).visited || !is_code_block(graph.block(bb).block_type) {
        return;
    }
    let mut computational_block = true;
    let mut has_math = false;

    // Find the region's ending block: scan forward along fall-through edges
    // until a block whose last instruction actually branches.
    let mut ending_bb = bb;
    if graph.block(ending_bb).last_mir.is_some() {
        loop {
            let last = match graph.block(ending_bb).last_mir {
                Some(last) => last,
                None => break,
            };
            if analysis_attrs(graph.mir(last).opcode) & attrs::BRANCH != 0 {
                break;
            }
            match graph.block(ending_bb).fall_through {
                Some(ft) if is_code_block(graph.block(ft).block_type) => ending_bb = ft,
                _ => break,
            }
        }
    }

    // Cheap loop forms: a region whose taken edge lands back at its own
    // head, directly or through one block.
    let mut loop_scale_factor = 1;
    let ending = graph.block(ending_bb);
    if let (Some(taken), None) = (ending.taken, ending.fall_through) {
        let taken_bb = graph.block(taken);
        if taken_bb.taken == Some(bb) || taken_bb.fall_through == Some(bb) {
            loop_scale_factor = LOOP_SCALE_FACTOR;
        }
    }
    if graph.block(ending_bb).taken == Some(bb) {
        loop_scale_factor = LOOP_SCALE_FACTOR;
    }

    let mut tbb = bb;
    loop {
        graph.block_mut(tbb).visited = true;
        let mirs: Vec<_> = graph.block_mirs(tbb).collect();
        for mir_id in mirs {
            let mir = graph.mir(mir_id);
            if mir.opcode.is_pseudo() {
                continue;
            }
            let flags = analysis_attrs(mir.opcode);
            stats.dex_instructions += loop_scale_factor;
            if flags & attrs::BRANCH == 0 {
                computational_block &= flags & attrs::COMPUTATIONAL != 0;
            } else {
                stats.branch_ops += loop_scale_factor;
            }
            if flags & attrs::MATH != 0 {
                stats.math_ops += loop_scale_factor;
                has_math = true;
            }
            if flags & attrs::FP != 0 {
                stats.fp_ops += loop_scale_factor;
            }
            if flags & attrs::ARRAY_OP != 0 {
                stats.array_ops += loop_scale_factor;
            }
            if flags & attrs::HEAVYWEIGHT != 0 {
                stats.heavyweight_ops += loop_scale_factor;
            }
            if flags & attrs::SWITCH != 0 {
                stats.has_switch = true;
            }
        }
        if tbb == ending_bb {
            break;
        }
        match graph.block(tbb).fall_through {
            Some(ft) => tbb = ft,
            None => break,
        }
    }
    if has_math && computational_block && loop_scale_factor > 1 {
        stats.has_computational_loop = true;
    }
}

fn compute_skip_compilation(
    graph: &MirGraph,
    options: &CompilerOptions,
    stats: &MethodStats,
    skip_default: Option<String>,
    show_stats: bool,
    pretty_name: &str,
) -> Option<String> {
    if stats.dex_instructions == 0 {
        return skip_default;
    }
    if show_stats {
        log::info!(
            "STATS {}, math:{}, fp:{}, br:{}, hw:{}, arr:{}, hot:{}, {}",
            stats.dex_instructions,
            stats.math_ratio(),
            stats.fp_ratio(),
            stats.branch_ratio(),
            stats.heavyweight_ratio(),
            stats.array_ratio(),
            stats.has_computational_loop,
            pretty_name,
        );
    }

    // Computation intensive?
    if stats.has_computational_loop && stats.heavyweight_ratio() < 0.04 {
        return None;
    }

    // Complex, logic-intensive?
    if options.is_small_method(graph.num_dalvik_insns) && stats.branch_ratio() > 0.3 {
        return None;
    }

    // Significant floating point?
    if stats.fp_ratio() > 0.05 {
        return None;
    }

    // Significant generic math?
    if stats.math_ratio() > 0.3 {
        return None;
    }

    // If array-intensive, compiling is probably worthwhile.
    if stats.array_ratio() > 0.1 {
        return None;
    }

    // Switch operations benefit greatly from compilation.
    if stats.has_switch {
        return None;
    }

    // Significant in size with a high proportion of expensive operations.
    if options.is_small_method(graph.num_dalvik_insns) && stats.heavyweight_ratio() > 0.3 {
        return Some(format!(
            "small method with heavyweight ratio {}",
            stats.heavyweight_ratio()
        ));
    }

    skip_default
}

/// Run the soft filter. `is_class_initializer` and `is_special` come from
/// the access flags and the per-dex inliner map.
pub fn filter_method(
    graph: &mut MirGraph,
    options: &CompilerOptions,
    is_class_initializer: bool,
    is_special: bool,
    show_stats: bool,
    pretty_name: &str,
) -> FilterDecision {
    if options.compiler_filter == CompilerFilter::Everything {
        return FilterDecision::Compile;
    }

    if graph.punt_to_interpreter {
        return FilterDecision::Skip("punt to interpreter set".to_string());
    }

    debug_assert!(options.compiler_filter.is_compilation_enabled());

    // Compilation cutoffs for the current filter mode.
    let (small_cutoff, default_cutoff) = match options.compiler_filter {
        CompilerFilter::Balanced => {
            (options.small_method_threshold, options.large_method_threshold)
        }
        CompilerFilter::Space => (options.tiny_method_threshold, options.small_method_threshold),
        CompilerFilter::Speed | CompilerFilter::Time => {
            (options.huge_method_threshold, options.huge_method_threshold)
        }
        filter => panic!("unexpected compiler filter {filter:?}"),
    };

    let size = graph.num_dalvik_insns;

    // If size < cutoff, assume compilation - but allow analysis to cancel.
    let mut skip_default = (size >= default_cutoff)
        .then(|| format!("#insns {size} >= default cutoff {default_cutoff}"));

    // Huge methods are likely machine generated, but some are not; with a
    // huge block count, do not even bother with further analysis.
    if options.is_huge_method(size) {
        skip_default = Some(format!("huge method: {size} insns"));
        if graph.num_blocks() > options.huge_method_threshold / 2 {
            return FilterDecision::Skip(skip_default.unwrap());
        }
    } else if options.is_large_method(size) && graph.num_branches == 0 {
        // Large and branchless smells like a generated initialization table.
        return FilterDecision::Skip("large method with no branches".to_string());
    } else if options.compiler_filter == CompilerFilter::Speed {
        // Not huge: compile.
        return FilterDecision::Compile;
    }

    // Class initializers run once; compiling them is wasted space.
    if is_class_initializer {
        return FilterDecision::Skip("class initializer".to_string());
    }

    // Special patterns get the canned stub regardless of statistics.
    if is_special {
        return FilterDecision::CompileSpecial;
    }

    if size < small_cutoff {
        return FilterDecision::Compile;
    }

    let mut stats = MethodStats::default();
    graph.clear_visited_flags();
    for block in graph.all_blocks().collect::<Vec<_>>() {
        analyze_block(graph, block, &mut stats);
    }

    match compute_skip_compilation(graph, options, &stats, skip_default, show_stats, pretty_name)
    {
        Some(message) => FilterDecision::Skip(message),
        None => FilterDecision::Compile,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::CodeItem;
    use crate::mir::build::build_graph;

    fn graph_of(insns: Vec<u16>, registers: u16) -> MirGraph {
        build_graph(&CodeItem {
            registers_size: registers,
            ins_size: 1,
            outs_size: 0,
            insns,
            tries: vec![],
        })
    }

    #[test]
    fn everything_filter_always_compiles() {
        let mut graph = graph_of(vec![0x000e], 1);
        let options =
            CompilerOptions { compiler_filter: CompilerFilter::Everything, ..Default::default() };
        assert!(matches!(
            filter_method(&mut graph, &options, true, false, false, "m"),
            FilterDecision::Compile
        ));
    }

    #[test]
    fn speed_compiles_non_huge() {
        let mut graph = graph_of(vec![0x000e], 1);
        let options =
            CompilerOptions { compiler_filter: CompilerFilter::Speed, ..Default::default() };
        assert!(matches!(
            filter_method(&mut graph, &options, false, false, false, "m"),
            FilterDecision::Compile
        ));
    }

    #[test]
    fn huge_branchless_method_skipped() {
        // 20k nops then return-void: huge and hugely blocky it is not, but
        // it exceeds the default cutoff and has no redeeming statistics.
        let mut insns = vec![0x0000u16; 20_000];
        insns.push(0x000e);
        let mut graph = graph_of(insns, 1);
        let options =
            CompilerOptions { compiler_filter: CompilerFilter::Speed, ..Default::default() };
        assert!(matches!(
            filter_method(&mut graph, &options, false, false, false, "m"),
            FilterDecision::Skip(_)
        ));
    }

    #[test]
    fn class_initializer_skipped_in_balanced() {
        let mut graph = graph_of(vec![0x000e], 1);
        let options =
            CompilerOptions { compiler_filter: CompilerFilter::Balanced, ..Default::default() };
        assert!(matches!(
            filter_method(&mut graph, &options, true, false, false, "m"),
            FilterDecision::Skip(_)
        ));
    }

    #[test]
    fn special_pattern_wins_over_statistics() {
        let mut graph = graph_of(vec![0x000e], 1);
        let options =
            CompilerOptions { compiler_filter: CompilerFilter::Balanced, ..Default::default() };
        assert!(matches!(
            filter_method(&mut graph, &options, false, true, false, "m"),
            FilterDecision::CompileSpecial
        ));
    }

    #[test]
    fn punt_flag_skips() {
        let mut graph = graph_of(vec![0x000e], 1);
        graph.punt_to_interpreter = true;
        let options =
            CompilerOptions { compiler_filter: CompilerFilter::Speed, ..Default::default() };
        assert!(matches!(
            filter_method(&mut graph, &options, false, false, false, "m"),
            FilterDecision::Skip(_)
        ));
    }
}
