//! An ahead-of-time code generator for Dalvik bytecode.
//!
//! The crate ingests a verified method's code item and produces a
//! self-contained native artifact: machine code plus the runtime metadata
//! that makes it safepoint-safe and GC-correct (PC mapping table, vmap
//! table, native GC map, CFI), packaged as a [`CompiledMethod`] and
//! deduplicated across methods.
//!
//! The pipeline per method: decode into a basic-block MIR graph, run the
//! compilation filter, populate the field/method lowering caches, run the
//! optimization passes, lower to target LIR through one of the per-ISA
//! backends, allocate registers, assemble with branch-fixup retries, and
//! seal the artifact. Methods the filter rejects return `None` and run
//! under the interpreter; nothing about a rejection is an error.

#![allow(clippy::too_many_arguments)]

pub mod arena;
pub mod backend;
pub mod compiled;
pub mod dex;
pub mod driver;
pub mod error;
pub mod inliner;
pub mod insn;
pub mod isa;
pub mod leb128;
pub mod linker;
pub mod mir;
pub mod options;
pub mod storage;
pub mod timing;
pub mod verified;

use std::sync::Arc;

use crate::backend::{assemble, tables, CodeGen, Target};
use crate::compiled::CompiledMethod;
use crate::dex::{access_flags, CodeItem, DexFile, InvokeType, MethodReference};
use crate::driver::CompilerDriver;
use crate::inliner::InlinePattern;
use crate::mir::analysis::{filter_method, FilterDecision};
use crate::mir::build::build_graph;
use crate::mir::passes::{run_passes, PassContext};
use crate::mir::MirGraph;
use crate::options::{
    disabled_optimizations_for_isa, CompilerOptions, DebugFlag, InstructionSet,
};
use crate::timing::TimingLogger;
use crate::verified::VerifiedMethod;

/// The 16-bit SSA name space must not overflow: methods are rejected at a
/// quarter of the instruction and register count ranges.
const MAX_INSNS_SIZE_IN_CODE_UNITS: u32 = u16::MAX as u32 / 4;
const MAX_REGISTERS_SIZE: u16 = u16::MAX / 4;
/// Limit on Dalvik registers per method, below the SSA namespace bound.
const MAX_DALVIK_REGISTERS: u16 = (i16::MAX / 2) as u16;

/// Per-method compilation session state. Created at method entry,
/// destroyed at method exit; never shared across threads.
pub struct CompilationUnit<'a> {
    pub options: &'a CompilerOptions,
    pub dex_file: &'a DexFile,
    pub code_item: &'a CodeItem,
    /// Unit-lifetime scratch: GC-map bit buffers, switch and fill-array
    /// payload copies.
    pub arena: &'a arena::Arena<'a>,
    pub method_idx: u32,
    pub class_def_idx: u16,
    pub access_flags: u32,
    pub invoke_type: InvokeType,
    pub shorty: &'a str,
    pub instruction_set: InstructionSet,
    pub target64: bool,
    /// Disabled-pass bits, the defaults ORed with the per-ISA mask.
    pub disable_opt: u32,
    pub debug_flags: u32,
    pub verbose: bool,
    pub verified: Option<Arc<VerifiedMethod>>,
}

/// Compile one method. `None` means "not compiled": the method runs under
/// the interpreter. This is the single entry point the driver fans out
/// over.
pub fn compile_method(
    driver: &CompilerDriver,
    code_item: &CodeItem,
    access_flags: u32,
    invoke_type: InvokeType,
    class_def_idx: u16,
    method_idx: u32,
    dex_file: &DexFile,
) -> Option<CompiledMethod> {
    let options = driver.options();
    let pretty = dex_file.pretty_method(method_idx);
    log::debug!("compiling {pretty}...");

    // Pathologically large methods overflow the 16-bit SSA name space;
    // skip them outright.
    if code_item.insns_size_in_code_units() >= MAX_INSNS_SIZE_IN_CODE_UNITS {
        log::info!(
            "method exceeds compiler instruction limit: {} in {pretty}",
            code_item.insns_size_in_code_units()
        );
        return None;
    }
    if code_item.registers_size >= MAX_REGISTERS_SIZE
        || code_item.registers_size > MAX_DALVIK_REGISTERS
    {
        log::info!(
            "method exceeds compiler virtual register limit: {} in {pretty}",
            code_item.registers_size
        );
        return None;
    }
    if !options.compiler_filter.is_compilation_enabled() {
        return None;
    }
    if access_flags & access_flags::ACC_NATIVE != 0 || code_item.insns.is_empty() {
        // Native methods get the generic JNI trampoline entry from the
        // runtime; there is nothing to compile here.
        return None;
    }

    // Plain ARM requests were already promoted to Thumb2 by the option
    // parser; the backend table knows nothing else.
    let instruction_set = options.instruction_set;
    if !isa::is_isa_enabled(instruction_set) {
        log::warn!("instruction set {instruction_set} not enabled in this build");
        return None;
    }

    let method_ref = MethodReference::new(dex_file.id, method_idx);
    let verified = driver.verification_results().get_verified_method(method_ref);

    // The unit arena lives until the method is sealed; the stack arena
    // backs pass-local scratch scopes.
    let unit_arena = arena::Arena::new(driver.arena_pool());
    let arena_stack = arena::ArenaStack::new(driver.arena_pool());

    let verbose = options.is_verbose_method(&pretty)
        || options.debug_flags & DebugFlag::Verbose.bit() != 0;
    let cu = CompilationUnit {
        options,
        dex_file,
        code_item,
        arena: &unit_arena,
        method_idx,
        class_def_idx,
        access_flags,
        invoke_type,
        shorty: dex_file.method_shorty(method_idx),
        instruction_set,
        target64: instruction_set.is_64bit(),
        disable_opt: options.disable_optimizations
            | disabled_optimizations_for_isa(instruction_set),
        debug_flags: options.debug_flags,
        verbose,
        verified,
    };

    let mut timings = TimingLogger::new(options.dump_passes);
    timings.new_split("BuildMirGraph");
    let mut graph = build_graph(code_item);
    graph.static_entry = access_flags & access_flags::ACC_STATIC != 0;

    if !can_compile_method(&cu, &graph) {
        log::debug!("{instruction_set}: cannot compile method: {pretty}");
        return None;
    }

    // Populate the lowering caches before any pass or filter decision;
    // resolution results feed both.
    timings.new_split("CacheLoweringInfo");
    {
        let allocator = arena_stack.scope();
        mir::lowering::cache_field_lowering_info(
            &mut graph,
            &allocator,
            dex_file,
            driver.linker(),
        );
        mir::lowering::cache_method_lowering_info(
            &mut graph,
            dex_file,
            driver.linker(),
            cu.verified.as_deref(),
        );
    }

    timings.new_split("MirOpt:CheckFilters");
    let inliner = driver.inliner_map().get_method_inliner(dex_file);
    let is_special = inliner.read().unwrap().is_special(method_idx);
    let is_class_initializer = access_flags & access_flags::ACC_CONSTRUCTOR != 0
        && access_flags & access_flags::ACC_STATIC != 0;
    let decision = filter_method(
        &mut graph,
        options,
        is_class_initializer,
        is_special,
        options.debug_flags & DebugFlag::ShowFilterStats.bit() != 0,
        &pretty,
    );
    match decision {
        FilterDecision::Skip(reason) => {
            log::debug!("{instruction_set}: skipping method: {pretty}, reason: {reason}");
            driver.counters().skipped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return None;
        }
        FilterDecision::CompileSpecial | FilterDecision::Compile => {}
    }
    // The canned stub is attempted for any special method that survives
    // the filter; the full path is the fallback.
    let special_pattern = inliner.read().unwrap().pattern(method_idx);

    timings.new_split("MirOpt");
    {
        let inliner_guard = inliner.read().unwrap();
        let ctx = PassContext {
            dex_file,
            disable_opt: cu.disable_opt,
            verbose: cu.verbose,
            dump_passes: options.dump_passes,
            inliner: Some(&inliner_guard),
        };
        run_passes(&mut graph, &ctx);
    }

    if graph.punt_to_interpreter {
        log::debug!("{instruction_set}: punted method to interpreter: {pretty}");
        driver.counters().punted.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        return None;
    }

    timings.new_split("Mir2Lir");
    let result = materialize(driver, &cu, &graph, special_pattern, &mut timings);

    if options.debug_flags & DebugFlag::ShowMemoryUsage.bit() != 0 {
        if unit_arena.bytes_allocated() > 1024 * 1024 {
            log::info!("{pretty} {}", unit_arena.stats());
        }
        if arena_stack.peak_bytes() > 1024 * 1024 {
            log::info!("{pretty} arena stack peak {}", arena_stack.peak_bytes());
        }
    }

    timings.end();
    driver.add_timings(&timings);
    match &result {
        Some(_) => {
            if special_pattern.is_some() {
                driver
                    .counters()
                    .special_compiled
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
            driver.counters().compiled.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            log::debug!("{instruction_set}: compiled {pretty}");
        }
        None => {
            driver.counters().punted.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            log::debug!("{instruction_set}: deferred {pretty}");
        }
    }
    result
}

/// The hard filter: per-ISA unsupported opcodes and shorty characters.
fn can_compile_method(cu: &CompilationUnit, graph: &MirGraph) -> bool {
    let unsupported = isa::unsupported_opcodes(cu.instruction_set);
    let supported_types = isa::supported_shorty_types(cu.instruction_set);
    if unsupported.is_none() && supported_types.is_none() {
        return true;
    }
    if !can_compile_shorty(cu.shorty, supported_types) {
        log::debug!("unsupported shorty: {}", cu.shorty);
        return false;
    }
    for (_, mir) in graph.mirs.iter() {
        let Some(op) = mir.opcode.dex() else { continue };
        if unsupported.is_some_and(|list| list.contains(&op)) {
            log::debug!("unsupported dalvik byte code: {}", op.mnemonic());
            return false;
        }
        if op.is_invoke()
            && !matches!(
                op,
                insn::Opcode::InvokeVirtualQuick | insn::Opcode::InvokeVirtualRangeQuick
            )
        {
            let invoked = cu.dex_file.method_shorty(mir.dalvik.vb);
            if !can_compile_shorty(invoked, supported_types) {
                log::debug!("unsupported invoked shorty: {invoked}");
                return false;
            }
        }
    }
    true
}

fn can_compile_shorty(shorty: &str, supported_types: Option<&str>) -> bool {
    match supported_types {
        // All types available.
        None => true,
        Some(supported) => shorty.chars().all(|c| supported.contains(c)),
    }
}

/// Select the backend and run MIR→LIR→bytes. The dispatch happens once per
/// method; everything past this point is monomorphic.
fn materialize(
    driver: &CompilerDriver,
    cu: &CompilationUnit,
    graph: &MirGraph,
    special: Option<InlinePattern>,
    timings: &mut TimingLogger,
) -> Option<CompiledMethod> {
    match cu.instruction_set {
        #[cfg(feature = "arm64")]
        InstructionSet::Arm64 => {
            materialize_with::<isa::arm64::Arm64Target>(driver, cu, graph, special, timings)
        }
        #[cfg(feature = "arm")]
        InstructionSet::Thumb2 => {
            materialize_with::<isa::arm::ArmTarget>(driver, cu, graph, special, timings)
        }
        #[cfg(feature = "x86")]
        InstructionSet::X86 => {
            materialize_with::<isa::x86::X86_32Target>(driver, cu, graph, special, timings)
        }
        #[cfg(feature = "x86")]
        InstructionSet::X86_64 => {
            materialize_with::<isa::x86::X86_64Target>(driver, cu, graph, special, timings)
        }
        #[cfg(feature = "mips")]
        InstructionSet::Mips => {
            materialize_with::<isa::mips::MipsTarget>(driver, cu, graph, special, timings)
        }
        #[allow(unreachable_patterns)]
        _ => None,
    }
}

fn materialize_with<T: Target>(
    driver: &CompilerDriver,
    cu: &CompilationUnit,
    graph: &MirGraph,
    special: Option<InlinePattern>,
    timings: &mut TimingLogger,
) -> Option<CompiledMethod> {
    let target = T::new(cu.options.instruction_set_features);
    let mut cg = CodeGen::new(cu, graph, target);
    if !backend::compile_method_body(&mut cg, special) {
        return None;
    }
    if cg.first_lir.is_none() {
        return None;
    }

    timings.new_split("Assemble");
    assemble::assemble_lir(&mut cg);
    tables::create_mapping_tables(&mut cg);
    tables::create_native_gc_map(&mut cg);

    timings.new_split("Dedupe");
    tables::get_compiled_method(&mut cg, driver.storage())
}
