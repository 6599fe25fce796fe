//! End-to-end compilation scenarios over synthetic code items.

use std::sync::Arc;

use quickdex_codegen::backend::tables::{MappingTable, NativeGcMap};
use quickdex_codegen::compiled::LinkerPatch;
use quickdex_codegen::dex::{
    access_flags, CodeItem, DexFile, DexFileId, InvokeType, MethodId, MethodReference,
};
use quickdex_codegen::driver::{CompilerDriver, MethodToCompile};
use quickdex_codegen::insn::PACKED_SWITCH_SIGNATURE;
use quickdex_codegen::linker::{ClassLinker, FieldInfo, MethodInfo};
use quickdex_codegen::options::{CompilerFilter, CompilerOptions, InstructionSet};
use quickdex_codegen::storage::CompiledMethodStorage;
use quickdex_codegen::verified::{DexGcMap, VerifiedMethod};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn method_id(name: &str, shorty: &str) -> MethodId {
    MethodId {
        class_descriptor: "LMain;".to_string(),
        name: name.to_string(),
        shorty: shorty.to_string(),
    }
}

fn test_dex() -> DexFile {
    DexFile::new(
        DexFileId(0),
        "core.dex".to_string(),
        0x1234_5678,
        vec![
            method_id("identity", "II"),
            method_id("foo", "V"),
            method_id("bar", "V"),
            method_id("toString", "L"),
            method_id("switcher", "II"),
            method_id("add", "III"),
        ],
    )
}

fn options_for(isa: InstructionSet) -> CompilerOptions {
    CompilerOptions {
        compiler_filter: CompilerFilter::Speed,
        instruction_set: isa,
        include_patch_information: true,
        ..Default::default()
    }
}

fn driver_for(isa: InstructionSet) -> CompilerDriver {
    CompilerDriver::new(options_for(isa), Arc::new(quickdex_codegen::linker::NullClassLinker))
}

fn method<'a>(
    dex: &'a DexFile,
    item: &'a CodeItem,
    method_idx: u32,
    flags: u32,
) -> MethodToCompile<'a> {
    MethodToCompile {
        dex_file: dex,
        code_item: item,
        access_flags: flags,
        invoke_type: InvokeType::Virtual,
        class_def_idx: 0,
        method_idx,
    }
}

/// `int identity(int x) { return x; }` — compiles to the canned
/// return-argument stub: no frame, no spills, no safepoints.
#[test]
fn tiny_leaf_method_compiles_to_special_stub() {
    init_logging();
    let dex = test_dex();
    let item = CodeItem {
        registers_size: 2,
        ins_size: 2,
        outs_size: 0,
        // return v1 (v0 = this, v1 = x)
        insns: vec![0x010f],
        tries: vec![],
    };
    let driver = driver_for(InstructionSet::Arm64);
    driver.analyze_method_for_inlining(&dex, 0, access_flags::ACC_PUBLIC, &item);
    let compiled = driver.compile_method(&method(&dex, &item, 0, access_flags::ACC_PUBLIC));
    let compiled = compiled.expect("tiny leaf must compile");
    assert!(compiled.code_size() >= 4);
    assert_eq!(compiled.code_size() % InstructionSet::Arm64.code_alignment(), 0);
    assert_eq!(compiled.frame_size_in_bytes, 0);
    assert_eq!(compiled.core_spill_mask, 0);
    assert_eq!(compiled.fp_spill_mask, 0);
    let mapping = MappingTable::new(&compiled.mapping_table);
    assert_eq!(mapping.pc_to_dex_size(), 0);
    assert!(NativeGcMap::new(&compiled.gc_map).entries().is_empty());
}

/// A huge branchless method is rejected by the filter and counted.
#[test]
fn huge_method_is_skipped() {
    init_logging();
    let dex = test_dex();
    let mut insns = vec![0x0000u16; 20_000];
    insns.push(0x000e);
    let item =
        CodeItem { registers_size: 1, ins_size: 1, outs_size: 0, insns, tries: vec![] };
    let driver = driver_for(InstructionSet::Arm64);
    let result = driver.compile_method(&method(&dex, &item, 1, access_flags::ACC_PUBLIC));
    assert!(result.is_none());
    assert_eq!(driver.counters().skipped.load(std::sync::atomic::Ordering::Relaxed), 1);
}

/// A devirtualized virtual invoke dispatches directly: the compiled
/// method carries a method-pointer patch for the proven target and no
/// vtable access.
#[test]
fn devirtualized_invoke_uses_direct_dispatch() {
    init_logging();
    let dex = test_dex();
    let item = CodeItem {
        registers_size: 1,
        ins_size: 1,
        outs_size: 1,
        // invoke-virtual {v0}, method@3 (toString); return-void
        insns: vec![0x106e, 0x0003, 0x0000, 0x000e],
        tries: vec![],
    };
    let driver = driver_for(InstructionSet::Arm64);
    let devirt_target = MethodReference::new(dex.id, 0);
    let mut devirt = rustc_hash::FxHashMap::default();
    devirt.insert(0u32, devirt_target);
    driver.verification_results().add_verified_method(
        MethodReference::new(dex.id, 1),
        VerifiedMethod::new(devirt, vec![], DexGcMap::default()),
    );
    let compiled = driver
        .compile_method(&method(&dex, &item, 1, access_flags::ACC_PUBLIC))
        .expect("must compile");
    let has_method_patch = compiled
        .patches
        .iter()
        .any(|p| matches!(p, LinkerPatch::Method { target, .. } if *target == devirt_target));
    assert!(has_method_patch, "direct dispatch loads the devirt target: {:?}", compiled.patches);
    // Patches are sealed in literal-offset order.
    let offsets: Vec<u32> = compiled.patches.iter().map(|p| p.literal_offset()).collect();
    let mut sorted = offsets.clone();
    sorted.sort_unstable();
    assert_eq!(offsets, sorted);
}

/// A packed switch with 100 dense cases emits a 100-entry displacement
/// table into the method's trailing data.
#[test]
fn packed_switch_with_100_cases_emits_table() {
    init_logging();
    let dex = test_dex();
    const CASES: u16 = 100;
    // 0: packed-switch v1, +payload ; 3: return-void (default) ;
    // 4..104: one return-void per case ; payload after.
    let mut insns: Vec<u16> = vec![0x012b, 0, 0, 0x000e];
    for _ in 0..CASES {
        insns.push(0x000e);
    }
    let payload_pc = insns.len() as u16;
    insns[1] = payload_pc;
    insns.push(PACKED_SWITCH_SIGNATURE);
    insns.push(CASES);
    insns.push(0); // first_key lo
    insns.push(0); // first_key hi
    for case in 0..CASES {
        let target = 4 + case; // dex pc of the case body
        insns.push(target);
        insns.push(0);
    }
    let item = CodeItem {
        registers_size: 2,
        ins_size: 2,
        outs_size: 0,
        insns,
        tries: vec![],
    };
    let driver = driver_for(InstructionSet::Arm64);
    let compiled = driver
        .compile_method(&method(&dex, &item, 4, access_flags::ACC_PUBLIC))
        .expect("switch method must compile");
    // The data section holds at least 100 x 4 bytes of table.
    assert!(
        compiled.code_size() > u32::from(CASES) * 4,
        "code {} bytes cannot contain the table",
        compiled.code_size()
    );
}

/// Reference liveness at safepoints: after the first allocation only v0
/// holds a reference; after the second both do.
#[test]
fn gc_map_tracks_reference_births() {
    init_logging();
    let dex = test_dex();
    let item = CodeItem {
        registers_size: 2,
        ins_size: 0,
        outs_size: 0,
        insns: vec![
            0x0022, 0x0000, // 0: new-instance v0, type@0
            0x0071, 0x0001, 0x0000, // 2: invoke-static {}, foo
            0x0122, 0x0000, // 5: new-instance v1, type@0
            0x0071, 0x0002, 0x0000, // 7: invoke-static {}, bar
            0x000e, // 10: return-void
        ],
        tries: vec![],
    };
    let driver = driver_for(InstructionSet::Arm64);
    let compiled = driver
        .compile_method(&method(&dex, &item, 1, access_flags::ACC_STATIC))
        .expect("must compile");
    let gc_map = NativeGcMap::new(&compiled.gc_map);
    assert!(gc_map.entries().len() >= 2, "expected safepoints for both invokes");
    // Safepoint PCs are strictly increasing by construction of the map.
    let pcs: Vec<u32> = gc_map.entries().iter().map(|&(pc, _)| pc).collect();
    let mut sorted = pcs.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(pcs, sorted);
    // The last safepoint sees both references.
    let (_, last_bits) = gc_map.entries().last().unwrap();
    assert!(last_bits[0] & 0b01 != 0, "v0 live at final safepoint");
    assert!(last_bits[0] & 0b10 != 0, "v1 live at final safepoint");
}

/// Compiling the same body twice returns interned storage.
#[test]
fn dedup_is_idempotent() {
    init_logging();
    let dex = test_dex();
    let item = CodeItem {
        registers_size: 2,
        ins_size: 2,
        outs_size: 0,
        insns: vec![0x1012, 0x000f], // const/4 v0, #1 ; return v0
        tries: vec![],
    };
    let driver = driver_for(InstructionSet::Arm64);
    let a = driver
        .compile_method(&method(&dex, &item, 0, access_flags::ACC_PUBLIC))
        .expect("must compile");
    let b = driver
        .compile_method(&method(&dex, &item, 0, access_flags::ACC_PUBLIC))
        .expect("must compile");
    assert_eq!(&a.code[..], &b.code[..]);
    assert!(CompiledMethodStorage::is_fully_shared(&a, &b));
}

/// Every enabled backend compiles a small arithmetic method to aligned,
/// non-empty code.
#[test]
fn all_backends_compile_arithmetic() {
    init_logging();
    let dex = test_dex();
    let item = CodeItem {
        registers_size: 4,
        ins_size: 3,
        outs_size: 0,
        // add-int v0, v2, v3 ; return v0   (v1 = this, v2/v3 = args)
        insns: vec![0x0090, 0x0302, 0x000f],
        tries: vec![],
    };
    for isa in [
        InstructionSet::Arm64,
        InstructionSet::Thumb2,
        InstructionSet::X86,
        InstructionSet::X86_64,
        InstructionSet::Mips,
    ] {
        let driver = driver_for(isa);
        let compiled = driver
            .compile_method(&method(&dex, &item, 5, access_flags::ACC_PUBLIC))
            .unwrap_or_else(|| panic!("{isa} failed to compile"));
        assert!(compiled.code_size() > 0, "{isa} emitted no code");
        assert_eq!(
            compiled.code_size() % isa.code_alignment(),
            0,
            "{isa} code not aligned"
        );
    }
}

/// Unresolved field accesses lower to runtime calls rather than failing.
#[test]
fn unresolved_field_takes_slow_path() {
    init_logging();
    let dex = test_dex();
    let item = CodeItem {
        registers_size: 2,
        ins_size: 1,
        outs_size: 0,
        // iget v0, v1, field@9 ; return v0
        insns: vec![0x1052, 0x0009, 0x000f],
        tries: vec![],
    };
    let driver = driver_for(InstructionSet::Arm64);
    let compiled = driver.compile_method(&method(&dex, &item, 0, access_flags::ACC_PUBLIC));
    assert!(compiled.is_some(), "unresolved fields are non-fatal");
}

struct ResolvingLinker;

impl ClassLinker for ResolvingLinker {
    fn resolve_field(&self, _: &DexFile, field_idx: u32, _: bool) -> Option<FieldInfo> {
        Some(FieldInfo {
            field_offset: 8 + field_idx * 4,
            is_volatile: false,
            storage_index: 7,
            is_referrers_class: false,
            is_class_initialized: true,
        })
    }

    fn resolve_method(&self, dex: &DexFile, method_idx: u32, ty: InvokeType) -> Option<MethodInfo> {
        Some(MethodInfo {
            target: MethodReference::new(dex.id, method_idx),
            sharp_type: ty,
            vtable_index: 5,
            direct_code: 0,
            direct_method: 0,
            needs_class_initialization: false,
        })
    }
}

/// A resolved virtual invoke goes through the embedded vtable and still
/// records a safepoint at the call.
#[test]
fn resolved_virtual_invoke_has_safepoint() {
    init_logging();
    let dex = test_dex();
    let item = CodeItem {
        registers_size: 1,
        ins_size: 1,
        outs_size: 1,
        insns: vec![0x106e, 0x0003, 0x0000, 0x000e],
        tries: vec![],
    };
    let driver = CompilerDriver::new(options_for(InstructionSet::Arm64), Arc::new(ResolvingLinker));
    let compiled = driver
        .compile_method(&method(&dex, &item, 1, access_flags::ACC_PUBLIC))
        .expect("must compile");
    let mapping = MappingTable::new(&compiled.mapping_table);
    assert!(mapping.pc_to_dex_size() >= 1, "the call must be a safepoint");
    let entries: Vec<(u32, u32)> = mapping.pc_to_dex_entries().collect();
    assert!(entries.iter().any(|&(_, dex_pc)| dex_pc == 0));
}

/// Catch handlers export their native PCs in the dex→pc sub-table.
#[test]
fn catch_handler_exports_native_pc() {
    init_logging();
    let dex = test_dex();
    let item = CodeItem {
        registers_size: 1,
        ins_size: 0,
        outs_size: 0,
        insns: vec![
            0x0071, 0x0001, 0x0000, // 0: invoke-static {}, foo (in try)
            0x000e, // 3: return-void
            0x000d, // 4: move-exception v0 (handler)
            0x000e, // 5: return-void
        ],
        tries: vec![crate_try(0, 3, 4)],
    };
    let driver = driver_for(InstructionSet::Arm64);
    let compiled = driver
        .compile_method(&method(&dex, &item, 1, access_flags::ACC_STATIC))
        .expect("must compile");
    let mapping = MappingTable::new(&compiled.mapping_table);
    let dex2pc: Vec<(u32, u32)> = mapping.dex_to_pc_entries().collect();
    assert!(
        dex2pc.iter().any(|&(_, dex_pc)| dex_pc == 4),
        "handler at dex pc 4 must have a native entry: {dex2pc:?}"
    );
}

fn crate_try(start: u32, count: u16, handler: u32) -> quickdex_codegen::dex::TryItem {
    quickdex_codegen::dex::TryItem {
        start_addr: start,
        insn_count: count,
        handlers: vec![quickdex_codegen::dex::CatchHandler { type_idx: None, address: handler }],
    }
}
