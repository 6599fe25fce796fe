//! The compilation driver: shared state and method-level fan-out.
//!
//! Compilation is embarrassingly parallel at method granularity. Each
//! worker runs a method's entire pipeline on its own thread; the shared
//! state is the read-only configuration, the verification results, the
//! lazily built inliner maps, the dedup storage, and a handful of atomic
//! counters. A watchdog aborts the process if a batch wedges.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rayon::prelude::*;

use crate::arena::ArenaPool;
use crate::compiled::CompiledMethod;
use crate::dex::{CodeItem, DexFile, InvokeType, MethodReference};
use crate::inliner::{self, DexFileToMethodInlinerMap};
use crate::linker::ClassLinker;
use crate::options::CompilerOptions;
use crate::storage::CompiledMethodStorage;
use crate::timing::{CumulativeTimings, TimingLogger};
use crate::verified::VerificationResults;

/// A method handed to [`CompilerDriver::compile_all`].
pub struct MethodToCompile<'a> {
    pub dex_file: &'a DexFile,
    pub code_item: &'a CodeItem,
    pub access_flags: u32,
    pub invoke_type: InvokeType,
    pub class_def_idx: u16,
    pub method_idx: u32,
}

/// Driver-wide counters, updated with relaxed atomics and reported when
/// `dump_stats` is set.
#[derive(Default)]
pub struct Counters {
    pub compiled: AtomicU64,
    pub special_compiled: AtomicU64,
    pub skipped: AtomicU64,
    pub punted: AtomicU64,
}

/// No single method may take longer than this; exceeding it is treated as
/// a compiler hang and aborts the process.
const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(300);

pub struct CompilerDriver {
    options: CompilerOptions,
    class_linker: Arc<dyn ClassLinker>,
    verification_results: VerificationResults,
    inliner_map: DexFileToMethodInlinerMap,
    storage: CompiledMethodStorage,
    arena_pool: ArenaPool,
    counters: Counters,
    timings: Mutex<CumulativeTimings>,
}

impl CompilerDriver {
    pub fn new(options: CompilerOptions, class_linker: Arc<dyn ClassLinker>) -> Self {
        // JIT embedders disable dedup; AOT keeps it on.
        let storage = CompiledMethodStorage::new(true);
        Self {
            options,
            class_linker,
            verification_results: VerificationResults::new(),
            inliner_map: DexFileToMethodInlinerMap::new(),
            storage,
            arena_pool: ArenaPool::new(),
            counters: Counters::default(),
            timings: Mutex::new(CumulativeTimings::default()),
        }
    }

    pub fn with_storage(
        options: CompilerOptions,
        class_linker: Arc<dyn ClassLinker>,
        storage: CompiledMethodStorage,
    ) -> Self {
        Self { storage, ..Self::new(options, class_linker) }
    }

    pub fn options(&self) -> &CompilerOptions {
        &self.options
    }

    pub fn linker(&self) -> &dyn ClassLinker {
        self.class_linker.as_ref()
    }

    pub fn verification_results(&self) -> &VerificationResults {
        &self.verification_results
    }

    pub fn inliner_map(&self) -> &DexFileToMethodInlinerMap {
        &self.inliner_map
    }

    pub fn storage(&self) -> &CompiledMethodStorage {
        &self.storage
    }

    pub fn arena_pool(&self) -> &ArenaPool {
        &self.arena_pool
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn add_timings(&self, logger: &TimingLogger) {
        if self.options.dump_passes {
            self.timings.lock().unwrap().add_logger(logger);
        }
    }

    /// Record a special-pattern analysis for a method, making it eligible
    /// for the canned stub and for call-site inlining. Run while methods
    /// are registered, before compilation begins.
    pub fn analyze_method_for_inlining(
        &self,
        dex_file: &DexFile,
        method_idx: u32,
        access_flags: u32,
        code_item: &CodeItem,
    ) {
        if code_item.insns.len() > self.options.inline_max_code_units {
            return;
        }
        let inliner = self.inliner_map.get_method_inliner(dex_file);
        let mut inliner = inliner.write().unwrap();
        inliner::analyze_method(
            &mut inliner,
            dex_file,
            self.linker(),
            method_idx,
            access_flags,
            code_item,
        );
    }

    /// Compile one method through the core pipeline.
    pub fn compile_method(&self, method: &MethodToCompile) -> Option<CompiledMethod> {
        crate::compile_method(
            self,
            method.code_item,
            method.access_flags,
            method.invoke_type,
            method.class_def_idx,
            method.method_idx,
            method.dex_file,
        )
    }

    /// Compile a batch in parallel. The output is sorted by
    /// `(method_idx, dex_file)` so artifact writers see a deterministic
    /// order regardless of scheduling.
    pub fn compile_all<'a>(
        &self,
        methods: &[MethodToCompile<'a>],
    ) -> Vec<(MethodReference, Option<CompiledMethod>)> {
        let done = Arc::new(AtomicBool::new(false));
        let watchdog = {
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                let start = std::time::Instant::now();
                while !done.load(Ordering::Acquire) {
                    if start.elapsed() > WATCHDOG_TIMEOUT {
                        log::error!("compilation watchdog expired; aborting");
                        std::process::abort();
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
            })
        };

        let mut results: Vec<(MethodReference, Option<CompiledMethod>)> = methods
            .par_iter()
            .map(|method| {
                let reference =
                    MethodReference::new(method.dex_file.id, method.method_idx);
                (reference, self.compile_method(method))
            })
            .collect();
        results.sort_by_key(|&(reference, _)| reference);

        done.store(true, Ordering::Release);
        let _ = watchdog.join();

        if self.options.dump_stats {
            self.dump_stats();
        }
        if self.options.dump_passes {
            self.timings.lock().unwrap().dump();
        }
        results
    }

    pub fn dump_stats(&self) {
        log::info!(
            "compiled {} ({} special stubs), skipped {}, punted {}",
            self.counters.compiled.load(Ordering::Relaxed),
            self.counters.special_compiled.load(Ordering::Relaxed),
            self.counters.skipped.load(Ordering::Relaxed),
            self.counters.punted.load(Ordering::Relaxed),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::DexFileId;
    use crate::linker::NullClassLinker;
    use crate::options::CompilerFilter;

    fn driver(filter: CompilerFilter) -> CompilerDriver {
        let options = CompilerOptions { compiler_filter: filter, ..Default::default() };
        CompilerDriver::new(options, Arc::new(NullClassLinker))
    }

    fn dex() -> DexFile {
        DexFile::new(
            DexFileId(0),
            "test.dex".into(),
            0xdead_beef,
            vec![crate::dex::MethodId {
                class_descriptor: "LMain;".into(),
                name: "foo".into(),
                shorty: "V".into(),
            }],
        )
    }

    #[test]
    fn interpret_only_compiles_nothing() {
        let driver = driver(CompilerFilter::InterpretOnly);
        let dex = dex();
        let item = CodeItem {
            registers_size: 1,
            ins_size: 1,
            outs_size: 0,
            insns: vec![0x000e],
            tries: vec![],
        };
        let method = MethodToCompile {
            dex_file: &dex,
            code_item: &item,
            access_flags: crate::dex::access_flags::ACC_PUBLIC,
            invoke_type: InvokeType::Virtual,
            class_def_idx: 0,
            method_idx: 0,
        };
        assert!(driver.compile_method(&method).is_none());
    }

    #[test]
    fn results_are_sorted_deterministically() {
        let driver = driver(CompilerFilter::InterpretOnly);
        let dex_a = DexFile::new(DexFileId(1), "a.dex".into(), 0, vec![
            crate::dex::MethodId {
                class_descriptor: "LA;".into(),
                name: "m".into(),
                shorty: "V".into(),
            },
            crate::dex::MethodId {
                class_descriptor: "LA;".into(),
                name: "n".into(),
                shorty: "V".into(),
            },
        ]);
        let item = CodeItem {
            registers_size: 1,
            ins_size: 1,
            outs_size: 0,
            insns: vec![0x000e],
            tries: vec![],
        };
        let mk = |idx| MethodToCompile {
            dex_file: &dex_a,
            code_item: &item,
            access_flags: 0,
            invoke_type: InvokeType::Virtual,
            class_def_idx: 0,
            method_idx: idx,
        };
        let methods = [mk(1), mk(0)];
        let results = driver.compile_all(&methods);
        assert_eq!(results[0].0.method_idx, 0);
        assert_eq!(results[1].0.method_idx, 1);
    }
}
