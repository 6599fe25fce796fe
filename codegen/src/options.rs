//! Read-only compiler configuration.
//!
//! A single `CompilerOptions` instance is shared by every compilation
//! thread. The filter thresholds live here and only here; the method filter
//! reads them through the driver's handle.

use crate::error::{CompileError, CompileResult};

/// Which methods to compile, from "none" to "all of them".
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CompilerFilter {
    /// Skip verification and compile nothing.
    VerifyNone,
    /// Compile nothing; everything runs under the interpreter.
    InterpretOnly,
    /// Maximize space savings.
    Space,
    /// Best performance return on compilation investment.
    Balanced,
    /// Maximize runtime performance.
    Speed,
    /// Compile on a time budget.
    Time,
    /// Force compilation of everything except class initializers.
    Everything,
}

impl CompilerFilter {
    pub fn is_compilation_enabled(self) -> bool {
        !matches!(self, Self::VerifyNone | Self::InterpretOnly)
    }

    pub fn is_verification_enabled(self) -> bool {
        self != Self::VerifyNone
    }
}

/// Target instruction sets.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum InstructionSet {
    /// ARMv7 with the Thumb2 encoding. Plain `Arm` requests are promoted to
    /// this by the driver.
    Thumb2,
    Arm64,
    X86,
    X86_64,
    Mips,
}

impl InstructionSet {
    pub fn is_64bit(self) -> bool {
        matches!(self, Self::Arm64 | Self::X86_64)
    }

    pub fn pointer_size(self) -> u32 {
        if self.is_64bit() { 8 } else { 4 }
    }

    /// Natural alignment of code for this ISA.
    pub fn code_alignment(self) -> u32 {
        match self {
            Self::Thumb2 => 2,
            Self::X86 | Self::X86_64 => 16,
            Self::Arm64 | Self::Mips => 4,
        }
    }

    /// Bytes per spilled GPR in the frame.
    pub fn gpr_spill_size(self) -> u32 {
        self.pointer_size()
    }

    /// Bytes per spilled FP register in the frame.
    pub fn fpr_spill_size(self) -> u32 {
        match self {
            // D-registers spill as 64 bits even in 32-bit mode.
            Self::Thumb2 | Self::Arm64 | Self::X86_64 => 8,
            Self::X86 | Self::Mips => 4,
        }
    }

    pub fn stack_alignment(self) -> u32 {
        16
    }
}

impl std::fmt::Display for InstructionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            Self::Thumb2 => "thumb2",
            Self::Arm64 => "arm64",
            Self::X86 => "x86",
            Self::X86_64 => "x86-64",
            Self::Mips => "mips",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for InstructionSet {
    type Err = CompileError;

    fn from_str(s: &str) -> CompileResult<Self> {
        match s {
            "arm" | "thumb2" => Ok(Self::Thumb2),
            "arm64" | "aarch64" => Ok(Self::Arm64),
            "x86" => Ok(Self::X86),
            "x86-64" | "x86_64" => Ok(Self::X86_64),
            "mips" => Ok(Self::Mips),
            _ => Err(CompileError::UnsupportedIsa),
        }
    }
}

/// Optional hardware features, a bit per feature.
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
pub struct InstructionSetFeatures(u32);

impl InstructionSetFeatures {
    pub const HW_DIV: u32 = 1 << 0;
    pub const LPAE: u32 = 1 << 1;
    pub const ARMV8_CRC: u32 = 1 << 2;
    pub const SSE4_1: u32 = 1 << 3;
    pub const SSE4_2: u32 = 1 << 4;
    pub const AVX: u32 = 1 << 5;

    pub fn new(bits: u32) -> Self {
        Self(bits)
    }

    pub fn has(self, bit: u32) -> bool {
        self.0 & bit != 0
    }
}

/// Optimization passes that can be disabled, one bit per pass.
///
/// The bit positions are public because the per-ISA disable masks and the
/// default mask are expressed in terms of them.
#[derive(Copy, Clone, Debug)]
#[repr(u32)]
pub enum Optimization {
    LoadStoreElimination = 0,
    LoadHoisting,
    SuppressLoads,
    NullCheckElimination,
    ClassInitCheckElimination,
    GlobalValueNumbering,
    PromoteRegs,
    TrackLiveTemps,
    SafeOptimizations,
    BasicBlockOpt,
    Match,
    PromoteCompilerTemps,
    BranchFusing,
    SuppressExceptionEdges,
    SuppressMethodInlining,
}

impl Optimization {
    pub fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

/// Default disabled optimizations. Load-store elimination and global value
/// numbering have known miscompiles on some shapes and default off.
pub const DEFAULT_DISABLED_OPTIMIZATIONS: u32 =
    (1 << Optimization::LoadStoreElimination as u32)
        | (1 << Optimization::GlobalValueNumbering as u32);

/// Additional disabled optimizations per instruction set, beyond the
/// defaults.
pub fn disabled_optimizations_for_isa(isa: InstructionSet) -> u32 {
    match isa {
        InstructionSet::Arm64 | InstructionSet::Thumb2 => 0,
        InstructionSet::X86 | InstructionSet::X86_64 => {
            Optimization::LoadStoreElimination.bit()
        }
        InstructionSet::Mips => {
            Optimization::LoadStoreElimination.bit()
                | Optimization::LoadHoisting.bit()
                | Optimization::SuppressLoads.bit()
                | Optimization::NullCheckElimination.bit()
                | Optimization::PromoteRegs.bit()
                | Optimization::TrackLiveTemps.bit()
                | Optimization::SafeOptimizations.bit()
                | Optimization::BasicBlockOpt.bit()
                | Optimization::Match.bit()
                | Optimization::PromoteCompilerTemps.bit()
        }
    }
}

/// Debug and instrumentation toggles, one bit each.
#[derive(Copy, Clone, Debug)]
#[repr(u32)]
pub enum DebugFlag {
    Verbose = 0,
    DumpCfg,
    SlowFieldPath,
    SlowInvokePath,
    SlowStringPath,
    ShowMemoryUsage,
    ShowNops,
    CountOpcodes,
    DumpCheckStats,
    ShowFilterStats,
    Timings,
    CodegenDump,
}

impl DebugFlag {
    pub fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

/// The recognized options. Construct with `CompilerOptions::default()` and
/// override fields; all effects are described in the field docs.
#[derive(Clone, Debug)]
pub struct CompilerOptions {
    pub compiler_filter: CompilerFilter,
    pub instruction_set: InstructionSet,
    pub instruction_set_features: InstructionSetFeatures,

    /// Method-size cutoffs, in dex instructions.
    pub huge_method_threshold: usize,
    pub large_method_threshold: usize,
    pub small_method_threshold: usize,
    pub tiny_method_threshold: usize,

    /// Caps for the special-pattern inliner.
    pub inline_depth_limit: usize,
    pub inline_max_code_units: usize,

    /// If false, the linker-patch list is dropped from compiled methods.
    pub include_patch_information: bool,
    /// If true, emit CFI fragments and source-map records.
    pub generate_debug_info: bool,
    /// Rely on SIGSEGV for null checks instead of explicit compares.
    pub implicit_null_checks: bool,
    /// Rely on a guard page for stack-overflow checks.
    pub implicit_stack_overflow_checks: bool,
    /// Test the thread suspend flag with a page poke instead of a compare.
    pub implicit_suspend_checks: bool,
    /// Force PC-relative addressing.
    pub compile_pic: bool,

    /// Reserved; carried for option-file compatibility, no core effect.
    pub top_k_profile_threshold: f64,

    /// Substring matches that enable per-method verbose logging.
    pub verbose_methods: Vec<String>,

    pub dump_passes: bool,
    pub dump_stats: bool,
    pub dump_cfg_file_name: Option<String>,

    /// Bits from [`Optimization`]; ORed with the per-ISA mask.
    pub disable_optimizations: u32,
    /// Bits from [`DebugFlag`].
    pub debug_flags: u32,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            compiler_filter: CompilerFilter::Speed,
            instruction_set: InstructionSet::Arm64,
            instruction_set_features: InstructionSetFeatures::default(),
            huge_method_threshold: 10000,
            large_method_threshold: 600,
            small_method_threshold: 60,
            tiny_method_threshold: 20,
            inline_depth_limit: 3,
            inline_max_code_units: 18,
            include_patch_information: false,
            generate_debug_info: false,
            implicit_null_checks: false,
            implicit_stack_overflow_checks: false,
            implicit_suspend_checks: false,
            compile_pic: false,
            top_k_profile_threshold: 90.0,
            verbose_methods: Vec::new(),
            dump_passes: false,
            dump_stats: false,
            dump_cfg_file_name: None,
            disable_optimizations: DEFAULT_DISABLED_OPTIMIZATIONS,
            debug_flags: 0,
        }
    }
}

impl CompilerOptions {
    pub fn is_huge_method(&self, num_dalvik_instructions: usize) -> bool {
        num_dalvik_instructions > self.huge_method_threshold
    }

    pub fn is_large_method(&self, num_dalvik_instructions: usize) -> bool {
        num_dalvik_instructions > self.large_method_threshold
    }

    pub fn is_small_method(&self, num_dalvik_instructions: usize) -> bool {
        num_dalvik_instructions > self.small_method_threshold
    }

    pub fn is_tiny_method(&self, num_dalvik_instructions: usize) -> bool {
        num_dalvik_instructions > self.tiny_method_threshold
    }

    /// True if `pretty_name` matches the verbose-method list. Logging only;
    /// never affects compilation decisions.
    pub fn is_verbose_method(&self, pretty_name: &str) -> bool {
        self.verbose_methods.iter().any(|m| pretty_name.contains(m))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_enables_compilation() {
        assert!(!CompilerFilter::VerifyNone.is_compilation_enabled());
        assert!(!CompilerFilter::InterpretOnly.is_compilation_enabled());
        assert!(CompilerFilter::Balanced.is_compilation_enabled());
        assert!(CompilerFilter::InterpretOnly.is_verification_enabled());
    }

    #[test]
    fn thresholds_are_strict_greater() {
        let options = CompilerOptions::default();
        assert!(!options.is_huge_method(10000));
        assert!(options.is_huge_method(10001));
        assert!(options.is_small_method(61));
    }

    #[test]
    fn mips_disables_most_passes() {
        let mask = disabled_optimizations_for_isa(InstructionSet::Mips);
        assert!(mask & Optimization::PromoteRegs.bit() != 0);
        assert!(mask & Optimization::NullCheckElimination.bit() != 0);
        assert_eq!(disabled_optimizations_for_isa(InstructionSet::Arm64), 0);
    }
}
