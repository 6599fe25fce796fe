//! The class-linker boundary.
//!
//! Field and method resolution happens in the runtime's class linker, an
//! external collaborator. Resolution failures are never fatal: unresolved
//! sites lower to slow-path runtime calls.

use crate::dex::{DexFile, InvokeType, MethodReference};

/// Resolution result for a field access site.
#[derive(Copy, Clone, Debug)]
pub struct FieldInfo {
    /// Byte offset of the field within the object or the class storage.
    pub field_offset: u32,
    pub is_volatile: bool,
    /// Static fields: index of the declaring class in the dex cache.
    pub storage_index: u32,
    /// Static fields: the declaring class is the compiled method's own
    /// class, so no initialization check is needed.
    pub is_referrers_class: bool,
    /// Static fields: the declaring class is verified initialized.
    pub is_class_initialized: bool,
}

/// Resolution result for an invoke site.
#[derive(Copy, Clone, Debug)]
pub struct MethodInfo {
    /// The resolved target after sharpening.
    pub target: MethodReference,
    /// Dispatch kind after sharpening: an `invoke-virtual` of a final
    /// method resolves to a direct dispatch.
    pub sharp_type: InvokeType,
    /// Vtable index for virtual and interface dispatch.
    pub vtable_index: u32,
    /// Known code address, or 0 when dispatch must go through the method.
    pub direct_code: u64,
    /// Known method pointer, or 0.
    pub direct_method: u64,
    /// Static invokes: the target's class needs an initialization check.
    pub needs_class_initialization: bool,
}

/// Runtime class-linker hooks the compiler calls during lowering-cache
/// population. Implementations must be thread-safe; every compilation
/// thread resolves through the same linker.
pub trait ClassLinker: Send + Sync {
    /// Resolve a field reference. `None` marks the site unresolved.
    fn resolve_field(&self, dex_file: &DexFile, field_idx: u32, is_static: bool)
        -> Option<FieldInfo>;

    /// Resolve a method reference. `None` marks the site unresolved.
    fn resolve_method(
        &self,
        dex_file: &DexFile,
        method_idx: u32,
        invoke_type: InvokeType,
    ) -> Option<MethodInfo>;
}

/// A linker that resolves nothing; every site takes the slow path. Useful
/// for tests and as the default when no runtime is attached.
pub struct NullClassLinker;

impl ClassLinker for NullClassLinker {
    fn resolve_field(&self, _: &DexFile, _: u32, _: bool) -> Option<FieldInfo> {
        None
    }

    fn resolve_method(&self, _: &DexFile, _: u32, _: InvokeType) -> Option<MethodInfo> {
        None
    }
}
