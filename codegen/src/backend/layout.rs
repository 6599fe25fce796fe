//! Runtime ABI constants: object layout offsets, thread-local offsets and
//! the slow-path trampoline table.
//!
//! These mirror the runtime the generated code links against. Offsets that
//! depend on pointer width take it as a parameter.

/// `Object` field offsets.
pub const OBJECT_CLASS_OFFSET: i32 = 0;
pub const OBJECT_LOCK_WORD_OFFSET: i32 = 4;

/// `Array` layout.
pub const ARRAY_LENGTH_OFFSET: i32 = 8;

/// Offset of array element storage for a given element size.
pub fn array_data_offset(element_size: u32) -> i32 {
    // 8-byte elements are aligned out to 16.
    if element_size == 8 { 16 } else { 12 }
}

/// `Class` layout.
pub const CLASS_STATUS_OFFSET: i32 = 112;
pub const CLASS_STATUS_INITIALIZED: i32 = 10;
/// Start of the embedded interface method table inside a `Class`.
pub const CLASS_EMBEDDED_IMTABLE_OFFSET: i32 = 120;
/// Interface method table size, entries.
pub const IMT_SIZE: u32 = 64;

/// The embedded vtable follows the fixed-size interface table.
pub fn embedded_vtable_entry_offset(index: u32, ptr_size: u32) -> i32 {
    CLASS_EMBEDDED_IMTABLE_OFFSET + ((IMT_SIZE + index) * ptr_size) as i32
}

pub fn embedded_imtable_entry_offset(index: u32, ptr_size: u32) -> i32 {
    CLASS_EMBEDDED_IMTABLE_OFFSET + ((index % IMT_SIZE) * ptr_size) as i32
}

/// `ArtMethod` entry point for quick-compiled code.
pub fn method_quick_code_offset(ptr_size: u32) -> i32 {
    (4 * 4 + 4 * ptr_size) as i32
}

/// Thread-local offsets, from the thread register.
pub fn thread_flags_offset() -> i32 {
    0
}

pub fn thread_card_table_offset(ptr_size: u32) -> i32 {
    (2 * ptr_size) as i32
}

pub fn thread_exception_offset(ptr_size: u32) -> i32 {
    (3 * ptr_size) as i32
}

pub fn thread_suspend_trigger_offset(ptr_size: u32) -> i32 {
    (4 * ptr_size) as i32
}

/// GC card table granularity: one card byte per 2^7 heap bytes.
pub const CARD_SHIFT: i32 = 7;

/// Thread-id field, compared against thin-lock owners.
pub const THREAD_ID_OFFSET: i32 = 8;

/// Lock-word bits reserved for the read-barrier state; the thin-lock fast
/// paths must preserve them.
pub const LOCK_WORD_READ_BARRIER_MASK: i32 = 0x3000_0000;

/// Stack-overflow reserved bytes, probed by the explicit entry check.
pub const STACK_OVERFLOW_RESERVED_BYTES: i32 = 8 * 1024;

/// Runtime slow-path entry points reachable through the thread register.
///
/// The enum order defines the entrypoint table layout; adding an entry is
/// an ABI change.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum Trampoline {
    AllocObject,
    AllocObjectWithAccessCheck,
    AllocArray,
    AllocArrayWithAccessCheck,
    CheckAndAllocArray,
    InstanceofNonTrivial,
    CheckCast,
    InitializeStaticStorage,
    InitializeType,
    InitializeTypeAndVerifyAccess,
    ResolveString,
    Set8Static,
    Set16Static,
    Set32Static,
    Set64Static,
    SetObjStatic,
    Get32Static,
    Get64Static,
    GetObjStatic,
    Set8Instance,
    Set16Instance,
    Set32Instance,
    Set64Instance,
    SetObjInstance,
    Get32Instance,
    Get64Instance,
    GetObjInstance,
    HandleFillArrayData,
    LockObject,
    UnlockObject,
    Idivmod,
    Lmul,
    Ldiv,
    Lmod,
    Shl,
    Shr,
    Ushr,
    F2l,
    D2l,
    L2f,
    L2d,
    Fmod,
    Dmod,
    DeliverException,
    ThrowArrayBounds,
    ThrowDivZero,
    ThrowNullPointer,
    ThrowStackOverflow,
    TestSuspend,
    InvokeStaticTrampolineWithAccessCheck,
    InvokeDirectTrampolineWithAccessCheck,
    InvokeSuperTrampolineWithAccessCheck,
    InvokeVirtualTrampolineWithAccessCheck,
    InvokeInterfaceTrampolineWithAccessCheck,
    Memcpy,
}

/// First entrypoint's offset from the thread register.
const QUICK_ENTRYPOINT_BASE: u32 = 0x100;

/// Thread-relative offset of a trampoline's entry point.
pub fn trampoline_offset(trampoline: Trampoline, ptr_size: u32) -> i32 {
    (QUICK_ENTRYPOINT_BASE + trampoline as u32 * ptr_size) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trampoline_offsets_are_distinct_and_increasing() {
        let a = trampoline_offset(Trampoline::AllocObject, 8);
        let b = trampoline_offset(Trampoline::LockObject, 8);
        let c = trampoline_offset(Trampoline::Memcpy, 8);
        assert!(a < b && b < c);
    }

    #[test]
    fn array_data_alignment() {
        assert_eq!(array_data_offset(4), 12);
        assert_eq!(array_data_offset(8), 16);
    }
}
