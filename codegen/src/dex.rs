//! Read-only views of DEX file data.
//!
//! The DEX loader and parser are external collaborators; the compiler core
//! consumes only the views defined here. Nothing in this module is mutated
//! by compilation.

use std::fmt;

/// Identifies a loaded dex file within the driver's registry.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct DexFileId(pub u32);

/// `(dex_file, method_idx)` key used throughout the compiler.
///
/// Ordering is by method index first and dex identity second so that the
/// artifact writer's deterministic output order falls out of a plain sort.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct MethodReference {
    pub dex_file: DexFileId,
    pub method_idx: u32,
}

impl MethodReference {
    pub fn new(dex_file: DexFileId, method_idx: u32) -> Self {
        Self { dex_file, method_idx }
    }
}

impl PartialOrd for MethodReference {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MethodReference {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.method_idx
            .cmp(&other.method_idx)
            .then(self.dex_file.cmp(&other.dex_file))
    }
}

/// Method identity within one dex file.
#[derive(Clone, Debug)]
pub struct MethodId {
    pub class_descriptor: String,
    pub name: String,
    /// Compact signature: return type first, then argument types, one
    /// character each (`I`, `J`, `F`, `D`, `L`, `Z`, `B`, `S`, `C`, `V`).
    pub shorty: String,
}

/// One loaded dex file, reduced to what the core reads.
pub struct DexFile {
    pub id: DexFileId,
    pub location: String,
    pub location_checksum: u32,
    method_ids: Vec<MethodId>,
}

impl DexFile {
    pub fn new(id: DexFileId, location: String, location_checksum: u32, method_ids: Vec<MethodId>) -> Self {
        Self { id, location, location_checksum, method_ids }
    }

    pub fn num_method_ids(&self) -> u32 {
        self.method_ids.len() as u32
    }

    pub fn method_id(&self, method_idx: u32) -> &MethodId {
        &self.method_ids[method_idx as usize]
    }

    pub fn method_shorty(&self, method_idx: u32) -> &str {
        &self.method_ids[method_idx as usize].shorty
    }

    /// Human-readable `Class.name(sig)` form for logging.
    pub fn pretty_method(&self, method_idx: u32) -> String {
        match self.method_ids.get(method_idx as usize) {
            Some(id) => format!("{}.{}:{}", id.class_descriptor, id.name, id.shorty),
            None => format!("<invalid-method-{method_idx}>"),
        }
    }
}

impl fmt::Debug for DexFile {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DexFile")
            .field("id", &self.id)
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

/// A catch handler: `type_idx` of `None` is a catch-all.
#[derive(Clone, Debug)]
pub struct CatchHandler {
    pub type_idx: Option<u32>,
    pub address: u32,
}

/// One entry of a code item's tries table.
#[derive(Clone, Debug)]
pub struct TryItem {
    pub start_addr: u32,
    pub insn_count: u16,
    pub handlers: Vec<CatchHandler>,
}

/// A method's code item. The core never mutates it.
#[derive(Clone, Debug, Default)]
pub struct CodeItem {
    pub registers_size: u16,
    pub ins_size: u16,
    pub outs_size: u16,
    /// 16-bit code units, including inline switch and array payloads.
    pub insns: Vec<u16>,
    pub tries: Vec<TryItem>,
}

impl CodeItem {
    pub fn insns_size_in_code_units(&self) -> u32 {
        self.insns.len() as u32
    }
}

/// Invocation kinds, mirroring the dex `invoke-*` family.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum InvokeType {
    Static,
    Direct,
    Virtual,
    Super,
    Interface,
}

impl fmt::Display for InvokeType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Static => "static",
            Self::Direct => "direct",
            Self::Virtual => "virtual",
            Self::Super => "super",
            Self::Interface => "interface",
        };
        f.write_str(name)
    }
}

/// Access flag bits the core inspects.
pub mod access_flags {
    pub const ACC_PUBLIC: u32 = 0x0001;
    pub const ACC_PRIVATE: u32 = 0x0002;
    pub const ACC_STATIC: u32 = 0x0008;
    pub const ACC_FINAL: u32 = 0x0010;
    pub const ACC_SYNCHRONIZED: u32 = 0x0020;
    pub const ACC_NATIVE: u32 = 0x0100;
    pub const ACC_ABSTRACT: u32 = 0x0400;
    pub const ACC_CONSTRUCTOR: u32 = 0x0001_0000;
}

/// Number of 32-bit vreg slots a shorty character occupies as an argument.
pub fn shorty_arg_width(c: u8) -> u32 {
    match c {
        b'J' | b'D' => 2,
        _ => 1,
    }
}

/// True if the shorty character names a reference type.
pub fn shorty_is_ref(c: u8) -> bool {
    c == b'L'
}

/// True if the shorty character names a floating-point type.
pub fn shorty_is_fp(c: u8) -> bool {
    c == b'F' || c == b'D'
}

/// True if the shorty character names a 64-bit type.
pub fn shorty_is_wide(c: u8) -> bool {
    c == b'J' || c == b'D'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_reference_orders_by_index_first() {
        let a = MethodReference::new(DexFileId(7), 1);
        let b = MethodReference::new(DexFileId(0), 2);
        assert!(a < b);
        let c = MethodReference::new(DexFileId(0), 1);
        assert!(c < a);
    }

    #[test]
    fn shorty_classification() {
        assert_eq!(shorty_arg_width(b'J'), 2);
        assert_eq!(shorty_arg_width(b'L'), 1);
        assert!(shorty_is_ref(b'L'));
        assert!(shorty_is_fp(b'D'));
        assert!(shorty_is_wide(b'D'));
        assert!(!shorty_is_wide(b'F'));
    }
}
