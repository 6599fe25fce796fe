//! Special-method pattern detection.
//!
//! A handful of trivially shaped methods (empty bodies, argument returns,
//! constant returns, single field getters and setters) are worth special
//! treatment twice over: invokes of them can be replaced inline by the
//! optimization passes, and the methods themselves compile to a canned stub
//! without a full frame.
//!
//! Patterns are detected per dex file on first touch and cached behind a
//! reader-writer lock; compilation threads only read.

use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;

use crate::dex::{access_flags, CodeItem, DexFile, DexFileId};
use crate::insn::{DecodedInsn, Opcode};
use crate::linker::{ClassLinker, FieldInfo};
use crate::mir::lowering::MemAccessType;

/// A recognized special-method shape.
#[derive(Copy, Clone, Debug)]
pub enum InlinePattern {
    /// `return-void` and nothing else.
    Empty,
    /// Returns one of the incoming arguments unchanged. `arg` is the
    /// argument's position in vreg widths (not counting `this`).
    ReturnArg { arg: u16, wide: bool, is_object: bool },
    /// Returns a constant.
    Const { value: i64, wide: bool },
    /// `return this.field`.
    IGet {
        field: FieldInfo,
        field_idx: u32,
        access_type: MemAccessType,
        /// Receiver argument position, always 0 for instance getters.
        object_arg: u16,
    },
    /// `this.field = arg; return-void`.
    IPut {
        field: FieldInfo,
        field_idx: u32,
        access_type: MemAccessType,
        object_arg: u16,
        src_arg: u16,
    },
}

impl InlinePattern {
    /// Patterns with side effects cannot be dropped when the call result
    /// is unused.
    pub fn has_side_effects(&self) -> bool {
        matches!(self, InlinePattern::IPut { .. })
    }
}

/// Per-dex-file map from method index to its detected pattern.
pub struct DexFileMethodInliner {
    special_methods: FxHashMap<u32, InlinePattern>,
}

impl DexFileMethodInliner {
    pub fn is_special(&self, method_idx: u32) -> bool {
        self.special_methods.contains_key(&method_idx)
    }

    pub fn pattern(&self, method_idx: u32) -> Option<InlinePattern> {
        self.special_methods.get(&method_idx).copied()
    }

    pub fn insert(&mut self, method_idx: u32, pattern: InlinePattern) {
        self.special_methods.insert(method_idx, pattern);
    }
}

/// Process-wide registry of per-dex inliners. Lazily constructed on first
/// use by each dex file; many readers, a writer only on first touch.
#[derive(Default)]
pub struct DexFileToMethodInlinerMap {
    inliners: RwLock<FxHashMap<DexFileId, Arc<RwLock<DexFileMethodInliner>>>>,
}

impl DexFileToMethodInlinerMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// The inliner for `dex_file`, creating an empty one on first touch.
    pub fn get_method_inliner(&self, dex_file: &DexFile) -> Arc<RwLock<DexFileMethodInliner>> {
        if let Some(inliner) = self.inliners.read().unwrap().get(&dex_file.id) {
            return Arc::clone(inliner);
        }
        let mut writer = self.inliners.write().unwrap();
        Arc::clone(writer.entry(dex_file.id).or_insert_with(|| {
            Arc::new(RwLock::new(DexFileMethodInliner {
                special_methods: FxHashMap::default(),
            }))
        }))
    }
}

/// Analyze one method's code item for a special pattern, recording it in
/// the dex file's inliner on success. Called while registering methods.
pub fn analyze_method(
    inliner: &mut DexFileMethodInliner,
    dex_file: &DexFile,
    linker: &dyn ClassLinker,
    method_idx: u32,
    access_flags: u32,
    code_item: &CodeItem,
) -> bool {
    // Native, abstract and synchronized methods have no inlinable body.
    if access_flags & (access_flags::ACC_NATIVE | access_flags::ACC_ABSTRACT) != 0
        || access_flags & access_flags::ACC_SYNCHRONIZED != 0
    {
        return false;
    }
    let pattern = match detect_pattern(dex_file, linker, access_flags, code_item) {
        Some(pattern) => pattern,
        None => return false,
    };
    inliner.insert(method_idx, pattern);
    true
}

fn detect_pattern(
    dex_file: &DexFile,
    linker: &dyn ClassLinker,
    access_flags: u32,
    code_item: &CodeItem,
) -> Option<InlinePattern> {
    let insns = &code_item.insns[..];
    if insns.is_empty() || !code_item.tries.is_empty() {
        return None;
    }
    let first = DecodedInsn::decode(insns, 0);
    let first_width = first.opcode.format().code_units() as usize;
    let is_static = access_flags & access_flags::ACC_STATIC != 0;
    let arg_base = u32::from(code_item.registers_size - code_item.ins_size);

    match first.opcode {
        Opcode::ReturnVoid => Some(InlinePattern::Empty),
        Opcode::Return | Opcode::ReturnWide | Opcode::ReturnObject => {
            // return vN where vN is an argument.
            let vreg = first.va;
            if vreg < arg_base {
                return None;
            }
            let mut arg = (vreg - arg_base) as u16;
            if !is_static {
                // Argument positions do not count the receiver.
                arg = arg.checked_sub(1)?;
            }
            Some(InlinePattern::ReturnArg {
                arg,
                wide: first.opcode == Opcode::ReturnWide,
                is_object: first.opcode == Opcode::ReturnObject,
            })
        }
        Opcode::Const4 | Opcode::Const16 | Opcode::Const | Opcode::ConstHigh16
        | Opcode::ConstWide16 | Opcode::ConstWide32 | Opcode::ConstWide
        | Opcode::ConstWideHigh16 => {
            let second = DecodedInsn::decode(insns, first_width);
            let wide = matches!(
                first.opcode,
                Opcode::ConstWide16
                    | Opcode::ConstWide32
                    | Opcode::ConstWide
                    | Opcode::ConstWideHigh16
            );
            let expected_return = if wide { Opcode::ReturnWide } else { Opcode::Return };
            if second.opcode != expected_return || second.va != first.va {
                return None;
            }
            Some(InlinePattern::Const { value: first.literal, wide })
        }
        op if op.is_iget_or_iput() && !is_static => {
            detect_field_pattern(dex_file, linker, code_item, first, first_width, arg_base)
        }
        _ => None,
    }
}

fn detect_field_pattern(
    dex_file: &DexFile,
    linker: &dyn ClassLinker,
    code_item: &CodeItem,
    first: DecodedInsn,
    first_width: usize,
    arg_base: u32,
) -> Option<InlinePattern> {
    // The receiver must be `this` (argument 0).
    if first.vb != arg_base {
        return None;
    }
    let field_idx = first.vc;
    let field = linker.resolve_field(dex_file, field_idx, false)?;
    // Volatile accesses need barriers; the canned stubs do not emit them.
    if field.is_volatile {
        return None;
    }
    let second = DecodedInsn::decode(&code_item.insns, first_width);
    let access_type = instance_access_type(first.opcode);
    if first.opcode.is_field_get() {
        let expected_return = match access_type {
            MemAccessType::Wide => Opcode::ReturnWide,
            MemAccessType::Object => Opcode::ReturnObject,
            _ => Opcode::Return,
        };
        if second.opcode != expected_return || second.va != first.va {
            return None;
        }
        Some(InlinePattern::IGet { field, field_idx, access_type, object_arg: 0 })
    } else {
        if second.opcode != Opcode::ReturnVoid {
            return None;
        }
        // The stored value must be an argument.
        if first.va < arg_base + 1 {
            return None;
        }
        let src_arg = (first.va - arg_base - 1) as u16;
        Some(InlinePattern::IPut { field, field_idx, access_type, object_arg: 0, src_arg })
    }
}

fn instance_access_type(op: Opcode) -> MemAccessType {
    match op {
        Opcode::Iget | Opcode::Iput => MemAccessType::Word,
        Opcode::IgetWide | Opcode::IputWide => MemAccessType::Wide,
        Opcode::IgetObject | Opcode::IputObject => MemAccessType::Object,
        Opcode::IgetBoolean | Opcode::IputBoolean => MemAccessType::Boolean,
        Opcode::IgetByte | Opcode::IputByte => MemAccessType::Byte,
        Opcode::IgetChar | Opcode::IputChar => MemAccessType::Char,
        Opcode::IgetShort | Opcode::IputShort => MemAccessType::Short,
        _ => panic!("not an instance field opcode"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::DexFileId;
    use crate::linker::NullClassLinker;

    fn dex() -> DexFile {
        DexFile::new(DexFileId(0), "test.dex".into(), 0, vec![])
    }

    fn item(insns: Vec<u16>, registers: u16, ins: u16) -> CodeItem {
        CodeItem { registers_size: registers, ins_size: ins, outs_size: 0, insns, tries: vec![] }
    }

    struct FixedFieldLinker;

    impl ClassLinker for FixedFieldLinker {
        fn resolve_field(&self, _: &DexFile, _: u32, _: bool) -> Option<FieldInfo> {
            Some(FieldInfo {
                field_offset: 8,
                is_volatile: false,
                storage_index: 0,
                is_referrers_class: true,
                is_class_initialized: true,
            })
        }

        fn resolve_method(
            &self,
            _: &DexFile,
            _: u32,
            _: crate::dex::InvokeType,
        ) -> Option<crate::linker::MethodInfo> {
            None
        }
    }

    #[test]
    fn empty_method() {
        let pattern =
            detect_pattern(&dex(), &NullClassLinker, 0, &item(vec![0x000e], 1, 1)).unwrap();
        assert!(matches!(pattern, InlinePattern::Empty));
    }

    #[test]
    fn return_arg() {
        // return v1 (v0 = this, v1 = first real argument)
        let pattern =
            detect_pattern(&dex(), &NullClassLinker, 0, &item(vec![0x010f], 2, 2)).unwrap();
        match pattern {
            InlinePattern::ReturnArg { arg, wide, is_object } => {
                assert_eq!(arg, 0);
                assert!(!wide && !is_object);
            }
            other => panic!("unexpected pattern {other:?}"),
        }
    }

    #[test]
    fn constant_return() {
        // const/4 v0, #3; return v0
        let pattern =
            detect_pattern(&dex(), &NullClassLinker, 0, &item(vec![0x3012, 0x000f], 1, 1))
                .unwrap();
        match pattern {
            InlinePattern::Const { value, wide } => {
                assert_eq!(value, 3);
                assert!(!wide);
            }
            other => panic!("unexpected pattern {other:?}"),
        }
    }

    #[test]
    fn getter_needs_resolvable_field() {
        // iget v0, v1, field@5; return v0   (v1 = this)
        let insns = vec![0x1052u16, 0x0005, 0x000f];
        assert!(detect_pattern(&dex(), &NullClassLinker, 0, &item(insns.clone(), 2, 1)).is_none());
        let pattern = detect_pattern(&dex(), &FixedFieldLinker, 0, &item(insns, 2, 1)).unwrap();
        assert!(matches!(pattern, InlinePattern::IGet { .. }));
    }

    #[test]
    fn setter() {
        // iput v1, v0, field@5; return-void  (v0 = this, v1 = argument)
        let insns = vec![0x0159u16, 0x0005, 0x000e];
        let pattern = detect_pattern(&dex(), &FixedFieldLinker, 0, &item(insns, 2, 2)).unwrap();
        match pattern {
            InlinePattern::IPut { src_arg, .. } => assert_eq!(src_arg, 0),
            other => panic!("unexpected pattern {other:?}"),
        }
    }

    #[test]
    fn inliner_map_is_lazily_created() {
        let map = DexFileToMethodInlinerMap::new();
        let dex = dex();
        let inliner = map.get_method_inliner(&dex);
        inliner.write().unwrap().insert(3, InlinePattern::Empty);
        let again = map.get_method_inliner(&dex);
        assert!(again.read().unwrap().is_special(3));
    }
}
