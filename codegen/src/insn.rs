//! Dalvik instruction definitions and decoding.
//!
//! One macro invocation defines the opcode enum together with its mnemonic
//! and encoding format, in numeric order; everything else in the compiler
//! keys off this table. Quickened opcodes (operand is a vtable index or
//! field byte offset instead of a dex index) share the base formats.

/// Dalvik instruction encoding formats. The name encodes units/registers:
/// `F22c` is two code units, two registers and a constant pool index.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Format {
    F10x,
    F12x,
    F11n,
    F11x,
    F10t,
    F20t,
    F22x,
    F21t,
    F21s,
    F21h,
    F21c,
    F23x,
    F22b,
    F22t,
    F22s,
    F22c,
    F30t,
    F32x,
    F31i,
    F31t,
    F31c,
    F35c,
    F3rc,
    F51l,
}

impl Format {
    /// Instruction width in 16-bit code units.
    pub fn code_units(self) -> u32 {
        use Format::*;
        match self {
            F10x | F12x | F11n | F11x | F10t => 1,
            F20t | F22x | F21t | F21s | F21h | F21c | F23x | F22b | F22t | F22s | F22c => 2,
            F30t | F32x | F31i | F31t | F31c | F35c | F3rc => 3,
            F51l => 5,
        }
    }
}

macro_rules! dex_opcodes {
    ( $( $value:literal = $name:ident, $mnemonic:literal, $format:ident; )* ) => {
        /// A Dalvik opcode. Every byte value is covered; unused slots decode
        /// to their `UnusedXX` variant and are rejected by the verifier long
        /// before the compiler sees them.
        #[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
        #[repr(u8)]
        pub enum Opcode {
            $( $name = $value, )*
        }

        impl Opcode {
            /// Decode the opcode byte of a leading code unit.
            pub fn from_code_unit(unit: u16) -> Opcode {
                match (unit & 0xff) as u8 {
                    $( $value => Opcode::$name, )*
                }
            }

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $( Opcode::$name => $mnemonic, )*
                }
            }

            pub fn format(self) -> Format {
                match self {
                    $( Opcode::$name => Format::$format, )*
                }
            }
        }
    };
}

dex_opcodes! {
    0x00 = Nop, "nop", F10x;
    0x01 = Move, "move", F12x;
    0x02 = MoveFrom16, "move/from16", F22x;
    0x03 = Move16, "move/16", F32x;
    0x04 = MoveWide, "move-wide", F12x;
    0x05 = MoveWideFrom16, "move-wide/from16", F22x;
    0x06 = MoveWide16, "move-wide/16", F32x;
    0x07 = MoveObject, "move-object", F12x;
    0x08 = MoveObjectFrom16, "move-object/from16", F22x;
    0x09 = MoveObject16, "move-object/16", F32x;
    0x0a = MoveResult, "move-result", F11x;
    0x0b = MoveResultWide, "move-result-wide", F11x;
    0x0c = MoveResultObject, "move-result-object", F11x;
    0x0d = MoveException, "move-exception", F11x;
    0x0e = ReturnVoid, "return-void", F10x;
    0x0f = Return, "return", F11x;
    0x10 = ReturnWide, "return-wide", F11x;
    0x11 = ReturnObject, "return-object", F11x;
    0x12 = Const4, "const/4", F11n;
    0x13 = Const16, "const/16", F21s;
    0x14 = Const, "const", F31i;
    0x15 = ConstHigh16, "const/high16", F21h;
    0x16 = ConstWide16, "const-wide/16", F21s;
    0x17 = ConstWide32, "const-wide/32", F31i;
    0x18 = ConstWide, "const-wide", F51l;
    0x19 = ConstWideHigh16, "const-wide/high16", F21h;
    0x1a = ConstString, "const-string", F21c;
    0x1b = ConstStringJumbo, "const-string/jumbo", F31c;
    0x1c = ConstClass, "const-class", F21c;
    0x1d = MonitorEnter, "monitor-enter", F11x;
    0x1e = MonitorExit, "monitor-exit", F11x;
    0x1f = CheckCast, "check-cast", F21c;
    0x20 = InstanceOf, "instance-of", F22c;
    0x21 = ArrayLength, "array-length", F12x;
    0x22 = NewInstance, "new-instance", F21c;
    0x23 = NewArray, "new-array", F22c;
    0x24 = FilledNewArray, "filled-new-array", F35c;
    0x25 = FilledNewArrayRange, "filled-new-array/range", F3rc;
    0x26 = FillArrayData, "fill-array-data", F31t;
    0x27 = Throw, "throw", F11x;
    0x28 = Goto, "goto", F10t;
    0x29 = Goto16, "goto/16", F20t;
    0x2a = Goto32, "goto/32", F30t;
    0x2b = PackedSwitch, "packed-switch", F31t;
    0x2c = SparseSwitch, "sparse-switch", F31t;
    0x2d = CmplFloat, "cmpl-float", F23x;
    0x2e = CmpgFloat, "cmpg-float", F23x;
    0x2f = CmplDouble, "cmpl-double", F23x;
    0x30 = CmpgDouble, "cmpg-double", F23x;
    0x31 = CmpLong, "cmp-long", F23x;
    0x32 = IfEq, "if-eq", F22t;
    0x33 = IfNe, "if-ne", F22t;
    0x34 = IfLt, "if-lt", F22t;
    0x35 = IfGe, "if-ge", F22t;
    0x36 = IfGt, "if-gt", F22t;
    0x37 = IfLe, "if-le", F22t;
    0x38 = IfEqz, "if-eqz", F21t;
    0x39 = IfNez, "if-nez", F21t;
    0x3a = IfLtz, "if-ltz", F21t;
    0x3b = IfGez, "if-gez", F21t;
    0x3c = IfGtz, "if-gtz", F21t;
    0x3d = IfLez, "if-lez", F21t;
    0x3e = Unused3e, "unused-3e", F10x;
    0x3f = Unused3f, "unused-3f", F10x;
    0x40 = Unused40, "unused-40", F10x;
    0x41 = Unused41, "unused-41", F10x;
    0x42 = Unused42, "unused-42", F10x;
    0x43 = Unused43, "unused-43", F10x;
    0x44 = Aget, "aget", F23x;
    0x45 = AgetWide, "aget-wide", F23x;
    0x46 = AgetObject, "aget-object", F23x;
    0x47 = AgetBoolean, "aget-boolean", F23x;
    0x48 = AgetByte, "aget-byte", F23x;
    0x49 = AgetChar, "aget-char", F23x;
    0x4a = AgetShort, "aget-short", F23x;
    0x4b = Aput, "aput", F23x;
    0x4c = AputWide, "aput-wide", F23x;
    0x4d = AputObject, "aput-object", F23x;
    0x4e = AputBoolean, "aput-boolean", F23x;
    0x4f = AputByte, "aput-byte", F23x;
    0x50 = AputChar, "aput-char", F23x;
    0x51 = AputShort, "aput-short", F23x;
    0x52 = Iget, "iget", F22c;
    0x53 = IgetWide, "iget-wide", F22c;
    0x54 = IgetObject, "iget-object", F22c;
    0x55 = IgetBoolean, "iget-boolean", F22c;
    0x56 = IgetByte, "iget-byte", F22c;
    0x57 = IgetChar, "iget-char", F22c;
    0x58 = IgetShort, "iget-short", F22c;
    0x59 = Iput, "iput", F22c;
    0x5a = IputWide, "iput-wide", F22c;
    0x5b = IputObject, "iput-object", F22c;
    0x5c = IputBoolean, "iput-boolean", F22c;
    0x5d = IputByte, "iput-byte", F22c;
    0x5e = IputChar, "iput-char", F22c;
    0x5f = IputShort, "iput-short", F22c;
    0x60 = Sget, "sget", F21c;
    0x61 = SgetWide, "sget-wide", F21c;
    0x62 = SgetObject, "sget-object", F21c;
    0x63 = SgetBoolean, "sget-boolean", F21c;
    0x64 = SgetByte, "sget-byte", F21c;
    0x65 = SgetChar, "sget-char", F21c;
    0x66 = SgetShort, "sget-short", F21c;
    0x67 = Sput, "sput", F21c;
    0x68 = SputWide, "sput-wide", F21c;
    0x69 = SputObject, "sput-object", F21c;
    0x6a = SputBoolean, "sput-boolean", F21c;
    0x6b = SputByte, "sput-byte", F21c;
    0x6c = SputChar, "sput-char", F21c;
    0x6d = SputShort, "sput-short", F21c;
    0x6e = InvokeVirtual, "invoke-virtual", F35c;
    0x6f = InvokeSuper, "invoke-super", F35c;
    0x70 = InvokeDirect, "invoke-direct", F35c;
    0x71 = InvokeStatic, "invoke-static", F35c;
    0x72 = InvokeInterface, "invoke-interface", F35c;
    0x73 = ReturnVoidBarrier, "return-void-barrier", F10x;
    0x74 = InvokeVirtualRange, "invoke-virtual/range", F3rc;
    0x75 = InvokeSuperRange, "invoke-super/range", F3rc;
    0x76 = InvokeDirectRange, "invoke-direct/range", F3rc;
    0x77 = InvokeStaticRange, "invoke-static/range", F3rc;
    0x78 = InvokeInterfaceRange, "invoke-interface/range", F3rc;
    0x79 = Unused79, "unused-79", F10x;
    0x7a = Unused7a, "unused-7a", F10x;
    0x7b = NegInt, "neg-int", F12x;
    0x7c = NotInt, "not-int", F12x;
    0x7d = NegLong, "neg-long", F12x;
    0x7e = NotLong, "not-long", F12x;
    0x7f = NegFloat, "neg-float", F12x;
    0x80 = NegDouble, "neg-double", F12x;
    0x81 = IntToLong, "int-to-long", F12x;
    0x82 = IntToFloat, "int-to-float", F12x;
    0x83 = IntToDouble, "int-to-double", F12x;
    0x84 = LongToInt, "long-to-int", F12x;
    0x85 = LongToFloat, "long-to-float", F12x;
    0x86 = LongToDouble, "long-to-double", F12x;
    0x87 = FloatToInt, "float-to-int", F12x;
    0x88 = FloatToLong, "float-to-long", F12x;
    0x89 = FloatToDouble, "float-to-double", F12x;
    0x8a = DoubleToInt, "double-to-int", F12x;
    0x8b = DoubleToLong, "double-to-long", F12x;
    0x8c = DoubleToFloat, "double-to-float", F12x;
    0x8d = IntToByte, "int-to-byte", F12x;
    0x8e = IntToChar, "int-to-char", F12x;
    0x8f = IntToShort, "int-to-short", F12x;
    0x90 = AddInt, "add-int", F23x;
    0x91 = SubInt, "sub-int", F23x;
    0x92 = MulInt, "mul-int", F23x;
    0x93 = DivInt, "div-int", F23x;
    0x94 = RemInt, "rem-int", F23x;
    0x95 = AndInt, "and-int", F23x;
    0x96 = OrInt, "or-int", F23x;
    0x97 = XorInt, "xor-int", F23x;
    0x98 = ShlInt, "shl-int", F23x;
    0x99 = ShrInt, "shr-int", F23x;
    0x9a = UshrInt, "ushr-int", F23x;
    0x9b = AddLong, "add-long", F23x;
    0x9c = SubLong, "sub-long", F23x;
    0x9d = MulLong, "mul-long", F23x;
    0x9e = DivLong, "div-long", F23x;
    0x9f = RemLong, "rem-long", F23x;
    0xa0 = AndLong, "and-long", F23x;
    0xa1 = OrLong, "or-long", F23x;
    0xa2 = XorLong, "xor-long", F23x;
    0xa3 = ShlLong, "shl-long", F23x;
    0xa4 = ShrLong, "shr-long", F23x;
    0xa5 = UshrLong, "ushr-long", F23x;
    0xa6 = AddFloat, "add-float", F23x;
    0xa7 = SubFloat, "sub-float", F23x;
    0xa8 = MulFloat, "mul-float", F23x;
    0xa9 = DivFloat, "div-float", F23x;
    0xaa = RemFloat, "rem-float", F23x;
    0xab = AddDouble, "add-double", F23x;
    0xac = SubDouble, "sub-double", F23x;
    0xad = MulDouble, "mul-double", F23x;
    0xae = DivDouble, "div-double", F23x;
    0xaf = RemDouble, "rem-double", F23x;
    0xb0 = AddInt2Addr, "add-int/2addr", F12x;
    0xb1 = SubInt2Addr, "sub-int/2addr", F12x;
    0xb2 = MulInt2Addr, "mul-int/2addr", F12x;
    0xb3 = DivInt2Addr, "div-int/2addr", F12x;
    0xb4 = RemInt2Addr, "rem-int/2addr", F12x;
    0xb5 = AndInt2Addr, "and-int/2addr", F12x;
    0xb6 = OrInt2Addr, "or-int/2addr", F12x;
    0xb7 = XorInt2Addr, "xor-int/2addr", F12x;
    0xb8 = ShlInt2Addr, "shl-int/2addr", F12x;
    0xb9 = ShrInt2Addr, "shr-int/2addr", F12x;
    0xba = UshrInt2Addr, "ushr-int/2addr", F12x;
    0xbb = AddLong2Addr, "add-long/2addr", F12x;
    0xbc = SubLong2Addr, "sub-long/2addr", F12x;
    0xbd = MulLong2Addr, "mul-long/2addr", F12x;
    0xbe = DivLong2Addr, "div-long/2addr", F12x;
    0xbf = RemLong2Addr, "rem-long/2addr", F12x;
    0xc0 = AndLong2Addr, "and-long/2addr", F12x;
    0xc1 = OrLong2Addr, "or-long/2addr", F12x;
    0xc2 = XorLong2Addr, "xor-long/2addr", F12x;
    0xc3 = ShlLong2Addr, "shl-long/2addr", F12x;
    0xc4 = ShrLong2Addr, "shr-long/2addr", F12x;
    0xc5 = UshrLong2Addr, "ushr-long/2addr", F12x;
    0xc6 = AddFloat2Addr, "add-float/2addr", F12x;
    0xc7 = SubFloat2Addr, "sub-float/2addr", F12x;
    0xc8 = MulFloat2Addr, "mul-float/2addr", F12x;
    0xc9 = DivFloat2Addr, "div-float/2addr", F12x;
    0xca = RemFloat2Addr, "rem-float/2addr", F12x;
    0xcb = AddDouble2Addr, "add-double/2addr", F12x;
    0xcc = SubDouble2Addr, "sub-double/2addr", F12x;
    0xcd = MulDouble2Addr, "mul-double/2addr", F12x;
    0xce = DivDouble2Addr, "div-double/2addr", F12x;
    0xcf = RemDouble2Addr, "rem-double/2addr", F12x;
    0xd0 = AddIntLit16, "add-int/lit16", F22s;
    0xd1 = RsubInt, "rsub-int", F22s;
    0xd2 = MulIntLit16, "mul-int/lit16", F22s;
    0xd3 = DivIntLit16, "div-int/lit16", F22s;
    0xd4 = RemIntLit16, "rem-int/lit16", F22s;
    0xd5 = AndIntLit16, "and-int/lit16", F22s;
    0xd6 = OrIntLit16, "or-int/lit16", F22s;
    0xd7 = XorIntLit16, "xor-int/lit16", F22s;
    0xd8 = AddIntLit8, "add-int/lit8", F22b;
    0xd9 = RsubIntLit8, "rsub-int/lit8", F22b;
    0xda = MulIntLit8, "mul-int/lit8", F22b;
    0xdb = DivIntLit8, "div-int/lit8", F22b;
    0xdc = RemIntLit8, "rem-int/lit8", F22b;
    0xdd = AndIntLit8, "and-int/lit8", F22b;
    0xde = OrIntLit8, "or-int/lit8", F22b;
    0xdf = XorIntLit8, "xor-int/lit8", F22b;
    0xe0 = ShlIntLit8, "shl-int/lit8", F22b;
    0xe1 = ShrIntLit8, "shr-int/lit8", F22b;
    0xe2 = UshrIntLit8, "ushr-int/lit8", F22b;
    0xe3 = IgetQuick, "+iget-quick", F22c;
    0xe4 = IgetWideQuick, "+iget-wide-quick", F22c;
    0xe5 = IgetObjectQuick, "+iget-object-quick", F22c;
    0xe6 = IputQuick, "+iput-quick", F22c;
    0xe7 = IputWideQuick, "+iput-wide-quick", F22c;
    0xe8 = IputObjectQuick, "+iput-object-quick", F22c;
    0xe9 = InvokeVirtualQuick, "+invoke-virtual-quick", F35c;
    0xea = InvokeVirtualRangeQuick, "+invoke-virtual/range-quick", F3rc;
    0xeb = UnusedEb, "unused-eb", F10x;
    0xec = UnusedEc, "unused-ec", F10x;
    0xed = UnusedEd, "unused-ed", F10x;
    0xee = UnusedEe, "unused-ee", F10x;
    0xef = UnusedEf, "unused-ef", F10x;
    0xf0 = UnusedF0, "unused-f0", F10x;
    0xf1 = UnusedF1, "unused-f1", F10x;
    0xf2 = UnusedF2, "unused-f2", F10x;
    0xf3 = UnusedF3, "unused-f3", F10x;
    0xf4 = UnusedF4, "unused-f4", F10x;
    0xf5 = UnusedF5, "unused-f5", F10x;
    0xf6 = UnusedF6, "unused-f6", F10x;
    0xf7 = UnusedF7, "unused-f7", F10x;
    0xf8 = UnusedF8, "unused-f8", F10x;
    0xf9 = UnusedF9, "unused-f9", F10x;
    0xfa = UnusedFa, "unused-fa", F10x;
    0xfb = UnusedFb, "unused-fb", F10x;
    0xfc = UnusedFc, "unused-fc", F10x;
    0xfd = UnusedFd, "unused-fd", F10x;
    0xfe = UnusedFe, "unused-fe", F10x;
    0xff = UnusedFf, "unused-ff", F10x;
}

/// Payload signatures that can follow a `nop` opcode byte.
pub const PACKED_SWITCH_SIGNATURE: u16 = 0x0100;
pub const SPARSE_SWITCH_SIGNATURE: u16 = 0x0200;
pub const FILL_ARRAY_DATA_SIGNATURE: u16 = 0x0300;

impl Opcode {
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            Opcode::Goto | Opcode::Goto16 | Opcode::Goto32
        ) || self.is_conditional_branch()
    }

    pub fn is_conditional_branch(self) -> bool {
        (Opcode::IfEq as u8..=Opcode::IfLez as u8).contains(&(self as u8))
    }

    pub fn is_switch(self) -> bool {
        matches!(self, Opcode::PackedSwitch | Opcode::SparseSwitch)
    }

    pub fn is_return(self) -> bool {
        matches!(
            self,
            Opcode::ReturnVoid
                | Opcode::Return
                | Opcode::ReturnWide
                | Opcode::ReturnObject
                | Opcode::ReturnVoidBarrier
        )
    }

    /// True if control can continue to the following instruction.
    pub fn can_continue(self) -> bool {
        !(self.is_return()
            || matches!(self, Opcode::Throw | Opcode::Goto | Opcode::Goto16 | Opcode::Goto32))
    }

    pub fn is_invoke(self) -> bool {
        matches!(
            self,
            Opcode::InvokeVirtual
                | Opcode::InvokeSuper
                | Opcode::InvokeDirect
                | Opcode::InvokeStatic
                | Opcode::InvokeInterface
                | Opcode::InvokeVirtualRange
                | Opcode::InvokeSuperRange
                | Opcode::InvokeDirectRange
                | Opcode::InvokeStaticRange
                | Opcode::InvokeInterfaceRange
                | Opcode::InvokeVirtualQuick
                | Opcode::InvokeVirtualRangeQuick
        )
    }

    pub fn is_invoke_range(self) -> bool {
        matches!(
            self,
            Opcode::InvokeVirtualRange
                | Opcode::InvokeSuperRange
                | Opcode::InvokeDirectRange
                | Opcode::InvokeStaticRange
                | Opcode::InvokeInterfaceRange
                | Opcode::InvokeVirtualRangeQuick
        )
    }

    pub fn is_iget_or_iput(self) -> bool {
        (Opcode::Iget as u8..=Opcode::IputShort as u8).contains(&(self as u8))
    }

    pub fn is_iget_or_iput_quick(self) -> bool {
        (Opcode::IgetQuick as u8..=Opcode::IputObjectQuick as u8).contains(&(self as u8))
    }

    pub fn is_sget_or_sput(self) -> bool {
        (Opcode::Sget as u8..=Opcode::SputShort as u8).contains(&(self as u8))
    }

    /// True for the `*get*` half of a field access opcode.
    pub fn is_field_get(self) -> bool {
        matches!(self as u8, 0x52..=0x58 | 0x60..=0x66 | 0xe3..=0xe5)
    }

    pub fn sets_wide_result(self) -> bool {
        matches!(
            self,
            Opcode::IgetWide
                | Opcode::SgetWide
                | Opcode::IgetWideQuick
                | Opcode::AgetWide
                | Opcode::MoveResultWide
        )
    }

    /// True if the instruction can raise a runtime exception. Drives
    /// safepoint placement and exception edge construction.
    pub fn can_throw(self) -> bool {
        use Opcode::*;
        if self.is_invoke() || self.is_iget_or_iput() || self.is_iget_or_iput_quick()
            || self.is_sget_or_sput()
        {
            return true;
        }
        matches!(
            self,
            ConstString
                | ConstStringJumbo
                | ConstClass
                | MonitorEnter
                | MonitorExit
                | CheckCast
                | InstanceOf
                | ArrayLength
                | NewInstance
                | NewArray
                | FilledNewArray
                | FilledNewArrayRange
                | FillArrayData
                | Throw
                | Aget | AgetWide | AgetObject | AgetBoolean | AgetByte | AgetChar | AgetShort
                | Aput | AputWide | AputObject | AputBoolean | AputByte | AputChar | AputShort
                | DivInt | RemInt | DivLong | RemLong
                | DivInt2Addr | RemInt2Addr | DivLong2Addr | RemLong2Addr
                | DivIntLit16 | RemIntLit16 | DivIntLit8 | RemIntLit8
        )
    }
}

/// A fully decoded instruction. Field meaning depends on the format; the
/// names follow the dex specification (`vA`, `vB`, `vC`, `B` as literal).
#[derive(Copy, Clone, Debug)]
pub struct DecodedInsn {
    pub opcode: Opcode,
    pub va: u32,
    pub vb: u32,
    pub vc: u32,
    /// Register list of 35c-style formats; `va` holds the count.
    pub arg: [u32; 5],
    /// Sign-extended literal of const/branch formats.
    pub literal: i64,
}

impl DecodedInsn {
    /// Decode the instruction starting at `insns[pc]`.
    ///
    /// Panics if the stream is truncated mid-instruction; the verifier
    /// guarantees well-formed code items.
    pub fn decode(insns: &[u16], pc: usize) -> DecodedInsn {
        let unit = insns[pc];
        let opcode = Opcode::from_code_unit(unit);
        let hi = |n: usize| insns[pc + n];
        let mut insn = DecodedInsn { opcode, va: 0, vb: 0, vc: 0, arg: [0; 5], literal: 0 };
        match opcode.format() {
            Format::F10x => {}
            Format::F12x => {
                insn.va = u32::from((unit >> 8) & 0xf);
                insn.vb = u32::from(unit >> 12);
            }
            Format::F11n => {
                insn.va = u32::from((unit >> 8) & 0xf);
                insn.literal = i64::from((unit as i16) >> 12);
            }
            Format::F11x => {
                insn.va = u32::from(unit >> 8);
            }
            Format::F10t => {
                insn.literal = i64::from((unit as i16) >> 8);
            }
            Format::F20t => {
                insn.literal = i64::from(hi(1) as i16);
            }
            Format::F22x => {
                insn.va = u32::from(unit >> 8);
                insn.vb = u32::from(hi(1));
            }
            Format::F21t | Format::F21s => {
                insn.va = u32::from(unit >> 8);
                insn.literal = i64::from(hi(1) as i16);
            }
            Format::F21h => {
                insn.va = u32::from(unit >> 8);
                // `const/high16` shifts into the high half of 32 or 64 bits.
                let shift = if opcode == Opcode::ConstWideHigh16 { 48 } else { 16 };
                insn.literal = i64::from(hi(1) as i16) << shift;
            }
            Format::F21c => {
                insn.va = u32::from(unit >> 8);
                insn.vb = u32::from(hi(1));
            }
            Format::F23x => {
                insn.va = u32::from(unit >> 8);
                insn.vb = u32::from(hi(1) & 0xff);
                insn.vc = u32::from(hi(1) >> 8);
            }
            Format::F22b => {
                insn.va = u32::from(unit >> 8);
                insn.vb = u32::from(hi(1) & 0xff);
                insn.literal = i64::from((hi(1) as i16) >> 8);
            }
            Format::F22t | Format::F22s => {
                insn.va = u32::from((unit >> 8) & 0xf);
                insn.vb = u32::from(unit >> 12);
                insn.literal = i64::from(hi(1) as i16);
            }
            Format::F22c => {
                insn.va = u32::from((unit >> 8) & 0xf);
                insn.vb = u32::from(unit >> 12);
                insn.vc = u32::from(hi(1));
            }
            Format::F30t => {
                insn.literal = i64::from(i32::from(hi(1)) | (i32::from(hi(2) as i16) << 16));
            }
            Format::F32x => {
                insn.va = u32::from(hi(1));
                insn.vb = u32::from(hi(2));
            }
            Format::F31i | Format::F31t => {
                insn.va = u32::from(unit >> 8);
                insn.literal = i64::from(i32::from(hi(1)) | (i32::from(hi(2) as i16) << 16));
            }
            Format::F31c => {
                insn.va = u32::from(unit >> 8);
                insn.vb = u32::from(hi(1)) | (u32::from(hi(2)) << 16);
            }
            Format::F35c => {
                let count = u32::from(unit >> 12);
                insn.va = count;
                insn.vb = u32::from(hi(1));
                let regs = hi(2);
                insn.arg = [
                    u32::from(regs & 0xf),
                    u32::from((regs >> 4) & 0xf),
                    u32::from((regs >> 8) & 0xf),
                    u32::from(regs >> 12),
                    u32::from((unit >> 8) & 0xf),
                ];
                debug_assert!(count <= 5);
            }
            Format::F3rc => {
                insn.va = u32::from(unit >> 8);
                insn.vb = u32::from(hi(1));
                insn.vc = u32::from(hi(2));
            }
            Format::F51l => {
                insn.va = u32::from(unit >> 8);
                insn.literal = i64::from(hi(1))
                    | (i64::from(hi(2)) << 16)
                    | (i64::from(hi(3)) << 32)
                    | (i64::from(hi(4)) << 48);
            }
        }
        insn
    }

    /// Width of this instruction at `pc`, accounting for inline payloads.
    pub fn width(insns: &[u16], pc: usize) -> u32 {
        let unit = insns[pc];
        if unit & 0xff == 0 && unit != 0 {
            // A payload pseudo-instruction.
            return payload_width(insns, pc);
        }
        Opcode::from_code_unit(unit).format().code_units()
    }
}

fn payload_width(insns: &[u16], pc: usize) -> u32 {
    match insns[pc] {
        PACKED_SWITCH_SIGNATURE => 4 + u32::from(insns[pc + 1]) * 2,
        SPARSE_SWITCH_SIGNATURE => 2 + u32::from(insns[pc + 1]) * 4,
        FILL_ARRAY_DATA_SIGNATURE => {
            let element_width = u32::from(insns[pc + 2]);
            let count = u32::from(insns[pc + 3]) | (u32::from(insns[pc + 4]) << 16);
            4 + (element_width * count + 1) / 2
        }
        _ => 1,
    }
}

/// A parsed `packed-switch` payload.
pub struct PackedSwitchPayload<'a> {
    pub first_key: i32,
    pub targets: &'a [u16],
    pub size: u16,
}

/// A parsed `sparse-switch` payload: `size` key/target pairs.
pub struct SparseSwitchPayload<'a> {
    pub size: u16,
    units: &'a [u16],
}

impl PackedSwitchPayload<'_> {
    /// Relative branch target (in code units) of case `index`.
    pub fn target(&self, index: usize) -> i32 {
        read_i32(self.targets, index)
    }
}

impl SparseSwitchPayload<'_> {
    pub fn key(&self, index: usize) -> i32 {
        read_i32(self.units, index)
    }

    pub fn target(&self, index: usize) -> i32 {
        read_i32(&self.units[usize::from(self.size) * 2..], index)
    }
}

fn read_i32(units: &[u16], index: usize) -> i32 {
    i32::from(units[index * 2]) | (i32::from(units[index * 2 + 1]) << 16)
}

/// Parse a packed-switch payload at `payload_pc`. Panics on a bad
/// signature; the graph builder only follows verified payload offsets.
pub fn parse_packed_switch(insns: &[u16], payload_pc: usize) -> PackedSwitchPayload<'_> {
    assert_eq!(insns[payload_pc], PACKED_SWITCH_SIGNATURE);
    let size = insns[payload_pc + 1];
    let first_key = read_i32(&insns[payload_pc + 2..], 0);
    PackedSwitchPayload {
        first_key,
        size,
        targets: &insns[payload_pc + 4..payload_pc + 4 + usize::from(size) * 2],
    }
}

pub fn parse_sparse_switch(insns: &[u16], payload_pc: usize) -> SparseSwitchPayload<'_> {
    assert_eq!(insns[payload_pc], SPARSE_SWITCH_SIGNATURE);
    let size = insns[payload_pc + 1];
    SparseSwitchPayload {
        size,
        units: &insns[payload_pc + 2..payload_pc + 2 + usize::from(size) * 4],
    }
}

/// A fill-array-data payload: raw little-endian element bytes.
pub struct FillArrayDataPayload<'a> {
    pub element_width: u16,
    pub element_count: u32,
    pub units: &'a [u16],
}

impl FillArrayDataPayload<'_> {
    /// Total payload size in bytes, header included, as stored in the
    /// literal pool.
    pub fn size_in_bytes(&self) -> u32 {
        8 + u32::from(self.element_width) * self.element_count
    }
}

pub fn parse_fill_array_data(insns: &[u16], payload_pc: usize) -> FillArrayDataPayload<'_> {
    assert_eq!(insns[payload_pc], FILL_ARRAY_DATA_SIGNATURE);
    let element_width = insns[payload_pc + 2];
    let element_count =
        u32::from(insns[payload_pc + 3]) | (u32::from(insns[payload_pc + 4]) << 16);
    let data_units = (u32::from(element_width) * element_count).div_ceil(2) as usize;
    FillArrayDataPayload {
        element_width,
        element_count,
        units: &insns[payload_pc + 1..payload_pc + 4 + data_units],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_round_trip() {
        for byte in 0..=255u16 {
            let op = Opcode::from_code_unit(byte);
            assert_eq!(op as u8 as u16, byte);
        }
    }

    #[test]
    fn decode_const4() {
        // const/4 v0, #7
        let insns = [0x7012u16];
        let insn = DecodedInsn::decode(&insns, 0);
        assert_eq!(insn.opcode, Opcode::Const4);
        assert_eq!(insn.va, 0);
        assert_eq!(insn.literal, 7);
    }

    #[test]
    fn decode_negative_nibble() {
        // const/4 v1, #-1
        let insns = [0xf112u16];
        let insn = DecodedInsn::decode(&insns, 0);
        assert_eq!(insn.literal, -1);
    }

    #[test]
    fn decode_if_eq() {
        // if-eq v2, v3, +5
        let insns = [0x3232u16, 0x0005];
        let insn = DecodedInsn::decode(&insns, 0);
        assert_eq!(insn.opcode, Opcode::IfEq);
        assert_eq!(insn.va, 2);
        assert_eq!(insn.vb, 3);
        assert_eq!(insn.literal, 5);
    }

    #[test]
    fn decode_invoke_virtual() {
        // invoke-virtual {v0, v1}, method@0x1234
        let insns = [0x206eu16, 0x1234, 0x0010];
        let insn = DecodedInsn::decode(&insns, 0);
        assert_eq!(insn.opcode, Opcode::InvokeVirtual);
        assert_eq!(insn.va, 2);
        assert_eq!(insn.vb, 0x1234);
        assert_eq!(insn.arg[0], 0);
        assert_eq!(insn.arg[1], 1);
    }

    #[test]
    fn decode_const_wide_high16() {
        // const-wide/high16 v0, #0x4000000000000000
        let insns = [0x0019u16, 0x4000];
        let insn = DecodedInsn::decode(&insns, 0);
        assert_eq!(insn.literal, 0x4000_0000_0000_0000);
    }

    #[test]
    fn packed_switch_payload() {
        // size=2, first_key=10, targets 0x100 and 0x200
        let insns = [
            PACKED_SWITCH_SIGNATURE,
            2,
            10,
            0,
            0x100,
            0,
            0x200,
            0,
        ];
        let payload = parse_packed_switch(&insns, 0);
        assert_eq!(payload.size, 2);
        assert_eq!(payload.first_key, 10);
        assert_eq!(payload.target(0), 0x100);
        assert_eq!(payload.target(1), 0x200);
        assert_eq!(DecodedInsn::width(&insns, 0), 8);
    }

    #[test]
    fn branch_classification() {
        assert!(Opcode::Goto.is_branch());
        assert!(Opcode::IfLez.is_conditional_branch());
        assert!(!Opcode::PackedSwitch.is_branch());
        assert!(Opcode::PackedSwitch.is_switch());
        assert!(!Opcode::Throw.can_continue());
        assert!(Opcode::Iget.can_throw());
        assert!(!Opcode::AddInt.can_throw());
        assert!(Opcode::DivInt.can_throw());
    }
}
