use std::fmt;

/// Encoding layout of an instruction, named after the register/literal shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Format {
    F10x,
    F12x,
    F11n,
    F11x,
    F10t,
    F20t,
    F20bc,
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
    F22cs,
    F30t,
    F32x,
    F31i,
    F31t,
    F31c,
    F35c,
    F35ms,
    F35mi,
    F3rc,
    F3rms,
    F3rmi,
    F51l,
}

impl Format {
    /// Width of the instruction in 16-bit code units.
    pub fn width(self) -> usize {
        match self {
            Format::F10x | Format::F12x | Format::F11n | Format::F11x | Format::F10t => 1,
            Format::F20t
            | Format::F20bc
            | Format::F22x
            | Format::F21t
            | Format::F21s
            | Format::F21h
            | Format::F21c
            | Format::F23x
            | Format::F22b
            | Format::F22t
            | Format::F22s
            | Format::F22c
            | Format::F22cs => 2,
            Format::F30t
            | Format::F32x
            | Format::F31i
            | Format::F31t
            | Format::F31c
            | Format::F35c
            | Format::F35ms
            | Format::F35mi
            | Format::F3rc
            | Format::F3rms
            | Format::F3rmi => 3,
            Format::F51l => 5,
        }
    }
}

/// What the index operand of an instruction refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexKind {
    None,
    Unknown,
    VarRef,
    TypeRef,
    StringRef,
    MethodRef,
    FieldRef,
    InlineMethod,
    VtableOffset,
    FieldOffset,
}

pub const CAN_BRANCH: u8 = 1;
pub const CAN_CONTINUE: u8 = 1 << 1;
pub const CAN_SWITCH: u8 = 1 << 2;
pub const CAN_THROW: u8 = 1 << 3;
pub const CAN_RETURN: u8 = 1 << 4;
pub const INVOKE: u8 = 1 << 5;

pub const PACKED_SWITCH_SIGNATURE: u16 = 0x0100;
pub const SPARSE_SWITCH_SIGNATURE: u16 = 0x0200;
pub const ARRAY_DATA_SIGNATURE: u16 = 0x0300;

macro_rules! opcodes {
    ($($value:literal $name:ident $text:literal $format:ident $index:ident;)*) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u8)]
        pub enum Opcode {
            $($name = $value,)*
        }

        const OPCODE_TABLE: [(Opcode, &str, Format, IndexKind); 256] = [
            $((Opcode::$name, $text, Format::$format, IndexKind::$index),)*
        ];
    };
}

opcodes! {
    0x00 Nop "nop" F10x None;
    0x01 Move "move" F12x None;
    0x02 MoveFrom16 "move/from16" F22x None;
    0x03 Move16 "move/16" F32x None;
    0x04 MoveWide "move-wide" F12x None;
    0x05 MoveWideFrom16 "move-wide/from16" F22x None;
    0x06 MoveWide16 "move-wide/16" F32x None;
    0x07 MoveObject "move-object" F12x None;
    0x08 MoveObjectFrom16 "move-object/from16" F22x None;
    0x09 MoveObject16 "move-object/16" F32x None;
    0x0a MoveResult "move-result" F11x None;
    0x0b MoveResultWide "move-result-wide" F11x None;
    0x0c MoveResultObject "move-result-object" F11x None;
    0x0d MoveException "move-exception" F11x None;
    0x0e ReturnVoid "return-void" F10x None;
    0x0f Return "return" F11x None;
    0x10 ReturnWide "return-wide" F11x None;
    0x11 ReturnObject "return-object" F11x None;
    0x12 Const4 "const/4" F11n None;
    0x13 Const16 "const/16" F21s None;
    0x14 Const "const" F31i None;
    0x15 ConstHigh16 "const/high16" F21h None;
    0x16 ConstWide16 "const-wide/16" F21s None;
    0x17 ConstWide32 "const-wide/32" F31i None;
    0x18 ConstWide "const-wide" F51l None;
    0x19 ConstWideHigh16 "const-wide/high16" F21h None;
    0x1a ConstString "const-string" F21c StringRef;
    0x1b ConstStringJumbo "const-string/jumbo" F31c StringRef;
    0x1c ConstClass "const-class" F21c TypeRef;
    0x1d MonitorEnter "monitor-enter" F11x None;
    0x1e MonitorExit "monitor-exit" F11x None;
    0x1f CheckCast "check-cast" F21c TypeRef;
    0x20 InstanceOf "instance-of" F22c TypeRef;
    0x21 ArrayLength "array-length" F12x None;
    0x22 NewInstance "new-instance" F21c TypeRef;
    0x23 NewArray "new-array" F22c TypeRef;
    0x24 FilledNewArray "filled-new-array" F35c TypeRef;
    0x25 FilledNewArrayRange "filled-new-array/range" F3rc TypeRef;
    0x26 FillArrayData "fill-array-data" F31t None;
    0x27 Throw "throw" F11x None;
    0x28 Goto "goto" F10t None;
    0x29 Goto16 "goto/16" F20t None;
    0x2a Goto32 "goto/32" F30t None;
    0x2b PackedSwitch "packed-switch" F31t None;
    0x2c SparseSwitch "sparse-switch" F31t None;
    0x2d CmplFloat "cmpl-float" F23x None;
    0x2e CmpgFloat "cmpg-float" F23x None;
    0x2f CmplDouble "cmpl-double" F23x None;
    0x30 CmpgDouble "cmpg-double" F23x None;
    0x31 CmpLong "cmp-long" F23x None;
    0x32 IfEq "if-eq" F22t None;
    0x33 IfNe "if-ne" F22t None;
    0x34 IfLt "if-lt" F22t None;
    0x35 IfGe "if-ge" F22t None;
    0x36 IfGt "if-gt" F22t None;
    0x37 IfLe "if-le" F22t None;
    0x38 IfEqz "if-eqz" F21t None;
    0x39 IfNez "if-nez" F21t None;
    0x3a IfLtz "if-ltz" F21t None;
    0x3b IfGez "if-gez" F21t None;
    0x3c IfGtz "if-gtz" F21t None;
    0x3d IfLez "if-lez" F21t None;
    0x3e Unused3e "unused-3e" F10x Unknown;
    0x3f Unused3f "unused-3f" F10x Unknown;
    0x40 Unused40 "unused-40" F10x Unknown;
    0x41 Unused41 "unused-41" F10x Unknown;
    0x42 Unused42 "unused-42" F10x Unknown;
    0x43 Unused43 "unused-43" F10x Unknown;
    0x44 Aget "aget" F23x None;
    0x45 AgetWide "aget-wide" F23x None;
    0x46 AgetObject "aget-object" F23x None;
    0x47 AgetBoolean "aget-boolean" F23x None;
    0x48 AgetByte "aget-byte" F23x None;
    0x49 AgetChar "aget-char" F23x None;
    0x4a AgetShort "aget-short" F23x None;
    0x4b Aput "aput" F23x None;
    0x4c AputWide "aput-wide" F23x None;
    0x4d AputObject "aput-object" F23x None;
    0x4e AputBoolean "aput-boolean" F23x None;
    0x4f AputByte "aput-byte" F23x None;
    0x50 AputChar "aput-char" F23x None;
    0x51 AputShort "aput-short" F23x None;
    0x52 Iget "iget" F22c FieldRef;
    0x53 IgetWide "iget-wide" F22c FieldRef;
    0x54 IgetObject "iget-object" F22c FieldRef;
    0x55 IgetBoolean "iget-boolean" F22c FieldRef;
    0x56 IgetByte "iget-byte" F22c FieldRef;
    0x57 IgetChar "iget-char" F22c FieldRef;
    0x58 IgetShort "iget-short" F22c FieldRef;
    0x59 Iput "iput" F22c FieldRef;
    0x5a IputWide "iput-wide" F22c FieldRef;
    0x5b IputObject "iput-object" F22c FieldRef;
    0x5c IputBoolean "iput-boolean" F22c FieldRef;
    0x5d IputByte "iput-byte" F22c FieldRef;
    0x5e IputChar "iput-char" F22c FieldRef;
    0x5f IputShort "iput-short" F22c FieldRef;
    0x60 Sget "sget" F21c FieldRef;
    0x61 SgetWide "sget-wide" F21c FieldRef;
    0x62 SgetObject "sget-object" F21c FieldRef;
    0x63 SgetBoolean "sget-boolean" F21c FieldRef;
    0x64 SgetByte "sget-byte" F21c FieldRef;
    0x65 SgetChar "sget-char" F21c FieldRef;
    0x66 SgetShort "sget-short" F21c FieldRef;
    0x67 Sput "sput" F21c FieldRef;
    0x68 SputWide "sput-wide" F21c FieldRef;
    0x69 SputObject "sput-object" F21c FieldRef;
    0x6a SputBoolean "sput-boolean" F21c FieldRef;
    0x6b SputByte "sput-byte" F21c FieldRef;
    0x6c SputChar "sput-char" F21c FieldRef;
    0x6d SputShort "sput-short" F21c FieldRef;
    0x6e InvokeVirtual "invoke-virtual" F35c MethodRef;
    0x6f InvokeSuper "invoke-super" F35c MethodRef;
    0x70 InvokeDirect "invoke-direct" F35c MethodRef;
    0x71 InvokeStatic "invoke-static" F35c MethodRef;
    0x72 InvokeInterface "invoke-interface" F35c MethodRef;
    0x73 Unused73 "unused-73" F10x Unknown;
    0x74 InvokeVirtualRange "invoke-virtual/range" F3rc MethodRef;
    0x75 InvokeSuperRange "invoke-super/range" F3rc MethodRef;
    0x76 InvokeDirectRange "invoke-direct/range" F3rc MethodRef;
    0x77 InvokeStaticRange "invoke-static/range" F3rc MethodRef;
    0x78 InvokeInterfaceRange "invoke-interface/range" F3rc MethodRef;
    0x79 Unused79 "unused-79" F10x Unknown;
    0x7a Unused7a "unused-7a" F10x Unknown;
    0x7b NegInt "neg-int" F12x None;
    0x7c NotInt "not-int" F12x None;
    0x7d NegLong "neg-long" F12x None;
    0x7e NotLong "not-long" F12x None;
    0x7f NegFloat "neg-float" F12x None;
    0x80 NegDouble "neg-double" F12x None;
    0x81 IntToLong "int-to-long" F12x None;
    0x82 IntToFloat "int-to-float" F12x None;
    0x83 IntToDouble "int-to-double" F12x None;
    0x84 LongToInt "long-to-int" F12x None;
    0x85 LongToFloat "long-to-float" F12x None;
    0x86 LongToDouble "long-to-double" F12x None;
    0x87 FloatToInt "float-to-int" F12x None;
    0x88 FloatToLong "float-to-long" F12x None;
    0x89 FloatToDouble "float-to-double" F12x None;
    0x8a DoubleToInt "double-to-int" F12x None;
    0x8b DoubleToLong "double-to-long" F12x None;
    0x8c DoubleToFloat "double-to-float" F12x None;
    0x8d IntToByte "int-to-byte" F12x None;
    0x8e IntToChar "int-to-char" F12x None;
    0x8f IntToShort "int-to-short" F12x None;
    0x90 AddInt "add-int" F23x None;
    0x91 SubInt "sub-int" F23x None;
    0x92 MulInt "mul-int" F23x None;
    0x93 DivInt "div-int" F23x None;
    0x94 RemInt "rem-int" F23x None;
    0x95 AndInt "and-int" F23x None;
    0x96 OrInt "or-int" F23x None;
    0x97 XorInt "xor-int" F23x None;
    0x98 ShlInt "shl-int" F23x None;
    0x99 ShrInt "shr-int" F23x None;
    0x9a UshrInt "ushr-int" F23x None;
    0x9b AddLong "add-long" F23x None;
    0x9c SubLong "sub-long" F23x None;
    0x9d MulLong "mul-long" F23x None;
    0x9e DivLong "div-long" F23x None;
    0x9f RemLong "rem-long" F23x None;
    0xa0 AndLong "and-long" F23x None;
    0xa1 OrLong "or-long" F23x None;
    0xa2 XorLong "xor-long" F23x None;
    0xa3 ShlLong "shl-long" F23x None;
    0xa4 ShrLong "shr-long" F23x None;
    0xa5 UshrLong "ushr-long" F23x None;
    0xa6 AddFloat "add-float" F23x None;
    0xa7 SubFloat "sub-float" F23x None;
    0xa8 MulFloat "mul-float" F23x None;
    0xa9 DivFloat "div-float" F23x None;
    0xaa RemFloat "rem-float" F23x None;
    0xab AddDouble "add-double" F23x None;
    0xac SubDouble "sub-double" F23x None;
    0xad MulDouble "mul-double" F23x None;
    0xae DivDouble "div-double" F23x None;
    0xaf RemDouble "rem-double" F23x None;
    0xb0 AddInt2Addr "add-int/2addr" F12x None;
    0xb1 SubInt2Addr "sub-int/2addr" F12x None;
    0xb2 MulInt2Addr "mul-int/2addr" F12x None;
    0xb3 DivInt2Addr "div-int/2addr" F12x None;
    0xb4 RemInt2Addr "rem-int/2addr" F12x None;
    0xb5 AndInt2Addr "and-int/2addr" F12x None;
    0xb6 OrInt2Addr "or-int/2addr" F12x None;
    0xb7 XorInt2Addr "xor-int/2addr" F12x None;
    0xb8 ShlInt2Addr "shl-int/2addr" F12x None;
    0xb9 ShrInt2Addr "shr-int/2addr" F12x None;
    0xba UshrInt2Addr "ushr-int/2addr" F12x None;
    0xbb AddLong2Addr "add-long/2addr" F12x None;
    0xbc SubLong2Addr "sub-long/2addr" F12x None;
    0xbd MulLong2Addr "mul-long/2addr" F12x None;
    0xbe DivLong2Addr "div-long/2addr" F12x None;
    0xbf RemLong2Addr "rem-long/2addr" F12x None;
    0xc0 AndLong2Addr "and-long/2addr" F12x None;
    0xc1 OrLong2Addr "or-long/2addr" F12x None;
    0xc2 XorLong2Addr "xor-long/2addr" F12x None;
    0xc3 ShlLong2Addr "shl-long/2addr" F12x None;
    0xc4 ShrLong2Addr "shr-long/2addr" F12x None;
    0xc5 UshrLong2Addr "ushr-long/2addr" F12x None;
    0xc6 AddFloat2Addr "add-float/2addr" F12x None;
    0xc7 SubFloat2Addr "sub-float/2addr" F12x None;
    0xc8 MulFloat2Addr "mul-float/2addr" F12x None;
    0xc9 DivFloat2Addr "div-float/2addr" F12x None;
    0xca RemFloat2Addr "rem-float/2addr" F12x None;
    0xcb AddDouble2Addr "add-double/2addr" F12x None;
    0xcc SubDouble2Addr "sub-double/2addr" F12x None;
    0xcd MulDouble2Addr "mul-double/2addr" F12x None;
    0xce DivDouble2Addr "div-double/2addr" F12x None;
    0xcf RemDouble2Addr "rem-double/2addr" F12x None;
    0xd0 AddIntLit16 "add-int/lit16" F22s None;
    0xd1 RsubInt "rsub-int" F22s None;
    0xd2 MulIntLit16 "mul-int/lit16" F22s None;
    0xd3 DivIntLit16 "div-int/lit16" F22s None;
    0xd4 RemIntLit16 "rem-int/lit16" F22s None;
    0xd5 AndIntLit16 "and-int/lit16" F22s None;
    0xd6 OrIntLit16 "or-int/lit16" F22s None;
    0xd7 XorIntLit16 "xor-int/lit16" F22s None;
    0xd8 AddIntLit8 "add-int/lit8" F22b None;
    0xd9 RsubIntLit8 "rsub-int/lit8" F22b None;
    0xda MulIntLit8 "mul-int/lit8" F22b None;
    0xdb DivIntLit8 "div-int/lit8" F22b None;
    0xdc RemIntLit8 "rem-int/lit8" F22b None;
    0xdd AndIntLit8 "and-int/lit8" F22b None;
    0xde OrIntLit8 "or-int/lit8" F22b None;
    0xdf XorIntLit8 "xor-int/lit8" F22b None;
    0xe0 ShlIntLit8 "shl-int/lit8" F22b None;
    0xe1 ShrIntLit8 "shr-int/lit8" F22b None;
    0xe2 UshrIntLit8 "ushr-int/lit8" F22b None;
    0xe3 IgetVolatile "iget-volatile" F22c FieldRef;
    0xe4 IputVolatile "iput-volatile" F22c FieldRef;
    0xe5 SgetVolatile "sget-volatile" F21c FieldRef;
    0xe6 SputVolatile "sput-volatile" F21c FieldRef;
    0xe7 IgetObjectVolatile "iget-object-volatile" F22c FieldRef;
    0xe8 IgetWideVolatile "iget-wide-volatile" F22c FieldRef;
    0xe9 IputWideVolatile "iput-wide-volatile" F22c FieldRef;
    0xea SgetWideVolatile "sget-wide-volatile" F21c FieldRef;
    0xeb SputWideVolatile "sput-wide-volatile" F21c FieldRef;
    0xec Breakpoint "breakpoint" F10x Unknown;
    0xed ThrowVerificationError "throw-verification-error" F20bc VarRef;
    0xee ExecuteInline "execute-inline" F35mi InlineMethod;
    0xef ExecuteInlineRange "execute-inline/range" F3rmi InlineMethod;
    0xf0 InvokeObjectInitRange "invoke-object-init/range" F3rc MethodRef;
    0xf1 ReturnVoidBarrier "return-void-barrier" F10x None;
    0xf2 IgetQuick "iget-quick" F22cs FieldOffset;
    0xf3 IgetWideQuick "iget-wide-quick" F22cs FieldOffset;
    0xf4 IgetObjectQuick "iget-object-quick" F22cs FieldOffset;
    0xf5 IputQuick "iput-quick" F22cs FieldOffset;
    0xf6 IputWideQuick "iput-wide-quick" F22cs FieldOffset;
    0xf7 IputObjectQuick "iput-object-quick" F22cs FieldOffset;
    0xf8 InvokeVirtualQuick "invoke-virtual-quick" F35ms VtableOffset;
    0xf9 InvokeVirtualQuickRange "invoke-virtual-quick/range" F3rms VtableOffset;
    0xfa InvokeSuperQuick "invoke-super-quick" F35ms VtableOffset;
    0xfb InvokeSuperQuickRange "invoke-super-quick/range" F3rms VtableOffset;
    0xfc IputObjectVolatile "iput-object-volatile" F22c FieldRef;
    0xfd SgetObjectVolatile "sget-object-volatile" F21c FieldRef;
    0xfe SputObjectVolatile "sput-object-volatile" F21c FieldRef;
    0xff UnusedFf "unused-ff" F10x Unknown;
}

impl Opcode {
    pub fn from_u8(value: u8) -> Self {
        OPCODE_TABLE[value as usize].0
    }

    pub fn mnemonic(self) -> &'static str {
        OPCODE_TABLE[self as usize].1
    }

    pub fn format(self) -> Format {
        OPCODE_TABLE[self as usize].2
    }

    pub fn index_kind(self) -> IndexKind {
        OPCODE_TABLE[self as usize].3
    }

    /// Fixed width in code units. Payload pseudo-instructions are sized by the decoder.
    pub fn width(self) -> usize {
        self.format().width()
    }

    pub fn parse_mnemonic(op: &str) -> Option<Self> {
        OPCODE_TABLE
            .iter()
            .find(|(opcode, text, _, _)| *text == op && !opcode.is_unused())
            .map(|(opcode, _, _, _)| *opcode)
    }

    pub fn is_unused(self) -> bool {
        self.index_kind() == IndexKind::Unknown && self != Opcode::Breakpoint
    }

    pub fn flags(self) -> u8 {
        use Opcode::*;
        let value = self as u8;
        match self {
            Nop | Move | MoveFrom16 | Move16 | MoveWide | MoveWideFrom16 | MoveWide16
            | MoveObject | MoveObjectFrom16 | MoveObject16 | MoveResult | MoveResultWide
            | MoveResultObject | MoveException | Const4 | Const16 | Const | ConstHigh16
            | ConstWide16 | ConstWide32 | ConstWide | ConstWideHigh16 | CmplFloat | CmpgFloat
            | CmplDouble | CmpgDouble | CmpLong | Breakpoint => CAN_CONTINUE,
            ReturnVoid | Return | ReturnWide | ReturnObject | ReturnVoidBarrier => CAN_RETURN,
            Throw | ThrowVerificationError => CAN_THROW,
            Goto | Goto16 | Goto32 => CAN_BRANCH,
            PackedSwitch | SparseSwitch => CAN_SWITCH | CAN_CONTINUE,
            IfEq | IfNe | IfLt | IfGe | IfGt | IfLe | IfEqz | IfNez | IfLtz | IfGez | IfGtz
            | IfLez => CAN_BRANCH | CAN_CONTINUE,
            InvokeVirtual | InvokeSuper | InvokeDirect | InvokeStatic | InvokeInterface
            | InvokeVirtualRange | InvokeSuperRange | InvokeDirectRange | InvokeStaticRange
            | InvokeInterfaceRange | InvokeObjectInitRange | InvokeVirtualQuick
            | InvokeVirtualQuickRange | InvokeSuperQuick | InvokeSuperQuickRange
            | ExecuteInline | ExecuteInlineRange => CAN_CONTINUE | CAN_THROW | INVOKE,
            _ if self.is_unused() => 0,
            // Unary ops, conversions and the non-dividing binary ops cannot throw.
            _ if (0x7b..=0x8f).contains(&value) => CAN_CONTINUE,
            DivInt | RemInt | DivLong | RemLong | DivInt2Addr | RemInt2Addr | DivLong2Addr
            | RemLong2Addr | DivIntLit16 | RemIntLit16 | DivIntLit8 | RemIntLit8 => {
                CAN_CONTINUE | CAN_THROW
            }
            _ if (0x90..=0xe2).contains(&value) => CAN_CONTINUE,
            _ => CAN_CONTINUE | CAN_THROW,
        }
    }

    pub fn can_branch(self) -> bool {
        self.flags() & CAN_BRANCH != 0
    }

    pub fn can_continue(self) -> bool {
        self.flags() & CAN_CONTINUE != 0
    }

    pub fn can_switch(self) -> bool {
        self.flags() & CAN_SWITCH != 0
    }

    pub fn can_throw(self) -> bool {
        self.flags() & CAN_THROW != 0
    }

    pub fn is_return(self) -> bool {
        self.flags() & CAN_RETURN != 0
    }

    pub fn is_invoke(self) -> bool {
        self.flags() & INVOKE != 0
    }

    /// True for instructions that end a basic block.
    pub fn ends_block(self) -> bool {
        let flags = self.flags();
        flags & (CAN_BRANCH | CAN_SWITCH | CAN_RETURN | INVOKE) != 0
            || flags & CAN_CONTINUE == 0
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_slots_match_discriminants() {
        for (index, (opcode, _, _, _)) in OPCODE_TABLE.iter().enumerate() {
            assert_eq!(*opcode as usize, index);
        }
    }

    #[test]
    fn mnemonics_round_trip_for_used_opcodes() {
        for value in 0..=255u8 {
            let opcode = Opcode::from_u8(value);
            if opcode.is_unused() {
                assert_eq!(Opcode::parse_mnemonic(opcode.mnemonic()), None);
                continue;
            }
            assert_eq!(Opcode::parse_mnemonic(opcode.mnemonic()), Some(opcode));
        }
    }

    #[test]
    fn widths_follow_formats() {
        assert_eq!(Opcode::Nop.width(), 1);
        assert_eq!(Opcode::AddInt.width(), 2);
        assert_eq!(Opcode::Const.width(), 3);
        assert_eq!(Opcode::ConstWide.width(), 5);
        assert_eq!(Opcode::InvokeStatic.width(), 3);
        assert_eq!(Opcode::AddIntLit8.width(), 2);
    }

    #[test]
    fn control_flags() {
        assert!(Opcode::IfEq.can_branch() && Opcode::IfEq.can_continue());
        assert!(!Opcode::Goto.can_continue());
        assert!(Opcode::Return.is_return());
        assert!(Opcode::DivInt.can_throw());
        assert!(!Opcode::AddInt.can_throw());
        assert!(Opcode::InvokeVirtual.is_invoke());
        assert!(Opcode::PackedSwitch.can_switch());
        assert!(Opcode::Throw.ends_block());
        assert!(!Opcode::Move.ends_block());
    }
}
