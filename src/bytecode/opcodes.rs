//! Guest opcodes and the static instruction classifier
//!
//! The guest format follows the CPython 3.8 numbering for the subset of
//! instructions the tracer understands, plus `PUSH_NULL` for call forms
//! that need a sentinel ahead of the callable. Every instruction is three
//! bytes wide: the opcode byte followed by a big-endian `u16` argument.
//!
//! The classification tables below are pure data. The stack-depth pass and
//! the tracer's dispatch consult them instead of matching mnemonics inline.

use std::fmt;

/// Opcodes at or above this value use their argument.
pub const HAVE_ARGUMENT: u8 = 90;

/// Width of one encoded instruction in bytes.
pub const INSTR_SIZE: usize = 3;

/// Guest opcode enumeration
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Opcode {
    // === Stack Operations ===
    PopTop = 1,
    RotTwo = 2,
    RotThree = 3,
    DupTop = 4,
    Nop = 9,
    /// Push the null sentinel used by method-style calls
    PushNull = 48,

    // === Unary ===
    UnaryPositive = 10,
    UnaryNegative = 11,
    UnaryNot = 12,
    UnaryInvert = 15,

    // === Binary ===
    BinaryMatrixMultiply = 16,
    InplaceMatrixMultiply = 17,
    BinaryPower = 19,
    BinaryMultiply = 20,
    BinaryModulo = 22,
    BinaryAdd = 23,
    BinarySubtract = 24,
    BinarySubscr = 25,
    BinaryFloorDivide = 26,
    BinaryTrueDivide = 27,
    InplaceFloorDivide = 28,
    InplaceTrueDivide = 29,
    InplaceAdd = 55,
    InplaceSubtract = 56,
    InplaceMultiply = 57,
    InplaceModulo = 59,
    StoreSubscr = 60,
    InplacePower = 67,

    // === Iteration / Return ===
    GetIter = 68,
    ReturnValue = 83,

    // === With argument ===
    UnpackSequence = 92,
    ForIter = 93,
    UnpackEx = 94,
    StoreAttr = 95,
    StoreGlobal = 97,
    LoadConst = 100,
    LoadName = 101,
    BuildTuple = 102,
    BuildList = 103,
    BuildMap = 105,
    LoadAttr = 106,
    CompareOp = 107,
    ImportName = 108,
    ImportFrom = 109,
    JumpForward = 110,
    JumpIfFalseOrPop = 111,
    JumpIfTrueOrPop = 112,
    JumpAbsolute = 113,
    PopJumpIfFalse = 114,
    PopJumpIfTrue = 115,
    LoadGlobal = 116,
    LoadFast = 124,
    StoreFast = 125,
    DeleteFast = 126,
    CallFunction = 131,
    MakeFunction = 132,
    BuildSlice = 133,
    LoadClosure = 135,
    LoadDeref = 136,
    StoreDeref = 137,
    LoadClassDeref = 148,
    LoadMethod = 160,
    CallMethod = 161,
}

pub const UNARY: &[Opcode] = &[
    Opcode::UnaryPositive,
    Opcode::UnaryNegative,
    Opcode::UnaryNot,
    Opcode::UnaryInvert,
];

pub const BINARY: &[Opcode] = &[
    Opcode::BinaryMatrixMultiply,
    Opcode::BinaryPower,
    Opcode::BinaryMultiply,
    Opcode::BinaryModulo,
    Opcode::BinaryAdd,
    Opcode::BinarySubtract,
    Opcode::BinarySubscr,
    Opcode::BinaryFloorDivide,
    Opcode::BinaryTrueDivide,
];

pub const INPLACE: &[Opcode] = &[
    Opcode::InplaceMatrixMultiply,
    Opcode::InplaceFloorDivide,
    Opcode::InplaceTrueDivide,
    Opcode::InplaceAdd,
    Opcode::InplaceSubtract,
    Opcode::InplaceMultiply,
    Opcode::InplaceModulo,
    Opcode::InplacePower,
];

pub const CALL: &[Opcode] = &[Opcode::CallFunction, Opcode::CallMethod];

pub const COMPARE: &[Opcode] = &[Opcode::CompareOp];

pub const IMPORT: &[Opcode] = &[Opcode::ImportName, Opcode::ImportFrom];

pub const ITER: &[Opcode] = &[Opcode::GetIter, Opcode::ForIter];

pub const LOAD: &[Opcode] = &[
    Opcode::LoadAttr,
    Opcode::LoadClassDeref,
    Opcode::LoadClosure,
    Opcode::LoadConst,
    Opcode::LoadDeref,
    Opcode::LoadFast,
    Opcode::LoadGlobal,
    Opcode::LoadMethod,
    Opcode::LoadName,
];

pub const MAKE_FUNCTION: &[Opcode] = &[Opcode::MakeFunction];

pub const UNPACK: &[Opcode] = &[Opcode::UnpackSequence, Opcode::UnpackEx];

pub const RETURN: &[Opcode] = &[Opcode::ReturnValue];

/// Instructions that push exactly one value.
pub const PUSH_ONE: &[Opcode] = &[
    // unary
    Opcode::UnaryPositive,
    Opcode::UnaryNegative,
    Opcode::UnaryNot,
    Opcode::UnaryInvert,
    // binary
    Opcode::BinaryMatrixMultiply,
    Opcode::BinaryPower,
    Opcode::BinaryMultiply,
    Opcode::BinaryModulo,
    Opcode::BinaryAdd,
    Opcode::BinarySubtract,
    Opcode::BinarySubscr,
    Opcode::BinaryFloorDivide,
    Opcode::BinaryTrueDivide,
    // inplace
    Opcode::InplaceMatrixMultiply,
    Opcode::InplaceFloorDivide,
    Opcode::InplaceTrueDivide,
    Opcode::InplaceAdd,
    Opcode::InplaceSubtract,
    Opcode::InplaceMultiply,
    Opcode::InplaceModulo,
    Opcode::InplacePower,
    // call, compare, import, iter
    Opcode::CallFunction,
    Opcode::CallMethod,
    Opcode::CompareOp,
    Opcode::ImportName,
    Opcode::ImportFrom,
    Opcode::GetIter,
    Opcode::ForIter,
    // load
    Opcode::LoadAttr,
    Opcode::LoadClassDeref,
    Opcode::LoadClosure,
    Opcode::LoadConst,
    Opcode::LoadDeref,
    Opcode::LoadFast,
    Opcode::LoadGlobal,
    Opcode::LoadMethod,
    Opcode::LoadName,
    // function construction
    Opcode::MakeFunction,
];

/// Instructions whose number of pushed values depends on their argument.
pub const PUSH_ARG: &[Opcode] = UNPACK;

pub const REL_JUMP: &[Opcode] = &[Opcode::ForIter, Opcode::JumpForward];

pub const ABS_JUMP: &[Opcode] = &[
    Opcode::JumpIfFalseOrPop,
    Opcode::JumpIfTrueOrPop,
    Opcode::JumpAbsolute,
    Opcode::PopJumpIfFalse,
    Opcode::PopJumpIfTrue,
];

pub const UNCONDITIONAL_JUMP: &[Opcode] = &[Opcode::JumpAbsolute, Opcode::JumpForward];

pub const HAS_LOCAL: &[Opcode] = &[Opcode::LoadFast, Opcode::StoreFast, Opcode::DeleteFast];

pub const HAS_FREE: &[Opcode] = &[
    Opcode::LoadClosure,
    Opcode::LoadDeref,
    Opcode::StoreDeref,
    Opcode::LoadClassDeref,
];

/// Instructions whose argument indexes the name pool
pub const HAS_NAME: &[Opcode] = &[
    Opcode::StoreAttr,
    Opcode::StoreGlobal,
    Opcode::LoadName,
    Opcode::LoadAttr,
    Opcode::ImportName,
    Opcode::ImportFrom,
    Opcode::LoadGlobal,
    Opcode::LoadMethod,
];

/// Every opcode, in numeric order.
pub const ALL: &[Opcode] = &[
    Opcode::PopTop,
    Opcode::RotTwo,
    Opcode::RotThree,
    Opcode::DupTop,
    Opcode::Nop,
    Opcode::UnaryPositive,
    Opcode::UnaryNegative,
    Opcode::UnaryNot,
    Opcode::UnaryInvert,
    Opcode::BinaryMatrixMultiply,
    Opcode::InplaceMatrixMultiply,
    Opcode::BinaryPower,
    Opcode::BinaryMultiply,
    Opcode::BinaryModulo,
    Opcode::BinaryAdd,
    Opcode::BinarySubtract,
    Opcode::BinarySubscr,
    Opcode::BinaryFloorDivide,
    Opcode::BinaryTrueDivide,
    Opcode::InplaceFloorDivide,
    Opcode::InplaceTrueDivide,
    Opcode::PushNull,
    Opcode::InplaceAdd,
    Opcode::InplaceSubtract,
    Opcode::InplaceMultiply,
    Opcode::InplaceModulo,
    Opcode::StoreSubscr,
    Opcode::InplacePower,
    Opcode::GetIter,
    Opcode::ReturnValue,
    Opcode::UnpackSequence,
    Opcode::ForIter,
    Opcode::UnpackEx,
    Opcode::StoreAttr,
    Opcode::StoreGlobal,
    Opcode::LoadConst,
    Opcode::LoadName,
    Opcode::BuildTuple,
    Opcode::BuildList,
    Opcode::BuildMap,
    Opcode::LoadAttr,
    Opcode::CompareOp,
    Opcode::ImportName,
    Opcode::ImportFrom,
    Opcode::JumpForward,
    Opcode::JumpIfFalseOrPop,
    Opcode::JumpIfTrueOrPop,
    Opcode::JumpAbsolute,
    Opcode::PopJumpIfFalse,
    Opcode::PopJumpIfTrue,
    Opcode::LoadGlobal,
    Opcode::LoadFast,
    Opcode::StoreFast,
    Opcode::DeleteFast,
    Opcode::CallFunction,
    Opcode::MakeFunction,
    Opcode::BuildSlice,
    Opcode::LoadClosure,
    Opcode::LoadDeref,
    Opcode::StoreDeref,
    Opcode::LoadClassDeref,
    Opcode::LoadMethod,
    Opcode::CallMethod,
];

impl Opcode {
    /// Convert a byte to an opcode
    #[inline]
    pub fn from_byte(byte: u8) -> Option<Self> {
        OPCODE_TABLE[byte as usize]
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Look up an opcode by its mnemonic (`"LOAD_FAST"`)
    pub fn from_mnemonic(name: &str) -> Option<Self> {
        ALL.iter().copied().find(|op| op.mnemonic() == name)
    }

    #[inline]
    pub fn has_argument(self) -> bool {
        self.to_byte() >= HAVE_ARGUMENT
    }

    #[inline]
    pub fn in_set(self, set: &[Opcode]) -> bool {
        set.contains(&self)
    }

    #[inline]
    pub fn is_rel_jump(self) -> bool {
        self.in_set(REL_JUMP)
    }

    #[inline]
    pub fn is_abs_jump(self) -> bool {
        self.in_set(ABS_JUMP)
    }

    /// Check if this opcode carries a jump target
    #[inline]
    pub fn is_jump(self) -> bool {
        self.is_rel_jump() || self.is_abs_jump()
    }

    #[inline]
    pub fn is_unconditional_jump(self) -> bool {
        self.in_set(UNCONDITIONAL_JUMP)
    }

    /// Control never falls through to the next instruction
    #[inline]
    pub fn is_terminator(self) -> bool {
        self.in_set(RETURN) || self.is_unconditional_jump()
    }

    #[inline]
    pub fn is_call(self) -> bool {
        self.in_set(CALL)
    }

    #[inline]
    pub fn has_local(self) -> bool {
        self.in_set(HAS_LOCAL)
    }

    #[inline]
    pub fn has_free(self) -> bool {
        self.in_set(HAS_FREE)
    }

    #[inline]
    pub fn has_name(self) -> bool {
        self.in_set(HAS_NAME)
    }

    /// Net stack effect (pushed minus popped).
    ///
    /// `jump` selects the edge for instructions that behave differently on
    /// the taken and fallthrough paths: `Some(true)` is the taken edge,
    /// `Some(false)` the fallthrough edge, and `None` the maximum of both.
    pub fn stack_effect(self, arg: u32, jump: Option<bool>) -> i32 {
        let arg = arg as i32;
        match self {
            Opcode::Nop | Opcode::RotTwo | Opcode::RotThree => 0,
            Opcode::PopTop => -1,
            Opcode::DupTop | Opcode::PushNull => 1,

            Opcode::UnaryPositive
            | Opcode::UnaryNegative
            | Opcode::UnaryNot
            | Opcode::UnaryInvert => 0,

            Opcode::BinaryMatrixMultiply
            | Opcode::BinaryPower
            | Opcode::BinaryMultiply
            | Opcode::BinaryModulo
            | Opcode::BinaryAdd
            | Opcode::BinarySubtract
            | Opcode::BinarySubscr
            | Opcode::BinaryFloorDivide
            | Opcode::BinaryTrueDivide
            | Opcode::InplaceMatrixMultiply
            | Opcode::InplaceFloorDivide
            | Opcode::InplaceTrueDivide
            | Opcode::InplaceAdd
            | Opcode::InplaceSubtract
            | Opcode::InplaceMultiply
            | Opcode::InplaceModulo
            | Opcode::InplacePower => -1,

            Opcode::StoreSubscr => -3,
            Opcode::GetIter => 0,
            Opcode::ReturnValue => -1,

            Opcode::UnpackSequence => arg - 1,
            Opcode::UnpackEx => (arg & 0xFF) + (arg >> 8),
            // Exhaustion pops the iterator, otherwise the next item is pushed.
            Opcode::ForIter => match jump {
                Some(true) => -1,
                _ => 1,
            },

            Opcode::StoreAttr => -2,
            Opcode::StoreGlobal | Opcode::StoreFast | Opcode::StoreDeref => -1,
            Opcode::DeleteFast => 0,

            Opcode::LoadConst
            | Opcode::LoadName
            | Opcode::LoadGlobal
            | Opcode::LoadFast
            | Opcode::LoadClosure
            | Opcode::LoadDeref
            | Opcode::LoadClassDeref => 1,
            Opcode::LoadAttr => 0,
            Opcode::LoadMethod => 1,

            Opcode::BuildTuple | Opcode::BuildList | Opcode::BuildSlice => 1 - arg,
            Opcode::BuildMap => 1 - 2 * arg,

            Opcode::CompareOp => -1,
            Opcode::ImportName => -1,
            Opcode::ImportFrom => 1,

            Opcode::JumpForward | Opcode::JumpAbsolute => 0,
            Opcode::JumpIfFalseOrPop | Opcode::JumpIfTrueOrPop => match jump {
                Some(false) => -1,
                _ => 0,
            },
            Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue => -1,

            Opcode::CallFunction => -arg,
            Opcode::CallMethod => -arg - 1,
            Opcode::MakeFunction => -1 - (arg & 0x0F).count_ones() as i32,
        }
    }

    /// Get the instruction mnemonic for disassembly
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::PopTop => "POP_TOP",
            Self::RotTwo => "ROT_TWO",
            Self::RotThree => "ROT_THREE",
            Self::DupTop => "DUP_TOP",
            Self::Nop => "NOP",
            Self::PushNull => "PUSH_NULL",
            Self::UnaryPositive => "UNARY_POSITIVE",
            Self::UnaryNegative => "UNARY_NEGATIVE",
            Self::UnaryNot => "UNARY_NOT",
            Self::UnaryInvert => "UNARY_INVERT",
            Self::BinaryMatrixMultiply => "BINARY_MATRIX_MULTIPLY",
            Self::InplaceMatrixMultiply => "INPLACE_MATRIX_MULTIPLY",
            Self::BinaryPower => "BINARY_POWER",
            Self::BinaryMultiply => "BINARY_MULTIPLY",
            Self::BinaryModulo => "BINARY_MODULO",
            Self::BinaryAdd => "BINARY_ADD",
            Self::BinarySubtract => "BINARY_SUBTRACT",
            Self::BinarySubscr => "BINARY_SUBSCR",
            Self::BinaryFloorDivide => "BINARY_FLOOR_DIVIDE",
            Self::BinaryTrueDivide => "BINARY_TRUE_DIVIDE",
            Self::InplaceFloorDivide => "INPLACE_FLOOR_DIVIDE",
            Self::InplaceTrueDivide => "INPLACE_TRUE_DIVIDE",
            Self::InplaceAdd => "INPLACE_ADD",
            Self::InplaceSubtract => "INPLACE_SUBTRACT",
            Self::InplaceMultiply => "INPLACE_MULTIPLY",
            Self::InplaceModulo => "INPLACE_MODULO",
            Self::StoreSubscr => "STORE_SUBSCR",
            Self::InplacePower => "INPLACE_POWER",
            Self::GetIter => "GET_ITER",
            Self::ReturnValue => "RETURN_VALUE",
            Self::UnpackSequence => "UNPACK_SEQUENCE",
            Self::ForIter => "FOR_ITER",
            Self::UnpackEx => "UNPACK_EX",
            Self::StoreAttr => "STORE_ATTR",
            Self::StoreGlobal => "STORE_GLOBAL",
            Self::LoadConst => "LOAD_CONST",
            Self::LoadName => "LOAD_NAME",
            Self::BuildTuple => "BUILD_TUPLE",
            Self::BuildList => "BUILD_LIST",
            Self::BuildMap => "BUILD_MAP",
            Self::LoadAttr => "LOAD_ATTR",
            Self::CompareOp => "COMPARE_OP",
            Self::ImportName => "IMPORT_NAME",
            Self::ImportFrom => "IMPORT_FROM",
            Self::JumpForward => "JUMP_FORWARD",
            Self::JumpIfFalseOrPop => "JUMP_IF_FALSE_OR_POP",
            Self::JumpIfTrueOrPop => "JUMP_IF_TRUE_OR_POP",
            Self::JumpAbsolute => "JUMP_ABSOLUTE",
            Self::PopJumpIfFalse => "POP_JUMP_IF_FALSE",
            Self::PopJumpIfTrue => "POP_JUMP_IF_TRUE",
            Self::LoadGlobal => "LOAD_GLOBAL",
            Self::LoadFast => "LOAD_FAST",
            Self::StoreFast => "STORE_FAST",
            Self::DeleteFast => "DELETE_FAST",
            Self::CallFunction => "CALL_FUNCTION",
            Self::MakeFunction => "MAKE_FUNCTION",
            Self::BuildSlice => "BUILD_SLICE",
            Self::LoadClosure => "LOAD_CLOSURE",
            Self::LoadDeref => "LOAD_DEREF",
            Self::StoreDeref => "STORE_DEREF",
            Self::LoadClassDeref => "LOAD_CLASSDEREF",
            Self::LoadMethod => "LOAD_METHOD",
            Self::CallMethod => "CALL_METHOD",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}

/// Comparison operators carried by `COMPARE_OP`, indexed like `dis.cmp_op`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Lt = 0,
    Le = 1,
    Eq = 2,
    Ne = 3,
    Gt = 4,
    Ge = 5,
}

impl CompareOp {
    pub fn from_arg(arg: u32) -> Option<Self> {
        match arg {
            0 => Some(Self::Lt),
            1 => Some(Self::Le),
            2 => Some(Self::Eq),
            3 => Some(Self::Ne),
            4 => Some(Self::Gt),
            5 => Some(Self::Ge),
            _ => None,
        }
    }

    pub fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "<" => Some(Self::Lt),
            "<=" => Some(Self::Le),
            "==" => Some(Self::Eq),
            "!=" => Some(Self::Ne),
            ">" => Some(Self::Gt),
            ">=" => Some(Self::Ge),
            _ => None,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

/// Lookup table for byte -> Opcode conversion
static OPCODE_TABLE: [Option<Opcode>; 256] = {
    let mut table = [None; 256];
    let mut i = 0;
    while i < ALL.len() {
        table[ALL[i] as usize] = Some(ALL[i]);
        i += 1;
    }
    table
};
