//! Bytecode opcodes and their static stack effects.
//!
//! The opcode set is closed: every mnemonic the decoder can hand us is a variant here,
//! including the ones the translator refuses to lower. Stack effects are fixed per
//! opcode (parameterised by the operand for the counted forms) and drive both the
//! translator's static depth tracking and the property tests.

use std::fmt;

/// Kind of operand an opcode carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    None,
    /// Index into the constant pool.
    Const,
    /// Index into the name pool.
    Name,
    /// Index into the fast locals.
    Local,
    /// Index into cellvars followed by freevars.
    Cell,
    /// Element or argument count.
    Count,
    /// Comparison operator number.
    Compare,
    /// Jump target (resolved instruction index).
    Jump,
    /// Packed positional/keyword argument counts.
    CallArgs,
}

/// Net stack behaviour of one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackEffect {
    pub pops: usize,
    pub pushes: usize,
    /// Depth change along the jump edge relative to the depth before the instruction.
    pub on_branch: Option<isize>,
    /// Whether control continues with the next instruction.
    pub falls_through: bool,
}

impl StackEffect {
    const fn straight(pops: usize, pushes: usize) -> Self {
        Self {
            pops,
            pushes,
            on_branch: None,
            falls_through: true,
        }
    }

    const fn branch(pops: usize, pushes: usize, on_branch: isize, falls_through: bool) -> Self {
        Self {
            pops,
            pushes,
            on_branch: Some(on_branch),
            falls_through,
        }
    }

    const fn terminal(pops: usize) -> Self {
        Self {
            pops,
            pushes: 0,
            on_branch: None,
            falls_through: false,
        }
    }

    /// Depth change on the fall-through edge.
    pub fn net(&self) -> isize {
        self.pushes as isize - self.pops as isize
    }
}

/// Comparison operators carried by `COMPARE_OP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Eq,
    Ne,
    Gt,
    Ge,
    In,
    NotIn,
    Is,
    IsNot,
    ExcMatch,
}

impl CmpOp {
    pub const ALL: [CmpOp; 11] = [
        CmpOp::Lt,
        CmpOp::Le,
        CmpOp::Eq,
        CmpOp::Ne,
        CmpOp::Gt,
        CmpOp::Ge,
        CmpOp::In,
        CmpOp::NotIn,
        CmpOp::Is,
        CmpOp::IsNot,
        CmpOp::ExcMatch,
    ];

    pub fn from_arg(arg: i32) -> Option<Self> {
        usize::try_from(arg).ok().and_then(|i| Self::ALL.get(i).copied())
    }

    pub fn arg(self) -> i32 {
        self as i32
    }

    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::In => "in",
            CmpOp::NotIn => "not in",
            CmpOp::Is => "is",
            CmpOp::IsNot => "is not",
            CmpOp::ExcMatch => "exception match",
        }
    }

    pub fn from_symbol(s: &str) -> Option<Self> {
        let normalized = s.split_whitespace().collect::<Vec<_>>().join(" ");
        Self::ALL.iter().copied().find(|op| op.symbol() == normalized)
    }
}

macro_rules! opcodes {
    ($( $variant:ident = $name:literal, $kind:ident, $supported:literal; )*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $( $variant, )*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[ $( Opcode::$variant, )* ];

            pub const fn name(self) -> &'static str {
                match self {
                    $( Opcode::$variant => $name, )*
                }
            }

            pub const fn operand_kind(self) -> OperandKind {
                match self {
                    $( Opcode::$variant => OperandKind::$kind, )*
                }
            }

            /// Whether the translator lowers this opcode.
            pub const fn is_supported(self) -> bool {
                match self {
                    $( Opcode::$variant => $supported, )*
                }
            }
        }
    };
}

opcodes! {
    Nop = "NOP", None, true;
    PopTop = "POP_TOP", None, true;
    RotTwo = "ROT_TWO", None, true;
    RotThree = "ROT_THREE", None, true;
    RotFour = "ROT_FOUR", None, true;
    DupTop = "DUP_TOP", None, true;
    DupTopX = "DUP_TOPX", Count, true;

    UnaryPositive = "UNARY_POSITIVE", None, true;
    UnaryNegative = "UNARY_NEGATIVE", None, true;
    UnaryNot = "UNARY_NOT", None, true;
    UnaryConvert = "UNARY_CONVERT", None, true;
    UnaryInvert = "UNARY_INVERT", None, true;

    BinaryPower = "BINARY_POWER", None, true;
    BinaryMultiply = "BINARY_MULTIPLY", None, true;
    BinaryDivide = "BINARY_DIVIDE", None, true;
    BinaryModulo = "BINARY_MODULO", None, true;
    BinaryAdd = "BINARY_ADD", None, true;
    BinarySubtract = "BINARY_SUBTRACT", None, true;
    BinarySubscr = "BINARY_SUBSCR", None, true;
    BinaryFloorDivide = "BINARY_FLOOR_DIVIDE", None, true;
    BinaryTrueDivide = "BINARY_TRUE_DIVIDE", None, true;
    BinaryLshift = "BINARY_LSHIFT", None, true;
    BinaryRshift = "BINARY_RSHIFT", None, true;
    BinaryAnd = "BINARY_AND", None, true;
    BinaryXor = "BINARY_XOR", None, true;
    BinaryOr = "BINARY_OR", None, true;

    InplacePower = "INPLACE_POWER", None, true;
    InplaceMultiply = "INPLACE_MULTIPLY", None, true;
    InplaceDivide = "INPLACE_DIVIDE", None, true;
    InplaceModulo = "INPLACE_MODULO", None, true;
    InplaceAdd = "INPLACE_ADD", None, true;
    InplaceSubtract = "INPLACE_SUBTRACT", None, true;
    InplaceFloorDivide = "INPLACE_FLOOR_DIVIDE", None, true;
    InplaceTrueDivide = "INPLACE_TRUE_DIVIDE", None, true;
    InplaceLshift = "INPLACE_LSHIFT", None, true;
    InplaceRshift = "INPLACE_RSHIFT", None, true;
    InplaceAnd = "INPLACE_AND", None, true;
    InplaceXor = "INPLACE_XOR", None, true;
    InplaceOr = "INPLACE_OR", None, true;

    Slice0 = "SLICE+0", None, true;
    Slice1 = "SLICE+1", None, true;
    Slice2 = "SLICE+2", None, true;
    Slice3 = "SLICE+3", None, true;
    StoreSlice0 = "STORE_SLICE+0", None, true;
    StoreSlice1 = "STORE_SLICE+1", None, true;
    StoreSlice2 = "STORE_SLICE+2", None, true;
    StoreSlice3 = "STORE_SLICE+3", None, true;
    DeleteSlice0 = "DELETE_SLICE+0", None, true;
    DeleteSlice1 = "DELETE_SLICE+1", None, true;
    DeleteSlice2 = "DELETE_SLICE+2", None, true;
    DeleteSlice3 = "DELETE_SLICE+3", None, true;

    StoreSubscr = "STORE_SUBSCR", None, true;
    DeleteSubscr = "DELETE_SUBSCR", None, true;
    StoreMap = "STORE_MAP", None, true;
    ListAppend = "LIST_APPEND", None, true;
    GetIter = "GET_ITER", None, true;
    ForIter = "FOR_ITER", Jump, true;
    ReturnValue = "RETURN_VALUE", None, true;
    RaiseVarargs = "RAISE_VARARGS", Count, true;
    PopBlock = "POP_BLOCK", None, true;
    SetupLoop = "SETUP_LOOP", Jump, true;
    UnpackSequence = "UNPACK_SEQUENCE", Count, true;

    StoreAttr = "STORE_ATTR", Name, true;
    DeleteAttr = "DELETE_ATTR", Name, true;
    LoadAttr = "LOAD_ATTR", Name, true;
    StoreGlobal = "STORE_GLOBAL", Name, true;
    DeleteGlobal = "DELETE_GLOBAL", Name, true;
    LoadGlobal = "LOAD_GLOBAL", Name, true;
    LoadConst = "LOAD_CONST", Const, true;

    BuildTuple = "BUILD_TUPLE", Count, true;
    BuildList = "BUILD_LIST", Count, true;
    BuildMap = "BUILD_MAP", Count, true;
    BuildSlice = "BUILD_SLICE", Count, true;
    CompareOp = "COMPARE_OP", Compare, true;

    JumpForward = "JUMP_FORWARD", Jump, true;
    JumpAbsolute = "JUMP_ABSOLUTE", Jump, true;
    PopJumpIfFalse = "POP_JUMP_IF_FALSE", Jump, true;
    PopJumpIfTrue = "POP_JUMP_IF_TRUE", Jump, true;
    JumpIfFalseOrPop = "JUMP_IF_FALSE_OR_POP", Jump, true;
    JumpIfTrueOrPop = "JUMP_IF_TRUE_OR_POP", Jump, true;

    LoadFast = "LOAD_FAST", Local, true;
    StoreFast = "STORE_FAST", Local, true;
    DeleteFast = "DELETE_FAST", Local, true;
    LoadClosure = "LOAD_CLOSURE", Cell, true;
    LoadDeref = "LOAD_DEREF", Cell, true;
    StoreDeref = "STORE_DEREF", Cell, true;

    CallFunction = "CALL_FUNCTION", CallArgs, true;
    CallFunctionVarKw = "CALL_FUNCTION_VAR_KW", CallArgs, true;

    // Recognized, never lowered.
    SetupExcept = "SETUP_EXCEPT", Jump, false;
    SetupFinally = "SETUP_FINALLY", Jump, false;
    EndFinally = "END_FINALLY", None, false;
    BreakLoop = "BREAK_LOOP", None, false;
    ContinueLoop = "CONTINUE_LOOP", Jump, false;
    WithCleanup = "WITH_CLEANUP", None, false;
    YieldValue = "YIELD_VALUE", None, false;
    LoadName = "LOAD_NAME", Name, false;
    StoreName = "STORE_NAME", Name, false;
    DeleteName = "DELETE_NAME", Name, false;
    ImportName = "IMPORT_NAME", Name, false;
    ImportFrom = "IMPORT_FROM", Name, false;
    MakeFunction = "MAKE_FUNCTION", Count, false;
    MakeClosure = "MAKE_CLOSURE", Count, false;
    CallFunctionVar = "CALL_FUNCTION_VAR", CallArgs, false;
    CallFunctionKw = "CALL_FUNCTION_KW", CallArgs, false;
    PrintItem = "PRINT_ITEM", None, false;
    PrintNewline = "PRINT_NEWLINE", None, false;
    ExtendedArg = "EXTENDED_ARG", Count, false;
}

/// Split a packed call operand into (positional, keyword) counts.
pub fn call_counts(arg: i32) -> (usize, usize) {
    ((arg & 0xff) as usize, ((arg >> 8) & 0xff) as usize)
}

/// Static properties of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpcodeInfo {
    pub name: &'static str,
    pub operand: OperandKind,
    pub supported: bool,
}

impl Opcode {
    pub const fn info(self) -> OpcodeInfo {
        OpcodeInfo {
            name: self.name(),
            operand: self.operand_kind(),
            supported: self.is_supported(),
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| op.name() == name)
    }

    /// Whether the opcode ends a basic block.
    pub fn is_control_transfer(self) -> bool {
        matches!(
            self,
            Opcode::JumpForward
                | Opcode::JumpAbsolute
                | Opcode::PopJumpIfFalse
                | Opcode::PopJumpIfTrue
                | Opcode::JumpIfFalseOrPop
                | Opcode::JumpIfTrueOrPop
                | Opcode::ForIter
                | Opcode::ReturnValue
                | Opcode::RaiseVarargs
        )
    }

    /// Stack effect for a supported opcode with the given operand, or `None` when the
    /// opcode is unsupported or the operand is out of range.
    pub fn stack_effect(self, arg: Option<i32>) -> Option<StackEffect> {
        use Opcode::*;
        let count = || arg.and_then(|a| usize::try_from(a).ok());

        let effect = match self {
            Nop | PopBlock | SetupLoop | DeleteGlobal | DeleteFast => StackEffect::straight(0, 0),
            PopTop => StackEffect::straight(1, 0),
            RotTwo => StackEffect::straight(2, 2),
            RotThree => StackEffect::straight(3, 3),
            RotFour => StackEffect::straight(4, 4),
            DupTop => StackEffect::straight(1, 2),
            DupTopX => match count()? {
                n @ 1..=5 => StackEffect::straight(n, 2 * n),
                _ => return None,
            },

            UnaryPositive | UnaryNegative | UnaryNot | UnaryConvert | UnaryInvert => {
                StackEffect::straight(1, 1)
            }

            BinaryPower | BinaryMultiply | BinaryDivide | BinaryModulo | BinaryAdd
            | BinarySubtract | BinarySubscr | BinaryFloorDivide | BinaryTrueDivide
            | BinaryLshift | BinaryRshift | BinaryAnd | BinaryXor | BinaryOr | InplacePower
            | InplaceMultiply | InplaceDivide | InplaceModulo | InplaceAdd | InplaceSubtract
            | InplaceFloorDivide | InplaceTrueDivide | InplaceLshift | InplaceRshift
            | InplaceAnd | InplaceXor | InplaceOr => StackEffect::straight(2, 1),

            Slice0 => StackEffect::straight(1, 1),
            Slice1 | Slice2 => StackEffect::straight(2, 1),
            Slice3 => StackEffect::straight(3, 1),
            StoreSlice0 => StackEffect::straight(2, 0),
            StoreSlice1 | StoreSlice2 => StackEffect::straight(3, 0),
            StoreSlice3 => StackEffect::straight(4, 0),
            DeleteSlice0 => StackEffect::straight(1, 0),
            DeleteSlice1 | DeleteSlice2 => StackEffect::straight(2, 0),
            DeleteSlice3 => StackEffect::straight(3, 0),

            StoreSubscr => StackEffect::straight(3, 0),
            DeleteSubscr => StackEffect::straight(2, 0),
            StoreMap => StackEffect::straight(3, 1),
            ListAppend => StackEffect::straight(2, 0),
            GetIter => StackEffect::straight(1, 1),
            ForIter => StackEffect::branch(1, 2, -1, true),
            ReturnValue => StackEffect::terminal(1),
            RaiseVarargs => match count()? {
                n @ 0..=3 => StackEffect::terminal(n),
                _ => return None,
            },
            UnpackSequence => StackEffect::straight(1, count()?),

            StoreAttr => StackEffect::straight(2, 0),
            DeleteAttr => StackEffect::straight(1, 0),
            LoadAttr => StackEffect::straight(1, 1),
            StoreGlobal => StackEffect::straight(1, 0),
            LoadGlobal | LoadConst | LoadFast | LoadClosure | LoadDeref => {
                StackEffect::straight(0, 1)
            }
            StoreFast | StoreDeref => StackEffect::straight(1, 0),

            BuildTuple | BuildList => StackEffect::straight(count()?, 1),
            BuildMap => {
                count()?;
                StackEffect::straight(0, 1)
            }
            BuildSlice => match count()? {
                n @ 2..=3 => StackEffect::straight(n, 1),
                _ => return None,
            },
            CompareOp => {
                CmpOp::from_arg(arg?)?;
                StackEffect::straight(2, 1)
            }

            JumpForward | JumpAbsolute => StackEffect::branch(0, 0, 0, false),
            PopJumpIfFalse | PopJumpIfTrue => StackEffect::branch(1, 0, -1, true),
            JumpIfFalseOrPop | JumpIfTrueOrPop => StackEffect::branch(1, 0, 0, true),

            CallFunction => {
                let (positional, keyword) = call_counts(arg.filter(|a| *a >= 0)?);
                StackEffect::straight(positional + 2 * keyword + 1, 1)
            }
            CallFunctionVarKw => {
                let (positional, keyword) = call_counts(arg.filter(|a| *a >= 0)?);
                StackEffect::straight(positional + 2 * keyword + 3, 1)
            }

            SetupExcept | SetupFinally | EndFinally | BreakLoop | ContinueLoop | WithCleanup
            | YieldValue | LoadName | StoreName | DeleteName | ImportName | ImportFrom
            | MakeFunction | MakeClosure | CallFunctionVar | CallFunctionKw | PrintItem
            | PrintNewline | ExtendedArg => return None,
        };
        Some(effect)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_name_roundtrip() {
        for op in Opcode::ALL {
            assert_eq!(Opcode::from_name(op.name()), Some(*op));
        }
        assert_eq!(Opcode::from_name("BINARY_FROB"), None);
    }

    #[test]
    fn test_every_supported_opcode_has_an_effect() {
        for op in Opcode::ALL {
            let arg = match op.operand_kind() {
                OperandKind::None | OperandKind::Jump => None,
                OperandKind::Count => Some(2),
                _ => Some(0),
            };
            assert_eq!(
                op.stack_effect(arg).is_some(),
                op.is_supported(),
                "{}",
                op
            );
        }
    }

    #[test]
    fn test_counted_effects() {
        let call = Opcode::CallFunction.stack_effect(Some(0x0102)).unwrap();
        assert_eq!((call.pops, call.pushes), (2 + 2 + 1, 1));

        let var_kw = Opcode::CallFunctionVarKw.stack_effect(Some(1)).unwrap();
        assert_eq!((var_kw.pops, var_kw.pushes), (4, 1));

        let dup = Opcode::DupTopX.stack_effect(Some(3)).unwrap();
        assert_eq!(dup.net(), 3);
        assert!(Opcode::DupTopX.stack_effect(Some(6)).is_none());

        let unpack = Opcode::UnpackSequence.stack_effect(Some(0)).unwrap();
        assert_eq!(unpack.net(), -1);

        assert!(Opcode::RaiseVarargs.stack_effect(Some(4)).is_none());
        assert!(Opcode::BuildSlice.stack_effect(Some(1)).is_none());
        assert!(Opcode::CompareOp.stack_effect(Some(11)).is_none());
    }

    #[test]
    fn test_branch_effects() {
        let for_iter = Opcode::ForIter.stack_effect(None).unwrap();
        assert_eq!(for_iter.net(), 1);
        assert_eq!(for_iter.on_branch, Some(-1));

        let or_pop = Opcode::JumpIfTrueOrPop.stack_effect(None).unwrap();
        assert_eq!(or_pop.net(), -1);
        assert_eq!(or_pop.on_branch, Some(0));

        let jump = Opcode::JumpAbsolute.stack_effect(None).unwrap();
        assert!(!jump.falls_through);
    }

    #[test]
    fn test_compare_symbols() {
        for op in CmpOp::ALL {
            assert_eq!(CmpOp::from_symbol(op.symbol()), Some(op));
            assert_eq!(CmpOp::from_arg(op.arg()), Some(op));
        }
        assert_eq!(CmpOp::from_symbol("not   in"), Some(CmpOp::NotIn));
        assert_eq!(CmpOp::from_arg(11), None);
        assert_eq!(CmpOp::from_arg(-1), None);
    }
}
