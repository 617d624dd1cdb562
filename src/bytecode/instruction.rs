//! Bytecode instruction definitions for the Kindle VM.
//!
//! Opcodes are grouped in three contiguous ranges by operand count, so the
//! operand count follows from the opcode byte alone.

use std::fmt;

/// Opcodes for the bytecode virtual machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Opcode {
    // ============ Zero operands ============
    Noop = 0,
    /// Bool -> Bool
    LogicalNot,
    /// (Bool, Bool) -> Bool
    LogicalOr,
    LogicalAnd,

    // Comparisons: (T, T) -> Bool
    Equal8,
    Equal32,
    Equal64,
    NotEqual8,
    NotEqual32,
    NotEqual64,
    LessEqual8,
    LessEqual32,
    LessEqual64,
    GreaterEqual8,
    GreaterEqual32,
    GreaterEqual64,
    LessThan8,
    LessThan32,
    LessThan64,
    GreaterThan8,
    GreaterThan32,
    GreaterThan64,

    // Bitwise: T -> T, (T, T) -> T
    BitwiseNot8,
    BitwiseNot32,
    BitwiseNot64,
    BitwiseOr8,
    BitwiseOr32,
    BitwiseOr64,
    BitwiseAnd8,
    BitwiseAnd32,
    BitwiseAnd64,
    BitwiseXor8,
    BitwiseXor32,
    BitwiseXor64,
    ShiftLeft8,
    ShiftLeft32,
    ShiftLeft64,
    ShiftRight8,
    ShiftRight32,
    ShiftRight64,

    // Arithmetic: T -> T, (T, T) -> T
    Neg8,
    Neg32,
    Neg64,
    Add8,
    Add32,
    Add64,
    Sub8,
    Sub32,
    Sub64,
    Mul8,
    Mul32,
    Mul64,
    Div8,
    Div32,
    Div64,
    Mod8,
    Mod32,
    Mod64,
    Exp8,
    Exp32,
    Exp64,

    /// Pull a closure and call its function with the captured values pushed back
    Execute,

    // ============ One operand ============
    /// INVOKE <type_index>: pull a value and pass it to the invoke callback
    Invoke,
    /// LOAD_STATIC <value_index>
    LoadStatic,
    /// LOAD_FUNCTION <function_index>: push a closure without captures
    LoadFunction,
    /// CALL0 <function_index>: call in the current module
    Call0,
    /// CALL1 <function_index>: call in the builtin module
    Call1,
    /// MAKE_CLOSURE <function_index>: pull nonlocals and partial args into a closure
    MakeClosure,
    /// INC_REF <offset_from_top>
    IncRef,
    /// DEC_REF <offset_from_top>
    DecRef,
    /// JUMP <forward_offset>
    Jump,
    /// JUMP_IF_NOT <forward_offset>: pull a Bool, jump if false
    JumpIfNot,
    /// SUBSCRIPT <elem_type_index>: pull a list and an Int32 index, push the element
    Subscript,

    // ============ Two operands ============
    /// CALL <import_index> <function_index>
    Call,
    /// COPY_VARIABLE <offset_above_base> <size>
    CopyVariable,
    /// COPY_ARGUMENT <offset_below_base> <size>
    CopyArgument,
    /// DROP <skip> <size>: remove `size` bytes under the top `skip` bytes
    Drop,
    /// MAKE_LIST <count> <elem_type_index>
    MakeList,
}

/// Operand width of a width-specialized instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    W8 = 0,
    W32 = 1,
    W64 = 2,
}

impl Opcode {
    pub const ZERO_ARG_FIRST: Opcode = Opcode::Noop;
    pub const ZERO_ARG_LAST: Opcode = Opcode::Execute;
    pub const ONE_ARG_FIRST: Opcode = Opcode::Invoke;
    pub const ONE_ARG_LAST: Opcode = Opcode::Subscript;
    pub const TWO_ARG_FIRST: Opcode = Opcode::Call;
    pub const TWO_ARG_LAST: Opcode = Opcode::MakeList;

    pub fn from_u8(byte: u8) -> Option<Opcode> {
        if byte <= Opcode::TWO_ARG_LAST as u8 {
            // SAFETY: `Opcode` is `repr(u8)` with contiguous discriminants
            // starting at 0, and `byte` is within range.
            Some(unsafe { std::mem::transmute::<u8, Opcode>(byte) })
        } else {
            None
        }
    }

    /// Number of one-byte operands following the opcode.
    pub fn arg_count(self) -> usize {
        if self <= Self::ZERO_ARG_LAST {
            0
        } else if self <= Self::ONE_ARG_LAST {
            1
        } else {
            2
        }
    }

    /// Encoded length of the instruction, opcode byte included.
    pub fn len(self) -> usize {
        1 + self.arg_count()
    }

    /// Width of a width-specialized instruction.
    pub fn width(self) -> Option<Width> {
        if self >= Opcode::Equal8 && self <= Opcode::Exp64 {
            Some(match (self as u8 - Opcode::Equal8 as u8) % 3 {
                0 => Width::W8,
                1 => Width::W32,
                _ => Width::W64,
            })
        } else {
            None
        }
    }

    /// The same operation at another width, e.g. `Add8` -> `Add64`.
    pub fn with_width(self, width: Width) -> Option<Opcode> {
        let current = self.width()? as u8;
        Opcode::from_u8(self as u8 - current + width as u8)
    }

    /// Operations taking a single operand.
    pub fn is_unary(self) -> bool {
        matches!(
            self.with_width(Width::W8),
            Some(Opcode::BitwiseNot8 | Opcode::Neg8)
        ) || self == Opcode::LogicalNot
    }

    pub fn is_comparison(self) -> bool {
        self >= Opcode::Equal8 && self <= Opcode::GreaterThan64
    }

    /// Lower snake-case name: `Add32` -> `add_32`, `LoadStatic` -> `load_static`.
    pub fn snake_name(self) -> String {
        let debug = format!("{:?}", self);
        let mut name = String::with_capacity(debug.len() + 4);
        let mut prev_digit = false;
        for (i, c) in debug.chars().enumerate() {
            if i > 0 && (c.is_ascii_uppercase() || (c.is_ascii_digit() && !prev_digit)) {
                name.push('_');
            }
            prev_digit = c.is_ascii_digit();
            name.push(c.to_ascii_lowercase());
        }
        name
    }
}

impl From<Opcode> for u8 {
    fn from(op: Opcode) -> u8 {
        op as u8
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.snake_name().to_uppercase())
    }
}
