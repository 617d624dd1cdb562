//! Error types for all phases.

use crate::span::Span;
use thiserror::Error;

/// Lexer errors.
#[derive(Debug, Error)]
pub enum LexerError {
    #[error("Unexpected character '{0}' at {1}")]
    UnexpectedChar(char, Span),

    #[error("Unterminated string at {0}")]
    UnterminatedString(Span),

    #[error("Invalid character literal at {0}")]
    InvalidChar(Span),

    #[error("Invalid escape sequence '\\{0}' at {1}")]
    InvalidEscape(char, Span),

    #[error("Invalid number '{0}' at {1}")]
    InvalidNumber(String, Span),
}

impl LexerError {
    pub fn unexpected_char(c: char, span: Span) -> Self {
        Self::UnexpectedChar(c, span)
    }

    pub fn unterminated_string(span: Span) -> Self {
        Self::UnterminatedString(span)
    }

    pub fn invalid_char(span: Span) -> Self {
        Self::InvalidChar(span)
    }

    pub fn invalid_escape(c: char, span: Span) -> Self {
        Self::InvalidEscape(c, span)
    }

    pub fn invalid_number(s: impl Into<String>, span: Span) -> Self {
        Self::InvalidNumber(s.into(), span)
    }

    pub fn span(&self) -> Span {
        match self {
            Self::UnexpectedChar(_, span) => *span,
            Self::UnterminatedString(span) => *span,
            Self::InvalidChar(span) => *span,
            Self::InvalidEscape(_, span) => *span,
            Self::InvalidNumber(_, span) => *span,
        }
    }
}

/// Parser errors.
#[derive(Debug, Error)]
pub enum ParserError {
    #[error("Unexpected token '{found}', expected {expected} at {span}")]
    UnexpectedToken {
        expected: String,
        found: String,
        span: Span,
    },

    #[error("Unexpected end of input at {0}")]
    UnexpectedEof(Span),

    #[error("{message} at {span}")]
    General { message: String, span: Span },
}

impl ParserError {
    pub fn unexpected_token(
        expected: impl Into<String>,
        found: impl Into<String>,
        span: Span,
    ) -> Self {
        Self::UnexpectedToken {
            expected: expected.into(),
            found: found.into(),
            span,
        }
    }

    pub fn unexpected_eof(span: Span) -> Self {
        Self::UnexpectedEof(span)
    }

    pub fn general(message: impl Into<String>, span: Span) -> Self {
        Self::General {
            message: message.into(),
            span,
        }
    }

    pub fn span(&self) -> Span {
        match self {
            Self::UnexpectedToken { span, .. } => *span,
            Self::UnexpectedEof(span) => *span,
            Self::General { span, .. } => *span,
        }
    }
}

impl From<LexerError> for ParserError {
    fn from(err: LexerError) -> Self {
        Self::General {
            message: err.to_string(),
            span: err.span(),
        }
    }
}

/// Compile-time errors: symbol resolution, type checking and code emission.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("Undefined name '{name}' at {span}")]
    UndefinedName { name: String, span: Span },

    #[error("Undefined type '{name}' at {span}")]
    UndefinedType { name: String, span: Span },

    #[error("Type mismatch: expected {expected}, found {found} at {span}")]
    TypeMismatch {
        expected: String,
        found: String,
        span: Span,
    },

    #[error("Unexpected return type: declared {declared}, found {found} at {span}")]
    UnexpectedReturnType {
        declared: String,
        found: String,
        span: Span,
    },

    #[error("Wrong number of arguments: expected {expected}, got {got} at {span}")]
    WrongArgumentCount {
        expected: usize,
        got: usize,
        span: Span,
    },

    #[error("Cannot call value of type {type_name} at {span}")]
    NotCallable { type_name: String, span: Span },

    #[error("Cannot infer type of {what} at {span}")]
    CannotInferType { what: String, span: Span },

    #[error("Cannot instantiate generic function '{name}' at {span}")]
    GenericInstantiation {
        name: String,
        detail: String,
        span: Span,
    },

    #[error("Operator '{operator}' is not defined for {type_name} at {span}")]
    UnsupportedOperator {
        operator: String,
        type_name: String,
        span: Span,
    },

    #[error("Operand out of range: {what} at {span}")]
    OperandOutOfRange { what: String, span: Span },

    #[error("{message} at {span}")]
    General { message: String, span: Span },
}

impl CompileError {
    pub fn new(message: impl Into<String>, span: Span) -> Self {
        Self::General {
            message: message.into(),
            span,
        }
    }

    pub fn undefined_name(name: impl Into<String>, span: Span) -> Self {
        Self::UndefinedName {
            name: name.into(),
            span,
        }
    }

    pub fn undefined_type(name: impl Into<String>, span: Span) -> Self {
        Self::UndefinedType {
            name: name.into(),
            span,
        }
    }

    pub fn mismatch(expected: impl ToString, found: impl ToString, span: Span) -> Self {
        Self::TypeMismatch {
            expected: expected.to_string(),
            found: found.to_string(),
            span,
        }
    }

    pub fn unexpected_return_type(declared: impl ToString, found: impl ToString, span: Span) -> Self {
        Self::UnexpectedReturnType {
            declared: declared.to_string(),
            found: found.to_string(),
            span,
        }
    }

    pub fn wrong_argument_count(expected: usize, got: usize, span: Span) -> Self {
        Self::WrongArgumentCount {
            expected,
            got,
            span,
        }
    }

    pub fn not_callable(type_name: impl ToString, span: Span) -> Self {
        Self::NotCallable {
            type_name: type_name.to_string(),
            span,
        }
    }

    pub fn cannot_infer(what: impl Into<String>, span: Span) -> Self {
        Self::CannotInferType {
            what: what.into(),
            span,
        }
    }

    pub fn generic_instantiation(
        name: impl Into<String>,
        detail: impl Into<String>,
        span: Span,
    ) -> Self {
        Self::GenericInstantiation {
            name: name.into(),
            detail: detail.into(),
            span,
        }
    }

    pub fn unsupported_operator(
        operator: impl ToString,
        type_name: impl ToString,
        span: Span,
    ) -> Self {
        Self::UnsupportedOperator {
            operator: operator.to_string(),
            type_name: type_name.to_string(),
            span,
        }
    }

    pub fn operand_out_of_range(what: impl Into<String>, span: Span) -> Self {
        Self::OperandOutOfRange {
            what: what.into(),
            span,
        }
    }

    /// Supplementary text shown under the main message, if any.
    pub fn detail(&self) -> Option<&str> {
        match self {
            Self::GenericInstantiation { detail, .. } => Some(detail),
            _ => None,
        }
    }

    pub fn span(&self) -> Span {
        match self {
            Self::UndefinedName { span, .. } => *span,
            Self::UndefinedType { span, .. } => *span,
            Self::TypeMismatch { span, .. } => *span,
            Self::UnexpectedReturnType { span, .. } => *span,
            Self::WrongArgumentCount { span, .. } => *span,
            Self::NotCallable { span, .. } => *span,
            Self::CannotInferType { span, .. } => *span,
            Self::GenericInstantiation { span, .. } => *span,
            Self::UnsupportedOperator { span, .. } => *span,
            Self::OperandOutOfRange { span, .. } => *span,
            Self::General { span, .. } => *span,
        }
    }
}

/// Runtime errors raised by the machine, the stack, the heap and natives.
///
/// Bytecode carries no source positions, so these have no span.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Index out of bounds: {index} (length {length})")]
    IndexOutOfBounds { index: i64, length: usize },

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Stack underflow: need {needed} bytes, have {available}")]
    StackUnderflow { needed: usize, available: usize },

    #[error("Stack overflow: limit is {limit} bytes")]
    StackOverflow { limit: usize },

    #[error("Unexpected value type: expected {expected}, found {found}")]
    UnexpectedValueType { expected: String, found: String },

    #[error("Dangling heap handle {0:#x}")]
    DanglingHandle(u64),

    #[error("Cannot call {what} function '{name}'")]
    NotCallable { what: &'static str, name: String },

    #[error("Function index {index} out of range in module '{module}'")]
    BadFunctionIndex { module: String, index: usize },

    #[error("Execution aborted after {steps} steps")]
    Aborted { steps: u64 },

    #[error("{0}")]
    Native(String),
}

impl RuntimeError {
    pub fn not_implemented(what: impl Into<String>) -> Self {
        Self::NotImplemented(what.into())
    }

    pub fn index_out_of_bounds(index: i64, length: usize) -> Self {
        Self::IndexOutOfBounds { index, length }
    }

    pub fn underflow(needed: usize, available: usize) -> Self {
        Self::StackUnderflow { needed, available }
    }

    pub fn unexpected_value_type(expected: impl ToString, found: impl ToString) -> Self {
        Self::UnexpectedValueType {
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    pub fn native(message: impl Into<String>) -> Self {
        Self::Native(message.into())
    }
}

/// A unified error type for all phases.
#[derive(Debug, Error)]
pub enum KindleError {
    #[error("Lexer error: {0}")]
    Lexer(#[from] LexerError),

    #[error("Parser error: {0}")]
    Parser(#[from] ParserError),

    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl KindleError {
    /// Supplementary text for the error, if the phase provides one.
    pub fn detail(&self) -> Option<&str> {
        match self {
            Self::Compile(err) => err.detail(),
            _ => None,
        }
    }
}
