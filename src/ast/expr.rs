//! Expression AST nodes.

use std::fmt;
use std::rc::Rc;

use crate::ast::stmt::{FunctionDecl, Stmt};
use crate::span::Span;

/// An expression in the AST.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Self { kind, span }
    }
}

/// Literal values.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Bool(bool),
    Byte(u8),
    Char(char),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(String),
}

/// A braced sequence of statements with an optional trailing value.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub statements: Vec<Stmt>,
    pub value: Option<Box<Expr>>,
}

/// Expression variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Literal(Literal),

    /// Variable or function reference
    Variable(String),

    /// Parenthesized expression
    Grouping(Box<Expr>),

    Binary {
        left: Box<Expr>,
        operator: BinaryOp,
        right: Box<Expr>,
    },

    Unary {
        operator: UnaryOp,
        operand: Box<Expr>,
    },

    /// Function call: callee(args)
    Call {
        callee: Box<Expr>,
        arguments: Vec<Expr>,
    },

    /// List indexing: object[index]
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },

    /// Tuple field access: object.0
    TupleField { object: Box<Expr>, index: usize },

    /// Tuple literal: (a, b)
    Tuple(Vec<Expr>),

    /// List literal: [a, b]
    List(Vec<Expr>),

    /// Lambda: |a, b| body
    Lambda(Rc<FunctionDecl>),

    Block(Block),

    /// if c { a } else { b }
    If {
        condition: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Option<Box<Expr>>,
    },
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Power,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    BitAnd,
    BitOr,
    BitXor,
    ShiftLeft,
    ShiftRight,
    And,
    Or,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Equal
                | BinaryOp::NotEqual
                | BinaryOp::Less
                | BinaryOp::LessEqual
                | BinaryOp::Greater
                | BinaryOp::GreaterEqual
        )
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::Power => "**",
            BinaryOp::Equal => "==",
            BinaryOp::NotEqual => "!=",
            BinaryOp::Less => "<",
            BinaryOp::LessEqual => "<=",
            BinaryOp::Greater => ">",
            BinaryOp::GreaterEqual => ">=",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::ShiftLeft => "<<",
            BinaryOp::ShiftRight => ">>",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        };
        write!(f, "{}", s)
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    Not,
    BitNot,
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnaryOp::Negate => write!(f, "-"),
            UnaryOp::Not => write!(f, "!"),
            UnaryOp::BitNot => write!(f, "~"),
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Bool(b) => write!(f, "{}", b),
            Literal::Byte(b) => write!(f, "{}b", b),
            Literal::Char(c) => write!(f, "{:?}", c),
            Literal::Int32(n) => write!(f, "{}", n),
            Literal::Int64(n) => write!(f, "{}L", n),
            Literal::Float32(n) => write!(f, "{:?}f", n),
            Literal::Float64(n) => write!(f, "{:?}", n),
            Literal::String(s) => write!(f, "{:?}", s),
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[Expr]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

/// Source-like rendering with every binary and unary operation parenthesized.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ExprKind::Literal(lit) => write!(f, "{}", lit),
            ExprKind::Variable(name) => write!(f, "{}", name),
            ExprKind::Grouping(inner) => write!(f, "{}", inner),
            ExprKind::Binary {
                left,
                operator,
                right,
            } => write!(f, "({} {} {})", left, operator, right),
            ExprKind::Unary { operator, operand } => write!(f, "({}{})", operator, operand),
            ExprKind::Call { callee, arguments } => {
                write!(f, "{}(", callee)?;
                write_list(f, arguments)?;
                write!(f, ")")
            }
            ExprKind::Index { object, index } => write!(f, "{}[{}]", object, index),
            ExprKind::TupleField { object, index } => write!(f, "{}.{}", object, index),
            ExprKind::Tuple(items) => {
                write!(f, "(")?;
                write_list(f, items)?;
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            ExprKind::List(items) => {
                write!(f, "[")?;
                write_list(f, items)?;
                write!(f, "]")
            }
            ExprKind::Lambda(decl) => {
                write!(f, "|")?;
                for (i, param) in decl.params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", param)?;
                }
                write!(f, "| ")?;
                if let Some(ret) = &decl.return_type {
                    write!(f, "-> {} ", ret)?;
                }
                write!(f, "{}", decl.body)
            }
            ExprKind::Block(block) => {
                write!(f, "{{ ")?;
                for stmt in &block.statements {
                    write!(f, "{} ", stmt)?;
                }
                if let Some(value) = &block.value {
                    write!(f, "{} ", value)?;
                }
                write!(f, "}}")
            }
            ExprKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                write!(f, "if {} {}", condition, then_branch)?;
                if let Some(else_branch) = else_branch {
                    write!(f, " else {}", else_branch)?;
                }
                Ok(())
            }
        }
    }
}
