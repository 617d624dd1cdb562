//! Abstract Syntax Tree for Kindle.

pub mod expr;
pub mod stmt;
pub mod types;

pub use expr::{BinaryOp, Block, Expr, ExprKind, Literal, UnaryOp};
pub use stmt::{FunctionDecl, Parameter, Program, Stmt, StmtKind};
pub use types::{TypeAnnotation, TypeKind};
