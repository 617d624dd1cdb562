//! Statement AST nodes.

use std::fmt;
use std::rc::Rc;

use crate::ast::expr::Expr;
use crate::ast::types::TypeAnnotation;
use crate::span::Span;

/// A statement in the AST.
#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

impl Stmt {
    pub fn new(kind: StmtKind, span: Span) -> Self {
        Self { kind, span }
    }
}

/// Statement variants.
#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    /// Expression statement: expr;
    Expression(Expr),

    /// Binding: let x: Type = expr;
    Let {
        name: String,
        type_annotation: Option<TypeAnnotation>,
        initializer: Expr,
    },

    /// Named function: fn name(params) -> Type { body }
    Function(Rc<FunctionDecl>),
}

/// A function parameter. Without an annotation, the parameter is a type variable.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub type_annotation: Option<TypeAnnotation>,
    pub span: Span,
}

/// A function or lambda. Lambdas carry an empty name until they are bound.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    pub name: String,
    pub params: Vec<Parameter>,
    pub return_type: Option<TypeAnnotation>,
    pub body: Expr,
    pub span: Span,
}

/// A parsed source unit: statements, then an optional trailing result expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub statements: Vec<Stmt>,
    pub value: Option<Expr>,
}

impl Program {
    pub fn new(statements: Vec<Stmt>, value: Option<Expr>) -> Self {
        Self { statements, value }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.type_annotation {
            Some(ty) => write!(f, "{}: {}", self.name, ty),
            None => write!(f, "{}", self.name),
        }
    }
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            StmtKind::Expression(expr) => write!(f, "{};", expr),
            StmtKind::Let {
                name,
                type_annotation,
                initializer,
            } => match type_annotation {
                Some(ty) => write!(f, "let {}: {} = {};", name, ty, initializer),
                None => write!(f, "let {} = {};", name, initializer),
            },
            StmtKind::Function(decl) => {
                write!(f, "fn {}(", decl.name)?;
                for (i, param) in decl.params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", param)?;
                }
                write!(f, ")")?;
                if let Some(ret) = &decl.return_type {
                    write!(f, " -> {}", ret)?;
                }
                write!(f, " {}", decl.body)
            }
        }
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for stmt in &self.statements {
            writeln!(f, "{}", stmt)?;
        }
        if let Some(value) = &self.value {
            writeln!(f, "{}", value)?;
        }
        Ok(())
    }
}
