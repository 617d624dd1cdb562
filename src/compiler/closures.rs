//! Nested functions, lambdas and the variables they capture.
//!
//! A nested function captures every free name that resolves to a stack slot
//! of an enclosing function. Captured values travel as nonlocals: the call
//! site pushes them right above the arguments, or `MakeClosure` stores them
//! when the function is used as a value.

use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};

use crate::ast::{Block, Expr, ExprKind, FunctionDecl, StmtKind};
use crate::error::CompileError;
use crate::module::{Function, FunctionBody, GenericBody, Module};
use crate::symtab::{ScopeId, Symbol, ROOT_SCOPE};
use crate::types::{Signature, TypeInfo};

use super::{get_function, CompileResult, Compiler};

impl Compiler {
    /// Register a function declared inside another one and compile it,
    /// unless it is generic. Returns its index in the current module.
    pub(super) fn declare_nested_function(
        &mut self,
        decl: &Rc<FunctionDecl>,
        mut signature: Signature,
    ) -> CompileResult<usize> {
        let module = self.current.module.clone();
        let scope = self.current.scope;
        let captures = collect_captures(&module, scope, decl)?;
        signature.nonlocals = captures.values().cloned().collect();

        let name = if decl.name.is_empty() { "lambda" } else { decl.name.as_str() };
        let generic = signature.is_generic();
        let mut function = Function::new(name, signature);
        function.captures = captures.into_keys().collect();
        if generic {
            function.body = FunctionBody::Generic(GenericBody {
                declaration: decl.clone(),
                scope,
            });
        }
        let index = module.add_function(function);
        if !decl.name.is_empty() {
            module
                .symtab_mut()
                .add(scope, decl.name.clone(), Symbol::Function { index });
        }
        if !generic {
            self.compile_function(module, index, decl, scope)?;
        }
        Ok(index)
    }

    /// Declared signature of a lambda, with gaps filled from the function
    /// type its context expects.
    fn lambda_signature(&self, decl: &FunctionDecl, expected: Option<&TypeInfo>) -> CompileResult<Signature> {
        let mut signature = self.declared_signature(decl)?;
        let Some(expected) = expected.and_then(TypeInfo::signature) else {
            return Ok(signature);
        };
        if expected.params.len() != signature.params.len() {
            return Err(CompileError::mismatch(expected, &signature, decl.span));
        }
        for (param, hint) in signature.params.iter_mut().zip(&expected.params) {
            if param.is_unknown() {
                *param = hint.clone();
            }
        }
        if signature.return_type.is_unknown() && !expected.return_type.is_generic() {
            signature.return_type = expected.return_type.clone();
        }
        Ok(signature)
    }

    pub(super) fn compile_lambda(
        &mut self,
        decl: &Rc<FunctionDecl>,
        expected: Option<&TypeInfo>,
    ) -> CompileResult<TypeInfo> {
        let signature = self.lambda_signature(decl, expected)?;
        if signature.is_generic() {
            return Err(CompileError::cannot_infer("lambda parameter types", decl.span));
        }
        let index = self.declare_nested_function(decl, signature)?;
        let module = self.current.module.clone();
        self.compile_function_value(&module, index, None, decl.span)
    }
}

/// Names `decl` must capture when declared in `scope`, with their types.
fn collect_captures(
    module: &Module,
    scope: ScopeId,
    decl: &FunctionDecl,
) -> CompileResult<IndexMap<String, TypeInfo>> {
    let mut captures = IndexMap::new();
    for name in free_names(decl) {
        let found = module.symtab().resolve(scope, &name);
        let Some(found) = found else {
            continue;
        };
        if found.scope == ROOT_SCOPE {
            continue;
        }
        match &found.symbol {
            Symbol::Parameter { ty, .. } | Symbol::Local { ty, .. } | Symbol::Nonlocal { ty, .. } => {
                captures.entry(name).or_insert_with(|| ty.clone());
            }
            Symbol::Function { index } => {
                // calling a sibling means pushing its captures too
                let sibling = get_function(module, *index, decl.span)?;
                for (name, ty) in sibling.captures.iter().zip(&sibling.signature.nonlocals) {
                    captures.entry(name.clone()).or_insert_with(|| ty.clone());
                }
            }
            Symbol::Computed { .. } | Symbol::Value { .. } => {}
        }
    }
    Ok(captures)
}

/// Names used in the body of `decl` that it doesn't bind itself.
fn free_names(decl: &FunctionDecl) -> IndexSet<String> {
    let mut walker = FreeNames::default();
    if !decl.name.is_empty() {
        walker.bound.push(decl.name.clone());
    }
    walker.function(decl);
    walker.free
}

#[derive(Default)]
struct FreeNames {
    bound: Vec<String>,
    free: IndexSet<String>,
}

impl FreeNames {
    fn function(&mut self, decl: &FunctionDecl) {
        let mark = self.bound.len();
        self.bound.extend(decl.params.iter().map(|p| p.name.clone()));
        self.expr(&decl.body);
        self.bound.truncate(mark);
    }

    fn block(&mut self, block: &Block) {
        let mark = self.bound.len();
        for stmt in &block.statements {
            match &stmt.kind {
                StmtKind::Expression(expr) => self.expr(expr),
                StmtKind::Let {
                    name, initializer, ..
                } => {
                    // a lambda bound by let may call itself
                    if matches!(initializer.kind, ExprKind::Lambda(_)) {
                        self.bound.push(name.clone());
                        self.expr(initializer);
                    } else {
                        self.expr(initializer);
                        self.bound.push(name.clone());
                    }
                }
                StmtKind::Function(decl) => {
                    self.bound.push(decl.name.clone());
                    self.function(decl);
                }
            }
        }
        if let Some(value) = &block.value {
            self.expr(value);
        }
        self.bound.truncate(mark);
    }

    fn expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Literal(_) => {}
            ExprKind::Variable(name) => {
                if !self.bound.iter().any(|b| b == name) {
                    self.free.insert(name.clone());
                }
            }
            ExprKind::Grouping(inner) => self.expr(inner),
            ExprKind::Unary { operand, .. } => self.expr(operand),
            ExprKind::Binary { left, right, .. } => {
                self.expr(left);
                self.expr(right);
            }
            ExprKind::Call { callee, arguments } => {
                self.expr(callee);
                arguments.iter().for_each(|arg| self.expr(arg));
            }
            ExprKind::Index { object, index } => {
                self.expr(object);
                self.expr(index);
            }
            ExprKind::TupleField { object, .. } => self.expr(object),
            ExprKind::Tuple(items) | ExprKind::List(items) => items.iter().for_each(|item| self.expr(item)),
            ExprKind::Lambda(decl) => self.function(decl),
            ExprKind::Block(block) => self.block(block),
            ExprKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                self.expr(condition);
                self.expr(then_branch);
                if let Some(else_branch) = else_branch {
                    self.expr(else_branch);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Scanner;
    use crate::parser::Parser;
    use pretty_assertions::assert_eq;

    fn first_function(source: &str) -> Rc<FunctionDecl> {
        let tokens = Scanner::new(source).scan_tokens().unwrap();
        let program = Parser::new(tokens).parse().unwrap();
        match &program.statements[0].kind {
            StmtKind::Function(decl) => decl.clone(),
            other => panic!("expected a function, got {:?}", other),
        }
    }

    fn names(source: &str) -> Vec<String> {
        free_names(&first_function(source)).into_iter().collect()
    }

    #[test]
    fn test_parameters_are_bound() {
        assert_eq!(names("fn f(a: Int, b: Int) { a + b + c }"), vec!["c"]);
    }

    #[test]
    fn test_let_binds_after_initializer() {
        assert_eq!(names("fn f() { let x = x + 1; x }"), vec!["x"]);
        assert_eq!(names("fn f() { let x = 1; x + y }"), vec!["y"]);
    }

    #[test]
    fn test_lambda_parameters_scope() {
        assert_eq!(names("fn f() { let g = |a| a + b; a }"), vec!["b", "a"]);
    }

    #[test]
    fn test_self_reference_is_not_free() {
        assert_eq!(names("fn f(n: Int) -> Int { if n == 0 { 0 } else { f(n - 1) } }"), Vec::<String>::new());
    }
}
