//! Expression compilation.

use crate::ast::{BinaryOp, Block, Expr, ExprKind, Literal, StmtKind, UnaryOp};
use crate::bytecode::{Opcode, Width};
use crate::error::CompileError;
use crate::module::FunctionBody;
use crate::span::Span;
use crate::symtab::{ScopeKind, Symbol};
use crate::types::{TypeInfo, HANDLE_SIZE};
use crate::vm::builtins::BUILTIN_MODULE_NAME;

use super::{bind_lambda, get_function, literal_value, CompileResult, Compiler, Resolved};

impl Compiler {
    /// Compile `expr`, leaving its value on the stack. `expected` is a hint
    /// for literals and lambdas; callers check the returned type themselves.
    pub(super) fn compile_expr(&mut self, expr: &Expr, expected: Option<&TypeInfo>) -> CompileResult<TypeInfo> {
        let start = self.current.depth;
        let ty = self.compile_expr_kind(expr, expected)?;
        self.current.depth = start + ty.size();
        Ok(ty)
    }

    fn compile_expr_kind(&mut self, expr: &Expr, expected: Option<&TypeInfo>) -> CompileResult<TypeInfo> {
        let span = expr.span;
        match &expr.kind {
            ExprKind::Literal(literal) => self.compile_literal(literal, expected, span),
            ExprKind::Variable(name) => self.compile_variable(name, expected, span),
            ExprKind::Grouping(inner) => self.compile_expr(inner, expected),
            ExprKind::Binary {
                left,
                operator,
                right,
            } => self.compile_binary(left, *operator, right, expected, span),
            ExprKind::Unary { operator, operand } => self.compile_unary(*operator, operand, expected, span),
            ExprKind::Call { callee, arguments } => self.compile_call(callee, arguments, span),
            ExprKind::Index { object, index } => self.compile_index(object, index, span),
            ExprKind::TupleField { object, index } => self.compile_tuple_field(object, *index, span),
            ExprKind::Tuple(items) => self.compile_tuple(items, expected),
            ExprKind::List(items) => self.compile_list(items, expected, span),
            ExprKind::Lambda(decl) => self.compile_lambda(decl, expected),
            ExprKind::Block(block) => self.compile_block(block, expected, span),
            ExprKind::If {
                condition,
                then_branch,
                else_branch,
            } => self.compile_if(condition, then_branch, else_branch.as_deref(), expected),
        }
    }

    fn compile_literal(
        &mut self,
        literal: &Literal,
        expected: Option<&TypeInfo>,
        span: Span,
    ) -> CompileResult<TypeInfo> {
        let module = self.current.module.clone();
        let value = literal_value(&module, literal, expected);
        let ty = value.type_info();
        let index = match literal {
            Literal::String(_) => module.add_value(value),
            _ => module.intern_value(value),
        };
        self.emit1(Opcode::LoadStatic, index, span)?;
        Ok(ty)
    }

    pub(super) fn compile_variable(
        &mut self,
        name: &str,
        expected: Option<&TypeInfo>,
        span: Span,
    ) -> CompileResult<TypeInfo> {
        match self.resolve_name(name, span)? {
            Resolved::Stack { opcode, offset, ty } => {
                if ty.size() > 0 {
                    self.emit2(opcode, offset, ty.size(), span)?;
                    self.incref_value(&ty, span)?;
                }
                Ok(ty)
            }
            Resolved::Function { module, index } => {
                self.compile_function_value(&module, index, expected, span)
            }
            Resolved::Computed { module, index } => {
                self.ensure_compiled(&module, index)?;
                let ty = self.call_return_type(&module, index, span)?;
                self.emit_call(&module, index, span)?;
                Ok(ty)
            }
            Resolved::Value { module, index } => {
                let value = module.get_value(index).ok_or_else(|| {
                    CompileError::new(format!("static value '{}' is missing", name), span)
                })?;
                let ty = value.type_info();
                let local = if std::rc::Rc::ptr_eq(&module, &self.current.module) {
                    index
                } else {
                    value
                        .incref(module.heap())
                        .map_err(|e| CompileError::new(e.to_string(), span))?;
                    self.current.module.add_value(value)
                };
                self.emit1(Opcode::LoadStatic, local, span)?;
                Ok(ty)
            }
        }
    }

    // ===== Operators =====

    fn compile_binary(
        &mut self,
        left: &Expr,
        operator: BinaryOp,
        right: &Expr,
        expected: Option<&TypeInfo>,
        span: Span,
    ) -> CompileResult<TypeInfo> {
        let hint = match operator {
            BinaryOp::And | BinaryOp::Or => Some(TypeInfo::Bool),
            op if op.is_comparison() => self.infer_hint(left).or_else(|| self.infer_hint(right)),
            _ => expected
                .filter(|t| !t.is_unknown())
                .cloned()
                .or_else(|| self.infer_hint(left))
                .or_else(|| self.infer_hint(right)),
        };
        // the machine pulls the left operand first, so it goes on top
        let rhs = self.compile_expr(right, hint.as_ref())?;
        let lhs = self.compile_expr(left, Some(&rhs))?;
        if lhs != rhs {
            return Err(CompileError::mismatch(&rhs, &lhs, left.span));
        }
        self.emit_binary(operator, &rhs, span)
    }

    fn emit_binary(&mut self, operator: BinaryOp, ty: &TypeInfo, span: Span) -> CompileResult<TypeInfo> {
        let unsupported = || CompileError::unsupported_operator(operator, ty, span);
        let result = if operator.is_comparison() { TypeInfo::Bool } else { ty.clone() };
        match (operator, ty) {
            (BinaryOp::And, TypeInfo::Bool) => self.emit(Opcode::LogicalAnd),
            (BinaryOp::Or, TypeInfo::Bool) => self.emit(Opcode::LogicalOr),
            (BinaryOp::And | BinaryOp::Or, _) => return Err(unsupported()),
            (BinaryOp::Equal, TypeInfo::Bool) => self.emit(Opcode::Equal8),
            (BinaryOp::NotEqual, TypeInfo::Bool) => self.emit(Opcode::NotEqual8),
            (_, TypeInfo::Byte | TypeInfo::Int32 | TypeInfo::Int64 | TypeInfo::Char) => {
                let width = match ty {
                    TypeInfo::Byte => Width::W8,
                    TypeInfo::Int64 => Width::W64,
                    _ => Width::W32,
                };
                if matches!(ty, TypeInfo::Char) && !operator.is_comparison() {
                    return Err(unsupported());
                }
                let opcode = int_opcode(operator)
                    .and_then(|op| op.with_width(width))
                    .ok_or_else(unsupported)?;
                self.emit(opcode);
            }
            (_, TypeInfo::Float32 | TypeInfo::Float64) => {
                let op = float_native(operator).ok_or_else(unsupported)?;
                let suffix = if matches!(ty, TypeInfo::Float32) { "f32" } else { "f64" };
                self.call_builtin(&format!("{}_{}", op, suffix), span)?;
            }
            (BinaryOp::Add, TypeInfo::String) => self.call_builtin("string_concat", span)?,
            (BinaryOp::Equal, TypeInfo::String) => self.call_builtin("string_equal", span)?,
            (BinaryOp::NotEqual, TypeInfo::String) => {
                self.call_builtin("string_equal", span)?;
                self.emit(Opcode::LogicalNot);
            }
            _ => return Err(unsupported()),
        }
        Ok(result)
    }

    fn compile_unary(
        &mut self,
        operator: UnaryOp,
        operand: &Expr,
        expected: Option<&TypeInfo>,
        span: Span,
    ) -> CompileResult<TypeInfo> {
        let ty = self.compile_expr(operand, expected)?;
        let width = match ty {
            TypeInfo::Byte => Some(Width::W8),
            TypeInfo::Int32 => Some(Width::W32),
            TypeInfo::Int64 => Some(Width::W64),
            _ => None,
        };
        let unsupported = || CompileError::unsupported_operator(operator, &ty, span);
        match (operator, &ty) {
            (UnaryOp::Not, TypeInfo::Bool) => self.emit(Opcode::LogicalNot),
            (UnaryOp::Negate, TypeInfo::Float32) => self.call_builtin("neg_f32", span)?,
            (UnaryOp::Negate, TypeInfo::Float64) => self.call_builtin("neg_f64", span)?,
            (UnaryOp::Negate, _) => {
                let opcode = width.and_then(|w| Opcode::Neg8.with_width(w)).ok_or_else(unsupported)?;
                self.emit(opcode);
            }
            (UnaryOp::BitNot, _) => {
                let opcode = width
                    .and_then(|w| Opcode::BitwiseNot8.with_width(w))
                    .ok_or_else(unsupported)?;
                self.emit(opcode);
            }
            _ => return Err(unsupported()),
        }
        Ok(ty)
    }

    /// Call a function of the builtin module by name.
    fn call_builtin(&mut self, name: &str, span: Span) -> CompileResult<()> {
        let builtin = self
            .current
            .module
            .imports()
            .into_iter()
            .find(|m| m.name() == BUILTIN_MODULE_NAME)
            .ok_or_else(|| CompileError::new("builtin module is not imported", span))?;
        let index = builtin
            .find_function(name)
            .ok_or_else(|| CompileError::undefined_name(name, span))?;
        self.emit_call(&builtin, index, span)
    }

    /// Best guess at the type of `expr` without compiling it. Plain integer
    /// literals adapt to their context, so they give no hint.
    pub(super) fn infer_hint(&self, expr: &Expr) -> Option<TypeInfo> {
        match &expr.kind {
            ExprKind::Literal(Literal::Int32(_)) => None,
            ExprKind::Literal(literal) => Some(match literal {
                Literal::Bool(_) => TypeInfo::Bool,
                Literal::Byte(_) => TypeInfo::Byte,
                Literal::Char(_) => TypeInfo::Char,
                Literal::Int64(_) => TypeInfo::Int64,
                Literal::Float32(_) => TypeInfo::Float32,
                Literal::Float64(_) => TypeInfo::Float64,
                _ => TypeInfo::String,
            }),
            ExprKind::Variable(name) => match self.resolve_name(name, expr.span).ok()? {
                Resolved::Stack { ty, .. } => Some(ty),
                Resolved::Value { module, index } => module.get_value(index).map(|v| v.type_info()),
                Resolved::Function { module, index } => {
                    let function = module.get_function(index)?;
                    (!function.is_generic() && !function.signature.return_type.is_unknown())
                        .then(|| TypeInfo::function((*function.signature).clone()))
                }
                Resolved::Computed { module, index } => known_return_type(&module, index),
            },
            ExprKind::Grouping(inner) | ExprKind::Unary { operand: inner, .. } => self.infer_hint(inner),
            ExprKind::Binary {
                left,
                operator,
                right,
            } => match operator {
                op if op.is_comparison() => Some(TypeInfo::Bool),
                BinaryOp::And | BinaryOp::Or => Some(TypeInfo::Bool),
                _ => self.infer_hint(left).or_else(|| self.infer_hint(right)),
            },
            ExprKind::Call { callee, .. } => match &callee.kind {
                ExprKind::Variable(name) => match self.resolve_name(name, callee.span).ok()? {
                    Resolved::Function { module, index } => known_return_type(&module, index),
                    Resolved::Stack { ty, .. } => ty
                        .signature()
                        .map(|sig| sig.return_type.clone())
                        .filter(|t| !t.is_generic()),
                    _ => None,
                },
                _ => None,
            },
            ExprKind::Index { object, .. } => self.infer_hint(object)?.elem_type().cloned(),
            ExprKind::TupleField { object, index } => match self.infer_hint(object)? {
                TypeInfo::Tuple(items) => items.get(*index).cloned(),
                _ => None,
            },
            _ => None,
        }
    }

    // ===== Control flow =====

    fn compile_if(
        &mut self,
        condition: &Expr,
        then_branch: &Expr,
        else_branch: Option<&Expr>,
        expected: Option<&TypeInfo>,
    ) -> CompileResult<TypeInfo> {
        let cond = self.compile_expr(condition, Some(&TypeInfo::Bool))?;
        if !cond.is_identical(&TypeInfo::Bool) {
            return Err(CompileError::mismatch(TypeInfo::Bool, cond, condition.span));
        }
        let else_label = self.current.code.add_jump(Opcode::JumpIfNot);
        self.current.depth -= 1;
        let start = self.current.depth;

        let Some(else_branch) = else_branch else {
            let ty = self.compile_expr(then_branch, None)?;
            self.drop_value(&ty, then_branch.span)?;
            self.current.code.bind(else_label);
            return Ok(TypeInfo::Void);
        };

        let then_type = self.compile_expr(then_branch, expected)?;
        let end_label = self.current.code.add_jump(Opcode::Jump);
        self.current.code.bind(else_label);
        self.current.depth = start;
        let else_type = self.compile_expr(else_branch, Some(&then_type))?;
        if then_type != else_type {
            return Err(CompileError::mismatch(&then_type, &else_type, else_branch.span));
        }
        self.current.code.bind(end_label);
        Ok(then_type.unify(&else_type).unwrap_or(then_type))
    }

    fn compile_block(&mut self, block: &Block, expected: Option<&TypeInfo>, span: Span) -> CompileResult<TypeInfo> {
        let outer = self.current.scope;
        self.current.scope = self
            .current
            .module
            .symtab_mut()
            .add_scope(outer, ScopeKind::Block, "");
        let result = self.compile_block_body(block, expected, span);
        self.current.scope = outer;
        result
    }

    fn compile_block_body(
        &mut self,
        block: &Block,
        expected: Option<&TypeInfo>,
        span: Span,
    ) -> CompileResult<TypeInfo> {
        let mut locals: Vec<(usize, TypeInfo)> = Vec::new();
        for stmt in &block.statements {
            match &stmt.kind {
                StmtKind::Expression(expr) => {
                    let ty = self.compile_expr(expr, None)?;
                    self.drop_value(&ty, expr.span)?;
                }
                StmtKind::Let {
                    name,
                    type_annotation,
                    initializer,
                } => {
                    if let ExprKind::Lambda(decl) = &initializer.kind {
                        let decl = bind_lambda(name, decl, type_annotation.as_ref())?;
                        let signature = self.declared_signature(&decl)?;
                        self.declare_nested_function(&decl, signature)?;
                        continue;
                    }
                    let annotated = type_annotation
                        .as_ref()
                        .map(|a| self.resolve_type(a))
                        .transpose()?;
                    let offset = self.current.depth;
                    let ty = self.compile_expr(initializer, annotated.as_ref())?;
                    let ty = match &annotated {
                        Some(annotated) if annotated != &ty => {
                            return Err(CompileError::mismatch(annotated, &ty, initializer.span))
                        }
                        Some(annotated) => annotated.unify(&ty).unwrap_or(ty),
                        None => ty,
                    };
                    if ty.is_generic() {
                        return Err(CompileError::cannot_infer(format!("variable '{}'", name), stmt.span));
                    }
                    self.current.module.symtab_mut().add(
                        self.current.scope,
                        name.clone(),
                        Symbol::Local {
                            offset,
                            ty: ty.clone(),
                        },
                    );
                    locals.push((offset, ty));
                }
                StmtKind::Function(decl) => {
                    let signature = self.declared_signature(decl)?;
                    self.declare_nested_function(decl, signature)?;
                }
            }
        }

        let ty = match &block.value {
            Some(value) => self.compile_expr(value, expected)?,
            None => TypeInfo::Void,
        };

        let locals_size: usize = locals.iter().map(|(_, t)| t.size()).sum();
        for (offset, local) in &locals {
            for slot in local.heap_slots() {
                self.emit1(
                    Opcode::DecRef,
                    self.current.depth - (offset + slot) - HANDLE_SIZE,
                    span,
                )?;
            }
        }
        if locals_size > 0 {
            self.emit2(Opcode::Drop, ty.size(), locals_size, span)?;
        }
        Ok(ty)
    }

    // ===== Tuples and lists =====

    fn compile_tuple(&mut self, items: &[Expr], expected: Option<&TypeInfo>) -> CompileResult<TypeInfo> {
        let hints: &[TypeInfo] = match expected {
            Some(TypeInfo::Tuple(hints)) => hints,
            _ => &[],
        };
        let mut types = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            types.push(self.compile_expr(item, hints.get(i))?);
        }
        Ok(TypeInfo::Tuple(types))
    }

    fn compile_tuple_field(&mut self, object: &Expr, index: usize, span: Span) -> CompileResult<TypeInfo> {
        let ty = self.compile_expr(object, None)?;
        let TypeInfo::Tuple(items) = &ty else {
            return Err(CompileError::mismatch("tuple", &ty, object.span));
        };
        let item = items.get(index).cloned().ok_or_else(|| {
            CompileError::new(format!("tuple {} has no field {}", ty, index), span)
        })?;

        let total = ty.size();
        let mut pos = 0;
        let mut before = 0;
        for (i, other) in items.iter().enumerate() {
            if i == index {
                before = pos;
            } else {
                for slot in other.heap_slots() {
                    self.emit1(Opcode::DecRef, total - (pos + slot) - HANDLE_SIZE, span)?;
                }
            }
            pos += other.size();
        }
        let after = total - before - item.size();
        if after > 0 {
            self.emit2(Opcode::Drop, 0, after, span)?;
        }
        if before > 0 {
            self.emit2(Opcode::Drop, item.size(), before, span)?;
        }
        Ok(item)
    }

    fn compile_index(&mut self, object: &Expr, index: &Expr, span: Span) -> CompileResult<TypeInfo> {
        let index_type = self.compile_expr(index, Some(&TypeInfo::Int32))?;
        if !index_type.is_identical(&TypeInfo::Int32) {
            return Err(CompileError::mismatch(TypeInfo::Int32, index_type, index.span));
        }
        let list = self.compile_expr(object, None)?;
        let elem = match list.elem_type() {
            Some(elem) if !elem.is_generic() => elem.clone(),
            Some(_) => return Err(CompileError::cannot_infer("list element type", object.span)),
            None => return Err(CompileError::mismatch("list", &list, object.span)),
        };
        let elem_index = self.type_operand(&elem);
        self.emit1(Opcode::Subscript, elem_index, span)?;
        Ok(elem)
    }

    fn compile_list(&mut self, items: &[Expr], expected: Option<&TypeInfo>, span: Span) -> CompileResult<TypeInfo> {
        let mut elem = expected
            .and_then(TypeInfo::elem_type)
            .filter(|t| !t.is_generic())
            .cloned();
        for item in items {
            let ty = self.compile_expr(item, elem.as_ref())?;
            match &elem {
                Some(elem) if elem != &ty => return Err(CompileError::mismatch(elem, &ty, item.span)),
                Some(_) => {}
                None => elem = Some(ty),
            }
        }
        let Some(elem) = elem else {
            return Err(CompileError::cannot_infer("empty list", span));
        };
        let elem_index = self.type_operand(&elem);
        self.emit2(Opcode::MakeList, items.len(), elem_index, span)?;
        Ok(TypeInfo::list(elem))
    }
}

/// Return type of a module function if it is already known.
fn known_return_type(module: &crate::module::Module, index: usize) -> Option<TypeInfo> {
    let function = get_function(module, index, Span::default()).ok()?;
    if matches!(function.body, FunctionBody::Generic(_)) {
        return None;
    }
    Some(function.signature.return_type.clone()).filter(|t| !t.is_unknown())
}

/// 8-bit integer instruction for a binary operator.
fn int_opcode(operator: BinaryOp) -> Option<Opcode> {
    Some(match operator {
        BinaryOp::Add => Opcode::Add8,
        BinaryOp::Subtract => Opcode::Sub8,
        BinaryOp::Multiply => Opcode::Mul8,
        BinaryOp::Divide => Opcode::Div8,
        BinaryOp::Modulo => Opcode::Mod8,
        BinaryOp::Power => Opcode::Exp8,
        BinaryOp::Equal => Opcode::Equal8,
        BinaryOp::NotEqual => Opcode::NotEqual8,
        BinaryOp::Less => Opcode::LessThan8,
        BinaryOp::LessEqual => Opcode::LessEqual8,
        BinaryOp::Greater => Opcode::GreaterThan8,
        BinaryOp::GreaterEqual => Opcode::GreaterEqual8,
        BinaryOp::BitAnd => Opcode::BitwiseAnd8,
        BinaryOp::BitOr => Opcode::BitwiseOr8,
        BinaryOp::BitXor => Opcode::BitwiseXor8,
        BinaryOp::ShiftLeft => Opcode::ShiftLeft8,
        BinaryOp::ShiftRight => Opcode::ShiftRight8,
        BinaryOp::And | BinaryOp::Or => return None,
    })
}

fn float_native(operator: BinaryOp) -> Option<&'static str> {
    Some(match operator {
        BinaryOp::Add => "add",
        BinaryOp::Subtract => "sub",
        BinaryOp::Multiply => "mul",
        BinaryOp::Divide => "div",
        BinaryOp::Modulo => "mod",
        BinaryOp::Power => "exp",
        BinaryOp::Equal => "equal",
        BinaryOp::NotEqual => "not_equal",
        BinaryOp::Less => "less_than",
        BinaryOp::LessEqual => "less_equal",
        BinaryOp::Greater => "greater_than",
        BinaryOp::GreaterEqual => "greater_equal",
        _ => return None,
    })
}
