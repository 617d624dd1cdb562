//! AST-to-bytecode compiler.
//!
//! Module-level declarations are registered first, so a function may refer
//! to names defined later in the same module. Function bodies compile on
//! first use or in declaration order, whichever comes first. Generic
//! functions keep their AST and compile one instance per distinct list of
//! argument types.
//!
//! Every expression leaves exactly `type.size()` bytes on the stack. The
//! compiler tracks how many bytes the current function has pushed above its
//! frame base, which is where new locals land.

mod calls;
mod closures;
mod expressions;

use std::collections::HashSet;
use std::rc::Rc;

use indexmap::IndexMap;
use tracing::debug;

use crate::ast::{Expr, ExprKind, FunctionDecl, Literal, Program, StmtKind, TypeAnnotation, TypeKind};
use crate::bytecode::{Code, Opcode};
use crate::error::CompileError;
use crate::module::{Function, FunctionBody, GenericBody, Module, NormalBody};
use crate::span::Span;
use crate::symtab::{ScopeId, ScopeKind, Symbol, ROOT_SCOPE};
use crate::types::{Signature, TypeInfo};
use crate::vm::value::Value;

/// Result type for compilation.
pub type CompileResult<T> = Result<T, CompileError>;

#[derive(Debug, Clone)]
pub struct CompilerOptions {
    /// Hand the value of every non-final top-level expression statement to
    /// the invoke callback. When off, those values are dropped.
    pub invoke_statements: bool,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            invoke_statements: true,
        }
    }
}

/// Compile `program` into `module` and return the index of its `main` function.
pub fn compile_module(
    module: &Rc<Module>,
    program: &Program,
    options: &CompilerOptions,
) -> CompileResult<usize> {
    Compiler::new(module.clone(), options.clone()).compile_program(program)
}

/// State of one function being compiled.
struct FunctionCompiler {
    module: Rc<Module>,
    index: usize,
    name: String,
    signature: Signature,
    captures: Vec<String>,
    code: Code,
    /// Innermost scope
    scope: ScopeId,
    /// Bytes pushed above the frame base
    depth: usize,
}

impl FunctionCompiler {
    fn module_level(module: Rc<Module>) -> Self {
        Self {
            name: module.name().to_string(),
            module,
            index: 0,
            signature: Signature::empty(),
            captures: Vec::new(),
            code: Code::new(),
            scope: ROOT_SCOPE,
            depth: 0,
        }
    }
}

/// What a name refers to, as seen from the current function.
enum Resolved {
    /// Value in the frame prefix or a local: read with `opcode(offset, size)`
    Stack {
        opcode: Opcode,
        offset: usize,
        ty: TypeInfo,
    },
    Function { module: Rc<Module>, index: usize },
    Computed { module: Rc<Module>, index: usize },
    Value { module: Rc<Module>, index: usize },
}

pub struct Compiler {
    options: CompilerOptions,
    /// The module receiving the program
    module: Rc<Module>,
    current: FunctionCompiler,
    /// Suspended outer functions
    enclosing: Vec<FunctionCompiler>,
    /// Module functions declared but not compiled yet, in declaration order
    pending: IndexMap<usize, Rc<FunctionDecl>>,
    /// Functions whose body is being compiled
    in_progress: HashSet<(*const Module, usize)>,
}

impl Compiler {
    pub fn new(module: Rc<Module>, options: CompilerOptions) -> Self {
        Self {
            options,
            current: FunctionCompiler::module_level(module.clone()),
            module,
            enclosing: Vec::new(),
            pending: IndexMap::new(),
            in_progress: HashSet::new(),
        }
    }

    /// Compile a whole program. Top-level expression statements form the
    /// `main` function; the trailing expression, if any, is its result.
    pub fn compile_program(&mut self, program: &Program) -> CompileResult<usize> {
        let mut statements = Vec::new();
        for stmt in &program.statements {
            match &stmt.kind {
                StmtKind::Expression(expr) => statements.push(expr),
                StmtKind::Function(decl) => self.declare_module_function(decl.clone())?,
                StmtKind::Let {
                    name,
                    type_annotation,
                    initializer,
                } => self.declare_module_let(name, type_annotation.as_ref(), initializer, stmt.span)?,
            }
        }

        let declared: Vec<usize> = self.pending.keys().copied().collect();
        let module = self.module.clone();
        for index in declared {
            self.ensure_compiled(&module, index)?;
        }

        let main = module.add_function(Function::new("main", Signature::empty()));
        self.begin_function(module, main, ROOT_SCOPE, &[], Span::default())?;
        for expr in statements {
            let ty = self.compile_expr(expr, None)?;
            self.finish_statement(&ty, expr.span)?;
        }
        let (ty, span) = match &program.value {
            Some(expr) => (self.compile_expr(expr, None)?, expr.span),
            None => (TypeInfo::Void, Span::default()),
        };
        self.end_function(&ty, span)?;
        Ok(main)
    }

    fn finish_statement(&mut self, ty: &TypeInfo, span: Span) -> CompileResult<()> {
        if ty.size() == 0 {
            return Ok(());
        }
        if self.options.invoke_statements {
            let index = self.type_operand(ty);
            self.emit1(Opcode::Invoke, index, span)?;
            self.current.depth = self.current.depth.saturating_sub(ty.size());
            Ok(())
        } else {
            self.drop_value(ty, span)
        }
    }

    // ===== Module-level declarations =====

    fn declare_module_function(&mut self, decl: Rc<FunctionDecl>) -> CompileResult<()> {
        let signature = self.declared_signature(&decl)?;
        let index = if signature.is_generic() {
            let mut function = Function::new(decl.name.clone(), signature);
            function.body = FunctionBody::Generic(GenericBody {
                declaration: decl.clone(),
                scope: ROOT_SCOPE,
            });
            self.module.add_function(function)
        } else {
            let index = self
                .module
                .add_function(Function::new(decl.name.clone(), signature));
            self.pending.insert(index, decl.clone());
            index
        };
        self.module.define(&decl.name, Symbol::Function { index });
        Ok(())
    }

    fn declare_module_let(
        &mut self,
        name: &str,
        annotation: Option<&TypeAnnotation>,
        initializer: &Expr,
        span: Span,
    ) -> CompileResult<()> {
        match &initializer.kind {
            ExprKind::Lambda(decl) => {
                let decl = bind_lambda(name, decl, annotation)?;
                self.declare_module_function(decl)
            }
            ExprKind::Literal(literal) => {
                let expected = annotation.map(|a| self.resolve_type(a)).transpose()?;
                let value = literal_value(&self.module, literal, expected.as_ref());
                let ty = value.type_info();
                if let Some(expected) = &expected {
                    if expected != &ty {
                        let _ = value.decref(self.module.heap());
                        return Err(CompileError::mismatch(expected, ty, initializer.span));
                    }
                }
                let index = self.module.add_value(value);
                self.module.define(name, Symbol::Value { index });
                Ok(())
            }
            _ => {
                let return_type = annotation
                    .map(|a| self.resolve_type(a))
                    .transpose()?
                    .unwrap_or(TypeInfo::Unknown);
                let decl = Rc::new(FunctionDecl {
                    name: name.to_string(),
                    params: Vec::new(),
                    return_type: annotation.cloned(),
                    body: initializer.clone(),
                    span,
                });
                let index = self
                    .module
                    .add_function(Function::new(name, Signature::new(Vec::new(), return_type)));
                self.pending.insert(index, decl);
                self.module.define(name, Symbol::Computed { index });
                Ok(())
            }
        }
    }

    /// Compile a declared module function now if its body is still pending.
    fn ensure_compiled(&mut self, module: &Rc<Module>, index: usize) -> CompileResult<()> {
        if !Rc::ptr_eq(module, &self.module) {
            return Ok(());
        }
        let Some(decl) = self.pending.shift_remove(&index) else {
            return Ok(());
        };
        self.compile_function(module.clone(), index, &decl, ROOT_SCOPE)
    }

    // ===== Functions =====

    /// Compile the body of `decl` into the placeholder function `index`,
    /// whose signature and captures are already set.
    fn compile_function(
        &mut self,
        module: Rc<Module>,
        index: usize,
        decl: &FunctionDecl,
        parent: ScopeId,
    ) -> CompileResult<()> {
        let params: Vec<String> = decl.params.iter().map(|p| p.name.clone()).collect();
        self.begin_function(module, index, parent, &params, decl.span)?;
        let expected = Some(self.current.signature.return_type.clone()).filter(|t| !t.is_unknown());
        let ty = self.compile_expr(&decl.body, expected.as_ref())?;
        self.end_function(&ty, decl.body.span)
    }

    fn begin_function(
        &mut self,
        module: Rc<Module>,
        index: usize,
        parent: ScopeId,
        params: &[String],
        span: Span,
    ) -> CompileResult<()> {
        let placeholder = get_function(&module, index, span)?;
        let signature = (*placeholder.signature).clone();
        let scope = {
            let mut symtab = module.symtab_mut();
            let scope = symtab.add_scope(parent, ScopeKind::Function, placeholder.name.clone());
            let mut offset = 0;
            for (i, (name, ty)) in placeholder
                .captures
                .iter()
                .zip(&signature.nonlocals)
                .enumerate()
            {
                let ty = ty.clone();
                let size = ty.size();
                symtab.add(scope, name.clone(), Symbol::Nonlocal { index: i, offset, ty });
                offset += size;
            }
            offset += signature.raw_size_of_partial();
            for (i, (name, ty)) in params.iter().zip(&signature.params).enumerate() {
                let ty = ty.clone();
                let size = ty.size();
                symtab.add(scope, name.clone(), Symbol::Parameter { index: i, offset, ty });
                offset += size;
            }
            scope
        };
        self.in_progress.insert((Rc::as_ptr(&module), index));
        let function = FunctionCompiler {
            module,
            index,
            name: placeholder.name.clone(),
            signature,
            captures: placeholder.captures.clone(),
            code: Code::new(),
            scope,
            depth: 0,
        };
        self.enclosing
            .push(std::mem::replace(&mut self.current, function));
        Ok(())
    }

    /// Resolve the return type, emit the epilogue and install the function.
    fn end_function(&mut self, body_type: &TypeInfo, span: Span) -> CompileResult<()> {
        self.current
            .signature
            .resolve_return_type(body_type)
            .map_err(|c| CompileError::unexpected_return_type(c.declared, c.found, span))?;

        // release the prefix under the result
        let result_size = body_type.size();
        for (offset, ty) in prefix_items(&self.current.signature) {
            for slot in ty.heap_slots() {
                self.emit1(
                    Opcode::DecRef,
                    result_size + offset + ty.size() - slot - crate::types::HANDLE_SIZE,
                    span,
                )?;
            }
        }
        let prefix_size = self.current.signature.frame_prefix_size();
        if prefix_size > 0 {
            self.emit2(Opcode::Drop, result_size, prefix_size, span)?;
        }

        let outer = self
            .enclosing
            .pop()
            .ok_or_else(|| CompileError::new("function epilogue outside of a function", span))?;
        let mut finished = std::mem::replace(&mut self.current, outer);
        finished.code.resolve_patches().map_err(|jump| {
            CompileError::operand_out_of_range(
                format!("jump from {} to {}", jump.from, jump.to),
                span,
            )
        })?;
        self.in_progress
            .remove(&(Rc::as_ptr(&finished.module), finished.index));

        debug!(
            module = finished.module.name(),
            function = %finished.name,
            signature = %finished.signature,
            bytes = finished.code.len(),
            "compiled function"
        );
        let function = Function {
            name: finished.name,
            signature: Rc::new(finished.signature),
            body: FunctionBody::Normal(NormalBody {
                code: finished.code,
                intrinsics: 0,
                is_fragment: false,
            }),
            captures: finished.captures,
        };
        finished.module.set_function(finished.index, function);
        Ok(())
    }

    /// Parameter and return types as written. Missing parameter types are
    /// type variables and make the function generic.
    fn declared_signature(&self, decl: &FunctionDecl) -> CompileResult<Signature> {
        let params = decl
            .params
            .iter()
            .map(|p| match &p.type_annotation {
                Some(annotation) => self.resolve_type(annotation),
                None => Ok(TypeInfo::Unknown),
            })
            .collect::<CompileResult<Vec<_>>>()?;
        let return_type = match &decl.return_type {
            Some(annotation) => self.resolve_type(annotation)?,
            None => TypeInfo::Unknown,
        };
        Ok(Signature::new(params, return_type))
    }

    /// Return type of a call to `index`, which must already be compiled or
    /// be the function currently compiling.
    fn call_return_type(&self, module: &Rc<Module>, index: usize, span: Span) -> CompileResult<TypeInfo> {
        let function = get_function(module, index, span)?;
        let recursive = self.in_progress.contains(&(Rc::as_ptr(module), index));
        if recursive && function.signature.return_type.is_unknown() {
            return Err(CompileError::cannot_infer(
                format!("return type of recursive function '{}'", function.name),
                span,
            ));
        }
        Ok(function.effective_return_type())
    }

    // ===== Names =====

    fn resolve_name(&self, name: &str, span: Span) -> CompileResult<Resolved> {
        let module = &self.current.module;
        let found = module.symtab().resolve(self.current.scope, name);
        if let Some(found) = found {
            let local = !found.crossed_function;
            return match found.symbol {
                Symbol::Parameter { offset, ty, .. } | Symbol::Nonlocal { offset, ty, .. } if local => {
                    Ok(Resolved::Stack {
                        opcode: Opcode::CopyArgument,
                        offset,
                        ty,
                    })
                }
                Symbol::Local { offset, ty } if local => Ok(Resolved::Stack {
                    opcode: Opcode::CopyVariable,
                    offset,
                    ty,
                }),
                Symbol::Parameter { .. } | Symbol::Nonlocal { .. } | Symbol::Local { .. } => {
                    Err(CompileError::new(
                        format!("'{}' belongs to an enclosing function and is not captured here", name),
                        span,
                    ))
                }
                Symbol::Function { index } => Ok(Resolved::Function {
                    module: module.clone(),
                    index,
                }),
                Symbol::Computed { index } => Ok(Resolved::Computed {
                    module: module.clone(),
                    index,
                }),
                Symbol::Value { index } => Ok(Resolved::Value {
                    module: module.clone(),
                    index,
                }),
            };
        }

        // later modules shadow earlier ones, visible ones shadow imports
        let visible = module.visible_modules().into_iter().rev();
        for import in visible.chain(module.imports().into_iter().rev()) {
            match import.lookup(name) {
                Some(Symbol::Function { index }) => {
                    return Ok(Resolved::Function {
                        module: import,
                        index,
                    })
                }
                Some(Symbol::Computed { index }) => {
                    return Ok(Resolved::Computed {
                        module: import,
                        index,
                    })
                }
                Some(Symbol::Value { index }) => {
                    return Ok(Resolved::Value {
                        module: import,
                        index,
                    })
                }
                _ => {}
            }
        }
        Err(CompileError::undefined_name(name, span))
    }

    fn resolve_type(&self, annotation: &TypeAnnotation) -> CompileResult<TypeInfo> {
        Ok(match &annotation.kind {
            TypeKind::Named(name) => TypeInfo::from_name(name)
                .ok_or_else(|| CompileError::undefined_type(name, annotation.span))?,
            TypeKind::List(elem) => TypeInfo::list(self.resolve_type(elem)?),
            TypeKind::Tuple(items) => TypeInfo::Tuple(
                items
                    .iter()
                    .map(|item| self.resolve_type(item))
                    .collect::<CompileResult<_>>()?,
            ),
            TypeKind::Function {
                params,
                return_type,
            } => TypeInfo::function(Signature::new(
                params
                    .iter()
                    .map(|p| self.resolve_type(p))
                    .collect::<CompileResult<_>>()?,
                self.resolve_type(return_type)?,
            )),
        })
    }

    // ===== Emitting =====

    fn emit(&mut self, opcode: Opcode) {
        self.current.code.add_opcode(opcode);
    }

    fn emit1(&mut self, opcode: Opcode, arg: usize, span: Span) -> CompileResult<()> {
        let arg = operand(opcode, arg, span)?;
        self.current.code.add_opcode(opcode);
        self.current.code.add_arg(arg);
        Ok(())
    }

    fn emit2(&mut self, opcode: Opcode, arg0: usize, arg1: usize, span: Span) -> CompileResult<()> {
        let arg0 = operand(opcode, arg0, span)?;
        let arg1 = operand(opcode, arg1, span)?;
        self.current.code.add_opcode(opcode);
        self.current.code.add_arg(arg0);
        self.current.code.add_arg(arg1);
        Ok(())
    }

    fn type_operand(&self, ty: &TypeInfo) -> usize {
        self.current.module.add_type(ty.clone())
    }

    /// Take a reference to every handle in the value just pushed.
    fn incref_value(&mut self, ty: &TypeInfo, span: Span) -> CompileResult<()> {
        let size = ty.size();
        for slot in ty.heap_slots() {
            self.emit1(Opcode::IncRef, size - slot - crate::types::HANDLE_SIZE, span)?;
        }
        Ok(())
    }

    /// Release and remove the value on top.
    fn drop_value(&mut self, ty: &TypeInfo, span: Span) -> CompileResult<()> {
        let size = ty.size();
        for slot in ty.heap_slots() {
            self.emit1(Opcode::DecRef, size - slot - crate::types::HANDLE_SIZE, span)?;
        }
        if size > 0 {
            self.emit2(Opcode::Drop, 0, size, span)?;
        }
        self.current.depth = self.current.depth.saturating_sub(size);
        Ok(())
    }
}

fn operand(opcode: Opcode, value: usize, span: Span) -> CompileResult<u8> {
    u8::try_from(value).map_err(|_| {
        CompileError::operand_out_of_range(format!("{} operand {}", opcode, value), span)
    })
}

fn get_function(module: &Module, index: usize, span: Span) -> CompileResult<Rc<Function>> {
    module.get_function(index).ok_or_else(|| {
        CompileError::new(
            format!("function {} not found in module '{}'", index, module.name()),
            span,
        )
    })
}

/// Frame prefix entries with their offsets below the base: nonlocals,
/// partial arguments, then parameters.
fn prefix_items(signature: &Signature) -> Vec<(usize, TypeInfo)> {
    let mut offset = 0;
    signature
        .nonlocals
        .iter()
        .chain(&signature.partial)
        .chain(&signature.params)
        .map(|ty| {
            let item = (offset, ty.clone());
            offset += ty.size();
            item
        })
        .collect()
}

/// Give a lambda bound by `let` its name, and fill missing parameter and
/// return types from a function-type annotation.
fn bind_lambda(
    name: &str,
    decl: &FunctionDecl,
    annotation: Option<&TypeAnnotation>,
) -> CompileResult<Rc<FunctionDecl>> {
    let mut decl = FunctionDecl {
        name: name.to_string(),
        ..decl.clone()
    };
    if let Some(annotation) = annotation {
        let TypeKind::Function {
            params,
            return_type,
        } = &annotation.kind
        else {
            return Err(CompileError::mismatch(annotation, "function", decl.span));
        };
        if params.len() != decl.params.len() {
            return Err(CompileError::wrong_argument_count(
                params.len(),
                decl.params.len(),
                decl.span,
            ));
        }
        for (param, ty) in decl.params.iter_mut().zip(params) {
            if param.type_annotation.is_none() {
                param.type_annotation = Some(ty.clone());
            }
        }
        if decl.return_type.is_none() {
            decl.return_type = Some((**return_type).clone());
        }
    }
    Ok(Rc::new(decl))
}

/// The value of a literal, adapted to the expected type where it fits.
fn literal_value(module: &Module, literal: &Literal, expected: Option<&TypeInfo>) -> Value {
    match (literal, expected) {
        (Literal::Int32(n), Some(TypeInfo::Int64)) => Value::Int64(i64::from(*n)),
        (Literal::Int32(n), Some(TypeInfo::Byte)) if u8::try_from(*n).is_ok() => Value::Byte(*n as u8),
        (Literal::Int32(n), Some(TypeInfo::Float64)) => Value::Float64(f64::from(*n)),
        (Literal::Int32(n), Some(TypeInfo::Float32)) => Value::Float32(*n as f32),
        (Literal::Float64(x), Some(TypeInfo::Float32)) => Value::Float32(*x as f32),
        (Literal::Bool(b), _) => Value::Bool(*b),
        (Literal::Byte(b), _) => Value::Byte(*b),
        (Literal::Char(c), _) => Value::Char(*c),
        (Literal::Int32(n), _) => Value::Int32(*n),
        (Literal::Int64(n), _) => Value::Int64(*n),
        (Literal::Float32(x), _) => Value::Float32(*x),
        (Literal::Float64(x), _) => Value::Float64(*x),
        (Literal::String(s), _) => Value::string(module.heap(), s),
    }
}

#[cfg(test)]
mod tests;
