//! Calls: direct, through function values, generic instantiation and
//! partial application.

use std::rc::Rc;

use tracing::debug;

use crate::ast::{Expr, ExprKind, FunctionDecl};
use crate::bytecode::{Code, Opcode};
use crate::error::CompileError;
use crate::module::{Function, FunctionBody, Module, NormalBody};
use crate::span::Span;
use crate::types::{Signature, TypeInfo};

use super::{get_function, CompileResult, Compiler, Resolved};

impl Compiler {
    pub(super) fn compile_call(&mut self, callee: &Expr, args: &[Expr], span: Span) -> CompileResult<TypeInfo> {
        let mut target = callee;
        while let ExprKind::Grouping(inner) = &target.kind {
            target = inner;
        }
        match &target.kind {
            ExprKind::Variable(name) => match self.resolve_name(name, target.span)? {
                Resolved::Function { module, index } => self.call_function(&module, index, args, span),
                _ => self.call_value(target, args, span),
            },
            ExprKind::Lambda(decl) => self.call_lambda(decl, args, span),
            _ => self.call_value(target, args, span),
        }
    }

    /// Push arguments last first, so the first one ends up on top. Returns
    /// their types in parameter order.
    fn compile_arguments(&mut self, args: &[Expr], params: &[TypeInfo]) -> CompileResult<Vec<TypeInfo>> {
        let mut types = vec![TypeInfo::Unknown; args.len()];
        for (i, arg) in args.iter().enumerate().rev() {
            let param = params.get(i).cloned().unwrap_or(TypeInfo::Unknown);
            let hint = Some(&param).filter(|t| !t.is_unknown());
            let ty = self.compile_expr(arg, hint)?;
            if param != ty {
                return Err(CompileError::mismatch(&param, &ty, arg.span));
            }
            types[i] = ty;
        }
        Ok(types)
    }

    fn call_function(
        &mut self,
        module: &Rc<Module>,
        index: usize,
        args: &[Expr],
        span: Span,
    ) -> CompileResult<TypeInfo> {
        let function = get_function(module, index, span)?;
        if function.is_generic() {
            return self.call_generic(module, index, args, span);
        }
        let params = function.signature.params.clone();
        if args.len() > params.len() || (args.is_empty() && !params.is_empty()) {
            return Err(CompileError::wrong_argument_count(params.len(), args.len(), span));
        }
        self.compile_arguments(args, &params)?;
        self.ensure_compiled(module, index)?;
        if args.len() < params.len() {
            return self.partial_application(module, index, args.len(), span);
        }
        let ty = self.call_return_type(module, index, span)?;
        let function = get_function(module, index, span)?;
        self.push_captures(&function, span)?;
        self.emit_call(module, index, span)?;
        Ok(ty)
    }

    fn call_generic(
        &mut self,
        module: &Rc<Module>,
        index: usize,
        args: &[Expr],
        span: Span,
    ) -> CompileResult<TypeInfo> {
        let generic = get_function(module, index, span)?;
        let params = generic.signature.params.clone();
        if args.len() != params.len() {
            return Err(CompileError::generic_instantiation(
                &generic.name,
                format!("expected {} arguments, got {}", params.len(), args.len()),
                span,
            ));
        }
        let found = self.compile_arguments(args, &params)?;
        let mut types = Vec::with_capacity(found.len());
        for ((param, ty), arg) in params.iter().zip(&found).zip(args) {
            let unified = param
                .unify(ty)
                .ok_or_else(|| CompileError::mismatch(param, ty, arg.span))?;
            if unified.is_generic() {
                return Err(CompileError::cannot_infer(
                    format!("argument of generic function '{}'", generic.name),
                    arg.span,
                ));
            }
            types.push(unified);
        }
        let instance = self.instantiate(module, index, types, span)?;
        let ty = self.call_return_type(module, instance, span)?;
        let function = get_function(module, instance, span)?;
        self.push_captures(&function, span)?;
        self.emit_call(module, instance, span)?;
        Ok(ty)
    }

    /// Find or compile the instance of generic function `generic` for the
    /// given parameter types.
    pub(super) fn instantiate(
        &mut self,
        module: &Rc<Module>,
        generic: usize,
        types: Vec<TypeInfo>,
        span: Span,
    ) -> CompileResult<usize> {
        if let Some(instance) = module.find_instance(generic, &types) {
            return Ok(instance);
        }
        let function = get_function(module, generic, span)?;
        let FunctionBody::Generic(body) = &function.body else {
            return Err(CompileError::new(format!("'{}' is not generic", function.name), span));
        };

        let mut signature = Signature::new(types.clone(), function.signature.return_type.clone());
        signature.nonlocals = function.signature.nonlocals.clone();
        let type_names: Vec<String> = types.iter().map(|t| t.to_string()).collect();
        let name = format!("{}<{}>", function.name, type_names.join(", "));
        debug!(module = module.name(), function = %name, "instantiating generic function");

        let mut placeholder = Function::new(name, signature);
        placeholder.captures = function.captures.clone();
        let instance = module.add_function(placeholder);
        module.add_instance(generic, types, instance);

        let level = self.enclosing.len();
        if let Err(err) = self.compile_function(module.clone(), instance, &body.declaration, body.scope) {
            module.remove_instance(instance);
            self.unwind_to(level);
            return Err(CompileError::generic_instantiation(
                &function.name,
                err.to_string(),
                span,
            ));
        }
        Ok(instance)
    }

    /// Restore the function compiler that was current when `enclosing`
    /// had `level` entries, abandoning any left behind by a failed body.
    fn unwind_to(&mut self, level: usize) {
        while self.enclosing.len() > level {
            let Some(outer) = self.enclosing.pop() else {
                break;
            };
            let abandoned = std::mem::replace(&mut self.current, outer);
            self.in_progress
                .remove(&(Rc::as_ptr(&abandoned.module), abandoned.index));
        }
    }

    fn call_lambda(&mut self, decl: &Rc<FunctionDecl>, args: &[Expr], span: Span) -> CompileResult<TypeInfo> {
        if args.len() != decl.params.len() {
            return Err(CompileError::wrong_argument_count(decl.params.len(), args.len(), span));
        }
        let declared = self.declared_signature(decl)?;
        let found = self.compile_arguments(args, &declared.params)?;
        let params = declared
            .params
            .iter()
            .zip(&found)
            .map(|(param, ty)| param.unify(ty).unwrap_or_else(|| ty.clone()))
            .collect::<Vec<_>>();
        if let Some(pos) = params.iter().position(TypeInfo::is_generic) {
            return Err(CompileError::cannot_infer("lambda parameter", args[pos].span));
        }
        let signature = Signature::new(params, declared.return_type);
        let index = self.declare_nested_function(decl, signature)?;
        let module = self.current.module.clone();
        let ty = self.call_return_type(&module, index, span)?;
        let function = get_function(&module, index, span)?;
        self.push_captures(&function, span)?;
        self.emit_call(&module, index, span)?;
        Ok(ty)
    }

    /// Call through a function value: arguments, then the closure on top.
    fn call_value(&mut self, callee: &Expr, args: &[Expr], span: Span) -> CompileResult<TypeInfo> {
        let hint = self.infer_hint(callee);
        let params = hint
            .as_ref()
            .and_then(TypeInfo::signature)
            .map(|sig| sig.params.clone())
            .unwrap_or_default();
        let found = self.compile_arguments(args, &params)?;
        let hint = hint.unwrap_or_else(|| TypeInfo::function(Signature::new(found.clone(), TypeInfo::Unknown)));
        let ty = self.compile_expr(callee, Some(&hint))?;
        let Some(signature) = ty.signature().cloned() else {
            return Err(CompileError::not_callable(&ty, callee.span));
        };
        if signature.params.len() != args.len() {
            return Err(CompileError::wrong_argument_count(signature.params.len(), args.len(), span));
        }
        for ((param, ty), arg) in signature.params.iter().zip(&found).zip(args) {
            if param != ty {
                return Err(CompileError::mismatch(param, ty, arg.span));
            }
        }
        self.emit(Opcode::Execute);
        Ok(signature.return_type.clone())
    }

    /// Push the captured variables of `function` in prefix order.
    pub(super) fn push_captures(&mut self, function: &Function, span: Span) -> CompileResult<()> {
        for (name, expected) in function
            .captures
            .iter()
            .zip(&function.signature.nonlocals)
            .rev()
        {
            let ty = self.compile_variable(name, Some(expected), span)?;
            self.current.depth += ty.size();
            if &ty != expected {
                return Err(CompileError::mismatch(expected, &ty, span));
            }
        }
        Ok(())
    }

    /// Call `index` of `module`, inlining fragments.
    pub(super) fn emit_call(&mut self, module: &Rc<Module>, index: usize, span: Span) -> CompileResult<()> {
        let function = get_function(module, index, span)?;
        if function.is_fragment() {
            if let Some(code) = function.code() {
                self.current.code.append(code);
            }
            return Ok(());
        }
        if Rc::ptr_eq(module, &self.current.module) {
            return self.emit1(Opcode::Call0, index, span);
        }
        match self.import_index(module, span)? {
            0 => self.emit1(Opcode::Call1, index, span),
            import => self.emit2(Opcode::Call, import, index, span),
        }
    }

    fn import_index(&self, module: &Rc<Module>, span: Span) -> CompileResult<usize> {
        let current = &self.current.module;
        let import = current.import_visible(module).ok_or_else(|| {
            CompileError::new(
                format!("module '{}' is not imported by '{}'", module.name(), current.name()),
                span,
            )
        })?;
        if import > u8::MAX as usize {
            return Err(CompileError::new(
                format!(
                    "too many imported modules: calling into '{}' needs import {} of '{}', at most {} are addressable",
                    module.name(),
                    import,
                    current.name(),
                    u8::MAX as usize + 1
                ),
                span,
            ));
        }
        Ok(import)
    }

    /// Code that forwards a call to `index` of `module`, for use as the body
    /// of a function in the current module.
    fn forwarding_body(&self, module: &Rc<Module>, index: usize, span: Span) -> CompileResult<FunctionBody> {
        let function = get_function(module, index, span)?;
        let same_module = Rc::ptr_eq(module, &self.current.module);
        let in_progress = self.in_progress.contains(&(Rc::as_ptr(module), index));
        match &function.body {
            FunctionBody::Native(delegate) => return Ok(FunctionBody::Native(delegate.clone())),
            FunctionBody::Normal(body) if body.is_fragment || (same_module && !in_progress) => {
                return Ok(FunctionBody::Normal(NormalBody {
                    code: body.code.clone(),
                    intrinsics: body.intrinsics,
                    is_fragment: false,
                }))
            }
            _ => {}
        }
        let mut code = Code::new();
        let index_arg = u8::try_from(index)
            .map_err(|_| CompileError::operand_out_of_range(format!("function index {}", index), span))?;
        if same_module {
            code.add_opcode(Opcode::Call0);
            code.add_arg(index_arg);
        } else {
            match self.import_index(module, span)? {
                0 => {
                    code.add_opcode(Opcode::Call1);
                    code.add_arg(index_arg);
                }
                import => {
                    let import_arg = u8::try_from(import).map_err(|_| {
                        CompileError::operand_out_of_range(format!("import index {}", import), span)
                    })?;
                    code.add_opcode(Opcode::Call);
                    code.add_arg(import_arg);
                    code.add_arg(index_arg);
                }
            }
        }
        Ok(FunctionBody::Normal(NormalBody {
            code,
            intrinsics: 0,
            is_fragment: false,
        }))
    }

    /// Bind the first `bound` arguments, already on the stack, into a
    /// closure over a wrapper taking the remaining parameters.
    fn partial_application(
        &mut self,
        module: &Rc<Module>,
        index: usize,
        bound: usize,
        span: Span,
    ) -> CompileResult<TypeInfo> {
        let function = get_function(module, index, span)?;
        let return_type = self.call_return_type(module, index, span)?;
        let params = &function.signature.params;

        let mut signature = Signature::new(params[bound..].to_vec(), return_type.clone());
        signature.partial = params[..bound].to_vec();
        signature.nonlocals = function.signature.nonlocals.clone();
        let wrapper = Function {
            name: format!("{}/{}", function.name, bound),
            signature: Rc::new(signature),
            body: self.forwarding_body(module, index, span)?,
            captures: function.captures.clone(),
        };
        let captures = wrapper.clone();
        let wrapper_index = self.current.module.add_function(wrapper);

        self.push_captures(&captures, span)?;
        self.emit1(Opcode::MakeClosure, wrapper_index, span)?;
        Ok(TypeInfo::function(Signature::new(params[bound..].to_vec(), return_type)))
    }

    /// Push a closure for a named function.
    pub(super) fn compile_function_value(
        &mut self,
        module: &Rc<Module>,
        index: usize,
        expected: Option<&TypeInfo>,
        span: Span,
    ) -> CompileResult<TypeInfo> {
        let mut index = index;
        let function = get_function(module, index, span)?;
        if function.is_generic() {
            let expected = expected
                .and_then(TypeInfo::signature)
                .filter(|sig| !sig.is_generic())
                .ok_or_else(|| {
                    CompileError::cannot_infer(format!("instance of generic function '{}'", function.name), span)
                })?;
            if expected.params.len() != function.signature.params.len() {
                return Err(CompileError::wrong_argument_count(
                    function.signature.params.len(),
                    expected.params.len(),
                    span,
                ));
            }
            index = self.instantiate(module, index, expected.params.clone(), span)?;
        }
        self.ensure_compiled(module, index)?;
        let return_type = self.call_return_type(module, index, span)?;
        let function = get_function(module, index, span)?;
        let ty = TypeInfo::function(Signature::new(function.signature.params.clone(), return_type));

        let local = if Rc::ptr_eq(module, &self.current.module) && !function.is_fragment() {
            index
        } else {
            let wrapper = Function {
                name: function.name.clone(),
                signature: function.signature.clone(),
                body: self.forwarding_body(module, index, span)?,
                captures: function.captures.clone(),
            };
            self.current.module.add_function(wrapper)
        };

        if function.captures.is_empty() {
            self.emit1(Opcode::LoadFunction, local, span)?;
        } else {
            self.push_captures(&function, span)?;
            self.emit1(Opcode::MakeClosure, local, span)?;
        }
        Ok(ty)
    }
}
