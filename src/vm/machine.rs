//! Stack-based virtual machine executing bytecode.

use std::ops::ControlFlow;
use std::rc::Rc;

use tracing::trace;

use crate::bytecode::{Opcode, Width};
use crate::error::RuntimeError;
use crate::module::{Function, FunctionBody, Module};
use crate::types::TypeInfo;
use crate::vm::heap::{Closure, FunctionRef, HeapData, HeapRef, VmResult};
use crate::vm::stack::{Frame, Stack, DEFAULT_MAX_STACK_SIZE};
use crate::vm::value::Value;

/// Limits for one machine.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Abort a call after this many instructions
    pub instruction_limit: Option<u64>,
    /// Stack size in bytes
    pub max_stack_size: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            instruction_limit: None,
            max_stack_size: DEFAULT_MAX_STACK_SIZE,
        }
    }
}

/// State visible to an observer before each instruction.
pub struct StepEvent<'a> {
    pub module: &'a Module,
    pub function: &'a Function,
    pub cursor: usize,
    pub stack: &'a [u8],
}

/// Hooks into execution. Returning `Break` from `step` aborts the call.
pub trait MachineObserver {
    fn call_enter(&mut self, _module: &Module, _function: &Function) {}

    fn call_exit(&mut self, _module: &Module, _function: &Function) {}

    fn step(&mut self, _event: &StepEvent<'_>) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }
}

pub struct Machine {
    stack: Stack,
    config: MachineConfig,
    observer: Option<Box<dyn MachineObserver>>,
    steps: u64,
}

/// Fixed-width integers the width-specialized opcodes work on.
trait Word: Copy + PartialEq + PartialOrd {
    fn pull(stack: &mut Stack) -> VmResult<Self>;
    fn push(self, stack: &mut Stack) -> VmResult<()>;
    fn is_zero(self) -> bool;
    fn add(self, rhs: Self) -> Self;
    fn sub(self, rhs: Self) -> Self;
    fn mul(self, rhs: Self) -> Self;
    fn div(self, rhs: Self) -> Self;
    fn rem(self, rhs: Self) -> Self;
    fn pow(self, rhs: Self) -> VmResult<Self>;
    fn neg(self) -> Self;
    fn not(self) -> Self;
    fn or(self, rhs: Self) -> Self;
    fn and(self, rhs: Self) -> Self;
    fn xor(self, rhs: Self) -> Self;
    fn shl(self, rhs: Self) -> Self;
    fn shr(self, rhs: Self) -> Self;
}

macro_rules! impl_word {
    ($ty:ty, $pull:ident, $push:ident) => {
        impl Word for $ty {
            fn pull(stack: &mut Stack) -> VmResult<Self> {
                stack.$pull()
            }
            fn push(self, stack: &mut Stack) -> VmResult<()> {
                stack.$push(self)
            }
            fn is_zero(self) -> bool {
                self == 0
            }
            fn add(self, rhs: Self) -> Self {
                self.wrapping_add(rhs)
            }
            fn sub(self, rhs: Self) -> Self {
                self.wrapping_sub(rhs)
            }
            fn mul(self, rhs: Self) -> Self {
                self.wrapping_mul(rhs)
            }
            fn div(self, rhs: Self) -> Self {
                self.wrapping_div(rhs)
            }
            fn rem(self, rhs: Self) -> Self {
                self.wrapping_rem(rhs)
            }
            fn pow(self, rhs: Self) -> VmResult<Self> {
                let exp = u32::try_from(rhs).map_err(|_| {
                    RuntimeError::native(format!("exponent out of range: {}", rhs))
                })?;
                Ok(self.wrapping_pow(exp))
            }
            fn neg(self) -> Self {
                self.wrapping_neg()
            }
            fn not(self) -> Self {
                !self
            }
            fn or(self, rhs: Self) -> Self {
                self | rhs
            }
            fn and(self, rhs: Self) -> Self {
                self & rhs
            }
            fn xor(self, rhs: Self) -> Self {
                self ^ rhs
            }
            fn shl(self, rhs: Self) -> Self {
                self.wrapping_shl(rhs as u32)
            }
            fn shr(self, rhs: Self) -> Self {
                self.wrapping_shr(rhs as u32)
            }
        }
    };
}

impl_word!(u8, pull_u8, push_u8);
impl_word!(i32, pull_i32, push_i32);
impl_word!(i64, pull_i64, push_i64);

/// Run a width-specialized operation. `op` is the 8-bit variant of the opcode.
fn int_op<T: Word>(stack: &mut Stack, op: Opcode) -> VmResult<()> {
    match op {
        Opcode::Neg8 => T::pull(stack)?.neg().push(stack),
        Opcode::BitwiseNot8 => T::pull(stack)?.not().push(stack),
        _ => {
            // left-hand side is on top
            let a = T::pull(stack)?;
            let b = T::pull(stack)?;
            match op {
                Opcode::Equal8 => stack.push_bool(a == b),
                Opcode::NotEqual8 => stack.push_bool(a != b),
                Opcode::LessEqual8 => stack.push_bool(a <= b),
                Opcode::GreaterEqual8 => stack.push_bool(a >= b),
                Opcode::LessThan8 => stack.push_bool(a < b),
                Opcode::GreaterThan8 => stack.push_bool(a > b),
                Opcode::BitwiseOr8 => a.or(b).push(stack),
                Opcode::BitwiseAnd8 => a.and(b).push(stack),
                Opcode::BitwiseXor8 => a.xor(b).push(stack),
                Opcode::ShiftLeft8 => a.shl(b).push(stack),
                Opcode::ShiftRight8 => a.shr(b).push(stack),
                Opcode::Add8 => a.add(b).push(stack),
                Opcode::Sub8 => a.sub(b).push(stack),
                Opcode::Mul8 => a.mul(b).push(stack),
                Opcode::Div8 | Opcode::Mod8 if b.is_zero() => Err(RuntimeError::DivisionByZero),
                Opcode::Div8 => a.div(b).push(stack),
                Opcode::Mod8 => a.rem(b).push(stack),
                Opcode::Exp8 => a.pow(b)?.push(stack),
                other => Err(RuntimeError::not_implemented(other.to_string())),
            }
        }
    }
}

impl Machine {
    pub fn new(heap: crate::vm::heap::Heap) -> Self {
        Self::with_config(heap, MachineConfig::default())
    }

    pub fn with_config(heap: crate::vm::heap::Heap, config: MachineConfig) -> Self {
        Self {
            stack: Stack::with_limit(heap, config.max_stack_size),
            config,
            observer: None,
            steps: 0,
        }
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    pub fn stack_mut(&mut self) -> &mut Stack {
        &mut self.stack
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn set_observer(&mut self, observer: Option<Box<dyn MachineObserver>>) {
        self.observer = observer;
    }

    pub fn take_observer(&mut self) -> Option<Box<dyn MachineObserver>> {
        self.observer.take()
    }

    /// Instructions executed by the last top-level call.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Call function `index` of `module`. Arguments must already be on the
    /// stack; the result is left on top. `on_invoke` receives every value
    /// passed to `Invoke`.
    pub fn call(
        &mut self,
        module: &Rc<Module>,
        index: usize,
        on_invoke: &mut dyn FnMut(&Value),
    ) -> VmResult<()> {
        let function = get_function(module, index)?;
        if self.stack.frames().is_empty() {
            self.steps = 0;
        }
        match &function.body {
            FunctionBody::Normal(_) => {}
            FunctionBody::Native(native) => {
                self.notify_enter(module, &function);
                native(&mut self.stack)?;
                self.notify_exit(module, &function);
                return Ok(());
            }
            FunctionBody::Undefined | FunctionBody::Generic(_) => {
                return Err(not_callable(&function));
            }
        }
        self.stack.push_frame(Frame::sentinel(self.stack.size()));
        self.run(module.clone(), function, on_invoke)
    }

    fn notify_enter(&mut self, module: &Module, function: &Function) {
        trace!(module = module.name(), function = %function.name, "call");
        if let Some(observer) = &mut self.observer {
            observer.call_enter(module, function);
        }
    }

    fn notify_exit(&mut self, module: &Module, function: &Function) {
        if let Some(observer) = &mut self.observer {
            observer.call_exit(module, function);
        }
    }

    fn step(&mut self, module: &Module, function: &Function, cursor: usize) -> VmResult<()> {
        self.steps += 1;
        if let Some(limit) = self.config.instruction_limit {
            if self.steps > limit {
                return Err(RuntimeError::Aborted { steps: limit });
            }
        }
        if let Some(observer) = &mut self.observer {
            let event = StepEvent {
                module,
                function,
                cursor,
                stack: self.stack.data(),
            };
            if observer.step(&event).is_break() {
                return Err(RuntimeError::Aborted {
                    steps: self.steps - 1,
                });
            }
        }
        Ok(())
    }

    /// Run natives in place. Returns the function to enter for bytecode callees.
    fn enter(&mut self, module: &Rc<Module>, function: Rc<Function>) -> VmResult<Option<Rc<Function>>> {
        if let FunctionBody::Native(native) = &function.body {
            self.notify_enter(module, &function);
            native(&mut self.stack)?;
            self.notify_exit(module, &function);
            return Ok(None);
        }
        if matches!(function.body, FunctionBody::Normal(_)) {
            self.notify_enter(module, &function);
            return Ok(Some(function));
        }
        Err(not_callable(&function))
    }

    fn run(
        &mut self,
        mut module: Rc<Module>,
        mut function: Rc<Function>,
        on_invoke: &mut dyn FnMut(&Value),
    ) -> VmResult<()> {
        let mut cursor = 0;
        let mut base = self.stack.size();
        self.notify_enter(&module, &function);

        'frames: loop {
            let current = function.clone();
            let code = match &current.body {
                FunctionBody::Normal(body) => body.code.bytes(),
                _ => return Err(not_callable(&current)),
            };

            while cursor < code.len() {
                self.step(&module, &current, cursor)?;

                let byte = code[cursor];
                let opcode = Opcode::from_u8(byte)
                    .ok_or_else(|| RuntimeError::not_implemented(format!("opcode 0x{:02x}", byte)))?;
                let next = cursor + opcode.len();
                if next > code.len() {
                    return Err(RuntimeError::native(format!(
                        "truncated instruction {} in '{}'",
                        opcode, current.name
                    )));
                }
                let arg0 = code.get(cursor + 1).copied().unwrap_or(0) as usize;
                let arg1 = code.get(cursor + 2).copied().unwrap_or(0) as usize;
                cursor = next;

                let target: Option<(Rc<Module>, Rc<Function>)> = match opcode {
                    Opcode::Noop => None,

                    Opcode::LogicalNot => {
                        let a = self.stack.pull_bool()?;
                        self.stack.push_bool(!a)?;
                        None
                    }
                    Opcode::LogicalOr | Opcode::LogicalAnd => {
                        let a = self.stack.pull_bool()?;
                        let b = self.stack.pull_bool()?;
                        let r = if opcode == Opcode::LogicalOr { a || b } else { a && b };
                        self.stack.push_bool(r)?;
                        None
                    }

                    Opcode::Execute => {
                        let handle = self.stack.pull_handle()?;
                        let closure = self.stack.heap().closure(handle)?;
                        self.push_closure_values(&closure)?;
                        self.stack.heap().decref(handle)?;
                        let target_module = closure.function.module.upgrade().ok_or_else(|| {
                            RuntimeError::native("closure refers to a dropped module")
                        })?;
                        let target = get_function(&target_module, closure.function.index)?;
                        Some((target_module, target))
                    }

                    Opcode::Invoke => {
                        let ty = get_type(&module, arg0)?;
                        let value = self.stack.pull_value(&ty)?;
                        on_invoke(&value);
                        value.decref(self.stack.heap())?;
                        None
                    }
                    Opcode::LoadStatic => {
                        let value = module.get_value(arg0).ok_or_else(|| {
                            RuntimeError::native(format!("static value {} out of range", arg0))
                        })?;
                        value.incref(self.stack.heap())?;
                        self.stack.push_value(&value)?;
                        None
                    }
                    Opcode::LoadFunction => {
                        get_function(&module, arg0)?;
                        let handle = self.stack.heap().alloc(HeapData::Closure(Closure {
                            function: FunctionRef::new(&module, arg0),
                            types: Rc::from(Vec::new()),
                            values: Rc::from(Vec::new()),
                        }));
                        self.stack.push_handle(handle)?;
                        None
                    }
                    Opcode::MakeClosure => {
                        let target = get_function(&module, arg0)?;
                        let layout = target.closure_layout();
                        let size = layout.iter().map(TypeInfo::size).sum();
                        let values = self.stack.pull_bytes(size)?;
                        let handle = self.stack.heap().alloc(HeapData::Closure(Closure {
                            function: FunctionRef::new(&module, arg0),
                            types: Rc::from(layout),
                            values: Rc::from(values),
                        }));
                        self.stack.push_handle(handle)?;
                        None
                    }
                    Opcode::Call0 => Some((module.clone(), get_function(&module, arg0)?)),
                    Opcode::Call1 => {
                        let builtin = get_import(&module, 0)?;
                        let target = get_function(&builtin, arg0)?;
                        Some((builtin, target))
                    }
                    Opcode::Call => {
                        let imported = get_import(&module, arg0)?;
                        let target = get_function(&imported, arg1)?;
                        Some((imported, target))
                    }

                    Opcode::IncRef => {
                        let handle = self.stack.handle_at(arg0)?;
                        self.stack.heap().incref(handle)?;
                        None
                    }
                    Opcode::DecRef => {
                        let handle = self.stack.handle_at(arg0)?;
                        if self.stack.heap().decref(handle)? {
                            self.stack.clear_handle_at(arg0)?;
                        }
                        None
                    }

                    Opcode::Jump => {
                        cursor += arg0;
                        None
                    }
                    Opcode::JumpIfNot => {
                        if !self.stack.pull_bool()? {
                            cursor += arg0;
                        }
                        None
                    }

                    Opcode::Subscript => {
                        let elem = get_type(&module, arg0)?;
                        self.subscript(&elem)?;
                        None
                    }
                    Opcode::MakeList => {
                        let elem = get_type(&module, arg1)?;
                        let values = self.stack.pull_bytes(arg0 * elem.size())?;
                        let handle = if arg0 == 0 {
                            HeapRef::NULL
                        } else {
                            self.stack.heap().alloc(HeapData::List {
                                elem,
                                data: Rc::from(values),
                            })
                        };
                        self.stack.push_handle(handle)?;
                        None
                    }

                    Opcode::CopyVariable => {
                        self.stack.copy(base + arg0, arg1)?;
                        None
                    }
                    Opcode::CopyArgument => {
                        let from = base
                            .checked_sub(arg0 + arg1)
                            .ok_or_else(|| RuntimeError::underflow(arg0 + arg1, base))?;
                        self.stack.copy(from, arg1)?;
                        None
                    }
                    Opcode::Drop => {
                        self.stack.drop(arg0, arg1)?;
                        None
                    }

                    op => {
                        let family = op
                            .width()
                            .and_then(|_| op.with_width(Width::W8))
                            .ok_or_else(|| RuntimeError::not_implemented(op.to_string()))?;
                        match op.width() {
                            Some(Width::W8) => int_op::<u8>(&mut self.stack, family)?,
                            Some(Width::W32) => int_op::<i32>(&mut self.stack, family)?,
                            _ => int_op::<i64>(&mut self.stack, family)?,
                        }
                        None
                    }
                };

                if let Some((target_module, target)) = target {
                    if let Some(callee) = self.enter(&target_module, target)? {
                        self.stack.push_frame(Frame {
                            caller: Some((module.clone(), current.clone())),
                            return_cursor: cursor,
                            base,
                        });
                        module = target_module;
                        function = callee;
                        cursor = 0;
                        base = self.stack.size();
                        continue 'frames;
                    }
                }
            }

            // end of code: return to the caller
            self.notify_exit(&module, &current);
            let frame = self.stack.pop_frame()?;
            match frame.caller {
                None => return Ok(()),
                Some((caller_module, caller)) => {
                    module = caller_module;
                    function = caller;
                    cursor = frame.return_cursor;
                    base = frame.base;
                }
            }
        }
    }

    fn push_closure_values(&mut self, closure: &Closure) -> VmResult<()> {
        self.stack.push_bytes(&closure.values)?;
        let heap = self.stack.heap();
        let mut pos = 0;
        for ty in closure.types.iter() {
            for slot in ty.heap_slots() {
                heap.incref(HeapRef::from_bytes(&closure.values[pos + slot..])?)?;
            }
            pos += ty.size();
        }
        Ok(())
    }

    fn subscript(&mut self, elem: &TypeInfo) -> VmResult<()> {
        let handle = self.stack.pull_handle()?;
        let index = self.stack.pull_i32()?;
        let (_, data) = self.stack.heap().list(handle)?;
        let size = elem.size();
        let length = if size == 0 { 0 } else { data.len() / size };
        let resolved = if index < 0 {
            i64::from(index) + length as i64
        } else {
            i64::from(index)
        };
        if resolved < 0 || resolved >= length as i64 {
            self.stack.heap().decref(handle)?;
            return Err(RuntimeError::index_out_of_bounds(i64::from(index), length));
        }
        let start = resolved as usize * size;
        self.stack.push_bytes(&data[start..start + size])?;
        self.stack.incref_top(elem)?;
        self.stack.heap().decref(handle)?;
        Ok(())
    }
}

fn get_function(module: &Module, index: usize) -> VmResult<Rc<Function>> {
    module
        .get_function(index)
        .ok_or_else(|| RuntimeError::BadFunctionIndex {
            module: module.name().to_string(),
            index,
        })
}

fn get_import(module: &Module, index: usize) -> VmResult<Rc<Module>> {
    module.get_imported_module(index).ok_or_else(|| {
        RuntimeError::native(format!(
            "module '{}' has no import {}",
            module.name(),
            index
        ))
    })
}

fn get_type(module: &Module, index: usize) -> VmResult<TypeInfo> {
    module
        .get_type(index)
        .ok_or_else(|| RuntimeError::native(format!("type {} out of range", index)))
}

fn not_callable(function: &Function) -> RuntimeError {
    RuntimeError::NotCallable {
        what: function.body.kind(),
        name: function.name.clone(),
    }
}

#[cfg(test)]
mod tests;
