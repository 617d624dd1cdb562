//! The `builtin` module, imported first by every compiled module.
//!
//! It exposes each width-specialised integer opcode as an inline fragment
//! (`add_32`, `less_than_64`, ...) plus host natives for strings, lists,
//! floats and conversions. Natives pull their arguments first parameter
//! first and release whatever heap values they consume.

use std::ops::{Add, Div, Mul, Neg, Rem, Sub};
use std::rc::Rc;

use crate::bytecode::{Opcode, Width};
use crate::module::{Function, Module};
use crate::symtab::Symbol;
use crate::types::{Signature, TypeInfo};
use crate::vm::heap::{Heap, VmResult};
use crate::vm::stack::Stack;

pub const BUILTIN_MODULE_NAME: &str = "builtin";

/// Build the builtin module on `heap`.
pub fn builtin_module(heap: &Heap) -> Rc<Module> {
    let module = Module::new(BUILTIN_MODULE_NAME, heap.clone());
    add_fragments(&module);
    add_string_natives(&module);
    add_conversions(&module);
    add_float_natives::<f32>(&module);
    add_float_natives::<f64>(&module);
    Rc::new(module)
}

fn width_type(width: Width) -> TypeInfo {
    match width {
        Width::W8 => TypeInfo::Byte,
        Width::W32 => TypeInfo::Int32,
        Width::W64 => TypeInfo::Int64,
    }
}

fn add_fragment(module: &Module, signature: Signature, opcode: Opcode) {
    let name = opcode.snake_name();
    let index = module.add_function(Function::fragment(name.clone(), signature, opcode));
    module.define(&name, Symbol::Function { index });
}

fn add_fragments(module: &Module) {
    let bool_unary = Signature::new(vec![TypeInfo::Bool], TypeInfo::Bool);
    let bool_binary = Signature::new(vec![TypeInfo::Bool, TypeInfo::Bool], TypeInfo::Bool);
    add_fragment(module, bool_unary, Opcode::LogicalNot);
    add_fragment(module, bool_binary.clone(), Opcode::LogicalOr);
    add_fragment(module, bool_binary, Opcode::LogicalAnd);

    for byte in Opcode::Equal8 as u8..=Opcode::Exp64 as u8 {
        let Some(opcode) = Opcode::from_u8(byte) else {
            continue;
        };
        let Some(width) = opcode.width() else {
            continue;
        };
        let t = width_type(width);
        let params = if opcode.is_unary() {
            vec![t.clone()]
        } else {
            vec![t.clone(), t.clone()]
        };
        let ret = if opcode.is_comparison() { TypeInfo::Bool } else { t };
        add_fragment(module, Signature::new(params, ret), opcode);
    }
}

fn add_native(
    module: &Module,
    name: &str,
    params: Vec<TypeInfo>,
    ret: TypeInfo,
    delegate: impl Fn(&mut Stack) -> VmResult<()> + 'static,
) {
    module.add_native_function(name, Signature::new(params, ret), Rc::new(delegate));
}

fn add_string_natives(module: &Module) {
    use TypeInfo::{Bool, Int32, String, Void};

    add_native(module, "string_concat", vec![String, String], String, |stack| {
        let a = stack.pull_string()?;
        let b = stack.pull_string()?;
        let mut joined = a.to_string();
        joined.push_str(&b);
        stack.push_string(&joined)
    });
    add_native(module, "string_equal", vec![String, String], Bool, |stack| {
        let a = stack.pull_string()?;
        let b = stack.pull_string()?;
        stack.push_bool(a == b)
    });
    add_native(module, "string_length", vec![String], Int32, |stack| {
        let s = stack.pull_string()?;
        stack.push_i32(s.chars().count() as i32)
    });
    add_native(
        module,
        "list_length",
        vec![TypeInfo::list(TypeInfo::Unknown)],
        Int32,
        |stack| {
            let handle = stack.pull_handle()?;
            let (elem, data) = stack.heap().list(handle)?;
            let length = match elem.size() {
                0 => 0,
                size => data.len() / size,
            };
            stack.heap().decref(handle)?;
            stack.push_i32(length as i32)
        },
    );
    add_native(module, "print", vec![String], Void, |stack| {
        let s = stack.pull_string()?;
        println!("{}", s);
        Ok(())
    });
}

fn add_conversions(module: &Module) {
    use TypeInfo::{Float64, Int32, Int64, String};

    add_native(module, "int32_to_int64", vec![Int32], Int64, |stack| {
        let v = stack.pull_i32()?;
        stack.push_i64(i64::from(v))
    });
    add_native(module, "int64_to_int32", vec![Int64], Int32, |stack| {
        let v = stack.pull_i64()?;
        stack.push_i32(v as i32)
    });
    add_native(module, "int32_to_float64", vec![Int32], Float64, |stack| {
        let v = stack.pull_i32()?;
        stack.push_f64(f64::from(v))
    });
    add_native(module, "float64_to_int32", vec![Float64], Int32, |stack| {
        let v = stack.pull_f64()?;
        stack.push_i32(v as i32)
    });
    add_native(module, "int32_to_string", vec![Int32], String, |stack| {
        let v = stack.pull_i32()?;
        stack.push_string(&v.to_string())
    });
    add_native(module, "int64_to_string", vec![Int64], String, |stack| {
        let v = stack.pull_i64()?;
        stack.push_string(&v.to_string())
    });
    add_native(module, "float64_to_string", vec![Float64], String, |stack| {
        let v = stack.pull_f64()?;
        stack.push_string(&format!("{:?}", v))
    });
}

/// Float types with natives named `<op>_<suffix>`.
trait Float:
    Copy
    + PartialOrd
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Rem<Output = Self>
    + Neg<Output = Self>
    + 'static
{
    const SUFFIX: &'static str;
    const TYPE: TypeInfo;
    fn pull(stack: &mut Stack) -> VmResult<Self>;
    fn push(self, stack: &mut Stack) -> VmResult<()>;
    fn pow(self, rhs: Self) -> Self;
}

impl Float for f32 {
    const SUFFIX: &'static str = "f32";
    const TYPE: TypeInfo = TypeInfo::Float32;
    fn pull(stack: &mut Stack) -> VmResult<Self> {
        stack.pull_f32()
    }
    fn push(self, stack: &mut Stack) -> VmResult<()> {
        stack.push_f32(self)
    }
    fn pow(self, rhs: Self) -> Self {
        self.powf(rhs)
    }
}

impl Float for f64 {
    const SUFFIX: &'static str = "f64";
    const TYPE: TypeInfo = TypeInfo::Float64;
    fn pull(stack: &mut Stack) -> VmResult<Self> {
        stack.pull_f64()
    }
    fn push(self, stack: &mut Stack) -> VmResult<()> {
        stack.push_f64(self)
    }
    fn pow(self, rhs: Self) -> Self {
        self.powf(rhs)
    }
}

fn add_float_natives<F: Float>(module: &Module) {
    let arithmetic: [(&str, fn(F, F) -> F); 6] = [
        ("add", |a, b| a + b),
        ("sub", |a, b| a - b),
        ("mul", |a, b| a * b),
        ("div", |a, b| a / b),
        ("mod", |a, b| a % b),
        ("exp", F::pow),
    ];
    for (op, f) in arithmetic {
        let name = format!("{}_{}", op, F::SUFFIX);
        add_native(module, &name, vec![F::TYPE, F::TYPE], F::TYPE, move |stack| {
            let a = F::pull(stack)?;
            let b = F::pull(stack)?;
            f(a, b).push(stack)
        });
    }

    let comparisons: [(&str, fn(F, F) -> bool); 6] = [
        ("equal", |a, b| a == b),
        ("not_equal", |a, b| a != b),
        ("less_equal", |a, b| a <= b),
        ("greater_equal", |a, b| a >= b),
        ("less_than", |a, b| a < b),
        ("greater_than", |a, b| a > b),
    ];
    for (op, f) in comparisons {
        let name = format!("{}_{}", op, F::SUFFIX);
        add_native(module, &name, vec![F::TYPE, F::TYPE], TypeInfo::Bool, move |stack| {
            let a = F::pull(stack)?;
            let b = F::pull(stack)?;
            stack.push_bool(f(a, b))
        });
    }

    let name = format!("neg_{}", F::SUFFIX);
    add_native(module, &name, vec![F::TYPE], F::TYPE, |stack| {
        (-F::pull(stack)?).push(stack)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::machine::Machine;
    use pretty_assertions::assert_eq;

    fn call(module: &Rc<Module>, machine: &mut Machine, name: &str) {
        let index = module.find_function(name).unwrap();
        machine.call(module, index, &mut |_| {}).unwrap();
    }

    #[test]
    fn test_fragments_are_named_after_opcodes() {
        let heap = Heap::new();
        let builtin = builtin_module(&heap);
        let add = builtin.get_function(builtin.find_function("add_32").unwrap()).unwrap();
        assert!(add.is_fragment());
        assert_eq!(add.signature.to_string(), "fn(Int32, Int32) -> Int32");

        let lt = builtin.get_function(builtin.find_function("less_than_64").unwrap()).unwrap();
        assert_eq!(lt.signature.to_string(), "fn(Int64, Int64) -> Bool");

        let neg = builtin.get_function(builtin.find_function("neg_8").unwrap()).unwrap();
        assert_eq!(neg.signature.params.len(), 1);
        assert!(builtin.find_function("logical_not").is_some());
    }

    #[test]
    fn test_string_concat_releases_arguments() {
        let heap = Heap::new();
        let builtin = builtin_module(&heap);
        let mut machine = Machine::new(heap.clone());
        // first parameter on top
        machine.stack_mut().push_string("world").unwrap();
        machine.stack_mut().push_string("hello ").unwrap();
        call(&builtin, &mut machine, "string_concat");
        assert_eq!(&*machine.stack_mut().pull_string().unwrap(), "hello world");
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_list_length_of_empty_list() {
        let heap = Heap::new();
        let builtin = builtin_module(&heap);
        let mut machine = Machine::new(heap);
        machine
            .stack_mut()
            .push_handle(crate::vm::heap::HeapRef::NULL)
            .unwrap();
        call(&builtin, &mut machine, "list_length");
        assert_eq!(machine.stack_mut().pull_i32().unwrap(), 0);
    }

    #[test]
    fn test_float_natives() {
        let heap = Heap::new();
        let builtin = builtin_module(&heap);
        let mut machine = Machine::new(heap);
        machine.stack_mut().push_f64(4.0).unwrap();
        machine.stack_mut().push_f64(10.0).unwrap();
        call(&builtin, &mut machine, "sub_f64");
        assert_eq!(machine.stack_mut().pull_f64().unwrap(), 6.0);

        machine.stack_mut().push_f32(2.0).unwrap();
        machine.stack_mut().push_f32(1.0).unwrap();
        call(&builtin, &mut machine, "less_than_f32");
        assert!(machine.stack_mut().pull_bool().unwrap());
    }

    #[test]
    fn test_conversions() {
        let heap = Heap::new();
        let builtin = builtin_module(&heap);
        let mut machine = Machine::new(heap);
        machine.stack_mut().push_i64(-5).unwrap();
        call(&builtin, &mut machine, "int64_to_string");
        assert_eq!(&*machine.stack_mut().pull_string().unwrap(), "-5");

        machine.stack_mut().push_i32(7).unwrap();
        call(&builtin, &mut machine, "int32_to_float64");
        assert_eq!(machine.stack_mut().pull_f64().unwrap(), 7.0);
    }
}
