use std::cell::RefCell;

use super::*;
use crate::bytecode::Code;
use crate::module::NormalBody;
use crate::types::Signature;
use crate::vm::heap::Heap;
use pretty_assertions::assert_eq;

fn code_function(name: &str, signature: Signature, bytes: Vec<u8>) -> Function {
    let mut function = Function::new(name, signature);
    function.body = FunctionBody::Normal(NormalBody {
        code: Code::from_bytes(bytes),
        ..NormalBody::default()
    });
    function
}

fn add_main(module: &Module, ret: TypeInfo, bytes: Vec<u8>) -> usize {
    module.add_function(code_function("main", Signature::new(vec![], ret), bytes))
}

fn run(module: &Rc<Module>, index: usize) -> (Machine, VmResult<()>) {
    let mut machine = Machine::new(module.heap().clone());
    let result = machine.call(module, index, &mut |_| {});
    (machine, result)
}

fn op(o: Opcode) -> u8 {
    o as u8
}

/// Evaluate `lhs <op> rhs` on Int32 operands.
fn binary_i32(opcode: Opcode, lhs: i32, rhs: i32) -> Value {
    let module = Rc::new(Module::new("t", Heap::new()));
    let l = module.add_value(Value::Int32(lhs)) as u8;
    let r = module.add_value(Value::Int32(rhs)) as u8;
    let ret = if opcode.is_comparison() {
        TypeInfo::Bool
    } else {
        TypeInfo::Int32
    };
    let main = add_main(
        &module,
        ret.clone(),
        vec![
            op(Opcode::LoadStatic),
            r,
            op(Opcode::LoadStatic),
            l,
            op(opcode),
        ],
    );
    let (mut machine, result) = run(&module, main);
    result.unwrap();
    let value = machine.stack_mut().pull_value(&ret).unwrap();
    assert!(machine.stack().is_empty());
    value
}

#[test]
fn test_equal_is_not_not_equal() {
    let pairs = [(1, 1), (1, 2), (-7, 7), (i32::MIN, i32::MAX), (0, 0)];
    for (a, b) in pairs {
        let eq = binary_i32(Opcode::Equal32, a, b).as_bool().unwrap();
        let ne = binary_i32(Opcode::NotEqual32, a, b).as_bool().unwrap();
        assert_eq!(eq, !ne, "{} vs {}", a, b);
    }
}

#[test]
fn test_less_than_mirrors_greater_than() {
    let pairs = [(1, 2), (2, 1), (-3, -3), (i32::MIN, 0)];
    for (a, b) in pairs {
        let lt = binary_i32(Opcode::LessThan32, a, b).as_bool().unwrap();
        let gt = binary_i32(Opcode::GreaterThan32, b, a).as_bool().unwrap();
        assert_eq!(lt, gt, "{} vs {}", a, b);
    }
}

#[test]
fn test_lhs_is_pulled_first() {
    assert_eq!(binary_i32(Opcode::Sub32, 10, 3), Value::Int32(7));
    assert_eq!(binary_i32(Opcode::Div32, 20, 6), Value::Int32(3));
    assert_eq!(binary_i32(Opcode::Exp32, 2, 10), Value::Int32(1024));
    assert_eq!(binary_i32(Opcode::ShiftLeft32, 1, 4), Value::Int32(16));
}

#[test]
fn test_integer_arithmetic_wraps() {
    assert_eq!(binary_i32(Opcode::Add32, i32::MAX, 1), Value::Int32(i32::MIN));
    assert_eq!(binary_i32(Opcode::Div32, i32::MIN, -1), Value::Int32(i32::MIN));
}

#[test]
fn test_division_by_zero() {
    let module = Rc::new(Module::new("t", Heap::new()));
    let zero = module.add_value(Value::Int64(0)) as u8;
    let one = module.add_value(Value::Int64(1)) as u8;
    let main = add_main(
        &module,
        TypeInfo::Int64,
        vec![
            op(Opcode::LoadStatic),
            zero,
            op(Opcode::LoadStatic),
            one,
            op(Opcode::Mod64),
        ],
    );
    let (_, result) = run(&module, main);
    assert!(matches!(result, Err(RuntimeError::DivisionByZero)));
}

#[test]
fn test_result_size_matches_return_type() {
    let module = Rc::new(Module::new("t", Heap::new()));
    let v = module.add_value(Value::Int64(99)) as u8;
    let f = module.add_function(code_function(
        "f",
        Signature::new(vec![], TypeInfo::Int64),
        vec![op(Opcode::LoadStatic), v],
    ));
    let main = add_main(&module, TypeInfo::Int64, vec![op(Opcode::Call0), f as u8]);
    let (mut machine, result) = run(&module, main);
    result.unwrap();
    let ret = module.get_function(main).unwrap().effective_return_type();
    assert_eq!(machine.stack().size(), ret.size());
    assert_eq!(
        machine.stack_mut().pull_value(&ret).unwrap(),
        Value::Int64(99)
    );
}

#[test]
fn test_void_function_leaves_nothing() {
    let module = Rc::new(Module::new("t", Heap::new()));
    let main = add_main(&module, TypeInfo::Unknown, vec![op(Opcode::Noop)]);
    let (machine, result) = run(&module, main);
    result.unwrap();
    assert!(machine.stack().is_empty());
    assert!(machine.stack().frames().is_empty());
}

#[test]
fn test_load_static_then_dec_ref_keeps_refcount() {
    let heap = Heap::new();
    let module = Rc::new(Module::new("t", heap.clone()));
    let s = Value::string(&heap, "static");
    let Value::String(handle) = s else {
        unreachable!()
    };
    let v = module.add_value(s) as u8;
    let main = add_main(
        &module,
        TypeInfo::Void,
        vec![
            op(Opcode::LoadStatic),
            v,
            op(Opcode::DecRef),
            0,
            op(Opcode::Drop),
            0,
            8,
        ],
    );
    assert_eq!(heap.refcount(handle).unwrap(), 1);
    let (machine, result) = run(&module, main);
    result.unwrap();
    assert!(machine.stack().is_empty());
    assert_eq!(heap.refcount(handle).unwrap(), 1);
}

#[test]
fn test_make_closure_then_execute_restores_nonlocals() {
    let module = Rc::new(Module::new("t", Heap::new()));
    let a = module.add_value(Value::Int32(1)) as u8;
    let b = module.add_value(Value::Int64(2)) as u8;

    // g reads nl1 (Int32) and nl2 (Int64) and returns them as a tuple
    let mut sig = Signature::new(
        vec![],
        TypeInfo::Tuple(vec![TypeInfo::Int32, TypeInfo::Int64]),
    );
    sig.nonlocals = vec![TypeInfo::Int32, TypeInfo::Int64];
    let g = module.add_function(code_function(
        "g",
        sig,
        vec![
            op(Opcode::CopyArgument),
            0,
            4,
            op(Opcode::CopyArgument),
            4,
            8,
            op(Opcode::Drop),
            12,
            12,
        ],
    ));

    let ret = TypeInfo::Tuple(vec![TypeInfo::Int32, TypeInfo::Int64]);
    let main = add_main(
        &module,
        ret.clone(),
        vec![
            op(Opcode::LoadStatic),
            b,
            op(Opcode::LoadStatic),
            a,
            op(Opcode::MakeClosure),
            g as u8,
            op(Opcode::Execute),
        ],
    );
    let (mut machine, result) = run(&module, main);
    result.unwrap();
    let value = machine.stack_mut().pull_value(&ret).unwrap();
    assert_eq!(value, Value::Tuple(vec![Value::Int32(1), Value::Int64(2)]));
    assert!(machine.stack().is_empty());
    assert_eq!(module.heap().live_count(), 0);
}

#[test]
fn test_jumps_skip_exactly_n_bytes() {
    let module = Rc::new(Module::new("t", Heap::new()));
    let cond = module.add_value(Value::Bool(false)) as u8;
    let one = module.add_value(Value::Byte(1)) as u8;
    let two = module.add_value(Value::Byte(2)) as u8;
    let main = add_main(
        &module,
        TypeInfo::Byte,
        vec![
            op(Opcode::LoadStatic),
            cond,
            op(Opcode::JumpIfNot),
            4,
            op(Opcode::LoadStatic),
            one,
            op(Opcode::Jump),
            2,
            op(Opcode::LoadStatic),
            two,
        ],
    );
    let (mut machine, result) = run(&module, main);
    result.unwrap();
    assert_eq!(
        machine.stack_mut().pull_value(&TypeInfo::Byte).unwrap(),
        Value::Byte(2)
    );
    assert!(machine.stack().is_empty());
}

#[test]
fn test_undefined_opcode() {
    let module = Rc::new(Module::new("t", Heap::new()));
    let main = add_main(&module, TypeInfo::Void, vec![0xfe]);
    let (_, result) = run(&module, main);
    match result {
        Err(RuntimeError::NotImplemented(what)) => assert_eq!(what, "opcode 0xfe"),
        other => panic!("expected NotImplemented, got {:?}", other),
    }
}

#[test]
fn test_calling_undefined_function_fails() {
    let module = Rc::new(Module::new("t", Heap::new()));
    let f = module.add_function(Function::new("later", Signature::empty()));
    let main = add_main(&module, TypeInfo::Void, vec![op(Opcode::Call0), f as u8]);
    let (_, result) = run(&module, main);
    assert!(matches!(
        result,
        Err(RuntimeError::NotCallable { what: "undefined", .. })
    ));
}

fn list_module(index: i32) -> (Rc<Module>, usize) {
    let heap = Heap::new();
    let module = Rc::new(Module::new("t", heap));
    let i = module.add_value(Value::Int32(index)) as u8;
    let values: Vec<u8> = [10, 20, 30]
        .iter()
        .map(|v| module.add_value(Value::Int32(*v)) as u8)
        .collect();
    let elem = module.add_type(TypeInfo::Int32) as u8;
    let main = add_main(
        &module,
        TypeInfo::Int32,
        vec![
            op(Opcode::LoadStatic),
            i,
            op(Opcode::LoadStatic),
            values[0],
            op(Opcode::LoadStatic),
            values[1],
            op(Opcode::LoadStatic),
            values[2],
            op(Opcode::MakeList),
            3,
            elem,
            op(Opcode::Subscript),
            elem,
        ],
    );
    (module, main)
}

#[test]
fn test_subscript() {
    for (index, expected) in [(0, 10), (2, 30), (-1, 30), (-3, 10)] {
        let (module, main) = list_module(index);
        let (mut machine, result) = run(&module, main);
        result.unwrap();
        assert_eq!(
            machine.stack_mut().pull_value(&TypeInfo::Int32).unwrap(),
            Value::Int32(expected)
        );
        // the list was released
        assert_eq!(module.heap().live_count(), 0);
    }
}

#[test]
fn test_subscript_out_of_bounds() {
    for index in [3, -4] {
        let (module, main) = list_module(index);
        let (_, result) = run(&module, main);
        match result {
            Err(RuntimeError::IndexOutOfBounds { index: i, length }) => {
                assert_eq!(i, i64::from(index));
                assert_eq!(length, 3);
            }
            other => panic!("expected IndexOutOfBounds, got {:?}", other),
        }
    }
}

#[test]
fn test_invoke_passes_value_and_releases_it() {
    let heap = Heap::new();
    let module = Rc::new(Module::new("t", heap.clone()));
    let s = module.add_value(Value::string(&heap, "hi")) as u8;
    let ty = module.add_type(TypeInfo::String) as u8;
    let main = add_main(
        &module,
        TypeInfo::Void,
        vec![op(Opcode::LoadStatic), s, op(Opcode::Invoke), ty],
    );
    let seen = RefCell::new(Vec::new());
    let mut machine = Machine::new(heap.clone());
    machine
        .call(&module, main, &mut |v| {
            seen.borrow_mut()
                .push(v.as_string(&heap).unwrap().to_string())
        })
        .unwrap();
    assert_eq!(seen.into_inner(), vec!["hi".to_string()]);
    assert!(machine.stack().is_empty());
    // the static still holds its own reference
    assert_eq!(heap.live_count(), 1);
}

#[test]
fn test_instruction_limit() {
    let module = Rc::new(Module::new("t", Heap::new()));
    let main = add_main(&module, TypeInfo::Void, vec![op(Opcode::Noop); 10]);
    let mut machine = Machine::with_config(
        module.heap().clone(),
        MachineConfig {
            instruction_limit: Some(5),
            ..MachineConfig::default()
        },
    );
    let result = machine.call(&module, main, &mut |_| {});
    assert!(matches!(result, Err(RuntimeError::Aborted { steps: 5 })));
}

struct StopAt(usize);

impl MachineObserver for StopAt {
    fn step(&mut self, event: &StepEvent<'_>) -> ControlFlow<()> {
        if event.cursor >= self.0 {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }
}

#[test]
fn test_observer_can_abort() {
    let module = Rc::new(Module::new("t", Heap::new()));
    let main = add_main(&module, TypeInfo::Void, vec![op(Opcode::Noop); 4]);
    let mut machine = Machine::new(module.heap().clone());
    machine.set_observer(Some(Box::new(StopAt(2))));
    let result = machine.call(&module, main, &mut |_| {});
    assert!(matches!(result, Err(RuntimeError::Aborted { steps: 2 })));
}

#[test]
fn test_native_called_directly() {
    let heap = Heap::new();
    let module = Rc::new(Module::new("t", heap.clone()));
    let double = module.add_native_function(
        "double",
        Signature::new(vec![TypeInfo::Int32], TypeInfo::Int32),
        Rc::new(|stack: &mut Stack| {
            let v = stack.pull_i32()?;
            stack.push_i32(v * 2)
        }),
    );
    let mut machine = Machine::new(heap);
    machine.stack_mut().push_i32(21).unwrap();
    machine.call(&module, double, &mut |_| {}).unwrap();
    assert_eq!(machine.stack_mut().pull_i32().unwrap(), 42);
}
