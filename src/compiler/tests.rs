//! Compiler tests: compile against the builtin module, then run on the machine.

use std::rc::Rc;

use pretty_assertions::assert_eq;

use super::*;
use crate::error::RuntimeError;
use crate::lexer::Scanner;
use crate::parser::Parser;
use crate::vm::{builtin_module, Heap, Machine};

struct Compiled {
    heap: Heap,
    module: Rc<Module>,
    main: usize,
}

fn compile_with(source: &str, options: &CompilerOptions) -> CompileResult<Compiled> {
    let heap = Heap::new();
    let module = Rc::new(Module::new("test", heap.clone()));
    module.add_imported_module(builtin_module(&heap));
    let tokens = Scanner::new(source).scan_tokens().unwrap();
    let program = Parser::new(tokens).parse().unwrap();
    let main = compile_module(&module, &program, options)?;
    Ok(Compiled { heap, module, main })
}

fn compile(source: &str) -> CompileResult<Compiled> {
    compile_with(source, &CompilerOptions::default())
}

fn compile_err(source: &str) -> CompileError {
    match compile(source) {
        Ok(_) => panic!("expected a compile error for {:?}", source),
        Err(err) => err,
    }
}

/// Run `main`; returns the displayed result and the displayed invoked values.
fn execute(compiled: &Compiled) -> Result<(String, Vec<String>), RuntimeError> {
    let heap = &compiled.heap;
    let mut machine = Machine::new(heap.clone());
    let mut invoked = Vec::new();
    machine.call(&compiled.module, compiled.main, &mut |value| {
        invoked.push(value.display(heap).to_string())
    })?;
    let ty = compiled
        .module
        .get_function(compiled.main)
        .unwrap()
        .effective_return_type();
    let value = machine.stack_mut().pull_value(&ty)?;
    let text = value.display(heap).to_string();
    value.decref(heap)?;
    assert!(machine.stack().is_empty(), "stack not empty: {}", machine.stack());
    Ok((text, invoked))
}

fn run(source: &str) -> String {
    execute(&compile(source).unwrap()).unwrap().0
}

#[test]
fn test_arithmetic() {
    assert_eq!(run("1 + 2"), "3");
    assert_eq!(run("10 - 2 * 3"), "4");
    assert_eq!(run("7 / 2 + 7 % 2"), "4");
    assert_eq!(run("2 ** 10"), "1024");
    assert_eq!(run("-(3 - 5)"), "2");
}

#[test]
fn test_literals_adapt_to_context() {
    assert_eq!(run("let x: Int64 = 5; x * 3"), "15L");
    assert_eq!(run("1.5 + 2"), "3.5");
    assert_eq!(run("let b: Byte = 200; b + 100"), "44b");
}

#[test]
fn test_comparison_and_logic() {
    assert_eq!(run("1 < 2 && !(3 == 4)"), "true");
    assert_eq!(run("2.5 >= 3.0 || false"), "false");
    assert_eq!(run("\"ab\" == \"a\" + \"b\""), "true");
    assert_eq!(run("\"ab\" != \"ab\""), "false");
}

#[test]
fn test_if_else() {
    assert_eq!(run("if 2 > 1 { \"yes\" } else { \"no\" }"), "\"yes\"");
    assert_eq!(run("if false { 1 } else if true { 2 } else { 3 }"), "2");
}

#[test]
fn test_block_locals() {
    assert_eq!(run("{ let a = 2; let b = a * 10; b + a }"), "22");
    assert_eq!(run("{ let s = \"x\"; let t = s + s; t + s }"), "\"xxx\"");
}

#[test]
fn test_functions_may_be_used_before_declaration() {
    let source = "let r = double(21); fn double(x: Int) -> Int { x * 2 } r";
    assert_eq!(run(source), "42");
}

#[test]
fn test_lambda_call() {
    assert_eq!(run("(|x| x + 1)(5)"), "6");
    assert_eq!(run("let inc = |x: Int| x + 1; inc(inc(1))"), "3");
}

#[test]
fn test_closure_captures_parameter() {
    let source = "
        fn make_adder(n: Int) -> fn(Int) -> Int { |x| x + n }
        let add5 = make_adder(5);
        add5(10)";
    assert_eq!(run(source), "15");
}

#[test]
fn test_nested_captures() {
    let source = "
        fn outer(a: Int) -> Int {
            let inner = |b: Int| {
                let deep = |c: Int| a + b + c;
                deep(3)
            };
            inner(2)
        }
        outer(1)";
    assert_eq!(run(source), "6");
}

#[test]
fn test_sibling_captures_propagate() {
    let source = "
        fn outer(n: Int) -> Int {
            fn a(x: Int) -> Int { x + n }
            fn b(y: Int) -> Int { a(y) * 2 }
            b(1)
        }
        outer(10)";
    assert_eq!(run(source), "22");
}

#[test]
fn test_partial_application() {
    let source = "
        fn add3(a: Int, b: Int, c: Int) -> Int { a * 100 + b * 10 + c }
        let f = add3(1, 2);
        f(3)";
    assert_eq!(run(source), "123");
    assert_eq!(run("let inc = add_32(1); inc(41)"), "42");
}

#[test]
fn test_builtin_as_function_value() {
    assert_eq!(run("let negate = neg_32; negate(5)"), "-5");
}

#[test]
fn test_generic_instances_per_argument_type() {
    let compiled = compile("fn identity(x) { x } let a = identity(5); let b = identity(\"s\"); identity(7)").unwrap();
    let module = &compiled.module;
    let generic = module.find_function("identity").unwrap();
    let int_index = module.find_instance(generic, &[TypeInfo::Int32]).unwrap();
    let string_index = module.find_instance(generic, &[TypeInfo::String]).unwrap();
    assert_ne!(int_index, string_index);
    assert_eq!(module.find_function("identity<Int32>"), Some(int_index));
    assert_eq!(module.find_function("identity<String>"), Some(string_index));
    let int = module.get_function(int_index).unwrap();
    let string = module.get_function(string_index).unwrap();
    assert_eq!(int.signature.return_type.size(), 4);
    assert_eq!(string.signature.return_type.size(), 8);
    assert_eq!(execute(&compiled).unwrap().0, "7");
}

#[test]
fn test_generic_with_function_argument() {
    assert_eq!(run("fn twice(f, x) { f(f(x)) } twice(|n: Int| n * 3, 2)"), "18");
}

#[test]
fn test_generic_function_value_from_annotation() {
    assert_eq!(run("fn identity(x) { x } let f: fn(Int) -> Int = identity; f(9)"), "9");
}

#[test]
fn test_annotated_recursion() {
    let source = "fn fact(n: Int) -> Int { if n <= 1 { 1 } else { n * fact(n - 1) } } fact(5)";
    assert_eq!(run(source), "120");
}

#[test]
fn test_unannotated_recursion_is_rejected() {
    let err = compile_err("fn count(n: Int) { if n == 0 { 0 } else { count(n - 1) } } count(3)");
    assert!(matches!(err, CompileError::CannotInferType { .. }), "{}", err);
}

#[test]
fn test_lists() {
    assert_eq!(run("let xs = [10, 20, 30]; xs[1] + xs[-1]"), "50");
    assert_eq!(run("list_length([1, 2, 3])"), "3");
    assert_eq!(run("let xs: [Int64] = [1, 2]; xs"), "[1L, 2L]");
}

#[test]
fn test_index_out_of_bounds() {
    let err = execute(&compile("[1, 2][5]").unwrap()).unwrap_err();
    assert!(
        matches!(err, RuntimeError::IndexOutOfBounds { index: 5, length: 2 }),
        "{}",
        err
    );
}

#[test]
fn test_tuples() {
    assert_eq!(run("let t = (1, \"two\", true); t.1"), "\"two\"");
    assert_eq!(run("let p = (1, (2, 3)); let q = p.1; q.0"), "2");
}

#[test]
fn test_statement_values_are_invoked() {
    let (value, invoked) = execute(&compile("1 + 1; \"x\"; 5").unwrap()).unwrap();
    assert_eq!(value, "5");
    assert_eq!(invoked, vec!["2", "\"x\""]);
}

#[test]
fn test_statement_values_dropped_without_invoke() {
    let options = CompilerOptions {
        invoke_statements: false,
    };
    let (value, invoked) = execute(&compile_with("1 + 1; \"x\"; 5", &options).unwrap()).unwrap();
    assert_eq!(value, "5");
    assert!(invoked.is_empty());
}

#[test]
fn test_no_heap_leaks() {
    let source = "
        let greeting = \"hello\";
        fn greet(name: String) -> String { greeting + \", \" + name }
        greet(\"world\")";
    let compiled = compile(source).unwrap();
    assert_eq!(execute(&compiled).unwrap().0, "\"hello, world\"");
    let Compiled { heap, module, .. } = compiled;
    drop(module);
    assert_eq!(heap.live_count(), 0);
}

#[test]
fn test_type_errors() {
    assert!(matches!(compile_err("1 + true"), CompileError::TypeMismatch { .. }));
    assert!(matches!(compile_err("if 1 { 2 } else { 3 }"), CompileError::TypeMismatch { .. }));
    assert!(matches!(
        compile_err("fn f() -> Int { \"s\" } f()"),
        CompileError::UnexpectedReturnType { .. }
    ));
    assert!(matches!(compile_err("\"a\" - \"b\""), CompileError::UnsupportedOperator { .. }));
}

#[test]
fn test_name_and_call_errors() {
    assert!(matches!(compile_err("missing + 1"), CompileError::UndefinedName { .. }));
    assert!(matches!(compile_err("let x: Foo = 1; x"), CompileError::UndefinedType { .. }));
    assert!(matches!(
        compile_err("fn f(a: Int) -> Int { a } f(1, 2)"),
        CompileError::WrongArgumentCount { .. }
    ));
    assert!(matches!(compile_err("let x = 5; x(1)"), CompileError::NotCallable { .. }));
    assert!(matches!(compile_err("[]"), CompileError::CannotInferType { .. }));
}

#[test]
fn test_failed_instance_is_not_cached() {
    let heap = Heap::new();
    let module = Rc::new(Module::new("test", heap.clone()));
    module.add_imported_module(builtin_module(&heap));
    let tokens = Scanner::new("fn g(x) { x + true } g(1)").scan_tokens().unwrap();
    let program = Parser::new(tokens).parse().unwrap();
    let err = compile_module(&module, &program, &CompilerOptions::default()).unwrap_err();
    match &err {
        CompileError::GenericInstantiation { name, detail, .. } => {
            assert_eq!(name, "g");
            assert!(detail.contains("Type mismatch"), "{}", detail);
        }
        other => panic!("unexpected error {:?}", other),
    }
    let generic = module.find_function("g").unwrap();
    assert_eq!(module.find_instance(generic, &[TypeInfo::Int32]), None);
}
