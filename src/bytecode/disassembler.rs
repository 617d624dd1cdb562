//! Bytecode disassembler for debugging.

use std::fmt::{self, Write};

use crate::bytecode::instruction::Opcode;
use crate::module::{Function, FunctionBody, Module};

/// Disassemble one function of `module`.
pub fn disassemble_function(module: &Module, function: &Function) -> String {
    let mut output = String::new();
    // writing into a String cannot fail
    let _ = write_function(&mut output, module, function);
    output
}

/// Disassemble every function of `module`.
pub fn disassemble_module(module: &Module) -> String {
    let mut output = String::new();
    let _ = write_module(&mut output, module);
    output
}

pub fn write_module(out: &mut impl Write, module: &Module) -> fmt::Result {
    writeln!(out, "== module {} ==", module.name())?;
    for index in 0..module.function_count() {
        if let Some(function) = module.get_function(index) {
            writeln!(out)?;
            write!(out, "[{}] ", index)?;
            write_function(out, module, &function)?;
        }
    }
    Ok(())
}

pub fn write_function(out: &mut impl Write, module: &Module, function: &Function) -> fmt::Result {
    writeln!(out, "{}: {}", function.name, function.signature)?;
    if !function.signature.nonlocals.is_empty() {
        write!(out, "  nonlocals:")?;
        for (name, ty) in function.captures.iter().zip(&function.signature.nonlocals) {
            write!(out, " {}: {}", name, ty)?;
        }
        writeln!(out)?;
    }
    match &function.body {
        FunctionBody::Normal(body) => {
            let code = body.code.bytes();
            let mut offset = 0;
            while offset < code.len() {
                write!(out, "{:04}  ", offset)?;
                offset = write_instruction(out, module, code, offset)?;
                writeln!(out)?;
            }
            Ok(())
        }
        FunctionBody::Generic(body) => writeln!(out, "  <generic> {}", body.declaration.body),
        FunctionBody::Native(_) => writeln!(out, "  <native>"),
        FunctionBody::Undefined => writeln!(out, "  <undefined>"),
    }
}

/// Write the instruction at `offset` on one line, returning the offset of the
/// next instruction.
pub fn write_instruction(
    out: &mut impl Write,
    module: &Module,
    code: &[u8],
    offset: usize,
) -> Result<usize, fmt::Error> {
    let byte = code[offset];
    let Some(opcode) = Opcode::from_u8(byte) else {
        write!(out, "<unknown 0x{:02x}>", byte)?;
        return Ok(offset + 1);
    };
    let args = &code[(offset + 1).min(code.len())..(offset + opcode.len()).min(code.len())];
    if args.len() < opcode.arg_count() {
        write!(out, "{} <truncated>", opcode)?;
        return Ok(code.len());
    }
    write!(out, "{}", opcode)?;
    for arg in args {
        write!(out, " {}", arg)?;
    }

    let next = offset + opcode.len();
    match opcode {
        Opcode::Call0 | Opcode::LoadFunction | Opcode::MakeClosure => {
            if let Some(f) = module.get_function(args[0] as usize) {
                write!(out, "  ; {}", f.name)?;
            }
        }
        Opcode::Call1 => {
            if let Some(f) = module
                .get_imported_module(0)
                .and_then(|m| m.get_function(args[0] as usize))
            {
                write!(out, "  ; builtin::{}", f.name)?;
            }
        }
        Opcode::Call => {
            if let Some(m) = module.get_imported_module(args[0] as usize) {
                let name = m
                    .get_function(args[1] as usize)
                    .map(|f| f.name.clone())
                    .unwrap_or_default();
                write!(out, "  ; {}::{}", m.name(), name)?;
            }
        }
        Opcode::LoadStatic => {
            if let Some(v) = module.get_value(args[0] as usize) {
                write!(out, "  ; {}", v.display(module.heap()))?;
            }
        }
        Opcode::Invoke | Opcode::Subscript => {
            if let Some(t) = module.get_type(args[0] as usize) {
                write!(out, "  ; {}", t)?;
            }
        }
        Opcode::MakeList => {
            if let Some(t) = module.get_type(args[1] as usize) {
                write!(out, "  ; [{}]", t)?;
            }
        }
        Opcode::Jump | Opcode::JumpIfNot => {
            write!(out, "  ; -> {:04}", next + args[0] as usize)?;
        }
        _ => {}
    }
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Code;
    use crate::module::NormalBody;
    use crate::types::{Signature, TypeInfo};
    use crate::vm::heap::Heap;
    use crate::vm::value::Value;

    #[test]
    fn test_disassemble_function() {
        let module = Module::new("demo", Heap::new());
        let v = module.add_value(Value::Int32(42));
        let mut code = Code::new();
        code.add_opcode(Opcode::LoadStatic);
        code.add_arg(v as u8);
        let jump = code.add_jump(Opcode::Jump);
        code.add_opcode(Opcode::Noop);
        code.bind(jump);
        code.resolve_patches().unwrap();

        let mut function = crate::module::Function::new(
            "main",
            Signature::new(vec![], TypeInfo::Int32),
        );
        function.body = FunctionBody::Normal(NormalBody {
            code,
            ..NormalBody::default()
        });
        module.add_function(function);

        let text = disassemble_module(&module);
        assert!(text.contains("== module demo =="));
        assert!(text.contains("[0] main: fn() -> Int32"));
        assert!(text.contains("0000  LOAD_STATIC 0  ; 42"));
        assert!(text.contains("0002  JUMP 1  ; -> 0005"));
        assert!(text.contains("0004  NOOP"));
    }

    #[test]
    fn test_unknown_byte() {
        let module = Module::new("demo", Heap::new());
        let mut out = String::new();
        let next = write_instruction(&mut out, &module, &[0xff], 0).unwrap();
        assert_eq!(next, 1);
        assert_eq!(out, "<unknown 0xff>");
    }
}
