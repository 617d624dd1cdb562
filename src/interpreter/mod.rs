//! Interpreter session: compiles inputs one by one and runs them on a
//! shared machine.
//!
//! Each input becomes a module `input_N` that imports `builtin`, then `std`,
//! then any modules added with [`Session::import`], then every earlier
//! input. The result of input N is bound as the static `_N`, so later
//! inputs can refer to it.

mod config;

pub use config::{SessionConfig, INSTRUCTION_LIMIT_VAR, STD_PATH_VAR};

use std::fs;
use std::rc::Rc;

use tracing::debug;

use crate::ast::Program;
use crate::compiler::compile_module;
use crate::error::{KindleError, RuntimeError};
use crate::lexer::Scanner;
use crate::module::Module;
use crate::parser::Parser;
use crate::symtab::Symbol;
use crate::vm::{builtin_module, Heap, Machine, Value, VmResult};

/// Name of the standard library module.
pub const STD_MODULE_NAME: &str = "std";

const STD_SOURCE: &str = include_str!("../../share/std.ks");

/// Parse source text into a program.
pub fn parse(source: &str) -> Result<Program, KindleError> {
    let tokens = Scanner::new(source).scan_tokens()?;
    Ok(Parser::new(tokens).parse()?)
}

/// An input compiled into its own module, not run yet.
pub struct CompiledInput {
    pub program: Program,
    pub module: Rc<Module>,
    /// Index of the `main` function in `module`
    pub main: usize,
}

pub struct Session {
    config: SessionConfig,
    heap: Heap,
    machine: Machine,
    builtin: Rc<Module>,
    std: Option<Rc<Module>>,
    /// Modules imported by inputs, after builtin and std
    imports: Vec<Rc<Module>>,
    inputs: Vec<Rc<Module>>,
    counter: usize,
}

impl Session {
    pub fn new(config: SessionConfig) -> Result<Self, KindleError> {
        let heap = Heap::new();
        let machine = Machine::with_config(heap.clone(), config.machine.clone());
        let builtin = builtin_module(&heap);
        let mut session = Self {
            config,
            heap,
            machine,
            builtin,
            std: None,
            imports: Vec::new(),
            inputs: Vec::new(),
            counter: 0,
        };
        if session.config.with_std_lib {
            let source = match &session.config.std_lib_path {
                Some(path) => fs::read_to_string(path)?,
                None => STD_SOURCE.to_string(),
            };
            session.std = Some(session.build_module(STD_MODULE_NAME, &source)?);
        }
        Ok(session)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut Machine {
        &mut self.machine
    }

    pub fn builtin(&self) -> &Rc<Module> {
        &self.builtin
    }

    pub fn std_module(&self) -> Option<&Rc<Module>> {
        self.std.as_ref()
    }

    /// Successfully evaluated inputs, oldest first.
    pub fn inputs(&self) -> &[Rc<Module>] {
        &self.inputs
    }

    /// Number of the next input, the `N` in `_N`.
    pub fn counter(&self) -> usize {
        self.counter
    }

    /// Look up a module by name: builtin, std, imports or inputs.
    pub fn find_module(&self, name: &str) -> Option<Rc<Module>> {
        std::iter::once(&self.builtin)
            .chain(self.std.iter())
            .chain(self.imports.iter())
            .chain(self.inputs.iter())
            .find(|module| module.name() == name)
            .cloned()
    }

    /// Compile `source` as a module importing builtin and std.
    pub fn build_module(&self, name: &str, source: &str) -> Result<Rc<Module>, KindleError> {
        let program = parse(source)?;
        let module = Rc::new(Module::new(name, self.heap.clone()));
        module.add_imported_module(self.builtin.clone());
        if let Some(std) = &self.std {
            module.add_imported_module(std.clone());
        }
        compile_module(&module, &program, &self.config.compiler)?;
        debug!(module = name, functions = module.function_count(), "built module");
        Ok(module)
    }

    /// Make `module` visible to every later input.
    pub fn import(&mut self, module: Rc<Module>) {
        self.imports.push(module);
    }

    /// Compile and run one input. The result is bound as `_N` and shares
    /// that binding's heap references, so it stays valid while the session
    /// lives. `on_invoke` receives the value of every non-final statement.
    pub fn eval(&mut self, input: &str, on_invoke: &mut dyn FnMut(&Value)) -> Result<Value, KindleError> {
        let compiled = self.compile(input)?;
        self.run(compiled, on_invoke)
    }

    /// First half of [`Session::eval`]: parse and compile without running.
    pub fn compile(&self, input: &str) -> Result<CompiledInput, KindleError> {
        self.compile_program(parse(input)?)
    }

    /// Compile an already parsed input as module `input_N`.
    pub fn compile_program(&self, program: Program) -> Result<CompiledInput, KindleError> {
        let module = Rc::new(Module::new(format!("input_{}", self.counter), self.heap.clone()));
        module.add_imported_module(self.builtin.clone());
        for import in self.std.iter().chain(&self.imports).chain(&self.inputs) {
            module.add_visible_module(import.clone());
        }
        let main = compile_module(&module, &program, &self.config.compiler)?;
        debug!(module = module.name(), functions = module.function_count(), "compiled input");
        Ok(CompiledInput {
            program,
            module,
            main,
        })
    }

    /// Second half of [`Session::eval`]: run a compiled input and keep it.
    pub fn run(&mut self, input: CompiledInput, on_invoke: &mut dyn FnMut(&Value)) -> Result<Value, KindleError> {
        let CompiledInput { module, main, .. } = input;
        let value = match self.execute(&module, main, on_invoke) {
            Ok(value) => value,
            Err(err) => {
                self.machine.stack_mut().clear();
                return Err(err.into());
            }
        };
        if !value.is_void() {
            let name = format!("_{}", self.counter);
            let index = module.add_value(value.clone());
            module.define(&name, Symbol::Value { index });
        }
        self.inputs.push(module);
        self.counter += 1;
        Ok(value)
    }

    fn execute(&mut self, module: &Rc<Module>, main: usize, on_invoke: &mut dyn FnMut(&Value)) -> VmResult<Value> {
        self.machine.call(module, main, on_invoke)?;
        let function = module.get_function(main).ok_or_else(|| RuntimeError::BadFunctionIndex {
            module: module.name().to_string(),
            index: main,
        })?;
        self.machine
            .stack_mut()
            .pull_value(&function.effective_return_type())
    }
}
