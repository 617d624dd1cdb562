//! Interactive prompt, plus the input runner and tracer shared with the
//! command line.

use std::io::{self, Write};
use std::ops::ControlFlow;
use std::path::PathBuf;

use colored::Colorize;

use crate::bytecode::disassembler::write_instruction;
use crate::bytecode::disassemble_module;
use crate::error::KindleError;
use crate::interpreter::Session;
use crate::module::{Function, Module};
use crate::vm::{MachineObserver, StepEvent, Value};

const HISTORY_FILE: &str = ".kindle_history";

/// What to print while evaluating an input.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// AST straight from the parser
    pub print_raw_ast: bool,
    /// AST once the input compiled
    pub print_ast: bool,
    pub print_bytecode: bool,
    pub print_symtab: bool,
    pub print_module: bool,
    pub trace: bool,
}

/// Prints every call and every executed instruction.
#[derive(Default)]
pub struct TraceObserver {
    depth: usize,
}

impl MachineObserver for TraceObserver {
    fn call_enter(&mut self, module: &Module, function: &Function) {
        println!("{}{} {}::{}", indent(self.depth), "call".cyan(), module.name(), function.name);
        self.depth += 1;
    }

    fn call_exit(&mut self, module: &Module, function: &Function) {
        self.depth = self.depth.saturating_sub(1);
        println!("{}{} {}::{}", indent(self.depth), "ret".cyan(), module.name(), function.name);
    }

    fn step(&mut self, event: &StepEvent<'_>) -> ControlFlow<()> {
        let Some(code) = event.function.code() else {
            return ControlFlow::Continue(());
        };
        let code = code.bytes();
        if event.cursor >= code.len() {
            return ControlFlow::Continue(());
        }
        let mut line = String::new();
        if write_instruction(&mut line, event.module, code, event.cursor).is_ok() {
            println!(
                "{}{:04}  {:<32} {}",
                indent(self.depth),
                event.cursor,
                line,
                format!("[stack {}]", event.stack.len()).dimmed()
            );
        }
        ControlFlow::Continue(())
    }
}

fn indent(depth: usize) -> String {
    "  ".repeat(depth)
}

/// Evaluate `source` in `session`, printing what `options` ask for. Values
/// of non-final statements are printed as they are invoked.
pub fn evaluate(session: &mut Session, source: &str, options: &Options) -> Result<Value, KindleError> {
    let program = crate::interpreter::parse(source)?;
    if options.print_raw_ast {
        println!("{}\n{}", "Raw AST:".bold(), program);
    }
    let compiled = session.compile_program(program)?;
    if options.print_ast {
        println!("{}\n{}", "Compiled AST:".bold(), compiled.program);
    }
    if options.print_symtab {
        println!("{}\n{}", "Symbol table:".bold(), compiled.module.symtab());
    }
    if options.print_module {
        print!("{}", compiled.module);
    }
    if options.print_bytecode {
        print!("{}", disassemble_module(&compiled.module));
    }

    if options.trace {
        session
            .machine_mut()
            .set_observer(Some(Box::new(TraceObserver::default())));
    }
    let heap = session.heap().clone();
    let result = session.run(compiled, &mut |value| println!("{}", value.display(&heap)));
    if options.trace {
        session.machine_mut().take_observer();
    }
    result
}

/// Print an error with its supplementary detail.
pub fn report_error(err: &KindleError) {
    eprintln!("{} {}", "Error:".red().bold(), err);
    if let Some(detail) = err.detail() {
        eprintln!("  {}", detail);
    }
}

/// Net count of `{` over `}` outside string and char literals.
pub fn count_braces(line: &str) -> i32 {
    let mut balance = 0;
    let mut quote = None;
    let mut escaped = false;

    for c in line.chars() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
        } else if c == '"' || c == '\'' {
            quote = Some(c);
        } else if c == '{' {
            balance += 1;
        } else if c == '}' {
            balance -= 1;
        }
    }
    balance
}

pub struct Repl {
    session: Session,
    options: Options,
    history: Vec<String>,
    history_file: PathBuf,
    buffer: String,
    balance: i32,
}

impl Repl {
    pub fn new(session: Session, options: Options) -> Self {
        let mut repl = Self {
            session,
            options,
            history: Vec::new(),
            history_file: Self::history_path(),
            buffer: String::new(),
            balance: 0,
        };
        repl.load_history();
        repl
    }

    fn history_path() -> PathBuf {
        match dirs::home_dir() {
            Some(home) => home.join(HISTORY_FILE),
            None => PathBuf::from(HISTORY_FILE),
        }
    }

    fn load_history(&mut self) {
        if let Ok(content) = std::fs::read_to_string(&self.history_file) {
            self.history
                .extend(content.lines().filter(|l| !l.trim().is_empty()).map(String::from));
        }
    }

    fn save_history(&self) {
        let _ = std::fs::write(&self.history_file, self.history.join("\n"));
    }

    pub fn run(&mut self) {
        println!("Kindle {}", env!("CARGO_PKG_VERSION"));
        println!("Type .help for available commands.\n");

        let stdin = io::stdin();
        loop {
            print!("{}", self.prompt());
            let _ = io::stdout().flush();

            let mut line = String::new();
            match stdin.read_line(&mut line) {
                Ok(0) | Err(_) => {
                    println!();
                    break;
                }
                Ok(_) => {
                    let line = line.trim_end();
                    if self.buffer.is_empty() {
                        if line.trim().is_empty() {
                            continue;
                        }
                        self.history.push(line.to_string());
                        if line.starts_with('.') || line == "exit" {
                            if !self.command(line.trim()) {
                                break;
                            }
                            continue;
                        }
                    } else {
                        self.history.push(line.to_string());
                    }
                    self.input(line);
                }
            }
        }
        self.save_history();
        println!("Goodbye!");
    }

    fn prompt(&self) -> String {
        if self.buffer.is_empty() {
            format!("_{}> ", self.session.counter()).green().bold().to_string()
        } else {
            "... ".dimmed().to_string()
        }
    }

    /// Collect lines until braces balance, then evaluate.
    fn input(&mut self, line: &str) {
        if !self.buffer.is_empty() {
            self.buffer.push('\n');
        }
        self.buffer.push_str(line);
        self.balance += count_braces(line);
        if self.balance > 0 {
            return;
        }
        let source = std::mem::take(&mut self.buffer);
        self.balance = 0;
        self.eval(&source);
    }

    fn eval(&mut self, source: &str) {
        let number = self.session.counter();
        match evaluate(&mut self.session, source, &self.options) {
            Ok(value) if value.is_void() => {}
            Ok(value) => println!(
                "{} = {}",
                format!("_{}", number).green(),
                value.display(self.session.heap())
            ),
            Err(err) => report_error(&err),
        }
    }

    /// Run a dot command. Returns false to leave the REPL.
    fn command(&mut self, line: &str) -> bool {
        let mut parts = line.split_whitespace();
        let name = parts.next().unwrap_or_default();
        match name {
            ".quit" | ".q" | "exit" => return false,
            ".help" | ".h" => print_help(),
            ".dump_module" | ".dm" => self.dump_module(parts.next()),
            ".bytecode" | ".b" => {
                self.options.print_bytecode = !self.options.print_bytecode;
                println!("Bytecode printing {}.", on_off(self.options.print_bytecode));
            }
            ".trace" | ".t" => {
                self.options.trace = !self.options.trace;
                println!("Tracing {}.", on_off(self.options.trace));
            }
            ".stack" | ".s" => print!("{}", self.session.machine().stack()),
            _ => println!("Unknown command: {}. Type .help for available commands.", line),
        }
        true
    }

    fn dump_module(&self, name: Option<&str>) {
        let module = match name {
            Some(name) => self.session.find_module(name),
            None => self.session.inputs().last().cloned(),
        };
        match module {
            Some(module) => {
                print!("{}", module);
                print!("{}", disassemble_module(&module));
            }
            None => println!("No module {}", name.unwrap_or("evaluated yet")),
        }
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "enabled"
    } else {
        "disabled"
    }
}

fn print_help() {
    println!();
    println!("Kindle REPL Commands");
    println!();
    println!(".help, .h               Show this help message");
    println!(".quit, .q               Leave the REPL");
    println!(".dump_module [name]     Print a module, the last input by default");
    println!(".bytecode, .b           Toggle printing bytecode of each input");
    println!(".trace, .t              Toggle tracing execution");
    println!(".stack, .s              Print the machine stack");
    println!();
    println!("Results are bound as _N and can be used by later inputs.");
    println!();
}
