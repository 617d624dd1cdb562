//! Kindle CLI: evaluate files or expressions, or run the REPL.

use std::env;
use std::fs;
use std::process;

use tracing_subscriber::EnvFilter;

use kindle::interpreter::{Session, SessionConfig};
use kindle::repl::{self, Options, Repl};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Filter directives for log output, e.g. `KINDLE_LOG=kindle=debug`.
const LOG_VAR: &str = "KINDLE_LOG";

struct Args {
    files: Vec<String>,
    expression: Option<String>,
    options: Options,
    with_std_lib: bool,
}

fn print_usage() {
    eprintln!("Kindle {} - statically typed scripting language", VERSION);
    eprintln!();
    eprintln!("Usage: kindle [options] [file...]");
    eprintln!();
    eprintln!("With no file and no -e, starts the interactive REPL.");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -e EXPR      Evaluate EXPR and print the result");
    eprintln!("  -r           Print the raw AST");
    eprintln!("  -t           Print the AST after compilation");
    eprintln!("  -b           Print bytecode");
    eprintln!("  -s           Print the symbol table");
    eprintln!("  -m           Print module functions, values and types");
    eprintln!("  --trace      Trace execution");
    eprintln!("  --no-std     Don't load the std module");
    eprintln!("  --no-color   Disable colored output");
    eprintln!("  -h, --help   Show this help message");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  KINDLE_STD_PATH           Load std from this file");
    eprintln!("  KINDLE_INSTRUCTION_LIMIT  Abort evaluation after this many instructions");
    eprintln!("  KINDLE_LOG                Log filter (default: warn)");
}

fn parse_args() -> Args {
    let args: Vec<String> = env::args().skip(1).collect();
    let mut parsed = Args {
        files: Vec::new(),
        expression: None,
        options: Options::default(),
        with_std_lib: true,
    };

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-e" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("-e requires an expression");
                    print_usage();
                    process::exit(64);
                }
                parsed.expression = Some(args[i].clone());
            }
            "-r" => parsed.options.print_raw_ast = true,
            "-t" => parsed.options.print_ast = true,
            "-b" => parsed.options.print_bytecode = true,
            "-s" => parsed.options.print_symtab = true,
            "-m" => parsed.options.print_module = true,
            "--trace" => parsed.options.trace = true,
            "--no-std" => parsed.with_std_lib = false,
            "--no-color" => colored::control::set_override(false),
            "-h" | "--help" => {
                print_usage();
                process::exit(0);
            }
            arg if arg.starts_with('-') => {
                eprintln!("Unknown option: {}", arg);
                print_usage();
                process::exit(64);
            }
            file => parsed.files.push(file.to_string()),
        }
        i += 1;
    }
    parsed
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_VAR).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    init_logging();
    let args = parse_args();

    let mut config = SessionConfig::from_env();
    config.with_std_lib = args.with_std_lib;
    let mut session = match Session::new(config) {
        Ok(session) => session,
        Err(err) => {
            repl::report_error(&err);
            process::exit(70);
        }
    };

    if args.files.is_empty() && args.expression.is_none() {
        Repl::new(session, args.options).run();
        return;
    }

    for path in &args.files {
        let source = match fs::read_to_string(path) {
            Ok(source) => source,
            Err(err) => {
                eprintln!("Error: Failed to read file '{}': {}", path, err);
                process::exit(66);
            }
        };
        if let Err(err) = repl::evaluate(&mut session, &source, &args.options) {
            repl::report_error(&err);
            process::exit(70);
        }
    }

    if let Some(expression) = &args.expression {
        match repl::evaluate(&mut session, expression, &args.options) {
            Ok(value) => {
                if !value.is_void() {
                    println!("{}", value.display(session.heap()));
                }
            }
            Err(err) => {
                repl::report_error(&err);
                process::exit(70);
            }
        }
    }
}
