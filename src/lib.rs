//! Kindle: an embeddable, statically typed scripting language.
//!
//! Source text is scanned, parsed, and compiled into modules of bytecode
//! functions, which run on a stack machine with a refcounted heap.
//! Functions may be generic (instantiated per argument types), capture
//! variables of enclosing functions, and be partially applied.
//!
//! [`interpreter::Session`] ties the pieces together for embedding and
//! for the REPL.

// Allow some clippy lints that are stylistic and not critical
#![allow(clippy::module_inception)]
#![allow(clippy::result_large_err)]
#![allow(clippy::new_without_default)]
#![allow(clippy::collapsible_if)]
#![allow(clippy::collapsible_else_if)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::len_zero)]

pub mod ast;
pub mod bytecode;
pub mod compiler;
pub mod error;
pub mod interpreter;
pub mod lexer;
pub mod module;
pub mod parser;
pub mod repl;
pub mod span;
pub mod symtab;
pub mod types;
pub mod vm;

pub use error::KindleError;
pub use interpreter::{Session, SessionConfig};
pub use vm::Value;

/// Evaluate `source` in a fresh session with default configuration and
/// return the displayed result.
pub fn eval_to_string(source: &str) -> Result<String, KindleError> {
    let mut session = Session::new(SessionConfig::default())?;
    let value = session.eval(source, &mut |_| {})?;
    Ok(value.display(session.heap()).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_eval_to_string() {
        assert_eq!(eval_to_string("let xs = [1, 2, 3]; count(xs) * 2").unwrap(), "6");
        assert!(matches!(eval_to_string("1 +"), Err(KindleError::Parser(_))));
    }
}
