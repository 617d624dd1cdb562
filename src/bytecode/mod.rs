//! Bytecode for the Kindle VM.
//!
//! # Architecture
//!
//! - `instruction`: opcode definitions, grouped by operand count
//! - `code`: append-only instruction buffer with a jump patch list
//! - `disassembler`: debug output for bytecode inspection

pub mod code;
pub mod disassembler;
pub mod instruction;

pub use code::{Code, JumpLabel, JumpTooFar};
pub use disassembler::{disassemble_function, disassemble_module};
pub use instruction::{Opcode, Width};
