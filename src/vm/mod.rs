//! Runtime for compiled Kindle modules: a byte stack, a refcounted heap and
//! the machine that runs bytecode against them.
//!
//! The builtin module lives here too, since its natives are written against
//! the stack directly.

pub mod builtins;
pub mod heap;
pub mod machine;
pub mod stack;
pub mod value;

pub use builtins::builtin_module;
pub use heap::{Heap, HeapRef, VmResult};
pub use machine::{Machine, MachineConfig, MachineObserver, StepEvent};
pub use stack::Stack;
pub use value::Value;
