//! Type model: value types and function signatures.

pub mod signature;
pub mod type_info;

pub use signature::{ReturnTypeConflict, Signature};
pub use type_info::{TypeInfo, HANDLE_SIZE};
