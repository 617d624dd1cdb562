//! Parser module for Kindle.

mod core;
mod expressions;
mod precedence;
mod statements;
mod types;

#[cfg(test)]
mod tests;

pub use self::core::{ParseResult, Parser};
