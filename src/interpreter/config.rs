//! Session configuration.

use std::env;
use std::path::PathBuf;

use tracing::warn;

use crate::compiler::CompilerOptions;
use crate::vm::MachineConfig;

/// Path of a std library source file used instead of the embedded one.
pub const STD_PATH_VAR: &str = "KINDLE_STD_PATH";

/// Instruction limit applied to every evaluation.
pub const INSTRUCTION_LIMIT_VAR: &str = "KINDLE_INSTRUCTION_LIMIT";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Compile the `std` module and import it into every input
    pub with_std_lib: bool,
    /// Read `std` from this file instead of the embedded source
    pub std_lib_path: Option<PathBuf>,
    pub compiler: CompilerOptions,
    pub machine: MachineConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            with_std_lib: true,
            std_lib_path: None,
            compiler: CompilerOptions::default(),
            machine: MachineConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Defaults overridden by `KINDLE_STD_PATH` and `KINDLE_INSTRUCTION_LIMIT`.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(path) = lookup(STD_PATH_VAR).filter(|p| !p.is_empty()) {
            config.std_lib_path = Some(PathBuf::from(path));
        }
        if let Some(limit) = lookup(INSTRUCTION_LIMIT_VAR) {
            match limit.trim().parse::<u64>() {
                Ok(0) => config.machine.instruction_limit = None,
                Ok(n) => config.machine.instruction_limit = Some(n),
                Err(_) => warn!(value = %limit, "ignoring invalid {}", INSTRUCTION_LIMIT_VAR),
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name: &str| {
            vars.iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.to_string())
        }
    }

    #[test]
    fn test_defaults() {
        let config = SessionConfig::from_lookup(lookup(&[]));
        assert!(config.with_std_lib);
        assert_eq!(config.std_lib_path, None);
        assert_eq!(config.machine.instruction_limit, None);
        assert!(config.compiler.invoke_statements);
    }

    #[test]
    fn test_environment_overrides() {
        let vars = [(STD_PATH_VAR, "/tmp/std.ks"), (INSTRUCTION_LIMIT_VAR, "5000")];
        let config = SessionConfig::from_lookup(lookup(&vars));
        assert_eq!(config.std_lib_path, Some(PathBuf::from("/tmp/std.ks")));
        assert_eq!(config.machine.instruction_limit, Some(5000));
    }

    #[test]
    fn test_invalid_limit_is_ignored() {
        let config = SessionConfig::from_lookup(lookup(&[(INSTRUCTION_LIMIT_VAR, "lots")]));
        assert_eq!(config.machine.instruction_limit, None);
        let config = SessionConfig::from_lookup(lookup(&[(INSTRUCTION_LIMIT_VAR, "0")]));
        assert_eq!(config.machine.instruction_limit, None);
    }
}
