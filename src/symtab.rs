//! Symbol table: nested scopes mapping names to stack slots, functions and statics.
//!
//! Each module owns one table. Scopes live in an arena and refer to their
//! parent by id; scope 0 is the module root.

use std::fmt;

use indexmap::IndexMap;

use crate::types::TypeInfo;

/// Index of a scope in its module's symbol table.
pub type ScopeId = usize;

/// The module root scope.
pub const ROOT_SCOPE: ScopeId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Module,
    Function,
    Block,
}

/// What a name refers to.
#[derive(Debug, Clone)]
pub enum Symbol {
    /// Function parameter, read with `CopyArgument(offset, size)`
    Parameter {
        index: usize,
        offset: usize,
        ty: TypeInfo,
    },
    /// Local variable, read with `CopyVariable(offset, size)`
    Local { offset: usize, ty: TypeInfo },
    /// Value captured from an enclosing function
    Nonlocal {
        index: usize,
        offset: usize,
        ty: TypeInfo,
    },
    /// Function in the owning module
    Function { index: usize },
    /// Module-level binding computed by a zero-parameter function
    Computed { index: usize },
    /// Static value in the owning module
    Value { index: usize },
}

impl Symbol {
    /// Type of a stack-resident symbol.
    pub fn stack_type(&self) -> Option<&TypeInfo> {
        match self {
            Symbol::Parameter { ty, .. } | Symbol::Local { ty, .. } | Symbol::Nonlocal { ty, .. } => {
                Some(ty)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Scope {
    pub kind: ScopeKind,
    pub parent: Option<ScopeId>,
    pub name: String,
    symbols: IndexMap<String, Symbol>,
}

impl Scope {
    pub fn symbols(&self) -> impl Iterator<Item = (&String, &Symbol)> {
        self.symbols.iter()
    }
}

/// Where a name was found.
#[derive(Debug, Clone)]
pub struct Lookup {
    pub scope: ScopeId,
    pub symbol: Symbol,
    /// The walk left a function scope before finding the name
    pub crossed_function: bool,
}

#[derive(Debug, Clone)]
pub struct SymbolTable {
    scopes: Vec<Scope>,
}

impl SymbolTable {
    pub fn new(module_name: &str) -> Self {
        Self {
            scopes: vec![Scope {
                kind: ScopeKind::Module,
                parent: None,
                name: module_name.to_string(),
                symbols: IndexMap::new(),
            }],
        }
    }

    pub fn add_scope(&mut self, parent: ScopeId, kind: ScopeKind, name: impl Into<String>) -> ScopeId {
        self.scopes.push(Scope {
            kind,
            parent: Some(parent),
            name: name.into(),
            symbols: IndexMap::new(),
        });
        self.scopes.len() - 1
    }

    /// Bind `name` in `scope`, shadowing any earlier binding of the same name there.
    pub fn add(&mut self, scope: ScopeId, name: impl Into<String>, symbol: Symbol) {
        self.scopes[scope].symbols.insert(name.into(), symbol);
    }

    pub fn get(&self, scope: ScopeId) -> &Scope {
        &self.scopes[scope]
    }

    pub fn parent(&self, scope: ScopeId) -> Option<ScopeId> {
        self.scopes[scope].parent
    }

    /// Look up `name` in `scope` only.
    pub fn lookup_local(&self, scope: ScopeId, name: &str) -> Option<&Symbol> {
        self.scopes[scope].symbols.get(name)
    }

    /// Look up `name` walking from `scope` towards the root.
    pub fn resolve(&self, scope: ScopeId, name: &str) -> Option<Lookup> {
        self.resolve_until(scope, name, None)
    }

    /// Like `resolve`, but stop before entering `stop`.
    pub fn resolve_until(&self, scope: ScopeId, name: &str, stop: Option<ScopeId>) -> Option<Lookup> {
        let mut current = Some(scope);
        let mut crossed_function = false;
        while let Some(id) = current {
            if Some(id) == stop {
                return None;
            }
            let scope = &self.scopes[id];
            if let Some(symbol) = scope.symbols.get(name) {
                return Some(Lookup {
                    scope: id,
                    symbol: symbol.clone(),
                    crossed_function,
                });
            }
            if scope.kind == ScopeKind::Function {
                crossed_function = true;
            }
            current = scope.parent;
        }
        None
    }

    pub fn root(&self) -> &Scope {
        &self.scopes[ROOT_SCOPE]
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    fn fmt_scope(&self, f: &mut fmt::Formatter<'_>, id: ScopeId, indent: usize) -> fmt::Result {
        let scope = &self.scopes[id];
        writeln!(f, "{:indent$}{:?} {}", "", scope.kind, scope.name, indent = indent)?;
        for (name, symbol) in &scope.symbols {
            let desc = match symbol {
                Symbol::Parameter { index, ty, .. } => format!("parameter #{}: {}", index, ty),
                Symbol::Local { offset, ty } => format!("local @{}: {}", offset, ty),
                Symbol::Nonlocal { index, ty, .. } => format!("nonlocal #{}: {}", index, ty),
                Symbol::Function { index } => format!("function #{}", index),
                Symbol::Computed { index } => format!("computed #{}", index),
                Symbol::Value { index } => format!("value #{}", index),
            };
            writeln!(f, "{:indent$}  {} = {}", "", name, desc, indent = indent)?;
        }
        for (child, scope) in self.scopes.iter().enumerate() {
            if scope.parent == Some(id) {
                self.fmt_scope(f, child, indent + 2)?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for SymbolTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_scope(f, ROOT_SCOPE, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_walks_parents() {
        let mut table = SymbolTable::new("main");
        table.add(ROOT_SCOPE, "f", Symbol::Function { index: 0 });
        let func = table.add_scope(ROOT_SCOPE, ScopeKind::Function, "f");
        table.add(
            func,
            "x",
            Symbol::Parameter {
                index: 0,
                offset: 0,
                ty: TypeInfo::Int32,
            },
        );
        let block = table.add_scope(func, ScopeKind::Block, "");
        table.add(
            block,
            "y",
            Symbol::Local {
                offset: 0,
                ty: TypeInfo::Int64,
            },
        );

        let y = table.resolve(block, "y").unwrap();
        assert_eq!(y.scope, block);
        assert!(!y.crossed_function);

        let x = table.resolve(block, "x").unwrap();
        assert!(matches!(x.symbol, Symbol::Parameter { index: 0, .. }));

        let f = table.resolve(block, "f").unwrap();
        assert_eq!(f.scope, ROOT_SCOPE);
        assert!(f.crossed_function);

        assert!(table.resolve(block, "z").is_none());
        assert!(table.resolve_until(block, "f", Some(ROOT_SCOPE)).is_none());
    }

    #[test]
    fn test_shadowing_in_same_scope() {
        let mut table = SymbolTable::new("main");
        table.add(ROOT_SCOPE, "a", Symbol::Value { index: 0 });
        table.add(ROOT_SCOPE, "a", Symbol::Value { index: 3 });
        assert!(matches!(
            table.lookup_local(ROOT_SCOPE, "a"),
            Some(Symbol::Value { index: 3 })
        ));
    }

    #[test]
    fn test_display_lists_nested_scopes() {
        let mut table = SymbolTable::new("demo");
        table.add(ROOT_SCOPE, "answer", Symbol::Value { index: 0 });
        let func = table.add_scope(ROOT_SCOPE, ScopeKind::Function, "g");
        table.add(
            func,
            "n",
            Symbol::Nonlocal {
                index: 0,
                offset: 0,
                ty: TypeInfo::Int32,
            },
        );
        let text = table.to_string();
        assert!(text.contains("Module demo"));
        assert!(text.contains("answer = value #0"));
        assert!(text.contains("  Function g"));
        assert!(text.contains("n = nonlocal #0: Int32"));
    }
}
