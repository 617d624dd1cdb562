//! Modules: the unit of compilation.
//!
//! A module holds functions, static values, interned types, imported modules
//! and its root symbol table. Indices never change once issued. Functions may
//! be replaced in place while compiling (declared, then defined).

mod function;

pub use function::{Function, FunctionBody, GenericBody, NativeDelegate, NormalBody};

use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;

use tracing::warn;

use crate::symtab::{Symbol, SymbolTable, ROOT_SCOPE};
use crate::types::{Signature, TypeInfo};
use crate::vm::heap::Heap;
use crate::vm::value::Value;

/// Cached instantiation of a generic function.
#[derive(Debug, Clone)]
struct GenericInstance {
    generic: usize,
    args: Vec<TypeInfo>,
    instance: usize,
}

pub struct Module {
    name: String,
    heap: Heap,
    imports: RefCell<Vec<Rc<Module>>>,
    visible: RefCell<Vec<Rc<Module>>>,
    functions: RefCell<Vec<Rc<Function>>>,
    values: RefCell<Vec<Value>>,
    types: RefCell<Vec<TypeInfo>>,
    symtab: RefCell<SymbolTable>,
    instances: RefCell<Vec<GenericInstance>>,
}

impl Module {
    pub fn new(name: impl Into<String>, heap: Heap) -> Self {
        let name = name.into();
        Self {
            symtab: RefCell::new(SymbolTable::new(&name)),
            name,
            heap,
            imports: RefCell::new(Vec::new()),
            visible: RefCell::new(Vec::new()),
            functions: RefCell::new(Vec::new()),
            values: RefCell::new(Vec::new()),
            types: RefCell::new(Vec::new()),
            instances: RefCell::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    // ===== Imports =====

    pub fn add_imported_module(&self, module: Rc<Module>) -> usize {
        let mut imports = self.imports.borrow_mut();
        imports.push(module);
        imports.len() - 1
    }

    pub fn get_imported_module(&self, index: usize) -> Option<Rc<Module>> {
        self.imports.borrow().get(index).cloned()
    }

    pub fn get_imported_module_index(&self, module: &Rc<Module>) -> Option<usize> {
        self.imports
            .borrow()
            .iter()
            .position(|m| Rc::ptr_eq(m, module))
    }

    pub fn imported_module_count(&self) -> usize {
        self.imports.borrow().len()
    }

    pub fn imports(&self) -> Vec<Rc<Module>> {
        self.imports.borrow().clone()
    }

    /// Make the names of `module` resolvable without importing it. It is
    /// imported on first call, so only modules actually called from this
    /// one take an import slot.
    pub fn add_visible_module(&self, module: Rc<Module>) {
        self.visible.borrow_mut().push(module);
    }

    pub fn visible_modules(&self) -> Vec<Rc<Module>> {
        self.visible.borrow().clone()
    }

    /// Index of `module` among the imports, importing it if it is visible.
    pub fn import_visible(&self, module: &Rc<Module>) -> Option<usize> {
        if let Some(index) = self.get_imported_module_index(module) {
            return Some(index);
        }
        let visible = self.visible.borrow().iter().any(|m| Rc::ptr_eq(m, module));
        visible.then(|| self.add_imported_module(module.clone()))
    }

    // ===== Functions =====

    pub fn add_function(&self, function: Function) -> usize {
        let mut functions = self.functions.borrow_mut();
        functions.push(Rc::new(function));
        functions.len() - 1
    }

    /// Replace a function, e.g. when a declared function gets its body.
    pub fn set_function(&self, index: usize, function: Function) {
        if let Some(slot) = self.functions.borrow_mut().get_mut(index) {
            *slot = Rc::new(function);
        }
    }

    pub fn get_function(&self, index: usize) -> Option<Rc<Function>> {
        self.functions.borrow().get(index).cloned()
    }

    pub fn function_count(&self) -> usize {
        self.functions.borrow().len()
    }

    /// Index of the function bound to `name` at module level, or else the
    /// first function with that name, which finds unbound generic
    /// instances such as `identity<Int32>`.
    pub fn find_function(&self, name: &str) -> Option<usize> {
        if let Some(Symbol::Function { index }) = self.symtab.borrow().lookup_local(ROOT_SCOPE, name) {
            return Some(*index);
        }
        self.functions.borrow().iter().position(|f| f.name == name)
    }

    /// Register a host function and bind it to `name`.
    pub fn add_native_function(
        &self,
        name: &str,
        signature: Signature,
        delegate: NativeDelegate,
    ) -> usize {
        let index = self.add_function(Function::native(name, signature, delegate));
        self.define(name, Symbol::Function { index });
        index
    }

    // ===== Values =====

    /// Add a static value. The module takes over one reference to its heap data.
    pub fn add_value(&self, value: Value) -> usize {
        let mut values = self.values.borrow_mut();
        values.push(value);
        values.len() - 1
    }

    /// Add a scalar static, reusing an identical one.
    pub fn intern_value(&self, value: Value) -> usize {
        let existing = self.values.borrow().iter().position(|v| {
            v == &value
                && v.type_info().is_identical(&value.type_info())
                && !v.type_info().is_heap()
        });
        existing.unwrap_or_else(|| self.add_value(value))
    }

    pub fn get_value(&self, index: usize) -> Option<Value> {
        self.values.borrow().get(index).cloned()
    }

    pub fn value_count(&self) -> usize {
        self.values.borrow().len()
    }

    // ===== Types =====

    /// Intern a type, returning the index of an identical one if present.
    pub fn add_type(&self, ty: TypeInfo) -> usize {
        let mut types = self.types.borrow_mut();
        if let Some(index) = types.iter().position(|t| t.is_identical(&ty)) {
            return index;
        }
        types.push(ty);
        types.len() - 1
    }

    pub fn get_type(&self, index: usize) -> Option<TypeInfo> {
        self.types.borrow().get(index).cloned()
    }

    pub fn type_count(&self) -> usize {
        self.types.borrow().len()
    }

    // ===== Symbols =====

    pub fn symtab(&self) -> Ref<'_, SymbolTable> {
        self.symtab.borrow()
    }

    pub fn symtab_mut(&self) -> RefMut<'_, SymbolTable> {
        self.symtab.borrow_mut()
    }

    /// Bind `name` in the root scope.
    pub fn define(&self, name: &str, symbol: Symbol) {
        self.symtab.borrow_mut().add(ROOT_SCOPE, name, symbol);
    }

    pub fn lookup(&self, name: &str) -> Option<Symbol> {
        self.symtab.borrow().lookup_local(ROOT_SCOPE, name).cloned()
    }

    // ===== Generic instances =====

    pub fn find_instance(&self, generic: usize, args: &[TypeInfo]) -> Option<usize> {
        self.instances
            .borrow()
            .iter()
            .find(|inst| {
                inst.generic == generic
                    && inst.args.len() == args.len()
                    && inst.args.iter().zip(args).all(|(a, b)| a.is_identical(b))
            })
            .map(|inst| inst.instance)
    }

    pub fn add_instance(&self, generic: usize, args: Vec<TypeInfo>, instance: usize) {
        self.instances.borrow_mut().push(GenericInstance {
            generic,
            args,
            instance,
        });
    }

    /// Forget a cached instance, e.g. after its body failed to compile.
    pub fn remove_instance(&self, instance: usize) {
        self.instances
            .borrow_mut()
            .retain(|inst| inst.instance != instance);
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        for value in self.values.get_mut().drain(..) {
            if let Err(err) = value.decref(&self.heap) {
                warn!(module = %self.name, "releasing static value failed: {}", err);
            }
        }
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("functions", &self.function_count())
            .field("values", &self.value_count())
            .finish()
    }
}

/// Listing of functions, values and types.
impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "module {}", self.name)?;
        let imports = self.imports.borrow();
        if !imports.is_empty() {
            writeln!(f, "  imports:")?;
            for (i, import) in imports.iter().enumerate() {
                writeln!(f, "    [{}] {}", i, import.name)?;
            }
        }
        writeln!(f, "  functions:")?;
        for (i, function) in self.functions.borrow().iter().enumerate() {
            writeln!(
                f,
                "    [{}] {}: {} ({})",
                i,
                function.name,
                function.signature,
                function.body.kind()
            )?;
        }
        let values = self.values.borrow();
        if !values.is_empty() {
            writeln!(f, "  values:")?;
            for (i, value) in values.iter().enumerate() {
                writeln!(
                    f,
                    "    [{}] {}: {}",
                    i,
                    value.display(&self.heap),
                    value.type_info()
                )?;
            }
        }
        let types = self.types.borrow();
        if !types.is_empty() {
            writeln!(f, "  types:")?;
            for (i, ty) in types.iter().enumerate() {
                writeln!(f, "    [{}] {}", i, ty)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_indices_are_stable() {
        let module = Module::new("m", Heap::new());
        assert_eq!(module.add_function(Function::new("a", Signature::empty())), 0);
        assert_eq!(module.add_function(Function::new("b", Signature::empty())), 1);
        module.set_function(0, Function::new("a2", Signature::empty()));
        assert_eq!(module.get_function(0).unwrap().name, "a2");
        assert_eq!(module.get_function(1).unwrap().name, "b");
        assert!(module.get_function(2).is_none());
    }

    #[test]
    fn test_types_are_interned() {
        let module = Module::new("m", Heap::new());
        let a = module.add_type(TypeInfo::list(TypeInfo::Int32));
        let b = module.add_type(TypeInfo::Int64);
        let c = module.add_type(TypeInfo::list(TypeInfo::Int32));
        assert_eq!(a, c);
        assert!(a != b);
        // Unknown is only identical to Unknown
        let d = module.add_type(TypeInfo::list(TypeInfo::Unknown));
        assert!(d != a);
    }

    #[test]
    fn test_scalar_values_are_interned() {
        let module = Module::new("m", Heap::new());
        let a = module.intern_value(Value::Int32(1));
        let b = module.intern_value(Value::Int64(1));
        let c = module.intern_value(Value::Int32(1));
        assert_eq!(a, c);
        assert!(a != b);
    }

    #[test]
    fn test_imports() {
        let heap = Heap::new();
        let builtin = Rc::new(Module::new("builtin", heap.clone()));
        let module = Module::new("m", heap);
        assert_eq!(module.add_imported_module(builtin.clone()), 0);
        assert_eq!(module.get_imported_module_index(&builtin), Some(0));
        assert_eq!(module.get_imported_module(0).unwrap().name(), "builtin");
    }

    #[test]
    fn test_visible_modules_are_imported_on_demand() {
        let heap = Heap::new();
        let builtin = Rc::new(Module::new("builtin", heap.clone()));
        let other = Rc::new(Module::new("other", heap.clone()));
        let hidden = Rc::new(Module::new("hidden", heap.clone()));
        let module = Module::new("m", heap);
        module.add_imported_module(builtin);
        module.add_visible_module(other.clone());
        assert_eq!(module.imported_module_count(), 1);
        assert_eq!(module.import_visible(&other), Some(1));
        assert_eq!(module.import_visible(&other), Some(1));
        assert_eq!(module.imported_module_count(), 2);
        assert_eq!(module.import_visible(&hidden), None);
    }

    #[test]
    fn test_drop_releases_statics() {
        let heap = Heap::new();
        {
            let module = Module::new("m", heap.clone());
            module.add_value(Value::string(&heap, "owned"));
            assert_eq!(heap.live_count(), 1);
        }
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_find_function_by_name() {
        let module = Module::new("m", Heap::new());
        let bound = module.add_function(Function::new("f", Signature::empty()));
        module.define("f", Symbol::Function { index: bound });
        let unbound = module.add_function(Function::new("g<Int32>", Signature::empty()));
        assert_eq!(module.find_function("f"), Some(bound));
        assert_eq!(module.find_function("g<Int32>"), Some(unbound));
        assert_eq!(module.find_function("h"), None);
    }

    #[test]
    fn test_generic_instance_cache() {
        let module = Module::new("m", Heap::new());
        module.add_instance(0, vec![TypeInfo::Int32], 3);
        assert_eq!(module.find_instance(0, &[TypeInfo::Int32]), Some(3));
        assert_eq!(module.find_instance(0, &[TypeInfo::String]), None);
        assert_eq!(module.find_instance(1, &[TypeInfo::Int32]), None);
    }
}
