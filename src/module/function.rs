//! Functions and their bodies.

use std::fmt;
use std::rc::Rc;

use crate::ast::FunctionDecl;
use crate::bytecode::{Code, Opcode};
use crate::symtab::ScopeId;
use crate::types::{Signature, TypeInfo};
use crate::vm::heap::VmResult;
use crate::vm::stack::Stack;

/// Host function called directly against the stack. It pulls its arguments
/// (first parameter on top), releases them, and pushes its result.
pub type NativeDelegate = Rc<dyn Fn(&mut Stack) -> VmResult<()>>;

#[derive(Debug, Clone, Default)]
pub struct NormalBody {
    pub code: Code,
    /// Instructions that came from intrinsics
    pub intrinsics: usize,
    /// Inlined at call sites instead of called
    pub is_fragment: bool,
}

/// Function template kept as AST until called with concrete argument types.
#[derive(Debug, Clone)]
pub struct GenericBody {
    pub declaration: Rc<FunctionDecl>,
    /// Scope the declaration appeared in; instances resolve names from here
    pub scope: ScopeId,
}

#[derive(Clone)]
pub enum FunctionBody {
    /// Declared, not compiled yet
    Undefined,
    Normal(NormalBody),
    Generic(GenericBody),
    Native(NativeDelegate),
}

impl FunctionBody {
    pub fn kind(&self) -> &'static str {
        match self {
            FunctionBody::Undefined => "undefined",
            FunctionBody::Normal(body) if body.is_fragment => "fragment",
            FunctionBody::Normal(_) => "normal",
            FunctionBody::Generic(_) => "generic",
            FunctionBody::Native(_) => "native",
        }
    }
}

impl fmt::Debug for FunctionBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctionBody::Undefined => write!(f, "Undefined"),
            FunctionBody::Normal(body) => f.debug_tuple("Normal").field(body).finish(),
            FunctionBody::Generic(body) => write!(f, "Generic({})", body.declaration.name),
            FunctionBody::Native(_) => write!(f, "Native"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub signature: Rc<Signature>,
    pub body: FunctionBody,
    /// Names of the captured variables, in nonlocal order. Call sites
    /// resolve them to push the nonlocals.
    pub captures: Vec<String>,
}

impl Function {
    pub fn new(name: impl Into<String>, signature: Signature) -> Self {
        Self {
            name: name.into(),
            signature: Rc::new(signature),
            body: FunctionBody::Undefined,
            captures: Vec::new(),
        }
    }

    pub fn native(name: impl Into<String>, signature: Signature, delegate: NativeDelegate) -> Self {
        Self {
            body: FunctionBody::Native(delegate),
            ..Self::new(name, signature)
        }
    }

    /// A function consisting of a single inlined instruction.
    pub fn fragment(name: impl Into<String>, signature: Signature, opcode: Opcode) -> Self {
        let mut function = Self::new(name, signature);
        function.add_intrinsic(opcode);
        if let FunctionBody::Normal(body) = &mut function.body {
            body.is_fragment = true;
        }
        function
    }

    /// Append an intrinsic instruction, turning the body into a normal one.
    pub fn add_intrinsic(&mut self, opcode: Opcode) {
        if !matches!(self.body, FunctionBody::Normal(_)) {
            self.body = FunctionBody::Normal(NormalBody::default());
        }
        if let FunctionBody::Normal(body) = &mut self.body {
            body.code.add_opcode(opcode);
            body.intrinsics += 1;
        }
    }

    pub fn code(&self) -> Option<&Code> {
        match &self.body {
            FunctionBody::Normal(body) => Some(&body.code),
            _ => None,
        }
    }

    pub fn is_fragment(&self) -> bool {
        matches!(&self.body, FunctionBody::Normal(body) if body.is_fragment)
    }

    pub fn is_generic(&self) -> bool {
        matches!(self.body, FunctionBody::Generic(_))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self.body, FunctionBody::Undefined)
    }

    pub fn parameters(&self) -> &[TypeInfo] {
        &self.signature.params
    }

    pub fn raw_size_of_parameters(&self) -> usize {
        self.signature.raw_size_of_parameters()
    }

    pub fn raw_size_of_nonlocals(&self) -> usize {
        self.signature.raw_size_of_nonlocals()
    }

    pub fn raw_size_of_partial(&self) -> usize {
        self.signature.raw_size_of_partial()
    }

    pub fn closure_size(&self) -> usize {
        self.signature.closure_size()
    }

    /// Return type, with an unresolved one reading as `Void`.
    pub fn effective_return_type(&self) -> TypeInfo {
        match &self.signature.return_type {
            TypeInfo::Unknown => TypeInfo::Void,
            t => t.clone(),
        }
    }

    /// Closure contents in stack byte order: partial arguments, last first,
    /// then nonlocals, last first.
    pub fn closure_layout(&self) -> Vec<TypeInfo> {
        self.signature
            .partial
            .iter()
            .rev()
            .chain(self.signature.nonlocals.iter().rev())
            .cloned()
            .collect()
    }
}
