//! Function signatures.

use std::fmt;

use crate::types::type_info::TypeInfo;

/// Parameters, closure layout and return type of a function.
#[derive(Debug, Clone)]
pub struct Signature {
    pub params: Vec<TypeInfo>,
    /// Values captured from enclosing functions
    pub nonlocals: Vec<TypeInfo>,
    /// Arguments bound by partial application
    pub partial: Vec<TypeInfo>,
    pub return_type: TypeInfo,
}

/// A return type was resolved twice to different types.
#[derive(Debug, Clone)]
pub struct ReturnTypeConflict {
    pub declared: TypeInfo,
    pub found: TypeInfo,
}

impl Signature {
    pub fn new(params: Vec<TypeInfo>, return_type: TypeInfo) -> Self {
        Self {
            params,
            nonlocals: Vec::new(),
            partial: Vec::new(),
            return_type,
        }
    }

    /// Signature with no parameters and an unresolved return type.
    pub fn empty() -> Self {
        Self::new(Vec::new(), TypeInfo::Unknown)
    }

    /// Set the return type if still unresolved, or check it against `t`.
    pub fn resolve_return_type(&mut self, t: &TypeInfo) -> Result<(), ReturnTypeConflict> {
        // a partially known type such as `[?]` gets refined
        match self.return_type.unify(t) {
            Some(unified) => {
                self.return_type = unified;
                Ok(())
            }
            None => Err(ReturnTypeConflict {
                declared: self.return_type.clone(),
                found: t.clone(),
            }),
        }
    }

    /// Any parameter still a type variable?
    pub fn is_generic(&self) -> bool {
        self.params.iter().any(TypeInfo::is_generic)
    }

    pub fn has_closure(&self) -> bool {
        !self.nonlocals.is_empty() || !self.partial.is_empty()
    }

    pub fn raw_size_of_parameters(&self) -> usize {
        self.params.iter().map(TypeInfo::size).sum()
    }

    pub fn raw_size_of_nonlocals(&self) -> usize {
        self.nonlocals.iter().map(TypeInfo::size).sum()
    }

    pub fn raw_size_of_partial(&self) -> usize {
        self.partial.iter().map(TypeInfo::size).sum()
    }

    /// Bytes a closure of this function carries: nonlocals then partial arguments.
    pub fn closure_size(&self) -> usize {
        self.raw_size_of_nonlocals() + self.raw_size_of_partial()
    }

    /// Types stored in a closure, in capture order.
    pub fn closure_types(&self) -> impl Iterator<Item = &TypeInfo> {
        self.nonlocals.iter().chain(self.partial.iter())
    }

    /// Bytes below the frame base when this function runs.
    pub fn frame_prefix_size(&self) -> usize {
        self.closure_size() + self.raw_size_of_parameters()
    }
}

/// Signatures compare by parameter and return types; the closure layout is
/// not part of the type.
impl PartialEq for Signature {
    fn eq(&self, other: &Signature) -> bool {
        self.params == other.params && self.return_type == other.return_type
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn(")?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", param)?;
        }
        write!(f, ") -> {}", self.return_type)
    }
}
