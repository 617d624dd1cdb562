//! Runtime type representation shared by the compiler and the machine.

use std::fmt;
use std::rc::Rc;

use crate::types::signature::Signature;

/// Byte size of a heap handle on the stack (32-bit slot index + 32-bit generation).
pub const HANDLE_SIZE: usize = 8;

/// Type of a value. Every type has a fixed byte size on the stack.
#[derive(Debug, Clone)]
pub enum TypeInfo {
    /// Type variable: not yet known, matches anything
    Unknown,
    Void,
    Bool,
    Byte,
    Char,
    Int32,
    Int64,
    Float32,
    Float64,
    /// Heap-allocated UTF-8 text
    String,
    /// Heap-allocated list of elements of one type
    List(Box<TypeInfo>),
    /// Inline sequence of values
    Tuple(Vec<TypeInfo>),
    /// Heap-allocated closure
    Function(Rc<Signature>),
    Module,
}

impl TypeInfo {
    pub fn list(elem: TypeInfo) -> Self {
        TypeInfo::List(Box::new(elem))
    }

    pub fn function(signature: Signature) -> Self {
        TypeInfo::Function(Rc::new(signature))
    }

    /// Size of a value of this type on the stack, in bytes.
    pub fn size(&self) -> usize {
        match self {
            TypeInfo::Unknown | TypeInfo::Void | TypeInfo::Module => 0,
            TypeInfo::Bool | TypeInfo::Byte => 1,
            TypeInfo::Char | TypeInfo::Int32 | TypeInfo::Float32 => 4,
            TypeInfo::Int64 | TypeInfo::Float64 => 8,
            TypeInfo::String | TypeInfo::List(_) | TypeInfo::Function(_) => HANDLE_SIZE,
            TypeInfo::Tuple(items) => items.iter().map(TypeInfo::size).sum(),
        }
    }

    /// Is the value itself a heap handle?
    pub fn is_heap(&self) -> bool {
        matches!(
            self,
            TypeInfo::String | TypeInfo::List(_) | TypeInfo::Function(_)
        )
    }

    /// Call `f` with the offset of every heap handle inside a value of this type.
    pub fn foreach_heap_slot(&self, f: &mut impl FnMut(usize)) {
        self.foreach_heap_slot_at(0, f);
    }

    fn foreach_heap_slot_at(&self, base: usize, f: &mut impl FnMut(usize)) {
        match self {
            TypeInfo::Tuple(items) => {
                let mut pos = base;
                for item in items {
                    item.foreach_heap_slot_at(pos, f);
                    pos += item.size();
                }
            }
            t if t.is_heap() => f(base),
            _ => {}
        }
    }

    /// Offsets of all heap handles, in ascending order.
    pub fn heap_slots(&self) -> Vec<usize> {
        let mut slots = Vec::new();
        self.foreach_heap_slot(&mut |pos| slots.push(pos));
        slots
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, TypeInfo::Unknown)
    }

    pub fn is_void(&self) -> bool {
        matches!(self, TypeInfo::Void)
    }

    /// Does the type still contain a type variable anywhere?
    pub fn is_generic(&self) -> bool {
        match self {
            TypeInfo::Unknown => true,
            TypeInfo::List(elem) => elem.is_generic(),
            TypeInfo::Tuple(items) => items.iter().any(TypeInfo::is_generic),
            TypeInfo::Function(sig) => sig.is_generic() || sig.return_type.is_generic(),
            _ => false,
        }
    }

    /// Structural equality where `Unknown` only matches `Unknown`.
    pub fn is_identical(&self, other: &TypeInfo) -> bool {
        match (self, other) {
            (TypeInfo::List(a), TypeInfo::List(b)) => a.is_identical(b),
            (TypeInfo::Tuple(a), TypeInfo::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.is_identical(y))
            }
            (TypeInfo::Function(a), TypeInfo::Function(b)) => {
                a.params.len() == b.params.len()
                    && a.params.iter().zip(&b.params).all(|(x, y)| x.is_identical(y))
                    && a.return_type.is_identical(&b.return_type)
            }
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }

    /// Combine two compatible types, preferring the more concrete one.
    /// Returns `None` when the types don't match.
    pub fn unify(&self, other: &TypeInfo) -> Option<TypeInfo> {
        match (self, other) {
            (TypeInfo::Unknown, t) | (t, TypeInfo::Unknown) => Some(t.clone()),
            (TypeInfo::List(a), TypeInfo::List(b)) => Some(TypeInfo::list(a.unify(b)?)),
            (TypeInfo::Tuple(a), TypeInfo::Tuple(b)) if a.len() == b.len() => a
                .iter()
                .zip(b)
                .map(|(x, y)| x.unify(y))
                .collect::<Option<Vec<_>>>()
                .map(TypeInfo::Tuple),
            (a, b) if a == b => Some(if a.is_generic() { b.clone() } else { a.clone() }),
            _ => None,
        }
    }

    pub fn elem_type(&self) -> Option<&TypeInfo> {
        match self {
            TypeInfo::List(elem) => Some(elem),
            _ => None,
        }
    }

    pub fn signature(&self) -> Option<&Rc<Signature>> {
        match self {
            TypeInfo::Function(sig) => Some(sig),
            _ => None,
        }
    }

    /// Look up a builtin type by name.
    pub fn from_name(name: &str) -> Option<TypeInfo> {
        Some(match name {
            "Void" => TypeInfo::Void,
            "Bool" => TypeInfo::Bool,
            "Byte" => TypeInfo::Byte,
            "Char" => TypeInfo::Char,
            "Int32" | "Int" => TypeInfo::Int32,
            "Int64" => TypeInfo::Int64,
            "Float32" => TypeInfo::Float32,
            "Float64" | "Float" => TypeInfo::Float64,
            "String" => TypeInfo::String,
            _ => return None,
        })
    }
}

impl PartialEq for TypeInfo {
    fn eq(&self, other: &TypeInfo) -> bool {
        match (self, other) {
            (TypeInfo::Unknown, _) | (_, TypeInfo::Unknown) => true,
            (TypeInfo::List(a), TypeInfo::List(b)) => a == b,
            (TypeInfo::Tuple(a), TypeInfo::Tuple(b)) => a == b,
            (TypeInfo::Function(a), TypeInfo::Function(b)) => a == b,
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

impl fmt::Display for TypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeInfo::Unknown => write!(f, "?"),
            TypeInfo::Void => write!(f, "Void"),
            TypeInfo::Bool => write!(f, "Bool"),
            TypeInfo::Byte => write!(f, "Byte"),
            TypeInfo::Char => write!(f, "Char"),
            TypeInfo::Int32 => write!(f, "Int32"),
            TypeInfo::Int64 => write!(f, "Int64"),
            TypeInfo::Float32 => write!(f, "Float32"),
            TypeInfo::Float64 => write!(f, "Float64"),
            TypeInfo::String => write!(f, "String"),
            TypeInfo::List(elem) => write!(f, "[{}]", elem),
            TypeInfo::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
            TypeInfo::Function(sig) => write!(f, "{}", sig),
            TypeInfo::Module => write!(f, "Module"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn fn_type(params: Vec<TypeInfo>, ret: TypeInfo) -> TypeInfo {
        TypeInfo::function(Signature::new(params, ret))
    }

    #[test]
    fn test_sizes() {
        assert_eq!(TypeInfo::Unknown.size(), 0);
        assert_eq!(TypeInfo::Void.size(), 0);
        assert_eq!(TypeInfo::Bool.size(), 1);
        assert_eq!(TypeInfo::Byte.size(), 1);
        assert_eq!(TypeInfo::Char.size(), 4);
        assert_eq!(TypeInfo::Int32.size(), 4);
        assert_eq!(TypeInfo::Int64.size(), 8);
        assert_eq!(TypeInfo::Float32.size(), 4);
        assert_eq!(TypeInfo::Float64.size(), 8);
        assert_eq!(TypeInfo::String.size(), HANDLE_SIZE);
        assert_eq!(TypeInfo::list(TypeInfo::Int64).size(), HANDLE_SIZE);
        assert_eq!(fn_type(vec![], TypeInfo::Int32).size(), HANDLE_SIZE);
        assert_eq!(TypeInfo::Module.size(), 0);
        let tuple = TypeInfo::Tuple(vec![TypeInfo::Byte, TypeInfo::String, TypeInfo::Int32]);
        assert_eq!(tuple.size(), 1 + HANDLE_SIZE + 4);
    }

    #[test]
    fn test_unknown_matches_anything() {
        assert_eq!(TypeInfo::Unknown, TypeInfo::String);
        assert_eq!(TypeInfo::list(TypeInfo::Unknown), TypeInfo::list(TypeInfo::Int32));
        assert!(TypeInfo::Int32 != TypeInfo::Int64);
        assert!(TypeInfo::list(TypeInfo::Int32) != TypeInfo::list(TypeInfo::Char));
        assert!(!TypeInfo::Unknown.is_identical(&TypeInfo::Int32));
    }

    #[test]
    fn test_function_equality_uses_full_signature() {
        let a = fn_type(vec![TypeInfo::Int32], TypeInfo::Int32);
        let b = fn_type(vec![TypeInfo::Int32], TypeInfo::Int32);
        let c = fn_type(vec![TypeInfo::Int32], TypeInfo::Bool);
        let d = fn_type(vec![TypeInfo::Int32, TypeInfo::Int32], TypeInfo::Int32);
        assert_eq!(a, b);
        assert!(a != c);
        assert!(a != d);
    }

    #[test]
    fn test_heap_slots_recurse_into_tuples() {
        let t = TypeInfo::Tuple(vec![
            TypeInfo::Int32,
            TypeInfo::String,
            TypeInfo::Tuple(vec![TypeInfo::Bool, TypeInfo::list(TypeInfo::Int32)]),
        ]);
        assert_eq!(t.heap_slots(), vec![4, 4 + HANDLE_SIZE + 1]);
        assert_eq!(TypeInfo::Float64.heap_slots(), Vec::<usize>::new());
    }

    #[test]
    fn test_display() {
        let t = TypeInfo::Tuple(vec![TypeInfo::list(TypeInfo::Char), TypeInfo::Unknown]);
        assert_eq!(t.to_string(), "([Char], ?)");
        assert_eq!(
            fn_type(vec![TypeInfo::Int32, TypeInfo::String], TypeInfo::Void).to_string(),
            "fn(Int32, String) -> Void"
        );
    }

    #[test]
    fn test_unify_prefers_concrete() {
        assert!(TypeInfo::Unknown
            .unify(&TypeInfo::Int64)
            .unwrap()
            .is_identical(&TypeInfo::Int64));
        let partial = TypeInfo::Tuple(vec![TypeInfo::Unknown, TypeInfo::Bool]);
        let full = TypeInfo::Tuple(vec![TypeInfo::Int32, TypeInfo::Unknown]);
        let unified = partial.unify(&full).unwrap();
        assert!(unified.is_identical(&TypeInfo::Tuple(vec![TypeInfo::Int32, TypeInfo::Bool])));
        assert!(TypeInfo::Int32.unify(&TypeInfo::String).is_none());
    }

    #[test]
    fn test_generic_detection() {
        assert!(TypeInfo::list(TypeInfo::Unknown).is_generic());
        assert!(!TypeInfo::Tuple(vec![TypeInfo::Int32]).is_generic());
        assert!(fn_type(vec![TypeInfo::Unknown], TypeInfo::Int32).is_generic());
    }
}
