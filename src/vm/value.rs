//! Typed view of values for the host side of the engine.
//!
//! On the stack, a value is just bytes; `Value` decodes them with the help of
//! a `TypeInfo`. Heap-backed variants carry the handle, not the content.

use std::fmt;
use std::rc::Rc;

use crate::error::RuntimeError;
use crate::types::{Signature, TypeInfo, HANDLE_SIZE};
use crate::vm::heap::{Heap, HeapRef, VmResult};

#[derive(Debug, Clone)]
pub enum Value {
    Void,
    Bool(bool),
    Byte(u8),
    Char(char),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(HeapRef),
    List { elem: TypeInfo, handle: HeapRef },
    Tuple(Vec<Value>),
    Closure { signature: Rc<Signature>, handle: HeapRef },
}

macro_rules! read_le {
    ($ty:ty, $bytes:expr) => {{
        let mut buf = [0u8; std::mem::size_of::<$ty>()];
        buf.copy_from_slice(&$bytes[..std::mem::size_of::<$ty>()]);
        <$ty>::from_le_bytes(buf)
    }};
}

impl Value {
    /// Allocate a string on `heap`. The returned value owns one reference.
    pub fn string(heap: &Heap, s: &str) -> Value {
        Value::String(heap.alloc_string(s))
    }

    /// Decode a value of type `ty` from the start of `bytes`.
    pub fn decode(ty: &TypeInfo, bytes: &[u8]) -> VmResult<Value> {
        let size = ty.size();
        if bytes.len() < size {
            return Err(RuntimeError::underflow(size, bytes.len()));
        }
        Ok(match ty {
            TypeInfo::Unknown | TypeInfo::Void | TypeInfo::Module => Value::Void,
            TypeInfo::Bool => Value::Bool(bytes[0] != 0),
            TypeInfo::Byte => Value::Byte(bytes[0]),
            TypeInfo::Char => {
                let code = read_le!(u32, bytes);
                Value::Char(char::from_u32(code).ok_or_else(|| {
                    RuntimeError::unexpected_value_type("Char", format!("{:#x}", code))
                })?)
            }
            TypeInfo::Int32 => Value::Int32(read_le!(i32, bytes)),
            TypeInfo::Int64 => Value::Int64(read_le!(i64, bytes)),
            TypeInfo::Float32 => Value::Float32(read_le!(f32, bytes)),
            TypeInfo::Float64 => Value::Float64(read_le!(f64, bytes)),
            TypeInfo::String => Value::String(HeapRef::from_bytes(bytes)?),
            TypeInfo::List(elem) => Value::List {
                elem: (**elem).clone(),
                handle: HeapRef::from_bytes(bytes)?,
            },
            TypeInfo::Tuple(items) => {
                let mut values = Vec::with_capacity(items.len());
                let mut pos = 0;
                for item in items {
                    values.push(Value::decode(item, &bytes[pos..])?);
                    pos += item.size();
                }
                Value::Tuple(values)
            }
            TypeInfo::Function(sig) => Value::Closure {
                signature: sig.clone(),
                handle: HeapRef::from_bytes(bytes)?,
            },
        })
    }

    /// Append the stack encoding of the value to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Value::Void => {}
            Value::Bool(v) => out.push(u8::from(*v)),
            Value::Byte(v) => out.push(*v),
            Value::Char(v) => out.extend_from_slice(&(*v as u32).to_le_bytes()),
            Value::Int32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Int64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Float32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Float64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::String(h) | Value::List { handle: h, .. } | Value::Closure { handle: h, .. } => {
                out.extend_from_slice(&h.to_bytes())
            }
            Value::Tuple(items) => {
                for item in items {
                    item.encode(out);
                }
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());
        self.encode(&mut out);
        out
    }

    pub fn type_info(&self) -> TypeInfo {
        match self {
            Value::Void => TypeInfo::Void,
            Value::Bool(_) => TypeInfo::Bool,
            Value::Byte(_) => TypeInfo::Byte,
            Value::Char(_) => TypeInfo::Char,
            Value::Int32(_) => TypeInfo::Int32,
            Value::Int64(_) => TypeInfo::Int64,
            Value::Float32(_) => TypeInfo::Float32,
            Value::Float64(_) => TypeInfo::Float64,
            Value::String(_) => TypeInfo::String,
            Value::List { elem, .. } => TypeInfo::list(elem.clone()),
            Value::Tuple(items) => TypeInfo::Tuple(items.iter().map(Value::type_info).collect()),
            Value::Closure { signature, .. } => TypeInfo::Function(signature.clone()),
        }
    }

    pub fn size(&self) -> usize {
        match self {
            Value::Tuple(items) => items.iter().map(Value::size).sum(),
            Value::String(_) | Value::List { .. } | Value::Closure { .. } => HANDLE_SIZE,
            other => other.type_info().size(),
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Value::Void)
    }

    fn foreach_handle(&self, f: &mut impl FnMut(HeapRef) -> VmResult<()>) -> VmResult<()> {
        match self {
            Value::String(h) | Value::List { handle: h, .. } | Value::Closure { handle: h, .. } => {
                f(*h)
            }
            Value::Tuple(items) => items.iter().try_for_each(|item| item.foreach_handle(f)),
            _ => Ok(()),
        }
    }

    pub fn incref(&self, heap: &Heap) -> VmResult<()> {
        self.foreach_handle(&mut |h| heap.incref(h))
    }

    pub fn decref(&self, heap: &Heap) -> VmResult<()> {
        self.foreach_handle(&mut |h| heap.decref(h).map(|_| ()))
    }

    pub fn as_bool(&self) -> VmResult<bool> {
        match self {
            Value::Bool(v) => Ok(*v),
            other => Err(other.mismatch("Bool")),
        }
    }

    pub fn as_int32(&self) -> VmResult<i32> {
        match self {
            Value::Int32(v) => Ok(*v),
            other => Err(other.mismatch("Int32")),
        }
    }

    pub fn as_int64(&self) -> VmResult<i64> {
        match self {
            Value::Int64(v) => Ok(*v),
            other => Err(other.mismatch("Int64")),
        }
    }

    pub fn as_float64(&self) -> VmResult<f64> {
        match self {
            Value::Float64(v) => Ok(*v),
            other => Err(other.mismatch("Float64")),
        }
    }

    /// Read the text of a string value.
    pub fn as_string(&self, heap: &Heap) -> VmResult<Rc<str>> {
        match self {
            Value::String(h) => heap.string(*h),
            other => Err(other.mismatch("String")),
        }
    }

    /// Decode the elements of a list value.
    pub fn as_list(&self, heap: &Heap) -> VmResult<Vec<Value>> {
        let Value::List { elem, handle } = self else {
            return Err(self.mismatch("List"));
        };
        let (_, data) = heap.list(*handle)?;
        let size = elem.size();
        if size == 0 {
            return Ok(Vec::new());
        }
        data.chunks_exact(size)
            .map(|item| Value::decode(elem, item))
            .collect()
    }

    pub fn as_tuple(&self) -> VmResult<&[Value]> {
        match self {
            Value::Tuple(items) => Ok(items),
            other => Err(other.mismatch("Tuple")),
        }
    }

    fn mismatch(&self, expected: &str) -> RuntimeError {
        RuntimeError::unexpected_value_type(expected, self.type_info())
    }

    /// Display the value, reading heap contents.
    pub fn display<'a>(&'a self, heap: &'a Heap) -> DisplayValue<'a> {
        DisplayValue { value: self, heap }
    }
}

/// Scalar equality; heap values compare by handle.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Void, Value::Void) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Byte(a), Value::Byte(b)) => a == b,
            (Value::Char(a), Value::Char(b)) => a == b,
            (Value::Int32(a), Value::Int32(b)) => a == b,
            (Value::Int64(a), Value::Int64(b)) => a == b,
            (Value::Float32(a), Value::Float32(b)) => a.to_bits() == b.to_bits(),
            (Value::Float64(a), Value::Float64(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List { handle: a, .. }, Value::List { handle: b, .. }) => a == b,
            (Value::Closure { handle: a, .. }, Value::Closure { handle: b, .. }) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            _ => false,
        }
    }
}

pub struct DisplayValue<'a> {
    value: &'a Value,
    heap: &'a Heap,
}

impl DisplayValue<'_> {
    fn nested<'b>(&'b self, value: &'b Value) -> DisplayValue<'b> {
        DisplayValue {
            value,
            heap: self.heap,
        }
    }
}

impl fmt::Display for DisplayValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value {
            Value::Void => write!(f, "void"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Byte(v) => write!(f, "{}b", v),
            Value::Char(v) => write!(f, "{:?}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}L", v),
            Value::Float32(v) => write!(f, "{:?}f", v),
            Value::Float64(v) => write!(f, "{:?}", v),
            Value::String(h) => match self.heap.string(*h) {
                Ok(s) => write!(f, "{:?}", &*s),
                Err(_) => write!(f, "<dangling {}>", h),
            },
            Value::List { .. } => match self.value.as_list(self.heap) {
                Ok(items) => {
                    write!(f, "[")?;
                    for (i, item) in items.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{}", self.nested(item))?;
                    }
                    write!(f, "]")
                }
                Err(_) => write!(f, "<dangling list>"),
            },
            Value::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", self.nested(item))?;
                }
                write!(f, ")")
            }
            Value::Closure { signature, handle } => write!(f, "<closure {} {}>", signature, handle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::heap::HeapData;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_scalar_encoding_is_little_endian() {
        assert_eq!(Value::Int32(0x0102_0304).to_bytes(), vec![4, 3, 2, 1]);
        assert_eq!(Value::Bool(true).to_bytes(), vec![1]);
        assert_eq!(Value::Char('A').to_bytes(), vec![65, 0, 0, 0]);
        assert_eq!(Value::Void.to_bytes(), Vec::<u8>::new());
    }

    #[test]
    fn test_decode_tuple() {
        let ty = TypeInfo::Tuple(vec![TypeInfo::Byte, TypeInfo::Int64]);
        let value = Value::Tuple(vec![Value::Byte(7), Value::Int64(-2)]);
        let bytes = value.to_bytes();
        assert_eq!(bytes.len(), 9);
        assert_eq!(Value::decode(&ty, &bytes).unwrap(), value);
    }

    #[test]
    fn test_decode_short_buffer() {
        assert!(matches!(
            Value::decode(&TypeInfo::Int64, &[1, 2, 3]),
            Err(RuntimeError::StackUnderflow { needed: 8, available: 3 })
        ));
    }

    #[test]
    fn test_accessors() {
        assert_eq!(Value::Int32(5).as_int32().unwrap(), 5);
        let err = Value::Bool(true).as_int32().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unexpected value type: expected Int32, found Bool"
        );
    }

    #[test]
    fn test_display_reads_heap() {
        let heap = Heap::new();
        let s = Value::string(&heap, "hi");
        let mut data = Vec::new();
        Value::Int32(1).encode(&mut data);
        Value::Int32(2).encode(&mut data);
        let list = Value::List {
            elem: TypeInfo::Int32,
            handle: heap.alloc(HeapData::List {
                elem: TypeInfo::Int32,
                data: Rc::from(data),
            }),
        };
        let tuple = Value::Tuple(vec![s.clone(), list, Value::Int64(3)]);
        assert_eq!(tuple.display(&heap).to_string(), "(\"hi\", [1, 2], 3L)");
        tuple.decref(&heap).unwrap();
        assert_eq!(heap.live_count(), 0);
    }
}
