//! The machine stack: one byte buffer growing upward, plus call frames.

use std::fmt;
use std::rc::Rc;

use crate::error::RuntimeError;
use crate::module::{Function, Module};
use crate::types::{TypeInfo, HANDLE_SIZE};
use crate::vm::heap::{Heap, HeapRef, VmResult};
use crate::vm::value::Value;

/// Default stack limit in bytes.
pub const DEFAULT_MAX_STACK_SIZE: usize = 1024 * 1024;

/// A saved caller context. A frame without a caller is a sentinel: returning
/// into it ends the current `Machine::call`.
#[derive(Debug, Clone)]
pub struct Frame {
    pub caller: Option<(Rc<Module>, Rc<Function>)>,
    pub return_cursor: usize,
    pub base: usize,
}

impl Frame {
    pub fn sentinel(base: usize) -> Self {
        Self {
            caller: None,
            return_cursor: 0,
            base,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.caller.is_none()
    }
}

macro_rules! push_pull {
    ($push:ident, $pull:ident, $ty:ty) => {
        pub fn $push(&mut self, v: $ty) -> VmResult<()> {
            self.push_bytes(&v.to_le_bytes())
        }

        pub fn $pull(&mut self) -> VmResult<$ty> {
            const N: usize = std::mem::size_of::<$ty>();
            let start = self.take(N)?;
            let mut buf = [0u8; N];
            buf.copy_from_slice(&self.data[start..]);
            self.data.truncate(start);
            Ok(<$ty>::from_le_bytes(buf))
        }
    };
}

pub struct Stack {
    data: Vec<u8>,
    frames: Vec<Frame>,
    heap: Heap,
    max_size: usize,
}

impl Stack {
    pub fn new(heap: Heap) -> Self {
        Self::with_limit(heap, DEFAULT_MAX_STACK_SIZE)
    }

    pub fn with_limit(heap: Heap, max_size: usize) -> Self {
        Self {
            data: Vec::new(),
            frames: Vec::new(),
            heap,
            max_size,
        }
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Drop all data and frames, e.g. after a runtime error.
    pub fn clear(&mut self) {
        self.data.clear();
        self.frames.clear();
    }

    // ===== Frames =====

    pub fn push_frame(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub fn pop_frame(&mut self) -> VmResult<Frame> {
        self.frames
            .pop()
            .ok_or_else(|| RuntimeError::native("return without a call frame"))
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    // ===== Raw bytes =====

    /// Check that `n` bytes are available and return where they start.
    fn take(&self, n: usize) -> VmResult<usize> {
        self.data
            .len()
            .checked_sub(n)
            .ok_or_else(|| RuntimeError::underflow(n, self.data.len()))
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) -> VmResult<()> {
        if self.data.len() + bytes.len() > self.max_size {
            return Err(RuntimeError::StackOverflow {
                limit: self.max_size,
            });
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    pub fn pull_bytes(&mut self, n: usize) -> VmResult<Vec<u8>> {
        let start = self.take(n)?;
        Ok(self.data.split_off(start))
    }

    /// The top `n` bytes.
    pub fn top(&self, n: usize) -> VmResult<&[u8]> {
        let start = self.take(n)?;
        Ok(&self.data[start..])
    }

    /// Push a copy of the `size` bytes starting at absolute position `from`.
    pub fn copy(&mut self, from: usize, size: usize) -> VmResult<()> {
        let end = from + size;
        if end > self.data.len() {
            return Err(RuntimeError::underflow(end, self.data.len()));
        }
        if self.data.len() + size > self.max_size {
            return Err(RuntimeError::StackOverflow {
                limit: self.max_size,
            });
        }
        self.data.extend_from_within(from..end);
        Ok(())
    }

    /// Remove `size` bytes lying under the top `skip` bytes.
    pub fn drop(&mut self, skip: usize, size: usize) -> VmResult<()> {
        let end = self.take(skip)?;
        let start = end
            .checked_sub(size)
            .ok_or_else(|| RuntimeError::underflow(skip + size, self.data.len()))?;
        self.data.drain(start..end);
        Ok(())
    }

    // ===== Scalars =====

    push_pull!(push_u8, pull_u8, u8);
    push_pull!(push_i8, pull_i8, i8);
    push_pull!(push_u32, pull_u32, u32);
    push_pull!(push_i32, pull_i32, i32);
    push_pull!(push_i64, pull_i64, i64);
    push_pull!(push_f32, pull_f32, f32);
    push_pull!(push_f64, pull_f64, f64);

    pub fn push_bool(&mut self, v: bool) -> VmResult<()> {
        self.push_u8(u8::from(v))
    }

    pub fn pull_bool(&mut self) -> VmResult<bool> {
        Ok(self.pull_u8()? != 0)
    }

    // ===== Heap handles =====

    pub fn push_handle(&mut self, r: HeapRef) -> VmResult<()> {
        self.push_bytes(&r.to_bytes())
    }

    pub fn pull_handle(&mut self) -> VmResult<HeapRef> {
        let start = self.take(HANDLE_SIZE)?;
        let r = HeapRef::from_bytes(&self.data[start..])?;
        self.data.truncate(start);
        Ok(r)
    }

    /// Handle stored `offset` bytes below the top: bytes `[len-offset-8, len-offset)`.
    pub fn handle_at(&self, offset: usize) -> VmResult<HeapRef> {
        let start = self.take(offset + HANDLE_SIZE)?;
        HeapRef::from_bytes(&self.data[start..])
    }

    pub fn clear_handle_at(&mut self, offset: usize) -> VmResult<()> {
        let start = self.take(offset + HANDLE_SIZE)?;
        self.data[start..start + HANDLE_SIZE].fill(0);
        Ok(())
    }

    /// Take one more reference to every handle in the value on top.
    pub fn incref_top(&mut self, ty: &TypeInfo) -> VmResult<()> {
        let start = self.take(ty.size())?;
        for slot in ty.heap_slots() {
            let r = HeapRef::from_bytes(&self.data[start + slot..])?;
            self.heap.incref(r)?;
        }
        Ok(())
    }

    // ===== Values =====

    pub fn push_value(&mut self, value: &Value) -> VmResult<()> {
        self.push_bytes(&value.to_bytes())
    }

    /// Pull a value of type `ty`. Ownership of its heap references moves to the caller.
    pub fn pull_value(&mut self, ty: &TypeInfo) -> VmResult<Value> {
        let start = self.take(ty.size())?;
        let value = Value::decode(ty, &self.data[start..])?;
        self.data.truncate(start);
        Ok(value)
    }

    /// Pull a string and release it, returning its text.
    pub fn pull_string(&mut self) -> VmResult<std::rc::Rc<str>> {
        let r = self.pull_handle()?;
        let s = self.heap.string(r)?;
        self.heap.decref(r)?;
        Ok(s)
    }

    pub fn push_string(&mut self, s: &str) -> VmResult<()> {
        let r = self.heap.alloc_string(s);
        self.push_handle(r)
    }
}

impl fmt::Display for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "stack: {} bytes, {} frames", self.data.len(), self.frames.len())?;
        for (i, chunk) in self.data.chunks(16).enumerate() {
            write!(f, "{:04x} ", i * 16)?;
            for byte in chunk {
                write!(f, " {:02x}", byte)?;
            }
            writeln!(f)?;
        }
        for frame in &self.frames {
            match &frame.caller {
                Some((module, function)) => writeln!(
                    f,
                    "  frame base={} return to {}::{} @{}",
                    frame.base,
                    module.name(),
                    function.name,
                    frame.return_cursor
                )?,
                None => writeln!(f, "  sentinel base={}", frame.base)?,
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
    fn test_push_pull_scalars() {
        let mut stack = Stack::new(Heap::new());
        stack.push_i32(-5).unwrap();
        stack.push_i64(1 << 40).unwrap();
        stack.push_bool(true).unwrap();
        assert_eq!(stack.size(), 13);
        assert!(stack.pull_bool().unwrap());
        assert_eq!(stack.pull_i64().unwrap(), 1 << 40);
        assert_eq!(stack.pull_i32().unwrap(), -5);
        assert!(stack.is_empty());
        assert!(matches!(
            stack.pull_i32(),
            Err(RuntimeError::StackUnderflow { needed: 4, available: 0 })
        ));
    }

    #[test]
    fn test_copy_and_drop() {
        let mut stack = Stack::new(Heap::new());
        stack.push_bytes(&[1, 2, 3, 4, 5]).unwrap();
        stack.copy(1, 2).unwrap();
        assert_eq!(stack.data(), &[1, 2, 3, 4, 5, 2, 3]);
        // remove [3, 4, 5] under the top two bytes
        stack.drop(2, 3).unwrap();
        assert_eq!(stack.data(), &[1, 2, 2, 3]);
        stack.drop(0, 1).unwrap();
        assert_eq!(stack.data(), &[1, 2, 2]);
        assert!(stack.drop(2, 5).is_err());
    }

    #[test]
    fn test_overflow() {
        let mut stack = Stack::with_limit(Heap::new(), 6);
        stack.push_i32(1).unwrap();
        assert!(matches!(
            stack.push_i32(2),
            Err(RuntimeError::StackOverflow { limit: 6 })
        ));
        assert!(stack.copy(0, 4).is_err());
    }

    #[test]
    fn test_handles_and_values() {
        let heap = Heap::new();
        let mut stack = Stack::new(heap.clone());
        stack.push_string("abc").unwrap();
        stack.push_i32(9).unwrap();
        let r = stack.handle_at(4).unwrap();
        assert_eq!(&*heap.string(r).unwrap(), "abc");

        let ty = TypeInfo::Tuple(vec![TypeInfo::String, TypeInfo::Int32]);
        stack.incref_top(&ty).unwrap();
        assert_eq!(heap.refcount(r).unwrap(), 2);

        let value = stack.pull_value(&ty).unwrap();
        assert_eq!(value.as_tuple().unwrap()[1], Value::Int32(9));
        value.decref(&heap).unwrap();
        value.decref(&heap).unwrap();
        assert_eq!(heap.live_count(), 0);
    }
}
