//! Reference-counted heap for strings, lists and closures.
//!
//! Cells live in an arena and are addressed by generation-checked handles.
//! A handle is 8 bytes on the stack: the cell index then the generation,
//! both little-endian `u32`. The all-zero handle is the empty value.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::error::RuntimeError;
use crate::module::Module;
use crate::types::{TypeInfo, HANDLE_SIZE};

pub type VmResult<T> = Result<T, RuntimeError>;

/// Handle to a heap cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HeapRef {
    index: u32,
    generation: u32,
}

impl HeapRef {
    pub const NULL: HeapRef = HeapRef {
        index: 0,
        generation: 0,
    };

    pub fn is_null(self) -> bool {
        self.generation == 0
    }

    pub fn to_bytes(self) -> [u8; HANDLE_SIZE] {
        let mut bytes = [0u8; HANDLE_SIZE];
        bytes[..4].copy_from_slice(&self.index.to_le_bytes());
        bytes[4..].copy_from_slice(&self.generation.to_le_bytes());
        bytes
    }

    /// Decode a handle from the first 8 bytes of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> VmResult<HeapRef> {
        if bytes.len() < HANDLE_SIZE {
            return Err(RuntimeError::underflow(HANDLE_SIZE, bytes.len()));
        }
        let mut index = [0u8; 4];
        let mut generation = [0u8; 4];
        index.copy_from_slice(&bytes[..4]);
        generation.copy_from_slice(&bytes[4..HANDLE_SIZE]);
        Ok(HeapRef {
            index: u32::from_le_bytes(index),
            generation: u32::from_le_bytes(generation),
        })
    }

    /// The handle as one number, for diagnostics.
    pub fn raw(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }
}

impl fmt::Display for HeapRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// Function addressed by a closure. The module is not kept alive by it.
#[derive(Debug, Clone)]
pub struct FunctionRef {
    pub module: Weak<Module>,
    pub index: usize,
}

impl FunctionRef {
    pub fn new(module: &Rc<Module>, index: usize) -> Self {
        Self {
            module: Rc::downgrade(module),
            index,
        }
    }
}

/// A function together with its captured bytes.
///
/// `values` holds the partial arguments then the nonlocals, laid out exactly
/// as they sit in the callee's frame prefix. `types` lists them in the same
/// byte order.
#[derive(Debug, Clone)]
pub struct Closure {
    pub function: FunctionRef,
    pub types: Rc<[TypeInfo]>,
    pub values: Rc<[u8]>,
}

#[derive(Debug, Clone)]
pub enum HeapData {
    String(Rc<str>),
    List { elem: TypeInfo, data: Rc<[u8]> },
    Closure(Closure),
}

impl HeapData {
    /// Handles owned by this cell.
    fn nested_handles(&self, out: &mut Vec<HeapRef>) -> VmResult<()> {
        match self {
            HeapData::String(_) => Ok(()),
            HeapData::List { elem, data } => {
                let size = elem.size();
                let slots = elem.heap_slots();
                if size == 0 || slots.is_empty() {
                    return Ok(());
                }
                for item in data.chunks_exact(size) {
                    for &slot in &slots {
                        out.push(HeapRef::from_bytes(&item[slot..])?);
                    }
                }
                Ok(())
            }
            HeapData::Closure(closure) => {
                let mut pos = 0;
                for ty in closure.types.iter() {
                    for slot in ty.heap_slots() {
                        out.push(HeapRef::from_bytes(&closure.values[pos + slot..])?);
                    }
                    pos += ty.size();
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug)]
struct Cell {
    generation: u32,
    refcount: u32,
    data: Option<HeapData>,
}

/// Arena of heap cells.
#[derive(Debug, Default)]
pub struct HeapArena {
    cells: Vec<Cell>,
    free: Vec<u32>,
    live: usize,
}

impl HeapArena {
    fn cell(&self, r: HeapRef) -> VmResult<&Cell> {
        match self.cells.get(r.index as usize) {
            Some(cell) if cell.generation == r.generation && cell.data.is_some() => Ok(cell),
            _ => Err(RuntimeError::DanglingHandle(r.raw())),
        }
    }

    fn cell_mut(&mut self, r: HeapRef) -> VmResult<&mut Cell> {
        match self.cells.get_mut(r.index as usize) {
            Some(cell) if cell.generation == r.generation && cell.data.is_some() => Ok(cell),
            _ => Err(RuntimeError::DanglingHandle(r.raw())),
        }
    }

    fn alloc(&mut self, data: HeapData) -> HeapRef {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let cell = &mut self.cells[index as usize];
            cell.refcount = 1;
            cell.data = Some(data);
            return HeapRef {
                index,
                generation: cell.generation,
            };
        }
        let index = self.cells.len() as u32;
        self.cells.push(Cell {
            generation: 1,
            refcount: 1,
            data: Some(data),
        });
        HeapRef {
            index,
            generation: 1,
        }
    }

    /// Release one reference. Returns true if the cell was freed.
    fn decref(&mut self, r: HeapRef) -> VmResult<bool> {
        if r.is_null() {
            return Ok(false);
        }
        let mut pending = vec![r];
        let mut first = true;
        let mut freed = false;
        while let Some(r) = pending.pop() {
            let is_first = std::mem::replace(&mut first, false);
            if r.is_null() {
                continue;
            }
            let cell = self.cell_mut(r)?;
            cell.refcount -= 1;
            if cell.refcount > 0 {
                continue;
            }
            let data = cell.data.take();
            // a wrapping generation would revive stale handles, skip zero
            cell.generation = cell.generation.wrapping_add(1).max(1);
            self.free.push(r.index);
            self.live -= 1;
            freed |= is_first;
            if let Some(data) = data {
                data.nested_handles(&mut pending)?;
            }
        }
        Ok(freed)
    }
}

/// Shared handle to the heap arena.
#[derive(Debug, Clone, Default)]
pub struct Heap(Rc<RefCell<HeapArena>>);

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a cell with a refcount of one.
    pub fn alloc(&self, data: HeapData) -> HeapRef {
        self.0.borrow_mut().alloc(data)
    }

    pub fn alloc_string(&self, s: &str) -> HeapRef {
        self.alloc(HeapData::String(Rc::from(s)))
    }

    pub fn incref(&self, r: HeapRef) -> VmResult<()> {
        if r.is_null() {
            return Ok(());
        }
        let mut arena = self.0.borrow_mut();
        let cell = arena.cell_mut(r)?;
        cell.refcount += 1;
        Ok(())
    }

    /// Release one reference, freeing the cell and everything it owns when
    /// the count drops to zero. Returns true if `r` itself was freed.
    pub fn decref(&self, r: HeapRef) -> VmResult<bool> {
        self.0.borrow_mut().decref(r)
    }

    pub fn refcount(&self, r: HeapRef) -> VmResult<u32> {
        Ok(self.0.borrow().cell(r)?.refcount)
    }

    /// Number of live cells.
    pub fn live_count(&self) -> usize {
        self.0.borrow().live
    }

    pub fn string(&self, r: HeapRef) -> VmResult<Rc<str>> {
        if r.is_null() {
            return Ok(Rc::from(""));
        }
        match &self.0.borrow().cell(r)?.data {
            Some(HeapData::String(s)) => Ok(s.clone()),
            other => Err(unexpected("String", other)),
        }
    }

    /// Element type and raw element bytes of a list.
    pub fn list(&self, r: HeapRef) -> VmResult<(TypeInfo, Rc<[u8]>)> {
        if r.is_null() {
            return Ok((TypeInfo::Unknown, Rc::from(Vec::new())));
        }
        match &self.0.borrow().cell(r)?.data {
            Some(HeapData::List { elem, data }) => Ok((elem.clone(), data.clone())),
            other => Err(unexpected("List", other)),
        }
    }

    pub fn closure(&self, r: HeapRef) -> VmResult<Closure> {
        match &self.0.borrow().cell(r)?.data {
            Some(HeapData::Closure(closure)) => Ok(closure.clone()),
            other => Err(unexpected("Closure", other)),
        }
    }

    /// Do both handles share the same arena?
    pub fn ptr_eq(&self, other: &Heap) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

fn unexpected(expected: &str, found: &Option<HeapData>) -> RuntimeError {
    let found = match found {
        Some(HeapData::String(_)) => "String",
        Some(HeapData::List { .. }) => "List",
        Some(HeapData::Closure(_)) => "Closure",
        None => "freed cell",
    };
    RuntimeError::unexpected_value_type(expected, found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn list_of_strings(heap: &Heap, items: &[HeapRef]) -> HeapRef {
        let mut data = Vec::new();
        for item in items {
            data.extend_from_slice(&item.to_bytes());
        }
        heap.alloc(HeapData::List {
            elem: TypeInfo::String,
            data: Rc::from(data),
        })
    }

    #[test]
    fn test_handle_bytes() {
        let heap = Heap::new();
        let r = heap.alloc_string("abc");
        assert_eq!(HeapRef::from_bytes(&r.to_bytes()).unwrap(), r);
        assert!(!r.is_null());
        assert!(HeapRef::from_bytes(&[0; 8]).unwrap().is_null());
    }

    #[test]
    fn test_incref_decref_roundtrip() {
        let heap = Heap::new();
        let r = heap.alloc_string("hello");
        assert_eq!(heap.refcount(r).unwrap(), 1);
        heap.incref(r).unwrap();
        assert_eq!(heap.refcount(r).unwrap(), 2);
        assert!(!heap.decref(r).unwrap());
        assert_eq!(heap.refcount(r).unwrap(), 1);
        assert_eq!(&*heap.string(r).unwrap(), "hello");
        assert!(heap.decref(r).unwrap());
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_stale_handle_is_an_error() {
        let heap = Heap::new();
        let r = heap.alloc_string("gone");
        heap.decref(r).unwrap();
        assert!(matches!(heap.string(r), Err(RuntimeError::DanglingHandle(_))));
        assert!(matches!(heap.incref(r), Err(RuntimeError::DanglingHandle(_))));

        // the slot is reused with a new generation
        let again = heap.alloc_string("new");
        assert!(again != r);
        assert!(heap.decref(r).is_err());
        assert_eq!(&*heap.string(again).unwrap(), "new");
    }

    #[test]
    fn test_recursive_free() {
        let heap = Heap::new();
        let a = heap.alloc_string("a");
        let b = heap.alloc_string("b");
        let list = list_of_strings(&heap, &[a, b]);
        let outer = heap.alloc(HeapData::List {
            elem: TypeInfo::list(TypeInfo::String),
            data: Rc::from(list.to_bytes().to_vec()),
        });
        assert_eq!(heap.live_count(), 4);
        assert!(heap.decref(outer).unwrap());
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_shared_element_survives() {
        let heap = Heap::new();
        let a = heap.alloc_string("shared");
        heap.incref(a).unwrap();
        let list = list_of_strings(&heap, &[a]);
        heap.decref(list).unwrap();
        assert_eq!(heap.refcount(a).unwrap(), 1);
        assert_eq!(heap.live_count(), 1);
    }

    #[test]
    fn test_wrong_kind() {
        let heap = Heap::new();
        let r = heap.alloc_string("x");
        assert!(matches!(
            heap.list(r),
            Err(RuntimeError::UnexpectedValueType { .. })
        ));
    }
}
