//! Bump-allocated object heap in the simulated address space.
//!
//! Objects start with a class word and a lock word. Arrays add a length word; narrow
//! elements start at offset 12 and wide elements at offset 16.

use std::cell::{Cell, RefCell};
use std::fmt;

use crate::address_space::{DEFAULT_HEAP_SIZE, HEAP_BASE};
use crate::method::ObjectRef;

pub const CLASS_OFFSET: u32 = 0;
pub const ARRAY_LENGTH_OFFSET: u32 = 8;
pub const ARRAY_DATA_OFFSET: u32 = 12;
pub const WIDE_ARRAY_DATA_OFFSET: u32 = 16;
pub const OBJECT_FIELDS_OFFSET: u32 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComponentType {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Float,
    Long,
    Double,
    Reference,
}

impl ComponentType {
    pub fn width(self) -> u32 {
        match self {
            ComponentType::Boolean | ComponentType::Byte => 1,
            ComponentType::Char | ComponentType::Short => 2,
            ComponentType::Int | ComponentType::Float | ComponentType::Reference => 4,
            ComponentType::Long | ComponentType::Double => 8,
        }
    }

    pub fn data_offset(self) -> u32 {
        if self.width() == 8 {
            WIDE_ARRAY_DATA_OFFSET
        } else {
            ARRAY_DATA_OFFSET
        }
    }

    /// Component type of an array descriptor such as `[I`.
    pub fn from_descriptor(descriptor: &str) -> Option<Self> {
        let component = descriptor.strip_prefix('[')?;
        Some(match component.chars().next()? {
            'Z' => ComponentType::Boolean,
            'B' => ComponentType::Byte,
            'C' => ComponentType::Char,
            'S' => ComponentType::Short,
            'I' => ComponentType::Int,
            'F' => ComponentType::Float,
            'J' => ComponentType::Long,
            'D' => ComponentType::Double,
            'L' | '[' => ComponentType::Reference,
            _ => return None,
        })
    }

    /// `new-array` type pool index: 0 is `[Z`, through 8 for reference arrays.
    pub fn from_type_index(index: u32) -> Option<Self> {
        Self::from_tag(index.checked_add(1)?)
    }

    fn tag(self) -> u32 {
        self as u32 + 1
    }

    fn from_tag(tag: u32) -> Option<Self> {
        const ALL: [ComponentType; 9] = [
            ComponentType::Boolean,
            ComponentType::Byte,
            ComponentType::Char,
            ComponentType::Short,
            ComponentType::Int,
            ComponentType::Float,
            ComponentType::Long,
            ComponentType::Double,
            ComponentType::Reference,
        ];
        ALL.get(tag.checked_sub(1)? as usize).copied()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeapError {
    OutOfMemory { requested: u32 },
    NegativeArraySize(i32),
    NotAnArray(ObjectRef),
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::OutOfMemory { requested } => {
                write!(f, "heap exhausted allocating {requested} bytes")
            }
            HeapError::NegativeArraySize(length) => write!(f, "negative array size {length}"),
            HeapError::NotAnArray(obj) => write!(f, "object 0x{obj:08x} is not an array"),
        }
    }
}

impl std::error::Error for HeapError {}

/// Class words at or above this value name plain objects; below it, array components.
const OBJECT_CLASS_BASE: u32 = 0x100;

/// Class word of type index `type_index`; `const-class` materializes this value.
pub fn class_word(type_index: u32) -> u32 {
    OBJECT_CLASS_BASE + type_index
}

pub struct Heap {
    base: u32,
    bytes: RefCell<Vec<u8>>,
    top: Cell<u32>,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new(HEAP_BASE, DEFAULT_HEAP_SIZE)
    }
}

impl Heap {
    pub fn new(base: u32, size: usize) -> Self {
        Self {
            base,
            bytes: RefCell::new(vec![0; size]),
            // Address zero is null; keep the first slot unused.
            top: Cell::new(base + 16),
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn end(&self) -> u32 {
        self.base + self.bytes.borrow().len() as u32
    }

    pub fn contains(&self, addr: u32, len: u32) -> bool {
        addr >= self.base && addr.checked_add(len).is_some_and(|end| end <= self.end())
    }

    pub fn bytes_used(&self) -> u32 {
        self.top.get() - self.base
    }

    fn bump(&self, size: u32) -> Result<u32, HeapError> {
        let size = (size + 7) & !7;
        let addr = self.top.get();
        let end = addr
            .checked_add(size)
            .filter(|end| *end <= self.end())
            .ok_or(HeapError::OutOfMemory { requested: size })?;
        self.top.set(end);
        Ok(addr)
    }

    pub fn alloc_array(&self, component: ComponentType, length: i32) -> Result<ObjectRef, HeapError> {
        if length < 0 {
            return Err(HeapError::NegativeArraySize(length));
        }
        let size = component.data_offset() + component.width() * length as u32;
        let obj = self.bump(size)?;
        self.write_u32(obj + CLASS_OFFSET, component.tag());
        self.write_u32(obj + ARRAY_LENGTH_OFFSET, length as u32);
        Ok(obj)
    }

    /// Plain object with `num_fields` 32-bit instance fields.
    pub fn alloc_object(&self, class_index: u32, num_fields: u32) -> Result<ObjectRef, HeapError> {
        let obj = self.bump(OBJECT_FIELDS_OFFSET + 4 * num_fields.max(1))?;
        self.write_u32(obj + CLASS_OFFSET, class_word(class_index));
        Ok(obj)
    }

    pub fn component_type(&self, array: ObjectRef) -> Result<ComponentType, HeapError> {
        if array == 0 || !self.contains(array, ARRAY_DATA_OFFSET) {
            return Err(HeapError::NotAnArray(array));
        }
        ComponentType::from_tag(self.read_u32(array + CLASS_OFFSET)).ok_or(HeapError::NotAnArray(array))
    }

    pub fn array_length(&self, array: ObjectRef) -> u32 {
        self.read_u32(array + ARRAY_LENGTH_OFFSET)
    }

    pub fn element_address(&self, array: ObjectRef, component: ComponentType, index: u32) -> u32 {
        array + component.data_offset() + index * component.width()
    }

    fn offset(&self, addr: u32, len: u32) -> usize {
        assert!(
            self.contains(addr, len),
            "heap access 0x{addr:08x}+{len} outside 0x{:08x}..0x{:08x}",
            self.base,
            self.end()
        );
        (addr - self.base) as usize
    }

    pub fn read_u8(&self, addr: u32) -> u8 {
        let offset = self.offset(addr, 1);
        self.bytes.borrow()[offset]
    }

    pub fn write_u8(&self, addr: u32, value: u8) {
        let offset = self.offset(addr, 1);
        self.bytes.borrow_mut()[offset] = value;
    }

    pub fn read_u16(&self, addr: u32) -> u16 {
        let offset = self.offset(addr, 2);
        let bytes = self.bytes.borrow();
        u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
    }

    pub fn write_u16(&self, addr: u32, value: u16) {
        let offset = self.offset(addr, 2);
        self.bytes.borrow_mut()[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    pub fn read_u32(&self, addr: u32) -> u32 {
        let offset = self.offset(addr, 4);
        let bytes = self.bytes.borrow();
        u32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ])
    }

    pub fn write_u32(&self, addr: u32, value: u32) {
        let offset = self.offset(addr, 4);
        self.bytes.borrow_mut()[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn read_u64(&self, addr: u32) -> u64 {
        self.read_u32(addr) as u64 | (self.read_u32(addr + 4) as u64) << 32
    }

    pub fn write_u64(&self, addr: u32, value: u64) {
        self.write_u32(addr, value as u32);
        self.write_u32(addr + 4, (value >> 32) as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arrays_record_type_and_length() {
        let heap = Heap::default();
        let ints = heap.alloc_array(ComponentType::Int, 3).expect("int array");
        let longs = heap.alloc_array(ComponentType::Long, 2).expect("long array");
        assert_ne!(ints, 0);
        assert_eq!(heap.array_length(ints), 3);
        assert_eq!(heap.component_type(longs), Ok(ComponentType::Long));
        assert_eq!(heap.element_address(longs, ComponentType::Long, 1), longs + 24);
        assert_eq!(longs % 8, 0);
    }

    #[test]
    fn allocation_failures_are_errors() {
        let heap = Heap::new(HEAP_BASE, 64);
        assert_eq!(
            heap.alloc_array(ComponentType::Int, -1),
            Err(HeapError::NegativeArraySize(-1))
        );
        assert!(matches!(
            heap.alloc_array(ComponentType::Int, 100),
            Err(HeapError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn objects_are_not_arrays() {
        let heap = Heap::default();
        let obj = heap.alloc_object(3, 2).expect("object");
        assert_eq!(heap.component_type(obj), Err(HeapError::NotAnArray(obj)));
        assert_eq!(ComponentType::from_descriptor("[Ljava/lang/String;"), Some(ComponentType::Reference));
    }
}
