use std::cell::RefCell;

pub const DEFAULT_STACK_BASE: u32 = 0x4000_0000;
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// A thread's stack in the 32-bit target address space, little endian.
pub struct StackMemory {
    base: u32,
    bytes: RefCell<Vec<u8>>,
}

impl StackMemory {
    pub fn new(base: u32, size: usize) -> Self {
        assert_eq!(base % 16, 0, "stack base must be 16-byte aligned");
        Self {
            base,
            bytes: RefCell::new(vec![0; size]),
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    /// One past the highest address; stacks grow down from here.
    pub fn end(&self) -> u32 {
        self.base + self.bytes.borrow().len() as u32
    }

    pub fn contains(&self, addr: u32, len: u32) -> bool {
        addr >= self.base && addr.checked_add(len).is_some_and(|end| end <= self.end())
    }

    fn offset(&self, addr: u32, len: u32) -> usize {
        assert!(
            self.contains(addr, len),
            "stack access 0x{addr:08x}+{len} outside 0x{:08x}..0x{:08x}",
            self.base,
            self.end()
        );
        assert_eq!(addr % len.min(4), 0, "misaligned stack access at 0x{addr:08x}");
        (addr - self.base) as usize
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

    pub fn fill(&self, addr: u32, len: u32, value: u8) {
        let offset = self.offset(addr, 1);
        assert!(self.contains(addr, len), "fill outside the stack");
        self.bytes.borrow_mut()[offset..offset + len as usize].fill(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_are_little_endian() {
        let memory = StackMemory::new(DEFAULT_STACK_BASE, 64);
        memory.write_u64(DEFAULT_STACK_BASE + 8, 0x1122_3344_5566_7788);
        assert_eq!(memory.read_u32(DEFAULT_STACK_BASE + 8), 0x5566_7788);
        assert_eq!(memory.read_u32(DEFAULT_STACK_BASE + 12), 0x1122_3344);
    }

    #[test]
    #[should_panic(expected = "outside")]
    fn out_of_range_access_is_fatal() {
        let memory = StackMemory::new(DEFAULT_STACK_BASE, 16);
        memory.read_u32(DEFAULT_STACK_BASE + 16);
    }
}
