use std::cell::{Cell, UnsafeCell};
use std::mem::{MaybeUninit, align_of, size_of};
use std::ptr::NonNull;

use tracing::info;

pub const ARENA_DEFAULT_SIZE: usize = 2 * 1024;
const ARENA_ALIGN: usize = 8;
const ARENA_BLOCK_WARN_THRESHOLD: usize = 10;

struct ArenaBlock {
    // Backed by u64 words so every allocation is 8-byte aligned.
    words: NonNull<u64>,
    capacity: usize,
    used: usize,
}

impl ArenaBlock {
    fn new(capacity: usize) -> Self {
        let storage: Box<[u64]> = vec![0u64; capacity / ARENA_ALIGN].into_boxed_slice();
        let words = NonNull::new(Box::into_raw(storage) as *mut u64)
            .unwrap_or_else(|| unreachable!("boxed slices are never null"));
        Self {
            words,
            capacity,
            used: 0,
        }
    }

    fn remaining(&self) -> usize {
        self.capacity - self.used
    }
}

impl Drop for ArenaBlock {
    fn drop(&mut self) {
        let len = self.capacity / ARENA_ALIGN;
        // SAFETY: `words` came from `Box::into_raw` of a slice with exactly `len` elements.
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.words.as_ptr(),
                len,
            )));
        }
    }
}

/// Bump allocator for compiler-lifetime data.
///
/// Allocation takes `&self` and hands out disjoint regions, so several arena-backed lists can
/// be alive at once. `reset` needs `&mut self`, which guarantees no region outlives the rewind.
pub struct Arena {
    blocks: UnsafeCell<Vec<ArenaBlock>>,
    current: Cell<usize>,
    block_allocations: Cell<usize>,
    default_size: usize,
}

// SAFETY: block storage is uniquely owned by the arena and moves with it.
unsafe impl Send for Arena {}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Arena {
    pub fn new() -> Self {
        Self::with_block_size(ARENA_DEFAULT_SIZE)
    }

    pub fn with_block_size(default_size: usize) -> Self {
        let default_size = round_up(default_size.max(ARENA_ALIGN));
        let arena = Self {
            blocks: UnsafeCell::new(Vec::new()),
            current: Cell::new(0),
            block_allocations: Cell::new(0),
            default_size,
        };
        arena.push_block(default_size);
        arena
    }

    /// Number of blocks currently chained.
    pub fn block_count(&self) -> usize {
        // SAFETY: only the length is read and no `&mut` to the vector escapes this type.
        unsafe { (*self.blocks.get()).len() }
    }

    /// Number of blocks ever obtained from the system allocator.
    pub fn block_allocations(&self) -> usize {
        self.block_allocations.get()
    }

    /// Bytes handed out since the last reset.
    pub fn bytes_in_use(&self) -> usize {
        // SAFETY: read-only access to block bookkeeping.
        unsafe { (*self.blocks.get()).iter().map(|block| block.used).sum() }
    }

    /// Allocates `size` bytes rounded up to 8. The region is zeroed when `zero` is set.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc(&self, size: usize, zero: bool) -> &mut [u8] {
        let size = round_up(size.max(1));
        let ptr = self.alloc_raw(size);
        // SAFETY: `alloc_raw` returned `size` bytes no other live region overlaps.
        let bytes = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), size) };
        if zero {
            bytes.fill(0);
        }
        bytes
    }

    /// Allocates room for `len` values of `T` without initialising them.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc_uninit<T: Copy>(&self, len: usize) -> &mut [MaybeUninit<T>] {
        assert!(align_of::<T>() <= ARENA_ALIGN, "arena values are at most 8-byte aligned");
        let size = round_up((size_of::<T>() * len).max(1));
        let ptr = self.alloc_raw(size);
        // SAFETY: the region is large enough and suitably aligned for `len` values of `T`,
        // and `MaybeUninit` has no validity requirements.
        unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr() as *mut MaybeUninit<T>, len) }
    }

    /// Allocates `len` copies of `value`.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc_slice<T: Copy>(&self, len: usize, value: T) -> &mut [T] {
        let slots = self.alloc_uninit::<T>(len);
        for slot in slots.iter_mut() {
            slot.write(value);
        }
        // SAFETY: every slot was initialised above.
        unsafe { &mut *(slots as *mut [MaybeUninit<T>] as *mut [T]) }
    }

    /// Rewinds every block without returning memory to the system.
    pub fn reset(&mut self) {
        for block in self.blocks.get_mut().iter_mut() {
            block.used = 0;
        }
        self.current.set(0);
    }

    fn alloc_raw(&self, size: usize) -> NonNull<u8> {
        loop {
            let index = self.current.get();
            // SAFETY: the vector is only mutated through this method and `push_block`; callers
            // hold pointers into block storage, never into the vector itself.
            let blocks = unsafe { &mut *self.blocks.get() };
            let block = &mut blocks[index];
            if block.remaining() >= size {
                let offset = block.used;
                block.used += size;
                // SAFETY: offset + size stays within the block's capacity.
                let ptr = unsafe { (block.words.as_ptr() as *mut u8).add(offset) };
                return NonNull::new(ptr)
                    .unwrap_or_else(|| unreachable!("block pointer is non-null"));
            }
            if index + 1 < blocks.len() {
                // Reuse a block left over from before the last reset.
                self.current.set(index + 1);
                continue;
            }
            self.push_block(size.max(self.default_size));
            self.current.set(index + 1);
        }
    }

    fn push_block(&self, capacity: usize) {
        // SAFETY: see `alloc_raw`.
        let blocks = unsafe { &mut *self.blocks.get() };
        blocks.push(ArenaBlock::new(round_up(capacity)));
        self.block_allocations.set(self.block_allocations.get() + 1);
        if blocks.len() > ARENA_BLOCK_WARN_THRESHOLD {
            info!(blocks = blocks.len(), "compiler arena keeps growing");
        }
    }
}

fn round_up(size: usize) -> usize {
    (size + ARENA_ALIGN - 1) & !(ARENA_ALIGN - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_round_up_to_eight() {
        let arena = Arena::new();
        assert_eq!(arena.alloc(3, true).len(), 8);
        assert_eq!(arena.alloc(9, false).len(), 16);
        assert_eq!(arena.bytes_in_use(), 24);
    }

    #[test]
    fn oversized_request_gets_its_own_block() {
        let arena = Arena::new();
        let big = arena.alloc(ARENA_DEFAULT_SIZE * 3, true);
        assert_eq!(big.len(), ARENA_DEFAULT_SIZE * 3);
        assert_eq!(arena.block_count(), 2);
    }

    #[test]
    fn reset_reuses_blocks_without_new_allocations() {
        let mut arena = Arena::with_block_size(64);
        for _ in 0..10 {
            arena.alloc(48, false);
        }
        let allocated = arena.block_allocations();
        assert!(allocated >= 10);

        arena.reset();
        assert_eq!(arena.bytes_in_use(), 0);
        for _ in 0..10 {
            arena.alloc(48, false);
        }
        assert_eq!(arena.block_allocations(), allocated);
    }

    #[test]
    fn regions_are_disjoint() {
        let arena = Arena::new();
        let first = arena.alloc_slice(4, 1u32);
        let second = arena.alloc_slice(4, 2u32);
        first[0] = 7;
        assert_eq!(second.to_vec(), vec![2, 2, 2, 2]);
        assert_eq!(first.to_vec(), vec![7, 1, 1, 1]);
    }

    #[test]
    fn zeroing_clears_reused_memory() {
        let mut arena = Arena::new();
        arena.alloc(16, false).fill(0xff);
        arena.reset();
        assert!(arena.alloc(16, true).iter().all(|byte| *byte == 0));
    }
}
