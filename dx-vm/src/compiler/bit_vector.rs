use std::fmt;

use crate::compiler::arena::Arena;

/// Arena-backed bit set stored in 32-bit words.
pub struct BitVector<'a> {
    arena: &'a Arena,
    storage: &'a mut [u32],
    expandable: bool,
}

impl<'a> BitVector<'a> {
    pub fn new(arena: &'a Arena, start_bits: usize, expandable: bool) -> Self {
        let count = words_for(start_bits.max(1));
        Self {
            arena,
            storage: arena.alloc_slice(count, 0u32),
            expandable,
        }
    }

    pub fn is_expandable(&self) -> bool {
        self.expandable
    }

    /// Capacity in bits.
    pub fn capacity(&self) -> usize {
        self.storage.len() * 32
    }

    pub fn set_bit(&mut self, num: usize) {
        if num >= self.capacity() {
            assert!(
                self.expandable,
                "bit {num} beyond non-expandable vector of {} bits",
                self.capacity()
            );
            let new_size = words_for(num + 1);
            let grown = self.arena.alloc_slice(new_size, 0u32);
            grown[..self.storage.len()].copy_from_slice(self.storage);
            self.storage = grown;
        }
        self.storage[num >> 5] |= 1 << (num & 0x1f);
    }

    pub fn clear_bit(&mut self, num: usize) {
        assert!(
            num < self.capacity(),
            "clearing bit {num} beyond storage of {} bits",
            self.capacity()
        );
        self.storage[num >> 5] &= !(1 << (num & 0x1f));
    }

    pub fn is_bit_set(&self, num: usize) -> bool {
        if num >= self.capacity() {
            return false;
        }
        self.storage[num >> 5] & (1 << (num & 0x1f)) != 0
    }

    /// Sets every bit to `value`.
    pub fn mark_all_bits(&mut self, value: bool) {
        let fill = if value { u32::MAX } else { 0 };
        self.storage.fill(fill);
    }

    pub fn clear_all(&mut self) {
        self.mark_all_bits(false);
    }

    pub fn count(&self) -> usize {
        self.storage.iter().map(|word| word.count_ones() as usize).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.storage
            .iter()
            .enumerate()
            .flat_map(|(word_index, word)| {
                let word = *word;
                (0..32).filter(move |bit| word & (1 << bit) != 0)
                    .map(move |bit| word_index * 32 + bit)
            })
    }

    /// Copies `src` into `self`; both vectors must have the same capacity.
    pub fn copy_from(&mut self, src: &BitVector<'_>) {
        assert_eq!(self.storage.len(), src.storage.len(), "bit vector size mismatch");
        self.storage.copy_from_slice(src.storage);
    }

    pub fn intersect_with(&mut self, other: &BitVector<'_>) {
        assert_eq!(self.storage.len(), other.storage.len(), "bit vector size mismatch");
        for (dst, src) in self.storage.iter_mut().zip(other.storage.iter()) {
            *dst &= *src;
        }
    }

    pub fn union_with(&mut self, other: &BitVector<'_>) {
        assert_eq!(self.storage.len(), other.storage.len(), "bit vector size mismatch");
        for (dst, src) in self.storage.iter_mut().zip(other.storage.iter()) {
            *dst |= *src;
        }
    }

    pub fn same_bits(&self, other: &BitVector<'_>) -> bool {
        self.storage == other.storage
    }

    pub fn words(&self) -> &[u32] {
        self.storage
    }
}

impl fmt::Debug for BitVector<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

fn words_for(bits: usize) -> usize {
    (bits + 31) >> 5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expansion_preserves_bits_and_zero_fills() {
        let arena = Arena::new();
        let mut bits = BitVector::new(&arena, 32, true);
        bits.set_bit(3);
        bits.set_bit(31);
        bits.set_bit(100);
        assert_eq!(bits.capacity(), 128);
        assert!(bits.is_bit_set(3));
        assert!(bits.is_bit_set(31));
        assert!(bits.is_bit_set(100));
        assert!(!bits.is_bit_set(64));
        assert_eq!(bits.count(), 3);
        assert_eq!(bits.iter().collect::<Vec<_>>(), vec![3, 31, 100]);
    }

    #[test]
    #[should_panic(expected = "non-expandable")]
    fn fixed_vector_rejects_out_of_range_set() {
        let arena = Arena::new();
        let mut bits = BitVector::new(&arena, 8, false);
        bits.set_bit(40);
    }

    #[test]
    #[should_panic(expected = "beyond storage")]
    fn clearing_beyond_storage_is_fatal() {
        let arena = Arena::new();
        let mut bits = BitVector::new(&arena, 8, true);
        bits.clear_bit(64);
    }

    #[test]
    fn mark_all_and_set_operations() {
        let arena = Arena::new();
        let mut a = BitVector::new(&arena, 64, false);
        let mut b = BitVector::new(&arena, 64, false);
        a.mark_all_bits(true);
        assert_eq!(a.count(), 64);
        b.set_bit(1);
        b.set_bit(40);
        a.intersect_with(&b);
        assert!(a.same_bits(&b));
        a.clear_all();
        a.union_with(&b);
        a.clear_bit(1);
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![40]);
    }
}
