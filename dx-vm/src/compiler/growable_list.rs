use std::fmt;
use std::mem::MaybeUninit;

use crate::compiler::arena::Arena;

const GROWTH_DOUBLING_LIMIT: usize = 128;

/// Arena-backed vector of `Copy` records. Old storage is abandoned to the arena on growth.
pub struct GrowableList<'a, T: Copy> {
    arena: &'a Arena,
    elems: &'a mut [MaybeUninit<T>],
    num_used: usize,
}

impl<'a, T: Copy> GrowableList<'a, T> {
    pub fn new(arena: &'a Arena, initial_capacity: usize) -> Self {
        Self {
            arena,
            elems: arena.alloc_uninit(initial_capacity.max(1)),
            num_used: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.num_used
    }

    pub fn is_empty(&self) -> bool {
        self.num_used == 0
    }

    pub fn capacity(&self) -> usize {
        self.elems.len()
    }

    /// Appends and returns the new element's index.
    pub fn push(&mut self, elem: T) -> usize {
        if self.num_used == self.elems.len() {
            self.expand();
        }
        self.elems[self.num_used].write(elem);
        self.num_used += 1;
        self.num_used - 1
    }

    pub fn get(&self, index: usize) -> T {
        assert!(
            index < self.num_used,
            "growable list index {index} out of range ({})",
            self.num_used
        );
        // SAFETY: slots below `num_used` are initialised.
        unsafe { self.elems[index].assume_init() }
    }

    pub fn get_mut(&mut self, index: usize) -> &mut T {
        assert!(
            index < self.num_used,
            "growable list index {index} out of range ({})",
            self.num_used
        );
        // SAFETY: slots below `num_used` are initialised.
        unsafe { self.elems[index].assume_init_mut() }
    }

    pub fn set(&mut self, index: usize, elem: T) {
        *self.get_mut(index) = elem;
    }

    pub fn last(&self) -> Option<T> {
        self.num_used.checked_sub(1).map(|index| self.get(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        (0..self.num_used).map(move |index| self.get(index))
    }

    /// Starts a restartable walk that checks the list is not grown underneath it.
    pub fn cursor(&self) -> ListCursor {
        ListCursor {
            index: 0,
            size: self.num_used,
        }
    }

    fn expand(&mut self) {
        let old = self.elems.len();
        let new_len = if old < GROWTH_DOUBLING_LIMIT {
            old << 1
        } else {
            old + GROWTH_DOUBLING_LIMIT
        };
        let grown = self.arena.alloc_uninit::<T>(new_len);
        grown[..old].copy_from_slice(self.elems);
        self.elems = grown;
    }
}

impl<T: Copy + fmt::Debug> fmt::Debug for GrowableList<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Index cursor over a [`GrowableList`]; can be reset and reused.
#[derive(Clone, Copy, Debug)]
pub struct ListCursor {
    index: usize,
    size: usize,
}

impl ListCursor {
    pub fn next<T: Copy>(&mut self, list: &GrowableList<'_, T>) -> Option<(usize, T)> {
        assert_eq!(
            self.size,
            list.len(),
            "growable list changed size during iteration"
        );
        if self.index == self.size {
            return None;
        }
        let index = self.index;
        self.index += 1;
        Some((index, list.get(index)))
    }

    pub fn restart<T: Copy>(&mut self, list: &GrowableList<'_, T>) {
        self.index = 0;
        self.size = list.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn growth_doubles_then_steps_by_128() {
        let arena = Arena::new();
        let mut list = GrowableList::new(&arena, 4);
        for value in 0..5u32 {
            list.push(value);
        }
        assert_eq!(list.capacity(), 8);
        for value in 5..129u32 {
            list.push(value);
        }
        assert_eq!(list.capacity(), 256);
        for value in 129..257u32 {
            list.push(value);
        }
        assert_eq!(list.capacity(), 384);
        assert_eq!(list.get(200), 200);
        assert_eq!(list.len(), 257);
    }

    #[test]
    fn cursor_restarts() {
        let arena = Arena::new();
        let mut list = GrowableList::new(&arena, 2);
        list.push(10u16);
        list.push(20u16);
        let mut cursor = list.cursor();
        assert_eq!(cursor.next(&list), Some((0, 10)));
        assert_eq!(cursor.next(&list), Some((1, 20)));
        assert_eq!(cursor.next(&list), None);
        cursor.restart(&list);
        assert_eq!(cursor.next(&list), Some((0, 10)));
    }

    #[test]
    #[should_panic(expected = "changed size")]
    fn cursor_detects_growth() {
        let arena = Arena::new();
        let mut list = GrowableList::new(&arena, 2);
        list.push(1u8);
        let mut cursor = list.cursor();
        list.push(2u8);
        cursor.next(&list);
    }
}
