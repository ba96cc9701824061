use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::ThreadId;

use crate::heap::Heap;
use crate::isa::InstructionSet;
use crate::method::{MethodTable, ObjectRef};
use crate::stack::instrumentation::{Instrumentation, InstrumentationFrame};
use crate::stack::managed_stack::ManagedStack;
use crate::stack::memory::{DEFAULT_STACK_BASE, DEFAULT_STACK_SIZE, StackMemory};

static NEXT_SELF_WORD: AtomicU32 = AtomicU32::new(0x7000_0010);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    Runnable,
    Native,
    Suspended,
    Terminated,
}

/// A managed thread: its stack memory, fragments, and the state walkers rely on.
pub struct Thread {
    owner: ThreadId,
    self_word: u32,
    isa: InstructionSet,
    memory: StackMemory,
    heap: Heap,
    managed_stack: RefCell<ManagedStack>,
    instrumentation_stack: RefCell<VecDeque<InstrumentationFrame>>,
    methods: Arc<MethodTable>,
    instrumentation: Arc<Instrumentation>,
    suspend_count: Cell<u32>,
    state: Cell<ThreadState>,
    pending_exception: Cell<ObjectRef>,
    stack_cursor: Cell<u32>,
    result: Cell<u64>,
}

impl Thread {
    pub fn new(isa: InstructionSet, methods: Arc<MethodTable>, instrumentation: Arc<Instrumentation>) -> Self {
        let memory = StackMemory::new(DEFAULT_STACK_BASE, DEFAULT_STACK_SIZE);
        let top = memory.end();
        Self {
            owner: std::thread::current().id(),
            self_word: NEXT_SELF_WORD.fetch_add(0x10, Ordering::Relaxed),
            isa,
            memory,
            heap: Heap::default(),
            managed_stack: RefCell::new(ManagedStack::new()),
            instrumentation_stack: RefCell::new(VecDeque::new()),
            methods,
            instrumentation,
            suspend_count: Cell::new(0),
            state: Cell::new(ThreadState::Runnable),
            pending_exception: Cell::new(0),
            stack_cursor: Cell::new(top),
            result: Cell::new(0),
        }
    }

    pub fn isa(&self) -> InstructionSet {
        self.isa
    }

    /// Value the thread register must hold while this thread runs compiled code.
    pub fn self_word(&self) -> u32 {
        self.self_word
    }

    pub fn memory(&self) -> &StackMemory {
        &self.memory
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn methods(&self) -> &Arc<MethodTable> {
        &self.methods
    }

    pub fn instrumentation(&self) -> &Arc<Instrumentation> {
        &self.instrumentation
    }

    pub fn managed_stack(&self) -> Ref<'_, ManagedStack> {
        self.managed_stack.borrow()
    }

    pub fn managed_stack_mut(&self) -> RefMut<'_, ManagedStack> {
        self.managed_stack.borrow_mut()
    }

    pub fn instrumentation_stack(&self) -> RefMut<'_, VecDeque<InstrumentationFrame>> {
        self.instrumentation_stack.borrow_mut()
    }

    pub fn instrumentation_frame(&self, index: usize) -> Option<InstrumentationFrame> {
        self.instrumentation_stack.borrow().get(index).copied()
    }

    pub fn is_current(&self) -> bool {
        std::thread::current().id() == self.owner
    }

    pub fn state(&self) -> ThreadState {
        self.state.get()
    }

    pub fn set_state(&self, state: ThreadState) -> ThreadState {
        self.state.replace(state)
    }

    pub fn suspend_count(&self) -> u32 {
        self.suspend_count.get()
    }

    /// Suspends the thread until the guard drops so another party may walk its stack.
    pub fn suspend_for_stack_walk(&self) -> SuspendGuard<'_> {
        let count = self.suspend_count.get() + 1;
        self.suspend_count.set(count);
        let previous = if count == 1 {
            self.state.replace(ThreadState::Suspended)
        } else {
            self.state.get()
        };
        SuspendGuard {
            thread: self,
            previous,
        }
    }

    fn resume(&self, previous: ThreadState) {
        let count = self.suspend_count.get();
        assert!(count > 0, "resume without a matching suspend");
        self.suspend_count.set(count - 1);
        if count == 1 {
            self.state.set(previous);
        }
    }

    /// Walks are only legal on the running thread or a suspended one.
    pub fn assert_walkable(&self) {
        assert!(
            self.is_current() || self.suspend_count.get() > 0,
            "stack walk of a running thread"
        );
    }

    pub fn pending_exception(&self) -> Option<ObjectRef> {
        match self.pending_exception.get() {
            0 => None,
            exception => Some(exception),
        }
    }

    pub fn set_pending_exception(&self, exception: ObjectRef) {
        self.pending_exception.set(exception);
    }

    pub fn clear_pending_exception(&self) -> Option<ObjectRef> {
        match self.pending_exception.replace(0) {
            0 => None,
            exception => Some(exception),
        }
    }

    /// Raw bits of the last invoke result, read back by `move-result*`.
    pub fn result_register(&self) -> u64 {
        self.result.get()
    }

    pub fn set_result_register(&self, bits: u64) {
        self.result.set(bits);
    }

    /// Lowest address in use; new quick frames go below it.
    pub fn stack_cursor(&self) -> u32 {
        self.stack_cursor.get()
    }

    pub fn set_stack_cursor(&self, sp: u32) {
        assert!(
            sp >= self.memory.base() && sp <= self.memory.end(),
            "stack cursor 0x{sp:08x} outside the thread's stack"
        );
        self.stack_cursor.set(sp);
    }

    pub fn read_u32(&self, addr: u32) -> u32 {
        if self.heap.contains(addr, 4) {
            self.heap.read_u32(addr)
        } else {
            self.memory.read_u32(addr)
        }
    }

    pub fn write_u32(&self, addr: u32, value: u32) {
        if self.heap.contains(addr, 4) {
            self.heap.write_u32(addr, value);
        } else {
            self.memory.write_u32(addr, value);
        }
    }
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("self_word", &format_args!("0x{:08x}", self.self_word))
            .field("isa", &self.isa)
            .field("state", &self.state.get())
            .field("suspend_count", &self.suspend_count.get())
            .finish()
    }
}

pub struct SuspendGuard<'a> {
    thread: &'a Thread,
    previous: ThreadState,
}

impl SuspendGuard<'_> {
    pub fn thread(&self) -> &Thread {
        self.thread
    }
}

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        self.thread.resume(self.previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread() -> Thread {
        Thread::new(
            InstructionSet::Thumb2,
            Arc::new(MethodTable::new()),
            Arc::new(Instrumentation::new()),
        )
    }

    #[test]
    fn suspension_nests_and_restores_state() {
        let thread = thread();
        {
            let _outer = thread.suspend_for_stack_walk();
            {
                let _inner = thread.suspend_for_stack_walk();
                assert_eq!(thread.suspend_count(), 2);
            }
            assert_eq!(thread.state(), ThreadState::Suspended);
        }
        assert_eq!(thread.suspend_count(), 0);
        assert_eq!(thread.state(), ThreadState::Runnable);
    }

    #[test]
    fn memory_routes_to_heap_or_stack() {
        let thread = thread();
        let obj = thread.heap().alloc_object(0, 1).expect("object");
        thread.write_u32(obj + 8, 41);
        thread.write_u32(DEFAULT_STACK_BASE + 4, 42);
        assert_eq!(thread.heap().read_u32(obj + 8), 41);
        assert_eq!(thread.memory().read_u32(DEFAULT_STACK_BASE + 4), 42);
    }

    #[test]
    fn self_words_are_unique() {
        assert_ne!(thread().self_word(), thread().self_word());
    }
}
