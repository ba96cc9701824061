use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::debug;

use crate::address_space::INSTRUMENTATION_EXIT_PC;
use crate::method::MethodId;
use crate::stack::walker::StackVisitor;
use crate::thread::Thread;

/// Return pc displaced by an exit stub.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstrumentationFrame {
    pub method: MethodId,
    pub return_pc: u32,
}

/// Method-exit interception by rewriting return addresses of compiled frames.
#[derive(Debug, Default)]
pub struct Instrumentation {
    exit_stubs_installed: AtomicBool,
    method_exits: AtomicU64,
}

impl Instrumentation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exit_stubs_installed(&self) -> bool {
        self.exit_stubs_installed.load(Ordering::Acquire)
    }

    pub fn method_exits(&self) -> u64 {
        self.method_exits.load(Ordering::Relaxed)
    }

    /// Returns the displaced pc for the innermost intercepted frame and counts the exit.
    pub fn pop_exit(&self, thread: &Thread) -> Option<InstrumentationFrame> {
        let frame = thread.instrumentation_stack().pop_front()?;
        self.method_exits.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    /// Points the return slot of every compiled frame at the exit stub.
    pub fn install_exit_stubs(&self, thread: &Thread) {
        thread.assert_walkable();
        let slots = return_slots(thread);
        let mut fresh = Vec::new();
        for (slot, method) in slots {
            let return_pc = thread.memory().read_u32(slot);
            if return_pc == INSTRUMENTATION_EXIT_PC {
                continue;
            }
            fresh.push(InstrumentationFrame { method, return_pc });
            thread.memory().write_u32(slot, INSTRUMENTATION_EXIT_PC);
        }
        debug!(frames = fresh.len(), "installed instrumentation exit stubs");
        // Newly intercepted frames are inner to any intercepted earlier.
        let mut stack = thread.instrumentation_stack();
        for frame in fresh.into_iter().rev() {
            stack.push_front(frame);
        }
        self.exit_stubs_installed.store(true, Ordering::Release);
    }

    pub fn uninstall_exit_stubs(&self, thread: &Thread) {
        thread.assert_walkable();
        let slots = return_slots(thread);
        for (slot, method) in slots {
            if thread.memory().read_u32(slot) != INSTRUMENTATION_EXIT_PC {
                continue;
            }
            let frame = thread.instrumentation_stack().pop_front();
            let Some(frame) = frame else {
                panic!("exit stub without an instrumentation frame");
            };
            assert_eq!(frame.method, method, "instrumentation stack out of order");
            thread.memory().write_u32(slot, frame.return_pc);
        }
        self.exit_stubs_installed.store(false, Ordering::Release);
    }
}

/// Return-pc slots of the compiled frames, innermost first.
fn return_slots(thread: &Thread) -> Vec<(u32, MethodId)> {
    let mut slots = Vec::new();
    let mut visitor = StackVisitor::new(thread, None, false);
    visitor.walk_stack(&mut |frame: &mut StackVisitor<'_>| {
        if let (Some(sp), Some(method)) = (frame.current_quick_frame(), frame.method()) {
            if !method.is_runtime_method() {
                if let Some(info) = method.frame_info() {
                    slots.push((sp + info.return_pc_offset(), method.id()));
                }
            }
        }
        true
    });
    slots
}
