//! Lazy visitor over a thread's quick and shadow frames.

use std::rc::Rc;
use std::sync::Arc;

use crate::address_space::INSTRUMENTATION_EXIT_PC;
use crate::compiled::{VRegKind, VmapTable};
use crate::context::Context;
use crate::method::{Method, MethodId, ObjectRef};
use crate::stack::frame_layout::{FrameInfo, MAX_FRAME_SIZE, vreg_offset};
use crate::stack::managed_stack::FragmentTop;
use crate::stack::shadow_frame::ShadowFrame;
use crate::thread::Thread;

pub struct StackVisitor<'a> {
    thread: &'a Thread,
    context: Option<&'a mut dyn Context>,
    include_transitions: bool,
    cur_shadow_frame: Option<Rc<ShadowFrame>>,
    cur_quick_frame: Option<u32>,
    cur_quick_frame_pc: u32,
    cur_method: Option<Arc<Method>>,
    is_transition: bool,
    depth: usize,
    num_frames: Option<usize>,
}

impl<'a> StackVisitor<'a> {
    pub fn new(thread: &'a Thread, context: Option<&'a mut dyn Context>, include_transitions: bool) -> Self {
        Self {
            thread,
            context,
            include_transitions,
            cur_shadow_frame: None,
            cur_quick_frame: None,
            cur_quick_frame_pc: 0,
            cur_method: None,
            is_transition: false,
            depth: 0,
            num_frames: None,
        }
    }

    /// Visits frames innermost first until `visit` returns false.
    pub fn walk_stack(&mut self, visit: &mut dyn FnMut(&mut StackVisitor<'a>) -> bool) {
        let thread = self.thread;
        thread.assert_walkable();
        let fragments = thread.managed_stack().snapshot();
        let stubs_installed = thread.instrumentation().exit_stubs_installed();
        let memory = thread.memory();
        let mut instrumentation_index = 0;
        self.depth = 0;

        for fragment in fragments {
            match fragment {
                FragmentTop::Quick { frame, pc } => {
                    let mut sp = frame;
                    self.cur_quick_frame_pc = pc;
                    loop {
                        let method_word = memory.read_u32(sp);
                        if method_word == 0 {
                            break;
                        }
                        let method = thread.methods().get(MethodId(method_word));
                        let Some(method) = method else {
                            panic!("frame at 0x{sp:08x} names unknown method {method_word}");
                        };
                        let Some(info) = method.frame_info() else {
                            panic!("quick frame for {} without frame info", method.pretty_name());
                        };
                        sanity_check(&method, &info);
                        self.cur_quick_frame = Some(sp);
                        self.cur_method = Some(Arc::clone(&method));
                        if !visit(self) {
                            return;
                        }
                        if let Some(context) = self.context.as_deref_mut() {
                            context.fill_callee_saves(sp, &info);
                        }
                        let mut return_pc = memory.read_u32(sp + info.return_pc_offset());
                        if stubs_installed && return_pc == INSTRUMENTATION_EXIT_PC {
                            let displaced = thread.instrumentation_frame(instrumentation_index);
                            let Some(displaced) = displaced else {
                                panic!("exit stub pc with an empty instrumentation stack");
                            };
                            assert_eq!(
                                displaced.method,
                                method.id(),
                                "instrumentation frame does not match {}",
                                method.pretty_name()
                            );
                            return_pc = displaced.return_pc;
                            instrumentation_index += 1;
                        }
                        self.cur_quick_frame_pc = return_pc;
                        sp += info.frame_size;
                        self.depth += 1;
                    }
                }
                FragmentTop::Shadow(top) => {
                    let mut current = Some(top);
                    while let Some(frame) = current {
                        self.cur_method = Some(Arc::clone(frame.method()));
                        current = frame.link();
                        self.cur_shadow_frame = Some(frame);
                        if !visit(self) {
                            return;
                        }
                        self.depth += 1;
                    }
                }
                FragmentTop::Empty => {}
            }
            self.cur_method = None;
            self.cur_quick_frame = None;
            self.cur_shadow_frame = None;
            if self.include_transitions {
                self.is_transition = true;
                let keep_going = visit(self);
                self.is_transition = false;
                if !keep_going {
                    return;
                }
                self.depth += 1;
            }
        }
    }

    pub fn thread(&self) -> &'a Thread {
        self.thread
    }

    pub fn method(&self) -> Option<&Arc<Method>> {
        self.cur_method.as_ref()
    }

    pub fn is_transition_frame(&self) -> bool {
        self.is_transition
    }

    pub fn is_shadow_frame(&self) -> bool {
        self.cur_shadow_frame.is_some()
    }

    pub fn current_shadow_frame(&self) -> Option<&Rc<ShadowFrame>> {
        self.cur_shadow_frame.as_ref()
    }

    pub fn current_quick_frame(&self) -> Option<u32> {
        self.cur_quick_frame
    }

    pub fn current_quick_frame_pc(&self) -> u32 {
        self.cur_quick_frame_pc
    }

    pub fn context(&self) -> Option<&dyn Context> {
        self.context.as_deref()
    }

    pub fn dex_pc(&self) -> Option<u32> {
        if let Some(frame) = &self.cur_shadow_frame {
            return Some(frame.dex_pc());
        }
        let method = self.cur_method.as_ref()?;
        let code = method.compiled()?;
        code.dex_pc_at(self.cur_quick_frame_pc)
    }

    pub fn frame_depth(&self) -> usize {
        self.depth
    }

    pub fn num_frames(&mut self) -> usize {
        if let Some(count) = self.num_frames {
            return count;
        }
        let count = compute_num_frames(self.thread, self.include_transitions);
        self.num_frames = Some(count);
        count
    }

    /// Distance from the outermost frame.
    pub fn frame_height(&mut self) -> usize {
        self.num_frames() - self.depth - 1
    }

    pub fn frame_id(&mut self) -> usize {
        self.frame_height() + 1
    }

    fn quick_frame_parts(&self) -> (u32, &Arc<Method>, FrameInfo) {
        let (Some(sp), Some(method)) = (self.cur_quick_frame, self.cur_method.as_ref()) else {
            panic!("not visiting a quick frame");
        };
        let Some(info) = method.frame_info() else {
            panic!("quick frame without frame info");
        };
        (sp, method, info)
    }

    fn register_for(&self, method: &Method, info: &FrameInfo, vreg: u16, kind: VRegKind) -> Option<usize> {
        let vmap = method.vmap_table()?;
        let offset = vmap.is_in_context(vreg, kind)?;
        let mask = if kind.is_float() {
            info.fp_spill_mask
        } else {
            info.core_spill_mask
        };
        Some(VmapTable::compute_register(mask, offset, kind))
    }

    pub fn get_vreg(&self, vreg: u16, kind: VRegKind) -> u32 {
        if let Some(frame) = &self.cur_shadow_frame {
            return match kind {
                VRegKind::Reference => frame.get_vreg_reference(vreg as usize),
                _ => frame.get_vreg(vreg as usize),
            };
        }
        let (sp, method, info) = self.quick_frame_parts();
        if let Some(reg) = self.register_for(method, &info, vreg, kind) {
            let Some(context) = self.context.as_deref() else {
                panic!("v{vreg} of {} lives in r{reg}; walk needs a context", method.pretty_name());
            };
            let memory = self.thread.memory();
            return if kind.is_float() {
                context.get_fpr(memory, reg)
            } else {
                context.get_gpr(memory, reg)
            };
        }
        let num_locals = method.code_item().map_or(0, |item| item.num_locals());
        let offset = vreg_offset(&info, num_locals, vreg as i32);
        self.thread.memory().read_u32(sp.wrapping_add_signed(offset))
    }

    pub fn set_vreg(&mut self, vreg: u16, value: u32, kind: VRegKind) {
        if let Some(frame) = &self.cur_shadow_frame {
            match kind {
                VRegKind::Reference => frame.set_vreg_reference(vreg as usize, value),
                _ => frame.set_vreg(vreg as usize, value),
            }
            return;
        }
        let (sp, method, info) = self.quick_frame_parts();
        let method = Arc::clone(method);
        let thread = self.thread;
        if let Some(reg) = self.register_for(&method, &info, vreg, kind) {
            let Some(context) = self.context.as_deref_mut() else {
                panic!("v{vreg} of {} lives in r{reg}; walk needs a context", method.pretty_name());
            };
            if kind.is_float() {
                context.set_fpr(thread.memory(), reg, value);
            } else {
                context.set_gpr(thread.memory(), reg, value);
            }
            return;
        }
        let num_locals = method.code_item().map_or(0, |item| item.num_locals());
        let offset = vreg_offset(&info, num_locals, vreg as i32);
        thread.memory().write_u32(sp.wrapping_add_signed(offset), value);
    }

    pub fn get_gpr(&self, reg: usize) -> u32 {
        let Some(context) = self.context.as_deref() else {
            panic!("register reads need a context");
        };
        context.get_gpr(self.thread.memory(), reg)
    }

    /// Reports reference vregs of the current frame.
    pub fn visit_roots(&self, visitor: &mut dyn FnMut(u16, ObjectRef)) {
        if let Some(frame) = &self.cur_shadow_frame {
            frame.visit_roots(&mut |index, value| visitor(index as u16, value));
            return;
        }
        let Some(method) = self.cur_method.as_ref() else {
            return;
        };
        let Some(code) = method.compiled() else {
            return;
        };
        let native_offset = self.cur_quick_frame_pc.wrapping_sub(code.code_begin());
        let Some(bitmap) = code.gc_map.bitmap_at(native_offset) else {
            return;
        };
        let registers = method.registers_size();
        for vreg in 0..registers {
            let byte = bitmap.get(vreg as usize / 8).copied().unwrap_or(0);
            if byte & (1 << (vreg % 8)) == 0 {
                continue;
            }
            let value = self.get_vreg(vreg, VRegKind::Reference);
            if value != 0 {
                visitor(vreg, value);
            }
        }
    }

    pub fn describe_location(&self) -> String {
        let Some(method) = &self.cur_method else {
            return "upcall".to_string();
        };
        let mut text = format!("Visiting method '{}'", method.pretty_name());
        if let Some(dex_pc) = self.dex_pc() {
            text.push_str(&format!(" at dex PC 0x{dex_pc:04x}"));
        }
        if self.cur_quick_frame.is_some() {
            text.push_str(&format!(" (native PC 0x{:08x})", self.cur_quick_frame_pc));
        }
        text
    }
}

fn sanity_check(method: &Method, info: &FrameInfo) {
    assert!(info.frame_size != 0, "{} has a zero-sized frame", method.pretty_name());
    assert!(
        info.frame_size <= MAX_FRAME_SIZE,
        "{} frame size {} exceeds {MAX_FRAME_SIZE}",
        method.pretty_name(),
        info.frame_size
    );
    assert!(
        info.return_pc_offset() < info.frame_size,
        "{} return pc outside its frame",
        method.pretty_name()
    );
}

pub fn compute_num_frames(thread: &Thread, include_transitions: bool) -> usize {
    let mut count = 0;
    let mut visitor = StackVisitor::new(thread, None, include_transitions);
    visitor.walk_stack(&mut |_| {
        count += 1;
        true
    });
    count
}

/// One line per frame, innermost first.
pub fn describe_stack(thread: &Thread) -> String {
    let mut out = String::new();
    let mut visitor = StackVisitor::new(thread, None, true);
    visitor.walk_stack(&mut |frame| {
        out.push_str(&format!("  #{} {}\n", frame.frame_depth(), frame.describe_location()));
        true
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::InstructionSet;
    use crate::method::{MethodBuilder, MethodTable};
    use crate::stack::instrumentation::Instrumentation;
    use crate::stack::shadow_frame::ReferenceLayout;

    fn thread_with(methods: &Arc<MethodTable>) -> Thread {
        Thread::new(
            InstructionSet::Thumb2,
            Arc::clone(methods),
            Arc::new(Instrumentation::new()),
        )
    }

    /// Lays out `count` native frames of 32 bytes below the stack top and returns the innermost SP.
    fn push_quick_frames(thread: &Thread, methods: &MethodTable, count: usize) -> u32 {
        let frame = FrameInfo::new(32, 1 << 14, 0);
        let memory = thread.memory();
        let outer_end = memory.end() - 16;
        memory.write_u32(outer_end, 0);
        let mut sp = outer_end;
        for index in (0..count).rev() {
            let method = methods.register(
                MethodBuilder::new("LFrames;", &format!("m{index}"), "V").native(frame),
            );
            sp -= 32;
            memory.write_u32(sp, method.id().0);
            memory.write_u32(sp + 28, 0x6010_0000 + index as u32 * 4);
        }
        thread.managed_stack_mut().set_top_quick_frame(sp, 0x6010_0100);
        sp
    }

    #[test]
    fn counts_agree_and_walks_restart() {
        let methods = Arc::new(MethodTable::new());
        let thread = thread_with(&methods);
        push_quick_frames(&thread, &methods, 3);
        assert_eq!(compute_num_frames(&thread, false), 3);
        // One transition for the only fragment.
        assert_eq!(compute_num_frames(&thread, true), 4);

        let mut first = Vec::new();
        let mut visitor = StackVisitor::new(&thread, None, false);
        visitor.walk_stack(&mut |frame| {
            first.push(frame.method().map(|m| m.name().to_string()));
            true
        });
        let mut second = Vec::new();
        visitor.walk_stack(&mut |frame| {
            second.push(frame.method().map(|m| m.name().to_string()));
            true
        });
        assert_eq!(first, second);
        assert_eq!(first[0].as_deref(), Some("m0"));
    }

    #[test]
    fn frame_ids_count_from_the_outermost() {
        let methods = Arc::new(MethodTable::new());
        let thread = thread_with(&methods);
        push_quick_frames(&thread, &methods, 2);
        let mut ids = Vec::new();
        let mut visitor = StackVisitor::new(&thread, None, false);
        visitor.walk_stack(&mut |frame| {
            ids.push(frame.frame_id());
            true
        });
        assert_eq!(ids, vec![2, 1]);
    }

    #[test]
    fn shadow_fragments_and_transitions() {
        let methods = Arc::new(MethodTable::new());
        let thread = thread_with(&methods);
        let interpreted = methods.register(
            MethodBuilder::new("LFoo;", "interp", "V")
                .code(crate::method::CodeItem::new(2, 0, vec![0x000e])),
        );
        let shadow = Rc::new(ShadowFrame::for_method(interpreted, ReferenceLayout::Parallel));
        shadow.set_vreg(1, 99);
        thread.managed_stack_mut().push_shadow_frame(Rc::clone(&shadow));
        thread.managed_stack_mut().push_fragment();
        push_quick_frames(&thread, &methods, 1);

        assert_eq!(compute_num_frames(&thread, false), 2);
        assert_eq!(compute_num_frames(&thread, true), 4);
        let mut seen = Vec::new();
        let mut visitor = StackVisitor::new(&thread, None, true);
        visitor.walk_stack(&mut |frame| {
            if frame.is_shadow_frame() {
                seen.push(frame.get_vreg(1, VRegKind::Int));
            }
            true
        });
        assert_eq!(seen, vec![99]);
    }

    #[test]
    fn early_stop_is_honoured() {
        let methods = Arc::new(MethodTable::new());
        let thread = thread_with(&methods);
        push_quick_frames(&thread, &methods, 4);
        let mut visited = 0;
        let mut visitor = StackVisitor::new(&thread, None, false);
        visitor.walk_stack(&mut |_| {
            visited += 1;
            visited < 2
        });
        assert_eq!(visited, 2);
    }

    #[test]
    fn describe_names_each_frame() {
        let methods = Arc::new(MethodTable::new());
        let thread = thread_with(&methods);
        push_quick_frames(&thread, &methods, 1);
        let text = describe_stack(&thread);
        assert!(text.contains("Visiting method 'Frames.m0'"), "{text}");
        assert!(text.contains("upcall"), "{text}");
    }

    #[test]
    fn only_quick_frames_report_a_native_pc() {
        let methods = Arc::new(MethodTable::new());
        let thread = thread_with(&methods);
        let interpreted = methods.register(
            MethodBuilder::new("LFoo;", "interp", "V")
                .code(crate::method::CodeItem::new(2, 0, vec![0x000e])),
        );
        let shadow = Rc::new(ShadowFrame::for_method(interpreted, ReferenceLayout::Parallel));
        thread.managed_stack_mut().push_shadow_frame(shadow);
        thread.managed_stack_mut().push_fragment();
        push_quick_frames(&thread, &methods, 1);

        let text = describe_stack(&thread);
        let native = text
            .lines()
            .find(|line| line.contains("'Frames.m0'"))
            .expect("native frame");
        assert!(native.contains("(native PC 0x60100100)"), "{text}");
        assert!(!native.contains("dex PC"), "{text}");
        let interp = text
            .lines()
            .find(|line| line.contains("'Foo.interp'"))
            .expect("interpreted frame");
        assert!(interp.contains("at dex PC 0x0000"), "{text}");
        assert!(!interp.contains("native PC"), "{text}");
    }

    #[test]
    fn exit_stubs_are_transparent_to_walks() {
        let methods = Arc::new(MethodTable::new());
        let thread = thread_with(&methods);
        let sp = push_quick_frames(&thread, &methods, 2);
        let instrumentation = Arc::clone(thread.instrumentation());
        instrumentation.install_exit_stubs(&thread);
        assert_eq!(thread.memory().read_u32(sp + 28), INSTRUMENTATION_EXIT_PC);

        let mut pcs = Vec::new();
        let mut visitor = StackVisitor::new(&thread, None, false);
        visitor.walk_stack(&mut |frame| {
            pcs.push(frame.current_quick_frame_pc());
            true
        });
        assert_eq!(pcs, vec![0x6010_0100, 0x6010_0000]);

        instrumentation.uninstall_exit_stubs(&thread);
        assert_eq!(thread.memory().read_u32(sp + 28), 0x6010_0000);
        assert!(thread.instrumentation_stack().is_empty());
    }
}
