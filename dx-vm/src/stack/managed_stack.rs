use std::rc::Rc;

use super::shadow_frame::ShadowFrame;

/// Top of one managed-stack fragment: a shadow-frame chain or a quick frame, never both.
#[derive(Clone, Debug)]
pub enum FragmentTop {
    Empty,
    Shadow(Rc<ShadowFrame>),
    Quick { frame: u32, pc: u32 },
}

/// Fragments of a thread's stack; the most recent is last.
#[derive(Debug)]
pub struct ManagedStack {
    fragments: Vec<FragmentTop>,
}

impl Default for ManagedStack {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagedStack {
    pub fn new() -> Self {
        Self {
            fragments: vec![FragmentTop::Empty],
        }
    }

    pub fn push_fragment(&mut self) {
        self.fragments.push(FragmentTop::Empty);
    }

    pub fn pop_fragment(&mut self) -> FragmentTop {
        assert!(self.fragments.len() > 1, "cannot pop the base fragment");
        self.fragments.pop().unwrap_or(FragmentTop::Empty)
    }

    fn top_mut(&mut self) -> &mut FragmentTop {
        if self.fragments.is_empty() {
            self.fragments.push(FragmentTop::Empty);
        }
        let last = self.fragments.len() - 1;
        &mut self.fragments[last]
    }

    pub fn top(&self) -> &FragmentTop {
        self.fragments.last().unwrap_or(&FragmentTop::Empty)
    }

    pub fn push_shadow_frame(&mut self, frame: Rc<ShadowFrame>) {
        let top = self.top_mut();
        let link = match top {
            FragmentTop::Empty => None,
            FragmentTop::Shadow(current) => Some(Rc::clone(current)),
            FragmentTop::Quick { .. } => {
                panic!("fragment already holds a quick frame; push a fragment first")
            }
        };
        frame.set_link(link);
        *top = FragmentTop::Shadow(frame);
    }

    pub fn pop_shadow_frame(&mut self) -> Rc<ShadowFrame> {
        let top = self.top_mut();
        let FragmentTop::Shadow(current) = top else {
            panic!("no shadow frame to pop");
        };
        let popped = Rc::clone(current);
        *top = match popped.link() {
            Some(link) => FragmentTop::Shadow(link),
            None => FragmentTop::Empty,
        };
        popped.set_link(None);
        popped
    }

    pub fn top_shadow_frame(&self) -> Option<Rc<ShadowFrame>> {
        match self.top() {
            FragmentTop::Shadow(frame) => Some(Rc::clone(frame)),
            _ => None,
        }
    }

    pub fn set_top_quick_frame(&mut self, frame: u32, pc: u32) {
        let top = self.top_mut();
        assert!(
            !matches!(top, FragmentTop::Shadow(_)),
            "fragment already holds shadow frames; push a fragment first"
        );
        *top = FragmentTop::Quick { frame, pc };
    }

    pub fn clear_top_quick_frame(&mut self) {
        let top = self.top_mut();
        if matches!(top, FragmentTop::Quick { .. }) {
            *top = FragmentTop::Empty;
        }
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    /// Copy of the fragment tops, most recent first.
    pub fn snapshot(&self) -> Vec<FragmentTop> {
        self.fragments.iter().rev().cloned().collect()
    }

    pub fn num_shadow_frames(&self) -> usize {
        self.fragments
            .iter()
            .map(|fragment| match fragment {
                FragmentTop::Shadow(frame) => {
                    let mut count = 1;
                    let mut link = frame.link();
                    while let Some(next) = link {
                        count += 1;
                        link = next.link();
                    }
                    count
                }
                _ => 0,
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::{CodeItem, MethodBuilder, MethodTable};
    use crate::stack::shadow_frame::ReferenceLayout;

    fn frame() -> Rc<ShadowFrame> {
        let method = MethodTable::new().register(
            MethodBuilder::new("LFoo;", "bar", "V").code(CodeItem::new(1, 0, vec![0x000e])),
        );
        Rc::new(ShadowFrame::for_method(method, ReferenceLayout::Parallel))
    }

    #[test]
    fn shadow_frames_link_within_a_fragment() {
        let mut stack = ManagedStack::new();
        let outer = frame();
        let inner = frame();
        stack.push_shadow_frame(Rc::clone(&outer));
        stack.push_shadow_frame(Rc::clone(&inner));
        assert_eq!(stack.num_shadow_frames(), 2);
        assert!(Rc::ptr_eq(&inner.link().expect("linked"), &outer));
        let popped = stack.pop_shadow_frame();
        assert!(Rc::ptr_eq(&popped, &inner));
        assert!(popped.link().is_none());
        assert_eq!(stack.num_shadow_frames(), 1);
    }

    #[test]
    #[should_panic(expected = "shadow frames")]
    fn fragments_never_mix_frame_kinds() {
        let mut stack = ManagedStack::new();
        stack.push_shadow_frame(frame());
        stack.set_top_quick_frame(0x4000_0000, 0);
    }

    #[test]
    fn snapshot_is_most_recent_first() {
        let mut stack = ManagedStack::new();
        stack.push_shadow_frame(frame());
        stack.push_fragment();
        stack.set_top_quick_frame(0x4000_0100, 0x6010_0000);
        let snapshot = stack.snapshot();
        assert!(matches!(snapshot[0], FragmentTop::Quick { frame: 0x4000_0100, .. }));
        assert!(matches!(snapshot[1], FragmentTop::Shadow(_)));
    }
}
