use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::method::{Method, ObjectRef};

/// How a shadow frame tracks which of its vregs hold references.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceLayout {
    /// A second array mirrors the vregs and holds references only.
    #[default]
    Parallel,
    /// References are stored in the vreg slot itself and tagged.
    Tagged,
}

enum ReferenceStorage {
    Parallel(Vec<Cell<ObjectRef>>),
    Tagged(Vec<Cell<bool>>),
}

/// Interpreter frame holding vregs directly.
pub struct ShadowFrame {
    method: Arc<Method>,
    vregs: Vec<Cell<u32>>,
    refs: ReferenceStorage,
    dex_pc: Cell<u32>,
    link: RefCell<Option<Rc<ShadowFrame>>>,
}

impl ShadowFrame {
    pub fn new(method: Arc<Method>, number_of_vregs: usize, layout: ReferenceLayout) -> Self {
        let refs = match layout {
            ReferenceLayout::Parallel => {
                ReferenceStorage::Parallel((0..number_of_vregs).map(|_| Cell::new(0)).collect())
            }
            ReferenceLayout::Tagged => {
                ReferenceStorage::Tagged((0..number_of_vregs).map(|_| Cell::new(false)).collect())
            }
        };
        Self {
            method,
            vregs: (0..number_of_vregs).map(|_| Cell::new(0)).collect(),
            refs,
            dex_pc: Cell::new(0),
            link: RefCell::new(None),
        }
    }

    /// Frame sized for `method`'s registers.
    pub fn for_method(method: Arc<Method>, layout: ReferenceLayout) -> Self {
        let count = method.registers_size() as usize;
        Self::new(method, count, layout)
    }

    pub fn method(&self) -> &Arc<Method> {
        &self.method
    }

    pub fn number_of_vregs(&self) -> usize {
        self.vregs.len()
    }

    pub fn layout(&self) -> ReferenceLayout {
        match self.refs {
            ReferenceStorage::Parallel(_) => ReferenceLayout::Parallel,
            ReferenceStorage::Tagged(_) => ReferenceLayout::Tagged,
        }
    }

    pub fn dex_pc(&self) -> u32 {
        self.dex_pc.get()
    }

    pub fn set_dex_pc(&self, dex_pc: u32) {
        self.dex_pc.set(dex_pc);
    }

    pub fn link(&self) -> Option<Rc<ShadowFrame>> {
        self.link.borrow().clone()
    }

    pub(crate) fn set_link(&self, link: Option<Rc<ShadowFrame>>) {
        *self.link.borrow_mut() = link;
    }

    fn check(&self, index: usize) {
        assert!(
            index < self.vregs.len(),
            "vreg v{index} out of range for a frame of {} vregs",
            self.vregs.len()
        );
    }

    fn clear_reference(&self, index: usize) {
        match &self.refs {
            ReferenceStorage::Parallel(refs) => refs[index].set(0),
            ReferenceStorage::Tagged(tags) => tags[index].set(false),
        }
    }

    pub fn get_vreg(&self, index: usize) -> u32 {
        self.check(index);
        self.vregs[index].get()
    }

    pub fn set_vreg(&self, index: usize, value: u32) {
        self.check(index);
        self.vregs[index].set(value);
        self.clear_reference(index);
    }

    pub fn get_vreg_long(&self, index: usize) -> u64 {
        self.check(index + 1);
        self.vregs[index].get() as u64 | (self.vregs[index + 1].get() as u64) << 32
    }

    pub fn set_vreg_long(&self, index: usize, value: u64) {
        self.set_vreg(index, value as u32);
        self.set_vreg(index + 1, (value >> 32) as u32);
    }

    pub fn get_vreg_float(&self, index: usize) -> f32 {
        f32::from_bits(self.get_vreg(index))
    }

    pub fn set_vreg_float(&self, index: usize, value: f32) {
        self.set_vreg(index, value.to_bits());
    }

    pub fn get_vreg_double(&self, index: usize) -> f64 {
        f64::from_bits(self.get_vreg_long(index))
    }

    pub fn set_vreg_double(&self, index: usize, value: f64) {
        self.set_vreg_long(index, value.to_bits());
    }

    pub fn get_vreg_reference(&self, index: usize) -> ObjectRef {
        self.check(index);
        match &self.refs {
            ReferenceStorage::Parallel(refs) => refs[index].get(),
            ReferenceStorage::Tagged(tags) => {
                if tags[index].get() {
                    self.vregs[index].get()
                } else {
                    0
                }
            }
        }
    }

    pub fn set_vreg_reference(&self, index: usize, value: ObjectRef) {
        self.check(index);
        self.vregs[index].set(value);
        match &self.refs {
            ReferenceStorage::Parallel(refs) => refs[index].set(value),
            ReferenceStorage::Tagged(tags) => tags[index].set(true),
        }
    }

    pub fn is_reference(&self, index: usize) -> bool {
        self.check(index);
        match &self.refs {
            ReferenceStorage::Parallel(refs) => refs[index].get() != 0,
            ReferenceStorage::Tagged(tags) => tags[index].get(),
        }
    }

    /// Reports every non-null reference slot.
    pub fn visit_roots(&self, visitor: &mut dyn FnMut(usize, ObjectRef)) {
        for index in 0..self.vregs.len() {
            if self.is_reference(index) {
                let value = self.get_vreg_reference(index);
                if value != 0 {
                    visitor(index, value);
                }
            }
        }
    }
}

impl std::fmt::Debug for ShadowFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShadowFrame")
            .field("method", &self.method.pretty_name())
            .field("dex_pc", &self.dex_pc.get())
            .field("vregs", &self.vregs.iter().map(Cell::get).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::{CodeItem, MethodBuilder, MethodTable};

    fn method() -> Arc<Method> {
        MethodTable::new().register(
            MethodBuilder::new("LFoo;", "bar", "V").code(CodeItem::new(4, 0, vec![0x000e])),
        )
    }

    #[test]
    fn primitive_writes_clear_references() {
        for layout in [ReferenceLayout::Parallel, ReferenceLayout::Tagged] {
            let frame = ShadowFrame::for_method(method(), layout);
            frame.set_vreg_reference(1, 0x2000_0010);
            assert!(frame.is_reference(1));
            assert_eq!(frame.get_vreg_reference(1), 0x2000_0010);
            frame.set_vreg(1, 7);
            assert!(!frame.is_reference(1));
            assert_eq!(frame.get_vreg_reference(1), 0);
            assert_eq!(frame.get_vreg(1), 7);
        }
    }

    #[test]
    fn wide_values_span_two_slots() {
        let frame = ShadowFrame::for_method(method(), ReferenceLayout::Parallel);
        frame.set_vreg_double(2, 1.5);
        assert_eq!(frame.get_vreg_double(2), 1.5);
        frame.set_vreg_long(0, 0x1_0000_0002);
        assert_eq!(frame.get_vreg(0), 2);
        assert_eq!(frame.get_vreg(1), 1);
    }

    #[test]
    fn roots_skip_nulls() {
        let frame = ShadowFrame::for_method(method(), ReferenceLayout::Tagged);
        frame.set_vreg_reference(0, 0);
        frame.set_vreg_reference(3, 0x2000_0000);
        let mut roots = Vec::new();
        frame.visit_roots(&mut |index, value| roots.push((index, value)));
        assert_eq!(roots, vec![(3, 0x2000_0000)]);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn index_checks_are_fatal() {
        let frame = ShadowFrame::for_method(method(), ReferenceLayout::Parallel);
        frame.get_vreg(4);
    }
}
