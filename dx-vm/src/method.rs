use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::compiled::{CompiledCode, VmapTable};
use crate::stack::frame_layout::FrameInfo;

/// Opaque heap reference as stored in a register or frame slot; zero is null.
pub type ObjectRef = u32;

pub const ACC_PUBLIC: u32 = 0x0001;
pub const ACC_STATIC: u32 = 0x0008;
pub const ACC_SYNCHRONIZED: u32 = 0x0020;
pub const ACC_NATIVE: u32 = 0x0100;
pub const ACC_ABSTRACT: u32 = 0x0400;

/// Identifier written into the Method* slot of a quick frame. Zero terminates a walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodId(pub u32);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodeItem {
    pub registers_size: u16,
    pub ins_size: u16,
    pub outs_size: u16,
    pub insns: Vec<u16>,
}

impl CodeItem {
    pub fn new(registers_size: u16, ins_size: u16, insns: Vec<u16>) -> Self {
        assert!(ins_size <= registers_size, "more ins than registers");
        Self {
            registers_size,
            ins_size,
            outs_size: 0,
            insns,
        }
    }

    /// Registers that are not incoming arguments.
    pub fn num_locals(&self) -> u32 {
        (self.registers_size - self.ins_size) as u32
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MethodKind {
    Regular,
    Proxy,
    /// Callee-save and trampoline frames owned by the runtime itself.
    Runtime,
}

pub struct Method {
    id: MethodId,
    class_descriptor: String,
    name: String,
    shorty: String,
    access_flags: u32,
    kind: MethodKind,
    code_item: Option<CodeItem>,
    runtime_frame: Option<FrameInfo>,
    compiled: OnceLock<Arc<CompiledCode>>,
    interpret_only: AtomicBool,
    invoke_count: AtomicU32,
}

impl Method {
    pub fn id(&self) -> MethodId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shorty(&self) -> &str {
        &self.shorty
    }

    pub fn class_descriptor(&self) -> &str {
        &self.class_descriptor
    }

    pub fn access_flags(&self) -> u32 {
        self.access_flags
    }

    /// `Lcom/example/Foo;` + `bar` → `com.example.Foo.bar`.
    pub fn pretty_name(&self) -> String {
        let class = self
            .class_descriptor
            .strip_prefix('L')
            .and_then(|rest| rest.strip_suffix(';'))
            .unwrap_or(&self.class_descriptor)
            .replace('/', ".");
        format!("{class}.{}", self.name)
    }

    pub fn is_static(&self) -> bool {
        self.access_flags & ACC_STATIC != 0
    }

    pub fn is_native(&self) -> bool {
        self.access_flags & ACC_NATIVE != 0
    }

    pub fn is_abstract(&self) -> bool {
        self.access_flags & ACC_ABSTRACT != 0
    }

    pub fn is_proxy(&self) -> bool {
        self.kind == MethodKind::Proxy
    }

    pub fn is_runtime_method(&self) -> bool {
        self.kind == MethodKind::Runtime
    }

    pub fn code_item(&self) -> Option<&CodeItem> {
        self.code_item.as_ref()
    }

    pub fn registers_size(&self) -> u16 {
        self.code_item.as_ref().map_or(0, |item| item.registers_size)
    }

    pub fn ins_size(&self) -> u16 {
        self.code_item.as_ref().map_or(0, |item| item.ins_size)
    }

    pub fn outs_size(&self) -> u16 {
        self.code_item.as_ref().map_or(0, |item| item.outs_size)
    }

    pub fn compiled(&self) -> Option<&Arc<CompiledCode>> {
        self.compiled.get()
    }

    /// Publishes compiled code; the first publication wins.
    pub fn publish_code(&self, code: Arc<CompiledCode>) -> bool {
        self.compiled.set(code).is_ok()
    }

    pub fn entry_point(&self) -> Option<u32> {
        self.compiled().map(|code| code.code_begin())
    }

    pub fn code_size(&self) -> u32 {
        self.compiled().map_or(0, |code| code.code_size())
    }

    pub fn frame_info(&self) -> Option<FrameInfo> {
        self.runtime_frame
            .or_else(|| self.compiled().map(|code| code.frame()))
    }

    pub fn vmap_table(&self) -> Option<&VmapTable> {
        self.compiled().map(|code| code.vmap())
    }

    pub fn mark_interpret_only(&self) {
        self.interpret_only.store(true, Ordering::Release);
    }

    pub fn is_interpret_only(&self) -> bool {
        self.interpret_only.load(Ordering::Acquire)
    }

    /// Bumps the invocation counter and returns the new count.
    pub fn record_invoke(&self) -> u32 {
        self.invoke_count.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("id", &self.id)
            .field("name", &self.pretty_name())
            .field("shorty", &self.shorty)
            .field("compiled", &self.compiled.get().is_some())
            .finish()
    }
}

#[derive(Debug)]
pub struct MethodBuilder {
    class_descriptor: String,
    name: String,
    shorty: String,
    access_flags: u32,
    kind: MethodKind,
    code_item: Option<CodeItem>,
    runtime_frame: Option<FrameInfo>,
}

impl MethodBuilder {
    pub fn new(class_descriptor: &str, name: &str, shorty: &str) -> Self {
        Self {
            class_descriptor: class_descriptor.to_string(),
            name: name.to_string(),
            shorty: shorty.to_string(),
            access_flags: ACC_PUBLIC,
            kind: MethodKind::Regular,
            code_item: None,
            runtime_frame: None,
        }
    }

    pub fn runtime(name: &str, frame: FrameInfo) -> Self {
        let mut builder = Self::new("L<runtime>;", name, "V");
        builder.kind = MethodKind::Runtime;
        builder.runtime_frame = Some(frame);
        builder
    }

    pub fn access_flags(mut self, flags: u32) -> Self {
        self.access_flags = flags;
        self
    }

    pub fn static_method(mut self) -> Self {
        self.access_flags |= ACC_STATIC;
        self
    }

    pub fn native(mut self, frame: FrameInfo) -> Self {
        self.access_flags |= ACC_NATIVE;
        self.runtime_frame = Some(frame);
        self
    }

    pub fn proxy(mut self, frame: FrameInfo) -> Self {
        self.kind = MethodKind::Proxy;
        self.runtime_frame = Some(frame);
        self
    }

    pub fn code(mut self, code_item: CodeItem) -> Self {
        self.code_item = Some(code_item);
        self
    }
}

/// Registry resolving the ids stored in frames back to methods.
#[derive(Default)]
pub struct MethodTable {
    methods: RwLock<Vec<Arc<Method>>>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, builder: MethodBuilder) -> Arc<Method> {
        let mut methods = self.methods.write();
        let id = MethodId(methods.len() as u32 + 1);
        let method = Arc::new(Method {
            id,
            class_descriptor: builder.class_descriptor,
            name: builder.name,
            shorty: builder.shorty,
            access_flags: builder.access_flags,
            kind: builder.kind,
            code_item: builder.code_item,
            runtime_frame: builder.runtime_frame,
            compiled: OnceLock::new(),
            interpret_only: AtomicBool::new(false),
            invoke_count: AtomicU32::new(0),
        });
        methods.push(Arc::clone(&method));
        method
    }

    pub fn get(&self, id: MethodId) -> Option<Arc<Method>> {
        if id.0 == 0 {
            return None;
        }
        self.methods.read().get(id.0 as usize - 1).cloned()
    }

    pub fn find(&self, pretty_name: &str) -> Option<Arc<Method>> {
        self.methods
            .read()
            .iter()
            .find(|method| method.pretty_name() == pretty_name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.methods.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_start_at_one_and_resolve() {
        let table = MethodTable::new();
        let first = table.register(MethodBuilder::new("Lcom/example/Foo;", "bar", "V"));
        let second = table.register(MethodBuilder::new("LFoo;", "baz", "II").static_method());
        assert_eq!(first.id(), MethodId(1));
        assert_eq!(second.id(), MethodId(2));
        assert!(table.get(MethodId(0)).is_none());
        assert_eq!(
            table.get(MethodId(1)).expect("method").pretty_name(),
            "com.example.Foo.bar"
        );
        assert!(second.is_static());
        assert_eq!(table.find("Foo.baz").expect("by name").id(), MethodId(2));
    }

    #[test]
    fn runtime_methods_carry_their_frame() {
        let table = MethodTable::new();
        let frame = FrameInfo::callee_save(1 << 14, 0);
        let method = table.register(MethodBuilder::runtime("save-all", frame));
        assert!(method.is_runtime_method());
        assert_eq!(method.frame_info(), Some(frame));
        assert_eq!(method.code_size(), 0);
    }
}
