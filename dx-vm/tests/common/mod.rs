#![allow(dead_code, unused_imports)]

use std::sync::Arc;

pub use vm::stack::frame_layout::FrameInfo;
pub use vm::{
    InstructionSet, JitConfig, Method, MethodBuilder, MethodId, MethodTable, Runtime, StackVisitor,
    VRegKind, Value, assemble_method, assemble_methods, create_context,
};

pub const COMPILED_ISAS: [InstructionSet; 3] =
    [InstructionSet::Thumb2, InstructionSet::X86, InstructionSet::Mips];

/// `v0 = v1 + v2`, then hands `v0` to method 1 before returning it.
pub const ADD_AND_REPORT: &str = "
.method static LT;->add(II)I
.registers 3
.ins 2
    add-int v0, v1, v2
    invoke-static {v0}, method@1
    return v0
.end method
";

pub const COUNT: &str = "
.method static LT;->count(I)I
.registers 3
.ins 1
    const/4 v0, 0
:loop
    if-ge v0, v2, :done
    add-int/lit8 v0, v0, 1
    goto :loop
:done
    return v0
.end method
";

/// Interpreter-only settings for `isa`.
pub fn quiet_config(isa: InstructionSet) -> JitConfig {
    JitConfig {
        isa,
        enabled: false,
        ..JitConfig::default()
    }
}

/// Trace JIT compiling on the calling thread as soon as a head is seen.
pub fn eager_trace_config(isa: InstructionSet) -> JitConfig {
    JitConfig {
        isa,
        enabled: true,
        hot_threshold: 1,
        queue_capacity: 0,
        ..JitConfig::default()
    }
}

/// Registers a static native `LT;->observe(I)V` first so it gets method id 1.
pub fn table_with_observer() -> (Arc<MethodTable>, Arc<Method>) {
    let methods = Arc::new(MethodTable::new());
    let observer = methods.register(
        MethodBuilder::new("LT;", "observe", "VI")
            .static_method()
            .native(FrameInfo::new(16, 0, 0)),
    );
    assert_eq!(observer.id(), MethodId(1));
    (methods, observer)
}

pub fn runtime_for(config: JitConfig, source: &str) -> (Runtime, Vec<Arc<Method>>) {
    let methods = Arc::new(MethodTable::new());
    let registered = assemble_methods(source)
        .expect("assemble")
        .into_iter()
        .map(|builder| methods.register(builder))
        .collect();
    (Runtime::new(config, methods).expect("runtime"), registered)
}
