pub mod address_space;
pub mod arith;
pub mod assembler;
pub mod bytecode;
pub mod check_jni;
pub mod compiled;
pub mod compiler;
pub mod context;
pub mod decoder;
pub mod heap;
pub mod isa;
pub mod method;
#[cfg(feature = "runtime")]
pub mod runtime;
pub mod stack;
pub mod thread;

pub use assembler::{AsmError, assemble_method, assemble_methods};
pub use bytecode::Opcode;
pub use check_jni::{CheckJni, JniError, JniValue};
pub use compiled::{CompiledCode, VRegKind};
pub use compiler::code_cache::{CodeCache, JitTable};
pub use compiler::driver::{CompileStats, CompilerDriver, CompilerOptions, UnitKind};
pub use compiler::worker::{CompileOutcome, CompileRequest, CompilerWorker};
pub use compiler::{CompileAbort, CompileResult};
pub use context::{Context, LongJumpImage, Trampoline, create_context};
pub use decoder::{DecodeError, DecodedInstruction, decode};
pub use isa::InstructionSet;
pub use method::{Method, MethodBuilder, MethodId, MethodTable, ObjectRef};
#[cfg(feature = "runtime")]
pub use runtime::interpreter::{InterpError, InterpResult};
#[cfg(feature = "runtime")]
pub use runtime::jit::{JitConfig, JitSnapshot, TraceJitEngine};
#[cfg(feature = "runtime")]
pub use runtime::{Runtime, Value};
pub use stack::{StackVisitor, compute_num_frames, describe_stack};
pub use thread::Thread;
