//! Execution: the interpreter, the machine-code simulator and the trace JIT that feeds it.

pub mod interpreter;
pub mod jit;
pub mod simulator;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::compiled::CompiledCode;
use crate::compiler::CompileResult;
use crate::compiler::code_cache::{CodeCache, JitTable};
use crate::method::{Method, MethodBuilder, MethodId, MethodTable, ObjectRef};
use crate::stack::frame_layout::FrameInfo;
use crate::stack::instrumentation::Instrumentation;
use crate::thread::{Thread, ThreadState};

use self::interpreter::{InterpError, InterpResult};
use self::jit::{JitConfig, JitSnapshot, TraceJitEngine};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    Void,
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Object(ObjectRef),
}

impl Value {
    /// Decodes raw bits by shorty character.
    pub fn from_bits(kind: char, bits: u64) -> Self {
        match kind {
            'V' => Value::Void,
            'J' => Value::Long(bits as i64),
            'F' => Value::Float(f32::from_bits(bits as u32)),
            'D' => Value::Double(f64::from_bits(bits)),
            'L' | '[' => Value::Object(bits as u32),
            _ => Value::Int(bits as u32 as i32),
        }
    }

    pub fn to_bits(self) -> u64 {
        match self {
            Value::Void => 0,
            Value::Int(value) => value as u32 as u64,
            Value::Long(value) => value as u64,
            Value::Float(value) => value.to_bits() as u64,
            Value::Double(value) => value.to_bits(),
            Value::Object(obj) => obj as u64,
        }
    }

    /// Number of 32-bit vreg slots the value occupies.
    pub fn words(self) -> usize {
        match self {
            Value::Void => 0,
            Value::Long(_) | Value::Double(_) => 2,
            _ => 1,
        }
    }

    pub fn as_int(self) -> Option<i32> {
        match self {
            Value::Int(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Void => write!(f, "void"),
            Value::Int(value) => write!(f, "{value}"),
            Value::Long(value) => write!(f, "{value}L"),
            Value::Float(value) => write!(f, "{value}f"),
            Value::Double(value) => write!(f, "{value}d"),
            Value::Object(0) => write!(f, "null"),
            Value::Object(obj) => write!(f, "@0x{obj:08x}"),
        }
    }
}

/// Shorty characters of the arguments, `this` first for instance methods.
pub(crate) fn parameter_kinds(method: &Method) -> Vec<char> {
    let mut kinds = Vec::new();
    if !method.is_static() {
        kinds.push('L');
    }
    kinds.extend(method.shorty().chars().skip(1));
    kinds
}

pub type NativeFn = Arc<dyn Fn(&Runtime, &Thread, &[Value]) -> InterpResult<Value> + Send + Sync>;

/// Process-wide state shared by every thread: methods, compiled code and the JIT.
pub struct Runtime {
    config: JitConfig,
    methods: Arc<MethodTable>,
    instrumentation: Arc<Instrumentation>,
    cache: Arc<CodeCache>,
    table: Arc<JitTable>,
    jit: Mutex<TraceJitEngine>,
    natives: RwLock<HashMap<MethodId, NativeFn>>,
    save_all: Arc<Method>,
}

impl Runtime {
    /// Registers the callee-save runtime method in `methods` and starts the JIT.
    pub fn new(config: JitConfig, methods: Arc<MethodTable>) -> std::io::Result<Self> {
        let (core, fp) = config.isa.callee_save_masks();
        let save_all = methods.register(MethodBuilder::runtime(
            "save-all",
            FrameInfo::callee_save(core, fp),
        ));
        let cache = Arc::new(CodeCache::new());
        let table = Arc::new(JitTable::new());
        let jit = TraceJitEngine::new(config.clone(), Arc::clone(&cache), Arc::clone(&table))?;
        info!(
            isa = %config.isa,
            jit = config.enabled,
            hot_threshold = config.hot_threshold,
            "runtime started"
        );
        Ok(Self {
            config,
            methods,
            instrumentation: Arc::new(Instrumentation::new()),
            cache,
            table,
            jit: Mutex::new(jit),
            natives: RwLock::new(HashMap::new()),
            save_all,
        })
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn methods(&self) -> &Arc<MethodTable> {
        &self.methods
    }

    pub fn instrumentation(&self) -> &Arc<Instrumentation> {
        &self.instrumentation
    }

    pub fn code_cache(&self) -> &Arc<CodeCache> {
        &self.cache
    }

    pub fn jit_table(&self) -> &Arc<JitTable> {
        &self.table
    }

    /// Runtime method whose frame holds every callee-save register.
    pub fn save_all_method(&self) -> &Arc<Method> {
        &self.save_all
    }

    pub fn new_thread(&self) -> Thread {
        Thread::new(
            self.config.isa,
            Arc::clone(&self.methods),
            Arc::clone(&self.instrumentation),
        )
    }

    pub fn register_native<F>(&self, method: MethodId, native: F)
    where
        F: Fn(&Runtime, &Thread, &[Value]) -> InterpResult<Value> + Send + Sync + 'static,
    {
        self.natives.write().insert(method, Arc::new(native));
    }

    /// Runs `f` with the JIT locked. Never call back into compiled code from `f`.
    pub fn with_jit<R>(&self, f: impl FnOnce(&mut TraceJitEngine) -> R) -> R {
        f(&mut self.jit.lock())
    }

    pub fn jit_snapshot(&self) -> JitSnapshot {
        self.jit.lock().snapshot()
    }

    pub fn jit_dump(&self) -> String {
        self.jit.lock().dump_text()
    }

    pub fn compile_method_now(&self, method: &Arc<Method>) -> CompileResult<Arc<CompiledCode>> {
        self.jit.lock().compile_method_now(method)
    }

    pub fn invoke_by_name(&self, thread: &Thread, pretty_name: &str, args: &[Value]) -> InterpResult<Value> {
        let method = self
            .methods
            .find(pretty_name)
            .ok_or_else(|| InterpError::MethodNotFound(pretty_name.to_string()))?;
        self.invoke(thread, &method, args)
    }

    /// Calls `method` with `args`, through compiled code when it has any.
    pub fn invoke(&self, thread: &Thread, method: &Arc<Method>, args: &[Value]) -> InterpResult<Value> {
        let expected = parameter_kinds(method).len();
        if args.len() != expected {
            return Err(InterpError::ArgumentCount {
                expected,
                actual: args.len(),
            });
        }
        if method.is_abstract() {
            return Err(InterpError::AbstractMethod(method.pretty_name()));
        }
        if method.is_native() {
            return self.invoke_native(thread, method, args);
        }

        let invocations = method.record_invoke();
        if self.config.enabled && invocations >= self.config.hot_threshold.max(1) && method.compiled().is_none() {
            self.jit.lock().request_method(method);
        }
        match method.compiled() {
            Some(code) => {
                let code = Arc::clone(code);
                simulator::run_method(self, thread, method, &code, args)
            }
            None => interpreter::execute(self, thread, method, args),
        }
    }

    fn invoke_native(&self, thread: &Thread, method: &Arc<Method>, args: &[Value]) -> InterpResult<Value> {
        let native = self
            .natives
            .read()
            .get(&method.id())
            .cloned()
            .ok_or_else(|| InterpError::UnboundNative(method.pretty_name()))?;
        debug!(method = %method.pretty_name(), "calling native");
        let previous = thread.set_state(ThreadState::Native);
        let result = native(self, thread, args);
        thread.set_state(previous);
        result
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("methods", &self.methods.len())
            .field("natives", &self.natives.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::assemble_method;

    #[test]
    fn values_round_trip_through_bits() {
        assert_eq!(Value::from_bits('J', Value::Long(-3).to_bits()), Value::Long(-3));
        assert_eq!(Value::from_bits('D', Value::Double(1.5).to_bits()), Value::Double(1.5));
        assert_eq!(Value::from_bits('I', 0xffff_ffff), Value::Int(-1));
        assert_eq!(Value::Double(0.0).words(), 2);
        assert_eq!(Value::Object(0).to_string(), "null");
    }

    #[test]
    fn natives_run_in_native_state() {
        let methods = Arc::new(MethodTable::new());
        let native = methods.register(
            MethodBuilder::new("LT;", "now", "I")
                .static_method()
                .native(FrameInfo::new(16, 0, 0)),
        );
        let rt = Runtime::new(
            JitConfig {
                enabled: false,
                ..JitConfig::default()
            },
            methods,
        )
        .expect("runtime");
        rt.register_native(native.id(), |_, thread, _| {
            assert_eq!(thread.state(), ThreadState::Native);
            Ok(Value::Int(42))
        });
        let thread = rt.new_thread();
        assert_eq!(rt.invoke(&thread, &native, &[]).expect("native"), Value::Int(42));
        assert_eq!(thread.state(), ThreadState::Runnable);
    }

    #[test]
    fn argument_counts_are_checked() {
        let methods = Arc::new(MethodTable::new());
        let method = methods.register(
            assemble_method(
                "
.method static LT;->id(I)I
.registers 1
.ins 1
    return v0
.end method
",
            )
            .expect("assemble"),
        );
        let rt = Runtime::new(JitConfig::default(), methods).expect("runtime");
        let thread = rt.new_thread();
        assert_eq!(
            rt.invoke(&thread, &method, &[]),
            Err(InterpError::ArgumentCount {
                expected: 1,
                actual: 0
            })
        );
        assert_eq!(
            rt.invoke_by_name(&thread, "T.id", &[Value::Int(5)]).expect("by name"),
            Value::Int(5)
        );
    }
}
