//! Checks applied at the managed/native boundary.
//!
//! Every native entry point names itself and passes flags describing what it tolerates:
//! calls made while a critical region is open, calls made with an exception pending, and
//! nullable UTF arguments. A failed check is logged with the innermost managed method and
//! returned as a [`JniError`]; the caller decides whether that aborts the runtime.

use std::cell::Cell;
use std::fmt;
use std::sync::Arc;

use tracing::{error, info};

use crate::heap::ComponentType;
use crate::method::{Method, ObjectRef};
use crate::stack::StackVisitor;
use crate::thread::{Thread, ThreadState};

pub const CRIT_BAD: u32 = 0x0000;
pub const CRIT_OKAY: u32 = 0x0001;
pub const CRIT_GET: u32 = 0x0002;
pub const CRIT_RELEASE: u32 = 0x0003;
pub const CRIT_MASK: u32 = 0x0003;
pub const EXCEP_OKAY: u32 = 0x0004;
pub const NULLABLE_UTF: u32 = 0x0020;
/// Part of the invocation interface; may run on a thread that is not in native state.
pub const INVOCATION: u32 = 0x8000;
pub const FORCE_TRACE: u32 = 0x8000_0000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JniError {
    WrongThread {
        function: &'static str,
        env_owner: u32,
        caller: u32,
    },
    WrongState {
        function: &'static str,
        state: ThreadState,
    },
    CalledInCritical {
        function: &'static str,
    },
    TooManyCriticalReleases {
        function: &'static str,
    },
    PendingException {
        function: &'static str,
        exception: ObjectRef,
    },
    ReturnTypeMismatch {
        function: &'static str,
        method: String,
    },
    StaticMismatch {
        function: &'static str,
        method: String,
        method_is_static: bool,
    },
    ArgumentCount {
        function: &'static str,
        method: String,
        expected: usize,
        found: usize,
    },
    ArgumentType {
        function: &'static str,
        method: String,
        index: usize,
        expected: char,
        found: char,
    },
    NullArgument {
        function: &'static str,
        what: &'static str,
    },
    InvalidUtf {
        function: &'static str,
        kind: &'static str,
        byte: u8,
    },
    InvalidClassName {
        function: &'static str,
        name: String,
    },
    NotAnArray {
        function: &'static str,
        object: ObjectRef,
    },
}

impl JniError {
    pub fn function(&self) -> &'static str {
        match self {
            JniError::WrongThread { function, .. }
            | JniError::WrongState { function, .. }
            | JniError::CalledInCritical { function }
            | JniError::TooManyCriticalReleases { function }
            | JniError::PendingException { function, .. }
            | JniError::ReturnTypeMismatch { function, .. }
            | JniError::StaticMismatch { function, .. }
            | JniError::ArgumentCount { function, .. }
            | JniError::ArgumentType { function, .. }
            | JniError::NullArgument { function, .. }
            | JniError::InvalidUtf { function, .. }
            | JniError::InvalidClassName { function, .. }
            | JniError::NotAnArray { function, .. } => *function,
        }
    }
}

impl fmt::Display for JniError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JniError::WrongThread {
                env_owner, caller, ..
            } => write!(
                f,
                "thread 0x{caller:08x} using JNIEnv* from thread 0x{env_owner:08x}"
            ),
            JniError::WrongState { state, .. } => {
                write!(f, "JNI call made from a thread in state {state:?}")
            }
            JniError::CalledInCritical { .. } => f.write_str("using JNI after critical get"),
            JniError::TooManyCriticalReleases { .. } => f.write_str("too many critical releases"),
            JniError::PendingException {
                function,
                exception,
            } => write!(
                f,
                "JNI {function} called with pending exception 0x{exception:08x}"
            ),
            JniError::ReturnTypeMismatch { function, method } => {
                write!(f, "the return type of {function} does not match {method}")
            }
            JniError::StaticMismatch {
                function,
                method,
                method_is_static,
            } => {
                let kind = if *method_is_static { "static" } else { "non-static" };
                write!(f, "calling {kind} method {method} with {function}")
            }
            JniError::ArgumentCount {
                method,
                expected,
                found,
                ..
            } => write!(f, "{method} takes {expected} arguments, got {found}"),
            JniError::ArgumentType {
                method,
                index,
                expected,
                found,
                ..
            } => write!(
                f,
                "argument {index} of {method} should be '{expected}' but is '{found}'"
            ),
            JniError::NullArgument { function, what } => {
                write!(f, "{function} received null {what}")
            }
            JniError::InvalidUtf { kind, byte, .. } => write!(
                f,
                "input is not valid Modified UTF-8: illegal {kind} byte 0x{byte:02x}"
            ),
            JniError::InvalidClassName { function, name } => write!(
                f,
                "illegal class name '{name}' in {function} (should be of the form 'java/lang/String')"
            ),
            JniError::NotAnArray { object, .. } => {
                write!(f, "jarray argument has non-array type: 0x{object:08x}")
            }
        }
    }
}

impl std::error::Error for JniError {}

pub type JniResult<T> = Result<T, JniError>;

/// A value crossing the boundary, tagged with its shorty type.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum JniValue {
    Boolean(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Object(ObjectRef),
    Void,
}

impl JniValue {
    pub fn shorty_char(&self) -> char {
        match self {
            JniValue::Boolean(_) => 'Z',
            JniValue::Byte(_) => 'B',
            JniValue::Char(_) => 'C',
            JniValue::Short(_) => 'S',
            JniValue::Int(_) => 'I',
            JniValue::Long(_) => 'J',
            JniValue::Float(_) => 'F',
            JniValue::Double(_) => 'D',
            JniValue::Object(_) => 'L',
            JniValue::Void => 'V',
        }
    }

    /// Argument words this value takes in a frame.
    pub fn width(&self) -> usize {
        match self {
            JniValue::Long(_) | JniValue::Double(_) => 2,
            JniValue::Void => 0,
            _ => 1,
        }
    }
}

impl fmt::Display for JniValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            JniValue::Boolean(value) => write!(f, "{value}"),
            JniValue::Byte(value) if (0..10).contains(&value) => write!(f, "{value}"),
            JniValue::Byte(value) => write!(f, "{:#x} ({value})", value as u8),
            JniValue::Char(value) => match char::from_u32(value as u32) {
                Some(c) if (' '..'\u{7f}').contains(&c) => write!(f, "U+{value:x} ('{c}')"),
                _ => write!(f, "U+{value:x}"),
            },
            JniValue::Short(value) => write!(f, "{value}"),
            JniValue::Int(value) => write!(f, "{value}"),
            JniValue::Long(value) => write!(f, "{value}"),
            JniValue::Float(value) => write!(f, "{value}"),
            JniValue::Double(value) => write!(f, "{value}"),
            JniValue::Object(0) => f.write_str("NULL"),
            JniValue::Object(obj) => write!(f, "0x{obj:08x}"),
            JniValue::Void => f.write_str("void"),
        }
    }
}

/// Per-env checker. An env belongs to the thread that created it.
#[derive(Debug)]
pub struct CheckJni {
    env_owner: u32,
    critical: Cell<i32>,
    /// Calls are traced when the innermost managed method's pretty name starts with this.
    trace_prefix: Option<String>,
}

impl CheckJni {
    pub fn new(owner: &Thread) -> Self {
        Self {
            env_owner: owner.self_word(),
            critical: Cell::new(0),
            trace_prefix: None,
        }
    }

    pub fn with_trace(mut self, prefix: impl Into<String>) -> Self {
        self.trace_prefix = Some(prefix.into());
        self
    }

    pub fn critical_depth(&self) -> i32 {
        self.critical.get()
    }

    /// Checks run on entry to every native entry point.
    pub fn check_thread(&self, thread: &Thread, function: &'static str, flags: u32) -> JniResult<()> {
        if thread.self_word() != self.env_owner {
            return self.abort(
                thread,
                JniError::WrongThread {
                    function,
                    env_owner: self.env_owner,
                    caller: thread.self_word(),
                },
            );
        }
        if flags & INVOCATION == 0 && thread.state() != ThreadState::Native {
            return self.abort(
                thread,
                JniError::WrongState {
                    function,
                    state: thread.state(),
                },
            );
        }
        match flags & CRIT_MASK {
            CRIT_OKAY => {}
            CRIT_GET => self.critical.set(self.critical.get() + 1),
            CRIT_RELEASE => {
                let depth = self.critical.get() - 1;
                if depth < 0 {
                    return self.abort(thread, JniError::TooManyCriticalReleases { function });
                }
                self.critical.set(depth);
            }
            _ => {
                if self.critical.get() > 0 {
                    return self.abort(thread, JniError::CalledInCritical { function });
                }
            }
        }
        if flags & EXCEP_OKAY == 0 {
            if let Some(exception) = thread.pending_exception() {
                return self.abort(
                    thread,
                    JniError::PendingException {
                        function,
                        exception,
                    },
                );
            }
        }
        Ok(())
    }

    /// Verifies that `method` can be called through a `Call<Type>Method` family member.
    ///
    /// `expected_return` is the shorty character of the call type, `L` for every reference.
    pub fn check_sig(
        &self,
        thread: &Thread,
        function: &'static str,
        method: &Method,
        expected_return: char,
        is_static: bool,
    ) -> JniResult<()> {
        let actual = method.shorty().chars().next().unwrap_or('V');
        if actual != expected_return {
            return self.abort(
                thread,
                JniError::ReturnTypeMismatch {
                    function,
                    method: method.pretty_name(),
                },
            );
        }
        if is_static != method.is_static() {
            return self.abort(
                thread,
                JniError::StaticMismatch {
                    function,
                    method: method.pretty_name(),
                    method_is_static: method.is_static(),
                },
            );
        }
        Ok(())
    }

    /// Compares argument values with the parameter part of the method's shorty.
    pub fn check_args(
        &self,
        thread: &Thread,
        function: &'static str,
        method: &Method,
        args: &[JniValue],
    ) -> JniResult<()> {
        let params: Vec<char> = method.shorty().chars().skip(1).collect();
        if params.len() != args.len() {
            return self.abort(
                thread,
                JniError::ArgumentCount {
                    function,
                    method: method.pretty_name(),
                    expected: params.len(),
                    found: args.len(),
                },
            );
        }
        for (index, (expected, arg)) in params.iter().zip(args).enumerate() {
            let found = arg.shorty_char();
            if *expected != found {
                return self.abort(
                    thread,
                    JniError::ArgumentType {
                        function,
                        method: method.pretty_name(),
                        index,
                        expected: *expected,
                        found,
                    },
                );
            }
        }
        Ok(())
    }

    pub fn check_non_null(
        &self,
        thread: &Thread,
        function: &'static str,
        value: ObjectRef,
        what: &'static str,
    ) -> JniResult<()> {
        if value == 0 {
            return self.abort(thread, JniError::NullArgument { function, what });
        }
        Ok(())
    }

    pub fn check_array(&self, thread: &Thread, function: &'static str, array: ObjectRef) -> JniResult<ComponentType> {
        self.check_non_null(thread, function, array, "jarray")?;
        match thread.heap().component_type(array) {
            Ok(component) => Ok(component),
            Err(_) => self.abort(
                thread,
                JniError::NotAnArray {
                    function,
                    object: array,
                },
            ),
        }
    }

    /// Checks a `const char*` argument; `None` stands for NULL.
    pub fn check_utf_string(
        &self,
        thread: &Thread,
        function: &'static str,
        bytes: Option<&[u8]>,
        flags: u32,
    ) -> JniResult<()> {
        let Some(bytes) = bytes else {
            if flags & NULLABLE_UTF != 0 {
                return Ok(());
            }
            return self.abort(
                thread,
                JniError::NullArgument {
                    function,
                    what: "const char*",
                },
            );
        };
        match check_utf_bytes(bytes) {
            Ok(()) => Ok(()),
            Err((kind, byte)) => self.abort(thread, JniError::InvalidUtf { function, kind, byte }),
        }
    }

    pub fn check_class_name(&self, thread: &Thread, function: &'static str, name: &str) -> JniResult<()> {
        if is_valid_jni_class_name(name) {
            return Ok(());
        }
        self.abort(
            thread,
            JniError::InvalidClassName {
                function,
                name: name.to_string(),
            },
        )
    }

    /// Formats and logs a call when tracing applies to it.
    pub fn trace_call(
        &self,
        thread: &Thread,
        function: &'static str,
        flags: u32,
        args: &[JniValue],
    ) -> Option<String> {
        let forced = flags & FORCE_TRACE != 0;
        let traced = match (&self.trace_prefix, forced) {
            (_, true) => true,
            (Some(prefix), false) => current_method(thread)
                .is_some_and(|method| method.pretty_name().starts_with(prefix.as_str())),
            (None, false) => false,
        };
        if !traced {
            return None;
        }
        let rendered: Vec<String> = args.iter().map(ToString::to_string).collect();
        let line = format!("{function}({})", rendered.join(", "));
        info!(target: "jni", "{line}");
        Some(line)
    }

    fn abort<T>(&self, thread: &Thread, err: JniError) -> JniResult<T> {
        let from = current_method(thread)
            .map(|method| method.pretty_name())
            .unwrap_or_else(|| "<no managed frame>".to_string());
        error!(
            function = err.function(),
            from = %from,
            "JNI DETECTED ERROR IN APPLICATION: {err}"
        );
        Err(err)
    }
}

/// Innermost managed method on `thread`'s stack, skipping runtime frames.
pub fn current_method(thread: &Thread) -> Option<Arc<Method>> {
    let mut found = None;
    let mut visitor = StackVisitor::new(thread, None, false);
    visitor.walk_stack(&mut |frame| match frame.method() {
        Some(method) if !method.is_runtime_method() => {
            found = Some(Arc::clone(method));
            false
        }
        _ => true,
    });
    found
}

/// Validates Modified UTF-8; on failure returns the error kind and the offending byte.
pub fn check_utf_bytes(bytes: &[u8]) -> Result<(), (&'static str, u8)> {
    let mut iter = bytes.iter().copied();
    while let Some(lead) = iter.next() {
        let continuation = match lead >> 4 {
            0x0..=0x7 => 0,
            0xc | 0xd => 1,
            0xe => 2,
            _ => return Err(("start", lead)),
        };
        for _ in 0..continuation {
            match iter.next() {
                Some(byte) if byte & 0xc0 == 0x80 => {}
                Some(byte) => return Err(("continuation", byte)),
                None => return Err(("continuation", 0)),
            }
        }
    }
    Ok(())
}

/// Accepts `java/lang/String` style names and array descriptors such as `[Ljava/lang/Object;`.
pub fn is_valid_jni_class_name(name: &str) -> bool {
    if let Some(component) = name.strip_prefix('[') {
        let element = component.trim_start_matches('[');
        return match element.as_bytes() {
            [b'Z' | b'B' | b'C' | b'S' | b'I' | b'J' | b'F' | b'D'] => true,
            [b'L', .., b';'] => is_valid_binary_name(&element[1..element.len() - 1]),
            _ => false,
        };
    }
    is_valid_binary_name(name)
}

fn is_valid_binary_name(name: &str) -> bool {
    !name.is_empty()
        && name.split('/').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| !matches!(c, '.' | ';' | '[' | '/') && !c.is_whitespace())
        })
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::isa::InstructionSet;
    use crate::method::{CodeItem, MethodBuilder, MethodTable};
    use crate::stack::{ReferenceLayout, ShadowFrame};
    use crate::stack::instrumentation::Instrumentation;

    fn native_thread() -> (Thread, Arc<MethodTable>) {
        let methods = Arc::new(MethodTable::new());
        let thread = Thread::new(
            InstructionSet::Thumb2,
            Arc::clone(&methods),
            Arc::new(Instrumentation::new()),
        );
        thread.set_state(ThreadState::Native);
        (thread, methods)
    }

    #[test]
    fn thread_state_and_ownership() {
        let (thread, _) = native_thread();
        let (other, _) = native_thread();
        let env = CheckJni::new(&thread);
        env.check_thread(&thread, "GetVersion", CRIT_BAD).expect("owner");
        let err = env
            .check_thread(&other, "GetVersion", CRIT_BAD)
            .expect_err("foreign thread");
        assert!(matches!(err, JniError::WrongThread { .. }));

        thread.set_state(ThreadState::Runnable);
        let err = env.check_thread(&thread, "FindClass", CRIT_BAD).expect_err("runnable");
        assert_eq!(
            err,
            JniError::WrongState {
                function: "FindClass",
                state: ThreadState::Runnable
            }
        );
        env.check_thread(&thread, "AttachCurrentThread", INVOCATION)
            .expect("invocation interface");
    }

    #[test]
    fn critical_regions_nest_and_block_other_calls() {
        let (thread, _) = native_thread();
        let env = CheckJni::new(&thread);
        env.check_thread(&thread, "GetPrimitiveArrayCritical", CRIT_GET).expect("get");
        env.check_thread(&thread, "GetStringCritical", CRIT_GET).expect("nested get");
        assert_eq!(env.critical_depth(), 2);
        let err = env.check_thread(&thread, "NewObject", CRIT_BAD).expect_err("in critical");
        assert_eq!(err, JniError::CalledInCritical { function: "NewObject" });
        env.check_thread(&thread, "ExceptionCheck", CRIT_OKAY).expect("allowed");
        env.check_thread(&thread, "ReleaseStringCritical", CRIT_RELEASE).expect("release");
        env.check_thread(&thread, "ReleasePrimitiveArrayCritical", CRIT_RELEASE).expect("release");
        let err = env
            .check_thread(&thread, "ReleasePrimitiveArrayCritical", CRIT_RELEASE)
            .expect_err("unbalanced");
        assert!(matches!(err, JniError::TooManyCriticalReleases { .. }));
    }

    #[test]
    fn pending_exception_blocks_everything_but_exception_calls() {
        let (thread, _) = native_thread();
        let env = CheckJni::new(&thread);
        thread.set_pending_exception(0x2000_0040);
        let err = env.check_thread(&thread, "CallVoidMethod", CRIT_BAD).expect_err("pending");
        assert_eq!(err.to_string(), "JNI CallVoidMethod called with pending exception 0x20000040");
        env.check_thread(&thread, "ExceptionClear", CRIT_OKAY | EXCEP_OKAY)
            .expect("exception calls are allowed");
    }

    #[test]
    fn signatures_and_arguments() {
        let (thread, methods) = native_thread();
        let env = CheckJni::new(&thread);
        let method = methods.register(MethodBuilder::new("LFoo;", "mix", "IJL").static_method());
        env.check_sig(&thread, "CallStaticIntMethod", &method, 'I', true).expect("matches");
        let err = env
            .check_sig(&thread, "CallStaticObjectMethod", &method, 'L', true)
            .expect_err("return type");
        assert!(matches!(err, JniError::ReturnTypeMismatch { .. }));
        let err = env
            .check_sig(&thread, "CallIntMethod", &method, 'I', false)
            .expect_err("static");
        assert_eq!(err.to_string(), "calling static method Foo.mix with CallIntMethod");

        env.check_args(&thread, "CallStaticIntMethod", &method, &[JniValue::Long(1), JniValue::Object(0)])
            .expect("args");
        let err = env
            .check_args(&thread, "CallStaticIntMethod", &method, &[JniValue::Int(1), JniValue::Object(0)])
            .expect_err("wrong type");
        assert!(matches!(err, JniError::ArgumentType { index: 0, expected: 'J', found: 'I', .. }));
        let err = env
            .check_args(&thread, "CallStaticIntMethod", &method, &[JniValue::Long(1)])
            .expect_err("arity");
        assert!(matches!(err, JniError::ArgumentCount { expected: 2, found: 1, .. }));
    }

    #[test]
    fn modified_utf8() {
        assert_eq!(check_utf_bytes(b"plain ascii"), Ok(()));
        assert_eq!(check_utf_bytes(&[0xc0, 0x80]), Ok(()));
        assert_eq!(check_utf_bytes(&[0xe2, 0x82, 0xac]), Ok(()));
        assert_eq!(check_utf_bytes(&[0xf0, 0x9f, 0x98, 0x80]), Err(("start", 0xf0)));
        assert_eq!(check_utf_bytes(&[0x80]), Err(("start", 0x80)));
        assert_eq!(check_utf_bytes(&[0xe2, 0x28, 0xa1]), Err(("continuation", 0x28)));

        let (thread, _) = native_thread();
        let env = CheckJni::new(&thread);
        env.check_utf_string(&thread, "NewStringUTF", None, NULLABLE_UTF)
            .expect("nullable");
        let err = env
            .check_utf_string(&thread, "NewStringUTF", None, 0)
            .expect_err("null");
        assert_eq!(err.to_string(), "NewStringUTF received null const char*");
    }

    #[test]
    fn class_names() {
        for good in ["java/lang/String", "Foo", "[I", "[[Ljava/lang/Object;", "a/b$C"] {
            assert!(is_valid_jni_class_name(good), "{good}");
        }
        for bad in ["java.lang.String", "Ljava/lang/String;", "", "[", "[Lfoo", "a//b", "[V"] {
            assert!(!is_valid_jni_class_name(bad), "{bad}");
        }

        let (thread, _) = native_thread();
        let env = CheckJni::new(&thread);
        assert_eq!(env.check_class_name(&thread, "FindClass", "java/lang/String"), Ok(()));
        assert!(matches!(
            env.check_class_name(&thread, "FindClass", "java.lang.String"),
            Err(JniError::InvalidClassName { function: "FindClass", .. })
        ));
    }

    #[test]
    fn arrays_are_checked_against_the_heap() {
        let (thread, _) = native_thread();
        let env = CheckJni::new(&thread);
        let array = thread.heap().alloc_array(ComponentType::Int, 3).expect("alloc");
        let object = thread.heap().alloc_object(1, 2).expect("alloc");
        assert_eq!(env.check_array(&thread, "GetArrayLength", array), Ok(ComponentType::Int));
        assert!(matches!(
            env.check_array(&thread, "GetArrayLength", object),
            Err(JniError::NotAnArray { .. })
        ));
        assert!(matches!(
            env.check_array(&thread, "GetArrayLength", 0),
            Err(JniError::NullArgument { what: "jarray", .. })
        ));
    }

    #[test]
    fn tracing_follows_the_innermost_managed_method() {
        let (thread, methods) = native_thread();
        let caller = methods.register(
            MethodBuilder::new("Lcom/example/Caller;", "run", "V")
                .code(CodeItem::new(1, 0, vec![0x000e])),
        );
        thread
            .managed_stack_mut()
            .push_shadow_frame(Rc::new(ShadowFrame::for_method(caller, ReferenceLayout::Parallel)));
        let env = CheckJni::new(&thread).with_trace("com.example");
        let args = [JniValue::Char(u16::from(b'A')), JniValue::Byte(-1), JniValue::Object(0)];
        let line = env.trace_call(&thread, "CallVoidMethodA", CRIT_BAD, &args);
        assert_eq!(
            line.as_deref(),
            Some("CallVoidMethodA(U+41 ('A'), 0xff (-1), NULL)")
        );
        let quiet = CheckJni::new(&thread).with_trace("org.other");
        assert_eq!(quiet.trace_call(&thread, "CallVoidMethodA", CRIT_BAD, &args), None);
        assert!(quiet.trace_call(&thread, "GetVersion", FORCE_TRACE, &[]).is_some());
        assert_eq!(current_method(&thread).map(|m| m.name().to_string()), Some("run".into()));
    }
}
