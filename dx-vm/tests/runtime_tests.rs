mod common;

use std::sync::Arc;

use common::*;
use parking_lot::Mutex;
use vm::{InterpError, compute_num_frames};

#[test]
fn compiled_add_is_visible_to_a_walk_from_its_native_callee() {
    for isa in COMPILED_ISAS {
        for promotion_enabled in [true, false] {
            let (methods, observer) = table_with_observer();
            let add = methods.register(assemble_method(ADD_AND_REPORT).expect("assemble"));
            let config = JitConfig {
                promotion_enabled,
                ..quiet_config(isa)
            };
            let rt = Runtime::new(config, Arc::clone(&methods)).expect("runtime");

            let seen = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&seen);
            rt.register_native(observer.id(), move |_, thread, args| {
                let frames = compute_num_frames(thread, false);
                let mut context = create_context(thread.isa());
                let mut visitor = StackVisitor::new(thread, Some(context.as_mut()), false);
                visitor.walk_stack(&mut |frame| {
                    if frame.method().is_some_and(|method| method.name() == "add") {
                        sink.lock().push((frame.get_vreg(0, VRegKind::Int), args[0], frames));
                        return false;
                    }
                    true
                });
                Ok(Value::Void)
            });

            let code = rt.compile_method_now(&add).expect("compile add");
            assert_eq!(add.entry_point(), Some(code.code_begin()));
            let thread = rt.new_thread();
            let result = rt
                .invoke(&thread, &add, &[Value::Int(30), Value::Int(12)])
                .expect("run add");
            assert_eq!(result, Value::Int(42), "{isa} promotion={promotion_enabled}");

            let seen = seen.lock();
            assert_eq!(seen.len(), 1, "{isa}: add frame not found by the walk");
            let (vreg, passed, frames) = seen[0];
            assert_eq!(vreg, 42, "{isa} promotion={promotion_enabled}");
            assert_eq!(passed, Value::Int(42));
            // The callee-save frame of the punt, then add itself.
            assert!(frames >= 2, "{isa}: {frames} frames");
        }
    }
}

#[test]
fn interpreted_and_compiled_loops_agree() {
    for isa in COMPILED_ISAS {
        let (rt, methods) = runtime_for(quiet_config(isa), COUNT);
        let count = &methods[0];
        let thread = rt.new_thread();
        let interpreted = rt.invoke(&thread, count, &[Value::Int(25)]).expect("interpret");
        rt.compile_method_now(count).expect("compile count");
        let compiled = rt.invoke(&thread, count, &[Value::Int(25)]).expect("compiled");
        assert_eq!(interpreted, Value::Int(25));
        assert_eq!(compiled, interpreted, "{isa}");
    }
}

#[test]
fn punted_array_allocation_runs_in_compiled_code() {
    let source = "
.method static LT;->fill(I)I
.registers 4
.ins 1
    new-array v0, v3, type@4
    const/4 v1, 1
    aput v3, v0, v1
    aget v2, v0, v1
    return v2
.end method
";
    for isa in COMPILED_ISAS {
        let (rt, methods) = runtime_for(quiet_config(isa), source);
        let fill = &methods[0];
        rt.compile_method_now(fill).expect("compile fill");
        let thread = rt.new_thread();
        assert_eq!(rt.invoke(&thread, fill, &[Value::Int(7)]).expect("fill"), Value::Int(7), "{isa}");
        assert_eq!(thread.stack_cursor(), thread.memory().end());
    }
}

#[test]
fn methods_compile_once_they_are_hot() {
    let config = JitConfig {
        hot_threshold: 3,
        queue_capacity: 0,
        ..JitConfig::default()
    };
    let (rt, methods) = runtime_for(config, COUNT);
    let count = &methods[0];
    let thread = rt.new_thread();
    for _ in 0..5 {
        assert_eq!(rt.invoke(&thread, count, &[Value::Int(4)]).expect("count"), Value::Int(4));
    }
    assert!(count.compiled().is_some(), "{}", rt.jit_dump());
}

#[test]
fn exceptions_surface_as_errors() {
    let source = "
.method static LT;->div(II)I
.registers 3
.ins 2
    div-int v0, v1, v2
    return v0
.end method
";
    let (rt, methods) = runtime_for(quiet_config(InstructionSet::Thumb2), source);
    let thread = rt.new_thread();
    let err = rt
        .invoke(&thread, &methods[0], &[Value::Int(1), Value::Int(0)])
        .expect_err("divide by zero");
    assert!(matches!(err, InterpError::Exception { .. }), "{err}");
    assert!(err.to_string().contains("ArithmeticException"), "{err}");
}
