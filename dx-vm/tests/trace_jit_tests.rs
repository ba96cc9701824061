mod common;

use std::time::Duration;

use common::*;
use vm::JitSnapshot;
use vm::runtime::interpreter;

#[test]
fn hot_loop_runs_through_a_trace() {
    // Interpreting directly keeps the method itself from being compiled at the threshold.
    for isa in COMPILED_ISAS {
        let (rt, methods) = runtime_for(eager_trace_config(isa), COUNT);
        let count = &methods[0];
        let thread = rt.new_thread();
        let result = interpreter::execute(&rt, &thread, count, &[Value::Int(50)]).expect("count");
        assert_eq!(result, Value::Int(50), "{isa}");

        let snapshot = rt.jit_snapshot();
        let dump = rt.jit_dump();
        assert_eq!(snapshot.traces.len(), 1, "{isa}:\n{dump}");
        let trace = &snapshot.traces[0];
        assert_eq!(trace.entry_dex_pc, 1);
        assert_eq!(trace.cells, 2);
        assert!(trace.executions > 1, "{isa}:\n{dump}");
    }
}

#[test]
fn traces_chain_to_each_other_once_both_exist() {
    for isa in COMPILED_ISAS {
        let (rt, methods) = runtime_for(eager_trace_config(isa), COUNT);
        let count = &methods[0];
        // The loop body only becomes a trace head when asked for directly.
        let body = rt.with_jit(|jit| jit.observe_hot_pc(count, 3));
        assert!(body.is_some(), "{isa}: {}", rt.jit_dump());

        let thread = rt.new_thread();
        let result = interpreter::execute(&rt, &thread, count, &[Value::Int(20)]).expect("count");
        assert_eq!(result, Value::Int(20), "{isa}");

        let snapshot = rt.jit_snapshot();
        let chained: usize = snapshot.traces.iter().map(|trace| trace.chained_cells).sum();
        assert!(chained >= 2, "{isa}:\n{}", rt.jit_dump());

        rt.code_cache().unchain_all();
        let again = interpreter::execute(&rt, &thread, count, &[Value::Int(9)]).expect("count after unchain");
        assert_eq!(again, Value::Int(9), "{isa}");
    }
}

#[test]
fn snapshot_serializes_to_json() {
    let (rt, methods) = runtime_for(eager_trace_config(InstructionSet::Mips), COUNT);
    let thread = rt.new_thread();
    interpreter::execute(&rt, &thread, &methods[0], &[Value::Int(3)]).expect("count");
    let json = rt.jit_snapshot().to_json();
    let parsed: JitSnapshot = serde_json::from_str(&json).expect("snapshot json");
    assert_eq!(parsed.isa, InstructionSet::Mips);
    assert_eq!(parsed.traces.len(), 1);
    assert!(rt.jit_dump().contains("trace#0 method="), "{}", rt.jit_dump());
}

#[test]
fn config_json_overrides_defaults() {
    let config = JitConfig::from_json(r#"{"isa": "x86", "hot_threshold": 2, "queue_capacity": 0}"#)
        .expect("config json");
    assert_eq!(config.isa, InstructionSet::X86);
    assert_eq!(config.hot_threshold, 2);
    assert!(config.is_synchronous());
    assert!(config.enabled);
    assert_eq!(JitConfig::from_json(&config.to_json()).expect("round trip"), config);
    assert!(JitConfig::from_json(r#"{"isa": "sparc"}"#).is_err());
}

#[test]
fn background_compiler_publishes_traces() {
    let config = JitConfig {
        isa: InstructionSet::X86,
        hot_threshold: 1,
        queue_capacity: 4,
        ..JitConfig::default()
    };
    let (rt, methods) = runtime_for(config, COUNT);
    let count = &methods[0];
    let thread = rt.new_thread();
    let result = interpreter::execute(&rt, &thread, count, &[Value::Int(5)]).expect("count");
    assert_eq!(result, Value::Int(5));
    assert!(rt.with_jit(|jit| jit.wait_idle(Duration::from_secs(10))));
    assert_eq!(rt.jit_table().len(), 1, "{}", rt.jit_dump());
    let result = interpreter::execute(&rt, &thread, count, &[Value::Int(30)]).expect("count");
    assert_eq!(result, Value::Int(30));
    assert!(rt.jit_snapshot().traces[0].executions > 0);
}
