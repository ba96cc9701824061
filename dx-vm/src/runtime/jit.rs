//! Trace JIT bookkeeping: hot counting of trace heads, compile requests, and the dumps.
//!
//! Backward-branch targets are trace heads. Each observation bumps the head's counter; at
//! the threshold the trace is compiled, either on the background compiler thread or, with a
//! zero queue capacity, right here. Failed heads are blocked so they are never retried.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::compiled::CompiledCode;
use crate::compiler::CompileResult;
use crate::compiler::code_cache::{CodeCache, JitTable};
use crate::compiler::driver::{CompileStats, CompilerDriver, CompilerOptions, UnitKind};
use crate::compiler::worker::{CompileOutcome, CompileRequest, CompilerWorker};
use crate::isa::InstructionSet;
use crate::method::{Method, MethodId};
use crate::stack::shadow_frame::ReferenceLayout;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitConfig {
    pub enabled: bool,
    pub isa: InstructionSet,
    /// Observations of a trace head (or invocations of a method) before it is compiled.
    pub hot_threshold: u32,
    pub max_trace_len: usize,
    /// Bound of the compile queue; zero compiles on the mutator thread instead.
    pub queue_capacity: usize,
    pub promotion_enabled: bool,
    pub reference_layout: ReferenceLayout,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            isa: InstructionSet::Thumb2,
            hot_threshold: 40,
            max_trace_len: 32,
            queue_capacity: 16,
            promotion_enabled: true,
            reference_layout: ReferenceLayout::Parallel,
        }
    }
}

impl JitConfig {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn compiler_options(&self) -> CompilerOptions {
        CompilerOptions {
            isa: self.isa,
            promotion_enabled: self.promotion_enabled,
            max_trace_len: self.max_trace_len,
        }
    }

    pub fn is_synchronous(&self) -> bool {
        self.queue_capacity == 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JitAttempt {
    pub method: MethodId,
    pub method_name: String,
    pub kind: UnitKind,
    /// Entry address on success, the abort message otherwise.
    pub result: Result<u32, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JitTraceInfo {
    pub method: MethodId,
    pub entry_dex_pc: u32,
    pub code_begin: u32,
    pub code_size: u32,
    pub cells: usize,
    pub chained_cells: usize,
    pub executions: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JitSnapshot {
    pub isa: InstructionSet,
    pub config: JitConfig,
    pub traces: Vec<JitTraceInfo>,
    pub attempts: Vec<JitAttempt>,
    pub dropped_requests: u64,
    pub code_cache_bytes: u32,
    pub stats: CompileStats,
}

impl JitSnapshot {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

type TraceKey = (MethodId, u32);

pub struct TraceJitEngine {
    config: JitConfig,
    cache: Arc<CodeCache>,
    table: Arc<JitTable>,
    driver: CompilerDriver,
    worker: Option<CompilerWorker>,
    hot_counts: HashMap<TraceKey, u32>,
    blocked: HashSet<TraceKey>,
    pending_traces: HashSet<TraceKey>,
    pending_methods: HashSet<MethodId>,
    executions: HashMap<TraceKey, u64>,
    attempts: Vec<JitAttempt>,
    worker_stats: CompileStats,
    dropped: u64,
}

impl TraceJitEngine {
    pub fn new(config: JitConfig, cache: Arc<CodeCache>, table: Arc<JitTable>) -> std::io::Result<Self> {
        let worker = spawn_worker(&config, &cache, &table)?;
        Ok(Self {
            driver: CompilerDriver::new(config.compiler_options(), Arc::clone(&cache)),
            config,
            cache,
            table,
            worker,
            hot_counts: HashMap::new(),
            blocked: HashSet::new(),
            pending_traces: HashSet::new(),
            pending_methods: HashSet::new(),
            executions: HashMap::new(),
            attempts: Vec::new(),
            worker_stats: CompileStats::default(),
            dropped: 0,
        })
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    /// Replaces the configuration and forgets every trace, counter and attempt.
    pub fn set_config(&mut self, config: JitConfig) -> std::io::Result<()> {
        if let Some(worker) = self.worker.take() {
            worker.shutdown();
        }
        self.worker = spawn_worker(&config, &self.cache, &self.table)?;
        self.driver = CompilerDriver::new(config.compiler_options(), Arc::clone(&self.cache));
        self.config = config;
        self.reset();
        Ok(())
    }

    /// Unchains every cell and empties the JIT table.
    pub fn reset(&mut self) {
        self.cache.unchain_all();
        self.table.clear();
        self.hot_counts.clear();
        self.blocked.clear();
        self.pending_traces.clear();
        self.pending_methods.clear();
        self.executions.clear();
        self.attempts.clear();
        self.worker_stats = CompileStats::default();
        self.dropped = 0;
    }

    /// Counts one arrival at the trace head `dex_pc` and returns its trace once compiled.
    pub fn observe_hot_pc(&mut self, method: &Arc<Method>, dex_pc: u32) -> Option<Arc<CompiledCode>> {
        if !self.config.enabled {
            return None;
        }
        self.drain_outcomes();
        let key = (method.id(), dex_pc);
        if let Some(code) = self.table.lookup(key.0, key.1) {
            return Some(code);
        }
        if self.blocked.contains(&key) || self.pending_traces.contains(&key) {
            return None;
        }

        let count = self.hot_counts.entry(key).or_insert(0);
        *count = count.saturating_add(1);
        if *count < self.config.hot_threshold.max(1) {
            return None;
        }
        self.hot_counts.remove(&key);

        if let Some(worker) = &self.worker {
            if worker.submit(CompileRequest::trace(Arc::clone(method), dex_pc)) {
                debug!(method = %method.pretty_name(), dex_pc, "trace head queued");
                self.pending_traces.insert(key);
            } else {
                self.dropped += 1;
            }
            return None;
        }

        let result = self.driver.compile_trace(method, dex_pc);
        self.record(method.id(), method.pretty_name(), UnitKind::Trace { entry_dex_pc: dex_pc }, &result);
        match result {
            Ok(code) => {
                self.table.publish(key.0, key.1, Arc::clone(&code));
                Some(code)
            }
            Err(_) => {
                self.blocked.insert(key);
                None
            }
        }
    }

    /// Asks for `method` to be compiled whole; returns false when nothing was started.
    pub fn request_method(&mut self, method: &Arc<Method>) -> bool {
        if !self.config.enabled || method.compiled().is_some() || method.is_interpret_only() {
            return false;
        }
        self.drain_outcomes();
        if self.pending_methods.contains(&method.id()) {
            return false;
        }
        if let Some(worker) = &self.worker {
            if worker.submit(CompileRequest::method(Arc::clone(method))) {
                self.pending_methods.insert(method.id());
                return true;
            }
            self.dropped += 1;
            return false;
        }
        self.compile_method_now(method).is_ok()
    }

    /// Compiles `method` on the calling thread, regardless of the queue configuration.
    pub fn compile_method_now(&mut self, method: &Arc<Method>) -> CompileResult<Arc<CompiledCode>> {
        let result = self.driver.compile_method(method);
        self.record(method.id(), method.pretty_name(), UnitKind::Method, &result);
        result
    }

    /// Folds finished background compilations into the attempt log.
    pub fn drain_outcomes(&mut self) -> usize {
        let Some(worker) = &self.worker else {
            return 0;
        };
        let outcomes: Vec<CompileOutcome> = worker.outcomes().try_iter().collect();
        let drained = outcomes.len();
        for outcome in outcomes {
            self.absorb(outcome);
        }
        drained
    }

    /// Blocks until every queued request has reported back, or `timeout` passes.
    pub fn wait_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.pending_traces.is_empty() || !self.pending_methods.is_empty() {
            let Some(worker) = &self.worker else {
                break;
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            match worker.outcomes().recv_timeout(remaining) {
                Ok(outcome) => self.absorb(outcome),
                Err(_) => return false,
            }
        }
        true
    }

    pub fn mark_trace_executed(&mut self, method: MethodId, entry_dex_pc: u32) {
        let count = self.executions.entry((method, entry_dex_pc)).or_insert(0);
        *count = count.saturating_add(1);
    }

    pub fn dropped_requests(&self) -> u64 {
        self.dropped
    }

    pub fn attempts(&self) -> &[JitAttempt] {
        &self.attempts
    }

    pub fn is_blocked(&self, method: MethodId, dex_pc: u32) -> bool {
        self.blocked.contains(&(method, dex_pc))
    }

    pub fn stats(&self) -> CompileStats {
        let local = self.driver.stats();
        let remote = self.worker_stats;
        CompileStats {
            methods: local.methods + remote.methods,
            traces: local.traces + remote.traces,
            aborts: local.aborts + remote.aborts,
            code_bytes: local.code_bytes + remote.code_bytes,
            punts: local.punts + remote.punts,
        }
    }

    pub fn snapshot(&self) -> JitSnapshot {
        let traces = self
            .table
            .entries()
            .into_iter()
            .map(|(method, entry_dex_pc, code)| JitTraceInfo {
                method,
                entry_dex_pc,
                code_begin: code.code_begin(),
                code_size: code.code_size(),
                cells: code.cells.len(),
                chained_cells: code
                    .cells
                    .iter()
                    .filter(|cell| cell.chained_to().is_some())
                    .count(),
                executions: self
                    .executions
                    .get(&(method, entry_dex_pc))
                    .copied()
                    .unwrap_or(0),
            })
            .collect();
        JitSnapshot {
            isa: self.config.isa,
            config: self.config.clone(),
            traces,
            attempts: self.attempts.clone(),
            dropped_requests: self.dropped,
            code_cache_bytes: self.cache.bytes_used(),
            stats: self.stats(),
        }
    }

    pub fn dump_text(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = String::new();
        out.push_str("trace-jit:\n");
        out.push_str(&format!("  isa: {}\n", snapshot.isa));
        out.push_str(&format!("  enabled: {}\n", snapshot.config.enabled));
        out.push_str(&format!("  hot_threshold: {}\n", snapshot.config.hot_threshold));
        out.push_str(&format!("  max_trace_len: {}\n", snapshot.config.max_trace_len));
        out.push_str(&format!("  queue_capacity: {}\n", snapshot.config.queue_capacity));
        out.push_str(&format!("  compiled traces: {}\n", snapshot.traces.len()));
        out.push_str(&format!("  compile attempts: {}\n", snapshot.attempts.len()));
        out.push_str(&format!("  dropped requests: {}\n", snapshot.dropped_requests));
        out.push_str(&format!("  code cache bytes: {}\n", snapshot.code_cache_bytes));

        for (index, trace) in snapshot.traces.iter().enumerate() {
            out.push_str(&format!(
                "  trace#{} method={} entry=0x{:04x} code=0x{:08x} size={} cells={} chained={} executions={}\n",
                index,
                trace.method.0,
                trace.entry_dex_pc,
                trace.code_begin,
                trace.code_size,
                trace.cells,
                trace.chained_cells,
                trace.executions
            ));
        }

        let mut aborted = 0usize;
        for attempt in &snapshot.attempts {
            if let Err(reason) = &attempt.result {
                aborted += 1;
                out.push_str(&format!(
                    "  abort {} {:?} reason={}\n",
                    attempt.method_name, attempt.kind, reason
                ));
            }
        }
        out.push_str(&format!("  aborted attempts: {aborted}\n"));
        out
    }

    fn absorb(&mut self, outcome: CompileOutcome) {
        self.worker_stats = outcome.stats;
        match outcome.kind {
            UnitKind::Method => {
                self.pending_methods.remove(&outcome.method);
            }
            UnitKind::Trace { entry_dex_pc } => {
                let key = (outcome.method, entry_dex_pc);
                self.pending_traces.remove(&key);
                if outcome.result.is_err() {
                    self.blocked.insert(key);
                }
            }
        }
        self.attempts.push(JitAttempt {
            method: outcome.method,
            method_name: format!("method#{}", outcome.method.0),
            kind: outcome.kind,
            result: outcome.result.map_err(|abort| abort.to_string()),
        });
    }

    fn record(
        &mut self,
        method: MethodId,
        method_name: String,
        kind: UnitKind,
        result: &CompileResult<Arc<CompiledCode>>,
    ) {
        self.attempts.push(JitAttempt {
            method,
            method_name,
            kind,
            result: result
                .as_ref()
                .map(|code| code.code_begin())
                .map_err(|abort| abort.to_string()),
        });
    }
}

impl Drop for TraceJitEngine {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.shutdown();
        }
    }
}

impl std::fmt::Debug for TraceJitEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceJitEngine")
            .field("config", &self.config)
            .field("traces", &self.table.len())
            .field("attempts", &self.attempts.len())
            .field("background", &self.worker.is_some())
            .finish()
    }
}

fn spawn_worker(
    config: &JitConfig,
    cache: &Arc<CodeCache>,
    table: &Arc<JitTable>,
) -> std::io::Result<Option<CompilerWorker>> {
    if !config.enabled || config.is_synchronous() {
        info!(isa = %config.isa, "trace jit compiles on the mutator thread");
        return Ok(None);
    }
    let worker = CompilerWorker::spawn(
        config.compiler_options(),
        config.queue_capacity,
        Arc::clone(cache),
        Arc::clone(table),
    )
    .inspect_err(|err| warn!(%err, "failed to start the compiler thread"))?;
    Ok(Some(worker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::assemble_method;
    use crate::method::MethodTable;

    const LOOP: &str = "
.method static LFoo;->count(I)I
.registers 2
.ins 1
    const/4 v0, 0
:top
    add-int/lit8 v0, v0, 1
    if-lt v0, v1, :top
    return v0
.end method
";

    fn engine(config: JitConfig) -> TraceJitEngine {
        TraceJitEngine::new(config, Arc::new(CodeCache::new()), Arc::new(JitTable::new()))
            .expect("engine")
    }

    fn sync_config(threshold: u32) -> JitConfig {
        JitConfig {
            hot_threshold: threshold,
            queue_capacity: 0,
            isa: InstructionSet::Mips,
            ..JitConfig::default()
        }
    }

    #[test]
    fn config_defaults_fill_missing_json_fields() {
        let config = JitConfig::from_json(r#"{"isa": "x86", "hot_threshold": 3}"#).expect("json");
        assert_eq!(config.isa, InstructionSet::X86);
        assert_eq!(config.hot_threshold, 3);
        assert_eq!(config.max_trace_len, JitConfig::default().max_trace_len);
        assert!(config.enabled);
        let back = JitConfig::from_json(&config.to_json()).expect("round trip");
        assert_eq!(back, config);
    }

    #[test]
    fn trace_compiles_at_the_threshold() {
        let methods = MethodTable::new();
        let method = methods.register(assemble_method(LOOP).expect("assemble"));
        let mut jit = engine(sync_config(3));
        assert!(jit.observe_hot_pc(&method, 1).is_none());
        assert!(jit.observe_hot_pc(&method, 1).is_none());
        let code = jit.observe_hot_pc(&method, 1).expect("compiled at the third arrival");
        assert_eq!(jit.attempts().len(), 1);
        let again = jit.observe_hot_pc(&method, 1).expect("cached");
        assert_eq!(again.code_begin(), code.code_begin());
        assert_eq!(jit.attempts().len(), 1);
    }

    #[test]
    fn failed_heads_are_blocked() {
        let methods = MethodTable::new();
        let method = methods.register(assemble_method(LOOP).expect("assemble"));
        let mut jit = engine(sync_config(1));
        // The return at 0x5 cannot head a trace.
        assert!(jit.observe_hot_pc(&method, 5).is_none());
        assert!(jit.is_blocked(method.id(), 5));
        assert!(jit.observe_hot_pc(&method, 5).is_none());
        assert_eq!(jit.attempts().len(), 1);
        assert!(jit.dump_text().contains("aborted attempts: 1"));
    }

    #[test]
    fn disabled_engine_observes_nothing() {
        let methods = MethodTable::new();
        let method = methods.register(assemble_method(LOOP).expect("assemble"));
        let mut jit = engine(JitConfig {
            enabled: false,
            ..sync_config(1)
        });
        assert!(jit.observe_hot_pc(&method, 1).is_none());
        assert!(jit.attempts().is_empty());
    }

    #[test]
    fn background_compiles_land_in_the_table() {
        let methods = MethodTable::new();
        let method = methods.register(assemble_method(LOOP).expect("assemble"));
        let mut jit = engine(JitConfig {
            hot_threshold: 1,
            queue_capacity: 4,
            isa: InstructionSet::X86,
            ..JitConfig::default()
        });
        assert!(jit.observe_hot_pc(&method, 1).is_none());
        assert!(jit.wait_idle(Duration::from_secs(10)));
        assert!(jit.observe_hot_pc(&method, 1).is_some());
        let snapshot = jit.snapshot();
        assert_eq!(snapshot.traces.len(), 1);
        assert_eq!(snapshot.traces[0].entry_dex_pc, 1);
        assert!(snapshot.to_json().contains("\"entry_dex_pc\": 1"));
    }

    #[test]
    fn dump_starts_with_the_header() {
        let jit = engine(sync_config(2));
        let text = jit.dump_text();
        assert!(text.starts_with("trace-jit:\n"));
        assert!(text.contains("  hot_threshold: 2\n"));
        assert!(text.contains("  compiled traces: 0\n"));
    }
}
