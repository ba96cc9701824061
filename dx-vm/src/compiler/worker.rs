//! Background compiler thread.
//!
//! Requests go through a bounded queue; when it is full the request is dropped and the
//! interpreter keeps running the code. The thread owns its [`CompilerDriver`], so arena and
//! compilation state never leave it. Finished traces are published into the [`JitTable`],
//! finished methods on the method itself.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, unbounded};
use tracing::{debug, error, info, warn};

use crate::compiler::CompileAbort;
use crate::compiler::code_cache::{CodeCache, JitTable};
use crate::compiler::driver::{CompileStats, CompilerDriver, CompilerOptions, UnitKind};
use crate::method::{Method, MethodId};

#[derive(Clone, Debug)]
pub struct CompileRequest {
    pub method: Arc<Method>,
    pub kind: UnitKind,
}

impl CompileRequest {
    pub fn method(method: Arc<Method>) -> Self {
        Self {
            method,
            kind: UnitKind::Method,
        }
    }

    pub fn trace(method: Arc<Method>, entry_dex_pc: u32) -> Self {
        Self {
            method,
            kind: UnitKind::Trace { entry_dex_pc },
        }
    }
}

/// Result of one request, reported after publication.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompileOutcome {
    pub method: MethodId,
    pub kind: UnitKind,
    /// Entry address of the published code.
    pub result: Result<u32, CompileAbort>,
    pub stats: CompileStats,
}

pub struct CompilerWorker {
    sender: Option<Sender<CompileRequest>>,
    outcomes: Receiver<CompileOutcome>,
    handle: Option<JoinHandle<()>>,
    capacity: usize,
}

impl CompilerWorker {
    pub fn spawn(
        options: CompilerOptions,
        capacity: usize,
        cache: Arc<CodeCache>,
        table: Arc<JitTable>,
    ) -> std::io::Result<Self> {
        let capacity = capacity.max(1);
        let (sender, requests) = bounded::<CompileRequest>(capacity);
        let (report, outcomes) = unbounded();
        let handle = std::thread::Builder::new()
            .name("dx-jit-compiler".to_string())
            .spawn(move || {
                let mut driver = CompilerDriver::new(options, cache);
                info!(isa = %options.isa, capacity, "compiler thread started");
                for request in requests.iter() {
                    let outcome = run_request(&mut driver, &table, request);
                    if report.send(outcome).is_err() {
                        debug!("no listener for compile outcomes");
                    }
                }
                info!(stats = ?driver.stats(), "compiler thread stopped");
            })?;
        Ok(Self {
            sender: Some(sender),
            outcomes,
            handle: Some(handle),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queues a request; returns false when it was dropped.
    pub fn submit(&self, request: CompileRequest) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };
        match sender.try_send(request) {
            Ok(()) => true,
            Err(TrySendError::Full(request)) => {
                warn!(
                    method = %request.method.pretty_name(),
                    kind = ?request.kind,
                    capacity = self.capacity,
                    "compile queue full, dropping request"
                );
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                error!("compiler thread is gone");
                false
            }
        }
    }

    /// Outcomes in completion order.
    pub fn outcomes(&self) -> &Receiver<CompileOutcome> {
        &self.outcomes
    }

    /// Stops accepting requests, finishes the queued ones and joins the thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("compiler thread panicked");
            }
        }
    }
}

impl Drop for CompilerWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_request(driver: &mut CompilerDriver, table: &JitTable, request: CompileRequest) -> CompileOutcome {
    let method = &request.method;
    let result = match request.kind {
        UnitKind::Method => driver.compile_method(method).map(|code| code.code_begin()),
        UnitKind::Trace { entry_dex_pc } => driver
            .compile_trace(method, entry_dex_pc)
            .map(|code| {
                let entry = code.code_begin();
                if !table.publish(method.id(), entry_dex_pc, code) {
                    debug!(entry_dex_pc, "trace already in the jit table");
                }
                entry
            }),
    };
    CompileOutcome {
        method: method.id(),
        kind: request.kind,
        result,
        stats: driver.stats(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::assembler::assemble_method;
    use crate::isa::InstructionSet;
    use crate::method::MethodTable;

    const LOOP: &str = "
.method static LFoo;->spin(I)I
.registers 2
.ins 1
    const/4 v0, 0
:top
    add-int/lit8 v0, v0, 1
    if-lt v0, v1, :top
    return v0
.end method
";

    #[test]
    fn traces_and_methods_are_published_from_the_worker() {
        let table = MethodTable::new();
        let method = table.register(assemble_method(LOOP).expect("assemble"));
        let jit = Arc::new(JitTable::new());
        let worker = CompilerWorker::spawn(
            CompilerOptions {
                isa: InstructionSet::Mips,
                ..CompilerOptions::default()
            },
            4,
            Arc::new(CodeCache::new()),
            Arc::clone(&jit),
        )
        .expect("spawn");
        assert!(worker.submit(CompileRequest::trace(Arc::clone(&method), 1)));
        assert!(worker.submit(CompileRequest::method(Arc::clone(&method))));
        for _ in 0..2 {
            let outcome = worker
                .outcomes()
                .recv_timeout(Duration::from_secs(10))
                .expect("outcome");
            assert!(outcome.result.is_ok(), "{outcome:?}");
        }
        assert!(jit.lookup(method.id(), 1).is_some());
        assert!(method.compiled().is_some());
        worker.shutdown();
    }

    #[test]
    fn a_shut_down_worker_drops_requests() {
        let table = MethodTable::new();
        let method = table.register(assemble_method(LOOP).expect("assemble"));
        let mut worker = CompilerWorker::spawn(
            CompilerOptions::default(),
            1,
            Arc::new(CodeCache::new()),
            Arc::new(JitTable::new()),
        )
        .expect("spawn");
        worker.stop();
        assert!(!worker.submit(CompileRequest::method(method)));
    }
}
