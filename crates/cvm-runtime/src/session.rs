use std::sync::atomic::Ordering;
use std::sync::Arc;

use rhai::{Dynamic, EvalAltResult, Scope, AST};

use crate::capabilities::{EventEmitter, LogSink, StorageProvider};
use crate::engine::{EngineHandle, ScriptHeap};
use crate::helpers::rhai_bridge::dynamic_to_output_text;

/// The three host-supplied handlers a session forwards sandbox calls to.
/// The session never retains them past its own teardown.
#[derive(Clone)]
pub struct CapabilityBridgeSet {
    pub storage: Arc<dyn StorageProvider>,
    pub log: Arc<dyn LogSink>,
    pub events: Arc<dyn EventEmitter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The execution-environment prelude failed before user code compiled.
    EnvironmentSetup,
    /// The supplied source text did not parse.
    Compile,
    /// User code raised an uncaught exception.
    Runtime,
    /// The host tripped the termination token or the operation ceiling.
    Terminated,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Success { value: Option<String> },
    Failure { kind: FailureKind, diagnostic: String },
}

impl RunOutcome {
    /// 0 = success, 1 = failure. No other status codes exist.
    pub fn status_code(&self) -> i32 {
        match self {
            Self::Success { .. } => 0,
            Self::Failure { .. } => 1,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

impl EngineHandle {
    /// Runs one script in a fresh sandboxed context: injects the
    /// capability bridges, evaluates the execution environment, compiles
    /// and runs the source, and tears everything down before returning.
    pub fn run_script_source(
        &mut self,
        source: &str,
        bridges: CapabilityBridgeSet,
    ) -> RunOutcome {
        ScriptExecutionSession::open(self.heap(), bridges).run(source)
    }
}

// Installs the bridge set into the heap's slot and guarantees it is
// cleared again on every exit path, early failures included.
struct BridgeScope<'h> {
    heap: &'h ScriptHeap,
}

impl<'h> BridgeScope<'h> {
    fn install(heap: &'h ScriptHeap, bridges: CapabilityBridgeSet) -> Self {
        *heap.bridges().borrow_mut() = Some(bridges);
        heap.module_cache().borrow_mut().clear();
        // Re-arm the interrupt so a terminated session cannot poison the
        // next one.
        heap.terminate_flag().store(false, Ordering::SeqCst);
        Self { heap }
    }
}

impl Drop for BridgeScope<'_> {
    fn drop(&mut self) {
        *self.heap.bridges().borrow_mut() = None;
        self.heap.module_cache().borrow_mut().clear();
    }
}

struct ScriptExecutionSession<'h> {
    heap: &'h ScriptHeap,
    scope: Scope<'static>,
    _bridges: BridgeScope<'h>,
}

impl<'h> ScriptExecutionSession<'h> {
    fn open(heap: &'h ScriptHeap, bridges: CapabilityBridgeSet) -> Self {
        Self {
            heap,
            scope: Scope::new(),
            _bridges: BridgeScope::install(heap, bridges),
        }
    }

    fn run(mut self, source: &str) -> RunOutcome {
        let library = match self.setup_execution_env() {
            Ok(library) => library,
            Err(outcome) => return outcome,
        };

        let user_ast = match self.heap.engine().compile(source) {
            Ok(ast) => ast,
            Err(error) => {
                return RunOutcome::Failure {
                    kind: FailureKind::Compile,
                    diagnostic: error.to_string(),
                }
            }
        };

        let combined = library.merge(&user_ast);
        let result = self
            .heap
            .engine()
            .eval_ast_with_scope::<Dynamic>(&mut self.scope, &combined);

        match result {
            Ok(value) if value.is_unit() => RunOutcome::Success { value: None },
            Ok(value) => RunOutcome::Success {
                value: Some(dynamic_to_output_text(&value)),
            },
            Err(error) => failure_from_eval(*error),
        }
    }

    // Compiles and runs the prelude, then keeps only its functions as the
    // library merged ahead of user code. Any failure here is an
    // environment failure, distinct from user-code failures.
    fn setup_execution_env(&mut self) -> Result<AST, RunOutcome> {
        let engine = self.heap.engine();
        let prelude = engine
            .compile(self.heap.execution_env())
            .map_err(|error| RunOutcome::Failure {
                kind: FailureKind::EnvironmentSetup,
                diagnostic: format!("execution env compile failed: {}", error),
            })?;
        engine
            .run_ast_with_scope(&mut self.scope, &prelude)
            .map_err(|error| RunOutcome::Failure {
                kind: FailureKind::EnvironmentSetup,
                diagnostic: format!("execution env eval failed: {}", error),
            })?;
        Ok(prelude.clone_functions_only())
    }
}

fn failure_from_eval(error: EvalAltResult) -> RunOutcome {
    match error {
        EvalAltResult::ErrorTerminated(token, _) => RunOutcome::Failure {
            kind: FailureKind::Terminated,
            diagnostic: token.to_string(),
        },
        EvalAltResult::ErrorTooManyOperations(_) => RunOutcome::Failure {
            kind: FailureKind::Terminated,
            diagnostic: "operation ceiling exceeded".to_string(),
        },
        other => RunOutcome::Failure {
            kind: FailureKind::Runtime,
            diagnostic: other.to_string(),
        },
    }
}
