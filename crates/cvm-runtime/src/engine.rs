use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use cvm_core::VmError;
use regex::Regex;
use rhai::{Dynamic, Engine, EvalAltResult, ImmutableString, NativeCallContext};

use crate::capabilities::ModuleResolver;
use crate::helpers::rhai_bridge::{
    dynamic_to_contract_value, forward_vm_error, script_error,
};
use crate::platform::PlatformServices;
use crate::session::CapabilityBridgeSet;

/// Byte accounting for buffers marshalled across the sandbox boundary.
/// Every live [`ArenaBuffer`] is counted; the total must return to zero
/// before the allocator is released.
#[derive(Debug, Default)]
pub struct ArenaAllocator {
    live_bytes: AtomicUsize,
}

impl ArenaAllocator {
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::SeqCst)
    }

    pub(crate) fn allocate(self: &Arc<Self>, bytes: &[u8]) -> ArenaBuffer {
        self.live_bytes.fetch_add(bytes.len(), Ordering::SeqCst);
        ArenaBuffer {
            bytes: bytes.to_vec(),
            arena: Arc::clone(self),
        }
    }
}

pub(crate) struct ArenaBuffer {
    bytes: Vec<u8>,
    arena: Arc<ArenaAllocator>,
}

impl ArenaBuffer {
    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl Drop for ArenaBuffer {
    fn drop(&mut self) {
        self.arena
            .live_bytes
            .fetch_sub(self.bytes.len(), Ordering::SeqCst);
    }
}

/// Sandbox resource limits for one engine. Size limits must be nonzero;
/// `max_operations == 0` leaves script progress unbounded.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub max_call_levels: usize,
    pub max_expr_depth: usize,
    pub max_function_expr_depth: usize,
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
    pub max_operations: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_call_levels: 64,
            max_expr_depth: 64,
            max_function_expr_depth: 32,
            max_string_size: 10 * 1024 * 1024,
            max_array_size: 1_000_000,
            max_map_size: 1_000_000,
            max_operations: 0,
        }
    }
}

impl EngineOptions {
    fn validate(&self) -> Result<(), VmError> {
        let sized = [
            self.max_call_levels,
            self.max_expr_depth,
            self.max_function_expr_depth,
            self.max_string_size,
            self.max_array_size,
            self.max_map_size,
        ];
        if sized.iter().any(|limit| *limit == 0) {
            return Err(VmError::new(
                "ENGINE_LIMITS_INVALID",
                "Engine size limits must be nonzero.",
            ));
        }
        Ok(())
    }
}

/// Cross-thread interrupt for a running script. The engine's progress
/// hook observes the flag and aborts execution at the next check point.
#[derive(Debug, Clone)]
pub struct TerminationToken {
    flag: Arc<AtomicBool>,
}

impl TerminationToken {
    pub fn terminate(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_terminated(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

static MODULE_NAME_RE: OnceLock<Regex> = OnceLock::new();

pub(crate) fn module_name_is_valid(name: &str) -> bool {
    let pattern = MODULE_NAME_RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_./-]*$").expect("module name regex should compile")
    });
    pattern.is_match(name) && !name.contains("..")
}

pub(crate) type BridgeSlot = Rc<RefCell<Option<CapabilityBridgeSet>>>;
pub(crate) type ModuleCache = Rc<RefCell<BTreeMap<String, Dynamic>>>;

fn bound_bridges(slot: &BridgeSlot) -> Result<CapabilityBridgeSet, Box<EvalAltResult>> {
    slot.borrow().clone().ok_or_else(|| {
        script_error(
            "SESSION_BRIDGE_UNBOUND",
            "Native entry point called outside a script session.",
        )
    })
}

/// The isolate: one configured Rhai engine plus the per-engine state its
/// native entry points read through. Bridges are installed per session
/// into the shared slot and cleared again on every exit path.
pub(crate) struct ScriptHeap {
    engine: Engine,
    bridges: BridgeSlot,
    module_cache: ModuleCache,
    terminate: Arc<AtomicBool>,
    execution_env: Arc<str>,
}

impl ScriptHeap {
    fn create(
        services: &PlatformServices,
        allocator: Arc<ArenaAllocator>,
        options: &EngineOptions,
    ) -> Self {
        let bridges: BridgeSlot = Rc::new(RefCell::new(None));
        let module_cache: ModuleCache = Rc::new(RefCell::new(BTreeMap::new()));
        let terminate = Arc::new(AtomicBool::new(false));

        let engine = build_sandbox_engine(
            options,
            allocator,
            Arc::clone(&services.modules),
            Rc::clone(&bridges),
            Rc::clone(&module_cache),
            Arc::clone(&terminate),
        );

        Self {
            engine,
            bridges,
            module_cache,
            terminate,
            execution_env: Arc::clone(&services.execution_env),
        }
    }

    pub(crate) fn engine(&self) -> &Engine {
        &self.engine
    }

    pub(crate) fn bridges(&self) -> &BridgeSlot {
        &self.bridges
    }

    pub(crate) fn module_cache(&self) -> &ModuleCache {
        &self.module_cache
    }

    pub(crate) fn terminate_flag(&self) -> &Arc<AtomicBool> {
        &self.terminate
    }

    pub(crate) fn execution_env(&self) -> &str {
        &self.execution_env
    }
}

fn build_sandbox_engine(
    options: &EngineOptions,
    allocator: Arc<ArenaAllocator>,
    modules: Arc<dyn ModuleResolver>,
    bridges: BridgeSlot,
    module_cache: ModuleCache,
    terminate: Arc<AtomicBool>,
) -> Engine {
    let mut engine = Engine::new();
    engine.set_strict_variables(true);
    engine.set_max_call_levels(options.max_call_levels);
    engine.set_max_expr_depths(options.max_expr_depth, options.max_function_expr_depth);
    engine.set_max_string_size(options.max_string_size);
    engine.set_max_array_size(options.max_array_size);
    engine.set_max_map_size(options.max_map_size);
    engine.set_max_operations(options.max_operations);

    let flag = Arc::clone(&terminate);
    engine.on_progress(move |_operations| {
        if flag.load(Ordering::SeqCst) {
            Some(Dynamic::from("session terminated by host"))
        } else {
            None
        }
    });

    let slot = Rc::clone(&bridges);
    engine.register_fn(
        "_native_log",
        move |message: ImmutableString| -> Result<(), Box<EvalAltResult>> {
            let bound = bound_bridges(&slot)?;
            bound.log.log(message.as_str());
            Ok(())
        },
    );

    let slot = Rc::clone(&bridges);
    engine.register_fn(
        "_native_event",
        move |topic: ImmutableString, payload: Dynamic| {
            let bound = bound_bridges(&slot)?;
            let payload = dynamic_to_contract_value(payload)?;
            bound
                .events
                .emit(topic.as_str(), payload)
                .map_err(forward_vm_error)
        },
    );

    let slot = Rc::clone(&bridges);
    engine.register_fn(
        "_native_balance",
        move |address: ImmutableString| -> Result<ImmutableString, Box<EvalAltResult>> {
            let bound = bound_bridges(&slot)?;
            let balance = bound
                .storage
                .balance(address.as_str())
                .map_err(forward_vm_error)?;
            Ok(balance.into())
        },
    );

    let slot = Rc::clone(&bridges);
    let arena = Arc::clone(&allocator);
    engine.register_fn(
        "_native_storage_get",
        move |key: ImmutableString| -> Result<Dynamic, Box<EvalAltResult>> {
            let bound = bound_bridges(&slot)?;
            let found = bound
                .storage
                .get(key.as_bytes())
                .map_err(forward_vm_error)?;
            let Some(bytes) = found else {
                return Ok(Dynamic::UNIT);
            };
            let buffer = arena.allocate(&bytes);
            let text = std::str::from_utf8(buffer.as_slice())
                .map_err(|_| {
                    script_error(
                        "STORAGE_VALUE_UTF8",
                        format!("Stored value under \"{}\" is not valid UTF-8.", key),
                    )
                })?
                .to_string();
            Ok(Dynamic::from(text))
        },
    );

    let slot = Rc::clone(&bridges);
    let arena = Arc::clone(&allocator);
    engine.register_fn(
        "_native_storage_put",
        move |key: ImmutableString, value: ImmutableString| {
            let bound = bound_bridges(&slot)?;
            let buffer = arena.allocate(value.as_bytes());
            bound
                .storage
                .put(key.as_bytes(), buffer.as_slice())
                .map_err(forward_vm_error)
        },
    );

    let slot = Rc::clone(&bridges);
    engine.register_fn(
        "_native_storage_del",
        move |key: ImmutableString| -> Result<(), Box<EvalAltResult>> {
            let bound = bound_bridges(&slot)?;
            bound.storage.del(key.as_bytes()).map_err(forward_vm_error)
        },
    );

    let cache = Rc::clone(&module_cache);
    engine.register_fn(
        "require",
        move |context: NativeCallContext,
              name: ImmutableString|
              -> Result<Dynamic, Box<EvalAltResult>> {
            if !module_name_is_valid(name.as_str()) {
                return Err(script_error(
                    "REQUIRE_MODULE_NAME",
                    format!("Module name \"{}\" is not allowed.", name),
                ));
            }
            if let Some(found) = cache.borrow().get(name.as_str()) {
                return Ok(found.clone());
            }
            let source = modules.resolve(name.as_str()).map_err(forward_vm_error)?;
            let export = context
                .engine()
                .eval::<Dynamic>(&source)
                .map_err(|error| {
                    script_error(
                        "REQUIRE_MODULE_EVAL",
                        format!("Module \"{}\" failed to evaluate: {}", name, error),
                    )
                })?;
            cache
                .borrow_mut()
                .insert(name.to_string(), export.clone());
            Ok(export)
        },
    );

    engine
}

struct EngineRegistration {
    live_engines: Arc<AtomicUsize>,
}

impl EngineRegistration {
    fn new(live_engines: Arc<AtomicUsize>) -> Self {
        live_engines.fetch_add(1, Ordering::SeqCst);
        Self { live_engines }
    }
}

impl Drop for EngineRegistration {
    fn drop(&mut self) {
        self.live_engines.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One isolated execution arena. Dropping the handle is `DeleteEngine`:
/// the heap field is declared before the allocator so the engine (and the
/// native closures holding arena references) is disposed first.
pub struct EngineHandle {
    heap: ScriptHeap,
    allocator: Arc<ArenaAllocator>,
    _registration: EngineRegistration,
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle").finish_non_exhaustive()
    }
}

impl EngineHandle {
    pub(crate) fn create(
        services: Arc<PlatformServices>,
        live_engines: Arc<AtomicUsize>,
        options: EngineOptions,
    ) -> Result<Self, VmError> {
        options.validate()?;
        let allocator = Arc::new(ArenaAllocator::default());
        let heap = ScriptHeap::create(&services, Arc::clone(&allocator), &options);
        Ok(Self {
            heap,
            allocator,
            _registration: EngineRegistration::new(live_engines),
        })
    }

    pub(crate) fn heap(&self) -> &ScriptHeap {
        &self.heap
    }

    /// Arena handle for observing buffer accounting from the host side.
    pub fn arena(&self) -> Arc<ArenaAllocator> {
        Arc::clone(&self.allocator)
    }

    /// Token a supervising thread can use to abort the running session.
    pub fn termination_token(&self) -> TerminationToken {
        TerminationToken {
            flag: Arc::clone(&self.heap.terminate),
        }
    }
}
