use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use cvm_core::VmError;

use crate::capabilities::{EmptyModuleResolver, ModuleResolver};
use crate::engine::{EngineHandle, EngineOptions};

// One live platform per process. The atomic guard turns double-initialize
// and dispose-while-engines-live into reported errors instead of
// undefined behavior.
static PLATFORM_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Library code evaluated into every session before user code runs.
/// Layers the contract-facing API over the native entry points.
pub const DEFAULT_EXECUTION_ENV: &str = r#"
fn log(message) { _native_log(message); }
fn emit(topic, payload) { _native_event(topic, payload); }
fn balance(address) { _native_balance(address) }
fn storage_get(key) { _native_storage_get(key) }
fn storage_put(key, value) { _native_storage_put(key, value); }
fn storage_del(key) { _native_storage_del(key); }
"#;

#[derive(Clone, Default)]
pub struct PlatformOptions {
    /// Module-resolution backend for `require`. Defaults to a resolver
    /// that rejects every name.
    pub modules: Option<Arc<dyn ModuleResolver>>,
    /// Override for the execution-environment prelude source.
    pub execution_env: Option<String>,
}

pub(crate) struct PlatformServices {
    pub(crate) execution_env: Arc<str>,
    pub(crate) modules: Arc<dyn ModuleResolver>,
}

/// Process-wide scripting-platform lifecycle. Engines can only be created
/// through a live platform, which encodes the initialize-before-create
/// ordering in the type system.
pub struct RuntimePlatform {
    services: Arc<PlatformServices>,
    live_engines: Arc<AtomicUsize>,
    active: bool,
}

impl std::fmt::Debug for RuntimePlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimePlatform")
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl RuntimePlatform {
    pub fn initialize(options: PlatformOptions) -> Result<Self, VmError> {
        if PLATFORM_ACTIVE.swap(true, Ordering::SeqCst) {
            return Err(VmError::new(
                "PLATFORM_ALREADY_ACTIVE",
                "The scripting platform is already initialized in this process.",
            ));
        }

        let modules = options
            .modules
            .unwrap_or_else(|| Arc::new(EmptyModuleResolver));
        let execution_env: Arc<str> = options
            .execution_env
            .unwrap_or_else(|| DEFAULT_EXECUTION_ENV.to_string())
            .into();

        Ok(Self {
            services: Arc::new(PlatformServices {
                execution_env,
                modules,
            }),
            live_engines: Arc::new(AtomicUsize::new(0)),
            active: true,
        })
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn live_engines(&self) -> usize {
        self.live_engines.load(Ordering::SeqCst)
    }

    pub fn create_engine(&self, options: EngineOptions) -> Result<EngineHandle, VmError> {
        if !self.active {
            return Err(VmError::new(
                "PLATFORM_DISPOSED",
                "Cannot create an engine on a disposed platform.",
            ));
        }
        EngineHandle::create(
            Arc::clone(&self.services),
            Arc::clone(&self.live_engines),
            options,
        )
    }

    /// Deactivates the platform. No-op when already disposed; errors while
    /// engine handles are still live.
    pub fn dispose(&mut self) -> Result<(), VmError> {
        if !self.active {
            return Ok(());
        }
        let live = self.live_engines.load(Ordering::SeqCst);
        if live != 0 {
            return Err(VmError::new(
                "PLATFORM_ENGINES_LIVE",
                format!("Cannot dispose the platform while {} engine(s) are live.", live),
            ));
        }
        self.active = false;
        PLATFORM_ACTIVE.store(false, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for RuntimePlatform {
    fn drop(&mut self) {
        // Last-resort release so a leaked platform does not wedge the
        // process guard. The checked path is dispose().
        if self.active {
            self.active = false;
            PLATFORM_ACTIVE.store(false, Ordering::SeqCst);
        }
    }
}
