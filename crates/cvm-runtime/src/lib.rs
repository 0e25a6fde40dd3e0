mod helpers;

pub mod capabilities;
pub mod engine;
pub mod platform;
pub mod session;

#[cfg(test)]
pub(crate) mod test_support;

pub use capabilities::{
    EmptyModuleResolver, EventEmitter, LogSink, ModuleResolver, StaticModuleResolver,
    StorageProvider,
};
pub use engine::{ArenaAllocator, EngineHandle, EngineOptions, TerminationToken};
pub use platform::{PlatformOptions, RuntimePlatform, DEFAULT_EXECUTION_ENV};
pub use session::{CapabilityBridgeSet, FailureKind, RunOutcome};
