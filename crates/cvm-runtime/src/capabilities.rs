use std::collections::BTreeMap;

use cvm_core::{ContractValue, VmError};

/// Account storage backend. Key and value bytes cross this boundary
/// exactly as the script supplied them.
pub trait StorageProvider: Send + Sync {
    fn balance(&self, address: &str) -> Result<String, VmError>;
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, VmError>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), VmError>;
    fn del(&self, key: &[u8]) -> Result<(), VmError>;
}

/// Collector for log records emitted by sandboxed scripts.
pub trait LogSink: Send + Sync {
    fn log(&self, record: &str);
}

/// Receiver for generic events raised by sandboxed scripts.
pub trait EventEmitter: Send + Sync {
    fn emit(&self, topic: &str, payload: ContractValue) -> Result<(), VmError>;
}

/// Supplies source text for `require(name)` calls.
pub trait ModuleResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Result<String, VmError>;
}

#[derive(Debug, Default)]
pub struct EmptyModuleResolver;

impl ModuleResolver for EmptyModuleResolver {
    fn resolve(&self, name: &str) -> Result<String, VmError> {
        Err(VmError::new(
            "REQUIRE_MODULE_NOT_FOUND",
            format!("Module \"{}\" is not registered.", name),
        ))
    }
}

/// In-memory module library keyed by module name.
#[derive(Debug, Default)]
pub struct StaticModuleResolver {
    sources: BTreeMap<String, String>,
}

impl StaticModuleResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, source: impl Into<String>) {
        self.sources.insert(name.into(), source.into());
    }
}

impl ModuleResolver for StaticModuleResolver {
    fn resolve(&self, name: &str) -> Result<String, VmError> {
        self.sources.get(name).cloned().ok_or_else(|| {
            VmError::new(
                "REQUIRE_MODULE_NOT_FOUND",
                format!("Module \"{}\" is not registered.", name),
            )
        })
    }
}
