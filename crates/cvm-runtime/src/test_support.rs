use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use cvm_core::{ContractValue, VmError};

use crate::capabilities::{EventEmitter, LogSink, StorageProvider};
use crate::session::CapabilityBridgeSet;

// The platform guard is genuinely process-global, so platform-touching
// tests serialize on this lock.
pub(crate) fn platform_lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
pub(crate) struct MemoryStorage {
    cells: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    balances: Mutex<BTreeMap<String, String>>,
    calls: AtomicUsize,
}

impl MemoryStorage {
    pub(crate) fn cell(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.cells
            .lock()
            .expect("cells lock should not be poisoned")
            .get(key)
            .cloned()
    }

    pub(crate) fn set_balance(&self, address: &str, balance: &str) {
        self.balances
            .lock()
            .expect("balances lock should not be poisoned")
            .insert(address.to_string(), balance.to_string());
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl StorageProvider for MemoryStorage {
    fn balance(&self, address: &str) -> Result<String, VmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.balances
            .lock()
            .expect("balances lock should not be poisoned")
            .get(address)
            .cloned()
            .ok_or_else(|| {
                VmError::new(
                    "STORAGE_ACCOUNT_UNKNOWN",
                    format!("No account \"{}\".", address),
                )
            })
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, VmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.cell(key))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), VmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.cells
            .lock()
            .expect("cells lock should not be poisoned")
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn del(&self, key: &[u8]) -> Result<(), VmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.cells
            .lock()
            .expect("cells lock should not be poisoned")
            .remove(key);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct RecordingLog {
    records: Mutex<Vec<String>>,
}

impl RecordingLog {
    pub(crate) fn records(&self) -> Vec<String> {
        self.records
            .lock()
            .expect("records lock should not be poisoned")
            .clone()
    }
}

impl LogSink for RecordingLog {
    fn log(&self, record: &str) {
        self.records
            .lock()
            .expect("records lock should not be poisoned")
            .push(record.to_string());
    }
}

#[derive(Default)]
pub(crate) struct RecordingEvents {
    events: Mutex<Vec<(String, ContractValue)>>,
}

impl RecordingEvents {
    pub(crate) fn events(&self) -> Vec<(String, ContractValue)> {
        self.events
            .lock()
            .expect("events lock should not be poisoned")
            .clone()
    }
}

impl EventEmitter for RecordingEvents {
    fn emit(&self, topic: &str, payload: ContractValue) -> Result<(), VmError> {
        self.events
            .lock()
            .expect("events lock should not be poisoned")
            .push((topic.to_string(), payload));
        Ok(())
    }
}

pub(crate) struct TestBridges {
    pub(crate) storage: Arc<MemoryStorage>,
    pub(crate) log: Arc<RecordingLog>,
    pub(crate) events: Arc<RecordingEvents>,
}

impl TestBridges {
    pub(crate) fn new() -> Self {
        Self {
            storage: Arc::new(MemoryStorage::default()),
            log: Arc::new(RecordingLog::default()),
            events: Arc::new(RecordingEvents::default()),
        }
    }

    pub(crate) fn set(&self) -> CapabilityBridgeSet {
        CapabilityBridgeSet {
            storage: Arc::clone(&self.storage) as Arc<dyn StorageProvider>,
            log: Arc::clone(&self.log) as Arc<dyn LogSink>,
            events: Arc::clone(&self.events) as Arc<dyn EventEmitter>,
        }
    }

    pub(crate) fn callback_count(&self) -> usize {
        self.storage.calls() + self.log.records().len() + self.events.events().len()
    }
}
