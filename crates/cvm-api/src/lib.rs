pub use cvm_core::{value_to_text, ContractValue, VmError};
pub use cvm_runtime::{
    ArenaAllocator, CapabilityBridgeSet, EmptyModuleResolver, EngineHandle, EngineOptions,
    EventEmitter, FailureKind, LogSink, ModuleResolver, PlatformOptions, RunOutcome,
    RuntimePlatform, StaticModuleResolver, StorageProvider, TerminationToken,
    DEFAULT_EXECUTION_ENV,
};

#[derive(Clone)]
pub struct RunSingleScriptOptions {
    pub source: String,
    pub bridges: CapabilityBridgeSet,
    pub platform: PlatformOptions,
    pub engine: EngineOptions,
}

/// Full lifecycle for one script: initialize the platform, create an
/// engine, run the source, tear everything down. Hosts running many
/// scripts should drive [`RuntimePlatform`] directly instead.
pub fn run_single_script(options: RunSingleScriptOptions) -> Result<RunOutcome, VmError> {
    let mut platform = RuntimePlatform::initialize(options.platform)?;
    let mut engine = platform.create_engine(options.engine)?;
    let outcome = engine.run_script_source(&options.source, options.bridges);
    drop(engine);
    platform.dispose()?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

    use super::*;

    fn platform_lock() -> MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[derive(Default)]
    struct NullStorage;

    impl StorageProvider for NullStorage {
        fn balance(&self, _address: &str) -> Result<String, VmError> {
            Ok("0".to_string())
        }

        fn get(&self, _key: &[u8]) -> Result<Option<Vec<u8>>, VmError> {
            Ok(None)
        }

        fn put(&self, _key: &[u8], _value: &[u8]) -> Result<(), VmError> {
            Ok(())
        }

        fn del(&self, _key: &[u8]) -> Result<(), VmError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CollectingLog {
        records: Mutex<Vec<String>>,
    }

    impl LogSink for CollectingLog {
        fn log(&self, record: &str) {
            self.records
                .lock()
                .expect("records lock should not be poisoned")
                .push(record.to_string());
        }
    }

    #[derive(Default)]
    struct NullEvents;

    impl EventEmitter for NullEvents {
        fn emit(&self, _topic: &str, _payload: ContractValue) -> Result<(), VmError> {
            Ok(())
        }
    }

    fn bridges(log: &Arc<CollectingLog>) -> CapabilityBridgeSet {
        CapabilityBridgeSet {
            storage: Arc::new(NullStorage),
            log: Arc::clone(log) as Arc<dyn LogSink>,
            events: Arc::new(NullEvents),
        }
    }

    #[test]
    fn one_shot_run_reports_the_result_text() {
        let _guard = platform_lock();
        let log = Arc::new(CollectingLog::default());
        let outcome = run_single_script(RunSingleScriptOptions {
            source: "1+1".to_string(),
            bridges: bridges(&log),
            platform: PlatformOptions::default(),
            engine: EngineOptions::default(),
        })
        .expect("run should pass");
        assert_eq!(outcome.status_code(), 0);
        assert_eq!(
            outcome,
            RunOutcome::Success {
                value: Some("2".to_string())
            }
        );
    }

    #[test]
    fn one_shot_run_surfaces_compile_failures() {
        let _guard = platform_lock();
        let log = Arc::new(CollectingLog::default());
        let outcome = run_single_script(RunSingleScriptOptions {
            source: "let x = ;".to_string(),
            bridges: bridges(&log),
            platform: PlatformOptions::default(),
            engine: EngineOptions::default(),
        })
        .expect("lifecycle should pass even when the script fails");
        assert!(matches!(
            outcome,
            RunOutcome::Failure {
                kind: FailureKind::Compile,
                ..
            }
        ));
    }

    #[test]
    fn one_shot_run_forwards_log_records() {
        let _guard = platform_lock();
        let log = Arc::new(CollectingLog::default());
        let outcome = run_single_script(RunSingleScriptOptions {
            source: r#"log("hello");"#.to_string(),
            bridges: bridges(&log),
            platform: PlatformOptions::default(),
            engine: EngineOptions::default(),
        })
        .expect("run should pass");
        assert_eq!(outcome.status_code(), 0);
        assert_eq!(
            *log.records
                .lock()
                .expect("records lock should not be poisoned"),
            vec!["hello".to_string()]
        );
    }

    #[test]
    fn lifecycle_can_repeat_after_teardown() {
        let _guard = platform_lock();
        for _ in 0..2 {
            let log = Arc::new(CollectingLog::default());
            let outcome = run_single_script(RunSingleScriptOptions {
                source: "40 + 2".to_string(),
                bridges: bridges(&log),
                platform: PlatformOptions::default(),
                engine: EngineOptions::default(),
            })
            .expect("repeat run should pass");
            assert_eq!(outcome.status_code(), 0);
        }
    }
}
