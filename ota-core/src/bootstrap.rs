//! Execution bootstrap: load the committed binary into an embedded Wasmtime interpreter and
//! resolve the fixed entry function.
//!
//! The steps run strictly in order (load, environment, runtime, parse, attach, resolve) and each
//! failure names its stage. Callers treat any failure, including a failed call, as fatal for the
//! boot cycle: mark the record invalid and restart (see `core`).

use std::fmt;

use wasmtime::{Engine, Instance, Module, Store, StoreLimits, StoreLimitsBuilder, TypedFunc};

use crate::config::ExecutionConfig;
use crate::integrity::PayloadDigest;
use crate::protocol::ENTRY_FUNCTION;
use crate::storage::PayloadStore;

/// Bootstrap step, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootStage {
    Load,
    Environment,
    Runtime,
    Parse,
    Attach,
    Resolve,
    Call,
}

impl fmt::Display for BootStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BootStage::Load => "load",
            BootStage::Environment => "environment",
            BootStage::Runtime => "runtime",
            BootStage::Parse => "parse",
            BootStage::Attach => "attach",
            BootStage::Resolve => "resolve",
            BootStage::Call => "call",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("wasm {stage} failed: {cause}")]
pub struct BootstrapError {
    pub stage: BootStage,
    pub cause: String,
}

impl BootstrapError {
    fn at(stage: BootStage) -> impl FnOnce(wasmtime::Error) -> BootstrapError {
        move |e| BootstrapError {
            stage,
            cause: format!("{:#}", e),
        }
    }
}

/// Host data carried by the runtime.
struct RuntimeState {
    limits: StoreLimits,
}

/// Interpreter runtime (which keeps its engine and instantiated module alive) and the resolved
/// `calcWasm`, owned together.
pub struct ExecutionContext {
    store: Store<RuntimeState>,
    entry: TypedFunc<(i32, i32), i32>,
    fuel_per_call: u64,
    version: u8,
    digest: PayloadDigest,
}

impl ExecutionContext {
    /// Read the payload slot and boot it.
    pub fn load<P: PayloadStore>(
        payload: &P,
        version: u8,
        config: &ExecutionConfig,
    ) -> Result<Self, BootstrapError> {
        let bytes = payload.read_all().map_err(|e| BootstrapError {
            stage: BootStage::Load,
            cause: e.to_string(),
        })?;
        if bytes.is_empty() {
            return Err(BootstrapError {
                stage: BootStage::Load,
                cause: "payload slot is empty".into(),
            });
        }
        Self::from_bytes(&bytes, version, config)
    }

    /// Boot an in-memory binary.
    pub fn from_bytes(
        bytes: &[u8],
        version: u8,
        config: &ExecutionConfig,
    ) -> Result<Self, BootstrapError> {
        let digest = PayloadDigest::of(bytes);
        tracing::info!(
            version,
            size = bytes.len(),
            digest = %digest.short(),
            "loading wasm payload"
        );

        let mut engine_config = wasmtime::Config::new();
        engine_config.consume_fuel(true);
        engine_config.max_wasm_stack(config.max_stack_bytes);
        let engine = Engine::new(&engine_config).map_err(BootstrapError::at(BootStage::Environment))?;

        let limits = StoreLimitsBuilder::new()
            .memory_size(config.max_memory_bytes)
            .instances(1)
            .memories(1)
            .tables(1)
            .build();
        let mut store = Store::new(&engine, RuntimeState { limits });
        store.limiter(|state| &mut state.limits);
        store
            .set_fuel(config.fuel_per_call)
            .map_err(BootstrapError::at(BootStage::Runtime))?;

        let module = Module::new(&engine, bytes).map_err(BootstrapError::at(BootStage::Parse))?;
        // No host functions are linked; a module with imports cannot be attached.
        let instance =
            Instance::new(&mut store, &module, &[]).map_err(BootstrapError::at(BootStage::Attach))?;
        let entry = instance
            .get_typed_func::<(i32, i32), i32>(&mut store, ENTRY_FUNCTION)
            .map_err(BootstrapError::at(BootStage::Resolve))?;

        tracing::info!(version, entry = ENTRY_FUNCTION, "wasm payload ready");
        Ok(Self {
            store,
            entry,
            fuel_per_call: config.fuel_per_call,
            version,
            digest,
        })
    }

    /// Call `calcWasm(a, b)`. Fuel is reset before every call so repeated calls behave the same.
    pub fn invoke(&mut self, a: u8, b: u8) -> Result<i32, BootstrapError> {
        self.store
            .set_fuel(self.fuel_per_call)
            .map_err(BootstrapError::at(BootStage::Call))?;
        self.entry
            .call(&mut self.store, (i32::from(a), i32::from(b)))
            .map_err(BootstrapError::at(BootStage::Call))
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn digest(&self) -> PayloadDigest {
        self.digest
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("version", &self.version)
            .field("digest", &self.digest)
            .field("fuel_per_call", &self.fuel_per_call)
            .finish()
    }
}
