// SPDX-FileCopyrightText: 2026 Plugdesk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! WebAssembly guest runtime using wasmtime.
//!
//! One [`Engine`] is shared by every plugin; each plugin gets its own
//! [`Store`] and instance that live until the plugin is unloaded. Every call
//! is metered with fresh fuel and an epoch deadline so a runaway guest traps
//! instead of stalling its worker thread.
//!
//! Guest ABI (core module, WASI preview 1):
//!
//! * exports `memory`, `gk_malloc(len) -> ptr`, optional `gk_free(ptr)`,
//!   `gk_register() -> packed`, `gk_call(fn_ptr, fn_len, args_ptr, args_len) -> packed`
//! * imports `gk.log(level, ptr, len)` and
//!   `gk.host_call(fn_ptr, fn_len, args_ptr, args_len) -> packed`
//!
//! A packed value is `(ptr << 32) | len` pointing into guest memory.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use plugdesk_core::{GuestInstance, LogLevel, PlugdeskError, PluginSource, RuntimeKind};
use tracing::{debug, info};
use wasmtime::{
    Caller, Config, Engine, Instance, Linker, Memory, Module, Store, StoreLimits,
    StoreLimitsBuilder, TypedFunc,
};
use wasmtime_wasi::WasiCtxBuilder;
use wasmtime_wasi::p1::WasiP1Ctx;

use super::HostApi;

/// Granularity of the engine epoch.
const EPOCH_TICK: Duration = Duration::from_millis(100);

/// Limits applied to every WASM guest.
#[derive(Debug, Clone)]
pub struct WasmSettings {
    /// Fuel granted to each call.
    pub fuel: u64,
    /// Linear memory ceiling per instance.
    pub max_memory_bytes: usize,
    /// Wall-clock limit for a single call.
    pub timeout: Duration,
}

impl Default for WasmSettings {
    fn default() -> Self {
        Self {
            fuel: 1_000_000_000,
            max_memory_bytes: 64 * 1024 * 1024,
            timeout: Duration::from_secs(30),
        }
    }
}

impl WasmSettings {
    fn epoch_ticks(&self) -> u64 {
        (self.timeout.as_millis() / EPOCH_TICK.as_millis()).max(1) as u64
    }
}

type SharedHost = Arc<ArcSwapOption<Box<dyn HostApi>>>;

/// Per-store state.
struct GuestState {
    plugin: String,
    wasi: WasiP1Ctx,
    limits: StoreLimits,
    host: SharedHost,
}

/// Compiles and instantiates WASM plugins.
pub struct WasmRuntime {
    engine: Engine,
    settings: WasmSettings,
    host: SharedHost,
}

impl WasmRuntime {
    /// Create the shared engine with fuel metering and epoch interruption.
    pub fn new(settings: WasmSettings) -> Result<Self, PlugdeskError> {
        let mut config = Config::new();
        config.consume_fuel(true);
        config.epoch_interruption(true);

        let engine = Engine::new(&config)
            .map_err(|e| PlugdeskError::Internal(format!("failed to create wasmtime engine: {e}")))?;
        spawn_epoch_ticker(&engine)?;

        info!(
            fuel = settings.fuel,
            max_memory_bytes = settings.max_memory_bytes,
            "WASM runtime initialized"
        );
        Ok(Self {
            engine,
            settings,
            host: Arc::new(ArcSwapOption::empty()),
        })
    }

    /// Install the host services guests can reach through `gk.host_call`.
    pub fn set_host_api(&self, host: Box<dyn HostApi>) {
        self.host.store(Some(Arc::new(host)));
    }

    pub fn settings(&self) -> &WasmSettings {
        &self.settings
    }

    /// Compile and instantiate the module at `source.binary_path`.
    pub async fn instantiate(&self, source: &PluginSource) -> Result<WasmGuest, PlugdeskError> {
        let engine = self.engine.clone();
        let settings = self.settings.clone();
        let host = self.host.clone();
        let name = source.name.clone();
        let path = source.binary_path.clone();

        let inner = tokio::task::spawn_blocking(move || {
            GuestInner::create(&engine, &settings, host, &name, &path)
        })
        .await
        .map_err(|e| PlugdeskError::Internal(format!("WASM load task panicked: {e}")))?;

        let inner = inner.map_err(|e| PlugdeskError::Load {
            plugin: source.name.clone(),
            message: format!("{e:#}"),
        })?;
        debug!(plugin = %source.name, path = %source.binary_path.display(), "WASM module instantiated");

        Ok(WasmGuest {
            name: source.name.clone(),
            settings: self.settings.clone(),
            inner: Arc::new(Mutex::new(inner)),
        })
    }
}

/// Increment the engine epoch on a background thread until the engine is dropped.
fn spawn_epoch_ticker(engine: &Engine) -> Result<(), PlugdeskError> {
    let weak = engine.weak();
    std::thread::Builder::new()
        .name("plugdesk-wasm-epoch".to_string())
        .spawn(move || {
            while let Some(engine) = weak.upgrade() {
                engine.increment_epoch();
                drop(engine);
                std::thread::sleep(EPOCH_TICK);
            }
        })?;
    Ok(())
}

struct GuestInner {
    store: Store<GuestState>,
    memory: Memory,
    malloc: TypedFunc<u32, u32>,
    free: Option<TypedFunc<u32, ()>>,
    register: TypedFunc<(), u64>,
    call: TypedFunc<(u32, u32, u32, u32), u64>,
}

impl GuestInner {
    fn create(
        engine: &Engine,
        settings: &WasmSettings,
        host: SharedHost,
        name: &str,
        path: &Path,
    ) -> anyhow::Result<Self> {
        let module = Module::from_file(engine, path)?;

        let mut linker: Linker<GuestState> = Linker::new(engine);
        wasmtime_wasi::p1::add_to_linker_sync(&mut linker, |state: &mut GuestState| &mut state.wasi)?;
        define_host_functions(&mut linker)?;

        let state = GuestState {
            plugin: name.to_string(),
            wasi: WasiCtxBuilder::new().inherit_stderr().build_p1(),
            limits: StoreLimitsBuilder::new()
                .memory_size(settings.max_memory_bytes)
                .build(),
            host,
        };
        let mut store = Store::new(engine, state);
        store.limiter(|state| &mut state.limits);
        store.epoch_deadline_trap();
        arm(&mut store, settings)?;

        let instance = linker.instantiate(&mut store, &module)?;
        initialize(&mut store, &instance)?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| anyhow!("module does not export `memory`"))?;
        let malloc = instance
            .get_typed_func::<u32, u32>(&mut store, "gk_malloc")
            .map_err(|e| anyhow!("missing export gk_malloc: {e}"))?;
        let free = instance.get_typed_func::<u32, ()>(&mut store, "gk_free").ok();
        let register = instance
            .get_typed_func::<(), u64>(&mut store, "gk_register")
            .map_err(|e| anyhow!("missing export gk_register: {e}"))?;
        let call = instance
            .get_typed_func::<(u32, u32, u32, u32), u64>(&mut store, "gk_call")
            .map_err(|e| anyhow!("missing export gk_call: {e}"))?;

        Ok(Self {
            store,
            memory,
            malloc,
            free,
            register,
            call,
        })
    }

    fn register(&mut self, settings: &WasmSettings) -> anyhow::Result<Vec<u8>> {
        arm(&mut self.store, settings)?;
        let packed = self.register.call(&mut self.store, ())?;
        self.take_packed(packed)
    }

    fn call(&mut self, settings: &WasmSettings, function: &str, args: &[u8]) -> anyhow::Result<Vec<u8>> {
        arm(&mut self.store, settings)?;
        let (fn_ptr, fn_len) = self.write_guest(function.as_bytes())?;
        let (args_ptr, args_len) = self.write_guest(args)?;
        let packed = self
            .call
            .call(&mut self.store, (fn_ptr, fn_len, args_ptr, args_len))?;
        let (out, out_ptr) = self.read_packed(packed)?;
        for ptr in [fn_ptr, args_ptr] {
            // Guests may answer with the argument buffer itself.
            if ptr != out_ptr {
                self.release(ptr)?;
            }
        }
        self.release(out_ptr)?;
        Ok(out)
    }

    fn write_guest(&mut self, bytes: &[u8]) -> anyhow::Result<(u32, u32)> {
        if bytes.is_empty() {
            return Ok((0, 0));
        }
        let len = u32::try_from(bytes.len())?;
        let ptr = self.malloc.call(&mut self.store, len)?;
        self.memory.write(&mut self.store, ptr as usize, bytes)?;
        Ok((ptr, len))
    }

    fn take_packed(&mut self, packed: u64) -> anyhow::Result<Vec<u8>> {
        let (out, ptr) = self.read_packed(packed)?;
        self.release(ptr)?;
        Ok(out)
    }

    fn read_packed(&self, packed: u64) -> anyhow::Result<(Vec<u8>, u32)> {
        let (ptr, len) = unpack(packed);
        if ptr == 0 || len == 0 {
            return Ok((Vec::new(), 0));
        }
        let mut out = vec![0u8; len as usize];
        self.memory.read(&self.store, ptr as usize, &mut out)?;
        Ok((out, ptr))
    }

    fn release(&mut self, ptr: u32) -> anyhow::Result<()> {
        if ptr != 0
            && let Some(free) = &self.free
        {
            free.call(&mut self.store, ptr)?;
        }
        Ok(())
    }
}

/// Refill fuel and reset the epoch deadline before entering the guest.
fn arm(store: &mut Store<GuestState>, settings: &WasmSettings) -> anyhow::Result<()> {
    store.set_fuel(settings.fuel)?;
    store.set_epoch_deadline(settings.epoch_ticks());
    Ok(())
}

/// Run the module's WASI initializer. A clean `proc_exit(0)` is not an error.
fn initialize(store: &mut Store<GuestState>, instance: &Instance) -> anyhow::Result<()> {
    let init = instance
        .get_typed_func::<(), ()>(&mut *store, "_initialize")
        .or_else(|_| instance.get_typed_func::<(), ()>(&mut *store, "_start"));
    let Ok(init) = init else {
        return Ok(());
    };
    match init.call(&mut *store, ()) {
        Ok(()) => Ok(()),
        Err(e) if format!("{e:#}").contains("exit status 0") => Ok(()),
        Err(e) => Err(e),
    }
}

fn unpack(packed: u64) -> (u32, u32) {
    ((packed >> 32) as u32, (packed & 0xFFFF_FFFF) as u32)
}

fn pack(ptr: u32, len: u32) -> u64 {
    (u64::from(ptr) << 32) | u64::from(len)
}

fn guest_memory(caller: &mut Caller<'_, GuestState>) -> anyhow::Result<Memory> {
    caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .ok_or_else(|| anyhow!("module does not export `memory`"))
}

fn read_guest(caller: &mut Caller<'_, GuestState>, ptr: u32, len: u32) -> anyhow::Result<Vec<u8>> {
    if ptr == 0 || len == 0 {
        return Ok(Vec::new());
    }
    let memory = guest_memory(caller)?;
    let mut out = vec![0u8; len as usize];
    memory.read(&*caller, ptr as usize, &mut out)?;
    Ok(out)
}

/// Copy `bytes` into a fresh guest allocation and return the packed location.
fn write_to_caller(caller: &mut Caller<'_, GuestState>, bytes: &[u8]) -> anyhow::Result<u64> {
    if bytes.is_empty() {
        return Ok(0);
    }
    let len = u32::try_from(bytes.len())?;
    let malloc = caller
        .get_export("gk_malloc")
        .and_then(|e| e.into_func())
        .ok_or_else(|| anyhow!("module does not export `gk_malloc`"))?
        .typed::<u32, u32>(&*caller)?;
    let ptr = malloc.call(&mut *caller, len)?;
    let memory = guest_memory(caller)?;
    memory.write(&mut *caller, ptr as usize, bytes)?;
    Ok(pack(ptr, len))
}

fn define_host_functions(linker: &mut Linker<GuestState>) -> anyhow::Result<()> {
    linker.func_wrap(
        "gk",
        "log",
        |mut caller: Caller<'_, GuestState>, level: u32, ptr: u32, len: u32| -> anyhow::Result<()> {
            let bytes = read_guest(&mut caller, ptr, len)?;
            let message = String::from_utf8_lossy(&bytes);
            let level = match level {
                0 => LogLevel::Debug,
                1 => LogLevel::Info,
                2 => LogLevel::Warn,
                _ => LogLevel::Error,
            };
            let state = caller.data();
            match state.host.load_full() {
                Some(host) => host.log(&state.plugin, level, &message),
                None => debug!(plugin = %state.plugin, %level, guest_log = %message, "guest log"),
            }
            Ok(())
        },
    )?;

    linker.func_wrap(
        "gk",
        "host_call",
        |mut caller: Caller<'_, GuestState>,
         fn_ptr: u32,
         fn_len: u32,
         args_ptr: u32,
         args_len: u32|
         -> anyhow::Result<u64> {
            let function = String::from_utf8(read_guest(&mut caller, fn_ptr, fn_len)?)?;
            let args = read_guest(&mut caller, args_ptr, args_len)?;
            let plugin = caller.data().plugin.clone();
            let response = match caller.data().host.load_full() {
                Some(host) => host.host_call(&plugin, &function, &args),
                None => serde_json::json!({ "error": "host API unavailable" })
                    .to_string()
                    .into_bytes(),
            };
            write_to_caller(&mut caller, &response)
        },
    )?;
    Ok(())
}

/// A live WASM plugin instance.
pub struct WasmGuest {
    name: String,
    settings: WasmSettings,
    inner: Arc<Mutex<GuestInner>>,
}

impl WasmGuest {
    async fn run<T, F>(&self, op: F) -> Result<T, PlugdeskError>
    where
        T: Send + 'static,
        F: FnOnce(&mut GuestInner, &WasmSettings) -> anyhow::Result<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        let settings = self.settings.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let mut guard = inner.lock().unwrap_or_else(|p| p.into_inner());
            op(&mut guard, &settings)
        })
        .await
        .map_err(|e| PlugdeskError::Runtime {
            plugin: self.name.clone(),
            message: format!("WASM execution task panicked: {e}"),
        })?;

        outcome.map_err(|e| {
            // {e:#} keeps the whole cause chain.
            let detail = format!("{e:#}");
            let message = if detail.contains("all fuel consumed") {
                format!("exceeded fuel limit ({} units): {detail}", self.settings.fuel)
            } else if detail.contains("wasm trap: interrupt") {
                format!(
                    "exceeded wall-clock limit ({:?}): {detail}",
                    self.settings.timeout
                )
            } else {
                detail
            };
            PlugdeskError::Runtime {
                plugin: self.name.clone(),
                message,
            }
        })
    }
}

#[async_trait]
impl GuestInstance for WasmGuest {
    fn runtime(&self) -> RuntimeKind {
        RuntimeKind::Wasm
    }

    async fn register(&mut self) -> Result<Vec<u8>, PlugdeskError> {
        self.run(|inner, settings| inner.register(settings)).await
    }

    async fn call(&mut self, function: &str, args: &[u8]) -> Result<Vec<u8>, PlugdeskError> {
        let function = function.to_string();
        let args = args.to_vec();
        self.run(move |inner, settings| inner.call(settings, &function, &args))
            .await
    }

    async fn shutdown(&mut self) -> Result<(), PlugdeskError> {
        debug!(plugin = %self.name, "WASM guest released");
        Ok(())
    }
}
