//! Module runtime adapter using wasmtime.
//!
//! Uses wasmtime-wasi preview1, the ABI produced by `wasm32-wasip1` toolchains.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use wasmtime::*;
use wasmtime_wasi::pipe::MemoryInputPipe;
use wasmtime_wasi::preview1::WasiP1Ctx;
use wasmtime_wasi::{DirPerms, FilePerms, I32Exit, WasiCtxBuilder};

use super::config::{RuntimeConfig, SandboxCapabilities, SandboxConfig};
use super::withhold::{self, FrozenMonotonicClock, FrozenWallClock};
use crate::context::Stdio;
use crate::error::{EmulationError, Result};

/// Exit status reported when the module could not run to completion.
///
/// Matches the status `env`, `timeout` and container runtimes use when the
/// launcher itself fails.
pub const HOST_ERROR_EXIT_CODE: i32 = 125;

/// Outcome of one module run.
#[derive(Debug)]
pub enum ExecutionResult {
    /// The module returned normally (0) or requested an exit status
    Exited(i32),
    /// The module could not be instantiated or faulted
    HostError(EmulationError),
}

impl ExecutionResult {
    /// Process exit status for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            ExecutionResult::Exited(code) => *code,
            ExecutionResult::HostError(_) => HOST_ERROR_EXIT_CODE,
        }
    }

    /// The host error, if any.
    pub fn host_error(&self) -> Option<&EmulationError> {
        match self {
            ExecutionResult::Exited(_) => None,
            ExecutionResult::HostError(err) => Some(err),
        }
    }
}

/// The capability consumed from the execution engine: instantiate a module
/// under a configuration and run it to completion.
pub trait ModuleEngine {
    /// Run `module` once. Implementations must not retry or cache instances.
    fn run(&self, module: &[u8], config: SandboxConfig) -> ExecutionResult;
}

/// Host state for the store, containing the WASI preview1 context.
pub struct HostState {
    wasi: WasiP1Ctx,
    memory: MemoryCeiling,
}

/// Refuses linear memory past a byte ceiling and remembers that it did.
///
/// Refusal is an error rather than a `-1` from `memory.grow`, so the run
/// ends as resource exhaustion instead of continuing without the memory.
#[derive(Debug, Default)]
struct MemoryCeiling {
    limit: Option<usize>,
    exceeded: bool,
}

impl MemoryCeiling {
    fn new(max_memory: usize) -> Self {
        Self {
            limit: (max_memory > 0).then_some(max_memory),
            exceeded: false,
        }
    }
}

impl ResourceLimiter for MemoryCeiling {
    fn memory_growing(
        &mut self,
        _current: usize,
        desired: usize,
        maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        if let Some(limit) = self.limit {
            if desired > limit {
                self.exceeded = true;
                return Err(Error::msg(format!(
                    "memory of {} bytes exceeds the {} byte ceiling",
                    desired, limit
                )));
            }
        }
        Ok(maximum.map_or(true, |max| desired <= max))
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        Ok(maximum.map_or(true, |max| desired <= max))
    }
}

/// Runs modules in a fresh wasmtime engine and store per call.
#[derive(Debug, Clone, Default)]
pub struct WasmtimeEngine {
    config: RuntimeConfig,
}

#[derive(Clone, Copy)]
enum Stage {
    Instantiate,
    Run,
}

impl WasmtimeEngine {
    /// Create an engine adapter with the given runtime settings.
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }

    /// Get the configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn engine(&self) -> Result<Engine> {
        let mut engine_config = Config::new();

        engine_config.cranelift_opt_level(match self.config.optimization_level {
            0 => OptLevel::None,
            1 => OptLevel::Speed,
            _ => OptLevel::SpeedAndSize,
        });
        engine_config.wasm_simd(self.config.enable_simd);
        if !self.config.enable_simd {
            engine_config.wasm_relaxed_simd(false);
        }

        if self.config.fuel_limit.is_some() {
            engine_config.consume_fuel(true);
        }

        if self.config.execution_deadline().is_some() {
            engine_config.epoch_interruption(true);
        }

        Engine::new(&engine_config)
            .map_err(|e| EmulationError::Config(format!("engine creation failed: {}", e)))
    }

    /// Build host state from the sandbox configuration.
    fn build_host_state(&self, config: SandboxConfig) -> Result<HostState> {
        let (args, env, stdio, mounts, caps) = config.into_parts();
        let mut builder = WasiCtxBuilder::new();

        match stdio {
            Stdio::Inherit => {
                builder.inherit_stdin().inherit_stdout().inherit_stderr();
            }
            Stdio::Captured(io) => {
                builder
                    .stdin(MemoryInputPipe::new(io.stdin))
                    .stdout(io.stdout)
                    .stderr(io.stderr);
            }
        }

        for (key, value) in env.iter() {
            builder.env(key, value);
        }

        builder.args(&args);

        for mount in &mounts {
            builder
                .preopened_dir(&mount.host, &mount.guest, DirPerms::all(), FilePerms::all())
                .map_err(|e| {
                    EmulationError::Mount(format!(
                        "cannot mount {} at {}: {}",
                        mount.host.display(),
                        mount.guest,
                        e
                    ))
                })?;
        }

        if !caps.wall_clock {
            builder.wall_clock(FrozenWallClock);
        }
        if !caps.monotonic_clock {
            builder.monotonic_clock(FrozenMonotonicClock);
        }

        // Stdio is read on this thread rather than through a background worker.
        builder.allow_blocking_current_thread(true);

        Ok(HostState {
            wasi: builder.build_p1(),
            memory: MemoryCeiling::new(self.config.max_memory),
        })
    }

    fn link(&self, engine: &Engine, caps: &SandboxCapabilities) -> Result<Linker<HostState>> {
        let mut linker: Linker<HostState> = Linker::new(engine);
        wasmtime_wasi::preview1::add_to_linker_sync(&mut linker, |state| &mut state.wasi)
            .map_err(|e| EmulationError::Instantiation(format!("WASI link failed: {}", e)))?;
        withhold::shadow_imports(&mut linker, caps)?;
        Ok(linker)
    }

    /// Compile, instantiate and run; `Ok` carries the exit status.
    fn execute(&self, bytes: &[u8], config: SandboxConfig) -> Result<i32> {
        // The text parser would accept an empty input as an empty module.
        if bytes.is_empty() {
            return Err(EmulationError::ModuleLoad("module is empty".to_string()));
        }

        let engine = self.engine()?;
        // Accepts the binary format and, like the wasmtime CLI, the text format.
        let module = Module::new(&engine, bytes)
            .map_err(|e| EmulationError::ModuleLoad(format!("{:#}", e)))?;

        let caps = config.capabilities();
        let linker = self.link(&engine, &caps)?;
        let mut store = Store::new(&engine, self.build_host_state(config)?);
        store.limiter(|state| &mut state.memory);

        if let Some(fuel) = self.config.fuel_limit {
            store
                .set_fuel(fuel)
                .map_err(|e| EmulationError::Config(format!("fuel setup failed: {}", e)))?;
        }

        let _watchdog = self.config.execution_deadline().map(|deadline| {
            store.set_epoch_deadline(1);
            Watchdog::start(engine.clone(), deadline)
        });

        let instance = match linker.instantiate(&mut store, &module) {
            Ok(instance) => instance,
            Err(e) => return self.classify(e, Stage::Instantiate, store.data().memory.exceeded),
        };

        let Some(start) = instance.get_func(&mut store, "_start") else {
            tracing::debug!("module has no _start export; instantiation was the whole run");
            return Ok(0);
        };
        let start = start
            .typed::<(), ()>(&store)
            .map_err(|e| EmulationError::Instantiation(format!("bad _start signature: {}", e)))?;

        match start.call(&mut store, ()) {
            Ok(()) => Ok(0),
            Err(e) => self.classify(e, Stage::Run, store.data().memory.exceeded),
        }
    }

    /// Sort an engine error into an exit request or a host error.
    fn classify(&self, err: Error, stage: Stage, memory_exceeded: bool) -> Result<i32> {
        if let Some(exit) = err.downcast_ref::<I32Exit>() {
            return Ok(exit.0);
        }

        if memory_exceeded {
            return Err(EmulationError::ResourceExhausted(format!("{:#}", err)));
        }

        if let Some(trap) = err.downcast_ref::<Trap>() {
            return Err(match trap {
                Trap::Interrupt => EmulationError::Timeout(
                    self.config.execution_deadline().unwrap_or_default(),
                ),
                Trap::OutOfFuel => {
                    EmulationError::ResourceExhausted("fuel budget exhausted".to_string())
                }
                _ => EmulationError::Trap(format!("{:#}", err)),
            });
        }

        Err(match stage {
            Stage::Instantiate => EmulationError::Instantiation(format!("{:#}", err)),
            Stage::Run => EmulationError::Trap(format!("{:#}", err)),
        })
    }
}

impl ModuleEngine for WasmtimeEngine {
    fn run(&self, module: &[u8], config: SandboxConfig) -> ExecutionResult {
        let start = Instant::now();
        tracing::info!(program = ?config.args().first(), "starting module");

        let result = match self.execute(module, config) {
            Ok(code) => ExecutionResult::Exited(code),
            Err(err) => ExecutionResult::HostError(err),
        };

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            exit_code = result.exit_code(),
            "module finished"
        );
        result
    }
}

/// Bumps the engine epoch once the deadline passes, interrupting the module.
///
/// Dropping the watchdog before the deadline cancels it.
struct Watchdog {
    cancel: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    fn start(engine: Engine, deadline: Duration) -> Self {
        let (cancel, cancelled) = mpsc::channel::<()>();
        let handle = thread::spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = cancelled.recv_timeout(deadline) {
                tracing::warn!(?deadline, "execution deadline reached, interrupting module");
                engine.increment_epoch();
            }
        });
        Self {
            cancel: Some(cancel),
            handle: Some(handle),
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        drop(self.cancel.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("execution watchdog thread panicked");
            }
        }
    }
}
