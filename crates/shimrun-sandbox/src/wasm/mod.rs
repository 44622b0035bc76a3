//! WebAssembly module runtime adapter.
//!
//! This is the only part of the crate that talks to the execution engine.
//! It uses wasmtime as the runtime with WASI preview1 for system access.
//!
//! ## Process model
//!
//! - **Arguments and environment**: forwarded verbatim, program name first
//! - **Stdio**: the invoking process's descriptors, no intermediate buffer
//! - **Filesystem**: one preopened directory per [`MountSpec`](crate::MountSpec)
//! - **Capabilities**: clocks, sleep and random granted by default
//! - **Exit status**: `proc_exit(N)` yields exactly `N`; any other fault is a
//!   host error reported as [`HOST_ERROR_EXIT_CODE`]
//!
//! ## Usage
//!
//! ```rust,ignore
//! use shimrun_sandbox::wasm::{ModuleEngine, SandboxConfig, WasmtimeEngine};
//!
//! let engine = WasmtimeEngine::default();
//! let result = engine.run(&bytes, SandboxConfig::assemble(context, mounts, caps));
//! std::process::exit(result.exit_code());
//! ```

mod config;
mod runtime;
mod withhold;

pub use config::{RuntimeConfig, SandboxCapabilities, SandboxConfig};
pub use runtime::{ExecutionResult, ModuleEngine, WasmtimeEngine, HOST_ERROR_EXIT_CODE};
pub use withhold::{ERRNO_NOTCAPABLE, WASI_MODULE};
