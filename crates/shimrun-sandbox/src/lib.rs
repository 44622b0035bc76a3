//! # shimrun sandbox
//!
//! Run a WebAssembly/WASI module as if it were a native executable.
//!
//! The module sees the invoking process's arguments, environment, standard
//! streams and working directory, and its exit status becomes the process
//! exit status, while it actually runs inside wasmtime.
//!
//! ## Components
//!
//! | Module | Role |
//! |--------|------|
//! | [`mount`] | Parse `HOST:GUEST`, `GUEST::HOST` and `GUEST=HOST` tokens |
//! | [`translate`] | Rewrite `wasmtime`-style flags (`--dir`, `--mapdir`) into mounts |
//! | [`context`] | Snapshot arguments, environment, stdio and cwd |
//! | [`wasm`] | Configure wasmtime, run the module, map the outcome to an exit code |
//! | [`driver`] | Tie it together: raw arguments in, exit status out |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use shimrun_sandbox::{emulate, Dialect};
//!
//! static MODULE: &[u8] = include_bytes!("formatter.wasm");
//!
//! fn main() {
//!     let args: Vec<String> = std::env::args().skip(1).collect();
//!     std::process::exit(emulate("formatter", MODULE, &args, Dialect::Canonical));
//! }
//! ```
//!
//! A host-level failure (bad module, missing mount, trap) is reported on
//! stderr and exits with [`HOST_ERROR_EXIT_CODE`].

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod context;
pub mod driver;
pub mod error;
pub mod mount;
pub mod translate;
pub mod wasm;

// Re-export main types
pub use context::{CapturedStdio, HostProcess, ProcessContext, ProcessEnv, Stdio};
pub use driver::{
    emulate, run_embedded, Configuring, Emulation, Emulator, EmulatorConfig, Executed, Idle,
    ModuleSource,
};
pub use error::{EmulationError, Result};
pub use mount::{GuestDefault, MountSpec, MountSyntax};
pub use translate::{Dialect, DropReason, DroppedToken, TranslateOptions, Translation};
pub use wasm::{
    ExecutionResult, ModuleEngine, RuntimeConfig, SandboxCapabilities, SandboxConfig,
    WasmtimeEngine, HOST_ERROR_EXIT_CODE,
};
