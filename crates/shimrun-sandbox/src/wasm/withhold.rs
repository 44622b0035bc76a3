//! Enforcement of withheld capabilities and exit-status passthrough.
//!
//! These definitions shadow the stock preview1 imports in the linker, so they
//! must be registered after `add_to_linker_sync`.

use std::time::Duration;

use wasmtime::Linker;
use wasmtime_wasi::{HostMonotonicClock, HostWallClock, I32Exit};

use super::config::SandboxCapabilities;
use super::runtime::HostState;
use crate::error::{EmulationError, Result};

/// Import module of WASI preview1.
pub const WASI_MODULE: &str = "wasi_snapshot_preview1";

/// `__WASI_ERRNO_NOTCAPABLE`
pub const ERRNO_NOTCAPABLE: i32 = 76;

/// Wall clock stuck at the Unix epoch.
pub(crate) struct FrozenWallClock;

impl HostWallClock for FrozenWallClock {
    fn resolution(&self) -> Duration {
        Duration::from_secs(1)
    }

    fn now(&self) -> Duration {
        Duration::ZERO
    }
}

/// Monotonic clock that never advances.
pub(crate) struct FrozenMonotonicClock;

impl HostMonotonicClock for FrozenMonotonicClock {
    fn resolution(&self) -> u64 {
        1_000_000_000
    }

    fn now(&self) -> u64 {
        0
    }
}

/// Replace preview1 imports whose stock behavior does not fit process emulation.
pub(crate) fn shadow_imports(
    linker: &mut Linker<HostState>,
    caps: &SandboxCapabilities,
) -> Result<()> {
    linker.allow_shadowing(true);

    // Stock proc_exit rejects statuses >= 126; a native process can use 0..=255.
    linker
        .func_wrap(WASI_MODULE, "proc_exit", |status: i32| -> wasmtime::Result<()> {
            Err(wasmtime::Error::new(I32Exit(status)))
        })
        .map_err(|e| EmulationError::Instantiation(format!("proc_exit link failed: {}", e)))?;

    if !caps.random {
        linker
            .func_wrap(WASI_MODULE, "random_get", |_buf: i32, _len: i32| -> i32 {
                ERRNO_NOTCAPABLE
            })
            .map_err(|e| EmulationError::Instantiation(format!("random_get link failed: {}", e)))?;
    }

    if !caps.sleep {
        // Also disables readiness polling on descriptors; preview1 routes both through poll_oneoff.
        linker
            .func_wrap(
                WASI_MODULE,
                "poll_oneoff",
                |_in: i32, _out: i32, _nsubscriptions: i32, _nevents: i32| -> i32 {
                    ERRNO_NOTCAPABLE
                },
            )
            .map_err(|e| EmulationError::Instantiation(format!("poll_oneoff link failed: {}", e)))?;
    }

    linker.allow_shadowing(false);
    Ok(())
}
