//! Configuration for the WASI runtime adapter.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::context::{ProcessContext, ProcessEnv, Stdio};
use crate::mount::{self, MountSpec};

/// Host facilities granted to the module.
///
/// Modules compiled for a native-looking CLI routinely need all of these
/// (hash seeding, timestamps, backoff), so [`SandboxCapabilities::process`]
/// is the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxCapabilities {
    /// Read the wall clock
    pub wall_clock: bool,

    /// Read the monotonic clock
    pub monotonic_clock: bool,

    /// Sleep / poll for readiness
    pub sleep: bool,

    /// Read the cryptographically secure random source
    pub random: bool,
}

impl Default for SandboxCapabilities {
    fn default() -> Self {
        Self::process()
    }
}

impl SandboxCapabilities {
    /// Everything a native process would have.
    pub fn process() -> Self {
        Self {
            wall_clock: true,
            monotonic_clock: true,
            sleep: true,
            random: true,
        }
    }

    /// Nothing granted.
    pub fn none() -> Self {
        Self {
            wall_clock: false,
            monotonic_clock: false,
            sleep: false,
            random: false,
        }
    }

    /// Builder: grant the wall clock
    pub fn wall_clock(mut self, allow: bool) -> Self {
        self.wall_clock = allow;
        self
    }

    /// Builder: grant the monotonic clock
    pub fn monotonic_clock(mut self, allow: bool) -> Self {
        self.monotonic_clock = allow;
        self
    }

    /// Builder: grant sleep
    pub fn sleep(mut self, allow: bool) -> Self {
        self.sleep = allow;
        self
    }

    /// Builder: grant random
    pub fn random(mut self, allow: bool) -> Self {
        self.random = allow;
        self
    }
}

/// Engine settings and explicitly requested limits.
///
/// The defaults impose no limits, like a native process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum linear memory in bytes (0 = unlimited)
    pub max_memory: usize,

    /// Maximum execution time in milliseconds (0 = unlimited)
    pub max_execution_time_ms: u64,

    /// Fuel budget for the run
    pub fuel_limit: Option<u64>,

    /// Cranelift optimization level (0-2)
    pub optimization_level: u8,

    /// Enable SIMD support
    pub enable_simd: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_memory: 0,
            max_execution_time_ms: 0,
            fuel_limit: None,
            optimization_level: 2,
            enable_simd: true,
        }
    }
}

impl RuntimeConfig {
    /// Builder: set max memory
    pub fn max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = bytes;
        self
    }

    /// Builder: set the execution deadline
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.max_execution_time_ms = timeout.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    /// Builder: set fuel limit
    pub fn fuel_limit(mut self, fuel: u64) -> Self {
        self.fuel_limit = Some(fuel);
        self
    }

    /// Builder: set optimization level
    pub fn optimize(mut self, level: u8) -> Self {
        self.optimization_level = level.min(2);
        self
    }

    /// Builder: enable SIMD
    pub fn simd(mut self, enable: bool) -> Self {
        self.enable_simd = enable;
        self
    }

    /// The execution deadline, if one was requested.
    pub fn execution_deadline(&self) -> Option<Duration> {
        (self.max_execution_time_ms > 0).then(|| Duration::from_millis(self.max_execution_time_ms))
    }
}

/// Fully assembled input for one module run.
///
/// Built once from a [`ProcessContext`] and the mounts, then handed to a
/// [`ModuleEngine`](super::ModuleEngine) by value.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    args: Vec<String>,
    env: ProcessEnv,
    stdio: Stdio,
    mounts: Vec<MountSpec>,
    capabilities: SandboxCapabilities,
}

impl SandboxConfig {
    /// Assemble the configuration. Duplicate guest paths keep the last mount.
    pub fn assemble(
        context: ProcessContext,
        mounts: Vec<MountSpec>,
        capabilities: SandboxCapabilities,
    ) -> Self {
        let (args, env, stdio, _cwd) = context.into_parts();
        let mounts = mount::dedup_mounts(mounts);
        tracing::debug!(
            args = args.len(),
            env = env.len(),
            mounts = ?mounts.iter().map(ToString::to_string).collect::<Vec<_>>(),
            ?capabilities,
            "assembled sandbox config"
        );
        Self {
            args,
            env,
            stdio,
            mounts,
            capabilities,
        }
    }

    /// Module arguments, program name first.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Environment forwarded to the module.
    pub fn env(&self) -> &ProcessEnv {
        &self.env
    }

    /// Standard streams.
    pub fn stdio(&self) -> &Stdio {
        &self.stdio
    }

    /// Mounts in preopen order.
    pub fn mounts(&self) -> &[MountSpec] {
        &self.mounts
    }

    /// Granted capabilities.
    pub fn capabilities(&self) -> SandboxCapabilities {
        self.capabilities
    }

    pub(crate) fn into_parts(
        self,
    ) -> (Vec<String>, ProcessEnv, Stdio, Vec<MountSpec>, SandboxCapabilities) {
        (self.args, self.env, self.stdio, self.mounts, self.capabilities)
    }
}
