//! Snapshot of the invoking process: arguments, environment, stdio, cwd.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use wasmtime_wasi::pipe::MemoryOutputPipe;

use crate::error::Result;

/// Upper bound on bytes a captured output stream will hold.
pub const CAPTURE_CAPACITY: usize = 64 * 1024 * 1024;

/// Environment variables forwarded to the module.
///
/// Names are unique; a repeated name keeps the last value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessEnv(BTreeMap<String, String>);

impl ProcessEnv {
    /// Build from `NAME=VALUE` entries, split on the first `=`.
    ///
    /// Entries without `=` or with an empty name are ignored.
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut vars = BTreeMap::new();
        for entry in entries {
            match entry.as_ref().split_once('=') {
                Some((name, value)) if !name.is_empty() => {
                    vars.insert(name.to_string(), value.to_string());
                }
                _ => tracing::debug!(entry = entry.as_ref(), "ignoring malformed environment entry"),
            }
        }
        Self(vars)
    }

    /// Build from already-split pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(k, _): &(String, String)| !k.is_empty())
            .collect();
        Self(vars)
    }

    /// Every variable visible to this process.
    pub fn current() -> Self {
        let mut vars = BTreeMap::new();
        for (name, value) in std::env::vars_os() {
            match (name.into_string(), value.into_string()) {
                (Ok(name), Ok(value)) if !name.is_empty() => {
                    vars.insert(name, value);
                }
                (name, _) => tracing::debug!(?name, "skipping non-unicode environment variable"),
            }
        }
        Self(vars)
    }

    /// Look up a variable.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Number of variables.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no variables are set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate `(name, value)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// In-memory standard streams.
#[derive(Clone)]
pub struct CapturedStdio {
    pub(crate) stdin: Vec<u8>,
    pub(crate) stdout: MemoryOutputPipe,
    pub(crate) stderr: MemoryOutputPipe,
}

impl CapturedStdio {
    /// Feed `stdin` to the module and capture what it writes.
    pub fn new(stdin: impl Into<Vec<u8>>) -> Self {
        Self {
            stdin: stdin.into(),
            stdout: MemoryOutputPipe::new(CAPTURE_CAPACITY),
            stderr: MemoryOutputPipe::new(CAPTURE_CAPACITY),
        }
    }

    /// Bytes written to stdout so far.
    pub fn stdout(&self) -> Vec<u8> {
        self.stdout.contents().to_vec()
    }

    /// Bytes written to stderr so far.
    pub fn stderr(&self) -> Vec<u8> {
        self.stderr.contents().to_vec()
    }
}

/// Where the module's standard streams go.
#[derive(Clone, Default)]
pub enum Stdio {
    /// Read and write the invoking process's own descriptors
    #[default]
    Inherit,
    /// Use in-memory buffers
    Captured(CapturedStdio),
}

impl fmt::Debug for Stdio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stdio::Inherit => f.write_str("Inherit"),
            Stdio::Captured(io) => f
                .debug_struct("Captured")
                .field("stdin_len", &io.stdin.len())
                .finish_non_exhaustive(),
        }
    }
}

/// The parts of the invoking process that do not depend on the arguments.
#[derive(Debug, Clone)]
pub struct HostProcess {
    pub(crate) env: ProcessEnv,
    pub(crate) stdio: Stdio,
    pub(crate) cwd: PathBuf,
}

impl HostProcess {
    /// Snapshot the current process.
    pub fn current() -> Result<Self> {
        Ok(Self {
            env: ProcessEnv::current(),
            stdio: Stdio::Inherit,
            cwd: std::env::current_dir()?,
        })
    }

    /// Describe a process explicitly.
    pub fn new(env: ProcessEnv, stdio: Stdio, cwd: impl Into<PathBuf>) -> Self {
        Self {
            env,
            stdio,
            cwd: cwd.into(),
        }
    }

    /// Working directory.
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }
}

/// Everything a module needs to observe a native process context.
#[derive(Debug, Clone)]
pub struct ProcessContext {
    args: Vec<String>,
    env: ProcessEnv,
    stdio: Stdio,
    cwd: PathBuf,
}

impl ProcessContext {
    /// Combine a module name, its arguments and the host process.
    pub fn new(module_name: &str, program_args: Vec<String>, host: HostProcess) -> Self {
        let mut args = Vec::with_capacity(program_args.len() + 1);
        args.push(module_name.to_string());
        args.extend(program_args);
        Self {
            args,
            env: host.env,
            stdio: host.stdio,
            cwd: host.cwd,
        }
    }

    /// Program arguments, module name first.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Environment.
    pub fn env(&self) -> &ProcessEnv {
        &self.env
    }

    /// Standard streams.
    pub fn stdio(&self) -> &Stdio {
        &self.stdio
    }

    /// Working directory of the invoking process.
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub(crate) fn into_parts(self) -> (Vec<String>, ProcessEnv, Stdio, PathBuf) {
        (self.args, self.env, self.stdio, self.cwd)
    }
}
