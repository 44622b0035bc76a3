//! Emulation driver: raw arguments in, process exit status out.
//!
//! One emulation moves through three states and cannot go back:
//!
//! ```text
//! Emulation<Idle> --configure()--> Emulation<Configuring> --execute()--> Emulation<Executed>
//! ```
//!
//! `configure` runs the flag translator (legacy dialect only), loads the
//! module and captures the process context; `execute` hands the assembled
//! [`SandboxConfig`] to a [`ModuleEngine`] exactly once.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use crate::context::{HostProcess, ProcessContext};
use crate::error::{EmulationError, Result};
use crate::mount::MountSpec;
use crate::translate::{self, Dialect, DroppedToken, TranslateOptions};
use crate::wasm::{
    ExecutionResult, ModuleEngine, RuntimeConfig, SandboxCapabilities, SandboxConfig,
    WasmtimeEngine,
};

/// Guest path of the scratch directory.
pub const SCRATCH_GUEST_PATH: &str = "/tmp";

/// Settings for an emulation, passed explicitly rather than read from globals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    /// Mounts supplied in canonical form, applied before translated ones
    pub mounts: Vec<MountSpec>,

    /// Reject malformed or unsupported legacy flags
    pub strict: bool,

    /// Capabilities granted to the module
    pub capabilities: SandboxCapabilities,

    /// Engine settings and limits
    pub runtime: RuntimeConfig,

    /// Mount a fresh temporary directory at `/tmp` for the run
    pub scratch_tmp: bool,
}

impl EmulatorConfig {
    /// Load a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| EmulationError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Builder: add a mount
    pub fn mount(mut self, mount: MountSpec) -> Self {
        self.mounts.push(mount);
        self
    }

    /// Builder: strict flag translation
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Builder: set capabilities
    pub fn capabilities(mut self, caps: SandboxCapabilities) -> Self {
        self.capabilities = caps;
        self
    }

    /// Builder: set runtime config
    pub fn runtime(mut self, runtime: RuntimeConfig) -> Self {
        self.runtime = runtime;
        self
    }

    /// Builder: scratch `/tmp`
    pub fn scratch_tmp(mut self, enable: bool) -> Self {
        self.scratch_tmp = enable;
        self
    }
}

/// Where the module comes from.
#[derive(Debug, Clone)]
pub enum ModuleSource {
    /// Module bytes already in memory, e.g. embedded in the binary
    Bytes {
        /// Program name the module sees as its first argument
        name: String,
        /// Module bytes
        bytes: Vec<u8>,
    },
    /// Module file; the path as given becomes the program name
    File(PathBuf),
    /// The first residual argument names the module file
    FirstArgument,
}

impl ModuleSource {
    /// Module bytes with a program name.
    pub fn bytes(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        ModuleSource::Bytes {
            name: name.into(),
            bytes: bytes.into(),
        }
    }
}

/// Type-state marker: nothing done yet
pub struct Idle;

/// Type-state marker: configuration assembled, module loaded
pub struct Configuring {
    module: Vec<u8>,
    sandbox: SandboxConfig,
    dropped: Vec<DroppedToken>,
    scratch: Option<TempDir>,
}

/// Type-state marker: the module ran (or could not)
pub struct Executed {
    result: ExecutionResult,
}

/// One emulated process lifetime.
pub struct Emulation<S> {
    config: EmulatorConfig,
    state: S,
}

impl Emulation<Idle> {
    /// Start an emulation with the given settings.
    pub fn new(config: EmulatorConfig) -> Self {
        Self { config, state: Idle }
    }

    /// Translate arguments, load the module and capture the process context.
    pub fn configure(
        self,
        source: ModuleSource,
        raw_args: Vec<String>,
        dialect: Dialect,
        host: HostProcess,
    ) -> Result<Emulation<Configuring>> {
        let mut mounts: Vec<MountSpec> = self
            .config
            .mounts
            .iter()
            .map(|m| MountSpec::new(&m.guest, m.host.clone()))
            .collect();

        let (mut args, dropped) = match dialect {
            Dialect::Canonical => (raw_args, Vec::new()),
            Dialect::Legacy => {
                let options = TranslateOptions {
                    strict: self.config.strict,
                    module_first: matches!(source, ModuleSource::FirstArgument),
                };
                let translation = translate::translate(&raw_args, host.cwd(), options)?;
                mounts.extend(translation.mounts);
                (translation.args, translation.dropped)
            }
        };

        let (module_name, module) = match source {
            ModuleSource::Bytes { name, bytes } => (name, bytes),
            ModuleSource::File(path) => {
                let bytes = read_module(&host.cwd().join(&path))?;
                (path.display().to_string(), bytes)
            }
            ModuleSource::FirstArgument => {
                if args.is_empty() {
                    return Err(EmulationError::Config(
                        "no module given: expected the module path as the first argument"
                            .to_string(),
                    ));
                }
                let path = args.remove(0);
                let bytes = read_module(&host.cwd().join(&path))?;
                (path, bytes)
            }
        };

        if mounts.is_empty() {
            tracing::debug!(cwd = %host.cwd().display(), "no mounts given, mounting working directory at /");
            mounts.push(MountSpec::root(host.cwd()));
        }

        let scratch = if self.config.scratch_tmp && !mounts.iter().any(|m| m.guest == SCRATCH_GUEST_PATH)
        {
            let dir = TempDir::new()?;
            mounts.push(MountSpec::new(SCRATCH_GUEST_PATH, dir.path()));
            Some(dir)
        } else {
            None
        };

        let context = ProcessContext::new(&module_name, args, host);
        let sandbox = SandboxConfig::assemble(context, mounts, self.config.capabilities);

        Ok(Emulation {
            config: self.config,
            state: Configuring {
                module,
                sandbox,
                dropped,
                scratch,
            },
        })
    }
}

impl Emulation<Configuring> {
    /// The assembled sandbox configuration.
    pub fn sandbox_config(&self) -> &SandboxConfig {
        &self.state.sandbox
    }

    /// Legacy tokens the translator dropped.
    pub fn dropped(&self) -> &[DroppedToken] {
        &self.state.dropped
    }

    /// Run the module once.
    pub fn execute<E: ModuleEngine + ?Sized>(self, engine: &E) -> Emulation<Executed> {
        let Configuring {
            module,
            sandbox,
            scratch,
            ..
        } = self.state;

        let result = engine.run(&module, sandbox);
        // The scratch directory lives exactly as long as the run.
        drop(scratch);

        Emulation {
            config: self.config,
            state: Executed { result },
        }
    }
}

impl Emulation<Executed> {
    /// The outcome.
    pub fn result(&self) -> &ExecutionResult {
        &self.state.result
    }

    /// Consume and return the outcome.
    pub fn into_result(self) -> ExecutionResult {
        self.state.result
    }

    /// Process exit status.
    pub fn exit_code(&self) -> i32 {
        self.state.result.exit_code()
    }

    /// Settings the emulation ran with.
    pub fn config(&self) -> &EmulatorConfig {
        &self.config
    }
}

/// Emulates processes with a fixed configuration and engine.
pub struct Emulator<E = WasmtimeEngine> {
    config: EmulatorConfig,
    engine: E,
}

impl Emulator<WasmtimeEngine> {
    /// Emulator backed by wasmtime.
    pub fn new(config: EmulatorConfig) -> Self {
        let engine = WasmtimeEngine::new(config.runtime.clone());
        Self { config, engine }
    }
}

impl<E: ModuleEngine> Emulator<E> {
    /// Emulator backed by another engine.
    pub fn with_engine(config: EmulatorConfig, engine: E) -> Self {
        Self { config, engine }
    }

    /// Run one emulation against an explicit host process.
    ///
    /// Configuration failures come back as [`ExecutionResult::HostError`].
    pub fn run(
        &self,
        source: ModuleSource,
        raw_args: Vec<String>,
        dialect: Dialect,
        host: HostProcess,
    ) -> ExecutionResult {
        match Emulation::new(self.config.clone()).configure(source, raw_args, dialect, host) {
            Ok(configured) => configured.execute(&self.engine).into_result(),
            Err(err) => ExecutionResult::HostError(err),
        }
    }

    /// Run one emulation as the current process and return its exit status.
    ///
    /// Host errors are reported on stderr.
    pub fn emulate(&self, source: ModuleSource, raw_args: Vec<String>, dialect: Dialect) -> i32 {
        let result = match HostProcess::current() {
            Ok(host) => self.run(source, raw_args, dialect, host),
            Err(err) => ExecutionResult::HostError(err),
        };
        if let Some(err) = result.host_error() {
            eprintln!("error: {}", err);
        }
        result.exit_code()
    }
}

/// Run `module_bytes` as a process named `module_name`.
pub fn emulate(module_name: &str, module_bytes: &[u8], raw_args: &[String], dialect: Dialect) -> i32 {
    Emulator::new(EmulatorConfig::default()).emulate(
        ModuleSource::bytes(module_name, module_bytes),
        raw_args.to_vec(),
        dialect,
    )
}

/// Entry point for binaries that embed a module.
///
/// ```rust,ignore
/// static MODULE: &[u8] = include_bytes!("tool.wasm");
///
/// fn main() {
///     std::process::exit(shimrun_sandbox::run_embedded("tool", MODULE));
/// }
/// ```
pub fn run_embedded(module_name: &str, module_bytes: &[u8]) -> i32 {
    let args: Vec<String> = std::env::args_os()
        .skip(1)
        .map(|a| a.to_string_lossy().into_owned())
        .collect();
    emulate(module_name, module_bytes, &args, Dialect::Canonical)
}

fn read_module(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| EmulationError::ModuleLoad(format!("cannot read {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ProcessEnv, Stdio};
    use crate::translate::DropReason;
    use std::cell::RefCell;

    /// Records what it was asked to run and answers with a fixed result.
    struct RecordingEngine {
        exit: i32,
        seen: RefCell<Vec<(Vec<u8>, SandboxConfig)>>,
        scratch_existed: RefCell<Option<bool>>,
    }

    impl RecordingEngine {
        fn exiting(exit: i32) -> Self {
            Self {
                exit,
                seen: RefCell::new(Vec::new()),
                scratch_existed: RefCell::new(None),
            }
        }

        fn only_config(&self) -> SandboxConfig {
            let seen = self.seen.borrow();
            assert_eq!(seen.len(), 1, "engine must run exactly once");
            seen[0].1.clone()
        }
    }

    impl ModuleEngine for RecordingEngine {
        fn run(&self, module: &[u8], config: SandboxConfig) -> ExecutionResult {
            if let Some(m) = config.mounts().iter().find(|m| m.guest == SCRATCH_GUEST_PATH) {
                *self.scratch_existed.borrow_mut() = Some(m.host.is_dir());
            }
            self.seen.borrow_mut().push((module.to_vec(), config));
            ExecutionResult::Exited(self.exit)
        }
    }

    fn host(cwd: &Path) -> HostProcess {
        HostProcess::new(ProcessEnv::from_entries(["USER=dev"]), Stdio::Inherit, cwd)
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn run_with(
        config: EmulatorConfig,
        engine: RecordingEngine,
        source: ModuleSource,
        raw: &[&str],
        dialect: Dialect,
    ) -> (ExecutionResult, RecordingEngine) {
        let emulator = Emulator::with_engine(config, engine);
        let result = emulator.run(source, args(raw), dialect, host(Path::new("/work")));
        (result, emulator.engine)
    }

    #[test]
    fn test_canonical_args_are_verbatim() {
        let (result, engine) = run_with(
            EmulatorConfig::default(),
            RecordingEngine::exiting(0),
            ModuleSource::bytes("tool", b"\0asm".to_vec()),
            &["run", "--dir=.", "x"],
            Dialect::Canonical,
        );
        assert_eq!(result.exit_code(), 0);
        let config = engine.only_config();
        assert_eq!(config.args(), ["tool", "run", "--dir=.", "x"]);
        assert_eq!(config.mounts(), [MountSpec::root("/work")]);
        assert_eq!(config.env().get("USER"), Some("dev"));
    }

    #[test]
    fn test_legacy_run_dir_scenario() {
        let (_, engine) = run_with(
            EmulatorConfig::default(),
            RecordingEngine::exiting(0),
            ModuleSource::bytes("tool", Vec::new()),
            &["run", "--dir=.", "--", "build", "-v"],
            Dialect::Legacy,
        );
        let config = engine.only_config();
        assert_eq!(config.args(), ["tool", "build", "-v"]);
        assert_eq!(config.mounts(), [MountSpec::root("/work")]);
    }

    #[test]
    fn test_legacy_mapdir_replaces_default_mount() {
        let (_, engine) = run_with(
            EmulatorConfig::default(),
            RecordingEngine::exiting(0),
            ModuleSource::bytes("conv", Vec::new()),
            &["--mapdir=/data::/tmp/local", "convert", "a.txt"],
            Dialect::Legacy,
        );
        let config = engine.only_config();
        assert_eq!(config.args(), ["conv", "convert", "a.txt"]);
        assert_eq!(config.mounts(), [MountSpec::new("/data", "/tmp/local")]);
    }

    #[test]
    fn test_translated_mounts_override_configured() {
        let config = EmulatorConfig::default().mount(MountSpec::new("/data", "/configured"));
        let (_, engine) = run_with(
            config,
            RecordingEngine::exiting(0),
            ModuleSource::bytes("tool", Vec::new()),
            &["--mapdir=/data::/flag"],
            Dialect::Legacy,
        );
        assert_eq!(
            engine.only_config().mounts(),
            [MountSpec::new("/data", "/flag")]
        );
    }

    #[test]
    fn test_exit_code_propagates() {
        let (result, _) = run_with(
            EmulatorConfig::default(),
            RecordingEngine::exiting(2),
            ModuleSource::bytes("tool", Vec::new()),
            &[],
            Dialect::Canonical,
        );
        assert_eq!(result.exit_code(), 2);
    }

    #[test]
    fn test_strict_translation_error_is_host_error() {
        let (result, engine) = run_with(
            EmulatorConfig::default().strict(true),
            RecordingEngine::exiting(0),
            ModuleSource::bytes("tool", Vec::new()),
            &["--invoke=main"],
            Dialect::Legacy,
        );
        assert!(matches!(
            result,
            ExecutionResult::HostError(EmulationError::Translation { .. })
        ));
        assert_eq!(result.exit_code(), crate::wasm::HOST_ERROR_EXIT_CODE);
        assert!(engine.seen.borrow().is_empty());
    }

    #[test]
    fn test_dropped_tokens_visible_while_configuring() {
        let configured = Emulation::new(EmulatorConfig::default())
            .configure(
                ModuleSource::bytes("tool", Vec::new()),
                args(&["--dir=../up", "--fuel=10"]),
                Dialect::Legacy,
                host(Path::new("/work")),
            )
            .unwrap();
        let reasons: Vec<_> = configured.dropped().iter().map(|d| d.reason).collect();
        assert_eq!(reasons, vec![DropReason::ParentTraversal, DropReason::Unsupported]);
        assert_eq!(configured.sandbox_config().mounts(), [MountSpec::root("/work")]);
    }

    #[test]
    fn test_first_argument_names_module_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("prog.wasm"), b"module-bytes").unwrap();

        let emulator = Emulator::with_engine(EmulatorConfig::default(), RecordingEngine::exiting(0));
        let result = emulator.run(
            ModuleSource::FirstArgument,
            args(&["run", "--dir=.", "prog.wasm", "x"]),
            Dialect::Legacy,
            host(dir.path()),
        );
        assert_eq!(result.exit_code(), 0);

        let seen = emulator.engine.seen.borrow();
        assert_eq!(seen[0].0, b"module-bytes");
        assert_eq!(seen[0].1.args(), ["prog.wasm", "x"]);
    }

    #[test]
    fn test_first_argument_keeps_flags_after_module() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("prog.wasm"), b"module-bytes").unwrap();

        let emulator = Emulator::with_engine(EmulatorConfig::default(), RecordingEngine::exiting(0));
        emulator.run(
            ModuleSource::FirstArgument,
            args(&["run", "--dir=.", "prog.wasm", "run", "--verbose", "x"]),
            Dialect::Legacy,
            host(dir.path()),
        );

        let config = emulator.engine.only_config();
        assert_eq!(config.args(), ["prog.wasm", "run", "--verbose", "x"]);
        assert_eq!(config.mounts(), [MountSpec::root(dir.path())]);
    }

    #[test]
    fn test_first_argument_missing() {
        let (result, _) = run_with(
            EmulatorConfig::default(),
            RecordingEngine::exiting(0),
            ModuleSource::FirstArgument,
            &["run", "--dir=."],
            Dialect::Legacy,
        );
        assert!(matches!(
            result,
            ExecutionResult::HostError(EmulationError::Config(_))
        ));
    }

    #[test]
    fn test_missing_module_file() {
        let (result, engine) = run_with(
            EmulatorConfig::default(),
            RecordingEngine::exiting(0),
            ModuleSource::File(PathBuf::from("/nonexistent/tool.wasm")),
            &[],
            Dialect::Canonical,
        );
        assert!(matches!(
            result,
            ExecutionResult::HostError(EmulationError::ModuleLoad(_))
        ));
        assert!(engine.seen.borrow().is_empty());
    }

    #[test]
    fn test_scratch_tmp_lives_for_the_run() {
        let (_, engine) = run_with(
            EmulatorConfig::default().scratch_tmp(true),
            RecordingEngine::exiting(0),
            ModuleSource::bytes("tool", Vec::new()),
            &[],
            Dialect::Canonical,
        );
        assert_eq!(*engine.scratch_existed.borrow(), Some(true));

        let config = engine.only_config();
        assert_eq!(config.mounts()[0], MountSpec::root("/work"));
        let scratch = &config.mounts()[1];
        assert_eq!(scratch.guest(), SCRATCH_GUEST_PATH);
        assert!(!scratch.host().exists(), "scratch dir must be removed after the run");
    }

    #[test]
    fn test_explicit_tmp_mount_suppresses_scratch() {
        let config = EmulatorConfig::default()
            .scratch_tmp(true)
            .mount(MountSpec::new("/tmp", "/var/tmp"));
        let (_, engine) = run_with(
            config,
            RecordingEngine::exiting(0),
            ModuleSource::bytes("tool", Vec::new()),
            &[],
            Dialect::Canonical,
        );
        assert_eq!(
            engine.only_config().mounts(),
            [MountSpec::new("/tmp", "/var/tmp")]
        );
    }

    #[test]
    fn test_config_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shimrun.json");
        std::fs::write(
            &path,
            r#"{
                "mounts": [{"guest": "data/", "host": "/srv/data"}],
                "strict": true,
                "capabilities": {"sleep": false},
                "runtime": {"max_execution_time_ms": 2000}
            }"#,
        )
        .unwrap();

        let config = EmulatorConfig::from_json_file(&path).unwrap();
        assert!(config.strict);
        assert!(!config.scratch_tmp);
        assert_eq!(config.capabilities, SandboxCapabilities::process().sleep(false));
        assert_eq!(config.runtime.max_execution_time_ms, 2000);

        let configured = Emulation::new(config)
            .configure(
                ModuleSource::bytes("tool", Vec::new()),
                Vec::new(),
                Dialect::Canonical,
                host(Path::new("/work")),
            )
            .unwrap();
        assert_eq!(
            configured.sandbox_config().mounts(),
            [MountSpec::new("/data", "/srv/data")]
        );
    }

    #[test]
    fn test_config_from_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            EmulatorConfig::from_json_file(&path),
            Err(EmulationError::Config(_))
        ));
    }
}
