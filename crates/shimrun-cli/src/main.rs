//! shimrun Command-Line Interface
//!
//! Runs a WebAssembly/WASI module as if it were a native executable:
//! - `run`: canonical flags, `--mount HOST[:GUEST]`
//! - `compat`: `wasmtime run`-style flags (`--dir`, `--mapdir`)
//!
//! Installed (or symlinked) under the name `wasmtime`, the binary behaves as
//! `shimrun compat`, so toolchains that shell out to `wasmtime run` can use it
//! unchanged.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shimrun_sandbox::{Dialect, Emulator, EmulatorConfig, ModuleSource, MountSpec, RuntimeConfig};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser)]
#[command(name = "shimrun")]
#[command(author, version, about = "Run WASI modules as native commands", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a module with canonical flags
    Run {
        /// Map a host directory into the sandbox (repeatable)
        #[arg(long = "mount", value_name = "HOST[:GUEST]")]
        mounts: Vec<MountSpec>,

        /// Mount a fresh temporary directory at /tmp
        #[arg(long)]
        tmpdir: bool,

        /// Interrupt the module after this many milliseconds
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,

        /// Linear memory ceiling in bytes
        #[arg(long, value_name = "BYTES")]
        max_memory: Option<usize>,

        /// Fuel budget
        #[arg(long)]
        fuel: Option<u64>,

        /// JSON configuration file
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Module file (.wasm or .wat)
        module: PathBuf,

        /// Arguments passed to the module
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Run with wasmtime-style flags; the first plain argument is the module
    Compat {
        /// Fail on malformed or unsupported flags instead of ignoring them
        #[arg(long)]
        strict: bool,

        /// Do not mount a temporary directory at /tmp
        #[arg(long)]
        no_tmpdir: bool,

        /// JSON configuration file
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// wasmtime-style arguments, e.g. `run --dir=. tool.wasm -v`
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

fn init_logging(verbose: u8) {
    let log_level = match verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    // Module stdout must stay clean.
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Load `path`, or fall back to the command's defaults when none is given.
fn load_config(path: Option<&Path>, defaults: EmulatorConfig) -> Result<EmulatorConfig> {
    match path {
        Some(path) => EmulatorConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(defaults),
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_run(
    mounts: Vec<MountSpec>,
    tmpdir: bool,
    timeout_ms: Option<u64>,
    max_memory: Option<usize>,
    fuel: Option<u64>,
    config: Option<PathBuf>,
    module: PathBuf,
    args: Vec<String>,
) -> Result<i32> {
    let mut config = load_config(config.as_deref(), EmulatorConfig::default())?;
    config.mounts.extend(mounts);
    // Flags override the config file only when given.
    if tmpdir {
        config.scratch_tmp = true;
    }
    config.runtime = apply_limits(config.runtime, timeout_ms, max_memory, fuel);

    info!("Running {} with {} argument(s)", module.display(), args.len());
    Ok(Emulator::new(config).emulate(ModuleSource::File(module), args, Dialect::Canonical))
}

fn compat_config(strict: bool, no_tmpdir: bool, config: Option<&Path>) -> Result<EmulatorConfig> {
    let mut config = load_config(config, EmulatorConfig::default().scratch_tmp(true))?;
    if strict {
        config.strict = true;
    }
    if no_tmpdir {
        config.scratch_tmp = false;
    }
    Ok(config)
}

fn cmd_compat(strict: bool, no_tmpdir: bool, config: Option<PathBuf>, args: Vec<String>) -> Result<i32> {
    let config = compat_config(strict, no_tmpdir, config.as_deref())?;

    info!("Running in compat mode: {:?}", args);
    Ok(Emulator::new(config).emulate(ModuleSource::FirstArgument, args, Dialect::Legacy))
}

fn apply_limits(
    mut runtime: RuntimeConfig,
    timeout_ms: Option<u64>,
    max_memory: Option<usize>,
    fuel: Option<u64>,
) -> RuntimeConfig {
    if let Some(ms) = timeout_ms {
        runtime.max_execution_time_ms = ms;
    }
    if let Some(bytes) = max_memory {
        runtime.max_memory = bytes;
    }
    if let Some(fuel) = fuel {
        runtime.fuel_limit = Some(fuel);
    }
    runtime
}

/// Arguments when invoked under the legacy program name, `None` otherwise.
fn legacy_invocation(mut argv: impl Iterator<Item = OsString>) -> Option<Vec<String>> {
    let argv0 = argv.next()?;
    if Dialect::from_program_name(&argv0.to_string_lossy()) != Dialect::Legacy {
        return None;
    }
    Some(argv.map(|a| a.to_string_lossy().into_owned()).collect())
}

fn main() -> Result<()> {
    if let Some(args) = legacy_invocation(std::env::args_os()) {
        init_logging(0);
        let code = cmd_compat(false, false, None, args)?;
        std::process::exit(code);
    }

    let cli = Cli::parse();
    init_logging(cli.verbose);

    let code = match cli.command {
        Commands::Run {
            mounts,
            tmpdir,
            timeout_ms,
            max_memory,
            fuel,
            config,
            module,
            args,
        } => cmd_run(mounts, tmpdir, timeout_ms, max_memory, fuel, config, module, args)?,

        Commands::Compat {
            strict,
            no_tmpdir,
            config,
            args,
        } => cmd_compat(strict, no_tmpdir, config, args)?,
    };

    std::process::exit(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn os(args: &[&str]) -> Vec<OsString> {
        args.iter().map(OsString::from).collect()
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_parses_mounts_and_trailing_args() {
        let cli = Cli::try_parse_from([
            "shimrun", "run", "--mount", "/srv/data:/data", "--mount=out", "tool.wasm", "--flag",
            "-x", "input",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                mounts, module, args, ..
            } => {
                assert_eq!(
                    mounts,
                    vec![MountSpec::new("/data", "/srv/data"), MountSpec::new("/out", "out")]
                );
                assert_eq!(module, PathBuf::from("tool.wasm"));
                assert_eq!(args, vec!["--flag", "-x", "input"]);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_run_rejects_empty_mount() {
        assert!(Cli::try_parse_from(["shimrun", "run", "--mount=", "tool.wasm"]).is_err());
    }

    #[test]
    fn test_compat_keeps_legacy_flags() {
        let cli = Cli::try_parse_from([
            "shimrun", "-v", "compat", "--strict", "run", "--dir=.", "tool.wasm", "--", "-v",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Commands::Compat { strict, args, .. } => {
                assert!(strict);
                assert_eq!(args, vec!["run", "--dir=.", "tool.wasm", "--", "-v"]);
            }
            _ => panic!("expected compat"),
        }
    }

    #[test]
    fn test_legacy_invocation_by_program_name() {
        assert_eq!(
            legacy_invocation(os(&["/usr/bin/wasmtime", "run", "--dir=.", "t.wasm"]).into_iter()),
            Some(vec!["run".to_string(), "--dir=.".to_string(), "t.wasm".to_string()])
        );
        assert_eq!(legacy_invocation(os(&["shimrun", "run"]).into_iter()), None);
        assert_eq!(legacy_invocation(std::iter::empty()), None);
    }

    #[test]
    fn test_compat_scratch_precedence() {
        assert!(compat_config(false, false, None).unwrap().scratch_tmp);
        assert!(!compat_config(false, true, None).unwrap().scratch_tmp);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shimrun.json");
        std::fs::write(&path, r#"{ "scratch_tmp": false, "strict": true }"#).unwrap();
        let config = compat_config(false, false, Some(&path)).unwrap();
        assert!(!config.scratch_tmp);
        assert!(config.strict);

        std::fs::write(&path, r#"{ "scratch_tmp": true }"#).unwrap();
        assert!(!compat_config(false, true, Some(&path)).unwrap().scratch_tmp);
    }

    #[test]
    fn test_missing_config_file_has_context() {
        let err = compat_config(false, false, Some(Path::new("/nonexistent/shimrun.json")))
            .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/shimrun.json"));
    }

    #[test]
    fn test_apply_limits_overrides_only_given() {
        let base = RuntimeConfig::default().fuel_limit(10);
        let runtime = apply_limits(base, Some(500), None, None);
        assert_eq!(runtime.max_execution_time_ms, 500);
        assert_eq!(runtime.max_memory, 0);
        assert_eq!(runtime.fuel_limit, Some(10));
    }
}
