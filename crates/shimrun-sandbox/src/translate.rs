//! Legacy flag dialect translation.
//!
//! Toolchains that expect to shell out to `wasmtime run` pass flags such as
//! `--dir=.` and `--mapdir=GUEST::HOST` ahead of the module arguments. The
//! translator turns those into [`MountSpec`]s and leaves everything else as
//! program arguments:
//!
//! ```text
//! run --dir=. -- build -v   =>   mounts: [<cwd> at /]   args: [build, -v]
//! ```
//!
//! Unsupported flags are dropped so the translator can front a narrower
//! interface. [`TranslateOptions::strict`] turns those drops into errors.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EmulationError, Result};
use crate::mount::{self, GuestDefault, MountSpec, MountSyntax};

/// Program name under which the legacy dialect is selected automatically.
pub const LEGACY_PROGRAM_NAME: &str = "wasmtime";

/// Command-line flag vocabulary of the raw argument vector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// Arguments are program arguments, verbatim
    #[default]
    Canonical,
    /// Arguments may carry `wasmtime`-style runtime flags
    Legacy,
}

impl Dialect {
    /// Pick the dialect from the name the binary was invoked under.
    pub fn from_program_name(argv0: &str) -> Self {
        let stem = Path::new(argv0)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        if stem == LEGACY_PROGRAM_NAME {
            Dialect::Legacy
        } else {
            Dialect::Canonical
        }
    }
}

/// Translator settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslateOptions {
    /// Fail on malformed or unsupported flags instead of dropping them
    pub strict: bool,
    /// The first plain argument names the module; it and everything after
    /// it are program arguments, as in `wasmtime run [FLAGS] MODULE [ARGS]`
    pub module_first: bool,
}

/// Why a token was left out of the translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// `--dir=` path escapes through `..`
    ParentTraversal,
    /// Recognized flag with an unusable value
    Malformed,
    /// Flag not understood by the translator
    Unsupported,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DropReason::ParentTraversal => "path contains a parent-directory segment",
            DropReason::Malformed => "malformed flag value",
            DropReason::Unsupported => "unsupported flag",
        })
    }
}

/// A token the translator did not turn into a mount or argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedToken {
    /// The token, verbatim
    pub token: String,
    /// Why it was dropped
    pub reason: DropReason,
}

/// Result of translating a legacy argument vector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Translation {
    /// Mounts in token order
    pub mounts: Vec<MountSpec>,
    /// Residual program arguments (module name not included)
    pub args: Vec<String>,
    /// Tokens dropped along the way
    pub dropped: Vec<DroppedToken>,
}

impl Translation {
    fn drop_token(&mut self, token: &str, reason: DropReason, options: TranslateOptions) -> Result<()> {
        if options.strict && reason != DropReason::ParentTraversal {
            return Err(EmulationError::Translation {
                token: token.to_string(),
                reason: reason.to_string(),
            });
        }
        tracing::debug!(token, %reason, "dropping legacy flag");
        self.dropped.push(DroppedToken {
            token: token.to_string(),
            reason,
        });
        Ok(())
    }
}

/// Translate a legacy-dialect argument vector.
///
/// `cwd` is the host directory mounted at `/` for `--dir=.`.
pub fn translate<S: AsRef<str>>(
    raw_args: &[S],
    cwd: &Path,
    options: TranslateOptions,
) -> Result<Translation> {
    let mut out = Translation::default();
    let mut tokens = raw_args.iter().map(AsRef::as_ref);

    while let Some(token) = tokens.next() {
        if token == "--" {
            out.args.extend(tokens.by_ref().map(String::from));
            break;
        }

        if token == "run" {
            continue;
        }

        if let Some(path) = token.strip_prefix("--dir=") {
            if path.is_empty() {
                out.drop_token(token, DropReason::Malformed, options)?;
            } else if path == "." {
                out.mounts.push(MountSpec::root(cwd));
            } else if mount::contains_parent_traversal(path) {
                out.drop_token(token, DropReason::ParentTraversal, options)?;
            } else {
                out.mounts.push(MountSpec::new(path, path));
            }
            continue;
        }

        if let Some(pair) = token.strip_prefix("--mapdir=") {
            match mount::resolve(pair, MountSyntax::GuestDoubleColonHost, GuestDefault::Root) {
                Ok(m) => out.mounts.push(m),
                Err(_) => out.drop_token(token, DropReason::Malformed, options)?,
            }
            continue;
        }

        if let Some(spec) = token.strip_prefix("--mount=") {
            match spec.parse::<MountSpec>() {
                Ok(m) => out.mounts.push(m),
                Err(_) => out.drop_token(token, DropReason::Malformed, options)?,
            }
            continue;
        }

        if token.starts_with("--") {
            out.drop_token(token, DropReason::Unsupported, options)?;
            continue;
        }

        out.args.push(token.to_string());
        if options.module_first {
            out.args.extend(tokens.by_ref().map(String::from));
            break;
        }
    }

    tracing::debug!(
        mounts = out.mounts.len(),
        args = out.args.len(),
        dropped = out.dropped.len(),
        "translated legacy arguments"
    );
    Ok(out)
}
