//! Mount specifications: which host directory backs which guest path.
//!
//! Three token shapes are understood:
//!
//! | Syntax | Example | Used by |
//! |--------|---------|---------|
//! | `HOST[:GUEST]` | `./out:/out` | canonical `--mount=` |
//! | `GUEST::HOST` | `/data::/tmp/local` | legacy `--mapdir=` |
//! | `GUEST=HOST` | `/data=/tmp/local` | explicit pairing |

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{EmulationError, Result};

/// A host directory exposed to the module under a guest path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MountSpec {
    /// Absolute path inside the sandbox namespace
    pub guest: String,
    /// Host directory backing the guest path
    pub host: PathBuf,
}

/// Token shape accepted by [`resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountSyntax {
    /// `HOST[:GUEST]`
    HostColonGuest,
    /// `GUEST::HOST`
    GuestDoubleColonHost,
    /// `GUEST=HOST`
    GuestEqualsHost,
}

/// Guest path to use when a token names only the host side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestDefault {
    /// Mount at the same path the host uses
    SameAsHost,
    /// Mount at the sandbox root
    Root,
}

impl MountSpec {
    /// Create a mount, normalizing the guest path to absolute form.
    pub fn new(guest: impl AsRef<str>, host: impl Into<PathBuf>) -> Self {
        Self {
            guest: normalize_guest(guest.as_ref()),
            host: host.into(),
        }
    }

    /// Mount `host` at the sandbox root.
    pub fn root(host: impl Into<PathBuf>) -> Self {
        Self::new("/", host)
    }

    /// Guest path.
    pub fn guest(&self) -> &str {
        &self.guest
    }

    /// Host path.
    pub fn host(&self) -> &Path {
        &self.host
    }
}

impl fmt::Display for MountSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host.display(), self.guest)
    }
}

impl FromStr for MountSpec {
    type Err = EmulationError;

    fn from_str(s: &str) -> Result<Self> {
        resolve(s, MountSyntax::HostColonGuest, GuestDefault::SameAsHost)
    }
}

/// Parse a single mount token.
pub fn resolve(token: &str, syntax: MountSyntax, default: GuestDefault) -> Result<MountSpec> {
    let invalid = |reason| EmulationError::InvalidMount {
        token: token.to_string(),
        reason,
    };

    let (guest, host) = match syntax {
        MountSyntax::HostColonGuest => {
            let (host, guest) = split_host_guest(token);
            (guest.filter(|g| !g.is_empty()), host)
        }
        MountSyntax::GuestDoubleColonHost => {
            let (guest, host) = token.split_once("::").ok_or(invalid("missing '::' separator"))?;
            (Some(guest), host)
        }
        MountSyntax::GuestEqualsHost => {
            let (guest, host) = token.split_once('=').ok_or(invalid("missing '=' separator"))?;
            (Some(guest), host)
        }
    };

    if host.is_empty() {
        return Err(invalid("empty host path"));
    }

    let guest = match (guest, default) {
        (Some(""), _) => return Err(invalid("empty guest path")),
        (Some(guest), _) => guest,
        (None, GuestDefault::SameAsHost) => host,
        (None, GuestDefault::Root) => "/",
    };

    Ok(MountSpec::new(guest, host))
}

/// True when any segment of `path` is `..`.
pub fn contains_parent_traversal(path: &str) -> bool {
    path.split(['/', '\\']).any(|segment| segment == "..")
}

/// Collapse duplicate guest paths, keeping the last occurrence.
///
/// The surviving entry takes the position of the last occurrence.
pub fn dedup_mounts(mounts: Vec<MountSpec>) -> Vec<MountSpec> {
    let mut out: Vec<MountSpec> = Vec::with_capacity(mounts.len());
    for mount in mounts {
        if out.iter().any(|m| m.guest == mount.guest) {
            tracing::debug!(guest = %mount.guest, "duplicate guest path, last mount wins");
            out.retain(|m| m.guest != mount.guest);
        }
        out.push(mount);
    }
    out
}

fn normalize_guest(guest: &str) -> String {
    let trimmed = guest.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

fn split_host_guest(token: &str) -> (&str, Option<&str>) {
    let skip = if has_drive_prefix(token) { 2 } else { 0 };
    match token[skip..].find(':') {
        Some(i) => (&token[..skip + i], Some(&token[skip + i + 1..])),
        None => (token, None),
    }
}

// `C:\` or `C:/`
fn has_drive_prefix(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() >= 3 && b[0].is_ascii_alphabetic() && b[1] == b':' && (b[2] == b'\\' || b[2] == b'/')
}
