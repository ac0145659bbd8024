//! `name/version` dependency strings and version negotiation.

use std::fmt;

use crate::error::{ErrorCode, VmError, VmResult};

/// A six-digit dependency version, e.g. `030008`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version(pub u32);

impl Version {
    pub fn parse(text: &str) -> Option<Self> {
        if text.len() != 6 || !text.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        text.parse().ok().map(Version)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06}", self.0)
    }
}

/// Split `list/030008` into name and version. A missing version asks for
/// any implementation.
pub fn parse_dependency(dep: &str, block: &str) -> VmResult<(String, Version)> {
    match dep.split_once('/') {
        None => Ok((dep.to_string(), Version(0))),
        Some((name, version)) => {
            let version = Version::parse(version).ok_or_else(|| {
                VmError::new(ErrorCode::BadBlockData)
                    .arg(block)
                    .arg(format!("malformed dependency \"{dep}\""))
            })?;
            Ok((name.to_string(), version))
        }
    }
}

/// Pick the highest of `available` (ascending) that satisfies
/// `requested`.
pub fn negotiate(name: &str, requested: Version, available: &[Version]) -> VmResult<Version> {
    let best = available.iter().copied().max().unwrap_or_default();
    if best < requested {
        return Err(VmError::new(ErrorCode::VersionTooOld)
            .arg(name)
            .arg(requested)
            .arg(best));
    }
    log::debug!("{name}: requested {requested}, using {best}");
    Ok(best)
}
