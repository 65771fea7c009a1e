// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Platform-aware data directory resolution.

use std::ffi::OsString;
use std::path::PathBuf;

use edgeprint_core::error::Result;

/// Overrides the data directory.
pub const DATA_DIR_ENV: &str = "EDGEPRINT_DATA_DIR";

/// Return the service data directory, creating it if needed.
///
/// `EDGEPRINT_DATA_DIR` wins; otherwise `edgeprint` under the platform's
/// per-user data location.
pub fn data_dir() -> Result<PathBuf> {
    let dir = resolve(std::env::var_os(DATA_DIR_ENV), platform_base());
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn resolve(explicit: Option<OsString>, base: PathBuf) -> PathBuf {
    match explicit {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => base.join("edgeprint"),
    }
}

fn platform_base() -> PathBuf {
    if cfg!(windows)
        && let Some(local) = std::env::var_os("LOCALAPPDATA")
    {
        return PathBuf::from(local);
    }
    // XDG data dir, then home
    if let Some(xdg) = std::env::var_os("XDG_DATA_HOME") {
        return PathBuf::from(xdg);
    }
    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home).join(".local").join("share");
    }
    std::env::temp_dir()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_directory_wins() {
        let dir = resolve(Some("/srv/edgeprint".into()), PathBuf::from("/home/u/.local/share"));
        assert_eq!(dir, PathBuf::from("/srv/edgeprint"));
    }

    #[test]
    fn empty_override_falls_back_to_base() {
        let base = PathBuf::from("/home/u/.local/share");
        assert_eq!(resolve(Some(OsString::new()), base.clone()), base.join("edgeprint"));
        assert_eq!(resolve(None, base.clone()), base.join("edgeprint"));
    }
}
