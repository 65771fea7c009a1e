// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Spool directory for job payloads.
//
// Each accepted document is written to its own temporary file and owned by a
// `PayloadHandle`.  Dropping the handle deletes the file, so every exit path
// releases storage.  Files left behind by a crashed run are removed by
// `sweep_orphans` at start-up.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};
use tempfile::TempPath;
use tracing::{debug, info, instrument, warn};

use edgeprint_core::error::{EdgePrintError, Result};
use edgeprint_core::types::{PayloadKind, PayloadRef};

/// File name prefix shared by every spooled payload.
pub const SPOOL_PREFIX: &str = "edgeprint-job-";

/// Compute the SHA-256 hex digest of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Owned spooled payload; the file is deleted when this is dropped.
#[derive(Debug)]
pub struct PayloadHandle {
    path: TempPath,
    reference: PayloadRef,
}

impl PayloadHandle {
    pub fn reference(&self) -> &PayloadRef {
        &self.reference
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the file now, reporting any error.
    pub fn release(self) -> Result<()> {
        let path = self.reference.path.clone();
        self.path.close()?;
        debug!(path = %path.display(), "payload released");
        Ok(())
    }
}

/// The spool directory.
#[derive(Debug, Clone)]
pub struct PayloadStore {
    dir: PathBuf,
}

impl PayloadStore {
    /// Use (and create if needed) `dir` as the spool directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            EdgePrintError::PayloadStorage(format!("create spool dir {}: {e}", dir.display()))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `bytes` to a fresh spool file.
    #[instrument(skip(self, bytes), fields(kind = ?kind, size = bytes.len()))]
    pub fn store(&self, kind: PayloadKind, bytes: &[u8]) -> Result<PayloadHandle> {
        let storage_err = |e: std::io::Error| EdgePrintError::PayloadStorage(format!("spool write: {e}"));

        let mut file = tempfile::Builder::new()
            .prefix(SPOOL_PREFIX)
            .suffix(&format!(".{}", kind.spool_extension()))
            .tempfile_in(&self.dir)
            .map_err(storage_err)?;
        file.write_all(bytes).map_err(storage_err)?;
        file.as_file().sync_all().map_err(storage_err)?;

        let path = file.into_temp_path();
        let reference = PayloadRef {
            path: path.to_path_buf(),
            size: bytes.len() as u64,
            sha256: sha256_hex(bytes),
        };
        debug!(path = %reference.path.display(), "payload spooled");
        Ok(PayloadHandle { path, reference })
    }

    /// Confirm the spooled file still exists and matches its recorded hash.
    pub fn verify(&self, reference: &PayloadRef) -> Result<()> {
        let mut file = std::fs::File::open(&reference.path).map_err(|e| {
            EdgePrintError::PayloadStorage(format!("{}: {e}", reference.path.display()))
        })?;
        let mut hasher = Sha256::new();
        let size = std::io::copy(&mut file, &mut hasher).map_err(|e| {
            EdgePrintError::PayloadStorage(format!("{}: {e}", reference.path.display()))
        })?;
        let actual = hex::encode(hasher.finalize());

        if size != reference.size || actual != reference.sha256 {
            warn!(
                path = %reference.path.display(),
                expected = %reference.sha256,
                actual = %actual,
                "spooled payload changed on disk"
            );
            return Err(EdgePrintError::PayloadStorage(format!(
                "integrity check failed for {}",
                reference.path.display()
            )));
        }
        Ok(())
    }

    /// Delete spool files older than `max_age`.  Returns how many were removed.
    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    pub fn sweep_orphans(&self, max_age: Duration) -> Result<usize> {
        let now = SystemTime::now();
        let mut removed = 0;

        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(SPOOL_PREFIX) {
                continue;
            }
            let modified = match entry.metadata().and_then(|m| m.modified()) {
                Ok(t) => t,
                Err(e) => {
                    warn!(file = ?name, error = %e, "cannot stat spool file");
                    continue;
                }
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age <= max_age {
                continue;
            }
            match std::fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!(file = ?name, error = %e, "failed to remove orphaned payload"),
            }
        }

        if removed > 0 {
            info!(removed, "orphaned payloads swept");
        }
        Ok(removed)
    }
}
