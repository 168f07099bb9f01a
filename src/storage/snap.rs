//! Snapshot store.
//!
//! One file per snapshot, named `<term>-<index>.snap` (16-digit hex each)
//! so that lexical order is index order.  The file is JSON carrying the
//! store payload and its SHA-256 checksum.  Writes go through a temp file
//! in the same directory, fsync, then rename.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

const SNAP_SUFFIX: &str = ".snap";
const BROKEN_SUFFIX: &str = ".broken";

#[derive(Debug, Error)]
pub enum SnapError {
    #[error("snapshot I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A point-in-time copy of the applied store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Last log index reflected in `data`.
    pub index: u64,
    /// Term of the entry at `index`.
    pub term: u64,
    /// Voting members at `index`.
    pub nodes: Vec<u64>,
    /// Serialized store.
    #[serde(with = "super::base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct SnapFile {
    checksum: String,
    snapshot: Snapshot,
}

fn checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Reads and writes snapshot files in one directory.
#[derive(Debug, Clone)]
pub struct Snapshotter {
    dir: PathBuf,
}

impl Snapshotter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Load the newest readable snapshot.
    ///
    /// A file that fails to parse or whose checksum does not match is
    /// renamed aside with a `.broken` suffix and the next older one is
    /// tried.  An empty (or missing) directory yields `Ok(None)`.
    pub fn load(&self) -> Result<Option<Snapshot>, SnapError> {
        for name in self.snap_names()?.into_iter().rev() {
            let path = self.dir.join(&name);
            match read_snap(&path) {
                Ok(snap) => {
                    debug!(file = %path.display(), index = snap.index, "Loaded snapshot");
                    return Ok(Some(snap));
                }
                Err(reason) => {
                    warn!(file = %path.display(), %reason, "Skipping unreadable snapshot");
                    let broken = self.dir.join(format!("{name}{BROKEN_SUFFIX}"));
                    std::fs::rename(&path, &broken).map_err(|source| SnapError::Io {
                        path: path.clone(),
                        source,
                    })?;
                }
            }
        }
        Ok(None)
    }

    /// Persist `snap` durably.
    pub fn save(&self, snap: &Snapshot) -> Result<PathBuf, SnapError> {
        let file = SnapFile {
            checksum: checksum(&snap.data),
            snapshot: snap.clone(),
        };
        let body = serde_json::to_vec(&file)?;
        let final_path = self.dir.join(format!(
            "{:016x}-{:016x}{SNAP_SUFFIX}",
            snap.term, snap.index
        ));
        let io = |source| SnapError::Io {
            path: final_path.clone(),
            source,
        };

        // Crash-only: temp-fsync-rename.
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).map_err(io)?;
        tmp.write_all(&body).map_err(io)?;
        tmp.as_file().sync_all().map_err(io)?;
        tmp.persist(&final_path).map_err(|e| io(e.error))?;
        Ok(final_path)
    }

    fn snap_names(&self) -> Result<Vec<String>, SnapError> {
        let read = match std::fs::read_dir(&self.dir) {
            Ok(read) => read,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(SnapError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };
        let mut names = Vec::new();
        for dirent in read {
            let dirent = dirent.map_err(|source| SnapError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let name = dirent.file_name().to_string_lossy().into_owned();
            if name.ends_with(SNAP_SUFFIX) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

fn read_snap(path: &Path) -> Result<Snapshot, String> {
    let body = std::fs::read(path).map_err(|e| e.to_string())?;
    let file: SnapFile = serde_json::from_slice(&body).map_err(|e| e.to_string())?;
    if file.checksum != checksum(&file.snapshot.data) {
        return Err("checksum mismatch".to_string());
    }
    Ok(file.snapshot)
}
