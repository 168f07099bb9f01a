//! On-disk layout of a node's data directory.
//!
//! ```text
//! <data-dir>/
//!   snap/   snapshot files
//!   wal/    log segments
//! ```

use std::path::{Path, PathBuf};

use tracing::info;

use super::create_private_dir;
use super::wal::Wal;
use crate::errors::StartupError;

/// Whether this process is the first run against its data directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapMode {
    /// No log exists yet: join or form a cluster.
    Fresh,
    /// A log exists: resume from what was persisted.
    Recovery,
}

/// Resolved paths under a data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDir {
    pub root: PathBuf,
    pub snap_dir: PathBuf,
    pub wal_dir: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            snap_dir: root.join("snap"),
            wal_dir: root.join("wal"),
            root,
        }
    }
}

/// Default data directory name for a member.
pub fn default_data_dir(member_id: u64) -> PathBuf {
    PathBuf::from(format!("{member_id:016x}_kvnode_data"))
}

/// Classify the data directory, then create the root and snapshot
/// directories.
///
/// The mode is computed before anything is created so directory creation
/// can never flip it.  The log directory itself is left to
/// [`Wal::create`] on the fresh path.
pub fn prepare(root: &Path) -> Result<(DataDir, BootstrapMode), StartupError> {
    let dir = DataDir::new(root);
    let mode = if Wal::exist(&dir.wal_dir) {
        BootstrapMode::Recovery
    } else {
        BootstrapMode::Fresh
    };

    for path in [&dir.root, &dir.snap_dir] {
        create_private_dir(path).map_err(|source| StartupError::Filesystem {
            path: path.clone(),
            source,
        })?;
    }

    info!(data_dir = %dir.root.display(), ?mode, "Data directory ready");
    Ok((dir, mode))
}
