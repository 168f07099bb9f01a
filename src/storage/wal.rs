//! Append-only consensus log.
//!
//! A log directory holds segment files named `<seq>-<index>.wal` (both
//! 16-digit hex).  Each line of a segment is one JSON record:
//!
//! ```text
//! {"type":"entry","data":"<base64 protobuf Entry>"}
//! {"type":"state","data":"<base64 protobuf HardState>"}
//! {"type":"info","data":"<base64 big-endian node id>"}
//! ```
//!
//! Records are only ever appended.  A later entry for an index already seen
//! replaces it and everything after it (the leader overwrote an uncommitted
//! suffix).  The newest `state` record wins.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use protobuf::Message as PbMessage;
use raft::eraftpb::{Entry, HardState};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::create_private_dir;

const SEGMENT_EXT: &str = "wal";

#[derive(Debug, Error)]
pub enum WalError {
    #[error("log I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("log already exists in {0}")]
    AlreadyExists(PathBuf),

    #[error("no log found in {0}")]
    NotFound(PathBuf),

    #[error("corrupt record at {path}:{line}: {reason}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("log gap: expected entry {expected}, found {found}")]
    Gap { expected: u64, found: u64 },

    #[error("cannot encode record: {0}")]
    Encode(#[from] protobuf::ProtobufError),

    #[error("cannot encode record: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum RecordType {
    Info,
    State,
    Entry,
}

#[derive(Debug, Serialize, Deserialize)]
struct Record {
    #[serde(rename = "type")]
    kind: RecordType,
    #[serde(with = "super::base64_bytes")]
    data: Vec<u8>,
}

impl Record {
    fn encode_line(&self) -> Result<Vec<u8>, WalError> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

/// An open log.
#[derive(Debug)]
pub struct Wal {
    dir: PathBuf,
    /// Segment records are appended to.
    tail: PathBuf,
    file: File,
    /// Entries at or below this index are covered by a snapshot.
    start_index: u64,
}

impl Wal {
    /// Whether `dir` holds at least one log segment.
    pub fn exist(dir: &Path) -> bool {
        segments(dir).map(|s| !s.is_empty()).unwrap_or(false)
    }

    /// Create a new, empty log in `dir`.
    pub fn create(dir: &Path) -> Result<Self, WalError> {
        create_private_dir(dir).map_err(|source| io_err(dir, source))?;
        if Wal::exist(dir) {
            return Err(WalError::AlreadyExists(dir.to_path_buf()));
        }
        let tail = dir.join(segment_name(0, 0));
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&tail)
            .map_err(|source| io_err(&tail, source))?;
        // Make the new segment's directory entry durable.
        sync_dir(dir)?;
        debug!(segment = %tail.display(), "Created log");
        Ok(Self {
            dir: dir.to_path_buf(),
            tail,
            file,
            start_index: 0,
        })
    }

    /// Open an existing log for replay from `index` onwards.
    pub fn open_at_index(dir: &Path, index: u64) -> Result<Self, WalError> {
        let names = segments(dir).map_err(|source| io_err(dir, source))?;
        let tail = match names.last() {
            Some(last) => dir.join(last),
            None => return Err(WalError::NotFound(dir.to_path_buf())),
        };
        let file = OpenOptions::new()
            .append(true)
            .open(&tail)
            .map_err(|source| io_err(&tail, source))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            tail,
            file,
            start_index: index,
        })
    }

    /// Replay the log.
    ///
    /// Returns the persisted node id (zero when none was recorded), the
    /// newest hard state, and every entry with an index above the open
    /// index, contiguous from `index + 1`.  An unterminated final record
    /// is the remains of an interrupted write: it is dropped and cut off
    /// the segment so later appends start on a clean line.
    pub fn read_all(&mut self) -> Result<(u64, HardState, Vec<Entry>), WalError> {
        let names = segments(&self.dir).map_err(|source| io_err(&self.dir, source))?;
        let mut node_id = 0;
        let mut hard_state = HardState::default();
        let mut entries: Vec<Entry> = Vec::new();

        for name in &names {
            let path = self.dir.join(name);
            let raw = std::fs::read(&path).map_err(|source| io_err(&path, source))?;
            let complete = match raw.iter().rposition(|b| *b == b'\n') {
                Some(pos) => pos + 1,
                None => 0,
            };
            if complete < raw.len() {
                if path != self.tail {
                    return Err(WalError::Corrupt {
                        path,
                        line: raw[..complete].split(|b| *b == b'\n').count(),
                        reason: "unterminated record in sealed segment".into(),
                    });
                }
                warn!(
                    segment = %path.display(),
                    dropped_bytes = raw.len() - complete,
                    "Dropping torn record at end of log"
                );
                self.file
                    .set_len(complete as u64)
                    .and_then(|_| self.file.sync_all())
                    .map_err(|source| io_err(&path, source))?;
            }

            for (n, line) in raw[..complete].split(|b| *b == b'\n').enumerate() {
                if line.is_empty() {
                    continue;
                }
                let corrupt = |reason: String| WalError::Corrupt {
                    path: path.clone(),
                    line: n + 1,
                    reason,
                };
                let record: Record =
                    serde_json::from_slice(line).map_err(|e| corrupt(e.to_string()))?;
                match record.kind {
                    RecordType::Info => {
                        let bytes: [u8; 8] = record
                            .data
                            .as_slice()
                            .try_into()
                            .map_err(|_| corrupt("info record is not 8 bytes".into()))?;
                        node_id = u64::from_be_bytes(bytes);
                    }
                    RecordType::State => {
                        hard_state = HardState::parse_from_bytes(&record.data)
                            .map_err(|e| corrupt(e.to_string()))?;
                    }
                    RecordType::Entry => {
                        let entry = Entry::parse_from_bytes(&record.data)
                            .map_err(|e| corrupt(e.to_string()))?;
                        self.push_entry(&mut entries, entry)?;
                    }
                }
            }
        }

        debug!(
            start_index = self.start_index,
            entries = entries.len(),
            commit = hard_state.commit,
            "Replayed log"
        );
        Ok((node_id, hard_state, entries))
    }

    fn push_entry(&self, entries: &mut Vec<Entry>, entry: Entry) -> Result<(), WalError> {
        if entry.index <= self.start_index {
            return Ok(());
        }
        let pos = (entry.index - self.start_index - 1) as usize;
        if pos > entries.len() {
            return Err(WalError::Gap {
                expected: self.start_index + entries.len() as u64 + 1,
                found: entry.index,
            });
        }
        entries.truncate(pos);
        entries.push(entry);
        Ok(())
    }

    /// Append `entries` then `hard_state` (if set) and fsync.
    pub fn save(&mut self, hard_state: &HardState, entries: &[Entry]) -> Result<(), WalError> {
        if entries.is_empty() && *hard_state == HardState::default() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for entry in entries {
            buf.extend(
                Record {
                    kind: RecordType::Entry,
                    data: entry.write_to_bytes()?,
                }
                .encode_line()?,
            );
        }
        if *hard_state != HardState::default() {
            buf.extend(
                Record {
                    kind: RecordType::State,
                    data: hard_state.write_to_bytes()?,
                }
                .encode_line()?,
            );
        }
        self.file
            .write_all(&buf)
            .and_then(|_| self.file.sync_data())
            .map_err(|source| io_err(&self.tail, source))
    }
}

fn io_err(path: &Path, source: std::io::Error) -> WalError {
    WalError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn segment_name(seq: u64, index: u64) -> String {
    format!("{seq:016x}-{index:016x}.{SEGMENT_EXT}")
}

fn parse_segment_name(name: &str) -> Option<(u64, u64)> {
    let stem = name.strip_suffix(".wal")?;
    let (seq, index) = stem.split_once('-')?;
    if seq.len() != 16 || index.len() != 16 {
        return None;
    }
    Some((
        u64::from_str_radix(seq, 16).ok()?,
        u64::from_str_radix(index, 16).ok()?,
    ))
}

/// Segment file names in `dir`, oldest first.  A missing directory has none.
fn segments(dir: &Path) -> std::io::Result<Vec<String>> {
    let read = match std::fs::read_dir(dir) {
        Ok(read) => read,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut names: Vec<(u64, String)> = Vec::new();
    for dirent in read {
        let name = dirent?.file_name().to_string_lossy().into_owned();
        if let Some((seq, _)) = parse_segment_name(&name) {
            names.push((seq, name));
        }
    }
    names.sort();
    Ok(names.into_iter().map(|(_, name)| name).collect())
}

fn sync_dir(dir: &Path) -> Result<(), WalError> {
    #[cfg(unix)]
    {
        File::open(dir)
            .and_then(|d| d.sync_all())
            .map_err(|source| io_err(dir, source))?;
    }
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}
