use crate::error::Result;
use crate::store::Value;

use chrono::{DateTime, Utc};
use log::info;
use serde_derive::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A log index. Starts at 1, indicates an empty log if 0.
pub type Index = u64;

/// A log entry: one state-machine command, i.e. a parameterized write
/// statement with its argument vector. Entries are produced exactly once by
/// the leader and are immutable once stamped, but may be shipped to backups
/// any number of times.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The entry index, strictly increasing and assigned by the leader.
    pub index: Index,
    /// The write statement.
    pub sql: String,
    /// The statement's scalar arguments.
    pub args: Vec<Value>,
    /// Leader network time at append.
    pub timestamp: DateTime<Utc>,
}

/// The append-only command log, persisted as one JSON file per entry named
/// log-<index>.json. Per-file persistence gives atomicity at entry
/// granularity without a custom WAL: entries are a few hundred bytes, and a
/// torn write can only affect the file being written.
///
/// Callers serialize append/erase through the log mutex; read_all can run
/// without it since persisted files are immutable.
pub struct Log {
    /// The directory holding the entry files.
    dir: PathBuf,
    /// The index of the last persisted entry, or 0 if the log is empty.
    /// Recovered by scanning file names on startup.
    last_index: Index,
}

impl Log {
    /// Opens the log in the given directory, creating it if necessary and
    /// recovering the last index from the entry files present.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let last_index = Self::recover_index(&dir)?;
        if last_index > 0 {
            info!("recovered command log at index {last_index}");
        }
        Ok(Log { dir, last_index })
    }

    /// Scans the directory for the highest entry index.
    fn recover_index(dir: &Path) -> Result<Index> {
        let mut last = 0;
        for file in std::fs::read_dir(dir)? {
            if let Some(index) = Self::parse_filename(&file?.file_name().to_string_lossy()) {
                last = last.max(index)
            }
        }
        Ok(last)
    }

    /// Parses an entry index out of a log-<index>.json file name.
    fn parse_filename(name: &str) -> Option<Index> {
        name.strip_prefix("log-")?.strip_suffix(".json")?.parse().ok()
    }

    /// Returns the path of the entry file at the given index.
    fn entry_path(&self, index: Index) -> PathBuf {
        self.dir.join(format!("log-{index}.json"))
    }

    /// Returns the index of the last persisted entry, or 0 if none.
    pub fn last_index(&self) -> Index {
        self.last_index
    }

    /// Stamps a command with the next index and the given timestamp, persists
    /// it, and returns the completed entry. The index only advances after the
    /// file write succeeds, so a failed append leaves the log unchanged.
    pub fn append(
        &mut self,
        sql: impl Into<String>,
        args: Vec<Value>,
        timestamp: DateTime<Utc>,
    ) -> Result<Entry> {
        let entry =
            Entry { index: self.last_index + 1, sql: sql.into(), args, timestamp };
        self.write_entry(&entry)?;
        Ok(entry)
    }

    /// Persists an entry produced elsewhere (the backup replication path) and
    /// moves the last index onto it. The index may jump forward past a gap;
    /// the reconcile pass is responsible for filling it in later.
    pub fn write_entry(&mut self, entry: &Entry) -> Result<()> {
        let data = serde_json::to_vec_pretty(entry)?;
        std::fs::write(self.entry_path(entry.index), data)?;
        self.last_index = entry.index;
        Ok(())
    }

    /// Reads every persisted entry. The result is in directory order, not
    /// index order; callers that need ordering must sort.
    pub fn read_all(&self) -> Result<Vec<Entry>> {
        let mut entries = Vec::new();
        for file in std::fs::read_dir(&self.dir)? {
            let file = file?;
            if Self::parse_filename(&file.file_name().to_string_lossy()).is_none() {
                continue;
            }
            let data = std::fs::read(file.path())?;
            entries.push(serde_json::from_slice(&data)?);
        }
        Ok(entries)
    }

    /// Deletes the log directory, recreates it empty, and resets the index.
    /// Only ever invoked on a backup whose log has diverged past the
    /// leader's.
    pub fn erase_all(&mut self) -> Result<()> {
        std::fs::remove_dir_all(&self.dir)?;
        std::fs::create_dir_all(&self.dir)?;
        self.last_index = 0;
        Ok(())
    }
}
