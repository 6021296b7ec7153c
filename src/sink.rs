//! Durable sinks for ledger entries.
//!
//! The ledger hands every entry to its sink before the entry becomes visible
//! in memory. A sink error rejects the request that produced the entry.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::{ExperimentId, LedgerEntry, Result};

/// Append-only destination for ledger entries.
pub trait LedgerSink: Send + Sync + fmt::Debug {
    fn append(&self, entry: &LedgerEntry) -> io::Result<()>;
}

/// Keeps nothing. The in-memory chain is the only copy.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl LedgerSink for NullSink {
    fn append(&self, _entry: &LedgerEntry) -> io::Result<()> {
        Ok(())
    }
}

/// One JSON-lines file per experiment under a directory, synced after each
/// append.
#[derive(Debug)]
pub struct JsonlSink {
    dir: PathBuf,
    files: DashMap<ExperimentId, Arc<Mutex<File>>>,
}

impl JsonlSink {
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            files: DashMap::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File backing `experiment`. Characters outside `[A-Za-z0-9._-]` are
    /// replaced with `_`.
    pub fn path_for(&self, experiment: &ExperimentId) -> PathBuf {
        let name: String = experiment
            .as_str()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{name}.jsonl"))
    }

    /// Entries previously written for `experiment`; empty if none.
    pub fn load(&self, experiment: &ExperimentId) -> Result<Vec<LedgerEntry>> {
        let path = self.path_for(experiment);
        if !path.exists() {
            return Ok(Vec::new());
        }
        read_jsonl(&path)
    }

    fn file(&self, experiment: &ExperimentId) -> io::Result<Arc<Mutex<File>>> {
        if let Some(f) = self.files.get(experiment) {
            return Ok(Arc::clone(f.value()));
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(experiment))?;
        let handle = self
            .files
            .entry(experiment.clone())
            .or_insert_with(|| Arc::new(Mutex::new(file)));
        Ok(Arc::clone(handle.value()))
    }
}

impl LedgerSink for JsonlSink {
    fn append(&self, entry: &LedgerEntry) -> io::Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let file = self.file(entry.experiment_id())?;
        let mut f = file.lock();
        f.write_all(&line)?;
        f.sync_data()
    }
}

/// Read a JSON-lines ledger file. Blank lines are skipped.
pub fn read_jsonl(path: impl AsRef<Path>) -> Result<Vec<LedgerEntry>> {
    let reader = BufReader::new(File::open(path)?);
    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        out.push(serde_json::from_str(&line)?);
    }
    Ok(out)
}
