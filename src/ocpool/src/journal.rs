//! Allocation journal: the persistence hook behind `Manager::persist`.
//!
//! Allocation state is not crash-consistent; the journal records grants so
//! an operator (or a future restore path) can reconstruct who owns what.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitGrant {
    pub unit: String,
    pub channels: u32,
}

/// One granted vSSD, keyed by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalRecord {
    pub vssd_id: u32,
    pub shared: bool,
    pub grants: Vec<UnitGrant>,
}

pub trait Journal: Send + Sync {
    fn record(&self, record: &JournalRecord) -> io::Result<()>;

    fn flush(&self) -> io::Result<()>;

    fn replay(&self) -> io::Result<Vec<JournalRecord>>;
}

/// The reference implementation: forget everything.
pub struct NoopJournal;

impl Journal for NoopJournal {
    fn record(&self, _record: &JournalRecord) -> io::Result<()> {
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    fn replay(&self) -> io::Result<Vec<JournalRecord>> {
        Ok(Vec::new())
    }
}

/// Append-only JSON-lines journal.
pub struct FileJournal {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileJournal {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }
}

impl Journal for FileJournal {
    fn record(&self, record: &JournalRecord) -> io::Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        self.file.lock().unwrap().write_all(line.as_bytes())
    }

    fn flush(&self) -> io::Result<()> {
        self.file.lock().unwrap().sync_data()
    }

    fn replay(&self) -> io::Result<Vec<JournalRecord>> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }
}
