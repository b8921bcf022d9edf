//! Append-only transaction log (`history.jsonl`, one JSON object per line).

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Lines, Write};
use std::path::{Path, PathBuf};

use super::error::{RepoError, RepoResult};
use super::model::Transaction;

/// Writer side, owned by the repository actor.
#[derive(Debug)]
pub(crate) struct HistoryLog {
    path: PathBuf,
    len: usize,
    last_id: u64,
}

impl HistoryLog {
    pub(crate) fn open(path: impl Into<PathBuf>) -> RepoResult<Self> {
        let path = path.into();
        let mut log = Self {
            path,
            len: 0,
            last_id: 0,
        };
        if !log.path.exists() {
            return Ok(log);
        }
        for tx in (History {
            path: log.path.clone(),
            len: usize::MAX,
        })
        .iter()?
        {
            let tx = tx?;
            if tx.id <= log.last_id {
                return Err(RepoError::Corrupt(format!(
                    "transaction {} follows {} in {}",
                    tx.id,
                    log.last_id,
                    log.path.display()
                )));
            }
            log.last_id = tx.id;
            log.len += 1;
        }
        Ok(log)
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.last_id + 1
    }

    pub(crate) fn append(&mut self, tx: &Transaction) -> RepoResult<()> {
        let mut line = serde_json::to_vec(tx)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        file.sync_data()?;
        self.len += 1;
        self.last_id = tx.id;
        Ok(())
    }
}

/// Read side: the transactions committed when the view was taken, oldest
/// first. Iterate as often as needed; later commits never show up in an
/// existing view.
#[derive(Debug, Clone)]
pub struct History {
    path: PathBuf,
    len: usize,
}

impl History {
    pub(crate) fn new(path: &Path, len: usize) -> Self {
        Self {
            path: path.to_path_buf(),
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> RepoResult<HistoryIter> {
        let lines = if self.len == 0 {
            None
        } else {
            match File::open(&self.path) {
                Ok(f) => Some(BufReader::new(f).lines()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(e.into()),
            }
        };
        Ok(HistoryIter {
            lines,
            remaining: self.len,
        })
    }
}

/// Lazily parses history lines.
pub struct HistoryIter {
    lines: Option<Lines<BufReader<File>>>,
    remaining: usize,
}

impl Iterator for HistoryIter {
    type Item = RepoResult<Transaction>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        loop {
            let line = match self.lines.as_mut()?.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(e.into())),
            };
            if line.trim().is_empty() {
                continue;
            }
            self.remaining -= 1;
            return Some(serde_json::from_str(&line).map_err(RepoError::from));
        }
    }
}
