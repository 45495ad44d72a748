use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt as _,
    path::Path,
};

use tokio::sync::mpsc;
use tracing::warn;

use super::{Class, candidate::RuleCandidate, cell, error::StoreError};

/// Bytes per class half of a count cell.
const HALF: u64 = cell::FIELD as u64;
/// Bytes per count cell: block half first, allow half second.
const COUNT_CELL: u64 = 2 * HALF;
/// Two reserved header cells precede the per-record cells.
const HEADER: u64 = 2 * COUNT_CELL;

const TOTAL_HEADER_CELL: u64 = 1;

/// Durable per-record observation counts for one sequence store, plus the
/// running best rule candidate.
///
/// Fixed-cell random-access file: a header holding the per-class totals
/// (cell 0 is reserved) followed by one cell per record index. Cells for
/// records never counted read as zero.
#[derive(Debug)]
pub struct CountTable {
    file: File,
    best: Option<RuleCandidate>,
    updates: mpsc::Sender<RuleCandidate>,
}

fn class_shift(class: Class) -> u64 {
    if class.is_allow() { HALF } else { 0 }
}

impl CountTable {
    pub fn open(path: &Path, updates: mpsc::Sender<RuleCandidate>) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(Self {
            file,
            best: None,
            updates,
        })
    }

    fn cell_offset(index: i64, class: Class) -> u64 {
        HEADER + index as u64 * COUNT_CELL + class_shift(class)
    }

    fn header_offset(cell: u64, class: Class) -> u64 {
        cell * COUNT_CELL + class_shift(class)
    }

    /// Unwritten cells (and short reads) decode as zero.
    fn read_i64(&self, mut offset: u64) -> i64 {
        let mut buf = [0u8; cell::FIELD];
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read_at(&mut buf[filled..], offset) {
                Ok(0) => break,
                Ok(n) => {
                    filled += n;
                    offset += n as u64;
                }
                Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    warn!(%error, offset, "count read failed, treating as zero");
                    break;
                }
            }
        }
        cell::decode_i64(&buf)
    }

    fn write_i64(&self, offset: u64, value: i64) -> Result<(), StoreError> {
        self.file.write_all_at(&cell::encode_i64(value), offset)?;
        Ok(())
    }

    pub fn count(&self, index: i64, class: Class) -> i64 {
        self.read_i64(Self::cell_offset(index, class))
    }

    pub fn put_count(&self, index: i64, class: Class, count: i64) -> Result<(), StoreError> {
        self.write_i64(Self::cell_offset(index, class), count)
    }

    pub fn total(&self, class: Class) -> i64 {
        self.read_i64(Self::header_offset(TOTAL_HEADER_CELL, class))
    }

    pub fn put_total(&self, class: Class, total: i64) -> Result<(), StoreError> {
        self.write_i64(Self::header_offset(TOTAL_HEADER_CELL, class), total)
    }

    /// Counts one observation of the record's sequence as a prefix of a
    /// `class`-labeled payload, then re-scores that record. Awaits only when
    /// a newly best candidate meets a full update channel.
    pub async fn increment(&mut self, index: i64, class: Class) -> Result<(), StoreError> {
        let count = self.count(index, class) + 1;
        self.put_count(index, class, count)?;
        let total = self.total(class) + 1;
        self.put_total(class, total)?;
        self.keep_best(index).await;
        Ok(())
    }

    pub fn candidate(&self, index: i64) -> RuleCandidate {
        RuleCandidate {
            index,
            allow_count: self.count(index, Class::Allow),
            allow_total: self.total(Class::Allow),
            block_count: self.count(index, Class::Block),
            block_total: self.total(Class::Block),
        }
    }

    pub fn best(&self) -> Option<&RuleCandidate> {
        self.best.as_ref()
    }

    async fn keep_best(&mut self, index: i64) {
        let candidate = self.candidate(index);
        if candidate.score() == 0.0 {
            return;
        }
        let improved = match &self.best {
            None => true,
            Some(best) => candidate.better_than(best),
        };
        if improved {
            self.best = Some(candidate);
            if self.updates.send(candidate).await.is_err() {
                warn!(index, "rule update channel closed, dropping best-rule update");
            }
        }
    }

    pub fn save(&self) -> Result<(), StoreError> {
        self.file.sync_data()?;
        Ok(())
    }
}
