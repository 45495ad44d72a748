use std::{
    fs::{File, OpenOptions},
    io::Write as _,
    os::unix::fs::FileExt as _,
    path::{Path, PathBuf},
};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::warn;

use super::{
    cell::{self, INDEX_FIELD, LENGTH_FIELD, OFFSET_FIELD, STORE_CELL},
    error::StoreError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub index: i64,
    pub data: Bytes,
}

#[derive(Debug)]
struct WriterState {
    last: i64,
    index_len: u64,
    source_len: u64,
}

/// Append-only store of byte sequences under `<root>/<tag>/`.
///
/// Two sibling files: `source` is the concatenation of record data, `index`
/// an array of fixed-size cells `(record index, source offset, length)`.
/// Record indices are dense from 0. Appends never touch committed bytes, so
/// positioned reads are safe while a single writer advances the tail; the
/// writer bookkeeping lives behind a mutex so the store can be aliased for
/// lookup (e.g. from the store cache).
#[derive(Debug)]
pub struct RecordStore {
    tag: String,
    dir: PathBuf,
    index: File,
    source: File,
    writer: Mutex<WriterState>,
}

fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)
}

fn read_field(file: &File, position: u64) -> std::io::Result<i64> {
    let mut buf = [0u8; cell::FIELD];
    file.read_exact_at(&mut buf, position)?;
    Ok(cell::decode_i64(&buf))
}

impl RecordStore {
    pub fn open(root: &Path, tag: &str) -> Result<Self, StoreError> {
        let dir = root.join(tag);
        std::fs::create_dir_all(&dir)?;

        let index = open_append(&dir.join("index"))?;
        let source = open_append(&dir.join("source"))?;

        let mut index_len = index.metadata()?.len();
        let source_len = source.metadata()?.len();

        // A torn cell at the tail means the process died between the source
        // and index appends; the unindexed source bytes are unreachable and
        // the partial cell is dropped.
        if index_len % STORE_CELL as u64 != 0 {
            let rounded = index_len - index_len % STORE_CELL as u64;
            warn!(tag, index_len, rounded, "truncating torn index tail");
            index.set_len(rounded)?;
            index_len = rounded;
        }

        let store = Self {
            tag: tag.to_owned(),
            dir,
            index,
            source,
            writer: Mutex::new(WriterState {
                last: -1,
                index_len,
                source_len,
            }),
        };
        store.verify()?;
        Ok(store)
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Every cell must record its own position; anything else means the
    /// index stream is not the one this store wrote.
    fn verify(&self) -> Result<(), StoreError> {
        let mut writer = self.writer.lock();
        let cells = (writer.index_len / STORE_CELL as u64) as i64;
        for current in 0..cells {
            let found = read_field(&self.index, current as u64 * STORE_CELL as u64 + INDEX_FIELD as u64)?;
            if found != current {
                return Err(StoreError::Corruption {
                    tag: self.tag.clone(),
                    cell: current,
                    found,
                });
            }
            writer.last = current;
        }
        Ok(())
    }

    /// Appends one record and returns its index. The data bytes are durable
    /// before the index cell that makes them reachable.
    pub fn add(&self, data: &[u8]) -> Result<i64, StoreError> {
        if data.is_empty() {
            return Err(StoreError::EmptySequence);
        }

        let mut writer = self.writer.lock();

        let offset = writer.source_len as i64;
        let length = data.len() as i64;
        (&self.source).write_all(data)?;
        self.source.sync_all()?;
        writer.source_len += data.len() as u64;

        // Must not occur under normal operation; recovers from a torn write
        // that raced a crash after open.
        if writer.index_len % STORE_CELL as u64 != 0 {
            let rounded = writer.index_len - writer.index_len % STORE_CELL as u64;
            warn!(tag = %self.tag, index_len = writer.index_len, rounded, "truncating torn index tail");
            self.index.set_len(rounded)?;
            writer.index_len = rounded;
            writer.last = (rounded / STORE_CELL as u64) as i64 - 1;
        }

        let index = writer.last + 1;
        let mut cell_buf = [0u8; STORE_CELL];
        cell_buf[INDEX_FIELD..INDEX_FIELD + cell::FIELD].copy_from_slice(&cell::encode_i64(index));
        cell_buf[OFFSET_FIELD..OFFSET_FIELD + cell::FIELD].copy_from_slice(&cell::encode_i64(offset));
        cell_buf[LENGTH_FIELD..LENGTH_FIELD + cell::FIELD].copy_from_slice(&cell::encode_i64(length));
        (&self.index).write_all(&cell_buf)?;
        self.index.sync_all()?;

        writer.index_len += STORE_CELL as u64;
        writer.last = index;
        Ok(index)
    }

    pub fn get_record(&self, index: i64) -> Result<Record, StoreError> {
        let base = index as u64 * STORE_CELL as u64;
        let offset = read_field(&self.index, base + OFFSET_FIELD as u64)?;
        let length = read_field(&self.index, base + LENGTH_FIELD as u64)?;
        if length <= 0 {
            return Err(StoreError::ZeroLength { index });
        }
        let mut data = vec![0u8; length as usize];
        self.source.read_exact_at(&mut data, offset as u64)?;
        Ok(Record {
            index,
            data: data.into(),
        })
    }

    /// Index of the most recently committed record, `-1` when empty.
    pub fn last_index(&self) -> i64 {
        self.writer.lock().last
    }

    /// Visits every record with index strictly greater than `index`, in
    /// order. Unreadable records are skipped, not fatal.
    pub fn scan_from(&self, index: i64, mut visit: impl FnMut(Record)) {
        let last = self.last_index();
        for current in (index + 1)..=last {
            match self.get_record(current) {
                Ok(record) => visit(record),
                Err(error) => {
                    warn!(tag = %self.tag, index = current, %error, "skipping unreadable record");
                }
            }
        }
    }
}
