use std::{path::Path, sync::Arc};

use bytes::{BufMut as _, Bytes, BytesMut};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::warn;

use super::{
    Class,
    candidate::RuleCandidate,
    counts::CountTable,
    error::StoreError,
    store::{Record, RecordStore},
};

/// Maps every distinct observed sequence to its record, backed by a record
/// store (tag `<name>-sequence`) and a count table in the same directory.
///
/// The in-memory map is rehydrated from the store on open and mirrors it
/// exactly: a sequence is present iff a record with that data exists. Each
/// index has a single writer (its owning handler); the map itself supports
/// concurrent lookup.
#[derive(Debug)]
pub struct SequenceIndex {
    store: Arc<RecordStore>,
    records: DashMap<Bytes, Record>,
    counts: CountTable,
}

impl SequenceIndex {
    pub fn open(
        root: &Path,
        name: &str,
        updates: mpsc::Sender<RuleCandidate>,
    ) -> Result<Self, StoreError> {
        let tag = format!("{name}-sequence");
        let store = Arc::new(RecordStore::open(root, &tag)?);
        let counts = CountTable::open(&store.dir().join("countmap"), updates)?;

        let records = DashMap::new();
        store.scan_from(-1, |record| {
            records.insert(record.data.clone(), record);
        });

        Ok(Self {
            store,
            records,
            counts,
        })
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    pub fn counts(&self) -> &CountTable {
        &self.counts
    }

    pub fn lookup(&self, sequence: &[u8]) -> Option<Record> {
        self.records.get(sequence).map(|entry| entry.value().clone())
    }

    /// Counts one observation of `sequence` for `class`, creating the record
    /// on first sight. Store failures on the first-sight path abandon the
    /// increment (logged) rather than failing the caller; a sequence is
    /// never counted without a durable record behind it.
    pub async fn increment(&mut self, class: Class, sequence: Bytes) -> Result<(), StoreError> {
        if let Some(record) = self.lookup(&sequence) {
            return self.counts.increment(record.index, class).await;
        }

        let index = match self.store.add(&sequence) {
            Ok(index) => index,
            Err(error) => {
                warn!(tag = %self.store.tag(), %error, len = sequence.len(), "failed to add sequence");
                return Ok(());
            }
        };
        let record = match self.store.get_record(index) {
            Ok(record) => record,
            Err(error) => {
                warn!(tag = %self.store.tag(), index, %error, "added sequence failed read-back");
                return Ok(());
            }
        };
        if record.index != index {
            warn!(tag = %self.store.tag(), index, got = record.index, "read-back index mismatch");
            return Ok(());
        }

        self.counts.increment(index, class).await?;
        self.records.insert(sequence, record);
        Ok(())
    }
}

/// Prefix view over a [`SequenceIndex`]: decomposes payloads into anchored
/// prefixes and frames every stored key with a 2-byte little-endian offset.
/// The offset is always zero today; the key schema reserves it so unanchored
/// sub-sequences can share the store later.
#[derive(Debug)]
pub struct PrefixIndex {
    sequences: SequenceIndex,
}

impl PrefixIndex {
    pub fn open(
        root: &Path,
        key: &str,
        updates: mpsc::Sender<RuleCandidate>,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            sequences: SequenceIndex::open(root, &format!("{key}-offsets"), updates)?,
        })
    }

    pub fn sequences(&self) -> &SequenceIndex {
        &self.sequences
    }

    pub async fn increment_at(
        &mut self,
        class: Class,
        offset: u16,
        bytes: &[u8],
    ) -> Result<(), StoreError> {
        let mut sequence = BytesMut::with_capacity(2 + bytes.len());
        sequence.put_u16_le(offset);
        sequence.put_slice(bytes);
        self.sequences.increment(class, sequence.freeze()).await
    }

    /// Counts every anchored prefix of `payload`, shortest first, then
    /// flushes the count table.
    pub async fn process_bytes(&mut self, class: Class, payload: &[u8]) -> Result<(), StoreError> {
        for length in 1..=payload.len() {
            self.increment_at(class, 0, &payload[..length]).await?;
        }
        self.sequences.counts.save()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn scratch_root() -> PathBuf {
        let root = std::env::temp_dir().join(format!("sift-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&root).unwrap();
        root
    }

    // Best-rule publishes are not under test here; a dropped receiver is
    // tolerated by the count table.
    fn updates() -> mpsc::Sender<RuleCandidate> {
        mpsc::channel(10).0
    }

    #[tokio::test]
    async fn first_increment_creates_and_counts_once() {
        let root = scratch_root();
        let mut index = SequenceIndex::open(&root, "t", updates()).unwrap();

        index
            .increment(Class::Block, Bytes::from_static(b"abc"))
            .await
            .unwrap();

        let record = index.lookup(b"abc").expect("sequence indexed");
        assert_eq!(index.counts().count(record.index, Class::Block), 1);
        assert_eq!(index.counts().total(Class::Block), 1);
        assert_eq!(index.counts().count(record.index, Class::Allow), 0);
    }

    #[tokio::test]
    async fn repeated_sequences_count_without_new_records() {
        let root = scratch_root();
        let mut index = SequenceIndex::open(&root, "t", updates()).unwrap();

        for _ in 0..2 {
            index
                .increment(Class::Block, Bytes::from_static(b"a"))
                .await
                .unwrap();
        }

        assert_eq!(index.store().last_index(), 0);
        let record = index.lookup(b"a").unwrap();
        assert_eq!(index.counts().count(record.index, Class::Block), 2);
        assert_eq!(index.counts().total(Class::Block), 2);
    }

    #[tokio::test]
    async fn reopen_rehydrates_map_and_counts() {
        let root = scratch_root();
        {
            let mut index = SequenceIndex::open(&root, "t", updates()).unwrap();
            index
                .increment(Class::Allow, Bytes::from_static(b"xy"))
                .await
                .unwrap();
            index.counts().save().unwrap();
        }

        let mut index = SequenceIndex::open(&root, "t", updates()).unwrap();
        let record = index.lookup(b"xy").expect("rehydrated from store");
        assert_eq!(index.counts().count(record.index, Class::Allow), 1);

        // A matching increment after restart counts, without a new record.
        index
            .increment(Class::Allow, Bytes::from_static(b"xy"))
            .await
            .unwrap();
        assert_eq!(index.store().last_index(), 0);
        assert_eq!(index.counts().count(record.index, Class::Allow), 2);
        assert_eq!(index.counts().total(Class::Allow), 2);
    }

    #[tokio::test]
    async fn prefixes_are_enumerated_shortest_first_with_offset_framing() {
        let root = scratch_root();
        let mut prefixes = PrefixIndex::open(&root, "d-incoming", updates()).unwrap();

        prefixes
            .process_bytes(Class::Block, &[0x41, 0x42, 0x43])
            .await
            .unwrap();

        let store = prefixes.sequences().store();
        assert_eq!(store.last_index(), 2);
        let expected: [&[u8]; 3] = [
            &[0x00, 0x00, 0x41],
            &[0x00, 0x00, 0x41, 0x42],
            &[0x00, 0x00, 0x41, 0x42, 0x43],
        ];
        for (index, key) in expected.iter().enumerate() {
            let record = store.get_record(index as i64).unwrap();
            assert_eq!(&record.data[..], *key);
            assert_eq!(
                prefixes.sequences().counts().count(index as i64, Class::Block),
                1
            );
        }
        assert_eq!(prefixes.sequences().counts().total(Class::Block), 3);
    }

    #[tokio::test]
    async fn empty_payload_is_a_no_op() {
        let root = scratch_root();
        let mut prefixes = PrefixIndex::open(&root, "d-incoming", updates()).unwrap();
        prefixes.process_bytes(Class::Allow, &[]).await.unwrap();
        assert_eq!(prefixes.sequences().store().last_index(), -1);
        assert_eq!(prefixes.sequences().counts().total(Class::Allow), 0);
    }

    #[test]
    fn sequence_store_lands_in_the_offsets_sequence_directory() {
        let root = scratch_root();
        let prefixes = PrefixIndex::open(&root, "d-incoming", updates()).unwrap();
        assert_eq!(
            prefixes.sequences().store().dir(),
            root.join("d-incoming-offsets-sequence")
        );
    }
}
