#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("store `{tag}`: index cell {cell} holds record index {found}")]
    Corruption { tag: String, cell: i64, found: i64 },
    #[error("zero-length sequence")]
    EmptySequence,
    #[error("record {index} has zero length")]
    ZeroLength { index: i64 },
}
