//! Core identifier and error types shared across the storage and
//! transaction layers.

use std::fmt;

use thiserror::Error;

/// Transaction identifiers and commit timestamps are drawn from the same
/// monotonically increasing engine counter, so a single alias covers both.
/// A value of zero never names a real transaction; version records use it
/// to mean "not yet committed".
pub type TxId = u64;

/// Identifies one append-only chunk file within a store directory.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ChunkId(pub u32);

impl ChunkId {
    /// File name of this chunk inside its store directory.
    pub fn file_name(&self) -> String {
        format!("c_{:06}.chunk", self.0)
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Discriminates leaf pages (key/value rows) from internal pages
/// (child references).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum PageKind {
    /// Holds committed rows.
    Leaf,
    /// Holds first-key/position pairs pointing at leaves.
    Internal,
}

impl PageKind {
    pub(crate) fn from_bit(bit: u64) -> PageKind {
        if bit == 0 {
            PageKind::Leaf
        } else {
            PageKind::Internal
        }
    }

    pub(crate) fn as_bit(self) -> u64 {
        match self {
            PageKind::Leaf => 0,
            PageKind::Internal => 1,
        }
    }
}

const POS_CHUNK_SHIFT: u64 = 40;
const POS_OFFSET_MASK: u64 = (1 << 39) - 1;

/// Packed page address: chunk id in the high 24 bits, byte offset within
/// the chunk file in bits 1..40, page kind in bit 0.
///
/// The packing caps chunk ids at 2^24 and chunk files at 512 GiB. A chunk
/// holds one save's worth of dirty pages, so real files sit far below the
/// cap.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PagePos(u64);

impl PagePos {
    /// Packs a chunk id, file offset and page kind into one address.
    pub fn new(chunk: ChunkId, offset: u64, kind: PageKind) -> PagePos {
        debug_assert!(u64::from(chunk.0) < (1 << 24));
        debug_assert!(offset <= POS_OFFSET_MASK);
        PagePos(
            (u64::from(chunk.0) << POS_CHUNK_SHIFT)
                | ((offset & POS_OFFSET_MASK) << 1)
                | kind.as_bit(),
        )
    }

    /// Rebuilds an address from its packed representation.
    pub fn from_raw(raw: u64) -> PagePos {
        PagePos(raw)
    }

    /// The packed representation, as stored in chunk trailers and
    /// internal pages.
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Chunk the page lives in.
    pub fn chunk_id(&self) -> ChunkId {
        ChunkId((self.0 >> POS_CHUNK_SHIFT) as u32)
    }

    /// Byte offset of the page header within the chunk file.
    pub fn offset(&self) -> u64 {
        (self.0 >> 1) & POS_OFFSET_MASK
    }

    /// Kind bit of the addressed page.
    pub fn kind(&self) -> PageKind {
        PageKind::from_bit(self.0 & 1)
    }

    /// True when the address points at a leaf page.
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind(), PageKind::Leaf)
    }
}

impl fmt::Debug for PagePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PagePos(chunk={}, off={}, {:?})",
            self.chunk_id(),
            self.offset(),
            self.kind()
        )
    }
}

/// Errors surfaced by the storage and transaction layers.
#[derive(Error, Debug)]
pub enum StrataError {
    /// Underlying file IO failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// On-disk data failed validation (bad magic, checksum, truncation).
    #[error("corruption detected: {0}")]
    Corruption(&'static str),
    /// Caller passed an argument the engine cannot act on.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Operation attempted on a transaction that already committed or
    /// rolled back.
    #[error("transaction {0} is closed")]
    TransactionClosed(String),
    /// Named savepoint does not exist (or was pruned by an earlier
    /// rollback).
    #[error("savepoint {0:?} is invalid")]
    SavepointInvalid(String),
    /// Failure from a staged follow-up action (large-object save, commit
    /// continuation), wrapped with its original cause.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, StrataError>;
