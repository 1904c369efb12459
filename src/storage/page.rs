//! On-disk page encoding.
//!
//! Pages are self-describing: a four byte magic, a kind byte, a format
//! version, an entry count, the entries, and a trailing CRC32 over
//! everything before it. Leaf pages carry committed rows; internal pages
//! carry first-key/position pairs for their children.

use bytes::Bytes;

use crate::types::{PagePos, PageKind, Result, StrataError, TxId};

/// Magic prefix of every page.
pub const PAGE_MAGIC: [u8; 4] = *b"STPG";
/// Current page format version.
pub const PAGE_VERSION: u8 = 1;
/// Bytes of fixed header before the entries.
pub const PAGE_HEADER_LEN: usize = 12;
/// Bytes of trailing checksum.
pub const PAGE_CRC_LEN: usize = 4;

/// One committed row inside a leaf page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeafEntry {
    /// Row key.
    pub key: Bytes,
    /// Commit timestamp the row carried when it was persisted.
    pub commit_ts: TxId,
    /// Row payload.
    pub value: Bytes,
}

/// One child reference inside an internal page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChildRef {
    /// Smallest key covered by the child.
    pub first_key: Bytes,
    /// Address of the child page.
    pub pos: PagePos,
}

/// Decoded page contents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Page {
    /// Rows, sorted by key.
    Leaf(Vec<LeafEntry>),
    /// Child references, sorted by first key.
    Internal(Vec<ChildRef>),
}

impl Page {
    /// Kind of this page.
    pub fn kind(&self) -> PageKind {
        match self {
            Page::Leaf(_) => PageKind::Leaf,
            Page::Internal(_) => PageKind::Internal,
        }
    }

    /// Number of entries.
    pub fn key_count(&self) -> usize {
        match self {
            Page::Leaf(entries) => entries.len(),
            Page::Internal(children) => children.len(),
        }
    }

    /// Key of the i-th entry (row key for leaves, first key for
    /// internal pages).
    pub fn key(&self, i: usize) -> Option<&Bytes> {
        match self {
            Page::Leaf(entries) => entries.get(i).map(|e| &e.key),
            Page::Internal(children) => children.get(i).map(|c| &c.first_key),
        }
    }

    /// Decodes and validates a page buffer.
    pub fn decode(buf: &[u8]) -> Result<Page> {
        if buf.len() < PAGE_HEADER_LEN + PAGE_CRC_LEN {
            return Err(StrataError::Corruption("page shorter than header"));
        }
        if buf[0..4] != PAGE_MAGIC {
            return Err(StrataError::Corruption("bad page magic"));
        }
        let body_len = buf.len() - PAGE_CRC_LEN;
        let stored = u32::from_be_bytes([
            buf[body_len],
            buf[body_len + 1],
            buf[body_len + 2],
            buf[body_len + 3],
        ]);
        if crc32fast::hash(&buf[..body_len]) != stored {
            return Err(StrataError::Corruption("page checksum mismatch"));
        }
        if buf[5] != PAGE_VERSION {
            return Err(StrataError::Corruption("unsupported page version"));
        }
        let count = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
        let mut cur = Cursor::new(&buf[PAGE_HEADER_LEN..body_len]);
        match buf[4] {
            0 => {
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let key = cur.take_prefixed_u32()?;
                    let commit_ts = cur.take_u64()?;
                    let value = cur.take_prefixed_u32()?;
                    entries.push(LeafEntry { key, commit_ts, value });
                }
                cur.expect_empty()?;
                Ok(Page::Leaf(entries))
            }
            1 => {
                let mut children = Vec::with_capacity(count);
                for _ in 0..count {
                    let first_key = cur.take_prefixed_u32()?;
                    let pos = PagePos::from_raw(cur.take_u64()?);
                    children.push(ChildRef { first_key, pos });
                }
                cur.expect_empty()?;
                Ok(Page::Internal(children))
            }
            _ => Err(StrataError::Corruption("unknown page kind")),
        }
    }
}

/// Encoded size of one leaf entry, used to decide splits before encoding.
pub fn leaf_entry_encoded_len(key_len: usize, value_len: usize) -> usize {
    4 + key_len + 8 + 4 + value_len
}

/// Encodes a leaf page from rows already sorted by key.
pub fn encode_leaf(entries: &[LeafEntry]) -> Vec<u8> {
    let payload: usize = entries
        .iter()
        .map(|e| leaf_entry_encoded_len(e.key.len(), e.value.len()))
        .sum();
    let mut buf = Vec::with_capacity(PAGE_HEADER_LEN + payload + PAGE_CRC_LEN);
    push_header(&mut buf, PageKind::Leaf, entries.len() as u32);
    for e in entries {
        push_prefixed(&mut buf, &e.key);
        buf.extend_from_slice(&e.commit_ts.to_be_bytes());
        push_prefixed(&mut buf, &e.value);
    }
    push_crc(&mut buf);
    buf
}

/// Encodes an internal page from child references already sorted by
/// first key.
pub fn encode_internal(children: &[ChildRef]) -> Vec<u8> {
    let payload: usize = children.iter().map(|c| 4 + c.first_key.len() + 8).sum();
    let mut buf = Vec::with_capacity(PAGE_HEADER_LEN + payload + PAGE_CRC_LEN);
    push_header(&mut buf, PageKind::Internal, children.len() as u32);
    for c in children {
        push_prefixed(&mut buf, &c.first_key);
        buf.extend_from_slice(&c.pos.raw().to_be_bytes());
    }
    push_crc(&mut buf);
    buf
}

fn push_header(buf: &mut Vec<u8>, kind: PageKind, count: u32) {
    buf.extend_from_slice(&PAGE_MAGIC);
    buf.push(kind.as_bit() as u8);
    buf.push(PAGE_VERSION);
    buf.extend_from_slice(&[0u8; 2]);
    buf.extend_from_slice(&count.to_be_bytes());
}

fn push_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
}

fn push_crc(buf: &mut Vec<u8>) {
    let crc = crc32fast::hash(buf);
    buf.extend_from_slice(&crc.to_be_bytes());
}

struct Cursor<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, at: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.at + n > self.buf.len() {
            return Err(StrataError::Corruption("page entry truncated"));
        }
        let out = &self.buf[self.at..self.at + n];
        self.at += n;
        Ok(out)
    }

    fn take_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn take_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn take_prefixed_u32(&mut self) -> Result<Bytes> {
        let len = self.take_u32()? as usize;
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }

    fn expect_empty(&self) -> Result<()> {
        if self.at != self.buf.len() {
            return Err(StrataError::Corruption("trailing bytes after page entries"));
        }
        Ok(())
    }
}
