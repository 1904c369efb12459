//! Chunk files.
//!
//! A chunk is an immutable, append-once container: a fixed header, a run
//! of pages, and a trailer holding the root position, the highest commit
//! timestamp persisted, and the page-position index (position -> encoded
//! length) for every page in the file. Chunks are never modified after
//! `finish`; rewrites happen by saving into a new chunk and deleting the
//! old file once nothing live remains in it.

use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::types::{ChunkId, PagePos, PageKind, Result, StrataError, TxId};

/// Magic prefix of chunk headers and trailers.
pub const CHUNK_MAGIC: [u8; 4] = *b"STCK";
/// Current chunk format version.
pub const CHUNK_VERSION: u16 = 1;
/// Fixed header size; the first page starts here.
pub const CHUNK_HEADER_LEN: u64 = 24;

const TRAILER_TAIL_LEN: u64 = 12;

/// In-memory description of one chunk file.
#[derive(Clone, Debug)]
pub struct Chunk {
    /// Chunk id, also encoded in the file name and header.
    pub id: ChunkId,
    /// Encoded length of every page in the file, keyed by position.
    pub page_lengths: HashMap<PagePos, u32>,
    /// Sum of all page lengths, live or not.
    pub total_page_bytes: u64,
    /// Root page the save that produced this chunk installed.
    pub root_pos: PagePos,
    /// Highest commit timestamp among rows persisted up to this chunk.
    pub max_commit_ts: TxId,
    /// Bytes of pages still referenced, valid after [`Chunk::refresh_live`].
    pub live_page_bytes: u64,
    /// Count of pages still referenced, valid after [`Chunk::refresh_live`].
    pub live_page_count: usize,
}

impl Chunk {
    /// Recomputes live byte and page counts against the removed-page set.
    pub fn refresh_live(&mut self, removed: &BTreeSet<PagePos>) {
        self.live_page_bytes = 0;
        self.live_page_count = 0;
        for (pos, len) in &self.page_lengths {
            if !removed.contains(pos) {
                self.live_page_bytes += u64::from(*len);
                self.live_page_count += 1;
            }
        }
    }

    /// Percentage of the chunk's page bytes still live, rounded down.
    pub fn fill_rate(&self) -> u8 {
        if self.total_page_bytes == 0 {
            0
        } else {
            ((self.live_page_bytes * 100) / self.total_page_bytes) as u8
        }
    }

    /// Positions of live leaf pages, the rewrite targets of compaction.
    pub fn live_leaf_positions(&self, removed: &BTreeSet<PagePos>) -> Vec<PagePos> {
        let mut out: Vec<PagePos> = self
            .page_lengths
            .keys()
            .filter(|pos| pos.is_leaf() && !removed.contains(pos))
            .copied()
            .collect();
        out.sort_unstable();
        out
    }
}

/// Streams pages into a new chunk file, then seals it with a trailer.
pub struct ChunkWriter {
    file: File,
    path: PathBuf,
    id: ChunkId,
    offset: u64,
    page_lengths: HashMap<PagePos, u32>,
    total_page_bytes: u64,
}

impl ChunkWriter {
    /// Creates the chunk file and writes its header.
    pub fn create(dir: &Path, id: ChunkId) -> Result<ChunkWriter> {
        let path = dir.join(id.file_name());
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;

        let mut header = Vec::with_capacity(CHUNK_HEADER_LEN as usize);
        header.extend_from_slice(&CHUNK_MAGIC);
        header.extend_from_slice(&CHUNK_VERSION.to_be_bytes());
        header.extend_from_slice(&[0u8; 2]);
        header.extend_from_slice(&id.0.to_be_bytes());
        header.extend_from_slice(&rand::random::<u64>().to_be_bytes());
        let crc = crc32fast::hash(&header);
        header.extend_from_slice(&crc.to_be_bytes());
        file.write_all(&header)?;

        Ok(ChunkWriter {
            file,
            path,
            id,
            offset: CHUNK_HEADER_LEN,
            page_lengths: HashMap::new(),
            total_page_bytes: 0,
        })
    }

    /// Appends one encoded page and returns its address.
    pub fn append_page(&mut self, kind: PageKind, encoded: &[u8]) -> Result<PagePos> {
        let pos = PagePos::new(self.id, self.offset, kind);
        self.file.write_all(encoded)?;
        self.page_lengths.insert(pos, encoded.len() as u32);
        self.total_page_bytes += encoded.len() as u64;
        self.offset += encoded.len() as u64;
        Ok(pos)
    }

    /// Bytes of pages appended so far.
    pub fn page_bytes(&self) -> u64 {
        self.total_page_bytes
    }

    /// Writes the trailer, fsyncs, and returns the chunk description.
    pub fn finish(mut self, root_pos: PagePos, max_commit_ts: TxId) -> Result<Chunk> {
        let mut body = Vec::with_capacity(20 + self.page_lengths.len() * 12);
        body.extend_from_slice(&root_pos.raw().to_be_bytes());
        body.extend_from_slice(&max_commit_ts.to_be_bytes());
        body.extend_from_slice(&(self.page_lengths.len() as u32).to_be_bytes());
        let mut positions: Vec<(PagePos, u32)> =
            self.page_lengths.iter().map(|(p, l)| (*p, *l)).collect();
        positions.sort_unstable_by_key(|(p, _)| *p);
        for (pos, len) in &positions {
            body.extend_from_slice(&pos.raw().to_be_bytes());
            body.extend_from_slice(&len.to_be_bytes());
        }

        let mut tail = Vec::with_capacity(body.len() + TRAILER_TAIL_LEN as usize);
        tail.extend_from_slice(&body);
        tail.extend_from_slice(&(body.len() as u32).to_be_bytes());
        tail.extend_from_slice(&crc32fast::hash(&body).to_be_bytes());
        tail.extend_from_slice(&CHUNK_MAGIC);
        self.file.write_all(&tail)?;
        self.file.sync_all()?;

        Ok(Chunk {
            id: self.id,
            page_lengths: self.page_lengths,
            total_page_bytes: self.total_page_bytes,
            root_pos,
            max_commit_ts,
            live_page_bytes: 0,
            live_page_count: 0,
        })
    }

    /// Abandons the chunk: closes and deletes the partial file.
    pub fn discard(self) -> Result<()> {
        drop(self.file);
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

/// Reads and validates a chunk's header and trailer, without touching
/// its pages.
pub fn read_chunk_meta(dir: &Path, id: ChunkId) -> Result<Chunk> {
    let path = dir.join(id.file_name());
    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();
    if file_len < CHUNK_HEADER_LEN + TRAILER_TAIL_LEN {
        return Err(StrataError::Corruption("chunk file shorter than header"));
    }

    let mut header = [0u8; CHUNK_HEADER_LEN as usize];
    file.read_exact(&mut header)?;
    if header[0..4] != CHUNK_MAGIC {
        return Err(StrataError::Corruption("bad chunk magic"));
    }
    let stored = u32::from_be_bytes([header[20], header[21], header[22], header[23]]);
    if crc32fast::hash(&header[..20]) != stored {
        return Err(StrataError::Corruption("chunk header checksum mismatch"));
    }
    if u16::from_be_bytes([header[4], header[5]]) != CHUNK_VERSION {
        return Err(StrataError::Corruption("unsupported chunk version"));
    }
    let header_id = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
    if header_id != id.0 {
        return Err(StrataError::Corruption("chunk id does not match file name"));
    }

    let mut tail = [0u8; TRAILER_TAIL_LEN as usize];
    file.seek(SeekFrom::End(-(TRAILER_TAIL_LEN as i64)))?;
    file.read_exact(&mut tail)?;
    if tail[8..12] != CHUNK_MAGIC {
        return Err(StrataError::Corruption("chunk trailer magic missing"));
    }
    let body_len = u64::from(u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]));
    let body_crc = u32::from_be_bytes([tail[4], tail[5], tail[6], tail[7]]);
    if body_len + TRAILER_TAIL_LEN + CHUNK_HEADER_LEN > file_len {
        return Err(StrataError::Corruption("chunk trailer length out of range"));
    }

    let mut body = vec![0u8; body_len as usize];
    file.seek(SeekFrom::End(-((TRAILER_TAIL_LEN + body_len) as i64)))?;
    file.read_exact(&mut body)?;
    if crc32fast::hash(&body) != body_crc {
        return Err(StrataError::Corruption("chunk trailer checksum mismatch"));
    }
    if body.len() < 20 {
        return Err(StrataError::Corruption("chunk trailer body truncated"));
    }

    let root_pos = PagePos::from_raw(u64::from_be_bytes(
        body[0..8].try_into().map_err(|_| StrataError::Corruption("chunk trailer body truncated"))?,
    ));
    let max_commit_ts = u64::from_be_bytes(
        body[8..16].try_into().map_err(|_| StrataError::Corruption("chunk trailer body truncated"))?,
    );
    let count = u32::from_be_bytes(
        body[16..20].try_into().map_err(|_| StrataError::Corruption("chunk trailer body truncated"))?,
    ) as usize;
    if body.len() != 20 + count * 12 {
        return Err(StrataError::Corruption("chunk page index truncated"));
    }

    let mut page_lengths = HashMap::with_capacity(count);
    let mut total_page_bytes = 0u64;
    for i in 0..count {
        let at = 20 + i * 12;
        let pos = PagePos::from_raw(u64::from_be_bytes(
            body[at..at + 8].try_into().map_err(|_| StrataError::Corruption("chunk page index truncated"))?,
        ));
        let len = u32::from_be_bytes(
            body[at + 8..at + 12].try_into().map_err(|_| StrataError::Corruption("chunk page index truncated"))?,
        );
        if pos.chunk_id() != id {
            return Err(StrataError::Corruption("chunk page index names foreign chunk"));
        }
        total_page_bytes += u64::from(len);
        page_lengths.insert(pos, len);
    }

    Ok(Chunk {
        id,
        page_lengths,
        total_page_bytes,
        root_pos,
        max_commit_ts,
        live_page_bytes: 0,
        live_page_count: 0,
    })
}

/// Reads the raw bytes of one page out of a chunk file.
pub fn read_page_bytes(dir: &Path, pos: PagePos, len: u32) -> Result<Vec<u8>> {
    let path = dir.join(pos.chunk_id().file_name());
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(pos.offset()))?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf)?;
    Ok(buf)
}
