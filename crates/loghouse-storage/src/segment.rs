//! Segment - One Append-Only File of a Buffer
//!
//! A segment persists a contiguous slice of a buffer's message stream. The
//! segment does not interpret message ids beyond remembering the id of its
//! first message (`first`): local index 0 is `first` in buffer space, and
//! the owning buffer translates between the two.
//!
//! ## File Format
//!
//! A sequence of self-delimiting frames (see `loghouse_core::frame`). The
//! filename encodes the first id (`segment_<16-hex>`) so a lexicographic
//! sort of a buffer directory equals id order.
//!
//! ## Random Reads
//!
//! Frames are variable-length, so reaching local index `n` means scanning.
//! Each segment keeps a bounded cache of index -> byte-offset entries;
//! a read seeks to the nearest cached index at or below the target and
//! scans forward from there, then caches the result. When the cache is
//! full the oldest entry is evicted. Rotation caps (`segment_max_messages`)
//! bound the worst-case scan.
//!
//! ## Lifecycle
//!
//! Created empty with a chosen `first`; appended to; closed for writes
//! when the buffer rotates to a newer segment (reads keep working);
//! deleted by buffer trim. Opening an existing file counts its frames and
//! stops with a `Malformed` error at the first unparsable frame - a torn
//! tail from a crash is reported, never silently truncated.

use std::collections::{BTreeMap, VecDeque};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use loghouse_core::frame::{self, LEN_HEX, SHA_HEX};
use loghouse_core::message::chain_raw;
use loghouse_core::{Message, Sha, SyncPolicy};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Filename prefix for segment files within a buffer directory.
pub const FILE_PREFIX: &str = "segment_";

pub struct Segment {
    path: PathBuf,
    first: u64,
    len: AtomicU64,
    size_bytes: AtomicU64,
    cache_cap: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    /// Append handle; `None` once the segment is closed for writes.
    writer: Option<File>,
    /// Random-access read handle; shared position, hence the mutex.
    reader: File,
    /// Local index -> byte offset of the frame start.
    offsets: BTreeMap<u64, u64>,
    /// Insertion order of cached indexes, oldest in front.
    lru: VecDeque<u64>,
}

/// A raw frame as stored: header sha (if any) plus the fenced content.
struct RawFrame {
    sha: Option<Sha>,
    content: Vec<u8>,
}

impl Segment {
    /// Create an empty segment in `dir` whose first message will be `first`.
    pub async fn create(dir: &Path, first: u64, cache_cap: usize) -> Result<Segment> {
        let path = dir.join(format!("{}{:016x}", FILE_PREFIX, first));
        let writer = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .await?;
        let reader = File::open(&path).await?;
        Ok(Segment {
            path,
            first,
            len: AtomicU64::new(0),
            size_bytes: AtomicU64::new(0),
            cache_cap,
            inner: Mutex::new(Inner {
                writer: Some(writer),
                reader,
                offsets: BTreeMap::new(),
                lru: VecDeque::new(),
            }),
        })
    }

    /// Open an existing segment file, counting its frames.
    ///
    /// `first` comes from the first frame's id; the filename supplies it
    /// for an empty file. Fails with `Malformed` if any frame - including
    /// a torn tail left by a crash - does not parse.
    pub async fn open(path: &Path, cache_cap: usize) -> Result<Segment> {
        let name_first = first_from_filename(path)?;
        let writer = OpenOptions::new().append(true).open(path).await?;
        let mut reader = File::open(path).await?;
        let file_len = reader.metadata().await?.len();

        let mut count: u64 = 0;
        let mut first = name_first;
        loop {
            match read_raw_frame(&mut reader, file_len, path).await? {
                None => break,
                Some(raw) => {
                    if count == 0 {
                        first = decode_raw(raw, path)?.id;
                    }
                    count += 1;
                }
            }
        }

        Ok(Segment {
            path: path.to_path_buf(),
            first,
            len: AtomicU64::new(count),
            size_bytes: AtomicU64::new(file_len),
            cache_cap,
            inner: Mutex::new(Inner {
                writer: Some(writer),
                reader,
                offsets: BTreeMap::new(),
                lru: VecDeque::new(),
            }),
        })
    }

    /// Id of the first message stored here.
    pub fn first(&self) -> u64 {
        self.first
    }

    /// Number of messages stored here.
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes on disk.
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes.load(Ordering::Acquire)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one message. The caller (the buffer) has already assigned
    /// the id and, in integrity mode, the chain sha.
    pub async fn write(&self, m: &Message, sync: SyncPolicy) -> Result<()> {
        let encoded = frame::encode(m).map_err(Error::Codec)?;
        let mut inner = self.inner.lock().await;
        let writer = inner.writer.as_mut().ok_or(Error::SegmentClosed)?;
        writer.write_all(&encoded).await?;
        if sync == SyncPolicy::Always {
            writer.sync_all().await?;
        }
        self.len.fetch_add(1, Ordering::AcqRel);
        self.size_bytes
            .fetch_add(encoded.len() as u64, Ordering::AcqRel);
        Ok(())
    }

    /// Read the message at local index `n`.
    pub async fn read(&self, n: u64) -> Result<Message> {
        if n >= self.len() {
            return Err(Error::OutOfBounds { id: n });
        }
        let mut inner = self.inner.lock().await;
        self.seek_to(&mut inner, n).await?;
        let file_len = inner.reader.metadata().await?.len();
        match read_raw_frame(&mut inner.reader, file_len, &self.path).await? {
            Some(raw) => decode_raw(raw, &self.path),
            None => Err(Error::OutOfBounds { id: n }),
        }
    }

    /// Read the most recent message.
    pub async fn last(&self) -> Result<Message> {
        let len = self.len();
        if len == 0 {
            return Err(Error::OutOfBounds { id: 0 });
        }
        self.read(len - 1).await
    }

    /// Walk the whole segment recomputing the hash chain.
    ///
    /// `seed` is the sha of the message preceding this segment (the
    /// all-zero seed when this segment starts the buffer). With `None`
    /// the first frame's stored sha is taken as the anchor, for segments
    /// whose predecessors have been trimmed away. Returns the sha of the
    /// last message, i.e. the seed for the next segment.
    pub async fn verify(&self, seed: Option<Sha>) -> Result<Sha> {
        let mut inner = self.inner.lock().await;
        inner.reader.seek(SeekFrom::Start(0)).await?;
        let file_len = inner.reader.metadata().await?.len();

        let mut running = seed;
        let mut index = 0u64;
        while let Some(raw) = read_raw_frame(&mut inner.reader, file_len, &self.path).await? {
            let sha = raw.sha.ok_or(Error::Integrity {
                id: self.first + index,
            })?;
            let (meta, body) = frame::split_content(&raw.content).map_err(Error::Codec)?;
            match running {
                Some(prev) => {
                    if chain_raw(&prev, meta, body) != sha {
                        return Err(Error::Integrity {
                            id: self.first + index,
                        });
                    }
                }
                // trimmed predecessor: accept the first link as the anchor
                None => {}
            }
            running = Some(sha);
            index += 1;
        }
        running.ok_or(Error::OutOfBounds { id: self.first })
    }

    /// Release the append handle. Reads keep working. Idempotent.
    pub async fn close(&self) {
        self.inner.lock().await.writer = None;
    }

    /// Position the reader at the start of frame `n`, via the offset cache.
    async fn seek_to(&self, inner: &mut Inner, n: u64) -> Result<()> {
        if let Some(&pos) = inner.offsets.get(&n) {
            inner.reader.seek(SeekFrom::Start(pos)).await?;
            return Ok(());
        }
        // nearest cached index below the target, else the segment start
        let (mut at, start) = match inner.offsets.range(..n).next_back() {
            Some((&i, &pos)) => (i, pos),
            None => (0, 0),
        };
        inner.reader.seek(SeekFrom::Start(start)).await?;
        let file_len = inner.reader.metadata().await?.len();
        while at < n {
            if !skip_frame(&mut inner.reader, file_len, &self.path).await? {
                return Err(Error::OutOfBounds { id: n });
            }
            at += 1;
        }
        let pos = inner.reader.seek(SeekFrom::Current(0)).await?;
        if inner.lru.len() >= self.cache_cap {
            if let Some(oldest) = inner.lru.pop_front() {
                inner.offsets.remove(&oldest);
            }
        }
        inner.offsets.insert(n, pos);
        inner.lru.push_back(n);
        Ok(())
    }
}

fn first_from_filename(path: &Path) -> Result<u64> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    name.strip_prefix(FILE_PREFIX)
        .and_then(|hex| u64::from_str_radix(hex, 16).ok())
        .ok_or_else(|| Error::Malformed {
            path: path.display().to_string(),
            detail: "filename does not encode a first id".to_string(),
        })
}

fn malformed(path: &Path, detail: impl Into<String>) -> Error {
    Error::Malformed {
        path: path.display().to_string(),
        detail: detail.into(),
    }
}

fn decode_raw(raw: RawFrame, path: &Path) -> Result<Message> {
    frame::decode_content(&raw.content, raw.sha)
        .map_err(|e| malformed(path, format!("undecodable frame: {}", e)))
}

/// Read one frame at the current position. `Ok(None)` on clean EOF; any
/// EOF after the fence started is a torn frame and reported as such.
async fn read_raw_frame(reader: &mut File, file_len: u64, path: &Path) -> Result<Option<RawFrame>> {
    let header = match read_header(reader, file_len, path).await? {
        Some(h) => h,
        None => return Ok(None),
    };
    let mut content = vec![0u8; header.content_len as usize];
    content[0] = header.first_content_byte;
    if header.content_len > 1 {
        reader
            .read_exact(&mut content[1..])
            .await
            .map_err(|e| torn(path, e))?;
    }
    Ok(Some(RawFrame {
        sha: header.sha,
        content,
    }))
}

/// Skip one frame without parsing it. `Ok(false)` on clean EOF.
async fn skip_frame(reader: &mut File, file_len: u64, path: &Path) -> Result<bool> {
    let header = match read_header(reader, file_len, path).await? {
        Some(h) => h,
        None => return Ok(false),
    };
    let pos = reader.seek(SeekFrom::Current(0)).await?;
    let target = pos + header.content_len - 1; // first content byte already consumed
    if target > file_len {
        return Err(malformed(path, "frame extends past end of file"));
    }
    reader.seek(SeekFrom::Start(target)).await?;
    Ok(true)
}

struct FrameHeader {
    content_len: u64,
    sha: Option<Sha>,
    /// The profile-detection byte, which is the first content byte.
    first_content_byte: u8,
}

/// Parse a frame header: the 8-hex fence, then either `:sha:` (integrity
/// profile) or directly the content. Returns `None` on clean EOF at a
/// frame boundary; an EOF anywhere inside a frame is a torn frame.
async fn read_header(reader: &mut File, file_len: u64, path: &Path) -> Result<Option<FrameHeader>> {
    let start = reader.seek(SeekFrom::Current(0)).await?;
    if start >= file_len {
        return Ok(None);
    }
    let mut fence = [0u8; LEN_HEX];
    reader.read_exact(&mut fence).await.map_err(|e| torn(path, e))?;
    let content_len = frame::parse_len(&fence)
        .map_err(|e| malformed(path, format!("bad length fence: {}", e)))?;
    if content_len < 2 {
        return Err(malformed(path, "frame shorter than its terminators"));
    }
    let mut probe = [0u8; 1];
    reader.read_exact(&mut probe).await.map_err(|e| torn(path, e))?;
    if probe[0] == b':' {
        let mut sha_hex = [0u8; SHA_HEX + 1];
        reader
            .read_exact(&mut sha_hex)
            .await
            .map_err(|e| torn(path, e))?;
        if sha_hex[SHA_HEX] != b':' {
            return Err(malformed(path, "unterminated sha in frame header"));
        }
        let sha = Sha::from_hex(&sha_hex[..SHA_HEX])
            .map_err(|e| malformed(path, format!("bad sha hex: {}", e)))?;
        let mut first = [0u8; 1];
        reader.read_exact(&mut first).await.map_err(|e| torn(path, e))?;
        Ok(Some(FrameHeader {
            content_len,
            sha: Some(sha),
            first_content_byte: first[0],
        }))
    } else {
        Ok(Some(FrameHeader {
            content_len,
            sha: None,
            first_content_byte: probe[0],
        }))
    }
}

fn torn(path: &Path, e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        malformed(path, "torn frame at end of file")
    } else {
        e.into()
    }
}
