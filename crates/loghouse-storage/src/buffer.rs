//! Buffer - A Monotonic Log of Segments
//!
//! A buffer persists messages into one or more consecutive segments and
//! presents them as a single log with monotonic ids. It owns:
//!
//! - **id assignment**: `id = len` at write time; `len` is the next id to
//!   assign (total ever written minus nothing - trimming never rewinds it)
//! - **rotation**: the tail segment is closed and a new one started when
//!   it passes the size or count limit
//! - **retention**: the oldest segment is dropped once the buffer exceeds
//!   `buffer_max_segments`, so older messages may become unreadable while
//!   ids keep growing
//! - **consumer cursors**: per-consumer next-id positions, persisted to an
//!   `offsets` file
//! - **replication fan-out**: a set of pull replicas, each poked through a
//!   coalescing signal on every successful write
//!
//! ## Invariants
//!
//! After any public operation returns: segments are sorted by `first` and
//! contiguous (`segments[i+1].first == segments[i].first + segments[i].len`);
//! `len == last.first + last.len`; the oldest readable id is
//! `segments[0].first`; every cursor is between 0 and `len`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use loghouse_core::{name, BufferConfig, Message, Sha};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::replica::Replica;
use crate::segment::{Segment, FILE_PREFIX};

const OFFSETS_FILE: &str = "offsets";
const REPLICAS_FILE: &str = "replicas";

/// A consumer group's position within one buffer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cursor {
    pub id: String,
    /// Next message id to read.
    pub n: u64,
}

/// The externally visible description of a buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferMeta {
    pub id: String,
    pub url: String,
    pub len: u64,
}

/// One write, from a producer or (with `id`/`ts` set) from a replica
/// preserving the primary's message identity.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub content_type: String,
    pub body: Bytes,
    /// Explicit id; must equal the buffer's next id.
    pub id: Option<u64>,
    /// Original-write timestamp; defaults to now.
    pub ts: Option<DateTime<Utc>>,
}

impl WriteRequest {
    pub fn new(content_type: impl Into<String>, body: impl Into<Bytes>) -> WriteRequest {
        WriteRequest {
            content_type: content_type.into(),
            body: body.into(),
            id: None,
            ts: None,
        }
    }
}

/// Everything needed to open (or create) a buffer.
#[derive(Debug, Clone, Default)]
pub struct BufferOptions {
    /// 16-hex-char buffer id.
    pub id: String,
    /// URL under which this buffer is reachable, recorded in metadata.
    pub url: String,
    /// Controller base URL, used by replicas for peer discovery.
    pub controller_url: String,
    /// On-disk directory, owned exclusively by this buffer while running.
    pub path: PathBuf,
    pub config: BufferConfig,
    /// Starting `len` for a buffer with no segments on disk; nonzero for
    /// replicas of a primary whose early history is already trimmed.
    pub initial_len: u64,
}

pub struct Buffer {
    id: String,
    url: String,
    controller_url: String,
    path: PathBuf,
    config: BufferConfig,
    http: reqwest::Client,
    /// Handle to ourselves for replica tasks; `Weak` so that a buffer kept
    /// alive only by its own replicas can still be dropped.
    weak: Weak<Buffer>,
    inner: Mutex<Inner>,
}

struct Inner {
    running: bool,
    /// Next id to assign.
    len: u64,
    /// Tail of the hash chain (integrity mode).
    sha: Sha,
    segments: Vec<Segment>,
    consumers: HashMap<String, Cursor>,
    /// Consumes since the cursors were last persisted.
    dirty: u32,
    replicas: HashMap<String, Replica>,
}

impl Buffer {
    /// Open a buffer directory, creating it if needed, restoring segments,
    /// consumer cursors and the replica set.
    pub async fn open(opts: BufferOptions) -> Result<Arc<Buffer>> {
        tokio::fs::create_dir_all(&opts.path).await?;

        let segments = open_segments(&opts.path, &opts.config).await?;
        let len = segments
            .last()
            .map(|s| s.first() + s.len())
            .unwrap_or(opts.initial_len);

        let mut sha = Sha::ZERO;
        if opts.config.integrity && !segments.is_empty() {
            sha = verify_segments(&segments).await?;
        }

        let consumers = load_consumers(&opts.path).await?;
        for c in consumers.values() {
            if c.n > len {
                return Err(Error::Malformed {
                    path: opts.path.display().to_string(),
                    detail: format!("cursor {:?} is past the end of the log", c.id),
                });
            }
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| Error::Transient(e.to_string()))?;
        let buffer = Arc::new_cyclic(|weak| Buffer {
            id: opts.id,
            url: opts.url,
            controller_url: opts.controller_url,
            path: opts.path,
            config: opts.config,
            http,
            weak: weak.clone(),
            inner: Mutex::new(Inner {
                running: true,
                len,
                sha,
                segments,
                consumers,
                dirty: 0,
                replicas: HashMap::new(),
            }),
        });

        let replica_ids = load_replicas(&buffer.path).await?;
        if !replica_ids.is_empty() {
            buffer.set_replicas(replica_ids).await?;
        }

        info!(buffer = %buffer.id, len, path = %buffer.path.display(), "buffer opened");
        Ok(buffer)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Next id to be assigned == count of messages ever written.
    pub async fn len(&self) -> u64 {
        self.inner.lock().await.len
    }

    pub async fn meta(&self) -> BufferMeta {
        BufferMeta {
            id: self.id.clone(),
            url: self.url.clone(),
            len: self.inner.lock().await.len,
        }
    }

    /// Append a message, assigning `id = len` (or validating the explicit
    /// replication id against it) and rotating/trimming segments as
    /// configured. Pokes every replica on success.
    pub async fn write(&self, req: WriteRequest) -> Result<Message> {
        let mut inner = self.inner.lock().await;
        if !inner.running {
            return Err(Error::BufferClosed);
        }
        if req.body.len() > self.config.message_max_bytes {
            return Err(Error::MessageTooLarge {
                size: req.body.len(),
                max: self.config.message_max_bytes,
            });
        }
        if req.content_type.len() > 64 {
            return Err(Error::ContentTypeTooLong(req.content_type.len()));
        }
        // a replica must hand over exactly the id this buffer expects next;
        // anything else means the streams have diverged
        if let Some(id) = req.id {
            if id != inner.len {
                return Err(Error::IdMismatch {
                    provided: id,
                    expected: inner.len,
                });
            }
        }

        self.roll_segments(&mut inner).await?;

        let mut m = Message {
            id: inner.len,
            ts: req.ts.unwrap_or_else(Utc::now),
            content_type: req.content_type,
            body: req.body,
            sha: None,
        };
        if self.config.integrity {
            m.sha = Some(m.chain(&inner.sha)?);
        }

        let tail = inner.segments.last().expect("roll_segments leaves a tail");
        tail.write(&m, self.config.sync).await?;

        inner.len += 1;
        if let Some(sha) = m.sha {
            inner.sha = sha;
        }
        for r in inner.replicas.values() {
            r.poke();
        }
        Ok(m)
    }

    /// Read the message with the given buffer-wide id.
    pub async fn read(&self, id: u64) -> Result<Message> {
        let inner = self.inner.lock().await;
        if !inner.running {
            return Err(Error::BufferClosed);
        }
        read_at(&inner, id).await
    }

    /// Read the next message for `consumer`, advancing its cursor by one
    /// on success only. A consumer seen for the first time starts at the
    /// oldest retained message; an existing cursor that has fallen behind
    /// the trim horizon keeps surfacing `OutOfBounds` unchanged.
    pub async fn consume(&self, consumer: &str) -> Result<Message> {
        let mut inner = self.inner.lock().await;
        if !inner.running {
            return Err(Error::BufferClosed);
        }
        let n = match inner.consumers.get(consumer) {
            Some(c) => c.n,
            None => {
                let start = inner
                    .segments
                    .first()
                    .map(|s| s.first())
                    .unwrap_or(inner.len);
                inner.consumers.insert(
                    consumer.to_string(),
                    Cursor {
                        id: consumer.to_string(),
                        n: start,
                    },
                );
                start
            }
        };
        let m = read_at(&inner, n).await?;
        if let Some(c) = inner.consumers.get_mut(consumer) {
            c.n += 1;
        }
        inner.dirty += 1;
        if inner.dirty >= self.config.offsets_flush_every {
            let snapshot = inner.consumers.clone();
            inner.dirty = 0;
            persist_consumers(&self.path, &snapshot).await?;
        }
        Ok(m)
    }

    /// Snapshot of all consumer cursors.
    pub async fn consumers(&self) -> HashMap<String, Cursor> {
        self.inner.lock().await.consumers.clone()
    }

    /// Install pull replicas for the given peer buffer ids. Idempotent and
    /// add-only: ids already present are left untouched, and removal is
    /// not supported. Persists the replica list.
    pub async fn set_replicas(&self, ids: Vec<String>) -> Result<()> {
        for id in &ids {
            name::validate_uid(id)?;
        }
        let mut inner = self.inner.lock().await;
        if !inner.running {
            return Err(Error::BufferClosed);
        }
        for id in ids {
            if inner.replicas.contains_key(&id) {
                continue;
            }
            let replica = Replica::spawn(
                id.clone(),
                self.controller_url.clone(),
                self.weak.clone(),
                self.http.clone(),
            );
            inner.replicas.insert(id.clone(), replica);
            info!(buffer = %self.id, replica = %id, "replica installed");
        }
        let ids: Vec<String> = inner.replicas.keys().cloned().collect();
        drop(inner);
        persist_replicas(&self.path, &ids).await
    }

    /// Ids of the installed replicas.
    pub async fn replica_ids(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut ids: Vec<String> = inner.replicas.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// How many messages the given replica has confirmed on its peer.
    pub async fn replica_len(&self, id: &str) -> Option<u64> {
        self.inner.lock().await.replicas.get(id).map(|r| r.len())
    }

    /// Watch channel observing the given replica's caught-up position.
    pub async fn replica_synced(&self, id: &str) -> Option<tokio::sync::watch::Receiver<u64>> {
        self.inner
            .lock()
            .await
            .replicas
            .get(id)
            .map(|r| r.synced())
    }

    /// Stop the buffer: stop replicas, close segments, persist cursors and
    /// the replica list. Idempotent.
    pub async fn stop(&self) {
        let (replicas, consumers, replica_ids) = {
            let mut inner = self.inner.lock().await;
            if !inner.running {
                return;
            }
            inner.running = false;
            for s in &inner.segments {
                s.close().await;
            }
            let replica_ids: Vec<String> = inner.replicas.keys().cloned().collect();
            let replicas: Vec<Replica> = inner.replicas.drain().map(|(_, r)| r).collect();
            (replicas, inner.consumers.clone(), replica_ids)
        };
        // joins happen outside the lock: replica tasks read this buffer
        for r in replicas {
            r.stop().await;
        }
        if let Err(e) = persist_consumers(&self.path, &consumers).await {
            warn!(buffer = %self.id, error = %e, "failed to persist consumer cursors on stop");
        }
        if let Err(e) = persist_replicas(&self.path, &replica_ids).await {
            warn!(buffer = %self.id, error = %e, "failed to persist replica list on stop");
        }
        info!(buffer = %self.id, replicas = ?replica_ids, "buffer stopped");
    }

    /// Stop and remove the buffer's directory.
    pub async fn delete(&self) -> Result<()> {
        self.stop().await;
        tokio::fs::remove_dir_all(&self.path).await?;
        Ok(())
    }

    /// Ensure the tail segment can take one more message: create the first
    /// segment, rotate a full tail, and trim past the retention bound.
    async fn roll_segments(&self, inner: &mut Inner) -> Result<()> {
        let len = inner.len;
        if inner.segments.is_empty() {
            inner
                .segments
                .push(Segment::create(&self.path, len, self.config.offset_cache_size).await?);
        } else {
            let tail = inner.segments.last().expect("nonempty");
            if tail.len() >= self.config.segment_max_messages
                || tail.size_bytes() >= self.config.segment_max_bytes
            {
                tail.close().await;
                inner
                    .segments
                    .push(Segment::create(&self.path, len, self.config.offset_cache_size).await?);
            }
        }
        while inner.segments.len() > self.config.buffer_max_segments {
            let s = inner.segments.remove(0);
            s.close().await;
            debug!(buffer = %self.id, segment = %s.path().display(), "trimming segment");
            if let Err(e) = tokio::fs::remove_file(s.path()).await {
                warn!(buffer = %self.id, error = %e, "failed to remove trimmed segment file");
            }
        }
        Ok(())
    }
}

/// Locate the segment holding `id` (linear scan over at most
/// `buffer_max_segments` entries) and read it there.
async fn read_at(inner: &Inner, id: u64) -> Result<Message> {
    let Some(first_segment) = inner.segments.first() else {
        return Err(Error::OutOfBounds { id });
    };
    if first_segment.first() > id {
        // the segment holding this id has been trimmed
        return Err(Error::OutOfBounds { id });
    }
    let mut hit = first_segment;
    for s in &inner.segments {
        if s.first() > id {
            break;
        }
        hit = s;
    }
    hit.read(id - hit.first()).await
}

async fn open_segments(path: &Path, config: &BufferConfig) -> Result<Vec<Segment>> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(path).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(FILE_PREFIX) {
            names.push(name);
        }
    }
    names.sort();
    let mut segments = Vec::with_capacity(names.len());
    for name in names {
        segments.push(Segment::open(&path.join(name), config.offset_cache_size).await?);
    }
    Ok(segments)
}

/// Walk every segment's hash chain; returns the tail sha. The first
/// retained segment anchors on the zero seed only when it still starts at
/// id 0 - after a trim its predecessor link is accepted as-is.
async fn verify_segments(segments: &[Segment]) -> Result<Sha> {
    let mut seed = if segments[0].first() == 0 {
        Some(Sha::ZERO)
    } else {
        None
    };
    let mut tail = Sha::ZERO;
    for s in segments {
        if s.is_empty() {
            continue;
        }
        tail = s.verify(seed).await?;
        seed = Some(tail);
    }
    Ok(tail)
}

async fn load_consumers(path: &Path) -> Result<HashMap<String, Cursor>> {
    match tokio::fs::read(path.join(OFFSETS_FILE)).await {
        Ok(data) => Ok(serde_json::from_slice(&data)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(e) => Err(e.into()),
    }
}

async fn persist_consumers(path: &Path, consumers: &HashMap<String, Cursor>) -> Result<()> {
    let data = serde_json::to_vec(consumers)?;
    tokio::fs::write(path.join(OFFSETS_FILE), data).await?;
    Ok(())
}

async fn load_replicas(path: &Path) -> Result<Vec<String>> {
    match tokio::fs::read(path.join(REPLICAS_FILE)).await {
        Ok(data) => Ok(serde_json::from_slice(&data)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

async fn persist_replicas(path: &Path, ids: &[String]) -> Result<()> {
    let data = serde_json::to_vec(ids)?;
    tokio::fs::write(path.join(REPLICAS_FILE), data).await?;
    Ok(())
}
