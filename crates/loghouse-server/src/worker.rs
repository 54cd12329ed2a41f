//! Worker - Buffer Host
//!
//! A worker owns the buffers living on one node and exposes their CRUD
//! and message operations over HTTP. On startup it re-opens every buffer
//! found under `<path>/buffers/` and registers itself plus each buffer
//! with the controller; if registration fails, startup fails loudly (a
//! worker the controller cannot see serves no one).
//!
//! ## Replication Writes
//!
//! The write endpoint honors two request headers:
//!
//! - `Hbuf-Id`: explicit message id; must equal the receiving buffer's
//!   next id, otherwise the write is rejected with 400
//! - `Hbuf-Ts`: the original write's RFC 3339 timestamp
//!
//! Replicas use both to preserve message identity; ordinary producers
//! send neither and the buffer assigns them.
//!
//! ## Locking
//!
//! Buffer lookups take the worker's map lock briefly; the buffer
//! operation itself then runs against the buffer's own lock.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use loghouse_core::message::Metadata;
use loghouse_core::{name, BufferConfig};
use loghouse_storage::{Buffer, BufferMeta, BufferOptions, Cursor, WriteRequest};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{ApiError, Error, Result};

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// 16-hex-char worker id.
    pub id: String,
    /// URL under which this worker's routes are mounted.
    pub url: String,
    pub controller_url: String,
    /// Worker data directory; buffers live in `<path>/buffers/<id>`.
    pub path: PathBuf,
    pub config: BufferConfig,
}

/// The registration record posted to the controller.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerRecord {
    pub id: String,
    pub url: String,
}

pub struct Worker {
    id: String,
    url: String,
    controller_url: String,
    path: PathBuf,
    config: BufferConfig,
    http: reqwest::Client,
    buffers: RwLock<HashMap<String, Arc<Buffer>>>,
}

impl Worker {
    /// Open the worker: re-open on-disk buffers. Registration with the
    /// controller happens separately via [`Worker::register`], once the
    /// node's HTTP server is accepting connections.
    pub async fn open(opts: WorkerOptions) -> Result<Arc<Worker>> {
        let worker = Worker {
            id: opts.id,
            url: opts.url,
            controller_url: opts.controller_url,
            path: opts.path,
            config: opts.config,
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(5))
                .build()?,
            buffers: RwLock::new(HashMap::new()),
        };
        worker.load_buffers().await?;
        Ok(Arc::new(worker))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn load_buffers(&self) -> Result<()> {
        let dir = self.path.join("buffers");
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let mut buffers = self.buffers.write().await;
        while let Some(entry) = entries.next_entry().await? {
            let id = entry.file_name().to_string_lossy().into_owned();
            if !name::is_valid_uid(&id) {
                continue;
            }
            match Buffer::open(self.buffer_options(&id)).await {
                Ok(b) => {
                    info!(worker = %self.id, buffer = %id, "loaded buffer from disk");
                    buffers.insert(id, b);
                }
                Err(e) => {
                    // one bad directory must not take the whole worker down
                    warn!(worker = %self.id, buffer = %id, error = %e, "failed to open buffer");
                }
            }
        }
        Ok(())
    }

    fn buffer_options(&self, id: &str) -> BufferOptions {
        BufferOptions {
            id: id.to_string(),
            url: format!("{}/buffers/{}", self.url, id),
            controller_url: self.controller_url.clone(),
            path: self.path.join("buffers").join(id),
            config: self.config.clone(),
            initial_len: 0,
        }
    }

    /// Register this worker and all of its buffers with the controller.
    /// Any failure is fatal to node startup.
    pub async fn register(&self) -> Result<()> {
        let record = WorkerRecord {
            id: self.id.clone(),
            url: self.url.clone(),
        };
        let resp = self
            .http
            .post(format!("{}/workers", self.controller_url))
            .json(&record)
            .send()
            .await?;
        if resp.status() != StatusCode::NO_CONTENT {
            return Err(Error::Registration(format!(
                "controller returned {} for worker {}",
                resp.status(),
                self.id
            )));
        }
        let metas: Vec<BufferMeta> = {
            let buffers = self.buffers.read().await;
            let mut metas = Vec::with_capacity(buffers.len());
            for b in buffers.values() {
                metas.push(b.meta().await);
            }
            metas
        };
        for meta in metas {
            let resp = self
                .http
                .post(format!("{}/buffers", self.controller_url))
                .json(&serde_json::json!({"id": &meta.id, "url": &meta.url}))
                .send()
                .await?;
            if resp.status() != StatusCode::NO_CONTENT {
                return Err(Error::Registration(format!(
                    "controller returned {} for buffer {}",
                    resp.status(),
                    meta.id
                )));
            }
            info!(worker = %self.id, buffer = %meta.id, "buffer registered with controller");
        }
        info!(worker = %self.id, url = %self.url, "worker registered with controller");
        Ok(())
    }

    /// Create an empty buffer and register it in the local map. The
    /// controller records it from the response.
    pub async fn create_buffer(&self) -> Result<BufferMeta> {
        let id = name::uid();
        let buffer = Buffer::open(self.buffer_options(&id)).await?;
        let meta = buffer.meta().await;
        self.buffers.write().await.insert(id.clone(), buffer);
        info!(worker = %self.id, buffer = %id, "created buffer");
        Ok(meta)
    }

    async fn buffer(&self, id: &str) -> std::result::Result<Arc<Buffer>, ApiError> {
        self.buffers
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("buffer {:?} not found", id)))
    }

    /// Stop every buffer. The worker keeps answering metadata requests
    /// but all message operations fail once the buffers are stopped.
    pub async fn stop(&self) {
        let buffers: Vec<Arc<Buffer>> = self.buffers.read().await.values().cloned().collect();
        for b in buffers {
            b.stop().await;
        }
        info!(worker = %self.id, "worker stopped");
    }

    /// The worker's HTTP surface.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/", get(get_info))
            .route("/buffers", post(create_buffer).get(list_buffers))
            .route(
                "/buffers/:buffer",
                get(get_buffer).post(write_to_buffer).delete(delete_buffer),
            )
            .route("/buffers/:buffer/replicas", post(set_replicas))
            .route("/buffers/:buffer/consumers", get(get_consumers))
            .route(
                "/buffers/:buffer/consumers/:consumer/_next",
                post(consume_from_buffer),
            )
            .with_state(self)
    }
}

async fn get_info(State(w): State<Arc<Worker>>) -> Json<WorkerRecord> {
    Json(WorkerRecord {
        id: w.id.clone(),
        url: w.url.clone(),
    })
}

async fn create_buffer(
    State(w): State<Arc<Worker>>,
) -> std::result::Result<(StatusCode, Json<BufferMeta>), ApiError> {
    let meta = w
        .create_buffer()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok((StatusCode::CREATED, Json(meta)))
}

async fn list_buffers(
    State(w): State<Arc<Worker>>,
) -> std::result::Result<Json<HashMap<String, BufferMeta>>, ApiError> {
    let buffers: Vec<Arc<Buffer>> = w.buffers.read().await.values().cloned().collect();
    let mut out = HashMap::with_capacity(buffers.len());
    for b in buffers {
        let meta = b.meta().await;
        out.insert(meta.id.clone(), meta);
    }
    Ok(Json(out))
}

async fn get_buffer(
    State(w): State<Arc<Worker>>,
    Path(buffer): Path<String>,
) -> std::result::Result<Json<BufferMeta>, ApiError> {
    let b = w.buffer(&buffer).await?;
    Ok(Json(b.meta().await))
}

async fn delete_buffer(
    State(w): State<Arc<Worker>>,
    Path(buffer): Path<String>,
) -> std::result::Result<StatusCode, ApiError> {
    let b = w.buffer(&buffer).await?;
    b.delete().await?;
    w.buffers.write().await.remove(&buffer);
    info!(worker = %w.id, buffer = %buffer, "deleted buffer");
    Ok(StatusCode::OK)
}

async fn write_to_buffer(
    State(w): State<Arc<Worker>>,
    Path(buffer): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> std::result::Result<Json<Metadata>, ApiError> {
    let b = w.buffer(&buffer).await?;
    let mut req = WriteRequest::new(content_type(&headers), body);
    if let Some(h) = headers.get("Hbuf-Id") {
        let raw = h
            .to_str()
            .map_err(|_| ApiError::BadRequest("unreadable Hbuf-Id header".to_string()))?;
        req.id = Some(raw.parse::<u64>().map_err(|e| {
            ApiError::BadRequest(format!("error parsing Hbuf-Id header {:?}: {}", raw, e))
        })?);
    }
    if let Some(h) = headers.get("Hbuf-Ts") {
        let raw = h
            .to_str()
            .map_err(|_| ApiError::BadRequest("unreadable Hbuf-Ts header".to_string()))?;
        let ts = DateTime::parse_from_rfc3339(raw).map_err(|e| {
            ApiError::BadRequest(format!("error parsing Hbuf-Ts header {:?}: {}", raw, e))
        })?;
        req.ts = Some(ts.with_timezone(&Utc));
    }
    let m = b.write(req).await?;
    Ok(Json(m.metadata()))
}

async fn set_replicas(
    State(w): State<Arc<Worker>>,
    Path(buffer): Path<String>,
    Json(replicas): Json<Vec<String>>,
) -> std::result::Result<StatusCode, ApiError> {
    let b = w.buffer(&buffer).await?;
    b.set_replicas(replicas.clone()).await?;
    info!(worker = %w.id, buffer = %buffer, ?replicas, "set replicas");
    Ok(StatusCode::OK)
}

async fn get_consumers(
    State(w): State<Arc<Worker>>,
    Path(buffer): Path<String>,
) -> std::result::Result<Json<HashMap<String, Cursor>>, ApiError> {
    let b = w.buffer(&buffer).await?;
    Ok(Json(b.consumers().await))
}

async fn consume_from_buffer(
    State(w): State<Arc<Worker>>,
    Path((buffer, consumer)): Path<(String, String)>,
) -> std::result::Result<Response, ApiError> {
    name::validate_name(&consumer)?;
    let b = w.buffer(&buffer).await?;
    let m = b.consume(&consumer).await?;
    let ct = if m.content_type.is_empty() {
        "application/octet-stream".to_string()
    } else {
        m.content_type
    };
    Ok(([("content-type", ct)], m.body).into_response())
}

fn content_type(headers: &HeaderMap) -> String {
    headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}
