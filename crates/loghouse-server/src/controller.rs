//! Controller - Catalog and Topic Provisioner
//!
//! The controller holds the authoritative catalog of workers, buffers and
//! topics for one tenant. Workers self-register on startup; topic
//! creation provisions primary buffers round-robin across the registered
//! workers and installs each primary's replica set.
//!
//! ## Consistency Model
//!
//! Eventually reconcilable, not strongly consistent: only the topic map
//! and the replica placement map are persisted (on stop). Workers and
//! buffers re-register whenever they start, and on open the controller
//! re-issues every persisted `set_replicas` call through a background
//! retry loop, because the owning workers may not have registered yet.
//!
//! ## Worker Selection
//!
//! A monotonically increasing counter taken modulo the worker count,
//! walked over the workers sorted by id - map iteration order would make
//! placement depend on hash seeds, so the tie-break is made deterministic
//! here.
//!
//! ## Failure Handling
//!
//! A failed step fails the whole topic creation; buffers already created
//! for it are left behind as orphans (they hold no data and a later
//! delete of the worker directory reclaims them). Topic deletion logs and
//! continues past per-buffer failures the same way.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use loghouse_core::name;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{ApiError, Error, Result};

const TOPICS_FILE: &str = "topics";
const REPLICAS_FILE: &str = "replicas";
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Primary buffers provisioned per topic.
    #[serde(default = "default_primary_count")]
    pub primary_count: usize,

    /// Replica buffers per primary.
    #[serde(default = "default_replica_count")]
    pub replica_count: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            primary_count: default_primary_count(),
            replica_count: default_replica_count(),
        }
    }
}

fn default_primary_count() -> usize {
    3
}

fn default_replica_count() -> usize {
    2
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// 16-hex-char controller id.
    pub id: String,
    /// URL under which the controller's routes are mounted.
    pub url: String,
    /// Directory for the persisted topic and replica maps.
    pub path: PathBuf,
    pub config: ControllerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferRecord {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topic {
    pub id: String,
    pub buffers: Vec<String>,
}

/// Everything the controller knows, for the info endpoint.
#[derive(Debug, Serialize)]
pub struct CatalogView {
    pub workers: HashMap<String, WorkerRecord>,
    pub topics: HashMap<String, Topic>,
    pub buffers: HashMap<String, BufferRecord>,
}

struct Catalog {
    workers: HashMap<String, WorkerRecord>,
    topics: HashMap<String, Topic>,
    buffers: HashMap<String, BufferRecord>,
    /// Primary buffer id -> replica buffer ids.
    replicas: HashMap<String, Vec<String>>,
    /// Round-robin counter for worker selection.
    n: usize,
}

pub struct Controller {
    id: String,
    url: String,
    path: PathBuf,
    config: ControllerConfig,
    http: reqwest::Client,
    weak: Weak<Controller>,
    shutdown_tx: watch::Sender<bool>,
    inner: Mutex<Catalog>,
}

impl Controller {
    /// Open the controller, restoring persisted topics and replica
    /// placements if present. Background reconciliation starts with
    /// [`Controller::start`], once the node is serving.
    pub async fn open(opts: ControllerOptions) -> Result<Arc<Controller>> {
        let topics: HashMap<String, Topic> = read_state(&opts.path.join(TOPICS_FILE)).await?;
        let replicas: HashMap<String, Vec<String>> =
            read_state(&opts.path.join(REPLICAS_FILE)).await?;

        let (shutdown_tx, _) = watch::channel(false);
        let controller = Arc::new_cyclic(|weak| Controller {
            id: opts.id,
            url: opts.url,
            path: opts.path,
            config: opts.config,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("reqwest client"),
            weak: weak.clone(),
            shutdown_tx,
            inner: Mutex::new(Catalog {
                workers: HashMap::new(),
                topics,
                buffers: HashMap::new(),
                replicas,
                n: 0,
            }),
        });
        Ok(controller)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Kick off background reconciliation: every persisted primary gets
    /// its replica set re-installed, with retries, as workers register.
    pub async fn start(&self) {
        let pairs: Vec<(String, Vec<String>)> = {
            let catalog = self.inner.lock().await;
            catalog
                .replicas
                .iter()
                .map(|(p, r)| (p.clone(), r.clone()))
                .collect()
        };
        for (primary, replicas) in pairs {
            self.spawn_set_replicas(primary, replicas);
        }
    }

    /// Persist the topic and replica maps and stop reconciliation tasks.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let (topics, replicas) = {
            let catalog = self.inner.lock().await;
            (catalog.topics.clone(), catalog.replicas.clone())
        };
        if let Err(e) = self.persist(&topics, &replicas).await {
            warn!(controller = %self.id, error = %e, "failed to persist controller state");
        }
        info!(controller = %self.id, "controller stopped");
    }

    async fn persist(
        &self,
        topics: &HashMap<String, Topic>,
        replicas: &HashMap<String, Vec<String>>,
    ) -> Result<()> {
        tokio::fs::create_dir_all(&self.path).await?;
        tokio::fs::write(self.path.join(TOPICS_FILE), serde_json::to_vec(topics)?).await?;
        tokio::fs::write(self.path.join(REPLICAS_FILE), serde_json::to_vec(replicas)?).await?;
        Ok(())
    }

    /// Pick the next worker, round-robin over ids sorted for a
    /// deterministic order.
    fn pick_worker(catalog: &mut Catalog) -> std::result::Result<WorkerRecord, ApiError> {
        if catalog.workers.is_empty() {
            return Err(ApiError::Internal("no workers registered".to_string()));
        }
        let mut ids: Vec<&String> = catalog.workers.keys().collect();
        ids.sort();
        let pick = ids[catalog.n % ids.len()].clone();
        catalog.n += 1;
        Ok(catalog.workers[&pick].clone())
    }

    /// Ask a worker to create an empty buffer, recording the result.
    async fn create_buffer(
        &self,
        catalog: &mut Catalog,
    ) -> std::result::Result<BufferRecord, ApiError> {
        let worker = Self::pick_worker(catalog)?;
        let resp = self
            .http
            .post(format!("{}/buffers", worker.url))
            .send()
            .await
            .map_err(|e| ApiError::Internal(format!("create buffer request failed: {}", e)))?;
        if resp.status() != StatusCode::CREATED {
            return Err(ApiError::Internal(format!(
                "worker {} returned {} for create buffer",
                worker.id,
                resp.status()
            )));
        }
        let record: BufferRecord = resp
            .json()
            .await
            .map_err(|e| ApiError::Internal(format!("unreadable create buffer response: {}", e)))?;
        catalog.buffers.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    /// Provision a topic: `primary_count` primaries, each with
    /// `replica_count` replicas on subsequently picked workers.
    async fn create_topic(&self, id: &str) -> std::result::Result<Topic, ApiError> {
        let mut catalog = self.inner.lock().await;
        if catalog.topics.contains_key(id) {
            return Err(ApiError::Conflict(format!("topic {:?} already exists", id)));
        }
        let mut topic = Topic {
            id: id.to_string(),
            buffers: Vec::with_capacity(self.config.primary_count),
        };
        for _ in 0..self.config.primary_count {
            let primary = self.create_buffer(&mut catalog).await?;
            topic.buffers.push(primary.id.clone());

            let mut replicas = Vec::with_capacity(self.config.replica_count);
            for _ in 0..self.config.replica_count {
                let replica = self.create_buffer(&mut catalog).await?;
                replicas.push(replica.id.clone());
            }
            catalog.replicas.insert(primary.id.clone(), replicas.clone());
            self.spawn_set_replicas(primary.id, replicas);
        }
        catalog.topics.insert(id.to_string(), topic.clone());
        info!(controller = %self.id, topic = %id, buffers = ?topic.buffers, "topic created");
        Ok(topic)
    }

    /// Install a replica set on a primary, retrying until the primary's
    /// worker shows up in the catalog and accepts the call.
    fn spawn_set_replicas(&self, primary: String, replicas: Vec<String>) {
        let Some(controller) = self.weak.upgrade() else {
            return;
        };
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                match controller.try_set_replicas(&primary, &replicas).await {
                    Ok(()) => {
                        info!(primary = %primary, ?replicas, "replica set installed");
                        return;
                    }
                    Err(e) => {
                        debug!(primary = %primary, error = %e, "set replicas not yet possible");
                    }
                }
                tokio::select! {
                    _ = sleep(RETRY_INTERVAL) => {}
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    async fn try_set_replicas(&self, primary: &str, replicas: &[String]) -> Result<()> {
        let url = {
            let catalog = self.inner.lock().await;
            match catalog.buffers.get(primary) {
                Some(b) => b.url.clone(),
                None => {
                    return Err(Error::Registration(format!(
                        "buffer {:?} not registered yet",
                        primary
                    )))
                }
            }
        };
        let resp = self
            .http
            .post(format!("{}/replicas", url))
            .json(&replicas)
            .send()
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(Error::Registration(format!(
                "primary {} returned {} for set replicas",
                primary,
                resp.status()
            )));
        }
        Ok(())
    }

    /// Delete a topic's buffers on their workers; errors are logged and
    /// skipped, so orphaned buffers are possible.
    async fn delete_topic(&self, id: &str) {
        let buffers: Vec<BufferRecord> = {
            let mut catalog = self.inner.lock().await;
            let Some(topic) = catalog.topics.remove(id) else {
                return;
            };
            let mut records = Vec::new();
            for b in &topic.buffers {
                // take the primary's replicas down with it
                let replica_ids = catalog.replicas.remove(b).unwrap_or_default();
                for r in replica_ids.iter().chain(std::iter::once(b)) {
                    if let Some(record) = catalog.buffers.remove(r) {
                        records.push(record);
                    }
                }
            }
            records
        };
        for record in buffers {
            match self.http.delete(&record.url).send().await {
                Ok(resp) if resp.status() == StatusCode::OK => {
                    debug!(buffer = %record.id, "buffer deleted");
                }
                Ok(resp) => {
                    warn!(buffer = %record.id, status = %resp.status(), "buffer now orphaned");
                }
                Err(e) => {
                    warn!(buffer = %record.id, error = %e, "buffer now orphaned");
                }
            }
        }
        info!(controller = %self.id, topic = %id, "topic deleted");
    }

    /// The controller's HTTP surface.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/", get(get_info))
            .route("/workers", post(register_worker).get(list_workers))
            .route("/topics", get(list_topics))
            .route(
                "/topics/:topic",
                post(create_topic).get(get_topic).delete(delete_topic),
            )
            .route("/buffers", post(register_buffer).get(list_buffers))
            .route("/buffers/:buffer", get(get_buffer))
            .with_state(self)
    }
}

async fn get_info(State(c): State<Arc<Controller>>) -> Json<CatalogView> {
    let catalog = c.inner.lock().await;
    Json(CatalogView {
        workers: catalog.workers.clone(),
        topics: catalog.topics.clone(),
        buffers: catalog.buffers.clone(),
    })
}

async fn register_worker(
    State(c): State<Arc<Controller>>,
    Json(worker): Json<WorkerRecord>,
) -> std::result::Result<StatusCode, ApiError> {
    name::validate_uid(&worker.id)?;
    let mut catalog = c.inner.lock().await;
    info!(controller = %c.id, worker = %worker.id, url = %worker.url, "worker registered");
    catalog.workers.insert(worker.id.clone(), worker);
    Ok(StatusCode::NO_CONTENT)
}

async fn list_workers(State(c): State<Arc<Controller>>) -> Json<HashMap<String, WorkerRecord>> {
    Json(c.inner.lock().await.workers.clone())
}

async fn register_buffer(
    State(c): State<Arc<Controller>>,
    Json(buffer): Json<BufferRecord>,
) -> std::result::Result<StatusCode, ApiError> {
    name::validate_uid(&buffer.id)?;
    let mut catalog = c.inner.lock().await;
    catalog.buffers.insert(buffer.id.clone(), buffer);
    Ok(StatusCode::NO_CONTENT)
}

async fn list_buffers(State(c): State<Arc<Controller>>) -> Json<HashMap<String, BufferRecord>> {
    Json(c.inner.lock().await.buffers.clone())
}

async fn get_buffer(
    State(c): State<Arc<Controller>>,
    Path(buffer): Path<String>,
) -> std::result::Result<Json<BufferRecord>, ApiError> {
    name::validate_uid(&buffer).map_err(|_| ApiError::NotFound(buffer.clone()))?;
    let catalog = c.inner.lock().await;
    match catalog.buffers.get(&buffer) {
        Some(b) => Ok(Json(b.clone())),
        None => Err(ApiError::NotFound(format!("buffer {:?} not found", buffer))),
    }
}

async fn list_topics(State(c): State<Arc<Controller>>) -> Json<HashMap<String, Topic>> {
    Json(c.inner.lock().await.topics.clone())
}

async fn create_topic(
    State(c): State<Arc<Controller>>,
    Path(topic): Path<String>,
) -> std::result::Result<(StatusCode, Json<Topic>), ApiError> {
    name::validate_name(&topic)?;
    let t = c.create_topic(&topic).await?;
    Ok((StatusCode::CREATED, Json(t)))
}

async fn get_topic(
    State(c): State<Arc<Controller>>,
    Path(topic): Path<String>,
) -> std::result::Result<Json<Topic>, ApiError> {
    name::validate_name(&topic)?;
    let catalog = c.inner.lock().await;
    match catalog.topics.get(&topic) {
        Some(t) => Ok(Json(t.clone())),
        None => Err(ApiError::NotFound(format!("topic {:?} not found", topic))),
    }
}

async fn delete_topic(
    State(c): State<Arc<Controller>>,
    Path(topic): Path<String>,
) -> std::result::Result<StatusCode, ApiError> {
    name::validate_name(&topic)?;
    c.delete_topic(&topic).await;
    Ok(StatusCode::OK)
}

async fn read_state<T: serde::de::DeserializeOwned + Default>(
    path: &std::path::Path,
) -> Result<T> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(serde_json::from_slice(&data)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_config_defaults() {
        let c = ControllerConfig::default();
        assert_eq!(c.primary_count, 3);
        assert_eq!(c.replica_count, 2);
        let parsed: ControllerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed.primary_count, 3);
        assert_eq!(parsed.replica_count, 2);
    }

    #[test]
    fn test_pick_worker_is_deterministic_round_robin() {
        let mut catalog = Catalog {
            workers: HashMap::new(),
            topics: HashMap::new(),
            buffers: HashMap::new(),
            replicas: HashMap::new(),
            n: 0,
        };
        for id in ["cccccccccccccccc", "aaaaaaaaaaaaaaaa", "bbbbbbbbbbbbbbbb"] {
            catalog.workers.insert(
                id.to_string(),
                WorkerRecord {
                    id: id.to_string(),
                    url: format!("http://{}", id),
                },
            );
        }
        let picks: Vec<String> = (0..6)
            .map(|_| Controller::pick_worker(&mut catalog).unwrap().id)
            .collect();
        assert_eq!(
            picks,
            vec![
                "aaaaaaaaaaaaaaaa",
                "bbbbbbbbbbbbbbbb",
                "cccccccccccccccc",
                "aaaaaaaaaaaaaaaa",
                "bbbbbbbbbbbbbbbb",
                "cccccccccccccccc",
            ]
        );
    }

    #[test]
    fn test_pick_worker_empty_catalog() {
        let mut catalog = Catalog {
            workers: HashMap::new(),
            topics: HashMap::new(),
            buffers: HashMap::new(),
            replicas: HashMap::new(),
            n: 0,
        };
        assert!(Controller::pick_worker(&mut catalog).is_err());
    }

    // ---------------------------------------------------------------
    // Provisioning against a stub worker
    // ---------------------------------------------------------------

    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Stub worker: creates buffers with fresh ids and accepts any
    /// replica set.
    async fn start_stub_worker() -> (String, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let buffer_base = base.clone();

        let app = axum::Router::new()
            .route(
                "/buffers",
                post(move || {
                    let counter = counter.clone();
                    let base = buffer_base.clone();
                    async move {
                        counter.fetch_add(1, Ordering::AcqRel);
                        let id = name::uid();
                        (
                            StatusCode::CREATED,
                            Json(serde_json::json!({
                                "id": id,
                                "url": format!("{}/buffers/{}", base, id),
                            })),
                        )
                    }
                }),
            )
            .route(
                "/buffers/:id/replicas",
                post(|| async { StatusCode::OK }),
            );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (base, created)
    }

    async fn open_controller(path: &std::path::Path) -> Arc<Controller> {
        Controller::open(ControllerOptions {
            id: name::uid(),
            url: "http://controller".to_string(),
            path: path.to_path_buf(),
            config: ControllerConfig {
                primary_count: 2,
                replica_count: 1,
            },
        })
        .await
        .unwrap()
    }

    async fn register_stub_worker(controller: &Controller, url: &str) {
        controller.inner.lock().await.workers.insert(
            "aaaaaaaaaaaaaaaa".to_string(),
            WorkerRecord {
                id: "aaaaaaaaaaaaaaaa".to_string(),
                url: url.to_string(),
            },
        );
    }

    #[tokio::test]
    async fn test_create_topic_provisions_primaries_and_replicas() {
        let dir = tempfile::tempdir().unwrap();
        let (worker_url, created) = start_stub_worker().await;
        let controller = open_controller(dir.path()).await;
        register_stub_worker(&controller, &worker_url).await;

        let topic = controller.create_topic("events").await.unwrap();
        assert_eq!(topic.buffers.len(), 2);

        // 2 primaries x (1 + 1 replica) buffers created on the worker
        assert_eq!(created.load(Ordering::Acquire), 4);

        let catalog = controller.inner.lock().await;
        assert_eq!(catalog.buffers.len(), 4);
        for primary in &topic.buffers {
            assert_eq!(catalog.replicas[primary].len(), 1);
        }
        drop(catalog);
        controller.stop().await;
    }

    #[tokio::test]
    async fn test_create_topic_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let (worker_url, _created) = start_stub_worker().await;
        let controller = open_controller(dir.path()).await;
        register_stub_worker(&controller, &worker_url).await;

        controller.create_topic("events").await.unwrap();
        assert!(matches!(
            controller.create_topic("events").await,
            Err(ApiError::Conflict(_))
        ));
        controller.stop().await;
    }

    #[tokio::test]
    async fn test_create_topic_fails_without_workers() {
        let dir = tempfile::tempdir().unwrap();
        let controller = open_controller(dir.path()).await;
        assert!(controller.create_topic("events").await.is_err());
        // the failed attempt must not leave the topic behind
        assert!(controller.inner.lock().await.topics.is_empty());
        controller.stop().await;
    }

    #[tokio::test]
    async fn test_stop_persists_and_open_restores() {
        let dir = tempfile::tempdir().unwrap();
        let (worker_url, _created) = start_stub_worker().await;

        {
            let controller = open_controller(dir.path()).await;
            register_stub_worker(&controller, &worker_url).await;
            controller.create_topic("events").await.unwrap();
            controller.stop().await;
        }

        let controller = open_controller(dir.path()).await;
        let catalog = controller.inner.lock().await;
        assert!(catalog.topics.contains_key("events"));
        assert_eq!(catalog.replicas.len(), 2);
        // workers and buffers are not persisted; they re-register
        assert!(catalog.workers.is_empty());
        assert!(catalog.buffers.is_empty());
        drop(catalog);
        controller.stop().await;
    }
}
