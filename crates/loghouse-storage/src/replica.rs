//! Replica - Background Pull Replication
//!
//! A replica asynchronously copies a primary buffer's messages, in id
//! order, to a peer buffer on another worker. It is owned by the primary
//! buffer and runs as two persistent tasks:
//!
//! - **updater**: resolves the peer buffer's URL by asking the controller,
//!   retrying every second until it succeeds and refreshing every five
//!   seconds after that (workers move, buffers get re-registered)
//! - **syncer**: establishes the replication cursor from the peer's
//!   current length, then pulls messages from the primary and POSTs them
//!   to the peer with explicit identity headers (`Hbuf-Id`, `Hbuf-Ts`),
//!   going idle when it catches up and waking on the primary's write
//!   signal
//!
//! ## Signal Coalescing
//!
//! The write path pokes the replica through a capacity-1 channel with a
//! non-blocking try-send: a burst of writes collapses into a single
//! wake-up, and the syncer drains everything it finds once awake. The
//! poke must never block the buffer's write path.
//!
//! ## Delivery Contract
//!
//! At-least-once: if the peer accepts a message but the response is lost,
//! the same id is posted again and the peer rejects it (its next-id check
//! fails), which ends the sync round; the next round re-reads the peer
//! length and realigns. Ordering is strictly increasing ids per
//! (primary, replica) pair.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use loghouse_core::Message;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::buffer::Buffer;
use crate::error::{Error, Result};

const RETRY_INTERVAL: Duration = Duration::from_secs(1);
const REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// What the controller and the peer worker report about a buffer.
#[derive(Debug, Deserialize)]
struct PeerInfo {
    #[allow(dead_code)]
    id: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    len: u64,
}

/// Ack returned by the peer for an accepted write.
#[derive(Debug, Deserialize)]
struct WriteAck {
    id: u64,
}

struct Shared {
    /// Peer buffer URL once discovered.
    url: StdMutex<Option<String>>,
    /// Next id to replicate == messages confirmed on the peer.
    cursor: AtomicU64,
}

pub(crate) struct Replica {
    id: String,
    data_tx: mpsc::Sender<()>,
    shutdown_tx: watch::Sender<bool>,
    synced_rx: watch::Receiver<u64>,
    shared: Arc<Shared>,
    updater: JoinHandle<()>,
    syncer: JoinHandle<()>,
}

impl Replica {
    /// Start the updater and syncer tasks for the given peer buffer id.
    pub(crate) fn spawn(
        id: String,
        controller_url: String,
        buffer: Weak<Buffer>,
        http: reqwest::Client,
    ) -> Replica {
        let (data_tx, data_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (synced_tx, synced_rx) = watch::channel(0u64);
        let shared = Arc::new(Shared {
            url: StdMutex::new(None),
            cursor: AtomicU64::new(0),
        });

        let updater = tokio::spawn(run_updater(
            id.clone(),
            controller_url,
            http.clone(),
            shared.clone(),
            shutdown_rx.clone(),
        ));
        let syncer = tokio::spawn(run_syncer(
            id.clone(),
            buffer,
            http,
            shared.clone(),
            data_rx,
            shutdown_rx,
            synced_tx,
        ));

        Replica {
            id,
            data_tx,
            shutdown_tx,
            synced_rx,
            shared,
            updater,
            syncer,
        }
    }

    /// Non-blocking wake-up from the primary's write path. An unread
    /// signal satisfies any number of new writes.
    pub(crate) fn poke(&self) {
        let _ = self.data_tx.try_send(());
    }

    /// Messages confirmed on the peer.
    pub(crate) fn len(&self) -> u64 {
        self.shared.cursor.load(Ordering::Acquire)
    }

    /// Observe the caught-up position; updated each time the syncer
    /// drains the primary.
    pub(crate) fn synced(&self) -> watch::Receiver<u64> {
        self.synced_rx.clone()
    }

    /// Signal shutdown and join both tasks.
    pub(crate) async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.updater.await;
        let _ = self.syncer.await;
        info!(replica = %self.id, "replica stopped");
    }
}

/// Resolve and refresh the peer URL via the controller.
async fn run_updater(
    id: String,
    controller_url: String,
    http: reqwest::Client,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(replica = %id, "updater started");
    loop {
        let wait = match discover(&http, &controller_url, &id).await {
            Ok(url) => {
                let mut slot = shared.url.lock().expect("url lock");
                if slot.as_deref() != Some(url.as_str()) {
                    info!(replica = %id, url = %url, "peer url resolved");
                    *slot = Some(url);
                }
                REFRESH_INTERVAL
            }
            Err(e) => {
                debug!(replica = %id, error = %e, "peer url discovery failed");
                RETRY_INTERVAL
            }
        };
        tokio::select! {
            _ = sleep(wait) => {}
            _ = shutdown.changed() => {
                debug!(replica = %id, "updater stopped");
                return;
            }
        }
    }
}

async fn discover(http: &reqwest::Client, controller_url: &str, id: &str) -> Result<String> {
    let resp = http
        .get(format!("{}/buffers/{}", controller_url, id))
        .send()
        .await
        .map_err(|e| Error::Transient(e.to_string()))?;
    if !resp.status().is_success() {
        return Err(Error::Transient(format!(
            "controller returned {} for buffer {}",
            resp.status(),
            id
        )));
    }
    let info: PeerInfo = resp
        .json()
        .await
        .map_err(|e| Error::Transient(e.to_string()))?;
    if info.url.is_empty() {
        return Err(Error::Transient(format!("buffer {} has no url yet", id)));
    }
    Ok(info.url)
}

/// Pull from the primary and push to the peer until shut down.
async fn run_syncer(
    id: String,
    buffer: Weak<Buffer>,
    http: reqwest::Client,
    shared: Arc<Shared>,
    mut data: mpsc::Receiver<()>,
    mut shutdown: watch::Receiver<bool>,
    synced_tx: watch::Sender<u64>,
) {
    debug!(replica = %id, "syncer started");
    let mut cursor_known = false;
    loop {
        // Discovering: wait for the updater to resolve the peer URL, then
        // learn the peer's length to place the cursor.
        let url = shared.url.lock().expect("url lock").clone();
        let url = match url {
            Some(u) => u,
            None => {
                if pause(RETRY_INTERVAL, &mut shutdown).await {
                    break;
                }
                continue;
            }
        };
        if !cursor_known {
            match peer_len(&http, &url).await {
                Ok(len) => {
                    shared.cursor.store(len, Ordering::Release);
                    cursor_known = true;
                    debug!(replica = %id, len, "replication cursor established");
                }
                Err(e) => {
                    debug!(replica = %id, error = %e, "peer length query failed");
                    if pause(RETRY_INTERVAL, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            }
        }

        // Syncing: drain the primary into the peer.
        let caught_up = sync_round(&id, &buffer, &http, &shared, &mut shutdown).await;
        match caught_up {
            RoundEnd::CaughtUp(at) => {
                let _ = synced_tx.send(at);
            }
            // an id disagreement means our cursor is stale (e.g. a lost
            // ack); re-read the peer length next round
            RoundEnd::Aborted => cursor_known = false,
            RoundEnd::Shutdown | RoundEnd::BufferGone => break,
        }

        // Idle: wake on new data or shutdown.
        tokio::select! {
            _ = data.recv() => {}
            _ = shutdown.changed() => break,
        }
    }
    debug!(replica = %id, "syncer stopped");
}

enum RoundEnd {
    /// Primary drained; the payload is the caught-up length.
    CaughtUp(u64),
    /// Peer disagreed about ids; realign next round.
    Aborted,
    Shutdown,
    BufferGone,
}

async fn sync_round(
    id: &str,
    buffer: &Weak<Buffer>,
    http: &reqwest::Client,
    shared: &Arc<Shared>,
    shutdown: &mut watch::Receiver<bool>,
) -> RoundEnd {
    loop {
        let l = shared.cursor.load(Ordering::Acquire);
        let m = {
            let Some(buf) = buffer.upgrade() else {
                return RoundEnd::BufferGone;
            };
            match buf.read(l).await {
                Ok(m) => m,
                Err(Error::OutOfBounds { .. }) => return RoundEnd::CaughtUp(l),
                Err(e) => {
                    debug!(replica = %id, error = %e, "primary read failed");
                    return RoundEnd::Aborted;
                }
            }
        };
        let url = match shared.url.lock().expect("url lock").clone() {
            Some(u) => u,
            None => return RoundEnd::Aborted,
        };
        match post_message(http, &url, l, &m).await {
            Ok(ack) if ack == l => {
                shared.cursor.store(l + 1, Ordering::Release);
            }
            Ok(ack) => {
                warn!(replica = %id, expected = l, got = ack, "peer acked wrong id; ending round");
                return RoundEnd::Aborted;
            }
            Err(Error::PeerRejected { status, .. }) => {
                warn!(replica = %id, id = l, status, "peer rejected message; ending round");
                return RoundEnd::Aborted;
            }
            Err(e) => {
                debug!(replica = %id, id = l, error = %e, "replication post failed; retrying");
                if pause(RETRY_INTERVAL, shutdown).await {
                    return RoundEnd::Shutdown;
                }
            }
        }
    }
}

async fn peer_len(http: &reqwest::Client, url: &str) -> Result<u64> {
    let resp = http
        .get(url)
        .send()
        .await
        .map_err(|e| Error::Transient(e.to_string()))?;
    if !resp.status().is_success() {
        return Err(Error::Transient(format!(
            "peer returned {} for metadata",
            resp.status()
        )));
    }
    let info: PeerInfo = resp
        .json()
        .await
        .map_err(|e| Error::Transient(e.to_string()))?;
    Ok(info.len)
}

async fn post_message(
    http: &reqwest::Client,
    url: &str,
    id: u64,
    m: &Message,
) -> Result<u64> {
    let resp = http
        .post(url)
        .header("Hbuf-Id", id.to_string())
        .header("Hbuf-Ts", m.ts_rfc3339())
        .header("Content-Type", if m.content_type.is_empty() {
            "application/octet-stream"
        } else {
            m.content_type.as_str()
        })
        .body(m.body.clone())
        .send()
        .await
        .map_err(|e| Error::Transient(e.to_string()))?;
    let status = resp.status();
    if status == reqwest::StatusCode::BAD_REQUEST {
        return Err(Error::PeerRejected {
            id,
            status: status.as_u16(),
        });
    }
    if !status.is_success() {
        return Err(Error::Transient(format!(
            "peer returned {} for message {}",
            status, id
        )));
    }
    let ack: WriteAck = resp
        .json()
        .await
        .map_err(|e| Error::Transient(e.to_string()))?;
    Ok(ack.id)
}

/// Sleep, returning true if shutdown fired first.
async fn pause(wait: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = sleep(wait) => false,
        _ = shutdown.changed() => true,
    }
}
