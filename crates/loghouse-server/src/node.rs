//! Node - Tenant Host and HTTP Server
//!
//! A node hosts one or more tenants, discovered from `<path>/tenants/`
//! on startup, always including the default tenant `-`. The default
//! tenant's client façade is mounted at the server root as well as under
//! its tenant base, so `POST /topics/foo` works out of the box.
//!
//! Startup order matters: the worker registers with the controller over
//! HTTP through this very server, so the listener must be accepting
//! before the tenants start. `serve` binds first, spawns the server,
//! then runs registration, and fails loudly if it doesn't go through.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use loghouse_core::{name, BufferConfig};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

use crate::controller::ControllerConfig;
use crate::error::Result;
use crate::shutdown::shutdown_signal;
use crate::tenant::Tenant;

/// The default tenant, whose client façade also answers at the root.
pub const DEFAULT_TENANT: &str = "-";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
}

pub struct Node {
    url: String,
    #[allow(dead_code)]
    path: PathBuf,
    tenants: HashMap<String, Arc<Tenant>>,
}

impl Node {
    /// Open the node: load every tenant directory plus the default
    /// tenant. The tenant set is fixed for the lifetime of the process.
    pub async fn open(url: impl Into<String>, path: impl Into<PathBuf>, config: NodeConfig) -> Result<Node> {
        let url = url.into();
        let path = path.into();

        let mut ids = vec![DEFAULT_TENANT.to_string()];
        match tokio::fs::read_dir(path.join("tenants")).await {
            Ok(mut entries) => {
                while let Some(entry) = entries.next_entry().await? {
                    let id = entry.file_name().to_string_lossy().into_owned();
                    if id != DEFAULT_TENANT && name::is_valid_name(&id) {
                        ids.push(id);
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        ids.sort();
        ids.dedup();

        let mut tenants = HashMap::new();
        for id in ids {
            let tenant = Tenant::open(&url, &path, &id, &config).await?;
            tenants.insert(id, Arc::new(tenant));
        }
        info!(url = %url, tenants = tenants.len(), "node opened");
        Ok(Node { url, path, tenants })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn tenant(&self, id: &str) -> Option<&Arc<Tenant>> {
        self.tenants.get(id)
    }

    /// The node's full route table.
    pub fn router(&self) -> Router {
        let ids: Vec<String> = {
            let mut ids: Vec<String> = self.tenants.keys().cloned().collect();
            ids.sort();
            ids
        };
        let mut app = Router::new().route(
            "/",
            get(move || {
                let ids = ids.clone();
                async move { Json(serde_json::json!({ "tenants": ids })) }
            }),
        );
        for (id, tenant) in &self.tenants {
            app = app.nest(&format!("/tenants/{}", id), tenant.router());
            if id == DEFAULT_TENANT {
                app = app.merge(tenant.facade_router());
            }
        }
        app
    }

    /// Register every tenant's worker and start reconciliation. Run only
    /// once the listener is accepting connections.
    pub async fn start(&self) -> Result<()> {
        for tenant in self.tenants.values() {
            tenant.start().await?;
        }
        Ok(())
    }

    /// Stop every tenant, persisting buffer and controller state.
    pub async fn stop(&self) {
        for tenant in self.tenants.values() {
            tenant.stop().await;
        }
        info!("node stopped");
    }

    /// Serve until SIGINT/SIGTERM, then stop the tenants.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        self.serve_with_shutdown(listener, shutdown_signal()).await
    }

    /// Serve until `signal` resolves; used directly by tests.
    pub async fn serve_with_shutdown<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        let server = axum::serve(listener, app).with_graceful_shutdown(signal);
        let handle = tokio::spawn(async move { server.await });

        // the server is accepting; registration can go through it now
        if let Err(e) = self.start().await {
            self.stop().await;
            return Err(e);
        }
        info!(url = %self.url, "node serving");

        let result = handle.await.expect("server task panicked");
        self.stop().await;
        result?;
        Ok(())
    }
}
