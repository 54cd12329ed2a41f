//! Tenant - One Controller, One Worker, One Client
//!
//! A tenant is the unit of isolation on a node: its controller, worker
//! and client façade share nothing with other tenants. The pieces talk
//! to each other over the node's own HTTP surface, which keeps the
//! composition honest - a worker could just as well live in another
//! process.
//!
//! Mount layout under the tenant base (`/tenants/{id}`):
//!
//! ```text
//! {base}/manager/...   controller
//! {base}/worker/...    worker
//! {base}/topics...     client façade
//! ```

use std::path::Path;
use std::sync::Arc;

use axum::Router;
use loghouse_client::Client;
use loghouse_core::name;
use tracing::info;

use crate::controller::{Controller, ControllerOptions};
use crate::error::Result;
use crate::facade;
use crate::node::NodeConfig;
use crate::worker::{Worker, WorkerOptions};

pub struct Tenant {
    pub id: String,
    pub controller: Arc<Controller>,
    pub worker: Arc<Worker>,
    pub client: Arc<Client>,
}

impl Tenant {
    /// Open the tenant's components. Nothing registers yet - that waits
    /// for [`Tenant::start`], once the node's listener is accepting.
    pub async fn open(
        node_url: &str,
        node_path: &Path,
        id: &str,
        config: &NodeConfig,
    ) -> Result<Tenant> {
        let base_url = format!("{}/tenants/{}", node_url, id);
        let base_path = node_path.join("tenants").join(id);

        let controller = Controller::open(ControllerOptions {
            id: name::uid(),
            url: format!("{}/manager", base_url),
            path: base_path.join("manager"),
            config: config.controller.clone(),
        })
        .await?;

        let worker = Worker::open(WorkerOptions {
            id: name::uid(),
            url: format!("{}/worker", base_url),
            controller_url: controller.url().to_string(),
            path: base_path.join("worker"),
            config: config.buffer.clone(),
        })
        .await?;

        let client = Arc::new(Client::new(controller.url()));

        info!(tenant = %id, "tenant opened");
        Ok(Tenant {
            id: id.to_string(),
            controller,
            worker,
            client,
        })
    }

    /// Register the worker with the controller and start the
    /// controller's replica reconciliation. Must run only after the
    /// node's HTTP server is listening: registration goes through it.
    pub async fn start(&self) -> Result<()> {
        self.worker.register().await?;
        self.controller.start().await;
        Ok(())
    }

    /// The tenant's routes, to be nested at its base path.
    pub fn router(&self) -> Router {
        Router::new()
            .nest("/manager", self.controller.clone().router())
            .nest("/worker", self.worker.clone().router())
            .merge(facade::router(self.client.clone()))
    }

    /// Routes for mounting the client façade a second time, at the
    /// server root, for the default tenant.
    pub fn facade_router(&self) -> Router {
        facade::router(self.client.clone())
    }

    /// Stop the worker's buffers, then persist the controller state.
    pub async fn stop(&self) {
        self.worker.stop().await;
        self.controller.stop().await;
        info!(tenant = %self.id, "tenant stopped");
    }
}
