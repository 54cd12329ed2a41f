//! Client Façade Routes
//!
//! The topic-level HTTP surface producers and consumers talk to. These
//! handlers delegate to [`loghouse_client::Client`], which routes each
//! request to some buffer of the topic; the façade itself holds no state
//! beyond the client's metadata cache.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use loghouse_client::Client;

use crate::error::ApiError;

/// Routes mounted at a tenant's base (and at the server root for the
/// default tenant).
pub fn router(client: Arc<Client>) -> Router {
    Router::new()
        .route("/topics", get(list_topics))
        .route("/topics/:topic", post(write_to_topic).delete(delete_topic))
        .route("/topics/:topic/next", get(consume_from_topic).post(consume_from_topic))
        .with_state(client)
}

async fn list_topics(
    State(client): State<Arc<Client>>,
) -> std::result::Result<Json<Vec<String>>, ApiError> {
    Ok(Json(client.topics().await?))
}

async fn write_to_topic(
    State(client): State<Arc<Client>>,
    Path(topic): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> std::result::Result<StatusCode, ApiError> {
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    client.produce(&topic, content_type, body).await?;
    Ok(StatusCode::OK)
}

async fn consume_from_topic(
    State(client): State<Arc<Client>>,
    Path(topic): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> std::result::Result<Response, ApiError> {
    let consumer = params.get("c").map(String::as_str).unwrap_or("-");
    match client.consume(&topic, consumer).await? {
        Some(m) => Ok(([("content-type", m.content_type)], m.body).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

async fn delete_topic(
    State(client): State<Arc<Client>>,
    Path(topic): Path<String>,
) -> std::result::Result<StatusCode, ApiError> {
    client.delete_topic(&topic).await?;
    Ok(StatusCode::OK)
}
