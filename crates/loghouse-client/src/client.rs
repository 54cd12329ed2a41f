//! Producer/Consumer Routing
//!
//! ## Metadata Cache
//!
//! The client refreshes its `topics` and `buffers` maps by polling the
//! controller. Produce refreshes lazily (only when the target topic is
//! unknown, after auto-creating it); consume refreshes on every call so a
//! newly provisioned buffer is picked up immediately. The per-consume
//! refresh is a known hotspot.
//! TODO: refresh consume metadata on a background interval instead of
//! per request.
//!
//! ## Spreading Load
//!
//! Both paths start at a random index into the candidate buffer list and
//! rotate through the rest, so independent clients don't converge on the
//! same buffer. Across a topic's buffers there is no ordering guarantee;
//! within one buffer, ids are strictly ordered.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use loghouse_core::name;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicInfo {
    pub id: String,
    pub buffers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferInfo {
    pub id: String,
    pub url: String,
}

/// One consumed message: its content type and raw body.
#[derive(Debug, Clone, PartialEq)]
pub struct Consumed {
    pub content_type: String,
    pub body: Bytes,
}

#[derive(Default)]
struct Cache {
    topics: HashMap<String, TopicInfo>,
    buffers: HashMap<String, BufferInfo>,
}

pub struct Client {
    controller_url: String,
    http: reqwest::Client,
    cache: Mutex<Cache>,
}

impl Client {
    pub fn new(controller_url: impl Into<String>) -> Client {
        Client {
            controller_url: controller_url.into(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("reqwest client"),
            cache: Mutex::new(Cache::default()),
        }
    }

    /// Pull fresh topic and buffer maps from the controller.
    pub async fn refresh_metadata(&self) -> Result<()> {
        let topics: HashMap<String, TopicInfo> = self.fetch("/topics").await?;
        let buffers: HashMap<String, BufferInfo> = self.fetch("/buffers").await?;
        let mut cache = self.cache.lock().await;
        cache.topics = topics;
        cache.buffers = buffers;
        Ok(())
    }

    async fn fetch<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self
            .http
            .get(format!("{}{}", self.controller_url, path))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::Controller(format!(
                "GET {} returned {}",
                path,
                resp.status()
            )));
        }
        Ok(resp.json().await?)
    }

    /// Topic names currently known to the controller.
    pub async fn topics(&self) -> Result<Vec<String>> {
        self.refresh_metadata().await?;
        let cache = self.cache.lock().await;
        let mut names: Vec<String> = cache.topics.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    /// Create a topic; an already existing topic is fine.
    pub async fn create_topic(&self, topic: &str) -> Result<()> {
        name::validate_name(topic).map_err(|_| Error::InvalidName(topic.to_string()))?;
        let resp = self
            .http
            .post(format!("{}/topics/{}", self.controller_url, topic))
            .send()
            .await?;
        match resp.status().as_u16() {
            201 | 409 => Ok(()),
            status => Err(Error::Controller(format!(
                "create topic {:?} returned {}",
                topic, status
            ))),
        }
    }

    /// Delete a topic and its buffers.
    pub async fn delete_topic(&self, topic: &str) -> Result<()> {
        name::validate_name(topic).map_err(|_| Error::InvalidName(topic.to_string()))?;
        let resp = self
            .http
            .delete(format!("{}/topics/{}", self.controller_url, topic))
            .send()
            .await?;
        if resp.status().as_u16() != 200 {
            return Err(Error::Controller(format!(
                "delete topic {:?} returned {}",
                topic,
                resp.status()
            )));
        }
        Ok(())
    }

    /// Write one message to the topic, creating the topic on first use.
    /// Tries each of the topic's buffers from a random starting point;
    /// the first acceptance wins.
    pub async fn produce(&self, topic: &str, content_type: &str, body: Bytes) -> Result<()> {
        name::validate_name(topic).map_err(|_| Error::InvalidName(topic.to_string()))?;

        let known = self.cache.lock().await.topics.contains_key(topic);
        if !known {
            self.create_topic(topic).await?;
            self.refresh_metadata().await?;
        }
        let buffers = {
            let cache = self.cache.lock().await;
            if !cache.topics.contains_key(topic) {
                return Err(Error::NoBuffers(topic.to_string()));
            }
            resolve(&cache, &[topic.to_string()])
        };
        if buffers.is_empty() {
            return Err(Error::NoBuffers(topic.to_string()));
        }

        let start = rand::thread_rng().gen_range(0..buffers.len());
        let mut last = String::from("no buffer tried");
        for i in 0..buffers.len() {
            let b = &buffers[(start + i) % buffers.len()];
            match self
                .http
                .post(&b.url)
                .header("Content-Type", content_type)
                .body(body.clone())
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => {
                    last = format!("buffer {} returned {}", b.id, resp.status());
                    debug!(topic, buffer = %b.id, status = %resp.status(), "write rejected");
                }
                Err(e) => {
                    last = e.to_string();
                    debug!(topic, buffer = %b.id, error = %last, "write failed");
                }
            }
        }
        Err(Error::WriteFailed {
            topic: topic.to_string(),
            last,
        })
    }

    /// Read the next message for `consumer` from any buffer of the named
    /// topics (comma-separated). `Ok(None)` when every buffer is empty.
    pub async fn consume(&self, topics: &str, consumer: &str) -> Result<Option<Consumed>> {
        let names: Vec<&str> = topics.split(',').collect();
        for t in &names {
            name::validate_name(t).map_err(|_| Error::InvalidName(t.to_string()))?;
        }
        name::validate_name(consumer).map_err(|_| Error::InvalidName(consumer.to_string()))?;

        // a fresh view on every consume keeps newly provisioned buffers
        // visible; see the module docs about the cost
        self.refresh_metadata().await?;
        let buffers = {
            let cache = self.cache.lock().await;
            let topic_ids: Vec<String> = names.iter().map(|s| s.to_string()).collect();
            resolve(&cache, &topic_ids)
        };
        if buffers.is_empty() {
            return Ok(None);
        }

        let start = rand::thread_rng().gen_range(0..buffers.len());
        for i in 0..buffers.len() {
            let b = &buffers[(start + i) % buffers.len()];
            let url = format!("{}/consumers/{}/_next", b.url, consumer);
            let resp = self.http.post(&url).send().await?;
            if resp.status().is_success() && resp.status().as_u16() != 204 {
                let content_type = resp
                    .headers()
                    .get("content-type")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let body = resp.bytes().await?;
                return Ok(Some(Consumed { content_type, body }));
            }
        }
        Ok(None)
    }
}

/// Buffer infos for the named topics, in topic order, skipping ids the
/// buffer map doesn't know yet.
fn resolve(cache: &Cache, topic_ids: &[String]) -> Vec<BufferInfo> {
    let mut out = Vec::new();
    for id in topic_ids {
        if let Some(t) = cache.topics.get(id) {
            for b in &t.buffers {
                if let Some(info) = cache.buffers.get(b) {
                    out.push(info.clone());
                }
            }
        }
    }
    out
}
