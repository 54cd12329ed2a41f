//! End-to-end tests driving a whole node over HTTP: topic provisioning,
//! produce/consume through the façade, replication between real buffers,
//! restart recovery and the error-to-status mapping.

use std::time::Duration;

use loghouse_core::BufferConfig;
use loghouse_server::{ControllerConfig, Node, NodeConfig};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct TestNode {
    url: String,
    shutdown: oneshot::Sender<()>,
    served: JoinHandle<loghouse_server::Result<()>>,
}

impl TestNode {
    async fn start(path: &std::path::Path, config: NodeConfig) -> TestNode {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let node = Node::open(url.clone(), path, config).await.unwrap();
        let (shutdown, rx) = oneshot::channel::<()>();
        let served = tokio::spawn(node.serve_with_shutdown(listener, async move {
            rx.await.ok();
        }));

        // ready once the worker has registered with the controller
        let http = reqwest::Client::new();
        for _ in 0..200 {
            if let Ok(resp) = http
                .get(format!("{}/tenants/-/manager/workers", url))
                .send()
                .await
            {
                if resp.status().is_success() {
                    let workers: Value = resp.json().await.unwrap_or(Value::Null);
                    if workers.as_object().map(|m| !m.is_empty()).unwrap_or(false) {
                        return TestNode {
                            url,
                            shutdown,
                            served,
                        };
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("node never became ready");
    }

    async fn stop(self) {
        let _ = self.shutdown.send(());
        self.served.await.unwrap().unwrap();
    }
}

fn small_config(primaries: usize, replicas: usize) -> NodeConfig {
    NodeConfig {
        buffer: BufferConfig::default(),
        controller: ControllerConfig {
            primary_count: primaries,
            replica_count: replicas,
        },
    }
}

fn http() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_topic_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let node = TestNode::start(dir.path(), small_config(2, 0)).await;
    let http = http();
    let manager = format!("{}/tenants/-/manager", node.url);

    // create
    let resp = http.post(format!("{}/topics/orders", manager)).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 201);
    let topic: Value = resp.json().await.unwrap();
    assert_eq!(topic["id"], "orders");
    assert_eq!(topic["buffers"].as_array().unwrap().len(), 2);

    // conflict on re-create
    let resp = http.post(format!("{}/topics/orders", manager)).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 409);

    // get
    let resp = http.get(format!("{}/topics/orders", manager)).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    // unknown
    let resp = http.get(format!("{}/topics/nope", manager)).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 404);

    // invalid names are rejected before touching the catalog
    let resp = http.post(format!("{}/topics/bad.name", manager)).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    // the façade lists it
    let resp = http.get(format!("{}/topics", node.url)).send().await.unwrap();
    let topics: Vec<String> = resp.json().await.unwrap();
    assert_eq!(topics, vec!["orders".to_string()]);

    // delete, then the catalog forgets it
    let resp = http.delete(format!("{}/topics/orders", manager)).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let resp = http.get(format!("{}/topics/orders", manager)).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 404);

    node.stop().await;
}

#[tokio::test]
async fn test_produce_consume_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let node = TestNode::start(dir.path(), small_config(1, 0)).await;
    let http = http();

    // writing creates the topic on first use
    let resp = http
        .post(format!("{}/topics/greetings", node.url))
        .header("Content-Type", "text/plain")
        .body("bar")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    let resp = http
        .get(format!("{}/topics/greetings/next", node.url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.headers()["content-type"], "text/plain");
    assert_eq!(resp.text().await.unwrap(), "bar");

    // drained
    let resp = http
        .get(format!("{}/topics/greetings/next", node.url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 204);

    // a different consumer group starts over
    let resp = http
        .get(format!("{}/topics/greetings/next?c=other", node.url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.text().await.unwrap(), "bar");

    node.stop().await;
}

#[tokio::test]
async fn test_parallel_producers_and_consumers() {
    let dir = tempfile::tempdir().unwrap();
    let node = TestNode::start(dir.path(), small_config(3, 0)).await;
    let http = http();

    // topic up front so producers don't race its creation
    let resp = http
        .post(format!("{}/tenants/-/manager/topics/load", node.url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 201);

    const PRODUCERS: usize = 5;
    const PER_PRODUCER: usize = 40;
    const TOTAL: usize = PRODUCERS * PER_PRODUCER;

    let mut producers = Vec::new();
    for _ in 0..PRODUCERS {
        let http = http.clone();
        let url = format!("{}/topics/load", node.url);
        producers.push(tokio::spawn(async move {
            for _ in 0..PER_PRODUCER {
                let resp = http
                    .post(&url)
                    .header("Content-Type", "text/plain")
                    .body("bar")
                    .send()
                    .await
                    .unwrap();
                assert_eq!(resp.status().as_u16(), 200);
            }
        }));
    }
    futures::future::try_join_all(producers).await.unwrap();

    let mut consumers = Vec::new();
    for _ in 0..5 {
        let http = http.clone();
        let url = format!("{}/topics/load/next", node.url);
        consumers.push(tokio::spawn(async move {
            let mut got = 0usize;
            let mut empty_streak = 0usize;
            // shared consumer group: stop after the topic stays drained
            while empty_streak < 5 {
                let resp = http.get(&url).send().await.unwrap();
                match resp.status().as_u16() {
                    200 => {
                        assert_eq!(resp.text().await.unwrap(), "bar");
                        got += 1;
                        empty_streak = 0;
                    }
                    204 => {
                        empty_streak += 1;
                        tokio::time::sleep(Duration::from_millis(20)).await;
                    }
                    other => panic!("unexpected status {}", other),
                }
            }
            got
        }));
    }
    let counts = futures::future::try_join_all(consumers).await.unwrap();
    let consumed: usize = counts.iter().sum();
    assert_eq!(consumed, TOTAL, "every message read exactly once: {:?}", counts);

    node.stop().await;
}

#[tokio::test]
async fn test_replication_across_buffers() {
    let dir = tempfile::tempdir().unwrap();
    let node = TestNode::start(dir.path(), small_config(1, 2)).await;
    let http = http();
    let manager = format!("{}/tenants/-/manager", node.url);

    let resp = http.post(format!("{}/topics/mirrored", manager)).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 201);
    let topic: Value = resp.json().await.unwrap();
    let primary = topic["buffers"][0].as_str().unwrap().to_string();

    for i in 0..7 {
        let resp = http
            .post(format!("{}/topics/mirrored", node.url))
            .header("Content-Type", "text/plain")
            .body(format!("m{}", i))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
    }

    // eventually both replica buffers hold everything the primary does
    let worker = format!("{}/tenants/-/worker", node.url);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let buffers: Value = http
            .get(format!("{}/buffers", worker))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let map = buffers.as_object().unwrap();
        let primary_len = map[&primary]["len"].as_u64().unwrap();
        let caught_up = map
            .iter()
            .filter(|(id, _)| **id != primary)
            .all(|(_, meta)| meta["len"].as_u64().unwrap() == primary_len);
        if primary_len == 7 && caught_up && map.len() == 3 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "replicas never caught up: {}",
            buffers
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    node.stop().await;
}

#[tokio::test]
async fn test_restart_recovers_topics_and_messages() {
    let dir = tempfile::tempdir().unwrap();

    let node = TestNode::start(dir.path(), small_config(1, 0)).await;
    let http = http();
    let resp = http
        .post(format!("{}/topics/durable", node.url))
        .header("Content-Type", "text/plain")
        .body("survives")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    node.stop().await;

    // same directory, fresh process (and port)
    let node = TestNode::start(dir.path(), small_config(1, 0)).await;

    // the controller remembers the topic
    let resp = http
        .get(format!("{}/tenants/-/manager/topics/durable", node.url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    // and the message is still there for a fresh consumer group
    let resp = http
        .get(format!("{}/topics/durable/next?c=after-restart", node.url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.text().await.unwrap(), "survives");

    node.stop().await;
}

#[tokio::test]
async fn test_error_status_mapping() {
    let dir = tempfile::tempdir().unwrap();
    let node = TestNode::start(dir.path(), small_config(1, 0)).await;
    let http = http();
    let worker = format!("{}/tenants/-/worker", node.url);

    // unknown buffer -> 404
    let resp = http
        .post(format!("{}/buffers/0123456789abcdef", worker))
        .body("x")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);

    // create a real buffer straight on the worker
    let resp = http.post(format!("{}/buffers", worker)).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 201);
    let meta: Value = resp.json().await.unwrap();
    let id = meta["id"].as_str().unwrap().to_string();

    // replication id must equal the buffer's next id
    let resp = http
        .post(format!("{}/buffers/{}", worker, id))
        .header("Hbuf-Id", "5")
        .body("x")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    let resp = http
        .post(format!("{}/buffers/{}", worker, id))
        .header("Hbuf-Id", "not-a-number")
        .body("x")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    // the matching id is accepted and echoed back
    let resp = http
        .post(format!("{}/buffers/{}", worker, id))
        .header("Hbuf-Id", "0")
        .header("Hbuf-Ts", "2023-05-01T12:00:00.000000001Z")
        .header("Content-Type", "text/plain")
        .body("x")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let ack: Value = resp.json().await.unwrap();
    assert_eq!(ack["id"], 0);
    assert_eq!(ack["ts"], "2023-05-01T12:00:00.000000001Z");

    // consuming an empty cursor position -> 204
    let resp = http
        .post(format!("{}/buffers/{}/consumers/g/_next", worker, id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let resp = http
        .post(format!("{}/buffers/{}/consumers/g/_next", worker, id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 204);

    // consumer cursors are visible
    let resp = http
        .get(format!("{}/buffers/{}/consumers", worker, id))
        .send()
        .await
        .unwrap();
    let cursors: Value = resp.json().await.unwrap();
    assert_eq!(cursors["g"]["n"], 1);

    // bad consumer name -> 400
    let resp = http
        .post(format!("{}/buffers/{}/consumers/bad.name/_next", worker, id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    node.stop().await;
}
