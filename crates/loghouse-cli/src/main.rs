//! Loghouse CLI
//!
//! ```bash
//! # start a node on localhost:8080 with data in ./data
//! loghouse node
//!
//! # read lines from stdin, write each as a message
//! seq 100 | loghouse produce --url http://localhost:8080/topics/test
//!
//! # consume to stdout, polling when the topic is drained
//! loghouse consume --url http://localhost:8080/topics/test/next
//!
//! # synthetic load; print the default config with --example
//! loghouse stress --example
//! loghouse stress --config load.json --duration 30
//! ```
//!
//! Unknown subcommands and bad flags exit with status 2 (clap's parse
//! error code); runtime failures exit 1.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use loghouse_server::{Node, NodeConfig};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "loghouse", about = "A lightweight partitioned commit-log service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a loghouse server node
    Node {
        /// Address to listen on
        #[arg(long, env = "LOGHOUSE_ADDR", default_value = "127.0.0.1:8080")]
        addr: String,
        /// Public URL of this node
        #[arg(long, env = "LOGHOUSE_URL", default_value = "http://localhost:8080")]
        url: String,
        /// Data directory
        #[arg(long, env = "LOGHOUSE_DATA", default_value = "./data")]
        path: String,
    },
    /// Read messages from stdin, one per line, write to a topic
    Produce {
        /// URL of the topic
        #[arg(long, default_value = "http://localhost:8080/topics/test")]
        url: String,
        /// Content-Type of the data
        #[arg(long = "content-type", default_value = "text/plain")]
        content_type: String,
    },
    /// Consume messages from a topic, write to stdout
    Consume {
        /// URL to consume from
        #[arg(long, default_value = "http://localhost:8080/topics/test/next")]
        url: String,
    },
    /// Run synthetic load against configured endpoints
    Stress {
        /// Path to a JSON config file; the default config when omitted
        #[arg(long)]
        config: Option<String>,
        /// Print the default config and exit
        #[arg(long)]
        example: bool,
        /// Run for this many seconds
        #[arg(long, default_value_t = 10)]
        duration: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Commands::Node { addr, url, path } => run_node(&addr, &url, &path).await,
        Commands::Produce { url, content_type } => run_produce(&url, &content_type).await,
        Commands::Consume { url } => run_consume(&url).await,
        Commands::Stress {
            config,
            example,
            duration,
        } => run_stress(config.as_deref(), example, Duration::from_secs(duration)).await,
    }
}

async fn run_node(addr: &str, url: &str, path: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    let node = Node::open(url, path, NodeConfig::default())
        .await
        .context("opening node")?;
    node.serve(listener).await.context("serving")?;
    Ok(())
}

async fn run_produce(url: &str, content_type: &str) -> Result<()> {
    let http = http_client()?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut sent = 0u64;
    while let Some(line) = lines.next_line().await? {
        let resp = http
            .post(url)
            .header("Content-Type", content_type)
            .body(line)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("({}) {}", status, body.trim_end());
        }
        sent += 1;
    }
    info!(sent, "done");
    Ok(())
}

async fn run_consume(url: &str) -> Result<()> {
    let http = http_client()?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            resp = http.get(url).send() => {
                let resp = resp?;
                match resp.status().as_u16() {
                    200 => {
                        let body = resp.bytes().await?;
                        println!("{}", String::from_utf8_lossy(&body));
                    }
                    204 => tokio::time::sleep(Duration::from_millis(100)).await,
                    status => {
                        let body = resp.text().await.unwrap_or_default();
                        bail!("({}) {}", status, body.trim_end());
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------
// stress

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProducerConf {
    url: String,
    msg_size_b: usize,
    write_sleep_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConsumerConf {
    url: String,
    read_sleep_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StressConf {
    producers: Vec<ProducerConf>,
    consumers: Vec<ConsumerConf>,
}

impl Default for StressConf {
    fn default() -> Self {
        StressConf {
            producers: vec![ProducerConf {
                url: "http://localhost:8080/topics/foo".to_string(),
                msg_size_b: 1024,
                write_sleep_ms: 10,
            }],
            consumers: vec![ConsumerConf {
                url: "http://localhost:8080/topics/foo/next?c=test".to_string(),
                read_sleep_ms: 10,
            }],
        }
    }
}

async fn run_stress(config: Option<&str>, example: bool, duration: Duration) -> Result<()> {
    if example {
        println!("{}", serde_json::to_string_pretty(&StressConf::default())?);
        return Ok(());
    }
    let conf = match config {
        Some(path) => {
            let data = std::fs::read(path).with_context(|| format!("reading {}", path))?;
            serde_json::from_slice(&data).context("parsing stress config")?
        }
        None => StressConf::default(),
    };

    let http = http_client()?;
    let mut tasks = Vec::new();
    for p in conf.producers {
        let http = http.clone();
        tasks.push(tokio::spawn(async move {
            let body = Bytes::from(vec![b'x'; p.msg_size_b]);
            loop {
                match http
                    .post(&p.url)
                    .header("Content-Type", "text/plain")
                    .body(body.clone())
                    .send()
                    .await
                {
                    Ok(resp) if resp.status().is_success() => {}
                    Ok(resp) => error!(url = %p.url, status = %resp.status(), "write failed"),
                    Err(e) => error!(url = %p.url, error = %e, "write failed"),
                }
                tokio::time::sleep(Duration::from_millis(p.write_sleep_ms)).await;
            }
        }));
    }
    for c in conf.consumers {
        let http = http.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                match http.get(&c.url).send().await {
                    Ok(resp) if resp.status().as_u16() == 200 || resp.status().as_u16() == 204 => {}
                    Ok(resp) => error!(url = %c.url, status = %resp.status(), "read failed"),
                    Err(e) => error!(url = %c.url, error = %e, "read failed"),
                }
                tokio::time::sleep(Duration::from_millis(c.read_sleep_ms)).await;
            }
        }));
    }

    info!(secs = duration.as_secs(), "running");
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = tokio::signal::ctrl_c() => {}
    }
    for t in &tasks {
        t.abort();
    }
    info!("exit");
    Ok(())
}

fn http_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn test_node_defaults() {
        let cli = Cli::try_parse_from(["loghouse", "node"]).unwrap();
        match cli.command {
            Commands::Node { addr, url, path } => {
                assert_eq!(addr, "127.0.0.1:8080");
                assert_eq!(url, "http://localhost:8080");
                assert_eq!(path, "./data");
            }
            _ => panic!("expected node"),
        }
    }

    #[test]
    fn test_produce_flags() {
        let cli = Cli::try_parse_from([
            "loghouse",
            "produce",
            "--url",
            "http://h:1/topics/t",
            "--content-type",
            "application/json",
        ])
        .unwrap();
        match cli.command {
            Commands::Produce { url, content_type } => {
                assert_eq!(url, "http://h:1/topics/t");
                assert_eq!(content_type, "application/json");
            }
            _ => panic!("expected produce"),
        }
    }

    #[test]
    fn test_consume_default_url() {
        let cli = Cli::try_parse_from(["loghouse", "consume"]).unwrap();
        match cli.command {
            Commands::Consume { url } => {
                assert_eq!(url, "http://localhost:8080/topics/test/next");
            }
            _ => panic!("expected consume"),
        }
    }

    #[test]
    fn test_stress_flags() {
        let cli =
            Cli::try_parse_from(["loghouse", "stress", "--duration", "30", "--example"]).unwrap();
        match cli.command {
            Commands::Stress {
                config,
                example,
                duration,
            } => {
                assert!(config.is_none());
                assert!(example);
                assert_eq!(duration, 30);
            }
            _ => panic!("expected stress"),
        }
    }

    #[test]
    fn test_unknown_subcommand_is_a_usage_error() {
        let err = Cli::try_parse_from(["loghouse", "bogus"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSubcommand);
        // clap's usage errors exit with status 2
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_stress_conf_roundtrip() {
        let conf = StressConf::default();
        assert_eq!(conf.producers.len(), 1);
        assert_eq!(conf.consumers.len(), 1);
        assert_eq!(conf.producers[0].msg_size_b, 1024);

        let json = serde_json::to_string_pretty(&conf).unwrap();
        let back: StressConf = serde_json::from_str(&json).unwrap();
        assert_eq!(back.producers[0].url, conf.producers[0].url);
        assert_eq!(back.consumers[0].read_sleep_ms, 10);
    }
}
