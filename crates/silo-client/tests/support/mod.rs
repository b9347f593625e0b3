//! In-process cluster harness: one in-memory server per configured
//! endpoint, real TCP in between.

// Each test binary compiles its own copy and uses a different subset.
#![allow(dead_code)]

use silo_client::{Client, Configuration};
use silo_server::Server;
use tokio::net::TcpListener;

static TRACING: std::sync::Once = std::sync::Once::new();

/// Honor `RUST_LOG` when debugging a test run.
fn init_tracing() {
    TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init()
            .ok();
    });
}

/// Bind `count` in-memory servers on ephemeral ports, each with its own
/// storage, and return their `host:port` endpoints.
pub async fn spawn_servers(count: usize) -> Vec<String> {
    init_tracing();

    let mut endpoints = Vec::with_capacity(count);
    for _ in 0..count {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        endpoints.push(listener.local_addr().unwrap().to_string());
        tokio::spawn(Server::memory().serve(listener));
    }
    endpoints
}

/// A cluster with separate object/kv/db server sets.
pub async fn cluster(objects: usize, kvs: usize, dbs: usize) -> Client {
    let config = cluster_config(objects, kvs, dbs).await;
    Client::new(config).unwrap()
}

pub async fn cluster_config(objects: usize, kvs: usize, dbs: usize) -> Configuration {
    Configuration::new(
        spawn_servers(objects).await,
        spawn_servers(kvs).await,
        spawn_servers(dbs).await,
    )
    .unwrap()
}
