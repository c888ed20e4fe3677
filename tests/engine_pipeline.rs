// tests/engine_pipeline.rs
//
// Full ingestion pipeline over a real socket: framed batch in, admission,
// drain into ordering, certification, block sealing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;

use txflow::auth::AuthConfig;
use txflow::config::{EngineConfig, NetworkConfig};
use txflow::crypto::Sha256Kernel;
use txflow::engine::Engine;
use txflow::framing::{read_frame, write_frame};
use txflow::types::unix_secs;

fn test_config(block_size: usize, batch_timeout_ms: u64) -> EngineConfig {
    EngineConfig {
        bind: "127.0.0.1:0".to_string(),
        admin_bind: "127.0.0.1:0".to_string(),
        auth: AuthConfig::disabled(),
        workers: 2,
        mempool_max: 1000,
        block_size,
        batch_timeout: Duration::from_millis(batch_timeout_ms),
        network: NetworkConfig {
            node_id: "pipeline-test".to_string(),
            bind: None,
            seed_peers: Vec::new(),
        },
    }
}

fn batch_body(n: usize, tag: &str) -> String {
    let now = unix_secs();
    let rows: Vec<String> = (0..n)
        .map(|i| {
            format!(
                r#"{{"entity_id":"{tag}-{i}","event":"created","timestamp":{now}}}"#
            )
        })
        .collect();
    format!("[{}]", rows.join(","))
}

async fn wait_for_height(engine: &Arc<Engine>, height: u64, deadline: Duration) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if engine.status().chain_height >= height {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn batch_flows_to_sealed_block() {
    let engine = Engine::new(test_config(3, 100), Arc::new(Sha256Kernel));
    engine.start().await.unwrap();
    let addr = engine.ingest_addr().await.expect("ingest bound");

    let mut conn = TcpStream::connect(addr).await.unwrap();
    write_frame(&mut conn, batch_body(3, "flow").as_bytes())
        .await
        .unwrap();
    let response = read_frame(&mut conn).await.unwrap();
    assert_eq!(response, b"OK");

    assert!(
        wait_for_height(&engine, 1, Duration::from_secs(3)).await,
        "block never sealed"
    );

    let status = engine.status();
    assert_eq!(status.engine.txs_admitted, 3);
    assert_eq!(status.ordering.events_certified, 3);
    assert!(status.engine.blocks_sealed >= 1);
    assert_eq!(status.chain_tip.len(), 64);
    assert_ne!(status.chain_tip, "0".repeat(64));

    engine.stop().await;
}

#[tokio::test]
async fn partial_batch_seals_on_timeout() {
    let engine = Engine::new(test_config(100, 80), Arc::new(Sha256Kernel));
    engine.start().await.unwrap();
    let addr = engine.ingest_addr().await.unwrap();

    let mut conn = TcpStream::connect(addr).await.unwrap();
    write_frame(&mut conn, batch_body(2, "partial").as_bytes())
        .await
        .unwrap();
    assert_eq!(read_frame(&mut conn).await.unwrap(), b"OK");

    assert!(
        wait_for_height(&engine, 1, Duration::from_secs(3)).await,
        "timeout block never sealed"
    );
    let status = engine.status();
    assert_eq!(status.mempool.size, 0);
    assert_eq!(status.ordering.events_certified, 2);

    engine.stop().await;
}

#[tokio::test]
async fn successive_blocks_chain_tips() {
    let engine = Engine::new(test_config(2, 60), Arc::new(Sha256Kernel));
    engine.start().await.unwrap();
    let addr = engine.ingest_addr().await.unwrap();

    let mut conn = TcpStream::connect(addr).await.unwrap();
    write_frame(&mut conn, batch_body(2, "one").as_bytes()).await.unwrap();
    assert_eq!(read_frame(&mut conn).await.unwrap(), b"OK");
    assert!(wait_for_height(&engine, 1, Duration::from_secs(3)).await);
    let first_tip = engine.status().chain_tip.clone();

    write_frame(&mut conn, batch_body(2, "two").as_bytes()).await.unwrap();
    assert_eq!(read_frame(&mut conn).await.unwrap(), b"OK");
    assert!(wait_for_height(&engine, 2, Duration::from_secs(3)).await);
    let second_tip = engine.status().chain_tip.clone();

    assert_ne!(first_tip, second_tip);
    assert_eq!(engine.status().chain_height, 2);

    engine.stop().await;
}

#[tokio::test]
async fn invalid_rows_reported_in_batch_result() {
    let engine = Engine::new(test_config(10, 500), Arc::new(Sha256Kernel));
    engine.start().await.unwrap();
    let addr = engine.ingest_addr().await.unwrap();

    let now = unix_secs();
    let body = format!(
        r#"[{{"entity_id":"good","event":"created","timestamp":{now}}},{{"event":"created","timestamp":{now}}}]"#
    );

    let mut conn = TcpStream::connect(addr).await.unwrap();
    write_frame(&mut conn, body.as_bytes()).await.unwrap();
    let response = read_frame(&mut conn).await.unwrap();

    let parsed: serde_json::Value = serde_json::from_slice(&response).unwrap();
    assert_eq!(parsed["success"], false);
    assert!(parsed["message"]
        .as_str()
        .unwrap()
        .starts_with("Processed 1/2"));
    assert_eq!(parsed["errors"][0]["error_code"], "invalid_transaction");

    engine.stop().await;
}
