//! shardstate-wordcount: demo topology over the state adapter.
//!
//! A cycling spout emits the same four words every batch. Each batch is
//! persisted through a `BatchUpdater` and then looked up again through a
//! `BatchQuerier`, logging one `(word, columnName, columnValue)` line per
//! lookup.
//!
//! Usage: `shardstate-wordcount [config.yaml] [host:port,...] [batches]`.
//! `batches = 0` runs until Ctrl+C.

use shardstate_common::{BatchId, PartitionId};
use shardstate_config::{Backend, StateConfig};
use shardstate_net::RedisNodeClient;
use shardstate_router::{MemCluster, NodeClient};
use shardstate_state::{Batch, Record, StateFactory};
use std::sync::Arc;
use tokio::time::Duration;

const DEFAULT_CONFIG: &str = r#"
nodes: "127.0.0.1:6379"
key_prefix: "test_"
ttl_ms: 86400000
combiner: sum
schema:
  key_field: word
  value_fields: [count]
"#;

const WORDS: [&str; 4] = ["storm", "trident", "needs", "javadoc"];

fn spout_batch(id: u64) -> Batch {
    Batch::new(
        BatchId(id),
        WORDS
            .iter()
            .map(|w| Record::new().with("word", w).with("count", 1))
            .collect(),
    )
}

async fn run<C: NodeClient>(
    config: StateConfig,
    client: Arc<C>,
    batches: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let factory = StateFactory::new(config, client)?;
    let updater = factory.make_updater().await?;
    let querier = factory.make_querier().await?;
    let lookups: Vec<Record> = WORDS
        .iter()
        .map(|w| Record::new().with("word", w))
        .collect();

    let partition = PartitionId(0);
    let mut id = 1u64;
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    loop {
        if batches > 0 && id > batches {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received Ctrl+C, shutting down");
                break;
            }
        }

        let batch = spout_batch(id);
        match updater.update(partition, &batch).await {
            Ok(outcome) => tracing::info!(batch = %batch.id, ?outcome, "batch persisted"),
            Err(e) if e.is_replayable() => {
                // Replay the same batch id on the next tick.
                tracing::warn!(batch = %batch.id, "batch failed, replaying: {}", e);
                continue;
            }
            Err(e) => {
                factory.shutdown().await;
                return Err(e.into());
            }
        }

        match querier.query_columns(&lookups).await {
            Ok(columns) => {
                for (word, column) in WORDS.iter().zip(columns) {
                    tracing::info!(
                        "word={} columnName={} columnValue={}",
                        word,
                        column.name,
                        column.value.as_deref().unwrap_or("null")
                    );
                }
            }
            Err(e) => tracing::warn!("query failed: {}", e),
        }
        id += 1;
    }

    factory.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    shardstate_metrics::init_tracing();

    let mut args = std::env::args().skip(1);
    let config_path = args.next();
    let nodes_override = args.next();
    let batches: u64 = match args.next() {
        Some(n) => n.parse()?,
        None => 10,
    };

    let mut config = match config_path {
        Some(path) => shardstate_config::load_from_file(std::path::Path::new(&path))?,
        None => {
            tracing::info!("no config given, using built-in defaults");
            shardstate_config::load_from_str(DEFAULT_CONFIG)?
        }
    };
    if let Some(nodes) = nodes_override {
        config.nodes = nodes;
    }

    if let Some(metrics_port) = config.metrics_port {
        let metrics_addr = std::net::SocketAddr::from(([0, 0, 0, 0], metrics_port));
        tokio::spawn(async move {
            if let Err(e) = shardstate_metrics::serve_metrics(metrics_addr).await {
                tracing::warn!("metrics server failed: {}", e);
            }
        });
    }

    tracing::info!(nodes = %config.nodes, backend = ?config.backend, "starting word count");
    match config.backend {
        Backend::Memory => {
            let cluster = Arc::new(MemCluster::new(
                &config.node_addresses()?,
                config.router.virtual_nodes,
            ));
            run(config, cluster, batches).await
        }
        Backend::Redis => run(config, Arc::new(RedisNodeClient::new()), batches).await,
    }
}
