use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use raft::config::{load_cluster_config, resolve_store_path, save_cluster_config, Cli};
use raft::dss::ConsensusStore;
use raft::node::Node;
use raft::protos::{ClusterConfig, ReplicaConfig};
use raft::state_machine::StoragePaths;
use raft::transport::router;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();

    let cluster_config = if cli.bootstrap && !cli.config.exists() {
        info!(id = %cli.id, "bootstrapping new single-node cluster");
        let config = ClusterConfig {
            replicas: vec![ReplicaConfig {
                id: cli.id.clone(),
                host: "127.0.0.1".to_string(),
                port: 8000,
                raft_store: "raft_state.json".to_string(),
                posts_store: "posts.csv".to_string(),
                users_store: "users.csv".to_string(),
                writers_store: "writers.csv".to_string(),
                comments_store: "comments.csv".to_string(),
            }],
        };
        save_cluster_config(&cli.config, &config)?;
        config
    } else {
        load_cluster_config(&cli.config)?
    };

    let self_config = cluster_config
        .replicas
        .iter()
        .find(|r| r.id == cli.id)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("id {} not present in cluster config {}", cli.id, cli.config.display()))?;

    let data_dir = cli
        .config
        .parent()
        .map(|p| p.join(format!("data-{}", cli.id)))
        .unwrap_or_else(|| std::path::PathBuf::from(format!("data-{}", cli.id)));
    let _lock = core::DirLock::acquire(&data_dir)?;

    let raft_store_path = resolve_store_path(&cli.config, &self_config.raft_store);
    let storage_paths = StoragePaths {
        posts: resolve_store_path(&cli.config, &self_config.posts_store),
        users: resolve_store_path(&cli.config, &self_config.users_store),
        writers: resolve_store_path(&cli.config, &self_config.writers_store),
        comments: resolve_store_path(&cli.config, &self_config.comments_store),
    };

    let node = Node::bootstrap(
        cli.id.clone(),
        cluster_config.replicas.clone(),
        ConsensusStore::new(raft_store_path),
        storage_paths,
    );

    let driver = Arc::clone(&node);
    tokio::spawn(async move { driver.run().await });

    let addr = format!("{}:{}", self_config.host, self_config.port);
    info!(%addr, id = %cli.id, "raft-server listening");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router(node)).await?;

    Ok(())
}
