//! CLI surface and layered configuration: `--id`/`--config`/`--bootstrap`
//! flags over the `replicas.json` cluster descriptor.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;

use crate::protos::ClusterConfig;

/// Lower/upper bound of the randomised election timeout.
pub const ELECTION_TIMEOUT_MIN: Duration = Duration::from_millis(3000);
pub const ELECTION_TIMEOUT_MAX: Duration = Duration::from_millis(5000);
/// Fixed leader heartbeat cadence.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1500);

/// Per-RPC timeouts, each chosen shorter than `ELECTION_TIMEOUT_MIN` so a
/// single stalled follower cannot cascade into an unwanted election.
pub const REQUEST_VOTE_TIMEOUT: Duration = Duration::from_millis(2000);
pub const APPEND_ENTRIES_TIMEOUT: Duration = Duration::from_millis(2000);
pub const LIVENESS_PING_TIMEOUT: Duration = Duration::from_millis(500);
pub const LEADER_QUERY_TIMEOUT: Duration = Duration::from_millis(2000);

#[derive(Parser, Debug)]
#[command(name = "raft-server", about = "Replicated blog application node")]
pub struct Cli {
    /// This node's id, as it appears in the cluster config's replica list.
    #[arg(long)]
    pub id: String,

    /// Path to replicas.json. Defaults to replicas.json in the current
    /// directory, matching the original process launcher's convention.
    #[arg(long, default_value = "replicas.json")]
    pub config: PathBuf,

    /// Seed a brand-new single-node cluster instead of waiting to be added
    /// by an existing leader.
    #[arg(long, default_value_t = false)]
    pub bootstrap: bool,
}

pub fn load_cluster_config(path: &Path) -> anyhow::Result<ClusterConfig> {
    let bytes = std::fs::read(path)
        .map_err(|e| anyhow::anyhow!("could not read cluster config {}: {e}", path.display()))?;
    let config: ClusterConfig = serde_json::from_slice(&bytes)
        .map_err(|e| anyhow::anyhow!("could not parse cluster config {}: {e}", path.display()))?;
    Ok(config)
}

pub fn save_cluster_config(path: &Path, config: &ClusterConfig) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(config)?;
    core::atomic_write(path, &bytes)?;
    Ok(())
}

/// Resolves a peer's store path, relative to the directory containing the
/// cluster config file if the path itself is relative.
pub fn resolve_store_path(config_path: &Path, store_path: &str) -> PathBuf {
    let candidate = PathBuf::from(store_path);
    if candidate.is_absolute() {
        return candidate;
    }
    config_path.parent().map(|dir| dir.join(&candidate)).unwrap_or(candidate)
}
