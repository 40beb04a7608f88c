//! Durable state store: atomic persistence of consensus state and of the
//! application tables, both built on [`core::atomic_write`].

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::state::PersistentState;
use crate::RaftError;

pub struct ConsensusStore {
    path: PathBuf,
}

impl ConsensusStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ConsensusStore { path: path.into() }
    }

    /// Loads the last persisted consensus state, or a fresh zero state if
    /// the file is missing or unparsable. A corrupt file is logged and
    /// treated the same as "absent" rather than aborting startup.
    pub fn load(&self) -> PersistentState {
        match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                warn!(path = %self.path.display(), %err, "raft state file unparsable, starting fresh");
                PersistentState::default()
            }),
            Err(_) => PersistentState::default(),
        }
    }

    pub fn save(&self, state: &PersistentState) -> Result<(), RaftError> {
        let bytes = serde_json::to_vec_pretty(state)
            .map_err(|e| RaftError::BadRequest(format!("could not serialise raft state: {e}")))?;
        core::atomic_write(&self.path, &bytes)?;
        Ok(())
    }
}

/// Full-file CSV rewrite for one application table. Not required to be
/// atomic with the consensus-state write; on restart the tables are
/// always rebuilt by replaying the committed log rather than trusted.
///
/// `headers` is written unconditionally, even for zero rows, so an empty
/// table still round-trips as "fixed headers, no data" (§6) rather than a
/// zero-byte file — `csv::Writer`'s automatic header inference only fires
/// on the first `serialize` call, which never happens for an empty slice.
pub fn write_csv<T: serde::Serialize>(path: &Path, headers: &[&str], rows: &[T]) -> Result<(), RaftError> {
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(Vec::new());
    writer
        .write_record(headers)
        .map_err(|e| RaftError::BadRequest(format!("could not write header for {}: {e}", path.display())))?;
    for row in rows {
        writer
            .serialize(row)
            .map_err(|e| RaftError::BadRequest(format!("could not serialise row for {}: {e}", path.display())))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| RaftError::BadRequest(format!("csv writer flush failed: {e}")))?;
    core::atomic_write(path, &bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_file_returns_zero_state() {
        let store = ConsensusStore::new("/tmp/does-not-exist-raft-state.json");
        let state = store.load();
        assert_eq!(state.current_term, 0);
        assert!(state.voted_for.is_none());
        assert!(state.log.is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = std::env::temp_dir().join(format!("dss_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("raft_state.json");
        let store = ConsensusStore::new(&path);

        let mut state = PersistentState::default();
        state.current_term = 4;
        state.voted_for = Some("node-b".to_string());
        state.log.push(crate::protos::LogEntry::new(3, "SUBSCRIBE", vec!["a@x".into()]));

        store.save(&state).unwrap();
        let loaded = store.load();
        assert_eq!(loaded.current_term, 4);
        assert_eq!(loaded.voted_for, Some("node-b".to_string()));
        assert_eq!(loaded.log.len(), 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn write_csv_emits_header_even_for_empty_table() {
        #[derive(serde::Serialize)]
        struct Row {
            email: String,
        }

        let dir = std::env::temp_dir().join(format!("dss_csv_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("users.csv");

        write_csv::<Row>(&path, &["email"], &[]).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "email\n");

        write_csv(&path, &["email"], &[Row { email: "a@x".into() }]).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "email\na@x\n");

        std::fs::remove_dir_all(&dir).ok();
    }
}
