//! Small filesystem utilities shared by the rest of the workspace.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;

#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_err(path: &Path, source: io::Error) -> FsError {
    FsError::Io { path: path.to_path_buf(), source }
}

/// Atomically replace the contents of `path` with `bytes`.
///
/// Writes to a sibling `path.tmp` file, fsyncs it, then renames it over
/// `path`. On any failure the temp file is removed on a best-effort basis.
/// This is the single write primitive used by every durable store in the
/// workspace (raft state, application tables) so "fsync before rename" is
/// implemented exactly once.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), FsError> {
    let tmp_path = tmp_path_for(path);

    let result = (|| -> Result<(), FsError> {
        {
            use std::io::Write;
            let mut file = File::create(&tmp_path).map_err(|e| io_err(&tmp_path, e))?;
            file.write_all(bytes).map_err(|e| io_err(&tmp_path, e))?;
            file.sync_all().map_err(|e| io_err(&tmp_path, e))?;
        }
        fs::rename(&tmp_path, path).map_err(|e| io_err(path, e))?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }

    result
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// An advisory lock on a directory, held for the lifetime of the process.
///
/// Prevents two instances of this server from being started against the
/// same data directory, which would otherwise corrupt the durable state
/// store by racing the atomic-rename writer above.
pub struct DirLock {
    _file: File,
}

impl DirLock {
    pub fn acquire(dir: &Path) -> Result<Self, FsError> {
        fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        let lock_path = dir.join(".lock");
        let file = File::create(&lock_path).map_err(|e| io_err(&lock_path, e))?;
        file.try_lock_exclusive().map_err(|e| io_err(&lock_path, e))?;
        Ok(DirLock { _file: file })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_creates_and_overwrites() {
        let dir = std::env::temp_dir().join(format!("core_fs_test_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("state.json");

        atomic_write(&path, b"{\"a\":1}").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"{\"a\":1}");

        atomic_write(&path, b"{\"a\":2}").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"{\"a\":2}");

        assert!(!dir.join("state.json.tmp").exists());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn dir_lock_rejects_second_holder() {
        let dir = std::env::temp_dir().join(format!("core_lock_test_{}", std::process::id()));
        let _lock = DirLock::acquire(&dir).unwrap();
        assert!(DirLock::acquire(&dir).is_err());
        fs::remove_dir_all(&dir).ok();
    }
}
