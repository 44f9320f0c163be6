//! Disk persistence for the chain (one versioned JSON snapshot).

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

use crate::model::{Block, Chain, ChainError};

/// Snapshot layout version written by this build.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Default snapshot filename inside the data directory.
pub const DEFAULT_CHAIN_FILE: &str = "local_chain.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O failure: {0}")]
    Io(#[from] io::Error),

    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),

    #[error("snapshot is not a valid chain: {0}")]
    Invalid(#[from] ChainError),

    #[error("save did not finish within {0:?}")]
    Timeout(Duration),
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    entries: &'a [Block],
}

#[derive(Deserialize)]
struct Snapshot {
    version: u32,
    entries: Vec<Block>,
}

/// Ensure that the given directory exists (create recursively if needed).
pub fn ensure_dir(dir: &Path) -> io::Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}

/// Serialize the full entry sequence (pretty-printed).
pub fn encode(chain: &Chain) -> Result<Vec<u8>, StoreError> {
    let snapshot = SnapshotRef {
        version: SNAPSHOT_VERSION,
        entries: chain.entries(),
    };
    Ok(serde_json::to_vec_pretty(&snapshot)?)
}

pub fn decode(bytes: &[u8]) -> Result<Chain, StoreError> {
    let snapshot: Snapshot = serde_json::from_slice(bytes)?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(StoreError::UnsupportedVersion(snapshot.version));
    }
    Ok(Chain::from_entries(snapshot.entries)?)
}

/// Replace the file at `path` with `bytes` via a temp file in the same
/// directory, so a crash never leaves a half-written snapshot behind.
pub fn write_snapshot(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
    debug!(path = %path.display(), bytes = bytes.len(), "Snapshot written");
    Ok(())
}

/// Load a chain from `path`; `None` when no snapshot exists yet.
pub fn load(path: &Path) -> Result<Option<Chain>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    decode(&bytes).map(Some)
}

pub fn save(chain: &Chain, path: &Path) -> Result<(), StoreError> {
    let bytes = encode(chain)?;
    write_snapshot(path, &bytes)
}

/// The chain together with the file it is mirrored to.
#[derive(Debug)]
pub struct LocalChain {
    path: PathBuf,
    chain: Chain,
}

impl LocalChain {
    /// The snapshot at `path` if there is one, otherwise a genesis-only chain.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let chain = match load(&path)? {
            Some(stored) => {
                info!(path = %path.display(), blocks = stored.len(), "Loaded chain from disk");
                stored
            }
            None => {
                info!(path = %path.display(), "No snapshot on disk; starting from genesis");
                Chain::new()
            }
        };
        Ok(Self { path, chain })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn chain_mut(&mut self) -> &mut Chain {
        &mut self.chain
    }

    pub fn save(&self) -> Result<(), StoreError> {
        save(&self.chain, &self.path)
    }
}
