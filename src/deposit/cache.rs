//! On-disk deposit event cache.
//!
//! One JSON document per chain at `<cache_dir>/chain-<id>/deposit.events.json`
//! holding `{ events, startBlock, endBlock }`. Writes go to a temp file that is
//! fsynced and renamed over the old document, so a crash mid-write leaves the
//! previous window intact.

use crate::deposit::types::DepositEventWindow;

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

pub const DEPOSIT_CACHE_FILE: &str = "deposit.events.json";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct DepositCacheStore {
    dir: PathBuf,
}

impl DepositCacheStore {
    pub fn new(base_dir: impl AsRef<Path>, chain_id: u64) -> Self {
        Self {
            dir: base_dir.as_ref().join(format!("chain-{chain_id}")),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(DEPOSIT_CACHE_FILE)
    }

    /// The persisted window, or an empty `{0, 0}` window when the file is
    /// missing or unreadable. Callers rebuild from the deployment block either way.
    pub async fn get(&self) -> DepositEventWindow {
        match self.load().await {
            Ok(Some(window)) if window.end_block.checked_add(1).is_none() => {
                warn!(
                    path = %self.path().display(),
                    end_block = window.end_block,
                    "deposit cache end block out of range, rebuilding from deployment block"
                );
                DepositEventWindow::default()
            }
            Ok(Some(window)) => window,
            Ok(None) => {
                debug!(path = %self.path().display(), "no deposit cache on disk yet");
                DepositEventWindow::default()
            }
            Err(e) => {
                warn!(
                    path = %self.path().display(),
                    error = %e,
                    "deposit cache unreadable, rebuilding from deployment block"
                );
                DepositEventWindow::default()
            }
        }
    }

    async fn load(&self) -> Result<Option<DepositEventWindow>, CacheError> {
        match tokio::fs::read(self.path()).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the persisted window.
    pub async fn set(&self, window: &DepositEventWindow) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.path();
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec(window)?;

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &path).await?;
        debug!(
            path = %path.display(),
            end_block = window.end_block,
            events = window.events.len(),
            "deposit cache written"
        );
        Ok(())
    }
}
