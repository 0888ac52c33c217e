//! Checkpoint registry -- acknowledged read offsets per input source.
//!
//! Offsets are advanced only from acknowledgment callbacks, so a restart
//! resumes reading right after the last line the output accepted. The
//! registry is persisted as a single JSON file written through a temporary
//! file and an atomic rename.
//!
//! # File Format
//!
//! ```json
//! {
//!   "version": 1,
//!   "entries": {
//!     "syslog:/var/log/syslog": { "offset": 10240, "updated_at": "2024-03-05T10:00:00Z" }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Current on-disk format version.
const FORMAT_VERSION: u32 = 1;

/// File name inside `general.data_dir`.
pub const CHECKPOINT_FILE: &str = "checkpoints.json";

/// Acknowledged position of a single source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Byte offset right after the last acknowledged line.
    pub offset: u64,
    /// When the offset last advanced.
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointFile {
    version: u32,
    #[serde(default)]
    entries: BTreeMap<String, Checkpoint>,
}

/// In-memory checkpoint table backed by a JSON file.
#[derive(Debug)]
pub struct CheckpointRegistry {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, Checkpoint>>,
    dirty: AtomicBool,
}

impl CheckpointRegistry {
    /// Load the registry from `path`, starting empty if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or
    /// was written by an unsupported format version.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(bytes) => {
                let file: CheckpointFile = serde_json::from_slice(&bytes)
                    .with_context(|| format!("failed to parse checkpoint file {}", path.display()))?;
                if file.version != FORMAT_VERSION {
                    anyhow::bail!(
                        "unsupported checkpoint format version {} in {}",
                        file.version,
                        path.display()
                    );
                }
                file.entries
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read checkpoint file {}", path.display()));
            }
        };

        tracing::info!(
            path = %path.display(),
            sources = entries.len(),
            "checkpoint registry loaded"
        );

        Ok(Self {
            path,
            entries: Mutex::new(entries),
            dirty: AtomicBool::new(false),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acknowledged offset for `key`, if any.
    pub fn offset(&self, key: &str) -> Option<u64> {
        self.lock().get(key).map(|c| c.offset)
    }

    /// Snapshot of every checkpoint.
    pub fn snapshot(&self) -> BTreeMap<String, Checkpoint> {
        self.lock().clone()
    }

    /// Advance the offset for `key`. Offsets never move backwards.
    pub fn advance(&self, key: &str, offset: u64) {
        let mut entries = self.lock();
        let current = entries.get(key).map(|c| c.offset);
        if current.is_some_and(|c| c >= offset) {
            return;
        }
        entries.insert(
            key.to_owned(),
            Checkpoint {
                offset,
                updated_at: Utc::now(),
            },
        );
        self.dirty.store(true, Ordering::Release);
    }

    /// Forget `key` (e.g. after the source was truncated).
    pub fn reset(&self, key: &str) {
        if self.lock().remove(key).is_some() {
            self.dirty.store(true, Ordering::Release);
        }
    }

    /// Whether there are changes not yet written to disk.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Write the registry to disk if anything changed since the last flush.
    ///
    /// The file is written to `<path>.tmp`, synced, then renamed over the
    /// previous version so a crash never leaves a half-written file.
    pub fn flush(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let file = CheckpointFile {
            version: FORMAT_VERSION,
            entries: self.snapshot(),
        };
        if let Err(e) = self.write_atomic(&file) {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        tracing::debug!(
            path = %self.path.display(),
            sources = file.entries.len(),
            "checkpoints flushed"
        );
        Ok(())
    }

    fn write_atomic(&self, file: &CheckpointFile) -> Result<()> {
        use std::io::Write;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let tmp = self.path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(file)?;
        {
            let mut out = std::fs::File::create(&tmp)
                .with_context(|| format!("failed to create {}", tmp.display()))?;
            out.write_all(&bytes)?;
            out.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path).with_context(|| {
            format!(
                "failed to rename {} to {}",
                tmp.display(),
                self.path.display()
            )
        })?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Checkpoint>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Spawn a background task that flushes dirty checkpoints every `interval`.
///
/// Performs a final flush when `cancel` fires.
pub fn spawn_flusher(
    registry: Arc<CheckpointRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = registry.flush() {
                        tracing::warn!(error = %e, "failed to flush checkpoints");
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
        if let Err(e) = registry.flush() {
            tracing::error!(error = %e, "final checkpoint flush failed");
        }
        tracing::debug!("checkpoint flusher stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = CheckpointRegistry::load(dir.path().join(CHECKPOINT_FILE)).unwrap();
        assert!(registry.snapshot().is_empty());
        assert!(!registry.is_dirty());
    }

    #[test]
    fn offsets_only_move_forward() {
        let dir = tempfile::tempdir().unwrap();
        let registry = CheckpointRegistry::load(dir.path().join(CHECKPOINT_FILE)).unwrap();

        registry.advance("a", 100);
        registry.advance("a", 50);
        assert_eq!(registry.offset("a"), Some(100));
        registry.advance("a", 150);
        assert_eq!(registry.offset("a"), Some(150));
    }

    #[test]
    fn flush_and_reload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join(CHECKPOINT_FILE);

        let registry = CheckpointRegistry::load(&path).unwrap();
        registry.advance("syslog:/var/log/syslog", 4096);
        registry.flush().unwrap();
        assert!(!registry.is_dirty());
        assert!(!path.with_extension("json.tmp").exists());

        let reloaded = CheckpointRegistry::load(&path).unwrap();
        assert_eq!(reloaded.offset("syslog:/var/log/syslog"), Some(4096));
    }

    #[test]
    fn flush_without_changes_does_not_create_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE);
        let registry = CheckpointRegistry::load(&path).unwrap();
        registry.flush().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE);
        std::fs::write(&path, b"{not json").unwrap();
        assert!(CheckpointRegistry::load(&path).is_err());
    }

    #[test]
    fn unknown_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE);
        std::fs::write(&path, br#"{"version": 99, "entries": {}}"#).unwrap();
        let err = CheckpointRegistry::load(&path).unwrap_err();
        assert!(err.to_string().contains("version 99"));
    }

    #[test]
    fn reset_removes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = CheckpointRegistry::load(dir.path().join(CHECKPOINT_FILE)).unwrap();
        registry.advance("a", 10);
        registry.reset("a");
        assert_eq!(registry.offset("a"), None);
    }

    #[tokio::test]
    async fn flusher_writes_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE);
        let registry = Arc::new(CheckpointRegistry::load(&path).unwrap());
        let cancel = CancellationToken::new();
        let task = spawn_flusher(Arc::clone(&registry), Duration::from_secs(3600), cancel.clone());

        registry.advance("a", 7);
        cancel.cancel();
        task.await.unwrap();

        let reloaded = CheckpointRegistry::load(&path).unwrap();
        assert_eq!(reloaded.offset("a"), Some(7));
    }
}
