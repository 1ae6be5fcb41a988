//! Checkpoint persistence in the transfer area.
//!
//! A checkpoint is the tool's partially written result file copied to
//! `<transfer>/<dataset>/Job<job>_Step<step>/<name>.tmp`, next to a
//! `<name>.tmp.json` sidecar with its resume point and checksum. Saves are
//! rate limited and atomic. Checkpoints are never deleted directly: a
//! successful run appends them to `safe_to_delete.txt`, and `purge_marked`
//! removes them later.

use chrono::{DateTime, Utc};
use harness_core::artifacts::{self, FsError};
use harness_core::{JobKey, ResumePoint, ResumeScanner};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Minimum time between two saves of the same run.
pub const MIN_SAVE_INTERVAL: Duration = Duration::from_secs(60);

/// Deferred deletion list, one path per line.
pub const SAFE_TO_DELETE_LIST: &str = "safe_to_delete.txt";

const CHECKPOINT_SUFFIX: &str = ".tmp";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid checkpoint metadata {path}: {source}")]
    Meta {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("checkpoint {path} does not match its recorded checksum")]
    ChecksumMismatch { path: PathBuf },
}

pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Sidecar written next to every saved checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub key: JobKey,
    pub file_name: String,
    pub last_completed_unit: Option<u64>,
    pub completed_units: usize,
    /// Units the tool reported as failed up to this save.
    #[serde(default)]
    pub units_failed: u64,
    pub size: u64,
    pub sha256: String,
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RestoredCheckpoint {
    /// Local working file, rewritten with the resumable content.
    pub local_file: PathBuf,
    pub point: Option<ResumePoint>,
    pub meta: Option<CheckpointMeta>,
}

#[derive(Debug)]
pub struct CheckpointStore {
    transfer_root: PathBuf,
    min_interval: Duration,
    scanner: Option<ResumeScanner>,
    last_save: Instant,
    last_meta: Option<CheckpointMeta>,
    units_failed: u64,
}

impl CheckpointStore {
    pub fn new(transfer_root: impl Into<PathBuf>, min_interval: Duration) -> Self {
        Self {
            transfer_root: transfer_root.into(),
            min_interval,
            scanner: None,
            last_save: Instant::now(),
            last_meta: None,
            units_failed: 0,
        }
    }

    /// Only persist content up to the last completed unit.
    pub fn with_scanner(mut self, scanner: ResumeScanner) -> Self {
        self.scanner = Some(scanner);
        self
    }

    pub fn checkpoint_dir(&self, key: &JobKey) -> PathBuf {
        self.transfer_root.join(key.relative_dir())
    }

    /// Durable path for a local working file; the name always ends in `.tmp`.
    pub fn checkpoint_path(&self, key: &JobKey, local: &Path) -> Result<PathBuf> {
        let name = local
            .file_name()
            .ok_or_else(|| FsError::NoFileName(local.to_path_buf()))?
            .to_string_lossy()
            .to_string();
        let name = if name.ends_with(CHECKPOINT_SUFFIX) {
            name
        } else {
            format!("{name}{CHECKPOINT_SUFFIX}")
        };
        Ok(self.checkpoint_dir(key).join(name))
    }

    fn meta_path(checkpoint: &Path) -> PathBuf {
        let mut name = checkpoint.as_os_str().to_os_string();
        name.push(".json");
        PathBuf::from(name)
    }

    /// Failed-unit count recorded with the next save.
    pub fn record_units_failed(&mut self, units_failed: u64) {
        self.units_failed = units_failed;
    }

    pub fn save_due(&self) -> bool {
        self.last_save.elapsed() >= self.min_interval
    }

    /// Metadata of the most recent save by this store.
    pub fn last_saved(&self) -> Option<&CheckpointMeta> {
        self.last_meta.as_ref()
    }

    /// Save `local` if the minimum interval has passed since the last save.
    ///
    /// Returns whether a new checkpoint was written.
    pub fn try_save_checkpoint(&mut self, key: &JobKey, local: &Path) -> Result<bool> {
        if !self.save_due() {
            return Ok(false);
        }
        self.save_now(key, local)
    }

    /// Save regardless of the rate limit. Used when a run is about to fail.
    pub fn save_now(&mut self, key: &JobKey, local: &Path) -> Result<bool> {
        if !local.is_file() {
            return Ok(false);
        }
        let raw = artifacts::with_retry(|| std::fs::read(local)).map_err(|source| {
            CheckpointError::Read {
                path: local.to_path_buf(),
                source,
            }
        })?;
        let text = String::from_utf8_lossy(&raw);

        let (content, point) = match &self.scanner {
            Some(scanner) => match scanner.trim_to_resume_point(&text) {
                (_, None) => {
                    debug!(path = %local.display(), "no completed unit yet, skipping checkpoint");
                    return Ok(false);
                }
                (trimmed, point) => (trimmed, point),
            },
            None if text.is_empty() => return Ok(false),
            None => (&*text, None),
        };

        let sha256 = artifacts::checksum_bytes(content.as_bytes());
        if self
            .last_meta
            .as_ref()
            .is_some_and(|meta| meta.sha256 == sha256 && meta.units_failed == self.units_failed)
        {
            self.last_save = Instant::now();
            return Ok(false);
        }

        let dest = self.checkpoint_path(key, local)?;
        artifacts::write_atomic(&dest, content.as_bytes())?;

        let meta = CheckpointMeta {
            key: key.clone(),
            file_name: local
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            last_completed_unit: point.map(|p| p.last_completed_unit),
            completed_units: point.map_or(0, |p| p.completed_units),
            units_failed: self.units_failed,
            size: content.len() as u64,
            sha256,
            saved_at: Utc::now(),
        };
        let meta_path = Self::meta_path(&dest);
        let json = serde_json::to_vec_pretty(&meta).map_err(|source| CheckpointError::Meta {
            path: meta_path.clone(),
            source,
        })?;
        artifacts::write_atomic(&meta_path, &json)?;

        info!(
            job = key.job,
            dataset = %key.dataset,
            path = %dest.display(),
            last_completed_unit = meta.last_completed_unit.unwrap_or_default(),
            size = meta.size,
            "checkpoint saved"
        );
        self.last_save = Instant::now();
        self.last_meta = Some(meta);
        Ok(true)
    }

    /// Restore the durable checkpoint for `key` into `local`.
    ///
    /// `Ok(None)` means there is nothing to resume from. A checkpoint whose
    /// content no longer matches its sidecar is rejected.
    pub fn try_restore_checkpoint(
        &self,
        key: &JobKey,
        local: &Path,
    ) -> Result<Option<RestoredCheckpoint>> {
        let durable = self.checkpoint_path(key, local)?;
        if !durable.is_file() {
            return Ok(None);
        }

        let raw = artifacts::with_retry(|| std::fs::read(&durable)).map_err(|source| {
            CheckpointError::Read {
                path: durable.clone(),
                source,
            }
        })?;

        let meta_path = Self::meta_path(&durable);
        let meta = if meta_path.is_file() {
            let json = std::fs::read(&meta_path).map_err(|source| CheckpointError::Read {
                path: meta_path.clone(),
                source,
            })?;
            let meta: CheckpointMeta =
                serde_json::from_slice(&json).map_err(|source| CheckpointError::Meta {
                    path: meta_path.clone(),
                    source,
                })?;
            if artifacts::checksum_bytes(&raw) != meta.sha256 {
                return Err(CheckpointError::ChecksumMismatch { path: durable });
            }
            Some(meta)
        } else {
            warn!(path = %durable.display(), "checkpoint has no metadata sidecar");
            None
        };

        let text = String::from_utf8_lossy(&raw);
        let (content, point) = match &self.scanner {
            Some(scanner) => {
                let (trimmed, point) = scanner.trim_to_resume_point(&text);
                if point.is_none() {
                    info!(path = %durable.display(), "checkpoint holds no completed unit");
                    return Ok(None);
                }
                (trimmed, point)
            }
            None => (&*text, None),
        };

        artifacts::write_atomic(local, content.as_bytes())?;
        info!(
            job = key.job,
            dataset = %key.dataset,
            path = %local.display(),
            last_completed_unit = point.map(|p| p.last_completed_unit).unwrap_or_default(),
            "checkpoint restored"
        );

        Ok(Some(RestoredCheckpoint {
            local_file: local.to_path_buf(),
            point,
            meta,
        }))
    }

    /// Queue the durable checkpoint and its sidecar for later deletion.
    pub fn mark_safe_to_delete(&self, key: &JobKey, local: &Path) -> Result<()> {
        let durable = self.checkpoint_path(key, local)?;
        let entries = [durable.clone(), Self::meta_path(&durable)];

        let mut pending = self.pending_deletions()?;
        let before = pending.len();
        for entry in entries {
            if !pending.contains(&entry) {
                pending.push(entry);
            }
        }
        if pending.len() != before {
            self.write_list(&pending)?;
        }
        info!(
            job = key.job,
            dataset = %key.dataset,
            path = %durable.display(),
            "checkpoint marked safe to delete"
        );
        Ok(())
    }

    pub fn pending_deletions(&self) -> Result<Vec<PathBuf>> {
        let list = self.transfer_root.join(SAFE_TO_DELETE_LIST);
        match std::fs::read_to_string(&list) {
            Ok(content) => Ok(content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(PathBuf::from)
                .collect()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(source) => Err(CheckpointError::Read { path: list, source }),
        }
    }

    /// Delete everything on the deferred list. Entries that cannot be
    /// deleted stay on the list. Returns the number of files removed.
    pub fn purge_marked(&self) -> Result<usize> {
        let pending = self.pending_deletions()?;
        let mut remaining = Vec::new();
        let mut removed = 0;

        for path in pending {
            match artifacts::remove_with_retry(&path) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to delete checkpoint");
                    remaining.push(path);
                }
            }
        }

        if remaining.is_empty() {
            artifacts::remove_with_retry(&self.transfer_root.join(SAFE_TO_DELETE_LIST))?;
        } else {
            self.write_list(&remaining)?;
        }
        info!(removed, kept = remaining.len(), "purged checkpoints");
        Ok(removed)
    }

    fn write_list(&self, entries: &[PathBuf]) -> Result<()> {
        let mut content = String::new();
        for entry in entries {
            content.push_str(&entry.to_string_lossy());
            content.push('\n');
        }
        artifacts::write_atomic(
            &self.transfer_root.join(SAFE_TO_DELETE_LIST),
            content.as_bytes(),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PARTIAL_PEK: &str = "\
Filename: Dataset.raw
Scan = 10
1000.1\t50
Number of isotopic distributions detected = 4
Scan = 11
1001.4\t12
Number of isotopic distributions detected = 2
Scan = 12
1002.5\t7
";

    fn scanner() -> ResumeScanner {
        ResumeScanner::new(
            r"(?i)^scan\s*=\s*(\d+)",
            "Number of isotopic distributions detected",
        )
        .unwrap()
    }

    fn store(root: &Path, interval: Duration) -> CheckpointStore {
        CheckpointStore::new(root, interval).with_scanner(scanner())
    }

    fn key() -> JobKey {
        JobKey::new("Dataset", 1234, 2)
    }

    #[test]
    fn durable_name_always_ends_in_tmp() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path(), MIN_SAVE_INTERVAL);
        assert_eq!(
            store
                .checkpoint_path(&key(), Path::new("/work/Dataset.pek.tmp"))
                .unwrap(),
            dir.path().join("Dataset/Job1234_Step2/Dataset.pek.tmp")
        );
        assert_eq!(
            store
                .checkpoint_path(&key(), Path::new("/work/results.txt"))
                .unwrap(),
            dir.path().join("Dataset/Job1234_Step2/results.txt.tmp")
        );
    }

    #[test]
    fn saves_are_rate_limited() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("Dataset.pek.tmp");
        std::fs::write(&local, PARTIAL_PEK).unwrap();

        let mut slow = store(&dir.path().join("transfer"), MIN_SAVE_INTERVAL);
        assert!(!slow.save_due());
        assert!(!slow.try_save_checkpoint(&key(), &local).unwrap());

        let mut fast = store(&dir.path().join("transfer"), Duration::ZERO);
        assert!(fast.try_save_checkpoint(&key(), &local).unwrap());
    }

    #[test]
    fn save_keeps_only_completed_units() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("Dataset.pek.tmp");
        std::fs::write(&local, PARTIAL_PEK).unwrap();
        let mut store = store(&dir.path().join("transfer"), Duration::ZERO);

        assert!(store.save_now(&key(), &local).unwrap());
        let durable = store.checkpoint_path(&key(), &local).unwrap();
        let saved = std::fs::read_to_string(&durable).unwrap();
        assert!(saved.ends_with("detected = 2\n"));
        assert!(!saved.contains("Scan = 12"));

        let meta = store.last_saved().unwrap();
        assert_eq!(meta.last_completed_unit, Some(11));
        assert_eq!(meta.completed_units, 2);
        assert_eq!(meta.size, saved.len() as u64);
    }

    #[test]
    fn identical_content_is_not_saved_twice() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("Dataset.pek.tmp");
        std::fs::write(&local, PARTIAL_PEK).unwrap();
        let mut store = store(&dir.path().join("transfer"), Duration::ZERO);

        assert!(store.save_now(&key(), &local).unwrap());
        assert!(!store.save_now(&key(), &local).unwrap());

        store.record_units_failed(1);
        assert!(store.save_now(&key(), &local).unwrap());
        assert_eq!(store.last_saved().unwrap().units_failed, 1);
    }

    #[test]
    fn nothing_completed_means_nothing_saved() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("Dataset.pek.tmp");
        std::fs::write(&local, "Filename: Dataset.raw\nScan = 1\n").unwrap();
        let mut store = store(&dir.path().join("transfer"), Duration::ZERO);

        assert!(!store.save_now(&key(), &local).unwrap());
        assert!(!store.checkpoint_dir(&key()).exists());
        assert!(!store
            .save_now(&key(), &dir.path().join("missing.pek.tmp"))
            .unwrap());
    }

    #[test]
    fn restore_in_fresh_store_yields_resume_point() {
        let dir = TempDir::new().unwrap();
        let transfer = dir.path().join("transfer");
        let local = dir.path().join("Dataset.pek.tmp");
        std::fs::write(&local, PARTIAL_PEK).unwrap();
        let mut saver = store(&transfer, Duration::ZERO);
        saver.record_units_failed(3);
        saver.save_now(&key(), &local).unwrap();

        let fresh_dir = dir.path().join("rerun");
        std::fs::create_dir_all(&fresh_dir).unwrap();
        let fresh_local = fresh_dir.join("Dataset.pek.tmp");
        let restored = store(&transfer, MIN_SAVE_INTERVAL)
            .try_restore_checkpoint(&key(), &fresh_local)
            .unwrap()
            .unwrap();

        assert_eq!(restored.point.unwrap().last_completed_unit, 11);
        let meta = restored.meta.unwrap();
        assert_eq!(meta.last_completed_unit, Some(11));
        assert_eq!(meta.units_failed, 3);
        let content = std::fs::read_to_string(&fresh_local).unwrap();
        assert!(content.ends_with("detected = 2\n"));
    }

    #[test]
    fn restore_without_checkpoint_is_none() {
        let dir = TempDir::new().unwrap();
        let restored = store(dir.path(), Duration::ZERO)
            .try_restore_checkpoint(&key(), &dir.path().join("Dataset.pek.tmp"))
            .unwrap();
        assert!(restored.is_none());
    }

    #[test]
    fn restore_rejects_tampered_checkpoint() {
        let dir = TempDir::new().unwrap();
        let transfer = dir.path().join("transfer");
        let local = dir.path().join("Dataset.pek.tmp");
        std::fs::write(&local, PARTIAL_PEK).unwrap();
        let mut saver = store(&transfer, Duration::ZERO);
        saver.save_now(&key(), &local).unwrap();

        let durable = saver.checkpoint_path(&key(), &local).unwrap();
        std::fs::write(&durable, "Scan = 99\nNumber of isotopic distributions detected = 1\n")
            .unwrap();

        let result = store(&transfer, Duration::ZERO).try_restore_checkpoint(&key(), &local);
        assert!(matches!(
            result,
            Err(CheckpointError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn restore_accepts_missing_sidecar() {
        let dir = TempDir::new().unwrap();
        let store = store(dir.path(), Duration::ZERO);
        let local = dir.path().join("work/Dataset.pek.tmp");
        let durable = store.checkpoint_path(&key(), &local).unwrap();
        std::fs::create_dir_all(durable.parent().unwrap()).unwrap();
        std::fs::write(&durable, PARTIAL_PEK).unwrap();

        let restored = store.try_restore_checkpoint(&key(), &local).unwrap().unwrap();
        assert!(restored.meta.is_none());
        assert_eq!(restored.point.unwrap().last_completed_unit, 11);
    }

    #[test]
    fn marked_checkpoints_are_deleted_on_purge() {
        let dir = TempDir::new().unwrap();
        let transfer = dir.path().join("transfer");
        let local = dir.path().join("Dataset.pek.tmp");
        std::fs::write(&local, PARTIAL_PEK).unwrap();
        let mut store = store(&transfer, Duration::ZERO);
        store.save_now(&key(), &local).unwrap();
        let durable = store.checkpoint_path(&key(), &local).unwrap();

        store.mark_safe_to_delete(&key(), &local).unwrap();
        store.mark_safe_to_delete(&key(), &local).unwrap();
        assert_eq!(store.pending_deletions().unwrap().len(), 2);
        assert!(durable.exists(), "marking must not delete");

        assert_eq!(store.purge_marked().unwrap(), 2);
        assert!(!durable.exists());
        assert!(store.pending_deletions().unwrap().is_empty());
        assert!(!transfer.join(SAFE_TO_DELETE_LIST).exists());
    }
}
