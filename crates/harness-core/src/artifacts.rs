//! File helpers shared by the checkpoint store, post-processing and the
//! collaborators.
//!
//! Writes that another process may read go through a temp file in the same
//! directory and a rename, so readers never observe a half-written file.
//! Idempotent local operations (copy, delete, rename) retry a few times with a
//! short fixed backoff; nothing else retries.

use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const RETRY_ATTEMPTS: u32 = 3;
pub const RETRY_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum FsError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("source file not found: {0}")]
    SourceNotFound(PathBuf),
    #[error("path has no file name: {0}")]
    NoFileName(PathBuf),
}

pub type Result<T> = std::result::Result<T, FsError>;

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> FsError + '_ {
    move |source| FsError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// SHA-256 of an in-memory buffer, hex encoded.
pub fn checksum_bytes(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// Write `content` to `dest` via a temp file in the same directory.
pub fn write_atomic(dest: &Path, content: &[u8]) -> Result<()> {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(io_err(parent))?;
    let name = dest
        .file_name()
        .ok_or_else(|| FsError::NoFileName(dest.to_path_buf()))?
        .to_string_lossy();
    let temp = parent.join(format!(".{name}.{}.partial", uuid::Uuid::now_v7()));

    if let Err(err) = fs::write(&temp, content) {
        let _ = fs::remove_file(&temp);
        return Err(FsError::Io {
            path: temp,
            source: err,
        });
    }
    if let Err(err) = with_retry(|| fs::rename(&temp, dest)) {
        let _ = fs::remove_file(&temp);
        return Err(FsError::Io {
            path: dest.to_path_buf(),
            source: err,
        });
    }
    Ok(())
}

/// Copy `src` to `dest` atomically, returning the number of bytes copied.
pub fn copy_atomic(src: &Path, dest: &Path) -> Result<u64> {
    if !src.is_file() {
        return Err(FsError::SourceNotFound(src.to_path_buf()));
    }
    let content = with_retry(|| fs::read(src)).map_err(io_err(src))?;
    write_atomic(dest, &content)?;
    Ok(content.len() as u64)
}

/// Run an idempotent file operation up to `RETRY_ATTEMPTS` times.
pub fn with_retry<T>(mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.kind() == io::ErrorKind::NotFound || attempt >= RETRY_ATTEMPTS => {
                return Err(err);
            }
            Err(_) => {
                attempt += 1;
                std::thread::sleep(RETRY_BACKOFF);
            }
        }
    }
}

/// Delete a file with retries. A file that is already gone counts as deleted.
pub fn remove_with_retry(path: &Path) -> Result<bool> {
    match with_retry(|| fs::remove_file(path)) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(source) => Err(FsError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Recursively copy a directory tree. Returns the number of files copied.
pub fn copy_dir(src: &Path, dest: &Path) -> Result<usize> {
    fs::create_dir_all(dest).map_err(io_err(dest))?;
    let mut copied = 0;
    for entry in fs::read_dir(src).map_err(io_err(src))? {
        let entry = entry.map_err(io_err(src))?;
        let path = entry.path();
        let target = dest.join(entry.file_name());
        if path.is_dir() {
            copied += copy_dir(&path, &target)?;
        } else {
            with_retry(|| fs::copy(&path, &target)).map_err(io_err(&path))?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn checksum_is_computed_correctly() {
        // Known SHA256 of "hello world"
        let expected = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";
        assert_eq!(checksum_bytes(b"hello world"), expected);
    }

    #[test]
    fn write_atomic_replaces_and_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("nested/result.pek.tmp");

        write_atomic(&dest, b"first").unwrap();
        write_atomic(&dest, b"second").unwrap();

        assert_eq!(fs::read_to_string(&dest).unwrap(), "second");
        let leftovers: Vec<_> = fs::read_dir(dest.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn copy_atomic_missing_source_fails() {
        let dir = TempDir::new().unwrap();
        let result = copy_atomic(&dir.path().join("absent"), &dir.path().join("dest"));
        assert!(matches!(result, Err(FsError::SourceNotFound(_))));
    }

    #[test]
    fn copy_atomic_copies_bytes() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.txt");
        fs::write(&src, "payload").unwrap();
        let copied = copy_atomic(&src, &dir.path().join("out/dest.txt")).unwrap();
        assert_eq!(copied, 7);
        assert_eq!(
            fs::read_to_string(dir.path().join("out/dest.txt")).unwrap(),
            "payload"
        );
    }

    #[test]
    fn retry_gives_up_after_fixed_attempts() {
        let mut calls = 0;
        let result: io::Result<()> = with_retry(|| {
            calls += 1;
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "locked"))
        });
        assert!(result.is_err());
        assert_eq!(calls, RETRY_ATTEMPTS);
    }

    #[test]
    fn retry_recovers_from_transient_error() {
        let mut calls = 0;
        let result = with_retry(|| {
            calls += 1;
            if calls < 2 {
                Err(io::Error::new(io::ErrorKind::PermissionDenied, "locked"))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 2);
    }

    #[test]
    fn remove_missing_file_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone.txt");
        assert!(!remove_with_retry(&path).unwrap());
        fs::write(&path, "x").unwrap();
        assert!(remove_with_retry(&path).unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn copy_dir_is_recursive() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("a.txt"), "a").unwrap();
        fs::write(src.join("sub/b.txt"), "b").unwrap();

        let copied = copy_dir(&src, &dir.path().join("dest")).unwrap();
        assert_eq!(copied, 2);
        assert!(dir.path().join("dest/sub/b.txt").exists());
    }
}
