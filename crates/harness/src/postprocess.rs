//! Locating, checking and renaming tool output.
//!
//! Tools name their output after the input, the parameter file or the
//! date. These helpers find files by wildcard pattern (optionally inside
//! subdirectories), measure them against an `OutputDescriptor` and move
//! the winner to its canonical name.

use chrono::NaiveDate;
use harness_core::artifacts::{self, FsError};
use harness_core::report::ReportError;
use harness_core::{ArtifactCheck, OutputDescriptor};
use regex::Regex;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum PostProcessError {
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid file pattern {0}")]
    InvalidPattern(String),
    #[error("no file matching {pattern} in {dir}")]
    ArtifactNotFound { dir: PathBuf, pattern: String },
}

pub type Result<T> = std::result::Result<T, PostProcessError>;

/// Case-insensitive, anchored regex for a `*`/`?` wildcard pattern.
pub fn wildcard_regex(pattern: &str) -> Result<Regex> {
    let mut re = String::from("(?i)^");
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|_| PostProcessError::InvalidPattern(pattern.to_string()))
}

/// Files in `dir` (and its immediate subdirectories, if the descriptor says
/// so) matching its pattern, sorted by path.
pub fn locate_artifacts(dir: &Path, descriptor: &OutputDescriptor) -> Result<Vec<PathBuf>> {
    let pattern = wildcard_regex(&descriptor.pattern)?;
    let mut found = Vec::new();
    collect_matches(dir, &pattern, u8::from(descriptor.search_subdirs), &mut found)?;
    found.sort();
    Ok(found)
}

fn collect_matches(
    dir: &Path,
    pattern: &Regex,
    depth: u8,
    found: &mut Vec<PathBuf>,
) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(PostProcessError::Io {
                path: dir.to_path_buf(),
                source,
            })
        }
    };

    for entry in entries.filter_map(std::result::Result::ok) {
        let path = entry.path();
        if path.is_dir() {
            if depth > 0 {
                collect_matches(&path, pattern, depth - 1, found)?;
            }
        } else if pattern.is_match(&entry.file_name().to_string_lossy()) {
            found.push(path);
        }
    }
    Ok(())
}

/// Compare what the tool wrote against the descriptor.
pub fn check_artifact(dir: &Path, descriptor: &OutputDescriptor) -> ArtifactCheck {
    let files = match locate_artifacts(dir, descriptor) {
        Ok(files) if !files.is_empty() => files,
        Ok(_) => return ArtifactCheck::Missing,
        Err(err) => {
            debug!(dir = %dir.display(), error = %err, "artifact lookup failed");
            return ArtifactCheck::Missing;
        }
    };

    let bytes: u64 = files
        .iter()
        .filter_map(|path| std::fs::metadata(path).ok())
        .map(|meta| meta.len())
        .sum();
    let count = files.len();
    if count < descriptor.min_count || bytes < descriptor.min_size {
        ArtifactCheck::TooSmall {
            files: count,
            bytes,
        }
    } else {
        ArtifactCheck::Present {
            files: count,
            bytes,
        }
    }
}

/// Date encoded at the start of a directory name (`2024-03-01...` or `20240301...`).
pub fn leading_date(name: &str) -> Option<NaiveDate> {
    name.get(..10)
        .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
        .or_else(|| {
            name.get(..8)
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y%m%d").ok())
        })
}

/// The most recent date-named subdirectory of `dir`.
pub fn newest_dated_subdir(dir: &Path) -> Option<PathBuf> {
    std::fs::read_dir(dir)
        .ok()?
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            leading_date(&name).map(|date| (date, name, entry.path()))
        })
        .max_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)))
        .map(|(_, _, path)| path)
}

/// Move `src` to `dest`, replacing whatever is there.
pub fn rename_to_canonical(src: &Path, dest: &Path) -> Result<PathBuf> {
    if src == dest {
        return Ok(dest.to_path_buf());
    }
    if dest.exists() {
        artifacts::remove_with_retry(dest)?;
    }
    let renamed = artifacts::with_retry(|| std::fs::rename(src, dest));
    if renamed.is_err() {
        // Different filesystem: fall back to copy and delete.
        artifacts::copy_atomic(src, dest)?;
        artifacts::remove_with_retry(src)?;
    }
    info!(from = %src.display(), to = %dest.display(), "output renamed");
    Ok(dest.to_path_buf())
}

/// First match for `descriptor` under `dir`, or an error naming the pattern.
pub fn require_artifact(dir: &Path, descriptor: &OutputDescriptor) -> Result<PathBuf> {
    locate_artifacts(dir, descriptor)?
        .into_iter()
        .next()
        .ok_or_else(|| PostProcessError::ArtifactNotFound {
            dir: dir.to_path_buf(),
            pattern: descriptor.pattern.clone(),
        })
}
