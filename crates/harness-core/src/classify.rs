//! Closeout classification.
//!
//! One explicit rule turns what is known at the end of a run into a
//! `CloseoutResult`:
//!
//! - process ok, no fatal error, every unit failed (or the tool said there was
//!   nothing to process), output file present (even empty) -> `NoData`
//! - process ok, no fatal error, output present and big enough, no unit
//!   failures -> `Success`
//! - same but some units failed -> `Success` with an evaluation message such as
//!   `3 / 10 scans had no peaks`
//! - anything else -> `Failed`
//!
//! Data-package aggregation uses the same idea one level up: some sub-jobs
//! failing is a warning, none succeeding is not.

use crate::types::{CloseoutCode, CloseoutResult, FailureCategory, UnitLabels};

/// How the tool process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessVerdict {
    /// Exited with a code the integration accepts.
    Succeeded,
    /// Exited with a code the integration rejects.
    ExitCode(i32),
    TimedOut { after_sec: u64 },
    Cancelled,
    /// Killed because fatal error text was seen while it ran.
    Aborted(String),
}

/// State of the expected output artifact after the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactCheck {
    Present { files: usize, bytes: u64 },
    /// Files exist but are below the descriptor's minimum size or count.
    TooSmall { files: usize, bytes: u64 },
    Missing,
}

impl ArtifactCheck {
    pub fn exists(&self) -> bool {
        !matches!(self, Self::Missing)
    }
}

/// Everything the classifier looks at.
#[derive(Debug, Clone)]
pub struct FinalizeFacts {
    pub process: ProcessVerdict,
    pub artifact: ArtifactCheck,
    pub fatal_error: Option<String>,
    pub units_failed: u64,
    pub units_total: u64,
    /// The tool announced that there was nothing to process.
    pub no_data_marker: bool,
    pub unit_labels: UnitLabels,
}

pub fn classify(facts: &FinalizeFacts) -> CloseoutResult {
    match &facts.process {
        ProcessVerdict::Succeeded => {}
        ProcessVerdict::ExitCode(code) => {
            return CloseoutResult::failed(
                FailureCategory::RuntimeFailure,
                format!("tool exited with code {code}"),
            );
        }
        ProcessVerdict::TimedOut { after_sec } => {
            return CloseoutResult::failed(
                FailureCategory::RuntimeFailure,
                format!("tool timed out after {after_sec} seconds"),
            );
        }
        ProcessVerdict::Cancelled => {
            return CloseoutResult::failed(FailureCategory::RuntimeFailure, "run cancelled");
        }
        ProcessVerdict::Aborted(reason) => {
            return CloseoutResult::failed(
                FailureCategory::RuntimeFailure,
                format!("tool aborted: {reason}"),
            );
        }
    }

    if let Some(error) = &facts.fatal_error {
        let first_line = error.lines().next().unwrap_or_default();
        return CloseoutResult::failed(
            FailureCategory::RuntimeFailure,
            format!("tool reported an error: {first_line}"),
        );
    }

    let all_units_failed = facts.units_total > 0 && facts.units_failed >= facts.units_total;
    if facts.no_data_marker || all_units_failed {
        if !facts.artifact.exists() {
            return CloseoutResult::failed(
                FailureCategory::RuntimeFailure,
                "tool reported no data and wrote no output file",
            );
        }
        let message = if all_units_failed {
            format!(
                "all {} {} {}",
                facts.units_total, facts.unit_labels.noun, facts.unit_labels.failure_phrase
            )
        } else {
            "tool reported nothing to process".to_string()
        };
        return CloseoutResult::no_data(message);
    }

    match facts.artifact {
        ArtifactCheck::Missing => {
            return CloseoutResult::failed(
                FailureCategory::RuntimeFailure,
                "expected output file not found",
            );
        }
        ArtifactCheck::TooSmall { files, bytes } => {
            return CloseoutResult::failed(
                FailureCategory::RuntimeFailure,
                format!("expected output is too small ({files} file(s), {bytes} bytes)"),
            );
        }
        ArtifactCheck::Present { .. } => {}
    }

    if facts.units_failed > 0 {
        let total = facts.units_total.max(facts.units_failed);
        return CloseoutResult::success_with_warning(
            facts.unit_labels.summarize(facts.units_failed, total),
        );
    }

    CloseoutResult::success()
}

/// Combine per-sub-job results of a data package.
pub fn classify_aggregate(results: &[(u32, CloseoutResult)]) -> CloseoutResult {
    if results.is_empty() {
        return CloseoutResult::failed(
            FailureCategory::ValidationFailure,
            "data package has no sub-jobs",
        );
    }

    let total = results.len();
    let succeeded = results
        .iter()
        .filter(|(_, r)| r.code == CloseoutCode::Success)
        .count();
    let no_data = results
        .iter()
        .filter(|(_, r)| r.code == CloseoutCode::NoData)
        .count();

    if succeeded == total {
        return CloseoutResult::success();
    }
    if succeeded > 0 {
        let failed = total - succeeded;
        return CloseoutResult::success_with_warning(format!("{failed} / {total} jobs failed"));
    }
    if no_data == total {
        return CloseoutResult::no_data(format!("none of the {total} jobs produced data"));
    }

    let failed_jobs: Vec<String> = results
        .iter()
        .filter(|(_, r)| r.is_failure())
        .map(|(job, _)| job.to_string())
        .collect();
    CloseoutResult::failed(
        FailureCategory::RuntimeFailure,
        format!("no job succeeded (failed: {})", failed_jobs.join(", ")),
    )
}
