//! Result-table concatenation for data-package runs.
//!
//! Each sub-job writes a tab-separated table with one header row. The combined
//! table carries exactly one header row; if the first table does not already
//! lead with a `Job` column, one is synthesized and every data row is prefixed
//! with its sub-job id.

use crate::artifacts::{self, FsError};
use regex::Regex;
use std::fmt::Write as _;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

/// Name of the synthesized sub-job column.
pub const JOB_COLUMN: &str = "Job";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Write(#[from] FsError),
    #[error("no result files to concatenate")]
    NoInputs,
    #[error("no result file had a header row")]
    NoHeader,
}

pub type Result<T> = std::result::Result<T, ReportError>;

/// One sub-job's result table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubJobFile {
    pub job: u32,
    pub path: PathBuf,
}

impl SubJobFile {
    pub fn new(job: u32, path: impl Into<PathBuf>) -> Self {
        Self {
            job,
            path: path.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcatSummary {
    /// Files that contributed a header or rows.
    pub files: usize,
    /// Data rows written (header excluded).
    pub rows: usize,
    pub job_column_synthesized: bool,
    pub header: String,
}

/// Whether a header row already leads with a sub-job column.
pub fn has_job_column(header: &str) -> bool {
    header
        .split('\t')
        .next()
        .is_some_and(|first| first.trim().eq_ignore_ascii_case(JOB_COLUMN))
}

/// Concatenate sub-job tables into `output`.
///
/// The first file with a header decides the layout; header rows of later
/// files are skipped. Blank lines are dropped. The output is written
/// atomically.
pub fn concatenate_results(inputs: &[SubJobFile], output: &Path) -> Result<ConcatSummary> {
    if inputs.is_empty() {
        return Err(ReportError::NoInputs);
    }

    let mut body = String::new();
    let mut header: Option<String> = None;
    let mut synthesize = false;
    let mut files = 0;
    let mut rows = 0;

    for input in inputs {
        let file = fs::File::open(&input.path).map_err(|source| ReportError::Read {
            path: input.path.clone(),
            source,
        })?;
        let mut lines = BufReader::new(file).lines();
        let mut file_header: Option<String> = None;
        let mut contributed = false;

        while let Some(line) = lines.next().transpose().map_err(|source| ReportError::Read {
            path: input.path.clone(),
            source,
        })? {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            if file_header.is_none() {
                file_header = Some(line.to_string());
                contributed = true;
                if header.is_none() {
                    synthesize = !has_job_column(line);
                    let combined = if synthesize {
                        format!("{JOB_COLUMN}\t{line}")
                    } else {
                        line.to_string()
                    };
                    let _ = writeln!(body, "{combined}");
                    header = Some(combined);
                }
                continue;
            }

            if synthesize {
                let _ = writeln!(body, "{}\t{line}", input.job);
            } else {
                let _ = writeln!(body, "{line}");
            }
            rows += 1;
        }

        if contributed {
            files += 1;
        }
    }

    let header = header.ok_or(ReportError::NoHeader)?;
    artifacts::write_atomic(output, body.as_bytes())?;

    Ok(ConcatSummary {
        files,
        rows,
        job_column_synthesized: synthesize,
        header,
    })
}

fn job_prefix() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(?i:job)?(\d+)_").expect("valid job prefix pattern"))
}

/// Find `<job>_...<suffix>` (or `Job<job>_...<suffix>`) files in `dir`,
/// sorted by job number. Files without a leading job number are skipped.
pub fn collect_by_suffix(dir: &Path, suffix: &str) -> Result<Vec<SubJobFile>> {
    let entries = fs::read_dir(dir).map_err(|source| ReportError::Read {
        path: dir.to_path_buf(),
        source,
    })?;
    let suffix = suffix.to_ascii_lowercase();
    let mut found = Vec::new();

    for entry in entries.filter_map(std::result::Result::ok) {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.to_ascii_lowercase().ends_with(&suffix) {
            continue;
        }
        let Some(job) = job_prefix()
            .captures(&name)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
        else {
            continue;
        };
        found.push(SubJobFile::new(job, path));
    }

    found.sort_by(|a, b| a.job.cmp(&b.job).then_with(|| a.path.cmp(&b.path)));
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_table(dir: &Path, name: &str, header: &str, rows: usize) -> PathBuf {
        let path = dir.join(name);
        let mut content = format!("{header}\n");
        for i in 0..rows {
            content.push_str(&format!("{}\tPEPTIDE{i}\t0.{i}\n", i + 1));
        }
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn three_tables_get_one_header_and_job_prefix() {
        let dir = TempDir::new().unwrap();
        let header = "Scan\tPeptide\tScore";
        let inputs: Vec<SubJobFile> = [101, 102, 103]
            .into_iter()
            .map(|job| {
                let path = write_table(dir.path(), &format!("{job}_syn_ascore.txt"), header, 5);
                SubJobFile::new(job, path)
            })
            .collect();
        let output = dir.path().join("combined.txt");

        let summary = concatenate_results(&inputs, &output).unwrap();
        assert_eq!(summary.rows, 15);
        assert_eq!(summary.files, 3);
        assert!(summary.job_column_synthesized);

        let content = fs::read_to_string(&output).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 16);
        assert_eq!(lines[0], "Job\tScan\tPeptide\tScore");
        assert_eq!(lines.iter().filter(|l| l.contains("Peptide\t")).count(), 1);
        assert_eq!(lines[1], "101\t1\tPEPTIDE0\t0.0");
        assert_eq!(lines[15], "103\t5\tPEPTIDE4\t0.4");
        for line in &lines {
            assert_eq!(line.split('\t').count(), 4, "misaligned row: {line}");
        }
    }

    #[test]
    fn existing_job_column_is_preserved() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("combined_in.txt");
        fs::write(&path, "Job\tScan\tScore\n555\t1\t0.5\n555\t2\t0.7\n").unwrap();
        let output = dir.path().join("combined.txt");

        let summary = concatenate_results(&[SubJobFile::new(555, &path)], &output).unwrap();
        assert!(!summary.job_column_synthesized);
        assert_eq!(summary.rows, 2);
        assert_eq!(
            fs::read_to_string(&output).unwrap(),
            "Job\tScan\tScore\n555\t1\t0.5\n555\t2\t0.7\n"
        );
    }

    #[test]
    fn blank_lines_and_crlf_are_normalized() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("1_a.txt");
        let b = dir.path().join("2_b.txt");
        fs::write(&a, "Scan\tScore\r\n1\t0.1\r\n\r\n").unwrap();
        fs::write(&b, "\nScan\tScore\n2\t0.2\n").unwrap();
        let output = dir.path().join("out.txt");

        concatenate_results(&[SubJobFile::new(1, a), SubJobFile::new(2, b)], &output).unwrap();
        assert_eq!(
            fs::read_to_string(&output).unwrap(),
            "Job\tScan\tScore\n1\t1\t0.1\n2\t2\t0.2\n"
        );
    }

    #[test]
    fn empty_files_are_skipped() {
        let dir = TempDir::new().unwrap();
        let empty = dir.path().join("1_empty.txt");
        fs::write(&empty, "").unwrap();
        let full = write_table(dir.path(), "2_full.txt", "Scan\tPeptide\tScore", 2);
        let output = dir.path().join("out.txt");

        let summary =
            concatenate_results(&[SubJobFile::new(1, empty), SubJobFile::new(2, full)], &output)
                .unwrap();
        assert_eq!(summary.files, 1);
        assert_eq!(summary.rows, 2);
    }

    #[test]
    fn no_inputs_or_headers_is_an_error() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("out.txt");
        assert!(matches!(
            concatenate_results(&[], &output),
            Err(ReportError::NoInputs)
        ));

        let empty = dir.path().join("1_empty.txt");
        fs::write(&empty, "\n\n").unwrap();
        assert!(matches!(
            concatenate_results(&[SubJobFile::new(1, empty)], &output),
            Err(ReportError::NoHeader)
        ));
        assert!(!output.exists());
    }

    #[test]
    fn collect_by_suffix_sorts_by_job() {
        let dir = TempDir::new().unwrap();
        for name in [
            "300_DatasetC_ascore.txt",
            "Job100_DatasetA_ascore.txt",
            "200_DatasetB_ASCORE.TXT",
            "DatasetD_ascore.txt",
            "400_DatasetE_syn.txt",
        ] {
            fs::write(dir.path().join(name), "x\n").unwrap();
        }

        let found = collect_by_suffix(dir.path(), "_ascore.txt").unwrap();
        let jobs: Vec<u32> = found.iter().map(|f| f.job).collect();
        assert_eq!(jobs, vec![100, 200, 300]);
    }

    #[test]
    fn job_column_detection_is_case_insensitive() {
        assert!(has_job_column("job\tScan"));
        assert!(has_job_column("Job"));
        assert!(!has_job_column("Scan\tJob"));
        assert!(!has_job_column("JobID\tScan"));
    }
}
