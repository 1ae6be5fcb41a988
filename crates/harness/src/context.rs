//! Per-job execution context.
//!
//! Built once per job step and passed to every integration call. Holds the
//! job identity, directories and tool parameters; there is no process-wide
//! job state.

use crate::integrations::ValidationFailure;
use harness_core::{Config, JobKey};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One constituent job of a data package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubJob {
    pub job: u32,
    pub dataset: String,
}

impl SubJob {
    pub fn new(job: u32, dataset: impl Into<String>) -> Self {
        Self {
            job,
            dataset: dataset.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobContext {
    pub key: JobKey,
    /// Exclusive to this run.
    pub working_dir: PathBuf,
    /// Datasets live in `<source_root>/<dataset>/`.
    pub source_root: PathBuf,
    pub param_source_dir: PathBuf,
    pub param_file: Option<String>,
    pub params: BTreeMap<String, String>,
    pub sub_jobs: Vec<SubJob>,
}

impl JobContext {
    /// Relative directories are made absolute against the current directory:
    /// tools run inside `working_dir` and get these paths as arguments.
    pub fn new(key: JobKey, working_dir: impl Into<PathBuf>, source_root: impl Into<PathBuf>) -> Self {
        let source_root = absolute(source_root.into());
        Self {
            key,
            working_dir: absolute(working_dir.into()),
            param_source_dir: source_root.clone(),
            source_root,
            param_file: None,
            params: BTreeMap::new(),
            sub_jobs: Vec::new(),
        }
    }

    /// Working directory `<work_dir>/<dataset>/Job<job>_Step<step>`.
    pub fn from_config(key: JobKey, config: &Config) -> Self {
        let working_dir = config.work_dir.join(key.relative_dir());
        Self::new(key, working_dir, config.source_dir.clone())
    }

    pub fn with_param_file(mut self, name: impl Into<String>) -> Self {
        self.param_file = Some(name.into());
        self
    }

    pub fn with_param_source_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.param_source_dir = absolute(dir.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_sub_jobs(mut self, sub_jobs: Vec<SubJob>) -> Self {
        self.sub_jobs = sub_jobs;
        self
    }

    pub fn dataset(&self) -> &str {
        &self.key.dataset
    }

    pub fn input_dir(&self) -> PathBuf {
        self.source_root.join(&self.key.dataset)
    }

    pub fn working_file(&self, name: &str) -> PathBuf {
        self.working_dir.join(name)
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn require_param(&self, name: &str) -> Result<&str, ValidationFailure> {
        self.param(name)
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| ValidationFailure::MissingParameter(name.to_string()))
    }

    /// Integer parameter; absent means `None`.
    pub fn param_u64(&self, name: &str) -> Result<Option<u64>, ValidationFailure> {
        self.param(name)
            .map(|value| {
                value.trim().parse().map_err(|_| ValidationFailure::InvalidParameter {
                    name: name.to_string(),
                    value: value.to_string(),
                })
            })
            .transpose()
    }

    /// Parameter file name; required by every tool.
    pub fn require_param_file(&self) -> Result<&str, ValidationFailure> {
        self.param_file
            .as_deref()
            .ok_or_else(|| ValidationFailure::MissingParameter("param_file".to_string()))
    }

    /// Context for one sub-job: its own dataset and a `Job<job>` subdirectory.
    pub fn for_sub_job(&self, sub: &SubJob) -> Self {
        Self {
            key: JobKey::new(sub.dataset.clone(), sub.job, self.key.step),
            working_dir: self.working_dir.join(format!("Job{}", sub.job)),
            source_root: self.source_root.clone(),
            param_source_dir: self.param_source_dir.clone(),
            param_file: self.param_file.clone(),
            params: self.params.clone(),
            sub_jobs: Vec::new(),
        }
    }

    pub fn is_data_package(&self) -> bool {
        !self.sub_jobs.is_empty()
    }
}

/// Parse `JOB` or `JOB:DATASET`; a bare job number reuses `default_dataset`.
pub fn parse_sub_job(spec: &str, default_dataset: &str) -> Option<SubJob> {
    let (job, dataset) = match spec.split_once(':') {
        Some((job, dataset)) if !dataset.trim().is_empty() => (job, dataset.trim()),
        Some(_) => return None,
        None => (spec, default_dataset),
    };
    job.trim().parse().ok().map(|job| SubJob::new(job, dataset))
}

fn absolute(path: PathBuf) -> PathBuf {
    std::path::absolute(&path).unwrap_or(path)
}

pub fn relative_to(path: &Path, base: &Path) -> PathBuf {
    path.strip_prefix(base)
        .map_or_else(|_| path.to_path_buf(), Path::to_path_buf)
}
