//! Tool integrations.
//!
//! Each external tool is a strategy object: it names its inputs, builds the
//! `RunRequest`, supplies its console grammar and output descriptor, and
//! post-processes what the tool wrote. The state machine is the same for
//! every tool.

pub mod ascore;
pub mod formularity;
pub mod icr2ls;

use crate::collaborators::SpectraKind;
use crate::context::JobContext;
use crate::postprocess::PostProcessError;
use crate::runner::DEFAULT_ARGS_FILE_SWITCH;
use harness_core::markers::MarkerError;
use harness_core::{
    CloseoutResult, Config, FailureCategory, MarkerTable, ResumePoint, ResumeScanner, RunRequest,
    UnitLabels,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use ascore::AScore;
pub use formularity::Formularity;
pub use icr2ls::Icr2ls;

/// Why a job cannot start. Reported as a closeout, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationFailure {
    #[error("missing required parameter: {0}")]
    MissingParameter(String),
    #[error("invalid value for {name}: {value}")]
    InvalidParameter { name: String, value: String },
    #[error("unsupported search type: {0}")]
    UnsupportedSearchType(String),
    #[error("parameter file not found: {0}")]
    ParamFileMissing(String),
    #[error("input file not found: {0}")]
    InputMissing(String),
    #[error("checkpoint already covers unit {last_completed}, past the end of the range at {end}")]
    RangeExhausted { last_completed: u64, end: u64 },
}

impl ValidationFailure {
    pub fn closeout(&self) -> CloseoutResult {
        match self {
            Self::ParamFileMissing(_) => CloseoutResult::param_file_missing(self.to_string()),
            Self::InputMissing(_) => CloseoutResult::file_not_found(self.to_string()),
            _ => CloseoutResult::failed(FailureCategory::ValidationFailure, self.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum IntegrationError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error(transparent)]
    Markers(#[from] MarkerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// Retrieved from the parameter-file directory.
    ParamFile,
    /// Retrieved from the dataset's input directory.
    DataFile,
}

/// A file that must be in the working directory before launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredInput {
    pub name: String,
    pub kind: InputKind,
}

impl RequiredInput {
    pub fn param_file(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: InputKind::ParamFile,
        }
    }

    pub fn data_file(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: InputKind::DataFile,
        }
    }

    pub fn missing(&self) -> ValidationFailure {
        match self.kind {
            InputKind::ParamFile => ValidationFailure::ParamFileMissing(self.name.clone()),
            InputKind::DataFile => ValidationFailure::InputMissing(self.name.clone()),
        }
    }
}

/// A status file the tool rewrites in place, with its own grammar.
#[derive(Debug, Clone)]
pub struct StatusSource {
    pub path: PathBuf,
    pub markers: MarkerTable,
}

pub trait Integration: Send + Sync {
    fn name(&self) -> &'static str;

    /// Parameter checks beyond input presence.
    fn validate(&self, _ctx: &JobContext) -> Result<(), ValidationFailure> {
        Ok(())
    }

    fn spectra_kind(&self) -> Option<SpectraKind> {
        None
    }

    fn required_inputs(&self, ctx: &JobContext) -> Result<Vec<RequiredInput>, ValidationFailure>;

    /// Build the invocation, narrowed to start after `resume` when given.
    fn build_request(
        &self,
        ctx: &JobContext,
        resume: Option<&ResumePoint>,
    ) -> Result<RunRequest, ValidationFailure>;

    fn console_markers(&self) -> &MarkerTable;

    fn status_source(&self, _ctx: &JobContext) -> Option<StatusSource> {
        None
    }

    /// Local result file worth checkpointing while the tool runs.
    fn checkpoint_file(&self, _ctx: &JobContext) -> Option<PathBuf> {
        None
    }

    fn resume_scanner(&self) -> Option<ResumeScanner> {
        None
    }

    /// Tool-specific poll interval; clamped by the caller.
    fn poll_interval(&self) -> Option<Duration> {
        None
    }

    fn args_file_switch(&self) -> &str {
        DEFAULT_ARGS_FILE_SWITCH
    }

    fn unit_labels(&self) -> UnitLabels {
        UnitLabels::default()
    }

    fn accepts_exit_code(&self, code: i32) -> bool {
        code == 0
    }

    /// Rename and reshape raw output. Returns the result manifest.
    fn post_process(
        &self,
        ctx: &JobContext,
        request: &RunRequest,
    ) -> Result<Vec<PathBuf>, PostProcessError>;

    /// Tab-separated result table for data-package concatenation.
    fn result_table(&self, _ctx: &JobContext) -> Option<PathBuf> {
        None
    }
}

pub const TOOL_NAMES: [&str; 3] = [icr2ls::NAME, formularity::NAME, ascore::NAME];

/// Build the integration for a tool name, with executables from `config`.
pub fn from_name(name: &str, config: &Config) -> Result<Arc<dyn Integration>, IntegrationError> {
    let integration: Arc<dyn Integration> = match name.to_ascii_lowercase().as_str() {
        icr2ls::NAME | "icr-2ls" => Arc::new(Icr2ls::new(config.icr2ls_path.clone())?),
        formularity::NAME | "cia" => Arc::new(Formularity::new(config.formularity_path.clone())?),
        ascore::NAME => Arc::new(AScore::new(config.ascore_path.clone())?),
        _ => return Err(IntegrationError::UnknownTool(name.to_string())),
    };
    Ok(integration)
}
